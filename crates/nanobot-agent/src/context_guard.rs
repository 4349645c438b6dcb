//! Context-window accounting: token estimation and the compaction decision.

use nanobot_core::types::ChatMessage;

/// Conservative limits for known model families.
const MODEL_LIMITS: &[(&str, usize)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("claude-3-opus", 200_000),
    ("claude-3-sonnet", 200_000),
    ("claude-3-haiku", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("gemini-1.5-pro", 1_000_000),
    ("gemini-1.5-flash", 1_000_000),
    ("gemini-pro", 30_720),
    ("deepseek-chat", 32_768),
    ("deepseek-coder", 32_768),
];

const DEFAULT_LIMIT: usize = 8_192;
const COMPACT_THRESHOLD: f64 = 0.85;

/// Character-based token estimation. A mixed Chinese/English corpus averages
/// out near 2.5 chars per token, which is close enough for a guard rail.
pub struct TokenCounter;

impl TokenCounter {
    pub fn count_text(text: &str) -> usize {
        (text.chars().count() as f64 / 2.5) as usize
    }

    pub fn count_messages(messages: &[ChatMessage]) -> usize {
        let encoded = serde_json::to_string(messages).unwrap_or_default();
        Self::count_text(&encoded)
    }
}

#[derive(Debug, Clone)]
pub struct ContextEvaluation {
    pub usage: usize,
    pub limit: usize,
    pub is_safe: bool,
    pub should_compact: bool,
    pub utilization: f64,
}

/// Guards the context window size against the active model's limit.
pub struct ContextGuard {
    limit: usize,
}

impl ContextGuard {
    /// An explicit limit wins; otherwise fuzzy-match the model name against
    /// the limit table, defaulting conservatively.
    pub fn new(model: Option<&str>, limit: Option<usize>) -> Self {
        if let Some(limit) = limit {
            return Self { limit };
        }
        let limit = model
            .map(|m| {
                let lower = m.to_lowercase();
                MODEL_LIMITS
                    .iter()
                    .find(|(key, _)| lower.contains(key))
                    .map(|(_, v)| *v)
                    .unwrap_or(DEFAULT_LIMIT)
            })
            .unwrap_or(DEFAULT_LIMIT);
        Self { limit }
    }

    pub fn for_model(model: &str) -> Self {
        Self::new(Some(model), None)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn evaluate(&self, messages: &[ChatMessage]) -> ContextEvaluation {
        let usage = TokenCounter::count_messages(messages);
        ContextEvaluation {
            usage,
            limit: self.limit,
            is_safe: usage < self.limit,
            should_compact: usage as f64 > self.limit as f64 * COMPACT_THRESHOLD,
            utilization: usage as f64 / self.limit as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_limits_fuzzy_match() {
        assert_eq!(ContextGuard::for_model("gpt-4o-2024-08-06").limit(), 128_000);
        assert_eq!(ContextGuard::for_model("deepseek-chat").limit(), 32_768);
        assert_eq!(ContextGuard::for_model("totally-unknown").limit(), DEFAULT_LIMIT);
    }

    #[test]
    fn explicit_limit_wins() {
        assert_eq!(ContextGuard::new(Some("gpt-4o"), Some(1000)).limit(), 1000);
    }

    #[test]
    fn evaluation_flags_compaction_past_threshold() {
        let guard = ContextGuard::new(None, Some(100));
        let small = vec![ChatMessage::user("hi")];
        let eval = guard.evaluate(&small);
        assert!(eval.is_safe);
        assert!(!eval.should_compact);

        let big = vec![ChatMessage::user("x".repeat(1000))];
        let eval = guard.evaluate(&big);
        assert!(!eval.is_safe);
        assert!(eval.should_compact);
        assert!(eval.utilization > 1.0);
    }

    #[test]
    fn token_estimate_tracks_length() {
        let short = TokenCounter::count_text("hello");
        let long = TokenCounter::count_text(&"hello ".repeat(100));
        assert!(long > short * 50);
    }
}
