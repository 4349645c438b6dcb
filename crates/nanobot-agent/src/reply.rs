//! Reply post-processing shared by both turn services.

use regex::Regex;

use nanobot_core::types::SILENT_REPLY_TOKEN;

/// Strip `<think>…</think>` blocks, including an unclosed trailing leak.
/// If nothing survives, substitute a safe completion notice; hidden
/// reasoning must never reach a channel.
pub fn filter_reasoning(content: &str) -> String {
    if content.is_empty() {
        return content.to_string();
    }
    let closed = Regex::new(r"(?s)<think>.*?</think>").expect("static regex");
    let unclosed = Regex::new(r"(?s)<think>.*$").expect("static regex");
    let filtered = closed.replace_all(content, "");
    let filtered = unclosed.replace_all(&filtered, "");
    let filtered = filtered.trim();
    if filtered.is_empty() {
        return "我已完成处理。".to_string();
    }
    filtered.to_string()
}

/// Whether the model asked for no outbound message this turn.
pub fn is_silent_reply(content: &str) -> bool {
    content.trim() == SILENT_REPLY_TOKEN
}
