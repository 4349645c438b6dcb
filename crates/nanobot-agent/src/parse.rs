//! Recover tool calls from plain assistant text when the model skipped the
//! formal API: scan fenced code blocks (then bare JSON), stream-decode values,
//! and accept only objects naming a registered tool.

use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use nanobot_providers::ToolCallRequest;

use crate::tools::ToolRegistry;

pub struct TextCallParser {
    registry: Arc<ToolRegistry>,
    fenced: Regex,
    bare_object: Regex,
}

impl TextCallParser {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            fenced: Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("static regex"),
            bare_object: Regex::new(r"(?s)\{.*?\}").expect("static regex"),
        }
    }

    pub fn parse(&self, text: &str) -> Vec<ToolCallRequest> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut blocks: Vec<String> = self
            .fenced
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect();

        if blocks.is_empty() {
            let stripped = text.trim();
            if stripped.starts_with('{') || stripped.starts_with('[') {
                blocks.push(stripped.to_string());
            }
        }
        if blocks.is_empty() {
            blocks = self
                .bare_object
                .find_iter(text)
                .map(|m| m.as_str().to_string())
                .collect();
        }

        debug!(blocks = blocks.len(), "scanning text for tool calls");

        let mut results = Vec::new();
        for block in blocks {
            self.scan_block(block.trim(), &mut results);
        }
        if !results.is_empty() {
            debug!(count = results.len(), "parsed tool calls from text content");
        }
        results
    }

    /// Stream-decode JSON values out of a block, restarting after each parsed
    /// value and skipping junk between them.
    fn scan_block(&self, block: &str, results: &mut Vec<ToolCallRequest>) {
        let bytes = block.as_bytes();
        let mut pos = 0;
        while pos < bytes.len() {
            while pos < bytes.len() && bytes[pos] != b'{' && bytes[pos] != b'[' {
                pos += 1;
            }
            if pos >= bytes.len() {
                break;
            }

            let mut stream =
                serde_json::Deserializer::from_str(&block[pos..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => {
                    let consumed = stream.byte_offset();
                    pos += consumed.max(1);
                    match value {
                        Value::Array(items) => {
                            for item in items {
                                self.accept(item, results);
                            }
                        }
                        other => self.accept(other, results),
                    }
                }
                _ => {
                    // Not valid JSON here; step past the opener and retry.
                    pos += 1;
                }
            }
        }
    }

    /// Accept `{"name": <registered tool>, "arguments": {…}}` and nothing else.
    fn accept(&self, value: Value, results: &mut Vec<ToolCallRequest>) {
        let Value::Object(map) = value else {
            return;
        };
        let Some(name) = map.get("name").and_then(Value::as_str) else {
            return;
        };
        let Some(arguments) = map.get("arguments").filter(|a| a.is_object()) else {
            return;
        };
        if !self.registry.contains(name) {
            return;
        }
        let id = format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        results.push(ToolCallRequest {
            id,
            name: name.to_string(),
            arguments: arguments.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ToolResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct Dummy(&'static str);

    #[async_trait]
    impl Tool for Dummy {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            ""
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _params: Value) -> ToolResult {
            ToolResult::ok("")
        }
    }

    fn parser() -> TextCallParser {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(Dummy("list_dir")));
        registry.register(Arc::new(Dummy("read_file")));
        TextCallParser::new(registry)
    }

    #[test]
    fn parses_fenced_json_block() {
        let calls = parser().parse(
            "我来看看目录：\n```json\n{\"name\": \"list_dir\", \"arguments\": {\"path\": \".\"}}\n```",
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list_dir");
        assert_eq!(calls[0].arguments["path"], ".");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn parses_array_of_calls() {
        let calls = parser().parse(
            r#"[{"name": "list_dir", "arguments": {}}, {"name": "read_file", "arguments": {"path": "a"}}]"#,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "read_file");
    }

    #[test]
    fn rejects_unregistered_tools_and_bad_shapes() {
        let p = parser();
        assert!(p.parse(r#"{"name": "rm_rf", "arguments": {}}"#).is_empty());
        assert!(p.parse(r#"{"name": "list_dir", "arguments": "oops"}"#).is_empty());
        assert!(p.parse(r#"{"tool": "list_dir"}"#).is_empty());
    }

    #[test]
    fn recovers_multiple_values_with_junk_between() {
        let calls = parser().parse(
            "```\n{\"name\": \"list_dir\", \"arguments\": {}} 然后 {\"name\": \"read_file\", \"arguments\": {\"path\": \"b\"}}\n```",
        );
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn plain_prose_yields_nothing() {
        assert!(parser().parse("今天天气不错，没有任何 JSON。").is_empty());
    }
}
