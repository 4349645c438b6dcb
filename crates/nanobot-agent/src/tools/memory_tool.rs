//! The `memory` tool: append to today's notes, search or read long-term
//! memory on demand (the system prompt only carries a teaser).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use nanobot_memory::MemoryStore;

use super::{Tool, ToolResult};

pub struct MemoryTool {
    memory: Arc<MemoryStore>,
}

impl MemoryTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryTool {
    fn name(&self) -> &str {
        "memory"
    }

    fn description(&self) -> &str {
        "读写本地记忆。Actions: append (今日笔记), search (检索长期记忆), read (读取长期记忆全文)。"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["append", "search", "read"],
                    "description": "Action to perform"
                },
                "content": {"type": "string", "description": "Content to append (for append)"},
                "query": {"type": "string", "description": "Search query (for search)"}
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: Value) -> ToolResult {
        let action = params["action"].as_str().unwrap_or_default();
        match action {
            "append" => {
                let content = params["content"].as_str().unwrap_or_default();
                if content.is_empty() {
                    return ToolResult::fail("Error: content is required for append");
                }
                match self.memory.append_today(content) {
                    Ok(()) => ToolResult::ok("Noted."),
                    Err(e) => ToolResult::fail(format!("Error: {e}")),
                }
            }
            "search" => {
                let query = params["query"].as_str().unwrap_or_default();
                if query.is_empty() {
                    return ToolResult::fail("Error: query is required for search");
                }
                let hits = self.memory.search(query, 5);
                if hits.is_empty() {
                    ToolResult::ok("No matching memories.")
                } else {
                    ToolResult::ok(hits.join("\n---\n"))
                }
            }
            "read" => ToolResult::ok(self.memory.read_long_term(None)),
            other => ToolResult::fail(format!("Unknown action: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_search_read_flow() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryStore::new(dir.path()));
        memory
            .write_long_term("# infra\n服务器部署在杭州机房，端口 8443。\n")
            .unwrap();
        let tool = MemoryTool::new(memory);

        let appended = tool
            .execute(json!({"action": "append", "content": "今天修复了网关重启问题"}))
            .await;
        assert!(appended.success);

        let found = tool
            .execute(json!({"action": "search", "query": "服务器 端口"}))
            .await;
        assert!(found.success);
        assert!(found.output.contains("8443"));

        let read = tool.execute(json!({"action": "read"})).await;
        assert!(read.output.contains("杭州"));
    }
}
