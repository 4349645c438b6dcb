use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use nanobot_providers::ToolDefinition;

use super::{DeliveryContext, Tool, ToolResult};

/// Name + description pair used by the truthfulness audit.
#[derive(Debug, Clone)]
pub struct ToolMeta {
    pub name: String,
    pub description: String,
}

/// Name → tool map. Registration is explicit wiring at composition time.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "tool registered");
        self.tools
            .write()
            .expect("tool registry poisoned")
            .insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("tool registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Wire-shaped definitions for the provider call, name-sorted for a
    /// stable prompt.
    pub fn definitions(&self) -> Vec<Value> {
        let tools = self.tools.read().expect("tool registry poisoned");
        let mut entries: Vec<(&String, &Arc<dyn Tool>)> = tools.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(_, tool)| {
                ToolDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters(),
                }
                .to_wire()
            })
            .collect()
    }

    pub fn metadata(&self) -> Vec<ToolMeta> {
        let tools = self.tools.read().expect("tool registry poisoned");
        let mut metas: Vec<ToolMeta> = tools
            .values()
            .map(|t| ToolMeta {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        metas
    }

    /// Push the delivery context into every registered tool.
    pub fn set_delivery_context(&self, ctx: &DeliveryContext) {
        let tools = self.tools.read().expect("tool registry poisoned");
        for tool in tools.values() {
            tool.set_context(ctx);
        }
    }

    /// Execute by name. An unknown name is a failed result, not a panic.
    pub async fn execute(&self, name: &str, params: Value) -> ToolResult {
        match self.get(name) {
            Some(tool) => tool.execute(params).await,
            None => ToolResult::fail(format!("Error: unknown tool '{name}'")),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }
        async fn execute(&self, params: Value) -> ToolResult {
            ToolResult::ok(params["text"].as_str().unwrap_or_default().to_string())
        }
    }

    #[tokio::test]
    async fn register_and_execute() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let result = registry.execute("echo", json!({"text": "hi"})).await;
        assert!(result.success);
        assert_eq!(result.output, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_fails_cleanly() {
        let registry = ToolRegistry::new();
        let result = registry.execute("nope", json!({})).await;
        assert!(!result.success);
        assert!(result.output.contains("unknown tool"));
    }

    #[test]
    fn definitions_use_function_shape() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0]["type"], "function");
        assert_eq!(defs[0]["function"]["name"], "echo");
        assert_eq!(defs[0]["function"]["parameters"]["type"], "object");
    }
}
