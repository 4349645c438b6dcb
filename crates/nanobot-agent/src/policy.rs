//! Per-turn tool exposure policy: keep exactly one preferred web tool in the
//! set handed to the model, so overlapping search/browse/MCP tools don't
//! compete.

use std::collections::HashSet;

use serde_json::Value;

use nanobot_core::types::{ChatMessage, Role};

const WEB_TOOLS: &[&str] = &["tavily", "browser", "mcp"];
const VALID_WEB_DEFAULT: &[&str] = &["tavily", "browser"];

const BROWSER_KEYWORDS: &[&str] = &[
    "网页", "页面", "渲染", "点击", "登录", "交互", "dom", "浏览器", "打开网站", "browser",
    "browse",
];

pub struct ToolPolicy {
    web_default: String,
    enable_mcp_fallback: bool,
    allow_explicit_mcp: bool,
}

impl ToolPolicy {
    pub fn new(web_default: &str, enable_mcp_fallback: bool, allow_explicit_mcp: bool) -> Self {
        let web_default = if VALID_WEB_DEFAULT.contains(&web_default) {
            web_default.to_string()
        } else {
            "tavily".to_string()
        };
        Self {
            web_default,
            enable_mcp_fallback,
            allow_explicit_mcp,
        }
    }

    /// Trim the exposed tool set for the next model call.
    /// Non-web tools always pass through unchanged.
    pub fn filter_tools(
        &self,
        messages: &[ChatMessage],
        tool_definitions: Vec<Value>,
        failed_tools: &HashSet<String>,
    ) -> Vec<Value> {
        if tool_definitions.is_empty() {
            return tool_definitions;
        }

        let latest_user = latest_user_text(messages).to_lowercase();
        let explicit_mcp = wants_mcp(&latest_user);
        let browser_needed = BROWSER_KEYWORDS.iter().any(|k| latest_user.contains(k));

        let web_present: HashSet<String> = tool_definitions
            .iter()
            .map(tool_name)
            .filter(|n| WEB_TOOLS.contains(&n.as_str()))
            .collect();
        if web_present.is_empty() {
            return tool_definitions;
        }

        let mut preferred = if browser_needed {
            "browser".to_string()
        } else {
            self.web_default.clone()
        };
        if failed_tools.contains(&preferred) {
            preferred = if preferred == "tavily" {
                "browser".to_string()
            } else {
                "tavily".to_string()
            };
        }

        let mut allow_web: HashSet<String> = HashSet::new();
        if web_present.contains(&preferred) {
            allow_web.insert(preferred);
        }

        let both_core_failed =
            failed_tools.contains("tavily") && failed_tools.contains("browser");
        let can_use_mcp = (self.allow_explicit_mcp && explicit_mcp)
            || (self.enable_mcp_fallback && both_core_failed);
        if can_use_mcp && web_present.contains("mcp") {
            allow_web.insert("mcp".to_string());
        }

        // If the chosen preferred tool is unavailable, keep available core options.
        if allow_web.is_empty() {
            for n in ["tavily", "browser"] {
                if web_present.contains(n) {
                    allow_web.insert(n.to_string());
                }
            }
            if web_present.contains("mcp") && self.allow_explicit_mcp && explicit_mcp {
                allow_web.insert("mcp".to_string());
            }
        }

        tool_definitions
            .into_iter()
            .filter(|td| {
                let name = tool_name(td);
                !WEB_TOOLS.contains(&name.as_str()) || allow_web.contains(&name)
            })
            .collect()
    }
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::new("tavily", true, true)
    }
}

fn tool_name(def: &Value) -> String {
    def.get("function")
        .and_then(|f| f.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn latest_user_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.text())
        .unwrap_or_default()
        .to_string()
}

fn wants_mcp(text: &str) -> bool {
    ["mcp", "model context protocol", "playwright mcp", "github mcp"]
        .iter()
        .any(|k| text.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(name: &str) -> Value {
        json!({"type": "function", "function": {"name": name, "description": "", "parameters": {}}})
    }

    fn names(defs: &[Value]) -> Vec<String> {
        defs.iter().map(tool_name).collect()
    }

    fn user(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user(text)]
    }

    fn all_web_defs() -> Vec<Value> {
        vec![def("tavily"), def("browser"), def("mcp"), def("read_file")]
    }

    #[test]
    fn default_keeps_only_tavily_among_web_tools() {
        let policy = ToolPolicy::default();
        let filtered = policy.filter_tools(&user("搜一下新闻"), all_web_defs(), &HashSet::new());
        let names = names(&filtered);
        assert!(names.contains(&"tavily".to_string()));
        assert!(!names.contains(&"browser".to_string()));
        assert!(!names.contains(&"mcp".to_string()));
        assert!(names.contains(&"read_file".to_string()));
    }

    #[test]
    fn page_interaction_switches_to_browser() {
        let policy = ToolPolicy::default();
        let filtered =
            policy.filter_tools(&user("帮我登录这个网页并点击按钮"), all_web_defs(), &HashSet::new());
        let names = names(&filtered);
        assert!(names.contains(&"browser".to_string()));
        assert!(!names.contains(&"tavily".to_string()));
    }

    #[test]
    fn failed_preferred_tool_flips_to_the_other_core_tool() {
        let policy = ToolPolicy::default();
        let failed: HashSet<String> = ["tavily".to_string()].into();
        let filtered = policy.filter_tools(&user("查一下天气"), all_web_defs(), &failed);
        let names = names(&filtered);
        assert!(names.contains(&"browser".to_string()));
        assert!(!names.contains(&"tavily".to_string()));
    }

    #[test]
    fn explicit_mcp_request_exposes_mcp() {
        let policy = ToolPolicy::default();
        let filtered =
            policy.filter_tools(&user("用 github mcp 查这个仓库"), all_web_defs(), &HashSet::new());
        assert!(names(&filtered).contains(&"mcp".to_string()));
    }

    #[test]
    fn both_core_failed_falls_back_to_mcp() {
        let policy = ToolPolicy::default();
        let failed: HashSet<String> =
            ["tavily".to_string(), "browser".to_string()].into();
        let filtered = policy.filter_tools(&user("继续查"), all_web_defs(), &failed);
        assert!(names(&filtered).contains(&"mcp".to_string()));
    }

    #[test]
    fn non_web_tools_always_pass_through() {
        let policy = ToolPolicy::default();
        let defs = vec![def("read_file"), def("cron")];
        let filtered = policy.filter_tools(&user("anything"), defs.clone(), &HashSet::new());
        assert_eq!(names(&filtered), names(&defs));
    }
}
