//! Prompt assembly: identity, bootstrap files, profile summary, memory
//! teaser, and skills, plus the message-list helpers the turn engine uses.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use regex::Regex;
use serde_json::{json, Value};

use nanobot_core::config::BrainConfig;
use nanobot_core::types::{ChatMessage, MessageContent, SILENT_REPLY_TOKEN};
use nanobot_memory::MemoryStore;

use crate::skills::SkillsLoader;

const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "USER.md", "TOOLS.md"];
const PROFILE_FILE: &str = "PROFILE.md";

/// Stable profile fields injected every turn; everything else stays in files.
const PROFILE_SUMMARY_FIELDS: &[&str] = &["常用称呼", "时区", "主要语言", "回复风格"];

pub struct ContextBuilder {
    workspace: PathBuf,
    model: String,
    brain: BrainConfig,
    memory: Arc<MemoryStore>,
    skills: SkillsLoader,
    tz: chrono_tz::Tz,
    profile_line: Regex,
}

impl ContextBuilder {
    pub fn new(workspace: &Path, model: &str, brain: BrainConfig, memory: Arc<MemoryStore>) -> Self {
        let tz: chrono_tz::Tz = brain
            .timezone
            .parse()
            .unwrap_or(chrono_tz::Asia::Shanghai);
        Self {
            workspace: workspace.to_path_buf(),
            model: model.to_string(),
            brain,
            memory,
            skills: SkillsLoader::new(workspace),
            tz,
            profile_line: Regex::new(r"^\s*-\s*([^:：]+)\s*[：:]\s*(.*)$").expect("static regex"),
        }
    }

    /// Assemble the system prompt. With a `query`, memory retrieval runs in
    /// RAG mode; otherwise a teaser is injected.
    pub fn build_system_prompt(&self, query: Option<&str>) -> String {
        let mut parts = vec![self.identity()];

        let bootstrap = self.load_bootstrap_files();
        if !bootstrap.is_empty() {
            parts.push(bootstrap);
        }

        let profile = self.profile_summary();
        if !profile.is_empty() {
            parts.push(profile);
        }

        let memory = self.memory.memory_context(query);
        if !memory.is_empty() {
            let teaser: String = memory.chars().take(1000).collect();
            parts.push(format!(
                "# 长期记忆 (Memory)\n\n\
                 你拥有本地记忆系统。为了保持上下文精简，下方仅展示摘要。\n\
                 如果你需要更多细节或特定事实，请使用 `memory` 工具进行 `action=\"search\"` 或 `action=\"read\"`。\n\n\
                 ## 摘要/最近条目\n{teaser}... (使用 `memory` 工具查看更多)"
            ));
        }

        let always = self.skills.always_skills();
        if !always.is_empty() {
            let contents: Vec<String> = always
                .iter()
                .filter_map(|s| {
                    self.skills
                        .load_content(&s.name)
                        .map(|c| format!("## {}\n\n{}", s.name, c))
                })
                .collect();
            if !contents.is_empty() {
                parts.push(format!("# 已激活技能 (Active Skills)\n\n{}", contents.join("\n\n")));
            }
        }

        let skill_index = self.skills.summary();
        if !skill_index.is_empty() {
            parts.push(format!(
                "# 可用技能 (Skills)\n\n\
                 如果你需要使用以下技能，请先使用 `read_file` 读取对应的 `SKILL.md` 文件了解具体用法。\n\n\
                 {skill_index}"
            ));
        }

        parts.join("\n\n---\n\n")
    }

    /// Identity block: `IDENTITY.md` template with runtime substitutions, or
    /// a built-in fallback.
    fn identity(&self) -> String {
        let profile = self.profile_map();
        let user_title = profile
            .get("常用称呼")
            .cloned()
            .unwrap_or_else(|| "用户".to_string());
        let now = chrono::Utc::now()
            .with_timezone(&self.tz)
            .format("%Y-%m-%d %H:%M (%A)")
            .to_string();
        let runtime = format!("{} {}", std::env::consts::OS, std::env::consts::ARCH);
        let workspace_path = self.workspace.display().to_string();

        let gmail_status = service_status(tool_config_exists("gmail_config.json"));
        let github_status = service_status(
            tool_config_exists("github_config.json") || std::env::var("GITHUB_TOKEN").is_ok(),
        );
        let kb_status = knowledge_status();

        let web_line = "- **Web**: 默认优先 `tavily` 做联网检索；仅在需要真实页面渲染/交互/登录态时使用 `browser`。两者可互相回退。";
        let reasoning_prompt = self.reasoning_prompt();

        let identity_path = self.workspace.join("IDENTITY.md");
        if let Ok(template) = std::fs::read_to_string(&identity_path) {
            return template
                .replace("{user_title}", &user_title)
                .replace("{now}", &now)
                .replace("{runtime}", &runtime)
                .replace("{model}", &self.model)
                .replace("{workspace_path}", &workspace_path)
                .replace("{gmail_status}", &gmail_status)
                .replace("{github_status}", &github_status)
                .replace("{kb_status}", &kb_status)
                .replace("{web_line}", web_line)
                .replace("{reasoning_prompt}", &reasoning_prompt)
                .replace("{SILENT_REPLY_TOKEN}", SILENT_REPLY_TOKEN);
        }

        format!(
            "# Nanobot 核心身份\n\n\
             - 用户称呼: {user_title}\n\
             - 当前时间: {now}\n\
             - 运行环境: {runtime}\n\
             - 当前模型: {model}\n\
             - 工作区: {workspace_path}\n\
             - Gmail:{gmail_status}\n\
             - GitHub:{github_status}\n\
             - 知识库:{kb_status}\n\
             {web_line}\n\
             {reasoning_prompt}",
            model = self.model,
        )
    }

    /// The `<think>` format instruction, suppressed for models that natively
    /// reason (they already use a hidden channel) or when disabled in config.
    fn reasoning_prompt(&self) -> String {
        if !self.brain.reasoning || is_reasoning_model(&self.model) {
            return String::new();
        }
        "\n### 思考格式\n\
         你可以使用内部思考来规划复杂任务或分析问题。\n\
         所有内部思考必须放在 <think>...</think> 标签中。\n\
         格式：\n\
         <think>\n\
         [对用户请求、执行计划与安全边界的内部思考]\n\
         </think>\n\
         [对用户可见的回复或工具调用]\n\n\
         只有 <think> 标签外的内容会发送给用户。\n"
            .to_string()
    }

    /// Parse `PROFILE.md` bullets into a key→value map.
    fn profile_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        let Ok(text) = std::fs::read_to_string(self.workspace.join(PROFILE_FILE)) else {
            return map;
        };
        for line in text.lines() {
            if let Some(caps) = self.profile_line.captures(line) {
                map.insert(caps[1].trim().to_string(), caps[2].trim().to_string());
            }
        }
        map
    }

    /// Minimal-injection profile summary with `<EMPTY>` markers for gaps.
    fn profile_summary(&self) -> String {
        let profile = self.profile_map();
        if profile.is_empty() {
            return String::new();
        }
        let mut lines = vec!["# 用户画像摘要（最小注入）".to_string()];
        let mut missing = Vec::new();
        for field in PROFILE_SUMMARY_FIELDS {
            match profile.get(*field).filter(|v| !v.is_empty()) {
                Some(v) => lines.push(format!("- {field}: {v}")),
                None => {
                    lines.push(format!("- {field}: <EMPTY>"));
                    missing.push(*field);
                }
            }
        }
        lines.push("- 规则: 仅在任务需要这些字段时才向用户补全；不要在每轮对话都主动追问。".to_string());
        if !missing.is_empty() {
            lines.push(format!("- 当前待补全字段: {}", missing.join(", ")));
        }
        lines.join("\n")
    }

    fn load_bootstrap_files(&self) -> String {
        let mut parts = Vec::new();
        for filename in BOOTSTRAP_FILES {
            if let Ok(content) = std::fs::read_to_string(self.workspace.join(filename)) {
                parts.push(format!("## {filename}\n\n{content}"));
            }
        }
        parts.join("\n\n")
    }

    /// Build the full message list for a turn: system prompt, timestamped
    /// history, and the new user message (with media parts when present).
    pub fn build_messages(
        &self,
        history: &[ChatMessage],
        current_message: &str,
        media: Option<&[PathBuf]>,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(
            self.build_system_prompt(Some(current_message)),
        ));

        for m in history {
            let mut replayed = m.clone();
            if let (Some(ts), Some(text)) = (&m.timestamp, m.text()) {
                if !text.starts_with('[') {
                    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(ts) {
                        let tag = parsed.with_timezone(&self.tz).format("[%H:%M]");
                        replayed.content = MessageContent::Text(format!("{tag} {text}"));
                    }
                }
            }
            replayed.timestamp = None;
            messages.push(replayed);
        }

        messages.push(ChatMessage::user(build_user_content(current_message, media)));
        messages
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn timezone(&self) -> &chrono_tz::Tz {
        &self.tz
    }
}

/// Append the assistant message carrying this round's raw tool-call array.
/// Some providers reject empty content alongside tool calls; use a space.
pub fn add_assistant_message(
    messages: &mut Vec<ChatMessage>,
    content: Option<String>,
    tool_calls: Vec<Value>,
) {
    let mut text = content.unwrap_or_default();
    if !tool_calls.is_empty() && text.is_empty() {
        text = " ".to_string();
    }
    let mut msg = ChatMessage::assistant(text);
    if !tool_calls.is_empty() {
        msg.tool_calls = Some(tool_calls);
    }
    messages.push(msg);
}

pub fn add_tool_result(
    messages: &mut Vec<ChatMessage>,
    tool_call_id: &str,
    tool_name: &str,
    result: &str,
) {
    messages.push(ChatMessage::tool_result(tool_call_id, tool_name, result));
}

/// Models with native reasoning channels.
pub fn is_reasoning_model(model: &str) -> bool {
    let m = model.to_lowercase();
    ["r1", "thinking", "reasoning", "o1", "o3"]
        .iter()
        .any(|k| m.contains(k))
}

fn build_user_content(text: &str, media: Option<&[PathBuf]>) -> MessageContent {
    let Some(media) = media.filter(|m| !m.is_empty()) else {
        return MessageContent::Text(text.to_string());
    };

    let mut parts: Vec<Value> = Vec::new();
    for path in media {
        let Some(mime) = image_mime(path) else {
            continue;
        };
        let Ok(bytes) = std::fs::read(path) else {
            continue;
        };
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        parts.push(json!({
            "type": "image_url",
            "image_url": {"url": format!("data:{mime};base64,{b64}")}
        }));
    }
    if parts.is_empty() {
        return MessageContent::Text(text.to_string());
    }
    parts.push(json!({"type": "text", "text": text}));
    MessageContent::Parts(parts)
}

fn image_mime(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("png") => Some("image/png"),
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        Some("gif") => Some("image/gif"),
        Some("webp") => Some("image/webp"),
        _ => None,
    }
}

fn tool_config_exists(name: &str) -> bool {
    nanobot_core::paths::tool_configs_dir().join(name).exists()
}

fn service_status(configured: bool) -> String {
    if configured {
        " [已配置]".to_string()
    } else {
        " [未配置]".to_string()
    }
}

fn knowledge_status() -> String {
    let path = nanobot_core::paths::tool_configs_dir().join("knowledge_config.json");
    let Ok(text) = std::fs::read_to_string(path) else {
        return " [未配置]".to_string();
    };
    let Ok(cfg) = serde_json::from_str::<Value>(&text) else {
        return " [未配置]".to_string();
    };
    match cfg.get("vault_path").and_then(Value::as_str) {
        Some(vault) if Path::new(vault).exists() => " [已配置]".to_string(),
        Some(_) => " [路径无效]".to_string(),
        None => " [未配置]".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(dir: &tempfile::TempDir) -> ContextBuilder {
        let memory = Arc::new(MemoryStore::new(dir.path()));
        ContextBuilder::new(dir.path(), "gpt-4o", BrainConfig::default(), memory)
    }

    #[test]
    fn bootstrap_files_are_concatenated_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "agents body").unwrap();
        std::fs::write(dir.path().join("TOOLS.md"), "tools body").unwrap();
        let prompt = builder(&dir).build_system_prompt(None);
        let agents_pos = prompt.find("agents body").unwrap();
        let tools_pos = prompt.find("tools body").unwrap();
        assert!(agents_pos < tools_pos);
    }

    #[test]
    fn identity_template_substitutes_runtime_vars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("IDENTITY.md"),
            "model={model} ws={workspace_path} silent={SILENT_REPLY_TOKEN}",
        )
        .unwrap();
        let prompt = builder(&dir).build_system_prompt(None);
        assert!(prompt.contains("model=gpt-4o"));
        assert!(prompt.contains("silent=SILENT_REPLY_TOKEN"));
        assert!(!prompt.contains("{model}"));
    }

    #[test]
    fn reasoning_prompt_suppressed_for_native_reasoners() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryStore::new(dir.path()));
        let b = ContextBuilder::new(dir.path(), "deepseek-r1", BrainConfig::default(), memory);
        assert!(!b.build_system_prompt(None).contains("思考格式"));

        let prompt = builder(&dir).build_system_prompt(None);
        assert!(prompt.contains("思考格式"));
    }

    #[test]
    fn profile_summary_marks_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("PROFILE.md"), "- 常用称呼: 老板\n- 爱好: 骑行\n").unwrap();
        let prompt = builder(&dir).build_system_prompt(None);
        assert!(prompt.contains("- 常用称呼: 老板"));
        assert!(prompt.contains("- 时区: <EMPTY>"));
    }

    #[test]
    fn history_lines_get_local_time_tags() {
        let dir = tempfile::tempdir().unwrap();
        let history = vec![
            ChatMessage::user("早上好").with_timestamp("2026-03-01T01:30:00+00:00"),
        ];
        let messages = builder(&dir).build_messages(&history, "继续", None);
        // 01:30 UTC is 09:30 in Asia/Shanghai.
        assert_eq!(messages[1].text(), Some("[09:30] 早上好"));
        assert_eq!(messages.last().unwrap().text(), Some("继续"));
    }

    #[test]
    fn assistant_message_with_tool_calls_keeps_nonempty_content() {
        let mut messages = Vec::new();
        add_assistant_message(&mut messages, None, vec![json!({"id": "call_1"})]);
        assert_eq!(messages[0].text(), Some(" "));
        assert_eq!(messages[0].tool_calls.as_ref().unwrap().len(), 1);
    }
}
