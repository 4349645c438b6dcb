//! Truthfulness audit: strike through lines that claim tool actions the
//! execution record does not show.

use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::tools::ToolMeta;

/// Phrases that make a sentence a claim about performed actions.
const CLAIM_MARKERS: &[&str] = &["我用", "使用了", "调用了", "测试了", "刚才", "本次", "通过"];

/// Generic nouns mined descriptions produce; never count them as aliases.
const BANNED_NOUNS: &[&str] = &["工具", "封装", "插件", "使用", "能力", "查看"];

/// Detect and mark tool-execution hallucinations with strikethrough.
/// Returns `(processed_content, hallucination_detected)`.
pub fn audit_and_mark_hallucinations(
    content: &str,
    used_tools: &[String],
    all_tools_meta: &[ToolMeta],
) -> (String, bool) {
    let used: HashSet<&str> = used_tools.iter().map(String::as_str).collect();
    let cjk = Regex::new(r"[\u{4e00}-\u{9fff}]{2,}").expect("static regex");

    // Dynamic alias map: tool name plus CJK business names from its
    // description. Registration order decides which tool a line is
    // attributed to when aliases overlap.
    let mut alias_map: Vec<(String, HashSet<String>)> = Vec::new();
    for meta in all_tools_meta {
        let mut aliases = HashSet::new();
        aliases.insert(meta.name.to_lowercase());
        for m in cjk.find_iter(&meta.description) {
            if !BANNED_NOUNS.contains(&m.as_str()) {
                aliases.insert(m.as_str().to_string());
            }
        }
        alias_map.push((meta.name.clone(), aliases));
    }

    // Well-known overrides for core tools.
    let overrides: HashMap<&str, &[&str]> = HashMap::from([
        ("browser", ["浏览器", "网页", "上网"].as_slice()),
        ("tavily", ["搜索", "联网", "Tavily"].as_slice()),
        ("github", ["GitHub", "仓库", "代码仓"].as_slice()),
        ("train_ticket", ["12306", "火车票", "买票"].as_slice()),
    ]);
    for (tool, aliases) in alias_map.iter_mut() {
        if let Some(extra) = overrides.get(tool.as_str()) {
            aliases.extend(extra.iter().map(|s| s.to_string()));
        }
    }

    let mut detected = false;
    let mut processed: Vec<String> = Vec::new();

    for line in content.lines() {
        let mut marked = None;
        for (tool, aliases) in &alias_map {
            if used.contains(tool.as_str()) || used.contains(format!("mcp:{tool}").as_str()) {
                continue;
            }
            let alias_hit = aliases.iter().any(|a| line.contains(a.as_str()));
            let claim_hit = CLAIM_MARKERS.iter().any(|m| line.contains(m));
            if alias_hit && claim_hit {
                marked = Some(tool.clone());
                break;
            }
        }
        match marked {
            Some(tool) => {
                detected = true;
                processed.push(format!(
                    "~~{}~~ [审计：记录中未见 {} 相关操作]",
                    line.trim(),
                    tool
                ));
            }
            None => processed.push(line.to_string()),
        }
    }

    (processed.join("\n").trim().to_string(), detected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metas() -> Vec<ToolMeta> {
        vec![
            ToolMeta {
                name: "github".to_string(),
                description: "GitHub 仓库查询工具".to_string(),
            },
            ToolMeta {
                name: "tavily".to_string(),
                description: "联网搜索工具".to_string(),
            },
        ]
    }

    #[test]
    fn unused_tool_claim_gets_struck_through() {
        let (out, detected) = audit_and_mark_hallucinations(
            "我刚才使用了 GitHub 搜索了 nanobot 仓库。",
            &[],
            &metas(),
        );
        assert!(detected);
        assert!(out.starts_with("~~"));
        assert!(out.contains("[审计：记录中未见 github 相关操作]"));
    }

    #[test]
    fn used_tools_are_never_marked() {
        let (out, detected) = audit_and_mark_hallucinations(
            "我刚才使用了 GitHub 搜索了 nanobot 仓库。",
            &["github".to_string()],
            &metas(),
        );
        assert!(!detected);
        assert!(!out.contains("~~"));
    }

    #[test]
    fn mcp_prefixed_usage_counts_as_used() {
        let (_, detected) = audit_and_mark_hallucinations(
            "本次通过 GitHub 完成了检索。",
            &["mcp:github".to_string()],
            &metas(),
        );
        assert!(!detected);
    }

    #[test]
    fn alias_without_claim_marker_passes() {
        let (out, detected) =
            audit_and_mark_hallucinations("GitHub 是一个代码托管平台。", &[], &metas());
        assert!(!detected);
        assert!(!out.contains("~~"));
    }

    #[test]
    fn only_offending_lines_are_marked() {
        let content = "第一行正常。\n我调用了搜索查到了结果。\n结论在此。";
        let (out, detected) = audit_and_mark_hallucinations(content, &[], &metas());
        assert!(detected);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "第一行正常。");
        assert!(lines[1].starts_with("~~"));
        assert_eq!(lines[2], "结论在此。");
    }
}
