//! Workspace skills: `<workspace>/skills/<name>/SKILL.md`, with optional YAML
//! front-matter (`name`, `description`, `always`).

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub always: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    always: bool,
}

pub struct SkillsLoader {
    skills_dir: PathBuf,
}

impl SkillsLoader {
    pub fn new(workspace: &std::path::Path) -> Self {
        Self {
            skills_dir: nanobot_core::paths::skills_dir(workspace),
        }
    }

    /// All skills, name-sorted.
    pub fn list(&self) -> Vec<SkillInfo> {
        let Ok(entries) = std::fs::read_dir(&self.skills_dir) else {
            return Vec::new();
        };
        let mut skills = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let skill_md = dir.join("SKILL.md");
            let Ok(content) = std::fs::read_to_string(&skill_md) else {
                continue;
            };
            let dir_name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let (front, body) = parse_front_matter(&content);
            skills.push(SkillInfo {
                name: front.name.unwrap_or(dir_name),
                description: front
                    .description
                    .unwrap_or_else(|| first_content_line(&body)),
                always: front.always,
            });
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    pub fn always_skills(&self) -> Vec<SkillInfo> {
        self.list().into_iter().filter(|s| s.always).collect()
    }

    /// Full SKILL.md content (front-matter stripped) for one skill.
    pub fn load_content(&self, name: &str) -> Option<String> {
        let content = std::fs::read_to_string(self.skills_dir.join(name).join("SKILL.md")).ok()?;
        let (_, body) = parse_front_matter(&content);
        Some(body)
    }

    /// One line per skill for the prompt's skill index.
    pub fn summary(&self) -> String {
        self.list()
            .iter()
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Split an optional `---` YAML front-matter block from the body.
fn parse_front_matter(content: &str) -> (FrontMatter, String) {
    let trimmed = content.trim_start();
    if let Some(rest) = trimmed.strip_prefix("---") {
        if let Some(end) = rest.find("\n---") {
            let yaml = &rest[..end];
            let body = rest[end + 4..].trim_start_matches('\n').to_string();
            let front = serde_yaml::from_str::<FrontMatter>(yaml).unwrap_or_default();
            return (front, body);
        }
    }
    (FrontMatter::default(), content.to_string())
}

fn first_content_line(body: &str) -> String {
    body.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .unwrap_or_default()
        .chars()
        .take(80)
        .collect()
}
