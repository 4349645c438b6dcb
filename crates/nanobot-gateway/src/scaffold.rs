//! `new skill` scaffolding and the legacy tool-config migration.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum NewTarget {
    /// Scaffold a skill folder under <workspace>/skills/<name>/.
    Skill {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
}

pub fn run(target: NewTarget) -> i32 {
    match target {
        NewTarget::Skill { name, description } => new_skill(&name, description.as_deref()),
    }
}

fn new_skill(name: &str, description: Option<&str>) -> i32 {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        eprintln!("skill name must be alphanumeric with - or _");
        return 1;
    }

    let workspace = nanobot_core::paths::workspace_dir();
    let skill_dir = nanobot_core::paths::skills_dir(&workspace).join(name);
    if skill_dir.exists() {
        eprintln!("skill '{name}' already exists at {}", skill_dir.display());
        return 1;
    }
    if let Err(e) = std::fs::create_dir_all(&skill_dir) {
        eprintln!("cannot create skill dir: {e}");
        return 1;
    }

    let description = description.unwrap_or("Describe what this skill does.");
    let content = format!(
        "---\nname: {name}\ndescription: {description}\nalways: false\n---\n\n# {name}\n\n## 使用方法\n\n在这里写下技能的具体步骤和注意事项。\n"
    );
    match std::fs::write(skill_dir.join("SKILL.md"), content) {
        Ok(()) => {
            println!("created {}", skill_dir.join("SKILL.md").display());
            0
        }
        Err(e) => {
            eprintln!("cannot write SKILL.md: {e}");
            1
        }
    }
}

/// Legacy layout kept per-tool credentials as `<data>/<tool>_config.json`;
/// move them under `<data>/tool_configs/`.
pub fn migrate_tool_configs(dry_run: bool) -> i32 {
    let data_dir = nanobot_core::paths::data_dir();
    let target_dir = nanobot_core::paths::tool_configs_dir();

    let Ok(entries) = std::fs::read_dir(&data_dir) else {
        eprintln!("cannot read data dir {}", data_dir.display());
        return 1;
    };

    let mut moved = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_file() || !file_name.ends_with("_config.json") {
            continue;
        }
        let target = target_dir.join(file_name);
        if target.exists() {
            println!("skip {file_name} (already migrated)");
            continue;
        }
        if dry_run {
            println!("would move {file_name} -> tool_configs/{file_name}");
            moved += 1;
            continue;
        }
        match std::fs::rename(&path, &target) {
            Ok(()) => {
                println!("moved {file_name} -> tool_configs/{file_name}");
                moved += 1;
            }
            Err(e) => {
                eprintln!("failed to move {file_name}: {e}");
                return 1;
            }
        }
    }

    if moved == 0 {
        println!("nothing to migrate");
    } else if dry_run {
        println!("{moved} file(s) would be migrated");
    } else {
        println!("{moved} file(s) migrated");
    }
    0
}
