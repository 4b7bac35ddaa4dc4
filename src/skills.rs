//! Skill discovery: SKILL.md frontmatter only.
//!
//! Skills are plain CLI programs under `skills/`; the harness never runs
//! them itself. It reads each `SKILL.md`'s YAML frontmatter to advertise a
//! name and one-line description in the system prompt.

use serde::Deserialize;
use std::path::Path;

/// One advertised skill.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct Frontmatter {
    name: Option<String>,
    description: Option<String>,
}

/// Scan `skills/*/SKILL.md` for frontmatter. Unreadable or unparseable
/// files are skipped with a warning; a missing skills dir yields an empty
/// list.
pub fn discover(skills_dir: &Path) -> Vec<SkillInfo> {
    let entries = match std::fs::read_dir(skills_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut skills = Vec::new();
    for entry in entries.flatten() {
        let manifest = entry.path().join("SKILL.md");
        let Ok(raw) = std::fs::read_to_string(&manifest) else {
            continue;
        };
        match parse_frontmatter(&raw) {
            Some(front) => {
                let fallback = entry.file_name().to_string_lossy().into_owned();
                skills.push(SkillInfo {
                    name: front.name.unwrap_or(fallback),
                    description: front.description.unwrap_or_default(),
                });
            }
            None => {
                tracing::warn!(path = %manifest.display(), "SKILL.md has no parseable frontmatter");
            }
        }
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Extract the YAML block between leading `---` fences.
fn parse_frontmatter(markdown: &str) -> Option<Frontmatter> {
    let rest = markdown.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    serde_yaml::from_str(&rest[..end]).ok()
}
