//! Prompt templates, rendered with minijinja.

use crate::error::Result;
use minijinja::{Environment, context};

const SYSTEM_PROMPT: &str = r#"You are mom, a resident assistant for this chat channel.

You run inside a workspace at {{ workspace_path }} with a directory per
channel. This channel is {{ channel_id }}; its scratch space is
{{ workspace_path }}/{{ channel_id }}/scratch and inbound files land in
{{ workspace_path }}/{{ channel_id }}/attachments. Tools execute in the
{{ sandbox }} sandbox.

Use the bash, read, write, and edit tools to get real work done, and the
attach tool to share files back into the channel. Every tool call takes a
short human-readable label; it is shown to the user while you work.

Today is {{ current_date }} ({{ current_date_time }}).
{% if skills %}
Available skills (run them with bash):
{% for skill in skills %}- {{ skill.name }}: {{ skill.description }}
{% endfor %}{% endif %}
{% if memory %}# Memory

{{ memory }}
{% endif %}
If you were triggered by a scheduled event and there is nothing worth
saying, reply with exactly [SILENT]."#;

const COMPACTION_PROMPT: &str = r#"Summarize the following conversation transcript for use as
long-term context. Preserve decisions, names, open tasks, file paths, and
anything the assistant promised to do. Drop tool output details unless a
result is still load-bearing. Write plain prose, at most ~40 lines.

Transcript:
{{ transcript }}"#;

/// Values interpolated into the system prompt each turn.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemPromptInputs {
    pub workspace_path: String,
    pub channel_id: String,
    pub sandbox: String,
    pub current_date: String,
    pub current_date_time: String,
    pub memory: String,
    pub skills: Vec<crate::skills::SkillInfo>,
}

/// Compiled template environment, shared across channels.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_PROMPT)
            .map_err(|error| anyhow::anyhow!("system template: {error}"))?;
        env.add_template("compaction", COMPACTION_PROMPT)
            .map_err(|error| anyhow::anyhow!("compaction template: {error}"))?;
        Ok(Self { env })
    }

    pub fn render_system(&self, inputs: &SystemPromptInputs) -> Result<String> {
        let template = self
            .env
            .get_template("system")
            .map_err(|error| anyhow::anyhow!("{error}"))?;
        let rendered = template
            .render(inputs)
            .map_err(|error| anyhow::anyhow!("render system prompt: {error}"))?;
        Ok(rendered)
    }

    pub fn render_compaction(&self, transcript: &str) -> Result<String> {
        let template = self
            .env
            .get_template("compaction")
            .map_err(|error| anyhow::anyhow!("{error}"))?;
        let rendered = template
            .render(context! { transcript })
            .map_err(|error| anyhow::anyhow!("render compaction prompt: {error}"))?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> SystemPromptInputs {
        SystemPromptInputs {
            workspace_path: "/srv/mom".into(),
            channel_id: "C1".into(),
            sandbox: "host".into(),
            current_date: "2025-11-26".into(),
            current_date_time: "2025-11-26T10:44:00Z".into(),
            memory: String::new(),
            skills: vec![],
        }
    }

    #[test]
    fn system_prompt_interpolates_paths() {
        let engine = PromptEngine::new().unwrap();
        let rendered = engine.render_system(&inputs()).unwrap();
        assert!(rendered.contains("/srv/mom/C1/scratch"));
        assert!(rendered.contains("host sandbox"));
        assert!(rendered.contains("[SILENT]"));
        assert!(!rendered.contains("Available skills"));
    }

    #[test]
    fn system_prompt_lists_skills_and_memory() {
        let engine = PromptEngine::new().unwrap();
        let mut in_ = inputs();
        in_.memory = "prefers short answers".into();
        in_.skills = vec![crate::skills::SkillInfo {
            name: "deploy".into(),
            description: "ship the site".into(),
        }];
        let rendered = engine.render_system(&in_).unwrap();
        assert!(rendered.contains("- deploy: ship the site"));
        assert!(rendered.contains("prefers short answers"));
    }

    #[test]
    fn compaction_prompt_embeds_transcript() {
        let engine = PromptEngine::new().unwrap();
        let rendered = engine.render_compaction("U: hi\nA: hello").unwrap();
        assert!(rendered.contains("U: hi"));
    }
}
