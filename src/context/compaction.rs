//! Context compaction: summarize an old prefix, keep a recent tail.

use crate::config::Limits;
use crate::context::{ContentPart, ContextEntry, ContextManager};
use crate::error::Result;
use crate::llm::CompletionClient;
use crate::prompts::PromptEngine;

impl ContextManager {
    pub fn needs_compaction(&self, limits: &Limits) -> bool {
        self.active_tokens() > limits.compaction_threshold
    }

    /// Pick the index (into the active window) of the first entry to keep.
    ///
    /// Scans backwards from the youngest entries until roughly
    /// `keep_recent_tokens` have been gathered, then keeps moving older
    /// until the cut lands on a turn boundary (a `user_message`), so a
    /// `tool_use`/`tool_result` pair is never separated. Returns `None`
    /// when no valid cut exists (everything is one giant turn).
    pub fn pick_cut_point(&self, limits: &Limits) -> Option<usize> {
        let (_, tail) = self.active_window();
        if tail.is_empty() {
            return None;
        }

        let mut kept_tokens = 0usize;
        let mut candidate = tail.len();
        for (index, entry) in tail.iter().enumerate().rev() {
            kept_tokens += self.estimate(entry);
            candidate = index;
            if kept_tokens >= limits.keep_recent_tokens {
                break;
            }
        }

        // Move older until the cut starts a turn.
        let boundary = (0..=candidate)
            .rev()
            .find(|&index| matches!(tail[index], ContextEntry::UserMessage { .. }))?;

        // Cutting at the very start would summarize nothing.
        (boundary > 0).then_some(boundary)
    }

    /// Run compaction if the active window exceeds the threshold.
    ///
    /// Summary generation may fail or be refused; in that case the run
    /// continues with the oversized context and `Ok(false)` is returned.
    pub async fn compact_if_needed(
        &mut self,
        client: &dyn CompletionClient,
        model: &str,
        prompts: &PromptEngine,
        limits: &Limits,
    ) -> Result<bool> {
        if !self.needs_compaction(limits) {
            return Ok(false);
        }
        let Some(cut) = self.pick_cut_point(limits) else {
            tracing::warn!("context over budget but no valid cut point, skipping compaction");
            return Ok(false);
        };

        let tokens_before = self.active_tokens();
        let (previous_summary, tail) = self.active_window();
        let offset = self.entries().len() - tail.len();
        let cutover_index = offset + cut - 1;

        let mut transcript = String::new();
        if let Some(summary) = previous_summary {
            transcript.push_str("[Earlier summary]\n");
            transcript.push_str(summary);
            transcript.push_str("\n\n");
        }
        for entry in &tail[..cut] {
            transcript.push_str(&render_entry(entry));
            transcript.push('\n');
        }

        let prompt = prompts.render_compaction(&transcript)?;
        let summary = match client
            .complete_text(model, "You compact conversation history.", &prompt)
            .await
        {
            Ok(summary) => summary,
            Err(error) => {
                tracing::warn!(%error, "compaction summary failed, continuing oversized");
                return Ok(false);
            }
        };

        self.append(ContextEntry::Compaction {
            summary,
            tokens_before,
            cutover_index,
        })?;

        tracing::info!(
            tokens_before,
            tokens_after = self.active_tokens(),
            cutover_index,
            "context compacted"
        );
        Ok(true)
    }
}

/// Render one entry for the compaction transcript.
fn render_entry(entry: &ContextEntry) -> String {
    match entry {
        ContextEntry::UserMessage { text, .. } => format!("User: {text}"),
        ContextEntry::AssistantMessage { content, .. } => {
            let mut out = String::from("Assistant:");
            for part in content {
                match part {
                    ContentPart::Text { text } => {
                        out.push(' ');
                        out.push_str(text);
                    }
                    ContentPart::Thinking { .. } => {}
                    ContentPart::ToolUse { name, args, .. } => {
                        out.push_str(&format!(" [called {name} {args}]"));
                    }
                }
            }
            out
        }
        ContextEntry::ToolResult {
            is_error, content, ..
        } => {
            let text = content
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            if *is_error {
                format!("Tool error: {text}")
            } else {
                format!("Tool output: {text}")
            }
        }
        ContextEntry::Compaction { summary, .. } => format!("[Summary] {summary}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelId;
    use crate::context::{StopReason, Usage};
    use crate::store::ChannelStore;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct FixedSummarizer;

    #[async_trait]
    impl CompletionClient for FixedSummarizer {
        async fn stream_turn(
            &self,
            _request: crate::llm::ChatRequest,
            _events: tokio::sync::mpsc::Sender<crate::llm::AssistantEvent>,
            _cancel: &CancellationToken,
        ) -> std::result::Result<crate::llm::AssistantTurn, crate::error::LlmError> {
            Err(crate::error::LlmError::Transport("not used".into()))
        }

        async fn complete_text(
            &self,
            _model: &str,
            _system: &str,
            _user: &str,
        ) -> std::result::Result<String, crate::error::LlmError> {
            Ok("summary of the early conversation".into())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl CompletionClient for FailingSummarizer {
        async fn stream_turn(
            &self,
            _request: crate::llm::ChatRequest,
            _events: tokio::sync::mpsc::Sender<crate::llm::AssistantEvent>,
            _cancel: &CancellationToken,
        ) -> std::result::Result<crate::llm::AssistantTurn, crate::error::LlmError> {
            Err(crate::error::LlmError::Transport("down".into()))
        }

        async fn complete_text(
            &self,
            _model: &str,
            _system: &str,
            _user: &str,
        ) -> std::result::Result<String, crate::error::LlmError> {
            Err(crate::error::LlmError::Transport("down".into()))
        }
    }

    fn tiny_limits() -> Limits {
        Limits {
            compaction_threshold: 300,
            keep_recent_tokens: 75,
            ..Limits::default()
        }
    }

    fn user(text: String, ts: &str) -> ContextEntry {
        ContextEntry::UserMessage {
            text,
            images: vec![],
            ts: Some(ts.into()),
        }
    }

    fn assistant_with_tool(id: &str) -> [ContextEntry; 2] {
        [
            ContextEntry::AssistantMessage {
                content: vec![ContentPart::ToolUse {
                    id: id.into(),
                    name: "bash".into(),
                    args: serde_json::json!({"command": "ls", "label": "list"}),
                }],
                stop_reason: StopReason::Stop,
                usage: Usage::default(),
                ts: None,
            },
            ContextEntry::ToolResult {
                tool_use_id: id.into(),
                is_error: false,
                content: vec![ContentPart::Text {
                    text: "x".repeat(200),
                }],
            },
        ]
    }

    fn oversized_manager(dir: &std::path::Path) -> ContextManager {
        let store = ChannelStore::open(dir, ChannelId::from("C1")).unwrap();
        let mut manager = ContextManager::open(&store).unwrap();
        for i in 0..8 {
            manager
                .append(user("y".repeat(200), &format!("{i}.0")))
                .unwrap();
            for entry in assistant_with_tool(&format!("tu_{i}")) {
                manager.append(entry).unwrap();
            }
        }
        manager
    }

    #[test]
    fn cut_point_lands_on_a_user_message() {
        let dir = tempfile::tempdir().unwrap();
        let manager = oversized_manager(dir.path());
        let limits = tiny_limits();
        assert!(manager.needs_compaction(&limits));

        let cut = manager.pick_cut_point(&limits).unwrap();
        let (_, tail) = manager.active_window();
        assert!(matches!(tail[cut], ContextEntry::UserMessage { .. }));
        assert!(cut > 0);
    }

    #[tokio::test]
    async fn compaction_appends_entry_and_shrinks_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = oversized_manager(dir.path());
        let limits = tiny_limits();
        let prompts = PromptEngine::new().unwrap();

        let compacted = manager
            .compact_if_needed(&FixedSummarizer, "test-model", &prompts, &limits)
            .await
            .unwrap();
        assert!(compacted);

        let (summary, tail) = manager.active_window();
        assert_eq!(summary, Some("summary of the early conversation"));
        assert!(manager.active_tokens() < limits.compaction_threshold);

        // No orphaned tool_result in the surviving tail.
        for (index, entry) in tail.iter().enumerate() {
            if let ContextEntry::ToolResult { tool_use_id, .. } = entry {
                let paired = tail[..index].iter().any(|earlier| {
                    matches!(
                        earlier,
                        ContextEntry::AssistantMessage { content, .. }
                            if content.iter().any(|part| matches!(
                                part,
                                ContentPart::ToolUse { id, .. } if id == tool_use_id
                            ))
                    )
                });
                assert!(paired, "tool_result {tool_use_id} orphaned by the cut");
            }
        }
    }

    #[tokio::test]
    async fn failed_summary_skips_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = oversized_manager(dir.path());
        let limits = tiny_limits();
        let prompts = PromptEngine::new().unwrap();
        let entries_before = manager.entries().len();

        let compacted = manager
            .compact_if_needed(&FailingSummarizer, "test-model", &prompts, &limits)
            .await
            .unwrap();
        assert!(!compacted);
        assert_eq!(manager.entries().len(), entries_before);
        assert!(manager.needs_compaction(&limits));
    }

    #[tokio::test]
    async fn under_threshold_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChannelStore::open(dir.path(), ChannelId::from("C1")).unwrap();
        let mut manager = ContextManager::open(&store).unwrap();
        manager.append(user("short".into(), "1.0")).unwrap();

        let prompts = PromptEngine::new().unwrap();
        let compacted = manager
            .compact_if_needed(&FixedSummarizer, "m", &prompts, &Limits::default())
            .await
            .unwrap();
        assert!(!compacted);
    }
}
