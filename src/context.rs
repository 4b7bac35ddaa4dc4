//! The LLM-visible context log: entry types, sync, token accounting.

pub mod compaction;
pub mod sync;

use crate::error::{Result, StoreError};
use crate::store::ChannelStore;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::PathBuf;

/// Why an assistant message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    MaxTokens,
    Error,
    Aborted,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One piece of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        args: serde_json::Value,
    },
}

/// One line of `context.jsonl`.
///
/// `user_message` and `assistant_message` carry the source log `ts` when
/// they mirror a log entry; the sync high-water mark is recomputed from
/// those instead of a sidecar file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextEntry {
    UserMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<String>,
    },
    AssistantMessage {
        #[serde(rename = "content_parts")]
        content: Vec<ContentPart>,
        #[serde(rename = "stopReason")]
        stop_reason: StopReason,
        usage: Usage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<String>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(rename = "isError")]
        is_error: bool,
        #[serde(rename = "content_parts")]
        content: Vec<ContentPart>,
    },
    Compaction {
        summary: String,
        #[serde(rename = "tokensBefore")]
        tokens_before: usize,
        #[serde(rename = "cutoverIndex")]
        cutover_index: usize,
    },
}

impl ContextEntry {
    /// The source log `ts` this entry mirrors, if any.
    pub fn source_ts(&self) -> Option<&str> {
        match self {
            ContextEntry::UserMessage { ts, .. } => ts.as_deref(),
            ContextEntry::AssistantMessage { ts, .. } => ts.as_deref(),
            _ => None,
        }
    }
}

/// Pluggable token estimator.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, entry: &ContextEntry) -> usize;
}

/// Default estimator: ≈ chars/4 with a small per-part overhead.
pub struct CharEstimator;

const PART_OVERHEAD_TOKENS: usize = 8;

impl TokenEstimator for CharEstimator {
    fn estimate(&self, entry: &ContextEntry) -> usize {
        let (chars, parts) = match entry {
            ContextEntry::UserMessage { text, .. } => (text.len(), 1),
            ContextEntry::AssistantMessage { content, .. } => (content_chars(content), content.len()),
            ContextEntry::ToolResult { content, .. } => (content_chars(content), content.len()),
            ContextEntry::Compaction { summary, .. } => (summary.len(), 1),
        };
        chars / 4 + parts * PART_OVERHEAD_TOKENS
    }
}

fn content_chars(parts: &[ContentPart]) -> usize {
    parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => text.len(),
            ContentPart::Thinking { thinking } => thinking.len(),
            ContentPart::ToolUse { args, .. } => args.to_string().len(),
        })
        .sum()
}

/// Owns `context.jsonl`: an in-memory mirror plus append-through writes.
///
/// Single-writer per channel (the supervisor), like the message log.
pub struct ContextManager {
    path: PathBuf,
    entries: Vec<ContextEntry>,
    estimator: Box<dyn TokenEstimator>,
}

impl ContextManager {
    /// Load the context log for a channel. Corrupt lines are skipped.
    pub fn open(store: &ChannelStore) -> Result<Self> {
        Self::open_with_estimator(store, Box::new(CharEstimator))
    }

    pub fn open_with_estimator(
        store: &ChannelStore,
        estimator: Box<dyn TokenEstimator>,
    ) -> Result<Self> {
        let path = store.context_path();
        let mut entries = Vec::new();
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                for (index, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ContextEntry>(line) {
                        Ok(entry) => entries.push(entry),
                        Err(error) => {
                            tracing::warn!(
                                path = %path.display(),
                                line = index + 1,
                                %error,
                                "skipping corrupt context line"
                            );
                        }
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(StoreError::Io(error).into()),
        }
        Ok(Self {
            path,
            entries,
            estimator,
        })
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    /// Append one entry: single `line + '\n'` write, then push to the mirror.
    pub fn append(&mut self, entry: ContextEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry)
            .map_err(|error| StoreError::Other(anyhow::anyhow!("serialize context entry: {error}")))?;
        line.push('\n');

        let map_io = |source: std::io::Error| StoreError::Append {
            path: self.path.display().to_string(),
            source,
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(map_io)?;
        file.write_all(line.as_bytes()).map_err(map_io)?;
        file.sync_all().map_err(map_io)?;

        self.entries.push(entry);
        Ok(())
    }

    /// Source log `ts` values already reflected here. A message logged
    /// while a turn was running carries an older `ts` than that turn's bot
    /// reply, so "already reflected" is a set test, not a watermark.
    pub fn reflected_ts(&self) -> std::collections::HashSet<String> {
        self.entries
            .iter()
            .filter_map(ContextEntry::source_ts)
            .map(str::to_string)
            .collect()
    }

    /// The prompt-visible window: the most recent compaction's summary (if
    /// any) and every entry after it.
    pub fn active_window(&self) -> (Option<&str>, &[ContextEntry]) {
        for (index, entry) in self.entries.iter().enumerate().rev() {
            if let ContextEntry::Compaction { summary, .. } = entry {
                return (Some(summary.as_str()), &self.entries[index + 1..]);
            }
        }
        (None, &self.entries[..])
    }

    /// Token estimate of the active window, summary included.
    pub fn active_tokens(&self) -> usize {
        let (summary, tail) = self.active_window();
        let summary_tokens = summary.map(|s| s.len() / 4 + PART_OVERHEAD_TOKENS).unwrap_or(0);
        summary_tokens
            + tail
                .iter()
                .map(|entry| self.estimator.estimate(entry))
                .sum::<usize>()
    }

    pub fn estimate(&self, entry: &ContextEntry) -> usize {
        self.estimator.estimate(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelId;

    fn manager(dir: &std::path::Path) -> (ChannelStore, ContextManager) {
        let store = ChannelStore::open(dir, ChannelId::from("C1")).unwrap();
        let manager = ContextManager::open(&store).unwrap();
        (store, manager)
    }

    fn user(text: &str, ts: &str) -> ContextEntry {
        ContextEntry::UserMessage {
            text: text.into(),
            images: vec![],
            ts: Some(ts.into()),
        }
    }

    #[test]
    fn entry_serde_is_identity() {
        let entries = vec![
            user("hello", "1.0"),
            ContextEntry::AssistantMessage {
                content: vec![
                    ContentPart::Thinking {
                        thinking: "let me see".into(),
                    },
                    ContentPart::ToolUse {
                        id: "tu_1".into(),
                        name: "bash".into(),
                        args: serde_json::json!({"command": "ls", "label": "list"}),
                    },
                ],
                stop_reason: StopReason::Stop,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 20,
                },
                ts: None,
            },
            ContextEntry::ToolResult {
                tool_use_id: "tu_1".into(),
                is_error: false,
                content: vec![ContentPart::Text { text: "out".into() }],
            },
            ContextEntry::Compaction {
                summary: "stuff happened".into(),
                tokens_before: 120_000,
                cutover_index: 40,
            },
        ];

        for entry in entries {
            let line = serde_json::to_string(&entry).unwrap();
            let back: ContextEntry = serde_json::from_str(&line).unwrap();
            assert_eq!(back, entry);
        }
    }

    #[test]
    fn wire_field_names_match_contract() {
        let entry = ContextEntry::Compaction {
            summary: "s".into(),
            tokens_before: 1,
            cutover_index: 2,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "compaction");
        assert!(json.get("tokensBefore").is_some());
        assert!(json.get("cutoverIndex").is_some());

        let entry = ContextEntry::ToolResult {
            tool_use_id: "t".into(),
            is_error: true,
            content: vec![],
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("isError").is_some());
        assert!(json.get("content_parts").is_some());
    }

    #[test]
    fn append_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut manager) = manager(dir.path());
        manager.append(user("one", "1.0")).unwrap();
        manager.append(user("two", "2.0")).unwrap();

        let reloaded = ContextManager::open(&store).unwrap();
        assert_eq!(reloaded.entries(), manager.entries());
        assert!(reloaded.reflected_ts().contains("1.0"));
        assert!(reloaded.reflected_ts().contains("2.0"));
    }

    #[test]
    fn active_window_starts_after_last_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, mut manager) = manager(dir.path());
        manager.append(user("old", "1.0")).unwrap();
        manager
            .append(ContextEntry::Compaction {
                summary: "old stuff".into(),
                tokens_before: 99,
                cutover_index: 0,
            })
            .unwrap();
        manager.append(user("new", "2.0")).unwrap();

        let (summary, tail) = manager.active_window();
        assert_eq!(summary, Some("old stuff"));
        assert_eq!(tail.len(), 1);
        assert!(matches!(&tail[0], ContextEntry::UserMessage { text, .. } if text == "new"));
    }

    #[test]
    fn char_estimator_scales_with_length() {
        let estimator = CharEstimator;
        let small = estimator.estimate(&user("hi", "1.0"));
        let big = estimator.estimate(&user(&"x".repeat(4000), "1.0"));
        assert!(big > small);
        assert!(big >= 1000);
    }
}
