//! LLM client abstraction and the Anthropic Messages implementation.
//!
//! The agent runner and the compactor depend only on [`CompletionClient`],
//! so tests drive them with scripted clients.

pub mod anthropic;
pub mod stream;

pub use anthropic::AnthropicClient;

use crate::context::{ContentPart, StopReason, Usage};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A tool the model may call, with its JSON schema.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One request to the model: system prompt, prior messages, tools.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    /// Anthropic-shaped message objects (`{"role": ..., "content": [...]}`).
    pub messages: Vec<serde_json::Value>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// One assistant message, fully assembled from the stream.
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    pub parts: Vec<ContentPart>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl AssistantTurn {
    /// Concatenated text parts (what the user ultimately sees).
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.parts.iter().filter_map(|part| match part {
            ContentPart::ToolUse { id, name, args } => Some((id.as_str(), name.as_str(), args)),
            _ => None,
        })
    }
}

/// Events emitted while an assistant message streams, in stream order.
#[derive(Debug, Clone)]
pub enum AssistantEvent {
    /// A completed text content block.
    Text(String),
    /// A completed thinking content block.
    Thinking(String),
    /// A completed tool_use content block.
    ToolUse {
        id: String,
        name: String,
        args: serde_json::Value,
    },
}

/// Streaming completion interface.
///
/// `stream_turn` sends part events on `events` as blocks complete (never
/// after returning) and resolves to the assembled message. Cancellation
/// closes the stream and resolves with `stop_reason = Aborted`.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn stream_turn(
        &self,
        request: ChatRequest,
        events: mpsc::Sender<AssistantEvent>,
        cancel: &CancellationToken,
    ) -> Result<AssistantTurn, crate::error::LlmError>;

    /// Single non-streaming text completion, used for compaction summaries.
    async fn complete_text(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, crate::error::LlmError>;
}

/// Build Anthropic-shaped messages from the active context window.
///
/// The compaction summary, when present, becomes a synthetic first user
/// message so the system prompt stays byte-identical across turns.
pub fn messages_from_context(
    summary: Option<&str>,
    entries: &[crate::context::ContextEntry],
) -> Vec<serde_json::Value> {
    use crate::context::ContextEntry;

    let mut messages: Vec<serde_json::Value> = Vec::new();

    if let Some(summary) = summary {
        messages.push(serde_json::json!({
            "role": "user",
            "content": [{
                "type": "text",
                "text": format!(
                    "[Conversation summary — earlier history was compacted]\n{summary}"
                ),
            }],
        }));
    }

    for entry in entries {
        match entry {
            ContextEntry::UserMessage { text, .. } => {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": [{"type": "text", "text": text}],
                }));
            }
            ContextEntry::AssistantMessage { content, .. } => {
                let parts: Vec<serde_json::Value> =
                    content.iter().map(content_part_to_json).collect();
                messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": parts,
                }));
            }
            ContextEntry::ToolResult {
                tool_use_id,
                is_error,
                content,
            } => {
                let text = content
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "is_error": is_error,
                        "content": text,
                    }],
                }));
            }
            // Older compactions inside the tail never reach here; the
            // caller slices strictly after the most recent one.
            ContextEntry::Compaction { .. } => {}
        }
    }

    messages
}

fn content_part_to_json(part: &ContentPart) -> serde_json::Value {
    match part {
        ContentPart::Text { text } => serde_json::json!({"type": "text", "text": text}),
        ContentPart::Thinking { thinking } => {
            serde_json::json!({"type": "thinking", "thinking": thinking})
        }
        ContentPart::ToolUse { id, name, args } => {
            serde_json::json!({"type": "tool_use", "id": id, "name": name, "input": args})
        }
    }
}
