//! Server-sent-event parsing and assistant message assembly for the
//! Anthropic Messages streaming API.

use crate::context::{ContentPart, StopReason, Usage};
use crate::error::LlmError;

/// Incremental `event:`/`data:` line parser over a byte stream.
///
/// Chunk boundaries fall anywhere, so bytes are buffered until a blank
/// line terminates a frame.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseParser {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut frames = Vec::new();
        while let Some(split) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..split + 2).collect();
            let mut event = String::new();
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(rest.trim_start());
                }
            }
            if !event.is_empty() || !data.is_empty() {
                frames.push(SseFrame { event, data });
            }
        }
        frames
    }
}

/// Assembles streamed frames into completed [`ContentPart`]s.
#[derive(Default)]
pub struct MessageAssembler {
    blocks: Vec<PendingBlock>,
    pub stop_reason: Option<StopReason>,
    pub usage: Usage,
}

enum PendingBlock {
    Text(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
    Done,
}

impl MessageAssembler {
    /// Feed one frame; returns a completed part on `content_block_stop`.
    pub fn consume(&mut self, frame: &SseFrame) -> Result<Option<ContentPart>, LlmError> {
        let payload: serde_json::Value = match serde_json::from_str(&frame.data) {
            Ok(value) => value,
            Err(_) if frame.data.is_empty() => return Ok(None),
            Err(error) => {
                return Err(LlmError::Stream(format!(
                    "bad JSON in '{}' frame: {error}",
                    frame.event
                )));
            }
        };

        match frame.event.as_str() {
            "message_start" => {
                if let Some(input) = payload["message"]["usage"]["input_tokens"].as_u64() {
                    self.usage.input_tokens += input;
                }
                Ok(None)
            }
            "content_block_start" => {
                let index = block_index(&payload)?;
                if index != self.blocks.len() {
                    return Err(LlmError::Stream(format!(
                        "content_block_start index {index}, expected {}",
                        self.blocks.len()
                    )));
                }
                let block = &payload["content_block"];
                let pending = match block["type"].as_str() {
                    Some("text") => PendingBlock::Text(
                        block["text"].as_str().unwrap_or_default().to_string(),
                    ),
                    Some("thinking") => PendingBlock::Thinking(
                        block["thinking"].as_str().unwrap_or_default().to_string(),
                    ),
                    Some("tool_use") => PendingBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        json: String::new(),
                    },
                    other => {
                        return Err(LlmError::Stream(format!(
                            "unknown content block type {other:?}"
                        )));
                    }
                };
                self.blocks.push(pending);
                Ok(None)
            }
            "content_block_delta" => {
                let index = block_index(&payload)?;
                let block = self
                    .blocks
                    .get_mut(index)
                    .ok_or_else(|| LlmError::Stream(format!("delta for unknown block {index}")))?;
                let delta = &payload["delta"];
                match (block, delta["type"].as_str()) {
                    (PendingBlock::Text(text), Some("text_delta")) => {
                        text.push_str(delta["text"].as_str().unwrap_or_default());
                    }
                    (PendingBlock::Thinking(thinking), Some("thinking_delta")) => {
                        thinking.push_str(delta["thinking"].as_str().unwrap_or_default());
                    }
                    (PendingBlock::ToolUse { json, .. }, Some("input_json_delta")) => {
                        json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    // Signature and other auxiliary deltas are ignored.
                    _ => {}
                }
                Ok(None)
            }
            "content_block_stop" => {
                let index = block_index(&payload)?;
                let block = self
                    .blocks
                    .get_mut(index)
                    .ok_or_else(|| LlmError::Stream(format!("stop for unknown block {index}")))?;
                let part = match std::mem::replace(block, PendingBlock::Done) {
                    PendingBlock::Text(text) => ContentPart::Text { text },
                    PendingBlock::Thinking(thinking) => ContentPart::Thinking { thinking },
                    PendingBlock::ToolUse { id, name, json } => {
                        let args = if json.trim().is_empty() {
                            serde_json::json!({})
                        } else {
                            serde_json::from_str(&json).map_err(|error| {
                                LlmError::Stream(format!("tool_use args for {name}: {error}"))
                            })?
                        };
                        ContentPart::ToolUse { id, name, args }
                    }
                    PendingBlock::Done => {
                        return Err(LlmError::Stream(format!("block {index} stopped twice")));
                    }
                };
                Ok(Some(part))
            }
            "message_delta" => {
                if let Some(reason) = payload["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(map_stop_reason(reason));
                }
                if let Some(output) = payload["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = output;
                }
                Ok(None)
            }
            "error" => Err(LlmError::Stream(
                payload["error"]["message"]
                    .as_str()
                    .unwrap_or("provider reported an error")
                    .to_string(),
            )),
            // message_stop / ping carry nothing we need.
            _ => Ok(None),
        }
    }
}

fn block_index(payload: &serde_json::Value) -> Result<usize, LlmError> {
    payload["index"]
        .as_u64()
        .map(|index| index as usize)
        .ok_or_else(|| LlmError::Stream("frame missing block index".into()))
}

/// `tool_use` still means the message ended cleanly; the runner checks for
/// pending tool calls itself.
fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "max_tokens" => StopReason::MaxTokens,
        _ => StopReason::Stop,
    }
}
