//! Streaming Anthropic Messages client.

use crate::config::AnthropicCredential;
use crate::context::{ContentPart, StopReason, Usage};
use crate::error::LlmError;
use crate::llm::stream::{MessageAssembler, SseParser};
use crate::llm::{AssistantEvent, AssistantTurn, ChatRequest, CompletionClient};
use async_trait::async_trait;
use futures::StreamExt as _;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    credential: AnthropicCredential,
}

impl AnthropicClient {
    pub fn new(base_url: impl Into<String>, credential: AnthropicCredential) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            credential,
        }
    }

    /// `<base>/v1/messages`, tolerating a base that already carries the path.
    fn messages_url(&self) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        if trimmed.ends_with("/v1/messages") {
            trimmed.to_string()
        } else {
            format!("{trimmed}/v1/messages")
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json");
        match &self.credential {
            AnthropicCredential::ApiKey(key) => builder.header("x-api-key", key),
            AnthropicCredential::OAuthToken(token) => builder
                .bearer_auth(token)
                .header("anthropic-beta", OAUTH_BETA),
        }
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": request.messages,
            "stream": stream,
        });
        if !request.system.is_empty() {
            body["system"] = serde_json::json!(request.system);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request.tools);
        }
        body
    }

    /// POST with retry on transport-level failures (network, 429, 5xx).
    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, LlmError> {
        let mut last_error = LlmError::Transport("no attempts made".into());
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = BACKOFF_BASE * 2u32.pow(attempt - 1);
                tracing::debug!(attempt, ?delay, "retrying Anthropic request");
                tokio::time::sleep(delay).await;
            }

            let result = self
                .apply_auth(self.http.post(self.messages_url()))
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    let error = LlmError::Api { status, body };
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    last_error = error;
                }
                Err(error) => {
                    last_error = LlmError::Transport(error.to_string());
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn stream_turn(
        &self,
        request: ChatRequest,
        events: mpsc::Sender<AssistantEvent>,
        cancel: &CancellationToken,
    ) -> Result<AssistantTurn, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let body = self.body(&request, true);
        let response = self.send_with_retry(&body).await?;

        let mut byte_stream = response.bytes_stream();
        let mut parser = SseParser::default();
        let mut assembler = MessageAssembler::default();
        let mut parts: Vec<ContentPart> = Vec::new();
        let mut aborted = false;

        loop {
            let chunk = tokio::select! {
                chunk = byte_stream.next() => chunk,
                _ = cancel.cancelled() => {
                    // Dropping the stream closes the connection.
                    aborted = true;
                    break;
                }
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk.map_err(|error| LlmError::Transport(error.to_string()))?;

            for frame in parser.push(&bytes) {
                if let Some(part) = assembler.consume(&frame)? {
                    let event = match &part {
                        ContentPart::Text { text } => AssistantEvent::Text(text.clone()),
                        ContentPart::Thinking { thinking } => {
                            AssistantEvent::Thinking(thinking.clone())
                        }
                        ContentPart::ToolUse { id, name, args } => AssistantEvent::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            args: args.clone(),
                        },
                    };
                    let _ = events.send(event).await;
                    parts.push(part);
                }
            }
        }

        let stop_reason = if aborted {
            StopReason::Aborted
        } else {
            assembler.stop_reason.unwrap_or(StopReason::Stop)
        };

        Ok(AssistantTurn {
            parts,
            stop_reason,
            usage: assembler.usage,
        })
    }

    async fn complete_text(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: model.to_string(),
            system: system.to_string(),
            messages: vec![serde_json::json!({
                "role": "user",
                "content": [{"type": "text", "text": user}],
            })],
            tools: Vec::new(),
            max_tokens: 4096,
        };

        let body = self.body(&request, false);
        let response = self.send_with_retry(&body).await?;
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|error| LlmError::Transport(error.to_string()))?;

        let mut text = String::new();
        for block in payload["content"].as_array().into_iter().flatten() {
            if block["type"] == "text" {
                text.push_str(block["text"].as_str().unwrap_or_default());
            }
        }
        Ok(text)
    }
}

/// Usage line for the end-of-turn thread summary.
pub fn format_usage(usage: &Usage) -> String {
    format!(
        "tokens: {} in / {} out",
        usage.input_tokens, usage.output_tokens
    )
}
