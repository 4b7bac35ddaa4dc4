//! The per-turn state machine: PREPARE → LOOP ⇄ TOOL_EXEC → FINALIZE.

use crate::agent::{AgentDeps, TurnReport};
use crate::chat::{TurnQueue, TurnQueueHandle, UiUpdate};
use crate::context::{ContentPart, ContextEntry, ContextManager, StopReason, Usage};
use crate::error::Result;
use crate::llm::anthropic::format_usage;
use crate::llm::{AssistantEvent, AssistantTurn, ChatRequest};
use crate::store::{ChannelStore, LogEntry};
use crate::tools::{self, ToolContext};
use crate::{BOT_USER, ChannelMessage, Trigger};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Sentinel reply that suppresses all output on event-triggered turns.
const SILENT: &str = "[SILENT]";

/// Upper bound on LLM ⇄ tool cycles per turn.
const MAX_CYCLES: usize = 32;

/// Max tokens requested per assistant message.
const MAX_OUTPUT_TOKENS: u32 = 16_000;

/// Runs exactly one turn for a channel. The supervisor guarantees at most
/// one live runner per channel and owns the cancellation token.
pub struct AgentRunner {
    deps: AgentDeps,
    cancel: CancellationToken,
}

impl AgentRunner {
    pub fn new(deps: AgentDeps, cancel: CancellationToken) -> Self {
        Self { deps, cancel }
    }

    /// Drive the turn to completion. Consumes the runner.
    #[tracing::instrument(skip_all, fields(channel_id = %store.channel_id()))]
    pub async fn run_turn(
        self,
        store: &ChannelStore,
        context: &mut ContextManager,
        message: &ChannelMessage,
    ) -> Result<TurnReport> {
        let queue = TurnQueue::start(
            self.deps.transport.clone(),
            store.channel_id().to_string(),
        );
        let handle = queue.handle();
        handle.push(UiUpdate::SetWorking(true));

        let outcome = self.drive(store, context, message, &handle).await;

        // The queue drains fully before FINALIZE returns.
        let main = queue.finish().await;

        let report = match outcome {
            Ok(mut report) => {
                report.silent = main.deleted;
                report
            }
            Err(error) => {
                tracing::error!(%error, "turn failed");
                TurnReport {
                    stop_reason: StopReason::Error,
                    final_text: String::new(),
                    usage: Usage::default(),
                    silent: false,
                }
            }
        };
        Ok(report)
    }

    async fn drive(
        &self,
        store: &ChannelStore,
        context: &mut ContextManager,
        message: &ChannelMessage,
        queue: &TurnQueueHandle,
    ) -> Result<TurnReport> {
        // Event-triggered turns may end `[SILENT]`, in which case the thread
        // must stay empty too, so their thread posts are buffered and only
        // flushed once the outcome is known.
        let threads = ThreadSink::new(queue.clone(), message.trigger == Trigger::Event);

        // PREPARE: bring the context log up to date, then record the trigger.
        context.sync_from_log(store, &message.ts)?;

        let system_prompt = self.build_system_prompt(store)?;
        let user_text = self.build_user_text(store, message)?;
        context.append(ContextEntry::UserMessage {
            text: user_text,
            images: message
                .attachments
                .iter()
                .map(|a| a.file_id.clone())
                .collect(),
            ts: Some(message.ts.clone()),
        })?;

        let tool_definitions = tools::definitions();
        let mut total_usage = Usage::default();
        let mut last_turn: Option<AssistantTurn> = None;
        let mut stop_reason = StopReason::Stop;

        // LOOP ⇄ TOOL_EXEC.
        for _cycle in 0..MAX_CYCLES {
            if self.cancel.is_cancelled() {
                stop_reason = StopReason::Aborted;
                break;
            }

            let (summary, tail) = context.active_window();
            let request = ChatRequest {
                model: self.deps.config.model.clone(),
                system: system_prompt.clone(),
                messages: crate::llm::messages_from_context(summary, tail),
                tools: tool_definitions.clone(),
                max_tokens: MAX_OUTPUT_TOKENS,
            };

            let turn = match self.stream_one_message(request, queue, &threads).await {
                Ok(turn) => turn,
                Err(crate::error::LlmError::Cancelled) => {
                    stop_reason = StopReason::Aborted;
                    break;
                }
                Err(error) => {
                    tracing::error!(%error, "LLM call failed");
                    threads.post(format!("error: {error}"));
                    stop_reason = StopReason::Error;
                    break;
                }
            };

            total_usage.add(turn.usage);
            let tool_uses: Vec<(String, String, serde_json::Value)> = turn
                .tool_uses()
                .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
                .collect();
            let has_tools = !tool_uses.is_empty();
            let message_stop = turn.stop_reason;

            // The final assistant message is stamped with the bot log
            // entry's ts so the next sync does not re-mirror the reply.
            let final_message = !has_tools || message_stop != StopReason::Stop;
            let log_ts = if final_message {
                self.record_bot_reply(store, message, &turn)?
            } else {
                None
            };

            context.append(ContextEntry::AssistantMessage {
                content: turn.parts.clone(),
                stop_reason: message_stop,
                usage: turn.usage,
                ts: log_ts,
            })?;

            // TOOL_EXEC: every tool_use gets exactly one tool_result before
            // the next LLM call.
            for (id, name, args) in &tool_uses {
                let outcome = if self.cancel.is_cancelled() {
                    stop_reason = StopReason::Aborted;
                    tools::ToolOutcome::error("cancelled")
                } else {
                    let started = Instant::now();
                    let outcome = self.run_tool(store, queue, name, args).await;
                    threads.post(format!(
                        "{name} {} {}\nargs: {args}\n{}",
                        tools::label_of(args),
                        crate::tools::bash::format_duration(started.elapsed()),
                        truncate_for_thread(&outcome.text),
                    ));
                    outcome
                };

                context.append(ContextEntry::ToolResult {
                    tool_use_id: id.clone(),
                    is_error: outcome.is_error,
                    content: vec![ContentPart::Text { text: outcome.text }],
                })?;
            }

            last_turn = Some(turn);

            if stop_reason == StopReason::Aborted {
                break;
            }
            if final_message {
                stop_reason = message_stop;
                break;
            }
        }

        // FINALIZE.
        let final_text = last_turn.as_ref().map(AssistantTurn::text).unwrap_or_default();
        let is_event = message.trigger == Trigger::Event;

        if is_event && final_text.trim() == SILENT {
            threads.discard();
            queue.push(UiUpdate::DeleteMain);
        } else {
            match stop_reason {
                StopReason::Error => {
                    queue.push(UiUpdate::ReplaceMain(
                        "something went wrong — details in the thread".into(),
                    ));
                }
                StopReason::Aborted => {}
                _ => {
                    if !final_text.is_empty() {
                        queue.push(UiUpdate::ReplaceMain(final_text.clone()));
                    }
                }
            }
            threads.flush();
            queue.push(UiUpdate::Thread(format_usage(&total_usage)));
        }
        queue.push(UiUpdate::SetWorking(false));

        Ok(TurnReport {
            stop_reason,
            final_text,
            usage: total_usage,
            silent: false,
        })
    }

    /// Stream one assistant message, forwarding part events to the queue in
    /// stream order.
    async fn stream_one_message(
        &self,
        request: ChatRequest,
        queue: &TurnQueueHandle,
        threads: &ThreadSink,
    ) -> std::result::Result<AssistantTurn, crate::error::LlmError> {
        let (events_tx, mut events_rx) = mpsc::channel::<AssistantEvent>(32);
        let forward_queue = queue.clone();
        let forward_threads = threads.clone();
        let forwarder = tokio::spawn(async move {
            let mut text_so_far = String::new();
            while let Some(event) = events_rx.recv().await {
                match event {
                    AssistantEvent::Text(text) => {
                        if !text_so_far.is_empty() {
                            text_so_far.push('\n');
                        }
                        text_so_far.push_str(&text);
                        forward_queue.push(UiUpdate::ReplaceMain(text_so_far.clone()));
                    }
                    AssistantEvent::Thinking(thinking) => {
                        forward_threads.post(format!("[thinking]\n{thinking}"));
                    }
                    AssistantEvent::ToolUse { args, .. } => {
                        forward_queue
                            .push(UiUpdate::StatusLine(format!("→ {}", tools::label_of(&args))));
                    }
                }
            }
        });

        let result = self
            .deps
            .client
            .stream_turn(request, events_tx, &self.cancel)
            .await;
        let _ = forwarder.await;
        result
    }

    async fn run_tool(
        &self,
        store: &ChannelStore,
        queue: &TurnQueueHandle,
        name: &str,
        args: &serde_json::Value,
    ) -> tools::ToolOutcome {
        let context = ToolContext {
            sandbox: &self.deps.sandbox,
            workspace: store.workspace(),
            channel_dir: store.dir(),
            queue,
            cancel: &self.cancel,
            default_timeout: std::time::Duration::from_secs(
                self.deps.config.limits.exec_default_timeout_secs,
            ),
        };
        tools::dispatch(name, args, &context).await
    }

    fn build_system_prompt(&self, store: &ChannelStore) -> Result<String> {
        let memory = store.read_memory();
        let mut memory_text = String::new();
        if !memory.global.is_empty() {
            memory_text.push_str(&memory.global);
        }
        if !memory.channel.is_empty() {
            if !memory_text.is_empty() {
                memory_text.push_str("\n\n");
            }
            memory_text.push_str(&memory.channel);
        }

        let now = chrono::Utc::now();
        self.deps
            .prompts
            .render_system(&crate::prompts::SystemPromptInputs {
                workspace_path: self
                    .deps
                    .sandbox
                    .workspace_path(store.workspace())
                    .display()
                    .to_string(),
                channel_id: store.channel_id().to_string(),
                sandbox: self.deps.config.sandbox.to_string(),
                current_date: now.format("%Y-%m-%d").to_string(),
                current_date_time: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                memory: memory_text,
                skills: crate::skills::discover(&self.deps.config.skills_dir()),
            })
    }

    /// Recent history rides on the user side of the prompt so the system
    /// prompt stays prefix-cacheable across turns.
    fn build_user_text(&self, store: &ChannelStore, message: &ChannelMessage) -> Result<String> {
        let recent = store.recent_messages(self.deps.config.limits.recent_messages)?;
        let who = message.user_name.as_deref().unwrap_or(&message.user);
        let text = if message.trigger == Trigger::Event {
            message.text.clone()
        } else {
            format!("{who}: {}", message.text)
        };
        if recent.is_empty() {
            Ok(text)
        } else {
            Ok(format!("[recent messages]\n{recent}\n{text}"))
        }
    }

    /// Append the assistant's reply to `log.jsonl` and return its `ts`.
    fn record_bot_reply(
        &self,
        store: &ChannelStore,
        message: &ChannelMessage,
        turn: &AssistantTurn,
    ) -> Result<Option<String>> {
        let text = turn.text();
        if text.is_empty() {
            return Ok(None);
        }
        if message.trigger == Trigger::Event && text.trim() == SILENT {
            return Ok(None);
        }

        let now = chrono::Utc::now();
        let ts = format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros());
        store.append_log(&LogEntry {
            date: now,
            ts: ts.clone(),
            user: BOT_USER.to_string(),
            user_name: None,
            text,
            attachments: vec![],
            is_bot: true,
        })?;
        Ok(Some(ts))
    }
}

/// Route for thread posts: straight to the queue on user turns, buffered on
/// event turns until the silent-or-not outcome is known.
#[derive(Clone)]
struct ThreadSink {
    queue: TurnQueueHandle,
    deferred: Option<std::sync::Arc<std::sync::Mutex<Vec<String>>>>,
}

impl ThreadSink {
    fn new(queue: TurnQueueHandle, defer: bool) -> Self {
        Self {
            queue,
            deferred: defer.then(|| std::sync::Arc::new(std::sync::Mutex::new(Vec::new()))),
        }
    }

    fn post(&self, text: String) {
        match &self.deferred {
            Some(buffer) => lock_unpoisoned(buffer).push(text),
            None => self.queue.push(UiUpdate::Thread(text)),
        }
    }

    /// Release buffered posts in their original order.
    fn flush(&self) {
        if let Some(buffer) = &self.deferred {
            for text in lock_unpoisoned(buffer).drain(..) {
                self.queue.push(UiUpdate::Thread(text));
            }
        }
    }

    fn discard(&self) {
        if let Some(buffer) = &self.deferred {
            lock_unpoisoned(buffer).clear();
        }
    }
}

fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Thread posts carry the full (already tail-truncated) tool result, but a
/// hard cap keeps a pathological result from flooding the chat API.
fn truncate_for_thread(text: &str) -> String {
    const MAX: usize = 4000;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut cut = MAX;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::queue::tests::RecordingTransport;
    use crate::config::{AnthropicCredential, Config, Limits, SandboxTarget};
    use crate::llm::{CompletionClient, ToolDefinition};
    use crate::prompts::PromptEngine;
    use crate::sandbox::Sandbox;
    use crate::{ChannelId, InboundAttachment};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted completion client: pops one canned response per LLM call.
    pub(crate) struct ScriptedClient {
        script: Mutex<VecDeque<std::result::Result<AssistantTurn, crate::error::LlmError>>>,
        /// When set, block until cancelled and resolve aborted.
        hang_until_cancel: bool,
    }

    impl ScriptedClient {
        pub fn new(
            script: Vec<std::result::Result<AssistantTurn, crate::error::LlmError>>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                hang_until_cancel: false,
            }
        }

        pub fn text(text: &str) -> Self {
            Self::new(vec![Ok(turn_with(vec![ContentPart::Text {
                text: text.into(),
            }]))])
        }

        pub fn hanging() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                hang_until_cancel: true,
            }
        }
    }

    pub(crate) fn turn_with(parts: Vec<ContentPart>) -> AssistantTurn {
        AssistantTurn {
            parts,
            stop_reason: StopReason::Stop,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn stream_turn(
            &self,
            _request: ChatRequest,
            events: mpsc::Sender<AssistantEvent>,
            cancel: &CancellationToken,
        ) -> std::result::Result<AssistantTurn, crate::error::LlmError> {
            if self.hang_until_cancel {
                cancel.cancelled().await;
                return Err(crate::error::LlmError::Cancelled);
            }
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(turn_with(vec![])));
            if let Ok(turn) = &next {
                for part in &turn.parts {
                    let event = match part {
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
                }
            }
            next
        }

        async fn complete_text(
            &self,
            _model: &str,
            _system: &str,
            _user: &str,
        ) -> std::result::Result<String, crate::error::LlmError> {
            Ok("summary".into())
        }
    }

    pub(crate) struct Fixture {
        pub workspace: tempfile::TempDir,
        pub store: ChannelStore,
        pub context: ContextManager,
        pub transport: Arc<RecordingTransport>,
        pub deps_template: (Arc<Config>, Arc<Sandbox>, Arc<PromptEngine>),
    }

    impl Fixture {
        pub fn new() -> Self {
            let workspace = tempfile::tempdir().unwrap();
            let store = ChannelStore::open(workspace.path(), ChannelId::from("C1")).unwrap();
            let context = ContextManager::open(&store).unwrap();
            let config = Arc::new(Config {
                workspace: workspace.path().to_path_buf(),
                sandbox: SandboxTarget::Host,
                slack_app_token: "xapp-test".into(),
                slack_bot_token: "xoxb-test".into(),
                anthropic: AnthropicCredential::ApiKey("sk-test".into()),
                anthropic_base_url: "https://api.anthropic.com".into(),
                model: "test-model".into(),
                limits: Limits::default(),
            });
            Self {
                workspace,
                store,
                context,
                transport: Arc::new(RecordingTransport::default()),
                deps_template: (
                    config,
                    Arc::new(Sandbox::new(SandboxTarget::Host, Limits::default())),
                    Arc::new(PromptEngine::new().unwrap()),
                ),
            }
        }

        pub fn deps(&self, client: Arc<dyn CompletionClient>) -> AgentDeps {
            AgentDeps {
                config: self.deps_template.0.clone(),
                sandbox: self.deps_template.1.clone(),
                client,
                transport: self.transport.clone(),
                prompts: self.deps_template.2.clone(),
                http: reqwest::Client::new(),
            }
        }

        pub fn message(&self, text: &str) -> ChannelMessage {
            ChannelMessage {
                channel_id: ChannelId::from("C1"),
                ts: "1732619040.123456".into(),
                user: "U123ABC".into(),
                user_name: Some("mario".into()),
                text: text.into(),
                attachments: Vec::<InboundAttachment>::new(),
                trigger: Trigger::User,
            }
        }

        pub fn event_message(&self, text: &str) -> ChannelMessage {
            let mut message = ChannelMessage::for_event(ChannelId::from("C1"), text.into());
            message.ts = "1732619050.000000".into();
            message
        }
    }

    fn tool_schemas_have_five_tools() -> Vec<ToolDefinition> {
        tools::definitions()
    }

    #[tokio::test]
    async fn basic_turn_appends_both_logs_and_replies() {
        let mut fixture = Fixture::new();
        fixture
            .store
            .append_log(&LogEntry {
                date: chrono::Utc::now(),
                ts: "1732619040.123456".into(),
                user: "U123ABC".into(),
                user_name: Some("mario".into()),
                text: "hello".into(),
                attachments: vec![],
                is_bot: false,
            })
            .unwrap();

        let deps = fixture.deps(Arc::new(ScriptedClient::text("Hi")));
        let runner = AgentRunner::new(deps, CancellationToken::new());
        let msg = fixture.message("hello");
        let report = runner
            .run_turn(&fixture.store, &mut fixture.context, &msg)
            .await
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Stop);
        assert_eq!(report.final_text, "Hi");

        // log.jsonl: user entry then bot entry, non-decreasing in ts.
        let log = fixture.store.read_log().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[1].is_bot);
        assert_eq!(log[1].text, "Hi");
        assert!(log[0].ts_value() <= log[1].ts_value());

        // context.jsonl: one user_message, one assistant_message.
        let entries = fixture.context.entries();
        assert!(matches!(entries[0], ContextEntry::UserMessage { .. }));
        assert!(matches!(entries[1], ContextEntry::AssistantMessage { .. }));
        assert_eq!(entries.len(), 2);

        // Final chat state: main message is "Hi"; the only thread message
        // is the usage summary.
        let calls = fixture.transport.calls();
        assert!(calls.iter().any(|call| call == "update[C1/ts-1] Hi"));
        let threads: Vec<_> = calls
            .iter()
            .filter(|call| call.starts_with("thread["))
            .collect();
        assert_eq!(threads.len(), 1);
        assert!(threads[0].contains("tokens: 10 in / 5 out"));
    }

    #[tokio::test]
    async fn tool_turn_preserves_ordering_and_pairing() {
        let mut fixture = Fixture::new();
        let client = ScriptedClient::new(vec![
            Ok(turn_with(vec![ContentPart::ToolUse {
                id: "tu_1".into(),
                name: "bash".into(),
                args: serde_json::json!({"command": "printf 42", "label": "count lines"}),
            }])),
            Ok(turn_with(vec![ContentPart::Text {
                text: "there are 42 lines".into(),
            }])),
        ]);

        let deps = fixture.deps(Arc::new(client));
        let runner = AgentRunner::new(deps, CancellationToken::new());
        let msg = fixture.message("count lines in log");
        let report = runner
            .run_turn(&fixture.store, &mut fixture.context, &msg)
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::Stop);

        // Context: user, assistant(tool_use), tool_result, assistant(text).
        let entries = fixture.context.entries();
        assert_eq!(entries.len(), 4);
        assert!(matches!(&entries[2], ContextEntry::ToolResult { tool_use_id, is_error, .. }
            if tool_use_id == "tu_1" && !is_error));

        // Chat ordering: working placeholder → status line → tool thread →
        // final replacement → usage thread → working indicator stripped.
        let calls = fixture.transport.calls();
        let position = |needle: &str| {
            calls
                .iter()
                .position(|call| call.contains(needle))
                .unwrap_or_else(|| panic!("missing {needle} in {calls:?}"))
        };
        assert!(position("Thinking…") < position("→ count lines"));
        assert!(position("→ count lines") < position("thread[C1/ts-1] bash"));
        assert!(position("thread[C1/ts-1] bash") < position("update[C1/ts-1] there are 42 lines"));
        assert!(
            position("update[C1/ts-1] there are 42 lines") < position("tokens: 20 in / 10 out")
        );
        // The last main-message update carries no working suffix.
        let last_update = calls
            .iter()
            .rev()
            .find(|call| call.starts_with("update["))
            .unwrap();
        assert!(!last_update.ends_with(" ..."));

        // Usage accumulated across both assistant messages.
        assert_eq!(report.usage.input_tokens, 20);
        assert_eq!(report.usage.output_tokens, 10);
        assert_eq!(tool_schemas_have_five_tools().len(), 5);
    }

    #[tokio::test]
    async fn silent_event_turn_deletes_main_and_posts_nothing() {
        let mut fixture = Fixture::new();
        // Even a turn with thinking and a tool call stays fully silent.
        let client = ScriptedClient::new(vec![
            Ok(turn_with(vec![
                ContentPart::Thinking {
                    thinking: "anything new?".into(),
                },
                ContentPart::ToolUse {
                    id: "tu_1".into(),
                    name: "bash".into(),
                    args: serde_json::json!({"command": "echo nothing", "label": "peek"}),
                },
            ])),
            Ok(turn_with(vec![ContentPart::Text {
                text: SILENT.into(),
            }])),
        ]);
        let deps = fixture.deps(Arc::new(client));
        let runner = AgentRunner::new(deps, CancellationToken::new());
        let msg = fixture.event_message("[EVENT:check.json:periodic:0 9 * * 1-5] check inbox");
        let report = runner
            .run_turn(&fixture.store, &mut fixture.context, &msg)
            .await
            .unwrap();

        assert!(report.silent);
        let calls = fixture.transport.calls();
        assert!(calls.iter().any(|call| call.starts_with("delete[")));
        assert!(!calls.iter().any(|call| call.starts_with("thread[")));
        // No bot entry lands in the log for a silent turn.
        assert!(fixture.store.read_log().unwrap().is_empty());
    }

    #[tokio::test]
    async fn silent_text_on_user_turn_is_delivered_normally() {
        let mut fixture = Fixture::new();
        let deps = fixture.deps(Arc::new(ScriptedClient::text(SILENT)));
        let runner = AgentRunner::new(deps, CancellationToken::new());
        let msg = fixture.message("hi");
        let report = runner
            .run_turn(&fixture.store, &mut fixture.context, &msg)
            .await
            .unwrap();
        assert!(!report.silent);
    }

    #[tokio::test]
    async fn cancelled_stream_aborts_the_turn() {
        let mut fixture = Fixture::new();
        let cancel = CancellationToken::new();
        let deps = fixture.deps(Arc::new(ScriptedClient::hanging()));
        let runner = AgentRunner::new(deps, cancel.clone());

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let msg = fixture.message("hi");
        let report = runner
            .run_turn(&fixture.store, &mut fixture.context, &msg)
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::Aborted);
    }

    #[tokio::test]
    async fn stop_mid_tool_kills_the_subprocess_and_pairs_the_tool_use() {
        let mut fixture = Fixture::new();
        let cancel = CancellationToken::new();

        let client = ScriptedClient::new(vec![Ok(turn_with(vec![ContentPart::ToolUse {
            id: "tu_1".into(),
            name: "bash".into(),
            args: serde_json::json!({"command": "sleep 30", "label": "slow"}),
        }]))]);
        let deps = fixture.deps(Arc::new(client));
        let runner = AgentRunner::new(deps, cancel.clone());

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            stopper.cancel();
        });

        let started = Instant::now();
        let msg = fixture.message("hi");
        let report = runner
            .run_turn(&fixture.store, &mut fixture.context, &msg)
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::Aborted);
        // The 30s sleep died within the kill grace, not at its own pace.
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        // No dangling tool_use without a result.
        for (index, entry) in fixture.context.entries().iter().enumerate() {
            if let ContextEntry::AssistantMessage { content, .. } = entry {
                for part in content {
                    if let ContentPart::ToolUse { id, .. } = part {
                        assert!(
                            fixture.context.entries()[index..].iter().any(|later| {
                                matches!(later, ContextEntry::ToolResult { tool_use_id, .. }
                                    if tool_use_id == id)
                            }),
                            "tool_use {id} has no tool_result"
                        );
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn transport_error_ends_turn_with_error_line() {
        let mut fixture = Fixture::new();
        let client = ScriptedClient::new(vec![Err(crate::error::LlmError::Api {
            status: 500,
            body: "oops".into(),
        })]);
        let deps = fixture.deps(Arc::new(client));
        let runner = AgentRunner::new(deps, CancellationToken::new());
        let msg = fixture.message("hi");
        let report = runner
            .run_turn(&fixture.store, &mut fixture.context, &msg)
            .await
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Error);
        let calls = fixture.transport.calls();
        assert!(calls.iter().any(|call| call.contains("something went wrong")));
        assert!(calls.iter().any(|call| call.contains("error: API returned 500")));
    }

    #[tokio::test]
    async fn tool_error_keeps_the_loop_alive() {
        let mut fixture = Fixture::new();
        let client = ScriptedClient::new(vec![
            Ok(turn_with(vec![ContentPart::ToolUse {
                id: "tu_1".into(),
                name: "read".into(),
                args: serde_json::json!({"path": "missing.txt", "label": "peek"}),
            }])),
            Ok(turn_with(vec![ContentPart::Text {
                text: "that file does not exist".into(),
            }])),
        ]);
        let deps = fixture.deps(Arc::new(client));
        let runner = AgentRunner::new(deps, CancellationToken::new());
        let msg = fixture.message("hi");
        let report = runner
            .run_turn(&fixture.store, &mut fixture.context, &msg)
            .await
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Stop);
        assert_eq!(report.final_text, "that file does not exist");
        assert!(fixture.context.entries().iter().any(|entry| {
            matches!(entry, ContextEntry::ToolResult { is_error: true, .. })
        }));
    }
}
