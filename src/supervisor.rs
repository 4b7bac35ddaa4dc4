//! Channel supervisor: serialises all work for one channel.
//!
//! Inputs are chat messages, stop requests, and event firings. Exactly one
//! runner is live at a time; chat messages arriving mid-turn are appended
//! to `log.jsonl` only, so the next turn's sync picks them up. Event
//! firings queue up to a small cap and run back to back once the current
//! turn exits.

use crate::agent::{AgentDeps, AgentRunner, TurnReport};
use crate::chat::MessageHandle;
use crate::context::{ContextManager, StopReason};
use crate::error::Result;
use crate::store::ChannelStore;
use crate::{ChannelCommand, ChannelId, ChannelMessage, Trigger};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Inbound queue depth per channel.
const COMMAND_BUFFER: usize = 64;

/// Runtime state readable from outside the supervisor task.
#[derive(Debug, Default)]
pub struct ChannelState {
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl ChannelState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Creates supervisors lazily and routes messages to them.
pub struct ChannelRegistry {
    deps: AgentDeps,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
}

struct ChannelEntry {
    tx: mpsc::Sender<ChannelCommand>,
    state: Arc<ChannelState>,
}

impl ChannelRegistry {
    pub fn new(deps: AgentDeps) -> Self {
        Self {
            deps,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Route one message, creating the channel supervisor on first contact.
    pub async fn dispatch(&self, message: ChannelMessage) -> Result<()> {
        let channel_id = message.channel_id.clone();
        let mut channels = self.channels.lock().await;
        let needs_spawn = match channels.get(&channel_id) {
            Some(entry) => entry.tx.is_closed(),
            None => true,
        };
        if needs_spawn {
            let entry = self.spawn_supervisor(channel_id.clone())?;
            channels.insert(channel_id.clone(), entry);
        }
        let entry = channels.get(&channel_id).expect("just ensured");

        // "stop" while a turn is running is a stop request, not a prompt.
        let command = if message.trigger == Trigger::User
            && entry.state.is_running()
            && message.text.trim().eq_ignore_ascii_case("stop")
        {
            ChannelCommand::Stop
        } else {
            ChannelCommand::Message(message)
        };

        entry
            .tx
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("channel {channel_id} supervisor is gone"))?;
        Ok(())
    }

    /// Snapshot of a channel's runtime state, if it exists yet.
    pub async fn state_of(&self, channel_id: &str) -> Option<Arc<ChannelState>> {
        self.channels
            .lock()
            .await
            .get(channel_id)
            .map(|entry| entry.state.clone())
    }

    fn spawn_supervisor(&self, channel_id: ChannelId) -> Result<ChannelEntry> {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let state = Arc::new(ChannelState::default());

        let supervisor = ChannelSupervisor::new(channel_id, self.deps.clone(), rx, state.clone())?;
        tokio::spawn(async move {
            supervisor.run().await;
        });

        Ok(ChannelEntry { tx, state })
    }
}

/// One supervisor task per channel.
pub struct ChannelSupervisor {
    channel_id: ChannelId,
    deps: AgentDeps,
    store: ChannelStore,
    rx: mpsc::Receiver<ChannelCommand>,
    state: Arc<ChannelState>,
    pending_events: VecDeque<ChannelMessage>,
    stop_message: Option<MessageHandle>,
}

/// What the runner task hands back: the context manager it borrowed plus
/// the turn's outcome.
type TurnTask = tokio::task::JoinHandle<(ContextManager, Result<TurnReport>)>;

struct ActiveTurn {
    task: TurnTask,
    cancel: CancellationToken,
}

impl ChannelSupervisor {
    fn new(
        channel_id: ChannelId,
        deps: AgentDeps,
        rx: mpsc::Receiver<ChannelCommand>,
        state: Arc<ChannelState>,
    ) -> Result<Self> {
        let store = ChannelStore::open(&deps.config.workspace, channel_id.clone())?;
        Ok(Self {
            channel_id,
            deps,
            store,
            rx,
            state,
            pending_events: VecDeque::new(),
            stop_message: None,
        })
    }

    /// The supervisor event loop. Ends when the inbound queue closes and no
    /// turn is running.
    pub async fn run(mut self) {
        tracing::info!(channel_id = %self.channel_id, "channel supervisor started");

        let mut context = match ContextManager::open(&self.store) {
            Ok(context) => Some(context),
            Err(error) => {
                tracing::error!(channel_id = %self.channel_id, %error, "failed to open context log");
                return;
            }
        };
        let mut active: Option<ActiveTurn> = None;
        let mut inbox_closed = false;

        loop {
            tokio::select! {
                command = self.rx.recv(), if !inbox_closed => {
                    match command {
                        Some(command) => {
                            self.handle_command(command, &mut context, &mut active).await;
                        }
                        None => inbox_closed = true,
                    }
                }
                joined = wait_turn(&mut active), if active.is_some() => {
                    active = None;
                    self.state.running.store(false, Ordering::Release);
                    let report = match joined {
                        Ok((returned_context, report)) => {
                            context = Some(returned_context);
                            report
                        }
                        Err(join_error) => {
                            tracing::error!(channel_id = %self.channel_id, %join_error, "turn task panicked");
                            // Reload from disk; the context file is append-only
                            // so the mirror is recoverable.
                            context = ContextManager::open(&self.store).ok();
                            Err(anyhow::anyhow!("turn task panicked").into())
                        }
                    };
                    self.after_turn(report, &mut context).await;

                    // Drain one queued event firing.
                    if let Some(event) = self.pending_events.pop_front() {
                        self.start_turn(event, &mut context, &mut active);
                    }
                }
                else => break,
            }

            if inbox_closed && active.is_none() && self.pending_events.is_empty() {
                break;
            }
        }

        tracing::info!(channel_id = %self.channel_id, "channel supervisor stopped");
    }

    async fn handle_command(
        &mut self,
        command: ChannelCommand,
        context: &mut Option<ContextManager>,
        active: &mut Option<ActiveTurn>,
    ) {
        match command {
            ChannelCommand::Message(message) => {
                if message.trigger == Trigger::User {
                    self.log_inbound(&message).await;
                }

                if active.is_some() {
                    match message.trigger {
                        // The next turn's sync picks the logged message up.
                        Trigger::User => {
                            tracing::debug!(
                                channel_id = %self.channel_id,
                                "turn in progress, message logged for next sync"
                            );
                        }
                        Trigger::Event => self.queue_event(message),
                    }
                } else {
                    self.start_turn(message, context, active);
                }
            }
            ChannelCommand::Stop => self.handle_stop(active).await,
        }
    }

    /// Download attachments and append the inbound message to `log.jsonl`.
    async fn log_inbound(&self, message: &ChannelMessage) {
        let attachments = if message.attachments.is_empty() {
            Vec::new()
        } else {
            self.store
                .download_attachments(
                    &self.deps.http,
                    &self.deps.config.slack_bot_token,
                    &message.attachments,
                )
                .await
        };

        let entry = crate::store::LogEntry {
            date: chrono::Utc::now(),
            ts: message.ts.clone(),
            user: message.user.clone(),
            user_name: message.user_name.clone(),
            text: message.text.clone(),
            attachments,
            is_bot: false,
        };
        if let Err(error) = self.store.append_log(&entry) {
            tracing::error!(channel_id = %self.channel_id, %error, "failed to append inbound message");
        }
    }

    fn queue_event(&mut self, message: ChannelMessage) {
        let cap = self.deps.config.limits.event_queue_cap;
        if self.pending_events.len() >= cap {
            tracing::warn!(
                channel_id = %self.channel_id,
                cap,
                "event queue full, dropping firing"
            );
            return;
        }
        self.pending_events.push_back(message);
    }

    fn start_turn(
        &mut self,
        message: ChannelMessage,
        context: &mut Option<ContextManager>,
        active: &mut Option<ActiveTurn>,
    ) {
        let Some(mut turn_context) = context.take() else {
            tracing::error!(channel_id = %self.channel_id, "context manager unavailable, dropping turn");
            return;
        };

        self.state.stop_requested.store(false, Ordering::Release);
        self.state.running.store(true, Ordering::Release);

        let cancel = CancellationToken::new();
        let runner = AgentRunner::new(self.deps.clone(), cancel.clone());
        let store = self.store.clone();

        let task = tokio::spawn(async move {
            let report = runner.run_turn(&store, &mut turn_context, &message).await;
            (turn_context, report)
        });

        *active = Some(ActiveTurn { task, cancel });
    }

    async fn handle_stop(&mut self, active: &mut Option<ActiveTurn>) {
        let Some(turn) = active.as_ref() else {
            tracing::debug!(channel_id = %self.channel_id, "stop requested with no turn running");
            return;
        };

        self.state.stop_requested.store(true, Ordering::Release);
        turn.cancel.cancel();

        match self
            .deps
            .transport
            .post_message(&self.channel_id, "Stopping…")
            .await
        {
            Ok(handle) => self.stop_message = Some(handle),
            Err(error) => {
                tracing::warn!(channel_id = %self.channel_id, %error, "failed to post stop notice");
            }
        }
    }

    async fn after_turn(&mut self, report: Result<TurnReport>, context: &mut Option<ContextManager>) {
        match report {
            Ok(report) => {
                if report.stop_reason == StopReason::Aborted {
                    if let Some(handle) = self.stop_message.take() {
                        if let Err(error) = self
                            .deps
                            .transport
                            .update_message(&self.channel_id, &handle, "Stopped")
                            .await
                        {
                            tracing::warn!(channel_id = %self.channel_id, %error, "failed to edit stop notice");
                        }
                    }
                }
                tracing::info!(
                    channel_id = %self.channel_id,
                    stop_reason = ?report.stop_reason,
                    input_tokens = report.usage.input_tokens,
                    output_tokens = report.usage.output_tokens,
                    "turn finished"
                );
            }
            Err(error) => {
                tracing::error!(channel_id = %self.channel_id, %error, "turn failed");
                let _ = self
                    .deps
                    .transport
                    .post_message(&self.channel_id, "internal error — see server logs")
                    .await;
            }
        }

        // Compaction runs between turns, where the context is owned here.
        if let Some(manager) = context.as_mut() {
            if let Err(error) = manager
                .compact_if_needed(
                    self.deps.client.as_ref(),
                    &self.deps.config.model,
                    &self.deps.prompts,
                    &self.deps.config.limits,
                )
                .await
            {
                tracing::warn!(channel_id = %self.channel_id, %error, "compaction check failed");
            }
        }
    }
}

async fn wait_turn(
    active: &mut Option<ActiveTurn>,
) -> std::result::Result<(ContextManager, Result<TurnReport>), tokio::task::JoinError> {
    match active.as_mut() {
        Some(turn) => (&mut turn.task).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::queue::tests::RecordingTransport;
    use crate::config::{AnthropicCredential, Config, Limits, SandboxTarget};
    use crate::context::{ContentPart, StopReason as SR, Usage};
    use crate::llm::{AssistantEvent, AssistantTurn, ChatRequest, CompletionClient};
    use crate::prompts::PromptEngine;
    use crate::sandbox::Sandbox;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Returns "ok" after a fixed delay; counts calls.
    struct DelayClient {
        delay: Duration,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl DelayClient {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for DelayClient {
        async fn stream_turn(
            &self,
            _request: ChatRequest,
            _events: mpsc::Sender<AssistantEvent>,
            cancel: &CancellationToken,
        ) -> std::result::Result<AssistantTurn, crate::error::LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(crate::error::LlmError::Cancelled),
            }
            Ok(AssistantTurn {
                parts: vec![ContentPart::Text { text: "ok".into() }],
                stop_reason: SR::Stop,
                usage: Usage::default(),
            })
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

    struct Harness {
        _workspace: tempfile::TempDir,
        registry: ChannelRegistry,
        transport: Arc<RecordingTransport>,
    }

    fn harness(client: Arc<dyn CompletionClient>) -> Harness {
        let workspace = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
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
        let deps = AgentDeps {
            config,
            sandbox: Arc::new(Sandbox::new(SandboxTarget::Host, Limits::default())),
            client,
            transport: transport.clone(),
            prompts: Arc::new(PromptEngine::new().unwrap()),
            http: reqwest::Client::new(),
        };
        Harness {
            _workspace: workspace,
            registry: ChannelRegistry::new(deps),
            transport,
        }
    }

    fn message(ts: &str, text: &str) -> ChannelMessage {
        ChannelMessage {
            channel_id: ChannelId::from("C1"),
            ts: ts.into(),
            user: "U1".into(),
            user_name: Some("mario".into()),
            text: text.into(),
            attachments: vec![],
            trigger: Trigger::User,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(700)).await;
    }

    #[tokio::test]
    async fn mid_turn_messages_are_logged_but_not_run() {
        let client = Arc::new(DelayClient::new(Duration::from_millis(300)));
        let harness = harness(client.clone());

        // Realistic epoch ts values keep the log monotonic alongside the
        // wall-clock ts the bot reply is recorded under.
        harness
            .registry
            .dispatch(message("1754000000.000100", "first"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness
            .registry
            .dispatch(message("1754000000.000200", "second"))
            .await
            .unwrap();
        settle().await;

        // One turn only; the second message waits for the next trigger.
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        // But it was logged, and a later trigger syncs it into context.
        harness
            .registry
            .dispatch(message("9999999999.000000", "third"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);

        let context_raw = std::fs::read_to_string(
            harness._workspace.path().join("C1/context.jsonl"),
        )
        .unwrap();
        assert!(
            context_raw.contains("second"),
            "mid-turn message reached context via sync: {context_raw}"
        );
    }

    #[tokio::test]
    async fn single_runner_per_channel_state_flag() {
        let client = Arc::new(DelayClient::new(Duration::from_millis(300)));
        let harness = harness(client);

        harness.registry.dispatch(message("1.0", "go")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = harness.registry.state_of("C1").await.unwrap();
        assert!(state.is_running());

        settle().await;
        assert!(!state.is_running());
    }

    #[tokio::test]
    async fn stop_aborts_and_edits_the_notice() {
        let client = Arc::new(DelayClient::new(Duration::from_secs(30)));
        let harness = harness(client);

        harness.registry.dispatch(message("1.0", "long task")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.registry.dispatch(message("2.0", "stop")).await.unwrap();
        settle().await;

        let calls = harness.transport.calls();
        let stop_post = calls
            .iter()
            .position(|call| call.contains("Stopping…"))
            .expect("stop notice posted");
        assert!(
            calls[stop_post..]
                .iter()
                .any(|call| call.starts_with("update[") && call.ends_with("Stopped")),
            "stop notice edited to Stopped: {calls:?}"
        );

        let state = harness.registry.state_of("C1").await.unwrap();
        assert!(!state.is_running());
    }

    #[tokio::test]
    async fn event_firings_queue_to_the_cap() {
        let client = Arc::new(DelayClient::new(Duration::from_millis(400)));
        let harness = harness(client.clone());

        harness.registry.dispatch(message("1.0", "busy")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 0..7 {
            let event = ChannelMessage::for_event(
                ChannelId::from("C1"),
                format!("[EVENT:e{i}.json:immediate:-] ping"),
            );
            harness.registry.dispatch(event).await.unwrap();
        }

        // 1 user turn + 5 queued events; the 2 extra firings were dropped.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let client = Arc::new(DelayClient::new(Duration::from_millis(100)));
        let harness = harness(client.clone());

        harness.registry.dispatch(message("1.0", "a")).await.unwrap();
        let mut other = message("1.0", "b");
        other.channel_id = ChannelId::from("C2");
        harness.registry.dispatch(other).await.unwrap();
        settle().await;

        // Both ran concurrently, one per channel.
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert!(harness.registry.state_of("C2").await.is_some());
    }
}
