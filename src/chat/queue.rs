//! Per-turn FIFO queue serialising every chat-transport call for one turn.
//!
//! Streamed assistant text, tool lifecycle events, and the usage summary
//! all produce UI intentions concurrently; pushing them through one queue
//! with a single consumer is what makes the user see a coherent narrative.
//! An error in one queued call never blocks the calls behind it.

use crate::chat::{ChatTransport, MessageHandle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Placeholder shown until the first real content arrives.
const PLACEHOLDER: &str = "Thinking…";

/// Suffix carried by the main message while the turn is working.
const WORKING_SUFFIX: &str = " ...";

/// One UI intention, applied in enqueue order.
#[derive(Debug, Clone)]
pub enum UiUpdate {
    /// Toggle the trailing working indicator on the main message.
    SetWorking(bool),
    /// Append a short status line ("→ <label>") to the main message.
    StatusLine(String),
    /// Replace the main message's accumulated status with final text.
    ReplaceMain(String),
    /// Delete the main message entirely (silent completion).
    DeleteMain,
    /// Post a message under the main message.
    Thread(String),
    /// Upload a host-visible file into the channel.
    Upload {
        host_path: PathBuf,
        title: Option<String>,
    },
}

/// Items travelling through the queue: updates, then one finish marker.
enum QueueItem {
    Update(UiUpdate),
    /// Close the queue; everything pushed earlier is applied first.
    Finish(tokio::sync::oneshot::Sender<MainMessage>),
}

/// Cloneable producer side of the turn queue.
#[derive(Clone)]
pub struct TurnQueueHandle {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl TurnQueueHandle {
    /// Enqueue an update. Ordering is the send order; a closed queue (turn
    /// already finalized) drops the update silently.
    pub fn push(&self, update: UiUpdate) {
        let _ = self.tx.send(QueueItem::Update(update));
    }
}

/// The queue itself; owns the consumer task.
pub struct TurnQueue {
    handle: TurnQueueHandle,
    consumer: tokio::task::JoinHandle<MainMessage>,
}

/// Final state of the main message after the queue drained.
#[derive(Debug, Clone, Default)]
pub struct MainMessage {
    pub handle: Option<MessageHandle>,
    pub deleted: bool,
}

struct Consumer {
    transport: Arc<dyn ChatTransport>,
    channel_id: String,
    main: Option<MessageHandle>,
    status_lines: Vec<String>,
    final_text: Option<String>,
    working: bool,
    deleted: bool,
}

impl TurnQueue {
    /// Start a queue for one turn. Updates apply strictly in push order;
    /// `finish` drains everything before returning.
    pub fn start(transport: Arc<dyn ChatTransport>, channel_id: impl Into<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueItem>();
        let mut consumer = Consumer {
            transport,
            channel_id: channel_id.into(),
            main: None,
            status_lines: Vec::new(),
            final_text: None,
            working: false,
            deleted: false,
        };

        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    QueueItem::Update(update) => consumer.apply(update).await,
                    QueueItem::Finish(reply) => {
                        rx.close();
                        let _ = reply.send(MainMessage {
                            handle: consumer.main.take(),
                            deleted: consumer.deleted,
                        });
                        break;
                    }
                }
            }
            MainMessage {
                handle: consumer.main.take(),
                deleted: consumer.deleted,
            }
        });

        Self {
            handle: TurnQueueHandle { tx },
            consumer: task,
        }
    }

    pub fn handle(&self) -> TurnQueueHandle {
        self.handle.clone()
    }

    /// Close the queue and wait for every queued call to complete. Updates
    /// pushed by stragglers after this are dropped.
    pub async fn finish(self) -> MainMessage {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        if self
            .handle
            .tx
            .send(QueueItem::Finish(reply_tx))
            .is_err()
        {
            return self.consumer.await.unwrap_or_default();
        }
        let main = reply_rx.await.unwrap_or_default();
        let _ = self.consumer.await;
        main
    }
}

impl Consumer {
    async fn apply(&mut self, update: UiUpdate) {
        match update {
            UiUpdate::SetWorking(working) => {
                self.working = working;
                self.render().await;
            }
            UiUpdate::StatusLine(line) => {
                self.status_lines.push(line);
                self.render().await;
            }
            UiUpdate::ReplaceMain(text) => {
                self.final_text = Some(text);
                self.render().await;
            }
            UiUpdate::DeleteMain => {
                if let Some(handle) = self.main.take() {
                    if let Err(error) = self
                        .transport
                        .delete_message(&self.channel_id, &handle)
                        .await
                    {
                        tracing::warn!(channel_id = %self.channel_id, %error, "delete_message failed");
                    }
                }
                self.deleted = true;
            }
            UiUpdate::Thread(text) => {
                let Some(main) = self.ensure_main().await else {
                    return;
                };
                if let Err(error) = self
                    .transport
                    .post_in_thread(&self.channel_id, &main, &text)
                    .await
                {
                    tracing::warn!(channel_id = %self.channel_id, %error, "post_in_thread failed");
                }
            }
            UiUpdate::Upload { host_path, title } => {
                if let Err(error) = self
                    .transport
                    .upload_file(&self.channel_id, &host_path, title.as_deref())
                    .await
                {
                    tracing::warn!(channel_id = %self.channel_id, %error, "upload_file failed");
                }
            }
        }
    }

    fn text(&self) -> String {
        let body = match (&self.final_text, self.status_lines.is_empty()) {
            (Some(final_text), _) => final_text.clone(),
            (None, true) => PLACEHOLDER.to_string(),
            (None, false) => self.status_lines.join("\n"),
        };
        if self.working {
            format!("{body}{WORKING_SUFFIX}")
        } else {
            body
        }
    }

    /// Edit the main message in place, posting it on first use.
    async fn render(&mut self) {
        if self.deleted {
            return;
        }
        let text = self.text();
        match &self.main {
            Some(handle) => {
                if let Err(error) = self
                    .transport
                    .update_message(&self.channel_id, handle, &text)
                    .await
                {
                    tracing::warn!(channel_id = %self.channel_id, %error, "update_message failed");
                }
            }
            None => match self.transport.post_message(&self.channel_id, &text).await {
                Ok(handle) => self.main = Some(handle),
                Err(error) => {
                    tracing::warn!(channel_id = %self.channel_id, %error, "post_message failed");
                }
            },
        }
    }

    async fn ensure_main(&mut self) -> Option<MessageHandle> {
        if self.main.is_none() && !self.deleted {
            self.render().await;
        }
        self.main.clone()
    }
}
