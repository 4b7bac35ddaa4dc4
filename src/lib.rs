//! mom: a long-running Slack assistant harness with one stateful agent per channel.

pub mod agent;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod llm;
pub mod prompts;
pub mod sandbox;
pub mod skills;
pub mod store;
pub mod supervisor;
pub mod tools;

pub use error::{Error, Result};

use std::sync::Arc;

/// Channel identifier type.
pub type ChannelId = Arc<str>;

/// Sentinel user id for entries the bot itself authored.
pub const BOT_USER: &str = "bot";

/// What caused a turn: a human message or a scheduled event firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A human posted in the channel.
    User,
    /// An event file fired; `[SILENT]` handling applies to these turns.
    Event,
}

/// An inbound attachment as the chat service describes it, before download.
#[derive(Debug, Clone)]
pub struct InboundAttachment {
    /// Stable file id from the chat service.
    pub file_id: String,
    /// Original filename, used for its extension.
    pub filename: String,
    /// Authenticated download URL.
    pub url: String,
}

/// A message bound for a channel supervisor.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel_id: ChannelId,
    /// Monotonic-orderable chat timestamp (Slack `ts`).
    pub ts: String,
    /// Sender user id, or [`BOT_USER`].
    pub user: String,
    pub user_name: Option<String>,
    pub text: String,
    pub attachments: Vec<InboundAttachment>,
    pub trigger: Trigger,
}

impl ChannelMessage {
    /// Synthesise a message for an event firing. Event messages carry a
    /// fabricated `ts` from the current wall clock so log ordering holds.
    pub fn for_event(channel_id: ChannelId, text: String) -> Self {
        let now = chrono::Utc::now();
        Self {
            channel_id,
            ts: format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros()),
            user: BOT_USER.to_string(),
            user_name: None,
            text,
            attachments: Vec::new(),
            trigger: Trigger::Event,
        }
    }
}

/// Commands a supervisor accepts besides inbound messages.
#[derive(Debug)]
pub enum ChannelCommand {
    Message(ChannelMessage),
    /// Abort the current turn, if any.
    Stop,
}
