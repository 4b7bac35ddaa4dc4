//! Chat transport interface and the per-turn ordered update queue.

pub mod queue;
pub mod slack;

pub use queue::{TurnQueue, TurnQueueHandle, UiUpdate};

use crate::error::ChatError;
use async_trait::async_trait;
use std::path::Path;

/// Opaque handle to a posted chat message (Slack `ts`).
pub type MessageHandle = String;

/// The outbound surface the runner and supervisor speak to.
///
/// One implementation talks to Slack; tests substitute a recorder.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn post_message(&self, channel_id: &str, text: &str)
    -> Result<MessageHandle, ChatError>;

    async fn update_message(
        &self,
        channel_id: &str,
        handle: &MessageHandle,
        text: &str,
    ) -> Result<(), ChatError>;

    async fn delete_message(
        &self,
        channel_id: &str,
        handle: &MessageHandle,
    ) -> Result<(), ChatError>;

    async fn post_in_thread(
        &self,
        channel_id: &str,
        main: &MessageHandle,
        text: &str,
    ) -> Result<MessageHandle, ChatError>;

    async fn upload_file(
        &self,
        channel_id: &str,
        host_path: &Path,
        title: Option<&str>,
    ) -> Result<(), ChatError>;
}
