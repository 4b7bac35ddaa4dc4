//! Per-channel directory layout, message log, attachments, and memory.

pub mod log;

pub use log::{LogAttachment, LogEntry};

use crate::error::{Result, StoreError};
use crate::{ChannelId, InboundAttachment};
use std::path::{Path, PathBuf};

/// Global + channel memory, captured once at the start of a turn and held
/// immutable for its duration.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    pub global: String,
    pub channel: String,
}

/// Owns one channel's directory under the workspace.
///
/// The supervisor serialises all writes; nothing here locks.
#[derive(Debug, Clone)]
pub struct ChannelStore {
    channel_id: ChannelId,
    workspace: PathBuf,
    dir: PathBuf,
}

impl ChannelStore {
    /// Open (and lazily create) the channel's directory layout.
    pub fn open(workspace: &Path, channel_id: ChannelId) -> Result<Self> {
        let dir = workspace.join(channel_id.as_ref());
        std::fs::create_dir_all(dir.join("attachments")).map_err(StoreError::Io)?;
        std::fs::create_dir_all(dir.join("scratch")).map_err(StoreError::Io)?;
        Ok(Self {
            channel_id,
            workspace: workspace.to_path_buf(),
            dir,
        })
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    pub fn context_path(&self) -> PathBuf {
        self.dir.join("context.jsonl")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.join("scratch")
    }

    /// Append one entry to `log.jsonl` (single write + fsync).
    pub fn append_log(&self, entry: &LogEntry) -> Result<()> {
        log::append_entry(&self.log_path(), entry)?;
        Ok(())
    }

    /// All log entries, corrupt lines skipped.
    pub fn read_log(&self) -> Result<Vec<LogEntry>> {
        Ok(log::read_entries(&self.log_path())?)
    }

    /// Last `n` log entries formatted as tab-separated
    /// `(date, user, text, comma-joined attachment paths)` for the prompt.
    pub fn recent_messages(&self, n: usize) -> Result<String> {
        let entries = self.read_log()?;
        let start = entries.len().saturating_sub(n);
        let mut out = String::new();
        for entry in &entries[start..] {
            let attachments = entry
                .attachments
                .iter()
                .map(|a| a.local_path.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let user = entry.user_name.as_deref().unwrap_or(&entry.user);
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\n",
                entry.date.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                user,
                entry.text.replace('\n', " "),
                attachments
            ));
        }
        Ok(out)
    }

    /// Download inbound attachments into `attachments/`, named by the chat
    /// service's stable file id plus the original extension. Partial
    /// downloads are removed; failures skip the attachment with a warning.
    pub async fn download_attachments(
        &self,
        http: &reqwest::Client,
        bot_token: &str,
        attachments: &[InboundAttachment],
    ) -> Vec<LogAttachment> {
        let mut downloaded = Vec::new();
        for attachment in attachments {
            match self.download_one(http, bot_token, attachment).await {
                Ok(local_path) => downloaded.push(LogAttachment { local_path }),
                Err(error) => {
                    tracing::warn!(
                        channel_id = %self.channel_id,
                        file_id = %attachment.file_id,
                        %error,
                        "attachment download failed"
                    );
                }
            }
        }
        downloaded
    }

    async fn download_one(
        &self,
        http: &reqwest::Client,
        bot_token: &str,
        attachment: &InboundAttachment,
    ) -> Result<String> {
        let extension = Path::new(&attachment.filename)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let relative = format!("attachments/{}{}", attachment.file_id, extension);
        let target = self.dir.join(&relative);

        let response = http
            .get(&attachment.url)
            .bearer_auth(bot_token)
            .send()
            .await
            .map_err(|error| StoreError::AttachmentDownload {
                url: attachment.url.clone(),
                reason: error.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(StoreError::AttachmentDownload {
                url: attachment.url.clone(),
                reason: format!("status {}", response.status()),
            }
            .into());
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(error) => {
                let _ = tokio::fs::remove_file(&target).await;
                return Err(StoreError::AttachmentDownload {
                    url: attachment.url.clone(),
                    reason: error.to_string(),
                }
                .into());
            }
        };

        if let Err(error) = tokio::fs::write(&target, &bytes).await {
            let _ = tokio::fs::remove_file(&target).await;
            return Err(StoreError::Io(error).into());
        }
        Ok(relative)
    }

    /// Load global and channel `MEMORY.md`; missing files yield empty strings.
    pub fn read_memory(&self) -> MemorySnapshot {
        MemorySnapshot {
            global: read_optional(&self.workspace.join("MEMORY.md")),
            channel: read_optional(&self.dir.join("MEMORY.md")),
        }
    }
}

fn read_optional(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}
