//! `log.jsonl` entry types and line-oriented IO.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::Path;

/// One attachment already downloaded into the channel's `attachments/` dir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAttachment {
    #[serde(rename = "localPath")]
    pub local_path: String,
}

/// One immutable line of the channel message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO 8601 wall-clock time with subsecond precision.
    pub date: chrono::DateTime<chrono::Utc>,
    /// Monotonic-orderable chat timestamp.
    pub ts: String,
    /// Sender user id, or the sentinel `"bot"`.
    pub user: String,
    #[serde(rename = "userName", skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<LogAttachment>,
    #[serde(rename = "isBot")]
    pub is_bot: bool,
}

impl LogEntry {
    /// Chat timestamps compare correctly as (seconds, fractional) pairs;
    /// zero-padded Slack `ts` strings also compare correctly as strings,
    /// but parse defensively in case of mixed precision.
    pub fn ts_value(&self) -> f64 {
        parse_ts(&self.ts)
    }
}

/// Parse a chat `ts` string to an orderable value. Unparseable input sorts
/// first rather than poisoning the ordering.
pub fn parse_ts(ts: &str) -> f64 {
    ts.parse::<f64>().unwrap_or(0.0)
}

/// Append one entry as a single `line + '\n'` write, then fsync.
pub fn append_entry(path: &Path, entry: &LogEntry) -> Result<(), StoreError> {
    let mut line = serde_json::to_string(entry)
        .map_err(|error| StoreError::Other(anyhow::anyhow!("serialize log entry: {error}")))?;
    line.push('\n');

    let map_io = |source: std::io::Error| StoreError::Append {
        path: path.display().to_string(),
        source,
    };

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(map_io)?;
    file.write_all(line.as_bytes()).map_err(map_io)?;
    file.sync_all().map_err(map_io)?;
    Ok(())
}

/// Read all entries, skipping unparseable lines with a warning. A truncated
/// tail line (no trailing newline yet) is tolerated the same way.
pub fn read_entries(path: &Path) -> Result<Vec<LogEntry>, StoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(StoreError::Io(error)),
    };

    let mut entries = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    %error,
                    "skipping corrupt log line"
                );
            }
        }
    }
    Ok(entries)
}
