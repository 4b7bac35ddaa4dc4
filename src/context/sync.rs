//! Log→context sync, run at the start of every turn.

use crate::context::{ContextEntry, ContextManager};
use crate::error::Result;
use crate::store::log::parse_ts;
use crate::store::{ChannelStore, LogEntry};

impl ContextManager {
    /// Reflect log entries into the context log.
    ///
    /// Appends a `user_message` for every log entry with
    /// `entry.ts < trigger_ts` not already reflected (bot-authored entries
    /// as their textual representation). Idempotent: "already reflected" is
    /// recomputed from the source `ts` each mirrored entry carries, so a
    /// second run with no new log entries appends nothing. Membership is a
    /// set test because a message logged mid-turn is older than the bot
    /// reply recorded after it.
    pub fn sync_from_log(&mut self, store: &ChannelStore, trigger_ts: &str) -> Result<usize> {
        let reflected = self.reflected_ts();
        let upper = parse_ts(trigger_ts);

        let mut appended = 0;
        for entry in store.read_log()? {
            if entry.ts_value() >= upper || reflected.contains(entry.ts.as_str()) {
                continue;
            }
            self.append(user_message_for(&entry))?;
            appended += 1;
        }

        if appended > 0 {
            tracing::debug!(
                channel_id = %store.channel_id(),
                appended,
                "synced log entries into context"
            );
        }
        Ok(appended)
    }
}

fn user_message_for(entry: &LogEntry) -> ContextEntry {
    let who = entry.user_name.as_deref().unwrap_or(&entry.user);
    let text = if entry.is_bot {
        format!("[bot] {}", entry.text)
    } else {
        format!("{}: {}", who, entry.text)
    };
    let images = entry
        .attachments
        .iter()
        .map(|a| a.local_path.clone())
        .collect();
    ContextEntry::UserMessage {
        text,
        images,
        ts: Some(entry.ts.clone()),
    }
}
