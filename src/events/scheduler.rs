//! Event scheduler: watches `<workspace>/events/` and fires events into
//! channel supervisors.
//!
//! Discovery is a directory scan, triggered by a filesystem watcher with a
//! polling fallback so a newly written file is picked up within a bounded
//! delay even where notifications are unreliable.

use crate::events::{Event, next_occurrence, parse_cron, parse_timezone};
use crate::{ChannelId, ChannelMessage};
use notify::Watcher as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Quarantine directory for unparseable event files.
const REJECTED_DIR: &str = ".rejected";

pub struct EventScheduler {
    events_dir: PathBuf,
    sink: mpsc::Sender<ChannelMessage>,
    poll_interval: Duration,
    scheduled: HashMap<String, ScheduledEvent>,
}

struct ScheduledEvent {
    fingerprint: Fingerprint,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ScheduledEvent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Cheap change detector: size + mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    mtime: Option<std::time::SystemTime>,
}

impl EventScheduler {
    pub fn new(
        events_dir: PathBuf,
        sink: mpsc::Sender<ChannelMessage>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            events_dir,
            sink,
            poll_interval,
            scheduled: HashMap::new(),
        }
    }

    /// Run until the process exits: scan, then rescan on watcher signal or
    /// poll tick.
    pub async fn run(mut self) {
        if let Err(error) = std::fs::create_dir_all(&self.events_dir) {
            tracing::error!(%error, dir = %self.events_dir.display(), "cannot create events dir");
            return;
        }

        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(1);
        let _watcher = match notify::recommended_watcher(move |result| {
            if let Ok(notify::Event { .. }) = result {
                let _ = notify_tx.try_send(());
            }
        }) {
            Ok(mut watcher) => {
                if let Err(error) =
                    watcher.watch(&self.events_dir, notify::RecursiveMode::NonRecursive)
                {
                    tracing::warn!(%error, "events watcher failed, falling back to polling only");
                }
                Some(watcher)
            }
            Err(error) => {
                tracing::warn!(%error, "no filesystem watcher available, polling only");
                None
            }
        };

        loop {
            self.scan().await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = notify_rx.recv() => {}
            }
        }
    }

    /// One pass over the events directory: schedule new/changed files,
    /// unschedule removed ones, quarantine malformed ones.
    pub async fn scan(&mut self) {
        let entries = match std::fs::read_dir(&self.events_dir) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(%error, "cannot read events dir");
                return;
            }
        };

        let mut seen = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(filename) = path.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            seen.push(filename.clone());

            let fingerprint = fingerprint_of(&path);
            if self
                .scheduled
                .get(&filename)
                .is_some_and(|existing| existing.fingerprint == fingerprint)
            {
                continue;
            }

            // New or rewritten file: (re)schedule from scratch.
            self.scheduled.remove(&filename);
            match load_event(&path) {
                Ok(event) => {
                    tracing::info!(file = %filename, kind = event.kind(), "event scheduled");
                    let task = self.spawn_firing(filename.clone(), path.clone(), event);
                    self.scheduled
                        .insert(filename, ScheduledEvent { fingerprint, task });
                }
                Err(reason) => {
                    tracing::warn!(file = %filename, %reason, "malformed event file, quarantining");
                    quarantine(&self.events_dir, &path, &reason);
                }
            }
        }

        // Files that vanished take their timers with them.
        self.scheduled.retain(|filename, _| {
            let keep = seen.contains(filename);
            if !keep {
                tracing::info!(file = %filename, "event file removed, unscheduled");
            }
            keep
        });
    }

    fn spawn_firing(
        &self,
        filename: String,
        path: PathBuf,
        event: Event,
    ) -> tokio::task::JoinHandle<()> {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            match &event {
                Event::Immediate { .. } => {
                    deliver(&sink, &event, &filename).await;
                    remove_fired(&path);
                }
                Event::OneShot { at, .. } => {
                    let wait = (at.with_timezone(&chrono::Utc) - chrono::Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                    deliver(&sink, &event, &filename).await;
                    remove_fired(&path);
                }
                Event::Periodic {
                    schedule, timezone, ..
                } => {
                    // validate() ran at load time; parse again for the loop.
                    let (Ok(schedule), Ok(timezone)) =
                        (parse_cron(schedule), parse_timezone(timezone))
                    else {
                        return;
                    };
                    loop {
                        let Some(next) =
                            next_occurrence(&schedule, timezone, chrono::Utc::now())
                        else {
                            tracing::warn!(file = %filename, "periodic event has no next occurrence");
                            return;
                        };
                        let wait = (next - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        tokio::time::sleep(wait).await;
                        deliver(&sink, &event, &filename).await;
                    }
                }
            }
        })
    }
}

fn fingerprint_of(path: &Path) -> Fingerprint {
    let metadata = std::fs::metadata(path).ok();
    Fingerprint {
        len: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
        mtime: metadata.and_then(|m| m.modified().ok()),
    }
}

fn load_event(path: &Path) -> Result<Event, String> {
    let raw = std::fs::read_to_string(path).map_err(|error| error.to_string())?;
    let event: Event = serde_json::from_str(&raw).map_err(|error| error.to_string())?;
    event.validate().map_err(|error| error.to_string())?;
    Ok(event)
}

/// Synthesise the chat message and hand it to the supervisor's inbound
/// queue. `immediate` and `one-shot` files are deleted right after this
/// (delivery, not turn completion, is the deletion point).
async fn deliver(sink: &mpsc::Sender<ChannelMessage>, event: &Event, filename: &str) {
    let message = ChannelMessage::for_event(
        ChannelId::from(event.channel_id()),
        event.message_text(filename),
    );
    if sink.send(message).await.is_err() {
        tracing::warn!(file = %filename, "event sink closed, firing dropped");
    } else {
        tracing::info!(file = %filename, kind = event.kind(), "event fired");
    }
}

fn remove_fired(path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        tracing::warn!(%error, path = %path.display(), "failed to delete fired event file");
    }
}

/// Move a malformed file into `events/.rejected/` with the parse error
/// appended, so the author can see what went wrong.
fn quarantine(events_dir: &Path, path: &Path, reason: &str) {
    let rejected = events_dir.join(REJECTED_DIR);
    if let Err(error) = std::fs::create_dir_all(&rejected) {
        tracing::warn!(%error, "cannot create rejected dir");
        return;
    }
    let Some(filename) = path.file_name() else {
        return;
    };

    let original = std::fs::read_to_string(path).unwrap_or_default();
    let annotated = format!("{original}\n\n# rejected: {reason}\n");
    let target = rejected.join(filename);
    if std::fs::write(&target, annotated).is_ok() {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Trigger;

    fn scheduler_for(
        dir: &Path,
    ) -> (EventScheduler, mpsc::Receiver<ChannelMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (
            EventScheduler::new(dir.to_path_buf(), tx, Duration::from_millis(50)),
            rx,
        )
    }

    #[tokio::test]
    async fn immediate_event_fires_and_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wake.json");
        std::fs::write(
            &path,
            r#"{"type":"immediate","channelId":"C1","text":"wake up"}"#,
        )
        .unwrap();

        let (mut scheduler, mut rx) = scheduler_for(dir.path());
        scheduler.scan().await;

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.channel_id.as_ref(), "C1");
        assert_eq!(message.text, "[EVENT:wake.json:immediate:-] wake up");
        assert_eq!(message.trigger, Trigger::Event);

        // Deleted after delivery to the supervisor.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn past_one_shot_fires_promptly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("late.json"),
            r#"{"type":"one-shot","channelId":"C1","text":"now","at":"2020-01-01T00:00:00+00:00"}"#,
        )
        .unwrap();

        let (mut scheduler, mut rx) = scheduler_for(dir.path());
        scheduler.scan().await;

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(message.text.starts_with("[EVENT:late.json:one-shot:"));
    }

    #[tokio::test]
    async fn malformed_file_is_quarantined_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, r#"{"type":"sometimes"}"#).unwrap();

        let (mut scheduler, _rx) = scheduler_for(dir.path());
        scheduler.scan().await;

        assert!(!path.exists());
        let moved = dir.path().join(".rejected/broken.json");
        let content = std::fs::read_to_string(&moved).unwrap();
        assert!(content.contains(r#"{"type":"sometimes"}"#));
        assert!(content.contains("# rejected:"));
    }

    #[tokio::test]
    async fn bad_cron_is_quarantined_not_scheduled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.json"),
            r#"{"type":"periodic","channelId":"C1","text":"x","schedule":"nope","timezone":"UTC"}"#,
        )
        .unwrap();

        let (mut scheduler, _rx) = scheduler_for(dir.path());
        scheduler.scan().await;
        assert!(dir.path().join(".rejected/bad.json").exists());
        assert!(scheduler.scheduled.is_empty());
    }

    #[tokio::test]
    async fn removed_file_unschedules_its_timer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("periodic.json");
        std::fs::write(
            &path,
            r#"{"type":"periodic","channelId":"C1","text":"tick","schedule":"0 9 * * *","timezone":"UTC"}"#,
        )
        .unwrap();

        let (mut scheduler, _rx) = scheduler_for(dir.path());
        scheduler.scan().await;
        assert_eq!(scheduler.scheduled.len(), 1);

        std::fs::remove_file(&path).unwrap();
        scheduler.scan().await;
        assert!(scheduler.scheduled.is_empty());
    }

    #[tokio::test]
    async fn rescans_are_idempotent_for_unchanged_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("periodic.json"),
            r#"{"type":"periodic","channelId":"C1","text":"tick","schedule":"0 9 * * *","timezone":"UTC"}"#,
        )
        .unwrap();

        let (mut scheduler, _rx) = scheduler_for(dir.path());
        scheduler.scan().await;
        assert_eq!(scheduler.scheduled.len(), 1);

        // An unchanged file keeps its timer: the task is still live after
        // another scan rather than having been aborted and replaced.
        scheduler.scan().await;
        assert_eq!(scheduler.scheduled.len(), 1);
        let entry = scheduler.scheduled.get("periodic.json").unwrap();
        assert!(!entry.task.is_finished());
    }
}
