//! Scheduled events: on-disk schema and schedule math.

pub mod scheduler;

pub use scheduler::EventScheduler;

use crate::error::EventError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr as _;

/// One event file under `<workspace>/events/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Fires once, as soon as discovered.
    #[serde(rename = "immediate")]
    Immediate {
        #[serde(rename = "channelId")]
        channel_id: String,
        text: String,
    },
    /// Fires once at an absolute instant.
    #[serde(rename = "one-shot")]
    OneShot {
        #[serde(rename = "channelId")]
        channel_id: String,
        text: String,
        /// RFC3339 with an explicit offset.
        at: DateTime<chrono::FixedOffset>,
    },
    /// Fires on a cron schedule in an IANA timezone.
    #[serde(rename = "periodic")]
    Periodic {
        #[serde(rename = "channelId")]
        channel_id: String,
        text: String,
        /// Standard 5-field cron expression.
        schedule: String,
        /// IANA zone name (e.g. `Europe/Vienna`).
        timezone: String,
    },
}

impl Event {
    pub fn channel_id(&self) -> &str {
        match self {
            Event::Immediate { channel_id, .. }
            | Event::OneShot { channel_id, .. }
            | Event::Periodic { channel_id, .. } => channel_id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Event::Immediate { text, .. }
            | Event::OneShot { text, .. }
            | Event::Periodic { text, .. } => text,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Immediate { .. } => "immediate",
            Event::OneShot { .. } => "one-shot",
            Event::Periodic { .. } => "periodic",
        }
    }

    /// The schedule slot of the synthesised message text.
    pub fn schedule_display(&self) -> String {
        match self {
            Event::Immediate { .. } => "-".to_string(),
            Event::OneShot { at, .. } => at.to_rfc3339(),
            Event::Periodic { schedule, .. } => schedule.clone(),
        }
    }

    /// The text delivered to the channel supervisor at fire time.
    pub fn message_text(&self, filename: &str) -> String {
        format!(
            "[EVENT:{}:{}:{}] {}",
            filename,
            self.kind(),
            self.schedule_display(),
            self.text()
        )
    }

    /// Validate schedule fields beyond what serde can check.
    pub fn validate(&self) -> Result<(), EventError> {
        if let Event::Periodic {
            schedule, timezone, ..
        } = self
        {
            parse_timezone(timezone)?;
            parse_cron(schedule)?;
        }
        Ok(())
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, EventError> {
    name.parse::<Tz>()
        .map_err(|_| EventError::BadTimezone(name.to_string()))
}

/// Parse a 5-field cron expression. The `cron` crate wants a seconds field,
/// so a conventional 5-field expression gets `0` prepended.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, EventError> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|error| EventError::BadSchedule {
        schedule: expression.to_string(),
        reason: error.to_string(),
    })
}

/// Next firing of `schedule` in `timezone`, strictly after `after`.
pub fn next_occurrence(
    schedule: &cron::Schedule,
    timezone: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&timezone))
        .next()
        .map(|local| local.with_timezone(&Utc))
}
