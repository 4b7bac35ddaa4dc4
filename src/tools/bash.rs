//! bash tool: shell execution via the sandbox.

use crate::sandbox::ExecRequest;
use crate::tools::{ToolContext, ToolOutcome};
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BashArgs {
    /// Short human-readable description shown while the command runs.
    pub label: String,
    /// Shell command to execute.
    pub command: String,
    /// Working directory; defaults to the channel's scratch directory.
    pub cwd: Option<String>,
    /// Timeout in seconds.
    pub timeout: Option<u64>,
}

pub async fn run(context: &ToolContext<'_>, args: BashArgs) -> ToolOutcome {
    let cwd = args
        .cwd
        .map(PathBuf::from)
        .unwrap_or_else(|| context.default_cwd());
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(context.default_timeout);

    let request = ExecRequest::new(&args.command, cwd)
        .with_timeout(timeout)
        .with_cancel(context.cancel.clone());

    let outcome = match context.sandbox.exec(request).await {
        Ok(outcome) => outcome,
        Err(error) => return ToolOutcome::error(format!("exec failed: {error}")),
    };

    let mut text = format!("Exit code: {}", outcome.exit_code);
    if outcome.timed_out {
        text.push_str(&format!(" (timed out after {}s)", timeout.as_secs()));
    }
    if outcome.cancelled {
        text.push_str(" (cancelled)");
    }
    if outcome.truncated {
        text.push_str("\n[output truncated to the most recent bytes]");
    }
    if !outcome.stdout.is_empty() {
        text.push_str("\n\nSTDOUT:\n");
        text.push_str(&outcome.stdout);
    }
    if !outcome.stderr.is_empty() {
        text.push_str("\n\nSTDERR:\n");
        text.push_str(&outcome.stderr);
    }

    ToolOutcome {
        text,
        is_error: outcome.exit_code != 0 || outcome.timed_out || outcome.cancelled,
    }
}

/// Duration rendering for the thread detail line ("(1.2s)").
pub fn format_duration(duration: Duration) -> String {
    format!("({:.1}s)", duration.as_secs_f64())
}
