//! attach tool: queue a file upload into the channel.

use crate::chat::UiUpdate;
use crate::tools::{ToolContext, ToolOutcome};
use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AttachArgs {
    /// Short human-readable description shown while the file uploads.
    pub label: String,
    /// File path, absolute or relative to the channel scratch directory.
    pub path: String,
    /// Optional title for the uploaded file.
    pub title: Option<String>,
}

/// The upload goes through the turn queue so it lands in stream order; in
/// docker mode the sandbox-visible path is translated to the host path the
/// chat layer can actually read.
pub async fn run(context: &ToolContext<'_>, args: AttachArgs) -> ToolOutcome {
    let host_path = context.resolve(&args.path);
    if !context.sandbox.path_exists(&host_path).await {
        return ToolOutcome::error(format!("no such file: {}", args.path));
    }

    context.queue.push(UiUpdate::Upload {
        host_path: host_path.clone(),
        title: args.title,
    });
    ToolOutcome::ok(format!("attached {}", args.path))
}
