//! edit tool: single-occurrence text replacement.

use crate::tools::{ToolContext, ToolOutcome};
use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EditArgs {
    /// Short human-readable description shown while the file is edited.
    pub label: String,
    /// File path, absolute or relative to the channel scratch directory.
    pub path: String,
    /// Text to replace; must occur exactly once in the file.
    pub old: String,
    /// Replacement text.
    pub new: String,
}

pub async fn run(context: &ToolContext<'_>, args: EditArgs) -> ToolOutcome {
    let path = context.resolve(&args.path);
    match context
        .sandbox
        .edit_file(&path, &args.old, &args.new, true)
        .await
    {
        Ok(()) => ToolOutcome::ok(format!("edited {}", args.path)),
        Err(error) => ToolOutcome::error(error.to_string()),
    }
}
