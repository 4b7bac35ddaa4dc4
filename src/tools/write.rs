//! write tool: create or overwrite a file.

use crate::tools::{ToolContext, ToolOutcome};
use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WriteArgs {
    /// Short human-readable description shown while the file is written.
    pub label: String,
    /// File path, absolute or relative to the channel scratch directory.
    pub path: String,
    /// Full file content.
    pub content: String,
}

pub async fn run(context: &ToolContext<'_>, args: WriteArgs) -> ToolOutcome {
    let path = context.resolve(&args.path);
    match context
        .sandbox
        .write_file(&path, args.content.as_bytes())
        .await
    {
        Ok(()) => ToolOutcome::ok(format!(
            "wrote {} bytes to {}",
            args.content.len(),
            args.path
        )),
        Err(error) => ToolOutcome::error(error.to_string()),
    }
}
