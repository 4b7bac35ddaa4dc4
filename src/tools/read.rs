//! read tool: line-addressed file reads.

use crate::tools::{ToolContext, ToolOutcome};
use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadArgs {
    /// Short human-readable description shown while the file is read.
    pub label: String,
    /// File path, absolute or relative to the channel scratch directory.
    pub path: String,
    /// Lines to skip from the start of the file.
    pub offset: Option<usize>,
    /// Maximum number of lines to return.
    pub limit: Option<usize>,
}

pub async fn run(context: &ToolContext<'_>, args: ReadArgs) -> ToolOutcome {
    let path = context.resolve(&args.path);
    let bytes = match context.sandbox.read_file(&path).await {
        Ok(bytes) => bytes,
        Err(error) => return ToolOutcome::error(error.to_string()),
    };
    let content = String::from_utf8_lossy(&bytes);

    let offset = args.offset.unwrap_or(0);
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    if offset >= total && total > 0 {
        return ToolOutcome::error(format!("offset {offset} past end of file ({total} lines)"));
    }
    let end = match args.limit {
        Some(limit) => (offset + limit).min(total),
        None => total,
    };

    let slice = lines[offset..end].join("\n");
    let text = if offset > 0 || end < total {
        format!("[lines {}-{} of {}]\n{}", offset + 1, end, total, slice)
    } else {
        slice
    };
    ToolOutcome::ok(text)
}
