//! The tools the agent can call.

pub mod attach;
pub mod bash;
pub mod edit;
pub mod read;
pub mod write;

use crate::chat::TurnQueueHandle;
use crate::llm::ToolDefinition;
use crate::sandbox::Sandbox;
use schemars::JsonSchema;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a tool hands back to the loop; `is_error` flows into the
/// `tool_result` context entry.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Everything a tool invocation needs, borrowed from the running turn.
pub struct ToolContext<'a> {
    pub sandbox: &'a Sandbox,
    pub workspace: &'a Path,
    pub channel_dir: &'a Path,
    pub queue: &'a TurnQueueHandle,
    pub cancel: &'a CancellationToken,
    pub default_timeout: Duration,
}

impl ToolContext<'_> {
    /// Default working directory for bash: the channel's scratch dir as the
    /// sandbox sees it.
    pub fn default_cwd(&self) -> PathBuf {
        let channel = self
            .channel_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.sandbox
            .workspace_path(self.workspace)
            .join(channel)
            .join("scratch")
    }

    /// Resolve an agent-supplied path to the host view for file IO.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            self.sandbox.resolve_for_io(path, self.workspace)
        } else {
            self.channel_dir.join("scratch").join(path)
        }
    }
}

/// Tool schemas advertised to the model, in a stable order.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        definition::<bash::BashArgs>(
            "bash",
            "Run a shell command in the sandbox. Returns exit code, stdout, and stderr.",
        ),
        definition::<read::ReadArgs>(
            "read",
            "Read a text file, optionally a line-addressed slice of it.",
        ),
        definition::<write::WriteArgs>("write", "Create or overwrite a file with the given content."),
        definition::<edit::EditArgs>(
            "edit",
            "Replace text in a file. The old text must occur exactly once.",
        ),
        definition::<attach::AttachArgs>(
            "attach",
            "Upload a file from the workspace into the chat channel.",
        ),
    ]
}

fn definition<T: JsonSchema>(name: &str, description: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default(),
    }
}

/// Parse args and run the named tool. Schema mismatches and unknown names
/// are reported to the model, never propagated.
pub async fn dispatch(
    name: &str,
    args: &serde_json::Value,
    context: &ToolContext<'_>,
) -> ToolOutcome {
    match name {
        "bash" => run_parsed(args, |parsed| bash::run(context, parsed)).await,
        "read" => run_parsed(args, |parsed| read::run(context, parsed)).await,
        "write" => run_parsed(args, |parsed| write::run(context, parsed)).await,
        "edit" => run_parsed(args, |parsed| edit::run(context, parsed)).await,
        "attach" => run_parsed(args, |parsed| attach::run(context, parsed)).await,
        other => ToolOutcome::error(format!("unknown tool: {other}")),
    }
}

async fn run_parsed<A, F, Fut>(args: &serde_json::Value, run: F) -> ToolOutcome
where
    A: serde::de::DeserializeOwned,
    F: FnOnce(A) -> Fut,
    Fut: std::future::Future<Output = ToolOutcome>,
{
    match serde_json::from_value::<A>(args.clone()) {
        Ok(parsed) => run(parsed).await,
        Err(error) => ToolOutcome::error(format!("invalid tool input: {error}")),
    }
}

/// The label every tool carries for the streaming status line.
pub fn label_of(args: &serde_json::Value) -> String {
    args.get("label")
        .and_then(|value| value.as_str())
        .unwrap_or("working")
        .to_string()
}
