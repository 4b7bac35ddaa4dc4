//! Agent loop: one turn from inbound trigger to runner exit.

pub mod runner;

pub use runner::AgentRunner;

use crate::chat::ChatTransport;
use crate::config::Config;
use crate::context::{StopReason, Usage};
use crate::llm::CompletionClient;
use crate::prompts::PromptEngine;
use crate::sandbox::Sandbox;
use std::sync::Arc;

/// Shared dependency bundle for runners and supervisors.
#[derive(Clone)]
pub struct AgentDeps {
    pub config: Arc<Config>,
    pub sandbox: Arc<Sandbox>,
    pub client: Arc<dyn CompletionClient>,
    pub transport: Arc<dyn ChatTransport>,
    pub prompts: Arc<PromptEngine>,
    /// Shared HTTP client for attachment downloads.
    pub http: reqwest::Client,
}

/// What a finished turn reports back to the supervisor.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub stop_reason: StopReason,
    pub final_text: String,
    pub usage: Usage,
    /// True when silent completion deleted the main message.
    pub silent: bool,
}
