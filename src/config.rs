//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use std::path::{Path, PathBuf};

/// Default model when `MOM_MODEL` is unset.
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// mom runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace root directory (channel dirs, events/, MEMORY.md live here).
    pub workspace: PathBuf,

    /// Sandbox backend for tool execution.
    pub sandbox: SandboxTarget,

    /// Slack app-level token (Socket Mode).
    pub slack_app_token: String,

    /// Slack bot token (Web API).
    pub slack_bot_token: String,

    /// Anthropic credential.
    pub anthropic: AnthropicCredential,

    /// Anthropic API base URL.
    pub anthropic_base_url: String,

    /// Model identity passed through to the API.
    pub model: String,

    /// Tunables for logs, context, and events.
    pub limits: Limits,
}

/// Where tool commands run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxTarget {
    /// Directly on the host filesystem.
    Host,
    /// Inside a pre-existing running container.
    Docker { container: String },
}

impl SandboxTarget {
    /// Parse `host` or `docker:<name>`.
    pub fn parse(value: &str) -> Result<Self> {
        if value == "host" {
            return Ok(SandboxTarget::Host);
        }
        if let Some(name) = value.strip_prefix("docker:") {
            if !name.is_empty() {
                return Ok(SandboxTarget::Docker {
                    container: name.to_string(),
                });
            }
        }
        Err(ConfigError::InvalidSandboxTarget(value.to_string()).into())
    }
}

impl std::fmt::Display for SandboxTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxTarget::Host => write!(f, "host"),
            SandboxTarget::Docker { container } => write!(f, "docker:{container}"),
        }
    }
}

/// Exactly one credential form is accepted.
#[derive(Debug, Clone)]
pub enum AnthropicCredential {
    /// `ANTHROPIC_API_KEY`, sent as `x-api-key`.
    ApiKey(String),
    /// `ANTHROPIC_OAUTH_TOKEN`, sent as `Authorization: Bearer`.
    OAuthToken(String),
}

/// Resource bounds and their defaults.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Rolling tail buffer cap per exec call, in bytes.
    pub exec_max_output_bytes: usize,

    /// Default exec timeout in seconds when the tool omits one.
    pub exec_default_timeout_secs: u64,

    /// Context token estimate that triggers compaction.
    pub compaction_threshold: usize,

    /// Tokens kept below the cut point when compacting.
    pub keep_recent_tokens: usize,

    /// Max queued event firings per channel.
    pub event_queue_cap: usize,

    /// Poll interval for the events directory, in seconds.
    pub event_poll_secs: u64,

    /// Log entries included in the recent-messages prompt preamble.
    pub recent_messages: usize,
}

impl Default for Limits {
    fn default() -> Self {
        let compaction_threshold = 100_000;
        Self {
            exec_max_output_bytes: 50 * 1024,
            exec_default_timeout_secs: 120,
            compaction_threshold,
            keep_recent_tokens: compaction_threshold / 4,
            event_queue_cap: 5,
            event_poll_secs: 5,
            recent_messages: 20,
        }
    }
}

impl Config {
    /// Resolve configuration from CLI arguments plus the environment.
    ///
    /// Missing required environment is a `ConfigError` the caller maps to
    /// exit code 1; an invalid sandbox target maps to exit code 2.
    pub fn resolve(workspace: &Path, sandbox: &str) -> Result<Self> {
        let slack_app_token = require_env("MOM_SLACK_APP_TOKEN")?;
        let slack_bot_token = require_env("MOM_SLACK_BOT_TOKEN")?;

        let api_key = std::env::var("ANTHROPIC_API_KEY").ok().filter(|v| !v.is_empty());
        let oauth = std::env::var("ANTHROPIC_OAUTH_TOKEN").ok().filter(|v| !v.is_empty());
        let anthropic = match (api_key, oauth) {
            (Some(key), None) => AnthropicCredential::ApiKey(key),
            (None, Some(token)) => AnthropicCredential::OAuthToken(token),
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousCredentials.into()),
            (None, None) => {
                return Err(ConfigError::MissingEnv(
                    "ANTHROPIC_API_KEY or ANTHROPIC_OAUTH_TOKEN",
                )
                .into());
            }
        };

        let sandbox = SandboxTarget::parse(sandbox)?;

        std::fs::create_dir_all(workspace).map_err(|error| ConfigError::Workspace {
            path: workspace.display().to_string(),
            reason: error.to_string(),
        })?;
        let workspace = workspace
            .canonicalize()
            .map_err(|error| ConfigError::Workspace {
                path: workspace.display().to_string(),
                reason: error.to_string(),
            })?;

        Ok(Self {
            workspace,
            sandbox,
            slack_app_token,
            slack_bot_token,
            anthropic,
            anthropic_base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".into()),
            model: std::env::var("MOM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            limits: Limits::default(),
        })
    }

    /// Directory watched for event files.
    pub fn events_dir(&self) -> PathBuf {
        self.workspace.join("events")
    }

    /// Directory scanned for SKILL.md files.
    pub fn skills_dir(&self) -> PathBuf {
        self.workspace.join("skills")
    }
}

fn require_env(name: &'static str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnv(name).into())
}
