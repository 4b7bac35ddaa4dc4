//! Top-level error types for mom.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration and startup errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("exactly one of ANTHROPIC_API_KEY or ANTHROPIC_OAUTH_TOKEN must be set")]
    AmbiguousCredentials,

    #[error("invalid sandbox target '{0}': expected 'host' or 'docker:<name>'")]
    InvalidSandboxTarget(String),

    #[error("workspace directory {path} is not usable: {reason}")]
    Workspace { path: String, reason: String },
}

/// Sandbox backend and file-operation errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl SandboxError {
    /// Classify a `std::io::Error` for `path` into the typed taxonomy.
    pub fn from_io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => SandboxError::NotFound(path),
            std::io::ErrorKind::NotADirectory => SandboxError::NotADirectory(path),
            std::io::ErrorKind::PermissionDenied => SandboxError::PermissionDenied(path),
            _ => SandboxError::Io { path, source },
        }
    }
}

/// Channel store and context manager errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to append to {path}: {source}")]
    Append {
        path: String,
        source: std::io::Error,
    },

    #[error("attachment download failed for {url}: {reason}")]
    AttachmentDownload { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// LLM transport and streaming errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed stream event: {0}")]
    Stream(String),

    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    /// Transport-level failures (network, 5xx, overload) are retried with
    /// backoff; everything else ends the turn.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport(_) => true,
            LlmError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Chat transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat API call failed: {0}")]
    Api(String),

    #[error("file upload failed for {path}: {reason}")]
    Upload { path: String, reason: String },
}

/// Event file and scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("malformed event file {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("invalid cron expression '{schedule}': {reason}")]
    BadSchedule { schedule: String, reason: String },

    #[error("unknown timezone '{0}'")]
    BadTimezone(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
