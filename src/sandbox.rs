//! Sandboxed command executor: host or docker backends for tool execution.

pub mod exec;
pub mod fs;

pub use exec::{ExecChunk, ExecOutcome, ExecRequest, OutputStream};
pub use fs::{DirEntryInfo, FileStat};

use crate::config::{Limits, SandboxTarget};
use crate::error::SandboxError;
use std::path::{Path, PathBuf};

/// Path at which the host workspace is mounted inside a docker sandbox.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Executes shell commands and file operations under a configured backend.
///
/// Holds no channel state; every call is parameterised by the paths it
/// should act on, so one executor is shared across all channels.
#[derive(Debug, Clone)]
pub struct Sandbox {
    target: SandboxTarget,
    limits: Limits,
}

impl Sandbox {
    pub fn new(target: SandboxTarget, limits: Limits) -> Self {
        Self { target, limits }
    }

    pub fn target(&self) -> &SandboxTarget {
        &self.target
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// The workspace root as seen from inside the sandbox.
    pub fn workspace_path(&self, workspace: &Path) -> PathBuf {
        match &self.target {
            SandboxTarget::Host => workspace.to_path_buf(),
            SandboxTarget::Docker { .. } => PathBuf::from(CONTAINER_WORKSPACE),
        }
    }

    /// Probe the backend at startup. On host this is a no-op spawn of
    /// `true`; on docker it fails when the container is missing or stopped.
    pub async fn validate_backend(&self) -> Result<(), SandboxError> {
        let probe = ExecRequest::new("true", Path::new("/"));
        let outcome = self.exec(probe).await?;
        if outcome.exit_code != 0 {
            return Err(SandboxError::BackendUnavailable(format!(
                "probe exited with {}: {}",
                outcome.exit_code,
                outcome.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Translate a sandbox-visible path back to a host-visible one, so the
    /// harness can upload files the agent produced.
    ///
    /// On host the path is already host-visible. On docker,
    /// `/workspace/<rest>` maps to `<workspace>/<rest>`; paths outside the
    /// mount are returned unchanged (nothing better is known about them).
    pub fn translate_to_host(&self, path: &Path, workspace: &Path) -> PathBuf {
        match &self.target {
            SandboxTarget::Host => path.to_path_buf(),
            SandboxTarget::Docker { .. } => match path.strip_prefix(CONTAINER_WORKSPACE) {
                Ok(rest) => workspace.join(rest),
                Err(_) => path.to_path_buf(),
            },
        }
    }

    /// Translate a host-visible path under the workspace to its
    /// sandbox-visible form. Inverse of [`translate_to_host`] for every
    /// path under the workspace root.
    pub fn translate_to_sandbox(&self, path: &Path, workspace: &Path) -> PathBuf {
        match &self.target {
            SandboxTarget::Host => path.to_path_buf(),
            SandboxTarget::Docker { .. } => match path.strip_prefix(workspace) {
                Ok(rest) => Path::new(CONTAINER_WORKSPACE).join(rest),
                Err(_) => path.to_path_buf(),
            },
        }
    }

    /// Resolve a path the agent supplied to the host-visible path file
    /// operations act on. The workspace is a bind mount, so the host view
    /// and the container view are the same filesystem.
    pub fn resolve_for_io(&self, path: &Path, workspace: &Path) -> PathBuf {
        self.translate_to_host(path, workspace)
    }
}
