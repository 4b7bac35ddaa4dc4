//! Shell execution with bounded output capture and cooperative cancellation.

use crate::config::SandboxTarget;
use crate::error::SandboxError;
use crate::sandbox::Sandbox;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Grace period between SIGTERM and SIGKILL when a call is cancelled or
/// times out.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Which stream a chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A single chunk of subprocess output, in arrival order.
#[derive(Debug, Clone)]
pub struct ExecChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// Callback invoked for each output chunk. Never called after `exec` returns.
pub type ChunkCallback = Box<dyn FnMut(&ExecChunk) + Send>;

/// One shell invocation.
pub struct ExecRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Override for the rolling buffer cap; defaults to the sandbox limit.
    pub max_bytes: Option<usize>,
    /// When set, the full untruncated output is streamed here.
    pub artifact_path: Option<PathBuf>,
    pub on_chunk: Option<ChunkCallback>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            timeout: None,
            cancel: None,
            max_bytes: None,
            artifact_path: None,
            on_chunk: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_path = Some(path.into());
        self
    }

    pub fn with_on_chunk(mut self, callback: ChunkCallback) -> Self {
        self.on_chunk = Some(callback);
        self
    }
}

/// Result of a shell invocation. Non-zero exit is not an error.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub truncated: bool,
    pub duration: Duration,
    pub cancelled: bool,
    pub timed_out: bool,
}

/// Rolling buffer that keeps the most recent `max` bytes.
struct TailBuffer {
    max: usize,
    data: Vec<u8>,
    dropped: u64,
}

impl TailBuffer {
    fn new(max: usize) -> Self {
        Self {
            max,
            data: Vec::new(),
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.max {
            self.dropped += (self.data.len() + chunk.len() - self.max) as u64;
            self.data.clear();
            self.data.extend_from_slice(&chunk[chunk.len() - self.max..]);
            return;
        }
        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.max);
        if overflow > 0 {
            self.data.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.data.extend_from_slice(chunk);
    }

    fn truncated(&self) -> bool {
        self.dropped > 0
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl Sandbox {
    /// Run a shell command under the configured backend.
    ///
    /// Output is captured into rolling tail buffers bounded by the request's
    /// `max_bytes` (default: the sandbox limit). `on_chunk` fires in arrival
    /// order and never after this call returns. Cancellation sends SIGTERM,
    /// then SIGKILL after a short grace, then drains the streams.
    pub async fn exec(&self, mut request: ExecRequest) -> Result<ExecOutcome, SandboxError> {
        let started = Instant::now();
        let max_bytes = request
            .max_bytes
            .unwrap_or(self.limits().exec_max_output_bytes);

        let mut command = self.build_command(&request.command, &request.cwd);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|error| {
            SandboxError::BackendUnavailable(format!("failed to spawn shell: {error}"))
        })?;
        let pid = child.id();

        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        let mut artifact = match &request.artifact_path {
            Some(path) => Some(
                tokio::fs::File::create(path)
                    .await
                    .map_err(|error| SandboxError::from_io(path.display().to_string(), error))?,
            ),
            None => None,
        };

        let cancel = request.cancel.clone().unwrap_or_default();
        let deadline = request.timeout.map(|t| tokio::time::Instant::now() + t);

        let mut stdout_buf = TailBuffer::new(max_bytes);
        let mut stderr_buf = TailBuffer::new(max_bytes);
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut cancelled = false;
        let mut timed_out = false;
        let mut killed = false;
        let mut out_chunk = [0u8; 8192];
        let mut err_chunk = [0u8; 8192];

        // Single select loop so chunk callbacks observe arrival order.
        while stdout_open || stderr_open {
            let timeout_sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                read = stdout.read(&mut out_chunk), if stdout_open => {
                    match read {
                        Ok(0) => stdout_open = false,
                        Ok(n) => {
                            handle_chunk(
                                OutputStream::Stdout,
                                &out_chunk[..n],
                                &mut stdout_buf,
                                &mut artifact,
                                &mut request.on_chunk,
                            ).await;
                        }
                        Err(_) => stdout_open = false,
                    }
                }
                read = stderr.read(&mut err_chunk), if stderr_open => {
                    match read {
                        Ok(0) => stderr_open = false,
                        Ok(n) => {
                            handle_chunk(
                                OutputStream::Stderr,
                                &err_chunk[..n],
                                &mut stderr_buf,
                                &mut artifact,
                                &mut request.on_chunk,
                            ).await;
                        }
                        Err(_) => stderr_open = false,
                    }
                }
                _ = cancel.cancelled(), if !killed => {
                    cancelled = true;
                    killed = true;
                    terminate(pid, &mut child).await;
                }
                _ = timeout_sleep, if !killed && deadline.is_some() => {
                    timed_out = true;
                    killed = true;
                    terminate(pid, &mut child).await;
                }
            }
        }

        let status = child.wait().await.map_err(|error| SandboxError::Io {
            path: request.command.clone(),
            source: error,
        })?;

        if let Some(file) = artifact.as_mut() {
            let _ = file.flush().await;
        }

        // Callbacks must not outlive the call.
        drop(request.on_chunk.take());

        Ok(ExecOutcome {
            truncated: stdout_buf.truncated() || stderr_buf.truncated(),
            stdout: stdout_buf.into_string(),
            stderr: stderr_buf.into_string(),
            exit_code: status.code().unwrap_or(-1),
            duration: started.elapsed(),
            cancelled,
            timed_out,
        })
    }

    /// Spawn a shell: `/bin/sh -c` on host, `docker exec -i` in docker.
    fn build_command(&self, shell_command: &str, cwd: &Path) -> Command {
        match self.target() {
            SandboxTarget::Host => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(shell_command).current_dir(cwd);
                cmd
            }
            SandboxTarget::Docker { container } => {
                let mut cmd = Command::new("docker");
                cmd.arg("exec")
                    .arg("-i")
                    .arg("-w")
                    .arg(cwd)
                    .arg(container)
                    .arg("sh")
                    .arg("-c")
                    .arg(shell_command);
                cmd
            }
        }
    }
}

async fn handle_chunk(
    stream: OutputStream,
    data: &[u8],
    buffer: &mut TailBuffer,
    artifact: &mut Option<tokio::fs::File>,
    on_chunk: &mut Option<ChunkCallback>,
) {
    buffer.push(data);
    if let Some(file) = artifact.as_mut() {
        let _ = file.write_all(data).await;
    }
    if let Some(callback) = on_chunk.as_mut() {
        callback(&ExecChunk {
            stream,
            data: data.to_vec(),
        });
    }
}

/// SIGTERM the process group, wait out the grace period, then SIGKILL.
async fn terminate(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGTERM);
        }
        tokio::time::sleep(KILL_GRACE).await;
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
        return;
    }
    let _ = child.start_kill();
}
