use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Unique identifier for a process
pub type ProcessId = u32;

/// Write half handed to the session for the child's standard input
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Read half handed to a line pump for one of the child's output streams
pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Status of a process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// Process exited with status information
    Exited(std::process::ExitStatus),
    /// Process was terminated without a reportable exit status
    Terminated,
}

/// Result of a graceful termination request
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// The request was delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Process-control signals a session may deliver to its child
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ControlSignal {
    /// Stop scheduling the child (SIGSTOP on Unix)
    #[display("SUSPEND")]
    Suspend,
    /// Resume a suspended child (SIGCONT on Unix)
    #[display("CONTINUE")]
    Continue,
}

/// Error types for process operations
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Other error: {0}")]
    Other(String),
}

/// Everything needed to launch a child process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// The three standard streams of a spawned child, taken exactly once
pub struct ChildStdio {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
}

impl ChildStdio {
    /// Take the piped streams out of a tokio child. Returns `None` if any
    /// stream was not piped or was already taken.
    pub fn from_child(child: &mut tokio::process::Child) -> Option<Self> {
        let stdin = child.stdin.take()?;
        let stdout = child.stdout.take()?;
        let stderr = child.stderr.take()?;
        Some(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }
}

impl std::fmt::Debug for ChildStdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildStdio").finish_non_exhaustive()
    }
}

/// Trait representing a handle to a running child process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Process ID captured at spawn time
    fn pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn command(&self) -> &str;

    /// Get the arguments passed to this process
    fn args(&self) -> &[String];

    /// Take ownership of the child's standard streams
    fn take_stdio(&mut self) -> Option<ChildStdio>;

    /// Try to get exit status without blocking
    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>, ProcessError>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessStatus, ProcessError>;

    /// Deliver a process-control signal. Platforms without the primitive
    /// must return [`ProcessError::UnsupportedOperation`].
    async fn signal(&mut self, signal: ControlSignal) -> Result<(), ProcessError>;

    /// Ask the process to terminate (platform-dependent meaning)
    async fn terminate(&mut self) -> TerminationResult;

    /// Force kill the process and reap it
    async fn kill(&mut self) -> Result<(), ProcessError>;

    /// Check if the process is still running (non-blocking)
    async fn is_running(&mut self) -> bool {
        matches!(self.try_wait().await, Ok(None))
    }

    /// Wait for the process to exit, giving up after `timeout` when one is supplied
    async fn wait_for(&mut self, timeout: Option<Duration>) -> Result<ProcessStatus, ProcessError> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, self.wait())
                .await
                .map_err(|_| ProcessError::Timeout(duration))?,
            None => self.wait().await,
        }
    }
}

/// Spawns child processes for a session
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// The type of process handle this launcher produces
    type Handle: ProcessHandle + 'static;

    /// Spawn a new process with piped standard streams
    async fn spawn_process(&self, spec: &LaunchSpec) -> Result<Self::Handle, ProcessError>;
}

/// Factory trait for creating platform-specific launchers
pub trait ProcessLauncherFactory {
    /// The type of launcher this factory creates
    type Launcher: ProcessLauncher;

    /// Create a launcher for the current platform
    fn create_launcher() -> Self::Launcher;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
