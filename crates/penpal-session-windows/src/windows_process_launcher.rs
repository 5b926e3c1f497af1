#![cfg(windows)]

use async_trait::async_trait;
use penpal_session_core::{
    ChildStdio, ControlSignal, LaunchSpec, ProcessError, ProcessHandle, ProcessId,
    ProcessLauncher, ProcessStatus, TerminationResult,
};
use std::process::Stdio;
use sysinfo::{Pid, System};
use tokio::process::{Child, Command};
use tracing::{info, warn};
use windows::Win32::System::Threading::CREATE_NO_WINDOW;

/// Windows-specific process handle implementation
pub struct WindowsProcessHandle {
    child: Child,
    pid: Option<ProcessId>,
    command: String,
    args: Vec<String>,
}

impl WindowsProcessHandle {
    pub fn new(child: Child, command: String, args: Vec<String>) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            command,
            args,
        }
    }

    /// Kill every descendant of `root`, deepest first
    fn kill_descendants(root: ProcessId) {
        let mut system = System::new();
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );

        let mut descendants = Vec::new();
        Self::find_children_recursive(&system, root, &mut descendants);
        for pid in descendants {
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                if !process.kill() {
                    warn!(pid, "Failed to kill descendant process");
                }
            }
        }
    }

    fn find_children_recursive(system: &System, parent: ProcessId, result: &mut Vec<ProcessId>) {
        for (pid, process) in system.processes() {
            if process.parent().map(|ppid| ppid.as_u32()) == Some(parent) {
                let child_pid = pid.as_u32();
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}

#[async_trait]
impl ProcessHandle for WindowsProcessHandle {
    fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn args(&self) -> &[String] {
        &self.args
    }

    fn take_stdio(&mut self) -> Option<ChildStdio> {
        ChildStdio::from_child(&mut self.child)
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>, ProcessError> {
        Ok(self.child.try_wait()?.map(ProcessStatus::Exited))
    }

    async fn wait(&mut self) -> Result<ProcessStatus, ProcessError> {
        let status = self.child.wait().await?;
        Ok(ProcessStatus::Exited(status))
    }

    async fn signal(&mut self, signal: ControlSignal) -> Result<(), ProcessError> {
        Err(ProcessError::UnsupportedOperation(format!(
            "{signal} is not available for Windows processes"
        )))
    }

    async fn terminate(&mut self) -> TerminationResult {
        if self.child.id().is_none() {
            return TerminationResult::ProcessNotFound;
        }
        // No graceful equivalent for a console-less child; terminate outright.
        match self.child.start_kill() {
            Ok(()) => TerminationResult::Success,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                TerminationResult::AccessDenied
            }
            Err(e) => TerminationResult::Failed(e.to_string()),
        }
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        if let Some(pid) = self.child.id() {
            // The process-table walk is blocking, so it runs off the runtime threads.
            if let Err(e) = tokio::task::spawn_blocking(move || Self::kill_descendants(pid)).await {
                warn!(pid, error = %e, "Failed to kill descendant processes");
            }
        }
        self.child
            .kill()
            .await
            .map_err(|e| ProcessError::Other(format!("Failed to kill process: {e}")))
    }
}

/// Spawns conversation children without a console window
#[derive(Debug, Default, Clone)]
pub struct WindowsProcessLauncher;

impl WindowsProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for WindowsProcessLauncher {
    type Handle = WindowsProcessHandle;

    async fn spawn_process(&self, spec: &LaunchSpec) -> Result<WindowsProcessHandle, ProcessError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .creation_flags(CREATE_NO_WINDOW.0);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            command: spec.command.clone(),
            source,
        })?;

        if let Some(pid) = child.id() {
            info!(
                "Spawned Windows process: {} (PID: {}) with args: {:?}",
                spec.command, pid, spec.args
            );
        }

        Ok(WindowsProcessHandle::new(
            child,
            spec.command.clone(),
            spec.args.clone(),
        ))
    }
}
