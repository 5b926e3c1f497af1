#[cfg(unix)]
mod unix_impl {
    use async_trait::async_trait;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use penpal_session_core::{
        ChildStdio, ControlSignal, LaunchSpec, ProcessError, ProcessHandle, ProcessId,
        ProcessLauncher, ProcessStatus, TerminationResult,
    };
    use std::process::Stdio;
    use sysinfo::System;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// Unix child process, leader of its own process group
    pub struct UnixProcessHandle {
        child: Child,
        pid: Option<ProcessId>,
        command: String,
        args: Vec<String>,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child, command: String, args: Vec<String>) -> Self {
            let pid = child.id();
            Self {
                child,
                pid,
                command,
                args,
            }
        }

        /// Pid that is still ours to signal. `None` once the child was reaped,
        /// after which the number may belong to an unrelated process.
        fn live_pid(&self) -> Option<ProcessId> {
            self.child.id()
        }

        /// Signal the whole group, falling back to the leader alone when the
        /// group is already gone.
        fn send_to_group(pid: ProcessId, sig: Signal) -> Result<(), ProcessError> {
            let nix_pid = NixPid::from_raw(pid as i32);
            match signal::killpg(nix_pid, sig) {
                Ok(()) => Ok(()),
                Err(Errno::ESRCH) => {
                    signal::kill(nix_pid, sig).map_err(|e| errno_to_error(pid, sig, e))
                }
                Err(e) => Err(errno_to_error(pid, sig, e)),
            }
        }
    }

    fn errno_to_error(pid: ProcessId, sig: Signal, errno: Errno) -> ProcessError {
        match errno {
            Errno::ESRCH => ProcessError::ProcessNotFound(pid),
            Errno::EPERM => ProcessError::PermissionDenied(format!("{sig} to process {pid}")),
            other => ProcessError::Other(format!("{sig} to process {pid} failed: {other}")),
        }
    }

    /// Snapshot every descendant of `root`, deepest first
    fn find_descendants(root: ProcessId) -> Vec<ProcessId> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );

        let mut descendants = Vec::new();
        collect_descendants(&system, root, &mut descendants);
        descendants
    }

    fn collect_descendants(system: &System, parent: ProcessId, result: &mut Vec<ProcessId>) {
        for (pid, process) in system.processes() {
            if process.parent().map(|ppid| ppid.as_u32()) == Some(parent) {
                let child_pid = pid.as_u32();
                collect_descendants(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
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
            let sig = match signal {
                ControlSignal::Suspend => Signal::SIGSTOP,
                ControlSignal::Continue => Signal::SIGCONT,
            };
            let pid = self
                .live_pid()
                .ok_or(ProcessError::ProcessNotFound(self.pid.unwrap_or_default()))?;

            Self::send_to_group(pid, sig)?;
            debug!("Sent {} to process group {}", sig, pid);
            Ok(())
        }

        async fn terminate(&mut self) -> TerminationResult {
            let Some(pid) = self.live_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            match Self::send_to_group(pid, Signal::SIGTERM) {
                Ok(()) => {
                    info!("Sent SIGTERM to process group {}", pid);
                    TerminationResult::Success
                }
                Err(ProcessError::ProcessNotFound(_)) => {
                    info!("Process {} not found (already terminated)", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(ProcessError::PermissionDenied(_)) => {
                    warn!("Permission denied to terminate process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGTERM to process {}: {}", pid, e);
                    TerminationResult::Failed(e.to_string())
                }
            }
        }

        async fn kill(&mut self) -> Result<(), ProcessError> {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }

            if let Some(pid) = self.live_pid() {
                // Helpers that left the group still count as part of the conversation.
                // The process-table walk is blocking, so it runs off the runtime threads.
                let descendants = match tokio::task::spawn_blocking(move || find_descendants(pid)).await {
                    Ok(descendants) => descendants,
                    Err(e) => {
                        warn!("Failed to list descendants of {}: {}", pid, e);
                        Vec::new()
                    }
                };

                match signal::killpg(NixPid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) => info!("Sent SIGKILL to process group {}", pid),
                    Err(Errno::ESRCH) => debug!("Process group {} already gone", pid),
                    Err(e) => warn!("Failed to send SIGKILL to process group {}: {}", pid, e),
                }

                for descendant in descendants {
                    match signal::kill(NixPid::from_raw(descendant as i32), Signal::SIGKILL) {
                        Ok(()) | Err(Errno::ESRCH) => {}
                        Err(e) => warn!("Failed to kill descendant {}: {}", descendant, e),
                    }
                }
            }

            self.child
                .kill()
                .await
                .map_err(|e| ProcessError::Other(format!("Failed to kill process: {e}")))
        }
    }

    impl Drop for UnixProcessHandle {
        fn drop(&mut self) {
            if let (Some(pid), Ok(None)) = (self.live_pid(), self.child.try_wait()) {
                warn!("Process group {} still running on drop, killing it", pid);
                if let Err(e) = signal::killpg(NixPid::from_raw(pid as i32), Signal::SIGKILL) {
                    debug!("Emergency kill of process group {} failed: {}", pid, e);
                }
            }
        }
    }

    /// Spawns conversation children with piped stdio in a fresh process group
    #[derive(Debug, Default, Clone)]
    pub struct UnixProcessLauncher;

    impl UnixProcessLauncher {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl ProcessLauncher for UnixProcessLauncher {
        type Handle = UnixProcessHandle;

        async fn spawn_process(&self, spec: &LaunchSpec) -> Result<UnixProcessHandle, ProcessError> {
            let mut cmd = Command::new(&spec.command);
            cmd.args(&spec.args)
                .envs(&spec.env)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .process_group(0);

            if let Some(dir) = &spec.working_dir {
                cmd.current_dir(dir);
            }

            let child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
                command: spec.command.clone(),
                source,
            })?;

            if let Some(pid) = child.id() {
                info!(
                    "Spawned Unix process: {} (PID: {}) with args: {:?}",
                    spec.command, pid, spec.args
                );
            }

            Ok(UnixProcessHandle::new(
                child,
                spec.command.clone(),
                spec.args.clone(),
            ))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Duration;
        use tokio::io::AsyncReadExt;

        fn shell(script: &str) -> LaunchSpec {
            LaunchSpec {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn test_spawn_missing_command() {
            let launcher = UnixProcessLauncher::new();
            let spec = LaunchSpec {
                command: "/definitely/not/a/real/interpreter".to_string(),
                ..Default::default()
            };
            let error = launcher.spawn_process(&spec).await.err().unwrap();
            assert!(matches!(error, ProcessError::SpawnFailed { .. }));
        }

        #[tokio::test]
        async fn test_spawn_applies_env_and_working_dir() {
            let dir = std::env::temp_dir();
            let mut spec = shell("printf '%s %s' \"$PENPAL_TEST\" \"$(pwd)\"");
            spec.env.insert("PENPAL_TEST".to_string(), "hola".to_string());
            spec.working_dir = Some(dir.clone());

            let mut handle = UnixProcessLauncher::new().spawn_process(&spec).await.unwrap();
            let mut stdio = handle.take_stdio().unwrap();
            assert!(handle.take_stdio().is_none());

            let mut out = String::new();
            stdio.stdout.read_to_string(&mut out).await.unwrap();
            let status = handle.wait().await.unwrap();
            assert!(matches!(status, ProcessStatus::Exited(s) if s.success()));

            let expected = dir.canonicalize().unwrap();
            assert!(out.starts_with("hola "));
            assert_eq!(
                std::path::Path::new(&out[5..]).canonicalize().unwrap(),
                expected
            );
        }

        #[tokio::test]
        async fn test_suspend_and_continue() {
            let mut handle = UnixProcessLauncher::new()
                .spawn_process(&shell("sleep 30"))
                .await
                .unwrap();

            handle.signal(ControlSignal::Suspend).await.unwrap();
            assert!(handle.is_running().await);
            handle.signal(ControlSignal::Continue).await.unwrap();
            assert!(handle.is_running().await);

            handle.kill().await.unwrap();
            assert!(!handle.is_running().await);
        }

        #[tokio::test]
        async fn test_kill_reaches_grandchildren() {
            let mut handle = UnixProcessLauncher::new()
                .spawn_process(&shell("sleep 30 & wait"))
                .await
                .unwrap();
            let mut stdio = handle.take_stdio().unwrap();

            handle.kill().await.unwrap();

            // The grandchild shares the stdout pipe; EOF means it died too.
            let mut out = Vec::new();
            tokio::time::timeout(Duration::from_secs(5), stdio.stdout.read_to_end(&mut out))
                .await
                .expect("grandchild kept stdout open after kill")
                .unwrap();
        }

        #[tokio::test]
        async fn test_signal_after_exit_is_not_found() {
            let mut handle = UnixProcessLauncher::new()
                .spawn_process(&shell("exit 3"))
                .await
                .unwrap();
            let status = handle
                .wait_for(Some(Duration::from_secs(5)))
                .await
                .unwrap();
            assert!(matches!(status, ProcessStatus::Exited(s) if s.code() == Some(3)));

            let error = handle.signal(ControlSignal::Suspend).await.unwrap_err();
            assert!(matches!(error, ProcessError::ProcessNotFound(_)));
            assert_eq!(handle.terminate().await, TerminationResult::ProcessNotFound);
            handle.kill().await.unwrap();
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessLauncher};
