//! The session controller: owns at most one child process and its two line
//! pumps, and drives them through `Idle → Running ⇄ Paused → Stopping → Idle`.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::process::{
    BoxedWriter, ControlSignal, ProcessError, ProcessHandle, ProcessId, ProcessLauncher,
    ProcessStatus,
};
use crate::pump::{LinePump, PumpEnd, StreamKind};
use crate::sink::OutputSink;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shown to the user when start is requested for a running conversation
pub const ALREADY_RUNNING_NOTICE: &str = "Conversation already running";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopping,
}

impl SessionState {
    /// Whether a child is supposed to be alive and talking
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Paused)
    }

    /// Label for the control that toggles pause from this state
    pub fn pause_label(self) -> &'static str {
        match self {
            SessionState::Paused => "Resume Conversation",
            _ => "Pause Conversation",
        }
    }
}

/// Reserved lines with protocol meaning for the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    /// Ask the child to say goodbye and exit
    Exit,
    /// Ask the child to capture the next utterance from the microphone
    StartAudio,
}

impl ControlToken {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlToken::Exit => "EXIT",
            ControlToken::StartAudio => "START_AUDIO",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: Option<ProcessId> },
    AlreadyRunning,
}

/// How the child left during `stop`
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownExit {
    /// There was no child to stop
    NotRunning,
    /// The child exited on its own within the exit timeout
    Exited(ProcessStatus),
    /// The child had to be killed
    Killed(ProcessStatus),
    /// The child was killed but could not be reaped in time
    Unreaped,
}

/// What happened during `stop`. Errors are recorded, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct StopReport {
    pub pid: Option<ProcessId>,
    pub exit: ShutdownExit,
    pub stdout_end: Option<PumpEnd>,
    pub stderr_end: Option<PumpEnd>,
    pub errors: Vec<String>,
}

impl StopReport {
    pub fn not_running() -> Self {
        Self {
            pid: None,
            exit: ShutdownExit::NotRunning,
            stdout_end: None,
            stderr_end: None,
            errors: Vec::new(),
        }
    }

    pub fn was_forced(&self) -> bool {
        matches!(self.exit, ShutdownExit::Killed(_) | ShutdownExit::Unreaped)
    }
}

struct ActiveChild<H> {
    handle: H,
    stdin: Option<BoxedWriter>,
    stdout: LinePump,
    stderr: LinePump,
}

/// One managed lifetime of the conversation child plus its I/O pumps.
///
/// All operations take `&mut self`: the session is driven from a single
/// control context, which is also the only writer of the child's input.
pub struct Session<L: ProcessLauncher> {
    config: SessionConfig,
    launcher: Arc<L>,
    sink: Arc<dyn OutputSink>,
    state: watch::Sender<SessionState>,
    child: Option<ActiveChild<L::Handle>>,
}

impl<L: ProcessLauncher> Session<L> {
    pub fn new(config: SessionConfig, launcher: Arc<L>, sink: Arc<dyn OutputSink>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            launcher,
            sink,
            state,
            child: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions without being able to change them
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.child.as_ref().and_then(|child| child.handle.pid())
    }

    pub async fn is_child_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => child.handle.is_running().await,
            None => false,
        }
    }

    /// Whether each pump of the current child is still reading (stdout, stderr)
    pub fn pumps_running(&self) -> (bool, bool) {
        match &self.child {
            Some(child) => (child.stdout.is_running(), child.stderr.is_running()),
            None => (false, false),
        }
    }

    /// Launch the child and start pumping its output
    pub async fn start(&mut self) -> Result<StartOutcome, SessionError> {
        let current = self.state();
        if current != SessionState::Idle || self.child.is_some() {
            info!(state = %current, "start requested while a conversation is active");
            self.sink.on_diagnostic(ALREADY_RUNNING_NOTICE).await;
            return Ok(StartOutcome::AlreadyRunning);
        }

        let spec = self.config.launch_spec();
        let mut handle = match self.launcher.spawn_process(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(command = %spec.command, error = %e, "failed to launch conversation");
                let error = SessionError::Spawn(e);
                self.sink.on_diagnostic(&error.to_string()).await;
                return Err(error);
            }
        };

        let Some(stdio) = handle.take_stdio() else {
            if let Err(e) = handle.kill().await {
                warn!(error = %e, "failed to kill child without standard streams");
            }
            let error = SessionError::Spawn(ProcessError::Other(
                "child standard streams were not captured".to_string(),
            ));
            self.sink.on_diagnostic(&error.to_string()).await;
            return Err(error);
        };

        // Publish Running before the pumps exist so an immediate exit is reported.
        self.state.send_replace(SessionState::Running);

        let stdout = LinePump::spawn(
            StreamKind::Stdout,
            stdio.stdout,
            self.sink.clone(),
            self.state.subscribe(),
            self.config.line_codec(),
        );
        let stderr = LinePump::spawn(
            StreamKind::Stderr,
            stdio.stderr,
            self.sink.clone(),
            self.state.subscribe(),
            self.config.line_codec(),
        );

        let pid = handle.pid();
        info!(
            ?pid,
            language = %self.config.profile.language,
            persona = %self.config.profile.persona,
            "conversation started"
        );

        self.child = Some(ActiveChild {
            handle,
            stdin: Some(stdio.stdin),
            stdout,
            stderr,
        });

        Ok(StartOutcome::Started { pid })
    }

    /// Suspend the child. Output already produced keeps draining.
    pub async fn pause(&mut self) -> Result<SessionState, SessionError> {
        self.apply_signal(
            SessionState::Running,
            ControlSignal::Suspend,
            SessionState::Paused,
        )
        .await
    }

    pub async fn resume(&mut self) -> Result<SessionState, SessionError> {
        self.apply_signal(
            SessionState::Paused,
            ControlSignal::Continue,
            SessionState::Running,
        )
        .await
    }

    pub async fn toggle_pause(&mut self) -> Result<SessionState, SessionError> {
        match self.state() {
            SessionState::Paused => self.resume().await,
            _ => self.pause().await,
        }
    }

    async fn apply_signal(
        &mut self,
        from: SessionState,
        signal: ControlSignal,
        to: SessionState,
    ) -> Result<SessionState, SessionError> {
        let current = self.state();
        if current != from {
            debug!(state = %current, %signal, "signal not applicable in this state");
            return Ok(current);
        }

        let Some(child) = self.child.as_mut() else {
            return Ok(current);
        };
        if !child.handle.is_running().await {
            debug!(%signal, "no live child to signal");
            return Ok(current);
        }

        match child.handle.signal(signal).await {
            Ok(()) => {
                self.state.send_replace(to);
                info!(pid = ?child.handle.pid(), %signal, state = %to, "conversation {}", to.to_string().to_lowercase());
                Ok(to)
            }
            Err(e) => {
                let error = SessionError::from_signal(e);
                warn!(%signal, error = %error, "failed to signal child");
                self.sink.on_diagnostic(&error.to_string()).await;
                Err(error)
            }
        }
    }

    /// Send one line of conversational text. Returns `Ok(false)` when
    /// nothing was written (blank input or no child).
    pub async fn send_line(&mut self, text: &str) -> Result<bool, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }
        self.write_to_child(text).await
    }

    /// Send a reserved protocol token verbatim
    pub async fn send_control(&mut self, token: ControlToken) -> Result<bool, SessionError> {
        self.write_to_child(token.as_str()).await
    }

    pub async fn start_audio(&mut self) -> Result<bool, SessionError> {
        self.send_control(ControlToken::StartAudio).await
    }

    async fn write_to_child(&mut self, line: &str) -> Result<bool, SessionError> {
        let Some(stdin) = self.child.as_mut().and_then(|child| child.stdin.as_mut()) else {
            debug!("no conversation input to write to");
            return Ok(false);
        };

        match write_line(stdin, line).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "failed to write to conversation input");
                let error = SessionError::Write(e);
                self.sink.on_diagnostic(&error.to_string()).await;
                Err(error)
            }
        }
    }

    /// Shut the conversation down. Every step is attempted even if an
    /// earlier one failed; the session always ends up `Idle`.
    pub async fn stop(&mut self) -> StopReport {
        let Some(mut child) = self.child.take() else {
            self.state.send_replace(SessionState::Idle);
            return StopReport::not_running();
        };

        let was_paused = self.state() == SessionState::Paused;
        self.state.send_replace(SessionState::Stopping);

        let shutdown = self.config.shutdown.clone();
        let mut report = StopReport::not_running();
        report.pid = child.handle.pid();
        info!(pid = ?report.pid, "stopping conversation");

        // A stopped child cannot read the exit token.
        if was_paused {
            if let Err(e) = child.handle.signal(ControlSignal::Continue).await {
                self.record(&mut report, format!("failed to resume child before stop: {e}"))
                    .await;
            }
        }

        // The exit timeout bounds delivering the token and the exit together:
        // a child that stopped reading can leave the pipe full.
        let exit_deadline = Instant::now() + shutdown.exit_timeout();
        let mut delivered = true;
        if let Some(mut stdin) = child.stdin.take() {
            let request = async {
                write_line(&mut stdin, ControlToken::Exit.as_str()).await?;
                if let Err(e) = stdin.shutdown().await {
                    debug!(error = %e, "closing conversation input failed");
                }
                Ok::<(), std::io::Error>(())
            };
            match tokio::time::timeout_at(exit_deadline, request).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.record(&mut report, format!("failed to send exit request: {e}"))
                        .await;
                }
                Err(_) => {
                    delivered = false;
                    self.record(
                        &mut report,
                        format!(
                            "exit request not accepted within {:?}",
                            shutdown.exit_timeout()
                        ),
                    )
                    .await;
                }
            }
            drop(stdin);
        }

        let waited = if delivered {
            let remaining = exit_deadline.saturating_duration_since(Instant::now());
            Some(child.handle.wait_for(Some(remaining)).await)
        } else {
            None
        };

        report.exit = match waited {
            Some(Ok(status)) => ShutdownExit::Exited(status),
            Some(Err(e)) => {
                let message = match e {
                    ProcessError::Timeout(_) => {
                        SessionError::ShutdownTimeout(shutdown.exit_timeout()).to_string()
                    }
                    other => format!("waiting for child exit failed: {other}"),
                };
                self.record(&mut report, message).await;
                self.force_kill(&mut child.handle, &mut report).await
            }
            None => self.force_kill(&mut child.handle, &mut report).await,
        };

        report.stdout_end = Some(child.stdout.finish(shutdown.drain_timeout()).await);
        report.stderr_end = Some(child.stderr.finish(shutdown.drain_timeout()).await);

        drop(child);

        self.sink.on_session_ended().await;
        self.state.send_replace(SessionState::Idle);
        info!(pid = ?report.pid, exit = ?report.exit, "conversation stopped");
        report
    }

    async fn force_kill(&self, handle: &mut L::Handle, report: &mut StopReport) -> ShutdownExit {
        if let Err(e) = handle.kill().await {
            self.record(report, format!("failed to kill child: {e}")).await;
        }

        match handle.wait_for(Some(self.config.shutdown.kill_timeout())).await {
            Ok(status) => ShutdownExit::Killed(status),
            Err(e) => {
                self.record(report, format!("killed child was not reaped: {e}"))
                    .await;
                ShutdownExit::Unreaped
            }
        }
    }

    async fn record(&self, report: &mut StopReport, message: String) {
        warn!(pid = ?report.pid, "{message}");
        self.sink.on_diagnostic(&message).await;
        report.errors.push(message);
    }
}

impl<L: ProcessLauncher> Drop for Session<L> {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            warn!(
                pid = ?child.handle.pid(),
                "session dropped with a live conversation, forcing cleanup"
            );
            child.stdout.cancel();
            child.stderr.cancel();
        }
    }
}

async fn write_line(stdin: &mut BoxedWriter, line: &str) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    stdin.write_all(&buf).await?;
    stdin.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaunchProfile, ShutdownConfig};
    use crate::process::{ChildStdio, LaunchSpec, TerminationResult};
    use crate::sink::{ChannelSink, SessionEvent};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// In-memory child: the test drives the far ends of its pipes.
    struct MockHandle {
        pid: ProcessId,
        stdio: Option<ChildStdio>,
        exited: watch::Sender<bool>,
        supports_signals: bool,
        signals: Arc<Mutex<Vec<ControlSignal>>>,
    }

    struct MockChild {
        stdin: BufReader<DuplexStream>,
        stdout: DuplexStream,
        stderr: DuplexStream,
        exited: watch::Sender<bool>,
        signals: Arc<Mutex<Vec<ControlSignal>>>,
    }

    fn mock_pair(supports_signals: bool) -> (MockHandle, MockChild) {
        let (stdin_w, stdin_r) = tokio::io::duplex(1024);
        let (stdout_w, stdout_r) = tokio::io::duplex(1024);
        let (stderr_w, stderr_r) = tokio::io::duplex(1024);
        let (exited, _) = watch::channel(false);
        let signals = Arc::new(Mutex::new(Vec::new()));

        let handle = MockHandle {
            pid: 4242,
            stdio: Some(ChildStdio {
                stdin: Box::new(stdin_w),
                stdout: Box::new(stdout_r),
                stderr: Box::new(stderr_r),
            }),
            exited: exited.clone(),
            supports_signals,
            signals: signals.clone(),
        };
        let child = MockChild {
            stdin: BufReader::new(stdin_r),
            stdout: stdout_w,
            stderr: stderr_w,
            exited,
            signals,
        };
        (handle, child)
    }

    #[async_trait]
    impl ProcessHandle for MockHandle {
        fn pid(&self) -> Option<ProcessId> {
            Some(self.pid)
        }

        fn command(&self) -> &str {
            "mock"
        }

        fn args(&self) -> &[String] {
            &[]
        }

        fn take_stdio(&mut self) -> Option<ChildStdio> {
            self.stdio.take()
        }

        async fn try_wait(&mut self) -> Result<Option<ProcessStatus>, ProcessError> {
            Ok(self.exited.borrow().then_some(ProcessStatus::Terminated))
        }

        async fn wait(&mut self) -> Result<ProcessStatus, ProcessError> {
            let mut rx = self.exited.subscribe();
            rx.wait_for(|exited| *exited)
                .await
                .map_err(|e| ProcessError::Other(e.to_string()))?;
            Ok(ProcessStatus::Terminated)
        }

        async fn signal(&mut self, signal: ControlSignal) -> Result<(), ProcessError> {
            if !self.supports_signals {
                return Err(ProcessError::UnsupportedOperation(
                    "process stop/continue signals".to_string(),
                ));
            }
            self.signals.lock().unwrap().push(signal);
            Ok(())
        }

        async fn terminate(&mut self) -> TerminationResult {
            self.exited.send_replace(true);
            TerminationResult::Success
        }

        async fn kill(&mut self) -> Result<(), ProcessError> {
            self.exited.send_replace(true);
            Ok(())
        }
    }

    struct MockLauncher {
        handles: Mutex<Vec<MockHandle>>,
        specs: Mutex<Vec<LaunchSpec>>,
    }

    impl MockLauncher {
        fn with(handles: Vec<MockHandle>) -> Arc<Self> {
            Arc::new(Self {
                handles: Mutex::new(handles),
                specs: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProcessLauncher for MockLauncher {
        type Handle = MockHandle;

        async fn spawn_process(&self, spec: &LaunchSpec) -> Result<MockHandle, ProcessError> {
            self.specs.lock().unwrap().push(spec.clone());
            self.handles.lock().unwrap().pop().ok_or_else(|| ProcessError::SpawnFailed {
                command: spec.command.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig::builder()
            .profile(LaunchProfile::new("German", "Lena"))
            .shutdown(ShutdownConfig {
                exit_timeout_ms: 100,
                kill_timeout_ms: 500,
                drain_timeout_ms: 100,
            })
            .build()
            .unwrap()
    }

    fn session_with(
        handles: Vec<MockHandle>,
    ) -> (
        Session<MockLauncher>,
        Arc<MockLauncher>,
        UnboundedReceiver<SessionEvent>,
    ) {
        let launcher = MockLauncher::with(handles);
        let (sink, rx) = ChannelSink::new();
        let session = Session::new(test_config(), launcher.clone(), Arc::new(sink));
        (session, launcher, rx)
    }

    async fn next_event(rx: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event channel closed")
    }

    async fn read_child_line(child: &mut MockChild) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), child.stdin.read_line(&mut line))
            .await
            .expect("timed out reading child input")
            .unwrap();
        line
    }

    #[tokio::test]
    async fn test_start_uses_profile_and_forwards_output() {
        let (handle, mut child) = mock_pair(true);
        let (mut session, launcher, mut rx) = session_with(vec![handle]);

        let outcome = session.start().await.unwrap();
        assert_eq!(outcome, StartOutcome::Started { pid: Some(4242) });
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.pumps_running(), (true, true));

        let spec = launcher.specs.lock().unwrap()[0].clone();
        assert_eq!(spec.args, ["-u", "penpal.py", "German", "Lena"]);

        child.stdout.write_all(b"Lena: Hallo!\n").await.unwrap();
        child.stderr.write_all(b"loading model\n").await.unwrap();

        let mut lines = Vec::new();
        let mut diagnostics = Vec::new();
        while lines.is_empty() || diagnostics.is_empty() {
            match next_event(&mut rx).await {
                SessionEvent::Line(line) => lines.push(line),
                SessionEvent::Diagnostic(line) => diagnostics.push(line),
                SessionEvent::Ended => panic!("session ended unexpectedly"),
            }
        }
        assert_eq!(lines, ["Lena: Hallo!"]);
        assert_eq!(diagnostics, ["loading model"]);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (first, _child) = mock_pair(true);
        let (second, _unused) = mock_pair(true);
        let (mut session, launcher, mut rx) = session_with(vec![second, first]);

        session.start().await.unwrap();
        let outcome = session.start().await.unwrap();
        assert_eq!(outcome, StartOutcome::AlreadyRunning);
        assert_eq!(launcher.specs.lock().unwrap().len(), 1);
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::Diagnostic(ALREADY_RUNNING_NOTICE.to_string())
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_session_idle() {
        let (mut session, _launcher, mut rx) = session_with(Vec::new());

        let error = session.start().await.unwrap_err();
        assert!(matches!(error, SessionError::Spawn(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Diagnostic(_)));
    }

    #[tokio::test]
    async fn test_send_line_trims_and_skips_blank_input() {
        let (handle, mut child) = mock_pair(true);
        let (mut session, _launcher, _rx) = session_with(vec![handle]);
        session.start().await.unwrap();

        assert!(!session.send_line("").await.unwrap());
        assert!(!session.send_line("   \t").await.unwrap());
        assert!(session.send_line("  Wie geht's?  ").await.unwrap());
        assert!(session.start_audio().await.unwrap());

        assert_eq!(read_child_line(&mut child).await, "Wie geht's?\n");
        assert_eq!(read_child_line(&mut child).await, "START_AUDIO\n");
    }

    #[tokio::test]
    async fn test_send_line_without_child_is_noop() {
        let (mut session, _launcher, _rx) = session_with(Vec::new());
        assert!(!session.send_line("hello").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_error_is_reported_not_fatal() {
        let (handle, child) = mock_pair(true);
        let (mut session, _launcher, mut rx) = session_with(vec![handle]);
        session.start().await.unwrap();

        drop(child.stdin);
        let error = session.send_line("anyone there?").await.unwrap_err();
        assert!(matches!(error, SessionError::Write(_)));
        assert_eq!(session.state(), SessionState::Running);

        loop {
            if let SessionEvent::Diagnostic(text) = next_event(&mut rx).await {
                assert!(text.starts_with("Failed to write to conversation input"));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_pause_and_resume_toggle() {
        let (handle, child) = mock_pair(true);
        let (mut session, _launcher, _rx) = session_with(vec![handle]);
        session.start().await.unwrap();

        assert_eq!(session.toggle_pause().await.unwrap(), SessionState::Paused);
        assert_eq!(session.state().pause_label(), "Resume Conversation");
        assert_eq!(session.toggle_pause().await.unwrap(), SessionState::Running);
        assert_eq!(session.state().pause_label(), "Pause Conversation");

        // Resume while running is a no-op.
        assert_eq!(session.resume().await.unwrap(), SessionState::Running);
        assert_eq!(
            *child.signals.lock().unwrap(),
            [ControlSignal::Suspend, ControlSignal::Continue]
        );
    }

    #[tokio::test]
    async fn test_unsupported_signal_keeps_running() {
        let (handle, _child) = mock_pair(false);
        let (mut session, _launcher, mut rx) = session_with(vec![handle]);
        session.start().await.unwrap();

        let error = session.pause().await.unwrap_err();
        assert!(matches!(error, SessionError::SignalUnsupported(_)));
        assert_eq!(session.state(), SessionState::Running);
        match next_event(&mut rx).await {
            SessionEvent::Diagnostic(text) => assert!(text.contains("Pause/resume unavailable")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pause_without_child_is_noop() {
        let (mut session, _launcher, _rx) = session_with(Vec::new());
        assert_eq!(session.toggle_pause().await.unwrap(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let (handle, mut child) = mock_pair(true);
        let (mut session, _launcher, mut rx) = session_with(vec![handle]);
        session.start().await.unwrap();

        let child_task = tokio::spawn(async move {
            let line = read_child_line(&mut child).await;
            assert_eq!(line, "EXIT\n");
            child.stdout.write_all(b"Goodbye!\n").await.unwrap();
            child.exited.send_replace(true);
        });

        let report = session.stop().await;
        child_task.await.unwrap();

        assert_eq!(report.exit, ShutdownExit::Exited(ProcessStatus::Terminated));
        assert!(!report.was_forced());
        assert!(report.errors.is_empty());
        // Both pumps were joined after reading to the end of their streams.
        assert_eq!(report.stdout_end, Some(PumpEnd::Eof));
        assert_eq!(report.stderr_end, Some(PumpEnd::Eof));
        assert_eq!(session.state(), SessionState::Idle);

        assert_eq!(next_event(&mut rx).await, SessionEvent::Line("Goodbye!".to_string()));
        assert_eq!(next_event(&mut rx).await, SessionEvent::Ended);
    }

    #[tokio::test]
    async fn test_stop_kills_child_that_ignores_exit() {
        let (handle, child) = mock_pair(true);
        let (mut session, _launcher, mut rx) = session_with(vec![handle]);
        session.start().await.unwrap();

        let report = session.stop().await;
        assert_eq!(report.exit, ShutdownExit::Killed(ProcessStatus::Terminated));
        assert!(report.was_forced());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("did not exit"));
        // The mock's pipes stay open, so both pumps had to be cancelled.
        assert_eq!(report.stdout_end, Some(PumpEnd::Cancelled));
        assert_eq!(report.stderr_end, Some(PumpEnd::Cancelled));
        assert_eq!(session.state(), SessionState::Idle);
        drop(child);

        assert!(matches!(next_event(&mut rx).await, SessionEvent::Diagnostic(_)));
        assert_eq!(next_event(&mut rx).await, SessionEvent::Ended);
    }

    #[tokio::test]
    async fn test_stop_with_full_input_pipe_is_bounded() {
        let (handle, child) = mock_pair(true);
        let (mut session, _launcher, mut rx) = session_with(vec![handle]);
        session.start().await.unwrap();

        // The child never reads; leave too little room for the exit token.
        let filler = "x".repeat(1_020);
        assert!(session.send_line(&filler).await.unwrap());

        let report = tokio::time::timeout(Duration::from_secs(2), session.stop())
            .await
            .expect("stop must not wait on a full input pipe");
        assert!(report.was_forced());
        assert_eq!(report.exit, ShutdownExit::Killed(ProcessStatus::Terminated));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("exit request not accepted"));
        assert_eq!(session.state(), SessionState::Idle);
        drop(child);

        assert!(matches!(next_event(&mut rx).await, SessionEvent::Diagnostic(_)));
        assert_eq!(next_event(&mut rx).await, SessionEvent::Ended);
    }

    #[tokio::test]
    async fn test_stop_from_paused_resumes_first() {
        let (handle, child) = mock_pair(true);
        let (mut session, _launcher, _rx) = session_with(vec![handle]);
        session.start().await.unwrap();
        session.pause().await.unwrap();

        session.stop().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(
            *child.signals.lock().unwrap(),
            [ControlSignal::Suspend, ControlSignal::Continue]
        );
    }

    #[tokio::test]
    async fn test_stop_when_idle_and_restart() {
        let (first, _first_child) = mock_pair(true);
        let (second, _second_child) = mock_pair(true);
        let (mut session, _launcher, _rx) = session_with(vec![second, first]);

        assert_eq!(session.stop().await, StopReport::not_running());

        session.start().await.unwrap();
        session.stop().await;
        assert_eq!(session.state(), SessionState::Idle);

        let outcome = session.start().await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert_eq!(session.state(), SessionState::Running);
    }
}
