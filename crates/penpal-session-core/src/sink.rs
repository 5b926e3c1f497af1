use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tracing::{trace, warn};

/// Line written to the transcript when a conversation ends
pub const SESSION_ENDED_NOTICE: &str = "Conversation Ended";

/// Consumer of everything a session produces.
///
/// Each pump calls its methods sequentially, but the stdout pump, the stderr
/// pump and the controller may call concurrently with each other.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// One complete line from the child's standard output
    async fn on_line(&self, text: &str);

    /// A child stderr line, or a status/error message from the session
    async fn on_diagnostic(&self, text: &str);

    /// Called once when `Session::stop` completes
    async fn on_session_ended(&self);
}

/// Event form of the [`OutputSink`] callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Line(String),
    Diagnostic(String),
    Ended,
}

/// Forwards session output over a channel, so a front end can consume it
/// on whatever task or thread it renders from.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            trace!("session event receiver dropped");
        }
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn on_line(&self, text: &str) {
        self.send(SessionEvent::Line(text.to_string()));
    }

    async fn on_diagnostic(&self, text: &str) {
        self.send(SessionEvent::Diagnostic(text.to_string()));
    }

    async fn on_session_ended(&self) {
        self.send(SessionEvent::Ended);
    }
}

/// Shared async writer used by [`WriterSink`]
pub struct SinkWriter(Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>);

impl Clone for SinkWriter {
    fn clone(&self) -> Self {
        SinkWriter(self.0.clone())
    }
}

impl SinkWriter {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> SinkWriter {
        SinkWriter(Arc::new(Mutex::new(t)))
    }

    pub async fn write_line(&self, text: &str) -> std::io::Result<()> {
        let mut lock = self.0.lock().await;
        lock.write_all(text.as_bytes()).await?;
        lock.write_all(b"\n").await?;
        lock.flush().await
    }
}

/// Writes the transcript to one writer and diagnostics to another
#[derive(Clone)]
pub struct WriterSink {
    transcript: SinkWriter,
    diagnostics: SinkWriter,
}

impl WriterSink {
    pub fn new(transcript: SinkWriter, diagnostics: SinkWriter) -> Self {
        Self {
            transcript,
            diagnostics,
        }
    }

    /// Transcript to the process's stdout, diagnostics to its stderr
    pub fn stdio() -> Self {
        Self::new(
            SinkWriter::new(Box::new(tokio::io::stdout())),
            SinkWriter::new(Box::new(tokio::io::stderr())),
        )
    }
}

#[async_trait]
impl OutputSink for WriterSink {
    async fn on_line(&self, text: &str) {
        if let Err(e) = self.transcript.write_line(text).await {
            warn!(error = %e, "failed to write transcript line");
        }
    }

    async fn on_diagnostic(&self, text: &str) {
        if let Err(e) = self.diagnostics.write_line(text).await {
            warn!(error = %e, "failed to write diagnostic line");
        }
    }

    async fn on_session_ended(&self) {
        if let Err(e) = self
            .transcript
            .write_line(&format!("\n{SESSION_ENDED_NOTICE}"))
            .await
        {
            warn!(error = %e, "failed to write session end notice");
        }
    }
}
