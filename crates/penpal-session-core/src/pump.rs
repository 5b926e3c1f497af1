//! Line pumps: one task per child output stream that turns bytes into
//! ordered, terminator-stripped lines for an [`OutputSink`].

use crate::config::TrailingLinePolicy;
use crate::error::SessionError;
use crate::session::SessionState;
use crate::sink::OutputSink;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which child stream a pump is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum StreamKind {
    #[display("stdout")]
    Stdout,
    #[display("stderr")]
    Stderr,
}

/// Why a pump stopped reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEnd {
    /// The peer closed the stream
    Eof,
    /// The pump was cancelled before the stream closed
    Cancelled,
    /// Reading failed
    Failed(String),
}

/// One decoded unit of child output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineFrame {
    /// A complete line, terminator removed
    Line(String),
    /// A line longer than the configured cap was dropped whole
    Oversized { length: usize },
}

/// Splits a byte stream on `\n`, dropping the terminator and a preceding `\r`.
///
/// Without a cap, lines of any length are delivered intact. With a cap, a
/// longer line is skipped up to its terminator and reported as
/// [`LineFrame::Oversized`]; fragments are never delivered.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: Option<usize>,
    next_index: usize,
    /// Bytes of an over-long line skipped so far
    discarding: Option<usize>,
    trailing: TrailingLinePolicy,
}

impl LineCodec {
    pub fn new(max_length: Option<usize>, trailing: TrailingLinePolicy) -> Self {
        Self {
            max_length: max_length.map(|max| max.max(1)),
            next_index: 0,
            discarding: None,
            trailing,
        }
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(None, TrailingLinePolicy::Discard)
    }
}

impl Decoder for LineCodec {
    type Item = LineFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(skipped) = self.discarding {
            return match src.iter().position(|b| *b == b'\n') {
                Some(newline) => {
                    let _ = src.split_to(newline + 1);
                    self.discarding = None;
                    self.next_index = 0;
                    Ok(Some(LineFrame::Oversized {
                        length: skipped + newline,
                    }))
                }
                None => {
                    self.discarding = Some(skipped + src.len());
                    src.clear();
                    Ok(None)
                }
            };
        }

        // Only look at bytes that could still belong to a line of allowed length.
        let limit = match self.max_length {
            Some(max) => src.len().min(max + 1),
            None => src.len(),
        };
        let start = self.next_index.min(limit);

        if let Some(offset) = src[start..limit].iter().position(|b| *b == b'\n') {
            let newline = start + offset;
            self.next_index = 0;
            let line = src.split_to(newline + 1);
            return Ok(Some(LineFrame::Line(decode_line(&line[..newline]))));
        }

        if let Some(max) = self.max_length {
            if src.len() > max {
                debug!(max_length = max, "skipping over-long output line");
                self.next_index = 0;
                self.discarding = Some(0);
                return self.decode(src);
            }
        }

        self.next_index = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        self.next_index = 0;
        if let Some(skipped) = self.discarding.take() {
            return Ok(Some(LineFrame::Oversized { length: skipped }));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let rest = src.split();
        match self.trailing {
            TrailingLinePolicy::Flush => Ok(Some(LineFrame::Line(decode_line(&rest)))),
            TrailingLinePolicy::Discard => {
                debug!(bytes = rest.len(), "discarding unterminated trailing output");
                Ok(None)
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// A running reader task bound to one child stream and one sink
pub struct LinePump {
    stream: StreamKind,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<PumpEnd>>,
    end: Option<PumpEnd>,
}

impl LinePump {
    /// Start reading `source` on the current tokio runtime.
    ///
    /// `state` is only read, to tell an unexpected end of stream (while the
    /// conversation is active) from the expected one during shutdown.
    pub fn spawn<R>(
        stream: StreamKind,
        source: R,
        sink: Arc<dyn OutputSink>,
        state: watch::Receiver<SessionState>,
        codec: LineCodec,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(pump_lines(
            stream,
            source,
            sink,
            state,
            codec,
            cancel.clone(),
            running.clone(),
        ));

        Self {
            stream,
            cancel,
            running,
            task: Some(task),
            end: None,
        }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    /// `false` once the pump has stopped reading
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the pump to stop; takes effect at its next await point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the pump task to finish. Safe to call more than once.
    pub async fn join(&mut self) -> PumpEnd {
        if let Some(task) = self.task.as_mut() {
            let end = match task.await {
                Ok(end) => end,
                Err(e) => PumpEnd::Failed(format!("pump task failed: {e}")),
            };
            self.task = None;
            self.running.store(false, Ordering::Release);
            self.end = Some(end);
        }
        self.end.clone().unwrap_or(PumpEnd::Cancelled)
    }

    /// Let the pump drain for up to `drain`, then cancel it and join.
    pub async fn finish(&mut self, drain: Duration) -> PumpEnd {
        if tokio::time::timeout(drain, self.join()).await.is_err() {
            debug!(stream = %self.stream, ?drain, "pump still reading after drain window, cancelling");
            self.cancel();
        }
        self.join().await
    }
}

impl Drop for LinePump {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump_lines<R>(
    stream: StreamKind,
    source: R,
    sink: Arc<dyn OutputSink>,
    state: watch::Receiver<SessionState>,
    codec: LineCodec,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
) -> PumpEnd
where
    R: AsyncRead + Send + Unpin,
{
    let mut frames = FramedRead::new(source, codec);

    let end = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(LineFrame::Line(line))) => deliver(stream, sink.as_ref(), &line).await,
            Some(Ok(LineFrame::Oversized { length })) => {
                warn!(%stream, length, "dropped over-long child output line");
                sink.on_diagnostic(&format!(
                    "Dropped an over-long {stream} line ({length} bytes)"
                ))
                .await;
            }
            Some(Err(e)) => break PumpEnd::Failed(e.to_string()),
            None => break PumpEnd::Eof,
        }
    };

    // Close the read endpoint before reporting.
    drop(frames);
    report_end(stream, &end, &state, sink.as_ref()).await;
    running.store(false, Ordering::Release);
    end
}

async fn deliver(stream: StreamKind, sink: &dyn OutputSink, line: &str) {
    match stream {
        StreamKind::Stdout => sink.on_line(line).await,
        StreamKind::Stderr => {
            debug!(target: "penpal_session::child_stderr", "{line}");
            sink.on_diagnostic(line).await;
        }
    }
}

async fn report_end(
    stream: StreamKind,
    end: &PumpEnd,
    state: &watch::Receiver<SessionState>,
    sink: &dyn OutputSink,
) {
    let state = *state.borrow();
    let expected = matches!(end, PumpEnd::Cancelled) || !state.is_active();

    if expected {
        debug!(%stream, ?end, %state, "pump finished");
        return;
    }

    let error = SessionError::ReadEnded { stream };
    match end {
        PumpEnd::Failed(reason) => {
            warn!(%stream, %reason, "child stream failed while conversation active");
            sink.on_diagnostic(&format!("{error}: {reason}")).await;
        }
        _ => {
            warn!(%stream, "child stream closed while conversation active");
            sink.on_diagnostic(&error.to_string()).await;
        }
    }
}
