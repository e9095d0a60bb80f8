//! Submission progress reporting.
//!
//! The submission workflow reports what it is doing as a sequence of
//! [`ProgressEvent`]s. Over HTTP the events are written as newline-delimited
//! JSON, one object per line, and the stream ends when the workflow drops
//! its reporter. On the command line the same events are printed on
//! **stderr** so stdout stays parseable for scripts.
//!
//! ```json
//! {"type":"info","message":"Validating files...","step":"validation"}
//! {"type":"success","message":"Published","step":"complete","url":"https://..."}
//! ```

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Info,
    Success,
    Error,
    Warning,
}

/// Workflow step an event belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Validation,
    Upload,
    Build,
    Complete,
    Error,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Validation => "validation",
            Step::Upload => "upload",
            Step::Build => "build",
            Step::Complete => "complete",
            Step::Error => "error",
        }
    }
}

/// A single progress event: `{ type, message, step, url? }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    pub step: Step,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, step: Step, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step,
            url: None,
        }
    }

    pub fn info(step: Step, message: impl Into<String>) -> Self {
        Self::new(EventKind::Info, step, message)
    }

    pub fn success(step: Step, message: impl Into<String>) -> Self {
        Self::new(EventKind::Success, step, message)
    }

    pub fn error(step: Step, message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, step, message)
    }

    pub fn warning(step: Step, message: impl Into<String>) -> Self {
        Self::new(EventKind::Warning, step, message)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// One NDJSON line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"type":"error","message":"unserializable event","step":"{}"}}"#,
                self.step.as_str()
            )
        });
        line.push('\n');
        line
    }
}

/// Receives progress events from the workflow.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Feeds an HTTP response body. Events are dropped once the client is gone.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Create a reporter and the matching stream of NDJSON lines. The stream
/// ends once the reporter is dropped.
pub fn channel() -> (
    ChannelProgress,
    impl Stream<Item = Result<String, std::convert::Infallible>>,
) {
    let (tx, rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event.to_line()), rx))
    });
    (ChannelProgress { tx }, stream)
}

/// Human-friendly progress on stderr: `[upload] ok  Published to github`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let tag = match event.kind {
            EventKind::Info => "..",
            EventKind::Success => "ok",
            EventKind::Error => "!!",
            EventKind::Warning => "??",
        };
        let mut line = format!("[{}] {}  {}", event.step.as_str(), tag, event.message);
        if let Some(url) = &event.url {
            line.push_str(&format!("  {}", url));
        }
        line.push('\n');
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = std::io::stderr().lock().write_all(event.to_line().as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Keeps every event in memory; used by the client and by tests.
#[derive(Default)]
pub struct CollectProgress {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl CollectProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressReporter for CollectProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Incremental NDJSON decoder for chunked response bodies.
///
/// Chunk boundaries do not line up with lines, so partial lines are kept
/// until their newline arrives. Lines that are not valid events are skipped.
#[derive(Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<ProgressEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<ProgressEvent> {
        let rest = std::mem::take(&mut self.buf);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<ProgressEvent> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed progress line");
            None
        }
    }
}
