//! # Response Sinks
//!
//! Where a session's background pump hands each inbound response. Any
//! `FnMut(LogicalMessage)` closure is a sink; the module also provides:
//!
//! - `LoggingSink`: logs every response at debug level (info for text)
//! - `CollectingSink`: keeps responses in memory, shareable across tasks
//! - `TranscriptSink`: renders JSON transcription results for a terminal

use serde::Deserialize;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::protocol::frame::LogicalMessage;

/// Receives responses from a session's background pump, in arrival order.
pub trait ResponseSink: Send + 'static {
    fn on_response(&mut self, response: LogicalMessage);
}

impl<F> ResponseSink for F
where
    F: FnMut(LogicalMessage) + Send + 'static,
{
    fn on_response(&mut self, response: LogicalMessage) {
        self(response)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl ResponseSink for LoggingSink {
    fn on_response(&mut self, response: LogicalMessage) {
        match response {
            LogicalMessage::Text(text) => info!(response = %text, "Received response"),
            LogicalMessage::Binary(data) => debug!(bytes = data.len(), "Received binary response"),
        }
    }
}

/// Stores every response; clones share the same storage.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    responses: Arc<Mutex<Vec<LogicalMessage>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responses(&self) -> Vec<LogicalMessage> {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseSink for CollectingSink {
    fn on_response(&mut self, response: LogicalMessage) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(response);
    }
}

/// One streaming transcription result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptResult {
    #[serde(default)]
    pub channel: Option<TranscriptChannel>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub speech_final: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptChannel {
    #[serde(default)]
    pub alternatives: Vec<TranscriptAlternative>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptAlternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub confidence: f64,
}

impl TranscriptResult {
    /// Terminal line for this result, or `None` when the top alternative is blank.
    ///
    /// Final results (`is_final` and `speech_final`) show their confidence;
    /// everything else is tagged `[interim]`.
    pub fn render(&self) -> Option<String> {
        let best = self.channel.as_ref()?.alternatives.first()?;
        let transcript = best.transcript.trim();
        if transcript.is_empty() {
            return None;
        }

        if self.is_final && self.speech_final {
            Some(format!("✓ {} ({:.1}%)", transcript, best.confidence * 100.0))
        } else {
            Some(format!("  {} [interim]", transcript))
        }
    }
}

/// Prints rendered transcripts to a writer (stdout by default).
pub struct TranscriptSink<W: Write + Send + 'static = io::Stdout> {
    out: W,
}

impl TranscriptSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write + Send + 'static> TranscriptSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn render_text(&mut self, text: &str) {
        let result: TranscriptResult = match serde_json::from_str(text) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, response = %text, "Response is not a transcription result");
                return;
            }
        };

        if let Some(line) = result.render() {
            if let Err(e) = writeln!(self.out, "{}", line) {
                warn!(error = %e, "Failed to write transcript");
            }
        }
    }
}

impl<W: Write + Send + 'static> ResponseSink for TranscriptSink<W> {
    fn on_response(&mut self, response: LogicalMessage) {
        match response {
            LogicalMessage::Text(text) => self.render_text(&text),
            LogicalMessage::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => self.render_text(text),
                Err(_) => warn!(bytes = data.len(), "Binary response is not UTF-8, skipping"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn result(json: &str) -> TranscriptResult {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_final_result_shows_confidence() {
        let line = result(
            r#"{"channel":{"alternatives":[{"transcript":"hello world","confidence":0.987}]},
                "is_final":true,"speech_final":true}"#,
        )
        .render();
        assert_eq!(line.as_deref(), Some("✓ hello world (98.7%)"));
    }

    #[test]
    fn test_non_speech_final_is_interim() {
        let line = result(
            r#"{"channel":{"alternatives":[{"transcript":"hello","confidence":0.5}]},
                "is_final":true,"speech_final":false}"#,
        )
        .render();
        assert_eq!(line.as_deref(), Some("  hello [interim]"));
    }

    #[test]
    fn test_blank_or_missing_transcripts_render_nothing() {
        assert_eq!(result(r#"{"channel":{"alternatives":[{"transcript":"   "}]}}"#).render(), None);
        assert_eq!(result(r#"{"channel":{"alternatives":[]}}"#).render(), None);
        assert_eq!(result(r#"{"type":"Metadata"}"#).render(), None);
    }

    #[test]
    fn test_transcript_sink_writes_lines_and_skips_junk() {
        let mut sink = TranscriptSink::new(Vec::new());
        sink.on_response(LogicalMessage::Text("not json".to_string()));
        sink.on_response(LogicalMessage::Binary(Bytes::from_static(
            br#"{"channel":{"alternatives":[{"transcript":"hi"}]}}"#,
        )));
        sink.on_response(LogicalMessage::Binary(Bytes::from_static(&[0xff, 0xfe])));

        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(written, "  hi [interim]\n");
    }

    #[test]
    fn test_collecting_sink_shares_storage() {
        let sink = CollectingSink::new();
        let mut writer = sink.clone();
        writer.on_response(LogicalMessage::Text("a".to_string()));
        writer.on_response(LogicalMessage::Text("b".to_string()));

        assert_eq!(
            sink.responses(),
            vec![
                LogicalMessage::Text("a".to_string()),
                LogicalMessage::Text("b".to_string())
            ]
        );
    }

    #[test]
    fn test_closure_is_a_sink() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut sink: Box<dyn ResponseSink> = Box::new(move |_: LogicalMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sink.on_response(LogicalMessage::Text("x".to_string()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
