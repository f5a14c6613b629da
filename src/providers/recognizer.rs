//! # Speech Recognition Provider Seam
//!
//! Abstracts one external speech-to-text stream. The streaming engine opens
//! exactly one `RecognizerStream` per live session, pushes raw audio bytes
//! into it, and receives recognition events back over an async channel.
//!
//! ## Event Semantics:
//! - `is_final = false`: a revisable partial hypothesis for the segment
//!   currently being spoken. Each partial fully replaces the previous one.
//! - `is_final = true`: a stable segment the provider will not revise.
//!   Final segments arrive in utterance order.
//!
//! A provider adapter must drop its event sender when the stream is closed
//! so the consumer can observe end-of-stream and flush trailing results.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// One recognition result emitted by the provider stream.
#[derive(Debug, Clone)]
pub struct RecognitionEvent {
    /// Recognized text for the current segment
    pub text: String,
    /// Whether this segment is finalized (true) or a revisable partial (false)
    pub is_final: bool,
}

/// Errors surfaced by a provider stream.
#[derive(Debug)]
pub enum RecognizerError {
    /// The stream was already closed when audio arrived
    StreamClosed,
    /// Vendor-side failure (network, quota, protocol)
    Provider(String),
}

impl fmt::Display for RecognizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognizerError::StreamClosed => write!(f, "recognizer stream is closed"),
            RecognizerError::Provider(msg) => write!(f, "recognizer provider error: {}", msg),
        }
    }
}

impl std::error::Error for RecognizerError {}

/// Factory for provider streams. One implementation per vendor.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Open a recognition stream for the given source language.
    ///
    /// Recognition results are delivered asynchronously through `events`,
    /// in the order the provider produces them.
    async fn open_stream(
        &self,
        language: &str,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognizerStream>, RecognizerError>;
}

/// One live provider stream, bound 1:1 to a session for its lifetime.
#[async_trait]
pub trait RecognizerStream: Send {
    /// Forward raw audio bytes to the provider.
    ///
    /// `is_final` hints that this is the last chunk of an utterance, for
    /// providers that support explicit segment boundaries.
    async fn push_audio(&mut self, bytes: &[u8], is_final: bool) -> Result<(), RecognizerError>;

    /// Close the stream. The provider flushes any trailing recognition
    /// result to the event channel and then drops its sender.
    async fn close(&mut self) -> Result<(), RecognizerError>;
}

/// Default wiring point used when no vendor adapter is configured:
/// accepts audio and never emits a result. Real deployments replace this
/// with a vendor adapter at startup.
pub struct SilentRecognizer;

#[async_trait]
impl SpeechRecognizer for SilentRecognizer {
    async fn open_stream(
        &self,
        language: &str,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognizerStream>, RecognizerError> {
        tracing::debug!(language = %language, "opening silent recognizer stream");
        Ok(Box::new(SilentStream {
            _events: Some(events),
            closed: false,
        }))
    }
}

struct SilentStream {
    // Held so the channel stays open until close(); dropped there so the
    // consumer sees end-of-stream.
    _events: Option<mpsc::UnboundedSender<RecognitionEvent>>,
    closed: bool,
}

#[async_trait]
impl RecognizerStream for SilentStream {
    async fn push_audio(&mut self, _bytes: &[u8], _is_final: bool) -> Result<(), RecognizerError> {
        if self.closed {
            return Err(RecognizerError::StreamClosed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RecognizerError> {
        self.closed = true;
        self._events = None;
        Ok(())
    }
}

/// Scripted recognizer for tests: every opened stream is exposed as a
/// [`RecognizerTap`] so a test can inject recognition events and inspect
/// the audio the stream received.
#[cfg(test)]
pub struct ScriptedRecognizer {
    taps: std::sync::Mutex<Vec<RecognizerTap>>,
}

/// Shared slot for the event sender: the tap emits through it, the stream
/// empties it on close so the channel actually closes.
#[cfg(test)]
type SharedSender =
    std::sync::Arc<std::sync::Mutex<Option<mpsc::UnboundedSender<RecognitionEvent>>>>;

#[cfg(test)]
#[derive(Clone)]
pub struct RecognizerTap {
    events: SharedSender,
    /// Audio chunks the stream has received so far.
    pub received: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    /// Set once the stream has been closed.
    pub closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
    /// Language the stream was opened with.
    pub language: String,
}

#[cfg(test)]
impl RecognizerTap {
    /// Inject a recognition event as the provider would. No-op once the
    /// stream has been closed.
    pub fn emit(&self, text: &str, is_final: bool) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(RecognitionEvent {
                text: text.to_string(),
                is_final,
            });
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self {
            taps: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn tap(&self, index: usize) -> RecognizerTap {
        self.taps.lock().unwrap()[index].clone()
    }

    pub fn open_count(&self) -> usize {
        self.taps.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn open_stream(
        &self,
        language: &str,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognizerStream>, RecognizerError> {
        let shared: SharedSender = std::sync::Arc::new(std::sync::Mutex::new(Some(events)));
        let tap = RecognizerTap {
            events: shared.clone(),
            received: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
            closed: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            language: language.to_string(),
        };
        self.taps.lock().unwrap().push(tap.clone());
        Ok(Box::new(ScriptedStream {
            events: shared,
            received: tap.received,
            closed: tap.closed,
        }))
    }
}

#[cfg(test)]
struct ScriptedStream {
    events: SharedSender,
    received: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
#[async_trait]
impl RecognizerStream for ScriptedStream {
    async fn push_audio(&mut self, bytes: &[u8], _is_final: bool) -> Result<(), RecognizerError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RecognizerError::StreamClosed);
        }
        self.received.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RecognizerError> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        // Dropping the sender closes the event channel, which is how the
        // consumer observes end-of-stream.
        self.events.lock().unwrap().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silent_stream_accepts_audio_until_closed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut stream = SilentRecognizer.open_stream("en", tx).await.unwrap();

        assert!(stream.push_audio(&[1, 2, 3], false).await.is_ok());
        stream.close().await.unwrap();
        assert!(matches!(
            stream.push_audio(&[4], false).await,
            Err(RecognizerError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn scripted_recognizer_records_audio_and_forwards_events() {
        let recognizer = ScriptedRecognizer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut stream = recognizer.open_stream("ha-NG", tx).await.unwrap();

        stream.push_audio(&[9, 9], false).await.unwrap();
        let tap = recognizer.tap(0);
        assert_eq!(tap.received.lock().unwrap().len(), 1);
        assert_eq!(tap.language, "ha-NG");

        tap.emit("sannu", false);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.text, "sannu");
        assert!(!event.is_final);

        stream.close().await.unwrap();
        assert!(tap.is_closed());
        // Channel is closed after the stream drops its sender
        assert!(rx.recv().await.is_none());
    }
}
