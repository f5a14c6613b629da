//! # Streaming Transcription Engine
//!
//! Bridges one logical session to one external speech-recognition stream,
//! hiding provider-specific chunking and event delivery. Each session is
//! independent: the engine can start, feed, and end sessions for different
//! users concurrently.
//!
//! ## Invariants:
//! - Exactly one provider stream per session, bound for the session's
//!   lifetime; a provider stream never outlives its session.
//! - Recognition updates for a session are delivered to `on_update` in
//!   provider arrival order (a single forwarder task per session consumes
//!   the provider channel sequentially).
//! - Finalized segments are concatenated in arrival order; a partial
//!   always replaces the previous partial, never appends.

use crate::providers::recognizer::{RecognitionEvent, RecognizerStream, SpeechRecognizer};
use crate::streaming::session::SessionMode;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long `end_session` waits for the forwarder to drain trailing
/// recognition results after the provider stream is closed.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// One recognition result, tagged with the session it belongs to.
#[derive(Debug, Clone)]
pub struct RecognitionUpdate {
    pub session_id: String,
    pub text: String,
    pub is_final: bool,
}

/// Errors surfaced by engine operations.
#[derive(Debug)]
pub enum EngineError {
    /// The session was already ended. An expected race for late chunks,
    /// handled as a no-op by callers
    SessionNotFound(String),
    /// A stream for this session id is already open
    SessionActive(String),
    /// Provider-side failure
    Provider(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::SessionNotFound(id) => write!(f, "session not found: {}", id),
            EngineError::SessionActive(id) => write!(f, "session already active: {}", id),
            EngineError::Provider(msg) => write!(f, "provider error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// Engine-side state for one active session.
struct EngineSession {
    /// The bound provider stream. Its own mutex serializes chunk pushes
    /// for this session without blocking other sessions.
    stream: Arc<tokio::sync::Mutex<Box<dyn RecognizerStream>>>,
    /// Task draining provider events into the caller's update channel
    forwarder: JoinHandle<()>,
    /// Finalized text accumulated so far, in arrival order
    final_text: Arc<Mutex<String>>,
}

/// The engine: a registry of engine sessions over one recognizer.
pub struct StreamingEngine {
    recognizer: Arc<dyn SpeechRecognizer>,
    sessions: Mutex<HashMap<String, EngineSession>>,
}

impl StreamingEngine {
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        Self {
            recognizer,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a provider stream and start a session.
    ///
    /// Recognition results are delivered asynchronously to `on_update` as
    /// they arrive from the provider. Returns the session id (a fresh v4
    /// unless the caller supplied one).
    pub async fn start_session(
        &self,
        user_id: &str,
        mode: SessionMode,
        language: &str,
        session_id: Option<String>,
        on_update: mpsc::UnboundedSender<RecognitionUpdate>,
    ) -> Result<String, EngineError> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.sessions.lock().unwrap().contains_key(&session_id) {
            return Err(EngineError::SessionActive(session_id));
        }

        let (provider_tx, mut provider_rx) = mpsc::unbounded_channel::<RecognitionEvent>();
        let stream = self
            .recognizer
            .open_stream(language, provider_tx)
            .await
            .map_err(|e| EngineError::Provider(e.to_string()))?;

        let final_text = Arc::new(Mutex::new(String::new()));
        let forwarder = {
            let final_text = final_text.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                while let Some(event) = provider_rx.recv().await {
                    if event.is_final && !event.text.is_empty() {
                        let mut text = final_text.lock().unwrap();
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(&event.text);
                    }
                    let update = RecognitionUpdate {
                        session_id: session_id.clone(),
                        text: event.text,
                        is_final: event.is_final,
                    };
                    if on_update.send(update).is_err() {
                        // Consumer gone; keep draining so final_text stays
                        // complete for the end-session flush.
                        continue;
                    }
                }
            })
        };

        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&session_id) {
            // Lost a start race for the same id while the stream opened
            forwarder.abort();
            return Err(EngineError::SessionActive(session_id));
        }
        sessions.insert(
            session_id.clone(),
            EngineSession {
                stream: Arc::new(tokio::sync::Mutex::new(stream)),
                forwarder,
                final_text,
            },
        );
        drop(sessions);

        info!(
            session_id = %session_id,
            user_id = %user_id,
            mode = ?mode,
            language = %language,
            "recognition stream opened"
        );
        Ok(session_id)
    }

    /// Forward raw audio bytes to the session's provider stream.
    ///
    /// `SessionNotFound` after `end_session` is an expected race (late
    /// chunk); callers swallow it rather than fail the connection.
    pub async fn process_chunk(
        &self,
        session_id: &str,
        bytes: &[u8],
        is_final: bool,
    ) -> Result<(), EngineError> {
        let stream = {
            let sessions = self.sessions.lock().unwrap();
            match sessions.get(session_id) {
                Some(session) => session.stream.clone(),
                None => return Err(EngineError::SessionNotFound(session_id.to_string())),
            }
        };

        let mut stream = stream.lock().await;
        stream
            .push_audio(bytes, is_final)
            .await
            .map_err(|e| EngineError::Provider(e.to_string()))
    }

    /// Close the provider stream, flush trailing recognition results, and
    /// return the accumulated finalized text.
    ///
    /// Idempotent: ending an unknown (already-ended) session returns `Ok`
    /// with empty text, because disconnect and explicit end can race.
    pub async fn end_session(&self, session_id: &str) -> Result<String, EngineError> {
        let session = match self.sessions.lock().unwrap().remove(session_id) {
            Some(session) => session,
            None => {
                debug!(session_id = %session_id, "end for unknown session, no-op");
                return Ok(String::new());
            }
        };

        {
            let mut stream = session.stream.lock().await;
            if let Err(e) = stream.close().await {
                warn!(session_id = %session_id, error = %e, "provider stream close failed");
            }
        }

        // The provider drops its event sender on close; wait for the
        // forwarder to drain whatever is still queued.
        if tokio::time::timeout(FLUSH_TIMEOUT, session.forwarder)
            .await
            .is_err()
        {
            warn!(session_id = %session_id, "recognition flush timed out");
        }

        let final_text = session.final_text.lock().unwrap().clone();
        info!(
            session_id = %session_id,
            chars = final_text.len(),
            "recognition stream closed"
        );
        Ok(final_text)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(session_id)
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
