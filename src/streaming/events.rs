//! # WebSocket Protocol Events
//!
//! Message types spoken over the live-transcription WebSocket, in both
//! directions, plus the error codes surfaced at that boundary.
//!
//! ## Protocol Summary:
//! 1. Client sends `join_session` and receives `session_status{active}`
//!    followed by `ready`.
//! 2. Audio flows one chunk at a time: each accepted `audio_chunk` is
//!    acknowledged with `ready` before the client may send the next one.
//! 3. The server pushes `transcript_update` events as recognition results
//!    arrive (revisable partials, then finalized segments).
//! 4. `end_session` (or a plain disconnect) finalizes and persists.

use crate::streaming::session::SessionMode;
use serde::{Deserialize, Serialize};

/// Client → server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Open (or rejoin) a live transcription session
    #[serde(rename = "join_session")]
    JoinSession {
        /// Rejoin token; omitted for a fresh session
        session_id: Option<String>,
        /// Defaults to `online`, which requires premium entitlement
        mode: Option<SessionMode>,
        /// Authenticated user id; omitted for anonymous sessions
        user_id: Option<String>,
        source_language: Option<String>,
        target_language: Option<String>,
    },

    /// Replace the session's language pair
    #[serde(rename = "update_languages")]
    UpdateLanguages {
        source_language: String,
        target_language: String,
    },

    /// One audio chunk, base64-encoded. Binary WebSocket frames carry the
    /// same payload without the JSON envelope.
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        session_id: Option<String>,
        chunk: String,
        is_final: Option<bool>,
    },

    /// Finish the session and persist the transcript
    #[serde(rename = "end_session")]
    EndSession { session_id: Option<String> },
}

/// Session status values broadcast to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusKind {
    Active,
    Completed,
    LimitExceeded,
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Ack: the transport may accept the next audio chunk
    #[serde(rename = "ready")]
    Ready,

    #[serde(rename = "session_status")]
    SessionStatus {
        session_id: String,
        status: SessionStatusKind,
    },

    /// A transcription result. `text` is the current segment; `full_text`
    /// is the stable prefix combined with it; `translation` is empty when
    /// no translation applies.
    #[serde(rename = "transcript_update")]
    TranscriptUpdate {
        session_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        full_text: Option<String>,
        translation: String,
        is_final: bool,
    },

    #[serde(rename = "languages_updated")]
    LanguagesUpdated {
        session_id: String,
        source_language: String,
        target_language: String,
    },

    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

/// Machine-readable error codes surfaced at the socket boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "BAD_REQUEST")]
    BadRequest,
    #[serde(rename = "PREMIUM_REQUIRED")]
    PremiumRequired,
    #[serde(rename = "REALTIME_STREAMING_LIMIT_EXCEEDED")]
    RealtimeStreamingLimitExceeded,
    #[serde(rename = "USAGE_CHECK_ERROR")]
    UsageCheckError,
    #[serde(rename = "NO_SESSION")]
    NoSession,
    #[serde(rename = "PAYLOAD_TOO_LARGE")]
    PayloadTooLarge,
    #[serde(rename = "PROCESSING_ERROR")]
    ProcessingError,
    #[serde(rename = "END_ERROR")]
    EndError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::PremiumRequired => "PREMIUM_REQUIRED",
            ErrorCode::RealtimeStreamingLimitExceeded => "REALTIME_STREAMING_LIMIT_EXCEEDED",
            ErrorCode::UsageCheckError => "USAGE_CHECK_ERROR",
            ErrorCode::NoSession => "NO_SESSION",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::ProcessingError => "PROCESSING_ERROR",
            ErrorCode::EndError => "END_ERROR",
        }
    }
}

/// What the coordinator pushes to a connection's outbox. The socket actor
/// serializes `Send` payloads onto the wire and closes the transport on
/// `Close` (forced end, e.g. quota exhaustion).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Send(ServerMessage),
    Close,
}
