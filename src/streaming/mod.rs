//! # Real-time Streaming Transcription Core
//!
//! The subsystem that turns a socket full of audio chunks into a persisted
//! transcript:
//!
//! - `engine`: bridges one live session to one external recognition stream
//!   and delivers ordered partial/final recognition updates.
//! - `coordinator`: the per-connection state machine for join/chunk/end
//!   handling, backpressure, partial stabilization, translation, quota
//!   enforcement, and exactly-once transcript persistence.
//! - `session`: the session registry and per-session state.
//! - `events`: the wire protocol spoken over the WebSocket.

pub mod coordinator;
pub mod engine;
pub mod events;
pub mod session;

pub use coordinator::{CoordinatorConfig, SessionCoordinator};
pub use engine::{EngineError, RecognitionUpdate, StreamingEngine};
pub use events::{ClientMessage, ConnectionEvent, ErrorCode, ServerMessage, SessionStatusKind};
pub use session::{LiveSession, SessionMode, SessionRegistry};
