//! # Transcript Persistence
//!
//! Durable home of finished transcripts. The session coordinator creates
//! exactly one transcript per completed (or disconnected) session that
//! produced non-empty text; nothing in this core ever mutates a transcript
//! after creation.

pub mod store;

pub use store::{
    InMemoryTranscriptStore, Transcript, TranscriptSource, TranscriptStore,
    TranscriptStoreError, TranslationSpan,
};
