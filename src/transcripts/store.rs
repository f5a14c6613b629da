//! # Transcript Store
//!
//! The `Transcript` record and the persistence seam for it. Downstream
//! CRUD (listing, editing, export) lives outside this core; the only
//! operation the session machinery needs is `save`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

/// Where a transcript came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    Live,
    FileUpload,
}

/// An attached translation of the transcript content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationSpan {
    pub target_language: String,
    pub translated_text: String,
    pub timestamp: DateTime<Utc>,
}

/// A finished transcript, persisted once and never mutated by this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Session duration in seconds
    pub duration_secs: f64,
    pub source: TranscriptSource,
    pub language: String,
    pub translation: Option<TranslationSpan>,
    /// Cloud-sync flag: true means the transcript only exists locally
    pub is_local: bool,
}

impl Transcript {
    /// Build a transcript for a finished live session. The title is the
    /// first few words of the content, which is what the downstream list
    /// views show.
    pub fn live(
        user_id: &str,
        content: String,
        duration_secs: f64,
        language: &str,
        is_local: bool,
    ) -> Self {
        let title = content
            .split_whitespace()
            .take(6)
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title,
            content,
            timestamp: Utc::now(),
            duration_secs,
            source: TranscriptSource::Live,
            language: language.to_string(),
            translation: None,
            is_local,
        }
    }
}

#[derive(Debug)]
pub enum TranscriptStoreError {
    Unavailable(String),
}

impl fmt::Display for TranscriptStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptStoreError::Unavailable(msg) => {
                write!(f, "transcript store unavailable: {}", msg)
            }
        }
    }
}

impl std::error::Error for TranscriptStoreError {}

/// Persistence seam for finished transcripts.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn save(&self, transcript: Transcript) -> Result<(), TranscriptStoreError>;
}

/// In-memory transcript store, used for development and tests.
pub struct InMemoryTranscriptStore {
    transcripts: Mutex<Vec<Transcript>>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self {
            transcripts: Mutex::new(Vec::new()),
        }
    }

    pub fn all(&self) -> Vec<Transcript> {
        self.transcripts.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.transcripts.lock().unwrap().len()
    }
}

impl Default for InMemoryTranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn save(&self, transcript: Transcript) -> Result<(), TranscriptStoreError> {
        tracing::info!(
            transcript_id = %transcript.id,
            user_id = %transcript.user_id,
            chars = transcript.content.len(),
            duration_secs = transcript.duration_secs,
            "transcript saved"
        );
        self.transcripts.lock().unwrap().push(transcript);
        Ok(())
    }
}
