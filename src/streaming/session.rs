//! # Live Session State and Registry
//!
//! Per-session state for one active live-transcription interaction, and
//! the registry the coordinator owns. The registry is the single home of
//! mutable session state: sessions are inserted on join and removed
//! exactly once on end/disconnect, so the end-of-session work (usage
//! recording, transcript persistence) can never run twice.
//!
//! ## Locking Discipline:
//! The registry mutex is only ever held for short, synchronous state
//! updates, never across provider I/O, translation calls, or ledger
//! writes. Callers read what they need under the lock, drop it, then
//! await.

use crate::streaming::events::ConnectionEvent;
use crate::usage::quota::Tier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Session mode. `online` requires premium entitlement; `offline`
/// sessions are transcribed with the on-device/offline pipeline and
/// persisted locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Online,
    Offline,
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::Online
    }
}

/// In-memory state for one active session.
pub struct LiveSession {
    pub session_id: String,
    pub mode: SessionMode,
    /// Resolved owning identity, or the `anonymous` sentinel
    pub user_id: String,
    pub tier: Tier,
    /// Whether usage accounting applies to this session
    pub authenticated: bool,
    pub source_language: String,
    pub target_language: String,
    /// Session start, for duration-based usage accounting
    pub started_at: Instant,
    /// Accumulated finalized text (append-only within the session)
    pub stable_prefix: String,
    /// Most recent unconfirmed partial (replaced, never appended)
    pub pending_partial: String,
    /// Last partial actually broadcast, for dedupe
    pub last_emitted_partial: String,
    /// Start of the current partial throttle window; `None` once a final
    /// clears the partial state
    pub last_partial_emit_at: Option<Instant>,
    /// Deferred broadcast of the pending partial at the window boundary
    pub partial_flush: Option<JoinHandle<()>>,
    /// Backpressure flag: whether the transport may accept another chunk
    pub ready: bool,
    /// Channel to the owning connection's socket actor
    pub outbox: mpsc::UnboundedSender<ConnectionEvent>,
    /// Periodic quota re-check task, armed for authenticated sessions
    pub quota_timer: Option<JoinHandle<()>>,
}

impl LiveSession {
    pub fn new(
        session_id: String,
        mode: SessionMode,
        user_id: String,
        tier: Tier,
        authenticated: bool,
        source_language: String,
        target_language: String,
        outbox: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            session_id,
            mode,
            user_id,
            tier,
            authenticated,
            source_language,
            target_language,
            started_at: Instant::now(),
            stable_prefix: String::new(),
            pending_partial: String::new(),
            last_emitted_partial: String::new(),
            last_partial_emit_at: None,
            partial_flush: None,
            ready: true,
            outbox,
            quota_timer: None,
        }
    }

    /// Append a finalized segment to the stable prefix, space-joined.
    pub fn append_final(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.stable_prefix.is_empty() {
            self.stable_prefix.push(' ');
        }
        self.stable_prefix.push_str(text);
    }

    /// Stable prefix combined with the given partial, space-joined.
    pub fn combined_with(&self, partial: &str) -> String {
        join_nonempty(&self.stable_prefix, partial)
    }

    /// Best-effort final text at session end: the stable prefix with any
    /// trailing un-finalized partial folded in.
    pub fn final_text(&self) -> String {
        join_nonempty(&self.stable_prefix, &self.pending_partial)
    }

    pub fn elapsed_minutes(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64() / 60.0
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Some(timer) = self.quota_timer.take() {
            timer.abort();
        }
        if let Some(flush) = self.partial_flush.take() {
            flush.abort();
        }
    }
}

fn join_nonempty(prefix: &str, suffix: &str) -> String {
    match (prefix.is_empty(), suffix.is_empty()) {
        (true, _) => suffix.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{} {}", prefix, suffix),
    }
}

/// Registry of active sessions, keyed by session id.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, LiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, session: LiveSession) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.session_id.clone(), session);
    }

    /// Remove and return a session. Only one caller can win this, which
    /// is the exactly-once guarantee for end-of-session work.
    pub fn remove(&self, session_id: &str) -> Option<LiveSession> {
        self.sessions.lock().unwrap().remove(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a closure against a session's state under the registry lock.
    /// Returns `None` when the session no longer exists (a late event
    /// after end, which callers treat as a no-op).
    pub fn with_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut LiveSession) -> R,
    ) -> Option<R> {
        self.sessions.lock().unwrap().get_mut(session_id).map(f)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::quota::Tier;

    fn session(id: &str) -> (LiveSession, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LiveSession::new(
                id.to_string(),
                SessionMode::Offline,
                "anonymous".to_string(),
                Tier::Free,
                false,
                "en".to_string(),
                "en".to_string(),
                tx,
            ),
            rx,
        )
    }

    #[test]
    fn finals_append_space_joined_in_order() {
        let (mut s, _rx) = session("s1");
        s.append_final("hello");
        s.append_final("world");
        s.append_final("");
        s.append_final("again");
        assert_eq!(s.stable_prefix, "hello world again");
    }

    #[test]
    fn combined_text_handles_empty_sides() {
        let (mut s, _rx) = session("s1");
        assert_eq!(s.combined_with("partial"), "partial");
        s.append_final("stable");
        assert_eq!(s.combined_with("partial"), "stable partial");
        assert_eq!(s.combined_with(""), "stable");
    }

    #[test]
    fn final_text_folds_in_trailing_partial() {
        let (mut s, _rx) = session("s1");
        s.append_final("sannu da zuwa");
        s.pending_partial = "yaya".to_string();
        assert_eq!(s.final_text(), "sannu da zuwa yaya");
    }

    #[test]
    fn remove_is_exactly_once() {
        let registry = SessionRegistry::new();
        let (s, _rx) = session("s1");
        registry.insert(s);
        assert!(registry.contains("s1"));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("s1").is_some());
        assert!(registry.remove("s1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn with_session_is_none_after_removal() {
        let registry = SessionRegistry::new();
        let (s, _rx) = session("s1");
        registry.insert(s);
        assert_eq!(
            registry.with_session("s1", |s| s.ready),
            Some(true)
        );
        registry.remove("s1");
        assert_eq!(registry.with_session("s1", |s| s.ready), None);
    }
}
