//! # Session Coordinator
//!
//! The state machine between one WebSocket connection and the rest of the
//! system. For every session it enforces entitlement and quota at join,
//! runs the one-chunk-in-flight backpressure protocol, stabilizes the
//! recognition stream into a broadcastable transcript, attaches
//! translations, and performs the end-of-session work exactly once.
//!
//! ## Recognition Flow:
//! Each session gets one consumer task draining the engine's update
//! channel sequentially, so partials and finals are applied to session
//! state and broadcast in provider order. Finalized segments append to a
//! stable prefix; a partial replaces the previous one, is deduped, and
//! rides a throttle window: inside an open window the latest hypothesis
//! is held and flushed at the boundary instead of broadcast immediately.
//!
//! ## End of Session:
//! Explicit `end_session` and a plain disconnect share one finalize path,
//! guarded by the registry's remove-exactly-once semantics. Finalize
//! closes the engine stream, folds any trailing partial into the text,
//! records consumed minutes (best effort), and persists the transcript.

use crate::config::AppConfig;
use crate::providers::identity::IdentityProvider;
use crate::providers::translator::{needs_translation, Translator};
use crate::state::AppMetrics;
use crate::streaming::engine::{EngineError, RecognitionUpdate, StreamingEngine};
use crate::streaming::events::{ConnectionEvent, ErrorCode, ServerMessage, SessionStatusKind};
use crate::streaming::session::{LiveSession, SessionMode, SessionRegistry};
use crate::transcripts::{Transcript, TranscriptStore};
use crate::usage::ledger::UsageLedger;
use crate::usage::quota::UsageCategory;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Coordinator knobs, lifted from [`AppConfig`] at startup.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Hard cap on one decoded audio chunk
    pub max_chunk_bytes: usize,
    /// Minimum spacing between partial broadcasts per session
    pub partial_throttle: Duration,
    /// How often active authenticated sessions are re-checked against quota
    pub quota_recheck: Duration,
    /// Minutes probed against the quota at join time
    pub preflight_probe_minutes: f64,
}

impl CoordinatorConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            max_chunk_bytes: config.streaming.max_chunk_bytes,
            partial_throttle: Duration::from_millis(config.streaming.partial_throttle_ms),
            quota_recheck: Duration::from_secs(config.usage.quota_recheck_secs),
            preflight_probe_minutes: config.usage.preflight_probe_minutes,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// Outcome of applying one partial to session state under the registry
/// lock. The broadcast itself happens after the lock is released.
enum PartialAction {
    /// Broadcast now; the throttle window just reopened
    Emit {
        full_text: String,
        source: String,
        target: String,
        outbox: mpsc::UnboundedSender<ConnectionEvent>,
    },
    /// Inside an open window: flush the latest hypothesis at its boundary
    Defer(Duration),
    /// Deduped, a flush is already armed, or the session is gone
    Skip,
}

/// Owns the session registry and wires engine, ledger, translator,
/// transcript store, and identity lookup together.
pub struct SessionCoordinator {
    engine: Arc<StreamingEngine>,
    ledger: Arc<UsageLedger>,
    translator: Arc<dyn Translator>,
    transcripts: Arc<dyn TranscriptStore>,
    identities: Arc<dyn IdentityProvider>,
    registry: SessionRegistry,
    metrics: Arc<RwLock<AppMetrics>>,
    config: CoordinatorConfig,
}

impl SessionCoordinator {
    pub fn new(
        engine: Arc<StreamingEngine>,
        ledger: Arc<UsageLedger>,
        translator: Arc<dyn Translator>,
        transcripts: Arc<dyn TranscriptStore>,
        identities: Arc<dyn IdentityProvider>,
        metrics: Arc<RwLock<AppMetrics>>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            engine,
            ledger,
            translator,
            transcripts,
            identities,
            registry: SessionRegistry::new(),
            metrics,
            config,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Handle `join_session`: entitlement and quota gates, then an engine
    /// stream plus registry entry. Returns the session id on success, or
    /// `None` after an error event has been sent to the client.
    #[allow(clippy::too_many_arguments)]
    pub async fn join_session(
        self: Arc<Self>,
        session_id: Option<String>,
        mode: Option<SessionMode>,
        user_id: Option<String>,
        source_language: Option<String>,
        target_language: Option<String>,
        outbox: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Option<String> {
        let mode = mode.unwrap_or_default();
        let source_language = source_language.unwrap_or_else(|| "en".to_string());
        let target_language = target_language.unwrap_or_else(|| source_language.clone());

        let identity = match self.identities.resolve(user_id.as_deref()).await {
            Ok(identity) => identity,
            Err(e) => {
                error!(error = %e, "identity lookup failed at join");
                send(
                    &outbox,
                    error_event(ErrorCode::UsageCheckError, "Could not verify account", None),
                );
                return None;
            }
        };

        if mode == SessionMode::Online && !identity.premium {
            send(
                &outbox,
                error_event(
                    ErrorCode::PremiumRequired,
                    "Online transcription requires a premium subscription",
                    None,
                ),
            );
            return None;
        }

        // Pre-flight probe for a minimal slice of quota. The real duration
        // is recorded at session end; the check/record pair is not atomic.
        if identity.is_authenticated() {
            let decision = match self
                .ledger
                .check_usage(
                    &identity.user_id,
                    identity.tier,
                    UsageCategory::RealTimeStreaming,
                    self.config.preflight_probe_minutes,
                )
                .await
            {
                Ok(decision) => decision,
                Err(e) => {
                    error!(user_id = %identity.user_id, error = %e, "usage check failed at join");
                    send(
                        &outbox,
                        error_event(
                            ErrorCode::UsageCheckError,
                            "Could not verify usage quota",
                            None,
                        ),
                    );
                    return None;
                }
            };
            if !decision.allowed {
                info!(
                    user_id = %identity.user_id,
                    tier = ?decision.tier,
                    "join denied, streaming quota exhausted"
                );
                send(
                    &outbox,
                    error_event(
                        ErrorCode::RealtimeStreamingLimitExceeded,
                        decision
                            .reason
                            .as_deref()
                            .unwrap_or("Daily streaming limit reached"),
                        serde_json::to_value(&decision).ok(),
                    ),
                );
                return None;
            }
        }

        // Rejoin: the session survives a transport drop; bind it to the
        // new connection's outbox.
        if let Some(id) = session_id.as_deref() {
            let rebound = self.registry.with_session(id, |session| {
                session.outbox = outbox.clone();
                session.ready = true;
            });
            if rebound.is_some() {
                debug!(session_id = %id, "rejoined existing session");
                send(
                    &outbox,
                    ServerMessage::SessionStatus {
                        session_id: id.to_string(),
                        status: SessionStatusKind::Active,
                    },
                );
                send(&outbox, ServerMessage::Ready);
                return Some(id.to_string());
            }
        }

        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let session_id = match self
            .engine
            .start_session(
                &identity.user_id,
                mode,
                &source_language,
                session_id,
                update_tx,
            )
            .await
        {
            Ok(id) => id,
            Err(EngineError::SessionActive(id)) => {
                send(
                    &outbox,
                    error_event(
                        ErrorCode::BadRequest,
                        &format!("Session {} is already active", id),
                        None,
                    ),
                );
                return None;
            }
            Err(e) => {
                error!(error = %e, "failed to open recognition stream");
                send(
                    &outbox,
                    error_event(
                        ErrorCode::ProcessingError,
                        "Could not start transcription",
                        None,
                    ),
                );
                return None;
            }
        };

        let authenticated = identity.is_authenticated();
        self.registry.insert(LiveSession::new(
            session_id.clone(),
            mode,
            identity.user_id.clone(),
            identity.tier,
            authenticated,
            source_language,
            target_language,
            outbox.clone(),
        ));

        // One consumer per session keeps recognition updates in order.
        let consumer = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                Arc::clone(&consumer).handle_recognition(update).await;
            }
        });

        if authenticated {
            let timer = Arc::clone(&self).spawn_quota_timer(session_id.clone());
            self.registry
                .with_session(&session_id, |session| session.quota_timer = Some(timer));
        }

        {
            let mut metrics = self.metrics.write().unwrap();
            metrics.sessions_started += 1;
            metrics.active_sessions = self.registry.len();
        }

        info!(
            session_id = %session_id,
            user_id = %identity.user_id,
            mode = ?mode,
            "session joined"
        );
        send(
            &outbox,
            ServerMessage::SessionStatus {
                session_id: session_id.clone(),
                status: SessionStatusKind::Active,
            },
        );
        send(&outbox, ServerMessage::Ready);
        Some(session_id)
    }

    /// Handle one `audio_chunk` with a base64 payload. The protocol allows
    /// a single chunk in flight: a chunk arriving while another is being
    /// processed is dropped without a reply, and every accepted chunk is
    /// answered with `ready` once processing finishes.
    pub async fn audio_chunk(
        &self,
        session_id: &str,
        chunk: &str,
        is_final: bool,
        outbox: &mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        if !self.try_accept(session_id, outbox) {
            return;
        }

        let bytes = match STANDARD.decode(chunk) {
            Ok(bytes) => bytes,
            Err(e) => {
                send(
                    outbox,
                    error_event(
                        ErrorCode::BadRequest,
                        &format!("Invalid base64 audio payload: {}", e),
                        None,
                    ),
                );
                self.restore_ready(session_id, outbox);
                return;
            }
        };

        self.process_accepted(session_id, &bytes, is_final, outbox)
            .await;
    }

    /// Same as [`audio_chunk`](Self::audio_chunk) for a raw binary frame,
    /// which carries the audio without the JSON envelope.
    pub async fn audio_bytes(
        &self,
        session_id: &str,
        bytes: &[u8],
        is_final: bool,
        outbox: &mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        if !self.try_accept(session_id, outbox) {
            return;
        }
        self.process_accepted(session_id, bytes, is_final, outbox)
            .await;
    }

    /// Claim the one-chunk window. A missing session gets `NO_SESSION`;
    /// a chunk racing an in-flight one is dropped without a reply.
    fn try_accept(
        &self,
        session_id: &str,
        outbox: &mpsc::UnboundedSender<ConnectionEvent>,
    ) -> bool {
        let accepted = self.registry.with_session(session_id, |session| {
            if !session.ready {
                return false;
            }
            session.ready = false;
            true
        });
        match accepted {
            None => {
                send(
                    outbox,
                    error_event(ErrorCode::NoSession, "No active session", None),
                );
                false
            }
            Some(false) => {
                debug!(session_id = %session_id, "chunk dropped, previous one still in flight");
                false
            }
            Some(true) => true,
        }
    }

    async fn process_accepted(
        &self,
        session_id: &str,
        bytes: &[u8],
        is_final: bool,
        outbox: &mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        if bytes.len() > self.config.max_chunk_bytes {
            send(
                outbox,
                error_event(
                    ErrorCode::PayloadTooLarge,
                    &format!(
                        "Audio chunk of {} bytes exceeds the {} byte limit",
                        bytes.len(),
                        self.config.max_chunk_bytes
                    ),
                    None,
                ),
            );
            self.restore_ready(session_id, outbox);
            return;
        }

        match self.engine.process_chunk(session_id, bytes, is_final).await {
            Ok(()) => {
                self.metrics.write().unwrap().chunks_received += 1;
            }
            Err(EngineError::SessionNotFound(_)) => {
                // The session ended while this chunk was in flight.
                debug!(session_id = %session_id, "late chunk after session end, dropped");
                return;
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "chunk processing failed");
                send(
                    outbox,
                    error_event(ErrorCode::ProcessingError, "Failed to process audio", None),
                );
            }
        }

        self.restore_ready(session_id, outbox);
    }

    /// Re-open the one-chunk window and ack the client.
    fn restore_ready(&self, session_id: &str, outbox: &mpsc::UnboundedSender<ConnectionEvent>) {
        self.registry
            .with_session(session_id, |session| session.ready = true);
        send(outbox, ServerMessage::Ready);
    }

    /// Replace the session's language pair mid-stream. Takes effect from
    /// the next recognition update.
    pub async fn update_languages(
        &self,
        session_id: &str,
        source_language: String,
        target_language: String,
        outbox: &mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        if source_language.trim().is_empty() || target_language.trim().is_empty() {
            send(
                outbox,
                error_event(
                    ErrorCode::BadRequest,
                    "source_language and target_language must be non-empty",
                    None,
                ),
            );
            return;
        }
        let updated = self.registry.with_session(session_id, |session| {
            session.source_language = source_language.clone();
            session.target_language = target_language.clone();
        });
        if updated.is_none() {
            send(
                outbox,
                error_event(ErrorCode::NoSession, "No active session", None),
            );
            return;
        }
        info!(
            session_id = %session_id,
            source = %source_language,
            target = %target_language,
            "session languages updated"
        );
        send(
            outbox,
            ServerMessage::LanguagesUpdated {
                session_id: session_id.to_string(),
                source_language,
                target_language,
            },
        );
    }

    /// Handle an explicit `end_session`.
    pub async fn end_session(
        &self,
        session_id: &str,
        outbox: &mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        match self.registry.remove(session_id) {
            Some(session) => {
                self.finalize(session, SessionStatusKind::Completed).await;
            }
            None => {
                send(
                    outbox,
                    error_event(ErrorCode::NoSession, "No active session to end", None),
                );
            }
        }
    }

    /// Handle a transport drop. Same finalize path as an explicit end;
    /// silently a no-op when the connection never had a session or the
    /// session was already ended.
    pub async fn handle_disconnect(&self, session_id: &str) {
        if let Some(session) = self.registry.remove(session_id) {
            info!(session_id = %session_id, "connection dropped, finalizing session");
            self.finalize(session, SessionStatusKind::Completed).await;
        }
    }

    /// Apply one recognition update to session state and broadcast it.
    ///
    /// Runs on the session's consumer task, so updates for one session are
    /// processed strictly in arrival order. Updates for a session that no
    /// longer exists are dropped.
    async fn handle_recognition(self: Arc<Self>, update: RecognitionUpdate) {
        if update.is_final {
            self.handle_final(update).await;
        } else {
            self.handle_partial(update).await;
        }
    }

    /// Apply a revisable partial. At most one partial is broadcast per
    /// throttle window; a partial arriving inside an open window is held
    /// and the latest hypothesis is flushed when the window closes, so a
    /// burst of rapid partials surfaces only its newest text.
    async fn handle_partial(self: Arc<Self>, update: RecognitionUpdate) {
        let throttle = self.config.partial_throttle;
        let decision = self.registry.with_session(&update.session_id, |session| {
            session.pending_partial = update.text.clone();

            if update.text == session.last_emitted_partial {
                return PartialAction::Skip;
            }
            if session
                .partial_flush
                .as_ref()
                .is_some_and(|flush| !flush.is_finished())
            {
                // An armed flush will pick up the latest hypothesis.
                return PartialAction::Skip;
            }
            // The window opens at session start and reopens at every
            // partial broadcast; a final clears it.
            let window_started = session.last_partial_emit_at.unwrap_or(session.started_at);
            let elapsed = window_started.elapsed();
            if elapsed < throttle {
                return PartialAction::Defer(throttle - elapsed);
            }

            session.last_emitted_partial = update.text.clone();
            session.last_partial_emit_at = Some(Instant::now());
            PartialAction::Emit {
                full_text: session.combined_with(&update.text),
                source: session.source_language.clone(),
                target: session.target_language.clone(),
                outbox: session.outbox.clone(),
            }
        });

        match decision {
            Some(PartialAction::Emit {
                full_text,
                source,
                target,
                outbox,
            }) => {
                let translation = self.translate_segment(&update.text, &source, &target).await;
                send(
                    &outbox,
                    ServerMessage::TranscriptUpdate {
                        session_id: update.session_id,
                        text: update.text,
                        full_text: Some(full_text),
                        translation,
                        is_final: false,
                    },
                );
            }
            Some(PartialAction::Defer(delay)) => {
                let coordinator = Arc::clone(&self);
                let session_id = update.session_id.clone();
                let flush = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    coordinator.flush_partial(&session_id).await;
                });
                // If the session ended while spawning, the flush task
                // finds no session and no-ops.
                self.registry.with_session(&update.session_id, |session| {
                    session.partial_flush = Some(flush);
                });
            }
            // Deduped, already armed, or the session is gone
            _ => {}
        }
    }

    /// Broadcast the pending partial at a throttle window boundary.
    async fn flush_partial(&self, session_id: &str) {
        let captured = self.registry.with_session(session_id, |session| {
            session.partial_flush = None;
            let text = session.pending_partial.clone();
            if text.is_empty() || text == session.last_emitted_partial {
                return None;
            }
            session.last_emitted_partial = text.clone();
            session.last_partial_emit_at = Some(Instant::now());
            Some((
                text.clone(),
                session.combined_with(&text),
                session.source_language.clone(),
                session.target_language.clone(),
                session.outbox.clone(),
            ))
        });

        let (text, full_text, source, target, outbox) = match captured {
            Some(Some(captured)) => captured,
            _ => return,
        };

        let translation = self.translate_segment(&text, &source, &target).await;
        send(
            &outbox,
            ServerMessage::TranscriptUpdate {
                session_id: session_id.to_string(),
                text,
                full_text: Some(full_text),
                translation,
                is_final: false,
            },
        );
    }

    async fn handle_final(&self, update: RecognitionUpdate) {
        let captured = self.registry.with_session(&update.session_id, |session| {
            session.append_final(&update.text);
            session.pending_partial.clear();
            session.last_emitted_partial.clear();
            session.last_partial_emit_at = None;
            (
                session.partial_flush.take(),
                session.stable_prefix.clone(),
                session.source_language.clone(),
                session.target_language.clone(),
                session.outbox.clone(),
            )
        });

        let (flush, full_text, source, target, outbox) = match captured {
            Some(captured) => captured,
            None => return,
        };
        // The final supersedes any partial still waiting at the boundary.
        if let Some(flush) = flush {
            flush.abort();
        }

        let translation = self.translate_segment(&update.text, &source, &target).await;
        send(
            &outbox,
            ServerMessage::TranscriptUpdate {
                session_id: update.session_id,
                text: update.text,
                full_text: Some(full_text),
                translation,
                is_final: true,
            },
        );
    }

    /// End-of-session work, reached exactly once per session through
    /// `registry.remove`. Never fails the caller: every step past the
    /// engine close is best effort, reported to the client where a
    /// connection still exists.
    async fn finalize(&self, mut session: LiveSession, status: SessionStatusKind) {
        if let Some(timer) = session.quota_timer.take() {
            timer.abort();
        }
        if let Some(flush) = session.partial_flush.take() {
            flush.abort();
        }

        let engine_text = match self.engine.end_session(&session.session_id).await {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "engine end failed");
                String::new()
            }
        };

        // The registry's stable prefix is authoritative; the engine's
        // accumulation only fills in if no update ever reached us.
        let mut content = session.final_text();
        if content.is_empty() {
            content = engine_text;
        }
        let duration_secs = session.started_at.elapsed().as_secs_f64();

        if !content.is_empty() {
            let translation = self
                .translate_segment(&content, &session.source_language, &session.target_language)
                .await;
            send(
                &session.outbox,
                ServerMessage::TranscriptUpdate {
                    session_id: session.session_id.clone(),
                    text: content.clone(),
                    full_text: Some(content.clone()),
                    translation,
                    is_final: true,
                },
            );
        }
        send(
            &session.outbox,
            ServerMessage::SessionStatus {
                session_id: session.session_id.clone(),
                status,
            },
        );

        // Consumption already happened; a store failure here is logged,
        // not surfaced.
        if session.authenticated {
            if let Err(e) = self
                .ledger
                .record_usage(
                    &session.user_id,
                    UsageCategory::RealTimeStreaming,
                    session.elapsed_minutes(),
                )
                .await
            {
                error!(
                    session_id = %session.session_id,
                    user_id = %session.user_id,
                    error = %e,
                    "failed to record session usage"
                );
            }
        }

        if !content.is_empty() {
            let transcript = Transcript::live(
                &session.user_id,
                content,
                duration_secs,
                &session.source_language,
                session.mode == SessionMode::Offline,
            );
            match self.transcripts.save(transcript).await {
                Ok(()) => {
                    self.metrics.write().unwrap().transcripts_persisted += 1;
                }
                Err(e) => {
                    error!(session_id = %session.session_id, error = %e, "transcript save failed");
                    send(
                        &session.outbox,
                        error_event(ErrorCode::EndError, "Failed to save the transcript", None),
                    );
                }
            }
        }

        let mut metrics = self.metrics.write().unwrap();
        metrics.active_sessions = self.registry.len();
    }

    /// Periodic quota re-check for an authenticated session. Checks the
    /// elapsed-but-unrecorded minutes against the remaining daily quota
    /// and force-ends the session on exhaustion.
    fn spawn_quota_timer(self: Arc<Self>, session_id: String) -> tokio::task::JoinHandle<()> {
        let recheck = self.config.quota_recheck;
        let coordinator = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(recheck);
            interval.tick().await;
            loop {
                interval.tick().await;

                let probe = coordinator.registry.with_session(&session_id, |session| {
                    (session.user_id.clone(), session.tier, session.elapsed_minutes())
                });
                let (user_id, tier, elapsed) = match probe {
                    Some(probe) => probe,
                    None => break,
                };

                match coordinator
                    .ledger
                    .check_usage(&user_id, tier, UsageCategory::RealTimeStreaming, elapsed)
                    .await
                {
                    Ok(decision) if !decision.allowed => {
                        warn!(
                            session_id = %session_id,
                            user_id = %user_id,
                            "quota exhausted mid-session, force-ending"
                        );
                        coordinator.force_end_for_quota(&session_id, decision).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Transient store failure mid-session: keep the
                        // session alive and retry next tick.
                        warn!(session_id = %session_id, error = %e, "quota re-check failed");
                    }
                }
            }
        })
    }

    /// Force-end from the quota timer. Runs on the timer task itself, so
    /// the handle is detached (not aborted) before finalize to avoid
    /// cancelling this very task mid-finalize.
    async fn force_end_for_quota(
        &self,
        session_id: &str,
        decision: crate::usage::ledger::UsageDecision,
    ) {
        let mut session = match self.registry.remove(session_id) {
            Some(session) => session,
            None => return,
        };
        drop(session.quota_timer.take());

        let outbox = session.outbox.clone();
        send(
            &outbox,
            error_event(
                ErrorCode::RealtimeStreamingLimitExceeded,
                decision
                    .reason
                    .as_deref()
                    .unwrap_or("Daily streaming limit reached"),
                serde_json::to_value(&decision).ok(),
            ),
        );
        self.finalize(session, SessionStatusKind::LimitExceeded).await;
        let _ = outbox.send(ConnectionEvent::Close);
    }

    async fn translate_segment(&self, text: &str, source: &str, target: &str) -> String {
        if !needs_translation(source, target, text) {
            return String::new();
        }
        match self.translator.translate(text, source, target).await {
            Ok(translated) => translated,
            Err(e) => {
                // Translation never blocks a broadcast.
                warn!(error = %e, "translation failed, broadcasting without it");
                String::new()
            }
        }
    }
}

fn send(outbox: &mpsc::UnboundedSender<ConnectionEvent>, message: ServerMessage) {
    // The receiving connection may already be gone; that is fine.
    let _ = outbox.send(ConnectionEvent::Send(message));
}

fn error_event(code: ErrorCode, message: &str, details: Option<serde_json::Value>) -> ServerMessage {
    ServerMessage::Error {
        code,
        message: message.to_string(),
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::identity::{Identity, StaticIdentityProvider};
    use crate::providers::recognizer::ScriptedRecognizer;
    use crate::providers::translator::NoopTranslator;
    use crate::transcripts::{InMemoryTranscriptStore, TranscriptSource};
    use crate::usage::ledger::UsageLedger;
    use crate::usage::quota::Tier;
    use crate::usage::store::{InMemoryUsageStore, UsageStore};
    use chrono::Utc;
    use tokio::time::{sleep, timeout};

    struct Harness {
        recognizer: Arc<ScriptedRecognizer>,
        usage: Arc<InMemoryUsageStore>,
        transcripts: Arc<InMemoryTranscriptStore>,
        identities: Arc<StaticIdentityProvider>,
        engine: Arc<StreamingEngine>,
        coordinator: Arc<SessionCoordinator>,
        outbox: mpsc::UnboundedSender<ConnectionEvent>,
        inbox: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    fn harness(config: CoordinatorConfig) -> Harness {
        let recognizer = Arc::new(ScriptedRecognizer::new());
        let usage = Arc::new(InMemoryUsageStore::new());
        let transcripts = Arc::new(InMemoryTranscriptStore::new());
        let identities = Arc::new(StaticIdentityProvider::new());
        let engine = Arc::new(StreamingEngine::new(recognizer.clone()));
        let coordinator = Arc::new(SessionCoordinator::new(
            engine.clone(),
            Arc::new(UsageLedger::new(usage.clone())),
            Arc::new(NoopTranslator),
            transcripts.clone(),
            identities.clone(),
            Arc::new(RwLock::new(AppMetrics::default())),
            config,
        ));
        let (outbox, inbox) = mpsc::unbounded_channel();
        Harness {
            recognizer,
            usage,
            transcripts,
            identities,
            engine,
            coordinator,
            outbox,
            inbox,
        }
    }

    impl Harness {
        async fn next(&mut self) -> ServerMessage {
            match timeout(Duration::from_secs(2), self.inbox.recv())
                .await
                .expect("timed out waiting for a server message")
                .expect("outbox closed")
            {
                ConnectionEvent::Send(msg) => msg,
                ConnectionEvent::Close => panic!("unexpected close"),
            }
        }

        async fn next_event(&mut self) -> ConnectionEvent {
            timeout(Duration::from_secs(2), self.inbox.recv())
                .await
                .expect("timed out waiting for a connection event")
                .expect("outbox closed")
        }

        async fn join_offline(&mut self, user_id: Option<&str>) -> String {
            let id = self
                .coordinator
                .clone()
                .join_session(
                    None,
                    Some(SessionMode::Offline),
                    user_id.map(str::to_string),
                    Some("ha-NG".to_string()),
                    Some("ha-NG".to_string()),
                    self.outbox.clone(),
                )
                .await
                .expect("join rejected");
            assert!(matches!(
                self.next().await,
                ServerMessage::SessionStatus {
                    status: SessionStatusKind::Active,
                    ..
                }
            ));
            assert!(matches!(self.next().await, ServerMessage::Ready));
            id
        }

        async fn send_chunk(&mut self, session_id: &str, payload: &[u8]) {
            self.coordinator
                .audio_chunk(session_id, &STANDARD.encode(payload), false, &self.outbox)
                .await;
            assert!(matches!(self.next().await, ServerMessage::Ready));
        }
    }

    fn no_throttle() -> CoordinatorConfig {
        CoordinatorConfig {
            partial_throttle: Duration::ZERO,
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn anonymous_offline_session_end_to_end() {
        let mut h = harness(no_throttle());
        let id = h.join_offline(None).await;

        h.send_chunk(&id, &[1u8; 64]).await;
        h.send_chunk(&id, &[2u8; 64]).await;
        h.send_chunk(&id, &[3u8; 64]).await;
        assert_eq!(h.recognizer.tap(0).received.lock().unwrap().len(), 3);

        h.recognizer.tap(0).emit("sannu", false);
        match h.next().await {
            ServerMessage::TranscriptUpdate {
                text,
                full_text,
                translation,
                is_final,
                ..
            } => {
                assert_eq!(text, "sannu");
                assert_eq!(full_text.as_deref(), Some("sannu"));
                // Same base language: no translation attached
                assert_eq!(translation, "");
                assert!(!is_final);
            }
            other => panic!("expected a partial transcript update, got {:?}", other),
        }

        h.recognizer.tap(0).emit("sannu da zuwa", true);
        match h.next().await {
            ServerMessage::TranscriptUpdate {
                text,
                full_text,
                is_final,
                ..
            } => {
                assert_eq!(text, "sannu da zuwa");
                assert_eq!(full_text.as_deref(), Some("sannu da zuwa"));
                assert!(is_final);
            }
            other => panic!("expected a final transcript update, got {:?}", other),
        }

        h.coordinator.end_session(&id, &h.outbox.clone()).await;
        match h.next().await {
            ServerMessage::TranscriptUpdate { text, is_final, .. } => {
                assert_eq!(text, "sannu da zuwa");
                assert!(is_final);
            }
            other => panic!("expected the closing transcript update, got {:?}", other),
        }
        assert!(matches!(
            h.next().await,
            ServerMessage::SessionStatus {
                status: SessionStatusKind::Completed,
                ..
            }
        ));

        let saved = h.transcripts.all();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].content, "sannu da zuwa");
        assert_eq!(saved[0].source, TranscriptSource::Live);
        assert_eq!(saved[0].language, "ha-NG");
        assert!(saved[0].is_local);
        assert_eq!(h.coordinator.active_sessions(), 0);
        assert!(h.recognizer.tap(0).is_closed());
    }

    #[tokio::test]
    async fn online_mode_requires_premium() {
        let mut h = harness(no_throttle());
        let result = h
            .coordinator
            .clone()
            .join_session(
                None,
                Some(SessionMode::Online),
                Some("free-user".to_string()),
                None,
                None,
                h.outbox.clone(),
            )
            .await;
        assert!(result.is_none());
        assert!(matches!(
            h.next().await,
            ServerMessage::Error {
                code: ErrorCode::PremiumRequired,
                ..
            }
        ));
        assert_eq!(h.engine.active_session_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_quota_is_rejected_at_join() {
        let mut h = harness(no_throttle());
        // Free tier streaming quota is 10 minutes/day
        h.usage
            .add_minutes(
                "heavy-user",
                UsageCategory::RealTimeStreaming,
                10.0,
                Utc::now().date_naive(),
            )
            .await
            .unwrap();

        let result = h
            .coordinator
            .clone()
            .join_session(
                None,
                Some(SessionMode::Offline),
                Some("heavy-user".to_string()),
                None,
                None,
                h.outbox.clone(),
            )
            .await;
        assert!(result.is_none());
        match h.next().await {
            ServerMessage::Error { code, details, .. } => {
                assert_eq!(code, ErrorCode::RealtimeStreamingLimitExceeded);
                let details = details.expect("denial carries the decision");
                assert_eq!(details["allowed"], serde_json::json!(false));
                assert_eq!(details["remaining_minutes"], serde_json::json!(0.0));
            }
            other => panic!("expected a limit error, got {:?}", other),
        }
        assert_eq!(h.engine.active_session_count(), 0);
        assert_eq!(h.transcripts.count(), 0);
    }

    #[tokio::test]
    async fn premium_user_joins_online_mode() {
        let mut h = harness(no_throttle());
        h.identities.insert(Identity {
            user_id: "pro".to_string(),
            premium: true,
            tier: Tier::Premium,
        });

        let id = h
            .coordinator
            .clone()
            .join_session(
                None,
                Some(SessionMode::Online),
                Some("pro".to_string()),
                Some("en".to_string()),
                Some("fr".to_string()),
                h.outbox.clone(),
            )
            .await
            .expect("premium join");
        assert!(matches!(
            h.next().await,
            ServerMessage::SessionStatus {
                status: SessionStatusKind::Active,
                ..
            }
        ));
        assert!(matches!(h.next().await, ServerMessage::Ready));

        // Differing base languages attach a translation
        h.recognizer.tap(0).emit("hello", true);
        match h.next().await {
            ServerMessage::TranscriptUpdate { translation, .. } => {
                assert_eq!(translation, "hello"); // passthrough translator
            }
            other => panic!("expected a transcript update, got {:?}", other),
        }
        h.coordinator.handle_disconnect(&id).await;
    }

    #[tokio::test]
    async fn identical_partials_are_broadcast_once() {
        let mut h = harness(no_throttle());
        let id = h.join_offline(None).await;

        h.recognizer.tap(0).emit("sannu", false);
        h.recognizer.tap(0).emit("sannu", false);
        h.recognizer.tap(0).emit("sannu da", false);

        match h.next().await {
            ServerMessage::TranscriptUpdate { text, .. } => assert_eq!(text, "sannu"),
            other => panic!("expected a partial, got {:?}", other),
        }
        // The duplicate was suppressed: the next broadcast is the new text
        match h.next().await {
            ServerMessage::TranscriptUpdate { text, .. } => assert_eq!(text, "sannu da"),
            other => panic!("expected a partial, got {:?}", other),
        }
        h.coordinator.handle_disconnect(&id).await;
    }

    #[tokio::test]
    async fn rapid_partials_are_throttled() {
        let mut h = harness(CoordinatorConfig {
            partial_throttle: Duration::from_secs(60),
            ..CoordinatorConfig::default()
        });
        let id = h.join_offline(None).await;

        h.recognizer.tap(0).emit("one", false);
        h.recognizer.tap(0).emit("one two", false);
        h.recognizer.tap(0).emit("one two three", false);

        // Let the consumer task absorb all three hypotheses.
        sleep(Duration::from_millis(100)).await;

        // Nothing was broadcast: the window is still open and the flush
        // waits at its boundary. Ending now folds the latest hypothesis
        // into the persisted text.
        h.coordinator.end_session(&id, &h.outbox.clone()).await;
        match h.next().await {
            ServerMessage::TranscriptUpdate { text, is_final, .. } => {
                assert_eq!(text, "one two three");
                assert!(is_final);
            }
            other => panic!("expected the closing update, got {:?}", other),
        }
        assert_eq!(h.transcripts.all()[0].content, "one two three");
    }

    #[tokio::test]
    async fn partials_inside_the_window_flush_only_the_latest() {
        let mut h = harness(CoordinatorConfig {
            partial_throttle: Duration::from_millis(400),
            ..CoordinatorConfig::default()
        });
        let id = h.join_offline(None).await;

        h.recognizer.tap(0).emit("earlier", false);
        sleep(Duration::from_millis(50)).await;
        h.recognizer.tap(0).emit("later", false);

        // Two hypotheses inside one window: only the newer one crosses
        // the boundary.
        match h.next().await {
            ServerMessage::TranscriptUpdate { text, is_final, .. } => {
                assert_eq!(text, "later");
                assert!(!is_final);
            }
            other => panic!("expected the flushed partial, got {:?}", other),
        }
        h.coordinator.handle_disconnect(&id).await;
    }

    #[tokio::test]
    async fn finals_accumulate_into_the_stable_prefix() {
        let mut h = harness(no_throttle());
        let id = h.join_offline(None).await;

        h.recognizer.tap(0).emit("first", true);
        h.recognizer.tap(0).emit("second", true);

        match h.next().await {
            ServerMessage::TranscriptUpdate {
                text, full_text, ..
            } => {
                assert_eq!(text, "first");
                assert_eq!(full_text.as_deref(), Some("first"));
            }
            other => panic!("expected a final, got {:?}", other),
        }
        match h.next().await {
            ServerMessage::TranscriptUpdate {
                text, full_text, ..
            } => {
                assert_eq!(text, "second");
                assert_eq!(full_text.as_deref(), Some("first second"));
            }
            other => panic!("expected a final, got {:?}", other),
        }
        h.coordinator.handle_disconnect(&id).await;
        assert_eq!(h.transcripts.all()[0].content, "first second");
    }

    #[tokio::test]
    async fn chunk_without_a_session_is_no_session() {
        let mut h = harness(no_throttle());
        h.coordinator
            .audio_chunk("ghost", "AAAA", false, &h.outbox.clone())
            .await;
        assert!(matches!(
            h.next().await,
            ServerMessage::Error {
                code: ErrorCode::NoSession,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn invalid_base64_is_rejected_and_ready_is_restored() {
        let mut h = harness(no_throttle());
        let id = h.join_offline(None).await;

        h.coordinator
            .audio_chunk(&id, "not base64!!!", false, &h.outbox.clone())
            .await;
        assert!(matches!(
            h.next().await,
            ServerMessage::Error {
                code: ErrorCode::BadRequest,
                ..
            }
        ));
        assert!(matches!(h.next().await, ServerMessage::Ready));

        // The session is still usable
        h.send_chunk(&id, &[7u8; 8]).await;
        h.coordinator.handle_disconnect(&id).await;
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected_and_ready_is_restored() {
        let mut h = harness(CoordinatorConfig {
            max_chunk_bytes: 16,
            ..no_throttle()
        });
        let id = h.join_offline(None).await;

        h.coordinator
            .audio_chunk(&id, &STANDARD.encode([0u8; 32]), false, &h.outbox.clone())
            .await;
        assert!(matches!(
            h.next().await,
            ServerMessage::Error {
                code: ErrorCode::PayloadTooLarge,
                ..
            }
        ));
        assert!(matches!(h.next().await, ServerMessage::Ready));
        // Nothing oversized reached the provider
        assert!(h.recognizer.tap(0).received.lock().unwrap().is_empty());
        h.coordinator.handle_disconnect(&id).await;
    }

    #[tokio::test]
    async fn end_without_a_session_is_no_session() {
        let mut h = harness(no_throttle());
        h.coordinator.end_session("ghost", &h.outbox.clone()).await;
        assert!(matches!(
            h.next().await,
            ServerMessage::Error {
                code: ErrorCode::NoSession,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn end_then_disconnect_persists_exactly_once() {
        let mut h = harness(no_throttle());
        let id = h.join_offline(None).await;
        h.recognizer.tap(0).emit("only once", true);
        h.next().await;

        h.coordinator.end_session(&id, &h.outbox.clone()).await;
        h.coordinator.handle_disconnect(&id).await;

        assert_eq!(h.transcripts.count(), 1);
    }

    #[tokio::test]
    async fn empty_session_persists_nothing() {
        let mut h = harness(no_throttle());
        let id = h.join_offline(None).await;
        h.coordinator.end_session(&id, &h.outbox.clone()).await;
        // No transcript update for empty content, straight to the status
        assert!(matches!(
            h.next().await,
            ServerMessage::SessionStatus {
                status: SessionStatusKind::Completed,
                ..
            }
        ));
        assert_eq!(h.transcripts.count(), 0);
    }

    #[tokio::test]
    async fn usage_is_recorded_for_authenticated_sessions() {
        let mut h = harness(no_throttle());
        let id = h.join_offline(Some("tracked")).await;
        h.recognizer.tap(0).emit("hi", true);
        h.next().await;
        h.coordinator.end_session(&id, &h.outbox.clone()).await;

        let record = h
            .usage
            .fetch("tracked", Utc::now().date_naive())
            .await
            .unwrap();
        let counters = record.counters(UsageCategory::RealTimeStreaming);
        assert!(counters.lifetime_minutes >= 0.0);
        assert_eq!(counters.daily_minutes, counters.lifetime_minutes);
    }

    #[tokio::test]
    async fn rejoin_binds_the_new_connection() {
        let mut h = harness(no_throttle());
        let id = h.join_offline(None).await;

        let (new_outbox, mut new_inbox) = mpsc::unbounded_channel();
        let rejoined = h
            .coordinator
            .clone()
            .join_session(
                Some(id.clone()),
                Some(SessionMode::Offline),
                None,
                None,
                None,
                new_outbox,
            )
            .await;
        assert_eq!(rejoined.as_deref(), Some(id.as_str()));
        // No second engine stream was opened
        assert_eq!(h.recognizer.open_count(), 1);

        // Status and ready go to the new connection, as do updates
        assert!(matches!(
            new_inbox.recv().await.unwrap(),
            ConnectionEvent::Send(ServerMessage::SessionStatus { .. })
        ));
        assert!(matches!(
            new_inbox.recv().await.unwrap(),
            ConnectionEvent::Send(ServerMessage::Ready)
        ));
        h.recognizer.tap(0).emit("back", true);
        assert!(matches!(
            new_inbox.recv().await.unwrap(),
            ConnectionEvent::Send(ServerMessage::TranscriptUpdate { .. })
        ));
        h.coordinator.handle_disconnect(&id).await;
    }

    #[tokio::test]
    async fn update_languages_takes_effect_for_later_updates() {
        let mut h = harness(no_throttle());
        let id = h.join_offline(None).await;

        h.coordinator
            .update_languages(&id, "ha-NG".to_string(), "en-US".to_string(), &h.outbox.clone())
            .await;
        match h.next().await {
            ServerMessage::LanguagesUpdated {
                source_language,
                target_language,
                ..
            } => {
                assert_eq!(source_language, "ha-NG");
                assert_eq!(target_language, "en-US");
            }
            other => panic!("expected languages_updated, got {:?}", other),
        }

        h.recognizer.tap(0).emit("sannu", true);
        match h.next().await {
            ServerMessage::TranscriptUpdate { translation, .. } => {
                // Passthrough translator, but the gate now lets it through
                assert_eq!(translation, "sannu");
            }
            other => panic!("expected a transcript update, got {:?}", other),
        }
        h.coordinator.handle_disconnect(&id).await;
    }

    #[tokio::test]
    async fn empty_language_update_is_rejected() {
        let mut h = harness(no_throttle());
        let id = h.join_offline(None).await;

        h.coordinator
            .update_languages(&id, "".to_string(), "en-US".to_string(), &h.outbox.clone())
            .await;
        match h.next().await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::BadRequest),
            other => panic!("expected an error, got {:?}", other),
        }
        h.coordinator.handle_disconnect(&id).await;
    }

    #[tokio::test]
    async fn quota_exhaustion_mid_session_force_ends() {
        let mut h = harness(CoordinatorConfig {
            quota_recheck: Duration::from_millis(20),
            ..no_throttle()
        });
        let id = h.join_offline(Some("runner")).await;

        // Exhaust the quota behind the running session's back
        h.usage
            .add_minutes(
                "runner",
                UsageCategory::RealTimeStreaming,
                10.0,
                Utc::now().date_naive(),
            )
            .await
            .unwrap();

        let mut saw_limit_error = false;
        let mut saw_limit_status = false;
        loop {
            match h.next_event().await {
                ConnectionEvent::Send(ServerMessage::Error { code, .. }) => {
                    assert_eq!(code, ErrorCode::RealtimeStreamingLimitExceeded);
                    saw_limit_error = true;
                }
                ConnectionEvent::Send(ServerMessage::SessionStatus { status, .. }) => {
                    if status == SessionStatusKind::LimitExceeded {
                        saw_limit_status = true;
                    }
                }
                ConnectionEvent::Send(_) => {}
                ConnectionEvent::Close => break,
            }
        }
        assert!(saw_limit_error);
        assert!(saw_limit_status);
        assert!(!h.coordinator.registry.contains(&id));
        assert_eq!(h.engine.active_session_count(), 0);
    }
}
