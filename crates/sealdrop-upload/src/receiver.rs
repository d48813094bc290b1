//! Chunk receiver: verify, then stage.
//!
//! A chunk is hashed before anything touches disk; a mismatch leaves staging
//! exactly as it was. Submissions to one session may run concurrently with
//! each other but never with that session's finalize, abandon or sweep.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::error::UploadResult;
use crate::hasher::{digest_eq, HashPool};
use crate::session::{SessionId, SessionRegistry, SessionState};
use crate::staging::StagingArea;

/// Result of one chunk submission.
///
/// Rejections are ordinary outcomes the client reacts to (resend, stop), so
/// they are not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted { index: u32 },
    Rejected(RejectReason),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Payload digest differs from the one the client declared
    HashMismatch { expected: String, actual: String },
    /// `index >= total`, or `total == 0`
    IndexOutOfRange { index: u32, total: u32 },
    /// `total` differs from the one declared by earlier chunks of the session
    TotalMismatch { declared: u32, got: u32 },
    /// The session was finalized or reclaimed
    SessionClosed { state: SessionState },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch: expected {expected}, got {actual}")
            }
            RejectReason::IndexOutOfRange { index, total } => {
                write!(f, "index {index} out of range for {total} chunks")
            }
            RejectReason::TotalMismatch { declared, got } => {
                write!(f, "total {got} differs from declared {declared}")
            }
            RejectReason::SessionClosed { state } => write!(f, "session is {state}"),
        }
    }
}

#[derive(Clone)]
pub struct ChunkReceiver {
    staging: Arc<StagingArea>,
    sessions: Arc<SessionRegistry>,
    hash_pool: Arc<HashPool>,
}

impl ChunkReceiver {
    pub fn new(
        staging: Arc<StagingArea>,
        sessions: Arc<SessionRegistry>,
        hash_pool: Arc<HashPool>,
    ) -> Self {
        Self {
            staging,
            sessions,
            hash_pool,
        }
    }

    /// Verify `payload` against `expected_sha256` and stage it as chunk `index`.
    ///
    /// Resubmitting an index (after a lost response, say) replaces the staged
    /// chunk; the session ends up in the same state either way.
    pub async fn submit_chunk(
        &self,
        session_id: &str,
        index: u32,
        total: u32,
        payload: Vec<u8>,
        expected_sha256: &str,
    ) -> UploadResult<SubmitOutcome> {
        let id = SessionId::parse(session_id)?;

        if index >= total {
            warn!(session = %id, index, total, "chunk index out of range");
            return Ok(SubmitOutcome::Rejected(RejectReason::IndexOutOfRange {
                index,
                total,
            }));
        }

        let lock = self.sessions.lock_for(&id);
        let _shared = lock.read().await;

        if let Some(state) = self.sessions.terminal_state(&id) {
            debug!(session = %id, index, %state, "chunk for closed session");
            return Ok(SubmitOutcome::Rejected(RejectReason::SessionClosed { state }));
        }
        if let Some(declared) = self.sessions.declared_total(&id).filter(|&t| t != total) {
            return Ok(total_mismatch(&id, declared, total));
        }

        let payload = Arc::new(payload);
        let actual = self.hash_pool.sha256(payload.clone()).await?;
        if !digest_eq(&actual, expected_sha256) {
            warn!(session = %id, index, "chunk hash mismatch");
            return Ok(SubmitOutcome::Rejected(RejectReason::HashMismatch {
                expected: expected_sha256.to_ascii_lowercase(),
                actual,
            }));
        }

        // Only a verified chunk may fix the session's total.
        if let Err(declared) = self.sessions.declare_total(&id, total) {
            return Ok(total_mismatch(&id, declared, total));
        }
        self.staging.write_chunk(&id, index, &payload).await?;
        info!(session = %id, index, total, bytes = payload.len(), "chunk accepted");
        Ok(SubmitOutcome::Accepted { index })
    }

    /// Staged chunk indices, ascending, read from disk.
    pub async fn status(&self, session_id: &str) -> UploadResult<Vec<u32>> {
        let id = SessionId::parse(session_id)?;
        Ok(self.staging.indices(&id).await?)
    }

    pub async fn session_state(&self, session_id: &str) -> UploadResult<SessionState> {
        let id = SessionId::parse(session_id)?;
        if let Some(state) = self.sessions.terminal_state(&id) {
            return Ok(state);
        }

        let indices = self.staging.indices(&id).await?;
        if indices.is_empty() {
            return Ok(SessionState::Empty);
        }
        let complete = self
            .sessions
            .declared_total(&id)
            .is_some_and(|total| (0..total).all(|i| indices.binary_search(&i).is_ok()));
        Ok(if complete {
            SessionState::Complete
        } else {
            SessionState::Receiving
        })
    }

    /// Discard everything staged for a session and close it.
    ///
    /// Waits for in-flight submissions to drain.
    pub async fn abandon(&self, session_id: &str) -> UploadResult<()> {
        let id = SessionId::parse(session_id)?;
        let lock = self.sessions.lock_for(&id);
        let _exclusive = lock.write().await;

        if self.sessions.terminal_state(&id) == Some(SessionState::Finalized) {
            return Ok(());
        }
        self.staging.remove_session(&id).await?;
        self.sessions.mark_terminal(&id, SessionState::Expired);
        info!(session = %id, "session abandoned");
        Ok(())
    }

    /// Reclaim staging of sessions idle for at least `ttl`.
    ///
    /// Sessions with a submission or finalize in flight are skipped and picked
    /// up by a later sweep. Terminal markers older than `ttl` are forgotten,
    /// as are open sessions that never staged a chunk. Returns the reclaimed
    /// session ids.
    pub async fn sweep_expired(&self, ttl: Duration) -> UploadResult<Vec<String>> {
        let mut pruned = self.sessions.prune_terminal(ttl);
        let mut reclaimed = Vec::new();

        for (id, modified) in self.staging.sessions().await? {
            if idle_for(modified) < ttl {
                continue;
            }
            if let Some(idle) = self.reclaim_if_idle(&id, ttl).await {
                info!(session = %id, idle_secs = idle.as_secs(), "expired session reclaimed");
                reclaimed.push(id.as_str().to_string());
            }
        }

        for id in self.sessions.unheld_open() {
            let lock = self.sessions.lock_for(&id);
            let Ok(_exclusive) = lock.try_write() else {
                continue;
            };
            if matches!(self.staging.modified(&id).await, Ok(None))
                && self.sessions.forget_unheld(&id, &lock)
            {
                pruned += 1;
            }
        }

        if pruned > 0 || !reclaimed.is_empty() {
            info!(reclaimed = reclaimed.len(), pruned, "sweep finished");
        }
        Ok(reclaimed)
    }

    /// Reclaim `id` if, under its exclusive lock, its staging is still idle
    /// for at least `ttl`. Returns how long it had been idle.
    async fn reclaim_if_idle(&self, id: &SessionId, ttl: Duration) -> Option<Duration> {
        let lock = self.sessions.lock_for(id);
        let Ok(_exclusive) = lock.try_write() else {
            debug!(session = %id, "session busy, sweep skipped it");
            return None;
        };

        // The directory listing may predate a submission that just finished.
        let idle = match self.staging.modified(id).await {
            Ok(Some(modified)) => idle_for(modified),
            Ok(None) => return None,
            Err(e) => {
                warn!(session = %id, error = %e, "failed to stat staging");
                return None;
            }
        };
        if idle < ttl {
            debug!(session = %id, "session touched since listing, sweep skipped it");
            return None;
        }

        if let Err(e) = self.staging.remove_session(id).await {
            warn!(session = %id, error = %e, "failed to reclaim staging");
            return None;
        }
        self.sessions.mark_terminal(id, SessionState::Expired);
        Some(idle)
    }
}

fn idle_for(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO)
}

fn total_mismatch(id: &SessionId, declared: u32, got: u32) -> SubmitOutcome {
    warn!(session = %id, declared, got, "chunk total changed mid-session");
    SubmitOutcome::Rejected(RejectReason::TotalMismatch { declared, got })
}
