//! Upload sessions: identifiers, lifecycle state and per-session locks.
//!
//! The on-disk staging directory is the source of truth for which chunks
//! exist. The registry only holds what the filesystem cannot: the lock each
//! session serializes on, the declared chunk total, and terminal markers for
//! sessions that were finalized or reclaimed.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{UploadError, UploadResult};

/// Longest accepted session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// A validated session identifier.
///
/// Ids become directory names under the staging root, so only
/// `[A-Za-z0-9_-]` is accepted; path separators and dot segments never are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> UploadResult<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_SESSION_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(UploadError::InvalidSessionId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No chunk staged yet
    Empty,
    /// Some but not all chunks staged
    Receiving,
    /// Every index of the declared total is staged
    Complete,
    /// Merged; staging removed; further submissions are rejected
    Finalized,
    /// Reclaimed by abandon or the expiry sweep
    Expired,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finalized | SessionState::Expired)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Empty => "empty",
            SessionState::Receiving => "receiving",
            SessionState::Complete => "complete",
            SessionState::Finalized => "finalized",
            SessionState::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct SessionEntry {
    lock: Arc<RwLock<()>>,
    total: Option<u32>,
    terminal: Option<(SessionState, Instant)>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            total: None,
            terminal: None,
        }
    }
}

/// In-memory bookkeeping shared by the receiver and the assembler.
///
/// Chunk submissions take a session's lock shared; finalize, abandon and the
/// sweep take it exclusively. The inner map mutex is never held across an
/// await point.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    fn map(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        // Poison is ignored: every update is a single field store.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The lock for `id`, creating the entry on first use.
    pub fn lock_for(&self, id: &SessionId) -> Arc<RwLock<()>> {
        self.map()
            .entry(id.clone())
            .or_insert_with(SessionEntry::new)
            .lock
            .clone()
    }

    /// Terminal state of `id`, if it has one.
    pub fn terminal_state(&self, id: &SessionId) -> Option<SessionState> {
        self.map()
            .get(id)
            .and_then(|e| e.terminal.map(|(state, _)| state))
    }

    /// Declared chunk total of `id`, if any submission has declared one.
    pub fn declared_total(&self, id: &SessionId) -> Option<u32> {
        self.map().get(id).and_then(|e| e.total)
    }

    /// Record `total` for `id`, or return the one already declared if it differs.
    pub fn declare_total(&self, id: &SessionId, total: u32) -> Result<(), u32> {
        let mut map = self.map();
        let entry = map.entry(id.clone()).or_insert_with(SessionEntry::new);
        match entry.total {
            Some(existing) if existing != total => Err(existing),
            _ => {
                entry.total = Some(total);
                Ok(())
            }
        }
    }

    pub fn mark_terminal(&self, id: &SessionId, state: SessionState) {
        let mut map = self.map();
        let entry = map.entry(id.clone()).or_insert_with(SessionEntry::new);
        entry.total = None;
        entry.terminal = Some((state, Instant::now()));
    }

    /// Drop terminal markers older than `ttl`. Returns how many were dropped.
    ///
    /// Entries whose lock is currently held elsewhere are kept.
    pub fn prune_terminal(&self, ttl: Duration) -> usize {
        let mut map = self.map();
        let before = map.len();
        map.retain(|_, entry| match entry.terminal {
            Some((_, at)) => at.elapsed() < ttl || Arc::strong_count(&entry.lock) > 1,
            None => true,
        });
        before - map.len()
    }

    /// Open (non-terminal) sessions whose lock nobody outside the registry holds.
    pub fn unheld_open(&self) -> Vec<SessionId> {
        self.map()
            .iter()
            .filter(|(_, e)| e.terminal.is_none() && Arc::strong_count(&e.lock) == 1)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forget open session `id` if `lock`, taken from `lock_for`, is the only
    /// handle to it outside the registry. Returns whether it was forgotten.
    ///
    /// A task that already cloned the lock keeps the entry alive, so two
    /// tasks never end up serializing on different locks for one session.
    pub fn forget_unheld(&self, id: &SessionId, lock: &Arc<RwLock<()>>) -> bool {
        let mut map = self.map();
        let forget = map.get(id).is_some_and(|e| {
            e.terminal.is_none() && Arc::ptr_eq(&e.lock, lock) && Arc::strong_count(lock) == 2
        });
        if forget {
            map.remove(id);
        }
        forget
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_accepts_safe_names() {
        let longest = "x".repeat(MAX_SESSION_ID_LEN);
        for id in ["abc", "A-1_b", "0", longest.as_str()] {
            assert!(SessionId::parse(id).is_ok(), "{id}");
        }
    }

    #[test]
    fn test_session_id_rejects_path_like_names() {
        let too_long = "x".repeat(MAX_SESSION_ID_LEN + 1);
        for id in [
            "",
            ".",
            "..",
            "../etc",
            "a/b",
            "a\\b",
            "with space",
            "dot.dot",
            "nul\0",
            too_long.as_str(),
        ] {
            assert!(
                matches!(SessionId::parse(id), Err(UploadError::InvalidSessionId(_))),
                "{id:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_declare_total_is_sticky() {
        let reg = SessionRegistry::default();
        let id = SessionId::parse("s1").unwrap();
        assert_eq!(reg.declare_total(&id, 3), Ok(()));
        assert_eq!(reg.declare_total(&id, 3), Ok(()));
        assert_eq!(reg.declare_total(&id, 4), Err(3));
        assert_eq!(reg.declared_total(&id), Some(3));
    }

    #[test]
    fn test_terminal_marker_and_prune() {
        let reg = SessionRegistry::default();
        let id = SessionId::parse("s1").unwrap();
        reg.declare_total(&id, 2).unwrap();
        reg.mark_terminal(&id, SessionState::Finalized);

        assert_eq!(reg.terminal_state(&id), Some(SessionState::Finalized));
        assert_eq!(reg.declared_total(&id), None);

        assert_eq!(reg.prune_terminal(Duration::from_secs(3600)), 0);
        assert_eq!(reg.prune_terminal(Duration::ZERO), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_prune_keeps_held_locks() {
        let reg = SessionRegistry::default();
        let id = SessionId::parse("busy").unwrap();
        let lock = reg.lock_for(&id);
        reg.mark_terminal(&id, SessionState::Expired);

        assert_eq!(reg.prune_terminal(Duration::ZERO), 0);
        drop(lock);
        assert_eq!(reg.prune_terminal(Duration::ZERO), 1);
    }

    #[test]
    fn test_forget_unheld_open_session() {
        let reg = SessionRegistry::default();
        let id = SessionId::parse("s1").unwrap();
        let done = SessionId::parse("s2").unwrap();
        reg.declare_total(&id, 4).unwrap();
        reg.mark_terminal(&done, SessionState::Finalized);
        assert_eq!(reg.unheld_open(), vec![id.clone()]);

        let lock = reg.lock_for(&id);
        let waiter = reg.lock_for(&id);
        assert!(reg.unheld_open().is_empty());
        assert!(!reg.forget_unheld(&id, &lock), "a second holder keeps it");

        drop(waiter);
        assert!(reg.forget_unheld(&id, &lock));
        assert_eq!(reg.declared_total(&id), None);

        let lock = reg.lock_for(&done);
        assert!(!reg.forget_unheld(&done, &lock), "terminal markers stay");
        assert_eq!(reg.len(), 1);
    }
}
