//! The authoritative session table: accepted offers awaiting upload.
//!
//! Tracks the full Pending -> Accepted -> Uploading -> terminal state
//! machine for each transfer, including a per-file progress map and
//! terminal-state bookkeeping so a session can be looked up sanely for a
//! while after it finishes instead of disappearing the instant its last
//! byte lands.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::types::TransferOffer;

pub const CONSENT_TIMEOUT: Duration = Duration::from_secs(60);
pub const COMPLETION_GRACE: Duration = Duration::from_secs(30);
pub const IDLE_EXPIRY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Accepted,
    Uploading,
    Completed,
    Declined,
    Failed,
    Expired,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Declined
                | SessionState::Failed
                | SessionState::Expired
        )
    }
}

#[derive(Debug, Clone)]
pub struct TransferSession {
    pub session_id: String,
    pub offer: TransferOffer,
    pub peer_fingerprint: String,
    pub state: SessionState,
    /// fileId -> bytes received so far.
    pub progress: HashMap<String, u64>,
    pub created_at: Instant,
    /// Set once the session reaches a terminal state, so the sweeper can
    /// apply the right grace period instead of a uniform timeout.
    pub terminal_at: Option<Instant>,
}

impl TransferSession {
    fn new(session_id: String, offer: TransferOffer, peer_fingerprint: String) -> Self {
        let progress = offer.files.keys().map(|id| (id.clone(), 0)).collect();
        Self {
            session_id,
            offer,
            peer_fingerprint,
            state: SessionState::Pending,
            progress,
            created_at: Instant::now(),
            terminal_at: None,
        }
    }

    /// True once every offered file has received exactly its declared size.
    pub fn all_files_complete(&self) -> bool {
        self.offer
            .files
            .values()
            .all(|meta| self.progress.get(&meta.id).copied().unwrap_or(0) == meta.size)
    }
}

/// Owns every in-flight or recently-terminal `TransferSession`.
pub struct SessionStore {
    sessions: DashMap<String, TransferSession>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Inserts a new `Pending` session for an incoming offer and returns
    /// its freshly minted, process-unique id.
    pub fn insert_pending(&self, offer: TransferOffer, peer_fingerprint: String) -> String {
        let session_id = Uuid::new_v4().to_string();
        let session = TransferSession::new(session_id.clone(), offer, peer_fingerprint);
        self.sessions.insert(session_id.clone(), session);
        session_id
    }

    pub fn get(&self, session_id: &str) -> Option<TransferSession> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Pending -> Accepted.
    pub fn accept(&self, session_id: &str) -> bool {
        self.transition(session_id, SessionState::Pending, SessionState::Accepted)
    }

    /// Pending -> Declined (or Expired, via [`SessionStore::expire`] callers
    /// that distinguish a timed-out consent wait from an explicit decline).
    pub fn decline(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Accepted -> Uploading, on the first `/send` byte for this session.
    pub fn mark_uploading(&self, session_id: &str) -> bool {
        self.transition(session_id, SessionState::Accepted, SessionState::Uploading)
    }

    pub fn record_progress(&self, session_id: &str, file_id: &str, bytes: u64) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.progress.insert(file_id.to_string(), bytes);
        }
    }

    /// Uploading -> Completed, once every offered file matches its
    /// declared size. The session is not removed immediately; it is kept
    /// around for [`COMPLETION_GRACE`] so a straggling duplicate `/send`
    /// still resolves to a sane answer instead of a stale 404.
    pub fn complete(&self, session_id: &str) {
        self.finish(session_id, SessionState::Completed);
    }

    /// Uploading -> Failed, on a short read or a write error. The caller
    /// is responsible for deleting the partial file on disk.
    pub fn fail(&self, session_id: &str) {
        self.finish(session_id, SessionState::Failed);
    }

    fn finish(&self, session_id: &str, state: SessionState) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.state = state;
            entry.terminal_at = Some(Instant::now());
        }
    }

    fn transition(&self, session_id: &str, from: SessionState, to: SessionState) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) if entry.state == from => {
                entry.state = to;
                true
            }
            _ => false,
        }
    }

    /// Removes sessions whose grace/idle window has elapsed:
    /// - any terminal session older than [`COMPLETION_GRACE`] past its
    ///   terminal transition;
    /// - any non-terminal session whose `sessionId` has gone unused for
    ///   more than [`IDLE_EXPIRY`] (moved to `Expired` first so callers can
    ///   observe the transition before the record disappears).
    pub fn sweep(&self, now: Instant) -> Vec<String> {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value();
                let expired = match session.terminal_at {
                    Some(terminal_at) => now.duration_since(terminal_at) > COMPLETION_GRACE,
                    None => now.duration_since(session.created_at) > IDLE_EXPIRY,
                };
                expired.then(|| entry.key().clone())
            })
            .collect();

        for session_id in &stale {
            self.sessions.remove(session_id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceInfo, DeviceType, FileMetadata, Protocol};
    use std::net::Ipv4Addr;

    fn offer(file_id: &str, size: u64) -> TransferOffer {
        let mut files = HashMap::new();
        files.insert(
            file_id.to_string(),
            FileMetadata {
                id: file_id.to_string(),
                file_name: "x.txt".to_string(),
                size,
                file_type: "text/plain".to_string(),
            },
        );
        TransferOffer {
            info: DeviceInfo {
                alias: "bob".into(),
                version: "2.0".into(),
                device_model: None,
                device_type: Some(DeviceType::Desktop),
                fingerprint: "bob-fp".into(),
                ip: Ipv4Addr::LOCALHOST,
                port: 53321,
                protocol: Protocol::Http,
                download: true,
                announce: false,
            },
            files,
        }
    }

    #[test]
    fn full_happy_path_transitions() {
        let store = SessionStore::new();
        let id = store.insert_pending(offer("f1", 10), "bob-fp".to_string());
        assert_eq!(store.get(&id).unwrap().state, SessionState::Pending);

        assert!(store.accept(&id));
        assert_eq!(store.get(&id).unwrap().state, SessionState::Accepted);

        assert!(store.mark_uploading(&id));
        store.record_progress(&id, "f1", 10);
        assert!(store.get(&id).unwrap().all_files_complete());

        store.complete(&id);
        assert_eq!(store.get(&id).unwrap().state, SessionState::Completed);
    }

    #[test]
    fn decline_removes_session_immediately() {
        let store = SessionStore::new();
        let id = store.insert_pending(offer("f1", 10), "bob-fp".to_string());
        store.decline(&id);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn cannot_skip_from_pending_to_uploading() {
        let store = SessionStore::new();
        let id = store.insert_pending(offer("f1", 10), "bob-fp".to_string());
        assert!(!store.mark_uploading(&id));
        assert_eq!(store.get(&id).unwrap().state, SessionState::Pending);
    }

    #[test]
    fn completed_session_survives_grace_then_sweeps() {
        let store = SessionStore::new();
        let id = store.insert_pending(offer("f1", 0), "bob-fp".to_string());
        store.accept(&id);
        store.mark_uploading(&id);
        store.complete(&id);

        let immediate = store.sweep(Instant::now());
        assert!(immediate.is_empty());
        assert!(store.get(&id).is_some());

        let after_grace = Instant::now() + COMPLETION_GRACE + Duration::from_secs(1);
        let swept = store.sweep(after_grace);
        assert_eq!(swept, vec![id.clone()]);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn idle_pending_session_expires() {
        let store = SessionStore::new();
        let id = store.insert_pending(offer("f1", 10), "bob-fp".to_string());
        let after_idle = Instant::now() + IDLE_EXPIRY + Duration::from_secs(1);
        let swept = store.sweep(after_idle);
        assert_eq!(swept, vec![id]);
    }

    #[test]
    fn zero_byte_file_is_immediately_complete() {
        let store = SessionStore::new();
        let id = store.insert_pending(offer("f1", 0), "bob-fp".to_string());
        assert!(store.get(&id).unwrap().all_files_complete());
    }
}
