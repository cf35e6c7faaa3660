//! The authoritative peer table.
//!
//! A `DashMap` of fingerprint -> peer state, upserted from the discovery
//! listener task, with typed upsert outcomes, an eviction sweep with
//! deferred-on-contention semantics, and a change-notification channel
//! for subscribers.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::types::DeviceInfo;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub info: DeviceInfo,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated,
    Refreshed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Added(PeerRecord),
    Updated(PeerRecord),
    Removed(String),
}

/// Owns the fingerprint → `PeerRecord` map. Readers only ever see value
/// snapshots; the map itself is never exposed.
pub struct PeerRegistry {
    self_fingerprint: String,
    peers: DashMap<String, PeerRecord>,
    timeout: Duration,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerRegistry {
    pub fn new(self_fingerprint: impl Into<String>) -> Self {
        Self::with_timeout(self_fingerprint, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(self_fingerprint: impl Into<String>, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            self_fingerprint: self_fingerprint.into(),
            peers: DashMap::new(),
            timeout,
            events,
        }
    }

    /// Inserts or refreshes a peer. The effective IP is always the packet's
    /// observed source address, never the payload's self-reported `ip`
    /// field — the payload IP is untrustworthy and only the transport
    /// layer knows the truth.
    pub fn upsert(&self, mut info: DeviceInfo, observed_ip: Ipv4Addr) -> UpsertOutcome {
        if info.fingerprint == self.self_fingerprint {
            // Never store ourselves; no-op outcome that callers should not
            // act on. `Refreshed` keeps the return type total without a
            // third "rejected" variant.
            return UpsertOutcome::Refreshed;
        }

        info.ip = observed_ip;
        let now = Instant::now();

        let outcome = match self.peers.get(&info.fingerprint) {
            None => UpsertOutcome::Added,
            Some(existing) if existing.info.ip != info.ip || existing.info.port != info.port => {
                UpsertOutcome::Updated
            }
            Some(_) => UpsertOutcome::Refreshed,
        };

        let record = PeerRecord {
            info: info.clone(),
            last_seen: now,
        };
        self.peers.insert(info.fingerprint.clone(), record.clone());

        let event = match outcome {
            UpsertOutcome::Added => PeerEvent::Added(record),
            _ => PeerEvent::Updated(record),
        };
        let _ = self.events.send(event);

        outcome
    }

    /// Removes every record whose `last_seen` is older than the timeout,
    /// as a single pass over a snapshot of keys. A record that crosses the
    /// threshold mid-sweep (because it was refreshed concurrently) is left
    /// alone and picked up by the next sweep rather than raced against the
    /// writer that just refreshed it.
    pub fn sweep_expired(&self, now: Instant) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| now.duration_since(entry.last_seen) > self.timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for fingerprint in stale {
            // Re-check under the entry lock: the record may have been
            // refreshed between the snapshot above and this removal.
            let should_remove = self
                .peers
                .get(&fingerprint)
                .map(|entry| now.duration_since(entry.last_seen) > self.timeout)
                .unwrap_or(false);
            if should_remove && self.peers.remove(&fingerprint).is_some() {
                let _ = self.events.send(PeerEvent::Removed(fingerprint.clone()));
                evicted.push(fingerprint);
            }
        }
        evicted
    }

    /// Ordered by alias then fingerprint, so downstream UI lists don't
    /// jitter between refreshes of the same peer set.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self.peers.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| {
            a.info
                .alias
                .cmp(&b.info.alias)
                .then_with(|| a.info.fingerprint.cmp(&b.info.fingerprint))
        });
        records
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
