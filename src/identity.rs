//! This agent's own identity: immutable at the protocol level (alias,
//! fingerprint, device model/type) plus the mutable self-view the rest of
//! the engine needs (bound address, transport, download capability).
//!
//! One writer lock guards the mutable fields; readers get value copies so
//! nobody ever observes a torn write.

use std::net::Ipv4Addr;
use std::sync::RwLock;

use uuid::Uuid;

use crate::types::{DeviceInfo, DeviceType, Protocol};

/// Value-copy snapshot of this agent's current self-description.
///
/// Readers get an owned `DeviceInfo`-shaped struct so concurrent access
/// never observes a torn write.
#[derive(Debug, Clone)]
pub struct SelfInfo {
    pub alias: String,
    pub fingerprint: String,
    pub device_model: Option<String>,
    pub device_type: Option<DeviceType>,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
    pub download: bool,
}

impl SelfInfo {
    pub fn as_device_info(&self, announce: bool) -> DeviceInfo {
        DeviceInfo {
            alias: self.alias.clone(),
            version: "2.0".to_string(),
            device_model: self.device_model.clone(),
            device_type: self.device_type,
            fingerprint: self.fingerprint.clone(),
            ip: self.ip,
            port: self.port,
            protocol: self.protocol,
            download: self.download,
            announce,
        }
    }
}

struct Mutable {
    ip: Ipv4Addr,
    port: u16,
    protocol: Protocol,
    download: bool,
}

/// Holds this agent's immutable identity and mutable self-view.
///
/// The fingerprint is a random 128-bit token rendered as a UUID string,
/// assigned once at construction and never changed for the lifetime of
/// the process (it is deliberately not persisted across restarts — see
/// SPEC_FULL.md's note on "No other on-disk state").
pub struct IdentityStore {
    alias: String,
    fingerprint: String,
    device_model: Option<String>,
    device_type: Option<DeviceType>,
    mutable: RwLock<Mutable>,
}

impl IdentityStore {
    pub fn new(
        alias: impl Into<String>,
        device_model: Option<String>,
        device_type: Option<DeviceType>,
    ) -> Self {
        Self {
            alias: alias.into(),
            fingerprint: Uuid::new_v4().to_string(),
            device_model,
            device_type,
            mutable: RwLock::new(Mutable {
                ip: Ipv4Addr::UNSPECIFIED,
                port: 0,
                protocol: Protocol::Http,
                download: true,
            }),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Value-copy snapshot, safe to hand to any caller regardless of
    /// in-flight mutators.
    pub fn snapshot(&self) -> SelfInfo {
        let m = self.mutable.read().expect("identity lock poisoned");
        SelfInfo {
            alias: self.alias.clone(),
            fingerprint: self.fingerprint.clone(),
            device_model: self.device_model.clone(),
            device_type: self.device_type,
            ip: m.ip,
            port: m.port,
            protocol: m.protocol,
            download: m.download,
        }
    }

    pub fn set_bound_address(&self, ip: Ipv4Addr, port: u16) {
        let mut m = self.mutable.write().expect("identity lock poisoned");
        m.ip = ip;
        m.port = port;
    }

    pub fn set_transport(&self, protocol: Protocol) {
        self.mutable.write().expect("identity lock poisoned").protocol = protocol;
    }

    pub fn set_downloadable(&self, download: bool) {
        self.mutable.write().expect("identity lock poisoned").download = download;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_across_snapshots() {
        let store = IdentityStore::new("alice", None, Some(DeviceType::Desktop));
        let a = store.snapshot();
        store.set_bound_address(Ipv4Addr::new(10, 0, 0, 5), 53321);
        let b = store.snapshot();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(b.ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(b.port, 53321);
    }

    #[test]
    fn two_identities_never_collide() {
        let a = IdentityStore::new("a", None, None);
        let b = IdentityStore::new("b", None, None);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
