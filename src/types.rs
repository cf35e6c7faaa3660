//! Wire types shared by the discovery and transfer protocols: a device's
//! self-description, a single file's metadata, and the `TransferOffer`
//! that groups a batch of files under one sender. `announce` is wire-only
//! signaling and is never persisted on a `PeerRecord`.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeviceType {
    Mobile,
    Desktop,
    Web,
    Headless,
    Server,
}

/// Transport scheme selector, treated purely as a signal for which client
/// to use; certificate material is left to the embedding layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// A device's self-description, as exchanged over multicast and HTTP.
///
/// `announce` is wire-only signaling ("this is a primary advertisement,
/// please respond") and is never stored on a `PeerRecord` — see
/// [`crate::peers::PeerRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub alias: String,
    pub version: String,
    pub device_model: Option<String>,
    pub device_type: Option<DeviceType>,
    pub fingerprint: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
    pub download: bool,
    #[serde(default)]
    pub announce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub file_name: String,
    pub size: u64,
    pub file_type: String,
}

/// The collection of files a sender proposes in a single `/send-request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOffer {
    pub info: DeviceInfo,
    pub files: std::collections::HashMap<String, FileMetadata>,
}

impl TransferOffer {
    /// True when the offer has at least one file and no duplicate ids
    /// smuggled in under different keys (the map itself rules out key
    /// collisions; this also rejects metadata whose own `id` disagrees
    /// with its map key, which would otherwise silently desync the two).
    pub fn is_well_formed(&self) -> bool {
        !self.files.is_empty()
            && self
                .files
                .iter()
                .all(|(key, meta)| key == &meta.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn file(id: &str) -> FileMetadata {
        FileMetadata {
            id: id.to_string(),
            file_name: format!("{id}.bin"),
            size: 10,
            file_type: "application/octet-stream".to_string(),
        }
    }

    fn device() -> DeviceInfo {
        DeviceInfo {
            alias: "alice".into(),
            version: "2.0".into(),
            device_model: None,
            device_type: Some(DeviceType::Desktop),
            fingerprint: "f1".into(),
            ip: Ipv4Addr::LOCALHOST,
            port: 53321,
            protocol: Protocol::Http,
            download: true,
            announce: false,
        }
    }

    #[test]
    fn empty_offer_is_not_well_formed() {
        let offer = TransferOffer {
            info: device(),
            files: HashMap::new(),
        };
        assert!(!offer.is_well_formed());
    }

    #[test]
    fn offer_with_mismatched_key_is_rejected() {
        let mut files = HashMap::new();
        files.insert("wrong-key".to_string(), file("f1"));
        let offer = TransferOffer {
            info: device(),
            files,
        };
        assert!(!offer.is_well_formed());
    }

    #[test]
    fn decoding_ignores_unknown_fields() {
        let json = serde_json::json!({
            "alias": "alice",
            "version": "2.0",
            "deviceModel": null,
            "deviceType": "desktop",
            "fingerprint": "f1",
            "ip": "127.0.0.1",
            "port": 53321,
            "protocol": "http",
            "download": true,
            "announce": true,
            "somethingFromTheFuture": 42
        });
        let decoded: DeviceInfo = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.fingerprint, "f1");
        assert!(decoded.announce);
    }
}
