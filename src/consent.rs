//! Abstracts the human in the loop.
//!
//! Consent here is per-transfer, not a standing allow-list: each incoming
//! offer gets its own accept/decline decision with no memory across
//! sessions. [`QueuedConsentProvider`] publishes each pending offer on a
//! broadcast channel for an external approval surface (a UI, a CLI
//! prompt loop) to resolve.

use async_trait::async_trait;

use crate::types::TransferOffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    Accept,
    Decline,
}

/// Given a transfer offer, eventually yields Accept or Decline.
///
/// Implementations may front this with a UI dialog, an auto-accept policy
/// for headless deployments, or a queue consumed by a remote approval
/// surface. The HTTP handler awaits this with a timeout ([`crate::sessions::CONSENT_TIMEOUT`]);
/// a provider that never resolves is equivalent to an eventual decline.
#[async_trait]
pub trait UserConsentProvider: Send + Sync {
    async fn request_consent(&self, offer: &TransferOffer) -> ConsentDecision;
}

/// Accepts every offer without prompting. Intended for headless agents
/// (e.g. a server-room drop box) where no human is present to confirm.
pub struct AutoAcceptConsentProvider;

#[async_trait]
impl UserConsentProvider for AutoAcceptConsentProvider {
    async fn request_consent(&self, _offer: &TransferOffer) -> ConsentDecision {
        ConsentDecision::Accept
    }
}

/// Declines every offer. Useful as a safe default in tests and for an
/// agent configured to never receive unattended.
pub struct AutoDeclineConsentProvider;

#[async_trait]
impl UserConsentProvider for AutoDeclineConsentProvider {
    async fn request_consent(&self, _offer: &TransferOffer) -> ConsentDecision {
        ConsentDecision::Decline
    }
}

/// Publishes each incoming offer on a broadcast channel and waits for the
/// decision to arrive on a per-offer oneshot channel, which some external
/// consumer (a UI thread, a CLI prompt loop) is expected to resolve by
/// calling [`QueuedConsentProvider::respond`].
pub struct QueuedConsentProvider {
    pending_tx: tokio::sync::broadcast::Sender<PendingOffer>,
    responses: dashmap::DashMap<String, tokio::sync::oneshot::Sender<ConsentDecision>>,
}

#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub session_token: String,
    pub offer: TransferOffer,
}

impl Default for QueuedConsentProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl QueuedConsentProvider {
    pub fn new() -> Self {
        let (pending_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            pending_tx,
            responses: dashmap::DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PendingOffer> {
        self.pending_tx.subscribe()
    }

    /// Called by the UI layer once the user has made a decision.
    pub fn respond(&self, session_token: &str, decision: ConsentDecision) {
        if let Some((_, tx)) = self.responses.remove(session_token) {
            let _ = tx.send(decision);
        }
    }
}

#[async_trait]
impl UserConsentProvider for QueuedConsentProvider {
    async fn request_consent(&self, offer: &TransferOffer) -> ConsentDecision {
        let session_token = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.responses.insert(session_token.clone(), tx);

        let published = self.pending_tx.send(PendingOffer {
            session_token: session_token.clone(),
            offer: offer.clone(),
        });
        if published.is_err() {
            // No one is listening for approvals at all; fail closed.
            self.responses.remove(&session_token);
            return ConsentDecision::Decline;
        }

        rx.await.unwrap_or(ConsentDecision::Decline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn offer() -> TransferOffer {
        TransferOffer {
            info: crate::types::DeviceInfo {
                alias: "bob".into(),
                version: "2.0".into(),
                device_model: None,
                device_type: None,
                fingerprint: "bob-fp".into(),
                ip: Ipv4Addr::LOCALHOST,
                port: 1,
                protocol: crate::types::Protocol::Http,
                download: true,
                announce: false,
            },
            files: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn auto_accept_always_accepts() {
        let provider = AutoAcceptConsentProvider;
        assert_eq!(
            provider.request_consent(&offer()).await,
            ConsentDecision::Accept
        );
    }

    #[tokio::test]
    async fn queued_provider_resolves_from_response() {
        let provider = std::sync::Arc::new(QueuedConsentProvider::new());
        let mut pending_rx = provider.subscribe();

        let provider_clone = provider.clone();
        let offer_clone = offer();
        let handle = tokio::spawn(async move { provider_clone.request_consent(&offer_clone).await });

        let pending = pending_rx.recv().await.unwrap();
        provider.respond(&pending.session_token, ConsentDecision::Accept);

        assert_eq!(handle.await.unwrap(), ConsentDecision::Accept);
    }

    #[tokio::test]
    async fn queued_provider_fails_closed_with_no_subscriber() {
        let provider = QueuedConsentProvider::new();
        assert_eq!(
            provider.request_consent(&offer()).await,
            ConsentDecision::Decline
        );
    }
}
