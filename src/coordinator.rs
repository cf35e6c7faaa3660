//! Ties the discovery, HTTP, and client pieces into a single running agent
//! and drives the sending side of a transfer end-to-end.
//!
//! The receiving side's state machine lives in [`crate::server`] (it reacts
//! to inbound HTTP requests); this module is its counterpart for the side
//! that initiates a transfer, plus the bootstrap/shutdown sequence that
//! starts both halves together as one handle callers start and stop as a
//! unit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::broadcast;

use crate::client::TransferClient;
use crate::config::AgentConfig;
use crate::consent::UserConsentProvider;
use crate::discovery::DiscoveryEngine;
use crate::error::{ClientError, DiscoveryError, HttpPlaneError};
use crate::identity::IdentityStore;
use crate::peers::PeerRegistry;
use crate::server::{self, AppState};
use crate::sessions::SessionStore;
use crate::types::{FileMetadata, TransferOffer};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    HttpPlane(#[from] HttpPlaneError),
    #[error("peer {0} is not known to the registry")]
    UnknownPeer(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to read local file {path}: {source}")]
    LocalFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A fully running agent: own identity, peer table, discovery loops, HTTP
/// server, and the outbound client used to push files to other peers.
pub struct TransferCoordinator {
    identity: Arc<IdentityStore>,
    peers: Arc<PeerRegistry>,
    sessions: Arc<SessionStore>,
    discovery: Arc<DiscoveryEngine>,
    client: TransferClient,
    shutdown_tx: broadcast::Sender<()>,
}

impl TransferCoordinator {
    /// Starts the multicast announcer/listener/sweeper and the HTTP server,
    /// and returns a handle plus the port the HTTP server actually bound.
    pub async fn start(
        config: AgentConfig,
        consent: Arc<dyn UserConsentProvider>,
    ) -> Result<(Self, u16), CoordinatorError> {
        let identity = Arc::new(IdentityStore::new(
            config.alias.clone(),
            config.device_model.clone(),
            None,
        ));
        identity.set_downloadable(config.downloadable);

        let peers = Arc::new(PeerRegistry::with_timeout(
            identity.fingerprint().to_string(),
            config.peer_timeout,
        ));
        let sessions = Arc::new(SessionStore::new());
        let discovery = Arc::new(DiscoveryEngine::new(identity.clone(), peers.clone()));

        discovery.start_listening().await?;
        discovery.start_announcing().await?;
        discovery.start_sweeping(config.peer_timeout).await;

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let state = AppState {
            identity: identity.clone(),
            peers: peers.clone(),
            sessions: sessions.clone(),
            consent,
            download_dir: config.download_dir.clone(),
        };
        let bound = server::serve(state, config.http_port, async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

        // `bound.ip()` is the HTTP listener's own bind address (0.0.0.0 when
        // the port is OS-chosen), not a usable peer-facing IP — resolve the
        // same local interface address the multicast socket joined on.
        let local_ip = crate::discovery::select_interface().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
        identity.set_bound_address(local_ip, bound.port());

        spawn_session_sweeper(sessions.clone(), shutdown_tx.subscribe());

        info!("agent '{}' listening on {}", config.alias, bound);

        Ok((
            Self {
                identity,
                peers,
                sessions,
                discovery,
                client: TransferClient::new(),
                shutdown_tx,
            },
            bound.port(),
        ))
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Negotiates and pushes every file in `paths` to the peer identified
    /// by `peer_fingerprint`. A decline or a mid-transfer error on any file
    /// aborts the whole batch rather than partially delivering it.
    pub async fn send_files(
        &self,
        peer_fingerprint: &str,
        paths: &[PathBuf],
    ) -> Result<String, CoordinatorError> {
        let peer = self
            .peers
            .snapshot()
            .into_iter()
            .find(|record| record.info.fingerprint == peer_fingerprint)
            .ok_or_else(|| CoordinatorError::UnknownPeer(peer_fingerprint.to_string()))?
            .info;

        let offer = self.build_offer(paths).await?;
        let session_id = self
            .client
            .send_request(
                peer.protocol.as_str(),
                &peer.ip.to_string(),
                peer.port,
                &offer,
            )
            .await?;

        for (file_id, meta) in &offer.files {
            let path = paths
                .iter()
                .find(|p| file_name_of(p) == meta.file_name)
                .expect("offer was built from `paths`, so every id has a matching path");
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|source| CoordinatorError::LocalFile {
                    path: path.clone(),
                    source,
                })?;
            self.client
                .send_file(
                    peer.protocol.as_str(),
                    &peer.ip.to_string(),
                    peer.port,
                    &session_id,
                    file_id,
                    bytes,
                )
                .await?;
        }

        Ok(session_id)
    }

    async fn build_offer(&self, paths: &[PathBuf]) -> Result<TransferOffer, CoordinatorError> {
        let mut files = std::collections::HashMap::new();
        for path in paths {
            let metadata =
                tokio::fs::metadata(path)
                    .await
                    .map_err(|source| CoordinatorError::LocalFile {
                        path: path.clone(),
                        source,
                    })?;
            let id = uuid::Uuid::new_v4().to_string();
            files.insert(
                id.clone(),
                FileMetadata {
                    id,
                    file_name: file_name_of(path),
                    size: metadata.len(),
                    file_type: mime_guess_from_extension(path),
                },
            );
        }
        Ok(TransferOffer {
            info: self.identity.snapshot().as_device_info(false),
            files,
        })
    }

    /// Stops discovery, the session sweeper, and the HTTP server's accept
    /// loop. Always completes, even if an underlying task already died.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.discovery.shutdown().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn file_name_of(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

/// A minimal extension-to-MIME mapping covering the common cases; anything
/// else is reported as opaque octet-stream rather than guessed at.
fn mime_guess_from_extension(path: &std::path::Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
    .to_string()
}

fn spawn_session_sweeper(sessions: Arc<SessionStore>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let swept = sessions.sweep(std::time::Instant::now());
                    if !swept.is_empty() {
                        warn!("swept {} stale transfer session(s)", swept.len());
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_guess_covers_known_extensions_and_falls_back() {
        assert_eq!(
            mime_guess_from_extension(std::path::Path::new("a.txt")),
            "text/plain"
        );
        assert_eq!(
            mime_guess_from_extension(std::path::Path::new("a.unknownext")),
            "application/octet-stream"
        );
    }

    #[test]
    fn file_name_of_strips_directory_components() {
        assert_eq!(file_name_of(std::path::Path::new("/a/b/report.pdf")), "report.pdf");
    }
}
