//! The HTTP control/data plane, server side.
//!
//! An axum `Router` over four endpoints under `/api/localsend/v1`: a self
//! snapshot, peer registration, offer negotiation, and streamed file
//! upload. Bodies are typed (`DeviceInfo`/`TransferOffer`) rather than
//! loose JSON, destination paths are sanitized through
//! [`crate::storage`], and every exchange routes through the explicit
//! session state machine in [`crate::sessions`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use crate::consent::{ConsentDecision, UserConsentProvider};
use crate::identity::IdentityStore;
use crate::peers::PeerRegistry;
use crate::sessions::{SessionStore, CONSENT_TIMEOUT};
use crate::storage::resolve_destination;
use crate::types::{DeviceInfo, TransferOffer};

#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<IdentityStore>,
    pub peers: Arc<PeerRegistry>,
    pub sessions: Arc<SessionStore>,
    pub consent: Arc<dyn UserConsentProvider>,
    pub download_dir: std::path::PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/localsend/v1/info", get(info))
        .route("/api/localsend/v1/register", post(register))
        .route("/api/localsend/v1/send-request", post(send_request))
        .route("/api/localsend/v1/send", post(send))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn info(State(state): State<AppState>) -> Json<DeviceInfo> {
    Json(state.identity.snapshot().as_device_info(false))
}

#[derive(Serialize)]
struct Received {
    status: &'static str,
}

async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<DeviceInfo>, axum::extract::rejection::JsonRejection>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Json(device) = match body {
        Ok(json) => json,
        Err(e) => {
            warn!("rejecting malformed /register body from {addr}: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "invalid"})),
            );
        }
    };

    if device.fingerprint.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "invalid"})),
        );
    }

    let observed_ip = match addr.ip() {
        std::net::IpAddr::V4(ip) => ip,
        std::net::IpAddr::V6(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "invalid"})),
            )
        }
    };

    state.peers.upsert(device, observed_ip);
    (StatusCode::OK, Json(json!({"status": "received"})))
}

async fn send_request(
    State(state): State<AppState>,
    body: Result<Json<TransferOffer>, axum::extract::rejection::JsonRejection>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Json(offer) = match body {
        Ok(json) => json,
        Err(e) => {
            warn!("rejecting malformed /send-request body: {e}");
            return (StatusCode::BAD_REQUEST, Json(json!({"status": "invalid"})));
        }
    };

    if !offer.is_well_formed() {
        return (StatusCode::BAD_REQUEST, Json(json!({"status": "invalid"})));
    }

    let peer_fingerprint = offer.info.fingerprint.clone();
    let session_id = state.sessions.insert_pending(offer.clone(), peer_fingerprint.clone());

    let decision = match tokio::time::timeout(
        CONSENT_TIMEOUT,
        state.consent.request_consent(&offer),
    )
    .await
    {
        Ok(decision) => decision,
        Err(_) => {
            debug!("consent wait timed out for peer {peer_fingerprint}, treating as decline");
            ConsentDecision::Decline
        }
    };

    match decision {
        ConsentDecision::Decline => {
            state.sessions.decline(&session_id);
            (StatusCode::FORBIDDEN, Json(json!({"status": "declined"})))
        }
        ConsentDecision::Accept => {
            state.sessions.accept(&session_id);
            (
                StatusCode::OK,
                Json(json!({"status": "accepted", "sessionId": session_id})),
            )
        }
    }
}

const SEND_CHUNK_LOG_INTERVAL: u64 = 8 * 1024 * 1024;

async fn send(State(state): State<AppState>, headers: HeaderMap, body: Body) -> (StatusCode, Json<serde_json::Value>) {
    let session_id = match headers.get("X-Session-ID").and_then(|v| v.to_str().ok()) {
        Some(v) => v.to_string(),
        None => return status_json(StatusCode::BAD_REQUEST, "missing X-Session-ID"),
    };
    let file_id = match headers.get("X-File-ID").and_then(|v| v.to_str().ok()) {
        Some(v) => v.to_string(),
        None => return status_json(StatusCode::BAD_REQUEST, "missing X-File-ID"),
    };

    let Some(session) = state.sessions.get(&session_id) else {
        return status_json(StatusCode::NOT_FOUND, "unknown session");
    };
    let Some(meta) = session.offer.files.get(&file_id) else {
        return status_json(StatusCode::NOT_FOUND, "unknown file");
    };

    if std::fs::create_dir_all(&state.download_dir).is_err() {
        state.sessions.fail(&session_id);
        return status_json(StatusCode::INTERNAL_SERVER_ERROR, "cannot create download dir");
    }

    let destination = match resolve_destination(&state.download_dir, &meta.file_name) {
        Ok(path) => path,
        Err(_) => {
            state.sessions.fail(&session_id);
            return status_json(StatusCode::INTERNAL_SERVER_ERROR, "invalid file name");
        }
    };

    state.sessions.mark_uploading(&session_id);

    match stream_to_file(body, &destination, meta.size).await {
        Ok(written) if written == meta.size => {
            state.sessions.record_progress(&session_id, &file_id, written);
            if state
                .sessions
                .get(&session_id)
                .map(|s| s.all_files_complete())
                .unwrap_or(false)
            {
                state.sessions.complete(&session_id);
            }
            (StatusCode::OK, Json(json!({"status": "file_received_ok"})))
        }
        Ok(written) => {
            let _ = std::fs::remove_file(&destination);
            state.sessions.fail(&session_id);
            warn!(
                "size mismatch for {file_id}: expected {} got {written}",
                meta.size
            );
            status_json(StatusCode::INTERNAL_SERVER_ERROR, "size mismatch")
        }
        Err(e) => {
            let _ = std::fs::remove_file(&destination);
            state.sessions.fail(&session_id);
            warn!("write error for {file_id}: {e}");
            status_json(StatusCode::INTERNAL_SERVER_ERROR, "write error")
        }
    }
}

fn status_json(status: StatusCode, message: &'static str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(json!({"status": message})))
}

/// Streams the request body to `destination` with a bounded in-memory
/// buffer; the read side throttles naturally behind blocking writes if
/// the disk can't keep up. Returns the number of bytes actually written,
/// leaving the size-vs-`expected` comparison to the
/// caller so a short read and a successful small file are told apart the
/// same way regardless of where the mismatch happened.
async fn stream_to_file(
    body: Body,
    destination: &std::path::Path,
    expected: u64,
) -> std::io::Result<u64> {
    let mut file = tokio::fs::File::create(destination).await?;
    let mut stream = body.into_data_stream();
    let mut written: u64 = 0;
    let mut next_log = SEND_CHUNK_LOG_INTERVAL;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| std::io::Error::other(e.to_string()))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        if written >= next_log {
            debug!("{} bytes written to {}", written, destination.display());
            next_log += SEND_CHUNK_LOG_INTERVAL;
        }
        if written > expected {
            // Keep reading is pointless once we've already exceeded the
            // declared size; report what we have and let the caller
            // reject it as a mismatch.
            break;
        }
    }
    file.flush().await?;
    Ok(written)
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<SocketAddr, crate::error::HttpPlaneError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| crate::error::HttpPlaneError::Bind { addr, source })?;
    let bound = listener.local_addr().unwrap_or(addr);

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown.await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        if let Err(e) = server.await {
            info!("HTTP server exited: {e}");
        }
    });

    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::AutoAcceptConsentProvider;
    use crate::types::{DeviceType, FileMetadata, Protocol};
    use std::collections::HashMap;

    fn test_state(dir: &std::path::Path) -> AppState {
        let identity = Arc::new(IdentityStore::new("tester", None, Some(DeviceType::Desktop)));
        AppState {
            identity,
            peers: Arc::new(PeerRegistry::new("self-fp")),
            sessions: Arc::new(SessionStore::new()),
            consent: Arc::new(AutoAcceptConsentProvider),
            download_dir: dir.to_path_buf(),
        }
    }

    fn offer() -> TransferOffer {
        let mut files = HashMap::new();
        files.insert(
            "f1".to_string(),
            FileMetadata {
                id: "f1".to_string(),
                file_name: "hello.txt".to_string(),
                size: 5,
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
                ip: std::net::Ipv4Addr::LOCALHOST,
                port: 1,
                protocol: Protocol::Http,
                download: true,
                announce: false,
            },
            files,
        }
    }

    #[tokio::test]
    async fn send_request_then_send_writes_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let response = send_request(State(state.clone()), Ok(Json(offer()))).await;
        let (status, Json(body)) = response;
        assert_eq!(status, StatusCode::OK);
        let session_id = body["sessionId"].as_str().unwrap().to_string();

        let mut headers = HeaderMap::new();
        headers.insert("X-Session-ID", session_id.parse().unwrap());
        headers.insert("X-File-ID", "f1".parse().unwrap());
        let body = Body::from(&b"hello"[..]);

        let (status, _) = send(State(state.clone()), headers, body).await;
        assert_eq!(status, StatusCode::OK);

        let written = std::fs::read(dir.path().join("hello.txt")).unwrap();
        assert_eq!(written, b"hello");
        assert_eq!(
            state.sessions.get(&session_id).unwrap().state,
            crate::sessions::SessionState::Completed
        );
    }

    #[tokio::test]
    async fn send_with_short_body_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let (_, Json(body)) = send_request(State(state.clone()), Ok(Json(offer()))).await;
        let session_id = body["sessionId"].as_str().unwrap().to_string();

        let mut headers = HeaderMap::new();
        headers.insert("X-Session-ID", session_id.parse().unwrap());
        headers.insert("X-File-ID", "f1".parse().unwrap());
        let body = Body::from(&b"hi"[..]); // 2 bytes, declared size is 5

        let (status, _) = send(State(state.clone()), headers, body).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!dir.path().join("hello.txt").exists());
        assert_eq!(
            state.sessions.get(&session_id).unwrap().state,
            crate::sessions::SessionState::Failed
        );
    }

    #[tokio::test]
    async fn send_with_unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let mut headers = HeaderMap::new();
        headers.insert("X-Session-ID", "nope".parse().unwrap());
        headers.insert("X-File-ID", "f1".parse().unwrap());

        let (status, _) = send(State(state), headers, Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn decline_leaves_no_session_and_subsequent_send_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState {
            consent: Arc::new(crate::consent::AutoDeclineConsentProvider),
            ..test_state(dir.path())
        };

        let (status, Json(body)) = send_request(State(state.clone()), Ok(Json(offer()))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["status"], "declined");

        let mut headers = HeaderMap::new();
        headers.insert("X-Session-ID", "whatever".parse().unwrap());
        headers.insert("X-File-ID", "f1".parse().unwrap());
        let (status, _) = send(State(state), headers, Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_offer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut empty = offer();
        empty.files.clear();

        let (status, _) = send_request(State(state), Ok(Json(empty))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn zero_byte_file_completes_with_no_bytes_written() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut zero = offer();
        zero.files.get_mut("f1").unwrap().size = 0;

        let (_, Json(body)) = send_request(State(state.clone()), Ok(Json(zero))).await;
        let session_id = body["sessionId"].as_str().unwrap().to_string();

        let mut headers = HeaderMap::new();
        headers.insert("X-Session-ID", session_id.parse().unwrap());
        headers.insert("X-File-ID", "f1".parse().unwrap());

        let (status, _) = send(State(state.clone()), headers, Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            state.sessions.get(&session_id).unwrap().state,
            crate::sessions::SessionState::Completed
        );
    }
}
