use thiserror::Error;

/// Errors surfaced by the discovery engine.
///
/// Transient network failures are logged and retried implicitly by the
/// next tick; the rest carry enough detail for the caller to decide
/// whether to escalate.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no multicast-capable network interface found")]
    NoInterfaces,
    #[error("socket error on {iface}: {source}")]
    Socket {
        iface: String,
        source: std::io::Error,
    },
    #[error("failed to join tokio task: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("announcements are already running")]
    AlreadyAnnouncing,
    #[error("listener is already running")]
    AlreadyListening,
}

/// Errors surfaced by the HTTP control/data plane.
#[derive(Error, Debug)]
pub enum HttpPlaneError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Errors surfaced while handling a single `/send` or `/send-request` exchange.
///
/// Each variant maps directly onto an HTTP status code: `MalformedPayload`
/// -> 400, `ProtocolViolation` -> 404, `ConsentDeclined` -> 403, `LocalIo`
/// -> 500.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unknown session or file")]
    ProtocolViolation,
    #[error("consent declined")]
    ConsentDeclined,
    #[error("local I/O failure: {0}")]
    LocalIo(#[from] std::io::Error),
    #[error("short read: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Errors surfaced by the outbound HTTP client used by the sending side.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("peer declined the offer")]
    Declined,
    #[error("peer returned unexpected status {0}")]
    UnexpectedStatus(reqwest::StatusCode),
}
