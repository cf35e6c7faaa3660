//! The multicast presence protocol.
//!
//! A lazily-initialized multicast socket, a `tokio::time::interval`
//! announcer task, a `recv_from` loop on a `tokio::select!` against a
//! `CancellationToken`, and a periodic sweep, driving a single selected
//! network interface rather than one socket per multicast-capable
//! interface. Datagrams decode straight into the typed [`DeviceInfo`] via
//! `serde_json::from_slice` — indexing a loosely-typed JSON value
//! field-by-field is exactly the kind of thing that silently accepts a
//! malformed peer and then panics three lines later.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use netdev::Interface;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::DiscoveryError;
use crate::identity::IdentityStore;
use crate::peers::PeerRegistry;
use crate::types::DeviceInfo;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 167);
pub const MULTICAST_PORT: u16 = 53317;
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
const RESPONSE_DELAY: Duration = Duration::from_millis(500);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Interface name prefixes that mark a virtual/container/VPN interface.
/// `netdev` does not tag interfaces as virtual directly, so this mirrors
/// the common naming convention instead.
const VIRTUAL_PREFIXES: &[&str] = &["docker", "veth", "br-", "virbr", "tun", "tap", "lo"];

fn is_virtual(iface: &Interface) -> bool {
    VIRTUAL_PREFIXES
        .iter()
        .any(|prefix| iface.name.starts_with(prefix))
}

/// Picks the first interface that is up, non-loopback, non-virtual,
/// multicast-capable, and carries an IPv4 address. Returns `None` to
/// signal "delegate to the OS" (bind unspecified, let the kernel route
/// the multicast join).
pub fn select_interface() -> Option<Ipv4Addr> {
    netdev::get_interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && iface.is_multicast() && !iface.is_loopback())
        .filter(|iface| !is_virtual(iface))
        .find_map(|iface| iface.ipv4.first().map(|net| net.addr()))
}

async fn bind_multicast_socket(interface_ip: Option<Ipv4Addr>) -> Result<UdpSocket, DiscoveryError> {
    let socket = tokio::task::spawn_blocking(move || -> std::io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        #[cfg(not(target_os = "windows"))]
        socket.set_reuse_port(true)?;

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MULTICAST_PORT);
        socket.bind(&bind_addr.into())?;

        socket.set_multicast_ttl_v4(4)?;
        socket.set_multicast_loop_v4(false)?;
        let join_if = interface_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
        if interface_ip.is_some() {
            socket.set_multicast_if_v4(&join_if)?;
        }
        socket.join_multicast_v4(&MULTICAST_GROUP, &join_if)?;

        Ok(socket)
    })
    .await
    .map_err(DiscoveryError::from)?
    .map_err(|source| DiscoveryError::Socket {
        iface: interface_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "os-selected".to_string()),
        source,
    })?;

    UdpSocket::from_std(socket.into()).map_err(|source| DiscoveryError::Socket {
        iface: "tokio-conversion".to_string(),
        source,
    })
}

/// Drives the presence protocol: announce, listen, sweep.
pub struct DiscoveryEngine {
    identity: Arc<IdentityStore>,
    peers: Arc<PeerRegistry>,
    client: reqwest::Client,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    announce_cancel: Mutex<Option<CancellationToken>>,
    listen_cancel: Mutex<Option<CancellationToken>>,
    sweep_cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryEngine {
    pub fn new(identity: Arc<IdentityStore>, peers: Arc<PeerRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(REGISTER_TIMEOUT)
            .build()
            .expect("reqwest client configuration is always valid");

        Self {
            identity,
            peers,
            client,
            socket: Mutex::new(None),
            announce_cancel: Mutex::new(None),
            listen_cancel: Mutex::new(None),
            sweep_cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn socket(&self) -> Result<Arc<UdpSocket>, DiscoveryError> {
        let mut guard = self.socket.lock().await;
        if let Some(socket) = guard.as_ref() {
            return Ok(socket.clone());
        }
        let interface_ip = select_interface();
        let socket = Arc::new(bind_multicast_socket(interface_ip).await?);
        *guard = Some(socket.clone());
        Ok(socket)
    }

    /// Sends a DeviceInfo datagram with `announce=true` every
    /// [`ANNOUNCE_INTERVAL`] until [`DiscoveryEngine::stop_announcing`] is
    /// called.
    pub async fn start_announcing(&self) -> Result<(), DiscoveryError> {
        let mut guard = self.announce_cancel.lock().await;
        if guard.is_some() {
            return Err(DiscoveryError::AlreadyAnnouncing);
        }
        let socket = self.socket().await?;
        let identity = self.identity.clone();
        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());
        drop(guard);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let device_info = identity.snapshot().as_device_info(true);
                        if let Err(e) = send_datagram(&socket, &device_info).await {
                            info!("announcement send failed: {e}");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    pub async fn stop_announcing(&self) {
        if let Some(token) = self.announce_cancel.lock().await.take() {
            token.cancel();
        }
    }

    /// Listens for announcements and responses, updating the registry and
    /// answering primary announcements. Runs until [`DiscoveryEngine::stop_listening`].
    pub async fn start_listening(&self) -> Result<(), DiscoveryError> {
        let mut guard = self.listen_cancel.lock().await;
        if guard.is_some() {
            return Err(DiscoveryError::AlreadyListening);
        }
        let socket = self.socket().await?;
        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());
        drop(guard);

        let identity = self.identity.clone();
        let peers = self.peers.clone();
        let client = self.client.clone();
        let announce_socket = socket.clone();

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("discovery listener stopping");
                        break;
                    }
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, addr)) => {
                                handle_datagram(
                                    &buf[..len],
                                    addr,
                                    &identity,
                                    &peers,
                                    &client,
                                    &announce_socket,
                                )
                                .await;
                            }
                            Err(e) => error!("multicast receive error: {e}"),
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    pub async fn stop_listening(&self) {
        if let Some(token) = self.listen_cancel.lock().await.take() {
            token.cancel();
        }
    }

    /// Evicts stale peers every `timeout / 2`.
    pub async fn start_sweeping(&self, timeout: Duration) {
        let mut guard = self.sweep_cancel.lock().await;
        if guard.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());
        drop(guard);

        let peers = self.peers.clone();
        let period = timeout / 2;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = peers.sweep_expired(std::time::Instant::now());
                        if !evicted.is_empty() {
                            debug!("evicted {} stale peer(s)", evicted.len());
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    pub async fn stop_sweeping(&self) {
        if let Some(token) = self.sweep_cancel.lock().await.take() {
            token.cancel();
        }
    }

    /// Stops every task and releases the socket. Does not error: shutdown
    /// must always complete.
    pub async fn shutdown(&self) {
        self.stop_announcing().await;
        self.stop_listening().await;
        self.stop_sweeping().await;
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.socket.lock().await.take();
    }
}

async fn send_datagram(socket: &UdpSocket, info: &DeviceInfo) -> std::io::Result<()> {
    let msg = serde_json::to_vec(info).expect("DeviceInfo always serializes");
    let target = (MULTICAST_GROUP, MULTICAST_PORT);
    socket.send_to(&msg, target).await?;
    Ok(())
}

async fn handle_datagram(
    data: &[u8],
    addr: SocketAddr,
    identity: &Arc<IdentityStore>,
    peers: &Arc<PeerRegistry>,
    client: &reqwest::Client,
    announce_socket: &Arc<UdpSocket>,
) {
    let info: DeviceInfo = match serde_json::from_slice(data) {
        Ok(info) => info,
        Err(e) => {
            warn!("dropping malformed discovery datagram from {addr}: {e}");
            return;
        }
    };

    let self_info = identity.snapshot();
    if info.fingerprint == self_info.fingerprint {
        return;
    }

    let observed_ip = match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => {
            warn!("dropping discovery datagram from non-IPv4 peer {addr}");
            return;
        }
    };

    let mut info = info;
    info.ip = observed_ip;

    let should_respond = info.announce;
    peers.upsert(info.clone(), observed_ip);

    if should_respond {
        let response = self_info.as_device_info(false);

        let http_client = client.clone();
        let http_peer = info.clone();
        let http_response = response.clone();
        tokio::spawn(async move {
            if let Err(e) = register_via_http(&http_client, &http_peer, &http_response).await {
                info!(
                    "HTTP register to {}:{} failed, relying on UDP fallback: {e}",
                    http_peer.ip, http_peer.port
                );
            }
        });

        let udp_socket = announce_socket.clone();
        let udp_response = response;
        tokio::spawn(async move {
            tokio::time::sleep(RESPONSE_DELAY).await;
            if let Err(e) = send_datagram(&udp_socket, &udp_response).await {
                info!("UDP supplementary response failed: {e}");
            }
        });
    }
}

async fn register_via_http(
    client: &reqwest::Client,
    peer: &DeviceInfo,
    response: &DeviceInfo,
) -> Result<(), reqwest::Error> {
    let url = format!(
        "{}://{}:{}/api/localsend/v1/register",
        peer.protocol.as_str(),
        peer.ip,
        peer.port
    );
    client
        .post(url)
        .json(response)
        .timeout(REGISTER_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
