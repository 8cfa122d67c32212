//! RTSP server: accepts connections, allocates UDP listeners and
//! multicast groups, and manages session ids and timeouts.

pub(crate) mod connection;
mod handler;
pub(crate) mod session;
mod stream;

pub use handler::{RequestContext, ServerCapabilities, ServerHandler};
pub use session::{DecodeErrorCb, PacketsLostCb, RtcpPacketCb, RtpPacketCb, ServerSession};
pub use stream::ServerStream;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::io::multicast::MulticastHandler;
use crate::io::tunnel::CookieMap;
use crate::io::udp::UdpListener;
use crate::io::DEFAULT_MAX_PACKET_SIZE;

/// Multicast delivery configuration.
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Base address and prefix length groups are allocated from
    /// (e.g. `224.1.0.0/16`).
    pub ip_range: (Ipv4Addr, u8),
    /// RTP port shared by every group.
    pub rtp_port: u16,
    /// RTCP port shared by every group.
    pub rtcp_port: u16,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the RTSP TCP listener binds to.
    pub rtsp_address: SocketAddr,
    /// Address of the shared RTP UDP listener; `None` disables UDP.
    pub udp_rtp_address: Option<SocketAddr>,
    /// Address of the shared RTCP UDP listener.
    pub udp_rtcp_address: Option<SocketAddr>,
    /// Multicast support; `None` rejects multicast SETUPs.
    pub multicast: Option<MulticastConfig>,
    /// Idle deadline of connection reads and of UDP recording sessions.
    pub read_timeout: Duration,
    /// Keepalive deadline advertised to and enforced on clients.
    pub session_timeout: Duration,
    /// Spacing of Receiver Reports on UDP record sessions; TCP sessions
    /// report every second, doubling as keepalives.
    pub receiver_report_period: Duration,
    /// Write queue capacity for reader (play) sessions.
    pub write_queue_size: usize,
    /// Maximum RTP/RTCP packet size, also bounding interleaved frames.
    pub max_packet_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rtsp_address: "0.0.0.0:8554".parse().expect("static address"),
            udp_rtp_address: None,
            udp_rtcp_address: None,
            multicast: None,
            read_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(60),
            receiver_report_period: crate::rtcp::DEFAULT_RECEIVER_REPORT_PERIOD,
            write_queue_size: 256,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

pub(crate) struct ServerInner {
    pub config: ServerConfig,
    pub handler: Arc<dyn ServerHandler>,
    pub sessions: DashMap<String, Arc<ServerSession>>,
    pub rtp_listener: Option<UdpListener>,
    pub rtcp_listener: Option<UdpListener>,
    pub cookies: CookieMap,
    multicast_next: AtomicU32,
    local_addr: SocketAddr,
    conn_counter: AtomicU64,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInner {
    /// Allocates a session id nobody else holds.
    pub fn unique_session_id(&self) -> String {
        const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
        loop {
            let mut rng = rand::thread_rng();
            let id: String = (0..16)
                .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                .collect();
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Allocates the next multicast group from the configured range.
    pub fn allocate_multicast_handler(&self) -> Result<MulticastHandler> {
        let mc = self
            .config
            .multicast
            .as_ref()
            .ok_or(Error::UnsupportedTransport)?;
        let (base, prefix) = mc.ip_range;
        let size = 1u32
            .checked_shl(32 - u32::from(prefix))
            .unwrap_or(u32::MAX);
        // Skip the network address; wrap within the range.
        let span = size.saturating_sub(1).max(1);
        let offset = self.multicast_next.fetch_add(1, Ordering::Relaxed) % span + 1;
        let group = Ipv4Addr::from(u32::from(base) | offset);
        MulticastHandler::new(group, mc.rtp_port, mc.rtcp_port)
    }
}

/// An RTSP server.
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

impl Server {
    /// Binds the listeners and starts accepting connections.
    pub async fn new(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Result<Server> {
        let tcp = TcpListener::bind(config.rtsp_address).await?;
        let local_addr = tcp.local_addr()?;

        let rtp_listener = match config.udp_rtp_address {
            Some(addr) => Some(UdpListener::bind_demux(addr, config.max_packet_size)?),
            None => None,
        };
        let rtcp_listener = match config.udp_rtcp_address {
            Some(addr) => Some(UdpListener::bind_demux(addr, config.max_packet_size)?),
            None => None,
        };

        let inner = Arc::new(ServerInner {
            config,
            handler,
            sessions: DashMap::new(),
            rtp_listener,
            rtcp_listener,
            cookies: Arc::new(DashMap::new()),
            multicast_next: AtomicU32::new(0),
            local_addr,
            conn_counter: AtomicU64::new(0),
            conn_tasks: Mutex::new(Vec::new()),
            accept_task: Mutex::new(None),
        });

        let accept_inner = inner.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (socket, addr) = match tcp.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("accept failed: {e}");
                        continue;
                    }
                };
                debug!("connection accepted from {addr}");
                let conn_id = accept_inner.conn_counter.fetch_add(1, Ordering::Relaxed);
                let conn_inner = accept_inner.clone();
                let handle =
                    tokio::spawn(connection::serve(conn_inner, socket, conn_id));
                let mut tasks = accept_inner.conn_tasks.lock();
                tasks.retain(|t| !t.is_finished());
                tasks.push(handle);
            }
        });
        *inner.accept_task.lock() = Some(accept_task);

        info!("RTSP server listening on {local_addr}");
        Ok(Server { inner })
    }

    /// Address the TCP listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Ports of the shared UDP listeners, when UDP is enabled.
    pub fn udp_ports(&self) -> Option<(u16, u16)> {
        match (&self.inner.rtp_listener, &self.inner.rtcp_listener) {
            (Some(rtp), Some(rtcp)) => Some((rtp.port(), rtcp.port())),
            _ => None,
        }
    }

    /// Stops accepting, terminates every session and connection.
    pub async fn close(&self) {
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }

        let sessions: Vec<Arc<ServerSession>> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for session in sessions {
            session.close().await;
        }

        // Give session tasks a moment to run their cleanup before the
        // connections underneath them are torn down.
        tokio::task::yield_now().await;

        let tasks: Vec<JoinHandle<()>> = self.inner.conn_tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        if let Some(l) = &self.inner.rtp_listener {
            l.close();
        }
        if let Some(l) = &self.inner.rtcp_listener {
            l.close();
        }
        info!("RTSP server closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullHandler;

    #[async_trait]
    impl ServerHandler for NullHandler {
        fn capabilities(&self) -> ServerCapabilities {
            ServerCapabilities::play_only()
        }
    }

    #[tokio::test]
    async fn binds_and_closes() {
        let config = ServerConfig {
            rtsp_address: "127.0.0.1:0".parse().unwrap(),
            udp_rtp_address: Some("127.0.0.1:0".parse().unwrap()),
            udp_rtcp_address: Some("127.0.0.1:0".parse().unwrap()),
            ..Default::default()
        };
        let server = Server::new(config, Arc::new(NullHandler)).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        let (rtp, rtcp) = server.udp_ports().unwrap();
        assert_ne!(rtp, 0);
        assert_ne!(rtcp, 0);
        server.close().await;
    }

    #[tokio::test]
    async fn session_ids_are_unique_and_opaque() {
        let config = ServerConfig {
            rtsp_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = Server::new(config, Arc::new(NullHandler)).await.unwrap();
        let a = server.inner.unique_session_id();
        let b = server.inner.unique_session_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        server.close().await;
    }

    #[tokio::test]
    async fn multicast_allocation_walks_the_range() {
        let config = ServerConfig {
            rtsp_address: "127.0.0.1:0".parse().unwrap(),
            multicast: Some(MulticastConfig {
                ip_range: ("224.1.0.0".parse().unwrap(), 16),
                rtp_port: 8000,
                rtcp_port: 8001,
            }),
            ..Default::default()
        };
        let server = Server::new(config, Arc::new(NullHandler)).await.unwrap();
        let a = server.inner.allocate_multicast_handler().unwrap();
        let b = server.inner.allocate_multicast_handler().unwrap();
        assert_ne!(a.group(), b.group());
        assert!(a.group().octets()[0] == 224 && a.group().octets()[1] == 1);
        assert_eq!(a.ports(), (8000, 8001));
        server.close().await;
    }
}
