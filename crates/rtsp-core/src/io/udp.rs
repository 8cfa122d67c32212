//! UDP packet listeners.
//!
//! A listener owns one socket and one read task. On the server, listeners
//! are shared: incoming datagrams are demultiplexed to the session
//! callback registered for the source `(ip, port)`. On the client, each
//! media owns a listener pair in single-peer mode, optionally locking onto
//! the first source port seen (for NVRs that send from an unannounced
//! port).

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::error::{DecodeError, Result};

use super::UDP_KERNEL_READ_BUFFER_SIZE;

/// Callback invoked per datagram.
///
/// Receives the payload, or a decode error for oversized datagrams. The
/// returned boolean reports whether the payload was retained, in which
/// case the listener allocates a fresh buffer instead of recycling.
pub type PacketCallback =
    Arc<dyn Fn(std::result::Result<Bytes, DecodeError>) -> bool + Send + Sync>;

/// Range RTP ports are picked from when the peer lets us choose.
const PORT_RANGE: std::ops::Range<u16> = 10000..65534;

struct SingleState {
    expected_ip: IpAddr,
    /// Locked-on source port; None until the first packet when
    /// `any_port` is set.
    expected_port: Option<u16>,
    any_port: bool,
    callback: Option<PacketCallback>,
}

enum Mode {
    /// Server mode: demultiplex by exact source address.
    Demux(DashMap<SocketAddr, PacketCallback>),
    /// Client mode: one peer, optional port lock-on.
    Single(Mutex<SingleState>),
}

struct Inner {
    socket: Arc<UdpSocket>,
    mode: Mode,
    max_payload_size: usize,
    closed: AtomicBool,
}

/// A UDP socket plus its read task.
#[derive(Clone)]
pub struct UdpListener {
    inner: Arc<Inner>,
}

fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // Best effort: some environments cap SO_RCVBUF below this.
    if let Err(e) = socket.set_recv_buffer_size(UDP_KERNEL_READ_BUFFER_SIZE) {
        debug!("unable to set UDP receive buffer size: {e}");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

impl UdpListener {
    /// Binds a shared (server-mode) listener.
    pub fn bind_demux(addr: SocketAddr, max_payload_size: usize) -> Result<Self> {
        Self::start(bind_socket(addr)?, Mode::Demux(DashMap::new()), max_payload_size)
    }

    /// Binds a single-peer (client-mode) listener on the given local
    /// address. The callback is supplied later via [`Self::start_single`].
    pub fn bind_single(
        addr: SocketAddr,
        expected_ip: IpAddr,
        max_payload_size: usize,
    ) -> Result<Self> {
        Self::start(
            bind_socket(addr)?,
            Mode::Single(Mutex::new(SingleState {
                expected_ip,
                expected_port: None,
                any_port: false,
                callback: None,
            })),
            max_payload_size,
        )
    }

    /// Binds a consecutive (even, odd) port pair for RTP/RTCP, retrying on
    /// conflicts.
    pub fn bind_pair(
        local_ip: IpAddr,
        expected_ip: IpAddr,
        max_payload_size: usize,
    ) -> Result<(Self, Self)> {
        let mut rng = rand::thread_rng();
        let mut last_err = None;
        for _ in 0..64 {
            let rtp_port = rng.gen_range(PORT_RANGE.start / 2..PORT_RANGE.end / 2) * 2;
            let rtp = match bind_socket(SocketAddr::new(local_ip, rtp_port)) {
                Ok(s) => s,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let rtcp = match bind_socket(SocketAddr::new(local_ip, rtp_port + 1)) {
                Ok(s) => s,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let mk = |socket| {
                Self::start(
                    socket,
                    Mode::Single(Mutex::new(SingleState {
                        expected_ip,
                        expected_port: None,
                        any_port: false,
                        callback: None,
                    })),
                    max_payload_size,
                )
            };
            return Ok((mk(rtp)?, mk(rtcp)?));
        }
        Err(last_err.unwrap_or(crate::error::Error::UdpPortPairInUse))
    }

    fn start(socket: UdpSocket, mode: Mode, max_payload_size: usize) -> Result<Self> {
        let inner = Arc::new(Inner {
            socket: Arc::new(socket),
            mode,
            max_payload_size,
            closed: AtomicBool::new(false),
        });

        let task_inner = inner.clone();
        tokio::spawn(async move {
            let max = task_inner.max_payload_size;
            let mut buf = BytesMut::zeroed(max + 1);
            loop {
                let (n, source) = match task_inner.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => {
                        if task_inner.closed.load(Ordering::Acquire) {
                            break;
                        }
                        continue;
                    }
                };
                if task_inner.closed.load(Ordering::Acquire) {
                    break;
                }

                let result = if n > max {
                    Err(DecodeError::PacketTooBig { size: n, max })
                } else {
                    Ok(buf.split_to(n).freeze())
                };
                let retained = match &task_inner.mode {
                    Mode::Demux(map) => match map.get(&source) {
                        Some(cb) => cb(result),
                        None => {
                            trace!("discarding datagram from unregistered source {source}");
                            false
                        }
                    },
                    Mode::Single(state) => {
                        let cb = {
                            let mut st = state.lock();
                            if source.ip() != st.expected_ip {
                                None
                            } else {
                                match st.expected_port {
                                    Some(p) if p == source.port() => st.callback.clone(),
                                    Some(_) => None,
                                    None if st.any_port => {
                                        // First packet defines the accepted port.
                                        st.expected_port = Some(source.port());
                                        st.callback.clone()
                                    }
                                    None => None,
                                }
                            }
                        };
                        match cb {
                            Some(cb) => cb(result),
                            None => false,
                        }
                    }
                };

                if retained || buf.len() < max + 1 {
                    buf = BytesMut::zeroed(max + 1);
                }
            }
        });

        Ok(Self { inner })
    }

    /// Local port the socket is bound to.
    pub fn port(&self) -> u16 {
        self.inner.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Registers a demux callback for a source address. Fails when the
    /// pair is already claimed by another session.
    pub fn register(&self, source: SocketAddr, cb: PacketCallback) -> Result<()> {
        match &self.inner.mode {
            Mode::Demux(map) => {
                if map.contains_key(&source) {
                    return Err(crate::error::Error::UdpPortPairInUse);
                }
                map.insert(source, cb);
                Ok(())
            }
            Mode::Single(_) => unreachable!("register on single-peer listener"),
        }
    }

    /// Removes a demux callback.
    pub fn unregister(&self, source: &SocketAddr) {
        if let Mode::Demux(map) = &self.inner.mode {
            map.remove(source);
        }
    }

    /// True when a demux callback exists for this source.
    pub fn is_registered(&self, source: &SocketAddr) -> bool {
        match &self.inner.mode {
            Mode::Demux(map) => map.contains_key(source),
            Mode::Single(_) => false,
        }
    }

    /// Arms a single-peer listener with its callback.
    pub fn start_single(&self, expected_port: Option<u16>, any_port: bool, cb: PacketCallback) {
        if let Mode::Single(state) = &self.inner.mode {
            let mut st = state.lock();
            st.expected_port = expected_port;
            st.any_port = any_port;
            st.callback = Some(cb);
        }
    }

    /// Disarms a single-peer listener.
    pub fn stop_single(&self) {
        if let Mode::Single(state) = &self.inner.mode {
            let mut st = state.lock();
            st.callback = None;
            st.expected_port = None;
        }
    }

    /// Remote port a single-peer listener locked onto, if any.
    pub fn locked_port(&self) -> Option<u16> {
        match &self.inner.mode {
            Mode::Single(state) => state.lock().expected_port,
            Mode::Demux(_) => None,
        }
    }

    /// Sends one datagram.
    pub async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> Result<()> {
        self.inner.socket.send_to(payload, dest).await?;
        Ok(())
    }

    /// Stops the read task. The socket is released once all clones drop.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        // Wake the read task with a zero-length datagram to itself.
        if let Ok(addr) = self.inner.socket.local_addr() {
            let sock = self.inner.socket.clone();
            tokio::spawn(async move {
                let mut target = addr;
                if target.ip().is_unspecified() {
                    target.set_ip(if target.is_ipv4() {
                        IpAddr::from([127, 0, 0, 1])
                    } else {
                        IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1])
                    });
                }
                let _ = sock.send_to(&[], target).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn demux_routes_by_source() {
        let listener = UdpListener::bind_demux("127.0.0.1:0".parse().unwrap(), 1472).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let source = sender.local_addr().unwrap();
        listener
            .register(
                source,
                Arc::new(move |r| {
                    let _ = tx.send(r);
                    false
                }),
            )
            .unwrap();

        let dest: SocketAddr = format!("127.0.0.1:{}", listener.port()).parse().unwrap();
        sender.send_to(b"hello", dest).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], b"hello");

        // Unregistered sources are dropped.
        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        other.send_to(b"noise", dest).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
        listener.close();
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let listener = UdpListener::bind_demux("127.0.0.1:0".parse().unwrap(), 1472).unwrap();
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        listener.register(addr, Arc::new(|_| false)).unwrap();
        assert!(listener.register(addr, Arc::new(|_| false)).is_err());
        listener.unregister(&addr);
        listener.register(addr, Arc::new(|_| false)).unwrap();
        listener.close();
    }

    #[tokio::test]
    async fn too_big_datagram_reported() {
        let listener = UdpListener::bind_demux("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        listener
            .register(
                sender.local_addr().unwrap(),
                Arc::new(move |r| {
                    let _ = tx.send(r);
                    false
                }),
            )
            .unwrap();
        let dest: SocketAddr = format!("127.0.0.1:{}", listener.port()).parse().unwrap();
        sender.send_to(&[0u8; 9], dest).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            got,
            Err(DecodeError::PacketTooBig { size: 9, max: 8 })
        ));
        listener.close();
    }

    #[tokio::test]
    async fn pair_ports_are_consecutive_and_even() {
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let (rtp, rtcp) = UdpListener::bind_pair(local, local, 1472).unwrap();
        assert_eq!(rtp.port() % 2, 0);
        assert_eq!(rtcp.port(), rtp.port() + 1);
        assert!((10000..=65534).contains(&rtp.port()));
        rtp.close();
        rtcp.close();
    }

    #[tokio::test]
    async fn any_port_locks_first_source() {
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let listener = UdpListener::bind_single("127.0.0.1:0".parse().unwrap(), local, 1472).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        listener.start_single(
            None,
            true,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                false
            }),
        );

        let dest: SocketAddr = format!("127.0.0.1:{}", listener.port()).parse().unwrap();
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        first.send_to(b"a", dest).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.locked_port(), Some(first.local_addr().unwrap().port()));

        // A different source port is now rejected.
        second.send_to(b"b", dest).await.unwrap();
        first.send_to(b"c", dest).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        listener.close();
    }
}
