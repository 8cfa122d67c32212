//! Byte-level transports: the RTSP wire codec, UDP listeners, the
//! multicast writer, the lossy write queue and the HTTP/WebSocket tunnels.

pub mod conn;
pub mod multicast;
pub mod tunnel;
pub mod udp;
pub mod write_queue;

use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe byte stream, so that tunnels and plain TCP sockets can be
/// used interchangeably underneath a [`conn::Conn`].
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Maximum UDP payload size that avoids fragmentation on a standard
/// 1500-byte MTU; interleaved frames default to the same bound for parity.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1472;

/// Kernel receive buffer requested for UDP sockets.
pub const UDP_KERNEL_READ_BUFFER_SIZE: usize = 512 * 1024;
