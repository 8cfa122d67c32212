//! RTSP 1.0 session/transport engine with an RTP/RTCP data plane.
//!
//! This crate implements both sides of the RTSP dialect spoken by IP
//! cameras, encoders and widely deployed tooling: a [`client::Client`]
//! that consumes or publishes live media, and a [`server::Server`] that
//! terminates client sessions and fans published streams out to readers.
//!
//! Media transports are negotiated per session: TCP-interleaved, UDP
//! unicast or UDP multicast, each optionally protected with SRTP keyed
//! through MIKEY. RTP/RTCP/SDP wire formats and SRTP transforms come from
//! the `rtp`, `rtcp`, `sdp` and `webrtc-srtp` crates; this crate fuses
//! them with the protocol state machines, the per-connection I/O tasks,
//! loss-tolerant write queues and the timeout rules of the protocol.
//!
//! ```no_run
//! use rtsp_core::client::{Client, ClientOptions};
//! use rtsp_core::Format;
//! use std::sync::Arc;
//!
//! # async fn run() -> rtsp_core::Result<()> {
//! let mut client =
//!     Client::connect(ClientOptions::default(), "rtsp://camera/stream").await?;
//! let desc = client.describe().await?;
//! client.setup_all().await?;
//! for (i, media) in desc.medias.iter().enumerate() {
//!     for format in &media.formats {
//!         client.on_packet_rtp(i, format.payload_type(), Arc::new(|pkt| {
//!             println!("got RTP packet with seq {}", pkt.header.sequence_number);
//!         }));
//!     }
//! }
//! client.play(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod crypto;
pub mod description;
mod error;
pub mod headers;
pub mod io;
pub mod message;
pub mod reorder;
pub mod rtcp;
pub mod server;

pub use error::{DecodeError, Error, Result};

pub use client::{Client, ClientOptions, TransportPreference};
pub use description::{Description, Format, GenericFormat, Media, MediaType};
pub use server::{
    RequestContext, Server, ServerCapabilities, ServerHandler, ServerSession, ServerStream,
};
pub use server::{MulticastConfig, ServerConfig};
