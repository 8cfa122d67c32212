//! Error types for the RTSP session/transport engine.

use std::io;

use thiserror::Error;

/// A type alias for handling `Result`s with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while speaking RTSP or moving RTP/RTCP through a
/// session.
///
/// Variants are grouped by origin: wire (always fatal for the connection),
/// protocol state (round-tripped as a 4xx response), transport negotiation,
/// timeouts, and local conditions.
#[derive(Error, Debug)]
pub enum Error {
    // ---- wire ----
    /// Malformed request, response or interleaved frame.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The CSeq header is missing or not a number.
    #[error("CSeq is missing or invalid")]
    InvalidCseq,

    /// URL scheme is not rtsp:// or rtsps://.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Interleaved frame payload exceeds the configured maximum.
    #[error("frame payload of {size} bytes exceeds the maximum of {max}")]
    FrameTooBig {
        /// Declared payload length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    // ---- protocol state ----
    /// A request method arrived in a state that does not allow it.
    #[error("{method} is not allowed in state {state}")]
    InvalidState {
        /// Offending method.
        method: &'static str,
        /// State the session was in.
        state: &'static str,
    },

    /// The Session header references an unknown session.
    #[error("session not found")]
    SessionNotFound,

    /// The request path does not match the path the session was set up with.
    #[error("path mismatch: expected '{expected}', got '{actual}'")]
    PathMismatch {
        /// Path fixed by the first SETUP.
        expected: String,
        /// Path of the offending request.
        actual: String,
    },

    /// SETUP for a media that is already set up.
    #[error("media is already set up")]
    MediaAlreadySetup,

    /// RECORD before all announced medias were set up.
    #[error("not all announced medias have been set up")]
    MediasNotSetup,

    /// Content-Type header missing on a request that requires a body.
    #[error("Content-Type header is missing")]
    ContentTypeMissing,

    /// Body carried an unsupported Content-Type.
    #[error("unsupported Content-Type: {0}")]
    ContentTypeUnsupported(String),

    /// The SDP body could not be turned into a stream description.
    #[error("invalid SDP: {0}")]
    InvalidSdp(String),

    /// A SETUP attempted to mix transport kinds within one session.
    #[error("can't setup medias with different transport protocols")]
    DifferentTransports,

    /// None of the proposed transports is supported.
    #[error("transport not supported")]
    UnsupportedTransport,

    /// The request must be re-sent with credentials.
    #[error("authentication required")]
    AuthenticationRequired {
        /// `WWW-Authenticate` challenge values to present to the peer.
        challenges: Vec<String>,
    },

    /// Credentials were presented and rejected.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The peer answered with a non-success status.
    #[error("bad status code: {code} ({reason})")]
    BadStatus {
        /// Numeric status code.
        code: u16,
        /// Reason phrase as received.
        reason: String,
    },

    // ---- transport negotiation ----
    /// The requested UDP port pair is already assigned to another session.
    #[error("UDP port pair is already in use")]
    UdpPortPairInUse,

    /// Interleaved channel pair is invalid or already claimed.
    #[error("invalid or already used interleaved channels")]
    InvalidInterleavedIds,

    /// UDP transport was requested without client_port.
    #[error("transport does not contain client ports")]
    ClientPortsMissing,

    /// Transport header missing or unparsable.
    #[error("invalid transport header: {0}")]
    InvalidTransportHeader(String),

    // ---- timeouts ----
    /// No UDP packet received within the read timeout while recording.
    #[error("UDP timeout")]
    UdpTimeout,

    /// No keepalive request received within the session timeout.
    #[error("session timed out")]
    SessionTimeout,

    /// No response received within the read timeout.
    #[error("request timed out")]
    RequestTimeout,

    /// The requested operation has no handler.
    #[error("not implemented")]
    NotImplemented,

    /// An outbound packet carries a payload type the stream description
    /// does not declare.
    #[error("unknown payload type: {0}")]
    UnknownPayloadType(u8),

    // ---- crypto ----
    /// SRTP context creation or MIKEY exchange failure.
    #[error("key management error: {0}")]
    Crypto(String),

    // ---- local ----
    /// The session write queue is full; the packet was not enqueued.
    #[error("write queue is full")]
    WriteQueueFull,

    /// The entity (server, session, connection or client) was terminated.
    #[error("terminated")]
    Terminated,

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// RTSP status code a server sends back when this error aborts a
    /// request cycle. Errors that are not per-request (wire, timeout,
    /// local) have no mapping and close the connection instead.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::InvalidState { .. } => Some(455),
            Error::PathMismatch { .. }
            | Error::MediaAlreadySetup
            | Error::MediasNotSetup
            | Error::ContentTypeMissing
            | Error::InvalidSdp(_)
            | Error::DifferentTransports
            | Error::UdpPortPairInUse
            | Error::InvalidInterleavedIds
            | Error::ClientPortsMissing
            | Error::InvalidTransportHeader(_) => Some(400),
            Error::AuthenticationRequired { .. } | Error::InvalidCredentials => Some(401),
            Error::SessionNotFound => Some(454),
            Error::ContentTypeUnsupported(_) => Some(456),
            Error::UnsupportedTransport => Some(461),
            Error::NotImplemented => Some(501),
            _ => None,
        }
    }
}

/// Non-fatal data-plane decode problems, surfaced through the optional
/// `on_decode_error` callbacks and never terminating a session.
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
    /// An RTP packet could not be parsed.
    #[error("invalid RTP packet: {0}")]
    InvalidRtp(String),

    /// An RTCP packet could not be parsed.
    #[error("invalid RTCP packet: {0}")]
    InvalidRtcp(String),

    /// A UDP datagram exceeded the maximum payload size.
    #[error("payload of {size} bytes exceeds the maximum of {max}")]
    PacketTooBig {
        /// Received datagram size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// An RTP packet carried a payload type no set-up format declares.
    #[error("unknown payload type: {0}")]
    UnknownPayloadType(u8),

    /// An RTP packet carried an SSRC different from the one bound to the
    /// format.
    #[error("SSRC mismatch: expected {expected:08x}, got {got:08x}")]
    SsrcMismatch {
        /// SSRC the format is bound to.
        expected: u32,
        /// SSRC found in the packet.
        got: u32,
    },

    /// An interleaved frame referenced a channel no media is set up on.
    #[error("unknown interleaved channel: {0}")]
    UnknownChannel(u8),

    /// SRTP decryption failed for a packet.
    #[error("SRTP decryption failed: {0}")]
    Decrypt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::SessionNotFound.status_code(), Some(454));
        assert_eq!(Error::UnsupportedTransport.status_code(), Some(461));
        assert_eq!(Error::DifferentTransports.status_code(), Some(400));
        assert_eq!(Error::SessionTimeout.status_code(), None);
        assert_eq!(
            Error::AuthenticationRequired { challenges: vec![] }.status_code(),
            Some(401)
        );
    }
}
