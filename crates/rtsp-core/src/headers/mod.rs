//! Typed RTSP headers.
//!
//! Each type parses from and emits to the string value of the
//! corresponding header. Parsing is lenient about whitespace and case where
//! deployed tooling is known to vary; emission is canonical.

mod authenticate;
mod key_mgmt;
mod range;
mod rtp_info;
mod session;
mod transport;

pub use authenticate::{AuthScheme, Authorization, Challenge};
pub use key_mgmt::KeyMgmt;
pub use range::Range;
pub use rtp_info::{RtpInfo, RtpInfoEntry};
pub use session::SessionHeader;
pub use transport::{
    Delivery, LowerTransport, Profile, TransportHeader, TransportMode,
};
