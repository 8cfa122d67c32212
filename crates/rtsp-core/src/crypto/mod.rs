//! SRTP key management: the per-direction encryption context and the
//! minimal MIKEY codec used to transport master keys in `KeyMgmt` headers
//! and `a=key-mgmt` SDP attributes.
//!
//! Per-packet transforms and key derivation are delegated to the external
//! `webrtc-srtp` crate.

mod mikey;
mod srtp_ctx;

pub use mikey::MikeyMessage;
pub use srtp_ctx::{SrtpContext, SrtpKeyingMaterial, SRTCP_OVERHEAD, SRTP_OVERHEAD};
