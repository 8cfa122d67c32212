//! RTSP message types: methods, status codes, headers, requests and
//! responses, together with their deterministic wire encoding.
//!
//! The byte-stream framing (reading messages and interleaved frames off a
//! socket) lives in [`crate::io::conn`]; this module only deals with the
//! messages themselves.

mod header_map;
mod method;
mod request;
mod response;
mod status;

pub use header_map::HeaderMap;
pub use method::Method;
pub use request::Request;
pub use response::Response;
pub use status::StatusCode;

/// RTSP protocol identifier used in start lines.
pub const RTSP_VERSION: &str = "RTSP/1.0";

/// Maximum number of headers accepted in one message.
pub const MAX_HEADER_COUNT: usize = 255;

/// Maximum byte length of a header name.
pub const MAX_HEADER_NAME_LEN: usize = 1024;

/// Maximum byte length of a header value.
pub const MAX_HEADER_VALUE_LEN: usize = 1024;
