//! RTCP report generation state.
//!
//! Wire marshalling of the reports themselves is delegated to the external
//! `rtcp` crate; this module keeps the per-format statistics (RFC 3550
//! §6.4 and §A.8) and runs the single periodic timer per format that emits
//! them.

pub mod ntp;
mod receiver;
mod sender;

pub use receiver::{ReceiverStats, RtcpReceiver, RtcpWriteFn};
pub use sender::{RtcpSender, SenderStats};

use std::time::Duration;

/// Default spacing of Receiver Reports on UDP sessions.
pub const DEFAULT_RECEIVER_REPORT_PERIOD: Duration = Duration::from_secs(10);

/// Default spacing of Sender Reports.
pub const DEFAULT_SENDER_REPORT_PERIOD: Duration = Duration::from_secs(10);
