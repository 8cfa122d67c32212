use std::fmt;

use rtp::packet::Packet;

use crate::error::{Error, Result};

/// A payload format inside a media.
///
/// Codec-specific behaviour (depacketisation, parameter parsing) lives
/// outside this crate; the session engine only needs the RTP-level
/// properties below.
pub trait Format: Send + Sync {
    /// Dynamic or static payload type, in `[0, 127]`.
    fn payload_type(&self) -> u8;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// Codec name as it appears in `rtpmap` (e.g. `H264`).
    fn codec_name(&self) -> &str;

    /// Channel count for audio formats, when it appears in `rtpmap`.
    fn channels(&self) -> Option<u32> {
        None
    }

    /// `fmtp` parameter string, if any.
    fn fmtp(&self) -> Option<&str> {
        None
    }

    /// Whether the presentation timestamp of this packet equals its decode
    /// timestamp. B-frame-bearing video formats override this; everything
    /// else is monotone.
    fn pts_equals_dts(&self, _pkt: &Packet) -> bool {
        true
    }
}

impl fmt::Debug for dyn Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Format(pt={}, {}/{})",
            self.payload_type(),
            self.codec_name(),
            self.clock_rate()
        )
    }
}

/// Catch-all format built from SDP `rtpmap`/`fmtp` attributes, used for
/// codecs this crate has no dedicated knowledge of.
#[derive(Debug, Clone)]
pub struct GenericFormat {
    pub payload_type: u8,
    pub clock_rate: u32,
    pub codec_name: String,
    pub channels: Option<u32>,
    pub fmtp: Option<String>,
}

/// Clock rates of the static payload types of RFC 3551 §6 that live
/// tooling still emits without an rtpmap.
fn static_clock_rate(pt: u8) -> Option<(u32, &'static str)> {
    match pt {
        0 => Some((8000, "PCMU")),
        8 => Some((8000, "PCMA")),
        9 => Some((8000, "G722")),
        14 => Some((90000, "MPA")),
        26 => Some((90000, "JPEG")),
        32 => Some((90000, "MPV")),
        33 => Some((90000, "MP2T")),
        34 => Some((90000, "H263")),
        _ => None,
    }
}

impl GenericFormat {
    /// Builds a format from a payload type and its optional `rtpmap` /
    /// `fmtp` attribute payloads (without the leading payload type).
    pub fn from_sdp(payload_type: u8, rtpmap: Option<&str>, fmtp: Option<&str>) -> Result<Self> {
        if payload_type > 127 {
            return Err(Error::InvalidSdp(format!(
                "payload type {payload_type} out of range"
            )));
        }
        let (codec_name, clock_rate, channels) = match rtpmap {
            Some(map) => {
                // e.g. "H264/90000" or "mpeg4-generic/44100/2"
                let mut it = map.trim().split('/');
                let name = it
                    .next()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| Error::InvalidSdp(format!("invalid rtpmap '{map}'")))?;
                let clock = it
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::InvalidSdp(format!("invalid rtpmap '{map}'")))?;
                let channels = it.next().and_then(|s| s.parse().ok());
                (name.to_string(), clock, channels)
            }
            None => {
                let (clock, name) = static_clock_rate(payload_type).ok_or_else(|| {
                    Error::InvalidSdp(format!(
                        "payload type {payload_type} has no rtpmap and no static clock rate"
                    ))
                })?;
                (name.to_string(), clock, None)
            }
        };
        Ok(Self {
            payload_type,
            clock_rate,
            codec_name,
            channels,
            fmtp: fmtp.map(str::to_string),
        })
    }
}

impl Format for GenericFormat {
    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    fn codec_name(&self) -> &str {
        &self.codec_name
    }

    fn channels(&self) -> Option<u32> {
        self.channels
    }

    fn fmtp(&self) -> Option<&str> {
        self.fmtp.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rtpmap() {
        let f = GenericFormat::from_sdp(96, Some("H264/90000"), Some("packetization-mode=1"))
            .unwrap();
        assert_eq!(f.payload_type(), 96);
        assert_eq!(f.clock_rate(), 90000);
        assert_eq!(f.codec_name(), "H264");
        assert_eq!(f.fmtp(), Some("packetization-mode=1"));
    }

    #[test]
    fn audio_channels() {
        let f = GenericFormat::from_sdp(97, Some("mpeg4-generic/44100/2"), None).unwrap();
        assert_eq!(f.clock_rate(), 44100);
        assert_eq!(f.channels(), Some(2));
    }

    #[test]
    fn static_payload_type() {
        let f = GenericFormat::from_sdp(0, None, None).unwrap();
        assert_eq!(f.codec_name(), "PCMU");
        assert_eq!(f.clock_rate(), 8000);
    }

    #[test]
    fn invalid() {
        assert!(GenericFormat::from_sdp(128, Some("X/1"), None).is_err());
        assert!(GenericFormat::from_sdp(96, Some("H264"), None).is_err());
        assert!(GenericFormat::from_sdp(96, None, None).is_err());
    }
}
