use std::fmt::Write as _;

use crate::error::{Error, Result};

/// One per-media entry of an RTP-Info header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpInfoEntry {
    /// Absolute control URL of the media.
    pub url: String,
    /// Sequence number of the next RTP packet, absent for silent medias.
    pub seq: Option<u16>,
    /// RTP timestamp corresponding to the playback start, absent for
    /// silent medias.
    pub rtptime: Option<u32>,
}

/// RTP-Info header: one entry per set-up media (RFC 2326 §12.33).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpInfo(pub Vec<RtpInfoEntry>);

impl RtpInfo {
    pub fn parse(value: &str) -> Result<RtpInfo> {
        let mut entries = Vec::new();
        for part in value.split(',') {
            let mut url = None;
            let mut seq = None;
            let mut rtptime = None;
            for kv in part.trim().split(';') {
                match kv.split_once('=') {
                    Some(("url", v)) => url = Some(v.to_string()),
                    Some(("seq", v)) => {
                        seq = Some(v.parse().map_err(|_| {
                            Error::MalformedMessage(format!("invalid RTP-Info seq '{v}'"))
                        })?)
                    }
                    Some(("rtptime", v)) => {
                        rtptime = Some(v.parse().map_err(|_| {
                            Error::MalformedMessage(format!("invalid RTP-Info rtptime '{v}'"))
                        })?)
                    }
                    _ => {}
                }
            }
            entries.push(RtpInfoEntry {
                url: url.ok_or_else(|| {
                    Error::MalformedMessage("RTP-Info entry without url".into())
                })?,
                seq,
                rtptime,
            });
        }
        Ok(RtpInfo(entries))
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "url={}", e.url);
            if let Some(seq) = e.seq {
                let _ = write!(out, ";seq={seq}");
            }
            if let Some(ts) = e.rtptime {
                let _ = write!(out, ";rtptime={ts}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let info = RtpInfo(vec![
            RtpInfoEntry {
                url: "rtsp://h/stream/trackID=0".into(),
                seq: Some(557),
                rtptime: Some(984512368),
            },
            RtpInfoEntry {
                url: "rtsp://h/stream/trackID=1".into(),
                seq: None,
                rtptime: None,
            },
        ]);
        let s = info.encode();
        assert_eq!(
            s,
            "url=rtsp://h/stream/trackID=0;seq=557;rtptime=984512368, url=rtsp://h/stream/trackID=1"
        );
        assert_eq!(RtpInfo::parse(&s).unwrap(), info);
    }

    #[test]
    fn entry_without_url_rejected() {
        assert!(RtpInfo::parse("seq=1;rtptime=2").is_err());
    }
}
