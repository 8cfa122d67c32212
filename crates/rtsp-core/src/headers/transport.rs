use std::fmt::Write as _;
use std::net::IpAddr;

use crate::error::{Error, Result};

/// Transport profile: plain AVP or SRTP-protected SAVP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Avp,
    Savp,
}

/// Lower transport carrying RTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    Udp,
    Tcp,
}

/// Unicast or multicast delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Unicast,
    Multicast,
}

/// Direction requested by the SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Play,
    Record,
}

/// One entry of a Transport header.
///
/// The header value is a comma-separated list of these, in the client's
/// preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    pub profile: Profile,
    pub lower_transport: LowerTransport,
    pub delivery: Option<Delivery>,
    pub destination: Option<IpAddr>,
    pub source: Option<IpAddr>,
    /// Interleaved channel pair (TCP).
    pub interleaved: Option<(u8, u8)>,
    /// Client RTP/RTCP port pair (UDP unicast).
    pub client_port: Option<(u16, u16)>,
    /// Server RTP/RTCP port pair (UDP unicast).
    pub server_port: Option<(u16, u16)>,
    /// Multicast RTP/RTCP port pair.
    pub ports: Option<(u16, u16)>,
    pub ttl: Option<u8>,
    pub ssrc: Option<u32>,
    pub mode: Option<TransportMode>,
}

impl Default for TransportHeader {
    fn default() -> Self {
        Self {
            profile: Profile::Avp,
            lower_transport: LowerTransport::Udp,
            delivery: None,
            destination: None,
            source: None,
            interleaved: None,
            client_port: None,
            server_port: None,
            ports: None,
            ttl: None,
            ssrc: None,
            mode: None,
        }
    }
}

fn parse_port_pair(s: &str) -> Result<(u16, u16)> {
    let (lo, hi) = s
        .split_once('-')
        .ok_or_else(|| Error::InvalidTransportHeader(format!("invalid port pair '{s}'")))?;
    let lo = lo
        .parse()
        .map_err(|_| Error::InvalidTransportHeader(format!("invalid port '{lo}'")))?;
    let hi = hi
        .parse()
        .map_err(|_| Error::InvalidTransportHeader(format!("invalid port '{hi}'")))?;
    Ok((lo, hi))
}

fn parse_channel_pair(s: &str) -> Result<(u8, u8)> {
    let (lo, hi) = parse_port_pair(s)?;
    let lo = u8::try_from(lo)
        .map_err(|_| Error::InvalidTransportHeader(format!("invalid channel '{lo}'")))?;
    let hi = u8::try_from(hi)
        .map_err(|_| Error::InvalidTransportHeader(format!("invalid channel '{hi}'")))?;
    Ok((lo, hi))
}

impl TransportHeader {
    /// Parses a Transport header value into its entries, preserving the
    /// client's preference order.
    pub fn parse_list(value: &str) -> Result<Vec<TransportHeader>> {
        value
            .split(',')
            .map(|part| Self::parse(part.trim()))
            .collect()
    }

    /// Parses a single Transport entry.
    pub fn parse(value: &str) -> Result<TransportHeader> {
        let mut parts = value.split(';');
        let spec = parts
            .next()
            .ok_or_else(|| Error::InvalidTransportHeader("empty transport".into()))?
            .trim();

        let (profile, lower_transport) = match spec.to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => (Profile::Avp, LowerTransport::Udp),
            "RTP/AVP/TCP" => (Profile::Avp, LowerTransport::Tcp),
            "RTP/SAVP" | "RTP/SAVP/UDP" => (Profile::Savp, LowerTransport::Udp),
            "RTP/SAVP/TCP" => (Profile::Savp, LowerTransport::Tcp),
            other => {
                return Err(Error::InvalidTransportHeader(format!(
                    "unsupported transport specifier '{other}'"
                )))
            }
        };

        let mut th = TransportHeader {
            profile,
            lower_transport,
            ..Default::default()
        };

        for part in parts {
            let part = part.trim();
            let (key, val) = match part.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (part, None),
            };
            match (key.to_ascii_lowercase().as_str(), val) {
                ("unicast", None) => th.delivery = Some(Delivery::Unicast),
                ("multicast", None) => th.delivery = Some(Delivery::Multicast),
                ("destination", Some(v)) => {
                    th.destination = Some(v.parse().map_err(|_| {
                        Error::InvalidTransportHeader(format!("invalid destination '{v}'"))
                    })?)
                }
                ("source", Some(v)) => {
                    // Some servers send a host name here; ignore those.
                    th.source = v.parse().ok();
                }
                ("interleaved", Some(v)) => th.interleaved = Some(parse_channel_pair(v)?),
                ("client_port", Some(v)) => th.client_port = Some(parse_port_pair(v)?),
                ("server_port", Some(v)) => th.server_port = Some(parse_port_pair(v)?),
                ("port", Some(v)) => th.ports = Some(parse_port_pair(v)?),
                ("ttl", Some(v)) => {
                    th.ttl = Some(v.parse().map_err(|_| {
                        Error::InvalidTransportHeader(format!("invalid ttl '{v}'"))
                    })?)
                }
                ("ssrc", Some(v)) => {
                    th.ssrc = Some(u32::from_str_radix(v.trim_start_matches("0x"), 16).map_err(
                        |_| Error::InvalidTransportHeader(format!("invalid ssrc '{v}'")),
                    )?)
                }
                ("mode", Some(v)) => {
                    let v = v.trim_matches('"');
                    th.mode = Some(match v.to_ascii_uppercase().as_str() {
                        "PLAY" => TransportMode::Play,
                        // FFmpeg sends "receive" instead of "record".
                        "RECORD" | "RECEIVE" => TransportMode::Record,
                        other => {
                            return Err(Error::InvalidTransportHeader(format!(
                                "invalid mode '{other}'"
                            )))
                        }
                    });
                }
                // Unknown parameters are tolerated.
                _ => {}
            }
        }

        Ok(th)
    }

    /// Emits the entry in canonical parameter order.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(match (self.profile, self.lower_transport) {
            (Profile::Avp, LowerTransport::Udp) => "RTP/AVP",
            (Profile::Avp, LowerTransport::Tcp) => "RTP/AVP/TCP",
            (Profile::Savp, LowerTransport::Udp) => "RTP/SAVP",
            (Profile::Savp, LowerTransport::Tcp) => "RTP/SAVP/TCP",
        });
        match self.delivery {
            Some(Delivery::Unicast) => out.push_str(";unicast"),
            Some(Delivery::Multicast) => out.push_str(";multicast"),
            None => {}
        }
        if let Some(dest) = self.destination {
            let _ = write!(out, ";destination={dest}");
        }
        if let Some(src) = self.source {
            let _ = write!(out, ";source={src}");
        }
        if let Some((lo, hi)) = self.interleaved {
            let _ = write!(out, ";interleaved={lo}-{hi}");
        }
        if let Some((lo, hi)) = self.client_port {
            let _ = write!(out, ";client_port={lo}-{hi}");
        }
        if let Some((lo, hi)) = self.server_port {
            let _ = write!(out, ";server_port={lo}-{hi}");
        }
        if let Some((lo, hi)) = self.ports {
            let _ = write!(out, ";port={lo}-{hi}");
        }
        if let Some(ttl) = self.ttl {
            let _ = write!(out, ";ttl={ttl}");
        }
        if let Some(ssrc) = self.ssrc {
            let _ = write!(out, ";ssrc={ssrc:08X}");
        }
        match self.mode {
            Some(TransportMode::Play) => out.push_str(";mode=\"PLAY\""),
            Some(TransportMode::Record) => out.push_str(";mode=\"RECORD\""),
            None => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_interleaved() {
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        assert_eq!(th.lower_transport, LowerTransport::Tcp);
        assert_eq!(th.profile, Profile::Avp);
        assert_eq!(th.delivery, Some(Delivery::Unicast));
        assert_eq!(th.interleaved, Some((0, 1)));
        assert_eq!(th.encode(), "RTP/AVP/TCP;unicast;interleaved=0-1");
    }

    #[test]
    fn parse_udp_client_ports() {
        let th =
            TransportHeader::parse("RTP/AVP;unicast;client_port=35466-35467;mode=\"record\"")
                .unwrap();
        assert_eq!(th.lower_transport, LowerTransport::Udp);
        assert_eq!(th.client_port, Some((35466, 35467)));
        assert_eq!(th.mode, Some(TransportMode::Record));
    }

    #[test]
    fn parse_multicast() {
        let th = TransportHeader::parse(
            "RTP/AVP;multicast;destination=224.1.0.5;port=8000-8001;ttl=127",
        )
        .unwrap();
        assert_eq!(th.delivery, Some(Delivery::Multicast));
        assert_eq!(th.destination, Some("224.1.0.5".parse().unwrap()));
        assert_eq!(th.ports, Some((8000, 8001)));
        assert_eq!(th.ttl, Some(127));
        assert_eq!(
            th.encode(),
            "RTP/AVP;multicast;destination=224.1.0.5;port=8000-8001;ttl=127"
        );
    }

    #[test]
    fn parse_list_preserves_order() {
        let list = TransportHeader::parse_list(
            "RTP/AVP;unicast;client_port=1000-1001,RTP/AVP/TCP;unicast;interleaved=0-1",
        )
        .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].lower_transport, LowerTransport::Udp);
        assert_eq!(list[1].lower_transport, LowerTransport::Tcp);
    }

    #[test]
    fn ssrc_round_trip() {
        let mut th = TransportHeader::parse("RTP/AVP;unicast;client_port=9000-9001").unwrap();
        th.ssrc = Some(0xDEAD_BEEF);
        let encoded = th.encode();
        assert!(encoded.contains("ssrc=DEADBEEF"));
        let back = TransportHeader::parse(&encoded).unwrap();
        assert_eq!(back.ssrc, Some(0xDEAD_BEEF));
    }

    #[test]
    fn savp_profile() {
        let th = TransportHeader::parse("RTP/SAVP;unicast;client_port=4000-4001").unwrap();
        assert_eq!(th.profile, Profile::Savp);
        assert!(th.encode().starts_with("RTP/SAVP;"));
    }

    #[test]
    fn invalid_entries() {
        assert!(TransportHeader::parse("RTP/XXX;unicast").is_err());
        assert!(TransportHeader::parse("RTP/AVP;interleaved=0").is_err());
        assert!(TransportHeader::parse("RTP/AVP;interleaved=0-999").is_err());
    }
}
