use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{Error, Result};

/// KeyMgmt header (RFC 4567) restricted to the MIKEY protocol, the only
/// key-management protocol this engine negotiates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMgmt {
    /// Media the key applies to, absent on session-level exchange.
    pub url: Option<String>,
    /// Raw MIKEY message.
    pub mikey: Vec<u8>,
}

impl KeyMgmt {
    pub fn parse(value: &str) -> Result<KeyMgmt> {
        let mut prot_ok = false;
        let mut url = None;
        let mut data = None;
        for part in value.split(';') {
            let part = part.trim();
            match part.split_once('=') {
                Some(("prot", v)) => prot_ok = v == "mikey",
                Some(("uri", v)) => url = Some(v.trim_matches('"').to_string()),
                Some(("data", v)) => data = Some(v.trim_matches('"').to_string()),
                _ => {}
            }
        }
        if !prot_ok {
            return Err(Error::MalformedMessage(
                "KeyMgmt without prot=mikey".into(),
            ));
        }
        let data =
            data.ok_or_else(|| Error::MalformedMessage("KeyMgmt without data".into()))?;
        let mikey = BASE64
            .decode(data.as_bytes())
            .map_err(|e| Error::MalformedMessage(format!("invalid KeyMgmt data: {e}")))?;
        Ok(KeyMgmt { url, mikey })
    }

    pub fn encode(&self) -> String {
        let data = BASE64.encode(&self.mikey);
        match &self.url {
            Some(url) => format!("prot=mikey;uri=\"{url}\";data=\"{data}\""),
            None => format!("prot=mikey;data=\"{data}\""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let h = KeyMgmt {
            url: Some("rtsp://h/stream/trackID=0".into()),
            mikey: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(KeyMgmt::parse(&h.encode()).unwrap(), h);
    }

    #[test]
    fn missing_prot_rejected() {
        assert!(KeyMgmt::parse("uri=\"rtsp://h/\";data=\"AQID\"").is_err());
    }
}
