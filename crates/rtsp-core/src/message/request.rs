use bytes::Bytes;
use url::Url;

use super::{HeaderMap, Method, RTSP_VERSION};
use crate::error::{Error, Result};

/// An RTSP request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Absolute request URL.
    pub url: Url,
    /// Header map.
    pub headers: HeaderMap,
    /// Body; empty unless Content-Length was present.
    pub body: Bytes,
}

/// Checks the scheme of a request URL.
pub(crate) fn check_url(url: &Url) -> Result<()> {
    match url.scheme() {
        "rtsp" | "rtsps" => Ok(()),
        other => Err(Error::UnsupportedScheme(other.to_string())),
    }
}

impl Request {
    /// Builds a request with empty headers and body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Assembles a request from a parsed start line plus headers and body.
    pub(crate) fn from_parts(start_line: &str, headers: HeaderMap, body: Bytes) -> Result<Self> {
        let mut parts = start_line.split(' ');
        let method: Method = parts
            .next()
            .ok_or_else(|| Error::MalformedMessage("empty request line".into()))?
            .parse()?;
        let raw_url = parts
            .next()
            .ok_or_else(|| Error::MalformedMessage("request line without URL".into()))?;
        let version = parts
            .next()
            .ok_or_else(|| Error::MalformedMessage("request line without version".into()))?;
        if version != RTSP_VERSION || parts.next().is_some() {
            return Err(Error::MalformedMessage(format!(
                "invalid request line '{start_line}'"
            )));
        }
        let url = Url::parse(raw_url)
            .map_err(|e| Error::MalformedMessage(format!("invalid URL '{raw_url}': {e}")))?;
        check_url(&url)?;
        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }

    /// Serialises the request deterministically.
    pub fn encode(&self) -> Vec<u8> {
        let mut headers = self.headers.clone();
        if !self.body.is_empty() {
            headers.set("Content-Length", self.body.len().to_string());
        }
        let mut head = String::new();
        head.push_str(self.method.as_str());
        head.push(' ');
        head.push_str(self.url.as_str());
        head.push(' ');
        head.push_str(RTSP_VERSION);
        head.push_str("\r\n");
        headers.encode(&mut head);
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    /// CSeq header value, mandatory on every request.
    pub fn cseq(&self) -> Result<u32> {
        self.headers
            .get("CSeq")
            .and_then(|v| v.trim().parse().ok())
            .ok_or(Error::InvalidCseq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_and_reparse() {
        let mut req = Request::new(
            Method::Setup,
            Url::parse("rtsp://example.com/stream/trackID=0").unwrap(),
        );
        req.headers.add("CSeq", "3");
        req.headers.add("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1");
        let wire = req.encode();
        let text = std::str::from_utf8(&wire).unwrap();
        let mut lines = text.split("\r\n");
        let start = lines.next().unwrap();
        assert_eq!(start, "SETUP rtsp://example.com/stream/trackID=0 RTSP/1.0");

        let mut headers = HeaderMap::new();
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(": ").unwrap();
            headers.add(name, value);
        }
        let reparsed = Request::from_parts(start, headers, Bytes::new()).unwrap();
        assert_eq!(reparsed.method, Method::Setup);
        assert_eq!(reparsed.url, req.url);
        assert_eq!(reparsed.cseq().unwrap(), 3);
        assert_eq!(
            reparsed.headers.get("transport"),
            Some("RTP/AVP/TCP;unicast;interleaved=0-1")
        );
    }

    #[test]
    fn rejects_non_rtsp_scheme() {
        let res = Request::from_parts(
            "DESCRIBE http://example.com/ RTSP/1.0",
            HeaderMap::new(),
            Bytes::new(),
        );
        assert!(matches!(res, Err(Error::UnsupportedScheme(_))));
    }

    #[test]
    fn missing_cseq() {
        let req = Request::new(Method::Options, Url::parse("rtsp://h/").unwrap());
        assert!(matches!(req.cseq(), Err(Error::InvalidCseq)));
    }
}
