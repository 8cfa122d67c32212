use bytes::Bytes;

use super::{HeaderMap, StatusCode, RTSP_VERSION};
use crate::error::{Error, Result};

/// An RTSP response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code.
    pub status: StatusCode,
    /// Reason phrase; canonical phrase of `status` when built locally.
    pub reason: String,
    /// Header map.
    pub headers: HeaderMap,
    /// Body; empty unless Content-Length was present.
    pub body: Bytes,
}

impl Response {
    /// Builds a response with the canonical reason phrase, empty headers
    /// and body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: status.reason().to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Assembles a response from a parsed status line plus headers and body.
    pub(crate) fn from_parts(start_line: &str, headers: HeaderMap, body: Bytes) -> Result<Self> {
        let rest = start_line
            .strip_prefix(RTSP_VERSION)
            .and_then(|r| r.strip_prefix(' '))
            .ok_or_else(|| {
                Error::MalformedMessage(format!("invalid status line '{start_line}'"))
            })?;
        let (code_str, reason) = match rest.split_once(' ') {
            Some((c, r)) => (c, r),
            None => (rest, ""),
        };
        if code_str.len() != 3 {
            return Err(Error::MalformedMessage(format!(
                "invalid status code '{code_str}'"
            )));
        }
        let code: u16 = code_str
            .parse()
            .map_err(|_| Error::MalformedMessage(format!("invalid status code '{code_str}'")))?;
        Ok(Self {
            status: StatusCode(code),
            reason: reason.to_string(),
            headers,
            body,
        })
    }

    /// Serialises the response deterministically.
    pub fn encode(&self) -> Vec<u8> {
        let mut headers = self.headers.clone();
        if !self.body.is_empty() {
            headers.set("Content-Length", self.body.len().to_string());
        }
        let mut head = String::new();
        head.push_str(RTSP_VERSION);
        head.push(' ');
        head.push_str(&self.status.to_string());
        head.push(' ');
        head.push_str(&self.reason);
        head.push_str("\r\n");
        headers.encode(&mut head);
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_and_reparse() {
        let mut res = Response::new(StatusCode::OK);
        res.headers.add("CSeq", "1");
        res.headers.add("Public", "DESCRIBE, SETUP, PLAY, TEARDOWN");
        let wire = res.encode();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("RTSP/1.0 200 OK\r\n"));

        let reparsed =
            Response::from_parts("RTSP/1.0 200 OK", HeaderMap::new(), Bytes::new()).unwrap();
        assert_eq!(reparsed.status, StatusCode::OK);
        assert_eq!(reparsed.reason, "OK");
    }

    #[test]
    fn unknown_code_survives() {
        let res =
            Response::from_parts("RTSP/1.0 488 Not Acceptable Here", HeaderMap::new(), Bytes::new())
                .unwrap();
        assert_eq!(res.status.code(), 488);
        assert_eq!(res.reason, "Not Acceptable Here");
    }

    #[test]
    fn invalid_status_line() {
        assert!(Response::from_parts("HTTP/1.0 200 OK", HeaderMap::new(), Bytes::new()).is_err());
        assert!(Response::from_parts("RTSP/1.0 20 OK", HeaderMap::new(), Bytes::new()).is_err());
    }
}
