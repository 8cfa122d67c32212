use crate::error::{Error, Result};

/// Session header: opaque id plus optional timeout advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    /// Secret session id.
    pub id: String,
    /// Advertised timeout in seconds.
    pub timeout: Option<u64>,
}

impl SessionHeader {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timeout: None,
        }
    }

    pub fn parse(value: &str) -> Result<SessionHeader> {
        let mut parts = value.split(';');
        let id = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::MalformedMessage("empty Session header".into()))?;
        let mut timeout = None;
        for part in parts {
            if let Some(v) = part.trim().strip_prefix("timeout=") {
                timeout = Some(v.parse().map_err(|_| {
                    Error::MalformedMessage(format!("invalid session timeout '{v}'"))
                })?);
            }
        }
        Ok(SessionHeader {
            id: id.to_string(),
            timeout,
        })
    }

    pub fn encode(&self) -> String {
        match self.timeout {
            Some(t) => format!("{};timeout={t}", self.id),
            None => self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_timeout() {
        let h = SessionHeader::parse("Ot9CbOg1kqyI3054;timeout=60").unwrap();
        assert_eq!(h.id, "Ot9CbOg1kqyI3054");
        assert_eq!(h.timeout, Some(60));
        assert_eq!(h.encode(), "Ot9CbOg1kqyI3054;timeout=60");
    }

    #[test]
    fn bare_id() {
        let h = SessionHeader::parse("abc123").unwrap();
        assert_eq!(h.timeout, None);
        assert_eq!(h.encode(), "abc123");
    }

    #[test]
    fn empty_rejected() {
        assert!(SessionHeader::parse("").is_err());
    }
}
