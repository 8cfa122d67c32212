use std::fmt::Write as _;

use crate::error::{Error, Result};

/// Authentication scheme carried by WWW-Authenticate / Authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

/// Splits `key="value", key2=value2` parameter lists, honoring quotes.
fn parse_params(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let Some((key, tail)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let tail = tail.trim_start();
        let (value, next) = if let Some(stripped) = tail.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => (&stripped[..end], &stripped[end + 1..]),
                None => (stripped, ""),
            }
        } else {
            match tail.find(',') {
                Some(end) => (&tail[..end], &tail[end..]),
                None => (tail, ""),
            }
        };
        out.push((key, value.trim().to_string()));
        rest = next.trim_start().trim_start_matches(',').trim_start();
    }
    out
}

/// A WWW-Authenticate challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: AuthScheme,
    pub realm: Option<String>,
    pub nonce: Option<String>,
}

impl Challenge {
    pub fn parse(value: &str) -> Result<Challenge> {
        let (scheme, rest) = match value.split_once(' ') {
            Some((s, r)) => (s, r),
            None => (value, ""),
        };
        let scheme = match scheme {
            "Basic" => AuthScheme::Basic,
            "Digest" => AuthScheme::Digest,
            other => {
                return Err(Error::MalformedMessage(format!(
                    "unsupported authentication scheme '{other}'"
                )))
            }
        };
        let mut realm = None;
        let mut nonce = None;
        for (k, v) in parse_params(rest) {
            match k.as_str() {
                "realm" => realm = Some(v),
                "nonce" => nonce = Some(v),
                _ => {}
            }
        }
        if scheme == AuthScheme::Digest && nonce.is_none() {
            return Err(Error::MalformedMessage(
                "Digest challenge without nonce".into(),
            ));
        }
        Ok(Challenge {
            scheme,
            realm,
            nonce,
        })
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        match self.scheme {
            AuthScheme::Basic => {
                out.push_str("Basic");
                if let Some(realm) = &self.realm {
                    let _ = write!(out, " realm=\"{realm}\"");
                }
            }
            AuthScheme::Digest => {
                out.push_str("Digest");
                let mut first = true;
                if let Some(realm) = &self.realm {
                    let _ = write!(out, " realm=\"{realm}\"");
                    first = false;
                }
                if let Some(nonce) = &self.nonce {
                    let _ = write!(out, "{}nonce=\"{nonce}\"", if first { " " } else { ", " });
                }
            }
        }
        out
    }
}

/// An Authorization header sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// `Basic <base64(user:pass)>`.
    Basic {
        payload: String,
    },
    /// RFC 2069-style MD5 digest.
    Digest {
        username: String,
        realm: String,
        nonce: String,
        uri: String,
        response: String,
    },
}

impl Authorization {
    pub fn parse(value: &str) -> Result<Authorization> {
        let (scheme, rest) = value
            .split_once(' ')
            .ok_or_else(|| Error::MalformedMessage("invalid Authorization header".into()))?;
        match scheme {
            "Basic" => Ok(Authorization::Basic {
                payload: rest.trim().to_string(),
            }),
            "Digest" => {
                let mut username = None;
                let mut realm = None;
                let mut nonce = None;
                let mut uri = None;
                let mut response = None;
                for (k, v) in parse_params(rest) {
                    match k.as_str() {
                        "username" => username = Some(v),
                        "realm" => realm = Some(v),
                        "nonce" => nonce = Some(v),
                        "uri" => uri = Some(v),
                        "response" => response = Some(v),
                        _ => {}
                    }
                }
                let missing =
                    || Error::MalformedMessage("incomplete Digest authorization".into());
                Ok(Authorization::Digest {
                    username: username.ok_or_else(missing)?,
                    realm: realm.ok_or_else(missing)?,
                    nonce: nonce.ok_or_else(missing)?,
                    uri: uri.ok_or_else(missing)?,
                    response: response.ok_or_else(missing)?,
                })
            }
            other => Err(Error::MalformedMessage(format!(
                "unsupported authentication scheme '{other}'"
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Authorization::Basic { payload } => format!("Basic {payload}"),
            Authorization::Digest {
                username,
                realm,
                nonce,
                uri,
                response,
            } => format!(
                "Digest username=\"{username}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\""
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_challenge() {
        let c = Challenge::parse("Digest realm=\"r\", nonce=\"n\"").unwrap();
        assert_eq!(c.scheme, AuthScheme::Digest);
        assert_eq!(c.realm.as_deref(), Some("r"));
        assert_eq!(c.nonce.as_deref(), Some("n"));
        assert_eq!(c.encode(), "Digest realm=\"r\", nonce=\"n\"");
    }

    #[test]
    fn basic_challenge() {
        let c = Challenge::parse("Basic realm=\"cam\"").unwrap();
        assert_eq!(c.scheme, AuthScheme::Basic);
        assert_eq!(c.nonce, None);
    }

    #[test]
    fn digest_without_nonce_rejected() {
        assert!(Challenge::parse("Digest realm=\"r\"").is_err());
    }

    #[test]
    fn authorization_round_trip() {
        let a = Authorization::Digest {
            username: "myuser".into(),
            realm: "r".into(),
            nonce: "n".into(),
            uri: "rtsp://h/stream".into(),
            response: "abcdef".into(),
        };
        assert_eq!(Authorization::parse(&a.encode()).unwrap(), a);
    }

    #[test]
    fn unquoted_params_tolerated() {
        let c = Challenge::parse("Digest realm=r, nonce=n").unwrap();
        assert_eq!(c.realm.as_deref(), Some("r"));
        assert_eq!(c.nonce.as_deref(), Some("n"));
    }
}
