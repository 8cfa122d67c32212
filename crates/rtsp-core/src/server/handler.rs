use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use super::session::ServerSession;
use super::stream::ServerStream;
use crate::description::Description;
use crate::error::{Error, Result};
use crate::message::{Method, Request};

/// Which optional operations a handler implements.
///
/// Drives the `Public` header of OPTIONS responses; requests for methods
/// outside this set are answered 501 without reaching the handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub describe: bool,
    pub announce: bool,
    pub play: bool,
    pub record: bool,
    pub pause: bool,
    pub get_parameter: bool,
    pub set_parameter: bool,
}

impl ServerCapabilities {
    /// Everything a read-only live server exposes.
    pub fn play_only() -> Self {
        Self {
            describe: true,
            play: true,
            ..Self::default()
        }
    }

    /// Everything a publish-only server exposes.
    pub fn record_only() -> Self {
        Self {
            announce: true,
            record: true,
            ..Self::default()
        }
    }

    /// Methods for the `Public` header, in canonical order.
    pub fn implemented_methods(&self) -> Vec<Method> {
        let mut out = Vec::new();
        if self.describe {
            out.push(Method::Describe);
        }
        if self.announce {
            out.push(Method::Announce);
        }
        if self.play || self.record {
            out.push(Method::Setup);
        }
        if self.play {
            out.push(Method::Play);
        }
        if self.record {
            out.push(Method::Record);
        }
        if self.pause {
            out.push(Method::Pause);
        }
        out.push(Method::Teardown);
        if self.get_parameter {
            out.push(Method::GetParameter);
        }
        if self.set_parameter {
            out.push(Method::SetParameter);
        }
        out
    }

    pub(crate) fn allows(&self, method: Method) -> bool {
        match method {
            Method::Options | Method::Teardown | Method::GetParameter => true,
            Method::Describe => self.describe,
            Method::Announce => self.announce,
            Method::Setup => self.play || self.record,
            Method::Play => self.play,
            Method::Record => self.record,
            Method::Pause => self.pause,
            Method::SetParameter => self.set_parameter,
            Method::Redirect | Method::PlayNotify => false,
        }
    }
}

/// Everything a handler needs to know about one request.
pub struct RequestContext {
    /// Peer address of the connection carrying the request.
    pub remote_addr: SocketAddr,
    /// Stream path the request refers to (control suffix removed).
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// Full request URL.
    pub url: Url,
    /// The raw request, for headers the typed surface does not cover.
    pub request: Request,
    /// The session the request belongs to; absent for connection-level
    /// requests (OPTIONS and DESCRIBE without a Session header).
    pub session: Option<Arc<ServerSession>>,
}

/// Application-supplied server behaviour.
///
/// Every method has a default so handlers implement only what they serve;
/// [`Self::capabilities`] declares which ones are real.
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// Operations this handler implements.
    fn capabilities(&self) -> ServerCapabilities;

    /// A TCP connection was accepted.
    async fn on_connection_open(&self, _remote_addr: SocketAddr) {}

    /// A TCP connection went away.
    async fn on_connection_close(&self, _remote_addr: SocketAddr) {}

    /// A session was created.
    async fn on_session_open(&self, _session: Arc<ServerSession>) {}

    /// A session terminated; `err` carries the cause unless it was an
    /// orderly TEARDOWN.
    async fn on_session_close(&self, _session: Arc<ServerSession>, _err: Option<&Error>) {}

    /// DESCRIBE: return the stream published at `ctx.path`, or `None` for
    /// 404.
    async fn on_describe(&self, _ctx: &RequestContext) -> Result<Option<Arc<ServerStream>>> {
        Err(Error::NotImplemented)
    }

    /// ANNOUNCE: a client wants to publish `desc` at `ctx.path`.
    async fn on_announce(&self, _ctx: &RequestContext, _desc: &Description) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// SETUP in play direction: return the stream to read, or `None` for
    /// 404. Record-direction SETUPs do not call this.
    async fn on_setup(&self, _ctx: &RequestContext) -> Result<Option<Arc<ServerStream>>> {
        Err(Error::NotImplemented)
    }

    /// PLAY is about to start.
    async fn on_play(&self, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }

    /// RECORD is about to start.
    async fn on_record(&self, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }

    /// PAUSE was requested.
    async fn on_pause(&self, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }

    /// GET_PARAMETER; `None` means the default empty 200 keepalive reply.
    async fn on_get_parameter(&self, _ctx: &RequestContext) -> Result<Option<Bytes>> {
        Ok(None)
    }

    /// SET_PARAMETER.
    async fn on_set_parameter(&self, _ctx: &RequestContext) -> Result<()> {
        Err(Error::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_header_of_play_server() {
        let caps = ServerCapabilities::play_only();
        let methods: Vec<&str> = caps
            .implemented_methods()
            .iter()
            .map(Method::as_str)
            .collect();
        assert_eq!(methods, vec!["DESCRIBE", "SETUP", "PLAY", "TEARDOWN"]);
    }

    #[test]
    fn public_header_of_record_server() {
        let caps = ServerCapabilities::record_only();
        let methods: Vec<&str> = caps
            .implemented_methods()
            .iter()
            .map(Method::as_str)
            .collect();
        assert_eq!(methods, vec!["ANNOUNCE", "SETUP", "RECORD", "TEARDOWN"]);
    }

    #[test]
    fn allows_matches_capabilities() {
        let caps = ServerCapabilities::play_only();
        assert!(caps.allows(Method::Options));
        assert!(caps.allows(Method::Describe));
        assert!(caps.allows(Method::Play));
        assert!(!caps.allows(Method::Record));
        assert!(!caps.allows(Method::Announce));
        assert!(caps.allows(Method::Teardown));
    }
}
