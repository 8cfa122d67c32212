use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::handler::RequestContext;
use super::session::{path_and_query, RequestOutcome, ServerSession, SessionMessage};
use super::ServerInner;
use crate::error::{Error, Result};
use crate::io::conn::{Conn, ConnWriter, Message};
use crate::io::tunnel::{self, SniffOutcome};
use crate::io::Stream;
use crate::message::{Method, Request, Response, StatusCode};

/// Callback for interleaved frames on one channel.
pub(crate) type FrameCb = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Which inner read loop the connection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// Requests only; interleaved frames are discarded.
    Standard,
    /// Requests plus interleaved frames, idle-bounded by the session
    /// timeout (clients keep the session alive with requests or RTCP).
    TcpPlay,
    /// Requests plus interleaved frames with the read deadline disabled;
    /// FFmpeg publishes without ever sending keepalives.
    TcpRecord,
}

/// State of one connection shared with the session that uses it.
pub(crate) struct ConnShared {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub writer: ConnWriter<Box<dyn Stream>>,
    /// Interleaved frame routing table, populated by the session on
    /// PLAY/RECORD over TCP and cleared on PAUSE/teardown.
    pub frame_callbacks: DashMap<u8, FrameCb>,
    /// Session currently served by this connection, if any.
    pub session: Mutex<Option<Arc<ServerSession>>>,
}

/// Serves one accepted TCP connection until EOF or a fatal error.
pub(crate) async fn serve(server: Arc<ServerInner>, socket: TcpStream, conn_id: u64) {
    let remote_addr = match socket.peer_addr() {
        Ok(a) => a,
        Err(_) => return,
    };
    server.handler.on_connection_open(remote_addr).await;

    let result = run(&server, socket, conn_id, remote_addr).await;
    if let Err(e) = &result {
        debug!("connection {remote_addr} terminated: {e}");
    }

    server.handler.on_connection_close(remote_addr).await;
}

async fn run(
    server: &Arc<ServerInner>,
    socket: TcpStream,
    conn_id: u64,
    remote_addr: SocketAddr,
) -> Result<()> {
    // Tunnel sniffing happens before any RTSP parsing.
    let stream: Box<dyn Stream> = match tunnel::sniff(socket, &server.cookies).await? {
        SniffOutcome::Rtsp(stream) => stream,
        SniffOutcome::Absorbed => return Ok(()),
    };

    let mut conn = Conn::new(stream, server.config.max_packet_size);
    let shared = Arc::new(ConnShared {
        id: conn_id,
        remote_addr,
        writer: conn.writer(),
        frame_callbacks: DashMap::new(),
        session: Mutex::new(None),
    });

    let mut mode = ReadMode::Standard;
    let result = loop {
        let deadline = match mode {
            // An idle connection is dropped quickly, but once it carries a
            // session (a UDP session keeps its control connection mostly
            // silent) the keepalive cadence governs.
            ReadMode::Standard => {
                if shared.session.lock().is_some() {
                    Some(server.config.session_timeout)
                } else {
                    Some(server.config.read_timeout)
                }
            }
            ReadMode::TcpPlay => Some(server.config.session_timeout),
            ReadMode::TcpRecord => None,
        };
        let message = match deadline {
            Some(d) => match tokio::time::timeout(d, conn.read()).await {
                Ok(m) => m,
                Err(_) => break Err(Error::SessionTimeout),
            },
            None => conn.read().await,
        };
        let message = match message {
            Ok(m) => m,
            Err(e) => break Err(e),
        };

        match message {
            Message::Request(req) => match handle_request(server, &shared, req, mode).await {
                Ok(new_mode) => mode = new_mode,
                Err(e) => break Err(e),
            },
            // A response from a client is a protocol violation.
            Message::Response(_) => {
                break Err(Error::MalformedMessage(
                    "unexpected response from client".into(),
                ))
            }
            Message::Frame { channel, payload } => {
                if mode == ReadMode::Standard {
                    trace!("discarding interleaved frame in standard mode");
                    continue;
                }
                match shared.frame_callbacks.get(&channel) {
                    Some(cb) => cb(payload),
                    None => trace!("discarding frame on unknown channel {channel}"),
                }
            }
        }
    };

    // The session outlives the connection only when it does not own it.
    let session = shared.session.lock().take();
    if let Some(session) = session {
        session.notify_conn_closed(conn_id).await;
    }

    result
}

/// Routes one request: connection-level methods are answered here,
/// everything else goes through the session state machine.
async fn handle_request(
    server: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    req: Request,
    current_mode: ReadMode,
) -> Result<ReadMode> {
    let cseq = match req.cseq() {
        Ok(c) => c,
        Err(e) => {
            // A request without CSeq cannot even be answered coherently.
            let mut res = Response::new(StatusCode::BAD_REQUEST);
            res.headers.set("CSeq", "0");
            let _ = shared.writer.write_response(&res).await;
            return Err(e);
        }
    };

    if !server.handler.capabilities().allows(req.method) {
        let mut res = Response::new(StatusCode::NOT_IMPLEMENTED);
        res.headers.set("CSeq", cseq.to_string());
        shared.writer.write_response(&res).await?;
        return Ok(current_mode);
    }

    // Resolve the target session, creating one on the first SETUP or
    // ANNOUNCE of a connection.
    let session = match req.headers.get("Session") {
        Some(value) => {
            let header = crate::headers::SessionHeader::parse(value)?;
            match server.sessions.get(&header.id).map(|s| s.clone()) {
                Some(s) => Some(s),
                None => {
                    let mut res = Response::new(StatusCode::SESSION_NOT_FOUND);
                    res.headers.set("CSeq", cseq.to_string());
                    shared.writer.write_response(&res).await?;
                    return Ok(current_mode);
                }
            }
        }
        None => match req.method {
            Method::Setup | Method::Announce => {
                Some(ServerSession::spawn(server.clone()).await?)
            }
            _ => None,
        },
    };

    let Some(session) = session else {
        // Connection-level request.
        let res = handle_sessionless(server, shared, &req, cseq).await;
        shared.writer.write_response(&res).await?;
        return Ok(current_mode);
    };

    *shared.session.lock() = Some(session.clone());

    let (reply_tx, reply_rx) = oneshot::channel();
    let sent = session
        .send_message(SessionMessage::Request {
            req,
            conn: shared.clone(),
            reply: reply_tx,
        })
        .await;
    if sent.is_err() {
        // Session terminated between lookup and dispatch.
        let mut res = Response::new(StatusCode::SESSION_NOT_FOUND);
        res.headers.set("CSeq", cseq.to_string());
        shared.writer.write_response(&res).await?;
        shared.session.lock().take();
        return Ok(ReadMode::Standard);
    }
    let outcome: RequestOutcome = reply_rx.await.map_err(|_| Error::Terminated)?;

    let mut response = outcome.response;
    response.headers.set("CSeq", cseq.to_string());
    shared.writer.write_response(&response).await?;

    // Ordering guarantee: packets enqueued from within PLAY/RECORD
    // handlers start flowing only after the response is on the wire.
    if outcome.start_writer {
        session.start_writer();
    }
    if outcome.detach_session {
        shared.frame_callbacks.clear();
        shared.session.lock().take();
        return Ok(ReadMode::Standard);
    }
    Ok(outcome.read_mode)
}

async fn handle_sessionless(
    server: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    req: &Request,
    cseq: u32,
) -> Response {
    let mut res = match req.method {
        Method::Options => {
            let mut res = Response::new(StatusCode::OK);
            let methods: Vec<&str> = server
                .handler
                .capabilities()
                .implemented_methods()
                .iter()
                .map(Method::as_str)
                .collect();
            res.headers.set("Public", methods.join(", "));
            res
        }
        Method::Describe => describe(server, shared, req).await,
        Method::GetParameter => Response::new(StatusCode::OK),
        _ => {
            // Session-scoped method without a Session header; SETUP and
            // ANNOUNCE never reach this point.
            Response::new(StatusCode::SESSION_NOT_FOUND)
        }
    };
    res.headers.set("CSeq", cseq.to_string());
    res
}

pub(crate) async fn describe(
    server: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    req: &Request,
) -> Response {
    let (path, query) = path_and_query(&req.url);
    let ctx = RequestContext {
        remote_addr: shared.remote_addr,
        path: path.clone(),
        query: query.clone(),
        url: req.url.clone(),
        request: req.clone(),
        session: None,
    };
    match server.handler.on_describe(&ctx).await {
        Ok(Some(stream)) => {
            let multicast = server.config.multicast.is_some()
                && query.as_deref().map(|q| q.contains("vlcmulticast")).unwrap_or(false);
            match stream.description_body(multicast) {
                Ok(body) => {
                    let mut res = Response::new(StatusCode::OK);
                    res.headers.set("Content-Type", "application/sdp");
                    let mut base_url = req.url.clone();
                    base_url.set_query(None);
                    let mut base = base_url.as_str().trim_end_matches('/').to_string();
                    base.push('/');
                    res.headers.set("Content-Base", base);
                    res.body = Bytes::from(body.into_bytes());
                    res
                }
                Err(e) => {
                    warn!("DESCRIBE failed to build SDP: {e}");
                    Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        Ok(None) => Response::new(StatusCode::NOT_FOUND),
        Err(e) => super::session::response_for_error(&e),
    }
}
