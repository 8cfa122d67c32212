//! Per-client server session: the protocol state machine that owns the
//! setupped medias, their timers and the read/write coordination.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use rtp::packet::Packet;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use url::Url;
use util::marshal::{Marshal, Unmarshal};

use super::connection::{ConnShared, ReadMode};
use super::handler::RequestContext;
use super::stream::{ReaderSink, ServerStream};
use super::ServerInner;
use crate::crypto::{MikeyMessage, SrtpContext};
use crate::description::{Description, Format, Media};
use crate::error::{DecodeError, Error, Result};
use crate::headers::{
    Delivery, KeyMgmt, LowerTransport, Profile, RtpInfo, RtpInfoEntry, SessionHeader,
    TransportHeader, TransportMode,
};
use crate::io::conn::ConnWriter;
use crate::io::write_queue::WriteQueue;
use crate::io::Stream;
use crate::message::{Method, Request, Response, StatusCode};

/// Callback for received RTP packets of one format.
pub type RtpPacketCb = Arc<dyn Fn(Packet) + Send + Sync>;

/// Callback for received RTCP packets of one media.
pub type RtcpPacketCb = Arc<dyn Fn(Box<dyn rtcp::packet::Packet + Send + Sync>) + Send + Sync>;

/// Callback for non-fatal decode problems.
pub type DecodeErrorCb = Arc<dyn Fn(&DecodeError) + Send + Sync>;

/// Callback for reported packet losses.
pub type PacketsLostCb = Arc<dyn Fn(u64) + Send + Sync>;

/// Finite session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Initial,
    PrePlay,
    PreRecord,
    Play,
    Record,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Initial => "initial",
            SessionState::PrePlay => "prePlay",
            SessionState::PreRecord => "preRecord",
            SessionState::Play => "play",
            SessionState::Record => "record",
        }
    }
}

/// Transport negotiated for one media.
pub(crate) enum MediaTransport {
    Tcp {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
    Udp {
        client_rtp: SocketAddr,
        client_rtcp: SocketAddr,
    },
    Multicast {
        handler: crate::io::multicast::MulticastHandler,
    },
}

impl MediaTransport {
    fn kind(&self) -> &'static str {
        match self {
            MediaTransport::Tcp { .. } => "tcp",
            MediaTransport::Udp { .. } => "udp",
            MediaTransport::Multicast { .. } => "multicast",
        }
    }
}

pub(crate) struct FormatState {
    pub format: Arc<dyn Format>,
    pub reorderer: Mutex<crate::reorder::Reorderer>,
    pub rtcp_receiver: Mutex<Option<crate::rtcp::RtcpReceiver>>,
    pub on_packet_rtp: Mutex<Option<RtpPacketCb>>,
}

pub(crate) struct SetuppedMedia {
    pub media_idx: usize,
    pub media: Media,
    pub transport: MediaTransport,
    pub srtp_in: Option<Arc<SrtpContext>>,
    pub srtp_out: Option<Arc<SrtpContext>>,
    pub formats: HashMap<u8, Arc<FormatState>>,
    pub on_packet_rtcp: Mutex<Option<RtcpPacketCb>>,
}

/// Messages accepted by the session task.
pub(crate) enum SessionMessage {
    Request {
        req: Request,
        conn: Arc<ConnShared>,
        reply: oneshot::Sender<RequestOutcome>,
    },
    ConnClosed {
        conn_id: u64,
    },
    Close {
        err: Option<Error>,
    },
}

/// What the connection does with a handled request.
pub(crate) struct RequestOutcome {
    pub response: Response,
    pub read_mode: ReadMode,
    /// Start the write queue once the response is on the wire.
    pub start_writer: bool,
    /// Detach the session from the connection (TEARDOWN).
    pub detach_session: bool,
}

pub(crate) struct SessionInner {
    id: String,
    server: Weak<ServerInner>,
    tx: mpsc::Sender<SessionMessage>,
    handle: Mutex<Weak<ServerSession>>,
    medias: Mutex<Vec<Arc<SetuppedMedia>>>,
    writer: RwLock<Option<Arc<WriteQueue>>>,
    conn_writer: Mutex<Option<ConnWriter<Box<dyn Stream>>>>,
    announced: Mutex<Option<Description>>,
    on_decode_error: Mutex<Option<DecodeErrorCb>>,
    on_packets_lost: Mutex<Option<PacketsLostCb>>,
    epoch: Instant,
    last_udp_ms: AtomicU64,
}

/// A server-side session, handed to the application through
/// [`RequestContext::session`].
pub struct ServerSession {
    pub(crate) inner: Arc<SessionInner>,
}

/// Splits a request URL into its path (without leading slash) and query.
pub(crate) fn path_and_query(url: &Url) -> (String, Option<String>) {
    (
        url.path().trim_start_matches('/').trim_end_matches('/').to_string(),
        url.query().map(str::to_string),
    )
}

/// Strips the control segment from a SETUP path, yielding the stream path.
fn parent_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => path.to_string(),
    }
}

/// Builds the error response for a per-request protocol violation.
pub(crate) fn response_for_error(err: &Error) -> Response {
    let status = StatusCode(err.status_code().unwrap_or(500));
    let mut res = Response::new(status);
    if let Error::AuthenticationRequired { challenges } = err {
        for c in challenges {
            res.headers.add("WWW-Authenticate", c.clone());
        }
    }
    res
}

struct TaskState {
    state: SessionState,
    /// Stream path fixed by the first SETUP (play) or by ANNOUNCE.
    path: Option<String>,
    base_url: Option<Url>,
    stream: Option<ServerStream>,
    transport_kind: Option<&'static str>,
    conn: Option<Arc<ConnShared>>,
    last_request: Instant,
    setup_order: Vec<usize>,
}

impl TaskState {
    fn is_tcp(&self) -> bool {
        self.transport_kind == Some("tcp")
    }

    fn read_mode(&self) -> ReadMode {
        match (self.state, self.is_tcp()) {
            (SessionState::Play, true) => ReadMode::TcpPlay,
            (SessionState::Record, true) => ReadMode::TcpRecord,
            _ => ReadMode::Standard,
        }
    }
}

impl ServerSession {
    /// Secret session id. Possession grants control of the session, so it
    /// never appears in logs above debug level.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Description received via ANNOUNCE, for publish sessions.
    pub fn announced_description(&self) -> Option<Description> {
        self.inner.announced.lock().clone()
    }

    /// Registers the RTP callback of one format.
    pub fn on_packet_rtp(&self, media_idx: usize, payload_type: u8, cb: RtpPacketCb) -> Result<()> {
        let medias = self.inner.medias.lock();
        let sm = medias
            .iter()
            .find(|m| m.media_idx == media_idx)
            .ok_or(Error::UnknownPayloadType(payload_type))?;
        let fs = sm
            .formats
            .get(&payload_type)
            .ok_or(Error::UnknownPayloadType(payload_type))?;
        *fs.on_packet_rtp.lock() = Some(cb);
        Ok(())
    }

    /// Registers the RTCP callback of one media.
    pub fn on_packet_rtcp(&self, media_idx: usize, cb: RtcpPacketCb) -> Result<()> {
        let medias = self.inner.medias.lock();
        let sm = medias
            .iter()
            .find(|m| m.media_idx == media_idx)
            .ok_or(Error::UnknownPayloadType(0))?;
        *sm.on_packet_rtcp.lock() = Some(cb);
        Ok(())
    }

    /// Registers the decode-error callback.
    pub fn on_decode_error(&self, cb: DecodeErrorCb) {
        *self.inner.on_decode_error.lock() = Some(cb);
    }

    /// Registers the packets-lost callback.
    pub fn on_packets_lost(&self, cb: PacketsLostCb) {
        *self.inner.on_packets_lost.lock() = Some(cb);
    }

    /// Terminates the session.
    pub async fn close(&self) {
        let _ = self.inner.tx.send(SessionMessage::Close { err: None }).await;
    }

    pub(crate) async fn send_message(&self, msg: SessionMessage) -> Result<()> {
        self.inner
            .tx
            .send(msg)
            .await
            .map_err(|_| Error::Terminated)
    }

    pub(crate) async fn notify_conn_closed(&self, conn_id: u64) {
        let _ = self
            .inner
            .tx
            .send(SessionMessage::ConnClosed { conn_id })
            .await;
    }

    /// Releases the write queue worker; called by the connection after
    /// the PLAY/RECORD response has been written.
    pub(crate) fn start_writer(&self) {
        if let Some(writer) = self.inner.writer.read().as_ref() {
            writer.start();
        }
    }

    /// Creates a session, registers it on the server and spawns its task.
    pub(crate) async fn spawn(server: Arc<ServerInner>) -> Result<Arc<ServerSession>> {
        let id = server.unique_session_id();
        let (tx, rx) = mpsc::channel(8);
        let inner = Arc::new(SessionInner {
            id: id.clone(),
            server: Arc::downgrade(&server),
            tx,
            handle: Mutex::new(Weak::new()),
            medias: Mutex::new(Vec::new()),
            writer: RwLock::new(None),
            conn_writer: Mutex::new(None),
            announced: Mutex::new(None),
            on_decode_error: Mutex::new(None),
            on_packets_lost: Mutex::new(None),
            epoch: Instant::now(),
            last_udp_ms: AtomicU64::new(0),
        });
        let session = Arc::new(ServerSession {
            inner: inner.clone(),
        });
        *inner.handle.lock() = Arc::downgrade(&session);
        server.sessions.insert(id.clone(), session.clone());
        debug!("session {id} created");

        tokio::spawn(run(inner, rx));
        server.handler.on_session_open(session.clone()).await;
        Ok(session)
    }
}

async fn run(inner: Arc<SessionInner>, mut rx: mpsc::Receiver<SessionMessage>) {
    let mut st = TaskState {
        state: SessionState::Initial,
        path: None,
        base_url: None,
        stream: None,
        transport_kind: None,
        conn: None,
        last_request: Instant::now(),
        setup_order: Vec::new(),
    };
    let mut check = tokio::time::interval(Duration::from_secs(1));
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let close_err = loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(SessionMessage::Request { req, conn, reply }) => {
                    st.last_request = Instant::now();
                    st.conn = Some(conn.clone());
                    match process_request(&inner, &mut st, req, &conn).await {
                        Ok(outcome) => {
                            let teardown = outcome.detach_session;
                            let _ = reply.send(outcome);
                            if teardown {
                                break None;
                            }
                        }
                        Err(e) if e.status_code().is_some() => {
                            debug!("request rejected: {e}");
                            let mut response = response_for_error(&e);
                            response.headers.set(
                                "Session",
                                SessionHeader::new(inner.id.clone()).encode(),
                            );
                            let _ = reply.send(RequestOutcome {
                                response,
                                read_mode: st.read_mode(),
                                start_writer: false,
                                detach_session: false,
                            });
                        }
                        Err(e) => {
                            let _ = reply.send(RequestOutcome {
                                response: response_for_error(&e),
                                read_mode: st.read_mode(),
                                start_writer: false,
                                detach_session: true,
                            });
                            break Some(e);
                        }
                    }
                }
                Some(SessionMessage::ConnClosed { conn_id }) => {
                    let owned = st.conn.as_ref().map(|c| c.id == conn_id).unwrap_or(false);
                    if owned {
                        st.conn = None;
                        *inner.conn_writer.lock() = None;
                        if st.is_tcp()
                            && matches!(st.state, SessionState::Play | SessionState::Record)
                        {
                            break Some(Error::Terminated);
                        }
                    }
                }
                Some(SessionMessage::Close { err }) => break err,
                None => break Some(Error::Terminated),
            },
            _ = check.tick() => {
                if let Some(e) = check_timeouts(&inner, &st) {
                    break Some(e);
                }
            }
        }
    };

    cleanup(&inner, &mut st, close_err).await;
}

fn check_timeouts(inner: &Arc<SessionInner>, st: &TaskState) -> Option<Error> {
    let server = inner.server.upgrade()?;
    let session_timeout = server.config.session_timeout;
    match st.state {
        SessionState::Record if !st.is_tcp() => {
            let last_ms = inner.last_udp_ms.load(Ordering::Acquire);
            let last = inner.epoch + Duration::from_millis(last_ms);
            (last.elapsed() >= server.config.read_timeout).then_some(Error::UdpTimeout)
        }
        SessionState::Play if !st.is_tcp() => {
            (st.last_request.elapsed() >= session_timeout).then_some(Error::SessionTimeout)
        }
        SessionState::Initial | SessionState::PrePlay | SessionState::PreRecord => {
            (st.last_request.elapsed() >= session_timeout).then_some(Error::SessionTimeout)
        }
        _ => None,
    }
}

async fn cleanup(inner: &Arc<SessionInner>, st: &mut TaskState, err: Option<Error>) {
    stop_transport(inner, st).await;
    if let Some(stream) = st.stream.take() {
        stream.remove_reader(&inner.id);
    }
    if let Some(server) = inner.server.upgrade() {
        server.sessions.remove(&inner.id);
        let session = inner.handle.lock().upgrade();
        if let Some(session) = session {
            server.handler.on_session_close(session, err.as_ref()).await;
        }
    }
    match &err {
        Some(e) => debug!("session terminated: {e}"),
        None => debug!("session closed"),
    }
}

/// Stops the data plane while keeping the setupped medias: shared by
/// PAUSE, TEARDOWN and session termination.
async fn stop_transport(inner: &Arc<SessionInner>, st: &mut TaskState) {
    let writer = inner.writer.write().take();
    if let Some(writer) = writer {
        // A paused writer that never started still drains nothing.
        writer.start();
        writer.stop().await;
    }

    let server = inner.server.upgrade();
    let medias = inner.medias.lock().clone();
    for sm in &medias {
        match &sm.transport {
            MediaTransport::Udp {
                client_rtp,
                client_rtcp,
            } => {
                if let Some(server) = &server {
                    if let Some(l) = &server.rtp_listener {
                        l.unregister(client_rtp);
                    }
                    if let Some(l) = &server.rtcp_listener {
                        l.unregister(client_rtcp);
                    }
                }
            }
            MediaTransport::Tcp { .. } => {
                if let Some(conn) = &st.conn {
                    conn.frame_callbacks.clear();
                }
            }
            MediaTransport::Multicast { .. } => {}
        }
        for fs in sm.formats.values() {
            if let Some(receiver) = fs.rtcp_receiver.lock().take() {
                receiver.close();
            }
        }
    }
    if let Some(stream) = &st.stream {
        stream.remove_reader(&inner.id);
    }
}

async fn process_request(
    inner: &Arc<SessionInner>,
    st: &mut TaskState,
    req: Request,
    conn: &Arc<ConnShared>,
) -> Result<RequestOutcome> {
    let (path, query) = path_and_query(&req.url);
    let ctx = RequestContext {
        remote_addr: conn.remote_addr,
        path: path.clone(),
        query,
        url: req.url.clone(),
        request: req.clone(),
        session: inner.handle.lock().upgrade(),
    };
    let server = inner.server.upgrade().ok_or(Error::Terminated)?;

    match req.method {
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
            Ok(reply(inner, st, res))
        }
        Method::Announce => handle_announce(inner, st, &server, req, ctx).await,
        Method::Setup => handle_setup(inner, st, &server, req, ctx, conn).await,
        Method::Play => handle_play(inner, st, &server, req, ctx, conn).await,
        Method::Record => handle_record(inner, st, &server, req, ctx, conn).await,
        Method::Pause => handle_pause(inner, st, &server, req, ctx).await,
        Method::Teardown => {
            stop_transport(inner, st).await;
            let mut outcome = reply(inner, st, Response::new(StatusCode::OK));
            outcome.read_mode = ReadMode::Standard;
            outcome.detach_session = true;
            Ok(outcome)
        }
        Method::GetParameter => {
            let body = server.handler.on_get_parameter(&ctx).await?;
            let mut res = Response::new(StatusCode::OK);
            if let Some(body) = body {
                res.headers.set("Content-Type", "text/parameters");
                res.body = body;
            }
            Ok(reply(inner, st, res))
        }
        Method::SetParameter => {
            server.handler.on_set_parameter(&ctx).await?;
            Ok(reply(inner, st, Response::new(StatusCode::OK)))
        }
        Method::Describe => {
            // DESCRIBE inside a session only makes sense before SETUP.
            if st.state != SessionState::Initial {
                return Err(Error::InvalidState {
                    method: "DESCRIBE",
                    state: st.state.name(),
                });
            }
            let res = super::connection::describe(&server, conn, &req).await;
            Ok(reply(inner, st, res))
        }
        Method::Redirect | Method::PlayNotify => {
            Ok(reply(inner, st, Response::new(StatusCode::NOT_IMPLEMENTED)))
        }
    }
}

/// Wraps a response with the session header and current read mode.
fn reply(inner: &Arc<SessionInner>, st: &TaskState, mut res: Response) -> RequestOutcome {
    res.headers
        .set("Session", SessionHeader::new(inner.id.clone()).encode());
    RequestOutcome {
        response: res,
        read_mode: st.read_mode(),
        start_writer: false,
        detach_session: false,
    }
}

fn check_path(st: &TaskState, path: &str) -> Result<()> {
    match &st.path {
        Some(expected) if expected == path => Ok(()),
        // Lenient on a trailing-slash-only mismatch, which path_and_query
        // already normalises away; anything else is a different resource.
        Some(expected) => Err(Error::PathMismatch {
            expected: expected.clone(),
            actual: path.to_string(),
        }),
        None => Ok(()),
    }
}

async fn handle_announce(
    inner: &Arc<SessionInner>,
    st: &mut TaskState,
    server: &Arc<ServerInner>,
    req: Request,
    ctx: RequestContext,
) -> Result<RequestOutcome> {
    if st.state != SessionState::Initial {
        return Err(Error::InvalidState {
            method: "ANNOUNCE",
            state: st.state.name(),
        });
    }
    match req.headers.get("Content-Type") {
        None => return Err(Error::ContentTypeMissing),
        Some(ct) if !ct.starts_with("application/sdp") => {
            return Err(Error::ContentTypeUnsupported(ct.to_string()))
        }
        Some(_) => {}
    }
    let body = std::str::from_utf8(&req.body)
        .map_err(|_| Error::InvalidSdp("body is not UTF-8".into()))?;
    let desc = Description::unmarshal(body)?;

    // Every media must resolve below the announced presentation URL.
    let base = req.url.clone();
    let base_prefix = base.as_str().trim_end_matches('/').to_string();
    for media in &desc.medias {
        let control = media.control_url(&base)?;
        if !control.as_str().starts_with(&base_prefix) {
            return Err(Error::InvalidSdp(format!(
                "media control URL '{control}' is outside the announced path"
            )));
        }
    }

    server.handler.on_announce(&ctx, &desc).await?;

    *inner.announced.lock() = Some(desc);
    st.path = Some(ctx.path.clone());
    st.base_url = Some(base);
    st.state = SessionState::PreRecord;
    Ok(reply(inner, st, Response::new(StatusCode::OK)))
}

/// Picks the first client-proposed transport the server supports.
fn select_transport<'a>(
    server: &ServerInner,
    transports: &'a [TransportHeader],
    allow_multicast: bool,
) -> Option<&'a TransportHeader> {
    transports.iter().find(|th| match th.lower_transport {
        LowerTransport::Tcp => true,
        LowerTransport::Udp => {
            if th.delivery == Some(Delivery::Multicast) {
                allow_multicast && server.config.multicast.is_some()
            } else {
                server.rtp_listener.is_some() && th.client_port.is_some()
            }
        }
    })
}

fn parse_key_mgmt(req: &Request) -> Result<Option<MikeyMessage>> {
    for value in req.headers.get_all("KeyMgmt") {
        let km = KeyMgmt::parse(value)?;
        return Ok(Some(MikeyMessage::parse(&km.mikey)?));
    }
    Ok(None)
}

async fn handle_setup(
    inner: &Arc<SessionInner>,
    st: &mut TaskState,
    server: &Arc<ServerInner>,
    req: Request,
    ctx: RequestContext,
    conn: &Arc<ConnShared>,
) -> Result<RequestOutcome> {
    if !matches!(
        st.state,
        SessionState::Initial | SessionState::PrePlay | SessionState::PreRecord
    ) {
        return Err(Error::InvalidState {
            method: "SETUP",
            state: st.state.name(),
        });
    }

    let transport_value = req
        .headers
        .get("Transport")
        .ok_or_else(|| Error::InvalidTransportHeader("missing Transport header".into()))?;
    let transports = TransportHeader::parse_list(transport_value)?;

    let record = st.state == SessionState::PreRecord;
    let th = select_transport(server, &transports, !record)
        .ok_or(Error::UnsupportedTransport)?
        .clone();

    // The mode must match the session direction.
    match (record, th.mode.unwrap_or(TransportMode::Play)) {
        (true, TransportMode::Record) | (false, TransportMode::Play) => {}
        _ => return Err(Error::UnsupportedTransport),
    }

    // Resolve the target media.
    let (media_idx, media, stream_mikey, stream_srtp_out) = if record {
        let announced = inner.announced.lock().clone().ok_or(Error::MediasNotSetup)?;
        let base = st.base_url.clone().ok_or(Error::MediasNotSetup)?;
        let idx = announced
            .find_media_by_url(&base, &req.url)
            .ok_or_else(|| Error::PathMismatch {
                expected: base.to_string(),
                actual: req.url.to_string(),
            })?;
        (idx, announced.medias[idx].clone(), None, None)
    } else {
        if st.stream.is_none() {
            let stream_path = parent_path(&ctx.path);
            let setup_ctx = RequestContext {
                path: stream_path.clone(),
                ..ctx
            };
            let stream = match server.handler.on_setup(&setup_ctx).await? {
                Some(s) => s,
                None => {
                    return Ok(reply(inner, st, Response::new(StatusCode::NOT_FOUND)));
                }
            };
            let mut base = req.url.clone();
            base.set_path(&format!("/{stream_path}"));
            base.set_query(None);
            st.stream = Some((*stream).clone());
            st.path = Some(stream_path);
            st.base_url = Some(base);
        }
        let stream = st.stream.as_ref().ok_or(Error::Terminated)?;
        let base = st.base_url.as_ref().ok_or(Error::Terminated)?;
        let idx = stream
            .description()
            .find_media_by_url(base, &req.url)
            .ok_or_else(|| Error::PathMismatch {
                expected: base.to_string(),
                actual: req.url.to_string(),
            })?;
        let media = stream.description().medias[idx].clone();
        let mikey = stream.media_mikey(idx).map(|m| m.to_vec());
        let srtp_out = stream.media_srtp_out(idx);
        (idx, media, mikey, srtp_out)
    };

    // Profile must agree with the media's.
    if th.profile != media.profile {
        return Err(Error::UnsupportedTransport);
    }

    {
        let medias = inner.medias.lock();
        if medias.iter().any(|m| m.media_idx == media_idx) {
            return Err(Error::MediaAlreadySetup);
        }
        if let Some(kind) = st.transport_kind {
            let new_kind = match (&th.lower_transport, th.delivery) {
                (LowerTransport::Tcp, _) => "tcp",
                (LowerTransport::Udp, Some(Delivery::Multicast)) => "multicast",
                (LowerTransport::Udp, _) => "udp",
            };
            if kind != new_kind {
                return Err(Error::DifferentTransports);
            }
        }
    }

    // Inbound SRTP context, from the client's MIKEY message.
    let client_mikey = match parse_key_mgmt(&req)? {
        Some(m) => Some(m),
        None if record => {
            // ANNOUNCE may have carried it in the SDP instead.
            media
                .key_mgmt_mikey
                .as_deref()
                .map(MikeyMessage::parse)
                .transpose()?
        }
        None => None,
    };
    if media.profile == Profile::Savp && record && client_mikey.is_none() {
        return Err(Error::InvalidTransportHeader(
            "SAVP transport without key management".into(),
        ));
    }
    let srtp_in = match &client_mikey {
        Some(m) => {
            let ctx = SrtpContext::new(m.keying_material())?;
            for cs in &m.crypto_sessions {
                ctx.add_ssrc(cs.ssrc);
            }
            Some(Arc::new(ctx))
        }
        None => None,
    };

    // Outbound SRTP context and the MIKEY message advertising it.
    let (srtp_out, response_mikey) = if media.profile == Profile::Savp {
        if record {
            let ctx = Arc::new(SrtpContext::new(
                crate::crypto::SrtpKeyingMaterial::generate(),
            )?);
            let mikey = MikeyMessage::new(ctx.keying_material(), &ctx.ssrcs()).marshal();
            (Some(ctx), Some(mikey))
        } else {
            (stream_srtp_out, stream_mikey)
        }
    } else {
        (None, None)
    };

    // Build the concrete transport and the response echo.
    let mut res_th = TransportHeader {
        profile: th.profile,
        lower_transport: th.lower_transport,
        ..Default::default()
    };
    let mut timeout_advertised = false;

    let transport = match (th.lower_transport, th.delivery) {
        (LowerTransport::Tcp, _) => {
            let (rtp_channel, rtcp_channel) = match th.interleaved {
                Some((lo, hi)) => {
                    if lo % 2 != 0 || hi != lo + 1 {
                        return Err(Error::InvalidInterleavedIds);
                    }
                    (lo, hi)
                }
                None => {
                    let lo = (media_idx as u8) * 2;
                    (lo, lo + 1)
                }
            };
            let medias = inner.medias.lock();
            let clash = medias.iter().any(|m| {
                matches!(&m.transport, MediaTransport::Tcp { rtp_channel: r, rtcp_channel: c }
                    if *r == rtp_channel || *c == rtcp_channel)
            });
            if clash {
                return Err(Error::InvalidInterleavedIds);
            }
            drop(medias);
            res_th.delivery = Some(Delivery::Unicast);
            res_th.interleaved = Some((rtp_channel, rtcp_channel));
            MediaTransport::Tcp {
                rtp_channel,
                rtcp_channel,
            }
        }
        (LowerTransport::Udp, Some(Delivery::Multicast)) => {
            let stream = st.stream.as_ref().ok_or(Error::UnsupportedTransport)?;
            let handler = stream.multicast_handler(media_idx)?;
            let (rtp_port, rtcp_port) = handler.ports();
            res_th.delivery = Some(Delivery::Multicast);
            res_th.destination = Some(IpAddr::V4(handler.group()));
            res_th.ports = Some((rtp_port, rtcp_port));
            res_th.ttl = Some(crate::io::multicast::MULTICAST_TTL as u8);
            timeout_advertised = true;
            MediaTransport::Multicast { handler }
        }
        (LowerTransport::Udp, _) => {
            let (rtp_port, rtcp_port) = th.client_port.ok_or(Error::ClientPortsMissing)?;
            let client_ip = th.destination.unwrap_or_else(|| conn.remote_addr.ip());
            let client_rtp = SocketAddr::new(client_ip, rtp_port);
            let client_rtcp = SocketAddr::new(client_ip, rtcp_port);
            {
                let medias = inner.medias.lock();
                let clash = medias.iter().any(|m| {
                    matches!(&m.transport, MediaTransport::Udp { client_rtp: r, .. }
                        if *r == client_rtp)
                });
                if clash {
                    return Err(Error::UdpPortPairInUse);
                }
            }
            let rtp_l = server.rtp_listener.as_ref().ok_or(Error::UnsupportedTransport)?;
            let rtcp_l = server
                .rtcp_listener
                .as_ref()
                .ok_or(Error::UnsupportedTransport)?;
            if rtp_l.is_registered(&client_rtp) || rtcp_l.is_registered(&client_rtcp) {
                return Err(Error::UdpPortPairInUse);
            }
            res_th.delivery = Some(Delivery::Unicast);
            res_th.client_port = Some((rtp_port, rtcp_port));
            res_th.server_port = Some((rtp_l.port(), rtcp_l.port()));
            if !record {
                timeout_advertised = true;
            }
            MediaTransport::Udp {
                client_rtp,
                client_rtcp,
            }
        }
    };

    // The SSRC hint lets players bind the stream before the first RTCP.
    if !record {
        if let Some(stream) = &st.stream {
            res_th.ssrc = stream.media_ssrc(media_idx);
        }
    }

    let mut formats = HashMap::new();
    for format in &media.formats {
        formats.insert(
            format.payload_type(),
            Arc::new(FormatState {
                format: format.clone(),
                reorderer: Mutex::new(crate::reorder::Reorderer::new()),
                rtcp_receiver: Mutex::new(None),
                on_packet_rtp: Mutex::new(None),
            }),
        );
    }
    let sm = Arc::new(SetuppedMedia {
        media_idx,
        media,
        transport,
        srtp_in,
        srtp_out,
        formats,
        on_packet_rtcp: Mutex::new(None),
    });
    st.transport_kind = Some(sm.transport.kind());
    st.setup_order.push(media_idx);
    inner.medias.lock().push(sm);

    if st.state == SessionState::Initial {
        st.state = SessionState::PrePlay;
    }

    let mut res = Response::new(StatusCode::OK);
    res.headers.set("Transport", res_th.encode());
    if let Some(mikey) = response_mikey {
        res.headers.set(
            "KeyMgmt",
            KeyMgmt {
                url: Some(req.url.to_string()),
                mikey,
            }
            .encode(),
        );
    }

    let mut outcome = reply(inner, st, res);
    if timeout_advertised {
        let mut session_header = SessionHeader::new(inner.id.clone());
        session_header.timeout = Some(server.config.session_timeout.as_secs());
        outcome
            .response
            .headers
            .set("Session", session_header.encode());
    }
    Ok(outcome)
}

async fn handle_play(
    inner: &Arc<SessionInner>,
    st: &mut TaskState,
    server: &Arc<ServerInner>,
    req: Request,
    ctx: RequestContext,
    conn: &Arc<ConnShared>,
) -> Result<RequestOutcome> {
    match st.state {
        // A repeated PLAY is idempotent and creates no second writer.
        SessionState::Play => return Ok(reply(inner, st, Response::new(StatusCode::OK))),
        SessionState::PrePlay => {}
        _ => {
            return Err(Error::InvalidState {
                method: "PLAY",
                state: st.state.name(),
            })
        }
    }
    check_path(st, &ctx.path)?;
    let stream = st.stream.clone().ok_or(Error::MediasNotSetup)?;

    server.handler.on_play(&ctx).await?;

    *inner.conn_writer.lock() = Some(conn.writer.clone());
    let writer = Arc::new(WriteQueue::new_paused(
        server.config.write_queue_size,
        true,
    ));
    *inner.writer.write() = Some(writer);

    // Register the inbound paths, rolling everything back on failure.
    let medias = inner.medias.lock().clone();
    if let Err(e) = register_play_inbound(inner, server, conn, &medias).and_then(|_| {
        // Attach to the stream; packets pile up in the paused writer
        // until the response is written.
        stream.add_reader(Arc::new(SessionSink {
            id: inner.id.clone(),
            session: Arc::downgrade(inner),
        }))
    }) {
        stop_transport(inner, st).await;
        return Err(e);
    }

    // RTP-Info: starting sequence number and timestamp per active media.
    let base = st.base_url.clone().ok_or(Error::MediasNotSetup)?;
    let now = SystemTime::now();
    let entries: Vec<RtpInfoEntry> = stream
        .rtp_info_entries(&st.setup_order, &base, now)
        .into_iter()
        .filter_map(|(_, info, url)| {
            let url = url?;
            Some(match info {
                Some((seq, rtptime)) => RtpInfoEntry {
                    url: url.to_string(),
                    seq: Some(seq),
                    rtptime: Some(rtptime),
                },
                None => RtpInfoEntry {
                    url: url.to_string(),
                    seq: None,
                    rtptime: None,
                },
            })
        })
        .collect();

    st.state = SessionState::Play;
    let mut res = Response::new(StatusCode::OK);
    if !entries.is_empty() {
        res.headers.set("RTP-Info", RtpInfo(entries).encode());
    }
    if let Some(range) = req.headers.get("Range") {
        res.headers.set("Range", range.to_string());
    }
    let mut outcome = reply(inner, st, res);
    outcome.start_writer = true;
    Ok(outcome)
}

fn register_play_inbound(
    inner: &Arc<SessionInner>,
    server: &Arc<ServerInner>,
    conn: &Arc<ConnShared>,
    medias: &[Arc<SetuppedMedia>],
) -> Result<()> {
    for sm in medias {
        match &sm.transport {
            MediaTransport::Tcp {
                rtp_channel,
                rtcp_channel,
            } => {
                let target = inner.clone();
                let m = sm.clone();
                conn.frame_callbacks.insert(
                    *rtcp_channel,
                    Arc::new(move |payload| {
                        target.handle_rtcp_in(&m, payload);
                    }),
                );
                if sm.media.is_back_channel {
                    let target = inner.clone();
                    let m = sm.clone();
                    conn.frame_callbacks.insert(
                        *rtp_channel,
                        Arc::new(move |payload| {
                            target.handle_rtp_in(&m, payload, false);
                        }),
                    );
                }
            }
            MediaTransport::Udp {
                client_rtp,
                client_rtcp,
            } => {
                let rtcp_l = server
                    .rtcp_listener
                    .as_ref()
                    .ok_or(Error::UnsupportedTransport)?;
                let target = inner.clone();
                let m = sm.clone();
                rtcp_l.register(
                    *client_rtcp,
                    Arc::new(move |result| match result {
                        Ok(payload) => {
                            target.handle_rtcp_in(&m, payload);
                            true
                        }
                        Err(e) => {
                            target.decode_error(&e);
                            false
                        }
                    }),
                )?;
                if sm.media.is_back_channel {
                    if let Some(rtp_l) = &server.rtp_listener {
                        let target = inner.clone();
                        let m = sm.clone();
                        rtp_l.register(
                            *client_rtp,
                            Arc::new(move |result| match result {
                                Ok(payload) => target.handle_rtp_in(&m, payload, true),
                                Err(e) => {
                                    target.decode_error(&e);
                                    false
                                }
                            }),
                        )?;
                    }
                }
            }
            MediaTransport::Multicast { .. } => {}
        }
    }
    Ok(())
}

async fn handle_record(
    inner: &Arc<SessionInner>,
    st: &mut TaskState,
    server: &Arc<ServerInner>,
    _req: Request,
    ctx: RequestContext,
    conn: &Arc<ConnShared>,
) -> Result<RequestOutcome> {
    if st.state != SessionState::PreRecord {
        return Err(Error::InvalidState {
            method: "RECORD",
            state: st.state.name(),
        });
    }
    check_path(st, &ctx.path)?;

    let announced_count = inner
        .announced
        .lock()
        .as_ref()
        .map(|d| d.medias.len())
        .unwrap_or(0);
    if inner.medias.lock().len() != announced_count || announced_count == 0 {
        return Err(Error::MediasNotSetup);
    }

    server.handler.on_record(&ctx).await?;

    *inner.conn_writer.lock() = Some(conn.writer.clone());
    let writer = Arc::new(WriteQueue::new_paused(8, true));
    *inner.writer.write() = Some(writer.clone());
    inner.touch_udp();

    let is_tcp = st.is_tcp();
    let rr_period = if is_tcp {
        Duration::from_secs(1)
    } else {
        server.config.receiver_report_period
    };

    let medias = inner.medias.lock().clone();
    if let Err(e) = register_record_inbound(inner, server, conn, &medias, &writer, rr_period) {
        stop_transport(inner, st).await;
        return Err(e);
    }

    st.state = SessionState::Record;
    let mut outcome = reply(inner, st, Response::new(StatusCode::OK));
    outcome.start_writer = true;
    Ok(outcome)
}

fn register_record_inbound(
    inner: &Arc<SessionInner>,
    server: &Arc<ServerInner>,
    conn: &Arc<ConnShared>,
    medias: &[Arc<SetuppedMedia>],
    writer: &Arc<WriteQueue>,
    rr_period: Duration,
) -> Result<()> {
    for sm in medias {
        // One RTCP receiver per format emits the periodic Receiver
        // Reports through the session write queue.
        for fs in sm.formats.values() {
            let target = inner.clone();
            let m = sm.clone();
            let receiver = crate::rtcp::RtcpReceiver::new(
                fs.format.clock_rate(),
                rand::random(),
                rr_period,
                Arc::new(move |payload: Bytes| {
                    target.enqueue_rtcp_out(&m, payload);
                }),
            );
            *fs.rtcp_receiver.lock() = Some(receiver);
        }

        match &sm.transport {
            MediaTransport::Tcp {
                rtp_channel,
                rtcp_channel,
            } => {
                let target = inner.clone();
                let m = sm.clone();
                conn.frame_callbacks.insert(
                    *rtp_channel,
                    Arc::new(move |payload| {
                        // TCP preserves order, so no reordering window.
                        target.handle_rtp_in(&m, payload, false);
                    }),
                );
                let target = inner.clone();
                let m = sm.clone();
                conn.frame_callbacks.insert(
                    *rtcp_channel,
                    Arc::new(move |payload| {
                        target.handle_rtcp_in(&m, payload);
                    }),
                );
            }
            MediaTransport::Udp {
                client_rtp,
                client_rtcp,
            } => {
                let rtp_l = server
                    .rtp_listener
                    .as_ref()
                    .ok_or(Error::UnsupportedTransport)?;
                let rtcp_l = server
                    .rtcp_listener
                    .as_ref()
                    .ok_or(Error::UnsupportedTransport)?;
                let target = inner.clone();
                let m = sm.clone();
                rtp_l.register(
                    *client_rtp,
                    Arc::new(move |result| match result {
                        Ok(payload) => target.handle_rtp_in(&m, payload, true),
                        Err(e) => {
                            target.decode_error(&e);
                            false
                        }
                    }),
                )?;
                let target = inner.clone();
                let m = sm.clone();
                rtcp_l.register(
                    *client_rtcp,
                    Arc::new(move |result| match result {
                        Ok(payload) => {
                            target.handle_rtcp_in(&m, payload);
                            true
                        }
                        Err(e) => {
                            target.decode_error(&e);
                            false
                        }
                    }),
                )?;

                // Open the client's NAT/firewall with one empty packet in
                // each direction pair.
                let rtp_l = rtp_l.clone();
                let rtcp_l = rtcp_l.clone();
                let rtp_dest = *client_rtp;
                let rtcp_dest = *client_rtcp;
                let _ = writer.push(move || {
                    Box::pin(async move {
                        let mut punch = Packet::default();
                        punch.header.version = 2;
                        if let Ok(payload) = punch.marshal() {
                            let _ = rtp_l.send_to(&payload, rtp_dest).await;
                        }
                        let rr = rtcp::receiver_report::ReceiverReport::default();
                        if let Ok(payload) = rr.marshal() {
                            let _ = rtcp_l.send_to(&payload, rtcp_dest).await;
                        }
                    })
                });
            }
            MediaTransport::Multicast { .. } => {
                return Err(Error::UnsupportedTransport);
            }
        }
    }
    Ok(())
}

async fn handle_pause(
    inner: &Arc<SessionInner>,
    st: &mut TaskState,
    server: &Arc<ServerInner>,
    _req: Request,
    ctx: RequestContext,
) -> Result<RequestOutcome> {
    match st.state {
        SessionState::Play | SessionState::Record => {}
        _ => {
            return Err(Error::InvalidState {
                method: "PAUSE",
                state: st.state.name(),
            })
        }
    }
    check_path(st, &ctx.path)?;
    server.handler.on_pause(&ctx).await?;

    stop_transport(inner, st).await;
    st.state = match st.state {
        SessionState::Play => SessionState::PrePlay,
        _ => SessionState::PreRecord,
    };
    Ok(reply(inner, st, Response::new(StatusCode::OK)))
}

/// Fan-out sink registered on the stream for a playing session.
struct SessionSink {
    id: String,
    session: Weak<SessionInner>,
}

impl ReaderSink for SessionSink {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn enqueue_rtp(&self, media_idx: usize, payload: Bytes) {
        if let Some(inner) = self.session.upgrade() {
            inner.enqueue_media(media_idx, payload, true);
        }
    }

    fn enqueue_rtcp(&self, media_idx: usize, payload: Bytes) {
        if let Some(inner) = self.session.upgrade() {
            inner.enqueue_media(media_idx, payload, false);
        }
    }
}

impl SessionInner {
    fn touch_udp(&self) {
        self.last_udp_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
    }

    fn decode_error(&self, err: &DecodeError) {
        if let Some(cb) = self.on_decode_error.lock().clone() {
            cb(err);
        } else {
            trace!("decode error: {err}");
        }
    }

    fn packets_lost(&self, count: u64) {
        if let Some(cb) = self.on_packets_lost.lock().clone() {
            cb(count);
        } else {
            debug!("{count} RTP packet(s) lost");
        }
    }

    /// Inbound RTP: decrypt, parse, reorder (UDP), account, deliver.
    /// Returns whether the payload was retained.
    fn handle_rtp_in(
        self: &Arc<Self>,
        sm: &Arc<SetuppedMedia>,
        payload: Bytes,
        reorder: bool,
    ) -> bool {
        self.touch_udp();
        let payload = match &sm.srtp_in {
            Some(ctx) => match ctx.decrypt_rtp(&payload) {
                Ok(p) => p,
                Err(e) => {
                    self.decode_error(&DecodeError::Decrypt(e.to_string()));
                    return false;
                }
            },
            None => payload,
        };
        let pkt = match Packet::unmarshal(&mut &payload[..]) {
            Ok(p) => p,
            Err(e) => {
                self.decode_error(&DecodeError::InvalidRtp(e.to_string()));
                return false;
            }
        };
        let Some(fs) = sm.formats.get(&pkt.header.payload_type) else {
            self.decode_error(&DecodeError::UnknownPayloadType(pkt.header.payload_type));
            return false;
        };

        let deliver = |pkt: Packet| {
            let receiver = fs.rtcp_receiver.lock();
            if let Some(receiver) = receiver.as_ref() {
                if let Some(stats) = receiver.stats() {
                    if stats.remote_ssrc != pkt.header.ssrc {
                        self.decode_error(&DecodeError::SsrcMismatch {
                            expected: stats.remote_ssrc,
                            got: pkt.header.ssrc,
                        });
                        return;
                    }
                }
                receiver.process_rtp(&pkt, fs.format.pts_equals_dts(&pkt));
            }
            drop(receiver);
            if let Some(cb) = fs.on_packet_rtp.lock().clone() {
                cb(pkt);
            }
        };

        if reorder {
            let (pkts, lost) = fs.reorderer.lock().process(pkt);
            if lost > 0 {
                self.packets_lost(lost);
            }
            for p in pkts {
                deliver(p);
            }
        } else {
            deliver(pkt);
        }
        true
    }

    /// Inbound RTCP: decrypt, parse, feed Sender Reports, deliver.
    fn handle_rtcp_in(self: &Arc<Self>, sm: &Arc<SetuppedMedia>, payload: Bytes) {
        self.touch_udp();
        let payload = match &sm.srtp_in {
            Some(ctx) => match ctx.decrypt_rtcp(&payload) {
                Ok(p) => p,
                Err(e) => {
                    self.decode_error(&DecodeError::Decrypt(e.to_string()));
                    return;
                }
            },
            None => payload,
        };
        let packets = match rtcp::packet::unmarshal(&mut &payload[..]) {
            Ok(p) => p,
            Err(e) => {
                self.decode_error(&DecodeError::InvalidRtcp(e.to_string()));
                return;
            }
        };
        for pkt in packets {
            if let Some(sr) = pkt
                .as_any()
                .downcast_ref::<rtcp::sender_report::SenderReport>()
            {
                for fs in sm.formats.values() {
                    let receiver = fs.rtcp_receiver.lock();
                    if let Some(receiver) = receiver.as_ref() {
                        let matches = receiver
                            .stats()
                            .map(|s| s.remote_ssrc == sr.ssrc)
                            .unwrap_or(false);
                        if matches {
                            receiver.process_sr(sr);
                        }
                    }
                }
            }
            if let Some(cb) = sm.on_packet_rtcp.lock().clone() {
                cb(pkt);
            }
        }
    }

    /// Outbound RTCP produced by this session (Receiver Reports during
    /// record): encrypt and enqueue.
    fn enqueue_rtcp_out(self: &Arc<Self>, sm: &Arc<SetuppedMedia>, payload: Bytes) {
        let payload = match &sm.srtp_out {
            Some(ctx) => match ctx.encrypt_rtcp(&payload) {
                Ok(p) => p,
                Err(e) => {
                    warn!("outbound SRTCP encryption failed: {e}");
                    return;
                }
            },
            None => payload,
        };
        self.enqueue_to_media(sm, payload, false);
    }

    /// Outbound packet from the stream fan-out (already encrypted).
    fn enqueue_media(self: &Arc<Self>, media_idx: usize, payload: Bytes, is_rtp: bool) {
        let sm = {
            let medias = self.medias.lock();
            medias.iter().find(|m| m.media_idx == media_idx).cloned()
        };
        if let Some(sm) = sm {
            self.enqueue_to_media(&sm, payload, is_rtp);
        }
    }

    fn enqueue_to_media(self: &Arc<Self>, sm: &Arc<SetuppedMedia>, payload: Bytes, is_rtp: bool) {
        let Some(writer) = self.writer.read().clone() else {
            return;
        };
        let job: Option<crate::io::write_queue::WriteJob> = match &sm.transport {
            MediaTransport::Tcp {
                rtp_channel,
                rtcp_channel,
            } => {
                let channel = if is_rtp { *rtp_channel } else { *rtcp_channel };
                let conn_writer = self.conn_writer.lock().clone();
                conn_writer.map(|w| -> crate::io::write_queue::WriteJob {
                    Box::new(move || {
                        Box::pin(async move {
                            let mut scratch = BytesMut::new();
                            let _ = w
                                .write_interleaved_frame(channel, &payload, &mut scratch)
                                .await;
                        })
                    })
                })
            }
            MediaTransport::Udp {
                client_rtp,
                client_rtcp,
            } => {
                let dest = if is_rtp { *client_rtp } else { *client_rtcp };
                let server = self.server.upgrade();
                server.and_then(|server| {
                    let listener = if is_rtp {
                        server.rtp_listener.clone()
                    } else {
                        server.rtcp_listener.clone()
                    };
                    listener.map(|l| -> crate::io::write_queue::WriteJob {
                        Box::new(move || {
                            Box::pin(async move {
                                let _ = l.send_to(&payload, dest).await;
                            })
                        })
                    })
                })
            }
            // Multicast packets are sent once by the stream itself.
            MediaTransport::Multicast { .. } => None,
        };
        if let Some(job) = job {
            if writer.push(job).is_err() {
                trace!("write queue full, dropping packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_path_strips_control_segment() {
        assert_eq!(parent_path("teststream/trackID=0"), "teststream");
        assert_eq!(parent_path("a/b/trackID=1"), "a/b");
        assert_eq!(parent_path("teststream"), "teststream");
    }

    #[test]
    fn path_and_query_normalises() {
        let url = Url::parse("rtsp://h:8554/stream/trackID=0?x=1").unwrap();
        let (path, query) = path_and_query(&url);
        assert_eq!(path, "stream/trackID=0");
        assert_eq!(query.as_deref(), Some("x=1"));

        let url = Url::parse("rtsp://h/stream/").unwrap();
        assert_eq!(path_and_query(&url).0, "stream");
    }

    #[test]
    fn error_response_carries_challenges() {
        let res = response_for_error(&Error::AuthenticationRequired {
            challenges: vec!["Digest realm=\"r\", nonce=\"n\"".into()],
        });
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers.get_all("WWW-Authenticate").len(), 1);
    }
}
