//! Client-side per-media state and data-plane handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rtp::packet::Packet;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};
use url::Url;
use util::marshal::Unmarshal;

use crate::crypto::SrtpContext;
use crate::description::{Format, Media};
use crate::error::DecodeError;
use crate::io::conn::ConnWriter;
use crate::io::udp::UdpListener;
use crate::io::write_queue::WriteQueue;
use crate::message::{Request, Response};
use crate::reorder::Reorderer;
use crate::rtcp::{RtcpReceiver, RtcpSender};

/// Callback for received RTP packets of one format.
pub type RtpPacketCb = Arc<dyn Fn(Packet) + Send + Sync>;

/// Callback for received RTCP packets of one media.
pub type RtcpPacketCb = Arc<dyn Fn(Box<dyn rtcp::packet::Packet + Send + Sync>) + Send + Sync>;

/// Callback for non-fatal decode problems.
pub type DecodeErrorCb = Arc<dyn Fn(&DecodeError) + Send + Sync>;

/// Callback for reported packet losses.
pub type PacketsLostCb = Arc<dyn Fn(u64) + Send + Sync>;

/// Callback for server-initiated requests (REDIRECT, PLAY_NOTIFY).
pub type ServerRequestCb = Arc<dyn Fn(&Request) + Send + Sync>;

pub(crate) type FrameCb = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Transport negotiated for one media.
pub(crate) enum ClientMediaTransport {
    Udp {
        rtp_listener: UdpListener,
        rtcp_listener: UdpListener,
        server_rtp: Mutex<Option<SocketAddr>>,
        server_rtcp: Mutex<Option<SocketAddr>>,
    },
    Tcp {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

pub(crate) struct ClientFormatState {
    pub format: Arc<dyn Format>,
    pub reorderer: Mutex<Reorderer>,
    /// Present on receive (play) medias.
    pub rtcp_receiver: Option<RtcpReceiver>,
    /// Present on send (record, back-channel) medias.
    pub rtcp_sender: Option<RtcpSender>,
}

pub(crate) struct ClientMedia {
    pub media_idx: usize,
    pub media: Media,
    pub control_url: Url,
    pub transport: ClientMediaTransport,
    pub srtp_in: Option<Arc<SrtpContext>>,
    pub srtp_out: Option<Arc<SrtpContext>>,
    pub formats: HashMap<u8, Arc<ClientFormatState>>,
}

/// State shared between the client API object and its background tasks
/// (reader, keepalive, UDP listeners, write queue).
pub(crate) struct ClientShared {
    pub cseq: AtomicU32,
    pub pending: DashMap<u32, tokio::sync::oneshot::Sender<Response>>,
    pub frame_callbacks: DashMap<u8, FrameCb>,
    pub conn_writer: Mutex<Option<ConnWriter<TcpStream>>>,
    pub writer: RwLock<Option<Arc<WriteQueue>>>,
    pub medias: Mutex<HashMap<usize, Arc<ClientMedia>>>,
    pub rtp_cbs: Mutex<HashMap<(usize, u8), RtpPacketCb>>,
    pub rtcp_cbs: Mutex<HashMap<usize, RtcpPacketCb>>,
    pub on_decode_error: Mutex<Option<DecodeErrorCb>>,
    pub on_packets_lost: Mutex<Option<PacketsLostCb>>,
    pub on_server_request: Mutex<Option<ServerRequestCb>>,
    /// Set by the first data-plane packet; drives UDP→TCP fallback.
    pub packet_seen: AtomicBool,
    pub closed: AtomicBool,
}

impl ClientShared {
    pub fn new() -> Self {
        Self {
            cseq: AtomicU32::new(0),
            pending: DashMap::new(),
            frame_callbacks: DashMap::new(),
            conn_writer: Mutex::new(None),
            writer: RwLock::new(None),
            medias: Mutex::new(HashMap::new()),
            rtp_cbs: Mutex::new(HashMap::new()),
            rtcp_cbs: Mutex::new(HashMap::new()),
            on_decode_error: Mutex::new(None),
            on_packets_lost: Mutex::new(None),
            on_server_request: Mutex::new(None),
            packet_seen: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn decode_error(&self, err: &DecodeError) {
        if let Some(cb) = self.on_decode_error.lock().clone() {
            cb(err);
        } else {
            trace!("decode error: {err}");
        }
    }

    pub fn packets_lost(&self, count: u64) {
        if let Some(cb) = self.on_packets_lost.lock().clone() {
            cb(count);
        } else {
            debug!("{count} RTP packet(s) lost");
        }
    }

    /// Inbound RTP for one media. Returns whether the payload was
    /// retained.
    pub fn handle_rtp_in(
        self: &Arc<Self>,
        cm: &Arc<ClientMedia>,
        payload: Bytes,
        reorder: bool,
    ) -> bool {
        self.packet_seen.store(true, Ordering::Release);
        let payload = match &cm.srtp_in {
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
        let Some(fs) = cm.formats.get(&pkt.header.payload_type) else {
            self.decode_error(&DecodeError::UnknownPayloadType(pkt.header.payload_type));
            return false;
        };

        let deliver = |pkt: Packet| {
            if let Some(receiver) = &fs.rtcp_receiver {
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
            let cb = self
                .rtp_cbs
                .lock()
                .get(&(cm.media_idx, pkt.header.payload_type))
                .cloned();
            if let Some(cb) = cb {
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

    /// Inbound RTCP for one media.
    pub fn handle_rtcp_in(self: &Arc<Self>, cm: &Arc<ClientMedia>, payload: Bytes) {
        self.packet_seen.store(true, Ordering::Release);
        let payload = match &cm.srtp_in {
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
                for fs in cm.formats.values() {
                    if let Some(receiver) = &fs.rtcp_receiver {
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
            let cb = self.rtcp_cbs.lock().get(&cm.media_idx).cloned();
            if let Some(cb) = cb {
                cb(pkt);
            }
        }
    }

    /// Enqueues one outbound data-plane payload for a media.
    pub fn enqueue_out(self: &Arc<Self>, cm: &Arc<ClientMedia>, payload: Bytes, is_rtp: bool) {
        let Some(writer) = self.writer.read().clone() else {
            return;
        };
        let job: Option<crate::io::write_queue::WriteJob> = match &cm.transport {
            ClientMediaTransport::Tcp {
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
            ClientMediaTransport::Udp {
                rtp_listener,
                rtcp_listener,
                server_rtp,
                server_rtcp,
            } => {
                let (listener, dest) = if is_rtp {
                    (rtp_listener.clone(), *server_rtp.lock())
                } else {
                    (rtcp_listener.clone(), *server_rtcp.lock())
                };
                dest.map(|dest| -> crate::io::write_queue::WriteJob {
                    Box::new(move || {
                        Box::pin(async move {
                            let _ = listener.send_to(&payload, dest).await;
                        })
                    })
                })
            }
        };
        if let Some(job) = job {
            if writer.push(job).is_err() {
                trace!("write queue full, dropping packet");
            }
        }
    }

    /// Outbound RTCP addressed by media index, for the report timers that
    /// outlive any single borrow of the media table.
    pub fn rtcp_out_by_idx(self: &Arc<Self>, media_idx: usize, payload: Bytes) {
        let cm = self.medias.lock().get(&media_idx).cloned();
        if let Some(cm) = cm {
            self.enqueue_rtcp_out(&cm, payload);
        }
    }

    /// Outbound RTCP produced locally: encrypt and enqueue.
    pub fn enqueue_rtcp_out(self: &Arc<Self>, cm: &Arc<ClientMedia>, payload: Bytes) {
        let payload = match &cm.srtp_out {
            Some(ctx) => match ctx.encrypt_rtcp(&payload) {
                Ok(p) => p,
                Err(e) => {
                    warn!("outbound SRTCP encryption failed: {e}");
                    return;
                }
            },
            None => payload,
        };
        self.enqueue_out(cm, payload, false);
    }
}
