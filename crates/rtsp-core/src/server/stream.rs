use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use rtp::packet::Packet;
use sdp::description::common::{Address, ConnectionInformation};
use tracing::{debug, trace};
use url::Url;
use util::marshal::Marshal;

use super::ServerInner;
use crate::crypto::{MikeyMessage, SrtpContext, SrtpKeyingMaterial};
use crate::description::{Description, Format};
use crate::error::{Error, Result};
use crate::headers::Profile;
use crate::io::multicast::{MulticastHandler, MULTICAST_TTL};
use crate::rtcp::{RtcpSender, DEFAULT_SENDER_REPORT_PERIOD};

/// Destination a stream fans packets out to: one per reader session.
pub(crate) trait ReaderSink: Send + Sync {
    /// Identity of the owning session, for deregistration.
    fn session_id(&self) -> &str;
    fn enqueue_rtp(&self, media_idx: usize, payload: Bytes);
    fn enqueue_rtcp(&self, media_idx: usize, payload: Bytes);
}

struct StreamFormat {
    format: Arc<dyn Format>,
    rtcp_sender: RtcpSender,
}

pub(crate) struct StreamMedia {
    pub(crate) srtp_out: Option<Arc<SrtpContext>>,
    pub(crate) mikey: Option<Vec<u8>>,
    multicast: Mutex<Option<MulticastHandler>>,
    formats: HashMap<u8, StreamFormat>,
}

pub(crate) struct StreamInner {
    server: Weak<ServerInner>,
    description: Description,
    pub(crate) medias: Vec<StreamMedia>,
    readers: Mutex<HashMap<String, Arc<dyn ReaderSink>>>,
    closed: AtomicBool,
}

/// A publisher-owned live stream: binds a description to its current
/// readers and fans published packets out to them.
#[derive(Clone)]
pub struct ServerStream {
    pub(crate) inner: Arc<StreamInner>,
}

impl ServerStream {
    /// Creates a stream on a server from the description the application
    /// supplies. SAVP medias get a fresh SRTP context and MIKEY message.
    pub fn new(server: &super::Server, mut description: Description) -> Result<ServerStream> {
        // SRTP contexts are prepared up front; the cyclic construction
        // below cannot fail.
        let mut contexts = Vec::with_capacity(description.medias.len());
        for media in &description.medias {
            contexts.push(if media.profile == Profile::Savp {
                Some(Arc::new(SrtpContext::new(SrtpKeyingMaterial::generate())?))
            } else {
                None
            });
        }

        let inner = Arc::new_cyclic(|weak_inner: &Weak<StreamInner>| {
            let mut medias = Vec::with_capacity(description.medias.len());
            for (media_idx, media) in description.medias.iter_mut().enumerate() {
                let srtp_out = contexts[media_idx].clone();

                let mut formats = HashMap::new();
                for format in &media.formats {
                    let weak = weak_inner.clone();
                    let rtcp_sender = RtcpSender::new(
                        format.clock_rate(),
                        DEFAULT_SENDER_REPORT_PERIOD,
                        Arc::new(move |payload: Bytes| {
                            if let Some(stream) = weak.upgrade() {
                                stream.broadcast_rtcp(media_idx, &payload);
                            }
                        }),
                    );
                    if let Some(ctx) = &srtp_out {
                        ctx.add_ssrc(rtcp_sender.ssrc());
                    }
                    formats.insert(format.payload_type(), StreamFormat {
                        format: format.clone(),
                        rtcp_sender,
                    });
                }

                // The MIKEY message advertises the SSRCs the context will
                // protect; build it after the senders exist.
                let mikey = srtp_out.as_ref().map(|ctx| {
                    MikeyMessage::new(ctx.keying_material(), &ctx.ssrcs()).marshal()
                });
                if let Some(mikey) = &mikey {
                    media.key_mgmt_mikey = Some(mikey.clone());
                }

                medias.push(StreamMedia {
                    srtp_out,
                    mikey,
                    multicast: Mutex::new(None),
                    formats,
                });
            }
            StreamInner {
                server: Arc::downgrade(&server.inner),
                description,
                medias,
                readers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }
        });
        Ok(ServerStream { inner })
    }

    /// The stream's description, including any injected key management.
    pub fn description(&self) -> &Description {
        &self.inner.description
    }

    /// SDP body for DESCRIBE. With `multicast`, each media advertises its
    /// group address in its connection line.
    pub fn description_body(&self, multicast: bool) -> Result<String> {
        let mut sd = self.inner.description.marshal();
        if multicast {
            for (idx, md) in sd.media_descriptions.iter_mut().enumerate() {
                let handler = self.inner.multicast_handler(idx)?;
                md.connection_information = Some(ConnectionInformation {
                    network_type: "IN".to_string(),
                    address_type: "IP4".to_string(),
                    address: Some(Address {
                        address: handler.group().to_string(),
                        ttl: Some(MULTICAST_TTL as isize),
                        range: None,
                    }),
                });
            }
        }
        Ok(sd.marshal())
    }

    /// Publishes one RTP packet on a media. The packet's SSRC is replaced
    /// by the format's stable local SSRC.
    pub fn write_packet_rtp(&self, media_idx: usize, pkt: &Packet) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        let media = self
            .inner
            .medias
            .get(media_idx)
            .ok_or(Error::UnknownPayloadType(pkt.header.payload_type))?;
        let sf = media
            .formats
            .get(&pkt.header.payload_type)
            .ok_or(Error::UnknownPayloadType(pkt.header.payload_type))?;

        let mut pkt = pkt.clone();
        pkt.header.ssrc = sf.rtcp_sender.ssrc();
        let now = SystemTime::now();
        let pts_eq_dts = sf.format.pts_equals_dts(&pkt);
        let payload = pkt.marshal().map_err(|e| Error::MalformedMessage(e.to_string()))?;
        sf.rtcp_sender.process_rtp(&pkt, now, pts_eq_dts);

        let payload = match &media.srtp_out {
            Some(ctx) => ctx.encrypt_rtp(&payload)?,
            None => payload,
        };

        self.inner.fan_out(media_idx, &payload, true);
        Ok(())
    }

    /// Publishes one RTCP packet on a media.
    pub fn write_packet_rtcp(
        &self,
        media_idx: usize,
        pkt: &(dyn rtcp::packet::Packet + Send + Sync),
    ) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        if media_idx >= self.inner.medias.len() {
            return Err(Error::UnknownPayloadType(0));
        }
        let payload = pkt
            .marshal()
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        self.inner.broadcast_rtcp(media_idx, &payload);
        Ok(())
    }

    /// Closes the stream atomically; in-flight publishers observe
    /// [`Error::Terminated`] on the next write.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.readers.lock().clear();
        for media in &self.inner.medias {
            for sf in media.formats.values() {
                sf.rtcp_sender.close();
            }
            *media.multicast.lock() = None;
        }
        debug!("stream closed");
    }

    /// Stable SSRC of a media (its first format), advertised in SETUP
    /// responses.
    pub(crate) fn media_ssrc(&self, media_idx: usize) -> Option<u32> {
        let media = self.inner.medias.get(media_idx)?;
        let format = self.inner.description.medias.get(media_idx)?.formats.first()?;
        media
            .formats
            .get(&format.payload_type())
            .map(|sf| sf.rtcp_sender.ssrc())
    }

    /// `(next sequence number, RTP time scaled to now)` of a media, absent
    /// while the media is silent.
    pub(crate) fn media_rtp_info(&self, media_idx: usize, now: SystemTime) -> Option<(u16, u32)> {
        let media = self.inner.medias.get(media_idx)?;
        media.formats.values().find_map(|sf| {
            let stats = sf.rtcp_sender.stats()?;
            let rtptime = sf.rtcp_sender.rtp_time_now(now)?;
            Some((stats.last_seq.wrapping_add(1), rtptime))
        })
    }

    /// MIKEY message of a media, when SRTP-protected.
    pub(crate) fn media_mikey(&self, media_idx: usize) -> Option<&[u8]> {
        self.inner.medias.get(media_idx)?.mikey.as_deref()
    }

    pub(crate) fn media_srtp_out(&self, media_idx: usize) -> Option<Arc<SrtpContext>> {
        self.inner.medias.get(media_idx)?.srtp_out.clone()
    }

    /// Lazily allocated multicast handler of a media.
    pub(crate) fn multicast_handler(&self, media_idx: usize) -> Result<MulticastHandler> {
        self.inner.multicast_handler(media_idx)
    }

    /// Attaches a reader session.
    pub(crate) fn add_reader(&self, sink: Arc<dyn ReaderSink>) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        self.inner
            .readers
            .lock()
            .insert(sink.session_id().to_string(), sink);
        Ok(())
    }

    /// Detaches a reader session.
    pub(crate) fn remove_reader(&self, session_id: &str) {
        self.inner.readers.lock().remove(session_id);
    }

    /// Number of attached readers.
    pub fn reader_count(&self) -> usize {
        self.inner.readers.lock().len()
    }

    /// Per-media `RTP-Info` source for a set of media indexes.
    pub(crate) fn rtp_info_entries(
        &self,
        media_idxs: &[usize],
        base: &Url,
        now: SystemTime,
    ) -> Vec<(usize, Option<(u16, u32)>, Option<Url>)> {
        media_idxs
            .iter()
            .map(|&idx| {
                let url = self
                    .inner
                    .description
                    .medias
                    .get(idx)
                    .and_then(|m| m.control_url(base).ok());
                (idx, self.media_rtp_info(idx, now), url)
            })
            .collect()
    }
}

impl StreamInner {
    fn multicast_handler(&self, media_idx: usize) -> Result<MulticastHandler> {
        let media = self
            .medias
            .get(media_idx)
            .ok_or(Error::UnknownPayloadType(0))?;
        let mut slot = media.multicast.lock();
        if let Some(handler) = slot.as_ref() {
            return Ok(handler.clone());
        }
        let server = self.server.upgrade().ok_or(Error::Terminated)?;
        let handler = server.allocate_multicast_handler()?;
        *slot = Some(handler.clone());
        Ok(handler)
    }

    /// Encrypts (when needed) and fans one RTCP payload out.
    fn broadcast_rtcp(&self, media_idx: usize, payload: &[u8]) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(media) = self.medias.get(media_idx) else {
            return;
        };
        let payload = match &media.srtp_out {
            Some(ctx) => match ctx.encrypt_rtcp(payload) {
                Ok(p) => p,
                Err(e) => {
                    trace!("outbound SRTCP encryption failed: {e}");
                    return;
                }
            },
            None => Bytes::copy_from_slice(payload),
        };
        self.fan_out(media_idx, &payload, false);
    }

    fn fan_out(&self, media_idx: usize, payload: &Bytes, is_rtp: bool) {
        for sink in self.readers.lock().values() {
            if is_rtp {
                sink.enqueue_rtp(media_idx, payload.clone());
            } else {
                sink.enqueue_rtcp(media_idx, payload.clone());
            }
        }
        if let Some(handler) = self.medias[media_idx].multicast.lock().clone() {
            let payload = payload.clone();
            tokio::spawn(async move {
                if is_rtp {
                    handler.write_rtp(&payload).await;
                } else {
                    handler.write_rtcp(&payload).await;
                }
            });
        }
    }
}
