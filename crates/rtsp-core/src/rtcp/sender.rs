use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use rtcp::sender_report::SenderReport;
use rtp::packet::Packet;
use tokio::task::JoinHandle;
use util::marshal::Marshal;

use super::ntp;
use super::receiver::RtcpWriteFn;

/// Snapshot of the transmission state, used for `RTP-Info` and the SETUP
/// `ssrc` hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderStats {
    /// SSRC outgoing packets carry.
    pub local_ssrc: u32,
    /// Sequence number of the last packet sent.
    pub last_seq: u16,
    /// RTP timestamp of the last timing-safe packet and when it was sent.
    pub last_rtp_time: Option<(u32, SystemTime)>,
    pub packet_count: u32,
    pub octet_count: u32,
}

struct State {
    sent_any: bool,
    last_seq: u16,
    /// `(rtp timestamp, wall clock)` of the last packet whose PTS equals
    /// its DTS; the anchor for NTP/RTP mapping in Sender Reports.
    last_rtp_time: Option<(u32, SystemTime)>,
    packet_count: u32,
    octet_count: u32,
}

struct Inner {
    clock_rate: u32,
    local_ssrc: u32,
    state: Mutex<State>,
    write: RtcpWriteFn,
}

/// Per-format transmission statistics and periodic Sender Report emission.
pub struct RtcpSender {
    inner: Arc<Inner>,
    task: JoinHandle<()>,
}

impl RtcpSender {
    /// Creates the sender with a random stable SSRC and starts its report
    /// timer.
    pub fn new(clock_rate: u32, period: Duration, write: RtcpWriteFn) -> Self {
        Self::with_ssrc(rand::thread_rng().gen(), clock_rate, period, write)
    }

    pub fn with_ssrc(
        local_ssrc: u32,
        clock_rate: u32,
        period: Duration,
        write: RtcpWriteFn,
    ) -> Self {
        let inner = Arc::new(Inner {
            clock_rate,
            local_ssrc,
            state: Mutex::new(State {
                sent_any: false,
                last_seq: 0,
                last_rtp_time: None,
                packet_count: 0,
                octet_count: 0,
            }),
            write,
        });

        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(report) = task_inner.build_report(SystemTime::now()) {
                    (task_inner.write)(report);
                }
            }
        });

        Self { inner, task }
    }

    /// SSRC outgoing packets of this format must carry.
    pub fn ssrc(&self) -> u32 {
        self.inner.local_ssrc
    }

    /// Accounts one outbound RTP packet.
    pub fn process_rtp(&self, pkt: &Packet, now: SystemTime, pts_equals_dts: bool) {
        let mut st = self.inner.state.lock();
        st.sent_any = true;
        st.last_seq = pkt.header.sequence_number;
        if pts_equals_dts {
            st.last_rtp_time = Some((pkt.header.timestamp, now));
        }
        st.packet_count = st.packet_count.wrapping_add(1);
        st.octet_count = st.octet_count.wrapping_add(pkt.payload.len() as u32);
    }

    /// Current transmission state; `None` before the first packet.
    pub fn stats(&self) -> Option<SenderStats> {
        let st = self.inner.state.lock();
        if !st.sent_any {
            return None;
        }
        Some(SenderStats {
            local_ssrc: self.inner.local_ssrc,
            last_seq: st.last_seq,
            last_rtp_time: st.last_rtp_time,
            packet_count: st.packet_count,
            octet_count: st.octet_count,
        })
    }

    /// RTP timestamp corresponding to `now`, extrapolated from the last
    /// timing anchor at this format's clock rate.
    pub fn rtp_time_now(&self, now: SystemTime) -> Option<u32> {
        let st = self.inner.state.lock();
        let (ts, at) = st.last_rtp_time?;
        let elapsed = now.duration_since(at).unwrap_or(Duration::ZERO);
        let delta = (elapsed.as_secs_f64() * f64::from(self.inner.clock_rate)) as u32;
        Some(ts.wrapping_add(delta))
    }

    /// Stops the report timer.
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Inner {
    fn build_report(&self, now: SystemTime) -> Option<Bytes> {
        let st = self.state.lock();
        if !st.sent_any {
            return None;
        }
        let (rtp_time, anchor) = st.last_rtp_time?;
        let elapsed = now.duration_since(anchor).unwrap_or(Duration::ZERO);
        let rtp_now =
            rtp_time.wrapping_add((elapsed.as_secs_f64() * f64::from(self.clock_rate)) as u32);

        let report = SenderReport {
            ssrc: self.local_ssrc,
            ntp_time: ntp::to_ntp(now),
            rtp_time: rtp_now,
            packet_count: st.packet_count,
            octet_count: st.octet_count,
            ..Default::default()
        };
        drop(st);

        report.marshal().ok()
    }
}

impl Drop for RtcpSender {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use util::marshal::Unmarshal;

    fn rtp_pkt(seq: u16, ts: u32) -> Packet {
        let mut p = Packet::default();
        p.header.version = 2;
        p.header.sequence_number = seq;
        p.header.timestamp = ts;
        p.payload = Bytes::from_static(&[0u8; 100]);
        p
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let sender = RtcpSender::with_ssrc(
            0xCAFE_F00D,
            90000,
            Duration::from_secs(60),
            Arc::new(|_| {}),
        );
        assert!(sender.stats().is_none());
        let now = SystemTime::now();
        sender.process_rtp(&rtp_pkt(556, 984512368), now, true);
        sender.process_rtp(&rtp_pkt(557, 984515368), now, true);

        let stats = sender.stats().unwrap();
        assert_eq!(stats.local_ssrc, 0xCAFE_F00D);
        assert_eq!(stats.last_seq, 557);
        assert_eq!(stats.packet_count, 2);
        assert_eq!(stats.octet_count, 200);
        sender.close();
    }

    #[tokio::test]
    async fn timing_anchor_only_from_timing_safe_packets() {
        let sender =
            RtcpSender::with_ssrc(1, 90000, Duration::from_secs(60), Arc::new(|_| {}));
        let now = SystemTime::now();
        sender.process_rtp(&rtp_pkt(1, 1000), now, false);
        assert_eq!(sender.stats().unwrap().last_rtp_time, None);
        sender.process_rtp(&rtp_pkt(2, 2000), now, true);
        assert_eq!(
            sender.stats().unwrap().last_rtp_time.map(|(ts, _)| ts),
            Some(2000)
        );
        sender.close();
    }

    #[tokio::test(start_paused = true)]
    async fn emits_periodic_sender_reports() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = RtcpSender::with_ssrc(
            0x0A0B_0C0D,
            90000,
            Duration::from_secs(1),
            Arc::new(move |b| {
                let _ = tx.send(b);
            }),
        );
        sender.process_rtp(&rtp_pkt(10, 90000), SystemTime::now(), true);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let raw = rx.recv().await.unwrap();
        let mut buf = &raw[..];
        let sr = SenderReport::unmarshal(&mut buf).unwrap();
        assert_eq!(sr.ssrc, 0x0A0B_0C0D);
        assert_eq!(sr.packet_count, 1);
        assert_eq!(sr.octet_count, 100);
        assert!(sr.ntp_time > 0);
        sender.close();
    }
}
