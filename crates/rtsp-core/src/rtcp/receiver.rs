use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtp::packet::Packet;
use tokio::task::JoinHandle;
use util::marshal::Marshal;

use super::ntp;

/// Callback that transmits a marshalled RTCP packet.
pub type RtcpWriteFn = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Snapshot of the reception state, used by the session to bind inbound
/// SSRCs to formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStats {
    /// SSRC the sender is using.
    pub remote_ssrc: u32,
    /// SSRC our reports are sent with.
    pub local_ssrc: u32,
    /// Highest sequence number received.
    pub last_seq: u16,
    /// Total RTP packets received.
    pub packets_received: u64,
    /// Cumulative packets lost.
    pub packets_lost: u64,
}

struct State {
    remote_ssrc: Option<u32>,
    // Sequence tracking (RFC 3550 §A.1).
    first_seq: Option<u16>,
    last_seq: u16,
    seq_cycles: u16,
    packets_received: u64,
    // Interval counters for fraction-lost.
    expected_prior: u64,
    received_prior: u64,
    // Interarrival jitter (§A.8), in clock-rate units, scaled by 16.
    transit: Option<i64>,
    jitter: f64,
    // Last Sender Report.
    last_sr_ntp_middle: Option<u32>,
    last_sr_received: Option<Instant>,
}

struct Inner {
    clock_rate: u32,
    local_ssrc: u32,
    started: Instant,
    state: Mutex<State>,
    write: RtcpWriteFn,
}

/// Per-format reception statistics and periodic Receiver Report emission.
pub struct RtcpReceiver {
    inner: Arc<Inner>,
    task: JoinHandle<()>,
}

impl RtcpReceiver {
    /// Creates the receiver and starts its report timer.
    pub fn new(
        clock_rate: u32,
        local_ssrc: u32,
        period: Duration,
        write: RtcpWriteFn,
    ) -> Self {
        let inner = Arc::new(Inner {
            clock_rate,
            local_ssrc,
            started: Instant::now(),
            state: Mutex::new(State {
                remote_ssrc: None,
                first_seq: None,
                last_seq: 0,
                seq_cycles: 0,
                packets_received: 0,
                expected_prior: 0,
                received_prior: 0,
                transit: None,
                jitter: 0.0,
                last_sr_ntp_middle: None,
                last_sr_received: None,
            }),
            write,
        });

        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(report) = task_inner.build_report() {
                    (task_inner.write)(report);
                }
            }
        });

        Self { inner, task }
    }

    /// Feeds one received RTP packet.
    ///
    /// `pts_equals_dts` gates the jitter computation: timestamps of
    /// reordered frames do not measure network jitter.
    pub fn process_rtp(&self, pkt: &Packet, pts_equals_dts: bool) {
        let arrival = self.inner.started.elapsed();
        let mut st = self.inner.state.lock();

        if st.remote_ssrc.is_none() {
            st.remote_ssrc = Some(pkt.header.ssrc);
        }

        let seq = pkt.header.sequence_number;
        match st.first_seq {
            None => {
                st.first_seq = Some(seq);
                st.last_seq = seq;
            }
            Some(_) => {
                let delta = seq.wrapping_sub(st.last_seq);
                if delta != 0 && delta < 0x8000 {
                    if seq < st.last_seq {
                        st.seq_cycles = st.seq_cycles.wrapping_add(1);
                    }
                    st.last_seq = seq;
                }
            }
        }
        st.packets_received += 1;

        if pts_equals_dts {
            let arrival_rtp =
                (arrival.as_secs_f64() * f64::from(self.inner.clock_rate)) as i64;
            let transit = arrival_rtp - i64::from(pkt.header.timestamp);
            if let Some(prev) = st.transit {
                let d = (transit - prev).abs() as f64;
                st.jitter += (d - st.jitter) / 16.0;
            }
            st.transit = Some(transit);
        }
    }

    /// Feeds one received Sender Report.
    pub fn process_sr(&self, sr: &SenderReport) {
        let mut st = self.inner.state.lock();
        st.last_sr_ntp_middle = Some(ntp::middle_32(sr.ntp_time));
        st.last_sr_received = Some(Instant::now());
    }

    /// Current reception state; `None` before the first RTP packet.
    pub fn stats(&self) -> Option<ReceiverStats> {
        let st = self.inner.state.lock();
        let remote_ssrc = st.remote_ssrc?;
        st.first_seq?;
        let expected = self.expected(&st);
        Some(ReceiverStats {
            remote_ssrc,
            local_ssrc: self.inner.local_ssrc,
            last_seq: st.last_seq,
            packets_received: st.packets_received,
            packets_lost: expected.saturating_sub(st.packets_received),
        })
    }

    fn expected(&self, st: &State) -> u64 {
        let Some(first) = st.first_seq else { return 0 };
        let extended = (u64::from(st.seq_cycles) << 16) | u64::from(st.last_seq);
        extended.saturating_sub(u64::from(first)) + 1
    }

    /// Stops the report timer.
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Inner {
    fn build_report(&self) -> Option<Bytes> {
        let mut st = self.state.lock();
        let remote_ssrc = st.remote_ssrc?;
        let first_seq = st.first_seq?;

        let extended = (u64::from(st.seq_cycles) << 16) | u64::from(st.last_seq);
        let expected = extended.saturating_sub(u64::from(first_seq)) + 1;
        let lost = expected.saturating_sub(st.packets_received);

        let expected_interval = expected.saturating_sub(st.expected_prior);
        let received_interval = st.packets_received.saturating_sub(st.received_prior);
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 {
            0
        } else {
            ((lost_interval * 256) / expected_interval).min(255) as u8
        };
        st.expected_prior = expected;
        st.received_prior = st.packets_received;

        let (last_sender_report, delay) = match (st.last_sr_ntp_middle, st.last_sr_received) {
            (Some(lsr), Some(at)) => (lsr, ntp::to_fraction_16(at.elapsed())),
            _ => (0, 0),
        };

        let report = ReceiverReport {
            ssrc: self.local_ssrc,
            reports: vec![ReceptionReport {
                ssrc: remote_ssrc,
                fraction_lost,
                total_lost: (lost as u32) & 0x00FF_FFFF,
                last_sequence_number: extended as u32,
                jitter: st.jitter as u32,
                last_sender_report,
                delay,
            }],
            profile_extensions: Bytes::new(),
        };
        drop(st);

        report.marshal().ok()
    }
}

impl Drop for RtcpReceiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use util::marshal::Unmarshal;

    fn rtp_pkt(seq: u16, ts: u32, ssrc: u32) -> Packet {
        let mut p = Packet::default();
        p.header.version = 2;
        p.header.sequence_number = seq;
        p.header.timestamp = ts;
        p.header.ssrc = ssrc;
        p
    }

    #[tokio::test]
    async fn tracks_remote_ssrc_and_sequence() {
        let recv = RtcpReceiver::new(
            90000,
            0x1111_2222,
            Duration::from_secs(60),
            Arc::new(|_| {}),
        );
        assert!(recv.stats().is_none());

        recv.process_rtp(&rtp_pkt(556, 984512368, 0xAABBCCDD), true);
        recv.process_rtp(&rtp_pkt(557, 984512368 + 3000, 0xAABBCCDD), true);
        let stats = recv.stats().unwrap();
        assert_eq!(stats.remote_ssrc, 0xAABBCCDD);
        assert_eq!(stats.local_ssrc, 0x1111_2222);
        assert_eq!(stats.last_seq, 557);
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.packets_lost, 0);
        recv.close();
    }

    #[tokio::test]
    async fn loss_accounting() {
        let recv = RtcpReceiver::new(
            90000,
            1,
            Duration::from_secs(60),
            Arc::new(|_| {}),
        );
        recv.process_rtp(&rtp_pkt(10, 0, 7), true);
        recv.process_rtp(&rtp_pkt(11, 0, 7), true);
        // 12 and 13 lost.
        recv.process_rtp(&rtp_pkt(14, 0, 7), true);
        let stats = recv.stats().unwrap();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 2);
        // received + lost spans the whole sequence range.
        assert_eq!(stats.packets_received + stats.packets_lost, 14 - 10 + 1);
        recv.close();
    }

    #[tokio::test(start_paused = true)]
    async fn emits_periodic_receiver_reports() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recv = RtcpReceiver::new(
            90000,
            0x0101_0101,
            Duration::from_secs(1),
            Arc::new(move |b| {
                let _ = tx.send(b);
            }),
        );
        recv.process_rtp(&rtp_pkt(100, 0, 0x5555_6666), true);
        recv.process_sr(&SenderReport {
            ssrc: 0x5555_6666,
            ntp_time: 0x1122_3344_5566_7788,
            rtp_time: 0,
            packet_count: 1,
            octet_count: 100,
            ..Default::default()
        });

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let raw = rx.recv().await.unwrap();
        let mut buf = &raw[..];
        let rr = ReceiverReport::unmarshal(&mut buf).unwrap();
        assert_eq!(rr.ssrc, 0x0101_0101);
        assert_eq!(rr.reports.len(), 1);
        assert_eq!(rr.reports[0].ssrc, 0x5555_6666);
        assert_eq!(rr.reports[0].last_sequence_number, 100);
        assert_eq!(rr.reports[0].last_sender_report, 0x3344_5566);
        recv.close();
    }
}
