//! Sliding-window RTP reordering.
//!
//! UDP delivery reorders and duplicates packets; each format of a
//! receiving session runs one of these to restore sequence order and to
//! surface unfillable gaps as losses. Progress is driven purely by
//! arriving packets; there is no timer.

use std::collections::BTreeMap;

use rtp::packet::Packet;

/// Sliding window size, in sequence numbers.
const WINDOW: u64 = 64;

/// Per-format RTP reorderer.
pub struct Reorderer {
    initialized: bool,
    /// Extended sequence number of the next packet to release.
    next: u64,
    /// Buffered out-of-order packets by extended sequence number.
    buffer: BTreeMap<u64, Packet>,
}

impl Default for Reorderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Reorderer {
    pub fn new() -> Self {
        Self {
            initialized: false,
            next: 0,
            buffer: BTreeMap::new(),
        }
    }

    /// Feeds one packet; returns the packets released in order and the
    /// number of packets declared lost by this step.
    pub fn process(&mut self, pkt: Packet) -> (Vec<Packet>, u64) {
        let seq = pkt.header.sequence_number;
        let mut out = Vec::new();

        if !self.initialized {
            // The first packet seen sets the baseline.
            self.initialized = true;
            self.next = u64::from(seq) + 1;
            out.push(pkt);
            return (out, 0);
        }

        let expected = (self.next & 0xFFFF) as u16;
        let delta = seq.wrapping_sub(expected);
        if delta >= 0x8000 {
            // Before the window: duplicate of an already released packet.
            return (out, 0);
        }
        let abs = self.next + u64::from(delta);

        if abs == self.next {
            out.push(pkt);
            self.next += 1;
        } else if self.buffer.contains_key(&abs) {
            // Duplicate of a buffered packet.
            return (out, 0);
        } else {
            self.buffer.insert(abs, pkt);
        }

        // Slide the window when the newest packet pushed it forward,
        // declaring unfilled positions lost.
        let mut lost = 0;
        if let Some((&max, _)) = self.buffer.iter().next_back() {
            while max >= self.next + WINDOW {
                match self.buffer.remove(&self.next) {
                    Some(p) => out.push(p),
                    None => lost += 1,
                }
                self.next += 1;
            }
        }

        // Release whatever is now consecutive.
        while let Some(p) = self.buffer.remove(&self.next) {
            out.push(p);
            self.next += 1;
        }

        (out, lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(seq: u16) -> Packet {
        let mut p = Packet::default();
        p.header.version = 2;
        p.header.sequence_number = seq;
        p
    }

    fn seqs(packets: &[Packet]) -> Vec<u16> {
        packets.iter().map(|p| p.header.sequence_number).collect()
    }

    #[test]
    fn in_order_passthrough() {
        let mut r = Reorderer::new();
        for seq in [100u16, 101, 102] {
            let (out, lost) = r.process(pkt(seq));
            assert_eq!(seqs(&out), vec![seq]);
            assert_eq!(lost, 0);
        }
    }

    #[test]
    fn reorders_within_window() {
        let mut r = Reorderer::new();
        assert_eq!(seqs(&r.process(pkt(10)).0), vec![10]);
        assert_eq!(seqs(&r.process(pkt(12)).0), Vec::<u16>::new());
        let (out, lost) = r.process(pkt(11));
        assert_eq!(seqs(&out), vec![11, 12]);
        assert_eq!(lost, 0);
    }

    #[test]
    fn duplicates_dropped() {
        let mut r = Reorderer::new();
        r.process(pkt(5));
        r.process(pkt(7));
        assert_eq!(seqs(&r.process(pkt(7)).0), Vec::<u16>::new());
        assert_eq!(seqs(&r.process(pkt(5)).0), Vec::<u16>::new());
        assert_eq!(seqs(&r.process(pkt(6)).0), vec![6, 7]);
    }

    #[test]
    fn gap_reported_after_window_slides() {
        let mut r = Reorderer::new();
        r.process(pkt(0));
        // 1 never arrives; 2..=64 buffered fills the window.
        for seq in 2..=64u16 {
            let (out, lost) = r.process(pkt(seq));
            assert!(out.is_empty());
            assert_eq!(lost, 0);
        }
        // 65 forces the window past the gap.
        let (out, lost) = r.process(pkt(65));
        assert_eq!(lost, 1);
        assert_eq!(out.first().map(|p| p.header.sequence_number), Some(2));
        assert_eq!(out.last().map(|p| p.header.sequence_number), Some(65));
        assert_eq!(out.len(), 64);
    }

    #[test]
    fn sequence_wraparound() {
        let mut r = Reorderer::new();
        assert_eq!(seqs(&r.process(pkt(65534)).0), vec![65534]);
        assert_eq!(seqs(&r.process(pkt(65535)).0), vec![65535]);
        assert_eq!(seqs(&r.process(pkt(0)).0), vec![0]);
        assert_eq!(seqs(&r.process(pkt(1)).0), vec![1]);
    }

    #[test]
    fn old_packet_ignored() {
        let mut r = Reorderer::new();
        r.process(pkt(1000));
        r.process(pkt(1001));
        let (out, lost) = r.process(pkt(990));
        assert!(out.is_empty());
        assert_eq!(lost, 0);
    }
}
