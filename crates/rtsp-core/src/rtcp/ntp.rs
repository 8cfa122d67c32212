//! NTP timestamp conversions (RFC 3550 §4).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the UNIX epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Converts a system time to the 64-bit NTP format.
pub fn to_ntp(t: SystemTime) -> u64 {
    let since_unix = t
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = (u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Middle 32 bits of an NTP timestamp, as carried in the LSR field of a
/// reception report.
pub fn middle_32(ntp: u64) -> u32 {
    ((ntp >> 16) & 0xFFFF_FFFF) as u32
}

/// Converts a duration to 1/65536-second units (the DLSR field).
pub fn to_fraction_16(d: Duration) -> u32 {
    (d.as_secs_f64() * 65536.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_offset() {
        let ntp = to_ntp(UNIX_EPOCH);
        assert_eq!(ntp >> 32, NTP_UNIX_OFFSET);
        assert_eq!(ntp & 0xFFFF_FFFF, 0);
    }

    #[test]
    fn fractional_part() {
        let t = UNIX_EPOCH + Duration::from_millis(500);
        let ntp = to_ntp(t);
        let frac = ntp & 0xFFFF_FFFF;
        // Half a second is 2^31 in NTP fraction units.
        assert!((frac as i64 - (1i64 << 31)).abs() < 1 << 16);
    }

    #[test]
    fn middle_bits() {
        let ntp = 0x1122_3344_5566_7788u64;
        assert_eq!(middle_32(ntp), 0x3344_5566);
    }

    #[test]
    fn dlsr_units() {
        assert_eq!(to_fraction_16(Duration::from_secs(1)), 65536);
        assert_eq!(to_fraction_16(Duration::from_millis(500)), 32768);
    }
}
