use std::time::Duration;

use crate::error::{Error, Result};

/// Range header restricted to the NPT (normal play time) form, the only one
/// live tooling uses.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    /// Playback start offset.
    pub start: Duration,
    /// Playback end offset, open-ended when absent.
    pub end: Option<Duration>,
}

impl Range {
    /// The conventional "play from the live edge" range.
    pub fn live() -> Self {
        Self {
            start: Duration::ZERO,
            end: None,
        }
    }

    fn parse_npt_value(s: &str) -> Result<Duration> {
        // "now" appears in live requests; it maps to the zero offset.
        if s == "now" {
            return Ok(Duration::ZERO);
        }
        let secs: f64 = s
            .parse()
            .map_err(|_| Error::MalformedMessage(format!("invalid NPT value '{s}'")))?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(Error::MalformedMessage(format!("invalid NPT value '{s}'")));
        }
        Ok(Duration::from_secs_f64(secs))
    }

    pub fn parse(value: &str) -> Result<Range> {
        let npt = value
            .strip_prefix("npt=")
            .ok_or_else(|| Error::MalformedMessage(format!("unsupported range '{value}'")))?;
        let (start, end) = npt
            .split_once('-')
            .ok_or_else(|| Error::MalformedMessage(format!("invalid range '{value}'")))?;
        Ok(Range {
            start: Self::parse_npt_value(start)?,
            end: if end.is_empty() {
                None
            } else {
                Some(Self::parse_npt_value(end)?)
            },
        })
    }

    pub fn encode(&self) -> String {
        let start = self.start.as_secs_f64();
        match self.end {
            Some(end) => format!("npt={:.3}-{:.3}", start, end.as_secs_f64()),
            None => format!("npt={start:.3}-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_ended() {
        let r = Range::parse("npt=0.000-").unwrap();
        assert_eq!(r.start, Duration::ZERO);
        assert_eq!(r.end, None);
        assert_eq!(r.encode(), "npt=0.000-");
    }

    #[test]
    fn bounded() {
        let r = Range::parse("npt=1.5-20").unwrap();
        assert_eq!(r.start, Duration::from_millis(1500));
        assert_eq!(r.end, Some(Duration::from_secs(20)));
    }

    #[test]
    fn now_is_live_edge() {
        let r = Range::parse("npt=now-").unwrap();
        assert_eq!(r.start, Duration::ZERO);
    }

    #[test]
    fn non_npt_rejected() {
        assert!(Range::parse("clock=19961108T143720Z-").is_err());
        assert!(Range::parse("npt=-5-").is_err());
    }
}
