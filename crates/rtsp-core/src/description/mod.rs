//! Stream descriptions: an ordered set of medias with their formats,
//! convertible to and from SDP.
//!
//! SDP syntax itself is handled by the external `sdp` crate; this module
//! only maps between its generic document model and the records the
//! session engine works with, round-tripping what the application supplies.

mod format;
mod media;

pub use format::{Format, GenericFormat};
pub use media::{Media, MediaType};

use std::io::Cursor;
use std::sync::Arc;

use sdp::description::session::{
    Origin, SessionDescription, TimeDescription, Timing,
};
use url::Url;

use crate::error::{Error, Result};

/// A parsed stream description: ordered medias, each with ordered formats.
#[derive(Debug, Clone, Default)]
pub struct Description {
    /// Session title (`s=` line), when meaningful.
    pub title: Option<String>,
    pub medias: Vec<Media>,
}

impl Description {
    /// Parses an SDP document body.
    pub fn unmarshal(body: &str) -> Result<Description> {
        let sd = SessionDescription::unmarshal(&mut Cursor::new(body))
            .map_err(|e| Error::InvalidSdp(e.to_string()))?;
        Self::from_sdp(&sd)
    }

    /// Converts a parsed SDP document.
    pub fn from_sdp(sd: &SessionDescription) -> Result<Description> {
        let medias = sd
            .media_descriptions
            .iter()
            .map(Media::unmarshal)
            .collect::<Result<Vec<_>>>()?;
        if medias.is_empty() {
            return Err(Error::InvalidSdp("no media present".into()));
        }
        let title = Some(sd.session_name.clone()).filter(|s| !s.is_empty() && s != " ");
        Ok(Description { title, medias })
    }

    /// Emits the description as an SDP document.
    ///
    /// The origin/connection lines use the placeholder addresses the
    /// session layer patches before sending (multicast streams advertise
    /// their group address there).
    pub fn marshal(&self) -> SessionDescription {
        SessionDescription {
            version: 0,
            origin: Origin {
                username: "-".to_string(),
                session_id: 0,
                session_version: 0,
                network_type: "IN".to_string(),
                address_type: "IP4".to_string(),
                unicast_address: "0.0.0.0".to_string(),
            },
            session_name: self.title.clone().unwrap_or_else(|| " ".to_string()),
            session_information: None,
            uri: None,
            email_address: None,
            phone_number: None,
            connection_information: None,
            bandwidth: vec![],
            time_descriptions: vec![TimeDescription {
                timing: Timing {
                    start_time: 0,
                    stop_time: 0,
                },
                repeat_times: vec![],
            }],
            time_zones: vec![],
            encryption_key: None,
            attributes: vec![],
            media_descriptions: self.medias.iter().map(Media::marshal).collect(),
        }
    }

    /// Finds the media whose resolved control URL matches `setup_url`.
    ///
    /// A trailing-slash mismatch between the two is tolerated; some
    /// clients fall back to appending one.
    pub fn find_media_by_url(&self, base: &Url, setup_url: &Url) -> Option<usize> {
        let wanted = setup_url.as_str().trim_end_matches('/');
        self.medias.iter().position(|m| {
            m.control_url(base)
                .map(|u| u.as_str().trim_end_matches('/') == wanted)
                .unwrap_or(false)
        })
    }

    /// Looks up a format across all medias by payload type, returning the
    /// media index as well.
    pub fn find_format(&self, payload_type: u8) -> Option<(usize, &Arc<dyn Format>)> {
        self.medias
            .iter()
            .enumerate()
            .find_map(|(i, m)| m.find_format(payload_type).map(|f| (i, f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Profile;

    const TWO_MEDIA_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Stream\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=0\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=control:trackID=1\r\n\
a=rtpmap:97 mpeg4-generic/44100/2\r\n";

    #[test]
    fn unmarshal_two_medias() {
        let desc = Description::unmarshal(TWO_MEDIA_SDP).unwrap();
        assert_eq!(desc.medias.len(), 2);
        assert_eq!(desc.medias[0].media_type, MediaType::Video);
        assert_eq!(desc.medias[1].media_type, MediaType::Audio);
        assert_eq!(desc.medias[0].profile, Profile::Avp);
        assert_eq!(desc.medias[1].formats[0].channels(), Some(2));
    }

    #[test]
    fn marshal_round_trip() {
        let desc = Description::unmarshal(TWO_MEDIA_SDP).unwrap();
        let body = desc.marshal().marshal();
        let back = Description::unmarshal(&body).unwrap();
        assert_eq!(back.medias.len(), 2);
        assert_eq!(back.medias[0].control.as_deref(), Some("trackID=0"));
        assert_eq!(back.medias[1].formats[0].clock_rate(), 44100);
    }

    #[test]
    fn find_media_by_url_with_trailing_slash() {
        let desc = Description::unmarshal(TWO_MEDIA_SDP).unwrap();
        let base = Url::parse("rtsp://localhost:8554/teststream").unwrap();
        let setup = Url::parse("rtsp://localhost:8554/teststream/trackID=1/").unwrap();
        assert_eq!(desc.find_media_by_url(&base, &setup), Some(1));
        let missing = Url::parse("rtsp://localhost:8554/teststream/trackID=9").unwrap();
        assert_eq!(desc.find_media_by_url(&base, &missing), None);
    }

    #[test]
    fn find_format_by_payload_type() {
        let desc = Description::unmarshal(TWO_MEDIA_SDP).unwrap();
        let (idx, fmt) = desc.find_format(97).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(fmt.clock_rate(), 44100);
        assert!(desc.find_format(98).is_none());
    }

    #[test]
    fn empty_sdp_rejected() {
        let res = Description::unmarshal("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns= \r\nt=0 0\r\n");
        assert!(matches!(res, Err(Error::InvalidSdp(_))));
    }
}
