use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sdp::description::common::Attribute;
use sdp::description::media::{MediaDescription, MediaName, RangedPort};
use url::Url;

use super::format::{Format, GenericFormat};
use crate::error::{Error, Result};
use crate::headers::Profile;

/// Media kind from the SDP m-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Application,
    Other(String),
}

impl MediaType {
    pub fn as_str(&self) -> &str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Application => "application",
            MediaType::Other(s) => s,
        }
    }
}

impl From<&str> for MediaType {
    fn from(s: &str) -> Self {
        match s {
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            "application" => MediaType::Application,
            other => MediaType::Other(other.to_string()),
        }
    }
}

/// One media of a stream description.
#[derive(Debug, Clone)]
pub struct Media {
    pub media_type: MediaType,
    /// Control attribute, relative or absolute.
    pub control: Option<String>,
    /// AVP or SAVP.
    pub profile: Profile,
    /// Data flows client → server during PLAY (intercom).
    pub is_back_channel: bool,
    /// MIKEY message advertised through `a=key-mgmt`.
    pub key_mgmt_mikey: Option<Vec<u8>>,
    pub formats: Vec<Arc<dyn Format>>,
}

fn attr<'a>(md: &'a MediaDescription, key: &str) -> Option<&'a str> {
    md.attributes
        .iter()
        .find(|a| a.key == key)
        .and_then(|a| a.value.as_deref())
}

fn has_attr(md: &MediaDescription, key: &str) -> bool {
    md.attributes.iter().any(|a| a.key == key)
}

impl Media {
    /// Builds a media from an SDP media description.
    pub fn unmarshal(md: &MediaDescription) -> Result<Media> {
        let proto = md.media_name.protos.join("/");
        let profile = match proto.as_str() {
            "RTP/AVP" => Profile::Avp,
            "RTP/SAVP" => Profile::Savp,
            other => {
                return Err(Error::InvalidSdp(format!(
                    "unsupported media protocol '{other}'"
                )))
            }
        };

        let mut formats: Vec<Arc<dyn Format>> = Vec::new();
        for fmt in &md.media_name.formats {
            let pt: u8 = fmt
                .parse()
                .map_err(|_| Error::InvalidSdp(format!("invalid payload type '{fmt}'")))?;
            if formats.iter().any(|f| f.payload_type() == pt) {
                return Err(Error::InvalidSdp(format!("duplicate payload type {pt}")));
            }
            let pt_prefix = format!("{pt} ");
            let rtpmap = md
                .attributes
                .iter()
                .filter(|a| a.key == "rtpmap")
                .filter_map(|a| a.value.as_deref())
                .find_map(|v| v.strip_prefix(&pt_prefix));
            let fmtp = md
                .attributes
                .iter()
                .filter(|a| a.key == "fmtp")
                .filter_map(|a| a.value.as_deref())
                .find_map(|v| v.strip_prefix(&pt_prefix));
            formats.push(Arc::new(GenericFormat::from_sdp(pt, rtpmap, fmtp)?));
        }
        if formats.is_empty() {
            return Err(Error::InvalidSdp("media without formats".into()));
        }

        let key_mgmt_mikey = match attr(md, "key-mgmt") {
            Some(v) => {
                let data = v.strip_prefix("mikey ").ok_or_else(|| {
                    Error::InvalidSdp(format!("unsupported key-mgmt '{v}'"))
                })?;
                Some(BASE64.decode(data.as_bytes()).map_err(|e| {
                    Error::InvalidSdp(format!("invalid key-mgmt data: {e}"))
                })?)
            }
            None => None,
        };

        Ok(Media {
            media_type: MediaType::from(md.media_name.media.as_str()),
            control: attr(md, "control").map(str::to_string),
            profile,
            is_back_channel: has_attr(md, "sendonly"),
            key_mgmt_mikey,
            formats,
        })
    }

    /// Emits the media as an SDP media description.
    pub fn marshal(&self) -> MediaDescription {
        let mut attributes = Vec::new();
        if let Some(control) = &self.control {
            attributes.push(Attribute::new("control".to_string(), Some(control.clone())));
        }
        if self.is_back_channel {
            attributes.push(Attribute {
                key: "sendonly".to_string(),
                value: None,
            });
        }
        if let Some(mikey) = &self.key_mgmt_mikey {
            attributes.push(Attribute::new(
                "key-mgmt".to_string(),
                Some(format!("mikey {}", BASE64.encode(mikey))),
            ));
        }
        let mut formats = Vec::new();
        for f in &self.formats {
            formats.push(f.payload_type().to_string());
            let rtpmap = match f.channels() {
                Some(ch) => format!(
                    "{} {}/{}/{ch}",
                    f.payload_type(),
                    f.codec_name(),
                    f.clock_rate()
                ),
                None => format!("{} {}/{}", f.payload_type(), f.codec_name(), f.clock_rate()),
            };
            attributes.push(Attribute::new("rtpmap".to_string(), Some(rtpmap)));
            if let Some(fmtp) = f.fmtp() {
                attributes.push(Attribute::new(
                    "fmtp".to_string(),
                    Some(format!("{} {fmtp}", f.payload_type())),
                ));
            }
        }

        MediaDescription {
            media_name: MediaName {
                media: self.media_type.as_str().to_string(),
                port: RangedPort {
                    value: 0,
                    range: None,
                },
                protos: match self.profile {
                    Profile::Avp => vec!["RTP".to_string(), "AVP".to_string()],
                    Profile::Savp => vec!["RTP".to_string(), "SAVP".to_string()],
                },
                formats,
            },
            media_title: None,
            connection_information: None,
            bandwidth: vec![],
            encryption_key: None,
            attributes,
        }
    }

    /// Resolves the control attribute against a base URL.
    ///
    /// An absolute control is returned as-is; `*` or a missing control
    /// yields the base; a relative control is appended as a path segment.
    pub fn control_url(&self, base: &Url) -> Result<Url> {
        let control = match self.control.as_deref() {
            None | Some("*") | Some("") => return Ok(base.clone()),
            Some(c) => c,
        };
        if control.starts_with("rtsp://") || control.starts_with("rtsps://") {
            return Url::parse(control)
                .map_err(|e| Error::InvalidSdp(format!("invalid control URL '{control}': {e}")));
        }
        let mut s = base.as_str().trim_end_matches('/').to_string();
        s.push('/');
        s.push_str(control);
        Url::parse(&s).map_err(|e| Error::InvalidSdp(format!("invalid control URL '{s}': {e}")))
    }

    /// Looks up a format by payload type.
    pub fn find_format(&self, payload_type: u8) -> Option<&Arc<dyn Format>> {
        self.formats.iter().find(|f| f.payload_type() == payload_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_media() -> Media {
        Media {
            media_type: MediaType::Video,
            control: Some("trackID=0".into()),
            profile: Profile::Avp,
            is_back_channel: false,
            key_mgmt_mikey: None,
            formats: vec![Arc::new(
                GenericFormat::from_sdp(96, Some("H264/90000"), Some("packetization-mode=1"))
                    .unwrap(),
            )],
        }
    }

    #[test]
    fn marshal_unmarshal() {
        let media = h264_media();
        let md = media.marshal();
        assert_eq!(md.media_name.media, "video");
        assert_eq!(md.media_name.formats, vec!["96"]);

        let back = Media::unmarshal(&md).unwrap();
        assert_eq!(back.media_type, MediaType::Video);
        assert_eq!(back.control.as_deref(), Some("trackID=0"));
        assert_eq!(back.formats.len(), 1);
        assert_eq!(back.formats[0].clock_rate(), 90000);
        assert_eq!(back.formats[0].fmtp(), Some("packetization-mode=1"));
    }

    #[test]
    fn control_resolution() {
        let media = h264_media();
        let base = Url::parse("rtsp://localhost:8554/teststream").unwrap();
        assert_eq!(
            media.control_url(&base).unwrap().as_str(),
            "rtsp://localhost:8554/teststream/trackID=0"
        );

        let mut absolute = h264_media();
        absolute.control = Some("rtsp://other/stream/video".into());
        assert_eq!(
            absolute.control_url(&base).unwrap().as_str(),
            "rtsp://other/stream/video"
        );

        let mut star = h264_media();
        star.control = Some("*".into());
        assert_eq!(star.control_url(&base).unwrap(), base);
    }

    #[test]
    fn duplicate_payload_types_rejected() {
        let mut md = h264_media().marshal();
        md.media_name.formats = vec!["96".into(), "96".into()];
        assert!(matches!(Media::unmarshal(&md), Err(Error::InvalidSdp(_))));
    }

    #[test]
    fn back_channel_round_trip() {
        let mut media = h264_media();
        media.is_back_channel = true;
        let back = Media::unmarshal(&media.marshal()).unwrap();
        assert!(back.is_back_channel);
    }
}
