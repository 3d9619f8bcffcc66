//! Producer (inbound RTP origin, spec §3, §4.11).

use qrpc_protocol::MediaPath;

use crate::rtp::parameters::RtpParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerKind {
    Simple,
    Simulcast,
    Pipe,
}

pub struct Producer {
    pub id: String,
    pub media_path: MediaPath,
    pub rtp_parameters: RtpParameters,
    /// Live inbound SSRCs, one per encoding (more than one for simulcast).
    pub rtp_streams: Vec<u32>,
    pub kind: ProducerKind,
    pub closed: bool,
}

impl Producer {
    /// `"/p/<rtp_id>/<media_path>"` (spec §4.11 "Producer creation").
    pub fn make_id(rtp_id: &str, media_path: &MediaPath) -> String {
        format!("/p/{rtp_id}/{media_path}")
    }

    pub fn new(rtp_id: &str, media_path: MediaPath, rtp_parameters: RtpParameters) -> Self {
        let kind = if rtp_parameters.encodings.len() > 1 {
            ProducerKind::Simulcast
        } else {
            ProducerKind::Simple
        };
        let rtp_streams = rtp_parameters.encodings.iter().filter_map(|e| e.ssrc).collect();
        Self {
            id: Self::make_id(rtp_id, &media_path),
            media_path,
            rtp_parameters,
            rtp_streams,
            kind,
            closed: false,
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrpc_protocol::media_path::MediaKind;

    #[test]
    fn id_is_namespaced_by_rtp_id_and_media_path() {
        let path = MediaPath::new("peer-1", "cam0", MediaKind::Video);
        assert_eq!(Producer::make_id("abc123", &path), "/p/abc123/peer-1/cam0/video");
    }

    #[test]
    fn multiple_encodings_mark_the_producer_as_simulcast() {
        let mut params = RtpParameters::default();
        params.encodings = vec![Default::default(), Default::default()];
        let path = MediaPath::new("peer-1", "cam0", MediaKind::Video);
        let producer = Producer::new("abc", path, params);
        assert_eq!(producer.kind, ProducerKind::Simulcast);
    }
}
