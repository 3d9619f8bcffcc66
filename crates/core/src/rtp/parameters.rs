//! Codec selection and consumer parameter derivation (spec §4.10).

use std::collections::HashMap;

/// Preference order for primary codec selection (spec §4.9 "Codec
/// selection"). Resilience codecs never appear here; they ride along with
/// whichever primary codec they anchor to via `apt=`.
pub const CODEC_PREFERENCE: &[&str] = &["VP8", "VP9", "H264", "AV1", "opus"];

/// Excluded from primary codec selection; carried only as an RTX/FEC twin
/// of a chosen primary codec (spec §4.9).
pub const RESILIENT_CODECS: &[&str] = &["rtx", "red", "ulpfec"];

/// Header extension URIs the negotiator recognizes (spec §4.9 "Extension
/// ids"). Order is not meaningful; unknown URIs are ignored.
pub const RECOGNIZED_EXTENSIONS: &[&str] = &[
    "urn:ietf:params:rtp-hdrext:sdes:mid",
    "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
    "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
    "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
    "urn:ietf:params:rtp-hdrext:toffset",
    "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay",
    "http://www.webrtc.org/experiments/rtp-hdrext/abs-capture-time",
    "http://www.webrtc.org/experiments/rtp-hdrext/frame-marking",
    "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
    "urn:3gpp:video-orientation",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Codec {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub fmtp: HashMap<String, String>,
    pub rtcp_fbs: Vec<String>,
    /// Payload type of the RTX twin anchored to this codec via `apt=`, if
    /// the offer included one (spec §4.9).
    pub rtx_payload_type: Option<u8>,
    pub dtx: bool,
}

impl Codec {
    /// The unqualified codec name, e.g. `"VP8"` from `"video/VP8"`.
    pub fn name(&self) -> &str {
        self.mime_type.rsplit('/').next().unwrap_or(&self.mime_type)
    }

    pub fn is_resilient(&self) -> bool {
        RESILIENT_CODECS.iter().any(|c| c.eq_ignore_ascii_case(self.name()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    pub uri: String,
    pub id: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Encoding {
    pub rid: Option<String>,
    pub ssrc: Option<u32>,
    pub rtx_ssrc: Option<u32>,
    pub scalability_mode: Option<String>,
    pub dtx: bool,
    pub max_bitrate: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtpParameters {
    pub codecs: Vec<Codec>,
    pub header_extensions: Vec<HeaderExtension>,
    pub encodings: Vec<Encoding>,
    pub rtcp_cname: Option<String>,
    /// Seed used when allocating consumer-side SSRCs mirroring this
    /// producer (spec §3 Producer).
    pub ssrc_seed: u32,
}

impl RtpParameters {
    pub fn extension_id(&self, uri: &str) -> Option<u8> {
        self.header_extensions.iter().find(|e| e.uri == uri).map(|e| e.id)
    }

    pub fn has_extension(&self, uri: &str) -> bool {
        self.extension_id(uri).is_some()
    }
}

const TWCC_URI: &str = "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";

/// Picks the next preferred codec from `CODEC_PREFERENCE` not yet chosen,
/// intersected with what the offer actually provided (spec §4.9 "Codec
/// selection"). Returns the primary codec plus its RTX twin, if any.
pub fn select_primary_codecs(offered: &[Codec]) -> Vec<Codec> {
    let mut chosen = Vec::new();
    for preferred in CODEC_PREFERENCE {
        if let Some(primary) = offered
            .iter()
            .find(|c| !c.is_resilient() && c.name().eq_ignore_ascii_case(preferred))
        {
            chosen.push(primary.clone());
            if let Some(apt) = primary.rtx_payload_type {
                if let Some(rtx) = offered.iter().find(|c| c.payload_type == apt) {
                    chosen.push(rtx.clone());
                }
            }
        }
    }
    chosen
}

/// Derives consumer-side parameters from a producer's parameters and the
/// local capability set (spec §4.10 `consumer_params`).
pub fn consumer_params(producer: &RtpParameters, capability: &RtpParameters) -> RtpParameters {
    // 1. Copy codecs present in both, keeping each kept codec's RTX twin.
    let mut codecs = Vec::new();
    for codec in &producer.codecs {
        if codec.is_resilient() {
            continue;
        }
        if capability.codecs.iter().any(|c| c.mime_type.eq_ignore_ascii_case(&codec.mime_type)) {
            codecs.push(codec.clone());
            if let Some(apt) = codec.rtx_payload_type {
                if let Some(rtx) = producer.codecs.iter().find(|c| c.payload_type == apt) {
                    codecs.push(rtx.clone());
                }
            }
        }
    }

    // 2. Copy shared header extensions; prune feedback lines by available
    //    congestion-control signal.
    let header_extensions: Vec<HeaderExtension> = producer
        .header_extensions
        .iter()
        .filter(|e| capability.header_extensions.iter().any(|c| c.uri == e.uri))
        .cloned()
        .collect();

    let has_twcc = header_extensions.iter().any(|e| e.uri == TWCC_URI);
    let has_abs_send_time = header_extensions.iter().any(|e| e.uri == ABS_SEND_TIME_URI);

    for codec in &mut codecs {
        codec.rtcp_fbs.retain(|fb| {
            if has_twcc {
                fb != "goog-remb"
            } else if has_abs_send_time {
                fb != "transport-cc"
            } else {
                fb != "goog-remb" && fb != "transport-cc"
            }
        });
    }

    // 3. One consumer-side encoding derived from the producer's seed.
    let ssrc = producer.ssrc_seed;
    let has_rtx = codecs.iter().any(|c| c.rtx_payload_type.is_some());
    let max_bitrate = producer.encodings.iter().filter_map(|e| e.max_bitrate).max();

    let scalability_mode = if producer.encodings.len() > 1 {
        let temporal = producer.encodings[0]
            .scalability_mode
            .as_deref()
            .and_then(parse_temporal_layers)
            .unwrap_or(1);
        Some(format!("L{}T{}", producer.encodings.len(), temporal))
    } else {
        producer.encodings.first().and_then(|e| e.scalability_mode.clone())
    };

    let encoding = Encoding {
        rid: None,
        ssrc: Some(ssrc),
        rtx_ssrc: has_rtx.then_some(ssrc.wrapping_add(1)),
        scalability_mode,
        dtx: producer.encodings.first().map(|e| e.dtx).unwrap_or(false),
        max_bitrate,
    };

    RtpParameters {
        codecs,
        header_extensions,
        encodings: vec![encoding],
        rtcp_cname: producer.rtcp_cname.clone(),
        ssrc_seed: 0,
    }
}

/// Parses the temporal layer count out of a scalability mode string like
/// `"L1T3"`, used to mangle a simulcast producer's mode into
/// `"L<nLayers>T<temporal>"` on the consumer side (spec §4.10, §8
/// scenario 5).
fn parse_temporal_layers(mode: &str) -> Option<u32> {
    let t_pos = mode.find('T')?;
    mode[t_pos + 1..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(name: &str, pt: u8) -> Codec {
        Codec {
            mime_type: format!("video/{name}"),
            payload_type: pt,
            clock_rate: 90000,
            channels: None,
            fmtp: HashMap::new(),
            rtcp_fbs: vec!["nack".to_string(), "goog-remb".to_string(), "transport-cc".to_string()],
            rtx_payload_type: None,
            dtx: false,
        }
    }

    #[test]
    fn selects_earliest_preference_with_rtx_twin() {
        let mut vp8 = codec("VP8", 96);
        vp8.rtx_payload_type = Some(97);
        let mut rtx = codec("rtx", 97);
        rtx.mime_type = "video/rtx".to_string();
        let h264 = codec("H264", 98);

        let chosen = select_primary_codecs(&[h264, vp8.clone(), rtx.clone()]);
        assert_eq!(chosen[0].name(), "VP8");
        assert_eq!(chosen[1].name(), "rtx");
    }

    #[test]
    fn consumer_params_prunes_remb_when_twcc_available() {
        let mut producer = RtpParameters::default();
        producer.codecs.push(codec("VP8", 96));
        producer.ssrc_seed = 1000;
        producer.header_extensions.push(HeaderExtension { uri: TWCC_URI.to_string(), id: 3 });

        let mut capability = RtpParameters::default();
        capability.codecs.push(codec("VP8", 96));
        capability.header_extensions.push(HeaderExtension { uri: TWCC_URI.to_string(), id: 3 });

        let params = consumer_params(&producer, &capability);
        assert!(!params.codecs[0].rtcp_fbs.contains(&"goog-remb".to_string()));
        assert!(params.codecs[0].rtcp_fbs.contains(&"transport-cc".to_string()));
        assert_eq!(params.encodings[0].ssrc, Some(1000));
    }

    #[test]
    fn consumer_params_mangles_simulcast_scalability_mode() {
        let mut producer = RtpParameters::default();
        producer.codecs.push(codec("VP8", 96));
        producer.ssrc_seed = 5000;
        producer.encodings = vec![
            Encoding { scalability_mode: Some("L1T3".to_string()), ..Default::default() },
            Encoding { scalability_mode: Some("L1T3".to_string()), ..Default::default() },
            Encoding { scalability_mode: Some("L1T3".to_string()), ..Default::default() },
        ];

        let mut capability = RtpParameters::default();
        capability.codecs.push(codec("VP8", 96));

        let params = consumer_params(&producer, &capability);
        assert_eq!(params.encodings[0].scalability_mode, Some("L3T3".to_string()));
    }

    #[test]
    fn rtx_twin_is_excluded_from_primary_selection() {
        let rtx = codec("rtx", 97);
        let chosen = select_primary_codecs(&[rtx]);
        assert!(chosen.is_empty());
    }
}
