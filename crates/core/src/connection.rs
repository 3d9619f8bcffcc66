//! Connection (spec §4.8): composes the ICE server (§4.5), DTLS transport
//! (§4.6), and SCTP association (§4.7) into the single junction point that
//! serves many labeled streams (§4.13) and many RTP producers/consumers
//! (§4.10, §4.11, §4.12). One `Connection` is owned by exactly one worker
//! thread; every slab here is keyed off that worker's `ThreadId` (spec §4.15).

use std::collections::HashMap;
use std::sync::Arc;

use qrpc_protocol::media_path::MediaKind;
use qrpc_protocol::{CloseReason, MediaPath, ThreadId};
use slotmap::new_key_type;

use crate::dtls::DtlsTransport;
use crate::handler_map::{HandlerEntry, HandlerMap};
use crate::ice::IceServer;
use crate::rtp::consumer::{PROBATOR_MID, PROBATOR_PAYLOAD_TYPE};
use crate::rtp::parameters::{consumer_params, RtpParameters};
use crate::rtp::{Consumer, Producer};
use crate::router::{Router, SsrcRecoveryEntry};
use crate::sctp::SctpAssociation;
use crate::slab::{Handle, Slab};
use crate::stream::{PayloadMode, Stream, StreamConfig};
use qrpc_protocol::error::QrpcError;

new_key_type! {
    pub struct StreamKey;
    pub struct ProducerKey;
    pub struct ConsumerKey;
}

pub type StreamHandle = Handle<StreamKey>;
pub type ProducerHandle = Handle<ProducerKey>;
pub type ConsumerHandle = Handle<ConsumerKey>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpProto {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStreamState {
    Open,
    Closed,
    /// A closed slot kept around so a later renegotiation can reuse its
    /// `mid` (spec §3 MediaStreamConfig invariant).
    Reuse,
}

#[derive(Debug, Clone, Default)]
pub struct MediaStreamOptions {
    pub pause: bool,
}

/// One negotiated m-section (spec §3). `network` is unit: every m-section
/// in this design rides the single bundled ICE/DTLS/SCTP transport a
/// `Connection` owns, so there is nothing per-section to name here.
#[derive(Debug, Clone)]
pub struct MediaStreamConfig {
    pub direction: Direction,
    pub media_path: Option<MediaPath>,
    pub mid: String,
    pub kind: MediaKind,
    pub network: (),
    pub rtp_proto: RtpProto,
    pub rtp_parameters: RtpParameters,
    pub options: MediaStreamOptions,
    pub state: MediaStreamState,
}

impl MediaStreamConfig {
    pub fn probator(mid: impl Into<String>) -> Self {
        let mut params = RtpParameters::default();
        params.codecs.push(crate::rtp::parameters::Codec {
            mime_type: "video/probator".to_string(),
            payload_type: PROBATOR_PAYLOAD_TYPE,
            clock_rate: 90_000,
            channels: None,
            fmtp: HashMap::new(),
            rtcp_fbs: Vec::new(),
            rtx_payload_type: None,
            dtx: false,
        });
        Self {
            direction: Direction::Send,
            media_path: None,
            mid: mid.into(),
            kind: MediaKind::Video,
            network: (),
            rtp_proto: RtpProto::Udp,
            rtp_parameters: params,
            options: MediaStreamOptions::default(),
            state: MediaStreamState::Open,
        }
    }
}

/// `mid -> media_path`, `rid`/`track_id -> label`, `ssrc -> {cname, msid,
/// track_id}` (spec §4.10).
#[derive(Default)]
pub struct RtpMapping {
    pub mid_to_media_path: HashMap<String, MediaPath>,
    pub rid_to_label: HashMap<String, String>,
    pub track_id_to_label: HashMap<String, String>,
    pub ssrc_owner: HashMap<u32, SsrcOwner>,
}

#[derive(Debug, Clone)]
pub struct SsrcOwner {
    pub cname: String,
    pub msid: Option<String>,
    pub track_id: Option<String>,
}

/// What `receive_rtp_packet` tells the caller to do with an inbound RTP
/// packet (spec §4.12 "Inbound packet flow").
pub enum RtpDispatchOutcome {
    /// Forward the packet to every listed consumer id, having injected
    /// `injected_rid` (if any) before it reached this point.
    Forward {
        producer_id: String,
        consumer_ids: Vec<String>,
        injected_rid: Option<String>,
    },
    /// SSRC unrecognized: upcall `RecvStreamClosed(ssrc)` so the layer
    /// above forgets it (spec §4.12 step 3).
    RecvStreamClosed(u32),
}

pub struct Connection {
    pub cname: String,
    pub ice_server: IceServer,
    pub dtls_transport: DtlsTransport,
    pub sctp_association: SctpAssociation,
    pub router: Router,
    pub rtp_mapping: RtpMapping,
    pub media_stream_configs: Vec<MediaStreamConfig>,
    handler_map: Arc<HandlerMap>,

    streams: Slab<StreamKey, Stream>,
    streams_by_label: HashMap<String, Vec<StreamHandle>>,
    streams_by_id: HashMap<u16, StreamHandle>,

    producers: Slab<ProducerKey, Producer>,
    producers_by_media_path: HashMap<String, ProducerHandle>,
    consumers: Slab<ConsumerKey, Consumer>,

    probator_synthesized: bool,
    pub close_reason: Option<CloseReason>,
}

impl Connection {
    pub fn new(
        thread_id: ThreadId,
        cname: impl Into<String>,
        ice_server: IceServer,
        dtls_transport: DtlsTransport,
        sctp_association: SctpAssociation,
        handler_map: Arc<HandlerMap>,
    ) -> Self {
        Self {
            cname: cname.into(),
            ice_server,
            dtls_transport,
            sctp_association,
            router: Router::new(),
            rtp_mapping: RtpMapping::default(),
            media_stream_configs: Vec::new(),
            handler_map,
            streams: Slab::new(thread_id),
            streams_by_label: HashMap::new(),
            streams_by_id: HashMap::new(),
            producers: Slab::new(thread_id),
            producers_by_media_path: HashMap::new(),
            consumers: Slab::new(thread_id),
            probator_synthesized: false,
            close_reason: None,
        }
    }

    // ---- Stream lifecycle (spec §4.8 public contract) ----------------

    /// `OpenStream(config)`: allocates a new SCTP stream id for the local
    /// role and registers the resulting `Stream` under its label.
    pub fn open_stream(&mut self, label: impl Into<String>, ordered: bool, mode: PayloadMode) -> StreamHandle {
        let label = label.into();
        let stream_id = self.sctp_association.allocate_stream_id();
        let config = StreamConfig::new(label.clone(), stream_id, ordered);
        let handle = self.streams.insert(Stream::new(config, mode));
        self.streams_by_id.insert(stream_id, handle);
        self.streams_by_label.entry(label).or_default().push(handle);
        handle
    }

    /// Inbound SCTP stream-open indication: resolves `label` against the
    /// handler map (spec §4.8 "Stream dispatch on inbound open") and, if
    /// claimed, registers the peer-opened stream. Returns `None` if no
    /// explicit entry, director, or raw fallback claims it (rejected).
    pub fn on_inbound_stream_open(&mut self, label: &str, stream_id: u16, ordered: bool) -> Option<(StreamHandle, HandlerEntry)> {
        let entry = self.handler_map.resolve(label)?;
        let mode = match &entry {
            HandlerEntry::Stream { mode, .. } => *mode,
            HandlerEntry::Rpc(_) | HandlerEntry::Media(_) => PayloadMode::Binary,
        };
        let config = StreamConfig::new(label.to_string(), stream_id, ordered);
        let handle = self.streams.insert(Stream::new(config, mode));
        self.streams_by_id.insert(stream_id, handle);
        self.streams_by_label.entry(label.to_string()).or_default().push(handle);
        Some((handle, entry))
    }

    /// `Send(stream, bytes, binary)`: enqueues on the SCTP stream with the
    /// PPID matching `binary`/payload length.
    pub fn send(&mut self, handle: StreamHandle, bytes: &[u8], binary: bool) -> Result<(), QrpcError> {
        let stream = self
            .streams
            .get(handle)
            .ok_or_else(|| QrpcError::Invalid("stale stream handle".to_string()))?;
        if stream.is_closed() {
            return Err(QrpcError::Invalid("stream is closed".to_string()));
        }
        let (stream_id, ordered) = (stream.config.stream_id, stream.config.ordered);
        self.sctp_association.queue_chunk(stream_id, ordered, binary, bytes.to_vec())
    }

    /// `Close(stream)`: resets the SCTP stream. Idempotent — the stream
    /// object survives until its `on_shutdown` returns (spec §8: calling
    /// `Close` twice is a no-op after the first call).
    pub fn close_stream(&mut self, handle: StreamHandle, reason: CloseReason) -> bool {
        self.streams.get_mut(handle).map(|s| s.close(reason)).unwrap_or(false)
    }

    pub fn publish_stream(&mut self, handle: StreamHandle) {
        if let Some(stream) = self.streams.get(handle) {
            self.router.publish(stream.config.label.clone(), stream.config.stream_id.to_string());
        }
    }

    pub fn subscribe_stream(&mut self, label: &str, subscriber: StreamHandle) -> bool {
        let Some(stream) = self.streams.get(subscriber) else {
            return false;
        };
        self.router.subscribe_label(label, stream.config.stream_id.to_string())
    }

    /// `Close(reason)`: tears down SCTP -> DTLS -> ICE -> session by
    /// closing every stream and going away every pending RPC call (the
    /// RPC stream's own `PendingTable::goaway` is invoked by its owner);
    /// returns the number of streams this call actually closed.
    pub fn close(&mut self, reason: CloseReason) -> usize {
        let mut closed = 0;
        for (_, stream) in self.streams.iter_mut() {
            if stream.close(reason.clone()) {
                closed += 1;
            }
        }
        self.close_reason = Some(reason);
        closed
    }

    // ---- Producer / Consumer factory (spec §4.11) ---------------------

    /// Inbound RTP with a new mid: derives a producer id and registers it
    /// (spec §4.11 "Producer creation").
    pub fn create_producer(&mut self, rtp_id: &str, media_path: MediaPath, rtp_parameters: RtpParameters) -> ProducerHandle {
        let media_path_key = media_path.to_string();
        let producer = Producer::new(rtp_id, media_path, rtp_parameters);
        let handle = self.producers.insert(producer);
        self.producers_by_media_path.insert(media_path_key, handle);
        handle
    }

    pub fn producer_by_media_path(&self, media_path: &MediaPath) -> Option<ProducerHandle> {
        self.producers_by_media_path.get(&media_path.to_string()).copied()
    }

    /// Consumer creation (mirror): materializes a consumer from a peer
    /// producer's parameters derived against the local capability set
    /// (spec §4.10 `consumer_params`, §4.11 "Consumer creation").
    /// Synthesizes a probator config once per connection, for the first
    /// video consumer (spec §4.11 "Probation consumer"; the open question
    /// of whether later video consumers get their own is resolved in
    /// DESIGN.md as "no — shared, synthesized only once").
    pub fn create_consumer(
        &mut self,
        producer_handle: ProducerHandle,
        capability: &RtpParameters,
        mid: impl Into<String>,
    ) -> Result<ConsumerHandle, QrpcError> {
        let producer = self
            .producers
            .get(producer_handle)
            .ok_or_else(|| QrpcError::Invalid("stale producer handle".to_string()))?;
        let mid = mid.into();
        let params = consumer_params(&producer.rtp_parameters, capability);
        let consumer_id = format!("/c/{}{}", mid, producer.id);
        let consumer = Consumer::new(consumer_id.clone(), producer.id.clone(), mid.clone(), params, producer.kind);
        let is_first_video = producer.media_path.kind == MediaKind::Video && !self.probator_synthesized;

        let handle = self.consumers.insert(consumer);
        self.router.subscribe_producer(producer_handle_id(producer), consumer_id);

        if is_first_video {
            self.media_stream_configs.push(MediaStreamConfig::probator(PROBATOR_MID));
            self.probator_synthesized = true;
        }

        Ok(handle)
    }

    pub fn pause_consumer(&mut self, handle: ConsumerHandle) {
        if let Some(c) = self.consumers.get_mut(handle) {
            c.pause();
        }
    }

    pub fn resume_consumer(&mut self, handle: ConsumerHandle) {
        if let Some(c) = self.consumers.get_mut(handle) {
            c.resume();
        }
    }

    /// Manual producer close (spec §4.12): notifies each subscriber with a
    /// `$syscall`-labeled `close_track` control frame, detaches consumers,
    /// and arms SSRC recovery for every encoding that carried a rid so a
    /// reconnecting browser tab can resume without re-signaling.
    pub fn close_producer(&mut self, handle: ProducerHandle) -> Vec<(String, serde_json::Value)> {
        let Some(producer) = self.producers.get_mut(handle) else {
            return Vec::new();
        };
        producer.close();
        self.producers_by_media_path.remove(&producer.media_path.to_string());

        for encoding in &producer.rtp_parameters.encodings {
            if let (Some(ssrc), Some(rid)) = (encoding.ssrc, encoding.rid.clone()) {
                self.router.insert_recovery(
                    ssrc,
                    SsrcRecoveryEntry {
                        rid,
                        rtp_rollover_counter: 0,
                        try_complement: true,
                    },
                );
            }
        }

        self.router.close_producer(&producer.id, &producer.media_path)
    }

    // ---- RTP router (spec §4.12) ---------------------------------------

    /// Spec §4.12 "Inbound packet flow" steps 2-4, minus the actual SRTP
    /// decrypt (the wrapped DTLS/SRTP library's job, spec §1) and per-
    /// consumer packet rewrite (SSRC/PT/extension-id remap — mechanical
    /// transforms applied by the caller using `rtp`/`rtcp` once a producer
    /// and its consumer set are resolved here).
    pub fn receive_rtp_packet(&mut self, ssrc: u32, rid_present: bool) -> RtpDispatchOutcome {
        let injected_rid = self.router.recover_rid(ssrc, rid_present);

        let Some(producer_id) = self.find_producer_id_by_ssrc(ssrc) else {
            return RtpDispatchOutcome::RecvStreamClosed(ssrc);
        };

        let consumer_ids: Vec<String> = self.router.consumers_of(&producer_id).cloned().collect();
        RtpDispatchOutcome::Forward {
            producer_id,
            consumer_ids,
            injected_rid,
        }
    }

    fn find_producer_id_by_ssrc(&self, ssrc: u32) -> Option<String> {
        self.producers
            .iter()
            .find(|(_, p)| !p.closed && p.rtp_streams.contains(&ssrc))
            .map(|(_, p)| p.id.clone())
    }

    /// RTCP sender reports route to the producer owning `ssrc` (spec §4.12
    /// "RTCP flow").
    pub fn producer_for_rtcp_ssrc(&self, ssrc: u32) -> Option<&Producer> {
        self.producers.iter().find(|(_, p)| p.rtp_streams.contains(&ssrc)).map(|(_, p)| p)
    }

    /// RTCP receiver reports / feedback route to the consumer by
    /// media-SSRC (spec §4.12 "RTCP flow").
    pub fn consumer_for_rtcp_ssrc(&self, ssrc: u32) -> Option<&Consumer> {
        self.consumers
            .iter()
            .find(|(_, c)| c.rtp_parameters.encodings.iter().any(|e| e.ssrc == Some(ssrc)))
            .map(|(_, c)| c)
    }

    pub fn stream(&self, handle: StreamHandle) -> Option<&Stream> {
        self.streams.get(handle)
    }

    pub fn producer(&self, handle: ProducerHandle) -> Option<&Producer> {
        self.producers.get(handle)
    }

    pub fn consumer(&self, handle: ConsumerHandle) -> Option<&Consumer> {
        self.consumers.get(handle)
    }
}

fn producer_handle_id(producer: &Producer) -> String {
    producer.id.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FingerprintAlgorithm;
    use crate::dtls::DtlsRole;
    use crate::handler_map::HandlerEntry;
    use crate::rtp::parameters::{Codec, Encoding};
    use qrpc_protocol::media_path::MediaKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_connection() -> Connection {
        let ice = IceServer::new("U", "P");
        let dtls = DtlsTransport::new(DtlsRole::Server, FingerprintAlgorithm::Sha256, "aa".to_string());
        let sctp = SctpAssociation::new(false, 262_144);
        Connection::new(ThreadId(0), "peer-1", ice, dtls, sctp, Arc::new(HandlerMap::new()))
    }

    #[test]
    fn open_stream_allocates_even_id_for_server_role() {
        let mut conn = new_connection();
        let handle = conn.open_stream("echo", true, PayloadMode::Binary);
        assert_eq!(conn.stream(handle).unwrap().config.stream_id % 2, 0);
        assert_eq!(conn.stream(handle).unwrap().config.label, "echo");
    }

    #[test]
    fn send_on_closed_stream_fails() {
        let mut conn = new_connection();
        let handle = conn.open_stream("echo", true, PayloadMode::Binary);
        conn.close_stream(handle, CloseReason::local("bye"));
        assert!(conn.send(handle, b"x", true).is_err());
    }

    #[test]
    fn inbound_stream_open_resolves_against_handler_map() {
        let mut map = HandlerMap::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        map.register(
            "echo",
            HandlerEntry::Stream {
                mode: PayloadMode::Binary,
                handler: Arc::new(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );

        let ice = IceServer::new("U", "P");
        let dtls = DtlsTransport::new(DtlsRole::Server, FingerprintAlgorithm::Sha256, "aa".to_string());
        let sctp = SctpAssociation::new(true, 262_144);
        let mut conn = Connection::new(ThreadId(0), "peer-1", ice, dtls, sctp, Arc::new(map));

        let claimed = conn.on_inbound_stream_open("echo", 1, true);
        assert!(claimed.is_some());
        assert!(conn.on_inbound_stream_open("unknown-label", 3, true).is_none());
    }

    fn codec() -> Codec {
        Codec {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
            channels: None,
            fmtp: HashMap::new(),
            rtcp_fbs: Vec::new(),
            rtx_payload_type: None,
            dtx: false,
        }
    }

    #[test]
    fn first_video_consumer_synthesizes_probator_once() {
        let mut conn = new_connection();
        let mut params = RtpParameters::default();
        params.codecs.push(codec());
        params.ssrc_seed = 1000;
        params.encodings.push(Encoding { ssrc: Some(1000), ..Default::default() });

        let path = MediaPath::new("peer-1", "cam0", MediaKind::Video);
        let producer = conn.create_producer("rtp1", path, params.clone());

        let mut capability = RtpParameters::default();
        capability.codecs.push(codec());

        conn.create_consumer(producer, &capability, "0").unwrap();
        assert_eq!(conn.media_stream_configs.len(), 1);
        assert_eq!(conn.media_stream_configs[0].mid, PROBATOR_MID);

        let path2 = MediaPath::new("peer-1", "cam1", MediaKind::Video);
        let producer2 = conn.create_producer("rtp2", path2, params);
        conn.create_consumer(producer2, &capability, "1").unwrap();
        assert_eq!(conn.media_stream_configs.len(), 1, "probator must not be synthesized twice");
    }

    #[test]
    fn receive_rtp_packet_recovers_rid_then_forwards() {
        let mut conn = new_connection();
        let mut params = RtpParameters::default();
        params.codecs.push(codec());
        params.encodings.push(Encoding { ssrc: Some(42), rid: Some("h".to_string()), ..Default::default() });

        let path = MediaPath::new("peer-1", "cam0", MediaKind::Video);
        let producer = conn.create_producer("rtp1", path, params);
        let producer_id = conn.producer(producer).unwrap().id.clone();

        let mut capability = RtpParameters::default();
        capability.codecs.push(codec());
        conn.create_consumer(producer, &capability, "0").unwrap();

        conn.close_producer(producer);
        // New producer reuses ssrc 42 without a rid; recovery should inject "h" once.
        let mut params2 = RtpParameters::default();
        params2.codecs.push(codec());
        params2.encodings.push(Encoding { ssrc: Some(42), ..Default::default() });
        let path2 = MediaPath::new("peer-1", "cam0b", MediaKind::Video);
        let producer2 = conn.create_producer("rtp2", path2, params2);

        match conn.receive_rtp_packet(42, false) {
            RtpDispatchOutcome::Forward { producer_id: pid, injected_rid, .. } => {
                assert_eq!(pid, conn.producer(producer2).unwrap().id.clone());
                assert_eq!(injected_rid, Some("h".to_string()));
            }
            RtpDispatchOutcome::RecvStreamClosed(_) => panic!("expected forward"),
        }
        let _ = producer_id;
    }

    #[test]
    fn unrecognized_ssrc_reports_recv_stream_closed() {
        let mut conn = new_connection();
        match conn.receive_rtp_packet(9999, true) {
            RtpDispatchOutcome::RecvStreamClosed(ssrc) => assert_eq!(ssrc, 9999),
            RtpDispatchOutcome::Forward { .. } => panic!("expected RecvStreamClosed"),
        }
    }
}
