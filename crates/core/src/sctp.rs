//! SCTP association wrapper (spec §4.7). Wraps a user-mode SCTP stack; the
//! association's own timer-driven retransmission enqueues outbound packets
//! onto a per-thread `mpsc` channel that a worker-owned alarm drains, so
//! the stack's internal timers may fire from any thread while the actual
//! socket write always happens on the owning worker (spec §5 "send queue
//! per thread avoids the shared write path").

use tokio::sync::mpsc;

use qrpc_protocol::error::QrpcError;
use qrpc_protocol::CloseReason;

/// PPIDs for WebRTC data channels (spec §6.2, RFC 8831).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ppid {
    DcepControl,
    String,
    BinaryPartialDeprecated,
    Binary,
    StringPartialDeprecated,
    StringEmpty,
    BinaryEmpty,
}

impl Ppid {
    pub fn as_u32(self) -> u32 {
        match self {
            Ppid::DcepControl => 50,
            Ppid::String => 51,
            Ppid::BinaryPartialDeprecated => 52,
            Ppid::Binary => 53,
            Ppid::StringPartialDeprecated => 54,
            Ppid::StringEmpty => 56,
            Ppid::BinaryEmpty => 57,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            50 => Ppid::DcepControl,
            51 => Ppid::String,
            52 => Ppid::BinaryPartialDeprecated,
            53 => Ppid::Binary,
            54 => Ppid::StringPartialDeprecated,
            56 => Ppid::StringEmpty,
            57 => Ppid::BinaryEmpty,
            _ => return None,
        })
    }

    /// PPID for a payload given its binary/text mode and length, including
    /// the RFC 8831 empty-message special case.
    pub fn for_payload(binary: bool, len: usize) -> Ppid {
        match (binary, len == 0) {
            (true, false) => Ppid::Binary,
            (true, true) => Ppid::BinaryEmpty,
            (false, false) => Ppid::String,
            (false, true) => Ppid::StringEmpty,
        }
    }
}

/// One outbound SCTP chunk queued for the owning worker to flush.
pub struct OutboundChunk {
    pub stream_id: u16,
    pub ppid: Ppid,
    pub ordered: bool,
    pub bytes: Vec<u8>,
}

/// Per-association send queue (spec §4.7 "Per-thread send queue").
pub struct SendQueue {
    tx: mpsc::UnboundedSender<OutboundChunk>,
    rx: mpsc::UnboundedReceiver<OutboundChunk>,
}

impl SendQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<OutboundChunk> {
        self.tx.clone()
    }

    /// Drains everything currently queued, in FIFO order. Called from the
    /// owning worker's alarm-driven flush tick.
    pub fn drain(&mut self) -> Vec<OutboundChunk> {
        let mut out = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            out.push(chunk);
        }
        out
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-open parameters (spec §4.7).
pub struct StreamOpenRequest {
    pub label: String,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
    pub max_packet_lifetime_ms: Option<u32>,
    pub protocol: String,
}

impl StreamOpenRequest {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ordered: true,
            max_retransmits: None,
            max_packet_lifetime_ms: None,
            protocol: "qrpc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    CookieWait,
    Established,
    ShutdownSent,
    Closed,
}

/// Thin state tracker around the underlying SCTP association. Real chunk
/// (de)serialization and retransmission timers are the wrapped
/// library's responsibility; this records what the core needs to route
/// inbound data and allocate stream ids per role.
pub struct SctpAssociation {
    pub state: AssociationState,
    pub is_dtls_client: bool,
    next_even: u16,
    next_odd: u16,
    pub send_queue: SendQueue,
    /// Upper bound on a single outbound message (spec §8: "Data record
    /// larger than SCTP max message size is rejected with a protocol-level
    /// failure"), negotiated as `a=max-message-size` in the SDP answer.
    max_message_size: usize,
}

impl SctpAssociation {
    pub fn new(is_dtls_client: bool, max_message_size: usize) -> Self {
        Self {
            state: AssociationState::CookieWait,
            is_dtls_client,
            next_even: 0,
            next_odd: 1,
            send_queue: SendQueue::new(),
            max_message_size,
        }
    }

    /// Allocates the next outbound stream id for this role (spec §4.7,
    /// §8: odd for DTLS client, even for server).
    pub fn allocate_stream_id(&mut self) -> u16 {
        crate::stream::allocate_stream_id(&mut self.next_even, &mut self.next_odd, self.is_dtls_client)
    }

    pub fn queue_chunk(&self, stream_id: u16, ordered: bool, binary: bool, bytes: Vec<u8>) -> Result<(), QrpcError> {
        if bytes.len() > self.max_message_size {
            return Err(QrpcError::Closed(CloseReason::protocol(format!(
                "message of {} bytes exceeds max message size {}",
                bytes.len(),
                self.max_message_size
            ))));
        }
        let ppid = Ppid::for_payload(binary, bytes.len());
        let _ = self.send_queue.sender().send(OutboundChunk { stream_id, ppid, ordered, bytes });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppid_roundtrips() {
        for v in [50u32, 51, 52, 53, 54, 56, 57] {
            assert_eq!(Ppid::from_u32(v).unwrap().as_u32(), v);
        }
        assert!(Ppid::from_u32(99).is_none());
    }

    #[test]
    fn empty_payload_uses_the_empty_ppid() {
        assert_eq!(Ppid::for_payload(true, 0), Ppid::BinaryEmpty);
        assert_eq!(Ppid::for_payload(false, 0), Ppid::StringEmpty);
        assert_eq!(Ppid::for_payload(true, 3), Ppid::Binary);
        assert_eq!(Ppid::for_payload(false, 3), Ppid::String);
    }

    #[test]
    fn stream_ids_follow_role_parity() {
        let mut client = SctpAssociation::new(true, 262_144);
        let mut server = SctpAssociation::new(false, 262_144);
        assert_eq!(client.allocate_stream_id() % 2, 1);
        assert_eq!(server.allocate_stream_id() % 2, 0);
    }

    #[test]
    fn send_queue_drains_in_order() {
        let mut assoc = SctpAssociation::new(true, 262_144);
        assoc.queue_chunk(1, true, true, b"a".to_vec()).unwrap();
        assoc.queue_chunk(1, true, true, b"b".to_vec()).unwrap();
        let drained = assoc.send_queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].bytes, b"a");
        assert_eq!(drained[1].bytes, b"b");
    }

    #[test]
    fn oversized_message_is_rejected_with_a_protocol_error() {
        let assoc = SctpAssociation::new(true, 4);
        let err = assoc.queue_chunk(1, true, true, b"too long".to_vec()).unwrap_err();
        match err {
            QrpcError::Closed(reason) => assert_eq!(reason.code, qrpc_protocol::Kind::Protocol),
            other => panic!("expected a closed/protocol error, got {other:?}"),
        }
    }
}
