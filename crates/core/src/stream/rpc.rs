//! `RPCStream` (spec §4.13): `<header><length><payload>` framing with three
//! message kinds distinguished by the sign of `type` and whether `msgid`
//! is zero. Pending outbound requests are tracked with a deadline; a
//! single alarm is expected to reschedule itself to the earliest one
//! (`next_deadline`) rather than one timer per request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use qrpc_protocol::{HeaderCodec, LengthCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Ok,
    /// Peer-level application error (non-zero reply `type`).
    EUser,
    ETimeout,
    /// Connection went away with pending requests outstanding.
    EGoaway,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    Request { msg_type: i16, msgid: u32, payload: Vec<u8> },
    Notify { msg_type: i16, payload: Vec<u8> },
    Reply { code: ReplyCode, msgid: u32, payload: Vec<u8> },
}

/// Classifies a decoded `(type, msgid)` header per spec §4.13.
fn classify(msg_type: i16, msgid: u32, payload: Vec<u8>) -> RpcMessage {
    if msgid != 0 && msg_type > 0 {
        RpcMessage::Request { msg_type, msgid, payload }
    } else if msgid == 0 && msg_type > 0 {
        RpcMessage::Notify { msg_type, payload }
    } else {
        let code = if msg_type == 0 { ReplyCode::Ok } else { ReplyCode::EUser };
        RpcMessage::Reply { code, msgid, payload }
    }
}

/// Encodes one RPC frame: header (type, msgid) + length-prefixed payload.
pub fn encode_frame(msg_type: i16, msgid: u32, payload: &[u8]) -> Vec<u8> {
    let mut header_buf = [0u8; qrpc_protocol::codec::HEADER_MAX_LEN];
    let header_len = HeaderCodec::encode(msg_type, msgid, &mut header_buf).expect("header fits");

    let mut len_buf = [0u8; 5];
    let len_len = LengthCodec::encode(payload.len() as u32, &mut len_buf).expect("length fits");

    let mut out = Vec::with_capacity(header_len + len_len + payload.len());
    out.extend_from_slice(&header_buf[..header_len]);
    out.extend_from_slice(&len_buf[..len_len]);
    out.extend_from_slice(payload);
    out
}

/// Reassembles inbound bytes into complete `RpcMessage`s.
#[derive(Default)]
pub struct RpcReassembler {
    buf: Vec<u8>,
}

impl RpcReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<RpcMessage> {
        self.buf.extend_from_slice(bytes);

        let mut out = Vec::new();
        loop {
            let Some((msg_type, msgid, header_len)) = HeaderCodec::decode(&self.buf) else {
                break;
            };
            let Some((payload_len, length_len)) = LengthCodec::decode(&self.buf[header_len..]) else {
                break;
            };
            let total = header_len + length_len + payload_len as usize;
            if self.buf.len() < total {
                break;
            }
            let payload = self.buf[header_len + length_len..total].to_vec();
            out.push(classify(msg_type, msgid, payload));
            self.buf.drain(..total);
        }
        out
    }
}

type ReplyCallback = Box<dyn FnOnce(ReplyCode, Vec<u8>) + Send>;

struct PendingRequest {
    deadline: Instant,
    callback: ReplyCallback,
}

/// Outbound request/reply bookkeeping for one `RPCStream`.
#[derive(Default)]
pub struct PendingTable {
    next_msgid: u32,
    pending: HashMap<u32, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            next_msgid: 1,
            pending: HashMap::new(),
        }
    }

    /// Registers a new outbound request, returning the frame to send.
    pub fn call(&mut self, msg_type: i16, payload: &[u8], timeout: Duration, callback: ReplyCallback, now: Instant) -> Vec<u8> {
        let msgid = self.next_msgid;
        self.next_msgid = self.next_msgid.wrapping_add(1).max(1);

        self.pending.insert(
            msgid,
            PendingRequest {
                deadline: now + timeout,
                callback,
            },
        );
        encode_frame(msg_type, msgid, payload)
    }

    /// Fulfills a pending request from an inbound reply. No-op if the
    /// msgid is unknown (already timed out, or a duplicate/stray reply).
    pub fn fulfill(&mut self, msgid: u32, code: ReplyCode, payload: Vec<u8>) {
        if let Some(req) = self.pending.remove(&msgid) {
            (req.callback)(code, payload);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|r| r.deadline).min()
    }

    /// Times out every request whose deadline has passed.
    pub fn expire_due(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(req) = self.pending.remove(&id) {
                (req.callback)(ReplyCode::ETimeout, Vec::new());
            }
        }
    }

    /// Fulfills every outstanding request with `EGOAWAY` (connection close,
    /// spec §7 "Stream on_shutdown is called exactly once", §4.13 "Connection
    /// close goes-away all pending requests with EGOAWAY").
    pub fn goaway(&mut self) {
        for (_, req) in self.pending.drain() {
            (req.callback)(ReplyCode::EGoaway, Vec::new());
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn classifies_request_notify_reply() {
        assert!(matches!(classify(7, 42, vec![]), RpcMessage::Request { .. }));
        assert!(matches!(classify(7, 0, vec![]), RpcMessage::Notify { .. }));
        assert!(matches!(
            classify(0, 42, vec![]),
            RpcMessage::Reply { code: ReplyCode::Ok, .. }
        ));
        assert!(matches!(
            classify(-3, 42, vec![]),
            RpcMessage::Reply { code: ReplyCode::EUser, .. }
        ));
    }

    #[test]
    fn reassembles_frame_split_across_reads() {
        let frame = encode_frame(7, 42, b"ping");
        let mut r = RpcReassembler::new();
        let mid = frame.len() / 2;
        assert!(r.push(&frame[..mid]).is_empty());
        let msgs = r.push(&frame[mid..]);
        assert_eq!(
            msgs,
            vec![RpcMessage::Request {
                msg_type: 7,
                msgid: 42,
                payload: b"ping".to_vec()
            }]
        );
    }

    #[test]
    fn pending_request_roundtrip() {
        let now = Instant::now();
        let mut table = PendingTable::new();
        let result: Arc<Mutex<Option<(ReplyCode, Vec<u8>)>>> = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);

        let frame = table.call(7, b"ping", Duration::from_secs(5), Box::new(move |code, payload| {
            *r.lock().unwrap() = Some((code, payload));
        }), now);

        let mut reassembler = RpcReassembler::new();
        let decoded = reassembler.push(&frame);
        let RpcMessage::Request { msgid, .. } = decoded[0].clone() else {
            panic!("expected request")
        };

        table.fulfill(msgid, ReplyCode::Ok, b"pong".to_vec());
        assert_eq!(result.lock().unwrap().clone(), Some((ReplyCode::Ok, b"pong".to_vec())));
    }

    #[test]
    fn expired_requests_fire_etimeout() {
        let now = Instant::now();
        let mut table = PendingTable::new();
        let fired = Arc::new(Mutex::new(false));
        let f = Arc::clone(&fired);
        table.call(7, b"ping", Duration::from_millis(10), Box::new(move |code, _| {
            assert_eq!(code, ReplyCode::ETimeout);
            *f.lock().unwrap() = true;
        }), now);

        table.expire_due(now + Duration::from_millis(5));
        assert!(!*fired.lock().unwrap());
        table.expire_due(now + Duration::from_millis(11));
        assert!(*fired.lock().unwrap());
    }

    #[test]
    fn goaway_fulfills_all_pending() {
        let now = Instant::now();
        let mut table = PendingTable::new();
        let count = Arc::new(Mutex::new(0u32));
        for _ in 0..3 {
            let c = Arc::clone(&count);
            table.call(1, b"x", Duration::from_secs(5), Box::new(move |code, _| {
                assert_eq!(code, ReplyCode::EGoaway);
                *c.lock().unwrap() += 1;
            }), now);
        }
        table.goaway();
        assert_eq!(*count.lock().unwrap(), 3);
        assert!(table.is_empty());
    }
}
