//! Labeled stream multiplexer (spec §4.13) and the data-channel `Stream`
//! base it's built on (spec §3 Stream).

pub mod coded_byte;
pub mod raw_byte;
pub mod rpc;

use qrpc_protocol::CloseReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    Binary,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    CodedByte,
    RawByte,
    Rpc,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub label: String,
    pub stream_id: u16,
    pub ordered: bool,
    /// Exactly one of `max_retransmits`/`max_packet_lifetime_ms` may be set
    /// (spec §4.7): reliability is either a retransmit-count or a
    /// time-bounded budget, never both.
    pub max_retransmits: Option<u16>,
    pub max_packet_lifetime_ms: Option<u32>,
    pub protocol: String,
}

impl StreamConfig {
    pub fn new(label: impl Into<String>, stream_id: u16, ordered: bool) -> Self {
        Self {
            label: label.into(),
            stream_id,
            ordered,
            max_retransmits: None,
            max_packet_lifetime_ms: None,
            protocol: "qrpc".to_string(),
        }
    }
}

/// Base data-channel stream object (spec §3). `Close` is idempotent: the
/// second and later calls are no-ops (spec §8 "Calling Close(reason) twice
/// on a stream is a no-op after the first call").
pub struct Stream {
    pub config: StreamConfig,
    pub payload_mode: PayloadMode,
    pub close_reason: Option<CloseReason>,
}

impl Stream {
    pub fn new(config: StreamConfig, payload_mode: PayloadMode) -> Self {
        Self {
            config,
            payload_mode,
            close_reason: None,
        }
    }

    /// Returns `true` if this call is the one that actually closed the
    /// stream (i.e. it was the first).
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.close_reason.is_some() {
            return false;
        }
        self.close_reason = Some(reason);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }
}

/// Odd stream ids for the DTLS client role, even for the server role (spec
/// §4.7 "Stream id allocation", §8 universal invariant).
pub fn allocate_stream_id(next_even: &mut u16, next_odd: &mut u16, is_dtls_client: bool) -> u16 {
    if is_dtls_client {
        let id = *next_odd;
        *next_odd += 2;
        id
    } else {
        let id = *next_even;
        *next_even += 2;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrpc_protocol::CloseReason;

    #[test]
    fn close_is_idempotent() {
        let mut s = Stream::new(StreamConfig::new("echo", 2, true), PayloadMode::Binary);
        assert!(s.close(CloseReason::local("bye")));
        assert!(!s.close(CloseReason::local("bye again")));
    }

    #[test]
    fn stream_id_parity_matches_role() {
        let (mut even, mut odd) = (0u16, 1u16);
        let client_id = allocate_stream_id(&mut even, &mut odd, true);
        let server_id = allocate_stream_id(&mut even, &mut odd, false);
        assert_eq!(client_id % 2, 1);
        assert_eq!(server_id % 2, 0);
    }
}
