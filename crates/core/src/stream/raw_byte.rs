//! `RawByteStream` (spec §4.13): pass-through framing. Every completed
//! socket read is handed to `on_stream_record` verbatim; there is no
//! reassembly buffer because record boundaries are whatever the sender's
//! writes produced.

/// An application-provided writer serializes each outbound record; the
/// multiplexer does not add any framing of its own.
pub trait RawByteWriter: Send {
    fn write(&mut self, record: &[u8]) -> Vec<u8>;
}

/// Identity writer: sends exactly the bytes given.
pub struct IdentityWriter;

impl RawByteWriter for IdentityWriter {
    fn write(&mut self, record: &[u8]) -> Vec<u8> {
        record.to_vec()
    }
}
