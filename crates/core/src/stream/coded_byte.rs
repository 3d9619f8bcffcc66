//! `CodedByteStream` (spec §4.13): length-prefixed records over a data
//! channel. Reassembles records from arbitrarily-fragmented SCTP reads.

use qrpc_protocol::LengthCodec;

/// Accumulates inbound bytes and yields complete, length-prefixed records.
#[derive(Default)]
pub struct CodedByteReassembler {
    buf: Vec<u8>,
}

impl CodedByteReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly read bytes and returns every complete record now
    /// available, in order, removing their bytes (including the length
    /// prefix) from the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);

        let mut records = Vec::new();
        loop {
            let Some((len, prefix_len)) = LengthCodec::decode(&self.buf) else {
                break;
            };
            let total = prefix_len + len as usize;
            if self.buf.len() < total {
                break;
            }
            records.push(self.buf[prefix_len..total].to_vec());
            self.buf.drain(..total);
        }
        records
    }
}

/// Encodes a single outbound record: length prefix followed by payload.
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut len_buf = [0u8; 5];
    let written = LengthCodec::encode(payload.len() as u32, &mut len_buf)
        .expect("5-byte buffer covers any u32 length");
    let mut out = Vec::with_capacity(written + payload.len());
    out.extend_from_slice(&len_buf[..written]);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_a_single_record_split_across_reads() {
        let mut r = CodedByteReassembler::new();
        let record = encode_record(b"hello world");

        let mid = record.len() / 2;
        assert!(r.push(&record[..mid]).is_empty());
        let records = r.push(&record[mid..]);
        assert_eq!(records, vec![b"hello world".to_vec()]);
    }

    #[test]
    fn reassembles_multiple_records_from_one_read() {
        let mut r = CodedByteReassembler::new();
        let mut bytes = encode_record(b"one");
        bytes.extend(encode_record(b"two"));

        let records = r.push(&bytes);
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn empty_record_roundtrips() {
        let mut r = CodedByteReassembler::new();
        let records = r.push(&encode_record(b""));
        assert_eq!(records, vec![Vec::<u8>::new()]);
    }
}
