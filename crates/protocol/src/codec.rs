//! Wire codecs shared by the labeled stream multiplexer (spec §4.13,
//! §8 "Round-trip and idempotence").
//!
//! Both codecs are ground-truthed against `original_source`'s
//! `sys/server/base/header_codec.h` (`base::LengthCodec`,
//! `base::HeaderCodec`), translated byte-for-byte into safe Rust.

/// Variable-length record length prefix used by `CodedByteStream`.
///
/// Each byte carries 7 bits of the value, least-significant group first.
/// The *last* byte written has its top bit set — that is the terminator,
/// not a continuation marker, so a reader keeps consuming bytes with the
/// top bit clear and stops at the first byte with it set.
pub struct LengthCodec;

/// At most 5 groups of 7 bits are needed to cover a `u32`.
const LENGTH_MAX_BYTES: usize = 5;

impl LengthCodec {
    /// Encodes `value` into `buf`, returning the number of bytes written,
    /// or `None` if `buf` was too small.
    pub fn encode(value: u32, buf: &mut [u8]) -> Option<usize> {
        let mut v = value;
        let mut idx = 0;
        loop {
            let byte = buf.get_mut(idx)?;
            *byte = (v & 0x7f) as u8;
            v >>= 7;
            if v > 0 {
                idx += 1;
            } else {
                *byte |= 0x80;
                return Some(idx + 1);
            }
        }
    }

    /// Decodes a value from the front of `buf`, returning `(value,
    /// bytes_consumed)`, or `None` if `buf` does not yet contain a
    /// complete, well-formed prefix.
    pub fn decode(buf: &[u8]) -> Option<(u32, usize)> {
        let mut value: u32 = 0;
        for idx in 0..LENGTH_MAX_BYTES.min(buf.len().max(1)) {
            let byte = *buf.get(idx)?;
            value |= ((byte & 0x7f) as u32) << (idx * 7);
            if byte & 0x80 != 0 {
                return Some((value, idx + 1));
            }
        }
        None
    }
}

/// `<header><payload>` framing header for RPC messages (spec §4.13
/// RPCStream): `{type: i16, msgid: u32}` packed with per-field size flags
/// in a leading control byte.
pub struct HeaderCodec;

const MSGID_2BYTE: u8 = 1 << 0;
const MSGID_4BYTE: u8 = 1 << 1;
const TYPE_1BYTE: u8 = 1 << 2;

/// Worst case: control byte + 2-byte type + 4-byte msgid.
pub const HEADER_MAX_LEN: usize = 7;

impl HeaderCodec {
    pub fn encode(msg_type: i16, msgid: u32, buf: &mut [u8]) -> Option<usize> {
        if buf.is_empty() {
            return None;
        }
        buf[0] = 0;
        let mut ofs = 1usize;

        let mask = (msg_type as u16) & 0xFF00;
        if mask != 0 && mask != 0xFF00 {
            *buf.get_mut(ofs..ofs + 2)?.first_chunk_mut::<2>()? = msg_type.to_be_bytes();
            ofs += 2;
        } else {
            buf[0] |= TYPE_1BYTE;
            *buf.get_mut(ofs)? = msg_type as u8;
            ofs += 1;
        }

        if msgid & 0xFFFF_0000 != 0 {
            buf[0] |= MSGID_4BYTE;
            *buf.get_mut(ofs..ofs + 4)?.first_chunk_mut::<4>()? = msgid.to_be_bytes();
            ofs += 4;
        } else if msgid != 0 {
            buf[0] |= MSGID_2BYTE;
            *buf.get_mut(ofs..ofs + 2)?.first_chunk_mut::<2>()? = (msgid as u16).to_be_bytes();
            ofs += 2;
        }

        Some(ofs)
    }

    pub fn decode(buf: &[u8]) -> Option<(i16, u32, usize)> {
        let flags = *buf.first()?;
        let mut ofs = 1usize;

        let msg_type = if flags & TYPE_1BYTE != 0 {
            let t = *buf.get(ofs)? as i8 as i16;
            ofs += 1;
            t
        } else {
            let t = i16::from_be_bytes(*buf.get(ofs..ofs + 2)?.first_chunk::<2>()?);
            ofs += 2;
            t
        };

        let msgid = if flags & MSGID_4BYTE != 0 {
            let m = u32::from_be_bytes(*buf.get(ofs..ofs + 4)?.first_chunk::<4>()?);
            ofs += 4;
            m
        } else if flags & MSGID_2BYTE != 0 {
            let m = u16::from_be_bytes(*buf.get(ofs..ofs + 2)?.first_chunk::<2>()?) as u32;
            ofs += 2;
            m
        } else {
            0
        };

        Some((msg_type, msgid, ofs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_codec_roundtrips_small_values() {
        for n in [0u32, 1, 127, 128, 16383, 16384, 2_097_151, 4_000_000_000] {
            let mut buf = [0u8; LENGTH_MAX_BYTES];
            let written = LengthCodec::encode(n, &mut buf).expect("buffer big enough");
            let (decoded, consumed) = LengthCodec::decode(&buf[..written]).expect("decodable");
            assert_eq!(decoded, n);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn length_codec_reports_incomplete_prefix() {
        let mut buf = [0u8; LENGTH_MAX_BYTES];
        let written = LengthCodec::encode(16384, &mut buf).unwrap();
        assert!(LengthCodec::decode(&buf[..written - 1]).is_none());
    }

    #[test]
    fn length_codec_rejects_buffer_too_small_to_encode() {
        let mut buf = [0u8; 1];
        assert!(LengthCodec::encode(16384, &mut buf).is_none());
    }

    #[test]
    fn header_codec_roundtrips_representable_pairs() {
        // 1-byte type path round-trips exactly for i8-range values; msgid
        // for every size class (0, u16, u32).
        for msg_type in [-128i16, -1, 0, 1, 100, 127] {
            for msgid in [0u32, 1, 65535, 65536, 4_000_000_000] {
                let mut buf = [0u8; HEADER_MAX_LEN];
                let written = HeaderCodec::encode(msg_type, msgid, &mut buf).unwrap();
                let (t, m, consumed) = HeaderCodec::decode(&buf[..written]).unwrap();
                assert_eq!(t, msg_type);
                assert_eq!(m, msgid);
                assert_eq!(consumed, written);
            }
        }
    }

    #[test]
    fn header_codec_uses_two_byte_type_outside_one_byte_range() {
        let mut buf = [0u8; HEADER_MAX_LEN];
        let written = HeaderCodec::encode(300, 0, &mut buf).unwrap();
        let (t, _, _) = HeaderCodec::decode(&buf[..written]).unwrap();
        assert_eq!(t, 300);
        assert_eq!(written, 3); // control byte + 2-byte type, no msgid bytes
    }

    #[test]
    fn header_codec_request_notify_reply_size_classes() {
        // Request: msgid != 0, type > 0
        let mut buf = [0u8; HEADER_MAX_LEN];
        let written = HeaderCodec::encode(7, 42, &mut buf).unwrap();
        let (t, m, _) = HeaderCodec::decode(&buf[..written]).unwrap();
        assert!(m != 0 && t > 0);

        // Notify: msgid == 0, type > 0
        let written = HeaderCodec::encode(7, 0, &mut buf).unwrap();
        let (t, m, _) = HeaderCodec::decode(&buf[..written]).unwrap();
        assert!(m == 0 && t > 0);

        // Reply (ok): msgid != 0, type <= 0
        let written = HeaderCodec::encode(0, 42, &mut buf).unwrap();
        let (t, m, _) = HeaderCodec::decode(&buf[..written]).unwrap();
        assert!(m != 0 && t <= 0);
    }
}
