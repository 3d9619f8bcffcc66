//! Inbound UDP datagram classification and STUN decode/encode (spec §4.5,
//! RFC 7983 demultiplexing, RFC 5389 message layout). `ice::IceServer`
//! already models the Binding Request state machine against an
//! already-decoded `BindingRequest` and returns a `StunReplyKind`; this
//! module owns every wire byte on both sides of it, since STUN handling
//! (unlike DTLS/SRTP crypto) is explicitly in scope for this component.

use std::net::{IpAddr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

use qrpc_core::ice::{BindingRequest, StunReplyKind};
use stun::agent::TransactionId;

const STUN_HEADER_LEN: usize = 20;
const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_INDICATION: u16 = 0x0011;
const BINDING_SUCCESS_RESPONSE: u16 = 0x0101;
const BINDING_ERROR_RESPONSE: u16 = 0x0111;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;

const FINGERPRINT_XOR: u32 = 0x5354_554e;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    Stun,
    Dtls,
    Unknown,
}

/// RFC 7983 §7: the first byte of a demultiplexed UDP flow tells STUN
/// (0-3) from DTLS (20-63) apart.
pub fn classify_datagram(bytes: &[u8]) -> DatagramKind {
    match bytes.first() {
        Some(0..=3) => DatagramKind::Stun,
        Some(20..=63) => DatagramKind::Dtls,
        _ => DatagramKind::Unknown,
    }
}

pub struct DecodedBinding {
    pub transaction_id: [u8; 12],
    pub is_indication: bool,
    pub has_fingerprint: bool,
    pub has_message_integrity: bool,
    pub priority: u32,
    pub username: String,
    pub ice_controlled: bool,
    pub use_candidate: bool,
    pub nomination: Option<u32>,
}

impl DecodedBinding {
    pub fn into_binding_request(self) -> BindingRequest {
        BindingRequest {
            transaction_id: TransactionId(self.transaction_id),
            is_indication: self.is_indication,
            has_fingerprint: self.has_fingerprint,
            has_message_integrity: self.has_message_integrity,
            priority: self.priority,
            username: self.username,
            ice_controlled: self.ice_controlled,
            use_candidate: self.use_candidate,
            nomination: self.nomination,
        }
    }
}

/// Decodes a STUN Binding Request/Indication header plus the handful of
/// attributes the ICE Lite state machine needs. Returns `None` for
/// anything that isn't a well-formed STUN message with the magic cookie
/// set (RFC 5389 §6).
pub fn decode_binding_request(bytes: &[u8]) -> Option<DecodedBinding> {
    if bytes.len() < STUN_HEADER_LEN {
        return None;
    }
    let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
    let msg_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if cookie != STUN_MAGIC_COOKIE {
        return None;
    }
    if msg_type != BINDING_REQUEST && msg_type != BINDING_INDICATION {
        return None;
    }
    if bytes.len() < STUN_HEADER_LEN + msg_len {
        return None;
    }

    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&bytes[8..20]);

    let mut username = String::new();
    let mut has_fingerprint = false;
    let mut has_message_integrity = false;
    let mut priority = 0u32;
    let mut use_candidate = false;
    let mut ice_controlled = false;
    let mut nomination = None;

    let mut offset = STUN_HEADER_LEN;
    let end = STUN_HEADER_LEN + msg_len;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        let attr_len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            break;
        }
        let value = &bytes[value_start..value_end];

        match attr_type {
            ATTR_USERNAME => username = String::from_utf8_lossy(value).into_owned(),
            ATTR_MESSAGE_INTEGRITY => has_message_integrity = true,
            ATTR_FINGERPRINT => has_fingerprint = true,
            ATTR_USE_CANDIDATE => use_candidate = true,
            ATTR_ICE_CONTROLLED => ice_controlled = true,
            ATTR_PRIORITY if value.len() == 4 => {
                priority = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            }
            // NOMINATION is a vendor ICE2 extension; its numeric value
            // only needs to be monotonic, so reuse MESSAGE-INTEGRITY's
            // absence/presence-independent raw bytes when present.
            0xC001 if value.len() == 4 => {
                nomination = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
            }
            _ => {}
        }

        let padded_len = attr_len.div_ceil(4) * 4;
        offset = value_start + padded_len;
    }

    Some(DecodedBinding {
        transaction_id,
        is_indication: msg_type == BINDING_INDICATION,
        has_fingerprint,
        has_message_integrity,
        priority,
        username,
        ice_controlled,
        use_candidate,
        nomination,
    })
}

type HmacSha1 = Hmac<Sha1>;

fn stun_header(msg_type: u16, transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut out = Vec::with_capacity(STUN_HEADER_LEN);
    out.extend_from_slice(&msg_type.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // patched by `set_length` once the body is known
    out.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    out.extend_from_slice(transaction_id);
    out
}

/// Patches the length field (bytes 2..4) to the number of bytes following
/// the 20-byte header, per RFC 5389 §6.
fn set_length(msg: &mut [u8], len: u16) {
    msg[2..4].copy_from_slice(&len.to_be_bytes());
}

fn append_attr(msg: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    msg.extend_from_slice(&attr_type.to_be_bytes());
    msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
    msg.extend_from_slice(value);
    while msg.len() % 4 != 0 {
        msg.push(0);
    }
}

/// RFC 5389 §15.2: IPv4 XORs each part with the magic cookie; IPv6 XORs
/// with the magic cookie followed by the transaction id.
fn append_xor_mapped_address(msg: &mut Vec<u8>, addr: SocketAddr, transaction_id: &[u8; 12]) {
    let mut value = Vec::with_capacity(20);
    value.push(0); // reserved
    let cookie_bytes = STUN_MAGIC_COOKIE.to_be_bytes();
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(0x01);
            let xport = addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
            value.extend_from_slice(&xport.to_be_bytes());
            for (octet, cookie_byte) in ip.octets().iter().zip(cookie_bytes.iter()) {
                value.push(octet ^ cookie_byte);
            }
        }
        IpAddr::V6(ip) => {
            value.push(0x02);
            let xport = addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
            value.extend_from_slice(&xport.to_be_bytes());
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&cookie_bytes);
            key[4..].copy_from_slice(transaction_id);
            for (octet, key_byte) in ip.octets().iter().zip(key.iter()) {
                value.push(octet ^ key_byte);
            }
        }
    }
    append_attr(msg, ATTR_XOR_MAPPED_ADDRESS, &value);
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        487 => "Role Conflict",
        _ => "Error",
    }
}

/// RFC 5389 §15.6 layout: two reserved bytes, a class nibble, a number
/// byte, then the UTF-8 reason phrase.
fn append_error_code(msg: &mut Vec<u8>, code: u16) {
    let mut value = Vec::new();
    value.extend_from_slice(&[0, 0]);
    value.push((code / 100) as u8);
    value.push((code % 100) as u8);
    value.extend_from_slice(reason_phrase(code).as_bytes());
    append_attr(msg, ATTR_ERROR_CODE, &value);
}

/// RFC 5389 §15.4: the length field must already include this attribute's
/// own size before the HMAC is computed over the preceding bytes.
fn append_message_integrity(msg: &mut Vec<u8>, key: &[u8]) {
    let body_len_with_mi = (msg.len() - STUN_HEADER_LEN + 24) as u16;
    set_length(msg, body_len_with_mi);
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    let tag = mac.finalize().into_bytes();
    append_attr(msg, ATTR_MESSAGE_INTEGRITY, &tag);
}

/// RFC 5389 §15.5: same length-before-compute rule, CRC-32 XORed with the
/// STUN magic constant.
fn append_fingerprint(msg: &mut Vec<u8>) {
    let body_len_with_fp = (msg.len() - STUN_HEADER_LEN + 8) as u16;
    set_length(msg, body_len_with_fp);
    let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let checksum = crc.checksum(msg) ^ FINGERPRINT_XOR;
    append_attr(msg, ATTR_FINGERPRINT, &checksum.to_be_bytes());
}

/// Builds a Binding Success response: XOR-MAPPED-ADDRESS set to `peer`,
/// then MESSAGE-INTEGRITY and FINGERPRINT over everything before each
/// (spec §8: "Binding Success is emitted with XOR-MAPPED-ADDRESS equal to
/// the sender").
pub fn encode_success_response(transaction_id: &[u8; 12], peer: SocketAddr, integrity_key: &str) -> Vec<u8> {
    let mut msg = stun_header(BINDING_SUCCESS_RESPONSE, transaction_id);
    append_xor_mapped_address(&mut msg, peer, transaction_id);
    append_message_integrity(&mut msg, integrity_key.as_bytes());
    append_fingerprint(&mut msg);
    msg
}

/// Builds a Binding Error response carrying `code` (400/401/487 per spec
/// §4.5). No MESSAGE-INTEGRITY: several of these codes fire precisely
/// because the request's credentials couldn't be validated, so there is
/// no key to sign with; FINGERPRINT is still attached.
pub fn encode_error_response(transaction_id: &[u8; 12], code: u16) -> Vec<u8> {
    let mut msg = stun_header(BINDING_ERROR_RESPONSE, transaction_id);
    append_error_code(&mut msg, code);
    append_fingerprint(&mut msg);
    msg
}

/// Dispatches an `ice::IceServer` outcome to the matching wire encoder.
pub fn encode_reply(transaction_id: &[u8; 12], peer: SocketAddr, kind: &StunReplyKind) -> Vec<u8> {
    match kind {
        StunReplyKind::Success { integrity_key } => encode_success_response(transaction_id, peer, integrity_key),
        StunReplyKind::Error(code) => encode_error_response(transaction_id, *code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_request(username: &str, use_candidate: bool) -> Vec<u8> {
        let mut attrs = Vec::new();
        attrs.extend_from_slice(&ATTR_USERNAME.to_be_bytes());
        attrs.extend_from_slice(&(username.len() as u16).to_be_bytes());
        attrs.extend_from_slice(username.as_bytes());
        while attrs.len() % 4 != 0 {
            attrs.push(0);
        }
        attrs.extend_from_slice(&ATTR_PRIORITY.to_be_bytes());
        attrs.extend_from_slice(&4u16.to_be_bytes());
        attrs.extend_from_slice(&100u32.to_be_bytes());
        if use_candidate {
            attrs.extend_from_slice(&ATTR_USE_CANDIDATE.to_be_bytes());
            attrs.extend_from_slice(&0u16.to_be_bytes());
        }
        attrs.extend_from_slice(&ATTR_MESSAGE_INTEGRITY.to_be_bytes());
        attrs.extend_from_slice(&20u16.to_be_bytes());
        attrs.extend_from_slice(&[0u8; 20]);
        attrs.extend_from_slice(&ATTR_FINGERPRINT.to_be_bytes());
        attrs.extend_from_slice(&4u16.to_be_bytes());
        attrs.extend_from_slice(&[0u8; 4]);

        let mut out = Vec::new();
        out.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
        out.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        out.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(&[7u8; 12]);
        out.extend_from_slice(&attrs);
        out
    }

    #[test]
    fn classifies_stun_and_dtls_by_first_byte() {
        assert_eq!(classify_datagram(&[0]), DatagramKind::Stun);
        assert_eq!(classify_datagram(&[3, 0, 0]), DatagramKind::Stun);
        assert_eq!(classify_datagram(&[20]), DatagramKind::Dtls);
        assert_eq!(classify_datagram(&[63]), DatagramKind::Dtls);
        assert_eq!(classify_datagram(&[200]), DatagramKind::Unknown);
    }

    #[test]
    fn decodes_username_priority_and_use_candidate() {
        let bytes = encode_request("frag:peer", true);
        let decoded = decode_binding_request(&bytes).expect("valid stun message");
        assert_eq!(decoded.username, "frag:peer");
        assert_eq!(decoded.priority, 100);
        assert!(decoded.use_candidate);
        assert!(decoded.has_fingerprint);
        assert!(decoded.has_message_integrity);
        assert!(!decoded.is_indication);
        assert_eq!(decoded.transaction_id, [7u8; 12]);
    }

    #[test]
    fn rejects_bytes_without_the_magic_cookie() {
        let mut bytes = encode_request("frag:peer", false);
        bytes[4] = 0; // corrupt the magic cookie
        assert!(decode_binding_request(&bytes).is_none());
    }

    fn attr(msg: &[u8], attr_type: u16) -> Option<&[u8]> {
        let end = STUN_HEADER_LEN + u16::from_be_bytes([msg[2], msg[3]]) as usize;
        let mut offset = STUN_HEADER_LEN;
        while offset + 4 <= end {
            let t = u16::from_be_bytes([msg[offset], msg[offset + 1]]);
            let len = u16::from_be_bytes([msg[offset + 2], msg[offset + 3]]) as usize;
            let value_start = offset + 4;
            if t == attr_type {
                return Some(&msg[value_start..value_start + len]);
            }
            offset = value_start + len.div_ceil(4) * 4;
        }
        None
    }

    #[test]
    fn success_response_echoes_transaction_id_and_type() {
        let id = [9u8; 12];
        let peer: SocketAddr = "203.0.113.5:4321".parse().unwrap();
        let reply = encode_success_response(&id, peer, "pwd");

        assert_eq!(u16::from_be_bytes([reply[0], reply[1]]), BINDING_SUCCESS_RESPONSE);
        assert_eq!(&reply[8..20], &id);
    }

    #[test]
    fn success_response_xor_mapped_address_decodes_back_to_the_peer() {
        let id = [1u8; 12];
        let peer: SocketAddr = "203.0.113.5:4321".parse().unwrap();
        let reply = encode_success_response(&id, peer, "pwd");

        let value = attr(&reply, ATTR_XOR_MAPPED_ADDRESS).expect("xor-mapped-address present");
        assert_eq!(value[1], 0x01); // IPv4 family
        let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
        let port = u16::from_be_bytes([value[2], value[3]]) ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        assert_eq!(port, peer.port());
        let ip_bytes: Vec<u8> = value[4..8].iter().zip(cookie.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(ip_bytes, match peer.ip() {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            _ => unreachable!(),
        });
    }

    #[test]
    fn success_response_carries_message_integrity_and_fingerprint() {
        let id = [2u8; 12];
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let reply = encode_success_response(&id, peer, "s3cret");

        let mi = attr(&reply, ATTR_MESSAGE_INTEGRITY).expect("message-integrity present");
        assert_eq!(mi.len(), 20);
        assert!(attr(&reply, ATTR_FINGERPRINT).is_some());
    }

    #[test]
    fn fingerprint_is_verifiable_by_recomputing_the_crc() {
        let id = [3u8; 12];
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let reply = encode_success_response(&id, peer, "s3cret");

        let fp_len = STUN_HEADER_LEN + u16::from_be_bytes([reply[2], reply[3]]) as usize - 8;
        let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let expected = crc.checksum(&reply[..fp_len]) ^ FINGERPRINT_XOR;
        let actual = u32::from_be_bytes(attr(&reply, ATTR_FINGERPRINT).unwrap().try_into().unwrap());
        assert_eq!(actual, expected);
    }

    #[test]
    fn error_response_uses_the_error_message_type_and_carries_the_code() {
        let id = [4u8; 12];
        let reply = encode_error_response(&id, 487);

        assert_eq!(u16::from_be_bytes([reply[0], reply[1]]), BINDING_ERROR_RESPONSE);
        let value = attr(&reply, ATTR_ERROR_CODE).expect("error-code present");
        assert_eq!(value[2], 4);
        assert_eq!(value[3], 87);
        assert!(attr(&reply, ATTR_MESSAGE_INTEGRITY).is_none());
        assert!(attr(&reply, ATTR_FINGERPRINT).is_some());
    }

    #[test]
    fn encode_reply_dispatches_on_kind() {
        let id = [5u8; 12];
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let success = encode_reply(&id, peer, &StunReplyKind::Success { integrity_key: "pwd".to_string() });
        assert_eq!(u16::from_be_bytes([success[0], success[1]]), BINDING_SUCCESS_RESPONSE);

        let error = encode_reply(&id, peer, &StunReplyKind::Error(401));
        assert_eq!(u16::from_be_bytes([error[0], error[1]]), BINDING_ERROR_RESPONSE);
    }
}
