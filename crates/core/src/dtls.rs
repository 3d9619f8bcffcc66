//! DTLS transport wrapper (spec §4.6). Handshake state machine, SRTP key
//! export, and crypto primitives are the wrapped DTLS library's job; this module owns
//! role negotiation, fingerprint comparison against the SDP-advertised
//! value, and funneling outbound bytes back through the connection's
//! currently selected ICE tuple.

use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use qrpc_protocol::{CloseReason, Kind};

use crate::config::FingerprintAlgorithm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    Server,
    Client,
    /// Resolved from SDP `a=setup` once the offer is parsed (spec §4.6).
    Auto,
}

impl DtlsRole {
    /// `a=setup:actpass` from the peer resolves to us being `active`
    /// (client) since we answer `a=setup:active` unconditionally (spec
    /// §4.9 "Produce answer": "a=setup:active ... are always emitted").
    pub fn resolve(setup_attr: &str) -> DtlsRole {
        match setup_attr {
            "active" => DtlsRole::Server, // peer is active => we are passive/server
            "passive" => DtlsRole::Client,
            _ => DtlsRole::Client, // actpass: we always answer active
        }
    }

    pub fn is_client(self) -> bool {
        matches!(self, DtlsRole::Client)
    }
}

/// SRTP keying material derived on handshake success (spec §4.6).
pub struct SrtpKeyingMaterial {
    pub local_key: Vec<u8>,
    pub remote_key: Vec<u8>,
    pub crypto_suite: String,
    pub peer_cert_fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsTransportState {
    New,
    Connecting,
    Connected,
    Failed,
}

pub struct DtlsTransport {
    pub role: DtlsRole,
    pub state: DtlsTransportState,
    pub fingerprint_algorithm: FingerprintAlgorithm,
    /// The fingerprint the peer advertised in its SDP offer, in lowercase
    /// hex-colon form.
    pub expected_remote_fingerprint: String,
}

impl DtlsTransport {
    pub fn new(role: DtlsRole, fingerprint_algorithm: FingerprintAlgorithm, expected_remote_fingerprint: String) -> Self {
        Self {
            role,
            state: DtlsTransportState::New,
            fingerprint_algorithm,
            expected_remote_fingerprint: normalize_fingerprint(&expected_remote_fingerprint),
        }
    }

    /// Verifies the peer's certificate against the SDP-advertised
    /// fingerprint (spec §4.6 "On fingerprint mismatch: fails handshake").
    pub fn verify_peer_certificate(&mut self, peer_cert_der: &[u8]) -> Result<(), CloseReason> {
        let actual = fingerprint(self.fingerprint_algorithm, peer_cert_der);
        if actual != self.expected_remote_fingerprint {
            self.state = DtlsTransportState::Failed;
            return Err(CloseReason::new(
                Kind::Protocol,
                0,
                format!("DTLS fingerprint mismatch: expected {}, got {actual}", self.expected_remote_fingerprint),
            ));
        }
        self.state = DtlsTransportState::Connected;
        Ok(())
    }
}

/// Computes a certificate fingerprint in lowercase colon-separated hex,
/// the form used by SDP `a=fingerprint` (spec §6.3).
pub fn fingerprint(algorithm: FingerprintAlgorithm, cert_der: &[u8]) -> String {
    let digest: Vec<u8> = match algorithm {
        FingerprintAlgorithm::Sha1 => Sha1::digest(cert_der).to_vec(),
        FingerprintAlgorithm::Sha224 => Sha224::digest(cert_der).to_vec(),
        FingerprintAlgorithm::Sha256 => Sha256::digest(cert_der).to_vec(),
        FingerprintAlgorithm::Sha384 => Sha384::digest(cert_der).to_vec(),
        FingerprintAlgorithm::Sha512 => Sha512::digest(cert_der).to_vec(),
    };
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
        .to_lowercase()
}

pub fn algorithm_sdp_name(algorithm: FingerprintAlgorithm) -> &'static str {
    match algorithm {
        FingerprintAlgorithm::Sha1 => "sha-1",
        FingerprintAlgorithm::Sha224 => "sha-224",
        FingerprintAlgorithm::Sha256 => "sha-256",
        FingerprintAlgorithm::Sha384 => "sha-384",
        FingerprintAlgorithm::Sha512 => "sha-512",
    }
}

fn normalize_fingerprint(s: &str) -> String {
    s.to_lowercase()
}
