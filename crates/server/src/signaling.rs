//! WHIP (WebRTC-HTTP Ingestion Protocol) signaling (spec §6.1, §4.9): a
//! `POST <whip_path>` with an SDP offer body allocates a `Connection` and
//! answers `201 Created` with the SDP answer and a `Location` header; a
//! `DELETE` on that location tears the connection down. Grounded in
//! `qrpc_core::sdp::negotiate` and `qrpc_core::http`'s WHIP response
//! helpers, which already carry the wire-format details.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use rand::distributions::Alphanumeric;
use rand::Rng;

use qrpc_core::config::ServerConfig;
use qrpc_core::connection::Connection;
use qrpc_core::dtls::{DtlsRole, DtlsTransport};
use qrpc_core::handler_map::HandlerMap;
use qrpc_core::http::{bad_request_response, no_content_response, not_found_response, whip_created_response, HttpRequest};
use qrpc_core::ice::IceServer;
use qrpc_core::sctp::SctpAssociation;
use qrpc_core::sdp::{self, LocalAnswerContext};
use qrpc_core::{CloseReason, MediaPath, ThreadId};
use qrpc_protocol::media_path::MediaKind;

/// Live connections for one worker, keyed by ICE username fragment — which
/// doubles as the WHIP resource id appended to `Location` (spec §6.1
/// "a resource URL the client later `DELETE`s").
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Looks up the connection for `ufrag` and runs its ICE state machine
    /// against a decoded binding request (spec §4.5).
    pub(crate) fn process_binding_request(
        &self,
        ufrag: &str,
        binding: qrpc_core::ice::BindingRequest,
        peer: qrpc_protocol::Address,
    ) -> qrpc_core::ice::IceOutcome {
        let mut connections = self.connections.lock().unwrap();
        let Some(connection) = connections.get_mut(ufrag) else {
            return qrpc_core::ice::IceOutcome::Ignored;
        };
        connection.ice_server.process_binding_request(binding, peer)
    }
}

/// Everything a worker's signaling loop needs to answer a WHIP offer that
/// doesn't change per-request (spec §4.2's per-port configuration, plus the
/// TLS cert fingerprint advertised for the signaling channel itself).
pub struct WhipContext {
    pub thread_id: ThreadId,
    pub handler_map: Arc<HandlerMap>,
    pub svconf: Arc<ServerConfig>,
    pub candidate_ips: Vec<IpAddr>,
    pub udp_port: u16,
    pub whip_path: String,
    /// SHA-256 fingerprint of the certificate the DTLS handshake will
    /// present, advertised in every answer's `a=fingerprint` line.
    pub local_fingerprint: String,
}

fn random_ice_credential(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

/// Handles one WHIP POST: negotiates an answer, allocates the
/// ICE/DTLS/SCTP/Connection stack (spec §4.8), registers producers for any
/// inbound media sections, and returns the raw HTTP response bytes.
pub fn handle_whip_post(req: &HttpRequest, registry: &ConnectionRegistry, ctx: &WhipContext) -> Vec<u8> {
    let offer_sdp = String::from_utf8_lossy(&req.body);

    let parsed_offer = match sdp::parse_offer(&offer_sdp) {
        Ok(offer) => offer,
        Err(e) => return bad_request_response(&format!("invalid SDP offer: {e}")),
    };
    let remote_fingerprint = parsed_offer
        .session_fingerprint
        .as_ref()
        .or_else(|| parsed_offer.media_sections.iter().find_map(|m| m.fingerprint.as_ref()))
        .map(|(_, hash)| hash.clone())
        .unwrap_or_default();

    let ufrag = random_ice_credential(8);
    let pwd = random_ice_credential(24);
    let cname = uuid::Uuid::new_v4().to_string();

    let answer_ctx = LocalAnswerContext {
        ice_ufrag: ufrag.clone(),
        ice_pwd: pwd.clone(),
        fingerprint_algorithm_name: fingerprint_sdp_name(ctx.svconf.transport.fingerprint_algorithm),
        fingerprint: ctx.local_fingerprint.clone(),
        candidate_ips: ctx.candidate_ips.clone(),
        udp_port: ctx.udp_port,
        sctp_port: 5000,
        max_message_size: ctx.svconf.transport.max_outgoing_stream_size as usize,
    };

    let negotiated = match sdp::negotiate(&offer_sdp, &cname, &answer_ctx) {
        Ok(result) => result,
        Err(e) => return bad_request_response(&format!("negotiation failed: {e}")),
    };

    let ice_server = IceServer::new(ufrag.clone(), pwd);
    // We always answer `a=setup:active`, so our role is always the DTLS
    // client side of the handshake (see `DtlsRole::resolve`'s doc comment).
    let dtls_transport = DtlsTransport::new(DtlsRole::Client, ctx.svconf.transport.fingerprint_algorithm, remote_fingerprint);
    let sctp_association = SctpAssociation::new(true, ctx.svconf.transport.max_outgoing_stream_size as usize);

    let mut connection = Connection::new(ctx.thread_id, cname.clone(), ice_server, dtls_transport, sctp_association, Arc::clone(&ctx.handler_map));

    for section in &negotiated.sections {
        let Ok(kind) = section.media_type.parse::<MediaKind>() else {
            continue; // the datachannel ("application") section has no RTP producer
        };
        let media_path = MediaPath::new(&cname, &section.mid, kind);
        connection.create_producer(&section.mid, media_path, section.rtp_parameters.clone());
    }

    registry.connections.lock().unwrap().insert(ufrag.clone(), connection);

    let location = format!("{}/{}", ctx.whip_path.trim_end_matches('/'), ufrag);
    whip_created_response(&negotiated.answer, &location)
}

/// Handles a WHIP teardown `DELETE <whip_path>/<ufrag>` (spec §6.1).
pub fn handle_whip_delete(resource_id: &str, registry: &ConnectionRegistry) -> Vec<u8> {
    let mut connections = registry.connections.lock().unwrap();
    match connections.remove(resource_id) {
        Some(mut connection) => {
            connection.close(CloseReason::local("WHIP DELETE"));
            no_content_response()
        }
        None => not_found_response(),
    }
}

fn fingerprint_sdp_name(algorithm: qrpc_core::config::FingerprintAlgorithm) -> String {
    use qrpc_core::config::FingerprintAlgorithm::*;
    match algorithm {
        Sha1 => "sha-1",
        Sha224 => "sha-224",
        Sha256 => "sha-256",
        Sha384 => "sha-384",
        Sha512 => "sha-512",
    }
    .to_string()
}

