mod bootstrap;
mod config;
mod signaling;
mod stun_codec;
mod tls;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use qrpc_core::handler_map::{HandlerEntry, HandlerMap};
use qrpc_core::stream::PayloadMode;
use qrpc_core::worker::Server;

use crate::bootstrap::WorkerBootstrap;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/qrpc.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

/// Best-effort discovery of the machine's routable address, used as the
/// sole ICE host candidate when `bind` is `0.0.0.0` (spec §4.9
/// "Candidates" assumes at least one usable IP). Connecting a UDP socket
/// never sends a packet, it just asks the kernel to pick a route.
fn discover_candidate_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

fn build_handler_map() -> HandlerMap {
    let mut handlers = HandlerMap::new();
    // Echoes every inbound CodedByte message back on the same stream
    // (spec.md's walkthrough scenario); real deployments register their
    // own labels before `Server` spawns workers.
    handlers.register(
        "echo",
        HandlerEntry::Stream {
            mode: PayloadMode::Binary,
            handler: Arc::new(|kind| {
                tracing::debug!(?kind, "echo stream opened");
            }),
        },
    );
    handlers
}

fn main() -> Result<()> {
    rustls::crypto::ring::default_provider().install_default().expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let (config_path, port_override) = parse_args();

    let mut app_config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        app_config.port = p;
    }

    let issues = app_config.validate();
    let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{issue}");
        } else {
            tracing::warn!("{issue}");
        }
    }
    if has_errors {
        tracing::error!("configuration has {} issue(s); fix the ERROR(s) above and restart", issues.len());
        std::process::exit(1);
    }

    let bind_ip: IpAddr = app_config.bind.parse().context("invalid bind address")?;
    let candidate_ips = if bind_ip.is_unspecified() { vec![discover_candidate_ip()] } else { vec![bind_ip] };

    let tls_acceptor = match (app_config.tls_cert.as_deref(), app_config.tls_key.as_deref()) {
        (Some(cert), Some(key)) => {
            let result = tls::build_tls_config(Some(cert), Some(key))?;
            tracing::info!(fingerprint = %result.fingerprint_sha256, "TLS enabled for WHIP signaling");
            Some(Arc::new(tls::make_acceptor(result.config)))
        }
        _ => {
            tracing::info!("TLS disabled for WHIP signaling (no tls_cert/tls_key configured)");
            None
        }
    };

    // The DTLS media transport always advertises a cert fingerprint,
    // independently of whether the signaling port itself runs TLS, so a
    // plain-HTTP deployment still gets a valid `a=fingerprint` answer line.
    let dtls_cert = tls::build_tls_config(app_config.tls_cert.as_deref(), app_config.tls_key.as_deref())?;

    let handler_map = Arc::new(build_handler_map());
    let svconf = Arc::new(app_config.server.clone());

    let server = Server::new(app_config.workers);
    let alive = server.alive_flag();
    // Provisioned for a future client-mode path (TURN relay, SFU-to-SFU
    // federation): this WHIP-ingest binary only accepts inbound offers, so
    // nothing here resolves a remote hostname yet.
    let _resolver = server.resolver();

    tracing::info!(
        bind = %app_config.bind,
        port = app_config.port,
        workers = server.worker_count(),
        whip_path = %svconf.transport.whip_path,
        "starting qrpc-server"
    );

    let mut threads = Vec::with_capacity(server.worker_count());
    for i in 0..server.worker_count() {
        let bootstrap = WorkerBootstrap {
            thread_id: qrpc_core::ThreadId(i as u16),
            bind_ip,
            port: app_config.port,
            handler_map: Arc::clone(&handler_map),
            svconf: Arc::clone(&svconf),
            tls_acceptor: tls_acceptor.clone(),
            candidate_ips: candidate_ips.clone(),
            local_fingerprint: dtls_cert.fingerprint_sha256.clone(),
            alive: Arc::clone(&alive),
        };

        threads.push(std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("failed to build worker runtime");
            if let Err(e) = runtime.block_on(bootstrap::run(bootstrap)) {
                tracing::error!("worker {i} exited with error: {e}");
            }
        }));
    }

    install_shutdown_handler(Arc::clone(&alive));

    for handle in threads {
        let _ = handle.join();
    }

    tracing::info!("qrpc-server shut down cleanly");
    Ok(())
}

/// Installs a `SIGINT`/`SIGTERM` handler that flips `alive` once. `main`
/// is deliberately not `#[tokio::main]` — each worker owns its own
/// current-thread runtime (spec §4.14) — so the signal wait runs on a
/// small dedicated runtime of its own rather than threading a handle
/// through every worker.
fn install_shutdown_handler(alive: Arc<std::sync::atomic::AtomicBool>) {
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("failed to build signal runtime");
        runtime.block_on(async {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => { tracing::info!("received SIGINT, shutting down"); }
                    _ = sigterm.recv() => { tracing::info!("received SIGTERM, shutting down"); }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("received ctrl-c, shutting down");
            }
        });
        alive.store(false, std::sync::atomic::Ordering::Release);
    });
}
