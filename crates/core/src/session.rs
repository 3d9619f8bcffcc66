//! Session factory (spec §4.2) and handshaker (spec §4.3).
//!
//! A `Session` owns one socket (TCP stream, or a UDP socket + peer tuple)
//! and is driven by a task spawned onto its owning worker's `LocalSet` —
//! the idiomatic reading of "the loop calls `OnEvent(READ)`" when the
//! registration itself is a `tokio` reactor (see `worker::Worker`, which
//! drives every session task to completion on a single thread via
//! `new_current_thread()`, so there is no cross-thread hop here, only
//! cooperative scheduling).

use std::io;
use std::time::{Duration, Instant};

use qrpc_protocol::{Address, CloseReason, Kind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::handshake::Handshaker;

pub const READ_BUFFER_SIZE: usize = 4096;

/// `OnShutdown`'s return value: `None` means no reconnect: either the
/// application chose not to, or the session closed for a reason that must
/// never be retried (spec §7 "a reconnect scheduled after MIGRATED or
/// SHUTDOWN is always ignored").
pub fn reconnect_delay_for(reason: &CloseReason, requested: Option<Duration>) -> Option<Duration> {
    if !reason.code.is_retryable_class() {
        return None;
    }
    requested.filter(|d| !d.is_zero())
}

/// Socket half of a session: TCP is a single stream; UDP sessions share a
/// listener/client socket with a fixed peer tuple and write via `send_to`.
pub enum Transport {
    Tcp(TcpStream),
    Udp { socket: std::sync::Arc<UdpSocket>, peer: Address },
}

impl Transport {
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf).await,
            Transport::Udp { socket, peer } => {
                let (n, from) = socket.recv_from(buf).await?;
                if from != peer.socket_addr() {
                    return Ok(0); // not from our tuple; treat as no-op read
                }
                Ok(n)
            }
        }
    }

    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.write(buf).await,
            Transport::Udp { socket, peer } => socket.send_to(buf, peer.socket_addr()).await,
        }
    }
}

/// Application hooks invoked from a session's read loop (spec §4.2 "Session
/// invariants"). Implementors run on the owning worker only.
pub trait SessionHandler: 'static {
    fn on_connect(&mut self) {}
    /// Returns the application's verdict on a completed read: `> 0` to keep
    /// going, `0` to close with `REMOTE` (peer closed cleanly... for TCP; a
    /// zero-length UDP datagram is not meaningful and is ignored instead),
    /// `< 0` to close with `LOCAL`.
    fn on_read(&mut self, bytes: &[u8]) -> i32;
    /// Called exactly once. Returning `Some(delay)` requests a reconnect
    /// after `delay` (subject to `reconnect_delay_for`'s MIGRATED/SHUTDOWN
    /// veto); `None` means the session is finished for good.
    fn on_shutdown(&mut self, _reason: &CloseReason) -> Option<Duration> {
        None
    }
}

pub struct Session<H: SessionHandler> {
    pub transport: Transport,
    pub peer_address: Address,
    pub last_active: Instant,
    pub close_reason: Option<CloseReason>,
    pub handshaker: Handshaker,
    pub handler: H,
}

impl<H: SessionHandler> Session<H> {
    pub fn new(transport: Transport, peer_address: Address, handshaker: Handshaker, handler: H) -> Self {
        Self {
            transport,
            peer_address,
            last_active: Instant::now(),
            close_reason: None,
            handshaker,
            handler,
        }
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.close_reason.is_none() && now.saturating_duration_since(self.last_active) > timeout
    }

    /// Drives the session until it closes, invoking handler callbacks.
    /// Runs as a spawned task on the worker's `LocalSet`.
    pub async fn run(mut self) -> (Self, Option<Duration>) {
        self.handler.on_connect();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let reason = loop {
            match self.transport.read(&mut buf).await {
                Ok(0) => break CloseReason::remote("peer closed"),
                Ok(n) => {
                    self.last_active = Instant::now();
                    let verdict = self.handler.on_read(&buf[..n]);
                    if verdict == 0 {
                        break CloseReason::remote("application signaled remote close");
                    } else if verdict < 0 {
                        break CloseReason::local("application signaled local close");
                    }
                }
                Err(e) => break CloseReason::syscall(e.raw_os_error().unwrap_or(-1), e.to_string()),
            }
        };

        let requested = self.handler.on_shutdown(&reason);
        let delay = reconnect_delay_for(&reason, requested);
        self.close_reason = Some(reason);
        (self, delay)
    }
}

/// Distinguishes listener vs client factories (spec §4.2).
pub enum FactoryRole {
    Listener(TcpListener),
    UdpListener(std::sync::Arc<UdpSocket>),
    Client,
}

pub struct SessionFactory {
    pub role: FactoryRole,
    pub session_timeout: Duration,
}

impl SessionFactory {
    pub async fn listen_tcp(port: u16, session_timeout: Duration) -> io::Result<(Self, u16)> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let actual_port = listener.local_addr()?.port();
        Ok((
            Self {
                role: FactoryRole::Listener(listener),
                session_timeout,
            },
            actual_port,
        ))
    }

    pub async fn listen_udp_reuseport(port: u16, session_timeout: Duration) -> io::Result<(Self, u16)> {
        let socket = crate::worker::bind_udp_reuseport(port)?;
        let actual_port = socket.local_addr()?.port();
        Ok((
            Self {
                role: FactoryRole::UdpListener(std::sync::Arc::new(socket)),
                session_timeout,
            },
            actual_port,
        ))
    }

    pub fn client(session_timeout: Duration) -> Self {
        Self {
            role: FactoryRole::Client,
            session_timeout,
        }
    }

    /// Client-side `Open`: connects and returns a `Transport` ready to hand
    /// to a new `Session`.
    pub async fn open_tcp(&self, address: Address) -> io::Result<Transport> {
        let stream = TcpStream::connect(address.socket_addr()).await?;
        Ok(Transport::Tcp(stream))
    }

    /// Client-side `Open` by hostname: resolves via the shared resolver
    /// (spec §5, `Kind::Resolve` on failure) before connecting, so a
    /// literal IP string never pays for a lookup.
    pub async fn open_named_tcp(&self, resolver: &crate::dns::Resolver, host: &str, port: u16) -> Result<Transport, CloseReason> {
        let addr = resolver.resolve(host, port).await?;
        self.open_tcp(Address::new(addr))
            .await
            .map_err(|e| CloseReason::syscall(e.raw_os_error().unwrap_or(-1), e.to_string()))
    }

    pub fn accept_udp_peer(&self, peer: Address) -> Option<Transport> {
        match &self.role {
            FactoryRole::UdpListener(socket) => Some(Transport::Udp {
                socket: std::sync::Arc::clone(socket),
                peer,
            }),
            _ => None,
        }
    }
}

/// A lightweight notification the worker's loop can select! against while
/// sessions run as independent tasks (spec §4.1 `Poll` semantics realized
/// as: "deliver each ready event... then run due alarms").
pub fn session_done_channel<T>() -> (mpsc::UnboundedSender<T>, mpsc::UnboundedReceiver<T>) {
    mpsc::unbounded_channel()
}

/// Exponential-backoff reconnect scheduler (spec §7 Retry policy, §9
/// "`track_reachability` / reconnect interaction" — resolved in DESIGN.md:
/// a reachability change resets the backoff and fires an immediate retry,
/// since a link change invalidates whatever the previous failure's backoff
/// was measuring).
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    jitter_ratio: f64,
    max_doublings: u32,
    doublings: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &crate::config::ClientConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.reconnect_initial_backoff_ms),
            max: Duration::from_millis(config.reconnect_max_backoff_ms),
            jitter_ratio: config.reconnect_jitter_ratio,
            max_doublings: config.max_retry_doublings,
            doublings: 0,
        }
    }

    /// Delay before the next reconnect attempt, with the configured doubling
    /// applied (capped at `max`) and `jitter` (deterministic, in `[0, 1)`)
    /// spreading it within `+/- jitter_ratio`.
    pub fn next_delay(&mut self, jitter: f64) -> Duration {
        // Shifts beyond 32 would already dwarf any realistic `max`, so the
        // exponent is capped there before converting to avoid `u64`-to-`u32`
        // truncation silently shrinking the computed backoff.
        let shift = self.doublings.min(self.max_doublings).min(32);
        let factor = 1u64 << shift;
        let backoff = self.initial.saturating_mul(factor as u32).min(self.max);
        self.doublings = (self.doublings + 1).min(self.max_doublings);

        let jitter = jitter.clamp(0.0, 1.0);
        let spread = 1.0 + self.jitter_ratio * (jitter * 2.0 - 1.0);
        backoff.mul_f64(spread.max(0.0))
    }

    /// A reachability change (spec §9): the next attempt should happen
    /// immediately, and the backoff sequence restarts from `initial` as if
    /// this were the first failure on the new network path.
    pub fn reset_on_reachability_change(&mut self) -> Duration {
        self.doublings = 0;
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrpc_protocol::CloseReason;

    #[test]
    fn migrated_and_shutdown_reasons_never_reconnect() {
        assert_eq!(
            reconnect_delay_for(&CloseReason::new(Kind::Migrated, 0, ""), Some(Duration::from_millis(10))),
            None
        );
        assert_eq!(
            reconnect_delay_for(&CloseReason::new(Kind::Shutdown, 0, ""), Some(Duration::from_millis(10))),
            None
        );
    }

    #[test]
    fn zero_duration_request_means_no_reconnect() {
        assert_eq!(reconnect_delay_for(&CloseReason::timeout(), Some(Duration::ZERO)), None);
        assert_eq!(reconnect_delay_for(&CloseReason::timeout(), None), None);
    }

    #[test]
    fn positive_duration_on_retryable_reason_reconnects() {
        let delay = Duration::from_millis(100);
        assert_eq!(reconnect_delay_for(&CloseReason::timeout(), Some(delay)), Some(delay));
    }

    #[test]
    fn reconnect_policy_doubles_and_caps_at_max() {
        let config = crate::config::ClientConfig {
            reconnect_initial_backoff_ms: 100,
            reconnect_max_backoff_ms: 1_000,
            reconnect_jitter_ratio: 0.0,
            max_retry_doublings: 63,
            ..Default::default()
        };
        let mut policy = ReconnectPolicy::new(&config);
        assert_eq!(policy.next_delay(0.5), Duration::from_millis(100));
        assert_eq!(policy.next_delay(0.5), Duration::from_millis(200));
        assert_eq!(policy.next_delay(0.5), Duration::from_millis(400));
        assert_eq!(policy.next_delay(0.5), Duration::from_millis(800));
        assert_eq!(policy.next_delay(0.5), Duration::from_millis(1_000)); // capped
    }

    #[test]
    fn reachability_change_resets_backoff_to_zero() {
        let config = crate::config::ClientConfig {
            reconnect_initial_backoff_ms: 100,
            reconnect_jitter_ratio: 0.0,
            ..Default::default()
        };
        let mut policy = ReconnectPolicy::new(&config);
        let _ = policy.next_delay(0.5);
        let _ = policy.next_delay(0.5);
        assert_eq!(policy.reset_on_reachability_change(), Duration::ZERO);
        assert_eq!(policy.next_delay(0.5), Duration::from_millis(100));
    }
}
