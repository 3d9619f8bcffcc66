//! Worker + Server (spec §4.14).
//!
//! A `Server` owns N `Worker`s; each `Worker` owns one `tokio` current-thread
//! runtime and one OS thread — the realization of "one Loop and one
//! thread" chosen in `SPEC_FULL.md` §4.1. Every worker independently binds
//! all listener ports (`SO_REUSEPORT` for UDP, via `socket2`) and runs its
//! runtime until the shared `alive` flag flips.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use qrpc_protocol::{Address, ThreadId};

use crate::alarm::Timer;
use crate::dns::Resolver;
use crate::handler_map::HandlerMap;

/// Binds a UDP socket with `SO_REUSEPORT` set before bind, so every worker
/// can independently bind the same port and let the kernel load-balance
/// datagrams across them.
pub fn bind_udp_reuseport(port: u16) -> std::io::Result<UdpSocket> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Cross-worker task: closures carry only owned data so the target worker
/// can apply them synchronously on its own thread (spec §9 "Cross-thread
/// command enqueue").
pub type CrossWorkerTask = Box<dyn FnOnce() + Send>;

/// Per-port configuration bundle a `Server` hands each `Worker`.
#[derive(Clone)]
pub struct PortConfig {
    pub address: Address,
    pub handler_map: Arc<HandlerMap>,
    pub svconf: Arc<crate::config::ServerConfig>,
}

/// One worker thread: owns a loop (the `tokio` runtime), a timer, and a
/// single-producer/multi-consumer task queue for cross-worker work (spec
/// §4.14 "drained once per loop iteration before Poll").
pub struct Worker {
    pub id: ThreadId,
    pub ports: Vec<PortConfig>,
    task_rx: mpsc::UnboundedReceiver<CrossWorkerTask>,
    pub task_tx: mpsc::UnboundedSender<CrossWorkerTask>,
    pub timer: Timer,
    alive: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(id: ThreadId, ports: Vec<PortConfig>, alive: Arc<AtomicBool>) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        Self {
            id,
            ports,
            task_rx,
            task_tx,
            timer: Timer::new(),
            alive,
        }
    }

    /// Drains the cross-worker task queue. Called once per loop iteration,
    /// before alarms and socket polling, matching spec §4.14.
    fn drain_tasks(&mut self) {
        while let Ok(task) = self.task_rx.try_recv() {
            task();
        }
    }

    /// Runs this worker's loop until `alive` flips false. Sessions,
    /// connections, and listeners for this worker's ports are expected to
    /// already be spawned onto the same `tokio::task::LocalSet` driving
    /// this call (see `qrpc-server`'s per-thread bootstrap).
    pub async fn run(mut self) {
        loop {
            self.drain_tasks();

            if !self.alive.load(Ordering::Acquire) {
                tracing::info!(worker = self.id.0, "shutting down: alive flag cleared");
                break;
            }

            let now = std::time::Instant::now();
            self.timer.run_due(now);

            let sleep_until = self
                .timer
                .next_deadline()
                .unwrap_or(now + Duration::from_millis(250));
            tokio::time::sleep_until(sleep_until.into()).await;
        }
    }
}

/// Spawns and owns N `Worker`s (spec §4.14). Shutdown is cooperative:
/// `shutdown()` clears `alive`; each worker notices on its next loop tick.
pub struct Server {
    alive: Arc<AtomicBool>,
    worker_count: usize,
    /// One resolver for the whole process, shared by `Arc` with every
    /// worker's client-mode `SessionFactory`s (spec §5).
    resolver: Arc<Resolver>,
}

impl Server {
    pub fn new(worker_count: usize) -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            worker_count: worker_count.max(1),
            resolver: Arc::new(Resolver::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive)
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        Arc::clone(&self.resolver)
    }

    /// Requests cooperative shutdown of every worker.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_starts_alive_and_shutdown_flips_flag() {
        let server = Server::new(4);
        assert!(server.is_alive());
        server.shutdown();
        assert!(!server.is_alive());
    }

    #[tokio::test]
    async fn worker_drains_queued_tasks_each_tick() {
        let alive = Arc::new(AtomicBool::new(true));
        let worker = Worker::new(ThreadId(0), Vec::new(), Arc::clone(&alive));
        let tx = worker.task_tx.clone();

        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        tx.send(Box::new(move || r.store(true, Ordering::SeqCst))).unwrap();

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        alive.store(false, Ordering::Release);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn worker_count_is_at_least_one() {
        assert_eq!(Server::new(0).worker_count(), 1);
    }
}
