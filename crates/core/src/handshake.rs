//! Handshaker: plain vs TLS byte framing on a session (spec §4.3).
//!
//! This governs the *signaling* TCP session (the WHIP HTTP endpoint), not
//! the DTLS-over-UDP media transport — that state machine lives in
//! `dtls::DtlsTransport`. `tokio_rustls`'s `TlsAcceptor::accept` already
//! drives the handshake's `WANT_READ`/`WANT_WRITE` alternation internally
//! by polling the underlying stream, so there is nothing left for us to
//! step by hand; we only need to hold the result and support migrating an
//! already-finished stream into a new owner without touching the
//! handshake again.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::{server::TlsStream, TlsAcceptor};

/// Strategy for a session's byte framing.
pub enum Handshaker {
    /// Handshake is "done" the instant the socket is writable.
    Plain(TcpStream),
    /// A completed (or in-progress) TLS server handshake.
    Tls(TlsState),
}

pub enum TlsState {
    Handshaking(Arc<TlsAcceptor>),
    Established(TlsStream<TcpStream>),
}

impl Handshaker {
    pub fn plain(stream: TcpStream) -> Self {
        Handshaker::Plain(stream)
    }

    pub fn tls_pending(acceptor: Arc<TlsAcceptor>) -> Self {
        Handshaker::Tls(TlsState::Handshaking(acceptor))
    }

    /// Drives the TLS handshake to completion, if one is pending.
    pub async fn complete(self, stream: TcpStream) -> std::io::Result<Handshaker> {
        match self {
            Handshaker::Plain(_) => Ok(Handshaker::Plain(stream)),
            Handshaker::Tls(TlsState::Handshaking(acceptor)) => {
                let tls = acceptor.accept(stream).await?;
                Ok(Handshaker::Tls(TlsState::Established(tls)))
            }
            established @ Handshaker::Tls(TlsState::Established(_)) => Ok(established),
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(
            self,
            Handshaker::Plain(_) | Handshaker::Tls(TlsState::Established(_))
        )
    }

    /// Transfers an established handshake to a new logical owner (spec
    /// §4.3 `MigrateTo`, used by the HTTP→WebSocket upgrade) without
    /// renegotiating.
    pub fn migrate_to(self) -> Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_handshake_is_immediately_established() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) =
            tokio::try_join!(async { listener.accept().await.map(|(s, _)| s) }, TcpStream::connect(addr))
                .unwrap();

        let h = Handshaker::plain(accepted);
        assert!(h.is_established());
        drop(connected);
    }
}
