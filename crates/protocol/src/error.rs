//! Error taxonomy shared by every layer of the stack (spec §7).
//!
//! Lower layers translate OS/library errors into the closest `Kind` plus a
//! detail integer (usually errno); `Connection`/`Stream` close paths bundle
//! a `Kind` into a `CloseReason` that is handed to the application once.

use serde::{Deserialize, Serialize};

/// Coarse-grained reason a session, connection, or stream went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// A kernel call failed; detail carries errno.
    Syscall,
    /// An idle or handshake deadline expired.
    Timeout,
    /// Bad STUN, DTLS alert, malformed SDP, SCTP abort.
    Protocol,
    /// DNS failure during client connect.
    Resolve,
    /// Application-initiated close.
    Local,
    /// Peer-initiated close.
    Remote,
    /// Ownership transferred to another processor; not an error per se.
    Migrated,
    /// Graceful factory teardown.
    Shutdown,
    /// Library-internal allocation failure.
    Alloc,
    /// Caller passed invalid arguments or state.
    Invalid,
    /// Operation is not supported in this configuration.
    NotSupported,
    /// Connection/stream is going away (e.g. an in-flight RPC on close).
    Goaway,
    /// A user callback returned an error.
    Callback,
}

impl Kind {
    /// Whether a session closed with this reason should ever be retried.
    /// `Migrated` and `Shutdown` are never retried (spec §7 Retry policy).
    pub fn is_retryable_class(self) -> bool {
        !matches!(self, Kind::Migrated | Kind::Shutdown)
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Kind::Syscall => "SYSCALL",
            Kind::Timeout => "TIMEOUT",
            Kind::Protocol => "PROTOCOL",
            Kind::Resolve => "RESOLVE",
            Kind::Local => "LOCAL",
            Kind::Remote => "REMOTE",
            Kind::Migrated => "MIGRATED",
            Kind::Shutdown => "SHUTDOWN",
            Kind::Alloc => "ALLOC",
            Kind::Invalid => "INVALID",
            Kind::NotSupported => "NOT_SUPPORTED",
            Kind::Goaway => "GOAWAY",
            Kind::Callback => "CALLBACK",
        };
        f.write_str(s)
    }
}

/// Bundled close reason handed to `on_close`/`on_shutdown` callbacks exactly
/// once per object (spec §3 Session, §7 Propagation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseReason {
    pub code: Kind,
    /// Implementation-specific detail (errno, SCTP abort cause, ...).
    pub detail: i32,
    pub message: String,
}

impl CloseReason {
    pub fn new(code: Kind, detail: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            detail,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(Kind::Timeout, 0, "idle timeout")
    }

    pub fn local(message: impl Into<String>) -> Self {
        Self::new(Kind::Local, 0, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(Kind::Remote, 0, message)
    }

    pub fn syscall(errno: i32, message: impl Into<String>) -> Self {
        Self::new(Kind::Syscall, errno, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(Kind::Protocol, 0, message)
    }

    pub fn resolve(message: impl Into<String>) -> Self {
        Self::new(Kind::Resolve, 0, message)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.detail, self.message)
    }
}

impl std::error::Error for CloseReason {}

#[derive(Debug, thiserror::Error)]
pub enum QrpcError {
    #[error("{0}")]
    Closed(#[from] CloseReason),
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("operation not supported: {0}")]
    NotSupported(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrated_and_shutdown_never_retry() {
        assert!(!Kind::Migrated.is_retryable_class());
        assert!(!Kind::Shutdown.is_retryable_class());
        assert!(Kind::Timeout.is_retryable_class());
    }

    #[test]
    fn close_reason_displays_kind_and_message() {
        let reason = CloseReason::timeout();
        let s = reason.to_string();
        assert!(s.contains("TIMEOUT"));
        assert!(s.contains("idle timeout"));
    }
}
