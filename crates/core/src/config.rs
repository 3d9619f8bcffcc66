//! `qrpc_svconf` / `qrpc_clconf` (spec §6.4 Configuration).
//!
//! Mirrors the teacher's `ServerConfig`/`VideoConfig` split: every field has
//! a `#[serde(default = "...")]` so a TOML document only needs to override
//! what it cares about. Callback hooks (`on_open`, `on_close`) aren't
//! serializable and are attached separately when a port is registered with
//! a `Worker` (see `worker::PortConfig`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FingerprintAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Default for FingerprintAlgorithm {
    fn default() -> Self {
        FingerprintAlgorithm::Sha256
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_max_outgoing_stream_size")]
    pub max_outgoing_stream_size: u16,
    #[serde(default = "default_initial_incoming_stream_size")]
    pub initial_incoming_stream_size: u16,
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default)]
    pub fingerprint_algorithm: FingerprintAlgorithm,
    #[serde(default = "default_whip_path")]
    pub whip_path: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_outgoing_stream_size: default_max_outgoing_stream_size(),
            initial_incoming_stream_size: default_initial_incoming_stream_size(),
            send_buffer_size: default_send_buffer_size(),
            session_timeout_ms: default_session_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            fingerprint_algorithm: FingerprintAlgorithm::default(),
            whip_path: default_whip_path(),
        }
    }
}

/// Per-port server configuration (`qrpc_svconf`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default = "default_accept_per_loop")]
    pub accept_per_loop: u32,
    #[serde(default)]
    pub max_session_hint: u32,
    #[serde(default)]
    pub max_stream_hint: u32,
    /// When true, the hints above are enforced as hard caps rather than
    /// pre-allocation sizing advice.
    #[serde(default)]
    pub hint_as_limit: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            accept_per_loop: default_accept_per_loop(),
            max_session_hint: 0,
            max_stream_hint: 0,
            hint_as_limit: false,
        }
    }
}

/// Client-side equivalent (`qrpc_clconf`): transport fields plus
/// reconnect/reachability policy (spec §7 Retry policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default = "default_reconnect_initial_backoff_ms")]
    pub reconnect_initial_backoff_ms: u64,
    #[serde(default = "default_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
    #[serde(default = "default_reconnect_jitter_ratio")]
    pub reconnect_jitter_ratio: f64,
    #[serde(default = "default_max_retry_doublings")]
    pub max_retry_doublings: u32,
    /// Re-probe reachability (e.g. after a mobile network change) before
    /// the next scheduled reconnect attempt fires.
    #[serde(default)]
    pub track_reachability: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            reconnect_initial_backoff_ms: default_reconnect_initial_backoff_ms(),
            reconnect_max_backoff_ms: default_reconnect_max_backoff_ms(),
            reconnect_jitter_ratio: default_reconnect_jitter_ratio(),
            max_retry_doublings: default_max_retry_doublings(),
            track_reachability: false,
        }
    }
}

fn default_max_outgoing_stream_size() -> u16 {
    65535
}
fn default_initial_incoming_stream_size() -> u16 {
    1024
}
fn default_send_buffer_size() -> usize {
    262_144
}
fn default_session_timeout_ms() -> u64 {
    30_000
}
fn default_connection_timeout_ms() -> u64 {
    10_000
}
fn default_whip_path() -> String {
    "/whip".to_string()
}
fn default_accept_per_loop() -> u32 {
    16
}
fn default_reconnect_initial_backoff_ms() -> u64 {
    100
}
// spec §7: capped at one hour.
fn default_reconnect_max_backoff_ms() -> u64 {
    3_600_000
}
fn default_reconnect_jitter_ratio() -> f64 {
    0.2
}
// spec §7: capped at 63 retry doublings.
fn default_max_retry_doublings() -> u32 {
    63
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults_are_self_consistent() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.transport.whip_path, "/whip");
        assert!(!cfg.hint_as_limit);
    }

    #[test]
    fn client_config_parses_partial_toml_with_defaults() {
        let cfg: ClientConfig = toml::from_str("reconnect_initial_backoff_ms = 50").unwrap();
        assert_eq!(cfg.reconnect_initial_backoff_ms, 50);
        assert_eq!(cfg.max_retry_doublings, 63);
        assert_eq!(cfg.transport.session_timeout_ms, default_session_timeout_ms());
    }
}
