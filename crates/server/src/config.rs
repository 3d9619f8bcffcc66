//! Binary-level configuration: the bind address, worker count, and TLS
//! paths that sit above `qrpc_core::config::ServerConfig` (transport
//! tuning, hints, the WHIP path). Mirrors the teacher's `load_config`
//! (missing file -> defaults, present file -> parse-or-fail).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use qrpc_core::config::ServerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            workers: default_workers(),
            tls_cert: None,
            tls_key: None,
            server: ServerConfig::default(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4433
}
fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl AppConfig {
    /// Non-fatal issues are prefixed `WARN:`, fatal ones `ERROR:` — the
    /// caller exits non-zero only if any `ERROR:` entry is present.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.workers == 0 {
            issues.push("ERROR: workers must be at least 1".to_string());
        }
        if self.port == 0 {
            issues.push("ERROR: port must be nonzero".to_string());
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            issues.push("ERROR: tls_cert and tls_key must both be set or both omitted".to_string());
        }
        if self.server.transport.whip_path.is_empty() || !self.server.transport.whip_path.starts_with('/') {
            issues.push("WARN: transport.whip_path should start with '/'; falling back to /whip".to_string());
        }
        issues
    }
}

/// Loads configuration from a TOML file. A missing file is not an error —
/// the server starts with defaults, same as the teacher's `load_config`.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        tracing::warn!("config file not found at {}, using defaults", path.display());
        return Ok(AppConfig::default());
    }

    let contents = std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: AppConfig = toml::from_str(&contents).with_context(|| "failed to parse config TOML")?;
    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().iter().all(|i| !i.starts_with("ERROR:")));
    }

    #[test]
    fn zero_workers_is_an_error() {
        let mut cfg = AppConfig::default();
        cfg.workers = 0;
        assert!(cfg.validate().iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn mismatched_tls_paths_is_an_error() {
        let mut cfg = AppConfig::default();
        cfg.tls_cert = Some("cert.pem".to_string());
        assert!(cfg.validate().iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: AppConfig = toml::from_str("port = 9000").unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.bind, default_bind());
    }
}
