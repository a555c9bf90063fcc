use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Geometric growth policy for a per-connection buffer.
///
/// The header parse buffer starts at `initial` bytes and is multiplied by
/// `growth_factor` each time it runs out of room, never exceeding `max`.
/// `max` is also the largest request header block accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferPolicy {
    pub initial: usize,
    pub growth_factor: usize,
    pub max: usize,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            initial: 4096,
            growth_factor: 2,
            max: 8192,
        }
    }
}

impl BufferPolicy {
    /// Next capacity after `current`, or `None` once the cap is reached.
    pub fn grow(&self, current: usize) -> Option<usize> {
        if current >= self.max {
            return None;
        }
        let next = current.saturating_mul(self.growth_factor.max(2));
        Some(next.min(self.max))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsSettings {
    /// PEM file holding the certificate chain.
    pub cert_path: PathBuf,
    /// PEM file holding the private key.
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub worker_threads: usize,
    /// Requests allowed to run or wait inside the worker pool at once.
    pub max_pending_work: usize,
    pub segment_size: usize,
    pub header_buffer: BufferPolicy,
    pub max_body_size: usize,
    pub session_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub tls: Option<TlsSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            worker_threads: 8,
            max_pending_work: 64,
            segment_size: 4096,
            header_buffer: BufferPolicy::default(),
            max_body_size: 1024 * 1024,
            session_timeout_secs: 30 * 60,
            shutdown_grace_secs: 10,
            tls: None,
        }
    }
}

impl Config {
    /// Builds the runtime configuration.
    ///
    /// `NBHTTP_CONFIG` may name a YAML file; `LISTEN` overrides the listen
    /// address either way. A config file that cannot be read or parsed is
    /// reported and the defaults are used instead.
    pub fn load() -> Self {
        let mut cfg = match std::env::var("NBHTTP_CONFIG") {
            Ok(path) => Self::from_file(&path).unwrap_or_else(|e| {
                tracing::error!(path = %path, "Ignoring config file: {:#}", e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        if let Ok(addr) = std::env::var("LISTEN") {
            cfg.listen_addr = addr;
        }

        cfg
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw).context("parsing YAML config")?;
        if cfg.header_buffer.initial == 0 || cfg.header_buffer.initial > cfg.header_buffer.max {
            anyhow::bail!("header_buffer.initial must be between 1 and header_buffer.max");
        }
        if cfg.segment_size == 0 {
            anyhow::bail!("segment_size must be positive");
        }
        Ok(cfg)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
