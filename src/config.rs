use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level server configuration.
///
/// Loaded from `config.yaml` when present, otherwise built from defaults
/// with a `LISTEN` environment override for the bind address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub buffer: BufferConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub listen_addr: String,
    /// Seconds a connection may sit idle mid-request before a 408.
    pub request_timeout_secs: u64,
}

/// Parser limits. A value of `0` disables the corresponding check where
/// the protocol allows it (header size, body size).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_request_line_size: usize,
    pub max_header_count: usize,
    pub client_max_header_size: usize,
    pub client_max_body_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bytes a buffer may hold in memory before spilling to disk.
    pub max_in_memory_size: usize,
    /// Directory spill files are created under. Must exist and be writable.
    pub temp_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path the session registry is serialized to on shutdown.
    pub file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_line_size: 8192,
            max_header_count: 100,
            client_max_header_size: 8192,
            client_max_body_size: 10 * 1024 * 1024,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_in_memory_size: 64 * 1024,
            temp_dir: PathBuf::from("/tmp"),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("sessions.bin"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            buffer: BufferConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Loads `config.yaml` from the working directory if it exists,
    /// otherwise falls back to defaults plus the `LISTEN` env override.
    pub fn load() -> Self {
        if Path::new("config.yaml").exists() {
            match Self::load_from_file("config.yaml") {
                Ok(cfg) => return cfg,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load config.yaml, using defaults");
                }
            }
        }

        let mut cfg = Config::default();
        if let Ok(addr) = std::env::var("LISTEN") {
            cfg.server.listen_addr = addr;
        }
        cfg
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}
