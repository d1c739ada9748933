//! Stream and multiplexer configuration.
//!
//! Both structs are immutable once handed to `Stream::new` / `Mux::new`.
//! Loading them (files, flags) is the caller's business; `from_toml_str`
//! and `with_env_overrides` cover the common cases.

use crate::error::{Result, TransportError};
use crate::streaming::compress::CodecKind;
use serde::Deserialize;
use std::time::Duration;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

/// Default number of Send requests buffered ahead of transmission.
pub const DEFAULT_BURST: usize = 32;

/// Default maximum uncompressed block size (256KB)
pub const DEFAULT_BLOCK_MAX_SIZE: usize = 256 * KIB;

pub const MIN_BLOCK_MAX_SIZE: usize = 4 * KIB;
pub const MAX_BLOCK_MAX_SIZE: usize = 4 * MIB;

/// Default maximum encoded header size (64KB)
pub const DEFAULT_MAX_HEADER_SIZE: usize = 64 * KIB;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * KIB;

pub const DEFAULT_API_VERSION: &str = "v1";

pub const ENV_BURST_NUM: &str = "OBJSTREAM_BURST_NUM";
pub const ENV_DRY_RUN: &str = "OBJSTREAM_DRY_RUN";

/// Session-wide compression toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    Never,
    Always,
}

/// What happens to the session when a write fails.
///
/// Frames written before the failure count as delivered: the wire has no
/// per-frame acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Abort the session and fail every outstanding request.
    #[default]
    Never,
    /// Fail the in-flight request, reconnect under a new session id and
    /// keep draining the queue.
    FailInFlight { max_attempts: u32 },
    /// Like `FailInFlight`, but resend the in-flight request on the new
    /// connection when none of its payload had been consumed yet.
    RetryInFlight { max_attempts: u32 },
}

impl ReconnectPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            ReconnectPolicy::Never => 0,
            ReconnectPolicy::FailInFlight { max_attempts }
            | ReconnectPolicy::RetryInFlight { max_attempts } => *max_attempts,
        }
    }
}

/// Sender-side configuration for one `Stream`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Capacity of the send queue.
    pub burst: usize,
    /// Simulate sending without touching the network.
    pub dry_run: bool,
    pub compression: Compression,
    pub codec: CodecKind,
    pub block_max_size: usize,
    /// Append an xxh3 checksum to every compressed block.
    pub block_checksum: bool,
    pub max_header_size: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// SO_SNDBUF / SO_RCVBUF for dialers built with `TcpDialer::for_config`;
    /// 0 keeps the OS default. The stream itself never opens sockets.
    pub sndrcv_buf_size: u32,
    /// Close the connection after this many idle milliseconds.
    pub idle_teardown_ms: Option<u64>,
    pub reconnect: ReconnectPolicy,
    /// Sender identity used by receivers to track sessions.
    pub origin: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            burst: DEFAULT_BURST,
            dry_run: false,
            compression: Compression::Never,
            codec: CodecKind::Lz4,
            block_max_size: DEFAULT_BLOCK_MAX_SIZE,
            block_checksum: false,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            sndrcv_buf_size: 0,
            idle_teardown_ms: None,
            reconnect: ReconnectPolicy::Never,
            origin: None,
        }
    }
}

impl StreamConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: StreamConfig =
            toml::from_str(s).map_err(|e| TransportError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `OBJSTREAM_BURST_NUM` and `OBJSTREAM_DRY_RUN` if set.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(v) = std::env::var(ENV_BURST_NUM) {
            self.burst = v
                .trim()
                .parse()
                .map_err(|_| TransportError::Config(format!("{}={:?}", ENV_BURST_NUM, v)))?;
        }
        if let Ok(v) = std::env::var(ENV_DRY_RUN) {
            self.dry_run = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(TransportError::Config(format!("{}={:?}", ENV_DRY_RUN, v)));
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.burst == 0 {
            return Err(TransportError::Config("burst must be at least 1".into()));
        }
        if !(MIN_BLOCK_MAX_SIZE..=MAX_BLOCK_MAX_SIZE).contains(&self.block_max_size) {
            return Err(TransportError::Config(format!(
                "block_max_size {} outside [{}, {}]",
                self.block_max_size, MIN_BLOCK_MAX_SIZE, MAX_BLOCK_MAX_SIZE
            )));
        }
        if self.max_header_size < 64 || self.max_header_size > u32::MAX as usize {
            return Err(TransportError::Config(format!(
                "max_header_size {} out of range",
                self.max_header_size
            )));
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(TransportError::Config("buffer sizes must be non-zero".into()));
        }
        Ok(())
    }

    /// Configuration as the sender loop runs it: dry-run has no wire, so
    /// compression is forced off.
    pub fn effective(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.dry_run {
            cfg.compression = Compression::Never;
        }
        cfg
    }

    pub fn compressed(&self) -> bool {
        self.compression == Compression::Always && !self.dry_run
    }

    pub fn idle_teardown(&self) -> Option<Duration> {
        self.idle_teardown_ms.map(Duration::from_millis)
    }
}

/// Receiver-side configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub api_version: String,
    pub max_header_size: usize,
    pub read_buffer_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl MuxConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| TransportError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_validate() {
        let cfg = StreamConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.burst, DEFAULT_BURST);
        assert!(!cfg.compressed());
    }

    #[test]
    fn test_from_toml() {
        let cfg = StreamConfig::from_toml_str(
            r#"
            burst = 4
            compression = "always"
            codec = "zstd"
            block_max_size = 4096
            idle_teardown_ms = 500
            reconnect = { mode = "retry_in_flight", max_attempts = 3 }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.burst, 4);
        assert!(cfg.compressed());
        assert_eq!(cfg.codec, CodecKind::Zstd);
        assert_eq!(cfg.block_max_size, 4096);
        assert_eq!(cfg.idle_teardown(), Some(Duration::from_millis(500)));
        assert_eq!(
            cfg.reconnect,
            ReconnectPolicy::RetryInFlight { max_attempts: 3 }
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let cfg = StreamConfig {
            burst: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = StreamConfig {
            block_max_size: 1024,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        assert!(StreamConfig::from_toml_str("burst = \"many\"").is_err());
    }

    #[test]
    fn test_dry_run_disables_compression() {
        let cfg = StreamConfig {
            dry_run: true,
            compression: Compression::Always,
            ..Default::default()
        };
        assert!(!cfg.compressed());
        assert_eq!(cfg.effective().compression, Compression::Never);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(ENV_BURST_NUM, "2");
        std::env::set_var(ENV_DRY_RUN, "true");
        let cfg = StreamConfig::default().with_env_overrides();
        std::env::remove_var(ENV_BURST_NUM);
        std::env::remove_var(ENV_DRY_RUN);

        let cfg = cfg.unwrap();
        assert_eq!(cfg.burst, 2);
        assert!(cfg.dry_run);
    }

    #[test]
    #[serial]
    fn test_env_override_garbage() {
        std::env::set_var(ENV_DRY_RUN, "perhaps");
        let cfg = StreamConfig::default().with_env_overrides();
        std::env::remove_var(ENV_DRY_RUN);
        assert!(cfg.is_err());
    }

    #[test]
    fn test_mux_config_toml() {
        let cfg = MuxConfig::from_toml_str("api_version = \"v2\"").unwrap();
        assert_eq!(cfg.api_version, "v2");
        assert_eq!(cfg.max_header_size, DEFAULT_MAX_HEADER_SIZE);
    }
}
