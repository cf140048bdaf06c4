//! Kernel configuration.
//!
//! Layered the way `config::manager` layered provider settings: built-in
//! defaults, then an optional `ocap-kernel.toml` on disk, then environment
//! overrides (`OCAP_KERNEL__REMOTE__MAX_RETRY_ATTEMPTS=3`, etc), merged
//! through the `config` crate's builder.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config layering failed: {0}")]
    Build(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Remote transport options (§6 Configuration). Defaults match the spec's
/// enumerated table verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    pub relays: Vec<String>,
    /// 0 means infinite.
    pub max_retry_attempts: u32,
    pub max_concurrent_connections: u32,
    pub max_message_size_bytes: u64,
    pub cleanup_interval_ms: u64,
    pub stale_peer_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_messages_per_second: u32,
    pub max_connection_attempts_per_minute: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            max_retry_attempts: 0,
            max_concurrent_connections: 100,
            max_message_size_bytes: 1024 * 1024,
            cleanup_interval_ms: 15 * 60 * 1000,
            stale_peer_timeout_ms: 60 * 60 * 1000,
            write_timeout_ms: 10 * 1000,
            max_messages_per_second: 100,
            max_connection_attempts_per_minute: 10,
        }
    }
}

/// Wake-detection tunables (§4.7). Not part of the spec's enumerated remote
/// options table, but every real incarnation of this system needs these
/// configurable rather than hardcoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WakeConfig {
    pub sample_interval_ms: u64,
    pub jump_threshold_ms: u64,
    pub cross_incarnation_threshold_ms: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 15_000,
            jump_threshold_ms: 30_000,
            cross_incarnation_threshold_ms: 60 * 60 * 1000,
        }
    }
}

/// Retry-primitive tunables (§4.7) applied where a caller doesn't override
/// them explicitly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

/// Root configuration object for a kernel instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub remote: RemoteConfig,
    pub wake: WakeConfig,
    pub retry: RetryConfig,
    /// Where the kernel store persists its durable state.
    pub store_path: Option<PathBuf>,
}

impl KernelConfig {
    /// Layer defaults, an optional config file, and `OCAP_KERNEL__`-prefixed
    /// environment variables into a `KernelConfig`.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = KernelConfig::default();
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&defaults).map_err(ConfigError::Build)?,
        );

        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path).required(false),
            );
        } else if let Some(dir) = default_config_dir() {
            builder = builder.add_source(
                config::File::from(dir.join("ocap-kernel.toml")).required(false),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("OCAP_KERNEL")
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder.build()?;
        let cfg: KernelConfig = merged.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.max_message_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size_bytes must be nonzero".into(),
            ));
        }
        if self.remote.max_messages_per_second == 0 {
            return Err(ConfigError::Invalid(
                "max_messages_per_second must be nonzero".into(),
            ));
        }
        if self.remote.max_connection_attempts_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "max_connection_attempts_per_minute must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ocap-kernel"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.remote.max_retry_attempts, 0);
        assert_eq!(cfg.remote.max_concurrent_connections, 100);
        assert_eq!(cfg.remote.max_message_size_bytes, 1024 * 1024);
        assert_eq!(cfg.remote.cleanup_interval_ms, 15 * 60 * 1000);
        assert_eq!(cfg.remote.stale_peer_timeout_ms, 60 * 60 * 1000);
        assert_eq!(cfg.remote.write_timeout_ms, 10_000);
        assert_eq!(cfg.remote.max_messages_per_second, 100);
        assert_eq!(cfg.remote.max_connection_attempts_per_minute, 10);
    }

    #[test]
    fn load_with_missing_file_falls_back_to_defaults() {
        let cfg = KernelConfig::load(Some(Path::new("/nonexistent/ocap-kernel.toml"))).unwrap();
        assert_eq!(cfg, KernelConfig::default());
    }

    #[test]
    fn rejects_zero_message_size() {
        let mut cfg = KernelConfig::default();
        cfg.remote.max_message_size_bytes = 0;
        assert!(cfg.validate().is_err());
    }
}
