//! Server-wide configuration: defaults, YAML loading, and the sanity
//! validators bloomd's Python `config.py` applies before the process binds
//! any sockets. Hard violations abort startup; soft warnings are logged and
//! the value is kept.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BloomdError, Result};

fn default_port() -> u16 {
    8673
}
fn default_udp_port() -> u16 {
    8674
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/tmp/bloomd")
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_initial_capacity() -> usize {
    1_000_000
}
fn default_probability() -> f64 {
    1e-4
}
fn default_scale_size() -> u32 {
    4
}
fn default_probability_reduction() -> f64 {
    0.9
}
fn default_flush_interval() -> u64 {
    60
}
fn default_cold_interval() -> u64 {
    3600
}

/// Recognized server options (§6 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
    #[serde(default = "default_probability")]
    pub default_probability: f64,
    #[serde(default = "default_scale_size")]
    pub scale_size: u32,
    #[serde(default = "default_probability_reduction")]
    pub probability_reduction: f64,
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    #[serde(default = "default_cold_interval")]
    pub cold_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: default_port(),
            udp_port: default_udp_port(),
            data_dir: default_data_dir(),
            log_file: None,
            log_level: default_log_level(),
            initial_capacity: default_initial_capacity(),
            default_probability: default_probability(),
            scale_size: default_scale_size(),
            probability_reduction: default_probability_reduction(),
            flush_interval: default_flush_interval(),
            cold_interval: default_cold_interval(),
        }
    }
}

impl ServerConfig {
    /// Load from a YAML file, falling back to defaults for any option the
    /// file omits.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Runs the same sanity checks bloomd's `config.py` VALIDATORS table
    /// runs. Hard violations return a `ClientError`; soft violations are
    /// logged as warnings and the value is kept as-is.
    pub fn validate(&self) -> Result<()> {
        if self.scale_size < 2 {
            return Err(BloomdError::ClientError(
                "scale_size must be at least 2".into(),
            ));
        }
        if self.scale_size > 4 {
            tracing::warn!(scale_size = self.scale_size, "scale size over 4 not recommended");
        }

        if self.default_probability >= 1.0 || self.default_probability <= 0.0 {
            return Err(BloomdError::ClientError(
                "default_probability must be in (0, 1)".into(),
            ));
        }
        if self.default_probability > 0.01 {
            tracing::warn!(
                probability = self.default_probability,
                "default probability set very high"
            );
        }

        if self.probability_reduction >= 1.0 {
            return Err(BloomdError::ClientError(
                "probability_reduction cannot be more than 1".into(),
            ));
        }
        if self.probability_reduction < 0.1 {
            return Err(BloomdError::ClientError(
                "probability_reduction drop off is set too steep".into(),
            ));
        }
        if self.probability_reduction < 0.5 {
            tracing::warn!(
                reduction = self.probability_reduction,
                "probability drop off is very steep"
            );
        }

        if self.initial_capacity < 1000 {
            return Err(BloomdError::ClientError(
                "initial_capacity cannot be less than 1000".into(),
            ));
        }
        if self.initial_capacity as f64 > 1e9 {
            tracing::warn!(
                capacity = self.initial_capacity,
                "initial capacity set very high"
            );
        }

        if self.flush_interval == 0 {
            tracing::warn!("flushing is disabled, data loss may occur on crash");
        } else if self.flush_interval >= 900 {
            tracing::warn!(
                interval = self.flush_interval,
                "flush interval is infrequent, this increases the chance of data loss"
            );
        }

        if self.cold_interval == 0 {
            tracing::warn!("cold filter unmapping is disabled");
        }

        if !matches!(
            self.log_level.to_uppercase().as_str(),
            "DEBUG" | "INFO" | "WARN" | "ERROR" | "CRITICAL"
        ) {
            return Err(BloomdError::ClientError("invalid log level".into()));
        }

        if self.data_dir.exists() && !self.data_dir.is_dir() {
            return Err(BloomdError::ClientError(
                "data_dir exists and is not a directory".into(),
            ));
        }

        Ok(())
    }

    /// Per-filter defaults carried by `FilterConfig::new`, derived from the
    /// server-wide configuration.
    pub fn filter_defaults(&self) -> FilterDefaults {
        FilterDefaults {
            initial_capacity: self.initial_capacity,
            default_probability: self.default_probability,
            scale_size: self.scale_size,
            probability_reduction: self.probability_reduction,
        }
    }
}

/// The subset of server config each filter carries as its own defaults,
/// optionally overridden per-filter at `create` time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FilterDefaults {
    pub initial_capacity: usize,
    pub default_probability: f64,
    pub scale_size: u32,
    pub probability_reduction: f64,
}

/// Per-`create` overrides: `name [capacity [probability]]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterOverrides {
    pub initial_capacity: Option<usize>,
    pub default_probability: Option<f64>,
}

/// Bounds checks applied to a `create` command's overrides; same rules as
/// the server-wide validators, returned as soft warnings vs hard errors.
pub fn validate_capacity_override(capacity: usize) -> Result<()> {
    if capacity < 1000 {
        return Err(BloomdError::ClientError(
            "initial capacity cannot be less than 1000".into(),
        ));
    }
    Ok(())
}

pub fn validate_probability_override(probability: f64) -> Result<()> {
    if probability <= 0.0 || probability >= 1.0 {
        return Err(BloomdError::ClientError(
            "false positive probability must be in (0, 1)".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        let cfg = ServerConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_scale_size() {
        let mut cfg = ServerConfig::default();
        cfg.scale_size = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_probability() {
        let mut cfg = ServerConfig::default();
        cfg.default_probability = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_file_merges_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bloomd.yaml");
        std::fs::write(&path, "port: 9999\n").unwrap();
        let cfg = ServerConfig::from_file(&path).unwrap();
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.scale_size, default_scale_size());
    }
}
