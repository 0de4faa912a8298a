//! Configuration types for StripeIO
//!
//! Settings are layered: compiled-in defaults, then an optional file (any
//! format the `config` crate recognises by extension), then `STRIPEIO__*`
//! environment variables such as `STRIPEIO__RPC__TIMEOUT_MS=5000`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest block shift an IO operation may use (512-byte blocks)
pub const MIN_BLOCK_SHIFT: u32 = 9;

/// Root configuration for a StripeIO client instance
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine configuration
    pub client: ClientConfig,
    /// Default striping layout and pool geometry
    pub layout: LayoutConfig,
    /// Transport limits and timeouts
    pub rpc: RpcConfig,
}

impl Config {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg: Self = builder
            .add_source(
                config::Environment::with_prefix("STRIPEIO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.client.localities == 0 {
            return Err(Error::Configuration("client.localities must be > 0".into()));
        }
        if self.client.block_shift < MIN_BLOCK_SHIFT {
            return Err(Error::Configuration(format!(
                "client.block_shift must be >= {MIN_BLOCK_SHIFT}"
            )));
        }
        let l = &self.layout;
        if l.data_units == 0 {
            return Err(Error::Configuration("layout.data_units must be > 0".into()));
        }
        if l.unit_size == 0 || l.unit_size % self.client.block_size() != 0 {
            return Err(Error::Configuration(format!(
                "layout.unit_size {} is not a multiple of the block size {}",
                l.unit_size,
                self.client.block_size()
            )));
        }
        if l.pool_width < l.data_units + l.parity_units {
            return Err(Error::Configuration(format!(
                "layout.pool_width {} is smaller than the stripe width {}",
                l.pool_width,
                l.data_units + l.parity_units
            )));
        }
        if l.targets_per_service == 0 {
            return Err(Error::Configuration(
                "layout.targets_per_service must be > 0".into(),
            ));
        }
        if self.rpc.max_segments_per_fop == 0 || self.rpc.max_segments_per_buffer == 0 {
            return Err(Error::Configuration("rpc segment limits must be > 0".into()));
        }
        Ok(())
    }
}

/// Engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Number of serialization groups (localities) operations are spread over
    pub localities: usize,
    /// Default block size exponent for new objects
    pub block_shift: u32,
    /// Run an fsync round for every executed operation that left pending
    /// transactions behind. When false, operations go straight to STABLE
    /// and durability is only reached through an explicit sync.
    pub sync_on_execute: bool,
    /// Layout new objects get unless told otherwise
    pub default_layout: u64,
}

impl ClientConfig {
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        1 << self.block_shift
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            localities: 4,
            block_shift: 12, // 4 KiB
            sync_on_execute: true,
            default_layout: 1,
        }
    }
}

/// Striping geometry of the default layout and the pool it lives in
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Bytes per unit on one target
    pub unit_size: u64,
    /// Data units per parity group (N)
    pub data_units: u32,
    /// Parity units per parity group (K)
    pub parity_units: u32,
    /// Number of targets in the pool (P)
    pub pool_width: u32,
    /// Targets served by each IO service
    pub targets_per_service: u32,
    /// Simultaneous target failures the pool is provisioned to survive
    pub tolerance: u32,
}

impl LayoutConfig {
    /// Bytes of application data in one parity group
    #[must_use]
    pub const fn group_size(&self) -> u64 {
        self.unit_size * self.data_units as u64
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            unit_size: 64 * 1024, // 64 KiB
            data_units: 4,
            parity_units: 2,
            pool_width: 8,
            targets_per_service: 1,
            tolerance: 2,
        }
    }
}

/// Transport limits and timeouts
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Reply timeout for fsync and metadata requests
    pub timeout_ms: u64,
    /// Segments carried by one IO fop
    pub max_segments_per_fop: usize,
    /// Segments described by one bulk buffer
    pub max_segments_per_buffer: usize,
}

impl RpcConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_segments_per_fop: 128,
            max_segments_per_buffer: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.client.block_size(), 4096);
        assert_eq!(cfg.layout.group_size(), 4 * 64 * 1024);
        assert_eq!(cfg.rpc.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_narrow_pool() {
        let mut cfg = Config::default();
        cfg.layout.pool_width = 5;
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_unaligned_unit() {
        let mut cfg = Config::default();
        cfg.layout.unit_size = 6000;
        assert!(cfg.validate().is_err());
        cfg.layout.unit_size = 8192;
        cfg.client.block_shift = 8;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[layout]\nunit_size = 8192\ndata_units = 2\nparity_units = 1\npool_width = 3\n\n[rpc]\ntimeout_ms = 250"
        )
        .unwrap();

        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(cfg.layout.unit_size, 8192);
        assert_eq!(cfg.layout.data_units, 2);
        assert_eq!(cfg.rpc.timeout_ms, 250);
        // untouched sections keep their defaults
        assert_eq!(cfg.client.localities, 4);
        assert_eq!(cfg.rpc.max_segments_per_fop, 128);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[layout]\ndata_units = 0").unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }
}
