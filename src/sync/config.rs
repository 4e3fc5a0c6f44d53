/*!
 * Synchronization Configuration
 *
 * Runtime configuration for registry growth and keyed-event sharding
 */

use crate::limits::{DEFAULT_KEYED_SHARDS, MAX_KEYED_SHARDS};
use tracing::warn;

/// Environment variable capping the number of registry slices
pub const ENV_MAX_SLICES: &str = "KERNEL_SYNC_MAX_SLICES";

/// Environment variable selecting the keyed-event shard count
pub const ENV_KEYED_SHARDS: &str = "KERNEL_SYNC_KEYED_SHARDS";

/// Synchronization configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Maximum number of address-registry slices (`None` = grow until allocation fails)
    pub max_registry_slices: Option<usize>,
    /// Number of keyed-event shards (rounded up to a power of 2)
    pub keyed_shards: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_registry_slices: None,
            keyed_shards: DEFAULT_KEYED_SHARDS,
        }
    }
}

impl SyncConfig {
    /// Configuration with a hard cap on registry growth
    pub const fn bounded(max_registry_slices: usize) -> Self {
        Self {
            max_registry_slices: Some(max_registry_slices),
            keyed_shards: DEFAULT_KEYED_SHARDS,
        }
    }

    /// Build configuration from the environment, falling back to defaults
    ///
    /// Environment variables:
    /// - KERNEL_SYNC_MAX_SLICES: cap on registry slices (default: unbounded)
    /// - KERNEL_SYNC_KEYED_SHARDS: keyed-event shard count (default: 64)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ENV_MAX_SLICES) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.max_registry_slices = Some(n),
                _ => warn!(value = %raw, "Ignoring invalid {}", ENV_MAX_SLICES),
            }
        }

        if let Ok(raw) = std::env::var(ENV_KEYED_SHARDS) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.keyed_shards = n,
                _ => warn!(value = %raw, "Ignoring invalid {}", ENV_KEYED_SHARDS),
            }
        }

        config
    }

    /// Shard count actually used: a power of 2 within limits
    pub fn effective_shards(&self) -> usize {
        self.keyed_shards
            .clamp(1, MAX_KEYED_SHARDS)
            .next_power_of_two()
    }
}
