use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{FieldVaultError, Result};

/// Tuning for the ephemeral DEK cache.
///
/// Every field has a sensible default so the cached encryption service works
/// out-of-the-box. All windows are wall-clock seconds; deployments that
/// deserialize these from their own config format get the same defaults for
/// missing fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Sliding TTL for keyed entries, refreshed on every read (default: 10 min).
    #[serde(default = "default_cache_entry_ttl_secs")]
    pub cache_entry_ttl_secs: u64,

    /// Absolute TTL for the "current" DEK slot, measured from creation
    /// (default: 2 min). Must not exceed `cache_entry_ttl_secs`.
    #[serde(default = "default_current_entry_ttl_secs")]
    pub current_entry_ttl_secs: u64,

    /// How often the background sweep evicts stale entries (default: 1 min).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Tuning for the rekey scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeySettings {
    /// Delay before the first scheduled pass (default: 1 min).
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Interval between scheduled passes (default: 1 h).
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Pause between record batches within a pass (default: 1 s).
    #[serde(default = "default_batch_interval_millis")]
    pub batch_interval_millis: u64,

    /// Records fetched per batch (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a freshly created key must age before rotation may act on it,
    /// covering every instance's key-cache refresh (default: 30 min).
    #[serde(default = "default_cache_coherence_window_secs")]
    pub cache_coherence_window_secs: u64,

    /// Per-tenant failure budget for one pass; negative means unlimited
    /// (default: 10).
    #[serde(default = "default_max_failures")]
    pub max_failures: i64,
}

// ── Serde default helpers ────────────────────────────────────────────

fn default_cache_entry_ttl_secs() -> u64 {
    600
}

fn default_current_entry_ttl_secs() -> u64 {
    120
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_initial_delay_secs() -> u64 {
    60
}

fn default_check_interval_secs() -> u64 {
    3_600
}

fn default_batch_interval_millis() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    100
}

fn default_cache_coherence_window_secs() -> u64 {
    1_800
}

fn default_max_failures() -> i64 {
    10
}

// ── Implementation ───────────────────────────────────────────────────

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_entry_ttl_secs: default_cache_entry_ttl_secs(),
            current_entry_ttl_secs: default_current_entry_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheSettings {
    /// Sliding TTL for keyed entries.
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_entry_ttl_secs)
    }

    /// Absolute TTL for the current slot.
    pub fn current_ttl(&self) -> Duration {
        Duration::from_secs(self.current_entry_ttl_secs)
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Reject windows that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.cache_entry_ttl_secs == 0 || self.current_entry_ttl_secs == 0 {
            return Err(FieldVaultError::Configuration(
                "cache TTLs must be non-zero".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(FieldVaultError::Configuration(
                "sweep interval must be non-zero".to_string(),
            ));
        }
        if self.current_entry_ttl_secs > self.cache_entry_ttl_secs {
            return Err(FieldVaultError::Configuration(
                "current-slot TTL must not exceed the keyed-entry TTL".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RekeySettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            check_interval_secs: default_check_interval_secs(),
            batch_interval_millis: default_batch_interval_millis(),
            batch_size: default_batch_size(),
            cache_coherence_window_secs: default_cache_coherence_window_secs(),
            max_failures: default_max_failures(),
        }
    }
}

impl RekeySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_millis)
    }

    /// Coherence window as signed chrono duration for key-age arithmetic.
    pub fn coherence_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_coherence_window_secs as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            return Err(FieldVaultError::Configuration(
                "check interval must be non-zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(FieldVaultError::Configuration(
                "batch size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
