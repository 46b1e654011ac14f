// =============================================================================
// Runtime Configuration — every control-plane tunable, hot-loadable
// =============================================================================
//
// Every field carries `#[serde(default)]` so adding a new tunable never
// breaks loading an older config file (forward compatibility). Unknown
// top-level JSON keys are accepted silently; an unrecognized enum variant
// (e.g. a bad trigger kind embedded in a task definition) is a load-time
// `ConfigError`, per spec.md §7 ("fatal at load; the process refuses to
// start").
//
// Persistence uses the same atomic tmp + rename pattern the engine has
// always used, to survive a crash mid-write.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::types::{ActionKind, AssetId, ProtocolId};

// ---------------------------------------------------------------------------
// Default-value helpers
// ---------------------------------------------------------------------------

fn default_degraded_scale() -> f64 {
    0.5
}

fn default_min_notional() -> f64 {
    100.0
}

fn default_tx_cap_pct() -> f64 {
    0.05
}

fn default_daily_loss_cap() -> f64 {
    1_000.0
}

fn default_gas_ceiling() -> f64 {
    30.0
}

fn default_gas_hysteresis() -> f64 {
    0.2
}

fn default_vol_multiplier_high() -> f64 {
    0.5
}

fn default_vol_multiplier_med() -> f64 {
    0.8
}

fn default_min_gas_reserve() -> f64 {
    0.01
}

fn default_reservation_ttl_secs() -> u64 {
    300
}

fn default_max_concurrent_tasks() -> usize {
    16
}

fn default_max_concurrent_per_protocol() -> usize {
    4
}

fn default_max_concurrent_per_wallet() -> usize {
    1
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_max_backoff_secs() -> u64 {
    300
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_drift_threshold() -> f64 {
    0.05
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_market_max_age_secs() -> u64 {
    60
}

fn default_portfolio_freshness_secs() -> i64 {
    30
}

// ---------------------------------------------------------------------------
// RiskConfig
// ---------------------------------------------------------------------------

/// Tunables consumed by [`crate::risk::RiskManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Notional scale applied once, up front, while `RiskState::Degraded`.
    #[serde(default = "default_degraded_scale")]
    pub degraded_notional_scale: f64,

    /// Below this, a downsize becomes a deny instead.
    #[serde(default = "default_min_notional")]
    pub min_notional_usd: f64,

    /// Per-protocol exposure cap as a fraction of portfolio USD value.
    #[serde(default)]
    pub protocol_caps: HashMap<ProtocolId, f64>,

    /// Per-asset concentration cap as a fraction of portfolio USD value.
    #[serde(default)]
    pub asset_caps: HashMap<AssetId, f64>,

    /// Per-transaction cap as a fraction of portfolio USD value.
    #[serde(default = "default_tx_cap_pct")]
    pub tx_cap_pct: f64,

    /// Rolling 24h realized-loss threshold that trips the circuit breaker.
    #[serde(default = "default_daily_loss_cap")]
    pub daily_loss_cap_usd: f64,

    #[serde(default = "default_gas_ceiling")]
    pub gas_ceiling_swap_gwei: f64,
    #[serde(default = "default_gas_ceiling")]
    pub gas_ceiling_bridge_gwei: f64,
    #[serde(default = "default_gas_ceiling")]
    pub gas_ceiling_default_gwei: f64,

    /// Hysteresis band: ceiling must drop below `ceiling * (1-h)` to re-open.
    #[serde(default = "default_gas_hysteresis")]
    pub gas_hysteresis: f64,

    #[serde(default = "default_vol_multiplier_high")]
    pub volatility_multiplier_high: f64,
    #[serde(default = "default_vol_multiplier_med")]
    pub volatility_multiplier_med: f64,

    /// Minimum native-token wallet balance required to proceed.
    #[serde(default = "default_min_gas_reserve")]
    pub min_gas_reserve: f64,

    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,

    /// Test-only override for portfolio total USD value, so unit tests can
    /// exercise cap math (S2) without standing up a full balance source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio_total_usd_override: Option<f64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            degraded_notional_scale: default_degraded_scale(),
            min_notional_usd: default_min_notional(),
            protocol_caps: HashMap::new(),
            asset_caps: HashMap::new(),
            tx_cap_pct: default_tx_cap_pct(),
            daily_loss_cap_usd: default_daily_loss_cap(),
            gas_ceiling_swap_gwei: default_gas_ceiling(),
            gas_ceiling_bridge_gwei: default_gas_ceiling(),
            gas_ceiling_default_gwei: default_gas_ceiling(),
            gas_hysteresis: default_gas_hysteresis(),
            volatility_multiplier_high: default_vol_multiplier_high(),
            volatility_multiplier_med: default_vol_multiplier_med(),
            min_gas_reserve: default_min_gas_reserve(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
            portfolio_total_usd_override: None,
        }
    }
}

impl RiskConfig {
    pub fn gas_ceiling_gwei(&self, kind: ActionKind) -> f64 {
        match kind {
            ActionKind::Swap => self.gas_ceiling_swap_gwei,
            ActionKind::Bridge => self.gas_ceiling_bridge_gwei,
            _ => self.gas_ceiling_default_gwei,
        }
    }
}

// ---------------------------------------------------------------------------
// AllocatorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
    #[serde(default)]
    pub rebalance_cron: Option<String>,
    #[serde(default)]
    pub momentum_window_days: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            drift_threshold: default_drift_threshold(),
            rebalance_cron: None,
            momentum_window_days: 7,
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_max_concurrent_per_protocol")]
    pub max_concurrent_per_protocol: usize,
    #[serde(default = "default_max_concurrent_per_wallet")]
    pub max_concurrent_per_wallet: usize,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Tick interval of the scheduler loop.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

fn default_tick_millis() -> u64 {
    250
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_concurrent_per_protocol: default_max_concurrent_per_protocol(),
            max_concurrent_per_wallet: default_max_concurrent_per_wallet(),
            backoff_base_secs: default_backoff_base_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            tick_millis: default_tick_millis(),
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the control plane. Every tunable
/// named across spec.md lives here so the engine can be reconfigured without
/// a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_bus_capacity")]
    pub event_bus_capacity: usize,
    #[serde(default = "default_market_max_age_secs")]
    pub market_max_age_secs: u64,
    #[serde(default = "default_portfolio_freshness_secs")]
    pub portfolio_freshness_secs: i64,
    #[serde(default)]
    pub portfolio_strict: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            risk: RiskConfig::default(),
            allocator: AllocatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            event_bus_capacity: default_bus_capacity(),
            market_max_age_secs: default_market_max_age_secs(),
            portfolio_freshness_secs: default_portfolio_freshness_secs(),
            portfolio_strict: true,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.validate()?;

        info!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename), preventing corruption on crash.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content).map_err(|source| ConfigError::Read {
            path: tmp_path.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp_path, path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Configuration invariants checked at load time, per spec.md §7.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (protocol, cap) in &self.risk.protocol_caps {
            if !(0.0..=1.0).contains(cap) {
                return Err(ConfigError::Invalid(format!(
                    "protocol cap for {protocol} out of [0,1]: {cap}"
                )));
            }
        }
        if self.scheduler.max_concurrent_per_wallet == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_per_wallet must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
