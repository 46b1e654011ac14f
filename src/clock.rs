// =============================================================================
// Clock & Market Oracle (C1) — monotonic time, gas, price, and volatility
// =============================================================================
//
// `snapshot()` always returns a MarketSnapshot built from the most recently
// ingested data; it fails with `ClockError::StaleData` once that data is
// older than `max_age`. Consumers (the Risk Manager in particular) must
// treat staleness as risk-positive: a stale snapshot denies new risky
// actions rather than permitting them.
//
// `VirtualClock` lets tests drive time deterministically instead of reading
// the wall clock, per spec.md §4.1.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ClockError;
use crate::types::{AssetId, ChainId};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of monotonic time, injectable so risk/allocator/scheduler logic can
/// be tested without depending on wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A settable clock for deterministic tests.
#[derive(Clone)]
pub struct VirtualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.write() = t;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.write();
        *now += delta;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

// ---------------------------------------------------------------------------
// Volatility bands
// ---------------------------------------------------------------------------

/// Scalar volatility bucket used by the Risk Manager's volatility gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityBand {
    Low,
    Med,
    High,
    Extreme,
}

/// Thresholds dividing the volatility index into bands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityThresholds {
    pub med_at: f64,
    pub high_at: f64,
    pub extreme_at: f64,
}

impl Default for VolatilityThresholds {
    fn default() -> Self {
        Self {
            med_at: 0.3,
            high_at: 0.6,
            extreme_at: 0.85,
        }
    }
}

impl VolatilityThresholds {
    pub fn band(&self, index: f64) -> VolatilityBand {
        if index >= self.extreme_at {
            VolatilityBand::Extreme
        } else if index >= self.high_at {
            VolatilityBand::High
        } else if index >= self.med_at {
            VolatilityBand::Med
        } else {
            VolatilityBand::Low
        }
    }
}

// ---------------------------------------------------------------------------
// MarketSnapshot
// ---------------------------------------------------------------------------

/// Gas price, asset prices, and a volatility index, all consistent as of
/// `taken_at`. Append-only at the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub taken_at: DateTime<Utc>,
    pub gas_price_gwei: HashMap<ChainId, f64>,
    pub asset_prices_usd: HashMap<AssetId, f64>,
    pub volatility_index: f64,
}

impl MarketSnapshot {
    pub fn volatility_band(&self, thresholds: &VolatilityThresholds) -> VolatilityBand {
        thresholds.band(self.volatility_index)
    }

    pub fn gas_price(&self, chain: &ChainId) -> Option<f64> {
        self.gas_price_gwei.get(chain).copied()
    }

    pub fn price(&self, asset: &AssetId) -> Option<f64> {
        self.asset_prices_usd.get(asset).copied()
    }
}

// ---------------------------------------------------------------------------
// MarketOracle
// ---------------------------------------------------------------------------

/// Read-only market data source. Implementations own their own ingestion
/// (websocket feeds, RPC polling, etc. — opaque to the core); the core only
/// ever calls `snapshot()`.
pub trait MarketOracle: Send + Sync {
    fn snapshot(&self) -> Result<MarketSnapshot, ClockError>;
}

/// An in-memory oracle fed by a test or by a simple polling task, standing in
/// for the real price/gas feeds spec.md scopes out as external collaborators.
pub struct StaticMarketSource {
    clock: Arc<dyn Clock>,
    max_age_secs: u64,
    latest: RwLock<Option<MarketSnapshot>>,
}

impl StaticMarketSource {
    pub fn new(clock: Arc<dyn Clock>, max_age_secs: u64) -> Self {
        Self {
            clock,
            max_age_secs,
            latest: RwLock::new(None),
        }
    }

    /// Ingest a new snapshot. Callers (a polling task, or a test) are
    /// responsible for keeping `taken_at` monotonic; the oracle does not
    /// second-guess the producer.
    pub fn ingest(&self, snapshot: MarketSnapshot) {
        *self.latest.write() = Some(snapshot);
    }
}

impl MarketOracle for StaticMarketSource {
    fn snapshot(&self) -> Result<MarketSnapshot, ClockError> {
        let guard = self.latest.read();
        let snap = guard.as_ref().ok_or(ClockError::StaleData {
            age_secs: u64::MAX,
            max_age_secs: self.max_age_secs,
        })?;

        let age = (self.clock.now() - snap.taken_at).num_seconds().max(0) as u64;
        if age > self.max_age_secs {
            return Err(ClockError::StaleData {
                age_secs: age,
                max_age_secs: self.max_age_secs,
            });
        }

        Ok(snap.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn snap(taken_at: DateTime<Utc>) -> MarketSnapshot {
        MarketSnapshot {
            taken_at,
            gas_price_gwei: HashMap::new(),
            asset_prices_usd: HashMap::new(),
            volatility_index: 0.1,
        }
    }

    #[test]
    fn fresh_snapshot_is_returned() {
        let clock = VirtualClock::new(Utc::now());
        let oracle = StaticMarketSource::new(Arc::new(clock.clone()), 60);
        oracle.ingest(snap(clock.now()));
        assert!(oracle.snapshot().is_ok());
    }

    #[test]
    fn stale_snapshot_is_rejected() {
        let clock = VirtualClock::new(Utc::now());
        let oracle = StaticMarketSource::new(Arc::new(clock.clone()), 60);
        oracle.ingest(snap(clock.now()));
        clock.advance(chrono::Duration::seconds(61));
        assert!(matches!(
            oracle.snapshot(),
            Err(ClockError::StaleData { .. })
        ));
    }

    #[test]
    fn missing_snapshot_is_stale() {
        let clock = VirtualClock::new(Utc::now());
        let oracle = StaticMarketSource::new(Arc::new(clock), 60);
        assert!(matches!(
            oracle.snapshot(),
            Err(ClockError::StaleData { .. })
        ));
    }

    #[test]
    fn volatility_bands_map_correctly() {
        let t = VolatilityThresholds::default();
        assert_eq!(t.band(0.0), VolatilityBand::Low);
        assert_eq!(t.band(0.35), VolatilityBand::Med);
        assert_eq!(t.band(0.65), VolatilityBand::High);
        assert_eq!(t.band(0.9), VolatilityBand::Extreme);
    }
}
