// =============================================================================
// Portfolio View (C2) — read-only aggregated balances and positions
// =============================================================================
//
// Within a single snapshot, every position shares one timestamp; across
// snapshots, timestamps strictly increase. `refresh()` forces reconciliation
// against the underlying sources and fails closed in `strict` mode if any
// required source errors — callers must not fall back to a stale snapshot
// silently.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::PortfolioError;
use crate::types::{AssetId, ProtocolId, WalletId};

// ---------------------------------------------------------------------------
// Position / PortfolioSnapshot
// ---------------------------------------------------------------------------

/// (wallet, protocol, asset) -> quantity and USD valuation at a snapshot
/// time. Derived, never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub wallet: WalletId,
    pub protocol: ProtocolId,
    pub asset: AssetId,
    pub quantity: f64,
    pub usd_value: f64,
}

/// Set of positions plus total USD value `V`, taken at time `t`.
/// Append-only at the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub taken_at: DateTime<Utc>,
    pub positions: Vec<Position>,
    pub total_usd: f64,
}

impl PortfolioSnapshot {
    pub fn empty(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            positions: Vec::new(),
            total_usd: 0.0,
        }
    }

    /// Current USD exposure in protocol `p` (sum over wallets/assets).
    pub fn exposure(&self, protocol: &ProtocolId) -> f64 {
        self.positions
            .iter()
            .filter(|p| &p.protocol == protocol)
            .map(|p| p.usd_value)
            .sum()
    }

    /// Current USD concentration in asset class `a` (sum over wallets/protocols).
    pub fn concentration(&self, asset: &AssetId) -> f64 {
        self.positions
            .iter()
            .filter(|p| &p.asset == asset)
            .map(|p| p.usd_value)
            .sum()
    }

    /// Native-token balance of `wallet` in `asset` (used for wallet-health gate).
    pub fn wallet_balance(&self, wallet: &WalletId, asset: &AssetId) -> f64 {
        self.positions
            .iter()
            .filter(|p| &p.wallet == wallet && &p.asset == asset)
            .map(|p| p.quantity)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// PortfolioView
// ---------------------------------------------------------------------------

pub trait PortfolioView: Send + Sync {
    /// Return a snapshot, possibly cached within a freshness window.
    fn current(&self) -> PortfolioSnapshot;

    /// Force reconciliation against underlying sources.
    fn refresh(&self) -> Result<PortfolioSnapshot, PortfolioError>;
}

/// A source of raw balances, standing in for the wallet/RPC collaborators
/// spec.md scopes out of the core.
pub trait BalanceSource: Send + Sync {
    fn positions(&self) -> Result<Vec<Position>, PortfolioError>;
}

/// An in-memory, test/demo-friendly [`PortfolioView`] backed by one or more
/// [`BalanceSource`]s.
pub struct StaticPortfolioSource {
    clock: Arc<dyn Clock>,
    sources: Vec<Arc<dyn BalanceSource>>,
    strict: bool,
    freshness_window_secs: i64,
    cached: RwLock<Option<PortfolioSnapshot>>,
}

impl StaticPortfolioSource {
    pub fn new(clock: Arc<dyn Clock>, sources: Vec<Arc<dyn BalanceSource>>, strict: bool) -> Self {
        Self {
            clock,
            sources,
            strict,
            freshness_window_secs: 30,
            cached: RwLock::new(None),
        }
    }

    fn build_snapshot(&self) -> Result<PortfolioSnapshot, PortfolioError> {
        let mut positions = Vec::new();
        for src in &self.sources {
            match src.positions() {
                Ok(mut p) => positions.append(&mut p),
                Err(e) if self.strict => return Err(e),
                Err(e) => warn!(error = %e, "balance source failed in non-strict mode, skipping"),
            }
        }

        let taken_at = self.clock.now();
        if let Some(prev) = self.cached.read().as_ref() {
            if taken_at <= prev.taken_at {
                // Monotonicity guarantee: never publish a non-increasing timestamp.
                return Ok(prev.clone());
            }
        }

        let total_usd = positions.iter().map(|p| p.usd_value).sum();
        Ok(PortfolioSnapshot {
            taken_at,
            positions,
            total_usd,
        })
    }
}

impl PortfolioView for StaticPortfolioSource {
    fn current(&self) -> PortfolioSnapshot {
        {
            let cached = self.cached.read();
            if let Some(snap) = cached.as_ref() {
                let age = (self.clock.now() - snap.taken_at).num_seconds();
                if age < self.freshness_window_secs {
                    return snap.clone();
                }
            }
        }

        match self.refresh() {
            Ok(snap) => snap,
            Err(e) => {
                warn!(error = %e, "portfolio refresh failed, serving last known snapshot");
                self.cached
                    .read()
                    .clone()
                    .unwrap_or_else(|| PortfolioSnapshot::empty(self.clock.now()))
            }
        }
    }

    fn refresh(&self) -> Result<PortfolioSnapshot, PortfolioError> {
        let snap = self.build_snapshot()?;
        debug!(
            total_usd = snap.total_usd,
            positions = snap.positions.len(),
            "portfolio snapshot refreshed"
        );
        *self.cached.write() = Some(snap.clone());
        Ok(snap)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    struct FixedSource(Vec<Position>);
    impl BalanceSource for FixedSource {
        fn positions(&self) -> Result<Vec<Position>, PortfolioError> {
            Ok(self.0.clone())
        }
    }

    struct FailingSource;
    impl BalanceSource for FailingSource {
        fn positions(&self) -> Result<Vec<Position>, PortfolioError> {
            Err(PortfolioError::Unavailable("down".into()))
        }
    }

    fn pos(protocol: &str, asset: &str, usd: f64) -> Position {
        Position {
            wallet: WalletId("w1".into()),
            protocol: ProtocolId(protocol.into()),
            asset: AssetId(asset.into()),
            quantity: usd,
            usd_value: usd,
        }
    }

    #[test]
    fn aggregates_exposure_and_concentration() {
        let clock = Arc::new(VirtualClock::new(Utc::now()));
        let src = FixedSource(vec![pos("scroll", "USDC", 100.0), pos("scroll", "ETH", 50.0)]);
        let view = StaticPortfolioSource::new(clock, vec![Arc::new(src)], true);
        let snap = view.refresh().unwrap();
        assert_eq!(snap.total_usd, 150.0);
        assert_eq!(snap.exposure(&ProtocolId("scroll".into())), 150.0);
        assert_eq!(snap.concentration(&AssetId("USDC".into())), 100.0);
    }

    #[test]
    fn strict_mode_fails_on_source_error() {
        let clock = Arc::new(VirtualClock::new(Utc::now()));
        let view = StaticPortfolioSource::new(clock, vec![Arc::new(FailingSource)], true);
        assert!(view.refresh().is_err());
    }

    #[test]
    fn non_strict_mode_skips_failing_sources() {
        let clock = Arc::new(VirtualClock::new(Utc::now()));
        let view = StaticPortfolioSource::new(
            clock,
            vec![Arc::new(FailingSource), Arc::new(FixedSource(vec![pos("a", "USDC", 10.0)]))],
            false,
        );
        let snap = view.refresh().unwrap();
        assert_eq!(snap.total_usd, 10.0);
    }

    #[test]
    fn timestamps_strictly_increase_across_refreshes() {
        let clock = VirtualClock::new(Utc::now());
        let view = StaticPortfolioSource::new(
            Arc::new(clock.clone()),
            vec![Arc::new(FixedSource(vec![]))],
            true,
        );
        let s1 = view.refresh().unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let s2 = view.refresh().unwrap();
        assert!(s2.taken_at > s1.taken_at);
    }
}
