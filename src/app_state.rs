// =============================================================================
// Composition root — wires C1-C7 into one shared, clonable handle
// =============================================================================
//
// `AppState` owns every long-lived component behind an `Arc` and is the only
// place that knows how they fit together. Everything downstream (the operator
// HTTP surface, the scheduler's own tick loop) is handed this struct rather
// than reaching into global state.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::adapter::{DemoAdapter, FlakyAdapter, ProtocolAdapter};
use crate::allocator::{Allocator, Protocol};
use crate::clock::{Clock, MarketOracle, MarketSnapshot, StaticMarketSource, SystemClock};
use crate::config::RuntimeConfig;
use crate::events::EventBus;
use crate::journal::{InMemoryJournal, Journal};
use crate::portfolio::{BalanceSource, Position, PortfolioView, StaticPortfolioSource};
use crate::registry::TaskRegistry;
use crate::risk::RiskManager;
use crate::scheduler::engine::SchedulerEngine;
use crate::scheduler::TaskInstance;
use crate::types::{AssetId, ChainId, ProtocolId, WalletId};

/// Demo-mode balance source: a handful of fixed positions so the control
/// plane has something to gate and rebalance against without a real wallet
/// collaborator. Real balance sources are out of scope (spec.md §1).
struct DemoBalances;

impl BalanceSource for DemoBalances {
    fn positions(&self) -> Result<Vec<Position>, crate::error::PortfolioError> {
        Ok(vec![
            Position {
                wallet: WalletId("demo-wallet".into()),
                protocol: ProtocolId("scroll".into()),
                asset: AssetId("USDC".into()),
                quantity: 12_000.0,
                usd_value: 12_000.0,
            },
            Position {
                wallet: WalletId("demo-wallet".into()),
                protocol: ProtocolId("zksync".into()),
                asset: AssetId("USDC".into()),
                quantity: 8_000.0,
                usd_value: 8_000.0,
            },
            Position {
                wallet: WalletId("demo-wallet".into()),
                protocol: ProtocolId("scroll".into()),
                asset: AssetId("ETH".into()),
                quantity: 1.0,
                usd_value: 0.01,
            },
        ])
    }
}

pub struct AppState {
    pub clock: Arc<dyn Clock>,
    pub oracle: Arc<dyn MarketOracle>,
    pub portfolio: Arc<dyn PortfolioView>,
    pub risk: Arc<RiskManager>,
    pub allocator: Arc<Allocator>,
    pub registry: Arc<TaskRegistry>,
    pub scheduler: Arc<SchedulerEngine>,
    pub events: Arc<EventBus>,
    pub journal: Arc<dyn Journal<TaskInstance>>,
    pub config: RwLock<RuntimeConfig>,
}

impl AppState {
    /// Build the full control plane in demo mode: a `SystemClock`, a static
    /// market/portfolio source seeded with plausible numbers, an in-memory
    /// journal, and `DemoAdapter`/`FlakyAdapter` protocol adapters standing in
    /// for the real RPC/signing collaborators the spec scopes out.
    pub fn new_demo(config: RuntimeConfig) -> Arc<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::build(clock, config)
    }

    fn build(clock: Arc<dyn Clock>, config: RuntimeConfig) -> Arc<Self> {
        let oracle = Arc::new(StaticMarketSource::new(clock.clone(), config.market_max_age_secs));
        oracle.ingest(MarketSnapshot {
            taken_at: clock.now(),
            gas_price_gwei: HashMap::from([
                (ChainId("scroll".into()), 8.0),
                (ChainId("zksync".into()), 6.0),
            ]),
            asset_prices_usd: HashMap::from([
                (AssetId("USDC".into()), 1.0),
                (AssetId("ETH".into()), 3_200.0),
            ]),
            volatility_index: 0.15,
        });
        let oracle: Arc<dyn MarketOracle> = oracle;

        let portfolio = Arc::new(StaticPortfolioSource::new(
            clock.clone(),
            vec![Arc::new(DemoBalances)],
            config.portfolio_strict,
        ));
        portfolio.refresh().ok();
        let portfolio: Arc<dyn PortfolioView> = portfolio;

        let events = Arc::new(EventBus::new(config.event_bus_capacity));

        let risk = Arc::new(RiskManager::new(
            clock.clone(),
            oracle.clone(),
            portfolio.clone(),
            events.clone(),
            config.risk.clone(),
        ));

        let allocator = Arc::new(
            Allocator::new(
                clock.clone(),
                portfolio.clone(),
                events.clone(),
                config.allocator.clone(),
                vec![
                    Protocol {
                        id: ProtocolId("scroll".into()),
                        enabled: true,
                        weight_min: 0.1,
                        weight_max: 0.7,
                        risk_multiplier: 1.0,
                        trailing_roi: 0.0,
                        chain: ChainId("scroll".into()),
                        asset: AssetId("USDC".into()),
                        default_action: crate::types::ActionKind::Claim,
                    },
                    Protocol {
                        id: ProtocolId("zksync".into()),
                        enabled: true,
                        weight_min: 0.1,
                        weight_max: 0.7,
                        risk_multiplier: 1.4,
                        trailing_roi: 0.0,
                        chain: ChainId("zksync".into()),
                        asset: AssetId("USDC".into()),
                        default_action: crate::types::ActionKind::Claim,
                    },
                ],
            )
            .expect("demo protocol set has valid bounds"),
        );

        let registry = Arc::new(TaskRegistry::new());
        let journal: Arc<dyn Journal<TaskInstance>> = Arc::new(InMemoryJournal::new());

        let mut adapters: HashMap<ProtocolId, Arc<dyn ProtocolAdapter>> = HashMap::new();
        adapters.insert(
            ProtocolId("scroll".into()),
            Arc::new(DemoAdapter::new(
                Duration::from_millis(400),
                std::collections::HashSet::from([
                    crate::types::ActionKind::Claim,
                    crate::types::ActionKind::Swap,
                    crate::types::ActionKind::Bridge,
                ]),
            )),
        );
        adapters.insert(
            ProtocolId("zksync".into()),
            Arc::new(FlakyAdapter::new(
                1,
                std::collections::HashSet::from([
                    crate::types::ActionKind::Claim,
                    crate::types::ActionKind::Swap,
                ]),
            )),
        );

        let scheduler = SchedulerEngine::new(
            clock.clone(),
            registry.clone(),
            risk.clone(),
            allocator.clone(),
            events.clone(),
            journal.clone(),
            adapters,
            config.scheduler.clone(),
        );

        Arc::new(Self {
            clock,
            oracle,
            portfolio,
            risk,
            allocator,
            registry,
            scheduler,
            events,
            journal,
            config: RwLock::new(config),
        })
    }
}
