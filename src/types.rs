// =============================================================================
// Shared identifiers and small value types used across the control plane
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a registered wallet. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletId(pub String);

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a protocol (e.g. "scroll-lend", "zksync-swap").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolId(pub String);

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for an asset (e.g. "USDC", "ETH").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub String);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a chain family (e.g. "scroll", "zksync", "base").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(pub String);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a registered task definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A kind of on-chain action a protocol adapter can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Bridge,
    Swap,
    Stake,
    Restake,
    Claim,
    ProvideLiquidity,
    Lend,
    Borrow,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bridge => "bridge",
            Self::Swap => "swap",
            Self::Stake => "stake",
            Self::Restake => "restake",
            Self::Claim => "claim",
            Self::ProvideLiquidity => "provide_liquidity",
            Self::Lend => "lend",
            Self::Borrow => "borrow",
        };
        write!(f, "{s}")
    }
}

/// Severity used on emitted events and log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Whether the scheduler is currently permitted to launch new task attempts.
/// Distinct from [`crate::risk::RiskState`]: an operator can pause the
/// scheduler for maintenance without tripping the circuit breaker, and a
/// tripped circuit halts launches regardless of this flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Running,
    Paused,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// A correlation id groups every `TaskInstance` belonging to one logical
/// composite DAG run.
pub type CorrelationId = uuid::Uuid;
