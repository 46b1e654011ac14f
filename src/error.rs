// =============================================================================
// Typed error kinds — one enum per component, per spec.md §7's error taxonomy
// =============================================================================
//
// Configuration errors are fatal at load (the process refuses to start).
// Transient-external and risk-denial errors are retried within budget by the
// Scheduler Engine. Permanent-external errors move a TaskInstance straight to
// FAILED_PERMANENT. Internal invariant violations trip the circuit breaker.
// =============================================================================

use thiserror::Error;

use crate::types::{ChainId, ProtocolId, TaskId};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("market snapshot is stale: age={age_secs}s max_age={max_age_secs}s")]
    StaleData { age_secs: u64, max_age_secs: u64 },
    #[error("no gas price known for chain {0}")]
    UnknownChain(ChainId),
}

#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("portfolio source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("dependency cycle detected involving task {0}")]
    CycleDetected(TaskId),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },
    #[error("task {0} is already registered at this version")]
    AlreadyRegistered(TaskId),
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("protocol weight bounds invalid for {protocol}: w_min={w_min} w_max={w_max}")]
    InvalidBounds {
        protocol: ProtocolId,
        w_min: f64,
        w_max: f64,
    },
    #[error("sum of w_min across enabled protocols exceeds 1.0: {0}")]
    InfeasibleBounds(f64),
    #[error("no enabled protocols to allocate across")]
    NoEnabledProtocols,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(String),
    #[error("journal serialization error: {0}")]
    Serde(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("instance {0} does not allow transition {1} -> {2}")]
    InvalidTransition(Uuid, &'static str, &'static str),
    #[error("no adapter registered for protocol {0}")]
    NoAdapter(ProtocolId),
    #[error("unknown task instance {0}")]
    UnknownInstance(Uuid),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config from {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Adapter-reported error kinds the core recognizes, per spec.md §6.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("transient RPC error: {0}")]
    TransientRpc(String),
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("slippage exceeded: {0}")]
    SlippageExceeded(String),
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("adapter timed out")]
    Timeout,
    #[error("permanent adapter configuration error: {0}")]
    PermanentConfig(String),
}

impl AdapterError {
    /// Whether a first occurrence of this error should be retried once as if
    /// it were transient, per spec.md §6 ("Unknown errors are treated as
    /// TransientRpc for one retry, then PermanentConfig").
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentConfig(_) | Self::Reverted(_) | Self::InsufficientBalance(_))
    }
}
