// =============================================================================
// Protocol Adapter contract (external interfaces, §6) + demo implementations
// =============================================================================
//
// Real adapters (RPC, signing, ABIs) are explicitly out of scope (spec.md
// §1); `DemoAdapter`/`FlakyAdapter` are synthetic stand-ins so the Scheduler
// Engine can be driven end-to-end, mirroring the teacher's demo-vs-live
// execution split in its old execution engine.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::types::ActionKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimate {
    pub notional_usd: f64,
    pub gas_estimate_gwei: f64,
    pub slippage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcomeDetail {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error_kind: Option<String>,
    pub realized_notional_usd: f64,
    pub realized_gas_gwei: f64,
    pub at: chrono::DateTime<Utc>,
}

#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    async fn execute(
        &self,
        action_kind: ActionKind,
        params: &serde_json::Value,
        deadline: chrono::DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<ActionOutcomeDetail, AdapterError>;

    async fn estimate(&self, action_kind: ActionKind, params: &serde_json::Value) -> Result<Estimate, AdapterError>;

    fn capabilities(&self) -> HashSet<ActionKind>;
}

/// Always succeeds after a configurable synthetic latency, with a synthetic
/// fill. Drives the scheduler through the happy path in demo mode and tests.
pub struct DemoAdapter {
    latency: Duration,
    capabilities: HashSet<ActionKind>,
}

impl DemoAdapter {
    pub fn new(latency: Duration, capabilities: HashSet<ActionKind>) -> Self {
        Self { latency, capabilities }
    }
}

#[async_trait]
impl ProtocolAdapter for DemoAdapter {
    async fn execute(
        &self,
        _action_kind: ActionKind,
        params: &serde_json::Value,
        _deadline: chrono::DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<ActionOutcomeDetail, AdapterError> {
        tokio::select! {
            _ = tokio::time::sleep(self.latency) => {}
            _ = cancel.cancelled() => return Err(AdapterError::Timeout),
        }
        let notional = params.get("notional_usd").and_then(|v| v.as_f64()).unwrap_or(0.0);
        Ok(ActionOutcomeDetail {
            success: true,
            tx_hash: Some(format!("0xdemo{}", uuid::Uuid::new_v4().simple())),
            error_kind: None,
            realized_notional_usd: notional,
            realized_gas_gwei: 5.0,
            at: Utc::now(),
        })
    }

    async fn estimate(&self, _action_kind: ActionKind, params: &serde_json::Value) -> Result<Estimate, AdapterError> {
        Ok(Estimate {
            notional_usd: params.get("notional_usd").and_then(|v| v.as_f64()).unwrap_or(0.0),
            gas_estimate_gwei: 5.0,
            slippage: 0.001,
        })
    }

    fn capabilities(&self) -> HashSet<ActionKind> {
        self.capabilities.clone()
    }
}

/// Deterministically returns `TransientRpc` for the first `fail_count`
/// invocations, then succeeds — exercises retry/backoff in tests.
pub struct FlakyAdapter {
    fail_count: u32,
    attempts: AtomicU32,
    capabilities: HashSet<ActionKind>,
}

impl FlakyAdapter {
    pub fn new(fail_count: u32, capabilities: HashSet<ActionKind>) -> Self {
        Self {
            fail_count,
            attempts: AtomicU32::new(0),
            capabilities,
        }
    }
}

#[async_trait]
impl ProtocolAdapter for FlakyAdapter {
    async fn execute(
        &self,
        _action_kind: ActionKind,
        params: &serde_json::Value,
        _deadline: chrono::DateTime<Utc>,
        _cancel: CancellationToken,
    ) -> Result<ActionOutcomeDetail, AdapterError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_count {
            return Err(AdapterError::TransientRpc(format!("synthetic failure #{attempt}")));
        }
        let notional = params.get("notional_usd").and_then(|v| v.as_f64()).unwrap_or(0.0);
        Ok(ActionOutcomeDetail {
            success: true,
            tx_hash: Some(format!("0xflaky{}", uuid::Uuid::new_v4().simple())),
            error_kind: None,
            realized_notional_usd: notional,
            realized_gas_gwei: 5.0,
            at: Utc::now(),
        })
    }

    async fn estimate(&self, _action_kind: ActionKind, params: &serde_json::Value) -> Result<Estimate, AdapterError> {
        Ok(Estimate {
            notional_usd: params.get("notional_usd").and_then(|v| v.as_f64()).unwrap_or(0.0),
            gas_estimate_gwei: 5.0,
            slippage: 0.001,
        })
    }

    fn capabilities(&self) -> HashSet<ActionKind> {
        self.capabilities.clone()
    }
}
