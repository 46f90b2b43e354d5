//! Sequential plan application with partial-failure accounting

use shaping_common::ShapingError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::executor::Executor;
use crate::ops::Op;
use crate::reconcile::Plan;

/// Why plan application stopped before completing.
#[derive(Debug, Error)]
pub enum ApplyHalt {
    #[error("operation failed: {0}")]
    Failed(#[source] ShapingError),
    #[error("cancelled")]
    Cancelled,
}

/// A plan that stopped partway through. Records exactly which
/// operations took effect so a later run can reconverge.
#[derive(Debug)]
pub struct PartialApplyError {
    pub cause: ApplyHalt,
    /// Operations that succeeded, in order.
    pub applied: Vec<Op>,
    /// Operations never issued.
    pub not_attempted: Vec<Op>,
}

impl std::fmt::Display for PartialApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "applied {}/{} operations, then {}",
            self.applied.len(),
            self.applied.len() + self.not_attempted.len(),
            self.cause
        )
    }
}

impl std::error::Error for PartialApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Apply every operation in the plan, deletions first, strictly in
/// order. Stops at the first failure; the cancellation token is
/// honored between operations, never mid-operation.
pub async fn apply_plan(
    executor: &mut dyn Executor,
    iface: &str,
    plan: &Plan,
    cancel: &CancellationToken,
) -> Result<usize, PartialApplyError> {
    let ops: Vec<&Op> = plan.ops().collect();
    let mut applied: Vec<Op> = Vec::with_capacity(ops.len());

    for (pos, op) in ops.iter().enumerate() {
        if cancel.is_cancelled() {
            warn!(iface, applied = applied.len(), "application cancelled");
            return Err(PartialApplyError {
                cause: ApplyHalt::Cancelled,
                applied,
                not_attempted: ops[pos..].iter().map(|op| (*op).clone()).collect(),
            });
        }
        if let Err(err) = executor.apply(iface, op).await {
            warn!(iface, %op, %err, "operation failed, stopping");
            return Err(PartialApplyError {
                cause: ApplyHalt::Failed(err),
                applied,
                not_attempted: ops[pos..].iter().map(|op| (*op).clone()).collect(),
            });
        }
        applied.push((*op).clone());
    }

    info!(iface, count = applied.len(), "plan applied");
    Ok(applied.len())
}
