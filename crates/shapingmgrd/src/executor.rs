//! Executor seam between abstract operations and the system

use async_trait::async_trait;
use shaping_common::{shell, ShapingError, ShapingResult};
use tracing::debug;

use crate::commands;
use crate::ops::Op;

/// Applies abstract operations to an interface. The production
/// implementation shells out to tc; tests substitute a recorder.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Apply a single operation. Failure must leave earlier
    /// operations in place.
    async fn apply(&mut self, iface: &str, op: &Op) -> ShapingResult<()>;

    /// Remove all shaping from the interface root.
    async fn teardown(&mut self, iface: &str) -> ShapingResult<()>;
}

/// Production executor driving /sbin/tc.
pub struct TcExecutor;

#[async_trait]
impl Executor for TcExecutor {
    async fn apply(&mut self, iface: &str, op: &Op) -> ShapingResult<()> {
        let cmd = commands::build_op_cmd(iface, op);
        debug!(iface, %op, "applying operation");
        shell::exec_or_throw(&cmd)
            .await
            .map_err(|err| ShapingError::execution(op.to_string(), err.to_string()))?;
        Ok(())
    }

    async fn teardown(&mut self, iface: &str) -> ShapingResult<()> {
        let cmd = commands::build_root_del_cmd(iface);
        debug!(iface, "removing root discipline");
        shell::exec_or_throw(&cmd)
            .await
            .map_err(|err| ShapingError::execution("delRoot".to_string(), err.to_string()))?;
        Ok(())
    }
}

/// Test executor that records operations instead of running them and
/// can be told to fail at a given position.
pub struct RecordingExecutor {
    /// Operations applied so far, with the interface they targeted.
    pub applied: Vec<(String, Op)>,
    /// Number of teardown calls.
    pub teardowns: Vec<String>,
    fail_at: Option<usize>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        RecordingExecutor {
            applied: Vec::new(),
            teardowns: Vec::new(),
            fail_at: None,
        }
    }

    /// Fail the apply call at `index` (zero-based) with an execution error.
    pub fn failing_at(index: usize) -> Self {
        RecordingExecutor {
            fail_at: Some(index),
            ..RecordingExecutor::new()
        }
    }

    /// Operations applied so far, without the interface names.
    pub fn ops(&self) -> Vec<Op> {
        self.applied.iter().map(|(_, op)| op.clone()).collect()
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        RecordingExecutor::new()
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn apply(&mut self, iface: &str, op: &Op) -> ShapingResult<()> {
        if self.fail_at == Some(self.applied.len()) {
            return Err(ShapingError::execution(
                op.to_string(),
                "injected failure".to_string(),
            ));
        }
        self.applied.push((iface.to_string(), op.clone()));
        Ok(())
    }

    async fn teardown(&mut self, iface: &str) -> ShapingResult<()> {
        self.teardowns.push(iface.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{OpKind, Payload};
    use crate::types::TcHandle;

    fn sample_op() -> Op {
        Op {
            kind: OpKind::AddClass,
            target: TcHandle::class(1, 2),
            parent: Some(TcHandle::class(1, 1)),
            payload: Payload::Class {
                rate: "128kbit".parse().unwrap(),
                ceil: "128kbit".parse().unwrap(),
                prio: None,
                extra: vec![],
            },
            comment: None,
        }
    }

    #[tokio::test]
    async fn test_recording_executor_records() {
        let mut executor = RecordingExecutor::new();
        executor.apply("eth1", &sample_op()).await.unwrap();
        assert_eq!(executor.applied.len(), 1);
        assert_eq!(executor.applied[0].0, "eth1");
    }

    #[tokio::test]
    async fn test_recording_executor_injected_failure() {
        let mut executor = RecordingExecutor::failing_at(1);
        executor.apply("eth1", &sample_op()).await.unwrap();
        let err = executor.apply("eth1", &sample_op()).await.unwrap_err();
        assert!(matches!(err, ShapingError::Execution { .. }));
        assert_eq!(executor.applied.len(), 1);
    }
}
