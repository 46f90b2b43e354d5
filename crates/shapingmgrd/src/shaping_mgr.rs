//! ShapingMgr - per-interface convergence driver
//!
//! Ties the pipeline together: build the hierarchy from the declared
//! document, allocate identifiers, validate, compile to operations, diff
//! against live state and apply the plan through an [`Executor`].

use std::path::Path;

use serde_yaml::Value;
use shaping_common::{ShapingError, ShapingResult};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::alloc::allocate;
use crate::apply::{apply_plan, PartialApplyError};
use crate::commands::{build_root_del_cmd, render_plan};
use crate::compile::compile;
use crate::config;
use crate::executor::{Executor, TcExecutor};
use crate::hierarchy::Hierarchy;
use crate::ops::Op;
use crate::reconcile::reconcile;
use crate::state;
use crate::validate::validate;

/// What a convergence run did to an interface.
#[derive(Debug)]
pub enum Outcome {
    /// A plan was applied.
    Converged { applied: usize },
    /// Live state already matched the declaration.
    AlreadyConverged,
    /// Shaping is declared off; any installed root was removed.
    Disabled,
    /// Dry run: the commands that would have run, one per line.
    DryRun { script: String },
}

/// How a convergence run can fail.
///
/// A halted apply keeps its per-operation accounting so the caller can
/// see exactly which operations landed before the halt.
#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error(transparent)]
    Shaping(#[from] ShapingError),
    #[error(transparent)]
    PartialApply(#[from] PartialApplyError),
}

impl ConvergeError {
    /// True when the failure happened before any operation ran.
    pub fn is_pre_apply(&self) -> bool {
        match self {
            ConvergeError::Shaping(err) => err.is_pre_apply(),
            ConvergeError::PartialApply(_) => false,
        }
    }
}

/// Converges declared shaping onto interfaces through an executor.
pub struct ShapingMgr<E: Executor> {
    executor: E,
    dry_run: bool,
}

impl<E: Executor> ShapingMgr<E> {
    /// Creates a manager applying operations through `executor`.
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            dry_run: false,
        }
    }

    /// Render commands instead of executing them.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn into_executor(self) -> E {
        self.executor
    }

    /// Remove all shaping from the interface, regardless of what the
    /// document declares for it.
    #[instrument(skip(self))]
    pub async fn disable(&mut self, iface: &str) -> ShapingResult<()> {
        self.executor.teardown(iface).await?;
        info!(iface, "root discipline removed");
        Ok(())
    }

    /// Converge one interface: compile `spec`, diff against `live`,
    /// apply the difference.
    #[instrument(skip(self, spec, live, cancel))]
    pub async fn converge(
        &mut self,
        iface: &str,
        spec: &Value,
        live: &[Op],
        cancel: &CancellationToken,
    ) -> Result<Outcome, ConvergeError> {
        let mut hierarchy = Hierarchy::build(iface, spec)?;

        if !hierarchy.enabled {
            if live.is_empty() {
                info!(iface, "shaping disabled, nothing installed");
                return Ok(Outcome::Disabled);
            }
            if self.dry_run {
                return Ok(Outcome::DryRun {
                    script: format!("{}\n", build_root_del_cmd(iface)),
                });
            }
            self.disable(iface).await?;
            return Ok(Outcome::Disabled);
        }

        allocate(&mut hierarchy)?;
        validate(&hierarchy)?;
        let desired = compile(&hierarchy)?;
        let plan = reconcile(&desired, live);

        if plan.is_empty() {
            info!(iface, "already converged");
            return Ok(Outcome::AlreadyConverged);
        }
        if self.dry_run {
            return Ok(Outcome::DryRun {
                script: render_plan(iface, &plan),
            });
        }

        let applied = apply_plan(&mut self.executor, iface, &plan, cancel).await?;
        Ok(Outcome::Converged { applied })
    }
}

/// Load a shaping document and converge every interface it names, one
/// task per interface. Returns an error if any interface failed.
pub async fn run_document(
    path: &Path,
    only: Option<&str>,
    dry_run: bool,
    cancel: &CancellationToken,
) -> ShapingResult<()> {
    let document = config::load_document(path)?;

    let mut tasks = Vec::new();
    for (iface, spec) in document {
        if only.is_some_and(|only| only != iface) {
            continue;
        }
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let result = converge_live(&iface, &spec, dry_run, &cancel).await;
            (iface, result)
        }));
    }
    if tasks.is_empty() {
        warn!("no matching interfaces in document");
        return Ok(());
    }

    let mut failures = 0usize;
    for task in tasks {
        match task.await {
            Ok((iface, Ok(Outcome::DryRun { script }))) => {
                println!("# interface {}", iface);
                print!("{}", script);
            }
            Ok((iface, Ok(outcome))) => {
                info!(iface, ?outcome, "interface done");
            }
            Ok((iface, Err(err))) => {
                error!(iface, %err, "interface failed");
                failures += 1;
            }
            Err(err) => {
                error!(%err, "interface task panicked");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        return Err(ShapingError::execution(
            "runDocument",
            format!("{} interface(s) failed", failures),
        ));
    }
    Ok(())
}

async fn converge_live(
    iface: &str,
    spec: &Value,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<Outcome, ConvergeError> {
    let live = state::read_live_state(iface).await?;
    let mut mgr = ShapingMgr::new(TcExecutor);
    if dry_run {
        mgr = mgr.dry_run();
    }
    mgr.converge(iface, spec, &live, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use crate::testutil::{htb_example, yaml};

    fn mgr() -> ShapingMgr<RecordingExecutor> {
        ShapingMgr::new(RecordingExecutor::new())
    }

    #[tokio::test]
    async fn test_converge_from_scratch() {
        let mut mgr = mgr();
        let cancel = CancellationToken::new();
        let outcome = mgr
            .converge("eth1", &htb_example(), &[], &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Converged { applied: 10 }));
        assert_eq!(mgr.into_executor().applied.len(), 10);
    }

    #[tokio::test]
    async fn test_converge_is_idempotent() {
        let cancel = CancellationToken::new();
        let mut first = mgr();
        first
            .converge("eth1", &htb_example(), &[], &cancel)
            .await
            .unwrap();
        let live = first.into_executor().ops();

        let mut second = mgr();
        let outcome = second
            .converge("eth1", &htb_example(), &live, &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::AlreadyConverged));
        assert!(second.into_executor().applied.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_tears_down_installed_root() {
        let cancel = CancellationToken::new();
        let mut installer = mgr();
        installer
            .converge("eth1", &htb_example(), &[], &cancel)
            .await
            .unwrap();
        let live = installer.into_executor().ops();

        let disabled = yaml("- enabled: false\n- type: htb\n");
        let mut mgr = mgr();
        let outcome = mgr.converge("eth1", &disabled, &live, &cancel).await.unwrap();
        assert!(matches!(outcome, Outcome::Disabled));
        let executor = mgr.into_executor();
        assert_eq!(executor.teardowns, vec!["eth1".to_string()]);
        assert!(executor.applied.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_with_nothing_installed_is_a_noop() {
        let cancel = CancellationToken::new();
        let disabled = yaml("- enabled: false\n- type: htb\n");
        let mut mgr = mgr();
        let outcome = mgr.converge("eth1", &disabled, &[], &cancel).await.unwrap();
        assert!(matches!(outcome, Outcome::Disabled));
        assert!(mgr.into_executor().teardowns.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_renders_without_executing() {
        let cancel = CancellationToken::new();
        let mut mgr = mgr().dry_run();
        let outcome = mgr
            .converge("eth1", &htb_example(), &[], &cancel)
            .await
            .unwrap();
        let Outcome::DryRun { script } = outcome else {
            panic!("expected a dry-run script");
        };
        assert!(script.contains("/sbin/tc qdisc add dev \"eth1\" root handle 1: htb default d"));
        assert!(script.contains("# Interface limit"));
        assert!(mgr.into_executor().applied.is_empty());
    }

    #[tokio::test]
    async fn test_halted_apply_keeps_its_accounting() {
        let cancel = CancellationToken::new();
        let mut mgr = ShapingMgr::new(RecordingExecutor::failing_at(4));
        let err = mgr
            .converge("eth1", &htb_example(), &[], &cancel)
            .await
            .unwrap_err();
        let ConvergeError::PartialApply(err) = err else {
            panic!("expected the halted apply to keep its operation lists");
        };
        assert_eq!(err.applied.len(), 4);
        assert_eq!(err.not_attempted.len(), 6);
        assert!(matches!(err.cause, crate::apply::ApplyHalt::Failed(_)));
    }

    #[tokio::test]
    async fn test_validation_failure_is_pre_apply() {
        let cancel = CancellationToken::new();
        let bad = yaml(
            "- type: htb\n- default: 99\n- classes:\n    - options: rate 1024kbit\n",
        );
        let mut mgr = mgr();
        let err = mgr.converge("eth1", &bad, &[], &cancel).await.unwrap_err();
        assert!(err.is_pre_apply());
        assert!(mgr.into_executor().applied.is_empty());
    }
}
