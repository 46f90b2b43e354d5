//! Reconciliation of desired operations against observed live state.
//!
//! The differ produces a minimal convergence plan: a prefix of deletions
//! for live entities that are stale (absent from the desired state,
//! payload-conflicting, or under a stale ancestor), followed by the
//! desired-order creations for entities that are new or were just
//! deleted. Entities with identical handle and payload are elided, so an
//! unchanged spec against matching live state yields an empty plan.
//!
//! Deletions run deepest-first: filters, then leaf qdiscs, then classes
//! (children before parents), then the root qdisc. A live root qdisc that
//! no longer matches the desired root collapses the whole prefix into a
//! single root deletion, since removing the root takes the entire
//! hierarchy with it.

use std::collections::{HashMap, HashSet};

use crate::ops::{Op, OpKey, Payload};
use crate::types::TcHandle;

/// The convergence plan for one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Deletions, deepest-first.
    pub deletions: Vec<Op>,
    /// Creations, in compiled (dependency) order.
    pub creations: Vec<Op>,
}

impl Plan {
    /// Returns true when live state already matches the desired state.
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.creations.is_empty()
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.deletions.len() + self.creations.len()
    }

    /// All operations in application order: deletions, then creations.
    pub fn ops(&self) -> impl Iterator<Item = &Op> {
        self.deletions.iter().chain(self.creations.iter())
    }

    /// Consumes the plan into its application-order operation list.
    pub fn into_ops(self) -> Vec<Op> {
        let mut ops = self.deletions;
        ops.extend(self.creations);
        ops
    }
}

/// Diffs the desired operation list against a live-state snapshot.
pub fn reconcile(desired: &[Op], live: &[Op]) -> Plan {
    let desired_root = desired.iter().find(|op| op.is_root_qdisc());
    let live_root = live.iter().find(|op| op.is_root_qdisc());

    // A root that changed handle or payload invalidates everything under
    // it; one root deletion wipes the interface.
    if let (Some(desired_root), Some(live_root)) = (desired_root, live_root) {
        if desired_root.target != live_root.target
            || desired_root.payload != live_root.payload
        {
            return Plan {
                deletions: vec![live_root.clone().into_delete()],
                creations: desired.to_vec(),
            };
        }
    }

    let desired_by_key: HashMap<OpKey, &Op> = desired.iter().map(|op| (op.key(), op)).collect();
    let live_by_key: HashMap<OpKey, &Op> = live.iter().map(|op| (op.key(), op)).collect();

    // Directly stale: gone from the desired state, payload conflict, or
    // attached to a different parent.
    let mut stale: HashSet<OpKey> = live
        .iter()
        .filter(|op| {
            desired_by_key
                .get(&op.key())
                .map_or(true, |want| want.payload != op.payload || want.parent != op.parent)
        })
        .map(|op| op.key())
        .collect();

    // Cascade: anything under a stale ancestor, and any filter steering
    // into a stale class, dies with it.
    loop {
        let mut grew = false;
        for op in live {
            if stale.contains(&op.key()) {
                continue;
            }
            let parent_stale = op
                .parent
                .is_some_and(|parent| stale.contains(&handle_key(parent)));
            let flow_stale = match &op.payload {
                Payload::Filter { flowid, .. } => stale.contains(&OpKey::Class(*flowid)),
                _ => false,
            };
            if parent_stale || flow_stale {
                stale.insert(op.key());
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    let deletions = deletion_order(live, &stale);

    let creations = desired
        .iter()
        .filter(|op| {
            let key = op.key();
            stale.contains(&key) || !live_by_key.contains_key(&key)
        })
        .cloned()
        .collect();

    Plan {
        deletions,
        creations,
    }
}

/// Orders stale live entities for deletion: filters, leaf qdiscs, classes
/// (reverse creation order puts children first), root qdisc last.
fn deletion_order(live: &[Op], stale: &HashSet<OpKey>) -> Vec<Op> {
    let stale_ops = |pred: &dyn Fn(&Op) -> bool| -> Vec<Op> {
        live.iter()
            .rev()
            .filter(|op| stale.contains(&op.key()) && pred(op))
            .map(|op| op.clone().into_delete())
            .collect()
    };

    let mut deletions = stale_ops(&|op| matches!(op.payload, Payload::Filter { .. }));
    deletions.extend(stale_ops(&|op| {
        matches!(op.payload, Payload::Qdisc { .. }) && !op.is_root_qdisc()
    }));
    deletions.extend(stale_ops(&|op| matches!(op.payload, Payload::Class { .. })));
    deletions.extend(stale_ops(&|op| op.is_root_qdisc()));
    deletions
}

fn handle_key(handle: TcHandle) -> OpKey {
    if handle.is_qdisc() {
        OpKey::Qdisc(handle)
    } else {
        OpKey::Class(handle)
    }
}
