//! shapingmgrd - declarative traffic shaping manager
//!
//! Compiles a declarative bandwidth-shaping document into Linux
//! traffic-control state and reconciles interfaces toward it:
//!
//! 1. [`config`] loads the YAML document and normalizes its field lists.
//! 2. [`hierarchy`] builds the per-interface qdisc/class/filter tree.
//! 3. [`alloc`] assigns class minors, qdisc majors and filter prefs.
//! 4. [`validate`] checks the fully-allocated tree.
//! 5. [`compile`] emits abstract operations in dependency order.
//! 6. [`state`] reads the interface's live operations back from tc.
//! 7. [`reconcile`] diffs desired against live into a plan.
//! 8. [`apply`] runs the plan through an [`executor::Executor`].

pub mod alloc;
pub mod apply;
pub mod commands;
pub mod compile;
pub mod config;
pub mod executor;
pub mod hierarchy;
pub mod ops;
pub mod reconcile;
pub mod shaping_mgr;
pub mod state;
pub mod types;
pub mod validate;

#[cfg(test)]
mod testutil;

pub use hierarchy::Hierarchy;
pub use ops::{Op, OpKey, OpKind, Payload};
pub use reconcile::Plan;
pub use shaping_mgr::{ConvergeError, Outcome, ShapingMgr};
pub use types::{QdiscKind, Rate, TcHandle};
