//! Common infrastructure for the tc traffic-shaping manager.
//!
//! This crate provides the pieces shared between the shaping pipeline and
//! any tooling built on top of it:
//!
//! - [`shell`]: safe shell command execution with proper quoting, used to
//!   drive the `tc` binary
//! - [`error`]: error types for every stage of the pipeline
//!
//! # Architecture
//!
//! The shaping manager follows this pattern:
//!
//! 1. Load the declarative shaping document (YAML, per interface)
//! 2. Build, allocate and validate the qdisc/class/filter hierarchy
//! 3. Compile the hierarchy into an ordered list of abstract operations
//! 4. Diff against the interface's live state and apply the plan via `tc`

pub mod error;
pub mod shell;

// Re-export commonly used items at crate root
pub use error::{AllocationError, ShapingError, ShapingResult, ValidationError};
