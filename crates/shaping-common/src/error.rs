//! Error types for the shaping pipeline.
//!
//! Each pipeline stage has a distinct error kind, in the order the stages
//! run: parse, allocation, validation, execution. Parse, allocation and
//! validation errors are all detected before any state-changing operation
//! is issued, so they never leave an interface partially configured.

use std::fmt::Write as _;
use std::io;
use thiserror::Error;

/// Result type alias for shaping operations.
pub type ShapingResult<T> = Result<T, ShapingError>;

/// Errors that can occur while compiling or applying a shaping spec.
#[derive(Debug, Error)]
pub enum ShapingError {
    /// Failed to spawn a shell command.
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// The declarative input does not match the recognized node shapes.
    #[error("Parse error at {path}: {message}")]
    Parse {
        /// Path locator into the declarative tree (e.g. `eth1.classes[2].qdisc`).
        path: String,
        /// What was wrong with the node.
        message: String,
    },

    /// One or more structural invariants are violated.
    ///
    /// All violations found in a single run are collected, so one pass
    /// reports everything wrong with the spec.
    #[error("invalid shaping spec: {}", format_violations(.0))]
    Validation(Vec<ValidationError>),

    /// Identifier allocation failed.
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// A single operation's application failed at the executor boundary.
    #[error("Operation failed: {op}: {detail}")]
    Execution {
        /// Rendered description of the failed operation.
        op: String,
        /// The executor's failure detail.
        detail: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

/// A single structural invariant violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Two classes resolved to the same identifier.
    #[error("duplicate class id {id}")]
    DuplicateClassId {
        /// The colliding identifier.
        id: u32,
    },

    /// An explicit class id lies outside the interface's namespace.
    #[error("class id {id} outside valid range 1..={max}")]
    ClassIdOutOfRange {
        /// The declared identifier.
        id: u32,
        /// The namespace ceiling.
        max: u16,
    },

    /// A class ceiling is below its guaranteed rate.
    #[error("class {id}: ceil {ceil} is below rate {rate}")]
    CeilBelowRate {
        /// The owning class id.
        id: u16,
        /// Declared rate text.
        rate: String,
        /// Declared (or defaulted) ceiling text.
        ceil: String,
    },

    /// The root qdisc's default class reference does not resolve.
    #[error("default class {id} is not declared by any class")]
    UnknownDefaultClass {
        /// The unresolved class id.
        id: u32,
    },

    /// Two filters under the same qdisc carry an identical match expression.
    #[error("duplicate filter match '{expr}'")]
    DuplicateFilterMatch {
        /// The ambiguous match expression.
        expr: String,
    },
}

/// Identifier allocation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// The same explicit class id was declared by more than one class.
    #[error("explicit class id {id} declared more than once")]
    IdCollision {
        /// The colliding identifier.
        id: u32,
    },

    /// No unused identifier remains in the class namespace.
    #[error("class id namespace exhausted (no free id at or below {max})")]
    NamespaceExhausted {
        /// The namespace ceiling.
        max: u16,
    },

    /// The same explicit filter preference was declared more than once.
    #[error("explicit filter preference {pref} declared more than once")]
    PrefCollision {
        /// The colliding preference.
        pref: u32,
    },

    /// No unused filter preference remains.
    #[error("filter preference namespace exhausted")]
    PrefExhausted,
}

fn format_violations(violations: &[ValidationError]) -> String {
    let mut out = format!("{} violation(s)", violations.len());
    for v in violations {
        let _ = write!(out, "; {}", v);
    }
    out
}

impl ShapingError {
    /// Creates a parse error with a path locator.
    pub fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an execution error for a single failed operation.
    pub fn execution(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Execution {
            op: op.into(),
            detail: detail.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error was detected before any operation
    /// could have been issued against the interface.
    pub fn is_pre_apply(&self) -> bool {
        matches!(
            self,
            ShapingError::Parse { .. }
                | ShapingError::Validation(_)
                | ShapingError::Allocation(_)
        )
    }
}
