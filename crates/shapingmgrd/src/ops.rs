//! Abstract traffic-control operations.
//!
//! An [`Op`] is one create or delete step against an interface's shaping
//! state: qdisc, class or filter, with its target handle, parent handle
//! and payload. The compiler emits ops in dependency order; the reconciler
//! diffs desired ops against live ones by [`OpKey`] identity and payload
//! equality.

use std::fmt;

use crate::types::{QdiscKind, Rate, TcHandle};

/// The kind of a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Install a qdisc.
    AddQdisc,
    /// Install a class.
    AddClass,
    /// Install a filter.
    AddFilter,
    /// Remove a qdisc.
    DelQdisc,
    /// Remove a class.
    DelClass,
    /// Remove a filter.
    DelFilter,
}

impl OpKind {
    /// Returns true for delete operations.
    pub fn is_delete(&self) -> bool {
        matches!(self, OpKind::DelQdisc | OpKind::DelClass | OpKind::DelFilter)
    }

    /// Name used in logs and error reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::AddQdisc => "addQdisc",
            OpKind::AddClass => "addClass",
            OpKind::AddFilter => "addFilter",
            OpKind::DelQdisc => "delQdisc",
            OpKind::DelClass => "delClass",
            OpKind::DelFilter => "delFilter",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity payload; compared field-by-field during reconciliation.
///
/// Comments never appear here, they are documentation only and live on
/// the [`Op`] itself. Equality treats opaque option pairs as an
/// unordered multiset so that kernel print order never registers as a
/// configuration change.
#[derive(Debug, Clone, Eq)]
pub enum Payload {
    /// A queueing discipline.
    Qdisc {
        /// Discipline kind.
        kind: QdiscKind,
        /// Opaque option pairs, declaration order.
        options: Vec<(String, String)>,
        /// Default class id (root htb only).
        default_class: Option<u16>,
    },
    /// An HTB class.
    Class {
        /// Guaranteed rate.
        rate: Rate,
        /// Effective ceiling (defaulted to the rate when not declared).
        ceil: Rate,
        /// HTB priority.
        prio: Option<u32>,
        /// Opaque option pairs, declaration order.
        extra: Vec<(String, String)>,
    },
    /// A u32 classification rule.
    Filter {
        /// Filter preference.
        pref: u32,
        /// Match expression, verbatim.
        match_expr: String,
        /// Class receiving the matched traffic.
        flowid: TcHandle,
    },
}

impl PartialEq for Payload {
    fn eq(&self, other: &Payload) -> bool {
        match (self, other) {
            (
                Payload::Qdisc { kind, options, default_class },
                Payload::Qdisc { kind: k2, options: o2, default_class: d2 },
            ) => kind == k2 && default_class == d2 && sorted(options) == sorted(o2),
            (
                Payload::Class { rate, ceil, prio, extra },
                Payload::Class { rate: r2, ceil: c2, prio: p2, extra: e2 },
            ) => rate == r2 && ceil == c2 && prio == p2 && sorted(extra) == sorted(e2),
            (
                Payload::Filter { pref, match_expr, flowid },
                Payload::Filter { pref: p2, match_expr: m2, flowid: f2 },
            ) => pref == p2 && match_expr == m2 && flowid == f2,
            _ => false,
        }
    }
}

fn sorted(pairs: &[(String, String)]) -> Vec<&(String, String)> {
    let mut pairs: Vec<_> = pairs.iter().collect();
    pairs.sort();
    pairs
}

/// Identity of the entity an op touches, independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKey {
    /// A qdisc, identified by its handle.
    Qdisc(TcHandle),
    /// A class, identified by its handle.
    Class(TcHandle),
    /// A filter, identified by its attach point and preference.
    Filter {
        /// Qdisc the filter attaches to.
        parent: TcHandle,
        /// Filter preference.
        pref: u32,
    },
}

/// One abstract operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    /// What this operation does.
    pub kind: OpKind,
    /// The entity's own handle. For filters this is the qdisc the filter
    /// attaches to (filters have no handle of their own here).
    pub target: TcHandle,
    /// Handle of the parent entity; `None` for the root qdisc.
    pub parent: Option<TcHandle>,
    /// Entity payload.
    pub payload: Payload,
    /// Documentation-only comment carried into rendered scripts.
    pub comment: Option<String>,
}

impl Op {
    /// Identity key for diffing.
    pub fn key(&self) -> OpKey {
        match &self.payload {
            Payload::Qdisc { .. } => OpKey::Qdisc(self.target),
            Payload::Class { .. } => OpKey::Class(self.target),
            Payload::Filter { pref, .. } => OpKey::Filter {
                parent: self.target,
                pref: *pref,
            },
        }
    }

    /// Returns true if this op describes the interface root qdisc.
    pub fn is_root_qdisc(&self) -> bool {
        matches!(self.payload, Payload::Qdisc { .. }) && self.parent.is_none()
    }

    /// Flips an add op into the matching delete op.
    pub fn into_delete(mut self) -> Op {
        self.kind = match self.kind {
            OpKind::AddQdisc | OpKind::DelQdisc => OpKind::DelQdisc,
            OpKind::AddClass | OpKind::DelClass => OpKind::DelClass,
            OpKind::AddFilter | OpKind::DelFilter => OpKind::DelFilter,
        };
        self.comment = None;
        self
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.target)?;
        if let Some(parent) = self.parent {
            write!(f, " parent {}", parent)?;
        }
        match &self.payload {
            Payload::Qdisc { kind, .. } => write!(f, " {}", kind),
            Payload::Class { rate, .. } => write!(f, " rate {}", rate),
            Payload::Filter { match_expr, flowid, .. } => {
                write!(f, " {} flowid {}", match_expr, flowid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class_op() -> Op {
        Op {
            kind: OpKind::AddClass,
            target: TcHandle::class(1, 13),
            parent: Some(TcHandle::class(1, 1)),
            payload: Payload::Class {
                rate: "768kbit".parse().unwrap(),
                ceil: "1024kbit".parse().unwrap(),
                prio: Some(2),
                extra: vec![],
            },
            comment: None,
        }
    }

    #[test]
    fn test_key_identity() {
        let op = class_op();
        assert_eq!(op.key(), OpKey::Class(TcHandle::class(1, 13)));
    }

    #[test]
    fn test_filter_key_uses_pref() {
        let op = Op {
            kind: OpKind::AddFilter,
            target: TcHandle::qdisc(1),
            parent: Some(TcHandle::qdisc(1)),
            payload: Payload::Filter {
                pref: 2,
                match_expr: "match ip tos 0x08 0xff".to_string(),
                flowid: TcHandle::class(1, 3),
            },
            comment: None,
        };
        assert_eq!(
            op.key(),
            OpKey::Filter {
                parent: TcHandle::qdisc(1),
                pref: 2
            }
        );
    }

    #[test]
    fn test_into_delete() {
        let del = class_op().into_delete();
        assert_eq!(del.kind, OpKind::DelClass);
        assert!(del.kind.is_delete());
        // identity survives the flip
        assert_eq!(del.key(), class_op().key());
    }

    #[test]
    fn test_comment_not_part_of_payload_equality() {
        let mut a = class_op();
        let mut b = class_op();
        a.comment = Some("Default traffic".to_string());
        b.comment = None;
        assert_eq!(a.payload, b.payload);
    }

    #[test]
    fn test_option_order_irrelevant_to_equality() {
        let a = Payload::Qdisc {
            kind: QdiscKind::Sfq,
            options: vec![
                ("perturb".to_string(), "10".to_string()),
                ("quantum".to_string(), "1514".to_string()),
            ],
            default_class: None,
        };
        let b = Payload::Qdisc {
            kind: QdiscKind::Sfq,
            options: vec![
                ("quantum".to_string(), "1514".to_string()),
                ("perturb".to_string(), "10".to_string()),
            ],
            default_class: None,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_display() {
        let op = class_op();
        assert_eq!(op.to_string(), "addClass 1:d parent 1:1 rate 768kbit");
    }
}
