//! Linearization of a validated hierarchy into ordered operations.
//!
//! The compiler walks the canonical traversal and emits one op per node:
//! every parent before its children, every class before any filter or
//! qdisc that references it. The kernel rejects references to
//! not-yet-created parents, so this order is a hard contract.
//!
//! Compilation is a pure function of the tree: the same allocated,
//! validated hierarchy always produces the identical op list.

use shaping_common::{ShapingError, ShapingResult};

use crate::hierarchy::{ClassIdx, FilterIdx, Hierarchy, QdiscIdx, VisitItem};
use crate::ops::{Op, OpKind, Payload};
use crate::types::TcHandle;

/// Compiles the hierarchy into its ordered operation list.
pub fn compile(h: &Hierarchy) -> ShapingResult<Vec<Op>> {
    let root_major = qdisc_handle(h, 0)?;
    let mut ops = Vec::new();

    for item in h.visit() {
        let op = match item {
            VisitItem::Qdisc(idx) => compile_qdisc(h, idx, root_major)?,
            VisitItem::Class(idx) => compile_class(h, idx, root_major)?,
            VisitItem::Filter(idx) => compile_filter(h, idx, root_major)?,
        };
        ops.push(op);
    }

    Ok(ops)
}

fn compile_qdisc(h: &Hierarchy, idx: QdiscIdx, root_major: u16) -> ShapingResult<Op> {
    let qdisc = &h.qdiscs[idx];
    let major = qdisc_handle(h, idx)?;

    let parent = match qdisc.parent_class {
        None => None,
        Some(class) => Some(TcHandle::class(root_major, class_id(h, class)?)),
    };

    let default_class = match qdisc.default_class {
        None => None,
        Some(id) => Some(id.try_into().map_err(|_| {
            ShapingError::internal(format!("default class {} survived validation", id))
        })?),
    };

    Ok(Op {
        kind: OpKind::AddQdisc,
        target: TcHandle::qdisc(major),
        parent,
        payload: Payload::Qdisc {
            kind: qdisc.kind.clone(),
            options: qdisc.options.clone(),
            default_class,
        },
        comment: qdisc.comment.clone(),
    })
}

fn compile_class(h: &Hierarchy, idx: ClassIdx, root_major: u16) -> ShapingResult<Op> {
    let class = &h.classes[idx];
    let id = class_id(h, idx)?;

    let parent = match class.parent_class {
        None => TcHandle::qdisc(root_major),
        Some(parent) => TcHandle::class(root_major, class_id(h, parent)?),
    };

    Ok(Op {
        kind: OpKind::AddClass,
        target: TcHandle::class(root_major, id),
        parent: Some(parent),
        payload: Payload::Class {
            rate: class.rate.clone(),
            ceil: class.effective_ceil().clone(),
            prio: class.prio,
            extra: class.extra.clone(),
        },
        comment: class.comment.clone(),
    })
}

fn compile_filter(h: &Hierarchy, idx: FilterIdx, root_major: u16) -> ShapingResult<Op> {
    let filter = &h.filters[idx];
    let pref = filter.resolved_pref.ok_or_else(|| {
        ShapingError::internal("filter preference missing; allocator did not run")
    })?;
    let flowid = TcHandle::class(root_major, class_id(h, filter.owner)?);

    Ok(Op {
        kind: OpKind::AddFilter,
        target: TcHandle::qdisc(root_major),
        parent: Some(TcHandle::qdisc(root_major)),
        payload: Payload::Filter {
            pref,
            match_expr: filter.match_expr.clone(),
            flowid,
        },
        comment: None,
    })
}

fn qdisc_handle(h: &Hierarchy, idx: QdiscIdx) -> ShapingResult<u16> {
    h.qdiscs[idx]
        .handle
        .ok_or_else(|| ShapingError::internal("qdisc handle missing; allocator did not run"))
}

fn class_id(h: &Hierarchy, idx: ClassIdx) -> ShapingResult<u16> {
    h.classes[idx]
        .resolved_id
        .ok_or_else(|| ShapingError::internal("class id missing; allocator did not run"))
}
