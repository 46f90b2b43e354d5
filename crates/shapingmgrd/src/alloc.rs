//! Identifier allocation for classes, qdisc handles and filter preferences.
//!
//! Class ids use a two-pass scheme: first every explicit declaration is
//! claimed (colliding declarations abort), then auto classes fill the
//! lowest unused identifiers in declaration order. The used-id set is
//! derived from the tree on every call, never from allocator state, so an
//! unchanged spec always resolves to the same identifiers.
//!
//! Qdisc handles are sequential majors assigned in the canonical traversal
//! order (the root is always `1:`). Filter preferences use the same
//! two-pass scheme as class ids.

use std::collections::BTreeSet;

use shaping_common::{AllocationError, ShapingResult};

use crate::hierarchy::{Hierarchy, VisitItem};
use crate::types::CLASS_ID_MAX;

/// Resolves every class id, qdisc handle and filter preference in place.
pub fn allocate(h: &mut Hierarchy) -> ShapingResult<()> {
    let order = h.visit();

    allocate_class_ids(h, &order)?;
    allocate_qdisc_handles(h, &order)?;
    allocate_filter_prefs(h, &order)?;

    Ok(())
}

fn allocate_class_ids(h: &mut Hierarchy, order: &[VisitItem]) -> ShapingResult<()> {
    let mut used: BTreeSet<u16> = BTreeSet::new();

    // Pass 1: claim explicit ids anywhere in the tree.
    for item in order {
        let &VisitItem::Class(idx) = item else { continue };
        let Some(declared) = h.classes[idx].declared_id else { continue };
        if declared >= 1 && declared <= CLASS_ID_MAX as u32 {
            if !used.insert(declared as u16) {
                return Err(AllocationError::IdCollision { id: declared }.into());
            }
            h.classes[idx].resolved_id = Some(declared as u16);
        }
        // Out-of-range declarations stay unresolved; the validator
        // reports them before anything is compiled.
    }

    // Pass 2: fill gaps for auto ids in declaration order.
    let mut next: u32 = 1;
    for item in order {
        let &VisitItem::Class(idx) = item else { continue };
        if h.classes[idx].declared_id.is_some() {
            continue;
        }
        while next <= CLASS_ID_MAX as u32 && used.contains(&(next as u16)) {
            next += 1;
        }
        if next > CLASS_ID_MAX as u32 {
            return Err(AllocationError::NamespaceExhausted { max: CLASS_ID_MAX }.into());
        }
        used.insert(next as u16);
        h.classes[idx].resolved_id = Some(next as u16);
        next += 1;
    }

    Ok(())
}

fn allocate_qdisc_handles(h: &mut Hierarchy, order: &[VisitItem]) -> ShapingResult<()> {
    let mut major: u32 = 1;
    for item in order {
        let &VisitItem::Qdisc(idx) = item else { continue };
        if major > u16::MAX as u32 {
            return Err(AllocationError::NamespaceExhausted { max: u16::MAX }.into());
        }
        h.qdiscs[idx].handle = Some(major as u16);
        major += 1;
    }
    Ok(())
}

fn allocate_filter_prefs(h: &mut Hierarchy, order: &[VisitItem]) -> ShapingResult<()> {
    let mut used: BTreeSet<u32> = BTreeSet::new();

    for item in order {
        let &VisitItem::Filter(idx) = item else { continue };
        let Some(pref) = h.filters[idx].declared_pref else { continue };
        if !used.insert(pref) {
            return Err(AllocationError::PrefCollision { pref }.into());
        }
        h.filters[idx].resolved_pref = Some(pref);
    }

    let mut next: u32 = 1;
    for item in order {
        let &VisitItem::Filter(idx) = item else { continue };
        if h.filters[idx].declared_pref.is_some() {
            continue;
        }
        while next <= u16::MAX as u32 && used.contains(&next) {
            next += 1;
        }
        if next > u16::MAX as u32 {
            return Err(AllocationError::PrefExhausted.into());
        }
        used.insert(next);
        h.filters[idx].resolved_pref = Some(next);
        next += 1;
    }

    Ok(())
}
