//! Structural invariant checking for an allocated hierarchy.
//!
//! The validator runs after allocation and before compilation. It never
//! mutates the tree and it collects every violation it finds, so a single
//! run reports everything wrong with a spec.

use std::collections::{BTreeMap, BTreeSet};

use shaping_common::{ShapingError, ShapingResult, ValidationError};

use crate::hierarchy::{Hierarchy, VisitItem};
use crate::types::CLASS_ID_MAX;

/// Checks every invariant; returns all violations at once.
pub fn validate(h: &Hierarchy) -> ShapingResult<()> {
    let mut violations = Vec::new();
    let order = h.visit();

    check_class_ids(h, &order, &mut violations);
    check_ceilings(h, &order, &mut violations);
    check_default_class(h, &mut violations);
    check_filter_matches(h, &order, &mut violations);

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ShapingError::Validation(violations))
    }
}

fn check_class_ids(h: &Hierarchy, order: &[VisitItem], violations: &mut Vec<ValidationError>) {
    let mut seen: BTreeMap<u16, usize> = BTreeMap::new();

    for item in order {
        let &VisitItem::Class(idx) = item else { continue };
        let class = &h.classes[idx];

        if let Some(declared) = class.declared_id {
            if declared < 1 || declared > CLASS_ID_MAX as u32 {
                violations.push(ValidationError::ClassIdOutOfRange {
                    id: declared,
                    max: CLASS_ID_MAX,
                });
                continue;
            }
        }
        if let Some(id) = class.resolved_id {
            *seen.entry(id).or_insert(0) += 1;
        }
    }

    for (id, count) in seen {
        if count > 1 {
            violations.push(ValidationError::DuplicateClassId { id: id as u32 });
        }
    }
}

fn check_ceilings(h: &Hierarchy, order: &[VisitItem], violations: &mut Vec<ValidationError>) {
    for item in order {
        let &VisitItem::Class(idx) = item else { continue };
        let class = &h.classes[idx];
        let ceil = class.effective_ceil();
        if ceil < &class.rate {
            violations.push(ValidationError::CeilBelowRate {
                id: class.resolved_id.unwrap_or_default(),
                rate: class.rate.as_str().to_string(),
                ceil: ceil.as_str().to_string(),
            });
        }
    }
}

fn check_default_class(h: &Hierarchy, violations: &mut Vec<ValidationError>) {
    let Some(default) = h.root().default_class else {
        return;
    };
    let resolved = h
        .classes
        .iter()
        .any(|class| class.resolved_id.map(u32::from) == Some(default));
    if !resolved {
        violations.push(ValidationError::UnknownDefaultClass { id: default });
    }
}

fn check_filter_matches(h: &Hierarchy, order: &[VisitItem], violations: &mut Vec<ValidationError>) {
    // Every filter of an htb hierarchy attaches to the root qdisc, so the
    // uniqueness scope is the whole interface.
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for item in order {
        let &VisitItem::Filter(idx) = item else { continue };
        let expr = h.filters[idx].match_expr.as_str();
        if !seen.insert(expr) {
            violations.push(ValidationError::DuplicateFilterMatch {
                expr: expr.to_string(),
            });
        }
    }
}
