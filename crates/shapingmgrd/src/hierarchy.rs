//! In-memory shaping hierarchy and the builder that constructs it.
//!
//! The hierarchy is an arena: qdisc, class and filter nodes live in flat
//! vectors and reference each other by index. It is built fresh for each
//! compilation pass, never mutated afterwards (the allocator only fills in
//! identifiers), and discarded once the operation list exists.
//!
//! The builder performs structural checks only; invariant checking is the
//! validator's job.

use serde_yaml::Value;

use shaping_common::{ShapingError, ShapingResult};

use crate::config;
use crate::types::{QdiscKind, Rate};

/// Index of a qdisc node within the arena.
pub type QdiscIdx = usize;
/// Index of a class node within the arena.
pub type ClassIdx = usize;
/// Index of a filter node within the arena.
pub type FilterIdx = usize;

/// A queueing-discipline node.
#[derive(Debug, Clone)]
pub struct QdiscNode {
    /// Discipline kind.
    pub kind: QdiscKind,
    /// Opaque option pairs, declaration order preserved.
    pub options: Vec<(String, String)>,
    /// Declared default-class reference (root htb only).
    pub default_class: Option<u32>,
    /// Owning class; `None` for the interface root.
    pub parent_class: Option<ClassIdx>,
    /// Direct child classes, declaration order.
    pub classes: Vec<ClassIdx>,
    /// Qdisc handle major, assigned by the allocator.
    pub handle: Option<u16>,
    /// Documentation-only comment.
    pub comment: Option<String>,
}

/// A bandwidth-allocation class node.
#[derive(Debug, Clone)]
pub struct ClassNode {
    /// Explicitly declared id, if any.
    pub declared_id: Option<u32>,
    /// Resolved id, filled in by the allocator.
    pub resolved_id: Option<u16>,
    /// Documentation-only comment.
    pub comment: Option<String>,
    /// Guaranteed rate.
    pub rate: Rate,
    /// Ceiling; defaults to the rate when omitted.
    pub ceil: Option<Rate>,
    /// HTB priority.
    pub prio: Option<u32>,
    /// Remaining option pairs, passed through opaquely.
    pub extra: Vec<(String, String)>,
    /// Owning class; `None` when directly under the root qdisc.
    pub parent_class: Option<ClassIdx>,
    /// Sub-classes, declaration order.
    pub children: Vec<ClassIdx>,
    /// Attached leaf qdisc, at most one.
    pub leaf_qdisc: Option<QdiscIdx>,
    /// Match rules steering traffic into this class, declaration order.
    pub filters: Vec<FilterIdx>,
}

impl ClassNode {
    /// The effective ceiling: declared, or the rate when omitted.
    pub fn effective_ceil(&self) -> &Rate {
        self.ceil.as_ref().unwrap_or(&self.rate)
    }
}

/// A classification rule owned by a class.
#[derive(Debug, Clone)]
pub struct FilterNode {
    /// The u32 match expression, verbatim (e.g. `match ip tos 0x10 0xff`).
    pub match_expr: String,
    /// The class this filter steers traffic into.
    pub owner: ClassIdx,
    /// Explicitly declared preference, if any.
    pub declared_pref: Option<u32>,
    /// Resolved preference, filled in by the allocator.
    pub resolved_pref: Option<u32>,
}

/// One item of the canonical pre-order traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitItem {
    /// A qdisc node.
    Qdisc(QdiscIdx),
    /// A class node.
    Class(ClassIdx),
    /// A filter node.
    Filter(FilterIdx),
}

/// The shaping hierarchy of one interface.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    /// Interface name.
    pub iface: String,
    /// Qdisc arena; index 0 is the root.
    pub qdiscs: Vec<QdiscNode>,
    /// Class arena.
    pub classes: Vec<ClassNode>,
    /// Filter arena.
    pub filters: Vec<FilterNode>,
    /// Whether shaping is enabled for the interface (default true).
    pub enabled: bool,
}

impl Hierarchy {
    /// Builds the hierarchy for one interface from its declarative spec.
    pub fn build(iface: &str, spec: &Value) -> ShapingResult<Self> {
        let mut hierarchy = Hierarchy {
            iface: iface.to_string(),
            qdiscs: Vec::new(),
            classes: Vec::new(),
            filters: Vec::new(),
            enabled: true,
        };
        build_qdisc(&mut hierarchy, spec, iface, None, true)?;
        Ok(hierarchy)
    }

    /// Root qdisc of the hierarchy.
    pub fn root(&self) -> &QdiscNode {
        &self.qdiscs[0]
    }

    /// Canonical pre-order traversal: root qdisc, then for each class in
    /// declaration order: the class, its sub-classes (recursively), its
    /// filters, then its attached leaf qdisc. Both the allocator and the
    /// compiler walk this order, which is what makes handles stable across
    /// runs.
    pub fn visit(&self) -> Vec<VisitItem> {
        let mut items = Vec::new();
        items.push(VisitItem::Qdisc(0));
        for &class in &self.qdiscs[0].classes {
            self.visit_class(class, &mut items);
        }
        items
    }

    fn visit_class(&self, idx: ClassIdx, items: &mut Vec<VisitItem>) {
        items.push(VisitItem::Class(idx));
        for &child in &self.classes[idx].children {
            self.visit_class(child, items);
        }
        for &filter in &self.classes[idx].filters {
            items.push(VisitItem::Filter(filter));
        }
        if let Some(qdisc) = self.classes[idx].leaf_qdisc {
            items.push(VisitItem::Qdisc(qdisc));
        }
    }
}

fn build_qdisc(
    h: &mut Hierarchy,
    spec: &Value,
    path: &str,
    parent_class: Option<ClassIdx>,
    is_root: bool,
) -> ShapingResult<QdiscIdx> {
    let fields = config::normalize_fields(spec, path)?;

    let mut kind: Option<QdiscKind> = None;
    let mut options: Option<String> = None;
    let mut default_class: Option<u32> = None;
    let mut comment: Option<String> = None;
    let mut classes_value: Option<Value> = None;
    let mut enabled: Option<bool> = None;

    for (name, value) in &fields {
        let field_path = format!("{}.{}", path, name);
        match name.as_str() {
            "type" => {
                let text = config::scalar_str(value, &field_path)?;
                // QdiscKind::from_str is total
                kind = text.parse().ok();
            }
            "options" => options = Some(config::scalar_str(value, &field_path)?),
            "default" => default_class = Some(config::scalar_u32(value, &field_path)?),
            "comment" => comment = Some(config::scalar_str(value, &field_path)?),
            "classes" => classes_value = Some(value.clone()),
            "enabled" if is_root => {
                enabled = value.as_bool().ok_or_else(|| {
                    ShapingError::parse(&field_path, "expected a boolean")
                })?.into();
            }
            "filters" => {
                return Err(ShapingError::parse(
                    field_path,
                    "filters belong to classes, not qdiscs",
                ));
            }
            other => {
                return Err(ShapingError::parse(
                    path,
                    format!("unknown qdisc field '{}'", other),
                ));
            }
        }
    }

    let kind = kind.ok_or_else(|| ShapingError::parse(path, "missing 'type' for qdisc"))?;
    if !kind.is_recognized() && options.is_none() {
        return Err(ShapingError::parse(
            path,
            format!("unknown qdisc type '{}' without an options fallback", kind),
        ));
    }
    if default_class.is_some() && (!is_root || kind != QdiscKind::Htb) {
        return Err(ShapingError::parse(
            path,
            "'default' is only valid on a root htb qdisc",
        ));
    }
    if classes_value.is_some() && !kind.is_classful() {
        return Err(ShapingError::parse(
            path,
            format!("classes are not supported under a '{}' qdisc", kind),
        ));
    }
    if classes_value.is_some() && !is_root {
        return Err(ShapingError::parse(
            path,
            "classes are only valid on the root qdisc; attached qdiscs are leaf disciplines",
        ));
    }

    let option_pairs = parse_option_pairs(options.as_deref().unwrap_or(""), path)?;

    let idx = h.qdiscs.len();
    h.qdiscs.push(QdiscNode {
        kind,
        options: option_pairs,
        default_class,
        parent_class,
        classes: Vec::new(),
        handle: None,
        comment,
    });
    if let Some(enabled) = enabled {
        h.enabled = enabled;
    }

    if let Some(classes) = classes_value {
        let items = classes.as_sequence().ok_or_else(|| {
            ShapingError::parse(format!("{}.classes", path), "expected a sequence of classes")
        })?;
        for (i, item) in items.iter().enumerate() {
            let class_path = format!("{}.classes[{}]", path, i);
            let class = build_class(h, item, &class_path, None)?;
            h.qdiscs[idx].classes.push(class);
        }
    }

    Ok(idx)
}

fn build_class(
    h: &mut Hierarchy,
    spec: &Value,
    path: &str,
    parent_class: Option<ClassIdx>,
) -> ShapingResult<ClassIdx> {
    let fields = config::normalize_fields(spec, path)?;

    let mut declared_id: Option<u32> = None;
    let mut comment: Option<String> = None;
    let mut options: Option<String> = None;
    let mut filters_value: Option<Value> = None;
    let mut qdisc_value: Option<Value> = None;
    let mut classes_value: Option<Value> = None;

    for (name, value) in &fields {
        let field_path = format!("{}.{}", path, name);
        match name.as_str() {
            "id" => declared_id = Some(config::scalar_u32(value, &field_path)?),
            "comment" => comment = Some(config::scalar_str(value, &field_path)?),
            "options" => options = Some(config::scalar_str(value, &field_path)?),
            "filters" => filters_value = Some(value.clone()),
            "qdisc" => qdisc_value = Some(value.clone()),
            "classes" => classes_value = Some(value.clone()),
            other => {
                return Err(ShapingError::parse(
                    path,
                    format!("unknown class field '{}'", other),
                ));
            }
        }
    }

    let (rate, ceil, prio, extra) =
        parse_class_options(options.as_deref().unwrap_or(""), path)?;
    let rate = rate.ok_or_else(|| {
        ShapingError::parse(path, "class options must declare a rate")
    })?;

    let idx = h.classes.len();
    h.classes.push(ClassNode {
        declared_id,
        resolved_id: None,
        comment,
        rate,
        ceil,
        prio,
        extra,
        parent_class,
        children: Vec::new(),
        leaf_qdisc: None,
        filters: Vec::new(),
    });

    if let Some(classes) = classes_value {
        let items = classes.as_sequence().ok_or_else(|| {
            ShapingError::parse(format!("{}.classes", path), "expected a sequence of classes")
        })?;
        for (i, item) in items.iter().enumerate() {
            let class_path = format!("{}.classes[{}]", path, i);
            let child = build_class(h, item, &class_path, Some(idx))?;
            h.classes[idx].children.push(child);
        }
    }

    if let Some(filters) = filters_value {
        let items = filters.as_sequence().ok_or_else(|| {
            ShapingError::parse(format!("{}.filters", path), "expected a sequence of filters")
        })?;
        for (i, item) in items.iter().enumerate() {
            let filter_path = format!("{}.filters[{}]", path, i);
            let filter = build_filter(item, idx, &filter_path)?;
            let fidx = h.filters.len();
            h.filters.push(filter);
            h.classes[idx].filters.push(fidx);
        }
    }

    if let Some(qdisc) = qdisc_value {
        let qdisc_path = format!("{}.qdisc", path);
        let child = build_qdisc(h, &qdisc, &qdisc_path, Some(idx), false)?;
        h.classes[idx].leaf_qdisc = Some(child);
    }

    Ok(idx)
}

fn build_filter(spec: &Value, owner: ClassIdx, path: &str) -> ShapingResult<FilterNode> {
    let (match_expr, declared_pref) = match spec {
        Value::String(expr) => (expr.clone(), None),
        Value::Mapping(_) => {
            let fields = config::normalize_fields(spec, path)?;
            let mut match_expr: Option<String> = None;
            let mut pref: Option<u32> = None;
            for (name, value) in &fields {
                let field_path = format!("{}.{}", path, name);
                match name.as_str() {
                    "match" => match_expr = Some(config::scalar_str(value, &field_path)?),
                    "prio" => pref = Some(config::scalar_u32(value, &field_path)?),
                    other => {
                        return Err(ShapingError::parse(
                            path,
                            format!("unknown filter field '{}'", other),
                        ));
                    }
                }
            }
            let expr = match_expr
                .ok_or_else(|| ShapingError::parse(path, "filter is missing its match expression"))?;
            (expr, pref)
        }
        _ => {
            return Err(ShapingError::parse(
                path,
                "expected a match-expression string or a {prio, match} mapping",
            ));
        }
    };

    let match_expr = match_expr.trim().to_string();
    if !match_expr.starts_with("match ") {
        return Err(ShapingError::parse(
            path,
            format!("match expression must start with 'match': '{}'", match_expr),
        ));
    }

    Ok(FilterNode {
        match_expr,
        owner,
        declared_pref,
        resolved_pref: None,
    })
}

/// Splits an opaque option string into whitespace-separated `key value`
/// pairs, order preserved.
fn parse_option_pairs(options: &str, path: &str) -> ShapingResult<Vec<(String, String)>> {
    let tokens: Vec<&str> = options.split_whitespace().collect();
    if tokens.len() % 2 != 0 {
        return Err(ShapingError::parse(
            path,
            format!("malformed option string '{}': odd number of tokens", options),
        ));
    }
    Ok(tokens
        .chunks(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect())
}

type ClassOptions = (Option<Rate>, Option<Rate>, Option<u32>, Vec<(String, String)>);

/// Parses a class option string, typing the `rate`/`ceil`/`prio` keys and
/// keeping everything else as opaque pass-through pairs.
fn parse_class_options(options: &str, path: &str) -> ShapingResult<ClassOptions> {
    let mut rate: Option<Rate> = None;
    let mut ceil: Option<Rate> = None;
    let mut prio: Option<u32> = None;
    let mut extra = Vec::new();

    for (key, value) in parse_option_pairs(options, path)? {
        match key.as_str() {
            "rate" => {
                rate = Some(value.parse().map_err(|e| {
                    ShapingError::parse(path, format!("bad rate '{}': {}", value, e))
                })?);
            }
            "ceil" => {
                ceil = Some(value.parse().map_err(|e| {
                    ShapingError::parse(path, format!("bad ceil '{}': {}", value, e))
                })?);
            }
            "prio" => {
                let parsed: u32 = value.parse().map_err(|_| {
                    ShapingError::parse(path, format!("bad prio '{}'", value))
                })?;
                // prio 0 is htb's "no priority"; the kernel prints it
                // back for classes declared without one
                prio = (parsed != 0).then_some(parsed);
            }
            _ => extra.push((key, value)),
        }
    }

    Ok((rate, ceil, prio, extra))
}
