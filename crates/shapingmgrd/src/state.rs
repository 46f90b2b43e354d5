//! Live shaping state reader.
//!
//! Shells out to `tc ... show dev <iface>` and reconstructs the abstract
//! operation list the reconciler diffs against. Kernel-added bookkeeping
//! (burst sizes, refcounts, default option values) is stripped so that an
//! untouched interface reads back equal to what the compiler emitted.

use std::collections::BTreeMap;

use shaping_common::shell::{self, TC_CMD};
use shaping_common::{ShapingError, ShapingResult};
use tracing::{debug, warn};

use crate::ops::{Op, OpKind, Payload};
use crate::types::{QdiscKind, Rate, TcHandle};

/// Option keys the kernel reports on qdiscs even when never set.
const QDISC_NOISE_KEYS: &[&str] = &[
    "refcnt",
    "r2q",
    "direct_packets_stat",
    "direct_qlen",
    "limit",
    "quantum",
    "depth",
    "divisor",
    "flows",
    "linklayer",
];

/// Option keys the kernel reports on classes even when never set.
const CLASS_NOISE_KEYS: &[&str] = &["leaf", "burst", "cburst", "quantum", "level", "linklayer"];

/// Read and parse the current shaping state of an interface.
pub async fn read_live_state(iface: &str) -> ShapingResult<Vec<Op>> {
    let dev = shell::shellquote(iface);
    let qdiscs = shell::exec_or_throw(&format!("{} qdisc show dev {}", TC_CMD, dev)).await?;
    let classes = shell::exec_or_throw(&format!("{} class show dev {}", TC_CMD, dev)).await?;
    let filters = shell::exec_or_throw(&format!("{} filter show dev {}", TC_CMD, dev)).await?;
    let ops = parse_live_state(&qdiscs, &classes, &filters)?;
    debug!(iface, count = ops.len(), "read live state");
    Ok(ops)
}

/// Parse the three `tc ... show` outputs into an operation list ordered
/// root qdisc, classes (parents first), filters, leaf qdiscs.
pub fn parse_live_state(
    qdisc_out: &str,
    class_out: &str,
    filter_out: &str,
) -> ShapingResult<Vec<Op>> {
    let (root, leaves) = parse_qdiscs(qdisc_out)?;
    let Some(root) = root else {
        // no shaping installed; the kernel default qdisc is not ours
        return Ok(Vec::new());
    };
    let classes = parse_classes(class_out, &root)?;
    let filters = parse_filters(filter_out)?;

    let mut ops = Vec::new();
    ops.push(root);
    ops.extend(order_classes(classes));
    ops.extend(filters);
    ops.extend(leaves);
    Ok(ops)
}

/// Parses qdisc lines; returns the root op (if any was installed by a
/// manager, i.e. has a nonzero handle) and leaf qdisc ops sorted by major.
fn parse_qdiscs(output: &str) -> ShapingResult<(Option<Op>, Vec<Op>)> {
    let mut root = None;
    let mut leaves = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"qdisc") || tokens.len() < 3 {
            continue;
        }
        let kind = tokens[1]
            .parse()
            .unwrap_or_else(|()| QdiscKind::Other(tokens[1].to_string()));
        let handle: TcHandle = tokens[2]
            .parse()
            .map_err(|e| ShapingError::parse("qdisc", e))?;
        if handle.major == 0 {
            // kernel default discipline (noqueue, pfifo_fast, ...)
            continue;
        }
        let (parent, rest) = match tokens.get(3) {
            Some(&"root") => (None, &tokens[4..]),
            Some(&"parent") => {
                let parent: TcHandle = tokens
                    .get(4)
                    .ok_or_else(|| ShapingError::parse("qdisc", "parent without handle"))?
                    .parse()
                    .map_err(|e| ShapingError::parse("qdisc", e))?;
                (Some(parent), &tokens[5..])
            }
            _ => {
                warn!(line, "unrecognized qdisc line, skipping");
                continue;
            }
        };
        let mut default_class = None;
        let mut options = Vec::new();
        for pair in rest.chunks(2) {
            let [key, value] = pair else { break };
            if *key == "default" {
                // htb prints the default minor in hex
                let digits = value.trim_start_matches("0x");
                default_class = u16::from_str_radix(digits, 16).ok();
            } else if !QDISC_NOISE_KEYS.contains(key) {
                options.push((key.to_string(), strip_unit(value)));
            }
        }
        let op = Op {
            kind: OpKind::AddQdisc,
            target: TcHandle::qdisc(handle.major),
            parent,
            payload: Payload::Qdisc {
                kind,
                options,
                default_class,
            },
            comment: None,
        };
        if op.parent.is_none() {
            root = Some(op);
        } else {
            leaves.push(op);
        }
    }
    leaves.sort_by_key(|op| op.target);
    Ok((root, leaves))
}

fn parse_classes(output: &str, root: &Op) -> ShapingResult<Vec<Op>> {
    let mut classes = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"class") || tokens.len() < 4 {
            continue;
        }
        let classid: TcHandle = tokens[2]
            .parse()
            .map_err(|e| ShapingError::parse("class", e))?;
        let (parent, rest) = match tokens.get(3) {
            Some(&"root") => (root.target, &tokens[4..]),
            Some(&"parent") => {
                let parent: TcHandle = tokens
                    .get(4)
                    .ok_or_else(|| ShapingError::parse("class", "parent without handle"))?
                    .parse()
                    .map_err(|e| ShapingError::parse("class", e))?;
                (parent, &tokens[5..])
            }
            _ => {
                warn!(line, "unrecognized class line, skipping");
                continue;
            }
        };
        let mut rate = None;
        let mut ceil = None;
        let mut prio = None;
        for pair in rest.chunks(2) {
            let [key, value] = pair else { break };
            match *key {
                "rate" => rate = Some(parse_rate(value)?),
                "ceil" => ceil = Some(parse_rate(value)?),
                // htb prints "prio 0" for classes declared without one
                "prio" => prio = value.parse().ok().filter(|&p: &u32| p != 0),
                _ => {} // kernel bookkeeping, not configuration
            }
        }
        let rate =
            rate.ok_or_else(|| ShapingError::parse("class", format!("{} has no rate", classid)))?;
        let ceil = ceil.unwrap_or_else(|| rate.clone());
        classes.push(Op {
            kind: OpKind::AddClass,
            target: classid,
            parent: Some(parent),
            payload: Payload::Class {
                rate,
                ceil,
                prio,
                extra: Vec::new(),
            },
            comment: None,
        });
    }
    Ok(classes)
}

fn parse_filters(output: &str) -> ShapingResult<Vec<Op>> {
    // tc prints one "filter ..." header per hash-table entry and the
    // actual selector on indented "match AAAAAAAA/MMMMMMMM at N" lines.
    let mut filters: Vec<Op> = Vec::new();
    let mut current: Option<(TcHandle, u32, TcHandle)> = None;
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first() {
            Some(&"filter") => {
                let parent = find_value(&tokens, "parent")
                    .ok_or_else(|| ShapingError::parse("filter", "missing parent"))?
                    .parse::<TcHandle>()
                    .map_err(|e| ShapingError::parse("filter", e))?;
                let Some(pref) = find_value(&tokens, "pref").and_then(|v| v.parse().ok()) else {
                    continue;
                };
                // only lines carrying a flowid describe an installed rule
                let Some(flowid) = find_value(&tokens, "flowid") else {
                    current = None;
                    continue;
                };
                let flowid: TcHandle = flowid
                    .parse()
                    .map_err(|e| ShapingError::parse("filter", e))?;
                current = Some((parent, pref, flowid));
            }
            Some(&"match") if tokens.len() >= 4 => {
                let Some((parent, pref, flowid)) = current.take() else {
                    continue;
                };
                filters.push(Op {
                    kind: OpKind::AddFilter,
                    target: parent,
                    parent: Some(parent),
                    payload: Payload::Filter {
                        pref,
                        match_expr: decode_u32_match(tokens[1], tokens[3]),
                        flowid,
                    },
                    comment: None,
                });
            }
            _ => {}
        }
    }
    filters.sort_by_key(|op| op.key());
    Ok(filters)
}

/// Decode a u32 selector dump back into the declared form where the
/// pattern is recognizable; otherwise keep the raw dump so a mismatch
/// forces a rebuild of the filter.
fn decode_u32_match(selector: &str, offset: &str) -> String {
    if let Some((value, mask)) = selector.split_once('/') {
        if offset == "0" && mask.eq_ignore_ascii_case("00ff0000") {
            // TOS byte of the IP header
            if let Ok(word) = u32::from_str_radix(value, 16) {
                return format!("match ip tos 0x{:02x} 0xff", (word >> 16) & 0xff);
            }
        }
    }
    format!("match {} at {}", selector, offset)
}

fn parse_rate(text: &str) -> ShapingResult<Rate> {
    text.parse()
        .map_err(|e: String| ShapingError::parse("rate", e))
}

fn find_value<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == key)
        .and_then(|i| tokens.get(i + 1).copied())
}

/// Keeps numeric option values comparable with their declared form:
/// the kernel prints `perturb 10sec` for a declared `perturb 10`.
fn strip_unit(value: &str) -> String {
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits == value {
        return value.to_string();
    }
    match &value[digits.len()..] {
        "sec" | "msec" | "usec" | "s" | "ms" | "us" | "p" | "b" => digits,
        _ => value.to_string(),
    }
}

/// Orders class ops parents-first so deletion (which reverses the list)
/// removes children before the classes they borrow from.
fn order_classes(mut classes: Vec<Op>) -> Vec<Op> {
    classes.sort_by_key(|op| op.target);
    let mut placed: BTreeMap<TcHandle, ()> = BTreeMap::new();
    let mut ordered = Vec::with_capacity(classes.len());
    while !classes.is_empty() {
        let before = classes.len();
        classes.retain(|op| {
            let parent_ready = match op.parent {
                Some(parent) if !parent.is_qdisc() => placed.contains_key(&parent),
                _ => true,
            };
            if parent_ready {
                placed.insert(op.target, ());
                ordered.push(op.clone());
                false
            } else {
                true
            }
        });
        if classes.len() == before {
            // orphaned classes (parent vanished mid-read); append as-is
            ordered.append(&mut classes);
        }
    }
    ordered
}
