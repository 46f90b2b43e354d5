//! Shell command builders for traffic-control operations

use shaping_common::shell::{self, TC_CMD};

use crate::ops::{Op, OpKind, Payload};
use crate::reconcile::Plan;
use crate::types::TcHandle;

/// Build the tc command for one abstract operation.
pub fn build_op_cmd(iface: &str, op: &Op) -> String {
    let dev = shell::shellquote(iface);
    match (&op.kind, &op.payload) {
        (OpKind::AddQdisc, Payload::Qdisc { kind, options, default_class }) => {
            let parent = qdisc_parent(op.parent);
            let mut cmd = format!(
                "{} qdisc add dev {} {} handle {} {}",
                TC_CMD, dev, parent, op.target, kind
            );
            if let Some(default) = default_class {
                // htb parses the default minor as hex
                cmd.push_str(&format!(" default {:x}", default));
            }
            push_options(&mut cmd, options);
            cmd
        }
        (OpKind::DelQdisc, Payload::Qdisc { .. }) => match op.parent {
            None => format!("{} qdisc del dev {} root", TC_CMD, dev),
            Some(parent) => format!(
                "{} qdisc del dev {} parent {} handle {}",
                TC_CMD, dev, parent, op.target
            ),
        },
        (OpKind::AddClass, Payload::Class { rate, ceil, prio, extra }) => {
            let parent = op.parent.unwrap_or_else(|| TcHandle::qdisc(op.target.major));
            let mut cmd = format!(
                "{} class add dev {} parent {} classid {} htb rate {} ceil {}",
                TC_CMD, dev, parent, op.target, rate, ceil
            );
            if let Some(prio) = prio {
                cmd.push_str(&format!(" prio {}", prio));
            }
            push_options(&mut cmd, extra);
            cmd
        }
        (OpKind::DelClass, Payload::Class { .. }) => {
            format!("{} class del dev {} classid {}", TC_CMD, dev, op.target)
        }
        (OpKind::AddFilter, Payload::Filter { pref, match_expr, flowid }) => {
            format!(
                "{} filter add dev {} parent {} protocol ip prio {} u32 {} flowid {}",
                TC_CMD, dev, op.target, pref, match_expr, flowid
            )
        }
        (OpKind::DelFilter, Payload::Filter { pref, .. }) => {
            format!(
                "{} filter del dev {} parent {} protocol ip prio {} u32",
                TC_CMD, dev, op.target, pref
            )
        }
        // kind/payload disagreement cannot be built; render something
        // greppable rather than panicking
        (kind, _) => format!("{} {} # unrenderable operation", TC_CMD, kind),
    }
}

/// Build the command that removes all shaping from an interface,
/// restoring the kernel's default discipline.
pub fn build_root_del_cmd(iface: &str) -> String {
    format!("{} qdisc del dev {} root", TC_CMD, shell::shellquote(iface))
}

/// Render a plan as an executable command script, one command per line,
/// with documentation comments carried over from the spec.
pub fn render_plan(iface: &str, plan: &Plan) -> String {
    let mut script = String::new();
    for op in plan.ops() {
        if let Some(comment) = &op.comment {
            script.push_str(&format!("# {}\n", comment));
        }
        script.push_str(&build_op_cmd(iface, op));
        script.push('\n');
    }
    script
}

fn qdisc_parent(parent: Option<TcHandle>) -> String {
    match parent {
        None => "root".to_string(),
        Some(handle) => format!("parent {}", handle),
    }
}

fn push_options(cmd: &mut String, options: &[(String, String)]) {
    for (key, value) in options {
        cmd.push_str(&format!(" {} {}", key, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QdiscKind;

    fn root_qdisc_op() -> Op {
        Op {
            kind: OpKind::AddQdisc,
            target: TcHandle::qdisc(1),
            parent: None,
            payload: Payload::Qdisc {
                kind: QdiscKind::Htb,
                options: vec![],
                default_class: Some(13),
            },
            comment: None,
        }
    }

    fn leaf_qdisc_op() -> Op {
        Op {
            kind: OpKind::AddQdisc,
            target: TcHandle::qdisc(2),
            parent: Some(TcHandle::class(1, 13)),
            payload: Payload::Qdisc {
                kind: QdiscKind::Sfq,
                options: vec![("perturb".to_string(), "10".to_string())],
                default_class: None,
            },
            comment: None,
        }
    }

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
            comment: Some("Default traffic".to_string()),
        }
    }

    fn filter_op() -> Op {
        Op {
            kind: OpKind::AddFilter,
            target: TcHandle::qdisc(1),
            parent: Some(TcHandle::qdisc(1)),
            payload: Payload::Filter {
                pref: 1,
                match_expr: "match ip tos 0x10 0xff".to_string(),
                flowid: TcHandle::class(1, 2),
            },
            comment: None,
        }
    }

    #[test]
    fn test_build_root_qdisc_cmd() {
        let cmd = build_op_cmd("eth1", &root_qdisc_op());
        assert_eq!(
            cmd,
            "/sbin/tc qdisc add dev \"eth1\" root handle 1: htb default d"
        );
    }

    #[test]
    fn test_build_leaf_qdisc_cmd() {
        let cmd = build_op_cmd("eth1", &leaf_qdisc_op());
        assert_eq!(
            cmd,
            "/sbin/tc qdisc add dev \"eth1\" parent 1:d handle 2: sfq perturb 10"
        );
    }

    #[test]
    fn test_build_class_cmd() {
        let cmd = build_op_cmd("eth1", &class_op());
        assert_eq!(
            cmd,
            "/sbin/tc class add dev \"eth1\" parent 1:1 classid 1:d htb rate 768kbit ceil 1024kbit prio 2"
        );
    }

    #[test]
    fn test_build_filter_cmd() {
        let cmd = build_op_cmd("eth1", &filter_op());
        assert_eq!(
            cmd,
            "/sbin/tc filter add dev \"eth1\" parent 1: protocol ip prio 1 u32 match ip tos 0x10 0xff flowid 1:2"
        );
    }

    #[test]
    fn test_build_delete_cmds() {
        let cmd = build_op_cmd("eth1", &root_qdisc_op().into_delete());
        assert_eq!(cmd, "/sbin/tc qdisc del dev \"eth1\" root");

        let cmd = build_op_cmd("eth1", &leaf_qdisc_op().into_delete());
        assert_eq!(cmd, "/sbin/tc qdisc del dev \"eth1\" parent 1:d handle 2:");

        let cmd = build_op_cmd("eth1", &class_op().into_delete());
        assert_eq!(cmd, "/sbin/tc class del dev \"eth1\" classid 1:d");

        let cmd = build_op_cmd("eth1", &filter_op().into_delete());
        assert_eq!(
            cmd,
            "/sbin/tc filter del dev \"eth1\" parent 1: protocol ip prio 1 u32"
        );
    }

    #[test]
    fn test_build_root_del_cmd() {
        assert_eq!(
            build_root_del_cmd("eth0"),
            "/sbin/tc qdisc del dev \"eth0\" root"
        );
    }

    #[test]
    fn test_render_plan_carries_comments() {
        let plan = Plan {
            deletions: vec![],
            creations: vec![class_op(), filter_op()],
        };
        let script = render_plan("eth1", &plan);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "# Default traffic");
        assert!(lines[1].starts_with("/sbin/tc class add"));
        assert!(lines[2].starts_with("/sbin/tc filter add"));
    }

    #[test]
    fn test_iface_is_quoted() {
        let cmd = build_op_cmd("eth1; rm -rf /", &class_op());
        assert!(cmd.contains("\"eth1; rm -rf /\""));
    }
}
