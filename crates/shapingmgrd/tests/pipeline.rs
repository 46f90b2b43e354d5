//! End-to-end pipeline tests for shapingmgrd
//!
//! Exercises the full path from a shaping document on disk to applied
//! operations: load, build, allocate, validate, compile, read-back,
//! reconcile and apply with a recording executor.

use std::io::Write;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use shapingmgrd::alloc::allocate;
use shapingmgrd::apply::{apply_plan, ApplyHalt};
use shapingmgrd::compile::compile;
use shapingmgrd::config::load_document;
use shapingmgrd::executor::RecordingExecutor;
use shapingmgrd::reconcile::reconcile;
use shapingmgrd::state::parse_live_state;
use shapingmgrd::validate::validate;
use shapingmgrd::{Hierarchy, Op, ShapingMgr};
use shaping_common::ShapingError;

const DOCUMENT: &str = r#"
eth1:
  - type: htb
  - default: 13
  - classes:
      - comment: Interface limit
        options: rate 1024kbit
        classes:
          - comment: Default traffic
            id: 13
            options: rate 768kbit ceil 1024kbit prio 2
            qdisc: { type: sfq, options: perturb 10 }
          - comment: Interactive traffic
            filters: [ match ip tos 0x10 0xff ]
            options: rate 128kbit prio 1
            qdisc: { type: sfq, options: perturb 10 }
          - comment: Bulk traffic
            filters: [ match ip tos 0x08 0xff ]
            options: rate 128kbit ceil 1024kbit prio 3
            qdisc: { type: sfq, options: perturb 10 }
eth2:
  - type: tbf
  - options: rate 2mbit burst 32kbit latency 400ms
"#;

fn write_document() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(DOCUMENT.as_bytes()).unwrap();
    file
}

fn compile_interface(iface: &str) -> Vec<Op> {
    let file = write_document();
    let document = load_document(file.path()).unwrap();
    let (_, spec) = document
        .iter()
        .find(|(name, _)| name == iface)
        .expect("interface declared");
    let mut hierarchy = Hierarchy::build(iface, spec).unwrap();
    allocate(&mut hierarchy).unwrap();
    validate(&hierarchy).unwrap();
    compile(&hierarchy).unwrap()
}

#[test]
fn test_document_compiles_to_expected_operations() {
    let ops: Vec<String> = compile_interface("eth1")
        .iter()
        .map(Op::to_string)
        .collect();
    assert_eq!(
        ops,
        vec![
            "addQdisc 1: htb",
            "addClass 1:1 parent 1: rate 1024kbit",
            "addClass 1:d parent 1:1 rate 768kbit",
            "addQdisc 2: parent 1:d sfq",
            "addClass 1:2 parent 1:1 rate 128kbit",
            "addFilter 1: parent 1: match ip tos 0x10 0xff flowid 1:2",
            "addQdisc 3: parent 1:2 sfq",
            "addClass 1:3 parent 1:1 rate 128kbit",
            "addFilter 1: parent 1: match ip tos 0x08 0xff flowid 1:3",
            "addQdisc 4: parent 1:3 sfq",
        ]
    );
}

#[test]
fn test_classless_interface_compiles_to_single_qdisc() {
    let ops = compile_interface("eth2");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].to_string(), "addQdisc 1: tbf");
}

/// Output in the shape `tc ... show dev eth1` prints after the example
/// document has been installed.
const LIVE_QDISCS: &str = "\
qdisc htb 1: root refcnt 2 r2q 10 default 0xd direct_packets_stat 0 direct_qlen 1000
qdisc sfq 2: parent 1:d limit 127p quantum 1514b depth 127 divisor 1024 perturb 10sec
qdisc sfq 3: parent 1:2 limit 127p quantum 1514b depth 127 divisor 1024 perturb 10sec
qdisc sfq 4: parent 1:3 limit 127p quantum 1514b depth 127 divisor 1024 perturb 10sec
";

const LIVE_CLASSES: &str = "\
class htb 1:1 root rate 1024Kbit ceil 1024Kbit burst 1599b cburst 1599b
class htb 1:2 parent 1:1 leaf 3: prio 1 rate 128Kbit ceil 128Kbit burst 1600b cburst 1600b
class htb 1:3 parent 1:1 leaf 4: prio 3 rate 128Kbit ceil 1024Kbit burst 1600b cburst 1599b
class htb 1:d parent 1:1 leaf 2: prio 2 rate 768Kbit ceil 1024Kbit burst 1599b cburst 1599b
";

const LIVE_FILTERS: &str = "\
filter parent 1: protocol ip pref 1 u32 chain 0
filter parent 1: protocol ip pref 1 u32 chain 0 fh 800: ht divisor 1
filter parent 1: protocol ip pref 1 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1:2 not_in_hw
  match 00100000/00ff0000 at 0
filter parent 1: protocol ip pref 2 u32 chain 0
filter parent 1: protocol ip pref 2 u32 chain 0 fh 801: ht divisor 1
filter parent 1: protocol ip pref 2 u32 chain 0 fh 801::800 order 2048 key ht 801 bkt 0 flowid 1:3 not_in_hw
  match 00080000/00ff0000 at 0
";

#[test]
fn test_kernel_readback_reconciles_to_empty_plan() {
    let desired = compile_interface("eth1");
    let live = parse_live_state(LIVE_QDISCS, LIVE_CLASSES, LIVE_FILTERS).unwrap();
    let plan = reconcile(&desired, &live);
    assert!(
        plan.is_empty(),
        "expected convergence, got deletions {:?} creations {:?}",
        plan.deletions,
        plan.creations
    );
}

#[test]
fn test_changed_rate_touches_only_the_class() {
    let desired = compile_interface("eth1");
    let mut live = parse_live_state(LIVE_QDISCS, LIVE_CLASSES, LIVE_FILTERS).unwrap();
    // pretend someone lowered the default class rate by hand
    for op in &mut live {
        if op.to_string().starts_with("addClass 1:d") {
            *op = {
                let mut changed = op.clone();
                if let shapingmgrd::Payload::Class { rate, .. } = &mut changed.payload {
                    *rate = "512kbit".parse().unwrap();
                }
                changed
            };
        }
    }
    let plan = reconcile(&desired, &live);
    assert!(!plan.is_empty());
    // the class and its leaf qdisc rebuild; unrelated filters survive
    assert!(plan
        .deletions
        .iter()
        .all(|op| !op.to_string().contains("match ip tos")));
}

#[test]
fn test_unknown_default_class_fails_validation() {
    let spec: serde_yaml::Value = serde_yaml::from_str(
        "- type: htb\n- default: 99\n- classes:\n    - options: rate 1024kbit\n",
    )
    .unwrap();
    let mut hierarchy = Hierarchy::build("eth1", &spec).unwrap();
    allocate(&mut hierarchy).unwrap();
    let err = validate(&hierarchy).unwrap_err();
    let ShapingError::Validation(violations) = err else {
        panic!("expected a validation error");
    };
    assert_eq!(violations.len(), 1);
    assert!(violations[0].to_string().contains("99"));
}

#[tokio::test]
async fn test_apply_failure_accounts_for_every_operation() {
    let desired = compile_interface("eth1");
    let plan = reconcile(&desired, &[]);
    let mut executor = RecordingExecutor::failing_at(4);
    let cancel = CancellationToken::new();
    let err = apply_plan(&mut executor, "eth1", &plan, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err.cause, ApplyHalt::Failed(_)));
    assert_eq!(err.applied.len(), 4);
    assert_eq!(err.applied.len() + err.not_attempted.len(), plan.len());
    // a later run starting from what actually got applied reconverges
    let plan = reconcile(&desired, &err.applied);
    assert_eq!(plan.deletions.len(), 0);
    assert_eq!(plan.creations.len(), err.not_attempted.len());
}

#[tokio::test]
async fn test_manager_converges_and_stays_converged() {
    let file = write_document();
    let document = load_document(file.path()).unwrap();
    let (_, spec) = document.iter().find(|(name, _)| name == "eth1").unwrap();
    let cancel = CancellationToken::new();

    let mut mgr = ShapingMgr::new(RecordingExecutor::new());
    mgr.converge("eth1", spec, &[], &cancel).await.unwrap();
    let live = mgr.into_executor().ops();
    assert_eq!(live.len(), 10);

    let mut mgr = ShapingMgr::new(RecordingExecutor::new());
    mgr.converge("eth1", spec, &live, &cancel).await.unwrap();
    assert!(mgr.into_executor().applied.is_empty());
}
