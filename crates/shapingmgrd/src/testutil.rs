//! Shared unit-test helpers.

use serde_yaml::Value;

use crate::hierarchy::Hierarchy;

/// Parses inline YAML.
pub(crate) fn yaml(text: &str) -> Value {
    serde_yaml::from_str(text).unwrap()
}

/// The HTB example from the shaping documentation: root htb with
/// `default: 13`, one root class, three subclasses (one with an explicit
/// id, two with filters), sfq leaves everywhere.
pub(crate) fn htb_example() -> Value {
    yaml(
        r#"
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
"#,
    )
}

/// Builds the HTB example hierarchy for `eth1`.
pub(crate) fn htb_hierarchy() -> Hierarchy {
    Hierarchy::build("eth1", &htb_example()).unwrap()
}
