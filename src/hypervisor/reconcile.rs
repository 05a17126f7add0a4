//! Port forwarding reconciliation
//!
//! Computes the ordered add/remove delta that moves a backend's active
//! forwarding rules to the desired set.

use std::fmt;

use crate::models::{PortForwardRule, PortForwardSet};

/// One step of a reconciliation plan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardOp {
    Remove(PortForwardRule),
    Add(PortForwardRule),
}

impl ForwardOp {
    pub fn rule(&self) -> &PortForwardRule {
        match self {
            ForwardOp::Remove(rule) | ForwardOp::Add(rule) => rule,
        }
    }
}

impl fmt::Display for ForwardOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardOp::Remove(rule) => write!(f, "remove {rule}"),
            ForwardOp::Add(rule) => write!(f, "add {rule}"),
        }
    }
}

/// Plan the transition from `current` to `desired`
///
/// All removals come first, in `current` order, followed by all additions in
/// `desired` order, so an added rule can take over a host port freed by a
/// removed one. Rules are compared by host port; a rule bound to the right
/// host port with a different guest port or protocol is removed and re-added.
pub fn plan(current: &PortForwardSet, desired: &PortForwardSet) -> Vec<ForwardOp> {
    let removals = current
        .iter()
        .filter(|rule| !desired.contains(rule))
        .map(|rule| ForwardOp::Remove(*rule));

    let additions = desired
        .iter()
        .filter(|rule| !current.contains(rule))
        .map(|rule| ForwardOp::Add(*rule));

    removals.chain(additions).collect()
}

/// Replay a plan onto a rule set
pub fn apply(current: &PortForwardSet, ops: &[ForwardOp]) -> PortForwardSet {
    let mut result = current.clone();
    for op in ops {
        match op {
            ForwardOp::Remove(rule) => {
                if result.contains(rule) {
                    result.remove(rule.host_port);
                }
            }
            ForwardOp::Add(rule) => {
                result.insert(*rule);
            }
        }
    }
    result
}
