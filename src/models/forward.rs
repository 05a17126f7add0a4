//! Port forwarding models
//!
//! Host-to-guest forwarding rules and the ordered rule set used by every
//! hypervisor backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Transport protocol of a forwarding rule
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Protocol> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single host port forwarded into the guest
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub host_port: u16,
    pub guest_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortForwardRule {
    /// Create a TCP rule
    pub fn tcp(host_port: u16, guest_port: u16) -> Self {
        Self {
            host_port,
            guest_port,
            protocol: Protocol::Tcp,
        }
    }

    /// Create a UDP rule
    pub fn udp(host_port: u16, guest_port: u16) -> Self {
        Self {
            host_port,
            guest_port,
            protocol: Protocol::Udp,
        }
    }

    /// Stable rule name used by backends that address rules by name
    pub fn rule_name(&self) -> String {
        format!("{}_{}_{}", self.protocol, self.host_port, self.guest_port)
    }
}

impl fmt::Display for PortForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.protocol, self.host_port, self.guest_port)
    }
}

/// Set of forwarding rules, unique by host port, in insertion order
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortForwardSet {
    rules: Vec<PortForwardRule>,
}

impl PortForwardSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule, replacing any rule already bound to the same host port
    ///
    /// Returns the replaced rule, if any. A replacement keeps the original
    /// position in the set.
    pub fn insert(&mut self, rule: PortForwardRule) -> Option<PortForwardRule> {
        match self.rules.iter_mut().find(|r| r.host_port == rule.host_port) {
            Some(existing) => Some(std::mem::replace(existing, rule)),
            None => {
                self.rules.push(rule);
                None
            }
        }
    }

    /// Remove the rule bound to a host port
    pub fn remove(&mut self, host_port: u16) -> Option<PortForwardRule> {
        let idx = self.rules.iter().position(|r| r.host_port == host_port)?;
        Some(self.rules.remove(idx))
    }

    pub fn get(&self, host_port: u16) -> Option<&PortForwardRule> {
        self.rules.iter().find(|r| r.host_port == host_port)
    }

    /// Whether the exact rule (host port, guest port and protocol) is present
    pub fn contains(&self, rule: &PortForwardRule) -> bool {
        self.get(rule.host_port) == Some(rule)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortForwardRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Equality ignoring order
    pub fn same_rules(&self, other: &PortForwardSet) -> bool {
        self.len() == other.len() && self.iter().all(|r| other.contains(r))
    }

    /// Build a TCP rule set from a `host port -> guest port` map
    ///
    /// Keys or values that are not valid ports are skipped and returned as
    /// the second element so the caller can report them.
    pub fn from_port_map(map: &BTreeMap<String, String>) -> (Self, Vec<String>) {
        let mut set = Self::new();
        let mut invalid = Vec::new();
        for (host, guest) in map {
            match (host.trim().parse::<u16>(), guest.trim().parse::<u16>()) {
                (Ok(h), Ok(g)) => {
                    set.insert(PortForwardRule::tcp(h, g));
                }
                _ => invalid.push(format!("{host}:{guest}")),
            }
        }
        (set, invalid)
    }
}

impl FromIterator<PortForwardRule> for PortForwardSet {
    fn from_iter<I: IntoIterator<Item = PortForwardRule>>(iter: I) -> Self {
        let mut set = Self::new();
        for rule in iter {
            set.insert(rule);
        }
        set
    }
}

impl<'a> IntoIterator for &'a PortForwardSet {
    type Item = &'a PortForwardRule;
    type IntoIter = std::slice::Iter<'a, PortForwardRule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_replaces_same_host_port() {
        let mut set = PortForwardSet::new();
        set.insert(PortForwardRule::tcp(2222, 22));
        set.insert(PortForwardRule::tcp(5000, 5000));
        let old = set.insert(PortForwardRule::tcp(2222, 80));

        assert_eq!(old, Some(PortForwardRule::tcp(2222, 22)));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().next(), Some(&PortForwardRule::tcp(2222, 80)));
    }

    #[test]
    fn test_contains_is_exact() {
        let set: PortForwardSet = [PortForwardRule::tcp(2222, 22)].into_iter().collect();
        assert!(set.contains(&PortForwardRule::tcp(2222, 22)));
        assert!(!set.contains(&PortForwardRule::udp(2222, 22)));
        assert!(!set.contains(&PortForwardRule::tcp(2222, 23)));
    }

    #[test]
    fn test_from_port_map() {
        let mut map = BTreeMap::new();
        map.insert("2222".to_string(), "22".to_string());
        map.insert("bogus".to_string(), "80".to_string());

        let (set, invalid) = PortForwardSet::from_port_map(&map);
        assert_eq!(set.len(), 1);
        assert_eq!(invalid, vec!["bogus:80".to_string()]);
    }

    #[test]
    fn test_rule_name() {
        assert_eq!(PortForwardRule::tcp(2222, 22).rule_name(), "tcp_2222_22");
        assert_eq!(PortForwardRule::udp(53, 53).to_string(), "udp:53->53");
    }
}
