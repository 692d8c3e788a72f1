//! Security groups - network-level admission control
//!
//! An ordered rule list with a default action. Evaluation scans rules in
//! insertion order and the first match wins; admin mutation swaps an
//! immutable snapshot so the accept path never waits behind a writer.

use crate::{Error, Result};
use ipnet::IpNet;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;

/// Transport protocol a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl TryFrom<&str> for Protocol {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(Error::invalid_argument(format!("unknown protocol {}", s))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Deny,
}

impl TryFrom<&str> for RuleAction {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(RuleAction::Allow),
            "deny" => Ok(RuleAction::Deny),
            _ => Err(Error::invalid_argument(format!("unknown rule action {}", s))),
        }
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Deny => write!(f, "deny"),
        }
    }
}

/// One admission rule. The port range is half-open: [min, max).
#[derive(Debug, Clone)]
pub struct SecurityGroupRule {
    pub name: String,
    pub client_network: IpNet,
    pub protocol: Protocol,
    pub port_min: u16,
    pub port_max: u32,
    pub action: RuleAction,
}

impl SecurityGroupRule {
    pub fn new(
        name: &str,
        client_network: IpNet,
        protocol: Protocol,
        port_min: u16,
        port_max: u32,
        action: RuleAction,
    ) -> Result<Self> {
        if port_max > 65536 || (port_min as u32) >= port_max {
            return Err(Error::invalid_argument(format!(
                "bad port range [{}, {})",
                port_min, port_max
            )));
        }
        Ok(SecurityGroupRule {
            name: name.to_string(),
            client_network,
            protocol,
            port_min,
            port_max,
            action,
        })
    }

    fn matches(&self, addr: IpAddr, protocol: Protocol, port: u16) -> bool {
        self.protocol == protocol
            && self.port_min <= port
            && (port as u32) < self.port_max
            && self.client_network.contains(&addr)
    }
}

/// Ordered CIDR rule list with a default action.
pub struct SecurityGroup {
    name: String,
    default_action: RwLock<RuleAction>,
    rules: RwLock<Arc<Vec<SecurityGroupRule>>>,
}

impl SecurityGroup {
    pub fn new(name: &str, default_action: RuleAction) -> Arc<Self> {
        Arc::new(SecurityGroup {
            name: name.to_string(),
            default_action: RwLock::new(default_action),
            rules: RwLock::new(Arc::new(Vec::new())),
        })
    }

    /// The built-in group every listener falls back to.
    pub fn allow_all() -> Arc<Self> {
        Self::new("(allow-all)", RuleAction::Allow)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_action(&self) -> RuleAction {
        *self.default_action.read()
    }

    pub fn set_default_action(&self, action: RuleAction) {
        *self.default_action.write() = action;
    }

    /// First matching rule in insertion order decides; otherwise the default.
    pub fn check(&self, addr: IpAddr, protocol: Protocol, port: u16) -> RuleAction {
        let rules = self.rules.read().clone();
        for rule in rules.iter() {
            if rule.matches(addr, protocol, port) {
                return rule.action;
            }
        }
        self.default_action()
    }

    /// Append a rule. Fails AlreadyExists without mutating the list.
    pub fn add_rule(&self, rule: SecurityGroupRule) -> Result<()> {
        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.name == rule.name) {
            return Err(Error::already_exists(format!(
                "security-group-rule {}",
                rule.name
            )));
        }
        let mut next = rules.as_ref().clone();
        next.push(rule);
        *rules = Arc::new(next);
        Ok(())
    }

    pub fn remove_rule(&self, name: &str) -> Result<()> {
        let mut rules = self.rules.write();
        let idx = rules
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::not_found(format!("security-group-rule {}", name)))?;
        let mut next = rules.as_ref().clone();
        next.remove(idx);
        *rules = Arc::new(next);
        Ok(())
    }

    pub fn get_rule(&self, name: &str) -> Result<SecurityGroupRule> {
        self.rules
            .read()
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("security-group-rule {}", name)))
    }

    /// Rules in insertion order.
    pub fn rules(&self) -> Arc<Vec<SecurityGroupRule>> {
        self.rules.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(
        name: &str,
        network: &str,
        port_min: u16,
        port_max: u32,
        action: RuleAction,
    ) -> SecurityGroupRule {
        SecurityGroupRule::new(
            name,
            network.parse().unwrap(),
            Protocol::Tcp,
            port_min,
            port_max,
            action,
        )
        .unwrap()
    }

    #[test]
    fn test_default_deny_with_allow_rule() {
        let group = SecurityGroup::new("secg0", RuleAction::Deny);
        group
            .add_rule(rule("r0", "10.0.0.0/8", 1, 65536, RuleAction::Allow))
            .unwrap();

        let allowed = group.check("10.1.2.3".parse().unwrap(), Protocol::Tcp, 80);
        assert_eq!(allowed, RuleAction::Allow);

        let denied = group.check("192.168.1.1".parse().unwrap(), Protocol::Tcp, 80);
        assert_eq!(denied, RuleAction::Deny);
    }

    #[test]
    fn test_first_match_wins_in_insertion_order() {
        let group = SecurityGroup::new("secg0", RuleAction::Allow);
        group
            .add_rule(rule("deny-net", "10.0.0.0/8", 0, 65536, RuleAction::Deny))
            .unwrap();
        group
            .add_rule(rule("allow-host", "10.1.2.3/32", 0, 65536, RuleAction::Allow))
            .unwrap();

        // Both rules match 10.1.2.3, the earlier one decides.
        let action = group.check("10.1.2.3".parse().unwrap(), Protocol::Tcp, 443);
        assert_eq!(action, RuleAction::Deny);
    }

    #[test]
    fn test_port_range_is_half_open() {
        let group = SecurityGroup::new("secg0", RuleAction::Deny);
        group
            .add_rule(rule("r0", "0.0.0.0/0", 8000, 8100, RuleAction::Allow))
            .unwrap();

        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(group.check(addr, Protocol::Tcp, 8000), RuleAction::Allow);
        assert_eq!(group.check(addr, Protocol::Tcp, 8099), RuleAction::Allow);
        assert_eq!(group.check(addr, Protocol::Tcp, 8100), RuleAction::Deny);
    }

    #[test]
    fn test_protocol_must_match() {
        let group = SecurityGroup::new("secg0", RuleAction::Deny);
        group
            .add_rule(rule("r0", "0.0.0.0/0", 0, 65536, RuleAction::Allow))
            .unwrap();
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(group.check(addr, Protocol::Udp, 53), RuleAction::Deny);
    }

    #[test]
    fn test_v4_rule_never_matches_v6_client() {
        let group = SecurityGroup::new("secg0", RuleAction::Deny);
        group
            .add_rule(rule("r0", "0.0.0.0/0", 0, 65536, RuleAction::Allow))
            .unwrap();
        assert_eq!(
            group.check("::1".parse().unwrap(), Protocol::Tcp, 80),
            RuleAction::Deny
        );

        let v6 = SecurityGroup::new("secg6", RuleAction::Deny);
        v6.add_rule(
            SecurityGroupRule::new(
                "r0",
                "fd00::/8".parse().unwrap(),
                Protocol::Tcp,
                0,
                65536,
                RuleAction::Allow,
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(
            v6.check("fd00::1".parse().unwrap(), Protocol::Tcp, 80),
            RuleAction::Allow
        );
    }

    #[test]
    fn test_duplicate_rule_name_fails_without_mutation() {
        let group = SecurityGroup::new("secg0", RuleAction::Deny);
        group
            .add_rule(rule("r0", "10.0.0.0/8", 0, 65536, RuleAction::Allow))
            .unwrap();
        let err = group
            .add_rule(rule("r0", "192.168.0.0/16", 0, 65536, RuleAction::Deny))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(group.rules().len(), 1);
    }

    #[test]
    fn test_remove_missing_rule_is_not_found() {
        let group = SecurityGroup::new("secg0", RuleAction::Deny);
        assert!(group.remove_rule("r9").unwrap_err().is_not_found());
    }

    #[test]
    fn test_bad_port_range_rejected() {
        let err = SecurityGroupRule::new(
            "r0",
            "10.0.0.0/8".parse().unwrap(),
            Protocol::Tcp,
            100,
            100,
            RuleAction::Allow,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert!(SecurityGroupRule::new(
            "r1",
            "10.0.0.0/8".parse().unwrap(),
            Protocol::Tcp,
            0,
            70000,
            RuleAction::Allow,
        )
        .is_err());
    }
}
