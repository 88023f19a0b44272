//! Next-hop routing rules
//!
//! Phone-number rules match on the user part prefix, domain rules match on
//! the host (exactly or as a sub-domain). A `*` pattern matches everything.
//! Within one list the first matching rule wins.

use serde::{Deserialize, Serialize};

use crate::domain::shared::SipUri;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub pattern: String,
    pub next_hop: String,
}

impl RoutingRule {
    pub fn new(pattern: impl Into<String>, next_hop: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            next_hop: next_hop.into(),
        }
    }

    fn matches_prefix(&self, user: &str) -> bool {
        self.pattern == WILDCARD || user.starts_with(&self.pattern)
    }

    fn matches_domain(&self, host: &str) -> bool {
        if self.pattern == WILDCARD {
            return true;
        }
        let pattern = self.pattern.to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        host == pattern || host.ends_with(&format!(".{}", pattern))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingRules(pub Vec<RoutingRule>);

impl RoutingRules {
    pub fn by_prefix(&self, user: &str) -> Option<&RoutingRule> {
        self.0.iter().find(|r| r.matches_prefix(user))
    }

    pub fn by_domain(&self, host: &str) -> Option<&RoutingRule> {
        self.0.iter().find(|r| r.matches_domain(host))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The four rule lists consulted when forwarding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingTable {
    pub authenticated_phone_prefix: RoutingRules,
    pub phone_prefix: RoutingRules,
    pub authenticated_domain: RoutingRules,
    pub domain: RoutingRules,
}

impl RoutingTable {
    /// Next hop for a target URI, or None when no rule applies.
    ///
    /// Authenticated lists are consulted first, and only for authenticated
    /// requests. Prefix lists only apply to phone-number user parts.
    pub fn next_hop(&self, uri: &SipUri, authenticated: bool) -> Option<&str> {
        let phone = if uri.is_phone_number() { uri.user() } else { None };

        let mut candidates: Vec<Option<&RoutingRule>> = Vec::with_capacity(4);
        if authenticated {
            candidates.push(phone.and_then(|u| self.authenticated_phone_prefix.by_prefix(u)));
            candidates.push(self.authenticated_domain.by_domain(uri.host()));
        }
        candidates.push(phone.and_then(|u| self.phone_prefix.by_prefix(u)));
        candidates.push(self.domain.by_domain(uri.host()));

        candidates
            .into_iter()
            .flatten()
            .next()
            .map(|rule| rule.next_hop.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        RoutingTable {
            authenticated_phone_prefix: RoutingRules(vec![RoutingRule::new("00", "sip:intl-gw.example.com")]),
            phone_prefix: RoutingRules(vec![
                RoutingRule::new("+39", "sip:it-gw.example.com"),
                RoutingRule::new("*", "sip:default-gw.example.com"),
            ]),
            authenticated_domain: RoutingRules::default(),
            domain: RoutingRules(vec![RoutingRule::new("partner.org", "sip:edge.partner.org:5070")]),
        }
    }

    #[test]
    fn test_prefix_first_match_wins() {
        let uri = SipUri::parse("sip:+390612345@example.com").unwrap();
        assert_eq!(table().next_hop(&uri, false), Some("sip:it-gw.example.com"));

        let uri = SipUri::parse("sip:+15551234@example.com").unwrap();
        assert_eq!(table().next_hop(&uri, false), Some("sip:default-gw.example.com"));
    }

    #[test]
    fn test_authenticated_rules_only_when_authenticated() {
        let uri = SipUri::parse("sip:0044123@example.com").unwrap();
        assert_eq!(table().next_hop(&uri, true), Some("sip:intl-gw.example.com"));
        assert_eq!(table().next_hop(&uri, false), Some("sip:default-gw.example.com"));
    }

    #[test]
    fn test_domain_rule_matches_subdomains() {
        let uri = SipUri::parse("sip:bob@voice.partner.org").unwrap();
        assert_eq!(table().next_hop(&uri, false), Some("sip:edge.partner.org:5070"));

        let uri = SipUri::parse("sip:bob@notpartner.org").unwrap();
        assert_eq!(table().next_hop(&uri, false), None);
    }
}
