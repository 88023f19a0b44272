//! Routing context - static next-hop rules

pub mod rule;

pub use rule::{RoutingRule, RoutingRules, RoutingTable};
