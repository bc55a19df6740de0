//! Remap policy
//!
//! A pure, stateless substitution over decoded events: rules match on
//! (type, code) and replace the code, never the type or value. Everything
//! that misses the rule table passes through untouched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::device::event::{RawEvent, EV_KEY};

/// One declarative substitution, applied only within its event category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemapRule {
    /// Event category the rule matches (defaults to EV_KEY)
    #[serde(rename = "type", default = "default_rule_type")]
    pub type_: u16,
    /// Code to match
    pub source: u16,
    /// Replacement code
    pub target: u16,
}

fn default_rule_type() -> u16 {
    EV_KEY
}

impl RemapRule {
    pub fn key(source: u16, target: u16) -> Self {
        Self {
            type_: EV_KEY,
            source,
            target,
        }
    }
}

/// The active rule set, keyed by (type, code). Later rules for the same
/// key override earlier ones.
#[derive(Debug, Clone)]
pub struct RemapPolicy {
    rules: HashMap<(u16, u16), u16>,
}

impl RemapPolicy {
    pub fn new(rules: &[RemapRule]) -> Self {
        let rules = rules
            .iter()
            .map(|r| ((r.type_, r.source), r.target))
            .collect();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply the policy to one event. Applied exactly once per event; a
    /// rule's target being another rule's source does not chain.
    pub fn apply(&self, event: RawEvent) -> RawEvent {
        match self.rules.get(&(event.type_, event.code)) {
            Some(&target) => RawEvent {
                code: target,
                ..event
            },
            None => event,
        }
    }
}
