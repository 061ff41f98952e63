//! Device-selection rules: an ordered list of regex patterns deciding which
//! input devices get grabbed (and with which keymap) and which are ignored.

use std::sync::Arc;

use regex::Regex;

use crate::key_action::KeymapTree;

/// What a matching rule does with the device.
#[derive(Debug, Clone)]
pub enum GrabAction {
    /// Take the device exclusively and attach a resolver using this tree.
    Grab(Arc<KeymapTree>),
    /// Leave the device alone.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct GrabRule {
    pattern: String,
    regex: Regex,
    action: GrabAction,
}

impl GrabRule {
    #[must_use]
    pub fn new(pattern: String, regex: Regex, action: GrabAction) -> Self {
        Self { pattern, regex, action }
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Outcome of evaluating a device name against the rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabVerdict {
    /// Grabbed by the rule at this index.
    Grab(usize),
    /// Explicitly ignored by the rule at this index.
    Ignore(usize),
    /// No rule matched; the device is left alone.
    NoMatch,
}

/// Ordered rule list. Matching is pure: the first rule whose pattern
/// matches the device name decides.
#[derive(Debug, Clone, Default)]
pub struct GrabSet {
    rules: Vec<GrabRule>,
}

impl GrabSet {
    #[must_use]
    pub fn new(rules: Vec<GrabRule>) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn rules(&self) -> &[GrabRule] {
        &self.rules
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    #[must_use]
    pub fn verdict(&self, name: &str) -> GrabVerdict {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.regex.is_match(name) {
                return match rule.action {
                    GrabAction::Grab(_) => GrabVerdict::Grab(index),
                    GrabAction::Ignore => GrabVerdict::Ignore(index),
                };
            }
        }
        GrabVerdict::NoMatch
    }

    /// Rule index to grab this device under, if any.
    #[must_use]
    pub fn match_device(&self, name: &str) -> Option<usize> {
        match self.verdict(name) {
            GrabVerdict::Grab(index) => Some(index),
            GrabVerdict::Ignore(_) | GrabVerdict::NoMatch => None,
        }
    }

    /// The keymap tree attached to a grab rule; `None` for ignore rules.
    #[must_use]
    pub fn tree(&self, rule: usize) -> Option<Arc<KeymapTree>> {
        match &self.rules.get(rule)?.action {
            GrabAction::Grab(tree) => Some(Arc::clone(tree)),
            GrabAction::Ignore => None,
        }
    }
}
