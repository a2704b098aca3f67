//! Trigger conditions (`on:`)
//!
//! Accepts the three GitHub Actions forms:
//!
//! ```yaml
//! on: push
//! on: [push, pull_request]
//! on:
//!   push:
//!     branches: [main, "release/**"]
//!     branches-ignore: ["wip/*"]
//!   workflow_dispatch:
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use super::context::TriggerEvent;

/// Branch filter for one event type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchFilter {
    /// Glob patterns the branch must match (any)
    #[serde(default)]
    pub branches: Vec<String>,

    /// Glob patterns that exclude a branch
    #[serde(default, alias = "branches-ignore")]
    pub branches_ignore: Vec<String>,
}

impl BranchFilter {
    fn patterns(&self) -> impl Iterator<Item = &String> {
        self.branches.iter().chain(self.branches_ignore.iter())
    }

    fn matches(&self, event: &TriggerEvent) -> bool {
        if self.branches.is_empty() && self.branches_ignore.is_empty() {
            return true;
        }

        // Branch filters never match tag pushes
        let Some(branch) = event.branch() else {
            return false;
        };

        if !self.branches.is_empty() && !self.branches.iter().any(|p| glob_match(p, branch)) {
            return false;
        }

        !self.branches_ignore.iter().any(|p| glob_match(p, branch))
    }
}

fn glob_match(pattern: &str, branch: &str) -> bool {
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    glob::Pattern::new(pattern)
        .map(|p| p.matches_with(branch, options))
        .unwrap_or(false)
}

/// The set of events a pipeline reacts to
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Triggers {
    events: BTreeMap<String, BranchFilter>,
}

impl Triggers {
    /// Build triggers from `(event, filter)` pairs
    pub fn new(events: impl IntoIterator<Item = (String, BranchFilter)>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    /// True when no `on:` section was given
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Event names this pipeline listens to
    pub fn event_names(&self) -> Vec<&str> {
        self.events.keys().map(|s| s.as_str()).collect()
    }

    /// Check every branch pattern compiles
    pub fn validate(&self) -> Result<(), (String, glob::PatternError)> {
        for filter in self.events.values() {
            for pattern in filter.patterns() {
                glob::Pattern::new(pattern).map_err(|e| (pattern.clone(), e))?;
            }
        }
        Ok(())
    }

    /// Decide whether an incoming event starts this pipeline
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        if self.events.is_empty() {
            return true;
        }

        match self.events.get(&event.event_name) {
            Some(filter) => filter.matches(event),
            None => false,
        }
    }
}

impl<'de> Deserialize<'de> for Triggers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum TriggersHelper {
            Single(String),
            List(Vec<String>),
            Map(BTreeMap<String, Option<BranchFilter>>),
        }

        let events = match TriggersHelper::deserialize(deserializer)? {
            TriggersHelper::Single(event) => [(event, BranchFilter::default())].into(),
            TriggersHelper::List(events) => events
                .into_iter()
                .map(|e| (e, BranchFilter::default()))
                .collect(),
            TriggersHelper::Map(map) => map
                .into_iter()
                .map(|(e, filter)| (e, filter.unwrap_or_default()))
                .collect(),
        };

        Ok(Triggers { events })
    }
}
