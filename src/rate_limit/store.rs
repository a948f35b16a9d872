//! Quota subjects and their counters.
//!
//! The store keeps one counter list for the global subject (shared by every caller) and one
//! per registered subject. Counters are created on first increment and dropped once their
//! window has elapsed.

use crate::rate_limit::rule::{ClassSet, LimitationClass, QuotaRuleTable};
use std::collections::HashMap;
use std::fmt;

/// Handle for a registered quota subject (typically one credential).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(u64);

impl SubjectId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject#{}", self.0)
    }
}

/// Category a registered subject belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectCategory {
    /// A caller holding its own credential.
    Authenticated,
}

impl SubjectCategory {
    /// Class counted against the subject itself.
    pub fn individual_class(self) -> LimitationClass {
        match self {
            SubjectCategory::Authenticated => LimitationClass::Authenticated,
        }
    }

    /// Classes this category consumes from the global buckets.
    pub fn global_classes(self) -> ClassSet {
        match self {
            SubjectCategory::Authenticated => {
                ClassSet::of(&[LimitationClass::All, LimitationClass::AuthenticatedIp])
            }
        }
    }
}

/// Global classes consumed by a caller without a credential.
pub fn anonymous_global_classes() -> ClassSet {
    ClassSet::of(&[LimitationClass::All, LimitationClass::NotAuthenticated])
}

/// Usage of one rule, for one class, for one dependency tuple, inside one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCounter {
    pub rule_index: usize,
    pub origin_class: LimitationClass,
    pub count: u64,
    pub window_start: u64,
    pub dependency_values: Vec<Option<String>>,
}

impl QuotaCounter {
    fn is_same_bucket(
        &self,
        rule_index: usize,
        origin_class: LimitationClass,
        dependency_values: &[Option<String>],
    ) -> bool {
        self.rule_index == rule_index
            && self.origin_class == origin_class
            && self.dependency_values == dependency_values
    }
}

#[derive(Debug, Default)]
struct SubjectState {
    category: Option<SubjectCategory>,
    counters: Vec<QuotaCounter>,
}

/// Subject registry plus per-subject counter lists. Key `None` is the global subject.
#[derive(Debug)]
pub struct CounterStore {
    next_id: u64,
    subjects: HashMap<Option<SubjectId>, SubjectState>,
}

impl Default for CounterStore {
    fn default() -> Self {
        let mut subjects = HashMap::new();
        subjects.insert(None, SubjectState::default());
        Self { next_id: 1, subjects }
    }
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, category: SubjectCategory) -> SubjectId {
        let id = SubjectId(self.next_id);
        self.next_id += 1;
        self.subjects
            .insert(Some(id), SubjectState { category: Some(category), counters: Vec::new() });
        id
    }

    /// Drop a subject and every counter it owns. Unknown IDs are ignored.
    pub fn deregister(&mut self, id: SubjectId) -> bool {
        self.subjects.remove(&Some(id)).is_some()
    }

    pub fn category(&self, id: SubjectId) -> Option<SubjectCategory> {
        self.subjects.get(&Some(id)).and_then(|s| s.category)
    }

    /// Remove every counter whose window has elapsed at `now`. Returns how many were dropped.
    pub fn purge_expired(&mut self, rules: &QuotaRuleTable, now: u64) -> usize {
        let mut dropped = 0;
        for state in self.subjects.values_mut() {
            let before = state.counters.len();
            state.counters.retain(|c| {
                rules
                    .get(c.rule_index)
                    .map_or(false, |rule| now.saturating_sub(c.window_start) < rule.window_ms())
            });
            dropped += before - state.counters.len();
        }
        dropped
    }

    /// Current count of a bucket, zero when no counter exists.
    pub fn count(
        &self,
        owner: Option<SubjectId>,
        rule_index: usize,
        origin_class: LimitationClass,
        dependency_values: &[Option<String>],
    ) -> u64 {
        self.subjects
            .get(&owner)
            .and_then(|s| {
                s.counters
                    .iter()
                    .find(|c| c.is_same_bucket(rule_index, origin_class, dependency_values))
            })
            .map_or(0, |c| c.count)
    }

    /// Live counters owned by `owner`, in creation order.
    pub fn iter(&self, owner: Option<SubjectId>) -> impl Iterator<Item = &QuotaCounter> {
        self.subjects.get(&owner).into_iter().flat_map(|s| s.counters.iter())
    }

    /// Add `count` to a bucket, creating its counter with `window_start = now` if absent.
    /// Returns `true` when a new counter was created.
    pub fn add(
        &mut self,
        owner: Option<SubjectId>,
        rule_index: usize,
        origin_class: LimitationClass,
        dependency_values: &[Option<String>],
        count: u64,
        now: u64,
    ) -> bool {
        let Some(state) = self.subjects.get_mut(&owner) else {
            return false;
        };
        if let Some(counter) = state
            .counters
            .iter_mut()
            .find(|c| c.is_same_bucket(rule_index, origin_class, dependency_values))
        {
            counter.count = counter.count.saturating_add(count);
            return false;
        }
        state.counters.push(QuotaCounter {
            rule_index,
            origin_class,
            count,
            window_start: now,
            dependency_values: dependency_values.to_vec(),
        });
        true
    }

    /// Snapshot of the counters owned by `owner`.
    pub fn counters(&self, owner: Option<SubjectId>) -> Vec<QuotaCounter> {
        self.subjects.get(&owner).map(|s| s.counters.clone()).unwrap_or_default()
    }
}
