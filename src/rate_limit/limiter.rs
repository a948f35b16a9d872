//! The quota limiter: matches requests against the rule table and keeps counters.
//!
//! Semantics:
//! - A request is matched against every rule whose method set and URL pattern accept it and
//!   whose limitation classes intersect the caller's classes.
//! - Every live counter of a matched rule, on the global subject or on the caller's own
//!   subject, applies when its dependency values equal the request's. The class that opened
//!   the counter does not matter.
//! - Each class the caller falls under that has no counter yet becomes a new bucket: classes
//!   shared with everybody (`All`, `AuthenticatedIP`, `NotAuthenticated`) on the global
//!   subject, the caller's own class (`Authenticated`) on its registered subject.
//! - Rules with dependency keys get one bucket per distinct tuple of dependency values.
//! - A bucket that has never been incremented counts as zero.
//!
//! Invariants:
//! - Expired counters are purged before every read and every write.
//! - A subject never holds two counters for the same `(rule, class, dependency values)`.
//! - `next_available_at` returns `None` whenever the request is allowed.

use crate::clock::{Clock, SystemClock};
use crate::rate_limit::rule::{ClassSet, LimitationClass, QuotaRuleTable};
use crate::rate_limit::pattern::RequestTarget;
use crate::rate_limit::store::{
    anonymous_global_classes, CounterStore, QuotaCounter, SubjectCategory, SubjectId,
};
use crate::rate_limit::Decision;
use http::Method;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One bucket a request falls into.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Bucket {
    owner: Option<SubjectId>,
    rule_index: usize,
    class: LimitationClass,
    dependency_values: Vec<Option<String>>,
}

/// Client-side quota coordinator. Clones share the same counters.
#[derive(Debug, Clone)]
pub struct QuotaLimiter {
    rules: Arc<QuotaRuleTable>,
    store: Arc<Mutex<CounterStore>>,
    clock: Arc<dyn Clock>,
}

impl QuotaLimiter {
    /// Limiter over `rules`, timed by the system clock.
    pub fn new(rules: QuotaRuleTable) -> Self {
        Self::builder().rules(rules).build()
    }

    pub fn builder() -> QuotaLimiterBuilder {
        QuotaLimiterBuilder::new()
    }

    pub fn rules(&self) -> &QuotaRuleTable {
        &self.rules
    }

    /// Current time according to the limiter's clock.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    fn lock(&self) -> MutexGuard<'_, CounterStore> {
        // Counter updates never leave the store half-written, so a poisoned lock is safe to reuse.
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subject and return its handle.
    pub fn register_subject(&self, category: SubjectCategory) -> SubjectId {
        let id = self.lock().register(category);
        tracing::info!(subject = %id, ?category, "quota subject registered");
        id
    }

    /// Forget a subject and its counters. Unknown subjects are ignored.
    pub fn deregister_subject(&self, id: SubjectId) {
        if self.lock().deregister(id) {
            tracing::info!(subject = %id, "quota subject deregistered");
        }
    }

    /// Whether a request may be sent now.
    pub fn is_request_allowed(
        &self,
        method: &Method,
        url: &str,
        subject: Option<SubjectId>,
    ) -> bool {
        self.check(method, url, subject).is_allowed()
    }

    /// Earliest instant (epoch millis) at which every exhausted quota matching the request will
    /// have cleared.
    ///
    /// Returns `None` both when nothing is exhausted and when an exhausted rule has a zero
    /// quota; the latter never recovers. Use [`QuotaLimiter::check`] to tell them apart.
    pub fn next_available_at(
        &self,
        method: &Method,
        url: &str,
        subject: Option<SubjectId>,
    ) -> Option<u64> {
        match self.check(method, url, subject) {
            Decision::Allowed => None,
            Decision::Denied { retry_at } => retry_at,
        }
    }

    /// Evaluate a request against every matching bucket under a single lock.
    pub fn check(&self, method: &Method, url: &str, subject: Option<SubjectId>) -> Decision {
        let now = self.clock.now_millis();
        let mut store = self.lock();
        self.purge(&mut store, now);

        let buckets = self.buckets(&store, method, url, subject);
        let mut exhausted = false;
        let mut unrecoverable = false;
        let mut retry_at = now;

        for bucket in &buckets {
            let Some(rule) = self.rules.get(bucket.rule_index) else { continue };
            let count = store.count(
                bucket.owner,
                bucket.rule_index,
                bucket.class,
                &bucket.dependency_values,
            );
            if count < rule.max_count() {
                continue;
            }
            exhausted = true;
            if rule.max_count() < 1 {
                unrecoverable = true;
            } else {
                retry_at = retry_at.max(now.saturating_add(rule.window_ms()));
            }
        }

        if !exhausted {
            return Decision::Allowed;
        }
        let retry_at = if unrecoverable { None } else { Some(retry_at) };
        tracing::debug!(%method, url, ?subject, ?retry_at, "request denied by quota");
        Decision::Denied { retry_at }
    }

    /// Record one request against every matching bucket.
    pub fn increment(&self, method: &Method, url: &str, subject: Option<SubjectId>) {
        self.increment_by(method, url, subject, 1);
    }

    /// Record `count` requests against every matching bucket.
    pub fn increment_by(&self, method: &Method, url: &str, subject: Option<SubjectId>, count: u64) {
        let now = self.clock.now_millis();
        let mut store = self.lock();
        self.purge(&mut store, now);

        for bucket in self.buckets(&store, method, url, subject) {
            let created = store.add(
                bucket.owner,
                bucket.rule_index,
                bucket.class,
                &bucket.dependency_values,
                count,
                now,
            );
            if created {
                tracing::debug!(
                    rule = bucket.rule_index,
                    class = %bucket.class,
                    owner = ?bucket.owner,
                    "quota counter opened"
                );
            }
        }
    }

    /// Live counters owned by `subject` (`None` for the global buckets).
    pub fn counters(&self, subject: Option<SubjectId>) -> Vec<QuotaCounter> {
        let now = self.clock.now_millis();
        let mut store = self.lock();
        self.purge(&mut store, now);
        store.counters(subject)
    }

    fn purge(&self, store: &mut CounterStore, now: u64) {
        let dropped = store.purge_expired(&self.rules, now);
        if dropped > 0 {
            tracing::debug!(dropped, "expired quota counters purged");
        }
    }

    /// Classes the caller consumes: (individual, global).
    fn classes(&self, store: &CounterStore, subject: Option<SubjectId>) -> (ClassSet, ClassSet) {
        match subject {
            None => (ClassSet::EMPTY, anonymous_global_classes()),
            Some(id) => match store.category(id) {
                Some(category) => {
                    (ClassSet::EMPTY.with(category.individual_class()), category.global_classes())
                }
                None => {
                    tracing::warn!(subject = %id, "unknown quota subject; treating as anonymous");
                    (ClassSet::EMPTY, anonymous_global_classes())
                }
            },
        }
    }

    fn buckets(
        &self,
        store: &CounterStore,
        method: &Method,
        url: &str,
        subject: Option<SubjectId>,
    ) -> Vec<Bucket> {
        let Some(target) = RequestTarget::parse(url) else {
            tracing::warn!(url, "unparseable request url; no quota applies");
            return Vec::new();
        };
        let (individual, global) = self.classes(store, subject);
        let caller = individual.union(global);
        let owner = subject.filter(|_| !individual.is_empty());

        // Rules accepting the request that concern the caller, with this request's values.
        let matched: Vec<(usize, Vec<Option<String>>)> = self
            .rules
            .iter()
            .filter(|(_, rule)| {
                rule.methods().contains(method)
                    && !rule.limitations().intersection(caller).is_empty()
            })
            .filter_map(|(rule_index, rule)| {
                let matched = rule.pattern().match_target(&target)?;
                Some((rule_index, matched.dependency_values(rule.dependencies())))
            })
            .collect();

        // Every live counter of those rules counts, whichever class opened it.
        let mut buckets = Vec::new();
        let mut owners = vec![None];
        owners.extend(owner.map(Some));
        for owner in owners {
            for counter in store.iter(owner) {
                let same_values = matched.iter().any(|(rule_index, values)| {
                    *rule_index == counter.rule_index && *values == counter.dependency_values
                });
                if same_values {
                    buckets.push(Bucket {
                        owner,
                        rule_index: counter.rule_index,
                        class: counter.origin_class,
                        dependency_values: counter.dependency_values.clone(),
                    });
                }
            }
        }

        // Buckets the caller's own classes would open; absent ones count as zero.
        for (rule_index, dependency_values) in matched {
            let Some(rule) = self.rules.get(rule_index) else { continue };
            let own = rule
                .limitations()
                .intersection(global)
                .iter()
                .map(|class| (None, class))
                .chain(rule.limitations().intersection(individual).iter().map(|c| (owner, c)));
            for (bucket_owner, class) in own {
                let represented =
                    buckets.iter().any(|b| b.rule_index == rule_index && b.class == class);
                if !represented {
                    buckets.push(Bucket {
                        owner: bucket_owner,
                        rule_index,
                        class,
                        dependency_values: dependency_values.clone(),
                    });
                }
            }
        }
        buckets
    }
}

/// Builder for [`QuotaLimiter`].
#[derive(Debug)]
pub struct QuotaLimiterBuilder {
    rules: QuotaRuleTable,
    clock: Arc<dyn Clock>,
}

impl Default for QuotaLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaLimiterBuilder {
    /// Empty rule table, system clock.
    pub fn new() -> Self {
        Self { rules: QuotaRuleTable::default(), clock: Arc::new(SystemClock) }
    }

    pub fn rules(mut self, rules: QuotaRuleTable) -> Self {
        self.rules = rules;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> QuotaLimiter {
        QuotaLimiter {
            rules: Arc::new(self.rules),
            store: Arc::new(Mutex::new(CounterStore::new())),
            clock: self.clock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::rule::{MethodSet, QuotaRule};
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn limiter(rules: Vec<QuotaRule>, clock: &ManualClock) -> QuotaLimiter {
        QuotaLimiter::builder().rules(QuotaRuleTable::new(rules)).clock(clock.clone()).build()
    }

    fn items_rule(count: u64, deps: &[&str]) -> QuotaRule {
        QuotaRule::new(
            MethodSet::GET,
            "/items/:id",
            ClassSet::of(&[LimitationClass::All]),
            60_000,
            count,
            deps,
        )
        .unwrap()
    }

    #[test]
    fn allows_until_max_count_then_denies() {
        let clock = ManualClock::new(0);
        let limiter = limiter(vec![items_rule(3, &[])], &clock);

        for _ in 0..2 {
            limiter.increment(&Method::GET, "/items/1", None);
        }
        assert!(limiter.is_request_allowed(&Method::GET, "/items/1", None));
        limiter.increment(&Method::GET, "/items/1", None);
        assert!(!limiter.is_request_allowed(&Method::GET, "/items/1", None));
    }

    #[test]
    fn non_matching_method_is_not_counted() {
        let clock = ManualClock::new(0);
        let limiter = limiter(vec![items_rule(1, &[])], &clock);

        limiter.increment(&Method::POST, "/items/1", None);
        assert!(limiter.is_request_allowed(&Method::GET, "/items/1", None));
        limiter.increment(&Method::GET, "/items/1", None);
        assert!(limiter.is_request_allowed(&Method::POST, "/items/1", None));
        assert!(!limiter.is_request_allowed(&Method::GET, "/items/1", None));
    }

    #[test]
    fn next_available_is_now_plus_window() {
        let clock = ManualClock::new(1_000);
        let limiter = limiter(vec![items_rule(1, &[])], &clock);

        assert_eq!(limiter.next_available_at(&Method::GET, "/items/1", None), None);
        limiter.increment(&Method::GET, "/items/1", None);
        clock.advance(500);
        assert_eq!(limiter.next_available_at(&Method::GET, "/items/1", None), Some(61_500));
    }

    #[test]
    fn increment_by_adds_weight() {
        let clock = ManualClock::new(0);
        let limiter = limiter(vec![items_rule(5, &[])], &clock);

        limiter.increment_by(&Method::GET, "/items/1", None, 4);
        assert!(limiter.is_request_allowed(&Method::GET, "/items/1", None));
        limiter.increment_by(&Method::GET, "/items/1", None, 1);
        assert!(!limiter.is_request_allowed(&Method::GET, "/items/1", None));
    }

    #[test]
    fn unparseable_url_matches_nothing() {
        let clock = ManualClock::new(0);
        let limiter = limiter(vec![items_rule(0, &[])], &clock);
        assert!(limiter.is_request_allowed(&Method::GET, "http://[::1", None));
    }

    #[test]
    fn deregistered_subject_falls_back_to_anonymous() {
        let clock = ManualClock::new(0);
        let rule = QuotaRule::new(
            MethodSet::GET,
            "/items/:id",
            ClassSet::of(&[LimitationClass::Authenticated]),
            60_000,
            1,
            &[],
        )
        .unwrap();
        let limiter = limiter(vec![rule], &clock);
        let id = limiter.register_subject(SubjectCategory::Authenticated);

        limiter.increment(&Method::GET, "/items/1", Some(id));
        assert!(!limiter.is_request_allowed(&Method::GET, "/items/1", Some(id)));

        limiter.deregister_subject(id);
        limiter.deregister_subject(id);
        assert!(limiter.is_request_allowed(&Method::GET, "/items/1", Some(id)));
        limiter.increment(&Method::GET, "/items/1", Some(id));
        assert!(limiter.is_request_allowed(&Method::GET, "/items/1", Some(id)));
    }

    #[test]
    fn unknown_subject_is_logged_and_treated_as_anonymous() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let clock = ManualClock::new(0);
        let limiter = limiter(vec![items_rule(1, &[])], &clock);
        let id = limiter.register_subject(SubjectCategory::Authenticated);
        limiter.deregister_subject(id);

        limiter.increment(&Method::GET, "/items/1", None);
        assert!(!limiter.is_request_allowed(&Method::GET, "/items/1", Some(id)));

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("quota subject deregistered"));
        assert!(logs.contains("unknown quota subject"), "fallback should be logged: {logs}");
    }
}
