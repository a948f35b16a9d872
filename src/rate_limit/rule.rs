//! Quota rules: which requests a limit applies to, for whom, and how much.
//!
//! Rules are immutable once loaded. Method and limitation sets are small bitsets so that
//! matching a request against the whole table stays cheap.

use crate::error::RuleError;
use crate::rate_limit::pattern::UrlPattern;
use http::Method;
use serde::Deserialize;
use std::fmt;

/// Set of HTTP methods a rule constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MethodSet(u8);

impl MethodSet {
    pub const GET: Self = Self(1 << 0);
    pub const POST: Self = Self(1 << 1);
    pub const PUT: Self = Self(1 << 2);
    pub const PATCH: Self = Self(1 << 3);
    pub const DELETE: Self = Self(1 << 4);
    pub const HEAD: Self = Self(1 << 5);
    pub const OPTIONS: Self = Self(1 << 6);
    pub const ALL: Self = Self(0x7f);

    fn bit(method: &Method) -> Option<Self> {
        let bit = match *method {
            Method::GET => Self::GET,
            Method::POST => Self::POST,
            Method::PUT => Self::PUT,
            Method::PATCH => Self::PATCH,
            Method::DELETE => Self::DELETE,
            Method::HEAD => Self::HEAD,
            Method::OPTIONS => Self::OPTIONS,
            _ => return None,
        };
        Some(bit)
    }

    /// Parse an upper- or lower-case method name.
    pub fn parse(name: &str) -> Result<Self, RuleError> {
        let method = Method::from_bytes(name.to_ascii_uppercase().as_bytes())
            .map_err(|_| RuleError::UnknownMethod(name.to_string()))?;
        Self::bit(&method).ok_or_else(|| RuleError::UnknownMethod(name.to_string()))
    }

    pub fn contains(self, method: &Method) -> bool {
        Self::bit(method).map_or(false, |bit| self.0 & bit.0 != 0)
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<MethodSet> for MethodSet {
    fn from_iter<I: IntoIterator<Item = MethodSet>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), Self::union)
    }
}

/// Category of caller a quota is enforced against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitationClass {
    /// Every request, regardless of caller.
    All,
    /// Requests made with any credential, counted for the whole client.
    AuthenticatedIp,
    /// Requests made without a credential.
    NotAuthenticated,
    /// Requests made with one particular credential.
    Authenticated,
}

impl LimitationClass {
    const ORDERED: [LimitationClass; 4] = [
        LimitationClass::All,
        LimitationClass::AuthenticatedIp,
        LimitationClass::NotAuthenticated,
        LimitationClass::Authenticated,
    ];

    fn bit(self) -> u8 {
        match self {
            LimitationClass::All => 1 << 0,
            LimitationClass::AuthenticatedIp => 1 << 1,
            LimitationClass::NotAuthenticated => 1 << 2,
            LimitationClass::Authenticated => 1 << 3,
        }
    }

    pub fn parse(name: &str) -> Result<Self, RuleError> {
        match name {
            "All" => Ok(Self::All),
            "AuthenticatedIP" | "AuthenticatedIp" => Ok(Self::AuthenticatedIp),
            "NotAuthenticated" => Ok(Self::NotAuthenticated),
            "Authenticated" => Ok(Self::Authenticated),
            other => Err(RuleError::UnknownLimitation(other.to_string())),
        }
    }
}

impl fmt::Display for LimitationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::All => "All",
            Self::AuthenticatedIp => "AuthenticatedIP",
            Self::NotAuthenticated => "NotAuthenticated",
            Self::Authenticated => "Authenticated",
        };
        f.write_str(name)
    }
}

/// Set of limitation classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ClassSet(u8);

impl ClassSet {
    pub const EMPTY: Self = Self(0);

    pub fn of(classes: &[LimitationClass]) -> Self {
        classes.iter().copied().collect()
    }

    pub fn with(self, class: LimitationClass) -> Self {
        Self(self.0 | class.bit())
    }

    pub fn contains(self, class: LimitationClass) -> bool {
        self.0 & class.bit() != 0
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Members in a stable order.
    pub fn iter(self) -> impl Iterator<Item = LimitationClass> {
        LimitationClass::ORDERED.into_iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<LimitationClass> for ClassSet {
    fn from_iter<I: IntoIterator<Item = LimitationClass>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

/// A single rate-limit rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRule {
    methods: MethodSet,
    pattern: UrlPattern,
    limitations: ClassSet,
    window_ms: u64,
    max_count: u64,
    dependencies: Vec<String>,
}

impl QuotaRule {
    /// Build a rule. `dependencies` name path placeholders or query parameters whose values
    /// partition the quota into independent buckets.
    pub fn new(
        methods: MethodSet,
        pattern: &str,
        limitations: ClassSet,
        window_ms: u64,
        max_count: u64,
        dependencies: &[&str],
    ) -> Result<Self, RuleError> {
        Ok(Self {
            methods,
            pattern: UrlPattern::parse(pattern)?,
            limitations,
            window_ms,
            max_count,
            dependencies: dependencies.iter().map(|d| (*d).to_string()).collect(),
        })
    }

    pub fn methods(&self) -> MethodSet {
        self.methods
    }

    pub fn pattern(&self) -> &UrlPattern {
        &self.pattern
    }

    pub fn limitations(&self) -> ClassSet {
        self.limitations
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Requests allowed per window.
    pub fn max_count(&self) -> u64 {
        self.max_count
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    methods: Vec<String>,
    pattern: String,
    limitations: Vec<String>,
    duration_ms: u64,
    count: u64,
    #[serde(default)]
    dependencies: Vec<String>,
}

impl RawRule {
    fn into_rule(self, index: usize) -> Result<QuotaRule, RuleError> {
        let methods = self
            .methods
            .iter()
            .map(|m| MethodSet::parse(m))
            .collect::<Result<MethodSet, _>>()?;
        let limitations = self
            .limitations
            .iter()
            .map(|l| LimitationClass::parse(l))
            .collect::<Result<ClassSet, _>>()?;
        if methods.is_empty() || limitations.is_empty() {
            return Err(RuleError::EmptyRule { index });
        }
        if self.duration_ms == 0 {
            return Err(RuleError::ZeroWindow { index });
        }
        Ok(QuotaRule {
            methods,
            pattern: UrlPattern::parse(&self.pattern)?,
            limitations,
            window_ms: self.duration_ms,
            max_count: self.count,
            dependencies: self.dependencies,
        })
    }
}

/// Ordered, immutable list of quota rules. Counters refer to rules by index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaRuleTable {
    rules: Vec<QuotaRule>,
}

const OPEN_CLOUD_RULES: &str = r#"[
  {"methods": ["GET"], "pattern": "/datastores/v1/universes/:universeId/standard-datastores",
   "limitations": ["Authenticated"], "duration_ms": 60000, "count": 300, "dependencies": ["universeId"]},
  {"methods": ["GET"], "pattern": "/datastores/v1/universes/:universeId/standard-datastores/datastore/entries/*",
   "limitations": ["Authenticated"], "duration_ms": 60000, "count": 300, "dependencies": ["universeId"]},
  {"methods": ["POST", "PATCH", "DELETE"], "pattern": "/datastores/v1/universes/:universeId/standard-datastores/datastore/entries/*",
   "limitations": ["Authenticated"], "duration_ms": 60000, "count": 150, "dependencies": ["universeId"]},
  {"methods": ["GET", "POST", "PATCH", "DELETE"], "pattern": "/datastores/v1/*",
   "limitations": ["AuthenticatedIP"], "duration_ms": 60000, "count": 1500},
  {"methods": ["POST"], "pattern": "/messaging-service/v1/universes/:universeId/topics/:topic",
   "limitations": ["Authenticated"], "duration_ms": 60000, "count": 150, "dependencies": ["universeId"]},
  {"methods": ["POST"], "pattern": "/universes/v1/:universeId/places/:placeId/versions",
   "limitations": ["Authenticated"], "duration_ms": 60000, "count": 30, "dependencies": ["universeId", "placeId"]},
  {"methods": ["POST"], "pattern": "/oauth/v1/token",
   "limitations": ["All"], "duration_ms": 60000, "count": 300},
  {"methods": ["GET", "POST"], "pattern": "/oauth/v1/*",
   "limitations": ["NotAuthenticated"], "duration_ms": 60000, "count": 600}
]"#;

impl QuotaRuleTable {
    pub fn new(rules: Vec<QuotaRule>) -> Self {
        Self { rules }
    }

    /// Load a table from its JSON form:
    ///
    /// ```
    /// use cloudpace::QuotaRuleTable;
    ///
    /// let table = QuotaRuleTable::from_json(r#"[
    ///     {"methods": ["GET"], "pattern": "/items/:id", "limitations": ["All"],
    ///      "duration_ms": 60000, "count": 2, "dependencies": ["id"]}
    /// ]"#).unwrap();
    /// assert_eq!(table.len(), 1);
    /// ```
    pub fn from_json(json: &str) -> Result<Self, RuleError> {
        let raw: Vec<RawRule> = serde_json::from_str(json)?;
        let rules = raw
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.into_rule(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Built-in limits for the DataStore, Messaging, Place publishing and OAuth endpoints.
    pub fn open_cloud() -> Self {
        Self::from_json(OPEN_CLOUD_RULES).expect("built-in rule table is valid")
    }

    pub fn get(&self, index: usize) -> Option<&QuotaRule> {
        self.rules.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &QuotaRule)> {
        self.rules.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromIterator<QuotaRule> for QuotaRuleTable {
    fn from_iter<I: IntoIterator<Item = QuotaRule>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_set_membership() {
        let set = MethodSet::GET.union(MethodSet::DELETE);
        assert!(set.contains(&Method::GET));
        assert!(set.contains(&Method::DELETE));
        assert!(!set.contains(&Method::POST));
        assert!(!MethodSet::ALL.contains(&Method::CONNECT));
        assert_eq!(MethodSet::parse("patch"), Ok(MethodSet::PATCH));
        assert!(MethodSet::parse("BREW").is_err());
    }

    #[test]
    fn class_set_iterates_in_order() {
        let set = ClassSet::of(&[LimitationClass::Authenticated, LimitationClass::All]);
        let classes: Vec<_> = set.iter().collect();
        assert_eq!(classes, vec![LimitationClass::All, LimitationClass::Authenticated]);
        let global = ClassSet::of(&[LimitationClass::All, LimitationClass::NotAuthenticated]);
        assert_eq!(set.intersection(global), ClassSet::of(&[LimitationClass::All]));
    }

    #[test]
    fn loads_rules_from_json() {
        let table = QuotaRuleTable::from_json(
            r#"[{"methods": ["GET", "POST"], "pattern": "/items/:id", "limitations": ["All", "AuthenticatedIP"],
                 "duration_ms": 1000, "count": 5, "dependencies": ["id"]}]"#,
        )
        .unwrap();
        let rule = table.get(0).unwrap();
        assert!(rule.methods().contains(&Method::POST));
        assert!(rule.limitations().contains(LimitationClass::AuthenticatedIp));
        assert_eq!(rule.window_ms(), 1000);
        assert_eq!(rule.max_count(), 5);
        assert_eq!(rule.dependencies(), &["id".to_string()]);
    }

    #[test]
    fn rejects_bad_rules() {
        let unknown_class = r#"[{"methods": ["GET"], "pattern": "/x", "limitations": ["Guest"], "duration_ms": 1, "count": 1}]"#;
        assert_eq!(
            QuotaRuleTable::from_json(unknown_class),
            Err(RuleError::UnknownLimitation("Guest".into()))
        );

        let zero_window = r#"[{"methods": ["GET"], "pattern": "/x", "limitations": ["All"], "duration_ms": 0, "count": 1}]"#;
        assert_eq!(QuotaRuleTable::from_json(zero_window), Err(RuleError::ZeroWindow { index: 0 }));

        let no_methods = r#"[{"methods": [], "pattern": "/x", "limitations": ["All"], "duration_ms": 5, "count": 1}]"#;
        assert_eq!(QuotaRuleTable::from_json(no_methods), Err(RuleError::EmptyRule { index: 0 }));

        assert!(matches!(QuotaRuleTable::from_json("{}"), Err(RuleError::Json(_))));
    }

    #[test]
    fn open_cloud_table_loads() {
        let table = QuotaRuleTable::open_cloud();
        assert!(!table.is_empty());
        for (_, rule) in table.iter() {
            for dep in rule.dependencies() {
                assert!(rule.pattern().has_placeholder(dep), "{} lacks :{}", rule.pattern(), dep);
            }
        }
    }
}
