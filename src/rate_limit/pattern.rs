//! Templated URL patterns used to scope quota rules.
//!
//! A pattern is a path such as `/cloud/v2/universes/:universeId/data-stores/*`:
//! - literal segments must match exactly,
//! - `:name` segments match any single segment and capture it,
//! - a final `*` matches any remaining segments (including none).
//!
//! The query string of a request is never part of the match; its parameters are captured so
//! rules can partition quota by them.

use crate::error::RuleError;
use percent_encoding::percent_decode_str;
use std::fmt;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// A parsed, immutable URL pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    source: String,
    segments: Vec<Segment>,
}

impl UrlPattern {
    /// Parse a pattern. A trailing `?*` (explicit query wildcard) is accepted and ignored.
    pub fn parse(pattern: &str) -> Result<Self, RuleError> {
        let invalid = |reason: &str| RuleError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let path = pattern.strip_suffix("?*").unwrap_or(pattern);
        if !path.starts_with('/') {
            return Err(invalid("must start with `/`"));
        }
        if path.contains('?') || path.contains('#') {
            return Err(invalid("query and fragment are not part of a pattern"));
        }

        let raw: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(raw.len());
        for (i, part) in raw.iter().enumerate() {
            let segment = if *part == "*" {
                if i + 1 != raw.len() {
                    return Err(invalid("`*` is only allowed as the last segment"));
                }
                Segment::Wildcard
            } else if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(invalid("placeholder without a name"));
                }
                if segments.iter().any(|s| matches!(s, Segment::Param(p) if p == name)) {
                    return Err(invalid("duplicate placeholder"));
                }
                Segment::Param(name.to_string())
            } else {
                Segment::Literal((*part).to_string())
            };
            segments.push(segment);
        }

        Ok(Self { source: pattern.to_string(), segments })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `name` is one of this pattern's placeholders.
    pub fn has_placeholder(&self, name: &str) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Param(p) if p == name))
    }

    /// Test a concrete URL (absolute, or a path with optional query).
    pub fn matches(&self, url: &str) -> Option<PatternMatch> {
        let target = RequestTarget::parse(url)?;
        self.match_target(&target)
    }

    pub(crate) fn match_target(&self, target: &RequestTarget) -> Option<PatternMatch> {
        let mut params = Vec::new();
        let mut path = target.segments.iter();

        for segment in &self.segments {
            match segment {
                Segment::Wildcard => {
                    return Some(PatternMatch { params, query: target.query.clone() });
                }
                Segment::Literal(lit) => {
                    if path.next()? != lit {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = path.next()?;
                    params.push((name.clone(), value.clone()));
                }
            }
        }

        if path.next().is_some() {
            return None;
        }
        Some(PatternMatch { params, query: target.query.clone() })
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// A request URL split into decoded path segments and decoded query pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    segments: Vec<String>,
    query: Vec<(String, String)>,
}

impl RequestTarget {
    /// Parse an absolute URL or a path relative to the API host. Returns `None` for input the
    /// URL parser rejects.
    pub fn parse(url: &str) -> Option<Self> {
        let base = Url::parse("http://localhost/").ok()?;
        let parsed = Url::options().base_url(Some(&base)).parse(url).ok()?;

        let segments = parsed
            .path_segments()
            .map(|parts| {
                parts
                    .filter(|s| !s.is_empty())
                    .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        let query = parsed.query_pairs().into_owned().collect();

        Some(Self { segments, query })
    }
}

/// Values captured by a successful pattern match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatternMatch {
    params: Vec<(String, String)>,
    query: Vec<(String, String)>,
}

impl PatternMatch {
    /// Value of a path placeholder.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// First value of a query parameter.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Resolve a key against path placeholders first, then the query string.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.param(name).or_else(|| self.query(name))
    }

    /// One value per key, in key order.
    pub fn dependency_values(&self, keys: &[String]) -> Vec<Option<String>> {
        keys.iter().map(|k| self.value(k).map(str::to_owned)).collect()
    }
}
