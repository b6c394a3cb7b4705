//! Rule lookup.
//!
//! ## Match Order
//!
//! 1. URL rules against the raw value (exact or prefix)
//! 2. Domain rules against the lower-cased host of the value (host or any subdomain)
//! 3. Keyword rules against the raw value (case-insensitive substring)
//!
//! The first hit wins. Positive and negative answers are cached per
//! (type, value); store failures are not cached.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cache::ExpiringCache;
use crate::error::StoreError;
use crate::message::host_of;

/// Kind of rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Matches a URL exactly or as a prefix.
    Url,
    /// Matches a host and its subdomains.
    Domain,
    /// Matches a substring anywhere in the value.
    Keyword,
}

impl RuleType {
    /// Lookup order used by [`RuleMatcher::match_any`].
    pub const MATCH_ORDER: [RuleType; 3] = [RuleType::Url, RuleType::Domain, RuleType::Keyword];

    /// Returns the type as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Url => "url",
            RuleType::Domain => "domain",
            RuleType::Keyword => "keyword",
        }
    }

    /// Parses a type from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "url" => Some(RuleType::Url),
            "domain" => Some(RuleType::Domain),
            "keyword" => Some(RuleType::Keyword),
            _ => None,
        }
    }

    /// Normalizes a rule value for storage.
    ///
    /// Domains are lower-cased and lose a leading `*.` wildcard; keywords are
    /// lower-cased; URLs are kept as given.
    pub fn normalize(&self, rule: &str) -> String {
        let rule = rule.trim();
        match self {
            RuleType::Url => rule.to_string(),
            RuleType::Domain => rule
                .strip_prefix("*.")
                .unwrap_or(rule)
                .trim_end_matches('.')
                .to_ascii_lowercase(),
            RuleType::Keyword => rule.to_ascii_lowercase(),
        }
    }

    /// Returns true if a stored (normalized) rule matches `value`.
    pub fn matches(&self, rule: &str, value: &str) -> bool {
        if rule.is_empty() {
            return false;
        }
        match self {
            RuleType::Url => value.starts_with(rule),
            RuleType::Domain => {
                value == rule
                    || value
                        .strip_suffix(rule)
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
            RuleType::Keyword => value.to_ascii_lowercase().contains(rule),
        }
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cache key: a rule type and the value looked up for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    /// Rule type queried.
    pub rule_type: RuleType,
    /// Value queried.
    pub value: String,
}

/// A rule hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Type of the rule that matched.
    pub rule_type: RuleType,
    /// Stored value of the rule that matched.
    pub address: String,
}

impl RuleMatch {
    /// Creates a rule match.
    pub fn new(rule_type: RuleType, address: impl Into<String>) -> Self {
        Self {
            rule_type,
            address: address.into(),
        }
    }
}

/// Source of block rules.
///
/// Implementations are queried synchronously on the ingress path.
pub trait RuleStore: Send + Sync {
    /// Returns the rule of `rule_type` matching `value`, if any.
    fn query(&self, rule_type: RuleType, value: &str) -> Result<Option<RuleMatch>, StoreError>;
}

// =============================================================================
// In-memory Store
// =============================================================================

/// Rule store backed by a vector, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: RwLock<Vec<(RuleType, String)>>,
    queries: AtomicUsize,
}

impl MemoryRuleStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule.
    pub fn add(&self, rule_type: RuleType, value: &str) {
        self.rules.write().push((rule_type, rule_type.normalize(value)));
    }

    /// Adds a rule, builder style.
    pub fn with_rule(self, rule_type: RuleType, value: &str) -> Self {
        self.add(rule_type, value);
        self
    }

    /// Removes every rule of `rule_type` with the given value.
    pub fn remove(&self, rule_type: RuleType, value: &str) -> bool {
        let value = rule_type.normalize(value);
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|(ty, v)| !(*ty == rule_type && *v == value));
        rules.len() != before
    }

    /// Number of queries answered so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

impl RuleStore for MemoryRuleStore {
    fn query(&self, rule_type: RuleType, value: &str) -> Result<Option<RuleMatch>, StoreError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let rules = self.rules.read();
        // Longest rule wins so the most specific address is reported.
        Ok(rules
            .iter()
            .filter(|(ty, rule)| *ty == rule_type && rule_type.matches(rule, value))
            .max_by_key(|(_, rule)| rule.len())
            .map(|(ty, rule)| RuleMatch::new(*ty, rule.clone())))
    }
}

// =============================================================================
// Matcher
// =============================================================================

/// Ordered rule lookup in front of a [`RuleStore`], with a result cache.
pub struct RuleMatcher {
    store: Arc<dyn RuleStore>,
    cache: ExpiringCache<RuleKey, Option<RuleMatch>>,
}

impl RuleMatcher {
    /// Creates a matcher caching up to `capacity` answers for `ttl` of inactivity.
    pub fn new(store: Arc<dyn RuleStore>, capacity: usize, ttl: Duration) -> Self {
        Self {
            store,
            cache: ExpiringCache::new(capacity, ttl),
        }
    }

    /// Looks `value` up as URL, then Domain, then Keyword.
    pub fn match_any(&self, value: &str) -> Option<RuleMatch> {
        if value.is_empty() {
            return None;
        }
        RuleType::MATCH_ORDER.iter().find_map(|&rule_type| {
            let candidate = match rule_type {
                RuleType::Domain => host_of(value),
                RuleType::Url | RuleType::Keyword => value.to_string(),
            };
            self.lookup(rule_type, candidate)
        })
    }

    /// Looks up a single rule type.
    pub fn lookup(&self, rule_type: RuleType, value: String) -> Option<RuleMatch> {
        let key = RuleKey { rule_type, value };
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }

        match self.store.query(rule_type, &key.value) {
            Ok(result) => {
                self.cache.insert(key, result.clone());
                result
            }
            Err(e) => {
                tracing::warn!(
                    rule_type = rule_type.as_str(),
                    value = %key.value,
                    error = %e,
                    "Rule store query failed, treating as no match"
                );
                None
            }
        }
    }

    /// Drops every cached answer.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of cached answers.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl std::fmt::Debug for RuleMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleMatcher")
            .field("cached", &self.cache.len())
            .finish()
    }
}
