//! Cached route entries, freshness evaluation and statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Rendered output for a route: HTML plus side metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// The HTML content
    pub html: String,

    /// Metadata about the page
    #[serde(default)]
    pub meta: PageMeta,
}

impl Artifact {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            meta: PageMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: PageMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// Metadata rendered alongside the page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Anything else the renderer wants to keep with the page
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A cached route with its TTL metadata.
///
/// There is at most one entry per route; every write replaces the previous
/// entry and stamps a new `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Canonical route path, e.g. `/news/123`
    pub route: String,

    pub artifact: Artifact,

    /// When the artifact was rendered
    pub created_at: DateTime<Utc>,

    /// Seconds the entry stays fresh
    pub ttl_seconds: u64,
}

/// Freshness of a cache lookup. `Missing` is represented by the absence of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
}

impl CacheEntry {
    /// Create an entry rendered now
    pub fn new(route: impl Into<String>, artifact: Artifact, ttl_seconds: u64) -> Self {
        Self {
            route: route.into(),
            artifact,
            created_at: Utc::now(),
            ttl_seconds,
        }
    }

    /// Freshness relative to `now`
    pub fn freshness_at(&self, now: DateTime<Utc>) -> Freshness {
        freshness_of(self, now)
    }

    /// Age of the entry relative to `now`; entries from the future have age zero
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Seconds left before the entry turns stale
    pub fn remaining_ttl_at(&self, now: DateTime<Utc>) -> Duration {
        Duration::from_secs(self.ttl_seconds).saturating_sub(self.age_at(now))
    }
}

/// Pure freshness check: fresh while `now - created_at < ttl`.
pub fn freshness_of(entry: &CacheEntry, now: DateTime<Utc>) -> Freshness {
    if entry.age_at(now) < Duration::from_secs(entry.ttl_seconds) {
        Freshness::Fresh
    } else {
        Freshness::Stale
    }
}

/// How a request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Stale => "STALE",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Statistics for the ISR cache
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Requests answered with a fresh entry
    pub hits: u64,

    /// Requests answered with a stale entry
    pub stale_hits: u64,

    /// Requests that had to render synchronously
    pub misses: u64,

    /// Successful renders written to the cache
    pub regenerations: u64,

    /// Renders (or cache writes) that failed
    pub render_failures: u64,
}

impl CacheStats {
    /// Share of requests served from cache, stale or not
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entry_created_at(created_at: DateTime<Utc>, ttl_seconds: u64) -> CacheEntry {
        CacheEntry {
            route: "/news/123".to_string(),
            artifact: Artifact::new("<h1>news</h1>"),
            created_at,
            ttl_seconds,
        }
    }

    #[test]
    fn test_freshness_boundary() {
        let now = Utc::now();
        let ttl = 60;

        let stale = entry_created_at(now - ChronoDuration::seconds(ttl + 1), ttl as u64);
        assert_eq!(freshness_of(&stale, now), Freshness::Stale);

        let fresh = entry_created_at(now - ChronoDuration::seconds(ttl - 1), ttl as u64);
        assert_eq!(freshness_of(&fresh, now), Freshness::Fresh);

        let exact = entry_created_at(now - ChronoDuration::seconds(ttl), ttl as u64);
        assert_eq!(exact.freshness_at(now), Freshness::Stale);
    }

    #[test]
    fn test_zero_ttl_is_always_stale() {
        let now = Utc::now();
        let entry = entry_created_at(now, 0);
        assert_eq!(entry.freshness_at(now), Freshness::Stale);
    }

    #[test]
    fn test_future_entry_is_fresh() {
        let now = Utc::now();
        let entry = entry_created_at(now + ChronoDuration::seconds(5), 10);
        assert_eq!(entry.age_at(now), Duration::ZERO);
        assert_eq!(entry.freshness_at(now), Freshness::Fresh);
    }

    #[test]
    fn test_remaining_ttl() {
        let now = Utc::now();
        let entry = entry_created_at(now - ChronoDuration::seconds(20), 60);
        assert_eq!(entry.remaining_ttl_at(now), Duration::from_secs(40));

        let expired = entry_created_at(now - ChronoDuration::seconds(90), 60);
        assert_eq!(expired.remaining_ttl_at(now), Duration::ZERO);
    }

    #[test]
    fn test_entry_serialization_keeps_meta() {
        let mut meta = PageMeta {
            title: Some("Town hall".to_string()),
            description: None,
            extra: BTreeMap::new(),
        };
        meta.extra.insert("lang".to_string(), "en".to_string());

        let entry = CacheEntry::new("/news", Artifact::new("<p>hi</p>").with_meta(meta), 30);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("description"));

        let parsed: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 2,
            stale_hits: 1,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
