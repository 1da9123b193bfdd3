//! Record cache with TTL-based expiration.

use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

use crate::dns::{Record, RecordType, normalize_name};

/// TTL bounds applied when records are stored.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of a record set that carries no TTL.
    pub default_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_ttl: Duration::from_secs(86400),
        }
    }
}

struct CacheEntry {
    records: Vec<Record>,
    expires_at: Instant,
}

/// TTL-based record cache keyed by `(name, type)`.
///
/// Uses a 2-level map (type -> name -> entry) so lookups borrow the name.
/// An entry is never returned at or past its expiry.
pub struct DnsCache {
    entries: FxHashMap<RecordType, FxHashMap<String, CacheEntry>>,
    config: CacheConfig,
}

impl DnsCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: FxHashMap::default(),
            config,
        }
    }

    /// Look up live records; an expired entry is removed and reported as a miss.
    pub fn lookup(&mut self, name: &str, rtype: RecordType, now: Instant) -> Option<Vec<Record>> {
        let name = normalize_name(name);
        let inner = self.entries.get_mut(&rtype)?;
        let entry = inner.get(&name)?;

        if now < entry.expires_at {
            return Some(entry.records.clone());
        }

        inner.remove(&name);
        None
    }

    /// Whether a live entry exists, without cloning its records.
    pub fn contains(&self, name: &str, rtype: RecordType, now: Instant) -> bool {
        self.entries
            .get(&rtype)
            .and_then(|inner| inner.get(&normalize_name(name)))
            .is_some_and(|entry| now < entry.expires_at)
    }

    /// Insert or overwrite the records for `(name, rtype)`.
    ///
    /// Expiry is `now` plus the smallest record TTL, capped at `max_ttl`.
    pub fn store(&mut self, name: &str, rtype: RecordType, records: Vec<Record>, now: Instant) {
        let ttl = records
            .iter()
            .map(|r| Duration::from_secs(u64::from(r.ttl)))
            .min()
            .unwrap_or(self.config.default_ttl)
            .min(self.config.max_ttl);

        self.entries.entry(rtype).or_default().insert(
            normalize_name(name),
            CacheEntry {
                records,
                expires_at: now + ttl,
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for inner in self.entries.values_mut() {
            let before = inner.len();
            inner.retain(|_, entry| now < entry.expires_at);
            removed += before - inner.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|inner| inner.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
