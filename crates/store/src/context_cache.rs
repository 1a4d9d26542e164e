use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use tt_domain::error::Result;

use crate::db::{db_err, now_ms, Store};

/// Cache key for a query: SHA-256 of the trimmed, lowercased text with
/// whitespace runs collapsed, so trivially different phrasings share an
/// entry.
pub fn fingerprint(query: &str) -> String {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// A cached context entry. Freshness is the caller's call.
#[derive(Debug, Clone)]
pub struct CachedContext {
    pub query: String,
    pub context: String,
    pub fetched_at: DateTime<Utc>,
}

impl CachedContext {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or_default()
    }

    /// Fresh while `now - fetched_at < ttl`.
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) < ttl
    }
}

/// Capacity-bounded store of last-known context text, keyed by
/// [`fingerprint`]. Inserting past capacity evicts the oldest entries.
#[derive(Clone)]
pub struct ContextCache {
    store: Store,
    capacity: usize,
}

impl ContextCache {
    pub fn new(store: Store, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
        }
    }

    pub fn lookup(&self, query: &str) -> Result<Option<CachedContext>> {
        let row: Option<(String, String, i64)> = self
            .store
            .conn()
            .query_row(
                "SELECT query, context, fetched_at FROM context_cache WHERE fingerprint = ?1",
                [fingerprint(query)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_err)?;
        Ok(row.map(|(query, context, fetched_at)| CachedContext {
            query,
            context,
            fetched_at: DateTime::from_timestamp_millis(fetched_at).unwrap_or_default(),
        }))
    }

    /// Insert or refresh an entry, then trim to capacity.
    pub fn put(&self, query: &str, context: &str) -> Result<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO context_cache (fingerprint, query, context, fetched_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![fingerprint(query), query, context, now_ms()],
        )
        .map_err(db_err)?;
        let evicted = tx
            .execute(
                "DELETE FROM context_cache WHERE fingerprint IN (
                    SELECT fingerprint FROM context_cache
                    ORDER BY fetched_at DESC, rowid DESC
                    LIMIT -1 OFFSET ?1
                 )",
                [self.capacity as i64],
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        if evicted > 0 {
            tracing::debug!(evicted, capacity = self.capacity, "context cache trimmed");
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .store
            .conn()
            .query_row("SELECT COUNT(*) FROM context_cache", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> ContextCache {
        ContextCache::new(Store::open_in_memory().unwrap(), capacity)
    }

    #[test]
    fn fingerprint_normalizes_whitespace_and_case() {
        assert_eq!(fingerprint("What's  on my\tcalendar"), fingerprint(" what's on MY calendar "));
        assert_ne!(fingerprint("calendar"), fingerprint("calendars"));
        assert_eq!(fingerprint("x").len(), 64);
    }

    #[test]
    fn put_then_lookup() {
        let cache = cache(4);
        assert!(cache.lookup("weather").unwrap().is_none());
        cache.put("weather", "sunny, 21C").unwrap();
        let hit = cache.lookup("Weather").unwrap().unwrap();
        assert_eq!(hit.context, "sunny, 21C");
        assert_eq!(hit.query, "weather");
        assert!(hit.is_fresh(Duration::from_secs(60), Utc::now()));
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let cache = cache(4);
        cache.put("q", "old").unwrap();
        cache.put("q", "new").unwrap();
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.lookup("q").unwrap().unwrap().context, "new");
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = cache(2);
        cache.put("a", "1").unwrap();
        cache.put("b", "2").unwrap();
        cache.put("c", "3").unwrap();
        assert_eq!(cache.len().unwrap(), 2);
        assert!(cache.lookup("a").unwrap().is_none());
        assert!(cache.lookup("b").unwrap().is_some());
        assert!(cache.lookup("c").unwrap().is_some());
    }

    #[test]
    fn refreshed_entry_survives_eviction() {
        let cache = cache(2);
        cache.put("a", "1").unwrap();
        cache.put("b", "2").unwrap();
        cache.put("a", "1b").unwrap();
        cache.put("c", "3").unwrap();
        assert!(cache.lookup("a").unwrap().is_some());
        assert!(cache.lookup("b").unwrap().is_none());
    }

    #[test]
    fn staleness_is_relative_to_ttl() {
        let entry = CachedContext {
            query: "q".into(),
            context: "c".into(),
            fetched_at: Utc::now() - chrono::Duration::seconds(120),
        };
        let now = Utc::now();
        assert!(!entry.is_fresh(Duration::from_secs(60), now));
        assert!(entry.is_fresh(Duration::from_secs(600), now));
        assert!(entry.age(now) >= Duration::from_secs(119));
    }
}
