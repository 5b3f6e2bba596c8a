use crate::error::Result;
use crate::models::{Candle, EventCalendar, HistoryRange};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Calendars change rarely compared to daily bars.
const CALENDAR_TTL_MULTIPLIER: u32 = 12;

/// Shared in-process cache whose entries expire after a fixed lifespan.
#[derive(Clone)]
pub struct TtlCache<V: Clone> {
    entries: Arc<DashMap<String, (Instant, V)>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            let (stored_at, value) = entry.value();
            if stored_at.elapsed() < self.ttl {
                return Some(value.clone());
            }
        }
        // Re-checked under the shard lock so a concurrent fresh insert survives.
        self.remove_if_expired(key);
        None
    }

    fn remove_if_expired(&self, key: &str) -> bool {
        let ttl = self.ttl;
        self.entries
            .remove_if(key, |_, (stored_at, _)| stored_at.elapsed() >= ttl)
            .is_some()
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), (Instant::now(), value));
    }

    /// Return the cached value or run `fetch`; only successful results are stored.
    pub async fn get_or_try_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key) {
            log::debug!("Cache hit for {}", key);
            return Ok(value);
        }

        log::debug!("Cache miss for {}", key);
        let value = fetch().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone)]
pub struct MarketDataCache {
    history: TtlCache<Arc<Vec<Candle>>>,
    calendars: TtlCache<EventCalendar>,
}

impl MarketDataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            history: TtlCache::new(ttl),
            calendars: TtlCache::new(ttl * CALENDAR_TTL_MULTIPLIER),
        }
    }

    pub fn history_key(provider: &str, symbol: &str, range: HistoryRange) -> String {
        format!("{}:{}:{}", provider, symbol, range.as_str())
    }

    pub fn calendar_key(provider: &str, symbol: &str) -> String {
        format!("{}:{}:calendar", provider, symbol)
    }

    pub fn history(&self) -> &TtlCache<Arc<Vec<Candle>>> {
        &self.history
    }

    pub fn calendars(&self) -> &TtlCache<EventCalendar> {
        &self.calendars
    }

    pub fn clear_all(&self) {
        self.history.clear();
        self.calendars.clear();
    }
}
