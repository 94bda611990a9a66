use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Per-client admission control.
pub trait AdmissionControl: Send + Sync {
    /// Whether `identifier` may proceed now. Never blocks waiting for capacity.
    fn allow(&self, identifier: &str) -> bool;

    /// Drop every client first seen more than `retention` ago.
    fn evict_older_than(&self, retention: Duration) -> usize;

    fn statistics(&self) -> LimiterStats;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Number of clients currently tracked.
    pub total: usize,
}

/// Token bucket: refills at `rate` tokens per second up to `burst`.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32, now: Instant) -> Self {
        Self {
            rate,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = self.last_refill.max(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct ClientBucket {
    bucket: Mutex<TokenBucket>,
    /// First-seen time. Not refreshed on access.
    created_at: Instant,
}

/// Registry of token buckets keyed by client address.
///
/// The map is sharded, so lookups and lazy inserts for one client never wait
/// on another client's bucket. Entries are only removed by eviction.
#[derive(Debug, Clone)]
pub struct RateRegistry {
    rate: f64,
    burst: u32,
    clients: Arc<DashMap<String, Arc<ClientBucket>>>,
}

impl RateRegistry {
    /// `rate` is in tokens per second, `burst` is the bucket capacity.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst,
            clients: Arc::new(DashMap::new()),
        }
    }

    pub fn allow_at(&self, identifier: &str, now: Instant) -> bool {
        // Clone the handle out so the shard lock is released before touching the bucket.
        let client = self
            .clients
            .entry(identifier.to_owned())
            .or_insert_with(|| {
                tracing::debug!(client = %identifier, "Tracking new client");
                Arc::new(ClientBucket {
                    bucket: Mutex::new(TokenBucket::new(self.rate, self.burst, now)),
                    created_at: now,
                })
            })
            .value()
            .clone();

        let mut bucket = client.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.try_take(now)
    }

    /// Remove clients first seen strictly before `cutoff`.
    pub fn evict_created_before(&self, cutoff: Instant) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, client| client.created_at >= cutoff);
        before.saturating_sub(self.clients.len())
    }
}

impl AdmissionControl for RateRegistry {
    fn allow(&self, identifier: &str) -> bool {
        self.allow_at(identifier, Instant::now())
    }

    fn evict_older_than(&self, retention: Duration) -> usize {
        match Instant::now().checked_sub(retention) {
            Some(cutoff) => self.evict_created_before(cutoff),
            // Retention reaches past the clock's origin; nothing can be that old.
            None => 0,
        }
    }

    fn statistics(&self) -> LimiterStats {
        LimiterStats {
            total: self.clients.len(),
        }
    }
}
