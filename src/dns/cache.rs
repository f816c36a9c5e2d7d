//! DNS Fact Cache
//!
//! Maps domains to the addresses recently observed for them, plus the reverse
//! address -> domain mapping the dispatch path uses to attach a domain to an
//! intercepted connection.
//!
//! A single mutex guards both maps. Every entry is stamped with the epoch that
//! was current when it was stored; an entry is a miss once its TTL elapses or
//! once the epoch moves on. Stale entries are evicted by the lookup that
//! discovers them. Entries nobody looks up again are swept by `store` once the
//! forward map has doubled since the previous sweep; there is no background
//! task.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::epoch::Epoch;

/// Forward map size below which `store` never sweeps
pub const SWEEP_THRESHOLD: usize = 1024;

/// Resolution facts for one domain
#[derive(Debug, Clone)]
pub struct DnsCacheEntry {
    pub domain: String,
    pub addrs: Vec<IpAddr>,
    pub expires_at: Instant,
    pub epoch: u32,
}

impl DnsCacheEntry {
    /// Whether this entry can still be served under `epoch` at `now`
    fn is_fresh(&self, epoch: u32, now: Instant) -> bool {
        self.epoch == epoch && now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    forward: HashMap<String, DnsCacheEntry>,
    reverse: HashMap<IpAddr, String>,
    next_sweep: usize,
}

impl CacheInner {
    /// Drop a forward entry and every reverse record pointing at it
    fn evict(&mut self, domain: &str) {
        if let Some(entry) = self.forward.remove(domain) {
            for addr in &entry.addrs {
                if self.reverse.get(addr).map(String::as_str) == Some(domain) {
                    self.reverse.remove(addr);
                }
            }
        }
    }

    /// Drop every entry that is no longer fresh; returns how many went
    fn sweep(&mut self, epoch: u32, now: Instant) -> usize {
        let before = self.forward.len();
        self.forward.retain(|_, entry| entry.is_fresh(epoch, now));
        let forward = &self.forward;
        self.reverse.retain(|addr, domain| {
            forward
                .get(domain.as_str())
                .is_some_and(|entry| entry.addrs.contains(addr))
        });
        self.next_sweep = (self.forward.len() * 2).max(SWEEP_THRESHOLD);
        before - self.forward.len()
    }
}

/// Hit/miss counters
#[derive(Debug, Default)]
pub struct DnsCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DnsCacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Epoch-aware DNS cache
#[derive(Debug)]
pub struct DnsCache {
    epoch: Arc<Epoch>,
    inner: Mutex<CacheInner>,
    stats: DnsCacheStats,
}

impl DnsCache {
    /// Create an empty cache bound to the control plane's epoch
    pub fn new(epoch: Arc<Epoch>) -> Self {
        Self {
            epoch,
            inner: Mutex::new(CacheInner::default()),
            stats: DnsCacheStats::default(),
        }
    }

    /// Record `addrs` as the resolution of `domain` for `ttl`
    pub fn store(&self, domain: &str, addrs: Vec<IpAddr>, ttl: Duration) {
        let domain = normalize_domain(domain);
        let entry = DnsCacheEntry {
            domain: domain.clone(),
            addrs,
            expires_at: Instant::now() + ttl,
            epoch: self.epoch.current(),
        };

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.evict(&domain);
        for addr in &entry.addrs {
            inner.reverse.insert(*addr, domain.clone());
        }
        trace!("Cached {} -> {:?} (ttl {:?})", domain, entry.addrs, ttl);
        let (epoch, now) = (entry.epoch, Instant::now());
        inner.forward.insert(domain, entry);

        if inner.forward.len() >= inner.next_sweep.max(SWEEP_THRESHOLD) {
            let swept = inner.sweep(epoch, now);
            if swept > 0 {
                self.stats.evictions.fetch_add(swept as u64, Ordering::Relaxed);
                trace!("Swept {} stale DNS entries", swept);
            }
        }
    }

    /// Addresses for `domain`, or `None` on a miss
    pub fn lookup(&self, domain: &str) -> Option<Vec<IpAddr>> {
        let domain = normalize_domain(domain);
        let epoch = self.epoch.current();
        let now = Instant::now();

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let found = inner
            .forward
            .get(&domain)
            .map(|entry| entry.is_fresh(epoch, now).then(|| entry.addrs.clone()));

        match found {
            Some(Some(addrs)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(addrs)
            }
            Some(None) => {
                inner.evict(&domain);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Domain most recently resolved to `addr`, if still fresh
    pub fn reverse_lookup(&self, addr: IpAddr) -> Option<String> {
        let epoch = self.epoch.current();
        let now = Instant::now();

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let domain = inner.reverse.get(&addr)?.clone();
        let fresh = inner
            .forward
            .get(&domain)
            .map(|entry| entry.is_fresh(epoch, now) && entry.addrs.contains(&addr));

        match fresh {
            Some(true) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(domain)
            }
            Some(false) => {
                inner.evict(&domain);
                inner.reverse.remove(&addr);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                inner.reverse.remove(&addr);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Number of forward entries currently held (fresh or not yet evicted)
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forward
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &DnsCacheStats {
        &self.stats
    }
}

/// Lowercase and strip the trailing root dot
pub fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}
