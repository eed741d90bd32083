//! Response Cache (spec §4.E) — fingerprints queries and reuses prior
//! outputs under a coherent staleness policy.
//!
//! Grounded on `rate_limiter.rs`'s per-key `parking_lot::Mutex` sharding
//! (cache mutation never awaits, so a blocking mutex is correct here too).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 16;

/// Deterministic, dependency-free FNV-1a hash rendered as hex, used both
/// for cache fingerprints and the CGRAG context-fingerprint.
pub fn stable_hash(input: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in input.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

/// Inputs that determine a query's fingerprint (spec §4.E): normalized
/// text, mode, tier, context fingerprint, and the request flags that
/// materially affect output. Timestamps and client identity are excluded.
#[derive(Debug, Clone)]
pub struct FingerprintInput<'a> {
    pub normalized_query: &'a str,
    pub mode: &'a str,
    pub tier: &'a str,
    pub context_fingerprint: Option<&'a str>,
    pub temperature_bucket: u32,
    pub max_tokens: u32,
}

pub fn fingerprint(input: &FingerprintInput<'_>) -> String {
    let joined = format!(
        "{}|{}|{}|{}|{}|{}",
        input.normalized_query,
        input.mode,
        input.tier,
        input.context_fingerprint.unwrap_or(""),
        input.temperature_bucket,
        input.max_tokens,
    );
    stable_hash(&joined)
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub response: serde_json::Value,
    pub created_at: Instant,
    pub ttl: Duration,
    pub hit_count: u64,
    /// Model ids whose output contributed to this entry, for scoped
    /// per-model invalidation (spec §9 Open Question, resolved as scoped).
    pub model_ids: Vec<String>,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

struct Shard {
    entries: HashMap<String, CacheEntry>,
    lru_order: Vec<String>,
}

impl Shard {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru_order: Vec::new(),
        }
    }

    fn touch(&mut self, key: &str) {
        self.lru_order.retain(|k| k != key);
        self.lru_order.push(key.to_string());
    }

    fn evict_expired(&mut self) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            self.entries.remove(&k);
            self.lru_order.retain(|x| x != &k);
        }
    }

    fn evict_lru_until(&mut self, max_entries: usize) {
        while self.entries.len() > max_entries {
            if self.lru_order.is_empty() {
                break;
            }
            let victim = self.lru_order.remove(0);
            self.entries.remove(&victim);
        }
    }
}

/// Sharded cache: per-shard `parking_lot::Mutex`, reads outside locks on
/// immutable entries once cloned out (spec §5 shared-resource policy).
pub struct ResponseCache {
    shards: Vec<Mutex<Shard>>,
    max_entries_per_shard: usize,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new())).collect();
        Self {
            shards,
            max_entries_per_shard: (max_entries / SHARD_COUNT).max(1),
            default_ttl,
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let idx = key
            .as_bytes()
            .first()
            .map(|b| *b as usize)
            .unwrap_or(0)
            % self.shards.len();
        &self.shards[idx]
    }

    /// Non-blocking read; returns a clone of the entry if present and
    /// unexpired, bumping its hit count and LRU position.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut shard = self.shard_for(key).lock();
        shard.evict_expired();
        if let Some(entry) = shard.entries.get_mut(key) {
            entry.hit_count += 1;
            let clone = entry.clone();
            shard.touch(key);
            Some(clone)
        } else {
            None
        }
    }

    /// Best-effort write: evicts expired entries lazily, then LRU victims
    /// until the shard's size limit is met.
    pub fn put(&self, key: String, response: serde_json::Value, ttl: Option<Duration>, model_ids: Vec<String>) {
        let mut shard = self.shard_for(&key).lock();
        shard.evict_expired();
        shard.entries.insert(
            key.clone(),
            CacheEntry {
                fingerprint: key.clone(),
                response,
                created_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                hit_count: 0,
                model_ids,
            },
        );
        shard.touch(&key);
        shard.evict_lru_until(self.max_entries_per_shard);
    }

    /// Wholesale invalidation: used when the underlying context index is
    /// rebuilt (spec §4.E coherence rule).
    pub fn invalidate_all(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.entries.clear();
            shard.lru_order.clear();
        }
    }

    /// Scoped invalidation: removes only entries that used `model_id`,
    /// the finer-grained resolution of spec §9's second Open Question.
    pub fn invalidate_model(&self, model_id: &str) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            let stale: Vec<String> = shard
                .entries
                .iter()
                .filter(|(_, e)| e.model_ids.iter().any(|m| m == model_id))
                .map(|(k, _)| k.clone())
                .collect();
            for k in stale {
                shard.entries.remove(&k);
                shard.lru_order.retain(|x| x != &k);
            }
        }
    }
}
