//! Request-fingerprint cache for routing decisions.
//!
//! A full route (discovery + filter + score) is memoised under a fingerprint
//! of the routing-affecting request fields. Entries carry the primary
//! candidate plus up to five backups so the dispatcher can fail over without
//! re-routing. Expiry is checked at read time; eviction is opportunistic LRU
//! on insert — no background sweeper.
//!
//! The fingerprint is a SHA-256 over canonical (sorted-key) JSON, truncated
//! to 32 hex chars under a `req_` prefix. Field order and list order inside
//! the request therefore never change the key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::routing::RoutingRequest;

/// Cache key derived from the routing-affecting subset of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Canonicalise and hash. `strategy` is the resolved strategy name (the
    /// request override or the configured default).
    pub fn of(request: &RoutingRequest, strategy: &str) -> Self {
        let mut caps = request.required_capabilities.clone();
        caps.sort();
        let mut excluded = request.excluded_providers.clone();
        excluded.sort();

        // serde_json's default map is sorted, so this serialises canonically.
        let canonical = serde_json::json!({
            "model": request.model.to_lowercase().trim(),
            "routing_strategy": strategy,
            "required_capabilities": caps,
            "min_context_length": request.min_context_length,
            "max_cost_per_1k": request.max_cost_per_1k,
            "prefer_local": request.prefer_local,
            "exclude_providers": excluded,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": request.stream,
            "has_functions": request.tools.is_some(),
        });

        let digest = Sha256::digest(canonical.to_string().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("req_{}", &hex[..32]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One ranked pick: (channel id, physical model id).
pub type CandidateRef = (String, String);

/// A memoised routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct CachedSelection {
    pub primary: CandidateRef,
    pub backups: Vec<CandidateRef>,
    pub reason: String,
    pub estimated_cost: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub use_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl CachedSelection {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Recency key for LRU eviction.
    fn recency(&self) -> DateTime<Utc> {
        self.last_used_at.unwrap_or(self.created_at).max(self.created_at)
    }

    /// Does this selection reference the channel anywhere?
    fn touches_channel(&self, channel_id: &str) -> bool {
        self.primary.0 == channel_id || self.backups.iter().any(|(c, _)| c == channel_id)
    }
}

/// Counters surfaced through `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Bounded TTL + LRU cache, single mutex with short critical sections.
pub struct RequestCache {
    default_ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CachedSelection>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl RequestCache {
    pub fn new(default_ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            default_ttl: Duration::seconds(default_ttl_secs as i64),
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Look up a selection. `is_usable` is probed with the primary's channel
    /// id so a selection whose channel was disabled since admission is
    /// rejected (and dropped) instead of returned.
    pub fn lookup(
        &self,
        fingerprint: &Fingerprint,
        is_usable: impl Fn(&str) -> bool,
    ) -> Option<CachedSelection> {
        let now = Utc::now();
        let mut entries = self.entries.lock().expect("request cache lock poisoned");

        let Some(entry) = entries.get_mut(fingerprint.as_str()) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired(now) || !is_usable(&entry.primary.0) {
            entries.remove(fingerprint.as_str());
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.use_count += 1;
        entry.last_used_at = Some(now);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.clone())
    }

    /// Admit a routing decision. Backups beyond five are dropped.
    pub fn store(
        &self,
        fingerprint: &Fingerprint,
        primary: CandidateRef,
        backups: Vec<CandidateRef>,
        reason: String,
        estimated_cost: f64,
        ttl_secs: Option<u64>,
    ) {
        let now = Utc::now();
        let ttl = ttl_secs
            .map(|s| Duration::seconds(s as i64))
            .unwrap_or(self.default_ttl);

        let mut backups = backups;
        backups.truncate(5);

        let selection = CachedSelection {
            primary,
            backups,
            reason,
            estimated_cost,
            created_at: now,
            expires_at: now + ttl,
            use_count: 0,
            last_used_at: None,
        };

        let mut entries = self.entries.lock().expect("request cache lock poisoned");
        if entries.len() >= self.max_entries && !entries.contains_key(fingerprint.as_str()) {
            evict_lru(&mut entries);
        }
        entries.insert(fingerprint.as_str().to_string(), selection);
    }

    /// Drop every selection whose primary or any backup is this channel.
    pub fn invalidate_channel(&self, channel_id: &str) {
        let mut entries = self.entries.lock().expect("request cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| !e.touches_channel(channel_id));
        let removed = (before - entries.len()) as u64;
        if removed > 0 {
            self.invalidations.fetch_add(removed, Ordering::Relaxed);
            tracing::debug!(channel = channel_id, removed, "invalidated cached selections");
        }
    }

    /// Drop everything (pricing refresh takes the conservative route).
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock().expect("request cache lock poisoned");
        let removed = entries.len() as u64;
        entries.clear();
        if removed > 0 {
            self.invalidations.fetch_add(removed, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().expect("request cache lock poisoned");
        CacheStats {
            entries: entries.len(),
            max_entries: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

fn evict_lru(entries: &mut HashMap<String, CachedSelection>) {
    if let Some(oldest) = entries
        .iter()
        .min_by_key(|(_, e)| e.recency())
        .map(|(k, _)| k.clone())
    {
        entries.remove(&oldest);
    }
}
