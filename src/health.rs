//! Rolling health state per channel and validity state per API key.
//!
//! The dispatcher records every outcome here; the scorer reads the success
//! rate and latency EWMA back out; the router filter drops channels whose
//! health score falls below the configured threshold. Key state drives the
//! scheduler's re-validation backoff and the permanent-blacklist release.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Smoothing factor for the latency EWMA — new samples count for 30%.
const LATENCY_ALPHA: f64 = 0.3;

/// Re-validation backoff base (doubles per consecutive failure).
const VALIDATION_BASE_SECS: i64 = 6 * 3600;

/// Backoff ceiling: one day.
const VALIDATION_MAX_SECS: i64 = 24 * 3600;

/// Per-channel rolling health.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealth {
    pub success_count: u64,
    pub request_count: u64,
    /// Exponentially-weighted moving average, milliseconds.
    pub latency_ewma_ms: Option<f64>,
    pub last_error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl ChannelHealth {
    fn new() -> Self {
        Self {
            success_count: 0,
            request_count: 0,
            latency_ewma_ms: None,
            last_error: None,
            last_updated: Utc::now(),
        }
    }

    pub fn success_rate(&self) -> Option<f64> {
        if self.request_count == 0 {
            None
        } else {
            Some(self.success_count as f64 / self.request_count as f64)
        }
    }

    /// Health score in [0, 1]: success rate × staleness decay × error-kind
    /// penalty. Unobserved channels score a neutral 1.0 so new channels are
    /// not filtered out before their first request.
    pub fn score_at(&self, now: DateTime<Utc>) -> f64 {
        let rate = match self.success_rate() {
            Some(r) => r,
            None => return 1.0,
        };

        let age = now.signed_duration_since(self.last_updated);
        let freshness = if age <= Duration::minutes(5) {
            1.0
        } else if age <= Duration::minutes(30) {
            0.9
        } else if age <= Duration::hours(2) {
            0.8
        } else {
            0.7
        };

        // Credential failures are a stronger signal than transient errors.
        let penalty = match self.last_error.as_deref() {
            Some("auth_invalid") => 0.8,
            _ => 1.0,
        };

        (rate * freshness * penalty).clamp(0.0, 1.0)
    }
}

/// Shared tracker: one [`ChannelHealth`] per channel id.
pub struct HealthTracker {
    channels: DashMap<String, ChannelHealth>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    pub fn record_success(&self, channel_id: &str, latency_ms: u64) {
        let mut entry = self.channels.entry(channel_id.to_string()).or_insert_with(ChannelHealth::new);
        entry.request_count += 1;
        entry.success_count += 1;
        entry.latency_ewma_ms = Some(match entry.latency_ewma_ms {
            Some(prev) => prev + LATENCY_ALPHA * (latency_ms as f64 - prev),
            None => latency_ms as f64,
        });
        entry.last_error = None;
        entry.last_updated = Utc::now();
    }

    pub fn record_failure(&self, channel_id: &str, error_kind: &str) {
        let mut entry = self.channels.entry(channel_id.to_string()).or_insert_with(ChannelHealth::new);
        entry.request_count += 1;
        entry.last_error = Some(error_kind.to_string());
        entry.last_updated = Utc::now();
    }

    pub fn health_score(&self, channel_id: &str) -> f64 {
        self.channels
            .get(channel_id)
            .map(|h| h.score_at(Utc::now()))
            .unwrap_or(1.0)
    }

    /// Average response time in seconds, for the speed factor.
    pub fn avg_response_secs(&self, channel_id: &str) -> Option<f64> {
        self.channels
            .get(channel_id)
            .and_then(|h| h.latency_ewma_ms)
            .map(|ms| ms / 1000.0)
    }

    pub fn get(&self, channel_id: &str) -> Option<ChannelHealth> {
        self.channels.get(channel_id).map(|h| h.clone())
    }

    /// Snapshot of all tracked channels, for the health endpoint.
    pub fn all(&self) -> Vec<(String, ChannelHealth)> {
        let mut out: Vec<_> = self
            .channels
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Validity state for one (channel, key-fingerprint) pair.
#[derive(Debug, Clone, Serialize)]
pub struct KeyState {
    pub valid: bool,
    pub consecutive_failures: u32,
    pub next_validation: DateTime<Utc>,
    pub last_error_kind: Option<String>,
}

/// Shared tracker: one [`KeyState`] per (channel id, key fingerprint).
pub struct KeyTracker {
    keys: DashMap<(String, String), KeyState>,
}

impl KeyTracker {
    pub fn new() -> Self {
        Self { keys: DashMap::new() }
    }

    /// Unknown keys are assumed valid until a validation run says otherwise.
    pub fn is_valid(&self, channel_id: &str, key_fp: &str) -> bool {
        self.keys
            .get(&(channel_id.to_string(), key_fp.to_string()))
            .map(|s| s.valid)
            .unwrap_or(true)
    }

    pub fn mark_valid(&self, channel_id: &str, key_fp: &str) {
        self.keys.insert(
            (channel_id.to_string(), key_fp.to_string()),
            KeyState {
                valid: true,
                consecutive_failures: 0,
                next_validation: Utc::now() + Duration::seconds(VALIDATION_BASE_SECS),
                last_error_kind: None,
            },
        );
    }

    /// Record a failed validation; backoff doubles per consecutive failure,
    /// capped at 24 h.
    pub fn mark_invalid(&self, channel_id: &str, key_fp: &str, error_kind: &str) {
        let key = (channel_id.to_string(), key_fp.to_string());
        let failures = self
            .keys
            .get(&key)
            .map(|s| s.consecutive_failures + 1)
            .unwrap_or(1);

        let backoff_secs = VALIDATION_BASE_SECS
            .saturating_mul(1_i64 << (failures.min(8) - 1))
            .min(VALIDATION_MAX_SECS);

        self.keys.insert(
            key,
            KeyState {
                valid: false,
                consecutive_failures: failures,
                next_validation: Utc::now() + Duration::seconds(backoff_secs),
                last_error_kind: Some(error_kind.to_string()),
            },
        );
    }

    /// Is this key due for a validation probe?
    pub fn due_for_validation(&self, channel_id: &str, key_fp: &str, now: DateTime<Utc>) -> bool {
        self.keys
            .get(&(channel_id.to_string(), key_fp.to_string()))
            .map(|s| now >= s.next_validation)
            .unwrap_or(true)
    }

    pub fn get(&self, channel_id: &str, key_fp: &str) -> Option<KeyState> {
        self.keys
            .get(&(channel_id.to_string(), key_fp.to_string()))
            .map(|s| s.clone())
    }

    pub fn invalid_count(&self) -> usize {
        self.keys.iter().filter(|e| !e.value().valid).count()
    }
}

impl Default for KeyTracker {
    fn default() -> Self {
        Self::new()
    }
}
