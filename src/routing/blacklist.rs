//! Transient (channel, model) exclusions after dispatch failures.
//!
//! The cool-off depends on the classified error kind:
//!
//! | kind                  | cool-off                                   |
//! |-----------------------|--------------------------------------------|
//! | `auth_invalid`        | permanent — until key re-validation clears |
//! | `rate_limited`        | 60 s                                       |
//! | `upstream_timeout`    | 30 s, doubling per consecutive trip, ≤ 5 m |
//! | `upstream_server_error` | same as timeout                          |
//!
//! Reads are lock-free (`DashMap`). Expired entries stay in the map so the
//! consecutive-trip counter survives until a success clears it; they are
//! ignored by `is_blacklisted` and dropped when the entry is cleared.

use std::time::{Duration, Instant};

use dashmap::DashMap;

const RATE_LIMIT_COOLOFF: Duration = Duration::from_secs(60);
const TRANSIENT_BASE_COOLOFF: Duration = Duration::from_secs(30);
const TRANSIENT_MAX_COOLOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub error_kind: String,
    pub set_at: Instant,
    /// `None` means permanent (auth failures).
    pub cooloff: Option<Duration>,
    /// Consecutive trips; drives the doubling for transient kinds.
    pub trips: u32,
}

impl BlacklistEntry {
    fn is_active(&self, now: Instant) -> bool {
        match self.cooloff {
            None => true,
            Some(d) => now.duration_since(self.set_at) < d,
        }
    }

    /// Remaining suppression time; `None` for permanent entries.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.cooloff
            .map(|d| d.saturating_sub(now.duration_since(self.set_at)))
    }
}

pub struct Blacklist {
    entries: DashMap<(String, String), BlacklistEntry>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Record a classified dispatch failure. Transient kinds double their
    /// cool-off per consecutive trip (30 s, 60 s, …, capped at 5 minutes).
    pub fn record_failure(&self, channel_id: &str, model_id: &str, error_kind: &str) {
        let key = (channel_id.to_string(), model_id.to_string());
        let trips = self.entries.get(&key).map(|e| e.trips + 1).unwrap_or(1);

        let cooloff = match error_kind {
            "auth_invalid" => None,
            "rate_limited" => Some(RATE_LIMIT_COOLOFF),
            _ => {
                let doubled = TRANSIENT_BASE_COOLOFF
                    .saturating_mul(1_u32 << (trips.min(8) - 1));
                Some(doubled.min(TRANSIENT_MAX_COOLOFF))
            }
        };

        tracing::debug!(
            channel = channel_id,
            model = model_id,
            kind = error_kind,
            trips,
            cooloff_secs = cooloff.map(|d| d.as_secs()),
            "blacklisting candidate"
        );

        self.entries.insert(
            key,
            BlacklistEntry { error_kind: error_kind.to_string(), set_at: Instant::now(), cooloff, trips },
        );
    }

    pub fn is_blacklisted(&self, channel_id: &str, model_id: &str) -> bool {
        self.entries
            .get(&(channel_id.to_string(), model_id.to_string()))
            .map(|e| e.is_active(Instant::now()))
            .unwrap_or(false)
    }

    pub fn get(&self, channel_id: &str, model_id: &str) -> Option<BlacklistEntry> {
        self.entries
            .get(&(channel_id.to_string(), model_id.to_string()))
            .map(|e| e.clone())
    }

    /// Clear one (channel, model) — called after a successful dispatch so
    /// the consecutive-trip counter resets.
    pub fn clear(&self, channel_id: &str, model_id: &str) {
        self.entries
            .remove(&(channel_id.to_string(), model_id.to_string()));
    }

    /// Release every permanent auth entry for a channel — called when key
    /// validation succeeds again.
    pub fn clear_auth_entries(&self, channel_id: &str) {
        self.entries
            .retain(|(c, _), e| !(c == channel_id && e.error_kind == "auth_invalid"));
    }

    /// Active (unexpired) entry count, for the health endpoint.
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_active(now)).count()
    }

    #[cfg(test)]
    fn backdate(&self, channel_id: &str, model_id: &str, by: Duration) {
        if let Some(mut e) = self
            .entries
            .get_mut(&(channel_id.to_string(), model_id.to_string()))
        {
            e.set_at = Instant::now().checked_sub(by).expect("backdate underflow");
        }
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}
