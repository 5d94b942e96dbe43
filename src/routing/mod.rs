//! The routing core: virtual model in, ranked (channel, model) pairs out.
//!
//! [`Router`] owns its collaborators explicitly — registry, catalog, finder,
//! scorer, request cache, blacklist, health and key trackers — and wires them
//! into the `route()` pipeline:
//!
//! 1. fingerprint → request-cache lookup (valid hit short-circuits);
//! 2. candidate discovery;
//! 3. filters: disabled/credentialless channels, excluded providers, invalid
//!    keys, blacklisted pairs, unhealthy channels, capability mismatches
//!    (with a cloud-substitute search when every match is a local model);
//! 4. score + hierarchical sort;
//! 5. cache admission (primary + up to five backups);
//! 6. the full ranked list back to the caller, who drives failover.

pub mod blacklist;
pub mod cache;
pub mod discovery;
pub mod scoring;
pub mod size_filter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::catalog::ModelCatalog;
use crate::config::RoutingConfig;
use crate::error::RouteError;
use crate::health::{HealthTracker, KeyTracker};
use crate::registry::ChannelRegistry;

use blacklist::Blacklist;
use cache::{CandidateRef, Fingerprint, RequestCache};
use discovery::{Candidate, CandidateFinder};
use scoring::{is_local_url, Scorer};

/// The routing-affecting view of an inbound chat-completion request.
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub stream: bool,
    pub tools: Option<Value>,
    pub required_capabilities: Vec<String>,
    pub strategy: Option<String>,
    pub excluded_providers: Vec<String>,
    pub min_context_length: Option<u64>,
    pub max_cost_per_1k: Option<f64>,
    pub prefer_local: bool,
}

impl RoutingRequest {
    /// Build from an OpenAI-shaped JSON body (plus the router's extension
    /// fields). A missing `model` is the caller's error.
    pub fn from_body(body: &Value) -> Result<Self, RouteError> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| RouteError::RequestMalformed {
                detail: "`model` field is required".to_string(),
            })?
            .to_string();

        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let required_capabilities = body
            .get("required_capabilities")
            .and_then(Value::as_array)
            .map(|caps| {
                caps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let excluded_providers = body
            .get("exclude_providers")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            model,
            messages,
            max_tokens: body.get("max_tokens").and_then(Value::as_u64),
            temperature: body.get("temperature").and_then(Value::as_f64),
            stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
            tools: body.get("tools").filter(|t| !t.is_null()).cloned(),
            required_capabilities,
            strategy: body
                .get("routing_strategy")
                .and_then(Value::as_str)
                .map(str::to_string),
            excluded_providers,
            min_context_length: body.get("min_context_length").and_then(Value::as_u64),
            max_cost_per_1k: body.get("max_cost_per_1k").and_then(Value::as_f64),
            prefer_local: body
                .get("prefer_local")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// The outcome of one `route()` call: candidates in dispatch order.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub ranked: Vec<Candidate>,
    pub strategy: String,
    pub reason: String,
    pub estimated_cost: f64,
    pub from_cache: bool,
}

/// Counters surfaced through `/health` (and used by the cache-coherence
/// tests to observe whether a full route ran).
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub routes: u64,
    pub full_routes: u64,
    pub cache_hits: u64,
}

pub struct Router {
    pub registry: Arc<ChannelRegistry>,
    pub catalog: Arc<ModelCatalog>,
    pub cache: Arc<RequestCache>,
    pub blacklist: Arc<Blacklist>,
    pub health: Arc<HealthTracker>,
    pub keys: Arc<KeyTracker>,
    finder: CandidateFinder,
    scorer: Scorer,
    routing: RoutingConfig,
    routes: AtomicU64,
    full_routes: AtomicU64,
    cache_hits: AtomicU64,
}

impl Router {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        catalog: Arc<ModelCatalog>,
        blacklist: Arc<Blacklist>,
        health: Arc<HealthTracker>,
        keys: Arc<KeyTracker>,
        routing: RoutingConfig,
    ) -> Self {
        let cache = Arc::new(RequestCache::new(
            routing.cache_ttl_secs,
            routing.cache_max_entries,
        ));
        let finder = CandidateFinder::new(Arc::clone(&registry), Arc::clone(&catalog));
        let scorer = Scorer::new(Arc::clone(&registry), Arc::clone(&health), routing.clone());

        Self {
            registry,
            catalog,
            cache,
            blacklist,
            health,
            keys,
            finder,
            scorer,
            routing,
            routes: AtomicU64::new(0),
            full_routes: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// Resolve the effective strategy name for a request.
    pub fn strategy_for(&self, request: &RoutingRequest) -> String {
        if let Some(name) = &request.strategy {
            return name.clone();
        }
        if request.prefer_local {
            return "local_first".to_string();
        }
        self.routing.default_strategy.clone()
    }

    pub fn max_retry_attempts(&self) -> usize {
        self.routing.max_retry_attempts
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routes: self.routes.load(Ordering::Relaxed),
            full_routes: self.full_routes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// The single entry point: ranked candidates for a request.
    #[tracing::instrument(skip(self, request), fields(model = %request.model))]
    pub fn route(&self, request: &RoutingRequest) -> Result<RouteDecision, RouteError> {
        self.routes.fetch_add(1, Ordering::Relaxed);

        let strategy = self.strategy_for(request);
        let fingerprint = Fingerprint::of(request, &strategy);

        if let Some(hit) = self
            .cache
            .lookup(&fingerprint, |channel_id| self.usable(channel_id))
        {
            if let Some(decision) = self.decision_from_cache(&hit, &strategy) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint = fingerprint.as_str(), "cache hit");
                return Ok(decision);
            }
        }

        self.full_routes.fetch_add(1, Ordering::Relaxed);

        let discovered = self.finder.find(&request.model)?;
        let filtered = self.filter(discovered, request)?;

        let scored = self
            .scorer
            .score(filtered, request, &strategy);
        if scored.is_empty() {
            return Err(RouteError::NoCandidates { model: request.model.clone() });
        }

        let top = &scored[0];
        let reason = top.scores.reason();
        let estimated_cost = top.estimated_cost;

        let primary: CandidateRef = (top.candidate.channel.id.clone(), top.candidate.model_id.clone());
        let backups: Vec<CandidateRef> = scored
            .iter()
            .skip(1)
            .take(5)
            .map(|s| (s.candidate.channel.id.clone(), s.candidate.model_id.clone()))
            .collect();
        self.cache
            .store(&fingerprint, primary, backups, reason.clone(), estimated_cost, None);

        Ok(RouteDecision {
            ranked: scored.into_iter().map(|s| s.candidate).collect(),
            strategy,
            reason,
            estimated_cost,
            from_cache: false,
        })
    }

    /// A channel is usable for a cached selection when it is still enabled
    /// and its key has not been invalidated.
    fn usable(&self, channel_id: &str) -> bool {
        if !self.registry.is_enabled(channel_id) {
            return false;
        }
        if let Some(channel) = self.registry.get_channel(channel_id) {
            let fp = crate::catalog::key_fingerprint(&channel.api_key);
            if !self.keys.is_valid(channel_id, &fp) {
                return false;
            }
            if self.health.health_score(channel_id) < self.routing.health_threshold {
                return false;
            }
        }
        true
    }

    fn decision_from_cache(
        &self,
        hit: &cache::CachedSelection,
        strategy: &str,
    ) -> Option<RouteDecision> {
        let mut ranked = Vec::with_capacity(1 + hit.backups.len());
        for (channel_id, model_id) in std::iter::once(&hit.primary).chain(hit.backups.iter()) {
            if let Some(channel) = self.registry.get_channel(channel_id) {
                if self.usable(channel_id) && !self.blacklist.is_blacklisted(channel_id, model_id)
                {
                    ranked.push(Candidate { channel, model_id: model_id.clone() });
                }
            }
        }
        if ranked.is_empty() {
            return None;
        }
        Some(RouteDecision {
            ranked,
            strategy: strategy.to_string(),
            reason: hit.reason.clone(),
            estimated_cost: hit.estimated_cost,
            from_cache: true,
        })
    }

    /// The candidate filter chain. Returns (candidate, resolved info) pairs
    /// ready for scoring.
    fn filter(
        &self,
        discovered: Vec<Candidate>,
        request: &RoutingRequest,
    ) -> Result<Vec<(Candidate, crate::catalog::ModelInfo)>, RouteError> {
        let mut kept = Vec::with_capacity(discovered.len());
        let mut local_lacking_caps = false;

        for candidate in discovered {
            let channel = &candidate.channel;

            if !self.registry.is_enabled(&channel.id) {
                continue;
            }
            if request
                .excluded_providers
                .iter()
                .any(|p| p.eq_ignore_ascii_case(&channel.provider))
            {
                continue;
            }

            let key_fp = crate::catalog::key_fingerprint(&channel.api_key);
            if !self.keys.is_valid(&channel.id, &key_fp) {
                continue;
            }
            if self.blacklist.is_blacklisted(&channel.id, &candidate.model_id) {
                continue;
            }
            if self.health.health_score(&channel.id) < self.routing.health_threshold {
                continue;
            }

            let info = self.finder.resolve_info(&candidate);

            if let Some(min_context) = request.min_context_length {
                if info.specs.context_length.unwrap_or(0) < min_context {
                    continue;
                }
            }
            if let Some(max_cost) = request.max_cost_per_1k {
                let per_1k = (info.pricing.input_price.unwrap_or(0.0)
                    + info.pricing.output_price.unwrap_or(0.0))
                    * 1000.0
                    / 2.0;
                if !info.pricing.is_free && per_1k > max_cost {
                    continue;
                }
            }

            if !request.required_capabilities.is_empty() {
                let missing: Vec<&String> = request
                    .required_capabilities
                    .iter()
                    .filter(|cap| !info.capabilities.supports(cap))
                    .collect();
                if !missing.is_empty() {
                    if self.candidate_is_local(&candidate, &info) {
                        local_lacking_caps = true;
                    }
                    continue;
                }
            }

            kept.push((candidate, info));
        }

        // Cloud-substitute search: every match was a local model missing the
        // capability, so look for cloud models that advertise it.
        if kept.is_empty() && local_lacking_caps {
            kept = self.cloud_substitutes(request);
            if !kept.is_empty() {
                tracing::info!(
                    count = kept.len(),
                    "local models lacked required capabilities; substituted cloud candidates"
                );
            }
        }

        if kept.is_empty() && !request.required_capabilities.is_empty() {
            return Err(RouteError::CapabilityMismatch {
                missing: request.required_capabilities.clone(),
            });
        }

        Ok(kept)
    }

    fn candidate_is_local(&self, candidate: &Candidate, info: &crate::catalog::ModelInfo) -> bool {
        if info.is_local {
            return true;
        }
        let provider = self.registry.get_provider(&candidate.channel.provider);
        if provider.as_ref().is_some_and(|p| p.local) {
            return true;
        }
        let url = candidate
            .channel
            .base_url
            .clone()
            .or_else(|| provider.map(|p| p.primary_url().to_string()))
            .unwrap_or_default();
        is_local_url(&url)
    }

    /// Up to three cloud (channel, model) pairs advertising every required
    /// capability, from anywhere in the catalog.
    fn cloud_substitutes(
        &self,
        request: &RoutingRequest,
    ) -> Vec<(Candidate, crate::catalog::ModelInfo)> {
        let mut out = Vec::new();
        for snapshot in self.catalog.iter_snapshots() {
            let Some(channel) = self.registry.get_channel(&snapshot.channel_id) else { continue };
            if !self.registry.is_enabled(&channel.id) {
                continue;
            }
            for model_id in &snapshot.models {
                let candidate =
                    Candidate { channel: Arc::clone(&channel), model_id: model_id.clone() };
                let info = self.finder.resolve_info(&candidate);
                if self.candidate_is_local(&candidate, &info) {
                    continue;
                }
                let supports_all = request
                    .required_capabilities
                    .iter()
                    .all(|cap| info.capabilities.supports(cap));
                if supports_all && !self.blacklist.is_blacklisted(&channel.id, model_id) {
                    out.push((candidate, info));
                    if out.len() >= 3 {
                        return out;
                    }
                }
            }
        }
        out
    }
}
