//! Background task scheduler and the built-in maintenance tasks.
//!
//! A single loop ticks (1 Hz in production) over a registry of tasks, each
//! with an interval, an `enabled` flag, and an optional run-on-start. Due
//! tasks are spawned fire-and-forget so a slow discovery sweep can never
//! stall the loop, and every outcome lands in per-task stats surfaced via
//! `/health`. A task that fails only bumps its own error counter — the loop
//! and its siblings are unaffected.
//!
//! Built-ins:
//!
//! | task             | default interval | action |
//! |------------------|------------------|--------|
//! | model_discovery  | 6 h   | fetch each channel's models endpoint, rebuild snapshots |
//! | pricing_refresh  | 12 h  | re-pull pricing sources, merge, flush request cache |
//! | health_check     | 30 m  | minimal chat probe per channel, update health state |
//! | key_validation   | 6 h   | credential probe per key, backoff on failure |
//! | cache_cleanup    | 24 h  | delete snapshot files older than 7 days |
//!
//! Outbound probes inside a task are bounded to [`PROBE_CONCURRENCY`]
//! in-flight requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::adapters::select_adapter;
use crate::catalog::{key_fingerprint, infer_user_tier, ModelInfo, ModelSnapshot};
use crate::config::{Config, ProviderKind, TaskConfig};
use crate::routing::Router;
use crate::store::SnapshotStore;

/// Maximum concurrent outbound probes per task run.
const PROBE_CONCURRENCY: usize = 8;

/// Snapshot-file retention for the cleanup task.
const SNAPSHOT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub runs: u64,
    pub successes: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub last_run_at: Option<chrono::DateTime<Utc>>,
}

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct TaskSpec {
    pub name: &'static str,
    pub interval: Duration,
    pub run_on_start: bool,
    pub enabled: bool,
    runner: TaskFn,
}

impl TaskSpec {
    pub fn new(
        name: &'static str,
        interval: Duration,
        run_on_start: bool,
        enabled: bool,
        runner: TaskFn,
    ) -> Self {
        Self { name, interval, run_on_start, enabled, runner }
    }
}

pub struct Scheduler {
    tick: Duration,
    tasks: Vec<TaskSpec>,
    stats: Arc<DashMap<String, TaskStats>>,
}

impl Scheduler {
    /// Production scheduler: built-in tasks wired to the shared components,
    /// intervals/flags from config.
    pub fn new(ctx: Arc<TaskContext>, config: &Config) -> Self {
        let spec = |name: &'static str,
                    cfg: &TaskConfig,
                    default_secs: u64,
                    runner: TaskFn| {
            TaskSpec::new(
                name,
                Duration::from_secs(cfg.interval_secs.unwrap_or(default_secs)),
                cfg.run_on_startup,
                cfg.enabled,
                runner,
            )
        };

        let tasks = vec![
            spec("model_discovery", &config.tasks.model_discovery, 6 * 3600, {
                let ctx = Arc::clone(&ctx);
                Arc::new(move || {
                    let ctx = Arc::clone(&ctx);
                    Box::pin(async move { ctx.model_discovery().await })
                })
            }),
            spec("pricing_refresh", &config.tasks.pricing_refresh, 12 * 3600, {
                let ctx = Arc::clone(&ctx);
                Arc::new(move || {
                    let ctx = Arc::clone(&ctx);
                    Box::pin(async move { ctx.pricing_refresh().await })
                })
            }),
            spec("health_check", &config.tasks.health_check, 30 * 60, {
                let ctx = Arc::clone(&ctx);
                Arc::new(move || {
                    let ctx = Arc::clone(&ctx);
                    Box::pin(async move { ctx.health_check().await })
                })
            }),
            spec("key_validation", &config.tasks.key_validation, 6 * 3600, {
                let ctx = Arc::clone(&ctx);
                Arc::new(move || {
                    let ctx = Arc::clone(&ctx);
                    Box::pin(async move { ctx.key_validation().await })
                })
            }),
            spec("cache_cleanup", &config.tasks.cache_cleanup, 24 * 3600, {
                let ctx = Arc::clone(&ctx);
                Arc::new(move || {
                    let ctx = Arc::clone(&ctx);
                    Box::pin(async move { ctx.cache_cleanup().await })
                })
            }),
        ];

        Self { tick: Duration::from_secs(1), tasks, stats: Arc::new(DashMap::new()) }
    }

    #[cfg(test)]
    pub fn for_tests(tick: Duration, tasks: Vec<TaskSpec>) -> Self {
        Self { tick, tasks, stats: Arc::new(DashMap::new()) }
    }

    /// Shared stats handle for the health endpoint.
    pub fn stats_handle(&self) -> Arc<DashMap<String, TaskStats>> {
        Arc::clone(&self.stats)
    }

    /// The tick loop. Runs until the owning task is dropped.
    pub async fn run(self) {
        let now = Instant::now();
        let mut next_run: Vec<Option<Instant>> = self
            .tasks
            .iter()
            .map(|t| {
                if !t.enabled {
                    return None;
                }
                Some(if t.run_on_start { now } else { now + t.interval })
            })
            .collect();

        info!(
            tasks = self.tasks.iter().filter(|t| t.enabled).count(),
            "scheduler started"
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let now = Instant::now();

            for (i, task) in self.tasks.iter().enumerate() {
                let Some(due) = next_run[i] else { continue };
                if due > now {
                    continue;
                }
                next_run[i] = Some(now + task.interval);

                let name = task.name;
                let runner = Arc::clone(&task.runner);
                let stats = Arc::clone(&self.stats);
                // Fire and forget with result capture — long tasks never
                // stall the tick loop.
                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = runner().await;
                    let elapsed = started.elapsed().as_millis() as u64;

                    let mut entry = stats.entry(name.to_string()).or_default();
                    entry.runs += 1;
                    entry.last_duration_ms = Some(elapsed);
                    entry.last_run_at = Some(Utc::now());
                    match result {
                        Ok(()) => {
                            entry.successes += 1;
                            entry.last_error = None;
                            debug!(task = name, elapsed_ms = elapsed, "task completed");
                        }
                        Err(e) => {
                            entry.errors += 1;
                            entry.last_error = Some(e.to_string());
                            warn!(task = name, error = %e, "task failed");
                        }
                    }
                });
            }
        }
    }
}

/// Shared components the built-in tasks operate on.
pub struct TaskContext {
    pub router: Arc<Router>,
    pub store: Arc<SnapshotStore>,
    pub client: reqwest::Client,
    pub discovery_timeout: Duration,
    pub health_timeout: Duration,
}

impl TaskContext {
    pub fn new(router: Arc<Router>, store: Arc<SnapshotStore>, config: &Config) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.server.connect_timeout_secs))
            .build()
            .expect("failed to build scheduler http client");
        Arc::new(Self {
            router,
            store,
            client,
            discovery_timeout: Duration::from_secs(config.server.discovery_timeout_secs),
            health_timeout: Duration::from_secs(config.server.health_timeout_secs),
        })
    }

    // -- model discovery ----------------------------------------------------

    pub async fn model_discovery(&self) -> anyhow::Result<()> {
        let channels = self.router.registry.get_enabled();
        info!(channels = channels.len(), "model discovery sweep");

        futures_util::stream::iter(channels)
            .for_each_concurrent(PROBE_CONCURRENCY, |channel| async move {
                if let Err(e) = self.discover_channel(&channel).await {
                    warn!(channel = %channel.id, error = %e, "discovery failed");
                }
            })
            .await;
        Ok(())
    }

    async fn discover_channel(&self, channel: &crate::config::Channel) -> anyhow::Result<()> {
        let registry = &self.router.registry;
        let provider = registry
            .get_provider(&channel.provider)
            .ok_or_else(|| anyhow::anyhow!("unknown provider `{}`", channel.provider))?;
        let base_url = channel
            .base_url
            .clone()
            .unwrap_or_else(|| provider.primary_url().to_string());
        let adapter = select_adapter(provider.kind, &base_url);
        let fp = key_fingerprint(&channel.api_key);

        let mut headers = reqwest::header::HeaderMap::new();
        adapter.auth_headers(&provider, &channel.api_key, &mut headers);

        let response = self
            .client
            .get(adapter.models_endpoint(&base_url))
            .headers(headers)
            .timeout(self.discovery_timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            self.router.keys.mark_invalid(&channel.id, &fp, "auth_invalid");
            anyhow::bail!("credentials rejected (HTTP {status})");
        }
        anyhow::ensure!((200..300).contains(&status), "models endpoint returned HTTP {status}");

        let raw: Value = response.json().await?;
        let (mut models, info) = parse_models_response(&raw);
        if models.is_empty() && !channel.configured_models.is_empty() {
            models = channel.configured_models.clone();
        }
        anyhow::ensure!(!models.is_empty(), "models endpoint returned an empty list");

        let tier = infer_user_tier(&models);
        debug!(channel = %channel.id, models = models.len(), ?tier, "discovered models");

        let snapshot = ModelSnapshot::new(&channel.id, &fp, models)
            .with_info(info)
            .with_raw(raw);
        if let Err(e) = self.store.save_snapshot(&snapshot) {
            warn!(channel = %channel.id, error = %e, "snapshot persist failed");
        }
        let _ = self.store.save_mapping(&channel.id, &[fp.clone()]);
        self.router.catalog.insert_snapshot(snapshot);

        self.router.keys.mark_valid(&channel.id, &fp);
        self.router.blacklist.clear_auth_entries(&channel.id);
        // Snapshot contents changed materially — cached selections for this
        // channel may now point at models that no longer exist.
        self.router.cache.invalidate_channel(&channel.id);
        Ok(())
    }

    // -- pricing refresh ----------------------------------------------------

    pub async fn pricing_refresh(&self) -> anyhow::Result<()> {
        let channels: Vec<_> = self
            .router
            .registry
            .get_enabled()
            .into_iter()
            .filter(|c| {
                self.router
                    .registry
                    .get_provider(&c.provider)
                    .is_some_and(|p| {
                        matches!(p.kind, ProviderKind::OpenRouter | ProviderKind::Siliconflow)
                    })
            })
            .collect();

        let mut merged: HashMap<String, Value> = HashMap::new();

        for channel in channels {
            match self.fetch_pricing(&channel).await {
                Ok(pricing) => {
                    for (model, entry) in pricing {
                        self.router.catalog.apply_pricing(
                            &channel.id,
                            &model,
                            entry.0,
                            entry.1,
                            Some(entry.2),
                        );
                        merged.insert(
                            format!("{}:{model}", channel.id),
                            json!({ "input": entry.0, "output": entry.1, "is_free": entry.2 }),
                        );
                    }
                }
                Err(e) => warn!(channel = %channel.id, error = %e, "pricing refresh failed"),
            }
        }

        if !merged.is_empty() {
            let _ = self.store.save_pricing("merged", &json!(merged));
        }
        // Conservative scope: pricing feeds every cost score, flush it all.
        self.router.cache.invalidate_all();
        Ok(())
    }

    async fn fetch_pricing(
        &self,
        channel: &crate::config::Channel,
    ) -> anyhow::Result<HashMap<String, (Option<f64>, Option<f64>, bool)>> {
        let provider = self
            .router
            .registry
            .get_provider(&channel.provider)
            .ok_or_else(|| anyhow::anyhow!("unknown provider"))?;
        let base_url = channel
            .base_url
            .clone()
            .unwrap_or_else(|| provider.primary_url().to_string());
        let adapter = select_adapter(provider.kind, &base_url);

        let mut headers = reqwest::header::HeaderMap::new();
        adapter.auth_headers(&provider, &channel.api_key, &mut headers);

        let raw: Value = self
            .client
            .get(adapter.models_endpoint(&base_url))
            .headers(headers)
            .timeout(self.discovery_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut out = HashMap::new();
        if let Some(items) = raw["data"].as_array() {
            for item in items {
                let Some(id) = item["id"].as_str() else { continue };
                let input = price_field(&item["pricing"]["prompt"]);
                let output = price_field(&item["pricing"]["completion"]);
                let is_free = matches!((input, output), (Some(i), Some(o)) if i == 0.0 && o == 0.0);
                if input.is_some() || output.is_some() {
                    out.insert(id.to_string(), (input, output, is_free));
                }
            }
        }
        Ok(out)
    }

    // -- health check -------------------------------------------------------

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let channels = self.router.registry.get_enabled();
        let results = futures_util::stream::iter(channels)
            .map(|channel| async move {
                let outcome = self.probe_channel(&channel).await;
                (channel.id.clone(), outcome)
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let report: Vec<Value> = results
            .iter()
            .map(|(id, outcome)| match outcome {
                Ok(latency_ms) => json!({ "channel": id, "ok": true, "latency_ms": latency_ms }),
                Err(e) => json!({ "channel": id, "ok": false, "error": e.to_string() }),
            })
            .collect();
        let _ = self.store.save_health("latest", &json!(report));
        Ok(())
    }

    async fn probe_channel(&self, channel: &crate::config::Channel) -> anyhow::Result<u64> {
        let Some(model) = self.probe_model(channel) else {
            anyhow::bail!("no model to probe");
        };
        let provider = self
            .router
            .registry
            .get_provider(&channel.provider)
            .ok_or_else(|| anyhow::anyhow!("unknown provider"))?;
        let base_url = channel
            .base_url
            .clone()
            .unwrap_or_else(|| provider.primary_url().to_string());
        let adapter = select_adapter(provider.kind, &base_url);

        let ctx = crate::adapters::DispatchContext {
            model: model.clone(),
            strategy: "cost_first".to_string(),
            stream: false,
            vendor_extra: serde_json::Map::new(),
        };
        let body = adapter.transform_request(
            json!({
                "model": model,
                "max_tokens": 1,
                "messages": [{ "role": "user", "content": "ping" }],
            }),
            &ctx,
        );

        let mut headers = reqwest::header::HeaderMap::new();
        adapter.auth_headers(&provider, &channel.api_key, &mut headers);

        let started = Instant::now();
        let result = self
            .client
            .post(adapter.chat_endpoint(&base_url))
            .headers(headers)
            .timeout(self.health_timeout)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                let latency = started.elapsed().as_millis() as u64;
                self.router.health.record_success(&channel.id, latency);
                Ok(latency)
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let kind = adapter.classify_error(status, "").kind().to_string();
                self.router.health.record_failure(&channel.id, &kind);
                anyhow::bail!("probe returned HTTP {status}")
            }
            Err(e) => {
                self.router.health.record_failure(&channel.id, "upstream_timeout");
                Err(e.into())
            }
        }
    }

    /// Cheapest plausible probe target: smallest known model through this
    /// channel, else the declared model.
    fn probe_model(&self, channel: &crate::config::Channel) -> Option<String> {
        if let Some(snapshot) = self.router.catalog.snapshot_for_channel(channel) {
            let smallest = snapshot
                .models
                .iter()
                .min_by_key(|m| {
                    snapshot
                        .info
                        .get(*m)
                        .and_then(|i| i.specs.parameter_count)
                        .or_else(|| crate::catalog::infer_specs(m).0)
                        .unwrap_or(u64::MAX)
                })
                .cloned();
            if smallest.is_some() {
                return smallest;
            }
        }
        (channel.model_name != "auto").then(|| channel.model_name.clone())
    }

    // -- key validation -----------------------------------------------------

    pub async fn key_validation(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let due: Vec<_> = self
            .router
            .registry
            .get_enabled()
            .into_iter()
            .filter(|c| {
                let fp = key_fingerprint(&c.api_key);
                self.router.keys.due_for_validation(&c.id, &fp, now)
            })
            .collect();

        futures_util::stream::iter(due)
            .for_each_concurrent(PROBE_CONCURRENCY, |channel| async move {
                self.validate_key(&channel).await;
            })
            .await;
        Ok(())
    }

    async fn validate_key(&self, channel: &crate::config::Channel) {
        let Some(provider) = self.router.registry.get_provider(&channel.provider) else { return };
        let base_url = channel
            .base_url
            .clone()
            .unwrap_or_else(|| provider.primary_url().to_string());
        let adapter = select_adapter(provider.kind, &base_url);
        let fp = key_fingerprint(&channel.api_key);

        let mut headers = reqwest::header::HeaderMap::new();
        adapter.auth_headers(&provider, &channel.api_key, &mut headers);

        match self
            .client
            .get(adapter.models_endpoint(&base_url))
            .headers(headers)
            .timeout(self.discovery_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                let was_invalid = !self.router.keys.is_valid(&channel.id, &fp);
                self.router.keys.mark_valid(&channel.id, &fp);
                if was_invalid {
                    info!(channel = %channel.id, key = %fp, "key recovered");
                    self.router.blacklist.clear_auth_entries(&channel.id);
                }
            }
            Ok(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
                self.router.keys.mark_invalid(&channel.id, &fp, "auth_invalid");
                warn!(channel = %channel.id, key = %fp, "key rejected");
            }
            // Transient failures do not change validity; the backoff window
            // stays where it was.
            _ => {}
        }
    }

    // -- cache cleanup ------------------------------------------------------

    pub async fn cache_cleanup(&self) -> anyhow::Result<()> {
        let store = Arc::clone(&self.store);
        let removed =
            tokio::task::spawn_blocking(move || store.cleanup_older_than(SNAPSHOT_RETENTION))
                .await?;
        debug!(removed, "cache cleanup finished");
        Ok(())
    }
}

/// Parse an OpenAI-shaped models listing, enriched with OpenRouter fields
/// (pricing, context length, modalities, supported parameters) when present.
pub fn parse_models_response(raw: &Value) -> (Vec<String>, HashMap<String, ModelInfo>) {
    let mut models = Vec::new();
    let mut infos = HashMap::new();

    let Some(items) = raw["data"].as_array() else { return (models, infos) };

    for item in items {
        let Some(id) = item["id"].as_str().filter(|s| !s.is_empty()) else { continue };
        models.push(id.to_string());

        let mut info = ModelInfo::inferred(id);
        let mut enriched = false;

        if let Some(context) = item["context_length"].as_u64() {
            info.specs.context_length = Some(context);
            enriched = true;
        }
        if let Some(input) = price_field(&item["pricing"]["prompt"]) {
            info.pricing.input_price = Some(input);
            enriched = true;
        }
        if let Some(output) = price_field(&item["pricing"]["completion"]) {
            info.pricing.output_price = Some(output);
            enriched = true;
        }
        if let (Some(i), Some(o)) = (info.pricing.input_price, info.pricing.output_price) {
            if i == 0.0 && o == 0.0 {
                info.pricing.is_free = true;
            }
        }
        if item["architecture"]["input_modalities"]
            .as_array()
            .is_some_and(|m| m.iter().any(|v| v == "image"))
        {
            info.capabilities.vision = true;
            enriched = true;
        }
        if item["supported_parameters"]
            .as_array()
            .is_some_and(|p| p.iter().any(|v| v == "tools" || v == "functions"))
        {
            info.capabilities.function_calling = true;
            enriched = true;
        }

        if enriched {
            info.data_source = crate::catalog::DataSource::Base;
        }
        infos.insert(id.to_string(), info);
    }

    (models, infos)
}

/// OpenRouter serialises prices as strings ("0.0000004"); others use numbers.
fn price_field(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::health::{HealthTracker, KeyTracker};
    use crate::registry::ChannelRegistry;
    use crate::routing::blacklist::Blacklist;
    use crate::routing::RoutingRequest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn router_for(yaml: &str) -> Arc<Router> {
        let config = Config::from_yaml(yaml).unwrap();
        Arc::new(Router::new(
            Arc::new(ChannelRegistry::new(&config)),
            Arc::new(crate::catalog::ModelCatalog::new()),
            Arc::new(Blacklist::new()),
            Arc::new(HealthTracker::new()),
            Arc::new(KeyTracker::new()),
            config.routing,
        ))
    }

    fn ctx_for(yaml: &str, store_dir: &std::path::Path) -> (Arc<TaskContext>, Arc<Router>) {
        let config = Config::from_yaml(yaml).unwrap();
        let router = router_for(yaml);
        let store = Arc::new(SnapshotStore::new(store_dir));
        (TaskContext::new(Arc::clone(&router), store, &config), router)
    }

    // -----------------------------------------------------------------------
    // parse_models_response
    // -----------------------------------------------------------------------

    #[test]
    fn parses_plain_openai_listing() {
        let raw = json!({ "object": "list", "data": [ { "id": "gpt-4o" }, { "id": "gpt-4o-mini" } ] });
        let (models, infos) = parse_models_response(&raw);
        assert_eq!(models, vec!["gpt-4o", "gpt-4o-mini"]);
        assert!(infos.contains_key("gpt-4o"));
    }

    #[test]
    fn parses_openrouter_enrichment() {
        let raw = json!({ "data": [{
            "id": "meta/llama-3-8b:free",
            "context_length": 8192,
            "pricing": { "prompt": "0", "completion": "0" },
            "architecture": { "input_modalities": ["text", "image"] },
            "supported_parameters": ["tools"],
        }]});
        let (_, infos) = parse_models_response(&raw);
        let info = &infos["meta/llama-3-8b:free"];
        assert_eq!(info.specs.context_length, Some(8192));
        assert!(info.pricing.is_free);
        assert!(info.capabilities.vision);
        assert!(info.capabilities.function_calling);
        assert_eq!(info.data_source, crate::catalog::DataSource::Base);
    }

    #[test]
    fn string_and_numeric_prices_both_parse() {
        assert_eq!(price_field(&json!("0.0000004")), Some(0.0000004));
        assert_eq!(price_field(&json!(0.5)), Some(0.5));
        assert_eq!(price_field(&json!(null)), None);
        assert_eq!(price_field(&json!("not a number")), None);
    }

    #[test]
    fn empty_or_malformed_listing_yields_nothing() {
        assert!(parse_models_response(&json!({})).0.is_empty());
        assert!(parse_models_response(&json!({ "data": "oops" })).0.is_empty());
    }

    // -----------------------------------------------------------------------
    // Model discovery end-to-end
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn discovery_populates_catalog_and_disk() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [ { "id": "gpt-4o" }, { "id": "gpt-4o-mini" } ],
            })))
            .mount(&server)
            .await;

        let yaml = format!(
            "providers:\n  p: {{ base_url: \"{}\" }}\nchannels:\n  - {{ id: c1, provider: p, model_name: auto, api_key: sk-c1 }}\n",
            server.uri()
        );
        let dir = tempfile::TempDir::new().unwrap();
        let (ctx, router) = ctx_for(&yaml, dir.path());

        ctx.model_discovery().await.unwrap();

        let snapshot = router.catalog.snapshot_any("c1").expect("snapshot stored");
        assert_eq!(snapshot.models, vec!["gpt-4o", "gpt-4o-mini"]);
        assert_eq!(ctx.store.load_snapshots().len(), 1);
        assert_eq!(
            ctx.store.load_mapping("c1").unwrap(),
            vec![key_fingerprint("sk-c1")]
        );

        // Discovered models are now routable.
        let req = RoutingRequest::from_body(&json!({ "model": "gpt-4o", "messages": [] })).unwrap();
        assert!(router.route(&req).is_ok());
    }

    #[tokio::test]
    async fn discovery_auth_failure_marks_key_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let yaml = format!(
            "providers:\n  p: {{ base_url: \"{}\" }}\nchannels:\n  - {{ id: c1, provider: p, model_name: auto, api_key: sk-bad }}\n",
            server.uri()
        );
        let dir = tempfile::TempDir::new().unwrap();
        let (ctx, router) = ctx_for(&yaml, dir.path());

        ctx.model_discovery().await.unwrap();
        assert!(!router.keys.is_valid("c1", &key_fingerprint("sk-bad")));
    }

    // -----------------------------------------------------------------------
    // Health check
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_probe_records_latency_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "pong" } }],
            })))
            .mount(&server)
            .await;

        let yaml = format!(
            "providers:\n  p: {{ base_url: \"{}\" }}\nchannels:\n  - {{ id: c1, provider: p, model_name: tiny-model, api_key: sk }}\n",
            server.uri()
        );
        let dir = tempfile::TempDir::new().unwrap();
        let (ctx, router) = ctx_for(&yaml, dir.path());

        ctx.health_check().await.unwrap();

        let health = router.health.get("c1").expect("health recorded");
        assert_eq!(health.success_count, 1);
        assert!(health.latency_ewma_ms.is_some());
    }

    #[tokio::test]
    async fn health_probe_records_failure_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let yaml = format!(
            "providers:\n  p: {{ base_url: \"{}\" }}\nchannels:\n  - {{ id: c1, provider: p, model_name: tiny-model, api_key: sk }}\n",
            server.uri()
        );
        let dir = tempfile::TempDir::new().unwrap();
        let (ctx, router) = ctx_for(&yaml, dir.path());

        ctx.health_check().await.unwrap();
        let health = router.health.get("c1").unwrap();
        assert_eq!(health.success_count, 0);
        assert_eq!(health.request_count, 1);
        assert_eq!(health.last_error.as_deref(), Some("upstream_server_error"));
    }

    #[tokio::test]
    async fn probe_model_prefers_the_smallest_cached_model() {
        let yaml = "providers:\n  p: { base_url: \"http://u\" }\nchannels:\n  - { id: c1, provider: p, model_name: auto, api_key: sk-c1 }\n";
        let dir = tempfile::TempDir::new().unwrap();
        let (ctx, router) = ctx_for(yaml, dir.path());

        router.catalog.insert_snapshot(ModelSnapshot::new(
            "c1",
            &key_fingerprint("sk-c1"),
            vec!["qwen3-32b".into(), "qwen3-4b".into(), "qwen3-8b".into()],
        ));

        let channel = router.registry.get_channel("c1").unwrap();
        assert_eq!(ctx.probe_model(&channel).as_deref(), Some("qwen3-4b"));
    }

    // -----------------------------------------------------------------------
    // Key validation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn key_recovery_clears_auth_blacklist() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let yaml = format!(
            "providers:\n  p: {{ base_url: \"{}\" }}\nchannels:\n  - {{ id: c1, provider: p, model_name: gpt-4o, api_key: sk-c1 }}\n",
            server.uri()
        );
        let dir = tempfile::TempDir::new().unwrap();
        let (ctx, router) = ctx_for(&yaml, dir.path());

        let fp = key_fingerprint("sk-c1");
        router.keys.mark_invalid("c1", &fp, "auth_invalid");
        router.blacklist.record_failure("c1", "gpt-4o", "auth_invalid");

        // Force the key to be due despite the backoff.
        let channel = router.registry.get_channel("c1").unwrap();
        ctx.validate_key(&channel).await;

        assert!(router.keys.is_valid("c1", &fp));
        assert!(!router.blacklist.is_blacklisted("c1", "gpt-4o"));
    }

    // -----------------------------------------------------------------------
    // Scheduler loop: task isolation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failing_task_does_not_stop_its_siblings() {
        let good_runs = Arc::new(AtomicU32::new(0));
        let good = Arc::clone(&good_runs);

        let tasks = vec![
            TaskSpec::new(
                "always_fails",
                Duration::from_millis(20),
                true,
                true,
                Arc::new(|| Box::pin(async { anyhow::bail!("boom") })),
            ),
            TaskSpec::new(
                "always_works",
                Duration::from_millis(20),
                true,
                true,
                Arc::new(move || {
                    let good = Arc::clone(&good);
                    Box::pin(async move {
                        good.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            ),
        ];

        let scheduler = Scheduler::for_tests(Duration::from_millis(5), tasks);
        let stats = scheduler.stats_handle();
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.abort();

        assert!(good_runs.load(Ordering::SeqCst) >= 2, "healthy task kept running");
        let failing = stats.get("always_fails").expect("stats recorded").clone();
        assert!(failing.errors >= 2, "failing task kept being scheduled");
        assert_eq!(failing.successes, 0);
        assert!(failing.last_error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn disabled_tasks_never_run() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let tasks = vec![TaskSpec::new(
            "disabled",
            Duration::from_millis(10),
            true,
            false,
            Arc::new(move || {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )];

        let scheduler = Scheduler::for_tests(Duration::from_millis(5), tasks);
        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_on_start_fires_immediately_others_wait() {
        let eager_runs = Arc::new(AtomicU32::new(0));
        let lazy_runs = Arc::new(AtomicU32::new(0));
        let eager = Arc::clone(&eager_runs);
        let lazy = Arc::clone(&lazy_runs);

        let tasks = vec![
            TaskSpec::new(
                "eager",
                Duration::from_secs(3600),
                true,
                true,
                Arc::new(move || {
                    let eager = Arc::clone(&eager);
                    Box::pin(async move {
                        eager.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            ),
            TaskSpec::new(
                "lazy",
                Duration::from_secs(3600),
                false,
                true,
                Arc::new(move || {
                    let lazy = Arc::clone(&lazy);
                    Box::pin(async move {
                        lazy.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            ),
        ];

        let scheduler = Scheduler::for_tests(Duration::from_millis(5), tasks);
        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.abort();

        assert_eq!(eager_runs.load(Ordering::SeqCst), 1);
        assert_eq!(lazy_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_task_does_not_stall_the_loop() {
        let fast_runs = Arc::new(AtomicU32::new(0));
        let fast = Arc::clone(&fast_runs);

        let tasks = vec![
            TaskSpec::new(
                "glacial",
                Duration::from_millis(10),
                true,
                true,
                Arc::new(|| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(())
                    })
                }),
            ),
            TaskSpec::new(
                "quick",
                Duration::from_millis(10),
                true,
                true,
                Arc::new(move || {
                    let fast = Arc::clone(&fast);
                    Box::pin(async move {
                        fast.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            ),
        ];

        let scheduler = Scheduler::for_tests(Duration::from_millis(5), tasks);
        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(fast_runs.load(Ordering::SeqCst) >= 3, "loop kept ticking past the slow task");
    }
}
