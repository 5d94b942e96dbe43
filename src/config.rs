//! Configuration types for lm-router.
//!
//! Config is loaded once at startup from a YAML (or JSON) file and validated
//! before the server opens any ports. Invalid configs are rejected with a
//! clear error rather than silently falling back to defaults. `${VAR}` /
//! `${VAR:default}` references are expanded from the environment before
//! parsing, so secrets stay out of the file itself.
//!
//! # Example
//! ```yaml
//! server:
//!   port: 8080
//!
//! providers:
//!   openrouter:
//!     base_url: https://openrouter.ai/api
//!     kind: openrouter
//!     auth: bearer
//!
//! channels:
//!   - id: or-main
//!     provider: openrouter
//!     model_name: auto
//!     api_key: ${OPENROUTER_KEY}
//!     priority: 2
//!
//! routing:
//!   default_strategy: balanced
//!
//! tasks:
//!   model_discovery:
//!     interval_secs: 21600
//!     run_on_startup: true
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Which API protocol an upstream provider speaks.
///
/// lm-router normalises all caller traffic to OpenAI's chat-completions
/// schema; each [`ProviderKind`] maps to an adapter that handles any
/// request/response translation at the edge.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Standard OpenAI `/v1/chat/completions` protocol.
    /// Also used by LM Studio, vLLM, LocalAI, Ollama's compat endpoint, …
    #[default]
    OpenAI,
    /// OpenRouter — OpenAI-compatible wire format, kept distinct so the
    /// adapter can inject `provider: {sort: "price"}` for cost-centric
    /// strategies and the `HTTP-Referer`/`X-Title` headers.
    OpenRouter,
    /// Anthropic Messages API (`/v1/messages`); request and response shapes
    /// are translated to/from the OpenAI schema.
    Anthropic,
    /// SiliconFlow — OpenAI wire protocol; pricing comes from the scraped
    /// pricing task rather than the models endpoint.
    Siliconflow,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAI => "openai",
            Self::OpenRouter => "openrouter",
            Self::Anthropic => "anthropic",
            Self::Siliconflow => "siliconflow",
        })
    }
}

/// How credentials are attached to upstream requests.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`.
    #[default]
    Bearer,
    /// `x-api-key: <key>` (Anthropic style).
    ApiKey,
    /// A vendor-specific header named by [`Provider::auth_header`].
    Header,
}

/// One upstream vendor family: endpoint(s), auth mode, adapter kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Provider {
    /// Base URL, or a list tried in order when the first is unreachable.
    #[serde(alias = "base_urls")]
    pub base_url: BaseUrls,

    /// Protocol adapter for this provider (default: openai-compatible).
    #[serde(default)]
    pub kind: ProviderKind,

    /// Credential attachment scheme (default: bearer).
    #[serde(default)]
    pub auth: AuthScheme,

    /// Header name used when `auth = header`.
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Treat every channel of this provider as local (LAN inference box
    /// behind a non-loopback hostname, for instance).
    #[serde(default)]
    pub local: bool,

    /// Model-id substrings that force `is_free` on the resolved info.
    #[serde(default)]
    pub free_model_patterns: Vec<String>,

    /// Provider-wide [`ModelOverride`] applied after the base layer.
    #[serde(default)]
    pub overrides: Option<ModelOverride>,
}

impl Provider {
    /// Primary endpoint — first entry of the fallback list.
    pub fn primary_url(&self) -> &str {
        self.base_url.first()
    }
}

#[cfg(test)]
impl Provider {
    /// Minimal openai-compatible provider for unit tests.
    pub fn for_tests(base_url: &str) -> Self {
        Self {
            base_url: BaseUrls::One(base_url.to_string()),
            kind: ProviderKind::OpenAI,
            auth: AuthScheme::Bearer,
            auth_header: None,
            local: false,
            free_model_patterns: Vec::new(),
            overrides: None,
        }
    }
}

/// One endpoint or an ordered fallback list; accepts a bare string in config.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BaseUrls {
    One(String),
    Many(Vec<String>),
}

impl BaseUrls {
    pub fn first(&self) -> &str {
        match self {
            Self::One(u) => u,
            Self::Many(v) => v.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn all(&self) -> Vec<&str> {
        match self {
            Self::One(u) => vec![u.as_str()],
            Self::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// A routable endpoint: one (provider, model hint, credential) triple.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Channel {
    /// Unique channel id, e.g. `or-main`, `local-ollama`.
    pub id: String,

    /// Human-readable name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// Provider this channel dispatches through (must exist in `providers`).
    pub provider: String,

    /// Declared model, or `auto` to rely entirely on discovery.
    #[serde(default = "defaults::auto_model")]
    pub model_name: String,

    /// Credential. A channel whose key expands to empty is disabled at load.
    #[serde(default)]
    pub api_key: String,

    /// Per-channel base-URL override (e.g. a regional endpoint).
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Lower value = preferred in the cheap pre-filter (default: 1).
    #[serde(default = "defaults::priority")]
    pub priority: i32,

    /// Static tags that always match this channel's models.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Fallback model list consulted when discovery finds nothing.
    #[serde(default)]
    pub configured_models: Vec<String>,

    /// Alias → physical-model-id mapping; enriches tag matching and lets
    /// callers use channel-local short names.
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,

    /// Channel-level override layer (applied after provider overrides).
    #[serde(default)]
    pub overrides: Option<ChannelOverrides>,

    /// Unknown keys are preserved but never influence routing.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Channel {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
impl Channel {
    /// Minimal channel for unit tests — enabled, keyed, priority 1.
    pub fn for_tests(id: &str, provider: &str, model_name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            provider: provider.to_string(),
            model_name: model_name.to_string(),
            api_key: "sk-test".to_string(),
            base_url: None,
            enabled: true,
            priority: 1,
            tags: Vec::new(),
            configured_models: Vec::new(),
            model_aliases: HashMap::new(),
            overrides: None,
            extra: HashMap::new(),
        }
    }
}

/// Channel-level overrides: a channel-wide entry plus per-model entries.
/// Per-model entries win over the channel-wide default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChannelOverrides {
    #[serde(default)]
    pub default: Option<ModelOverride>,

    #[serde(default)]
    pub models: HashMap<String, ModelOverride>,
}

/// One override layer. Every field is optional; unset fields leave the
/// underlying layer untouched. `price_multiplier` scales whatever prices the
/// lower layers resolved to (discount channels).
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ModelOverride {
    #[serde(default)]
    pub input_price: Option<f64>,
    #[serde(default)]
    pub output_price: Option<f64>,
    #[serde(default)]
    pub price_multiplier: Option<f64>,
    #[serde(default)]
    pub is_free: Option<bool>,
    #[serde(default)]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub is_local: Option<bool>,
    /// Parameter count in millions.
    #[serde(default)]
    pub parameter_count: Option<u64>,
    #[serde(default)]
    pub context_length: Option<u64>,
    #[serde(default)]
    pub supports_vision: Option<bool>,
    #[serde(default)]
    pub supports_function_calling: Option<bool>,
    #[serde(default)]
    pub supports_streaming: Option<bool>,
    #[serde(default)]
    pub supports_code: Option<bool>,
}

/// One weighted rule of a sorting strategy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StrategyRule {
    /// Factor name: `cost_score`, `speed_score`, `quality_score`,
    /// `reliability_score`, `parameter_score`, `context_score`,
    /// `free_score`, `local_score`.
    pub field: String,

    #[serde(default = "defaults::weight")]
    pub weight: f64,

    /// `desc` (default) uses the score as-is; `asc` inverts it.
    #[serde(default = "defaults::order")]
    pub order: String,
}

/// Routing knobs: default strategy, custom strategies, cache/retry bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default = "defaults::default_strategy")]
    pub default_strategy: String,

    /// Named custom strategies; names shadow the built-in presets.
    #[serde(default)]
    pub strategies: HashMap<String, Vec<StrategyRule>>,

    /// Upper bound on dispatch attempts per request (default: 3).
    #[serde(default = "defaults::max_retry_attempts")]
    pub max_retry_attempts: usize,

    /// Request-cache TTL in seconds (default: 60).
    #[serde(default = "defaults::cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Request-cache capacity (default: 1000).
    #[serde(default = "defaults::cache_max_entries")]
    pub cache_max_entries: usize,

    /// Candidate count above which the cheap pre-filter kicks in (default: 20).
    #[serde(default = "defaults::pre_filter_threshold")]
    pub pre_filter_threshold: usize,

    /// Channels whose health score drops below this are filtered out
    /// (default: 0.3).
    #[serde(default = "defaults::health_threshold")]
    pub health_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: defaults::default_strategy(),
            strategies: HashMap::new(),
            max_retry_attempts: defaults::max_retry_attempts(),
            cache_ttl_secs: defaults::cache_ttl_secs(),
            cache_max_entries: defaults::cache_max_entries(),
            pre_filter_threshold: defaults::pre_filter_threshold(),
            health_threshold: defaults::health_threshold(),
        }
    }
}

/// Per-task schedule entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Seconds between runs. Each built-in task has its own default.
    #[serde(default)]
    pub interval_secs: Option<u64>,

    #[serde(default)]
    pub run_on_startup: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { enabled: true, interval_secs: None, run_on_startup: false }
    }
}

/// Background task schedules.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TasksConfig {
    #[serde(default)]
    pub model_discovery: TaskConfig,
    #[serde(default)]
    pub pricing_refresh: TaskConfig,
    #[serde(default)]
    pub health_check: TaskConfig,
    #[serde(default)]
    pub key_validation: TaskConfig,
    #[serde(default)]
    pub cache_cleanup: TaskConfig,
}

/// HTTP server + process-level settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Log level override (also controlled by `RUST_LOG`).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Environment variable names whose values are accepted caller Bearer
    /// tokens. Empty list disables caller auth.
    #[serde(default)]
    pub client_keys_env: Vec<String>,

    /// Maximum requests per minute per caller. Unset/0 disables limiting.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// End-to-end request timeout in seconds (default: 300).
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Upstream connect timeout in seconds (default: 10).
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Health-probe timeout in seconds (default: 15).
    #[serde(default = "defaults::health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// Model-discovery timeout in seconds (default: 30).
    #[serde(default = "defaults::discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,

    /// Directory for best-effort snapshot persistence (default: `cache`).
    #[serde(default = "defaults::cache_dir")]
    pub cache_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            log_level: None,
            client_keys_env: Vec::new(),
            rate_limit_rpm: None,
            request_timeout_secs: defaults::request_timeout_secs(),
            connect_timeout_secs: defaults::connect_timeout_secs(),
            health_timeout_secs: defaults::health_timeout_secs(),
            discovery_timeout_secs: defaults::discovery_timeout_secs(),
            cache_dir: defaults::cache_dir(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub providers: HashMap<String, Provider>,

    #[serde(default)]
    pub channels: Vec<Channel>,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub tasks: TasksConfig,
}

/// Factor names a strategy rule may reference.
pub const STRATEGY_FIELDS: &[&str] = &[
    "cost_score",
    "speed_score",
    "quality_score",
    "reliability_score",
    "parameter_score",
    "context_score",
    "free_score",
    "local_score",
];

impl Config {
    /// Load, interpolate environment variables, parse, validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let expanded = interpolate_env(&raw);

        let mut config: Self = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&expanded).context("parsing config JSON")?
        } else {
            serde_yaml::from_str(&expanded).context("parsing config YAML")?
        };

        config.apply_load_rules();
        config.validate()?;
        Ok(config)
    }

    /// Parse from an already-read string (YAML); used by tests and tooling.
    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let mut config: Self =
            serde_yaml::from_str(&interpolate_env(raw)).context("parsing config YAML")?;
        config.apply_load_rules();
        config.validate()?;
        Ok(config)
    }

    /// Rules applied mechanically at load time, before validation.
    fn apply_load_rules(&mut self) {
        for channel in &mut self.channels {
            // A channel with no credential cannot dispatch — treat as disabled.
            if channel.api_key.trim().is_empty() {
                channel.enabled = false;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for channel in &self.channels {
            anyhow::ensure!(
                self.providers.contains_key(&channel.provider),
                "channel `{}` references unknown provider `{}`",
                channel.id,
                channel.provider
            );
        }

        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            anyhow::ensure!(
                seen.insert(channel.id.as_str()),
                "duplicate channel id `{}`",
                channel.id
            );
        }

        for (name, rules) in &self.routing.strategies {
            anyhow::ensure!(!rules.is_empty(), "strategy `{name}` has no rules");
            for rule in rules {
                anyhow::ensure!(
                    STRATEGY_FIELDS.contains(&rule.field.as_str()),
                    "strategy `{}` references unknown factor `{}`",
                    name,
                    rule.field
                );
                anyhow::ensure!(
                    rule.order == "asc" || rule.order == "desc",
                    "strategy `{}` rule `{}` has invalid order `{}` (want asc|desc)",
                    name,
                    rule.field,
                    rule.order
                );
                anyhow::ensure!(
                    rule.weight >= 0.0,
                    "strategy `{}` rule `{}` has negative weight",
                    name,
                    rule.field
                );
            }
        }

        for (task, cfg) in [
            ("model_discovery", &self.tasks.model_discovery),
            ("pricing_refresh", &self.tasks.pricing_refresh),
            ("health_check", &self.tasks.health_check),
            ("key_validation", &self.tasks.key_validation),
            ("cache_cleanup", &self.tasks.cache_cleanup),
        ] {
            if let Some(interval) = cfg.interval_secs {
                anyhow::ensure!(interval > 0, "task `{task}` interval must be positive");
            }
        }

        Ok(())
    }

    /// Resolve the accepted caller tokens from the environment.
    pub fn client_tokens(&self) -> Vec<String> {
        self.server
            .client_keys_env
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Expand `${VAR}` and `${VAR:default}` references from the environment.
///
/// Unset variables without a default expand to the empty string — combined
/// with the load rules this is what disables a channel whose key is missing.
pub fn interpolate_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let expr = &after[..end];
                let (var, default) = match expr.split_once(':') {
                    Some((v, d)) => (v, Some(d)),
                    None => (expr, None),
                };
                match std::env::var(var) {
                    Ok(val) if !val.is_empty() => out.push_str(&val),
                    _ => out.push_str(default.unwrap_or("")),
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated `${` — keep the text verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

mod defaults {
    pub fn auto_model() -> String { "auto".into() }
    pub fn enabled() -> bool { true }
    pub fn priority() -> i32 { 1 }
    pub fn weight() -> f64 { 1.0 }
    pub fn order() -> String { "desc".into() }
    pub fn default_strategy() -> String { "balanced".into() }
    pub fn max_retry_attempts() -> usize { 3 }
    pub fn cache_ttl_secs() -> u64 { 60 }
    pub fn cache_max_entries() -> usize { 1000 }
    pub fn pre_filter_threshold() -> usize { 20 }
    pub fn health_threshold() -> f64 { 0.3 }
    pub fn port() -> u16 { 8080 }
    pub fn request_timeout_secs() -> u64 { 300 }
    pub fn connect_timeout_secs() -> u64 { 10 }
    pub fn health_timeout_secs() -> u64 { 15 }
    pub fn discovery_timeout_secs() -> u64 { 30 }
    pub fn cache_dir() -> String { "cache".into() }
}
