//! Model and pricing registry.
//!
//! Keeps, per (channel, api-key fingerprint), a snapshot of the models that
//! key can reach: the id list, per-id [`ModelInfo`], the raw upstream response
//! for debugging, and a user-tier hint. Snapshots are immutable once stored —
//! the scheduler replaces the whole `Arc` so readers see either the previous
//! snapshot or the new one, never a mix.
//!
//! [`ModelCatalog::resolve`] answers "what do we know about model M through
//! channel C" by layering:
//!
//! 1. base — the upstream snapshot, or specs inferred from the id when no
//!    snapshot exists (`7b`, `32k` literals);
//! 2. provider overrides (pricing multiplier, free patterns, local flag, …);
//! 3. channel overrides (channel-wide, then per-model — per-model wins).
//!
//! Override application never fails; unset fields leave the lower layer
//! untouched. `is_free` zeroes both prices, and the textual context form is
//! regenerated whenever the numeric one changes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{Channel, ModelOverride, Provider};

/// 8-hex-digit fingerprint of an API key. This — never the secret — is what
/// appears in cache keys, file names, and logs.
pub fn key_fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..8].to_string()
}

/// Where a resolved [`ModelInfo`]'s data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Upstream models endpoint (or pricing scrape).
    Base,
    ProviderOverride,
    ChannelOverride,
    LocalProbe,
    /// Synthesised from the model id alone.
    #[default]
    Inferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub function_calling: bool,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default = "default_true")]
    pub code: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self { vision: false, function_calling: false, streaming: true, code: true }
    }
}

impl ModelCapabilities {
    /// Does this model advertise the named capability?
    pub fn supports(&self, name: &str) -> bool {
        match name {
            "vision" => self.vision,
            "function_calling" | "tools" => self.function_calling,
            "streaming" => self.streaming,
            "code" | "code_generation" => self.code,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSpecs {
    /// Parameter count in millions (`8000` = 8 B).
    #[serde(default)]
    pub parameter_count: Option<u64>,
    #[serde(default)]
    pub context_length: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
    /// Human form of the context length (`"128k"`); regenerated whenever the
    /// numeric form is set.
    #[serde(default)]
    pub context_text: Option<String>,
}

impl ModelSpecs {
    fn regenerate_context_text(&mut self) {
        self.context_text = self.context_length.map(|c| {
            if c >= 1000 {
                format!("{}k", c / 1000)
            } else {
                c.to_string()
            }
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Dollars per input token.
    #[serde(default)]
    pub input_price: Option<f64>,
    /// Dollars per output token.
    #[serde(default)]
    pub output_price: Option<f64>,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub per_request: Option<f64>,
    #[serde(default)]
    pub per_image: Option<f64>,
}

/// Merged description of one physical model as seen through one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub specs: ModelSpecs,
    #[serde(default)]
    pub pricing: ModelPricing,
    #[serde(default = "default_quality")]
    pub quality_score: f64,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default)]
    pub data_source: DataSource,
}

fn default_quality() -> f64 {
    0.5
}

impl ModelInfo {
    /// Base info synthesised from the id alone — used when no snapshot holds
    /// the model, and as the floor under sparse upstream data.
    pub fn inferred(model_id: &str) -> Self {
        let (parameter_count, context_length) = infer_specs(model_id);
        let mut specs = ModelSpecs {
            parameter_count,
            context_length,
            max_output_tokens: None,
            context_text: None,
        };
        specs.regenerate_context_text();

        let lower = model_id.to_lowercase();
        let capabilities = ModelCapabilities {
            vision: lower.contains("vision") || lower.contains("-vl"),
            function_calling: false,
            streaming: true,
            code: true,
        };

        Self {
            model_id: model_id.to_string(),
            capabilities,
            specs,
            pricing: ModelPricing::default(),
            quality_score: 0.5,
            is_local: false,
            data_source: DataSource::Inferred,
        }
    }

    /// Apply one override layer. Missing fields are left untouched; the free
    /// flag and the context text are normalised afterwards.
    pub fn apply_override(&mut self, layer: &ModelOverride, source: DataSource) {
        if let Some(p) = layer.input_price {
            self.pricing.input_price = Some(p);
        }
        if let Some(p) = layer.output_price {
            self.pricing.output_price = Some(p);
        }
        if let Some(m) = layer.price_multiplier {
            if let Some(p) = self.pricing.input_price {
                self.pricing.input_price = Some(p * m);
            }
            if let Some(p) = self.pricing.output_price {
                self.pricing.output_price = Some(p * m);
            }
        }
        if let Some(free) = layer.is_free {
            self.pricing.is_free = free;
        }
        if let Some(q) = layer.quality_score {
            self.quality_score = q.clamp(0.0, 1.0);
        }
        if let Some(local) = layer.is_local {
            self.is_local = local;
        }
        if let Some(p) = layer.parameter_count {
            self.specs.parameter_count = Some(p);
        }
        if let Some(c) = layer.context_length {
            self.specs.context_length = Some(c);
            self.specs.regenerate_context_text();
        }
        if let Some(v) = layer.supports_vision {
            self.capabilities.vision = v;
        }
        if let Some(v) = layer.supports_function_calling {
            self.capabilities.function_calling = v;
        }
        if let Some(v) = layer.supports_streaming {
            self.capabilities.streaming = v;
        }
        if let Some(v) = layer.supports_code {
            self.capabilities.code = v;
        }

        self.normalise();
        self.data_source = source;
    }

    /// Invariant: a free model has zero prices.
    fn normalise(&mut self) {
        if self.pricing.is_free {
            self.pricing.input_price = Some(0.0);
            self.pricing.output_price = Some(0.0);
        }
    }
}

/// Heuristic user tier of an upstream account, derived from what the models
/// endpoint returned for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    #[default]
    Free,
    Pro,
    Premium,
}

/// Model-id prefixes that only show up for paying accounts.
const PAID_TIER_PREFIXES: &[&str] = &["gpt-4", "o1", "claude-3-opus", "claude-opus"];

pub fn infer_user_tier(models: &[String]) -> UserTier {
    let paid = models
        .iter()
        .filter(|m| {
            let lower = m.to_lowercase();
            PAID_TIER_PREFIXES.iter().any(|p| lower.starts_with(p) || lower.contains(&format!("/{p}")))
        })
        .count();

    if paid > 0 && models.len() > 50 {
        UserTier::Premium
    } else if paid > 0 || models.len() > 20 {
        UserTier::Pro
    } else {
        UserTier::Free
    }
}

/// One discovery result for a (channel, key) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub channel_id: String,
    pub key_fingerprint: String,
    pub models: Vec<String>,
    /// Base-layer info per model id, as reported upstream.
    #[serde(default)]
    pub info: HashMap<String, ModelInfo>,
    /// Raw upstream response, kept for debugging.
    #[serde(default)]
    pub raw: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub user_tier: UserTier,
}

impl ModelSnapshot {
    pub fn new(channel_id: &str, key_fingerprint: &str, models: Vec<String>) -> Self {
        let user_tier = infer_user_tier(&models);
        Self {
            channel_id: channel_id.to_string(),
            key_fingerprint: key_fingerprint.to_string(),
            models,
            info: HashMap::new(),
            raw: serde_json::Value::Null,
            updated_at: Utc::now(),
            user_tier,
        }
    }

    pub fn with_info(mut self, info: HashMap<String, ModelInfo>) -> Self {
        self.info = info;
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }
}

/// In-memory snapshot store partitioned by (channel id, key fingerprint).
pub struct ModelCatalog {
    snapshots: DashMap<(String, String), Arc<ModelSnapshot>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self { snapshots: DashMap::new() }
    }

    /// Store/replace the snapshot for one (channel, key) pair atomically.
    pub fn insert_snapshot(&self, snapshot: ModelSnapshot) {
        let key = (snapshot.channel_id.clone(), snapshot.key_fingerprint.clone());
        self.snapshots.insert(key, Arc::new(snapshot));
    }

    pub fn snapshot_for(&self, channel_id: &str, key_fp: &str) -> Option<Arc<ModelSnapshot>> {
        self.snapshots
            .get(&(channel_id.to_string(), key_fp.to_string()))
            .map(|e| Arc::clone(e.value()))
    }

    /// Any snapshot for the channel — used when only the channel is known.
    pub fn snapshot_any(&self, channel_id: &str) -> Option<Arc<ModelSnapshot>> {
        self.snapshots
            .iter()
            .filter(|e| e.key().0 == channel_id)
            .max_by_key(|e| e.value().updated_at)
            .map(|e| Arc::clone(e.value()))
    }

    /// Preferred snapshot for a channel: the one for the key that will be
    /// used to dispatch, falling back to any snapshot for the channel.
    pub fn snapshot_for_channel(&self, channel: &Channel) -> Option<Arc<ModelSnapshot>> {
        let fp = key_fingerprint(&channel.api_key);
        self.snapshot_for(&channel.id, &fp)
            .or_else(|| self.snapshot_any(&channel.id))
    }

    /// Every stored snapshot, for discovery sweeps.
    pub fn iter_snapshots(&self) -> Vec<Arc<ModelSnapshot>> {
        let mut all: Vec<_> = self.snapshots.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| {
            (&a.channel_id, &a.key_fingerprint).cmp(&(&b.channel_id, &b.key_fingerprint))
        });
        all
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Total distinct model ids across all snapshots.
    pub fn model_count(&self) -> usize {
        let mut ids = std::collections::HashSet::new();
        for snap in self.snapshots.iter() {
            for m in &snap.value().models {
                ids.insert(m.clone());
            }
        }
        ids.len()
    }

    /// Merge refreshed pricing into the base layer of every snapshot of a
    /// channel that knows the model. Replaces the snapshot `Arc` per the
    /// atomicity rule.
    pub fn apply_pricing(
        &self,
        channel_id: &str,
        model_id: &str,
        input_price: Option<f64>,
        output_price: Option<f64>,
        is_free: Option<bool>,
    ) {
        let keys: Vec<_> = self
            .snapshots
            .iter()
            .filter(|e| e.key().0 == channel_id && e.value().models.iter().any(|m| m == model_id))
            .map(|e| e.key().clone())
            .collect();

        for key in keys {
            if let Some(current) = self.snapshots.get(&key).map(|e| Arc::clone(e.value())) {
                let mut updated = (*current).clone();
                let entry = updated
                    .info
                    .entry(model_id.to_string())
                    .or_insert_with(|| ModelInfo::inferred(model_id));
                if let Some(p) = input_price {
                    entry.pricing.input_price = Some(p);
                }
                if let Some(p) = output_price {
                    entry.pricing.output_price = Some(p);
                }
                if let Some(free) = is_free {
                    entry.pricing.is_free = free;
                }
                entry.normalise();
                entry.data_source = DataSource::Base;
                self.snapshots.insert(key, Arc::new(updated));
            }
        }
    }

    /// Resolve the merged [`ModelInfo`] for (channel, model): base layer from
    /// the snapshot (or inference), then provider overrides, then channel
    /// overrides.
    pub fn resolve(&self, channel: &Channel, provider: &Provider, model_id: &str) -> ModelInfo {
        let mut info = self
            .snapshot_for_channel(channel)
            .and_then(|snap| snap.info.get(model_id).cloned())
            .unwrap_or_else(|| ModelInfo::inferred(model_id));

        // Fill spec holes from the id even when a snapshot exists — upstream
        // model lists rarely carry parameter counts.
        if info.specs.parameter_count.is_none() || info.specs.context_length.is_none() {
            let (params, context) = infer_specs(model_id);
            if info.specs.parameter_count.is_none() {
                info.specs.parameter_count = params;
            }
            if info.specs.context_length.is_none() {
                info.specs.context_length = context;
                info.specs.regenerate_context_text();
            }
        }

        // Provider layer.
        let lower = model_id.to_lowercase();
        if provider
            .free_model_patterns
            .iter()
            .any(|p| !p.is_empty() && lower.contains(&p.to_lowercase()))
        {
            info.pricing.is_free = true;
            info.normalise();
            info.data_source = DataSource::ProviderOverride;
        }
        if provider.local {
            info.is_local = true;
        }
        if let Some(layer) = &provider.overrides {
            info.apply_override(layer, DataSource::ProviderOverride);
        }

        // Channel layer: channel-wide default first, per-model entry wins.
        if let Some(overrides) = &channel.overrides {
            if let Some(layer) = &overrides.default {
                info.apply_override(layer, DataSource::ChannelOverride);
            }
            if let Some(layer) = overrides.models.get(model_id) {
                info.apply_override(layer, DataSource::ChannelOverride);
            }
        }

        info.normalise();
        info
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Name-based spec inference
// ──────────────────────────────────────────────────────────────────────────────

/// Model families whose parameter counts are public knowledge but absent from
/// their ids. Values in billions.
const KNOWN_PARAMS: &[(&str, f64)] = &[
    ("gpt-3.5", 20.0),
    ("gpt-4", 1760.0),
    ("claude-3-haiku", 20.0),
    ("claude-3-sonnet", 70.0),
    ("claude-3-opus", 175.0),
    ("gemini-pro", 70.0),
    ("gemini-ultra", 540.0),
];

/// Infer (parameter count in millions, context length) from id literals like
/// `qwen3-8b` or `yi-34b-200k`.
pub fn infer_specs(model_id: &str) -> (Option<u64>, Option<u64>) {
    let lower = model_id.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(['/', ':', '@', '-', '_', '.', ' '])
        .filter(|t| !t.is_empty())
        .collect();

    let mut params_millions: Option<u64> = None;
    let mut context: Option<u64> = None;

    for token in &tokens {
        if let Some(billions) = parse_param_token(token) {
            // Plausibility window: 1 M to 10 T parameters.
            if (0.001..=10_000.0).contains(&billions) && params_millions.is_none() {
                params_millions = Some((billions * 1000.0).round() as u64);
            }
            continue;
        }
        if context.is_none() {
            if let Some(ctx) = parse_context_token(token) {
                context = Some(ctx);
            }
        }
    }

    if params_millions.is_none() {
        for (name, billions) in KNOWN_PARAMS {
            if lower.contains(name) {
                params_millions = Some((billions * 1000.0).round() as u64);
                break;
            }
        }
    }

    (params_millions, context)
}

/// `8b` → 8.0, `270m` → 0.27, `1.5t` → 1500.0 (billions). Bare-unit tokens
/// only — `8b` matches, `b8` and `gpt4` do not.
fn parse_param_token(token: &str) -> Option<f64> {
    let unit = token.chars().last()?;
    if !unit.is_ascii_alphabetic() {
        return None;
    }
    let number = &token[..token.len() - 1];
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    match unit {
        'b' | 'g' => Some(value),
        'm' => Some(value / 1000.0),
        't' => Some(value * 1000.0),
        _ => None,
    }
}

/// `128k` → 128 000, `200k` → 200 000. Values below 4k are assumed to be
/// parameter-ish noise, not context windows.
fn parse_context_token(token: &str) -> Option<u64> {
    let stripped = token.strip_suffix('k')?;
    if stripped.is_empty() || !stripped.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: u64 = stripped.parse().ok()?;
    if value >= 4 {
        Some(value * 1000)
    } else {
        None
    }
}
