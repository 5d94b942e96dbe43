//! Scoring and ranking of discovered candidates.
//!
//! Eight factor scores in [0, 1] feed two outputs:
//!
//! - a **weighted total** under the active strategy — kept for logs and the
//!   selection reason string, not for ordering;
//! - a **hierarchical bucket** — each factor quantised to 0–9 and composed
//!   into a six-digit integer in the fixed order cost, context, parameter,
//!   speed, quality, reliability. The bucket is the primary sort key, so a
//!   strategy that pushes cost to the top never trades it away for
//!   micro-gains in lower digits. Equal buckets tie-break on channel name.
//!
//! Above a configured candidate count a cheap pre-filter (free / priority /
//! local / enabled) trims the field before full scoring. It is deterministic;
//! an already free, local or high-priority winner cannot be displaced by it.

use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::catalog::ModelInfo;
use crate::config::{RoutingConfig, StrategyRule};
use crate::health::HealthTracker;
use crate::registry::ChannelRegistry;
use crate::routing::discovery::Candidate;
use crate::routing::RoutingRequest;

/// Cost ceiling for normalisation: a $0.05 request scores 0.
const MAX_COST_DOLLARS: f64 = 0.05;

/// Per-token price at or below which a model counts as free.
const FREE_PRICE_EPSILON: f64 = 5e-7;

/// Output-token assumption when the caller did not set `max_tokens`.
const DEFAULT_OUTPUT_TOKENS: u64 = 1000;

/// All eight factor scores plus the two derived orderings.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub cost: f64,
    pub speed: f64,
    pub quality: f64,
    pub reliability: f64,
    pub parameter: f64,
    pub context: f64,
    pub free: f64,
    pub local: f64,
    /// Weighted total under the active strategy (logging/UX only).
    pub total: f64,
    /// Six-digit hierarchical sort key.
    pub bucket: u32,
}

impl ScoreBreakdown {
    /// Compose the six-digit bucket: cost, context, parameter, speed,
    /// quality, reliability — most significant first.
    fn bucket_of(&self) -> u32 {
        let tier = |s: f64| -> u32 { ((s * 9.0) as u32).min(9) };
        tier(self.cost) * 100_000
            + tier(self.context) * 10_000
            + tier(self.parameter) * 1_000
            + tier(self.speed) * 100
            + tier(self.quality) * 10
            + tier(self.reliability)
    }

    /// One-line reason string for the selection cache and response headers.
    pub fn reason(&self) -> String {
        format!(
            "cost:{:.2} speed:{:.2} quality:{:.2} reliability:{:.2} bucket:{:06}",
            self.cost, self.speed, self.quality, self.reliability, self.bucket
        )
    }
}

/// A candidate with its resolved info and scores, in final rank order.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub info: ModelInfo,
    pub scores: ScoreBreakdown,
    /// Estimated dollar cost of this request on this candidate.
    pub estimated_cost: f64,
}

/// Built-in strategy presets.
fn preset(name: &str) -> Option<Vec<StrategyRule>> {
    let rule = |field: &str, weight: f64| StrategyRule {
        field: field.to_string(),
        weight,
        order: "desc".to_string(),
    };
    let rules = match name {
        "cost_first" => vec![
            rule("cost_score", 0.4),
            rule("parameter_score", 0.25),
            rule("context_score", 0.2),
            rule("speed_score", 0.15),
        ],
        "free_first" => vec![
            rule("free_score", 0.5),
            rule("cost_score", 0.3),
            rule("speed_score", 0.15),
            rule("reliability_score", 0.05),
        ],
        "local_first" => vec![
            rule("local_score", 0.6),
            rule("speed_score", 0.25),
            rule("cost_score", 0.1),
            rule("reliability_score", 0.05),
        ],
        "cost_optimized" => vec![
            rule("cost_score", 0.7),
            rule("reliability_score", 0.2),
            rule("speed_score", 0.1),
        ],
        "speed_optimized" => vec![
            rule("speed_score", 0.4),
            rule("cost_score", 0.3),
            rule("parameter_score", 0.2),
            rule("context_score", 0.1),
        ],
        "quality_optimized" => vec![
            rule("parameter_score", 0.4),
            rule("context_score", 0.3),
            rule("quality_score", 0.2),
            rule("cost_score", 0.1),
        ],
        "balanced" => vec![
            rule("cost_score", 0.3),
            rule("parameter_score", 0.25),
            rule("context_score", 0.2),
            rule("speed_score", 0.15),
            rule("reliability_score", 0.1),
        ],
        _ => return None,
    };
    Some(rules)
}

/// Resolve a strategy name: config-defined strategies shadow presets;
/// unknown names fall back to `cost_first`.
pub fn strategy_rules(name: &str, routing: &RoutingConfig) -> Vec<StrategyRule> {
    if let Some(rules) = routing.strategies.get(name) {
        return rules.clone();
    }
    preset(name)
        .or_else(|| preset("cost_first"))
        .expect("cost_first preset exists")
}

/// Is the strategy cost-centric? (Drives the OpenRouter price-sort hint.)
pub fn is_cost_centric(name: &str) -> bool {
    matches!(name, "cost_first" | "cost_optimized" | "free_first")
}

pub struct Scorer {
    registry: Arc<ChannelRegistry>,
    health: Arc<HealthTracker>,
    routing: RoutingConfig,
}

impl Scorer {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        health: Arc<HealthTracker>,
        routing: RoutingConfig,
    ) -> Self {
        Self { registry, health, routing }
    }

    /// Score, bucket, and rank candidates for a request.
    pub fn score(
        &self,
        candidates: Vec<(Candidate, ModelInfo)>,
        request: &RoutingRequest,
        strategy_name: &str,
    ) -> Vec<ScoredCandidate> {
        let candidates = self.pre_filter(candidates);
        let rules = strategy_rules(strategy_name, &self.routing);
        let input_tokens = estimate_tokens(&request.messages);
        let output_tokens = request.max_tokens.unwrap_or(DEFAULT_OUTPUT_TOKENS);

        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|(candidate, info)| {
                let (cost, estimated_cost) =
                    self.cost_score(&info, input_tokens, output_tokens);
                let mut scores = ScoreBreakdown {
                    cost,
                    speed: self.speed_score(&candidate),
                    quality: quality_score(&candidate.model_id, &info),
                    reliability: self.reliability_score(&candidate),
                    parameter: parameter_score(&info),
                    context: context_score(&info),
                    free: free_score(&candidate.model_id, &info),
                    local: self.local_score(&candidate, &info),
                    total: 0.0,
                    bucket: 0,
                };
                scores.total = weighted_total(&scores, &rules);
                scores.bucket = scores.bucket_of();
                ScoredCandidate { candidate, info, scores, estimated_cost }
            })
            .collect();

        // Hierarchical sort: bucket descending, channel name ascending.
        scored.sort_by(|a, b| {
            b.scores
                .bucket
                .cmp(&a.scores.bucket)
                .then_with(|| {
                    a.candidate
                        .channel
                        .display_name()
                        .cmp(b.candidate.channel.display_name())
                })
                .then_with(|| a.candidate.model_id.cmp(&b.candidate.model_id))
        });

        if let Some(top) = scored.first() {
            tracing::debug!(
                channel = %top.candidate.channel.id,
                model = %top.candidate.model_id,
                bucket = top.scores.bucket,
                total = top.scores.total,
                "ranked candidates"
            );
        }

        scored
    }

    /// Cheap pre-selection when the field is large. Free, high-priority and
    /// local channels always survive into full scoring.
    fn pre_filter(
        &self,
        candidates: Vec<(Candidate, ModelInfo)>,
    ) -> Vec<(Candidate, ModelInfo)> {
        let threshold = self.routing.pre_filter_threshold;
        if threshold == 0 || candidates.len() <= threshold {
            return candidates;
        }

        let mut keyed: Vec<(i64, (Candidate, ModelInfo))> = candidates
            .into_iter()
            .map(|(candidate, info)| {
                let mut score: i64 = 0;
                if free_score(&candidate.model_id, &info) >= 0.9 {
                    score += 1000;
                }
                score += (10 - candidate.channel.priority as i64).clamp(0, 10) * 10;
                if self.local_score(&candidate, &info) >= 0.9 {
                    score += 100;
                }
                if candidate.channel.enabled {
                    score += 50;
                }
                (score, (candidate, info))
            })
            .collect();

        keyed.sort_by(|a, b| {
            b.0.cmp(&a.0).then_with(|| {
                (&a.1 .0.channel.id, &a.1 .0.model_id).cmp(&(&b.1 .0.channel.id, &b.1 .0.model_id))
            })
        });

        tracing::debug!(kept = threshold, "pre-filter trimmed candidate field");
        keyed.into_iter().take(threshold).map(|(_, c)| c).collect()
    }

    /// Returns (score, estimated dollars).
    fn cost_score(&self, info: &ModelInfo, input_tokens: u64, output_tokens: u64) -> (f64, f64) {
        if info.pricing.is_free {
            return (1.0, 0.0);
        }

        let estimate = match (info.pricing.input_price, info.pricing.output_price) {
            (None, None) => 0.001, // unknown pricing: assume cheap, not free
            (input, output) => {
                input_tokens as f64 * input.unwrap_or(0.0)
                    + output_tokens as f64 * output.unwrap_or(0.0)
                    + info.pricing.per_request.unwrap_or(0.0)
            }
        };

        if estimate <= 0.0 {
            return (1.0, 0.0);
        }
        let score = (1.0 - (estimate / MAX_COST_DOLLARS).min(1.0)).clamp(0.0, 1.0);
        (score, estimate)
    }

    fn speed_score(&self, candidate: &Candidate) -> f64 {
        match self.health.avg_response_secs(&candidate.channel.id) {
            Some(secs) if secs <= 0.5 => 1.0,
            Some(secs) if secs <= 1.0 => 0.9,
            Some(secs) if secs <= 2.0 => 0.8,
            Some(secs) if secs <= 4.0 => 0.6,
            Some(secs) if secs <= 6.0 => 0.4,
            Some(_) => 0.2,
            None => 0.6,
        }
    }

    fn reliability_score(&self, candidate: &Candidate) -> f64 {
        let Some(health) = self.health.get(&candidate.channel.id) else { return 0.5 };
        if health.request_count < 5 {
            return 0.5;
        }
        match health.success_rate() {
            Some(rate) if rate >= 0.99 => 1.0,
            Some(rate) if rate >= 0.95 => 0.9,
            Some(rate) if rate >= 0.9 => 0.8,
            Some(rate) if rate >= 0.8 => 0.6,
            Some(rate) if rate >= 0.7 => 0.4,
            Some(_) => 0.2,
            None => 0.5,
        }
    }

    fn local_score(&self, candidate: &Candidate, info: &ModelInfo) -> f64 {
        if info.is_local {
            return 1.0;
        }

        let local_tags = ["local", "本地", "localhost", "offline", "edge"];
        if candidate
            .channel
            .tags
            .iter()
            .any(|t| local_tags.contains(&t.to_lowercase().as_str()))
        {
            return 1.0;
        }

        let url = candidate
            .channel
            .base_url
            .clone()
            .or_else(|| {
                self.registry
                    .get_provider(&candidate.channel.provider)
                    .map(|p| p.primary_url().to_string())
            })
            .unwrap_or_default();
        if is_local_url(&url) {
            return 1.0;
        }
        if self
            .registry
            .get_provider(&candidate.channel.provider)
            .is_some_and(|p| p.local)
        {
            return 1.0;
        }

        let model = candidate.model_id.to_lowercase();
        if ["ollama", "llama.cpp", "lmstudio", "local"]
            .iter()
            .any(|t| model.contains(t))
        {
            return 0.8;
        }

        0.1
    }
}

/// Loopback / RFC-1918 / well-known local-runner endpoints.
pub fn is_local_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    ["localhost", "127.0.0.1", "0.0.0.0", "::1", "192.168.", "10.", "172.16.", ":11434", ":1234"]
        .iter()
        .any(|marker| {
            if marker.ends_with('.') {
                lower.contains(&format!("//{marker}"))
                    || lower.contains(&format!("@{marker}"))
            } else {
                lower.contains(marker)
            }
        })
}

/// Keyword-table quality on the physical model id; explicit overrides win.
fn quality_score(model_id: &str, info: &ModelInfo) -> f64 {
    if (info.quality_score - 0.5).abs() > f64::EPSILON {
        return info.quality_score;
    }

    const TABLE: &[(&str, f64)] = &[
        ("gpt-4", 0.95),
        ("claude-3-opus", 0.93),
        ("claude", 0.9),
        ("gpt-4-turbo", 0.9),
        ("gpt-4o", 0.9),
        ("deepseek-v3", 0.87),
        ("qwen-max", 0.85),
        ("qwen-plus", 0.83),
        ("gpt-3.5", 0.75),
        ("gemini-1.5-flash", 0.72),
        ("glm-4", 0.7),
    ];

    let lower = model_id.to_lowercase();
    for (keyword, score) in TABLE {
        if lower.contains(keyword) {
            return *score;
        }
    }
    0.6
}

/// Parameter-count ladder; counts in millions.
fn parameter_score(info: &ModelInfo) -> f64 {
    match info.specs.parameter_count {
        Some(p) if p >= 1_000_000 => 1.0,
        Some(p) if p >= 500_000 => 0.9,
        Some(p) if p >= 200_000 => 0.8,
        Some(p) if p >= 100_000 => 0.7,
        Some(p) if p >= 50_000 => 0.6,
        Some(p) if p >= 20_000 => 0.5,
        Some(p) if p >= 7_000 => 0.4,
        Some(_) => 0.3,
        None => 0.5,
    }
}

/// Context-window ladder.
fn context_score(info: &ModelInfo) -> f64 {
    match info.specs.context_length {
        Some(c) if c >= 2_000_000 => 1.0,
        Some(c) if c >= 1_000_000 => 0.95,
        Some(c) if c >= 512_000 => 0.9,
        Some(c) if c >= 200_000 => 0.85,
        Some(c) if c >= 128_000 => 0.8,
        Some(c) if c >= 64_000 => 0.7,
        Some(c) if c >= 32_000 => 0.6,
        Some(c) if c >= 16_000 => 0.5,
        Some(c) if c >= 8_000 => 0.4,
        Some(c) if c >= 4_000 => 0.3,
        Some(_) => 0.2,
        None => 0.5,
    }
}

/// 1.0 when there is any evidence the model costs nothing; 0.1 otherwise.
fn free_score(model_id: &str, info: &ModelInfo) -> f64 {
    let lower = model_id.to_lowercase();
    if lower.contains("free") || lower.contains("免费") {
        return 1.0;
    }
    if info.pricing.is_free {
        return 1.0;
    }
    if let (Some(input), Some(output)) = (info.pricing.input_price, info.pricing.output_price) {
        if input <= FREE_PRICE_EPSILON && output <= FREE_PRICE_EPSILON {
            return 1.0;
        }
    }
    0.1
}

/// Weighted, order-aware combination of the factor scores.
fn weighted_total(scores: &ScoreBreakdown, rules: &[StrategyRule]) -> f64 {
    let total_weight: f64 = rules.iter().map(|r| r.weight).sum();
    if total_weight <= 0.0 {
        return 0.5;
    }

    let mut total = 0.0;
    for rule in rules {
        let score = match rule.field.as_str() {
            "cost_score" => scores.cost,
            "speed_score" => scores.speed,
            "quality_score" => scores.quality,
            "reliability_score" => scores.reliability,
            "parameter_score" => scores.parameter,
            "context_score" => scores.context,
            "free_score" => scores.free,
            "local_score" => scores.local,
            _ => continue,
        };
        let score = if rule.order == "asc" { 1.0 - score } else { score };
        total += score * rule.weight;
    }
    total / total_weight
}

/// Token estimate for the cost factor: tiktoken `cl100k_base` when the
/// encoder is available, byte heuristic otherwise. Estimation must stay
/// sub-millisecond — the heuristic is the ceiling, not the exception.
pub fn estimate_tokens(messages: &[serde_json::Value]) -> u64 {
    static ENCODER: OnceLock<Option<tiktoken_rs::CoreBPE>> = OnceLock::new();
    let encoder = ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().ok());

    let mut total: u64 = 0;
    for message in messages {
        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        total += 4; // role + separators overhead per message
        total += match encoder {
            Some(bpe) => bpe.encode_ordinary(content).len() as u64,
            None => heuristic_tokens(content),
        };
    }
    total.max(1)
}

/// CJK characters ≈ one token each; everything else ≈ four bytes per token.
fn heuristic_tokens(text: &str) -> u64 {
    let cjk = text
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count() as u64;
    let other = text.chars().count() as u64 - cjk;
    cjk + other / 4
}
