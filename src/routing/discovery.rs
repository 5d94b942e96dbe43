//! Candidate discovery: virtual model identifier → (channel, physical model)
//! pairs.
//!
//! The query's shape picks the path:
//!
//! 1. `qwen3-<8b` — parameter-size predicate against every cached model.
//! 2. `tag:free,claude` / `tags:…` — explicit tag query (`!` negates, size
//!    predicates become filters).
//! 3. `free,claude` — implicit tag query (comma, no prefix).
//! 4. `gpt-4o` — plain name: exact physical match across snapshots, unioned
//!    with complete-segment tag matches, deduplicated.
//! 5. `configured_models` fallback when (4) finds nothing.
//!
//! Discovery only finds; the facade filters (blacklist, health, capability)
//! and scores.

use std::sync::Arc;

use crate::catalog::{ModelCatalog, ModelInfo};
use crate::config::Channel;
use crate::error::RouteError;
use crate::registry::ChannelRegistry;
use crate::routing::size_filter::{apply_size_filters, parse_size_filter, SizeFilter};
use crate::tags::{extract_tags, extract_tags_with_aliases};

/// One viable (channel, resolved physical model) pair.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub channel: Arc<Channel>,
    /// The id that will be sent upstream.
    pub model_id: String,
}

/// A parsed parameter-size predicate, e.g. `qwen3-<8b`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamComparison {
    pub prefix: String,
    pub op: ParamOp,
    /// Target in billions of parameters.
    pub target_billions: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamOp {
    Gt,
    Lt,
    Ge,
    Le,
}

impl ParamOp {
    fn matches(self, value: f64, target: f64) -> bool {
        match self {
            Self::Gt => value > target,
            Self::Lt => value < target,
            Self::Ge => value >= target,
            Self::Le => value <= target,
        }
    }
}

/// Parse `prefix->8b` style queries. `Ok(None)` means "not a predicate" (the
/// plain-name path applies); `Err` means it looked like one but the size part
/// would not parse.
///
/// The two-character operators are tried first — a bare substring check would
/// read `->=` as `->`.
pub fn parse_parameter_query(query: &str) -> Result<Option<ParamComparison>, RouteError> {
    const OPS: &[(&str, ParamOp)] = &[
        ("->=", ParamOp::Ge),
        ("-<=", ParamOp::Le),
        ("->", ParamOp::Gt),
        ("-<", ParamOp::Lt),
    ];

    for (token, op) in OPS {
        if let Some(pos) = query.rfind(token) {
            let prefix = &query[..pos];
            let tail = &query[pos + token.len()..];
            if prefix.is_empty() || tail.is_empty() {
                continue;
            }
            return match parse_parameter_size(tail) {
                Some(target_billions) => Ok(Some(ParamComparison {
                    prefix: prefix.to_string(),
                    op: *op,
                    target_billions,
                })),
                None => Err(RouteError::ParameterComparisonFailed {
                    query: query.to_string(),
                    reason: format!("cannot parse parameter size `{tail}`"),
                }),
            };
        }
    }

    Ok(None)
}

/// `8b` → 8.0, `270m` → 0.27, `2k` → 0.000002, `1.5t` → 1500 (billions).
/// A missing unit means billions.
fn parse_parameter_size(text: &str) -> Option<f64> {
    let text = text.trim().to_lowercase();
    let (number, unit) = match text.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&text[..text.len() - 1], Some(c)),
        Some(_) => (text.as_str(), None),
        None => return None,
    };
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    match unit {
        None | Some('b') | Some('g') => Some(value),
        Some('m') => Some(value / 1_000.0),
        Some('k') => Some(value / 1_000_000.0),
        Some('t') => Some(value * 1_000.0),
        Some(_) => None,
    }
}

/// Does a model id fall under a query prefix? Flexible on `-`/`_`/`/`/`:`
/// delimiters so `qwen3` matches both `qwen3-8b` and `Qwen/qwen3-8b`.
fn model_matches_prefix(model_id: &str, prefix: &str) -> bool {
    let model = model_id.to_lowercase();
    let prefix = prefix.to_lowercase();
    if model.starts_with(&prefix) {
        return true;
    }
    ['/', '-', '_', ':'].iter().any(|sep| {
        model.contains(&format!("{sep}{prefix}")) || model.contains(&format!("{prefix}{sep}"))
    })
}

/// Discovery engine over the channel registry and the model catalog.
pub struct CandidateFinder {
    registry: Arc<ChannelRegistry>,
    catalog: Arc<ModelCatalog>,
}

impl CandidateFinder {
    pub fn new(registry: Arc<ChannelRegistry>, catalog: Arc<ModelCatalog>) -> Self {
        Self { registry, catalog }
    }

    /// Dispatch on the query shape. See module docs for the paths.
    pub fn find(&self, model: &str) -> Result<Vec<Candidate>, RouteError> {
        if let Some(comparison) = parse_parameter_query(model)? {
            return self.find_by_comparison(model, &comparison);
        }

        if let Some(query) = model
            .strip_prefix("tag:")
            .or_else(|| model.strip_prefix("tags:"))
        {
            return self.find_by_tag_query(query);
        }

        if model.contains(',') {
            return self.find_by_tag_query(model);
        }

        Ok(self.find_by_name(model))
    }

    // -- path 1: parameter predicate ---------------------------------------

    fn find_by_comparison(
        &self,
        query: &str,
        comparison: &ParamComparison,
    ) -> Result<Vec<Candidate>, RouteError> {
        let snapshots = self.catalog.iter_snapshots();
        if snapshots.is_empty() {
            return Err(RouteError::ParameterComparisonFailed {
                query: query.to_string(),
                reason: "model cache is empty".to_string(),
            });
        }

        // (channel, model, params-billions), deduplicated across keys.
        let mut matches: Vec<(Arc<Channel>, String, f64)> = Vec::new();

        for snapshot in snapshots {
            let Some(channel) = self.registry.get_channel(&snapshot.channel_id) else { continue };
            if !self.registry.is_enabled(&channel.id) {
                continue;
            }

            for model_id in &snapshot.models {
                if !model_matches_prefix(model_id, &comparison.prefix) {
                    continue;
                }
                let millions = snapshot
                    .info
                    .get(model_id)
                    .and_then(|i| i.specs.parameter_count)
                    .or_else(|| crate::catalog::infer_specs(model_id).0);
                let Some(millions) = millions else { continue };
                let billions = millions as f64 / 1000.0;

                if comparison.op.matches(billions, comparison.target_billions)
                    && !matches
                        .iter()
                        .any(|(c, m, _)| c.id == channel.id && m == model_id)
                {
                    matches.push((Arc::clone(&channel), model_id.clone(), billions));
                }
            }
        }

        if matches.is_empty() {
            return Err(RouteError::ParameterComparisonFailed {
                query: query.to_string(),
                reason: "no cached model satisfies the predicate".to_string(),
            });
        }

        // Larger models first.
        matches.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });

        tracing::debug!(query, matched = matches.len(), "parameter comparison matched");

        Ok(matches
            .into_iter()
            .map(|(channel, model_id, _)| Candidate { channel, model_id })
            .collect())
    }

    // -- paths 2 & 3: tag queries ------------------------------------------

    fn find_by_tag_query(&self, query: &str) -> Result<Vec<Candidate>, RouteError> {
        let mut positive: Vec<String> = Vec::new();
        let mut negative: Vec<String> = Vec::new();
        let mut filters: Vec<SizeFilter> = Vec::new();

        for term in query.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(neg) = term.strip_prefix('!') {
                negative.push(neg.to_lowercase());
            } else if let Some(filter) = parse_size_filter(term) {
                filters.push(filter);
            } else {
                positive.push(term.to_lowercase());
            }
        }

        let query_tags = || -> Vec<String> {
            positive
                .iter()
                .cloned()
                .chain(negative.iter().map(|n| format!("!{n}")))
                .collect()
        };

        let candidates = self.match_tags(&positive, &negative, !filters.is_empty());
        if candidates.is_empty() {
            return Err(RouteError::TagNotFound {
                tags: query_tags(),
                suggestions: self.suggest_tags(&positive),
            });
        }

        let survivors = apply_size_filters(
            candidates
                .into_iter()
                .map(|c| {
                    let info = self.resolve_info(&c);
                    (c, info)
                })
                .collect(),
            &filters,
        );

        if survivors.is_empty() {
            return Err(RouteError::TagNotFound {
                tags: query_tags(),
                suggestions: Vec::new(),
            });
        }

        Ok(survivors.into_iter().map(|(c, _)| c).collect())
    }

    /// Every cached model of every enabled channel whose tag set contains all
    /// positive tags and none of the negative ones. With no tags at all the
    /// sweep only makes sense as a size-filter base (`tag:>20b`), signalled
    /// by `allow_all`.
    fn match_tags(&self, positive: &[String], negative: &[String], allow_all: bool) -> Vec<Candidate> {
        if positive.is_empty() && negative.is_empty() && !allow_all {
            return Vec::new();
        }

        let mut out: Vec<Candidate> = Vec::new();
        for snapshot in self.catalog.iter_snapshots() {
            let Some(channel) = self.registry.get_channel(&snapshot.channel_id) else { continue };
            if !self.registry.is_enabled(&channel.id) {
                continue;
            }

            for model_id in &snapshot.models {
                let mut tags = extract_tags_with_aliases(model_id, &channel);
                for static_tag in &channel.tags {
                    let lower = static_tag.to_lowercase();
                    if !tags.contains(&lower) {
                        tags.push(lower);
                    }
                }

                let pos_ok = positive.iter().all(|t| tags.contains(t));
                let neg_ok = !negative.iter().any(|t| tags.contains(t));
                if pos_ok
                    && neg_ok
                    && !out
                        .iter()
                        .any(|c| c.channel.id == channel.id && &c.model_id == model_id)
                {
                    out.push(Candidate {
                        channel: Arc::clone(&channel),
                        model_id: model_id.clone(),
                    });
                }
            }
        }
        out
    }

    /// Known tags that resemble the missed query terms, for the error body.
    fn suggest_tags(&self, wanted: &[String]) -> Vec<String> {
        let mut known: Vec<String> = Vec::new();
        for snapshot in self.catalog.iter_snapshots() {
            for model_id in &snapshot.models {
                for tag in extract_tags(model_id) {
                    if !known.contains(&tag) {
                        known.push(tag);
                    }
                }
            }
        }

        let mut suggestions: Vec<String> = Vec::new();
        for want in wanted {
            let stem: String = want.chars().take(3).collect();
            if stem.is_empty() {
                continue;
            }
            for tag in &known {
                if (tag.starts_with(&stem) || tag.contains(want.as_str()))
                    && !suggestions.contains(tag)
                {
                    suggestions.push(tag.clone());
                    if suggestions.len() >= 5 {
                        return suggestions;
                    }
                }
            }
        }
        suggestions
    }

    // -- paths 4 & 5: plain name -------------------------------------------

    fn find_by_name(&self, model: &str) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = Vec::new();

        // 4a. Exact physical match in any snapshot.
        for snapshot in self.catalog.iter_snapshots() {
            let Some(channel) = self.registry.get_channel(&snapshot.channel_id) else { continue };
            if !self.registry.is_enabled(&channel.id) {
                continue;
            }
            if snapshot.models.iter().any(|m| m == model) {
                let resolved = snapshot
                    .info
                    .get(model)
                    .map(|i| i.model_id.clone())
                    .unwrap_or_else(|| model.to_string());
                if !out.iter().any(|c| c.channel.id == channel.id && c.model_id == resolved) {
                    out.push(Candidate { channel, model_id: resolved });
                }
            }
        }

        // 4b. Complete-segment tag match, unioned in.
        let wanted = model.to_lowercase();
        for snapshot in self.catalog.iter_snapshots() {
            let Some(channel) = self.registry.get_channel(&snapshot.channel_id) else { continue };
            if !self.registry.is_enabled(&channel.id) {
                continue;
            }
            for model_id in &snapshot.models {
                if extract_tags(model_id).contains(&wanted)
                    && !out
                        .iter()
                        .any(|c| c.channel.id == channel.id && &c.model_id == model_id)
                {
                    out.push(Candidate {
                        channel: Arc::clone(&channel),
                        model_id: model_id.clone(),
                    });
                }
            }
        }

        if !out.is_empty() {
            return out;
        }

        // 5. Configured fallback: channels that declare the model outright,
        // plus channels listing it in `configured_models`.
        for channel in self.registry.get_channels_by_declared_model(model) {
            out.push(Candidate { channel, model_id: model.to_string() });
        }
        for channel in self.registry.get_enabled() {
            if out.iter().any(|c| c.channel.id == channel.id) {
                continue;
            }
            if channel.configured_models.iter().any(|m| m == model) {
                let resolved = self
                    .catalog
                    .snapshot_for_channel(&channel)
                    .and_then(|s| s.info.get(model).map(|i| i.model_id.clone()))
                    .unwrap_or_else(|| model.to_string());
                out.push(Candidate { channel, model_id: resolved });
            }
        }
        out
    }

    /// Resolved info for a candidate (for size filters and capability checks).
    pub fn resolve_info(&self, candidate: &Candidate) -> ModelInfo {
        match self.registry.get_provider(&candidate.channel.provider) {
            Some(provider) => {
                self.catalog
                    .resolve(&candidate.channel, &provider, &candidate.model_id)
            }
            None => ModelInfo::inferred(&candidate.model_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{key_fingerprint, ModelSnapshot};
    use crate::config::Config;

    fn setup(models_per_channel: &[(&str, &[&str])]) -> CandidateFinder {
        let mut yaml = String::from(
            "providers:\n  p: { base_url: \"http://upstream.example\" }\nchannels:\n",
        );
        for (id, _) in models_per_channel {
            yaml.push_str(&format!(
                "  - {{ id: {id}, provider: p, model_name: auto, api_key: sk-{id} }}\n"
            ));
        }
        let config = Config::from_yaml(&yaml).unwrap();
        let registry = Arc::new(ChannelRegistry::new(&config));
        let catalog = Arc::new(ModelCatalog::new());

        for (id, models) in models_per_channel {
            let fp = key_fingerprint(&format!("sk-{id}"));
            catalog.insert_snapshot(ModelSnapshot::new(
                id,
                &fp,
                models.iter().map(|m| m.to_string()).collect(),
            ));
        }

        CandidateFinder::new(registry, catalog)
    }

    // -----------------------------------------------------------------------
    // Parameter-query parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parses_all_four_operators() {
        let gt = parse_parameter_query("qwen3->8b").unwrap().unwrap();
        assert_eq!(gt.op, ParamOp::Gt);
        assert_eq!(gt.prefix, "qwen3");
        assert!((gt.target_billions - 8.0).abs() < 1e-9);

        assert_eq!(parse_parameter_query("qwen3-<72b").unwrap().unwrap().op, ParamOp::Lt);
        assert_eq!(parse_parameter_query("qwen3->=8b").unwrap().unwrap().op, ParamOp::Ge);
        assert_eq!(parse_parameter_query("qwen3-<=30b").unwrap().unwrap().op, ParamOp::Le);
    }

    #[test]
    fn ge_is_not_misread_as_gt() {
        let cmp = parse_parameter_query("qwen3->=8b").unwrap().unwrap();
        assert_eq!(cmp.op, ParamOp::Ge);
        assert_eq!(cmp.prefix, "qwen3");
    }

    #[test]
    fn unit_conversions_normalise_to_billions() {
        let m = parse_parameter_query("x->270m").unwrap().unwrap();
        assert!((m.target_billions - 0.27).abs() < 1e-9);
        let t = parse_parameter_query("x->1t").unwrap().unwrap();
        assert!((t.target_billions - 1000.0).abs() < 1e-9);
        let bare = parse_parameter_query("x->8").unwrap().unwrap();
        assert!((bare.target_billions - 8.0).abs() < 1e-9);
    }

    #[test]
    fn plain_names_are_not_comparisons() {
        assert!(parse_parameter_query("gpt-4o").unwrap().is_none());
        assert!(parse_parameter_query("qwen2.5-7b").unwrap().is_none());
    }

    #[test]
    fn malformed_size_part_is_a_parse_error() {
        let err = parse_parameter_query("qwen3->8x").unwrap_err();
        assert_eq!(err.kind(), "parameter_comparison_failed");
    }

    // -----------------------------------------------------------------------
    // Prefix matching
    // -----------------------------------------------------------------------

    #[test]
    fn prefix_matching_is_delimiter_flexible() {
        assert!(model_matches_prefix("qwen3-8b", "qwen3"));
        assert!(model_matches_prefix("Qwen/qwen3-8b", "qwen3"));
        assert!(model_matches_prefix("org/qwen3_8b", "qwen3"));
        assert!(!model_matches_prefix("llama-3-8b", "qwen3"));
    }

    // -----------------------------------------------------------------------
    // Parameter-comparison discovery
    // -----------------------------------------------------------------------

    #[test]
    fn strictly_less_than_excludes_the_boundary() {
        let finder = setup(&[("c1", &["qwen3-4b", "qwen3-8b", "qwen3-14b"][..])]);
        let found = finder.find("qwen3-<8b").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].model_id, "qwen3-4b");
    }

    #[test]
    fn comparison_results_sort_larger_first() {
        let finder = setup(&[("c1", &["qwen3-4b", "qwen3-8b", "qwen3-32b"][..])]);
        let found = finder.find("qwen3->=8b").unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.model_id.as_str()).collect();
        assert_eq!(ids, vec!["qwen3-32b", "qwen3-8b"]);
    }

    #[test]
    fn comparison_with_empty_cache_fails() {
        let finder = setup(&[]);
        let err = finder.find("qwen3->8b").unwrap_err();
        assert_eq!(err.kind(), "parameter_comparison_failed");
    }

    #[test]
    fn comparison_with_no_match_fails() {
        let finder = setup(&[("c1", &["qwen3-4b"][..])]);
        assert!(finder.find("qwen3->100b").is_err());
    }

    // -----------------------------------------------------------------------
    // Tag discovery
    // -----------------------------------------------------------------------

    #[test]
    fn explicit_positive_tag_matches() {
        let finder = setup(&[
            ("c1", &["meta/llama-3-8b", "gpt-4o"][..]),
            ("c2", &["claude-3-haiku-20240307"][..]),
        ]);
        let found = finder.find("tag:llama").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].model_id, "meta/llama-3-8b");
    }

    #[test]
    fn negative_tag_excludes_models() {
        let finder = setup(&[("c1", &["llama-3-8b", "llama-3-8b-vision"][..])]);
        let found = finder.find("tag:llama,!vision").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].model_id, "llama-3-8b");
    }

    #[test]
    fn implicit_comma_query_is_a_tag_query() {
        let finder = setup(&[("c1", &["llama-3-8b", "qwen3-8b"][..])]);
        let found = finder.find("llama,8b").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].model_id, "llama-3-8b");
    }

    #[test]
    fn tag_query_with_size_filter_applies_both() {
        let finder = setup(&[("c1", &["qwen3-4b", "qwen3-32b", "llama-3-70b"][..])]);
        let found = finder.find("tag:qwen3,>8b").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].model_id, "qwen3-32b");
    }

    #[test]
    fn bare_size_filter_query_sweeps_everything() {
        // tag:>20b across channels offering 7 B / 30 B / 70 B models.
        let finder = setup(&[
            ("c1", &["m-7b"][..]),
            ("c2", &["m-30b"][..]),
            ("c3", &["m-70b"][..]),
        ]);
        let found = finder.find("tag:>20b").unwrap();
        let mut ids: Vec<_> = found.iter().map(|c| c.model_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["m-30b", "m-70b"]);
    }

    #[test]
    fn unmatched_tags_error_with_the_query_terms() {
        let finder = setup(&[("c1", &["gpt-4o"][..])]);
        let err = finder.find("tag:nonexistent-family").unwrap_err();
        match err {
            RouteError::TagNotFound { tags, .. } => {
                assert_eq!(tags, vec!["nonexistent-family"]);
            }
            other => panic!("expected TagNotFound, got {other:?}"),
        }
    }

    #[test]
    fn tag_not_found_suggests_similar_tags() {
        let finder = setup(&[("c1", &["claude-3-haiku"][..])]);
        let err = finder.find("tag:clause").unwrap_err();
        match err {
            RouteError::TagNotFound { suggestions, .. } => {
                assert!(suggestions.contains(&"claude".to_string()), "got {suggestions:?}");
            }
            other => panic!("expected TagNotFound, got {other:?}"),
        }
    }

    #[test]
    fn alias_derived_tag_satisfies_positive_query() {
        let mut yaml = String::from(
            "providers:\n  p: { base_url: \"http://u\" }\nchannels:\n  - id: c1\n    provider: p\n    model_name: auto\n    api_key: sk-c1\n    model_aliases: { fastcoder: gpt-4o-mini }\n",
        );
        yaml.push('\n');
        let config = Config::from_yaml(&yaml).unwrap();
        let registry = Arc::new(ChannelRegistry::new(&config));
        let catalog = Arc::new(ModelCatalog::new());
        catalog.insert_snapshot(ModelSnapshot::new(
            "c1",
            &key_fingerprint("sk-c1"),
            vec!["gpt-4o-mini".into()],
        ));
        let finder = CandidateFinder::new(registry, catalog);

        let found = finder.find("tag:fastcoder").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].model_id, "gpt-4o-mini");

        // Decision: alias-derived tags also count against the negative set.
        let err = finder.find("tag:gpt,!fastcoder").unwrap_err();
        assert_eq!(err.kind(), "tag_not_found");
    }

    #[test]
    fn static_channel_tags_participate() {
        let yaml = "providers:\n  p: { base_url: \"http://u\" }\nchannels:\n  - { id: c1, provider: p, model_name: auto, api_key: sk-c1, tags: [cheap] }\n";
        let config = Config::from_yaml(yaml).unwrap();
        let registry = Arc::new(ChannelRegistry::new(&config));
        let catalog = Arc::new(ModelCatalog::new());
        catalog.insert_snapshot(ModelSnapshot::new(
            "c1",
            &key_fingerprint("sk-c1"),
            vec!["gpt-4o".into()],
        ));
        let finder = CandidateFinder::new(registry, catalog);

        assert_eq!(finder.find("tag:cheap").unwrap().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Plain-name discovery
    // -----------------------------------------------------------------------

    #[test]
    fn exact_physical_match_across_channels() {
        let finder = setup(&[("c1", &["gpt-4o"][..]), ("c2", &["gpt-4o", "other"][..])]);
        let found = finder.find("gpt-4o").unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn complete_segment_match_unions_with_physical() {
        // `claude-3-haiku` is a date-stripped complete segment of the cached id.
        let finder = setup(&[("c1", &["claude-3-haiku-20240307"][..])]);
        let found = finder.find("claude-3-haiku").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].model_id, "claude-3-haiku-20240307");
    }

    #[test]
    fn duplicate_candidates_are_merged() {
        // Physical and segment paths both hit the same (channel, model).
        let finder = setup(&[("c1", &["gpt-4o"][..])]);
        let found = finder.find("gpt-4o").unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn unknown_plain_name_returns_empty_not_error() {
        let finder = setup(&[("c1", &["gpt-4o"][..])]);
        assert!(finder.find("totally-unknown-xyz").unwrap().is_empty());
    }

    #[test]
    fn declared_model_fallback_applies_when_snapshots_miss() {
        let yaml = "providers:\n  p: { base_url: \"http://u\" }\nchannels:\n  - { id: c1, provider: p, model_name: gpt-4o, api_key: sk-c1 }\n";
        let config = Config::from_yaml(yaml).unwrap();
        let registry = Arc::new(ChannelRegistry::new(&config));
        let finder = CandidateFinder::new(registry, Arc::new(ModelCatalog::new()));

        let found = finder.find("gpt-4o").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].channel.id, "c1");
        assert_eq!(found[0].model_id, "gpt-4o");
    }

    #[test]
    fn configured_models_fallback_applies_when_snapshots_miss() {
        let yaml = "providers:\n  p: { base_url: \"http://u\" }\nchannels:\n  - { id: c1, provider: p, model_name: auto, api_key: sk-c1, configured_models: [special-model] }\n";
        let config = Config::from_yaml(yaml).unwrap();
        let registry = Arc::new(ChannelRegistry::new(&config));
        let finder = CandidateFinder::new(registry, Arc::new(ModelCatalog::new()));

        let found = finder.find("special-model").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].model_id, "special-model");
    }

    #[test]
    fn disabled_channels_are_never_discovered() {
        let yaml = "providers:\n  p: { base_url: \"http://u\" }\nchannels:\n  - { id: c1, provider: p, model_name: auto, api_key: sk-c1, enabled: false }\n";
        let config = Config::from_yaml(yaml).unwrap();
        let registry = Arc::new(ChannelRegistry::new(&config));
        let catalog = Arc::new(ModelCatalog::new());
        catalog.insert_snapshot(ModelSnapshot::new(
            "c1",
            &key_fingerprint("sk-c1"),
            vec!["gpt-4o".into()],
        ));
        let finder = CandidateFinder::new(registry, catalog);

        assert!(finder.find("gpt-4o").unwrap().is_empty());
    }
}
