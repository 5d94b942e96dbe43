//! Tag derivation from model identifiers.
//!
//! Virtual-model queries like `tag:claude,!vision` match against the tag set
//! of every cached physical model. Tags are derived deterministically from the
//! model id alone, so the same id always yields the same set — no network, no
//! state. Two layers:
//!
//! - **Split fragments**: the id lowered and split on `: / @ - _ ,`.
//! - **Complete segments**: `/`-, `:`- and `@`-delimited top-level segments
//!   kept verbatim (e.g. `claude-3-haiku-20240307`), so a query for the full
//!   family name matches even though the split fragments are individual words.
//!   Segments ending in a date suffix also yield the date-stripped form.
//!
//! Bare provider names (`openai`, `qwen`, …) and generic suffixes (`free`,
//! `instruct`, …) are dropped from the complete-segment layer so they do not
//! dominate tag queries; they still appear as split fragments.

use crate::config::Channel;

/// Provider prefixes that are skipped as standalone complete segments.
const PROVIDER_PREFIXES: &[&str] = &[
    "openai",
    "anthropic",
    "qwen",
    "deepseek",
    "google",
    "meta",
    "mistral",
    "cohere",
    "groq",
    "together",
    "fireworks",
    "siliconflow",
    "moonshot",
    "ollama",
    "lmstudio",
];

/// Generic suffix tokens that are skipped as standalone complete segments.
const SUFFIX_TOKENS: &[&str] = &[
    "free", "pro", "premium", "paid", "api", "chat", "instruct", "base", "tuned", "finetune",
    "ft", "sft", "rlhf", "dpo",
];

/// Derive the ordered, deduplicated tag set for a model id.
///
/// Pure and deterministic: `extract_tags("Qwen/Qwen3-8B")` always returns
/// `["qwen", "qwen3", "8b", "qwen3-8b"]` (fragments first, complete segments
/// after, first occurrence wins).
pub fn extract_tags(model_id: &str) -> Vec<String> {
    if model_id.is_empty() {
        return Vec::new();
    }

    let lower = model_id.to_lowercase();
    let mut tags: Vec<String> = Vec::new();

    for part in lower.split(['/', ':', '@', '-', '_', ',']) {
        let part = part.trim();
        // Single characters are noise (`3` from `claude-3` still survives as
        // part of the complete segment).
        if part.len() > 1 && !tags.iter().any(|t| t == part) {
            tags.push(part.to_string());
        }
    }

    for segment in complete_segments(&lower) {
        if !tags.contains(&segment) {
            tags.push(segment);
        }
    }

    tags
}

/// Tag set enriched with the channel's model aliases.
///
/// Every `model_aliases` entry whose *value* resolves to this model id
/// contributes its key — both verbatim and split into fragments — so a user
/// can query by the short name the channel advertises.
pub fn extract_tags_with_aliases(model_id: &str, channel: &Channel) -> Vec<String> {
    let mut tags = extract_tags(model_id);

    let lower_id = model_id.to_lowercase();
    for (alias, target) in &channel.model_aliases {
        if target.to_lowercase() != lower_id {
            continue;
        }
        let alias_lower = alias.to_lowercase();
        if !tags.contains(&alias_lower) {
            tags.push(alias_lower);
        }
        for tag in extract_tags(alias) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }

    tags
}

/// Extract complete top-level segments worth matching verbatim.
///
/// A segment qualifies when it is ≥ 3 chars, mixes letters with digits or
/// dashes (model family names like `gpt-4o`, `qwen3-8b`), and is not a bare
/// provider prefix or generic suffix token.
fn complete_segments(lower_id: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();

    for segment in lower_id.split(['/', ':', '@']) {
        let segment = segment.trim();
        if segment.len() < 3 {
            continue;
        }
        if PROVIDER_PREFIXES.contains(&segment) || SUFFIX_TOKENS.contains(&segment) {
            continue;
        }
        let has_letter = segment.chars().any(|c| c.is_ascii_alphabetic());
        let has_digit_or_dash = segment.chars().any(|c| c.is_ascii_digit() || c == '-');
        if !(has_letter && has_digit_or_dash) {
            continue;
        }

        if !segments.contains(&segment.to_string()) {
            segments.push(segment.to_string());
        }

        if let Some(stripped) = strip_date_suffix(segment) {
            if stripped.len() >= 3 && !segments.contains(&stripped) {
                segments.push(stripped);
            }
        }
    }

    segments
}

/// Remove a trailing release-date suffix (`-20240307`, `-250115`,
/// `-2024-03-07`) from a segment, returning the stripped form if any.
fn strip_date_suffix(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();

    // -YYYY-MM-DD
    if segment.len() > 11 && segment.is_char_boundary(segment.len() - 11) {
        let tail = &segment[segment.len() - 11..];
        let tb = tail.as_bytes();
        if tb[0] == b'-'
            && tb[5] == b'-'
            && tb[8] == b'-'
            && tail
                .chars()
                .enumerate()
                .all(|(i, c)| matches!(i, 0 | 5 | 8) || c.is_ascii_digit())
        {
            return Some(segment[..segment.len() - 11].to_string());
        }
    }

    // -YYYYMMDD or -YYMMDD
    for digits in [8usize, 6] {
        if segment.len() > digits + 1 {
            let start = segment.len() - digits - 1;
            if segment.is_char_boundary(start)
                && bytes[start] == b'-'
                && segment[start + 1..].chars().all(|c| c.is_ascii_digit())
            {
                return Some(segment[..start].to_string());
            }
        }
    }

    None
}
