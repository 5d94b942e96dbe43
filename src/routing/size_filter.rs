//! Size-constraint predicates inside tag queries.
//!
//! A tag term like `>20b` or `<8ko` is not a tag — it is a constraint on the
//! candidate's parameter count or context window. Grammar:
//!
//! ```text
//! <op><number><unit>
//! op    ∈ { >, <, >=, <=, = }
//! unit  ∈ { b, m, k }           parameter count (billions/millions/thousands)
//!       ∈ { ki, i, mi }         input context (thousands / millions of tokens)
//!       ∈ { ko, o, mo }         output context
//! ```
//!
//! A candidate whose [`crate::catalog::ModelInfo`] lacks the relevant numeric
//! field fails the filter and is dropped.

use crate::catalog::ModelInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl SizeOp {
    fn matches(self, value: f64, target: f64) -> bool {
        match self {
            Self::Gt => value > target,
            Self::Lt => value < target,
            Self::Ge => value >= target,
            Self::Le => value <= target,
            Self::Eq => (value - target).abs() < 1e-6,
        }
    }
}

/// Which numeric field of the model the filter constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeKind {
    /// Parameter count; compared in billions.
    Params,
    /// Input context; compared in the predicate's unit (k or M tokens).
    InputContext,
    /// Output token limit.
    OutputContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizeFilter {
    pub op: SizeOp,
    pub value: f64,
    pub unit: String,
    pub kind: SizeKind,
}

/// Parse `>20b`, `<=8ko`, `=32ki` … Returns `None` for anything that is not a
/// size predicate (so plain tags flow through tag matching untouched).
pub fn parse_size_filter(term: &str) -> Option<SizeFilter> {
    let term = term.trim();

    let (op, rest) = if let Some(r) = term.strip_prefix(">=") {
        (SizeOp::Ge, r)
    } else if let Some(r) = term.strip_prefix("<=") {
        (SizeOp::Le, r)
    } else if let Some(r) = term.strip_prefix('>') {
        (SizeOp::Gt, r)
    } else if let Some(r) = term.strip_prefix('<') {
        (SizeOp::Lt, r)
    } else if let Some(r) = term.strip_prefix('=') {
        (SizeOp::Eq, r)
    } else {
        return None;
    };

    let digits_end = rest
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    let (number, unit) = rest.split_at(digits_end);
    let value: f64 = number.parse().ok()?;
    let unit = unit.to_lowercase();

    let kind = match unit.as_str() {
        "b" | "m" | "k" => SizeKind::Params,
        "ki" | "i" | "mi" => SizeKind::InputContext,
        "ko" | "o" | "mo" => SizeKind::OutputContext,
        _ => return None,
    };

    Some(SizeFilter { op, value, unit, kind })
}

impl SizeFilter {
    /// Does this model satisfy the constraint? Missing fields fail.
    pub fn matches(&self, info: &ModelInfo) -> bool {
        match self.kind {
            SizeKind::Params => {
                let Some(millions) = info.specs.parameter_count else { return false };
                let billions = millions as f64 / 1000.0;
                let value_billions = match self.unit.as_str() {
                    "b" => self.value,
                    "m" => self.value / 1000.0,
                    "k" => self.value / 1_000_000.0,
                    _ => return false,
                };
                self.op.matches(billions, value_billions)
            }
            SizeKind::InputContext => {
                let Some(context) = info.specs.context_length else { return false };
                let scaled = match self.unit.as_str() {
                    "ki" | "i" => context as f64 / 1000.0,
                    "mi" => context as f64 / 1_000_000.0,
                    _ => return false,
                };
                self.op.matches(scaled, self.value)
            }
            SizeKind::OutputContext => {
                let Some(output) =
                    info.specs.max_output_tokens.or(info.specs.context_length)
                else {
                    return false;
                };
                let scaled = match self.unit.as_str() {
                    "ko" | "o" => output as f64 / 1000.0,
                    "mo" => output as f64 / 1_000_000.0,
                    _ => return false,
                };
                self.op.matches(scaled, self.value)
            }
        }
    }
}

/// Keep only the candidates (paired with their resolved info) that satisfy
/// every filter.
pub fn apply_size_filters<T>(
    candidates: Vec<(T, ModelInfo)>,
    filters: &[SizeFilter],
) -> Vec<(T, ModelInfo)> {
    if filters.is_empty() {
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|(_, info)| filters.iter().all(|f| f.matches(info)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelInfo;

    fn info(params_millions: Option<u64>, context: Option<u64>) -> ModelInfo {
        let mut info = ModelInfo::inferred("test-model");
        info.specs.parameter_count = params_millions;
        info.specs.context_length = context;
        info
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parses_parameter_predicates() {
        let f = parse_size_filter(">20b").unwrap();
        assert_eq!(f.op, SizeOp::Gt);
        assert_eq!(f.value, 20.0);
        assert_eq!(f.kind, SizeKind::Params);

        assert_eq!(parse_size_filter("<=70b").unwrap().op, SizeOp::Le);
        assert_eq!(parse_size_filter(">=500m").unwrap().kind, SizeKind::Params);
        assert_eq!(parse_size_filter("=7b").unwrap().op, SizeOp::Eq);
    }

    #[test]
    fn parses_context_predicates() {
        assert_eq!(parse_size_filter("<8ko").unwrap().kind, SizeKind::OutputContext);
        assert_eq!(parse_size_filter(">32ki").unwrap().kind, SizeKind::InputContext);
        assert_eq!(parse_size_filter(">1mi").unwrap().kind, SizeKind::InputContext);
        assert_eq!(parse_size_filter(">100i").unwrap().kind, SizeKind::InputContext);
    }

    #[test]
    fn plain_tags_are_not_size_filters() {
        assert!(parse_size_filter("claude").is_none());
        assert!(parse_size_filter("free").is_none());
        assert!(parse_size_filter("8b").is_none());
        assert!(parse_size_filter(">8x").is_none());
        assert!(parse_size_filter(">").is_none());
    }

    #[test]
    fn fractional_values_parse() {
        let f = parse_size_filter(">1.5b").unwrap();
        assert!((f.value - 1.5).abs() < f64::EPSILON);
    }

    // -----------------------------------------------------------------------
    // Matching
    // -----------------------------------------------------------------------

    #[test]
    fn parameter_comparison_in_billions() {
        let f = parse_size_filter(">20b").unwrap();
        assert!(f.matches(&info(Some(30_000), None))); // 30 B
        assert!(!f.matches(&info(Some(7_000), None))); // 7 B
        assert!(!f.matches(&info(Some(20_000), None))); // exactly 20 B, strict >
    }

    #[test]
    fn parameter_units_normalise() {
        // >500m means > 0.5 B
        let f = parse_size_filter(">500m").unwrap();
        assert!(f.matches(&info(Some(1_000), None))); // 1 B
        assert!(!f.matches(&info(Some(270), None))); // 0.27 B
    }

    #[test]
    fn equality_uses_tolerance() {
        let f = parse_size_filter("=8b").unwrap();
        assert!(f.matches(&info(Some(8_000), None)));
        assert!(!f.matches(&info(Some(8_100), None)));
    }

    #[test]
    fn input_context_comparison_in_thousands() {
        let f = parse_size_filter(">100ki").unwrap();
        assert!(f.matches(&info(None, Some(128_000))));
        assert!(!f.matches(&info(None, Some(32_000))));
    }

    #[test]
    fn output_context_falls_back_to_context_length() {
        let f = parse_size_filter("<8ko").unwrap();
        assert!(f.matches(&info(None, Some(4_000))));
        assert!(!f.matches(&info(None, Some(16_000))));
    }

    #[test]
    fn missing_field_fails_the_filter() {
        let f = parse_size_filter(">20b").unwrap();
        assert!(!f.matches(&info(None, Some(128_000))));

        let f = parse_size_filter(">32ki").unwrap();
        assert!(!f.matches(&info(Some(8_000), None)));
    }

    // -----------------------------------------------------------------------
    // apply_size_filters
    // -----------------------------------------------------------------------

    #[test]
    fn all_filters_must_pass() {
        let filters = vec![
            parse_size_filter(">20b").unwrap(),
            parse_size_filter(">100ki").unwrap(),
        ];
        let candidates = vec![
            ("big-long", info(Some(70_000), Some(200_000))),
            ("big-short", info(Some(70_000), Some(8_000))),
            ("small-long", info(Some(7_000), Some(200_000))),
        ];
        let kept = apply_size_filters(candidates, &filters);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0, "big-long");
    }

    #[test]
    fn empty_filter_list_keeps_everything() {
        let candidates = vec![("a", info(None, None))];
        assert_eq!(apply_size_filters(candidates, &[]).len(), 1);
    }
}
