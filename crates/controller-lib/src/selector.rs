//! Label selector matching
//!
//! Only `matchLabels` is evaluated. A selector that carries
//! `matchExpressions` is never considered a match, so a monitor written by
//! hand with set-based rules is left alone rather than guessed at.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;

/// True iff every `matchLabels` pair is present and equal in `labels`
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if has_expressions(selector) {
        return false;
    }
    match selector.match_labels.as_ref() {
        Some(required) => matches_labels(required, labels),
        None => true,
    }
}

/// Subset test on plain label maps
pub fn matches_labels(
    required: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    required
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

pub fn has_expressions(selector: &LabelSelector) -> bool {
    selector
        .match_expressions
        .as_ref()
        .is_some_and(|exprs| !exprs.is_empty())
}
