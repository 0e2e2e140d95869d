//! Strict validation of raw model text into typed feature results.
//!
//! The provider returns loosely-structured text; nothing downstream trusts it
//! until it has passed the per-feature contract here. A contract breach is a
//! `ValidationFailure`, which is a different animal from upstream
//! unavailability: the orchestrator answers it with exactly one repair retry,
//! never with a transport retry.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::feature::{
    Confidence, ExtractedFields, Explanation, Feature, FeatureResult, Recommendations,
    RecommendedProduct, SuitabilityReport,
};
use crate::domain::suitability::{RaisedFlag, Severity};
use crate::domain::ProductId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("output is not valid JSON: {0}")]
    Json(String),
    #[error("output violates the {feature} contract: {detail}")]
    Contract { feature: &'static str, detail: String },
}

impl ValidationFailure {
    fn contract(feature: Feature, detail: impl Into<String>) -> Self {
        Self::Contract { feature: feature.tag(), detail: detail.into() }
    }
}

pub fn validate(feature: Feature, raw_text: &str) -> Result<FeatureResult, ValidationFailure> {
    let body = strip_code_fence(raw_text);
    match feature {
        Feature::Recommend => validate_recommend(body).map(FeatureResult::Recommendations),
        Feature::Suitability => validate_suitability(body).map(FeatureResult::Suitability),
        Feature::Extraction => validate_extraction(body).map(FeatureResult::Extraction),
        Feature::Explain => validate_explain(body).map(FeatureResult::Explanation),
    }
}

/// Providers routinely wrap JSON in a Markdown fence. Stripping it is
/// normalization of the envelope, not leniency about the contract.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}

fn parse<T: for<'de> Deserialize<'de>>(
    feature: Feature,
    body: &str,
) -> Result<T, ValidationFailure> {
    serde_json::from_str(body).map_err(|err| {
        if serde_json::from_str::<serde_json::Value>(body).is_err() {
            ValidationFailure::Json(err.to_string())
        } else {
            ValidationFailure::contract(feature, err.to_string())
        }
    })
}

#[derive(Deserialize)]
struct RawRecommendations {
    items: Vec<RawRecommendedProduct>,
}

#[derive(Deserialize)]
struct RawRecommendedProduct {
    product_id: String,
    rank: u8,
    rationale: String,
}

fn validate_recommend(body: &str) -> Result<Recommendations, ValidationFailure> {
    let raw: RawRecommendations = parse(Feature::Recommend, body)?;
    if raw.items.is_empty() || raw.items.len() > 3 {
        return Err(ValidationFailure::contract(
            Feature::Recommend,
            format!("expected 1..=3 ranked items, got {}", raw.items.len()),
        ));
    }

    let mut seen_ranks = [false; 3];
    let mut items = Vec::with_capacity(raw.items.len());
    for item in raw.items {
        if !(1..=3).contains(&item.rank) {
            return Err(ValidationFailure::contract(
                Feature::Recommend,
                format!("rank {} is outside 1..=3", item.rank),
            ));
        }
        let slot = &mut seen_ranks[usize::from(item.rank) - 1];
        if *slot {
            return Err(ValidationFailure::contract(
                Feature::Recommend,
                format!("duplicate rank {}", item.rank),
            ));
        }
        *slot = true;
        if item.product_id.is_empty() || item.rationale.is_empty() {
            return Err(ValidationFailure::contract(
                Feature::Recommend,
                "product_id and rationale must be non-empty",
            ));
        }
        items.push(RecommendedProduct {
            product_id: ProductId(item.product_id),
            rank: item.rank,
            rationale: item.rationale,
        });
    }
    items.sort_by_key(|item| item.rank);
    Ok(Recommendations { items })
}

#[derive(Deserialize)]
struct RawSuitability {
    passed: bool,
    flags: Vec<RawFlag>,
}

#[derive(Deserialize)]
struct RawFlag {
    item_id: String,
    field: String,
    severity: String,
    issue: String,
    suggestion: String,
}

fn validate_suitability(body: &str) -> Result<SuitabilityReport, ValidationFailure> {
    let raw: RawSuitability = parse(Feature::Suitability, body)?;
    let mut flags = Vec::with_capacity(raw.flags.len());
    for flag in raw.flags {
        let severity = match flag.severity.as_str() {
            "advisory" => Severity::Advisory,
            "warning" => Severity::Warning,
            "blocking" => Severity::Blocking,
            other => {
                return Err(ValidationFailure::contract(
                    Feature::Suitability,
                    format!("unknown severity `{other}`"),
                ))
            }
        };
        if flag.item_id.is_empty() || flag.field.is_empty() || flag.issue.is_empty() {
            return Err(ValidationFailure::contract(
                Feature::Suitability,
                "item_id, field and issue must be non-empty",
            ));
        }
        flags.push(RaisedFlag {
            item_id: flag.item_id,
            field: flag.field,
            severity,
            issue: flag.issue,
            suggestion: flag.suggestion,
        });
    }
    Ok(SuitabilityReport { passed: raw.passed, flags })
}

#[derive(Deserialize)]
struct RawExtraction {
    fields: BTreeMap<String, serde_json::Value>,
    confidence: String,
    requires_review: bool,
}

fn validate_extraction(body: &str) -> Result<ExtractedFields, ValidationFailure> {
    let raw: RawExtraction = parse(Feature::Extraction, body)?;
    let confidence = match raw.confidence.as_str() {
        "high" => Confidence::High,
        "medium" => Confidence::Medium,
        "low" => Confidence::Low,
        other => {
            return Err(ValidationFailure::contract(
                Feature::Extraction,
                format!("unknown confidence `{other}`"),
            ))
        }
    };
    Ok(ExtractedFields { fields: raw.fields, confidence, requires_review: raw.requires_review })
}

#[derive(Deserialize)]
struct RawExplanation {
    explanation: String,
}

fn validate_explain(body: &str) -> Result<Explanation, ValidationFailure> {
    let raw: RawExplanation = parse(Feature::Explain, body)?;
    if raw.explanation.trim().is_empty() {
        return Err(ValidationFailure::contract(Feature::Explain, "explanation must be non-empty"));
    }
    Ok(Explanation { explanation: raw.explanation })
}
