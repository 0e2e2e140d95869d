use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ProductId;
use crate::domain::suitability::RaisedFlag;

/// The cacheable AI features. Chat is deliberately absent: conversations are
/// stateful per session and never go through the shared result cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Recommend,
    Suitability,
    Extraction,
    Explain,
}

impl Feature {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Recommend => "recommend",
            Self::Suitability => "suitability",
            Self::Extraction => "extraction",
            Self::Explain => "explain",
        }
    }
}

/// Client profile as supplied by the recommendation feature.
///
/// Field order matters: fingerprints are computed over the serialized form,
/// and serde emits struct fields in declaration order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub client_id: String,
    pub age: u8,
    pub annual_income: Decimal,
    pub risk_tolerance: RiskTolerance,
    pub investment_horizon_years: u8,
    pub objectives: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
    Conservative,
    Balanced,
    Aggressive,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateProduct {
    pub product_id: ProductId,
    pub name: String,
    pub category: String,
    pub risk_rating: u8,
    pub minimum_investment: Decimal,
}

/// Point-in-time view of an application used for suitability checking.
/// Fields use a BTreeMap so the canonical JSON form is stable regardless of
/// insertion order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSnapshot {
    pub application_id: String,
    pub client_id: String,
    pub fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub quote_id: String,
    pub product_id: ProductId,
    pub premium: Decimal,
    pub coverage_amount: Decimal,
    pub term_years: u8,
    pub riders: Vec<String>,
}

/// Already-extracted document text; OCR happens upstream of this layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentText {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecommendedProduct {
    pub product_id: ProductId,
    pub rank: u8,
    pub rationale: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    pub items: Vec<RecommendedProduct>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuitabilityReport {
    pub passed: bool,
    pub flags: Vec<RaisedFlag>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub fields: BTreeMap<String, serde_json::Value>,
    pub confidence: Confidence,
    pub requires_review: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub explanation: String,
}

/// Tagged union of every validated feature result. This is the payload the
/// response cache stores; callers narrow it back to the concrete type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "feature", rename_all = "snake_case")]
pub enum FeatureResult {
    Recommendations(Recommendations),
    Suitability(SuitabilityReport),
    Extraction(ExtractedFields),
    Explanation(Explanation),
}
