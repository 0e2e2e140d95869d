//! Deterministic prompt compilation.
//!
//! Each feature renders through a versioned tera template. Cache fingerprints
//! are computed over the normalized business input plus the template version,
//! never over the rendered prompt text: wording edits that do not change the
//! version leave caches intact, while a version bump invalidates exactly the
//! feature it belongs to.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tera::Tera;
use thiserror::Error;

use crate::domain::chat::{ChatMessage, ChatRole};
use crate::domain::feature::{
    ApplicationSnapshot, CandidateProduct, ClientProfile, DocumentText, Feature, QuoteSnapshot,
};

pub const RECOMMEND_TEMPLATE_VERSION: u32 = 2;
pub const SUITABILITY_TEMPLATE_VERSION: u32 = 3;
pub const EXTRACTION_TEMPLATE_VERSION: u32 = 1;
pub const EXPLAIN_TEMPLATE_VERSION: u32 = 1;
pub const CHAT_TEMPLATE_VERSION: u32 = 2;

const RECOMMEND_TEMPLATE: &str = r#"You are an adviser assistant ranking products for a client.

Client profile:
- age: {{ profile.age }}
- annual income: {{ profile.annual_income }}
- risk tolerance: {{ profile.risk_tolerance }}
- investment horizon: {{ profile.investment_horizon_years }} years
- objectives: {{ profile.objectives | join(sep=", ") }}

Candidate products:
{% for product in candidates -%}
- {{ product.product_id }}: {{ product.name }} ({{ product.category }}, risk {{ product.risk_rating }}/5, minimum {{ product.minimum_investment }})
{% endfor %}
Rank the three best-suited products. Respond with JSON only:
{"items": [{"product_id": "...", "rank": 1, "rationale": "..."}]}
Ranks must be 1, 2, 3 with no duplicates, ordered best first."#;

const SUITABILITY_TEMPLATE: &str = r#"You are a compliance reviewer checking an application for suitability issues.

Application {{ application.application_id }} for client {{ application.client_id }}:
{% for key, value in application.fields -%}
- {{ key }}: {{ value }}
{% endfor %}
Product under consideration: {{ product.name }} ({{ product.product_id }}, risk {{ product.risk_rating }}/5, minimum {{ product.minimum_investment }}).

Identify every mismatch between the application and the product. Respond with JSON only:
{"passed": true|false, "flags": [{"item_id": "...", "field": "...", "severity": "advisory"|"warning"|"blocking", "issue": "...", "suggestion": "..."}]}"#;

const EXTRACTION_TEMPLATE: &str = r#"Extract the structured fields from the following document text.

---
{{ document.text }}
---

Respond with JSON only:
{"fields": {"...": "..."}, "confidence": "high"|"medium"|"low", "requires_review": true|false}
Set requires_review to true whenever confidence is not high or a field is ambiguous."#;

const EXPLAIN_TEMPLATE: &str = r#"Explain this quote to the client in plain language.

Quote {{ quote.quote_id }}:
- product: {{ quote.product_id }}
- premium: {{ quote.premium }}
- coverage: {{ quote.coverage_amount }}
- term: {{ quote.term_years }} years
- riders: {{ quote.riders | join(sep=", ") }}

Respond with JSON only: {"explanation": "..."}"#;

const CHAT_TEMPLATE: &str = r#"You are the product assistant for a financial advice platform. Answer concisely and never invent product terms or prices.

Page context: {{ page_context }}
{% if session_context %}Session context: {{ session_context }}
{% endif %}
Conversation so far:
{% for message in messages -%}
{{ message.speaker }}: {{ message.content }}
{% endfor -%}
assistant:"#;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("template rendering failed for `{template}`: {source}")]
    Render { template: &'static str, source: tera::Error },
    #[error("template registration failed: {0}")]
    Register(tera::Error),
    #[error("input could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Hex SHA-256 over (feature tag, canonical input JSON, template version).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub String);

#[derive(Clone, Debug)]
pub struct CompiledPrompt {
    pub feature: Feature,
    pub text: String,
    pub fingerprint: Fingerprint,
}

pub struct PromptCompiler {
    tera: Tera,
}

impl PromptCompiler {
    pub fn new() -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        tera.add_raw_templates([
            ("recommend", RECOMMEND_TEMPLATE),
            ("suitability", SUITABILITY_TEMPLATE),
            ("extraction", EXTRACTION_TEMPLATE),
            ("explain", EXPLAIN_TEMPLATE),
            ("chat", CHAT_TEMPLATE),
        ])
        .map_err(PromptError::Register)?;
        Ok(Self { tera })
    }

    pub fn recommend(
        &self,
        profile: &ClientProfile,
        candidates: &[CandidateProduct],
    ) -> Result<CompiledPrompt, PromptError> {
        let mut context = tera::Context::new();
        context.insert("profile", profile);
        context.insert("candidates", candidates);
        let text = self.render("recommend", &context)?;
        let fingerprint = fingerprint(
            Feature::Recommend,
            &serde_json::to_value((profile, candidates))?,
            RECOMMEND_TEMPLATE_VERSION,
        );
        Ok(CompiledPrompt { feature: Feature::Recommend, text, fingerprint })
    }

    pub fn suitability(
        &self,
        application: &ApplicationSnapshot,
        product: &CandidateProduct,
    ) -> Result<CompiledPrompt, PromptError> {
        let mut context = tera::Context::new();
        context.insert("application", application);
        context.insert("product", product);
        let text = self.render("suitability", &context)?;
        let fingerprint = fingerprint(
            Feature::Suitability,
            &serde_json::to_value((application, product))?,
            SUITABILITY_TEMPLATE_VERSION,
        );
        Ok(CompiledPrompt { feature: Feature::Suitability, text, fingerprint })
    }

    pub fn extraction(&self, document: &DocumentText) -> Result<CompiledPrompt, PromptError> {
        let mut context = tera::Context::new();
        context.insert("document", document);
        let text = self.render("extraction", &context)?;
        let fingerprint = fingerprint(
            Feature::Extraction,
            &serde_json::to_value(document)?,
            EXTRACTION_TEMPLATE_VERSION,
        );
        Ok(CompiledPrompt { feature: Feature::Extraction, text, fingerprint })
    }

    pub fn explain(&self, quote: &QuoteSnapshot) -> Result<CompiledPrompt, PromptError> {
        let mut context = tera::Context::new();
        context.insert("quote", quote);
        let text = self.render("explain", &context)?;
        let fingerprint = fingerprint(
            Feature::Explain,
            &serde_json::to_value(quote)?,
            EXPLAIN_TEMPLATE_VERSION,
        );
        Ok(CompiledPrompt { feature: Feature::Explain, text, fingerprint })
    }

    /// Chat prompts carry no fingerprint: conversations bypass the cache.
    pub fn chat(
        &self,
        page_context: &str,
        session_context: &str,
        messages: &[ChatMessage],
    ) -> Result<String, PromptError> {
        #[derive(Serialize)]
        struct Line<'a> {
            speaker: &'static str,
            content: &'a str,
        }

        let lines: Vec<Line<'_>> = messages
            .iter()
            .map(|message| Line {
                speaker: match message.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                },
                content: &message.content,
            })
            .collect();

        let mut context = tera::Context::new();
        context.insert("page_context", page_context);
        context.insert("session_context", session_context);
        context.insert("messages", &lines);
        self.render("chat", &context)
    }

    fn render(
        &self,
        template: &'static str,
        context: &tera::Context,
    ) -> Result<String, PromptError> {
        self.tera
            .render(template, context)
            .map_err(|source| PromptError::Render { template, source })
    }
}

fn fingerprint(feature: Feature, normalized_input: &serde_json::Value, version: u32) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(feature.tag().as_bytes());
    hasher.update([0]);
    hasher.update(normalized_input.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(version.to_be_bytes());
    Fingerprint(bytes_to_hex(&hasher.finalize()))
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
