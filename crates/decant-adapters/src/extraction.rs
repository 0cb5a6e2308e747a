use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use decant_core::{parse_amount, ExtractedListing, DEFAULT_CURRENCY, DEFAULT_QUANTITY};
use decant_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error};

/// Fixed instruction sent ahead of every post.
pub const EXTRACTION_PROMPT: &str = r#"Extract perfume listings from the following Reddit post and return ONLY a valid JSON array of objects with this structure:

[
    {"name": "First Perfume", "quantity": "100ml", "cost": 50, "currency": "USD"},
    {"name": "Second Perfume", "quantity": "50ml", "cost": 35, "currency": "USD"}
]

Formatting rules:
- Do NOT include any text, explanations, or markdown. Output must be raw JSON only.
- "cost" must always be a number (e.g. 50). If the price is missing, use "" instead of null.
- "quantity" must always be a string (e.g. "100ml"). If missing, default to "50ml".
- "currency" must always be a string (e.g. "USD"). If missing, default to "USD".
- Do not return null values; apply the defaults above instead.

Now extract data from this Reddit post and return ONLY the JSON array:"#;

const NAME_KEYS: &[&str] = &["name", "Perfume_name", "perfume_name"];
const QUANTITY_KEYS: &[&str] = &["quantity", "bottle_quantity"];
const COST_KEYS: &[&str] = &["cost", "bottle_cost", "price"];
const CURRENCY_KEYS: &[&str] = &["currency"];

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction request failed: {0}")]
    Request(#[from] FetchError),
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("extraction response carried no message content")]
    EmptyResponse,
}

impl ExtractionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractionError::Request(err) => err.is_retryable(),
            ExtractionError::Timeout(_) => true,
            ExtractionError::EmptyResponse => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("extraction output is not a JSON array of records: {0}")]
pub struct MalformedOutput(String);

/// Turns free text into priced listings. Implementations must never return
/// records without a usable cost.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedListing>, ExtractionError>;
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com/v1".to_string(),
            api_key: None,
            model: "deepseek-chat".to_string(),
            temperature: 0.1,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Extractor backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsExtractor {
    http: Arc<HttpFetcher>,
    config: ExtractorConfig,
}

impl ChatCompletionsExtractor {
    pub fn new(http: Arc<HttpFetcher>, config: ExtractorConfig) -> Self {
        Self { http, config }
    }

    async fn complete(&self, text: &str) -> Result<String, ExtractionError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: EXTRACTION_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
        };

        let response: ChatResponse = self
            .http
            .send_json("chat_completions", |client| {
                let request = client.post(&url).json(&body);
                match &self.config.api_key {
                    Some(key) => request.bearer_auth(key),
                    None => request,
                }
            })
            .await?;

        response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(ExtractionError::EmptyResponse)
    }
}

#[async_trait]
impl Extractor for ChatCompletionsExtractor {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedListing>, ExtractionError> {
        let raw = tokio::time::timeout(self.config.timeout, self.complete(text))
            .await
            .map_err(|_| ExtractionError::Timeout(self.config.timeout))??;

        match parse_extraction_output(&raw) {
            Ok(listings) => {
                debug!(count = listings.len(), "extraction produced listings");
                Ok(listings)
            }
            Err(err) => {
                error!(error = %err, response = %raw, "unable to parse extraction response");
                Ok(Vec::new())
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Parses raw model output into listings.
///
/// The only shape check is "array of objects". Non-object elements are
/// skipped, fields are read with defaults, and records without a positive
/// cost are dropped.
pub fn parse_extraction_output(raw: &str) -> Result<Vec<ExtractedListing>, MalformedOutput> {
    let body = strip_code_fence(raw.trim());
    let value: JsonValue =
        serde_json::from_str(body).map_err(|err| MalformedOutput(err.to_string()))?;
    let items = match value {
        JsonValue::Array(items) => items,
        other => {
            return Err(MalformedOutput(format!("expected array, got {}", kind_of(&other))));
        }
    };

    Ok(items
        .iter()
        .filter_map(JsonValue::as_object)
        .filter_map(listing_from_object)
        .collect())
}

fn listing_from_object(obj: &Map<String, JsonValue>) -> Option<ExtractedListing> {
    let cost = first_field(obj, COST_KEYS)
        .and_then(json_amount)
        .filter(|c| *c > 0.0)?;

    Some(ExtractedListing {
        name: first_field(obj, NAME_KEYS)
            .and_then(json_text)
            .unwrap_or_default(),
        quantity: first_field(obj, QUANTITY_KEYS)
            .and_then(json_text)
            .unwrap_or_else(|| DEFAULT_QUANTITY.to_string()),
        cost,
        currency: first_field(obj, CURRENCY_KEYS)
            .and_then(json_text)
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
    })
}

fn first_field<'a>(obj: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn json_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn json_amount(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_amount(s),
        _ => None,
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_listing_with_canonical_fields() {
        let out = parse_extraction_output(
            r#"[{"name": "Perfume X", "quantity": "100ml", "cost": 50, "currency": "USD"}]"#,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![ExtractedListing {
                name: "Perfume X".into(),
                quantity: "100ml".into(),
                cost: 50.0,
                currency: "USD".into(),
            }]
        );
    }

    #[test]
    fn applies_defaults_and_accepts_legacy_field_names() {
        let out = parse_extraction_output(
            r#"[{"Perfume_name": "Perfume Y", "bottle_cost": "$35.50", "bottle_quantity": ""}]"#,
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Perfume Y");
        assert_eq!(out[0].cost, 35.5);
        assert_eq!(out[0].quantity, DEFAULT_QUANTITY);
        assert_eq!(out[0].currency, DEFAULT_CURRENCY);
    }

    #[test]
    fn drops_records_without_usable_cost() {
        let out = parse_extraction_output(
            r#"[
                {"name": "No Cost"},
                {"name": "Blank", "cost": ""},
                {"name": "Zero", "cost": 0},
                {"name": "Null", "cost": null},
                {"name": "Kept", "cost": 12},
                {"name": "Plus Shipping", "cost": "$45 + $5 shipping"},
                {"name": "Size Then Price", "cost": "100ml for $30"},
                {"name": "Kept Text", "cost": "$27.50"}
            ]"#,
        )
        .unwrap();
        let names: Vec<_> = out.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Kept", "Kept Text"]);
        assert_eq!(out[1].cost, 27.5);
    }

    #[test]
    fn non_json_and_non_array_output_is_malformed() {
        assert!(parse_extraction_output("Sure! Here are the perfumes you asked for").is_err());
        assert!(parse_extraction_output(r#"{"name": "Perfume X", "cost": 50}"#).is_err());
    }

    #[test]
    fn skips_non_object_elements_and_tolerates_code_fences() {
        let out = parse_extraction_output(
            "```json\n[\"stray\", 7, {\"name\": \"Perfume Z\", \"cost\": 20}]\n```",
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Perfume Z");
    }

    #[test]
    fn empty_array_is_valid_and_empty() {
        assert!(parse_extraction_output("[]").unwrap().is_empty());
    }

    #[test]
    fn timeouts_are_retryable_but_empty_responses_are_not() {
        assert!(ExtractionError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!ExtractionError::EmptyResponse.is_retryable());
    }
}
