//! Core domain model for the decant listing tracker.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "decant-core";

/// Flair text the marketplace uses to mark a finished sale.
pub const SOLD_STATUS: &str = "Sold";

/// Quantity recorded when the seller never states one.
pub const DEFAULT_QUANTITY: &str = "50ml";

/// Currency assumed when the seller never states one.
pub const DEFAULT_CURRENCY: &str = "USD";

/// One post as observed on the upstream platform. Read-only for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPost {
    pub id: String,
    pub title: String,
    pub body: String,
    pub flair: Option<String>,
    pub permalink: String,
    pub created_at: DateTime<Utc>,
}

impl RawPost {
    /// Case-insensitive substring match against title or body.
    pub fn mentions_keyword(&self, keyword: &str) -> bool {
        let needle = keyword.to_lowercase();
        self.title.to_lowercase().contains(&needle) || self.body.to_lowercase().contains(&needle)
    }

    /// Title and body joined by a space, trimmed.
    pub fn combined_text(&self) -> String {
        format!("{} {}", self.title, self.body).trim().to_string()
    }
}

/// One priced item pulled out of a post by the extraction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedListing {
    pub name: String,
    pub quantity: String,
    pub cost: f64,
    pub currency: String,
}

/// One row of the official reference catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub name: String,
    #[serde(alias = "url")]
    pub link: String,
    #[serde(alias = "is_in_stock", default)]
    pub available: bool,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub clone_of: Option<String>,
}

/// Persisted listing row. The field set is the on-disk column set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub post_id: String,
    pub status: Option<String>,
    pub item_name: String,
    pub permalink: String,
    pub cost: f64,
    pub clone_of: Option<String>,
    pub official_link: String,
    pub official_availability: bool,
    pub official_price: Option<f64>,
}

impl ListingRecord {
    pub fn from_match(post: &RawPost, extracted: &ExtractedListing, entry: &ReferenceEntry) -> Self {
        Self {
            post_id: post.id.clone(),
            status: post.flair.clone(),
            item_name: entry.name.clone(),
            permalink: post.permalink.clone(),
            cost: extracted.cost,
            clone_of: entry.clone_of.clone(),
            official_link: entry.link.clone(),
            official_availability: entry.available,
            official_price: entry.price,
        }
    }

    pub fn is_sold(&self) -> bool {
        is_sold_status(self.status.as_deref())
    }
}

pub fn is_sold_status(status: Option<&str>) -> bool {
    status
        .map(|s| s.trim().eq_ignore_ascii_case(SOLD_STATUS))
        .unwrap_or(false)
}

/// A single amount: optional currency code or symbol, one number, optional
/// trailing currency code. Anything else in the string rejects it.
static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[a-z]{3}\s*)?[$€£]?\s*(\d[\d,]*(?:\.\d+)?)\s*(?:[a-z]{3})?\s*$")
        .expect("amount pattern is valid")
});

/// Parses a money-ish string such as `"$1,250.00"` or `"45 USD"`.
///
/// Strings carrying more than one number (`"$45 + $5 shipping"`) or other
/// words (`"100ml for $30"`) are rejected rather than guessed at.
pub fn parse_amount(text: &str) -> Option<f64> {
    let caps = AMOUNT.captures(text)?;
    caps[1]
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AmountRepr {
    Number(f64),
    Text(String),
}

fn lenient_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<AmountRepr>::deserialize(deserializer)?;
    Ok(match raw {
        Some(AmountRepr::Number(n)) => Some(n),
        Some(AmountRepr::Text(t)) => parse_amount(&t),
        None => None,
    })
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()))
}
