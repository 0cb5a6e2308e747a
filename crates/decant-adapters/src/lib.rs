//! Adapter contracts for the external systems decant talks to: the
//! extraction model, the post stream, post revalidation, and the
//! reference catalog file.

mod catalog;
mod extraction;
mod reddit;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use decant_core::{is_sold_status, RawPost};
use decant_storage::FetchError;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use catalog::{load_reference_catalog, ReferenceCatalog};
pub use extraction::{
    parse_extraction_output, ChatCompletionsExtractor, ExtractionError, Extractor,
    ExtractorConfig, MalformedOutput, EXTRACTION_PROMPT,
};
pub use reddit::{
    RedditClient, RedditCredentials, RedditStatusLookup, RedditSubmissionStream, SeenSet,
    SubmissionData,
};

pub const CRATE_NAME: &str = "decant-adapters";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("post stream transport failed: {0}")]
    Transport(#[from] FetchError),
    #[error("post stream unavailable: {0}")]
    Unavailable(String),
}

/// Ordered, effectively infinite source of posts.
#[async_trait]
pub trait PostStream: Send {
    /// Waits for the next unseen post. `Ok(None)` means the source is exhausted.
    async fn next_post(&mut self) -> Result<Option<RawPost>, StreamError>;
}

/// Live state of a previously ingested post.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostStatus {
    pub flair: Option<String>,
    pub removed: bool,
}

impl PostStatus {
    pub fn is_sold(&self) -> bool {
        is_sold_status(self.flair.as_deref())
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("post {0} not found")]
    NotFound(String),
    #[error("post {0} is not accessible")]
    Forbidden(String),
    #[error("lookup for post {post_id} failed: {message}")]
    Transient { post_id: String, message: String },
}

impl LookupError {
    pub fn from_fetch(post_id: &str, err: FetchError) -> Self {
        match err.status() {
            Some(404) => LookupError::NotFound(post_id.to_string()),
            Some(403) => LookupError::Forbidden(post_id.to_string()),
            _ => LookupError::Transient {
                post_id: post_id.to_string(),
                message: err.to_string(),
            },
        }
    }

    /// True when the post is deleted or inaccessible rather than temporarily unreachable.
    pub fn is_gone(&self) -> bool {
        matches!(self, LookupError::NotFound(_) | LookupError::Forbidden(_))
    }
}

#[async_trait]
pub trait PostStatusLookup: Send + Sync {
    async fn post_status(&self, post_id: &str) -> Result<PostStatus, LookupError>;
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
