//! Streaming ingestion: keyword filter, extraction, reconciliation, persistence.

use std::sync::Arc;
use std::time::Duration;

use decant_adapters::{Extractor, PostStream, ReferenceCatalog};
use decant_core::{ExtractedListing, ListingRecord, RawPost};
use decant_storage::{BackoffPolicy, StoreHandle};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::matcher::best_match;
use crate::view::ViewPublisher;
use crate::wait_for_shutdown;

/// Where a single post ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    NoKeyword,
    EmptyText,
    NoListings,
    Persisted { inserted: usize, replaced: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub received: usize,
    pub filtered_out: usize,
    pub no_listings: usize,
    pub persisted_posts: usize,
    pub inserted_records: usize,
    pub failed_posts: usize,
    pub stream_failures: usize,
}

impl IngestionStats {
    fn record(&mut self, outcome: PostOutcome) {
        match outcome {
            PostOutcome::NoKeyword | PostOutcome::EmptyText => self.filtered_out += 1,
            PostOutcome::NoListings => self.no_listings += 1,
            PostOutcome::Persisted { inserted, .. } => {
                self.persisted_posts += 1;
                self.inserted_records += inserted;
            }
        }
    }
}

pub struct IngestionPipeline {
    keyword: String,
    catalog: Arc<ReferenceCatalog>,
    extractor: Arc<dyn Extractor>,
    store: StoreHandle,
    view: Arc<ViewPublisher>,
    extraction_backoff: BackoffPolicy,
    reconnect_backoff: Duration,
}

impl IngestionPipeline {
    pub fn new(
        keyword: impl Into<String>,
        catalog: Arc<ReferenceCatalog>,
        extractor: Arc<dyn Extractor>,
        store: StoreHandle,
        view: Arc<ViewPublisher>,
    ) -> Self {
        Self {
            keyword: keyword.into(),
            catalog,
            extractor,
            store,
            view,
            extraction_backoff: BackoffPolicy::default(),
            reconnect_backoff: Duration::from_secs(10),
        }
    }

    pub fn with_extraction_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.extraction_backoff = backoff;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Runs one post through filter, extraction, matching, and persistence.
    ///
    /// Re-processing a post id replaces its earlier rows.
    pub async fn process_post(&self, post: &RawPost) -> anyhow::Result<PostOutcome> {
        if !post.mentions_keyword(&self.keyword) {
            return Ok(PostOutcome::NoKeyword);
        }

        let text = post.combined_text();
        if text.is_empty() {
            return Ok(PostOutcome::EmptyText);
        }

        let extracted = self.extract_with_retry(&text).await;
        if extracted.is_empty() {
            info!(title = %post.title, "skipping post: no valid listings detected");
            return Ok(PostOutcome::NoListings);
        }

        let records = self.reconcile(post, &extracted);
        if records.is_empty() {
            warn!(title = %post.title, "skipping post: no listings could be matched");
            return Ok(PostOutcome::NoListings);
        }

        let outcome = self.store.replace_post(&post.id, records).await?;
        info!(
            title = %post.title,
            inserted = outcome.inserted,
            replaced = outcome.removed,
            "new post added"
        );
        self.view.publish(&self.store).await?;

        Ok(PostOutcome::Persisted {
            inserted: outcome.inserted,
            replaced: outcome.removed,
        })
    }

    /// Resolves each extracted name to a catalog entry and builds the rows.
    pub fn reconcile(&self, post: &RawPost, extracted: &[ExtractedListing]) -> Vec<ListingRecord> {
        extracted
            .iter()
            .filter_map(|listing| {
                let Some(matched) = best_match(&listing.name, self.catalog.names()) else {
                    warn!(name = %listing.name, "no reference candidates to match against");
                    return None;
                };
                let Some(entry) = self.catalog.lookup(matched.candidate) else {
                    warn!(candidate = %matched.candidate, "matched name missing from catalog");
                    return None;
                };
                debug!(
                    extracted = %listing.name,
                    matched = %entry.name,
                    score = matched.score,
                    cost = listing.cost,
                    "reconciled listing"
                );
                Some(ListingRecord::from_match(post, listing, entry))
            })
            .collect()
    }

    async fn extract_with_retry(&self, text: &str) -> Vec<ExtractedListing> {
        let mut attempt = 0usize;
        loop {
            match self.extractor.extract(text).await {
                Ok(listings) => return listings,
                Err(err) if err.is_retryable() && attempt < self.extraction_backoff.max_retries => {
                    let delay = self.extraction_backoff.delay_for_attempt(attempt);
                    warn!(error = %err, attempt, retry_in_ms = delay.as_millis() as u64, "extraction failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(error = %err, attempts = attempt + 1, "extraction failed; treating post as empty");
                    return Vec::new();
                }
            }
        }
    }

    /// Consumes `stream` one post at a time until shutdown or exhaustion.
    ///
    /// Per-post failures are logged and skipped. Stream failures are logged
    /// and retried after the reconnect backoff.
    pub async fn run<S>(&self, stream: &mut S, mut shutdown: watch::Receiver<bool>) -> IngestionStats
    where
        S: PostStream + ?Sized,
    {
        let mut stats = IngestionStats::default();
        let mut consecutive_failures = 0usize;
        info!(keyword = %self.keyword, "listening for new posts");

        loop {
            let next = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                next = stream.next_post() => next,
            };

            match next {
                Ok(Some(post)) => {
                    consecutive_failures = 0;
                    stats.received += 1;
                    let span = info_span!("ingest_post", post_id = %post.id);
                    let result = tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown) => {
                            info!(post_id = %post.id, "shutdown requested; abandoning in-flight post");
                            break;
                        }
                        result = self.process_post(&post).instrument(span) => result,
                    };
                    match result {
                        Ok(outcome) => stats.record(outcome),
                        Err(err) => {
                            stats.failed_posts += 1;
                            error!(post_id = %post.id, error = %err, "error processing post");
                        }
                    }
                }
                Ok(None) => {
                    info!("post stream exhausted");
                    break;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    stats.stream_failures += 1;
                    error!(
                        error = %err,
                        consecutive_failures,
                        retry_in_secs = self.reconnect_backoff.as_secs(),
                        "post stream failed; retrying"
                    );
                    tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = tokio::time::sleep(self.reconnect_backoff) => {}
                    }
                }
            }
        }

        info!(?stats, "ingestion stopped");
        stats
    }
}
