//! Ingestion and reconciliation service for decant listings.
//!
//! Wires the post stream, extraction model, catalog matcher, listing store,
//! derived view, and daily cleanup into one long-running service.

mod cleanup;
mod config;
pub mod matcher;
mod pipeline;
mod view;

use std::sync::Arc;

use anyhow::{Context, Result};
use decant_adapters::{
    load_reference_catalog, ChatCompletionsExtractor, Extractor, PostStatusLookup,
    RedditClient, RedditStatusLookup, RedditSubmissionStream, ReferenceCatalog,
};
use decant_storage::{HttpFetcher, StoreHandle};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub use cleanup::{build_cleanup_scheduler, CleanupSummary, CleanupTask};
pub use config::SyncConfig;
pub use matcher::{best_match, ScoredMatch};
pub use pipeline::{IngestionPipeline, IngestionStats, PostOutcome};
pub use view::{rebuild_lowest_prices, ViewPublisher, DEFAULT_LOWEST_PER_ITEM};

pub const CRATE_NAME: &str = "decant-sync";

/// Resolves once `true` is published on `shutdown` or every sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Shared state every task of the service works against.
pub struct Service {
    pub config: SyncConfig,
    pub catalog: Arc<ReferenceCatalog>,
    pub store: StoreHandle,
    pub view: Arc<ViewPublisher>,
}

impl Service {
    /// Loads the catalog and opens the store. A missing or unreadable catalog
    /// is fatal; there is nothing sensible to match against without it.
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let catalog = load_reference_catalog(&config.catalog_path)
            .with_context(|| format!("loading reference catalog {}", config.catalog_path.display()))?;
        let store = StoreHandle::open(&config.listings_path).await?;
        let view = ViewPublisher::new(&config.lowest_prices_path, config.lowest_per_item);
        info!(
            catalog_entries = catalog.len(),
            stored_listings = store.len().await,
            "service state loaded"
        );
        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            store,
            view: Arc::new(view),
        })
    }

    pub fn pipeline(&self, extractor: Arc<dyn Extractor>) -> IngestionPipeline {
        IngestionPipeline::new(
            self.config.keyword.clone(),
            self.catalog.clone(),
            extractor,
            self.store.clone(),
            self.view.clone(),
        )
        .with_extraction_backoff(self.config.extraction_backoff())
        .with_reconnect_backoff(self.config.reconnect_backoff())
    }

    pub fn cleanup_task(&self, lookup: Arc<dyn PostStatusLookup>) -> CleanupTask {
        CleanupTask::new(lookup, self.store.clone(), self.view.clone())
    }

    pub fn extractor(&self) -> Result<Arc<dyn Extractor>> {
        if self.config.llm_api_key.is_none() {
            warn!("DEEPSEEK_API_KEY is not set; extraction requests will be unauthenticated");
        }
        let http = Arc::new(HttpFetcher::new(self.config.llm_http_config())?);
        Ok(Arc::new(ChatCompletionsExtractor::new(
            http,
            self.config.extractor_config(),
        )))
    }

    pub fn reddit_client(&self) -> Result<Arc<RedditClient>> {
        let http = Arc::new(HttpFetcher::new(self.config.reddit_http_config())?);
        Ok(Arc::new(RedditClient::new(http, self.config.reddit_credentials()?)))
    }

    /// Rewrites the derived view from the current store contents.
    pub async fn rebuild_view(&self) -> Result<usize> {
        self.view.publish(&self.store).await
    }
}

/// Runs ingestion and the cleanup scheduler until `shutdown` flips to `true`.
pub async fn run_service(config: SyncConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let service = Service::open(config).await?;
    let reddit = service.reddit_client()?;
    let extractor = service.extractor()?;

    // Bring the view in line with whatever the store held at startup.
    service.rebuild_view().await?;

    let scheduler = if service.config.cleanup_enabled {
        let task = Arc::new(service.cleanup_task(Arc::new(RedditStatusLookup::new(reddit.clone()))));
        let sched = build_cleanup_scheduler(&service.config.cleanup_cron, task).await?;
        sched.start().await.context("starting cleanup scheduler")?;
        info!(cron = %service.config.cleanup_cron, "cleanup scheduled");
        Some(sched)
    } else {
        None
    };

    let pipeline = service.pipeline(extractor);
    let mut stream = RedditSubmissionStream::new(
        reddit,
        service.config.subreddit.clone(),
        service.config.poll_interval(),
    );
    info!(subreddit = %service.config.subreddit, "starting ingestion");
    let ingestion = tokio::spawn(async move { pipeline.run(&mut stream, shutdown).await });

    let joined = ingestion.await;

    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            error!(error = %err, "cleanup scheduler did not shut down cleanly");
        }
    }

    let stats = joined.context("ingestion task panicked")?;
    info!(
        received = stats.received,
        persisted_posts = stats.persisted_posts,
        stream_failures = stats.stream_failures,
        "service stopped"
    );
    Ok(())
}

pub async fn run_cleanup_once(config: SyncConfig) -> Result<CleanupSummary> {
    let service = Service::open(config).await?;
    let reddit = service.reddit_client()?;
    let task = service.cleanup_task(Arc::new(RedditStatusLookup::new(reddit)));
    task.run_once().await
}

pub async fn rebuild_view_once(config: SyncConfig) -> Result<usize> {
    let service = Service::open(config).await?;
    service.rebuild_view().await
}
