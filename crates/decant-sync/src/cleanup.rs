//! Daily revalidation of stored posts against the live platform.

use std::sync::Arc;

use anyhow::Context;
use decant_adapters::PostStatusLookup;
use decant_storage::StoreHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::view::ViewPublisher;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub checked: usize,
    pub removed_sold: usize,
    pub removed_missing: usize,
    pub kept: usize,
    pub transient_errors: usize,
    pub removed_records: usize,
}

pub struct CleanupTask {
    lookup: Arc<dyn PostStatusLookup>,
    store: StoreHandle,
    view: Arc<ViewPublisher>,
}

impl CleanupTask {
    pub fn new(lookup: Arc<dyn PostStatusLookup>, store: StoreHandle, view: Arc<ViewPublisher>) -> Self {
        Self { lookup, store, view }
    }

    /// Checks every distinct stored post id and drops rows for posts that are
    /// sold, removed, missing, or forbidden. Transient lookup failures keep the
    /// post. The store is persisted once at the end.
    pub async fn run_once(&self) -> anyhow::Result<CleanupSummary> {
        let run_id = Uuid::new_v4();
        self.sweep().instrument(info_span!("cleanup", %run_id)).await
    }

    async fn sweep(&self) -> anyhow::Result<CleanupSummary> {
        info!("running cleanup for sold/deleted posts");
        let mut summary = CleanupSummary::default();
        let mut doomed = Vec::new();

        // Lookups run without the store lock; ingestion keeps going meanwhile.
        for post_id in self.store.distinct_post_ids().await {
            summary.checked += 1;
            match self.lookup.post_status(&post_id).await {
                Ok(status) if status.is_sold() => {
                    info!(%post_id, "removing sold post");
                    summary.removed_sold += 1;
                    doomed.push(post_id);
                }
                Ok(status) if status.removed => {
                    info!(%post_id, "removing post taken down on the platform");
                    summary.removed_missing += 1;
                    doomed.push(post_id);
                }
                Ok(_) => summary.kept += 1,
                Err(err) if err.is_gone() => {
                    info!(%post_id, reason = %err, "post no longer exists; removing");
                    summary.removed_missing += 1;
                    doomed.push(post_id);
                }
                Err(err) => {
                    warn!(%post_id, error = %err, "revalidation failed; keeping post");
                    summary.transient_errors += 1;
                }
            }
        }

        summary.removed_records = self
            .store
            .remove_posts(&doomed)
            .await
            .context("persisting store after cleanup")?;
        if summary.removed_records > 0 {
            self.view.publish(&self.store).await?;
        }

        info!(
            checked = summary.checked,
            removed_sold = summary.removed_sold,
            removed_missing = summary.removed_missing,
            transient_errors = summary.transient_errors,
            "cleanup completed"
        );
        Ok(summary)
    }
}

/// Builds (but does not start) a scheduler running `task` on `cron`.
///
/// Cron expressions carry a seconds field and are evaluated in UTC.
pub async fn build_cleanup_scheduler(cron: &str, task: Arc<CleanupTask>) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let task = task.clone();
        Box::pin(async move {
            if let Err(err) = task.run_once().await {
                error!(error = %err, "scheduled cleanup failed");
            }
        })
    })
    .with_context(|| format!("creating cleanup job for cron {cron}"))?;
    sched.add(job).await.context("adding cleanup job")?;
    Ok(sched)
}
