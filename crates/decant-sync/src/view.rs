//! Lowest-price-per-item projection of the listing store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use decant_core::ListingRecord;
use decant_storage::{write_rows_atomically, StoreHandle};
use tokio::sync::Mutex;
use tracing::info;

pub const DEFAULT_LOWEST_PER_ITEM: usize = 5;

/// Drops sold rows, orders by (item name, cost), and keeps the first
/// `per_item` rows of each item. The sort is stable, so equal costs keep
/// their store order.
pub fn rebuild_lowest_prices(records: &[ListingRecord], per_item: usize) -> Vec<ListingRecord> {
    let mut live: Vec<&ListingRecord> = records.iter().filter(|r| !r.is_sold()).collect();
    live.sort_by(|a, b| {
        a.item_name
            .cmp(&b.item_name)
            .then_with(|| a.cost.total_cmp(&b.cost))
    });

    let mut taken: HashMap<&str, usize> = HashMap::new();
    live.into_iter()
        .filter(|r| {
            let count = taken.entry(r.item_name.as_str()).or_default();
            *count += 1;
            *count <= per_item
        })
        .cloned()
        .collect()
}

/// Writes the derived view file. Publishes are serialized so a slower
/// writer can never overwrite a newer view with an older snapshot.
#[derive(Debug)]
pub struct ViewPublisher {
    path: PathBuf,
    per_item: usize,
    lock: Mutex<()>,
}

impl ViewPublisher {
    pub fn new(path: impl Into<PathBuf>, per_item: usize) -> Self {
        Self {
            path: path.into(),
            per_item,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn publish(&self, store: &StoreHandle) -> anyhow::Result<usize> {
        let _guard = self.lock.lock().await;
        let live = store.scan(|r| !r.is_sold()).await;
        let view = rebuild_lowest_prices(&live, self.per_item);
        write_rows_atomically(&self.path, &view)
            .await
            .with_context(|| format!("writing derived view {}", self.path.display()))?;
        info!(
            path = %self.path.display(),
            rows = view.len(),
            per_item = self.per_item,
            "updated lowest prices view"
        );
        Ok(view.len())
    }
}
