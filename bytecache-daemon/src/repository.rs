//! Catalog repository.
//!
//! Sits between the remote catalog and the cache: [`CatalogRepository::refresh`]
//! pulls the whole catalog and writes it in one batch, and
//! [`CatalogRepository::observe_items`] exposes the cache as a live feed of
//! view items. Readers never talk to the network.

use bytecache_core::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::cache::{CacheStore, ItemFeed};
use crate::scheduler::{Job, JobOutcome};

/// Why a refresh cycle failed. The cache is untouched in every case.
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] SourceError),

    #[error("Mapping failed: {0}")]
    Mapping(#[from] MappingError),

    #[error("Cache write failed: {0}")]
    Write(String),
}

/// Summary of a successful refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub fetched: usize,
    pub written: usize,
    pub duration_ms: u64,
}

pub struct CatalogRepository {
    source: Arc<dyn CatalogSource>,
    store: Arc<dyn CacheStore>,
}

impl CatalogRepository {
    pub fn new(source: Arc<dyn CatalogSource>, store: Arc<dyn CacheStore>) -> Self {
        Self { source, store }
    }

    /// Live feed of cached items in their display form.
    pub fn observe_items(&self) -> ItemFeed<ViewItem> {
        self.store.read_all().with_mapper(ViewItem::from_persisted)
    }

    /// Fetch the full catalog and write it to the cache in one batch.
    ///
    /// Concurrent calls are allowed; each one is a separate atomic write and
    /// the last to commit wins per identifier.
    pub async fn refresh(&self) -> Result<RefreshReport, RefreshError> {
        let start = Instant::now();
        let source_id = self.source.id();
        info!("Refreshing catalog from '{}'", source_id);

        let wire_items = match self.source.fetch_catalog().await {
            Ok(items) => items,
            Err(e) => {
                error!("Fetch from '{}' failed: {}", source_id, e);
                return Err(e.into());
            }
        };
        let fetched = wire_items.len();
        debug!("Fetched {} entries from '{}'", fetched, source_id);

        let items = to_persisted(wire_items).inspect_err(|e| {
            error!("Discarding catalog from '{}': {}", source_id, e);
        })?;

        let store = Arc::clone(&self.store);
        let written = tokio::task::spawn_blocking(move || store.replace_all(&items))
            .await
            .map_err(|e| RefreshError::Write(format!("Write task failed: {}", e)))?
            .map_err(|e| {
                error!("Cache write failed: {:#}", e);
                RefreshError::Write(format!("{:#}", e))
            })?;

        let report = RefreshReport {
            fetched,
            written,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            "Refresh from '{}' complete: {} fetched, {} written in {}ms",
            source_id, report.fetched, report.written, report.duration_ms
        );

        Ok(report)
    }
}

/// Scheduler job body that runs one catalog refresh.
pub struct RefreshJob {
    repository: Arc<CatalogRepository>,
}

impl RefreshJob {
    pub fn new(repository: Arc<CatalogRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait::async_trait]
impl Job for RefreshJob {
    async fn run(&self) -> JobOutcome {
        match self.repository.refresh().await {
            Ok(_) => JobOutcome::Success,
            Err(e) => JobOutcome::Retry(e.to_string()),
        }
    }
}
