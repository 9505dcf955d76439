//! Live view over the cache contents.
//!
//! Writers publish a complete, immutable snapshot after every committed
//! `replace_all`; an [`ItemFeed`] hands subscribers the snapshot that is
//! current when they subscribe and then every later one.

use bytecache_core::PersistedItem;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};

/// One committed state of the cache.
pub type Snapshot = Arc<Vec<PersistedItem>>;

/// Subscription to cache snapshots, projected through a pure mapper.
pub struct ItemFeed<T> {
    rx: watch::Receiver<Snapshot>,
    map: fn(&PersistedItem) -> T,
    delivered_initial: bool,
}

impl ItemFeed<PersistedItem> {
    /// Feed of raw cache rows.
    pub fn new(rx: watch::Receiver<Snapshot>) -> Self {
        Self {
            rx,
            map: PersistedItem::clone,
            delivered_initial: false,
        }
    }
}

impl<T> ItemFeed<T> {
    /// Re-target the feed to another read model.
    pub fn with_mapper<U>(self, map: fn(&PersistedItem) -> U) -> ItemFeed<U> {
        ItemFeed {
            rx: self.rx,
            map,
            delivered_initial: self.delivered_initial,
        }
    }

    /// The latest committed snapshot.
    pub fn current(&mut self) -> Vec<T> {
        let snapshot = Arc::clone(&self.rx.borrow_and_update());
        snapshot.iter().map(self.map).collect()
    }

    /// Wait for the next snapshot.
    ///
    /// The first call returns immediately with the current state. Returns
    /// `None` once the store has been dropped.
    pub async fn next(&mut self) -> Option<Vec<T>> {
        if !self.delivered_initial {
            self.delivered_initial = true;
            return Some(self.current());
        }

        self.rx.changed().await.ok()?;
        Some(self.current())
    }

    /// Adapt the feed into a [`Stream`] of snapshots, starting with the current one.
    pub fn into_stream(self) -> impl Stream<Item = Vec<T>>
    where
        T: 'static,
    {
        let map = self.map;
        WatchStream::new(self.rx).map(move |snapshot| snapshot.iter().map(map).collect())
    }
}
