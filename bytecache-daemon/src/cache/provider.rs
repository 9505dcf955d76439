//! Single-construction handle to the cache store.
//!
//! The daemon builds one [`StoreProvider`] at startup and passes the handle it
//! yields to everything that needs the cache. The provider itself only
//! guarantees that the store is constructed once, even when several tasks ask
//! for it before the first construction has finished.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

type Factory<S> = Arc<dyn Fn() -> Result<S> + Send + Sync>;

pub struct StoreProvider<S> {
    cell: OnceCell<Arc<S>>,
    factory: Factory<S>,
}

impl<S: Send + Sync + 'static> StoreProvider<S> {
    /// Create a provider that will build the store with `factory` on first use.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<S> + Send + Sync + 'static,
    {
        Self {
            cell: OnceCell::new(),
            factory: Arc::new(factory),
        }
    }

    /// Get the store, constructing it if this is the first call.
    ///
    /// Construction runs on the blocking pool. Concurrent first callers wait
    /// on the same construction. A failed construction is returned to the
    /// caller that ran it and leaves the provider uninitialized.
    pub async fn get_store(&self) -> Result<Arc<S>> {
        let store = self
            .cell
            .get_or_try_init(|| async {
                info!("Constructing cache store");
                let factory = Arc::clone(&self.factory);
                tokio::task::spawn_blocking(move || (*factory)())
                    .await
                    .context("Store construction task failed")?
                    .map(Arc::new)
            })
            .await?;

        debug!("Handing out cache store handle");
        Ok(Arc::clone(store))
    }

    /// Whether the store has been constructed.
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeStore;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_calls_construct_once() {
        let constructions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructions);

        let provider = Arc::new(StoreProvider::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            Ok(FakeStore)
        }));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move { provider.get_store().await.unwrap() }));
        }

        let mut stores = Vec::new();
        for handle in handles {
            stores.push(handle.await.unwrap());
        }

        assert_eq!(constructions.load(Ordering::SeqCst), 1);
        for store in &stores {
            assert!(Arc::ptr_eq(store, &stores[0]));
        }
        assert!(provider.is_initialized());
    }

    #[tokio::test]
    async fn test_construction_runs_off_the_runtime_thread() {
        let caller = std::thread::current().id();
        let builder = Arc::new(std::sync::Mutex::new(None));
        let seen = Arc::clone(&builder);

        let provider = StoreProvider::new(move || {
            *seen.lock().unwrap() = Some(std::thread::current().id());
            Ok(FakeStore)
        });
        provider.get_store().await.unwrap();

        let builder = builder.lock().unwrap().unwrap();
        assert_ne!(builder, caller);
    }

    #[tokio::test]
    async fn test_construction_failure_propagates() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let provider = StoreProvider::new(move || -> Result<FakeStore> {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("cannot open backing storage")
        });

        assert!(provider.get_store().await.is_err());
        assert!(!provider.is_initialized());

        // A later call tries again rather than caching the failure.
        assert!(provider.get_store().await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
