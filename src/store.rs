//! Image store interface
//!
//! An image store pulls images into a local cache and unpacks cached images into
//! a directory. The extraction pipeline only talks to stores through
//! [`StoreProvider`] and [`ImageStore`]; the registry-backed implementation lives
//! in [`crate::registry`].

use crate::error::{Result, StoreError};
use crate::logging::Logger;
use async_trait::async_trait;
use std::future::Future;
use std::ops::Deref;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Options handed to [`StoreProvider::open`]
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Where the store writes its own progress and warnings; discards by default
    pub logger: Logger,
}

impl StoreOptions {
    pub fn with_logger(logger: Logger) -> Self {
        Self { logger }
    }
}

/// An open session onto an image cache
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Makes sure `image` is present in the local cache, fetching whatever is missing.
    async fn pull(&self, cancel: &CancellationToken, image: &str) -> Result<()>;

    /// Writes the filesystem of a previously pulled `image` into `dest`.
    async fn unpack(&self, cancel: &CancellationToken, image: &str, dest: &Path) -> Result<()>;

    /// Releases whatever the session holds on to.
    fn destroy(&mut self) -> Result<()>;
}

/// Opens [`ImageStore`] sessions
pub trait StoreProvider {
    type Store: ImageStore;

    fn open(&self, options: StoreOptions) -> Result<Self::Store>;
}

/// Owns an open store and destroys it exactly once.
///
/// [`ScopedStore::release`] destroys the store explicitly; if the scope is left
/// any other way (an early return, or the owning future being dropped) the
/// `Drop` impl does it instead. Destroy failures are logged as warnings and
/// never returned.
pub struct ScopedStore<S: ImageStore> {
    store: S,
    logger: Logger,
    released: bool,
}

impl<S: ImageStore> ScopedStore<S> {
    pub fn new(store: S, logger: Logger) -> Self {
        Self {
            store,
            logger,
            released: false,
        }
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.store.destroy() {
            self.logger
                .with_error(&err)
                .warning("Error destroying local cache");
        }
    }
}

impl<S: ImageStore> Deref for ScopedStore<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.store
    }
}

impl<S: ImageStore> Drop for ScopedStore<S> {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Runs `operation` until it finishes or `cancel` fires, whichever comes first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        result = operation => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Level;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        destroyed: Arc<AtomicUsize>,
        fail_destroy: bool,
    }

    #[async_trait]
    impl ImageStore for CountingStore {
        async fn pull(&self, _cancel: &CancellationToken, _image: &str) -> Result<()> {
            Ok(())
        }

        async fn unpack(&self, _cancel: &CancellationToken, _image: &str, _dest: &Path) -> Result<()> {
            Ok(())
        }

        fn destroy(&mut self) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            if self.fail_destroy {
                Err(StoreError::Io(std::io::Error::other("cache busy")))
            } else {
                Ok(())
            }
        }
    }

    fn store(fail_destroy: bool) -> (CountingStore, Arc<AtomicUsize>) {
        let destroyed = Arc::new(AtomicUsize::new(0));
        (
            CountingStore {
                destroyed: destroyed.clone(),
                fail_destroy,
            },
            destroyed,
        )
    }

    #[test]
    fn release_destroys_once() {
        let (inner, destroyed) = store(false);
        let scoped = ScopedStore::new(inner, Logger::discard());
        scoped.release();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_destroys_when_not_released() {
        let (inner, destroyed) = store(false);
        {
            let _scoped = ScopedStore::new(inner, Logger::discard());
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_failure_is_only_a_warning() {
        let (inner, destroyed) = store(true);
        let logger = Logger::capture().with_field("dir", "image-1");
        ScopedStore::new(inner, logger.clone()).release();

        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        let records = logger.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, Level::Warn);
        assert_eq!(records[0].message, "Error destroying local cache");
        assert_eq!(records[0].field("dir"), Some("image-1"));
        assert!(records[0].field("error").unwrap().contains("cache busy"));
    }

    #[tokio::test]
    async fn cancellable_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move { trigger.cancel() });
        let result: Result<()> = cancellable(&cancel, std::future::pending()).await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn cancellable_passes_results_through() {
        let cancel = CancellationToken::new();
        let value = cancellable(&cancel, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);

        cancel.cancel();
        let result = cancellable(&cancel, async { Ok(7) }).await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
