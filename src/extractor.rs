//! Image extraction pipeline
//!
//! Pulls an image through an [`ImageStore`] and unpacks it into a fresh
//! [`Workspace`]. The steps run strictly in order:
//!
//! 1. resolve the base directory and allocate a workspace under it
//! 2. open a store session whose logger is annotated with the workspace
//! 3. pull the image into the store's cache
//! 4. unpack the cached image into the workspace
//! 5. destroy the store session, whatever happened above
//!
//! Failures are reported as an [`ExtractError`] tagged with the step that
//! failed. Nothing is retried.

use crate::config::RegistryConfig;
use crate::error::ExtractError;
use crate::logging::Logger;
use crate::registry::RegistryStoreProvider;
use crate::store::{ImageStore, ScopedStore, StoreOptions, StoreProvider};
use crate::workspace::{IMAGE_DIR_PREFIX, Workspace};
use std::env;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Directory the workspace is created in; the current directory when unset
    pub base_dir: Option<PathBuf>,
    /// Name prefix of the workspace directory
    pub prefix: String,
    /// Remove the workspace again when a later step fails. Off by default, which
    /// leaves a failed unpack's partial output on disk for inspection.
    pub cleanup_on_failure: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            base_dir: None,
            prefix: IMAGE_DIR_PREFIX.to_string(),
            cleanup_on_failure: false,
        }
    }
}

impl ExtractOptions {
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_cleanup_on_failure(mut self, enabled: bool) -> Self {
        self.cleanup_on_failure = enabled;
        self
    }
}

pub struct Extractor<P: StoreProvider> {
    provider: P,
    logger: Logger,
    options: ExtractOptions,
}

impl<P: StoreProvider> Extractor<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            logger: Logger::discard(),
            options: ExtractOptions::default(),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_options(mut self, options: ExtractOptions) -> Self {
        self.options = options;
        self
    }

    /// Pulls `image` and unpacks it into a new directory, returning its path.
    ///
    /// The path is relative to the current directory when the workspace lives
    /// under it, absolute otherwise. Ownership of the directory passes to the
    /// caller.
    pub async fn extract(
        &self,
        cancel: &CancellationToken,
        image: &str,
    ) -> Result<PathBuf, ExtractError> {
        let (base, cwd) = match (&self.options.base_dir, env::current_dir()) {
            (Some(base), cwd) => (base.clone(), cwd.ok()),
            (None, Ok(cwd)) => (cwd.clone(), Some(cwd)),
            (None, Err(err)) => return Err(ExtractError::WorkingDir(err)),
        };

        let workspace = Workspace::allocate(&base, &self.options.prefix)
            .map_err(|source| ExtractError::Workspace { base, source })?;
        let image_dir = match &cwd {
            Some(cwd) => workspace.relative_to(cwd),
            None => workspace.path().to_path_buf(),
        };

        let logger = self.logger.with_field("dir", image_dir.display());

        let outcome = self.run(cancel, image, &workspace, &logger).await;
        match outcome {
            Ok(()) => {
                logger.success(&format!(
                    "Extracted {} in {}",
                    image,
                    logger.format_duration(logger.elapsed())
                ));
                Ok(image_dir)
            }
            Err(err) => {
                if self.options.cleanup_on_failure {
                    if let Err(cleanup_err) = workspace.remove() {
                        logger
                            .with_error(&cleanup_err)
                            .warning("Error removing image directory");
                    }
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        image: &str,
        workspace: &Workspace,
        logger: &Logger,
    ) -> Result<(), ExtractError> {
        let store = self
            .provider
            .open(StoreOptions::with_logger(logger.clone()))
            .map_err(ExtractError::StoreOpen)?;
        let store = ScopedStore::new(store, logger.clone());

        let outcome = pull_then_unpack(&*store, cancel, image, workspace, logger).await;
        store.release();
        outcome
    }
}

async fn pull_then_unpack<S: ImageStore>(
    store: &S,
    cancel: &CancellationToken,
    image: &str,
    workspace: &Workspace,
    logger: &Logger,
) -> Result<(), ExtractError> {
    logger.info(&format!("Pulling image {}", image));
    store
        .pull(cancel, image)
        .await
        .map_err(|source| ExtractError::Pull {
            image: image.to_string(),
            source,
        })?;

    logger.info(&format!("Unpacking image {}", image));
    store
        .unpack(cancel, image, workspace.path())
        .await
        .map_err(|source| ExtractError::Unpack {
            image: image.to_string(),
            source,
        })?;

    Ok(())
}

/// Extracts `image` with the registry-backed store, configured from the
/// environment, into a new directory under the current directory.
///
/// Without a logger nothing is written anywhere.
pub async fn extract_image(
    cancel: &CancellationToken,
    logger: Option<Logger>,
    image: &str,
) -> Result<PathBuf, ExtractError> {
    let provider = RegistryStoreProvider::new(RegistryConfig::default().from_env());
    Extractor::new(provider)
        .with_logger(logger.unwrap_or_else(Logger::discard))
        .extract(cancel, image)
        .await
}
