//! Registry-backed image store
//!
//! [`RegistryStoreProvider`] opens [`RegistryStore`] sessions that pull images
//! over the Docker Registry HTTP API v2 into a local content-addressable
//! [`Cache`] and unpack them from there.
//!
//! Without a configured cache directory each session gets a private cache in
//! the system temp directory, removed again when the session is destroyed.

pub mod auth;
pub mod client;
pub mod reference;

pub use client::RegistryClient;
pub use reference::ImageRef;

use crate::config::RegistryConfig;
use crate::error::{Result, StoreError};
use crate::image::cache::Cache;
use crate::image::manifest::{Descriptor, LayerCompression, Platform};
use crate::image::unpack::{LayerFile, unpack_layers};
use crate::logging::Logger;
use crate::store::{ImageStore, StoreOptions, StoreProvider, cancellable};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::env;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Blobs downloaded at the same time during a pull
pub const MAX_CONCURRENT_DOWNLOADS: usize = 4;

const EPHEMERAL_CACHE_PREFIX: &str = "cache-";

#[derive(Debug, Clone, Default)]
pub struct RegistryStoreProvider {
    config: RegistryConfig,
}

impl RegistryStoreProvider {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }
}

impl StoreProvider for RegistryStoreProvider {
    type Store = RegistryStore;

    fn open(&self, options: StoreOptions) -> Result<RegistryStore> {
        let platform: Platform = self.config.platform.parse()?;

        let (cache_dir, ephemeral) = match &self.config.cache_dir {
            Some(dir) => (dir.clone(), false),
            None => (
                env::temp_dir().join(format!(
                    "{}{}",
                    EPHEMERAL_CACHE_PREFIX,
                    Uuid::new_v4().simple()
                )),
                true,
            ),
        };
        let cache = Cache::open(cache_dir)?;
        options
            .logger
            .debug(&format!("Using image cache at {}", cache.root().display()));

        Ok(RegistryStore {
            config: self.config.clone(),
            platform,
            cache,
            ephemeral,
            destroyed: false,
            logger: options.logger,
        })
    }
}

pub struct RegistryStore {
    config: RegistryConfig,
    platform: Platform,
    cache: Cache,
    ephemeral: bool,
    destroyed: bool,
    logger: Logger,
}

impl RegistryStore {
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Whether the cache belongs to this session alone
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<()> {
        let client = RegistryClient::new(&self.config, image, self.logger.clone())?;
        let (manifest, raw_manifest) = client.resolve_image_manifest(image, &self.platform).await?;

        for layer in &manifest.layers {
            LayerCompression::from_media_type(&layer.media_type)?;
        }

        let blobs: Vec<&Descriptor> = std::iter::once(&manifest.config)
            .chain(manifest.layers.iter())
            .collect();
        let missing: Vec<&Descriptor> = blobs
            .iter()
            .copied()
            .filter(|blob| !self.cache.has_blob(&blob.digest, Some(blob.size)))
            .collect();

        let total: u64 = missing.iter().map(|b| b.size).sum();
        self.logger.step(&format!(
            "{} of {} blobs to download ({})",
            missing.len(),
            blobs.len(),
            self.logger.format_size(total)
        ));

        let count = missing.len();
        let client = &client;
        let downloads: Vec<_> = missing
            .into_iter()
            .enumerate()
            .map(|(i, blob)| async move {
                self.logger.detail(&format!(
                    "Downloading blob {}/{}: {} ({})",
                    i + 1,
                    count,
                    blob.digest,
                    self.logger.format_size(blob.size)
                ));
                client
                    .download_blob(&image.repository, blob, &self.cache)
                    .await
            })
            .collect();
        stream::iter(downloads)
            .buffer_unordered(MAX_CONCURRENT_DOWNLOADS)
            .try_collect::<Vec<_>>()
            .await?;

        // Recorded last: an image counts as pulled only once all its blobs are cached.
        self.cache.save_manifest(image, &raw_manifest)?;

        if !self.is_ephemeral() {
            if let Ok(stats) = self.cache.stats() {
                self.logger.debug(&format!(
                    "Cache holds {} manifests and {} blobs ({})",
                    stats.manifest_count,
                    stats.blob_count,
                    self.logger.format_size(stats.total_size)
                ));
            }
        }
        Ok(())
    }

    fn layer_files(&self, image: &ImageRef) -> Result<Vec<LayerFile>> {
        let manifest = self.cache.load_manifest(image)?;
        manifest
            .layers
            .iter()
            .map(|layer| {
                if !self.cache.has_blob(&layer.digest, Some(layer.size)) {
                    return Err(StoreError::NotFound(format!(
                        "layer {} of {} is missing from the cache",
                        layer.digest, image
                    )));
                }
                Ok(LayerFile {
                    digest: layer.digest.clone(),
                    path: self.cache.blob_path(&layer.digest)?,
                    compression: LayerCompression::from_media_type(&layer.media_type)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ImageStore for RegistryStore {
    async fn pull(&self, cancel: &CancellationToken, image: &str) -> Result<()> {
        let image = ImageRef::parse(image)?;
        self.logger.info(&format!("Resolving {}", image));
        cancellable(cancel, self.pull_image(&image)).await?;
        self.logger.success(&format!("Pulled {}", image));
        Ok(())
    }

    async fn unpack(&self, cancel: &CancellationToken, image: &str, dest: &Path) -> Result<()> {
        let image = ImageRef::parse(image)?;
        let layers = self.layer_files(&image)?;
        tokio::fs::create_dir_all(dest).await?;

        self.logger.info(&format!(
            "Unpacking {} layers of {} into {}",
            layers.len(),
            image,
            dest.display()
        ));

        let dest = dest.to_path_buf();
        let cancel = cancel.clone();
        let logger = self.logger.clone();
        tokio::task::spawn_blocking(move || unpack_layers(&layers, &dest, &cancel, &logger))
            .await??;
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        if self.is_ephemeral() {
            self.logger
                .debug(&format!("Removing image cache {}", self.cache.root().display()));
            self.cache.remove()?;
        }
        Ok(())
    }
}
