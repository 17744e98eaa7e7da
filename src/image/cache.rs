//! Local content-addressable image cache
//!
//! Layout:
//! ```text
//! <cache_dir>/
//!   blobs/sha256/{hex}
//!   manifests/{registry}/{repository}/{tag or digest}
//! ```
//!
//! Blobs are written under a temporary name and renamed into place once their
//! digest has been checked, so several processes can share one cache directory
//! and readers never see a half-written blob.

use crate::error::{Result, StoreError};
use crate::image::digest::DigestUtils;
use crate::image::manifest::{ImageManifest, ParsedManifest, parse_manifest};
use crate::registry::reference::ImageRef;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MANIFESTS_DIR: &str = "manifests";
pub const BLOBS_DIR: &str = "blobs";
pub const SHA256_DIR: &str = "sha256";

const PARTIAL_MARKER: &str = ".partial-";

#[derive(Debug, Clone)]
pub struct Cache {
    cache_dir: PathBuf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub manifest_count: usize,
    pub blob_count: usize,
    pub total_size: u64,
}

impl Cache {
    /// Opens the cache at `cache_dir`, creating its directory structure if needed
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        for dir in [
            cache_dir.join(MANIFESTS_DIR),
            cache_dir.join(BLOBS_DIR).join(SHA256_DIR),
        ] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::Cache {
                message: format!("Failed to create cache directory: {}", e),
                path: dir.clone(),
            })?;
        }
        Ok(Self { cache_dir })
    }

    pub fn root(&self) -> &Path {
        &self.cache_dir
    }

    /// Path a blob with `digest` is stored at
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = DigestUtils::extract_hex_part(digest)?;
        Ok(self.cache_dir.join(BLOBS_DIR).join(SHA256_DIR).join(hex))
    }

    /// Whether the blob is cached, and has `expected_size` bytes when given
    pub fn has_blob(&self, digest: &str, expected_size: Option<u64>) -> bool {
        let Ok(path) = self.blob_path(digest) else {
            return false;
        };
        match fs::metadata(path) {
            Ok(meta) => meta.is_file() && expected_size.is_none_or(|size| size == meta.len()),
            Err(_) => false,
        }
    }

    /// A fresh temporary path next to where `digest` will live
    pub fn partial_blob_path(&self, digest: &str) -> Result<PathBuf> {
        let final_path = self.blob_path(digest)?;
        let mut name = final_path.file_name().unwrap_or_default().to_os_string();
        name.push(format!("{}{}", PARTIAL_MARKER, Uuid::new_v4().simple()));
        Ok(final_path.with_file_name(name))
    }

    /// Moves a fully written and verified partial file into place
    pub fn commit_blob(&self, partial: &Path, digest: &str) -> Result<PathBuf> {
        let blob_path = self.blob_path(digest)?;
        fs::rename(partial, &blob_path).map_err(|e| StoreError::Cache {
            message: format!("Failed to store blob {}: {}", digest, e),
            path: blob_path.clone(),
        })?;
        Ok(blob_path)
    }

    /// Where the resolved manifest for `image` is kept
    pub fn manifest_path(&self, image: &ImageRef) -> PathBuf {
        let mut path = self
            .cache_dir
            .join(MANIFESTS_DIR)
            .join(sanitize_component(&image.registry));
        for part in image.repository.split('/') {
            path.push(part);
        }
        path.push(sanitize_component(image.reference()));
        path
    }

    /// Records the (platform-resolved) image manifest for `image`
    pub fn save_manifest(&self, image: &ImageRef, manifest: &[u8]) -> Result<PathBuf> {
        let manifest_path = self.manifest_path(image);
        if let Some(parent) = manifest_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut name = manifest_path.file_name().unwrap_or_default().to_os_string();
        name.push(format!("{}{}", PARTIAL_MARKER, Uuid::new_v4().simple()));
        let partial = manifest_path.with_file_name(name);
        write_file(&partial, manifest)?;
        fs::rename(&partial, &manifest_path)?;

        Ok(manifest_path)
    }

    /// Loads the image manifest recorded by a previous pull of `image`
    pub fn load_manifest(&self, image: &ImageRef) -> Result<ImageManifest> {
        let manifest_path = self.manifest_path(image);
        let data = fs::read(&manifest_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                StoreError::NotFound(format!("image {} has not been pulled", image))
            }
            _ => StoreError::Cache {
                message: format!("Failed to read manifest: {}", e),
                path: manifest_path.clone(),
            },
        })?;

        match parse_manifest(&data, None)? {
            ParsedManifest::Image(manifest) => Ok(manifest),
            ParsedManifest::Index(_) => Err(StoreError::Cache {
                message: "cached manifest is an index, expected an image manifest".to_string(),
                path: manifest_path,
            }),
        }
    }

    /// Counts cached blobs and manifests, ignoring partial files
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();

        let blobs_dir = self.cache_dir.join(BLOBS_DIR).join(SHA256_DIR);
        for entry in fs::read_dir(blobs_dir)? {
            let entry = entry?;
            let is_partial = entry.file_name().to_string_lossy().contains(PARTIAL_MARKER);
            if entry.file_type()?.is_file() && !is_partial {
                stats.blob_count += 1;
                stats.total_size += entry.metadata()?.len();
            }
        }

        let mut pending = vec![self.cache_dir.join(MANIFESTS_DIR)];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    pending.push(entry.path());
                } else if !entry.file_name().to_string_lossy().contains(PARTIAL_MARKER) {
                    stats.manifest_count += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Deletes the whole cache directory
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Cache {
                message: format!("Failed to remove cache: {}", e),
                path: self.cache_dir.clone(),
            }),
        }
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

/// Makes a registry host or tag/digest usable as a single path component
fn sanitize_component(name: &str) -> String {
    name.replace([':', '/', '@'], "_")
}
