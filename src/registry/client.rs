//! Docker Registry v2 client
//!
//! Read-only subset of the distribution API needed to pull an image:
//! - manifest fetch (GET /v2/{name}/manifests/{reference})
//! - blob download (GET /v2/{name}/blobs/{digest})
//!
//! Authorization headers are obtained lazily from the first 401 challenge and
//! reused for later requests to the same repository.

use crate::config::{AuthConfig, RegistryConfig};
use crate::error::handlers::HttpErrorHandler;
use crate::error::{Result, StoreError};
use crate::image::cache::Cache;
use crate::image::digest::{DigestUtils, SHA256_PREFIX};
use crate::image::manifest::{
    Descriptor, ImageManifest, MANIFEST_ACCEPT, ParsedManifest, Platform, parse_manifest,
};
use crate::logging::Logger;
use crate::registry::auth::{Challenge, pull_scope};
use crate::registry::reference::ImageRef;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Header registries use to report the digest of a manifest
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

pub struct RegistryClient {
    client: Client,
    base_url: Url,
    registry: String,
    credentials: Option<AuthConfig>,
    /// Authorization header per repository
    authorizations: Mutex<HashMap<String, String>>,
    logger: Logger,
}

/// A manifest document as served by the registry
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub digest: String,
}

impl RegistryClient {
    /// Client for the registry `image` lives in
    pub fn new(config: &RegistryConfig, image: &ImageRef, logger: Logger) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout);
        let mut builder = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(concat!("image-extractor/", env!("CARGO_PKG_VERSION")));
        if config.skip_tls {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let client = builder.build()?;

        let scheme = if config.plain_http { "http" } else { "https" };
        let base_url = Url::parse(&format!("{}://{}/", scheme, image.api_host()))?;

        Ok(Self {
            client,
            base_url,
            registry: image.registry.clone(),
            credentials: config.credentials_for(&image.registry),
            authorizations: Mutex::new(HashMap::new()),
            logger,
        })
    }

    fn endpoint(&self, repository: &str, kind: &str, reference: &str) -> Result<Url> {
        Ok(self
            .base_url
            .join(&format!("v2/{}/{}/{}", repository, kind, reference))?)
    }

    fn cached_authorization(&self, repository: &str) -> Option<String> {
        self.authorizations
            .lock()
            .ok()
            .and_then(|map| map.get(repository).cloned())
    }

    fn remember_authorization(&self, repository: &str, header: String) {
        if let Ok(mut map) = self.authorizations.lock() {
            map.insert(repository.to_string(), header);
        }
    }

    /// GET `url`, answering one authentication challenge if the registry asks
    async fn get(&self, repository: &str, url: Url, accept: Option<&str>) -> Result<Response> {
        let response = self
            .send_get(url.clone(), accept, self.cached_authorization(repository))
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(Challenge::parse)
            .transpose()?;
        let Some(challenge) = challenge else {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(
                StatusCode::UNAUTHORIZED,
                &text,
                "pull",
            ));
        };

        self.logger
            .detail(&format!("Authenticating with {} for {}", self.registry, repository));
        let authorization = challenge
            .authorize(
                &self.client,
                self.credentials.as_ref(),
                &pull_scope(repository),
                &self.logger,
            )
            .await?;
        self.remember_authorization(repository, authorization.clone());

        self.send_get(url, accept, Some(authorization)).await
    }

    async fn send_get(
        &self,
        url: Url,
        accept: Option<&str>,
        authorization: Option<String>,
    ) -> Result<Response> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        Ok(request.send().await?)
    }

    /// Fetches the manifest (or index) `reference` of `repository`
    pub async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<FetchedManifest> {
        let url = self.endpoint(repository, "manifests", reference)?;
        self.logger.detail(&format!("Fetching manifest: {}", url));

        let response = self.get(repository, url, Some(MANIFEST_ACCEPT)).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(
                status,
                &text,
                &format!("manifest {}:{}", repository, reference),
            ));
        }

        let content_type = header_string(&response, CONTENT_TYPE.as_str());
        let reported_digest = header_string(&response, DOCKER_CONTENT_DIGEST);
        let data = response.bytes().await?.to_vec();
        let digest = DigestUtils::compute_docker_digest(&data);

        if reference.starts_with(SHA256_PREFIX) {
            DigestUtils::verify_data_integrity(&data, reference)?;
        } else if let Some(reported) = reported_digest.filter(|d| d.starts_with(SHA256_PREFIX)) {
            if reported != digest {
                return Err(StoreError::Validation(format!(
                    "manifest digest mismatch: registry reported {}, computed {}",
                    reported, digest
                )));
            }
        }

        Ok(FetchedManifest {
            data,
            content_type,
            digest,
        })
    }

    /// Resolves `image` to a single image manifest for `platform`, following an
    /// index if the reference points at one. Returns the parsed manifest along
    /// with its raw bytes.
    pub async fn resolve_image_manifest(
        &self,
        image: &ImageRef,
        platform: &Platform,
    ) -> Result<(ImageManifest, Vec<u8>)> {
        let fetched = self
            .fetch_manifest(&image.repository, image.reference())
            .await?;

        match parse_manifest(&fetched.data, fetched.content_type.as_deref())? {
            ParsedManifest::Image(manifest) => Ok((manifest, fetched.data)),
            ParsedManifest::Index(index) => {
                let descriptor = index.select(platform)?;
                self.logger.detail(&format!(
                    "Selected {} manifest {}",
                    platform, descriptor.digest
                ));
                let fetched = self
                    .fetch_manifest(&image.repository, &descriptor.digest)
                    .await?;
                match parse_manifest(&fetched.data, fetched.content_type.as_deref())? {
                    ParsedManifest::Image(manifest) => Ok((manifest, fetched.data)),
                    ParsedManifest::Index(_) => Err(StoreError::Unsupported(format!(
                        "nested image index {}",
                        descriptor.digest
                    ))),
                }
            }
        }
    }

    /// Streams the blob described by `descriptor` into `cache`, verifying its
    /// size and digest on the way.
    pub async fn download_blob(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        cache: &Cache,
    ) -> Result<PathBuf> {
        let partial = cache.partial_blob_path(&descriptor.digest)?;
        let guard = PartialFile(Some(partial.clone()));

        self.fetch_blob_into(repository, descriptor, &partial).await?;
        let path = cache.commit_blob(&partial, &descriptor.digest)?;
        guard.disarm();
        Ok(path)
    }

    async fn fetch_blob_into(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        partial: &Path,
    ) -> Result<()> {
        let url = self.endpoint(repository, "blobs", &descriptor.digest)?;
        let mut response = self.get(repository, url, None).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(
                status,
                &text,
                &format!("blob {}", descriptor.digest),
            ));
        }

        let mut file = tokio::fs::File::create(partial).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            written += chunk.len() as u64;
            if written > descriptor.size {
                return Err(StoreError::Validation(format!(
                    "blob {} is larger than the expected {} bytes",
                    descriptor.digest, descriptor.size
                )));
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        if written != descriptor.size {
            return Err(StoreError::Validation(format!(
                "blob {} is {} bytes, expected {}",
                descriptor.digest, written, descriptor.size
            )));
        }
        let computed = format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize()));
        if computed != descriptor.digest {
            return Err(StoreError::Validation(format!(
                "Data integrity check failed: expected {}, computed {}",
                descriptor.digest, computed
            )));
        }

        self.logger.trace(&format!(
            "Downloaded {} ({})",
            descriptor.digest,
            self.logger.format_size(written)
        ));
        Ok(())
    }
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Removes a partially downloaded blob unless disarmed. Also covers the
/// download future being dropped on cancellation.
struct PartialFile(Option<PathBuf>);

impl PartialFile {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(image: &str, config: RegistryConfig) -> RegistryClient {
        RegistryClient::new(&config, &ImageRef::parse(image).unwrap(), Logger::discard()).unwrap()
    }

    #[test]
    fn base_url_follows_registry_and_scheme() {
        let hub = client("alpine", RegistryConfig::default());
        assert_eq!(hub.base_url.as_str(), "https://registry-1.docker.io/");

        let local = client(
            "localhost:5000/team/app:v1",
            RegistryConfig {
                plain_http: true,
                ..RegistryConfig::default()
            },
        );
        assert_eq!(local.base_url.as_str(), "http://localhost:5000/");
        assert_eq!(
            local
                .endpoint("team/app", "manifests", "v1")
                .unwrap()
                .as_str(),
            "http://localhost:5000/v2/team/app/manifests/v1"
        );
    }

    #[test]
    fn authorizations_are_per_repository() {
        let c = client("example.com/app", RegistryConfig::default());
        assert!(c.cached_authorization("app").is_none());
        c.remember_authorization("app", "Bearer abc".to_string());
        assert_eq!(c.cached_authorization("app").as_deref(), Some("Bearer abc"));
        assert!(c.cached_authorization("other").is_none());
    }

    #[test]
    fn partial_file_guard_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dropped = dir.path().join("dropped");
        let kept = dir.path().join("kept");
        std::fs::write(&dropped, b"x").unwrap();
        std::fs::write(&kept, b"x").unwrap();

        drop(PartialFile(Some(dropped.clone())));
        PartialFile(Some(kept.clone())).disarm();

        assert!(!dropped.exists());
        assert!(kept.exists());
    }
}
