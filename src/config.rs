//! Configuration for the registry-backed image store
//!
//! Values come from defaults, overridden by `IMAGE_EXTRACTOR_*` environment
//! variables, overridden in turn by command-line flags. Credentials fall back to
//! the Docker client config.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_PLATFORM: &str = "linux/amd64";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Key the Docker CLI uses for Docker Hub credentials
const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl AuthConfig {
    pub fn new(username: String, password: String) -> Self {
        Self {
            username: Some(username),
            password: Some(password),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Looks up credentials for `registry` in the Docker client config
    /// (`$DOCKER_CONFIG/config.json` or `~/.docker/config.json`).
    pub fn from_docker_config(registry: &str) -> Option<Self> {
        let dir = env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")))?;
        let contents = fs::read_to_string(dir.join("config.json")).ok()?;
        Self::from_docker_config_json(&contents, registry)
    }

    /// Parses a Docker client config document and returns the credentials stored
    /// for `registry`, if any.
    pub fn from_docker_config_json(contents: &str, registry: &str) -> Option<Self> {
        #[derive(Deserialize)]
        struct DockerConfig {
            #[serde(default)]
            auths: HashMap<String, DockerAuth>,
        }

        #[derive(Deserialize)]
        struct DockerAuth {
            auth: Option<String>,
            username: Option<String>,
            password: Option<String>,
        }

        let config: DockerConfig = serde_json::from_str(contents).ok()?;
        let entry = config.auths.iter().find_map(|(key, auth)| {
            (docker_config_host(key) == registry
                || (registry == "docker.io" && key == DOCKER_HUB_AUTH_KEY))
                .then_some(auth)
        })?;

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Some(Self::new(username.clone(), password.clone()));
        }

        let decoded = STANDARD.decode(entry.auth.as_ref()?.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Self::new(username.to_string(), password.to_string()))
    }
}

/// Strips scheme and path from a Docker config `auths` key
fn docker_config_host(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.split('/').next().unwrap_or(key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Persistent cache shared between runs; `None` gives every store handle a
    /// private cache that is removed when the handle is destroyed.
    pub cache_dir: Option<PathBuf>,
    /// Platform to select from multi-platform images, `os/arch[/variant]`
    pub platform: String,
    pub skip_tls: bool,
    pub plain_http: bool,
    /// Connect/read timeout for registry requests, in seconds
    pub timeout: u64,
    pub auth: AuthConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            platform: DEFAULT_PLATFORM.to_string(),
            skip_tls: false,
            plain_http: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            auth: AuthConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Load configuration overrides from environment variables
    pub fn from_env(mut self) -> Self {
        if self.auth.username.is_none() {
            self.auth.username = env::var("IMAGE_EXTRACTOR_USERNAME").ok();
        }

        if self.auth.password.is_none() {
            self.auth.password = env::var("IMAGE_EXTRACTOR_PASSWORD").ok();
        }

        if self.cache_dir.is_none() {
            self.cache_dir = env::var_os("IMAGE_EXTRACTOR_CACHE_DIR").map(PathBuf::from);
        }

        if let Ok(platform) = env::var("IMAGE_EXTRACTOR_PLATFORM") {
            self.platform = platform;
        }

        if let Ok(timeout) = env::var("IMAGE_EXTRACTOR_TIMEOUT") {
            if let Ok(t) = timeout.parse() {
                self.timeout = t;
            }
        }

        if env::var("IMAGE_EXTRACTOR_SKIP_TLS").is_ok() {
            self.skip_tls = true;
        }

        if env::var("IMAGE_EXTRACTOR_PLAIN_HTTP").is_ok() {
            self.plain_http = true;
        }

        self
    }

    /// Credentials for `registry`: explicit ones first, then the Docker config
    pub fn credentials_for(&self, registry: &str) -> Option<AuthConfig> {
        if self.auth.has_credentials() {
            Some(self.auth.clone())
        } else {
            AuthConfig::from_docker_config(registry)
        }
    }
}
