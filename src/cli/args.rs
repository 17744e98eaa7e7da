//! Command-line argument parsing

use crate::config::{AuthConfig, RegistryConfig};
use crate::extractor::ExtractOptions;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "image-extractor")]
#[command(about = "Pull a container image and unpack its filesystem into a new directory")]
#[command(version)]
pub struct Args {
    /// Image reference, e.g. alpine:3.20 or registry.example.com/team/app@sha256:...
    #[arg(value_name = "IMAGESPEC")]
    pub image: String,

    /// Persistent image cache shared between runs
    #[arg(
        long = "cache-dir",
        help = "Keep pulled blobs in this directory instead of a throwaway cache"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Platform to select from multi-platform images; `IMAGE_EXTRACTOR_PLATFORM`
    /// or linux/amd64 when unset
    #[arg(
        long = "platform",
        value_name = "OS/ARCH[/VARIANT]",
        help = "Platform to extract [default: linux/amd64]"
    )]
    pub platform: Option<String>,

    /// Registry username
    #[arg(
        long = "username",
        short = 'u',
        help = "Username for registry authentication"
    )]
    pub username: Option<String>,

    /// Registry password
    #[arg(
        long = "password",
        short = 'p',
        help = "Password for registry authentication"
    )]
    pub password: Option<String>,

    /// Skip TLS verification
    #[arg(
        long = "skip-tls",
        short = 'k',
        help = "Skip TLS certificate verification"
    )]
    pub skip_tls: bool,

    /// Talk to the registry over plain HTTP
    #[arg(long = "plain-http", help = "Use plain HTTP instead of HTTPS")]
    pub plain_http: bool,

    /// Overall deadline in seconds
    #[arg(
        long = "timeout",
        short = 't',
        help = "Give up and cancel the extraction after this many seconds"
    )]
    pub timeout: Option<u64>,

    /// Remove the image directory if pulling or unpacking fails
    #[arg(long = "cleanup-on-failure", help = "Remove the image directory when extraction fails")]
    pub cleanup_on_failure: bool,

    /// Verbose output
    #[arg(long = "verbose", short = 'v', help = "Enable verbose output")]
    pub verbose: bool,

    /// Quiet mode
    #[arg(
        long = "quiet",
        short = 'q',
        conflicts_with = "verbose",
        help = "Only print errors and the result"
    )]
    pub quiet: bool,
}

impl Args {
    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.image.trim().is_empty() {
            return Err("Image reference must not be empty".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be greater than 0".to_string());
        }

        if self.username.is_some() != self.password.is_some() {
            return Err("Username and password must be given together".to_string());
        }

        Ok(())
    }

    /// Registry settings from the flags, with environment variables filling the gaps
    pub fn registry_config(&self) -> RegistryConfig {
        let mut config = RegistryConfig::default();
        config.cache_dir = self.cache_dir.clone();
        config.skip_tls = self.skip_tls;
        config.plain_http = self.plain_http;
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            config.auth = AuthConfig::new(username.clone(), password.clone());
        }
        let mut config = config.from_env();
        if let Some(platform) = &self.platform {
            config.platform = platform.clone();
        }
        config
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions::default().with_cleanup_on_failure(self.cleanup_on_failure)
    }
}
