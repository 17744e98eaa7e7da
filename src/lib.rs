//! Image Extractor Library
//!
//! Materializes a container image's filesystem into a new directory: a fresh
//! workspace is allocated, the image is pulled through an [`store::ImageStore`]
//! and unpacked into the workspace, and the store session is released again.
//!
//! ```no_run
//! use image_extractor::extract_image;
//! use image_extractor::logging::Logger;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = extract_image(&CancellationToken::new(), Some(Logger::new(false)), "alpine:3.20").await?;
//! println!("Image extracted to {}", dir.display());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod extractor;
pub mod image;
pub mod logging;
pub mod registry;
pub mod store;
pub mod workspace;

pub use config::{AuthConfig, RegistryConfig};
pub use error::{ExtractError, Phase, Result, StoreError};
pub use extractor::{ExtractOptions, Extractor, extract_image};
pub use logging::Logger;
pub use registry::RegistryStoreProvider;
pub use store::{ImageStore, StoreOptions, StoreProvider};
