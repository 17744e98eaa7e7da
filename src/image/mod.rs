//! Image data handling
//!
//! Manifest and index documents, digest checks, the local blob cache and the
//! layer unpacker that turns cached layers into a directory tree.

pub mod cache;
pub mod digest;
pub mod manifest;
pub mod unpack;

pub use cache::{Cache, CacheStats};
pub use digest::DigestUtils;
pub use manifest::{ImageIndex, ImageManifest, LayerCompression, Platform, parse_manifest};
pub use unpack::{LayerFile, unpack_layers};
