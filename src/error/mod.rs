//! Error types for the image store and the extraction pipeline
//!
//! [`StoreError`] is what the image store reports for pull/unpack/destroy.
//! [`ExtractError`] is what the pipeline hands back to its caller, tagged with
//! the [`Phase`] that failed.

pub mod handlers;

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by an image store
#[derive(Debug, Error)]
pub enum StoreError {
    /// File IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Transport level failures talking to a registry
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    /// Registry answered with an unexpected status
    #[error("Registry error: {0}")]
    Registry(String),
    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),
    /// Image, manifest or blob does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed manifest, index or token response
    #[error("Parse error: {0}")]
    Parse(String),
    /// Invalid references, digests or configuration values
    #[error("Validation error: {0}")]
    Validation(String),
    /// Media types or manifest schemas this store can't handle
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// Local cache problems
    #[error("Cache error at {}: {message}", path.display())]
    Cache { message: String, path: PathBuf },
    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Parse(err.to_string())
    }
}

impl From<url::ParseError> for StoreError {
    fn from(err: url::ParseError) -> Self {
        StoreError::Validation(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Io(io::Error::other(format!("background task failed: {}", err)))
    }
}

/// Pipeline step an [`ExtractError`] is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Pull,
    Unpack,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Pull => write!(f, "pull"),
            Phase::Unpack => write!(f, "unpack"),
        }
    }
}

/// Failure of a single extraction
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("error resolving working directory: {0}")]
    WorkingDir(#[source] io::Error),

    #[error("error creating image directory in {}: {source}", base.display())]
    Workspace {
        base: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error opening image store: {0}")]
    StoreOpen(#[source] StoreError),

    #[error("error pulling image {image}: {source}")]
    Pull {
        image: String,
        #[source]
        source: StoreError,
    },

    #[error("error unpacking image {image}: {source}")]
    Unpack {
        image: String,
        #[source]
        source: StoreError,
    },
}

impl ExtractError {
    pub fn phase(&self) -> Phase {
        match self {
            ExtractError::WorkingDir(_)
            | ExtractError::Workspace { .. }
            | ExtractError::StoreOpen(_) => Phase::Setup,
            ExtractError::Pull { .. } => Phase::Pull,
            ExtractError::Unpack { .. } => Phase::Unpack,
        }
    }

    /// True when the pull or unpack was aborted by the caller's cancellation
    /// token rather than failing on its own.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ExtractError::Pull { source, .. } | ExtractError::Unpack { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    /// The image reference this error is about, when one was involved.
    pub fn image(&self) -> Option<&str> {
        match self {
            ExtractError::Pull { image, .. } | ExtractError::Unpack { image, .. } => Some(image),
            _ => None,
        }
    }
}
