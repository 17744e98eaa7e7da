//! Uniquely named output directories for unpacked images

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Prefix given to every workspace directory unless configured otherwise
pub const IMAGE_DIR_PREFIX: &str = "image-";

/// Number of fresh names tried before giving up on allocation
const MAX_ATTEMPTS: usize = 16;

/// A freshly created, empty directory owned by one extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Creates `<base>/<prefix><unique suffix>`.
    ///
    /// Creation relies on `create_dir` failing when the name is taken, so two
    /// processes racing for the same name can't both win. A collision just
    /// draws a new suffix.
    pub fn allocate(base: &Path, prefix: &str) -> io::Result<Self> {
        let base = std::path::absolute(base)?;

        for _ in 0..MAX_ATTEMPTS {
            let candidate = base.join(format!("{}{}", prefix, Uuid::new_v4().simple()));
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(Self { path: candidate }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "no unused directory name with prefix {:?} after {} attempts",
                prefix, MAX_ATTEMPTS
            ),
        ))
    }

    /// Absolute path of the directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory expressed relative to `root`, or the absolute path when it
    /// doesn't live under `root`.
    pub fn relative_to(&self, root: &Path) -> PathBuf {
        self.path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.path.clone())
    }

    /// Deletes the directory and everything written into it
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }
}
