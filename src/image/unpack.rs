//! Layer application
//!
//! Layers are tar streams (optionally gzip-compressed) applied on top of each
//! other in manifest order. Whiteout entries delete what lower layers wrote:
//!
//! - `.wh.<name>` removes the sibling `<name>`
//! - `.wh..wh..opq` hides whatever lower layers put in the directory it sits in
//!
//! Everything here is blocking IO and is meant to run on a blocking thread.

use crate::error::{Result, StoreError};
use crate::image::manifest::LayerCompression;
use crate::logging::Logger;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// A cached layer blob and how to decode it
#[derive(Debug, Clone)]
pub struct LayerFile {
    pub digest: String,
    pub path: PathBuf,
    pub compression: LayerCompression,
}

/// Applies `layers` in order onto `dest`, which must already exist.
pub fn unpack_layers(
    layers: &[LayerFile],
    dest: &Path,
    cancel: &CancellationToken,
    logger: &Logger,
) -> Result<()> {
    for (i, layer) in layers.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        logger.detail(&format!(
            "Applying layer {}/{}: {}",
            i + 1,
            layers.len(),
            layer.digest
        ));

        let file = File::open(&layer.path).map_err(|e| StoreError::Cache {
            message: format!("Failed to open layer {}: {}", layer.digest, e),
            path: layer.path.clone(),
        })?;
        let reader = BufReader::new(file);
        let applied = match layer.compression {
            LayerCompression::Gzip => apply_layer(GzDecoder::new(reader), dest, cancel, logger),
            LayerCompression::None => apply_layer(reader, dest, cancel, logger),
        };
        applied.map_err(|e| match e {
            StoreError::Io(io_err) => StoreError::Io(io::Error::new(
                io_err.kind(),
                format!("layer {}: {}", layer.digest, io_err),
            )),
            other => other,
        })?;
    }
    Ok(())
}

/// Applies a single tar stream onto `dest`
pub fn apply_layer(
    reader: impl Read,
    dest: &Path,
    cancel: &CancellationToken,
    logger: &Logger,
) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    // Entries of this layer; an opaque whiteout only hides lower layers.
    let mut unpacked: HashSet<PathBuf> = HashSet::new();

    for raw_entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let mut entry = raw_entry?;
        let rel = entry.path()?.into_owned();

        let Some(rel) = confined(&rel) else {
            logger.warning(&format!("Skipping entry outside the image root: {}", rel.display()));
            continue;
        };
        let Some(file_name) = rel.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if let Some(target_name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = rel.parent().unwrap_or(Path::new(""));
            if !resolves_inside(dest, parent) {
                logger.warning(&format!("Ignoring whiteout outside the image root: {}", rel.display()));
            } else if file_name == OPAQUE_WHITEOUT {
                clear_dir(dest, parent, &unpacked)?;
            } else if !matches!(target_name, "" | "." | "..") {
                remove_path(&dest.join(parent).join(target_name))?;
            }
            continue;
        }

        let target = dest.join(&rel);
        let entry_is_dir = entry.header().entry_type() == EntryType::Directory;
        let parent = rel.parent().unwrap_or(Path::new(""));
        if let Ok(existing) = fs::symlink_metadata(&target) {
            // A directory stays (its contents merge); anything else is replaced.
            if !(existing.is_dir() && entry_is_dir) && resolves_inside(dest, parent) {
                remove_path(&target)?;
            }
        }

        if entry.unpack_in(dest)? {
            // Parents count too: unpacking created them if the layer didn't list them.
            unpacked.extend(
                rel.ancestors()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf),
            );
        } else {
            logger.warning(&format!("Skipped unsafe entry: {}", rel.display()));
        }
    }

    Ok(())
}

/// Normalizes an archive path to plain relative components, or `None` if it
/// would leave the root.
fn confined(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// Whether `root/rel` still lies inside `root` once symlinks written by
/// earlier layers are resolved. A path that doesn't exist yet has nothing to
/// delete and counts as inside.
fn resolves_inside(root: &Path, rel: &Path) -> bool {
    let Ok(root) = fs::canonicalize(root) else {
        return false;
    };
    match fs::canonicalize(root.join(rel)) {
        Ok(resolved) => resolved.starts_with(&root),
        Err(_) => true,
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Empties `root/dir` except for the paths in `keep`, descending into kept
/// directories.
fn clear_dir(root: &Path, dir: &Path, keep: &HashSet<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(root.join(dir)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let rel = dir.join(entry.file_name());
        if !keep.contains(&rel) {
            remove_path(&entry.path())?;
        } else if entry.file_type()?.is_dir() {
            clear_dir(root, &rel, keep)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    enum Item<'a> {
        Dir(&'a str),
        File(&'a str, &'a [u8]),
        Symlink(&'a str, &'a str),
        /// Written without path validation, for hostile archives
        RawFile(&'a str, &'a [u8]),
    }

    fn tarball(items: &[Item<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for item in items {
            let mut header = tar::Header::new_gnu();
            match item {
                Item::Dir(path) => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_mode(0o755);
                    header.set_size(0);
                    builder.append_data(&mut header, path, io::empty()).unwrap();
                }
                Item::File(path, data) => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_mode(0o644);
                    header.set_size(data.len() as u64);
                    builder.append_data(&mut header, path, *data).unwrap();
                }
                Item::Symlink(path, target) => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    builder.append_link(&mut header, path, target).unwrap();
                }
                Item::RawFile(path, data) => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_mode(0o644);
                    header.set_size(data.len() as u64);
                    let name = &mut header.as_old_mut().name;
                    name[..path.len()].copy_from_slice(path.as_bytes());
                    header.set_cksum();
                    builder.append(&header, *data).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn apply(dest: &Path, items: &[Item<'_>]) {
        apply_layer(
            &tarball(items)[..],
            dest,
            &CancellationToken::new(),
            &Logger::discard(),
        )
        .unwrap();
    }

    #[test]
    fn writes_files_and_directories() {
        let dest = tempfile::tempdir().unwrap();
        apply(
            dest.path(),
            &[
                Item::Dir("etc/"),
                Item::File("etc/config.yaml", b"key: value\n"),
                Item::File("bin/app", b"\x7fELF"),
                Item::Symlink("usr/bin/app", "../../bin/app"),
            ],
        );

        assert_eq!(
            fs::read_to_string(dest.path().join("etc/config.yaml")).unwrap(),
            "key: value\n"
        );
        assert_eq!(fs::read(dest.path().join("bin/app")).unwrap(), b"\x7fELF");
        assert_eq!(
            fs::read_link(dest.path().join("usr/bin/app")).unwrap(),
            PathBuf::from("../../bin/app")
        );
    }

    #[test]
    fn upper_layers_override_and_whiteout() {
        let dest = tempfile::tempdir().unwrap();
        apply(
            dest.path(),
            &[
                Item::File("etc/motd", b"old"),
                Item::File("etc/remove-me", b"x"),
                Item::File("var/cache/a", b"a"),
                Item::File("var/cache/sub/b", b"b"),
                Item::File("opt/tool", b"file"),
            ],
        );
        apply(
            dest.path(),
            &[
                Item::File("etc/motd", b"new"),
                Item::File("etc/.wh.remove-me", b""),
                Item::File("var/cache/.wh..wh..opq", b""),
                Item::File("var/cache/c", b"c"),
                Item::Dir("opt/tool/"),
                Item::File("opt/tool/bin", b"now a dir"),
            ],
        );

        let root = dest.path();
        assert_eq!(fs::read(root.join("etc/motd")).unwrap(), b"new");
        assert!(!root.join("etc/remove-me").exists());
        assert!(!root.join("etc/.wh.remove-me").exists());
        assert!(!root.join("var/cache/a").exists());
        assert!(!root.join("var/cache/sub").exists());
        assert_eq!(fs::read(root.join("var/cache/c")).unwrap(), b"c");
        assert!(!root.join("var/cache/.wh..wh..opq").exists());
        assert!(root.join("opt/tool").is_dir());
    }

    #[test]
    fn opaque_whiteout_keeps_entries_of_its_own_layer() {
        let dest = tempfile::tempdir().unwrap();
        apply(
            dest.path(),
            &[
                Item::File("d/lower", b"lower"),
                Item::File("d/sub/old", b"old"),
            ],
        );
        apply(
            dest.path(),
            &[
                Item::Dir("d/"),
                Item::File("d/-new", b"new"),
                Item::File("d/sub/fresh", b"fresh"),
                Item::File("d/.wh..wh..opq", b""),
                Item::File("d/zz", b"after"),
            ],
        );

        let d = dest.path().join("d");
        assert!(!d.join("lower").exists());
        assert!(!d.join("sub/old").exists());
        assert_eq!(fs::read(d.join("-new")).unwrap(), b"new");
        assert_eq!(fs::read(d.join("sub/fresh")).unwrap(), b"fresh");
        assert_eq!(fs::read(d.join("zz")).unwrap(), b"after");
    }

    #[test]
    fn whiteout_of_directory_removes_tree() {
        let dest = tempfile::tempdir().unwrap();
        apply(dest.path(), &[Item::File("srv/data/one", b"1")]);
        apply(dest.path(), &[Item::File("srv/.wh.data", b"")]);
        assert!(!dest.path().join("srv/data").exists());
        assert!(dest.path().join("srv").is_dir());
    }

    #[test]
    fn entries_cannot_escape_root() {
        let outer = tempfile::tempdir().unwrap();
        let dest = outer.path().join("root");
        fs::create_dir(&dest).unwrap();

        apply(
            &dest,
            &[
                Item::RawFile("../escaped", b"evil"),
                Item::RawFile("../.wh.victim", b""),
                Item::File("ok", b"fine"),
            ],
        );
        assert!(!outer.path().join("escaped").exists());
        assert_eq!(fs::read(dest.join("ok")).unwrap(), b"fine");
    }

    #[test]
    fn whiteouts_do_not_follow_symlinks_or_dot_names() {
        let outer = tempfile::tempdir().unwrap();
        let dest = outer.path().join("root");
        let victim = outer.path().join("victim");
        fs::create_dir_all(&dest).unwrap();
        fs::create_dir_all(&victim).unwrap();
        fs::write(victim.join("keep"), b"keep").unwrap();

        apply(&dest, &[Item::Symlink("link", "../victim"), Item::Dir("sub/")]);
        apply(
            &dest,
            &[
                Item::File("link/.wh.keep", b""),
                Item::File("link/.wh..wh..opq", b""),
                Item::File("sub/.wh..", b""),
            ],
        );

        assert!(victim.join("keep").is_file());
        assert!(dest.join("sub").is_dir());
    }

    #[test]
    fn unpack_layers_reads_gzip_and_plain_blobs() {
        let blobs = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let lower = blobs.path().join("lower");
        fs::write(&lower, gzip(&tarball(&[Item::File("a.txt", b"a")]))).unwrap();
        let upper = blobs.path().join("upper");
        fs::write(&upper, tarball(&[Item::File("b.txt", b"b")])).unwrap();

        let layers = vec![
            LayerFile {
                digest: "sha256:lower".into(),
                path: lower,
                compression: LayerCompression::Gzip,
            },
            LayerFile {
                digest: "sha256:upper".into(),
                path: upper,
                compression: LayerCompression::None,
            },
        ];
        unpack_layers(&layers, dest.path(), &CancellationToken::new(), &Logger::discard())
            .unwrap();
        assert!(dest.path().join("a.txt").is_file());
        assert!(dest.path().join("b.txt").is_file());
    }

    #[test]
    fn cancelled_before_start() {
        let dest = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let layers = vec![LayerFile {
            digest: "sha256:x".into(),
            path: dest.path().join("missing"),
            compression: LayerCompression::None,
        }];
        let err = unpack_layers(&layers, dest.path(), &cancel, &Logger::discard()).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn corrupt_gzip_is_an_io_error() {
        let blobs = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let bad = blobs.path().join("bad");
        fs::write(&bad, b"definitely not gzip").unwrap();
        let layers = vec![LayerFile {
            digest: "sha256:bad".into(),
            path: bad,
            compression: LayerCompression::Gzip,
        }];
        let err = unpack_layers(&layers, dest.path(), &CancellationToken::new(), &Logger::discard())
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.to_string().contains("sha256:bad"));
    }
}
