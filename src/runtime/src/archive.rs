//! Layer tarball extraction.
//!
//! Applies an uncompressed OCI layer (tar with whiteout markers) onto a
//! directory.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use a3s_diff_core::error::{DiffError, Result};
use tar::{Archive, EntryType};

/// Prefix marking a deleted path in a layer.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker file that hides every pre-existing entry of its directory.
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

const MAX_SYMLINKS: usize = 40;

/// Writes the entries of a canonical layer stream onto a filesystem root.
pub trait Extractor: Send + Sync {
    /// Apply the layer read from `reader` onto `root`.
    ///
    /// Returns the number of entry payload bytes written. Implementations
    /// may stop at an end-of-archive marker without consuming the rest of
    /// the stream.
    fn apply(&self, root: &Path, reader: &mut dyn Read) -> Result<u64>;
}

/// Tar extractor with OCI whiteout handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarExtractor;

impl Extractor for TarExtractor {
    fn apply(&self, root: &Path, reader: &mut dyn Read) -> Result<u64> {
        let mut archive = Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_overwrite(true);
        archive.set_unpack_xattrs(false);

        let mut applied = 0u64;
        let mut count = 0usize;
        for entry in archive.entries().map_err(extract_err)? {
            let mut entry = entry.map_err(extract_err)?;
            let raw = entry.path().map_err(extract_err)?.into_owned();
            let Some(path) = normalize(&raw)? else {
                continue;
            };

            let parent = resolve_in_root(root, parent_of(&path))?;
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name == WHITEOUT_OPAQUE {
                    clear_dir(&parent)?;
                    continue;
                }
                if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                    remove_path(&parent.join(hidden))?;
                    continue;
                }
            }

            if let Some(name) = path.file_name() {
                let is_dir = entry.header().entry_type() == EntryType::Directory;
                replace_conflicting(&parent.join(name), is_dir)?;
            }

            let size = entry.size();
            entry.unpack_in(root).map_err(|e| {
                DiffError::ExtractionError(format!("failed to unpack {}: {}", path.display(), e))
            })?;
            applied += size;
            count += 1;
        }

        tracing::debug!(
            root = %root.display(),
            entries = count,
            bytes = applied,
            "Extracted layer"
        );
        Ok(applied)
    }
}

fn extract_err(e: io::Error) -> DiffError {
    DiffError::ExtractionError(e.to_string())
}

/// Strip leading `/` and `.` components. `None` for the archive root.
fn normalize(raw: &Path) -> Result<Option<PathBuf>> {
    let mut path = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(DiffError::ExtractionError(format!(
                    "entry '{}' escapes the layer root",
                    raw.display()
                )))
            }
        }
    }
    Ok((!path.as_os_str().is_empty()).then_some(path))
}

/// Resolve `rel` beneath `root`, following symlinks as if `root` were `/`.
///
/// Absolute link targets restart at `root` and `..` never climbs above it,
/// so the result always lies inside `root`.
fn resolve_in_root(root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut pending: Vec<OsString> = Vec::new();
    push_components(&mut pending, rel);
    let mut resolved = PathBuf::new();
    let mut links = 0;

    while let Some(part) = pending.pop() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = root.join(&resolved).join(&part);
        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                links += 1;
                if links > MAX_SYMLINKS {
                    return Err(DiffError::ExtractionError(format!(
                        "too many levels of symbolic links resolving {}",
                        rel.display()
                    )));
                }
                let target = fs::read_link(&candidate).map_err(extract_err)?;
                if target.has_root() {
                    resolved = PathBuf::new();
                }
                push_components(&mut pending, &target);
            }
            _ => resolved.push(&part),
        }
    }
    Ok(root.join(resolved))
}

/// Push the meaningful components of `path` so the first one pops first.
fn push_components(stack: &mut Vec<OsString>, path: &Path) {
    let parts: Vec<OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => None,
        })
        .collect();
    stack.extend(parts.into_iter().rev());
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new(""))
}

fn remove_path(path: &Path) -> Result<()> {
    let removed = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    removed.map_err(|e| {
        DiffError::ExtractionError(format!("failed to remove {}: {}", path.display(), e))
    })
}

fn clear_dir(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(extract_err(e)),
    };
    for entry in entries {
        remove_path(&entry.map_err(extract_err)?.path())?;
    }
    Ok(())
}

/// A directory entry replaces a non-directory and vice versa.
fn replace_conflicting(target: &Path, is_dir: bool) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() != is_dir => remove_path(target),
        _ => Ok(()),
    }
}
