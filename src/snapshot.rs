//! Snapshot packing and extraction.
//!
//! Snapshots are POSIX tar streams inside an xz compressor, written
//! through a temporary sibling file and renamed into place so a failed
//! pack never leaves a partial archive at the target path. Extraction
//! validates every entry against the destination root before unpacking.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use tar::Builder;
use tokio_util::sync::CancellationToken;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::error::{Error, Result};
use crate::hasher;

const XZ_LEVEL: u32 = 6;

/// Size and entry count of a finished snapshot file.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotInfo {
    pub size_bytes: u64,
    pub file_count: u32,
}

/// Packs `source` into a `.tar.xz` at `output`.
///
/// With `files` present only those relative paths are packed (incremental
/// snapshot); otherwise the whole tree is packed minus `exclusions`.
/// Symbolic links are stored as links; links escaping `source` are skipped
/// the same way the hash indexer skips them.
pub fn pack(
    source: &Path,
    output: &Path,
    files: Option<&[String]>,
    exclusions: &[&str],
    cancel: &CancellationToken,
) -> Result<SnapshotInfo> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_sibling(output);
    let written = write_archive(source, &tmp, files, exclusions, cancel)
        .and_then(|count| {
            fs::rename(&tmp, output)?;
            Ok(count)
        });

    let file_count = match written {
        Ok(count) => count,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    };

    let size_bytes = fs::metadata(output)?.len();
    Ok(SnapshotInfo {
        size_bytes,
        file_count,
    })
}

fn temp_sibling(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot".to_string());
    name.push_str(".tmp");
    output.with_file_name(name)
}

fn write_archive(
    source: &Path,
    tmp: &Path,
    files: Option<&[String]>,
    exclusions: &[&str],
    cancel: &CancellationToken,
) -> Result<u32> {
    let file = File::create(tmp)?;
    let encoder = XzEncoder::new(file, XZ_LEVEL);
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    let file_count = match files {
        Some(list) => {
            let mut count = 0u32;
            for relative in list {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let full = source.join(relative);
                let meta = match fs::symlink_metadata(&full) {
                    Ok(m) => m,
                    // A path can vanish between hashing and packing; skip it.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(Error::from(e)),
                };
                if meta.is_file() || meta.file_type().is_symlink() {
                    builder
                        .append_path_with_name(&full, relative)
                        .map_err(|e| Error::Archive(format!("failed to add '{relative}': {e}")))?;
                    count += 1;
                }
            }
            count
        }
        None => append_tree(&mut builder, source, source, exclusions, cancel)?,
    };

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::Archive(format!("failed to finish tar stream: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Archive(format!("failed to finish xz stream: {e}")))?;

    Ok(file_count)
}

fn append_tree<W: std::io::Write>(
    builder: &mut Builder<W>,
    base: &Path,
    current: &Path,
    exclusions: &[&str],
    cancel: &CancellationToken,
) -> Result<u32> {
    let mut count = 0u32;
    let mut entries: Vec<_> = fs::read_dir(current)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => continue,
        };
        if exclusions.contains(&name.as_str()) {
            continue;
        }

        let meta = fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            if !hasher::link_stays_inside(base, &path, &target) {
                continue;
            }
            builder
                .append_path_with_name(&path, relative_name(base, &path)?)
                .map_err(|e| Error::Archive(format!("failed to add link: {e}")))?;
            count += 1;
        } else if meta.is_dir() {
            count += append_tree(builder, base, &path, exclusions, cancel)?;
        } else if meta.is_file() {
            builder
                .append_path_with_name(&path, relative_name(base, &path)?)
                .map_err(|e| {
                    Error::Archive(format!("failed to add '{}': {e}", path.display()))
                })?;
            count += 1;
        }
    }

    Ok(count)
}

fn relative_name(base: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(base)
        .map_err(|e| Error::Archive(format!("path escapes snapshot root: {e}")))?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Extracts a `.tar.xz` into `dest`.
///
/// Every entry's resolved path must stay strictly within `dest`: absolute
/// paths, `..` segments, and link entries whose target escapes the
/// destination are refused with a security-class error.
pub fn unpack(archive_path: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let canonical_dest = dest.canonicalize()?;

    let file = File::open(archive_path)?;
    let decoder = XzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(false);

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let entry_path = entry.path()?.into_owned();

        check_entry_path(&entry_path)?;
        check_link_target(&entry, &entry_path)?;

        let dest_path = canonical_dest.join(&entry_path);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
            // A prior entry may have planted a symlinked directory; resolve
            // and re-check before writing through it.
            let canonical_parent = parent.canonicalize()?;
            if !canonical_parent.starts_with(&canonical_dest) {
                return Err(Error::ArchiveSecurity(format!(
                    "entry '{}' would extract outside the destination",
                    entry_path.display()
                )));
            }
        }

        entry.unpack(&dest_path)?;
    }

    Ok(())
}

fn check_entry_path(entry_path: &Path) -> Result<()> {
    for component in entry_path.components() {
        match component {
            Component::ParentDir => {
                return Err(Error::ArchiveSecurity(format!(
                    "entry '{}' contains a path traversal segment",
                    entry_path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::ArchiveSecurity(format!(
                    "entry '{}' uses an absolute path",
                    entry_path.display()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// For symlink and hard-link entries, the resolved target must also land
/// inside the destination.
fn check_link_target<R: std::io::Read>(entry: &tar::Entry<R>, entry_path: &Path) -> Result<()> {
    let kind = entry.header().entry_type();
    if !kind.is_symlink() && !kind.is_hard_link() {
        return Ok(());
    }

    let target = entry
        .link_name()
        .map_err(|e| Error::Archive(format!("unreadable link target: {e}")))?
        .ok_or_else(|| Error::Archive("link entry without a target".to_string()))?;

    if target.is_absolute() {
        return Err(Error::ArchiveSecurity(format!(
            "link '{}' targets an absolute path",
            entry_path.display()
        )));
    }

    // Symlink targets resolve against the entry's directory; hard-link
    // targets name another entry relative to the archive root.
    let base: PathBuf = if kind.is_symlink() {
        entry_path.parent().unwrap_or(Path::new("")).to_path_buf()
    } else {
        PathBuf::new()
    };

    let mut resolved = PathBuf::new();
    for component in base.join(&*target).components() {
        match component {
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(Error::ArchiveSecurity(format!(
                        "link '{}' escapes the destination",
                        entry_path.display()
                    )));
                }
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    Ok(())
}

/// Removes a snapshot file. A missing file is not an error.
pub fn delete(archive_path: &Path) -> Result<()> {
    match fs::remove_file(archive_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}
