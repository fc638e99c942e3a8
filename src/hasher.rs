//! Content digest indexing for change detection.
//!
//! Walks a mirror's working set and produces a relative-path → digest map.
//! The digest is MD5: 128 bits is plenty for detecting that a file changed
//! between snapshots, and nothing here defends against adversarial
//! preimages.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Directory names excluded from every walk: the VCS metadata directory
/// and the snapshot output directory.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[".git", "versions"];

const READ_BUF_SIZE: usize = 64 * 1024;

/// Walks `root` and digests every file, in deterministic (sorted) order.
///
/// Entries named in `exclusions` are skipped at any depth. Symbolic links
/// are never followed: links pointing inside `root` are digested over
/// their link text, links escaping `root` are skipped entirely.
pub fn hash_tree(
    root: &Path,
    exclusions: &[&str],
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, String>> {
    let mut hashes = BTreeMap::new();
    walk(root, root, exclusions, cancel, &mut hashes)?;
    Ok(hashes)
}

fn walk(
    root: &Path,
    current: &Path,
    exclusions: &[&str],
    cancel: &CancellationToken,
    hashes: &mut BTreeMap<String, String>,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(current)?
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

        // symlink_metadata never follows the link itself
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&path)?;
            if !link_stays_inside(root, &path, &target) {
                continue;
            }
            let digest = hash_bytes(target.to_string_lossy().as_bytes());
            hashes.insert(relative_key(root, &path)?, digest);
        } else if meta.is_dir() {
            walk(root, &path, exclusions, cancel, hashes)?;
        } else if meta.is_file() {
            hashes.insert(relative_key(root, &path)?, hash_file(&path)?);
        }
    }

    Ok(())
}

/// Lists the paths that are new or changed in `curr` relative to `prev`.
/// Deleted paths are not reported; they drop out when the stored hash set
/// is replaced.
#[must_use]
pub fn diff(prev: &BTreeMap<String, String>, curr: &BTreeMap<String, String>) -> Vec<String> {
    curr.iter()
        .filter(|(path, digest)| prev.get(*path) != Some(digest))
        .map(|(path, _)| path.clone())
        .collect()
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Resolves a link target lexically against the link's parent and checks
/// it stays under `root`. No filesystem access, so dangling links inside
/// the tree still count as inside.
pub(crate) fn link_stays_inside(root: &Path, link: &Path, target: &Path) -> bool {
    let base = match link.parent() {
        Some(p) => p,
        None => return false,
    };
    let joined = if target.is_absolute() {
        target.to_path_buf()
    } else {
        base.join(target)
    };

    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !resolved.pop() {
                    return false;
                }
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    resolved.starts_with(root)
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|e| {
        Error::Io(std::io::Error::other(format!(
            "path '{}' escapes walk root: {e}",
            path.display()
        )))
    })?;
    // Forward slashes regardless of platform, so digests and tar entries agree.
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}
