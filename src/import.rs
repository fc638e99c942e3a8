//! One-shot import of the legacy JSON tracking file.
//!
//! The legacy format is a JSON object keyed by repository URL, each value
//! carrying optional bookkeeping fields. Rows are inserted per URL, then
//! `<local_path>/versions/*.tar.xz` is scanned for pre-existing snapshot
//! files.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde::Serialize;

use crate::canon;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::RepoStatus;
use crate::worker::VERSIONS_DIR;

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    local_path: Option<String>,
    last_cloned: Option<String>,
    last_updated: Option<String>,
    status: Option<String>,
    description: Option<String>,
}

/// Summary returned to the caller after an import run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported_count: u32,
    pub skipped_count: u32,
    pub archives_found: u32,
    pub errors: Vec<String>,
}

/// Parses a legacy date, either the old "YYYY-MM-DD HH:MM:SS" form or
/// RFC 3339. Unparsable strings import as absent.
fn parse_legacy_date(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

/// Legacy status strings outside the canonical set coerce to pending.
fn parse_legacy_status(s: &str) -> RepoStatus {
    RepoStatus::parse(s).unwrap_or(RepoStatus::Pending)
}

pub fn import_legacy(store: &dyn Store, blob: &str) -> Result<ImportReport> {
    let entries: HashMap<String, LegacyEntry> = serde_json::from_str(blob)
        .map_err(|e| Error::InvalidSetting(format!("legacy import blob is not valid JSON: {e}")))?;

    let mut report = ImportReport::default();

    for (url, entry) in &entries {
        let canonical = match canon::canonicalize(url) {
            Ok(canonical) => canonical,
            Err(e) => {
                report.errors.push(format!("{url}: {e}"));
                continue;
            }
        };

        match store.get_repo_by_url(&canonical.url) {
            Ok(Some(_)) => {
                report.skipped_count += 1;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                report.errors.push(format!("{url}: {e}"));
                continue;
            }
        }

        let repo = match store.insert_repo(&canonical.owner, &canonical.name, &canonical.url) {
            Ok(repo) => repo,
            Err(e) => {
                report.errors.push(format!("{url}: {e}"));
                continue;
            }
        };

        let status = entry
            .status
            .as_deref()
            .map(parse_legacy_status)
            .unwrap_or(RepoStatus::Pending);
        if let Err(e) = store.update_repo_status(repo.id, status, None) {
            report.errors.push(format!("{url}: {e}"));
        }

        if let Some(description) = &entry.description {
            if let Err(e) = store.update_repo_metadata(repo.id, Some(description), false) {
                report.errors.push(format!("{url}: {e}"));
            }
        }

        if let Some(local_path) = &entry.local_path {
            if let Err(e) = store.set_repo_local_path(repo.id, local_path) {
                report.errors.push(format!("{url}: {e}"));
            }
        }

        let last_cloned = entry.last_cloned.as_deref().and_then(parse_legacy_date);
        let last_updated = entry.last_updated.as_deref().and_then(parse_legacy_date);
        if last_cloned.is_some() || last_updated.is_some() {
            if let Err(e) = store.update_repo_timestamps(repo.id, last_cloned, last_updated, None) {
                report.errors.push(format!("{url}: {e}"));
            }
        }

        if let Some(local_path) = &entry.local_path {
            report.archives_found += scan_archives(store, repo.id, Path::new(local_path), &mut report.errors);
        }

        report.imported_count += 1;
    }

    Ok(report)
}

/// Registers every `*.tar.xz` under the legacy versions directory. Sizes
/// come from the filesystem; file counts are unknown and import as zero.
fn scan_archives(
    store: &dyn Store,
    repo_id: i64,
    local_path: &Path,
    errors: &mut Vec<String>,
) -> u32 {
    let versions_dir = local_path.join(VERSIONS_DIR);
    if !versions_dir.is_dir() {
        return 0;
    }

    let entries = match std::fs::read_dir(&versions_dir) {
        Ok(entries) => entries,
        Err(e) => {
            errors.push(format!("{}: {e}", versions_dir.display()));
            return 0;
        }
    };

    let mut found = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "xz") != Some(true) {
            continue;
        }
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let record = crate::types::NewArchive {
            filename: filename.clone(),
            file_path: path.to_string_lossy().to_string(),
            size_bytes,
            file_count: 0,
            is_incremental: false,
        };
        match store.insert_archive(repo_id, &record) {
            Ok(_) => found += 1,
            Err(e) => errors.push(format!("{filename}: {e}")),
        }
    }
    found
}
