mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::AppSettings;
use crate::error::Result;
use crate::types::*;

/// One repository's reconciled upstream state, applied in a batch.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub repo_id: i64,
    pub status: RepoStatus,
    pub description: Option<String>,
    pub is_private: bool,
}

/// Store defines the metadata database interface.
pub trait Store: Send + Sync {
    /// Ensures the schema exists and is at the current version.
    fn initialize(&self) -> Result<()>;

    // Repository operations
    fn insert_repo(&self, owner: &str, name: &str, url: &str) -> Result<Repository>;
    fn get_repo(&self, id: i64) -> Result<Option<Repository>>;
    fn get_repo_by_url(&self, url: &str) -> Result<Option<Repository>>;
    fn list_repos(&self, status: Option<RepoStatus>) -> Result<Vec<Repository>>;
    fn update_repo_status(
        &self,
        id: i64,
        status: RepoStatus,
        error_message: Option<&str>,
    ) -> Result<()>;
    fn update_repo_metadata(
        &self,
        id: i64,
        description: Option<&str>,
        is_private: bool,
    ) -> Result<()>;
    fn set_repo_local_path(&self, id: i64, path: &str) -> Result<()>;
    fn update_repo_timestamps(
        &self,
        id: i64,
        cloned: Option<DateTime<Utc>>,
        updated: Option<DateTime<Utc>>,
        checked: Option<DateTime<Utc>>,
    ) -> Result<()>;
    fn delete_repo(&self, id: i64) -> Result<bool>;

    // Archive operations
    fn insert_archive(&self, repo_id: i64, archive: &NewArchive) -> Result<Archive>;
    fn get_archive(&self, id: i64) -> Result<Option<Archive>>;
    fn list_archives(&self, repo_id: i64) -> Result<Vec<Archive>>;
    fn delete_archive(&self, id: i64) -> Result<bool>;

    // File hash operations
    fn get_file_hashes(&self, repo_id: i64) -> Result<BTreeMap<String, String>>;
    fn replace_file_hashes(&self, repo_id: i64, hashes: &BTreeMap<String, String>) -> Result<()>;
    fn clear_file_hashes(&self, repo_id: i64) -> Result<()>;

    /// Commits one snapshot atomically: inserts the archive row, replaces
    /// the stored hash set, and stamps `last_updated`/`last_checked`.
    /// Either all of it becomes visible or none of it does.
    fn commit_snapshot(
        &self,
        repo_id: i64,
        archive: &NewArchive,
        hashes: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<Archive>;

    /// Applies one reconciled chunk in a single transaction, stamping
    /// `last_checked` on every subject.
    fn apply_status_updates(&self, updates: &[StatusUpdate], now: DateTime<Utc>) -> Result<()>;

    // Settings operations (keys validated against the allowlist)
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    fn load_settings(&self) -> Result<AppSettings>;
    fn save_settings(&self, settings: &AppSettings) -> Result<()>;
}
