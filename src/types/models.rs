use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream lifecycle state of a tracked repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    Pending,
    Active,
    Archived,
    Deleted,
    Error,
}

impl RepoStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoStatus::Pending => "pending",
            RepoStatus::Active => "active",
            RepoStatus::Archived => "archived",
            RepoStatus::Deleted => "deleted",
            RepoStatus::Error => "error",
        }
    }

    /// Parses the database representation. Unknown strings map to `None`;
    /// the store degrades those to `Error` with a warning.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RepoStatus::Pending),
            "active" => Some(RepoStatus::Active),
            "archived" => Some(RepoStatus::Archived),
            "deleted" => Some(RepoStatus::Deleted),
            "error" => Some(RepoStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked upstream repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: RepoStatus,
    pub is_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cloned: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    /// Directory name of the on-disk mirror, `<owner>_<name>`.
    #[must_use]
    pub fn mirror_dir_name(&self) -> String {
        format!("{}_{}", self.owner, self.name)
    }
}

/// An immutable snapshot record. `filename` is the basename of the on-disk
/// file; `file_path` its full location under the data root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub id: i64,
    pub repo_id: i64,
    pub filename: String,
    #[serde(skip_serializing)]
    pub file_path: String,
    pub size_bytes: u64,
    pub file_count: u32,
    pub is_incremental: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields of an archive row known before insertion.
#[derive(Debug, Clone)]
pub struct NewArchive {
    pub filename: String,
    pub file_path: String,
    pub size_bytes: u64,
    pub file_count: u32,
    pub is_incremental: bool,
}

/// Forge API rate limit snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch: i64,
}

/// Upstream metadata for one repository, as reported by the forge.
/// A 404 is represented as `not_found`, not as an error.
#[derive(Debug, Clone, Default)]
pub struct RepoInfo {
    pub description: Option<String>,
    pub is_private: bool,
    pub archived: bool,
    pub not_found: bool,
}
