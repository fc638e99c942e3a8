use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid repository url: {0}")]
    InvalidUrl(String),

    #[error("repository already tracked")]
    DuplicateRepo,

    #[error("not found")]
    NotFound,

    #[error("a task for this target is already queued or running")]
    AlreadyInProgress,

    #[error("cancelled")]
    Cancelled,

    #[error("git failure: {0}")]
    Git(String),

    #[error("forge api failure: {0}")]
    ForgeApi(String),

    #[error("forge authentication failed: {0}")]
    ForgeAuth(String),

    #[error("forge rate limit exhausted, resets at epoch {0}")]
    RateLimited(i64),

    #[error("archive failure: {0}")]
    Archive(String),

    #[error("archive entry rejected: {0}")]
    ArchiveSecurity(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("secret store error: {0}")]
    Secrets(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

impl Error {
    /// Stable machine-readable kind, used by event-bus subscribers to group
    /// failures without parsing messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidUrl(_) => "invalid_url",
            Error::DuplicateRepo => "duplicate_repo",
            Error::NotFound => "not_found",
            Error::AlreadyInProgress => "already_in_progress",
            Error::Cancelled => "cancelled",
            Error::Git(_) => "git_failure",
            Error::ForgeApi(_) => "forge_api_failure",
            Error::ForgeAuth(_) => "forge_auth_failure",
            Error::RateLimited(_) => "rate_limited",
            Error::Archive(_) => "archive_failure",
            Error::ArchiveSecurity(_) => "archive_security",
            Error::Database(_) => "storage_failure",
            Error::Io(_) => "io_failure",
            Error::Json(_) => "json_failure",
            Error::Secrets(_) => "secrets_failure",
            Error::InvalidSetting(_) => "invalid_setting",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::ForgeApi(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
