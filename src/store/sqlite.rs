use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::schema::MIGRATIONS;
use super::{StatusUpdate, Store};
use crate::config::{self, AppSettings};
use crate::error::{Error, Result};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn new_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_datetime(&v))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// True for unique/constraint failures, which the caller surfaces as
/// DuplicateRepo rather than a generic storage failure.
fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                ..
            },
            _,
        )
    )
}

const REPO_COLS: &str = "id, owner, name, url, description, status, is_private, local_path, \
     last_cloned, last_updated, last_checked, error_message, created_at";

fn row_to_repo(row: &Row) -> rusqlite::Result<Repository> {
    let status_str: String = row.get(5)?;
    let status = RepoStatus::parse(&status_str).unwrap_or_else(|| {
        tracing::warn!("Unknown repository status '{}' in database", status_str);
        RepoStatus::Error
    });

    Ok(Repository {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        description: row.get(4)?,
        status,
        is_private: row.get(6)?,
        local_path: row.get(7)?,
        last_cloned: parse_optional_datetime(row.get(8)?),
        last_updated: parse_optional_datetime(row.get(9)?),
        last_checked: parse_optional_datetime(row.get(10)?),
        error_message: row.get(11)?,
        created_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}

const ARCHIVE_COLS: &str =
    "id, repo_id, filename, file_path, size_bytes, file_count, is_incremental, created_at";

fn row_to_archive(row: &Row) -> rusqlite::Result<Archive> {
    Ok(Archive {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        filename: row.get(2)?,
        file_path: row.get(3)?,
        size_bytes: row.get::<_, i64>(4)? as u64,
        file_count: row.get::<_, i64>(5)? as u32,
        is_incremental: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

fn insert_archive_tx(
    conn: &Connection,
    repo_id: i64,
    archive: &NewArchive,
    now: DateTime<Utc>,
) -> Result<Archive> {
    conn.execute(
        "INSERT INTO archives (repo_id, filename, file_path, size_bytes, file_count, is_incremental, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            repo_id,
            archive.filename,
            archive.file_path,
            archive.size_bytes as i64,
            archive.file_count as i64,
            archive.is_incremental,
            format_datetime(&now),
        ],
    )?;

    let id = conn.last_insert_rowid();
    Ok(Archive {
        id,
        repo_id,
        filename: archive.filename.clone(),
        file_path: archive.file_path.clone(),
        size_bytes: archive.size_bytes,
        file_count: archive.file_count,
        is_incremental: archive.is_incremental,
        created_at: now,
    })
}

fn replace_file_hashes_tx(
    conn: &Connection,
    repo_id: i64,
    hashes: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute("DELETE FROM file_hashes WHERE repo_id = ?1", params![repo_id])?;

    let mut stmt = conn.prepare(
        "INSERT INTO file_hashes (repo_id, path, digest, last_seen) VALUES (?1, ?2, ?3, ?4)",
    )?;
    let seen = format_datetime(&now);
    for (path, digest) in hashes {
        stmt.execute(params![repo_id, path, digest, seen])?;
    }
    Ok(())
}

fn check_setting_key(key: &str) -> Result<()> {
    if config::is_allowed_key(key) {
        Ok(())
    } else {
        Err(Error::InvalidSetting(format!(
            "'{key}' is not a recognized setting"
        )))
    }
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        let mut conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);",
        )?;

        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        for (idx, migration) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            if version <= current {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(migration)?;
            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![version],
            )?;
            tx.commit()?;
            tracing::info!("Applied schema migration {}", version);
        }

        Ok(())
    }

    // Repository operations

    fn insert_repo(&self, owner: &str, name: &str, url: &str) -> Result<Repository> {
        let conn = self.conn();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO repositories (owner, name, url, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![owner, name, url, format_datetime(&now)],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::DuplicateRepo
            } else {
                Error::from(e)
            }
        })?;

        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {REPO_COLS} FROM repositories WHERE id = ?1"),
            params![id],
            row_to_repo,
        )
        .map_err(Error::from)
    }

    fn get_repo(&self, id: i64) -> Result<Option<Repository>> {
        self.conn()
            .query_row(
                &format!("SELECT {REPO_COLS} FROM repositories WHERE id = ?1"),
                params![id],
                row_to_repo,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_repo_by_url(&self, url: &str) -> Result<Option<Repository>> {
        self.conn()
            .query_row(
                &format!("SELECT {REPO_COLS} FROM repositories WHERE url = ?1"),
                params![url],
                row_to_repo,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_repos(&self, status: Option<RepoStatus>) -> Result<Vec<Repository>> {
        let conn = self.conn();
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REPO_COLS} FROM repositories WHERE status = ?1 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![status.as_str()], row_to_repo)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {REPO_COLS} FROM repositories ORDER BY id"))?;
                let rows = stmt.query_map([], row_to_repo)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    fn update_repo_status(
        &self,
        id: i64,
        status: RepoStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE repositories SET status = ?1, error_message = ?2 WHERE id = ?3",
            params![status.as_str(), error_message, id],
        )?;
        Ok(())
    }

    fn update_repo_metadata(
        &self,
        id: i64,
        description: Option<&str>,
        is_private: bool,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE repositories SET description = ?1, is_private = ?2 WHERE id = ?3",
            params![description, is_private, id],
        )?;
        Ok(())
    }

    fn set_repo_local_path(&self, id: i64, path: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE repositories SET local_path = ?1 WHERE id = ?2",
            params![path, id],
        )?;
        Ok(())
    }

    fn update_repo_timestamps(
        &self,
        id: i64,
        cloned: Option<DateTime<Utc>>,
        updated: Option<DateTime<Utc>>,
        checked: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn();
        if let Some(ts) = cloned {
            conn.execute(
                "UPDATE repositories SET last_cloned = ?1 WHERE id = ?2",
                params![format_datetime(&ts), id],
            )?;
        }
        if let Some(ts) = updated {
            conn.execute(
                "UPDATE repositories SET last_updated = ?1 WHERE id = ?2",
                params![format_datetime(&ts), id],
            )?;
        }
        if let Some(ts) = checked {
            conn.execute(
                "UPDATE repositories SET last_checked = ?1 WHERE id = ?2",
                params![format_datetime(&ts), id],
            )?;
        }
        Ok(())
    }

    fn delete_repo(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM repositories WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // Archive operations

    fn insert_archive(&self, repo_id: i64, archive: &NewArchive) -> Result<Archive> {
        insert_archive_tx(&self.conn(), repo_id, archive, Utc::now())
    }

    fn get_archive(&self, id: i64) -> Result<Option<Archive>> {
        self.conn()
            .query_row(
                &format!("SELECT {ARCHIVE_COLS} FROM archives WHERE id = ?1"),
                params![id],
                row_to_archive,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_archives(&self, repo_id: i64) -> Result<Vec<Archive>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ARCHIVE_COLS} FROM archives WHERE repo_id = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![repo_id], row_to_archive)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_archive(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM archives WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // File hash operations

    fn get_file_hashes(&self, repo_id: i64) -> Result<BTreeMap<String, String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT path, digest FROM file_hashes WHERE repo_id = ?1")?;
        let rows = stmt.query_map(params![repo_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<std::result::Result<BTreeMap<_, _>, _>>()
            .map_err(Error::from)
    }

    fn replace_file_hashes(&self, repo_id: i64, hashes: &BTreeMap<String, String>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        replace_file_hashes_tx(&tx, repo_id, hashes, Utc::now())?;
        tx.commit()?;
        Ok(())
    }

    fn clear_file_hashes(&self, repo_id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM file_hashes WHERE repo_id = ?1", params![repo_id])?;
        Ok(())
    }

    fn commit_snapshot(
        &self,
        repo_id: i64,
        archive: &NewArchive,
        hashes: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<Archive> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let inserted = insert_archive_tx(&tx, repo_id, archive, now)?;
        replace_file_hashes_tx(&tx, repo_id, hashes, now)?;
        tx.execute(
            "UPDATE repositories SET last_updated = ?1, last_checked = ?1 WHERE id = ?2",
            params![format_datetime(&now), repo_id],
        )?;

        tx.commit()?;
        Ok(inserted)
    }

    fn apply_status_updates(&self, updates: &[StatusUpdate], now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE repositories
                 SET status = ?1, description = ?2, is_private = ?3,
                     error_message = NULL, last_checked = ?4
                 WHERE id = ?5",
            )?;
            let checked = format_datetime(&now);
            for update in updates {
                stmt.execute(params![
                    update.status.as_str(),
                    update.description,
                    update.is_private,
                    checked,
                    update.repo_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // Settings operations

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        check_setting_key(key)?;
        self.conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::from)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        check_setting_key(key)?;
        self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn load_settings(&self) -> Result<AppSettings> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let pairs = rows.collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(AppSettings::from_pairs(&pairs))
    }

    fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        // Clear the allowlisted keys first so unset optionals do not linger.
        {
            let mut del = tx.prepare("DELETE FROM settings WHERE key = ?1")?;
            for key in config::SETTING_KEYS {
                del.execute(params![key])?;
            }
            let mut ins = tx.prepare("INSERT INTO settings (key, value) VALUES (?1, ?2)")?;
            for (key, value) in settings.to_pairs() {
                ins.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
