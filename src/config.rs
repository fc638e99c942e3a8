use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const SETTING_DATA_DIR: &str = "data_dir";
pub const SETTING_MIRROR_DEPTH: &str = "mirror_depth";
pub const SETTING_MAX_CONCURRENT: &str = "max_concurrent_tasks";
pub const SETTING_AUTO_POLL: &str = "auto_poll_minutes";

/// The closed allowlist of persisted setting keys. Anything else is
/// rejected by the store.
pub const SETTING_KEYS: &[&str] = &[
    SETTING_DATA_DIR,
    SETTING_MIRROR_DEPTH,
    SETTING_MAX_CONCURRENT,
    SETTING_AUTO_POLL,
];

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_mirror_depth() -> u32 {
    1
}

fn default_max_concurrent() -> u32 {
    4
}

/// Engine configuration, persisted as settings rows.
///
/// The forge auth token is NOT part of this struct; it lives in the
/// platform secret store and never touches the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Clone depth for new mirrors; 0 means full history.
    #[serde(default = "default_mirror_depth")]
    pub mirror_depth: u32,
    /// Worker semaphore size, clamped to 1..=16 by the task manager.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,
    /// Interval for the automatic status reconciler; None disables it.
    #[serde(default)]
    pub auto_poll_minutes: Option<u32>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mirror_depth: default_mirror_depth(),
            max_concurrent_tasks: default_max_concurrent(),
            auto_poll_minutes: None,
        }
    }
}

impl AppSettings {
    #[must_use]
    pub fn data_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Flattens into (key, value) rows for persistence.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (SETTING_DATA_DIR, self.data_dir.clone()),
            (SETTING_MIRROR_DEPTH, self.mirror_depth.to_string()),
            (SETTING_MAX_CONCURRENT, self.max_concurrent_tasks.to_string()),
        ];
        if let Some(minutes) = self.auto_poll_minutes {
            pairs.push((SETTING_AUTO_POLL, minutes.to_string()));
        }
        pairs
    }

    /// Rebuilds settings from stored rows, falling back to defaults for
    /// missing or unparsable values.
    #[must_use]
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: pairs
                .get(SETTING_DATA_DIR)
                .cloned()
                .unwrap_or(defaults.data_dir),
            mirror_depth: pairs
                .get(SETTING_MIRROR_DEPTH)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.mirror_depth),
            max_concurrent_tasks: pairs
                .get(SETTING_MAX_CONCURRENT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrent_tasks),
            auto_poll_minutes: pairs.get(SETTING_AUTO_POLL).and_then(|v| v.parse().ok()),
        }
    }
}

/// True iff `key` is on the settings allowlist.
#[must_use]
pub fn is_allowed_key(key: &str) -> bool {
    SETTING_KEYS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = AppSettings::default();
        assert_eq!(s.data_dir, "./data");
        assert_eq!(s.mirror_depth, 1);
        assert_eq!(s.max_concurrent_tasks, 4);
        assert!(s.auto_poll_minutes.is_none());
    }

    #[test]
    fn test_pairs_round_trip() {
        let s = AppSettings {
            data_dir: "/srv/vault".to_string(),
            mirror_depth: 0,
            max_concurrent_tasks: 8,
            auto_poll_minutes: Some(30),
        };
        let map: HashMap<String, String> = s
            .to_pairs()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let back = AppSettings::from_pairs(&map);
        assert_eq!(back.data_dir, "/srv/vault");
        assert_eq!(back.mirror_depth, 0);
        assert_eq!(back.max_concurrent_tasks, 8);
        assert_eq!(back.auto_poll_minutes, Some(30));
    }

    #[test]
    fn test_unset_poll_interval_not_persisted() {
        let s = AppSettings::default();
        assert!(s.to_pairs().iter().all(|(k, _)| *k != SETTING_AUTO_POLL));
    }

    #[test]
    fn test_allowlist() {
        assert!(is_allowed_key("data_dir"));
        assert!(is_allowed_key("auto_poll_minutes"));
        assert!(!is_allowed_key("github_token"));
        assert!(!is_allowed_key(""));
    }
}
