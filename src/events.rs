//! Fan-out event bus between the worker pipeline and external subscribers.
//!
//! Each subscriber gets its own bounded buffer; publication never blocks,
//! so a stuck subscriber drops its own events instead of back-pressuring
//! the workers.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::Repository;

/// Buffered events per subscriber before the bus starts dropping.
const SUBSCRIBER_BUFFER: usize = 256;

/// Pipeline stage of a running task, for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Cloning,
    Fetching,
    Archiving,
    Done,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStage::Cloning => "Cloning",
            TaskStage::Fetching => "Fetching",
            TaskStage::Archiving => "Archiving",
            TaskStage::Done => "Done",
            TaskStage::Failed => "Failed",
            TaskStage::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum Event {
    TaskProgress {
        #[serde(skip_serializing_if = "Option::is_none")]
        repo_id: Option<i64>,
        repo_url: String,
        stage: TaskStage,
        #[serde(skip_serializing_if = "Option::is_none")]
        fraction: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RepoUpdated(Repository),
    TaskError {
        #[serde(skip_serializing_if = "Option::is_none")]
        repo_id: Option<i64>,
        kind: String,
        message: String,
    },
}

pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Attaches a subscriber. Subscribers are expected to live for the
    /// process lifetime; a dropped receiver is pruned on the next publish.
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Best-effort delivery to every subscriber. The lock is held only to
    /// copy the subscriber list, not for delivery.
    pub fn publish(&self, event: Event) {
        let senders: Vec<mpsc::Sender<Event>> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut saw_closed = false;
        for sender in &senders {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("Dropping event for slow subscriber");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => saw_closed = true,
            }
        }

        if saw_closed {
            self.subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|s| !s.is_closed());
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrites any occurrence of the data root in a user-facing message to a
/// relative form, so events never leak absolute host paths.
#[must_use]
pub fn redact_data_dir(message: &str, data_dir: &std::path::Path) -> String {
    let root = data_dir.to_string_lossy();
    if root.is_empty() || root == "." {
        return message.to_string();
    }
    let trimmed = root.trim_end_matches('/');
    message
        .replace(&format!("{trimmed}/"), "")
        .replace(trimmed, ".")
}
