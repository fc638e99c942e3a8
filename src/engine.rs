//! Inbound facade over the archival engine.
//!
//! The presentation layer talks to this type only: every call either
//! completes quickly against the metadata store or enqueues a task and
//! returns, with long-running work reporting through the event bus.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::canon;
use crate::config::{AppSettings, SETTING_DATA_DIR};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::forge::ForgeClient;
use crate::import::{self, ImportReport};
use crate::reconcile;
use crate::secrets::SecretKeeper;
use crate::snapshot;
use crate::store::{SqliteStore, Store};
use crate::tasks::{QueueSnapshot, ReconcileScope, Task, TaskKey, TaskManager};
use crate::types::{Archive, RateLimit, RepoStatus, Repository};
use crate::worker::{worker_loop, WorkerContext};

/// Service name under which the forge token is kept in the secret store.
pub const SECRET_SERVICE: &str = "gitvault";

const DB_FILENAME: &str = "gitvault.db";

pub struct Engine {
    store: Arc<dyn Store>,
    forge: ForgeClient,
    tasks: Arc<TaskManager>,
    bus: Arc<EventBus>,
    secrets: SecretKeeper,
    worker: JoinHandle<()>,
    auto_reconcile: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Opens (or creates) the engine under `data_dir`: database, secret
    /// keeper, forge client against the public API, worker loop, and the
    /// auto reconciler when configured.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let store = SqliteStore::new(data_dir.join(DB_FILENAME))?;
        store.initialize()?;
        if store.get_setting(SETTING_DATA_DIR)?.is_none() {
            store.set_setting(SETTING_DATA_DIR, &data_dir.to_string_lossy())?;
        }

        let secrets = SecretKeeper::new();
        let token = match secrets.get_token(SECRET_SERVICE).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Could not read forge token: {}", e);
                None
            }
        };
        let forge = ForgeClient::new(None, token, false)?;

        Self::with_components(Arc::new(store), forge, secrets)
    }

    /// Assembles an engine from explicit components. Integration tests use
    /// this to point the forge client at a mock server.
    pub fn with_components(
        store: Arc<dyn Store>,
        forge: ForgeClient,
        secrets: SecretKeeper,
    ) -> Result<Self> {
        let settings = store.load_settings()?;
        let (tasks, rx) = TaskManager::new(settings.max_concurrent_tasks);
        let bus = Arc::new(EventBus::new());

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            forge: forge.clone(),
            tasks: Arc::clone(&tasks),
            bus: Arc::clone(&bus),
        });
        let worker = tokio::spawn(worker_loop(rx, ctx));

        let shutdown = CancellationToken::new();
        let auto_reconcile = settings
            .auto_poll_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| {
                reconcile::spawn_auto_reconcile(
                    Arc::clone(&tasks),
                    Duration::from_secs(u64::from(minutes) * 60),
                    shutdown.clone(),
                )
            });

        Ok(Self {
            store,
            forge,
            tasks,
            bus,
            secrets,
            worker,
            auto_reconcile,
            shutdown,
        })
    }

    /// Attaches an event subscriber for the process lifetime.
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        self.bus.subscribe()
    }

    #[must_use]
    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.tasks.snapshot()
    }

    /// Polls until no task is queued or active. CLI convenience; event
    /// subscribers see per-task completion as it happens.
    pub async fn wait_until_idle(&self) {
        loop {
            let snapshot = self.tasks.snapshot();
            if snapshot.active == 0 && snapshot.queued == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    // -- repositories --------------------------------------------------

    /// Canonicalizes `url` and creates a pending repository record.
    pub fn add_repo(&self, url: &str) -> Result<Repository> {
        let canonical = canon::canonicalize(url)?;
        self.store
            .insert_repo(&canonical.owner, &canonical.name, &canonical.url)
    }

    pub fn list_repos(&self, status: Option<RepoStatus>) -> Result<Vec<Repository>> {
        self.store.list_repos(status)
    }

    pub fn get_repo(&self, id: i64) -> Result<Repository> {
        self.store.get_repo(id)?.ok_or(Error::NotFound)
    }

    /// Deletes a repository record; its archive and hash rows cascade.
    /// With `remove_files`, the mirror directory and snapshot files go
    /// too, best-effort.
    pub async fn delete_repo(&self, id: i64, remove_files: bool) -> Result<()> {
        let repo = self.get_repo(id)?;
        self.tasks.cancel(TaskKey::Repo(id));

        if remove_files {
            let archives = self.store.list_archives(id)?;
            let local_path = repo.local_path.clone();
            tokio::task::spawn_blocking(move || {
                for archive in &archives {
                    let _ = snapshot::delete(Path::new(&archive.file_path));
                }
                if let Some(path) = local_path {
                    let _ = std::fs::remove_dir_all(path);
                }
            })
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        }

        self.store.delete_repo(id)?;
        Ok(())
    }

    // -- task control ---------------------------------------------------

    /// Queues an EnsureMirrored for one repository.
    pub async fn enqueue_update(&self, id: i64) -> Result<()> {
        self.get_repo(id)?;
        self.tasks.enqueue(Task::EnsureMirrored(id)).await
    }

    /// Queues the update-all fan-out.
    pub async fn enqueue_update_all(&self, include_archived: bool) -> Result<()> {
        self.tasks
            .enqueue(Task::UpdateAll { include_archived })
            .await
    }

    /// Queues a full status reconcile.
    pub async fn enqueue_reconcile(&self) -> Result<()> {
        self.tasks
            .enqueue(Task::Reconcile(ReconcileScope::All))
            .await
    }

    /// Signals cancellation on everything queued or active.
    pub async fn stop_all(&self) -> Result<()> {
        self.tasks.enqueue(Task::StopAll).await
    }

    // -- archives -------------------------------------------------------

    pub fn list_archives(&self, repo_id: i64) -> Result<Vec<Archive>> {
        self.get_repo(repo_id)?;
        self.store.list_archives(repo_id)
    }

    /// Extracts a snapshot into `destination` with full tar-slip
    /// validation.
    pub async fn extract_archive(&self, archive_id: i64, destination: &Path) -> Result<()> {
        let archive = self.store.get_archive(archive_id)?.ok_or(Error::NotFound)?;
        let source = Path::new(&archive.file_path).to_path_buf();
        let dest = destination.to_path_buf();
        tokio::task::spawn_blocking(move || snapshot::unpack(&source, &dest))
            .await
            .map_err(|e| Error::Archive(format!("extract task panicked: {e}")))?
    }

    /// Removes a snapshot row and its file. Either being already gone is
    /// tolerated.
    pub async fn delete_archive(&self, archive_id: i64) -> Result<()> {
        let archive = self.store.get_archive(archive_id)?.ok_or(Error::NotFound)?;
        let path = Path::new(&archive.file_path).to_path_buf();
        tokio::task::spawn_blocking(move || snapshot::delete(&path))
            .await
            .map_err(|e| Error::Archive(format!("delete task panicked: {e}")))??;
        self.store.delete_archive(archive_id)?;
        Ok(())
    }

    // -- settings, token, misc -----------------------------------------

    pub fn get_settings(&self) -> Result<AppSettings> {
        self.store.load_settings()
    }

    /// Persists settings; concurrency and poll-interval changes take
    /// effect on the next start. An accompanying token goes to the secret
    /// keeper and applies to the live forge client immediately.
    pub async fn save_settings(
        &self,
        settings: &AppSettings,
        token: Option<String>,
    ) -> Result<()> {
        self.store.save_settings(settings)?;
        if let Some(token) = token {
            self.set_forge_token(Some(token)).await?;
        }
        Ok(())
    }

    /// Stores or erases the forge token and rebinds the live client.
    pub async fn set_forge_token(&self, token: Option<String>) -> Result<()> {
        match &token {
            Some(token) => self.secrets.set_token(SECRET_SERVICE, token).await?,
            None => self.secrets.erase_token(SECRET_SERVICE).await?,
        }
        self.forge.set_token(token);
        Ok(())
    }

    pub async fn get_rate_limit(&self) -> Result<RateLimit> {
        self.forge.rate_limit().await
    }

    /// One-shot import of the legacy JSON tracking file.
    pub fn import_legacy(&self, blob: &str) -> Result<ImportReport> {
        import::import_legacy(self.store.as_ref(), blob)
    }

    /// Stops background loops. Queued work is cancelled, not drained.
    pub fn shutdown(&self) {
        self.tasks.cancel_all();
        self.shutdown.cancel();
        if let Some(handle) = &self.auto_reconcile {
            handle.abort();
        }
        self.worker.abort();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
