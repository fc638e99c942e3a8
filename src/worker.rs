//! Worker loop: consumes tasks, drives the mirror/hash/snapshot pipeline
//! and persists the results.
//!
//! This is the only place that converts failures into persisted error
//! state and user-facing events. Git, hashing and packing all run on the
//! blocking executor so the scheduler stays responsive.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppSettings;
use crate::error::{Error, Result};
use crate::events::{redact_data_dir, Event, EventBus, TaskStage};
use crate::forge::{ForgeClient, BATCH_CHUNK};
use crate::git;
use crate::hasher;
use crate::snapshot;
use crate::store::{StatusUpdate, Store};
use crate::tasks::{ReconcileScope, Task, TaskKey, TaskManager};
use crate::types::{NewArchive, RepoInfo, RepoStatus, Repository};

/// Subdirectory of a mirror that holds its snapshot files.
pub const VERSIONS_DIR: &str = "versions";

/// Shared services a worker needs to process any task.
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub forge: ForgeClient,
    pub tasks: Arc<TaskManager>,
    pub bus: Arc<EventBus>,
}

/// Runs until the task channel closes. One permit is held per unit of real
/// work; StopAll and the UpdateAll fan-out are coordination and bypass the
/// semaphore so they cannot be starved by (or deadlock behind) running
/// tasks.
pub async fn worker_loop(mut rx: mpsc::Receiver<Task>, ctx: Arc<WorkerContext>) {
    while let Some(task) = rx.recv().await {
        match task {
            Task::StopAll => {
                tracing::info!("Stop requested; cancelling all active tasks");
                ctx.tasks.cancel_all();
            }
            Task::UpdateAll { include_archived } => {
                ctx.tasks.mark_running(TaskKey::UpdateAll);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    fan_out_updates(&ctx, include_archived).await;
                    ctx.tasks.mark_complete(TaskKey::UpdateAll);
                });
            }
            task @ (Task::EnsureMirrored(_) | Task::Reconcile(_)) => {
                let key = task.key().expect("work tasks carry an identity key");
                let ctx = Arc::clone(&ctx);
                // The permit is acquired inside the spawned future so the
                // dispatch loop itself never blocks on a full semaphore.
                tokio::spawn(async move {
                    let permit = match ctx.tasks.semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    ctx.tasks.mark_running(key);

                    let cancel = ctx.tasks.cancellation_token(key).unwrap_or_default();
                    match task {
                        Task::EnsureMirrored(repo_id) => {
                            handle_ensure_mirrored(&ctx, repo_id, &cancel).await;
                        }
                        Task::Reconcile(scope) => {
                            handle_reconcile(&ctx, scope, &cancel).await;
                        }
                        _ => unreachable!(),
                    }
                    ctx.tasks.mark_complete(key);
                    drop(permit);
                });
            }
        }
    }
    tracing::info!("Worker loop exited");
}

fn publish_stage(
    ctx: &WorkerContext,
    repo: &Repository,
    stage: TaskStage,
    fraction: Option<f64>,
    message: Option<String>,
) {
    ctx.bus.publish(Event::TaskProgress {
        repo_id: Some(repo.id),
        repo_url: repo.url.clone(),
        stage,
        fraction,
        message,
    });
}

fn publish_repo(ctx: &WorkerContext, repo_id: i64) {
    if let Ok(Some(repo)) = ctx.store.get_repo(repo_id) {
        ctx.bus.publish(Event::RepoUpdated(repo));
    }
}

// ---------------------------------------------------------------------------
// EnsureMirrored

async fn handle_ensure_mirrored(ctx: &WorkerContext, repo_id: i64, cancel: &CancellationToken) {
    let repo = match ctx.store.get_repo(repo_id) {
        Ok(Some(repo)) => repo,
        Ok(None) => {
            tracing::warn!("EnsureMirrored for unknown repository {}", repo_id);
            return;
        }
        Err(e) => {
            ctx.bus.publish(Event::TaskError {
                repo_id: Some(repo_id),
                kind: e.kind().to_string(),
                message: e.to_string(),
            });
            return;
        }
    };

    let settings = match ctx.store.load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            ctx.bus.publish(Event::TaskError {
                repo_id: Some(repo_id),
                kind: e.kind().to_string(),
                message: e.to_string(),
            });
            return;
        }
    };

    match ensure_mirrored(ctx, &repo, &settings, cancel).await {
        Ok(()) => {}
        Err(Error::Cancelled) => {
            tracing::info!("Task cancelled for {}/{}", repo.owner, repo.name);
            publish_stage(ctx, &repo, TaskStage::Cancelled, None, None);
        }
        Err(e) => {
            let message = redact_data_dir(&e.to_string(), &settings.data_dir_path());
            tracing::error!("Task failed for {}/{}: {}", repo.owner, repo.name, message);
            let _ = ctx
                .store
                .update_repo_status(repo.id, RepoStatus::Error, Some(&message));
            publish_repo(ctx, repo.id);
            ctx.bus.publish(Event::TaskError {
                repo_id: Some(repo.id),
                kind: e.kind().to_string(),
                message: message.clone(),
            });
            publish_stage(ctx, &repo, TaskStage::Failed, None, Some(message));
        }
    }
}

async fn ensure_mirrored(
    ctx: &WorkerContext,
    repo: &Repository,
    settings: &AppSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    let mirror_dir = match &repo.local_path {
        Some(path) => PathBuf::from(path),
        None => settings.data_dir_path().join(repo.mirror_dir_name()),
    };

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    if !mirror_dir.join(".git").exists() {
        match clone_phase(ctx, repo, settings, &mirror_dir, cancel).await? {
            ClonePhase::Cloned => {}
            ClonePhase::UpstreamGone => {
                publish_stage(
                    ctx,
                    repo,
                    TaskStage::Done,
                    Some(1.0),
                    Some(format!("{}/{} is gone upstream", repo.owner, repo.name)),
                );
                return Ok(());
            }
        }
    } else {
        publish_stage(
            ctx,
            repo,
            TaskStage::Fetching,
            Some(0.0),
            Some(format!("Checking {}/{} for updates", repo.owner, repo.name)),
        );

        let check_dir = mirror_dir.clone();
        let check_cancel = cancel.clone();
        let has_updates =
            tokio::task::spawn_blocking(move || git::fetch_has_updates(&check_dir, &check_cancel))
                .await
                .map_err(|e| Error::Git(format!("fetch task panicked: {e}")))?
                .map_err(Error::from)?;

        if !has_updates {
            ctx.store
                .update_repo_timestamps(repo.id, None, None, Some(Utc::now()))?;
            publish_stage(
                ctx,
                repo,
                TaskStage::Done,
                Some(1.0),
                Some(format!("{}/{} is already up to date", repo.owner, repo.name)),
            );
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let pull_dir = mirror_dir.clone();
        let pull_cancel = cancel.clone();
        let advanced =
            tokio::task::spawn_blocking(move || git::pull_fast_forward(&pull_dir, &pull_cancel))
                .await
                .map_err(|e| Error::Git(format!("pull task panicked: {e}")))?
                .map_err(Error::from)?;

        if !advanced {
            ctx.store
                .update_repo_timestamps(repo.id, None, None, Some(Utc::now()))?;
            publish_stage(
                ctx,
                repo,
                TaskStage::Done,
                Some(1.0),
                Some(format!("{}/{} is already up to date", repo.owner, repo.name)),
            );
            return Ok(());
        }
    }

    snapshot_phase(ctx, repo, &mirror_dir, cancel).await?;
    publish_stage(
        ctx,
        repo,
        TaskStage::Done,
        Some(1.0),
        Some(format!("Capture complete for {}/{}", repo.owner, repo.name)),
    );
    Ok(())
}

enum ClonePhase {
    Cloned,
    UpstreamGone,
}

async fn clone_phase(
    ctx: &WorkerContext,
    repo: &Repository,
    settings: &AppSettings,
    mirror_dir: &Path,
    cancel: &CancellationToken,
) -> Result<ClonePhase> {
    publish_stage(
        ctx,
        repo,
        TaskStage::Cloning,
        Some(0.0),
        Some(format!("Cloning {}/{}", repo.owner, repo.name)),
    );

    if let Some(parent) = mirror_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let url = repo.url.clone();
    let dest = mirror_dir.to_path_buf();
    let depth = settings.mirror_depth;
    let clone_cancel = cancel.clone();

    let bus = Arc::clone(&ctx.bus);
    let event_url = repo.url.clone();
    let event_id = repo.id;
    let last_percent = AtomicUsize::new(0);
    let progress = move |fraction: f64, message: &str| {
        // One event per whole percent, not per callback.
        let percent = (fraction * 100.0) as usize;
        if last_percent.swap(percent, Ordering::Relaxed) != percent {
            bus.publish(Event::TaskProgress {
                repo_id: Some(event_id),
                repo_url: event_url.clone(),
                stage: TaskStage::Cloning,
                fraction: Some(fraction),
                message: Some(message.to_string()),
            });
        }
    };

    let outcome = tokio::task::spawn_blocking(move || {
        git::clone_mirror(&url, &dest, depth, &progress, &clone_cancel)
    })
    .await
    .map_err(|e| Error::Git(format!("clone task panicked: {e}")))?;

    match outcome {
        Ok(()) => {
            let now = Utc::now();
            ctx.store
                .set_repo_local_path(repo.id, &mirror_dir.to_string_lossy())?;
            ctx.store
                .update_repo_status(repo.id, RepoStatus::Active, None)?;
            ctx.store
                .update_repo_timestamps(repo.id, Some(now), None, Some(now))?;
            publish_repo(ctx, repo.id);
            Ok(ClonePhase::Cloned)
        }
        Err(git::GitError::NotFound) => {
            ctx.store
                .update_repo_status(repo.id, RepoStatus::Deleted, None)?;
            ctx.store
                .update_repo_timestamps(repo.id, None, None, Some(Utc::now()))?;
            publish_repo(ctx, repo.id);
            Ok(ClonePhase::UpstreamGone)
        }
        Err(e) => Err(Error::from(e)),
    }
}

async fn snapshot_phase(
    ctx: &WorkerContext,
    repo: &Repository,
    mirror_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    publish_stage(
        ctx,
        repo,
        TaskStage::Archiving,
        Some(0.0),
        Some(format!("Hashing {}/{}", repo.owner, repo.name)),
    );

    let prev = ctx.store.get_file_hashes(repo.id)?;

    let hash_dir = mirror_dir.to_path_buf();
    let hash_cancel = cancel.clone();
    let curr = tokio::task::spawn_blocking(move || {
        hasher::hash_tree(&hash_dir, hasher::DEFAULT_EXCLUSIONS, &hash_cancel)
    })
    .await
    .map_err(|e| Error::Archive(format!("hash task panicked: {e}")))??;

    let is_incremental = !prev.is_empty();
    let changed = if is_incremental {
        let changed = hasher::diff(&prev, &curr);
        if changed.is_empty() {
            // A pull that advanced refs without changing tracked content.
            ctx.store
                .update_repo_timestamps(repo.id, None, None, Some(Utc::now()))?;
            return Ok(());
        }
        Some(changed)
    } else {
        None
    };

    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let filename = if is_incremental {
        format!("{}__{}__incr.tar.xz", repo.mirror_dir_name(), timestamp)
    } else {
        format!("{}__{}.tar.xz", repo.mirror_dir_name(), timestamp)
    };
    let archive_path = mirror_dir.join(VERSIONS_DIR).join(&filename);

    publish_stage(
        ctx,
        repo,
        TaskStage::Archiving,
        Some(0.5),
        Some(format!("Packing {filename}")),
    );

    let pack_source = mirror_dir.to_path_buf();
    let pack_dest = archive_path.clone();
    let pack_files = changed;
    let pack_cancel = cancel.clone();
    let info = tokio::task::spawn_blocking(move || {
        snapshot::pack(
            &pack_source,
            &pack_dest,
            pack_files.as_deref(),
            hasher::DEFAULT_EXCLUSIONS,
            &pack_cancel,
        )
    })
    .await
    .map_err(|e| Error::Archive(format!("pack task panicked: {e}")))??;

    if cancel.is_cancelled() {
        let _ = snapshot::delete(&archive_path);
        return Err(Error::Cancelled);
    }

    let record = NewArchive {
        filename,
        file_path: archive_path.to_string_lossy().to_string(),
        size_bytes: info.size_bytes,
        file_count: info.file_count,
        is_incremental,
    };

    match ctx.store.commit_snapshot(repo.id, &record, &curr, Utc::now()) {
        Ok(_) => {
            publish_repo(ctx, repo.id);
            Ok(())
        }
        Err(e) => {
            // The row never landed; do not leave the file orphaned.
            let _ = snapshot::delete(&archive_path);
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// UpdateAll

async fn fan_out_updates(ctx: &WorkerContext, include_archived: bool) {
    let repos = match ctx.store.list_repos(None) {
        Ok(repos) => repos,
        Err(e) => {
            tracing::error!("Failed to list repositories for update-all: {}", e);
            return;
        }
    };

    for repo in repos {
        if repo.status == RepoStatus::Pending {
            continue;
        }
        if !include_archived
            && matches!(repo.status, RepoStatus::Archived | RepoStatus::Deleted)
        {
            continue;
        }

        match ctx.tasks.enqueue(Task::EnsureMirrored(repo.id)).await {
            Ok(()) => {}
            Err(Error::AlreadyInProgress) => {
                tracing::debug!("Update for {}/{} already queued", repo.owner, repo.name);
            }
            Err(e) => {
                tracing::warn!("Could not queue update for {}/{}: {}", repo.owner, repo.name, e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ReconcileStatus

fn status_from_info(info: &RepoInfo) -> RepoStatus {
    if info.not_found {
        RepoStatus::Deleted
    } else if info.archived {
        RepoStatus::Archived
    } else {
        // A successful poll overrides a previous deleted state; upstreams
        // do come back.
        RepoStatus::Active
    }
}

async fn handle_reconcile(ctx: &WorkerContext, scope: ReconcileScope, cancel: &CancellationToken) {
    let subjects = match load_scope(ctx, &scope) {
        Ok(subjects) => subjects,
        Err(e) => {
            ctx.bus.publish(Event::TaskError {
                repo_id: None,
                kind: e.kind().to_string(),
                message: e.to_string(),
            });
            return;
        }
    };

    for chunk in subjects.chunks(BATCH_CHUNK) {
        if cancel.is_cancelled() {
            tracing::info!("Reconcile cancelled");
            return;
        }

        let pairs: Vec<(String, String)> = chunk
            .iter()
            .map(|r| (r.owner.clone(), r.name.clone()))
            .collect();

        let results = match ctx.forge.batch_get_repos(&pairs).await {
            Ok(results) => results,
            Err(e) => {
                // Degrade: statuses stay as they are, subscribers get a
                // warning, and the reconciliation as a whole keeps going
                // (except when the rate-limit gate just slammed shut).
                ctx.bus.publish(Event::TaskError {
                    repo_id: None,
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
                if matches!(e, Error::RateLimited(_)) {
                    return;
                }
                continue;
            }
        };

        let mut updates = Vec::new();
        for (repo, info) in chunk.iter().zip(results.iter()) {
            match info {
                Some(info) => updates.push(StatusUpdate {
                    repo_id: repo.id,
                    status: status_from_info(info),
                    description: info.description.clone(),
                    is_private: info.is_private,
                }),
                None => {
                    ctx.bus.publish(Event::TaskError {
                        repo_id: Some(repo.id),
                        kind: "forge_api_failure".to_string(),
                        message: format!(
                            "could not check {}/{}; leaving status unchanged",
                            repo.owner, repo.name
                        ),
                    });
                }
            }
        }

        if let Err(e) = ctx.store.apply_status_updates(&updates, Utc::now()) {
            ctx.bus.publish(Event::TaskError {
                repo_id: None,
                kind: e.kind().to_string(),
                message: e.to_string(),
            });
            continue;
        }

        for (repo, update) in chunk.iter().zip(results.iter()) {
            if update.is_some() {
                publish_repo(ctx, repo.id);
            }
        }
    }
}

fn load_scope(ctx: &WorkerContext, scope: &ReconcileScope) -> Result<Vec<Repository>> {
    match scope {
        ReconcileScope::All => ctx.store.list_repos(None),
        ReconcileScope::Subset(ids) => {
            let mut repos = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(repo) = ctx.store.get_repo(*id)? {
                    repos.push(repo);
                }
            }
            Ok(repos)
        }
    }
}
