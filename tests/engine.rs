//! End-to-end engine tests.
//!
//! Mirrors are cloned from local source repositories through git2's local
//! transport, so the full clone → hash → snapshot pipeline runs without
//! network access. Forge interactions go against a mock HTTP server.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use gitvault::config::AppSettings;
use gitvault::engine::Engine;
use gitvault::error::Error;
use gitvault::events::{Event, TaskStage};
use gitvault::forge::ForgeClient;
use gitvault::hasher::{self, DEFAULT_EXCLUSIONS};
use gitvault::secrets::SecretKeeper;
use gitvault::store::{SqliteStore, Store};
use gitvault::types::{RepoStatus, Repository};

struct TestVault {
    tmp: TempDir,
    store: Arc<SqliteStore>,
    engine: Engine,
}

impl TestVault {
    fn new() -> Self {
        Self::with_forge_url(None)
    }

    fn with_forge_url(forge_url: Option<&str>) -> Self {
        let tmp = TempDir::new().expect("create temp dir");
        let data_dir = tmp.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();

        let store = Arc::new(SqliteStore::new(data_dir.join("gitvault.db")).unwrap());
        store.initialize().unwrap();
        store
            .save_settings(&AppSettings {
                data_dir: data_dir.to_string_lossy().to_string(),
                mirror_depth: 0, // local transport, full history
                max_concurrent_tasks: 4,
                auto_poll_minutes: None,
            })
            .unwrap();

        let forge = match forge_url {
            Some(url) => ForgeClient::new(Some(url), None, true).unwrap(),
            None => ForgeClient::new(None, None, false).unwrap(),
        };

        let engine = Engine::with_components(
            Arc::clone(&store) as Arc<dyn Store>,
            forge,
            SecretKeeper::new(),
        )
        .unwrap();

        Self { tmp, store, engine }
    }

    fn data_dir(&self) -> PathBuf {
        self.tmp.path().join("data")
    }

    /// Registers a repository whose "upstream" is a local source checkout.
    fn track_local(&self, name: &str, source: &Path) -> Repository {
        self.store
            .insert_repo("local", name, &source.to_string_lossy())
            .unwrap()
    }

    async fn run_to_idle(&self) {
        tokio::time::timeout(Duration::from_secs(60), self.engine.wait_until_idle())
            .await
            .expect("engine did not go idle");
    }
}

fn commit_all(repo: &git2::Repository, message: &str) {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("tester", "tester@example.com").unwrap();
    let parent = repo
        .head()
        .ok()
        .and_then(|h| h.target())
        .map(|oid| repo.find_commit(oid).unwrap());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap();
}

/// Creates a source repository with an initial commit of `files`.
fn source_repo(dir: &Path, files: &[(&str, &str)]) -> git2::Repository {
    let repo = git2::Repository::init(dir).unwrap();
    for (path, content) in files {
        let full = dir.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
    }
    commit_all(&repo, "initial commit");
    repo
}

fn drain_stages(events: &mut tokio::sync::mpsc::Receiver<Event>) -> Vec<TaskStage> {
    let mut stages = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::TaskProgress { stage, .. } = event {
            stages.push(stage);
        }
    }
    stages
}

// ---------------------------------------------------------------------------
// Scenario: first mirror

#[tokio::test]
async fn first_mirror_creates_full_snapshot() {
    let vault = TestVault::new();
    let src_dir = vault.tmp.path().join("upstream");
    source_repo(
        &src_dir,
        &[("README.md", "hello"), ("src/main.rs", "fn main() {}")],
    );

    let repo = vault.track_local("one", &src_dir);
    let mut events = vault.engine.subscribe();

    vault.engine.enqueue_update(repo.id).await.unwrap();
    vault.run_to_idle().await;

    let repo = vault.engine.get_repo(repo.id).unwrap();
    assert_eq!(repo.status, RepoStatus::Active);
    assert!(repo.last_cloned.is_some());
    assert!(repo.last_updated.is_some());

    let mirror = vault.data_dir().join("local_one");
    assert!(mirror.join(".git").exists(), "mirror missing on disk");
    assert_eq!(repo.local_path.as_deref(), Some(&*mirror.to_string_lossy()));

    let archives = vault.engine.list_archives(repo.id).unwrap();
    assert_eq!(archives.len(), 1);
    assert!(!archives[0].is_incremental);
    assert!(archives[0].file_count >= 2);
    assert!(archives[0].filename.ends_with(".tar.xz"));
    assert!(Path::new(&archives[0].file_path).exists());

    // The stored hash set is exactly the mirror's current digest set.
    let expected = hasher::hash_tree(&mirror, DEFAULT_EXCLUSIONS, &CancellationToken::new()).unwrap();
    assert_eq!(vault.store.get_file_hashes(repo.id).unwrap(), expected);

    let stages = drain_stages(&mut events);
    assert!(stages.contains(&TaskStage::Cloning));
    assert!(stages.contains(&TaskStage::Archiving));
    assert_eq!(stages.last(), Some(&TaskStage::Done));
}

// ---------------------------------------------------------------------------
// Scenario: no-op update

#[tokio::test]
async fn noop_update_creates_no_archive() {
    let vault = TestVault::new();
    let src_dir = vault.tmp.path().join("upstream");
    source_repo(&src_dir, &[("a.txt", "one")]);

    let repo = vault.track_local("one", &src_dir);
    vault.engine.enqueue_update(repo.id).await.unwrap();
    vault.run_to_idle().await;

    let before = vault.engine.get_repo(repo.id).unwrap();
    let hashes_before = vault.store.get_file_hashes(repo.id).unwrap();

    let mut events = vault.engine.subscribe();
    vault.engine.enqueue_update(repo.id).await.unwrap();
    vault.run_to_idle().await;

    let after = vault.engine.get_repo(repo.id).unwrap();
    assert_eq!(vault.engine.list_archives(repo.id).unwrap().len(), 1);
    assert_eq!(vault.store.get_file_hashes(repo.id).unwrap(), hashes_before);
    assert_eq!(after.last_updated, before.last_updated);
    assert!(after.last_checked >= before.last_checked);

    let stages = drain_stages(&mut events);
    assert_eq!(stages.last(), Some(&TaskStage::Done));
    assert!(!stages.contains(&TaskStage::Cloning));
}

// ---------------------------------------------------------------------------
// Scenario: incremental update

#[tokio::test]
async fn incremental_update_packs_only_changed_files() {
    let vault = TestVault::new();
    let src_dir = vault.tmp.path().join("upstream");
    let src = source_repo(
        &src_dir,
        &[("a.txt", "one"), ("b.txt", "two"), ("c.txt", "three")],
    );

    let repo = vault.track_local("one", &src_dir);
    vault.engine.enqueue_update(repo.id).await.unwrap();
    vault.run_to_idle().await;

    // Two files change upstream.
    fs::write(src_dir.join("a.txt"), "one, revised").unwrap();
    fs::write(src_dir.join("b.txt"), "two, revised").unwrap();
    commit_all(&src, "revise a and b");

    vault.engine.enqueue_update(repo.id).await.unwrap();
    vault.run_to_idle().await;

    let archives = vault.engine.list_archives(repo.id).unwrap();
    assert_eq!(archives.len(), 2);
    let incremental = &archives[1];
    assert!(incremental.is_incremental);
    assert_eq!(incremental.file_count, 2);

    // Unpacking just the incremental archive yields exactly the two files.
    let dest = vault.tmp.path().join("restored");
    vault
        .engine
        .extract_archive(incremental.id, &dest)
        .await
        .unwrap();
    let restored =
        hasher::hash_tree(&dest, DEFAULT_EXCLUSIONS, &CancellationToken::new()).unwrap();
    let restored_paths: Vec<&String> = restored.keys().collect();
    assert_eq!(restored_paths, vec!["a.txt", "b.txt"]);
    assert_eq!(
        fs::read_to_string(dest.join("a.txt")).unwrap(),
        "one, revised"
    );
}

// ---------------------------------------------------------------------------
// Scenario: upstream deleted

#[tokio::test]
async fn reconcile_marks_missing_upstream_deleted() {
    let mut server = mockito::Server::new_async().await;
    let _gone = server
        .mock("GET", "/repos/remote/gone")
        .with_status(404)
        .create_async()
        .await;
    let _alive = server
        .mock("GET", "/repos/remote/alive")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"description":"still here","archived":false,"private":false}"#)
        .create_async()
        .await;

    let vault = TestVault::with_forge_url(Some(&server.url()));
    let gone = vault
        .store
        .insert_repo("remote", "gone", "https://github.com/remote/gone")
        .unwrap();
    let alive = vault
        .store
        .insert_repo("remote", "alive", "https://github.com/remote/alive")
        .unwrap();
    vault
        .store
        .update_repo_status(gone.id, RepoStatus::Active, None)
        .unwrap();
    vault
        .store
        .insert_archive(
            gone.id,
            &gitvault::types::NewArchive {
                filename: "old.tar.xz".to_string(),
                file_path: "/nowhere/old.tar.xz".to_string(),
                size_bytes: 5,
                file_count: 1,
                is_incremental: false,
            },
        )
        .unwrap();

    vault.engine.enqueue_reconcile().await.unwrap();
    vault.run_to_idle().await;

    let gone = vault.engine.get_repo(gone.id).unwrap();
    assert_eq!(gone.status, RepoStatus::Deleted);
    assert!(gone.last_checked.is_some());
    // Captured content survives upstream disappearance.
    assert_eq!(vault.engine.list_archives(gone.id).unwrap().len(), 1);

    let alive = vault.engine.get_repo(alive.id).unwrap();
    assert_eq!(alive.status, RepoStatus::Active);
    assert_eq!(alive.description.as_deref(), Some("still here"));
}

// ---------------------------------------------------------------------------
// Scenario: dedup

#[tokio::test]
async fn second_enqueue_for_same_repo_refused() {
    let vault = TestVault::new();
    let src_dir = vault.tmp.path().join("upstream");
    source_repo(&src_dir, &[("a.txt", "one")]);
    let repo = vault.track_local("one", &src_dir);

    vault.engine.enqueue_update(repo.id).await.unwrap();
    let second = vault.engine.enqueue_update(repo.id).await;
    assert!(matches!(second, Err(Error::AlreadyInProgress)));

    vault.run_to_idle().await;
    // Exactly one task ran: one archive.
    assert_eq!(vault.engine.list_archives(repo.id).unwrap().len(), 1);

    // After completion the identity key is free again.
    vault.engine.enqueue_update(repo.id).await.unwrap();
    vault.run_to_idle().await;
}

// ---------------------------------------------------------------------------
// Scenario: stop-all

#[tokio::test]
async fn stop_all_cancels_queued_tasks() {
    let vault = TestVault::new();
    let mut sources = Vec::new();
    for name in ["one", "two", "three"] {
        let dir = vault.tmp.path().join(format!("upstream-{name}"));
        source_repo(&dir, &[("a.txt", name)]);
        sources.push(vault.track_local(name, &dir));
    }

    let mut events = vault.engine.subscribe();
    for repo in &sources {
        vault.engine.enqueue_update(repo.id).await.unwrap();
    }
    vault.engine.stop_all().await.unwrap();
    vault.run_to_idle().await;

    let stages = drain_stages(&mut events);
    let terminal: Vec<&TaskStage> = stages
        .iter()
        .filter(|s| matches!(s, TaskStage::Done | TaskStage::Cancelled | TaskStage::Failed))
        .collect();
    assert_eq!(terminal.len(), 3, "each task must reach a terminal stage");
    assert!(!stages.contains(&TaskStage::Failed));

    for repo in &sources {
        let fetched = vault.engine.get_repo(repo.id).unwrap();
        // Cancellation is not an error state.
        assert_ne!(fetched.status, RepoStatus::Error);

        // A cancelled clone leaves no partial mirror: any directory on
        // disk is a complete clone, and snapshots exist only for repos
        // that finished.
        let mirror = vault.data_dir().join(fetched.mirror_dir_name());
        let archives = vault.engine.list_archives(repo.id).unwrap();
        if mirror.exists() {
            assert!(mirror.join(".git").exists(), "partial mirror left behind");
        } else {
            assert!(archives.is_empty());
        }
    }
}

// ---------------------------------------------------------------------------
// Boundary behaviors

#[tokio::test]
async fn equivalent_urls_yield_one_repository() {
    let vault = TestVault::new();

    vault
        .engine
        .add_repo("https://github.com/OctoCat/Hello-World.git")
        .unwrap();
    let err = vault
        .engine
        .add_repo("http://www.github.com/octocat/hello-world/")
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRepo));

    let repos = vault.engine.list_repos(None).unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].url, "https://github.com/octocat/hello-world");
    assert_eq!(repos[0].status, RepoStatus::Pending);
}

#[tokio::test]
async fn add_repo_rejects_invalid_urls() {
    let vault = TestVault::new();
    assert!(matches!(
        vault.engine.add_repo("https://gitlab.com/a/b"),
        Err(Error::InvalidUrl(_))
    ));
    assert!(matches!(
        vault.engine.add_repo("github.com/only-owner"),
        Err(Error::InvalidUrl(_))
    ));
}

#[tokio::test]
async fn delete_repo_removes_rows_and_files() {
    let vault = TestVault::new();
    let src_dir = vault.tmp.path().join("upstream");
    source_repo(&src_dir, &[("a.txt", "one")]);
    let repo = vault.track_local("one", &src_dir);

    vault.engine.enqueue_update(repo.id).await.unwrap();
    vault.run_to_idle().await;

    let mirror = vault.data_dir().join("local_one");
    let archives = vault.engine.list_archives(repo.id).unwrap();
    assert!(mirror.exists());
    assert!(Path::new(&archives[0].file_path).exists());

    vault.engine.delete_repo(repo.id, true).await.unwrap();

    assert!(matches!(vault.engine.get_repo(repo.id), Err(Error::NotFound)));
    assert!(!mirror.exists());
    assert!(!Path::new(&archives[0].file_path).exists());
}

#[tokio::test]
async fn delete_archive_tolerates_missing_file() {
    let vault = TestVault::new();
    let repo = vault
        .store
        .insert_repo("remote", "one", "https://github.com/remote/one")
        .unwrap();
    let archive = vault
        .store
        .insert_archive(
            repo.id,
            &gitvault::types::NewArchive {
                filename: "ghost.tar.xz".to_string(),
                file_path: vault
                    .data_dir()
                    .join("ghost.tar.xz")
                    .to_string_lossy()
                    .to_string(),
                size_bytes: 1,
                file_count: 1,
                is_incremental: false,
            },
        )
        .unwrap();

    vault.engine.delete_archive(archive.id).await.unwrap();
    assert!(vault.engine.list_archives(repo.id).unwrap().is_empty());
}

#[tokio::test]
async fn import_legacy_via_engine() {
    let vault = TestVault::new();
    let blob = r#"{
        "https://github.com/owner/repo": {
            "local_path": "data/owner_repo",
            "last_cloned": "2025-01-01 12:00:00",
            "status": "active",
            "description": "imported"
        }
    }"#;

    let report = vault.engine.import_legacy(blob).unwrap();
    assert_eq!(report.imported_count, 1);

    let repos = vault.engine.list_repos(Some(RepoStatus::Active)).unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].description.as_deref(), Some("imported"));
}

// ---------------------------------------------------------------------------
// Failure path

#[tokio::test]
async fn failed_clone_sets_error_status() {
    let vault = TestVault::new();
    let bogus = vault.tmp.path().join("does-not-exist");
    let repo = vault.track_local("broken", &bogus);

    let mut events = vault.engine.subscribe();
    vault.engine.enqueue_update(repo.id).await.unwrap();
    vault.run_to_idle().await;

    let fetched = vault.engine.get_repo(repo.id).unwrap();
    assert_eq!(fetched.status, RepoStatus::Error);
    assert!(fetched.error_message.is_some());
    assert!(vault.engine.list_archives(repo.id).unwrap().is_empty());

    let mut saw_error = false;
    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::TaskError { repo_id, .. } => {
                assert_eq!(repo_id, Some(repo.id));
                saw_error = true;
            }
            Event::TaskProgress { stage, .. } if stage == TaskStage::Failed => {
                saw_failed = true;
            }
            _ => {}
        }
    }
    assert!(saw_error && saw_failed);
}

// ---------------------------------------------------------------------------
// Hash-set property after capture

#[tokio::test]
async fn file_hashes_match_mirror_after_each_capture() {
    let vault = TestVault::new();
    let src_dir = vault.tmp.path().join("upstream");
    let src = source_repo(&src_dir, &[("a.txt", "one"), ("b.txt", "two")]);

    let repo = vault.track_local("one", &src_dir);
    vault.engine.enqueue_update(repo.id).await.unwrap();
    vault.run_to_idle().await;

    fs::write(src_dir.join("a.txt"), "changed").unwrap();
    fs::write(src_dir.join("new.txt"), "brand new").unwrap();
    commit_all(&src, "more changes");

    vault.engine.enqueue_update(repo.id).await.unwrap();
    vault.run_to_idle().await;

    let mirror = vault.data_dir().join("local_one");
    let expected: BTreeMap<String, String> =
        hasher::hash_tree(&mirror, DEFAULT_EXCLUSIONS, &CancellationToken::new()).unwrap();
    assert_eq!(vault.store.get_file_hashes(repo.id).unwrap(), expected);
    assert!(expected.contains_key("new.txt"));
}
