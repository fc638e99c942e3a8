//! Mirror driver on top of libgit2.
//!
//! Clones and fast-forwards the local mirror of an upstream repository.
//! Mirrors are read-only projections: refs only ever advance by fast
//! forward, never by rewrite or force update.

use std::path::Path;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{ErrorClass, ErrorCode, FetchOptions, RemoteCallbacks, Repository};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Failure modes the worker distinguishes when driving a mirror. Not-found
/// and unauthorized become status transitions rather than errors.
#[derive(Debug)]
pub enum GitError {
    /// Upstream returned 404: the repository is gone (or private to us).
    NotFound,
    /// Upstream refused our credentials.
    Unauthorized,
    /// Aborted through the cancellation signal.
    Cancelled,
    /// The mirror cannot fast-forward onto the remote.
    Diverged,
    Failed(String),
}

impl From<GitError> for Error {
    fn from(err: GitError) -> Self {
        match err {
            GitError::NotFound => Error::Git("repository not found upstream".to_string()),
            GitError::Unauthorized => Error::Git("upstream rejected authentication".to_string()),
            GitError::Cancelled => Error::Cancelled,
            GitError::Diverged => {
                Error::Git("mirror has diverged from upstream and cannot fast-forward".to_string())
            }
            GitError::Failed(msg) => Error::Git(msg),
        }
    }
}

/// Maps a libgit2 failure onto the worker-visible taxonomy.
fn classify(err: &git2::Error, cancel: &CancellationToken) -> GitError {
    if cancel.is_cancelled()
        || err.code() == ErrorCode::User
        || err.class() == ErrorClass::Callback
    {
        return GitError::Cancelled;
    }
    if err.code() == ErrorCode::Auth {
        return GitError::Unauthorized;
    }

    let message = err.message().to_ascii_lowercase();
    if message.contains("404") || message.contains("not found") {
        GitError::NotFound
    } else if message.contains("401") || message.contains("403") || message.contains("auth") {
        GitError::Unauthorized
    } else {
        GitError::Failed(err.message().to_string())
    }
}

fn progress_callbacks<'a>(
    progress: &'a (dyn Fn(f64, &str) + Send + Sync),
    cancel: &'a CancellationToken,
) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.transfer_progress(move |stats| {
        if cancel.is_cancelled() {
            return false;
        }
        let total = stats.total_objects();
        let received = stats.received_objects();
        let fraction = if total > 0 {
            received as f64 / total as f64
        } else {
            0.0
        };
        progress(
            fraction,
            &format!("Receiving objects: {received}/{total}"),
        );
        true
    });
    callbacks
}

/// Clones `url` into `dest`. A positive `depth` produces a shallow mirror;
/// zero fetches full history.
///
/// Progress is reported as `(fraction, message)` from libgit2's transfer
/// callback; the same callback checks the cancellation signal. On any
/// failure (including cancellation) the partial destination is removed.
pub fn clone_mirror(
    url: &str,
    dest: &Path,
    depth: u32,
    progress: &(dyn Fn(f64, &str) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<(), GitError> {
    if dest.join(".git").exists() || dest.join("HEAD").exists() {
        return Err(GitError::Failed(format!(
            "destination '{}' already contains a git repository",
            dest.display()
        )));
    }

    let mut fetch_opts = FetchOptions::new();
    fetch_opts.remote_callbacks(progress_callbacks(progress, cancel));
    if depth > 0 {
        fetch_opts.depth(depth as i32);
    }

    let result = RepoBuilder::new().fetch_options(fetch_opts).clone(url, dest);
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            if dest.exists() {
                let _ = std::fs::remove_dir_all(dest);
            }
            Err(classify(&e, cancel))
        }
    }
}

/// Fetches origin and compares the mirror HEAD to its remote counterpart.
/// Returns `None` when up to date, or the remote OID and HEAD refname to
/// fast-forward onto.
fn fetch_and_compare(
    repo: &Repository,
    cancel: &CancellationToken,
) -> Result<Option<(git2::Oid, String)>, GitError> {
    let noop_progress = |_: f64, _: &str| {};
    let mut fetch_opts = FetchOptions::new();
    fetch_opts.remote_callbacks(progress_callbacks(&noop_progress, cancel));

    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| classify(&e, cancel))?;
    remote
        .fetch(
            &["refs/heads/*:refs/remotes/origin/*"],
            Some(&mut fetch_opts),
            None,
        )
        .map_err(|e| classify(&e, cancel))?;
    remote.disconnect().map_err(|e| classify(&e, cancel))?;

    let head = repo.head().map_err(|e| classify(&e, cancel))?;
    let local_oid = head
        .target()
        .ok_or_else(|| GitError::Failed("HEAD has no target".to_string()))?;
    let branch = head.shorthand().unwrap_or("main").to_string();

    let remote_ref = repo
        .find_reference(&format!("refs/remotes/origin/{branch}"))
        .or_else(|_| repo.find_reference("FETCH_HEAD"))
        .map_err(|e| classify(&e, cancel))?;
    let remote_oid = remote_ref
        .target()
        .ok_or_else(|| GitError::Failed("remote ref has no target".to_string()))?;

    if local_oid == remote_oid {
        Ok(None)
    } else {
        let refname = head
            .name()
            .ok_or_else(|| GitError::Failed("HEAD has no name".to_string()))?
            .to_string();
        Ok(Some((remote_oid, refname)))
    }
}

/// Fetches origin and reports whether fast-forwarding would advance the
/// mirror. Nothing is modified.
pub fn fetch_has_updates(mirror: &Path, cancel: &CancellationToken) -> Result<bool, GitError> {
    let repo = Repository::open(mirror).map_err(|e| classify(&e, cancel))?;
    Ok(fetch_and_compare(&repo, cancel)?.is_some())
}

/// Fetches origin and fast-forwards the mirror. Returns `true` iff any ref
/// advanced. A diverged mirror is surfaced as [`GitError::Diverged`].
pub fn pull_fast_forward(mirror: &Path, cancel: &CancellationToken) -> Result<bool, GitError> {
    let repo = Repository::open(mirror).map_err(|e| classify(&e, cancel))?;

    let (remote_oid, refname) = match fetch_and_compare(&repo, cancel)? {
        Some(pending) => pending,
        None => return Ok(false),
    };

    let annotated = repo
        .find_annotated_commit(remote_oid)
        .map_err(|e| classify(&e, cancel))?;
    let (analysis, _) = repo
        .merge_analysis(&[&annotated])
        .map_err(|e| classify(&e, cancel))?;

    if analysis.is_fast_forward() {
        repo.find_reference(&refname)
            .map_err(|e| classify(&e, cancel))?
            .set_target(remote_oid, &format!("fast-forward to {remote_oid}"))
            .map_err(|e| classify(&e, cancel))?;
        repo.set_head(&refname).map_err(|e| classify(&e, cancel))?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))
            .map_err(|e| classify(&e, cancel))?;
        Ok(true)
    } else if analysis.is_up_to_date() {
        Ok(false)
    } else {
        Err(GitError::Diverged)
    }
}
