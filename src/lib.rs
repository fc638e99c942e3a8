//! # Gitvault
//!
//! An archival engine for remote Git repositories: it keeps a local
//! mirror of each tracked repository, writes timestamped `.tar.xz`
//! snapshots whenever the upstream changes (full first, content-diffed
//! incrementals after), and tracks upstream lifecycle so captured content
//! survives upstream deletion.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use gitvault::engine::Engine;
//!
//! let engine = Engine::open(std::path::Path::new("./data")).await?;
//! let repo = engine.add_repo("https://github.com/octocat/hello-world")?;
//! engine.enqueue_update(repo.id).await?;
//!
//! let mut events = engine.subscribe();
//! while let Some(event) = events.recv().await {
//!     // progress, completion and lifecycle events
//! }
//! ```

pub mod canon;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod forge;
pub mod git;
pub mod hasher;
pub mod import;
pub mod reconcile;
pub mod secrets;
pub mod snapshot;
pub mod store;
pub mod tasks;
pub mod types;
pub mod worker;
