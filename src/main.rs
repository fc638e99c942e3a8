use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use gitvault::config::{self, AppSettings};
use gitvault::engine::Engine;
use gitvault::events::Event;
use gitvault::types::RepoStatus;

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "gitvault")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

#[derive(Parser)]
#[command(name = "gitvault")]
#[command(about = "Archive remote Git repositories", long_about = None)]
struct Cli {
    /// Data directory for the database, mirrors and snapshots
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track a repository by URL
    Add { url: String },

    /// List tracked repositories
    List {
        /// Filter by status (pending, active, archived, deleted, error)
        #[arg(long)]
        status: Option<String>,
    },

    /// Stop tracking a repository
    Remove {
        id: i64,
        /// Keep the mirror and snapshot files on disk
        #[arg(long)]
        keep_files: bool,
    },

    /// Mirror and snapshot one repository
    Update { id: i64 },

    /// Mirror and snapshot every eligible repository
    UpdateAll {
        /// Include repositories whose upstream is archived or deleted
        #[arg(long)]
        include_archived: bool,
    },

    /// Refresh upstream lifecycle state via the forge API
    Reconcile,

    /// List snapshots of a repository
    Archives { repo_id: i64 },

    /// Extract a snapshot into a directory
    Extract { archive_id: i64, destination: PathBuf },

    /// Delete a snapshot and its file
    DeleteArchive { archive_id: i64 },

    /// Import the legacy JSON tracking file
    Import { path: PathBuf },

    /// Show the forge API rate limit
    RateLimit,

    /// Manage the forge auth token
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Read or change engine settings
    Setting {
        #[command(subcommand)]
        command: SettingCommands,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Store a token in the platform secret store
    Set { token: String },
    /// Remove the stored token
    Erase,
}

#[derive(Subcommand)]
enum SettingCommands {
    /// Print all settings
    Show,
    /// Set one allowlisted key
    Set { key: String, value: String },
}

fn print_event(event: &Event) {
    match event {
        Event::TaskProgress {
            repo_url,
            stage,
            fraction,
            message,
            ..
        } => {
            let percent = fraction
                .map(|f| format!(" {:3.0}%", f * 100.0))
                .unwrap_or_default();
            let detail = message.as_deref().unwrap_or("");
            println!("[{stage}]{percent} {repo_url} {detail}");
        }
        Event::RepoUpdated(repo) => {
            println!("[{}] {}/{}", repo.status, repo.owner, repo.name);
        }
        Event::TaskError { kind, message, .. } => {
            eprintln!("error ({kind}): {message}");
        }
    }
}

/// Prints bus events until the queue drains.
async fn watch_until_idle(engine: &Engine, mut events: mpsc::Receiver<Event>) {
    loop {
        match tokio::time::timeout(Duration::from_millis(300), events.recv()).await {
            Ok(Some(event)) => print_event(&event),
            Ok(None) => break,
            Err(_) => {
                let snapshot = engine.queue_snapshot();
                if snapshot.active == 0 && snapshot.queued == 0 {
                    break;
                }
            }
        }
    }
}

fn print_repo(repo: &gitvault::types::Repository) {
    let checked = repo
        .last_checked
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "{:>4}  {:<9} {:<40} checked {}",
        repo.id,
        repo.status.to_string(),
        format!("{}/{}", repo.owner, repo.name),
        checked
    );
    if let Some(message) = &repo.error_message {
        println!("      ^ {message}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gitvault=info".parse()?))
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let engine = Engine::open(&data_dir).await?;

    match cli.command {
        Commands::Add { url } => {
            let repo = engine.add_repo(&url)?;
            println!("Tracking {}/{} (id {})", repo.owner, repo.name, repo.id);
        }

        Commands::List { status } => {
            let filter = match status.as_deref() {
                Some(s) => match RepoStatus::parse(s) {
                    Some(status) => Some(status),
                    None => bail!("unknown status '{s}'"),
                },
                None => None,
            };
            let repos = engine.list_repos(filter)?;
            if repos.is_empty() {
                println!("No repositories tracked.");
            }
            for repo in &repos {
                print_repo(repo);
            }
        }

        Commands::Remove { id, keep_files } => {
            engine.delete_repo(id, !keep_files).await?;
            println!("Removed repository {id}");
        }

        Commands::Update { id } => {
            let events = engine.subscribe();
            engine.enqueue_update(id).await?;
            watch_until_idle(&engine, events).await;
        }

        Commands::UpdateAll { include_archived } => {
            let events = engine.subscribe();
            engine.enqueue_update_all(include_archived).await?;
            watch_until_idle(&engine, events).await;
        }

        Commands::Reconcile => {
            let events = engine.subscribe();
            engine.enqueue_reconcile().await?;
            watch_until_idle(&engine, events).await;
        }

        Commands::Archives { repo_id } => {
            let archives = engine.list_archives(repo_id)?;
            if archives.is_empty() {
                println!("No snapshots yet.");
            }
            for archive in &archives {
                let kind = if archive.is_incremental { "incr" } else { "full" };
                println!(
                    "{:>4}  {}  {:>10} bytes  {:>5} files  {}",
                    archive.id, kind, archive.size_bytes, archive.file_count, archive.filename
                );
            }
        }

        Commands::Extract {
            archive_id,
            destination,
        } => {
            engine.extract_archive(archive_id, &destination).await?;
            println!("Extracted archive {archive_id} to {}", destination.display());
        }

        Commands::DeleteArchive { archive_id } => {
            engine.delete_archive(archive_id).await?;
            println!("Deleted archive {archive_id}");
        }

        Commands::Import { path } => {
            let blob = std::fs::read_to_string(&path)?;
            let report = engine.import_legacy(&blob)?;
            println!(
                "Imported {} repositories ({} skipped, {} archives found)",
                report.imported_count, report.skipped_count, report.archives_found
            );
            for error in &report.errors {
                eprintln!("  {error}");
            }
        }

        Commands::RateLimit => {
            let rl = engine.get_rate_limit().await?;
            println!(
                "{} of {} requests remaining, resets at epoch {}",
                rl.remaining, rl.limit, rl.reset_epoch
            );
        }

        Commands::Token { command } => match command {
            TokenCommands::Set { token } => {
                engine.set_forge_token(Some(token)).await?;
                println!("Token stored.");
            }
            TokenCommands::Erase => {
                engine.set_forge_token(None).await?;
                println!("Token erased.");
            }
        },

        Commands::Setting { command } => match command {
            SettingCommands::Show => {
                let settings = engine.get_settings()?;
                println!("{}", serde_json::to_string_pretty(&settings)?);
            }
            SettingCommands::Set { key, value } => {
                if !config::is_allowed_key(&key) {
                    bail!(
                        "unknown setting '{key}' (expected one of: {})",
                        config::SETTING_KEYS.join(", ")
                    );
                }
                let mut settings = engine.get_settings()?;
                apply_setting(&mut settings, &key, &value)?;
                engine.save_settings(&settings, None).await?;
                println!("Saved {key}.");
            }
        },
    }

    Ok(())
}

fn apply_setting(settings: &mut AppSettings, key: &str, value: &str) -> anyhow::Result<()> {
    match key {
        config::SETTING_DATA_DIR => settings.data_dir = value.to_string(),
        config::SETTING_MIRROR_DEPTH => settings.mirror_depth = value.parse()?,
        config::SETTING_MAX_CONCURRENT => settings.max_concurrent_tasks = value.parse()?,
        config::SETTING_AUTO_POLL => {
            settings.auto_poll_minutes = if value.is_empty() || value == "off" {
                None
            } else {
                Some(value.parse()?)
            };
        }
        _ => bail!("unknown setting '{key}'"),
    }
    Ok(())
}
