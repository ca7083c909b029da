use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use coomer_dl::catalog::MediaStatus;
use coomer_dl::utils::fs::format_file_size;
use coomer_dl::{Config, DownloadEngine, ProfileKey};

#[derive(Parser)]
#[command(name = "coomer-dl", version, about = "Concurrent media harvester for coomer.st profiles")]
struct Cli {
    /// Path to settings.json
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a profile and ingest its full catalog
    Add {
        /// Profile page URL, e.g. https://coomer.st/onlyfans/user/name
        url: String,
    },
    /// List known profiles
    List,
    /// Fetch new posts for a profile
    Refresh {
        /// "service:username" or a profile URL
        profile: String,
    },
    /// Download everything missing for a profile
    Download {
        /// "service:username" or a profile URL
        profile: String,
        /// Override the per-profile parallelism ceiling
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// SHA-verify finished files before skipping them
        #[arg(long)]
        strict: bool,
    },
    /// Adopt an already-downloaded directory for a profile
    Import {
        /// Directory holding the existing files
        dir: PathBuf,
        /// Profile page URL
        url: String,
    },
    /// Move a profile's files to another base directory
    Move {
        /// "service:username" or a profile URL
        profile: String,
        /// New base directory (files land under <base>/<service>/<username>)
        new_base: PathBuf,
    },
    /// Delete a profile's catalog and downloaded files
    Delete {
        /// "service:username" or a profile URL
        profile: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

fn parse_profile(input: &str) -> Result<ProfileKey> {
    if let Some(key) = ProfileKey::from_url(input) {
        return Ok(key);
    }
    if let Some(key) = ProfileKey::parse(input) {
        return Ok(key);
    }
    bail!("not a profile: {} (expected service:username or a profile URL)", input);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_or_default(cli.config.as_ref())?;

    match cli.command {
        Command::Add { url } => {
            let engine = DownloadEngine::new(config)?;
            let manager = engine.profile_manager()?;
            let (key, added) = manager.add(&url).await?;
            println!("{}: {} media registered", key, added);
        }

        Command::List => {
            let engine = DownloadEngine::new(config)?;
            let manager = engine.profile_manager()?;
            let summaries = manager.list().await?;
            if summaries.is_empty() {
                println!("no profiles yet; start with: coomer-dl add <url>");
                return Ok(());
            }
            for summary in summaries {
                let (videos, images) =
                    coomer_dl::profile::compute_folder_sizes(&summary.download_path);
                println!(
                    "{:<40} {:>5} media  {:>5} done  v:{:>10} p:{:>10}  updated {}",
                    summary.key.to_string(),
                    summary.media_count,
                    summary.completed,
                    format_file_size(videos),
                    format_file_size(images),
                    summary.last_update.format("%Y-%m-%d %H:%M")
                );
            }
        }

        Command::Refresh { profile } => {
            let key = parse_profile(&profile)?;
            let engine = DownloadEngine::new(config)?;
            let manager = engine.profile_manager()?;
            let report = manager.refresh(&key).await?;
            println!(
                "{}: {} new media ({} total){}",
                key,
                report.new_media,
                report.total_media,
                if report.partial { " [partial]" } else { "" }
            );
        }

        Command::Download {
            profile,
            max_concurrent,
            strict,
        } => {
            let key = parse_profile(&profile)?;
            if let Some(n) = max_concurrent {
                config.max_concurrent = n;
            }
            config.strict_restore = strict;

            let engine = DownloadEngine::new(config)?;
            let session = engine.open_profile(key.clone()).await?;

            let summary = session.restore_summary();
            println!(
                "{}: {} media ({} already done, {} resumable)",
                key, summary.total, summary.completed, summary.paused
            );

            let queued = session.download_all().await;
            println!("queued {}", queued);
            session.wait_idle().await;

            let snapshot = session.store().snapshot().await;
            let failed = snapshot.count_status(MediaStatus::Failed);
            let completed = snapshot.count_status(MediaStatus::Completed);
            println!("done: {} completed, {} failed", completed, failed);
            if failed > 0 {
                for media in snapshot
                    .medias
                    .iter()
                    .filter(|m| m.status == MediaStatus::Failed)
                {
                    println!("  {}: {}", media.name, media.error);
                }
            }

            session.shutdown().await?;
        }

        Command::Import { dir, url } => {
            let engine = DownloadEngine::new(config.clone())?;
            let mut manager = engine.profile_manager()?;
            let key = manager.import_existing(&dir, &url).await?;

            config.profile_dirs = manager
                .profile_dirs()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            config.save(std::path::Path::new(
                cli.config
                    .as_deref()
                    .unwrap_or(coomer_dl::constants::storage::SETTINGS_FILE),
            ))?;
            println!("{}: imported from {}", key, dir.display());
        }

        Command::Move { profile, new_base } => {
            let key = parse_profile(&profile)?;
            let engine = DownloadEngine::new(config.clone())?;
            let mut manager = engine.profile_manager()?;
            manager.move_profile(&key, &new_base).await?;

            config.profile_dirs = manager
                .profile_dirs()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            config.save(std::path::Path::new(
                cli.config
                    .as_deref()
                    .unwrap_or(coomer_dl::constants::storage::SETTINGS_FILE),
            ))?;
            println!("{}: moved under {}", key, new_base.display());
        }

        Command::Delete { profile, yes } => {
            let key = parse_profile(&profile)?;
            if !yes {
                bail!("refusing to delete {} without --yes", key);
            }
            let engine = DownloadEngine::new(config.clone())?;
            let mut manager = engine.profile_manager()?;
            manager.delete(&key).await?;

            config.profile_dirs = manager
                .profile_dirs()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            config.save(std::path::Path::new(
                cli.config
                    .as_deref()
                    .unwrap_or(coomer_dl::constants::storage::SETTINGS_FILE),
            ))?;
            println!("{}: deleted", key);
        }
    }

    Ok(())
}
