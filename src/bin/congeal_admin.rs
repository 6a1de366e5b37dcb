use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use congeal::backup::{self, Envelope, SnapshotStore};
use congeal::config::{self, Config};
use congeal::db::{self, Pool};
use congeal::mail::MailCache;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Offline snapshot, restore and reset for a Congeal data directory"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a sample configuration file
    ConfigExample,
    /// List stored snapshots, newest first
    List,
    /// Write a new snapshot
    Snapshot {
        /// Leave mailboxes and messages out
        #[arg(long)]
        no_email: bool,
    },
    /// Replace all data with a stored snapshot name or a backup file path
    Restore {
        source: String,
        #[arg(long)]
        yes: bool,
    },
    /// Empty the content tables, keeping users and settings
    ResetData {
        #[arg(long)]
        yes: bool,
    },
    /// Delete everything, including users; requires an admin password
    FactoryReset {
        #[arg(long)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ConfigExample = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/congeal.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let result = run(&cfg, &pool, args.command).await;
    pool.close().await;
    result
}

fn confirm(yes: bool, what: &str) -> Result<()> {
    if !yes {
        bail!("{} is destructive; pass --yes to proceed", what);
    }
    Ok(())
}

async fn clear_cache(cfg: &Config) -> Result<()> {
    let cache = MailCache::new(cfg.cache_dir(), std::time::Duration::ZERO);
    let removed = cache.clear_all().await?;
    info!(removed, "mail cache cleared");
    Ok(())
}

async fn run(cfg: &Config, pool: &Pool, command: Command) -> Result<()> {
    let store = SnapshotStore::new(cfg.snapshots_dir(), cfg.backup.max_snapshots);
    match command {
        Command::ConfigExample => {}
        Command::List => {
            for snap in store.list().await? {
                println!("{}\t{}\t{}", snap.name, snap.size, snap.created_at.to_rfc3339());
            }
        }
        Command::Snapshot { no_email } => {
            let envelope = backup::collect(pool, cfg.backup.include_email && !no_email).await?;
            let snap = store.create(&envelope).await?;
            println!("{}", snap.name);
        }
        Command::Restore { source, yes } => {
            confirm(yes, "restore")?;
            let envelope = if source.starts_with("snapshot-") {
                store.read(&source).await?
            } else {
                let raw = tokio::fs::read(&source)
                    .await
                    .with_context(|| format!("failed to read {}", source))?;
                Envelope::from_slice(&raw)?
            };
            let summary = backup::restore(pool, &envelope).await?;
            clear_cache(cfg).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::ResetData { yes } => {
            confirm(yes, "reset-data")?;
            let report = backup::reset_data(pool).await?;
            clear_cache(cfg).await?;
            for table in report {
                println!("{}\t{}", table.table, table.remaining);
            }
        }
        Command::FactoryReset { password } => {
            backup::factory_reset(pool, &password).await?;
            clear_cache(cfg).await?;
            println!("factory reset complete");
        }
    }
    Ok(())
}
