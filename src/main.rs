use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use congeal::config;
use congeal::db;
use congeal::handlers::{self, AppState};
use congeal::mail::ImapConnector;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/congeal.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let listen: SocketAddr = cfg
        .app
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", cfg.app.listen))?;
    let connector = Arc::new(ImapConnector::new(Duration::from_secs(
        cfg.mail.timeout_seconds,
    )));
    let app = handlers::router(AppState::new(pool.clone(), cfg, connector));

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "serving");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await?;

    pool.close().await;
    Ok(())
}
