use anyhow::Context;
use chrono::NaiveDateTime;
use clap::{CommandFactory, Parser};
use ipasnd::cli::{Cli, Command};
use ipasnd::config::Config;
use ipasnd::http::{build_router, AppState};
use ipasnd::manager::LookupManager;
use ipasnd::router::Router;
use ipasnd::store::{RedisCacheStore, RedisStorageStore};
use ipasnd::worker::LookupWorker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_cancel.cancel();
        }
    });

    match cli.command {
        Command::Serve => run_serve(&config).await,
        Command::Worker { source, first, last } => run_worker(&config, source, first, last, cancel).await,
        Command::Manager => run_manager(&config, cancel).await,
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

async fn run_serve(config: &Config) -> anyhow::Result<()> {
    let cache = Arc::new(RedisCacheStore::connect(&config.cache_redis_url).await?);
    let storage = Arc::new(RedisStorageStore::connect(&config.storage_redis_url).await?);
    let router = Router::new(cache, storage);
    let state = Arc::new(AppState {
        router,
        sources: config.sources.clone(),
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "ipasnd http frontend listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_worker(
    config: &Config,
    source: String,
    first: String,
    last: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    NaiveDateTime::parse_from_str(&first, "%Y-%m-%dT%H:%M:%S").context("parsing --first")?;
    NaiveDateTime::parse_from_str(&last, "%Y-%m-%dT%H:%M:%S").context("parsing --last")?;

    let cache = Arc::new(RedisCacheStore::connect(&config.cache_redis_url).await?);
    let storage = Arc::new(RedisStorageStore::connect(&config.storage_redis_url).await?);

    let mut worker = LookupWorker::new(source, first, last, cache, storage);
    worker.start().await?;
    worker.serve(cancel).await
}

async fn run_manager(config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let cache = Arc::new(RedisCacheStore::connect(&config.cache_redis_url).await?);
    let storage = Arc::new(RedisStorageStore::connect(&config.storage_redis_url).await?);

    let mut manager = LookupManager::new(config, cache, storage);
    manager.bootstrap(chrono::Utc::now().date_naive()).await?;
    manager
        .run(std::time::Duration::from_secs(config.tick_interval_secs), cancel)
        .await;
    Ok(())
}
