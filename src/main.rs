//! Command line interface for operating the listings service. Supports
//! initialization and serving the webhook endpoint alongside the background
//! schedulers.

mod config;
mod dispatch;
mod geo;
mod model;
mod payments;
mod presenter;
mod scheduler;
mod server;
mod storage;
mod update;
mod workflow;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use config::Settings;
use dispatch::Dispatcher;
use payments::HttpGateway;
use presenter::ChatApi;
use storage::Store;
use workflow::Engine;

/// How often idle conversations are checked for eviction.
const EVICT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "okolo",
    author,
    version,
    about = "Location-aware event listings bot",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the store directory at `STORE_ROOT`.
    Init,
    /// Launch the webhook server and background schedulers.
    Serve,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::open(cfg.store_root.clone())?;
    match cli.command {
        Commands::Init => {
            info!(root = %cfg.store_root.display(), "store initialized");
        }
        Commands::Serve => {
            let addr: SocketAddr = cfg.bind_http.as_str().parse()?;
            let presenter = Arc::new(ChatApi::new(cfg.chat_api_url.clone(), cfg.chat_token.clone())?);
            let gateway = Arc::new(HttpGateway::new(
                cfg.pay_api_url.clone(),
                cfg.pay_api_key.clone(),
            )?);
            let engine = Arc::new(Engine::new(
                store.clone(),
                gateway,
                presenter.clone(),
                cfg.push_radius_km,
            ));
            let dispatcher = Arc::new(Dispatcher::new(
                store.clone(),
                engine.clone(),
                presenter.clone(),
                &cfg,
            ));
            tokio::spawn(scheduler::notifier_loop(store.clone(), presenter.clone()));
            tokio::spawn(scheduler::sweep_loop(store.clone(), presenter.clone()));
            let evict_engine = engine.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(EVICT_INTERVAL).await;
                    let dropped = evict_engine.evict_stale(Utc::now()).await;
                    if dropped > 0 {
                        info!(dropped, "stale conversations evicted");
                    }
                }
            });
            info!(%addr, "serving webhook");
            server::serve_http(addr, dispatcher, std::future::pending()).await?;
        }
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("okolo-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str("BIND_HTTP=127.0.0.1:8080\n");
    content.push_str("CHAT_API_URL=https://api.telegram.org\n");
    content.push_str("CHAT_TOKEN=\n");
    content.push_str("PAY_API_URL=https://pay.example\n");
    content.push_str("PAY_API_KEY=\n");
    content.push_str("SEARCH_RADIUS_KM=30\n");
    content.push_str("PUSH_RADIUS_KM=30\n");
    content.push_str("ADMIN_USERS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}
