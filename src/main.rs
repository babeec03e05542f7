#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod cache;
mod config;
mod error;
mod events;
mod global;
mod memory;
mod paths;
mod projects;
mod registry;
mod search;
mod service;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use config::ConfigManager;
use paths::DataRoot;
use search::semantic::EmbedderPool;
use service::GlobalIndexService;

#[derive(Parser)]
#[command(name = "leindex")]
#[command(about = "Multi-project source-code indexer and search service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level filter (e.g. debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Config file path (default ~/.leindex/mcp_config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data root (default ~/.leindex_data)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the index service until interrupted
    Serve {
        /// Skip loading the embedding model (semantic search degrades)
        #[arg(long)]
        no_semantic: bool,
    },

    /// Validate the configuration file and exit
    Check,

    /// Print registry status as JSON
    Status,
}

fn init_tracing(log_level: &str, logs_dir: &std::path::Path) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    std::fs::create_dir_all(logs_dir).ok();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join("leindex.log"))
        .ok();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    match file {
        Some(file) => {
            // Ops log entries go to disk as structured JSON.
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::sync::Mutex::new(file));
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(json_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(paths::default_config_path);
    let data_root = DataRoot::new(cli.data_dir.clone().unwrap_or_else(DataRoot::default_root));
    let log_level = cli.log_level.clone();

    match cli.command {
        Commands::Serve { no_semantic } => serve(log_level, config_path, data_root, no_semantic),
        Commands::Check => check(config_path),
        Commands::Status => status(data_root),
    }
}

fn serve(
    log_level: String,
    config_path: PathBuf,
    data_root: DataRoot,
    no_semantic: bool,
) -> anyhow::Result<()> {
    init_tracing(&log_level, &data_root.logs_dir());

    // Config file must be private; failing to enforce that is fatal.
    if let Err(e) = paths::enforce_config_perms(&config_path) {
        eprintln!("cannot enforce config permissions: {e}");
        std::process::exit(1);
    }

    let config = Arc::new(ConfigManager::load(&config_path)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let embedder = if no_semantic {
            None
        } else {
            match EmbedderPool::new(1, data_root.models_dir()) {
                Ok(pool) => Some(Arc::new(pool)),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding model unavailable, semantic search degraded");
                    None
                }
            }
        };

        let service = GlobalIndexService::start(config.clone(), data_root, embedder).await?;
        tracing::info!("leindex service running");

        // SIGHUP reloads the config; ctrl-c / SIGTERM stop the service.
        let mut sighup =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    let result = service.reload_config();
                    tracing::info!(status = %result["status"], "SIGHUP config reload");
                }
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
            }
        }

        tracing::info!("shutting down");
        service.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(())
}

fn check(config_path: PathBuf) -> anyhow::Result<()> {
    match ConfigManager::load(&config_path) {
        Ok(mgr) => {
            let config = mgr.current();
            println!(
                "{}",
                serde_json::json!({"status": "success", "config": &*config})
            );
            Ok(())
        }
        Err(e) => {
            println!("{}", e.to_payload());
            std::process::exit(1);
        }
    }
}

fn status(data_root: DataRoot) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let db = data_root.registry_db();
        if !db.exists() {
            println!("{}", serde_json::json!({"status": "success", "projects": []}));
            return Ok(());
        }
        let registry = registry::RegistryStore::open(db.to_str().unwrap()).await?;
        let projects: Vec<_> = registry
            .list_all()
            .await?
            .into_iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "path": r.path,
                    "name": r.name,
                    "indexed_at": r.indexed_at,
                    "file_count": r.file_count,
                })
            })
            .collect();
        let health = registry.health_check().await;
        println!(
            "{}",
            serde_json::json!({"status": "success", "projects": projects, "health": health})
        );
        Ok::<_, anyhow::Error>(())
    })
}
