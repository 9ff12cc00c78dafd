use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use user_memory_store::{
    create_router, init_tracing, ApiKeyConfig, AppState, IngestionWorker, MemoryStore,
    MessageIngestor, StoreConfig,
};

#[derive(Parser, Debug)]
#[command(name = "user-memory-store", about = "Persistent user memory service")]
struct Args {
    /// Database path (overrides DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Listen address (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    info!("User Memory Store v{}", env!("CARGO_PKG_VERSION"));

    let mut config = StoreConfig::from_env()?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    // Create directory if it doesn't exist
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let store = Arc::new(MemoryStore::open(&config.db_path, config.limits.clone())?);
    info!("Database initialized at: {}", config.db_path.display());

    let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
    let ingestor = Arc::new(MessageIngestor::new(store.clone()));
    tokio::spawn(IngestionWorker::new(ingestor, ingest_rx).run());

    let auth = ApiKeyConfig::new(config.api_key.clone());
    if !auth.is_enabled() {
        warn!("MEMORY_API_KEY not set - bearer authentication disabled");
    }

    let app = create_router(AppState {
        store,
        ingest_tx,
        auth,
    });

    info!("Starting HTTP server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
