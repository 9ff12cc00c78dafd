use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use user_memory_composer::{create_router, Composer, ComposerConfig, ComposerState};
use user_memory_store::{init_tracing, ApiKeyConfig, MemoryStore, StoreConfig};

#[derive(Parser, Debug)]
#[command(name = "user-memory-composer", about = "Memory context assembler")]
struct Args {
    /// Database path (overrides DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Listen address (overrides COMPOSER_BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    info!("User Memory Composer v{}", env!("CARGO_PKG_VERSION"));

    let store_config = StoreConfig::from_env()?;
    let mut config = ComposerConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    let db_path = args.db_path.unwrap_or(store_config.db_path);

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(MemoryStore::open(&db_path, store_config.limits)?);
    info!("Reading memory from: {}", db_path.display());

    let auth = ApiKeyConfig::new(store_config.api_key);
    if !auth.is_enabled() {
        warn!("MEMORY_API_KEY not set - bearer authentication disabled");
    }

    let app = create_router(ComposerState {
        composer: Arc::new(Composer::new(&config)),
        store,
        auth,
    });

    info!("Starting HTTP server on {}", config.bind_addr);
    info!("Context endpoint: http://{}/v1/context", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
