pub mod aggregate;
pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod extractor;
pub mod heuristic;
pub mod locks;
pub mod worker;

pub use api::{create_router, error_response, AppState};
pub use auth::{ApiKeyConfig, AuthUser, USER_ID_HEADER};
pub use config::{MemoryLimits, StoreConfig};
pub use database::{Erasure, ExtractionOutcome, MemoryStore, RecordedEntry};
pub use error::{MemoryError, Result};
pub use extractor::{IngestReport, MessageIngestor};
pub use heuristic::{CandidateFact, FactKind, HeuristicExtractor};
pub use locks::UserLocks;
pub use worker::IngestionWorker;

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
