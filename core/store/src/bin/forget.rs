/// Forget Binary - Erases everything stored for one user
///
/// Usage:
///   forget --user-id <id> [--db-path <path>] [--dry-run]
///
/// Options:
///   --db-path: Path to SQLite database (defaults to DB_PATH, then ~/.user-memory/memory.db)
///   --dry-run: Report what would be removed without deleting anything

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use user_memory_schemas::UserId;
use user_memory_store::{config::default_db_path, init_tracing, MemoryLimits, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "forget")]
#[command(about = "Erase a user's memory, entries and conversation contexts")]
struct Args {
    /// User id to erase
    #[arg(long, short)]
    user_id: String,

    /// Path to SQLite database file
    #[arg(long, short)]
    db_path: Option<PathBuf>,

    /// Only report what would be removed
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let db_path = args
        .db_path
        .or_else(|| std::env::var("DB_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(default_db_path);
    info!("Database: {}", db_path.display());

    let store = MemoryStore::open(&db_path, MemoryLimits::from_env()?)?;
    let user_id = UserId(args.user_id);

    if !store.user_exists(&user_id)? {
        warn!("User {} not found - nothing to erase", user_id);
        return Ok(());
    }

    if args.dry_run {
        let entries = store.count_memory_entries(&user_id)?;
        let contexts = store.list_contexts(&user_id)?.len();
        info!(
            "Dry run: would erase user {} ({} entries, {} contexts)",
            user_id, entries, contexts
        );
        return Ok(());
    }

    let erasure = store.erase_user(&user_id)?;
    info!(
        "Erased user {}: memory={} entries={} contexts={}",
        user_id, erasure.memory, erasure.entries, erasure.contexts
    );

    Ok(())
}
