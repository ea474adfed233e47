//! Storage for the feed simulator.
//!
//! [`sqlite::SqliteRepository`] is the durable store with an embedded
//! migration set; [`memory::MemoryRepository`] keeps everything in process.
//! Both implement [`sim_core::Repository`].

pub mod memory;
pub mod seed;
pub mod sqlite;

pub use memory::{MemoryRepository, MemoryState};
pub use seed::{seed_demo, SeedCounts, SeedSpec};
pub use sqlite::{connect, migrate, SqliteRepository, TableCounts};

use sim_core::RepositoryError;
use std::path::Path;

/// Returns the default SQLite URL used for local runs.
pub fn default_sqlite_url() -> &'static str {
    "sqlite://./data/feedsim.db"
}

/// Make sure the directory holding a file-backed database exists.
pub fn ensure_parent_dir(url: &str) -> std::io::Result<()> {
    if url.contains(":memory:") {
        return Ok(());
    }
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .map(|p| p.split('?').next().unwrap_or(p));
    if let Some(parent) = path.and_then(|p| Path::new(p).parent()) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Create the database if needed, apply migrations and return a repository.
pub async fn init_db(url: &str) -> Result<SqliteRepository, RepositoryError> {
    ensure_parent_dir(url).map_err(|e| RepositoryError::Connection(e.to_string()))?;
    SqliteRepository::open(url).await
}
