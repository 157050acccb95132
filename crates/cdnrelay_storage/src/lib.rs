pub mod memory;
pub mod postgres;
pub mod repository;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use cdnrelay_transfer::{CustomFileRecord, DeletionRecord};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repository::SqliteStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `sqlite://path`, a bare file path, `sqlite::memory:`, `postgres://...`
    /// or `memory`.
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://storage/cdnrelay.sqlite".to_string()
}

/// Persistence for scheduled deletions. Records are keyed by file name and
/// `save` replaces any earlier expiry for the same name.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn save(&self, record: &DeletionRecord) -> Result<()>;

    async fn get(&self, file_name: &str) -> Result<Option<DeletionRecord>>;

    async fn delete(&self, file_name: &str) -> Result<bool>;

    /// Records with `delete_at_ms <= before_ms`, soonest first.
    async fn find_expired(&self, before_ms: i64) -> Result<Vec<DeletionRecord>>;

    fn backend(&self) -> &'static str;

    fn is_connected(&self) -> bool {
        true
    }

    /// `None` when the backend cannot persist custom filename mappings.
    fn custom_files(&self) -> Option<&dyn CustomFileStore> {
        None
    }

    async fn close(&self) {}
}

#[async_trait]
pub trait CustomFileStore: Send + Sync {
    async fn save_custom_file(&self, record: &CustomFileRecord) -> Result<()>;

    async fn get_custom_file(&self, custom_file_name: &str) -> Result<Option<CustomFileRecord>>;

    async fn delete_custom_file(&self, custom_file_name: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Memory,
    Sqlite,
    Postgres,
}

impl Backend {
    fn from_url(url: &str) -> Result<Self> {
        if url.eq_ignore_ascii_case("memory") {
            return Ok(Self::Memory);
        }
        match url.split_once("://") {
            Some((scheme, _)) if scheme.eq_ignore_ascii_case("sqlite") => Ok(Self::Sqlite),
            Some((scheme, _))
                if scheme.eq_ignore_ascii_case("postgres")
                    || scheme.eq_ignore_ascii_case("postgresql") =>
            {
                Ok(Self::Postgres)
            }
            Some((scheme, _)) => {
                bail!("unsupported database scheme `{scheme}`; use sqlite, postgres or memory")
            }
            None => Ok(Self::Sqlite),
        }
    }
}

pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn ScheduleStore>> {
    let url = config.database_url.trim();
    let store: Arc<dyn ScheduleStore> = match Backend::from_url(url)? {
        Backend::Memory => Arc::new(MemoryStore::new()),
        Backend::Sqlite => Arc::new(SqliteStore::connect(url).await?),
        Backend::Postgres => Arc::new(PgStore::connect(url).await?),
    };
    Ok(store)
}
