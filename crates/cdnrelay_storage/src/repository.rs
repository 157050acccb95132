use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cdnrelay_transfer::{CustomFileRecord, DeletionRecord};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::info;

use crate::{CustomFileStore, ScheduleStore};

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct DeletionRow {
    pub(crate) file_name: String,
    pub(crate) delete_at_ms: i64,
}

impl From<DeletionRow> for DeletionRecord {
    fn from(row: DeletionRow) -> Self {
        DeletionRecord {
            file_name: row.file_name,
            delete_at_ms: row.delete_at_ms,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct CustomFileRow {
    pub(crate) custom_file_name: String,
    pub(crate) original_remote_url: String,
    pub(crate) file_extension: String,
}

impl From<CustomFileRow> for CustomFileRecord {
    fn from(row: CustomFileRow) -> Self {
        CustomFileRecord {
            custom_file_name: row.custom_file_name,
            original_remote_url: row.original_remote_url,
            file_extension: row.file_extension,
        }
    }
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let uri = normalize_sqlite_uri(database_url);
        let in_memory = is_memory_uri(&uri);
        if !in_memory {
            ensure_parent_dir(&uri).await?;
        }

        let options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true);

        // An in-memory database lives only as long as its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("cdnrelay sqlite schema ready");
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn save(&self, record: &DeletionRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO file_deletions(file_name, delete_at_ms, created_at, updated_at) VALUES (?, ?, ?, ?) ON CONFLICT(file_name) DO UPDATE SET delete_at_ms = excluded.delete_at_ms, updated_at = excluded.updated_at",
        )
        .bind(&record.file_name)
        .bind(record.delete_at_ms)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert deletion for {}", record.file_name))?;
        Ok(())
    }

    async fn get(&self, file_name: &str) -> Result<Option<DeletionRecord>> {
        let row = sqlx::query_as::<_, DeletionRow>(
            "SELECT file_name, delete_at_ms FROM file_deletions WHERE file_name = ?",
        )
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query deletion {file_name}"))?;
        Ok(row.map(DeletionRecord::from))
    }

    async fn delete(&self, file_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_deletions WHERE file_name = ?")
            .bind(file_name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete deletion record {file_name}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_expired(&self, before_ms: i64) -> Result<Vec<DeletionRecord>> {
        let rows = sqlx::query_as::<_, DeletionRow>(
            "SELECT file_name, delete_at_ms FROM file_deletions WHERE delete_at_ms <= ? ORDER BY delete_at_ms ASC, file_name ASC",
        )
        .bind(before_ms)
        .fetch_all(&self.pool)
        .await
        .context("query expired deletions")?;
        Ok(rows.into_iter().map(DeletionRecord::from).collect())
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    fn custom_files(&self) -> Option<&dyn CustomFileStore> {
        Some(self as &dyn CustomFileStore)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("sqlite pool closed");
    }
}

#[async_trait]
impl CustomFileStore for SqliteStore {
    async fn save_custom_file(&self, record: &CustomFileRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO custom_files(custom_file_name, original_remote_url, file_extension, created_at, updated_at) VALUES (?, ?, ?, ?, ?) ON CONFLICT(custom_file_name) DO UPDATE SET original_remote_url = excluded.original_remote_url, file_extension = excluded.file_extension, updated_at = excluded.updated_at",
        )
        .bind(&record.custom_file_name)
        .bind(&record.original_remote_url)
        .bind(&record.file_extension)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert custom file {}", record.custom_file_name))?;
        Ok(())
    }

    async fn get_custom_file(&self, custom_file_name: &str) -> Result<Option<CustomFileRecord>> {
        let row = sqlx::query_as::<_, CustomFileRow>(
            "SELECT custom_file_name, original_remote_url, file_extension FROM custom_files WHERE custom_file_name = ?",
        )
        .bind(custom_file_name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query custom file {custom_file_name}"))?;
        Ok(row.map(CustomFileRecord::from))
    }

    async fn delete_custom_file(&self, custom_file_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM custom_files WHERE custom_file_name = ?")
            .bind(custom_file_name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete custom file {custom_file_name}"))?;
        Ok(result.rows_affected() > 0)
    }
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}

fn is_memory_uri(uri: &str) -> bool {
    uri.contains(":memory:") || uri.contains("mode=memory")
}

async fn ensure_parent_dir(uri: &str) -> Result<()> {
    let path = uri
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
    }
    Ok(())
}
