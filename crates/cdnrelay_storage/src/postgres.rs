use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cdnrelay_transfer::{CustomFileRecord, DeletionRecord};
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::repository::{CustomFileRow, DeletionRow};
use crate::{CustomFileStore, ScheduleStore};

const SCHEMA_SQL: &str = include_str!("sql/postgres.sql");

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("failed to connect postgres pool")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
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
        info!("cdnrelay postgres schema ready");
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn save(&self, record: &DeletionRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO file_deletions(file_name, delete_at_ms, created_at, updated_at) VALUES ($1, $2, $3, $4) ON CONFLICT(file_name) DO UPDATE SET delete_at_ms = EXCLUDED.delete_at_ms, updated_at = EXCLUDED.updated_at",
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
            "SELECT file_name, delete_at_ms FROM file_deletions WHERE file_name = $1",
        )
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query deletion {file_name}"))?;
        Ok(row.map(DeletionRecord::from))
    }

    async fn delete(&self, file_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_deletions WHERE file_name = $1")
            .bind(file_name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete deletion record {file_name}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_expired(&self, before_ms: i64) -> Result<Vec<DeletionRecord>> {
        let rows = sqlx::query_as::<_, DeletionRow>(
            "SELECT file_name, delete_at_ms FROM file_deletions WHERE delete_at_ms <= $1 ORDER BY delete_at_ms ASC, file_name ASC",
        )
        .bind(before_ms)
        .fetch_all(&self.pool)
        .await
        .context("query expired deletions")?;
        Ok(rows.into_iter().map(DeletionRecord::from).collect())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    fn custom_files(&self) -> Option<&dyn CustomFileStore> {
        Some(self as &dyn CustomFileStore)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("postgres pool closed");
    }
}

#[async_trait]
impl CustomFileStore for PgStore {
    async fn save_custom_file(&self, record: &CustomFileRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO custom_files(custom_file_name, original_remote_url, file_extension, created_at, updated_at) VALUES ($1, $2, $3, $4, $5) ON CONFLICT(custom_file_name) DO UPDATE SET original_remote_url = EXCLUDED.original_remote_url, file_extension = EXCLUDED.file_extension, updated_at = EXCLUDED.updated_at",
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
            "SELECT custom_file_name, original_remote_url, file_extension FROM custom_files WHERE custom_file_name = $1",
        )
        .bind(custom_file_name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query custom file {custom_file_name}"))?;
        Ok(row.map(CustomFileRecord::from))
    }

    async fn delete_custom_file(&self, custom_file_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM custom_files WHERE custom_file_name = $1")
            .bind(custom_file_name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete custom file {custom_file_name}"))?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Runs only against a live server named by CDNRELAY_TEST_POSTGRES_URL.
    async fn store() -> Option<PgStore> {
        let url = std::env::var("CDNRELAY_TEST_POSTGRES_URL").ok()?;
        Some(PgStore::connect(&url).await.expect("connect"))
    }

    #[tokio::test]
    async fn schedules_and_mappings_round_through_postgres() {
        let Some(store) = store().await else {
            return;
        };
        let name = format!("pg-{}.png", Utc::now().timestamp_nanos_opt().unwrap_or_default());

        store
            .save(&DeletionRecord {
                file_name: name.clone(),
                delete_at_ms: 10,
            })
            .await
            .expect("save");
        store
            .save(&DeletionRecord {
                file_name: name.clone(),
                delete_at_ms: 20,
            })
            .await
            .expect("resave");
        assert_eq!(
            store.get(&name).await.expect("get").map(|r| r.delete_at_ms),
            Some(20)
        );
        assert!(store
            .find_expired(20)
            .await
            .expect("expired")
            .iter()
            .any(|r| r.file_name == name));
        assert!(store.delete(&name).await.expect("delete"));

        let custom = store.custom_files().expect("custom files supported");
        let mapping = CustomFileRecord {
            custom_file_name: name.clone(),
            original_remote_url: "local://file/abc#key".to_string(),
            file_extension: "png".to_string(),
        };
        custom.save_custom_file(&mapping).await.expect("save mapping");
        assert_eq!(custom.get_custom_file(&name).await.expect("get"), Some(mapping));
        assert!(custom.delete_custom_file(&name).await.expect("delete mapping"));

        store.close().await;
    }
}
