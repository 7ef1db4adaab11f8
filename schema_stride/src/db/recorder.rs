//! Applied-migration registry
//!
//! An append-only log of applied migration names. Recording and unrecording run
//! through the executor of the migration being applied so that they commit or
//! roll back together with it.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::db::editor::{quote_ident, quote_literal};
use crate::db::executor::SqlExecutor;
use crate::error::{Error, Result};

#[async_trait]
pub trait MigrationRecorder: Send + Sync {
    /// Create the registry if it does not exist
    async fn ensure_table(&self) -> Result<()>;

    /// Whether the registry exists, without creating it
    async fn has_table(&self) -> Result<bool>;

    /// Applied names, oldest first
    async fn list_applied(&self) -> Result<Vec<String>>;

    async fn record_applied(&self, executor: &mut dyn SqlExecutor, name: &str) -> Result<()>;

    async fn unrecord_applied(&self, executor: &mut dyn SqlExecutor, name: &str) -> Result<()>;

    async fn is_applied(&self, name: &str) -> Result<bool> {
        Ok(self.list_applied().await?.iter().any(|applied| applied == name))
    }
}

/// Registry stored in a PostgreSQL table
#[derive(Debug, Clone)]
pub struct PostgresRecorder {
    pool: PgPool,
    table: String,
}

impl PostgresRecorder {
    pub fn new(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
        }
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
             id BIGSERIAL PRIMARY KEY,\n    \
             name TEXT UNIQUE NOT NULL,\n    \
             applied_at TIMESTAMPTZ NOT NULL DEFAULT now()\n)",
            quote_ident(&self.table)
        )
    }

    fn insert_sql(&self, name: &str) -> String {
        format!(
            "INSERT INTO {} (name) VALUES ({}) ON CONFLICT (name) DO NOTHING;",
            quote_ident(&self.table),
            quote_literal(name)
        )
    }

    fn delete_sql(&self, name: &str) -> String {
        format!(
            "DELETE FROM {} WHERE name = {};",
            quote_ident(&self.table),
            quote_literal(name)
        )
    }
}

#[async_trait]
impl MigrationRecorder for PostgresRecorder {
    async fn ensure_table(&self) -> Result<()> {
        sqlx::query(&self.create_table_sql())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::RecorderError(format!("Cannot create {}: {}", self.table, e)))?;
        Ok(())
    }

    async fn has_table(&self) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
            .bind(quote_ident(&self.table))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::RecorderError(format!("Cannot look up {}: {}", self.table, e)))
    }

    async fn list_applied(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {} ORDER BY applied_at, id",
            quote_ident(&self.table)
        );
        sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::RecorderError(format!("Cannot read {}: {}", self.table, e)))
    }

    async fn record_applied(&self, executor: &mut dyn SqlExecutor, name: &str) -> Result<()> {
        executor.execute(&self.insert_sql(name)).await
    }

    async fn unrecord_applied(&self, executor: &mut dyn SqlExecutor, name: &str) -> Result<()> {
        executor.execute(&self.delete_sql(name)).await
    }

    async fn is_applied(&self, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE name = $1)",
            quote_ident(&self.table)
        );
        sqlx::query_scalar::<_, bool>(&sql)
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::RecorderError(format!("Cannot read {}: {}", self.table, e)))
    }
}

/// Registry kept in memory, for tests and dry runs
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    applied: Mutex<Vec<String>>,
    created: AtomicBool,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_applied(names: &[&str]) -> Self {
        Self {
            applied: Mutex::new(names.iter().map(|n| n.to_string()).collect()),
            created: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<String>>> {
        self.applied
            .lock()
            .map_err(|_| Error::RecorderError("in-memory recorder lock poisoned".to_string()))
    }
}

#[async_trait]
impl MigrationRecorder for InMemoryRecorder {
    async fn ensure_table(&self) -> Result<()> {
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn has_table(&self) -> Result<bool> {
        Ok(self.created.load(Ordering::SeqCst))
    }

    async fn list_applied(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.clone())
    }

    async fn record_applied(&self, _executor: &mut dyn SqlExecutor, name: &str) -> Result<()> {
        let mut applied = self.lock()?;
        if !applied.iter().any(|n| n == name) {
            applied.push(name.to_string());
        }
        Ok(())
    }

    async fn unrecord_applied(&self, _executor: &mut dyn SqlExecutor, name: &str) -> Result<()> {
        self.lock()?.retain(|n| n != name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::executor::RecordingExecutor;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_in_memory_recorder_is_insert_if_absent() {
        let recorder = InMemoryRecorder::new();
        let mut executor = RecordingExecutor::new();
        recorder.record_applied(&mut executor, "0001_initial").await.unwrap();
        recorder.record_applied(&mut executor, "0002_more").await.unwrap();
        recorder.record_applied(&mut executor, "0001_initial").await.unwrap();

        assert_eq!(recorder.list_applied().await.unwrap(), vec!["0001_initial", "0002_more"]);
        assert!(recorder.is_applied("0002_more").await.unwrap());

        recorder.unrecord_applied(&mut executor, "0002_more").await.unwrap();
        assert!(!recorder.is_applied("0002_more").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_table_exists_once_ensured() {
        let recorder = InMemoryRecorder::new();
        assert!(!recorder.has_table().await.unwrap());
        recorder.ensure_table().await.unwrap();
        assert!(recorder.has_table().await.unwrap());
        assert!(InMemoryRecorder::with_applied(&["0001_initial"]).has_table().await.unwrap());
    }

    #[tokio::test]
    async fn test_postgres_statements_quote_names() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let recorder = PostgresRecorder::new(pool, "applied");
        assert_eq!(
            recorder.insert_sql("0001_it's"),
            "INSERT INTO \"applied\" (name) VALUES ('0001_it''s') ON CONFLICT (name) DO NOTHING;"
        );
        assert_eq!(recorder.delete_sql("0001_a"), "DELETE FROM \"applied\" WHERE name = '0001_a';");
        assert!(recorder.create_table_sql().contains("name TEXT UNIQUE NOT NULL"));
    }
}
