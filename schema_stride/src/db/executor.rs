//! SQL executor
//!
//! The seam between operations and the database. Operations never see a pool;
//! they run statements through whatever executor the caller hands them, which in
//! practice is the transaction wrapping one migration.

use async_trait::async_trait;
use sqlx::{PgConnection, Postgres, Transaction};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Something that can run one SQL statement at a time
#[async_trait]
pub trait SqlExecutor: Send {
    /// Execute a single SQL statement
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Execute multiple SQL statements in order, stopping at the first failure
    async fn execute_batch(&mut self, statements: &[String]) -> Result<()> {
        for statement in statements {
            self.execute(statement).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl SqlExecutor for PgConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        tracing::debug!(sql = sql, "Executing statement");
        sqlx::query(sql).execute(&mut *self).await?;
        Ok(())
    }
}

#[async_trait]
impl<'c> SqlExecutor for Transaction<'c, Postgres> {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        tracing::debug!(sql = sql, "Executing statement in transaction");
        sqlx::query(sql).execute(&mut **self).await?;
        Ok(())
    }
}

/// Opens the transaction that wraps one migration
#[async_trait]
pub trait TransactionSource: Send + Sync {
    type Transaction: SqlExecutor + 'static;

    async fn begin(&self) -> Result<Self::Transaction>;
    async fn commit(&self, transaction: Self::Transaction) -> Result<()>;
    async fn rollback(&self, transaction: Self::Transaction) -> Result<()>;
}

/// Executor that only collects statements. Used for previews and tests.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    pub statements: Vec<String>,
    fail_on: Option<String>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor that fails any statement containing `pattern`
    pub fn failing_on(pattern: &str) -> Self {
        Self {
            statements: Vec::new(),
            fail_on: Some(pattern.to_string()),
        }
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        if let Some(pattern) = &self.fail_on {
            if sql.contains(pattern.as_str()) {
                return Err(Error::MigrationApplyError {
                    migration: String::new(),
                    message: format!("statement rejected: {}", sql),
                });
            }
        }
        self.statements.push(sql.to_string());
        Ok(())
    }
}

/// In-process stand-in for a database: committed statements are kept, rolled
/// back ones are dropped.
#[derive(Debug, Clone, Default)]
pub struct RecordingDatabase {
    committed: Arc<Mutex<Vec<String>>>,
    fail_on: Option<String>,
}

impl RecordingDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(pattern: &str) -> Self {
        Self {
            committed: Arc::default(),
            fail_on: Some(pattern.to_string()),
        }
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed
            .lock()
            .map(|statements| statements.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransactionSource for RecordingDatabase {
    type Transaction = RecordingExecutor;

    async fn begin(&self) -> Result<RecordingExecutor> {
        Ok(match &self.fail_on {
            Some(pattern) => RecordingExecutor::failing_on(pattern),
            None => RecordingExecutor::new(),
        })
    }

    async fn commit(&self, transaction: RecordingExecutor) -> Result<()> {
        let mut committed = self
            .committed
            .lock()
            .map_err(|_| Error::StateError("recording database lock poisoned".to_string()))?;
        committed.extend(transaction.statements);
        Ok(())
    }

    async fn rollback(&self, _transaction: RecordingExecutor) -> Result<()> {
        Ok(())
    }
}
