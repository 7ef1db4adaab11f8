//! Database connection handling
//!
//! This module provides functionality to establish and manage the PostgreSQL pool.

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::db::executor::TransactionSource;
use crate::error::{Error, Result};

/// Host part of a connection URL, without credentials
pub fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    rest.split(['/', '?']).next().unwrap_or(rest).to_string()
}

/// A PostgreSQL pool together with the host it points at
#[derive(Debug, Clone)]
pub struct DatabaseConnection {
    pool: PgPool,
    host: String,
}

impl DatabaseConnection {
    /// Connect to `url` with pool settings from configuration
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let host = host_of(url);
        tracing::debug!(host = %host, pool_size = config.pool_size, "Connecting to database");

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .acquire_timeout(Duration::from_secs(config.timeout_seconds))
            .connect(url)
            .await
            .map_err(|e| Error::ConnectivityError {
                host: host.clone(),
                message: e.to_string(),
            })?;

        Ok(Self { pool, host })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Execute a SQL statement outside any migration transaction
    pub async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionSource for DatabaseConnection {
    type Transaction = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Transaction> {
        self.pool.begin().await.map_err(|e| Error::ConnectivityError {
            host: self.host.clone(),
            message: e.to_string(),
        })
    }

    async fn commit(&self, transaction: Self::Transaction) -> Result<()> {
        transaction.commit().await?;
        Ok(())
    }

    async fn rollback(&self, transaction: Self::Transaction) -> Result<()> {
        transaction.rollback().await?;
        Ok(())
    }
}
