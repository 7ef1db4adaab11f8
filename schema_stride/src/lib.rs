//! schema_stride: rename-aware, reversible schema migrations for Rust models
//!
//! Annotated structs describe the schema you want. schema_stride replays the
//! migration files already on disk to learn the schema you have, diffs the two
//! into an ordered list of operations and writes them as the next migration.
//! Applying walks the migrations forward or backward against PostgreSQL, one
//! transaction per migration.

extern crate self as schema_stride;

pub mod config;
pub mod db;
pub mod error;
pub mod migrations;
pub mod models;
pub mod operations;
pub mod schema;
pub mod state;
pub mod utils;

use std::path::PathBuf;

// Re-export main types for easier access
pub use config::Config;
pub use db::connection::DatabaseConnection;
pub use error::{Error, Result};
pub use migrations::{ApplyMode, ApplyReport, GenerateOptions, GenerateOutcome};
pub use models::{Model, ModelRegistry, SchemaSource};
pub use operations::{DataHandler, DataMigration, DataMigrationRegistry, Operation};
pub use schema::{AcceptAll, Confirmer, DeclineAll, RenameDecision};
pub use schema_stride_macros::Model;
pub use state::{FieldState, FieldType, ModelState, ProjectState};

/// Initialize schema_stride with the specified configuration file
pub fn init(config_path: &str) -> Result<StrideClient> {
    let config = config::load_from_file(config_path)?;
    Ok(StrideClient::new(config))
}

/// The main client for interacting with schema_stride
pub struct StrideClient {
    config: Config,
    handlers: DataMigrationRegistry,
}

impl StrideClient {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            handlers: DataMigrationRegistry::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handlers for `RunCode` operations, looked up by name when applying
    pub fn handlers_mut(&mut self) -> &mut DataMigrationRegistry {
        &mut self.handlers
    }

    pub fn migrations_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.migrations.directory)
    }

    /// Generation options seeded from the `[rename]` section
    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            model_threshold: self.config.rename.model_threshold,
            field_min_score: self.config.rename.field_min_score,
            ..GenerateOptions::default()
        }
    }

    /// Scan the configured paths for model definitions
    pub fn register_models(&self) -> Result<ModelRegistry> {
        let mut registry = ModelRegistry::new(&self.config.models, &self.config.naming);
        registry.scan()?;
        Ok(registry)
    }

    /// Generate the next migration from the scanned models
    pub fn generate(&self, options: &GenerateOptions, confirmer: &mut dyn Confirmer) -> Result<GenerateOutcome> {
        let registry = self.register_models()?;
        self.generate_from(&registry, options, confirmer)
    }

    /// Generate the next migration from any schema source
    pub fn generate_from(
        &self,
        source: &dyn SchemaSource,
        options: &GenerateOptions,
        confirmer: &mut dyn Confirmer,
    ) -> Result<GenerateOutcome> {
        migrations::generate(source, &self.migrations_dir(), options, confirmer)
    }

    pub async fn connect(&self) -> Result<DatabaseConnection> {
        DatabaseConnection::connect(self.config.database_url()?, &self.config.database).await
    }

    /// Walk the database to `target`, or to the newest migration
    pub async fn apply(&self, target: Option<&str>, mode: ApplyMode) -> Result<ApplyReport> {
        let connection = self.connect().await?;
        let recorder = db::PostgresRecorder::new(connection.pool().clone(), &self.config.migrations.history_table);
        let editor = db::PostgresSchemaEditor::new();
        let ctx = migrations::ApplyContext {
            db: &connection,
            recorder: &recorder,
            editor: &editor,
            handlers: &self.handlers,
        };
        migrations::apply(&ctx, &self.migrations_dir(), target, mode).await
    }
}
