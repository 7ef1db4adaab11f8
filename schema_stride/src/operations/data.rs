//! Data migration handlers
//!
//! `RunCode` operations reference handlers by name; the registry supplies the
//! actual code when migrations are loaded for application.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::db::editor::SchemaEditor;
use crate::db::executor::SqlExecutor;
use crate::error::{Error, Result};
use crate::operations::Operation;

/// Async data migration step that runs inside the migration's transaction
#[async_trait]
pub trait DataMigration: Send + Sync {
    async fn run(&self, executor: &mut dyn SqlExecutor, editor: &dyn SchemaEditor) -> Result<()>;
}

/// A registered piece of data-migration code
#[derive(Clone)]
pub enum DataHandler {
    /// Synchronous and argument-free
    Plain(Arc<dyn Fn() -> Result<()> + Send + Sync>),
    /// Async, receives the executor and the schema editor
    WithContext(Arc<dyn DataMigration>),
}

impl DataHandler {
    pub fn plain(f: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        DataHandler::Plain(Arc::new(f))
    }

    pub fn with_context(migration: impl DataMigration + 'static) -> Self {
        DataHandler::WithContext(Arc::new(migration))
    }

    pub async fn invoke(&self, executor: &mut dyn SqlExecutor, editor: &dyn SchemaEditor) -> Result<()> {
        match self {
            DataHandler::Plain(f) => f(),
            DataHandler::WithContext(migration) => migration.run(executor, editor).await,
        }
    }
}

impl fmt::Debug for DataHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataHandler::Plain(_) => f.write_str("DataHandler::Plain"),
            DataHandler::WithContext(_) => f.write_str("DataHandler::WithContext"),
        }
    }
}

/// Named data-migration handlers
#[derive(Debug, Clone, Default)]
pub struct DataMigrationRegistry {
    handlers: HashMap<String, DataHandler>,
}

impl DataMigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: DataHandler) -> &mut Self {
        self.handlers.insert(name.to_string(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&DataHandler> {
        self.handlers.get(name)
    }

    /// Attach registered handlers to every `RunCode` operation.
    ///
    /// Unknown names are left unattached; applying such an operation fails then.
    pub fn attach(&self, operations: &mut [Operation]) {
        for operation in operations.iter_mut() {
            if let Operation::RunCode(run) = operation {
                if let Some(handler) = self.get(&run.forward) {
                    run.forward_handler = Some(handler.clone());
                }
                if let Some(handler) = run.backward.as_deref().and_then(|name| self.get(name)) {
                    run.backward_handler = Some(handler.clone());
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Error for a handler name nothing registered
pub(crate) fn missing_handler(name: &str) -> Error {
    Error::DiscoveryError(format!("Data migration handler `{}` is not registered", name))
}
