//! Database module for schema_stride
//!
//! Connection pool, the SQL executor seam, the PostgreSQL schema editor and the
//! applied-migration recorder.

pub mod connection;
pub mod editor;
pub mod executor;
pub mod recorder;

// Re-export key types
pub use connection::DatabaseConnection;
pub use editor::{PostgresSchemaEditor, SchemaEditor};
pub use executor::{RecordingDatabase, RecordingExecutor, SqlExecutor, TransactionSource};
pub use recorder::{InMemoryRecorder, MigrationRecorder, PostgresRecorder};
