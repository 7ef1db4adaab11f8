//! Migration files and the workflows built on them

pub mod apply;
pub mod files;
pub mod generate;
pub mod loader;
pub mod writer;

pub use apply::{apply, apply_migrations, plan_route, resolve_target_name, ApplyContext, ApplyMode, ApplyReport, Route};
pub use files::{discover, MigrationDocument, MigrationFile};
pub use generate::{generate, GenerateOptions, GenerateOutcome};
pub use loader::{load_all, load_with_handlers, replay, Migration};
pub use writer::{auto_name, write_migration};
