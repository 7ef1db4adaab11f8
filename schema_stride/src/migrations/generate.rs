//! Generate workflow
//!
//! Replays the migrations on disk, compares the result with the extracted
//! models and writes the next migration file.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::migrations::files::{detect_conflicts, discover, next_number};
use crate::migrations::loader::{read_migration, replay};
use crate::migrations::writer::{auto_name, user_name, write_migration, DATA_MIGRATION_NAME};
use crate::models::SchemaSource;
use crate::operations::{Operation, RunCode};
use crate::schema::rename::{confirm_field_renames, Confirmer, DEFAULT_FIELD_MIN_SCORE, DEFAULT_MODEL_THRESHOLD};
use crate::schema::{enforce, validate_index_columns, Differ};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    /// Write a migration holding a single `RunCode` placeholder for a data change
    pub empty: bool,
    pub name: Option<String>,
    /// Report what would be written without writing it
    pub check: bool,
    pub model_threshold: f64,
    pub field_min_score: f64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            empty: false,
            name: None,
            check: false,
            model_threshold: DEFAULT_MODEL_THRESHOLD,
            field_min_score: DEFAULT_FIELD_MIN_SCORE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    NoChanges,
    Written { name: String, path: PathBuf, operations: usize },
    /// Check mode: the migration that would have been written
    Pending { name: String, operations: usize },
}

impl GenerateOutcome {
    pub fn has_changes(&self) -> bool {
        !matches!(self, GenerateOutcome::NoChanges)
    }
}

pub fn generate(
    source: &dyn SchemaSource,
    dir: &Path,
    options: &GenerateOptions,
    confirmer: &mut dyn Confirmer,
) -> Result<GenerateOutcome> {
    let files = discover(dir)?;
    detect_conflicts(&files)?;
    let number = next_number(&files);

    if options.empty {
        let slug = user_name(options.name.as_deref().unwrap_or(""), DATA_MIGRATION_NAME);
        let handler = format!("{:04}_{}", number, slug);
        tracing::info!(handler = %handler, "Register a data migration handler under this name before applying");
        let placeholder = Operation::RunCode(RunCode::named(&handler, None));
        return finish(dir, number, &slug, vec![placeholder], options.check);
    }

    let migrations = files.iter().map(read_migration).collect::<Result<Vec<_>>>()?;
    let old = replay(&migrations)?;
    let new = source.extract()?;
    validate_index_columns(&new)?;

    let differ = Differ::new().with_model_threshold(options.model_threshold);
    let model_renames = differ.model_renames(&old, &new);
    for (from, to) in &model_renames {
        tracing::info!(model = %from, renamed_to = %to, "Detected model rename");
    }
    let renames = confirm_field_renames(
        &old.without_non_schema_fields(),
        &new.without_non_schema_fields(),
        &model_renames,
        options.field_min_score,
        confirmer,
    )?;

    let operations = differ.diff(&old, &new, &renames)?;
    if operations.is_empty() {
        tracing::info!("No changes detected");
        return Ok(GenerateOutcome::NoChanges);
    }
    enforce(&operations, confirmer)?;

    let slug = match &options.name {
        Some(name) => user_name(name, &auto_name(&operations, files.is_empty())),
        None => auto_name(&operations, files.is_empty()),
    };
    finish(dir, number, &slug, operations, options.check)
}

fn finish(
    dir: &Path,
    number: u32,
    slug: &str,
    operations: Vec<Operation>,
    check: bool,
) -> Result<GenerateOutcome> {
    let name = format!("{:04}_{}", number, slug);
    if check {
        return Ok(GenerateOutcome::Pending {
            name,
            operations: operations.len(),
        });
    }
    let path = write_migration(dir, number, slug, &operations)?;
    Ok(GenerateOutcome::Written {
        name,
        path,
        operations: operations.len(),
    })
}
