//! Migration persistence

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::migrations::files::{file_name, MigrationDocument};
use crate::operations::Operation;
use crate::utils::naming::slugify;

pub const INITIAL_NAME: &str = "initial";
pub const DATA_MIGRATION_NAME: &str = "data_migration";
const AUTO_NAME: &str = "auto";
const MAX_NAME_FRAGMENTS: usize = 2;

fn fragment(operation: &Operation) -> String {
    let raw = match operation {
        Operation::CreateModel(op) => format!("create_{}", op.name),
        Operation::RemoveModel(op) => format!("remove_{}", op.name),
        Operation::RenameModel(op) => format!("rename_{}_to_{}", op.old_name, op.new_name),
        Operation::AddField(op) => format!("add_{}_{}", op.model_name, op.field_name),
        Operation::RemoveField(op) => format!("remove_{}_{}", op.model_name, op.field_name),
        Operation::AlterField(op) => format!("alter_{}_{}", op.model_name, op.field_name),
        Operation::RenameField(op) => format!("rename_{}_{}", op.model_name, op.old_name),
        Operation::CreateIndex(op) => format!("createindex_{}_{}", op.model_name, op.columns.join("_")),
        Operation::RemoveIndex(op) => format!("removeindex_{}", op.model_name),
        Operation::RunCode(_) => "runcode".to_string(),
    };
    raw.to_lowercase()
}

/// Slug describing a batch of operations
pub fn auto_name(operations: &[Operation], is_first: bool) -> String {
    if is_first && !operations.is_empty() {
        return INITIAL_NAME.to_string();
    }

    let fragments: Vec<String> = operations.iter().take(MAX_NAME_FRAGMENTS).map(fragment).collect();
    if fragments.is_empty() {
        return AUTO_NAME.to_string();
    }

    let mut name = fragments.join("_");
    if operations.len() > MAX_NAME_FRAGMENTS {
        name.push_str("_and_more");
    }
    slugify(&name)
}

/// Slug for a user-supplied name; empty results fall back to `fallback`
pub fn user_name(raw: &str, fallback: &str) -> String {
    let slug = slugify(raw);
    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug
    }
}

/// Pretty-printed JSON for one migration
pub fn render_document(name: &str, operations: &[Operation], generated_at: DateTime<Utc>) -> Result<String> {
    let document = MigrationDocument {
        name: name.to_string(),
        generated_at,
        operations: operations
            .iter()
            .map(Operation::render_code)
            .collect::<Result<Vec<_>>>()?,
    };
    let mut text = serde_json::to_string_pretty(&document)?;
    text.push('\n');
    Ok(text)
}

/// Write `NNNN_slug.json` into `dir`; an existing file is never overwritten
pub fn write_migration(dir: &Path, number: u32, slug: &str, operations: &[Operation]) -> Result<PathBuf> {
    let file = file_name(number, slug);
    let path = dir.join(&file);
    if path.exists() {
        return Err(Error::InvalidMigration(format!(
            "Migration file {} already exists",
            path.display()
        )));
    }

    // Render first so a rejected operation leaves no partial file behind
    let name = file.trim_end_matches(".json");
    let text = render_document(name, operations, Utc::now())?;

    fs::create_dir_all(dir)?;
    fs::write(&path, text)?;
    tracing::info!(migration = %name, operations = operations.len(), path = %path.display(), "Wrote migration");
    Ok(path)
}
