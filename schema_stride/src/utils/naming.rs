//! Naming utilities for schema_stride
//!
//! Table names derived from model names, deterministic index and constraint
//! names, and migration slugs.

use inflector::Inflector;

/// PostgreSQL identifier length limit
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Apply a `[naming] table_style`; unknown styles leave the name untouched
pub fn apply_naming_convention(name: &str, style: &str) -> String {
    match style {
        "snake_case" => name.to_snake_case(),
        "lowercase" => name.to_lowercase(),
        _ => name.to_string(),
    }
}

/// Table name for a model: styled, then pluralized on the last word only
pub fn get_table_name(model_name: &str, style: &str, pluralize: bool) -> String {
    let name = apply_naming_convention(model_name, style);
    if !pluralize {
        return name;
    }
    match name.rsplit_once('_') {
        Some((head, last)) => format!("{}_{}", head, last.to_plural()),
        None => name.to_plural(),
    }
}

/// Truncate an identifier to fit database limits, keeping it unique with a hash suffix
pub fn truncate_identifier(name: &str, max_length: usize) -> String {
    if name.len() <= max_length {
        return name.to_string();
    }

    // 8 hash chars plus the underscore
    let keep_length = max_length.saturating_sub(9);
    let hash = format!("{:x}", md5::compute(name.as_bytes()));

    let mut cut = keep_length.min(name.len());
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }

    format!("{}_{}", &name[..cut], &hash[0..8])
}

/// Deterministic name for a table-level index
pub fn index_name(table: &str, columns: &[String], unique: bool) -> String {
    let suffix = if unique { "uniq" } else { "idx" };
    truncate_identifier(&format!("{}_{}_{}", table, columns.join("_"), suffix), MAX_IDENTIFIER_LENGTH)
}

/// Name of the index created for a single field's `index` flag
pub fn field_index_name(table: &str, column: &str) -> String {
    truncate_identifier(&format!("{}_{}_idx", table, column), MAX_IDENTIFIER_LENGTH)
}

/// Name PostgreSQL gives an inline `UNIQUE` column constraint
pub fn unique_constraint_name(table: &str, column: &str) -> String {
    truncate_identifier(&format!("{}_{}_key", table, column), MAX_IDENTIFIER_LENGTH)
}

/// Filesystem-safe slug for a migration name
pub fn slugify(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase()
}
