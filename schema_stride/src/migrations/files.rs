//! Migration file naming and discovery

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const MIGRATION_EXTENSION: &str = "json";

/// On-disk shape of one migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDocument {
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub operations: Vec<Value>,
}

/// A discovered migration file
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MigrationFile {
    pub number: u32,
    /// File stem, e.g. `0002_add_user_email`
    pub name: String,
    pub path: PathBuf,
}

fn name_pattern() -> Result<Regex> {
    Regex::new(r"^(\d{4})_([A-Za-z0-9_]+)\.json$")
        .map_err(|e| Error::StateError(format!("Invalid migration name pattern: {}", e)))
}

/// `NNNN_slug.json` to `(NNNN, NNNN_slug)`
pub fn parse_file_name(file_name: &str) -> Result<Option<(u32, String)>> {
    let pattern = name_pattern()?;
    Ok(pattern.captures(file_name).and_then(|caps| {
        let number = caps.get(1)?.as_str().parse().ok()?;
        let stem = file_name.strip_suffix(".json")?;
        Some((number, stem.to_string()))
    }))
}

pub fn file_name(number: u32, slug: &str) -> String {
    format!("{:04}_{}.{}", number, slug, MIGRATION_EXTENSION)
}

/// List migration files in `dir`, sorted by number then name.
///
/// A missing directory holds no migrations. Files that do not follow the naming
/// scheme are rejected all at once.
pub fn discover(dir: &Path) -> Result<Vec<MigrationFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let pattern = dir
        .join(format!("*.{}", MIGRATION_EXTENSION))
        .to_string_lossy()
        .replace('[', "[[]");
    let entries = glob::glob(&pattern)
        .map_err(|e| Error::DiscoveryError(format!("Invalid migrations location {}: {}", dir.display(), e)))?;

    let mut files = Vec::new();
    let mut malformed = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::DiscoveryError(e.to_string()))?;
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            malformed.push(path.display().to_string());
            continue;
        };
        match parse_file_name(file_name)? {
            Some((number, name)) => files.push(MigrationFile {
                number,
                name,
                path: path.clone(),
            }),
            None => malformed.push(file_name.to_string()),
        }
    }

    if !malformed.is_empty() {
        malformed.sort();
        return Err(Error::with_offenders(
            "Migration files must be named NNNN_name.json:",
            &malformed,
        ));
    }

    files.sort();
    Ok(files)
}

/// Reject duplicate numbers and gaps in the `1..=n` sequence
pub fn detect_conflicts(files: &[MigrationFile]) -> Result<()> {
    let mut by_number: BTreeMap<u32, Vec<&str>> = BTreeMap::new();
    for file in files {
        by_number.entry(file.number).or_default().push(&file.name);
    }

    let conflicts: Vec<String> = by_number
        .values()
        .filter(|names| names.len() > 1)
        .map(|names| names.join(", "))
        .collect();
    if !conflicts.is_empty() {
        return Err(Error::with_offenders(
            "Conflicting migrations share a number; renumber or merge them:",
            &conflicts,
        ));
    }

    let missing: Vec<String> = (1..=by_number.keys().last().copied().unwrap_or(0))
        .filter(|n| !by_number.contains_key(n))
        .map(|n| format!("{:04}", n))
        .collect();
    if !missing.is_empty() {
        return Err(Error::ConfigError(format!(
            "Migration sequence has gaps; missing numbers: {}",
            missing.join(", ")
        )));
    }

    Ok(())
}

/// Number for the next migration
pub fn next_number(files: &[MigrationFile]) -> u32 {
    files.iter().map(|f| f.number).max().unwrap_or(0) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::fs;

    #[rstest]
    #[case("0001_initial.json", Some((1, "0001_initial")))]
    #[case("0012_add_user_email.json", Some((12, "0012_add_user_email")))]
    #[case("1_initial.json", None)]
    #[case("0001-initial.json", None)]
    #[case("0001_.json", None)]
    fn test_parse_file_name(#[case] raw: &str, #[case] expected: Option<(u32, &str)>) {
        let parsed = parse_file_name(raw).unwrap();
        assert_eq!(parsed, expected.map(|(n, s)| (n, s.to_string())));
    }

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "{}").unwrap();
    }

    #[test]
    fn test_discover_sorts_and_ignores_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "0002_second.json");
        touch(dir.path(), "0001_initial.json");
        touch(dir.path(), "README.md");

        let files = discover(dir.path()).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["0001_initial", "0002_second"]);
        assert_eq!(next_number(&files), 3);
    }

    #[test]
    fn test_discover_reports_every_malformed_name() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "0001_initial.json");
        touch(dir.path(), "notes.json");
        touch(dir.path(), "2_bad.json");

        let message = discover(dir.path()).unwrap_err().to_string();
        assert!(message.ends_with("NNNN_name.json:\n  - 2_bad.json\n  - notes.json"));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(&dir.path().join("nope")).unwrap().is_empty());
    }

    fn file(number: u32, slug: &str) -> MigrationFile {
        MigrationFile {
            number,
            name: format!("{:04}_{}", number, slug),
            path: PathBuf::from(file_name(number, slug)),
        }
    }

    #[test]
    fn test_duplicate_numbers_conflict() {
        let files = vec![file(1, "initial"), file(2, "a"), file(2, "b")];
        let err = detect_conflicts(&files).unwrap_err();
        assert!(err.to_string().contains("0002_a, 0002_b"));
    }

    #[test]
    fn test_gaps_are_config_errors() {
        let files = vec![file(1, "initial"), file(3, "c"), file(5, "e")];
        let err = detect_conflicts(&files).unwrap_err();
        assert!(matches!(err, Error::ConfigError(ref m) if m.ends_with("0002, 0004")));
    }
}
