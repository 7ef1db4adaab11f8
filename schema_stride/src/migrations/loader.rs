//! Migration loading and replay

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::migrations::files::{detect_conflicts, discover, MigrationDocument, MigrationFile};
use crate::operations::{DataMigrationRegistry, Operation};
use crate::state::ProjectState;

/// A parsed migration
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub number: u32,
    pub name: String,
    pub operations: Vec<Operation>,
}

impl Migration {
    pub fn new(number: u32, name: &str, operations: Vec<Operation>) -> Self {
        Self {
            number,
            name: name.to_string(),
            operations,
        }
    }
}

/// Read and decode one migration file
pub fn read_migration(file: &MigrationFile) -> Result<Migration> {
    let text = fs::read_to_string(&file.path)
        .map_err(|e| Error::DiscoveryError(format!("Cannot read {}: {}", file.path.display(), e)))?;
    let document: MigrationDocument = serde_json::from_str(&text)
        .map_err(|e| Error::DiscoveryError(format!("Cannot decode {}: {}", file.path.display(), e)))?;

    if document.name != file.name {
        tracing::warn!(
            file = %file.name,
            recorded = %document.name,
            "Migration name inside the file differs from its file name"
        );
    }

    let operations = document
        .operations
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            Operation::from_code(value).map_err(|e| {
                Error::DiscoveryError(format!("{} operation {}: {}", file.name, i + 1, e))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Migration::new(file.number, &file.name, operations))
}

/// Every migration in `dir`, in order, after conflict checks
pub fn load_all(dir: &Path) -> Result<Vec<Migration>> {
    let files = discover(dir)?;
    detect_conflicts(&files)?;
    let migrations = files.iter().map(read_migration).collect::<Result<Vec<_>>>()?;
    tracing::debug!(count = migrations.len(), dir = %dir.display(), "Loaded migrations");
    Ok(migrations)
}

/// Like [`load_all`], with data-migration handlers attached
pub fn load_with_handlers(dir: &Path, handlers: &DataMigrationRegistry) -> Result<Vec<Migration>> {
    let mut migrations = load_all(dir)?;
    for migration in &mut migrations {
        handlers.attach(&mut migration.operations);
    }
    Ok(migrations)
}

/// Fold every operation's state mutation over an empty project
pub fn replay(migrations: &[Migration]) -> Result<ProjectState> {
    let mut state = ProjectState::new();
    for migration in migrations {
        for operation in &migration.operations {
            operation.mutate_state(&mut state).map_err(|e| {
                Error::InvalidMigration(format!("Replaying {} ({}) failed: {}", migration.name, operation, e))
            })?;
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::writer::write_migration;
    use crate::operations::{AddField, CreateModel, RunCode};
    use crate::state::{FieldState, FieldType, ModelState};
    use pretty_assertions::assert_eq;

    fn user() -> ModelState {
        ModelState::new("User", "user").with_field(FieldState::new("id", FieldType::Int).primary_key().generated())
    }

    #[test]
    fn test_written_migrations_replay_to_the_same_state() {
        let dir = tempfile::tempdir().unwrap();
        let email = FieldState::new("email", FieldType::Char).with_max_length(120).nullable();
        write_migration(
            dir.path(),
            1,
            "initial",
            &[Operation::CreateModel(CreateModel::from_model_state(&user()).unwrap())],
        )
        .unwrap();
        write_migration(
            dir.path(),
            2,
            "add_user_email",
            &[Operation::AddField(AddField::from_field(&user(), &email).unwrap())],
        )
        .unwrap();

        let migrations = load_all(dir.path()).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[1].name, "0002_add_user_email");

        let replayed = replay(&migrations).unwrap();
        let expected = ProjectState::new().with_model(user().with_field(email));
        assert!(replayed.equivalent(&expected));
    }

    #[test]
    fn test_malformed_operation_is_a_discovery_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("0001_initial.json"),
            r#"{"name":"0001_initial","generated_at":"2024-01-01T00:00:00Z","operations":[{"op":"Explode"}]}"#,
        )
        .unwrap();
        let err = load_all(dir.path()).unwrap_err();
        assert!(matches!(err, Error::DiscoveryError(ref m) if m.contains("0001_initial operation 1")));
    }

    #[test]
    fn test_replay_names_the_failing_migration() {
        let migrations = vec![Migration::new(
            1,
            "0001_broken",
            vec![Operation::AddField(AddField::from_field(&user(), &FieldState::new("x", FieldType::Int)).unwrap())],
        )];
        let err = replay(&migrations).unwrap_err();
        assert!(err.to_string().contains("0001_broken"));
    }

    #[test]
    fn test_handlers_are_attached_on_load() {
        let dir = tempfile::tempdir().unwrap();
        write_migration(dir.path(), 1, "backfill", &[Operation::RunCode(RunCode::named("fill", None))]).unwrap();

        let mut handlers = DataMigrationRegistry::new();
        handlers.register("fill", crate::operations::DataHandler::plain(|| Ok(())));
        let migrations = load_with_handlers(dir.path(), &handlers).unwrap();
        let Operation::RunCode(run) = &migrations[0].operations[0] else {
            panic!("expected RunCode");
        };
        assert!(format!("{:?}", run).contains("attached: true"));
    }
}
