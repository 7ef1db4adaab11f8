//! Apply workflow tests against a recording database and an in-memory registry

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

use schema_stride::db::{InMemoryRecorder, MigrationRecorder, PostgresSchemaEditor, RecordingDatabase, SchemaEditor, SqlExecutor};
use schema_stride::migrations::writer::write_migration;
use schema_stride::migrations::{apply, generate, ApplyContext, ApplyMode, GenerateOptions};
use schema_stride::operations::{RemoveModel, RunCode};
use schema_stride::{
    DataHandler, DataMigration, DataMigrationRegistry, DeclineAll, Error, FieldState, FieldType, ModelState, Operation,
    ProjectState, Result,
};

fn user() -> ModelState {
    ModelState::new("User", "user")
        .with_field(FieldState::new("id", FieldType::Int).primary_key().generated())
        .with_field(FieldState::new("email", FieldType::Char).with_max_length(120).unique())
}

fn post() -> ModelState {
    ModelState::new("Post", "post")
        .with_field(FieldState::new("id", FieldType::Int).primary_key().generated())
        .with_field(FieldState::foreign_key("author", "user", FieldType::Int).with_related_model("User"))
        .with_field(FieldState::new("body", FieldType::Text))
}

/// `0001_initial` creates users, `0002_create_post` creates posts
fn two_migrations(dir: &Path) {
    let options = GenerateOptions::default();
    generate(&ProjectState::new().with_model(user()), dir, &options, &mut DeclineAll).unwrap();
    generate(
        &ProjectState::new().with_model(user()).with_model(post()),
        dir,
        &options,
        &mut DeclineAll,
    )
    .unwrap();
}

struct Harness {
    db: RecordingDatabase,
    recorder: InMemoryRecorder,
    editor: PostgresSchemaEditor,
    handlers: DataMigrationRegistry,
}

impl Harness {
    fn new(db: RecordingDatabase) -> Self {
        Self {
            db,
            recorder: InMemoryRecorder::new(),
            editor: PostgresSchemaEditor::new(),
            handlers: DataMigrationRegistry::new(),
        }
    }

    fn ctx(&self) -> ApplyContext<'_, RecordingDatabase> {
        ApplyContext {
            db: &self.db,
            recorder: &self.recorder,
            editor: &self.editor,
            handlers: &self.handlers,
        }
    }

    async fn applied(&self) -> Vec<String> {
        self.recorder.list_applied().await.unwrap()
    }
}

#[tokio::test]
async fn test_forward_then_back_to_a_target() {
    let dir = tempdir().unwrap();
    two_migrations(dir.path());
    let harness = Harness::new(RecordingDatabase::new());

    let report = apply(&harness.ctx(), dir.path(), None, ApplyMode::Apply).await.unwrap();
    assert_eq!(report.applied, vec!["0001_initial", "0002_create_post"]);
    assert_eq!(harness.applied().await, vec!["0001_initial", "0002_create_post"]);

    let committed = harness.db.committed();
    let user_table = committed.iter().position(|s| s.starts_with("CREATE TABLE \"user\"")).unwrap();
    let post_table = committed.iter().position(|s| s.starts_with("CREATE TABLE \"post\"")).unwrap();
    assert!(user_table < post_table);

    let report = apply(&harness.ctx(), dir.path(), Some("0001"), ApplyMode::Apply).await.unwrap();
    assert_eq!(report.unapplied, vec!["0002_create_post"]);
    assert_eq!(harness.applied().await, vec!["0001_initial"]);
    assert!(harness.db.committed().last().unwrap().contains("DROP TABLE"));

    let report = apply(&harness.ctx(), dir.path(), Some("0001"), ApplyMode::Apply).await.unwrap();
    assert!(report.is_empty());
}

#[tokio::test]
async fn test_failed_migration_rolls_back_and_is_not_recorded() {
    let dir = tempdir().unwrap();
    two_migrations(dir.path());
    let harness = Harness::new(RecordingDatabase::failing_on("CREATE TABLE \"post\""));

    let err = apply(&harness.ctx(), dir.path(), None, ApplyMode::Apply).await.unwrap_err();
    match err {
        Error::MigrationApplyError { migration, message } => {
            assert_eq!(migration, "0002_create_post");
            assert!(message.starts_with("Create model Post"));
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(harness.applied().await, vec!["0001_initial"]);
    assert!(harness.db.committed().iter().all(|s| !s.contains("\"post\"")));
}

#[tokio::test]
async fn test_sql_preview_runs_nothing() {
    let dir = tempdir().unwrap();
    two_migrations(dir.path());
    let harness = Harness::new(RecordingDatabase::new());

    let report = apply(&harness.ctx(), dir.path(), None, ApplyMode::SqlPreview).await.unwrap();
    assert_eq!(report.preview[0], "-- 0001_initial");
    assert!(report.preview[1].starts_with("CREATE TABLE \"user\""));
    assert!(report.preview.contains(&"-- 0002_create_post".to_string()));

    assert!(harness.applied().await.is_empty());
    assert!(harness.db.committed().is_empty());
    assert!(!harness.recorder.has_table().await.unwrap());
}

#[tokio::test]
async fn test_sql_preview_skips_already_applied_migrations() {
    let dir = tempdir().unwrap();
    two_migrations(dir.path());
    let harness = Harness::new(RecordingDatabase::new());
    apply(&harness.ctx(), dir.path(), Some("0001"), ApplyMode::Apply).await.unwrap();

    let report = apply(&harness.ctx(), dir.path(), None, ApplyMode::SqlPreview).await.unwrap();
    assert_eq!(report.preview[0], "-- 0002_create_post");
    assert!(!report.preview.contains(&"-- 0001_initial".to_string()));
}

#[tokio::test]
async fn test_fake_only_touches_the_registry() {
    let dir = tempdir().unwrap();
    two_migrations(dir.path());
    let harness = Harness::new(RecordingDatabase::new());

    apply(&harness.ctx(), dir.path(), Some("0002_create_post"), ApplyMode::Fake)
        .await
        .unwrap();
    assert_eq!(harness.applied().await, vec!["0001_initial", "0002_create_post"]);
    assert!(harness.db.committed().is_empty());

    apply(&harness.ctx(), dir.path(), Some("zero"), ApplyMode::Fake).await.unwrap();
    assert!(harness.applied().await.is_empty());
}

#[tokio::test]
async fn test_irreversible_route_fails_before_running_anything() {
    let dir = tempdir().unwrap();
    two_migrations(dir.path());
    write_migration(
        dir.path(),
        3,
        "remove_post",
        &[Operation::RemoveModel(RemoveModel {
            name: "Post".to_string(),
            db_table: "post".to_string(),
        })],
    )
    .unwrap();
    let harness = Harness::new(RecordingDatabase::new());
    apply(&harness.ctx(), dir.path(), None, ApplyMode::Apply).await.unwrap();
    let before = harness.db.committed().len();

    let err = apply(&harness.ctx(), dir.path(), Some("0001"), ApplyMode::Apply).await.unwrap_err();
    assert!(matches!(err, Error::NotReversible(ref m) if m.starts_with("0003_remove_post")));
    assert_eq!(harness.db.committed().len(), before);
    assert_eq!(harness.applied().await.len(), 3);
}

struct Backfill {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl DataMigration for Backfill {
    async fn run(&self, executor: &mut dyn SqlExecutor, _editor: &dyn SchemaEditor) -> Result<()> {
        executor.execute("UPDATE \"user\" SET email = lower(email);").await?;
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_data_migrations_run_inside_the_transaction() {
    let dir = tempdir().unwrap();
    two_migrations(dir.path());
    write_migration(
        dir.path(),
        3,
        "lowercase_emails",
        &[Operation::RunCode(RunCode::named("lowercase_emails", Some("noop")))],
    )
    .unwrap();

    let forward_runs = Arc::new(AtomicUsize::new(0));
    let backward_runs = Arc::new(AtomicUsize::new(0));
    let counter = backward_runs.clone();
    let mut harness = Harness::new(RecordingDatabase::new());
    harness
        .handlers
        .register(
            "lowercase_emails",
            DataHandler::with_context(Backfill {
                runs: forward_runs.clone(),
            }),
        )
        .register(
            "noop",
            DataHandler::plain(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

    apply(&harness.ctx(), dir.path(), None, ApplyMode::Apply).await.unwrap();
    assert_eq!(forward_runs.load(Ordering::SeqCst), 1);
    assert!(harness.db.committed().iter().any(|s| s.contains("lower(email)")));

    apply(&harness.ctx(), dir.path(), Some("0002"), ApplyMode::Apply).await.unwrap();
    assert_eq!(backward_runs.load(Ordering::SeqCst), 1);
    assert_eq!(harness.applied().await, vec!["0001_initial", "0002_create_post"]);
}

#[tokio::test]
async fn test_unregistered_handler_fails_the_migration() {
    let dir = tempdir().unwrap();
    write_migration(dir.path(), 1, "seed", &[Operation::RunCode(RunCode::named("seed", None))]).unwrap();
    let harness = Harness::new(RecordingDatabase::new());

    let err = apply(&harness.ctx(), dir.path(), None, ApplyMode::Apply).await.unwrap_err();
    assert!(matches!(err, Error::MigrationApplyError { ref message, .. } if message.contains("`seed` is not registered")));
    assert!(harness.applied().await.is_empty());
}
