//! Apply workflow
//!
//! Moves the database forward or backward to a target migration. Every
//! migration runs inside its own transaction together with its registry
//! entry, so a failure leaves both the schema and the registry where the
//! previous migration left them.

use std::path::Path;

use crate::db::editor::SchemaEditor;
use crate::db::executor::TransactionSource;
use crate::db::recorder::MigrationRecorder;
use crate::error::{Error, Result};
use crate::migrations::loader::{load_with_handlers, Migration};
use crate::operations::DataMigrationRegistry;

/// Target that unapplies every migration
pub const ZERO_TARGET: &str = "zero";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
    #[default]
    Apply,
    /// Print the SQL instead of running it
    SqlPreview,
    /// Update the registry only
    Fake,
}

/// Migrations to walk, in the order they are walked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Forward(Vec<String>),
    Backward(Vec<String>),
    Noop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub unapplied: Vec<String>,
    /// SQL preview lines, filled in [`ApplyMode::SqlPreview`]
    pub preview: Vec<String>,
}

impl ApplyReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.unapplied.is_empty() && self.preview.is_empty()
    }
}

/// Everything the apply workflow talks to
pub struct ApplyContext<'a, T: TransactionSource> {
    pub db: &'a T,
    pub recorder: &'a dyn MigrationRecorder,
    pub editor: &'a dyn SchemaEditor,
    pub handlers: &'a DataMigrationRegistry,
}

/// Full migration name for `target`, which may be a unique prefix
pub fn resolve_target_name(target: &str, names: &[String]) -> Result<String> {
    if let Some(exact) = names.iter().find(|n| n.as_str() == target) {
        return Ok(exact.clone());
    }

    let matches: Vec<String> = names.iter().filter(|n| n.starts_with(target)).cloned().collect();
    match matches.len() {
        1 => Ok(matches[0].clone()),
        0 => Err(Error::InvalidMigration(format!("No migration matches `{}`", target))),
        _ => Err(Error::with_offenders(
            &format!("Migration prefix `{}` is ambiguous; it matches:", target),
            &matches,
        )),
    }
}

/// Decide which migrations to apply or unapply to reach `target`.
///
/// `all` is in file order. With no target every pending migration goes
/// forward. A target that is already applied rolls back everything applied
/// after it, newest first.
pub fn plan_route(applied: &[String], all: &[String], target: Option<&str>) -> Result<Route> {
    let is_applied = |name: &String| applied.contains(name);

    let route = match target {
        None => Route::Forward(all.iter().filter(|n| !is_applied(n)).cloned().collect()),
        Some(ZERO_TARGET) => Route::Backward(all.iter().rev().filter(|n| is_applied(n)).cloned().collect()),
        Some(target) => {
            let name = resolve_target_name(target, all)?;
            let position = all.iter().position(|n| *n == name).unwrap_or(0);
            if is_applied(&name) {
                Route::Backward(
                    all[position + 1..]
                        .iter()
                        .rev()
                        .filter(|n| is_applied(n))
                        .cloned()
                        .collect(),
                )
            } else {
                Route::Forward(all[..=position].iter().filter(|n| !is_applied(n)).cloned().collect())
            }
        }
    };

    Ok(match route {
        Route::Forward(names) | Route::Backward(names) if names.is_empty() => Route::Noop,
        route => route,
    })
}

/// Load the migrations in `dir` and walk them toward `target`
pub async fn apply<T: TransactionSource>(
    ctx: &ApplyContext<'_, T>,
    dir: &Path,
    target: Option<&str>,
    mode: ApplyMode,
) -> Result<ApplyReport> {
    let migrations = load_with_handlers(dir, ctx.handlers)?;
    apply_migrations(ctx, &migrations, target, mode).await
}

/// Walk already loaded migrations toward `target`
pub async fn apply_migrations<T: TransactionSource>(
    ctx: &ApplyContext<'_, T>,
    migrations: &[Migration],
    target: Option<&str>,
    mode: ApplyMode,
) -> Result<ApplyReport> {
    // A preview leaves the database untouched, registry table included
    let applied = if mode == ApplyMode::SqlPreview {
        if ctx.recorder.has_table().await? {
            ctx.recorder.list_applied().await?
        } else {
            Vec::new()
        }
    } else {
        ctx.recorder.ensure_table().await?;
        ctx.recorder.list_applied().await?
    };
    let all: Vec<String> = migrations.iter().map(|m| m.name.clone()).collect();

    for name in applied.iter().filter(|n| !all.contains(n)) {
        tracing::warn!(migration = %name, "Applied migration has no file");
    }

    let route = plan_route(&applied, &all, target)?;
    let by_name = |name: &String| migrations.iter().find(|m| &m.name == name);
    let mut report = ApplyReport::default();

    match route {
        Route::Noop => {
            tracing::info!("Database is up to date");
        }
        Route::Forward(names) => {
            for migration in names.iter().filter_map(by_name) {
                match mode {
                    ApplyMode::SqlPreview => preview(ctx.editor, migration, false, &mut report.preview)?,
                    _ => forward(ctx, migration, mode == ApplyMode::Fake).await?,
                }
                report.applied.push(migration.name.clone());
            }
        }
        Route::Backward(names) => {
            let route: Vec<&Migration> = names.iter().filter_map(by_name).collect();
            if mode != ApplyMode::Fake {
                ensure_reversible(ctx.editor, &route)?;
            }
            for migration in route {
                match mode {
                    ApplyMode::SqlPreview => preview(ctx.editor, migration, true, &mut report.preview)?,
                    _ => backward(ctx, migration, mode == ApplyMode::Fake).await?,
                }
                report.unapplied.push(migration.name.clone());
            }
        }
    }

    Ok(report)
}

fn preview(editor: &dyn SchemaEditor, migration: &Migration, reverse: bool, out: &mut Vec<String>) -> Result<()> {
    out.push(format!("-- {}", migration.name));
    if reverse {
        for operation in migration.operations.iter().rev() {
            out.extend(operation.reverse_sql(editor)?);
        }
    } else {
        for operation in &migration.operations {
            out.extend(operation.to_sql(editor)?);
        }
    }
    Ok(())
}

/// Refuse a backward route up front if any step in it cannot be undone
fn ensure_reversible(editor: &dyn SchemaEditor, route: &[&Migration]) -> Result<()> {
    for migration in route {
        for operation in &migration.operations {
            if let Err(Error::NotReversible(reason)) = operation.reverse_sql(editor) {
                return Err(Error::NotReversible(format!("{}: {}", migration.name, reason)));
            }
        }
    }
    Ok(())
}

fn apply_error(migration: &Migration, step: &str, cause: Error) -> Error {
    Error::MigrationApplyError {
        migration: migration.name.clone(),
        message: format!("{}: {}", step, cause),
    }
}

async fn forward<T: TransactionSource>(ctx: &ApplyContext<'_, T>, migration: &Migration, fake: bool) -> Result<()> {
    tracing::info!(migration = %migration.name, fake, "Applying migration");
    let mut tx = ctx.db.begin().await?;

    if !fake {
        for operation in &migration.operations {
            if let Err(e) = operation.apply(&mut tx, ctx.editor).await {
                ctx.db.rollback(tx).await?;
                return Err(apply_error(migration, &operation.describe(), e));
            }
        }
    }
    if let Err(e) = ctx.recorder.record_applied(&mut tx, &migration.name).await {
        ctx.db.rollback(tx).await?;
        return Err(apply_error(migration, "recording", e));
    }

    ctx.db.commit(tx).await
}

async fn backward<T: TransactionSource>(ctx: &ApplyContext<'_, T>, migration: &Migration, fake: bool) -> Result<()> {
    tracing::info!(migration = %migration.name, fake, "Unapplying migration");
    let mut tx = ctx.db.begin().await?;

    if !fake {
        for operation in migration.operations.iter().rev() {
            if let Err(e) = operation.unapply(&mut tx, ctx.editor).await {
                ctx.db.rollback(tx).await?;
                return Err(apply_error(migration, &format!("reverting {}", operation), e));
            }
        }
    }
    if let Err(e) = ctx.recorder.unrecord_applied(&mut tx, &migration.name).await {
        ctx.db.rollback(tx).await?;
        return Err(apply_error(migration, "unrecording", e));
    }

    ctx.db.commit(tx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|n| n.to_string()).collect()
    }

    #[rstest]
    #[case("0002_add_email", "0002_add_email")]
    #[case("0002", "0002_add_email")]
    #[case("0003_add_e", "0003_add_email_index")]
    fn test_resolve_target_by_prefix(#[case] target: &str, #[case] expected: &str) {
        let all = names(&["0001_initial", "0002_add_email", "0003_add_email_index"]);
        assert_eq!(resolve_target_name(target, &all).unwrap(), expected);
    }

    #[test]
    fn test_ambiguous_prefix_lists_matches() {
        let all = names(&["0001_initial", "0002_add_email"]);
        let message = resolve_target_name("000", &all).unwrap_err().to_string();
        assert!(message.contains("\n  - 0001_initial\n  - 0002_add_email"));
        assert!(resolve_target_name("0009", &all).is_err());
    }

    #[test]
    fn test_routes() {
        let all = names(&["0001_a", "0002_b", "0003_c"]);
        let applied = names(&["0001_a"]);

        assert_eq!(plan_route(&applied, &all, None).unwrap(), Route::Forward(names(&["0002_b", "0003_c"])));
        assert_eq!(plan_route(&applied, &all, Some("0002")).unwrap(), Route::Forward(names(&["0002_b"])));
        assert_eq!(plan_route(&applied, &all, Some("0001")).unwrap(), Route::Noop);

        let applied = names(&["0001_a", "0002_b", "0003_c"]);
        assert_eq!(plan_route(&applied, &all, Some("0001_a")).unwrap(), Route::Backward(names(&["0003_c", "0002_b"])));
        assert_eq!(
            plan_route(&applied, &all, Some(ZERO_TARGET)).unwrap(),
            Route::Backward(names(&["0003_c", "0002_b", "0001_a"]))
        );
        assert_eq!(plan_route(&applied, &all, None).unwrap(), Route::Noop);
    }
}
