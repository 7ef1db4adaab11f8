//! Safety validation
//!
//! Pre-flight checks over a generated operation list and over the declared
//! schema. Hard failures always list every offender; risky alterations are
//! returned for confirmation instead of failing.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::operations::{AlterField, Operation};
use crate::schema::rename::Confirmer;
use crate::state::{DefaultValue, FieldOptions, FieldType, OptionKey, ProjectState};

/// CLI invocation suggested when a backfill is needed
const EMPTY_MIGRATION_HINT: &str = "schema_stride generate --empty --name backfill_<field>";

/// Outcome of a successful validation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    /// `Model.field` labels of null -> not null alterations without a default
    pub risky_alters: Vec<String>,
}

impl Validation {
    pub fn is_clean(&self) -> bool {
        self.risky_alters.is_empty()
    }
}

/// Whether a column of type `from` may be altered in place to `to`
pub fn is_supported_type_change(from: FieldType, to: FieldType) -> bool {
    if from == to {
        return true;
    }
    if let (Some(a), Some(b)) = (from.integer_rank(), to.integer_rank()) {
        return b > a;
    }
    from.is_char_like() && to.is_char_like()
}

/// Every table-level index column must resolve to a field or physical column
pub fn validate_index_columns(state: &ProjectState) -> Result<()> {
    let mut offenders = Vec::new();
    for model in state.model_states.values() {
        for index in &model.meta.indexes {
            for column in &index.columns {
                if model.resolve_column(column).is_none() {
                    offenders.push(format!("{}.{}", model.name, column));
                }
            }
        }
    }
    if offenders.is_empty() {
        Ok(())
    } else {
        Err(Error::with_offenders(
            "Index declarations reference unknown columns:",
            &offenders,
        ))
    }
}

fn label(op: &AlterField) -> String {
    format!("{}.{}", op.model_name, op.field_name)
}

fn default_of(options: &FieldOptions) -> Result<Option<DefaultValue>> {
    match options.get(OptionKey::Default) {
        Some(value) => DefaultValue::from_json(value),
        None => Ok(None),
    }
}

/// Whether the alteration leaves the column with a default that fills NULLs
fn ends_with_default(op: &AlterField) -> Result<bool> {
    let default = if op.new_options.contains(OptionKey::Default) {
        default_of(&op.new_options)?
    } else {
        default_of(&op.old_options)?
    };
    Ok(default.map_or(false, |d| d.can_backfill()))
}

fn makes_not_null(op: &AlterField) -> bool {
    op.old_options.flag(OptionKey::Null)
        && op.new_options.contains(OptionKey::Null)
        && !op.new_options.flag(OptionKey::Null)
}

fn non_nullable_add_error(offenders: &[String]) -> Error {
    Error::with_offenders(
        &format!(
            "Cannot generate migration:\n\
             You added a non-nullable field without a default (cannot backfill existing rows).\n\
             Fix by adding a default or use this safe sequence:\n  \
             1) Add the field as nullable.\n  \
             2) Create a data migration to backfill it (run: {}).\n  \
             3) Make the field non-nullable and generate again.\n\n\
             Problems:",
            EMPTY_MIGRATION_HINT
        ),
        offenders,
    )
}

/// Run every operation-level check.
///
/// Rejects non-nullable adds to existing models, unsupported type changes and
/// foreign key retargets that no model rename in the batch explains.
pub fn check_operations(operations: &[Operation]) -> Result<Validation> {
    let created: BTreeSet<&str> = operations
        .iter()
        .filter_map(|op| match op {
            Operation::CreateModel(create) => Some(create.name.as_str()),
            _ => None,
        })
        .collect();
    let table_renames: Vec<(String, String)> = operations
        .iter()
        .filter_map(|op| match op {
            Operation::RenameModel(rename) => Some((
                rename.old_db_table.to_lowercase(),
                rename.new_db_table.to_lowercase(),
            )),
            _ => None,
        })
        .collect();

    let mut unsafe_adds = Vec::new();
    let mut unsupported = Vec::new();
    let mut risky_alters = Vec::new();

    for operation in operations {
        match operation {
            Operation::AddField(add) if !created.contains(add.model_name.as_str()) => {
                let field = add.field_state()?;
                if !field.null && !field.primary_key && !field.has_backfill_default() {
                    unsafe_adds.push(format!("{}.{}", add.model_name, add.field_name));
                }
            }
            Operation::AlterField(alter) => {
                let old_type = alter.old_options.field_type()?;
                let new_type = alter.new_options.field_type()?;
                if let (Some(from), Some(to)) = (old_type, new_type) {
                    if !is_supported_type_change(from, to) {
                        unsupported.push(format!("{}: {} -> {}", label(alter), from, to));
                    }
                }

                let old_target = alter.old_options.get_str(OptionKey::RelatedTable);
                let new_target = alter.new_options.get_str(OptionKey::RelatedTable);
                if let (Some(from), Some(to)) = (old_target, new_target) {
                    let (from, to) = (from.to_lowercase(), to.to_lowercase());
                    if from != to && !table_renames.contains(&(from.clone(), to.clone())) {
                        unsupported.push(format!(
                            "{}: foreign key retargeted from {} to {}",
                            label(alter),
                            from,
                            to
                        ));
                    }
                }

                if makes_not_null(alter) && !ends_with_default(alter)? {
                    risky_alters.push(label(alter));
                }
            }
            _ => {}
        }
    }

    if !unsafe_adds.is_empty() {
        return Err(non_nullable_add_error(&unsafe_adds));
    }
    if !unsupported.is_empty() {
        return Err(Error::with_offenders(
            "Unsupported AlterField changes (write a manual migration instead):",
            &unsupported,
        ));
    }
    Ok(Validation { risky_alters })
}

/// Check the operations and put risky alterations in front of the confirmer.
///
/// Declining cancels the whole generation.
pub fn enforce(operations: &[Operation], confirmer: &mut dyn Confirmer) -> Result<()> {
    let validation = check_operations(operations)?;
    if validation.is_clean() {
        return Ok(());
    }
    tracing::warn!(fields = ?validation.risky_alters, "Null to not-null alteration without a default");
    if confirmer.confirm_risky_alters(&validation.risky_alters)? {
        Ok(())
    } else {
        Err(Error::Cancelled(format!(
            "Declined risky alterations: {}",
            validation.risky_alters.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::{AddField, CreateModel, RenameModel};
    use crate::schema::rename::{AcceptAll, DeclineAll};
    use crate::state::{FieldState, IndexDef, ModelState};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn user() -> ModelState {
        ModelState::new("User", "user").with_field(FieldState::new("id", FieldType::Int).primary_key())
    }

    fn add(model: &ModelState, field: FieldState) -> Operation {
        Operation::AddField(AddField::from_field(model, &field).unwrap())
    }

    fn alter(old: FieldState, new: FieldState) -> Operation {
        Operation::AlterField(AlterField {
            model_name: "User".into(),
            db_table: "user".into(),
            field_name: old.name.clone(),
            old_options: old.alter_options().unwrap(),
            new_options: new.alter_options().unwrap(),
            new_name: None,
        })
    }

    #[rstest]
    #[case(FieldType::Int, FieldType::Int, true)]
    #[case(FieldType::SmallInt, FieldType::BigInt, true)]
    #[case(FieldType::BigInt, FieldType::Int, false)]
    #[case(FieldType::Char, FieldType::CharEnum, true)]
    #[case(FieldType::Int, FieldType::Uuid, false)]
    #[case(FieldType::Char, FieldType::Text, false)]
    fn test_supported_type_changes(#[case] from: FieldType, #[case] to: FieldType, #[case] ok: bool) {
        assert_eq!(is_supported_type_change(from, to), ok);
    }

    #[test]
    fn test_non_nullable_add_to_existing_model_lists_every_field() {
        let ops = vec![
            add(&user(), FieldState::new("age", FieldType::Int)),
            add(&user(), FieldState::new("bio", FieldType::Text).nullable()),
            add(&user(), FieldState::new("score", FieldType::Int)),
        ];
        let message = check_operations(&ops).unwrap_err().to_string();
        assert!(message.contains("non-nullable field without a default"));
        assert!(message.contains("generate --empty"));
        assert!(message.ends_with("Problems:\n  - User.age\n  - User.score"));
    }

    #[test]
    fn test_non_nullable_add_to_new_model_is_fine() {
        let model = ModelState::new("Profile", "profile");
        let ops = vec![
            Operation::CreateModel(CreateModel::from_model_state(&model).unwrap()),
            add(&model, FieldState::new("age", FieldType::Int)),
        ];
        assert!(check_operations(&ops).unwrap().is_clean());
    }

    #[test]
    fn test_defaults_make_adds_safe_unless_callable() {
        let literal = add(&user(), FieldState::new("age", FieldType::Int).with_default(DefaultValue::literal(0i64)));
        let db = add(&user(), FieldState::new("seen", FieldType::Datetime).with_default(DefaultValue::db("now()")));
        assert!(check_operations(&[literal, db]).is_ok());

        let callable = add(&user(), FieldState::new("token", FieldType::Char).with_default(DefaultValue::Callable));
        assert!(check_operations(&[callable]).is_err());
    }

    #[test]
    fn test_unsupported_alters_are_collected() {
        let ops = vec![
            alter(FieldState::new("id", FieldType::Int), FieldState::new("id", FieldType::Uuid)),
            alter(FieldState::new("bio", FieldType::Char), FieldState::new("bio", FieldType::Text)),
        ];
        let message = check_operations(&ops).unwrap_err().to_string();
        assert!(message.contains("User.id: IntField -> UUIDField"));
        assert!(message.contains("User.bio: CharField -> TextField"));
    }

    #[test]
    fn test_fk_retarget_needs_matching_model_rename() {
        let retarget = alter(
            FieldState::foreign_key("author", "author", FieldType::Int),
            FieldState::foreign_key("author", "writer", FieldType::Int),
        );
        assert!(check_operations(&[retarget.clone()]).is_err());

        let rename = Operation::RenameModel(RenameModel {
            old_name: "Author".into(),
            new_name: "Writer".into(),
            old_db_table: "author".into(),
            new_db_table: "writer".into(),
        });
        assert!(check_operations(&[rename, retarget]).is_ok());
    }

    #[test]
    fn test_risky_alter_requires_confirmation() {
        let ops = vec![alter(
            FieldState::new("email", FieldType::Char).nullable(),
            FieldState::new("email", FieldType::Char),
        )];
        assert_eq!(check_operations(&ops).unwrap().risky_alters, vec!["User.email"]);
        assert!(enforce(&ops, &mut AcceptAll).is_ok());
        assert!(matches!(enforce(&ops, &mut DeclineAll), Err(Error::Cancelled(_))));

        let with_default = vec![alter(
            FieldState::new("email", FieldType::Char).nullable(),
            FieldState::new("email", FieldType::Char).with_default(DefaultValue::literal("")),
        )];
        assert!(check_operations(&with_default).unwrap().is_clean());
    }

    #[test]
    fn test_index_columns_must_resolve() {
        let state = ProjectState::new().with_model(
            user()
                .with_field(FieldState::foreign_key("team", "team", FieldType::Int))
                .with_index(IndexDef::new(&["team_id", "id"], false))
                .with_index(IndexDef::new(&["missing", "nope"], true)),
        );
        let message = validate_index_columns(&state).unwrap_err().to_string();
        assert!(message.ends_with("unknown columns:\n  - User.missing\n  - User.nope"));
    }
}
