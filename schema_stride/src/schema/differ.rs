//! Schema differ
//!
//! Computes the ordered, rename-aware list of operations that turns one project
//! snapshot into another. Pure: neither input is modified.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{Error, Result};
use crate::operations::{
    AddField, AlterField, CreateIndex, CreateModel, Operation, RemoveField, RemoveIndex, RemoveModel,
    RenameField, RenameModel,
};
use crate::schema::rename::{detect_model_renames, renames_for, RenameMap, DEFAULT_MODEL_THRESHOLD};
use crate::state::{FieldOptions, FieldState, ModelState, OptionKey, ProjectState};
use crate::utils::naming::index_name;

/// Edit-script generator between two snapshots
#[derive(Debug, Clone, Copy)]
pub struct Differ {
    model_threshold: f64,
}

impl Default for Differ {
    fn default() -> Self {
        Self {
            model_threshold: DEFAULT_MODEL_THRESHOLD,
        }
    }
}

/// Diff with the default model-rename threshold
pub fn diff(old: &ProjectState, new: &ProjectState, renames: &RenameMap) -> Result<Vec<Operation>> {
    Differ::default().diff(old, new, renames)
}

impl Differ {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_threshold(mut self, threshold: f64) -> Self {
        self.model_threshold = threshold;
        self
    }

    /// Model pairs this differ treats as renames
    pub fn model_renames(&self, old: &ProjectState, new: &ProjectState) -> Vec<(String, String)> {
        detect_model_renames(
            &old.without_non_schema_fields(),
            &new.without_non_schema_fields(),
            self.model_threshold,
        )
    }

    pub fn diff(&self, old: &ProjectState, new: &ProjectState, renames: &RenameMap) -> Result<Vec<Operation>> {
        let old = old.without_non_schema_fields();
        let new = new.without_non_schema_fields();
        let model_renames = self.model_renames(&old, &new);
        let renamed_from: BTreeSet<&str> = model_renames.iter().map(|(o, _)| o.as_str()).collect();
        let renamed_to: BTreeSet<&str> = model_renames.iter().map(|(_, n)| n.as_str()).collect();

        let mut operations = Vec::new();

        let removed: Vec<&ModelState> = old
            .model_states
            .values()
            .filter(|m| !new.model_states.contains_key(&m.name) && !renamed_from.contains(m.name.as_str()))
            .collect();
        for model in topological_order(&removed)?.into_iter().rev() {
            operations.push(Operation::RemoveModel(RemoveModel {
                name: model.name.clone(),
                db_table: model.db_table.clone(),
            }));
        }

        // Renames are replayed on a working copy so relation labels in the
        // surviving models point at the new identities before fields are compared.
        let mut working = old.clone();
        for (old_name, new_name) in &model_renames {
            let (Some(from), Some(to)) = (old.model(old_name), new.model(new_name)) else {
                continue;
            };
            let operation = Operation::RenameModel(RenameModel {
                old_name: from.name.clone(),
                new_name: to.name.clone(),
                old_db_table: from.db_table.clone(),
                new_db_table: to.db_table.clone(),
            });
            operation.mutate_state(&mut working)?;
            operations.push(operation);
        }

        let added: Vec<&ModelState> = new
            .model_states
            .values()
            .filter(|m| !old.model_states.contains_key(&m.name) && !renamed_to.contains(m.name.as_str()))
            .collect();
        for model in topological_order(&added)? {
            operations.push(Operation::CreateModel(CreateModel::from_model_state(model)?));
            for index in model.canonical_indexes() {
                operations.push(Operation::CreateIndex(CreateIndex::new(model, &index)));
            }
        }

        let original_names: HashMap<&str, &str> = model_renames
            .iter()
            .map(|(o, n)| (n.as_str(), o.as_str()))
            .collect();
        for new_model in new.model_states.values() {
            let Some(old_model) = working.model(&new_model.name) else {
                continue;
            };
            let original = original_names
                .get(new_model.name.as_str())
                .and_then(|name| old.model(name))
                .unwrap_or(old_model);
            let confirmed = renames_for(renames, &new_model.name, &original.name);
            diff_model(old_model, new_model, original, confirmed, &mut operations)?;
        }

        tracing::debug!(operations = operations.len(), "Diff complete");
        Ok(operations)
    }
}

/// Kahn's algorithm over foreign keys inside the batch: referenced models first.
///
/// Ties resolve alphabetically. Self references are ignored. Leftover nodes mean a
/// cycle, which is an error naming every model in it.
fn topological_order<'m>(models: &[&'m ModelState]) -> Result<Vec<&'m ModelState>> {
    let by_table: HashMap<String, &str> = models
        .iter()
        .map(|m| (m.db_table.to_lowercase(), m.name.as_str()))
        .collect();
    let by_name: BTreeMap<&str, &'m ModelState> = models.iter().map(|m| (m.name.as_str(), *m)).collect();

    let mut dependencies: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for model in models {
        let deps: BTreeSet<&str> = model
            .referenced_tables()
            .iter()
            .filter_map(|table| by_table.get(table).copied())
            .filter(|name| *name != model.name)
            .collect();
        for dep in &deps {
            dependents.entry(*dep).or_default().insert(model.name.as_str());
        }
        dependencies.insert(model.name.as_str(), deps);
    }

    let mut ready: BTreeSet<&str> = dependencies
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(name, _)| *name)
        .collect();
    let mut ordered = Vec::with_capacity(models.len());

    while let Some(name) = ready.pop_first() {
        if let Some(model) = by_name.get(name) {
            ordered.push(*model);
        }
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(deps) = dependencies.get_mut(dependent) {
                deps.remove(name);
                if deps.is_empty() {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if ordered.len() < by_name.len() {
        let placed: BTreeSet<&str> = ordered.iter().map(|m| m.name.as_str()).collect();
        let cyclic: Vec<&str> = by_name.keys().copied().filter(|n| !placed.contains(n)).collect();
        return Err(Error::InvalidMigration(format!(
            "Cyclic foreign key dependency between models: {}",
            cyclic.join(", ")
        )));
    }
    Ok(ordered)
}

/// Options that differ between two full alter-ready sets
fn options_differ(old: &FieldOptions, new: &FieldOptions) -> bool {
    let (before, after) = FieldOptions::changed_only(old, new);
    !before.is_empty() || !after.is_empty()
}

/// Borrow a missing `referenced_type` from the other side so that a snapshot
/// written before the attribute existed does not produce a spurious alteration.
fn stabilize_referenced_type(old: &mut FieldOptions, new: &mut FieldOptions) {
    let missing = |o: &FieldOptions| o.get(OptionKey::ReferencedType).map_or(true, |v| v.is_null());
    if missing(old) {
        if let Some(value) = new.get(OptionKey::ReferencedType).cloned() {
            old.insert(OptionKey::ReferencedType, value);
        }
    } else if missing(new) {
        if let Some(value) = old.get(OptionKey::ReferencedType).cloned() {
            new.insert(OptionKey::ReferencedType, value);
        }
    }
}

fn alter_pair(old: &FieldState, new: &FieldState) -> Result<(FieldOptions, FieldOptions)> {
    let mut old_options = old.alter_options()?;
    let mut new_options = new.alter_options()?;
    if old.field_type.is_relation() && new.field_type.is_relation() {
        stabilize_referenced_type(&mut old_options, &mut new_options);
    }
    Ok((old_options, new_options))
}

/// Field and index operations for one surviving model.
///
/// `old_model` comes from the working copy (renames already applied); `original`
/// is the model as it was before any rename and names the indexes that exist.
fn diff_model(
    old_model: &ModelState,
    new_model: &ModelState,
    original: &ModelState,
    confirmed: Option<&BTreeMap<String, String>>,
    operations: &mut Vec<Operation>,
) -> Result<()> {
    let old_fields: BTreeMap<String, &FieldState> = old_model
        .schema_fields()
        .map(|f| (f.name.to_lowercase(), f))
        .collect();
    let new_fields: BTreeMap<String, &FieldState> = new_model
        .schema_fields()
        .map(|f| (f.name.to_lowercase(), f))
        .collect();

    let mut renames: BTreeMap<String, String> = BTreeMap::new();
    for (from, to) in confirmed.into_iter().flatten() {
        let (from, to) = (from.to_lowercase(), to.to_lowercase());
        let usable = old_fields.contains_key(&from)
            && new_fields.contains_key(&to)
            && !new_fields.contains_key(&from)
            && !old_fields.contains_key(&to)
            && !renames.values().any(|taken| *taken == to);
        if usable {
            renames.insert(from, to);
        } else {
            tracing::warn!(
                model = %new_model.name,
                old = %from,
                new = %to,
                "Ignoring confirmed rename that no longer matches the schema"
            );
        }
    }
    let renamed_to: BTreeSet<&String> = renames.values().collect();

    let old_indexes = old_model.canonical_indexes();
    let new_indexes = new_model.canonical_indexes();

    for index in old_indexes.difference(&new_indexes) {
        operations.push(Operation::RemoveIndex(RemoveIndex {
            name: index_name(&original.db_table, &index.columns, index.unique),
            ..RemoveIndex::new(old_model, index)
        }));
    }

    for (from, to) in &renames {
        let (old_field, new_field) = (old_fields[from], new_fields[to]);
        let (old_options, new_options) = alter_pair(old_field, new_field)?;
        let (mut old_stripped, mut new_stripped) = (old_options.clone(), new_options.clone());
        old_stripped.remove(OptionKey::DbColumn);
        new_stripped.remove(OptionKey::DbColumn);

        if options_differ(&old_stripped, &new_stripped) {
            operations.push(Operation::AlterField(AlterField {
                model_name: new_model.name.clone(),
                db_table: new_model.db_table.clone(),
                field_name: old_field.name.clone(),
                old_options,
                new_options,
                new_name: Some(new_field.name.clone()),
            }));
        } else {
            operations.push(Operation::RenameField(RenameField {
                model_name: new_model.name.clone(),
                db_table: new_model.db_table.clone(),
                old_name: old_field.name.clone(),
                new_name: new_field.name.clone(),
                old_column: old_field.column_name(),
                new_column: new_field.column_name(),
            }));
        }
    }

    for (name, field) in &old_fields {
        if !new_fields.contains_key(name) && !renames.contains_key(name) {
            operations.push(Operation::RemoveField(RemoveField {
                model_name: new_model.name.clone(),
                db_table: new_model.db_table.clone(),
                field_name: field.name.clone(),
                db_column: field.column_name(),
            }));
        }
    }

    for (name, field) in &new_fields {
        if !old_fields.contains_key(name) && !renamed_to.contains(name) {
            operations.push(Operation::AddField(AddField::from_field(new_model, field)?));
        }
    }

    for (name, new_field) in &new_fields {
        let Some(old_field) = old_fields.get(name) else {
            continue;
        };
        let (old_options, new_options) = alter_pair(old_field, new_field)?;
        if options_differ(&old_options, &new_options) {
            operations.push(Operation::AlterField(AlterField {
                model_name: new_model.name.clone(),
                db_table: new_model.db_table.clone(),
                field_name: old_field.name.clone(),
                old_options,
                new_options,
                new_name: None,
            }));
        }
    }

    for index in new_indexes.difference(&old_indexes) {
        operations.push(Operation::CreateIndex(CreateIndex::new(new_model, index)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FieldType, IndexDef};
    use pretty_assertions::assert_eq;

    fn kinds(ops: &[Operation]) -> Vec<String> {
        ops.iter().map(|op| op.to_string()).collect()
    }

    fn model(name: &str) -> ModelState {
        ModelState::new(name, &name.to_lowercase())
            .with_field(FieldState::new("id", FieldType::Int).primary_key())
    }

    #[test]
    fn test_identical_states_produce_nothing() {
        let state = ProjectState::new().with_model(
            model("Book")
                .with_field(FieldState::new("title", FieldType::Char))
                .with_index(IndexDef::new(&["title"], false)),
        );
        assert!(diff(&state, &state, &RenameMap::new()).unwrap().is_empty());
    }

    #[test]
    fn test_create_order_follows_foreign_keys() {
        let new = ProjectState::new()
            .with_model(model("Book").with_field(FieldState::foreign_key("author", "author", FieldType::Int)))
            .with_model(model("Author"))
            .with_model(model("Review").with_field(FieldState::foreign_key("book", "book", FieldType::Int)));

        let ops = diff(&ProjectState::new(), &new, &RenameMap::new()).unwrap();
        assert_eq!(
            kinds(&ops),
            vec!["Create model Author", "Create model Book", "Create model Review"]
        );

        let ops = diff(&new, &ProjectState::new(), &RenameMap::new()).unwrap();
        assert_eq!(
            kinds(&ops),
            vec!["Remove model Review", "Remove model Book", "Remove model Author"]
        );
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let new = ProjectState::new()
            .with_model(model("Category").with_field(FieldState::foreign_key("parent", "category", FieldType::Int).nullable()));
        assert_eq!(diff(&ProjectState::new(), &new, &RenameMap::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_mutual_references_are_rejected() {
        let new = ProjectState::new()
            .with_model(model("A").with_field(FieldState::foreign_key("b", "b", FieldType::Int)))
            .with_model(model("B").with_field(FieldState::foreign_key("a", "a", FieldType::Int)))
            .with_model(model("C"));
        let err = diff(&ProjectState::new(), &new, &RenameMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid migration: Cyclic foreign key dependency between models: A, B"
        );
    }

    #[test]
    fn test_field_operations_are_grouped_and_sorted() {
        let old = ProjectState::new().with_model(
            model("Book")
                .with_field(FieldState::new("zeta", FieldType::Text))
                .with_field(FieldState::new("alpha", FieldType::Text))
                .with_field(FieldState::new("title", FieldType::Char).with_max_length(100)),
        );
        let new = ProjectState::new().with_model(
            model("Book")
                .with_field(FieldState::new("title", FieldType::Char).with_max_length(200))
                .with_field(FieldState::new("summary", FieldType::Text).nullable())
                .with_field(FieldState::new("blurb", FieldType::Text).nullable()),
        );

        let ops = diff(&old, &new, &RenameMap::new()).unwrap();
        assert_eq!(
            kinds(&ops),
            vec![
                "Remove field alpha from Book",
                "Remove field zeta from Book",
                "Add field blurb to Book",
                "Add field summary to Book",
                "Alter field title on Book",
            ]
        );
    }

    #[test]
    fn test_fk_removal_uses_backing_column() {
        let old = ProjectState::new()
            .with_model(model("Author"))
            .with_model(model("Book").with_field(FieldState::foreign_key("author", "author", FieldType::Int)));
        let new = ProjectState::new().with_model(model("Author")).with_model(model("Book"));

        let ops = diff(&old, &new, &RenameMap::new()).unwrap();
        let Operation::RemoveField(remove) = &ops[0] else {
            panic!("expected RemoveField, got {:?}", ops);
        };
        assert_eq!(remove.db_column, "author_id");
    }

    #[test]
    fn test_confirmed_rename_with_changes_becomes_alter() {
        let old = ProjectState::new()
            .with_model(model("Book").with_field(FieldState::new("title", FieldType::Char).with_max_length(100)));
        let new = ProjectState::new()
            .with_model(model("Book").with_field(FieldState::new("name", FieldType::Char).with_max_length(150)));
        let renames = RenameMap::from([(
            "Book".to_string(),
            BTreeMap::from([("title".to_string(), "name".to_string())]),
        )]);

        let ops = diff(&old, &new, &renames).unwrap();
        assert_eq!(kinds(&ops), vec!["Alter field title on Book (renamed to name)"]);
    }

    #[test]
    fn test_stale_confirmed_rename_is_ignored() {
        let old = ProjectState::new().with_model(model("Book").with_field(FieldState::new("title", FieldType::Char)));
        let new = old.clone();
        let renames = RenameMap::from([(
            "Book".to_string(),
            BTreeMap::from([("title".to_string(), "name".to_string())]),
        )]);
        assert!(diff(&old, &new, &renames).unwrap().is_empty());
    }

    #[test]
    fn test_index_changes_bracket_field_changes() {
        let old = ProjectState::new().with_model(
            model("Book")
                .with_field(FieldState::new("title", FieldType::Char))
                .with_field(FieldState::new("year", FieldType::Int))
                .with_index(IndexDef::new(&["title", "year"], false)),
        );
        let new = ProjectState::new().with_model(
            model("Book")
                .with_field(FieldState::new("title", FieldType::Char))
                .with_field(FieldState::new("isbn", FieldType::Char).nullable())
                .with_index(IndexDef::new(&["isbn"], true)),
        );

        let ops = diff(&old, &new, &RenameMap::new()).unwrap();
        assert_eq!(
            kinds(&ops),
            vec![
                "Remove index book_title_year_idx from Book",
                "Remove field year from Book",
                "Add field isbn to Book",
                "Create index book_isbn_uniq on Book",
            ]
        );
    }

    #[test]
    fn test_missing_referenced_type_on_one_side_is_not_a_change() {
        let mut legacy = FieldState::foreign_key("author", "author", FieldType::Int);
        legacy.referenced_type = None;
        let old = ProjectState::new()
            .with_model(model("Author"))
            .with_model(model("Book").with_field(legacy));
        let new = ProjectState::new()
            .with_model(model("Author"))
            .with_model(model("Book").with_field(FieldState::foreign_key("author", "author", FieldType::Int)));

        assert!(diff(&old, &new, &RenameMap::new()).unwrap().is_empty());
    }
}
