//! Operation set
//!
//! Every schema change is one [`Operation`]. Each kind can apply itself through a
//! schema editor, undo itself (unless it destroys data), replay its effect on an
//! in-memory [`ProjectState`], and render a stable representation for migration
//! files.

pub mod data;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::db::editor::{ColumnAlteration, SchemaEditor};
use crate::db::executor::SqlExecutor;
use crate::error::{Error, Result};
use crate::state::{
    backing_column, FieldOptions, FieldState, FieldType, IndexDef, ModelState, OptionKey, ProjectState,
};
use crate::utils::naming::index_name;

pub use data::{DataHandler, DataMigration, DataMigrationRegistry};

/// Conventional audit columns, placed right after the primary key
const AUDIT_FIELDS: &[&str] = &[
    "created_at",
    "updated_at",
    "deleted_at",
    "created_by",
    "updated_by",
    "deleted_by",
];

fn column_rank(field: &FieldState) -> u8 {
    if field.primary_key {
        0
    } else if AUDIT_FIELDS.contains(&field.name.to_lowercase().as_str()) {
        1
    } else if field.field_type.is_relation() {
        3
    } else {
        2
    }
}

/// A field as written in a `CreateModel`: name, type tag and compacted options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec(pub String, pub FieldType, pub FieldOptions);

impl FieldSpec {
    /// Compacted spec for a field; char-like fields always carry `max_length`
    pub fn from_field(field: &FieldState) -> Result<Self> {
        let mut options = field.options()?.compact();
        if field.field_type.is_char_like() && !options.contains(OptionKey::MaxLength) {
            options.insert(OptionKey::MaxLength, 255);
        }
        options.ensure_renderable()?;
        Ok(FieldSpec(field.name.clone(), field.field_type, options))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn field_type(&self) -> FieldType {
        self.1
    }

    pub fn options(&self) -> &FieldOptions {
        &self.2
    }

    pub fn to_field_state(&self) -> Result<FieldState> {
        let mut field = FieldState::new(&self.0, self.1);
        field.merge_options(&self.2)?;
        field.field_type = self.1;
        Ok(field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateModel {
    pub name: String,
    pub db_table: String,
    pub fields: Vec<FieldSpec>,
}

impl CreateModel {
    /// Build from a snapshot, dropping non-schema fields and ordering columns
    pub fn from_model_state(model: &ModelState) -> Result<Self> {
        let mut fields: Vec<&FieldState> = model.schema_fields().collect();
        fields.sort_by_key(|f| column_rank(f));
        Ok(Self {
            name: model.name.clone(),
            db_table: model.db_table.clone(),
            fields: fields
                .into_iter()
                .map(FieldSpec::from_field)
                .collect::<Result<Vec<_>>>()?,
        })
    }

    fn table(&self) -> String {
        if self.db_table.is_empty() {
            self.name.to_lowercase()
        } else {
            self.db_table.clone()
        }
    }

    fn field_states(&self) -> Result<Vec<FieldState>> {
        self.fields.iter().map(FieldSpec::to_field_state).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveModel {
    pub name: String,
    pub db_table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameModel {
    pub old_name: String,
    pub new_name: String,
    pub old_db_table: String,
    pub new_db_table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddField {
    pub model_name: String,
    pub db_table: String,
    pub field_name: String,
    pub field_type: FieldType,
    pub options: FieldOptions,
}

impl AddField {
    pub fn from_field(model: &ModelState, field: &FieldState) -> Result<Self> {
        let spec = FieldSpec::from_field(field)?;
        Ok(Self {
            model_name: model.name.clone(),
            db_table: model.db_table.clone(),
            field_name: field.name.clone(),
            field_type: field.field_type,
            options: spec.2,
        })
    }

    pub fn field_state(&self) -> Result<FieldState> {
        FieldSpec(self.field_name.clone(), self.field_type, self.options.clone()).to_field_state()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveField {
    pub model_name: String,
    pub db_table: String,
    pub field_name: String,
    /// Physical column that is dropped
    pub db_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterField {
    pub model_name: String,
    pub db_table: String,
    pub field_name: String,
    pub old_options: FieldOptions,
    pub new_options: FieldOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
}

impl AlterField {
    fn alteration(&self) -> ColumnAlteration<'_> {
        ColumnAlteration {
            field_name: &self.field_name,
            old: &self.old_options,
            new: &self.new_options,
            new_name: self.new_name.as_deref(),
        }
    }

    /// Changed keys only, plus the keys needed to address and type the column
    pub fn compacted(&self) -> Result<AlterField> {
        let (mut old, mut new) = FieldOptions::changed_only(&self.old_options, &self.new_options);

        let old_type = self.old_options.field_type()?;
        let new_type = self.new_options.field_type()?.or(old_type);
        let mut keep = vec![OptionKey::Type];
        for field_type in [old_type, new_type].into_iter().flatten() {
            if field_type.is_char_like() {
                keep.push(OptionKey::MaxLength);
            }
            if field_type == FieldType::Decimal {
                keep.extend([OptionKey::MaxDigits, OptionKey::DecimalPlaces]);
            }
            if field_type.is_relation() {
                keep.push(OptionKey::ReferencedType);
            }
        }
        keep.push(OptionKey::DbColumn);

        for key in keep {
            for (source, target) in [(&self.old_options, &mut old), (&self.new_options, &mut new)] {
                match source.get(key) {
                    Some(value) if !value.is_null() && !target.contains(key) => {
                        target.insert(key, value.clone())
                    }
                    _ => {}
                }
            }
        }

        old.ensure_renderable()?;
        new.ensure_renderable()?;
        Ok(AlterField {
            old_options: old,
            new_options: new,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameField {
    pub model_name: String,
    pub db_table: String,
    pub old_name: String,
    pub new_name: String,
    pub old_column: String,
    pub new_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateIndex {
    pub model_name: String,
    pub db_table: String,
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl CreateIndex {
    pub fn new(model: &ModelState, index: &IndexDef) -> Self {
        Self {
            model_name: model.name.clone(),
            db_table: model.db_table.clone(),
            name: index_name(&model.db_table, &index.columns, index.unique),
            columns: index.columns.clone(),
            unique: index.unique,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveIndex {
    pub model_name: String,
    pub db_table: String,
    pub name: String,
    /// Needed to recreate the index on unapply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl RemoveIndex {
    pub fn new(model: &ModelState, index: &IndexDef) -> Self {
        Self {
            model_name: model.name.clone(),
            db_table: model.db_table.clone(),
            name: index_name(&model.db_table, &index.columns, index.unique),
            columns: index.columns.clone(),
            unique: index.unique,
        }
    }
}

/// Data-only step backed by registered handlers
#[derive(Clone, Serialize, Deserialize)]
pub struct RunCode {
    pub forward: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backward: Option<String>,
    #[serde(skip)]
    pub(crate) forward_handler: Option<DataHandler>,
    #[serde(skip)]
    pub(crate) backward_handler: Option<DataHandler>,
}

impl RunCode {
    pub fn new(forward: &str, handler: DataHandler) -> Self {
        Self {
            forward: forward.to_string(),
            backward: None,
            forward_handler: Some(handler),
            backward_handler: None,
        }
    }

    /// Reference to a handler that is attached later from a registry
    pub fn named(forward: &str, backward: Option<&str>) -> Self {
        Self {
            forward: forward.to_string(),
            backward: backward.map(str::to_string),
            forward_handler: None,
            backward_handler: None,
        }
    }

    pub fn with_backward(mut self, backward: &str, handler: DataHandler) -> Self {
        self.backward = Some(backward.to_string());
        self.backward_handler = Some(handler);
        self
    }
}

impl fmt::Debug for RunCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunCode")
            .field("forward", &self.forward)
            .field("backward", &self.backward)
            .field("attached", &self.forward_handler.is_some())
            .finish()
    }
}

impl PartialEq for RunCode {
    fn eq(&self, other: &Self) -> bool {
        self.forward == other.forward && self.backward == other.backward
    }
}

/// One schema edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Operation {
    CreateModel(CreateModel),
    RemoveModel(RemoveModel),
    RenameModel(RenameModel),
    AddField(AddField),
    RemoveField(RemoveField),
    AlterField(AlterField),
    RenameField(RenameField),
    CreateIndex(CreateIndex),
    RemoveIndex(RemoveIndex),
    RunCode(RunCode),
}

fn missing_model(name: &str) -> Error {
    Error::StateError(format!("Unknown model `{}`", name))
}

fn missing_field(model: &str, field: &str) -> Error {
    Error::StateError(format!("Unknown field `{}.{}`", model, field))
}

impl Operation {
    /// Variant name
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateModel(_) => "CreateModel",
            Operation::RemoveModel(_) => "RemoveModel",
            Operation::RenameModel(_) => "RenameModel",
            Operation::AddField(_) => "AddField",
            Operation::RemoveField(_) => "RemoveField",
            Operation::AlterField(_) => "AlterField",
            Operation::RenameField(_) => "RenameField",
            Operation::CreateIndex(_) => "CreateIndex",
            Operation::RemoveIndex(_) => "RemoveIndex",
            Operation::RunCode(_) => "RunCode",
        }
    }

    /// Perform the schema change
    pub async fn apply(&self, executor: &mut dyn SqlExecutor, editor: &dyn SchemaEditor) -> Result<()> {
        match self {
            Operation::CreateModel(op) => {
                editor
                    .create_model(executor, &op.table(), &op.field_states()?)
                    .await
            }
            Operation::RemoveModel(op) => editor.drop_model(executor, &op.db_table).await,
            Operation::RenameModel(op) => {
                editor
                    .rename_model(executor, &op.old_db_table, &op.new_db_table)
                    .await
            }
            Operation::AddField(op) => editor.add_field(executor, &op.db_table, &op.field_state()?).await,
            Operation::RemoveField(op) => editor.remove_field(executor, &op.db_table, &op.db_column).await,
            Operation::AlterField(op) => editor.alter_field(executor, &op.db_table, &op.alteration()).await,
            Operation::RenameField(op) => {
                editor
                    .rename_field(executor, &op.db_table, &op.old_column, &op.new_column)
                    .await
            }
            Operation::CreateIndex(op) => {
                editor
                    .create_index(executor, &op.db_table, &op.name, &op.columns, op.unique)
                    .await
            }
            Operation::RemoveIndex(op) => editor.drop_index(executor, &op.name).await,
            Operation::RunCode(op) => match &op.forward_handler {
                Some(handler) => handler.invoke(executor, editor).await,
                None => Err(data::missing_handler(&op.forward)),
            },
        }
    }

    /// Undo the schema change
    pub async fn unapply(&self, executor: &mut dyn SqlExecutor, editor: &dyn SchemaEditor) -> Result<()> {
        match self {
            Operation::CreateModel(op) => editor.drop_model(executor, &op.table()).await,
            Operation::RemoveModel(op) => Err(Error::NotReversible(format!(
                "RemoveModel {} dropped its data",
                op.name
            ))),
            Operation::RenameModel(op) => {
                editor
                    .rename_model(executor, &op.new_db_table, &op.old_db_table)
                    .await
            }
            Operation::AddField(op) => {
                let column = op.field_state()?.column_name();
                editor.remove_field(executor, &op.db_table, &column).await
            }
            Operation::RemoveField(op) => Err(Error::NotReversible(format!(
                "RemoveField {}.{} dropped its data",
                op.model_name, op.field_name
            ))),
            Operation::AlterField(op) => {
                editor
                    .alter_field(executor, &op.db_table, &op.alteration().reversed())
                    .await
            }
            Operation::RenameField(op) => {
                editor
                    .rename_field(executor, &op.db_table, &op.new_column, &op.old_column)
                    .await
            }
            Operation::CreateIndex(op) => editor.drop_index(executor, &op.name).await,
            Operation::RemoveIndex(op) => {
                Self::ensure_index_columns(op)?;
                editor
                    .create_index(executor, &op.db_table, &op.name, &op.columns, op.unique)
                    .await
            }
            Operation::RunCode(op) => match (&op.backward, &op.backward_handler) {
                (None, _) => Err(Error::NotReversible(format!(
                    "RunCode {} has no backward handler",
                    op.forward
                ))),
                (Some(name), None) => Err(data::missing_handler(name)),
                (Some(_), Some(handler)) => handler.invoke(executor, editor).await,
            },
        }
    }

    fn ensure_index_columns(op: &RemoveIndex) -> Result<()> {
        if op.columns.is_empty() {
            return Err(Error::NotReversible(format!(
                "RemoveIndex {} does not know its columns",
                op.name
            )));
        }
        Ok(())
    }

    /// SQL that `apply` runs. Data steps render nothing.
    pub fn to_sql(&self, editor: &dyn SchemaEditor) -> Result<Vec<String>> {
        Ok(match self {
            Operation::CreateModel(op) => editor.sql_create_model(&op.table(), &op.field_states()?)?,
            Operation::RemoveModel(op) => editor.sql_drop_model(&op.db_table),
            Operation::RenameModel(op) => editor.sql_rename_model(&op.old_db_table, &op.new_db_table),
            Operation::AddField(op) => editor.sql_add_field(&op.db_table, &op.field_state()?)?,
            Operation::RemoveField(op) => editor.sql_remove_field(&op.db_table, &op.db_column),
            Operation::AlterField(op) => editor.sql_alter_field(&op.db_table, &op.alteration())?,
            Operation::RenameField(op) => editor.sql_rename_field(&op.db_table, &op.old_column, &op.new_column),
            Operation::CreateIndex(op) => editor.sql_create_index(&op.db_table, &op.name, &op.columns, op.unique),
            Operation::RemoveIndex(op) => editor.sql_drop_index(&op.name),
            Operation::RunCode(_) => Vec::new(),
        })
    }

    /// SQL that `unapply` runs
    pub fn reverse_sql(&self, editor: &dyn SchemaEditor) -> Result<Vec<String>> {
        Ok(match self {
            Operation::CreateModel(op) => editor.sql_drop_model(&op.table()),
            Operation::RemoveModel(_) | Operation::RemoveField(_) => {
                return Err(Error::NotReversible(self.describe()))
            }
            Operation::RenameModel(op) => editor.sql_rename_model(&op.new_db_table, &op.old_db_table),
            Operation::AddField(op) => {
                editor.sql_remove_field(&op.db_table, &op.field_state()?.column_name())
            }
            Operation::AlterField(op) => editor.sql_alter_field(&op.db_table, &op.alteration().reversed())?,
            Operation::RenameField(op) => editor.sql_rename_field(&op.db_table, &op.new_column, &op.old_column),
            Operation::CreateIndex(op) => editor.sql_drop_index(&op.name),
            Operation::RemoveIndex(op) => {
                Self::ensure_index_columns(op)?;
                editor.sql_create_index(&op.db_table, &op.name, &op.columns, op.unique)
            }
            Operation::RunCode(op) => {
                if op.backward.is_none() {
                    return Err(Error::NotReversible(self.describe()));
                }
                Vec::new()
            }
        })
    }

    /// Replay the change on an in-memory snapshot
    pub fn mutate_state(&self, state: &mut ProjectState) -> Result<()> {
        match self {
            Operation::CreateModel(op) => {
                if state.model(&op.name).is_some() {
                    return Err(Error::StateError(format!("Model `{}` already exists", op.name)));
                }
                let mut model = ModelState::new(&op.name, &op.table());
                for field in op.field_states()? {
                    model.add_field(field);
                }
                state.add_model(model);
            }
            Operation::RemoveModel(op) => {
                state.remove_model(&op.name).ok_or_else(|| missing_model(&op.name))?;
            }
            Operation::RenameModel(op) => {
                let mut model = state
                    .remove_model(&op.old_name)
                    .ok_or_else(|| missing_model(&op.old_name))?;
                model.name = op.new_name.clone();
                model.db_table = op.new_db_table.clone();
                state.add_model(model);
                state.rewrite_relation_labels(&op.old_name, &op.old_db_table, &op.new_name, &op.new_db_table);
            }
            Operation::AddField(op) => {
                let field = op.field_state()?;
                let model = state.model_mut(&op.model_name)?;
                if model.field(&op.field_name).is_some() {
                    return Err(Error::StateError(format!(
                        "Field `{}.{}` already exists",
                        op.model_name, op.field_name
                    )));
                }
                model.add_field(field);
            }
            Operation::RemoveField(op) => {
                state
                    .model_mut(&op.model_name)?
                    .remove_field(&op.field_name)
                    .ok_or_else(|| missing_field(&op.model_name, &op.field_name))?;
            }
            Operation::AlterField(op) => {
                let model = state.model_mut(&op.model_name)?;
                match &op.new_name {
                    None => {
                        let field = model
                            .field_mut(&op.field_name)
                            .ok_or_else(|| missing_field(&op.model_name, &op.field_name))?;
                        field.merge_options(&op.new_options)?;
                    }
                    Some(new_name) => {
                        let mut field = model
                            .remove_field(&op.field_name)
                            .ok_or_else(|| missing_field(&op.model_name, &op.field_name))?;
                        field.merge_options(&op.new_options)?;
                        field.name = new_name.clone();
                        model.add_field(field);
                    }
                }
            }
            Operation::RenameField(op) => {
                let model = state.model_mut(&op.model_name)?;
                let mut field = model
                    .remove_field(&op.old_name)
                    .ok_or_else(|| missing_field(&op.model_name, &op.old_name))?;
                field.db_column = if field.db_column.is_some()
                    || op.new_column != backing_column(&op.new_name, field.field_type)
                {
                    Some(op.new_column.clone())
                } else {
                    None
                };
                field.name = op.new_name.clone();
                model.add_field(field);
            }
            Operation::CreateIndex(op) => {
                let model = state.model_mut(&op.model_name)?;
                let index = IndexDef::new(&op.columns, op.unique);
                if !model.meta.indexes.contains(&index) {
                    model.meta.indexes.push(index);
                }
            }
            Operation::RemoveIndex(op) => {
                let model = state.model_mut(&op.model_name)?;
                let target = IndexDef::new(&op.columns, op.unique);
                let resolve = |index: &IndexDef, model: &ModelState| IndexDef {
                    columns: index
                        .columns
                        .iter()
                        .map(|c| model.resolve_column(c).unwrap_or_else(|| c.clone()))
                        .collect(),
                    unique: index.unique,
                };
                let target = resolve(&target, &*model);
                let snapshot = model.clone();
                model.meta.indexes.retain(|index| {
                    let resolved = resolve(index, &snapshot);
                    if op.columns.is_empty() {
                        index_name(&snapshot.db_table, &resolved.columns, resolved.unique) != op.name
                    } else {
                        resolved != target
                    }
                });
            }
            Operation::RunCode(_) => {}
        }
        Ok(())
    }

    /// Stable representation for migration files
    pub fn render_code(&self) -> Result<Value> {
        let rendered = match self {
            Operation::AlterField(op) => Operation::AlterField(op.compacted()?),
            Operation::CreateModel(op) => {
                for spec in &op.fields {
                    spec.options().ensure_renderable()?;
                }
                self.clone()
            }
            Operation::AddField(op) => {
                op.options.ensure_renderable()?;
                self.clone()
            }
            _ => self.clone(),
        };
        Ok(serde_json::to_value(rendered)?)
    }

    /// Rebuild an operation from its rendered form
    pub fn from_code(value: Value) -> Result<Operation> {
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidMigration(format!("Malformed operation: {}", e)))
    }

    /// One-line human description
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateModel(op) => write!(f, "Create model {}", op.name),
            Operation::RemoveModel(op) => write!(f, "Remove model {}", op.name),
            Operation::RenameModel(op) => write!(f, "Rename model {} to {}", op.old_name, op.new_name),
            Operation::AddField(op) => write!(f, "Add field {} to {}", op.field_name, op.model_name),
            Operation::RemoveField(op) => write!(f, "Remove field {} from {}", op.field_name, op.model_name),
            Operation::AlterField(op) => match &op.new_name {
                Some(new_name) => write!(
                    f,
                    "Alter field {} on {} (renamed to {})",
                    op.field_name, op.model_name, new_name
                ),
                None => write!(f, "Alter field {} on {}", op.field_name, op.model_name),
            },
            Operation::RenameField(op) => write!(
                f,
                "Rename field {} on {} to {}",
                op.old_name, op.model_name, op.new_name
            ),
            Operation::CreateIndex(op) => write!(f, "Create index {} on {}", op.name, op.model_name),
            Operation::RemoveIndex(op) => write!(f, "Remove index {} from {}", op.name, op.model_name),
            Operation::RunCode(op) => write!(f, "Run data migration {}", op.forward),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::editor::PostgresSchemaEditor;
    use crate::db::executor::RecordingExecutor;
    use crate::state::DefaultValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn author() -> ModelState {
        ModelState::new("Author", "author")
            .with_field(FieldState::new("id", FieldType::Int).primary_key().generated())
            .with_field(FieldState::new("name", FieldType::Char).with_max_length(100))
    }

    fn book() -> ModelState {
        ModelState::new("Book", "book")
            .with_field(FieldState::foreign_key("author", "author", FieldType::Int))
            .with_field(FieldState::new("title", FieldType::Char).with_max_length(200))
            .with_field(FieldState::new("updated_at", FieldType::Datetime).nullable())
            .with_field(FieldState::new("id", FieldType::Int).primary_key())
    }

    fn state() -> ProjectState {
        ProjectState::new().with_model(author()).with_model(book())
    }

    #[test]
    fn test_create_model_orders_columns_for_readability() {
        let op = CreateModel::from_model_state(&book()).unwrap();
        let names: Vec<&str> = op.fields.iter().map(FieldSpec::name).collect();
        assert_eq!(names, vec!["id", "updated_at", "title", "author"]);
    }

    #[test]
    fn test_create_model_round_trips_through_state() {
        let op = Operation::CreateModel(CreateModel::from_model_state(&author()).unwrap());
        let mut replayed = ProjectState::new();
        op.mutate_state(&mut replayed).unwrap();
        assert!(replayed.equivalent(&ProjectState::new().with_model(author())));
    }

    #[test]
    fn test_create_model_renders_compacted_fields() {
        let op = Operation::CreateModel(CreateModel::from_model_state(&author()).unwrap());
        assert_eq!(
            op.render_code().unwrap(),
            json!({
                "op": "CreateModel",
                "name": "Author",
                "db_table": "author",
                "fields": [
                    ["id", "IntField", {"generated": true, "primary_key": true}],
                    ["name", "CharField", {"max_length": 100}],
                ],
            })
        );
    }

    #[test]
    fn test_remove_operations_are_not_reversible() {
        let editor = PostgresSchemaEditor::new();
        let ops = [
            Operation::RemoveModel(RemoveModel {
                name: "Foo".into(),
                db_table: "foo".into(),
            }),
            Operation::RemoveField(RemoveField {
                model_name: "Book".into(),
                db_table: "book".into(),
                field_name: "author".into(),
                db_column: "author_id".into(),
            }),
        ];
        for op in ops {
            assert!(matches!(op.reverse_sql(&editor), Err(Error::NotReversible(_))));
        }
    }

    #[tokio::test]
    async fn test_remove_field_drops_backing_column_and_refuses_unapply() {
        let editor = PostgresSchemaEditor::new();
        let op = Operation::RemoveField(RemoveField {
            model_name: "Book".into(),
            db_table: "book".into(),
            field_name: "author".into(),
            db_column: "author_id".into(),
        });
        let mut executor = RecordingExecutor::new();
        op.apply(&mut executor, &editor).await.unwrap();
        assert_eq!(
            executor.statements,
            vec!["ALTER TABLE \"book\" DROP COLUMN IF EXISTS \"author_id\";"]
        );
        assert!(matches!(
            op.unapply(&mut executor, &editor).await,
            Err(Error::NotReversible(_))
        ));
    }

    #[test]
    fn test_rename_model_rewrites_relation_labels() {
        let mut project = state();
        Operation::RenameModel(RenameModel {
            old_name: "Author".into(),
            new_name: "Writer".into(),
            old_db_table: "author".into(),
            new_db_table: "writer".into(),
        })
        .mutate_state(&mut project)
        .unwrap();

        assert!(project.model("Author").is_none());
        assert_eq!(project.model("Writer").unwrap().db_table, "writer");
        let fk = project.model("Book").unwrap().field("author").unwrap();
        assert_eq!(fk.related_table.as_deref(), Some("writer"));
    }

    #[test]
    fn test_alter_field_merges_instead_of_replacing() {
        let mut project = state();
        Operation::AlterField(AlterField {
            model_name: "Author".into(),
            db_table: "author".into(),
            field_name: "id".into(),
            old_options: FieldOptions::new().with(OptionKey::Type, "IntField"),
            new_options: FieldOptions::new().with(OptionKey::Type, "BigIntField"),
            new_name: None,
        })
        .mutate_state(&mut project)
        .unwrap();

        let id = project.model("Author").unwrap().field("id").unwrap();
        assert_eq!(id.field_type, FieldType::BigInt);
        assert!(id.primary_key);
        assert!(id.generated);
    }

    #[test]
    fn test_alter_field_with_new_name_relocates_field() {
        let mut project = state();
        Operation::AlterField(AlterField {
            model_name: "Book".into(),
            db_table: "book".into(),
            field_name: "title".into(),
            old_options: FieldOptions::new().with(OptionKey::MaxLength, 200),
            new_options: FieldOptions::new().with(OptionKey::MaxLength, 300),
            new_name: Some("name".into()),
        })
        .mutate_state(&mut project)
        .unwrap();

        let book = project.model("Book").unwrap();
        assert!(book.field("title").is_none());
        assert_eq!(book.field("name").unwrap().max_length, Some(300));
    }

    #[test]
    fn test_alter_field_render_keeps_only_changes_and_type() {
        let old = FieldState::new("title", FieldType::Char)
            .with_max_length(200)
            .with_default(DefaultValue::literal(true));
        let new = FieldState::new("title", FieldType::Char)
            .with_max_length(300)
            .with_default(DefaultValue::literal(false));
        let op = Operation::AlterField(AlterField {
            model_name: "Book".into(),
            db_table: "book".into(),
            field_name: "title".into(),
            old_options: old.alter_options().unwrap(),
            new_options: new.alter_options().unwrap(),
            new_name: None,
        });

        let rendered = op.render_code().unwrap();
        assert_eq!(
            rendered["new_options"],
            json!({"default": false, "max_length": 300, "type": "CharField"})
        );
        assert_eq!(
            rendered["old_options"],
            json!({"default": true, "max_length": 200, "type": "CharField"})
        );
    }

    #[test]
    fn test_rename_field_moves_state_and_column() {
        let mut project = state();
        let op = Operation::RenameField(RenameField {
            model_name: "Book".into(),
            db_table: "book".into(),
            old_name: "author".into(),
            new_name: "writer".into(),
            old_column: "author_id".into(),
            new_column: "writer_id".into(),
        });
        op.mutate_state(&mut project).unwrap();

        let field = project.model("Book").unwrap().field("writer").unwrap();
        assert_eq!(field.column_name(), "writer_id");
        assert_eq!(field.db_column, None);
        assert_eq!(
            op.reverse_sql(&PostgresSchemaEditor::new()).unwrap(),
            vec![
                "ALTER TABLE \"book\" RENAME COLUMN \"writer_id\" TO \"author_id\";",
                "ALTER INDEX IF EXISTS \"book_writer_id_idx\" RENAME TO \"book_author_id_idx\";",
                "ALTER INDEX IF EXISTS \"book_writer_id_key\" RENAME TO \"book_author_id_key\";",
            ]
        );
    }

    #[test]
    fn test_index_operations_update_meta() {
        let mut project = state();
        let model = project.model("Book").unwrap().clone();
        let index = IndexDef::new(&["author_id", "title"], true);

        Operation::CreateIndex(CreateIndex::new(&model, &index))
            .mutate_state(&mut project)
            .unwrap();
        assert_eq!(project.model("Book").unwrap().meta.indexes, vec![index.clone()]);

        Operation::RemoveIndex(RemoveIndex::new(&model, &index))
            .mutate_state(&mut project)
            .unwrap();
        assert!(project.model("Book").unwrap().meta.indexes.is_empty());
    }

    #[test]
    fn test_remove_index_by_name_matches_logical_declarations() {
        let mut project = state();
        project
            .model_mut("Book")
            .unwrap()
            .meta
            .indexes
            .push(IndexDef::new(&["author", "title"], false));

        Operation::RemoveIndex(RemoveIndex {
            model_name: "Book".into(),
            db_table: "book".into(),
            name: "book_author_id_title_idx".into(),
            columns: Vec::new(),
            unique: false,
        })
        .mutate_state(&mut project)
        .unwrap();
        assert!(project.model("Book").unwrap().meta.indexes.is_empty());
    }

    #[tokio::test]
    async fn test_remove_index_without_columns_cannot_unapply() {
        let op = Operation::RemoveIndex(RemoveIndex {
            model_name: "Book".into(),
            db_table: "book".into(),
            name: "book_title_idx".into(),
            columns: Vec::new(),
            unique: false,
        });
        let mut executor = RecordingExecutor::new();
        let result = op.unapply(&mut executor, &PostgresSchemaEditor::new()).await;
        assert!(matches!(result, Err(Error::NotReversible(_))));
        assert!(executor.statements.is_empty());
    }

    struct Backfill;

    #[async_trait::async_trait]
    impl DataMigration for Backfill {
        async fn run(&self, executor: &mut dyn SqlExecutor, _editor: &dyn SchemaEditor) -> Result<()> {
            executor.execute("UPDATE \"user\" SET \"age\" = 0;").await
        }
    }

    #[tokio::test]
    async fn test_run_code_invokes_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let op = Operation::RunCode(RunCode::new("backfill", DataHandler::with_context(Backfill)).with_backward(
            "undo",
            DataHandler::plain(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ));
        let editor = PostgresSchemaEditor::new();
        let mut executor = RecordingExecutor::new();

        op.apply(&mut executor, &editor).await.unwrap();
        op.unapply(&mut executor, &editor).await.unwrap();

        assert_eq!(executor.statements, vec!["UPDATE \"user\" SET \"age\" = 0;"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(op.to_sql(&editor).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_code_without_handlers() {
        let editor = PostgresSchemaEditor::new();
        let mut executor = RecordingExecutor::new();
        let op = Operation::RunCode(RunCode::named("backfill", None));

        assert!(matches!(
            op.apply(&mut executor, &editor).await,
            Err(Error::DiscoveryError(_))
        ));
        assert!(matches!(
            op.unapply(&mut executor, &editor).await,
            Err(Error::NotReversible(_))
        ));
    }

    #[test]
    fn test_registry_attaches_handlers_by_name() {
        let mut registry = DataMigrationRegistry::new();
        registry.register("backfill", DataHandler::plain(|| Ok(())));
        let mut ops = vec![Operation::RunCode(RunCode::named("backfill", Some("missing")))];
        registry.attach(&mut ops);

        let Operation::RunCode(run) = &ops[0] else {
            panic!("expected RunCode");
        };
        assert!(run.forward_handler.is_some());
        assert!(run.backward_handler.is_none());
    }

    #[test]
    fn test_render_rejects_non_finite_defaults() {
        let model = ModelState::new("Reading", "reading")
            .with_field(FieldState::new("value", FieldType::Float).with_default(DefaultValue::literal(f64::INFINITY)));
        let err = CreateModel::from_model_state(&model).unwrap_err();
        assert!(err.to_string().contains("inf"));
    }

    #[test]
    fn test_rendered_operations_parse_back() {
        let op = Operation::AddField(
            AddField::from_field(&book(), &FieldState::new("isbn", FieldType::Char).unique()).unwrap(),
        );
        let parsed = Operation::from_code(op.render_code().unwrap()).unwrap();
        assert_eq!(parsed, op);
    }
}
