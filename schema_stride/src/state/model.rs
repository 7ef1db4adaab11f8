//! Model (table) snapshots

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::state::field::{FieldState, FieldType};

/// A table-level index or unique-together declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(Vec<String>, bool)", into = "(Vec<String>, bool)")]
pub struct IndexDef {
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    pub fn new<S: AsRef<str>>(columns: &[S], unique: bool) -> Self {
        Self {
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            unique,
        }
    }
}

impl From<(Vec<String>, bool)> for IndexDef {
    fn from((columns, unique): (Vec<String>, bool)) -> Self {
        Self { columns, unique }
    }
}

impl From<IndexDef> for (Vec<String>, bool) {
    fn from(index: IndexDef) -> Self {
        (index.columns, index.unique)
    }
}

/// Open-ended model metadata. Only `indexes` is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDef>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Schema of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub name: String,
    pub db_table: String,
    /// Keyed by lowercased field name
    pub field_states: IndexMap<String, FieldState>,
    #[serde(default)]
    pub meta: ModelMeta,
}

impl ModelState {
    pub fn new(name: &str, db_table: &str) -> Self {
        Self {
            name: name.to_string(),
            db_table: db_table.to_string(),
            field_states: IndexMap::new(),
            meta: ModelMeta::default(),
        }
    }

    /// Builder-style field insertion
    pub fn with_field(mut self, field: FieldState) -> Self {
        self.add_field(field);
        self
    }

    /// Builder-style index declaration
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.meta.indexes.push(index);
        self
    }

    pub fn add_field(&mut self, field: FieldState) {
        self.field_states.insert(field.name.to_lowercase(), field);
    }

    pub fn field(&self, name: &str) -> Option<&FieldState> {
        self.field_states.get(&name.to_lowercase())
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldState> {
        self.field_states.get_mut(&name.to_lowercase())
    }

    pub fn remove_field(&mut self, name: &str) -> Option<FieldState> {
        self.field_states.shift_remove(&name.to_lowercase())
    }

    /// Fields realized as physical columns
    pub fn schema_fields(&self) -> impl Iterator<Item = &FieldState> {
        self.field_states
            .values()
            .filter(|f| f.field_type.is_schema_field())
    }

    pub fn primary_key(&self) -> Option<&FieldState> {
        self.schema_fields().find(|f| f.primary_key)
    }

    /// Resolve an index column reference to a physical column.
    ///
    /// Accepts a logical field name, an explicit `db_column`, or the `<name>_id`
    /// backing column of a relation.
    pub fn resolve_column(&self, reference: &str) -> Option<String> {
        if let Some(field) = self.field(reference) {
            if field.field_type.is_schema_field() {
                return Some(field.column_name());
            }
        }
        self.schema_fields()
            .map(FieldState::column_name)
            .find(|column| column.eq_ignore_ascii_case(reference))
    }

    /// Whether a single-field flag already produces this index
    pub fn is_implied_index(&self, index: &IndexDef) -> bool {
        let [column] = index.columns.as_slice() else {
            return false;
        };
        self.schema_fields()
            .filter(|f| f.column_name() == *column)
            .any(|f| {
                if index.unique {
                    f.unique || f.primary_key
                } else {
                    f.index || f.unique || f.primary_key
                }
            })
    }

    /// Table-level indexes in physical column terms, minus field-implied ones
    pub fn canonical_indexes(&self) -> BTreeSet<IndexDef> {
        self.meta
            .indexes
            .iter()
            .map(|index| IndexDef {
                columns: index
                    .columns
                    .iter()
                    .map(|c| self.resolve_column(c).unwrap_or_else(|| c.clone()))
                    .collect(),
                unique: index.unique,
            })
            .filter(|index| !self.is_implied_index(index))
            .collect()
    }

    /// Related tables this model's relations point at
    pub fn referenced_tables(&self) -> BTreeSet<String> {
        self.schema_fields()
            .filter(|f| f.field_type.is_relation())
            .filter_map(|f| f.related_table.as_ref())
            .map(|t| t.to_lowercase())
            .collect()
    }

    /// Primary key kind, used when other models reference this one
    pub fn primary_key_type(&self) -> Option<FieldType> {
        self.primary_key().map(|f| f.field_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn book() -> ModelState {
        ModelState::new("Book", "book")
            .with_field(FieldState::new("id", FieldType::Int).primary_key())
            .with_field(FieldState::new("title", FieldType::Char).with_max_length(200))
            .with_field(FieldState::new("isbn", FieldType::Char).unique().with_db_column("isbn_code"))
            .with_field(FieldState::foreign_key("author", "author", FieldType::Int))
            .with_field(FieldState::new("tags", FieldType::ManyToMany))
    }

    #[rstest]
    #[case("title", Some("title"))]
    #[case("author", Some("author_id"))]
    #[case("author_id", Some("author_id"))]
    #[case("isbn_code", Some("isbn_code"))]
    #[case("tags", None)]
    #[case("missing", None)]
    fn test_resolve_column(#[case] reference: &str, #[case] expected: Option<&str>) {
        assert_eq!(book().resolve_column(reference).as_deref(), expected);
    }

    #[test]
    fn test_canonical_indexes_drop_implied_and_map_columns() {
        let model = book()
            .with_index(IndexDef::new(&["author", "title"], false))
            .with_index(IndexDef::new(&["isbn"], true))
            .with_index(IndexDef::new(&["title"], true));

        let indexes: Vec<IndexDef> = model.canonical_indexes().into_iter().collect();
        assert_eq!(
            indexes,
            vec![
                IndexDef::new(&["author_id", "title"], false),
                IndexDef::new(&["title"], true),
            ]
        );
    }

    #[test]
    fn test_fields_are_keyed_case_insensitively() {
        let model = ModelState::new("User", "user").with_field(FieldState::new("Email", FieldType::Char));
        assert!(model.field("email").is_some());
        assert_eq!(model.field_states.keys().next().map(String::as_str), Some("email"));
    }

    #[test]
    fn test_index_def_serializes_as_tuple() {
        let index = IndexDef::new(&["a", "b"], true);
        assert_eq!(serde_json::to_string(&index).unwrap(), r#"[["a","b"],true]"#);
    }
}
