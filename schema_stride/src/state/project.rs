//! Project snapshots

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::state::model::ModelState;

/// The complete schema: the unit the differ compares
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub model_states: BTreeMap<String, ModelState>,
}

impl ProjectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style model insertion
    pub fn with_model(mut self, model: ModelState) -> Self {
        self.add_model(model);
        self
    }

    pub fn add_model(&mut self, model: ModelState) {
        self.model_states.insert(model.name.clone(), model);
    }

    pub fn model(&self, name: &str) -> Option<&ModelState> {
        self.model_states.get(name)
    }

    pub fn model_mut(&mut self, name: &str) -> Result<&mut ModelState> {
        self.model_states
            .get_mut(name)
            .ok_or_else(|| Error::StateError(format!("Unknown model `{}`", name)))
    }

    pub fn remove_model(&mut self, name: &str) -> Option<ModelState> {
        self.model_states.remove(name)
    }

    /// Find a model by physical table name (case-insensitive)
    pub fn model_by_table(&self, table: &str) -> Option<&ModelState> {
        self.model_states
            .values()
            .find(|m| m.db_table.eq_ignore_ascii_case(table))
    }

    /// Rewrite every relation label that points at a renamed model.
    ///
    /// All operations that move a model must route through here; the labels are
    /// plain strings and nothing else keeps them in sync.
    pub fn rewrite_relation_labels(
        &mut self,
        old_name: &str,
        old_table: &str,
        new_name: &str,
        new_table: &str,
    ) {
        for model in self.model_states.values_mut() {
            for field in model.field_states.values_mut() {
                if let Some(table) = &field.related_table {
                    if table.eq_ignore_ascii_case(old_table) {
                        field.related_table = Some(new_table.to_string());
                    }
                }
                if let Some(label) = &field.related_model {
                    if let Some(rewritten) = rewrite_model_label(label, old_name, new_name) {
                        field.related_model = Some(rewritten);
                    }
                }
            }
        }
    }

    /// Copy with non-schema fields removed from every model
    pub fn without_non_schema_fields(&self) -> ProjectState {
        let mut state = self.clone();
        for model in state.model_states.values_mut() {
            model.field_states.retain(|_, f| f.field_type.is_schema_field());
        }
        state
    }

    /// Canonical form: non-schema fields dropped, implicit field defaults
    /// rehydrated and index sets expressed in physical columns.
    pub fn normalized(&self) -> ProjectState {
        let mut state = self.without_non_schema_fields();
        for model in state.model_states.values_mut() {
            model.meta.indexes = model.canonical_indexes().into_iter().collect();
            for field in model.field_states.values_mut() {
                *field = field.normalized();
            }
            model.field_states.sort_keys();
        }
        state
    }

    /// Observational equality used for round-trip checks
    pub fn equivalent(&self, other: &ProjectState) -> bool {
        self.normalized() == other.normalized()
    }
}

/// `Author` or `app.Author` pointing at `old` becomes the same shape pointing at `new`
fn rewrite_model_label(label: &str, old: &str, new: &str) -> Option<String> {
    if label == old {
        return Some(new.to_string());
    }
    label
        .rsplit_once('.')
        .filter(|(_, tail)| *tail == old)
        .map(|(head, _)| format!("{}.{}", head, new))
}
