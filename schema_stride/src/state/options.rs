//! Option sets carried by field operations
//!
//! Operations describe fields as a flat, sorted mapping from option key to a JSON
//! scalar. Partial option sets are what make `AlterField` mergeable: a key that is
//! absent means "keep what was there", an explicit `null` means "clear it".

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::state::field::FieldType;

/// Keys understood in a field option set.
///
/// Variants are declared in the alphabetical order of their wire names so that
/// the derived `Ord` yields the same order as sorting the rendered keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKey {
    AutoNow,
    AutoNowAdd,
    DbColumn,
    DecimalPlaces,
    Default,
    Generated,
    Index,
    MaxDigits,
    MaxLength,
    Null,
    OnDelete,
    PrimaryKey,
    ReferencedType,
    RelatedModel,
    RelatedTable,
    ToField,
    Type,
    Unique,
}

impl OptionKey {
    /// Wire name of the key
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKey::AutoNow => "auto_now",
            OptionKey::AutoNowAdd => "auto_now_add",
            OptionKey::DbColumn => "db_column",
            OptionKey::DecimalPlaces => "decimal_places",
            OptionKey::Default => "default",
            OptionKey::Generated => "generated",
            OptionKey::Index => "index",
            OptionKey::MaxDigits => "max_digits",
            OptionKey::MaxLength => "max_length",
            OptionKey::Null => "null",
            OptionKey::OnDelete => "on_delete",
            OptionKey::PrimaryKey => "primary_key",
            OptionKey::ReferencedType => "referenced_type",
            OptionKey::RelatedModel => "related_model",
            OptionKey::RelatedTable => "related_table",
            OptionKey::ToField => "to_field",
            OptionKey::Type => "type",
            OptionKey::Unique => "unique",
        }
    }

    /// Boolean flags, where "absent", `null` and `false` all mean the same thing
    pub fn is_flag(&self) -> bool {
        matches!(
            self,
            OptionKey::AutoNow
                | OptionKey::AutoNowAdd
                | OptionKey::Generated
                | OptionKey::Index
                | OptionKey::Null
                | OptionKey::PrimaryKey
                | OptionKey::Unique
        )
    }
}

/// A sorted, possibly partial set of field options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldOptions(BTreeMap<OptionKey, Value>);

impl FieldOptions {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Set an option, replacing any previous value
    pub fn insert(&mut self, key: OptionKey, value: impl Into<Value>) {
        self.0.insert(key, value.into());
    }

    /// Builder-style variant of [`FieldOptions::insert`]
    pub fn with(mut self, key: OptionKey, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: OptionKey) -> Option<&Value> {
        self.0.get(&key)
    }

    pub fn remove(&mut self, key: OptionKey) -> Option<Value> {
        self.0.remove(&key)
    }

    pub fn contains(&self, key: OptionKey) -> bool {
        self.0.contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OptionKey, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &OptionKey> {
        self.0.keys()
    }

    /// Read a flag; missing and `null` read as `false`
    pub fn flag(&self, key: OptionKey) -> bool {
        matches!(self.0.get(&key), Some(Value::Bool(true)))
    }

    pub fn get_str(&self, key: OptionKey) -> Option<&str> {
        self.0.get(&key).and_then(Value::as_str)
    }

    pub fn get_u32(&self, key: OptionKey) -> Option<u32> {
        self.0
            .get(&key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    /// The `type` tag, if present
    pub fn field_type(&self) -> Result<Option<FieldType>> {
        match self.0.get(&OptionKey::Type) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(tag)) => tag.parse().map(Some),
            Some(other) => Err(Error::InvalidMigration(format!(
                "Option `type` must be a field type tag, got {}",
                other
            ))),
        }
    }

    /// Value of a key as it compares for change detection
    fn effective(&self, key: OptionKey) -> Value {
        match self.0.get(&key) {
            None | Some(Value::Null) if key.is_flag() => Value::Bool(false),
            None => Value::Null,
            Some(value) => value.clone(),
        }
    }

    /// Drop `null`, `false` (except for `default`) and empty strings
    pub fn compact(&self) -> FieldOptions {
        let map = self
            .0
            .iter()
            .filter(|(key, value)| match value {
                Value::Null => false,
                Value::Bool(false) => **key == OptionKey::Default,
                Value::String(s) => !s.is_empty(),
                _ => true,
            })
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        FieldOptions(map)
    }

    /// Reduce an (old, new) pair to the keys whose values actually differ
    pub fn changed_only(old: &FieldOptions, new: &FieldOptions) -> (FieldOptions, FieldOptions) {
        let mut old_out = FieldOptions::new();
        let mut new_out = FieldOptions::new();
        let keys: std::collections::BTreeSet<OptionKey> =
            old.0.keys().chain(new.0.keys()).copied().collect();

        for key in keys {
            let before = old.effective(key);
            let after = new.effective(key);
            if before != after {
                old_out.insert(key, before);
                new_out.insert(key, after);
            }
        }

        (old_out, new_out)
    }

    /// Reject values that cannot be rendered deterministically
    pub fn ensure_renderable(&self) -> Result<()> {
        for (key, value) in &self.0 {
            match value {
                Value::Array(_) | Value::Object(_) => {
                    return Err(Error::InvalidMigration(format!(
                        "Option `{}` has a value that cannot be rendered: {}",
                        key.as_str(),
                        value
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Overlay `other` on top of `self`
    pub fn merged(&self, other: &FieldOptions) -> FieldOptions {
        let mut out = self.clone();
        for (key, value) in &other.0 {
            out.0.insert(*key, value.clone());
        }
        out
    }
}

impl FromIterator<(OptionKey, Value)> for FieldOptions {
    fn from_iter<I: IntoIterator<Item = (OptionKey, Value)>>(iter: I) -> Self {
        FieldOptions(iter.into_iter().collect())
    }
}
