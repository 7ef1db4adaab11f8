//! Field snapshots
//!
//! A [`FieldState`] describes everything about one column that matters for
//! schema generation. Field kinds form a closed enum; the mapping from Rust
//! types to kinds lives in the model registry and is resolved once.

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::state::options::{FieldOptions, OptionKey};

/// Sentinel stored for defaults produced by application code
pub const CALLABLE_SENTINEL: &str = "callable";

/// Prefix marking a raw database default expression
pub const DB_DEFAULT_PREFIX: &str = "db_default:";

/// Closed vocabulary of field kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "IntField")]
    Int,
    #[serde(rename = "SmallIntField")]
    SmallInt,
    #[serde(rename = "BigIntField")]
    BigInt,
    #[serde(rename = "CharField")]
    Char,
    #[serde(rename = "TextField")]
    Text,
    #[serde(rename = "BooleanField")]
    Boolean,
    #[serde(rename = "FloatField")]
    Float,
    #[serde(rename = "DecimalField")]
    Decimal,
    #[serde(rename = "BinaryField")]
    Binary,
    #[serde(rename = "UUIDField")]
    Uuid,
    #[serde(rename = "DatetimeField")]
    Datetime,
    #[serde(rename = "DateField")]
    Date,
    #[serde(rename = "TimeField")]
    Time,
    #[serde(rename = "TimedeltaField")]
    Timedelta,
    #[serde(rename = "JSONField")]
    Json,
    #[serde(rename = "CharEnumField")]
    CharEnum,
    #[serde(rename = "IntEnumField")]
    IntEnum,
    #[serde(rename = "ForeignKeyField")]
    ForeignKey,
    #[serde(rename = "OneToOneField")]
    OneToOne,
    #[serde(rename = "ManyToManyField")]
    ManyToMany,
    #[serde(rename = "BackwardFKRelation")]
    BackwardForeignKey,
    #[serde(rename = "BackwardOneToOneRelation")]
    BackwardOneToOne,
}

const ALL_FIELD_TYPES: [FieldType; 22] = [
    FieldType::Int,
    FieldType::SmallInt,
    FieldType::BigInt,
    FieldType::Char,
    FieldType::Text,
    FieldType::Boolean,
    FieldType::Float,
    FieldType::Decimal,
    FieldType::Binary,
    FieldType::Uuid,
    FieldType::Datetime,
    FieldType::Date,
    FieldType::Time,
    FieldType::Timedelta,
    FieldType::Json,
    FieldType::CharEnum,
    FieldType::IntEnum,
    FieldType::ForeignKey,
    FieldType::OneToOne,
    FieldType::ManyToMany,
    FieldType::BackwardForeignKey,
    FieldType::BackwardOneToOne,
];

impl FieldType {
    /// Tag used in snapshots and migration files
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int => "IntField",
            FieldType::SmallInt => "SmallIntField",
            FieldType::BigInt => "BigIntField",
            FieldType::Char => "CharField",
            FieldType::Text => "TextField",
            FieldType::Boolean => "BooleanField",
            FieldType::Float => "FloatField",
            FieldType::Decimal => "DecimalField",
            FieldType::Binary => "BinaryField",
            FieldType::Uuid => "UUIDField",
            FieldType::Datetime => "DatetimeField",
            FieldType::Date => "DateField",
            FieldType::Time => "TimeField",
            FieldType::Timedelta => "TimedeltaField",
            FieldType::Json => "JSONField",
            FieldType::CharEnum => "CharEnumField",
            FieldType::IntEnum => "IntEnumField",
            FieldType::ForeignKey => "ForeignKeyField",
            FieldType::OneToOne => "OneToOneField",
            FieldType::ManyToMany => "ManyToManyField",
            FieldType::BackwardForeignKey => "BackwardFKRelation",
            FieldType::BackwardOneToOne => "BackwardOneToOneRelation",
        }
    }

    /// Foreign key or one-to-one: realized as a `<name>_id` column
    pub fn is_relation(&self) -> bool {
        matches!(self, FieldType::ForeignKey | FieldType::OneToOne)
    }

    /// Whether the kind is realized as a physical column at all
    pub fn is_schema_field(&self) -> bool {
        !matches!(
            self,
            FieldType::ManyToMany | FieldType::BackwardForeignKey | FieldType::BackwardOneToOne
        )
    }

    pub fn is_char_like(&self) -> bool {
        matches!(self, FieldType::Char | FieldType::CharEnum)
    }

    /// Width rank of integer kinds, used for widening checks
    pub fn integer_rank(&self) -> Option<u8> {
        match self {
            FieldType::SmallInt => Some(1),
            FieldType::Int => Some(2),
            FieldType::BigInt => Some(3),
            _ => None,
        }
    }

    /// Kinds a foreign key may point at
    pub fn is_referenceable(&self) -> bool {
        matches!(
            self,
            FieldType::SmallInt | FieldType::Int | FieldType::BigInt | FieldType::Uuid | FieldType::Char
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        ALL_FIELD_TYPES
            .iter()
            .find(|t| t.as_str() == tag)
            .copied()
            .ok_or_else(|| Error::InvalidMigration(format!("Unknown field type `{}`", tag)))
    }
}

/// A literal default value
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for Literal {
    fn from(v: bool) -> Self {
        Literal::Bool(v)
    }
}

impl From<i64> for Literal {
    fn from(v: i64) -> Self {
        Literal::Int(v)
    }
}

impl From<f64> for Literal {
    fn from(v: f64) -> Self {
        Literal::Float(v)
    }
}

impl From<&str> for Literal {
    fn from(v: &str) -> Self {
        Literal::Text(v.to_string())
    }
}

impl From<String> for Literal {
    fn from(v: String) -> Self {
        Literal::Text(v)
    }
}

/// Default of a field
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Literal(Literal),
    /// Computed by application code, never rendered into SQL
    Callable,
    /// Raw SQL expression evaluated by the database
    DbExpr(String),
}

impl DefaultValue {
    pub fn literal(value: impl Into<Literal>) -> Self {
        DefaultValue::Literal(value.into())
    }

    pub fn db(expr: impl Into<String>) -> Self {
        DefaultValue::DbExpr(expr.into())
    }

    /// A default that can fill existing rows when a column is added
    pub fn can_backfill(&self) -> bool {
        !matches!(self, DefaultValue::Callable)
    }

    /// Encode as a JSON scalar; non-finite floats are rejected
    pub fn to_json(&self) -> Result<Value> {
        match self {
            DefaultValue::Callable => Ok(Value::String(CALLABLE_SENTINEL.to_string())),
            DefaultValue::DbExpr(expr) => Ok(Value::String(format!("{}{}", DB_DEFAULT_PREFIX, expr))),
            DefaultValue::Literal(Literal::Bool(b)) => Ok(Value::Bool(*b)),
            DefaultValue::Literal(Literal::Int(i)) => Ok(Value::from(*i)),
            DefaultValue::Literal(Literal::Float(f)) => Number::from_f64(*f)
                .map(Value::Number)
                .ok_or_else(|| {
                    Error::InvalidMigration(format!("Default value {} cannot be rendered", f))
                }),
            DefaultValue::Literal(Literal::Text(s)) => Ok(Value::String(s.clone())),
        }
    }

    /// Decode from a JSON scalar; `null` means "no default"
    pub fn from_json(value: &Value) -> Result<Option<Self>> {
        let decoded = match value {
            Value::Null => return Ok(None),
            Value::Bool(b) => DefaultValue::Literal(Literal::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => DefaultValue::Literal(Literal::Int(i)),
                None => DefaultValue::Literal(Literal::Float(n.as_f64().unwrap_or_default())),
            },
            Value::String(s) if s == CALLABLE_SENTINEL => DefaultValue::Callable,
            Value::String(s) => match s.strip_prefix(DB_DEFAULT_PREFIX) {
                Some(expr) => DefaultValue::DbExpr(expr.to_string()),
                None => DefaultValue::Literal(Literal::Text(s.clone())),
            },
            other => {
                return Err(Error::InvalidMigration(format!(
                    "Default value {} cannot be represented",
                    other
                )))
            }
        };
        Ok(Some(decoded))
    }
}

impl Serialize for DefaultValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().map_err(S::Error::custom)?.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DefaultValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        DefaultValue::from_json(&value)
            .map_err(D::Error::custom)?
            .ok_or_else(|| D::Error::custom("default cannot be null"))
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Physical column of a field when no explicit override exists
pub fn backing_column(name: &str, field_type: FieldType) -> String {
    if field_type.is_relation() {
        format!("{}_id", name)
    } else {
        name.to_string()
    }
}

/// Schema-relevant description of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub index: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    /// Integer primary key realized as an identity column
    #[serde(default, skip_serializing_if = "is_false")]
    pub generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_digits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal_places: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_now: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_now_add: bool,
    // Relation labels. These are denormalized names, rewritten by
    // `ProjectState::rewrite_relation_labels` when a model is renamed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_type: Option<FieldType>,
}

impl FieldState {
    /// Create a field with every optional attribute unset
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            null: false,
            default: None,
            unique: false,
            index: false,
            primary_key: false,
            generated: false,
            db_column: None,
            max_length: None,
            max_digits: None,
            decimal_places: None,
            auto_now: false,
            auto_now_add: false,
            related_table: None,
            related_model: None,
            to_field: None,
            on_delete: None,
            referenced_type: None,
        }
    }

    /// Create a foreign key pointing at `related_table`
    pub fn foreign_key(name: &str, related_table: &str, referenced_type: FieldType) -> Self {
        let mut field = Self::new(name, FieldType::ForeignKey);
        field.related_table = Some(related_table.to_string());
        field.referenced_type = Some(referenced_type);
        field
    }

    pub fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_decimal(mut self, max_digits: u32, decimal_places: u32) -> Self {
        self.max_digits = Some(max_digits);
        self.decimal_places = Some(decimal_places);
        self
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_db_column(mut self, db_column: &str) -> Self {
        self.db_column = Some(db_column.to_string());
        self
    }

    pub fn with_related_model(mut self, related_model: &str) -> Self {
        self.related_model = Some(related_model.to_string());
        self
    }

    pub fn with_on_delete(mut self, on_delete: &str) -> Self {
        self.on_delete = Some(on_delete.to_string());
        self
    }

    /// Physical column name: explicit override, FK convention, or the name itself
    pub fn column_name(&self) -> String {
        match &self.db_column {
            Some(column) if !column.is_empty() => column.clone(),
            _ => backing_column(&self.name, self.field_type),
        }
    }

    /// True when adding this field can fill existing rows
    pub fn has_backfill_default(&self) -> bool {
        self.default.as_ref().map_or(false, DefaultValue::can_backfill)
    }

    /// Full option set, without the type tag
    pub fn options(&self) -> Result<FieldOptions> {
        let mut opts = FieldOptions::new();
        let text = |v: &Option<String>| v.clone().map_or(Value::Null, Value::String);
        let number = |v: Option<u32>| v.map_or(Value::Null, Value::from);

        opts.insert(OptionKey::AutoNow, self.auto_now);
        opts.insert(OptionKey::AutoNowAdd, self.auto_now_add);
        opts.insert(OptionKey::DbColumn, text(&self.db_column));
        opts.insert(OptionKey::DecimalPlaces, number(self.decimal_places));
        opts.insert(
            OptionKey::Default,
            match &self.default {
                Some(default) => default.to_json()?,
                None => Value::Null,
            },
        );
        opts.insert(OptionKey::Generated, self.generated);
        opts.insert(OptionKey::Index, self.index);
        opts.insert(OptionKey::MaxDigits, number(self.max_digits));
        opts.insert(OptionKey::MaxLength, number(self.max_length));
        opts.insert(OptionKey::Null, self.null);
        opts.insert(OptionKey::OnDelete, text(&self.on_delete));
        opts.insert(OptionKey::PrimaryKey, self.primary_key);
        opts.insert(
            OptionKey::ReferencedType,
            self.referenced_type
                .map_or(Value::Null, |t| Value::String(t.as_str().to_string())),
        );
        opts.insert(OptionKey::RelatedModel, text(&self.related_model));
        opts.insert(OptionKey::RelatedTable, text(&self.related_table));
        opts.insert(OptionKey::ToField, text(&self.to_field));
        opts.insert(OptionKey::Unique, self.unique);
        Ok(opts)
    }

    /// Full option set including the type tag
    pub fn options_with_type(&self) -> Result<FieldOptions> {
        let mut opts = self.options()?;
        opts.insert(OptionKey::Type, self.field_type.as_str());
        Ok(opts)
    }

    /// Build a field from an option set; the set must carry a `type`
    pub fn from_options(name: &str, options: &FieldOptions) -> Result<Self> {
        let field_type = options.field_type()?.ok_or_else(|| {
            Error::InvalidMigration(format!("Field `{}` has no `type` option", name))
        })?;
        let mut field = FieldState::new(name, field_type);
        field.merge_options(options)?;
        Ok(field)
    }

    /// Overlay the keys present in `options`, keeping everything else
    pub fn merge_options(&mut self, options: &FieldOptions) -> Result<()> {
        for (key, value) in options.iter() {
            self.set_option(*key, value)?;
        }
        Ok(())
    }

    fn set_option(&mut self, key: OptionKey, value: &Value) -> Result<()> {
        let name = self.name.clone();
        let mismatch = |expected: &str| {
            Error::InvalidMigration(format!(
                "Option `{}` on field `{}` expects {}, got {}",
                key.as_str(),
                name,
                expected,
                value
            ))
        };
        let flag = || match value {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(*b),
            _ => Err(mismatch("a boolean")),
        };
        let text = || match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            _ => Err(mismatch("a string")),
        };
        let number = || match value {
            Value::Null => Ok(None),
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| mismatch("a non-negative integer")),
            _ => Err(mismatch("a non-negative integer")),
        };

        match key {
            OptionKey::AutoNow => self.auto_now = flag()?,
            OptionKey::AutoNowAdd => self.auto_now_add = flag()?,
            OptionKey::Generated => self.generated = flag()?,
            OptionKey::Index => self.index = flag()?,
            OptionKey::Null => self.null = flag()?,
            OptionKey::PrimaryKey => self.primary_key = flag()?,
            OptionKey::Unique => self.unique = flag()?,
            OptionKey::DbColumn => self.db_column = text()?,
            OptionKey::OnDelete => self.on_delete = text()?,
            OptionKey::RelatedModel => self.related_model = text()?,
            OptionKey::RelatedTable => self.related_table = text()?,
            OptionKey::ToField => self.to_field = text()?,
            OptionKey::DecimalPlaces => self.decimal_places = number()?,
            OptionKey::MaxDigits => self.max_digits = number()?,
            OptionKey::MaxLength => self.max_length = number()?,
            OptionKey::Default => self.default = DefaultValue::from_json(value)?,
            OptionKey::ReferencedType => {
                self.referenced_type = match text()? {
                    Some(tag) => Some(tag.parse()?),
                    None => None,
                }
            }
            OptionKey::Type => {
                if let Some(tag) = text()? {
                    self.field_type = tag.parse()?;
                }
            }
        }
        Ok(())
    }

    /// Rehydrate implicit defaults so that omitted and explicit values compare equal
    pub fn normalized(&self) -> FieldState {
        let mut field = self.clone();
        if field.field_type.is_relation() {
            if field.db_column.as_deref().map_or(true, str::is_empty) {
                field.db_column = Some(backing_column(&field.name, field.field_type));
            }
            field.to_field.get_or_insert_with(|| "id".to_string());
            let on_delete = field.on_delete.take().unwrap_or_else(|| "CASCADE".to_string());
            field.on_delete = Some(on_delete.to_uppercase().replace('_', " "));
        }
        if field.field_type.is_char_like() && field.max_length.is_none() {
            field.max_length = Some(255);
        }
        if field.primary_key {
            field.null = false;
            field.unique = false;
            field.index = false;
        }
        field
    }

    /// Normalized option set used to detect alterations
    pub fn alter_options(&self) -> Result<FieldOptions> {
        let normalized = self.normalized();
        let mut opts = normalized.options_with_type()?;
        if normalized.primary_key {
            opts.remove(OptionKey::Unique);
            opts.remove(OptionKey::Index);
            opts.remove(OptionKey::Null);
        }
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(FieldType::Int, "IntField")]
    #[case(FieldType::Uuid, "UUIDField")]
    #[case(FieldType::Json, "JSONField")]
    #[case(FieldType::BackwardForeignKey, "BackwardFKRelation")]
    fn test_field_type_tags_round_trip(#[case] kind: FieldType, #[case] tag: &str) {
        assert_eq!(kind.as_str(), tag);
        assert_eq!(tag.parse::<FieldType>().unwrap(), kind);
        assert_eq!(serde_json::to_value(kind).unwrap(), json!(tag));
    }

    #[test]
    fn test_unknown_field_type_is_rejected() {
        assert!("GeometryField".parse::<FieldType>().is_err());
    }

    #[rstest]
    #[case(json!(true), Some(DefaultValue::literal(true)))]
    #[case(json!(7), Some(DefaultValue::literal(7i64)))]
    #[case(json!("hi"), Some(DefaultValue::literal("hi")))]
    #[case(json!("callable"), Some(DefaultValue::Callable))]
    #[case(json!("db_default:now()"), Some(DefaultValue::db("now()")))]
    #[case(json!(null), None)]
    fn test_default_decoding(#[case] raw: Value, #[case] expected: Option<DefaultValue>) {
        assert_eq!(DefaultValue::from_json(&raw).unwrap(), expected);
    }

    #[test]
    fn test_non_finite_default_cannot_be_rendered() {
        let err = DefaultValue::literal(f64::NAN).to_json().unwrap_err();
        assert!(err.to_string().contains("NaN"));
    }

    #[test]
    fn test_column_name_follows_fk_convention() {
        let fk = FieldState::foreign_key("author", "author", FieldType::Int);
        assert_eq!(fk.column_name(), "author_id");
        assert_eq!(fk.clone().with_db_column("writer_ref").column_name(), "writer_ref");
        assert_eq!(FieldState::new("title", FieldType::Char).column_name(), "title");
    }

    #[test]
    fn test_merge_keeps_unspecified_attributes() {
        let mut field = FieldState::new("id", FieldType::Int).primary_key().generated();
        let patch = FieldOptions::new()
            .with(OptionKey::Type, "BigIntField")
            .with(OptionKey::Default, Value::Null);
        field.merge_options(&patch).unwrap();

        assert_eq!(field.field_type, FieldType::BigInt);
        assert!(field.primary_key);
        assert!(field.generated);
    }

    #[test]
    fn test_merge_rejects_mistyped_values() {
        let mut field = FieldState::new("title", FieldType::Char);
        let patch = FieldOptions::new().with(OptionKey::MaxLength, "long");
        let err = field.merge_options(&patch).unwrap_err();
        assert!(err.to_string().contains("max_length"));
    }

    #[test]
    fn test_alter_options_rehydrate_fk_defaults() {
        let fk = FieldState::foreign_key("author", "author", FieldType::Int);
        let opts = fk.alter_options().unwrap();
        assert_eq!(opts.get_str(OptionKey::DbColumn), Some("author_id"));
        assert_eq!(opts.get_str(OptionKey::ToField), Some("id"));
        assert_eq!(opts.get_str(OptionKey::OnDelete), Some("CASCADE"));
        assert_eq!(opts.get_str(OptionKey::Type), Some("ForeignKeyField"));
    }

    #[test]
    fn test_alter_options_drop_implied_primary_key_flags() {
        let pk = FieldState::new("id", FieldType::Int).primary_key().unique();
        let opts = pk.alter_options().unwrap();
        assert!(!opts.contains(OptionKey::Unique));
        assert!(!opts.contains(OptionKey::Null));
        assert!(opts.flag(OptionKey::PrimaryKey));
    }

    #[test]
    fn test_from_options_round_trips_compacted_set() {
        let field = FieldState::new("price", FieldType::Decimal)
            .with_decimal(10, 2)
            .with_default(DefaultValue::literal(0i64));
        let opts = field.options_with_type().unwrap().compact();
        assert_eq!(FieldState::from_options("price", &opts).unwrap(), field);
    }
}
