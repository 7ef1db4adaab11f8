//! Model registry for schema_stride
//!
//! Finds structs deriving a model macro in Rust sources and turns them into a
//! project snapshot.

use indexmap::IndexMap;
use quote::ToTokens;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use syn::meta::ParseNestedMeta;
use syn::{parse_file, Attribute, Expr, Fields, GenericArgument, Item, ItemStruct, Lit, PathArguments, Type, UnOp};
use walkdir::WalkDir;

use crate::config::{ModelsConfig, NamingConfig};
use crate::error::{Error, Result};
use crate::models::SchemaSource;
use crate::state::{DefaultValue, FieldState, FieldType, IndexDef, Literal, ModelState, ProjectState};
use crate::utils::naming::get_table_name;

/// Width used for `String` fields without `max_length`
pub const DEFAULT_CHAR_LENGTH: u32 = 255;

const ATTRIBUTE: &str = "stride";

/// Registry for models found in source files
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelInfo>,
    config: ModelsConfig,
    naming: NamingConfig,
}

/// A model as declared in source, before relations are resolved
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub file_path: PathBuf,
    pub table_name: String,
    pub fields: Vec<FieldInfo>,
    pub indexes: Vec<IndexDef>,
}

/// One struct field with its `#[stride(...)]` settings
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub rust_type: String,
    pub optional: bool,
    pub attrs: FieldAttrs,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldAttrs {
    pub primary_key: bool,
    pub generated: Option<bool>,
    pub null: bool,
    pub unique: bool,
    pub index: bool,
    pub max_length: Option<u32>,
    pub max_digits: Option<u32>,
    pub decimal_places: Option<u32>,
    pub db_column: Option<String>,
    pub default: Option<DefaultValue>,
    pub auto_now: bool,
    pub auto_now_add: bool,
    pub kind: Option<String>,
    pub foreign_key: Option<String>,
    pub one_to_one: Option<String>,
    pub to_field: Option<String>,
    pub on_delete: Option<String>,
    pub many_to_many: Option<String>,
    pub reverse: Option<String>,
    pub skip: bool,
}

impl FieldAttrs {
    /// Target model of a foreign key or one-to-one
    fn relation(&self) -> Option<(FieldType, &str)> {
        match (&self.foreign_key, &self.one_to_one) {
            (Some(target), _) => Some((FieldType::ForeignKey, target.as_str())),
            (None, Some(target)) => Some((FieldType::OneToOne, target.as_str())),
            _ => None,
        }
    }

    /// Placeholders that never become columns
    fn is_placeholder(&self) -> bool {
        self.skip || self.many_to_many.is_some() || self.reverse.is_some()
    }
}

impl ModelRegistry {
    pub fn new(config: &ModelsConfig, naming: &NamingConfig) -> Self {
        Self {
            models: IndexMap::new(),
            config: config.clone(),
            naming: naming.clone(),
        }
    }

    /// Scan the configured paths and register every model found
    pub fn scan(&mut self) -> Result<()> {
        let exclude: Vec<PathBuf> = self.config.exclude_paths.iter().map(PathBuf::from).collect();
        let max_depth = if self.config.recursive_scan { usize::MAX } else { 1 };

        let mut files = Vec::new();
        for path in &self.config.paths {
            let base_path = Path::new(path);
            if !base_path.exists() {
                return Err(Error::ExtractionError(format!("Path does not exist: {}", path)));
            }

            for entry in WalkDir::new(base_path).follow_links(true).max_depth(max_depth) {
                let entry = entry.map_err(|e| Error::ExtractionError(e.to_string()))?;
                let path = entry.path();
                if exclude.iter().any(|excluded| path.starts_with(excluded)) {
                    continue;
                }
                if path.is_file() && path.extension().map_or(false, |ext| ext == "rs") {
                    files.push(path.to_path_buf());
                }
            }
        }

        files.sort();
        files.dedup();
        for file in files {
            let source = std::fs::read_to_string(&file)?;
            self.register_source(&file, &source)?;
        }

        tracing::debug!(models = self.models.len(), "Scanned model sources");
        Ok(())
    }

    /// Register every model struct in one file's source text
    pub fn register_source(&mut self, file_path: &Path, source: &str) -> Result<()> {
        let syntax = parse_file(source).map_err(|e| {
            Error::ExtractionError(format!("Failed to parse {}: {}", file_path.display(), e))
        })?;

        for item in syntax.items {
            if let Item::Struct(item_struct) = item {
                if self.derives_model(&item_struct.attrs) {
                    self.register_model(file_path, &item_struct)?;
                }
            }
        }

        Ok(())
    }

    /// Whether any `#[derive(...)]` names one of the configured model derives
    fn derives_model(&self, attrs: &[Attribute]) -> bool {
        attrs
            .iter()
            .filter(|attr| attr.path().is_ident("derive"))
            .any(|attr| {
                let mut found = false;
                let _ = attr.parse_nested_meta(|meta| {
                    if let Some(last) = meta.path.segments.last() {
                        let name = last.ident.to_string();
                        found |= self.config.derive_macros.iter().any(|d| *d == name);
                    }
                    Ok(())
                });
                found
            })
    }

    fn register_model(&mut self, file_path: &Path, item_struct: &ItemStruct) -> Result<()> {
        let struct_name = item_struct.ident.to_string();
        let context = |e: syn::Error| {
            Error::ExtractionError(format!("{} ({}): {}", struct_name, file_path.display(), e))
        };

        let mut table_name = None;
        let mut indexes = Vec::new();
        for attr in item_struct.attrs.iter().filter(|a| a.path().is_ident(ATTRIBUTE)) {
            attr.parse_nested_meta(|meta| {
                let key = meta_key(&meta);
                match key.as_str() {
                    "table" => table_name = Some(string_value(&meta)?),
                    "index" => indexes.push(IndexDef::new(&split_columns(&string_value(&meta)?), false)),
                    "unique_together" => indexes.push(IndexDef::new(&split_columns(&string_value(&meta)?), true)),
                    _ => return Err(meta.error(format!("unknown model attribute `{}`", key))),
                }
                Ok(())
            })
            .map_err(context)?;
        }

        let Fields::Named(named) = &item_struct.fields else {
            return Err(Error::ExtractionError(format!(
                "Only structs with named fields can be models: {}",
                struct_name
            )));
        };

        let mut fields = Vec::new();
        for field in &named.named {
            let Some(ident) = &field.ident else { continue };
            let mut attrs = FieldAttrs::default();
            for attr in field.attrs.iter().filter(|a| a.path().is_ident(ATTRIBUTE)) {
                attr.parse_nested_meta(|meta| parse_field_attr(&meta, &mut attrs))
                    .map_err(context)?;
            }
            let (inner, optional) = unwrap_option(&field.ty);
            fields.push(FieldInfo {
                name: ident.to_string(),
                rust_type: inner.to_token_stream().to_string().replace(' ', ""),
                optional,
                attrs,
            });
        }

        if self.models.contains_key(&struct_name) {
            return Err(Error::ExtractionError(format!(
                "Model {} is declared more than once (again in {})",
                struct_name,
                file_path.display()
            )));
        }

        let table_name = table_name.unwrap_or_else(|| {
            get_table_name(&struct_name, &self.naming.table_style, self.naming.pluralize_tables)
        });
        tracing::debug!(model = %struct_name, table = %table_name, "Registered model");
        self.models.insert(
            struct_name.clone(),
            ModelInfo {
                name: struct_name,
                file_path: file_path.to_path_buf(),
                table_name,
                fields,
                indexes,
            },
        );
        Ok(())
    }

    pub fn models(&self) -> &IndexMap<String, ModelInfo> {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&ModelInfo> {
        self.models.get(name)
    }

    /// Build the project snapshot. Relations are resolved against the other
    /// registered models, so this runs after every file is registered.
    pub fn to_project_state(&self) -> Result<ProjectState> {
        let mut state = ProjectState::new();
        let mut problems = Vec::new();

        for info in self.models.values() {
            let mut model = ModelState::new(&info.name, &info.table_name);
            model.meta.indexes = info.indexes.clone();

            let relation_columns: HashSet<String> = info
                .fields
                .iter()
                .filter(|f| f.attrs.relation().is_some())
                .map(|f| format!("{}_id", logical_name(&f.name)))
                .collect();

            for field in &info.fields {
                if field.attrs.is_placeholder() {
                    continue;
                }
                if field.attrs.relation().is_none() && relation_columns.contains(&field.name) {
                    tracing::debug!(model = %info.name, field = %field.name, "Eliding foreign key backing column");
                    continue;
                }
                match self.build_field(info, field) {
                    Ok(built) => model.add_field(built),
                    Err(Error::ExtractionError(message)) => problems.push(message),
                    Err(other) => return Err(other),
                }
            }
            state.add_model(model);
        }

        if !problems.is_empty() {
            let mut message = String::from("Models could not be extracted:");
            for problem in problems {
                message.push_str("\n  - ");
                message.push_str(&problem);
            }
            return Err(Error::ExtractionError(message));
        }
        Ok(state)
    }

    fn build_field(&self, model: &ModelInfo, field: &FieldInfo) -> Result<FieldState> {
        let attrs = &field.attrs;
        let label = format!("{}.{}", model.name, field.name);

        let mut built = match attrs.relation() {
            Some((kind, target)) => {
                let related = self.model(target).ok_or_else(|| {
                    Error::ExtractionError(format!("{}: unknown related model `{}`", label, target))
                })?;
                let referenced_type = self.referenced_type(related, attrs.to_field.as_deref(), &label)?;
                let mut relation = FieldState::foreign_key(logical_name(&field.name), &related.table_name, referenced_type)
                    .with_related_model(&related.name);
                relation.field_type = kind;
                relation.to_field = attrs.to_field.clone();
                relation.on_delete = attrs.on_delete.clone();
                relation
            }
            None => {
                let field_type = match &attrs.kind {
                    Some(kind) => kind_type(kind)
                        .ok_or_else(|| Error::ExtractionError(format!("{}: unknown kind `{}`", label, kind)))?,
                    None => rust_type(&field.rust_type).ok_or_else(|| {
                        Error::ExtractionError(format!("{}: unsupported type `{}`", label, field.rust_type))
                    })?,
                };
                FieldState::new(&field.name, field_type)
            }
        };

        built.null = attrs.null || field.optional;
        built.unique = attrs.unique;
        built.index = attrs.index;
        built.primary_key = attrs.primary_key;
        built.generated =
            attrs.primary_key && built.field_type.integer_rank().is_some() && attrs.generated.unwrap_or(true);
        built.db_column = attrs.db_column.clone();
        built.default = attrs.default.clone();
        built.auto_now = attrs.auto_now;
        built.auto_now_add = attrs.auto_now_add;
        built.max_digits = attrs.max_digits;
        built.decimal_places = attrs.decimal_places;
        built.max_length = match attrs.max_length {
            Some(length) => Some(length),
            None if built.field_type.is_char_like() => Some(DEFAULT_CHAR_LENGTH),
            None => None,
        };

        if built.field_type == FieldType::Decimal && (built.max_digits.is_none() || built.decimal_places.is_none()) {
            return Err(Error::ExtractionError(format!(
                "{}: decimal fields need max_digits and decimal_places",
                label
            )));
        }
        Ok(built)
    }

    /// Kind of the column a relation points at
    fn referenced_type(&self, related: &ModelInfo, to_field: Option<&str>, label: &str) -> Result<FieldType> {
        let target = match to_field {
            Some(name) => related.fields.iter().find(|f| f.name == name),
            None => related.fields.iter().find(|f| f.attrs.primary_key),
        }
        .ok_or_else(|| {
            Error::ExtractionError(format!(
                "{}: related model {} has no {}",
                label,
                related.name,
                to_field.unwrap_or("primary key")
            ))
        })?;

        let kind = match &target.attrs.kind {
            Some(kind) => kind_type(kind),
            None => rust_type(&target.rust_type),
        };
        match kind {
            Some(kind) if kind.is_referenceable() => Ok(kind),
            _ => Err(Error::ExtractionError(format!(
                "{}: {}.{} of type `{}` cannot be referenced",
                label, related.name, target.name, target.rust_type
            ))),
        }
    }
}

impl SchemaSource for ModelRegistry {
    fn extract(&self) -> Result<ProjectState> {
        self.to_project_state()
    }
}

/// `author_id` is exposed as `author`
fn logical_name(name: &str) -> &str {
    name.strip_suffix("_id").filter(|stem| !stem.is_empty()).unwrap_or(name)
}

fn split_columns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// `Option<T>` to `(T, true)`
fn unwrap_option(ty: &Type) -> (&Type, bool) {
    if let Type::Path(path) = ty {
        if let Some(last) = path.path.segments.last() {
            if last.ident == "Option" {
                if let PathArguments::AngleBracketed(args) = &last.arguments {
                    if let Some(GenericArgument::Type(inner)) = args.args.first() {
                        return (inner, true);
                    }
                }
            }
        }
    }
    (ty, false)
}

/// Field kind for a Rust type, by its last path segment
fn rust_type(rust_type: &str) -> Option<FieldType> {
    if rust_type == "Vec<u8>" {
        return Some(FieldType::Binary);
    }
    let base = rust_type.split('<').next().unwrap_or(rust_type);
    let last = base.rsplit("::").next().unwrap_or(base);
    Some(match last {
        "i16" => FieldType::SmallInt,
        "i32" => FieldType::Int,
        "i64" => FieldType::BigInt,
        "String" => FieldType::Char,
        "bool" => FieldType::Boolean,
        "f32" | "f64" => FieldType::Float,
        "Decimal" => FieldType::Decimal,
        "Uuid" => FieldType::Uuid,
        "DateTime" | "NaiveDateTime" => FieldType::Datetime,
        "NaiveDate" => FieldType::Date,
        "NaiveTime" => FieldType::Time,
        "Duration" => FieldType::Timedelta,
        "Value" | "Json" => FieldType::Json,
        _ => return None,
    })
}

/// Field kind for an explicit `kind = "..."`
fn kind_type(kind: &str) -> Option<FieldType> {
    Some(match kind {
        "small_int" => FieldType::SmallInt,
        "int" => FieldType::Int,
        "big_int" => FieldType::BigInt,
        "char" => FieldType::Char,
        "text" => FieldType::Text,
        "boolean" => FieldType::Boolean,
        "float" => FieldType::Float,
        "decimal" => FieldType::Decimal,
        "binary" => FieldType::Binary,
        "uuid" => FieldType::Uuid,
        "datetime" => FieldType::Datetime,
        "date" => FieldType::Date,
        "time" => FieldType::Time,
        "timedelta" => FieldType::Timedelta,
        "json" => FieldType::Json,
        "char_enum" => FieldType::CharEnum,
        "int_enum" => FieldType::IntEnum,
        _ => return None,
    })
}

fn meta_key(meta: &ParseNestedMeta) -> String {
    meta.path.get_ident().map(|i| i.to_string()).unwrap_or_default()
}

/// Bare `key` or `key = true|false`
fn flag_value(meta: &ParseNestedMeta) -> syn::Result<bool> {
    if meta.input.peek(syn::Token![=]) {
        let lit: syn::LitBool = meta.value()?.parse()?;
        Ok(lit.value)
    } else {
        Ok(true)
    }
}

fn string_value(meta: &ParseNestedMeta) -> syn::Result<String> {
    let lit: syn::LitStr = meta.value()?.parse()?;
    Ok(lit.value())
}

fn u32_value(meta: &ParseNestedMeta) -> syn::Result<u32> {
    let lit: syn::LitInt = meta.value()?.parse()?;
    lit.base10_parse()
}

/// `default = <literal>`, including negative numbers
fn literal_value(meta: &ParseNestedMeta) -> syn::Result<Literal> {
    let expr: Expr = meta.value()?.parse()?;
    let (negative, lit) = match &expr {
        Expr::Lit(lit) => (false, &lit.lit),
        Expr::Unary(unary) if matches!(unary.op, UnOp::Neg(_)) => match unary.expr.as_ref() {
            Expr::Lit(lit) => (true, &lit.lit),
            _ => return Err(meta.error("default must be a literal")),
        },
        _ => return Err(meta.error("default must be a literal")),
    };

    Ok(match lit {
        Lit::Bool(b) if !negative => Literal::Bool(b.value),
        Lit::Str(s) if !negative => Literal::Text(s.value()),
        Lit::Int(i) => {
            let value: i64 = i.base10_parse()?;
            Literal::Int(if negative { -value } else { value })
        }
        Lit::Float(f) => {
            let value: f64 = f.base10_parse()?;
            Literal::Float(if negative { -value } else { value })
        }
        _ => return Err(meta.error("unsupported default literal")),
    })
}

fn parse_field_attr(meta: &ParseNestedMeta, attrs: &mut FieldAttrs) -> syn::Result<()> {
    let key = meta_key(meta);
    match key.as_str() {
        "primary_key" => attrs.primary_key = flag_value(meta)?,
        "generated" => attrs.generated = Some(flag_value(meta)?),
        "null" => attrs.null = flag_value(meta)?,
        "unique" => attrs.unique = flag_value(meta)?,
        "index" => attrs.index = flag_value(meta)?,
        "auto_now" => attrs.auto_now = flag_value(meta)?,
        "auto_now_add" => attrs.auto_now_add = flag_value(meta)?,
        "skip" => attrs.skip = flag_value(meta)?,
        "max_length" => attrs.max_length = Some(u32_value(meta)?),
        "max_digits" => attrs.max_digits = Some(u32_value(meta)?),
        "decimal_places" => attrs.decimal_places = Some(u32_value(meta)?),
        "db_column" => attrs.db_column = Some(string_value(meta)?),
        "default" => attrs.default = Some(DefaultValue::Literal(literal_value(meta)?)),
        "default_fn" => {
            string_value(meta)?;
            attrs.default = Some(DefaultValue::Callable);
        }
        "db_default" => attrs.default = Some(DefaultValue::db(string_value(meta)?)),
        "kind" => attrs.kind = Some(string_value(meta)?),
        "foreign_key" => attrs.foreign_key = Some(string_value(meta)?),
        "one_to_one" => attrs.one_to_one = Some(string_value(meta)?),
        "to_field" => attrs.to_field = Some(string_value(meta)?),
        "on_delete" => attrs.on_delete = Some(string_value(meta)?),
        "many_to_many" => attrs.many_to_many = Some(string_value(meta)?),
        "reverse" => attrs.reverse = Some(string_value(meta)?),
        _ => return Err(meta.error(format!("unknown field attribute `{}`", key))),
    }
    Ok(())
}
