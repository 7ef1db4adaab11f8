//! Schema editor
//!
//! Renders DDL for each kind of schema change and executes it through a
//! [`SqlExecutor`]. Rendering is pure so the same statements serve both live
//! application and SQL preview.

use async_trait::async_trait;

use crate::db::executor::SqlExecutor;
use crate::error::{Error, Result};
use crate::state::{DefaultValue, FieldOptions, FieldState, FieldType, Literal};
use crate::utils::naming::{field_index_name, unique_constraint_name};

/// Quote an identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// One column alteration: the option sets before and after, plus an optional rename
#[derive(Debug, Clone, Copy)]
pub struct ColumnAlteration<'a> {
    pub field_name: &'a str,
    pub old: &'a FieldOptions,
    pub new: &'a FieldOptions,
    pub new_name: Option<&'a str>,
}

impl<'a> ColumnAlteration<'a> {
    /// The alteration that undoes this one
    pub fn reversed(&self) -> ColumnAlteration<'a> {
        match self.new_name {
            Some(new_name) => ColumnAlteration {
                field_name: new_name,
                old: self.new,
                new: self.old,
                new_name: Some(self.field_name),
            },
            None => ColumnAlteration {
                field_name: self.field_name,
                old: self.new,
                new: self.old,
                new_name: None,
            },
        }
    }
}

/// Dialect-specific DDL rendering and execution
#[async_trait]
pub trait SchemaEditor: Send + Sync {
    /// Physical column type for a field
    fn column_type(&self, field: &FieldState) -> Result<String>;

    fn sql_create_model(&self, table: &str, fields: &[FieldState]) -> Result<Vec<String>>;
    fn sql_drop_model(&self, table: &str) -> Vec<String>;
    fn sql_rename_model(&self, old_table: &str, new_table: &str) -> Vec<String>;
    fn sql_add_field(&self, table: &str, field: &FieldState) -> Result<Vec<String>>;
    fn sql_remove_field(&self, table: &str, column: &str) -> Vec<String>;
    fn sql_alter_field(&self, table: &str, alteration: &ColumnAlteration<'_>) -> Result<Vec<String>>;
    fn sql_rename_field(&self, table: &str, old_column: &str, new_column: &str) -> Vec<String>;
    fn sql_create_index(&self, table: &str, name: &str, columns: &[String], unique: bool) -> Vec<String>;
    fn sql_drop_index(&self, name: &str) -> Vec<String>;

    async fn create_model(
        &self,
        executor: &mut dyn SqlExecutor,
        table: &str,
        fields: &[FieldState],
    ) -> Result<()> {
        let statements = self.sql_create_model(table, fields)?;
        executor.execute_batch(&statements).await
    }

    async fn drop_model(&self, executor: &mut dyn SqlExecutor, table: &str) -> Result<()> {
        executor.execute_batch(&self.sql_drop_model(table)).await
    }

    async fn rename_model(
        &self,
        executor: &mut dyn SqlExecutor,
        old_table: &str,
        new_table: &str,
    ) -> Result<()> {
        executor
            .execute_batch(&self.sql_rename_model(old_table, new_table))
            .await
    }

    async fn add_field(
        &self,
        executor: &mut dyn SqlExecutor,
        table: &str,
        field: &FieldState,
    ) -> Result<()> {
        let statements = self.sql_add_field(table, field)?;
        executor.execute_batch(&statements).await
    }

    async fn remove_field(&self, executor: &mut dyn SqlExecutor, table: &str, column: &str) -> Result<()> {
        executor
            .execute_batch(&self.sql_remove_field(table, column))
            .await
    }

    async fn alter_field(
        &self,
        executor: &mut dyn SqlExecutor,
        table: &str,
        alteration: &ColumnAlteration<'_>,
    ) -> Result<()> {
        let statements = self.sql_alter_field(table, alteration)?;
        executor.execute_batch(&statements).await
    }

    async fn rename_field(
        &self,
        executor: &mut dyn SqlExecutor,
        table: &str,
        old_column: &str,
        new_column: &str,
    ) -> Result<()> {
        executor
            .execute_batch(&self.sql_rename_field(table, old_column, new_column))
            .await
    }

    async fn create_index(
        &self,
        executor: &mut dyn SqlExecutor,
        table: &str,
        name: &str,
        columns: &[String],
        unique: bool,
    ) -> Result<()> {
        executor
            .execute_batch(&self.sql_create_index(table, name, columns, unique))
            .await
    }

    async fn drop_index(&self, executor: &mut dyn SqlExecutor, name: &str) -> Result<()> {
        executor.execute_batch(&self.sql_drop_index(name)).await
    }
}

/// PostgreSQL schema editor
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresSchemaEditor;

impl PostgresSchemaEditor {
    pub fn new() -> Self {
        Self
    }

    /// SQL for a default, `None` when the default is not rendered
    fn default_sql(default: Option<&DefaultValue>) -> Option<String> {
        match default? {
            DefaultValue::Callable => None,
            DefaultValue::DbExpr(expr) => Some(expr.clone()),
            DefaultValue::Literal(Literal::Bool(true)) => Some("TRUE".to_string()),
            DefaultValue::Literal(Literal::Bool(false)) => Some("FALSE".to_string()),
            DefaultValue::Literal(Literal::Int(i)) => Some(i.to_string()),
            DefaultValue::Literal(Literal::Float(f)) => Some(f.to_string()),
            DefaultValue::Literal(Literal::Text(s)) => Some(quote_literal(s)),
        }
    }

    fn on_delete_sql(field: &FieldState) -> Result<String> {
        let action = field
            .on_delete
            .as_deref()
            .unwrap_or("CASCADE")
            .to_uppercase()
            .replace('_', " ");
        match action.as_str() {
            "CASCADE" | "RESTRICT" | "SET NULL" | "SET DEFAULT" | "NO ACTION" => Ok(action),
            _ => Err(Error::InvalidMigration(format!(
                "Unsupported on_delete `{}` on field `{}`",
                action, field.name
            ))),
        }
    }

    fn column_def(&self, field: &FieldState) -> Result<String> {
        let mut parts = vec![quote_ident(&field.column_name()), self.column_type(field)?];

        if field.primary_key {
            if field.generated && field.field_type.integer_rank().is_some() {
                parts.push("GENERATED BY DEFAULT AS IDENTITY".to_string());
            }
            parts.push("PRIMARY KEY".to_string());
        } else {
            if !field.null {
                parts.push("NOT NULL".to_string());
            }
            if field.unique || field.field_type == FieldType::OneToOne {
                parts.push("UNIQUE".to_string());
            }
        }

        if let Some(default) = Self::default_sql(field.default.as_ref()) {
            parts.push(format!("DEFAULT {}", default));
        }

        if field.field_type.is_relation() {
            let related_table = field.related_table.as_deref().ok_or_else(|| {
                Error::InvalidMigration(format!("Relation `{}` has no related table", field.name))
            })?;
            parts.push(format!(
                "REFERENCES {} ({}) ON DELETE {}",
                quote_ident(related_table),
                quote_ident(field.to_field.as_deref().unwrap_or("id")),
                Self::on_delete_sql(field)?
            ));
        }

        Ok(parts.join(" "))
    }

    fn field_index_sql(table: &str, field: &FieldState) -> Option<String> {
        if !field.index || field.unique || field.primary_key {
            return None;
        }
        let column = field.column_name();
        Some(format!(
            "CREATE INDEX {} ON {} ({});",
            quote_ident(&field_index_name(table, &column)),
            quote_ident(table),
            quote_ident(&column)
        ))
    }

    /// Field as described by an option set, typed from the set or a fallback
    fn field_from_options(name: &str, fallback: FieldType, options: &FieldOptions) -> Result<FieldState> {
        let mut field = FieldState::new(name, fallback);
        field.merge_options(options)?;
        Ok(field)
    }
}

#[async_trait]
impl SchemaEditor for PostgresSchemaEditor {
    fn column_type(&self, field: &FieldState) -> Result<String> {
        let sql = match field.field_type {
            FieldType::Int | FieldType::IntEnum => "INTEGER".to_string(),
            FieldType::SmallInt => "SMALLINT".to_string(),
            FieldType::BigInt => "BIGINT".to_string(),
            FieldType::Char | FieldType::CharEnum => {
                format!("VARCHAR({})", field.max_length.unwrap_or(255))
            }
            FieldType::Text => "TEXT".to_string(),
            FieldType::Boolean => "BOOLEAN".to_string(),
            FieldType::Float => "DOUBLE PRECISION".to_string(),
            FieldType::Decimal => format!(
                "NUMERIC({}, {})",
                field.max_digits.unwrap_or(18),
                field.decimal_places.unwrap_or(6)
            ),
            FieldType::Binary => "BYTEA".to_string(),
            FieldType::Uuid => "UUID".to_string(),
            FieldType::Datetime => "TIMESTAMPTZ".to_string(),
            FieldType::Date => "DATE".to_string(),
            FieldType::Time => "TIME".to_string(),
            FieldType::Timedelta => "INTERVAL".to_string(),
            FieldType::Json => "JSONB".to_string(),
            FieldType::ForeignKey | FieldType::OneToOne => match field.referenced_type {
                Some(FieldType::SmallInt) => "SMALLINT".to_string(),
                Some(FieldType::Int) => "INTEGER".to_string(),
                Some(FieldType::BigInt) => "BIGINT".to_string(),
                Some(FieldType::Uuid) => "UUID".to_string(),
                Some(FieldType::Char) => format!("VARCHAR({})", field.max_length.unwrap_or(255)),
                Some(other) => {
                    return Err(Error::InvalidMigration(format!(
                        "Relation `{}` references unsupported key type {}",
                        field.name, other
                    )))
                }
                None => {
                    return Err(Error::InvalidMigration(format!(
                        "Relation `{}` has no referenced key type",
                        field.name
                    )))
                }
            },
            FieldType::ManyToMany | FieldType::BackwardForeignKey | FieldType::BackwardOneToOne => {
                return Err(Error::InvalidMigration(format!(
                    "Field `{}` of type {} has no column",
                    field.name, field.field_type
                )))
            }
        };
        Ok(sql)
    }

    fn sql_create_model(&self, table: &str, fields: &[FieldState]) -> Result<Vec<String>> {
        let columns = fields
            .iter()
            .filter(|f| f.field_type.is_schema_field())
            .map(|f| self.column_def(f))
            .collect::<Result<Vec<_>>>()?;

        let mut statements = vec![format!(
            "CREATE TABLE {} (\n    {}\n);",
            quote_ident(table),
            columns.join(",\n    ")
        )];
        statements.extend(
            fields
                .iter()
                .filter(|f| f.field_type.is_schema_field())
                .filter_map(|f| Self::field_index_sql(table, f)),
        );
        Ok(statements)
    }

    fn sql_drop_model(&self, table: &str) -> Vec<String> {
        vec![format!("DROP TABLE IF EXISTS {};", quote_ident(table))]
    }

    fn sql_rename_model(&self, old_table: &str, new_table: &str) -> Vec<String> {
        if old_table == new_table {
            return Vec::new();
        }
        vec![format!(
            "ALTER TABLE {} RENAME TO {};",
            quote_ident(old_table),
            quote_ident(new_table)
        )]
    }

    fn sql_add_field(&self, table: &str, field: &FieldState) -> Result<Vec<String>> {
        let mut statements = vec![format!(
            "ALTER TABLE {} ADD COLUMN {};",
            quote_ident(table),
            self.column_def(field)?
        )];
        statements.extend(Self::field_index_sql(table, field));
        Ok(statements)
    }

    fn sql_remove_field(&self, table: &str, column: &str) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {};",
            quote_ident(table),
            quote_ident(column)
        )]
    }

    /// Type, nullability, default, unique and index changes, then any rename.
    ///
    /// The foreign key constraint itself is left alone: changing `on_delete` or
    /// `to_field` only updates migration state and is logged as a warning.
    fn sql_alter_field(&self, table: &str, alteration: &ColumnAlteration<'_>) -> Result<Vec<String>> {
        let old_type = match alteration.old.field_type()? {
            Some(t) => t,
            None => alteration.new.field_type()?.ok_or_else(|| {
                Error::InvalidMigration(format!(
                    "Alteration of `{}` carries no field type",
                    alteration.field_name
                ))
            })?,
        };
        let new_name = alteration.new_name.unwrap_or(alteration.field_name);
        let before = Self::field_from_options(alteration.field_name, old_type, alteration.old)?;
        let after = Self::field_from_options(
            new_name,
            old_type,
            &alteration.old.merged(alteration.new),
        )?;

        let table_sql = quote_ident(table);
        let old_column = before.column_name();
        let new_column = after.column_name();
        let column_sql = quote_ident(&old_column);
        let alter = |clause: String| format!("ALTER TABLE {} ALTER COLUMN {} {};", table_sql, column_sql, clause);
        let mut statements = Vec::new();

        let new_type = self.column_type(&after)?;
        if self.column_type(&before).ok().as_deref() != Some(new_type.as_str()) {
            statements.push(alter(format!("TYPE {}", new_type)));
        }

        if before.null != after.null && !after.primary_key {
            statements.push(alter(
                if after.null { "DROP NOT NULL" } else { "SET NOT NULL" }.to_string(),
            ));
        }

        let old_default = Self::default_sql(before.default.as_ref());
        let new_default = Self::default_sql(after.default.as_ref());
        if old_default != new_default {
            statements.push(alter(match new_default {
                Some(default) => format!("SET DEFAULT {}", default),
                None => "DROP DEFAULT".to_string(),
            }));
        }

        if before.unique != after.unique && !before.primary_key && !after.primary_key {
            let constraint = quote_ident(&unique_constraint_name(table, &old_column));
            statements.push(if after.unique {
                format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({});",
                    table_sql, constraint, column_sql
                )
            } else {
                format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};", table_sql, constraint)
            });
        }

        if before.index != after.index {
            let index = quote_ident(&field_index_name(table, &old_column));
            statements.push(if after.index {
                format!("CREATE INDEX {} ON {} ({});", index, table_sql, column_sql)
            } else {
                format!("DROP INDEX IF EXISTS {};", index)
            });
        }

        if before.on_delete != after.on_delete || before.to_field != after.to_field {
            tracing::warn!(
                table = table,
                column = %old_column,
                "Foreign key action or target changed; the existing constraint is not rewritten"
            );
        }

        if old_column != new_column {
            statements.extend(self.sql_rename_field(table, &old_column, &new_column));
        }

        Ok(statements)
    }

    /// Renames the column along with the field index and unique constraint
    /// named after it, so later toggles and reversals find them by the new name.
    /// A unique constraint's backing index shares its name; renaming the index
    /// renames the constraint.
    fn sql_rename_field(&self, table: &str, old_column: &str, new_column: &str) -> Vec<String> {
        if old_column == new_column {
            return Vec::new();
        }
        let rename_index = |old: String, new: String| {
            format!("ALTER INDEX IF EXISTS {} RENAME TO {};", quote_ident(&old), quote_ident(&new))
        };
        vec![
            format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {};",
                quote_ident(table),
                quote_ident(old_column),
                quote_ident(new_column)
            ),
            rename_index(field_index_name(table, old_column), field_index_name(table, new_column)),
            rename_index(
                unique_constraint_name(table, old_column),
                unique_constraint_name(table, new_column),
            ),
        ]
    }

    fn sql_create_index(&self, table: &str, name: &str, columns: &[String], unique: bool) -> Vec<String> {
        let columns = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>();
        vec![format!(
            "CREATE {}INDEX {} ON {} ({});",
            if unique { "UNIQUE " } else { "" },
            quote_ident(name),
            quote_ident(table),
            columns.join(", ")
        )]
    }

    fn sql_drop_index(&self, name: &str) -> Vec<String> {
        vec![format!("DROP INDEX IF EXISTS {};", quote_ident(name))]
    }
}
