//! Introspected table descriptions and the shadow-table DDL derived from them.
//!
//! Descriptors are built from `pg_catalog` by [`crate::introspect`], never
//! from a hard-coded model, and are immutable once built.

use indexmap::IndexMap;
use rekey_sql::{Ident, ULID_SQL_TYPE, pkey_constraint_name, qualified, quote_ident};
use std::collections::HashSet;

use crate::{Error, Result};

/// Name of the column that is always re-keyed.
pub const ID_COLUMN: &str = "id";

/// A column as declared in the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Declared type as rendered by `format_type` (keeps modifiers and
    /// user-defined/enum type names intact)
    pub sql_type: String,
    /// Whether the column allows NULL
    pub nullable: bool,
    /// Default expression, with serial/identity defaults already removed
    pub default: Option<String>,
    /// Expression of a `GENERATED ALWAYS AS (...) STORED` column
    pub generated: Option<String>,
}

impl ColumnDescriptor {
    /// Whether this is the column named `id`.
    pub fn is_id(&self) -> bool {
        self.name == ID_COLUMN
    }

    /// Whether the name follows the `<thing>_id` convention.
    ///
    /// Only used for diagnostics: columns are re-keyed based on declared
    /// foreign keys, never on naming.
    pub fn looks_like_reference(&self) -> bool {
        self.name.len() > 3 && self.name.ends_with("_id")
    }
}

/// Referential action of a foreign key (`ON UPDATE` / `ON DELETE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FkAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl FkAction {
    /// Decode `pg_constraint.confupdtype` / `confdeltype`.
    pub fn from_pg_code(code: &str) -> Self {
        match code {
            "r" => FkAction::Restrict,
            "c" => FkAction::Cascade,
            "n" => FkAction::SetNull,
            "d" => FkAction::SetDefault,
            _ => FkAction::NoAction,
        }
    }

    pub fn to_sql(self) -> &'static str {
        match self {
            FkAction::NoAction => "NO ACTION",
            FkAction::Restrict => "RESTRICT",
            FkAction::Cascade => "CASCADE",
            FkAction::SetNull => "SET NULL",
            FkAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// A foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDescriptor {
    /// Constraint name
    pub name: String,
    /// Column(s) in this table
    pub columns: Vec<String>,
    /// Schema of the referenced table
    pub references_schema: String,
    /// Referenced table
    pub references_table: String,
    /// Referenced column(s)
    pub references_columns: Vec<String>,
    pub on_update: FkAction,
    pub on_delete: FkAction,
    /// Full definition from `pg_get_constraintdef`, when read from the
    /// catalog. Carries `MATCH`, `DEFERRABLE` and `INITIALLY` clauses.
    pub definition: Option<String>,
}

impl ForeignKeyDescriptor {
    /// The local column, for single-column keys.
    pub fn single_column(&self) -> Option<&str> {
        match self.columns.as_slice() {
            [column] => Some(column),
            _ => None,
        }
    }

    /// `ALTER TABLE ... ADD CONSTRAINT` re-creating this key on `table`.
    pub fn to_add_sql(&self, schema: &str, table: &str) -> String {
        if let Some(definition) = &self.definition {
            return format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                qualified(schema, table),
                Ident(&self.name),
                definition
            );
        }
        let cols: Vec<_> = self.columns.iter().map(|c| quote_ident(c)).collect();
        let ref_cols: Vec<_> = self
            .references_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect();
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {}",
            qualified(schema, table),
            Ident(&self.name),
            cols.join(", "),
            qualified(&self.references_schema, &self.references_table),
            ref_cols.join(", "),
            self.on_update.to_sql(),
            self.on_delete.to_sql(),
        )
    }
}

/// A secondary (non-primary-key) index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    /// Full `CREATE INDEX` statement from `pg_get_indexdef`
    pub definition: String,
}

/// A `CHECK` constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckDescriptor {
    pub name: String,
    /// Columns the expression reads
    pub columns: Vec<String>,
    /// `CHECK (...)` clause from `pg_get_constraintdef`, `NOT VALID` included
    pub definition: String,
}

impl CheckDescriptor {
    pub fn to_add_sql(&self, schema: &str, table: &str) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            qualified(schema, table),
            Ident(&self.name),
            self.definition
        )
    }
}

/// Everything rekey needs to know about one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    /// Table name
    pub name: String,
    /// Columns, in declaration order
    pub columns: Vec<ColumnDescriptor>,
    /// Primary key column(s), in key order
    pub primary_key: Vec<String>,
    /// Foreign keys declared on this table
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    /// Secondary indices
    pub indices: Vec<IndexDescriptor>,
    /// Check constraints
    pub checks: Vec<CheckDescriptor>,
}

impl TableDescriptor {
    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether this table has an `id` column to re-key.
    pub fn has_id(&self) -> bool {
        self.columns.iter().any(|c| c.is_id())
    }

    /// Name of this table's shadow table.
    pub fn shadow_name(&self) -> String {
        rekey_sql::shadow_table_name(&self.name)
    }

    /// Primary key declared on the shadow: the original key, or `id` when
    /// the original had none.
    pub fn shadow_primary_key(&self) -> Vec<&str> {
        if !self.primary_key.is_empty() {
            self.primary_key.iter().map(String::as_str).collect()
        } else if self.has_id() {
            vec![ID_COLUMN]
        } else {
            Vec::new()
        }
    }
}

/// A remapped column: `table.column` holds ids of `references`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference<'a> {
    pub column: &'a str,
    pub references: &'a str,
    pub nullable: bool,
}

/// The set of tables taking part in one run.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// Postgres schema (namespace) name
    pub name: String,
    /// Tables, in catalog order
    pub tables: IndexMap<String, TableDescriptor>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: IndexMap::new(),
        }
    }

    /// Add a table, keeping insertion (catalog) order.
    pub fn insert(&mut self, table: TableDescriptor) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Get a table by name.
    pub fn get_table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    /// Whether `fk` points at the re-keyed `id` of a table in this run.
    pub fn is_rekeyed_target(&self, fk: &ForeignKeyDescriptor) -> bool {
        fk.references_schema == self.name
            && fk.references_columns.iter().any(|c| c == ID_COLUMN)
            && self
                .get_table(&fk.references_table)
                .is_some_and(TableDescriptor::has_id)
    }

    /// Columns of `table` whose values must be remapped through an id map.
    pub fn references<'a>(&'a self, table: &'a TableDescriptor) -> Vec<Reference<'a>> {
        table
            .foreign_keys
            .iter()
            .filter(|fk| self.is_rekeyed_target(fk))
            .filter_map(|fk| {
                let column = fk.single_column()?;
                let nullable = table.column(column).is_none_or(|c| c.nullable);
                Some(Reference {
                    column,
                    references: &fk.references_table,
                    nullable,
                })
            })
            .collect()
    }

    /// Columns of `table` retyped to the identifier type.
    pub fn retyped_columns<'a>(&'a self, table: &'a TableDescriptor) -> HashSet<&'a str> {
        let mut retyped: HashSet<&str> = self
            .references(table)
            .into_iter()
            .map(|r| r.column)
            .collect();
        if table.has_id() {
            retyped.insert(ID_COLUMN);
        }
        retyped
    }

    /// Reject shapes the engine cannot re-key safely.
    ///
    /// A composite foreign key into a re-keyed `id` would need a multi-column
    /// remap; rather than corrupting it, the run stops before touching data.
    pub fn validate(&self) -> Result<()> {
        for table in self.tables.values() {
            for fk in &table.foreign_keys {
                if fk.columns.len() > 1 && self.is_rekeyed_target(fk) {
                    return Err(Error::Unsupported {
                        table: table.name.clone(),
                        reason: format!(
                            "composite foreign key '{}' ({}) references re-keyed '{}.id'",
                            fk.name,
                            fk.columns.join(", "),
                            fk.references_table
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Generate the `CREATE TABLE` statement for `table`'s shadow.
///
/// Retyped columns become [`ULID_SQL_TYPE`] and lose their default; every
/// other column keeps its declared type, nullability and default. No foreign
/// keys are declared: they are re-created after cutover.
pub fn create_shadow_table_sql(
    schema: &str,
    table: &TableDescriptor,
    retyped: &HashSet<&str>,
) -> String {
    let shadow = table.shadow_name();
    let mut sql = format!("CREATE TABLE {} (\n", qualified(schema, &shadow));

    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|col| {
            let is_retyped = retyped.contains(col.name.as_str());
            let ty = if is_retyped {
                ULID_SQL_TYPE
            } else {
                col.sql_type.as_str()
            };
            let mut def = format!("    {} {}", Ident(&col.name), ty);

            if let Some(expr) = &col.generated {
                def.push_str(&format!(" GENERATED ALWAYS AS ({}) STORED", expr));
            }
            if !col.nullable {
                def.push_str(" NOT NULL");
            }
            if let Some(default) = col.default.as_ref().filter(|_| !is_retyped) {
                def.push_str(&format!(" DEFAULT {}", default));
            }

            def
        })
        .collect();

    let pk = table.shadow_primary_key();
    if !pk.is_empty() {
        let quoted: Vec<_> = pk.iter().map(|c| quote_ident(c)).collect();
        parts.push(format!(
            "    CONSTRAINT {} PRIMARY KEY ({})",
            Ident(pkey_constraint_name(&shadow)),
            quoted.join(", ")
        ));
    }

    sql.push_str(&parts.join(",\n"));
    sql.push_str("\n)");
    sql
}
