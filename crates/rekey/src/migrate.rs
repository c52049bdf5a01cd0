//! Table migrator: builds one table's shadow copy under its new keys.
//!
//! For each table, in dependency order:
//!
//! 1. drop any shadow left by an earlier run, then create it fresh;
//! 2. read every source row (all values as `::text`);
//! 3. pass one: give every row a new id and record it in the id map;
//! 4. pass two: rewrite each reference through the id maps and insert the
//!    rows into the shadow in batches;
//! 5. check the shadow's row count against the source.
//!
//! Assigning every id before composing any row makes self-references work
//! regardless of the order rows come back in.

use rekey_sql::{Ident, qualified};
use tokio_postgres::types::ToSql;
use ulid::Ulid;

use crate::context::{Fixup, MigrationContext};
use crate::ids::{IdMapStore, Lookup, OldId};
use crate::schema::{Schema, TableDescriptor, create_shadow_table_sql};
use crate::solver::MigrationOrder;
use crate::{Connection, ConnectionExt, Error, Result};

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// How a copied column is written into the shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRole {
    /// The table's own `id`: replaced by the row's new id.
    Id,
    /// A reference into `references`' id map.
    Reference { references: String, deferred: bool },
    /// Copied as is.
    Plain,
}

/// A column read from the source and written to the shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedColumn {
    pub name: String,
    /// Type the text value is cast to on insert
    pub cast: String,
    pub role: ColumnRole,
}

/// A shadow row ready to insert, plus the references it left for later.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedRow {
    pub values: Vec<Option<String>>,
    pub deferred: Vec<Fixup>,
}

/// Everything needed to copy one table, derived from its descriptor.
#[derive(Debug, Clone)]
pub struct ShadowLayout {
    pub table: String,
    pub shadow: String,
    pub schema: String,
    /// Non-generated columns, in declaration order.
    pub columns: Vec<CopiedColumn>,
    /// Declared but unconstrained `*_id` columns, kept as they are.
    pub lookalikes: Vec<String>,
    create_sql: String,
}

impl ShadowLayout {
    pub fn new(schema: &Schema, table: &TableDescriptor, order: &MigrationOrder) -> Self {
        let shadow = table.shadow_name();
        let references = schema.references(table);
        let retyped = schema.retyped_columns(table);

        let mut columns = Vec::new();
        let mut lookalikes = Vec::new();
        for col in table.columns.iter().filter(|c| c.generated.is_none()) {
            let role = if col.is_id() {
                ColumnRole::Id
            } else if let Some(r) = references.iter().find(|r| r.column == col.name) {
                ColumnRole::Reference {
                    references: r.references.to_string(),
                    deferred: order.is_deferred(&table.name, &col.name),
                }
            } else {
                if col.looks_like_reference() {
                    lookalikes.push(col.name.clone());
                }
                ColumnRole::Plain
            };
            let cast = if retyped.contains(col.name.as_str()) {
                "text".to_string()
            } else {
                col.sql_type.clone()
            };
            columns.push(CopiedColumn {
                name: col.name.clone(),
                cast,
                role,
            });
        }

        Self {
            table: table.name.clone(),
            create_sql: create_shadow_table_sql(&schema.name, table, &retyped),
            shadow,
            schema: schema.name.clone(),
            columns,
            lookalikes,
        }
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", qualified(&self.schema, &self.shadow))
    }

    pub fn create_sql(&self) -> &str {
        &self.create_sql
    }

    /// Read every source row, all values as text, oldest id first.
    pub fn select_sql(&self, primary_key: &[String]) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}::text", Ident(&c.name)))
            .collect();
        let mut sql = format!(
            "SELECT {} FROM {}",
            cols.join(", "),
            qualified(&self.schema, &self.table)
        );
        if !primary_key.is_empty() {
            let keys: Vec<String> = primary_key.iter().map(|k| format!("{}", Ident(k))).collect();
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        sql
    }

    /// Multi-row insert of `rows` rows, each value cast from text.
    pub fn insert_sql(&self, rows: usize) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}", Ident(&c.name)))
            .collect();
        let width = self.columns.len();
        let tuples: Vec<String> = (0..rows)
            .map(|r| {
                let values: Vec<String> = self
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| cast_param(r * width + i + 1, &c.cast))
                    .collect();
                format!("({})", values.join(", "))
            })
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            qualified(&self.schema, &self.shadow),
            cols.join(", "),
            tuples.join(", ")
        )
    }

    /// Rows per insert: the configured batch size, bounded by the bind
    /// parameter limit.
    pub fn rows_per_insert(&self, batch_size: usize) -> usize {
        let width = self.columns.len().max(1);
        batch_size.clamp(1, MAX_BIND_PARAMS / width)
    }

    /// Index of the `id` column among the copied columns.
    pub fn id_position(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.role == ColumnRole::Id)
    }

    /// Rewrite one source row for the shadow.
    ///
    /// `new_id` is the id assigned to this row in pass one. References are
    /// looked up in `ids`; a value with no mapping is an error, never passed
    /// through.
    pub fn compose_row(
        &self,
        ids: &IdMapStore,
        source: Vec<Option<String>>,
        new_id: Option<Ulid>,
    ) -> Result<ComposedRow> {
        let mut values = Vec::with_capacity(source.len());
        let mut deferred = Vec::new();

        for (col, value) in self.columns.iter().zip(source) {
            let out = match (&col.role, value) {
                (ColumnRole::Id, _) => new_id.map(|id| id.to_string()),
                (_, None) => None,
                (ColumnRole::Plain, Some(v)) => Some(v),
                (
                    ColumnRole::Reference {
                        references,
                        deferred: true,
                    },
                    Some(v),
                ) => {
                    // a deferred column only exists on tables with an id
                    if let Some(row_id) = new_id {
                        deferred.push(Fixup {
                            table: self.table.clone(),
                            column: col.name.clone(),
                            references: references.clone(),
                            row_id,
                            value: OldId::new(v),
                        });
                    }
                    None
                }
                (
                    ColumnRole::Reference {
                        references,
                        deferred: false,
                    },
                    Some(v),
                ) => {
                    let old = OldId::new(v);
                    Some(resolve(ids, &self.table, &col.name, references, &old)?.to_string())
                }
            };
            values.push(out);
        }

        Ok(ComposedRow { values, deferred })
    }
}

fn cast_param(n: usize, cast: &str) -> String {
    if cast == "text" {
        format!("${}::text", n)
    } else {
        format!("${}::text::{}", n, cast)
    }
}

/// Look `old` up in `references`' map or fail naming the offending value.
fn resolve(
    ids: &IdMapStore,
    table: &str,
    column: &str,
    references: &str,
    old: &OldId,
) -> Result<Ulid> {
    match ids.lookup(references, old) {
        Lookup::Mapped(new) => Ok(new),
        Lookup::UnknownTable | Lookup::UnknownId => Err(Error::UnmappedReference {
            table: table.to_string(),
            column: column.to_string(),
            references: references.to_string(),
            value: old.to_string(),
        }),
    }
}

/// What migrating one table did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: String,
    pub shadow: String,
    pub rows: u64,
    /// References queued for the fix-up pass.
    pub deferred: usize,
}

/// Build `table`'s shadow and record its new ids in `ctx`.
pub async fn migrate_table<C: Connection + ?Sized>(
    conn: &C,
    ctx: &mut MigrationContext,
    schema: &Schema,
    table: &TableDescriptor,
    order: &MigrationOrder,
) -> Result<TableReport> {
    let layout = ShadowLayout::new(schema, table, order);
    let traced = conn.traced();

    for column in &layout.lookalikes {
        tracing::warn!(
            table = %table.name,
            column = %column,
            "column looks like a reference but has no foreign key into a re-keyed table, copying as is"
        );
    }

    let shadow_err = |source| Error::ShadowCreate {
        table: table.name.clone(),
        source,
    };
    traced
        .batch_execute(&layout.drop_sql())
        .await
        .map_err(shadow_err)?;
    traced
        .batch_execute(layout.create_sql())
        .await
        .map_err(shadow_err)?;

    let copy_err = |source| Error::RowCopy {
        table: table.name.clone(),
        source,
    };
    let rows = traced
        .query(&layout.select_sql(&table.primary_key), &[])
        .await
        .map_err(copy_err)?;
    let source_rows = rows
        .iter()
        .map(|row| {
            (0..layout.columns.len())
                .map(|i| row.try_get::<_, Option<String>>(i))
                .collect::<std::result::Result<Vec<_>, _>>()
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(copy_err)?;
    drop(rows);

    ctx.ids.register(&table.name);
    if source_rows.is_empty() {
        tracing::debug!(table = %table.name, "no rows to copy");
        return Ok(TableReport {
            table: table.name.clone(),
            shadow: layout.shadow,
            rows: 0,
            deferred: 0,
        });
    }

    // Pass one: every row gets its new id before any row is composed.
    let id_pos = layout.id_position();
    let mut new_ids = Vec::with_capacity(source_rows.len());
    for values in &source_rows {
        let new_id = id_pos.map(|_| ctx.next_id());
        if let (Some(pos), Some(new)) = (id_pos, new_id) {
            if let Some(old) = &values[pos] {
                ctx.ids.record(&table.name, OldId::new(old.as_str()), new)?;
            }
        }
        new_ids.push(new_id);
    }

    // Pass two: compose and insert.
    let per_insert = layout.rows_per_insert(ctx.config.batch_size);
    let mut deferred = 0;
    let mut batch: Vec<ComposedRow> = Vec::with_capacity(per_insert);
    let total = source_rows.len();
    for (values, new_id) in source_rows.into_iter().zip(new_ids) {
        let mut row = layout.compose_row(&ctx.ids, values, new_id)?;
        deferred += row.deferred.len();
        for fixup in row.deferred.drain(..) {
            ctx.defer(fixup);
        }
        batch.push(row);
        if batch.len() == per_insert {
            insert_batch(conn, &layout, &batch).await.map_err(copy_err)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        insert_batch(conn, &layout, &batch).await.map_err(copy_err)?;
    }

    let count_sql = format!(
        "SELECT count(*) FROM {}",
        qualified(&layout.schema, &layout.shadow)
    );
    let actual: i64 = traced
        .query_one(&count_sql, &[])
        .await
        .map_err(copy_err)?
        .try_get(0)
        .map_err(copy_err)?;
    if actual as u64 != total as u64 {
        return Err(Error::RowCountMismatch {
            table: table.name.clone(),
            expected: total as u64,
            actual: actual as u64,
        });
    }

    Ok(TableReport {
        table: table.name.clone(),
        shadow: layout.shadow,
        rows: total as u64,
        deferred,
    })
}

async fn insert_batch<C: Connection + ?Sized>(
    conn: &C,
    layout: &ShadowLayout,
    batch: &[ComposedRow],
) -> std::result::Result<u64, tokio_postgres::Error> {
    let sql = layout.insert_sql(batch.len());
    let params: Vec<&(dyn ToSql + Sync)> = batch
        .iter()
        .flat_map(|row| row.values.iter().map(|v| v as &(dyn ToSql + Sync)))
        .collect();
    conn.traced().execute(&sql, &params).await
}

/// Fill in every deferred reference now that all id maps are complete.
///
/// Returns how many rows were updated.
pub async fn apply_fixups<C: Connection + ?Sized>(
    conn: &C,
    ctx: &mut MigrationContext,
    schema: &Schema,
) -> Result<usize> {
    let fixups = ctx.take_fixups();
    let traced = conn.traced();

    for fixup in &fixups {
        let new = resolve(
            &ctx.ids,
            &fixup.table,
            &fixup.column,
            &fixup.references,
            &fixup.value,
        )?;
        let shadow = schema
            .get_table(&fixup.table)
            .map(TableDescriptor::shadow_name)
            .unwrap_or_else(|| rekey_sql::shadow_table_name(&fixup.table));
        let sql = format!(
            "UPDATE {} SET {} = $1 WHERE \"id\" = $2",
            qualified(&schema.name, &shadow),
            Ident(&fixup.column)
        );
        traced
            .execute(&sql, &[&new.to_string(), &fixup.row_id.to_string()])
            .await
            .map_err(|source| Error::RowCopy {
                table: fixup.table.clone(),
                source,
            })?;
    }

    Ok(fixups.len())
}
