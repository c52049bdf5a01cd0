//! Catalog introspection.
//!
//! Reads table lists, columns, keys, checks and indexes straight from
//! `pg_catalog`.
//! All queries here are read-only.

use rekey_sql::{is_shadow_of_any, qualified};
use std::collections::HashSet;

use crate::schema::{
    CheckDescriptor, ColumnDescriptor, FkAction, ForeignKeyDescriptor, IndexDescriptor,
    TableDescriptor,
};
use crate::state::STATE_TABLE;
use crate::{Connection, ConnectionExt, Error, Result};

const TABLES_SQL: &str = r#"
SELECT c.relname::text
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1
  AND c.relkind = 'r'
  AND NOT c.relispartition
ORDER BY c.relname
"#;

const COLUMNS_SQL: &str = r#"
SELECT a.attname::text,
       pg_catalog.format_type(a.atttypid, a.atttypmod),
       NOT a.attnotnull,
       pg_catalog.pg_get_expr(d.adbin, d.adrelid),
       a.attidentity::text,
       a.attgenerated::text
FROM pg_catalog.pg_attribute a
LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE a.attrelid = $1::text::regclass
  AND a.attnum > 0
  AND NOT a.attisdropped
ORDER BY a.attnum
"#;

const PRIMARY_KEY_SQL: &str = r#"
SELECT a.attname::text
FROM pg_catalog.pg_index i
CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
JOIN pg_catalog.pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
WHERE i.indrelid = $1::text::regclass
  AND i.indisprimary
ORDER BY k.ord
"#;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT con.conname::text,
       ARRAY(
           SELECT a.attname::text
           FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
           JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
           ORDER BY k.ord
       ),
       rn.nspname::text,
       rc.relname::text,
       ARRAY(
           SELECT a.attname::text
           FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
           JOIN pg_catalog.pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
           ORDER BY k.ord
       ),
       con.confupdtype::text,
       con.confdeltype::text,
       pg_catalog.pg_get_constraintdef(con.oid)
FROM pg_catalog.pg_constraint con
JOIN pg_catalog.pg_class rc ON rc.oid = con.confrelid
JOIN pg_catalog.pg_namespace rn ON rn.oid = rc.relnamespace
WHERE con.contype = 'f'
  AND con.conrelid = $1::text::regclass
ORDER BY con.conname
"#;

const CHECKS_SQL: &str = r#"
SELECT con.conname::text,
       ARRAY(
           SELECT a.attname::text
           FROM unnest(con.conkey) AS k(attnum)
           JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
       ),
       pg_catalog.pg_get_constraintdef(con.oid)
FROM pg_catalog.pg_constraint con
WHERE con.contype = 'c'
  AND con.conrelid = $1::text::regclass
ORDER BY con.conname
"#;

const INDEXES_SQL: &str = r#"
SELECT ic.relname::text, pg_catalog.pg_get_indexdef(i.indexrelid)
FROM pg_catalog.pg_index i
JOIN pg_catalog.pg_class ic ON ic.oid = i.indexrelid
WHERE i.indrelid = $1::text::regclass
  AND NOT i.indisprimary
ORDER BY ic.relname
"#;

/// All re-keyable tables of `schema`, in catalog (name) order.
pub async fn list_tables<C: Connection + ?Sized>(
    conn: &C,
    schema: &str,
    excluded: &[String],
) -> Result<Vec<String>> {
    let rows = conn.traced().query(TABLES_SQL, &[&schema]).await?;
    let all = rows
        .iter()
        .map(|row| row.try_get::<_, String>(0))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(filter_catalog(all, excluded))
}

/// Drop bookkeeping tables, leftover shadows and explicit exclusions.
///
/// A name ending in `_ulid` is only treated as a shadow when its base table
/// exists too, so a genuine table called `device_ulid` still migrates.
pub fn filter_catalog(all: Vec<String>, excluded: &[String]) -> Vec<String> {
    let shadows: HashSet<&str> = all
        .iter()
        .filter(|name| is_shadow_of_any(name, all.iter().map(String::as_str)))
        .map(String::as_str)
        .collect();

    all.iter()
        .filter(|name| name.as_str() != STATE_TABLE)
        .filter(|name| !shadows.contains(name.as_str()))
        .filter(|name| !excluded.contains(name))
        .cloned()
        .collect()
}

/// Names of every ordinary table currently in `schema`, shadows included.
pub async fn existing_tables<C: Connection + ?Sized>(
    conn: &C,
    schema: &str,
) -> Result<HashSet<String>> {
    let rows = conn.traced().query(TABLES_SQL, &[&schema]).await?;
    rows.iter()
        .map(|row| row.try_get::<_, String>(0).map_err(Error::from))
        .collect()
}

/// Describe one table.
///
/// Fails with [`Error::Introspection`] if the table is gone.
pub async fn describe_table<C: Connection + ?Sized>(
    conn: &C,
    schema: &str,
    table: &str,
) -> Result<TableDescriptor> {
    let on_table = |source| Error::Introspection {
        table: table.to_string(),
        source,
    };
    let regclass = qualified(schema, table);
    let traced = conn.traced();

    let rows = traced
        .query(COLUMNS_SQL, &[&regclass])
        .await
        .map_err(on_table)?;
    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        let default: Option<String> = row.try_get(3).map_err(on_table)?;
        let identity: String = row.try_get(4).map_err(on_table)?;
        let generated: String = row.try_get(5).map_err(on_table)?;
        let (default, generated) = split_default(default, &identity, &generated);
        columns.push(ColumnDescriptor {
            name: row.try_get(0).map_err(on_table)?,
            sql_type: row.try_get(1).map_err(on_table)?,
            nullable: row.try_get(2).map_err(on_table)?,
            default,
            generated,
        });
    }

    let primary_key = traced
        .query(PRIMARY_KEY_SQL, &[&regclass])
        .await
        .map_err(on_table)?
        .iter()
        .map(|row| row.try_get::<_, String>(0))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(on_table)?;

    let mut foreign_keys = Vec::new();
    for row in traced
        .query(FOREIGN_KEYS_SQL, &[&regclass])
        .await
        .map_err(on_table)?
    {
        let on_update: String = row.try_get(5).map_err(on_table)?;
        let on_delete: String = row.try_get(6).map_err(on_table)?;
        foreign_keys.push(ForeignKeyDescriptor {
            name: row.try_get(0).map_err(on_table)?,
            columns: row.try_get(1).map_err(on_table)?,
            references_schema: row.try_get(2).map_err(on_table)?,
            references_table: row.try_get(3).map_err(on_table)?,
            references_columns: row.try_get(4).map_err(on_table)?,
            on_update: FkAction::from_pg_code(&on_update),
            on_delete: FkAction::from_pg_code(&on_delete),
            definition: Some(row.try_get(7).map_err(on_table)?),
        });
    }

    let mut checks = Vec::new();
    for row in traced
        .query(CHECKS_SQL, &[&regclass])
        .await
        .map_err(on_table)?
    {
        checks.push(CheckDescriptor {
            name: row.try_get(0).map_err(on_table)?,
            columns: row.try_get(1).map_err(on_table)?,
            definition: row.try_get(2).map_err(on_table)?,
        });
    }

    let mut indices = Vec::new();
    for row in traced
        .query(INDEXES_SQL, &[&regclass])
        .await
        .map_err(on_table)?
    {
        indices.push(IndexDescriptor {
            name: row.try_get(0).map_err(on_table)?,
            definition: row.try_get(1).map_err(on_table)?,
        });
    }

    Ok(TableDescriptor {
        name: table.to_string(),
        columns,
        primary_key,
        foreign_keys,
        indices,
        checks,
    })
}

/// Sort a raw `pg_attrdef` expression into (default, generated expression).
///
/// Identity columns and `nextval(...)` defaults do not carry over: the shadow
/// has no sequence to draw from.
fn split_default(
    expr: Option<String>,
    identity: &str,
    generated: &str,
) -> (Option<String>, Option<String>) {
    if !generated.is_empty() {
        return (None, expr);
    }
    if !identity.is_empty() {
        return (None, None);
    }
    match expr {
        Some(e) if e.starts_with("nextval(") => (None, None),
        other => (other, None),
    }
}
