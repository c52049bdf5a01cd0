//! Persisted per-table progress of a run.
//!
//! Each table moves `pending → shadowed → cutover`. The record lives in the
//! migrated schema itself, so after a failure `rekey status` shows exactly
//! which tables have shadows and whether the cutover happened.

use chrono::{DateTime, Utc};
use rekey_sql::qualified;
use std::fmt;
use std::str::FromStr;

use crate::{Connection, ConnectionExt, Error, Result};

/// Name of the bookkeeping table. Never migrated itself.
pub const STATE_TABLE: &str = "_rekey_state";

/// Where a table is in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePhase {
    /// Scheduled; no complete shadow yet.
    Pending,
    /// Shadow table fully populated.
    Shadowed,
    /// Shadow promoted to the original name.
    Cutover,
}

impl TablePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TablePhase::Pending => "pending",
            TablePhase::Shadowed => "shadowed",
            TablePhase::Cutover => "cutover",
        }
    }
}

impl fmt::Display for TablePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TablePhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TablePhase::Pending),
            "shadowed" => Ok(TablePhase::Shadowed),
            "cutover" => Ok(TablePhase::Cutover),
            other => Err(format!("unknown table phase '{}'", other)),
        }
    }
}

/// One row of the state record.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub table: String,
    pub phase: TablePhase,
    /// Rows copied into the shadow, once known.
    pub rows: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

pub fn create_state_table_sql(schema: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
             table_name TEXT PRIMARY KEY,\n    \
             phase TEXT NOT NULL,\n    \
             row_count BIGINT,\n    \
             updated_at TIMESTAMPTZ NOT NULL DEFAULT now()\n\
         )",
        qualified(schema, STATE_TABLE)
    )
}

pub fn upsert_state_sql(schema: &str) -> String {
    format!(
        "INSERT INTO {} (table_name, phase, row_count) VALUES ($1, $2, $3) \
         ON CONFLICT (table_name) DO UPDATE \
         SET phase = EXCLUDED.phase, \
             row_count = COALESCE(EXCLUDED.row_count, {}.row_count), \
             updated_at = now()",
        qualified(schema, STATE_TABLE),
        qualified(schema, STATE_TABLE),
    )
}

/// Create the state table if needed.
pub async fn ensure<C: Connection + ?Sized>(conn: &C, schema: &str) -> Result<()> {
    conn.traced()
        .batch_execute(&create_state_table_sql(schema))
        .await?;
    Ok(())
}

/// Record `table` as being in `phase`.
pub async fn mark<C: Connection + ?Sized>(
    conn: &C,
    schema: &str,
    table: &str,
    phase: TablePhase,
    rows: Option<i64>,
) -> Result<()> {
    conn.traced()
        .execute(&upsert_state_sql(schema), &[&table, &phase.as_str(), &rows])
        .await?;
    Ok(())
}

/// Read the whole record; empty if no run ever started.
pub async fn load<C: Connection + ?Sized>(conn: &C, schema: &str) -> Result<Vec<StateEntry>> {
    let traced = conn.traced();
    let exists: bool = traced
        .query_one(
            "SELECT to_regclass($1) IS NOT NULL",
            &[&qualified(schema, STATE_TABLE)],
        )
        .await?
        .try_get(0)?;
    if !exists {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT table_name, phase, row_count, updated_at FROM {} ORDER BY updated_at, table_name",
        qualified(schema, STATE_TABLE)
    );
    let mut entries = Vec::new();
    for row in traced.query(&sql, &[]).await? {
        let table: String = row.try_get(0)?;
        let phase = parse_phase(&table, row.try_get(1)?)?;
        entries.push(StateEntry {
            table,
            phase,
            rows: row.try_get(2)?,
            updated_at: row.try_get(3)?,
        });
    }
    Ok(entries)
}

fn parse_phase(table: &str, raw: &str) -> Result<TablePhase> {
    raw.parse().map_err(|_| Error::CorruptState {
        table: table.to_string(),
        phase: raw.to_string(),
    })
}
