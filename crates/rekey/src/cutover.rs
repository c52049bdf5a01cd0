//! Cutover: promote every shadow table to its original name in one
//! transaction.
//!
//! Tables are handled in reverse migration order, so a table is dropped
//! before anything it references. Once all shadows are promoted, checks,
//! secondary indexes and foreign keys of the promoted tables are re-created
//! under their original names. Indexes go in before any foreign key, since a
//! key may reference a unique column other than `id`. If any statement fails
//! the whole transaction rolls back and the original tables are untouched.

use rekey_sql::{Ident, pkey_constraint_name, qualified};
use std::collections::HashSet;

use crate::schema::{Schema, TableDescriptor};
use crate::solver::MigrationOrder;
use crate::state::{self, TablePhase};
use crate::{Connection, ConnectionExt, Error, Result};

/// One statement of the cutover transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CutoverStep {
    DropOriginal { table: String },
    RenameShadow { table: String, shadow: String },
    RenamePrimaryKey { table: String, from: String, to: String },
    AddCheck { table: String, sql: String },
    AddForeignKey { table: String, sql: String },
    CreateIndex { table: String, sql: String },
}

impl CutoverStep {
    /// Table the step belongs to, for error reports.
    pub fn table(&self) -> &str {
        match self {
            CutoverStep::DropOriginal { table }
            | CutoverStep::RenameShadow { table, .. }
            | CutoverStep::RenamePrimaryKey { table, .. }
            | CutoverStep::AddCheck { table, .. }
            | CutoverStep::AddForeignKey { table, .. }
            | CutoverStep::CreateIndex { table, .. } => table,
        }
    }

    pub fn sql(&self, schema: &str) -> String {
        match self {
            CutoverStep::DropOriginal { table } => {
                format!("DROP TABLE {} CASCADE", qualified(schema, table))
            }
            CutoverStep::RenameShadow { table, shadow } => format!(
                "ALTER TABLE {} RENAME TO {}",
                qualified(schema, shadow),
                Ident(table)
            ),
            CutoverStep::RenamePrimaryKey { table, from, to } => format!(
                "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
                qualified(schema, table),
                Ident(from),
                Ident(to)
            ),
            CutoverStep::AddCheck { sql, .. }
            | CutoverStep::AddForeignKey { sql, .. }
            | CutoverStep::CreateIndex { sql, .. } => sql.clone(),
        }
    }
}

/// The full cutover transaction, computed before anything runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CutoverPlan {
    pub steps: Vec<CutoverStep>,
    /// Tables whose shadow gets promoted, in cutover order.
    pub promoted: Vec<String>,
}

impl CutoverPlan {
    /// Plan the cutover of `order`'s tables given the tables that currently
    /// exist in the schema.
    ///
    /// A table whose shadow is missing is skipped. A table whose original is
    /// missing (a previous cutover died after the drop) only gets the rename.
    pub fn build(schema: &Schema, order: &MigrationOrder, existing: &HashSet<String>) -> Self {
        let mut plan = CutoverPlan::default();

        for name in order.cutover_order() {
            let Some(table) = schema.get_table(name) else {
                continue;
            };
            let shadow = table.shadow_name();
            if !existing.contains(&shadow) {
                tracing::warn!(table = %name, shadow = %shadow, "no shadow table, skipping");
                continue;
            }
            if existing.contains(name) {
                plan.steps.push(CutoverStep::DropOriginal {
                    table: name.to_string(),
                });
            }
            plan.steps.push(CutoverStep::RenameShadow {
                table: name.to_string(),
                shadow: shadow.clone(),
            });
            if !table.shadow_primary_key().is_empty() {
                plan.steps.push(CutoverStep::RenamePrimaryKey {
                    table: name.to_string(),
                    from: pkey_constraint_name(&shadow),
                    to: pkey_constraint_name(name),
                });
            }
            plan.promoted.push(name.to_string());
        }

        let promoted: Vec<&TableDescriptor> = plan
            .promoted
            .iter()
            .filter_map(|name| schema.get_table(name))
            .collect();

        for table in &promoted {
            let retyped = schema.retyped_columns(table);
            for check in &table.checks {
                if let Some(column) = check.columns.iter().find(|c| retyped.contains(c.as_str())) {
                    tracing::warn!(
                        table = %table.name,
                        constraint = %check.name,
                        column = %column,
                        "check constraint reads a re-keyed column, not re-created"
                    );
                    continue;
                }
                plan.steps.push(CutoverStep::AddCheck {
                    table: table.name.clone(),
                    sql: check.to_add_sql(&schema.name, &table.name),
                });
            }
        }

        // Unique indexes first: a foreign key may target one.
        for table in &promoted {
            for index in &table.indices {
                plan.steps.push(CutoverStep::CreateIndex {
                    table: table.name.clone(),
                    sql: index.definition.clone(),
                });
            }
        }

        for table in &promoted {
            for fk in &table.foreign_keys {
                plan.steps.push(CutoverStep::AddForeignKey {
                    table: table.name.clone(),
                    sql: fk.to_add_sql(&schema.name, &table.name),
                });
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Run `plan` inside a single transaction and mark the promoted tables as
/// cut over.
pub async fn execute_plan<C: Connection + ?Sized>(
    conn: &C,
    schema: &str,
    plan: &CutoverPlan,
) -> Result<()> {
    if plan.is_empty() {
        tracing::info!("nothing to cut over");
        return Ok(());
    }

    let traced = conn.traced();
    traced.batch_execute("BEGIN").await?;

    match run_steps(conn, schema, plan).await {
        Ok(()) => {
            traced.batch_execute("COMMIT").await?;
            tracing::info!(tables = plan.promoted.len(), "cutover committed");
            Ok(())
        }
        Err(e) => {
            if let Err(rollback) = traced.batch_execute("ROLLBACK").await {
                tracing::warn!(error = %rollback, "rollback after failed cutover also failed");
            }
            Err(e)
        }
    }
}

async fn run_steps<C: Connection + ?Sized>(
    conn: &C,
    schema: &str,
    plan: &CutoverPlan,
) -> Result<()> {
    let traced = conn.traced();
    for step in &plan.steps {
        tracing::debug!(table = %step.table(), ?step, "cutover step");
        traced
            .batch_execute(&step.sql(schema))
            .await
            .map_err(|source| Error::Cutover {
                table: step.table().to_string(),
                source,
            })?;
    }
    for table in &plan.promoted {
        state::mark(conn, schema, table, TablePhase::Cutover, None).await?;
    }
    Ok(())
}

/// Promote every shadow of `order` in `schema`.
pub async fn cutover<C: Connection + ?Sized>(
    conn: &C,
    schema: &Schema,
    order: &MigrationOrder,
) -> Result<CutoverPlan> {
    let existing = crate::introspect::existing_tables(conn, &schema.name).await?;
    let plan = CutoverPlan::build(schema, order, &existing);
    execute_plan(conn, &schema.name, &plan).await?;
    Ok(plan)
}
