//! Drives a complete run: introspect, order, migrate, fix up, cut over.

use crate::context::{MigrationContext, RekeyConfig};
use crate::cutover::{self, CutoverPlan};
use crate::introspect;
use crate::migrate::{self, TableReport};
use crate::schema::Schema;
use crate::solver::{self, MigrationOrder};
use crate::state::{self, TablePhase};
use crate::{Connection, ConnectionExt, Error, Result};

/// Outcome of [`Rekeyer::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub order: MigrationOrder,
    /// One entry per migrated table, in migration order.
    pub tables: Vec<TableReport>,
    /// Deferred references filled in after the copy.
    pub fixups: usize,
    pub cutover: CutoverPlan,
}

impl RunReport {
    /// Total rows copied across all tables.
    pub fn rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }
}

/// Re-keys one schema over one connection.
pub struct Rekeyer<'a, C: Connection + ?Sized> {
    conn: &'a C,
    ctx: MigrationContext,
}

impl<'a, C: Connection + ?Sized> Rekeyer<'a, C> {
    pub fn new(conn: &'a C, config: RekeyConfig) -> Self {
        Self {
            conn,
            ctx: MigrationContext::new(config),
        }
    }

    pub fn config(&self) -> &RekeyConfig {
        &self.ctx.config
    }

    /// Introspect and order the tables without touching any data.
    pub async fn plan(&self) -> Result<(Schema, MigrationOrder)> {
        let config = &self.ctx.config;
        let names = introspect::list_tables(self.conn, &config.schema, &config.excluded).await?;

        let mut schema = Schema::new(config.schema.clone());
        for name in &names {
            schema.insert(introspect::describe_table(self.conn, &config.schema, name).await?);
        }
        schema.validate()?;

        let order = solver::order_tables(&schema)?;
        Ok((schema, order))
    }

    /// Migrate every table and cut over.
    pub async fn run(mut self) -> Result<RunReport> {
        let schema_name = self.ctx.config.schema.clone();
        state::ensure(self.conn, &schema_name).await?;
        if let Some(done) = state::load(self.conn, &schema_name)
            .await?
            .into_iter()
            .find(|e| e.phase == TablePhase::Cutover)
        {
            return Err(Error::AlreadyMigrated { table: done.table });
        }

        let (schema, order) = self.plan().await?;
        tracing::info!(
            schema = %schema_name,
            tables = order.tables.len(),
            deferred = order.deferred.len(),
            "migration order: {}",
            order.tables.join(", ")
        );
        for table in &order.tables {
            state::mark(self.conn, &schema_name, table, TablePhase::Pending, None).await?;
        }

        self.set_enforcement(false).await;
        let result = self.migrate_all(&schema, order).await;
        self.set_enforcement(true).await;

        if let Err(e) = &result {
            match e.table() {
                Some(table) => tracing::error!(table = %table, error = %e, "migration failed"),
                None => tracing::error!(error = %e, "migration failed"),
            }
        }
        result
    }

    async fn migrate_all(&mut self, schema: &Schema, order: MigrationOrder) -> Result<RunReport> {
        let mut reports = Vec::with_capacity(order.tables.len());

        for (i, name) in order.tables.iter().enumerate() {
            let Some(table) = schema.get_table(name) else {
                continue;
            };
            tracing::info!(
                table = %name,
                step = i + 1,
                of = order.tables.len(),
                "migrating"
            );
            let report = migrate::migrate_table(self.conn, &mut self.ctx, schema, table, &order).await?;
            state::mark(
                self.conn,
                &schema.name,
                name,
                TablePhase::Shadowed,
                Some(report.rows as i64),
            )
            .await?;
            tracing::info!(
                table = %name,
                rows = report.rows,
                deferred = report.deferred,
                "shadow {} populated",
                report.shadow
            );
            reports.push(report);
        }

        let fixups = migrate::apply_fixups(self.conn, &mut self.ctx, schema).await?;
        if fixups > 0 {
            tracing::info!(fixups, "deferred references filled in");
        }

        let plan = cutover::cutover(self.conn, schema, &order).await?;
        for table in &plan.promoted {
            tracing::info!(table = %table, "cut over");
        }

        Ok(RunReport {
            order,
            tables: reports,
            fixups,
            cutover: plan,
        })
    }

    /// Toggle foreign key triggers for this session. Needs superuser, so a
    /// failure is only logged.
    async fn set_enforcement(&self, enabled: bool) {
        let sql = if enabled {
            "SET session_replication_role = DEFAULT"
        } else {
            "SET session_replication_role = replica"
        };
        if let Err(e) = self.conn.traced().batch_execute(sql).await {
            tracing::warn!(error = %e, enabled, "could not toggle foreign key enforcement");
        }
    }
}
