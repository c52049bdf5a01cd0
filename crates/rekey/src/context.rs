//! Run configuration and the state threaded through every stage of a run.

use ulid::Ulid;

use crate::ids::{IdGenerator, IdMapStore, OldId};

/// Default number of rows per multi-row `INSERT`.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// What to migrate and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RekeyConfig {
    /// Postgres schema whose tables are re-keyed.
    pub schema: String,
    /// Tables left untouched (their own keys keep their type).
    pub excluded: Vec<String>,
    /// Rows per `INSERT` statement when filling a shadow table.
    pub batch_size: usize,
}

impl Default for RekeyConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            excluded: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// A nullable reference written as NULL, to be filled in once every table
/// has its id map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixup {
    /// Source table owning the column.
    pub table: String,
    pub column: String,
    pub references: String,
    /// New id of the shadow row to update.
    pub row_id: Ulid,
    /// Old value of the column, to look up in `references`' map.
    pub value: OldId,
}

/// State owned by one migration run.
///
/// Created by the runner and passed by `&mut` to each stage; nothing in a
/// run lives in globals, and nothing outlives it.
pub struct MigrationContext {
    pub config: RekeyConfig,
    pub ids: IdMapStore,
    generator: IdGenerator,
    fixups: Vec<Fixup>,
}

impl MigrationContext {
    pub fn new(config: RekeyConfig) -> Self {
        Self {
            config,
            ids: IdMapStore::new(),
            generator: IdGenerator::new(),
            fixups: Vec::new(),
        }
    }

    /// A fresh identifier.
    pub fn next_id(&mut self) -> Ulid {
        self.generator.next_id()
    }

    pub fn defer(&mut self, fixup: Fixup) {
        self.fixups.push(fixup);
    }

    pub fn pending_fixups(&self) -> &[Fixup] {
        &self.fixups
    }

    /// Hand the queued fix-ups over, leaving the queue empty.
    pub fn take_fixups(&mut self) -> Vec<Fixup> {
        std::mem::take(&mut self.fixups)
    }
}
