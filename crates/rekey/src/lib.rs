//! Re-key a Postgres schema from integer primary keys to ULIDs.
//!
//! Every table with an `id` column gets a fresh, time-ordered ULID per row,
//! and every declared foreign key pointing at such an `id` is rewritten to
//! the referenced row's new ULID.
//!
//! # How a run works
//!
//! 1. The tables of the schema are introspected from `pg_catalog`.
//! 2. They are ordered so that every referenced table comes first
//!    (see [`solver`]).
//! 3. Each table is copied into a *shadow* table `<name>_ulid`, with keys
//!    rewritten through the id maps built so far.
//! 4. In one transaction, the originals are dropped in reverse order and the
//!    shadows renamed into place. Foreign keys and indexes are re-created.
//!
//! Progress is recorded in `_rekey_state` inside the migrated schema.
//!
//! ```ignore
//! let report = Rekeyer::new(&client, RekeyConfig::default()).run().await?;
//! println!("{} rows re-keyed", report.rows());
//! ```

pub mod context;
pub mod cutover;
mod error;
pub mod ids;
pub mod introspect;
pub mod migrate;
mod runner;
pub mod schema;
pub mod solver;
pub mod state;
mod traced;

pub use context::{MigrationContext, RekeyConfig};
pub use error::Error;
pub use ids::{IdGenerator, IdMapStore, OldId};
pub use runner::{Rekeyer, RunReport};
pub use schema::{Schema, TableDescriptor};
pub use solver::{MigrationOrder, OrderError};
pub use state::{StateEntry, TablePhase};
pub use traced::{Connection, ConnectionExt, TracedConn};

pub type Result<T> = std::result::Result<T, Error>;
