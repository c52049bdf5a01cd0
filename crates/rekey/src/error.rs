use thiserror::Error;

use crate::solver::OrderError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("failed to introspect table '{table}': {source}")]
    Introspection {
        table: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("failed to create shadow table for '{table}': {source}")]
    ShadowCreate {
        table: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("failed to copy rows of '{table}': {source}")]
    RowCopy {
        table: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error(
        "'{table}.{column}' holds {value}, which has no new id in '{references}' \
         (was '{references}' migrated before '{table}'?)"
    )]
    UnmappedReference {
        table: String,
        column: String,
        references: String,
        value: String,
    },

    #[error("duplicate id {id} in table '{table}'")]
    DuplicateId { table: String, id: String },

    #[error("shadow of '{table}' has {actual} rows, expected {expected}")]
    RowCountMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },

    #[error("cannot order tables: {0}")]
    Order(#[from] OrderError),

    #[error("table '{table}' is not supported: {reason}")]
    Unsupported { table: String, reason: String },

    #[error("cutover failed at table '{table}', rolled back: {source}")]
    Cutover {
        table: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("table '{table}' was already cut over by a previous run")]
    AlreadyMigrated { table: String },

    #[error("state record for '{table}' has unknown phase '{phase}'")]
    CorruptState { table: String, phase: String },
}

impl Error {
    /// The table this error is about, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Error::Introspection { table, .. }
            | Error::ShadowCreate { table, .. }
            | Error::RowCopy { table, .. }
            | Error::UnmappedReference { table, .. }
            | Error::DuplicateId { table, .. }
            | Error::RowCountMismatch { table, .. }
            | Error::Unsupported { table, .. }
            | Error::Cutover { table, .. }
            | Error::AlreadyMigrated { table }
            | Error::CorruptState { table, .. } => Some(table),
            Error::Postgres(_) | Error::Order(_) => None,
        }
    }
}
