//! New identifiers and the old-id → new-id maps.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use ulid::Ulid;

use crate::{Error, Result};

/// A source key value, in its canonical Postgres text form.
///
/// Keys are read with `::text`, so an integer key `1` and a foreign key
/// holding `1` (even if one is `integer` and the other `bigint`) render
/// identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OldId(String);

impl OldId {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for OldId {
    fn from(v: i64) -> Self {
        Self(v.to_string())
    }
}

impl From<&str> for OldId {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for OldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates ULIDs that sort in generation order, even within a millisecond.
pub struct IdGenerator {
    inner: ulid::Generator,
    generated: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            inner: ulid::Generator::new(),
            generated: 0,
        }
    }

    /// Next identifier; strictly greater than every previous one.
    pub fn next_id(&mut self) -> Ulid {
        loop {
            match self.inner.generate() {
                Ok(id) => {
                    self.generated += 1;
                    return id;
                }
                // 80 random bits exhausted within one millisecond: wait for the clock.
                Err(_) => std::thread::yield_now(),
            }
        }
    }

    /// Number of identifiers handed out so far.
    pub fn generated(&self) -> u64 {
        self.generated
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Old-id → new-id pairs for one table.
#[derive(Debug, Clone, Default)]
pub struct IdMap {
    entries: HashMap<OldId, Ulid>,
}

impl IdMap {
    pub fn get(&self, old: &OldId) -> Option<Ulid> {
        self.entries.get(old).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OldId, &Ulid)> {
        self.entries.iter()
    }
}

/// Result of [`IdMapStore::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Mapped(Ulid),
    /// The table was never processed in this run.
    UnknownTable,
    /// The table was processed but holds no row with that id.
    UnknownId,
}

/// All id maps of a run, keyed by table name.
#[derive(Debug, Clone, Default)]
pub struct IdMapStore {
    maps: IndexMap<String, IdMap>,
}

impl IdMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `table` known, with an empty map if it has none yet.
    pub fn register(&mut self, table: &str) {
        if !self.maps.contains_key(table) {
            self.maps.insert(table.to_string(), IdMap::default());
        }
    }

    /// Record `old → new` for `table`. Entries are never overwritten.
    pub fn record(&mut self, table: &str, old: OldId, new: Ulid) -> Result<()> {
        let map = self.maps.entry(table.to_string()).or_default();
        if map.entries.contains_key(&old) {
            return Err(Error::DuplicateId {
                table: table.to_string(),
                id: old.to_string(),
            });
        }
        map.entries.insert(old, new);
        Ok(())
    }

    pub fn lookup(&self, table: &str, old: &OldId) -> Lookup {
        match self.maps.get(table) {
            None => Lookup::UnknownTable,
            Some(map) => match map.get(old) {
                Some(new) => Lookup::Mapped(new),
                None => Lookup::UnknownId,
            },
        }
    }

    pub fn map(&self, table: &str) -> Option<&IdMap> {
        self.maps.get(table)
    }

    pub fn is_registered(&self, table: &str) -> bool {
        self.maps.contains_key(table)
    }

    /// Tables with a map, in the order they were first registered.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.maps.keys().map(String::as_str)
    }
}
