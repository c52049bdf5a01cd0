//! Migration solver - orders tables so every referenced table is re-keyed first.
//!
//! A table's rows can only be copied once every table it references has its
//! complete old-id → new-id map. The solver turns the introspected foreign
//! keys into a dependency graph and sorts it topologically.
//!
//! ## Cycles
//!
//! ```text
//! employee.manager_id -> employee      (self-reference: ignored here,
//!                                       resolved by the migrator's two passes)
//! department.head_id  -> employee      (nullable)
//! employee.department_id -> department (NOT NULL)
//! ```
//!
//! `department` and `employee` form a cycle, but only through a nullable key.
//! The solver migrates `department` first and *defers* `department.head_id`:
//! it is copied as NULL and filled in once `employee` has its map.
//!
//! A cycle made only of NOT NULL keys cannot be broken this way and is
//! rejected with the offending path.

use crate::schema::Schema;
use std::collections::{BTreeSet, HashMap};

/// Error when tables cannot be ordered.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderError {
    /// Required (NOT NULL) foreign keys form a cycle.
    CycleDetected {
        /// The cycle, first table repeated at the end.
        tables: Vec<String>,
    },
    /// A dependency names a table that is not part of the run.
    UnknownTable { table: String },
}

impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderError::CycleDetected { tables } => {
                write!(
                    f,
                    "required foreign keys form a cycle: {} (make one of these keys nullable)",
                    tables.join(" -> ")
                )
            }
            OrderError::UnknownTable { table } => {
                write!(f, "dependency on '{}', which is not part of the run", table)
            }
        }
    }
}

impl std::error::Error for OrderError {}

/// `table.column` references `references`, so `references` goes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub table: String,
    pub column: String,
    pub references: String,
    /// NOT NULL keys (or keys on tables without an `id` to fix up later)
    /// can never be deferred.
    pub required: bool,
}

/// A nullable reference copied as NULL and filled in after all tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredReference {
    pub table: String,
    pub column: String,
    pub references: String,
}

/// Result of ordering tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationOrder {
    /// Tables in migration order.
    pub tables: Vec<String>,
    /// References that had to be deferred to break nullable cycles.
    pub deferred: Vec<DeferredReference>,
}

impl MigrationOrder {
    /// Tables in cutover order: the reverse of the migration order.
    pub fn cutover_order(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().rev().map(String::as_str)
    }

    /// Whether `table.column` is filled in after the copy.
    pub fn is_deferred(&self, table: &str, column: &str) -> bool {
        self.deferred
            .iter()
            .any(|d| d.table == table && d.column == column)
    }

    /// Position of `table` in the migration order.
    pub fn position(&self, table: &str) -> Option<usize> {
        self.tables.iter().position(|t| t == table)
    }
}

/// Collect the dependency edges of every table in `schema`.
///
/// Self-references produce no edge.
pub fn dependencies(schema: &Schema) -> Vec<Dependency> {
    let mut deps = Vec::new();
    for table in schema.tables.values() {
        for reference in schema.references(table) {
            if reference.references == table.name {
                continue;
            }
            deps.push(Dependency {
                table: table.name.clone(),
                column: reference.column.to_string(),
                references: reference.references.to_string(),
                required: !reference.nullable || !table.has_id(),
            });
        }
    }
    deps
}

/// Order the tables of `schema`.
pub fn order_tables(schema: &Schema) -> Result<MigrationOrder, OrderError> {
    let names: Vec<String> = schema.tables.keys().cloned().collect();
    order(&names, &dependencies(schema))
}

/// Order `tables` (given in catalog order) so dependencies come first.
///
/// Ties are broken by catalog order, so the result is deterministic.
pub fn order(tables: &[String], deps: &[Dependency]) -> Result<MigrationOrder, OrderError> {
    let index: HashMap<&str, usize> = tables
        .iter()
        .enumerate()
        .map(|(i, t)| (t.as_str(), i))
        .collect();

    // waiting_on[i]: table index -> whether any edge to it is required
    let mut waiting_on: Vec<HashMap<usize, bool>> = vec![HashMap::new(); tables.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tables.len()];

    for dep in deps {
        let Some(&from) = index.get(dep.table.as_str()) else {
            return Err(OrderError::UnknownTable {
                table: dep.table.clone(),
            });
        };
        let Some(&to) = index.get(dep.references.as_str()) else {
            return Err(OrderError::UnknownTable {
                table: dep.references.clone(),
            });
        };
        if from == to {
            continue;
        }
        let required = waiting_on[from].entry(to).or_insert(false);
        *required |= dep.required;
        if !dependents[to].contains(&from) {
            dependents[to].push(from);
        }
    }

    check_required_cycles(tables, &waiting_on)?;

    let mut ready: BTreeSet<usize> = (0..tables.len())
        .filter(|&i| waiting_on[i].is_empty())
        .collect();
    let mut scheduled = vec![false; tables.len()];
    let mut result = MigrationOrder::default();

    while result.tables.len() < tables.len() {
        let next = match ready.pop_first() {
            Some(next) => next,
            None => {
                // Only nullable edges are left in the way. Take the first
                // table (catalog order) with no required dependency pending
                // and defer the rest; the required-cycle check guarantees one
                // exists.
                let Some(next) = (0..tables.len())
                    .find(|&i| !scheduled[i] && waiting_on[i].values().all(|req| !req))
                else {
                    unreachable!("required dependencies are acyclic");
                };
                let mut blocked_on: Vec<usize> = waiting_on[next].keys().copied().collect();
                blocked_on.sort_unstable();
                for to in blocked_on {
                    result.deferred.extend(
                        deps.iter()
                            .filter(|d| d.table == tables[next] && d.references == tables[to])
                            .map(|d| DeferredReference {
                                table: d.table.clone(),
                                column: d.column.clone(),
                                references: d.references.clone(),
                            }),
                    );
                }
                waiting_on[next].clear();
                next
            }
        };

        scheduled[next] = true;
        result.tables.push(tables[next].clone());

        for &dependent in &dependents[next] {
            if scheduled[dependent] {
                continue;
            }
            if waiting_on[dependent].remove(&next).is_some() && waiting_on[dependent].is_empty()
            {
                ready.insert(dependent);
            }
        }
    }

    Ok(result)
}

/// Fail if required edges alone contain a cycle, reporting one such cycle.
fn check_required_cycles(
    tables: &[String],
    waiting_on: &[HashMap<usize, bool>],
) -> Result<(), OrderError> {
    let mut pending: Vec<BTreeSet<usize>> = waiting_on
        .iter()
        .map(|deps| {
            deps.iter()
                .filter(|(_, required)| **required)
                .map(|(to, _)| *to)
                .collect()
        })
        .collect();

    let mut done = vec![false; tables.len()];
    let mut progress = true;
    while progress {
        progress = false;
        for i in 0..tables.len() {
            if !done[i] && pending[i].is_empty() {
                done[i] = true;
                progress = true;
                for deps in pending.iter_mut() {
                    deps.remove(&i);
                }
            }
        }
    }

    let Some(start) = (0..tables.len()).find(|&i| !done[i]) else {
        return Ok(());
    };

    // Every leftover table still waits on another leftover table; walk those
    // edges until a table repeats.
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = pending[current].iter().next() else {
            unreachable!("leftover table without pending dependency");
        };
        if let Some(pos) = path.iter().position(|&t| t == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|&t| tables[t].clone()).collect();
            cycle.push(tables[next].clone());
            return Err(OrderError::CycleDetected { tables: cycle });
        }
        path.push(next);
        current = next;
    }
}
