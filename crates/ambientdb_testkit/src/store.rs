//! In-memory committed store backing the test contexts.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A stored entity: field name to field value.
pub type Record = HashMap<String, String>;

/// Committed state shared by every context and transaction in a test.
///
/// Only [`MemTransaction`](crate::MemTransaction) commits mutate this
/// store; saved-but-uncommitted changes stay staged inside the
/// transaction and are invisible here.
#[derive(Default)]
pub struct MemStore {
    tables: Mutex<HashMap<String, HashMap<Uuid, Record>>>,
}

/// A staged mutation awaiting commit.
#[derive(Clone)]
pub(crate) enum StagedOp {
    Upsert {
        table: String,
        id: Uuid,
        record: Record,
    },
    Delete {
        table: String,
        id: Uuid,
    },
}

impl MemStore {
    /// Creates an empty store behind an `Arc` for sharing with contexts.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of committed rows in `table`.
    #[must_use]
    pub fn count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .get(table)
            .map_or(0, |rows| rows.len())
    }

    /// Committed record for `id` in `table`, if present.
    #[must_use]
    pub fn get(&self, table: &str, id: Uuid) -> Option<Record> {
        self.tables
            .lock()
            .get(table)
            .and_then(|rows| rows.get(&id))
            .cloned()
    }

    /// Writes a committed record directly, bypassing any transaction.
    /// Test seeding only.
    pub fn put(&self, table: &str, id: Uuid, record: Record) {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(id, record);
    }

    pub(crate) fn apply(&self, ops: &[StagedOp]) {
        let mut tables = self.tables.lock();
        for op in ops {
            match op {
                StagedOp::Upsert { table, id, record } => {
                    tables
                        .entry(table.clone())
                        .or_default()
                        .insert(*id, record.clone());
                }
                StagedOp::Delete { table, id } => {
                    if let Some(rows) = tables.get_mut(table) {
                        rows.remove(id);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        let mut dbg = f.debug_struct("MemStore");
        for (name, rows) in tables.iter() {
            dbg.field(name, &rows.len());
        }
        dbg.finish()
    }
}
