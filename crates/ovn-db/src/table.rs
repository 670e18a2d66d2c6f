//! Generic change-tracked table with snapshot transactions.
//!
//! A [`Table`] behaves like one OVSDB table as seen through an IDL:
//!
//! - Rows are addressed by a [`RowId`] that is never reused.
//! - Changes are *tracked* (new, updated, deleted) until
//!   [`Table::clear_tracked`] is called.
//! - While a transaction is open, changes are staged. They become tracked
//!   on commit, i.e. a writer observes its own writes as tracked changes on
//!   its next read, and are rolled back on abort.
//! - Rows inserted by the open transaction answer true to
//!   [`Table::is_new_in_txn`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{DbError, DbResult};

/// Identity of a row. Unique across all tables and never reused.
pub type RowId = Uuid;

/// A row type stored in a [`Table`].
pub trait Row: Clone + PartialEq + fmt::Debug {
    /// Name of the table (for diagnostics).
    const TABLE: &'static str;
}

/// Kind of a tracked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Row inserted.
    New,
    /// Row modified.
    Updated,
    /// Row removed.
    Deleted,
}

/// A tracked row as reported to readers.
///
/// For deleted rows `row` is the last value before deletion.
#[derive(Debug, Clone, Copy)]
pub struct TrackedRow<'a, R> {
    /// Row identity.
    pub id: RowId,
    /// What happened to the row.
    pub kind: ChangeKind,
    /// Current (or last) row content.
    pub row: &'a R,
}

#[derive(Debug, Clone, PartialEq)]
enum Change<R> {
    New,
    Updated,
    Deleted(R),
}

#[derive(Debug, Clone)]
struct TxnState<R> {
    rows: BTreeMap<RowId, R>,
    tracked: BTreeMap<RowId, Change<R>>,
    inserted: BTreeSet<RowId>,
    staged: BTreeMap<RowId, Change<R>>,
}

/// Operations every table supports, used to drive a whole database.
pub trait TxnTable {
    /// Opens a transaction.
    fn begin(&mut self) -> DbResult<()>;
    /// Commits the open transaction. Returns true if it changed anything.
    fn commit(&mut self) -> DbResult<bool>;
    /// Rolls back the open transaction.
    fn abort(&mut self) -> DbResult<()>;
    /// Drops tracked changes.
    fn clear_tracked(&mut self);
    /// Returns true if any change is tracked.
    fn has_tracked_changes(&self) -> bool;
}

/// One change-tracked table.
#[derive(Debug, Clone)]
pub struct Table<R> {
    rows: BTreeMap<RowId, R>,
    tracked: BTreeMap<RowId, Change<R>>,
    txn: Option<TxnState<R>>,
}

fn merge<R>(changes: &mut BTreeMap<RowId, Change<R>>, id: RowId, change: Change<R>) {
    let merged = match (changes.remove(&id), change) {
        (None, c) => Some(c),
        (Some(Change::New), Change::Updated) => Some(Change::New),
        (Some(Change::New), Change::Deleted(_)) => None,
        (Some(Change::Deleted(_)), Change::New) => Some(Change::Updated),
        (Some(_), c) => Some(c),
    };
    if let Some(c) = merged {
        changes.insert(id, c);
    }
}

impl<R> Default for Table<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            tracked: BTreeMap::new(),
            txn: None,
        }
    }
}

impl<R: Row> Table<R> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table whose rows are all tracked as new.
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (RowId, R)>,
    {
        let rows: BTreeMap<RowId, R> = rows.into_iter().collect();
        let tracked = rows.keys().map(|id| (*id, Change::New)).collect();
        Self {
            rows,
            tracked,
            txn: None,
        }
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the row with the given id.
    pub fn get(&self, id: &RowId) -> Option<&R> {
        self.rows.get(id)
    }

    /// Returns the row with the given id or a `MissingRow` error.
    pub fn try_get(&self, id: &RowId) -> DbResult<&R> {
        self.rows
            .get(id)
            .ok_or_else(|| DbError::missing_row(R::TABLE, *id))
    }

    /// Returns true if the row exists.
    pub fn contains(&self, id: &RowId) -> bool {
        self.rows.contains_key(id)
    }

    /// Iterates over rows in id order.
    pub fn iter(&self) -> impl Iterator<Item = (RowId, &R)> {
        self.rows.iter().map(|(id, row)| (*id, row))
    }

    /// Returns all row ids. Use this to delete rows while scanning.
    pub fn ids(&self) -> Vec<RowId> {
        self.rows.keys().copied().collect()
    }

    /// Returns the first row (in id order) matching `pred`.
    pub fn find<F>(&self, mut pred: F) -> Option<(RowId, &R)>
    where
        F: FnMut(&R) -> bool,
    {
        self.iter().find(|(_, row)| pred(row))
    }

    fn record(&mut self, id: RowId, change: Change<R>) {
        match self.txn.as_mut() {
            Some(txn) => merge(&mut txn.staged, id, change),
            None => merge(&mut self.tracked, id, change),
        }
    }

    /// Inserts a row under a fresh id.
    pub fn insert(&mut self, row: R) -> RowId {
        let id = Uuid::new_v4();
        self.rows.insert(id, row);
        if let Some(txn) = self.txn.as_mut() {
            txn.inserted.insert(id);
        }
        self.record(id, Change::New);
        id
    }

    /// Inserts a row under a caller-chosen id.
    pub fn insert_with_id(&mut self, id: RowId, row: R) -> DbResult<()> {
        if self.rows.contains_key(&id) {
            return Err(DbError::DuplicateRow {
                table: R::TABLE,
                row: id,
            });
        }
        self.rows.insert(id, row);
        if let Some(txn) = self.txn.as_mut() {
            txn.inserted.insert(id);
        }
        self.record(id, Change::New);
        Ok(())
    }

    /// Applies `f` to a row.
    ///
    /// The change is recorded only if the row content differs afterwards.
    /// Returns true if the row changed.
    pub fn update<F>(&mut self, id: &RowId, f: F) -> DbResult<bool>
    where
        F: FnOnce(&mut R),
    {
        let current = self.try_get(id)?;
        let mut next = current.clone();
        f(&mut next);
        if next == *current {
            return Ok(false);
        }
        self.rows.insert(*id, next);
        self.record(*id, Change::Updated);
        Ok(true)
    }

    /// Deletes a row and returns its last content.
    pub fn delete(&mut self, id: &RowId) -> DbResult<R> {
        let row = self
            .rows
            .remove(id)
            .ok_or_else(|| DbError::missing_row(R::TABLE, *id))?;
        if let Some(txn) = self.txn.as_mut() {
            txn.inserted.remove(id);
        }
        self.record(*id, Change::Deleted(row.clone()));
        Ok(row)
    }

    /// Returns true if the row was inserted by the open transaction.
    pub fn is_new_in_txn(&self, id: &RowId) -> bool {
        self.txn
            .as_ref()
            .is_some_and(|txn| txn.inserted.contains(id))
    }

    /// Returns true if a transaction is open.
    pub fn in_txn(&self) -> bool {
        self.txn.is_some()
    }

    /// Iterates over tracked changes in id order.
    pub fn tracked(&self) -> impl Iterator<Item = TrackedRow<'_, R>> {
        self.tracked.iter().filter_map(|(id, change)| {
            let (kind, row) = match change {
                Change::New => (ChangeKind::New, self.rows.get(id)?),
                Change::Updated => (ChangeKind::Updated, self.rows.get(id)?),
                Change::Deleted(row) => (ChangeKind::Deleted, row),
            };
            Some(TrackedRow { id: *id, kind, row })
        })
    }

    /// Returns the tracked change kind of a row.
    pub fn tracked_change(&self, id: &RowId) -> Option<ChangeKind> {
        self.tracked.get(id).map(|change| match change {
            Change::New => ChangeKind::New,
            Change::Updated => ChangeKind::Updated,
            Change::Deleted(_) => ChangeKind::Deleted,
        })
    }
}

impl<R: Row> TxnTable for Table<R> {
    fn begin(&mut self) -> DbResult<()> {
        if self.txn.is_some() {
            return Err(DbError::TransactionInProgress);
        }
        self.txn = Some(TxnState {
            rows: self.rows.clone(),
            tracked: self.tracked.clone(),
            inserted: BTreeSet::new(),
            staged: BTreeMap::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> DbResult<bool> {
        let txn = self.txn.take().ok_or(DbError::NoTransaction)?;
        let changed = !txn.staged.is_empty();
        for (id, change) in txn.staged {
            merge(&mut self.tracked, id, change);
        }
        Ok(changed)
    }

    fn abort(&mut self) -> DbResult<()> {
        let txn = self.txn.take().ok_or(DbError::NoTransaction)?;
        self.rows = txn.rows;
        self.tracked = txn.tracked;
        Ok(())
    }

    fn clear_tracked(&mut self) {
        self.tracked.clear();
    }

    fn has_tracked_changes(&self) -> bool {
        !self.tracked.is_empty()
    }
}

impl<R: Row + Serialize> Serialize for Table<R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.rows.serialize(serializer)
    }
}

impl<'de, R: Row + Deserialize<'de>> Deserialize<'de> for Table<R> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows = BTreeMap::<RowId, R>::deserialize(deserializer)?;
        Ok(Self::from_rows(rows))
    }
}

/// Opens a transaction on every table, or on none of them.
pub(crate) fn begin_all(tables: &mut [&mut dyn TxnTable]) -> DbResult<()> {
    for i in 0..tables.len() {
        if let Err(err) = tables[i].begin() {
            for table in tables[..i].iter_mut() {
                table.abort()?;
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Runs `op` on every table, stopping at the first error.
pub(crate) fn for_each_table<F>(tables: &mut [&mut dyn TxnTable], mut op: F) -> DbResult<()>
where
    F: FnMut(&mut dyn TxnTable) -> DbResult<()>,
{
    for table in tables.iter_mut() {
        op(&mut **table)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        value: u32,
    }

    impl Row for Item {
        const TABLE: &'static str = "Item";
    }

    fn kinds(table: &Table<Item>) -> Vec<ChangeKind> {
        table.tracked().map(|t| t.kind).collect()
    }

    #[test]
    fn test_insert_update_delete_tracking() {
        let mut table = Table::new();
        let a = table.insert(Item { value: 1 });
        let b = table.insert(Item { value: 2 });
        table.clear_tracked();

        assert!(!table.update(&a, |r| r.value = 1).unwrap());
        assert!(!table.has_tracked_changes());

        assert!(table.update(&a, |r| r.value = 10).unwrap());
        table.delete(&b).unwrap();

        assert_eq!(table.tracked_change(&a), Some(ChangeKind::Updated));
        let deleted = table.tracked().find(|t| t.id == b).unwrap();
        assert_eq!(deleted.kind, ChangeKind::Deleted);
        assert_eq!(deleted.row.value, 2);
    }

    #[test]
    fn test_missing_row_errors() {
        let mut table: Table<Item> = Table::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            table.update(&id, |r| r.value = 1),
            Err(DbError::MissingRow { .. })
        ));
        assert!(table.delete(&id).is_err());
        assert!(table.try_get(&id).is_err());
    }

    #[test]
    fn test_txn_stages_until_commit() {
        let mut table = Table::new();
        table.begin().unwrap();
        let id = table.insert(Item { value: 1 });
        table.update(&id, |r| r.value = 2).unwrap();

        assert!(table.is_new_in_txn(&id));
        assert!(!table.has_tracked_changes());

        assert!(table.commit().unwrap());
        assert!(!table.is_new_in_txn(&id));
        assert_eq!(kinds(&table), vec![ChangeKind::New]);
        assert_eq!(table.get(&id), Some(&Item { value: 2 }));
    }

    #[test]
    fn test_txn_insert_then_delete_leaves_nothing() {
        let mut table = Table::new();
        table.begin().unwrap();
        let id = table.insert(Item { value: 1 });
        table.delete(&id).unwrap();
        assert!(!table.commit().unwrap());
        assert!(table.is_empty());
        assert!(!table.has_tracked_changes());
    }

    #[test]
    fn test_abort_restores_rows_and_tracking() {
        let mut table = Table::new();
        let keep = table.insert(Item { value: 1 });

        table.begin().unwrap();
        table.clear_tracked();
        table.delete(&keep).unwrap();
        table.insert(Item { value: 9 });
        table.abort().unwrap();

        assert_eq!(table.len(), 1);
        assert!(table.contains(&keep));
        assert_eq!(table.tracked_change(&keep), Some(ChangeKind::New));
    }

    #[test]
    fn test_txn_misuse() {
        let mut table: Table<Item> = Table::new();
        assert!(matches!(table.commit(), Err(DbError::NoTransaction)));
        table.begin().unwrap();
        assert!(matches!(table.begin(), Err(DbError::TransactionInProgress)));
    }

    #[test]
    fn test_insert_with_id_rejects_duplicates() {
        let mut table = Table::new();
        let id = Uuid::new_v4();
        table.insert_with_id(id, Item { value: 1 }).unwrap();
        assert!(matches!(
            table.insert_with_id(id, Item { value: 2 }),
            Err(DbError::DuplicateRow { .. })
        ));
    }
}
