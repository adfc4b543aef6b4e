/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! Replicated rows and read-only views of them.

use uuid::Uuid;

use std::collections::{BTreeMap, BTreeSet};

use crate::datum::{Atom, Datum};
use crate::idl::Idl;
use crate::schema::TableClass;

/// Identifies a row by table index and UUID.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId {
    pub table: usize,
    pub uuid: Uuid,
}

/// A kind of change to a row, used to index change sequence numbers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Insert = 0,
    Modify = 1,
    Delete = 2,
}

/// The data of a row, relative to the database and to the transaction in progress, if any.
///
/// `old` is the row as the database last reported it.  `new` is the row as the current
/// transaction would leave it.
#[derive(Clone, Debug, PartialEq)]
pub enum RowState {
    /// Referenced by some other row but not (yet) present in the replica.
    Orphan,
    /// In the database and untouched by the current transaction.
    Committed(Vec<Datum>),
    /// Inserted by the current transaction.
    PendingInsert(Vec<Datum>),
    /// In the database and modified by the current transaction.
    PendingModify { old: Vec<Datum>, new: Vec<Datum> },
    /// In the database and deleted by the current transaction.
    PendingDelete(Vec<Datum>),
}

impl RowState {
    pub fn old(&self) -> Option<&Vec<Datum>> {
        match self {
            RowState::Committed(old) | RowState::PendingModify { old, .. } | RowState::PendingDelete(old) => Some(old),
            RowState::Orphan | RowState::PendingInsert(_) => None,
        }
    }

    pub fn new(&self) -> Option<&Vec<Datum>> {
        match self {
            RowState::Committed(new) | RowState::PendingModify { new, .. } | RowState::PendingInsert(new) => Some(new),
            RowState::Orphan | RowState::PendingDelete(_) => None,
        }
    }

    pub fn is_orphan(&self) -> bool {
        matches!(self, RowState::Orphan)
    }
}

/// A queued partial update to one key of a map column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapOp {
    Insert(Atom),
    Update(Atom),
    Delete,
}

/// A queued partial update to one element of a set column.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetOp {
    Insert,
    Delete,
}

#[derive(Clone, Debug)]
pub struct Row {
    pub(crate) uuid: Uuid,
    pub(crate) state: RowState,

    /// Columns written by the current transaction.
    pub(crate) written: BTreeSet<usize>,
    /// Columns whose values the current transaction verifies.
    pub(crate) prereqs: BTreeSet<usize>,
    pub(crate) map_ops: BTreeMap<usize, BTreeMap<Atom, MapOp>>,
    pub(crate) set_ops: BTreeMap<usize, BTreeMap<Atom, SetOp>>,

    /// Rows that this row refers to.
    pub(crate) forward_arcs: BTreeSet<RowId>,
    /// Rows that refer to this row.
    pub(crate) backward_arcs: BTreeSet<RowId>,

    pub(crate) change_seqno: [u64; 3],
    /// Tracked columns changed since the last `track_clear`.
    pub(crate) updated: BTreeSet<usize>,
}

impl Row {
    pub(crate) fn new(uuid: Uuid, state: RowState) -> Row {
        Row {
            uuid,
            state,
            written: BTreeSet::new(),
            prereqs: BTreeSet::new(),
            map_ops: BTreeMap::new(),
            set_ops: BTreeMap::new(),
            forward_arcs: BTreeSet::new(),
            backward_arcs: BTreeSet::new(),
            change_seqno: [0; 3],
            updated: BTreeSet::new(),
        }
    }

    pub(crate) fn has_partial_ops(&self) -> bool {
        !self.map_ops.is_empty() || !self.set_ops.is_empty()
    }
}

/// A read-only view of one row in an [`Idl`].
///
/// Columns are read from the row as the current transaction would leave it, so a view taken
/// inside a transaction sees the transaction's own writes.  A view of a row deleted since the
/// last `track_clear` reads the row's last contents.
#[derive(Copy, Clone)]
pub struct RowRef<'a> {
    pub(crate) idl: &'a Idl,
    pub(crate) table: usize,
    pub(crate) row: &'a Row,
    pub(crate) deleted: bool,
}

impl<'a> RowRef<'a> {
    pub fn uuid(&self) -> Uuid {
        self.row.uuid
    }

    pub fn id(&self) -> RowId {
        RowId { table: self.table, uuid: self.row.uuid }
    }

    pub fn class(&self) -> &'a TableClass {
        &self.idl.class().tables[self.table]
    }

    fn data(&self) -> Option<&'a Vec<Datum>> {
        if self.deleted {
            self.row.state.old()
        } else {
            self.row.state.new()
        }
    }

    /// Returns the value of `column`, or `None` if the table has no such column.
    pub fn get(&self, column: &str) -> Option<&'a Datum> {
        let idx = self.class().column_index(column)?;
        self.data().map(|data| &data[idx])
    }

    pub fn string(&self, column: &str) -> String {
        self.get(column).and_then(Datum::as_str).unwrap_or_default().to_string()
    }

    pub fn optional_string(&self, column: &str) -> Option<String> {
        self.get(column).and_then(Datum::as_str).map(String::from)
    }

    pub fn integer(&self, column: &str) -> i64 {
        self.get(column).and_then(Datum::as_integer).unwrap_or_default()
    }

    pub fn optional_integer(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Datum::as_integer)
    }

    pub fn boolean(&self, column: &str) -> bool {
        self.get(column).and_then(Datum::as_bool).unwrap_or_default()
    }

    pub fn optional_boolean(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(Datum::as_bool)
    }

    pub fn strings(&self, column: &str) -> Vec<String> {
        self.get(column).map(Datum::strings).unwrap_or_default()
    }

    pub fn integers(&self, column: &str) -> Vec<i64> {
        self.get(column).map(Datum::integers).unwrap_or_default()
    }

    pub fn string_map(&self, column: &str) -> BTreeMap<String, String> {
        self.get(column).map(Datum::string_map).unwrap_or_default()
    }

    pub fn uuids(&self, column: &str) -> Vec<Uuid> {
        self.get(column).map(Datum::uuids).unwrap_or_default()
    }

    /// Follows the references in `column` to the rows they name.  References to rows that are
    /// not in the replica are skipped.
    pub fn refs(&self, column: &str) -> Vec<RowRef<'a>> {
        let table = match self.class().column(column).and_then(|c| c.type_.key.ref_table.as_deref()) {
            Some(table) => table,
            None => return Vec::new(),
        };
        self.uuids(column).iter()
            .filter_map(|uuid| self.idl.get_row_for_uuid(table, uuid))
            .collect()
    }

    /// Follows a reference in a scalar or optional column.
    pub fn ref_(&self, column: &str) -> Option<RowRef<'a>> {
        self.refs(column).into_iter().next()
    }

    /// True if the row was inserted by the transaction in progress and is not yet in the
    /// database.
    pub fn is_synthetic(&self) -> bool {
        matches!(self.row.state, RowState::PendingInsert(_))
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns the IDL change seqno at which this row last saw `change`.
    pub fn seqno(&self, change: Change) -> u64 {
        self.row.change_seqno[change as usize]
    }

    /// True if tracked `column` changed since the last `track_clear`.
    pub fn is_updated(&self, column: &str) -> bool {
        match self.class().column_index(column) {
            Some(idx) => self.row.updated.contains(&idx),
            None => false,
        }
    }
}

impl std::fmt::Debug for RowRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} row {}", self.class().name, self.row.uuid)
    }
}
