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

//! Transactions against the replica.
//!
//! A [`Txn`] borrows the [`Idl`] mutably, so there is at most one transaction at a time and
//! the replica cannot change underneath it.  Writes take effect in the replica right away,
//! so reads through the transaction see them.  [`Txn::commit`] turns the changes into one
//! `transact` request and reverts the replica to the database's view; the server then reports
//! the committed changes back through the monitor like any other change.  The outcome is
//! tracked under the returned [`TxnHandle`].

use anyhow::Result;
use serde_json::{json, Map, Value};
use tracing::{debug, event, Level};
use uuid::Uuid;

use ovs::jsonrpc::Message;

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;

use crate::datum::{Atom, Datum, DatumError};
use crate::idl::{Idl, IdlError};
use crate::row::{MapOp, Row, RowId, RowState, SetOp};
use crate::schema::AtomicType;
use crate::table::ColumnMode;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxnHandle(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    /// Not yet committed.
    Uncommitted,
    /// Committed, but there was nothing to send.
    Unchanged,
    /// Sent to the server, awaiting a reply.
    Incomplete,
    /// Aborted by the client.
    Aborted,
    Success,
    /// The database changed in a way that invalidated the transaction, or the connection
    /// dropped.  Rerun the client's logic on the new replica and try again.
    TryAgain,
    /// The server refused the transaction because the IDL does not own its lock.
    NotLocked,
    Error,
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TxnStatus::Uncommitted => "uncommitted",
            TxnStatus::Unchanged => "unchanged",
            TxnStatus::Incomplete => "incomplete",
            TxnStatus::Aborted => "aborted",
            TxnStatus::Success => "success",
            TxnStatus::TryAgain => "try again",
            TxnStatus::NotLocked => "not locked",
            TxnStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// How an `"error"` in a `transact` reply affects the transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnErrorKind {
    /// A "wait" timed out because the database changed.  Worth retrying.
    TimedOut,
    /// An "assert" failed because the client does not own the lock.
    NotOwner,
    /// The "abort" that ends a dry run.
    Aborted,
    Other(String),
}

impl TxnErrorKind {
    pub fn classify(error: &str) -> TxnErrorKind {
        match error {
            "timed out" => TxnErrorKind::TimedOut,
            "not owner" => TxnErrorKind::NotOwner,
            "aborted" => TxnErrorKind::Aborted,
            other => TxnErrorKind::Other(other.into()),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct InsertedRow {
    /// The UUID that the client used for the row.
    pub dummy: Uuid,
    /// Index of the "insert" in the request, which is also the index of its reply.
    pub op_index: usize,
    /// The UUID that the server assigned.
    pub real: Option<Uuid>,
}

#[derive(Clone, Debug)]
pub(crate) struct IncrementRecord {
    pub column: String,
    /// Index of the "mutate", followed by the "select" that reads back the new value.
    pub op_index: usize,
}

/// What the IDL remembers about a committed transaction until it is destroyed.
#[derive(Clone, Debug)]
pub(crate) struct TxnRecord {
    pub status: TxnStatus,
    pub request_id: Option<Value>,
    pub error: Option<String>,
    pub inserted: Vec<InsertedRow>,
    pub inc: Option<IncrementRecord>,
    pub inc_new_value: Option<i64>,
}

impl TxnRecord {
    fn new() -> TxnRecord {
        TxnRecord {
            status: TxnStatus::Uncommitted,
            request_id: None,
            error: None,
            inserted: Vec::new(),
            inc: None,
            inc_new_value: None,
        }
    }

    fn set_error_json(&mut self, error: &Value) {
        if self.error.is_none() {
            self.error = Some(error.to_string());
        }
    }

    /// Interprets the result of our `transact` request.
    pub(crate) fn process_reply(&mut self, result: &Value) -> TxnStatus {
        let ops = match result.as_array() {
            Some(ops) => ops,
            None => {
                event!(Level::WARN, "reply to \"transact\" is not JSON array");
                return TxnStatus::Error;
            }
        };

        let mut hard_errors = 0;
        let mut soft_errors = 0;
        let mut lock_errors = 0;
        for op in ops {
            match op {
                // Not an error itself, but some earlier operation failed.
                Value::Null => soft_errors += 1,
                Value::Object(members) => {
                    let error = match members.get("error") {
                        Some(error) => error,
                        None => continue,
                    };
                    match error.as_str().map(TxnErrorKind::classify) {
                        Some(TxnErrorKind::TimedOut) => soft_errors += 1,
                        Some(TxnErrorKind::NotOwner) => lock_errors += 1,
                        Some(TxnErrorKind::Aborted) => (),
                        Some(TxnErrorKind::Other(_)) => {
                            hard_errors += 1;
                            self.set_error_json(op);
                        },
                        None => {
                            hard_errors += 1;
                            self.set_error_json(op);
                            event!(Level::WARN, "\"error\" in reply is not JSON string");
                        },
                    }
                },
                _ => {
                    hard_errors += 1;
                    self.set_error_json(op);
                    event!(Level::WARN, "operation reply is not JSON null or object");
                }
            }
        }

        if hard_errors + soft_errors + lock_errors == 0 {
            if self.inc.is_some() && !self.process_inc_reply(ops) {
                hard_errors += 1;
            }
            for insert in &mut self.inserted {
                if !process_insert_reply(insert, ops) {
                    hard_errors += 1;
                }
            }
        }

        if hard_errors > 0 {
            TxnStatus::Error
        } else if lock_errors > 0 {
            TxnStatus::NotLocked
        } else if soft_errors > 0 {
            TxnStatus::TryAgain
        } else {
            TxnStatus::Success
        }
    }

    fn process_inc_reply(&mut self, ops: &[Value]) -> bool {
        let inc = match &self.inc {
            Some(inc) => inc,
            None => return true,
        };
        if inc.op_index + 2 > ops.len() {
            event!(Level::WARN, "reply does not contain enough operations for increment (has {}, needs {})",
                   ops.len(), inc.op_index + 2);
            return false;
        }

        // The "mutate" must have changed exactly our row.
        match ops[inc.op_index].get("count").map(Value::as_i64) {
            Some(Some(1)) => (),
            Some(Some(count)) => {
                event!(Level::WARN, "\"mutate\" reply \"count\" is {} instead of 1", count);
                return false;
            },
            _ => {
                event!(Level::WARN, "\"mutate\" reply lacks integer \"count\" member");
                return false;
            },
        }

        let rows = match ops[inc.op_index + 1].get("rows").and_then(Value::as_array) {
            Some(rows) => rows,
            None => {
                event!(Level::WARN, "\"select\" reply lacks \"rows\" member");
                return false;
            }
        };
        if rows.len() != 1 {
            event!(Level::WARN, "\"select\" reply \"rows\" has {} elements instead of 1", rows.len());
            return false;
        }
        match rows[0].get(&inc.column).and_then(Value::as_i64) {
            Some(value) => {
                self.inc_new_value = Some(value);
                true
            },
            None => {
                event!(Level::WARN, "\"select\" reply row lacks integer \"{}\" column", inc.column);
                false
            }
        }
    }
}

fn process_insert_reply(insert: &mut InsertedRow, ops: &[Value]) -> bool {
    let reply = match ops.get(insert.op_index) {
        Some(reply) => reply,
        None => {
            event!(Level::WARN, "reply does not contain enough operations for insert (has {}, needs {})",
                   ops.len(), insert.op_index + 1);
            return false;
        }
    };
    let uuid = match reply.get("uuid").and_then(Value::as_array).map(Vec::as_slice) {
        Some([Value::String(tag), Value::String(uuid)]) if tag == "uuid" => Uuid::parse_str(uuid).ok(),
        _ => None,
    };
    match uuid {
        Some(uuid) => {
            insert.real = Some(uuid);
            true
        },
        None => {
            event!(Level::WARN, "\"insert\" reply \"uuid\" is not a JSON <uuid>");
            false
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Increment {
    row: RowId,
    column: usize,
    force: bool,
}

/// A transaction in progress.  Dropping it without committing aborts it.
pub struct Txn<'a> {
    idl: &'a mut Idl,
    touched: BTreeSet<RowId>,
    comments: Vec<String>,
    dry_run: bool,
    inc: Option<Increment>,
    done: bool,
}

impl Deref for Txn<'_> {
    type Target = Idl;

    fn deref(&self) -> &Idl {
        self.idl
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.disassemble();
        }
    }
}

/// The name that an "insert" gives its row so that later operations can refer to it.
fn uuid_name(uuid: &Uuid) -> String {
    format!("row{}", uuid.to_string().replace('-', "_"))
}

fn where_uuid_equals(uuid: &Uuid) -> Value {
    json!([["_uuid", "==", ["uuid", uuid.to_string()]]])
}

/// Replaces references to rows that the transaction inserts by references to the names that
/// their "insert" operations give them.
fn substitute_uuids(json: Value, inserted: &BTreeSet<Uuid>) -> Value {
    match json {
        Value::Array(elems) => {
            if let [Value::String(tag), Value::String(uuid)] = elems.as_slice() {
                if tag == "uuid" {
                    if let Ok(uuid) = Uuid::parse_str(uuid) {
                        if inserted.contains(&uuid) {
                            return json!(["named-uuid", uuid_name(&uuid)]);
                        }
                    }
                }
            }
            Value::Array(elems.into_iter().map(|elem| substitute_uuids(elem, inserted)).collect())
        },
        Value::Object(members) => {
            Value::Object(members.into_iter().map(|(k, v)| (k, substitute_uuids(v, inserted))).collect())
        },
        other => other,
    }
}

impl Idl {
    /// Starts a transaction.
    pub fn txn_create(&mut self) -> Txn<'_> {
        Txn {
            idl: self,
            touched: BTreeSet::new(),
            comments: Vec::new(),
            dry_run: false,
            inc: None,
            done: false,
        }
    }

    /// Returns the status of a committed transaction, or `None` if it was destroyed.
    /// Transactions in [`TxnStatus::Incomplete`] advance as [`Idl::run`] processes replies.
    pub fn txn_status(&self, handle: TxnHandle) -> Option<TxnStatus> {
        self.txns.get(&handle).map(|record| record.status)
    }

    /// Describes how a transaction turned out, with the server's error for
    /// [`TxnStatus::Error`].
    pub fn txn_get_error(&self, handle: TxnHandle) -> String {
        match self.txns.get(&handle) {
            Some(record) if record.status == TxnStatus::Error => {
                record.error.clone().unwrap_or_else(|| "no error details available".into())
            },
            Some(record) => record.status.to_string(),
            None => "no such transaction".into(),
        }
    }

    /// Returns the UUID that the server gave to a row that the transaction inserted as
    /// `uuid`.  Only available once the transaction succeeded.
    pub fn txn_get_insert_uuid(&self, handle: TxnHandle, uuid: &Uuid) -> Option<Uuid> {
        let record = self.txns.get(&handle)?;
        if !matches!(record.status, TxnStatus::Success | TxnStatus::Unchanged) {
            return None;
        }
        record.inserted.iter().find(|insert| insert.dummy == *uuid).and_then(|insert| insert.real)
    }

    /// Returns the value that [`Txn::increment`] stored, once the transaction succeeded.
    pub fn txn_get_increment_new_value(&self, handle: TxnHandle) -> Option<i64> {
        self.txns.get(&handle).and_then(|record| record.inc_new_value)
    }

    /// Forgets a transaction.  A reply that arrives later is ignored.
    pub fn txn_destroy(&mut self, handle: TxnHandle) {
        self.txns.remove(&handle);
    }
}

impl<'a> Txn<'a> {
    fn row(&self, t: usize, uuid: &Uuid) -> Result<&Row> {
        match self.idl.tables[t].rows.get(uuid) {
            Some(row) if row.state.new().is_some() => Ok(row),
            _ => Err(IdlError::NoSuchRow(self.idl.class.tables[t].name.clone(), *uuid).into()),
        }
    }

    fn row_mut(&mut self, t: usize, uuid: &Uuid) -> Result<&mut Row> {
        match self.idl.tables[t].rows.get_mut(uuid) {
            Some(row) if row.state.new().is_some() => Ok(row),
            _ => Err(IdlError::NoSuchRow(self.idl.class.tables[t].name.clone(), *uuid).into()),
        }
    }

    /// Inserts a row with default values into `table`.  The row is known by `uuid`, if
    /// given, or by a fresh random UUID, until the server assigns its real UUID.  Returns
    /// the UUID.
    pub fn insert(&mut self, table: &str, uuid: Option<Uuid>) -> Result<Uuid> {
        let t = self.idl.table_index(table)?;
        let uuid = uuid.unwrap_or_else(Uuid::new_v4);
        let defaults = self.idl.class.tables[t].default_row();
        let rows = &mut self.idl.tables[t].rows;
        if rows.get(&uuid).map_or(false, |row| !row.state.is_orphan()) {
            return Err(IdlError::RowExists(table.into(), uuid).into());
        }
        rows.entry(uuid).or_insert_with(|| Row::new(uuid, RowState::Orphan)).state = RowState::PendingInsert(defaults);
        self.touched.insert(RowId { table: t, uuid });
        Ok(uuid)
    }

    /// Sets `column` in a row to `datum`.
    pub fn write(&mut self, table: &str, uuid: &Uuid, column: &str, datum: Datum) -> Result<()> {
        let (t, c) = self.idl.column_index(table, column)?;
        let column_class = &self.idl.class.tables[t].columns[c];
        datum.check_type(&column_class.type_)?;
        let mode = self.idl.tables[t].modes[c];
        let row = self.row(t, uuid)?;
        if row.state.old().is_some() {
            if !mode.contains(ColumnMode::MONITOR) {
                return Err(IdlError::NotMonitored(table.into(), column.into()).into());
            }
            if !column_class.mutable {
                return Err(IdlError::NotMutable(table.into(), column.into()).into());
            }
        }

        let write_only = mode == ColumnMode::MONITOR;
        if self.idl.verify_write_only && !write_only {
            event!(Level::ERROR, "Bug: Attempt to write to a read/write column ({}:{}) when explicitly configured not to.",
                   table, column);
            return Ok(());
        }

        // Writing a write-only column with its current value would be pointless, and the
        // value cannot be verified later anyway.
        if write_only && row.state.new().map(|data| &data[c]) == Some(&datum) {
            return Ok(());
        }

        self.touched.insert(RowId { table: t, uuid: *uuid });
        let row = self.row_mut(t, uuid)?;
        row.state = match std::mem::replace(&mut row.state, RowState::Orphan) {
            RowState::Committed(old) => {
                let mut new = old.clone();
                new[c] = datum;
                RowState::PendingModify { old, new }
            },
            RowState::PendingModify { old, mut new } => {
                new[c] = datum;
                RowState::PendingModify { old, new }
            },
            RowState::PendingInsert(mut new) => {
                new[c] = datum;
                RowState::PendingInsert(new)
            },
            other => other,
        };
        row.written.insert(c);
        Ok(())
    }

    pub fn write_clone(&mut self, table: &str, uuid: &Uuid, column: &str, datum: &Datum) -> Result<()> {
        self.write(table, uuid, column, datum.clone())
    }

    /// Makes the transaction fail with [`TxnStatus::TryAgain`] if `column` in the database
    /// no longer has the value that the replica shows when the transaction commits.
    pub fn verify(&mut self, table: &str, uuid: &Uuid, column: &str) -> Result<()> {
        let (t, c) = self.idl.column_index(table, column)?;
        let row = self.row(t, uuid)?;
        if row.state.old().is_none() || row.written.contains(&c) {
            return Ok(());
        }
        if !self.idl.tables[t].modes[c].contains(ColumnMode::MONITOR) {
            return Err(IdlError::NotMonitored(table.into(), column.into()).into());
        }
        self.touched.insert(RowId { table: t, uuid: *uuid });
        self.row_mut(t, uuid)?.prereqs.insert(c);
        Ok(())
    }

    /// Deletes a row.
    pub fn delete(&mut self, table: &str, uuid: &Uuid) -> Result<()> {
        let t = self.idl.table_index(table)?;
        let id = RowId { table: t, uuid: *uuid };
        if matches!(self.row(t, uuid)?.state, RowState::PendingInsert(_)) {
            // Never sent to the server, so just forget about it.
            self.touched.remove(&id);
            let rows = &mut self.idl.tables[t].rows;
            let destroy = match rows.get_mut(uuid) {
                Some(row) => {
                    row.written.clear();
                    row.map_ops.clear();
                    row.set_ops.clear();
                    row.state = RowState::Orphan;
                    row.backward_arcs.is_empty()
                },
                None => false,
            };
            if destroy {
                rows.remove(uuid);
            }
            return Ok(());
        }

        self.touched.insert(id);
        let row = self.row_mut(t, uuid)?;
        row.state = match std::mem::replace(&mut row.state, RowState::Orphan) {
            RowState::Committed(old) | RowState::PendingModify { old, .. } => RowState::PendingDelete(old),
            other => other,
        };
        row.written.clear();
        row.map_ops.clear();
        row.set_ops.clear();
        Ok(())
    }

    fn is_valid_partial_update(&self, t: usize, c: usize) -> bool {
        if !self.idl.tables[t].modes[c].contains(ColumnMode::MONITOR) {
            event!(Level::WARN, "cannot partially update non-monitored column");
            return false;
        }
        true
    }

    fn check_partial(&self, table: &str, column: &str, map: bool, key: &Atom, value: Option<&Atom>)
                     -> Result<(usize, usize)> {
        let (t, c) = self.idl.column_index(table, column)?;
        let type_ = &self.idl.class.tables[t].columns[c].type_;
        if type_.is_map() != map {
            let kind = if map { "map" } else { "set" };
            return Err(DatumError(format!("{}:{} is not a {} column", table, column, kind)).into());
        }
        if key.atomic_type() != type_.key.atomic {
            return Err(DatumError(format!("{}:{} expects {} keys", table, column, type_.key.atomic)).into());
        }
        if let (Some(value), Some(value_type)) = (value, &type_.value) {
            if value.atomic_type() != value_type.atomic {
                return Err(DatumError(format!("{}:{} expects {} values", table, column, value_type.atomic)).into());
            }
        }
        Ok((t, c))
    }

    fn add_map_op(&mut self, t: usize, uuid: &Uuid, c: usize, key: Atom, op: MapOp) -> Result<()> {
        self.row(t, uuid)?;
        self.touched.insert(RowId { table: t, uuid: *uuid });
        let ops = self.row_mut(t, uuid)?.map_ops.entry(c).or_default();
        let op = match (ops.get(&key), op) {
            // The key is still missing from the database.
            (Some(MapOp::Insert(_)), MapOp::Update(value)) => MapOp::Insert(value),
            (_, op) => op,
        };
        ops.insert(key, op);
        Ok(())
    }

    fn add_set_op(&mut self, t: usize, uuid: &Uuid, c: usize, key: Atom, op: SetOp) -> Result<()> {
        self.row(t, uuid)?;
        self.touched.insert(RowId { table: t, uuid: *uuid });
        self.row_mut(t, uuid)?.set_ops.entry(c).or_default().insert(key, op);
        Ok(())
    }

    /// Sets `key` to `value` in map `column`, without rewriting the rest of the map.
    pub fn write_partial_map(&mut self, table: &str, uuid: &Uuid, column: &str, key: Atom, value: Atom) -> Result<()> {
        let (t, c) = self.check_partial(table, column, true, &key, Some(&value))?;
        if !self.is_valid_partial_update(t, c) {
            return Ok(());
        }
        let exists = self.row(t, uuid)?.state.new().map_or(false, |data| data[c].contains_key(&key));
        let op = if exists { MapOp::Update(value) } else { MapOp::Insert(value) };
        self.add_map_op(t, uuid, c, key, op)
    }

    /// Removes `key` from map `column`.
    pub fn delete_partial_map(&mut self, table: &str, uuid: &Uuid, column: &str, key: Atom) -> Result<()> {
        let (t, c) = self.check_partial(table, column, true, &key, None)?;
        if !self.is_valid_partial_update(t, c) {
            return Ok(());
        }
        self.add_map_op(t, uuid, c, key, MapOp::Delete)
    }

    /// Adds `element` to set `column`.
    pub fn write_partial_set(&mut self, table: &str, uuid: &Uuid, column: &str, element: Atom) -> Result<()> {
        let (t, c) = self.check_partial(table, column, false, &element, None)?;
        if !self.is_valid_partial_update(t, c) {
            return Ok(());
        }
        self.add_set_op(t, uuid, c, element, SetOp::Insert)
    }

    /// Removes `element` from set `column`.
    pub fn delete_partial_set(&mut self, table: &str, uuid: &Uuid, column: &str, element: Atom) -> Result<()> {
        let (t, c) = self.check_partial(table, column, false, &element, None)?;
        if !self.is_valid_partial_update(t, c) {
            return Ok(());
        }
        self.add_set_op(t, uuid, c, element, SetOp::Delete)
    }

    /// Increments integer `column` in a row when the transaction commits, if the transaction
    /// changes anything else or `force` is set.  The new value is available through
    /// [`Idl::txn_get_increment_new_value`].  A transaction can increment one column.
    pub fn increment(&mut self, table: &str, uuid: &Uuid, column: &str, force: bool) -> Result<()> {
        let (t, c) = self.idl.column_index(table, column)?;
        if self.inc.is_some() {
            return Err(IdlError::BadIncrement(table.into(), column.into(),
                                              "transaction already increments a column".into()).into());
        }
        let type_ = &self.idl.class.tables[t].columns[c].type_;
        if !type_.is_scalar() || type_.key.atomic != AtomicType::Integer {
            return Err(IdlError::BadIncrement(table.into(), column.into(), "not an integer column".into()).into());
        }
        self.row(t, uuid)?;
        self.inc = Some(Increment { row: RowId { table: t, uuid: *uuid }, column: c, force });
        Ok(())
    }

    /// Adds a comment that the server logs with the transaction.
    pub fn add_comment(&mut self, comment: &str) {
        self.comments.push(comment.into());
    }

    /// Makes the server execute the transaction and then throw away its effects.
    pub fn set_dry_run(&mut self) {
        self.dry_run = true;
    }

    /// The partial map and set updates queued for `row`, as "mutate" mutations.
    fn extract_mutations(&self, t: usize, row: &Row) -> Vec<Value> {
        let tc = &self.idl.class.tables[t];
        let current = |c: usize| -> Datum {
            match (row.state.new(), row.state.old()) {
                (Some(new), _) if row.written.contains(&c) => new[c].clone(),
                (_, Some(old)) => old[c].clone(),
                _ => tc.columns[c].type_.default_datum(),
            }
        };

        let mut mutations = Vec::new();
        for (&c, ops) in &row.map_ops {
            let name = &tc.columns[c].name;
            let datum = current(c);
            let mut deletes = Vec::new();
            let mut inserts = Vec::new();
            for (key, op) in ops {
                match op {
                    MapOp::Insert(value) => inserts.push(json!([key.to_json(), value.to_json()])),
                    MapOp::Update(value) => {
                        if datum.get(key) == Some(value) {
                            continue;
                        }
                        deletes.push(key.to_json());
                        inserts.push(json!([key.to_json(), value.to_json()]));
                    },
                    MapOp::Delete => {
                        if !datum.contains_key(key) {
                            event!(Level::WARN, "Trying to delete a key that doesn't exist in the map.");
                            continue;
                        }
                        deletes.push(key.to_json());
                    },
                }
            }
            if !deletes.is_empty() {
                mutations.push(json!([name, "delete", ["set", deletes]]));
            }
            if !inserts.is_empty() {
                mutations.push(json!([name, "insert", ["map", inserts]]));
            }
        }
        for (&c, ops) in &row.set_ops {
            let name = &tc.columns[c].name;
            let datum = current(c);
            let mut deletes = Vec::new();
            let mut inserts = Vec::new();
            for (key, op) in ops {
                match op {
                    SetOp::Insert => inserts.push(key.to_json()),
                    SetOp::Delete => {
                        if !datum.contains_key(key) {
                            event!(Level::WARN, "Trying to delete a key that doesn't exist in the set.");
                            continue;
                        }
                        deletes.push(key.to_json());
                    },
                }
            }
            if !deletes.is_empty() {
                mutations.push(json!([name, "delete", ["set", deletes]]));
            }
            if !inserts.is_empty() {
                mutations.push(json!([name, "insert", ["set", inserts]]));
            }
        }
        mutations
    }

    /// Builds the operations of the `transact` request.  Returns them with a flag that says
    /// whether they change anything.
    fn build_ops(&self, record: &mut TxnRecord) -> (Vec<Value>, bool) {
        let idl = &*self.idl;
        let mut ops = Vec::new();
        let mut any_updates = false;

        let inserted: BTreeSet<Uuid> = self.touched.iter()
            .filter(|id| matches!(idl.tables[id.table].rows.get(&id.uuid).map(|row| &row.state),
                                  Some(RowState::PendingInsert(_))))
            .map(|id| id.uuid)
            .collect();

        if let Some(lock_name) = &idl.lock_name {
            ops.push(json!({"op": "assert", "lock": lock_name}));
        }

        // Prerequisites go first, so that a failed "wait" prevents everything else.
        for id in &self.touched {
            let row = match idl.tables[id.table].rows.get(&id.uuid) {
                Some(row) => row,
                None => continue,
            };
            let old = match row.state.old() {
                Some(old) if !row.prereqs.is_empty() => old,
                _ => continue,
            };
            let tc = &idl.class.tables[id.table];
            let mut columns = Vec::new();
            let mut values = Map::new();
            for &c in &row.prereqs {
                columns.push(json!(tc.columns[c].name));
                values.insert(tc.columns[c].name.clone(), old[c].to_json());
            }
            ops.push(json!({
                "op": "wait",
                "table": tc.name,
                "timeout": 0,
                "where": where_uuid_equals(&id.uuid),
                "until": "==",
                "columns": columns,
                "rows": [values],
            }));
        }

        for id in &self.touched {
            let row = match idl.tables[id.table].rows.get(&id.uuid) {
                Some(row) => row,
                None => continue,
            };
            let tc = &idl.class.tables[id.table];
            match &row.state {
                RowState::PendingDelete(_) => {
                    // Unreferenced rows in non-root tables are garbage collected anyway.
                    if tc.is_root {
                        ops.push(json!({"op": "delete", "table": tc.name, "where": where_uuid_equals(&id.uuid)}));
                        any_updates = true;
                    }
                },
                RowState::PendingInsert(new) | RowState::PendingModify { new, .. } => {
                    let old = row.state.old();
                    let mut row_json = Map::new();
                    for &c in &row.written {
                        let column = &tc.columns[c];
                        if old.is_none() && new[c].is_default(&column.type_) {
                            continue;
                        }
                        row_json.insert(column.name.clone(), substitute_uuids(new[c].to_json(), &inserted));
                        if old.map_or(false, |old| old[c] != new[c]) {
                            any_updates = true;
                        }
                    }

                    if old.is_none() {
                        any_updates = true;
                        record.inserted.push(InsertedRow { dummy: id.uuid, op_index: ops.len(), real: None });
                        ops.push(json!({
                            "op": "insert",
                            "table": tc.name,
                            "uuid-name": uuid_name(&id.uuid),
                            "row": row_json,
                        }));
                    } else if !row_json.is_empty() {
                        ops.push(json!({
                            "op": "update",
                            "table": tc.name,
                            "where": where_uuid_equals(&id.uuid),
                            "row": row_json,
                        }));
                    }
                },
                _ => (),
            }

            if row.has_partial_ops() {
                let mutations = self.extract_mutations(id.table, row);
                if !mutations.is_empty() {
                    let op = json!({
                        "op": "mutate",
                        "table": tc.name,
                        "where": where_uuid_equals(&id.uuid),
                        "mutations": mutations,
                    });
                    ops.push(substitute_uuids(op, &inserted));
                    any_updates = true;
                }
            }
        }

        if let Some(inc) = &self.inc {
            if any_updates || inc.force {
                let tc = &idl.class.tables[inc.row.table];
                let column = &tc.columns[inc.column].name;
                let where_ = substitute_uuids(where_uuid_equals(&inc.row.uuid), &inserted);
                any_updates = true;
                record.inc = Some(IncrementRecord { column: column.clone(), op_index: ops.len() });
                ops.push(json!({
                    "op": "mutate",
                    "table": tc.name,
                    "where": where_,
                    "mutations": [[column, "+=", 1]],
                }));
                ops.push(json!({
                    "op": "select",
                    "table": tc.name,
                    "where": where_,
                    "columns": [column],
                }));
            }
        }

        if !self.comments.is_empty() {
            ops.push(json!({"op": "comment", "comment": self.comments.join("\n")}));
        }
        if self.dry_run {
            ops.push(json!({"op": "abort"}));
        }
        (ops, any_updates)
    }

    /// Sends the transaction to the server and returns a handle for following its progress.
    /// The replica reverts to the database's view, so the transaction's changes show up
    /// only once the server reports them.
    pub fn commit(mut self) -> TxnHandle {
        let handle = TxnHandle(self.idl.next_txn);
        self.idl.next_txn += 1;

        let mut record = TxnRecord::new();
        let status = if self.idl.lock_name.is_some() && !self.idl.has_lock {
            TxnStatus::NotLocked
        } else {
            let (ops, any_updates) = self.build_ops(&mut record);
            if !any_updates {
                TxnStatus::Unchanged
            } else {
                debug!("{}: committing transaction with {} operations", self.idl.session.name(), ops.len());
                let mut params = vec![json!(self.idl.class.database)];
                params.extend(ops);
                let msg = Message::request("transact", Value::Array(params));
                let id = msg.id().cloned();
                match self.idl.session.send(msg) {
                    Ok(()) => {
                        record.request_id = id;
                        TxnStatus::Incomplete
                    },
                    Err(e) => {
                        debug!("{}: transaction not sent ({})", self.idl.session.name(), e);
                        TxnStatus::TryAgain
                    }
                }
            }
        };
        record.status = status;

        self.disassemble();
        self.done = true;
        self.idl.txns.insert(handle, record);
        handle
    }

    /// Throws the transaction away.
    pub fn abort(mut self) {
        self.disassemble();
        self.done = true;
    }

    /// Reverts every row that the transaction touched to the database's view.
    fn disassemble(&mut self) {
        for id in std::mem::take(&mut self.touched) {
            let rows = &mut self.idl.tables[id.table].rows;
            let destroy = match rows.get_mut(&id.uuid) {
                Some(row) => {
                    row.written.clear();
                    row.prereqs.clear();
                    row.map_ops.clear();
                    row.set_ops.clear();
                    row.state = match std::mem::replace(&mut row.state, RowState::Orphan) {
                        RowState::PendingModify { old, .. } | RowState::PendingDelete(old) => RowState::Committed(old),
                        RowState::PendingInsert(_) => RowState::Orphan,
                        other => other,
                    };
                    row.state.is_orphan() && row.backward_arcs.is_empty()
                },
                None => false,
            };
            if destroy {
                rows.remove(&id.uuid);
            }
        }
        self.inc = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{example_class, TestServer};
    use tracing_test::traced_test;

    fn setup() -> (TestServer, Idl, Uuid) {
        let server = TestServer::new(&example_class());
        let result = server.transact(json!([
            {"op": "insert", "table": "Parent",
             "row": {"name": "p", "n": 10, "options": ["map", [["a", "1"], ["b", "2"]]]}}
        ]));
        let uuid = Uuid::parse_str(result[0]["uuid"][1].as_str().unwrap()).unwrap();
        let mut idl = server.idl(true);
        idl.run();
        (server, idl, uuid)
    }

    #[test]
    fn insert_with_references() -> Result<()> {
        let (server, mut idl, _) = setup();
        let mut txn = idl.txn_create();
        let child = txn.insert("Child", None)?;
        txn.write("Child", &child, "tag", Datum::scalar(3i64))?;
        let parent = txn.insert("Parent", None)?;
        txn.write("Parent", &parent, "name", Datum::scalar("q"))?;
        txn.write("Parent", &parent, "children", Datum::set(vec![child]))?;

        let synthetic = txn.get_row_for_uuid("Parent", &parent).unwrap();
        assert!(synthetic.is_synthetic());
        assert_eq!(synthetic.string("name"), "q");
        assert_eq!(txn.rows("Parent").len(), 2);
        let handle = txn.commit();

        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Incomplete));
        assert!(idl.get_row_for_uuid("Parent", &parent).is_none());
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Success));

        let real = idl.txn_get_insert_uuid(handle, &parent).unwrap();
        let row = idl.get_row_for_uuid("Parent", &real).unwrap();
        assert_eq!(row.string("name"), "q");
        assert_eq!(row.refs("children")[0].optional_integer("tag"), Some(3));
        assert_eq!(server.row_count("Child"), 1);
        idl.check_consistency()?;
        idl.txn_destroy(handle);
        assert_eq!(idl.txn_status(handle), None);
        Ok(())
    }

    #[test]
    fn dropping_reverts() -> Result<()> {
        let (server, mut idl, uuid) = setup();
        {
            let mut txn = idl.txn_create();
            txn.write("Parent", &uuid, "name", Datum::scalar("changed"))?;
            txn.insert("Parent", None)?;
            txn.delete("Parent", &uuid)?;
            assert!(txn.rows("Parent").len() == 1);
        }
        assert_eq!(idl.rows("Parent").len(), 1);
        assert_eq!(idl.rows("Parent")[0].string("name"), "p");
        idl.check_consistency()?;

        let mut txn = idl.txn_create();
        txn.write("Parent", &uuid, "name", Datum::scalar("changed"))?;
        txn.abort();
        assert_eq!(idl.rows("Parent")[0].string("name"), "p");
        assert_eq!(server.request_count("transact"), 0);
        Ok(())
    }

    #[test]
    fn verify_failure_is_try_again() -> Result<()> {
        let (server, mut idl, uuid) = setup();
        let mut txn = idl.txn_create();
        txn.verify("Parent", &uuid, "name")?;
        txn.write("Parent", &uuid, "n", Datum::scalar(11i64))?;
        // Someone else gets there first.
        server.transact(json!([{"op": "update", "table": "Parent", "where": [], "row": {"name": "other"}}]));
        let handle = txn.commit();
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::TryAgain));
        assert_eq!(idl.txn_get_error(handle), "try again");
        assert_eq!(server.get("Parent", &uuid, "n"), Some(Datum::scalar(10i64)));
        assert_eq!(idl.rows("Parent")[0].integer("n"), 10);
        assert_eq!(idl.rows("Parent")[0].string("name"), "other");
        Ok(())
    }

    #[test]
    fn hard_errors() -> Result<()> {
        let (server, mut idl, uuid) = setup();
        server.fail_next_transact(0, "constraint violation");
        let mut txn = idl.txn_create();
        txn.write("Parent", &uuid, "n", Datum::scalar(11i64))?;
        let handle = txn.commit();
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Error));
        assert!(idl.txn_get_error(handle).contains("constraint violation"));
        assert_eq!(idl.rows("Parent")[0].integer("n"), 10);
        Ok(())
    }

    #[test]
    fn failed_commit_changes_nothing() -> Result<()> {
        let (server, mut idl, first) = setup();
        server.transact(json!([
            {"op": "insert", "table": "Parent", "row": {"name": "q", "n": 20}},
            {"op": "insert", "table": "Parent", "row": {"name": "r", "n": 30}},
        ]));
        idl.run();
        let uuids: Vec<Uuid> = idl.rows("Parent").iter().map(|row| row.uuid()).collect();
        assert_eq!(uuids.len(), 3);
        assert!(uuids.contains(&first));
        let before: Vec<i64> = uuids.iter().map(|uuid| server.get("Parent", uuid, "n")
            .and_then(|n| n.as_integer()).unwrap()).collect();

        // Three updates, and the last one times out.
        server.fail_next_transact(2, "timed out");
        let mut txn = idl.txn_create();
        for uuid in &uuids {
            txn.write("Parent", uuid, "n", Datum::scalar(99i64))?;
        }
        let handle = txn.commit();
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::TryAgain));

        for (uuid, n) in uuids.iter().zip(&before) {
            assert_eq!(server.get("Parent", uuid, "n"), Some(Datum::scalar(*n)));
            assert_eq!(idl.get_row_for_uuid("Parent", uuid).unwrap().integer("n"), *n);
        }
        idl.check_consistency()?;
        Ok(())
    }

    #[test]
    fn reply_classification() {
        let mut record = TxnRecord::new();
        assert_eq!(record.process_reply(&json!([{}, {"error": "timed out"}, null])), TxnStatus::TryAgain);
        assert_eq!(record.process_reply(&json!([{"error": "not owner"}, null])), TxnStatus::NotLocked);
        assert_eq!(record.process_reply(&json!([{}, {"error": "aborted"}])), TxnStatus::Success);
        assert_eq!(record.process_reply(&json!([{"error": "not owner"}, {"error": "bad"}])), TxnStatus::Error);
        assert_eq!(record.error.as_deref(), Some(r#"{"error":"bad"}"#));
        assert_eq!(record.process_reply(&json!({})), TxnStatus::Error);
        assert_eq!(TxnErrorKind::classify("referential integrity violation"),
                   TxnErrorKind::Other("referential integrity violation".into()));
    }

    #[test]
    fn not_locked() -> Result<()> {
        let (server, mut idl, uuid) = setup();
        let mut other = server.idl(true);
        other.set_lock(Some("writer"));
        other.run();
        idl.set_lock(Some("writer"));
        idl.run();
        assert!(!idl.has_lock());

        let mut txn = idl.txn_create();
        txn.write("Parent", &uuid, "n", Datum::scalar(11i64))?;
        let handle = txn.commit();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::NotLocked));
        assert_eq!(server.request_count("transact"), 0);

        other.set_lock(None);
        idl.run();
        assert!(idl.has_lock());
        let mut txn = idl.txn_create();
        txn.write("Parent", &uuid, "n", Datum::scalar(11i64))?;
        let handle = txn.commit();
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Success));
        assert_eq!(idl.rows("Parent")[0].integer("n"), 11);
        Ok(())
    }

    #[test]
    fn unchanged() -> Result<()> {
        let (server, mut idl, uuid) = setup();
        let mut txn = idl.txn_create();
        txn.write("Parent", &uuid, "n", Datum::scalar(10i64))?;
        let handle = txn.commit();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Unchanged));
        assert_eq!(server.request_count("transact"), 0);
        Ok(())
    }

    #[test]
    fn increment() -> Result<()> {
        let (_server, mut idl, uuid) = setup();
        let mut txn = idl.txn_create();
        txn.increment("Parent", &uuid, "n", false)?;
        assert!(txn.increment("Parent", &uuid, "n", false).is_err());
        assert!(txn.increment("Parent", &uuid, "name", false).is_err());
        let handle = txn.commit();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Unchanged));

        let mut txn = idl.txn_create();
        txn.increment("Parent", &uuid, "n", true)?;
        let handle = txn.commit();
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Success));
        assert_eq!(idl.txn_get_increment_new_value(handle), Some(11));
        assert_eq!(idl.rows("Parent")[0].integer("n"), 11);
        Ok(())
    }

    #[test]
    #[traced_test]
    fn partial_updates() -> Result<()> {
        let (server, mut idl, uuid) = setup();
        let mut txn = idl.txn_create();
        txn.write_partial_map("Parent", &uuid, "options", "c".into(), "3".into())?;
        txn.write_partial_map("Parent", &uuid, "options", "a".into(), "9".into())?;
        txn.write_partial_map("Parent", &uuid, "options", "b".into(), "2".into())?;
        txn.delete_partial_map("Parent", &uuid, "options", "zzz".into())?;
        assert!(txn.write_partial_set("Parent", &uuid, "options", "x".into()).is_err());
        let handle = txn.commit();
        assert!(logs_contain("Trying to delete a key that doesn't exist in the map."));
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Success));
        let options = idl.rows("Parent")[0].string_map("options");
        assert_eq!(options.get("a").map(String::as_str), Some("9"));
        assert_eq!(options.get("b").map(String::as_str), Some("2"));
        assert_eq!(options.get("c").map(String::as_str), Some("3"));
        assert_eq!(server.get("Parent", &uuid, "options").map(|d| d.len()), Some(3));

        let mut txn = idl.txn_create();
        let child = txn.insert("Child", None)?;
        txn.write_partial_set("Parent", &uuid, "children", child.into())?;
        txn.delete_partial_map("Parent", &uuid, "options", "a".into())?;
        let handle = txn.commit();
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Success));
        let parent = idl.get_row_for_uuid("Parent", &uuid).unwrap();
        assert_eq!(parent.refs("children").len(), 1);
        assert!(!parent.string_map("options").contains_key("a"));
        Ok(())
    }

    #[test]
    fn delete_collects_garbage() -> Result<()> {
        let (server, mut idl, uuid) = setup();
        let mut txn = idl.txn_create();
        let child = txn.insert("Child", None)?;
        txn.write("Parent", &uuid, "children", Datum::set(vec![child]))?;
        txn.commit();
        idl.run();
        assert_eq!(idl.rows("Child").len(), 1);

        let mut txn = idl.txn_create();
        txn.delete("Parent", &uuid)?;
        assert!(txn.get_row_for_uuid("Parent", &uuid).is_none());
        let handle = txn.commit();
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Success));
        assert!(idl.rows("Parent").is_empty());
        assert!(idl.rows("Child").is_empty());
        assert_eq!(server.row_count("Child"), 0);
        idl.check_consistency()?;
        Ok(())
    }

    #[test]
    #[traced_test]
    fn write_only_columns() -> Result<()> {
        let server = TestServer::new(&example_class());
        server.transact(json!([{"op": "insert", "table": "Parent", "row": {"name": "p", "n": 1}}]));
        let mut idl = server.idl(true);
        idl.omit_alert("Parent", "n")?;
        idl.verify_write_only();
        idl.run();
        let uuid = idl.rows("Parent")[0].uuid();

        let mut txn = idl.txn_create();
        txn.write("Parent", &uuid, "n", Datum::scalar(1i64))?;
        txn.write("Parent", &uuid, "name", Datum::scalar("q"))?;
        let handle = txn.commit();
        assert!(logs_contain("Bug: Attempt to write to a read/write column (Parent:name)"));
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Unchanged));
        Ok(())
    }

    #[test]
    fn dry_run_and_comments() -> Result<()> {
        let (server, mut idl, uuid) = setup();
        let mut txn = idl.txn_create();
        txn.write("Parent", &uuid, "n", Datum::scalar(12i64))?;
        txn.add_comment("first");
        txn.add_comment("second");
        txn.set_dry_run();
        let handle = txn.commit();
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::Success));
        assert_eq!(server.get("Parent", &uuid, "n"), Some(Datum::scalar(10i64)));
        assert_eq!(server.comments(), vec!["first\nsecond".to_string()]);
        Ok(())
    }

    #[test]
    fn disconnect_means_try_again() -> Result<()> {
        let (server, mut idl, uuid) = setup();
        server.set_deferred(true);
        let mut txn = idl.txn_create();
        txn.write("Parent", &uuid, "n", Datum::scalar(12i64))?;
        let handle = txn.commit();
        server.disconnect_all();
        server.set_deferred(false);
        idl.run();
        assert_eq!(idl.txn_status(handle), Some(TxnStatus::TryAgain));
        Ok(())
    }

    #[test]
    fn named_uuids() {
        let inserted: BTreeSet<Uuid> = vec![Uuid::nil()].into_iter().collect();
        let other = Uuid::new_v4();
        let json = json!({"row": {"a": ["uuid", Uuid::nil().to_string()],
                                  "b": ["set", [["uuid", other.to_string()]]]}});
        assert_eq!(substitute_uuids(json, &inserted), json!({
            "row": {"a": ["named-uuid", "row00000000_0000_0000_0000_000000000000"],
                    "b": ["set", [["uuid", other.to_string()]]]}
        }));
    }
}
