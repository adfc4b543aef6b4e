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

//! The IDL proper: an in-memory replica of a subset of an OVSDB database.
//!
//! An [`Idl`] connects to a database server, fetches the schema, asks the server to monitor the
//! tables and columns that the client configured, and then keeps its replica up to date as
//! `update` or `update2` notifications arrive.  The client drives everything by calling
//! [`Idl::run`] from its main loop.  Local changes go through a [`Txn`](crate::Txn), which
//! sends them to the server as a single `transact` request.

use anyhow::Result;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, event, info, Level};
use uuid::Uuid;

use ovs::jsonrpc::{JsonrpcSession, Message, Session};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::thread;
use std::time::Duration;

use crate::condition::Condition;
use crate::datum::Datum;
use crate::row::{Change, Row, RowId, RowRef, RowState};
use crate::schema::{BaseType, IdlClass};
use crate::table::{ColumnMode, Table};
use crate::txn::{TxnHandle, TxnRecord, TxnStatus};

/// Errors from IDL operations that name tables, columns, or rows.
#[derive(Error, Debug)]
pub enum IdlError {
    #[error("no table named {0}")]
    NoSuchTable(String),

    #[error("table {0} has no column named {1}")]
    NoSuchColumn(String, String),

    #[error("table {0} has no row {1}")]
    NoSuchRow(String, Uuid),

    #[error("table {0} already has a row {1}")]
    RowExists(String, Uuid),

    #[error("column {0}:{1} cannot be modified")]
    NotMutable(String, String),

    #[error("column {0}:{1} is not monitored")]
    NotMonitored(String, String),

    #[error("cannot increment {0}:{1}: {2}")]
    BadIncrement(String, String, String),
}

#[derive(Debug)]
pub struct UpdateSyntaxError(pub String);

impl fmt::Display for UpdateSyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UpdateSyntaxError {}

#[derive(Debug)]
pub struct ConsistencyError(pub usize);

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "replica has {} inconsistent arcs", self.0)
    }
}

impl std::error::Error for ConsistencyError {}

/// Where the IDL is in setting up its monitor session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdlState {
    /// Waiting for the reply to `get_schema`.
    SchemaRequested,
    /// Waiting for the reply to `monitor`, after the server rejected `monitor_cond`.
    MonitorRequested,
    /// Receiving `update` notifications.
    Monitoring,
    /// Waiting for the reply to `monitor_cond`.
    MonitorCondRequested,
    /// Receiving `update2` notifications.
    MonitoringCond,
    /// The server does not have our database, or it rejected a condition change.
    NoSchema,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum UpdateVersion {
    Update,
    Update2,
}

impl UpdateVersion {
    fn table_updates_name(&self) -> &'static str {
        match self {
            UpdateVersion::Update => "table_updates",
            UpdateVersion::Update2 => "table_updates2",
        }
    }

    fn table_update_name(&self) -> &'static str {
        match self {
            UpdateVersion::Update => "table_update",
            UpdateVersion::Update2 => "table_update2",
        }
    }

    fn row_update_name(&self) -> &'static str {
        match self {
            UpdateVersion::Update => "row_update",
            UpdateVersion::Update2 => "row_update2",
        }
    }
}

pub struct Idl {
    pub(crate) class: IdlClass,
    pub(crate) session: Box<dyn JsonrpcSession>,
    /// Identifies our monitor to the server.  Rotated by every `monitor_cond_change`.
    uuid: Uuid,
    pub(crate) tables: Vec<Table>,
    pub(crate) change_seqno: u64,
    pub(crate) verify_write_only: bool,

    state_seqno: Option<u32>,
    state: IdlState,
    request_id: Option<Value>,
    schema: Option<Value>,

    pub(crate) lock_name: Option<String>,
    pub(crate) has_lock: bool,
    is_lock_contended: bool,
    lock_request_id: Option<Value>,

    pub(crate) txns: HashMap<TxnHandle, TxnRecord>,
    pub(crate) next_txn: u64,

    cond_changed: bool,
    cond_seqno: u64,
}

impl Idl {
    /// Creates an IDL that connects to `remote` and replicates the tables in `class`.
    ///
    /// # Arguments
    /// * `remote` - database server, as `tcp:HOST:PORT` or `unix:PATH`.
    /// * `class` - the tables and columns that the IDL knows about.
    /// * `monitor_everything` - replicate every column from the start.  Otherwise, nothing is
    ///   replicated until the client adds columns.
    /// * `retry` - keep reconnecting after connection failures.
    pub fn new(remote: &str, class: IdlClass, monitor_everything: bool, retry: bool) -> Idl {
        Idl::with_session(Box::new(Session::open(remote, retry)), class, monitor_everything)
    }

    /// Creates an IDL that talks to the database over `session`.
    pub fn with_session(session: Box<dyn JsonrpcSession>, class: IdlClass, monitor_everything: bool) -> Idl {
        let default_mode = if monitor_everything {
            ColumnMode::MONITOR | ColumnMode::ALERT
        } else {
            ColumnMode::empty()
        };
        let tables = class.tables.iter()
            .map(|tc| Table::new(tc.columns.len(), default_mode))
            .collect();
        Idl {
            class,
            session,
            uuid: Uuid::new_v4(),
            tables,
            change_seqno: 0,
            verify_write_only: false,
            state_seqno: None,
            state: IdlState::SchemaRequested,
            request_id: None,
            schema: None,
            lock_name: None,
            has_lock: false,
            is_lock_contended: false,
            lock_request_id: None,
            txns: HashMap::new(),
            next_txn: 0,
            cond_changed: false,
            cond_seqno: 0,
        }
    }

    /// Switches the IDL to a new remote.  The replica is refetched from the new server.
    pub fn set_remote(&mut self, remote: &str, retry: bool) {
        self.session = Box::new(Session::open(remote, retry));
        self.state_seqno = None;
    }

    pub fn class(&self) -> &IdlClass {
        &self.class
    }

    pub fn state(&self) -> IdlState {
        self.state
    }

    pub(crate) fn table_index(&self, table: &str) -> Result<usize> {
        match self.class.table_index(table) {
            Some(idx) => Ok(idx),
            None => Err(IdlError::NoSuchTable(table.into()).into()),
        }
    }

    pub(crate) fn column_index(&self, table: &str, column: &str) -> Result<(usize, usize)> {
        let t = self.table_index(table)?;
        match self.class.tables[t].column_index(column) {
            Some(c) => Ok((t, c)),
            None => Err(IdlError::NoSuchColumn(table.into(), column.into()).into()),
        }
    }

    fn add_ref_table(&mut self, base: &BaseType) {
        if let Some(ref_table) = &base.ref_table {
            if let Some(t) = self.class.table_index(ref_table) {
                self.tables[t].need_table = true;
            }
        }
    }

    /// Replicates `column` and reports changes to it through the change seqno.  Also makes
    /// sure that any tables that the column refers to are replicated.
    pub fn add_column(&mut self, table: &str, column: &str) -> Result<()> {
        let (t, c) = self.column_index(table, column)?;
        self.tables[t].modes[c] |= ColumnMode::MONITOR | ColumnMode::ALERT;
        let type_ = self.class.tables[t].columns[c].type_.clone();
        self.add_ref_table(&type_.key);
        if let Some(value) = &type_.value {
            self.add_ref_table(value);
        }
        Ok(())
    }

    /// Replicates `table`, even if none of its columns are replicated.  The client can then
    /// see which rows exist.
    pub fn add_table(&mut self, table: &str) -> Result<()> {
        let t = self.table_index(table)?;
        self.tables[t].need_table = true;
        Ok(())
    }

    /// Stops replicating `column`.
    pub fn omit(&mut self, table: &str, column: &str) -> Result<()> {
        let (t, c) = self.column_index(table, column)?;
        self.tables[t].modes[c] = ColumnMode::empty();
        Ok(())
    }

    /// Replicates `column` but keeps changes to it from bumping the change seqno.  This suits
    /// columns that the client writes but never reads.
    pub fn omit_alert(&mut self, table: &str, column: &str) -> Result<()> {
        self.add_column(table, column)?;
        let (t, c) = self.column_index(table, column)?;
        self.tables[t].modes[c].remove(ColumnMode::ALERT | ColumnMode::TRACK);
        Ok(())
    }

    pub fn track_add_column(&mut self, table: &str, column: &str) -> Result<()> {
        let (t, c) = self.column_index(table, column)?;
        if !self.tables[t].modes[c].contains(ColumnMode::ALERT) {
            self.add_column(table, column)?;
        }
        self.tables[t].modes[c] |= ColumnMode::TRACK;
        Ok(())
    }

    pub fn track_add_all(&mut self) {
        let columns: Vec<(String, String)> = self.class.tables.iter()
            .flat_map(|tc| tc.columns.iter().map(move |c| (tc.name.clone(), c.name.clone())))
            .collect();
        for (table, column) in columns {
            // Every name comes from our own class, so this cannot fail.
            let _ = self.track_add_column(&table, &column);
        }
    }

    /// Makes writes to columns that are not write-only into bugs that are logged and ignored.
    pub fn verify_write_only(&mut self) {
        self.verify_write_only = true;
    }

    /// Returns a number that changes whenever the replica changes, the initial snapshot
    /// arrives, or the lock is acquired.
    pub fn get_seqno(&self) -> u64 {
        self.change_seqno
    }

    pub fn has_ever_connected(&self) -> bool {
        self.change_seqno != 0
    }

    pub fn is_alive(&self) -> bool {
        self.session.is_alive() && self.state != IdlState::NoSchema
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn get_last_error(&self) -> Option<String> {
        match self.session.last_error() {
            Some(error) => Some(error),
            None if self.state == IdlState::NoSchema => Some("database not found".into()),
            None => None,
        }
    }

    pub fn force_reconnect(&mut self) {
        self.session.force_reconnect();
    }

    pub fn enable_reconnect(&mut self) {
        self.session.enable_reconnect();
    }

    pub fn set_probe_interval(&mut self, probe_interval: Duration) {
        self.session.set_probe_interval(probe_interval);
    }

    /// Runs the IDL until the first snapshot of the database has arrived, or until the
    /// session gives up.
    pub fn get_initial_snapshot(&mut self) {
        loop {
            self.run();
            if self.has_ever_connected() || !self.is_alive() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn send(&mut self, msg: Message) {
        if let Err(e) = self.session.send(msg) {
            debug!("{}: send failed ({})", self.session.name(), e);
        }
    }

    /// Processes a batch of messages from the database server.  This may change the replica,
    /// which the client can detect with [`Idl::get_seqno`].
    pub fn run(&mut self) {
        self.send_cond_change();

        self.session.run();
        for _ in 0..50 {
            if !self.session.is_connected() {
                break;
            }
            let seqno = self.session.seqno();
            if self.state_seqno != Some(seqno) {
                self.state_seqno = Some(seqno);
                self.request_id = None;
                self.abort_all_txns();

                self.send_schema_request();
                self.state = IdlState::SchemaRequested;
                if self.lock_name.is_some() {
                    self.send_lock_request("lock");
                }
            }

            let msg = match self.session.recv() {
                Some(msg) => msg,
                None => break,
            };
            self.process_msg(msg);
        }
    }

    fn process_msg(&mut self, msg: Message) {
        match &msg {
            Message::Notify { method, params } if method == "update2" && is_update_params(params) => {
                self.parse_update(&params[1], UpdateVersion::Update2);
            },
            Message::Reply { result, id } if self.request_id.as_ref() == Some(id) => {
                self.request_id = None;
                match self.state {
                    IdlState::SchemaRequested => {
                        self.schema = Some(result.clone());
                        self.send_monitor_request("monitor_cond");
                        self.state = IdlState::MonitorCondRequested;
                    },
                    IdlState::MonitorRequested | IdlState::MonitorCondRequested => {
                        self.change_seqno += 1;
                        self.clear();
                        if self.state == IdlState::MonitorRequested {
                            self.state = IdlState::Monitoring;
                            self.parse_update(result, UpdateVersion::Update);
                        } else {
                            self.state = IdlState::MonitoringCond;
                            self.parse_update(result, UpdateVersion::Update2);
                        }
                        info!("{}: monitoring {} database", self.session.name(), self.class.database);
                        self.schema = None;
                    },
                    IdlState::MonitoringCond => {
                        self.send_cond_change();
                        self.cond_seqno += 1;
                    },
                    IdlState::Monitoring | IdlState::NoSchema => {
                        debug!("{}: unexpected reply in state {:?}", self.session.name(), self.state);
                    },
                }
            },
            Message::Notify { method, params } if method == "update" && is_update_params(params) => {
                self.parse_update(&params[1], UpdateVersion::Update);
            },
            Message::Reply { result, id } if self.lock_request_id.as_ref() == Some(id) => {
                self.parse_lock_reply(result);
            },
            Message::Notify { method, params } if method == "locked" => {
                self.parse_lock_notify(params, true);
            },
            Message::Notify { method, params } if method == "stolen" => {
                self.parse_lock_notify(params, false);
            },
            Message::Error { error, id }
                if self.state == IdlState::MonitorCondRequested && self.request_id.as_ref() == Some(id) =>
            {
                if error.as_str() == Some("unknown method") {
                    // The server predates conditional monitoring.
                    self.request_id = None;
                    self.send_monitor_request("monitor");
                    self.state = IdlState::MonitorRequested;
                }
            },
            Message::Error { id, .. }
                if self.state == IdlState::MonitoringCond && self.request_id.as_ref() == Some(id) =>
            {
                self.request_id = None;
                event!(Level::ERROR, "{}: conditional monitor update failed", self.session.name());
                self.state = IdlState::NoSchema;
            },
            Message::Error { id, .. }
                if self.state == IdlState::SchemaRequested && self.request_id.as_ref() == Some(id) =>
            {
                self.request_id = None;
                event!(Level::ERROR, "{}: requested schema not found", self.session.name());
                self.state = IdlState::NoSchema;
            },
            Message::Reply { .. } | Message::Error { .. } if self.process_txn_reply(&msg) => (),
            _ => {
                // Replies to destroyed transactions end up here.
                debug!("{}: received unexpected {} message", self.session.name(), msg.type_name());
            },
        }
    }

    fn send_schema_request(&mut self) {
        let msg = Message::request("get_schema", json!([self.class.database]));
        self.request_id = msg.id().cloned();
        self.send(msg);
    }

    fn send_monitor_request(&mut self, method: &str) {
        let schema = self.schema.as_ref().and_then(schema_columns);
        let mut requests = Map::new();
        for (tc, table) in self.class.tables.iter().zip(self.tables.iter_mut()) {
            let table_schema = schema.as_ref().and_then(|s| s.get(&tc.name));

            let mut columns = if table.need_table { Some(Vec::new()) } else { None };
            for (column, mode) in tc.columns.iter().zip(table.modes.iter()) {
                if !mode.contains(ColumnMode::MONITOR) {
                    continue;
                }
                if let Some(table_schema) = table_schema {
                    if !table_schema.contains(&column.name) {
                        event!(Level::WARN, "{} table in {} database lacks {} column (database needs upgrade?)",
                               tc.name, self.class.database, column.name);
                        continue;
                    }
                }
                columns.get_or_insert_with(Vec::new).push(json!(column.name));
            }

            if let Some(columns) = columns {
                if schema.is_some() && table_schema.is_none() {
                    event!(Level::WARN, "{} database lacks {} table (database needs upgrade?)",
                           self.class.database, tc.name);
                    continue;
                }
                let mut request = json!({"columns": columns});
                if method == "monitor_cond" && !table.condition.is_true() {
                    request["where"] = table.condition.to_json();
                    table.cond_changed = false;
                }
                requests.insert(tc.name.clone(), request);
            }
        }

        let msg = Message::request(method, json!([self.class.database, self.uuid.to_string(), requests]));
        self.request_id = msg.id().cloned();
        self.send(msg);
        self.cond_changed = false;
    }

    fn send_cond_change(&mut self) {
        if !self.cond_changed || !self.session.is_connected()
            || self.state != IdlState::MonitoringCond || self.request_id.is_some() {
            return;
        }

        let mut requests = Map::new();
        for (tc, table) in self.class.tables.iter().zip(self.tables.iter_mut()) {
            if table.cond_changed {
                requests.insert(tc.name.clone(), json!([{"where": table.condition.to_json()}]));
                table.cond_changed = false;
            }
        }

        if !requests.is_empty() {
            let old_uuid = self.uuid;
            self.uuid = Uuid::new_v4();
            let msg = Message::request("monitor_cond_change",
                                       json!([old_uuid.to_string(), self.uuid.to_string(), requests]));
            self.request_id = msg.id().cloned();
            self.send(msg);
        }
        self.cond_changed = false;
    }

    /// Sets the condition that rows of `table` must satisfy to be replicated.  Returns the
    /// condition seqno at which the replica will reflect the new condition.  See
    /// [`Idl::get_condition_seqno`].
    pub fn set_condition(&mut self, table: &str, condition: &Condition) -> Result<u64> {
        let t = self.table_index(table)?;
        let seqno = self.cond_seqno;
        if self.tables[t].condition != *condition {
            self.tables[t].condition = condition.clone();
            self.tables[t].cond_changed = true;
            self.cond_changed = true;
            Ok(seqno + 1)
        } else {
            Ok(seqno)
        }
    }

    /// Returns the number of condition changes that the server has acknowledged.
    pub fn get_condition_seqno(&self) -> u64 {
        self.cond_seqno
    }

    pub fn get_condition(&self, table: &str) -> Result<&Condition> {
        let t = self.table_index(table)?;
        Ok(&self.tables[t].condition)
    }

    /// Throws away the replica.
    fn clear(&mut self) {
        let mut changed = false;
        for table in &mut self.tables {
            table.cond_changed = false;
            if !table.rows.is_empty() {
                changed = true;
                table.rows.clear();
            }
        }
        self.cond_changed = false;
        self.cond_seqno = 0;
        self.track_clear();
        if changed {
            self.change_seqno += 1;
        }
    }

    fn parse_update(&mut self, table_updates: &Value, version: UpdateVersion) {
        if let Err(e) = self.parse_update__(table_updates, version) {
            event!(Level::WARN, "{}", e);
        }
    }

    fn parse_update__(&mut self, table_updates: &Value, version: UpdateVersion) -> Result<()> {
        let table_updates = match table_updates.as_object() {
            Some(table_updates) => table_updates,
            None => Err(UpdateSyntaxError(format!("<{}> is not an object", version.table_updates_name())))?
        };
        for (table_name, table_update) in table_updates {
            let t = match self.class.table_index(table_name) {
                Some(t) => t,
                None => Err(UpdateSyntaxError(format!("<{}> includes unknown table \"{}\"",
                                                      version.table_updates_name(), table_name)))?
            };
            let table_update = match table_update.as_object() {
                Some(table_update) => table_update,
                None => Err(UpdateSyntaxError(format!("<{}> for table \"{}\" is not an object",
                                                      version.table_update_name(), table_name)))?
            };
            for (uuid_name, row_update) in table_update {
                let uuid = match Uuid::parse_str(uuid_name) {
                    Ok(uuid) => uuid,
                    Err(_) => Err(UpdateSyntaxError(format!(
                        "<{}> for table \"{}\" contains bad UUID \"{}\" as member name",
                        version.table_update_name(), table_name, uuid_name)))?
                };
                let row_update = match row_update.as_object() {
                    Some(row_update) => row_update,
                    None => Err(UpdateSyntaxError(format!(
                        "<{}> for table \"{}\" contains <{}> for {} that is not an object",
                        version.table_update_name(), table_name, version.row_update_name(), uuid_name)))?
                };

                let changed = match version {
                    UpdateVersion::Update => {
                        let old = row_update.get("old");
                        let new = row_update.get("new");
                        if old.map_or(false, |old| !old.is_object()) {
                            Err(UpdateSyntaxError("\"old\" <row> is not object".into()))?
                        } else if new.map_or(false, |new| !new.is_object()) {
                            Err(UpdateSyntaxError("\"new\" <row> is not object".into()))?
                        } else if old.is_some() as usize + new.is_some() as usize != row_update.len() {
                            Err(UpdateSyntaxError("<row-update> contains unexpected member".into()))?
                        } else if old.is_none() && new.is_none() {
                            Err(UpdateSyntaxError("<row-update> missing \"old\" and \"new\" members".into()))?
                        }
                        self.process_update(t, uuid, old.and_then(Value::as_object),
                                            new.and_then(Value::as_object))
                    },
                    UpdateVersion::Update2 => {
                        let op = ["modify", "insert", "delete", "initial"].iter()
                            .find_map(|op| row_update.get(*op).map(|row| (*op, row)));
                        match op {
                            Some((op, row)) => self.process_update2(t, uuid, op, row),
                            None => Err(UpdateSyntaxError("<row_update2> includes unknown object".into()))?
                        }
                    },
                };
                if changed {
                    self.change_seqno += 1;
                }
            }
        }
        Ok(())
    }

    fn row_is_orphan(&self, t: usize, uuid: &Uuid) -> Option<bool> {
        self.tables[t].rows.get(uuid).map(|row| row.state.is_orphan())
    }

    /// Applies one `update` row change.  Returns true if a column with ALERT changed.
    fn process_update(&mut self, t: usize, uuid: Uuid,
                      old: Option<&Map<String, Value>>, new: Option<&Map<String, Value>>) -> bool {
        let table_name = self.class.tables[t].name.clone();
        let orphan = self.row_is_orphan(t, &uuid);
        match (old, new) {
            (_, None) => {
                if orphan == Some(false) {
                    self.delete_row(t, uuid);
                } else {
                    event!(Level::WARN, "cannot delete missing row {} from table {}", uuid, table_name);
                    return false;
                }
            },
            (None, Some(new)) => {
                if orphan == Some(false) {
                    event!(Level::WARN, "cannot add existing row {} to table {}", uuid, table_name);
                    return self.modify_row(t, uuid, new, false);
                }
                self.insert_row(t, uuid, new);
            },
            (Some(_), Some(new)) => {
                match orphan {
                    Some(false) => return self.modify_row(t, uuid, new, false),
                    Some(true) => {
                        event!(Level::WARN, "cannot modify missing but referenced row {} in table {}",
                               uuid, table_name);
                    },
                    None => {
                        event!(Level::WARN, "cannot modify missing row {} in table {}", uuid, table_name);
                    },
                }
                self.insert_row(t, uuid, new);
            },
        }
        true
    }

    /// Applies one `update2` row change.  Returns true if a column with ALERT changed.
    fn process_update2(&mut self, t: usize, uuid: Uuid, op: &str, row: &Value) -> bool {
        let table_name = self.class.tables[t].name.clone();
        let orphan = self.row_is_orphan(t, &uuid);
        let empty = Map::new();
        let row = row.as_object().unwrap_or(&empty);
        match op {
            "delete" => {
                if orphan == Some(false) {
                    self.delete_row(t, uuid);
                } else {
                    event!(Level::WARN, "cannot delete missing row {} from table {}", uuid, table_name);
                    return false;
                }
            },
            "insert" | "initial" => {
                if orphan == Some(false) {
                    event!(Level::WARN, "cannot add existing row {} to table {}", uuid, table_name);
                    self.delete_row(t, uuid);
                }
                self.insert_row(t, uuid, row);
            },
            _ => {
                match orphan {
                    Some(false) => return self.modify_row(t, uuid, row, true),
                    Some(true) => {
                        event!(Level::WARN, "cannot modify missing but referenced row {} in table {}",
                               uuid, table_name);
                    },
                    None => {
                        event!(Level::WARN, "cannot modify missing row {} in table {}", uuid, table_name);
                    },
                }
                return false;
            },
        }
        true
    }

    /// Applies `values`, either full column values or `update2` diffs, to a committed row.
    /// Returns true if a column with ALERT changed.
    fn row_change(&mut self, t: usize, uuid: Uuid, values: &Map<String, Value>, diff: bool,
                  change: Change) -> bool {
        let next_seqno = self.change_seqno + 1;
        let tc = &self.class.tables[t];
        let table = &mut self.tables[t];
        let row = match table.rows.get_mut(&uuid) {
            Some(row) => row,
            None => return false,
        };
        let data = match &mut row.state {
            RowState::Committed(data) => data,
            _ => return false,
        };

        let mut changed = false;
        let mut tracked = false;
        for (name, value) in values {
            let c = match tc.column_index(name) {
                Some(c) => c,
                None => {
                    event!(Level::WARN, "unknown column {} updating row {}", name, uuid);
                    continue;
                }
            };
            let type_ = &tc.columns[c].type_;
            let datum = if diff {
                Datum::from_json_transient(type_, value).and_then(|diff| data[c].apply_diff(&diff, type_))
            } else {
                Datum::from_json(type_, value)
            };
            match datum {
                Ok(datum) => {
                    // The monitor protocol reports every column of a row, changed or not.
                    if datum != data[c] {
                        data[c] = datum;
                        let mode = table.modes[c];
                        if mode.contains(ColumnMode::ALERT) {
                            changed = true;
                            row.change_seqno[change as usize] = next_seqno;
                            table.change_seqno[change as usize] = next_seqno;
                            if mode.contains(ColumnMode::TRACK) {
                                row.updated.insert(c);
                                tracked = true;
                            }
                        }
                    }
                },
                Err(e) => {
                    event!(Level::WARN, "error parsing column {} in row {} in table {}: {}",
                           name, uuid, tc.name, e);
                }
            }
        }
        if tracked {
            table.track(uuid);
        }
        changed
    }

    fn insert_row(&mut self, t: usize, uuid: Uuid, values: &Map<String, Value>) {
        let defaults = self.class.tables[t].default_row();
        let next_seqno = self.change_seqno + 1;
        let table = &mut self.tables[t];
        let tracked = table.is_tracked();
        table.deleted.remove(&uuid);
        let row = table.rows.entry(uuid).or_insert_with(|| Row::new(uuid, RowState::Orphan));
        row.state = RowState::Committed(defaults);
        row.change_seqno[Change::Insert as usize] = next_seqno;
        table.change_seqno[Change::Insert as usize] = next_seqno;
        if tracked {
            table.track(uuid);
        }

        self.row_change(t, uuid, values, false, Change::Insert);
        self.parse_arcs(RowId { table: t, uuid });
        // Rows that referred to this one while it was an orphan keep their arcs, so they see
        // it as soon as it exists.
    }

    fn delete_row(&mut self, t: usize, uuid: Uuid) {
        self.clear_arcs(RowId { table: t, uuid }, true);

        let next_seqno = self.change_seqno + 1;
        let table = &mut self.tables[t];
        let tracked = table.is_tracked();
        let destroy = match table.rows.get_mut(&uuid) {
            Some(row) => {
                let old = std::mem::replace(&mut row.state, RowState::Orphan);
                row.change_seqno[Change::Delete as usize] = next_seqno;
                if tracked {
                    let mut snapshot = Row::new(uuid, old);
                    snapshot.change_seqno = row.change_seqno;
                    snapshot.updated = std::mem::take(&mut row.updated);
                    table.deleted.insert(uuid, snapshot);
                }
                row.backward_arcs.is_empty()
            },
            None => return,
        };
        table.change_seqno[Change::Delete as usize] = next_seqno;
        if tracked {
            table.track(uuid);
        }
        if destroy {
            table.rows.remove(&uuid);
        }
    }

    fn modify_row(&mut self, t: usize, uuid: Uuid, values: &Map<String, Value>, diff: bool) -> bool {
        let id = RowId { table: t, uuid };
        self.clear_arcs(id, true);
        let changed = self.row_change(t, uuid, values, diff, Change::Modify);
        self.parse_arcs(id);
        changed
    }

    /// The rows that `data`, a row in table `t`, refers to.
    fn referenced_rows(&self, t: usize, data: &[Datum]) -> BTreeSet<RowId> {
        let mut refs = BTreeSet::new();
        for (column, datum) in self.class.tables[t].columns.iter().zip(data) {
            let bases = std::iter::once((&column.type_.key, datum.keys()))
                .chain(column.type_.value.as_ref().map(|value| (value, datum.values())));
            for (base, atoms) in bases {
                let dst_table = match base.ref_table.as_deref().and_then(|name| self.class.table_index(name)) {
                    Some(dst_table) => dst_table,
                    None => continue,
                };
                for uuid in atoms.filter_map(|atom| atom.as_uuid()) {
                    if !uuid.is_nil() {
                        refs.insert(RowId { table: dst_table, uuid: *uuid });
                    }
                }
            }
        }
        refs
    }

    /// Adds an arc from `src` to every row that its committed data refers to, creating orphan
    /// rows for references to rows that do not exist yet.
    fn parse_arcs(&mut self, src: RowId) {
        let dsts = match self.tables[src.table].rows.get(&src.uuid).and_then(|row| row.state.old()) {
            Some(data) => self.referenced_rows(src.table, data),
            None => return,
        };
        for dst in dsts {
            if dst == src {
                continue;
            }
            self.tables[dst.table].rows.entry(dst.uuid)
                .or_insert_with(|| Row::new(dst.uuid, RowState::Orphan))
                .backward_arcs.insert(src);
            if let Some(row) = self.tables[src.table].rows.get_mut(&src.uuid) {
                row.forward_arcs.insert(dst);
            }
        }
    }

    /// Removes all of the arcs from `src`.  If `destroy_dsts`, orphan rows that nothing refers
    /// to any longer are destroyed.
    fn clear_arcs(&mut self, src: RowId, destroy_dsts: bool) {
        let dsts = match self.tables[src.table].rows.get_mut(&src.uuid) {
            Some(row) => std::mem::take(&mut row.forward_arcs),
            None => return,
        };
        for dst in dsts {
            let dst_rows = &mut self.tables[dst.table].rows;
            let destroy = match dst_rows.get_mut(&dst.uuid) {
                Some(row) => {
                    row.backward_arcs.remove(&src);
                    destroy_dsts && row.state.is_orphan() && row.backward_arcs.is_empty()
                },
                None => false,
            };
            if destroy {
                dst_rows.remove(&dst.uuid);
            }
        }
    }

    /// Checks that the arc graph matches the references in the replica, logging every
    /// discrepancy.
    pub fn check_consistency(&self) -> Result<()> {
        let mut errors = 0;
        for (t, table) in self.tables.iter().enumerate() {
            let tc = &self.class.tables[t];
            for (uuid, row) in &table.rows {
                let src = RowId { table: t, uuid: *uuid };
                let mut dsts = match row.state.old() {
                    Some(data) => self.referenced_rows(t, data),
                    None => BTreeSet::new(),
                };
                dsts.remove(&src);

                for arc in &row.forward_arcs {
                    if !dsts.remove(arc) {
                        event!(Level::ERROR, "unexpected arc from {} row {} to {} row {}",
                               tc.name, uuid, self.class.tables[arc.table].name, arc.uuid);
                        errors += 1;
                    }
                    let back = self.tables[arc.table].rows.get(&arc.uuid)
                        .map_or(false, |dst| dst.backward_arcs.contains(&src));
                    if !back {
                        event!(Level::ERROR, "{} row {} lacks backward arc from {} row {}",
                               self.class.tables[arc.table].name, arc.uuid, tc.name, uuid);
                        errors += 1;
                    }
                }
                for dst in dsts {
                    event!(Level::ERROR, "{} row {} missing arc to row {}", tc.name, uuid, dst.uuid);
                    errors += 1;
                }
            }
        }
        if errors > 0 {
            return Err(ConsistencyError(errors).into());
        }
        Ok(())
    }

    fn row_ref<'a>(&'a self, t: usize, row: &'a Row) -> RowRef<'a> {
        RowRef { idl: self, table: t, row, deleted: false }
    }

    /// Returns the rows of `table` that exist, in UUID order.  Inside a transaction, this
    /// includes rows that the transaction inserted and excludes rows that it deleted.
    pub fn rows(&self, table: &str) -> Vec<RowRef<'_>> {
        let t = match self.class.table_index(table) {
            Some(t) => t,
            None => return Vec::new(),
        };
        let mut rows: Vec<RowRef> = self.tables[t].rows.values()
            .filter(|row| row.state.new().is_some())
            .map(|row| self.row_ref(t, row))
            .collect();
        rows.sort_by_key(|row| row.uuid());
        rows
    }

    pub fn first(&self, table: &str) -> Option<RowRef<'_>> {
        self.rows(table).into_iter().next()
    }

    pub fn next(&self, row: &RowRef) -> Option<RowRef<'_>> {
        let table = &self.class.tables[row.table].name;
        self.rows(table).into_iter().find(|other| other.uuid() > row.uuid())
    }

    pub fn get_row_for_uuid(&self, table: &str, uuid: &Uuid) -> Option<RowRef<'_>> {
        let t = self.class.table_index(table)?;
        self.tables[t].rows.get(uuid)
            .filter(|row| row.state.new().is_some())
            .map(|row| self.row_ref(t, row))
    }

    /// Reads `column` in a row, as the current transaction (if any) would leave it.
    pub fn read(&self, table: &str, uuid: &Uuid, column: &str) -> Option<&Datum> {
        let (t, c) = self.column_index(table, column).ok()?;
        self.tables[t].rows.get(uuid)?.state.new().map(|data| &data[c])
    }

    /// Returns the latest change seqno of any kind for `table`.
    pub fn table_get_seqno(&self, table: &str) -> u64 {
        match self.class.table_index(table) {
            Some(t) => self.tables[t].change_seqno.iter().copied().max().unwrap_or(0),
            None => 0,
        }
    }

    /// Returns the rows of `table` that were inserted, modified in a tracked column, or
    /// deleted since the last [`Idl::track_clear`], least recently changed first.
    pub fn track_get(&self, table: &str) -> Vec<RowRef<'_>> {
        let t = match self.class.table_index(table) {
            Some(t) => t,
            None => return Vec::new(),
        };
        let table = &self.tables[t];
        table.track_list.iter()
            .filter_map(|uuid| match table.rows.get(uuid) {
                Some(row) if !row.state.is_orphan() => Some(self.row_ref(t, row)),
                _ => table.deleted.get(uuid).map(|row| RowRef { idl: self, table: t, row, deleted: true }),
            })
            .collect()
    }

    pub fn track_clear(&mut self) {
        for table in &mut self.tables {
            for uuid in std::mem::take(&mut table.track_list) {
                if let Some(row) = table.rows.get_mut(&uuid) {
                    row.updated.clear();
                }
            }
            table.deleted.clear();
        }
    }

    /// Requests the database lock `lock_name`, releasing any lock requested before, or just
    /// releases the current lock if `lock_name` is `None`.  While a lock is configured,
    /// transactions fail with "not locked" unless the IDL holds it.
    pub fn set_lock(&mut self, lock_name: Option<&str>) {
        let release = match &self.lock_name {
            Some(old) => lock_name != Some(old.as_str()),
            None => false,
        };
        if release {
            self.send_lock_request("unlock");
            self.lock_name = None;
            self.is_lock_contended = false;
        }
        if self.lock_name.is_none() {
            if let Some(name) = lock_name {
                self.lock_name = Some(name.into());
                self.send_lock_request("lock");
            }
        }
    }

    pub fn has_lock(&self) -> bool {
        self.has_lock
    }

    pub fn is_lock_contended(&self) -> bool {
        self.is_lock_contended
    }

    fn update_has_lock(&mut self, new_has_lock: bool) {
        if new_has_lock && !self.has_lock {
            if matches!(self.state, IdlState::Monitoring | IdlState::MonitoringCond) {
                self.change_seqno += 1;
            }
            self.is_lock_contended = false;
            info!("{}: acquired lock {}", self.session.name(), self.lock_name.as_deref().unwrap_or(""));
        } else if !new_has_lock && self.has_lock {
            info!("{}: lost lock {}", self.session.name(), self.lock_name.as_deref().unwrap_or(""));
        }
        self.has_lock = new_has_lock;
    }

    fn send_lock_request(&mut self, method: &str) {
        self.update_has_lock(false);
        self.lock_request_id = None;
        if self.session.is_connected() {
            if let Some(name) = &self.lock_name {
                let msg = Message::request(method, json!([name]));
                if method == "lock" {
                    self.lock_request_id = msg.id().cloned();
                }
                self.send(msg);
            }
        }
    }

    fn parse_lock_reply(&mut self, result: &Value) {
        self.lock_request_id = None;
        let got_lock = result.get("locked").and_then(Value::as_bool).unwrap_or(false);
        self.update_has_lock(got_lock);
        if !got_lock {
            self.is_lock_contended = true;
        }
    }

    fn parse_lock_notify(&mut self, params: &Value, new_has_lock: bool) {
        let name = params.get(0).and_then(Value::as_str);
        if name.is_some() && name == self.lock_name.as_deref() {
            self.update_has_lock(new_has_lock);
            if !new_has_lock {
                self.is_lock_contended = true;
            }
        }
    }

    fn abort_all_txns(&mut self) {
        for record in self.txns.values_mut() {
            if record.status == TxnStatus::Incomplete {
                record.status = TxnStatus::TryAgain;
            }
        }
    }

    fn process_txn_reply(&mut self, msg: &Message) -> bool {
        let id = match msg.id() {
            Some(id) => id,
            None => return false,
        };
        let record = match self.txns.values_mut()
            .find(|record| record.status == TxnStatus::Incomplete && record.request_id.as_ref() == Some(id)) {
            Some(record) => record,
            None => return false,
        };
        let status = match msg {
            Message::Reply { result, .. } => record.process_reply(result),
            _ => TxnStatus::Error,
        };
        record.status = status;
        true
    }
}

fn is_update_params(params: &Value) -> bool {
    matches!(params.as_array().map(Vec::as_slice), Some([Value::String(_), _]))
}

/// Extracts the table and column names from a database schema.  Returns `None` if `schema`
/// does not look like a schema.
fn schema_columns(schema: &Value) -> Option<BTreeMap<String, BTreeSet<String>>> {
    let tables = schema.get("tables")?.as_object()?;
    let mut result = BTreeMap::new();
    for (name, table) in tables {
        let columns = table.get("columns")?.as_object()?;
        result.insert(name.clone(), columns.keys().cloned().collect());
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Clause, Function};
    use crate::testing::{example_class as class, TestServer};
    use tracing_test::traced_test;

    fn connected(server: &TestServer) -> Idl {
        let mut idl = server.idl(true);
        idl.run();
        idl
    }

    #[test]
    fn initial_snapshot() {
        let server = TestServer::new(&class());
        server.transact(json!([
            {"op": "insert", "table": "Parent", "row": {"name": "p1", "n": 5}}
        ]));
        let idl = connected(&server);
        assert_eq!(idl.state(), IdlState::MonitoringCond);
        assert!(idl.has_ever_connected());
        let rows = idl.rows("Parent");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].string("name"), "p1");
        assert_eq!(rows[0].integer("n"), 5);
    }

    #[test]
    fn falls_back_to_monitor() {
        let server = TestServer::new(&class());
        server.set_monitor_cond_supported(false);
        server.transact(json!([{"op": "insert", "table": "Parent", "row": {"name": "p1"}}]));
        let mut idl = connected(&server);
        assert_eq!(idl.state(), IdlState::Monitoring);
        assert_eq!(idl.rows("Parent").len(), 1);

        server.transact(json!([{"op": "update", "table": "Parent", "where": [], "row": {"name": "p2"}}]));
        idl.run();
        assert_eq!(idl.rows("Parent")[0].string("name"), "p2");
    }

    #[test]
    fn run_handles_at_most_50_messages() {
        let server = TestServer::new(&class());
        let mut idl = connected(&server);
        assert!(idl.rows("Parent").is_empty());

        // One update notification per transaction.
        for n in 0..60i64 {
            server.transact(json!([{"op": "insert", "table": "Parent", "row": {"n": n}}]));
        }
        idl.run();
        assert_eq!(idl.rows("Parent").len(), 50);
        idl.run();
        assert_eq!(idl.rows("Parent").len(), 60);
    }

    #[test]
    fn orphans_come_and_go() -> Result<()> {
        let server = TestServer::new(&class());
        let mut idl = connected(&server);
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();
        let children = json!(["set", [["uuid", child.to_string()]]]);

        // The parent arrives before the child it refers to.
        let seqno = idl.get_seqno();
        idl.process_msg(Message::notify("update", json!(["x", {
            "Parent": {parent.to_string(): {"new": {"name": "p", "children": children}}}
        }])));
        assert!(idl.get_seqno() > seqno);
        idl.check_consistency()?;
        let p = idl.get_row_for_uuid("Parent", &parent).unwrap();
        assert_eq!(p.uuids("children"), vec![child]);
        assert!(p.refs("children").is_empty());
        assert!(idl.get_row_for_uuid("Child", &child).is_none());

        idl.process_msg(Message::notify("update", json!(["x", {
            "Child": {child.to_string(): {"new": {"tag": 7}}}
        }])));
        idl.check_consistency()?;
        let p = idl.get_row_for_uuid("Parent", &parent).unwrap();
        assert_eq!(p.refs("children")[0].optional_integer("tag"), Some(7));

        // Deleting the child leaves an orphan behind while the parent refers to it.
        idl.process_msg(Message::notify("update", json!(["x", {
            "Child": {child.to_string(): {"old": {"tag": 7}}}
        }])));
        idl.check_consistency()?;
        assert!(idl.get_row_for_uuid("Child", &child).is_none());
        assert!(idl.tables[1].rows.contains_key(&child));

        idl.process_msg(Message::notify("update", json!(["x", {
            "Parent": {parent.to_string(): {"old": {}}}
        }])));
        idl.check_consistency()?;
        assert!(idl.tables[1].rows.is_empty());
        Ok(())
    }

    #[test]
    #[traced_test]
    fn bad_updates_are_logged() {
        let server = TestServer::new(&class());
        let mut idl = connected(&server);
        let uuid = Uuid::new_v4();
        idl.process_msg(Message::notify("update", json!(["x", {
            "Parent": {uuid.to_string(): {"old": {"name": "x"}}}
        }])));
        assert!(logs_contain("cannot delete missing row"));

        idl.process_msg(Message::notify("update2", json!(["x", {"Nope": {}}])));
        assert!(logs_contain("includes unknown table"));

        idl.process_msg(Message::notify("update2", json!(["x", {
            "Parent": {uuid.to_string(): {"frobnicate": {}}}
        }])));
        assert!(logs_contain("<row_update2> includes unknown object"));

        idl.process_msg(Message::notify("update2", json!(["x", {
            "Parent": {uuid.to_string(): {"insert": {"name": 5, "bogus": 1}}}
        }])));
        assert!(logs_contain("error parsing column name"));
        assert!(logs_contain("unknown column bogus"));
        assert_eq!(idl.rows("Parent")[0].string("name"), "");
    }

    #[test]
    fn update2_diffs() {
        let server = TestServer::new(&class());
        server.transact(json!([{"op": "insert", "table": "Parent",
                                "row": {"name": "p", "options": ["map", [["a", "1"], ["b", "2"]]]}}]));
        let mut idl = connected(&server);
        server.transact(json!([{"op": "mutate", "table": "Parent", "where": [],
                                "mutations": [["options", "insert", ["map", [["c", "3"]]]],
                                              ["options", "delete", ["set", ["a"]]]]}]));
        idl.run();
        let options = idl.rows("Parent")[0].string_map("options");
        assert_eq!(options.into_iter().collect::<Vec<_>>(),
                   vec![("b".to_string(), "2".to_string()), ("c".to_string(), "3".to_string())]);
    }

    #[test]
    fn tracking() {
        let server = TestServer::new(&class());
        let mut idl = server.idl(false);
        idl.track_add_column("Parent", "name").unwrap();
        idl.add_column("Parent", "n").unwrap();
        idl.run();

        let result = server.transact(json!([{"op": "insert", "table": "Parent", "row": {"name": "p"}}]));
        let uuid = Uuid::parse_str(result[0]["uuid"][1].as_str().unwrap()).unwrap();
        idl.run();
        let tracked = idl.track_get("Parent");
        assert_eq!(tracked.len(), 1);
        assert!(tracked[0].is_updated("name"));
        assert!(!tracked[0].is_updated("n"));
        idl.track_clear();
        assert!(idl.track_get("Parent").is_empty());

        // "n" is replicated but not tracked.
        server.transact(json!([{"op": "update", "table": "Parent", "where": [], "row": {"n": 3}}]));
        idl.run();
        assert!(idl.track_get("Parent").is_empty());
        assert_eq!(idl.rows("Parent")[0].integer("n"), 3);

        server.transact(json!([{"op": "delete", "table": "Parent", "where": []}]));
        idl.run();
        let tracked = idl.track_get("Parent");
        assert_eq!(tracked.len(), 1);
        assert!(tracked[0].is_deleted());
        assert_eq!(tracked[0].uuid(), uuid);
        assert_eq!(tracked[0].string("name"), "p");
        assert!(tracked[0].seqno(Change::Delete) > 0);
        assert!(idl.rows("Parent").is_empty());
        idl.track_clear();
        assert!(idl.track_get("Parent").is_empty());
    }

    #[test]
    fn omitted_alerts_do_not_bump_seqno() {
        let server = TestServer::new(&class());
        let mut idl = server.idl(true);
        idl.omit_alert("Parent", "n").unwrap();
        idl.omit("Parent", "options").unwrap();
        server.transact(json!([{"op": "insert", "table": "Parent",
                                "row": {"name": "p", "options": ["map", [["a", "1"]]]}}]));
        idl.run();
        assert!(idl.rows("Parent")[0].string_map("options").is_empty());

        let seqno = idl.get_seqno();
        server.transact(json!([{"op": "update", "table": "Parent", "where": [], "row": {"n": 9}}]));
        idl.run();
        assert_eq!(idl.get_seqno(), seqno);
        assert_eq!(idl.rows("Parent")[0].integer("n"), 9);
    }

    #[test]
    fn condition_changes_are_coalesced() -> Result<()> {
        let server = TestServer::new(&class());
        server.transact(json!([
            {"op": "insert", "table": "Parent", "row": {"name": "a"}},
            {"op": "insert", "table": "Parent", "row": {"name": "b"}},
        ]));
        let mut idl = connected(&server);
        assert_eq!(idl.rows("Parent").len(), 2);

        server.set_deferred(true);
        let mut cond = Condition::new();
        cond.add_clause(Clause::new("name", Function::Eq, Datum::scalar("a")));
        let seqno = idl.set_condition("Parent", &cond)?;
        assert_eq!(seqno, 1);
        idl.run();
        assert_eq!(server.request_count("monitor_cond_change"), 1);

        // Another change while the first is outstanding waits for its reply.
        cond.add_clause(Clause::new("name", Function::Eq, Datum::scalar("b")));
        idl.set_condition("Parent", &cond)?;
        cond = Condition::new();
        cond.add_clause(Clause::new("name", Function::Eq, Datum::scalar("b")));
        idl.set_condition("Parent", &cond)?;
        idl.run();
        assert_eq!(server.request_count("monitor_cond_change"), 1);

        server.set_deferred(false);
        server.process_deferred();
        idl.run();
        idl.run();
        assert_eq!(server.request_count("monitor_cond_change"), 2);
        assert_eq!(idl.get_condition_seqno(), 2);
        let names: Vec<String> = idl.rows("Parent").iter().map(|r| r.string("name")).collect();
        assert_eq!(names, vec!["b".to_string()]);
        assert_eq!(idl.set_condition("Parent", &cond)?, 2);
        Ok(())
    }

    #[test]
    fn lock() {
        let server = TestServer::new(&class());
        let mut a = server.idl(true);
        let mut b = server.idl(true);
        a.set_lock(Some("ovn_northd"));
        b.set_lock(Some("ovn_northd"));
        a.run();
        b.run();
        assert!(a.has_lock());
        assert!(!b.has_lock());
        assert!(b.is_lock_contended());

        a.set_lock(None);
        a.run();
        b.run();
        assert!(!a.has_lock());
        assert!(b.has_lock());
        assert!(!b.is_lock_contended());
    }

    #[test]
    fn reconnect_refetches() {
        let server = TestServer::new(&class());
        server.transact(json!([{"op": "insert", "table": "Parent", "row": {"name": "a"}}]));
        let mut idl = connected(&server);
        let seqno = idl.get_seqno();
        server.disconnect_all();
        server.transact(json!([{"op": "insert", "table": "Parent", "row": {"name": "b"}}]));
        idl.run();
        assert!(idl.get_seqno() > seqno);
        assert_eq!(idl.rows("Parent").len(), 2);
        assert_eq!(server.request_count("get_schema"), 2);
    }

    #[test]
    #[traced_test]
    fn missing_columns_are_skipped() {
        let mut server_class = class();
        server_class.tables[0].columns.retain(|c| c.name != "n");
        let server = TestServer::new(&server_class);
        let mut idl = Idl::with_session(Box::new(server.connect()), class(), true);
        idl.run();
        assert!(logs_contain("Parent table in Test database lacks n column (database needs upgrade?)"));
        assert_eq!(idl.state(), IdlState::MonitoringCond);
    }
}
