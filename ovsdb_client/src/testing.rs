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

//! An in-memory database server for tests.
//!
//! [`TestServer`] implements enough of the OVSDB protocol to exercise an [`Idl`]: `get_schema`,
//! `monitor`, `monitor_cond`, `monitor_cond_change`, `transact` with the common operations,
//! garbage collection and referential integrity, and `lock`/`steal`/`unlock`.  Requests are
//! answered synchronously, so a test can send a transaction and see its reply on the next
//! [`Idl::run`].  Tests can also disconnect clients, make the next transaction fail, or hold
//! requests back to observe an IDL with requests in flight.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use ovs::jsonrpc::{JsonrpcSession, Message};

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use anyhow::Result;

use crate::condition::Condition;
use crate::datum::{Atom, Datum};
use crate::idl::Idl;
use crate::schema::{AtomicType, BaseType, ColumnClass, ColumnType, IdlClass, RefType, TableClass};

/// A small schema with a root table that owns rows in a non-root table.
pub fn example_class() -> IdlClass {
    IdlClass::new("Test", vec![
        TableClass::new("Parent", true, vec![
            ColumnClass::new("name", ColumnType::scalar(AtomicType::String)),
            ColumnClass::new("children", ColumnType::set(AtomicType::Uuid)
                             .references("Child", RefType::Strong)),
            ColumnClass::new("options", ColumnType::map(AtomicType::String, AtomicType::String)),
            ColumnClass::new("n", ColumnType::scalar(AtomicType::Integer)),
        ]),
        TableClass::new("Child", false, vec![
            ColumnClass::new("tag", ColumnType::optional(AtomicType::Integer)),
            ColumnClass::new("sibling", ColumnType::optional(AtomicType::Uuid)
                             .references("Child", RefType::Weak)),
        ]),
    ])
}

type Rows = BTreeMap<Uuid, Vec<Datum>>;

struct MonitoredTable {
    columns: Vec<usize>,
    condition: Condition,
}

struct Monitor {
    id: Value,
    update2: bool,
    tables: BTreeMap<usize, MonitoredTable>,
}

struct SessionState {
    seqno: u32,
    inbox: VecDeque<Message>,
    monitors: Vec<Monitor>,
}

struct ServerState {
    class: IdlClass,
    db: Vec<Rows>,
    sessions: Vec<SessionState>,
    /// Sessions that requested each lock, owner first.
    locks: BTreeMap<String, VecDeque<usize>>,
    monitor_cond: bool,
    deferred: bool,
    pending: Vec<(usize, Message)>,
    requests: BTreeMap<String, usize>,
    failure: Option<(usize, String)>,
    comments: Vec<String>,
}

fn error(kind: &str, details: String) -> Value {
    json!({"error": kind, "details": details})
}

fn row_matches(tc: &TableClass, condition: &Condition, uuid: &Uuid, data: &[Datum]) -> bool {
    condition.evaluate(|column| match column {
        "_uuid" => Some(Datum::scalar(*uuid)),
        _ => tc.column_index(column).map(|c| data[c].clone()),
    })
}

fn row_json(tc: &TableClass, data: &[Datum], columns: &[usize], skip_defaults: bool) -> Value {
    let mut row = Map::new();
    for &c in columns {
        if skip_defaults && data[c].is_default(&tc.columns[c].type_) {
            continue;
        }
        row.insert(tc.columns[c].name.clone(), data[c].to_json());
    }
    Value::Object(row)
}

/// Calls `f` with the destination table, reference type, and UUID of every reference in a
/// row of table `t`.
fn for_each_ref<F>(class: &IdlClass, t: usize, data: &[Datum], mut f: F)
where F: FnMut(usize, RefType, &Uuid)
{
    for (column, datum) in class.tables[t].columns.iter().zip(data) {
        let bases = std::iter::once((&column.type_.key, datum.keys()))
            .chain(column.type_.value.as_ref().map(|value| (value, datum.values())));
        for (base, atoms) in bases {
            if let Some(dst) = base.ref_table.as_deref().and_then(|name| class.table_index(name)) {
                for uuid in atoms.filter_map(Atom::as_uuid) {
                    f(dst, base.ref_type, uuid);
                }
            }
        }
    }
}

fn is_dangling(class: &IdlClass, db: &[Rows], base: &BaseType, atom: &Atom) -> bool {
    match (base.ref_type, base.ref_table.as_deref().and_then(|name| class.table_index(name)), atom.as_uuid()) {
        (RefType::Weak, Some(dst), Some(uuid)) => !db[dst].contains_key(uuid),
        _ => false,
    }
}

fn resolve_named_uuids(json: Value, named: &BTreeMap<String, Uuid>) -> Value {
    match json {
        Value::Array(elems) => {
            if let [Value::String(tag), Value::String(name)] = elems.as_slice() {
                if tag == "named-uuid" {
                    if let Some(uuid) = named.get(name) {
                        return json!(["uuid", uuid.to_string()]);
                    }
                }
            }
            Value::Array(elems.into_iter().map(|elem| resolve_named_uuids(elem, named)).collect())
        },
        Value::Object(members) => {
            Value::Object(members.into_iter().map(|(k, v)| (k, resolve_named_uuids(v, named))).collect())
        },
        other => other,
    }
}

impl ServerState {
    fn receive(&mut self, session: usize, msg: Message) {
        if let Message::Request { method, .. } = &msg {
            *self.requests.entry(method.clone()).or_default() += 1;
        }
        if self.deferred {
            self.pending.push((session, msg));
        } else {
            self.handle(session, msg);
        }
    }

    fn handle(&mut self, session: usize, msg: Message) {
        let (method, params, id) = match msg {
            Message::Request { method, params, id } => (method, params, id),
            _ => return,
        };
        let result = match method.as_str() {
            "get_schema" => {
                if params.get(0).and_then(Value::as_str) == Some(self.class.database.as_str()) {
                    Ok(self.class.to_schema_json())
                } else {
                    Err(json!("unknown database"))
                }
            },
            "monitor" => self.monitor(session, &params, false),
            "monitor_cond" if self.monitor_cond => self.monitor(session, &params, true),
            "monitor_cond_change" if self.monitor_cond => self.monitor_cond_change(session, &params),
            "transact" => Ok(self.transact(Some(session), &params)),
            "lock" => Ok(self.lock(session, &params, false)),
            "steal" => Ok(self.lock(session, &params, true)),
            "unlock" => Ok(self.unlock(session, &params)),
            "echo" => Ok(params),
            _ => Err(json!("unknown method")),
        };
        let reply = match result {
            Ok(result) => Message::reply(result, id),
            Err(error) => Message::error(error, id),
        };
        self.sessions[session].inbox.push_back(reply);
    }

    fn monitor(&mut self, session: usize, params: &Value, update2: bool) -> Result<Value, Value> {
        let requests = match params.get(2).and_then(Value::as_object) {
            Some(requests) => requests,
            None => return Err(json!("syntax error")),
        };
        let mut monitor = Monitor {
            id: params.get(1).cloned().unwrap_or(Value::Null),
            update2,
            tables: BTreeMap::new(),
        };
        for (name, request) in requests {
            let t = self.class.table_index(name).ok_or_else(|| json!(format!("unknown table {}", name)))?;
            let tc = &self.class.tables[t];
            let request = match request {
                Value::Array(requests) => requests.first().cloned().unwrap_or_else(|| json!({})),
                other => other.clone(),
            };
            let columns = match request.get("columns").and_then(Value::as_array) {
                Some(names) => names.iter()
                    .map(|name| name.as_str().and_then(|name| tc.column_index(name))
                         .ok_or_else(|| json!(format!("unknown column {}", name))))
                    .collect::<Result<Vec<usize>, Value>>()?,
                None => (0..tc.columns.len()).collect(),
            };
            let condition = match request.get("where") {
                Some(where_) => Condition::from_json(where_, tc).map_err(|e| json!(e.to_string()))?,
                None => Condition::always(),
            };
            monitor.tables.insert(t, MonitoredTable { columns, condition });
        }

        let mut updates = Map::new();
        for (&t, mt) in &monitor.tables {
            let tc = &self.class.tables[t];
            let mut table_updates = Map::new();
            for (uuid, data) in &self.db[t] {
                if row_matches(tc, &mt.condition, uuid, data) {
                    let update = if update2 {
                        json!({"initial": row_json(tc, data, &mt.columns, true)})
                    } else {
                        json!({"new": row_json(tc, data, &mt.columns, false)})
                    };
                    table_updates.insert(uuid.to_string(), update);
                }
            }
            if !table_updates.is_empty() {
                updates.insert(tc.name.clone(), Value::Object(table_updates));
            }
        }
        self.sessions[session].monitors.push(monitor);
        Ok(Value::Object(updates))
    }

    fn monitor_cond_change(&mut self, session: usize, params: &Value) -> Result<Value, Value> {
        let (old_id, new_id, requests) = match params.as_array().map(Vec::as_slice) {
            Some([old_id, new_id, Value::Object(requests)]) => (old_id, new_id, requests),
            _ => return Err(json!("syntax error")),
        };
        let ServerState { class, db, sessions, .. } = self;
        let session = &mut sessions[session];
        let monitor = match session.monitors.iter_mut().find(|m| m.id == *old_id) {
            Some(monitor) => monitor,
            None => return Err(json!("unknown monitor")),
        };

        let mut updates = Map::new();
        for (name, request) in requests {
            let t = class.table_index(name).ok_or_else(|| json!(format!("unknown table {}", name)))?;
            let tc = &class.tables[t];
            let where_ = request.get(0).and_then(|r| r.get("where")).cloned().unwrap_or_else(|| json!([]));
            let condition = Condition::from_json(&where_, tc).map_err(|e| json!(e.to_string()))?;
            let mt = match monitor.tables.get_mut(&t) {
                Some(mt) => mt,
                None => return Err(json!(format!("table {} is not monitored", name))),
            };
            let old_condition = std::mem::replace(&mut mt.condition, condition);

            let mut table_updates = Map::new();
            for (uuid, data) in &db[t] {
                let before = row_matches(tc, &old_condition, uuid, data);
                let after = row_matches(tc, &mt.condition, uuid, data);
                if before && !after {
                    table_updates.insert(uuid.to_string(), json!({"delete": null}));
                } else if after && !before {
                    table_updates.insert(uuid.to_string(),
                                         json!({"insert": row_json(tc, data, &mt.columns, true)}));
                }
            }
            if !table_updates.is_empty() {
                updates.insert(tc.name.clone(), Value::Object(table_updates));
            }
        }

        monitor.id = new_id.clone();
        if !updates.is_empty() {
            session.inbox.push_back(Message::notify("update2", json!([new_id, updates])));
        }
        Ok(json!({}))
    }

    fn lock(&mut self, session: usize, params: &Value, steal: bool) -> Value {
        let name = params.get(0).and_then(Value::as_str).unwrap_or("").to_string();
        let queue = self.locks.entry(name.clone()).or_default();
        if steal {
            if let Some(&owner) = queue.front() {
                if owner != session {
                    self.sessions[owner].inbox.push_back(Message::notify("stolen", json!([name])));
                }
            }
            queue.retain(|s| *s != session);
            queue.push_front(session);
            return json!({"locked": true});
        }
        if !queue.contains(&session) {
            queue.push_back(session);
        }
        json!({"locked": queue.front() == Some(&session)})
    }

    fn release_lock(&mut self, session: usize, name: &str) {
        if let Some(queue) = self.locks.get_mut(name) {
            let was_owner = queue.front() == Some(&session);
            queue.retain(|s| *s != session);
            if was_owner {
                if let Some(&next) = queue.front() {
                    self.sessions[next].inbox.push_back(Message::notify("locked", json!([name])));
                }
            }
        }
    }

    fn unlock(&mut self, session: usize, params: &Value) -> Value {
        let name = params.get(0).and_then(Value::as_str).unwrap_or("").to_string();
        self.release_lock(session, &name);
        json!({})
    }

    fn disconnect(&mut self, session: usize) {
        let state = &mut self.sessions[session];
        state.seqno += 2;
        state.inbox.clear();
        state.monitors.clear();
        self.pending.retain(|(s, _)| *s != session);
        let names: Vec<String> = self.locks.keys().cloned().collect();
        for name in names {
            self.release_lock(session, &name);
        }
    }

    fn matching_rows(tc: &TableClass, rows: &Rows, where_: Option<&Value>) -> Result<Vec<Uuid>, Value> {
        let clauses = match where_.and_then(Value::as_array) {
            Some(clauses) => clauses,
            None => return Err(error("syntax error", "missing \"where\"".into())),
        };
        let conditions = clauses.iter()
            .map(|clause| Condition::from_json(&json!([clause]), tc)
                 .map_err(|e| error("syntax error", e.to_string())))
            .collect::<Result<Vec<Condition>, Value>>()?;
        Ok(rows.iter()
           .filter(|(uuid, data)| conditions.iter().all(|c| row_matches(tc, c, uuid, data)))
           .map(|(uuid, _)| *uuid)
           .collect())
    }

    fn apply_row(tc: &TableClass, data: &mut [Datum], row: Option<&Value>, insert: bool) -> Result<(), Value> {
        let row = match row {
            Some(Value::Object(row)) => row,
            None if insert => return Ok(()),
            _ => return Err(error("syntax error", "\"row\" is not an object".into())),
        };
        for (name, value) in row {
            let c = match tc.column_index(name) {
                Some(c) => c,
                None => return Err(error("unknown column", format!("{} table has no column {}", tc.name, name))),
            };
            if !insert && !tc.columns[c].mutable {
                return Err(error("constraint violation", format!("cannot modify immutable column {}", name)));
            }
            data[c] = Datum::from_json(&tc.columns[c].type_, value)
                .map_err(|e| error("syntax error", e.to_string()))?;
        }
        Ok(())
    }

    fn mutate(tc: &TableClass, data: &mut [Datum], mutation: &Value) -> Result<(), Value> {
        let (name, mutator, arg) = match mutation.as_array().map(Vec::as_slice) {
            Some([Value::String(name), Value::String(mutator), arg]) => (name, mutator.as_str(), arg),
            _ => return Err(error("syntax error", format!("bad mutation {}", mutation))),
        };
        let c = match tc.column_index(name) {
            Some(c) => c,
            None => return Err(error("unknown column", name.clone())),
        };
        let type_ = &tc.columns[c].type_;
        if !tc.columns[c].mutable {
            return Err(error("constraint violation", format!("cannot mutate immutable column {}", name)));
        }
        let bad_arg = |e: anyhow::Error| error("syntax error", e.to_string());
        match (mutator, &mut data[c]) {
            ("+=" | "-=" | "*=", Datum::Set(set)) => {
                let n = match arg.as_i64() {
                    Some(n) if type_.key.atomic == AtomicType::Integer => n,
                    _ => return Err(error("syntax error", format!("cannot apply {} to {}", mutator, name))),
                };
                *set = set.iter().filter_map(Atom::as_integer)
                    .map(|i| Atom::Integer(match mutator {
                        "+=" => i.wrapping_add(n),
                        "-=" => i.wrapping_sub(n),
                        _ => i.wrapping_mul(n),
                    }))
                    .collect();
            },
            ("insert", Datum::Set(set)) => {
                if let Datum::Set(arg) = Datum::from_json_transient(type_, arg).map_err(bad_arg)? {
                    set.extend(arg);
                }
            },
            ("insert", Datum::Map(map)) => {
                if let Datum::Map(arg) = Datum::from_json_transient(type_, arg).map_err(bad_arg)? {
                    for (k, v) in arg {
                        map.entry(k).or_insert(v);
                    }
                }
            },
            ("delete", Datum::Set(set)) => {
                if let Datum::Set(arg) = Datum::from_json_transient(type_, arg).map_err(bad_arg)? {
                    set.retain(|a| !arg.contains(a));
                }
            },
            ("delete", Datum::Map(map)) => {
                let keys_type = ColumnType::set(type_.key.atomic);
                match Datum::from_json_transient(&keys_type, arg) {
                    Ok(Datum::Set(keys)) => map.retain(|k, _| !keys.contains(k)),
                    _ => {
                        if let Datum::Map(pairs) = Datum::from_json_transient(type_, arg).map_err(bad_arg)? {
                            map.retain(|k, v| pairs.get(k) != Some(v));
                        }
                    }
                }
            },
            _ => return Err(error("syntax error", format!("unknown mutator {} for {}", mutator, name))),
        }
        data[c].check_size(type_).map_err(|e| error("constraint violation", e.to_string()))
    }

    fn execute(&mut self, session: Option<usize>, db: &mut [Rows], named: &BTreeMap<String, Uuid>,
               op: &Value) -> Result<Value, Value> {
        let table = match op.get("table").and_then(Value::as_str) {
            Some(name) => match self.class.table_index(name) {
                Some(t) => Some(t),
                None => return Err(error("unknown table", name.into())),
            },
            None => None,
        };
        let op_name = op.get("op").and_then(Value::as_str).unwrap_or("");
        let t = match (op_name, table) {
            ("comment" | "abort" | "assert", _) => 0,
            (_, Some(t)) => t,
            (_, None) => return Err(error("syntax error", format!("{} lacks \"table\"", op_name))),
        };
        let tc = &self.class.tables[t];

        match op_name {
            "insert" => {
                let uuid = match (op.get("uuid"), op.get("uuid-name").and_then(Value::as_str)) {
                    (Some(uuid), _) => Atom::from_json(AtomicType::Uuid, uuid).ok().and_then(|a| a.as_uuid().copied())
                        .ok_or_else(|| error("syntax error", "bad \"uuid\"".into()))?,
                    (None, Some(name)) => named.get(name).copied().unwrap_or_else(Uuid::new_v4),
                    (None, None) => Uuid::new_v4(),
                };
                if db[t].contains_key(&uuid) {
                    return Err(error("duplicate uuid", uuid.to_string()));
                }
                let mut data = tc.default_row();
                Self::apply_row(tc, &mut data, op.get("row"), true)?;
                db[t].insert(uuid, data);
                Ok(json!({"uuid": ["uuid", uuid.to_string()]}))
            },
            "update" => {
                let uuids = Self::matching_rows(tc, &db[t], op.get("where"))?;
                for uuid in &uuids {
                    if let Some(data) = db[t].get_mut(uuid) {
                        Self::apply_row(tc, data, op.get("row"), false)?;
                    }
                }
                Ok(json!({"count": uuids.len()}))
            },
            "delete" => {
                let uuids = Self::matching_rows(tc, &db[t], op.get("where"))?;
                for uuid in &uuids {
                    db[t].remove(uuid);
                }
                Ok(json!({"count": uuids.len()}))
            },
            "mutate" => {
                let uuids = Self::matching_rows(tc, &db[t], op.get("where"))?;
                let mutations = op.get("mutations").and_then(Value::as_array).cloned().unwrap_or_default();
                for uuid in &uuids {
                    if let Some(data) = db[t].get_mut(uuid) {
                        for mutation in &mutations {
                            Self::mutate(tc, data, mutation)?;
                        }
                    }
                }
                Ok(json!({"count": uuids.len()}))
            },
            "select" => {
                let uuids = Self::matching_rows(tc, &db[t], op.get("where"))?;
                let names: Vec<String> = match op.get("columns").and_then(Value::as_array) {
                    Some(names) => names.iter().filter_map(Value::as_str).map(String::from).collect(),
                    None => std::iter::once("_uuid".to_string())
                        .chain(tc.columns.iter().map(|c| c.name.clone())).collect(),
                };
                let rows: Vec<Value> = uuids.iter()
                    .filter_map(|uuid| db[t].get(uuid).map(|data| (uuid, data)))
                    .map(|(uuid, data)| {
                        let mut row = Map::new();
                        for name in &names {
                            if name == "_uuid" {
                                row.insert(name.clone(), json!(["uuid", uuid.to_string()]));
                            } else if let Some(c) = tc.column_index(name) {
                                row.insert(name.clone(), data[c].to_json());
                            }
                        }
                        Value::Object(row)
                    })
                    .collect();
                Ok(json!({"rows": rows}))
            },
            "wait" => {
                let uuids = Self::matching_rows(tc, &db[t], op.get("where"))?;
                let columns: Vec<usize> = op.get("columns").and_then(Value::as_array)
                    .map(|names| names.iter().filter_map(|n| n.as_str().and_then(|n| tc.column_index(n))).collect())
                    .unwrap_or_default();
                let actual: BTreeSet<Vec<Datum>> = uuids.iter()
                    .filter_map(|uuid| db[t].get(uuid))
                    .map(|data| columns.iter().map(|&c| data[c].clone()).collect())
                    .collect();
                let mut expected = BTreeSet::new();
                for row in op.get("rows").and_then(Value::as_array).cloned().unwrap_or_default() {
                    let mut values = Vec::new();
                    for &c in &columns {
                        let type_ = &tc.columns[c].type_;
                        values.push(match row.get(&tc.columns[c].name) {
                            Some(json) => Datum::from_json(type_, json).map_err(|e| error("syntax error", e.to_string()))?,
                            None => type_.default_datum(),
                        });
                    }
                    expected.insert(values);
                }
                let want_equal = op.get("until").and_then(Value::as_str) != Some("!=");
                if (actual == expected) == want_equal {
                    Ok(json!({}))
                } else {
                    Err(error("timed out", "\"wait\" timed out".into()))
                }
            },
            "comment" => {
                if let Some(comment) = op.get("comment").and_then(Value::as_str) {
                    self.comments.push(comment.into());
                }
                Ok(json!({}))
            },
            "abort" => Err(json!({"error": "aborted"})),
            "assert" => {
                let name = op.get("lock").and_then(Value::as_str).unwrap_or("");
                let owner = self.locks.get(name).and_then(|queue| queue.front().copied());
                if session.is_some() && owner == session {
                    Ok(json!({}))
                } else {
                    Err(error("not owner", format!("lock {} not owned", name)))
                }
            },
            _ => Err(error("unknown operation", op_name.into())),
        }
    }

    /// Deletes unreferenced rows in non-root tables and dangling weak references, then checks
    /// that every strong reference resolves.
    fn check_integrity(&self, db: &mut Vec<Rows>) -> Result<(), Value> {
        let class = &self.class;
        loop {
            let mut referenced = BTreeSet::new();
            for (t, rows) in db.iter().enumerate() {
                for (uuid, data) in rows {
                    for_each_ref(class, t, data, |dst, ref_type, dst_uuid| {
                        if ref_type == RefType::Strong && dst_uuid != uuid {
                            referenced.insert((dst, *dst_uuid));
                        }
                    });
                }
            }
            let before: usize = db.iter().map(BTreeMap::len).sum();
            for (t, rows) in db.iter_mut().enumerate() {
                if !class.tables[t].is_root {
                    rows.retain(|uuid, _| referenced.contains(&(t, *uuid)));
                }
            }
            if db.iter().map(BTreeMap::len).sum::<usize>() == before {
                break;
            }
        }

        let snapshot = db.clone();
        for (t, rows) in db.iter_mut().enumerate() {
            for data in rows.values_mut() {
                for (column, datum) in class.tables[t].columns.iter().zip(data.iter_mut()) {
                    let value_type = column.type_.value.as_ref();
                    match datum {
                        Datum::Set(set) => set.retain(|a| !is_dangling(class, &snapshot, &column.type_.key, a)),
                        Datum::Map(map) => map.retain(|k, v| {
                            !is_dangling(class, &snapshot, &column.type_.key, k)
                                && !value_type.map_or(false, |vt| is_dangling(class, &snapshot, vt, v))
                        }),
                    }
                }
            }
        }

        for (t, rows) in db.iter().enumerate() {
            for data in rows.values() {
                let mut dangling = None;
                for_each_ref(class, t, data, |dst, ref_type, uuid| {
                    if ref_type == RefType::Strong && !db[dst].contains_key(uuid) {
                        dangling = Some(*uuid);
                    }
                });
                if let Some(uuid) = dangling {
                    return Err(error("referential integrity violation",
                                     format!("reference to nonexistent row {}", uuid)));
                }
            }
        }
        Ok(())
    }

    fn transact(&mut self, session: Option<usize>, params: &Value) -> Value {
        let params = params.as_array().cloned().unwrap_or_default();
        let n_ops = params.len().saturating_sub(1);
        if params.get(0).and_then(Value::as_str) != Some(self.class.database.as_str()) {
            return json!([error("unknown database", "no such database".into())]);
        }

        let mut named = BTreeMap::new();
        for op in &params[1..] {
            if op.get("op").and_then(Value::as_str) == Some("insert") && op.get("uuid").is_none() {
                if let Some(name) = op.get("uuid-name").and_then(Value::as_str) {
                    named.insert(name.to_string(), Uuid::new_v4());
                }
            }
        }
        let ops: Vec<Value> = params[1..].iter().map(|op| resolve_named_uuids(op.clone(), &named)).collect();

        let failure = self.failure.take();
        let mut db = self.db.clone();
        let mut results = Vec::new();
        let mut failed = false;
        for (i, op) in ops.iter().enumerate() {
            if let Some((index, kind)) = &failure {
                if *index == i {
                    results.push(error(kind, "injected failure".into()));
                    failed = true;
                    break;
                }
            }
            match self.execute(session, &mut db, &named, op) {
                Ok(result) => results.push(result),
                Err(error) => {
                    results.push(error);
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            results.resize(n_ops, Value::Null);
            return Value::Array(results);
        }
        if let Err(error) = self.check_integrity(&mut db) {
            results.push(error);
            return Value::Array(results);
        }

        let old = std::mem::replace(&mut self.db, db);
        self.notify(&old);
        Value::Array(results)
    }

    /// Tells every monitor about the differences between `old` and the current database.
    fn notify(&mut self, old: &[Rows]) {
        let ServerState { class, db, sessions, .. } = self;
        for session in sessions.iter_mut() {
            for monitor in &session.monitors {
                let mut updates = Map::new();
                for (&t, mt) in &monitor.tables {
                    let tc = &class.tables[t];
                    let uuids: BTreeSet<&Uuid> = old[t].keys().chain(db[t].keys()).collect();
                    let mut table_updates = Map::new();
                    for uuid in uuids {
                        let before = old[t].get(uuid).filter(|data| row_matches(tc, &mt.condition, uuid, data));
                        let after = db[t].get(uuid).filter(|data| row_matches(tc, &mt.condition, uuid, data));
                        let update = match (before, after) {
                            (None, None) => continue,
                            (None, Some(new)) if monitor.update2 => json!({"insert": row_json(tc, new, &mt.columns, true)}),
                            (None, Some(new)) => json!({"new": row_json(tc, new, &mt.columns, false)}),
                            (Some(_), None) if monitor.update2 => json!({"delete": null}),
                            (Some(old), None) => json!({"old": row_json(tc, old, &mt.columns, false)}),
                            (Some(old), Some(new)) => {
                                let changed: Vec<usize> = mt.columns.iter().copied()
                                    .filter(|&c| old[c] != new[c])
                                    .collect();
                                if changed.is_empty() {
                                    continue;
                                }
                                if monitor.update2 {
                                    let mut diff = Map::new();
                                    for &c in &changed {
                                        let type_ = &tc.columns[c].type_;
                                        diff.insert(tc.columns[c].name.clone(), Datum::diff(&old[c], &new[c], type_).to_json());
                                    }
                                    json!({"modify": diff})
                                } else {
                                    json!({"old": row_json(tc, old, &changed, false),
                                           "new": row_json(tc, new, &mt.columns, false)})
                                }
                            },
                        };
                        table_updates.insert(uuid.to_string(), update);
                    }
                    if !table_updates.is_empty() {
                        updates.insert(tc.name.clone(), Value::Object(table_updates));
                    }
                }
                if !updates.is_empty() {
                    let method = if monitor.update2 { "update2" } else { "update" };
                    session.inbox.push_back(Message::notify(method, json!([monitor.id, updates])));
                }
            }
        }
    }
}

/// An in-memory database server.  Clones share the same server.
#[derive(Clone)]
pub struct TestServer(Rc<RefCell<ServerState>>);

/// A client's connection to a [`TestServer`].
pub struct TestSession {
    server: Rc<RefCell<ServerState>>,
    index: usize,
}

impl JsonrpcSession for TestSession {
    fn run(&mut self) {}

    fn recv(&mut self) -> Option<Message> {
        self.server.borrow_mut().sessions[self.index].inbox.pop_front()
    }

    fn send(&mut self, msg: Message) -> Result<()> {
        self.server.borrow_mut().receive(self.index, msg);
        Ok(())
    }

    fn seqno(&self) -> u32 {
        self.server.borrow().sessions[self.index].seqno
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn force_reconnect(&mut self) {
        self.server.borrow_mut().disconnect(self.index);
    }

    fn name(&self) -> String {
        format!("test:{}", self.index)
    }
}

impl TestServer {
    /// Creates an empty database with the tables and columns in `class`.
    pub fn new(class: &IdlClass) -> TestServer {
        TestServer(Rc::new(RefCell::new(ServerState {
            class: class.clone(),
            db: vec![BTreeMap::new(); class.tables.len()],
            sessions: Vec::new(),
            locks: BTreeMap::new(),
            monitor_cond: true,
            deferred: false,
            pending: Vec::new(),
            requests: BTreeMap::new(),
            failure: None,
            comments: Vec::new(),
        })))
    }

    pub fn connect(&self) -> TestSession {
        let mut state = self.0.borrow_mut();
        state.sessions.push(SessionState { seqno: 1, inbox: VecDeque::new(), monitors: Vec::new() });
        TestSession { server: self.0.clone(), index: state.sessions.len() - 1 }
    }

    /// Creates an IDL for the server's whole schema, connected to the server.
    pub fn idl(&self, monitor_everything: bool) -> Idl {
        let class = self.0.borrow().class.clone();
        Idl::with_session(Box::new(self.connect()), class, monitor_everything)
    }

    /// Executes `ops` as a transaction from a client without a monitor.  Returns the results.
    pub fn transact(&self, ops: Value) -> Value {
        let mut state = self.0.borrow_mut();
        let mut params = vec![json!(state.class.database)];
        params.extend(ops.as_array().cloned().unwrap_or_default());
        state.transact(None, &Value::Array(params))
    }

    pub fn row_count(&self, table: &str) -> usize {
        let state = self.0.borrow();
        state.class.table_index(table).map_or(0, |t| state.db[t].len())
    }

    /// Returns the rows of `table`, with columns by name and the row's UUID as `_uuid`.
    pub fn rows(&self, table: &str) -> Vec<BTreeMap<String, Datum>> {
        let state = self.0.borrow();
        let t = match state.class.table_index(table) {
            Some(t) => t,
            None => return Vec::new(),
        };
        let tc = &state.class.tables[t];
        state.db[t].iter()
            .map(|(uuid, data)| {
                let mut row: BTreeMap<String, Datum> = tc.columns.iter()
                    .map(|c| c.name.clone())
                    .zip(data.iter().cloned())
                    .collect();
                row.insert("_uuid".into(), Datum::scalar(*uuid));
                row
            })
            .collect()
    }

    pub fn get(&self, table: &str, uuid: &Uuid, column: &str) -> Option<Datum> {
        let state = self.0.borrow();
        let t = state.class.table_index(table)?;
        let c = state.class.tables[t].column_index(column)?;
        state.db[t].get(uuid).map(|data| data[c].clone())
    }

    /// Makes operation `op_index` of the next transaction fail with `error`.
    pub fn fail_next_transact(&self, op_index: usize, error: &str) {
        self.0.borrow_mut().failure = Some((op_index, error.into()));
    }

    /// Drops every connection.  Clients reconnect right away and start over.
    pub fn disconnect_all(&self) {
        let mut state = self.0.borrow_mut();
        for session in 0..state.sessions.len() {
            state.disconnect(session);
        }
    }

    /// Makes the server reject `monitor_cond`, like servers that predate it.
    pub fn set_monitor_cond_supported(&self, supported: bool) {
        self.0.borrow_mut().monitor_cond = supported;
    }

    /// While `deferred`, requests are held until [`TestServer::process_deferred`].
    pub fn set_deferred(&self, deferred: bool) {
        self.0.borrow_mut().deferred = deferred;
    }

    pub fn process_deferred(&self) {
        let mut state = self.0.borrow_mut();
        for (session, msg) in std::mem::take(&mut state.pending) {
            state.handle(session, msg);
        }
    }

    /// Returns the number of `method` requests received so far.
    pub fn request_count(&self, method: &str) -> usize {
        self.0.borrow().requests.get(method).copied().unwrap_or(0)
    }

    pub fn comments(&self) -> Vec<String> {
        self.0.borrow().comments.clone()
    }
}
