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

//! Database, table, and column classes.
//!
//! An [`IdlClass`] describes the part of a database schema that an IDL replicates.  Classes are
//! usually written out by hand by the crate that owns the database (see `ovn::nb` and
//! `ovn::sb`), but they can also be read from a `get_schema` reply with [`parse_schema`].

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use std::collections::BTreeMap;
use std::error;
use std::fmt;

use crate::datum::{Atom, Datum};

#[derive(Debug)]
pub struct SchemaError(pub String);

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "error parsing database schema: {}", self.0)
    }
}

impl error::Error for SchemaError {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AtomicType {
    Integer,
    Real,
    Boolean,
    String,
    Uuid,
}

impl AtomicType {
    pub fn name(&self) -> &'static str {
        match self {
            AtomicType::Integer => "integer",
            AtomicType::Real => "real",
            AtomicType::Boolean => "boolean",
            AtomicType::String => "string",
            AtomicType::Uuid => "uuid",
        }
    }

    pub fn from_name(name: &str) -> Option<AtomicType> {
        match name {
            "integer" => Some(AtomicType::Integer),
            "real" => Some(AtomicType::Real),
            "boolean" => Some(AtomicType::Boolean),
            "string" => Some(AtomicType::String),
            "uuid" => Some(AtomicType::Uuid),
            _ => None,
        }
    }
}

impl fmt::Display for AtomicType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Strength of a reference from one table to another.
///
/// The database deletes weak references to rows that go away.  Strong references keep
/// non-root rows alive and must always point to existing rows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefType {
    Strong,
    Weak,
}

/// The type of the keys or the values of a column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseType {
    pub atomic: AtomicType,
    /// For a `uuid` base type, the table whose rows it refers to.
    pub ref_table: Option<String>,
    pub ref_type: RefType,
}

impl BaseType {
    pub fn new(atomic: AtomicType) -> BaseType {
        BaseType { atomic, ref_table: None, ref_type: RefType::Strong }
    }

    pub fn reference(table: &str, ref_type: RefType) -> BaseType {
        BaseType { atomic: AtomicType::Uuid, ref_table: Some(table.into()), ref_type }
    }

    fn to_json(&self) -> Value {
        match &self.ref_table {
            None => json!(self.atomic.name()),
            Some(table) => {
                let mut base = json!({"type": "uuid", "refTable": table});
                if self.ref_type == RefType::Weak {
                    base["refType"] = json!("weak");
                }
                base
            }
        }
    }

    fn from_json(json: &Value) -> Result<BaseType> {
        match json {
            Value::String(name) => match AtomicType::from_name(name) {
                Some(atomic) => Ok(BaseType::new(atomic)),
                None => Err(SchemaError(format!("unknown atomic type \"{}\"", name)))?
            },
            Value::Object(base) => {
                let atomic = match base.get("type").and_then(Value::as_str).and_then(AtomicType::from_name) {
                    Some(atomic) => atomic,
                    None => Err(SchemaError(format!("bad base type {}", json)))?
                };
                let ref_table = base.get("refTable").and_then(Value::as_str).map(String::from);
                let ref_type = match base.get("refType").and_then(Value::as_str) {
                    Some("weak") => RefType::Weak,
                    _ => RefType::Strong,
                };
                Ok(BaseType { atomic, ref_table, ref_type })
            },
            _ => Err(SchemaError(format!("bad base type {}", json)))?
        }
    }
}

/// The type of a column: the key type, an optional value type for maps, and the minimum and
/// maximum number of elements.  `max` is `None` for "unlimited".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnType {
    pub key: BaseType,
    pub value: Option<BaseType>,
    pub min: usize,
    pub max: Option<usize>,
}

impl ColumnType {
    /// Exactly one value of `atomic` type.
    pub fn scalar(atomic: AtomicType) -> ColumnType {
        ColumnType { key: BaseType::new(atomic), value: None, min: 1, max: Some(1) }
    }

    /// Zero or one value of `atomic` type.
    pub fn optional(atomic: AtomicType) -> ColumnType {
        ColumnType { key: BaseType::new(atomic), value: None, min: 0, max: Some(1) }
    }

    pub fn set(atomic: AtomicType) -> ColumnType {
        ColumnType { key: BaseType::new(atomic), value: None, min: 0, max: None }
    }

    pub fn map(key: AtomicType, value: AtomicType) -> ColumnType {
        ColumnType {
            key: BaseType::new(key),
            value: Some(BaseType::new(value)),
            min: 0,
            max: None
        }
    }

    /// Turns the key type into a reference to `table`.
    pub fn references(mut self, table: &str, ref_type: RefType) -> ColumnType {
        self.key = BaseType::reference(table, ref_type);
        self
    }

    /// Turns the value type of a map into a reference to `table`.
    pub fn value_references(mut self, table: &str, ref_type: RefType) -> ColumnType {
        if let Some(value) = &mut self.value {
            *value = BaseType::reference(table, ref_type);
        }
        self
    }

    pub fn is_map(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_scalar(&self) -> bool {
        self.min == 1 && self.max == Some(1) && self.value.is_none()
    }

    pub fn is_optional_scalar(&self) -> bool {
        self.min == 0 && self.max == Some(1) && self.value.is_none()
    }

    /// The value that a column of this type takes in a newly inserted row.
    pub fn default_datum(&self) -> Datum {
        match &self.value {
            Some(value) if self.min > 0 => {
                Datum::map(vec![(Atom::default_for(self.key.atomic),
                                 Atom::default_for(value.atomic))])
            },
            Some(_) => Datum::empty_map(),
            None if self.min > 0 => Datum::scalar(Atom::default_for(self.key.atomic)),
            None => Datum::empty_set(),
        }
    }

    pub fn to_json(&self) -> Value {
        if self.is_scalar() && self.key.ref_table.is_none() {
            return self.key.to_json();
        }
        let mut type_ = Map::new();
        type_.insert("key".into(), self.key.to_json());
        if let Some(value) = &self.value {
            type_.insert("value".into(), value.to_json());
        }
        type_.insert("min".into(), json!(self.min));
        type_.insert("max".into(), match self.max {
            Some(max) => json!(max),
            None => json!("unlimited"),
        });
        Value::Object(type_)
    }

    pub fn from_json(json: &Value) -> Result<ColumnType> {
        let type_ = match json {
            Value::String(_) => return Ok(ColumnType {
                key: BaseType::from_json(json)?, value: None, min: 1, max: Some(1)
            }),
            Value::Object(type_) => type_,
            _ => Err(SchemaError(format!("bad column type {}", json)))?
        };
        let key = match type_.get("key") {
            Some(key) => BaseType::from_json(key)?,
            None => Err(SchemaError(format!("column type {} lacks \"key\"", json)))?
        };
        let value = match type_.get("value") {
            Some(value) => Some(BaseType::from_json(value)?),
            None => None,
        };
        let min = type_.get("min").and_then(Value::as_u64).unwrap_or(1) as usize;
        let max = match type_.get("max") {
            None => Some(1),
            Some(Value::String(s)) if s == "unlimited" => None,
            Some(max) => match max.as_u64() {
                Some(max) => Some(max as usize),
                None => Err(SchemaError(format!("bad \"max\" in column type {}", json)))?
            }
        };
        Ok(ColumnType { key, value, min, max })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnClass {
    pub name: String,
    pub type_: ColumnType,
    pub mutable: bool,
}

impl ColumnClass {
    pub fn new(name: &str, type_: ColumnType) -> ColumnClass {
        ColumnClass { name: name.into(), type_, mutable: true }
    }

    /// Marks the column as one that can only be set when its row is inserted.
    pub fn immutable(mut self) -> ColumnClass {
        self.mutable = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableClass {
    pub name: String,
    /// Rows in a root table persist on their own.  Rows in other tables are garbage collected by
    /// the database once nothing refers to them.
    pub is_root: bool,
    pub columns: Vec<ColumnClass>,
}

impl TableClass {
    pub fn new(name: &str, is_root: bool, columns: Vec<ColumnClass>) -> TableClass {
        TableClass { name: name.into(), is_root, columns }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnClass> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn default_row(&self) -> Vec<Datum> {
        self.columns.iter().map(|c| c.type_.default_datum()).collect()
    }
}

/// The tables of one database that an IDL replicates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdlClass {
    pub database: String,
    pub tables: Vec<TableClass>,
}

impl IdlClass {
    pub fn new(database: &str, tables: Vec<TableClass>) -> IdlClass {
        IdlClass { database: database.into(), tables }
    }

    pub fn table_index(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.name == name)
    }

    pub fn table(&self, name: &str) -> Option<&TableClass> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Renders the class as an OVSDB schema, the form that a server returns for `get_schema`.
    pub fn to_schema_json(&self) -> Value {
        let mut tables = Map::new();
        for table in &self.tables {
            let mut columns = Map::new();
            for column in &table.columns {
                let mut c = json!({"type": column.type_.to_json()});
                if !column.mutable {
                    c["mutable"] = json!(false);
                }
                columns.insert(column.name.clone(), c);
            }
            tables.insert(table.name.clone(), json!({"columns": columns, "isRoot": table.is_root}));
        }
        json!({"name": self.database, "version": "1.0.0", "tables": tables})
    }
}

#[derive(Deserialize)]
struct SchemaJson {
    name: String,
    tables: BTreeMap<String, TableJson>,
}

#[derive(Deserialize)]
struct TableJson {
    columns: BTreeMap<String, ColumnJson>,
    #[serde(rename = "isRoot", default)]
    is_root: bool,
}

#[derive(Deserialize)]
struct ColumnJson {
    #[serde(rename = "type")]
    type_: Value,
    #[serde(default = "default_mutable")]
    mutable: bool,
}

fn default_mutable() -> bool { true }

/// Parses `json`, a database schema in the format of RFC 7047, into an [`IdlClass`] that
/// covers every table and column in it.
pub fn parse_schema(json: &Value) -> Result<IdlClass> {
    let schema: SchemaJson = match serde_json::from_value(json.clone()) {
        Ok(schema) => schema,
        Err(e) => Err(SchemaError(e.to_string()))?
    };
    let mut tables = Vec::new();
    for (name, table) in schema.tables {
        let mut columns = Vec::new();
        for (column_name, column) in table.columns {
            let type_ = ColumnType::from_json(&column.type_)?;
            columns.push(ColumnClass { name: column_name, type_, mutable: column.mutable });
        }
        tables.push(TableClass { name, is_root: table.is_root, columns });
    }
    Ok(IdlClass { database: schema.name, tables })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class() -> IdlClass {
        IdlClass::new("Test", vec![
            TableClass::new("Parent", true, vec![
                ColumnClass::new("name", ColumnType::scalar(AtomicType::String)).immutable(),
                ColumnClass::new("children", ColumnType::set(AtomicType::Uuid)
                                 .references("Child", RefType::Strong)),
                ColumnClass::new("options", ColumnType::map(AtomicType::String, AtomicType::String)),
            ]),
            TableClass::new("Child", false, vec![
                ColumnClass::new("tag", ColumnType::optional(AtomicType::Integer)),
                ColumnClass::new("parent", ColumnType::optional(AtomicType::Uuid)
                                 .references("Parent", RefType::Weak)),
            ]),
        ])
    }

    #[test]
    fn schema_json_parses_back() -> Result<()> {
        let class = class();
        let parsed = parse_schema(&class.to_schema_json())?;
        assert_eq!(parsed.database, "Test");
        for table in &class.tables {
            let other = parsed.table(&table.name).unwrap();
            assert_eq!(other.is_root, table.is_root);
            for column in &table.columns {
                assert_eq!(other.column(&column.name), Some(column));
            }
        }
        Ok(())
    }

    #[test]
    fn default_datums() {
        let class = class();
        let parent = class.table("Parent").unwrap();
        assert_eq!(parent.default_row(),
                   vec![Datum::scalar(Atom::String("".into())), Datum::empty_set(), Datum::empty_map()]);
        assert!(parent.columns[0].type_.is_scalar());
        assert!(class.table("Child").unwrap().columns[0].type_.is_optional_scalar());
    }

    #[test]
    fn bad_schema() {
        assert!(parse_schema(&json!({"name": "x"})).is_err());
        let bad_type = json!({"name": "x", "tables": {"T": {"columns": {"c": {"type": "blob"}}}}});
        assert!(parse_schema(&bad_type).is_err());
    }
}
