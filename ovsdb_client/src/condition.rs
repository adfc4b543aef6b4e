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

//! Replication conditions for `monitor_cond`.

use anyhow::Result;
use serde_json::{json, Value};

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::datum::Datum;
use crate::schema::{AtomicType, ColumnType, TableClass};

#[derive(Debug)]
pub struct ConditionError(pub String);

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bad condition: {}", self.0)
    }
}

impl std::error::Error for ConditionError {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Function {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
    Includes,
    Excludes,
}

impl Function {
    pub fn as_str(&self) -> &'static str {
        match self {
            Function::Lt => "<",
            Function::Le => "<=",
            Function::Eq => "==",
            Function::Ne => "!=",
            Function::Ge => ">=",
            Function::Gt => ">",
            Function::Includes => "includes",
            Function::Excludes => "excludes",
        }
    }

    pub fn from_str(s: &str) -> Option<Function> {
        match s {
            "<" => Some(Function::Lt),
            "<=" => Some(Function::Le),
            "==" => Some(Function::Eq),
            "!=" => Some(Function::Ne),
            ">=" => Some(Function::Ge),
            ">" => Some(Function::Gt),
            "includes" => Some(Function::Includes),
            "excludes" => Some(Function::Excludes),
            _ => None,
        }
    }
}

/// One `<column> <function> <arg>` clause.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Clause {
    pub column: String,
    pub function: Function,
    pub arg: Datum,
}

impl Clause {
    pub fn new(column: &str, function: Function, arg: Datum) -> Clause {
        Clause { column: column.into(), function, arg }
    }

    pub fn to_json(&self) -> Value {
        json!([self.column, self.function.as_str(), self.arg.to_json()])
    }

    /// Evaluates the clause against `value`, the value of the clause's column in some row.
    pub fn evaluate(&self, value: &Datum) -> bool {
        let ordering = || match (value.first(), self.arg.first()) {
            (Some(a), Some(b)) => match (a.as_real(), b.as_real()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
            _ => None,
        };
        match self.function {
            Function::Eq => *value == self.arg,
            Function::Ne => *value != self.arg,
            Function::Includes => value.includes(&self.arg),
            Function::Excludes => value.excludes(&self.arg),
            Function::Lt => ordering() == Some(Ordering::Less),
            Function::Le => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
            Function::Gt => ordering() == Some(Ordering::Greater),
            Function::Ge => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

/// The set of rows of a table that a client wants replicated: those that satisfy at least one
/// clause, or every row if the condition is "true".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    clauses: BTreeSet<Clause>,
    is_true: bool,
}

impl Default for Condition {
    fn default() -> Condition {
        Condition::always()
    }
}

impl Condition {
    /// A condition with no clauses, which matches no rows.
    pub fn new() -> Condition {
        Condition { clauses: BTreeSet::new(), is_true: false }
    }

    /// A condition that matches every row.
    pub fn always() -> Condition {
        Condition { clauses: BTreeSet::new(), is_true: true }
    }

    /// Adds a clause.  This has no effect on a condition that is already true.
    pub fn add_clause(&mut self, clause: Clause) {
        if !self.is_true {
            self.clauses.insert(clause);
        }
    }

    /// Makes the condition true, which makes any other clauses irrelevant.
    pub fn add_clause_true(&mut self) {
        self.clauses.clear();
        self.is_true = true;
    }

    pub fn clear(&mut self) {
        self.clauses.clear();
        self.is_true = false;
    }

    pub fn is_true(&self) -> bool {
        self.is_true
    }

    pub fn clauses(&self) -> impl Iterator<Item = &Clause> {
        self.clauses.iter()
    }

    pub fn to_json(&self) -> Value {
        if self.is_true {
            json!([])
        } else if self.clauses.is_empty() {
            json!([false])
        } else {
            Value::Array(self.clauses.iter().map(Clause::to_json).collect())
        }
    }

    /// Parses a `where` condition for rows of `table`.
    pub fn from_json(json: &Value, table: &TableClass) -> Result<Condition> {
        let elems = match json.as_array() {
            Some(elems) => elems,
            None => Err(ConditionError(format!("{} is not an array", json)))?
        };
        if elems.is_empty() {
            return Ok(Condition::always());
        }
        let uuid_type = ColumnType::scalar(AtomicType::Uuid);
        let mut cond = Condition::new();
        for elem in elems {
            match elem {
                Value::Bool(true) => cond.add_clause_true(),
                Value::Bool(false) => (),
                Value::Array(clause) if clause.len() == 3 => {
                    let column = clause[0].as_str().unwrap_or("");
                    let type_ = match table.column(column) {
                        Some(c) => &c.type_,
                        None if column == "_uuid" => &uuid_type,
                        None => Err(ConditionError(format!("{} table has no column {}", table.name, column)))?
                    };
                    let function = match clause[1].as_str().and_then(Function::from_str) {
                        Some(function) => function,
                        None => Err(ConditionError(format!("unknown function {}", clause[1])))?
                    };
                    let arg = Datum::from_json_transient(type_, &clause[2])?;
                    cond.add_clause(Clause { column: column.into(), function, arg });
                },
                _ => Err(ConditionError(format!("bad clause {}", elem)))?
            }
        }
        Ok(cond)
    }

    /// Evaluates the condition against a row, where `column` returns the value of a named
    /// column in the row.
    pub fn evaluate<F>(&self, column: F) -> bool
    where F: Fn(&str) -> Option<Datum>
    {
        self.is_true || self.clauses.iter().any(|clause| match column(&clause.column) {
            Some(value) => clause.evaluate(&value),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnClass, ColumnType};

    #[test]
    fn condition_json() -> Result<()> {
        let mut cond = Condition::always();
        assert_eq!(cond.to_json(), json!([]));
        cond.add_clause(Clause::new("name", Function::Eq, Datum::scalar("x")));
        assert_eq!(cond.to_json(), json!([]));

        cond.clear();
        assert_eq!(cond.to_json(), json!([false]));
        cond.add_clause(Clause::new("name", Function::Eq, Datum::scalar("x")));
        cond.add_clause(Clause::new("name", Function::Eq, Datum::scalar("x")));
        assert_eq!(cond.to_json(), json!([["name", "==", "x"]]));

        let table = TableClass::new("T", true, vec![
            ColumnClass::new("name", ColumnType::scalar(AtomicType::String))
        ]);
        assert_eq!(Condition::from_json(&cond.to_json(), &table)?, cond);
        assert!(Condition::from_json(&json!([true]), &table)?.is_true());
        assert!(Condition::from_json(&json!([["nope", "==", 1]]), &table).is_err());
        Ok(())
    }

    #[test]
    fn evaluate() {
        let mut cond = Condition::new();
        cond.add_clause(Clause::new("n", Function::Gt, Datum::scalar(5i64)));
        cond.add_clause(Clause::new("tags", Function::Includes, Datum::scalar("blue")));
        let row = |n: i64, tags: Vec<&'static str>| {
            move |col: &str| match col {
                "n" => Some(Datum::scalar(n)),
                "tags" => Some(Datum::set(tags.clone())),
                _ => None,
            }
        };
        assert!(cond.evaluate(row(6, vec![])));
        assert!(cond.evaluate(row(1, vec!["blue", "red"])));
        assert!(!cond.evaluate(row(5, vec!["red"])));
        assert!(!Condition::new().evaluate(row(10, vec![])));
    }
}
