/*
Copyright (c) 2021 VMware, Inc.
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

//! OVSDB client library.
//!
//! Maintains an in-memory replica of selected tables and columns of an OVSDB database
//! ([`Idl`]), keeps it current through the monitor protocol, and writes to the database
//! through transactions ([`Txn`]).

pub mod condition;
pub mod datum;
pub mod idl;
pub mod idl_loop;
pub mod row;
pub mod schema;
mod table;
pub mod txn;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use condition::{Clause, Condition, Function};
pub use datum::{Atom, Datum};
pub use idl::{Idl, IdlError, IdlState};
pub use idl_loop::{CommitProgress, IdlLoop};
pub use row::{Change, RowRef};
pub use schema::{parse_schema, AtomicType, ColumnClass, ColumnType, IdlClass, RefType, TableClass};
pub use table::ColumnMode;
pub use txn::{Txn, TxnErrorKind, TxnHandle, TxnStatus};
