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

//! OVN library code shared by `ovn-northd` and the flow translation in `lflow`: addresses,
//! the logical action language, DHCP option tables, and typed views of the Northbound and
//! Southbound databases.

pub mod actions;
pub mod addresses;
pub mod dhcp;
pub mod fields;
pub mod group_table;
pub mod lex;
pub mod lflow;
pub mod nb;
pub mod sb;

use ovsdb_client::{Idl, RowRef};

/// An owned copy of one row of a database table, with its references followed.
pub trait FromRow: Sized {
    const TABLE: &'static str;

    fn from_row(row: &RowRef) -> Self;

    /// Reads every row of the table.
    fn read_all(idl: &Idl) -> Vec<Self> {
        idl.rows(Self::TABLE).iter().map(Self::from_row).collect()
    }
}
