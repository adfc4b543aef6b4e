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

use bitflags::bitflags;
use uuid::Uuid;

use std::collections::{BTreeMap, HashMap};

use crate::condition::Condition;
use crate::row::Row;

bitflags! {
    /// How the IDL treats a column.
    pub struct ColumnMode: u8 {
        /// Replicate the column.
        const MONITOR = 1 << 0;
        /// Changes to the column bump the IDL's change seqno.
        const ALERT = 1 << 1;
        /// Changes to the column are reported through `track_get`.
        const TRACK = 1 << 2;
    }
}

/// The replica of one table.
pub(crate) struct Table {
    pub modes: Vec<ColumnMode>,
    /// Replicate the table even if none of its columns are monitored.
    pub need_table: bool,
    pub rows: HashMap<Uuid, Row>,
    pub change_seqno: [u64; 3],
    pub condition: Condition,
    pub cond_changed: bool,
    /// Rows with tracked changes, oldest change first.
    pub track_list: Vec<Uuid>,
    /// Tracked rows that were deleted, kept readable until `track_clear`.
    pub deleted: BTreeMap<Uuid, Row>,
}

impl Table {
    pub fn new(n_columns: usize, default_mode: ColumnMode) -> Table {
        Table {
            modes: vec![default_mode; n_columns],
            need_table: false,
            rows: HashMap::new(),
            change_seqno: [0; 3],
            condition: Condition::always(),
            cond_changed: false,
            track_list: Vec::new(),
            deleted: BTreeMap::new(),
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.modes.iter().any(|m| m.contains(ColumnMode::TRACK))
    }

    /// Moves `uuid` to the back of the track list.
    pub fn track(&mut self, uuid: Uuid) {
        self.track_list.retain(|u| *u != uuid);
        self.track_list.push(uuid);
    }
}
