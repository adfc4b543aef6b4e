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

use std::collections::BTreeSet;

use ovsdb_client::{Idl, Txn};

use crate::ipam::Macam;
use crate::port::{ChassisQueues, TagAlloc};

/// State shared by the steps of one rebuild of the Southbound database from the
/// Northbound database.  A new context is created for every rebuild.
pub struct NorthdContext<'a, 'n, 's> {
    pub nb: &'a mut Txn<'n>,
    pub sb: &'a mut Txn<'s>,

    /// MAC addresses in use, for allocating dynamic addresses.
    pub macam: Macam,

    /// Tunnel keys in use by datapaths.
    pub dp_tnlids: BTreeSet<u32>,
    pub dp_key_hint: u32,

    /// VLAN tags in use by nested container ports, per parent port.
    pub tags: TagAlloc,

    /// Queue ids in use on each chassis.
    pub queues: ChassisQueues,
}

impl<'a, 'n, 's> NorthdContext<'a, 'n, 's> {
    pub fn new(nb: &'a mut Txn<'n>, sb: &'a mut Txn<'s>) -> Self {
        NorthdContext {
            nb,
            sb,
            macam: Macam::default(),
            dp_tnlids: BTreeSet::new(),
            dp_key_hint: 0,
            tags: TagAlloc::default(),
            queues: ChassisQueues::default(),
        }
    }

    /// The Northbound replica, including this rebuild's writes so far.
    pub fn nb_idl(&self) -> &Idl {
        &**self.nb
    }

    /// The Southbound replica, including this rebuild's writes so far.
    pub fn sb_idl(&self) -> &Idl {
        &**self.sb
    }
}
