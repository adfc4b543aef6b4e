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

//! Load-balancer group ids.
//!
//! A `ct_lb` action with backends becomes an OpenFlow "select" group.  Each distinct group
//! description gets its own id, and an id stays with its description as long as some flow
//! still uses it.

use tracing::{event, Level};

use std::collections::{BTreeMap, BTreeSet};

pub const MAX_OVN_GROUPS: u32 = 65535;

#[derive(Clone, Debug, Default)]
pub struct GroupTable {
    /// Groups that the flows being computed need, keyed by group description.
    pub desired: BTreeMap<String, u32>,
    /// Groups installed by the last [`GroupTable::commit`].
    pub existing: BTreeMap<String, u32>,
    /// Ids in use by either of the above.
    ids: BTreeSet<u32>,
}

impl GroupTable {
    pub fn new() -> GroupTable {
        GroupTable::default()
    }

    /// Returns the id for a group described by `group`, reusing the id of an identical
    /// desired or existing group, or otherwise allocating the lowest free id.  Returns `None`
    /// if all ids are in use.
    pub fn lookup_or_allocate(&mut self, group: &str) -> Option<u32> {
        if let Some(id) = self.desired.get(group) {
            return Some(*id);
        }
        let id = match self.existing.get(group) {
            Some(id) => *id,
            None => match (1..=MAX_OVN_GROUPS).find(|id| !self.ids.contains(id)) {
                Some(id) => id,
                None => {
                    event!(Level::ERROR, "out of group ids");
                    return None;
                }
            }
        };
        self.ids.insert(id);
        self.desired.insert(group.into(), id);
        Some(id)
    }

    /// Makes the desired groups the existing ones, releasing ids that only existing groups
    /// used.  Returns the groups to delete and the groups to add, by id.
    pub fn commit(&mut self) -> (Vec<(u32, String)>, Vec<(u32, String)>) {
        let deleted: Vec<(u32, String)> = self.existing.iter()
            .filter(|(group, _)| !self.desired.contains_key(*group))
            .map(|(group, id)| (*id, group.clone()))
            .collect();
        let added: Vec<(u32, String)> = self.desired.iter()
            .filter(|(group, _)| !self.existing.contains_key(*group))
            .map(|(group, id)| (*id, group.clone()))
            .collect();
        for (id, _) in &deleted {
            self.ids.remove(id);
        }
        self.existing = std::mem::take(&mut self.desired);
        (deleted, added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn reuse_and_release() {
        let mut gt = GroupTable::new();
        assert_eq!(gt.lookup_or_allocate("type=select,a"), Some(1));
        assert_eq!(gt.lookup_or_allocate("type=select,b"), Some(2));
        assert_eq!(gt.lookup_or_allocate("type=select,a"), Some(1));
        let (deleted, added) = gt.commit();
        assert!(deleted.is_empty());
        assert_eq!(added.len(), 2);

        // Next round only needs "b", which keeps its id, so "a" is released.
        assert_eq!(gt.lookup_or_allocate("type=select,b"), Some(2));
        let (deleted, added) = gt.commit();
        assert_eq!(deleted, vec![(1, "type=select,a".to_string())]);
        assert!(added.is_empty());
        assert_eq!(gt.lookup_or_allocate("type=select,c"), Some(1));
    }

    #[test]
    #[traced_test]
    fn exhaustion() {
        let mut gt = GroupTable::new();
        gt.ids = (2..=MAX_OVN_GROUPS).collect();
        assert_eq!(gt.lookup_or_allocate("last"), Some(1));
        assert_eq!(gt.lookup_or_allocate("one too many"), None);
        assert!(logs_contain("out of group ids"));
    }
}
