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

//! Tunnel key allocation for datapaths and ports.

use std::collections::BTreeSet;

use tracing::{event, Level};

/// Largest tunnel key of a logical datapath.
pub const MAX_DP_TUNNEL_KEY: u32 = (1 << 24) - 1;

/// Largest tunnel key of a logical port within its datapath.
pub const MAX_PORT_TUNNEL_KEY: u32 = (1 << 15) - 1;

/// Allocates the first key in `1..=max` that is not in `set`, probing upward from just
/// after `*hint` and wrapping around.  Records the key in `set` and in `*hint`.
///
/// Returns 0 if every key is taken.
pub fn allocate_tnlid(set: &mut BTreeSet<u32>, name: &str, max: u32, hint: &mut u32) -> u32 {
    for i in 0..max {
        let tnlid = ((*hint as u64 + i as u64) % max as u64) as u32 + 1;
        if set.insert(tnlid) {
            *hint = tnlid;
            return tnlid;
        }
    }

    event!(Level::WARN, "all {} tunnel ids exhausted", name);
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn probes_after_hint() {
        let mut set: BTreeSet<u32> = [1, 2, 5].iter().copied().collect();
        let mut hint = 1;
        assert_eq!(allocate_tnlid(&mut set, "port", 7, &mut hint), 3);
        assert_eq!(hint, 3);
        assert_eq!(allocate_tnlid(&mut set, "port", 7, &mut hint), 4);
        assert_eq!(allocate_tnlid(&mut set, "port", 7, &mut hint), 6);
        assert_eq!(allocate_tnlid(&mut set, "port", 7, &mut hint), 7);
    }

    #[test]
    fn wraps_at_max() {
        let mut set: BTreeSet<u32> = [3, 4].iter().copied().collect();
        let mut hint = 4;
        assert_eq!(allocate_tnlid(&mut set, "datapath", 4, &mut hint), 1);
        assert_eq!(allocate_tnlid(&mut set, "datapath", 4, &mut hint), 2);
    }

    #[traced_test]
    #[test]
    fn exhausted() {
        let mut set: BTreeSet<u32> = (1..=3).collect();
        let mut hint = 0;
        assert_eq!(allocate_tnlid(&mut set, "datapath", 3, &mut hint), 0);
        assert_eq!(hint, 0);
        assert!(logs_contain("all datapath tunnel ids exhausted"));
    }
}
