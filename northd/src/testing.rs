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

//! Helpers for tests that run rebuild steps against in-memory Northbound and Southbound
//! servers.

use anyhow::Result;
use ovn::nb::nb_class;
use ovn::sb::sb_class;
use ovsdb_client::testing::TestServer;
use serde_json::Value;

use crate::context::NorthdContext;
use crate::datapath::{build_datapaths, Datapaths};
use crate::port::{build_ports, Ports};

pub struct TestServers {
    pub nb: TestServer,
    pub sb: TestServer,
}

impl TestServers {
    /// Creates a pair of servers with `nb_ops` already executed in the Northbound database.
    pub fn new(nb_ops: Value) -> TestServers {
        let servers = TestServers {
            nb: TestServer::new(&nb_class()),
            sb: TestServer::new(&sb_class()),
        };
        servers.nb.transact(nb_ops);
        servers
    }
}

/// Runs `f` in a context over fresh replicas of `servers`, then commits whatever it wrote
/// to either database.
pub fn with_context<T, F>(servers: &TestServers, f: F) -> Result<T>
where F: FnOnce(&mut NorthdContext) -> Result<T>
{
    let mut nb_idl = servers.nb.idl(true);
    let mut sb_idl = servers.sb.idl(true);
    nb_idl.run();
    sb_idl.run();

    let mut nb_txn = nb_idl.txn_create();
    let mut sb_txn = sb_idl.txn_create();
    let result = {
        let mut ctx = NorthdContext::new(&mut nb_txn, &mut sb_txn);
        f(&mut ctx)?
    };
    nb_txn.commit();
    sb_txn.commit();
    nb_idl.run();
    sb_idl.run();
    Ok(result)
}

/// Builds the datapaths and ports for a Northbound database populated by `nb_ops`.
pub fn build_topology(nb_ops: Value) -> Result<(Datapaths, Ports)> {
    with_context(&TestServers::new(nb_ops), |ctx| {
        let mut datapaths = build_datapaths(ctx)?;
        let ports = build_ports(ctx, &mut datapaths)?;
        Ok((datapaths, ports))
    })
}
