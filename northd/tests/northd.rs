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

use anyhow::Result;
use northd::{Northd, NORTHD_LOCK};
use ovn::nb::nb_class;
use ovn::sb::sb_class;
use ovsdb_client::testing::TestServer;
use serde_json::json;
use tracing_test::traced_test;

struct TestServers {
    nb: TestServer,
    sb: TestServer,
}

fn settle(northd: &mut Northd) -> Result<()> {
    for _ in 0..10 {
        northd.run_once()?;
    }
    Ok(())
}

fn topology() -> TestServers {
    let servers = TestServers { nb: TestServer::new(&nb_class()), sb: TestServer::new(&sb_class()) };
    servers.nb.transact(json!([
        {"op": "insert", "table": "NB_Global", "row": {"nb_cfg": 1}},
        {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm1",
         "row": {"name": "vm1", "addresses": "00:00:00:00:00:01 10.0.0.2"}},
        {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm2",
         "row": {"name": "vm2", "addresses": "dynamic"}},
        {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "rp",
         "row": {"name": "sw0-lr0", "type": "router", "addresses": "router",
                 "options": ["map", [["router-port", "lrp0"]]]}},
        {"op": "insert", "table": "Logical_Switch", "row": {"name": "sw0",
         "other_config": ["map", [["subnet", "10.0.0.0/24"]]],
         "ports": ["set", [["named-uuid", "vm1"], ["named-uuid", "vm2"], ["named-uuid", "rp"]]]}},
        {"op": "insert", "table": "Logical_Router_Port", "uuid-name": "lrp0",
         "row": {"name": "lrp0", "mac": "00:00:00:00:ff:01", "networks": "10.0.0.1/24"}},
        {"op": "insert", "table": "NAT", "uuid-name": "nat",
         "row": {"type": "snat", "external_ip": "203.0.113.1", "logical_ip": "10.0.0.0/24"}},
        {"op": "insert", "table": "Logical_Router", "row": {"name": "lr0",
         "ports": ["named-uuid", "lrp0"], "nat": ["named-uuid", "nat"],
         "options": ["map", [["chassis", "hv1"]]]}},
    ]));
    servers
}

#[traced_test]
#[test]
fn rebuild() -> Result<()> {
    let servers = topology();
    let mut northd = Northd::new(servers.nb.idl(true), servers.sb.idl(true))?;
    settle(&mut northd)?;
    assert!(logs_contain("ovn-northd lock acquired"));

    let keys: BTreeSet<i64> = servers.sb.rows("Datapath_Binding").iter()
        .filter_map(|row| row["tunnel_key"].as_integer())
        .collect();
    assert_eq!(keys.len(), 2);

    let bindings = servers.sb.rows("Port_Binding");
    assert_eq!(bindings.len(), 4);
    let port_keys: BTreeSet<(String, i64)> = bindings.iter()
        .map(|row| (row["datapath"].to_json().to_string(), row["tunnel_key"].as_integer().unwrap_or(0)))
        .collect();
    assert_eq!(port_keys.len(), 4);

    let flows = servers.sb.rows("Logical_Flow");
    let has_flow = |match_: &str, actions: &str| flows.iter().any(|row| {
        row["match"].as_str() == Some(match_) && row["actions"].as_str() == Some(actions)
    });
    assert!(has_flow("eth.dst == 00:00:00:00:00:01", "outport = \"vm1\"; output;"));
    assert!(has_flow("ip && ip4.src == 10.0.0.0/24", "ct_snat(203.0.113.1);"));

    let vm2 = servers.nb.rows("Logical_Switch_Port").into_iter()
        .find(|row| row["name"].as_str() == Some("vm2"))
        .unwrap();
    let dynamic = vm2["dynamic_addresses"].as_str().unwrap().to_string();
    let (mac, ip) = dynamic.split_once(' ').unwrap();
    assert!(mac.starts_with("0a:00:00:"));
    assert!(ip.starts_with("10.0.0."));
    assert!(ip != "10.0.0.1" && ip != "10.0.0.2");
    assert!(has_flow(&format!("eth.dst == {}", mac), "outport = \"vm2\"; output;"));

    assert_eq!(servers.sb.rows("SB_Global")[0]["nb_cfg"].as_integer(), Some(1));
    let nbg = &servers.nb.rows("NB_Global")[0];
    assert_eq!(nbg["sb_cfg"].as_integer(), Some(1));
    assert_eq!(nbg["hv_cfg"].as_integer(), Some(1));

    // Once everything is in place, further rebuilds write nothing.
    let transacts = (servers.nb.request_count("transact"), servers.sb.request_count("transact"));
    settle(&mut northd)?;
    assert_eq!((servers.nb.request_count("transact"), servers.sb.request_count("transact")), transacts);
    Ok(())
}

#[traced_test]
#[test]
fn standby() -> Result<()> {
    let servers = topology();
    let mut active = servers.sb.idl(true);
    active.set_lock(Some(NORTHD_LOCK));
    active.run();

    let mut northd = Northd::new(servers.nb.idl(true), servers.sb.idl(true))?;
    settle(&mut northd)?;
    assert!(!northd.sb.idl.has_lock());
    assert!(!logs_contain("ovn-northd lock acquired"));
    assert_eq!(servers.sb.request_count("transact"), 0);
    assert_eq!(servers.sb.row_count("Datapath_Binding"), 0);
    Ok(())
}

#[test]
fn nb_cfg_follows_northbound() -> Result<()> {
    let servers = topology();
    let mut northd = Northd::new(servers.nb.idl(true), servers.sb.idl(true))?;
    settle(&mut northd)?;

    servers.nb.transact(json!([
        {"op": "update", "table": "NB_Global", "where": [], "row": {"nb_cfg": 2}},
    ]));
    servers.sb.transact(json!([
        {"op": "insert", "table": "Chassis", "row": {"name": "hv1", "nb_cfg": 1}},
    ]));
    settle(&mut northd)?;
    assert_eq!(servers.sb.rows("SB_Global")[0]["nb_cfg"].as_integer(), Some(2));
    let nbg = &servers.nb.rows("NB_Global")[0];
    assert_eq!(nbg["sb_cfg"].as_integer(), Some(2));
    assert_eq!(nbg["hv_cfg"].as_integer(), Some(1));
    Ok(())
}
