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

//! Translation of Southbound `Logical_Flow` and `MAC_Binding` rows into OpenFlow flows.

use ovs::ofp_flow::Flow;
use ovs::ofpact::{MfField, Ofpact};
use ovsdb_client::Idl;
use tracing::{event, Level};
use uuid::Uuid;

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::actions::{encode_actions, parse_actions, EncodeParams, ParseParams, Pipeline};
use crate::addresses::EthAddr;
use crate::dhcp::{DhcpOptType, DhcpOpts};
use crate::fields::Symtab;
use crate::group_table::GroupTable;
use crate::sb::{DatapathBinding, LogicalFlow, MacBinding, MulticastGroup, PortBinding, SbDhcpOptions, SbDhcpv6Options};
use crate::FromRow;

/// OpenFlow table where the logical ingress pipeline begins.
pub const OFTABLE_LOG_INGRESS_PIPELINE: u8 = 16;
pub const OFTABLE_REMOTE_OUTPUT: u8 = 32;
/// OpenFlow table where the logical egress pipeline begins.
pub const OFTABLE_LOG_EGRESS_PIPELINE: u8 = 48;
pub const OFTABLE_SAVE_INPORT: u8 = 64;
pub const OFTABLE_MAC_BINDING: u8 = 66;

/// Number of logical tables in each pipeline.
pub const LOG_PIPELINE_LEN: u8 = 16;

/// The Southbound rows that flow translation reads.
#[derive(Clone, Debug, Default)]
pub struct LflowInput {
    pub datapaths: BTreeMap<Uuid, DatapathBinding>,
    pub ports: Vec<PortBinding>,
    pub mcgroups: Vec<MulticastGroup>,
    pub flows: Vec<LogicalFlow>,
    pub mac_bindings: Vec<MacBinding>,
    pub dhcp_opts: DhcpOpts,
    pub dhcpv6_opts: DhcpOpts,
}

impl LflowInput {
    pub fn read(idl: &Idl) -> LflowInput {
        let mut dhcp_opts = DhcpOpts::new();
        for SbDhcpOptions(o) in SbDhcpOptions::read_all(idl) {
            match DhcpOptType::from_name(&o.type_) {
                Some(type_) => dhcp_opts.insert(&o.name, o.code as u16, type_),
                None => event!(Level::WARN, "unknown DHCP option type {} for {}", o.type_, o.name),
            }
        }
        let mut dhcpv6_opts = DhcpOpts::new();
        for SbDhcpv6Options(o) in SbDhcpv6Options::read_all(idl) {
            match DhcpOptType::from_name(&o.type_) {
                Some(type_) => dhcpv6_opts.insert(&o.name, o.code as u16, type_),
                None => event!(Level::WARN, "unknown DHCPv6 option type {} for {}", o.type_, o.name),
            }
        }

        LflowInput {
            datapaths: DatapathBinding::read_all(idl).into_iter().map(|dp| (dp.uuid, dp)).collect(),
            ports: PortBinding::read_all(idl),
            mcgroups: MulticastGroup::read_all(idl),
            flows: LogicalFlow::read_all(idl),
            mac_bindings: MacBinding::read_all(idl),
            dhcp_opts,
            dhcpv6_opts,
        }
    }

    /// The tunnel key of the port or multicast group named `name` in `dp`.
    fn lookup_port(&self, dp: Uuid, name: &str) -> Option<u32> {
        self.ports.iter()
            .find(|pb| pb.logical_port == name && pb.datapath == Some(dp))
            .map(|pb| pb.tunnel_key)
            .or_else(|| self.mcgroups.iter()
                     .find(|mg| mg.name == name && mg.datapath == Some(dp))
                     .map(|mg| mg.tunnel_key))
            .map(|key| key as u32)
    }

    /// A router is a gateway router if it has an `l3gateway` port.
    fn is_gateway_router(&self, dp: Uuid) -> bool {
        self.ports.iter().any(|pb| pb.datapath == Some(dp) && pb.type_ == "l3gateway")
    }
}

fn is_switch(dp: &DatapathBinding) -> bool {
    dp.external_ids.contains_key("logical-switch")
}

/// The first 32 bits of a flow's UUID, which identify the logical flow that an OpenFlow
/// flow came from.
fn cookie(uuid: &Uuid) -> u64 {
    let b = uuid.as_bytes();
    u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64
}

fn consider_logical_flow(input: &LflowInput, symtab: &Symtab, lflow: &LogicalFlow,
                         group_table: &mut GroupTable, flows: &mut Vec<Flow>) {
    let dp = match lflow.logical_datapath.and_then(|uuid| input.datapaths.get(&uuid)) {
        Some(dp) => dp,
        None => return,
    };
    if lflow.table_id < 0 || lflow.table_id >= LOG_PIPELINE_LEN as i64 {
        event!(Level::WARN, "logical flow {} has bad table {}", lflow.uuid, lflow.table_id);
        return;
    }
    let table_id = lflow.table_id as u8;

    let (pipeline, first_ptable, output_ptable) = if lflow.pipeline == "ingress" {
        (Pipeline::Ingress, OFTABLE_LOG_INGRESS_PIPELINE, OFTABLE_REMOTE_OUTPUT)
    } else {
        (Pipeline::Egress, OFTABLE_LOG_EGRESS_PIPELINE, OFTABLE_SAVE_INPORT)
    };

    let pp = ParseParams {
        symtab,
        dhcp_opts: &input.dhcp_opts,
        dhcpv6_opts: &input.dhcpv6_opts,
        pipeline,
        n_tables: LOG_PIPELINE_LEN,
        cur_ltable: table_id,
    };
    let (actions, prereqs) = match parse_actions(&lflow.actions, &pp) {
        Ok(result) => result,
        Err(e) => {
            event!(Level::WARN, "error parsing actions \"{}\": {}", lflow.actions, e);
            return;
        },
    };

    let lookup_port = |name: &str| input.lookup_port(dp.uuid, name);
    let mut ep = EncodeParams {
        lookup_port: &lookup_port,
        is_switch: is_switch(dp),
        is_gateway_router: input.is_gateway_router(dp.uuid),
        group_table,
        pipeline,
        ingress_ptable: OFTABLE_LOG_INGRESS_PIPELINE,
        egress_ptable: OFTABLE_LOG_EGRESS_PIPELINE,
        output_ptable,
        mac_bind_ptable: OFTABLE_MAC_BINDING,
    };
    let ofpacts = encode_actions(&actions, &mut ep);

    let logical_match = match (lflow.match_.trim(), prereqs) {
        (m, Some(prereqs)) if m == "1" || m.is_empty() => prereqs,
        (m, Some(prereqs)) => format!("({}) && ({})", m, prereqs),
        (m, None) => m.to_string(),
    };
    let mut match_ = format!("metadata={:#x}", dp.tunnel_key);
    if logical_match != "1" && !logical_match.is_empty() {
        match_ += &format!(", {}", logical_match);
    }

    flows.push(Flow {
        table_id: first_ptable + table_id,
        priority: lflow.priority as u16,
        cookie: cookie(&lflow.uuid),
        match_,
        actions: ofpacts,
    });
}

fn consider_neighbor_flow(input: &LflowInput, b: &MacBinding, flows: &mut Vec<Flow>) {
    let pb = match input.ports.iter().find(|pb| pb.logical_port == b.logical_port) {
        Some(pb) => pb,
        None => return,
    };
    let dp_key = match pb.datapath.and_then(|uuid| input.datapaths.get(&uuid)) {
        Some(dp) => dp.tunnel_key,
        None => return,
    };

    let mac: EthAddr = match b.mac.parse() {
        Ok(mac) => mac,
        Err(_) => {
            event!(Level::WARN, "bad 'mac' {}", b.mac);
            return;
        },
    };

    let ip_match = if b.ip.contains('.') {
        match b.ip.parse::<Ipv4Addr>() {
            Ok(ip) => format!("reg0={:#x}", u32::from(ip)),
            Err(_) => {
                event!(Level::WARN, "bad 'ip' {}", b.ip);
                return;
            },
        }
    } else {
        match b.ip.parse::<Ipv6Addr>() {
            Ok(ip) => format!("xxreg0={:#x}", u128::from(ip)),
            Err(_) => {
                event!(Level::WARN, "bad 'ip' {}", b.ip);
                return;
            },
        }
    };

    flows.push(Flow {
        table_id: OFTABLE_MAC_BINDING,
        priority: 100,
        cookie: 0,
        match_: format!("metadata={:#x}, reg15={:#x}, {}", dp_key, pb.tunnel_key, ip_match),
        actions: vec![Ofpact::load(mac.to_u64() as u128, MfField::EthDst, 0, 48)],
    });
}

/// Adds a flow to the MAC binding table for each `MAC_Binding` row.
pub fn add_neighbor_flows(input: &LflowInput, flows: &mut Vec<Flow>) {
    for b in &input.mac_bindings {
        consider_neighbor_flow(input, b, flows);
    }
}

/// Translates the logical flows and MAC bindings in `input` into OpenFlow flows.  Load
/// balancer groups are allocated in `group_table`.
pub fn lflow_run(input: &LflowInput, group_table: &mut GroupTable) -> Vec<Flow> {
    let symtab = Symtab::ovn();
    let mut flows = Vec::new();
    for lflow in &input.flows {
        consider_logical_flow(input, &symtab, lflow, group_table, &mut flows);
    }
    add_neighbor_flows(input, &mut flows);
    flows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sb::sb_class;
    use ovs::ofpact::Ofpacts;
    use ovsdb_client::testing::TestServer;
    use serde_json::json;
    use tracing_test::traced_test;

    fn input() -> LflowInput {
        let server = TestServer::new(&sb_class());
        server.transact(json!([
            {"op": "insert", "table": "Datapath_Binding", "uuid-name": "ls",
             "row": {"tunnel_key": 1, "external_ids": ["map", [["logical-switch", "7c3f1ad8-0bd8-4f5e-9a57-5b3f0c0c1a01"]]]}},
            {"op": "insert", "table": "Datapath_Binding", "uuid-name": "lr",
             "row": {"tunnel_key": 2, "external_ids": ["map", [["logical-router", "0f6e6fb3-8f4b-4d06-a0f4-3a3a4e4c2b02"]]]}},
            {"op": "insert", "table": "Port_Binding",
             "row": {"logical_port": "P1", "datapath": ["named-uuid", "ls"], "tunnel_key": 5}},
            {"op": "insert", "table": "Port_Binding",
             "row": {"logical_port": "lrp0", "datapath": ["named-uuid", "lr"], "tunnel_key": 1}},
            {"op": "insert", "table": "Multicast_Group",
             "row": {"name": "_MC_flood", "datapath": ["named-uuid", "ls"], "tunnel_key": 65535}},
            {"op": "insert", "table": "Logical_Flow",
             "row": {"logical_datapath": ["named-uuid", "ls"], "pipeline": "ingress", "table_id": 13,
                     "priority": 50, "match": "eth.dst == aa:bb:cc:dd:ee:ff",
                     "actions": "outport = \"P1\"; output;"}},
            {"op": "insert", "table": "Logical_Flow",
             "row": {"logical_datapath": ["named-uuid", "ls"], "pipeline": "ingress", "table_id": 13,
                     "priority": 70, "match": "eth.mcast",
                     "actions": "outport = \"_MC_flood\"; output;"}},
            {"op": "insert", "table": "Logical_Flow",
             "row": {"logical_datapath": ["named-uuid", "lr"], "pipeline": "egress", "table_id": 1,
                     "priority": 25, "match": "ip && ip4.src == 10.0.0.0/24",
                     "actions": "ct_snat(203.0.113.1);"}},
            {"op": "insert", "table": "Logical_Flow",
             "row": {"logical_datapath": ["named-uuid", "ls"], "pipeline": "ingress", "table_id": 0,
                     "priority": 100, "match": "1", "actions": "bogus;"}},
            {"op": "insert", "table": "MAC_Binding",
             "row": {"logical_port": "lrp0", "ip": "192.168.0.7", "mac": "00:00:00:00:00:07",
                     "datapath": ["named-uuid", "lr"]}},
        ]));
        let mut idl = server.idl(true);
        idl.run();
        LflowInput::read(&idl)
    }

    fn find(flows: &[Flow], table_id: u8, priority: u16) -> &Flow {
        flows.iter().find(|f| f.table_id == table_id && f.priority == priority).unwrap()
    }

    #[traced_test]
    #[test]
    fn translate() {
        let input = input();
        let mut group_table = GroupTable::new();
        let flows = lflow_run(&input, &mut group_table);
        assert_eq!(flows.len(), 4);

        let l2 = find(&flows, 29, 50);
        assert_eq!(l2.match_, "metadata=0x1, eth.dst == aa:bb:cc:dd:ee:ff");
        assert_eq!(Ofpacts(&l2.actions).to_string(), "set_field:0x5->reg15,resubmit(,32)");
        let lflow = input.flows.iter().find(|f| f.priority == 50).unwrap();
        assert_eq!(l2.cookie, cookie(&lflow.uuid));

        let flood = find(&flows, 29, 70);
        assert_eq!(Ofpacts(&flood.actions).to_string(), "set_field:0xffff->reg15,resubmit(,32)");

        let snat = find(&flows, 49, 25);
        assert_eq!(snat.match_, "metadata=0x2, (ip && ip4.src == 10.0.0.0/24) && (ip)");
        assert_eq!(Ofpacts(&snat.actions).to_string(),
                   "ct(commit,table=50,zone=NXM_NX_REG12[0..15],nat(src=203.0.113.1))");

        let neighbor = find(&flows, OFTABLE_MAC_BINDING, 100);
        assert_eq!(neighbor.match_, "metadata=0x2, reg15=0x1, reg0=0xc0a80007");
        assert_eq!(Ofpacts(&neighbor.actions).to_string(), "set_field:00:00:00:00:00:07->eth_dst");

        assert!(logs_contain("error parsing actions \"bogus;\": Syntax error at `bogus' expecting action."));
    }

    #[test]
    fn cookie_is_uuid_prefix() {
        let uuid = Uuid::parse_str("12345678-9abc-def0-1234-56789abcdef0").unwrap();
        assert_eq!(cookie(&uuid), 0x1234_5678);
    }
}
