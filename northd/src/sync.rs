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

//! Writing a rebuild's results to the Southbound database, and carrying status from the
//! Southbound database back to the Northbound database.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use anyhow::Result;
use ovn::actions::Pipeline;
use ovn::dhcp::{DhcpOptType, SUPPORTED_DHCPV6_OPTS, SUPPORTED_DHCP_OPTS};
use ovn::nb::{AddressSet, LogicalSwitchPort, NbGlobal};
use ovn::sb::{Chassis, LogicalFlow, MulticastGroup, PortBinding, SbAddressSet, SbDhcpOptions, SbDhcpv6Options};
use ovn::FromRow;
use ovsdb_client::{Datum, Txn};
use tracing::debug;
use uuid::Uuid;

use crate::context::NorthdContext;
use crate::datapath::Datapaths;
use crate::port::Ports;
use crate::router::build_lrouter_flows;
use crate::stage::{Lflow, LflowTable, Stage};
use crate::switch::build_lswitch_flows;

/// A multicast group that every logical switch may have.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct McGroup {
    pub name: &'static str,
    pub key: i64,
}

/// All of the logical switch's enabled ports.
pub const MC_FLOOD: McGroup = McGroup { name: "_MC_flood", key: 65535 };

/// The logical switch's ports with "unknown" among their addresses.
pub const MC_UNKNOWN: McGroup = McGroup { name: "_MC_unknown", key: 65534 };

/// Members of the multicast groups of each datapath, as indexes into [`Ports`].
#[derive(Clone, Debug, Default)]
pub struct McGroups(BTreeMap<(usize, McGroup), Vec<usize>>);

impl McGroups {
    pub fn add(&mut self, group: &McGroup, od: usize, port: usize) {
        self.0.entry((od, *group)).or_default().push(port);
    }

    pub fn ports(&self, group: &McGroup, od: usize) -> &[usize] {
        self.0.get(&(od, *group)).map_or(&[], Vec::as_slice)
    }

    fn take(&mut self, od: usize, name: &str, key: i64) -> Option<Vec<usize>> {
        let k = *self.0.keys().find(|(o, g)| *o == od && g.name == name && g.key == key)?;
        self.0.remove(&k)
    }
}

fn port_uuids(ports: &Ports, members: &[usize]) -> Datum {
    Datum::set(members.iter().filter_map(|&i| ports[i].sb))
}

fn sync_logical_flows(ctx: &mut NorthdContext, datapaths: &Datapaths, mut lflows: LflowTable) -> Result<()> {
    let by_sb: BTreeMap<Uuid, usize> = datapaths.iter().enumerate().map(|(i, od)| (od.sb, i)).collect();

    // Keep the Southbound flows that are still wanted and delete the rest.  What is left in
    // `lflows` afterward is new.
    let mut n_deleted = 0;
    for sbflow in LogicalFlow::read_all(ctx.sb_idl()) {
        let od = sbflow.logical_datapath.and_then(|sb| by_sb.get(&sb)).map(|&i| &datapaths[i]);
        let lflow = od.and_then(|od| {
            let pipeline = if sbflow.pipeline == "ingress" { Pipeline::Ingress } else { Pipeline::Egress };
            Some(Lflow {
                datapath: od.key,
                stage: Stage::lookup(od.dp_type(), pipeline, sbflow.table_id)?,
                priority: u16::try_from(sbflow.priority).ok()?,
                match_: sbflow.match_.clone(),
                actions: sbflow.actions.clone(),
            })
        });
        match lflow {
            Some(lflow) if lflows.remove(&lflow) => (),
            _ => {
                ctx.sb.delete("Logical_Flow", &sbflow.uuid)?;
                n_deleted += 1;
            }
        }
    }

    let mut n_inserted = 0;
    for (lflow, source) in lflows.iter() {
        let od = match datapaths.find(&lflow.datapath) {
            Some(i) => &datapaths[i],
            None => continue,
        };
        let uuid = ctx.sb.insert("Logical_Flow", None)?;
        ctx.sb.write("Logical_Flow", &uuid, "logical_datapath", Datum::scalar(od.sb))?;
        ctx.sb.write("Logical_Flow", &uuid, "pipeline", Datum::scalar(lflow.stage.pipeline().name()))?;
        ctx.sb.write("Logical_Flow", &uuid, "table_id", Datum::scalar(i64::from(lflow.stage.table())))?;
        ctx.sb.write("Logical_Flow", &uuid, "priority", Datum::scalar(i64::from(lflow.priority)))?;
        ctx.sb.write("Logical_Flow", &uuid, "match", Datum::scalar(lflow.match_.as_str()))?;
        ctx.sb.write("Logical_Flow", &uuid, "actions", Datum::scalar(lflow.actions.as_str()))?;
        ctx.sb.write("Logical_Flow", &uuid, "external_ids",
                     Datum::map(vec![("stage-name", lflow.stage.name().to_string()), ("source", source)]))?;
        n_inserted += 1;
    }
    debug!("logical flows: {} deleted, {} inserted", n_deleted, n_inserted);
    Ok(())
}

fn sync_multicast_groups(ctx: &mut NorthdContext, datapaths: &Datapaths, ports: &Ports,
                         mut mcgroups: McGroups) -> Result<()> {
    for sbmc in MulticastGroup::read_all(ctx.sb_idl()) {
        let members = sbmc.datapath
            .and_then(|sb| datapaths.find_by_sb(&sb))
            .and_then(|od| mcgroups.take(od, &sbmc.name, sbmc.tunnel_key));
        match members {
            Some(members) => ctx.sb.write("Multicast_Group", &sbmc.uuid, "ports", port_uuids(ports, &members))?,
            None => ctx.sb.delete("Multicast_Group", &sbmc.uuid)?,
        }
    }

    for ((od, group), members) in &mcgroups.0 {
        let uuid = ctx.sb.insert("Multicast_Group", None)?;
        ctx.sb.write("Multicast_Group", &uuid, "datapath", Datum::scalar(datapaths[*od].sb))?;
        ctx.sb.write("Multicast_Group", &uuid, "name", Datum::scalar(group.name))?;
        ctx.sb.write("Multicast_Group", &uuid, "tunnel_key", Datum::scalar(group.key))?;
        ctx.sb.write("Multicast_Group", &uuid, "ports", port_uuids(ports, members))?;
    }
    Ok(())
}

/// Computes the logical flows and multicast groups for `datapaths` and `ports` and makes the
/// Southbound Logical_Flow and Multicast_Group tables match them.
pub fn build_lflows(ctx: &mut NorthdContext, datapaths: &mut Datapaths, ports: &Ports) -> Result<()> {
    let mut lflows = LflowTable::new();
    let mut mcgroups = McGroups::default();
    build_lswitch_flows(datapaths, ports, &mut lflows, &mut mcgroups);
    build_lrouter_flows(datapaths, ports, &mut lflows);

    sync_logical_flows(ctx, datapaths, lflows)?;
    sync_multicast_groups(ctx, datapaths, ports, mcgroups)
}

/// Copies the Northbound Address_Set table to the Southbound database, matching rows by name.
pub fn sync_address_sets(ctx: &mut NorthdContext) -> Result<()> {
    let mut sb_sets: BTreeMap<String, SbAddressSet> = SbAddressSet::read_all(ctx.sb_idl())
        .into_iter()
        .map(|set| (set.name.clone(), set))
        .collect();

    for nb_set in AddressSet::read_all(ctx.nb_idl()) {
        let uuid = match sb_sets.remove(&nb_set.name) {
            Some(sb_set) => sb_set.uuid,
            None => {
                let uuid = ctx.sb.insert("Address_Set", None)?;
                ctx.sb.write("Address_Set", &uuid, "name", Datum::scalar(nb_set.name.as_str()))?;
                uuid
            }
        };
        ctx.sb.write("Address_Set", &uuid, "addresses", Datum::set(nb_set.addresses.iter().map(String::as_str)))?;
    }

    for sb_set in sb_sets.values() {
        ctx.sb.delete("Address_Set", &sb_set.uuid)?;
    }
    Ok(())
}

fn sync_supported_dhcp_opts(sb: &mut Txn, table: &str, existing: Vec<(Uuid, String)>,
                            supported: &[(&'static str, u16, DhcpOptType)]) -> Result<()> {
    let mut missing: BTreeMap<&str, (u16, DhcpOptType)> = supported.iter()
        .map(|&(name, code, type_)| (name, (code, type_)))
        .collect();
    for (uuid, name) in existing {
        if missing.remove(name.as_str()).is_none() {
            // Unsupported, or a duplicate of a row already seen.
            sb.delete(table, &uuid)?;
        }
    }

    for (name, (code, type_)) in missing {
        let uuid = sb.insert(table, None)?;
        sb.write(table, &uuid, "name", Datum::scalar(name))?;
        sb.write(table, &uuid, "code", Datum::scalar(i64::from(code)))?;
        sb.write(table, &uuid, "type", Datum::scalar(type_.name()))?;
    }
    Ok(())
}

/// Makes the Southbound DHCP_Options and DHCPv6_Options tables list exactly the supported
/// options, for ovn-controller to interpret `put_dhcp_opts` and `put_dhcpv6_opts` actions.
pub fn sync_dhcp_options(ctx: &mut NorthdContext) -> Result<()> {
    let v4 = SbDhcpOptions::read_all(ctx.sb_idl()).into_iter().map(|o| (o.0.uuid, o.0.name)).collect();
    sync_supported_dhcp_opts(ctx.sb, "DHCP_Options", v4, SUPPORTED_DHCP_OPTS)?;

    let v6 = SbDhcpv6Options::read_all(ctx.sb_idl()).into_iter().map(|o| (o.0.uuid, o.0.name)).collect();
    sync_supported_dhcp_opts(ctx.sb, "DHCPv6_Options", v6, SUPPORTED_DHCPV6_OPTS)
}

/// Sets `up` on each Northbound logical switch port according to whether its Southbound
/// binding has a chassis.
pub fn update_logical_port_status(ctx: &mut NorthdContext) -> Result<()> {
    let nbsps: BTreeMap<String, LogicalSwitchPort> = LogicalSwitchPort::read_all(ctx.nb_idl())
        .into_iter()
        .map(|nbsp| (nbsp.name.clone(), nbsp))
        .collect();

    for binding in PortBinding::read_all(ctx.sb_idl()) {
        let nbsp = match nbsps.get(&binding.logical_port) {
            Some(nbsp) => nbsp,
            None => continue,
        };
        let up = binding.chassis.is_some();
        if nbsp.up != Some(up) {
            debug!("logical switch port {} is now {}", nbsp.name, if up { "up" } else { "down" });
            ctx.nb.write("Logical_Switch_Port", &nbsp.uuid, "up", Datum::scalar(up))?;
        }
    }
    Ok(())
}

/// Reports progress back to the Northbound database: `sb_cfg` is the `nb_cfg` that the
/// Southbound database has caught up with, and `hv_cfg` is the lowest that every chassis
/// has caught up with.  `sb_cur_cfg` of 0 means that no Southbound transaction has finished
/// yet.
pub fn update_northbound_cfg(ctx: &mut NorthdContext, sb_cur_cfg: i64) -> Result<()> {
    let nbg = match NbGlobal::read_all(ctx.nb_idl()).into_iter().next() {
        Some(nbg) => nbg,
        None => return Ok(()),
    };

    if sb_cur_cfg != 0 && nbg.sb_cfg != sb_cur_cfg {
        ctx.nb.write("NB_Global", &nbg.uuid, "sb_cfg", Datum::scalar(sb_cur_cfg))?;
    }

    let hv_cfg = Chassis::read_all(ctx.sb_idl()).iter().map(|chassis| chassis.nb_cfg).fold(nbg.nb_cfg, i64::min);
    if nbg.hv_cfg != hv_cfg {
        ctx.nb.write("NB_Global", &nbg.uuid, "hv_cfg", Datum::scalar(hv_cfg))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::build_datapaths;
    use crate::port::build_ports;
    use crate::testing::{with_context, TestServers};
    use serde_json::json;
    use std::collections::BTreeSet;
    use tracing_test::traced_test;

    fn rebuild(servers: &TestServers) -> Result<()> {
        with_context(servers, |ctx| {
            let mut datapaths = build_datapaths(ctx)?;
            let ports = build_ports(ctx, &mut datapaths)?;
            build_lflows(ctx, &mut datapaths, &ports)
        })
    }

    #[traced_test]
    #[test]
    fn logical_flows() -> Result<()> {
        let servers = TestServers::new(json!([]));
        let r = servers.nb.transact(json!([
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm1",
             "row": {"name": "vm1", "addresses": "00:00:00:00:00:01 10.0.0.2"}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm2",
             "row": {"name": "vm2", "addresses": "unknown"}},
            {"op": "insert", "table": "Logical_Switch", "row": {"name": "sw0",
             "ports": ["set", [["named-uuid", "vm1"], ["named-uuid", "vm2"]]]}},
        ]));
        servers.sb.transact(json!([
            {"op": "insert", "table": "Logical_Flow",
             "row": {"pipeline": "ingress", "table_id": 0, "priority": 100, "match": "1", "actions": "drop;"}},
            {"op": "insert", "table": "Multicast_Group",
             "row": {"name": "_MC_flood", "tunnel_key": 65535}},
        ]));

        rebuild(&servers)?;
        let flows = servers.sb.rows("Logical_Flow");
        assert!(!flows.is_empty());
        assert!(flows.iter().all(|row| !row["logical_datapath"].is_empty()));
        let l2 = flows.iter()
            .find(|row| row["match"].as_str() == Some("eth.dst == 00:00:00:00:00:01"))
            .unwrap();
        assert_eq!(l2["pipeline"].as_str(), Some("ingress"));
        assert_eq!(l2["table_id"].as_integer(), Some(i64::from(Stage::LsInL2Lkup.table())));
        assert_eq!(l2["priority"].as_integer(), Some(50));
        assert_eq!(l2["actions"].as_str(), Some("outport = \"vm1\"; output;"));
        assert_eq!(l2["external_ids"].map_str("stage-name"), Some("ls_in_l2_lkup"));
        assert!(l2["external_ids"].map_str("source").unwrap().starts_with("switch.rs:"));

        let groups = servers.sb.rows("Multicast_Group");
        assert_eq!(groups.len(), 2);
        let group = |name: &str| groups.iter().find(|row| row["name"].as_str() == Some(name)).unwrap();
        assert_eq!(group("_MC_flood")["tunnel_key"].as_integer(), Some(65535));
        assert_eq!(group("_MC_flood")["ports"].len(), 2);
        assert_eq!(group("_MC_unknown")["tunnel_key"].as_integer(), Some(65534));
        assert_eq!(group("_MC_unknown")["ports"].len(), 1);

        // Nothing changed, so a second rebuild has nothing to write.
        let n_flows = flows.len();
        let n_transacts = servers.sb.request_count("transact");
        rebuild(&servers)?;
        assert_eq!(servers.sb.request_count("transact"), n_transacts);
        assert_eq!(servers.sb.row_count("Logical_Flow"), n_flows);

        // Removing a port removes its flows.
        let vm1 = r[0]["uuid"][1].as_str().unwrap();
        servers.nb.transact(json!([
            {"op": "mutate", "table": "Logical_Switch", "where": [],
             "mutations": [["ports", "delete", ["uuid", vm1]]]},
        ]));
        rebuild(&servers)?;
        assert!(servers.sb.rows("Logical_Flow").iter()
                .all(|row| !row["match"].as_str().unwrap_or_default().contains("00:00:00:00:00:01")));
        Ok(())
    }

    #[test]
    fn mcgroups() {
        let mut mcgroups = McGroups::default();
        mcgroups.add(&MC_FLOOD, 0, 1);
        mcgroups.add(&MC_FLOOD, 0, 2);
        mcgroups.add(&MC_UNKNOWN, 1, 3);
        assert_eq!(mcgroups.ports(&MC_FLOOD, 0), &[1, 2]);
        assert!(mcgroups.ports(&MC_FLOOD, 1).is_empty());

        assert_eq!(mcgroups.take(1, "_MC_unknown", 65535), None);
        assert_eq!(mcgroups.take(1, "_MC_unknown", 65534), Some(vec![3]));
        assert_eq!(mcgroups.take(1, "_MC_unknown", 65534), None);
    }

    #[test]
    fn address_sets() -> Result<()> {
        let servers = TestServers::new(json!([
            {"op": "insert", "table": "Address_Set",
             "row": {"name": "as1", "addresses": ["set", ["10.0.0.1", "10.0.0.2"]]}},
            {"op": "insert", "table": "Address_Set", "row": {"name": "as2", "addresses": "10.0.0.3"}},
        ]));
        servers.sb.transact(json!([
            {"op": "insert", "table": "Address_Set", "row": {"name": "as2", "addresses": "10.0.0.9"}},
            {"op": "insert", "table": "Address_Set", "row": {"name": "stale"}},
        ]));

        with_context(&servers, sync_address_sets)?;
        let sets: BTreeMap<String, Vec<String>> = servers.sb.rows("Address_Set").iter()
            .map(|row| (row["name"].as_str().unwrap_or_default().to_string(), row["addresses"].strings()))
            .collect();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets["as1"], vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(sets["as2"], vec!["10.0.0.3"]);
        Ok(())
    }

    #[test]
    fn dhcp_options() -> Result<()> {
        let servers = TestServers::new(json!([]));
        servers.sb.transact(json!([
            {"op": "insert", "table": "DHCP_Options", "row": {"name": "router", "code": 3, "type": "ipv4"}},
            {"op": "insert", "table": "DHCP_Options", "row": {"name": "router", "code": 3, "type": "ipv4"}},
            {"op": "insert", "table": "DHCP_Options", "row": {"name": "bogus", "code": 250, "type": "str"}},
        ]));

        with_context(&servers, sync_dhcp_options)?;
        let names: BTreeSet<String> = servers.sb.rows("DHCP_Options").iter()
            .filter_map(|row| row["name"].as_str().map(String::from))
            .collect();
        assert_eq!(servers.sb.row_count("DHCP_Options"), SUPPORTED_DHCP_OPTS.len());
        assert!(names.contains("router"));
        assert!(!names.contains("bogus"));
        assert_eq!(servers.sb.row_count("DHCPv6_Options"), SUPPORTED_DHCPV6_OPTS.len());

        let lease_time = servers.sb.rows("DHCP_Options").into_iter()
            .find(|row| row["name"].as_str() == Some("lease_time"))
            .unwrap();
        assert_eq!(lease_time["code"].as_integer(), Some(51));
        assert_eq!(lease_time["type"].as_str(), Some("uint32"));
        Ok(())
    }

    #[test]
    fn port_status() -> Result<()> {
        let servers = TestServers::new(json!([
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm1", "row": {"name": "vm1"}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm2",
             "row": {"name": "vm2", "up": true}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm3",
             "row": {"name": "vm3", "up": true}},
            {"op": "insert", "table": "Logical_Switch", "row": {"name": "sw0",
             "ports": ["set", [["named-uuid", "vm1"], ["named-uuid", "vm2"], ["named-uuid", "vm3"]]]}},
        ]));
        servers.sb.transact(json!([
            {"op": "insert", "table": "Chassis", "uuid-name": "hv1", "row": {"name": "hv1"}},
            {"op": "insert", "table": "Datapath_Binding", "uuid-name": "dp", "row": {"tunnel_key": 1}},
            {"op": "insert", "table": "Port_Binding",
             "row": {"logical_port": "vm1", "tunnel_key": 1, "datapath": ["named-uuid", "dp"],
                     "chassis": ["named-uuid", "hv1"]}},
            {"op": "insert", "table": "Port_Binding",
             "row": {"logical_port": "vm2", "tunnel_key": 2, "datapath": ["named-uuid", "dp"]}},
            {"op": "insert", "table": "Port_Binding",
             "row": {"logical_port": "vm3", "tunnel_key": 3, "datapath": ["named-uuid", "dp"],
                     "chassis": ["named-uuid", "hv1"]}},
        ]));
        assert_eq!(servers.sb.row_count("Port_Binding"), 3);

        with_context(&servers, update_logical_port_status)?;
        let up: BTreeMap<String, Option<bool>> = servers.nb.rows("Logical_Switch_Port").iter()
            .map(|row| (row["name"].as_str().unwrap_or_default().to_string(), row["up"].as_bool()))
            .collect();
        assert_eq!(up["vm1"], Some(true));
        assert_eq!(up["vm2"], Some(false));
        assert_eq!(up["vm3"], Some(true));
        Ok(())
    }

    #[test]
    fn northbound_cfg() -> Result<()> {
        let servers = TestServers::new(json!([
            {"op": "insert", "table": "NB_Global", "row": {"nb_cfg": 5}},
        ]));
        servers.sb.transact(json!([
            {"op": "insert", "table": "Chassis", "row": {"name": "hv1", "nb_cfg": 3}},
            {"op": "insert", "table": "Chassis", "row": {"name": "hv2", "nb_cfg": 7}},
        ]));

        with_context(&servers, |ctx| update_northbound_cfg(ctx, 0))?;
        let nbg = &servers.nb.rows("NB_Global")[0];
        assert_eq!(nbg["sb_cfg"].as_integer(), Some(0));
        assert_eq!(nbg["hv_cfg"].as_integer(), Some(3));

        with_context(&servers, |ctx| update_northbound_cfg(ctx, 4))?;
        let nbg = &servers.nb.rows("NB_Global")[0];
        assert_eq!(nbg["sb_cfg"].as_integer(), Some(4));
        Ok(())
    }
}
