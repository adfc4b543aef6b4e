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

//! Logical datapaths: one per logical switch and per enabled logical router, each bound to
//! a Southbound `Datapath_Binding`.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Index, IndexMut};

use anyhow::Result;
use ovn::nb::{LogicalRouter, LogicalSwitch};
use ovn::sb::DatapathBinding;
use ovn::FromRow;
use ovsdb_client::Datum;
use tracing::{event, info, Level};
use uuid::Uuid;

use crate::context::NorthdContext;
use crate::ipam::{init_ipam_info_for_datapath, IpamInfo};
use crate::stage::DatapathType;
use crate::tnlid::{allocate_tnlid, MAX_DP_TUNNEL_KEY};

#[derive(Clone, Debug)]
pub struct OvnDatapath {
    /// The Northbound uuid of the switch or router.
    pub key: Uuid,
    pub nbs: Option<LogicalSwitch>,
    pub nbr: Option<LogicalRouter>,

    /// The `Datapath_Binding`, once there is one.
    pub sb: Uuid,
    pub tunnel_key: u32,

    pub port_tnlids: BTreeSet<u32>,
    pub port_key_hint: u32,

    /// For a switch, its ports of type "router" that have a peer.
    pub router_ports: Vec<usize>,

    /// True if a port on the switch has "unknown" among its addresses.
    pub has_unknown: bool,

    /// The distributed gateway port of a router and its chassisredirect port.
    pub l3dgw_port: Option<usize>,
    pub l3redirect_port: Option<usize>,

    pub ipam: Option<IpamInfo>,
}

impl OvnDatapath {
    fn new(key: Uuid, nbs: Option<LogicalSwitch>, nbr: Option<LogicalRouter>,
           sb: Option<&DatapathBinding>) -> OvnDatapath {
        let ipam = nbs.as_ref().and_then(|nbs| init_ipam_info_for_datapath(&nbs.other_config));
        OvnDatapath {
            key,
            nbs,
            nbr,
            sb: sb.map_or_else(Uuid::nil, |sb| sb.uuid),
            tunnel_key: sb.map_or(0, |sb| sb.tunnel_key as u32),
            port_tnlids: BTreeSet::new(),
            port_key_hint: 0,
            router_ports: Vec::new(),
            has_unknown: false,
            l3dgw_port: None,
            l3redirect_port: None,
            ipam,
        }
    }

    pub fn dp_type(&self) -> DatapathType {
        if self.nbs.is_some() {
            DatapathType::Switch
        } else {
            DatapathType::Router
        }
    }

    pub fn name(&self) -> &str {
        match (&self.nbs, &self.nbr) {
            (Some(nbs), _) => &nbs.name,
            (None, Some(nbr)) => &nbr.name,
            (None, None) => "",
        }
    }

    /// The router's `options:chassis`, which makes it a gateway router bound to that
    /// chassis.
    pub fn gateway_chassis(&self) -> Option<&str> {
        self.nbr.as_ref()
            .and_then(|nbr| nbr.options.get("chassis"))
            .map(String::as_str)
    }
}

/// The logical datapaths of one rebuild, indexed by position.
#[derive(Clone, Debug, Default)]
pub struct Datapaths {
    list: Vec<OvnDatapath>,
    by_key: BTreeMap<Uuid, usize>,
}

impl Datapaths {
    fn push(&mut self, od: OvnDatapath) -> usize {
        let index = self.list.len();
        self.by_key.insert(od.key, index);
        self.list.push(od);
        index
    }

    pub fn find(&self, key: &Uuid) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    /// Finds the datapath bound to `Datapath_Binding` row `sb`.
    pub fn find_by_sb(&self, sb: &Uuid) -> Option<usize> {
        self.list.iter().position(|od| od.sb == *sb)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OvnDatapath> {
        self.list.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, OvnDatapath> {
        self.list.iter_mut()
    }

    fn retain<F: FnMut(&OvnDatapath) -> bool>(&mut self, f: F) {
        self.list.retain(f);
        self.by_key = self.list.iter().enumerate().map(|(i, od)| (od.key, i)).collect();
    }
}

impl Index<usize> for Datapaths {
    type Output = OvnDatapath;

    fn index(&self, index: usize) -> &OvnDatapath {
        &self.list[index]
    }
}

impl IndexMut<usize> for Datapaths {
    fn index_mut(&mut self, index: usize) -> &mut OvnDatapath {
        &mut self.list[index]
    }
}

/// The result of matching Northbound switches and routers against Southbound datapath
/// bindings.
pub struct JoinedDatapaths {
    pub datapaths: Datapaths,
    /// Datapaths with no binding yet.
    pub nb_only: Vec<usize>,
    /// Datapaths with a binding.
    pub both: Vec<usize>,
    /// Bindings for switches and routers that no longer exist.
    pub sb_only: Vec<DatapathBinding>,
}

/// The Northbound uuid that a `Datapath_Binding` belongs to.
fn datapath_binding_key(sb: &DatapathBinding) -> Option<Uuid> {
    sb.external_ids.get("logical-switch")
        .or_else(|| sb.external_ids.get("logical-router"))
        .and_then(|key| key.parse().ok())
}

pub fn join_datapaths(ctx: &mut NorthdContext) -> Result<JoinedDatapaths> {
    let mut sb_only: BTreeMap<Uuid, DatapathBinding> = BTreeMap::new();
    for sb in DatapathBinding::read_all(ctx.sb_idl()) {
        let key = match datapath_binding_key(&sb) {
            Some(key) => key,
            None => {
                ctx.sb.add_comment(&format!("deleting Datapath_Binding {} that lacks \
                                             external-ids:logical-switch and \
                                             external-ids:logical-router", sb.uuid));
                ctx.sb.delete("Datapath_Binding", &sb.uuid)?;
                continue;
            }
        };
        if sb_only.contains_key(&key) {
            info!("deleting Datapath_Binding {} with duplicate \
                   external-ids:logical-switch/router {}", sb.uuid, key);
            ctx.sb.delete("Datapath_Binding", &sb.uuid)?;
            continue;
        }
        sb_only.insert(key, sb);
    }

    let mut datapaths = Datapaths::default();
    let mut nb_only = Vec::new();
    let mut both = Vec::new();
    for nbs in LogicalSwitch::read_all(ctx.nb_idl()) {
        let sb = sb_only.remove(&nbs.uuid);
        let index = datapaths.push(OvnDatapath::new(nbs.uuid, Some(nbs), None, sb.as_ref()));
        match sb {
            Some(_) => both.push(index),
            None => nb_only.push(index),
        }
    }

    for nbr in LogicalRouter::read_all(ctx.nb_idl()) {
        if !nbr.is_enabled() {
            continue;
        }
        if datapaths.find(&nbr.uuid).is_some() {
            event!(Level::WARN, "duplicate UUID {} in OVN_Northbound", nbr.uuid);
            continue;
        }
        let sb = sb_only.remove(&nbr.uuid);
        let index = datapaths.push(OvnDatapath::new(nbr.uuid, None, Some(nbr), sb.as_ref()));
        match sb {
            Some(_) => both.push(index),
            None => nb_only.push(index),
        }
    }

    Ok(JoinedDatapaths {
        datapaths,
        nb_only,
        both,
        sb_only: sb_only.into_values().collect(),
    })
}

/// Makes the `Datapath_Binding` table contain one row per logical switch and enabled
/// logical router, and returns the datapaths.
pub fn build_datapaths(ctx: &mut NorthdContext) -> Result<Datapaths> {
    let JoinedDatapaths { mut datapaths, nb_only, both, sb_only } = join_datapaths(ctx)?;

    if !nb_only.is_empty() {
        for &index in &both {
            ctx.dp_tnlids.insert(datapaths[index].tunnel_key);
        }

        for &index in &nb_only {
            let tunnel_key = allocate_tnlid(&mut ctx.dp_tnlids, "datapath", MAX_DP_TUNNEL_KEY,
                                            &mut ctx.dp_key_hint);
            if tunnel_key == 0 {
                break;
            }

            let od = &mut datapaths[index];
            let kind = match od.dp_type() {
                DatapathType::Switch => "logical-switch",
                DatapathType::Router => "logical-router",
            };
            let mut external_ids = vec![(kind, od.key.to_string())];
            if !od.name().is_empty() {
                external_ids.push(("name", od.name().to_string()));
            }

            let uuid = ctx.sb.insert("Datapath_Binding", None)?;
            ctx.sb.write("Datapath_Binding", &uuid, "external_ids", Datum::map(external_ids))?;
            ctx.sb.write("Datapath_Binding", &uuid, "tunnel_key", Datum::scalar(tunnel_key as i64))?;
            od.sb = uuid;
            od.tunnel_key = tunnel_key;
        }
    }

    for sb in &sb_only {
        ctx.sb.delete("Datapath_Binding", &sb.uuid)?;
    }

    // A datapath for which no tunnel key was left cannot be used.
    datapaths.retain(|od| !od.sb.is_nil());
    Ok(datapaths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovn::nb::nb_class;
    use ovn::sb::sb_class;
    use ovsdb_client::testing::TestServer;
    use serde_json::json;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn join_and_build() -> Result<()> {
        let nb_server = TestServer::new(&nb_class());
        let sb_server = TestServer::new(&sb_class());
        let r = nb_server.transact(json!([
            {"op": "insert", "table": "Logical_Switch", "row": {"name": "sw0"}},
            {"op": "insert", "table": "Logical_Switch", "row": {"name": "sw1"}},
            {"op": "insert", "table": "Logical_Router", "row": {"name": "lr0", "enabled": false}},
        ]));
        let sw0 = r[0]["uuid"][1].as_str().unwrap().to_string();
        sb_server.transact(json!([
            {"op": "insert", "table": "Datapath_Binding",
             "row": {"tunnel_key": 1, "external_ids": ["map", [["logical-switch", sw0.as_str()]]]}},
            {"op": "insert", "table": "Datapath_Binding",
             "row": {"tunnel_key": 7, "external_ids": ["map", [["logical-switch", sw0.as_str()]]]}},
            {"op": "insert", "table": "Datapath_Binding", "row": {"tunnel_key": 3}},
        ]));

        let mut nb_idl = nb_server.idl(true);
        let mut sb_idl = sb_server.idl(true);
        nb_idl.run();
        sb_idl.run();

        let mut nb_txn = nb_idl.txn_create();
        let mut sb_txn = sb_idl.txn_create();
        let keys = {
            let mut ctx = NorthdContext::new(&mut nb_txn, &mut sb_txn);
            let datapaths = build_datapaths(&mut ctx)?;
            assert_eq!(datapaths.len(), 2);
            datapaths.iter().map(|od| od.tunnel_key).collect::<BTreeSet<_>>()
        };
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&1) || keys.contains(&7));
        assert!(logs_contain("with duplicate external-ids:logical-switch/router"));

        sb_txn.commit();
        nb_txn.abort();
        sb_idl.run();
        assert_eq!(sb_server.row_count("Datapath_Binding"), 2);
        let names: BTreeSet<String> = sb_server.rows("Datapath_Binding").iter()
            .filter_map(|row| row["external_ids"].map_str("name").map(String::from))
            .collect();
        assert!(names.contains("sw1"));
        assert!(sb_server.comments().iter().any(|c| c.contains("lacks external-ids:logical-switch")));
        Ok(())
    }
}
