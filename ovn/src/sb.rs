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

//! The OVN Southbound database: the tables that `ovn-northd` writes and `lflow` reads.

use ovsdb_client::{AtomicType, ColumnClass, ColumnType, IdlClass, RefType, RowRef, TableClass};
use uuid::Uuid;

use std::collections::BTreeMap;

use crate::FromRow;

pub const DATABASE: &str = "OVN_Southbound";

fn string() -> ColumnType {
    ColumnType::scalar(AtomicType::String)
}

fn integer() -> ColumnType {
    ColumnType::scalar(AtomicType::Integer)
}

fn smap() -> ColumnType {
    ColumnType::map(AtomicType::String, AtomicType::String)
}

fn datapath() -> ColumnType {
    ColumnType::scalar(AtomicType::Uuid).references("Datapath_Binding", RefType::Strong)
}

fn dhcp_options_table(name: &str) -> TableClass {
    TableClass::new(name, true, vec![
        ColumnClass::new("name", string()),
        ColumnClass::new("code", integer()),
        ColumnClass::new("type", string()),
    ])
}

/// The subset of the Southbound schema that `ovn-northd` and `lflow` use.
pub fn sb_class() -> IdlClass {
    IdlClass::new(DATABASE, vec![
        TableClass::new("SB_Global", true, vec![
            ColumnClass::new("nb_cfg", integer()),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Chassis", true, vec![
            ColumnClass::new("name", string()),
            ColumnClass::new("hostname", string()),
            ColumnClass::new("nb_cfg", integer()),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Address_Set", true, vec![
            ColumnClass::new("name", string()),
            ColumnClass::new("addresses", ColumnType::set(AtomicType::String)),
        ]),
        TableClass::new("Logical_Flow", true, vec![
            ColumnClass::new("logical_datapath", datapath()),
            ColumnClass::new("pipeline", string()),
            ColumnClass::new("table_id", integer()),
            ColumnClass::new("priority", integer()),
            ColumnClass::new("match", string()),
            ColumnClass::new("actions", string()),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Multicast_Group", true, vec![
            ColumnClass::new("datapath", datapath()),
            ColumnClass::new("name", string()),
            ColumnClass::new("tunnel_key", integer()),
            ColumnClass::new("ports", ColumnType::set(AtomicType::Uuid)
                             .references("Port_Binding", RefType::Weak)),
        ]),
        TableClass::new("Datapath_Binding", true, vec![
            ColumnClass::new("tunnel_key", integer()),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Port_Binding", true, vec![
            ColumnClass::new("logical_port", string()),
            ColumnClass::new("type", string()),
            ColumnClass::new("options", smap()),
            ColumnClass::new("datapath", datapath()),
            ColumnClass::new("tunnel_key", integer()),
            ColumnClass::new("parent_port", ColumnType::optional(AtomicType::String)),
            ColumnClass::new("tag", ColumnType::optional(AtomicType::Integer)),
            ColumnClass::new("chassis", ColumnType::optional(AtomicType::Uuid)
                             .references("Chassis", RefType::Weak)),
            ColumnClass::new("mac", ColumnType::set(AtomicType::String)),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("MAC_Binding", true, vec![
            ColumnClass::new("logical_port", string()),
            ColumnClass::new("ip", string()),
            ColumnClass::new("mac", string()),
            ColumnClass::new("datapath", datapath()),
        ]),
        dhcp_options_table("DHCP_Options"),
        dhcp_options_table("DHCPv6_Options"),
    ])
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SbGlobal {
    pub uuid: Uuid,
    pub nb_cfg: i64,
}

impl FromRow for SbGlobal {
    const TABLE: &'static str = "SB_Global";

    fn from_row(row: &RowRef) -> SbGlobal {
        SbGlobal { uuid: row.uuid(), nb_cfg: row.integer("nb_cfg") }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chassis {
    pub uuid: Uuid,
    pub name: String,
    pub nb_cfg: i64,
}

impl FromRow for Chassis {
    const TABLE: &'static str = "Chassis";

    fn from_row(row: &RowRef) -> Chassis {
        Chassis { uuid: row.uuid(), name: row.string("name"), nb_cfg: row.integer("nb_cfg") }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SbAddressSet {
    pub uuid: Uuid,
    pub name: String,
    pub addresses: Vec<String>,
}

impl FromRow for SbAddressSet {
    const TABLE: &'static str = "Address_Set";

    fn from_row(row: &RowRef) -> SbAddressSet {
        SbAddressSet { uuid: row.uuid(), name: row.string("name"), addresses: row.strings("addresses") }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalFlow {
    pub uuid: Uuid,
    pub logical_datapath: Option<Uuid>,
    /// `ingress` or `egress`.
    pub pipeline: String,
    pub table_id: i64,
    pub priority: i64,
    pub match_: String,
    pub actions: String,
    pub external_ids: BTreeMap<String, String>,
}

impl FromRow for LogicalFlow {
    const TABLE: &'static str = "Logical_Flow";

    fn from_row(row: &RowRef) -> LogicalFlow {
        LogicalFlow {
            uuid: row.uuid(),
            logical_datapath: row.uuids("logical_datapath").first().copied(),
            pipeline: row.string("pipeline"),
            table_id: row.integer("table_id"),
            priority: row.integer("priority"),
            match_: row.string("match"),
            actions: row.string("actions"),
            external_ids: row.string_map("external_ids"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MulticastGroup {
    pub uuid: Uuid,
    pub datapath: Option<Uuid>,
    pub name: String,
    pub tunnel_key: i64,
    pub ports: Vec<Uuid>,
}

impl FromRow for MulticastGroup {
    const TABLE: &'static str = "Multicast_Group";

    fn from_row(row: &RowRef) -> MulticastGroup {
        MulticastGroup {
            uuid: row.uuid(),
            datapath: row.uuids("datapath").first().copied(),
            name: row.string("name"),
            tunnel_key: row.integer("tunnel_key"),
            ports: row.uuids("ports"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatapathBinding {
    pub uuid: Uuid,
    pub tunnel_key: i64,
    pub external_ids: BTreeMap<String, String>,
}

impl FromRow for DatapathBinding {
    const TABLE: &'static str = "Datapath_Binding";

    fn from_row(row: &RowRef) -> DatapathBinding {
        DatapathBinding {
            uuid: row.uuid(),
            tunnel_key: row.integer("tunnel_key"),
            external_ids: row.string_map("external_ids"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortBinding {
    pub uuid: Uuid,
    pub logical_port: String,
    pub type_: String,
    pub options: BTreeMap<String, String>,
    pub datapath: Option<Uuid>,
    pub tunnel_key: i64,
    pub parent_port: Option<String>,
    pub tag: Option<i64>,
    pub chassis: Option<Uuid>,
    pub mac: Vec<String>,
}

impl FromRow for PortBinding {
    const TABLE: &'static str = "Port_Binding";

    fn from_row(row: &RowRef) -> PortBinding {
        PortBinding {
            uuid: row.uuid(),
            logical_port: row.string("logical_port"),
            type_: row.string("type"),
            options: row.string_map("options"),
            datapath: row.uuids("datapath").first().copied(),
            tunnel_key: row.integer("tunnel_key"),
            parent_port: row.optional_string("parent_port"),
            tag: row.optional_integer("tag"),
            chassis: row.uuids("chassis").first().copied(),
            mac: row.strings("mac"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacBinding {
    pub uuid: Uuid,
    pub logical_port: String,
    pub ip: String,
    pub mac: String,
    pub datapath: Option<Uuid>,
}

impl FromRow for MacBinding {
    const TABLE: &'static str = "MAC_Binding";

    fn from_row(row: &RowRef) -> MacBinding {
        MacBinding {
            uuid: row.uuid(),
            logical_port: row.string("logical_port"),
            ip: row.string("ip"),
            mac: row.string("mac"),
            datapath: row.uuids("datapath").first().copied(),
        }
    }
}

/// A row of `DHCP_Options` or `DHCPv6_Options`, which list the options that `ovn-northd`
/// supports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SbDhcpOption {
    pub uuid: Uuid,
    pub name: String,
    pub code: i64,
    pub type_: String,
}

impl SbDhcpOption {
    fn read(row: &RowRef) -> SbDhcpOption {
        SbDhcpOption {
            uuid: row.uuid(),
            name: row.string("name"),
            code: row.integer("code"),
            type_: row.string("type"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SbDhcpOptions(pub SbDhcpOption);

impl FromRow for SbDhcpOptions {
    const TABLE: &'static str = "DHCP_Options";

    fn from_row(row: &RowRef) -> SbDhcpOptions {
        SbDhcpOptions(SbDhcpOption::read(row))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SbDhcpv6Options(pub SbDhcpOption);

impl FromRow for SbDhcpv6Options {
    const TABLE: &'static str = "DHCPv6_Options";

    fn from_row(row: &RowRef) -> SbDhcpv6Options {
        SbDhcpv6Options(SbDhcpOption::read(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovsdb_client::testing::TestServer;
    use serde_json::json;

    #[test]
    fn bindings() {
        let server = TestServer::new(&sb_class());
        server.transact(json!([
            {"op": "insert", "table": "Chassis", "uuid-name": "hv1", "row": {"name": "hv1", "nb_cfg": 3}},
            {"op": "insert", "table": "Datapath_Binding", "uuid-name": "dp",
             "row": {"tunnel_key": 1, "external_ids": ["map", [["name", "sw0"]]]}},
            {"op": "insert", "table": "Port_Binding", "uuid-name": "pb",
             "row": {"logical_port": "p1", "datapath": ["named-uuid", "dp"], "tunnel_key": 2,
                     "chassis": ["named-uuid", "hv1"], "mac": "00:00:00:00:00:01 10.0.0.2"}},
            {"op": "insert", "table": "Multicast_Group",
             "row": {"name": "_MC_flood", "datapath": ["named-uuid", "dp"], "tunnel_key": 65535,
                     "ports": ["named-uuid", "pb"]}},
        ]));
        let mut idl = server.idl(true);
        idl.run();

        let dp = &DatapathBinding::read_all(&idl)[0];
        let pb = &PortBinding::read_all(&idl)[0];
        let chassis = &Chassis::read_all(&idl)[0];
        let mg = &MulticastGroup::read_all(&idl)[0];
        assert_eq!(pb.datapath, Some(dp.uuid));
        assert_eq!(pb.chassis, Some(chassis.uuid));
        assert_eq!(pb.tag, None);
        assert_eq!(mg.ports, vec![pb.uuid]);
        assert_eq!(chassis.nb_cfg, 3);
    }
}
