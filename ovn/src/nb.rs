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

//! The OVN Northbound database: the tables that `ovn-northd` reads and owned views of
//! their rows.

use ovsdb_client::{Atom, AtomicType, ColumnClass, ColumnType, IdlClass, RefType, RowRef, TableClass};
use uuid::Uuid;

use std::collections::BTreeMap;

use crate::FromRow;

pub const DATABASE: &str = "OVN_Northbound";

fn string() -> ColumnType {
    ColumnType::scalar(AtomicType::String)
}

fn opt_string() -> ColumnType {
    ColumnType::optional(AtomicType::String)
}

fn strings() -> ColumnType {
    ColumnType::set(AtomicType::String)
}

fn smap() -> ColumnType {
    ColumnType::map(AtomicType::String, AtomicType::String)
}

fn refs(table: &str) -> ColumnType {
    ColumnType::set(AtomicType::Uuid).references(table, RefType::Strong)
}

/// The subset of the Northbound schema that `ovn-northd` uses.
pub fn nb_class() -> IdlClass {
    IdlClass::new(DATABASE, vec![
        TableClass::new("NB_Global", true, vec![
            ColumnClass::new("nb_cfg", ColumnType::scalar(AtomicType::Integer)),
            ColumnClass::new("sb_cfg", ColumnType::scalar(AtomicType::Integer)),
            ColumnClass::new("hv_cfg", ColumnType::scalar(AtomicType::Integer)),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Logical_Switch", true, vec![
            ColumnClass::new("name", string()),
            ColumnClass::new("ports", refs("Logical_Switch_Port")),
            ColumnClass::new("acls", refs("ACL")),
            ColumnClass::new("qos_rules", refs("QoS")),
            ColumnClass::new("load_balancer", ColumnType::set(AtomicType::Uuid)
                             .references("Load_Balancer", RefType::Weak)),
            ColumnClass::new("other_config", smap()),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Logical_Switch_Port", false, vec![
            ColumnClass::new("name", string()),
            ColumnClass::new("type", string()),
            ColumnClass::new("options", smap()),
            ColumnClass::new("parent_name", opt_string()),
            ColumnClass::new("tag_request", ColumnType::optional(AtomicType::Integer)),
            ColumnClass::new("tag", ColumnType::optional(AtomicType::Integer)),
            ColumnClass::new("addresses", strings()),
            ColumnClass::new("dynamic_addresses", opt_string()),
            ColumnClass::new("port_security", strings()),
            ColumnClass::new("up", ColumnType::optional(AtomicType::Boolean)),
            ColumnClass::new("enabled", ColumnType::optional(AtomicType::Boolean)),
            ColumnClass::new("dhcpv4_options", ColumnType::optional(AtomicType::Uuid)
                             .references("DHCP_Options", RefType::Weak)),
            ColumnClass::new("dhcpv6_options", ColumnType::optional(AtomicType::Uuid)
                             .references("DHCP_Options", RefType::Weak)),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Address_Set", true, vec![
            ColumnClass::new("name", string()),
            ColumnClass::new("addresses", strings()),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Load_Balancer", true, vec![
            ColumnClass::new("name", string()),
            ColumnClass::new("vips", smap()),
            ColumnClass::new("protocol", opt_string()),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("ACL", false, vec![
            ColumnClass::new("priority", ColumnType::scalar(AtomicType::Integer)),
            ColumnClass::new("direction", string()),
            ColumnClass::new("match", string()),
            ColumnClass::new("action", string()),
            ColumnClass::new("log", ColumnType::scalar(AtomicType::Boolean)),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("QoS", false, vec![
            ColumnClass::new("priority", ColumnType::scalar(AtomicType::Integer)),
            ColumnClass::new("direction", string()),
            ColumnClass::new("match", string()),
            ColumnClass::new("action", ColumnType::map(AtomicType::String, AtomicType::Integer)),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Logical_Router", true, vec![
            ColumnClass::new("name", string()),
            ColumnClass::new("ports", refs("Logical_Router_Port")),
            ColumnClass::new("static_routes", refs("Logical_Router_Static_Route")),
            ColumnClass::new("enabled", ColumnType::optional(AtomicType::Boolean)),
            ColumnClass::new("nat", refs("NAT")),
            ColumnClass::new("load_balancer", ColumnType::set(AtomicType::Uuid)
                             .references("Load_Balancer", RefType::Weak)),
            ColumnClass::new("options", smap()),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Logical_Router_Port", false, vec![
            ColumnClass::new("name", string()),
            ColumnClass::new("options", smap()),
            ColumnClass::new("networks", strings()),
            ColumnClass::new("mac", string()),
            ColumnClass::new("peer", opt_string()),
            ColumnClass::new("enabled", ColumnType::optional(AtomicType::Boolean)),
            ColumnClass::new("external_ids", smap()),
        ]),
        TableClass::new("Logical_Router_Static_Route", false, vec![
            ColumnClass::new("ip_prefix", string()),
            ColumnClass::new("policy", opt_string()),
            ColumnClass::new("nexthop", string()),
            ColumnClass::new("output_port", opt_string()),
        ]),
        TableClass::new("NAT", false, vec![
            ColumnClass::new("external_ip", string()),
            ColumnClass::new("external_mac", opt_string()),
            ColumnClass::new("logical_ip", string()),
            ColumnClass::new("logical_port", opt_string()),
            ColumnClass::new("type", string()),
        ]),
        TableClass::new("DHCP_Options", true, vec![
            ColumnClass::new("cidr", string()),
            ColumnClass::new("options", smap()),
            ColumnClass::new("external_ids", smap()),
        ]),
    ])
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NbGlobal {
    pub uuid: Uuid,
    pub nb_cfg: i64,
    pub sb_cfg: i64,
    pub hv_cfg: i64,
}

impl FromRow for NbGlobal {
    const TABLE: &'static str = "NB_Global";

    fn from_row(row: &RowRef) -> NbGlobal {
        NbGlobal {
            uuid: row.uuid(),
            nb_cfg: row.integer("nb_cfg"),
            sb_cfg: row.integer("sb_cfg"),
            hv_cfg: row.integer("hv_cfg"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalSwitch {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<LogicalSwitchPort>,
    pub acls: Vec<Acl>,
    pub qos_rules: Vec<Qos>,
    pub load_balancer: Vec<LoadBalancer>,
    pub other_config: BTreeMap<String, String>,
}

impl FromRow for LogicalSwitch {
    const TABLE: &'static str = "Logical_Switch";

    fn from_row(row: &RowRef) -> LogicalSwitch {
        LogicalSwitch {
            uuid: row.uuid(),
            name: row.string("name"),
            ports: row.refs("ports").iter().map(LogicalSwitchPort::from_row).collect(),
            acls: row.refs("acls").iter().map(Acl::from_row).collect(),
            qos_rules: row.refs("qos_rules").iter().map(Qos::from_row).collect(),
            load_balancer: row.refs("load_balancer").iter().map(LoadBalancer::from_row).collect(),
            other_config: row.string_map("other_config"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalSwitchPort {
    pub uuid: Uuid,
    pub name: String,
    pub type_: String,
    pub options: BTreeMap<String, String>,
    pub parent_name: Option<String>,
    pub tag_request: Option<i64>,
    pub tag: Option<i64>,
    pub addresses: Vec<String>,
    pub dynamic_addresses: Option<String>,
    pub port_security: Vec<String>,
    pub up: Option<bool>,
    pub enabled: Option<bool>,
    pub dhcpv4_options: Option<DhcpOptions>,
    pub dhcpv6_options: Option<DhcpOptions>,
}

impl LogicalSwitchPort {
    /// A port is enabled unless `enabled` is explicitly false.
    pub fn is_enabled(&self) -> bool {
        self.enabled != Some(false)
    }
}

impl FromRow for LogicalSwitchPort {
    const TABLE: &'static str = "Logical_Switch_Port";

    fn from_row(row: &RowRef) -> LogicalSwitchPort {
        LogicalSwitchPort {
            uuid: row.uuid(),
            name: row.string("name"),
            type_: row.string("type"),
            options: row.string_map("options"),
            parent_name: row.optional_string("parent_name"),
            tag_request: row.optional_integer("tag_request"),
            tag: row.optional_integer("tag"),
            addresses: row.strings("addresses"),
            dynamic_addresses: row.optional_string("dynamic_addresses"),
            port_security: row.strings("port_security"),
            up: row.optional_boolean("up"),
            enabled: row.optional_boolean("enabled"),
            dhcpv4_options: row.ref_("dhcpv4_options").as_ref().map(DhcpOptions::from_row),
            dhcpv6_options: row.ref_("dhcpv6_options").as_ref().map(DhcpOptions::from_row),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acl {
    pub uuid: Uuid,
    pub priority: i64,
    /// `from-lport` or `to-lport`.
    pub direction: String,
    pub match_: String,
    /// `allow`, `allow-related`, `drop`, or `reject`.
    pub action: String,
    pub log: bool,
}

impl FromRow for Acl {
    const TABLE: &'static str = "ACL";

    fn from_row(row: &RowRef) -> Acl {
        Acl {
            uuid: row.uuid(),
            priority: row.integer("priority"),
            direction: row.string("direction"),
            match_: row.string("match"),
            action: row.string("action"),
            log: row.boolean("log"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Qos {
    pub uuid: Uuid,
    pub priority: i64,
    pub direction: String,
    pub match_: String,
    /// The DSCP value to mark matching packets with.
    pub dscp: Option<i64>,
}

impl FromRow for Qos {
    const TABLE: &'static str = "QoS";

    fn from_row(row: &RowRef) -> Qos {
        Qos {
            uuid: row.uuid(),
            priority: row.integer("priority"),
            direction: row.string("direction"),
            match_: row.string("match"),
            dscp: row.get("action")
                .and_then(|action| action.get(&Atom::from("dscp")))
                .and_then(Atom::as_integer),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancer {
    pub uuid: Uuid,
    pub name: String,
    /// Maps `VIP[:PORT]` to a comma-separated list of `IP[:PORT]` backends.
    pub vips: BTreeMap<String, String>,
    pub protocol: Option<String>,
}

impl FromRow for LoadBalancer {
    const TABLE: &'static str = "Load_Balancer";

    fn from_row(row: &RowRef) -> LoadBalancer {
        LoadBalancer {
            uuid: row.uuid(),
            name: row.string("name"),
            vips: row.string_map("vips"),
            protocol: row.optional_string("protocol"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressSet {
    pub uuid: Uuid,
    pub name: String,
    pub addresses: Vec<String>,
}

impl FromRow for AddressSet {
    const TABLE: &'static str = "Address_Set";

    fn from_row(row: &RowRef) -> AddressSet {
        AddressSet {
            uuid: row.uuid(),
            name: row.string("name"),
            addresses: row.strings("addresses"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalRouter {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<LogicalRouterPort>,
    pub static_routes: Vec<LogicalRouterStaticRoute>,
    pub enabled: Option<bool>,
    pub nat: Vec<Nat>,
    pub load_balancer: Vec<LoadBalancer>,
    pub options: BTreeMap<String, String>,
}

impl LogicalRouter {
    pub fn is_enabled(&self) -> bool {
        self.enabled != Some(false)
    }
}

impl FromRow for LogicalRouter {
    const TABLE: &'static str = "Logical_Router";

    fn from_row(row: &RowRef) -> LogicalRouter {
        LogicalRouter {
            uuid: row.uuid(),
            name: row.string("name"),
            ports: row.refs("ports").iter().map(LogicalRouterPort::from_row).collect(),
            static_routes: row.refs("static_routes").iter().map(LogicalRouterStaticRoute::from_row).collect(),
            enabled: row.optional_boolean("enabled"),
            nat: row.refs("nat").iter().map(Nat::from_row).collect(),
            load_balancer: row.refs("load_balancer").iter().map(LoadBalancer::from_row).collect(),
            options: row.string_map("options"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalRouterPort {
    pub uuid: Uuid,
    pub name: String,
    pub options: BTreeMap<String, String>,
    pub networks: Vec<String>,
    pub mac: String,
    pub peer: Option<String>,
    pub enabled: Option<bool>,
}

impl LogicalRouterPort {
    pub fn is_enabled(&self) -> bool {
        self.enabled != Some(false)
    }
}

impl FromRow for LogicalRouterPort {
    const TABLE: &'static str = "Logical_Router_Port";

    fn from_row(row: &RowRef) -> LogicalRouterPort {
        LogicalRouterPort {
            uuid: row.uuid(),
            name: row.string("name"),
            options: row.string_map("options"),
            networks: row.strings("networks"),
            mac: row.string("mac"),
            peer: row.optional_string("peer"),
            enabled: row.optional_boolean("enabled"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalRouterStaticRoute {
    pub uuid: Uuid,
    pub ip_prefix: String,
    /// `dst-ip` (the default) or `src-ip`.
    pub policy: Option<String>,
    pub nexthop: String,
    pub output_port: Option<String>,
}

impl FromRow for LogicalRouterStaticRoute {
    const TABLE: &'static str = "Logical_Router_Static_Route";

    fn from_row(row: &RowRef) -> LogicalRouterStaticRoute {
        LogicalRouterStaticRoute {
            uuid: row.uuid(),
            ip_prefix: row.string("ip_prefix"),
            policy: row.optional_string("policy"),
            nexthop: row.string("nexthop"),
            output_port: row.optional_string("output_port"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nat {
    pub uuid: Uuid,
    pub external_ip: String,
    pub external_mac: Option<String>,
    pub logical_ip: String,
    pub logical_port: Option<String>,
    /// `dnat`, `snat`, or `dnat_and_snat`.
    pub type_: String,
}

impl FromRow for Nat {
    const TABLE: &'static str = "NAT";

    fn from_row(row: &RowRef) -> Nat {
        Nat {
            uuid: row.uuid(),
            external_ip: row.string("external_ip"),
            external_mac: row.optional_string("external_mac"),
            logical_ip: row.string("logical_ip"),
            logical_port: row.optional_string("logical_port"),
            type_: row.string("type"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpOptions {
    pub uuid: Uuid,
    pub cidr: String,
    pub options: BTreeMap<String, String>,
}

impl FromRow for DhcpOptions {
    const TABLE: &'static str = "DHCP_Options";

    fn from_row(row: &RowRef) -> DhcpOptions {
        DhcpOptions {
            uuid: row.uuid(),
            cidr: row.string("cidr"),
            options: row.string_map("options"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovsdb_client::testing::TestServer;
    use serde_json::json;

    #[test]
    fn switch_view() {
        let server = TestServer::new(&nb_class());
        server.transact(json!([
            {"op": "insert", "table": "DHCP_Options", "uuid-name": "dhcp",
             "row": {"cidr": "10.0.0.0/24", "options": ["map", [["router", "10.0.0.1"]]]}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "p1",
             "row": {"name": "p1", "addresses": "00:00:00:00:00:01 10.0.0.2",
                     "enabled": false, "dhcpv4_options": ["named-uuid", "dhcp"]}},
            {"op": "insert", "table": "ACL", "uuid-name": "acl",
             "row": {"priority": 1001, "direction": "to-lport", "match": "ip4", "action": "drop"}},
            {"op": "insert", "table": "QoS", "uuid-name": "qos",
             "row": {"priority": 10, "direction": "from-lport", "match": "ip4",
                     "action": ["map", [["dscp", 48]]]}},
            {"op": "insert", "table": "Logical_Switch",
             "row": {"name": "sw0", "ports": ["named-uuid", "p1"], "acls": ["named-uuid", "acl"],
                     "qos_rules": ["named-uuid", "qos"],
                     "other_config": ["map", [["subnet", "10.0.0.0/24"]]]}},
        ]));
        let mut idl = server.idl(true);
        idl.run();

        let switches = LogicalSwitch::read_all(&idl);
        assert_eq!(switches.len(), 1);
        let ls = &switches[0];
        assert_eq!(ls.name, "sw0");
        assert_eq!(ls.other_config.get("subnet").map(String::as_str), Some("10.0.0.0/24"));
        assert_eq!(ls.acls[0].priority, 1001);
        assert_eq!(ls.qos_rules[0].dscp, Some(48));

        let lsp = &ls.ports[0];
        assert_eq!(lsp.addresses, vec!["00:00:00:00:00:01 10.0.0.2".to_string()]);
        assert!(!lsp.is_enabled());
        assert_eq!(lsp.dhcpv4_options.as_ref().map(|d| d.cidr.as_str()), Some("10.0.0.0/24"));
        assert!(lsp.dhcpv6_options.is_none());
    }

    #[test]
    fn router_view() {
        let server = TestServer::new(&nb_class());
        server.transact(json!([
            {"op": "insert", "table": "Logical_Router_Port", "uuid-name": "lrp",
             "row": {"name": "lrp0", "mac": "00:00:00:00:ff:01",
                     "networks": ["set", ["192.168.0.1/24", "10.0.0.1/24"]]}},
            {"op": "insert", "table": "NAT", "uuid-name": "nat",
             "row": {"type": "snat", "external_ip": "203.0.113.1", "logical_ip": "10.0.0.0/24"}},
            {"op": "insert", "table": "Logical_Router_Static_Route", "uuid-name": "route",
             "row": {"ip_prefix": "0.0.0.0/0", "nexthop": "192.168.0.254"}},
            {"op": "insert", "table": "Logical_Router",
             "row": {"name": "lr0", "ports": ["named-uuid", "lrp"], "nat": ["named-uuid", "nat"],
                     "static_routes": ["named-uuid", "route"],
                     "options": ["map", [["chassis", "hv1"]]]}},
        ]));
        let mut idl = server.idl(true);
        idl.run();

        let routers = LogicalRouter::read_all(&idl);
        let lr = &routers[0];
        assert!(lr.is_enabled());
        assert_eq!(lr.ports[0].networks, vec!["10.0.0.1/24".to_string(), "192.168.0.1/24".to_string()]);
        assert_eq!(lr.nat[0].type_, "snat");
        assert_eq!(lr.nat[0].logical_port, None);
        assert_eq!(lr.static_routes[0].nexthop, "192.168.0.254");
        assert_eq!(lr.options.get("chassis").map(String::as_str), Some("hv1"));
    }
}
