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

//! Logical ports: switch ports, router ports, and the chassisredirect ports derived from
//! distributed gateway ports, each bound to a Southbound `Port_Binding`.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::ops::{Index, IndexMut};

use anyhow::Result;
use ovn::actions::{QDISC_MAX_QUEUE_ID, QDISC_MIN_QUEUE_ID};
use ovn::addresses::{extract_lrp_networks, extract_lsp_addresses, is_dynamic_lsp_address,
                     parse_ipv4_cidr, EthAddr, LportAddresses};
use ovn::nb::{LogicalRouterPort, LogicalSwitchPort};
use ovn::sb::{MacBinding, PortBinding};
use ovn::FromRow;
use ovsdb_client::Datum;
use tracing::{event, info, Level};
use uuid::Uuid;

use crate::context::NorthdContext;
use crate::datapath::{Datapaths, OvnDatapath};
use crate::ipam::ipam_insert_lsp_addresses;
use crate::lb::lb_vip_ips;
use crate::tnlid::{allocate_tnlid, MAX_PORT_TUNNEL_KEY};

pub const MAX_OVN_TAGS: i64 = 4096;

/// VLAN tags of nested container ports, per parent port.  Tag 0 is never allocated.
#[derive(Clone, Debug, Default)]
pub struct TagAlloc(BTreeMap<String, BTreeSet<i64>>);

impl TagAlloc {
    fn tags(&mut self, parent_name: &str) -> &mut BTreeSet<i64> {
        self.0.entry(parent_name.into()).or_insert_with(|| std::iter::once(0).collect())
    }

    /// Records the tag that `nbsp` already has.
    pub fn add_existing(&mut self, nbsp: &LogicalSwitchPort) {
        if let (Some(parent_name), Some(tag)) = (&nbsp.parent_name, nbsp.tag) {
            if !parent_name.is_empty() {
                self.tags(parent_name).insert(tag);
            }
        }
    }

    /// Returns the tag that `nbsp` should get, if it needs a new one: the lowest free tag
    /// under its parent if it requests tag 0, otherwise the tag it requests.
    pub fn create_new_tag(&mut self, nbsp: &LogicalSwitchPort) -> Option<i64> {
        let tag_request = nbsp.tag_request?;
        match &nbsp.parent_name {
            Some(parent_name) if !parent_name.is_empty() && tag_request == 0 => {
                if nbsp.tag.is_some() {
                    return None;
                }
                let tags = self.tags(parent_name);
                match (1..MAX_OVN_TAGS).find(|tag| !tags.contains(tag)) {
                    Some(tag) => {
                        tags.insert(tag);
                        Some(tag)
                    },
                    None => {
                        event!(Level::ERROR, "out of vlans for logical switch ports with parent {}",
                               parent_name);
                        None
                    }
                }
            },
            _ if tag_request != 0 && nbsp.tag != Some(tag_request) => Some(tag_request),
            _ => None,
        }
    }
}

/// Queue ids in use for QoS on each chassis.
#[derive(Clone, Debug, Default)]
pub struct ChassisQueues(BTreeSet<(Uuid, u32)>);

impl ChassisQueues {
    pub fn add(&mut self, chassis: Uuid, queue_id: u32) {
        self.0.insert((chassis, queue_id));
    }

    pub fn allocate(&mut self, chassis: Uuid) -> Option<u32> {
        // The chassis' ids come out in order, so the first gap is the lowest free id.
        let mut queue_id = QDISC_MIN_QUEUE_ID as u32 + 1;
        for &(_, used) in self.0.range((chassis, queue_id)..=(chassis, QDISC_MAX_QUEUE_ID as u32)) {
            if used != queue_id {
                break;
            }
            queue_id += 1;
        }
        if queue_id > QDISC_MAX_QUEUE_ID as u32 {
            event!(Level::WARN, "all {} queue ids exhausted", chassis);
            return None;
        }
        self.0.insert((chassis, queue_id));
        Some(queue_id)
    }

    pub fn free(&mut self, chassis: Uuid, queue_id: u32) {
        self.0.remove(&(chassis, queue_id));
    }
}

fn port_has_qos_params(options: &BTreeMap<String, String>) -> bool {
    options.contains_key("qos_max_rate") || options.contains_key("qos_burst")
}

fn qdisc_queue_id(options: &BTreeMap<String, String>) -> u32 {
    options.get("qdisc_queue_id").and_then(|id| id.parse().ok()).unwrap_or(0)
}

#[derive(Clone, Debug)]
pub struct OvnPort {
    /// The port's name, which is also `logical_port` in its `Port_Binding`.
    pub key: String,
    /// `key` as a quoted string, for use in matches and actions.
    pub json_key: String,

    pub nbsp: Option<LogicalSwitchPort>,
    pub nbrp: Option<LogicalRouterPort>,
    /// True for the chassisredirect port of a distributed gateway port.  It shares `nbrp`
    /// with the gateway port.
    pub derived: bool,

    /// Index of the datapath that the port belongs to.
    pub od: usize,

    /// The `Port_Binding`, if there is one.
    pub sb: Option<Uuid>,
    /// The `Port_Binding` as it was before this rebuild.
    pub sb_old: Option<PortBinding>,
    /// The options written to the `Port_Binding`.
    pub sb_options: BTreeMap<String, String>,
    pub tunnel_key: u32,

    /// Addresses of a switch port, from `addresses` and `dynamic_addresses`.
    pub lsp_addrs: Vec<LportAddresses>,
    /// Allowed addresses of a switch port, from `port_security`.
    pub ps_addrs: Vec<LportAddresses>,
    /// Addresses of a router port.
    pub lrp_networks: LportAddresses,

    /// For a router port, the router port or switch port of type "router" on the other
    /// end of its link, and vice versa.
    pub peer: Option<usize>,
}

impl OvnPort {
    pub(crate) fn new(key: &str, od: usize, sb_old: Option<PortBinding>) -> OvnPort {
        OvnPort {
            key: key.into(),
            json_key: serde_json::Value::from(key).to_string(),
            nbsp: None,
            nbrp: None,
            derived: false,
            od,
            sb: sb_old.as_ref().map(|sb| sb.uuid),
            sb_old,
            sb_options: BTreeMap::new(),
            tunnel_key: 0,
            lsp_addrs: Vec::new(),
            ps_addrs: Vec::new(),
            lrp_networks: LportAddresses::default(),
            peer: None,
        }
    }

    /// A switch port is enabled unless disabled explicitly.  Router ports, including the
    /// derived ones, follow their Northbound row.
    pub fn is_enabled(&self) -> bool {
        match (&self.nbsp, &self.nbrp) {
            (Some(nbsp), _) => nbsp.is_enabled(),
            (None, Some(nbrp)) => nbrp.is_enabled(),
            (None, None) => false,
        }
    }

    /// The `Logical_Switch_Port` type, or "" for router ports.
    pub fn lsp_type(&self) -> &str {
        self.nbsp.as_ref().map_or("", |nbsp| nbsp.type_.as_str())
    }
}

/// The logical ports of one rebuild, indexed by position.
#[derive(Clone, Debug, Default)]
pub struct Ports {
    list: Vec<OvnPort>,
    by_name: BTreeMap<String, usize>,
}

impl Ports {
    fn push(&mut self, op: OvnPort) -> usize {
        let index = self.list.len();
        self.by_name.insert(op.key.clone(), index);
        self.list.push(op);
        index
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut OvnPort> {
        let index = self.find(name)?;
        self.list.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OvnPort> {
        self.list.iter()
    }

    /// Iterates over the ports of datapath `od`.
    pub fn of_datapath(&self, od: usize) -> impl Iterator<Item = &OvnPort> {
        self.list.iter().filter(move |op| op.od == od)
    }
}

impl Index<usize> for Ports {
    type Output = OvnPort;

    fn index(&self, index: usize) -> &OvnPort {
        &self.list[index]
    }
}

impl IndexMut<usize> for Ports {
    fn index_mut(&mut self, index: usize) -> &mut OvnPort {
        &mut self.list[index]
    }
}

pub struct JoinedPorts {
    pub ports: Ports,
    pub nb_only: Vec<usize>,
    pub both: Vec<usize>,
    pub sb_only: Vec<PortBinding>,
}

/// If the MAC in `address`, a "MAC dynamic" address, differs from the one in
/// `dynamic_addresses`, updates `dynamic_addresses` to use it.
fn check_and_update_mac_in_dynamic_addresses(ctx: &mut NorthdContext, nbsp: &mut LogicalSwitchPort,
                                             address: &str) -> Result<()> {
    let dynamic = match &nbsp.dynamic_addresses {
        Some(dynamic) => dynamic,
        None => return Ok(()),
    };
    let ea = match address.split_whitespace().next().and_then(|mac| mac.parse::<EthAddr>().ok()) {
        Some(ea) => ea,
        None => return Ok(()),
    };
    let (present, rest) = dynamic.split_at(dynamic.find(char::is_whitespace).unwrap_or_else(|| dynamic.len()));
    match present.parse::<EthAddr>() {
        Ok(present) if present != ea => {
            let new = format!("{}{}", ea, rest);
            ctx.nb.write("Logical_Switch_Port", &nbsp.uuid, "dynamic_addresses", Datum::scalar(new.as_str()))?;
            nbsp.dynamic_addresses = Some(new);
        },
        _ => (),
    }
    Ok(())
}

fn join_switch_port(ctx: &mut NorthdContext, od: &mut OvnDatapath, od_index: usize,
                    mut nbsp: LogicalSwitchPort, sb: Option<PortBinding>) -> Result<OvnPort> {
    if let Some(sb) = &sb {
        let queue_id = qdisc_queue_id(&sb.options);
        if let (true, Some(chassis)) = (queue_id != 0, sb.chassis) {
            ctx.queues.add(chassis, queue_id);
        }
    }

    let mut op = OvnPort::new(&nbsp.name, od_index, sb);
    for address in nbsp.addresses.clone() {
        if address == "unknown" || address == "router" {
            continue;
        }
        if is_dynamic_lsp_address(&address) {
            if nbsp.dynamic_addresses.is_some() {
                check_and_update_mac_in_dynamic_addresses(ctx, &mut nbsp, &address)?;
                let dynamic = nbsp.dynamic_addresses.as_deref().unwrap_or_default();
                match extract_lsp_addresses(dynamic) {
                    Some(laddrs) => op.lsp_addrs.push(laddrs),
                    None => info!("invalid syntax '{}' in logical switch port dynamic_addresses. \
                                   No MAC address found", dynamic),
                }
            }
            continue;
        }
        match extract_lsp_addresses(&address) {
            Some(laddrs) => op.lsp_addrs.push(laddrs),
            None => info!("invalid syntax '{}' in logical switch port addresses. No MAC address found",
                          address),
        }
    }

    for ps in &nbsp.port_security {
        match extract_lsp_addresses(ps) {
            Some(laddrs) => op.ps_addrs.push(laddrs),
            None => info!("invalid syntax '{}' in port security. No MAC address found", ps),
        }
    }

    for address in nbsp.addresses.iter().chain(nbsp.dynamic_addresses.iter()) {
        ipam_insert_lsp_addresses(od.ipam.as_mut(), &mut ctx.macam, address);
    }
    ctx.tags.add_existing(&nbsp);

    op.nbsp = Some(nbsp);
    Ok(op)
}

/// Matches the ports of Northbound switches and routers against Southbound port
/// bindings, and links ports to their peers.
pub fn join_logical_ports(ctx: &mut NorthdContext, datapaths: &mut Datapaths) -> Result<JoinedPorts> {
    let mut sb_only: BTreeMap<String, PortBinding> = BTreeMap::new();
    let mut duplicates = Vec::new();
    for sb in PortBinding::read_all(ctx.sb_idl()) {
        match sb_only.entry(sb.logical_port.clone()) {
            Entry::Vacant(e) => {
                e.insert(sb);
            },
            Entry::Occupied(_) => duplicates.push(sb),
        }
    }

    let mut ports = Ports::default();
    let mut nb_only = Vec::new();
    let mut both = Vec::new();
    let mut add_port = |ports: &mut Ports, op: OvnPort| {
        let in_sb = op.sb.is_some();
        let index = ports.push(op);
        if in_sb {
            both.push(index);
        } else {
            nb_only.push(index);
        }
        index
    };

    for od_index in 0..datapaths.len() {
        let od = &mut datapaths[od_index];
        if let Some(switch_ports) = od.nbs.as_ref().map(|nbs| nbs.ports.clone()) {
            for nbsp in switch_ports {
                if ports.find(&nbsp.name).is_some() {
                    event!(Level::WARN, "duplicate logical port {}", nbsp.name);
                    continue;
                }
                let sb = sb_only.remove(&nbsp.name);
                let op = join_switch_port(ctx, od, od_index, nbsp, sb)?;
                add_port(&mut ports, op);
            }
        } else if let Some(nbr) = od.nbr.clone() {
            for nbrp in &nbr.ports {
                let lrp_networks = match extract_lrp_networks(&nbrp.mac, &nbrp.networks) {
                    Some(lrp_networks) => lrp_networks,
                    None => {
                        event!(Level::WARN, "bad 'mac' {}", nbrp.mac);
                        continue;
                    }
                };
                if !lrp_networks.has_ip() {
                    continue;
                }
                if ports.find(&nbrp.name).is_some() {
                    event!(Level::WARN, "duplicate logical router port {}", nbrp.name);
                    continue;
                }

                ctx.macam.insert(&lrp_networks.ea, true);
                let mut op = OvnPort::new(&nbrp.name, od_index, sb_only.remove(&nbrp.name));
                op.nbrp = Some(nbrp.clone());
                op.lrp_networks = lrp_networks;
                let index = add_port(&mut ports, op);

                if !nbrp.options.contains_key("redirect-chassis") {
                    continue;
                }
                if nbr.options.contains_key("chassis") {
                    event!(Level::WARN, "Bad configuration: redirect-chassis configured on port {} \
                                         on L3 gateway router", nbrp.name);
                    continue;
                }

                // The instance of the port on its redirect-chassis.
                let redirect_name = format!("cr-{}", nbrp.name);
                if ports.find(&redirect_name).is_some() {
                    event!(Level::WARN, "duplicate logical router port {}", redirect_name);
                    continue;
                }
                let mut crp = OvnPort::new(&redirect_name, od_index, sb_only.remove(&redirect_name));
                crp.derived = true;
                crp.nbrp = Some(nbrp.clone());
                let cr_index = add_port(&mut ports, crp);

                if od.l3dgw_port.is_some() || od.l3redirect_port.is_some() {
                    event!(Level::WARN, "Bad configuration: multiple ports with redirect-chassis \
                                         on same logical router {}", nbr.name);
                    continue;
                }
                od.l3dgw_port = Some(index);
                od.l3redirect_port = Some(cr_index);
            }
        }
    }

    // Connect router ports, and switch ports of type "router", to their peers.
    for index in 0..ports.len() {
        if ports[index].derived {
            continue;
        }
        if let Some(nbsp) = ports[index].nbsp.clone() {
            if nbsp.type_ != "router" {
                continue;
            }
            let peer = match nbsp.options.get("router-port").and_then(|name| ports.find(name)) {
                Some(peer) if ports[peer].nbrp.is_some() => peer,
                _ => continue,
            };
            ports[peer].peer = Some(index);
            ports[index].peer = Some(peer);
            let od = ports[index].od;
            datapaths[od].router_ports.push(index);

            // The "router" address stands for the peer's addresses.
            if nbsp.addresses.iter().any(|address| address == "router") {
                let lrp_networks = ports[peer].nbrp.as_ref()
                    .and_then(|nbrp| extract_lrp_networks(&nbrp.mac, &nbrp.networks));
                ports[index].lsp_addrs.extend(lrp_networks);
            }
        } else if let Some(peer_name) = ports[index].nbrp.as_ref().and_then(|nbrp| nbrp.peer.clone()) {
            if let Some(peer) = ports.find(&peer_name) {
                if ports[peer].nbrp.is_some() {
                    ports[index].peer = Some(peer);
                } else if ports[peer].nbsp.is_some() {
                    event!(Level::WARN, "Bad configuration: The peer of router port {} is a switch port",
                           ports[index].key);
                }
            }
        }
    }

    // A router port's addresses are in use on the switch that it connects to.
    for op in ports.iter() {
        let peer = match op.peer {
            Some(peer) if op.nbrp.is_some() && ports[peer].nbsp.is_some() => &ports[peer],
            _ => continue,
        };
        if let Some(ipam) = datapaths[peer.od].ipam.as_mut() {
            for addr in &op.lrp_networks.ipv4_addrs {
                ipam.insert_ip(u32::from(addr.addr()), true);
            }
        }
    }

    let mut sb_only: Vec<PortBinding> = sb_only.into_values().collect();
    sb_only.extend(duplicates);
    Ok(JoinedPorts { ports, nb_only, both, sb_only })
}

/// The MAC address of router port `op` followed by the external IPs of its router's NAT
/// rules and the VIPs of its router's load balancers.
pub fn get_nat_addresses(op: &OvnPort, od: &OvnDatapath) -> Option<String> {
    let nbrp = op.nbrp.as_ref()?;
    let nbr = od.nbr.as_ref()?;
    if nbr.nat.is_empty() && nbr.load_balancer.is_empty() {
        return None;
    }
    let mac = nbrp.mac.parse::<EthAddr>().ok()?;

    let mut addresses = mac.to_string();
    for nat in &nbr.nat {
        if let Some((_, 32)) = parse_ipv4_cidr(&nat.external_ip) {
            write!(addresses, " {}", nat.external_ip).ok()?;
        }
    }
    for ip in lb_vip_ips(&nbr.load_balancer) {
        write!(addresses, " {}", ip).ok()?;
    }
    Some(addresses)
}

/// Writes port `index`'s `Port_Binding` from the Northbound configuration.
fn ovn_port_update_sbrec(ctx: &mut NorthdContext, datapaths: &Datapaths, ports: &mut Ports,
                         index: usize) -> Result<()> {
    let op = &ports[index];
    let sb = match op.sb {
        Some(sb) => sb,
        None => return Ok(()),
    };
    let od = &datapaths[op.od];

    let mut options = BTreeMap::new();
    let type_;
    let mut parent_port = None;
    let mut tag = None;
    let mut mac = Vec::new();
    if let Some(nbrp) = &op.nbrp {
        let chassis = od.gateway_chassis();
        type_ = if op.derived {
            "chassisredirect"
        } else if chassis.is_some() {
            "l3gateway"
        } else {
            "patch"
        }.to_string();

        if op.derived {
            if let Some(redirect_chassis) = nbrp.options.get("redirect-chassis") {
                options.insert("redirect-chassis".to_string(), redirect_chassis.clone());
            }
            options.insert("distributed-port".into(), nbrp.name.clone());
        } else {
            let peer = op.peer.map_or("<error>", |peer| ports[peer].key.as_str());
            options.insert("peer".into(), peer.to_string());
            if let Some(chassis) = chassis {
                options.insert("l3gateway-chassis".into(), chassis.to_string());
            }
        }
    } else if let Some(nbsp) = &op.nbsp {
        if nbsp.type_ != "router" {
            let mut queue_id = op.sb_old.as_ref().map_or(0, |sb| qdisc_queue_id(&sb.options));
            let chassis = op.sb_old.as_ref().and_then(|sb| sb.chassis);
            let has_qos = port_has_qos_params(&nbsp.options);
            if has_qos && queue_id == 0 {
                if let Some(chassis) = chassis {
                    queue_id = ctx.queues.allocate(chassis).unwrap_or(0);
                }
            } else if !has_qos && queue_id != 0 {
                if let Some(chassis) = chassis {
                    ctx.queues.free(chassis, queue_id);
                }
                queue_id = 0;
            }

            options = nbsp.options.clone();
            if queue_id != 0 {
                options.insert("qdisc_queue_id".into(), queue_id.to_string());
            }
            type_ = nbsp.type_.clone();
        } else {
            let peer = op.peer.map(|peer| &ports[peer]);
            let chassis = peer.and_then(|peer| datapaths[peer.od].gateway_chassis());

            // A switch port connected to a gateway router is also of type "l3gateway".
            type_ = if chassis.is_some() { "l3gateway" } else { "patch" }.to_string();

            let router_port = nbsp.options.get("router-port").map_or("<error>", String::as_str);
            options.insert("peer".into(), router_port.to_string());
            if let Some(chassis) = chassis {
                options.insert("l3gateway-chassis".into(), chassis.to_string());
            }

            match nbsp.options.get("nat-addresses").map(String::as_str) {
                Some("router") => {
                    let nats = peer.and_then(|peer| get_nat_addresses(peer, &datapaths[peer.od]));
                    if let Some(nats) = nats {
                        options.insert("nat-addresses".into(), nats);
                    }
                },
                Some(nat_addresses) => {
                    if extract_lsp_addresses(nat_addresses).is_some() {
                        options.insert("nat-addresses".into(), nat_addresses.to_string());
                    } else {
                        event!(Level::WARN, "Error extracting nat-addresses.");
                    }
                },
                None => (),
            }
        }
        parent_port = nbsp.parent_name.clone();
        tag = nbsp.tag;
        mac = nbsp.addresses.clone();
    } else {
        return Ok(());
    }

    ctx.sb.write("Port_Binding", &sb, "datapath", Datum::scalar(od.sb))?;
    ctx.sb.write("Port_Binding", &sb, "type", Datum::scalar(type_))?;
    ctx.sb.write("Port_Binding", &sb, "options", Datum::map(options.clone()))?;
    ctx.sb.write("Port_Binding", &sb, "parent_port", Datum::optional(parent_port))?;
    ctx.sb.write("Port_Binding", &sb, "tag", Datum::optional(tag))?;
    ctx.sb.write("Port_Binding", &sb, "mac", Datum::set(mac))?;
    ports[index].sb_options = options;
    Ok(())
}

/// Allocates a new tag for switch port `index` if it needs one.
fn assign_tag(ctx: &mut NorthdContext, ports: &mut Ports, index: usize) -> Result<()> {
    let nbsp = match &mut ports[index].nbsp {
        Some(nbsp) => nbsp,
        None => return Ok(()),
    };
    if let Some(tag) = ctx.tags.create_new_tag(nbsp) {
        ctx.nb.write("Logical_Switch_Port", &nbsp.uuid, "tag", Datum::scalar(tag))?;
        nbsp.tag = Some(tag);
    }
    Ok(())
}

/// Deletes `MAC_Binding` rows for ports that no longer exist.
pub fn cleanup_mac_bindings(ctx: &mut NorthdContext, ports: &Ports) -> Result<()> {
    for binding in MacBinding::read_all(ctx.sb_idl()) {
        if ports.find(&binding.logical_port).is_none() {
            ctx.sb.delete("MAC_Binding", &binding.uuid)?;
        }
    }
    Ok(())
}

/// Makes the `Port_Binding` table contain one row per logical port, and returns the
/// ports.
pub fn build_ports(ctx: &mut NorthdContext, datapaths: &mut Datapaths) -> Result<Ports> {
    let JoinedPorts { mut ports, nb_only, both, sb_only } = join_logical_ports(ctx, datapaths)?;

    for &index in &both {
        assign_tag(ctx, &mut ports, index)?;
        ovn_port_update_sbrec(ctx, datapaths, &mut ports, index)?;

        let tunnel_key = ports[index].sb_old.as_ref().map_or(0, |sb| sb.tunnel_key as u32);
        ports[index].tunnel_key = tunnel_key;
        let od = &mut datapaths[ports[index].od];
        od.port_tnlids.insert(tunnel_key);
        od.port_key_hint = od.port_key_hint.max(tunnel_key);
    }

    for &index in &nb_only {
        assign_tag(ctx, &mut ports, index)?;

        let od = &mut datapaths[ports[index].od];
        let tunnel_key = allocate_tnlid(&mut od.port_tnlids, "port", MAX_PORT_TUNNEL_KEY,
                                        &mut od.port_key_hint);
        if tunnel_key == 0 {
            continue;
        }

        let uuid = ctx.sb.insert("Port_Binding", None)?;
        ports[index].sb = Some(uuid);
        ports[index].tunnel_key = tunnel_key;
        ovn_port_update_sbrec(ctx, datapaths, &mut ports, index)?;
        ctx.sb.write("Port_Binding", &uuid, "logical_port", Datum::scalar(ports[index].key.as_str()))?;
        ctx.sb.write("Port_Binding", &uuid, "tunnel_key", Datum::scalar(tunnel_key as i64))?;
    }

    for sb in &sb_only {
        ctx.sb.delete("Port_Binding", &sb.uuid)?;
    }
    if !sb_only.is_empty() {
        cleanup_mac_bindings(ctx, &ports)?;
    }

    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::build_datapaths;
    use ovn::nb::nb_class;
    use ovn::sb::sb_class;
    use ovsdb_client::testing::TestServer;
    use serde_json::json;
    use tracing_test::traced_test;

    fn lsp(name: &str, parent_name: Option<&str>, tag_request: Option<i64>, tag: Option<i64>)
           -> LogicalSwitchPort {
        LogicalSwitchPort {
            uuid: Uuid::new_v4(),
            name: name.into(),
            type_: String::new(),
            options: BTreeMap::new(),
            parent_name: parent_name.map(String::from),
            tag_request,
            tag,
            addresses: Vec::new(),
            dynamic_addresses: None,
            port_security: Vec::new(),
            up: None,
            enabled: None,
            dhcpv4_options: None,
            dhcpv6_options: None,
        }
    }

    #[test]
    fn tags() {
        let mut tags = TagAlloc::default();
        tags.add_existing(&lsp("c1", Some("vm1"), Some(0), Some(1)));

        assert_eq!(tags.create_new_tag(&lsp("c2", Some("vm1"), Some(0), None)), Some(2));
        assert_eq!(tags.create_new_tag(&lsp("c3", Some("vm2"), Some(0), None)), Some(1));
        assert_eq!(tags.create_new_tag(&lsp("c1", Some("vm1"), Some(0), Some(1))), None);
        assert_eq!(tags.create_new_tag(&lsp("c4", Some("vm1"), Some(7), None)), Some(7));
        assert_eq!(tags.create_new_tag(&lsp("c4", Some("vm1"), Some(7), Some(7))), None);
        assert_eq!(tags.create_new_tag(&lsp("c5", None, None, None)), None);
    }

    #[traced_test]
    #[test]
    fn queues() {
        let chassis = Uuid::new_v4();
        let mut queues = ChassisQueues::default();
        queues.add(chassis, 1);
        assert_eq!(queues.allocate(chassis), Some(2));
        queues.free(chassis, 1);
        assert_eq!(queues.allocate(chassis), Some(1));
        assert_eq!(queues.allocate(Uuid::new_v4()), Some(1));

        for queue_id in 3..=QDISC_MAX_QUEUE_ID as u32 {
            queues.add(chassis, queue_id);
        }
        assert_eq!(queues.allocate(chassis), None);
        queues.free(chassis, 4000);
        assert_eq!(queues.allocate(chassis), Some(4000));
        assert!(logs_contain("queue ids exhausted"));
    }

    #[traced_test]
    #[test]
    fn bind_ports() -> Result<()> {
        let nb_server = TestServer::new(&nb_class());
        let sb_server = TestServer::new(&sb_class());
        nb_server.transact(json!([
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm1",
             "row": {"name": "vm1", "addresses": "00:00:00:00:00:01 10.0.0.2"}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "c1",
             "row": {"name": "c1", "parent_name": "vm1", "tag_request": 0,
                     "addresses": "00:00:00:00:00:02"}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "rp",
             "row": {"name": "sw0-lr0", "type": "router", "addresses": "router",
                     "options": ["map", [["router-port", "lrp0"], ["nat-addresses", "router"]]]}},
            {"op": "insert", "table": "Logical_Switch", "row": {"name": "sw0",
             "ports": ["set", [["named-uuid", "vm1"], ["named-uuid", "c1"], ["named-uuid", "rp"]]]}},
            {"op": "insert", "table": "NAT", "uuid-name": "nat",
             "row": {"type": "snat", "external_ip": "203.0.113.1", "logical_ip": "10.0.0.0/24"}},
            {"op": "insert", "table": "Logical_Router_Port", "uuid-name": "lrp0",
             "row": {"name": "lrp0", "mac": "00:00:00:00:ff:01", "networks": "10.0.0.1/24"}},
            {"op": "insert", "table": "Logical_Router_Port", "uuid-name": "lrp1",
             "row": {"name": "lrp1", "mac": "00:00:00:00:ff:02", "networks": "172.16.0.1/24",
                     "options": ["map", [["redirect-chassis", "hv1"]]]}},
            {"op": "insert", "table": "Logical_Router", "row": {"name": "lr0",
             "ports": ["set", [["named-uuid", "lrp0"], ["named-uuid", "lrp1"]]],
             "nat": ["named-uuid", "nat"]}},
        ]));
        sb_server.transact(json!([
            {"op": "insert", "table": "Port_Binding", "row": {"logical_port": "stale", "tunnel_key": 9}},
            {"op": "insert", "table": "MAC_Binding",
             "row": {"logical_port": "stale", "ip": "10.0.0.9", "mac": "00:00:00:00:00:09"}},
        ]));

        let mut nb_idl = nb_server.idl(true);
        let mut sb_idl = sb_server.idl(true);
        nb_idl.run();
        sb_idl.run();

        let mut nb_txn = nb_idl.txn_create();
        let mut sb_txn = sb_idl.txn_create();
        {
            let mut ctx = NorthdContext::new(&mut nb_txn, &mut sb_txn);
            let mut datapaths = build_datapaths(&mut ctx)?;
            let ports = build_ports(&mut ctx, &mut datapaths)?;
            assert_eq!(ports.len(), 6);

            let lrp0 = ports.find("lrp0").unwrap();
            let rp = ports.find("sw0-lr0").unwrap();
            assert_eq!(ports[lrp0].peer, Some(rp));
            assert_eq!(ports[rp].peer, Some(lrp0));
            assert_eq!(ports[rp].lsp_addrs[0].ea_s(), "00:00:00:00:ff:01");
            assert_eq!(ports[rp].sb_options.get("nat-addresses").map(String::as_str),
                       Some("00:00:00:00:ff:01 203.0.113.1"));

            let cr = ports.find("cr-lrp1").unwrap();
            assert!(ports[cr].derived);
            let lr0 = datapaths.iter().position(|od| od.name() == "lr0").unwrap();
            assert_eq!(datapaths[lr0].l3redirect_port, Some(cr));

            let keys: BTreeSet<u32> = ports.of_datapath(lr0).map(|op| op.tunnel_key).collect();
            assert_eq!(keys.len(), 3);
        }
        nb_txn.commit();
        sb_txn.commit();
        nb_idl.run();
        sb_idl.run();

        assert_eq!(sb_server.row_count("Port_Binding"), 6);
        assert_eq!(sb_server.row_count("MAC_Binding"), 0);
        let binding = |name: &str| sb_server.rows("Port_Binding").into_iter()
            .find(|row| row["logical_port"].as_str() == Some(name))
            .unwrap();
        assert_eq!(binding("sw0-lr0")["type"].as_str(), Some("patch"));
        assert_eq!(binding("lrp0")["options"].map_str("peer"), Some("sw0-lr0"));
        assert_eq!(binding("cr-lrp1")["type"].as_str(), Some("chassisredirect"));
        assert_eq!(binding("cr-lrp1")["options"].map_str("distributed-port"), Some("lrp1"));
        assert_eq!(binding("c1")["parent_port"].as_str(), Some("vm1"));
        assert_eq!(binding("c1")["tag"].as_integer(), Some(1));

        let c1 = nb_server.rows("Logical_Switch_Port").into_iter()
            .find(|row| row["name"].as_str() == Some("c1"))
            .unwrap();
        assert_eq!(c1["tag"].as_integer(), Some(1));
        Ok(())
    }
}
