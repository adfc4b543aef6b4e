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

//! Logical flows for logical routers.

use std::collections::BTreeSet;
use std::fmt::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use itertools::Itertools;
use ovn::addresses::{parse_ipv4_cidr, parse_ipv6_cidr, EthAddr, Ipv4Netaddr, Ipv6Netaddr};
use ovn::nb::{LogicalRouterStaticRoute, Nat};
use tracing::{event, Level};
use uuid::Uuid;

use crate::datapath::{Datapaths, OvnDatapath};
use crate::lb::{ip_address_and_port_from_lb_key, lb_vip_ips};
use crate::port::{OvnPort, Ports};
use crate::stage::{LflowTable, Stage};

/// Set when a packet must go to the redirect-chassis of a distributed router for NAT.
pub const REGBIT_NAT_REDIRECT: &str = "reg9[0]";
/// Set on packets that the egress pipeline sent back to the ingress pipeline.
pub const REGBIT_EGRESS_LOOPBACK: &str = "reg9[1]";

const MFF_N_LOG_REGS: usize = 10;

/// The IPv4 addresses of router port `op` as a match operand, optionally with the
/// broadcast address of each network.
fn op_put_v4_networks(op: &OvnPort, add_bcast: bool) -> String {
    let addrs = &op.lrp_networks.ipv4_addrs;
    if !add_bcast && addrs.len() == 1 {
        return addrs[0].addr().to_string();
    }
    let items = addrs.iter()
        .flat_map(|addr| {
            let mut items = vec![addr.addr().to_string()];
            if add_bcast {
                items.push(addr.bcast().to_string());
            }
            items
        })
        .join(", ");
    format!("{{{}}}", items)
}

fn op_put_v6_networks(op: &OvnPort) -> String {
    let addrs = &op.lrp_networks.ipv6_addrs;
    if addrs.len() == 1 {
        return addrs[0].addr().to_string();
    }
    format!("{{{}}}", addrs.iter().map(|addr| addr.addr()).join(", "))
}

/// Limits a flow for port `index` to the redirect-chassis, if the port is the distributed
/// gateway port of `od`.
fn redirect_resident(index: usize, od: &OvnDatapath, ports: &Ports) -> String {
    match (od.l3dgw_port, od.l3redirect_port) {
        (Some(l3dgw), Some(redirect)) if l3dgw == index => {
            format!(" && is_chassis_resident({})", ports[redirect].json_key)
        },
        _ => String::new(),
    }
}

/// Reads `options:dnat_force_snat_ip` or `options:lb_force_snat_ip` of a router, which must
/// be a single IPv4 address.
fn get_force_snat_ip<'a>(od: &'a OvnDatapath, key_type: &str) -> Option<(Ipv4Addr, &'a str)> {
    let nbr = od.nbr.as_ref()?;
    let ip_address = nbr.options.get(&format!("{}_force_snat_ip", key_type))?;
    match parse_ipv4_cidr(ip_address) {
        Some((ip, 32)) => Some((ip, ip_address.as_str())),
        _ => {
            event!(Level::WARN, "bad ip {} in options of router {}", ip_address, od.key);
            None
        }
    }
}

/// Returns the address of router port `op` that is on the same network as `ip_s`.
fn find_lrp_member_ip(op: &OvnPort, ip_s: &str) -> Option<String> {
    if ip_s.contains('.') {
        let ip = match ip_s.parse::<Ipv4Addr>() {
            Ok(ip) => u32::from(ip),
            Err(_) => {
                event!(Level::WARN, "bad ip address {}", ip_s);
                return None;
            }
        };
        // The networks of a router's ports must not overlap, so at most one matches.
        op.lrp_networks.ipv4_addrs.iter()
            .find(|na| (u32::from(na.network()) ^ ip) & u32::from(na.mask()) == 0)
            .map(|na| na.addr().to_string())
    } else {
        let ip = match ip_s.parse::<Ipv6Addr>() {
            Ok(ip) => u128::from(ip),
            Err(_) => {
                event!(Level::WARN, "bad ipv6 address {}", ip_s);
                return None;
            }
        };
        op.lrp_networks.ipv6_addrs.iter()
            .find(|na| (u128::from(na.network()) ^ ip) & u128::from(na.mask()) == 0)
            .map(|na| na.addr().to_string())
    }
}

fn is_lla(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

/// Adds a routing flow that sends traffic for `network/plen` out of router port `op`,
/// toward `gateway` or directly to the destination.  Longer prefixes get higher priority.
fn add_route(lflows: &mut LflowTable, datapath: Uuid, op: &OvnPort, lrp_addr: &str,
             network: IpAddr, plen: u8, gateway: Option<&str>, policy: Option<&str>) {
    let (dir, priority) = match policy {
        Some("src-ip") => ("src", plen as u16 * 2),
        _ => ("dst", plen as u16 * 2 + 1),
    };

    let mut match_ = String::new();
    let (ip_ver, xx) = match network {
        IpAddr::V4(_) => ("4", ""),
        IpAddr::V6(network) => {
            // Link-local networks are only reachable through the port they are on.
            if is_lla(&network) {
                let _ = write!(match_, "inport == {} && ", op.json_key);
            }
            ("6", "xx")
        }
    };
    let _ = write!(match_, "ip{}.{} == {}/{}", ip_ver, dir, network, plen);

    let next_hop = match gateway {
        Some(gateway) => gateway.to_string(),
        None => format!("ip{}.dst", ip_ver),
    };
    let actions = format!("ip.ttl--; {xx}reg0 = {}; {xx}reg1 = {}; eth.src = {}; outport = {}; \
                           flags.loopback = 1; next;",
                          next_hop, lrp_addr, op.lrp_networks.ea_s(), op.json_key, xx = xx);
    lflows.add(datapath, Stage::LrInIpRouting, priority, match_, actions);
}

fn build_static_route_flow(od: &OvnDatapath, ports: &Ports, route: &LogicalRouterStaticRoute,
                           lflows: &mut LflowTable) {
    // The next hop must be a single address.
    let is_ipv4 = if let Some((_, plen)) = parse_ipv4_cidr(&route.nexthop) {
        if plen != 32 {
            event!(Level::WARN, "bad next hop mask {}", route.nexthop);
            return;
        }
        true
    } else if let Some((_, plen)) = parse_ipv6_cidr(&route.nexthop) {
        if plen != 128 {
            event!(Level::WARN, "bad next hop mask {}", route.nexthop);
            return;
        }
        false
    } else {
        event!(Level::WARN, "bad next hop ip address {}", route.nexthop);
        return;
    };

    let prefix = if is_ipv4 {
        parse_ipv4_cidr(&route.ip_prefix)
            .and_then(|(addr, plen)| Ipv4Netaddr::new(addr, plen))
            .map(|na| (IpAddr::V4(na.network()), na.plen()))
    } else {
        parse_ipv6_cidr(&route.ip_prefix)
            .and_then(|(addr, plen)| Ipv6Netaddr::new(addr, plen))
            .map(|na| (IpAddr::V6(na.network()), na.plen()))
    };
    let (prefix, plen) = match prefix {
        Some(prefix) => prefix,
        None => {
            event!(Level::WARN, "bad 'ip_prefix' in static routes {}", route.ip_prefix);
            return;
        }
    };

    let out = match &route.output_port {
        Some(output_port) => {
            let out_port = match ports.find(output_port) {
                Some(out_port) => out_port,
                None => {
                    event!(Level::WARN, "Bad out port {} for static route {}",
                           output_port, route.ip_prefix);
                    return;
                }
            };
            find_lrp_member_ip(&ports[out_port], &route.nexthop).map(|addr| (out_port, addr))
        },
        None => {
            // Use the router port on the next hop's network.
            od.nbr.iter()
                .flat_map(|nbr| nbr.ports.iter())
                .filter_map(|lrp| ports.find(&lrp.name))
                .find_map(|out_port| {
                    find_lrp_member_ip(&ports[out_port], &route.nexthop).map(|addr| (out_port, addr))
                })
        }
    };
    let (out_port, lrp_addr) = match out {
        Some(out) => out,
        None => {
            event!(Level::WARN, "No path for static route {}; next hop {}",
                   route.ip_prefix, route.nexthop);
            return;
        }
    };

    let policy = route.policy.as_deref().unwrap_or("dst-ip");
    add_route(lflows, od.key, &ports[out_port], &lrp_addr, prefix, plen,
              Some(&route.nexthop), Some(policy));
}

fn add_router_lb_flow(lflows: &mut LflowTable, od: &OvnDatapath, match_: &str, actions: &str,
                      priority: u16, force_snat: bool) {
    let force = if force_snat { "flags.force_snat_for_lb = 1; " } else { "" };
    lflows.add(od.key, Stage::LrInDnat, priority, format!("ct.new && {}", match_),
               format!("{}{}", force, actions));
    lflows.add(od.key, Stage::LrInDnat, priority, format!("ct.est && {}", match_),
               format!("{}ct_dnat;", force));
}

/// Admission control: a router accepts only multicast and frames addressed to the port
/// they arrive on.
fn build_admission(datapaths: &Datapaths, ports: &Ports, lflows: &mut LflowTable) {
    for od in datapaths.iter().filter(|od| od.nbr.is_some()) {
        lflows.add(od.key, Stage::LrInAdmission, 100, "vlan.present || eth.src[40]", "drop;");
    }

    for (index, op) in ports.iter().enumerate() {
        if op.nbrp.is_none() || !op.is_enabled() || op.derived {
            continue;
        }
        let od = &datapaths[op.od];
        lflows.add(od.key, Stage::LrInAdmission, 50,
                   format!("eth.mcast && inport == {}", op.json_key), "next;");
        lflows.add(od.key, Stage::LrInAdmission, 50,
                   format!("eth.dst == {} && inport == {}{}", op.lrp_networks.ea_s(), op.json_key,
                           redirect_resident(index, od, ports)),
                   "next;");
    }
}

/// An ARP reply from router port `op` that claims `ip` for `ea`.
fn arp_reply_actions(op: &OvnPort, ea: &str, ip: &str) -> String {
    format!("eth.dst = eth.src; eth.src = {ea}; arp.op = 2; /* ARP reply */ arp.tha = arp.sha; \
             arp.sha = {ea}; arp.tpa = arp.spa; arp.spa = {}; outport = {}; flags.loopback = 1; \
             output;",
            ip, op.json_key, ea = ea)
}

/// IPv4 input for router port `index`: sanity checks, ICMP echo, and ARP for the router's
/// own addresses, load balancer VIPs, and NAT addresses.
fn build_ipv4_input(index: usize, od: &OvnDatapath, ports: &Ports, lflows: &mut LflowTable) {
    let op = &ports[index];
    let nbr = match &od.nbr {
        Some(nbr) => nbr,
        None => return,
    };
    let ea_s = op.lrp_networks.ea_s();

    if !op.lrp_networks.ipv4_addrs.is_empty() {
        // Martian source: packets claiming to come from the router itself.
        lflows.add(od.key, Stage::LrInIpInput, 100,
                   format!("ip4.src == {} && {} == 0", op_put_v4_networks(op, true),
                           REGBIT_EGRESS_LOOPBACK),
                   "drop;");

        lflows.add(od.key, Stage::LrInIpInput, 90,
                   format!("ip4.dst == {} && icmp4.type == 8 && icmp4.code == 0",
                           op_put_v4_networks(op, false)),
                   "ip4.dst <-> ip4.src; ip.ttl = 255; icmp4.type = 0; flags.loopback = 1; next; ");
    }

    for addr in &op.lrp_networks.ipv4_addrs {
        let addr_s = addr.addr().to_string();
        lflows.add(od.key, Stage::LrInIpInput, 90,
                   format!("inport == {} && arp.tpa == {} && arp.op == 1{}", op.json_key, addr_s,
                           redirect_resident(index, od, ports)),
                   arp_reply_actions(op, &ea_s, &addr_s));
    }

    for ip in lb_vip_ips(&nbr.load_balancer).into_iter().filter(|ip| !ip.is_unspecified()) {
        let ip_s = ip.to_string();
        lflows.add(od.key, Stage::LrInIpInput, 90,
                   format!("inport == {} && arp.tpa == {} && arp.op == 1", op.json_key, ip_s),
                   arp_reply_actions(op, &ea_s, &ip_s));
    }

    let mut snat_ips: Vec<Ipv4Addr> = ["dnat", "lb"].iter()
        .filter_map(|key_type| get_force_snat_ip(od, key_type))
        .map(|(ip, _)| ip)
        .collect();
    for nat in &nbr.nat {
        let ip = match nat.external_ip.parse::<Ipv4Addr>() {
            Ok(ip) if !ip.is_unspecified() => ip,
            _ => {
                event!(Level::WARN, "bad ip address {} in nat configuration for router {}",
                       nat.external_ip, op.key);
                continue;
            }
        };
        if nat.type_ == "snat" {
            snat_ips.push(ip);
            continue;
        }

        // ARP for a DNAT address.  On a distributed gateway port, a NAT rule with its own
        // MAC is answered where its logical port resides.
        let mut match_ = format!("inport == {} && arp.tpa == {} && arp.op == 1", op.json_key, ip);
        let mut actions = String::from("eth.dst = eth.src; arp.op = 2; /* ARP reply */ arp.tha = arp.sha; ");
        let external_mac = nat.external_mac.as_deref().and_then(|mac| mac.parse::<EthAddr>().ok());
        match (od.l3dgw_port == Some(index), external_mac, &nat.logical_port) {
            (true, Some(mac), Some(logical_port)) => {
                let _ = write!(actions, "eth.src = {mac}; arp.sha = {mac}; ", mac = mac);
                let _ = write!(match_, " && is_chassis_resident(\"{}\")", logical_port);
            },
            _ => {
                let _ = write!(actions, "eth.src = {ea}; arp.sha = {ea}; ", ea = ea_s);
                match_.push_str(&redirect_resident(index, od, ports));
            }
        }
        let _ = write!(actions, "arp.tpa = arp.spa; arp.spa = {}; outport = {}; flags.loopback = 1; output;",
                       ip, op.json_key);
        lflows.add(od.key, Stage::LrInIpInput, 90, match_, actions);
    }

    // Drop other traffic for the router's own addresses, except those it uses for SNAT.
    let drop_ips: Vec<String> = op.lrp_networks.ipv4_addrs.iter()
        .map(|addr| addr.addr())
        .filter(|addr| !snat_ips.contains(addr))
        .map(|addr| addr.to_string())
        .collect();
    if !drop_ips.is_empty() {
        lflows.add(od.key, Stage::LrInIpInput, 60, format!("ip4.dst == {{{}}}", drop_ips.join(", ")),
                   "drop;");
    }
}

fn build_ipv6_input(index: usize, od: &OvnDatapath, ports: &Ports, lflows: &mut LflowTable) {
    let op = &ports[index];
    if op.lrp_networks.ipv6_addrs.is_empty() {
        return;
    }
    let networks = op_put_v6_networks(op);
    lflows.add(od.key, Stage::LrInIpInput, 100, format!("ip6.src == {}", networks), "drop;");
    lflows.add(od.key, Stage::LrInIpInput, 90,
               format!("ip6.dst == {} && icmp6.type == 128 && icmp6.code == 0", networks),
               "ip6.dst <-> ip6.src; ip.ttl = 255; icmp6.type = 129; flags.loopback = 1; next; ");
    lflows.add(od.key, Stage::LrInIpInput, 60, format!("ip6.dst == {}", networks), "drop;");

    let ea_s = op.lrp_networks.ea_s();
    for addr in &op.lrp_networks.ipv6_addrs {
        lflows.add(od.key, Stage::LrInIpInput, 90,
                   format!("inport == {} && nd_ns && ip6.dst == {{{addr}, {}}} && nd.target == {addr}{}",
                           op.json_key, addr.sn_addr(), redirect_resident(index, od, ports),
                           addr = addr.addr()),
                   format!("put_nd(inport, ip6.src, nd.sll); nd_na {{ eth.src = {ea}; ip6.src = {addr}; \
                            nd.target = {addr}; nd.tll = {ea}; outport = inport; flags.loopback = 1; \
                            output; }};",
                           ea = ea_s, addr = addr.addr()));
    }
}

fn build_ip_input(datapaths: &Datapaths, ports: &Ports, lflows: &mut LflowTable) {
    for od in datapaths.iter().filter(|od| od.nbr.is_some()) {
        lflows.add(od.key, Stage::LrInIpInput, 100,
                   "ip4.mcast || ip4.src == 255.255.255.255 || ip4.src == 127.0.0.0/8 || \
                    ip4.dst == 127.0.0.0/8 || ip4.src == 0.0.0.0/8 || ip4.dst == 0.0.0.0/8",
                   "drop;");
        lflows.add(od.key, Stage::LrInIpInput, 90, "arp.op == 2", "put_arp(inport, arp.spa, arp.sha);");
        lflows.add(od.key, Stage::LrInIpInput, 50, "eth.bcast", "drop;");
        lflows.add(od.key, Stage::LrInIpInput, 30, "ip4 && ip.ttl == {0, 1}", "drop;");
        lflows.add(od.key, Stage::LrInIpInput, 90, "nd_na", "put_nd(inport, nd.target, nd.tll);");
        lflows.add(od.key, Stage::LrInIpInput, 80, "nd_ns", "put_nd(inport, ip6.src, nd.sll);");
        lflows.add(od.key, Stage::LrInIpInput, 0, "1", "next;");
    }

    for (index, op) in ports.iter().enumerate() {
        if op.nbrp.is_none() || op.derived {
            continue;
        }
        let od = &datapaths[op.od];
        build_ipv4_input(index, od, ports, lflows);
        build_ipv6_input(index, od, ports, lflows);
    }
}

/// Flows for one NAT rule of a gateway router or of a router with a distributed gateway
/// port.
fn build_nat_rule(od: &OvnDatapath, ports: &Ports, nat: &Nat, dnat_force_snat: bool,
                  lflows: &mut LflowTable) {
    match parse_ipv4_cidr(&nat.external_ip) {
        Some((_, 32)) => (),
        _ => {
            event!(Level::WARN, "bad external ip {} for nat", nat.external_ip);
            return;
        }
    }

    let is_snat = nat.type_ == "snat" || nat.type_ == "dnat_and_snat";
    let is_dnat = nat.type_ == "dnat" || nat.type_ == "dnat_and_snat";

    let plen = match (nat.type_.as_str(), parse_ipv4_cidr(&nat.logical_ip)) {
        ("snat", Some((_, plen))) => plen,
        ("snat", None) => {
            event!(Level::WARN, "bad ip network or ip {} for snat in router {}", nat.logical_ip, od.key);
            return;
        },
        (_, Some((_, 32))) => 32,
        _ => {
            event!(Level::WARN, "bad ip {} for dnat in router {}", nat.logical_ip, od.key);
            return;
        }
    };

    let l3dgw = od.l3dgw_port.map(|index| &ports[index]);
    let redirect = od.l3redirect_port.map(|index| &ports[index]);

    // A dnat_and_snat rule with a logical port and MAC of its own is handled on the
    // chassis where the logical port resides, not on the redirect-chassis.
    let mut distributed_mac = None;
    if let (Some(_), "dnat_and_snat", Some(_), Some(external_mac)) =
        (l3dgw, nat.type_.as_str(), &nat.logical_port, &nat.external_mac) {
        match external_mac.parse::<EthAddr>() {
            Ok(mac) => distributed_mac = Some(mac),
            Err(_) => {
                event!(Level::WARN, "bad mac {} for dnat in router {}", external_mac, od.key);
                return;
            }
        }
    }
    let resident = match redirect {
        Some(redirect) if distributed_mac.is_none() => {
            format!(" && is_chassis_resident({})", redirect.json_key)
        },
        _ => String::new(),
    };
    let eth_src = distributed_mac.map_or_else(String::new, |mac| format!("eth.src = {}; ", mac));

    if is_snat {
        match l3dgw {
            None => {
                lflows.add(od.key, Stage::LrInUnsnat, 90, format!("ip && ip4.dst == {}", nat.external_ip),
                           "ct_snat; next;");
            },
            Some(l3dgw) => {
                lflows.add(od.key, Stage::LrInUnsnat, 100,
                           format!("ip && ip4.dst == {} && inport == {}{}", nat.external_ip,
                                   l3dgw.json_key, resident),
                           "ct_snat;");
                lflows.add(od.key, Stage::LrInUnsnat, 50, format!("ip && ip4.dst == {}", nat.external_ip),
                           format!("{} = 1; next;", REGBIT_NAT_REDIRECT));
            }
        }
    }

    if is_dnat {
        match l3dgw {
            None => {
                let force = if dnat_force_snat { "flags.force_snat_for_dnat = 1; " } else { "" };
                lflows.add(od.key, Stage::LrInDnat, 100, format!("ip && ip4.dst == {}", nat.external_ip),
                           format!("{}flags.loopback = 1; ct_dnat({});", force, nat.logical_ip));
            },
            Some(l3dgw) => {
                lflows.add(od.key, Stage::LrInDnat, 100,
                           format!("ip && ip4.dst == {} && inport == {}{}", nat.external_ip,
                                   l3dgw.json_key, resident),
                           format!("ct_dnat({});", nat.logical_ip));
                lflows.add(od.key, Stage::LrInDnat, 50, format!("ip && ip4.dst == {}", nat.external_ip),
                           format!("{} = 1; next;", REGBIT_NAT_REDIRECT));
                lflows.add(od.key, Stage::LrOutUndnat, 100,
                           format!("ip && ip4.src == {} && outport == {}{}", nat.logical_ip,
                                   l3dgw.json_key, resident),
                           format!("{}ct_dnat;", eth_src));
            }
        }
    }

    // More specific logical networks take precedence.
    if is_snat {
        let priority = plen as u16 + 1;
        match l3dgw {
            None => {
                lflows.add(od.key, Stage::LrOutSnat, priority, format!("ip && ip4.src == {}", nat.logical_ip),
                           format!("ct_snat({});", nat.external_ip));
            },
            Some(l3dgw) => {
                lflows.add(od.key, Stage::LrOutSnat, priority,
                           format!("ip && ip4.src == {} && outport == {}{}", nat.logical_ip,
                                   l3dgw.json_key, resident),
                           format!("{}ct_snat({});", eth_src, nat.external_ip));
            }
        }
    }

    if let Some(l3dgw) = l3dgw {
        if let (Some(mac), Some(logical_port)) = (distributed_mac, &nat.logical_port) {
            lflows.add(od.key, Stage::LrInAdmission, 50,
                       format!("eth.dst == {} && inport == {} && is_chassis_resident(\"{}\")",
                               mac, l3dgw.json_key, logical_port),
                       "next;");
            lflows.add(od.key, Stage::LrInGwRedirect, 100,
                       format!("ip4.src == {} && outport == {}", nat.logical_ip, l3dgw.json_key),
                       "next;");
        }

        // Traffic from one NAT address to another re-enters the router so that it gets
        // both translations.
        let regs: String = (0..MFF_N_LOG_REGS).map(|i| format!("reg{} = 0; ", i)).collect();
        lflows.add(od.key, Stage::LrOutEgrLoop, 100,
                   format!("ip4.dst == {} && outport == {}", nat.external_ip, l3dgw.json_key),
                   format!("clone {{ ct_clear; inport = outport; outport = \"\"; flags = 0; \
                            flags.loopback = 1; {}{} = 1; next(pipeline=ingress, table=0); }};",
                           regs, REGBIT_EGRESS_LOOPBACK));
    }
}

/// NAT, load balancing, and defragmentation for routers that can do them: gateway routers,
/// and routers with a distributed gateway port.
fn build_nat_flows(od: &OvnDatapath, ports: &Ports, lflows: &mut LflowTable) {
    let nbr = match &od.nbr {
        Some(nbr) => nbr,
        None => return,
    };
    for stage in [Stage::LrInDefrag, Stage::LrInUnsnat, Stage::LrOutSnat, Stage::LrInDnat,
                  Stage::LrOutUndnat, Stage::LrOutEgrLoop] {
        lflows.add(od.key, stage, 0, "1", "next;");
    }

    let gateway = od.gateway_chassis().is_some();
    if !gateway && od.l3dgw_port.is_none() {
        return;
    }

    let dnat_force_snat_ip = get_force_snat_ip(od, "dnat").map(|(_, ip)| ip);
    let lb_force_snat_ip = get_force_snat_ip(od, "lb").map(|(_, ip)| ip);

    for nat in &nbr.nat {
        build_nat_rule(od, ports, nat, dnat_force_snat_ip.is_some(), lflows);
    }

    match (od.l3dgw_port, od.l3redirect_port) {
        (Some(l3dgw), Some(redirect)) => {
            lflows.add(od.key, Stage::LrInIpRouting, 300, format!("{} == 1", REGBIT_NAT_REDIRECT),
                       "ip.ttl--; next;");
            lflows.add(od.key, Stage::LrInArpResolve, 200, format!("{} == 1", REGBIT_NAT_REDIRECT),
                       format!("eth.dst = {}; next;", ports[l3dgw].lrp_networks.ea_s()));
            lflows.add(od.key, Stage::LrInGwRedirect, 200, format!("{} == 1", REGBIT_NAT_REDIRECT),
                       format!("outport = {}; next;", ports[redirect].json_key));
        },
        _ => {
            for (key_type, ip) in [("dnat", dnat_force_snat_ip), ("lb", lb_force_snat_ip)] {
                let ip = match ip {
                    Some(ip) => ip,
                    None => continue,
                };
                let priority = if key_type == "dnat" { 110 } else { 100 };
                lflows.add(od.key, Stage::LrInUnsnat, priority, format!("ip && ip4.dst == {}", ip),
                           "ct_snat; next;");
                lflows.add(od.key, Stage::LrOutSnat, 100,
                           format!("flags.force_snat_for_{} == 1 && ip", key_type),
                           format!("ct_snat({});", ip));
            }
            lflows.add(od.key, Stage::LrInDnat, 50, "ip", "flags.loopback = 1; ct_dnat;");
        }
    }

    if !gateway {
        return;
    }

    let mut all_ips = BTreeSet::new();
    for lb in &nbr.load_balancer {
        for (key, backends) in &lb.vips {
            let (ip, port) = match ip_address_and_port_from_lb_key(key) {
                Some(vip) => vip,
                None => continue,
            };
            all_ips.insert(ip);

            let actions = format!("ct_lb({});", backends);
            let mut match_ = format!("ip && ip4.dst == {}", ip);
            let priority = if port != 0 {
                let proto = if lb.protocol.as_deref() == Some("udp") { "udp" } else { "tcp" };
                let _ = write!(match_, " && {proto} && {proto}.dst == {}", port, proto = proto);
                120
            } else {
                110
            };
            add_router_lb_flow(lflows, od, &match_, &actions, priority, lb_force_snat_ip.is_some());
        }
    }

    // Reassemble fragments so that load balancing can see the L4 ports.
    for ip in all_ips {
        lflows.add(od.key, Stage::LrInDefrag, 100, format!("ip && ip4.dst == {}", ip), "ct_next;");
    }
}

/// Routes to the networks of each router port and the static routes of each router.
fn build_routing(datapaths: &Datapaths, ports: &Ports, lflows: &mut LflowTable) {
    for op in ports.iter().filter(|op| op.nbrp.is_some()) {
        let datapath = datapaths[op.od].key;
        for addr in &op.lrp_networks.ipv4_addrs {
            add_route(lflows, datapath, op, &addr.addr().to_string(), IpAddr::V4(addr.network()),
                      addr.plen(), None, None);
        }
        for addr in &op.lrp_networks.ipv6_addrs {
            add_route(lflows, datapath, op, &addr.addr().to_string(), IpAddr::V6(addr.network()),
                      addr.plen(), None, None);
        }
    }

    for od in datapaths.iter() {
        if let Some(nbr) = &od.nbr {
            for route in &nbr.static_routes {
                build_static_route_flow(od, ports, route, lflows);
            }
        }
    }
}

/// ARP resolution flow in the router of `router_port` for the addresses of `target`, a
/// router port reachable through it.
fn add_router_port_arp_resolve(datapaths: &Datapaths, router_port: &OvnPort, target: &OvnPort,
                               lflows: &mut LflowTable) {
    let datapath = datapaths[router_port.od].key;
    let actions = format!("eth.dst = {}; next;", target.lrp_networks.ea_s());
    if !target.lrp_networks.ipv4_addrs.is_empty() {
        lflows.add(datapath, Stage::LrInArpResolve, 100,
                   format!("outport == {} && reg0 == {}", router_port.json_key,
                           op_put_v4_networks(target, false)),
                   actions.as_str());
    }
    if !target.lrp_networks.ipv6_addrs.is_empty() {
        lflows.add(datapath, Stage::LrInArpResolve, 100,
                   format!("outport == {} && xxreg0 == {}", router_port.json_key,
                           op_put_v6_networks(target)),
                   actions.as_str());
    }
}

/// ARP resolution: translates the next hop in `reg0` or `xxreg0` into an Ethernet
/// address, statically where northd knows it and through the MAC bindings otherwise.
fn build_arp_resolve(datapaths: &Datapaths, ports: &Ports, lflows: &mut LflowTable) {
    let router_peer = |index: usize| ports[index].peer.filter(|&peer| ports[peer].nbrp.is_some());

    for (index, op) in ports.iter().enumerate() {
        if let Some(nbrp) = &op.nbrp {
            // A router port linked directly to another router.
            if let (Some(peer), Some(_)) = (router_peer(index), &nbrp.peer) {
                add_router_port_arp_resolve(datapaths, &ports[peer], op, lflows);
            }
            continue;
        }

        let od = &datapaths[op.od];
        if op.lsp_type() != "router" {
            // A VM or container port: every router attached to its switch can reach it.
            for laddrs in &op.lsp_addrs {
                for &router_port in &od.router_ports {
                    let peer = match router_peer(router_port) {
                        Some(peer) => &ports[peer],
                        None => continue,
                    };
                    let peer_dp = datapaths[peer.od].key;
                    let actions = format!("eth.dst = {}; next;", laddrs.ea_s());
                    for addr in &laddrs.ipv4_addrs {
                        let ip_s = addr.addr().to_string();
                        if find_lrp_member_ip(peer, &ip_s).is_some() {
                            lflows.add(peer_dp, Stage::LrInArpResolve, 100,
                                       format!("outport == {} && reg0 == {}", peer.json_key, ip_s),
                                       actions.as_str());
                        }
                    }
                    for addr in &laddrs.ipv6_addrs {
                        let ip_s = addr.addr().to_string();
                        if find_lrp_member_ip(peer, &ip_s).is_some() {
                            lflows.add(peer_dp, Stage::LrInArpResolve, 100,
                                       format!("outport == {} && xxreg0 == {}", peer.json_key, ip_s),
                                       actions.as_str());
                        }
                    }
                }
            }
        } else if let Some(peer) = router_peer(index) {
            // A switch port linked to a router: that router can reach the other routers on
            // the same switch.
            for &router_port in &od.router_ports {
                match router_peer(router_port) {
                    Some(other) if other != peer => {
                        add_router_port_arp_resolve(datapaths, &ports[peer], &ports[other], lflows);
                    },
                    _ => (),
                }
            }
        }
    }

    for od in datapaths.iter().filter(|od| od.nbr.is_some()) {
        lflows.add(od.key, Stage::LrInArpResolve, 0, "ip4", "get_arp(outport, reg0); next;");
        lflows.add(od.key, Stage::LrInArpResolve, 0, "ip6", "get_nd(outport, xxreg0); next;");
    }
}

/// Adds the logical flows of every logical router to `lflows`.
pub fn build_lrouter_flows(datapaths: &Datapaths, ports: &Ports, lflows: &mut LflowTable) {
    build_admission(datapaths, ports, lflows);
    build_ip_input(datapaths, ports, lflows);
    for od in datapaths.iter() {
        build_nat_flows(od, ports, lflows);
    }
    build_routing(datapaths, ports, lflows);
    build_arp_resolve(datapaths, ports, lflows);

    for od in datapaths.iter().filter(|od| od.nbr.is_some()) {
        // Traffic for the distributed gateway port goes through its redirect-chassis,
        // unless a more specific flow handles it locally.
        if let (Some(l3dgw), Some(redirect)) = (od.l3dgw_port, od.l3redirect_port) {
            let match_ = format!("outport == {}", ports[l3dgw].json_key);
            let actions = format!("outport = {}; next;", ports[redirect].json_key);
            lflows.add(od.key, Stage::LrInGwRedirect, 150,
                       format!("{} && eth.dst == {}", match_, EthAddr::ZERO), actions.as_str());
            lflows.add(od.key, Stage::LrInGwRedirect, 50, match_, actions);
        }
        lflows.add(od.key, Stage::LrInGwRedirect, 0, "1", "next;");

        lflows.add(od.key, Stage::LrInArpRequest, 100, "eth.dst == 00:00:00:00:00:00",
                   "arp { eth.dst = ff:ff:ff:ff:ff:ff; arp.spa = reg1; arp.tpa = reg0; \
                    arp.op = 1; /* ARP request */ output; };");
        lflows.add(od.key, Stage::LrInArpRequest, 0, "1", "output;");
    }

    // Derived ports are replaced by their gateway port before egress.
    for op in ports.iter() {
        if op.nbrp.is_some() && op.is_enabled() && !op.derived {
            lflows.add(datapaths[op.od].key, Stage::LrOutDelivery, 100,
                       format!("outport == {}", op.json_key), "output;");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Lflow;
    use crate::testing::build_topology;
    use anyhow::Result;
    use ovn::addresses::extract_lrp_networks;
    use serde_json::json;
    use tracing_test::traced_test;

    fn has_flow(lflows: &LflowTable, od: &OvnDatapath, stage: Stage, priority: u16, match_: &str,
                actions: &str) -> bool {
        lflows.contains(&Lflow {
            datapath: od.key,
            stage,
            priority,
            match_: match_.into(),
            actions: actions.into(),
        })
    }

    #[traced_test]
    #[test]
    fn gateway_router() -> Result<()> {
        let (datapaths, ports) = build_topology(json!([
            {"op": "insert", "table": "Logical_Router_Port", "uuid-name": "lrp0",
             "row": {"name": "lrp0", "mac": "00:00:00:00:ff:01", "networks": "10.0.0.1/24"}},
            {"op": "insert", "table": "NAT", "uuid-name": "nat",
             "row": {"type": "snat", "external_ip": "203.0.113.1", "logical_ip": "10.0.0.0/24"}},
            {"op": "insert", "table": "Load_Balancer", "uuid-name": "lb",
             "row": {"name": "lb0", "vips": ["map", [["10.0.0.10:80", "10.0.0.2:8080,10.0.0.3:8080"]]]}},
            {"op": "insert", "table": "Logical_Router_Static_Route", "uuid-name": "default",
             "row": {"ip_prefix": "0.0.0.0/0", "nexthop": "10.0.0.254"}},
            {"op": "insert", "table": "Logical_Router_Static_Route", "uuid-name": "nopath",
             "row": {"ip_prefix": "192.168.0.0/16", "nexthop": "172.16.0.254"}},
            {"op": "insert", "table": "Logical_Router_Static_Route", "uuid-name": "badmask",
             "row": {"ip_prefix": "192.168.1.0/24", "nexthop": "10.0.0.254/24"}},
            {"op": "insert", "table": "Logical_Router", "row": {"name": "lr0",
             "ports": ["named-uuid", "lrp0"],
             "nat": ["named-uuid", "nat"],
             "load_balancer": ["named-uuid", "lb"],
             "static_routes": ["set", [["named-uuid", "default"], ["named-uuid", "nopath"],
                                       ["named-uuid", "badmask"]]],
             "options": ["map", [["chassis", "hv1"], ["lb_force_snat_ip", "203.0.113.2"]]]}},
        ]))?;
        let mut lflows = LflowTable::new();
        build_lrouter_flows(&datapaths, &ports, &mut lflows);
        let lr0 = &datapaths[0];

        // SNAT priority follows the length of the logical network.
        assert!(has_flow(&lflows, lr0, Stage::LrOutSnat, 25, "ip && ip4.src == 10.0.0.0/24",
                         "ct_snat(203.0.113.1);"));
        assert!(has_flow(&lflows, lr0, Stage::LrInUnsnat, 90, "ip && ip4.dst == 203.0.113.1",
                         "ct_snat; next;"));
        assert!(has_flow(&lflows, lr0, Stage::LrInDnat, 50, "ip", "flags.loopback = 1; ct_dnat;"));
        assert!(has_flow(&lflows, lr0, Stage::LrOutSnat, 100, "flags.force_snat_for_lb == 1 && ip",
                         "ct_snat(203.0.113.2);"));

        assert!(has_flow(&lflows, lr0, Stage::LrInDnat, 120,
                         "ct.new && ip && ip4.dst == 10.0.0.10 && tcp && tcp.dst == 80",
                         "flags.force_snat_for_lb = 1; ct_lb(10.0.0.2:8080,10.0.0.3:8080);"));
        assert!(has_flow(&lflows, lr0, Stage::LrInDnat, 120,
                         "ct.est && ip && ip4.dst == 10.0.0.10 && tcp && tcp.dst == 80",
                         "flags.force_snat_for_lb = 1; ct_dnat;"));
        assert!(has_flow(&lflows, lr0, Stage::LrInDefrag, 100, "ip && ip4.dst == 10.0.0.10", "ct_next;"));

        assert!(has_flow(&lflows, lr0, Stage::LrInIpInput, 100,
                         "ip4.src == {10.0.0.1, 10.0.0.255} && reg9[1] == 0", "drop;"));
        assert!(has_flow(&lflows, lr0, Stage::LrInIpInput, 60, "ip4.dst == {10.0.0.1}", "drop;"));
        assert!(has_flow(&lflows, lr0, Stage::LrInIpInput, 90,
                         "inport == \"lrp0\" && arp.tpa == 10.0.0.10 && arp.op == 1",
                         "eth.dst = eth.src; eth.src = 00:00:00:00:ff:01; arp.op = 2; /* ARP reply */ \
                          arp.tha = arp.sha; arp.sha = 00:00:00:00:ff:01; arp.tpa = arp.spa; \
                          arp.spa = 10.0.0.10; outport = \"lrp0\"; flags.loopback = 1; output;"));

        assert!(has_flow(&lflows, lr0, Stage::LrInIpRouting, 49, "ip4.dst == 10.0.0.0/24",
                         "ip.ttl--; reg0 = ip4.dst; reg1 = 10.0.0.1; eth.src = 00:00:00:00:ff:01; \
                          outport = \"lrp0\"; flags.loopback = 1; next;"));
        assert!(has_flow(&lflows, lr0, Stage::LrInIpRouting, 1, "ip4.dst == 0.0.0.0/0",
                         "ip.ttl--; reg0 = 10.0.0.254; reg1 = 10.0.0.1; eth.src = 00:00:00:00:ff:01; \
                          outport = \"lrp0\"; flags.loopback = 1; next;"));
        assert!(logs_contain("No path for static route 192.168.0.0/16; next hop 172.16.0.254"));
        assert!(logs_contain("bad next hop mask 10.0.0.254/24"));
        Ok(())
    }

    #[test]
    fn distributed_gateway_port() -> Result<()> {
        let (datapaths, ports) = build_topology(json!([
            {"op": "insert", "table": "Logical_Router_Port", "uuid-name": "lrp0",
             "row": {"name": "lrp0", "mac": "00:00:00:00:ff:01", "networks": "10.0.0.1/24"}},
            {"op": "insert", "table": "Logical_Router_Port", "uuid-name": "lrp1",
             "row": {"name": "lrp1", "mac": "00:00:00:00:ff:02", "networks": "172.16.0.1/24",
                     "options": ["map", [["redirect-chassis", "hv1"]]]}},
            {"op": "insert", "table": "NAT", "uuid-name": "fip",
             "row": {"type": "dnat_and_snat", "external_ip": "172.16.0.10", "logical_ip": "10.0.0.2",
                     "logical_port": "vm1", "external_mac": "00:00:00:00:aa:01"}},
            {"op": "insert", "table": "NAT", "uuid-name": "snat",
             "row": {"type": "snat", "external_ip": "172.16.0.1", "logical_ip": "10.0.0.0/24"}},
            {"op": "insert", "table": "Logical_Router", "row": {"name": "lr0",
             "ports": ["set", [["named-uuid", "lrp0"], ["named-uuid", "lrp1"]]],
             "nat": ["set", [["named-uuid", "fip"], ["named-uuid", "snat"]]]}},
        ]))?;
        let mut lflows = LflowTable::new();
        build_lrouter_flows(&datapaths, &ports, &mut lflows);
        let lr0 = &datapaths[0];

        assert!(has_flow(&lflows, lr0, Stage::LrInAdmission, 50,
                         "eth.dst == 00:00:00:00:ff:02 && inport == \"lrp1\" && \
                          is_chassis_resident(\"cr-lrp1\")",
                         "next;"));
        assert!(has_flow(&lflows, lr0, Stage::LrInAdmission, 50,
                         "eth.dst == 00:00:00:00:aa:01 && inport == \"lrp1\" && \
                          is_chassis_resident(\"vm1\")",
                         "next;"));

        // The floating IP is translated locally, the SNAT address on the redirect-chassis.
        assert!(has_flow(&lflows, lr0, Stage::LrInDnat, 100,
                         "ip && ip4.dst == 172.16.0.10 && inport == \"lrp1\"", "ct_dnat(10.0.0.2);"));
        assert!(has_flow(&lflows, lr0, Stage::LrOutSnat, 33,
                         "ip && ip4.src == 10.0.0.2 && outport == \"lrp1\"",
                         "eth.src = 00:00:00:00:aa:01; ct_snat(172.16.0.10);"));
        assert!(has_flow(&lflows, lr0, Stage::LrOutSnat, 25,
                         "ip && ip4.src == 10.0.0.0/24 && outport == \"lrp1\" && \
                          is_chassis_resident(\"cr-lrp1\")",
                         "ct_snat(172.16.0.1);"));

        assert!(has_flow(&lflows, lr0, Stage::LrInGwRedirect, 50, "outport == \"lrp1\"",
                         "outport = \"cr-lrp1\"; next;"));
        assert!(has_flow(&lflows, lr0, Stage::LrInGwRedirect, 200, "reg9[0] == 1",
                         "outport = \"cr-lrp1\"; next;"));
        assert!(has_flow(&lflows, lr0, Stage::LrInArpResolve, 200, "reg9[0] == 1",
                         "eth.dst = 00:00:00:00:ff:02; next;"));

        // The SNAT address is the router's own, so it is not dropped.
        assert!(!lflows.stage_flows(&lr0.key, Stage::LrInIpInput).iter()
                .any(|lflow| lflow.priority == 60 && lflow.match_.contains("172.16.0.1")));

        // No egress processing happens for the chassisredirect port.
        assert!(!lflows.stage_flows(&lr0.key, Stage::LrOutDelivery).iter()
                .any(|lflow| lflow.match_.contains("cr-lrp1")));
        Ok(())
    }

    #[test]
    fn arp_resolve_through_switch() -> Result<()> {
        let (datapaths, ports) = build_topology(json!([
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm1",
             "row": {"name": "vm1", "addresses": "00:00:00:00:00:01 10.0.0.2"}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "rp0",
             "row": {"name": "sw0-lr0", "type": "router", "addresses": "router",
                     "options": ["map", [["router-port", "lrp0"]]]}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "rp1",
             "row": {"name": "sw0-lr1", "type": "router", "addresses": "router",
                     "options": ["map", [["router-port", "lrp1"]]]}},
            {"op": "insert", "table": "Logical_Switch", "row": {"name": "sw0",
             "ports": ["set", [["named-uuid", "vm1"], ["named-uuid", "rp0"], ["named-uuid", "rp1"]]]}},
            {"op": "insert", "table": "Logical_Router_Port", "uuid-name": "lrp0",
             "row": {"name": "lrp0", "mac": "00:00:00:00:ff:01", "networks": "10.0.0.1/24"}},
            {"op": "insert", "table": "Logical_Router", "row": {"name": "lr0",
             "ports": ["named-uuid", "lrp0"]}},
            {"op": "insert", "table": "Logical_Router_Port", "uuid-name": "lrp1",
             "row": {"name": "lrp1", "mac": "00:00:00:00:ff:11", "networks": "10.0.0.254/24"}},
            {"op": "insert", "table": "Logical_Router", "row": {"name": "lr1",
             "ports": ["named-uuid", "lrp1"]}},
        ]))?;
        let mut lflows = LflowTable::new();
        build_lrouter_flows(&datapaths, &ports, &mut lflows);
        let lr0 = datapaths.iter().find(|od| od.name() == "lr0").unwrap();

        assert!(has_flow(&lflows, lr0, Stage::LrInArpResolve, 100,
                         "outport == \"lrp0\" && reg0 == 10.0.0.2", "eth.dst = 00:00:00:00:00:01; next;"));
        assert!(has_flow(&lflows, lr0, Stage::LrInArpResolve, 100,
                         "outport == \"lrp0\" && reg0 == 10.0.0.254", "eth.dst = 00:00:00:00:ff:11; next;"));
        assert!(has_flow(&lflows, lr0, Stage::LrInArpResolve, 0, "ip4", "get_arp(outport, reg0); next;"));
        assert!(has_flow(&lflows, lr0, Stage::LrOutDelivery, 100, "outport == \"lrp0\"", "output;"));
        Ok(())
    }

    #[test]
    fn member_ip() {
        let mut op = OvnPort::new("lrp0", 0, None);
        op.lrp_networks = extract_lrp_networks("00:00:00:00:ff:01",
                                               &["10.0.0.1/24".into(), "fd00::1/64".into()]).unwrap();
        assert_eq!(find_lrp_member_ip(&op, "10.0.0.77").as_deref(), Some("10.0.0.1"));
        assert_eq!(find_lrp_member_ip(&op, "10.0.1.77"), None);
        assert_eq!(find_lrp_member_ip(&op, "fd00::99").as_deref(), Some("fd00::1"));
        op.lrp_networks.ipv4_addrs.clear();
        assert_eq!(find_lrp_member_ip(&op, "10.0.0.77"), None);
    }
}
