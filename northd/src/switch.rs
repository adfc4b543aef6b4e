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

//! Logical flows for logical switches.

use std::collections::BTreeSet;
use std::fmt::Write;
use std::net::{Ipv4Addr, Ipv6Addr};

use itertools::Itertools;
use ovn::actions::Pipeline;
use ovn::addresses::{is_dynamic_lsp_address, parse_ipv4_cidr, parse_ipv6_cidr, EthAddr, Ipv4Netaddr, Ipv6Netaddr,
                     LportAddresses};
use ovn::nb::{LogicalSwitch, LogicalSwitchPort};
use tracing::{event, info, Level};

use crate::datapath::{Datapaths, OvnDatapath};
use crate::lb::ip_address_and_port_from_lb_key;
use crate::port::{OvnPort, Ports};
use crate::stage::{LflowTable, Stage};
use crate::sync::{McGroups, MC_FLOOD, MC_UNKNOWN};

/// Added to ACL priorities, to leave room below them for default flows.
pub const OVN_ACL_PRI_OFFSET: i64 = 1000;

pub const REGBIT_CONNTRACK_DEFRAG: &str = "reg0[0]";
pub const REGBIT_CONNTRACK_COMMIT: &str = "reg0[1]";
pub const REGBIT_CONNTRACK_NAT: &str = "reg0[2]";
pub const REGBIT_DHCP_OPTS_RESULT: &str = "reg0[3]";

fn lsp_is_up(nbsp: &LogicalSwitchPort) -> bool {
    nbsp.up != Some(false)
}

/// The address that an IPv4 port security entry allows: just the address if it has host
/// bits, otherwise any address in the subnet.
fn ipv4_ps_addr(addr: &Ipv4Netaddr) -> String {
    if addr.plen() == 32 || addr.has_host_bits() {
        addr.addr().to_string()
    } else {
        addr.network_s()
    }
}

fn build_port_security_l2(eth_addr_field: &str, ps_addrs: &[LportAddresses], match_: &mut String) {
    if ps_addrs.is_empty() {
        return;
    }
    let _ = write!(match_, " && {} == {{{}}}", eth_addr_field,
                   ps_addrs.iter().map(LportAddresses::ea_s).join(" "));
}

fn build_port_security_ipv6_nd_flow(match_: &mut String, ea: EthAddr, ipv6_addrs: &[Ipv6Netaddr]) {
    let _ = write!(match_, " && ip6 && nd && ((nd.sll == {zero} || nd.sll == {ea}) || \
                            ((nd.tll == {zero} || nd.tll == {ea})",
                   zero = EthAddr::ZERO, ea = ea);
    if ipv6_addrs.is_empty() {
        match_.push_str("))");
        return;
    }

    let _ = write!(match_, " && (nd.target == {}", ea.to_ipv6_lla());
    for addr in ipv6_addrs {
        let _ = write!(match_, " || nd.target == {}", addr.addr());
    }
    match_.push_str(")))");
}

fn build_port_security_ipv6_flow(pipeline: Pipeline, match_: &mut String, ea: EthAddr,
                                 ipv6_addrs: &[Ipv6Netaddr]) {
    let mut allowed = vec![ea.to_ipv6_lla().to_string()];
    // Multicast is always allowed to arrive.
    if pipeline == Pipeline::Egress {
        allowed.push("ff00::/8".into());
    }
    allowed.extend(ipv6_addrs.iter().map(|addr| addr.addr().to_string()));

    let field = match pipeline {
        Pipeline::Ingress => "ip6.src",
        Pipeline::Egress => "ip6.dst",
    };
    let _ = write!(match_, " && {} == {{{}}}", field, allowed.join(", "));
}

/// ARP and ND port security: a port may only claim its own addresses.
fn build_port_security_nd(op: &OvnPort, datapath: &OvnDatapath, lflows: &mut LflowTable) {
    for ps in &op.ps_addrs {
        let no_ip = !ps.has_ip();

        if !ps.ipv4_addrs.is_empty() || no_ip {
            let mut match_ = format!("inport == {} && eth.src == {} && arp.sha == {}",
                                     op.json_key, ps.ea, ps.ea);
            if !ps.ipv4_addrs.is_empty() {
                let _ = write!(match_, " && arp.spa == {{{}}}",
                               ps.ipv4_addrs.iter().map(ipv4_ps_addr).join(", "));
            }
            lflows.add(datapath.key, Stage::LsInPortSecNd, 90, match_, "next;");
        }

        if !ps.ipv6_addrs.is_empty() || no_ip {
            let mut match_ = format!("inport == {} && eth.src == {}", op.json_key, ps.ea);
            build_port_security_ipv6_nd_flow(&mut match_, ps.ea, &ps.ipv6_addrs);
            lflows.add(datapath.key, Stage::LsInPortSecNd, 90, match_, "next;");
        }
    }

    lflows.add(datapath.key, Stage::LsInPortSecNd, 80,
               format!("inport == {} && (arp || nd)", op.json_key), "drop;");
}

/// IP port security, in the ingress or egress pipeline.
fn build_port_security_ip(pipeline: Pipeline, op: &OvnPort, datapath: &OvnDatapath,
                          lflows: &mut LflowTable) {
    let (port_direction, eth_field, stage) = match pipeline {
        Pipeline::Ingress => ("inport", "eth.src", Stage::LsInPortSecIp),
        Pipeline::Egress => ("outport", "eth.dst", Stage::LsOutPortSecIp),
    };

    for ps in op.ps_addrs.iter().filter(|ps| ps.has_ip()) {
        if !ps.ipv4_addrs.is_empty() {
            let mut allowed = Vec::new();
            let mut match_ = match pipeline {
                Pipeline::Ingress => {
                    // DHCP discovery uses the unspecified address.
                    lflows.add(datapath.key, stage, 90,
                               format!("inport == {} && eth.src == {} && ip4.src == 0.0.0.0 \
                                        && ip4.dst == 255.255.255.255 && udp.src == 68 \
                                        && udp.dst == 67", op.json_key, ps.ea),
                               "next;");
                    format!("inport == {} && eth.src == {} && ip4.src == ", op.json_key, ps.ea)
                },
                Pipeline::Egress => {
                    allowed.push("255.255.255.255".to_string());
                    allowed.push("224.0.0.0/4".to_string());
                    format!("outport == {} && eth.dst == {} && ip4.dst == ", op.json_key, ps.ea)
                }
            };

            for addr in &ps.ipv4_addrs {
                allowed.push(ipv4_ps_addr(addr));
                if pipeline == Pipeline::Egress && addr.plen() != 32 && addr.has_host_bits() {
                    allowed.push(addr.bcast().to_string());
                }
            }
            let _ = write!(match_, "{{{}}}", allowed.join(", "));
            lflows.add(datapath.key, stage, 90, match_, "next;");
        }

        if !ps.ipv6_addrs.is_empty() {
            if pipeline == Pipeline::Ingress {
                // Duplicate address detection uses the unspecified address.
                lflows.add(datapath.key, stage, 90,
                           format!("inport == {} && eth.src == {} && ip6.src == :: \
                                    && ip6.dst == ff02::/16 && icmp6.type == {{131, 135, 143}}",
                                   op.json_key, ps.ea),
                           "next;");
            }
            let mut match_ = format!("{} == {} && {} == {}", port_direction, op.json_key,
                                     eth_field, ps.ea);
            build_port_security_ipv6_flow(pipeline, &mut match_, ps.ea, &ps.ipv6_addrs);
            lflows.add(datapath.key, stage, 90, match_, "next;");
        }

        lflows.add(datapath.key, stage, 80,
                   format!("{} == {} && {} == {} && ip", port_direction, op.json_key,
                           eth_field, ps.ea),
                   "drop;");
    }
}

/// The `put_dhcp_opts` action, the reply action, and the address match for answering
/// DHCPv4 requests for `offer_ip`, if the port has usable DHCPv4 options for it.
fn build_dhcpv4_action(op: &OvnPort, nbsp: &LogicalSwitchPort, offer_ip: Ipv4Addr)
                       -> Option<(String, String, String)> {
    let dhcp = nbsp.dhcpv4_options.as_ref()?;
    let (host_ip, plen) = parse_ipv4_cidr(&dhcp.cidr)?;
    let mask = Ipv4Netaddr::new(host_ip, plen)?.mask();
    if (u32::from(offer_ip) ^ u32::from(host_ip)) & u32::from(mask) != 0 {
        return None;
    }

    let (server_ip, server_mac) = match (dhcp.options.get("server_id"), dhcp.options.get("server_mac"),
                                         dhcp.options.get("lease_time")) {
        (Some(server_ip), Some(server_mac), Some(_)) => (server_ip, server_mac),
        _ => {
            event!(Level::WARN, "Required DHCPv4 options not defined for lport - {}", op.json_key);
            return None;
        }
    };

    let mut options = dhcp.options.clone();
    options.remove("server_mac");
    options.insert("netmask".into(), mask.to_string());

    let options_action = format!("{} = put_dhcp_opts(offerip = {}, {}); next;",
                                 REGBIT_DHCP_OPTS_RESULT, offer_ip,
                                 options.iter().map(|(k, v)| format!("{} = {}", k, v)).join(", "));
    let response_action = format!("eth.dst = eth.src; eth.src = {}; ip4.dst = {}; ip4.src = {}; \
                                   udp.src = 67; udp.dst = 68; outport = inport; \
                                   flags.loopback = 1; output;",
                                  server_mac, offer_ip, server_ip);
    let ipv4_addr_match = format!("ip4.src == {} && ip4.dst == {{{}, 255.255.255.255}}",
                                  offer_ip, server_ip);
    Some((options_action, response_action, ipv4_addr_match))
}

/// The `put_dhcpv6_opts` action and the reply action for answering DHCPv6 requests for
/// `offer_ip`, if the port has usable DHCPv6 options for it.
fn build_dhcpv6_action(op: &OvnPort, nbsp: &LogicalSwitchPort, offer_ip: Ipv6Addr)
                       -> Option<(String, String)> {
    let dhcp = nbsp.dhcpv6_options.as_ref()?;
    let (host_ip, plen) = parse_ipv6_cidr(&dhcp.cidr)?;
    let mask = Ipv6Netaddr::new(host_ip, plen)?.mask();
    if (u128::from(offer_ip) ^ u128::from(host_ip)) & u128::from(mask) != 0 {
        return None;
    }

    // "server_id" is the server's MAC, and the server answers from its link-local address.
    let server_mac = dhcp.options.get("server_id");
    let ea = match server_mac.and_then(|mac| mac.parse::<EthAddr>().ok()) {
        Some(ea) => ea,
        None => {
            event!(Level::WARN, "server_id not present in the DHCPv6 options for lport {}",
                   op.json_key);
            return None;
        }
    };
    let server_ip = ea.to_ipv6_lla();

    let mut args = Vec::new();
    if dhcp.options.get("dhcpv6_stateless").map(String::as_str) != Some("true") {
        args.push(format!("ia_addr = {}", offer_ip));
    }
    args.extend(dhcp.options.iter()
                .filter(|(k, _)| k.as_str() != "dhcpv6_stateless")
                .map(|(k, v)| format!("{} = {}", k, v)));

    let options_action = format!("{} = put_dhcpv6_opts({}); next;",
                                 REGBIT_DHCP_OPTS_RESULT, args.join(", "));
    let response_action = format!("eth.dst = eth.src; eth.src = {}; ip6.dst = ip6.src; \
                                   ip6.src = {}; udp.src = 547; udp.dst = 546; outport = inport; \
                                   flags.loopback = 1; output;",
                                  server_mac.map_or("", String::as_str), server_ip);
    Some((options_action, response_action))
}

fn has_stateful_acl(nbs: &LogicalSwitch) -> bool {
    nbs.acls.iter().any(|acl| acl.action == "allow-related")
}

fn build_pre_acls(od: &OvnDatapath, nbs: &LogicalSwitch, ports: &Ports, lflows: &mut LflowTable) {
    lflows.add(od.key, Stage::LsInPreAcl, 0, "1", "next;");
    lflows.add(od.key, Stage::LsOutPreAcl, 0, "1", "next;");

    // With stateful ACLs, IP traffic goes through conntrack, which also defragments.
    if has_stateful_acl(nbs) {
        // Router ports are exempt: their conntrack state would live on another chassis.
        for &index in &od.router_ports {
            let op = &ports[index];
            lflows.add(od.key, Stage::LsInPreAcl, 110, format!("ip && inport == {}", op.json_key),
                       "next;");
            lflows.add(od.key, Stage::LsOutPreAcl, 110, format!("ip && outport == {}", op.json_key),
                       "next;");
        }
        lflows.add(od.key, Stage::LsInPreAcl, 110, "nd", "next;");
        lflows.add(od.key, Stage::LsOutPreAcl, 110, "nd", "next;");

        let defrag = format!("{} = 1; next;", REGBIT_CONNTRACK_DEFRAG);
        lflows.add(od.key, Stage::LsInPreAcl, 100, "ip", defrag.as_str());
        lflows.add(od.key, Stage::LsOutPreAcl, 100, "ip", defrag);
    }
}

fn build_pre_lb(od: &OvnDatapath, nbs: &LogicalSwitch, lflows: &mut LflowTable) {
    lflows.add(od.key, Stage::LsInPreLb, 0, "1", "next;");
    lflows.add(od.key, Stage::LsOutPreLb, 0, "1", "next;");

    // Only the VIP is matched here.  Fragments lack the L4 port, so the stateful stage
    // matches it after defragmentation.
    let defrag = format!("{} = 1; next;", REGBIT_CONNTRACK_DEFRAG);
    let mut vip_configured = false;
    let mut all_ips = BTreeSet::new();
    for lb in &nbs.load_balancer {
        for key in lb.vips.keys() {
            vip_configured = true;
            if let Some((ip, _)) = ip_address_and_port_from_lb_key(key) {
                all_ips.insert(ip);
            }
        }
    }
    for ip in all_ips {
        lflows.add(od.key, Stage::LsInPreLb, 100, format!("ip && ip4.dst == {}", ip), defrag.as_str());
    }

    if vip_configured {
        lflows.add(od.key, Stage::LsOutPreLb, 100, "ip", defrag);
    }
}

fn build_pre_stateful(od: &OvnDatapath, lflows: &mut LflowTable) {
    lflows.add(od.key, Stage::LsInPreStateful, 0, "1", "next;");
    lflows.add(od.key, Stage::LsOutPreStateful, 0, "1", "next;");

    let defrag = format!("{} == 1", REGBIT_CONNTRACK_DEFRAG);
    lflows.add(od.key, Stage::LsInPreStateful, 100, defrag.as_str(), "ct_next;");
    lflows.add(od.key, Stage::LsOutPreStateful, 100, defrag, "ct_next;");
}

fn build_acls(od: &OvnDatapath, nbs: &LogicalSwitch, lflows: &mut LflowTable) {
    let has_stateful = has_stateful_acl(nbs);
    let commit = format!("{} = 1; next;", REGBIT_CONNTRACK_COMMIT);

    lflows.add(od.key, Stage::LsInAcl, 0, "1", "next;");
    lflows.add(od.key, Stage::LsOutAcl, 0, "1", "next;");

    if has_stateful {
        for stage in [Stage::LsInAcl, Stage::LsOutAcl] {
            // New connections, and blocked ones that policy allows again, get committed.
            lflows.add(od.key, stage, 1, "ip && (!ct.est || (ct.est && ct_label.blocked == 1))",
                       commit.as_str());

            // Invalid packets, and replies on connections marked for deletion, are dropped.
            lflows.add(od.key, stage, u16::MAX,
                       "ct.inv || (ct.est && ct.rpl && ct_label.blocked == 1)", "drop;");

            // Replies and related traffic on live connections pass.
            lflows.add(od.key, stage, u16::MAX,
                       "ct.est && !ct.rel && !ct.new && !ct.inv && ct.rpl && ct_label.blocked == 0",
                       "next;");
            lflows.add(od.key, stage, u16::MAX,
                       "!ct.est && ct.rel && !ct.new && !ct.inv && ct_label.blocked == 0", "next;");

            lflows.add(od.key, stage, u16::MAX, "nd", "next;");
        }
    }

    for acl in &nbs.acls {
        let stage = if acl.direction == "from-lport" { Stage::LsInAcl } else { Stage::LsOutAcl };
        let priority = (acl.priority + OVN_ACL_PRI_OFFSET) as u16;

        match acl.action.as_str() {
            "allow" | "allow-related" => {
                if !has_stateful {
                    lflows.add(od.key, stage, priority, acl.match_.as_str(), "next;");
                } else {
                    // Commit new connections, and blocked ones that policy allows again.
                    lflows.add(od.key, stage, priority,
                               format!("((ct.new && !ct.est) || (!ct.new && ct.est && !ct.rpl \
                                        && ct_label.blocked == 1)) && ({})", acl.match_),
                               commit.as_str());

                    // Requests on established connections only need to pass policy.
                    lflows.add(od.key, stage, priority,
                               format!("!ct.new && ct.est && !ct.rpl && ct_label.blocked == 0 \
                                        && ({})", acl.match_),
                               "next;");
                }
            },
            "drop" | "reject" => {
                if acl.action == "reject" {
                    info!("reject is not a supported action");
                }

                if has_stateful {
                    lflows.add(od.key, stage, priority,
                               format!("(!ct.est || (ct.est && ct_label.blocked == 1)) && ({})",
                                       acl.match_),
                               "drop;");

                    // A connection that policy allowed before: mark it for deletion.
                    lflows.add(od.key, stage, priority,
                               format!("ct.est && ct_label.blocked == 0 && ({})", acl.match_),
                               "ct_commit(ct_label=1/1);");
                } else {
                    lflows.add(od.key, stage, priority, acl.match_.as_str(), "drop;");
                }
            },
            _ => (),
        }
    }

    // Replies from the native DHCP servers are always allowed.
    let actions = if has_stateful { "ct_commit; next;" } else { "next;" };
    for nbsp in &nbs.ports {
        if let Some(dhcp) = &nbsp.dhcpv4_options {
            if let (Some(server_id), Some(server_mac), Some(_)) =
                (dhcp.options.get("server_id"), dhcp.options.get("server_mac"),
                 dhcp.options.get("lease_time")) {
                lflows.add(od.key, Stage::LsOutAcl, 34000,
                           format!("outport == \"{}\" && eth.src == {} && ip4.src == {} && udp \
                                    && udp.src == 67 && udp.dst == 68",
                                   nbsp.name, server_mac, server_id),
                           actions);
            }
        }

        if let Some(dhcp) = &nbsp.dhcpv6_options {
            let server_mac = dhcp.options.get("server_id");
            if let Some(ea) = server_mac.and_then(|mac| mac.parse::<EthAddr>().ok()) {
                lflows.add(od.key, Stage::LsOutAcl, 34000,
                           format!("outport == \"{}\" && eth.src == {} && ip6.src == {} && udp \
                                    && udp.src == 547 && udp.dst == 546",
                                   nbsp.name, server_mac.map_or("", String::as_str), ea.to_ipv6_lla()),
                           actions);
            }
        }
    }
}

fn build_qos(od: &OvnDatapath, nbs: &LogicalSwitch, lflows: &mut LflowTable) {
    lflows.add(od.key, Stage::LsInQosMark, 0, "1", "next;");
    lflows.add(od.key, Stage::LsOutQosMark, 0, "1", "next;");

    for qos in &nbs.qos_rules {
        let stage = if qos.direction == "from-lport" { Stage::LsInQosMark } else { Stage::LsOutQosMark };
        if let Some(dscp) = qos.dscp {
            lflows.add(od.key, stage, qos.priority as u16, qos.match_.as_str(),
                       format!("ip.dscp = {}; next;", dscp as u8));
        }
    }
}

fn build_lb(od: &OvnDatapath, nbs: &LogicalSwitch, lflows: &mut LflowTable) {
    lflows.add(od.key, Stage::LsInLb, 0, "1", "next;");
    lflows.add(od.key, Stage::LsOutLb, 0, "1", "next;");

    // Established traffic goes through conntrack for NAT only.
    if !nbs.load_balancer.is_empty() {
        let nat = format!("{} = 1; next;", REGBIT_CONNTRACK_NAT);
        lflows.add(od.key, Stage::LsInLb, u16::MAX, "ct.est && !ct.rel && !ct.new && !ct.inv",
                   nat.as_str());
        lflows.add(od.key, Stage::LsOutLb, u16::MAX, "ct.est && !ct.rel && !ct.new && !ct.inv", nat);
    }
}

fn build_stateful(od: &OvnDatapath, nbs: &LogicalSwitch, lflows: &mut LflowTable) {
    lflows.add(od.key, Stage::LsInStateful, 0, "1", "next;");
    lflows.add(od.key, Stage::LsOutStateful, 0, "1", "next;");

    // Committing always clears ct_label.blocked: a packet that got this far is allowed.
    let commit = format!("{} == 1", REGBIT_CONNTRACK_COMMIT);
    lflows.add(od.key, Stage::LsInStateful, 100, commit.as_str(), "ct_commit(ct_label=0/1); next;");
    lflows.add(od.key, Stage::LsOutStateful, 100, commit, "ct_commit(ct_label=0/1); next;");

    let nat = format!("{} == 1", REGBIT_CONNTRACK_NAT);
    lflows.add(od.key, Stage::LsInStateful, 100, nat.as_str(), "ct_lb;");
    lflows.add(od.key, Stage::LsOutStateful, 100, nat, "ct_lb;");

    // New connections to a VIP are load balanced, and committed by ct_lb itself.
    for lb in &nbs.load_balancer {
        for (key, backends) in &lb.vips {
            let (ip, port) = match ip_address_and_port_from_lb_key(key) {
                Some(vip) => vip,
                None => continue,
            };

            let action = format!("ct_lb({});", backends);
            let mut match_ = format!("ct.new && ip4.dst == {}", ip);
            if port != 0 {
                let proto = if lb.protocol.as_deref() == Some("udp") { "udp" } else { "tcp" };
                let _ = write!(match_, " && {}.dst == {}", proto, port);
                lflows.add(od.key, Stage::LsInStateful, 120, match_, action);
            } else {
                lflows.add(od.key, Stage::LsInStateful, 110, match_, action);
            }
        }
    }
}

/// Adds the DHCP options and response flows for switch port `op`.
fn build_dhcp_flows(op: &OvnPort, nbsp: &LogicalSwitchPort, od: &OvnDatapath, lflows: &mut LflowTable) {
    for laddrs in &op.lsp_addrs {
        for addr in &laddrs.ipv4_addrs {
            let (options_action, response_action, ipv4_addr_match) =
                match build_dhcpv4_action(op, nbsp, addr.addr()) {
                    Some(actions) => actions,
                    None => continue,
                };

            lflows.add(od.key, Stage::LsInDhcpOptions, 100,
                       format!("inport == {} && eth.src == {} && ip4.src == 0.0.0.0 \
                                && ip4.dst == 255.255.255.255 && udp.src == 68 && udp.dst == 67",
                               op.json_key, laddrs.ea),
                       options_action.as_str());

            // Renewals go to the server's address or to broadcast.
            lflows.add(od.key, Stage::LsInDhcpOptions, 100,
                       format!("inport == {} && eth.src == {} && {} && udp.src == 68 && udp.dst == 67",
                               op.json_key, laddrs.ea, ipv4_addr_match),
                       options_action);

            lflows.add(od.key, Stage::LsInDhcpResponse, 100,
                       format!("inport == {} && eth.src == {} && ip4 && udp.src == 68 \
                                && udp.dst == 67 && {}",
                               op.json_key, laddrs.ea, REGBIT_DHCP_OPTS_RESULT),
                       response_action);
            break;
        }

        for addr in &laddrs.ipv6_addrs {
            let (options_action, response_action) = match build_dhcpv6_action(op, nbsp, addr.addr()) {
                Some(actions) => actions,
                None => continue,
            };

            let match_ = format!("inport == {} && eth.src == {} && ip6.dst == ff02::1:2 \
                                  && udp.src == 546 && udp.dst == 547", op.json_key, laddrs.ea);
            lflows.add(od.key, Stage::LsInDhcpResponse, 100,
                       format!("{} && {}", match_, REGBIT_DHCP_OPTS_RESULT), response_action);
            lflows.add(od.key, Stage::LsInDhcpOptions, 100, match_, options_action);
            break;
        }
    }
}

/// Adds the ARP and ND responder flows for the addresses of switch port `op`.
fn build_arp_nd_responder(op: &OvnPort, od: &OvnDatapath, lflows: &mut LflowTable) {
    for laddrs in &op.lsp_addrs {
        for addr in &laddrs.ipv4_addrs {
            let match_ = format!("arp.tpa == {} && arp.op == 1", addr.addr());
            lflows.add(od.key, Stage::LsInArpRsp, 50, match_.as_str(),
                       format!("eth.dst = eth.src; eth.src = {ea}; arp.op = 2; /* ARP reply */ \
                                arp.tha = arp.sha; arp.sha = {ea}; arp.tpa = arp.spa; \
                                arp.spa = {ip}; outport = inport; flags.loopback = 1; output;",
                               ea = laddrs.ea, ip = addr.addr()));

            // The owner of the address ARPing for it, for example to detect a duplicate,
            // gets no proxy reply.
            lflows.add(od.key, Stage::LsInArpRsp, 100,
                       format!("{} && inport == {}", match_, op.json_key), "next;");
        }

        // Solicitations may target the unicast or the solicited-node address.
        for addr in &laddrs.ipv6_addrs {
            let match_ = format!("nd_ns && ip6.dst == {{{ip}, {sn}}} && nd.target == {ip}",
                                 ip = addr.addr(), sn = addr.sn_addr());
            lflows.add(od.key, Stage::LsInArpRsp, 50, match_.as_str(),
                       format!("nd_na {{ eth.src = {ea}; ip6.src = {ip}; nd.target = {ip}; \
                                nd.tll = {ea}; outport = inport; flags.loopback = 1; output; }};",
                               ea = laddrs.ea, ip = addr.addr()));

            lflows.add(od.key, Stage::LsInArpRsp, 100,
                       format!("{} && inport == {}", match_, op.json_key), "next;");
        }
    }
}

/// Adds the L2 lookup flows for the addresses of switch port `index`.
fn build_l2_lookup(index: usize, datapaths: &mut Datapaths, ports: &Ports, lflows: &mut LflowTable,
                   mcgroups: &mut McGroups) {
    let op = &ports[index];
    let nbsp = match &op.nbsp {
        Some(nbsp) => nbsp,
        None => return,
    };
    let key = datapaths[op.od].key;
    let output = format!("outport = {}; output;", op.json_key);

    for address in &nbsp.addresses {
        let first = address.split_whitespace().next().unwrap_or_default();
        if let Ok(mac) = first.parse::<EthAddr>() {
            lflows.add(key, Stage::LsInL2Lkup, 50, format!("eth.dst == {}", mac), output.as_str());
        } else if address == "unknown" {
            if nbsp.is_enabled() {
                mcgroups.add(&MC_UNKNOWN, op.od, index);
                datapaths[op.od].has_unknown = true;
            }
        } else if is_dynamic_lsp_address(address) {
            let mac = nbsp.dynamic_addresses.as_deref()
                .and_then(|dynamic| dynamic.split_whitespace().next())
                .and_then(|mac| mac.parse::<EthAddr>().ok());
            if let Some(mac) = mac {
                lflows.add(key, Stage::LsInL2Lkup, 50, format!("eth.dst == {}", mac), output.as_str());
            }
        } else if address == "router" {
            let peer = match op.peer {
                Some(peer) => &ports[peer],
                None => continue,
            };
            let mac = match peer.nbrp.as_ref().and_then(|nbrp| nbrp.mac.parse::<EthAddr>().ok()) {
                Some(mac) => mac,
                None => continue,
            };
            let peer_od = &datapaths[peer.od];
            let is_l3dgw = op.peer.is_some() && peer_od.l3dgw_port == op.peer;

            // A distributed gateway port's MAC is only resident on its redirect-chassis.
            let mut match_ = format!("eth.dst == {}", mac);
            if let (true, Some(redirect)) = (is_l3dgw, peer_od.l3redirect_port) {
                let _ = write!(match_, " && is_chassis_resident({})", ports[redirect].json_key);
            }
            lflows.add(key, Stage::LsInL2Lkup, 50, match_, output.as_str());

            // So are the MACs of NAT rules on distributed routers.
            if is_l3dgw {
                let nats = peer_od.nbr.iter().flat_map(|nbr| nbr.nat.iter());
                for nat in nats.filter(|nat| nat.type_ == "dnat_and_snat") {
                    let external_mac = nat.external_mac.as_deref().and_then(|mac| mac.parse::<EthAddr>().ok());
                    if let (Some(logical_port), Some(mac)) = (&nat.logical_port, external_mac) {
                        lflows.add(key, Stage::LsInL2Lkup, 50,
                                   format!("eth.dst == {} && is_chassis_resident(\"{}\")",
                                           mac, logical_port),
                                   output.as_str());
                    }
                }
            }
        } else {
            info!("{}: invalid syntax '{}' in addresses column", nbsp.name, address);
        }
    }
}

/// Adds the logical flows of every logical switch to `lflows`, and the switch ports to
/// their multicast groups.
pub fn build_lswitch_flows(datapaths: &mut Datapaths, ports: &Ports, lflows: &mut LflowTable,
                           mcgroups: &mut McGroups) {
    for od in datapaths.iter() {
        let nbs = match &od.nbs {
            Some(nbs) => nbs,
            None => continue,
        };
        build_pre_acls(od, nbs, ports, lflows);
        build_pre_lb(od, nbs, lflows);
        build_pre_stateful(od, lflows);
        build_acls(od, nbs, lflows);
        build_qos(od, nbs, lflows);
        build_lb(od, nbs, lflows);
        build_stateful(od, nbs, lflows);

        // Logical VLANs are not supported, and a multicast source is invalid.
        lflows.add(od.key, Stage::LsInPortSecL2, 100, "vlan.present", "drop;");
        lflows.add(od.key, Stage::LsInPortSecL2, 100, "eth.src[40]", "drop;");

        lflows.add(od.key, Stage::LsInPortSecNd, 0, "1", "next;");
        lflows.add(od.key, Stage::LsInPortSecIp, 0, "1", "next;");
        lflows.add(od.key, Stage::LsInArpRsp, 0, "1", "next;");
        lflows.add(od.key, Stage::LsInDhcpOptions, 0, "1", "next;");
        lflows.add(od.key, Stage::LsInDhcpResponse, 0, "1", "next;");
        lflows.add(od.key, Stage::LsInL2Lkup, 100, "eth.mcast",
                   format!("outport = \"{}\"; output;", MC_FLOOD.name));
        lflows.add(od.key, Stage::LsOutPortSecIp, 0, "1", "next;");
        lflows.add(od.key, Stage::LsOutPortSecL2, 100, "eth.mcast", "output;");
    }

    for (index, op) in ports.iter().enumerate() {
        let nbsp = match &op.nbsp {
            Some(nbsp) => nbsp,
            None => continue,
        };
        let od = &datapaths[op.od];

        // Ingress port security.  Packets from disabled ports hit no flow and are dropped.
        if nbsp.is_enabled() {
            let mut match_ = format!("inport == {}", op.json_key);
            build_port_security_l2("eth.src", &op.ps_addrs, &mut match_);
            let actions = match op.sb_options.get("qdisc_queue_id") {
                Some(queue_id) => format!("set_queue({}); next;", queue_id),
                None => "next;".to_string(),
            };
            lflows.add(od.key, Stage::LsInPortSecL2, 50, match_, actions);

            if !nbsp.port_security.is_empty() {
                build_port_security_ip(Pipeline::Ingress, op, od, lflows);
                build_port_security_nd(op, od, lflows);
            }
        }

        // Localnet and vtep ports reach many hosts, which answer ARP themselves.
        if nbsp.type_ == "localnet" || nbsp.type_ == "vtep" {
            lflows.add(od.key, Stage::LsInArpRsp, 100, format!("inport == {}", op.json_key), "next;");
        }

        if lsp_is_up(nbsp) || nbsp.type_ == "router" {
            build_arp_nd_responder(op, od, lflows);
        }

        if nbsp.is_enabled() && nbsp.type_ != "router"
            && (nbsp.dhcpv4_options.is_some() || nbsp.dhcpv6_options.is_some()) {
            build_dhcp_flows(op, nbsp, od, lflows);
        }

        if nbsp.is_enabled() {
            mcgroups.add(&MC_FLOOD, op.od, index);
        }

        // Egress port security.  Disabled ports receive nothing, not even broadcasts.
        let mut match_ = format!("outport == {}", op.json_key);
        if nbsp.is_enabled() {
            build_port_security_l2("eth.dst", &op.ps_addrs, &mut match_);
            lflows.add(od.key, Stage::LsOutPortSecL2, 50, match_, "output;");
        } else {
            lflows.add(od.key, Stage::LsOutPortSecL2, 150, match_, "drop;");
        }
        if !nbsp.port_security.is_empty() {
            build_port_security_ip(Pipeline::Egress, op, od, lflows);
        }
    }

    for index in 0..ports.len() {
        build_l2_lookup(index, datapaths, ports, lflows, mcgroups);
    }

    for od in datapaths.iter().filter(|od| od.nbs.is_some() && od.has_unknown) {
        lflows.add(od.key, Stage::LsInL2Lkup, 0, "1",
                   format!("outport = \"{}\"; output;", MC_UNKNOWN.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Lflow;
    use crate::testing::build_topology;
    use anyhow::Result;
    use serde_json::json;
    use tracing_test::traced_test;

    fn build(nb_ops: serde_json::Value) -> Result<(Datapaths, Ports, LflowTable, McGroups)> {
        let (mut datapaths, ports) = build_topology(nb_ops)?;
        let mut lflows = LflowTable::new();
        let mut mcgroups = McGroups::default();
        build_lswitch_flows(&mut datapaths, &ports, &mut lflows, &mut mcgroups);
        Ok((datapaths, ports, lflows, mcgroups))
    }

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

    #[test]
    fn acls_and_port_security() -> Result<()> {
        let (datapaths, ports, lflows, mcgroups) = build(json!([
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm1",
             "row": {"name": "vm1", "addresses": "00:00:00:00:00:01 10.0.0.2",
                     "port_security": "00:00:00:00:00:01 10.0.0.2"}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm2",
             "row": {"name": "vm2", "addresses": "unknown"}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm3",
             "row": {"name": "vm3", "addresses": "00:00:00:00:00:03", "enabled": false}},
            {"op": "insert", "table": "ACL", "uuid-name": "web",
             "row": {"priority": 100, "direction": "from-lport", "match": "tcp.dst == 80",
                     "action": "allow-related"}},
            {"op": "insert", "table": "ACL", "uuid-name": "block",
             "row": {"priority": 10, "direction": "to-lport", "match": "ip4.src == 10.0.0.0/8",
                     "action": "drop"}},
            {"op": "insert", "table": "Logical_Switch", "row": {"name": "sw0",
             "ports": ["set", [["named-uuid", "vm1"], ["named-uuid", "vm2"], ["named-uuid", "vm3"]]],
             "acls": ["set", [["named-uuid", "web"], ["named-uuid", "block"]]]}},
        ]))?;
        let sw0 = &datapaths[0];

        assert!(has_flow(&lflows, sw0, Stage::LsInPreAcl, 100, "ip", "reg0[0] = 1; next;"));
        assert!(has_flow(&lflows, sw0, Stage::LsInAcl, 1100,
                         "((ct.new && !ct.est) || (!ct.new && ct.est && !ct.rpl && ct_label.blocked == 1)) \
                          && (tcp.dst == 80)",
                         "reg0[1] = 1; next;"));
        assert!(has_flow(&lflows, sw0, Stage::LsOutAcl, 1010,
                         "ct.est && ct_label.blocked == 0 && (ip4.src == 10.0.0.0/8)",
                         "ct_commit(ct_label=1/1);"));
        assert!(has_flow(&lflows, sw0, Stage::LsOutAcl, u16::MAX, "nd", "next;"));

        assert!(has_flow(&lflows, sw0, Stage::LsInPortSecL2, 50,
                         "inport == \"vm1\" && eth.src == {00:00:00:00:00:01}", "next;"));
        assert!(has_flow(&lflows, sw0, Stage::LsInPortSecIp, 90,
                         "inport == \"vm1\" && eth.src == 00:00:00:00:00:01 && ip4.src == {10.0.0.2}",
                         "next;"));
        assert!(has_flow(&lflows, sw0, Stage::LsInPortSecIp, 80,
                         "inport == \"vm1\" && eth.src == 00:00:00:00:00:01 && ip", "drop;"));
        assert!(has_flow(&lflows, sw0, Stage::LsInPortSecNd, 80,
                         "inport == \"vm1\" && (arp || nd)", "drop;"));
        assert!(has_flow(&lflows, sw0, Stage::LsOutPortSecL2, 150, "outport == \"vm3\"", "drop;"));
        assert!(lflows.stage_flows(&sw0.key, Stage::LsInPortSecL2).iter()
                .all(|lflow| !lflow.match_.contains("\"vm3\"")));

        assert!(has_flow(&lflows, sw0, Stage::LsInArpRsp, 50, "arp.tpa == 10.0.0.2 && arp.op == 1",
                         "eth.dst = eth.src; eth.src = 00:00:00:00:00:01; arp.op = 2; /* ARP reply */ \
                          arp.tha = arp.sha; arp.sha = 00:00:00:00:00:01; arp.tpa = arp.spa; \
                          arp.spa = 10.0.0.2; outport = inport; flags.loopback = 1; output;"));
        assert!(has_flow(&lflows, sw0, Stage::LsInL2Lkup, 50, "eth.dst == 00:00:00:00:00:01",
                         "outport = \"vm1\"; output;"));
        assert!(has_flow(&lflows, sw0, Stage::LsInL2Lkup, 0, "1", "outport = \"_MC_unknown\"; output;"));
        assert!(datapaths[0].has_unknown);

        let vm2 = ports.find("vm2").unwrap();
        assert_eq!(mcgroups.ports(&MC_UNKNOWN, 0), &[vm2]);
        assert_eq!(mcgroups.ports(&MC_FLOOD, 0).len(), 2);
        Ok(())
    }

    #[traced_test]
    #[test]
    fn dhcp() -> Result<()> {
        let (datapaths, _, lflows, _) = build(json!([
            {"op": "insert", "table": "DHCP_Options", "uuid-name": "opts",
             "row": {"cidr": "10.0.0.0/24",
                     "options": ["map", [["server_id", "10.0.0.1"], ["server_mac", "00:00:00:00:00:fe"],
                                         ["lease_time", "3600"], ["router", "10.0.0.1"]]]}},
            {"op": "insert", "table": "DHCP_Options", "uuid-name": "incomplete",
             "row": {"cidr": "10.0.0.0/24", "options": ["map", [["router", "10.0.0.1"]]]}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm1",
             "row": {"name": "vm1", "addresses": "00:00:00:00:00:01 10.0.0.2",
                     "dhcpv4_options": ["named-uuid", "opts"]}},
            {"op": "insert", "table": "Logical_Switch_Port", "uuid-name": "vm2",
             "row": {"name": "vm2", "addresses": "00:00:00:00:00:02 10.0.0.3",
                     "dhcpv4_options": ["named-uuid", "incomplete"]}},
            {"op": "insert", "table": "Logical_Switch", "row": {"name": "sw0",
             "ports": ["set", [["named-uuid", "vm1"], ["named-uuid", "vm2"]]]}},
        ]))?;
        let sw0 = &datapaths[0];

        let options = "reg0[3] = put_dhcp_opts(offerip = 10.0.0.2, lease_time = 3600, \
                       netmask = 255.255.255.0, router = 10.0.0.1, server_id = 10.0.0.1); next;";
        assert!(has_flow(&lflows, sw0, Stage::LsInDhcpOptions, 100,
                         "inport == \"vm1\" && eth.src == 00:00:00:00:00:01 && ip4.src == 0.0.0.0 \
                          && ip4.dst == 255.255.255.255 && udp.src == 68 && udp.dst == 67",
                         options));
        assert!(has_flow(&lflows, sw0, Stage::LsInDhcpResponse, 100,
                         "inport == \"vm1\" && eth.src == 00:00:00:00:00:01 && ip4 && udp.src == 68 \
                          && udp.dst == 67 && reg0[3]",
                         "eth.dst = eth.src; eth.src = 00:00:00:00:00:fe; ip4.dst = 10.0.0.2; \
                          ip4.src = 10.0.0.1; udp.src = 67; udp.dst = 68; outport = inport; \
                          flags.loopback = 1; output;"));
        assert!(has_flow(&lflows, sw0, Stage::LsOutAcl, 34000,
                         "outport == \"vm1\" && eth.src == 00:00:00:00:00:fe && ip4.src == 10.0.0.1 \
                          && udp && udp.src == 67 && udp.dst == 68",
                         "next;"));

        assert!(lflows.stage_flows(&sw0.key, Stage::LsInDhcpOptions).iter()
                .all(|lflow| !lflow.match_.contains("\"vm2\"")));
        assert!(logs_contain("Required DHCPv4 options not defined for lport - \"vm2\""));
        Ok(())
    }

    #[test]
    fn load_balancer_and_qos() -> Result<()> {
        let (datapaths, _, lflows, _) = build(json!([
            {"op": "insert", "table": "Load_Balancer", "uuid-name": "lb",
             "row": {"name": "lb0", "vips": ["map", [["10.0.0.10:80", "10.0.0.2:8080"],
                                                     ["10.0.0.11", "10.0.0.3"]]]}},
            {"op": "insert", "table": "QoS", "uuid-name": "qos",
             "row": {"priority": 100, "direction": "from-lport", "match": "ip4",
                     "action": ["map", [["dscp", 10]]]}},
            {"op": "insert", "table": "Logical_Switch", "row": {"name": "sw0",
             "load_balancer": ["named-uuid", "lb"], "qos_rules": ["named-uuid", "qos"]}},
        ]))?;
        let sw0 = &datapaths[0];

        assert!(has_flow(&lflows, sw0, Stage::LsInPreLb, 100, "ip && ip4.dst == 10.0.0.10",
                         "reg0[0] = 1; next;"));
        assert!(has_flow(&lflows, sw0, Stage::LsOutPreLb, 100, "ip", "reg0[0] = 1; next;"));
        assert!(has_flow(&lflows, sw0, Stage::LsInLb, u16::MAX, "ct.est && !ct.rel && !ct.new && !ct.inv",
                         "reg0[2] = 1; next;"));
        assert!(has_flow(&lflows, sw0, Stage::LsInStateful, 120,
                         "ct.new && ip4.dst == 10.0.0.10 && tcp.dst == 80", "ct_lb(10.0.0.2:8080);"));
        assert!(has_flow(&lflows, sw0, Stage::LsInStateful, 110, "ct.new && ip4.dst == 10.0.0.11",
                         "ct_lb(10.0.0.3);"));
        assert!(has_flow(&lflows, sw0, Stage::LsInQosMark, 100, "ip4", "ip.dscp = 10; next;"));
        Ok(())
    }
}
