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

//! IP and MAC address management for logical switch ports with `dynamic` addresses.
//!
//! MAC addresses come from the `0a:00:00:00:00:00/24` block and must be unique across all
//! logical switches.  IPv4 addresses come from a switch's `other_config:subnet` and must be
//! unique within the switch.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use anyhow::Result;
use ovn::addresses::{extract_lsp_addresses, is_dynamic_lsp_address, parse_ipv4_cidr, EthAddr};
use ovsdb_client::Datum;
use tracing::{event, info, Level};

use crate::context::NorthdContext;
use crate::datapath::Datapaths;
use crate::port::Ports;

pub const MAC_ADDR_PREFIX: u64 = 0x0A_00_00_00_00_00;
pub const MAC_ADDR_SPACE: u32 = 0xff_ffff;

/// The MAC addresses in use.  Only addresses with [`MAC_ADDR_PREFIX`] are tracked, since
/// only those can collide with allocated addresses.
#[derive(Clone, Debug, Default)]
pub struct Macam {
    macs: BTreeSet<u64>,
    /// Suffix of the most recently allocated address.
    last_mac: u32,
}

impl Macam {
    fn is_duplicate(&self, mac64: u64, warn: bool) -> bool {
        if self.macs.contains(&mac64) {
            if warn {
                event!(Level::WARN, "Duplicate MAC set: {}", EthAddr::from_u64(mac64));
            }
            return true;
        }
        false
    }

    pub fn insert(&mut self, ea: &EthAddr, check: bool) {
        let mac64 = ea.to_u64();
        // Addresses outside the block can never be allocated.
        if (mac64 ^ MAC_ADDR_PREFIX) >> 24 != 0 || (check && self.is_duplicate(mac64, true)) {
            return;
        }
        self.macs.insert(mac64);
    }

    pub fn contains(&self, ea: &EthAddr) -> bool {
        self.macs.contains(&ea.to_u64())
    }

    /// Finds an unused address in the block, starting just after the last one allocated.
    /// The address is not marked as in use.
    pub fn get_unused(&mut self) -> Option<EthAddr> {
        for i in 0..MAC_ADDR_SPACE - 1 {
            // Suffixes 000000 and ffffff are never used.
            let suffix = (self.last_mac.wrapping_add(i)) % (MAC_ADDR_SPACE - 1) + 1;
            let mac64 = MAC_ADDR_PREFIX | suffix as u64;
            if !self.is_duplicate(mac64, false) {
                self.last_mac = suffix;
                return Some(EthAddr::from_u64(mac64));
            }
        }

        event!(Level::WARN, "MAC address space exhausted.");
        None
    }
}

/// The IPv4 subnet of a logical switch and the addresses in use in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpamInfo {
    /// Network address and mask, in host byte order.
    pub subnet: u32,
    pub mask: u32,
    ips: BTreeSet<u32>,
}

impl IpamInfo {
    pub fn insert_ip(&mut self, ip: u32, check: bool) {
        if check && self.ips.contains(&ip) {
            event!(Level::WARN, "Duplicate IP set: {}", Ipv4Addr::from(ip));
            return;
        }
        self.ips.insert(ip);
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.ips.contains(&u32::from(ip))
    }

    /// Finds an unused host address in the subnet.  The first host address is left for a
    /// logical router port, and the broadcast address is never used.
    pub fn get_unused_ip(&self) -> Option<u32> {
        for i in 2..!self.mask {
            let ip = self.subnet + i;
            if !self.ips.contains(&ip) {
                return Some(ip);
            }
        }

        event!(Level::WARN, "Subnet address space has been exhausted.");
        None
    }

    /// Marks the addresses in `exclude_ips` as in use.  It is a space-separated list of
    /// addresses and `FIRST..LAST` ranges.
    fn exclude(&mut self, exclude_ips: &str) {
        let first_host = self.subnet + 1;
        let last_host = self.subnet | !self.mask;
        for word in exclude_ips.split_whitespace() {
            let range = match word.split_once("..") {
                Some((first, last)) => first.parse::<Ipv4Addr>().ok()
                    .zip(last.parse::<Ipv4Addr>().ok()),
                None => word.parse::<Ipv4Addr>().ok().map(|ip| (ip, ip)),
            };
            let (first, last) = match range {
                Some((first, last)) if first <= last => (u32::from(first), u32::from(last)),
                _ => {
                    event!(Level::WARN, "invalid syntax '{}' in exclude_ips", word);
                    continue;
                }
            };
            if last < first_host || first > last_host {
                event!(Level::WARN, "excluded addresses {} not in subnet {}/{}",
                       word, Ipv4Addr::from(self.subnet), self.mask.leading_ones());
                continue;
            }
            self.ips.extend(first.max(first_host)..=last.min(last_host));
        }
    }
}

/// Reads the IPAM configuration of a logical switch from its `other_config`.  Returns
/// `None` if it has no `subnet` or if `subnet` is invalid.
pub fn init_ipam_info_for_datapath(other_config: &BTreeMap<String, String>) -> Option<IpamInfo> {
    let subnet_s = other_config.get("subnet")?;
    let (subnet, plen) = match parse_ipv4_cidr(subnet_s) {
        Some((addr, plen)) if plen < 32 => (u32::from(addr), plen),
        _ => {
            event!(Level::WARN, "bad 'subnet' {}", subnet_s);
            return None;
        }
    };
    let mask = u32::MAX.checked_shl(32 - u32::from(plen)).unwrap_or(0);
    let mut ipam = IpamInfo { subnet: subnet & mask, mask, ips: BTreeSet::new() };
    if let Some(exclude_ips) = other_config.get("exclude_ips") {
        ipam.exclude(exclude_ips);
    }
    Some(ipam)
}

/// Records the MAC and IPv4 addresses in `address`, from the `addresses` or
/// `dynamic_addresses` column of a logical switch port, as in use.
pub fn ipam_insert_lsp_addresses(ipam: Option<&mut IpamInfo>, macam: &mut Macam, address: &str) {
    if address == "unknown" || address == "router" || is_dynamic_lsp_address(address) {
        return;
    }

    let laddrs = match extract_lsp_addresses(address) {
        Some(laddrs) => laddrs,
        None => {
            event!(Level::WARN, "Extract addresses failed.");
            return;
        }
    };
    macam.insert(&laddrs.ea, true);

    // The MAC counts everywhere, the IPs only within a switch that has a subnet.
    if let Some(ipam) = ipam {
        for addr in &laddrs.ipv4_addrs {
            ipam.insert_ip(u32::from(addr.addr()), true);
        }
    }
}

/// Allocates addresses for `address`, which is either `dynamic` or `MAC dynamic`, and
/// records them as in use.  Returns the new `dynamic_addresses` value.
pub fn ipam_allocate_addresses(ipam: &mut IpamInfo, macam: &mut Macam, address: &str) -> Option<String> {
    let ip = ipam.get_unused_ip()?;

    let (mac, check_mac) = match address.split_whitespace().collect::<Vec<_>>()[..] {
        [mac, "dynamic"] => (mac.parse::<EthAddr>().ok()?, true),
        _ => (macam.get_unused()?, false),
    };

    ipam.insert_ip(ip, false);
    macam.insert(&mac, check_mac);
    Some(format!("{} {}", mac, Ipv4Addr::from(ip)))
}

/// Assigns addresses to logical switch ports that ask for `dynamic` addresses and do not
/// have any yet, on switches with a subnet.
pub fn build_ipam(ctx: &mut NorthdContext, datapaths: &mut Datapaths, ports: &mut Ports) -> Result<()> {
    for od in datapaths.iter_mut() {
        let (nbs, ipam) = match (&od.nbs, &mut od.ipam) {
            (Some(nbs), Some(ipam)) => (nbs, ipam),
            _ => continue,
        };

        for nbsp in &nbs.ports {
            let op = match ports.find_mut(&nbsp.name) {
                Some(op) if op.peer.is_none() => op,
                _ => continue,
            };
            let lsp = match &mut op.nbsp {
                Some(lsp) if lsp.uuid == nbsp.uuid => lsp,
                _ => continue,
            };
            if lsp.dynamic_addresses.is_some() {
                continue;
            }
            let address = match lsp.addresses.iter().find(|a| is_dynamic_lsp_address(a)) {
                Some(address) => address.clone(),
                None => continue,
            };

            let laddrs = ipam_allocate_addresses(ipam, &mut ctx.macam, &address)
                .and_then(|dynamic| extract_lsp_addresses(&dynamic).map(|laddrs| (dynamic, laddrs)));
            match laddrs {
                Some((dynamic, laddrs)) => {
                    ctx.nb.write("Logical_Switch_Port", &lsp.uuid, "dynamic_addresses",
                                 Datum::scalar(dynamic.as_str()))?;
                    lsp.dynamic_addresses = Some(dynamic);
                    op.lsp_addrs.push(laddrs);
                },
                None => info!("Failed to allocate address."),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn config(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn allocates_in_order() {
        let mut ipam = init_ipam_info_for_datapath(&config(&[("subnet", "192.168.1.0/24")])).unwrap();
        let mut macam = Macam::default();
        ipam_insert_lsp_addresses(Some(&mut ipam), &mut macam, "0a:00:00:00:00:01 192.168.1.2");

        assert_eq!(ipam_allocate_addresses(&mut ipam, &mut macam, "dynamic").as_deref(),
                   Some("0a:00:00:00:00:02 192.168.1.3"));
        assert_eq!(ipam_allocate_addresses(&mut ipam, &mut macam, "00:11:22:33:44:55 dynamic").as_deref(),
                   Some("00:11:22:33:44:55 192.168.1.4"));
        assert_eq!(ipam_allocate_addresses(&mut ipam, &mut macam, "dynamic").as_deref(),
                   Some("0a:00:00:00:00:03 192.168.1.5"));
    }

    #[test]
    fn exclude_ips() {
        let mut ipam = init_ipam_info_for_datapath(&config(&[
            ("subnet", "10.0.0.0/29"),
            ("exclude_ips", "10.0.0.2..10.0.0.4 10.0.0.6"),
        ])).unwrap();
        assert!(ipam.contains("10.0.0.3".parse().unwrap()));
        assert_eq!(ipam.get_unused_ip().map(Ipv4Addr::from), Some("10.0.0.5".parse().unwrap()));
        ipam.insert_ip(u32::from("10.0.0.5".parse::<Ipv4Addr>().unwrap()), false);
        assert_eq!(ipam.get_unused_ip(), None);
    }

    #[traced_test]
    #[test]
    fn bad_subnet() {
        assert!(init_ipam_info_for_datapath(&config(&[("subnet", "10.0.0.1")])).is_none());
        assert!(logs_contain("bad 'subnet' 10.0.0.1"));
        assert!(init_ipam_info_for_datapath(&config(&[])).is_none());
    }

    #[test]
    fn whole_address_space() {
        let ipam = init_ipam_info_for_datapath(&config(&[("subnet", "0.0.0.0/0")])).unwrap();
        assert_eq!(ipam.mask, 0);
        assert_eq!(ipam.subnet, 0);
        assert_eq!(ipam.get_unused_ip().map(Ipv4Addr::from), Some("0.0.0.2".parse().unwrap()));
    }

    #[traced_test]
    #[test]
    fn duplicate_mac() {
        let mut macam = Macam::default();
        let ea: EthAddr = "0a:00:00:00:00:07".parse().unwrap();
        macam.insert(&ea, true);
        macam.insert(&ea, true);
        assert!(logs_contain("Duplicate MAC set: 0a:00:00:00:00:07"));

        // Outside the allocation block, so never tracked.
        let other: EthAddr = "00:00:00:00:00:07".parse().unwrap();
        macam.insert(&other, true);
        assert!(!macam.contains(&other));
    }
}
