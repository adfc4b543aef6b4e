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

//! Ethernet and IP addresses as they appear in logical port configuration.

use ipnet::{Ipv4Net, Ipv6Net};
use thiserror::Error;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use tracing::{event, info, Level};

#[derive(Error, Debug)]
#[error("{0}")]
pub struct AddressParseError(pub String);

/// A 48-bit Ethernet address.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EthAddr(pub [u8; 6]);

impl EthAddr {
    pub const ZERO: EthAddr = EthAddr([0; 6]);
    pub const BROADCAST: EthAddr = EthAddr([0xff; 6]);

    /// The Ethernet address in the low 48 bits of `x`.
    pub fn from_u64(x: u64) -> EthAddr {
        let b = x.to_be_bytes();
        EthAddr([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0, |acc, &b| (acc << 8) | b as u64)
    }

    pub fn is_zero(&self) -> bool {
        *self == EthAddr::ZERO
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 1 != 0
    }

    /// The IPv6 link-local address that stateless autoconfiguration derives from this
    /// address (modified EUI-64).
    pub fn to_ipv6_lla(&self) -> Ipv6Addr {
        let e = self.0;
        Ipv6Addr::from([0xfe, 0x80, 0, 0, 0, 0, 0, 0,
                        e[0] ^ 0x02, e[1], e[2], 0xff, 0xfe, e[3], e[4], e[5]])
    }
}

impl FromStr for EthAddr {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<EthAddr, AddressParseError> {
        let error = || AddressParseError(format!("{}: invalid Ethernet address", s));
        let mut ea = [0u8; 6];
        let mut parts = s.split(':');
        for byte in ea.iter_mut() {
            let part = parts.next().ok_or_else(error)?;
            if part.is_empty() || part.len() > 2 {
                return Err(error());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| error())?;
        }
        if parts.next().is_some() {
            return Err(error());
        }
        Ok(EthAddr(ea))
    }
}

impl fmt::Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", e[0], e[1], e[2], e[3], e[4], e[5])
    }
}

/// True if `mask` is a CIDR mask, that is, some number of 1-bits followed only by 0-bits.
pub fn ip_is_cidr(mask: Ipv4Addr) -> bool {
    let x = u32::from(mask);
    x.leading_ones() + x.trailing_zeros() == 32
}

/// Parses `s` as `IP`, `IP/PLEN`, or `IP/MASK` where MASK must be a CIDR mask.  A bare
/// address has prefix length 32.
pub fn parse_ipv4_cidr(s: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, plen) = match s.split_once('/') {
        Some((addr, plen)) => {
            let plen = match plen.parse::<u8>() {
                Ok(plen) if plen <= 32 => plen,
                Ok(_) => return None,
                Err(_) => {
                    let mask = plen.parse::<Ipv4Addr>().ok()?;
                    if !ip_is_cidr(mask) {
                        return None;
                    }
                    u32::from(mask).leading_ones() as u8
                }
            };
            (addr, plen)
        },
        None => (s, 32),
    };
    Some((addr.parse().ok()?, plen))
}

/// Like [`parse_ipv4_cidr`] for IPv6.  A bare address has prefix length 128.
pub fn parse_ipv6_cidr(s: &str) -> Option<(Ipv6Addr, u8)> {
    let (addr, plen) = match s.split_once('/') {
        Some((addr, plen)) => match plen.parse::<u8>() {
            Ok(plen) if plen <= 128 => (addr, plen),
            _ => return None,
        },
        None => (s, 128),
    };
    Some((addr.parse().ok()?, plen))
}

/// An IPv4 address together with the prefix length of its network.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Netaddr(pub Ipv4Net);

impl Ipv4Netaddr {
    pub fn new(addr: Ipv4Addr, plen: u8) -> Option<Ipv4Netaddr> {
        Ipv4Net::new(addr, plen).ok().map(Ipv4Netaddr)
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.0.addr()
    }

    pub fn plen(&self) -> u8 {
        self.0.prefix_len()
    }

    pub fn mask(&self) -> Ipv4Addr {
        self.0.netmask()
    }

    pub fn network(&self) -> Ipv4Addr {
        self.0.network()
    }

    pub fn bcast(&self) -> Ipv4Addr {
        self.0.broadcast()
    }

    /// True if the address is not the network address of its prefix.
    pub fn has_host_bits(&self) -> bool {
        u32::from(self.addr()) & !u32::from(self.mask()) != 0
    }

    /// `NETWORK/PLEN`.
    pub fn network_s(&self) -> String {
        format!("{}/{}", self.network(), self.plen())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv6Netaddr(pub Ipv6Net);

impl Ipv6Netaddr {
    pub fn new(addr: Ipv6Addr, plen: u8) -> Option<Ipv6Netaddr> {
        Ipv6Net::new(addr, plen).ok().map(Ipv6Netaddr)
    }

    pub fn addr(&self) -> Ipv6Addr {
        self.0.addr()
    }

    pub fn plen(&self) -> u8 {
        self.0.prefix_len()
    }

    pub fn mask(&self) -> Ipv6Addr {
        self.0.netmask()
    }

    pub fn network(&self) -> Ipv6Addr {
        self.0.network()
    }

    pub fn network_s(&self) -> String {
        format!("{}/{}", self.network(), self.plen())
    }

    /// The solicited-node multicast address for this address.
    pub fn sn_addr(&self) -> Ipv6Addr {
        let a = self.addr().octets();
        Ipv6Addr::from([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0xff, a[13], a[14], a[15]])
    }

    pub fn is_lla(&self) -> bool {
        self.addr().segments()[0] & 0xffc0 == 0xfe80
    }
}

/// The Ethernet address of a logical port and the IP addresses that go with it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LportAddresses {
    pub ea: EthAddr,
    pub ipv4_addrs: Vec<Ipv4Netaddr>,
    pub ipv6_addrs: Vec<Ipv6Netaddr>,
}

impl LportAddresses {
    pub fn ea_s(&self) -> String {
        self.ea.to_string()
    }

    pub fn has_ip(&self) -> bool {
        !self.ipv4_addrs.is_empty() || !self.ipv6_addrs.is_empty()
    }
}

/// Splits off the Ethernet address that `address` starts with.
fn split_eth_addr(address: &str) -> Option<(EthAddr, &str)> {
    let address = address.trim_start();
    let end = address.find(char::is_whitespace).unwrap_or_else(|| address.len());
    let ea = address[..end].parse().ok()?;
    Some((ea, &address[end..]))
}

/// True if `address` asks for dynamically assigned addresses: either `dynamic` alone or
/// `MAC dynamic`.
pub fn is_dynamic_lsp_address(address: &str) -> bool {
    address == "dynamic" || matches!(split_eth_addr(address), Some((_, rest)) if rest.trim() == "dynamic")
}

/// Parses the `MAC [IP...]` syntax of the `addresses` and `port_security` columns of
/// `Logical_Switch_Port`.  IP addresses may have a prefix length.  Returns `None` if the
/// string does not start with a MAC or if any IP address is invalid.
pub fn extract_lsp_addresses(address: &str) -> Option<LportAddresses> {
    let (ea, rest) = split_eth_addr(address)?;
    let mut laddrs = LportAddresses { ea, ..Default::default() };
    for word in rest.split_whitespace() {
        if let Some((addr, plen)) = parse_ipv4_cidr(word) {
            laddrs.ipv4_addrs.extend(Ipv4Netaddr::new(addr, plen));
        } else if let Some((addr, plen)) = parse_ipv6_cidr(word) {
            laddrs.ipv6_addrs.extend(Ipv6Netaddr::new(addr, plen));
        } else {
            info!("invalid syntax '{}' in address", address);
            return None;
        }
    }
    Some(laddrs)
}

/// Parses the `mac` and `networks` columns of a `Logical_Router_Port`.  Returns `None` if
/// `mac` is invalid.  Invalid networks are skipped.  The IPv6 link-local address derived
/// from `mac` is always included.
pub fn extract_lrp_networks(mac: &str, networks: &[String]) -> Option<LportAddresses> {
    let ea = mac.parse().ok()?;
    let mut laddrs = LportAddresses { ea, ..Default::default() };
    for network in networks {
        if let Some((addr, plen)) = parse_ipv4_cidr(network) {
            if addr.is_unspecified() {
                event!(Level::WARN, "bad 'networks' {}", network);
                continue;
            }
            laddrs.ipv4_addrs.extend(Ipv4Netaddr::new(addr, plen));
        } else if let Some((addr, plen)) = parse_ipv6_cidr(network) {
            laddrs.ipv6_addrs.extend(Ipv6Netaddr::new(addr, plen));
        } else {
            event!(Level::WARN, "invalid syntax '{}' in networks", network);
        }
    }
    laddrs.ipv6_addrs.extend(Ipv6Netaddr::new(ea.to_ipv6_lla(), 64));
    Some(laddrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn eth_addr() {
        let ea: EthAddr = "0a:00:00:00:00:01".parse().unwrap();
        assert_eq!(ea.to_u64(), 0x0a00_0000_0001);
        assert_eq!(EthAddr::from_u64(0x0a00_0000_0001), ea);
        assert_eq!(ea.to_string(), "0a:00:00:00:00:01");
        assert!("0a:00:00:00:00".parse::<EthAddr>().is_err());
        assert!("0a:00:00:00:00:01:02".parse::<EthAddr>().is_err());
        assert!("0a:00:00:00:00:xy".parse::<EthAddr>().is_err());
        assert!(EthAddr::BROADCAST.is_multicast());
    }

    #[test]
    fn link_local() {
        let ea: EthAddr = "00:00:00:00:ff:01".parse().unwrap();
        assert_eq!(ea.to_ipv6_lla(), "fe80::200:ff:fe00:ff01".parse::<Ipv6Addr>().unwrap());
        let lla = Ipv6Netaddr::new(ea.to_ipv6_lla(), 64).unwrap();
        assert!(lla.is_lla());
        assert_eq!(lla.sn_addr(), "ff02::1:ff00:ff01".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn netaddr() {
        let a = Ipv4Netaddr::new("192.168.1.5".parse().unwrap(), 24).unwrap();
        assert_eq!(a.network_s(), "192.168.1.0/24");
        assert_eq!(a.bcast(), "192.168.1.255".parse::<Ipv4Addr>().unwrap());
        assert_eq!(a.mask(), "255.255.255.0".parse::<Ipv4Addr>().unwrap());
        assert!(a.has_host_bits());
        assert!(!Ipv4Netaddr::new("192.168.1.0".parse().unwrap(), 24).unwrap().has_host_bits());
        assert_eq!(parse_ipv4_cidr("10.0.0.0/255.255.0.0"), Some(("10.0.0.0".parse().unwrap(), 16)));
        assert_eq!(parse_ipv4_cidr("10.0.0.0/255.0.255.0"), None);
        assert_eq!(parse_ipv4_cidr("10.0.0.1"), Some(("10.0.0.1".parse().unwrap(), 32)));
    }

    #[test]
    fn lsp_addresses() {
        let laddrs = extract_lsp_addresses("aa:bb:cc:dd:ee:ff 10.0.0.5 fe80::1/64").unwrap();
        assert_eq!(laddrs.ea_s(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(laddrs.ipv4_addrs.len(), 1);
        assert_eq!(laddrs.ipv4_addrs[0].plen(), 32);
        assert_eq!(laddrs.ipv6_addrs[0].plen(), 64);

        assert!(extract_lsp_addresses("unknown").is_none());
        assert!(is_dynamic_lsp_address("dynamic"));
        assert!(is_dynamic_lsp_address("0a:00:00:00:00:07 dynamic"));
        assert!(!is_dynamic_lsp_address("0a:00:00:00:00:07 10.0.0.7"));
    }

    #[traced_test]
    #[test]
    fn bad_lsp_address() {
        assert!(extract_lsp_addresses("aa:bb:cc:dd:ee:ff 10.0.0.300").is_none());
        assert!(logs_contain("invalid syntax 'aa:bb:cc:dd:ee:ff 10.0.0.300' in address"));
    }

    #[traced_test]
    #[test]
    fn lrp_networks() {
        let networks = vec!["192.168.0.1/24".to_string(), "bogus".to_string(), "2001:db8::1/64".to_string()];
        let laddrs = extract_lrp_networks("00:00:00:00:ff:01", &networks).unwrap();
        assert_eq!(laddrs.ipv4_addrs.len(), 1);
        assert_eq!(laddrs.ipv6_addrs.len(), 2);
        assert!(laddrs.ipv6_addrs[1].is_lla());
        assert!(logs_contain("invalid syntax 'bogus' in networks"));
        assert!(extract_lrp_networks("bogus", &networks).is_none());
    }
}
