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

//! DHCPv4 and DHCPv6 options that `put_dhcp_opts` and `put_dhcpv6_opts` can supply, and
//! their encoding into the userdata of the controller action.

use std::collections::BTreeMap;

use crate::lex::Constant;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DhcpOptType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Ipv4,
    /// Pairs of (destination network, gateway), per RFC 3442.
    StaticRoutes,
    Str,
    Ipv6,
    Mac,
}

impl DhcpOptType {
    /// The type's name in the Southbound `DHCP_Options` and `DHCPv6_Options` tables.
    pub fn name(&self) -> &'static str {
        match self {
            DhcpOptType::Bool => "bool",
            DhcpOptType::Uint8 => "uint8",
            DhcpOptType::Uint16 => "uint16",
            DhcpOptType::Uint32 => "uint32",
            DhcpOptType::Ipv4 => "ipv4",
            DhcpOptType::StaticRoutes => "static_routes",
            DhcpOptType::Str => "str",
            DhcpOptType::Ipv6 => "ipv6",
            DhcpOptType::Mac => "mac",
        }
    }

    pub fn from_name(name: &str) -> Option<DhcpOptType> {
        Some(match name {
            "bool" => DhcpOptType::Bool,
            "uint8" => DhcpOptType::Uint8,
            "uint16" => DhcpOptType::Uint16,
            "uint32" => DhcpOptType::Uint32,
            "ipv4" => DhcpOptType::Ipv4,
            "static_routes" => DhcpOptType::StaticRoutes,
            "str" => DhcpOptType::Str,
            "ipv6" => DhcpOptType::Ipv6,
            "mac" => DhcpOptType::Mac,
            _ => return None,
        })
    }

    /// Whether values of this type are strings rather than integers or addresses.
    pub fn is_string(&self) -> bool {
        *self == DhcpOptType::Str
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpOption {
    pub name: String,
    pub code: u16,
    pub type_: DhcpOptType,
}

/// Pseudo-option that carries the address to offer.  It has no code of its own in the packet.
pub const DHCP_OPT_OFFERIP: &str = "offerip";
pub const DHCP_OPT_OFFERIP_CODE: u16 = 0;

pub const SUPPORTED_DHCP_OPTS: &[(&str, u16, DhcpOptType)] = &[
    (DHCP_OPT_OFFERIP, DHCP_OPT_OFFERIP_CODE, DhcpOptType::Ipv4),
    ("netmask", 1, DhcpOptType::Ipv4),
    ("router", 3, DhcpOptType::Ipv4),
    ("dns_server", 6, DhcpOptType::Ipv4),
    ("log_server", 7, DhcpOptType::Ipv4),
    ("lpr_server", 9, DhcpOptType::Ipv4),
    ("swap_server", 16, DhcpOptType::Ipv4),
    ("policy_filter", 21, DhcpOptType::Ipv4),
    ("router_solicitation", 32, DhcpOptType::Ipv4),
    ("nis_server", 41, DhcpOptType::Ipv4),
    ("ntp_server", 42, DhcpOptType::Ipv4),
    ("server_id", 54, DhcpOptType::Ipv4),
    ("tftp_server", 66, DhcpOptType::Ipv4),
    ("classless_static_route", 121, DhcpOptType::StaticRoutes),
    ("ms_classless_static_route", 249, DhcpOptType::StaticRoutes),
    ("ip_forward_enable", 19, DhcpOptType::Bool),
    ("router_discovery", 31, DhcpOptType::Bool),
    ("ethernet_encap", 36, DhcpOptType::Bool),
    ("default_ttl", 23, DhcpOptType::Uint8),
    ("tcp_ttl", 37, DhcpOptType::Uint8),
    ("mtu", 26, DhcpOptType::Uint16),
    ("lease_time", 51, DhcpOptType::Uint32),
    ("T1", 58, DhcpOptType::Uint32),
    ("T2", 59, DhcpOptType::Uint32),
];

pub const SUPPORTED_DHCPV6_OPTS: &[(&str, u16, DhcpOptType)] = &[
    ("ia_addr", 5, DhcpOptType::Ipv6),
    ("server_id", 2, DhcpOptType::Mac),
    ("domain_search", 24, DhcpOptType::Str),
    ("dns_server", 23, DhcpOptType::Ipv6),
];

/// A set of DHCP options, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct DhcpOpts(BTreeMap<String, DhcpOption>);

impl DhcpOpts {
    pub fn new() -> DhcpOpts {
        DhcpOpts::default()
    }

    fn from_table(table: &[(&str, u16, DhcpOptType)]) -> DhcpOpts {
        let mut opts = DhcpOpts::new();
        for (name, code, type_) in table {
            opts.insert(name, *code, *type_);
        }
        opts
    }

    pub fn supported_v4() -> DhcpOpts {
        DhcpOpts::from_table(SUPPORTED_DHCP_OPTS)
    }

    pub fn supported_v6() -> DhcpOpts {
        DhcpOpts::from_table(SUPPORTED_DHCPV6_OPTS)
    }

    pub fn insert(&mut self, name: &str, code: u16, type_: DhcpOptType) {
        self.0.insert(name.into(), DhcpOption { name: name.into(), code, type_ });
    }

    pub fn lookup(&self, name: &str) -> Option<&DhcpOption> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DhcpOption> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn int(c: &Constant) -> u128 {
    c.integer().unwrap_or(0)
}

fn string(c: &Constant) -> &[u8] {
    match c {
        Constant::String(s) => s.as_bytes(),
        Constant::Integer { .. } => &[],
    }
}

/// Appends a DHCPv4 option to `out` as code, length, and data.
pub fn encode_dhcpv4_option(option: &DhcpOption, values: &[Constant], out: &mut Vec<u8>) {
    let mut data = Vec::new();
    match option.type_ {
        DhcpOptType::Bool | DhcpOptType::Uint8 => data.push(values.first().map_or(0, int) as u8),
        DhcpOptType::Uint16 => data.extend(&(values.first().map_or(0, int) as u16).to_be_bytes()),
        DhcpOptType::Uint32 => data.extend(&(values.first().map_or(0, int) as u32).to_be_bytes()),
        DhcpOptType::Ipv4 => for c in values {
            data.extend(&(int(c) as u32).to_be_bytes());
        },
        DhcpOptType::StaticRoutes => for route in values.chunks_exact(2) {
            // Each route is the prefix length, the significant octets of the destination,
            // and the gateway.
            let plen = route[0].ipv4_plen();
            data.push(plen as u8);
            let network = (int(&route[0]) as u32).to_be_bytes();
            data.extend(&network[..((plen + 7) / 8) as usize]);
            data.extend(&(int(&route[1]) as u32).to_be_bytes());
        },
        DhcpOptType::Str => data.extend(values.first().map_or(&[][..], string)),
        DhcpOptType::Ipv6 | DhcpOptType::Mac => (),
    }
    data.truncate(u8::MAX as usize);
    out.push(option.code as u8);
    out.push(data.len() as u8);
    out.extend(data);
}

/// Appends a DHCPv6 option to `out` as 16-bit code, 16-bit length, and data.
pub fn encode_dhcpv6_option(option: &DhcpOption, values: &[Constant], out: &mut Vec<u8>) {
    let mut data: Vec<u8> = Vec::new();
    match option.type_ {
        DhcpOptType::Ipv6 => for c in values {
            data.extend(&int(c).to_be_bytes());
        },
        DhcpOptType::Mac => data.extend(&(values.first().map_or(0, int) as u64).to_be_bytes()[2..]),
        DhcpOptType::Str => data.extend(values.first().map_or(&[][..], string)),
        _ => (),
    }
    out.extend(&option.code.to_be_bytes());
    out.extend(&(data.len() as u16).to_be_bytes());
    out.extend(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::Lexer;
    use anyhow::Result;

    fn constants(s: &str) -> Result<Vec<Constant>> {
        Ok(Lexer::new(s)?.parse_constant_set()?.values)
    }

    #[test]
    fn dhcpv4_options() -> Result<()> {
        let opts = DhcpOpts::supported_v4();
        assert_eq!(opts.len(), SUPPORTED_DHCP_OPTS.len());

        let mut out = Vec::new();
        encode_dhcpv4_option(opts.lookup("router").unwrap(), &constants("{10.0.0.1, 10.0.0.2}")?, &mut out);
        encode_dhcpv4_option(opts.lookup("mtu").unwrap(), &constants("1400")?, &mut out);
        encode_dhcpv4_option(opts.lookup("lease_time").unwrap(), &constants("3600")?, &mut out);
        assert_eq!(out, vec![3, 8, 10, 0, 0, 1, 10, 0, 0, 2,
                             26, 2, 0x05, 0x78,
                             51, 4, 0, 0, 0x0e, 0x10]);
        Ok(())
    }

    #[test]
    fn classless_static_routes() -> Result<()> {
        let opts = DhcpOpts::supported_v4();
        let mut out = Vec::new();
        encode_dhcpv4_option(opts.lookup("classless_static_route").unwrap(),
                             &constants("{10.17.0.0/16, 10.0.0.1, 10.229.0.128/25, 10.0.0.2, 0.0.0.0/0, 10.0.0.254}")?,
                             &mut out);
        assert_eq!(out, vec![121, 21,
                             16, 10, 17, 10, 0, 0, 1,
                             25, 10, 229, 0, 128, 10, 0, 0, 2,
                             0, 10, 0, 0, 254]);
        Ok(())
    }

    #[test]
    fn dhcpv6_options() -> Result<()> {
        let opts = DhcpOpts::supported_v6();
        let mut out = Vec::new();
        encode_dhcpv6_option(opts.lookup("server_id").unwrap(), &constants("00:00:00:00:10:02")?, &mut out);
        encode_dhcpv6_option(opts.lookup("domain_search").unwrap(), &constants("\"a.b\"")?, &mut out);
        assert_eq!(out, vec![0, 2, 0, 6, 0, 0, 0, 0, 0x10, 0x02,
                             0, 24, 0, 3, b'a', b'.', b'b']);
        Ok(())
    }
}
