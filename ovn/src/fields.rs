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

//! The logical fields that OVN actions can read and write, and the OpenFlow fields that
//! carry them.

use anyhow::Result;

use ovs::ofpact::{MfField, Subfield};

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::lex::{Lexer, Token};

pub const MFF_LOG_DATAPATH: MfField = MfField::Metadata;
pub const MFF_LOG_FLAGS: MfField = MfField::Reg(10);
pub const MFF_LOG_DNAT_ZONE: MfField = MfField::Reg(11);
pub const MFF_LOG_SNAT_ZONE: MfField = MfField::Reg(12);
pub const MFF_LOG_CT_ZONE: MfField = MfField::Reg(13);
pub const MFF_LOG_INPORT: MfField = MfField::Reg(14);
pub const MFF_LOG_OUTPORT: MfField = MfField::Reg(15);

/// Registers `reg0` through `reg9` are free for logical flows to use.
pub const MFF_N_LOG_REGS: u8 = 10;

/// Bits in `flags`.
pub const MLF_ALLOW_LOOPBACK_BIT: u32 = 0;
pub const MLF_RCV_FROM_VXLAN_BIT: u32 = 1;
pub const MLF_FORCE_SNAT_FOR_DNAT_BIT: u32 = 2;
pub const MLF_FORCE_SNAT_FOR_LB_BIT: u32 = 3;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct FieldError(pub String);

/// A logical field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Width in bits, or 0 for a string field.  String fields hold logical port names, which
    /// become port tunnel keys in `field`.
    pub width: u32,
    pub field: Subfield,
    /// Match that a flow must include to use this field, e.g. `ip4` for `ip4.src`.
    pub prereqs: Option<String>,
    pub rw: bool,
}

impl Symbol {
    pub fn is_string(&self) -> bool {
        self.width == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct Symtab {
    symbols: BTreeMap<String, Symbol>,
}

impl Symtab {
    pub fn new() -> Symtab {
        Symtab::default()
    }

    pub fn add_subfield(&mut self, name: &str, field: Subfield, prereqs: Option<&str>, rw: bool) {
        self.symbols.insert(name.into(), Symbol {
            name: name.into(),
            width: field.n_bits,
            field,
            prereqs: prereqs.map(String::from),
            rw,
        });
    }

    pub fn add_field(&mut self, name: &str, field: MfField, prereqs: Option<&str>, rw: bool) {
        self.add_subfield(name, Subfield::whole(field), prereqs, rw);
    }

    pub fn add_string(&mut self, name: &str, field: MfField) {
        self.symbols.insert(name.into(), Symbol {
            name: name.into(),
            width: 0,
            field: Subfield::whole(field),
            prereqs: None,
            rw: true,
        });
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// The logical fields of OVN.
    pub fn ovn() -> Symtab {
        use MfField::*;

        let mut st = Symtab::new();
        for i in 0..MFF_N_LOG_REGS {
            st.add_field(&format!("reg{}", i), Reg(i), None, true);
        }
        for i in 0..MFF_N_LOG_REGS / 4 {
            st.add_field(&format!("xxreg{}", i), Xxreg(i), None, true);
        }
        st.add_string("inport", MFF_LOG_INPORT);
        st.add_string("outport", MFF_LOG_OUTPORT);

        st.add_field("flags", MFF_LOG_FLAGS, None, true);
        for (name, bit) in &[("loopback", MLF_ALLOW_LOOPBACK_BIT),
                             ("force_snat_for_dnat", MLF_FORCE_SNAT_FOR_DNAT_BIT),
                             ("force_snat_for_lb", MLF_FORCE_SNAT_FOR_LB_BIT)] {
            st.add_subfield(&format!("flags.{}", name), Subfield::new(MFF_LOG_FLAGS, *bit, 1), None, true);
        }

        st.add_field("ct_mark", CtMark, None, false);
        st.add_field("ct_label", CtLabel, None, false);
        st.add_field("ct_state", CtState, None, false);

        st.add_field("eth.src", EthSrc, None, true);
        st.add_field("eth.dst", EthDst, None, true);
        st.add_field("eth.type", EthType, None, false);
        st.add_field("vlan.tci", VlanTci, None, false);

        st.add_field("ip.proto", IpProto, Some("ip"), false);
        st.add_field("ip.dscp", IpDscp, Some("ip"), true);
        st.add_field("ip.ecn", IpEcn, Some("ip"), true);
        st.add_field("ip.ttl", IpTtl, Some("ip"), true);
        st.add_field("ip4.src", Ipv4Src, Some("ip4"), true);
        st.add_field("ip4.dst", Ipv4Dst, Some("ip4"), true);
        st.add_field("ip6.src", Ipv6Src, Some("ip6"), true);
        st.add_field("ip6.dst", Ipv6Dst, Some("ip6"), true);

        st.add_field("icmp4.type", Icmpv4Type, Some("icmp4"), true);
        st.add_field("icmp4.code", Icmpv4Code, Some("icmp4"), true);
        st.add_field("icmp6.type", Icmpv6Type, Some("icmp6"), true);
        st.add_field("icmp6.code", Icmpv6Code, Some("icmp6"), true);

        st.add_field("arp.op", ArpOp, Some("arp"), true);
        st.add_field("arp.spa", ArpSpa, Some("arp"), true);
        st.add_field("arp.tpa", ArpTpa, Some("arp"), true);
        st.add_field("arp.sha", ArpSha, Some("arp"), true);
        st.add_field("arp.tha", ArpTha, Some("arp"), true);

        st.add_field("nd.target", NdTarget, Some("nd"), true);
        st.add_field("nd.sll", NdSll, Some("nd_ns"), true);
        st.add_field("nd.tll", NdTll, Some("nd_na"), true);

        st.add_field("tcp.src", TcpSrc, Some("tcp"), true);
        st.add_field("tcp.dst", TcpDst, Some("tcp"), true);
        st.add_field("udp.src", UdpSrc, Some("udp"), true);
        st.add_field("udp.dst", UdpDst, Some("udp"), true);
        st
    }
}

/// All or part of a logical field, e.g. `eth.src` or `reg0[3]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRef {
    pub symbol: Symbol,
    pub ofs: u32,
    /// 0 for a string field.
    pub n_bits: u32,
}

impl FieldRef {
    pub fn is_string(&self) -> bool {
        self.symbol.is_string()
    }

    /// Parses a field name with an optional `[bit]` or `[low..high]` subscript.  Appends the
    /// field's prerequisites to `prereqs`.
    pub fn parse(lexer: &mut Lexer, symtab: &Symtab, prereqs: &mut Vec<String>) -> Result<FieldRef> {
        let symbol = match &lexer.token {
            Token::Id(name) => symtab.lookup(name).cloned(),
            _ => None,
        };
        let symbol = symbol.ok_or_else(|| lexer.syntax_error(Some("expecting field name")))?;
        lexer.get()?;

        let mut f = FieldRef { n_bits: symbol.width, ofs: 0, symbol };
        if lexer.match_(&Token::LSquare)? {
            if f.is_string() {
                Err(FieldError(format!("Cannot select subfield of string field {}.", f.symbol.name)))?
            }
            let low = lexer.get_int()?;
            let high = if lexer.match_(&Token::Ellipsis)? { lexer.get_int()? } else { low };
            lexer.force_match(&Token::RSquare)?;
            if low > high {
                Err(FieldError(format!("Invalid bit range {} to {}.", low, high)))?
            } else if high >= f.symbol.width as i64 {
                Err(FieldError(format!("Cannot select bits {} to {} of {}-bit field {}.",
                                       low, high, f.symbol.width, f.symbol.name)))?
            }
            f.ofs = low as u32;
            f.n_bits = (high - low + 1) as u32;
        }
        if let Some(p) = &f.symbol.prereqs {
            if !prereqs.contains(p) {
                prereqs.push(p.clone());
            }
        }
        Ok(f)
    }

    /// Checks that this field can be used where an `n_bits`-bit field is required (a string
    /// field if `n_bits` is 0), and that it is writable if `rw`.
    pub fn type_check(&self, n_bits: u32, rw: bool) -> Result<()> {
        if self.is_string() && n_bits > 0 {
            Err(FieldError(format!("Cannot use string field {} where numeric field is required.", self)))?
        } else if !self.is_string() && n_bits == 0 {
            Err(FieldError(format!("Cannot use numeric field {} where string field is required.", self)))?
        } else if n_bits > 0 && self.n_bits != n_bits {
            Err(FieldError(format!("Cannot use {}-bit field {} where {}-bit field is required.",
                                   self.n_bits, self, n_bits)))?
        } else if rw && !self.symbol.rw {
            Err(FieldError(format!("Field {} is not modifiable.", self.symbol.name)))?
        }
        Ok(())
    }

    /// The OpenFlow subfield that this reference designates.
    pub fn resolve(&self) -> Subfield {
        let base = self.symbol.field;
        if self.is_string() {
            base
        } else {
            Subfield::new(base.field, base.ofs + self.ofs, self.n_bits)
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol.name)?;
        if self.is_string() || (self.ofs == 0 && self.n_bits == self.symbol.width) {
            Ok(())
        } else if self.n_bits == 1 {
            write!(f, "[{}]", self.ofs)
        } else {
            write!(f, "[{}..{}]", self.ofs, self.ofs + self.n_bits - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<(FieldRef, Vec<String>)> {
        let symtab = Symtab::ovn();
        let mut lexer = Lexer::new(s)?;
        let mut prereqs = Vec::new();
        let f = FieldRef::parse(&mut lexer, &symtab, &mut prereqs)?;
        Ok((f, prereqs))
    }

    #[test]
    fn subfields() -> Result<()> {
        let (f, prereqs) = parse("reg0[3]")?;
        assert_eq!(f.to_string(), "reg0[3]");
        assert_eq!(f.resolve(), Subfield::new(MfField::Reg(0), 3, 1));
        assert!(prereqs.is_empty());

        let (f, _) = parse("flags.loopback")?;
        assert_eq!(f.resolve(), Subfield::new(MfField::Reg(10), 0, 1));

        let (f, prereqs) = parse("ip4.dst[8..15]")?;
        assert_eq!(f.resolve(), Subfield::new(MfField::Ipv4Dst, 8, 8));
        assert_eq!(prereqs, vec!["ip4".to_string()]);

        let (f, _) = parse("outport")?;
        assert!(f.is_string());
        assert_eq!(f.resolve(), Subfield::whole(MfField::Reg(15)));
        Ok(())
    }

    #[test]
    fn errors() {
        let error = |s| parse(s).unwrap_err().to_string();
        assert_eq!(error("foo"), "Syntax error at `foo' expecting field name.");
        assert_eq!(error("inport[1]"), "Cannot select subfield of string field inport.");
        assert_eq!(error("reg0[5..3]"), "Invalid bit range 5 to 3.");
        assert_eq!(error("reg0[32]"), "Cannot select bits 32 to 32 of 32-bit field reg0.");
    }

    #[test]
    fn type_check() -> Result<()> {
        let (f, _) = parse("ip.proto")?;
        assert_eq!(f.type_check(8, true).unwrap_err().to_string(), "Field ip.proto is not modifiable.");
        assert!(f.type_check(8, false).is_ok());

        let (f, _) = parse("inport")?;
        assert_eq!(f.type_check(32, false).unwrap_err().to_string(),
                   "Cannot use string field inport where numeric field is required.");

        let (f, _) = parse("reg0[0..7]")?;
        assert_eq!(f.type_check(16, false).unwrap_err().to_string(),
                   "Cannot use 8-bit field reg0[0..7] where 16-bit field is required.");
        Ok(())
    }
}
