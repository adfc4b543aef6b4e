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

//! OpenFlow actions, in the abstract form that OVS calls "ofpacts".
//!
//! This is not a wire codec.  Each [`Ofpact`] formats itself in the syntax that `ovs-ofctl`
//! accepts, which is the form in which flows are handed to the switch.

use bitflags::bitflags;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A field that an action can read or write.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MfField {
    Metadata,
    InPort,
    /// 32-bit register `reg0`...`reg15`.
    Reg(u8),
    /// 128-bit register `xxreg0`...`xxreg3`.
    Xxreg(u8),
    EthSrc,
    EthDst,
    EthType,
    VlanTci,
    Ipv4Src,
    Ipv4Dst,
    Ipv6Src,
    Ipv6Dst,
    IpProto,
    IpDscp,
    IpEcn,
    IpTtl,
    ArpOp,
    ArpSpa,
    ArpTpa,
    ArpSha,
    ArpTha,
    NdTarget,
    NdSll,
    NdTll,
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
    Icmpv4Type,
    Icmpv4Code,
    Icmpv6Type,
    Icmpv6Code,
    CtState,
    CtZone,
    CtMark,
    CtLabel,
}

impl MfField {
    pub fn n_bits(&self) -> u32 {
        use MfField::*;
        match self {
            Metadata => 64,
            InPort => 32,
            Reg(_) => 32,
            Xxreg(_) => 128,
            EthSrc | EthDst | ArpSha | ArpTha | NdSll | NdTll => 48,
            EthType | VlanTci | TcpSrc | TcpDst | UdpSrc | UdpDst | ArpOp | CtZone => 16,
            Ipv4Src | Ipv4Dst | ArpSpa | ArpTpa | CtState | CtMark => 32,
            Ipv6Src | Ipv6Dst | NdTarget | CtLabel => 128,
            IpProto | IpTtl | Icmpv4Type | Icmpv4Code | Icmpv6Type | Icmpv6Code => 8,
            IpDscp => 6,
            IpEcn => 2,
        }
    }

    /// The name that `set_field` uses for this field, e.g. `reg15` or `eth_dst`.
    pub fn name(&self) -> String {
        use MfField::*;
        match self {
            Metadata => "metadata".into(),
            InPort => "in_port".into(),
            Reg(n) => format!("reg{}", n),
            Xxreg(n) => format!("xxreg{}", n),
            EthSrc => "eth_src".into(),
            EthDst => "eth_dst".into(),
            EthType => "eth_type".into(),
            VlanTci => "vlan_tci".into(),
            Ipv4Src => "ip_src".into(),
            Ipv4Dst => "ip_dst".into(),
            Ipv6Src => "ipv6_src".into(),
            Ipv6Dst => "ipv6_dst".into(),
            IpProto => "nw_proto".into(),
            IpDscp => "ip_dscp".into(),
            IpEcn => "nw_ecn".into(),
            IpTtl => "nw_ttl".into(),
            ArpOp => "arp_op".into(),
            ArpSpa => "arp_spa".into(),
            ArpTpa => "arp_tpa".into(),
            ArpSha => "arp_sha".into(),
            ArpTha => "arp_tha".into(),
            NdTarget => "nd_target".into(),
            NdSll => "nd_sll".into(),
            NdTll => "nd_tll".into(),
            TcpSrc => "tcp_src".into(),
            TcpDst => "tcp_dst".into(),
            UdpSrc => "udp_src".into(),
            UdpDst => "udp_dst".into(),
            Icmpv4Type => "icmp_type".into(),
            Icmpv4Code => "icmp_code".into(),
            Icmpv6Type => "icmpv6_type".into(),
            Icmpv6Code => "icmpv6_code".into(),
            CtState => "ct_state".into(),
            CtZone => "ct_zone".into(),
            CtMark => "ct_mark".into(),
            CtLabel => "ct_label".into(),
        }
    }

    /// The NXM/OXM name for this field, as used in subfield syntax, e.g. `NXM_NX_REG13`.
    pub fn nxm_name(&self) -> String {
        use MfField::*;
        match self {
            Metadata => "OXM_OF_METADATA".into(),
            InPort => "NXM_OF_IN_PORT".into(),
            Reg(n) => format!("NXM_NX_REG{}", n),
            Xxreg(n) => format!("NXM_NX_XXREG{}", n),
            EthSrc => "NXM_OF_ETH_SRC".into(),
            EthDst => "NXM_OF_ETH_DST".into(),
            EthType => "NXM_OF_ETH_TYPE".into(),
            VlanTci => "NXM_OF_VLAN_TCI".into(),
            Ipv4Src => "NXM_OF_IP_SRC".into(),
            Ipv4Dst => "NXM_OF_IP_DST".into(),
            Ipv6Src => "NXM_NX_IPV6_SRC".into(),
            Ipv6Dst => "NXM_NX_IPV6_DST".into(),
            IpProto => "NXM_OF_IP_PROTO".into(),
            IpDscp => "OXM_OF_IP_DSCP".into(),
            IpEcn => "NXM_NX_IP_ECN".into(),
            IpTtl => "NXM_NX_IP_TTL".into(),
            ArpOp => "NXM_OF_ARP_OP".into(),
            ArpSpa => "NXM_OF_ARP_SPA".into(),
            ArpTpa => "NXM_OF_ARP_TPA".into(),
            ArpSha => "NXM_NX_ARP_SHA".into(),
            ArpTha => "NXM_NX_ARP_THA".into(),
            NdTarget => "NXM_NX_ND_TARGET".into(),
            NdSll => "NXM_NX_ND_SLL".into(),
            NdTll => "NXM_NX_ND_TLL".into(),
            TcpSrc => "NXM_OF_TCP_SRC".into(),
            TcpDst => "NXM_OF_TCP_DST".into(),
            UdpSrc => "NXM_OF_UDP_SRC".into(),
            UdpDst => "NXM_OF_UDP_DST".into(),
            Icmpv4Type => "NXM_OF_ICMP_TYPE".into(),
            Icmpv4Code => "NXM_OF_ICMP_CODE".into(),
            Icmpv6Type => "NXM_NX_ICMPV6_TYPE".into(),
            Icmpv6Code => "NXM_NX_ICMPV6_CODE".into(),
            CtState => "NXM_NX_CT_STATE".into(),
            CtZone => "NXM_NX_CT_ZONE".into(),
            CtMark => "NXM_NX_CT_MARK".into(),
            CtLabel => "NXM_NX_CT_LABEL".into(),
        }
    }

    /// The 32-bit NXM header for this field, for fields that have one in the NXM_NX class
    /// (vendor class 0x0001) or the NXM_OF class (0x0000).  The header packs the class, the
    /// field number, and the length in bytes.
    pub fn nxm_header(&self) -> Option<u32> {
        use MfField::*;
        let (class, field, len) = match self {
            InPort => (0x0000, 0, 2),
            EthDst => (0x0000, 1, 6),
            EthSrc => (0x0000, 2, 6),
            EthType => (0x0000, 3, 2),
            Reg(n) if *n < 16 => (0x0001, *n as u32, 4),
            _ => return None,
        };
        Some((class << 16) | (field << 9) | len)
    }

    /// Formats `value` the way `ovs-ofctl` would for this field.
    fn format_value(&self, value: u128) -> String {
        use MfField::*;
        match self {
            EthSrc | EthDst | ArpSha | ArpTha | NdSll | NdTll => {
                let b = (value as u64).to_be_bytes();
                format!("{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[2], b[3], b[4], b[5], b[6], b[7])
            },
            Ipv4Src | Ipv4Dst | ArpSpa | ArpTpa => Ipv4Addr::from(value as u32).to_string(),
            Ipv6Src | Ipv6Dst | NdTarget => Ipv6Addr::from(value).to_string(),
            _ => format!("{:#x}", value),
        }
    }
}

/// Bits `ofs` through `ofs + n_bits - 1` of `field`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subfield {
    pub field: MfField,
    pub ofs: u32,
    pub n_bits: u32,
}

impl Subfield {
    /// The whole of `field`.
    pub fn whole(field: MfField) -> Subfield {
        Subfield { field, ofs: 0, n_bits: field.n_bits() }
    }

    pub fn new(field: MfField, ofs: u32, n_bits: u32) -> Subfield {
        Subfield { field, ofs, n_bits }
    }
}

impl fmt::Display for Subfield {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.field.nxm_name())?;
        if self.ofs == 0 && self.n_bits == self.field.n_bits() {
            write!(f, "[]")
        } else if self.n_bits == 1 {
            write!(f, "[{}]", self.ofs)
        } else {
            write!(f, "[{}..{}]", self.ofs, self.ofs + self.n_bits - 1)
        }
    }
}

bitflags! {
    pub struct CtFlags: u16 {
        const COMMIT = 1 << 0;
        const FORCE = 1 << 1;
    }
}

bitflags! {
    pub struct NatFlags: u16 {
        const SRC = 1 << 0;
        const DST = 1 << 1;
        const PERSISTENT = 1 << 2;
    }
}

/// The `ct` action.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Conntrack {
    pub flags: CtFlags,
    /// Table to recirculate to, or `None` for no recirculation.
    pub recirc_table: Option<u8>,
    pub zone_src: Option<Subfield>,
    /// Actions executed within the connection tracker: `set_field` to `ct_mark` or `ct_label`
    /// and `nat`.
    pub actions: Vec<Ofpact>,
}

/// The `nat` action, valid only inside `ct`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nat {
    pub flags: NatFlags,
    /// Address to translate to, if any.  Without one, `nat` applies whatever translation the
    /// connection already has.
    pub addr: Option<Ipv4Addr>,
}

/// The `controller` action, which sends the packet to the controller with `userdata`.  With
/// `pause`, the packet's pipeline processing resumes when the controller sends it back.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Controller {
    pub max_len: u16,
    pub pause: bool,
    pub userdata: Vec<u8>,
    /// Actions that follow `userdata`, encoded as OpenFlow by the wire codec.
    pub nested: Vec<Ofpact>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ofpact {
    Resubmit { table: u8 },
    SetField { field: MfField, value: u128, mask: u128 },
    RegMove { src: Subfield, dst: Subfield },
    StackPush(Subfield),
    StackPop(Subfield),
    DecTtl,
    Ct(Conntrack),
    Nat(Nat),
    CtClear,
    Group(u32),
    Controller(Controller),
    Clone(Vec<Ofpact>),
    SetQueue(u32),
    Conjunction { id: u32, clause: u8, n_clauses: u8 },
}

impl Ofpact {
    /// A `set_field` that stores `value` into bits `ofs` through `ofs + n_bits - 1` of `field`.
    pub fn load(value: u128, field: MfField, ofs: u32, n_bits: u32) -> Ofpact {
        let ones = if n_bits >= 128 { u128::MAX } else { (1u128 << n_bits) - 1 };
        let mask = ones << ofs;
        Ofpact::SetField { field, value: (value << ofs) & mask, mask }
    }
}

fn format_list(f: &mut fmt::Formatter, ofpacts: &[Ofpact]) -> fmt::Result {
    for (i, a) in ofpacts.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{}", a)?;
    }
    Ok(())
}

impl fmt::Display for Ofpact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Ofpact::Resubmit { table } => write!(f, "resubmit(,{})", table),
            Ofpact::SetField { field, value, mask } => {
                let all_ones = if field.n_bits() >= 128 { u128::MAX } else { (1u128 << field.n_bits()) - 1 };
                if *mask == all_ones {
                    write!(f, "set_field:{}->{}", field.format_value(*value), field.name())
                } else {
                    write!(f, "set_field:{:#x}/{:#x}->{}", value, mask, field.name())
                }
            },
            Ofpact::RegMove { src, dst } => write!(f, "move:{}->{}", src, dst),
            Ofpact::StackPush(sf) => write!(f, "push:{}", sf),
            Ofpact::StackPop(sf) => write!(f, "pop:{}", sf),
            Ofpact::DecTtl => write!(f, "dec_ttl"),
            Ofpact::Ct(ct) => {
                let mut args = Vec::new();
                if ct.flags.contains(CtFlags::COMMIT) {
                    args.push("commit".to_string());
                }
                if ct.flags.contains(CtFlags::FORCE) {
                    args.push("force".to_string());
                }
                if let Some(table) = ct.recirc_table {
                    args.push(format!("table={}", table));
                }
                if let Some(zone) = &ct.zone_src {
                    args.push(format!("zone={}", zone));
                }
                let (nat, exec): (Vec<&Ofpact>, Vec<&Ofpact>)
                    = ct.actions.iter().partition(|a| matches!(a, Ofpact::Nat(_)));
                if !exec.is_empty() {
                    let exec: Vec<String> = exec.iter().map(|a| a.to_string()).collect();
                    args.push(format!("exec({})", exec.join(",")));
                }
                args.extend(nat.iter().map(|a| a.to_string()));
                write!(f, "ct({})", args.join(","))
            },
            Ofpact::Nat(nat) => {
                write!(f, "nat")?;
                if let Some(addr) = nat.addr {
                    let dir = if nat.flags.contains(NatFlags::SRC) { "src" } else { "dst" };
                    write!(f, "({}={})", dir, addr)?;
                }
                Ok(())
            },
            Ofpact::CtClear => write!(f, "ct_clear"),
            Ofpact::Group(id) => write!(f, "group:{}", id),
            Ofpact::Controller(c) => {
                write!(f, "controller(")?;
                if c.max_len != u16::MAX {
                    write!(f, "max_len={},", c.max_len)?;
                }
                let bytes: Vec<String> = c.userdata.iter().map(|b| format!("{:02x}", b)).collect();
                write!(f, "userdata={}", bytes.join("."))?;
                if !c.nested.is_empty() {
                    write!(f, ",actions(")?;
                    format_list(f, &c.nested)?;
                    write!(f, ")")?;
                }
                if c.pause {
                    write!(f, ",pause")?;
                }
                write!(f, ")")
            },
            Ofpact::Clone(actions) => {
                write!(f, "clone(")?;
                format_list(f, actions)?;
                write!(f, ")")
            },
            Ofpact::SetQueue(id) => write!(f, "set_queue:{}", id),
            Ofpact::Conjunction { id, clause, n_clauses } =>
                write!(f, "conjunction({},{}/{})", id, clause + 1, n_clauses),
        }
    }
}

/// Formats a list of actions for the `actions=` part of a flow, using `drop` for an empty list.
pub struct Ofpacts<'a>(pub &'a [Ofpact]);

impl fmt::Display for Ofpacts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "drop")
        } else {
            format_list(f, self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_actions() {
        let zone = Subfield::new(MfField::Reg(13), 0, 16);
        let ct = Ofpact::Ct(Conntrack {
            flags: CtFlags::COMMIT,
            recirc_table: Some(19),
            zone_src: Some(zone),
            actions: vec![Ofpact::Nat(Nat { flags: NatFlags::SRC, addr: Some(Ipv4Addr::new(203, 0, 113, 1)) })],
        });
        assert_eq!(ct.to_string(), "ct(commit,table=19,zone=NXM_NX_REG13[0..15],nat(src=203.0.113.1))");

        assert_eq!(Ofpact::load(0x5, MfField::Reg(15), 0, 32).to_string(), "set_field:0x5->reg15");
        assert_eq!(Ofpact::load(1, MfField::Reg(10), 0, 1).to_string(), "set_field:0x1/0x1->reg10");
        assert_eq!(Ofpact::load(0x0a0000000001, MfField::EthSrc, 0, 48).to_string(),
                   "set_field:0a:00:00:00:00:01->eth_src");
        assert_eq!(Ofpact::RegMove { src: Subfield::whole(MfField::Reg(14)),
                                     dst: Subfield::whole(MfField::Reg(15)) }.to_string(),
                   "move:NXM_NX_REG14[]->NXM_NX_REG15[]");
        assert_eq!(Ofpacts(&[]).to_string(), "drop");
        assert_eq!(Ofpacts(&[Ofpact::DecTtl, Ofpact::Resubmit { table: 17 }]).to_string(),
                   "dec_ttl,resubmit(,17)");
    }

    #[test]
    fn nxm_headers() {
        assert_eq!(MfField::Reg(0).nxm_header(), Some(0x0001_0004));
        assert_eq!(MfField::Reg(15).nxm_header(), Some(0x0001_1e04));
        assert_eq!(MfField::EthSrc.nxm_header(), Some(0x0000_0406));
        assert_eq!(MfField::Xxreg(0).nxm_header(), None);
    }
}
