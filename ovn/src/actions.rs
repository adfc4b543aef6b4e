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

//! The OVN logical action language.
//!
//! Each `Logical_Flow` row carries a program such as `reg0[3] = put_dhcp_opts(...); next;`.
//! [`parse_actions`] turns the program into a list of [`OvnAction`]s, [`format_actions`]
//! turns the list back into text, and [`encode_actions`] translates it into OpenFlow
//! [`Ofpact`]s for a particular datapath.
//!
//! Every kind of action is a struct that implements [`Action`].  Parsing is a function per
//! keyword.

use anyhow::Result;
use itertools::Itertools;
use thiserror::Error;

use ovs::ofpact::{Conntrack, Controller, CtFlags, MfField, Nat, NatFlags, Ofpact, Subfield};

use std::fmt;
use std::net::Ipv4Addr;

use crate::dhcp::{self, DhcpOption, DhcpOpts, DHCP_OPT_OFFERIP_CODE};
use crate::fields::{FieldRef, Symtab, MFF_LOG_CT_ZONE, MFF_LOG_DNAT_ZONE, MFF_LOG_INPORT, MFF_LOG_OUTPORT, MFF_LOG_SNAT_ZONE};
use crate::group_table::GroupTable;
use crate::lex::{Constant, ConstantSet, IntFormat, Lexer, Token};

#[derive(Error, Debug)]
#[error("{0}")]
pub struct ActionParseError(pub String);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pipeline {
    Ingress,
    Egress,
}

impl Pipeline {
    pub fn name(&self) -> &'static str {
        match self {
            Pipeline::Ingress => "ingress",
            Pipeline::Egress => "egress",
        }
    }
}

/// Opcodes for actions that `ovn-controller` carries out itself, as the first 32 bits of
/// the userdata of a `controller` action.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ActionOpcode {
    Arp = 0,
    PutArp = 1,
    PutDhcpOpts = 2,
    NdNa = 3,
    PutNd = 4,
    PutDhcpv6Opts = 5,
}

pub const QDISC_MIN_QUEUE_ID: i64 = 0;
pub const QDISC_MAX_QUEUE_ID: i64 = 0xf000;

/// What the parser needs to know about where the actions appear.
pub struct ParseParams<'a> {
    pub symtab: &'a Symtab,
    pub dhcp_opts: &'a DhcpOpts,
    pub dhcpv6_opts: &'a DhcpOpts,
    pub pipeline: Pipeline,
    /// Number of tables in the pipeline.  0 disallows `next`.
    pub n_tables: u8,
    /// Table that the actions belong to.
    pub cur_ltable: u8,
}

/// What the encoder needs to know to translate actions for one datapath.
pub struct EncodeParams<'a> {
    /// Maps a logical port name to its tunnel key.
    pub lookup_port: &'a dyn Fn(&str) -> Option<u32>,
    pub is_switch: bool,
    pub is_gateway_router: bool,
    pub group_table: &'a mut GroupTable,
    /// Pipeline of the flow whose actions are being encoded.
    pub pipeline: Pipeline,
    /// OpenFlow table where logical table 0 of the ingress pipeline begins.
    pub ingress_ptable: u8,
    /// OpenFlow table where logical table 0 of the egress pipeline begins.
    pub egress_ptable: u8,
    /// OpenFlow table for `output`.
    pub output_ptable: u8,
    /// OpenFlow table where MAC bindings are looked up.
    pub mac_bind_ptable: u8,
}

impl EncodeParams<'_> {
    fn first_ptable(&self, pipeline: Pipeline) -> u8 {
        match pipeline {
            Pipeline::Ingress => self.ingress_ptable,
            Pipeline::Egress => self.egress_ptable,
        }
    }
}

/// A logical action.  `Display` gives its syntax, including the trailing `;`.
pub trait Action: fmt::Display {
    /// Appends the OpenFlow translation of the action to `ofpacts`.
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OvnAction {
    Output(Output),
    Next(Next),
    Load(Load),
    Move(Move),
    Exchange(Exchange),
    DecTtl(DecTtl),
    CtNext(CtNext),
    CtCommit(CtCommit),
    CtDnat(CtDnat),
    CtSnat(CtSnat),
    CtLb(CtLb),
    CtClear(CtClear),
    Clone(CloneAction),
    Arp(Arp),
    NdNa(NdNa),
    GetArp(GetArp),
    PutArp(PutArp),
    GetNd(GetNd),
    PutNd(PutNd),
    PutDhcpv4Opts(PutDhcpv4Opts),
    PutDhcpv6Opts(PutDhcpv6Opts),
    SetQueue(SetQueue),
}

macro_rules! dispatch {
    ($self:expr, $a:ident => $body:expr) => {
        match $self {
            OvnAction::Output($a) => $body,
            OvnAction::Next($a) => $body,
            OvnAction::Load($a) => $body,
            OvnAction::Move($a) => $body,
            OvnAction::Exchange($a) => $body,
            OvnAction::DecTtl($a) => $body,
            OvnAction::CtNext($a) => $body,
            OvnAction::CtCommit($a) => $body,
            OvnAction::CtDnat($a) => $body,
            OvnAction::CtSnat($a) => $body,
            OvnAction::CtLb($a) => $body,
            OvnAction::CtClear($a) => $body,
            OvnAction::Clone($a) => $body,
            OvnAction::Arp($a) => $body,
            OvnAction::NdNa($a) => $body,
            OvnAction::GetArp($a) => $body,
            OvnAction::PutArp($a) => $body,
            OvnAction::GetNd($a) => $body,
            OvnAction::PutNd($a) => $body,
            OvnAction::PutDhcpv4Opts($a) => $body,
            OvnAction::PutDhcpv6Opts($a) => $body,
            OvnAction::SetQueue($a) => $body,
        }
    };
}

impl fmt::Display for OvnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, a => a.fmt(f))
    }
}

impl Action for OvnAction {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        dispatch!(self, a => a.encode(ep, ofpacts))
    }
}

fn resubmit(ptable: u8) -> Ofpact {
    Ofpact::Resubmit { table: ptable }
}

fn zone(field: MfField) -> Option<Subfield> {
    Some(Subfield::new(field, 0, 16))
}

fn controller_userdata(opcode: ActionOpcode) -> Vec<u8> {
    let mut userdata = (opcode as u32).to_be_bytes().to_vec();
    userdata.extend(&[0; 4]);
    userdata
}

fn controller_op(pause: bool, userdata: Vec<u8>, nested: Vec<Ofpact>) -> Ofpact {
    Ofpact::Controller(Controller { max_len: u16::MAX, pause, userdata, nested })
}

/// `output;`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output;

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output;")
    }
}

impl Action for Output {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        ofpacts.push(resubmit(ep.output_ptable));
    }
}

/// `next;`, `next(table);`, or `next(pipeline=P, table=T);`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Next {
    pub pipeline: Pipeline,
    pub ltable: u8,
    pub src_pipeline: Pipeline,
    pub src_ltable: u8,
}

impl fmt::Display for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pipeline != self.src_pipeline {
            write!(f, "next(pipeline={}, table={});", self.pipeline.name(), self.ltable)
        } else if self.ltable as u32 != self.src_ltable as u32 + 1 {
            write!(f, "next({});", self.ltable)
        } else {
            write!(f, "next;")
        }
    }
}

impl Action for Next {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        ofpacts.push(resubmit(ep.first_ptable(self.pipeline) + self.ltable));
    }
}

/// `field = constant;`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Load {
    pub dst: FieldRef,
    pub imm: Constant,
}

impl fmt::Display for Load {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {};", self.dst, self.imm)
    }
}

impl Action for Load {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        let dst = self.dst.resolve();
        match &self.imm {
            Constant::Integer { value, mask: None, .. } => {
                ofpacts.push(Ofpact::load(*value, dst.field, dst.ofs, dst.n_bits))
            },
            Constant::Integer { value, mask: Some(mask), .. } => {
                ofpacts.push(Ofpact::SetField {
                    field: dst.field,
                    value: (value & mask) << dst.ofs,
                    mask: mask << dst.ofs,
                })
            },
            Constant::String(port) => {
                let key = (ep.lookup_port)(port).unwrap_or(0);
                ofpacts.push(Ofpact::load(key as u128, dst.field, 0, dst.field.n_bits()))
            },
        }
    }
}

/// `dst = src;`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Move {
    pub lhs: FieldRef,
    pub rhs: FieldRef,
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {};", self.lhs, self.rhs)
    }
}

impl Action for Move {
    fn encode(&self, _ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        ofpacts.push(Ofpact::RegMove { src: self.rhs.resolve(), dst: self.lhs.resolve() });
    }
}

/// `a <-> b;`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exchange {
    pub lhs: FieldRef,
    pub rhs: FieldRef,
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {};", self.lhs, self.rhs)
    }
}

impl Action for Exchange {
    fn encode(&self, _ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        let (lhs, rhs) = (self.lhs.resolve(), self.rhs.resolve());
        ofpacts.push(Ofpact::StackPush(rhs));
        ofpacts.push(Ofpact::StackPush(lhs));
        ofpacts.push(Ofpact::StackPop(rhs));
        ofpacts.push(Ofpact::StackPop(lhs));
    }
}

/// `ip.ttl--;`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecTtl;

impl fmt::Display for DecTtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip.ttl--;")
    }
}

impl Action for DecTtl {
    fn encode(&self, _ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        ofpacts.push(Ofpact::DecTtl);
    }
}

/// `ct_next;`: sends the packet through the connection tracker, then on to the next table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtNext {
    pub ltable: u8,
}

impl fmt::Display for CtNext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ct_next;")
    }
}

impl Action for CtNext {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        ofpacts.push(Ofpact::Ct(Conntrack {
            flags: CtFlags::empty(),
            recirc_table: Some(ep.first_ptable(ep.pipeline) + self.ltable),
            zone_src: zone(if ep.is_switch { MFF_LOG_CT_ZONE } else { MFF_LOG_DNAT_ZONE }),
            actions: Vec::new(),
        }));
    }
}

/// `ct_commit;` or `ct_commit(ct_mark=..., ct_label=...);`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CtCommit {
    pub ct_mark: u32,
    pub ct_mark_mask: u32,
    pub ct_label: u128,
    pub ct_label_mask: u128,
}

impl fmt::Display for CtCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut args = Vec::new();
        if self.ct_mark_mask != 0 {
            let mut arg = format!("ct_mark={:#x}", self.ct_mark);
            if self.ct_mark_mask != u32::MAX {
                arg += &format!("/{:#x}", self.ct_mark_mask);
            }
            args.push(arg);
        }
        if self.ct_label_mask != 0 {
            let mut arg = format!("ct_label={:#x}", self.ct_label);
            if self.ct_label_mask != u128::MAX {
                arg += &format!("/{:#x}", self.ct_label_mask);
            }
            args.push(arg);
        }
        if args.is_empty() {
            write!(f, "ct_commit;")
        } else {
            write!(f, "ct_commit({});", args.join(", "))
        }
    }
}

impl Action for CtCommit {
    fn encode(&self, _ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        let mut nested = Vec::new();
        if self.ct_mark_mask != 0 {
            nested.push(Ofpact::SetField {
                field: MfField::CtMark,
                value: self.ct_mark as u128,
                mask: self.ct_mark_mask as u128,
            });
        }
        if self.ct_label_mask != 0 {
            nested.push(Ofpact::SetField { field: MfField::CtLabel, value: self.ct_label, mask: self.ct_label_mask });
        }
        ofpacts.push(Ofpact::Ct(Conntrack {
            flags: CtFlags::COMMIT,
            recirc_table: None,
            zone_src: zone(MFF_LOG_CT_ZONE),
            actions: nested,
        }));
    }
}

/// Common part of `ct_dnat` and `ct_snat`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtNat {
    pub ltable: u8,
    pub ip: Option<Ipv4Addr>,
}

impl CtNat {
    fn format(&self, f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
        write!(f, "{}", name)?;
        if let Some(ip) = self.ip {
            write!(f, "({})", ip)?;
        }
        write!(f, ";")
    }

    fn encode(&self, ep: &EncodeParams<'_>, snat: bool, ofpacts: &mut Vec<Ofpact>) {
        let mut ct = Conntrack {
            flags: CtFlags::empty(),
            recirc_table: Some(self.ltable + ep.first_ptable(ep.pipeline)),
            zone_src: zone(if snat { MFF_LOG_SNAT_ZONE } else { MFF_LOG_DNAT_ZONE }),
            actions: Vec::new(),
        };
        let mut nat = Nat { flags: NatFlags::empty(), addr: None };
        if let Some(ip) = self.ip {
            nat.addr = Some(ip);
            nat.flags |= if snat { NatFlags::SRC } else { NatFlags::DST };
            ct.flags |= CtFlags::COMMIT;
        } else if snat && ep.is_gateway_router {
            // A gateway router's ct_snat without an address needs no recirculation.
            ct.recirc_table = None;
        }
        ct.actions.push(Ofpact::Nat(nat));
        ofpacts.push(Ofpact::Ct(ct));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtDnat(pub CtNat);

impl fmt::Display for CtDnat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.format(f, "ct_dnat")
    }
}

impl Action for CtDnat {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        self.0.encode(ep, false, ofpacts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtSnat(pub CtNat);

impl fmt::Display for CtSnat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.format(f, "ct_snat")
    }
}

impl Action for CtSnat {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        self.0.encode(ep, true, ofpacts)
    }
}

/// A `ct_lb` backend.  Port 0 keeps the original destination port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CtLbDst {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for CtLbDst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip)?;
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// `ct_lb;` or `ct_lb(ip[:port], ...);`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtLb {
    pub ltable: u8,
    pub dsts: Vec<CtLbDst>,
}

impl fmt::Display for CtLb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ct_lb")?;
        if !self.dsts.is_empty() {
            write!(f, "({})", self.dsts.iter().join(", "))?;
        }
        write!(f, ";")
    }
}

impl Action for CtLb {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        let recirc_table = self.ltable + ep.first_ptable(ep.pipeline);
        let zone_field = if ep.is_switch { MFF_LOG_CT_ZONE } else { MFF_LOG_DNAT_ZONE };
        if self.dsts.is_empty() {
            // An established connection only needs its existing NAT applied.
            ofpacts.push(Ofpact::Ct(Conntrack {
                flags: CtFlags::empty(),
                recirc_table: Some(recirc_table),
                zone_src: zone(zone_field),
                actions: vec![Ofpact::Nat(Nat { flags: NatFlags::empty(), addr: None })],
            }));
            return;
        }

        let mut group = String::from("type=select");
        for (bucket_id, dst) in self.dsts.iter().enumerate() {
            group += &format!(",bucket=bucket_id={},weight:100,actions=ct(nat(dst={}),commit,table={},zone={})",
                              bucket_id, dst, recirc_table, Subfield::new(zone_field, 0, 16));
        }
        if let Some(group_id) = ep.group_table.lookup_or_allocate(&group) {
            ofpacts.push(Ofpact::Group(group_id));
        }
    }
}

/// `ct_clear;`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtClear;

impl fmt::Display for CtClear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ct_clear;")
    }
}

impl Action for CtClear {
    fn encode(&self, _ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        ofpacts.push(Ofpact::CtClear);
    }
}

fn format_nested(f: &mut fmt::Formatter<'_>, name: &str, actions: &[OvnAction]) -> fmt::Result {
    write!(f, "{} {{ {} }};", name, format_actions(actions))
}

/// `clone { ... };`: runs the nested actions on a copy of the packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneAction(pub Vec<OvnAction>);

impl fmt::Display for CloneAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_nested(f, "clone", &self.0)
    }
}

impl Action for CloneAction {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        ofpacts.push(Ofpact::Clone(encode_actions(&self.0, ep)));
    }
}

/// `arp { ... };`: turns an IPv4 packet into an ARP request and runs the nested actions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arp(pub Vec<OvnAction>);

impl fmt::Display for Arp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_nested(f, "arp", &self.0)
    }
}

impl Action for Arp {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        let nested = encode_actions(&self.0, ep);
        ofpacts.push(controller_op(false, controller_userdata(ActionOpcode::Arp), nested));
    }
}

/// `nd_na { ... };`: answers a neighbor solicitation with an advertisement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NdNa(pub Vec<OvnAction>);

impl fmt::Display for NdNa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_nested(f, "nd_na", &self.0)
    }
}

impl Action for NdNa {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        let nested = encode_actions(&self.0, ep);
        ofpacts.push(controller_op(false, controller_userdata(ActionOpcode::NdNa), nested));
    }
}

/// Copies each `src` into its fixed destination register, saving the destinations' old
/// values on the stack.  Arguments already in place are left alone.
fn setup_args(args: &[(Subfield, MfField)], ofpacts: &mut Vec<Ofpact>) {
    let moved: Vec<&(Subfield, MfField)> = args.iter().filter(|(src, dst)| src.field != *dst).collect();
    for (_, dst) in &moved {
        ofpacts.push(Ofpact::StackPush(Subfield::whole(*dst)));
    }
    for (src, _) in moved.iter().rev() {
        ofpacts.push(Ofpact::StackPush(*src));
    }
    for (_, dst) in &moved {
        ofpacts.push(Ofpact::StackPop(Subfield::whole(*dst)));
    }
}

fn restore_args(args: &[(Subfield, MfField)], ofpacts: &mut Vec<Ofpact>) {
    for (_, dst) in args.iter().rev().filter(|(src, dst)| src.field != *dst) {
        ofpacts.push(Ofpact::StackPop(Subfield::whole(*dst)));
    }
}

/// Common part of `get_arp` and `get_nd`, which look up the MAC address bound to `ip` on
/// `port` and store it in `eth.dst`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetMacBind {
    pub port: FieldRef,
    pub ip: FieldRef,
}

impl GetMacBind {
    fn format(&self, f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
        write!(f, "{}({}, {});", name, self.port, self.ip)
    }

    fn encode(&self, ep: &EncodeParams<'_>, ip_field: MfField, ofpacts: &mut Vec<Ofpact>) {
        let args = [(self.port.resolve(), MFF_LOG_OUTPORT), (self.ip.resolve(), ip_field)];
        setup_args(&args, ofpacts);
        ofpacts.push(Ofpact::load(0, MfField::EthDst, 0, 48));
        ofpacts.push(resubmit(ep.mac_bind_ptable));
        restore_args(&args, ofpacts);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetArp(pub GetMacBind);

impl fmt::Display for GetArp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.format(f, "get_arp")
    }
}

impl Action for GetArp {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        self.0.encode(ep, MfField::Reg(0), ofpacts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetNd(pub GetMacBind);

impl fmt::Display for GetNd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.format(f, "get_nd")
    }
}

impl Action for GetNd {
    fn encode(&self, ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        self.0.encode(ep, MfField::Xxreg(0), ofpacts)
    }
}

/// Common part of `put_arp` and `put_nd`, which ask `ovn-controller` to bind `mac` to `ip`
/// on `port`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutMacBind {
    pub port: FieldRef,
    pub ip: FieldRef,
    pub mac: FieldRef,
}

impl PutMacBind {
    fn format(&self, f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
        write!(f, "{}({}, {}, {});", name, self.port, self.ip, self.mac)
    }

    fn encode(&self, ip_field: MfField, opcode: ActionOpcode, ofpacts: &mut Vec<Ofpact>) {
        let args = [(self.port.resolve(), MFF_LOG_INPORT),
                    (self.ip.resolve(), ip_field),
                    (self.mac.resolve(), MfField::EthSrc)];
        setup_args(&args, ofpacts);
        ofpacts.push(controller_op(false, controller_userdata(opcode), Vec::new()));
        restore_args(&args, ofpacts);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutArp(pub PutMacBind);

impl fmt::Display for PutArp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.format(f, "put_arp")
    }
}

impl Action for PutArp {
    fn encode(&self, _ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        self.0.encode(MfField::Reg(0), ActionOpcode::PutArp, ofpacts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutNd(pub PutMacBind);

impl fmt::Display for PutNd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.format(f, "put_nd")
    }
}

impl Action for PutNd {
    fn encode(&self, _ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        self.0.encode(MfField::Xxreg(0), ActionOpcode::PutNd, ofpacts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpOptionValue {
    pub option: DhcpOption,
    pub value: ConstantSet,
}

/// Common part of `put_dhcp_opts` and `put_dhcpv6_opts`.  `ovn-controller` builds the DHCP
/// reply from `options` and sets the 1-bit `dst` to 1 on success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutDhcpOpts {
    pub dst: FieldRef,
    pub options: Vec<DhcpOptionValue>,
}

impl PutDhcpOpts {
    fn format(&self, f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
        let options: Vec<String> = self.options.iter()
            .map(|o| format!("{} = {}", o.option.name, o.value))
            .collect();
        write!(f, "{} = {}({});", self.dst, name, options.join(", "))
    }

    /// The opcode header, then the NXM header and offset of `dst`.
    fn userdata(&self, opcode: ActionOpcode) -> Vec<u8> {
        let dst = self.dst.resolve();
        let mut userdata = controller_userdata(opcode);
        userdata.extend(&dst.field.nxm_header().unwrap_or(0).to_be_bytes());
        userdata.extend(&dst.ofs.to_be_bytes());
        userdata
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutDhcpv4Opts(pub PutDhcpOpts);

impl fmt::Display for PutDhcpv4Opts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.format(f, "put_dhcp_opts")
    }
}

impl Action for PutDhcpv4Opts {
    fn encode(&self, _ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        let mut userdata = self.0.userdata(ActionOpcode::PutDhcpOpts);

        // The offered address goes first, without an option header.
        let (offerip, others): (Vec<&DhcpOptionValue>, Vec<&DhcpOptionValue>) =
            self.0.options.iter().partition(|o| o.option.code == DHCP_OPT_OFFERIP_CODE);
        let offerip = offerip.first()
            .and_then(|o| o.value.values.first())
            .and_then(Constant::integer)
            .unwrap_or(0) as u32;
        userdata.extend(&offerip.to_be_bytes());
        for o in others {
            dhcp::encode_dhcpv4_option(&o.option, &o.value.values, &mut userdata);
        }
        ofpacts.push(controller_op(true, userdata, Vec::new()));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutDhcpv6Opts(pub PutDhcpOpts);

impl fmt::Display for PutDhcpv6Opts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.format(f, "put_dhcpv6_opts")
    }
}

impl Action for PutDhcpv6Opts {
    fn encode(&self, _ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        let mut userdata = self.0.userdata(ActionOpcode::PutDhcpv6Opts);
        for o in &self.0.options {
            dhcp::encode_dhcpv6_option(&o.option, &o.value.values, &mut userdata);
        }
        ofpacts.push(controller_op(true, userdata, Vec::new()));
    }
}

/// `set_queue(id);`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetQueue {
    pub queue_id: u16,
}

impl fmt::Display for SetQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "set_queue({});", self.queue_id)
    }
}

impl Action for SetQueue {
    fn encode(&self, _ep: &mut EncodeParams<'_>, ofpacts: &mut Vec<Ofpact>) {
        ofpacts.push(Ofpact::SetQueue(self.queue_id as u32));
    }
}

struct ActionContext<'a, 'b> {
    pp: &'a ParseParams<'a>,
    lexer: &'a mut Lexer<'b>,
    actions: Vec<OvnAction>,
    prereqs: Vec<String>,
}

fn parse_error(message: String) -> anyhow::Error {
    ActionParseError(message).into()
}

impl ActionContext<'_, '_> {
    fn add_prerequisite(&mut self, prereq: &str) {
        if !self.prereqs.iter().any(|p| p == prereq) {
            self.prereqs.push(prereq.into());
        }
    }

    fn parse_field(&mut self) -> Result<FieldRef> {
        FieldRef::parse(self.lexer, self.pp.symtab, &mut self.prereqs)
    }

    /// Parses a field and checks that it can be used as an `n_bits`-bit field (a string
    /// field if 0), writable if `rw`.
    fn parse_typed_field(&mut self, n_bits: u32, rw: bool) -> Result<FieldRef> {
        let f = self.parse_field()?;
        f.type_check(n_bits, rw)?;
        Ok(f)
    }

    fn parse_actions(&mut self, sentinel: &Token) -> Result<()> {
        // "drop;" alone is an empty list of actions.
        if self.lexer.is_id("drop") && self.lexer.lookahead()? == Token::Semicolon {
            self.lexer.get()?;
            self.lexer.get()?;
            return self.lexer.force_match(sentinel);
        }
        while !self.lexer.match_(sentinel)? {
            self.parse_action()?;
        }
        Ok(())
    }

    fn parse_action(&mut self) -> Result<()> {
        if !matches!(self.lexer.token, Token::Id(_)) {
            return Err(self.lexer.syntax_error(None));
        }

        let lookahead = self.lexer.lookahead()?;
        if matches!(lookahead, Token::Equals | Token::Exchange | Token::LSquare) {
            self.parse_set_action()?;
        } else if self.lexer.match_id("next")? {
            self.parse_next()?;
        } else if self.lexer.match_id("output")? {
            self.actions.push(OvnAction::Output(Output));
        } else if self.lexer.match_id("ip.ttl")? {
            self.lexer.force_match(&Token::Decrement)?;
            self.add_prerequisite("ip");
            self.actions.push(OvnAction::DecTtl(DecTtl));
        } else if self.lexer.match_id("ct_next")? {
            self.parse_ct_next()?;
        } else if self.lexer.match_id("ct_commit")? {
            self.parse_ct_commit()?;
        } else if self.lexer.match_id("ct_dnat")? {
            let cn = self.parse_ct_nat("ct_dnat")?;
            self.actions.push(OvnAction::CtDnat(CtDnat(cn)));
        } else if self.lexer.match_id("ct_snat")? {
            let cn = self.parse_ct_nat("ct_snat")?;
            self.actions.push(OvnAction::CtSnat(CtSnat(cn)));
        } else if self.lexer.match_id("ct_lb")? {
            self.parse_ct_lb()?;
        } else if self.lexer.match_id("ct_clear")? {
            self.actions.push(OvnAction::CtClear(CtClear));
        } else if self.lexer.match_id("clone")? {
            let nested = self.parse_nested(None)?;
            self.actions.push(OvnAction::Clone(CloneAction(nested)));
        } else if self.lexer.match_id("arp")? {
            let nested = self.parse_nested(Some("ip4"))?;
            self.actions.push(OvnAction::Arp(Arp(nested)));
        } else if self.lexer.match_id("nd_na")? {
            let nested = self.parse_nested(Some("nd_ns"))?;
            self.actions.push(OvnAction::NdNa(NdNa(nested)));
        } else if self.lexer.match_id("get_arp")? {
            let gm = self.parse_get_mac_bind(32)?;
            self.actions.push(OvnAction::GetArp(GetArp(gm)));
        } else if self.lexer.match_id("put_arp")? {
            let pm = self.parse_put_mac_bind(32)?;
            self.actions.push(OvnAction::PutArp(PutArp(pm)));
        } else if self.lexer.match_id("get_nd")? {
            let gm = self.parse_get_mac_bind(128)?;
            self.actions.push(OvnAction::GetNd(GetNd(gm)));
        } else if self.lexer.match_id("put_nd")? {
            let pm = self.parse_put_mac_bind(128)?;
            self.actions.push(OvnAction::PutNd(PutNd(pm)));
        } else if self.lexer.match_id("set_queue")? {
            self.parse_set_queue()?;
        } else {
            return Err(self.lexer.syntax_error(Some("expecting action")));
        }
        self.lexer.force_match(&Token::Semicolon)
    }

    /// Parses an assignment, an exchange, or `put_dhcp[v6]_opts`.
    fn parse_set_action(&mut self) -> Result<()> {
        let lhs = self.parse_field()?;
        if self.lexer.match_(&Token::Exchange)? {
            self.parse_assignment(true, lhs)
        } else if self.lexer.match_(&Token::Equals)? {
            let lookahead_paren = self.lexer.lookahead()? == Token::LParen;
            if !matches!(self.lexer.token, Token::Id(_)) {
                self.parse_load(lhs)
            } else if self.lexer.is_id("put_dhcp_opts") && lookahead_paren {
                let pdo = self.parse_put_dhcp_opts(lhs, false)?;
                self.actions.push(OvnAction::PutDhcpv4Opts(PutDhcpv4Opts(pdo)));
                Ok(())
            } else if self.lexer.is_id("put_dhcpv6_opts") && lookahead_paren {
                let pdo = self.parse_put_dhcp_opts(lhs, true)?;
                self.actions.push(OvnAction::PutDhcpv6Opts(PutDhcpv6Opts(pdo)));
                Ok(())
            } else {
                self.parse_assignment(false, lhs)
            }
        } else {
            Err(self.lexer.syntax_error(Some("expecting `=' or `<->'")))
        }
    }

    fn parse_load(&mut self, dst: FieldRef) -> Result<()> {
        dst.type_check(dst.n_bits, true)?;
        if dst.is_string() && !matches!(self.lexer.token, Token::String(_)) {
            return Err(self.lexer.syntax_error(Some("expecting string")));
        } else if !dst.is_string() && !matches!(self.lexer.token, Token::Integer { .. }) {
            return Err(self.lexer.syntax_error(Some("expecting integer")));
        }
        let imm = self.lexer.parse_constant()?;
        if imm.width() > dst.n_bits && !dst.is_string() {
            Err(parse_error(format!("{}-bit constant is not compatible with {}-bit field {}.",
                              imm.width(), dst.n_bits, dst)))?
        }
        self.actions.push(OvnAction::Load(Load { dst, imm }));
        Ok(())
    }

    fn parse_assignment(&mut self, exchange: bool, lhs: FieldRef) -> Result<()> {
        let rhs = self.parse_field()?;
        let kind = |f: &FieldRef| if f.is_string() { "string" } else { "integer" };
        if lhs.is_string() != rhs.is_string() {
            if exchange {
                Err(parse_error(format!("Can't exchange {} field ({}) with {} field ({}).",
                                  kind(&lhs), lhs.symbol.name, kind(&rhs), rhs.symbol.name)))?
            } else {
                Err(parse_error(format!("Can't assign {} field ({}) to {} field ({}).",
                                  kind(&rhs), rhs.symbol.name, kind(&lhs), lhs.symbol.name)))?
            }
        }
        if lhs.n_bits != rhs.n_bits {
            if exchange {
                Err(parse_error(format!("Can't exchange {}-bit field with {}-bit field.", lhs.n_bits, rhs.n_bits)))?
            } else {
                Err(parse_error(format!("Can't assign {}-bit value to {}-bit destination.", rhs.n_bits, lhs.n_bits)))?
            }
        } else if lhs.is_string() && lhs.symbol.field.n_bits != rhs.symbol.field.n_bits {
            Err(parse_error(format!("String fields {} and {} are incompatible for {}.",
                              lhs.symbol.name, rhs.symbol.name,
                              if exchange { "exchange" } else { "assignment" })))?
        }
        lhs.type_check(lhs.n_bits, true)?;
        rhs.type_check(rhs.n_bits, true)?;

        self.actions.push(if exchange {
            OvnAction::Exchange(Exchange { lhs, rhs })
        } else {
            OvnAction::Move(Move { lhs, rhs })
        });
        Ok(())
    }

    fn parse_next(&mut self) -> Result<()> {
        if self.pp.n_tables == 0 {
            Err(parse_error("\"next\" action not allowed here.".into()))?
        }

        let mut pipeline = self.pp.pipeline;
        let mut table = self.pp.cur_ltable as i64 + 1;
        if self.lexer.match_(&Token::LParen)? {
            if matches!(self.lexer.token, Token::Integer { .. }) {
                table = self.lexer.get_int()?;
            } else {
                loop {
                    if self.lexer.match_id("pipeline")? {
                        self.lexer.force_match(&Token::Equals)?;
                        if self.lexer.match_id("ingress")? {
                            pipeline = Pipeline::Ingress;
                        } else if self.lexer.match_id("egress")? {
                            pipeline = Pipeline::Egress;
                        } else {
                            return Err(self.lexer.syntax_error(Some("expecting \"ingress\" or \"egress\"")));
                        }
                    } else if self.lexer.match_id("table")? {
                        self.lexer.force_match(&Token::Equals)?;
                        table = self.lexer.get_int()?;
                    } else {
                        return Err(self.lexer.syntax_error(Some("expecting \"pipeline\" or \"table\"")));
                    }
                    if !self.lexer.match_(&Token::Comma)? {
                        break;
                    }
                }
            }
            self.lexer.force_match(&Token::RParen)?;
        }

        if pipeline == Pipeline::Egress && self.pp.pipeline == Pipeline::Ingress {
            Err(parse_error("\"next\" action cannot advance from ingress to egress pipeline \
                       (use \"output\" action instead)".into()))?
        } else if table >= self.pp.n_tables as i64 {
            Err(parse_error(format!("\"next\" action cannot advance beyond table {}.", self.pp.n_tables - 1)))?
        }

        self.actions.push(OvnAction::Next(Next {
            pipeline,
            ltable: table as u8,
            src_pipeline: self.pp.pipeline,
            src_ltable: self.pp.cur_ltable,
        }));
        Ok(())
    }

    fn check_not_last_table(&self, name: &str) -> Result<u8> {
        if self.pp.cur_ltable >= self.pp.n_tables {
            Err(parse_error(format!("\"{}\" action not allowed in last table.", name)))?
        }
        Ok(self.pp.cur_ltable + 1)
    }

    fn parse_ct_next(&mut self) -> Result<()> {
        let ltable = self.check_not_last_table("ct_next")?;
        self.add_prerequisite("ip");
        self.actions.push(OvnAction::CtNext(CtNext { ltable }));
        Ok(())
    }

    fn parse_ct_commit(&mut self) -> Result<()> {
        self.add_prerequisite("ip");

        let mut cc = CtCommit::default();
        if self.lexer.match_(&Token::LParen)? {
            while !self.lexer.match_(&Token::RParen)? {
                let is_mark = if self.lexer.match_id("ct_mark")? {
                    true
                } else if self.lexer.match_id("ct_label")? {
                    false
                } else {
                    return Err(self.lexer.syntax_error(None));
                };
                self.lexer.force_match(&Token::Equals)?;
                let (value, mask) = match self.lexer.token {
                    Token::Integer { value, mask, .. } => (value, mask),
                    _ => return Err(self.lexer.syntax_error(Some("expecting integer"))),
                };
                self.lexer.get()?;
                if is_mark {
                    cc.ct_mark = value as u32;
                    cc.ct_mark_mask = mask.map_or(u32::MAX, |m| m as u32);
                } else {
                    cc.ct_label = value;
                    cc.ct_label_mask = mask.unwrap_or(u128::MAX);
                }
                self.lexer.match_(&Token::Comma)?;
            }
        }
        self.actions.push(OvnAction::CtCommit(cc));
        Ok(())
    }

    fn parse_ct_nat(&mut self, name: &str) -> Result<CtNat> {
        self.add_prerequisite("ip");
        let ltable = self.check_not_last_table(name)?;

        let mut ip = None;
        if self.lexer.match_(&Token::LParen)? {
            match self.lexer.token {
                Token::Integer { value, mask: None, format: IntFormat::Ipv4 } => ip = Some(Ipv4Addr::from(value as u32)),
                _ => return Err(self.lexer.syntax_error(Some("expecting IPv4 address"))),
            }
            self.lexer.get()?;
            self.lexer.force_match(&Token::RParen)?;
        }
        Ok(CtNat { ltable, ip })
    }

    fn parse_ct_lb(&mut self) -> Result<()> {
        let ltable = self.check_not_last_table("ct_lb")?;
        self.add_prerequisite("ip");

        let mut dsts = Vec::new();
        if self.lexer.match_(&Token::LParen)? {
            while !self.lexer.match_(&Token::RParen)? {
                let ip = match self.lexer.token {
                    Token::Integer { value, mask: None, .. } if value <= u32::MAX as u128 => Ipv4Addr::from(value as u32),
                    _ => return Err(self.lexer.syntax_error(Some("expecting IPv4 address"))),
                };
                self.lexer.get()?;

                let mut port = 0;
                if self.lexer.match_(&Token::Colon)? {
                    port = match self.lexer.token {
                        Token::Integer { value, mask: None, format: IntFormat::Decimal | IntFormat::Hexadecimal }
                            if value <= u16::MAX as u128 => value as u16,
                        _ => return Err(self.lexer.syntax_error(Some("expecting port number"))),
                    };
                    self.lexer.get()?;
                }
                self.lexer.match_(&Token::Comma)?;
                dsts.push(CtLbDst { ip, port });
            }
        }
        self.actions.push(OvnAction::CtLb(CtLb { ltable, dsts }));
        Ok(())
    }

    /// Parses the `{ ... }` of `arp`, `nd_na`, or `clone`.  The inner prerequisites of
    /// `clone` apply to the outer flow; `arp` and `nd_na` replace them with `prereq`.
    fn parse_nested(&mut self, prereq: Option<&str>) -> Result<Vec<OvnAction>> {
        self.lexer.force_match(&Token::LCurly)?;

        let mut inner = ActionContext {
            pp: self.pp,
            lexer: &mut *self.lexer,
            actions: Vec::new(),
            prereqs: Vec::new(),
        };
        inner.parse_actions(&Token::RCurly)?;
        let (actions, inner_prereqs) = (inner.actions, inner.prereqs);

        match prereq {
            Some(prereq) => self.add_prerequisite(prereq),
            None => for p in &inner_prereqs {
                self.add_prerequisite(p);
            },
        }
        Ok(actions)
    }

    fn parse_get_mac_bind(&mut self, width: u32) -> Result<GetMacBind> {
        self.lexer.force_match(&Token::LParen)?;
        let port = self.parse_typed_field(0, false)?;
        self.lexer.force_match(&Token::Comma)?;
        let ip = self.parse_typed_field(width, false)?;
        self.lexer.force_match(&Token::RParen)?;
        Ok(GetMacBind { port, ip })
    }

    fn parse_put_mac_bind(&mut self, width: u32) -> Result<PutMacBind> {
        self.lexer.force_match(&Token::LParen)?;
        let port = self.parse_typed_field(0, false)?;
        self.lexer.force_match(&Token::Comma)?;
        let ip = self.parse_typed_field(width, false)?;
        self.lexer.force_match(&Token::Comma)?;
        let mac = self.parse_typed_field(48, false)?;
        self.lexer.force_match(&Token::RParen)?;
        Ok(PutMacBind { port, ip, mac })
    }

    fn parse_dhcp_opt(&mut self, v6: bool) -> Result<DhcpOptionValue> {
        let (name, map) = if v6 { ("DHCPv6", self.pp.dhcpv6_opts) } else { ("DHCPv4", self.pp.dhcp_opts) };
        let option = match &self.lexer.token {
            Token::Id(id) => map.lookup(id).cloned(),
            _ => return Err(self.lexer.syntax_error(None)),
        };
        let option = match option {
            Some(option) => option,
            None => return Err(self.lexer.syntax_error(Some(&format!("expecting {} option name", name)))),
        };
        self.lexer.get()?;
        self.lexer.force_match(&Token::Equals)?;

        let value = self.lexer.parse_constant_set()?;
        if option.type_.is_string() && !value.is_string() {
            Err(parse_error(format!("{} option {} requires string value.", name, option.name)))?
        } else if !option.type_.is_string() && value.is_string() {
            Err(parse_error(format!("{} option {} requires numeric value.", name, option.name)))?
        }
        Ok(DhcpOptionValue { option, value })
    }

    /// Parses the rest of `dst = put_dhcp[v6]_opts(...)`, starting at the action name.
    fn parse_put_dhcp_opts(&mut self, dst: FieldRef, v6: bool) -> Result<PutDhcpOpts> {
        self.lexer.get()?;
        self.lexer.get()?;

        dst.type_check(1, true)?;
        if dst.resolve().field.nxm_header().is_none() {
            Err(parse_error(format!("Cannot use field {} as the destination of {}.", dst,
                              if v6 { "put_dhcpv6_opts" } else { "put_dhcp_opts" })))?
        }

        let mut options = Vec::new();
        while !self.lexer.match_(&Token::RParen)? {
            options.push(self.parse_dhcp_opt(v6)?);
            self.lexer.match_(&Token::Comma)?;
        }
        if !v6 && !options.iter().any(|o: &DhcpOptionValue| o.option.code == DHCP_OPT_OFFERIP_CODE) {
            Err(parse_error("put_dhcp_opts requires offerip to be specified.".into()))?
        }
        Ok(PutDhcpOpts { dst, options })
    }

    fn parse_set_queue(&mut self) -> Result<()> {
        self.lexer.force_match(&Token::LParen)?;
        let queue_id = self.lexer.get_int()?;
        self.lexer.force_match(&Token::RParen)?;

        if !(QDISC_MIN_QUEUE_ID..=QDISC_MAX_QUEUE_ID).contains(&queue_id) {
            Err(parse_error(format!("Queue ID {} for set_queue is not in valid range {} to {}.",
                              queue_id, QDISC_MIN_QUEUE_ID, QDISC_MAX_QUEUE_ID)))?
        }
        self.actions.push(OvnAction::SetQueue(SetQueue { queue_id: queue_id as u16 }));
        Ok(())
    }
}

/// Parses the actions in `s`.  Returns the actions and, if some actions have
/// prerequisites, the match that a flow needs to satisfy them, e.g. `ip && ip4`.
pub fn parse_actions(s: &str, pp: &ParseParams<'_>) -> Result<(Vec<OvnAction>, Option<String>)> {
    let mut lexer = Lexer::new(s)?;
    let mut ctx = ActionContext {
        pp,
        lexer: &mut lexer,
        actions: Vec::new(),
        prereqs: Vec::new(),
    };
    ctx.parse_actions(&Token::End)?;

    let prereqs = if ctx.prereqs.is_empty() { None } else { Some(ctx.prereqs.join(" && ")) };
    Ok((ctx.actions, prereqs))
}

/// Formats `actions` in the syntax that [`parse_actions`] accepts.
pub fn format_actions(actions: &[OvnAction]) -> String {
    if actions.is_empty() {
        return "drop;".into();
    }
    actions.iter().join(" ")
}

pub fn encode_actions(actions: &[OvnAction], ep: &mut EncodeParams<'_>) -> Vec<Ofpact> {
    let mut ofpacts = Vec::new();
    for a in actions {
        a.encode(ep, &mut ofpacts);
    }
    ofpacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovs::ofpact::Ofpacts;

    struct Fixture {
        symtab: Symtab,
        dhcp_opts: DhcpOpts,
        dhcpv6_opts: DhcpOpts,
        group_table: GroupTable,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                symtab: Symtab::ovn(),
                dhcp_opts: DhcpOpts::supported_v4(),
                dhcpv6_opts: DhcpOpts::supported_v6(),
                group_table: GroupTable::new(),
            }
        }

        fn pp(&self, pipeline: Pipeline, cur_ltable: u8) -> ParseParams<'_> {
            ParseParams {
                symtab: &self.symtab,
                dhcp_opts: &self.dhcp_opts,
                dhcpv6_opts: &self.dhcpv6_opts,
                pipeline,
                n_tables: 16,
                cur_ltable,
            }
        }

        fn parse(&self, s: &str) -> Result<(Vec<OvnAction>, Option<String>)> {
            parse_actions(s, &self.pp(Pipeline::Ingress, 10))
        }

        fn error(&self, s: &str) -> String {
            self.parse(s).unwrap_err().to_string()
        }

        /// Parses `s`, checks that it formats back to `s`, and returns its encoding.
        fn encode(&mut self, s: &str, is_switch: bool) -> String {
            let (actions, _) = self.parse(s).unwrap();
            assert_eq!(format_actions(&actions), s);
            let lookup_port = |name: &str| match name {
                "P1" => Some(5),
                _ => None,
            };
            let mut ep = EncodeParams {
                lookup_port: &lookup_port,
                is_switch,
                is_gateway_router: false,
                group_table: &mut self.group_table,
                pipeline: Pipeline::Ingress,
                ingress_ptable: 16,
                egress_ptable: 48,
                output_ptable: 32,
                mac_bind_ptable: 66,
            };
            Ofpacts(&encode_actions(&actions, &mut ep)).to_string()
        }
    }

    #[test]
    fn basic_actions() {
        let mut fx = Fixture::new();
        assert_eq!(fx.encode("drop;", true), "drop");
        assert_eq!(fx.encode("outport = \"P1\"; output;", true), "set_field:0x5->reg15,resubmit(,32)");
        assert_eq!(fx.encode("outport = \"nowhere\"; output;", true), "set_field:0x0->reg15,resubmit(,32)");
        assert_eq!(fx.encode("next;", true), "resubmit(,27)");
        assert_eq!(fx.encode("next(3);", true), "resubmit(,19)");
        assert_eq!(fx.encode("reg0[0..15] = 0x1234;", true), "set_field:0x1234/0xffff->reg0");
        assert_eq!(fx.encode("flags.loopback = 1;", true), "set_field:0x1/0x1->reg10");
        assert_eq!(fx.encode("outport = inport;", true), "move:NXM_NX_REG14[]->NXM_NX_REG15[]");
        assert_eq!(fx.encode("reg0 <-> reg1;", true),
                   "push:NXM_NX_REG1[],push:NXM_NX_REG0[],pop:NXM_NX_REG1[],pop:NXM_NX_REG0[]");
        assert_eq!(fx.encode("set_queue(10);", true), "set_queue:10");
        assert_eq!(fx.encode("ct_clear;", true), "ct_clear");
    }

    #[test]
    fn prerequisites() -> Result<()> {
        let fx = Fixture::new();
        let (_, prereqs) = fx.parse("ip.ttl--; ip4.dst = 10.0.0.1; next;")?;
        assert_eq!(prereqs.as_deref(), Some("ip && ip4"));
        let (_, prereqs) = fx.parse("output;")?;
        assert_eq!(prereqs, None);
        let (_, prereqs) = fx.parse("clone { ip4.src = 1.2.3.4; output; };")?;
        assert_eq!(prereqs.as_deref(), Some("ip4"));
        let (_, prereqs) = fx.parse("arp { eth.dst = ff:ff:ff:ff:ff:ff; output; };")?;
        assert_eq!(prereqs.as_deref(), Some("ip4"));
        Ok(())
    }

    #[test]
    fn conntrack() {
        let mut fx = Fixture::new();
        assert_eq!(fx.encode("ct_next;", true), "ct(table=27,zone=NXM_NX_REG13[0..15])");
        assert_eq!(fx.encode("ct_next;", false), "ct(table=27,zone=NXM_NX_REG11[0..15])");
        assert_eq!(fx.encode("ct_commit;", true), "ct(commit,zone=NXM_NX_REG13[0..15])");
        assert_eq!(fx.encode("ct_commit(ct_mark=0x1/0x1);", true),
                   "ct(commit,zone=NXM_NX_REG13[0..15],exec(set_field:0x1/0x1->ct_mark))");
        assert_eq!(fx.encode("ct_snat(203.0.113.1);", false),
                   "ct(commit,table=27,zone=NXM_NX_REG12[0..15],nat(src=203.0.113.1))");
        assert_eq!(fx.encode("ct_dnat;", false), "ct(table=27,zone=NXM_NX_REG11[0..15],nat)");
        assert_eq!(fx.encode("ct_lb;", true), "ct(table=27,zone=NXM_NX_REG13[0..15],nat)");
    }

    #[test]
    fn load_balancing() {
        let mut fx = Fixture::new();
        assert_eq!(fx.encode("ct_lb(10.0.0.2:80, 10.0.0.3);", true), "group:1");
        assert_eq!(fx.encode("ct_lb(10.0.0.2:80, 10.0.0.3);", true), "group:1");
        assert_eq!(fx.encode("ct_lb(10.0.0.4);", true), "group:2");
        let group = fx.group_table.desired.iter().find(|(_, id)| **id == 1).map(|(g, _)| g.clone());
        assert_eq!(group.as_deref(), Some(
            "type=select,\
             bucket=bucket_id=0,weight:100,actions=ct(nat(dst=10.0.0.2:80),commit,table=27,zone=NXM_NX_REG13[0..15]),\
             bucket=bucket_id=1,weight:100,actions=ct(nat(dst=10.0.0.3),commit,table=27,zone=NXM_NX_REG13[0..15])"));
    }

    #[test]
    fn mac_bindings() {
        let mut fx = Fixture::new();
        assert_eq!(fx.encode("get_arp(outport, reg0);", false),
                   "set_field:00:00:00:00:00:00->eth_dst,resubmit(,66)");
        assert_eq!(fx.encode("get_arp(inport, reg1);", false),
                   "push:NXM_NX_REG15[],push:NXM_NX_REG0[],push:NXM_NX_REG1[],push:NXM_NX_REG14[],\
                    pop:NXM_NX_REG15[],pop:NXM_NX_REG0[],\
                    set_field:00:00:00:00:00:00->eth_dst,resubmit(,66),\
                    pop:NXM_NX_REG0[],pop:NXM_NX_REG15[]");
        assert_eq!(fx.encode("put_arp(inport, arp.spa, arp.sha);", false),
                   "push:NXM_NX_REG0[],push:NXM_OF_ETH_SRC[],push:NXM_NX_ARP_SHA[],push:NXM_OF_ARP_SPA[],\
                    pop:NXM_NX_REG0[],pop:NXM_OF_ETH_SRC[],\
                    controller(userdata=00.00.00.01.00.00.00.00),\
                    pop:NXM_OF_ETH_SRC[],pop:NXM_NX_REG0[]");
    }

    #[test]
    fn dhcp() {
        let mut fx = Fixture::new();
        let s = "reg0[3] = put_dhcp_opts(offerip = 10.0.0.4, router = 10.0.0.1, mtu = 1400); next;";
        assert_eq!(fx.encode(s, true),
                   "controller(userdata=00.00.00.02.00.00.00.00.00.01.00.04.00.00.00.03.\
                    0a.00.00.04.03.04.0a.00.00.01.1a.02.05.78,pause),resubmit(,27)");

        let s = "reg0[3] = put_dhcpv6_opts(server_id = 00:00:00:00:10:02);";
        assert_eq!(fx.encode(s, true),
                   "controller(userdata=00.00.00.05.00.00.00.00.00.01.00.04.00.00.00.03.\
                    00.02.00.06.00.00.00.00.10.02,pause)");
    }

    #[test]
    fn errors() {
        let fx = Fixture::new();
        assert_eq!(fx.error("foo;"), "Syntax error at `foo' expecting action.");
        assert_eq!(fx.error("output"), "Syntax error at end of input expecting `;'.");
        assert_eq!(fx.error("eth.type = 1;"), "Field eth.type is not modifiable.");
        assert_eq!(fx.error("reg0[0..7] = reg1;"), "Can't assign 32-bit value to 8-bit destination.");
        assert_eq!(fx.error("inport = reg0;"), "Can't assign integer field (reg0) to string field (inport).");
        assert_eq!(fx.error("reg0 <-> outport;"), "Can't exchange integer field (reg0) with string field (outport).");
        assert_eq!(fx.error("reg0[0..3] = 16;"), "5-bit constant is not compatible with 4-bit field reg0[0..3].");
        assert_eq!(fx.error("set_queue(61441);"), "Queue ID 61441 for set_queue is not in valid range 0 to 61440.");
        assert_eq!(fx.error("ct_snat(foo);"), "Syntax error at `foo' expecting IPv4 address.");
        assert_eq!(fx.error("ct_lb(10.0.0.1:99999);"), "Syntax error at `99999' expecting port number.");
        assert_eq!(fx.error("reg0[3] = put_dhcp_opts(router = 10.0.0.1);"),
                   "put_dhcp_opts requires offerip to be specified.");
        assert_eq!(fx.error("reg0[3] = put_dhcp_opts(offerip = 10.0.0.4, mtu = \"x\");"),
                   "DHCPv4 option mtu requires numeric value.");
        assert_eq!(fx.error("reg0[3] = put_dhcp_opts(offerip = 10.0.0.4, bogus = 1);"),
                   "Syntax error at `bogus' expecting DHCPv4 option name.");
        assert_eq!(fx.error("next(pipeline=egress, table=1);"),
                   "\"next\" action cannot advance from ingress to egress pipeline (use \"output\" action instead)");
        assert_eq!(fx.error("next(16);"), "\"next\" action cannot advance beyond table 15.");
    }

    #[test]
    fn next_formats() -> Result<()> {
        let fx = Fixture::new();
        let pp = fx.pp(Pipeline::Egress, 2);
        let (actions, _) = parse_actions("next(pipeline=ingress, table=0); next(5); next(table=3);", &pp)?;
        assert_eq!(format_actions(&actions), "next(pipeline=ingress, table=0); next(5); next;");
        Ok(())
    }
}
