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

//! The stages of the logical pipelines and the table of logical flows that a rebuild
//! computes.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;

use ovn::actions::Pipeline;
use uuid::Uuid;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatapathType {
    Switch,
    Router,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    // Logical switch ingress.
    LsInPortSecL2,
    LsInPortSecIp,
    LsInPortSecNd,
    LsInPreAcl,
    LsInPreLb,
    LsInPreStateful,
    LsInAcl,
    LsInQosMark,
    LsInLb,
    LsInStateful,
    LsInArpRsp,
    LsInDhcpOptions,
    LsInDhcpResponse,
    LsInL2Lkup,

    // Logical switch egress.
    LsOutPreLb,
    LsOutPreAcl,
    LsOutPreStateful,
    LsOutLb,
    LsOutAcl,
    LsOutQosMark,
    LsOutStateful,
    LsOutPortSecIp,
    LsOutPortSecL2,

    // Logical router ingress.
    LrInAdmission,
    LrInIpInput,
    LrInDefrag,
    LrInUnsnat,
    LrInDnat,
    LrInIpRouting,
    LrInArpResolve,
    LrInGwRedirect,
    LrInArpRequest,

    // Logical router egress.
    LrOutUndnat,
    LrOutSnat,
    LrOutEgrLoop,
    LrOutDelivery,
}

use DatapathType::*;
use Pipeline::*;

const STAGES: &[(Stage, DatapathType, Pipeline, u8, &str)] = &[
    (Stage::LsInPortSecL2,    Switch, Ingress,  0, "ls_in_port_sec_l2"),
    (Stage::LsInPortSecIp,    Switch, Ingress,  1, "ls_in_port_sec_ip"),
    (Stage::LsInPortSecNd,    Switch, Ingress,  2, "ls_in_port_sec_nd"),
    (Stage::LsInPreAcl,       Switch, Ingress,  3, "ls_in_pre_acl"),
    (Stage::LsInPreLb,        Switch, Ingress,  4, "ls_in_pre_lb"),
    (Stage::LsInPreStateful,  Switch, Ingress,  5, "ls_in_pre_stateful"),
    (Stage::LsInAcl,          Switch, Ingress,  6, "ls_in_acl"),
    (Stage::LsInQosMark,      Switch, Ingress,  7, "ls_in_qos_mark"),
    (Stage::LsInLb,           Switch, Ingress,  8, "ls_in_lb"),
    (Stage::LsInStateful,     Switch, Ingress,  9, "ls_in_stateful"),
    (Stage::LsInArpRsp,       Switch, Ingress, 10, "ls_in_arp_rsp"),
    (Stage::LsInDhcpOptions,  Switch, Ingress, 11, "ls_in_dhcp_options"),
    (Stage::LsInDhcpResponse, Switch, Ingress, 12, "ls_in_dhcp_response"),
    (Stage::LsInL2Lkup,       Switch, Ingress, 13, "ls_in_l2_lkup"),

    (Stage::LsOutPreLb,       Switch, Egress,   0, "ls_out_pre_lb"),
    (Stage::LsOutPreAcl,      Switch, Egress,   1, "ls_out_pre_acl"),
    (Stage::LsOutPreStateful, Switch, Egress,   2, "ls_out_pre_stateful"),
    (Stage::LsOutLb,          Switch, Egress,   3, "ls_out_lb"),
    (Stage::LsOutAcl,         Switch, Egress,   4, "ls_out_acl"),
    (Stage::LsOutQosMark,     Switch, Egress,   5, "ls_out_qos_mark"),
    (Stage::LsOutStateful,    Switch, Egress,   6, "ls_out_stateful"),
    (Stage::LsOutPortSecIp,   Switch, Egress,   7, "ls_out_port_sec_ip"),
    (Stage::LsOutPortSecL2,   Switch, Egress,   8, "ls_out_port_sec_l2"),

    (Stage::LrInAdmission,    Router, Ingress,  0, "lr_in_admission"),
    (Stage::LrInIpInput,      Router, Ingress,  1, "lr_in_ip_input"),
    (Stage::LrInDefrag,       Router, Ingress,  2, "lr_in_defrag"),
    (Stage::LrInUnsnat,       Router, Ingress,  3, "lr_in_unsnat"),
    (Stage::LrInDnat,         Router, Ingress,  4, "lr_in_dnat"),
    (Stage::LrInIpRouting,    Router, Ingress,  5, "lr_in_ip_routing"),
    (Stage::LrInArpResolve,   Router, Ingress,  6, "lr_in_arp_resolve"),
    (Stage::LrInGwRedirect,   Router, Ingress,  7, "lr_in_gw_redirect"),
    (Stage::LrInArpRequest,   Router, Ingress,  8, "lr_in_arp_request"),

    (Stage::LrOutUndnat,      Router, Egress,   0, "lr_out_undnat"),
    (Stage::LrOutSnat,        Router, Egress,   1, "lr_out_snat"),
    (Stage::LrOutEgrLoop,     Router, Egress,   2, "lr_out_egr_loop"),
    (Stage::LrOutDelivery,    Router, Egress,   3, "lr_out_delivery"),
];

impl Stage {
    fn entry(&self) -> &'static (Stage, DatapathType, Pipeline, u8, &'static str) {
        // `STAGES` lists the variants in declaration order.
        &STAGES[*self as usize]
    }

    pub fn datapath_type(&self) -> DatapathType {
        self.entry().1
    }

    pub fn pipeline(&self) -> Pipeline {
        self.entry().2
    }

    pub fn table(&self) -> u8 {
        self.entry().3
    }

    pub fn name(&self) -> &'static str {
        self.entry().4
    }

    /// Finds the stage that occupies `table` in `pipeline` of datapaths of type `dp_type`.
    pub fn lookup(dp_type: DatapathType, pipeline: Pipeline, table: i64) -> Option<Stage> {
        STAGES.iter()
            .find(|(_, t, p, id, _)| *t == dp_type && *p == pipeline && *id as i64 == table)
            .map(|entry| entry.0)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One logical flow, identified by the Northbound uuid of its datapath.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lflow {
    pub datapath: Uuid,
    pub stage: Stage,
    pub priority: u16,
    pub match_: String,
    pub actions: String,
}

/// The logical flows computed by one rebuild.  Adding a flow that is already present has no
/// effect.  Each flow remembers the source location that first added it.
#[derive(Clone, Debug, Default)]
pub struct LflowTable {
    flows: BTreeMap<Lflow, &'static Location<'static>>,
}

impl LflowTable {
    pub fn new() -> LflowTable {
        LflowTable::default()
    }

    #[track_caller]
    pub fn add<M, A>(&mut self, datapath: Uuid, stage: Stage, priority: u16, match_: M, actions: A)
    where M: Into<String>,
          A: Into<String>
    {
        let location = Location::caller();
        let lflow = Lflow {
            datapath,
            stage,
            priority,
            match_: match_.into(),
            actions: actions.into(),
        };
        self.flows.entry(lflow).or_insert(location);
    }

    /// Removes `lflow`, returning true if it was present.
    pub fn remove(&mut self, lflow: &Lflow) -> bool {
        self.flows.remove(lflow).is_some()
    }

    pub fn contains(&self, lflow: &Lflow) -> bool {
        self.flows.contains_key(lflow)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Iterates over the flows with the `file:line` source of each.
    pub fn iter(&self) -> impl Iterator<Item = (&Lflow, String)> {
        self.flows.iter().map(|(lflow, location)| {
            let file = location.file().rsplit('/').next().unwrap_or_default();
            (lflow, format!("{}:{}", file, location.line()))
        })
    }

    /// The flows in `stage` of `datapath`, for inspection.
    pub fn stage_flows(&self, datapath: &Uuid, stage: Stage) -> Vec<&Lflow> {
        self.flows.keys()
            .filter(|lflow| lflow.datapath == *datapath && lflow.stage == stage)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_table() {
        for (i, entry) in STAGES.iter().enumerate() {
            assert_eq!(entry.0 as usize, i);
        }
        assert_eq!(Stage::LsInL2Lkup.table(), 13);
        assert_eq!(Stage::LsOutPortSecL2.pipeline(), Egress);
        assert_eq!(Stage::LrInArpResolve.name(), "lr_in_arp_resolve");
        assert_eq!(Stage::lookup(Router, Egress, 1), Some(Stage::LrOutSnat));
        assert_eq!(Stage::lookup(Router, Egress, 4), None);
    }

    #[test]
    fn dedup() {
        let dp = Uuid::new_v4();
        let mut lflows = LflowTable::new();
        lflows.add(dp, Stage::LsInAcl, 0, "1", "next;");
        lflows.add(dp, Stage::LsInAcl, 0, "1", "next;");
        lflows.add(dp, Stage::LsOutAcl, 0, "1", "next;");
        assert_eq!(lflows.len(), 2);

        let (_, source) = lflows.iter().next().unwrap();
        assert!(source.starts_with("stage.rs:"));
        assert_eq!(lflows.stage_flows(&dp, Stage::LsInAcl).len(), 1);
    }
}
