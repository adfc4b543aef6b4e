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

//! Translates the OVN Northbound database, which describes logical networks in terms of
//! switches, routers, ports, ACLs and NAT, into the Southbound database's logical flows and
//! bindings, and reports progress back to the Northbound database.
//!
//! Every rebuild starts from scratch: [`ovnnb_db_run`] joins the Northbound rows against
//! what the Southbound database already has, computes the desired Southbound contents, and
//! writes only the differences.  [`Northd`] drives rebuilds from a pair of [`IdlLoop`]s.

pub mod context;
pub mod datapath;
pub mod ipam;
pub mod lb;
pub mod port;
pub mod router;
pub mod stage;
pub mod switch;
pub mod sync;
pub mod tnlid;

#[cfg(test)]
mod testing;

use anyhow::Result;
use ovn::nb::NbGlobal;
use ovn::sb::SbGlobal;
use ovn::FromRow;
use ovsdb_client::{CommitProgress, Datum, Idl, IdlLoop, IdlState};
use tracing::{debug, info};

pub use context::NorthdContext;

use crate::datapath::build_datapaths;
use crate::ipam::build_ipam;
use crate::port::build_ports;
use crate::sync::{build_lflows, sync_address_sets, sync_dhcp_options, update_logical_port_status,
                  update_northbound_cfg};

/// The Southbound lock that only the active ovn-northd holds.
pub const NORTHD_LOCK: &str = "ovn_northd";

/// Southbound columns that ovn-northd writes but never needs to react to.
const SB_OMIT_ALERT: &[(&str, &str)] = &[
    ("SB_Global", "nb_cfg"),
    ("Logical_Flow", "logical_datapath"),
    ("Logical_Flow", "pipeline"),
    ("Logical_Flow", "table_id"),
    ("Logical_Flow", "priority"),
    ("Logical_Flow", "match"),
    ("Logical_Flow", "actions"),
    ("Logical_Flow", "external_ids"),
    ("Multicast_Group", "datapath"),
    ("Multicast_Group", "name"),
    ("Multicast_Group", "tunnel_key"),
    ("Multicast_Group", "ports"),
    ("Address_Set", "name"),
    ("Address_Set", "addresses"),
    ("DHCP_Options", "name"),
    ("DHCP_Options", "code"),
    ("DHCP_Options", "type"),
    ("DHCPv6_Options", "name"),
    ("DHCPv6_Options", "code"),
    ("DHCPv6_Options", "type"),
];

/// Northbound columns that ovn-northd writes but never needs to react to.
const NB_OMIT_ALERT: &[(&str, &str)] = &[
    ("NB_Global", "sb_cfg"),
    ("NB_Global", "hv_cfg"),
];

/// True if `idl` is connected and its replica is current.
fn is_monitoring(idl: &Idl) -> bool {
    idl.is_connected() && matches!(idl.state(), IdlState::Monitoring | IdlState::MonitoringCond)
}

/// Rebuilds the Southbound database from the Northbound database.  Returns the Northbound
/// `nb_cfg` that the Southbound database reflects once this rebuild commits.
pub fn ovnnb_db_run(ctx: &mut NorthdContext) -> Result<i64> {
    let mut datapaths = build_datapaths(ctx)?;
    let mut ports = build_ports(ctx, &mut datapaths)?;
    build_ipam(ctx, &mut datapaths, &mut ports)?;
    build_lflows(ctx, &mut datapaths, &ports)?;
    sync_address_sets(ctx)?;

    // Both databases should have exactly one global row.
    let nb_cfg = match NbGlobal::read_all(ctx.nb_idl()).first() {
        Some(nbg) => nbg.nb_cfg,
        None => {
            ctx.nb.insert("NB_Global", None)?;
            0
        }
    };
    let sbg = match SbGlobal::read_all(ctx.sb_idl()).first() {
        Some(sbg) => sbg.uuid,
        None => ctx.sb.insert("SB_Global", None)?,
    };
    ctx.sb.write("SB_Global", &sbg, "nb_cfg", Datum::scalar(nb_cfg))?;
    Ok(nb_cfg)
}

/// Carries status from the Southbound database back to the Northbound database.
/// `sb_cur_cfg` is the `nb_cfg` of the last Southbound transaction known to have committed.
pub fn ovnsb_db_run(ctx: &mut NorthdContext, sb_cur_cfg: i64) -> Result<()> {
    update_logical_port_status(ctx)?;
    update_northbound_cfg(ctx, sb_cur_cfg)
}

/// One ovn-northd instance: a Northbound and a Southbound replica, each with its commit
/// cadence.
pub struct Northd {
    pub nb: IdlLoop,
    pub sb: IdlLoop,
    had_lock: bool,
}

impl Northd {
    /// Sets up `nb_idl` and `sb_idl`, which should monitor everything, for ovn-northd and
    /// requests the Southbound lock.
    pub fn new(mut nb_idl: Idl, mut sb_idl: Idl) -> Result<Northd> {
        for (table, column) in NB_OMIT_ALERT {
            nb_idl.omit_alert(table, column)?;
        }
        for (table, column) in SB_OMIT_ALERT {
            sb_idl.omit_alert(table, column)?;
        }
        sb_idl.set_lock(Some(NORTHD_LOCK));

        Ok(Northd {
            nb: IdlLoop::new(nb_idl),
            sb: IdlLoop::new(sb_idl),
            had_lock: false,
        })
    }

    /// Runs both replicas and, if both databases are connected, this instance holds the
    /// lock, and neither database has a transaction in flight, rebuilds the Southbound
    /// database and propagates status to the Northbound database.
    pub fn run_once(&mut self) -> Result<()> {
        let sb_cur_cfg = self.sb.cur_cfg;
        let mut nb_cfg = None;
        let (nb_handle, sb_handle) = match (self.nb.run(), self.sb.run()) {
            (Some(mut nb_txn), Some(mut sb_txn)) => {
                if !is_monitoring(&nb_txn) || !is_monitoring(&sb_txn) || !sb_txn.has_lock() {
                    nb_txn.abort();
                    sb_txn.abort();
                    (None, None)
                } else {
                    {
                        let mut ctx = NorthdContext::new(&mut nb_txn, &mut sb_txn);
                        nb_cfg = Some(ovnnb_db_run(&mut ctx)?);
                        sync_dhcp_options(&mut ctx)?;
                        ovnsb_db_run(&mut ctx, sb_cur_cfg)?;
                    }
                    (Some(nb_txn.commit()), Some(sb_txn.commit()))
                }
            },
            // A transaction is still in flight.  Whichever one was started is aborted when it
            // goes out of scope.
            _ => (None, None),
        };

        if let Some(nb_cfg) = nb_cfg {
            self.sb.next_cfg = nb_cfg;
        }
        if self.nb.commit_and_wait(nb_handle) == CommitProgress::Failed {
            debug!("Northbound transaction failed, will retry");
        }
        if self.sb.commit_and_wait(sb_handle) == CommitProgress::Failed {
            debug!("Southbound transaction failed, will retry");
        }

        let has_lock = self.sb.idl.has_lock();
        if has_lock != self.had_lock {
            if has_lock {
                info!("ovn-northd lock acquired. This ovn-northd instance is now active.");
            } else {
                info!("ovn-northd lock lost. This ovn-northd instance is now on standby.");
            }
            self.had_lock = has_lock;
        }
        Ok(())
    }
}
