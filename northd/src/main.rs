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

use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use northd::Northd;
use ovn::nb::nb_class;
use ovn::sb::sb_class;
use ovs::jsonrpc::Session;
use ovsdb_client::{Idl, IdlClass};
use tracing::{event, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// Northbound database to connect to.
    #[clap(long, default_value = "unix:/var/run/openvswitch/ovnnb_db.sock")]
    ovnnb_db: String,

    /// Southbound database to connect to.
    #[clap(long, default_value = "unix:/var/run/openvswitch/ovnsb_db.sock")]
    ovnsb_db: String,

    /// Inactivity probe interval for both databases, in milliseconds.  0 disables probes.
    #[clap(long)]
    probe_interval: Option<u64>,

    /// Longest time to wait between reconnection attempts, in milliseconds.
    #[clap(long)]
    max_backoff: Option<u64>,
}

fn open_idl(remote: &str, args: &Args, class: IdlClass) -> Idl {
    let mut session = Session::open(remote, true);
    if let Some(max_backoff) = args.max_backoff {
        session.set_max_backoff(Duration::from_millis(max_backoff));
    }
    let mut idl = Idl::with_session(Box::new(session), class, true);
    if let Some(probe_interval) = args.probe_interval {
        idl.set_probe_interval(Duration::from_millis(probe_interval));
    }
    idl
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let nb_idl = open_idl(&args.ovnnb_db, &args, nb_class());
    let sb_idl = open_idl(&args.ovnsb_db, &args, sb_class());
    let mut northd = Northd::new(nb_idl, sb_idl)?;
    info!("connecting to {} and {}", args.ovnnb_db, args.ovnsb_db);

    loop {
        if let Err(e) = northd.run_once() {
            event!(Level::ERROR, "{:#}", e);
        }
        for idl in [&northd.nb.idl, &northd.sb.idl] {
            if !idl.is_alive() {
                let error = idl.get_last_error().unwrap_or_default();
                event!(Level::ERROR, "giving up on {}: {}", idl.class().database, error);
                bail!("{}: {}", idl.class().database, error);
            }
        }
        sleep(Duration::from_millis(10));
    }
}
