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

//! Load balancer VIPs.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ovn::addresses::parse_ipv4_cidr;
use ovn::nb::LoadBalancer;
use tracing::{event, Level};

/// Parses a key of the `vips` column of `Load_Balancer`, which is `IP` or `IP:PORT`.
/// The port is 0 if it is absent.
pub fn ip_address_and_port_from_lb_key(key: &str) -> Option<(Ipv4Addr, u16)> {
    let (ip_s, port_s) = match key.split_once(':') {
        Some((ip_s, port_s)) => (ip_s, port_s),
        None => (key, ""),
    };
    let ip = match parse_ipv4_cidr(ip_s) {
        Some((ip, 32)) if !ip_s.is_empty() => ip,
        _ => {
            event!(Level::WARN, "bad ip address for load balancer key {}", key);
            return None;
        }
    };
    if port_s.is_empty() {
        return Some((ip, 0));
    }
    match port_s.parse::<u16>() {
        Ok(port) => Some((ip, port)),
        Err(_) => {
            event!(Level::WARN, "bad ip port for load balancer key {}", key);
            None
        }
    }
}

/// All the VIP addresses of `lbs`.
pub fn lb_vip_ips(lbs: &[LoadBalancer]) -> BTreeSet<Ipv4Addr> {
    lbs.iter()
        .flat_map(|lb| lb.vips.keys())
        .filter_map(|key| ip_address_and_port_from_lb_key(key))
        .map(|(ip, _)| ip)
        .collect()
}
