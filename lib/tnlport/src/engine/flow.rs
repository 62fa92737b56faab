// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flow metadata and wildcard tracking.
//!
//! These structures are owned by the forwarding pipeline; the tunnel
//! engine only reads and writes the subset of fields shown here. The
//! wildcard mirror records which fields a lookup depended on so the
//! pipeline can install a flow entry of the right specificity.

use crate::api::ETHER_TYPE_IPV4;
use crate::api::ETHER_TYPE_IPV6;
use crate::api::Ipv4Addr;
use crate::api::OdpPort;
use crate::api::TnlFlags;
use crate::api::TunnelKey;
use core::fmt;
use core::fmt::Display;

/// Outer-header (encapsulation) metadata carried alongside a flow.
///
/// On ingress these fields describe the encapsulation the packet
/// arrived with; on egress the engine fills them in to describe the
/// encapsulation to apply.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowTnl {
    pub tun_id: TunnelKey,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub flags: TnlFlags,
    pub ip_tos: u8,
    pub ip_ttl: u8,
}

impl FlowTnl {
    /// Mark every tunnel field as exact-matched.
    pub fn mask_all(&mut self) {
        self.tun_id = TunnelKey::new(u64::MAX);
        self.ip_src = Ipv4Addr::LOCAL_BCAST;
        self.ip_dst = Ipv4Addr::LOCAL_BCAST;
        self.flags = TnlFlags::all();
        self.ip_tos = 0xff;
        self.ip_ttl = 0xff;
    }
}

/// The subset of a flow's metadata the tunnel engine reads or writes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Flow {
    /// Encapsulating tunnel parameters.
    pub tunnel: FlowTnl,
    /// The datapath port the packet arrived on.
    pub in_port: OdpPort,
    /// Out-of-band packet annotation.
    pub pkt_mark: u32,
    /// Ethernet frame type of the inner packet.
    pub dl_type: u16,
    /// Inner IP ToS (DSCP and ECN bits).
    pub nw_tos: u8,
    /// Inner IP TTL / hop limit.
    pub nw_ttl: u8,
}

impl Flow {
    pub fn is_ip_any(&self) -> bool {
        matches!(self.dl_type, ETHER_TYPE_IPV4 | ETHER_TYPE_IPV6)
    }
}

impl Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tunnel(tun_id={},src={},dst={},tos={:#x},ttl={},flags={:?}),\
             in_port={},pkt_mark={},nw_tos={:#x},nw_ttl={}",
            self.tunnel.tun_id,
            self.tunnel.ip_src,
            self.tunnel.ip_dst,
            self.tunnel.ip_tos,
            self.tunnel.ip_ttl,
            self.tunnel.flags,
            self.in_port,
            self.pkt_mark,
            self.nw_tos,
            self.nw_ttl,
        )
    }
}

/// Mask mirror of [`Flow`]: a set bit means the corresponding flow
/// bit was consulted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowWildcards {
    pub tunnel: FlowTnl,
    pub pkt_mark: u32,
    pub nw_tos: u8,
    pub nw_ttl: u8,
}
