// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::ip::Ipv4Addr;

/// A tunnel key: the per-tunnel virtual network identifier carried in
/// the outer header, used to multiplex independent tunnels over the
/// same address pair.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Immutable,
    IntoBytes,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(transparent)]
pub struct TunnelKey(u64);

impl TunnelKey {
    pub const ZERO: Self = Self(0);

    pub const fn new(key: u64) -> Self {
        Self(key)
    }
}

impl From<u64> for TunnelKey {
    fn from(key: u64) -> Self {
        Self(key)
    }
}

impl From<TunnelKey> for u64 {
    fn from(key: TunnelKey) -> u64 {
        key.0
    }
}

// Hex with the 0x prefix, except for zero, which prints bare. This is
// C's %#x, and the log format follows it.
impl Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "0")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

bitflags! {
    /// Outer-header flag bits stamped onto an encapsulated flow.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct TnlFlags: u16 {
        const DONT_FRAGMENT = 1 << 0;
        const CSUM = 1 << 1;
        const KEY = 1 << 2;
    }
}

/// The tunnel configuration of a netdev, as reported by the device
/// abstraction.
///
/// A field whose `*_flow` flag is set has no fixed configured value;
/// its concrete value is read per-packet from the flow being
/// processed.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct TunnelConfig {
    pub in_key_present: bool,
    pub in_key_flow: bool,
    pub in_key: TunnelKey,

    pub out_key_present: bool,
    pub out_key_flow: bool,
    pub out_key: TunnelKey,

    /// Transport destination port, for tunnel types that run over
    /// UDP. Zero means the type's default.
    pub dst_port: u16,

    pub ip_src_flow: bool,
    pub ip_dst_flow: bool,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,

    pub ttl: u8,
    pub ttl_inherit: bool,

    pub tos: u8,
    pub tos_inherit: bool,

    pub csum: bool,
    pub ipsec: bool,
    pub dont_fragment: bool,
}

/// One registered tunnel port, rendered for a state dump.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TnlPortDump {
    pub ofport: u64,
    pub odp_port: u32,
    pub name: String,
    pub kind: String,
    pub match_key: String,
}

/// Response to a request to list all registered tunnel ports.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ListTnlPortsResp {
    pub ports: Vec<TnlPortDump>,
}
