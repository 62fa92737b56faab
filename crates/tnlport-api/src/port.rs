// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// A datapath port number: the identifier the forwarding fast path
/// uses to refer to a physical or virtual NIC.
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
pub struct OdpPort(u32);

impl OdpPort {
    pub const fn new(port: u32) -> Self {
        Self(port)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl From<u32> for OdpPort {
    fn from(port: u32) -> Self {
        Self(port)
    }
}

impl From<OdpPort> for u32 {
    fn from(port: OdpPort) -> u32 {
        port.0
    }
}

impl Display for OdpPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The opaque identity of a logical (OpenFlow-facing) switch port.
///
/// The engine never looks inside this value; it is a lookup key,
/// compared and hashed by identity, and handed back verbatim to the
/// pipeline on an ingress match.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(transparent)]
pub struct OfportHandle(u64);

impl OfportHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl Display for OfportHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ofport {}", self.0)
    }
}
