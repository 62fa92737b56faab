// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The network-device abstraction consumed by the tunnel engine.
//!
//! The engine only cares about a handful of netdev properties: its
//! name and kind, its tunnel configuration, and a change-sequence
//! counter that ticks every time that configuration is replaced.
//! Shared ownership is expressed with [`Arc`]; a registered tunnel
//! port holds exactly one clone for its lifetime.

use crate::api::TunnelConfig;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use thiserror::Error;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum NetdevError {
    #[error("unknown netdev kind '{0}'")]
    UnknownKind(String),

    #[error("{0}: tunnel config supplied for a non-tunnel netdev")]
    NotATunnel(String),

    #[error("{0}: tunnel netdev requires a tunnel config")]
    MissingTunnelConfig(String),
}

/// The kind of device backing a port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetdevKind {
    /// An ordinary system NIC.
    System,
    /// A switch-internal port.
    Internal,
    Gre,
    Vxlan,
    Lisp,
}

impl NetdevKind {
    pub fn is_tunnel(&self) -> bool {
        matches!(self, Self::Gre | Self::Vxlan | Self::Lisp)
    }
}

impl FromStr for NetdevKind {
    type Err = NetdevError;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        match val {
            "system" => Ok(Self::System),
            "internal" => Ok(Self::Internal),
            "gre" => Ok(Self::Gre),
            "vxlan" => Ok(Self::Vxlan),
            "lisp" => Ok(Self::Lisp),
            _ => Err(NetdevError::UnknownKind(val.to_string())),
        }
    }
}

impl Display for NetdevKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self {
            Self::System => "system",
            Self::Internal => "internal",
            Self::Gre => "gre",
            Self::Vxlan => "vxlan",
            Self::Lisp => "lisp",
        };

        write!(f, "{kind}")
    }
}

/// A network device.
///
/// The tunnel configuration is replaced wholesale, never mutated in
/// place; every replacement ticks the change-sequence counter so that
/// reconfiguration can detect drift against the snapshot a tunnel
/// port took at registration time.
#[derive(Debug)]
pub struct Netdev {
    name: String,
    kind: NetdevKind,
    tnl_cfg: Mutex<Option<TunnelConfig>>,
    change_seq: AtomicU64,
}

impl Netdev {
    pub fn open(
        name: &str,
        kind: &str,
        tnl_cfg: Option<TunnelConfig>,
    ) -> Result<Arc<Self>, NetdevError> {
        let kind = kind.parse::<NetdevKind>()?;

        if kind.is_tunnel() && tnl_cfg.is_none() {
            return Err(NetdevError::MissingTunnelConfig(name.to_string()));
        }

        if !kind.is_tunnel() && tnl_cfg.is_some() {
            return Err(NetdevError::NotATunnel(name.to_string()));
        }

        Ok(Arc::new(Self {
            name: name.to_string(),
            kind,
            tnl_cfg: Mutex::new(tnl_cfg),
            change_seq: AtomicU64::new(1),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NetdevKind {
        self.kind
    }

    /// Return a copy of the device's tunnel configuration, or `None`
    /// if this is not a tunnel device.
    pub fn tunnel_config(&self) -> Option<TunnelConfig> {
        *self.tnl_cfg.lock().unwrap()
    }

    /// Replace the tunnel configuration, ticking the change sequence.
    pub fn set_tunnel_config(&self, cfg: TunnelConfig) {
        *self.tnl_cfg.lock().unwrap() = Some(cfg);
        self.change_seq.fetch_add(1, Relaxed);
    }

    pub fn change_seq(&self) -> u64 {
        self.change_seq.load(Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_rejects_unknown_kind() {
        let err = Netdev::open("eth7", "carrier-pigeon", None).unwrap_err();
        assert_eq!(err, NetdevError::UnknownKind("carrier-pigeon".to_string()));
    }

    #[test]
    fn open_requires_matching_config() {
        assert_eq!(
            Netdev::open("gre0", "gre", None).unwrap_err(),
            NetdevError::MissingTunnelConfig("gre0".to_string()),
        );

        assert_eq!(
            Netdev::open("eth0", "system", Some(TunnelConfig::default()))
                .unwrap_err(),
            NetdevError::NotATunnel("eth0".to_string()),
        );
    }

    #[test]
    fn config_change_ticks_seq() {
        let dev =
            Netdev::open("gre0", "gre", Some(TunnelConfig::default())).unwrap();
        let before = dev.change_seq();
        dev.set_tunnel_config(TunnelConfig {
            ttl: 42,
            ..TunnelConfig::default()
        });
        assert_eq!(dev.change_seq(), before + 1);
        assert_eq!(dev.tunnel_config().unwrap().ttl, 42);
    }
}
