// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunnel port emulation.
//!
//! Logical tunnel ports are emulated from the outer-header metadata
//! the datapath hands up with each packet. [`TnlPortMap`] keeps the
//! registered ports in two indexes under one reader-writer lock: one
//! keyed by logical-port identity (egress and lifecycle lookups), one
//! keyed by the match key's content (ingress lookups). A single
//! control-plane thread performs add/reconfigure/remove; any number
//! of forwarding threads call [`TnlPortMap::receive`] and
//! [`TnlPortMap::send`] concurrently.

use crate::api::IP_DSCP_MASK;
use crate::api::IP_ECN_CE;
use crate::api::IP_ECN_ECT_0;
use crate::api::IP_ECN_MASK;
use crate::api::IP_ECN_NOT_ECT;
use crate::api::Ipv4Addr;
use crate::api::ListTnlPortsResp;
use crate::api::OdpPort;
use crate::api::OfportHandle;
use crate::api::TnlFlags;
use crate::api::TnlPortDump;
use crate::api::TunnelConfig;
use crate::api::TunnelKey;
use crate::engine::flow::Flow;
use crate::engine::flow::FlowWildcards;
use crate::engine::netdev::Netdev;
use crate::engine::ratelimit::RateLimit;
use core::fmt;
use core::fmt::Display;
use core::hash::BuildHasher;
use core::hash::Hash;
use core::hash::Hasher;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use tracing::Level;
use tracing::debug;
use tracing::enabled;
use tracing::info;
use tracing::warn;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// Packet mark reserved for secure (IPsec) tunnel traffic.
pub const IPSEC_MARK: u32 = 1;

static ECN_RL: RateLimit = RateLimit::new(1, 5);

/// The outer-header identity of a tunnel endpoint.
///
/// The struct is a fixed-layout aggregate with explicit trailing
/// padding, so it can be hashed and compared as its raw bytes; the
/// padding must always be zero.
#[derive(Clone, Copy, Debug, Default, Immutable, IntoBytes)]
#[repr(C)]
pub struct TnlMatch {
    pub in_key: TunnelKey,
    /// The local (our side) outer address; zero is a wildcard.
    pub ip_src: Ipv4Addr,
    /// The remote outer address; zero is a wildcard.
    pub ip_dst: Ipv4Addr,
    pub odp_port: OdpPort,
    pub pkt_mark: u32,
    pub in_key_flow: bool,
    pub ip_src_flow: bool,
    pub ip_dst_flow: bool,
    _pad: [u8; 5],
}

const _: () = assert!(core::mem::size_of::<TnlMatch>() == 32);

impl TnlMatch {
    /// Build the match key a netdev's tunnel configuration registers
    /// under.
    pub fn from_config(cfg: &TunnelConfig, odp_port: OdpPort) -> Self {
        Self {
            in_key: cfg.in_key,
            ip_src: cfg.ip_src,
            ip_dst: cfg.ip_dst,
            odp_port,
            pkt_mark: if cfg.ipsec { IPSEC_MARK } else { 0 },
            in_key_flow: cfg.in_key_flow,
            ip_src_flow: cfg.ip_src_flow,
            ip_dst_flow: cfg.ip_dst_flow,
            _pad: [0; 5],
        }
    }

    /// Build the most specific candidate key for an inbound flow. The
    /// packet's outer source is the tunnel's remote endpoint and vice
    /// versa, so the addresses swap.
    pub fn from_inbound(flow: &Flow) -> Self {
        Self {
            in_key: flow.tunnel.tun_id,
            ip_src: flow.tunnel.ip_dst,
            ip_dst: flow.tunnel.ip_src,
            odp_port: flow.in_port,
            pkt_mark: flow.pkt_mark,
            ..Self::default()
        }
    }

    /// Whole-struct content hash; the same value the match index
    /// hashes entries under.
    pub fn crc32(&self) -> u32 {
        crc32fast::hash(self.as_bytes())
    }
}

impl PartialEq for TnlMatch {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for TnlMatch {}

impl Hash for TnlMatch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(self.as_bytes());
    }
}

impl Display for TnlMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.ip_dst_flow {
            write!(f, "{}->{}", self.ip_src, self.ip_dst)?;
        } else if !self.ip_src_flow {
            write!(f, "{}->flow", self.ip_src)?;
        } else {
            write!(f, "flow->flow")?;
        }

        if self.in_key_flow {
            write!(f, ", key=flow")?;
        } else {
            write!(f, ", key={}", self.in_key)?;
        }

        write!(f, ", dp port={}", self.odp_port)?;
        write!(f, ", pkt mark={}", self.pkt_mark)
    }
}

/// A registered tunnel port: the binding of a logical port to a match
/// key and the netdev backing it.
///
/// Entries are never modified in place; reconfiguration replaces the
/// whole entry. Each entry owns one [`Arc`] clone of its netdev,
/// dropped when the entry is removed.
#[derive(Debug)]
pub struct TnlPort {
    ofport: OfportHandle,
    netdev: Arc<Netdev>,
    netdev_seq: u64,
    match_key: TnlMatch,
}

impl TnlPort {
    pub fn ofport(&self) -> OfportHandle {
        self.ofport
    }

    pub fn match_key(&self) -> &TnlMatch {
        &self.match_key
    }

    pub fn netdev(&self) -> &Arc<Netdev> {
        &self.netdev
    }

    pub fn netdev_seq(&self) -> u64 {
        self.netdev_seq
    }

    pub fn name(&self) -> &str {
        self.netdev.name()
    }
}

impl Display for TnlPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "port {}: {} ({}: {}",
            self.match_key.odp_port,
            self.name(),
            self.netdev.kind(),
            self.match_key,
        )?;

        if let Some(cfg) = self.netdev.tunnel_config() {
            if cfg.out_key != cfg.in_key
                || cfg.out_key_present != cfg.in_key_present
                || cfg.out_key_flow != cfg.in_key_flow
            {
                f.write_str(", out_key=")?;
                if !cfg.out_key_present {
                    f.write_str("none")?;
                } else if cfg.out_key_flow {
                    f.write_str("flow")?;
                } else {
                    write!(f, "{}", cfg.out_key)?;
                }
            }

            if cfg.ttl_inherit {
                f.write_str(", ttl=inherit")?;
            } else {
                write!(f, ", ttl={}", cfg.ttl)?;
            }

            if cfg.tos_inherit {
                f.write_str(", tos=inherit")?;
            } else if cfg.tos != 0 {
                write!(f, ", tos={:#x}", cfg.tos)?;
            }

            if !cfg.dont_fragment {
                f.write_str(", df=false")?;
            }

            if cfg.csum {
                f.write_str(", csum=true")?;
            }
        }

        f.write_str(")")
    }
}

/// Hash state for the match index. Match keys hash by content, crc32
/// over the raw struct bytes; the keys are config-derived, not
/// attacker-controlled, so a keyed hash buys nothing here.
#[derive(Clone, Debug, Default)]
struct TnlMatchState;

impl BuildHasher for TnlMatchState {
    type Hasher = crc32fast::Hasher;

    fn build_hasher(&self) -> crc32fast::Hasher {
        crc32fast::Hasher::new()
    }
}

/// The two indexes over the registered tunnel ports.
///
/// Every entry present in one index is present in exactly the other
/// at any point the registry lock is not held.
#[derive(Debug, Default)]
pub struct TnlMaps {
    by_ofport: HashMap<OfportHandle, Arc<TnlPort>>,
    by_match: HashMap<TnlMatch, Arc<TnlPort>, TnlMatchState>,
}

impl TnlMaps {
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.by_ofport.len(), self.by_match.len());
        self.by_ofport.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_ofport(&self, ofport: &OfportHandle) -> Option<&Arc<TnlPort>> {
        self.by_ofport.get(ofport)
    }

    pub fn find_exact(&self, m: &TnlMatch) -> Option<&Arc<TnlPort>> {
        self.by_match.get(m)
    }

    /// Tiered fallback lookup: probe the match index with successively
    /// more general candidate keys, most specific first. Wildcarding
    /// is simulated by constructing a different concrete key for each
    /// probe; the index itself only ever answers exact lookups.
    pub fn find(&self, m: &TnlMatch) -> Option<&Arc<TnlPort>> {
        let mut probe = *m;

        // remote_ip, local_ip, in_key
        if let Some(port) = self.find_exact(&probe) {
            return Some(port);
        }

        // remote_ip, in_key
        probe.ip_src = Ipv4Addr::ANY_ADDR;
        if let Some(port) = self.find_exact(&probe) {
            return Some(port);
        }
        probe.ip_src = m.ip_src;

        // remote_ip, local_ip
        probe.in_key = TunnelKey::ZERO;
        probe.in_key_flow = true;
        if let Some(port) = self.find_exact(&probe) {
            return Some(port);
        }

        // remote_ip
        probe.ip_src = Ipv4Addr::ANY_ADDR;
        if let Some(port) = self.find_exact(&probe) {
            return Some(port);
        }

        // Flow-based remote
        probe.ip_dst = Ipv4Addr::ANY_ADDR;
        probe.ip_dst_flow = true;
        if let Some(port) = self.find_exact(&probe) {
            return Some(port);
        }

        // Flow-based everything
        probe.ip_src_flow = true;
        self.find_exact(&probe)
    }
}

/// The tunnel-port registry.
///
/// Owned by the switch/datapath context that constructs it; shared by
/// reference (typically `Arc<TnlPortMap>`) between the reconciliation
/// thread and the forwarding threads.
#[derive(Debug)]
pub struct TnlPortMap {
    maps: RwLock<TnlMaps>,
    rl: RateLimit,
    dbg_rl: RateLimit,
}

impl Default for TnlPortMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TnlPortMap {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(TnlMaps::default()),
            rl: RateLimit::new(1, 5),
            dbg_rl: RateLimit::new(60, 60),
        }
    }

    /// Run `f` with shared access to the indexes. May run concurrently
    /// with other readers. `f` must not block on anything that could
    /// itself take this lock.
    pub fn with_read<T>(&self, f: impl FnOnce(&TnlMaps) -> T) -> T {
        // A poisoned lock means a writer panicked mid-update; the
        // two-index invariant cannot be trusted after that.
        let maps = self.maps.read().unwrap();
        f(&maps)
    }

    /// Run `f` with exclusive access to the indexes, excluding all
    /// readers and writers for the duration.
    pub fn with_write<T>(&self, f: impl FnOnce(&mut TnlMaps) -> T) -> T {
        let mut maps = self.maps.write().unwrap();
        f(&mut maps)
    }

    /// Register `ofport`, backed by `netdev`, with datapath port
    /// number `odp_port`. A port must be added before the ingress or
    /// egress paths can see it. Returns false (and warns) if another
    /// registered port already has an identical match key.
    pub fn add(
        &self,
        ofport: OfportHandle,
        netdev: &Arc<Netdev>,
        odp_port: OdpPort,
    ) -> bool {
        self.with_write(|maps| {
            Self::add_locked(maps, ofport, netdev, odp_port, true)
        })
    }

    fn add_locked(
        maps: &mut TnlMaps,
        ofport: OfportHandle,
        netdev: &Arc<Netdev>,
        odp_port: OdpPort,
        warn: bool,
    ) -> bool {
        let Some(cfg) = netdev.tunnel_config() else {
            debug_assert!(false, "{} is not a tunnel device", netdev.name());
            return false;
        };

        let match_key = TnlMatch::from_config(&cfg, odp_port);

        if let Some(existing) = maps.find_exact(&match_key) {
            if warn {
                warn!(
                    "{}: attempting to add tunnel port with same config \
                     as port '{}' ({})",
                    netdev.name(),
                    existing.name(),
                    match_key,
                );
            }
            return false;
        }

        let port = Arc::new(TnlPort {
            ofport,
            netdev: Arc::clone(netdev),
            netdev_seq: netdev.change_seq(),
            match_key,
        });

        maps.by_ofport.insert(ofport, Arc::clone(&port));
        maps.by_match.insert(match_key, Arc::clone(&port));
        mod_log(&port, "adding");
        true
    }

    /// Check whether `ofport` needs re-registration because its
    /// netdev, datapath port number, or tunnel configuration changed,
    /// and perform it if so. Returns true if anything changed. The
    /// whole decision runs in one write critical section, so no
    /// reader ever observes the port half-removed.
    pub fn reconfigure(
        &self,
        ofport: OfportHandle,
        netdev: &Arc<Netdev>,
        odp_port: OdpPort,
    ) -> bool {
        self.with_write(|maps| {
            let Some(port) = maps.find_ofport(&ofport) else {
                return Self::add_locked(maps, ofport, netdev, odp_port, false);
            };

            let stale = !Arc::ptr_eq(&port.netdev, netdev)
                || port.match_key.odp_port != odp_port
                || port.netdev_seq != netdev.change_seq();

            if !stale {
                return false;
            }

            debug!("reconfiguring {}", port.name());
            Self::del_locked(maps, ofport);
            Self::add_locked(maps, ofport, netdev, odp_port, true);
            true
        })
    }

    /// Unregister `ofport`. A no-op if it was never added.
    pub fn remove(&self, ofport: OfportHandle) {
        self.with_write(|maps| Self::del_locked(maps, ofport));
    }

    fn del_locked(maps: &mut TnlMaps, ofport: OfportHandle) {
        if let Some(port) = maps.by_ofport.remove(&ofport) {
            mod_log(&port, "removing");
            maps.by_match.remove(&port.match_key);
            // `port` was the last clone outside the indexes; dropping
            // it releases the entry's netdev reference.
        }
    }

    /// Look up the tunnel port an inbound flow's outer-header
    /// metadata belongs to, returning its logical port.
    ///
    /// Callers must have already established that `flow` looks like
    /// tunnel traffic via [`should_receive`].
    pub fn receive(&self, flow: &Flow) -> Option<OfportHandle> {
        let candidate = TnlMatch::from_inbound(flow);

        self.with_read(|maps| {
            let Some(port) = maps.find(&candidate) else {
                if !self.rl.should_drop() {
                    warn!("receive tunnel port not found ({candidate})");
                }
                return None;
            };

            if !self.dbg_rl.should_drop() {
                debug!("flow received\n{port}\n flow: {flow}");
            }

            Some(port.ofport)
        })
    }

    /// Given that `flow` should be output through `ofport`, stamp the
    /// outer-header fields onto it and return the datapath port the
    /// output must happen on. `None` means the output must not occur.
    pub fn send(
        &self,
        ofport: OfportHandle,
        flow: &mut Flow,
        wc: &mut FlowWildcards,
    ) -> Option<OdpPort> {
        self.with_read(|maps| {
            let port = maps.find_ofport(&ofport)?;

            let Some(cfg) = port.netdev.tunnel_config() else {
                debug_assert!(
                    false,
                    "{} lost its tunnel config",
                    port.name()
                );
                return None;
            };

            let pre_flow_str = if self.dbg_rl.should_drop() {
                None
            } else {
                Some(flow.to_string())
            };

            if !cfg.ip_src_flow {
                flow.tunnel.ip_src = port.match_key.ip_src;
            }
            if !cfg.ip_dst_flow {
                flow.tunnel.ip_dst = port.match_key.ip_dst;
            }
            flow.pkt_mark = port.match_key.pkt_mark;

            if !cfg.out_key_flow {
                flow.tunnel.tun_id = cfg.out_key;
            }

            if cfg.ttl_inherit && flow.is_ip_any() {
                wc.nw_ttl = 0xff;
                flow.tunnel.ip_ttl = flow.nw_ttl;
            } else {
                flow.tunnel.ip_ttl = cfg.ttl;
            }

            if cfg.tos_inherit && flow.is_ip_any() {
                wc.nw_tos = 0xff;
                flow.tunnel.ip_tos = flow.nw_tos & IP_DSCP_MASK;
            } else {
                flow.tunnel.ip_tos = cfg.tos;
            }

            // ECN bits are always taken from the inner packet.
            if flow.is_ip_any() {
                wc.nw_tos |= IP_ECN_MASK;
            }

            if flow.nw_tos & IP_ECN_MASK == IP_ECN_CE {
                flow.tunnel.ip_tos |= IP_ECN_ECT_0;
            } else {
                flow.tunnel.ip_tos |= flow.nw_tos & IP_ECN_MASK;
            }

            let mut flags = TnlFlags::empty();
            if cfg.dont_fragment {
                flags |= TnlFlags::DONT_FRAGMENT;
            }
            if cfg.csum {
                flags |= TnlFlags::CSUM;
            }
            if cfg.out_key_present {
                flags |= TnlFlags::KEY;
            }
            flow.tunnel.flags = flags;

            if let Some(pre) = pre_flow_str {
                debug!("flow sent\n{port}\n pre: {pre}\npost: {flow}");
            }

            Some(port.match_key.odp_port)
        })
    }

    /// Snapshot the registered ports for diagnostics.
    pub fn dump(&self) -> ListTnlPortsResp {
        self.with_read(|maps| {
            let mut ports: Vec<TnlPortDump> = maps
                .by_ofport
                .values()
                .map(|port| TnlPortDump {
                    ofport: port.ofport.raw(),
                    odp_port: port.match_key.odp_port.raw(),
                    name: port.name().to_string(),
                    kind: port.netdev.kind().to_string(),
                    match_key: port.match_key.to_string(),
                })
                .collect();
            ports.sort_by_key(|port| port.odp_port);
            ListTnlPortsResp { ports }
        })
    }
}

/// Returns true if `flow` should be submitted to
/// [`TnlPortMap::receive`].
pub fn should_receive(flow: &Flow) -> bool {
    !flow.tunnel.ip_dst.is_any()
}

/// Reject tunnel traffic marked Congestion-Experienced whose inner
/// packet is not ECN capable; otherwise propagate the CE mark into
/// the inner packet.
pub fn ecn_ok(base_flow: &Flow, flow: &mut Flow) -> bool {
    if base_flow.is_ip_any()
        && flow.tunnel.ip_tos & IP_ECN_MASK == IP_ECN_CE
    {
        if base_flow.nw_tos & IP_ECN_MASK == IP_ECN_NOT_ECT {
            if !ECN_RL.should_drop() {
                warn!(
                    "dropping tunnel packet marked ECN CE but is not \
                     ECN capable"
                );
            }
            return false;
        } else {
            flow.nw_tos |= IP_ECN_CE;
        }
    }

    true
}

/// Run at the start of action translation: record the wildcards that
/// tunnel reception depends on and apply the receive-side policy
/// checks. Returns false if the packet must be dropped.
pub fn xlate_init(
    base_flow: &Flow,
    flow: &mut Flow,
    wc: &mut FlowWildcards,
) -> bool {
    if should_receive(flow) {
        wc.tunnel.mask_all();
        wc.pkt_mark = !0;

        if !ecn_ok(base_flow, flow) {
            return false;
        }

        flow.pkt_mark &= !IPSEC_MARK;
    }

    true
}

fn mod_log(port: &TnlPort, action: &str) {
    if enabled!(Level::DEBUG) {
        info!(
            "{} tunnel port {} ({})",
            action,
            port.name(),
            port.match_key,
        );
    }
}
