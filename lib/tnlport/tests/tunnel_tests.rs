// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the tunnel-port registry: lifecycle,
//! ingress matching, egress stamping, and the receive-side policy
//! checks, exercised together the way the forwarding pipeline uses
//! them.

use std::sync::Arc;
use tnlport::api::ETHER_TYPE_IPV4;
use tnlport::api::IP_ECN_CE;
use tnlport::api::IP_ECN_ECT_0;
use tnlport::api::Ipv4Addr;
use tnlport::api::OdpPort;
use tnlport::api::OfportHandle;
use tnlport::api::TnlFlags;
use tnlport::api::TunnelConfig;
use tnlport::api::TunnelKey;
use tnlport::engine::flow::Flow;
use tnlport::engine::flow::FlowWildcards;
use tnlport::engine::netdev::Netdev;
use tnlport::engine::tunnel::IPSEC_MARK;
use tnlport::engine::tunnel::TnlPortMap;
use tnlport::engine::tunnel::should_receive;
use tnlport::engine::tunnel::xlate_init;

const LOCAL: &str = "10.0.0.2";
const REMOTE: &str = "10.0.0.1";

fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn gre_cfg(src: &str, dst: &str, key: u64) -> TunnelConfig {
    TunnelConfig {
        in_key_present: key != 0,
        in_key: TunnelKey::new(key),
        out_key_present: key != 0,
        out_key: TunnelKey::new(key),
        ip_src: addr(src),
        ip_dst: addr(dst),
        ttl: 64,
        dont_fragment: true,
        ..TunnelConfig::default()
    }
}

fn inbound(src: &str, dst: &str, key: u64, in_port: u32) -> Flow {
    let mut flow = Flow::default();
    flow.tunnel.tun_id = TunnelKey::new(key);
    flow.tunnel.ip_src = addr(src);
    flow.tunnel.ip_dst = addr(dst);
    flow.in_port = OdpPort::new(in_port);
    flow
}

#[test]
fn exact_match_receive() {
    let map = TnlPortMap::new();
    let dev = Netdev::open("gre0", "gre", Some(gre_cfg(LOCAL, REMOTE, 5)))
        .unwrap();
    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));

    let flow = inbound(REMOTE, LOCAL, 5, 3);
    assert!(should_receive(&flow));
    assert_eq!(map.receive(&flow), Some(OfportHandle::new(1)));

    // Wrong key, wrong remote, wrong dp port: all miss.
    assert_eq!(map.receive(&inbound(REMOTE, LOCAL, 6, 3)), None);
    assert_eq!(map.receive(&inbound("10.0.0.9", LOCAL, 5, 3)), None);
    assert_eq!(map.receive(&inbound(REMOTE, LOCAL, 5, 4)), None);
}

#[test]
fn remote_only_fallback() {
    let map = TnlPortMap::new();
    let cfg = TunnelConfig {
        in_key_flow: true,
        ip_dst: addr(REMOTE),
        ttl: 64,
        ..TunnelConfig::default()
    };
    let dev = Netdev::open("gre0", "gre", Some(cfg)).unwrap();
    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));

    // No configured local address or key: any local address and any
    // key from this remote match.
    assert_eq!(
        map.receive(&inbound(REMOTE, LOCAL, 5, 3)),
        Some(OfportHandle::new(1)),
    );
    assert_eq!(
        map.receive(&inbound(REMOTE, "10.0.0.3", 99, 3)),
        Some(OfportHandle::new(1)),
    );
    assert_eq!(map.receive(&inbound("10.0.0.9", LOCAL, 5, 3)), None);
}

#[test]
fn local_wildcard_with_concrete_key() {
    let map = TnlPortMap::new();
    // Concrete remote and key, no local address configured.
    let cfg = TunnelConfig {
        in_key_present: true,
        in_key: TunnelKey::new(5),
        ip_dst: addr(REMOTE),
        ttl: 64,
        ..TunnelConfig::default()
    };
    let dev = Netdev::open("gre0", "gre", Some(cfg)).unwrap();
    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));

    // Any local address works, as long as remote and key agree.
    assert_eq!(
        map.receive(&inbound(REMOTE, LOCAL, 5, 3)),
        Some(OfportHandle::new(1)),
    );
    assert_eq!(
        map.receive(&inbound(REMOTE, "10.0.0.7", 5, 3)),
        Some(OfportHandle::new(1)),
    );

    // The key is concrete, so a different key misses every tier.
    assert_eq!(map.receive(&inbound(REMOTE, LOCAL, 6, 3)), None);
    assert_eq!(map.receive(&inbound("10.0.0.9", LOCAL, 5, 3)), None);
}

#[test]
fn flow_key_with_concrete_local() {
    let map = TnlPortMap::new();
    // Concrete address pair, key read per-packet from the flow.
    let cfg = TunnelConfig {
        in_key_flow: true,
        ip_src: addr(LOCAL),
        ip_dst: addr(REMOTE),
        ttl: 64,
        ..TunnelConfig::default()
    };
    let dev = Netdev::open("gre0", "gre", Some(cfg)).unwrap();
    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));

    // Any key works; the address pair still matches exactly.
    assert_eq!(
        map.receive(&inbound(REMOTE, LOCAL, 42, 3)),
        Some(OfportHandle::new(1)),
    );
    assert_eq!(
        map.receive(&inbound(REMOTE, LOCAL, 0, 3)),
        Some(OfportHandle::new(1)),
    );
    assert_eq!(map.receive(&inbound(REMOTE, "10.0.0.8", 42, 3)), None);
    assert_eq!(map.receive(&inbound("10.0.0.9", LOCAL, 42, 3)), None);
}

#[test]
fn fully_flow_based_port() {
    let map = TnlPortMap::new();
    // Everything flow-derived, both addresses included.
    let cfg = TunnelConfig {
        in_key_flow: true,
        ip_src_flow: true,
        ip_dst_flow: true,
        ..TunnelConfig::default()
    };
    let dev = Netdev::open("gre0", "gre", Some(cfg)).unwrap();
    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));

    // The last fallback: only the datapath port and mark pin it down.
    assert_eq!(
        map.receive(&inbound(REMOTE, LOCAL, 5, 3)),
        Some(OfportHandle::new(1)),
    );
    assert_eq!(
        map.receive(&inbound("172.16.0.8", "192.168.1.1", 0, 3)),
        Some(OfportHandle::new(1)),
    );
    assert_eq!(map.receive(&inbound(REMOTE, LOCAL, 5, 4)), None);
}

#[test]
fn most_specific_port_wins() {
    let map = TnlPortMap::new();
    let exact =
        Netdev::open("gre0", "gre", Some(gre_cfg(LOCAL, REMOTE, 5))).unwrap();
    let loose = Netdev::open(
        "gre1",
        "gre",
        Some(TunnelConfig {
            in_key_flow: true,
            ip_dst: addr(REMOTE),
            ..TunnelConfig::default()
        }),
    )
    .unwrap();

    assert!(map.add(OfportHandle::new(1), &exact, OdpPort::new(3)));
    assert!(map.add(OfportHandle::new(2), &loose, OdpPort::new(3)));

    // The fully specified flow hits the exact port even though the
    // loose port would also accept it.
    assert_eq!(
        map.receive(&inbound(REMOTE, LOCAL, 5, 3)),
        Some(OfportHandle::new(1)),
    );

    // A different key falls past the exact port to the loose one.
    assert_eq!(
        map.receive(&inbound(REMOTE, LOCAL, 6, 3)),
        Some(OfportHandle::new(2)),
    );
}

#[test]
fn flow_based_remote_fallback() {
    let map = TnlPortMap::new();
    let cfg = TunnelConfig {
        in_key_flow: true,
        ip_dst_flow: true,
        ..TunnelConfig::default()
    };
    let dev = Netdev::open("gre0", "gre", Some(cfg)).unwrap();
    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));

    // A fully flow-based port accepts any address pair and key on its
    // datapath port.
    assert_eq!(
        map.receive(&inbound("172.16.0.8", LOCAL, 42, 3)),
        Some(OfportHandle::new(1)),
    );
    assert_eq!(
        map.receive(&inbound("172.16.0.8", "10.9.9.9", 0, 3)),
        Some(OfportHandle::new(1)),
    );

    // The datapath port and packet mark still match exactly.
    assert_eq!(map.receive(&inbound("172.16.0.8", LOCAL, 42, 4)), None);
    let mut marked = inbound("172.16.0.8", LOCAL, 42, 3);
    marked.pkt_mark = 5;
    assert_eq!(map.receive(&marked), None);
}

#[test]
fn send_stamps_outer_header() {
    let map = TnlPortMap::new();
    let dev = Netdev::open("gre0", "gre", Some(gre_cfg(LOCAL, REMOTE, 5)))
        .unwrap();
    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));

    let mut flow = Flow { dl_type: ETHER_TYPE_IPV4, ..Flow::default() };
    let mut wc = FlowWildcards::default();

    let odp = map.send(OfportHandle::new(1), &mut flow, &mut wc);
    assert_eq!(odp, Some(OdpPort::new(3)));
    assert_eq!(flow.tunnel.ip_src, addr(LOCAL));
    assert_eq!(flow.tunnel.ip_dst, addr(REMOTE));
    assert_eq!(flow.tunnel.tun_id, TunnelKey::new(5));
    assert_eq!(flow.tunnel.ip_ttl, 64);
    assert_eq!(
        flow.tunnel.flags,
        TnlFlags::DONT_FRAGMENT | TnlFlags::KEY,
    );

    // Unregistered logical ports produce no output.
    assert_eq!(
        map.send(OfportHandle::new(9), &mut flow, &mut wc),
        None,
    );
}

#[test]
fn send_inherits_ttl_and_tos() {
    let map = TnlPortMap::new();
    let cfg = TunnelConfig {
        ttl_inherit: true,
        tos_inherit: true,
        ip_src: addr(LOCAL),
        ip_dst: addr(REMOTE),
        ..TunnelConfig::default()
    };
    let dev = Netdev::open("gre0", "gre", Some(cfg)).unwrap();
    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));

    let mut flow = Flow {
        dl_type: ETHER_TYPE_IPV4,
        nw_ttl: 17,
        // DSCP 0xb8 with ECT(0) set.
        nw_tos: 0xb8 | IP_ECN_ECT_0,
        ..Flow::default()
    };
    let mut wc = FlowWildcards::default();

    map.send(OfportHandle::new(1), &mut flow, &mut wc).unwrap();
    assert_eq!(flow.tunnel.ip_ttl, 17);
    assert_eq!(flow.tunnel.ip_tos, 0xb8 | IP_ECN_ECT_0);
    // The lookup consulted the inner TTL and ToS.
    assert_eq!(wc.nw_ttl, 0xff);
    assert_eq!(wc.nw_tos, 0xff);
}

#[test]
fn send_remaps_inner_ce() {
    let map = TnlPortMap::new();
    let dev = Netdev::open("gre0", "gre", Some(gre_cfg(LOCAL, REMOTE, 0)))
        .unwrap();
    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));

    // An inner packet already marked CE must not put CE on the outer
    // header; it is sent as ECT(0) instead.
    let mut flow = Flow {
        dl_type: ETHER_TYPE_IPV4,
        nw_tos: IP_ECN_CE,
        ..Flow::default()
    };
    let mut wc = FlowWildcards::default();

    map.send(OfportHandle::new(1), &mut flow, &mut wc).unwrap();
    assert_eq!(flow.tunnel.ip_tos, IP_ECN_ECT_0);
}

#[test]
fn round_trip() {
    let map = TnlPortMap::new();
    let dev = Netdev::open("gre0", "gre", Some(gre_cfg(LOCAL, REMOTE, 5)))
        .unwrap();
    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));

    let mut out = Flow { dl_type: ETHER_TYPE_IPV4, ..Flow::default() };
    let mut wc = FlowWildcards::default();
    let odp = map.send(OfportHandle::new(1), &mut out, &mut wc).unwrap();

    // Model the reply arriving: outer addresses swap, same key, and
    // the packet shows up on the datapath port we sent from.
    let mut back = Flow::default();
    back.tunnel.tun_id = out.tunnel.tun_id;
    back.tunnel.ip_src = out.tunnel.ip_dst;
    back.tunnel.ip_dst = out.tunnel.ip_src;
    back.in_port = odp;

    assert!(should_receive(&back));
    assert_eq!(map.receive(&back), Some(OfportHandle::new(1)));
}

#[test]
fn reconfigure_lifecycle() {
    let map = TnlPortMap::new();
    let dev = Netdev::open("gre0", "gre", Some(gre_cfg(LOCAL, REMOTE, 5)))
        .unwrap();
    let of = OfportHandle::new(1);

    // First call registers the port.
    assert!(map.reconfigure(of, &dev, OdpPort::new(3)));
    let count = Arc::strong_count(&dev);

    // Nothing changed: no work, no extra references.
    assert!(!map.reconfigure(of, &dev, OdpPort::new(3)));
    assert_eq!(Arc::strong_count(&dev), count);

    // A config change is detected through the netdev's change
    // sequence and re-registers the port under its new match.
    dev.set_tunnel_config(gre_cfg(LOCAL, REMOTE, 7));
    assert!(map.reconfigure(of, &dev, OdpPort::new(3)));
    assert_eq!(map.receive(&inbound(REMOTE, LOCAL, 7, 3)), Some(of));
    assert_eq!(map.receive(&inbound(REMOTE, LOCAL, 5, 3)), None);

    // So is a datapath port renumbering.
    assert!(map.reconfigure(of, &dev, OdpPort::new(8)));
    assert_eq!(map.receive(&inbound(REMOTE, LOCAL, 7, 8)), Some(of));
}

#[test]
fn remove_releases_netdev() {
    let map = TnlPortMap::new();
    let dev = Netdev::open("gre0", "gre", Some(gre_cfg(LOCAL, REMOTE, 5)))
        .unwrap();
    assert_eq!(Arc::strong_count(&dev), 1);

    assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));
    assert_eq!(Arc::strong_count(&dev), 2);

    map.remove(OfportHandle::new(1));
    assert_eq!(Arc::strong_count(&dev), 1);
    assert_eq!(map.receive(&inbound(REMOTE, LOCAL, 5, 3)), None);
}

#[test]
fn xlate_init_polices_ecn() {
    // Tunneled, outer CE, inner not ECN capable: drop.
    let mut flow = inbound(REMOTE, LOCAL, 5, 3);
    flow.dl_type = ETHER_TYPE_IPV4;
    flow.tunnel.ip_tos = IP_ECN_CE;
    let base = flow;
    let mut wc = FlowWildcards::default();
    assert!(!xlate_init(&base, &mut flow, &mut wc));

    // Inner ECT(0): the CE mark propagates inward instead.
    let mut flow = inbound(REMOTE, LOCAL, 5, 3);
    flow.dl_type = ETHER_TYPE_IPV4;
    flow.tunnel.ip_tos = IP_ECN_CE;
    flow.nw_tos = IP_ECN_ECT_0;
    let base = flow;
    let mut wc = FlowWildcards::default();
    assert!(xlate_init(&base, &mut flow, &mut wc));
    assert_eq!(flow.nw_tos & IP_ECN_CE, IP_ECN_CE);

    // Reception depends on the whole tunnel header and the mark.
    assert_eq!(u64::from(wc.tunnel.tun_id), u64::MAX);
    assert_eq!(wc.pkt_mark, !0);
}

#[test]
fn xlate_init_clears_ipsec_mark() {
    let mut flow = inbound(REMOTE, LOCAL, 5, 3);
    flow.pkt_mark = IPSEC_MARK | 0x10;
    let base = flow;
    let mut wc = FlowWildcards::default();

    assert!(xlate_init(&base, &mut flow, &mut wc));
    assert_eq!(flow.pkt_mark, 0x10);
}

#[test]
fn xlate_init_skips_untunneled_traffic() {
    let mut flow = Flow { pkt_mark: IPSEC_MARK, ..Flow::default() };
    let base = flow;
    let mut wc = FlowWildcards::default();

    assert!(!should_receive(&flow));
    assert!(xlate_init(&base, &mut flow, &mut wc));
    // Untouched: no wildcards recorded, mark kept.
    assert_eq!(wc, FlowWildcards::default());
    assert_eq!(flow.pkt_mark, IPSEC_MARK);
}

#[test]
fn dump_is_sorted_by_dp_port() {
    let map = TnlPortMap::new();
    let a = Netdev::open("gre0", "gre", Some(gre_cfg(LOCAL, REMOTE, 5)))
        .unwrap();
    let b = Netdev::open("vxlan0", "vxlan", Some(gre_cfg(LOCAL, "10.0.0.3", 9)))
        .unwrap();

    assert!(map.add(OfportHandle::new(1), &a, OdpPort::new(12)));
    assert!(map.add(OfportHandle::new(2), &b, OdpPort::new(3)));

    let resp = map.dump();
    assert_eq!(resp.ports.len(), 2);
    assert_eq!(resp.ports[0].odp_port, 3);
    assert_eq!(resp.ports[0].name, "vxlan0");
    assert_eq!(resp.ports[1].odp_port, 12);
    assert_eq!(resp.ports[1].kind, "gre");
}

#[test]
fn readers_race_writer() {
    let _ = tracing_subscriber::fmt::try_init();

    let map = Arc::new(TnlPortMap::new());
    let dev = Netdev::open("gre0", "gre", Some(gre_cfg(LOCAL, REMOTE, 5)))
        .unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = Arc::clone(&map);
            std::thread::spawn(move || {
                let flow = inbound(REMOTE, LOCAL, 5, 3);
                let mut hits = 0usize;
                for _ in 0..1000 {
                    if map.receive(&flow).is_some() {
                        hits += 1;
                    }
                }
                hits
            })
        })
        .collect();

    for _ in 0..100 {
        assert!(map.add(OfportHandle::new(1), &dev, OdpPort::new(3)));
        map.remove(OfportHandle::new(1));
    }

    // Readers either hit or miss per iteration; they never observe a
    // torn registry.
    for r in readers {
        r.join().unwrap();
    }
    map.with_read(|maps| assert!(maps.is_empty()));
    assert_eq!(Arc::strong_count(&dev), 1);
}
