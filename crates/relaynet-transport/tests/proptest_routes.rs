//! Property-based tests for the route table and peer registry.
//!
//! Arbitrary add/delete sequences must keep routes unique per gateway and
//! keep each gateway's route count in step with its router reference.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use relaynet_transport::{NetId, NetKind, Nid, PeerRegistry, RouteTable};

#[derive(Debug, Clone)]
enum Op {
    Add { net: u16, hops: u32, gw: u32 },
    Del { net: Option<u16>, gw: Option<u32> },
}

fn local() -> NetId {
    NetId::new(NetKind::Tcp, 0)
}

fn remote(num: u16) -> NetId {
    NetId::new(NetKind::Tcp, num)
}

fn gateway(addr: u32) -> Nid {
    Nid::new(local(), addr)
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u16..5, 1u32..4, 1u32..6).prop_map(|(net, hops, gw)| Op::Add { net, hops, gw }),
        1 => (proptest::option::of(1u16..5), proptest::option::of(1u32..6))
            .prop_map(|(net, gw)| Op::Del { net, gw }),
    ]
}

fn apply(table: &mut RouteTable, peers: &mut PeerRegistry, op: &Op) {
    match *op {
        Op::Add { net, hops, gw } => {
            table
                .add_route(peers, &[local()], remote(net), hops, gateway(gw))
                .unwrap();
        }
        Op::Del { net, gw } => {
            let net = net.map_or(NetId::ANY, remote);
            let gw = gw.map_or(Nid::ANY, gateway);
            let _ = table.del_route(peers, net, gw);
        }
    }
}

proptest! {
    /// Test: (net, gateway) pairs are unique and every gateway's
    /// rtr_refcount equals the routes through it.
    #[test]
    fn test_routes_unique_and_refcounted(
        seed in any::<u64>(),
        ops in proptest::collection::vec(any_op(), 1..60),
    ) {
        let mut table = RouteTable::new(seed);
        let mut peers = PeerRegistry::new(false);

        for op in &ops {
            apply(&mut table, &mut peers, op);

            let routes = table.routes();
            let pairs: HashSet<_> = routes.iter().map(|r| (r.net, r.gateway)).collect();
            prop_assert_eq!(pairs.len(), routes.len());
            prop_assert_eq!(table.len(), routes.len());

            let mut per_gw: HashMap<Nid, u32> = HashMap::new();
            for r in &routes {
                *per_gw.entry(r.gateway).or_default() += 1;
            }
            for (gw, count) in &per_gw {
                let peer = peers.find(*gw);
                prop_assert!(peer.is_some());
                prop_assert_eq!(peer.map(|p| p.rtr_refcount), Some(*count));
            }

            let routers: HashSet<Nid> = peers.routers().iter().copied().collect();
            let expected: HashSet<Nid> = per_gw.keys().copied().collect();
            prop_assert_eq!(routers, expected);
        }
    }

    /// Test: deleting everything leaves no routes, routers or peers.
    #[test]
    fn test_destroy_releases_all_peers(
        seed in any::<u64>(),
        ops in proptest::collection::vec(any_op(), 1..40),
    ) {
        let mut table = RouteTable::new(seed);
        let mut peers = PeerRegistry::new(false);
        for op in &ops {
            apply(&mut table, &mut peers, op);
        }

        table.destroy_routes(&mut peers);
        prop_assert!(table.is_empty());
        prop_assert!(peers.routers().is_empty());
        prop_assert!(peers.is_empty());
    }

    /// Test: a live gateway is always selected when one exists, preferring
    /// the fewest hops.
    #[test]
    fn test_select_gateway_prefers_fewest_hops(
        seed in any::<u64>(),
        hops in proptest::collection::vec(1u32..10, 1..6),
    ) {
        let mut table = RouteTable::new(seed);
        let mut peers = PeerRegistry::new(false);
        for (i, h) in hops.iter().enumerate() {
            table
                .add_route(&mut peers, &[local()], remote(1), *h, gateway(i as u32 + 1))
                .unwrap();
        }

        let chosen = table.select_gateway(&peers, remote(1));
        prop_assert!(chosen.is_some());
        let chosen_hops = table
            .routes_to(remote(1))
            .iter()
            .find(|r| Some(r.gateway) == chosen)
            .map(|r| r.hops);
        prop_assert_eq!(chosen_hops, hops.iter().copied().min());
    }
}
