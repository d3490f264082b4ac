//! Remote network routes.
//!
//! A remote net is reached through one or more gateways. Each add puts
//! the new route at a random position in its net's list so that nodes
//! configured identically do not all favour the same gateway.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::nid::{NetId, Nid};
use crate::peer::PeerRegistry;

/// Most hops a route may declare.
pub const MAX_HOPS: u32 = 255;

/// One route to a remote net.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Destination net.
    pub net: NetId,
    /// Hop count through the gateway.
    pub hops: u32,
    /// Gateway NID.
    pub gateway: Nid,
    /// Interfaces the gateway reports down for this route.
    pub downis: u32,
}

/// Route as reported by [`RouteTable::get_route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    /// Destination net.
    pub net: NetId,
    /// Hop count.
    pub hops: u32,
    /// Gateway NID.
    pub gateway: Nid,
    /// Whether the gateway is currently believed alive.
    pub alive: bool,
}

#[derive(Debug)]
struct RemoteNet {
    net: NetId,
    routes: Vec<Route>,
}

/// Routes to remote nets, grouped per net.
pub struct RouteTable {
    nets: Vec<RemoteNet>,
    rng: StdRng,
    version: u64,
}

impl RouteTable {
    /// Empty table whose placement RNG is seeded once with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            nets: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            version: 0,
        }
    }

    /// Adds a route. Returns true if a new route was inserted.
    ///
    /// Routes to a local net and routes through an unreachable gateway
    /// are ignored, and so is a second route through the same gateway.
    pub fn add_route(
        &mut self,
        peers: &mut PeerRegistry,
        local_nets: &[NetId],
        net: NetId,
        hops: u32,
        gateway: Nid,
    ) -> TransportResult<bool> {
        let reject = |reason: &str| TransportError::InvalidRoute {
            net,
            hops,
            gateway,
            reason: reason.to_string(),
        };
        if gateway == Nid::ANY {
            return Err(reject("gateway is ANY"));
        }
        if gateway.is_loopback() {
            return Err(reject("gateway is loopback"));
        }
        if net.is_loopback() {
            return Err(reject("destination is loopback"));
        }
        if gateway.net() == net {
            return Err(reject("gateway is on the destination net"));
        }
        if !(1..=MAX_HOPS).contains(&hops) {
            return Err(reject("hops out of range"));
        }

        if local_nets.contains(&net) {
            debug!(net = %net, gateway = %gateway, "ignoring route to local net");
            return Ok(false);
        }

        match peers.find_or_create(gateway, local_nets) {
            Ok(_) => {}
            Err(TransportError::Unreachable(_)) => {
                warn!(net = %net, gateway = %gateway, "gateway not on a local net, ignoring route");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let idx = match self.nets.iter().position(|r| r.net == net) {
            Some(idx) => idx,
            None => {
                self.nets.push(RemoteNet {
                    net,
                    routes: Vec::new(),
                });
                self.nets.len() - 1
            }
        };
        let rnet = &mut self.nets[idx];

        if rnet.routes.iter().any(|r| r.gateway == gateway) {
            peers.decref(gateway);
            return Ok(false);
        }

        let at = self.rng.gen_range(0..=rnet.routes.len());
        rnet.routes.insert(
            at,
            Route {
                net,
                hops,
                gateway,
                downis: 0,
            },
        );
        if let Some(peer) = peers.find_mut(gateway) {
            peer.routes.push(net);
        }
        peers.rtr_addref(gateway);
        self.version += 1;

        info!(net = %net, hops, gateway = %gateway, position = at, "route added");
        Ok(true)
    }

    /// Removes every route matching `net` and `gateway` (either may be ANY).
    /// Returns the number removed, or `NotFound` when nothing matched.
    pub fn del_route(&mut self, peers: &mut PeerRegistry, net: NetId, gateway: Nid) -> TransportResult<usize> {
        let mut removed = 0;
        while let Some((i, j)) = self.find_match(net, gateway) {
            let route = self.nets[i].routes.remove(j);
            if self.nets[i].routes.is_empty() {
                self.nets.remove(i);
            }
            if let Some(peer) = peers.find_mut(route.gateway) {
                if let Some(pos) = peer.routes.iter().position(|&n| n == route.net) {
                    peer.routes.remove(pos);
                }
            }
            peers.rtr_decref(route.gateway);
            peers.decref(route.gateway);
            self.version += 1;
            removed += 1;
            info!(net = %route.net, gateway = %route.gateway, "route deleted");
        }

        if removed == 0 {
            return Err(TransportError::NotFound(format!("route to {} via {}", net, gateway)));
        }
        Ok(removed)
    }

    fn find_match(&self, net: NetId, gateway: Nid) -> Option<(usize, usize)> {
        self.nets.iter().enumerate().find_map(|(i, rnet)| {
            if net != NetId::ANY && rnet.net != net {
                return None;
            }
            rnet.routes
                .iter()
                .position(|r| gateway == Nid::ANY || r.gateway == gateway)
                .map(|j| (i, j))
        })
    }

    /// Removes all routes.
    pub fn destroy_routes(&mut self, peers: &mut PeerRegistry) {
        match self.del_route(peers, NetId::ANY, Nid::ANY) {
            Ok(n) => debug!(removed = n, "routes destroyed"),
            Err(_) => debug!("no routes to destroy"),
        }
    }

    /// The `idx`-th route in table order.
    pub fn get_route(&self, peers: &PeerRegistry, idx: usize) -> Option<RouteInfo> {
        self.nets
            .iter()
            .flat_map(|rnet| rnet.routes.iter())
            .nth(idx)
            .map(|r| RouteInfo {
                net: r.net,
                hops: r.hops,
                gateway: r.gateway,
                alive: peers.find(r.gateway).map_or(false, |p| p.alive),
            })
    }

    /// All routes in table order.
    pub fn routes(&self) -> Vec<Route> {
        self.nets
            .iter()
            .flat_map(|rnet| rnet.routes.iter().cloned())
            .collect()
    }

    /// Routes to `net`, in placement order.
    pub fn routes_to(&self, net: NetId) -> &[Route] {
        self.nets
            .iter()
            .find(|r| r.net == net)
            .map_or(&[][..], |r| r.routes.as_slice())
    }

    /// Fails when two routes to one net leave through different local interfaces.
    pub fn check_routes(&self, peers: &PeerRegistry) -> TransportResult<()> {
        for rnet in &self.nets {
            let mut first: Option<(Nid, usize)> = None;
            for route in &rnet.routes {
                let Some(peer) = peers.find(route.gateway) else {
                    continue;
                };
                match first {
                    None => first = Some((route.gateway, peer.ni)),
                    Some((gw, ni)) if ni != peer.ni => {
                        return Err(TransportError::AmbiguousRoutes {
                            net: rnet.net,
                            first: gw,
                            second: route.gateway,
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Records the down-interface count a gateway reported for a route.
    pub fn set_downis(&mut self, gateway: Nid, net: NetId, downis: u32) {
        if let Some(rnet) = self.nets.iter_mut().find(|r| r.net == net) {
            for route in rnet.routes.iter_mut().filter(|r| r.gateway == gateway) {
                route.downis = downis;
            }
        }
    }

    /// Picks the gateway for `net`.
    ///
    /// Gateways believed dead are never chosen. Among live ones, routes
    /// with no reported down interfaces win, then fewer hops, then
    /// placement order.
    pub fn select_gateway(&self, peers: &PeerRegistry, net: NetId) -> Option<Nid> {
        self.routes_to(net)
            .iter()
            .filter(|r| peers.find(r.gateway).map_or(false, |p| p.alive))
            .min_by_key(|r| (r.downis > 0, r.hops))
            .map(|r| r.gateway)
    }

    /// Bumped on every route change.
    pub fn remote_nets_version(&self) -> u64 {
        self.version
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.nets.iter().map(|r| r.routes.len()).sum()
    }

    /// True when there are no routes.
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nid::NetKind;
    use tokio::time::Instant;

    fn tcp(num: u16) -> NetId {
        NetId::new(NetKind::Tcp, num)
    }

    fn gw(addr: u32) -> Nid {
        Nid::new(tcp(0), addr)
    }

    fn setup() -> (RouteTable, PeerRegistry, Vec<NetId>) {
        (RouteTable::new(7), PeerRegistry::new(false), vec![tcp(0)])
    }

    #[test]
    fn test_add_route_validation() {
        let (mut table, mut peers, local) = setup();
        let lo = NetId::new(NetKind::Loopback, 0);

        for (net, hops, gateway) in [
            (tcp(1), 1, Nid::ANY),
            (tcp(1), 1, Nid::new(lo, 0)),
            (lo, 1, gw(1)),
            (tcp(0), 1, gw(1)),
            (tcp(1), 0, gw(1)),
            (tcp(1), 256, gw(1)),
        ] {
            let err = table.add_route(&mut peers, &local, net, hops, gateway).unwrap_err();
            assert!(matches!(err, TransportError::InvalidRoute { .. }), "{:?}", err);
        }
        assert!(table.is_empty());
        assert!(peers.is_empty());
    }

    #[test]
    fn test_local_net_and_unreachable_gateway_ignored() {
        let (mut table, mut peers, _) = setup();
        let local = vec![tcp(0), tcp(1)];
        assert!(!table.add_route(&mut peers, &local, tcp(1), 1, gw(1)).unwrap());

        let far = Nid::new(tcp(9), 1);
        assert!(!table.add_route(&mut peers, &local, tcp(2), 1, far).unwrap());
        assert!(table.is_empty());
        assert_eq!(table.remote_nets_version(), 0);
    }

    #[test]
    fn test_duplicate_gateway_is_noop() {
        let (mut table, mut peers, local) = setup();
        assert!(table.add_route(&mut peers, &local, tcp(1), 1, gw(1)).unwrap());
        assert!(!table.add_route(&mut peers, &local, tcp(1), 3, gw(1)).unwrap());
        assert_eq!(table.len(), 1);
        let peer = peers.find(gw(1)).unwrap();
        assert_eq!(peer.rtr_refcount, 1);
        // one for the route, one for the router list
        assert_eq!(peer.refcount, 2);
    }

    #[test]
    fn test_delete_and_readd_leaves_one_route() {
        let (mut table, mut peers, local) = setup();
        table.add_route(&mut peers, &local, tcp(1), 1, gw(1)).unwrap();
        assert_eq!(table.del_route(&mut peers, tcp(1), gw(1)).unwrap(), 1);
        assert!(peers.find(gw(1)).is_none());
        assert!(table.is_empty());

        table.add_route(&mut peers, &local, tcp(1), 1, gw(1)).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(peers.routers(), &[gw(1)]);
    }

    #[test]
    fn test_del_route_wildcards() {
        let (mut table, mut peers, local) = setup();
        table.add_route(&mut peers, &local, tcp(1), 1, gw(1)).unwrap();
        table.add_route(&mut peers, &local, tcp(2), 1, gw(1)).unwrap();
        table.add_route(&mut peers, &local, tcp(2), 2, gw(2)).unwrap();
        assert_eq!(peers.find(gw(1)).unwrap().rtr_refcount, 2);

        assert_eq!(table.del_route(&mut peers, NetId::ANY, gw(1)).unwrap(), 2);
        assert_eq!(table.len(), 1);
        assert!(matches!(
            table.del_route(&mut peers, tcp(1), Nid::ANY),
            Err(TransportError::NotFound(_))
        ));

        table.destroy_routes(&mut peers);
        assert!(table.is_empty());
        assert!(peers.is_empty());
        assert!(peers.routers().is_empty());
    }

    #[test]
    fn test_get_route_by_index() {
        let (mut table, mut peers, local) = setup();
        table.add_route(&mut peers, &local, tcp(1), 4, gw(1)).unwrap();
        let info = table.get_route(&peers, 0).unwrap();
        assert_eq!(info.net, tcp(1));
        assert_eq!(info.hops, 4);
        assert_eq!(info.gateway, gw(1));
        assert!(info.alive);
        assert!(table.get_route(&peers, 1).is_none());
    }

    #[test]
    fn test_check_routes_rejects_mixed_interfaces() {
        let mut table = RouteTable::new(1);
        let mut peers = PeerRegistry::new(false);
        let local = vec![tcp(0), tcp(5)];
        table.add_route(&mut peers, &local, tcp(1), 1, gw(1)).unwrap();
        table.check_routes(&peers).unwrap();

        table
            .add_route(&mut peers, &local, tcp(1), 1, Nid::new(tcp(5), 1))
            .unwrap();
        assert!(matches!(
            table.check_routes(&peers),
            Err(TransportError::AmbiguousRoutes { .. })
        ));
    }

    #[test]
    fn test_select_gateway_prefers_fewer_hops_and_skips_dead() {
        let (mut table, mut peers, local) = setup();
        table.add_route(&mut peers, &local, tcp(1), 2, gw(2)).unwrap();
        table.add_route(&mut peers, &local, tcp(1), 1, gw(1)).unwrap();
        assert_eq!(table.select_gateway(&peers, tcp(1)), Some(gw(1)));

        peers.notify_locked(gw(1), false, false, Instant::now());
        assert_eq!(table.select_gateway(&peers, tcp(1)), Some(gw(2)));

        peers.notify_locked(gw(2), false, false, Instant::now());
        assert_eq!(table.select_gateway(&peers, tcp(1)), None);
    }

    #[test]
    fn test_select_gateway_avoids_down_interfaces() {
        let (mut table, mut peers, local) = setup();
        table.add_route(&mut peers, &local, tcp(1), 1, gw(1)).unwrap();
        table.add_route(&mut peers, &local, tcp(1), 3, gw(2)).unwrap();
        table.set_downis(gw(1), tcp(1), 2);
        assert_eq!(table.select_gateway(&peers, tcp(1)), Some(gw(2)));
        // still usable when it is the only live choice
        peers.notify_locked(gw(2), false, false, Instant::now());
        assert_eq!(table.select_gateway(&peers, tcp(1)), Some(gw(1)));
    }

    #[test]
    fn test_version_bumps() {
        let (mut table, mut peers, local) = setup();
        table.add_route(&mut peers, &local, tcp(1), 1, gw(1)).unwrap();
        let v = table.remote_nets_version();
        table.del_route(&mut peers, tcp(1), gw(1)).unwrap();
        assert!(table.remote_nets_version() > v);
    }
}
