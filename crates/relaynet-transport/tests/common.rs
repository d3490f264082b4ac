//! Shared fixtures for the transport integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use relaynet_transport::sim::SimFabric;
use relaynet_transport::{Lnet, LnetConfig, NetId, NetKind, NetworkInterface, Nid};

pub fn tcp(num: u16) -> NetId {
    NetId::new(NetKind::Tcp, num)
}

pub fn nid(net: u16, addr: u32) -> Nid {
    Nid::new(tcp(net), addr)
}

/// Config with the router checker pinging every gateway.
pub fn pinging_config(live: i64, dead: i64) -> LnetConfig {
    let mut config = LnetConfig::default();
    config.router.live_router_check_interval = live;
    config.router.dead_router_check_interval = dead;
    config
}

/// Attaches `at` to the fabric and runs its event loop.
pub fn node(fabric: &SimFabric, at: Nid, config: LnetConfig) -> Arc<Lnet> {
    let (ni, rx) = fabric.attach(at);
    let lnet = Lnet::new(config, vec![ni as Arc<dyn NetworkInterface>]).expect("lnet");
    lnet.spawn_event_loop(rx);
    lnet
}

/// Lets spawned event loops drain.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
