//! Shared fixtures for the target integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use relaynet_recovery::{Ledger, LedgerConfig, MemStore, Opcode};
use relaynet_target::{OpHandler, OpResult};
use relaynet_transport::sim::SimFabric;
use relaynet_transport::{Lnet, LnetConfig, NetId, NetKind, NetworkInterface, Nid};

pub const SERVER: &str = "ost1_UUID";

pub fn nid(net: u16, addr: u32) -> Nid {
    Nid::new(NetId::new(NetKind::Tcp, net), addr)
}

/// Attaches `at` to the fabric and runs its event loop.
pub fn node(fabric: &SimFabric, at: Nid) -> Arc<Lnet> {
    let (ni, rx) = fabric.attach(at);
    let lnet = Lnet::new(LnetConfig::default(), vec![ni as Arc<dyn NetworkInterface>]).expect("lnet");
    lnet.spawn_event_loop(rx);
    lnet
}

pub fn ledger(store: &MemStore) -> Arc<Ledger> {
    Arc::new(Ledger::open(Arc::new(store.clone()), LedgerConfig::for_server(SERVER)).expect("open ledger"))
}

/// Lets spawned event loops drain.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Counts executions. A body starting with `fail` fails with -2;
/// anything else succeeds with the body length as data.
#[derive(Default)]
pub struct CountingHandler {
    runs: AtomicUsize,
}

impl CountingHandler {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl OpHandler for CountingHandler {
    fn execute(&self, _client: &str, _opcode: Opcode, body: &[u8]) -> OpResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if body.starts_with(b"fail") {
            OpResult { result: -2, data: 0 }
        } else {
            OpResult {
                result: 0,
                data: body.len() as u32,
            }
        }
    }
}
