//! Peer registry.
//!
//! Every remote interface the node talks to, gateways included, has a
//! [`Peer`] entry with a reference count. Gateways additionally carry a
//! router reference count: the first route through a peer puts it on
//! the sorted router list and the last one takes it off again, staging
//! its ping buffer for release. All of this lives under the node's
//! single state lock.

use std::collections::HashMap;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{TransportError, TransportResult};
use crate::nid::{NetId, Nid};
use crate::ping::PingVersion;
use crate::router_checker::{RcdId, RcdStage, RouterCheckData};

/// A remote interface.
#[derive(Debug, Clone)]
pub struct Peer {
    /// The peer's NID.
    pub nid: Nid,
    /// Index of the local interface the peer is reached through.
    pub ni: usize,
    /// References held by routes, ping buffers and in-flight callers.
    pub refcount: u32,
    /// Routes using this peer as gateway.
    pub rtr_refcount: u32,
    /// Current liveness belief.
    pub alive: bool,
    /// Number of state changes recorded; 0 means never reported.
    pub alive_count: u32,
    /// A state change still has to be delivered.
    pub notify: bool,
    /// The pending delivery must reach the driver.
    pub notify_lnd: bool,
    /// A delivery loop is running for this peer.
    pub notifying: bool,
    /// Time of the last accepted liveness report.
    pub timestamp: Option<Instant>,
    /// Last time anything was received from the peer.
    pub last_alive: Option<Instant>,
    /// Time the last ping was issued.
    pub ping_timestamp: Option<Instant>,
    /// Time by which an outstanding ping must be answered.
    pub ping_deadline: Option<Instant>,
    /// A ping was issued and its send has not completed.
    pub ping_notsent: bool,
    /// Version of the last ping payload parsed.
    pub ping_version: PingVersion,
    /// Ping buffer, while the peer is a gateway.
    pub rcd: Option<RcdId>,
    /// Destination nets of the routes through this peer.
    pub routes: Vec<NetId>,
}

impl Peer {
    fn new(nid: Nid, ni: usize, alive: bool) -> Self {
        Self {
            nid,
            ni,
            refcount: 0,
            rtr_refcount: 0,
            alive,
            alive_count: 0,
            notify: false,
            notify_lnd: false,
            notifying: false,
            timestamp: None,
            last_alive: None,
            ping_timestamp: None,
            ping_deadline: None,
            ping_notsent: false,
            ping_version: PingVersion::Unknown,
            rcd: None,
            routes: Vec::new(),
        }
    }

    /// True while at least one route uses this peer.
    pub fn is_router(&self) -> bool {
        self.rtr_refcount > 0
    }
}

/// A state change waiting to be delivered to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingNotification {
    /// State to deliver.
    pub alive: bool,
    /// Whether the driver must be told.
    pub notify_lnd: bool,
}

/// Counts for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStats {
    /// Peers in the table.
    pub peers: usize,
    /// Peers on the router list.
    pub routers: usize,
    /// Router list version.
    pub routers_version: u64,
    /// Ping buffers attached to gateways.
    pub rcd_active: usize,
    /// Ping buffers waiting to be unlinked.
    pub rcd_deathrow: usize,
    /// Ping buffers waiting for their unlink event.
    pub rcd_zombie: usize,
}

/// Table of peers plus the router list and ping buffers.
pub struct PeerRegistry {
    peers: HashMap<Nid, Peer>,
    routers: Vec<Nid>,
    routers_version: u64,
    rcds: HashMap<RcdId, RouterCheckData>,
    destroyed: Vec<Nid>,
    peers_start_down: bool,
}

impl PeerRegistry {
    /// Empty registry. With `peers_start_down`, new peers are believed
    /// dead until something says otherwise.
    pub fn new(peers_start_down: bool) -> Self {
        Self {
            peers: HashMap::new(),
            routers: Vec::new(),
            routers_version: 0,
            rcds: HashMap::new(),
            destroyed: Vec::new(),
            peers_start_down,
        }
    }

    /// Looks a peer up.
    pub fn find(&self, nid: Nid) -> Option<&Peer> {
        self.peers.get(&nid)
    }

    pub(crate) fn find_mut(&mut self, nid: Nid) -> Option<&mut Peer> {
        self.peers.get_mut(&nid)
    }

    /// Finds or creates the peer and takes a reference on it.
    ///
    /// `Unreachable` unless the peer's net is one of `local_nets`.
    pub fn find_or_create(&mut self, nid: Nid, local_nets: &[NetId]) -> TransportResult<&mut Peer> {
        let ni = local_nets
            .iter()
            .position(|&net| net == nid.net())
            .ok_or(TransportError::Unreachable(nid))?;
        let alive = !self.peers_start_down;
        let peer = self.peers.entry(nid).or_insert_with(|| {
            trace!(peer = %nid, alive, "creating peer");
            Peer::new(nid, ni, alive)
        });
        peer.refcount += 1;
        Ok(peer)
    }

    /// Takes a reference on an existing peer.
    pub fn addref(&mut self, nid: Nid) {
        if let Some(peer) = self.peers.get_mut(&nid) {
            peer.refcount += 1;
        }
    }

    /// Drops a reference; the peer is removed when none remain.
    pub fn decref(&mut self, nid: Nid) {
        let Some(peer) = self.peers.get_mut(&nid) else {
            return;
        };
        peer.refcount = peer.refcount.saturating_sub(1);
        if peer.refcount == 0 {
            debug_assert!(peer.rtr_refcount == 0 && peer.rcd.is_none());
            trace!(peer = %nid, "destroying peer");
            self.peers.remove(&nid);
            self.destroyed.push(nid);
        }
    }

    /// Peers destroyed since the last call.
    pub fn take_destroyed(&mut self) -> Vec<Nid> {
        std::mem::take(&mut self.destroyed)
    }

    /// Takes a router reference. The first one puts the peer on the router list.
    pub fn rtr_addref(&mut self, nid: Nid) {
        let Some(peer) = self.peers.get_mut(&nid) else {
            return;
        };
        peer.rtr_refcount += 1;
        if peer.rtr_refcount == 1 {
            // the router list holds its own reference
            peer.refcount += 1;
            let pos = self.routers.partition_point(|&r| r < nid);
            self.routers.insert(pos, nid);
            self.routers_version += 1;
            debug!(gateway = %nid, routers = self.routers.len(), "gateway added to router list");
        }
    }

    /// Drops a router reference. The last one stages the ping buffer for
    /// release and takes the peer off the router list.
    pub fn rtr_decref(&mut self, nid: Nid) {
        let Some(peer) = self.peers.get_mut(&nid) else {
            return;
        };
        peer.rtr_refcount = peer.rtr_refcount.saturating_sub(1);
        if peer.rtr_refcount > 0 {
            return;
        }
        if let Some(id) = peer.rcd.take() {
            if let Some(rcd) = self.rcds.get_mut(&id) {
                rcd.stage = RcdStage::Deathrow;
            }
        }
        self.routers.retain(|&r| r != nid);
        self.routers_version += 1;
        debug!(gateway = %nid, routers = self.routers.len(), "gateway removed from router list");
        self.decref(nid);
    }

    /// Records a liveness report. Returns true when it changed state.
    ///
    /// Reports older than the last accepted one are dropped. A report
    /// repeating the current state only refreshes the timestamp.
    pub fn notify_locked(&mut self, nid: Nid, notify_lnd: bool, alive: bool, when: Instant) -> bool {
        let Some(peer) = self.peers.get_mut(&nid) else {
            return false;
        };
        if let Some(ts) = peer.timestamp {
            if when < ts {
                debug!(peer = %nid, alive, "dropping stale liveness report");
                return false;
            }
        }
        peer.timestamp = Some(when);
        peer.ping_deadline = None;

        if peer.alive_count != 0 && peer.alive == alive {
            return false;
        }

        peer.alive_count += 1;
        peer.alive = alive;
        peer.notify = true;
        peer.notify_lnd |= notify_lnd;
        if alive {
            peer.ping_version = PingVersion::Unknown;
        }
        debug!(peer = %nid, alive, alive_count = peer.alive_count, "peer state changed");
        true
    }

    /// Claims the delivery loop for `nid`. False when another caller holds it.
    pub fn begin_notify(&mut self, nid: Nid) -> bool {
        match self.peers.get_mut(&nid) {
            Some(peer) if !peer.notifying => {
                peer.notifying = true;
                true
            }
            _ => false,
        }
    }

    /// Takes the latest pending state change, or releases the delivery
    /// loop when nothing is pending.
    pub fn take_notification(&mut self, nid: Nid) -> Option<PendingNotification> {
        let peer = self.peers.get_mut(&nid)?;
        if !peer.notify {
            peer.notifying = false;
            return None;
        }
        let pending = PendingNotification {
            alive: peer.alive,
            notify_lnd: peer.notify_lnd,
        };
        peer.notify = false;
        peer.notify_lnd = false;
        Some(pending)
    }

    /// Gateways, sorted by NID.
    pub fn routers(&self) -> &[Nid] {
        &self.routers
    }

    /// Bumped whenever the router list changes.
    pub fn routers_version(&self) -> u64 {
        self.routers_version
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peers exist.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Attaches a ping buffer to a gateway, taking a gateway reference.
    ///
    /// If the peer stopped being a gateway or already has a buffer, the
    /// new one goes straight to deathrow. Returns true when attached.
    pub(crate) fn install_rcd(&mut self, id: RcdId, mut rcd: RouterCheckData) -> bool {
        let gateway = rcd.gateway;
        self.addref(gateway);
        let installed = match self.peers.get_mut(&gateway) {
            Some(peer) if peer.is_router() && peer.rcd.is_none() => {
                peer.rcd = Some(id);
                true
            }
            _ => false,
        };
        rcd.stage = if installed {
            RcdStage::Active
        } else {
            RcdStage::Deathrow
        };
        self.rcds.insert(id, rcd);
        installed
    }

    pub(crate) fn rcd(&self, id: RcdId) -> Option<&RouterCheckData> {
        self.rcds.get(&id)
    }

    pub(crate) fn rcd_mut(&mut self, id: RcdId) -> Option<&mut RouterCheckData> {
        self.rcds.get_mut(&id)
    }

    /// Detaches every gateway's ping buffer and stages it for release.
    pub(crate) fn retire_all_rcds(&mut self) {
        for nid in &self.routers {
            if let Some(peer) = self.peers.get_mut(nid) {
                if let Some(id) = peer.rcd.take() {
                    if let Some(rcd) = self.rcds.get_mut(&id) {
                        rcd.stage = RcdStage::Deathrow;
                    }
                }
            }
        }
    }

    /// Moves every deathrow buffer to zombie and returns what must be unlinked.
    pub(crate) fn drain_deathrow(&mut self) -> Vec<(RcdId, RouterCheckData)> {
        let mut out = Vec::new();
        for (id, rcd) in self.rcds.iter_mut() {
            if rcd.stage == RcdStage::Deathrow {
                rcd.stage = RcdStage::Zombie;
                out.push((*id, rcd.clone()));
            }
        }
        out
    }

    /// Frees zombie buffers whose unlink has completed, dropping their
    /// gateway references. Returns how many zombies remain.
    pub(crate) fn free_unlinked_zombies(&mut self) -> usize {
        let done: Vec<(RcdId, Nid)> = self
            .rcds
            .iter()
            .filter(|(_, rcd)| rcd.stage == RcdStage::Zombie && rcd.md.is_none())
            .map(|(id, rcd)| (*id, rcd.gateway))
            .collect();
        for (id, gateway) in done {
            self.rcds.remove(&id);
            self.decref(gateway);
        }
        self.rcds
            .values()
            .filter(|rcd| rcd.stage == RcdStage::Zombie)
            .count()
    }

    /// True when no buffers wait for release.
    pub(crate) fn nothing_to_prune(&self) -> bool {
        self.rcds.values().all(|rcd| rcd.stage == RcdStage::Active)
    }

    /// Diagnostic counts.
    pub fn stats(&self) -> PeerStats {
        let count = |stage| self.rcds.values().filter(|r| r.stage == stage).count();
        PeerStats {
            peers: self.peers.len(),
            routers: self.routers.len(),
            routers_version: self.routers_version,
            rcd_active: count(RcdStage::Active),
            rcd_deathrow: count(RcdStage::Deathrow),
            rcd_zombie: count(RcdStage::Zombie),
        }
    }
}
