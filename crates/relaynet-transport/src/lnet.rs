//! The network context.
//!
//! [`Lnet`] owns the local interfaces, the single lock protecting peers,
//! routes and ping buffers, the event table, the router pools and the
//! counters. Everything else in the crate works through it.
//!
//! Driver calls (binding, issuing, liveness callbacks) are never made
//! while the state lock is held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{PeerCredit, PeerCredits, RouterBuffer, RouterPools};
use crate::config::LnetConfig;
use crate::error::{TransportError, TransportResult};
use crate::event::{EventTable, EventTag, EventTarget};
use crate::metrics::TransportMetrics;
use crate::ni::{
    AckRequest, EventKind, MdHandle, MdOptions, MemoryDescriptor, NetEvent, NetworkInterface,
    Region, SendTarget, Threshold,
};
use crate::nid::{NetId, Nid, ProcessId, SERVER_PID};
use crate::peer::{Peer, PeerRegistry, PeerStats};
use crate::ping::{NiStatus, PingInfo, NI_STATUS_DOWN, NI_STATUS_UP};
use crate::route::{Route, RouteInfo, RouteTable};
use crate::router_checker::{CheckerState, GatewayState};
use crate::{bulk, message, router_checker};

/// Status of one local interface as published to pings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalNiState {
    pub(crate) nid: Nid,
    pub(crate) up: bool,
    pub(crate) last_alive: Instant,
}

/// Everything under the state lock.
pub(crate) struct NetState {
    pub(crate) peers: PeerRegistry,
    pub(crate) routes: RouteTable,
    pub(crate) rc_state: CheckerState,
    pub(crate) nis: Vec<LocalNiState>,
    pub(crate) shutting_down: bool,
}

/// Network context: local interfaces plus routing and liveness state.
pub struct Lnet {
    config: LnetConfig,
    drivers: Vec<Arc<dyn NetworkInterface>>,
    local_nets: Vec<NetId>,
    pub(crate) state: Mutex<NetState>,
    pub(crate) events: EventTable,
    pools: RouterPools,
    pub(crate) tx_credits: PeerCredits,
    metrics: TransportMetrics,
    pub(crate) rcd_unlinked: Notify,
    next_rcd: AtomicU64,
    next_xid: AtomicU64,
}

impl Lnet {
    /// Builds the context over one driver per local net.
    pub fn new(config: LnetConfig, drivers: Vec<Arc<dyn NetworkInterface>>) -> TransportResult<Arc<Self>> {
        config.validate()?;
        if drivers.is_empty() {
            return Err(TransportError::InvalidConfig("no network interfaces".to_string()));
        }

        let mut local_nets = Vec::with_capacity(drivers.len());
        for driver in &drivers {
            let net = driver.nid().net();
            if local_nets.contains(&net) {
                return Err(TransportError::InvalidConfig(format!(
                    "more than one interface on {}",
                    net
                )));
            }
            local_nets.push(net);
        }

        let now = Instant::now();
        let clock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let seed = drivers
            .iter()
            .fold(clock, |acc, d| acc ^ d.nid().raw());

        let nis = drivers
            .iter()
            .map(|d| LocalNiState {
                nid: d.nid(),
                up: true,
                last_alive: now,
            })
            .collect();

        let state = NetState {
            peers: PeerRegistry::new(config.router.peers_start_down()),
            routes: RouteTable::new(seed),
            rc_state: CheckerState::Shutdown,
            nis,
            shutting_down: false,
        };

        info!(
            nets = ?local_nets.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "network context initialised"
        );

        Ok(Arc::new(Self {
            pools: RouterPools::new(&config.router),
            config,
            drivers,
            local_nets,
            state: Mutex::new(state),
            events: EventTable::new(),
            tx_credits: PeerCredits::tx(),
            metrics: TransportMetrics::new(),
            rcd_unlinked: Notify::new(),
            next_rcd: AtomicU64::new(1),
            next_xid: AtomicU64::new(1),
        }))
    }

    /// Active configuration.
    pub fn config(&self) -> &LnetConfig {
        &self.config
    }

    /// Counters.
    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    /// Nets with a local interface, in interface order.
    pub fn local_nets(&self) -> &[NetId] {
        &self.local_nets
    }

    /// NID of local interface `idx`.
    pub fn local_nid(&self, idx: usize) -> Option<Nid> {
        self.drivers.get(idx).map(|d| d.nid())
    }

    pub(crate) fn driver(&self, idx: usize) -> TransportResult<&Arc<dyn NetworkInterface>> {
        self.drivers
            .get(idx)
            .ok_or_else(|| TransportError::NotFound(format!("local interface {}", idx)))
    }

    pub(crate) fn next_xid(&self) -> u64 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_rcd(&self) -> u64 {
        self.next_rcd.fetch_add(1, Ordering::Relaxed)
    }

    /// Router pools.
    pub fn pools(&self) -> &RouterPools {
        &self.pools
    }

    /// Sizes the router pools and turns forwarding on when configured.
    pub fn configure_router(&self, im_a_router: bool) -> TransportResult<bool> {
        self.pools.alloc(&self.config.router, im_a_router)
    }

    /// Whether this node forwards.
    pub fn is_routing(&self) -> bool {
        self.pools.is_routing()
    }

    /// Adds a route; the gateway's driver is told to assume it is alive.
    pub fn add_route(&self, net: NetId, hops: u32, gateway: Nid) -> TransportResult<()> {
        let ni = {
            let mut state = self.state.lock();
            let state = &mut *state;
            if !state
                .routes
                .add_route(&mut state.peers, &self.local_nets, net, hops, gateway)?
            {
                return Ok(());
            }
            // held across the callback
            state.peers.addref(gateway);
            state.peers.find(gateway).map(|p| p.ni)
        };
        self.metrics.inc_routes_added();

        if let Some(ni) = ni {
            if let Ok(driver) = self.driver(ni) {
                driver.notify_peer(gateway, true);
            }
        }
        let mut state = self.state.lock();
        state.peers.decref(gateway);
        self.reap_peers(&mut state.peers);
        Ok(())
    }

    /// Removes matching routes (`NetId::ANY`/`Nid::ANY` match everything).
    pub fn del_route(&self, net: NetId, gateway: Nid) -> TransportResult<usize> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let removed = state.routes.del_route(&mut state.peers, net, gateway)?;
        self.reap_peers(&mut state.peers);
        self.metrics.add_routes_deleted(removed as u64);
        Ok(removed)
    }

    /// Drops the credit counters of destroyed peers.
    pub(crate) fn reap_peers(&self, peers: &mut PeerRegistry) {
        for nid in peers.take_destroyed() {
            let tx = self.tx_credits.forget(nid);
            let fwd = self.pools.peer_credits().forget(nid);
            trace!(peer = %nid, tx, fwd, "peer credits released");
        }
    }

    /// Forgets the transmit counters of a next hop that is not a known
    /// peer once nothing uses them.
    pub(crate) fn release_hop(&self, nid: Nid) {
        let state = self.state.lock();
        if state.peers.find(nid).is_none() {
            self.tx_credits.forget(nid);
        }
    }

    /// Per-peer transmit credits.
    pub fn tx_credits(&self) -> &PeerCredits {
        &self.tx_credits
    }

    /// Reserves a forwarding credit for `from` and then a router buffer
    /// for `nob` bytes, waiting in arrival order for each.
    pub async fn reserve_forward(&self, from: Nid, nob: usize) -> TransportResult<(PeerCredit, RouterBuffer)> {
        let ni = self
            .local_nets
            .iter()
            .position(|&net| net == from.net())
            .ok_or(TransportError::Unreachable(from))?;
        let tunables = self.driver(ni)?.tunables();
        self.pools.acquire_forward(from, tunables, nob).await
    }

    /// The `idx`-th route.
    pub fn get_route(&self, idx: usize) -> Option<RouteInfo> {
        let state = self.state.lock();
        state.routes.get_route(&state.peers, idx)
    }

    /// All routes.
    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().routes.routes()
    }

    /// Fails when a remote net is reached through more than one local interface.
    pub fn check_routes(&self) -> TransportResult<()> {
        let state = self.state.lock();
        state.routes.check_routes(&state.peers)
    }

    /// Route table version.
    pub fn remote_nets_version(&self) -> u64 {
        self.state.lock().routes.remote_nets_version()
    }

    /// Copy of a peer entry.
    pub fn peer(&self, nid: Nid) -> Option<Peer> {
        self.state.lock().peers.find(nid).cloned()
    }

    /// Gateways, sorted.
    pub fn routers(&self) -> Vec<Nid> {
        self.state.lock().peers.routers().to_vec()
    }

    /// Health-check view of a gateway.
    pub fn gateway_state(&self, nid: Nid) -> Option<GatewayState> {
        self.state.lock().peers.find(nid).map(GatewayState::of)
    }

    /// Peer table counters.
    pub fn peer_stats(&self) -> PeerStats {
        self.state.lock().peers.stats()
    }

    /// Router checker state.
    pub fn checker_state(&self) -> CheckerState {
        self.state.lock().rc_state
    }

    /// Liveness report from a driver (`reporter`) or from outside (`None`).
    ///
    /// Reports for unknown peers are ignored. A driver's down report is
    /// never allowed to predate the last time the peer was heard from.
    pub fn notify(&self, reporter: Option<Nid>, nid: Nid, alive: bool, when: Instant) -> TransportResult<()> {
        if let Some(ni) = reporter {
            if ni.net() != nid.net() {
                warn!(reporter = %ni, peer = %nid, alive, "ignoring notification for a peer on another net");
                return Err(TransportError::InvalidArgument(format!(
                    "{} cannot report on {}",
                    ni, nid
                )));
            }
        }
        if when > Instant::now() {
            warn!(peer = %nid, alive, "ignoring notification dated in the future");
            return Err(TransportError::InvalidArgument(format!(
                "notification for {} is dated in the future",
                nid
            )));
        }
        if reporter.is_some() && !alive && !self.config.router.auto_down {
            debug!(peer = %nid, "auto down disabled, ignoring down report");
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            let Some(peer) = state.peers.find(nid) else {
                debug!(peer = %nid, alive, "notification for unknown peer");
                return Ok(());
            };
            let mut when = when;
            if reporter.is_some() && !alive {
                if let Some(last_alive) = peer.last_alive {
                    if last_alive > when {
                        when = last_alive;
                    }
                }
            }
            state.peers.notify_locked(nid, reporter.is_none(), alive, when);
        }
        self.deliver_notifications(nid);
        Ok(())
    }

    /// Runs the per-peer delivery loop until no state change is pending.
    /// Another caller already running it will pick up our change.
    pub(crate) fn deliver_notifications(&self, nid: Nid) {
        let mut state = self.state.lock();
        if !state.peers.begin_notify(nid) {
            return;
        }
        state.peers.addref(nid);
        let ni = state.peers.find(nid).map(|p| p.ni);

        while let Some(pending) = state.peers.take_notification(nid) {
            if !pending.notify_lnd {
                continue;
            }
            let Some(driver) = ni.and_then(|ni| self.drivers.get(ni)) else {
                continue;
            };
            drop(state);
            driver.notify_peer(nid, pending.alive);
            self.metrics.inc_notifications_delivered();
            state = self.state.lock();
        }
        state.peers.decref(nid);
        self.reap_peers(&mut state.peers);
    }

    /// Local interface and first hop for `dest`.
    pub(crate) fn resolve(&self, dest: ProcessId) -> TransportResult<(usize, SendTarget)> {
        if let Some(ni) = self.local_nets.iter().position(|&n| n == dest.nid.net()) {
            return Ok((ni, SendTarget::direct(dest)));
        }
        let state = self.state.lock();
        let gateway = state
            .routes
            .select_gateway(&state.peers, dest.nid.net())
            .ok_or(TransportError::Unreachable(dest.nid))?;
        let ni = state
            .peers
            .find(gateway)
            .map(|p| p.ni)
            .ok_or(TransportError::Unreachable(dest.nid))?;
        Ok((
            ni,
            SendTarget {
                target: dest,
                next_hop: gateway,
            },
        ))
    }

    /// Binds `region` and puts it to the target.
    ///
    /// The binding expects two events when an ACK is requested and one
    /// otherwise. If the put cannot be issued the binding is unlinked and
    /// the failure surfaces as its unlink event, so this still returns
    /// the handle.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send_buf(
        &self,
        ni: usize,
        region: Region,
        tag: EventTag,
        ack: AckRequest,
        to: SendTarget,
        portal: u32,
        match_bits: u64,
    ) -> TransportResult<MdHandle> {
        let driver = self.driver(ni)?;
        let md = MemoryDescriptor {
            region,
            threshold: Threshold::Count(if ack == AckRequest::Ack { 2 } else { 1 }),
            options: MdOptions::default(),
            user: tag,
        };
        let handle = driver.md_bind(md)?;
        if let Err(e) = driver.put(handle, ack, to, portal, match_bits) {
            warn!(target = %to.target, portal, match_bits, error = %e, "put failed, unlinking");
            if let Err(e) = driver.md_unlink(handle) {
                debug!(error = %e, "unlink after failed put");
            }
        }
        Ok(handle)
    }

    /// Ping payload describing this node's interfaces.
    pub fn ping_info(&self) -> PingInfo {
        let state = self.state.lock();
        let nis = state
            .nis
            .iter()
            .map(|ni| NiStatus {
                nid: ni.nid,
                status: if ni.up { NI_STATUS_UP } else { NI_STATUS_DOWN },
            })
            .collect();
        PingInfo::new(SERVER_PID, nis)
    }

    /// Whether local interface `idx` is currently published as up.
    pub fn ni_up(&self, idx: usize) -> Option<bool> {
        self.state.lock().nis.get(idx).map(|ni| ni.up)
    }

    fn mark_rx(&self, ni: Nid, from: Nid, now: Instant) {
        let mut state = self.state.lock();
        if let Some(local) = state.nis.iter_mut().find(|n| n.nid == ni) {
            local.last_alive = now;
            if !local.up {
                info!(ni = %ni, "interface back up");
                local.up = true;
            }
        }
        if let Some(peer) = state.peers.find_mut(from) {
            peer.last_alive = Some(now);
        }
    }

    /// Dispatches one completion event.
    pub fn handle_event(&self, ev: NetEvent) -> TransportResult<()> {
        let target = self.events.lookup(ev.tag).ok_or_else(|| {
            TransportError::ProtocolViolation(format!(
                "{:?} event for unknown binding {:?} on {}",
                ev.kind, ev.tag, ev.ni
            ))
        })?;

        if ev.ok() && matches!(ev.kind, EventKind::Put | EventKind::Get | EventKind::Reply | EventKind::Ack) {
            self.mark_rx(ev.ni, ev.initiator.nid, Instant::now());
        }

        let result = match &target {
            EventTarget::RequestOut(req) => message::request_out_event(self, req, &ev),
            EventTarget::ReplyIn(req) => message::reply_in_event(self, req, &ev),
            EventTarget::RequestIn(buf) => message::request_in_event(self, buf, &ev),
            EventTarget::ReplyOut(rs) => message::reply_out_event(self, rs, &ev),
            EventTarget::Bulk(desc) => bulk::bulk_event(self, desc, &ev),
            EventTarget::RouterCheck(id) => router_checker::checker_event(self, *id, &ev),
        };
        if ev.unlinked {
            self.events.release(ev.tag);
        }
        if let Err(e) = &result {
            error!(target = target.name(), kind = ?ev.kind, error = %e, "event handling failed");
        }
        result
    }

    /// Consumes a driver's completion stream until it closes.
    ///
    /// A protocol violation means buffers may be corrupt and stops the node.
    pub async fn run_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<NetEvent>) {
        while let Some(ev) = rx.recv().await {
            if let Err(e) = self.handle_event(ev) {
                if e.is_fatal() {
                    panic!("unrecoverable network event: {}", e);
                }
            }
        }
        debug!("event stream closed");
    }

    /// Spawns [`Lnet::run_events`] on the current runtime.
    pub fn spawn_event_loop(self: &Arc<Self>, rx: mpsc::UnboundedReceiver<NetEvent>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_events(rx))
    }

    /// Bindings whose terminal event has not been handled yet.
    pub fn live_bindings(&self) -> usize {
        self.events.live()
    }

    /// Tears down routes and router pools. Stop the router checker first.
    pub fn shutdown(&self) -> TransportResult<()> {
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            if state.shutting_down {
                return Ok(());
            }
            state.shutting_down = true;
            state.routes.destroy_routes(&mut state.peers);
            self.reap_peers(&mut state.peers);
        }
        if self.pools.is_routing() {
            self.pools.free()?;
        }
        info!("network context shut down");
        Ok(())
    }

    /// True once [`Lnet::shutdown`] has run.
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}
