//! Gateway health checking.
//!
//! A background task pings every gateway on a schedule that depends on
//! whether the gateway is believed alive. A ping is a GET of the
//! gateway's ping payload into a per-gateway buffer (the RCD). The reply
//! marks the gateway alive, a failed ping or a missed deadline marks it
//! dead. With `avoid_asym_router_failure` the payload is also parsed for
//! per-route down interfaces, which steer gateway selection without
//! touching liveness.
//!
//! An RCD outlives the gateway's router status: when the last route
//! through a gateway goes, its RCD moves to deathrow, then to zombie once
//! unlinking has started, and is freed when the unlink event arrives.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::event::{EventTag, EventTarget};
use crate::lnet::Lnet;
use crate::ni::{EventKind, MdHandle, MdOptions, MemoryDescriptor, NetEvent, Region, SendTarget, Threshold};
use crate::nid::{Nid, ProcessId};
use crate::peer::Peer;
use crate::ping::{parse_rc_info, PingInfo, PingVersion, PING_INFO_SIZE, PING_MATCHBITS, RESERVED_PORTAL};

/// Identifier of a ping buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RcdId(pub u64);

/// Lifecycle of a ping buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RcdStage {
    /// Attached to its gateway.
    Active,
    /// Detached, waiting to be unlinked.
    Deathrow,
    /// Unlink issued, waiting for the unlink event.
    Zombie,
}

/// Per-gateway ping buffer.
#[derive(Debug, Clone)]
pub(crate) struct RouterCheckData {
    pub(crate) gateway: Nid,
    pub(crate) ni: usize,
    pub(crate) md: Option<MdHandle>,
    pub(crate) tag: Option<EventTag>,
    pub(crate) region: Region,
    pub(crate) stage: RcdStage,
}

/// Router checker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckerState {
    /// Not running.
    Shutdown,
    /// Sweeping.
    Running,
    /// Asked to stop; finishing the final prune.
    Stopping,
}

/// Health-check view of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayState {
    /// No report yet.
    Unknown,
    /// Ping outstanding.
    AwaitingReply,
    /// Last report said alive.
    Alive,
    /// Last report said dead.
    Dead,
}

impl GatewayState {
    pub(crate) fn of(peer: &Peer) -> Self {
        if peer.ping_deadline.is_some() {
            return GatewayState::AwaitingReply;
        }
        match (peer.alive_count, peer.alive) {
            (0, _) => GatewayState::Unknown,
            (_, true) => GatewayState::Alive,
            (_, false) => GatewayState::Dead,
        }
    }
}

/// Handles an event on a ping buffer.
pub(crate) fn checker_event(lnet: &Lnet, id: RcdId, ev: &NetEvent) -> TransportResult<()> {
    let now = Instant::now();
    let mut guard = lnet.state.lock();
    let state = &mut *guard;

    let Some(rcd) = state.peers.rcd_mut(id) else {
        return Err(TransportError::ProtocolViolation(format!(
            "{:?} event for freed ping buffer {:?}",
            ev.kind, id
        )));
    };

    if ev.unlinked {
        rcd.md = None;
        drop(guard);
        lnet.rcd_unlinked.notify_waiters();
        return Ok(());
    }

    if !matches!(ev.kind, EventKind::Send | EventKind::Reply) {
        return Err(TransportError::ProtocolViolation(format!(
            "unexpected {:?} event on ping buffer {:?}",
            ev.kind, id
        )));
    }

    let gateway = rcd.gateway;
    let region = rcd.region.clone();
    let Some(peer) = state.peers.find_mut(gateway) else {
        return Ok(());
    };
    // the gateway stopped being a router or got a new buffer
    if !peer.is_router() || peer.rcd != Some(id) {
        return Ok(());
    }

    if ev.kind == EventKind::Send {
        peer.ping_notsent = false;
        if ev.ok() {
            return Ok(());
        }
    }

    // any failed exchange means the gateway is down
    state.peers.notify_locked(gateway, true, ev.ok(), now);
    debug!(gateway = %gateway, alive = ev.ok(), kind = ?ev.kind, "ping completed");

    if lnet.config().router.avoid_asym_router_failure && ev.ok() {
        apply_rc_info(state, gateway, &region);
    }
    Ok(())
}

fn apply_rc_info(state: &mut crate::lnet::NetState, gateway: Nid, region: &Region) {
    let Some(peer) = state.peers.find_mut(gateway) else {
        return;
    };
    if !peer.alive {
        return;
    }
    let info = match PingInfo::decode(&region.to_vec()) {
        Ok(info) => info,
        Err(e) => {
            debug!(gateway = %gateway, error = %e, "undecodable ping info");
            peer.ping_version = PingVersion::Unknown;
            return;
        }
    };
    let nets = peer.routes.clone();
    let parsed = parse_rc_info(&info, &nets);
    peer.ping_version = parsed.version;
    if parsed.version == PingVersion::Unknown {
        debug!(gateway = %gateway, magic = info.magic, version = info.version, "unusable ping info");
    }
    if let Some(downis) = parsed.downis {
        for (net, n) in nets.into_iter().zip(downis) {
            state.routes.set_downis(gateway, net, n);
        }
    }
}

/// Background gateway pinger.
#[derive(Clone)]
pub struct RouterChecker {
    lnet: Arc<Lnet>,
    wake: Arc<Notify>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RouterChecker {
    /// Checker for `lnet`; call [`RouterChecker::start`] to run it.
    pub fn new(lnet: Arc<Lnet>) -> Self {
        Self {
            lnet,
            wake: Arc::new(Notify::new()),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CheckerState {
        self.lnet.checker_state()
    }

    /// Starts the sweep task.
    ///
    /// Nothing runs when the node does not route and both ping intervals
    /// are disabled. With `check_routers_before_use`, returns only once
    /// every gateway's state is known.
    pub async fn start(&self) -> TransportResult<()> {
        let cfg = &self.lnet.config().router;
        if cfg.check_routers_before_use && cfg.dead_router_check_interval <= 0 {
            return Err(TransportError::InvalidConfig(
                "'dead_router_check_interval' must be set if 'check_routers_before_use' is set"
                    .to_string(),
            ));
        }
        if !self.lnet.is_routing()
            && cfg.live_router_check_interval <= 0
            && cfg.dead_router_check_interval <= 0
        {
            debug!("router checker not needed");
            return Ok(());
        }

        {
            let mut state = self.lnet.state.lock();
            if state.rc_state != CheckerState::Shutdown {
                return Err(TransportError::Busy("router checker already running".to_string()));
            }
            state.rc_state = CheckerState::Running;
        }

        let checker = self.clone();
        *self.task.lock() = Some(tokio::spawn(async move { checker.run().await }));
        info!(
            live_interval = cfg.live_router_check_interval,
            dead_interval = cfg.dead_router_check_interval,
            "router checker started"
        );

        if cfg.check_routers_before_use {
            self.wait_known_routerstate().await;
        }
        Ok(())
    }

    /// Stops the sweep task and waits for its final prune.
    pub async fn stop(&self) {
        {
            let mut state = self.lnet.state.lock();
            if state.rc_state == CheckerState::Shutdown {
                return;
            }
            state.rc_state = CheckerState::Stopping;
        }
        self.wake.notify_one();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "router checker task failed");
                self.lnet.state.lock().rc_state = CheckerState::Shutdown;
            }
        }
        info!("router checker stopped");
    }

    async fn run(&self) {
        let tick = self.lnet.config().router.checker_tick();
        loop {
            if self.lnet.checker_state() != CheckerState::Running {
                break;
            }
            self.sweep_once();
            self.prune_rc_data(false).await;

            tokio::select! {
                _ = sleep(tick) => {}
                _ = self.wake.notified() => {}
            }
        }

        self.prune_rc_data(true).await;
        self.lnet.state.lock().rc_state = CheckerState::Shutdown;
    }

    /// One pass over the gateways. Restarts whenever the router list changes.
    pub fn sweep_once(&self) {
        'rescan: loop {
            let (routers, version) = {
                let state = self.lnet.state.lock();
                (state.peers.routers().to_vec(), state.peers.routers_version())
            };
            for nid in routers {
                self.ping_router(nid);
                if self.lnet.state.lock().peers.routers_version() != version {
                    continue 'rescan;
                }
            }
            break;
        }

        if self.lnet.is_routing() {
            self.update_ni_status();
        }
    }

    /// Pings one gateway if its interval has elapsed and no ping is
    /// outstanding. Also expires a missed deadline and delivers pending
    /// liveness changes.
    pub fn ping_router(&self, nid: Nid) {
        let lnet = &self.lnet;
        let now = Instant::now();

        {
            let mut state = lnet.state.lock();
            let Some(peer) = state.peers.find(nid) else {
                return;
            };
            let expired = peer.ping_deadline.map_or(false, |deadline| now > deadline);
            state.peers.addref(nid);
            if expired {
                debug!(gateway = %nid, "ping deadline passed");
                state.peers.notify_locked(nid, true, false, now);
            }
        }

        lnet.deliver_notifications(nid);
        self.send_ping(nid, now);

        let mut state = lnet.state.lock();
        state.peers.decref(nid);
        lnet.reap_peers(&mut state.peers);
    }

    fn send_ping(&self, nid: Nid, now: Instant) {
        let lnet = &self.lnet;
        let cfg = &lnet.config().router;

        let existing = {
            let state = lnet.state.lock();
            let Some(peer) = state.peers.find(nid) else {
                return;
            };
            if !peer.is_router() || state.rc_state != CheckerState::Running {
                return;
            }
            peer.rcd
        };
        let Some(id) = existing.or_else(|| self.create_rcd(nid)) else {
            return;
        };

        let (md, ni) = {
            let mut state = lnet.state.lock();
            let state = &mut *state;
            let Some(rcd) = state.peers.rcd(id) else {
                return;
            };
            let (Some(md), ni) = (rcd.md, rcd.ni) else {
                return;
            };
            let Some(peer) = state.peers.find_mut(nid) else {
                return;
            };
            let interval = cfg.check_interval(peer.alive);
            let due = peer
                .ping_timestamp
                .map_or(true, |ts| now > ts + interval);
            if interval.is_zero() || peer.ping_notsent || !due {
                return;
            }
            peer.ping_notsent = true;
            peer.ping_timestamp = Some(now);
            if peer.ping_deadline.is_none() {
                peer.ping_deadline = Some(now + cfg.ping_timeout());
            }
            (md, ni)
        };

        let to = SendTarget::direct(ProcessId::server(nid));
        let issued = lnet
            .driver(ni)
            .and_then(|driver| driver.get(md, to, RESERVED_PORTAL, PING_MATCHBITS));
        match issued {
            Ok(()) => {
                lnet.metrics().inc_pings_sent();
                debug!(gateway = %nid, "ping sent");
            }
            Err(e) => {
                debug!(gateway = %nid, error = %e, "ping not sent");
                if let Some(peer) = lnet.state.lock().peers.find_mut(nid) {
                    peer.ping_notsent = false;
                }
            }
        }
    }

    /// Binds a ping buffer for `nid` and attaches it, unless another
    /// one got there first. Returns the buffer the gateway ends up with.
    fn create_rcd(&self, nid: Nid) -> Option<RcdId> {
        let lnet = &self.lnet;
        let ni = lnet.state.lock().peers.find(nid)?.ni;
        let id = RcdId(lnet.next_rcd());
        let region = Region::zeroed(PING_INFO_SIZE);
        let tag = lnet.events.register(EventTarget::RouterCheck(id));
        let md = MemoryDescriptor {
            region: region.clone(),
            threshold: Threshold::Infinite,
            options: MdOptions {
                truncate: true,
                ..Default::default()
            },
            user: tag,
        };

        let bound = lnet.driver(ni).and_then(|driver| driver.md_bind(md));
        let handle = match bound {
            Ok(handle) => handle,
            Err(e) => {
                warn!(gateway = %nid, error = %e, "cannot bind ping buffer");
                lnet.events.release(tag);
                return None;
            }
        };

        let mut state = lnet.state.lock();
        let installed = state.peers.install_rcd(
            id,
            RouterCheckData {
                gateway: nid,
                ni,
                md: Some(handle),
                tag: Some(tag),
                region,
                stage: RcdStage::Active,
            },
        );
        if installed {
            debug!(gateway = %nid, rcd = id.0, "ping buffer attached");
            Some(id)
        } else {
            state.peers.find(nid).and_then(|p| p.rcd)
        }
    }

    /// Unlinks and frees detached ping buffers.
    ///
    /// Once the checker is no longer running every gateway's buffer is
    /// detached first. With `wait`, keeps going until all of them are
    /// gone, warning at power-of-two iterations.
    pub async fn prune_rc_data(&self, wait: bool) {
        let lnet = &self.lnet;
        let doomed = {
            let mut state = lnet.state.lock();
            let running = state.rc_state == CheckerState::Running;
            if running && state.peers.nothing_to_prune() {
                return;
            }
            if !running {
                state.peers.retire_all_rcds();
            }
            state.peers.drain_deathrow()
        };

        for (id, rcd) in doomed {
            let Some(md) = rcd.md else {
                continue;
            };
            let unlinked = lnet.driver(rcd.ni).and_then(|driver| driver.md_unlink(md));
            if let Err(e) = unlinked {
                debug!(rcd = id.0, error = %e, "ping buffer already unlinking");
            }
        }

        let pause = lnet.config().router.rcd_prune_pause();
        let mut i: u64 = 0;
        loop {
            let notified = lnet.rcd_unlinked.notified();
            let remaining = lnet.state.lock().peers.free_unlinked_zombies();
            if !wait || remaining == 0 {
                break;
            }
            i += 1;
            if i.is_power_of_two() {
                warn!(remaining, iteration = i, "waiting for ping buffers to unlink");
            } else {
                debug!(remaining, iteration = i, "waiting for ping buffers to unlink");
            }
            let _ = timeout(pause, notified).await;
        }
    }

    /// Waits until every gateway has been reported on at least once.
    ///
    /// Gives up once a dead gateway's check interval plus a ping timeout
    /// has passed, which covers gateways that cannot be pinged at all.
    /// Returns whether every state is known.
    pub async fn wait_known_routerstate(&self) -> bool {
        let cfg = &self.lnet.config().router;
        let tick = cfg.checker_tick();
        let limit = cfg.check_interval(false) + cfg.ping_timeout() + tick;
        let deadline = Instant::now() + limit;
        loop {
            let unknown = {
                let state = self.lnet.state.lock();
                state
                    .peers
                    .routers()
                    .iter()
                    .filter(|nid| state.peers.find(**nid).map_or(false, |p| p.alive_count == 0))
                    .count()
            };
            if unknown == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    unknown,
                    waited_secs = limit.as_secs(),
                    "gateway states still unknown, continuing without them"
                );
                return false;
            }
            sleep(tick).await;
        }
    }

    /// Marks local interfaces down when nothing has been received on them
    /// for longer than a ping could take.
    pub fn update_ni_status(&self) {
        let now = Instant::now();
        let silence: Duration = self.lnet.config().router.ni_status_timeout();
        let mut state = self.lnet.state.lock();
        for ni in state.nis.iter_mut() {
            if ni.nid.is_loopback() || !ni.up {
                continue;
            }
            if now >= ni.last_alive + silence {
                warn!(ni = %ni.nid, silent_secs = silence.as_secs(), "interface marked down");
                ni.up = false;
            }
        }
    }
}
