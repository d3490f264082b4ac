//! In-process network fabric.
//!
//! [`SimFabric`] connects any number of endpoints inside one process and
//! implements [`NetworkInterface`] for each of them. Puts and gets copy
//! bytes between regions, match on portal, match bits and initiator, and
//! honour MD thresholds, so every binding ends with exactly one unlinked
//! event. Gateways are transparent: a message whose next hop is a known,
//! reachable node is delivered straight to its target.
//!
//! Fault injection: [`SimFabric::fail_sends_to`] makes issuing fail,
//! [`SimFabric::blackhole`] accepts traffic and never answers, and
//! [`SimFabric::limit_bindings`] makes binding fail with `NoSpace`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{TransportError, TransportResult};
use crate::ni::{
    AckRequest, EventError, EventKind, MdHandle, MemoryDescriptor, NetEvent, NetworkInterface,
    NiTunables, SendTarget, Threshold,
};
use crate::nid::{Nid, ProcessId};
use crate::ping::{PingInfo, PING_MATCHBITS, RESERVED_PORTAL};

/// A recorded liveness callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerNotification {
    /// Interface the callback was delivered to.
    pub reporter: Nid,
    /// Peer the callback is about.
    pub peer: Nid,
    /// Reported state.
    pub alive: bool,
}

struct BoundMd {
    md: MemoryDescriptor,
    remaining: Option<u32>,
    offset: usize,
}

struct MatchEntry {
    portal: u32,
    match_id: Option<Nid>,
    match_bits: u64,
    ignore_bits: u64,
    handle: MdHandle,
}

struct Endpoint {
    nid: Nid,
    events: Option<mpsc::UnboundedSender<NetEvent>>,
    mds: HashMap<MdHandle, BoundMd>,
    entries: Vec<MatchEntry>,
    binding_limit: Option<usize>,
}

struct Completion {
    kind: EventKind,
    initiator: ProcessId,
    status: Result<(), EventError>,
    mlength: usize,
    rlength: usize,
    offset: usize,
    match_bits: u64,
    force_unlink: bool,
}

impl Endpoint {
    fn new(nid: Nid, events: Option<mpsc::UnboundedSender<NetEvent>>) -> Self {
        Self {
            nid,
            events,
            mds: HashMap::new(),
            entries: Vec::new(),
            binding_limit: None,
        }
    }

    fn emit(&self, event: NetEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                trace!(nid = %self.nid, "event receiver gone, dropping event");
            }
        }
    }

    /// Consumes one operation of `handle` and emits its event.
    fn complete(&mut self, handle: MdHandle, c: Completion) {
        let Some(bound) = self.mds.get_mut(&handle) else {
            return;
        };
        let exhausted = match &mut bound.remaining {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        let unlinked = exhausted || c.force_unlink;
        let tag = bound.md.user;
        if unlinked {
            self.mds.remove(&handle);
            self.entries.retain(|e| e.handle != handle);
        }
        self.emit(NetEvent {
            kind: c.kind,
            tag,
            md: handle,
            ni: self.nid,
            initiator: c.initiator,
            status: c.status,
            mlength: c.mlength,
            rlength: c.rlength,
            offset: c.offset,
            match_bits: c.match_bits,
            unlinked,
        });
    }

    fn find_entry(&self, from: Nid, portal: u32, match_bits: u64, put: bool, len: usize) -> Option<MdHandle> {
        self.entries
            .iter()
            .filter(|e| {
                e.portal == portal
                    && (e.match_bits ^ match_bits) & !e.ignore_bits == 0
                    && e.match_id.map_or(true, |id| id == from)
            })
            .find(|e| {
                self.mds.get(&e.handle).map_or(false, |b| {
                    let opts = b.md.options;
                    if put {
                        let space = b.md.region.len().saturating_sub(b.offset);
                        opts.op_put && (len <= space || opts.truncate)
                    } else {
                        opts.op_get
                    }
                })
            })
            .map(|e| e.handle)
    }

    fn deliver_put(&mut self, from: Nid, portal: u32, match_bits: u64, data: &[u8]) -> bool {
        let Some(handle) = self.find_entry(from, portal, match_bits, true, data.len()) else {
            debug!(nid = %self.nid, from = %from, portal, match_bits, "put dropped: no match");
            return false;
        };
        let Some(bound) = self.mds.get_mut(&handle) else {
            return false;
        };
        let offset = bound.offset;
        let space = bound.md.region.len().saturating_sub(offset);
        let mlength = data.len().min(space);
        bound.md.region.write(offset, &data[..mlength]);
        bound.offset += mlength;
        let full = bound
            .md
            .options
            .max_size
            .map_or(false, |max| bound.md.region.len().saturating_sub(bound.offset) < max);

        self.complete(
            handle,
            Completion {
                kind: EventKind::Put,
                initiator: ProcessId::server(from),
                status: Ok(()),
                mlength,
                rlength: data.len(),
                offset,
                match_bits,
                force_unlink: full,
            },
        );
        true
    }

    fn serve_get(&mut self, from: Nid, portal: u32, match_bits: u64, wanted: usize) -> Option<Vec<u8>> {
        let handle = self.find_entry(from, portal, match_bits, false, wanted)?;
        let data = {
            let bound = self.mds.get(&handle)?;
            bound.md.region.read(0, wanted)
        };
        self.complete(
            handle,
            Completion {
                kind: EventKind::Get,
                initiator: ProcessId::server(from),
                status: Ok(()),
                mlength: data.len(),
                rlength: wanted,
                offset: 0,
                match_bits,
                force_unlink: false,
            },
        );
        Some(data)
    }
}

#[derive(Default)]
struct FabricState {
    next_md: u64,
    endpoints: HashMap<Nid, Endpoint>,
    failing: HashSet<Nid>,
    blackholed: HashSet<Nid>,
    ping_replies: HashMap<Nid, Vec<u8>>,
    notifications: Vec<PeerNotification>,
}

impl FabricState {
    fn endpoint_mut(&mut self, nid: Nid) -> TransportResult<&mut Endpoint> {
        self.endpoints
            .get_mut(&nid)
            .ok_or_else(|| TransportError::NotFound(format!("no endpoint {}", nid)))
    }

    fn check_issue(&self, from: Nid, md: MdHandle, to: &SendTarget, match_bits: u64) -> TransportResult<()> {
        let ep = self
            .endpoints
            .get(&from)
            .ok_or_else(|| TransportError::NotFound(format!("no endpoint {}", from)))?;
        if !ep.mds.contains_key(&md) {
            return Err(TransportError::NotFound(format!("md {:?} on {}", md, from)));
        }
        if self.failing.contains(&to.next_hop) || self.failing.contains(&to.target.nid) {
            return Err(TransportError::NetworkError {
                xid: match_bits,
                reason: format!("send to {} via {} refused", to.target, to.next_hop),
            });
        }
        Ok(())
    }

    fn dropped(&self, to: &SendTarget) -> bool {
        self.blackholed.contains(&to.next_hop)
            || self.blackholed.contains(&to.target.nid)
            || !self.endpoints.contains_key(&to.next_hop)
    }

    fn bind(&mut self, nid: Nid, md: MemoryDescriptor) -> TransportResult<MdHandle> {
        let remaining = match md.threshold {
            Threshold::Count(0) => {
                return Err(TransportError::InvalidArgument("zero md threshold".to_string()))
            }
            Threshold::Count(n) => Some(n),
            Threshold::Infinite => None,
        };
        self.next_md += 1;
        let handle = MdHandle(self.next_md);
        let ep = self.endpoint_mut(nid)?;
        if ep.binding_limit.map_or(false, |limit| ep.mds.len() >= limit) {
            return Err(TransportError::NoSpace(nid));
        }
        ep.mds.insert(
            handle,
            BoundMd {
                md,
                remaining,
                offset: 0,
            },
        );
        Ok(handle)
    }
}

/// Shared in-process fabric. Cloning shares the same fabric.
#[derive(Clone, Default)]
pub struct SimFabric {
    state: Arc<Mutex<FabricState>>,
}

impl SimFabric {
    /// Empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an endpoint whose events go to the returned receiver.
    pub fn attach(&self, nid: Nid) -> (Arc<SimNi>, mpsc::UnboundedReceiver<NetEvent>) {
        self.attach_with_tunables(nid, NiTunables::default())
    }

    /// Attaches an endpoint with explicit tunables.
    pub fn attach_with_tunables(
        &self,
        nid: Nid,
        tunables: NiTunables,
    ) -> (Arc<SimNi>, mpsc::UnboundedReceiver<NetEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().endpoints.insert(nid, Endpoint::new(nid, Some(tx)));
        let ni = Arc::new(SimNi {
            nid,
            tunables,
            fabric: self.clone(),
        });
        (ni, rx)
    }

    /// Adds a passive node (a gateway or a host that only answers pings).
    pub fn add_node(&self, nid: Nid) {
        self.state
            .lock()
            .endpoints
            .entry(nid)
            .or_insert_with(|| Endpoint::new(nid, None));
    }

    /// Answers pings sent to `nid` with `info`.
    pub fn serve_ping(&self, nid: Nid, info: &PingInfo) {
        self.serve_ping_bytes(nid, info.encode());
    }

    /// Answers pings sent to `nid` with a raw payload.
    pub fn serve_ping_bytes(&self, nid: Nid, payload: Vec<u8>) {
        let mut state = self.state.lock();
        state.endpoints.entry(nid).or_insert_with(|| Endpoint::new(nid, None));
        state.ping_replies.insert(nid, payload);
    }

    /// Makes every put/get toward or via `nid` fail when issued.
    pub fn fail_sends_to(&self, nid: Nid) {
        self.state.lock().failing.insert(nid);
    }

    /// Accepts traffic toward or via `nid` but never delivers or answers it.
    pub fn blackhole(&self, nid: Nid) {
        self.state.lock().blackholed.insert(nid);
    }

    /// Clears injected faults for `nid`.
    pub fn heal(&self, nid: Nid) {
        let mut state = self.state.lock();
        state.failing.remove(&nid);
        state.blackholed.remove(&nid);
    }

    /// Caps the bindings `nid` may hold; further binds return `NoSpace`.
    pub fn limit_bindings(&self, nid: Nid, limit: Option<usize>) {
        if let Some(ep) = self.state.lock().endpoints.get_mut(&nid) {
            ep.binding_limit = limit;
        }
    }

    /// Liveness callbacks delivered so far, oldest first.
    pub fn notifications(&self) -> Vec<PeerNotification> {
        self.state.lock().notifications.clone()
    }

    /// Bindings `nid` currently holds.
    pub fn bound_mds(&self, nid: Nid) -> usize {
        self.state
            .lock()
            .endpoints
            .get(&nid)
            .map_or(0, |ep| ep.mds.len())
    }

    fn put(
        &self,
        from: Nid,
        md: MdHandle,
        ack: AckRequest,
        to: SendTarget,
        portal: u32,
        match_bits: u64,
    ) -> TransportResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_issue(from, md, &to, match_bits)?;

        let data = state
            .endpoints
            .get(&from)
            .and_then(|ep| ep.mds.get(&md))
            .map(|b| b.md.region.to_vec())
            .unwrap_or_default();

        let mut delivered = false;
        if !state.dropped(&to) {
            if let Some(dst) = state.endpoints.get_mut(&to.target.nid) {
                delivered = dst.deliver_put(from, portal, match_bits, &data);
            }
        }

        let src = state.endpoint_mut(from)?;
        src.complete(
            md,
            Completion {
                kind: EventKind::Send,
                initiator: to.target,
                status: Ok(()),
                mlength: data.len(),
                rlength: data.len(),
                offset: 0,
                match_bits,
                force_unlink: false,
            },
        );
        if delivered && ack == AckRequest::Ack {
            src.complete(
                md,
                Completion {
                    kind: EventKind::Ack,
                    initiator: to.target,
                    status: Ok(()),
                    mlength: data.len(),
                    rlength: data.len(),
                    offset: 0,
                    match_bits,
                    force_unlink: false,
                },
            );
        }
        Ok(())
    }

    fn get(&self, from: Nid, md: MdHandle, to: SendTarget, portal: u32, match_bits: u64) -> TransportResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_issue(from, md, &to, match_bits)?;

        let (wanted, region) = match state.endpoints.get(&from).and_then(|ep| ep.mds.get(&md)) {
            Some(b) => (b.md.region.len(), b.md.region.clone()),
            None => return Err(TransportError::NotFound(format!("md {:?} on {}", md, from))),
        };

        let mut reply = None;
        if !state.dropped(&to) {
            if portal == RESERVED_PORTAL && match_bits == PING_MATCHBITS {
                reply = state.ping_replies.get(&to.target.nid).cloned();
            }
            if reply.is_none() {
                if let Some(dst) = state.endpoints.get_mut(&to.target.nid) {
                    reply = dst.serve_get(from, portal, match_bits, wanted);
                }
            }
        }

        let src = state.endpoint_mut(from)?;
        src.complete(
            md,
            Completion {
                kind: EventKind::Send,
                initiator: to.target,
                status: Ok(()),
                mlength: 0,
                rlength: 0,
                offset: 0,
                match_bits,
                force_unlink: false,
            },
        );
        if let Some(data) = reply {
            let mlength = region.write(0, &data);
            src.complete(
                md,
                Completion {
                    kind: EventKind::Reply,
                    initiator: to.target,
                    status: Ok(()),
                    mlength,
                    rlength: data.len(),
                    offset: 0,
                    match_bits,
                    force_unlink: false,
                },
            );
        }
        Ok(())
    }

    fn unlink(&self, nid: Nid, handle: MdHandle) -> TransportResult<()> {
        let mut state = self.state.lock();
        let ep = state.endpoint_mut(nid)?;
        let bound = ep
            .mds
            .remove(&handle)
            .ok_or_else(|| TransportError::NotFound(format!("md {:?} on {}", handle, nid)))?;
        ep.entries.retain(|e| e.handle != handle);
        ep.emit(NetEvent {
            kind: EventKind::Unlink,
            tag: bound.md.user,
            md: handle,
            ni: nid,
            initiator: ProcessId::server(nid),
            status: Err(EventError::Canceled),
            mlength: 0,
            rlength: 0,
            offset: bound.offset,
            match_bits: 0,
            unlinked: true,
        });
        Ok(())
    }
}

/// One endpoint of a [`SimFabric`].
pub struct SimNi {
    nid: Nid,
    tunables: NiTunables,
    fabric: SimFabric,
}

impl NetworkInterface for SimNi {
    fn nid(&self) -> Nid {
        self.nid
    }

    fn tunables(&self) -> NiTunables {
        self.tunables
    }

    fn md_bind(&self, md: MemoryDescriptor) -> TransportResult<MdHandle> {
        self.fabric.state.lock().bind(self.nid, md)
    }

    fn me_attach(
        &self,
        portal: u32,
        match_id: Option<Nid>,
        match_bits: u64,
        ignore_bits: u64,
        md: MemoryDescriptor,
    ) -> TransportResult<MdHandle> {
        let mut state = self.fabric.state.lock();
        let handle = state.bind(self.nid, md)?;
        state.endpoint_mut(self.nid)?.entries.push(MatchEntry {
            portal,
            match_id,
            match_bits,
            ignore_bits,
            handle,
        });
        Ok(handle)
    }

    fn md_unlink(&self, md: MdHandle) -> TransportResult<()> {
        self.fabric.unlink(self.nid, md)
    }

    fn put(
        &self,
        md: MdHandle,
        ack: AckRequest,
        to: SendTarget,
        portal: u32,
        match_bits: u64,
    ) -> TransportResult<()> {
        self.fabric.put(self.nid, md, ack, to, portal, match_bits)
    }

    fn get(&self, md: MdHandle, to: SendTarget, portal: u32, match_bits: u64) -> TransportResult<()> {
        self.fabric.get(self.nid, md, to, portal, match_bits)
    }

    fn notify_peer(&self, peer: Nid, alive: bool) {
        self.fabric.state.lock().notifications.push(PeerNotification {
            reporter: self.nid,
            peer,
            alive,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTag;
    use crate::ni::{MdOptions, Region};
    use crate::nid::{NetId, NetKind};

    fn nid(addr: u32) -> Nid {
        Nid::new(NetId::new(NetKind::Sim, 0), addr)
    }

    fn md(region: Region, threshold: Threshold, options: MdOptions, tag: u64) -> MemoryDescriptor {
        MemoryDescriptor {
            region,
            threshold,
            options,
            user: EventTag(tag),
        }
    }

    fn sink() -> MdOptions {
        MdOptions {
            op_put: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_put_matches_and_acks() {
        let fabric = SimFabric::new();
        let (a, mut a_rx) = fabric.attach(nid(1));
        let (b, mut b_rx) = fabric.attach(nid(2));

        let target = Region::zeroed(8);
        b.me_attach(4, None, 77, 0, md(target.clone(), Threshold::Count(1), sink(), 10))
            .unwrap();
        let h = a
            .md_bind(md(Region::from_bytes(b"hello"), Threshold::Count(2), MdOptions::default(), 20))
            .unwrap();
        a.put(h, AckRequest::Ack, SendTarget::direct(ProcessId::server(nid(2))), 4, 77)
            .unwrap();

        let put = b_rx.try_recv().unwrap();
        assert_eq!(put.kind, EventKind::Put);
        assert_eq!(put.tag, EventTag(10));
        assert_eq!(put.mlength, 5);
        assert!(put.unlinked);
        assert_eq!(target.read(0, 5), b"hello".to_vec());

        let send = a_rx.try_recv().unwrap();
        assert_eq!(send.kind, EventKind::Send);
        assert!(!send.unlinked);
        let ack = a_rx.try_recv().unwrap();
        assert_eq!(ack.kind, EventKind::Ack);
        assert!(ack.unlinked);
        assert_eq!(fabric.bound_mds(nid(1)), 0);
        assert_eq!(fabric.bound_mds(nid(2)), 0);
    }

    #[test]
    fn test_unmatched_put_sends_without_ack() {
        let fabric = SimFabric::new();
        let (a, mut a_rx) = fabric.attach(nid(1));
        let (_b, mut b_rx) = fabric.attach(nid(2));

        let h = a
            .md_bind(md(Region::from_bytes(b"x"), Threshold::Count(2), MdOptions::default(), 1))
            .unwrap();
        a.put(h, AckRequest::Ack, SendTarget::direct(ProcessId::server(nid(2))), 4, 1)
            .unwrap();
        assert_eq!(a_rx.try_recv().unwrap().kind, EventKind::Send);
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());

        a.md_unlink(h).unwrap();
        let unlink = a_rx.try_recv().unwrap();
        assert_eq!(unlink.kind, EventKind::Unlink);
        assert!(unlink.unlinked);
        assert!(matches!(a.md_unlink(h), Err(TransportError::NotFound(_))));
    }

    #[test]
    fn test_request_buffer_unlinks_when_full() {
        let fabric = SimFabric::new();
        let (a, _a_rx) = fabric.attach(nid(1));
        let (b, mut b_rx) = fabric.attach(nid(2));

        let opts = MdOptions {
            op_put: true,
            max_size: Some(4),
            ..Default::default()
        };
        b.me_attach(4, None, 0, !0, md(Region::zeroed(10), Threshold::Infinite, opts, 5))
            .unwrap();

        for _ in 0..2 {
            let h = a
                .md_bind(md(Region::from_bytes(b"abcd"), Threshold::Count(1), MdOptions::default(), 6))
                .unwrap();
            a.put(h, AckRequest::NoAck, SendTarget::direct(ProcessId::server(nid(2))), 4, 0)
                .unwrap();
        }
        let first = b_rx.try_recv().unwrap();
        assert_eq!(first.offset, 0);
        assert!(!first.unlinked);
        let second = b_rx.try_recv().unwrap();
        assert_eq!(second.offset, 4);
        assert!(second.unlinked);
    }

    #[test]
    fn test_get_reads_remote_region() {
        let fabric = SimFabric::new();
        let (a, mut a_rx) = fabric.attach(nid(1));
        let (b, mut b_rx) = fabric.attach(nid(2));

        let source = MdOptions {
            op_get: true,
            ..Default::default()
        };
        b.me_attach(8, Some(nid(1)), 3, 0, md(Region::from_bytes(b"data"), Threshold::Count(1), source, 1))
            .unwrap();
        let dst = Region::zeroed(4);
        let h = a
            .md_bind(md(dst.clone(), Threshold::Count(2), MdOptions::default(), 2))
            .unwrap();
        a.get(h, SendTarget::direct(ProcessId::server(nid(2))), 8, 3).unwrap();

        assert_eq!(b_rx.try_recv().unwrap().kind, EventKind::Get);
        assert_eq!(a_rx.try_recv().unwrap().kind, EventKind::Send);
        let reply = a_rx.try_recv().unwrap();
        assert_eq!(reply.kind, EventKind::Reply);
        assert!(reply.unlinked);
        assert_eq!(dst.to_vec(), b"data".to_vec());
    }

    #[test]
    fn test_faults() {
        let fabric = SimFabric::new();
        let (a, mut a_rx) = fabric.attach(nid(1));
        fabric.add_node(nid(3));
        fabric.serve_ping(nid(3), &PingInfo::new(1, vec![]));

        fabric.fail_sends_to(nid(3));
        let h = a
            .md_bind(md(Region::zeroed(16), Threshold::Infinite, MdOptions::default(), 1))
            .unwrap();
        let to = SendTarget::direct(ProcessId::server(nid(3)));
        assert!(a.get(h, to, RESERVED_PORTAL, PING_MATCHBITS).is_err());

        fabric.heal(nid(3));
        fabric.blackhole(nid(3));
        a.get(h, to, RESERVED_PORTAL, PING_MATCHBITS).unwrap();
        assert_eq!(a_rx.try_recv().unwrap().kind, EventKind::Send);
        assert!(a_rx.try_recv().is_err());

        fabric.limit_bindings(nid(1), Some(1));
        let err = a
            .md_bind(md(Region::zeroed(1), Threshold::Count(1), MdOptions::default(), 2))
            .unwrap_err();
        assert!(matches!(err, TransportError::NoSpace(_)));
    }

    #[test]
    fn test_notifications_recorded() {
        let fabric = SimFabric::new();
        let (a, _rx) = fabric.attach(nid(1));
        a.notify_peer(nid(9), false);
        assert_eq!(
            fabric.notifications(),
            vec![PeerNotification {
                reporter: nid(1),
                peer: nid(9),
                alive: false
            }]
        );
    }
}
