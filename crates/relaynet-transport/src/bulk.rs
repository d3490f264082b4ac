//! Bulk data transfers.
//!
//! Bulk moves large payloads outside the request/reply messages, matched
//! on the bulk portal by the parent request's xid. The client side
//! registers a passive descriptor (`PutSink` or `GetSource`) before it
//! sends the request; the server side runs the active half (`PutSource`
//! or `GetSink`) while handling it.
//!
//! Active descriptors finish after two events (SEND, then ACK or REPLY),
//! passive ones after one (PUT or GET). Aborting waits for the network to
//! let go of the memory and never gives up.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};
use crate::event::EventTarget;
use crate::lnet::Lnet;
use crate::ni::{AckRequest, EventError, EventKind, MdHandle, MdOptions, MemoryDescriptor, NetEvent, Region, Threshold};
use crate::nid::ProcessId;

/// Which half of a transfer a descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkRole {
    /// Writes to the peer.
    PutSource,
    /// Receives the peer's write.
    PutSink,
    /// Serves the peer's read.
    GetSource,
    /// Reads from the peer.
    GetSink,
}

impl BulkRole {
    /// True for the side that issues the operation.
    pub fn is_active(self) -> bool {
        matches!(self, BulkRole::PutSource | BulkRole::GetSink)
    }
}

/// Passed to a descriptor's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkCompletion {
    /// Xid of the transfer.
    pub xid: u64,
    /// Terminal event reported success.
    pub success: bool,
    /// Bytes moved.
    pub nob: usize,
}

type Callback = Arc<dyn Fn(BulkCompletion) + Send + Sync>;

#[derive(Default)]
struct BulkState {
    network_rw: bool,
    success: bool,
    registered: bool,
    xid: u64,
    last_xid: u64,
    status: Option<EventError>,
    md: Option<(usize, MdHandle)>,
    nob_transferred: usize,
}

pub(crate) struct BulkShared {
    role: BulkRole,
    portal: u32,
    region: Region,
    state: Mutex<BulkState>,
    on_complete: Option<Callback>,
    notify: Notify,
}

/// A bulk transfer over a scatter/gather region. Clones share the transfer.
#[derive(Clone)]
pub struct BulkDescriptor {
    shared: Arc<BulkShared>,
}

impl std::fmt::Debug for BulkDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("BulkDescriptor")
            .field("role", &self.shared.role)
            .field("portal", &self.shared.portal)
            .field("nob", &self.shared.region.len())
            .field("xid", &st.xid)
            .field("network_rw", &st.network_rw)
            .field("success", &st.success)
            .finish()
    }
}

impl BulkDescriptor {
    /// Descriptor for `role` over `region` on `portal`.
    pub fn new(role: BulkRole, portal: u32, region: Region) -> Self {
        Self::build(role, portal, region, None)
    }

    /// Same as [`BulkDescriptor::new`], calling `f` when the transfer ends.
    pub fn with_callback<F>(role: BulkRole, portal: u32, region: Region, f: F) -> Self
    where
        F: Fn(BulkCompletion) + Send + Sync + 'static,
    {
        Self::build(role, portal, region, Some(Arc::new(f)))
    }

    fn build(role: BulkRole, portal: u32, region: Region, on_complete: Option<Callback>) -> Self {
        Self {
            shared: Arc::new(BulkShared {
                role,
                portal,
                region,
                state: Mutex::new(BulkState::default()),
                on_complete,
                notify: Notify::new(),
            }),
        }
    }

    /// Role.
    pub fn role(&self) -> BulkRole {
        self.shared.role
    }

    /// Portal.
    pub fn portal(&self) -> u32 {
        self.shared.portal
    }

    /// The memory being moved.
    pub fn region(&self) -> &Region {
        &self.shared.region
    }

    /// Bytes covered by the descriptor.
    pub fn nob(&self) -> usize {
        self.shared.region.len()
    }

    /// Xid of the current or last transfer.
    pub fn xid(&self) -> u64 {
        self.shared.state.lock().xid
    }

    /// The network may still be touching the memory.
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().network_rw
    }

    /// The last transfer completed successfully.
    pub fn success(&self) -> bool {
        self.shared.state.lock().success
    }

    /// Failure reported by the last transfer.
    pub fn status(&self) -> Option<EventError> {
        self.shared.state.lock().status.clone()
    }

    /// Bytes the last transfer moved.
    pub fn transferred(&self) -> usize {
        self.shared.state.lock().nob_transferred
    }

    /// Waits until the network is done with the descriptor. Returns
    /// whether the transfer succeeded.
    pub async fn wait_complete(&self, wait: Duration) -> TransportResult<bool> {
        let shared = &self.shared;
        let waited = timeout(wait, async {
            loop {
                let notified = shared.notify.notified();
                let finished = {
                    let st = shared.state.lock();
                    (!st.network_rw).then_some(st.success)
                };
                if let Some(success) = finished {
                    return success;
                }
                notified.await;
            }
        })
        .await;
        waited.map_err(|_| TransportError::Timeout {
            xid: self.xid(),
            timeout_ms: wait.as_millis() as u64,
        })
    }
}

/// Issues the active half of a transfer to `peer` under `xid`.
///
/// If the operation cannot be issued the MD is unlinked and the failure
/// arrives as its unlink event.
pub(crate) fn start_bulk_transfer(lnet: &Lnet, desc: &BulkDescriptor, peer: ProcessId, xid: u64) -> TransportResult<()> {
    let shared = &desc.shared;
    if !shared.role.is_active() {
        return Err(TransportError::InvalidArgument(format!(
            "{:?} descriptor cannot start a transfer",
            shared.role
        )));
    }
    let (ni, to) = lnet.resolve(peer)?;
    let driver = lnet.driver(ni)?;

    {
        let mut st = shared.state.lock();
        if st.network_rw {
            return Err(TransportError::Busy(format!("bulk {} still in flight", st.xid)));
        }
        st.xid = xid;
        st.success = false;
        st.status = None;
        st.nob_transferred = 0;
        st.network_rw = true;
    }

    let tag = lnet.events.register(EventTarget::Bulk(Arc::clone(shared)));
    let md = MemoryDescriptor {
        region: shared.region.clone(),
        threshold: Threshold::Count(2),
        options: MdOptions::default(),
        user: tag,
    };
    let handle = match driver.md_bind(md) {
        Ok(handle) => handle,
        Err(e) => {
            lnet.events.release(tag);
            shared.state.lock().network_rw = false;
            return Err(e);
        }
    };
    shared.state.lock().md = Some((ni, handle));

    let issued = match shared.role {
        BulkRole::PutSource => driver.put(handle, AckRequest::Ack, to, shared.portal, xid),
        _ => driver.get(handle, to, shared.portal, xid),
    };
    lnet.metrics().inc_bulk_started();
    if let Err(e) = issued {
        warn!(xid, peer = %peer, role = ?shared.role, error = %e, "bulk transfer not issued, unlinking");
        if let Err(e) = driver.md_unlink(handle) {
            debug!(xid, error = %e, "bulk unlink after failed issue");
        }
    } else {
        debug!(xid, peer = %peer, role = ?shared.role, nob = shared.region.len(), "bulk transfer started");
    }
    Ok(())
}

/// Exposes the passive half of a transfer for `peer` to hit under `xid`.
pub(crate) fn register_bulk(lnet: &Lnet, desc: &BulkDescriptor, peer: ProcessId, xid: u64) -> TransportResult<()> {
    let shared = &desc.shared;
    if shared.role.is_active() {
        return Err(TransportError::InvalidArgument(format!(
            "{:?} descriptor cannot be registered",
            shared.role
        )));
    }
    if shared.region.is_empty() {
        return Err(TransportError::InvalidArgument("empty bulk registration".to_string()));
    }
    let (ni, _) = lnet.resolve(peer)?;
    let driver = lnet.driver(ni)?;

    {
        let mut st = shared.state.lock();
        if st.network_rw {
            return Err(TransportError::Busy(format!("bulk {} still registered", st.xid)));
        }
        if st.registered && st.last_xid == xid {
            return Err(TransportError::ProtocolViolation(format!(
                "bulk re-registered with reused xid {}",
                xid
            )));
        }
        st.xid = xid;
        st.last_xid = xid;
        st.registered = true;
        st.success = false;
        st.status = None;
        st.nob_transferred = 0;
        st.network_rw = true;
    }

    let tag = lnet.events.register(EventTarget::Bulk(Arc::clone(shared)));
    let md = MemoryDescriptor {
        region: shared.region.clone(),
        threshold: Threshold::Count(1),
        options: MdOptions {
            op_put: shared.role == BulkRole::PutSink,
            op_get: shared.role == BulkRole::GetSource,
            ..Default::default()
        },
        user: tag,
    };
    match driver.me_attach(shared.portal, Some(peer.nid), xid, 0, md) {
        Ok(handle) => {
            let mut st = shared.state.lock();
            if st.network_rw {
                st.md = Some((ni, handle));
            }
            debug!(xid, peer = %peer, role = ?shared.role, nob = shared.region.len(), "bulk registered");
            Ok(())
        }
        Err(e) => {
            lnet.events.release(tag);
            shared.state.lock().network_rw = false;
            Err(e)
        }
    }
}

/// Unlinks the descriptor and waits until the network releases it.
async fn unlink_and_wait(lnet: &Lnet, desc: &BulkDescriptor) {
    let shared = &desc.shared;
    let wait = lnet.config().rpc.unlink_wait_timeout();
    let mut unlinked = false;
    loop {
        let notified = shared.notify.notified();
        let md = {
            let st = shared.state.lock();
            if !st.network_rw {
                return;
            }
            st.md
        };
        if !unlinked {
            if let Some((ni, handle)) = md {
                if let Err(e) = lnet.driver(ni).and_then(|d| d.md_unlink(handle)) {
                    debug!(xid = desc.xid(), error = %e, "bulk already finishing");
                }
                unlinked = true;
            }
        }
        if timeout(wait, notified).await.is_err() {
            warn!(
                xid = desc.xid(),
                waited_secs = wait.as_secs(),
                "still waiting for the network to release bulk memory"
            );
        }
    }
}

/// Server side abort.
pub(crate) async fn abort_bulk(lnet: &Lnet, desc: &BulkDescriptor) {
    unlink_and_wait(lnet, desc).await;
}

/// Client side teardown.
pub(crate) async fn unregister_bulk(lnet: &Lnet, desc: &BulkDescriptor) {
    unlink_and_wait(lnet, desc).await;
}

pub(crate) fn bulk_event(lnet: &Lnet, shared: &Arc<BulkShared>, ev: &NetEvent) -> TransportResult<()> {
    let expected = match shared.role {
        BulkRole::PutSource => matches!(ev.kind, EventKind::Send | EventKind::Ack),
        BulkRole::GetSink => matches!(ev.kind, EventKind::Send | EventKind::Reply),
        BulkRole::PutSink => ev.kind == EventKind::Put,
        BulkRole::GetSource => ev.kind == EventKind::Get,
    };
    if !expected && ev.kind != EventKind::Unlink {
        return Err(TransportError::ProtocolViolation(format!(
            "unexpected {:?} event on {:?} bulk",
            ev.kind, shared.role
        )));
    }

    let completion = {
        let mut st = shared.state.lock();
        if let Err(e) = &ev.status {
            st.status = Some(e.clone());
        } else if ev.kind != EventKind::Send {
            st.nob_transferred = ev.mlength;
        }
        if !ev.unlinked {
            return Ok(());
        }
        st.success = ev.ok() && st.status.is_none();
        st.network_rw = false;
        st.md = None;
        BulkCompletion {
            xid: st.xid,
            success: st.success,
            nob: st.nob_transferred,
        }
    };

    if completion.success {
        lnet.metrics().inc_bulk_completed();
    }
    debug!(xid = completion.xid, success = completion.success, nob = completion.nob, "bulk finished");
    shared.notify.notify_waiters();
    if let Some(callback) = &shared.on_complete {
        callback(completion);
    }
    Ok(())
}

/// Bulk operations bound to a network context.
#[derive(Clone)]
pub struct BulkChannel {
    lnet: Arc<Lnet>,
}

impl BulkChannel {
    /// Channel over `lnet`.
    pub fn new(lnet: Arc<Lnet>) -> Self {
        Self { lnet }
    }

    /// Descriptor on the configured bulk portal.
    pub fn descriptor(&self, role: BulkRole, region: Region) -> BulkDescriptor {
        BulkDescriptor::new(role, self.lnet.config().rpc.bulk_portal, region)
    }

    /// Runs the active half of a transfer (server side).
    pub fn start(&self, desc: &BulkDescriptor, peer: ProcessId, xid: u64) -> TransportResult<()> {
        start_bulk_transfer(&self.lnet, desc, peer, xid)
    }

    /// Exposes the passive half of a transfer (client side).
    pub fn register(&self, desc: &BulkDescriptor, peer: ProcessId, xid: u64) -> TransportResult<()> {
        register_bulk(&self.lnet, desc, peer, xid)
    }

    /// Stops an active transfer. Returns at once if nothing is in flight.
    pub async fn abort(&self, desc: &BulkDescriptor) {
        abort_bulk(&self.lnet, desc).await;
    }

    /// Withdraws a registration. Returns at once if nothing is registered.
    pub async fn unregister(&self, desc: &BulkDescriptor) {
        unregister_bulk(&self.lnet, desc).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LnetConfig;
    use crate::ni::NetworkInterface;
    use crate::nid::{NetId, NetKind, Nid};
    use crate::sim::SimFabric;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn nid(addr: u32) -> Nid {
        Nid::new(NetId::new(NetKind::Tcp, 0), addr)
    }

    fn node(fabric: &SimFabric, addr: u32) -> BulkChannel {
        let (ni, rx) = fabric.attach(nid(addr));
        let lnet = Lnet::new(LnetConfig::default(), vec![ni as Arc<dyn NetworkInterface>]).unwrap();
        lnet.spawn_event_loop(rx);
        BulkChannel::new(lnet)
    }

    #[test]
    fn test_roles() {
        assert!(BulkRole::PutSource.is_active());
        assert!(BulkRole::GetSink.is_active());
        assert!(!BulkRole::PutSink.is_active());
        assert!(!BulkRole::GetSource.is_active());
    }

    #[tokio::test]
    async fn test_put_transfer() {
        let fabric = SimFabric::new();
        let client = node(&fabric, 1);
        let server = node(&fabric, 2);

        let sink_region = Region::from_fragments(vec![vec![0u8; 3], vec![0u8; 5]]);
        let sink = client.descriptor(BulkRole::PutSink, sink_region.clone());
        client.register(&sink, ProcessId::server(nid(2)), 11).unwrap();
        assert!(sink.is_active());

        let source = server.descriptor(BulkRole::PutSource, Region::from_bytes(b"abcdefgh"));
        server.start(&source, ProcessId::server(nid(1)), 11).unwrap();

        assert!(source.wait_complete(Duration::from_secs(5)).await.unwrap());
        assert!(sink.wait_complete(Duration::from_secs(5)).await.unwrap());
        assert_eq!(sink_region.to_vec(), b"abcdefgh".to_vec());
        assert_eq!(sink.transferred(), 8);
    }

    #[tokio::test]
    async fn test_get_transfer_runs_callback() {
        let fabric = SimFabric::new();
        let client = node(&fabric, 1);
        let server = node(&fabric, 2);

        let source = client.descriptor(BulkRole::GetSource, Region::from_bytes(b"payload"));
        client.register(&source, ProcessId::server(nid(2)), 5).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let sink_region = Region::zeroed(7);
        let sink = BulkDescriptor::with_callback(BulkRole::GetSink, 8, sink_region.clone(), move |c| {
            assert!(c.success);
            assert_eq!(c.xid, 5);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        server.start(&sink, ProcessId::server(nid(1)), 5).unwrap();

        assert!(sink.wait_complete(Duration::from_secs(5)).await.unwrap());
        assert_eq!(sink_region.to_vec(), b"payload".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(source.success());
    }

    #[tokio::test]
    async fn test_register_rules() {
        let fabric = SimFabric::new();
        let client = node(&fabric, 1);
        let peer = ProcessId::server(nid(2));

        let empty = client.descriptor(BulkRole::PutSink, Region::zeroed(0));
        assert!(matches!(client.register(&empty, peer, 1), Err(TransportError::InvalidArgument(_))));

        let active = client.descriptor(BulkRole::PutSource, Region::zeroed(4));
        assert!(matches!(client.register(&active, peer, 1), Err(TransportError::InvalidArgument(_))));

        let sink = client.descriptor(BulkRole::PutSink, Region::zeroed(4));
        client.register(&sink, peer, 1).unwrap();
        client.unregister(&sink).await;
        assert!(!sink.is_active());
        assert!(matches!(
            client.register(&sink, peer, 1),
            Err(TransportError::ProtocolViolation(_))
        ));
        client.register(&sink, peer, 2).unwrap();
        client.unregister(&sink).await;
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let fabric = SimFabric::new();
        let server = node(&fabric, 2);
        fabric.add_node(nid(9));

        let source = server.descriptor(BulkRole::PutSource, Region::from_bytes(b"data"));
        server.abort(&source).await;

        // nobody matches the put, so no ACK comes
        server.start(&source, ProcessId::server(nid(9)), 3).unwrap();
        tokio::task::yield_now().await;
        assert!(source.is_active());
        server.abort(&source).await;
        assert!(!source.is_active());
        assert!(!source.success());
        server.abort(&source).await;
    }

    #[tokio::test]
    async fn test_failed_issue_completes_through_unlink() {
        let fabric = SimFabric::new();
        let server = node(&fabric, 2);
        fabric.add_node(nid(9));
        fabric.fail_sends_to(nid(9));

        let sink = server.descriptor(BulkRole::GetSink, Region::zeroed(4));
        server.start(&sink, ProcessId::server(nid(9)), 4).unwrap();
        assert!(!sink.wait_complete(Duration::from_secs(5)).await.unwrap());
        assert_eq!(sink.status(), Some(EventError::Canceled));
    }

    #[tokio::test]
    async fn test_start_while_active_is_busy() {
        let fabric = SimFabric::new();
        let server = node(&fabric, 2);
        fabric.add_node(nid(9));

        let source = server.descriptor(BulkRole::PutSource, Region::from_bytes(b"data"));
        server.start(&source, ProcessId::server(nid(9)), 3).unwrap();
        assert!(matches!(
            server.start(&source, ProcessId::server(nid(9)), 4),
            Err(TransportError::Busy(_))
        ));
        server.abort(&source).await;
    }
}
