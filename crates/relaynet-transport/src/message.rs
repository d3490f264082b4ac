//! Request/reply messaging over portals.
//!
//! A client [`Request`] uses two bindings per send: the outgoing request
//! buffer, finished by its SEND event, and a reply buffer attached under
//! the request's xid, finished by the reply PUT. Callers only ever see
//! completion through the request's flags. A put that cannot be issued
//! still ends in an unlink event, so there is exactly one path for both
//! success and failure.
//!
//! On the server, a [`Service`] keeps request buffers posted on a portal
//! and hands incoming puts to the application as [`IncomingRequest`]s.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::buffer::PeerCredit;
use crate::bulk::{self, BulkDescriptor};
use crate::error::{TransportError, TransportResult};
use crate::event::EventTarget;
use crate::lnet::Lnet;
use crate::ni::{AckRequest, EventKind, MdHandle, MdOptions, MemoryDescriptor, NetEvent, Region, Threshold};
use crate::nid::{Nid, ProcessId};

/// Bytes of status and transno ahead of every reply payload.
pub const REPLY_HEADER_SIZE: usize = 12;
/// Request status when the reply did not fit the reply buffer.
pub const STATUS_REPLY_TRUNCATED: i32 = -75;
/// Request status when the reply could not be decoded.
pub const STATUS_BAD_REPLY: i32 = -71;

/// A reply as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// 0 on success, negative error otherwise.
    pub status: i32,
    /// Transaction number the server assigned, 0 if none.
    pub transno: u64,
    /// Reply body.
    pub payload: Bytes,
}

impl Reply {
    /// Successful reply without a transaction number.
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            status: 0,
            transno: 0,
            payload: payload.into(),
        }
    }

    /// Failed reply.
    pub fn error(status: i32) -> Self {
        Self {
            status,
            transno: 0,
            payload: Bytes::new(),
        }
    }

    /// Sets the transaction number.
    pub fn with_transno(mut self, transno: u64) -> Self {
        self.transno = transno;
        self
    }

    /// Header plus payload, little endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REPLY_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.status.to_le_bytes());
        buf.extend_from_slice(&self.transno.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses a reply produced by [`Reply::encode`].
    pub fn decode(buf: &[u8]) -> TransportResult<Self> {
        if buf.len() < REPLY_HEADER_SIZE {
            return Err(TransportError::SerializationError(format!(
                "reply of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let mut status = [0u8; 4];
        status.copy_from_slice(&buf[..4]);
        let mut transno = [0u8; 8];
        transno.copy_from_slice(&buf[4..REPLY_HEADER_SIZE]);
        Ok(Self {
            status: i32::from_le_bytes(status),
            transno: u64::from_le_bytes(transno),
            payload: Bytes::copy_from_slice(&buf[REPLY_HEADER_SIZE..]),
        })
    }
}

/// Progress flags of a client request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFlags {
    /// The request left this node.
    pub sent: bool,
    /// A reply arrived.
    pub replied: bool,
    /// The exchange failed locally.
    pub err: bool,
    /// The caller gave up waiting.
    pub timedout: bool,
    /// The request or its reply was lost on the network.
    pub net_err: bool,
    /// The caller asked for a resend.
    pub resend: bool,
    /// The caller asked for a restart.
    pub restart: bool,
    /// The reply buffer is attached.
    pub receiving_reply: bool,
}

#[derive(Default)]
struct RequestState {
    xid: u64,
    flags: RequestFlags,
    transno: u64,
    status: i32,
    reply: Option<Bytes>,
    reply_md: Option<(usize, MdHandle)>,
    request_in_flight: bool,
    tx_credit: Option<(Nid, PeerCredit)>,
    bulk: Option<BulkDescriptor>,
}

pub(crate) struct RequestShared {
    dest: ProcessId,
    payload: Bytes,
    reply_region: Region,
    state: Mutex<RequestState>,
    notify: Notify,
}

impl RequestShared {
    fn check_reply(&self) -> bool {
        let f = self.state.lock().flags;
        f.replied || f.net_err || f.err || f.resend || f.restart
    }

    fn bindings_gone(&self) -> bool {
        let st = self.state.lock();
        !st.flags.receiving_reply && !st.request_in_flight
    }
}

/// A client request. Clones share the same exchange.
#[derive(Clone)]
pub struct Request {
    shared: Arc<RequestShared>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Request")
            .field("xid", &st.xid)
            .field("dest", &self.shared.dest)
            .field("flags", &st.flags)
            .field("transno", &st.transno)
            .field("status", &st.status)
            .finish()
    }
}

impl Request {
    /// New request to `dest` with room for `reply_capacity` reply bytes.
    pub fn new(lnet: &Lnet, dest: ProcessId, payload: impl Into<Bytes>, reply_capacity: usize) -> Self {
        let state = RequestState {
            xid: lnet.next_xid(),
            ..Default::default()
        };
        Self {
            shared: Arc::new(RequestShared {
                dest,
                payload: payload.into(),
                reply_region: Region::zeroed(REPLY_HEADER_SIZE + reply_capacity),
                state: Mutex::new(state),
                notify: Notify::new(),
            }),
        }
    }

    /// Attaches a bulk transfer that shares this request's xid.
    pub fn with_bulk(self, bulk: BulkDescriptor) -> Self {
        self.shared.state.lock().bulk = Some(bulk);
        self
    }

    /// Transaction identifier.
    pub fn xid(&self) -> u64 {
        self.shared.state.lock().xid
    }

    /// Destination.
    pub fn dest(&self) -> ProcessId {
        self.shared.dest
    }

    /// Current flags.
    pub fn flags(&self) -> RequestFlags {
        self.shared.state.lock().flags
    }

    /// Transaction number from the last reply.
    pub fn transno(&self) -> u64 {
        self.shared.state.lock().transno
    }

    /// Status from the last reply, or a local failure code.
    pub fn status(&self) -> i32 {
        self.shared.state.lock().status
    }

    /// Payload of the last reply.
    pub fn reply(&self) -> Option<Bytes> {
        self.shared.state.lock().reply.clone()
    }

    /// Attached bulk transfer.
    pub fn bulk(&self) -> Option<BulkDescriptor> {
        self.shared.state.lock().bulk.clone()
    }

    /// Gives the request a fresh xid before a resend that moves bulk data.
    pub fn renew_xid(&self, lnet: &Lnet) -> TransportResult<u64> {
        let mut st = self.shared.state.lock();
        if st.flags.receiving_reply || st.request_in_flight {
            return Err(TransportError::Busy(format!("request {} still in flight", st.xid)));
        }
        st.xid = lnet.next_xid();
        Ok(st.xid)
    }

    /// Asks the waiting caller to resend.
    pub fn mark_resend(&self) {
        self.shared.state.lock().flags.resend = true;
        self.shared.notify.notify_waiters();
    }

    /// Asks the waiting caller to restart the exchange.
    pub fn mark_restart(&self) {
        self.shared.state.lock().flags.restart = true;
        self.shared.notify.notify_waiters();
    }

    /// Fails the request locally with `status`.
    pub fn mark_error(&self, status: i32) {
        {
            let mut st = self.shared.state.lock();
            st.flags.err = true;
            st.status = status;
        }
        self.shared.notify.notify_waiters();
    }
}

pub(crate) fn request_out_event(lnet: &Lnet, req: &Arc<RequestShared>, ev: &NetEvent) -> TransportResult<()> {
    let credit = {
        let mut st = req.state.lock();
        if !matches!(ev.kind, EventKind::Send | EventKind::Unlink) {
            return Err(TransportError::ProtocolViolation(format!(
                "unexpected {:?} event on request {}",
                ev.kind, st.xid
            )));
        }
        if ev.ok() {
            st.flags.sent = true;
        } else {
            st.flags.net_err = true;
            debug!(xid = st.xid, kind = ?ev.kind, status = ?ev.status, "request not sent");
        }
        if ev.unlinked {
            st.request_in_flight = false;
            st.tx_credit.take()
        } else {
            None
        }
    };
    if !ev.ok() {
        lnet.metrics().inc_network_errors();
    }
    release_credit(lnet, credit);
    req.notify.notify_waiters();
    Ok(())
}

fn release_credit(lnet: &Lnet, credit: Option<(Nid, PeerCredit)>) {
    if let Some((hop, credit)) = credit {
        drop(credit);
        lnet.release_hop(hop);
    }
}

pub(crate) fn reply_in_event(lnet: &Lnet, req: &Arc<RequestShared>, ev: &NetEvent) -> TransportResult<()> {
    {
        let mut st = req.state.lock();
        match ev.kind {
            EventKind::Put => {
                if ev.match_bits != st.xid {
                    return Err(TransportError::ProtocolViolation(format!(
                        "reply with match bits {:#x} landed in the buffer of request {}",
                        ev.match_bits, st.xid
                    )));
                }
                if !ev.ok() {
                    st.flags.net_err = true;
                } else if ev.rlength > ev.mlength {
                    warn!(xid = st.xid, rlength = ev.rlength, mlength = ev.mlength, "reply truncated");
                    st.flags.err = true;
                    st.status = STATUS_REPLY_TRUNCATED;
                } else {
                    match Reply::decode(&req.reply_region.read(ev.offset, ev.mlength)) {
                        Ok(reply) => {
                            st.status = reply.status;
                            st.transno = reply.transno;
                            st.reply = Some(reply.payload);
                            st.flags.replied = true;
                            lnet.metrics().inc_replies_received();
                        }
                        Err(e) => {
                            warn!(xid = st.xid, error = %e, "undecodable reply");
                            st.flags.err = true;
                            st.status = STATUS_BAD_REPLY;
                        }
                    }
                }
            }
            EventKind::Unlink => {}
            other => {
                return Err(TransportError::ProtocolViolation(format!(
                    "unexpected {:?} event on reply buffer of request {}",
                    other, st.xid
                )));
            }
        }
        if ev.unlinked {
            st.reply_md = None;
            st.flags.receiving_reply = false;
        }
    }
    req.notify.notify_waiters();
    Ok(())
}

/// Client side of the request/reply protocol.
#[derive(Clone)]
pub struct MessageTransport {
    lnet: Arc<Lnet>,
}

impl MessageTransport {
    /// Transport over `lnet`.
    pub fn new(lnet: Arc<Lnet>) -> Self {
        Self { lnet }
    }

    /// The network context.
    pub fn lnet(&self) -> &Arc<Lnet> {
        &self.lnet
    }

    /// New request with a fresh xid.
    pub fn request(&self, dest: ProcessId, payload: impl Into<Bytes>, reply_capacity: usize) -> Request {
        Request::new(&self.lnet, dest, payload, reply_capacity)
    }

    /// Sends `req`: registers its bulk, attaches the reply buffer, then
    /// puts the request.
    ///
    /// Waits for a transmit credit toward the next hop. Once the request
    /// has been handed to the network, a delivery failure is reported
    /// through the request's flags rather than here.
    pub async fn send_rpc(&self, req: &Request) -> TransportResult<()> {
        let lnet = &self.lnet;
        let shared = &req.shared;
        if lnet.is_shutting_down() {
            return Err(TransportError::ShuttingDown);
        }

        let (xid, bulk) = {
            let st = shared.state.lock();
            if st.flags.receiving_reply || st.request_in_flight {
                return Err(TransportError::ProtocolViolation(format!(
                    "request {} sent while its previous send is in flight",
                    st.xid
                )));
            }
            (st.xid, st.bulk.clone())
        };

        let (ni, to) = lnet.resolve(shared.dest)?;
        let driver = lnet.driver(ni)?;
        let rpc = &lnet.config().rpc;
        let credit = lnet.tx_credits.acquire(to.next_hop, driver.tunables()).await;

        let passive_bulk = bulk.filter(|b| !b.role().is_active());
        if let Some(bulk) = &passive_bulk {
            bulk::register_bulk(lnet, bulk, shared.dest, xid)?;
        }

        let reply_tag = lnet.events.register(EventTarget::ReplyIn(Arc::clone(shared)));
        let reply_md = MemoryDescriptor {
            region: shared.reply_region.clone(),
            threshold: Threshold::Count(1),
            options: MdOptions {
                op_put: true,
                truncate: true,
                ..Default::default()
            },
            user: reply_tag,
        };
        let reply_handle = match driver.me_attach(rpc.reply_portal, Some(shared.dest.nid), xid, 0, reply_md) {
            Ok(handle) => handle,
            Err(e) => {
                lnet.events.release(reply_tag);
                if let Some(bulk) = &passive_bulk {
                    bulk::unregister_bulk(lnet, bulk).await;
                }
                return Err(e);
            }
        };

        {
            let mut st = shared.state.lock();
            st.flags = RequestFlags {
                receiving_reply: true,
                ..Default::default()
            };
            st.status = 0;
            st.reply = None;
            st.reply_md = Some((ni, reply_handle));
            st.request_in_flight = true;
            st.tx_credit = Some((to.next_hop, credit));
        }

        let req_tag = lnet.events.register(EventTarget::RequestOut(Arc::clone(shared)));
        let region = Region::from_bytes(&shared.payload);
        match lnet.send_buf(ni, region, req_tag, AckRequest::NoAck, to, rpc.request_portal, xid) {
            Ok(_) => {
                lnet.metrics().inc_messages_sent();
                debug!(xid, dest = %shared.dest, via = %to.next_hop, "request sent");
                Ok(())
            }
            Err(e) => {
                warn!(xid, dest = %shared.dest, error = %e, "cannot bind request");
                lnet.events.release(req_tag);
                let credit = {
                    let mut st = shared.state.lock();
                    st.request_in_flight = false;
                    st.tx_credit.take()
                };
                release_credit(lnet, credit);
                self.unregister_reply(req).await;
                if let Some(bulk) = &passive_bulk {
                    bulk::unregister_bulk(lnet, bulk).await;
                }
                Err(e)
            }
        }
    }

    /// Waits for the reply, a failure, or `wait` to pass.
    ///
    /// The reply buffer is always unregistered before returning, so the
    /// request may be sent again afterwards.
    pub async fn wait_reply(&self, req: &Request, wait: Duration) -> TransportResult<Bytes> {
        let shared = &req.shared;
        let waited = timeout(wait, async {
            loop {
                let notified = shared.notify.notified();
                if shared.check_reply() {
                    return;
                }
                notified.await;
            }
        })
        .await;

        if waited.is_err() {
            let mut st = shared.state.lock();
            if !st.flags.replied {
                st.flags.timedout = true;
            }
        }

        self.unregister_reply(req).await;
        if let Some(bulk) = req.bulk().filter(|b| !b.role().is_active()) {
            bulk::unregister_bulk(&self.lnet, &bulk).await;
        }

        let st = shared.state.lock();
        let xid = st.xid;
        let flags = st.flags;
        if flags.timedout {
            self.lnet.metrics().inc_timeouts();
            debug!(xid, timeout_ms = wait.as_millis() as u64, "request timed out");
            return Err(TransportError::Timeout {
                xid,
                timeout_ms: wait.as_millis() as u64,
            });
        }
        if flags.replied {
            if st.status != 0 {
                return Err(TransportError::RequestFailed {
                    xid,
                    status: st.status,
                });
            }
            return Ok(st.reply.clone().unwrap_or_default());
        }
        if flags.net_err {
            return Err(TransportError::NetworkError {
                xid,
                reason: "request or reply lost".to_string(),
            });
        }
        if flags.resend || flags.restart {
            return Err(TransportError::NetworkError {
                xid,
                reason: "resend requested".to_string(),
            });
        }
        Err(TransportError::RequestFailed {
            xid,
            status: st.status,
        })
    }

    /// Unlinks the reply buffer and waits until the network has let go of
    /// both of the request's bindings. Never gives up.
    pub async fn unregister_reply(&self, req: &Request) {
        let shared = &req.shared;
        let wait = self.lnet.config().rpc.unlink_wait_timeout();
        let mut unlinked = false;
        loop {
            let notified = shared.notify.notified();
            if shared.bindings_gone() {
                return;
            }
            if !unlinked {
                let md = shared.state.lock().reply_md;
                if let Some((ni, handle)) = md {
                    let result = self.lnet.driver(ni).and_then(|d| d.md_unlink(handle));
                    if let Err(e) = result {
                        debug!(xid = req.xid(), error = %e, "reply buffer already finishing");
                    }
                }
                unlinked = true;
            }
            if timeout(wait, notified).await.is_err() {
                warn!(
                    xid = req.xid(),
                    waited_secs = wait.as_secs(),
                    "still waiting for the network to release request buffers"
                );
            }
        }
    }

    /// Sends a request and waits for its reply with the configured timeout.
    pub async fn call(&self, dest: ProcessId, payload: impl Into<Bytes>, reply_capacity: usize) -> TransportResult<Bytes> {
        let req = self.request(dest, payload, reply_capacity);
        self.send_rpc(&req).await?;
        self.wait_reply(&req, self.lnet.config().rpc.rpc_timeout()).await
    }
}

/// Request buffer settings of a [`Service`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Portal requests arrive on.
    pub portal: u32,
    /// Bytes per request buffer.
    pub buffer_size: usize,
    /// Largest request expected; a buffer is retired once less than this is free.
    pub max_request_size: usize,
    /// Buffers posted per local interface.
    pub nbufs: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            portal: 4,
            buffer_size: 64 * 1024,
            max_request_size: 4096,
            nbufs: 4,
        }
    }
}

/// A request delivered to a service.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// The client's xid.
    pub xid: u64,
    /// The client.
    pub peer: ProcessId,
    /// Local interface it arrived on.
    pub ni: Nid,
    /// Request body.
    pub payload: Bytes,
    /// The body was cut short to fit the buffer.
    pub truncated: bool,
}

pub(crate) struct ServiceShared {
    config: ServiceConfig,
    tx: mpsc::UnboundedSender<IncomingRequest>,
    buffers: Mutex<Vec<Arc<RequestBuffer>>>,
    shutting_down: AtomicBool,
    outstanding_replies: AtomicUsize,
    notify: Notify,
}

pub(crate) struct RequestBuffer {
    service: Arc<ServiceShared>,
    ni: usize,
    region: Region,
    md: Mutex<Option<MdHandle>>,
}

fn post_buffer(lnet: &Lnet, service: &Arc<ServiceShared>, ni: usize) -> TransportResult<()> {
    let buf = Arc::new(RequestBuffer {
        service: Arc::clone(service),
        ni,
        region: Region::zeroed(service.config.buffer_size),
        md: Mutex::new(None),
    });
    service.buffers.lock().push(Arc::clone(&buf));

    let tag = lnet.events.register(EventTarget::RequestIn(Arc::clone(&buf)));
    let md = MemoryDescriptor {
        region: buf.region.clone(),
        threshold: Threshold::Infinite,
        options: MdOptions {
            op_put: true,
            truncate: true,
            max_size: Some(service.config.max_request_size),
            ..Default::default()
        },
        user: tag,
    };
    let attached = lnet
        .driver(ni)
        .and_then(|d| d.me_attach(service.config.portal, None, 0, !0, md));
    match attached {
        Ok(handle) => {
            *buf.md.lock() = Some(handle);
            Ok(())
        }
        Err(e) => {
            lnet.events.release(tag);
            service.buffers.lock().retain(|b| !Arc::ptr_eq(b, &buf));
            Err(e)
        }
    }
}

pub(crate) fn request_in_event(lnet: &Lnet, buf: &Arc<RequestBuffer>, ev: &NetEvent) -> TransportResult<()> {
    let service = &buf.service;
    match ev.kind {
        EventKind::Put if ev.ok() => {
            let truncated = ev.rlength > ev.mlength;
            if truncated {
                warn!(
                    xid = ev.match_bits,
                    peer = %ev.initiator,
                    rlength = ev.rlength,
                    mlength = ev.mlength,
                    "request truncated"
                );
            }
            lnet.metrics().inc_messages_received();
            let incoming = IncomingRequest {
                xid: ev.match_bits,
                peer: ev.initiator,
                ni: ev.ni,
                payload: Bytes::from(buf.region.read(ev.offset, ev.mlength)),
                truncated,
            };
            if service.tx.send(incoming).is_err() {
                debug!(xid = ev.match_bits, "service receiver gone, dropping request");
            }
        }
        EventKind::Put | EventKind::Unlink => {}
        other => {
            return Err(TransportError::ProtocolViolation(format!(
                "unexpected {:?} event on request buffer of portal {}",
                other, service.config.portal
            )));
        }
    }

    if ev.unlinked {
        service.buffers.lock().retain(|b| !Arc::ptr_eq(b, buf));
        if !service.shutting_down.load(Ordering::SeqCst) && !lnet.is_shutting_down() {
            if let Err(e) = post_buffer(lnet, service, buf.ni) {
                warn!(portal = service.config.portal, error = %e, "cannot repost request buffer");
            }
        }
        service.notify.notify_waiters();
    }
    Ok(())
}

#[derive(Default)]
struct ReplyProgress {
    sent: bool,
    acked: bool,
    done: bool,
    md: Option<(usize, MdHandle)>,
}

pub(crate) struct ReplyState {
    xid: u64,
    service: Arc<ServiceShared>,
    progress: Mutex<ReplyProgress>,
    notify: Notify,
}

pub(crate) fn reply_out_event(_lnet: &Lnet, rs: &Arc<ReplyState>, ev: &NetEvent) -> TransportResult<()> {
    {
        let mut p = rs.progress.lock();
        match ev.kind {
            EventKind::Send => p.sent |= ev.ok(),
            EventKind::Ack => p.acked |= ev.ok(),
            EventKind::Unlink => {}
            other => {
                return Err(TransportError::ProtocolViolation(format!(
                    "unexpected {:?} event on reply {}",
                    other, rs.xid
                )));
            }
        }
        if !ev.ok() {
            debug!(xid = rs.xid, kind = ?ev.kind, "reply not delivered");
        }
        if !ev.unlinked {
            return Ok(());
        }
        p.done = true;
        p.md = None;
    }
    rs.service.outstanding_replies.fetch_sub(1, Ordering::SeqCst);
    rs.notify.notify_waiters();
    rs.service.notify.notify_waiters();
    Ok(())
}

/// Tracks a reply until the network is done with it.
pub struct ReplyHandle {
    lnet: Arc<Lnet>,
    state: Arc<ReplyState>,
}

impl ReplyHandle {
    /// Xid the reply answers.
    pub fn xid(&self) -> u64 {
        self.state.xid
    }

    /// The reply buffer has been released.
    pub fn is_done(&self) -> bool {
        self.state.progress.lock().done
    }

    /// The client acknowledged the reply.
    pub fn is_acked(&self) -> bool {
        self.state.progress.lock().acked
    }

    /// Waits until the reply buffer is released. Returns whether the
    /// client acknowledged it.
    pub async fn wait_done(&self, wait: Duration) -> TransportResult<bool> {
        let waited = timeout(wait, async {
            loop {
                let notified = self.state.notify.notified();
                let finished = {
                    let p = self.state.progress.lock();
                    p.done.then_some(p.acked)
                };
                if let Some(acked) = finished {
                    return acked;
                }
                notified.await;
            }
        })
        .await;
        waited.map_err(|_| TransportError::Timeout {
            xid: self.state.xid,
            timeout_ms: wait.as_millis() as u64,
        })
    }

    /// Gives up on an acknowledgement that is not coming.
    pub fn cancel(&self) {
        let md = {
            let p = self.state.progress.lock();
            if p.done {
                return;
            }
            p.md
        };
        if let Some((ni, handle)) = md {
            if let Err(e) = self.lnet.driver(ni).and_then(|d| d.md_unlink(handle)) {
                debug!(xid = self.state.xid, error = %e, "reply already finishing");
            }
        }
    }
}

/// Server side: request buffers on a portal plus reply sending.
pub struct Service {
    lnet: Arc<Lnet>,
    shared: Arc<ServiceShared>,
    rx: mpsc::UnboundedReceiver<IncomingRequest>,
}

impl Service {
    /// Posts `nbufs` request buffers on every local interface.
    pub async fn register(lnet: &Arc<Lnet>, config: ServiceConfig) -> TransportResult<Self> {
        if config.max_request_size == 0 || config.buffer_size < config.max_request_size {
            return Err(TransportError::InvalidConfig(format!(
                "request buffers of {} bytes cannot hold requests of {} bytes",
                config.buffer_size, config.max_request_size
            )));
        }
        if config.nbufs == 0 {
            return Err(TransportError::InvalidConfig("a service needs request buffers".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServiceShared {
            config,
            tx,
            buffers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            outstanding_replies: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        let service = Self {
            lnet: Arc::clone(lnet),
            shared,
            rx,
        };

        for ni in 0..lnet.local_nets().len() {
            for _ in 0..service.shared.config.nbufs {
                if let Err(e) = post_buffer(lnet, &service.shared, ni) {
                    warn!(portal = service.shared.config.portal, error = %e, "cannot post request buffer");
                    service.shutdown().await;
                    return Err(e);
                }
            }
        }
        info!(
            portal = service.shared.config.portal,
            nbufs = service.shared.config.nbufs,
            buffer_size = service.shared.config.buffer_size,
            "service registered"
        );
        Ok(service)
    }

    /// Next incoming request; `None` once the service is shut down.
    pub async fn recv(&mut self) -> Option<IncomingRequest> {
        self.rx.recv().await
    }

    /// Request buffers currently posted.
    pub fn posted_buffers(&self) -> usize {
        self.shared.buffers.lock().len()
    }

    /// Replies the network has not finished with.
    pub fn outstanding_replies(&self) -> usize {
        self.shared.outstanding_replies.load(Ordering::SeqCst)
    }

    /// Sends `reply` to the client of `incoming`.
    ///
    /// A difficult reply asks for an ACK and stays tracked until it
    /// arrives or the reply is cancelled.
    pub fn send_reply(&self, incoming: &IncomingRequest, reply: Reply, difficult: bool) -> TransportResult<ReplyHandle> {
        let lnet = &self.lnet;
        self.shared.outstanding_replies.fetch_add(1, Ordering::SeqCst);

        let state = Arc::new(ReplyState {
            xid: incoming.xid,
            service: Arc::clone(&self.shared),
            progress: Mutex::new(ReplyProgress::default()),
            notify: Notify::new(),
        });
        let ack = if difficult {
            AckRequest::Ack
        } else {
            AckRequest::NoAck
        };

        let sent = lnet.resolve(incoming.peer).and_then(|(ni, to)| {
            let tag = lnet.events.register(EventTarget::ReplyOut(Arc::clone(&state)));
            let region = Region::from_bytes(&reply.encode());
            match lnet.send_buf(ni, region, tag, ack, to, lnet.config().rpc.reply_portal, incoming.xid) {
                Ok(handle) => Ok((ni, handle)),
                Err(e) => {
                    lnet.events.release(tag);
                    Err(e)
                }
            }
        });

        match sent {
            Ok(md) => {
                let mut p = state.progress.lock();
                if !p.done {
                    p.md = Some(md);
                }
                drop(p);
                lnet.metrics().inc_replies_sent();
                debug!(xid = incoming.xid, peer = %incoming.peer, difficult, "reply sent");
                Ok(ReplyHandle {
                    lnet: Arc::clone(lnet),
                    state,
                })
            }
            Err(e) => {
                self.shared.outstanding_replies.fetch_sub(1, Ordering::SeqCst);
                warn!(xid = incoming.xid, peer = %incoming.peer, error = %e, "cannot send reply");
                Err(e)
            }
        }
    }

    /// Unlinks every request buffer and waits for the network to release them.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let wait = self.lnet.config().rpc.unlink_wait_timeout();
        loop {
            let notified = self.shared.notify.notified();
            let buffers: Vec<Arc<RequestBuffer>> = self.shared.buffers.lock().clone();
            if buffers.is_empty() {
                break;
            }
            for buf in &buffers {
                let md = buf.md.lock().take();
                if let Some(handle) = md {
                    if let Err(e) = self.lnet.driver(buf.ni).and_then(|d| d.md_unlink(handle)) {
                        debug!(error = %e, "request buffer already finishing");
                    }
                }
            }
            if timeout(wait, notified).await.is_err() {
                warn!(
                    portal = self.shared.config.portal,
                    remaining = buffers.len(),
                    "still waiting for request buffers to unlink"
                );
            }
        }
        info!(portal = self.shared.config.portal, "service shut down");
    }
}
