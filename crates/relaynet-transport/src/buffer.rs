//! Credited buffer pools.
//!
//! A pool's credit count is its free buffers minus its waiters, so a
//! negative value is the depth of the wait queue. Waiters are served
//! strictly in arrival order: a released buffer goes straight to the
//! oldest waiter and only reaches the free list when nobody waits.
//! `mincredits` records the low-water mark.
//!
//! Forwarding uses three size classes (no payload, one page, one MTU)
//! plus a per-peer credit count so that one slow peer cannot take every
//! buffer.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::config::{Forwarding, RouterConfig};
use crate::error::{TransportError, TransportResult};
use crate::ni::NiTunables;
use crate::nid::Nid;

/// Page size router buffers are made of.
pub const PAGE_SIZE: usize = 4096;
/// Largest payload a single message carries.
pub const LNET_MTU: usize = 1 << 20;
/// Pages in a large router buffer.
pub const LARGE_BUFFER_PAGES: usize = (LNET_MTU + PAGE_SIZE - 1) / PAGE_SIZE;

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Pages per buffer.
    pub npages: usize,
    /// Buffers the pool was sized with.
    pub nbuffers: usize,
    /// Free buffers minus waiters.
    pub credits: i64,
    /// Lowest credit count seen.
    pub mincredits: i64,
    /// Waiters queued.
    pub queued: usize,
}

struct QueueState<T> {
    free: Vec<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    nbuffers: usize,
    mincredits: i64,
}

impl<T> QueueState<T> {
    fn credits(&self) -> i64 {
        self.free.len() as i64 - self.waiters.len() as i64
    }

    fn note_credits(&mut self) {
        let credits = self.credits();
        if credits < self.mincredits {
            self.mincredits = credits;
        }
    }
}

/// FIFO credit queue over a free list of `T`.
pub(crate) struct CreditQueue<T> {
    state: Mutex<QueueState<T>>,
}

impl<T: Send + 'static> CreditQueue<T> {
    pub(crate) fn new(items: Vec<T>) -> Arc<Self> {
        let n = items.len();
        Arc::new(Self {
            state: Mutex::new(QueueState {
                free: items,
                waiters: VecDeque::new(),
                nbuffers: n,
                mincredits: n as i64,
            }),
        })
    }

    fn try_take(self: &Arc<Self>) -> Option<Credit<T>> {
        let mut state = self.state.lock();
        state.waiters.retain(|tx| !tx.is_closed());
        if !state.waiters.is_empty() {
            return None;
        }
        let item = state.free.pop()?;
        state.note_credits();
        Some(Credit {
            item: Some(item),
            queue: Arc::clone(self),
        })
    }

    async fn take(self: &Arc<Self>) -> Credit<T> {
        let rx = {
            let mut state = self.state.lock();
            state.waiters.retain(|tx| !tx.is_closed());
            if state.waiters.is_empty() {
                if let Some(item) = state.free.pop() {
                    state.note_credits();
                    return Credit {
                        item: Some(item),
                        queue: Arc::clone(self),
                    };
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            state.note_credits();
            rx
        };

        let mut waiting = Waiting {
            rx: Some(rx),
            queue: Arc::clone(self),
        };
        let item = waiting.recv().await;
        Credit {
            item: Some(item),
            queue: Arc::clone(self),
        }
    }

    /// Hands `item` to the oldest live waiter, or frees it.
    fn release(&self, item: T) {
        let mut state = self.state.lock();
        let mut item = item;
        while let Some(tx) = state.waiters.pop_front() {
            match tx.send(item) {
                Ok(()) => return,
                Err(back) => item = back,
            }
        }
        state.free.push(item);
    }

    fn stats(&self, npages: usize) -> PoolStats {
        let mut state = self.state.lock();
        state.waiters.retain(|tx| !tx.is_closed());
        PoolStats {
            npages,
            nbuffers: state.nbuffers,
            credits: state.credits(),
            mincredits: state.mincredits,
            queued: state.waiters.len(),
        }
    }

    /// Adds `items`, serving queued waiters first in arrival order.
    /// Restarts the low-water mark.
    fn grow(&self, items: Vec<T>) {
        let mut state = self.state.lock();
        state.nbuffers += items.len();
        for mut item in items {
            loop {
                let Some(tx) = state.waiters.pop_front() else {
                    state.free.push(item);
                    break;
                };
                match tx.send(item) {
                    Ok(()) => break,
                    Err(back) => item = back,
                }
            }
        }
        state.mincredits = state.credits();
    }

    fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.nbuffers - state.free.len()
    }
}

/// Pending acquire. Dropping it after the item was handed over returns
/// the item to the queue.
struct Waiting<T: Send + 'static> {
    rx: Option<oneshot::Receiver<T>>,
    queue: Arc<CreditQueue<T>>,
}

impl<T: Send + 'static> Waiting<T> {
    async fn recv(&mut self) -> T {
        loop {
            let Some(rx) = self.rx.as_mut() else {
                return std::future::pending().await;
            };
            match rx.await {
                Ok(item) => {
                    self.rx = None;
                    return item;
                }
                // the queue never drops a live sender; requeue if it did
                Err(_) => {
                    let (tx, rx) = oneshot::channel();
                    self.queue.state.lock().waiters.push_back(tx);
                    self.rx = Some(rx);
                }
            }
        }
    }
}

impl<T: Send + 'static> Drop for Waiting<T> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok(item) = rx.try_recv() {
                self.queue.release(item);
            }
        }
    }
}

/// A credit held from a queue; released on drop.
pub struct Credit<T: Send + 'static> {
    item: Option<T>,
    queue: Arc<CreditQueue<T>>,
}

impl<T: Send + 'static> Drop for Credit<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.queue.release(item);
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Credit<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credit").finish_non_exhaustive()
    }
}

/// A router buffer; goes back to its pool on drop.
pub type RouterBuffer = Credit<Vec<u8>>;

/// One per-peer credit; returned on drop.
pub type PeerCredit = Credit<()>;

impl Deref for Credit<Vec<u8>> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        self.item.as_ref().map_or(&EMPTY, |v| v)
    }
}

impl DerefMut for Credit<Vec<u8>> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.item.get_or_insert_with(Vec::new)
    }
}

static EMPTY: Vec<u8> = Vec::new();

/// Router buffers of one size class.
pub struct BufferPool {
    npages: usize,
    queue: Mutex<Arc<CreditQueue<Vec<u8>>>>,
}

impl BufferPool {
    /// Empty pool of `npages`-page buffers.
    pub fn new(npages: usize) -> Self {
        Self {
            npages,
            queue: Mutex::new(CreditQueue::new(Vec::new())),
        }
    }

    /// Pages per buffer.
    pub fn npages(&self) -> usize {
        self.npages
    }

    /// Buffer size in bytes.
    pub fn buffer_size(&self) -> usize {
        self.npages * PAGE_SIZE
    }

    /// Sizes the pool with `n` buffers.
    ///
    /// A repeat call with the current size is a no-op. Resizing and
    /// allocating while routing is enabled are refused.
    pub fn alloc_bufs(&self, n: usize, routing: bool) -> TransportResult<()> {
        let queue = self.queue.lock();
        let current = queue.state.lock().nbuffers;
        if current != 0 {
            if current == n {
                return Ok(());
            }
            return Err(TransportError::InvalidConfig(format!(
                "pool of {}-page buffers already sized to {}, not {}",
                self.npages, current, n
            )));
        }
        if routing {
            return Err(TransportError::RoutingActive);
        }
        let size = self.buffer_size();
        // memory is touched on first use
        let bufs = (0..n).map(|_| Vec::with_capacity(size)).collect();
        let queued = queue.stats(self.npages).queued;
        queue.grow(bufs);
        debug!(npages = self.npages, nbuffers = n, queued, "router pool sized");
        Ok(())
    }

    /// Releases every buffer. `Busy` while any buffer is checked out.
    pub fn free_bufs(&self) -> TransportResult<()> {
        let mut queue = self.queue.lock();
        let outstanding = queue.outstanding();
        if outstanding != 0 {
            return Err(TransportError::Busy(format!(
                "{} router buffers of {} pages still in use",
                outstanding, self.npages
            )));
        }
        *queue = CreditQueue::new(Vec::new());
        Ok(())
    }

    fn current(&self) -> Arc<CreditQueue<Vec<u8>>> {
        Arc::clone(&*self.queue.lock())
    }

    fn ready(&self, mut buf: RouterBuffer) -> RouterBuffer {
        let size = self.buffer_size();
        if buf.len() != size {
            buf.resize(size, 0);
        }
        buf
    }

    /// Takes a buffer if one is free and nobody is queued ahead.
    pub fn try_acquire(&self) -> Option<RouterBuffer> {
        self.current().try_take().map(|b| self.ready(b))
    }

    /// Waits for a buffer in arrival order.
    pub async fn acquire(&self) -> RouterBuffer {
        let queue = self.current();
        let buf = queue.take().await;
        self.ready(buf)
    }

    /// Pool counters.
    pub fn stats(&self) -> PoolStats {
        self.current().stats(self.npages)
    }
}

/// Per-peer credit counts.
pub struct PeerCredits {
    global: i64,
    router: bool,
    queues: DashMap<Nid, Arc<CreditQueue<()>>>,
}

impl PeerCredits {
    /// Transmit credits: every peer gets the interface's `peer_tx_credits`.
    pub fn tx() -> Self {
        Self {
            global: 0,
            router: false,
            queues: DashMap::new(),
        }
    }

    /// Forwarding credits: the interface override wins, then the global
    /// `peer_buffer_credits`, then the interface's `peer_tx_credits`.
    pub fn router(global: i64) -> Self {
        Self {
            global,
            router: true,
            queues: DashMap::new(),
        }
    }

    /// Credits a peer on an interface with `tunables` starts with.
    pub fn credits_for(&self, tunables: NiTunables) -> usize {
        if self.router {
            if let Some(n) = tunables.peer_buffer_credits {
                return n as usize;
            }
            if self.global > 0 {
                return self.global as usize;
            }
        }
        tunables.peer_tx_credits as usize
    }

    fn queue(&self, peer: Nid, tunables: NiTunables) -> Arc<CreditQueue<()>> {
        let n = self.credits_for(tunables);
        Arc::clone(
            self.queues
                .entry(peer)
                .or_insert_with(|| CreditQueue::new(vec![(); n]))
                .value(),
        )
    }

    /// Takes a credit for `peer` without waiting.
    pub fn try_acquire(&self, peer: Nid, tunables: NiTunables) -> Option<PeerCredit> {
        self.queue(peer, tunables).try_take()
    }

    /// Waits for a credit for `peer`.
    pub async fn acquire(&self, peer: Nid, tunables: NiTunables) -> PeerCredit {
        let queue = self.queue(peer, tunables);
        queue.take().await
    }

    /// Counters for `peer`, if it is tracked.
    pub fn stats(&self, peer: Nid) -> Option<PoolStats> {
        self.queues.get(&peer).map(|q| q.stats(0))
    }

    /// Drops `peer`'s counters unless a credit is held, awaited or being
    /// taken. Returns whether they were dropped.
    pub fn forget(&self, peer: Nid) -> bool {
        // the map holds the only reference to an idle queue
        self.queues
            .remove_if(&peer, |_, q| Arc::strong_count(q) == 1)
            .is_some()
    }

    /// Peers with counters.
    pub fn tracked(&self) -> usize {
        self.queues.len()
    }
}

/// The three forwarding pools and the routing switch.
pub struct RouterPools {
    tiny: BufferPool,
    small: BufferPool,
    large: BufferPool,
    peers: PeerCredits,
    routing: AtomicBool,
}

impl RouterPools {
    /// Unsized pools; routing is off.
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            tiny: BufferPool::new(0),
            small: BufferPool::new(1),
            large: BufferPool::new(LARGE_BUFFER_PAGES),
            peers: PeerCredits::router(config.peer_buffer_credits),
            routing: AtomicBool::new(false),
        }
    }

    /// Sizes all pools and enables routing. Returns whether routing is on.
    pub fn alloc(&self, config: &RouterConfig, im_a_router: bool) -> TransportResult<bool> {
        match config.forwarding {
            Forwarding::Unset if !im_a_router => return Ok(false),
            Forwarding::Disabled => {
                info!("forwarding disabled");
                return Ok(false);
            }
            _ => {}
        }

        let count = |name: &str, n: i64| -> TransportResult<usize> {
            if n <= 0 {
                return Err(TransportError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, n
                )));
            }
            Ok(n as usize)
        };
        let tiny = count("tiny_router_buffers", config.tiny_router_buffers)?;
        let small = count("small_router_buffers", config.small_router_buffers)?;
        let large = count("large_router_buffers", config.large_router_buffers)?;

        let routing = self.is_routing();
        self.tiny.alloc_bufs(tiny, routing)?;
        self.small.alloc_bufs(small, routing)?;
        self.large.alloc_bufs(large, routing)?;

        self.routing.store(true, Ordering::SeqCst);
        info!(tiny, small, large, "routing enabled");
        Ok(true)
    }

    /// Disables routing and releases the pools.
    pub fn free(&self) -> TransportResult<()> {
        self.routing.store(false, Ordering::SeqCst);
        self.tiny.free_bufs()?;
        self.small.free_bufs()?;
        self.large.free_bufs()
    }

    /// Whether this node forwards.
    pub fn is_routing(&self) -> bool {
        self.routing.load(Ordering::SeqCst)
    }

    /// Smallest pool whose buffers hold `nob` bytes.
    pub fn pool_for(&self, nob: usize) -> &BufferPool {
        if nob == 0 {
            &self.tiny
        } else if nob <= PAGE_SIZE {
            &self.small
        } else {
            &self.large
        }
    }

    /// The zero-payload pool.
    pub fn tiny(&self) -> &BufferPool {
        &self.tiny
    }

    /// The one-page pool.
    pub fn small(&self) -> &BufferPool {
        &self.small
    }

    /// The MTU-sized pool.
    pub fn large(&self) -> &BufferPool {
        &self.large
    }

    /// Per-peer forwarding credits.
    pub fn peer_credits(&self) -> &PeerCredits {
        &self.peers
    }

    /// Takes a forwarding credit for `peer`, then a buffer for `nob` bytes.
    pub async fn acquire_forward(
        &self,
        peer: Nid,
        tunables: NiTunables,
        nob: usize,
    ) -> TransportResult<(PeerCredit, RouterBuffer)> {
        if !self.is_routing() {
            return Err(TransportError::InvalidArgument("not routing".to_string()));
        }
        if nob > LNET_MTU {
            return Err(TransportError::InvalidArgument(format!(
                "{} bytes exceeds the {} byte MTU",
                nob, LNET_MTU
            )));
        }
        let credit = self.peers.acquire(peer, tunables).await;
        let buf = self.pool_for(nob).acquire().await;
        Ok((credit, buf))
    }
}
