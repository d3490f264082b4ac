//! Network interface driver seam.
//!
//! The transport never touches a wire directly. It binds memory
//! descriptors (MDs) through a [`NetworkInterface`], issues one-sided
//! put/get operations against them, and learns about progress through
//! [`NetEvent`]s delivered on a channel. Every binding produces exactly
//! one event with `unlinked == true`, and nothing after it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::TransportResult;
use crate::event::EventTag;
use crate::nid::{Nid, ProcessId};

/// Handle of a bound memory descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MdHandle(pub u64);

/// Scatter/gather memory shared between the owner and the network.
///
/// Cloning shares the same fragments.
#[derive(Debug, Clone, Default)]
pub struct Region {
    frags: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Region {
    /// Region covering a copy of `data` as one fragment.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_fragments(vec![data.to_vec()])
    }

    /// Zero-filled region of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from_fragments(vec![vec![0u8; len]])
    }

    /// Region over the given fragments, in order.
    pub fn from_fragments(frags: Vec<Vec<u8>>) -> Self {
        Self {
            frags: Arc::new(Mutex::new(frags)),
        }
    }

    /// Total length across fragments.
    pub fn len(&self) -> usize {
        self.frags.lock().iter().map(Vec::len).sum()
    }

    /// True when the region covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fragments.
    pub fn fragment_count(&self) -> usize {
        self.frags.lock().len()
    }

    /// Gathers up to `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let frags = self.frags.lock();
        let mut out = Vec::with_capacity(len);
        let mut skip = offset;
        for frag in frags.iter() {
            if out.len() == len {
                break;
            }
            if skip >= frag.len() {
                skip -= frag.len();
                continue;
            }
            let take = (frag.len() - skip).min(len - out.len());
            out.extend_from_slice(&frag[skip..skip + take]);
            skip = 0;
        }
        out
    }

    /// Scatters `data` starting at `offset`; returns the bytes written.
    pub fn write(&self, offset: usize, data: &[u8]) -> usize {
        let mut frags = self.frags.lock();
        let mut written = 0;
        let mut skip = offset;
        for frag in frags.iter_mut() {
            if written == data.len() {
                break;
            }
            if skip >= frag.len() {
                skip -= frag.len();
                continue;
            }
            let take = (frag.len() - skip).min(data.len() - written);
            frag[skip..skip + take].copy_from_slice(&data[written..written + take]);
            written += take;
            skip = 0;
        }
        written
    }

    /// Copies the whole region out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.frags.lock().concat()
    }
}

/// How many operations an MD accepts before it unlinks itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// Unlink after this many operations.
    Count(u32),
    /// Stay bound until explicitly unlinked.
    Infinite,
}

/// Behaviour flags for an MD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MdOptions {
    /// Accept incoming puts.
    pub op_put: bool,
    /// Accept incoming gets.
    pub op_get: bool,
    /// Truncate oversized incoming data instead of rejecting it.
    pub truncate: bool,
    /// Unlink once less than this many bytes remain free (request buffers).
    pub max_size: Option<usize>,
}

/// A memory region offered to the network.
#[derive(Debug, Clone)]
pub struct MemoryDescriptor {
    /// The memory.
    pub region: Region,
    /// Operation budget.
    pub threshold: Threshold,
    /// Behaviour flags.
    pub options: MdOptions,
    /// Opaque tag echoed in every event for this binding.
    pub user: EventTag,
}

/// Whether a put asks the target for an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRequest {
    /// Ask for an ACK event.
    Ack,
    /// No ACK.
    NoAck,
}

/// Where an active operation goes: the final target and the first hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTarget {
    /// Final destination.
    pub target: ProcessId,
    /// Directly reachable peer the message is handed to.
    pub next_hop: Nid,
}

impl SendTarget {
    /// Target reached without a gateway.
    pub fn direct(target: ProcessId) -> Self {
        Self {
            target,
            next_hop: target.nid,
        }
    }
}

/// Kind of completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Outgoing data left the local MD.
    Send,
    /// Incoming put landed in the MD.
    Put,
    /// A remote get read from the MD.
    Get,
    /// Data requested by a local get arrived.
    Reply,
    /// The target acknowledged a put.
    Ack,
    /// The MD was unlinked before its operations completed.
    Unlink,
}

/// Failure reported with an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventError {
    /// Unlinked locally before completion.
    Canceled,
    /// The peer could not be reached.
    Unreachable,
    /// Driver-specific error code.
    Driver(i32),
}

/// One completion event.
#[derive(Debug, Clone)]
pub struct NetEvent {
    /// What happened.
    pub kind: EventKind,
    /// Tag of the binding.
    pub tag: EventTag,
    /// Handle of the binding.
    pub md: MdHandle,
    /// Local interface the event happened on.
    pub ni: Nid,
    /// Remote side of the operation.
    pub initiator: ProcessId,
    /// Success or failure.
    pub status: Result<(), EventError>,
    /// Bytes actually moved.
    pub mlength: usize,
    /// Bytes the remote side offered.
    pub rlength: usize,
    /// Offset within the MD.
    pub offset: usize,
    /// Match bits of the operation.
    pub match_bits: u64,
    /// True on the final event of this binding.
    pub unlinked: bool,
}

impl NetEvent {
    /// True when the event reports success.
    pub fn ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Per-interface tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiTunables {
    /// Credits each peer gets for sends.
    pub peer_tx_credits: u32,
    /// Forwarding credits override for peers on this interface.
    pub peer_buffer_credits: Option<u32>,
}

impl Default for NiTunables {
    fn default() -> Self {
        Self {
            peer_tx_credits: 8,
            peer_buffer_credits: None,
        }
    }
}

/// Network interface driver.
///
/// Operations are non-blocking: they post work and report progress
/// through events.
pub trait NetworkInterface: Send + Sync {
    /// This interface's own NID.
    fn nid(&self) -> Nid;

    /// Tunables for peers reached through this interface.
    fn tunables(&self) -> NiTunables {
        NiTunables::default()
    }

    /// Binds an MD for an active operation.
    fn md_bind(&self, md: MemoryDescriptor) -> TransportResult<MdHandle>;

    /// Attaches an MD that remote peers can target on `portal`.
    /// Incoming match bits must equal `match_bits` outside `ignore_bits`.
    /// `match_id` restricts the initiator; `None` accepts anyone.
    fn me_attach(
        &self,
        portal: u32,
        match_id: Option<Nid>,
        match_bits: u64,
        ignore_bits: u64,
        md: MemoryDescriptor,
    ) -> TransportResult<MdHandle>;

    /// Unlinks an MD. If it is still bound an `Unlink` event follows;
    /// if it already finished this returns `NotFound`.
    fn md_unlink(&self, md: MdHandle) -> TransportResult<()>;

    /// Sends the MD's contents to `portal`/`match_bits` on the target.
    fn put(
        &self,
        md: MdHandle,
        ack: AckRequest,
        to: SendTarget,
        portal: u32,
        match_bits: u64,
    ) -> TransportResult<()>;

    /// Reads from `portal`/`match_bits` on the target into the MD.
    fn get(&self, md: MdHandle, to: SendTarget, portal: u32, match_bits: u64) -> TransportResult<()>;

    /// Liveness callback: tells the driver a peer went up or down.
    fn notify_peer(&self, peer: Nid, alive: bool);
}
