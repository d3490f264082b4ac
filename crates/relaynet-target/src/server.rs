//! Server side of modifying requests.
//!
//! Every request that reaches a [`TargetServer`] runs through the same
//! path: the client's ledger slot is found (or claimed), a resent xid
//! is answered from the slot's record without running the operation
//! again, and anything else runs, gets its transaction number, and has
//! its outcome written to the slot. A reply carrying a transaction
//! number is held until that number commits.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use relaynet_recovery::{ClientSlot, HeldReply, Ledger, OpOutcome, Opcode, RecoveryError};
use relaynet_transport::{IncomingRequest, Lnet, Reply, Service, ServiceConfig};
use tracing::{debug, info, warn};

use crate::error::{TargetError, TargetResult};
use crate::wire::{encode_reply_data, TargetRequest};

/// Reply status for a request body that cannot be decoded.
pub const STATUS_PROTO: i32 = -71;
/// Reply status for an invalid client identity.
pub const STATUS_INVALID: i32 = -22;
/// Reply status when no client slot is free.
pub const STATUS_NO_SPACE: i32 = -28;
/// Reply status when the ledger only allows reads.
pub const STATUS_READ_ONLY: i32 = -30;
/// Reply status for a client the ledger no longer knows.
pub const STATUS_NOT_CONNECTED: i32 = -107;
/// Reply status for any other ledger failure.
pub const STATUS_IO: i32 = -5;

/// Result of running one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpResult {
    /// 0 on success, negative error otherwise.
    pub result: i32,
    /// Operation-specific reply data.
    pub data: u32,
}

/// Runs the operations a target serves.
pub trait OpHandler: Send + Sync {
    /// Executes `opcode` with `body` on behalf of `client`.
    fn execute(&self, client: &str, opcode: Opcode, body: &[u8]) -> OpResult;
}

/// What happened to a handled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Answered at once; failed operations carry transno 0.
    Replied {
        /// Transaction number in the reply.
        transno: u64,
    },
    /// Waiting for `transno` to commit.
    Held {
        /// Transaction the reply waits for.
        transno: u64,
    },
    /// A resend answered from the client's record.
    Reconstructed {
        /// Transaction number first assigned.
        transno: u64,
    },
    /// Refused before reaching the operation.
    Rejected {
        /// Error status sent back.
        status: i32,
    },
}

fn status_of(err: &RecoveryError) -> i32 {
    match err {
        RecoveryError::InvalidArgument(_) | RecoveryError::SlotConflict { .. } => STATUS_INVALID,
        RecoveryError::SlotsExhausted { .. } => STATUS_NO_SPACE,
        RecoveryError::ReadOnly => STATUS_READ_ONLY,
        RecoveryError::NotConnected(_) => STATUS_NOT_CONNECTED,
        _ => STATUS_IO,
    }
}

/// A request service whose modifying operations are recorded in a
/// [`Ledger`].
pub struct TargetServer {
    service: Service,
    ledger: Arc<Ledger>,
    handler: Arc<dyn OpHandler>,
    pending: DashMap<(u32, u64), IncomingRequest>,
}

impl TargetServer {
    /// Registers the request service and starts serving over `ledger`.
    pub async fn start(
        lnet: &Arc<Lnet>,
        config: ServiceConfig,
        ledger: Arc<Ledger>,
        handler: Arc<dyn OpHandler>,
    ) -> TargetResult<Self> {
        let service = Service::register(lnet, config).await?;
        let stats = ledger.stats();
        info!(
            clients = stats.clients,
            last_transno = stats.last_transno,
            recovering = stats.recovering,
            "target serving"
        );
        Ok(Self {
            service,
            ledger,
            handler,
            pending: DashMap::new(),
        })
    }

    /// The client ledger.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// The underlying request service.
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Replies held for an uncommitted transaction.
    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    /// Waits for the next request and handles it. `None` once the
    /// service has shut down.
    pub async fn serve_one(&mut self) -> TargetResult<Option<Disposition>> {
        match self.service.recv().await {
            Some(incoming) => self.handle(incoming).map(Some),
            None => Ok(None),
        }
    }

    /// Handles requests until the service shuts down. Only fatal
    /// errors end the loop early.
    pub async fn run(&mut self) -> TargetResult<()> {
        while let Some(incoming) = self.service.recv().await {
            let xid = incoming.xid;
            if let Err(e) = self.handle(incoming) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(xid, error = %e, "request failed");
            }
        }
        Ok(())
    }

    /// Handles one request.
    pub fn handle(&self, incoming: IncomingRequest) -> TargetResult<Disposition> {
        let req = match TargetRequest::decode(&incoming.payload) {
            Ok(req) => req,
            Err(e) => {
                warn!(xid = incoming.xid, peer = %incoming.peer, error = %e, "undecodable request");
                return self.reject(&incoming, STATUS_PROTO);
            }
        };

        let slot = match self.client_slot(&req.client) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(xid = incoming.xid, client = %req.client, error = %e, "no ledger slot for client");
                return self.reject(&incoming, status_of(&e));
            }
        };

        let key = (slot.idx(), incoming.xid);
        if let Some(mut waiting) = self.pending.get_mut(&key) {
            debug!(xid = incoming.xid, client = %req.client, "resend of a held reply");
            let transno = self
                .ledger
                .reconstruct(slot, incoming.xid)
                .map_or(0, |r| r.transno);
            *waiting = incoming;
            return Ok(Disposition::Held { transno });
        }

        if let Some(stored) = self.ledger.reconstruct(slot, incoming.xid) {
            let reply = Reply {
                status: stored.result,
                transno: stored.transno,
                payload: Bytes::from(encode_reply_data(stored.data)),
            };
            self.reply(&incoming, reply)?;
            return Ok(Disposition::Reconstructed {
                transno: stored.transno,
            });
        }

        let op = self.handler.execute(&req.client, req.opcode, &req.body);
        let outcome = OpOutcome {
            xid: incoming.xid,
            opcode: req.opcode,
            result: op.result,
            data: op.data,
            replay_transno: req.replay_transno,
        };
        let transno = match self.ledger.txn_stop(slot, outcome) {
            Ok(transno) => transno,
            Err(e) => {
                warn!(xid = incoming.xid, client = %req.client, error = %e, "cannot record outcome");
                return self.reject(&incoming, status_of(&e));
            }
        };

        let payload = encode_reply_data(op.data);
        if transno == 0 {
            let reply = Reply {
                status: op.result,
                transno: 0,
                payload: Bytes::from(payload),
            };
            self.reply(&incoming, reply)?;
            return Ok(Disposition::Replied { transno: 0 });
        }

        self.pending.insert(key, incoming);
        let held = HeldReply {
            slot,
            xid: key.1,
            transno,
            payload,
        };
        match self.ledger.hold_reply(held) {
            None => {
                debug!(xid = key.1, transno, "reply held until commit");
                Ok(Disposition::Held { transno })
            }
            Some(ready) => {
                self.release(ready)?;
                Ok(Disposition::Replied { transno })
            }
        }
    }

    /// Commits through `transno` and sends the replies that were
    /// waiting for it. Returns how many were sent.
    pub fn commit(&self, transno: u64) -> TargetResult<usize> {
        let released = self.ledger.commit(transno)?;
        let mut sent = 0;
        for held in released {
            if self.release(held)? {
                sent += 1;
            }
        }
        debug!(transno, sent, "held replies released");
        Ok(sent)
    }

    /// Commits everything handed out so far.
    pub fn commit_all(&self) -> TargetResult<usize> {
        self.commit(self.ledger.last_transno())
    }

    /// Unlinks the request buffers and waits for the network to let go.
    pub async fn shutdown(&self) {
        if !self.pending.is_empty() {
            warn!(held = self.pending.len(), "shutting down with uncommitted replies");
        }
        self.service.shutdown().await;
    }

    fn client_slot(&self, client: &str) -> Result<ClientSlot, RecoveryError> {
        match self.ledger.reconnect(client) {
            Some(slot) => Ok(slot),
            None => self.ledger.client_add(client),
        }
    }

    fn release(&self, held: HeldReply) -> TargetResult<bool> {
        let Some((_, incoming)) = self.pending.remove(&(held.slot.idx(), held.xid)) else {
            debug!(xid = held.xid, transno = held.transno, "no request waiting for committed reply");
            return Ok(false);
        };
        let reply = Reply::ok(held.payload).with_transno(held.transno);
        self.reply(&incoming, reply)?;
        Ok(true)
    }

    fn reject(&self, incoming: &IncomingRequest, status: i32) -> TargetResult<Disposition> {
        self.reply(incoming, Reply::error(status))?;
        Ok(Disposition::Rejected { status })
    }

    fn reply(&self, incoming: &IncomingRequest, reply: Reply) -> TargetResult<()> {
        let transno = reply.transno;
        let status = reply.status;
        self.service
            .send_reply(incoming, reply, false)
            .map_err(TargetError::from)?;
        debug!(xid = incoming.xid, peer = %incoming.peer, transno, status, "reply sent");
        Ok(())
    }
}
