//! Persisted per-client completion records.
//!
//! The ledger keeps, for every connected client, the transaction number,
//! xid and result of its last completed operation in a fixed slot of a
//! durable store. After a restart the slots are read back so that a
//! client resending an operation the server already committed gets the
//! stored outcome instead of running it twice.
//!
//! Slot bits and on-disk records move together: a record is written
//! before its slot counts as claimed by a new client, and a freed
//! record is zeroed and synced before its bit is cleared.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::LedgerConfig;
use crate::error::{RecoveryError, RecoveryResult};
use crate::layout::{
    ClientRecord, LedgerUuid, ServerHeader, CLIENT_RECORD_LEN, COMPAT_MDT, INCOMPAT_COMMON_LR,
    INCOMPAT_MDT, INCOMPAT_SUPP, ROCOMPAT_LOVOBJID, ROCOMPAT_SUPP, SERVER_HEADER_LEN,
};
use crate::sequencer::TransactionSequencer;
use crate::slots::SlotMap;
use crate::store::LedgerStore;

/// A client's fixed position in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClientSlot {
    idx: u32,
    offset: u64,
}

impl ClientSlot {
    /// Slot index.
    pub fn idx(&self) -> u32 {
        self.idx
    }

    /// Byte offset of the slot's record.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Which record fields an operation updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    /// Any modifying operation other than close.
    Update,
    /// Close, tracked separately so it does not hide the last update.
    Close,
}

/// Outcome of an operation, recorded when its transaction stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpOutcome {
    /// Request xid.
    pub xid: u64,
    /// Kind of operation.
    pub opcode: Opcode,
    /// Result code; 0 for success.
    pub result: i32,
    /// Operation-specific reply data.
    pub data: u32,
    /// Transaction number carried by a replayed request, 0 otherwise.
    pub replay_transno: u64,
}

/// A previously committed outcome, returned instead of re-executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconstructed {
    /// Transaction number first assigned.
    pub transno: u64,
    /// Result code first returned.
    pub result: i32,
    /// Reply data first returned.
    pub data: u32,
}

/// A reply held back until its transaction is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldReply {
    /// Client the reply goes to.
    pub slot: ClientSlot,
    /// Request xid.
    pub xid: u64,
    /// Transaction the reply depends on.
    pub transno: u64,
    /// Encoded reply.
    pub payload: Vec<u8>,
}

/// View of one client for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    /// Client identity.
    pub uuid: String,
    /// Ledger position.
    pub slot: ClientSlot,
    /// Last committed transaction of the client.
    pub last_transno: u64,
    /// Xid of the client's last operation.
    pub last_xid: u64,
    /// Loaded at open and not yet through recovery.
    pub replay_needed: bool,
    /// Currently connected.
    pub connected: bool,
}

/// Ledger counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    /// Clients holding a slot.
    pub clients: u32,
    /// Clients loaded at open.
    pub recoverable_clients: u32,
    /// Highest transaction number handed out.
    pub last_transno: u64,
    /// Highest transaction number known durable.
    pub last_committed: u64,
    /// Opens of this ledger, this one included.
    pub mount_count: u64,
    /// Recovery is still running.
    pub recovering: bool,
    /// Next transaction number recovery expects to see replayed.
    pub next_recovery_transno: u64,
    /// Replies waiting for a commit.
    pub held_replies: usize,
    /// Write paths are refused.
    pub read_only: bool,
}

struct ClientEntry {
    record: ClientRecord,
    replay_needed: bool,
    connected: bool,
}

struct LedgerState {
    header: ServerHeader,
    slots: SlotMap,
    clients: HashMap<u32, ClientEntry>,
    recovering: bool,
    recoverable: u32,
    next_recovery_transno: u64,
}

impl LedgerState {
    fn slot(&self, idx: u32) -> ClientSlot {
        ClientSlot {
            idx,
            offset: self.header.client_offset(idx),
        }
    }
}

/// The client ledger and its transaction sequencer.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
    read_only: bool,
    state: Mutex<LedgerState>,
    sequencer: TransactionSequencer<HeldReply>,
}

impl Ledger {
    /// Opens the ledger, initializing an empty store and loading the
    /// clients of an existing one.
    pub fn open(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> RecoveryResult<Self> {
        config.validate()?;
        let size = store.size()?;
        let ours = LedgerUuid::new(&config.server_uuid);

        let mut header = if size == 0 {
            warn!(server = %ours, "new ledger, initializing");
            ServerHeader {
                uuid: ours,
                server_size: config.server_size,
                client_start: config.client_start,
                client_size: config.client_size,
                feature_rocompat: ROCOMPAT_LOVOBJID,
                feature_incompat: INCOMPAT_MDT | INCOMPAT_COMMON_LR,
                ..Default::default()
            }
        } else {
            let bytes = store.read_at(0, SERVER_HEADER_LEN).map_err(|e| match e {
                RecoveryError::ShortRead { got, .. } => {
                    RecoveryError::BadHeader(format!("header truncated: {} bytes", got))
                }
                other => other,
            })?;
            let header = ServerHeader::from_bytes(&bytes)?;
            if header.uuid != ours {
                error!(server = %ours, found = %header.uuid, "ledger belongs to another server");
                return Err(RecoveryError::WrongDisk {
                    expected: ours.as_str(),
                    found: header.uuid.as_str(),
                });
            }
            header
        };

        let incompat = header.feature_incompat & !INCOMPAT_SUPP;
        if incompat != 0 {
            error!(mask = incompat, "unsupported incompat feature(s)");
            return Err(RecoveryError::UnsupportedFeature {
                kind: "incompat",
                mask: incompat,
            });
        }
        let rocompat = header.feature_rocompat & !ROCOMPAT_SUPP;
        let read_only = rocompat != 0;
        if read_only {
            warn!(mask = rocompat, "unsupported read-only feature(s), opening ledger read-only");
        }
        if header.upgrade_legacy() {
            warn!("using legacy ledger header layout");
        }
        header.feature_compat = COMPAT_MDT;

        if header.server_size == 0 || header.client_start == 0 || header.client_size == 0 {
            error!(
                server_size = header.server_size,
                client_start = header.client_start,
                client_size = header.client_size,
                "bad ledger header contents"
            );
            return Err(RecoveryError::BadHeader(
                "zero server_size, client_start or client_size".to_string(),
            ));
        }
        if (header.client_size as usize) < CLIENT_RECORD_LEN {
            return Err(RecoveryError::BadHeader(format!(
                "client_size {} below record length {}",
                header.client_size, CLIENT_RECORD_LEN
            )));
        }

        let on_disk = if size <= header.client_start as u64 {
            0
        } else {
            (size - header.client_start as u64) / header.client_size as u64
        };
        debug!(
            server = %header.uuid,
            last_transno = header.last_transno,
            mount_count = header.mount_count + 1,
            server_size = header.server_size,
            client_start = header.client_start,
            client_size = header.client_size,
            ledger_size = size,
            ledger_clients = on_disk,
            "ledger header"
        );

        let sequencer = TransactionSequencer::new(header.last_transno);
        let mut state = LedgerState {
            header,
            slots: SlotMap::new(config.max_clients),
            clients: HashMap::new(),
            recovering: false,
            recoverable: 0,
            next_recovery_transno: 0,
        };
        load_clients(store.as_ref(), &mut state, &sequencer, size)?;

        let last_transno = sequencer.last_transno();
        sequencer.reset_committed(last_transno);
        if state.recoverable > 0 {
            warn!(
                recoverable_clients = state.recoverable,
                last_transno,
                "recovery: clients must replay"
            );
            state.recovering = true;
            state.next_recovery_transno = last_transno + 1;
        }

        state.header.mount_count += 1;
        state.header.last_transno = last_transno;
        if read_only {
            debug!("read-only ledger, header not rewritten");
        } else {
            store.write_at(0, &state.header.to_bytes()?)?;
            store.sync()?;
        }

        info!(
            server = %state.header.uuid,
            mount_count = state.header.mount_count,
            last_transno,
            clients = state.clients.len(),
            "ledger opened"
        );

        Ok(Self {
            store,
            config,
            read_only,
            state: Mutex::new(state),
            sequencer,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Write paths are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Recovery is still running.
    pub fn is_recovering(&self) -> bool {
        self.state.lock().recovering
    }

    /// Transaction numbering for this ledger.
    pub fn sequencer(&self) -> &TransactionSequencer<HeldReply> {
        &self.sequencer
    }

    fn check_writable(&self) -> RecoveryResult<()> {
        if self.read_only {
            return Err(RecoveryError::ReadOnly);
        }
        Ok(())
    }

    /// Gives a newly connected client the lowest free slot and writes its
    /// record there.
    pub fn client_add(&self, uuid: &str) -> RecoveryResult<ClientSlot> {
        self.check_writable()?;
        let uuid = LedgerUuid::new(uuid);
        let mut state = self.state.lock();
        if uuid.is_empty() {
            return Err(RecoveryError::InvalidArgument("empty client identity".to_string()));
        }
        if uuid == state.header.uuid {
            return Err(RecoveryError::InvalidArgument(format!(
                "{} is the server's own identity",
                uuid
            )));
        }
        if let Some((&idx, _)) = state.clients.iter().find(|(_, c)| c.record.uuid == uuid) {
            return Err(RecoveryError::SlotConflict {
                idx,
                reason: format!("{} already holds this slot", uuid),
            });
        }

        let max = state.slots.capacity();
        let Some(idx) = state.slots.claim_lowest() else {
            error!(max, "no room for clients");
            return Err(RecoveryError::SlotsExhausted { max });
        };
        let slot = state.slot(idx);
        let record = ClientRecord::new(uuid);
        let written = record
            .to_bytes(state.header.client_size)
            .and_then(|bytes| self.store.write_at(slot.offset, &bytes));
        if let Err(e) = written {
            warn!(client = %uuid, idx, error = %e, "cannot write new client record");
            let _ = state.slots.release(idx);
            return Err(e);
        }

        state.clients.insert(
            idx,
            ClientEntry {
                record,
                replay_needed: false,
                connected: true,
            },
        );
        info!(client = %uuid, idx, offset = slot.offset, "client added");
        Ok(slot)
    }

    /// Finds the slot a returning client held before, marking it connected.
    pub fn reconnect(&self, uuid: &str) -> Option<ClientSlot> {
        let uuid = LedgerUuid::new(uuid);
        let mut state = self.state.lock();
        let idx = state
            .clients
            .iter()
            .find(|(_, c)| c.record.uuid == uuid)
            .map(|(&idx, _)| idx)?;
        if let Some(entry) = state.clients.get_mut(&idx) {
            entry.connected = true;
            debug!(client = %uuid, idx, replay_needed = entry.replay_needed, "client reconnected");
        }
        Some(state.slot(idx))
    }

    /// Marks a client disconnected; later commits for it are refused.
    pub fn client_disconnect(&self, slot: ClientSlot) {
        if let Some(entry) = self.state.lock().clients.get_mut(&slot.idx) {
            entry.connected = false;
            debug!(client = %entry.record.uuid, idx = slot.idx, "client disconnected");
        }
    }

    /// Releases a client's slot.
    ///
    /// The record is zeroed and synced before the slot bit is cleared,
    /// so a concurrent add cannot be handed a slot whose old record is
    /// still on disk. The server header is rewritten afterwards.
    pub fn client_free(&self, slot: ClientSlot) -> RecoveryResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        self.free_locked(&mut state, slot.idx)?;
        self.write_header_locked(&mut state)
    }

    fn free_locked(&self, state: &mut LedgerState, idx: u32) -> RecoveryResult<()> {
        let uuid = match state.clients.get(&idx) {
            Some(entry) => entry.record.uuid,
            None => return Err(RecoveryError::NotConnected(format!("no client in slot {}", idx))),
        };
        if !state.slots.is_set(idx) {
            error!(client = %uuid, idx, "slot bit already clear");
            return Err(RecoveryError::SlotConflict {
                idx,
                reason: "already free".to_string(),
            });
        }

        let offset = state.header.client_offset(idx);
        let zeroed = ClientRecord::default().to_bytes(state.header.client_size)?;
        if let Err(e) = self.store.write_at(offset, &zeroed).and_then(|_| self.store.sync()) {
            error!(client = %uuid, idx, offset, error = %e, "cannot zero client record");
            return Err(e);
        }
        state.slots.release(idx)?;
        state.clients.remove(&idx);
        info!(client = %uuid, idx, offset, "client freed");
        Ok(())
    }

    fn write_header_locked(&self, state: &mut LedgerState) -> RecoveryResult<()> {
        state.header.last_transno = self.sequencer.last_transno();
        self.store.write_at(0, &state.header.to_bytes()?)?;
        debug!(
            mount_count = state.header.mount_count,
            last_transno = state.header.last_transno,
            "ledger header written"
        );
        Ok(())
    }

    /// Rewrites the server header with the current transaction number
    /// and syncs it.
    pub fn flush_header(&self) -> RecoveryResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        self.write_header_locked(&mut state)?;
        self.store.sync()
    }

    /// Assigns the operation its transaction number and records its
    /// outcome in the client's slot.
    ///
    /// Returns the transaction number; 0 for a failed operation. The
    /// write is not synced; [`Ledger::commit`] makes it durable.
    pub fn txn_stop(&self, slot: ClientSlot, outcome: OpOutcome) -> RecoveryResult<u64> {
        let mut state = self.state.lock();
        let client_size = state.header.client_size;
        let recovering = state.recovering;

        let entry = match state.clients.get_mut(&slot.idx) {
            Some(entry) if entry.connected => entry,
            Some(entry) => {
                warn!(
                    client = %entry.record.uuid,
                    result = outcome.result,
                    "commit for disconnected client"
                );
                return Err(RecoveryError::NotConnected(entry.record.uuid.as_str()));
            }
            None => return Err(RecoveryError::NotConnected(format!("no client in slot {}", slot.idx))),
        };
        self.check_writable()?;
        let transno = self.sequencer.assign(outcome.result, outcome.replay_transno);

        let rec = &mut entry.record;
        match outcome.opcode {
            Opcode::Close => {
                rec.last_close_transno = transno;
                rec.last_close_xid = outcome.xid;
                rec.last_close_result = outcome.result;
            }
            Opcode::Update => {
                rec.last_transno = transno;
                rec.last_xid = outcome.xid;
                rec.last_result = outcome.result;
                rec.last_data = outcome.data;
            }
        }
        let bytes = rec.to_bytes(client_size)?;
        let uuid = rec.uuid;
        self.store.write_at(slot.offset, &bytes)?;

        if recovering && outcome.replay_transno >= state.next_recovery_transno {
            state.next_recovery_transno = outcome.replay_transno + 1;
        }
        debug!(
            client = %uuid,
            idx = slot.idx,
            xid = outcome.xid,
            transno,
            result = outcome.result,
            "transaction recorded"
        );
        Ok(transno)
    }

    /// Makes recorded outcomes durable and moves the committed watermark
    /// to `transno`. Returns the replies that were waiting for it.
    ///
    /// `transno` may not exceed the highest number handed out.
    pub fn commit(&self, transno: u64) -> RecoveryResult<Vec<HeldReply>> {
        let last = self.sequencer.last_transno();
        if transno > last {
            error!(transno, last_transno = last, "commit beyond last assigned transaction");
            return Err(RecoveryError::InvalidArgument(format!(
                "cannot commit transno {} past last assigned {}",
                transno, last
            )));
        }
        self.store.sync()?;
        Ok(self.sequencer.commit(transno))
    }

    /// Highest transaction number handed out.
    pub fn last_transno(&self) -> u64 {
        self.sequencer.last_transno()
    }

    /// Highest transaction number known durable.
    pub fn last_committed(&self) -> u64 {
        self.sequencer.last_committed()
    }

    /// Holds `reply` until its transaction commits. Comes straight back
    /// when it already has.
    pub fn hold_reply(&self, reply: HeldReply) -> Option<HeldReply> {
        self.sequencer.hold_reply(reply.transno, reply)
    }

    /// Stored outcome of the client's request `xid`, if it was the last
    /// update or the last close the client completed.
    pub fn reconstruct(&self, slot: ClientSlot, xid: u64) -> Option<Reconstructed> {
        let state = self.state.lock();
        let rec = &state.clients.get(&slot.idx)?.record;
        if xid == 0 {
            return None;
        }
        let found = if rec.last_xid == xid {
            Reconstructed {
                transno: rec.last_transno,
                result: rec.last_result,
                data: rec.last_data,
            }
        } else if rec.last_close_xid == xid {
            Reconstructed {
                transno: rec.last_close_transno,
                result: rec.last_close_result,
                data: 0,
            }
        } else {
            return None;
        };
        debug!(
            client = %rec.uuid,
            xid,
            transno = found.transno,
            result = found.result,
            "restoring stored outcome"
        );
        Some(found)
    }

    /// Ends recovery. Clients loaded at open that never reconnected lose
    /// their slots; returns how many.
    pub fn end_recovery(&self) -> RecoveryResult<usize> {
        let mut state = self.state.lock();
        if !state.recovering {
            return Ok(0);
        }
        let stale: Vec<u32> = state
            .clients
            .iter()
            .filter(|(_, c)| c.replay_needed && !c.connected)
            .map(|(&idx, _)| idx)
            .collect();
        if !stale.is_empty() {
            self.check_writable()?;
        }
        for &idx in &stale {
            self.free_locked(&mut state, idx)?;
        }
        for entry in state.clients.values_mut() {
            entry.replay_needed = false;
        }
        state.recovering = false;
        if !self.read_only {
            self.write_header_locked(&mut state)?;
            self.store.sync()?;
        }
        info!(evicted = stale.len(), clients = state.clients.len(), "recovery complete");
        Ok(stale.len())
    }

    /// The client in `slot`.
    pub fn client(&self, slot: ClientSlot) -> Option<ClientInfo> {
        let state = self.state.lock();
        state.clients.get(&slot.idx).map(|c| client_info(&state, slot.idx, c))
    }

    /// Every client holding a slot, in slot order.
    pub fn clients(&self) -> Vec<ClientInfo> {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .filter_map(|idx| state.clients.get(&idx).map(|c| client_info(&state, idx, c)))
            .collect()
    }

    /// Counters.
    pub fn stats(&self) -> LedgerStats {
        let state = self.state.lock();
        LedgerStats {
            clients: state.slots.in_use(),
            recoverable_clients: state.recoverable,
            last_transno: self.sequencer.last_transno(),
            last_committed: self.sequencer.last_committed(),
            mount_count: state.header.mount_count,
            recovering: state.recovering,
            next_recovery_transno: state.next_recovery_transno,
            held_replies: self.sequencer.held(),
            read_only: self.read_only,
        }
    }
}

fn client_info(state: &LedgerState, idx: u32, entry: &ClientEntry) -> ClientInfo {
    ClientInfo {
        uuid: entry.record.uuid.as_str(),
        slot: state.slot(idx),
        last_transno: entry.record.max_transno(),
        last_xid: entry.record.last_xid,
        replay_needed: entry.replay_needed,
        connected: entry.connected,
    }
}

/// Reads every slot up to the end of the store. A read error ends the
/// scan without failing the open.
fn load_clients(
    store: &dyn LedgerStore,
    state: &mut LedgerState,
    sequencer: &TransactionSequencer<HeldReply>,
    size: u64,
) -> RecoveryResult<()> {
    let client_size = state.header.client_size as usize;
    let mut idx = 0u32;
    loop {
        let offset = state.header.client_offset(idx);
        if offset >= size {
            break;
        }
        let record = match store
            .read_at(offset, client_size)
            .and_then(|bytes| ClientRecord::from_bytes(&bytes))
        {
            Ok(record) => record,
            Err(e) => {
                error!(idx, offset, error = %e, "error reading client record, ending scan");
                break;
            }
        };
        let this = idx;
        idx += 1;

        if record.uuid.is_empty() {
            debug!(idx = this, "skipping zeroed client");
            continue;
        }

        state.slots.claim(this)?;
        let last_transno = record.max_transno();
        debug!(
            client = %record.uuid,
            idx = this,
            last_transno,
            last_xid = record.last_xid,
            "recovering client"
        );
        sequencer.observe(last_transno);
        state.clients.insert(
            this,
            ClientEntry {
                record,
                replay_needed: true,
                connected: false,
            },
        );
        state.recoverable += 1;
    }
    Ok(())
}
