#![warn(missing_docs)]

//! relaynet recovery subsystem: persisted client ledger and transaction sequencing
//!
//! A [`Ledger`] sits on a [`LedgerStore`] and records, per connected
//! client, the outcome of its last completed operation. After a restart
//! the records let replayed requests be answered from disk, while the
//! [`TransactionSequencer`] keeps transaction numbers monotonic and holds
//! replies until their transaction is durable.

pub mod config;
pub mod error;
pub mod layout;
pub mod ledger;
pub mod sequencer;
pub mod slots;
pub mod store;

pub use config::LedgerConfig;
pub use error::{RecoveryError, RecoveryResult};
pub use layout::{ClientRecord, LedgerUuid, ServerHeader};
pub use ledger::{
    ClientInfo, ClientSlot, HeldReply, Ledger, LedgerStats, OpOutcome, Opcode, Reconstructed,
};
pub use sequencer::TransactionSequencer;
pub use slots::SlotMap;
pub use store::{FileStore, LedgerStore, MemStore};
