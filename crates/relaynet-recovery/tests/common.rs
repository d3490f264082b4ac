//! Shared fixtures for the recovery integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use relaynet_recovery::{ClientSlot, Ledger, LedgerConfig, LedgerStore, OpOutcome, Opcode};

pub const SERVER: &str = "mds1_UUID";

pub fn config() -> LedgerConfig {
    LedgerConfig::for_server(SERVER)
}

pub fn open(store: Arc<dyn LedgerStore>) -> Ledger {
    Ledger::open(store, config()).expect("open ledger")
}

pub fn update(xid: u64, result: i32, data: u32) -> OpOutcome {
    OpOutcome {
        xid,
        opcode: Opcode::Update,
        result,
        data,
        replay_transno: 0,
    }
}

pub fn replay(xid: u64, transno: u64) -> OpOutcome {
    OpOutcome {
        replay_transno: transno,
        ..update(xid, 0, 0)
    }
}

/// Runs successful updates for `slot` until the sequencer hands out `transno`.
pub fn advance_to(ledger: &Ledger, slot: ClientSlot, transno: u64, first_xid: u64) -> u64 {
    let mut xid = first_xid;
    loop {
        let t = ledger.txn_stop(slot, update(xid, 0, xid as u32)).expect("txn_stop");
        if t >= transno {
            return xid;
        }
        xid += 1;
    }
}
