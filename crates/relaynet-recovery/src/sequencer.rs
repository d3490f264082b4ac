//! Transaction numbering and the committed watermark.
//!
//! Every successful server-side operation gets the next transaction
//! number. Replayed operations keep the number they were first given.
//! Replies can be held until their number is known durable; raising
//! the watermark hands them back.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, error};

struct SequencerState<R> {
    last_transno: u64,
    last_committed: u64,
    held: BTreeMap<u64, Vec<R>>,
}

/// Hands out transaction numbers and tracks what is durable.
pub struct TransactionSequencer<R> {
    state: Mutex<SequencerState<R>>,
}

impl<R> TransactionSequencer<R> {
    /// Sequencer continuing after `last_transno`, with everything up to
    /// it already committed.
    pub fn new(last_transno: u64) -> Self {
        Self {
            state: Mutex::new(SequencerState {
                last_transno,
                last_committed: last_transno,
                held: BTreeMap::new(),
            }),
        }
    }

    /// Highest number handed out or replayed.
    pub fn last_transno(&self) -> u64 {
        self.state.lock().last_transno
    }

    /// Highest number known durable.
    pub fn last_committed(&self) -> u64 {
        self.state.lock().last_committed
    }

    /// Raises the high-water mark to at least `transno`.
    pub fn observe(&self, transno: u64) {
        let mut state = self.state.lock();
        if transno > state.last_transno {
            state.last_transno = transno;
        }
    }

    /// Resets the watermark, dropping any held replies. Used while loading.
    pub fn reset_committed(&self, transno: u64) {
        let mut state = self.state.lock();
        state.last_committed = transno;
        state.held.clear();
    }

    /// Number for an operation that finished with `result`.
    ///
    /// A fresh operation (`replay_transno == 0`) that succeeded gets the
    /// next number. A replay keeps its number. A failed operation gets 0.
    pub fn assign(&self, result: i32, replay_transno: u64) -> u64 {
        let mut state = self.state.lock();
        if result != 0 {
            if replay_transno != 0 {
                error!(transno = replay_transno, result, "replayed transaction failed");
            }
            return 0;
        }
        if replay_transno == 0 {
            state.last_transno += 1;
            return state.last_transno;
        }
        if replay_transno > state.last_transno {
            state.last_transno = replay_transno;
        }
        replay_transno
    }

    /// Records that everything up to `transno` is durable.
    ///
    /// The watermark only moves forward. Replies held for numbers at or
    /// below the new watermark are returned in transno order.
    pub fn commit(&self, transno: u64) -> Vec<R> {
        let mut state = self.state.lock();
        if transno <= state.last_committed {
            return Vec::new();
        }
        state.last_committed = transno;
        let pending = state.held.split_off(&transno.saturating_add(1));
        let released = std::mem::replace(&mut state.held, pending);
        debug!(transno, released = released.len(), "transactions committed");
        released.into_values().flatten().collect()
    }

    /// Holds `reply` until `transno` commits. A reply whose number is
    /// already durable comes straight back.
    pub fn hold_reply(&self, transno: u64, reply: R) -> Option<R> {
        let mut state = self.state.lock();
        if transno <= state.last_committed {
            return Some(reply);
        }
        state.held.entry(transno).or_default().push(reply);
        None
    }

    /// Replies waiting for their transaction to commit.
    pub fn held(&self) -> usize {
        self.state.lock().held.values().map(Vec::len).sum()
    }
}
