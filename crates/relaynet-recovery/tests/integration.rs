//! Restart and replay scenarios against file and in-memory stores.

mod common;

use std::sync::Arc;

use common::{advance_to, open, replay, update, SERVER};
use relaynet_recovery::layout::{COMPAT_MDT, INCOMPAT_COMMON_LR, INCOMPAT_MDT, ROCOMPAT_LOVOBJID};
use relaynet_recovery::{
    ClientRecord, FileStore, HeldReply, Ledger, LedgerConfig, LedgerStore, MemStore, Opcode,
    Reconstructed, RecoveryError, ServerHeader,
};
use tempfile::tempdir;

#[test]
fn test_replay_after_restart_returns_stored_result() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("last_rcvd");

    {
        let ledger = open(Arc::new(FileStore::open(&path).unwrap()));
        let slot = ledger.client_add("client-a").unwrap();
        let last_xid = advance_to(&ledger, slot, 42, 1);
        assert_eq!(last_xid, 42);
        ledger.commit(42).unwrap();
        assert_eq!(ledger.stats().last_committed, 42);
    }

    let ledger = open(Arc::new(FileStore::open(&path).unwrap()));
    let stats = ledger.stats();
    assert_eq!(stats.last_transno, 42);
    assert_eq!(stats.last_committed, 42);
    assert_eq!(stats.mount_count, 2);
    assert!(stats.recovering);
    assert_eq!(stats.next_recovery_transno, 43);

    let slot = ledger.reconnect("client-a").unwrap();
    assert_eq!(slot.idx(), 0);

    // The resent request is answered from the record.
    assert_eq!(
        ledger.reconstruct(slot, 42),
        Some(Reconstructed {
            transno: 42,
            result: 0,
            data: 42
        })
    );
    assert_eq!(ledger.stats().last_transno, 42);

    // Re-executing with its old number keeps the number.
    assert_eq!(ledger.txn_stop(slot, replay(42, 42)).unwrap(), 42);
    assert_eq!(ledger.stats().last_transno, 42);

    assert_eq!(ledger.end_recovery().unwrap(), 0);
    assert_eq!(ledger.txn_stop(slot, update(43, 0, 0)).unwrap(), 43);
}

#[test]
fn test_replayed_transno_raises_high_water_mark() {
    let store = MemStore::new();
    {
        let ledger = open(Arc::new(store.clone()));
        let slot = ledger.client_add("client-a").unwrap();
        advance_to(&ledger, slot, 10, 1);
    }

    let ledger = open(Arc::new(store.clone()));
    let slot = ledger.reconnect("client-a").unwrap();
    assert_eq!(ledger.txn_stop(slot, replay(50, 30)).unwrap(), 30);
    assert_eq!(ledger.stats().last_transno, 30);
    assert_eq!(ledger.stats().next_recovery_transno, 31);
    assert_eq!(ledger.txn_stop(slot, update(51, 0, 0)).unwrap(), 31);
}

#[test]
fn test_file_store_reopen_keeps_slots_stable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("last_rcvd");

    let (a, c) = {
        let ledger = open(Arc::new(FileStore::open(&path).unwrap()));
        let a = ledger.client_add("a").unwrap();
        let b = ledger.client_add("b").unwrap();
        let c = ledger.client_add("c").unwrap();
        ledger.txn_stop(a, update(1, 0, 0)).unwrap();
        ledger.txn_stop(c, update(1, 0, 0)).unwrap();
        ledger.client_free(b).unwrap();
        ledger.commit(2).unwrap();
        (a, c)
    };

    let ledger = open(Arc::new(FileStore::open(&path).unwrap()));
    let loaded: Vec<(String, u32)> = ledger
        .clients()
        .into_iter()
        .map(|info| (info.uuid, info.slot.idx()))
        .collect();
    assert_eq!(loaded, vec![("a".to_string(), a.idx()), ("c".to_string(), c.idx())]);
    assert_eq!(ledger.reconnect("c"), Some(c));
    assert_eq!(ledger.end_recovery().unwrap(), 1);

    // The freed and the evicted slot are reused lowest first.
    assert_eq!(ledger.client_add("d").unwrap().idx(), 0);
    assert_eq!(ledger.client_add("e").unwrap().idx(), 1);
    assert_eq!(ledger.client_add("f").unwrap().idx(), 3);
}

#[test]
fn test_legacy_header_is_converted() {
    let legacy = ServerHeader {
        uuid: relaynet_recovery::LedgerUuid::new(SERVER),
        last_transno: 5,
        compat14: 77,
        feature_rocompat: ROCOMPAT_LOVOBJID,
        feature_incompat: INCOMPAT_MDT,
        server_size: 512,
        client_start: 8192,
        client_size: 128,
        ..Default::default()
    };
    let store = MemStore::with_contents(legacy.to_bytes().unwrap());

    let ledger = open(Arc::new(store.clone()));
    let stats = ledger.stats();
    assert_eq!(stats.mount_count, 6);
    assert_eq!(stats.last_transno, 77);
    drop(ledger);

    let header = ServerHeader::from_bytes(&store.contents()).unwrap();
    assert_eq!(header.feature_incompat, INCOMPAT_MDT | INCOMPAT_COMMON_LR);
    assert_eq!(header.feature_compat, COMPAT_MDT);
    assert_eq!((header.mount_count, header.last_transno), (6, 77));

    assert_eq!(open(Arc::new(store)).stats().mount_count, 7);
}

#[test]
fn test_ledger_of_another_server_refused() {
    let store = MemStore::new();
    drop(open(Arc::new(store.clone())));

    let err = Ledger::open(Arc::new(store), LedgerConfig::for_server("mds2_UUID"))
        .err()
        .unwrap();
    match err {
        RecoveryError::WrongDisk { expected, found } => {
            assert_eq!(expected, "mds2_UUID");
            assert_eq!(found, SERVER);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_truncated_header_is_bad_header() {
    let store = MemStore::with_contents(vec![0x5a; 20]);
    let err = Ledger::open(Arc::new(store), common::config()).err().unwrap();
    assert!(matches!(err, RecoveryError::BadHeader(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_read_only_ledger_still_reconstructs() {
    let store = MemStore::new();
    {
        let ledger = open(Arc::new(store.clone()));
        let slot = ledger.client_add("a").unwrap();
        ledger.txn_stop(slot, update(9, -2, 0)).unwrap();
        ledger.txn_stop(slot, update(10, 0, 4)).unwrap();
    }
    let mut header = ServerHeader::from_bytes(&store.contents()).unwrap();
    header.feature_rocompat |= 0x80;
    store.write_at(0, &header.to_bytes().unwrap()).unwrap();

    let ledger = open(Arc::new(store.clone()));
    assert!(ledger.stats().read_only);
    let slot = ledger.reconnect("a").unwrap();
    assert_eq!(
        ledger.reconstruct(slot, 10),
        Some(Reconstructed {
            transno: 1,
            result: 0,
            data: 4
        })
    );
    assert!(matches!(
        ledger.txn_stop(slot, update(11, 0, 0)),
        Err(RecoveryError::ReadOnly)
    ));
    assert!(matches!(ledger.client_free(slot), Err(RecoveryError::ReadOnly)));
    assert!(matches!(ledger.flush_header(), Err(RecoveryError::ReadOnly)));
}

#[test]
fn test_close_tracked_apart_from_update() {
    let store = MemStore::new();
    let ledger = open(Arc::new(store.clone()));
    let slot = ledger.client_add("a").unwrap();
    ledger.txn_stop(slot, update(1, 0, 11)).unwrap();
    let close = relaynet_recovery::OpOutcome {
        opcode: Opcode::Close,
        ..update(2, 0, 0)
    };
    ledger.txn_stop(slot, close).unwrap();
    ledger.commit(2).unwrap();
    drop(ledger);

    let ledger = open(Arc::new(store));
    let slot = ledger.reconnect("a").unwrap();
    assert_eq!(ledger.reconstruct(slot, 1).map(|r| r.data), Some(11));
    assert_eq!(ledger.reconstruct(slot, 2).map(|r| r.transno), Some(2));
    assert_eq!(ledger.clients()[0].last_transno, 2);
}

#[test]
fn test_replies_released_after_commit() {
    let store = MemStore::new();
    let ledger = open(Arc::new(store));
    let a = ledger.client_add("a").unwrap();
    let b = ledger.client_add("b").unwrap();

    let mut held = Vec::new();
    for (slot, xid) in [(a, 1), (b, 1), (a, 2)] {
        let transno = ledger.txn_stop(slot, update(xid, 0, 0)).unwrap();
        let reply = HeldReply {
            slot,
            xid,
            transno,
            payload: vec![transno as u8],
        };
        assert!(ledger.hold_reply(reply.clone()).is_none());
        held.push(reply);
    }

    let first = ledger.commit(2).unwrap();
    assert_eq!(first, held[..2].to_vec());
    assert_eq!(ledger.stats().held_replies, 1);
    // A stale commit releases nothing.
    assert!(ledger.commit(1).unwrap().is_empty());
    assert_eq!(ledger.commit(3).unwrap(), held[2..].to_vec());
}

#[test]
fn test_free_clears_record_before_bit() {
    let store = MemStore::new();
    let ledger = open(Arc::new(store.clone()));
    let a = ledger.client_add("a").unwrap();
    let b = ledger.client_add("b").unwrap();

    store.fail_writes_at(Some(a.offset() + 1));
    assert!(ledger.client_free(a).is_err());
    // Bit still set: a new client skips the slot.
    assert_eq!(ledger.client_add("c").unwrap().idx(), 2);
    store.fail_writes_at(None);

    ledger.client_free(a).unwrap();
    let record = ClientRecord::from_bytes(&store.read_at(a.offset(), 128).unwrap()).unwrap();
    assert!(record.uuid.is_empty());
    assert_eq!(ledger.client_add("d").unwrap().idx(), 0);
    assert_eq!(ledger.client(b).unwrap().uuid, "b");
}
