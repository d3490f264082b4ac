//! End-to-end request handling: a client sends over the simulated fabric,
//! the target records the outcome in its ledger and holds the reply until
//! the transaction commits.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ledger, nid, node, settle, CountingHandler};
use relaynet_recovery::MemStore;
use relaynet_target::{decode_reply_data, Disposition, TargetRequest, TargetServer};
use relaynet_transport::sim::SimFabric;
use relaynet_transport::{MessageTransport, ProcessId, ServiceConfig, TransportError};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_reply_held_until_commit_then_resend_reconstructed() {
    let fabric = SimFabric::new();
    let client = node(&fabric, nid(0, 1));
    let server = node(&fabric, nid(0, 2));
    let store = MemStore::new();
    let handler = Arc::new(CountingHandler::default());
    let mut target = TargetServer::start(&server, ServiceConfig::default(), ledger(&store), handler.clone())
        .await
        .unwrap();

    let transport = MessageTransport::new(Arc::clone(&client));
    let body = TargetRequest::update("client-a", b"mkdir /x".to_vec()).encode().unwrap();
    let req = transport.request(ProcessId::server(nid(0, 2)), body, 64);
    let xid = req.xid();
    transport.send_rpc(&req).await.unwrap();

    assert_eq!(target.serve_one().await.unwrap(), Some(Disposition::Held { transno: 1 }));
    assert_eq!(target.pending_replies(), 1);
    assert_eq!(target.ledger().stats().held_replies, 1);
    settle().await;
    assert!(req.reply().is_none());
    assert!(!req.flags().replied);

    assert_eq!(target.commit_all().unwrap(), 1);
    let reply = transport.wait_reply(&req, WAIT).await.unwrap();
    assert_eq!(decode_reply_data(&reply), Some(8));
    assert_eq!(req.transno(), 1);
    assert_eq!(target.pending_replies(), 0);
    assert_eq!(target.ledger().last_committed(), 1);

    // Same xid again: answered from the ledger, not run a second time.
    transport.send_rpc(&req).await.unwrap();
    assert_eq!(req.xid(), xid);
    assert_eq!(
        target.serve_one().await.unwrap(),
        Some(Disposition::Reconstructed { transno: 1 })
    );
    let reply = transport.wait_reply(&req, WAIT).await.unwrap();
    assert_eq!(decode_reply_data(&reply), Some(8));
    assert_eq!(req.transno(), 1);
    assert_eq!(handler.runs(), 1);
    assert_eq!(target.ledger().last_transno(), 1);

    target.shutdown().await;
}

#[tokio::test]
async fn test_resend_while_held_gets_the_committed_reply() {
    let fabric = SimFabric::new();
    let client = node(&fabric, nid(0, 1));
    let server = node(&fabric, nid(0, 2));
    let store = MemStore::new();
    let handler = Arc::new(CountingHandler::default());
    let mut target = TargetServer::start(&server, ServiceConfig::default(), ledger(&store), handler.clone())
        .await
        .unwrap();

    let transport = MessageTransport::new(Arc::clone(&client));
    let body = TargetRequest::update("client-a", b"rename".to_vec()).encode().unwrap();
    let req = transport.request(ProcessId::server(nid(0, 2)), body, 64);
    transport.send_rpc(&req).await.unwrap();
    assert_eq!(target.serve_one().await.unwrap(), Some(Disposition::Held { transno: 1 }));

    // The client gives up waiting and resends while the reply is held.
    let err = transport
        .wait_reply(&req, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }));
    transport.send_rpc(&req).await.unwrap();
    assert_eq!(target.serve_one().await.unwrap(), Some(Disposition::Held { transno: 1 }));
    assert_eq!(target.pending_replies(), 1);
    assert_eq!(handler.runs(), 1);

    assert_eq!(target.commit_all().unwrap(), 1);
    let reply = transport.wait_reply(&req, WAIT).await.unwrap();
    assert_eq!(decode_reply_data(&reply), Some(6));
    assert_eq!(req.transno(), 1);

    target.shutdown().await;
}

#[tokio::test]
async fn test_resend_after_restart_is_reconstructed() {
    let fabric = SimFabric::new();
    let client = node(&fabric, nid(0, 1));
    let server = node(&fabric, nid(0, 2));
    let store = MemStore::new();
    let handler = Arc::new(CountingHandler::default());

    let transport = MessageTransport::new(Arc::clone(&client));
    let body = TargetRequest::update("client-a", b"write".to_vec()).encode().unwrap();
    let req = transport.request(ProcessId::server(nid(0, 2)), body, 64);

    {
        let mut target = TargetServer::start(&server, ServiceConfig::default(), ledger(&store), handler.clone())
            .await
            .unwrap();
        transport.send_rpc(&req).await.unwrap();
        assert_eq!(target.serve_one().await.unwrap(), Some(Disposition::Held { transno: 1 }));
        assert_eq!(target.commit(1).unwrap(), 1);
        transport.wait_reply(&req, WAIT).await.unwrap();
        target.shutdown().await;
    }

    let reopened = ledger(&store);
    assert!(reopened.is_recovering());
    let mut target = TargetServer::start(&server, ServiceConfig::default(), reopened, handler.clone())
        .await
        .unwrap();
    transport.send_rpc(&req).await.unwrap();
    assert_eq!(
        target.serve_one().await.unwrap(),
        Some(Disposition::Reconstructed { transno: 1 })
    );
    let reply = transport.wait_reply(&req, WAIT).await.unwrap();
    assert_eq!(decode_reply_data(&reply), Some(5));
    assert_eq!(req.transno(), 1);
    assert_eq!(handler.runs(), 1);

    target.shutdown().await;
}

#[tokio::test]
async fn test_replay_of_committed_transno_replied_at_once() {
    let fabric = SimFabric::new();
    let client = node(&fabric, nid(0, 1));
    let server = node(&fabric, nid(0, 2));
    let store = MemStore::new();
    let handler = Arc::new(CountingHandler::default());
    let transport = MessageTransport::new(Arc::clone(&client));

    {
        let mut target = TargetServer::start(&server, ServiceConfig::default(), ledger(&store), handler.clone())
            .await
            .unwrap();
        for body in [&b"one"[..], &b"two"[..]] {
            let payload = TargetRequest::update("client-a", body.to_vec()).encode().unwrap();
            let req = transport.request(ProcessId::server(nid(0, 2)), payload, 64);
            transport.send_rpc(&req).await.unwrap();
            assert!(matches!(target.serve_one().await.unwrap(), Some(Disposition::Held { .. })));
        }
        assert_eq!(target.commit_all().unwrap(), 2);
        target.shutdown().await;
    }

    // The client lost the reply to transno 1 and replays it with a new xid.
    let mut target = TargetServer::start(&server, ServiceConfig::default(), ledger(&store), handler.clone())
        .await
        .unwrap();
    let payload = TargetRequest::update("client-a", b"one".to_vec())
        .replaying(1)
        .encode()
        .unwrap();
    let req = transport.request(ProcessId::server(nid(0, 2)), payload, 64);
    transport.send_rpc(&req).await.unwrap();
    assert_eq!(target.serve_one().await.unwrap(), Some(Disposition::Replied { transno: 1 }));
    transport.wait_reply(&req, WAIT).await.unwrap();
    assert_eq!(req.transno(), 1);
    assert_eq!(target.pending_replies(), 0);
    assert_eq!(target.ledger().last_transno(), 2);

    target.shutdown().await;
}

#[tokio::test]
async fn test_failed_op_replied_without_transno() {
    let fabric = SimFabric::new();
    let client = node(&fabric, nid(0, 1));
    let server = node(&fabric, nid(0, 2));
    let store = MemStore::new();
    let handler = Arc::new(CountingHandler::default());
    let mut target = TargetServer::start(&server, ServiceConfig::default(), ledger(&store), handler.clone())
        .await
        .unwrap();

    let transport = MessageTransport::new(Arc::clone(&client));
    let payload = TargetRequest::update("client-a", b"fail: no such dir".to_vec()).encode().unwrap();
    let req = transport.request(ProcessId::server(nid(0, 2)), payload, 64);
    transport.send_rpc(&req).await.unwrap();
    assert_eq!(target.serve_one().await.unwrap(), Some(Disposition::Replied { transno: 0 }));

    let err = transport.wait_reply(&req, WAIT).await.unwrap_err();
    assert!(matches!(err, TransportError::RequestFailed { status: -2, .. }));
    assert_eq!(req.transno(), 0);
    assert_eq!(target.pending_replies(), 0);
    assert_eq!(target.ledger().last_transno(), 0);

    // The failure is recorded too, so a resend does not run it again.
    transport.send_rpc(&req).await.unwrap();
    assert_eq!(
        target.serve_one().await.unwrap(),
        Some(Disposition::Reconstructed { transno: 0 })
    );
    let err = transport.wait_reply(&req, WAIT).await.unwrap_err();
    assert!(matches!(err, TransportError::RequestFailed { status: -2, .. }));
    assert_eq!(handler.runs(), 1);

    target.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_request_rejected() {
    let fabric = SimFabric::new();
    let client = node(&fabric, nid(0, 1));
    let server = node(&fabric, nid(0, 2));
    let store = MemStore::new();
    let handler = Arc::new(CountingHandler::default());
    let mut target = TargetServer::start(&server, ServiceConfig::default(), ledger(&store), handler.clone())
        .await
        .unwrap();

    let transport = MessageTransport::new(Arc::clone(&client));
    let req = transport.request(ProcessId::server(nid(0, 2)), &[0xffu8, 0xff, 0xff][..], 64);
    transport.send_rpc(&req).await.unwrap();
    assert_eq!(
        target.serve_one().await.unwrap(),
        Some(Disposition::Rejected { status: -71 })
    );
    let err = transport.wait_reply(&req, WAIT).await.unwrap_err();
    assert!(matches!(err, TransportError::RequestFailed { status: -71, .. }));
    assert_eq!(handler.runs(), 0);
    assert!(target.ledger().clients().is_empty());

    target.shutdown().await;
}
