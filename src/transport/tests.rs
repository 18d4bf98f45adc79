use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::MsgTag;
use crate::testutil::bind_transports;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Ping {
    seq: u64,
    body: Vec<u8>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_and_typed_read_roundtrip() {
    let transports = bind_transports(2).await;
    let msg = Ping {
        seq: 7,
        body: vec![1, 2, 3],
    };

    transports[0]
        .send_msg(1, MsgTag::PutRequest, &msg)
        .unwrap();

    let (source, received): (usize, Ping) = transports[1]
        .read(None, MsgTag::PutRequest)
        .await
        .unwrap();
    assert_eq!(source, 0);
    assert_eq!(received, msg);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_reports_source_and_size() {
    let transports = bind_transports(2).await;
    assert!(transports[1].probe(None, MsgTag::GetRequest).is_none());

    let payload = vec![9u8; 32];
    transports[0].send(1, MsgTag::GetRequest, payload.clone());

    // Wait for the frame to land.
    let (_, received) = transports[1].recv(Some(0), MsgTag::GetRequest).await;
    assert_eq!(received, payload);
    assert!(transports[1].probe(Some(0), MsgTag::GetRequest).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tags_do_not_cross() {
    let transports = bind_transports(2).await;
    transports[0].send(1, MsgTag::PutRequest, vec![1]);
    transports[0].send(1, MsgTag::GetRequest, vec![2]);

    let (_, get) = transports[1].recv(None, MsgTag::GetRequest).await;
    assert_eq!(get, vec![2]);
    let (_, put) = transports[1].recv(None, MsgTag::PutRequest).await;
    assert_eq!(put, vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn isend_handle_completes() {
    let transports = bind_transports(2).await;
    let mut handle = transports[0].isend(1, MsgTag::PutRequest, vec![0u8; 128]);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !handle.is_finished() {
        assert!(std::time::Instant::now() < deadline, "send never completed");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let (_, body) = transports[1].recv(Some(0), MsgTag::PutRequest).await;
    assert_eq!(body.len(), 128);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_send_is_never_delivered() {
    let transports = bind_transports(2).await;

    transports[0].delay_next_send(Duration::from_millis(200));
    let mut handle = transports[0].isend(1, MsgTag::PutRequest, vec![42u8; 8]);
    handle.cancel();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!handle.is_finished());
    assert!(transports[1].try_recv(Some(0), MsgTag::PutRequest).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_reaches_every_worker_rank() {
    let transports = bind_transports(4).await;
    let msg = Ping {
        seq: 1,
        body: vec![],
    };
    transports[0].broadcast_msg(MsgTag::Checkpoint, &msg).unwrap();

    for worker_rank in 1..4 {
        let (source, received): (usize, Ping) = transports[worker_rank]
            .read(Some(0), MsgTag::Checkpoint)
            .await
            .unwrap();
        assert_eq!(source, 0);
        assert_eq!(received.seq, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_to_self_loops_back() {
    let transports = bind_transports(2).await;
    transports[1].send(1, MsgTag::PutRequest, vec![5, 5]);
    let (source, body) = transports[1].recv(Some(1), MsgTag::PutRequest).await;
    assert_eq!(source, 1);
    assert_eq!(body, vec![5, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_arrive_in_send_order() {
    let transports = bind_transports(2).await;
    for seq in 0..50u8 {
        transports[0].send(1, MsgTag::PutRequest, vec![seq]);
    }
    for seq in 0..50u8 {
        let (_, body) = transports[1].recv(Some(0), MsgTag::PutRequest).await;
        assert_eq!(body, vec![seq]);
    }
}
