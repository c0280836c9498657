// ============================================================================
// Transport loopback tests
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::StreamTransmitter;
use crate::descriptor::{
    IncomingStreamDescriptor, IncomingTileDescriptor, Orientation, OutgoingStreamDescriptor,
};
use crate::frame::{Frame, FOURCC_COMPRESSED, FOURCC_RAW};
use crate::net::StreamState;
use crate::queue::FrameQueue;
use crate::receive::StreamReceiver;

fn outgoing(name: &str, tile: u32, queue: Arc<FrameQueue>) -> OutgoingStreamDescriptor {
    OutgoingStreamDescriptor {
        name: name.to_string(),
        tile_number: tile,
        quality_index: 0,
        orientation: Orientation::ZERO,
        queue,
    }
}

fn incoming(name: &str, tile: u32, index: u32, queue: Arc<FrameQueue>) -> IncomingTileDescriptor {
    IncomingTileDescriptor {
        name: name.to_string(),
        out_queue: queue,
        tile_number: tile,
        streams: vec![IncomingStreamDescriptor {
            stream_index: index,
            tile_number: tile,
            orientation: Orientation::ZERO,
        }],
    }
}

fn frame(tag: u8, timestamp: i64) -> Frame {
    Frame::new(Bytes::from(vec![tag; 8]), timestamp)
}

#[tokio::test]
async fn test_two_stream_loopback() {
    let tx_a = Arc::new(FrameQueue::new("tx-a", 2, false));
    let tx_b = Arc::new(FrameQueue::new("tx-b", 2, false));
    let transmitter = StreamTransmitter::start(
        "tcp://127.0.0.1:0",
        FOURCC_RAW,
        vec![
            outgoing("tile1", 1, tx_a.clone()),
            outgoing("tile2", 2, tx_b.clone()),
        ],
    )
    .await
    .unwrap();

    let rx_a = Arc::new(FrameQueue::new("rx-a", 2, false));
    let rx_b = Arc::new(FrameQueue::new("rx-b", 2, false));
    let url = format!("tcp://127.0.0.1:{}", transmitter.local_addr().port());
    let receiver = StreamReceiver::start(
        &url,
        FOURCC_RAW,
        vec![
            incoming("tile1", 1, 0, rx_a.clone()),
            incoming("tile2", 2, 1, rx_b.clone()),
        ],
    )
    .unwrap();

    tx_a.enqueue(frame(0xAA, 100)).await;
    tx_b.enqueue(frame(0xBB, 200)).await;
    tx_a.enqueue(frame(0xAC, 300)).await;

    let got = rx_a.try_dequeue(Duration::from_secs(2)).await.unwrap();
    assert_eq!(got.timestamp, 100);
    assert_eq!(got.data, Bytes::from(vec![0xAA; 8]));
    let got = rx_b.try_dequeue(Duration::from_secs(2)).await.unwrap();
    assert_eq!(got.timestamp, 200);
    let got = rx_a.try_dequeue(Duration::from_secs(2)).await.unwrap();
    assert_eq!(got.timestamp, 300);

    // Draining and closing the transmit queues ends the connection;
    // the receiver then closes its output queues.
    tx_a.close();
    tx_b.close();
    assert!(rx_a.try_dequeue(Duration::from_secs(2)).await.is_none());
    assert!(rx_b.try_dequeue(Duration::from_secs(2)).await.is_none());
    assert!(rx_a.is_closed());
    assert!(rx_b.is_closed());

    transmitter.stop_and_wait().await;
    receiver.stop_and_wait().await;
    assert_eq!(transmitter.state(), StreamState::Stopped);
    assert_eq!(receiver.state(), StreamState::Stopped);
}

#[tokio::test]
async fn test_unknown_stream_index_is_skipped() {
    let tx_a = Arc::new(FrameQueue::new("u-tx-a", 2, false));
    let tx_b = Arc::new(FrameQueue::new("u-tx-b", 2, false));
    let transmitter = StreamTransmitter::start(
        "tcp://127.0.0.1:0",
        FOURCC_RAW,
        vec![
            outgoing("known", 1, tx_a.clone()),
            outgoing("unknown", 2, tx_b.clone()),
        ],
    )
    .await
    .unwrap();

    // The receiver only routes stream index 0; index 1 must be
    // discarded without wedging the connection.
    let rx_a = Arc::new(FrameQueue::new("u-rx-a", 4, false));
    let url = format!("tcp://127.0.0.1:{}", transmitter.local_addr().port());
    let receiver = StreamReceiver::start(
        &url,
        FOURCC_RAW,
        vec![incoming("known", 1, 0, rx_a.clone())],
    )
    .unwrap();

    tx_b.enqueue(frame(0xEE, 50)).await;
    tx_a.enqueue(frame(0x11, 60)).await;
    tx_b.enqueue(frame(0xEF, 70)).await;
    tx_a.enqueue(frame(0x12, 80)).await;

    let got = rx_a.try_dequeue(Duration::from_secs(2)).await.unwrap();
    assert_eq!(got.timestamp, 60);
    let got = rx_a.try_dequeue(Duration::from_secs(2)).await.unwrap();
    assert_eq!(got.timestamp, 80);

    tx_a.close();
    tx_b.close();
    transmitter.stop_and_wait().await;
    receiver.stop_and_wait().await;
}

#[tokio::test]
async fn test_fourcc_mismatch_closes_queues() {
    let tx = Arc::new(FrameQueue::new("cc-tx", 2, false));
    let transmitter = StreamTransmitter::start(
        "tcp://127.0.0.1:0",
        FOURCC_RAW,
        vec![outgoing("t", 0, tx.clone())],
    )
    .await
    .unwrap();

    let rx = Arc::new(FrameQueue::new("cc-rx", 2, false));
    let url = format!("tcp://127.0.0.1:{}", transmitter.local_addr().port());
    let receiver = StreamReceiver::start(
        &url,
        FOURCC_COMPRESSED,
        vec![incoming("t", 0, 0, rx.clone())],
    )
    .unwrap();

    // Misinterpreted frames must never be delivered.
    assert!(rx.try_dequeue(Duration::from_secs(2)).await.is_none());
    assert!(rx.is_closed());
    receiver.stop_and_wait().await;
    assert_eq!(receiver.state(), StreamState::Stopped);
    transmitter.stop_and_wait().await;
}

#[tokio::test]
async fn test_connection_refused_closes_queues_without_retry() {
    // Grab a free port, then release it so the connect is refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let rx = Arc::new(FrameQueue::new("refused-rx", 2, false));
    let receiver = StreamReceiver::start(
        &format!("tcp://127.0.0.1:{}", port),
        FOURCC_RAW,
        vec![incoming("t", 0, 0, rx.clone())],
    )
    .unwrap();

    assert!(rx.try_dequeue(Duration::from_secs(2)).await.is_none());
    assert!(rx.is_closed());
    receiver.stop_and_wait().await;
    assert_eq!(receiver.state(), StreamState::Stopped);
}

#[tokio::test]
async fn test_bad_urls_fail_at_construction() {
    let queue = Arc::new(FrameQueue::new("bad", 1, false));
    assert!(
        StreamTransmitter::start("http://x:1", FOURCC_RAW, vec![outgoing("t", 0, queue.clone())])
            .await
            .is_err()
    );
    assert!(StreamTransmitter::start("tcp://127.0.0.1:0", FOURCC_RAW, vec![])
        .await
        .is_err());
    assert!(StreamReceiver::start("tcp://nohost", FOURCC_RAW, vec![incoming(
        "t",
        0,
        0,
        queue.clone()
    )])
    .is_err());
    assert!(StreamReceiver::start("tcp://h:1", FOURCC_RAW, vec![]).is_err());
}

#[tokio::test]
async fn test_stop_and_wait_returns_with_a_stalled_peer() {
    let tx = Arc::new(FrameQueue::new("stall-tx", 64, true));
    let transmitter = StreamTransmitter::start(
        "tcp://127.0.0.1:0",
        FOURCC_RAW,
        vec![outgoing("t", 0, tx.clone())],
    )
    .await
    .unwrap();

    // A peer that connects and then never reads a byte. Once the socket
    // buffers fill, the transmit loop blocks inside a frame write.
    let peer = tokio::net::TcpStream::connect(transmitter.local_addr())
        .await
        .unwrap();
    for ts in 0..64 {
        tx.enqueue(Frame::new(Bytes::from(vec![0u8; 1 << 20]), ts)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::time::timeout(Duration::from_secs(3), transmitter.stop_and_wait())
        .await
        .expect("transmit loop must exit while the peer refuses to read");
    assert_eq!(transmitter.state(), StreamState::Stopped);
    assert!(tx.is_closed());
    drop(peer);
}

#[tokio::test]
async fn test_receiver_stop_returns_while_a_frame_is_incomplete() {
    use tokio::io::AsyncWriteExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    // A peer that promises a large payload and then goes silent while
    // keeping the connection open.
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&FOURCC_RAW.to_be_bytes()).await.unwrap();
        let mut header = [0u8; 16];
        header[4..8].copy_from_slice(&(1024u32 * 1024).to_le_bytes());
        stream.write_all(&header).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let rx = Arc::new(FrameQueue::new("stall-rx", 2, false));
    let receiver = StreamReceiver::start(
        &format!("tcp://127.0.0.1:{}", port),
        FOURCC_RAW,
        vec![incoming("t", 0, 0, rx.clone())],
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::time::timeout(Duration::from_secs(3), receiver.stop_and_wait())
        .await
        .expect("receive loop must exit while stalled mid-frame");
    assert_eq!(receiver.state(), StreamState::Stopped);
    assert!(rx.is_closed());
    server.abort();
}

#[tokio::test]
async fn test_duplicate_stream_indices_are_rejected() {
    let queue = Arc::new(FrameQueue::new("dup", 1, false));
    let result = StreamReceiver::start(
        "tcp://127.0.0.1:1",
        FOURCC_RAW,
        vec![
            incoming("a", 1, 0, queue.clone()),
            incoming("b", 2, 0, queue.clone()),
        ],
    );
    assert!(result.is_err());
}
