// ============================================================================
// Control channel and session handshake tests
// ============================================================================

use std::time::Duration;

use cloud_bus::descriptor::{
    NetworkQualityInfo, NetworkTileDescription, NetworkTileInfo, Orientation,
};

use super::{apply_control_message, ControlMessage, ControlReceiver, ControlSender, Session};
use crate::config::SessionConfig;
use crate::pipeline::{ReceivePipeline, RecvConfig};

fn sample_description() -> NetworkTileDescription {
    NetworkTileDescription {
        tiles: vec![NetworkTileInfo {
            orientation: Orientation::new(0.0, 0.0, 1.0),
            qualities: vec![NetworkQualityInfo {
                bandwidth_requirement: 2.0e6,
                representation: 0.5,
            }],
        }],
    }
}

#[test]
fn test_control_message_round_trip() {
    assert_eq!(
        ControlMessage::parse("ready").unwrap(),
        ControlMessage::Ready
    );
    assert_eq!(
        ControlMessage::Ready.serialize().unwrap(),
        "ready".to_string()
    );

    let message = ControlMessage::TileDescription(sample_description());
    let text = message.serialize().unwrap();
    assert_eq!(ControlMessage::parse(&text).unwrap(), message);

    assert!(ControlMessage::parse("{not json").is_err());
}

#[tokio::test]
async fn test_control_channel_loopback() {
    let sender = ControlSender::start("tcp://127.0.0.1:0").await.unwrap();
    let url = format!("tcp://127.0.0.1:{}", sender.local_addr().port());
    let receiver = ControlReceiver::start(&url).unwrap();

    let message = ControlMessage::TileDescription(sample_description());
    assert!(sender.send(&message).await.unwrap());

    let mut received = None;
    for _ in 0..100 {
        if let Some(text) = receiver.receive(Duration::from_millis(50)).await {
            received = Some(text);
            break;
        }
    }
    let text = received.expect("no control message arrived");
    assert_eq!(ControlMessage::parse(&text).unwrap(), message);

    sender.stop_and_wait().await;
    receiver.stop_and_wait().await;
}

fn inert_receive() -> ReceivePipeline {
    ReceivePipeline::new(RecvConfig {
        url: "tcp://127.0.0.1:1".to_string(),
        compressed: false,
        default_cellsize: 0.01,
        cellsize_factor: 1.0,
    })
    .unwrap()
}

#[tokio::test]
async fn test_peer_stays_unknown_when_activation_fails() {
    let mut recv = inert_receive();
    let description = sample_description();
    recv.activate(&description).unwrap();

    // With the pipeline already running, a tile description cannot
    // activate anything; the peer must stay unknown so the session
    // keeps listening instead of reporting a receive chain it lacks.
    let text = ControlMessage::TileDescription(description).serialize().unwrap();
    assert!(!apply_control_message(&mut recv, &text));

    // Garbage does not mark the peer known either.
    assert!(!apply_control_message(&mut recv, "{not json"));
    recv.stop_and_wait().await;
}

#[tokio::test]
async fn test_peer_becomes_known_on_activation_or_readiness() {
    let mut recv = inert_receive();
    let text = ControlMessage::TileDescription(sample_description())
        .serialize()
        .unwrap();
    assert!(apply_control_message(&mut recv, &text));
    assert!(recv.is_active());
    recv.stop_and_wait().await;

    let mut recv = inert_receive();
    assert!(apply_control_message(&mut recv, "ready"));
    assert!(!recv.is_active());
}

fn session_pair() -> (SessionConfig, SessionConfig) {
    let a = SessionConfig {
        media_url: "tcp://127.0.0.1:47611".to_string(),
        control_url: "tcp://127.0.0.1:47612".to_string(),
        peer_media_url: "tcp://127.0.0.1:47613".to_string(),
        peer_control_url: "tcp://127.0.0.1:47614".to_string(),
        tiled: true,
        npoints: 800,
        octree_bits: 5,
        ..SessionConfig::default()
    };
    let b = SessionConfig {
        media_url: "tcp://127.0.0.1:47613".to_string(),
        control_url: "tcp://127.0.0.1:47614".to_string(),
        peer_media_url: "tcp://127.0.0.1:47611".to_string(),
        peer_control_url: "tcp://127.0.0.1:47612".to_string(),
        tiled: false,
        npoints: 800,
        octree_bits: 5,
        ..SessionConfig::default()
    };
    (a, b)
}

#[tokio::test]
async fn test_session_handshake_activates_both_receive_pipelines() {
    let (config_a, config_b) = session_pair();

    // A comes up first: its control receiver finds nobody listening and
    // has to retry until B exists.
    let mut session_a = Session::start(config_a).await.unwrap();
    assert!(!session_a.receive_active());
    session_a.poll().await;

    let mut session_b = Session::start(config_b).await.unwrap();

    for _ in 0..500 {
        session_a.poll().await;
        session_b.poll().await;
        if session_a.receive_active() && session_b.receive_active() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(session_a.receive_active());
    assert!(session_b.receive_active());

    // B is untiled, so A sees one incoming tile; A is tiled with two
    // hemispheres, so B sees two.
    assert_eq!(session_a.receive_pipeline().tile_count(), 1);
    assert_eq!(session_b.receive_pipeline().tile_count(), 2);

    // Media must actually flow in both directions.
    let mut buf = Vec::new();
    'outer: for _ in 0..500 {
        for preparer in session_a
            .receive_pipeline()
            .preparers()
            .iter()
            .chain(session_b.receive_pipeline().preparers())
        {
            if !preparer.latch_frame() && preparer.current_timestamp() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue 'outer;
            }
        }
        break;
    }
    for preparer in session_a
        .receive_pipeline()
        .preparers()
        .iter()
        .chain(session_b.receive_pipeline().preparers())
    {
        preparer.latch_frame();
        assert!(preparer.get_point_buffer(&mut buf) > 0);
    }

    session_a.stop_and_wait().await;
    session_b.stop_and_wait().await;
}
