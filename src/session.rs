use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use cloud_bus::descriptor::{
    IncomingStreamDescriptor, IncomingTileDescriptor, NetworkTileDescription, Orientation,
    OutgoingStreamDescriptor,
};
use cloud_bus::frame::{Frame, FOURCC_CONTROL};
use cloud_bus::net::StreamState;
use cloud_bus::queue::FrameQueue;
use cloud_bus::receive::StreamReceiver;
use cloud_bus::transmit::StreamTransmitter;

use crate::config::SessionConfig;
use crate::pipeline::{
    ReceivePipeline, RecvConfig, SendConfig, SendPipeline, SinkConfig, SourceConfig,
};

/// Everything that travels on the control channel. Text on the wire:
/// a JSON tile description, or the bare readiness token for peers that
/// transmit no media.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    TileDescription(NetworkTileDescription),
    Ready,
}

const READY_TOKEN: &str = "ready";

impl ControlMessage {
    pub fn serialize(&self) -> anyhow::Result<String> {
        match self {
            ControlMessage::TileDescription(description) => {
                Ok(serde_json::to_string(description)?)
            }
            ControlMessage::Ready => Ok(READY_TOKEN.to_string()),
        }
    }

    pub fn parse(text: &str) -> anyhow::Result<ControlMessage> {
        if text.trim() == READY_TOKEN {
            return Ok(ControlMessage::Ready);
        }
        Ok(ControlMessage::TileDescription(serde_json::from_str(text)?))
    }
}

/// Outgoing half of the control channel: a single-slot blocking queue
/// feeding a one-stream transmitter tagged with the control 4CC.
pub struct ControlSender {
    queue: Arc<FrameQueue>,
    transmitter: StreamTransmitter,
}

impl ControlSender {
    pub async fn start(url: &str) -> anyhow::Result<Self> {
        let queue = Arc::new(FrameQueue::new("ControlSendQueue", 1, false));
        let transmitter = StreamTransmitter::start(
            url,
            FOURCC_CONTROL,
            vec![OutgoingStreamDescriptor {
                name: "control".to_string(),
                tile_number: 0,
                quality_index: 0,
                orientation: Orientation::ZERO,
                queue: queue.clone(),
            }],
        )
        .await?;
        Ok(Self { queue, transmitter })
    }

    /// Queue a message for the peer. Returns false once the channel has
    /// shut down.
    pub async fn send(&self, message: &ControlMessage) -> anyhow::Result<bool> {
        let text = message.serialize()?;
        let frame = Frame::new(Bytes::from(text.into_bytes()), Frame::now_timestamp());
        Ok(self.queue.enqueue(frame).await)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transmitter.local_addr()
    }

    pub async fn stop_and_wait(&self) {
        // Close first so the transmit loop drains and exits on its own.
        self.queue.close();
        self.transmitter.stop_and_wait().await;
    }
}

/// Incoming half of the control channel. `receive` yields decoded text
/// messages; a stopped receiver with no message means the peer is not
/// up yet and the caller may rebuild this half and try again.
pub struct ControlReceiver {
    queue: Arc<FrameQueue>,
    receiver: StreamReceiver,
}

impl ControlReceiver {
    pub fn start(url: &str) -> anyhow::Result<Self> {
        let queue = Arc::new(FrameQueue::new("ControlReceiveQueue", 1, false));
        let receiver = StreamReceiver::start(
            url,
            FOURCC_CONTROL,
            vec![IncomingTileDescriptor {
                name: "control".to_string(),
                out_queue: queue.clone(),
                tile_number: 0,
                streams: vec![IncomingStreamDescriptor {
                    stream_index: 0,
                    tile_number: 0,
                    orientation: Orientation::ZERO,
                }],
            }],
        )?;
        Ok(Self { queue, receiver })
    }

    pub async fn receive(&self, timeout: Duration) -> Option<String> {
        let frame = self.queue.try_dequeue(timeout).await?;
        match String::from_utf8(frame.data.to_vec()) {
            Ok(text) => Some(text),
            Err(e) => {
                log::warn!("control: discarding non-utf8 message: {}", e);
                None
            }
        }
    }

    pub fn state(&self) -> StreamState {
        self.receiver.state()
    }

    pub async fn stop_and_wait(&self) {
        self.receiver.stop_and_wait().await;
    }
}

/// A full bidirectional session: capture/transmit on our side, an inert
/// receive pipeline for the peer's media, and the control exchange that
/// activates it. Drive with `poll` until `receive_active`.
pub struct Session {
    config: SessionConfig,
    send: SendPipeline,
    recv: ReceivePipeline,
    control_tx: ControlSender,
    control_rx: ControlReceiver,
    remote_known: bool,
}

impl Session {
    pub async fn start(config: SessionConfig) -> anyhow::Result<Session> {
        let sink = if config.media_url.is_empty() {
            SinkConfig::None
        } else {
            SinkConfig::Tcp {
                url: config.media_url.clone(),
                compressed: config.compressed,
                tiled: config.tiled,
                octree_depths: vec![config.octree_bits],
                drop_when_full: config.drop_when_full,
            }
        };
        let send = SendPipeline::build(SendConfig {
            source: SourceConfig::Synthetic {
                npoints: config.npoints,
                tiled: config.tiled,
            },
            sink,
            framerate: config.framerate,
            voxel_size: config.voxel_size,
            self_view: true,
            default_cellsize: config.default_cellsize,
            cellsize_factor: config.cellsize_factor,
        })
        .await?;

        let control_tx = ControlSender::start(&config.control_url).await?;
        let control_rx = ControlReceiver::start(&config.peer_control_url)?;

        // Advertise our layout once; the single-slot queue holds it
        // until the peer's control receiver connects.
        let announcement = match send.tile_description() {
            Some(description) => ControlMessage::TileDescription(description.clone()),
            None => ControlMessage::Ready,
        };
        control_tx.send(&announcement).await?;

        let recv = ReceivePipeline::new(RecvConfig {
            url: config.peer_media_url.clone(),
            compressed: config.compressed,
            default_cellsize: config.default_cellsize,
            cellsize_factor: config.cellsize_factor,
        })?;

        Ok(Session {
            config,
            send,
            recv,
            control_tx,
            control_rx,
            remote_known: false,
        })
    }

    /// Pump the control channel. On the first message from the peer the
    /// receive pipeline is built and started; before that, a control
    /// connection that died (peer not up yet) is torn down and rebuilt.
    pub async fn poll(&mut self) {
        if self.remote_known {
            return;
        }
        if let Some(text) = self.control_rx.receive(Duration::from_millis(20)).await {
            self.remote_known = apply_control_message(&mut self.recv, &text);
            return;
        }
        if self.control_rx.state() == StreamState::Stopped {
            log::info!("session: peer control endpoint not reachable yet, retrying");
            self.control_rx.stop_and_wait().await;
            match ControlReceiver::start(&self.config.peer_control_url) {
                Ok(receiver) => self.control_rx = receiver,
                Err(e) => log::warn!("session: control reconnect failed: {}", e),
            }
        }
    }

    /// True once the peer's layout arrived and the receive side runs
    /// (or the peer declared it sends nothing).
    pub fn receive_active(&self) -> bool {
        self.remote_known
    }

    pub fn send_pipeline(&self) -> &SendPipeline {
        &self.send
    }

    pub fn receive_pipeline(&self) -> &ReceivePipeline {
        &self.recv
    }

    pub fn media_addr(&self) -> Option<SocketAddr> {
        self.send.media_addr()
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_tx.local_addr()
    }

    pub async fn stop_and_wait(&self) {
        self.send.stop_and_wait().await;
        self.control_tx.stop_and_wait().await;
        self.control_rx.stop_and_wait().await;
        self.recv.stop_and_wait().await;
    }
}

/// Returns true once the peer is known: its layout activated the
/// receive pipeline, or it declared it sends nothing. An activation
/// failure leaves the peer unknown so a later message gets another try.
fn apply_control_message(recv: &mut ReceivePipeline, text: &str) -> bool {
    match ControlMessage::parse(text) {
        Ok(ControlMessage::TileDescription(description)) => match recv.activate(&description) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("session: failed to activate receive pipeline: {}", e);
                false
            }
        },
        Ok(ControlMessage::Ready) => {
            log::info!("session: peer is up and transmits no media");
            true
        }
        Err(e) => {
            log::warn!("session: ignoring malformed control message: {}", e);
            false
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
