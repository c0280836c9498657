use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::descriptor::IncomingTileDescriptor;
use crate::frame::Frame;
use crate::net::{StateCell, StreamState, FRAME_HEADER_LEN, MAX_PAYLOAD};
use crate::queue::FrameQueue;
use crate::worker::Worker;

/// Demultiplexing receiver: connects to a peer transmitter, validates
/// the connection's 4CC tag, then routes each framed payload to the
/// per-tile queue bound to its stream index. Unknown stream indices are
/// logged and discarded. Connection loss is end-of-stream: every bound
/// queue is closed so downstream stages observe completion instead of
/// hanging.
pub struct StreamReceiver {
    worker: Worker,
    state: StateCell,
}

impl StreamReceiver {
    /// URL and tile layout problems are fatal here; connect/read
    /// failures are runtime transport errors handled by the worker.
    pub fn start(
        url: &str,
        fourcc: u32,
        tiles: Vec<IncomingTileDescriptor>,
    ) -> anyhow::Result<Self> {
        if tiles.is_empty() {
            anyhow::bail!("receiver needs at least one tile descriptor");
        }
        let (host, port) = crate::net::parse_tcp_url(url)?;
        let mut routes: HashMap<u32, Arc<FrameQueue>> = HashMap::new();
        for tile in &tiles {
            for stream in &tile.streams {
                if routes
                    .insert(stream.stream_index, tile.out_queue.clone())
                    .is_some()
                {
                    anyhow::bail!("duplicate stream index {}", stream.stream_index);
                }
            }
        }
        let state = StateCell::new();
        state.set(StreamState::Connecting);
        let state_clone = state.clone();
        let queues: Vec<Arc<FrameQueue>> =
            tiles.iter().map(|t| t.out_queue.clone()).collect();
        let worker = Worker::spawn("receiver", move |cancel| {
            receive_loop(cancel, host, port, fourcc, routes, queues, state_clone)
        });
        Ok(Self { worker, state })
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub async fn stop_and_wait(&self) {
        self.worker.stop_and_wait().await;
    }
}

async fn receive_loop(
    cancel: CancellationToken,
    host: String,
    port: u16,
    fourcc: u32,
    routes: HashMap<u32, Arc<FrameQueue>>,
    queues: Vec<Arc<FrameQueue>>,
    state: StateCell,
) {
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => {
            finish(&queues, &state);
            return;
        }
        connected = TcpStream::connect((host.as_str(), port)) => match connected {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("receiver: connect to {}:{} failed: {}", host, port, e);
                finish(&queues, &state);
                return;
            }
        },
    };

    let mut tag = [0u8; 4];
    let tag_read = tokio::select! {
        _ = cancel.cancelled() => false,
        read = stream.read_exact(&mut tag) => match read {
            Ok(_) => true,
            Err(e) => {
                log::warn!("receiver: failed to read 4CC: {}", e);
                false
            }
        },
    };
    if !tag_read {
        finish(&queues, &state);
        return;
    }
    let received = u32::from_be_bytes(tag);
    if received != fourcc {
        log::warn!(
            "receiver: 4CC mismatch: expected {:#010x}, got {:#010x}",
            fourcc,
            received
        );
        finish(&queues, &state);
        return;
    }
    state.set(StreamState::Streaming);

    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.read_exact(&mut header) => {
                if let Err(e) = read {
                    // Clean peer shutdown lands here too.
                    log::info!("receiver: connection ended: {}", e);
                    break;
                }
            }
        }
        let index = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let length = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let timestamp = i64::from_le_bytes(header[8..16].try_into().unwrap());
        if length > MAX_PAYLOAD {
            log::warn!("receiver: implausible payload length {}, giving up", length);
            break;
        }
        // The payload read is cancel-aware as well: a peer that stalls
        // mid-frame must not be able to pin the loop past a stop.
        let mut payload = vec![0u8; length as usize];
        let payload_read = tokio::select! {
            _ = cancel.cancelled() => false,
            read = stream.read_exact(&mut payload) => match read {
                Ok(_) => true,
                Err(e) => {
                    log::info!("receiver: connection ended mid-frame: {}", e);
                    false
                }
            },
        };
        if !payload_read {
            break;
        }
        match routes.get(&index) {
            Some(queue) => {
                queue
                    .enqueue(Frame::new(Bytes::from(payload), timestamp))
                    .await;
            }
            None => {
                log::warn!("receiver: discarding frame for unknown stream index {}", index);
            }
        }
    }
    finish(&queues, &state);
}

fn finish(queues: &[Arc<FrameQueue>], state: &StateCell) {
    state.set(StreamState::Stopping);
    for queue in queues {
        queue.close();
    }
    state.set(StreamState::Stopped);
    log::info!("receiver stopped");
}
