use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::descriptor::OutgoingStreamDescriptor;
use crate::net::{StateCell, StreamState};
use crate::worker::Worker;

/// Per-substream dequeue wait inside the shared transmit loop. Short so
/// one idle tile does not starve the others or delay shutdown.
const SUBSTREAM_POLL: Duration = Duration::from_millis(5);

/// Multiplexing transmitter: listens on a `tcp://host:port` endpoint,
/// accepts one peer, sends the connection's 4CC tag, then services all
/// configured sub-streams from a single loop, framing each frame as
/// {stream index, payload length, timestamp} + payload.
///
/// Back-pressure is whatever policy the per-tile input queues were
/// built with: a full blocking queue throttles that tile's producer, a
/// dropping queue sheds stale frames without affecting other tiles.
pub struct StreamTransmitter {
    worker: Worker,
    state: StateCell,
    local_addr: SocketAddr,
}

impl StreamTransmitter {
    /// Binds immediately; a bad URL or an unbindable port is a fatal
    /// configuration error, not a runtime one.
    pub async fn start(
        url: &str,
        fourcc: u32,
        descriptors: Vec<OutgoingStreamDescriptor>,
    ) -> anyhow::Result<Self> {
        if descriptors.is_empty() {
            anyhow::bail!("transmitter needs at least one stream descriptor");
        }
        let (host, port) = crate::net::parse_tcp_url(url)?;
        let listener = TcpListener::bind((host.as_str(), port)).await?;
        let local_addr = listener.local_addr()?;
        let state = StateCell::new();
        state.set(StreamState::Connecting);
        let state_clone = state.clone();
        let worker = Worker::spawn("transmitter", move |cancel| {
            transmit_loop(cancel, listener, fourcc, descriptors, state_clone)
        });
        log::info!("transmitter listening on {}", local_addr);
        Ok(Self {
            worker,
            state,
            local_addr,
        })
    }

    /// The bound address (useful when the URL asked for port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
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

async fn transmit_loop(
    cancel: CancellationToken,
    listener: TcpListener,
    fourcc: u32,
    descriptors: Vec<OutgoingStreamDescriptor>,
    state: StateCell,
) {
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => {
            finish(&descriptors, &state);
            return;
        }
        accepted = listener.accept() => match accepted {
            Ok((stream, peer)) => {
                log::info!("transmitter: accepted connection from {}", peer);
                stream
            }
            Err(e) => {
                log::warn!("transmitter: accept failed: {}", e);
                finish(&descriptors, &state);
                return;
            }
        },
    };
    // Only one peer per transmitter; further connects are refused by
    // the dropped listener.
    drop(listener);
    state.set(StreamState::Streaming);

    // Big-endian so the bytes on the wire spell the tag.
    let fourcc_bytes = fourcc.to_be_bytes();
    let sent = tokio::select! {
        _ = cancel.cancelled() => false,
        result = stream.write_all(&fourcc_bytes) => match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!("transmitter: failed to send 4CC: {}", e);
                false
            }
        },
    };
    if !sent {
        finish(&descriptors, &state);
        return;
    }

    'outer: loop {
        if cancel.is_cancelled() {
            break;
        }
        let mut all_drained = true;
        for (index, descriptor) in descriptors.iter().enumerate() {
            if !(descriptor.queue.is_closed() && descriptor.queue.is_empty()) {
                all_drained = false;
            }
            let frame = match descriptor.queue.try_dequeue(SUBSTREAM_POLL).await {
                Some(frame) => frame,
                None => continue,
            };
            // A stalled peer can wedge write_all once the socket
            // buffers fill; cancellation mid-frame is a transport end.
            let sent = tokio::select! {
                _ = cancel.cancelled() => false,
                result = write_frame(&mut stream, index as u32, &frame) => match result {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!(
                            "transmitter: send failed on stream {} ({}): {}",
                            index,
                            descriptor.name,
                            e
                        );
                        false
                    }
                },
            };
            if !sent {
                break 'outer;
            }
        }
        if all_drained {
            log::info!("transmitter: all input queues drained");
            break;
        }
    }
    let _ = stream.shutdown().await;
    finish(&descriptors, &state);
}

async fn write_frame(
    stream: &mut TcpStream,
    index: u32,
    frame: &crate::frame::Frame,
) -> std::io::Result<()> {
    let mut header = [0u8; crate::net::FRAME_HEADER_LEN];
    header[0..4].copy_from_slice(&index.to_le_bytes());
    header[4..8].copy_from_slice(&(frame.data.len() as u32).to_le_bytes());
    header[8..16].copy_from_slice(&frame.timestamp.to_le_bytes());
    stream.write_all(&header).await?;
    stream.write_all(&frame.data).await?;
    Ok(())
}

fn finish(descriptors: &[OutgoingStreamDescriptor], state: &StateCell) {
    state.set(StreamState::Stopping);
    // Closing the input queues is what releases any producer still
    // blocked on a full queue.
    for descriptor in descriptors {
        descriptor.queue.close();
    }
    state.set(StreamState::Stopped);
    log::info!("transmitter stopped");
}

#[cfg(test)]
#[path = "net_test.rs"]
mod net_test;
