use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::codec::{PointCodec, VoxelCodec};
use crate::queue::FrameQueue;
use crate::worker::{Worker, POLL_INTERVAL};

/// Decompressing decoder stage: exactly one raw frame out per
/// compressed frame in, timestamp and cellsize preserved. A frame that
/// fails to decode is dropped with a warning; the stage continues.
pub struct Decoder {
    worker: Worker,
}

impl Decoder {
    pub fn start(in_queue: Arc<FrameQueue>, out_queue: Arc<FrameQueue>) -> Self {
        Self::start_with_codec(in_queue, out_queue, Box::new(VoxelCodec::new()))
    }

    pub fn start_with_codec(
        in_queue: Arc<FrameQueue>,
        out_queue: Arc<FrameQueue>,
        codec: Box<dyn PointCodec>,
    ) -> Self {
        let worker = Worker::spawn("decoder", move |cancel| {
            decode_loop(cancel, in_queue, out_queue, Some(codec))
        });
        Self { worker }
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub async fn stop_and_wait(&self) {
        self.worker.stop_and_wait().await;
    }
}

/// Pass-through decoder used when the incoming stream is uncompressed.
pub struct NullDecoder {
    worker: Worker,
}

impl NullDecoder {
    pub fn start(in_queue: Arc<FrameQueue>, out_queue: Arc<FrameQueue>) -> Self {
        let worker = Worker::spawn("null-decoder", move |cancel| {
            decode_loop(cancel, in_queue, out_queue, None)
        });
        Self { worker }
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub async fn stop_and_wait(&self) {
        self.worker.stop_and_wait().await;
    }
}

async fn decode_loop(
    cancel: CancellationToken,
    in_queue: Arc<FrameQueue>,
    out_queue: Arc<FrameQueue>,
    mut codec: Option<Box<dyn PointCodec>>,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let frame = match in_queue.try_dequeue(POLL_INTERVAL).await {
            Some(frame) => frame,
            None => {
                if in_queue.is_closed() {
                    break;
                }
                continue;
            }
        };
        let out = match codec.as_mut() {
            Some(codec) => match codec.decode(&frame) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::warn!(
                        "{}: dropping frame that failed to decode: {}",
                        out_queue.name(),
                        e
                    );
                    continue;
                }
            },
            None => frame,
        };
        out_queue.enqueue(out).await;
    }
    out_queue.close();
    log::info!("decoder stage finished ({})", in_queue.name());
}
