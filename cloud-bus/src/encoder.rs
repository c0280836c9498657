use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::codec::{filter_tile, PointCodec, VoxelCodec};
use crate::descriptor::EncoderDescriptor;
use crate::queue::FrameQueue;
use crate::worker::{Worker, POLL_INTERVAL};

/// Compressing encoder stage. One instance serves any number of
/// tile/quality descriptors: every input frame is tile-filtered and
/// compressed once per descriptor, fanning out to the per-descriptor
/// output queues.
pub struct Encoder {
    worker: Worker,
}

impl Encoder {
    pub fn start(in_queue: Arc<FrameQueue>, descriptors: Vec<EncoderDescriptor>) -> Self {
        Self::start_with_codec(in_queue, descriptors, Box::new(VoxelCodec::new()))
    }

    /// Start with an externally supplied codec implementation.
    pub fn start_with_codec(
        in_queue: Arc<FrameQueue>,
        descriptors: Vec<EncoderDescriptor>,
        codec: Box<dyn PointCodec>,
    ) -> Self {
        let worker = Worker::spawn("encoder", move |cancel| {
            encode_loop(cancel, in_queue, descriptors, Some(codec))
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

/// Pass-through encoder used when compression is disabled. Still
/// performs per-descriptor tile filtering, so frames not matching a
/// descriptor's tile are dropped ahead of transmission.
pub struct NullEncoder {
    worker: Worker,
}

impl NullEncoder {
    pub fn start(in_queue: Arc<FrameQueue>, descriptors: Vec<EncoderDescriptor>) -> Self {
        let worker = Worker::spawn("null-encoder", move |cancel| {
            encode_loop(cancel, in_queue, descriptors, None)
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

async fn encode_loop(
    cancel: CancellationToken,
    in_queue: Arc<FrameQueue>,
    descriptors: Vec<EncoderDescriptor>,
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
        for descriptor in &descriptors {
            let filtered = match filter_tile(&frame, descriptor.tile_filter) {
                Ok(Some(filtered)) => filtered,
                // Nothing in this frame for this tile.
                Ok(None) => continue,
                Err(e) => {
                    log::warn!(
                        "{}: dropping unfilterable frame: {}",
                        descriptor.out_queue.name(),
                        e
                    );
                    continue;
                }
            };
            let out = match codec.as_mut() {
                Some(codec) => match codec.encode(&filtered, descriptor.octree_bits) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::warn!(
                            "{}: dropping frame that failed to encode: {}",
                            descriptor.out_queue.name(),
                            e
                        );
                        continue;
                    }
                },
                None => filtered,
            };
            descriptor.out_queue.enqueue(out).await;
        }
    }
    for descriptor in &descriptors {
        descriptor.out_queue.close();
    }
    log::info!("encoder stage finished ({})", in_queue.name());
}
