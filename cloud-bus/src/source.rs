use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::codec::voxel_downsample;
use crate::descriptor::{Orientation, TileInfo};
use crate::frame::{Frame, Point};
use crate::queue::FrameQueue;
use crate::worker::Worker;

/// Capture collaborator: anything that produces pointcloud frames.
/// Real camera grabbers and prerecorded readers live outside this crate
/// and plug in through this trait.
pub trait FrameSource: Send {
    /// Produce the next frame. `None` means end of data.
    fn capture(&mut self) -> Option<Frame>;

    /// Tiles this source produces. `None` or empty means untiled.
    fn tiles(&self) -> Option<Vec<TileInfo>> {
        None
    }

    /// Release capture resources. The reader stage calls this when its
    /// loop exits; device-backed sources override it to shut the camera
    /// down deterministically instead of relying on `Drop`.
    fn stop(&mut self) {}
}

/// Built-in generator: a rotating spherical cloud laid out on a
/// golden-angle spiral, so any point count gives even coverage. With
/// tiling enabled the two hemispheres get tile masks 1 and 2 and the
/// source reports them (plus the mask-0 aggregate) as its tiles.
pub struct SyntheticSource {
    npoints: usize,
    tiled: bool,
    phase: f32,
}

impl SyntheticSource {
    pub fn new(npoints: usize) -> Self {
        Self {
            npoints: npoints.max(1),
            tiled: false,
            phase: 0.0,
        }
    }

    pub fn tiled(npoints: usize) -> Self {
        Self {
            npoints: npoints.max(1),
            tiled: true,
            phase: 0.0,
        }
    }
}

const GOLDEN_ANGLE: f32 = 2.399_963;

impl FrameSource for SyntheticSource {
    fn capture(&mut self) -> Option<Frame> {
        let n = self.npoints;
        let mut points = Vec::with_capacity(n);
        for i in 0..n {
            let y = 1.0 - 2.0 * (i as f32 + 0.5) / n as f32;
            let radius = (1.0 - y * y).sqrt();
            let theta = i as f32 * GOLDEN_ANGLE + self.phase;
            let x = radius * theta.cos();
            let z = radius * theta.sin();
            let tile = if !self.tiled {
                0
            } else if x >= 0.0 {
                1
            } else {
                2
            };
            points.push(Point {
                x,
                y,
                z,
                r: ((x * 0.5 + 0.5) * 255.0) as u8,
                g: ((y * 0.5 + 0.5) * 255.0) as u8,
                b: ((z * 0.5 + 0.5) * 255.0) as u8,
                tile,
            });
        }
        self.phase = (self.phase + 0.02) % (2.0 * PI);
        Some(Frame::from_points(&points, Frame::now_timestamp(), 0.0))
    }

    fn tiles(&self) -> Option<Vec<TileInfo>> {
        if !self.tiled {
            return None;
        }
        Some(vec![
            TileInfo {
                normal: Orientation::ZERO,
                camera_name: "synthetic".to_string(),
                camera_mask: 0,
            },
            TileInfo {
                normal: Orientation::new(1.0, 0.0, 0.0),
                camera_name: "synthetic-east".to_string(),
                camera_mask: 1,
            },
            TileInfo {
                normal: Orientation::new(-1.0, 0.0, 0.0),
                camera_name: "synthetic-west".to_string(),
                camera_mask: 2,
            },
        ])
    }
}

/// Reader stage: paces captures from a `FrameSource` at the requested
/// framerate, optionally voxel-downsamples, and fans each frame out to
/// the render queue and/or the encoder queue. End of data closes both.
pub struct SourceStage {
    worker: Worker,
    tiles: Option<Vec<TileInfo>>,
}

impl SourceStage {
    pub fn start(
        source: Box<dyn FrameSource>,
        framerate: f32,
        voxel_size: f32,
        render_queue: Option<Arc<FrameQueue>>,
        encoder_queue: Option<Arc<FrameQueue>>,
    ) -> Self {
        // Snapshot the tile layout before the source moves into the
        // task; the transmitter is built from this after the reader.
        let tiles = source.tiles();
        let worker = Worker::spawn("source", move |cancel| {
            source_loop(
                cancel,
                source,
                framerate,
                voxel_size,
                render_queue,
                encoder_queue,
            )
        });
        Self { worker, tiles }
    }

    /// Tile layout reported by the source at construction time.
    pub fn tiles(&self) -> Option<&[TileInfo]> {
        self.tiles.as_deref()
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub async fn stop_and_wait(&self) {
        self.worker.stop_and_wait().await;
    }
}

async fn source_loop(
    cancel: CancellationToken,
    mut source: Box<dyn FrameSource>,
    framerate: f32,
    voxel_size: f32,
    render_queue: Option<Arc<FrameQueue>>,
    encoder_queue: Option<Arc<FrameQueue>>,
) {
    let period = if framerate > 0.0 {
        Duration::from_secs_f32(1.0 / framerate)
    } else {
        Duration::from_millis(66)
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        let frame = match source.capture() {
            Some(frame) => frame,
            None => {
                log::info!("source: end of data");
                break;
            }
        };
        let frame = if voxel_size > 0.0 {
            match voxel_downsample(&frame, voxel_size) {
                Ok(downsampled) => downsampled,
                Err(e) => {
                    log::warn!("source: dropping frame that failed to downsample: {}", e);
                    continue;
                }
            }
        } else {
            frame
        };
        if let Some(queue) = &render_queue {
            queue.enqueue(frame.clone()).await;
        }
        if let Some(queue) = &encoder_queue {
            queue.enqueue(frame.clone()).await;
        }
    }
    source.stop();
    if let Some(queue) = &render_queue {
        queue.close();
    }
    if let Some(queue) = &encoder_queue {
        queue.close();
    }
    log::info!("source stage finished");
}
