use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::frame::{Frame, Point};
use crate::queue::FrameQueue;
use crate::worker::{Worker, POLL_INTERVAL};

/// The component a renderer polls once per display tick.
///
/// A background worker drains the input queue into a single pending
/// slot; the presentation thread claims it with `latch_frame`. The
/// worker never blocks on the presentation side: replacing a pending
/// frame that was never latched just bumps the drop counter.
pub struct Preparer {
    worker: Worker,
    shared: Arc<PreparerShared>,
}

struct PreparerShared {
    in_queue: Arc<FrameQueue>,
    state: Mutex<PrepState>,
    default_cellsize: f32,
    cellsize_factor: f32,
}

#[derive(Default)]
struct PrepState {
    pending: Option<Frame>,
    current: Option<Frame>,
    end_of_data: bool,
    dropped: u64,
}

impl Preparer {
    /// `default_cellsize` is used when a frame does not carry one;
    /// `cellsize_factor` scales whatever cellsize is used.
    pub fn start(in_queue: Arc<FrameQueue>, default_cellsize: f32, cellsize_factor: f32) -> Self {
        let shared = Arc::new(PreparerShared {
            in_queue,
            state: Mutex::new(PrepState::default()),
            default_cellsize,
            cellsize_factor,
        });
        let shared_clone = shared.clone();
        let worker = Worker::spawn("preparer", move |cancel| prepare_loop(cancel, shared_clone));
        Self { worker, shared }
    }

    /// Claim the most recent complete frame for presentation. Returns
    /// true if a new frame became current.
    pub fn latch_frame(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        match state.pending.take() {
            Some(frame) => {
                state.current = Some(frame);
                true
            }
            None => false,
        }
    }

    /// Copy the latched frame's points into `out`. Returns the number
    /// of points (0 when nothing is latched or the payload is not raw).
    pub fn get_point_buffer(&self, out: &mut Vec<Point>) -> usize {
        let state = self.shared.state.lock().unwrap();
        out.clear();
        if let Some(frame) = &state.current {
            match frame.points() {
                Ok(points) => *out = points,
                Err(e) => {
                    log::warn!("preparer: latched frame is not a raw pointcloud: {}", e);
                }
            }
        }
        out.len()
    }

    /// Size (meters) to render a single point of the current frame at.
    pub fn point_size(&self) -> f32 {
        let state = self.shared.state.lock().unwrap();
        let cellsize = state
            .current
            .as_ref()
            .map(|f| f.cellsize)
            .filter(|c| *c > 0.0)
            .unwrap_or(self.shared.default_cellsize);
        cellsize * self.shared.cellsize_factor
    }

    /// Timestamp of the current frame (diagnostics).
    pub fn current_timestamp(&self) -> i64 {
        let state = self.shared.state.lock().unwrap();
        state.current.as_ref().map(|f| f.timestamp).unwrap_or(0)
    }

    /// Buffered time span of the input queue (diagnostics).
    pub fn queue_duration(&self) -> i64 {
        self.shared.in_queue.queued_duration()
    }

    /// True once the upstream has finished and everything buffered has
    /// been offered for presentation.
    pub fn end_of_data(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.end_of_data && state.pending.is_none()
    }

    /// Frames that were replaced before the renderer latched them.
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().unwrap().dropped
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub async fn stop_and_wait(&self) {
        self.worker.stop_and_wait().await;
    }
}

async fn prepare_loop(cancel: CancellationToken, shared: Arc<PreparerShared>) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match shared.in_queue.try_dequeue(POLL_INTERVAL).await {
            Some(frame) => {
                let mut state = shared.state.lock().unwrap();
                if state.pending.replace(frame).is_some() {
                    state.dropped += 1;
                }
            }
            None => {
                if shared.in_queue.is_closed() {
                    shared.state.lock().unwrap().end_of_data = true;
                    break;
                }
            }
        }
    }
    log::info!("preparer finished ({})", shared.in_queue.name());
}

#[cfg(test)]
#[path = "preparer_test.rs"]
mod preparer_test;
