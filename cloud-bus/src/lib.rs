//! Streaming engine for volumetric (pointcloud) video: frames, bounded
//! queues, pipeline workers, codec stages, and the multiplexed TCP
//! transport. Session wiring lives in the `pointcast` crate on top.

pub mod codec;
pub mod decoder;
pub mod descriptor;
pub mod encoder;
pub mod frame;
pub mod net;
pub mod preparer;
pub mod queue;
pub mod receive;
pub mod source;
pub mod transmit;
pub mod worker;
