use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::queue::FrameQueue;

/// Direction a tile points, relative to the centroid of the whole
/// pointcloud. Zero = directionless (the untiled aggregate).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Orientation {
    pub const ZERO: Orientation = Orientation {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

/// A tile as reported by a capture source.
#[derive(Clone, Debug)]
pub struct TileInfo {
    /// Direction of this tile, as seen from the pointcloud centroid.
    pub normal: Orientation,
    /// Identifier of the camera that produces this tile.
    pub camera_name: String,
    /// 8-bit bitmask representing this tile in each point.
    /// Mask 0 designates the unfiltered aggregate pointcloud.
    pub camera_mask: u8,
}

/// Description of a single outgoing (tile) stream.
#[derive(Clone)]
pub struct OutgoingStreamDescriptor {
    /// Name, for diagnostics.
    pub name: String,
    /// Tile carried by this stream.
    pub tile_number: u32,
    /// Index of the quality, for multi-quality streams.
    pub quality_index: u32,
    pub orientation: Orientation,
    /// Queue the producer fills and the transmitter drains.
    pub queue: Arc<FrameQueue>,
}

/// Parameters of one encoder output (possibly one of several served by
/// a single encoder instance).
#[derive(Clone)]
pub struct EncoderDescriptor {
    /// Depth of the octree used during encoding. The compressed
    /// pointcloud has at most 8^octree_bits points.
    pub octree_bits: u8,
    /// Tile mask to filter on before encoding. 0 means no filtering.
    pub tile_filter: u8,
    /// Output queue, usually shared with the corresponding transmitter.
    pub out_queue: Arc<FrameQueue>,
}

/// A single incoming stream within the wire connection.
#[derive(Clone, Debug)]
pub struct IncomingStreamDescriptor {
    /// Index of the stream in the multiplexed connection.
    pub stream_index: u32,
    pub tile_number: u32,
    pub orientation: Orientation,
}

/// The set of quality-variant streams expected for one incoming tile,
/// and the queue their frames land on.
#[derive(Clone)]
pub struct IncomingTileDescriptor {
    pub name: String,
    /// Queue on which frames for this tile are deposited.
    pub out_queue: Arc<FrameQueue>,
    pub tile_number: u32,
    pub streams: Vec<IncomingStreamDescriptor>,
}

/// Control-channel payload: which tiles exist, and how good/expensive
/// each available representation of each tile is. This is the only
/// schema exchanged between peers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkTileDescription {
    pub tiles: Vec<NetworkTileInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkTileInfo {
    pub orientation: Orientation,
    pub qualities: Vec<NetworkQualityInfo>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkQualityInfo {
    /// Estimated bandwidth this stream requires.
    pub bandwidth_requirement: f32,
    /// Visual quality indication, 0.0 worst to 1.0 best.
    pub representation: f32,
}

/// Select which of a source's tiles are actually transmitted.
///
/// A tile with mask 0 is the unfiltered aggregate pointcloud. For an
/// untiled session exactly that aggregate is sent (one stream). For a
/// tiled session the aggregate is excluded whenever real tiles exist,
/// so the per-camera tiles travel as independent streams.
pub fn select_transmit_tiles(tiles: &[TileInfo], tiled: bool) -> Vec<TileInfo> {
    if tiles.is_empty() {
        return vec![untiled_aggregate()];
    }
    if !tiled {
        return match tiles.iter().find(|t| t.camera_mask == 0) {
            Some(aggregate) => vec![aggregate.clone()],
            None => vec![untiled_aggregate()],
        };
    }
    if tiles.len() > 1 && tiles[0].camera_mask == 0 {
        return tiles[1..].to_vec();
    }
    tiles.to_vec()
}

fn untiled_aggregate() -> TileInfo {
    TileInfo {
        normal: Orientation::ZERO,
        camera_name: "single".to_string(),
        camera_mask: 0,
    }
}
