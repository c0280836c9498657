use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

/// Size in bytes of one point record on the wire: x,y,z f32 + r,g,b u8 + tile u8.
pub const POINT_STRIDE: usize = 16;

/// Helper to build a 32-bit 4CC from 4 ASCII characters.
pub const fn fourcc(tag: &[u8; 4]) -> u32 {
    (tag[0] as u32) << 24 | (tag[1] as u32) << 16 | (tag[2] as u32) << 8 | tag[3] as u32
}

/// Payload tag for uncompressed pointcloud streams.
pub const FOURCC_RAW: u32 = fourcc(b"cwi0");
/// Payload tag for compressed pointcloud streams.
pub const FOURCC_COMPRESSED: u32 = fourcc(b"cwi1");
/// Payload tag for the textual control side-channel.
pub const FOURCC_CONTROL: u32 = 0x6060_6060;

/// A single point. The tile byte is a bitmask identifying which
/// camera(s) contributed the point; it doubles as the record pad byte.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub tile: u8,
}

impl Point {
    fn read_from(buf: &[u8]) -> Self {
        Self {
            x: f32::from_le_bytes(buf[0..4].try_into().unwrap()),
            y: f32::from_le_bytes(buf[4..8].try_into().unwrap()),
            z: f32::from_le_bytes(buf[8..12].try_into().unwrap()),
            r: buf[12],
            g: buf[13],
            b: buf[14],
            tile: buf[15],
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_f32_le(self.x);
        buf.put_f32_le(self.y);
        buf.put_f32_le(self.z);
        buf.put_u8(self.r);
        buf.put_u8(self.g);
        buf.put_u8(self.b);
        buf.put_u8(self.tile);
    }
}

/// One pointcloud frame travelling through the pipeline. The payload is
/// either raw point records or an opaque compressed blob; the stage that
/// produced the frame knows which. Cheap to clone (payload is shared),
/// but stages treat a frame as owned: whoever dequeues it is responsible
/// for forwarding or dropping it.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Bytes,
    /// Capture timestamp, milliseconds since the epoch.
    pub timestamp: i64,
    /// Size of a single cell/point in meters. 0.0 = unspecified.
    pub cellsize: f32,
    /// Optional per-frame metadata blob (opaque to the pipeline).
    pub metadata: Option<Bytes>,
}

impl Frame {
    pub fn new(data: Bytes, timestamp: i64) -> Self {
        Self {
            data,
            timestamp,
            cellsize: 0.0,
            metadata: None,
        }
    }

    /// Current wall-clock time in milliseconds, the timestamp domain
    /// used by all sources.
    pub fn now_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Build a raw frame from point records.
    pub fn from_points(points: &[Point], timestamp: i64, cellsize: f32) -> Self {
        let mut buf = BytesMut::with_capacity(points.len() * POINT_STRIDE);
        for p in points {
            p.write_to(&mut buf);
        }
        Self {
            data: buf.freeze(),
            timestamp,
            cellsize,
            metadata: None,
        }
    }

    /// Number of point records in a raw frame.
    pub fn point_count(&self) -> usize {
        self.data.len() / POINT_STRIDE
    }

    /// Reinterpret the payload as point records, bounds-checked.
    /// Fails on a payload whose length is not a whole number of records
    /// (e.g. a compressed blob fed to a raw consumer).
    pub fn points(&self) -> anyhow::Result<Vec<Point>> {
        if self.data.len() % POINT_STRIDE != 0 {
            anyhow::bail!(
                "payload length {} is not a multiple of the point stride",
                self.data.len()
            );
        }
        Ok(self
            .data
            .chunks_exact(POINT_STRIDE)
            .map(Point::read_from)
            .collect())
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame {{ bytes: {}, timestamp: {} }}",
            self.data.len(),
            self.timestamp
        )
    }
}
