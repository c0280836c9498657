use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::frame::{fourcc, Frame, Point};

/// Codec seam: the pipeline only ever talks to an encoder/decoder
/// through this trait, so a native pointcloud codec can be swapped in
/// without touching the stages.
pub trait PointCodec: Send {
    /// Lossy-compress a raw frame. The result carries at most
    /// 8^octree_bits points.
    fn encode(&mut self, frame: &Frame, octree_bits: u8) -> anyhow::Result<Frame>;
    /// Inverse of `encode`: exactly one raw frame per compressed frame,
    /// timestamp and cellsize preserved.
    fn decode(&mut self, frame: &Frame) -> anyhow::Result<Frame>;
}

const COMPRESSED_MAGIC: u32 = fourcc(b"vox1");
const HEADER_LEN: usize = 28;
const COMPRESSED_STRIDE: usize = 10;

/// Built-in codec: voxel-grid quantization over the frame's bounding
/// box at 2^octree_bits cells per axis. Each surviving cell becomes one
/// point (color-averaged, tile masks OR-ed), so the output point count
/// is bounded by 8^octree_bits. Compressed records store quantized u16
/// cell coordinates instead of three f32s.
pub struct VoxelCodec;

impl VoxelCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VoxelCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PointCodec for VoxelCodec {
    fn encode(&mut self, frame: &Frame, octree_bits: u8) -> anyhow::Result<Frame> {
        let points = frame.points()?;
        let bits = octree_bits.clamp(1, 15);
        let cells = 1u32 << bits;

        let mut min = [f32::INFINITY; 3];
        let mut max = [f32::NEG_INFINITY; 3];
        for p in &points {
            for (i, v) in [p.x, p.y, p.z].into_iter().enumerate() {
                min[i] = min[i].min(v);
                max[i] = max[i].max(v);
            }
        }
        let extent = if points.is_empty() {
            0.0
        } else {
            (max[0] - min[0]).max(max[1] - min[1]).max(max[2] - min[2])
        };
        let cellsize = if extent > 0.0 {
            extent / cells as f32
        } else {
            // Degenerate cloud (empty or a single location); any
            // positive cellsize quantizes it to one cell.
            1e-6
        };

        let mut grid: HashMap<(u16, u16, u16), CellAccum> = HashMap::new();
        for p in &points {
            let key = (
                quantize(p.x, min[0], cellsize, cells),
                quantize(p.y, min[1], cellsize, cells),
                quantize(p.z, min[2], cellsize, cells),
            );
            let accum = grid.entry(key).or_default();
            accum.r += p.r as u32;
            accum.g += p.g as u32;
            accum.b += p.b as u32;
            accum.tile |= p.tile;
            accum.n += 1;
        }

        let mut buf =
            BytesMut::with_capacity(HEADER_LEN + grid.len() * COMPRESSED_STRIDE);
        buf.put_u32_le(COMPRESSED_MAGIC);
        buf.put_u8(bits);
        buf.put_bytes(0, 3);
        buf.put_u32_le(grid.len() as u32);
        buf.put_f32_le(if min[0].is_finite() { min[0] } else { 0.0 });
        buf.put_f32_le(if min[1].is_finite() { min[1] } else { 0.0 });
        buf.put_f32_le(if min[2].is_finite() { min[2] } else { 0.0 });
        buf.put_f32_le(cellsize.max(frame.cellsize));
        for ((ix, iy, iz), accum) in &grid {
            buf.put_u16_le(*ix);
            buf.put_u16_le(*iy);
            buf.put_u16_le(*iz);
            buf.put_u8((accum.r / accum.n) as u8);
            buf.put_u8((accum.g / accum.n) as u8);
            buf.put_u8((accum.b / accum.n) as u8);
            buf.put_u8(accum.tile);
        }

        Ok(Frame {
            data: buf.freeze(),
            timestamp: frame.timestamp,
            cellsize: frame.cellsize,
            metadata: frame.metadata.clone(),
        })
    }

    fn decode(&mut self, frame: &Frame) -> anyhow::Result<Frame> {
        let mut buf = frame.data.clone();
        if buf.len() < HEADER_LEN {
            anyhow::bail!("compressed frame too short: {} bytes", buf.len());
        }
        let magic = buf.get_u32_le();
        if magic != COMPRESSED_MAGIC {
            anyhow::bail!("bad compressed frame magic: {:#010x}", magic);
        }
        buf.advance(4); // octree bits + padding, informational only
        let count = buf.get_u32_le() as usize;
        let min = [buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()];
        let cellsize = buf.get_f32_le();
        if buf.len() != count * COMPRESSED_STRIDE {
            anyhow::bail!(
                "compressed frame size mismatch: {} records declared, {} bytes left",
                count,
                buf.len()
            );
        }

        let mut points = Vec::with_capacity(count);
        for _ in 0..count {
            let ix = buf.get_u16_le();
            let iy = buf.get_u16_le();
            let iz = buf.get_u16_le();
            points.push(Point {
                x: min[0] + (ix as f32 + 0.5) * cellsize,
                y: min[1] + (iy as f32 + 0.5) * cellsize,
                z: min[2] + (iz as f32 + 0.5) * cellsize,
                r: buf.get_u8(),
                g: buf.get_u8(),
                b: buf.get_u8(),
                tile: buf.get_u8(),
            });
        }

        let mut out = Frame::from_points(&points, frame.timestamp, cellsize);
        out.metadata = frame.metadata.clone();
        Ok(out)
    }
}

#[derive(Default)]
struct CellAccum {
    r: u32,
    g: u32,
    b: u32,
    n: u32,
    tile: u8,
}

fn quantize(v: f32, min: f32, cellsize: f32, cells: u32) -> u16 {
    (((v - min) / cellsize) as u32).min(cells - 1) as u16
}

/// Keep only points whose tile mask intersects `mask`. Returns `None`
/// when nothing survives, so callers can skip the frame entirely.
/// Mask 0 means no filtering.
pub fn filter_tile(frame: &Frame, mask: u8) -> anyhow::Result<Option<Frame>> {
    if mask == 0 {
        return Ok(Some(frame.clone()));
    }
    let points = frame.points()?;
    let kept: Vec<Point> = points.into_iter().filter(|p| p.tile & mask != 0).collect();
    if kept.is_empty() {
        return Ok(None);
    }
    let mut out = Frame::from_points(&kept, frame.timestamp, frame.cellsize);
    out.metadata = frame.metadata.clone();
    Ok(Some(out))
}

/// Voxel-downsample a raw frame to the given cellsize: one
/// color-averaged point per occupied cell. Used at the source when a
/// capture voxel size is configured.
pub fn voxel_downsample(frame: &Frame, cellsize: f32) -> anyhow::Result<Frame> {
    if cellsize <= 0.0 {
        return Ok(frame.clone());
    }
    let points = frame.points()?;
    let mut grid: HashMap<(i32, i32, i32), (CellAccum, [f64; 3])> = HashMap::new();
    for p in &points {
        let key = (
            (p.x / cellsize).floor() as i32,
            (p.y / cellsize).floor() as i32,
            (p.z / cellsize).floor() as i32,
        );
        let (accum, pos) = grid.entry(key).or_default();
        accum.r += p.r as u32;
        accum.g += p.g as u32;
        accum.b += p.b as u32;
        accum.tile |= p.tile;
        accum.n += 1;
        pos[0] += p.x as f64;
        pos[1] += p.y as f64;
        pos[2] += p.z as f64;
    }
    let downsampled: Vec<Point> = grid
        .into_values()
        .map(|(accum, pos)| Point {
            x: (pos[0] / accum.n as f64) as f32,
            y: (pos[1] / accum.n as f64) as f32,
            z: (pos[2] / accum.n as f64) as f32,
            r: (accum.r / accum.n) as u8,
            g: (accum.g / accum.n) as u8,
            b: (accum.b / accum.n) as u8,
            tile: accum.tile,
        })
        .collect();
    let mut out = Frame::from_points(&downsampled, frame.timestamp, cellsize);
    out.metadata = frame.metadata.clone();
    Ok(out)
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
