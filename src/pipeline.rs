use std::sync::Arc;

use futures::future::join_all;

use cloud_bus::decoder::{Decoder, NullDecoder};
use cloud_bus::descriptor::{
    select_transmit_tiles, EncoderDescriptor, IncomingStreamDescriptor, IncomingTileDescriptor,
    NetworkQualityInfo, NetworkTileDescription, NetworkTileInfo, Orientation,
    OutgoingStreamDescriptor,
};
use cloud_bus::encoder::{Encoder, NullEncoder};
use cloud_bus::frame::{FOURCC_COMPRESSED, FOURCC_RAW};
use cloud_bus::preparer::Preparer;
use cloud_bus::queue::FrameQueue;
use cloud_bus::receive::StreamReceiver;
use cloud_bus::source::{FrameSource, SourceStage, SyntheticSource};
use cloud_bus::transmit::StreamTransmitter;

/// Where frames come from. Real capture devices and prerecorded
/// readers are injected as `Custom` sources.
pub enum SourceConfig {
    Synthetic { npoints: usize, tiled: bool },
    Custom(Box<dyn FrameSource>),
}

/// Where frames go. "No transmitter" is a first-class value, not a
/// null reference.
pub enum SinkConfig {
    None,
    Tcp {
        url: String,
        compressed: bool,
        tiled: bool,
        /// One compressed quality variant per octree depth, coarsest
        /// first; every transmitted tile carries all of them. Ignored
        /// when `compressed` is false (raw streams have one quality).
        octree_depths: Vec<u8>,
        drop_when_full: bool,
    },
}

struct SinkPlan {
    url: String,
    compressed: bool,
    tiled: bool,
    octree_depths: Vec<u8>,
    drop_when_full: bool,
    encoder_queue: Arc<FrameQueue>,
}

pub struct SendConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub framerate: f32,
    pub voxel_size: f32,
    /// Keep a self-view preparer fed from the capture.
    pub self_view: bool,
    pub default_cellsize: f32,
    pub cellsize_factor: f32,
}

enum EncoderStage {
    Compressed(Encoder),
    Null(NullEncoder),
}

impl EncoderStage {
    async fn stop_and_wait(&self) {
        match self {
            EncoderStage::Compressed(encoder) => encoder.stop_and_wait().await,
            EncoderStage::Null(encoder) => encoder.stop_and_wait().await,
        }
    }
}

enum DecoderStage {
    Compressed(Decoder),
    Null(NullDecoder),
}

impl DecoderStage {
    async fn stop_and_wait(&self) {
        match self {
            DecoderStage::Compressed(decoder) => decoder.stop_and_wait().await,
            DecoderStage::Null(decoder) => decoder.stop_and_wait().await,
        }
    }
}

/// Capture side: source → (self-view preparer) and source → encoder →
/// per-tile queues → transmitter. The reader is constructed before the
/// transmitter because the transmitter layout is derived from the
/// source's tile report.
pub struct SendPipeline {
    source: SourceStage,
    encoder: Option<EncoderStage>,
    transmitter: Option<StreamTransmitter>,
    preparer: Option<Preparer>,
    tile_description: Option<NetworkTileDescription>,
}

impl SendPipeline {
    pub async fn build(config: SendConfig) -> anyhow::Result<SendPipeline> {
        let render_queue = config
            .self_view
            .then(|| Arc::new(FrameQueue::new("ReaderRenderQueue", 2, true)));

        let sink = match &config.sink {
            SinkConfig::None => None,
            SinkConfig::Tcp {
                url,
                compressed,
                tiled,
                octree_depths,
                drop_when_full,
            } => {
                if url.is_empty() {
                    anyhow::bail!("transmitter configured without an output url");
                }
                if *compressed && octree_depths.is_empty() {
                    anyhow::bail!("compressed transmitter needs at least one octree depth");
                }
                Some(SinkPlan {
                    url: url.clone(),
                    compressed: *compressed,
                    tiled: *tiled,
                    octree_depths: octree_depths.clone(),
                    drop_when_full: *drop_when_full,
                    encoder_queue: Arc::new(FrameQueue::new("ReaderEncoderQueue", 2, true)),
                })
            }
        };
        let encoder_queue = sink.as_ref().map(|plan| plan.encoder_queue.clone());

        let source: Box<dyn FrameSource> = match config.source {
            SourceConfig::Synthetic { npoints, tiled } => {
                if tiled {
                    Box::new(SyntheticSource::tiled(npoints))
                } else {
                    Box::new(SyntheticSource::new(npoints))
                }
            }
            SourceConfig::Custom(source) => source,
        };
        let source = SourceStage::start(
            source,
            config.framerate,
            config.voxel_size,
            render_queue.clone(),
            encoder_queue.clone(),
        );

        let mut encoder = None;
        let mut transmitter = None;
        let mut tile_description = None;
        if let Some(plan) = sink {
            let SinkPlan {
                url,
                compressed,
                tiled,
                octree_depths,
                drop_when_full,
                encoder_queue: in_queue,
            } = plan;
            let source_tiles = source.tiles().map(|t| t.to_vec()).unwrap_or_default();
            let selected = select_transmit_tiles(&source_tiles, tiled);
            // Raw streams have exactly one quality; depth 0 means "no
            // quantization" to the null encoder.
            let depths: Vec<u8> = if compressed { octree_depths } else { vec![0] };
            log::info!(
                "send pipeline: transmitting {} of {} tile(s), {} quality variant(s) each",
                selected.len(),
                source_tiles.len().max(1),
                depths.len()
            );

            // Stream indices on the wire are tile-major with quality
            // variants inner; the receiver derives the same layout from
            // the advertised description.
            let mut outgoing = Vec::with_capacity(selected.len() * depths.len());
            let mut encoders = Vec::with_capacity(selected.len() * depths.len());
            for tile in &selected {
                for (quality, bits) in depths.iter().enumerate() {
                    let name = if depths.len() > 1 {
                        format!("{}#q{}", tile.camera_name, quality)
                    } else {
                        tile.camera_name.clone()
                    };
                    let queue = Arc::new(FrameQueue::new(
                        &format!("TransmitterInputQueue#{}", name),
                        2,
                        drop_when_full,
                    ));
                    outgoing.push(OutgoingStreamDescriptor {
                        name,
                        tile_number: tile.camera_mask as u32,
                        quality_index: quality as u32,
                        orientation: tile.normal,
                        queue: queue.clone(),
                    });
                    encoders.push(EncoderDescriptor {
                        octree_bits: *bits,
                        tile_filter: tile.camera_mask,
                        out_queue: queue,
                    });
                }
            }

            encoder = Some(if compressed {
                EncoderStage::Compressed(Encoder::start(in_queue, encoders))
            } else {
                EncoderStage::Null(NullEncoder::start(in_queue, encoders))
            });

            let fourcc = if compressed { FOURCC_COMPRESSED } else { FOURCC_RAW };
            match StreamTransmitter::start(&url, fourcc, outgoing).await {
                Ok(t) => transmitter = Some(t),
                Err(e) => {
                    // Tear down whatever already runs: the pipeline
                    // must not start partially wired.
                    source.stop_and_wait().await;
                    if let Some(encoder) = &encoder {
                        encoder.stop_and_wait().await;
                    }
                    return Err(e);
                }
            }

            tile_description = Some(describe_tiles(
                &selected,
                compressed,
                &depths,
                config.framerate,
            ));
        }

        let preparer = render_queue
            .map(|queue| Preparer::start(queue, config.default_cellsize, config.cellsize_factor));

        Ok(SendPipeline {
            source,
            encoder,
            transmitter,
            preparer,
            tile_description,
        })
    }

    /// Layout to advertise on the control channel. `None` when there is
    /// no transmitter.
    pub fn tile_description(&self) -> Option<&NetworkTileDescription> {
        self.tile_description.as_ref()
    }

    /// Self-view preparer, if a self-view was configured.
    pub fn preparer(&self) -> Option<&Preparer> {
        self.preparer.as_ref()
    }

    /// Bound media address (for sessions that listen on port 0).
    pub fn media_addr(&self) -> Option<std::net::SocketAddr> {
        self.transmitter.as_ref().map(|t| t.local_addr())
    }

    pub async fn stop_and_wait(&self) {
        self.source.stop_and_wait().await;
        if let Some(encoder) = &self.encoder {
            encoder.stop_and_wait().await;
        }
        if let Some(transmitter) = &self.transmitter {
            transmitter.stop_and_wait().await;
        }
        if let Some(preparer) = &self.preparer {
            preparer.stop_and_wait().await;
        }
    }
}

fn describe_tiles(
    tiles: &[cloud_bus::descriptor::TileInfo],
    compressed: bool,
    depths: &[u8],
    framerate: f32,
) -> NetworkTileDescription {
    // Rough per-stream budget: compressed streams are bounded by the
    // octree cell count, raw streams are unbounded so report zero.
    let qualities: Vec<NetworkQualityInfo> = if compressed {
        depths
            .iter()
            .map(|bits| NetworkQualityInfo {
                bandwidth_requirement: framerate * 10.0 * 8f32.powi(*bits as i32),
                representation: (*bits as f32 / 15.0).min(1.0),
            })
            .collect()
    } else {
        vec![NetworkQualityInfo {
            bandwidth_requirement: 0.0,
            representation: 1.0,
        }]
    };
    NetworkTileDescription {
        tiles: tiles
            .iter()
            .map(|tile| NetworkTileInfo {
                orientation: tile.normal,
                qualities: qualities.clone(),
            })
            .collect(),
    }
}

pub struct RecvConfig {
    /// The peer's media endpoint (`tcp://host:port`).
    pub url: String,
    pub compressed: bool,
    pub default_cellsize: f32,
    pub cellsize_factor: f32,
}

/// Receive side: receiver → per-tile decoder → per-tile preparer.
///
/// Constructed inert, because the queue/tile layout cannot exist until
/// the peer's tile description arrives on the control channel.
/// `activate` builds and starts everything, exactly once.
pub struct ReceivePipeline {
    config: RecvConfig,
    active: Option<ActiveReceive>,
}

struct ActiveReceive {
    receiver: StreamReceiver,
    decoders: Vec<DecoderStage>,
    preparers: Vec<Preparer>,
}

impl ReceivePipeline {
    pub fn new(config: RecvConfig) -> anyhow::Result<Self> {
        // Validate the endpoint now: a bad url is a configuration
        // error, not something to discover at activation time.
        cloud_bus::net::parse_tcp_url(&config.url)?;
        Ok(Self {
            config,
            active: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Number of incoming tiles, 0 while inert.
    pub fn tile_count(&self) -> usize {
        self.active.as_ref().map(|a| a.preparers.len()).unwrap_or(0)
    }

    /// Build and start the receive chain from the peer's advertised
    /// layout. An empty description means a single untiled stream.
    pub fn activate(&mut self, description: &NetworkTileDescription) -> anyhow::Result<()> {
        if self.active.is_some() {
            anyhow::bail!("receive pipeline already activated");
        }
        let tiles: Vec<(Orientation, usize)> = if description.tiles.is_empty() {
            vec![(Orientation::ZERO, 1)]
        } else {
            description
                .tiles
                .iter()
                .map(|t| (t.orientation, t.qualities.len().max(1)))
                .collect()
        };
        log::info!("receive pipeline: activating with {} tile(s)", tiles.len());

        let mut incoming = Vec::with_capacity(tiles.len());
        let mut decoders = Vec::with_capacity(tiles.len());
        let mut preparers = Vec::with_capacity(tiles.len());
        // Wire stream indices are tile-major with quality variants
        // inner, matching the transmitter's layout. Every variant of a
        // tile lands on the same queue; the preparer keeps the newest.
        let mut next_stream = 0u32;
        for (index, (orientation, quality_count)) in tiles.iter().enumerate() {
            let receive_queue = Arc::new(FrameQueue::new(
                &format!("ReceiverOutputQueue#{}", index),
                2,
                false,
            ));
            let decoded_queue = Arc::new(FrameQueue::new(
                &format!("DecoderOutputQueue#{}", index),
                2,
                false,
            ));
            let mut streams = Vec::with_capacity(*quality_count);
            for _ in 0..*quality_count {
                streams.push(IncomingStreamDescriptor {
                    stream_index: next_stream,
                    tile_number: index as u32,
                    orientation: *orientation,
                });
                next_stream += 1;
            }
            incoming.push(IncomingTileDescriptor {
                name: format!("tile#{}", index),
                out_queue: receive_queue.clone(),
                tile_number: index as u32,
                streams,
            });
            decoders.push(if self.config.compressed {
                DecoderStage::Compressed(Decoder::start(receive_queue, decoded_queue.clone()))
            } else {
                DecoderStage::Null(NullDecoder::start(receive_queue, decoded_queue.clone()))
            });
            preparers.push(Preparer::start(
                decoded_queue,
                self.config.default_cellsize,
                self.config.cellsize_factor,
            ));
        }

        let fourcc = if self.config.compressed {
            FOURCC_COMPRESSED
        } else {
            FOURCC_RAW
        };
        let receiver = StreamReceiver::start(&self.config.url, fourcc, incoming)?;
        self.active = Some(ActiveReceive {
            receiver,
            decoders,
            preparers,
        });
        Ok(())
    }

    /// Per-tile preparers for the renderer to poll; empty while inert.
    pub fn preparers(&self) -> &[Preparer] {
        self.active
            .as_ref()
            .map(|a| a.preparers.as_slice())
            .unwrap_or(&[])
    }

    /// True once every tile's stream has finished.
    pub fn end_of_data(&self) -> bool {
        match &self.active {
            Some(active) => active.preparers.iter().all(|p| p.end_of_data()),
            None => false,
        }
    }

    pub async fn stop_and_wait(&self) {
        if let Some(active) = &self.active {
            active.receiver.stop_and_wait().await;
            join_all(active.decoders.iter().map(|d| d.stop_and_wait())).await;
            join_all(active.preparers.iter().map(|p| p.stop_and_wait())).await;
        }
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
