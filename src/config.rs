/// Session-level configuration: where to listen, where the peer is,
/// and how the media streams are shaped. The default is a
/// single-machine loopback session on the conventional ports.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Where our media transmitter listens (`tcp://host:port`).
    pub media_url: String,
    /// The peer's media endpoint our receive pipeline connects to.
    pub peer_media_url: String,
    /// Where our control sender listens.
    pub control_url: String,
    /// The peer's control endpoint our control receiver connects to.
    pub peer_control_url: String,
    /// Insert a compressing encoder/decoder pair into the streams.
    pub compressed: bool,
    /// Transmit per-camera tiles as independent streams.
    pub tiled: bool,
    /// Octree depth for the compressor; at most 8^bits points survive.
    pub octree_bits: u8,
    /// Capture frame rate.
    pub framerate: f32,
    /// Points per synthetic cloud.
    pub npoints: usize,
    /// If non-zero, voxelize captured pointclouds to this cellsize.
    pub voxel_size: f32,
    /// Dropping (true) or blocking (false) policy for the per-tile
    /// transmit queues. Dropping sheds stale frames instead of
    /// stalling the capture when one tile has no consumer.
    pub drop_when_full: bool,
    /// Rendering cellsize used when a frame does not carry one.
    pub default_cellsize: f32,
    /// Multiplication factor for the rendered cellsize.
    pub cellsize_factor: f32,
}

impl SessionConfig {
    /// Defaults with environment overrides, one `POINTCAST_*` variable
    /// per endpoint plus the flags that differ per deployment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let mut set = |name: &str, target: &mut String| {
            if let Ok(value) = std::env::var(name) {
                *target = value;
            }
        };
        set("POINTCAST_MEDIA_URL", &mut config.media_url);
        set("POINTCAST_PEER_MEDIA_URL", &mut config.peer_media_url);
        set("POINTCAST_CONTROL_URL", &mut config.control_url);
        set("POINTCAST_PEER_CONTROL_URL", &mut config.peer_control_url);
        if let Ok(value) = std::env::var("POINTCAST_TILED") {
            config.tiled = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(value) = std::env::var("POINTCAST_UNCOMPRESSED") {
            config.compressed = !(value == "1" || value.eq_ignore_ascii_case("true"));
        }
        if let Ok(Ok(bits)) = std::env::var("POINTCAST_OCTREE_BITS").map(|v| v.parse()) {
            config.octree_bits = bits;
        }
        if let Ok(Ok(npoints)) = std::env::var("POINTCAST_NPOINTS").map(|v| v.parse()) {
            config.npoints = npoints;
        }
        if let Ok(Ok(fps)) = std::env::var("POINTCAST_FRAMERATE").map(|v| v.parse()) {
            config.framerate = fps;
        }
        config
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            media_url: "tcp://localhost:4303".to_string(),
            peer_media_url: "tcp://localhost:4303".to_string(),
            control_url: "tcp://localhost:4304".to_string(),
            peer_control_url: "tcp://localhost:4304".to_string(),
            compressed: true,
            tiled: false,
            octree_bits: 9,
            framerate: 15.0,
            npoints: 8000,
            voxel_size: 0.0,
            drop_when_full: true,
            default_cellsize: 0.01,
            cellsize_factor: 1.0,
        }
    }
}
