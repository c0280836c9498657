use std::sync::{Arc, Mutex};

/// Lifecycle of a transport worker. Any socket error while `Streaming`
/// goes to `Stopping` (queues closed) and then `Stopped`; there is no
/// automatic retry, the caller reconstructs the worker if it wants one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Constructed,
    Connecting,
    Streaming,
    Stopping,
    Stopped,
}

#[derive(Clone)]
pub(crate) struct StateCell(Arc<Mutex<StreamState>>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(StreamState::Constructed)))
    }

    pub fn set(&self, state: StreamState) {
        *self.0.lock().unwrap() = state;
    }

    pub fn get(&self) -> StreamState {
        *self.0.lock().unwrap()
    }
}

/// Per-frame wire header: stream index u32, payload length u32,
/// timestamp i64, all little-endian.
pub(crate) const FRAME_HEADER_LEN: usize = 16;

/// Upper bound on a single frame payload; anything larger is treated as
/// a corrupt stream (we cannot resync within the connection).
pub(crate) const MAX_PAYLOAD: u32 = 256 * 1024 * 1024;

/// Parse a `tcp://host:port` transport address.
pub fn parse_tcp_url(url: &str) -> anyhow::Result<(String, u16)> {
    let rest = url
        .strip_prefix("tcp://")
        .ok_or_else(|| anyhow::anyhow!("unsupported url (expected tcp://host:port): {}", url))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("missing port in url: {}", url))?;
    if host.is_empty() {
        anyhow::bail!("missing host in url: {}", url);
    }
    let port: u16 = port
        .parse()
        .map_err(|e| anyhow::anyhow!("bad port in url {}: {}", url, e))?;
    Ok((host.to_string(), port))
}
