use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;

/// Tunables of a [`crate::WebSocket`].
///
/// ```
/// # use websockets_mio::WsConfig;
/// let cfg = WsConfig::default()
///     .max_frame_size(1 << 20)
///     .poll_slice(std::time::Duration::from_millis(5));
/// assert_eq!(cfg.max_frame_size, 1 << 20);
/// ```
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Largest payload length a received frame may declare. Frames claiming
    /// more are a protocol error and close the connection. Default 64 MiB.
    pub max_frame_size: u64,
    /// Largest HTTP response head accepted during the handshake. Default 16 KiB.
    pub max_handshake_size: usize,
    /// Longest a blocked caller holds the shared readiness poller before
    /// looking again, so a reader and a writer waiting at the same time never
    /// starve each other for more than this. Default 20 ms.
    pub poll_slice: Duration,
    /// Socket read size used for data-frame payload. Default 16 KiB.
    pub read_chunk: usize,
    /// TLS settings for `wss://`. `None` uses a shared config trusting the
    /// `webpki-roots` anchors.
    pub tls_config: Option<Arc<ClientConfig>>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 << 20,
            max_handshake_size: 16 * 1024,
            poll_slice: Duration::from_millis(20),
            read_chunk: 16 * 1024,
            tls_config: None,
        }
    }
}

impl WsConfig {
    pub fn max_frame_size(mut self, max_frame_size: u64) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_handshake_size(mut self, max_handshake_size: usize) -> Self {
        self.max_handshake_size = max_handshake_size;
        self
    }

    pub fn poll_slice(mut self, poll_slice: Duration) -> Self {
        self.poll_slice = poll_slice;
        self
    }

    pub fn read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk;
        self
    }

    pub fn tls_config(mut self, tls_config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(tls_config);
        self
    }
}
