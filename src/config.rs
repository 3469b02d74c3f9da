use std::time::Duration;

/// Server configuration, advertised to clients in the Engine.IO OPEN
/// handshake.
///
/// The defaults match the upstream Socket.IO server: 25 s ping interval and
/// timeout, 1 MB payload ceiling.
#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    /// Reload value for the per-connection keep-alive countdown.
    pub ping_interval: Duration,
    /// Advertised to the client in the OPEN packet.
    pub ping_timeout: Duration,
    /// Frames longer than this are dropped without dispatch.
    pub max_payload: usize,
    /// How long a server-initiated emit waits for the client acknowledgement.
    pub ack_timeout: Duration,
}

impl Default for SocketIoConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(25_000),
            max_payload: 1_000_000,
            ack_timeout: Duration::from_secs(5),
        }
    }
}
