//! Uniform read/write/close over the injected transport.
//!
//! One transport may host several namespace sockets sharing a wire, so write
//! serialization lives here, per connection, not per socket: every frame goes
//! out under the connection mutex and is flushed before the mutex is
//! released.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{SocketIoError, SocketIoResult};
use crate::protocol::{EnginePacket, SocketPacket};

/// The injected transport: an upgraded WebSocket (or a test double).
///
/// Implementations only need single-frame sends; serialization of concurrent
/// writers is handled by [`Connection`].
#[async_trait]
pub trait Transport: Send {
    /// Send one complete text frame.
    async fn send_text(&mut self, frame: &str) -> io::Result<()>;

    /// Answer a WebSocket-level ping.
    async fn send_pong(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Close the transport. Must be idempotent.
    async fn close(&mut self);
}

/// Shared per-transport state: the write lock, the closed flag and the
/// keep-alive countdown driven by the ping supervisor.
pub struct Connection {
    sid: String,
    transport: Mutex<Box<dyn Transport>>,
    closed: AtomicBool,
    ping_budget_ms: AtomicI64,
}

impl Connection {
    pub fn new(sid: String, transport: Box<dyn Transport>, ping_interval: Duration) -> Self {
        Self {
            sid,
            transport: Mutex::new(transport),
            closed: AtomicBool::new(false),
            ping_budget_ms: AtomicI64::new(ping_interval.as_millis() as i64),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one frame under the connection lock.
    ///
    /// A failed write closes the transport: the peer is gone and every later
    /// emit on this connection fails with [`SocketIoError::Disconnected`].
    pub async fn write_frame(&self, frame: &str) -> SocketIoResult<()> {
        if self.is_closed() {
            return Err(SocketIoError::Disconnected);
        }
        let mut transport = self.transport.lock().await;
        match transport.send_text(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.closed.store(true, Ordering::Release);
                transport.close().await;
                Err(SocketIoError::Transport(err))
            }
        }
    }

    /// Encode and write an Engine.IO packet.
    pub async fn write_engine(&self, packet: &EnginePacket) -> SocketIoResult<()> {
        self.write_frame(&packet.encode()).await
    }

    /// Encode a Socket.IO packet, wrap it into a MESSAGE frame and write it.
    pub async fn write_socket(&self, packet: &SocketPacket) -> SocketIoResult<()> {
        self.write_frame(&packet.encode_frame()).await
    }

    pub async fn pong(&self, payload: &[u8]) {
        if self.is_closed() {
            return;
        }
        let mut transport = self.transport.lock().await;
        if transport.send_pong(payload).await.is_err() {
            self.closed.store(true, Ordering::Release);
            transport.close().await;
        }
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.transport.lock().await.close().await;
        }
    }

    /// Decrement the keep-alive countdown, returning the remaining budget.
    pub(crate) fn tick_ping(&self, elapsed_ms: i64) -> i64 {
        self.ping_budget_ms.fetch_sub(elapsed_ms, Ordering::AcqRel) - elapsed_ms
    }

    pub(crate) fn reset_ping(&self, interval: Duration) {
        self.ping_budget_ms
            .store(interval.as_millis() as i64, Ordering::Release);
    }
}

/// In-memory transport backed by an unbounded channel.
///
/// Used by the test suites to drive the lifecycle state machine without a
/// real WebSocket: frames written by the server land on the receiver half,
/// and dropping the receiver makes the next write fail like a broken wire.
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_text(&mut self, frame: &str) -> io::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(frame.to_string())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer receiver dropped")),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed")),
        }
    }

    async fn send_pong(&mut self, _payload: &[u8]) -> io::Result<()> {
        Ok(())
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Connection, mpsc::UnboundedReceiver<String>) {
        let (transport, rx) = ChannelTransport::pair();
        let conn = Connection::new(
            "sid-1".to_string(),
            Box::new(transport),
            Duration::from_millis(25_000),
        );
        (conn, rx)
    }

    #[tokio::test]
    async fn writes_reach_the_peer() {
        let (conn, mut rx) = connection();
        conn.write_frame("2").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "2");
    }

    #[tokio::test]
    async fn write_after_close_is_disconnected() {
        let (conn, mut rx) = connection();
        conn.close().await;
        assert!(matches!(
            conn.write_frame("2").await,
            Err(SocketIoError::Disconnected)
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_write_closes_the_connection() {
        let (conn, rx) = connection();
        drop(rx);
        assert!(matches!(
            conn.write_frame("2").await,
            Err(SocketIoError::Transport(_))
        ));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.write_frame("2").await,
            Err(SocketIoError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn ping_budget_counts_down_and_reloads() {
        let (conn, _rx) = connection();
        assert_eq!(conn.tick_ping(1_000), 24_000);
        assert_eq!(conn.tick_ping(24_000), 0);
        conn.reset_ping(Duration::from_millis(25_000));
        assert_eq!(conn.tick_ping(1_000), 24_000);
    }
}
