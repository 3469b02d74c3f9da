//! The server facade and the per-connection lifecycle state machine.
//!
//! [`SocketIo`] owns the namespace table, the live-connection table and the
//! two process-wide tasks: the event dispatcher and the 1 s ping supervisor.
//! The transport read loop (see `transport.rs`) feeds raw frames into
//! [`SocketIo::handle_frame`], which drives the per-namespace state machine:
//! OPEN -> per-namespace CONNECT -> EVENT/ACK -> DISCONNECT, and teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::SocketIoConfig;
use crate::connection::Connection;
use crate::error::SocketIoResult;
use crate::events::{self, InboundEvent};
use crate::namespace::Namespace;
use crate::operators::BroadcastOperator;
use crate::protocol::{AckTracker, EnginePacket, EnginePacketType, SocketPacket, SocketPacketType};
use crate::socket::Socket;

/// Authentication predicate over the CONNECT auth object.
pub type AuthPredicate = Arc<dyn Fn(&HashMap<String, String>) -> bool + Send + Sync>;

/// Per-transport bookkeeping: the shared connection plus the namespace
/// sockets it has joined, in join order.
pub struct ConnectionHandle {
    conn: Arc<Connection>,
    sockets: Mutex<Vec<Arc<Socket>>>,
    torn_down: AtomicBool,
}

impl ConnectionHandle {
    pub fn sid(&self) -> &str {
        self.conn.sid()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

struct Inner {
    config: SocketIoConfig,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    connections: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
    auth: std::sync::RwLock<Option<AuthPredicate>>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    acks: Arc<AckTracker>,
    shutdown: CancellationToken,
}

/// The Socket.IO server.
///
/// Cheap to clone; all clones share the same state. Dropping every clone does
/// not stop the background tasks; call [`SocketIo::close`] for that.
#[derive(Clone)]
pub struct SocketIo {
    inner: Arc<Inner>,
}

impl SocketIo {
    /// Build the server and start the dispatcher and ping supervisor tasks.
    /// Must be called from within a tokio runtime.
    pub fn new(config: SocketIoConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let mut namespaces = HashMap::new();
        namespaces.insert("/".to_string(), Namespace::new("/".to_string()));

        let io = Self {
            inner: Arc::new(Inner {
                config,
                namespaces: RwLock::new(namespaces),
                connections: RwLock::new(HashMap::new()),
                auth: std::sync::RwLock::new(None),
                inbound_tx,
                acks: Arc::new(AckTracker::new()),
                shutdown: shutdown.clone(),
            }),
        };

        events::spawn_dispatcher(inbound_rx, shutdown);
        io.spawn_ping_supervisor();
        io
    }

    pub fn config(&self) -> &SocketIoConfig {
        &self.inner.config
    }

    /// Get or lazily create the namespace at `path`. The root namespace `/`
    /// always exists; namespaces are never destroyed.
    pub async fn of(&self, path: &str) -> Arc<Namespace> {
        let path = normalize_path(path);
        {
            let namespaces = self.inner.namespaces.read().await;
            if let Some(ns) = namespaces.get(&path) {
                return Arc::clone(ns);
            }
        }
        let mut namespaces = self.inner.namespaces.write().await;
        Arc::clone(
            namespaces
                .entry(path.clone())
                .or_insert_with(|| Namespace::new(path)),
        )
    }

    /// Look up a namespace without creating it.
    pub async fn namespace(&self, path: &str) -> Option<Arc<Namespace>> {
        self.inner.namespaces.read().await.get(path).cloned()
    }

    /// Shorthand for `of("/").on_connection(..)`.
    pub async fn on_connection<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.of("/").await.on_connection(callback).await;
    }

    /// Install the authentication predicate applied to every CONNECT.
    pub fn on_authentication<F>(&self, predicate: F)
    where
        F: Fn(&HashMap<String, String>) -> bool + Send + Sync + 'static,
    {
        let mut auth = self.inner.auth.write().unwrap_or_else(|e| e.into_inner());
        *auth = Some(Arc::new(predicate));
    }

    /// Emit on the root namespace.
    pub async fn emit(&self, event: &str, args: Vec<JsonValue>) -> usize {
        self.of("/").await.emit(event, args).await
    }

    /// Room-targeted broadcast on the root namespace.
    pub async fn to(&self, room: impl Into<String>) -> BroadcastOperator {
        self.of("/").await.to(room)
    }

    /// Signal shutdown: the dispatcher and ping supervisor exit. Transports
    /// are owned by the HTTP layer and are not closed here; their reader
    /// tasks end when the transports do.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of live transports.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    // ------------------------------------------------------------------
    // Connection lifecycle. The transport read loop calls the three
    // methods below; tests drive them directly over a channel transport.
    // ------------------------------------------------------------------

    /// Register an upgraded transport and send the Engine.IO OPEN handshake.
    pub async fn register_connection(
        &self,
        conn: Arc<Connection>,
    ) -> SocketIoResult<Arc<ConnectionHandle>> {
        let handle = Arc::new(ConnectionHandle {
            conn: Arc::clone(&conn),
            sockets: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
        });
        {
            let mut connections = self.inner.connections.write().await;
            connections.insert(conn.sid().to_string(), Arc::clone(&handle));
        }

        let open = EnginePacket::open(conn.sid(), &self.inner.config);
        if let Err(err) = conn.write_engine(&open).await {
            self.close_connection(&handle).await;
            return Err(err);
        }
        tracing::info!(sid = conn.sid(), "session opened");
        Ok(handle)
    }

    /// Feed one inbound text frame through the state machine.
    ///
    /// Returns `false` when the connection is finished (engine CLOSE, or
    /// DISCONNECT of the last namespace) and the read loop should stop.
    /// Malformed frames are dropped and the reader continues.
    pub async fn handle_frame(&self, handle: &Arc<ConnectionHandle>, frame: &str) -> bool {
        if frame.len() > self.inner.config.max_payload {
            tracing::warn!(
                sid = handle.sid(),
                len = frame.len(),
                "dropping frame over maxPayload"
            );
            return true;
        }
        let Some(engine_type) = frame.chars().next().and_then(EnginePacketType::from_char) else {
            tracing::debug!(sid = handle.sid(), "dropping frame without engine type");
            return true;
        };
        match engine_type {
            EnginePacketType::Message => self.handle_message(handle, &frame[1..]).await,
            EnginePacketType::Ping => {
                // Server-originated keep-alive model: a peer PING is a no-op.
                tracing::debug!(sid = handle.sid(), "peer ping");
                true
            }
            EnginePacketType::Pong => true,
            EnginePacketType::Close => false,
            EnginePacketType::Open | EnginePacketType::Upgrade | EnginePacketType::Noop => {
                tracing::debug!(sid = handle.sid(), ?engine_type, "ignoring engine packet");
                true
            }
        }
    }

    /// Tear down the transport: evict it from the live table and unwind every
    /// namespace endpoint in reverse join order, firing `disconnecting` and
    /// `disconnect` per namespace. Idempotent.
    pub async fn close_connection(&self, handle: &Arc<ConnectionHandle>) {
        if handle.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut connections = self.inner.connections.write().await;
            connections.remove(handle.sid());
        }
        handle.conn.close().await;

        let mut sockets = {
            let mut joined = handle.sockets.lock().await;
            std::mem::take(&mut *joined)
        };
        sockets.reverse();
        for socket in sockets {
            events::fire_lifecycle(&socket, "disconnecting").await;
            let ns = socket.namespace();
            ns.leave_all_rooms(socket.id()).await;
            ns.remove_socket(socket.id()).await;
            events::fire_lifecycle(&socket, "disconnect").await;
        }
        tracing::info!(sid = handle.sid(), "session closed");
    }

    async fn handle_message(&self, handle: &Arc<ConnectionHandle>, body: &str) -> bool {
        let packet = match SocketPacket::decode(body) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!(sid = handle.sid(), %err, "dropping malformed frame");
                return true;
            }
        };
        match packet.packet_type {
            SocketPacketType::Connect => {
                self.connect_namespace(handle, packet).await;
                true
            }
            SocketPacketType::Disconnect => self.client_disconnect(handle, &packet.namespace).await,
            SocketPacketType::Event => {
                self.route_event(handle, packet).await;
                true
            }
            SocketPacketType::Ack => {
                self.resolve_ack(packet).await;
                true
            }
            SocketPacketType::ConnectError
            | SocketPacketType::BinaryEvent
            | SocketPacketType::BinaryAck => {
                tracing::debug!(
                    sid = handle.sid(),
                    packet_type = ?packet.packet_type,
                    "dropping unsupported packet"
                );
                true
            }
        }
    }

    /// CONNECT(ns): authenticate, materialize the per-namespace socket, send
    /// the CONNECT ack and run the namespace `connection` listeners.
    async fn connect_namespace(&self, handle: &Arc<ConnectionHandle>, packet: SocketPacket) {
        let sid = handle.sid().to_string();
        let path = packet.namespace;

        // Non-root namespaces must have been declared via `of`.
        let Some(ns) = self.namespace(&path).await else {
            tracing::debug!(sid, nsp = %path, "connect to undeclared namespace");
            let reply = SocketPacket::connect_error(&path, "Invalid namespace");
            if let Err(err) = handle.conn.write_socket(&reply).await {
                tracing::debug!(sid, %err, "failed to send connect error");
            }
            return;
        };

        let auth = {
            let guard = self.inner.auth.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        if let Some(predicate) = auth {
            let params: HashMap<String, String> = packet
                .data
                .as_ref()
                .and_then(|data| serde_json::from_value(data.clone()).ok())
                .unwrap_or_default();
            if !predicate(&params) {
                tracing::info!(sid, nsp = %path, "authentication rejected");
                let reply = SocketPacket::connect_error(&path, "Not authenticated");
                if let Err(err) = handle.conn.write_socket(&reply).await {
                    tracing::debug!(sid, %err, "failed to send connect error");
                }
                return;
            }
        }

        // A repeated CONNECT to the same namespace keeps the existing socket
        // and only re-acknowledges.
        if ns.socket(&sid).await.is_some() {
            let _ = handle.conn.write_socket(&SocketPacket::connect(&path, &sid)).await;
            return;
        }

        let socket = Arc::new(Socket::new(
            sid.clone(),
            Arc::clone(&ns),
            Arc::clone(&handle.conn),
            Arc::clone(&self.inner.acks),
            self.inner.config.ack_timeout,
        ));
        ns.insert_socket(Arc::clone(&socket)).await;
        handle.sockets.lock().await.push(Arc::clone(&socket));

        let ack = SocketPacket::connect(&path, &sid);
        if let Err(err) = handle.conn.write_socket(&ack).await {
            tracing::debug!(sid, nsp = %path, %err, "connect ack failed");
            return;
        }
        tracing::info!(sid, nsp = %path, "namespace joined");

        ns.fire_connect(socket).await;
    }

    /// DISCONNECT(ns): fire `disconnecting` while the socket still sees its
    /// rooms, drop the endpoint, and close the transport when it was the
    /// last namespace. Returns `false` when the read loop should stop.
    async fn client_disconnect(&self, handle: &Arc<ConnectionHandle>, path: &str) -> bool {
        let Some(ns) = self.namespace(path).await else {
            return true;
        };
        let Some(socket) = ns.socket(handle.sid()).await else {
            return true;
        };

        events::fire_lifecycle(&socket, "disconnecting").await;

        ns.leave_all_rooms(socket.id()).await;
        ns.remove_socket(socket.id()).await;
        let remaining = {
            let mut joined = handle.sockets.lock().await;
            joined.retain(|s| s.nsp() != path);
            joined.len()
        };
        events::fire_lifecycle(&socket, "disconnect").await;
        tracing::info!(sid = handle.sid(), nsp = %path, "namespace left");

        if remaining == 0 {
            handle.torn_down.store(true, Ordering::Release);
            {
                let mut connections = self.inner.connections.write().await;
                connections.remove(handle.sid());
            }
            handle.conn.close().await;
            tracing::info!(sid = handle.sid(), "session closed");
            return false;
        }
        true
    }

    /// EVENT: hand the payload to the dispatcher for the addressed socket.
    /// Events for namespaces the transport never joined are dropped.
    async fn route_event(&self, handle: &Arc<ConnectionHandle>, packet: SocketPacket) {
        let Some(ns) = self.namespace(&packet.namespace).await else {
            return;
        };
        let Some(socket) = ns.socket(handle.sid()).await else {
            tracing::debug!(
                sid = handle.sid(),
                nsp = %packet.namespace,
                "event for unjoined namespace dropped"
            );
            return;
        };
        let Some(data) = packet.data else {
            return;
        };
        if handle.conn.is_closed() {
            return;
        }
        let _ = self.inner.inbound_tx.send(InboundEvent {
            socket,
            data,
            ack_id: packet.id,
        });
    }

    /// Inbound ACK: resolve the pending server-initiated emit.
    async fn resolve_ack(&self, packet: SocketPacket) {
        let Some(id) = packet.id else {
            return;
        };
        let args = match packet.data {
            Some(JsonValue::Array(args)) => args,
            _ => Vec::new(),
        };
        if !self.inner.acks.resolve(id, args).await {
            tracing::debug!(ack_id = id, "ack for unknown id dropped");
        }
    }

    // ------------------------------------------------------------------
    // Ping supervisor.
    // ------------------------------------------------------------------

    /// One process-wide ticker: every second each live transport's countdown
    /// is decremented; at zero a PING goes out and the countdown reloads.
    /// A failed PING evicts the transport.
    fn spawn_ping_supervisor(&self) {
        let io = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => io.ping_pass().await,
                }
            }
            tracing::debug!("ping supervisor stopped");
        });
    }

    async fn ping_pass(&self) {
        let handles: Vec<Arc<ConnectionHandle>> = {
            let connections = self.inner.connections.read().await;
            connections.values().cloned().collect()
        };
        for handle in handles {
            if handle.conn.is_closed() {
                continue;
            }
            if handle.conn.tick_ping(1_000) > 0 {
                continue;
            }
            match handle.conn.write_engine(&EnginePacket::ping()).await {
                Ok(()) => handle.conn.reset_ping(self.inner.config.ping_interval),
                Err(err) => {
                    tracing::warn!(sid = handle.sid(), %err, "ping failed, evicting");
                    self.close_connection(&handle).await;
                }
            }
        }
        self.inner
            .acks
            .sweep_expired(self.inner.config.ack_timeout)
            .await;
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelTransport;
    use tokio::sync::mpsc;

    async fn attach(
        io: &SocketIo,
        sid: &str,
    ) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<String>) {
        let (transport, mut rx) = ChannelTransport::pair();
        let conn = Arc::new(Connection::new(
            sid.to_string(),
            Box::new(transport),
            io.config().ping_interval,
        ));
        let handle = io.register_connection(conn).await.unwrap();
        let open = rx.recv().await.unwrap();
        assert!(open.starts_with('0'));
        (handle, rx)
    }

    #[tokio::test]
    async fn connect_root_acknowledges_with_sid() {
        let io = SocketIo::new(SocketIoConfig::default());
        let (handle, mut rx) = attach(&io, "X").await;

        assert!(io.handle_frame(&handle, "40").await);
        assert_eq!(rx.recv().await.unwrap(), "40{\"sid\":\"X\"}");
    }

    #[tokio::test]
    async fn undeclared_namespace_is_rejected() {
        let io = SocketIo::new(SocketIoConfig::default());
        let (handle, mut rx) = attach(&io, "X").await;

        assert!(io.handle_frame(&handle, "40/hello,").await);
        assert_eq!(
            rx.recv().await.unwrap(),
            "44/hello,{\"message\":\"Invalid namespace\"}"
        );
        assert!(io.namespace("/hello").await.is_none());
    }

    #[tokio::test]
    async fn declared_namespace_accepts_connect() {
        let io = SocketIo::new(SocketIoConfig::default());
        io.of("/hello").await;
        let (handle, mut rx) = attach(&io, "X").await;

        assert!(io.handle_frame(&handle, "40/hello,").await);
        assert_eq!(rx.recv().await.unwrap(), "40/hello,{\"sid\":\"X\"}");

        let ns = io.namespace("/hello").await.unwrap();
        assert!(ns.socket("X").await.is_some());
    }

    #[tokio::test]
    async fn repeated_connect_keeps_the_existing_socket() {
        let io = SocketIo::new(SocketIoConfig::default());
        let (handle, mut rx) = attach(&io, "X").await;

        assert!(io.handle_frame(&handle, "40").await);
        rx.recv().await.unwrap();
        assert!(io.handle_frame(&handle, "40").await);
        assert_eq!(rx.recv().await.unwrap(), "40{\"sid\":\"X\"}");

        let ns = io.namespace("/").await.unwrap();
        assert_eq!(ns.socket_count().await, 1);
    }

    #[tokio::test]
    async fn disconnect_of_last_namespace_closes_the_transport() {
        let io = SocketIo::new(SocketIoConfig::default());
        let (handle, mut rx) = attach(&io, "X").await;

        assert!(io.handle_frame(&handle, "40").await);
        rx.recv().await.unwrap();

        assert!(!io.handle_frame(&handle, "41").await);
        assert!(handle.connection().is_closed());
        assert_eq!(io.connection_count().await, 0);

        let ns = io.namespace("/").await.unwrap();
        assert!(ns.socket("X").await.is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_dropped() {
        let mut config = SocketIoConfig::default();
        config.max_payload = 8;
        let io = SocketIo::new(config);
        let (handle, mut rx) = attach(&io, "X").await;

        assert!(io.handle_frame(&handle, "40/too-long-to-accept,").await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn engine_close_ends_the_read_loop() {
        let io = SocketIo::new(SocketIoConfig::default());
        let (handle, _rx) = attach(&io, "X").await;
        assert!(!io.handle_frame(&handle, "1").await);
    }

    #[tokio::test]
    async fn malformed_frames_keep_the_reader_alive() {
        let io = SocketIo::new(SocketIoConfig::default());
        let (handle, _rx) = attach(&io, "X").await;
        assert!(io.handle_frame(&handle, "").await);
        assert!(io.handle_frame(&handle, "4").await);
        assert!(io.handle_frame(&handle, "42[not json").await);
        assert!(io.handle_frame(&handle, "9").await);
    }

    #[tokio::test]
    async fn emit_on_disconnected_socket_fails() {
        let io = SocketIo::new(SocketIoConfig::default());
        let (handle, mut rx) = attach(&io, "X").await;
        assert!(io.handle_frame(&handle, "40").await);
        rx.recv().await.unwrap();

        let socket = io.namespace("/").await.unwrap().socket("X").await.unwrap();
        io.close_connection(&handle).await;

        assert!(matches!(
            socket.emit("chat", vec![]).await,
            Err(crate::error::SocketIoError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn close_signals_shutdown() {
        let io = SocketIo::new(SocketIoConfig::default());
        assert!(!io.is_closed());
        io.close();
        assert!(io.is_closed());
    }
}
