//! A [`Socket`] is the per-(connection, namespace) endpoint handed to user
//! code: it owns the listener table and delegates room membership to its
//! namespace and frame writes to the shared connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::connection::Connection;
use crate::error::{SocketIoError, SocketIoResult};
use crate::events::{BoxFuture, EventCallback, EventPayload};
use crate::namespace::Namespace;
use crate::operators::BroadcastOperator;
use crate::protocol::{AckTracker, EnginePacket, SocketPacket};

pub struct Socket {
    id: String,
    ns: Arc<Namespace>,
    conn: Arc<Connection>,
    listeners: RwLock<HashMap<String, Vec<EventCallback>>>,
    acks: Arc<AckTracker>,
    ack_timeout: Duration,
}

impl Socket {
    pub(crate) fn new(
        id: String,
        ns: Arc<Namespace>,
        conn: Arc<Connection>,
        acks: Arc<AckTracker>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            id,
            ns,
            conn,
            listeners: RwLock::new(HashMap::new()),
            acks,
            ack_timeout,
        }
    }

    /// Session id, shared across every namespace of the same transport.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path of the namespace this socket belongs to.
    pub fn nsp(&self) -> &str {
        self.ns.path()
    }

    /// Register a listener for `event`. Listeners run in registration order.
    pub async fn on<F, Fut>(&self, event: &str, callback: F)
    where
        F: Fn(EventPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: EventCallback =
            Arc::new(move |payload| Box::pin(callback(payload)) as BoxFuture);
        let mut listeners = self.listeners.write().await;
        listeners.entry(event.to_string()).or_default().push(callback);
    }

    /// Emit an event on this socket's namespace.
    ///
    /// Fails with [`SocketIoError::Disconnected`] once the transport has been
    /// closed.
    pub async fn emit(&self, event: &str, args: Vec<JsonValue>) -> SocketIoResult<()> {
        let packet = SocketPacket::event(self.nsp(), event, args);
        self.conn.write_socket(&packet).await
    }

    /// Emit an event and wait for the client acknowledgement.
    ///
    /// Returns the ack arguments, or [`SocketIoError::AckTimeout`] when the
    /// client does not answer within the configured window.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<JsonValue>,
    ) -> SocketIoResult<Vec<JsonValue>> {
        let id = self.acks.next_ack_id();
        let rx = self.acks.register(id).await;
        let packet = SocketPacket::event_with_ack(self.nsp(), event, args, id);
        if let Err(err) = self.conn.write_socket(&packet).await {
            self.acks.forget(id).await;
            return Err(err);
        }
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Either the window elapsed or the sweep dropped the sender.
            Ok(Err(_)) | Err(_) => {
                self.acks.forget(id).await;
                Err(SocketIoError::AckTimeout)
            }
        }
    }

    /// Write an Engine.IO PING. A failed write closes the transport and
    /// surfaces the underlying I/O error.
    pub async fn ping(&self) -> SocketIoResult<()> {
        self.conn.write_engine(&EnginePacket::ping()).await
    }

    /// Send DISCONNECT for this namespace and close the transport so the
    /// reader task unblocks and runs teardown.
    pub async fn disconnect(&self) -> SocketIoResult<()> {
        if self.conn.is_closed() {
            return Err(SocketIoError::Disconnected);
        }
        let packet = SocketPacket::disconnect(self.nsp());
        let _ = self.conn.write_socket(&packet).await;
        self.conn.close().await;
        Ok(())
    }

    /// Join a room of this socket's namespace. Idempotent.
    pub async fn join(&self, room: &str) {
        self.ns.join_room(&self.id, room).await;
    }

    /// Leave a room of this socket's namespace.
    pub async fn leave(&self, room: &str) {
        self.ns.leave_room(&self.id, room).await;
    }

    /// Snapshot of the rooms this socket currently belongs to.
    pub async fn rooms(&self) -> Vec<String> {
        self.ns.rooms_of(&self.id).await
    }

    /// Start a room-targeted broadcast: `socket.to("a").to("b").emit(..)`.
    pub fn to(&self, room: impl Into<String>) -> BroadcastOperator {
        Arc::clone(&self.ns).to(room)
    }

    /// Encode and write an ACK reply carrying `args` under `id`.
    pub(crate) async fn ack(&self, id: u64, args: Vec<JsonValue>) -> SocketIoResult<()> {
        let packet = SocketPacket::ack(self.nsp(), id, args);
        self.conn.write_socket(&packet).await
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub(crate) fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    /// Snapshot the listeners for `event` so dispatch never holds the table
    /// lock across user code.
    pub(crate) async fn listeners_for(&self, event: &str) -> Vec<EventCallback> {
        let listeners = self.listeners.read().await;
        listeners.get(event).cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("nsp", &self.nsp())
            .field("closed", &self.conn.is_closed())
            .finish()
    }
}
