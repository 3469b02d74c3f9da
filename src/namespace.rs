//! Namespaces and the room membership index.
//!
//! A namespace owns its sockets table, the `room -> socket ids` map and the
//! reverse `socket id -> rooms` view. Room maps hold ids, never socket
//! references, so a torn-down socket cannot be resurrected through a stale
//! room entry. Invariant: a socket id present in any room of a namespace is
//! present in that namespace's sockets table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::events::{BoxFuture, ConnectCallback};
use crate::operators::BroadcastOperator;
use crate::protocol::SocketPacket;
use crate::socket::Socket;

pub struct Namespace {
    path: String,
    sockets: RwLock<HashMap<String, Arc<Socket>>>,
    // Lock order when both are taken: `rooms` before `socket_rooms`.
    rooms: RwLock<HashMap<String, HashSet<String>>>,
    socket_rooms: RwLock<HashMap<String, HashSet<String>>>,
    connect_listeners: RwLock<Vec<ConnectCallback>>,
}

impl Namespace {
    pub(crate) fn new(path: String) -> Arc<Self> {
        Arc::new(Self {
            path,
            sockets: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            socket_rooms: RwLock::new(HashMap::new()),
            connect_listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Register a `connection` listener, invoked for every socket that joins
    /// this namespace, in registration order.
    pub async fn on_connection<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: ConnectCallback =
            Arc::new(move |socket| Box::pin(callback(socket)) as BoxFuture);
        self.connect_listeners.write().await.push(callback);
    }

    /// Emit to every socket of the namespace, returning the delivered count.
    pub async fn emit(&self, event: &str, args: Vec<JsonValue>) -> usize {
        let frame = SocketPacket::event(&self.path, event, args).encode_frame();
        let sockets = self.sockets_snapshot().await;
        let mut delivered = 0;
        for socket in sockets {
            match socket.connection().write_frame(&frame).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(sid = socket.id(), nsp = %self.path, %err, "emit skipped");
                }
            }
        }
        delivered
    }

    /// Start a room-targeted broadcast on this namespace.
    pub fn to(self: Arc<Self>, room: impl Into<String>) -> BroadcastOperator {
        BroadcastOperator::new(self, room)
    }

    pub async fn socket(&self, sid: &str) -> Option<Arc<Socket>> {
        self.sockets.read().await.get(sid).cloned()
    }

    pub async fn sockets_snapshot(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().await.values().cloned().collect()
    }

    pub async fn socket_count(&self) -> usize {
        self.sockets.read().await.len()
    }

    /// Room names currently holding at least one socket.
    pub async fn rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub(crate) async fn insert_socket(&self, socket: Arc<Socket>) {
        let mut sockets = self.sockets.write().await;
        sockets.insert(socket.id().to_string(), socket);
    }

    pub(crate) async fn remove_socket(&self, sid: &str) -> Option<Arc<Socket>> {
        let mut sockets = self.sockets.write().await;
        sockets.remove(sid)
    }

    /// Add `sid` to `room`, in both directions. Idempotent; a socket that is
    /// not registered in this namespace is ignored.
    pub(crate) async fn join_room(&self, sid: &str, room: &str) {
        if !self.sockets.read().await.contains_key(sid) {
            tracing::debug!(sid, room, nsp = %self.path, "join ignored, socket not registered");
            return;
        }
        let mut rooms = self.rooms.write().await;
        let mut socket_rooms = self.socket_rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_default()
            .insert(sid.to_string());
        socket_rooms
            .entry(sid.to_string())
            .or_default()
            .insert(room.to_string());
        tracing::debug!(sid, room, nsp = %self.path, "joined room");
    }

    /// Remove `sid` from `room` in both directions, dropping empty keys.
    pub(crate) async fn leave_room(&self, sid: &str, room: &str) {
        let mut rooms = self.rooms.write().await;
        let mut socket_rooms = self.socket_rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(sid);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        if let Some(joined) = socket_rooms.get_mut(sid) {
            joined.remove(room);
            if joined.is_empty() {
                socket_rooms.remove(sid);
            }
        }
        tracing::debug!(sid, room, nsp = %self.path, "left room");
    }

    /// Remove `sid` from every room it belongs to, atomically under the
    /// namespace room locks.
    pub(crate) async fn leave_all_rooms(&self, sid: &str) {
        let mut rooms = self.rooms.write().await;
        let mut socket_rooms = self.socket_rooms.write().await;
        if let Some(joined) = socket_rooms.remove(sid) {
            for room in joined {
                if let Some(members) = rooms.get_mut(&room) {
                    members.remove(sid);
                    if members.is_empty() {
                        rooms.remove(&room);
                    }
                }
            }
        }
    }

    /// Snapshot of the sockets currently in `room`. Callers iterate without
    /// holding any namespace lock.
    pub async fn sockets_in_room(&self, room: &str) -> Vec<Arc<Socket>> {
        let sids: Vec<String> = {
            let rooms = self.rooms.read().await;
            match rooms.get(room) {
                Some(members) => members.iter().cloned().collect(),
                None => return Vec::new(),
            }
        };
        let sockets = self.sockets.read().await;
        sids.iter().filter_map(|sid| sockets.get(sid).cloned()).collect()
    }

    /// Snapshot of the rooms `sid` belongs to.
    pub(crate) async fn rooms_of(&self, sid: &str) -> Vec<String> {
        let socket_rooms = self.socket_rooms.read().await;
        socket_rooms
            .get(sid)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Invoke every `connection` listener for a freshly joined socket,
    /// sequentially, in registration order.
    pub(crate) async fn fire_connect(&self, socket: Arc<Socket>) {
        let listeners: Vec<ConnectCallback> = self.connect_listeners.read().await.clone();
        for listener in listeners {
            listener(Arc::clone(&socket)).await;
        }
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ChannelTransport, Connection};
    use crate::protocol::AckTracker;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_socket(
        ns: &Arc<Namespace>,
        sid: &str,
    ) -> (Arc<Socket>, mpsc::UnboundedReceiver<String>) {
        let (transport, rx) = ChannelTransport::pair();
        let conn = Arc::new(Connection::new(
            sid.to_string(),
            Box::new(transport),
            Duration::from_millis(25_000),
        ));
        let socket = Arc::new(Socket::new(
            sid.to_string(),
            Arc::clone(ns),
            conn,
            Arc::new(AckTracker::new()),
            Duration::from_secs(5),
        ));
        (socket, rx)
    }

    #[tokio::test]
    async fn join_is_idempotent_and_two_directional() {
        let ns = Namespace::new("/".to_string());
        let (socket, _rx) = test_socket(&ns, "s1");
        ns.insert_socket(Arc::clone(&socket)).await;

        ns.join_room("s1", "demo").await;
        ns.join_room("s1", "demo").await;

        assert_eq!(ns.sockets_in_room("demo").await.len(), 1);
        assert_eq!(ns.rooms_of("s1").await, vec!["demo".to_string()]);
    }

    #[tokio::test]
    async fn join_requires_a_registered_socket() {
        let ns = Namespace::new("/".to_string());
        ns.join_room("ghost", "demo").await;
        assert!(ns.sockets_in_room("demo").await.is_empty());
        assert!(ns.rooms().await.is_empty());
    }

    #[tokio::test]
    async fn leave_drops_empty_room_keys() {
        let ns = Namespace::new("/".to_string());
        let (socket, _rx) = test_socket(&ns, "s1");
        ns.insert_socket(socket).await;

        ns.join_room("s1", "demo").await;
        ns.leave_room("s1", "demo").await;

        assert!(ns.rooms().await.is_empty());
        assert!(ns.rooms_of("s1").await.is_empty());
    }

    #[tokio::test]
    async fn leave_all_rooms_clears_both_directions() {
        let ns = Namespace::new("/".to_string());
        let (s1, _rx1) = test_socket(&ns, "s1");
        let (s2, _rx2) = test_socket(&ns, "s2");
        ns.insert_socket(s1).await;
        ns.insert_socket(s2).await;

        ns.join_room("s1", "a").await;
        ns.join_room("s1", "b").await;
        ns.join_room("s2", "a").await;

        ns.leave_all_rooms("s1").await;

        assert!(ns.rooms_of("s1").await.is_empty());
        assert_eq!(ns.sockets_in_room("a").await.len(), 1);
        assert!(ns.sockets_in_room("b").await.is_empty());
        assert_eq!(ns.rooms().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn namespace_emit_reaches_every_socket() {
        let ns = Namespace::new("/".to_string());
        let (s1, mut rx1) = test_socket(&ns, "s1");
        let (s2, mut rx2) = test_socket(&ns, "s2");
        ns.insert_socket(s1).await;
        ns.insert_socket(s2).await;

        let delivered = ns.emit("news", vec![serde_json::json!("hi")]).await;
        assert_eq!(delivered, 2);
        assert_eq!(rx1.recv().await.unwrap(), "42[\"news\",\"hi\"]");
        assert_eq!(rx2.recv().await.unwrap(), "42[\"news\",\"hi\"]");
    }
}
