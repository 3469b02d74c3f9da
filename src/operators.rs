//! Room-targeted broadcast builder.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::namespace::Namespace;
use crate::protocol::SocketPacket;
use crate::socket::Socket;

/// Accumulates room names and fans an emit out to the union of their
/// members: `ns.to("a").to("b").emit("event", args)`.
///
/// A socket addressed through several of the accumulated rooms receives the
/// event exactly once per `emit` call.
pub struct BroadcastOperator {
    ns: Arc<Namespace>,
    rooms: Vec<String>,
}

impl BroadcastOperator {
    pub(crate) fn new(ns: Arc<Namespace>, room: impl Into<String>) -> Self {
        Self {
            ns,
            rooms: vec![room.into()],
        }
    }

    /// Add another room to the target set.
    pub fn to(mut self, room: impl Into<String>) -> Self {
        let room = room.into();
        if !self.rooms.contains(&room) {
            self.rooms.push(room);
        }
        self
    }

    /// The sockets currently addressed by the accumulated rooms, deduplicated
    /// by socket id, in room-accumulation order.
    pub async fn sockets(&self) -> Vec<Arc<Socket>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut targets = Vec::new();
        for room in &self.rooms {
            for socket in self.ns.sockets_in_room(room).await {
                if seen.insert(socket.id().to_string()) {
                    targets.push(socket);
                }
            }
        }
        targets
    }

    /// Emit to every addressed socket, returning the delivered count.
    /// Per-socket write failures are logged and skipped; the fan-out is not
    /// atomic with respect to concurrent joins and leaves.
    pub async fn emit(&self, event: &str, args: Vec<JsonValue>) -> usize {
        let frame = SocketPacket::event(self.ns.path(), event, args).encode_frame();
        let mut delivered = 0;
        for socket in self.sockets().await {
            match socket.connection().write_frame(&frame).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(sid = socket.id(), room_emit = event, %err, "emit skipped");
                }
            }
        }
        delivered
    }
}
