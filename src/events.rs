//! Event dispatch: the inbound queue, the payload handed to listeners and
//! the acknowledgement callback.
//!
//! A single process-wide dispatcher task pops parsed EVENT frames and invokes
//! the listeners of the addressed socket sequentially, in registration order.
//! Listeners therefore serialize behind one another; handlers that need
//! parallelism spawn their own tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SocketIoResult;
use crate::socket::Socket;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub(crate) type EventCallback = Arc<dyn Fn(EventPayload) -> BoxFuture + Send + Sync>;
pub(crate) type ConnectCallback = Arc<dyn Fn(Arc<Socket>) -> BoxFuture + Send + Sync>;

/// Event names reserved for the core lifecycle. They are never dispatched
/// from the wire.
pub(crate) const RESERVED_EVENTS: [&str; 3] = ["connection", "disconnecting", "disconnect"];

/// The value passed to each event listener.
pub struct EventPayload {
    /// Session id shared by every namespace socket of the transport.
    pub sid: String,
    /// The event name.
    pub name: String,
    /// The socket the event arrived on.
    pub socket: Arc<Socket>,
    /// User arguments, i.e. the payload array minus the event name.
    pub data: Vec<JsonValue>,
    /// Present iff the inbound EVENT carried an ack id.
    pub ack: Option<AckSender>,
}

/// Callback for answering an EVENT that requested an acknowledgement.
#[derive(Clone)]
pub struct AckSender {
    socket: Arc<Socket>,
    id: u64,
}

impl AckSender {
    pub(crate) fn new(socket: Arc<Socket>, id: u64) -> Self {
        Self { socket, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send the ACK reply with the given arguments.
    pub async fn send(&self, args: Vec<JsonValue>) -> SocketIoResult<()> {
        self.socket.ack(self.id, args).await
    }
}

/// A parsed EVENT waiting on the dispatcher queue.
pub(crate) struct InboundEvent {
    pub socket: Arc<Socket>,
    pub data: JsonValue,
    pub ack_id: Option<u64>,
}

/// Dispatch one inbound EVENT to the listeners of its socket.
///
/// The payload must be a JSON array whose first element is the event name;
/// anything else is dropped, as are reserved lifecycle names arriving from
/// the wire.
pub(crate) async fn dispatch(event: InboundEvent) {
    let Some(body) = event.data.as_array() else {
        return;
    };
    let Some(name) = body.first().and_then(JsonValue::as_str) else {
        return;
    };
    if RESERVED_EVENTS.contains(&name) {
        tracing::warn!(
            sid = event.socket.id(),
            event = name,
            "dropping reserved event name from the wire"
        );
        return;
    }

    let args: Vec<JsonValue> = body[1..].to_vec();
    let listeners = event.socket.listeners_for(name).await;
    for listener in listeners {
        let payload = EventPayload {
            sid: event.socket.id().to_string(),
            name: name.to_string(),
            socket: Arc::clone(&event.socket),
            data: args.clone(),
            ack: event
                .ack_id
                .map(|id| AckSender::new(Arc::clone(&event.socket), id)),
        };
        listener(payload).await;
    }
}

/// Fire a lifecycle event (`disconnecting` / `disconnect`) on a socket's own
/// listeners, with no arguments and no ack.
pub(crate) async fn fire_lifecycle(socket: &Arc<Socket>, name: &str) {
    let listeners = socket.listeners_for(name).await;
    for listener in listeners {
        let payload = EventPayload {
            sid: socket.id().to_string(),
            name: name.to_string(),
            socket: Arc::clone(socket),
            data: Vec::new(),
            ack: None,
        };
        listener(payload).await;
    }
}

/// Spawn the process-wide dispatcher task. It drains the inbound queue until
/// the server shuts down or every sender is gone.
pub(crate) fn spawn_dispatcher(
    mut rx: mpsc::UnboundedReceiver<InboundEvent>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(event) => dispatch(event).await,
                    None => break,
                },
            }
        }
        tracing::debug!("event dispatcher stopped");
    });
}
