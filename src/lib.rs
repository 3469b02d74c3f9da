//! Socket.IO v4 server core over WebSocket.
//!
//! Layers named events, virtual namespaces, rooms and request/ack semantics
//! (Socket.IO) over single-digit framed text packets (Engine.IO), multiplexed
//! on one long-lived WebSocket per client.
//!
//! ```no_run
//! use socketio_native::{SocketIo, SocketIoConfig, transport};
//! use actix_web::{App, HttpServer};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let io = SocketIo::new(SocketIoConfig::default());
//!     io.on_connection(|socket| async move {
//!         socket
//!             .on("chat message", |event| async move {
//!                 let _ = event.socket.emit("chat message", event.data).await;
//!             })
//!             .await;
//!     })
//!     .await;
//!
//!     HttpServer::new(move || App::new().configure(transport::configure_routes(io.clone())))
//!         .bind(("0.0.0.0", 3300))?
//!         .run()
//!         .await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod namespace;
pub mod operators;
pub mod protocol;
pub mod server;
pub mod socket;
pub mod transport;

pub use config::SocketIoConfig;
pub use connection::{ChannelTransport, Connection, Transport};
pub use error::{SocketIoError, SocketIoResult};
pub use events::{AckSender, EventPayload};
pub use namespace::Namespace;
pub use operators::BroadcastOperator;
pub use server::{ConnectionHandle, SocketIo};
pub use socket::Socket;
pub use transport::{configure_routes, websocket_handler};
