//! actix-web / actix-ws integration: the upgrade entry point and the
//! per-connection read loop.
//!
//! The HTTP layer owns the transport lifecycle; this module only adapts an
//! upgraded WebSocket session to the [`Transport`] trait and pumps its frames
//! into the lifecycle state machine.

use std::io;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use async_trait::async_trait;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::connection::{Connection, Transport};
use crate::server::SocketIo;

/// An upgraded actix-ws session behind the [`Transport`] trait.
pub struct WsTransport {
    session: actix_ws::Session,
}

impl WsTransport {
    pub fn new(session: actix_ws::Session) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, frame: &str) -> io::Result<()> {
        self.session
            .text(frame.to_string())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "websocket closed"))
    }

    async fn send_pong(&mut self, payload: &[u8]) -> io::Result<()> {
        self.session
            .pong(payload)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "websocket closed"))
    }

    async fn close(&mut self) {
        let _ = self.session.clone().close(None).await;
    }
}

/// WebSocket upgrade handler for the `/socket.io/` route.
///
/// Long-polling sessions are not supported: a request resuming an existing
/// Engine.IO session (non-empty `sid` query parameter) is answered without
/// driving the state machine.
pub async fn websocket_handler(
    req: HttpRequest,
    stream: web::Payload,
    io: web::Data<SocketIo>,
) -> actix_web::Result<HttpResponse> {
    if query_param(req.query_string(), "sid").is_some_and(|sid| !sid.is_empty()) {
        return Ok(HttpResponse::Ok().finish());
    }

    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;
    let io = io.get_ref().clone();
    actix_web::rt::spawn(run_connection(io, session, msg_stream));
    Ok(response)
}

/// One reader task per transport: register, then feed frames to the state
/// machine until the stream ends, and tear down.
async fn run_connection(io: SocketIo, session: actix_ws::Session, mut stream: actix_ws::MessageStream) {
    let sid = Uuid::new_v4().to_string();
    let conn = Arc::new(Connection::new(
        sid,
        Box::new(WsTransport::new(session)),
        io.config().ping_interval,
    ));
    let handle = match io.register_connection(conn).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::debug!(%err, "handshake failed");
            return;
        }
    };

    while let Some(Ok(message)) = stream.next().await {
        match message {
            actix_ws::Message::Text(text) => {
                if !io.handle_frame(&handle, &text).await {
                    break;
                }
            }
            actix_ws::Message::Ping(payload) => {
                handle.connection().pong(&payload).await;
            }
            actix_ws::Message::Close(reason) => {
                tracing::debug!(sid = handle.sid(), ?reason, "peer closed");
                break;
            }
            // Binary-attachment packets are unsupported.
            _ => {}
        }
    }

    io.close_connection(&handle).await;
}

/// Mount the Socket.IO routes on an actix application:
/// `App::new().configure(configure_routes(io))`.
pub fn configure_routes(io: SocketIo) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(web::Data::new(io))
            .route("/socket.io/", web::get().to(websocket_handler))
            .route("/socket.io", web::get().to(websocket_handler));
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_lookup() {
        assert_eq!(query_param("EIO=4&transport=websocket", "EIO"), Some("4"));
        assert_eq!(query_param("EIO=4&sid=abc", "sid"), Some("abc"));
        assert_eq!(query_param("EIO=4&sid=", "sid"), Some(""));
        assert_eq!(query_param("EIO=4", "sid"), None);
        assert_eq!(query_param("", "sid"), None);
    }
}
