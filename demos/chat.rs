//! Chat demo: token authentication, rooms and acknowledgements.
//!
//! Run with `cargo run --example chat`, then point a Socket.IO v4 client at
//! `ws://localhost:3300/socket.io/` with `auth: { token: "123" }`.

use actix_web::{App, HttpServer};
use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use socketio_native::{transport, SocketIo, SocketIoConfig};

async fn socket_io_handle(io: &SocketIo) {
    io.on_authentication(|params| params.get("token").map(String::as_str) == Some("123"));

    let io_handle = io.clone();
    io.on_connection(move |socket| {
        let io = io_handle.clone();
        async move {
            info!(sid = socket.id(), nsp = socket.nsp(), "connect");
            socket.join("demo").await;
            io.to("demo")
                .await
                .emit(
                    "test",
                    vec![
                        json!(format!("{} join us room...", socket.id())),
                        json!("server message"),
                    ],
                )
                .await;

            socket
                .on("test", |event| async move {
                    let _ = event.socket.emit("test", event.data).await;
                })
                .await;

            socket
                .on("join-room", |event| async move {
                    if let Some(room) = event.data.first().and_then(|v| v.as_str()) {
                        event.socket.join(room).await;
                    }
                })
                .await;

            socket
                .on("to-room", |event| async move {
                    event
                        .socket
                        .to("demo")
                        .to("demo2")
                        .emit("test", vec![json!("hello")])
                        .await;
                })
                .await;

            socket
                .on("leave-room", |event| async move {
                    event.socket.leave("demo").await;
                    event.socket.join("demo2").await;
                })
                .await;

            socket
                .on("my-room", |event| async move {
                    let rooms = event.socket.rooms().await;
                    let _ = event.socket.emit("my-room", vec![json!(rooms)]).await;
                })
                .await;

            socket
                .on("chat message", |event| async move {
                    if let Some(first) = event.data.first() {
                        let _ = event.socket.emit("chat message", vec![first.clone()]).await;
                    }
                    if let Some(ack) = &event.ack {
                        let _ = ack
                            .send(vec![
                                json!("hello from namespace root"),
                                json!({ "Test": "ok" }),
                            ])
                            .await;
                    }
                })
                .await;

            socket
                .on("disconnecting", |event| async move {
                    info!(sid = event.socket.id(), "disconnecting");
                })
                .await;

            socket
                .on("disconnect", |event| async move {
                    info!(sid = event.socket.id(), "disconnect");
                })
                .await;
        }
    })
    .await;

    io.of("/test")
        .await
        .on_connection(|socket| async move {
            info!(sid = socket.id(), nsp = socket.nsp(), "connect");

            socket
                .on("chat message", |event| async move {
                    if let Some(first) = event.data.first() {
                        let _ = event.socket.emit("chat message", vec![first.clone()]).await;
                    }
                    if let Some(ack) = &event.ack {
                        let _ = ack
                            .send(vec![json!("hello from nps test"), json!({ "Test": "ok" })])
                            .await;
                    }
                })
                .await;
        })
        .await;
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let io = SocketIo::new(SocketIoConfig::default());
    socket_io_handle(&io).await;

    info!("Server listening on port 3300");
    HttpServer::new(move || App::new().configure(transport::configure_routes(io.clone())))
        .bind(("0.0.0.0", 3300))?
        .run()
        .await?;
    Ok(())
}
