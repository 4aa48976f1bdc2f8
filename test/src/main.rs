use std::sync::Arc;
use std::time::Duration;

use hearth_http::external::dotenv::dotenv;
use hearth_http::{
    handler_fn, Command, Connection, Opcode, Options, Reply, RequestUtils, ResponseUtil, Router,
    Server, WebSocketHandler, DEFAULT_PORT,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct EventFeed;

struct Subscriber {
    frames: u64,
}

impl WebSocketHandler for EventFeed {
    fn on_init(&self, conn: &mut Connection) -> Result<(), u16> {
        tracing::info!(peer = ?conn.remote_addr(), "event feed subscriber joined");
        conn.set_opaque(Subscriber { frames: 0 });

        let sender = conn.websocket_sender();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(Duration::from_secs(5));
            let mut beat = 0u64;
            loop {
                ticks.tick().await;
                beat += 1;
                let event = serde_json::json!({ "heartbeat": beat });
                if sender.send_text(event.to_string()).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn on_frame(&self, conn: &mut Connection, opcode: Opcode, payload: &[u8]) {
        match opcode {
            Opcode::Close => {
                conn.websocket_send(Opcode::Close, payload);
                conn.shutdown();
            }
            Opcode::Text | Opcode::Binary => {
                let frames = conn.opaque_mut::<Subscriber>().map_or(0, |s| {
                    s.frames += 1;
                    s.frames
                });
                let reply = serde_json::json!({
                    "frame": frames,
                    "echo": String::from_utf8_lossy(payload),
                });
                conn.websocket_send(Opcode::Text, reply.to_string().as_bytes());
            }
            _ => {}
        }
    }

    fn on_close(&self, conn: &mut Connection) {
        let frames = conn.take_opaque::<Subscriber>().map_or(0, |s| s.frames);
        tracing::info!(frames, "event feed subscriber left");
    }
}

fn router() -> Arc<Router> {
    Router::builder()
        .add_route(
            "/api/info",
            true,
            handler_fn(|conn, _, _| {
                let body = serde_json::json!({
                    "server": hearth_http::http_server_port(),
                    "host": conn.local_host(),
                    "args": conn.args_to_json(),
                });
                conn.send_reply(
                    0,
                    Some("application/json"),
                    None,
                    None,
                    0,
                    body.to_string().as_bytes(),
                );
                Ok(Reply::Done)
            }),
        )
        .add_route(
            "/api/volume",
            false,
            handler_fn(|conn, remainder, cmd| match cmd {
                Command::Post => {
                    let json = conn.get_json()?;
                    match json.get("level").and_then(|v| v.as_u64()) {
                        Some(level) if level <= 100 => Ok(Reply::OK),
                        _ => {
                            conn.error(400, Some("level must be 0..=100"));
                            Ok(Reply::Done)
                        }
                    }
                }
                _ if remainder.is_some() => Ok(Reply::Status(404)),
                _ => Ok(Reply::OK),
            }),
        )
        .add_route(
            "/",
            true,
            handler_fn(|conn, _, _| {
                conn.redirect("/api/info");
                Ok(Reply::Done)
            }),
        )
        .add_websocket_route("/ws/events", EventFeed)
        .build()
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hearth_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port = std::env::var("HTTP_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    let address = format!("0.0.0.0:{}", port);

    let server = match Server::with_options(&address, router(), Options::new()).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind {}", address);
            return;
        }
    };

    println!("start server on: {}", address);
    server.run().await;
}
