//! WebSocket upgrade, masking and ping/pong against a real client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hearth_http::{handler_fn, Connection, Opcode, Reply, Router, Server, WebSocketHandler};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Default)]
struct Stats {
    inits: AtomicUsize,
    frames: AtomicUsize,
    closes: AtomicUsize,
}

struct Echo(Arc<Stats>);

struct Session {
    seen: usize,
}

impl WebSocketHandler for Echo {
    fn on_init(&self, conn: &mut Connection) -> Result<(), u16> {
        self.0.inits.fetch_add(1, Ordering::SeqCst);
        conn.set_opaque(Session { seen: 0 });
        Ok(())
    }

    fn on_frame(&self, conn: &mut Connection, opcode: Opcode, payload: &[u8]) {
        self.0.frames.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = conn.opaque_mut::<Session>() {
            session.seen += 1;
        }
        match opcode {
            Opcode::Close => {
                conn.websocket_send(Opcode::Close, payload);
                conn.shutdown();
            }
            other => conn.websocket_send(other, payload),
        }
    }

    fn on_close(&self, conn: &mut Connection) {
        assert!(conn.take_opaque::<Session>().is_some());
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Refuse;

impl WebSocketHandler for Refuse {
    fn on_init(&self, _conn: &mut Connection) -> Result<(), u16> {
        Err(401)
    }

    fn on_frame(&self, _conn: &mut Connection, _opcode: Opcode, _payload: &[u8]) {}
}

/// Pushes a few ticks on its own schedule, then closes.
struct Ticker(Arc<Stats>);

impl WebSocketHandler for Ticker {
    fn on_init(&self, conn: &mut Connection) -> Result<(), u16> {
        let sender = conn.websocket_sender();
        tokio::spawn(async move {
            for n in 1..=3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if sender.send_text(format!("tick {n}")).is_err() {
                    return;
                }
            }
            let _ = sender.send(Opcode::Close, b"".to_vec());
        });
        Ok(())
    }

    fn on_frame(&self, _conn: &mut Connection, _opcode: Opcode, _payload: &[u8]) {
        self.0.frames.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, _conn: &mut Connection) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}

async fn start(stats: Arc<Stats>) -> u16 {
    let router = Router::builder()
        .add_websocket_route("/ws/echo", Echo(Arc::clone(&stats)))
        .add_websocket_route("/ws/ticks", Ticker(stats))
        .add_websocket_route("/ws/locked", Refuse)
        .add_route("/plain", true, handler_fn(|_, _, _| Ok(Reply::OK)))
        .build();
    let server = Server::new("127.0.0.1:0", router).await.unwrap();
    let port = server.port().unwrap();
    tokio::spawn(server.run());
    port
}

#[tokio::test]
async fn echo_ping_and_close() {
    let stats = Arc::new(Stats::default());
    let port = start(Arc::clone(&stats)).await;

    let (mut ws, response) = connect_async(format!("ws://127.0.0.1:{port}/ws/echo"))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 101);
    assert_eq!(stats.inits.load(Ordering::SeqCst), 1);

    ws.send(Message::Text("hello".into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.to_text().unwrap(), "hello");

    let big = vec![0x5au8; 70_000];
    ws.send(Message::Binary(big.clone().into())).await.unwrap();
    match ws.next().await.unwrap().unwrap() {
        Message::Binary(data) => assert_eq!(&data[..], &big[..]),
        other => panic!("unexpected {other:?}"),
    }

    ws.send(Message::Ping(b"hi".to_vec().into())).await.unwrap();
    match ws.next().await.unwrap().unwrap() {
        Message::Pong(data) => assert_eq!(&data[..], b"hi"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(stats.frames.load(Ordering::SeqCst), 2);

    ws.close(None).await.unwrap();
    while let Some(Ok(_)) = ws.next().await {}

    for _ in 0..100 {
        if stats.closes.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refused_init_and_plain_routes_do_not_upgrade() {
    let stats = Arc::new(Stats::default());
    let port = start(Arc::clone(&stats)).await;

    let err = connect_async(format!("ws://127.0.0.1:{port}/ws/locked"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("401"), "{err}");

    let err = connect_async(format!("ws://127.0.0.1:{port}/plain"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("405"), "{err}");

    assert_eq!(stats.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn server_pushes_frames_without_being_asked() {
    let stats = Arc::new(Stats::default());
    let port = start(Arc::clone(&stats)).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/ticks"))
        .await
        .unwrap();

    for n in 1..=3 {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("tick arrives")
            .unwrap()
            .unwrap();
        assert_eq!(msg.to_text().unwrap(), format!("tick {n}"));
    }
    match ws.next().await {
        Some(Ok(Message::Close(_))) => {}
        other => panic!("expected close, got {other:?}"),
    }
    assert_eq!(stats.frames.load(Ordering::SeqCst), 0);

    for _ in 0..100 {
        if stats.closes.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
}
