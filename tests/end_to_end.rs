//! Drives a real relay server over TCP with the WebSocket client session and
//! with raw `tokio-tungstenite` connections for frame-level cases.

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use duplex_relay::client::{CollectingSink, Endpoint, SessionState, StreamingSession};
use duplex_relay::config::{AppConfig, SessionConfig};
use duplex_relay::protocol::frame::LogicalMessage;
use duplex_relay::server::DispatchMode;
use duplex_relay::state::AppState;
use duplex_relay::{configure_routes, STREAM_PATH};

type RawSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct Relay {
    addr: SocketAddr,
    handle: ServerHandle,
    state: AppState,
}

impl Relay {
    async fn start(config: AppConfig) -> Self {
        let state = AppState::new(config);
        let app_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(app_state.clone()))
                .configure(configure_routes)
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        Relay {
            addr,
            handle,
            state,
        }
    }

    fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn raw_client(&self) -> RawSocket {
        let url = format!("{}{}", self.base_url(), STREAM_PATH);
        let (socket, _) = connect_async(url.as_str()).await.unwrap();
        socket
    }

    async fn wait_for_connections(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.state.registry.len() < count {
            assert!(Instant::now() < deadline, "connections never registered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) {
        self.handle.stop(false).await;
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        pump_join_timeout_ms: 2_000,
        drain_attempts: 3,
        drain_attempt_timeout_ms: 200,
        chunk_size: 1024,
        chunk_cadence_ms: 10,
        start_settle_ms: 0,
    }
}

/// Next data message, skipping pings and pongs. `None` once the stream closes.
async fn next_data(socket: &mut RawSocket) -> Option<Message> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next()).await {
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(Some(Ok(message))) => return Some(message),
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => panic!("timed out waiting for a message"),
        }
    }
}

#[actix_web::test]
async fn test_session_chunks_are_echoed_in_order() {
    let relay = Relay::start(AppConfig::default()).await;
    let sink = CollectingSink::new();
    let config = session_config();
    let drain_window = Duration::from_millis(
        config.pump_join_timeout_ms + config.drain_attempt_timeout_ms * config.drain_attempts as u64,
    );
    let mut session = StreamingSession::websocket(config, sink.clone());

    session
        .start(Endpoint::new(relay.base_url(), STREAM_PATH), &[])
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Active);

    session
        .stream_chunks(["a", "b", "c"], Duration::from_millis(10))
        .await
        .unwrap();

    let ended = Instant::now();
    session.end().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(ended.elapsed() < drain_window + Duration::from_millis(500));

    assert_eq!(
        sink.responses(),
        vec![
            LogicalMessage::from("a"),
            LogicalMessage::from("b"),
            LogicalMessage::from("c")
        ]
    );
    relay.stop().await;
}

#[actix_web::test]
async fn test_session_passes_query_parameters() {
    let relay = Relay::start(AppConfig::default()).await;
    let sink = CollectingSink::new();
    let mut session = StreamingSession::websocket(session_config(), sink.clone());

    let params = vec![
        ("model".to_string(), "nova-3".to_string()),
        ("language".to_string(), "en".to_string()),
    ];
    session
        .start(Endpoint::new(relay.base_url(), STREAM_PATH), &params)
        .await
        .unwrap();
    session.send(vec![0u8, 1, 2, 255]).await.unwrap();
    session.end().await;

    assert_eq!(sink.responses(), vec![LogicalMessage::from(vec![0u8, 1, 2, 255])]);
    relay.stop().await;
}

#[actix_web::test]
async fn test_fragmented_text_is_reassembled() {
    let relay = Relay::start(AppConfig::default()).await;
    let mut socket = relay.raw_client().await;

    // "é" is split across the fragment boundary.
    let text = "héllo".as_bytes().to_vec();
    let (first, rest) = text.split_at(2);
    socket
        .send(Message::Frame(Frame::message(
            first.to_vec(),
            OpCode::Data(Data::Text),
            false,
        )))
        .await
        .unwrap();
    socket
        .send(Message::Frame(Frame::message(
            rest.to_vec(),
            OpCode::Data(Data::Continue),
            true,
        )))
        .await
        .unwrap();

    assert_eq!(next_data(&mut socket).await, Some(Message::Text("héllo".to_string())));

    socket.send(Message::Close(None)).await.unwrap();
    relay.stop().await;
}

#[actix_web::test]
async fn test_close_is_acknowledged_with_peer_code() {
    let relay = Relay::start(AppConfig::default()).await;
    let mut socket = relay.raw_client().await;
    relay.wait_for_connections(1).await;

    socket.send(Message::Text("before close".to_string())).await.unwrap();
    socket
        .send(Message::Close(Some(
            tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: CloseCode::Away,
                reason: "done".into(),
            },
        )))
        .await
        .unwrap();

    assert_eq!(
        next_data(&mut socket).await,
        Some(Message::Text("before close".to_string()))
    );
    match next_data(&mut socket).await {
        Some(Message::Close(Some(frame))) => {
            assert_eq!(frame.code, CloseCode::Away);
            assert_eq!(frame.reason, "done");
        }
        other => panic!("expected close acknowledgment, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(relay.state.registry.is_empty());
    relay.stop().await;
}

#[actix_web::test]
async fn test_mixed_fragments_end_the_connection() {
    let relay = Relay::start(AppConfig::default()).await;
    let mut socket = relay.raw_client().await;

    socket
        .send(Message::Frame(Frame::message(
            b"part".to_vec(),
            OpCode::Data(Data::Text),
            false,
        )))
        .await
        .unwrap();
    socket
        .send(Message::Binary(b"interleaved".to_vec()))
        .await
        .unwrap();

    // Nothing is echoed; the relay closes the connection.
    loop {
        match next_data(&mut socket).await {
            None | Some(Message::Close(_)) => break,
            Some(other) => panic!("unexpected message {:?}", other),
        }
    }
    relay.stop().await;
}

#[actix_web::test]
async fn test_broadcast_mode_fans_out_text() {
    let mut config = AppConfig::default();
    config.server.dispatch = DispatchMode::Broadcast;
    let relay = Relay::start(config).await;

    let mut sender = relay.raw_client().await;
    let mut listener = relay.raw_client().await;
    relay.wait_for_connections(2).await;

    sender.send(Message::Text("to everyone".to_string())).await.unwrap();

    assert_eq!(
        next_data(&mut sender).await,
        Some(Message::Text("to everyone".to_string()))
    );
    assert_eq!(
        next_data(&mut listener).await,
        Some(Message::Text("to everyone".to_string()))
    );
    relay.stop().await;
}

#[actix_web::test]
async fn test_silent_connection_is_dropped_after_client_timeout() {
    let mut config = AppConfig::default();
    config.server.heartbeat_interval_secs = 1;
    config.server.client_timeout_secs = 2;
    let relay = Relay::start(config).await;

    let mut socket = relay.raw_client().await;
    relay.wait_for_connections(1).await;

    // Not reading means pings go unanswered.
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    match next_data(&mut socket).await {
        Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected heartbeat close, got {:?}", other),
    }
    assert!(relay.state.registry.is_empty());
    relay.stop().await;
}
