use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use client_core::{
    CredentialProvider, PushTransport, TransportError, WebSocketTransport,
};
use serde_json::{json, Value};
use shared::{
    domain::{ChannelId, MessageId},
    protocol::{PushCommand, PushEvent},
};
use tokio::net::TcpListener;

struct Token(&'static str);

impl CredentialProvider for Token {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.to_string())
    }
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if query.get("token").map(String::as_str) != Some("good-token") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(serve_socket)
}

/// Answers `join_channel` with one message for that channel and closes the
/// socket on `leave_channel`.
async fn serve_socket(mut socket: WebSocket) {
    while let Some(Ok(Message::Text(text))) = socket.recv().await {
        let frame: Value = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        match frame["type"].as_str() {
            Some("join_channel") => {
                let reply = json!({
                    "type": "new_message",
                    "payload": {
                        "id": 77,
                        "channel_id": frame["payload"]["channel_id"],
                        "content": "welcome",
                    }
                });
                if socket.send(Message::Text(reply.to_string())).await.is_err() {
                    return;
                }
            }
            Some("leave_channel") => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            _ => {}
        }
    }
}

async fn spawn_push_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/ws", get(handle_upgrade));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("ws://{addr}/ws")
}

#[tokio::test]
async fn joined_channel_receives_pushed_messages() {
    let url = spawn_push_server().await;
    let transport = WebSocketTransport::new(url, Arc::new(Token("good-token")));
    let mut inbound = transport.inbound();

    transport.connect().await.expect("connect");
    assert!(transport.is_connected());
    transport
        .send(PushCommand::JoinChannel {
            channel_id: ChannelId(3),
        })
        .await
        .expect("join frame");

    let event = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("push event in time")
        .expect("inbound open");
    match event {
        PushEvent::NewMessage(message) => {
            assert_eq!(message.id, MessageId(77));
            assert_eq!(message.channel_id, ChannelId(3));
            assert_eq!(message.content, "welcome");
        }
        other => panic!("unexpected event {other:?}"),
    }

    transport.disconnect().await;
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn server_close_flips_connectivity() {
    let url = spawn_push_server().await;
    let transport = WebSocketTransport::new(url, Arc::new(Token("good-token")));
    transport.connect().await.expect("connect");
    let mut connectivity = transport.connectivity();
    assert!(*connectivity.borrow_and_update());

    transport
        .send(PushCommand::LeaveChannel {
            channel_id: ChannelId(3),
        })
        .await
        .expect("leave frame");

    tokio::time::timeout(Duration::from_secs(5), connectivity.changed())
        .await
        .expect("connectivity change in time")
        .expect("sender alive");
    assert!(!*connectivity.borrow());
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn rejected_handshake_is_a_connect_error() {
    let url = spawn_push_server().await;
    let transport = WebSocketTransport::new(url, Arc::new(Token("stale-token")));

    let result = transport.connect().await;

    assert!(matches!(result, Err(TransportError::Connect(_))), "{result:?}");
    assert!(!transport.is_connected());
}
