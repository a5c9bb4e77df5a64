//! Mock hub speaking the WebSocket API on an ephemeral localhost port.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub const TOKEN: &str = "integration-token";

/// Something the test asks the hub to do on the current session.
#[derive(Debug)]
pub enum HubAction {
    Send(Value),
    Close,
}

/// Accepts sessions one at a time and answers the command catalogue.
#[derive(Debug)]
pub struct MockHub {
    pub port: u16,
    commands: Arc<Mutex<Vec<Value>>>,
    sessions: Arc<AtomicUsize>,
    actions: mpsc::UnboundedSender<HubAction>,
}

impl MockHub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));
        let (actions, actions_rx) = mpsc::unbounded_channel();

        let accept_commands = Arc::clone(&commands);
        let accept_sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            let mut actions_rx = actions_rx;
            while let Ok((stream, _)) = listener.accept().await {
                accept_sessions.fetch_add(1, Ordering::SeqCst);
                serve(stream, &accept_commands, &mut actions_rx).await;
            }
        });

        Self {
            port,
            commands,
            sessions,
            actions,
        }
    }

    pub fn commands(&self) -> Vec<Value> {
        self.commands.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn push_event(&self, event_type: &str, data: Value) {
        let event = json!({
            "type": "event",
            "id": 1,
            "event": {
                "event_type": event_type,
                "origin": "LOCAL",
                "time_fired": "2024-03-01T10:00:00+00:00",
                "data": data
            }
        });
        self.actions.send(HubAction::Send(event)).unwrap();
    }

    pub fn send_raw(&self, value: Value) {
        self.actions.send(HubAction::Send(value)).unwrap();
    }

    /// Close the current session from the hub side.
    pub fn close_session(&self) {
        self.actions.send(HubAction::Close).unwrap();
    }
}

fn states() -> Value {
    json!([
        {"entity_id": "light.porch", "state": "off", "attributes": {},
         "last_changed": "2024-03-01T10:00:00+00:00", "last_updated": "2024-03-01T10:00:00+00:00"},
        {"entity_id": "sensor.power", "state": "1250", "attributes": {"unit_of_measurement": "W"},
         "last_changed": "2024-03-01T10:00:00+00:00", "last_updated": "2024-03-01T10:00:00+00:00"},
        {"entity_id": "sensor.humidity", "state": "48.2", "attributes": {},
         "last_changed": "2024-03-01T10:00:00+00:00", "last_updated": "2024-03-01T10:00:00+00:00"}
    ])
}

fn reply_to(msg: &Value) -> Value {
    let id = msg["id"].clone();
    match msg["type"].as_str().unwrap_or_default() {
        "ping" => json!({"id": id, "type": "pong"}),
        "get_states" => json!({"id": id, "type": "result", "success": true, "result": states()}),
        "get_config" => json!({"id": id, "type": "result", "success": true, "result": {
            "location_name": "Test Home", "version": "2024.3.0", "state": "RUNNING"
        }}),
        "call_service" if msg["domain"] == "missing" => json!({
            "id": id, "type": "result", "success": false,
            "error": {"code": "not_found", "message": "Service not found."}
        }),
        _ => json!({"id": id, "type": "result", "success": true, "result": null}),
    }
}

async fn serve(
    stream: TcpStream,
    commands: &Mutex<Vec<Value>>,
    actions: &mut mpsc::UnboundedReceiver<HubAction>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut tx, mut rx) = ws.split();

    let hello = json!({"type": "auth_required", "ha_version": "2024.3.0"});
    if tx.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }
    let auth: Value = match rx.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap_or(Value::Null),
        _ => return,
    };
    if auth["access_token"] != TOKEN {
        let invalid = json!({"type": "auth_invalid", "message": "Invalid access token"});
        let _ = tx.send(Message::Text(invalid.to_string())).await;
        let _ = tx.close().await;
        return;
    }
    let ok = json!({"type": "auth_ok", "ha_version": "2024.3.0"});
    if tx.send(Message::Text(ok.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let msg: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                    commands.lock().unwrap().push(msg.clone());
                    if tx.send(Message::Text(reply_to(&msg).to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            action = actions.recv() => match action {
                Some(HubAction::Send(value)) => {
                    if tx.send(Message::Text(value.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(HubAction::Close) => {
                    let frame = CloseFrame { code: CloseCode::Away, reason: "restarting".into() };
                    let _ = tx.send(Message::Close(Some(frame))).await;
                    // Wait for the client's acknowledgment.
                    while let Some(Ok(msg)) = rx.next().await {
                        if msg.is_close() {
                            break;
                        }
                    }
                    break;
                }
                None => break,
            },
        }
    }

    let _ = tx.close().await;
}
