//! Scriptable hub for driving the engine over an in-memory socket.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::HassError;
use crate::ws::memory::HubSide;
use crate::ws::WsMessage;

pub(crate) const TOKEN: &str = "good-token";

/// Snapshot list returned for `get_states`.
pub(crate) fn sample_states() -> Value {
    json!([
        {
            "entity_id": "light.kitchen",
            "state": "on",
            "attributes": {"brightness": 180},
            "last_changed": "2024-03-01T10:00:00+00:00",
            "last_updated": "2024-03-01T10:00:00+00:00"
        },
        {
            "entity_id": "sensor.temperature",
            "state": "21.5",
            "attributes": {"unit_of_measurement": "°C"},
            "last_changed": "2024-03-01T10:00:00+00:00",
            "last_updated": "2024-03-01T10:00:00+00:00"
        },
        {
            "entity_id": "sensor.people_home",
            "state": "3",
            "attributes": {},
            "last_changed": "2024-03-01T10:00:00+00:00",
            "last_updated": "2024-03-01T10:00:00+00:00"
        },
        {
            "entity_id": "switch.garage",
            "state": "unavailable",
            "attributes": {},
            "last_changed": "2024-03-01T10:00:00+00:00",
            "last_updated": "2024-03-01T10:00:00+00:00"
        }
    ])
}

pub(crate) fn event_json(event_type: &str, data: Value) -> Value {
    json!({
        "type": "event",
        "id": 1,
        "event": {
            "event_type": event_type,
            "origin": "LOCAL",
            "time_fired": "2024-03-01T10:00:00+00:00",
            "data": data
        }
    })
}

/// Run the hub side of the auth handshake, accepting any token.
pub(crate) async fn accept_auth(hub: &mut HubSide) -> Value {
    hub.send_json(&json!({"type": "auth_required", "ha_version": "2024.3.0"}));
    let auth = hub.next_json().await.unwrap_or(Value::Null);
    hub.send_json(&json!({"type": "auth_ok", "ha_version": "2024.3.0"}));
    auth
}

/// Behaviour knobs for [`FakeHub`].
#[derive(Debug, Clone, Default)]
pub(crate) struct HubScript {
    /// Number of `get_config` replies reporting a hub that is still starting.
    pub(crate) not_running_polls: usize,
    /// Reply to `subscribe_events` with `success: false`.
    pub(crate) reject_subscribe: bool,
}

/// A hub task answering the command catalogue over one in-memory socket.
#[derive(Debug)]
pub(crate) struct FakeHub {
    to_client: mpsc::UnboundedSender<Result<WsMessage, HassError>>,
    received: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl FakeHub {
    pub(crate) fn spawn(hub: HubSide, script: HubScript) -> Self {
        let to_client = hub.to_client.clone();
        let received = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(hub, script, Arc::clone(&received)));
        Self {
            to_client,
            received,
            task,
        }
    }

    /// Every id-bearing message the client sent, in order.
    pub(crate) fn commands(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub(crate) fn command_types(&self) -> Vec<String> {
        self.commands()
            .iter()
            .filter_map(|c| c["type"].as_str().map(str::to_string))
            .collect()
    }

    pub(crate) fn push_event(&self, event_type: &str, data: Value) {
        let text = event_json(event_type, data).to_string();
        let _ = self.to_client.send(Ok(WsMessage::Text(text)));
    }

    /// Simulate the hub closing the socket.
    pub(crate) fn close(&self, code: u16) {
        let _ = self.to_client.send(Ok(WsMessage::Close {
            code,
            reason: "hub shutdown".into(),
        }));
    }

    /// Simulate an abrupt socket failure.
    pub(crate) fn fail(&self) {
        let _ = self
            .to_client
            .send(Err(HassError::Transport("connection reset".into())));
    }

    pub(crate) async fn finished(self) {
        let _ = self.task.await;
    }
}

async fn serve(mut hub: HubSide, script: HubScript, received: Arc<Mutex<Vec<Value>>>) {
    hub.send_json(&json!({"type": "auth_required", "ha_version": "2024.3.0"}));
    let Some(auth) = hub.next_json().await else {
        return;
    };
    if auth["access_token"] != TOKEN {
        hub.send_json(&json!({"type": "auth_invalid", "message": "Invalid access token"}));
        return;
    }
    hub.send_json(&json!({"type": "auth_ok", "ha_version": "2024.3.0"}));

    let mut config_polls = 0;
    while let Some(msg) = hub.next_json().await {
        received.lock().unwrap().push(msg.clone());
        let id = msg["id"].clone();
        let reply = match msg["type"].as_str().unwrap_or_default() {
            "ping" => json!({"id": id, "type": "pong"}),
            "get_states" => json!({"id": id, "type": "result", "success": true, "result": sample_states()}),
            "get_config" => {
                config_polls += 1;
                let state = if config_polls > script.not_running_polls {
                    "RUNNING"
                } else {
                    "NOT_RUNNING"
                };
                json!({"id": id, "type": "result", "success": true, "result": {
                    "location_name": "Home", "version": "2024.3.0", "state": state,
                    "components": ["light", "sensor"]
                }})
            }
            "subscribe_events" if script.reject_subscribe => json!({
                "id": id, "type": "result", "success": false,
                "error": {"code": "unauthorized", "message": "Unauthorized"}
            }),
            "subscribe_events" => json!({"id": id, "type": "result", "success": true, "result": null}),
            "call_service" if msg["domain"] == "missing" => json!({
                "id": id, "type": "result", "success": false,
                "error": {"code": "not_found", "message": "Service not found."}
            }),
            "call_service" => json!({"id": id, "type": "result", "success": true, "result": {"context": {"id": "ctx"}}}),
            "get_services" => json!({"id": id, "type": "result", "success": true, "result": {
                "light": {"turn_on": {"name": "Turn on", "description": "Turn a light on", "fields": {}}}
            }}),
            "config/area_registry/list" => json!({"id": id, "type": "result", "success": true, "result": [
                {"area_id": "kitchen", "name": "Kitchen", "picture": null}
            ]}),
            "config/device_registry/list" => json!({"id": id, "type": "result", "success": true, "result": [
                {"id": "dev1", "name": "Hue bridge", "manufacturer": "Signify", "area_id": "kitchen"}
            ]}),
            "config/entity_registry/list" => json!({"id": id, "type": "result", "success": true, "result": [
                {"entity_id": "light.kitchen", "device_id": "dev1", "platform": "hue"}
            ]}),
            other => json!({
                "id": id, "type": "result", "success": false,
                "error": {"code": "unknown_command", "message": format!("Unknown command {other}")}
            }),
        };
        hub.send_json(&reply);
    }
}
