//! Wire message types for the hub WebSocket API.
//!
//! Inbound messages are decoded in two steps: first into the generic
//! [`Envelope`], then (by the router) into a concrete payload chosen by the
//! discriminant: the `type` field for envelopes, `event_type` for events and
//! the pending command's [`CommandKind`] for `result` payloads.
//!
//! # Message Types
//!
//! - Outbound: [`Command`] (`auth`, `ping`, `get_states`, `get_config`,
//!   `get_services`, `call_service`, `subscribe_events`, registry listings)
//! - Inbound: `auth_required`, `auth_ok`, `auth_invalid`, `result`, `pong`,
//!   `event`

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::HassError;

/// Envelope discriminants sent by the hub.
pub mod msg_type {
    /// First message after the socket opens.
    pub const AUTH_REQUIRED: &str = "auth_required";
    /// Token accepted.
    pub const AUTH_OK: &str = "auth_ok";
    /// Token rejected.
    pub const AUTH_INVALID: &str = "auth_invalid";
    /// Reply to an id-bearing command.
    pub const RESULT: &str = "result";
    /// Reply to `ping`.
    pub const PONG: &str = "pong";
    /// Subscription event.
    pub const EVENT: &str = "event";
}

/// Event types with a typed `data` payload.
pub mod event_type {
    /// Entity state transition.
    pub const STATE_CHANGED: &str = "state_changed";
    /// A service was invoked.
    pub const CALL_SERVICE: &str = "call_service";
}

// ============================================================================
// Outbound commands
// ============================================================================

/// A command sent to the hub.
///
/// The engine assigns the `id` at send time (see [`Command::to_wire`]);
/// `auth` is the only command sent without one.
#[derive(Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Handshake credential.
    #[serde(rename = "auth")]
    Auth {
        /// Long-lived bearer token.
        access_token: String,
    },
    /// Liveness probe.
    #[serde(rename = "ping")]
    Ping,
    /// Snapshot of every entity.
    #[serde(rename = "get_states")]
    GetStates,
    /// Hub configuration, including its run state.
    #[serde(rename = "get_config")]
    GetConfig,
    /// Service catalogue per domain.
    #[serde(rename = "get_services")]
    GetServices,
    /// Invoke a service.
    #[serde(rename = "call_service")]
    CallService {
        /// Service domain (e.g. `light`).
        domain: String,
        /// Service name (e.g. `turn_on`).
        service: String,
        /// Service arguments.
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<Value>,
        /// Target selector (`entity_id`, `device_id`, `area_id`).
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<Value>,
    },
    /// Subscribe to bus events; `None` subscribes to all of them.
    #[serde(rename = "subscribe_events")]
    SubscribeEvents {
        /// Event type filter.
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    /// Area registry listing.
    #[serde(rename = "config/area_registry/list")]
    AreaRegistryList,
    /// Device registry listing.
    #[serde(rename = "config/device_registry/list")]
    DeviceRegistryList,
    /// Entity registry listing.
    #[serde(rename = "config/entity_registry/list")]
    EntityRegistryList,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth { .. } => f
                .debug_struct("Auth")
                .field("access_token", &"<redacted>")
                .finish(),
            Self::CallService {
                domain, service, ..
            } => f
                .debug_struct("CallService")
                .field("domain", domain)
                .field("service", service)
                .finish_non_exhaustive(),
            Self::SubscribeEvents { event_type } => f
                .debug_struct("SubscribeEvents")
                .field("event_type", event_type)
                .finish(),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

impl Command {
    /// The discriminant recorded in the pending table for this command.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Auth { .. } => CommandKind::Auth,
            Self::Ping => CommandKind::Ping,
            Self::GetStates => CommandKind::GetStates,
            Self::GetConfig => CommandKind::GetConfig,
            Self::GetServices => CommandKind::GetServices,
            Self::CallService { .. } => CommandKind::CallService,
            Self::SubscribeEvents { .. } => CommandKind::SubscribeEvents,
            Self::AreaRegistryList => CommandKind::AreaRegistryList,
            Self::DeviceRegistryList => CommandKind::DeviceRegistryList,
            Self::EntityRegistryList => CommandKind::EntityRegistryList,
        }
    }

    /// Serialize to the JSON text sent on the wire, with `id` when given.
    ///
    /// # Errors
    ///
    /// Returns `HassError::Deserialization` if a payload value fails to
    /// serialize.
    pub fn to_wire(&self, id: Option<u64>) -> Result<String, HassError> {
        let mut value = serde_json::to_value(self)?;
        if let (Some(id), Value::Object(map)) = (id, &mut value) {
            map.insert("id".to_string(), Value::from(id));
        }
        Ok(value.to_string())
    }
}

/// Command discriminant, used to pick the decoder for a `result` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// `auth`
    Auth,
    /// `ping`
    Ping,
    /// `get_states`
    GetStates,
    /// `get_config`
    GetConfig,
    /// `get_services`
    GetServices,
    /// `call_service`
    CallService,
    /// `subscribe_events`
    SubscribeEvents,
    /// `config/area_registry/list`
    AreaRegistryList,
    /// `config/device_registry/list`
    DeviceRegistryList,
    /// `config/entity_registry/list`
    EntityRegistryList,
}

impl CommandKind {
    /// Wire discriminant.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Ping => "ping",
            Self::GetStates => "get_states",
            Self::GetConfig => "get_config",
            Self::GetServices => "get_services",
            Self::CallService => "call_service",
            Self::SubscribeEvents => "subscribe_events",
            Self::AreaRegistryList => "config/area_registry/list",
            Self::DeviceRegistryList => "config/device_registry/list",
            Self::EntityRegistryList => "config/entity_registry/list",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Inbound envelope
// ============================================================================

/// Generic inbound message before type-specific interpretation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    /// Discriminant.
    #[serde(rename = "type")]
    pub kind: String,
    /// Present on command replies only.
    #[serde(default)]
    pub id: Option<u64>,
    /// Command outcome (`result` only).
    #[serde(default)]
    pub success: Option<bool>,
    /// Command payload, interpreted by the pending command's kind.
    #[serde(default)]
    pub result: Option<Value>,
    /// Event payload, interpreted by its `event_type`.
    #[serde(default)]
    pub event: Option<Value>,
    /// Failure detail when `success` is false.
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    /// Free-text message (e.g. on `auth_invalid`).
    #[serde(default)]
    pub message: Option<String>,
    /// Hub version announced during the handshake.
    #[serde(default)]
    pub ha_version: Option<String>,
}

impl Envelope {
    /// Decode one complete inbound text message.
    ///
    /// # Errors
    ///
    /// Returns `HassError::Deserialization` for malformed JSON or a missing
    /// `type` field.
    pub fn parse(text: &str) -> Result<Self, HassError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Error detail on a failed command reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable code (e.g. `not_found`).
    #[serde(default)]
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Entity state
// ============================================================================

/// Entity state value.
///
/// The hub sends every state as text; numeric-looking text is reinterpreted
/// as an integer, then a float, and the literal `"unavailable"` maps to
/// [`StateValue::Null`]. Not every integration uses `"unavailable"`
/// consistently, so consumers should tolerate `Null` here.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    /// Non-numeric text (e.g. `"on"`).
    String(String),
    /// Integral value.
    Integer(i64),
    /// Finite floating point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
    /// No value (`"unavailable"` or JSON `null`).
    Null,
}

impl StateValue {
    /// Literal state text that maps to [`StateValue::Null`].
    pub const UNAVAILABLE: &'static str = "unavailable";

    /// Interpret a textual state.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        if text == Self::UNAVAILABLE {
            return Self::Null;
        }
        if let Ok(i) = text.parse::<i64>() {
            return Self::Integer(i);
        }
        match text.parse::<f64>() {
            Ok(f) if f.is_finite() => Self::Float(f),
            _ => Self::String(text.to_string()),
        }
    }

    /// Text value, if this is a string state.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value, if this is an integer or float state.
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "state readings fit in f64")]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns `true` for [`StateValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Null => f.write_str(Self::UNAVAILABLE),
        }
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for StateValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => Self::parse(&s),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            Value::Bool(b) => Self::Bool(b),
            Value::Null => Self::Null,
            other => Self::String(other.to_string()),
        })
    }
}

impl Serialize for StateValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) => serializer.serialize_str(s),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Null => serializer.serialize_unit(),
        }
    }
}

/// Snapshot of one entity at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// Entity id (e.g. `light.kitchen`).
    pub entity_id: String,
    /// Decoded state value.
    pub state: StateValue,
    /// Integration-specific attributes.
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    /// When the state value last changed.
    pub last_changed: DateTime<Utc>,
    /// When the state or attributes last changed.
    pub last_updated: DateTime<Utc>,
}

// ============================================================================
// Events
// ============================================================================

/// Event delivered through a `subscribe_events` subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HassEvent {
    /// Event type (e.g. `state_changed`).
    pub event_type: String,
    /// `LOCAL` or `REMOTE`.
    pub origin: String,
    /// When the hub fired the event.
    pub time_fired: DateTime<Utc>,
    /// Payload decoded by `event_type`.
    pub data: EventData,
}

/// Event payload, shaped by the event type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    /// `state_changed`
    StateChanged(StateChangedData),
    /// `call_service`
    CallService(CallServiceData),
    /// Any other event type.
    Other(Value),
}

/// Payload of a `state_changed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedData {
    /// Entity that changed.
    pub entity_id: String,
    /// Previous snapshot (`None` when the entity was just created).
    #[serde(default)]
    pub old_state: Option<EntityState>,
    /// New snapshot (`None` when the entity was removed).
    #[serde(default)]
    pub new_state: Option<EntityState>,
}

/// Payload of a `call_service` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallServiceData {
    /// Service domain.
    pub domain: String,
    /// Service name.
    pub service: String,
    /// Service arguments.
    #[serde(default)]
    pub service_data: Value,
}

#[derive(Deserialize)]
struct RawEvent {
    event_type: String,
    #[serde(default)]
    origin: String,
    time_fired: DateTime<Utc>,
    #[serde(default)]
    data: Value,
}

impl HassEvent {
    /// Decode an envelope's `event` payload.
    ///
    /// # Errors
    ///
    /// Returns `HassError::Deserialization` if the event or its typed data
    /// does not match the expected shape.
    pub fn from_value(value: Value) -> Result<Self, HassError> {
        let raw: RawEvent = serde_json::from_value(value)?;
        let data = match raw.event_type.as_str() {
            event_type::STATE_CHANGED => EventData::StateChanged(serde_json::from_value(raw.data)?),
            event_type::CALL_SERVICE => EventData::CallService(serde_json::from_value(raw.data)?),
            _ => EventData::Other(raw.data),
        };
        Ok(Self {
            event_type: raw.event_type,
            origin: raw.origin,
            time_fired: raw.time_fired,
            data,
        })
    }
}

// ============================================================================
// Command results
// ============================================================================

/// Hub configuration returned by `get_config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HassConfig {
    /// Installation name.
    pub location_name: String,
    /// Home latitude.
    pub latitude: f64,
    /// Home longitude.
    pub longitude: f64,
    /// Home elevation.
    pub elevation: f64,
    /// Unit names per quantity.
    pub unit_system: HashMap<String, Value>,
    /// IANA time zone.
    pub time_zone: String,
    /// Loaded integrations.
    pub components: Vec<String>,
    /// Hub version.
    pub version: String,
    /// Run state (`NOT_RUNNING`, `STARTING`, `RUNNING`, ...).
    pub state: String,
    /// Configuration directory on the hub.
    pub config_dir: String,
}

impl HassConfig {
    /// Returns `true` once the hub has finished starting.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == crate::constants::HUB_RUNNING_STATE
    }
}

/// Area registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HassArea {
    /// Area id.
    pub area_id: String,
    /// Display name.
    pub name: String,
    /// Picture URL.
    #[serde(default)]
    pub picture: Option<String>,
}

/// Device registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HassDevice {
    /// Device id.
    pub id: String,
    /// Integration-provided name.
    #[serde(default)]
    pub name: Option<String>,
    /// User override of the name.
    #[serde(default)]
    pub name_by_user: Option<String>,
    /// Manufacturer.
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Model.
    #[serde(default)]
    pub model: Option<String>,
    /// Assigned area.
    #[serde(default)]
    pub area_id: Option<String>,
}

/// Entity registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HassEntity {
    /// Entity id.
    pub entity_id: String,
    /// Owning device.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Assigned area (overrides the device's).
    #[serde(default)]
    pub area_id: Option<String>,
    /// Integration platform.
    #[serde(default)]
    pub platform: String,
    /// User-assigned name.
    #[serde(default)]
    pub name: Option<String>,
    /// Why the entity is disabled, if it is.
    #[serde(default)]
    pub disabled_by: Option<String>,
}

/// Description of one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HassService {
    /// Display name.
    pub name: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Field descriptors by field name.
    pub fields: HashMap<String, Value>,
}

/// Services by domain, then by service name.
pub type HassServices = HashMap<String, HashMap<String, HassService>>;

/// A `result` payload decoded according to its command's kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Only `success` is meaningful.
    None,
    /// `get_states`
    States(Vec<EntityState>),
    /// `get_config`
    Config(HassConfig),
    /// `get_services`
    Services(HassServices),
    /// `config/area_registry/list`
    Areas(Vec<HassArea>),
    /// `config/device_registry/list`
    Devices(Vec<HassDevice>),
    /// `config/entity_registry/list`
    Entities(Vec<HassEntity>),
}

impl CommandResult {
    /// Decode `payload` into the shape `kind` returns.
    ///
    /// # Errors
    ///
    /// Returns `HassError::Deserialization` when a payload-bearing kind has
    /// a missing or malformed payload.
    pub fn decode(kind: CommandKind, payload: Option<Value>) -> Result<Self, HassError> {
        fn typed<T: serde::de::DeserializeOwned>(
            kind: CommandKind,
            payload: Option<Value>,
        ) -> Result<T, HassError> {
            let value = payload.ok_or_else(|| {
                HassError::Deserialization(format!("{kind} reply carried no result"))
            })?;
            serde_json::from_value(value)
                .map_err(|e| HassError::Deserialization(format!("{kind} result: {e}")))
        }

        Ok(match kind {
            CommandKind::GetStates => Self::States(typed(kind, payload)?),
            CommandKind::GetConfig => Self::Config(typed(kind, payload)?),
            CommandKind::GetServices => Self::Services(typed(kind, payload)?),
            CommandKind::AreaRegistryList => Self::Areas(typed(kind, payload)?),
            CommandKind::DeviceRegistryList => Self::Devices(typed(kind, payload)?),
            CommandKind::EntityRegistryList => Self::Entities(typed(kind, payload)?),
            CommandKind::Auth
            | CommandKind::Ping
            | CommandKind::CallService
            | CommandKind::SubscribeEvents => Self::None,
        })
    }
}

/// A correlated reply, delivered to the command's waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    /// Command id.
    pub id: u64,
    /// Hub-reported outcome.
    pub success: bool,
    /// Decoded payload (`None` when `success` is false).
    pub result: CommandResult,
    /// Failure detail when `success` is false.
    pub error: Option<ErrorDetail>,
}
