//! Protocol engine: handshake, id-correlated commands, events and state cache.
//!
//! A [`HassConnection`] is constructed idle. [`HassConnection::connect`]
//! opens a socket through the injected [`SocketFactory`], starts a fresh
//! [`Transport`] with its own queues, pending table and id sequence, and runs
//! the auth handshake:
//!
//! ```text
//!   hub ── auth_required ──► client
//!   hub ◄── auth {token} ─── client        (no id)
//!   hub ── auth_ok ────────► client        auth_invalid → AuthInvalid
//!   hub ◄── get_states ───── client        (optional bulk load, id 1)
//! ```
//!
//! Every command after the handshake gets the next id, is registered in the
//! pending table, then queued for the write pump. The caller awaits its own
//! completion slot under a timeout composed with the connection's disconnect
//! signal, so a failed socket unblocks every waiter at once.
//!
//! `connect` and `close` take `&self`: the connection is shared behind an
//! `Arc` between the supervisor and callers issuing commands.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::constants::{
    COMMAND_TIMEOUT, EVENT_QUEUE_CAPACITY, HANDSHAKE_TIMEOUT, REPLY_QUEUE_CAPACITY,
};
use crate::error::HassError;
use crate::messages::{
    msg_type, Command, CommandReply, CommandResult, EntityState, Envelope, HassArea,
    HassConfig, HassDevice, HassEntity, HassEvent, HassServices,
};
use crate::router::{PendingTable, ReplyGate, ReplyMessage, Router, StateCache};
use crate::transport::Transport;
use crate::ws::{websocket_url, SocketFactory, TungsteniteSocketFactory};

/// Connectivity as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Authenticated (and, under the supervisor, subscribed and running).
    Connected,
    /// Authenticated but the hub has not finished starting.
    NotReady,
    /// No usable connection.
    Disconnected,
    /// Socket open, handshake in progress.
    WebSocketConnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::NotReady => write!(f, "not ready"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::WebSocketConnected => write!(f, "websocket connected"),
        }
    }
}

/// Current status plus the signal that fires when this connection is lost.
///
/// Callers use `disconnected` to bound their own waits.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Status at the time of the snapshot.
    pub status: ConnectionStatus,
    /// Cancelled on close or fatal transport failure.
    pub disconnected: CancellationToken,
}

/// One socket lifetime: transport, id sequence, queues and pending table.
#[derive(Debug)]
struct LiveConnection {
    transport: Transport,
    next_id: AtomicU64,
    pending: Arc<PendingTable>,
    gate: Arc<ReplyGate>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<HassEvent>>,
    replies_rx: tokio::sync::Mutex<mpsc::Receiver<ReplyMessage>>,
    disconnected: CancellationToken,
}

impl LiveConnection {
    fn start(socket: crate::ws::WsPair, states: Arc<StateCache>) -> Self {
        let pending = Arc::new(PendingTable::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (replies_tx, replies_rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
        let gate = Arc::new(ReplyGate::new());
        let router = Router::new(Arc::clone(&pending), states, events_tx, replies_tx)
            .with_gate(Arc::clone(&gate));
        let disconnected = CancellationToken::new();
        let transport = Transport::spawn(socket, router, disconnected.clone());

        Self {
            transport,
            next_id: AtomicU64::new(1),
            pending,
            gate,
            events_rx: tokio::sync::Mutex::new(events_rx),
            replies_rx: tokio::sync::Mutex::new(replies_rx),
            disconnected,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Run `op` until it finishes, `timeout` elapses or the socket is lost,
    /// whichever comes first. Queue waits inside `op` count against `timeout`.
    async fn bounded<T>(
        &self,
        timeout: Duration,
        op: impl Future<Output = Result<T, HassError>>,
    ) -> Result<T, HassError> {
        tokio::select! {
            biased;
            result = op => result,
            () = self.disconnected.cancelled() => Err(HassError::Cancelled),
            () = tokio::time::sleep(timeout) => Err(HassError::Timeout),
        }
    }

    async fn recv_reply(&self) -> Result<Envelope, HassError> {
        let mut replies = self.replies_rx.lock().await;
        replies.recv().await.unwrap_or(Err(HassError::Cancelled))
    }

    /// Next message on the uncorrelated reply path.
    async fn next_reply(&self, timeout: Duration) -> Result<Envelope, HassError> {
        self.bounded(timeout, self.recv_reply()).await
    }

    async fn authenticate(&self, token: &str) -> Result<(), HassError> {
        let first = match self.next_reply(HANDSHAKE_TIMEOUT).await {
            Ok(envelope) => envelope,
            Err(HassError::Timeout) => {
                return Err(HassError::Protocol(format!(
                    "no auth_required within {}s",
                    HANDSHAKE_TIMEOUT.as_secs()
                )))
            }
            Err(HassError::Deserialization(detail)) => {
                return Err(HassError::Protocol(format!(
                    "malformed first message: {detail}"
                )))
            }
            Err(e) => return Err(e),
        };
        if first.kind != msg_type::AUTH_REQUIRED {
            return Err(HassError::Protocol(format!(
                "expected auth_required, got {}",
                first.kind
            )));
        }
        if let Some(version) = &first.ha_version {
            log::info!("[HassConnection] Hub version {}", version);
        }

        let auth = Command::Auth {
            access_token: token.to_string(),
        };
        let text = auth.to_wire(None)?;
        self.bounded(HANDSHAKE_TIMEOUT, self.transport.send(text)).await?;

        let answer = match self.next_reply(HANDSHAKE_TIMEOUT).await {
            Err(HassError::Deserialization(detail)) => {
                return Err(HassError::Protocol(format!("malformed auth answer: {detail}")))
            }
            other => other?,
        };
        match answer.kind.as_str() {
            msg_type::AUTH_OK => Ok(()),
            msg_type::AUTH_INVALID => Err(HassError::AuthInvalid(
                answer
                    .message
                    .unwrap_or_else(|| "access token rejected".to_string()),
            )),
            other => Err(HassError::Protocol(format!(
                "expected auth_ok or auth_invalid, got {other}"
            ))),
        }
    }

    /// Send a command and wait for its correlated reply.
    async fn request(&self, command: Command, timeout: Duration) -> Result<CommandReply, HassError> {
        let kind = command.kind();
        let id = self.next_id();
        let text = command.to_wire(Some(id))?;

        let slot = self.pending.register(id, kind);
        let exchange = async {
            self.transport.send(text).await?;
            log::debug!("[HassConnection] Sent {} (id {})", kind, id);
            slot.await.unwrap_or(Err(HassError::Cancelled))
        };

        let outcome = self.bounded(timeout, exchange).await;
        if let Err(e) = &outcome {
            // No-op when the router already consumed the entry.
            self.pending.remove(id);
            if matches!(e, HassError::Timeout) {
                log::warn!("[HassConnection] No reply to {} (id {}) within {:?}", kind, id, timeout);
            }
        }
        outcome
    }

    async fn shutdown(&self) {
        self.disconnected.cancel();
        self.transport.close().await;
        self.pending.fail_all(&HassError::Cancelled);
    }
}

/// Client for the hub's WebSocket API.
#[derive(Debug)]
pub struct HassConnection {
    factory: Arc<dyn SocketFactory>,
    command_timeout: Duration,
    states: Arc<StateCache>,
    live: RwLock<Option<Arc<LiveConnection>>>,
    status: Mutex<ConnectionStatus>,
}

impl Default for HassConnection {
    fn default() -> Self {
        Self::new(Arc::new(TungsteniteSocketFactory))
    }
}

impl HassConnection {
    /// Create an idle connection that opens sockets through `factory`.
    #[must_use]
    pub fn new(factory: Arc<dyn SocketFactory>) -> Self {
        Self {
            factory,
            command_timeout: COMMAND_TIMEOUT,
            states: Arc::new(StateCache::new()),
            live: RwLock::new(None),
            status: Mutex::new(ConnectionStatus::Disconnected),
        }
    }

    /// Override the per-command reply timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    async fn live_connection(&self) -> Result<Arc<LiveConnection>, HassError> {
        self.live
            .read()
            .await
            .as_ref()
            .filter(|conn| conn.transport.is_valid())
            .map(Arc::clone)
            .ok_or(HassError::NotConnected)
    }

    /// Open a socket, authenticate, and optionally bulk-load entity states.
    ///
    /// On failure the socket is released and the connection stays idle.
    ///
    /// # Errors
    ///
    /// - `HassError::AlreadyConnected` if a socket is still open.
    /// - `HassError::Transport` if the socket cannot be opened.
    /// - `HassError::Protocol` on an unexpected handshake message.
    /// - `HassError::AuthInvalid` if the hub rejects `token`.
    /// - Any command error from the bulk state load.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        ssl: bool,
        token: &str,
        fetch_states: bool,
    ) -> Result<(), HassError> {
        let mut live = self.live.write().await;
        if let Some(existing) = live.take() {
            if existing.transport.is_valid() {
                *live = Some(existing);
                return Err(HassError::AlreadyConnected);
            }
            existing.shutdown().await;
        }

        let url = websocket_url(host, port, ssl);
        log::info!("[HassConnection] Connecting to {}", url);
        let socket = self.factory.connect(&url).await.inspect_err(|e| {
            log::warn!("[HassConnection] Socket connect failed: {}", e);
        })?;

        let conn = Arc::new(LiveConnection::start(socket, Arc::clone(&self.states)));
        self.set_status(ConnectionStatus::WebSocketConnected);

        let mut outcome = conn.authenticate(token).await;
        if outcome.is_ok() && fetch_states {
            outcome = conn
                .request(Command::GetStates, self.command_timeout)
                .await
                .and_then(require_success)
                .map(|_| log::info!("[HassConnection] Loaded {} entity states", self.states.len()));
        }

        if let Err(e) = outcome {
            log::warn!("[HassConnection] Connect failed: {}", e);
            conn.shutdown().await;
            self.set_status(ConnectionStatus::Disconnected);
            return Err(e);
        }

        log::info!("[HassConnection] Authenticated");
        *live = Some(conn);
        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    /// Stop the pumps, perform the close handshake and release the socket.
    ///
    /// Outstanding commands and event readers complete with
    /// `HassError::Cancelled`. The connection can be reconnected afterwards.
    pub async fn close(&self) {
        let conn = self.live.write().await.take();
        if let Some(conn) = conn {
            log::info!("[HassConnection] Closing connection");
            conn.shutdown().await;
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Returns `true` while the socket is usable.
    pub async fn is_valid(&self) -> bool {
        self.live_connection().await.is_ok()
    }

    /// Current status and the disconnect signal of the live socket.
    ///
    /// Without a live socket the signal is already cancelled.
    pub async fn state(&self) -> ConnectionState {
        match self.live.read().await.as_ref() {
            Some(conn) if conn.transport.is_valid() => ConnectionState {
                status: *self.status.lock().unwrap_or_else(PoisonError::into_inner),
                disconnected: conn.disconnected.clone(),
            },
            Some(conn) => ConnectionState {
                status: ConnectionStatus::Disconnected,
                disconnected: conn.disconnected.clone(),
            },
            None => {
                let disconnected = CancellationToken::new();
                disconnected.cancel();
                ConnectionState {
                    status: ConnectionStatus::Disconnected,
                    disconnected,
                }
            }
        }
    }

    /// Signal that fires when the current socket is lost.
    pub async fn disconnect_token(&self) -> CancellationToken {
        self.state().await.disconnected
    }

    /// Send any id-bearing command and wait for its reply.
    ///
    /// # Errors
    ///
    /// - `HassError::NotConnected` without a live socket.
    /// - `HassError::Timeout` if no reply arrives in time.
    /// - `HassError::Cancelled` if the connection is lost while waiting.
    /// - `HassError::CommandFailed` if the hub answers `success: false`.
    /// - `HassError::Deserialization` if the result payload is malformed.
    pub async fn send_command(&self, command: Command) -> Result<CommandReply, HassError> {
        if matches!(command, Command::Auth { .. }) {
            return Err(HassError::Protocol(
                "auth is only sent during the handshake".into(),
            ));
        }
        let conn = self.live_connection().await?;
        conn.request(command, self.command_timeout)
            .await
            .and_then(require_success)
    }

    /// Invoke `domain.service`. Returns `false` on any failure.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
        target: Option<Value>,
    ) -> bool {
        let command = Command::CallService {
            domain: domain.to_string(),
            service: service.to_string(),
            service_data,
            target,
        };
        match self.send_command(command).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("[HassConnection] call_service {}.{} failed: {}", domain, service, e);
                false
            }
        }
    }

    /// Subscribe to events of `event_type`, or to all events when `None`.
    /// Returns `false` on any failure.
    pub async fn subscribe_to_events(&self, event_type: Option<&str>) -> bool {
        let command = Command::SubscribeEvents {
            event_type: event_type.map(str::to_string),
        };
        match self.send_command(command).await {
            Ok(_) => {
                log::info!(
                    "[HassConnection] Subscribed to {}",
                    event_type.unwrap_or("all events")
                );
                true
            }
            Err(e) => {
                log::warn!("[HassConnection] subscribe_events failed: {}", e);
                false
            }
        }
    }

    /// Fetch the hub configuration.
    ///
    /// # Errors
    ///
    /// See [`HassConnection::send_command`].
    pub async fn get_config(&self) -> Result<HassConfig, HassError> {
        match self.send_command(Command::GetConfig).await?.result {
            CommandResult::Config(config) => Ok(config),
            other => Err(unexpected_result("get_config", &other)),
        }
    }

    /// Fetch every entity state. Also replaces the state cache.
    ///
    /// # Errors
    ///
    /// See [`HassConnection::send_command`].
    pub async fn get_states(&self) -> Result<Vec<EntityState>, HassError> {
        match self.send_command(Command::GetStates).await?.result {
            CommandResult::States(states) => Ok(states),
            other => Err(unexpected_result("get_states", &other)),
        }
    }

    /// Fetch the service catalogue.
    ///
    /// # Errors
    ///
    /// See [`HassConnection::send_command`].
    pub async fn get_services(&self) -> Result<HassServices, HassError> {
        match self.send_command(Command::GetServices).await?.result {
            CommandResult::Services(services) => Ok(services),
            other => Err(unexpected_result("get_services", &other)),
        }
    }

    /// List the area registry.
    ///
    /// # Errors
    ///
    /// See [`HassConnection::send_command`].
    pub async fn get_areas(&self) -> Result<Vec<HassArea>, HassError> {
        match self.send_command(Command::AreaRegistryList).await?.result {
            CommandResult::Areas(areas) => Ok(areas),
            other => Err(unexpected_result("area registry", &other)),
        }
    }

    /// List the device registry.
    ///
    /// # Errors
    ///
    /// See [`HassConnection::send_command`].
    pub async fn get_devices(&self) -> Result<Vec<HassDevice>, HassError> {
        match self.send_command(Command::DeviceRegistryList).await?.result {
            CommandResult::Devices(devices) => Ok(devices),
            other => Err(unexpected_result("device registry", &other)),
        }
    }

    /// List the entity registry.
    ///
    /// # Errors
    ///
    /// See [`HassConnection::send_command`].
    pub async fn get_entities(&self) -> Result<Vec<HassEntity>, HassError> {
        match self.send_command(Command::EntityRegistryList).await?.result {
            CommandResult::Entities(entities) => Ok(entities),
            other => Err(unexpected_result("entity registry", &other)),
        }
    }

    /// Liveness probe.
    ///
    /// Returns `true` iff the next message on the reply path within
    /// `timeout` is a `pong`. The pong is not matched against the ping's id.
    pub async fn ping(&self, timeout: Duration) -> bool {
        let Ok(conn) = self.live_connection().await else {
            return false;
        };
        let id = conn.next_id();
        let _waiting = conn.gate.ping_waiting();
        let probe = async {
            conn.transport.send(Command::Ping.to_wire(Some(id))?).await?;
            conn.recv_reply().await
        };

        match conn.bounded(timeout, probe).await {
            Ok(envelope) if envelope.kind == msg_type::PONG => true,
            Ok(envelope) => {
                log::debug!("[HassConnection] Expected pong, got {}", envelope.kind);
                false
            }
            Err(e) => {
                log::debug!("[HassConnection] Ping failed: {}", e);
                false
            }
        }
    }

    /// Wait for the next subscribed event, in arrival order.
    ///
    /// # Errors
    ///
    /// - `HassError::NotConnected` without a live socket.
    /// - `HassError::Cancelled` once the connection's disconnect signal fires.
    pub async fn read_next_event(&self) -> Result<HassEvent, HassError> {
        let conn = self.live_connection().await?;
        let mut events = conn.events_rx.lock().await;
        tokio::select! {
            biased;
            () = conn.disconnected.cancelled() => Err(HassError::Cancelled),
            event = events.recv() => event.ok_or(HassError::Cancelled),
        }
    }

    /// Cached snapshot of `entity_id`.
    #[must_use]
    pub fn entity_state(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id)
    }

    /// All cached snapshots keyed by entity id.
    #[must_use]
    pub fn states(&self) -> HashMap<String, EntityState> {
        self.states.snapshot()
    }
}

fn require_success(reply: CommandReply) -> Result<CommandReply, HassError> {
    if reply.success {
        return Ok(reply);
    }
    let (code, message) = reply
        .error
        .map(|e| (e.code, e.message))
        .unwrap_or_else(|| ("unknown_error".to_string(), String::new()));
    log::warn!("[HassConnection] Command {} failed ({}): {}", reply.id, code, message);
    Err(HassError::CommandFailed { code, message })
}

fn unexpected_result(what: &str, result: &CommandResult) -> HassError {
    HassError::Deserialization(format!("unexpected {what} result: {result:?}"))
}
