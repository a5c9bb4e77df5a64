//! Inbound message classification and reply correlation.
//!
//! The read pump hands every complete inbound message to [`Router::route`],
//! which decodes the [`Envelope`] and sends it down exactly one path:
//!
//! ```text
//!                       ┌── result (id pending) ──► PendingTable slot ──► waiting command
//! text ─► Envelope ─────┼── event ──────────────► event queue ──────────► read_next_event()
//!                       ├── auth_* / pong ──────► reply queue ──────────► handshake, ping
//!                       └── anything else ──────► discarded (logged)
//! ```
//!
//! Replies are matched strictly by id: each registered id owns a single-use
//! completion slot, so a waiter never sees messages addressed to other ids.
//!
//! A router built [`Router::with_gate`] also enforces the handshake: until
//! `auth_ok` is seen every inbound message, malformed or not, goes to the
//! reply queue so the handshake judges the hub's real first message. After
//! that, a `pong` reaches the reply queue only while a ping waits for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{mpsc, oneshot};

use crate::error::HassError;
use crate::messages::{
    msg_type, CommandKind, CommandReply, CommandResult, EntityState, Envelope, HassEvent,
};

/// Outcome delivered to a command's completion slot.
pub type ReplyOutcome = Result<CommandReply, HassError>;

/// Item on the uncorrelated reply queue. `Err` carries a message that could
/// not be decoded during the handshake.
pub type ReplyMessage = Result<Envelope, HassError>;

/// Decides what the reply queue accepts for one socket lifetime.
#[derive(Debug, Default)]
pub struct ReplyGate {
    authenticated: AtomicBool,
    pings_waiting: AtomicUsize,
}

impl ReplyGate {
    /// Create a gate in the handshake phase.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once `auth_ok` has been routed.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Mark a ping as waiting for its pong until the guard is dropped.
    #[must_use]
    pub fn ping_waiting(self: &Arc<Self>) -> PingWaiting {
        self.pings_waiting.fetch_add(1, Ordering::SeqCst);
        PingWaiting {
            gate: Arc::clone(self),
        }
    }

    fn accepts_pong(&self) -> bool {
        self.pings_waiting.load(Ordering::SeqCst) > 0
    }
}

/// Keeps pongs flowing to the reply queue while alive.
#[derive(Debug)]
pub struct PingWaiting {
    gate: Arc<ReplyGate>,
}

impl Drop for PingWaiting {
    fn drop(&mut self) {
        self.gate.pings_waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An outstanding command awaiting its reply.
#[derive(Debug)]
struct PendingCommand {
    kind: CommandKind,
    completion: oneshot::Sender<ReplyOutcome>,
}

/// Map from outstanding command id to its kind and completion slot.
///
/// Each entry is removed exactly once: by the router when the reply arrives,
/// or by the sender when it gives up (timeout, failed enqueue).
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<u64, PendingCommand>>,
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiving end of its completion slot.
    pub fn register(&self, id: u64, kind: CommandKind) -> oneshot::Receiver<ReplyOutcome> {
        let (completion, rx) = oneshot::channel();
        let previous = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, PendingCommand { kind, completion });
        if previous.is_some() {
            log::error!("[Router] Command id {} registered twice", id);
        }
        rx
    }

    /// Kind recorded for `id`, if it is still outstanding.
    #[must_use]
    pub fn kind_of(&self, id: u64) -> Option<CommandKind> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|p| p.kind)
    }

    /// Drop the entry for `id` without completing it.
    ///
    /// Returns `false` if the entry was already consumed.
    pub fn remove(&self, id: u64) -> bool {
        self.take(id).is_some()
    }

    /// Number of outstanding commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every outstanding command with `error`.
    pub fn fail_all(&self, error: &HassError) {
        let drained: Vec<PendingCommand> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for pending in drained {
            let _ = pending.completion.send(Err(error.clone()));
        }
    }

    fn take(&self, id: u64) -> Option<PendingCommand> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }
}

/// Last-known entity snapshots, keyed by entity id.
///
/// Written only by the router when a `get_states` reply is decoded; callers
/// get clones.
#[derive(Debug, Default)]
pub struct StateCache {
    states: RwLock<HashMap<String, EntityState>>,
}

impl StateCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for `entity_id`.
    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }

    /// Copy of the whole cache.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, EntityState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of cached entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn replace_all(&self, states: &[EntityState]) {
        let fresh: HashMap<String, EntityState> = states
            .iter()
            .map(|s| (s.entity_id.clone(), s.clone()))
            .collect();
        *self.states.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }
}

/// Classifies inbound messages and feeds the reply, event and completion paths.
#[derive(Debug)]
pub struct Router {
    pending: Arc<PendingTable>,
    states: Arc<StateCache>,
    events_tx: mpsc::Sender<HassEvent>,
    replies_tx: mpsc::Sender<ReplyMessage>,
    gate: Option<Arc<ReplyGate>>,
}

impl Router {
    /// Create an ungated router feeding the given table, cache and queues.
    #[must_use]
    pub fn new(
        pending: Arc<PendingTable>,
        states: Arc<StateCache>,
        events_tx: mpsc::Sender<HassEvent>,
        replies_tx: mpsc::Sender<ReplyMessage>,
    ) -> Self {
        Self {
            pending,
            states,
            events_tx,
            replies_tx,
            gate: None,
        }
    }

    /// Apply the handshake and pong rules of `gate`.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<ReplyGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    async fn push_reply(&self, reply: ReplyMessage) {
        if self.replies_tx.send(reply).await.is_err() {
            log::debug!("[Router] Reply receiver gone, dropping reply");
        }
    }

    async fn route_handshake(&self, gate: &ReplyGate, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => {
                if envelope.kind == msg_type::AUTH_OK {
                    gate.authenticated.store(true, Ordering::SeqCst);
                }
                self.push_reply(Ok(envelope)).await;
            }
            Err(e) => {
                log::warn!("[Router] Malformed message during handshake: {}", e);
                self.push_reply(Err(e)).await;
            }
        }
    }

    /// Route one complete inbound message.
    ///
    /// Waits when the destination queue is full.
    ///
    /// # Errors
    ///
    /// Returns `HassError::Deserialization` if the message (or the typed
    /// payload it carries) is malformed. The message has been discarded and
    /// routing can continue with the next one.
    pub async fn route(&self, text: &str) -> Result<(), HassError> {
        if let Some(gate) = self.gate.as_deref().filter(|g| !g.is_authenticated()) {
            self.route_handshake(gate, text).await;
            return Ok(());
        }
        let envelope = Envelope::parse(text)?;

        match envelope.kind.as_str() {
            msg_type::RESULT => self.complete_reply(envelope),
            msg_type::EVENT => {
                let Some(payload) = envelope.event else {
                    return Err(HassError::Deserialization(
                        "event message without event payload".into(),
                    ));
                };
                let event = HassEvent::from_value(payload)?;
                log::trace!("[Router] Event {}", event.event_type);
                if self.events_tx.send(event).await.is_err() {
                    log::debug!("[Router] Event receiver gone, dropping event");
                }
                Ok(())
            }
            msg_type::PONG if self.gate.as_ref().is_some_and(|g| !g.accepts_pong()) => {
                log::debug!("[Router] Discarding pong with no ping waiting");
                Ok(())
            }
            msg_type::AUTH_REQUIRED
            | msg_type::AUTH_OK
            | msg_type::AUTH_INVALID
            | msg_type::PONG => {
                self.push_reply(Ok(envelope)).await;
                Ok(())
            }
            other => {
                log::debug!("[Router] Discarding message of type {}", other);
                Ok(())
            }
        }
    }

    fn complete_reply(&self, envelope: Envelope) -> Result<(), HassError> {
        let Some(id) = envelope.id else {
            log::warn!("[Router] Result without id, discarding");
            return Ok(());
        };
        let Some(pending) = self.pending.take(id) else {
            log::debug!("[Router] No pending command for id {}, discarding result", id);
            return Ok(());
        };

        let success = envelope.success.unwrap_or(false);
        let outcome = if success {
            CommandResult::decode(pending.kind, envelope.result).map(|result| CommandReply {
                id,
                success,
                result,
                error: None,
            })
        } else {
            Ok(CommandReply {
                id,
                success,
                result: CommandResult::None,
                error: envelope.error,
            })
        };

        if let Ok(CommandReply {
            result: CommandResult::States(states),
            ..
        }) = &outcome
        {
            self.states.replace_all(states);
            log::debug!("[Router] State cache refreshed ({} entities)", states.len());
        }

        let decode_error = outcome.as_ref().err().cloned();
        if pending.completion.send(outcome).is_err() {
            log::debug!(
                "[Router] Waiter for {} id {} already gone",
                pending.kind,
                id
            );
        }
        decode_error.map_or(Ok(()), Err)
    }
}
