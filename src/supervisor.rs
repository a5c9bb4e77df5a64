//! Reconnection supervisor.
//!
//! Drives one [`HassConnection`] through repeated lifetimes until the caller
//! cancels:
//!
//! ```text
//!   Disconnected ──► Connecting ──(fail)──► Disconnected + backoff ──┐
//!        ▲               │                                           │
//!        │            (ok)                                           │
//!        │               ▼                                           │
//!        │         AwaitingReady ── get_config until RUNNING         │
//!        │               ▼                                           │
//!        │         SubscribingEvents ──(fail)──► close + backoff ────┤
//!        │               ▼                                           │
//!        │            Running ── forward events until disconnect     │
//!        │               ▼                                           │
//!        └──────── close + backoff ◄─────────────────────────────────┘
//! ```
//!
//! Status transitions are published on a broadcast stream and mirrored into
//! the connection's own status. Events received while running are
//! republished on the supervisor's event queue once a consumer has taken it;
//! before that they are read and dropped, so replies never queue behind them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionStatus, HassConnection};
use crate::constants::{
    READY_POLL_INTERVAL, RECONNECT_INTERVAL, STATUS_CHANNEL_CAPACITY, SUPERVISOR_EVENT_CAPACITY,
};
use crate::error::HassError;
use crate::messages::HassEvent;

/// Keeps a connection alive and republishes its status and events.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    connection: Arc<HassConnection>,
    reconnect_interval: Duration,
    ready_poll_interval: Duration,
    fetch_states: bool,
    status: Mutex<ConnectionStatus>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    events_tx: Mutex<Option<mpsc::Sender<HassEvent>>>,
    events_taken: AtomicBool,
}

impl ConnectionSupervisor {
    /// Supervise `connection` with the default intervals.
    #[must_use]
    pub fn new(connection: Arc<HassConnection>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            connection,
            reconnect_interval: RECONNECT_INTERVAL,
            ready_poll_interval: READY_POLL_INTERVAL,
            fetch_states: true,
            status: Mutex::new(ConnectionStatus::Disconnected),
            status_tx,
            events_tx: Mutex::new(None),
            events_taken: AtomicBool::new(false),
        }
    }

    /// Delay between a disconnect and the next connect attempt.
    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Spacing between readiness polls.
    #[must_use]
    pub fn with_ready_poll_interval(mut self, interval: Duration) -> Self {
        self.ready_poll_interval = interval;
        self
    }

    /// Whether each connect bulk-loads entity states.
    #[must_use]
    pub fn with_fetch_states(mut self, fetch_states: bool) -> Self {
        self.fetch_states = fetch_states;
        self
    }

    /// The supervised connection, for issuing commands while connected.
    #[must_use]
    pub fn connection(&self) -> &Arc<HassConnection> {
        &self.connection
    }

    /// Receive every status transition published from now on.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Most recently published status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the receiving end of the event stream.
    ///
    /// Events are forwarded only from this call on. Returns `None` after the
    /// first call. The stream must be drained: a full queue stalls event
    /// forwarding.
    pub fn take_events(&self) -> Option<mpsc::Receiver<HassEvent>> {
        if self.events_taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        let (events_tx, events_rx) = mpsc::channel(SUPERVISOR_EVENT_CAPACITY);
        *self.events_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(events_tx);
        Some(events_rx)
    }

    fn event_sink(&self) -> Option<mpsc::Sender<HassEvent>> {
        self.events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        self.connection.set_status(status);
        log::info!("[Supervisor] Status: {}", status);
        // No receivers is fine.
        let _ = self.status_tx.send(status);
    }

    /// Supervise until `cancel` fires. The connection is closed on return.
    pub async fn run(
        &self,
        host: &str,
        port: u16,
        ssl: bool,
        token: &str,
        cancel: CancellationToken,
    ) {
        log::info!("[Supervisor] Supervising connection to {}:{}", host, port);

        while !cancel.is_cancelled() {
            match self.run_session(host, port, ssl, token, &cancel).await {
                Ok(()) => log::info!("[Supervisor] Connection lost"),
                Err(e) => log::warn!("[Supervisor] Session ended: {}", e),
            }
            self.connection.close().await;
            self.publish(ConnectionStatus::Disconnected);

            if cancel.is_cancelled() {
                break;
            }
            log::info!(
                "[Supervisor] Reconnecting in {}s",
                self.reconnect_interval.as_secs()
            );
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }

        self.connection.close().await;
        log::info!("[Supervisor] Stopped");
    }

    /// One connection lifetime. Returns when the connection is lost or
    /// `cancel` fires.
    async fn run_session(
        &self,
        host: &str,
        port: u16,
        ssl: bool,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), HassError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(HassError::Cancelled),
            connected = self.connection.connect(host, port, ssl, token, self.fetch_states) => connected?,
        }
        let disconnected = self.connection.disconnect_token().await;

        self.publish(ConnectionStatus::NotReady);
        self.await_ready(&disconnected, cancel).await?;

        if !self.connection.subscribe_to_events(None).await {
            return Err(HassError::Protocol("event subscription failed".into()));
        }
        self.publish(ConnectionStatus::Connected);

        self.forward_events(&disconnected, cancel).await;
        Ok(())
    }

    /// Poll `get_config` until the hub reports it is running.
    async fn await_ready(
        &self,
        disconnected: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<(), HassError> {
        loop {
            match self.connection.get_config().await {
                Ok(config) if config.is_running() => {
                    log::info!("[Supervisor] Hub {} is running", config.version);
                    return Ok(());
                }
                Ok(config) => log::info!("[Supervisor] Hub state {}, waiting", config.state),
                Err(e @ HassError::CommandFailed { .. }) => {
                    log::warn!("[Supervisor] Readiness check failed: {}", e);
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(HassError::Cancelled),
                () = disconnected.cancelled() => return Err(HassError::Cancelled),
                () = tokio::time::sleep(self.ready_poll_interval) => {}
            }
        }
    }

    async fn forward_events(&self, disconnected: &CancellationToken, cancel: &CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = disconnected.cancelled() => return,
                event = self.connection.read_next_event() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    log::debug!("[Supervisor] Event stream ended: {}", e);
                    return;
                }
            };

            let Some(sink) = self.event_sink() else {
                log::trace!("[Supervisor] No event consumer, dropping {}", event.event_type);
                continue;
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = disconnected.cancelled() => return,
                sent = sink.send(event) => {
                    if sent.is_err() {
                        log::debug!("[Supervisor] Event consumer gone, dropping event");
                    }
                }
            }
        }
    }
}
