//! Application-wide constants for hass-link.
//!
//! This module centralizes all timeouts, intervals and queue sizes so the
//! protocol engine, transport and supervisor agree on them. Constants are
//! grouped by domain.
//!
//! # Categories
//!
//! - **Timeouts**: socket, handshake, command and close-handshake bounds
//! - **Queues**: bounded capacities for the pump/consumer channels
//! - **Supervisor**: reconnect backoff and readiness polling

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Bound on establishing the TCP/TLS socket and WebSocket upgrade.
pub const SOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on each handshake read (`auth_required`, then `auth_ok`).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a correlated command reply.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a `ping` probe.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a local close waits for the hub's close acknowledgment.
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close` waits for each pump task to exit before abandoning it.
pub const PUMP_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP client request timeout for the REST state API.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause inserted after a malformed inbound message, so a misbehaving peer
/// cannot spin the read pump.
pub const DESERIALIZATION_ERROR_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Queues
// ============================================================================

/// Outbound message queue drained by the write pump.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Event queue between the read pump and `read_next_event`.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Uncorrelated reply queue (handshake messages, `pong`).
pub const REPLY_QUEUE_CAPACITY: usize = 64;

/// Supervisor event stream handed to the application.
pub const SUPERVISOR_EVENT_CAPACITY: usize = 1024;

/// Status broadcast buffer; slow observers see `Lagged` rather than stall.
pub const STATUS_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// Supervisor
// ============================================================================

/// Fixed delay between a disconnect and the next connect attempt.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Spacing between `get_config` polls while waiting for the hub to start.
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Hub state reported by `get_config` once startup has completed.
pub const HUB_RUNNING_STATE: &str = "RUNNING";

// ============================================================================
// Endpoints
// ============================================================================

/// WebSocket API path on the hub.
pub const WEBSOCKET_PATH: &str = "/api/websocket";

/// Default hub port.
pub const DEFAULT_PORT: u16 = 8123;
