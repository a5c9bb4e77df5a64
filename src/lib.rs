//! Client for a home-automation hub's WebSocket API.
//!
//! One persistent socket carries the auth handshake, id-correlated
//! command/response pairs and subscribed events. A supervisor keeps the
//! socket alive across hub restarts and network failures.
//!
//! # Architecture
//!
//! ```text
//!   ConnectionSupervisor ──► HassConnection ──► Transport ──► socket
//!          │                      ▲    ▲            │
//!          │ status / events      │    │            ▼
//!          ▼                      │    └──────── Router ──► event / reply queues
//!      consumers            PendingTable, StateCache
//! ```
//!
//! # Modules
//!
//! - [`ws`] - Socket seam and the tokio-tungstenite implementation
//! - [`transport`] - Read/write pumps, fragment reassembly, close handshake
//! - [`router`] - Inbound classification and reply correlation
//! - [`connection`] - Handshake and the public command surface
//! - [`supervisor`] - Reconnect, readiness polling and status stream
//! - [`api`] - REST client for single-entity reads and writes
//! - [`config`] - Configuration loading/saving

pub mod api;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod messages;
pub mod router;
pub mod supervisor;
pub mod transport;
pub mod ws;

#[cfg(test)]
mod fake_hub;

// Re-export commonly used types
pub use api::HassApi;
pub use config::Config;
pub use connection::{ConnectionState, ConnectionStatus, HassConnection};
pub use error::HassError;
pub use messages::{
    Command, CommandReply, CommandResult, EntityState, EventData, HassConfig, HassEvent,
    StateValue,
};
pub use supervisor::ConnectionSupervisor;
pub use ws::{SocketFactory, TungsteniteSocketFactory};
