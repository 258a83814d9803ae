//! # agora-hub — Room-based WebSocket broadcast hub
//!
//! Clients connect to a named room; every text message one client sends is
//! fanned out to the other members of that room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  WebSocket   ┌─────────────┐   join/leave   ┌──────────────┐
//! │ Client      │ ◄──────────► │ HubServer   │ ─────────────► │ RoomRegistry │
//! │ (per user)  │  text frames │ (per conn:  │                │ name → Room  │
//! └─────────────┘              │  reader +   │                └──────┬───────┘
//!                              │  writer)    │                       │
//!                              └──────┬──────┘                       ▼
//!                                     │  handle_inbound       ┌─────────────┐
//!                                     └─────────────────────► │ Room        │
//!                                                             │ (fan-out)   │
//!                                                             └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Classification of inbound frames and outbound framing
//! - [`connection`] — Per-connection send capability handed to rooms
//! - [`room`] — Membership and ordered fan-out for one room
//! - [`registry`] — Room name → room directory with lazy creation
//! - [`server`] — WebSocket server routing request paths to rooms
//! - [`config`] — Hub and server configuration

pub mod config;
pub mod connection;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use config::{ConfigError, HubConfig, ServerConfig};
pub use connection::{ChannelSink, ConnectionId, MessageSink, SendError};
pub use protocol::{Delivery, Inbound, ProtocolError};
pub use registry::RoomRegistry;
pub use room::{DispatchReport, MemberInfo, Room, RoomStats, SessionId};
pub use server::{room_name_from_path, HubServer, ServerError, ServerStats};
