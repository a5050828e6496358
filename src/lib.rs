//! Platter - async client for a turntable-style real-time service.
//!
//! This crate speaks the service's persistent streaming protocol: a
//! websocket carrying length-prefixed JSON payloads, request/response
//! correlation over that stream, push events fanned out to registered
//! handlers, and a cache that keeps one canonical entity per user, room,
//! and song.
//!
//! # Architecture
//!
//! - **Client** - Facade and session supervisor, owns the connection
//! - **Transport** - Websocket framing plus the HTTP fallback commands
//! - **Coordinator** - Correlation ids and pending-call resolution
//! - **Events / Dispatch** - Wire-command classification and ordered
//!   handler execution
//! - **Entity / Scope** - Canonical entity instances and room membership
//!
//! # Modules
//!
//! - [`client`] - Connect, call, handler registration, room flows
//! - [`transport`] - Wire transports and the HTTP fallback
//! - [`events`] - Event table and payload transforms
//! - [`entity`] - Entity schemas and the identity-preserving cache

pub mod client;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod events;
pub mod frame;
pub mod message;
pub mod scope;
pub mod transport;

// Re-export commonly used types
pub use client::Client;
pub use config::Config;
pub use entity::{Entity, EntityKind};
pub use error::ClientError;
pub use events::{EventKind, Payload};
pub use message::{Inbound, Outbound};
pub use scope::RoomScope;
pub use transport::{Transport, TransportFactory};
