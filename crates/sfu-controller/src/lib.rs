//! SFU Controller Library
//!
//! Control plane of a selective-forwarding media server for group calls:
//!
//! - A pool of media engine workers with least-loaded router placement and
//!   crash supervision
//! - One router per room, created on first use and closed when the room
//!   empties
//! - Per-participant session state (transports, producers, consumers) driven
//!   by a WebSocket signaling protocol
//! - Reconnection grace periods and heartbeat liveness
//!
//! # Architecture
//!
//! ```text
//! signaling (WebSocket) ──▶ SessionHandler ──▶ MediaEngine
//!                               │   │
//!                   LockManager ┘   ├──▶ Registry (rooms, participants, producer index)
//!                                   └──▶ RouterDirectory ──▶ WorkerPool ◀── WorkerSupervisor
//! ```
//!
//! Media forwarding itself runs in engine workers behind the
//! [`engine::MediaEngine`] trait; the controller never touches media
//! packets.
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`controller`] - Wiring and shutdown
//! - [`errors`] - Error types with client error codes
//! - [`session`] - Signaling protocol handler and state machine

pub mod config;
pub mod controller;
pub mod engine;
pub mod errors;
pub mod locks;
pub mod observability;
pub mod registry;
pub mod routers;
pub mod session;
pub mod signaling;
pub mod store;
pub mod system_info;
pub mod workers;
