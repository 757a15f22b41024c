//! # metawire-server
//!
//! Axum HTTP + `WebSocket` server around the metawire protocol engine.
//!
//! - `/api` and `/api/<unit>/<method>` over HTTP, one client per request
//! - `WebSocket` gateway: outbound queue, heartbeat, frame dispatch
//! - Balancer role: random 302 redirect over a port pool
//! - Static files for every other path
//! - Graceful close: stop accepting, close clients, bounded drain

#![deny(unsafe_code)]

pub mod balancer;
pub mod config;
mod http;
pub mod logging;
pub mod server;
pub mod shutdown;
pub mod static_files;
pub mod websocket;

pub use balancer::Balancer;
pub use config::{ConfigError, Role, ServerConfig};
pub use logging::init_subscriber;
pub use server::{MetawireServer, ServerError};
pub use shutdown::{DrainOutcome, ShutdownCoordinator};
pub use static_files::{MemoryFiles, StaticFiles};
