//! Data middleware - multi-tenant game data gateway.
//!
//! A single node accepts client traffic over two wire surfaces (a
//! length-prefixed binary TCP protocol and an HTTP/JSON API), routes each
//! request to the owning game's handler, serves reads through a two-level
//! cache in front of the backing store, and schedules non-critical follow-up
//! work on a prioritized in-memory queue.
//!
//! ## Subsystems
//!
//! - **protocol / session / server**: wire codec, per-connection lifecycle,
//!   accept loops
//! - **dispatch / auth / handlers**: the routing fabric shared by both
//!   surfaces, JWT gating, per-game business handlers
//! - **pool / queue**: bounded worker pools with adaptive capacity, and the
//!   strict-priority async task queue
//! - **cache / storage**: sharded L1 (see `middleware-cache-core`), breaker-
//!   guarded L2, read-through composition with singleflight and negative
//!   caching

pub mod auth;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod routes;
pub mod server;
pub mod session;
pub mod storage;
pub mod types;

pub use config::Args;
pub use server::AppState;
pub use types::{MiddlewareError, Result};
