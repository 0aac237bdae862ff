//! Bounded worker pools and the keyed pool registry.
//!
//! Pools isolate task classes so saturation in one class never starves
//! another: slow business handlers run on `normal`, latency-sensitive work on
//! `high_priority`, blocking-ish fan-out on `io`.

mod registry;
mod worker;

pub use registry::PoolRegistry;
pub use worker::{PoolConfig, PoolStats, WorkerPool};

/// Pool for latency-sensitive dispatch (auth, heartbeats).
pub const POOL_HIGH_PRIORITY: &str = "high_priority";
/// Default pool for request handlers.
pub const POOL_NORMAL: &str = "normal";
/// Pool for storage/L2 heavy fan-out.
pub const POOL_IO: &str = "io";
