//! Pooled stratum mining client.
//!
//! Pools are driven from a single IO thread by [`pool::PoolManager`]; nonce
//! search runs on worker threads owned by [`dispatch::worker::DispatchEngine`].

pub mod config;
pub mod cpu;
pub mod daemon;
pub mod dispatch;
pub mod pool;
pub mod stratum;
pub mod tracing;
pub mod transport;
pub mod work;
