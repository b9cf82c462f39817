//! Blocking API.
//!
//! Runs the same protocol engine as the async API over a `std::net`
//! transport. Every call blocks the current thread until the server has
//! answered; no async runtime is needed.

mod connection;
mod pool;

pub use self::connection::{CopyOut, PgConnection};
pub use self::pool::{PgPool, PooledConnection};
