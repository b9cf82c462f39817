//! PostgreSQL wire protocol client.
//!
//! This crate provides a PostgreSQL client that:
//! - Uses the binary protocol for parameters and results where it can
//! - Caches prepared statements per connection
//! - Supports query pipelining, COPY and LISTEN/NOTIFY
//! - Offers the same engine through async and blocking connection pools
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `transport`: TCP and TLS byte streams, async and blocking
//! - `auth` / `scram`: Startup authentication exchanges
//! - `connection`: Connection state machine and query execution
//! - `types`: PostgreSQL type encoding/decoding
//! - `statement`: Prepared statement cache
//! - `pool`: Async connection pool
//! - `blocking`: Blocking connection and pool
//! - `registry`: One pool per set of connection options

pub mod auth;
pub mod blocking;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod copy;
pub mod error;
pub mod notification;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod scram;
pub mod statement;
pub mod transport;
pub mod types;


pub use config::{CertificateSource, PgConfig, PgPoolConfig, SslMode};
pub use connection::{BackendKey, ConnectionState, PgConnection, PipelineEntry, QueryResult};
pub use copy::CopyOut;
pub use error::{DecodeError, PgError, PgResult, ServerError};
pub use notification::Notification;
pub use pool::{PgPool, PoolStatus, PooledConnection};
pub use protocol::TransactionStatus;
pub use registry::PoolRegistry;
pub use statement::{PreparedStatement, StatementCache};
pub use transport::{BlockingStream, TokioStream, Transport};
pub use types::{Decode, Encode, Oid, PgValue};
