//! Byte transports underneath the protocol engine.
//!
//! [`PgConnection`](crate::connection::PgConnection) is written once against
//! [`Transport`]. [`TokioStream`] suspends at every call; [`BlockingStream`]
//! performs ordinary blocking socket I/O inside the same `async fn`s, so its
//! futures always complete on first poll and can be driven with
//! `futures::executor::block_on`.

use std::future::Future;

use crate::config::PgConfig;
use crate::error::{PgError, PgResult};

mod asynchronous;
mod blocking;
mod tls;

pub use self::asynchronous::TokioStream;
pub use self::blocking::BlockingStream;

/// A connected byte stream to a PostgreSQL server.
pub trait Transport: Sized + Send {
    /// Open a TCP connection within `config.connect_timeout` and negotiate
    /// TLS according to `config.ssl_mode`.
    fn connect(config: &PgConfig) -> impl Future<Output = PgResult<Self>> + Send;

    /// Read whatever is available, at least one byte. `Ok(0)` means EOF.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = PgResult<usize>> + Send;

    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = PgResult<()>> + Send;

    fn flush(&mut self) -> impl Future<Output = PgResult<()>> + Send;

    /// Close the write side (sending TLS close_notify where applicable).
    fn shutdown(&mut self) -> impl Future<Output = PgResult<()>> + Send;

    /// Whether TLS was negotiated.
    fn is_tls(&self) -> bool;

    /// Fill `buf` completely.
    fn read_exact(&mut self, buf: &mut [u8]) -> impl Future<Output = PgResult<()>> + Send {
        async move {
            let mut filled = 0;
            while filled < buf.len() {
                let n = self.read(&mut buf[filled..]).await?;
                if n == 0 {
                    return Err(PgError::ConnectionClosed);
                }
                filled += n;
            }
            Ok(())
        }
    }
}

/// What the server answered to an SSLRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SslResponse {
    Accepted,
    Declined,
}

impl SslResponse {
    fn from_byte(b: u8) -> PgResult<Self> {
        match b {
            b'S' => Ok(SslResponse::Accepted),
            b'N' => Ok(SslResponse::Declined),
            // An ErrorResponse here means a pre-7.0 server or a non-PostgreSQL peer
            other => Err(PgError::unexpected(other, "negotiating SSL")),
        }
    }
}

/// Decide what to do after the server declined TLS.
fn declined(config: &PgConfig) -> PgResult<()> {
    if config.ssl_mode.requires_tls() {
        return Err(PgError::Tls(format!(
            "server at {} does not support TLS (sslmode {:?})",
            config.address(),
            config.ssl_mode
        )));
    }
    tracing::debug!(address = %config.address(), "server declined TLS, continuing in plaintext");
    Ok(())
}
