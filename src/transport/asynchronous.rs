//! Tokio transport.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{declined, tls, SslResponse, Transport};
use crate::buffer::WriteBuffer;
use crate::config::PgConfig;
use crate::error::{PgError, PgResult};
use crate::protocol::FrontendMessage;

/// A tokio TCP stream, optionally wrapped in TLS.
#[derive(Debug)]
pub enum TokioStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl TokioStream {
    async fn negotiate_tls(mut tcp: TcpStream, config: &PgConfig) -> PgResult<Self> {
        let mut buf = WriteBuffer::new();
        FrontendMessage::SslRequest.encode(&mut buf)?;
        tcp.write_all(buf.as_slice()).await?;
        tcp.flush().await?;

        // we expect back either `S` or `N` as a single byte.
        let mut res = [0u8; 1];
        tcp.read_exact(&mut res).await?;

        match SslResponse::from_byte(res[0])? {
            SslResponse::Declined => {
                declined(config)?;
                Ok(TokioStream::Plain(tcp))
            }
            SslResponse::Accepted => {
                let connector = TlsConnector::from(tls::client_config(config)?);
                let stream = connector
                    .connect(tls::server_name(&config.host)?, tcp)
                    .await
                    .map_err(|e| PgError::Tls(e.to_string()))?;
                debug!(address = %config.address(), "TLS established");
                Ok(TokioStream::Tls(Box::new(stream)))
            }
        }
    }
}

impl Transport for TokioStream {
    async fn connect(config: &PgConfig) -> PgResult<Self> {
        let address = config.address();
        let tcp = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| PgError::ConnectTimeout(address.clone()))??;
        tcp.set_nodelay(true)?;
        debug!(%address, "TCP connected");

        if config.ssl_mode.attempts_tls() {
            Self::negotiate_tls(tcp, config).await
        } else {
            Ok(TokioStream::Plain(tcp))
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> PgResult<usize> {
        let n = match self {
            TokioStream::Plain(s) => s.read(buf).await?,
            TokioStream::Tls(s) => s.read(buf).await?,
        };
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> PgResult<()> {
        match self {
            TokioStream::Plain(s) => s.write_all(buf).await?,
            TokioStream::Tls(s) => s.write_all(buf).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> PgResult<()> {
        match self {
            TokioStream::Plain(s) => s.flush().await?,
            TokioStream::Tls(s) => s.flush().await?,
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> PgResult<()> {
        match self {
            TokioStream::Plain(s) => s.shutdown().await?,
            TokioStream::Tls(s) => s.shutdown().await?,
        }
        Ok(())
    }

    fn is_tls(&self) -> bool {
        matches!(self, TokioStream::Tls(_))
    }
}
