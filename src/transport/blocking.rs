//! Blocking `std::net` transport.
//!
//! The `async fn`s below never suspend; every call blocks the current thread
//! until the socket operation finishes.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use rustls::{ClientConnection, StreamOwned};
use tracing::debug;

use super::{declined, tls, SslResponse, Transport};
use crate::buffer::WriteBuffer;
use crate::config::PgConfig;
use crate::error::{PgError, PgResult};
use crate::protocol::FrontendMessage;

/// A std TCP stream, optionally wrapped in TLS.
#[derive(Debug)]
pub enum BlockingStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl BlockingStream {
    fn connect_tcp(config: &PgConfig) -> PgResult<TcpStream> {
        let address = config.address();
        let mut last_err = None;

        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(tcp) => {
                    tcp.set_nodelay(true)?;
                    debug!(%address, %addr, "TCP connected");
                    return Ok(tcp);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) if e.kind() == io::ErrorKind::TimedOut => PgError::ConnectTimeout(address),
            Some(e) => PgError::Io(e),
            None => PgError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{address} did not resolve to any address"),
            )),
        })
    }

    fn negotiate_tls(mut tcp: TcpStream, config: &PgConfig) -> PgResult<Self> {
        let mut buf = WriteBuffer::new();
        FrontendMessage::SslRequest.encode(&mut buf)?;
        tcp.write_all(buf.as_slice())?;
        tcp.flush()?;

        let mut res = [0u8; 1];
        tcp.read_exact(&mut res)?;

        match SslResponse::from_byte(res[0])? {
            SslResponse::Declined => {
                declined(config)?;
                Ok(BlockingStream::Plain(tcp))
            }
            SslResponse::Accepted => {
                let conn =
                    ClientConnection::new(tls::client_config(config)?, tls::server_name(&config.host)?)
                        .map_err(|e| PgError::Tls(e.to_string()))?;
                let mut stream = StreamOwned::new(conn, tcp);
                // Drive the handshake now so failures surface from connect
                while stream.conn.is_handshaking() {
                    stream
                        .conn
                        .complete_io(&mut stream.sock)
                        .map_err(|e| PgError::Tls(e.to_string()))?;
                }
                debug!(address = %config.address(), "TLS established");
                Ok(BlockingStream::Tls(Box::new(stream)))
            }
        }
    }
}

impl Transport for BlockingStream {
    async fn connect(config: &PgConfig) -> PgResult<Self> {
        let tcp = Self::connect_tcp(config)?;
        if config.ssl_mode.attempts_tls() {
            Self::negotiate_tls(tcp, config)
        } else {
            Ok(BlockingStream::Plain(tcp))
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> PgResult<usize> {
        let n = match self {
            BlockingStream::Plain(s) => s.read(buf)?,
            BlockingStream::Tls(s) => s.read(buf)?,
        };
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> PgResult<()> {
        match self {
            BlockingStream::Plain(s) => s.write_all(buf)?,
            BlockingStream::Tls(s) => s.write_all(buf)?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> PgResult<()> {
        match self {
            BlockingStream::Plain(s) => s.flush()?,
            BlockingStream::Tls(s) => s.flush()?,
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> PgResult<()> {
        let sock = match self {
            BlockingStream::Plain(s) => s,
            BlockingStream::Tls(s) => {
                s.conn.send_close_notify();
                s.flush()?;
                &mut s.sock
            }
        };
        match sock.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, BlockingStream::Tls(_))
    }
}
