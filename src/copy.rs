//! COPY sub-protocol.
//!
//! `COPY ... FROM STDIN` streams caller-supplied chunks to the server;
//! `COPY ... TO STDOUT` hands back a lazy reader over the server's chunks.

use std::fmt::Display;

use bytes::Bytes;
use futures::{pin_mut, Stream, StreamExt};
use tracing::debug;

use crate::connection::{parse_rows_affected, PgConnection, QueryResult};
use crate::error::{PgError, PgResult};
use crate::protocol::{BackendMessage, FrontendMessage};
use crate::transport::Transport;

/// Buffered CopyData is written out once it grows past this many bytes.
const COPY_FLUSH_THRESHOLD: usize = 64 * 1024;

/// COPY direction a statement was expected to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Out,
}

impl Direction {
    fn usage_error(self) -> PgError {
        PgError::Usage(match self {
            Direction::In => "statement did not start COPY FROM STDIN".to_string(),
            Direction::Out => "statement did not start COPY TO STDOUT".to_string(),
        })
    }
}

impl<S: Transport> PgConnection<S> {
    /// Run `COPY ... FROM STDIN` and stream `source` to the server.
    ///
    /// Each item becomes one CopyData message. If the source yields an
    /// error the copy is aborted with CopyFail carrying its text and the
    /// server's resulting error is returned. On success `rows_affected` is
    /// the number of rows copied.
    pub async fn copy_in<St, B, E>(&mut self, sql: &str, source: St) -> PgResult<QueryResult>
    where
        St: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let result = self.copy_in_inner(sql, source).await;
        self.check(result)
    }

    async fn copy_in_inner<St, B, E>(&mut self, sql: &str, source: St) -> PgResult<QueryResult>
    where
        St: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        self.start_copy(sql, Direction::In).await?;

        pin_mut!(source);
        let mut failure = None;
        let mut chunks = 0usize;
        while let Some(item) = source.next().await {
            match item {
                Ok(chunk) => {
                    self.buffer(FrontendMessage::CopyData {
                        data: chunk.as_ref(),
                    })?;
                    chunks += 1;
                    if self.buffered_len() >= COPY_FLUSH_THRESHOLD {
                        self.flush().await?;
                    }
                }
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        match &failure {
            Some(message) => {
                debug!(conn = %self.id(), %message, "aborting COPY FROM STDIN");
                self.buffer(FrontendMessage::CopyFail { message })?;
            }
            None => self.buffer(FrontendMessage::CopyDone)?,
        }
        self.flush().await?;
        debug!(conn = %self.id(), chunks, "COPY data sent");

        self.finish_copy().await
    }

    /// Run `COPY ... TO STDOUT` and return a reader over the data.
    ///
    /// The reader borrows the connection until it is exhausted.
    pub async fn copy_out(&mut self, sql: &str) -> PgResult<CopyOut<'_, S>> {
        let result = self.start_copy(sql, Direction::Out).await;
        self.check(result)?;
        Ok(CopyOut {
            conn: self,
            command_tag: None,
            error: None,
            done: false,
        })
    }

    /// Send the COPY statement and wait for the server to enter copy mode.
    async fn start_copy(&mut self, sql: &str, direction: Direction) -> PgResult<()> {
        self.ensure_ready()?;
        self.buffer(FrontendMessage::Query { query: sql })?;
        self.set_waiting(true);
        self.flush().await?;

        let error = match self.receive().await? {
            BackendMessage::CopyInResponse { .. } if direction == Direction::In => return Ok(()),
            BackendMessage::CopyOutResponse { .. } if direction == Direction::Out => {
                return Ok(())
            }
            BackendMessage::CopyInResponse { .. } => {
                self.send(FrontendMessage::CopyFail {
                    message: "expected COPY TO STDOUT",
                })
                .await?;
                direction.usage_error()
            }
            BackendMessage::ErrorResponse(err) => PgError::Server(err),
            BackendMessage::ReadyForQuery { .. } => {
                self.end_cycle().await?;
                return Err(direction.usage_error());
            }
            BackendMessage::CopyBothResponse { .. } => {
                return Err(PgError::unexpected(b'W', "starting COPY"));
            }
            _ => direction.usage_error(),
        };

        // Anything else: let the statement run to completion and report it
        self.drain_until_ready().await?;
        self.end_cycle().await?;
        Err(error)
    }

    /// Read CommandComplete/ErrorResponse and ReadyForQuery ending a COPY.
    async fn finish_copy(&mut self) -> PgResult<QueryResult> {
        let mut result = QueryResult {
            columns: Default::default(),
            rows: Vec::new(),
            command_tag: String::new(),
            rows_affected: 0,
        };
        let mut error = None;

        loop {
            match self.receive().await? {
                BackendMessage::CommandComplete { tag } => {
                    result.rows_affected = parse_rows_affected(&tag);
                    result.command_tag = tag;
                }
                BackendMessage::ErrorResponse(err) => {
                    error.get_or_insert(PgError::Server(err));
                }
                BackendMessage::ReadyForQuery { .. } => break,
                other => return Err(PgError::unexpected(other.tag(), "finishing COPY")),
            }
        }

        self.end_cycle().await?;
        match error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }
}

/// Reader over the output of `COPY ... TO STDOUT`.
///
/// Finite and not restartable. Dropping it before the end leaves the
/// connection mid-cycle; it then refuses further requests and a pool
/// disposes of it.
pub struct CopyOut<'a, S: Transport> {
    conn: &'a mut PgConnection<S>,
    command_tag: Option<String>,
    error: Option<PgError>,
    done: bool,
}

impl<'a, S: Transport> CopyOut<'a, S> {
    /// The next CopyData payload, or `None` once the copy is complete.
    pub async fn next_chunk(&mut self) -> PgResult<Option<Bytes>> {
        let result = self.read_chunk().await;
        self.conn.check(result)
    }

    async fn read_chunk(&mut self) -> PgResult<Option<Bytes>> {
        while !self.done {
            match self.conn.receive().await? {
                BackendMessage::CopyData(data) => return Ok(Some(data)),
                BackendMessage::CopyDone => {}
                BackendMessage::CommandComplete { tag } => self.command_tag = Some(tag),
                BackendMessage::ErrorResponse(err) => {
                    self.error.get_or_insert(PgError::Server(err));
                }
                BackendMessage::ReadyForQuery { .. } => {
                    self.done = true;
                    self.conn.end_cycle().await?;
                }
                other => return Err(PgError::unexpected(other.tag(), "reading COPY data")),
            }
        }

        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Whether the server has finished the copy.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Rows copied, known once the reader is exhausted.
    pub fn rows_affected(&self) -> Option<u64> {
        self.command_tag.as_deref().map(parse_rows_affected)
    }

    /// Read and discard the remaining data, returning the row count.
    pub async fn finish(mut self) -> PgResult<u64> {
        while self.next_chunk().await?.is_some() {}
        Ok(self.rows_affected().unwrap_or(0))
    }

    /// Adapt into a `Stream` of chunks.
    pub fn into_stream(self) -> impl Stream<Item = PgResult<Bytes>> + 'a {
        futures::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
