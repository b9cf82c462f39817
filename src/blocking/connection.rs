//! Blocking connection facade.

use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use futures::executor::block_on;
use uuid::Uuid;

use crate::config::PgConfig;
use crate::connection::{self, BackendKey, PipelineEntry, QueryResult};
use crate::copy;
use crate::error::PgResult;
use crate::notification::Notification;
use crate::protocol::TransactionStatus;
use crate::statement::{PreparedStatement, StatementCache};
use crate::transport::BlockingStream;
use crate::types::{Oid, PgValue};

type Engine = connection::PgConnection<BlockingStream>;

/// A PostgreSQL connection with blocking methods.
///
/// `BlockingStream` never returns `Pending`, so `block_on` drives each
/// operation to completion on the calling thread.
#[derive(Debug)]
pub struct PgConnection {
    inner: Engine,
}

impl PgConnection {
    pub fn connect(config: PgConfig) -> PgResult<Self> {
        block_on(Engine::connect(config)).map(|inner| Self { inner })
    }

    pub fn connect_url(url: &str) -> PgResult<Self> {
        Self::connect(PgConfig::from_url(url)?)
    }

    pub fn simple_query(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        block_on(self.inner.simple_query(sql))
    }

    pub fn query(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        block_on(self.inner.query(sql, params))
    }

    pub fn prepare(&mut self, sql: &str, param_types: &[Oid]) -> PgResult<Arc<PreparedStatement>> {
        block_on(self.inner.prepare(sql, param_types))
    }

    pub fn execute(
        &mut self,
        statement: &Arc<PreparedStatement>,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        block_on(self.inner.execute(statement, params))
    }

    pub fn pipeline(
        &mut self,
        entries: &[PipelineEntry<'_>],
        sync_all: bool,
    ) -> PgResult<Vec<QueryResult>> {
        block_on(self.inner.pipeline(entries, sync_all))
    }

    pub fn begin(&mut self) -> PgResult<()> {
        block_on(self.inner.begin())
    }

    pub fn commit(&mut self) -> PgResult<()> {
        block_on(self.inner.commit())
    }

    pub fn rollback(&mut self) -> PgResult<()> {
        block_on(self.inner.rollback())
    }

    /// Run `COPY ... FROM STDIN` with chunks from `source`.
    pub fn copy_in<I, B, E>(&mut self, sql: &str, source: I) -> PgResult<QueryResult>
    where
        I: IntoIterator<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        block_on(
            self.inner
                .copy_in(sql, futures::stream::iter(source)),
        )
    }

    /// Run `COPY ... TO STDOUT`; the returned iterator yields each chunk.
    pub fn copy_out(&mut self, sql: &str) -> PgResult<CopyOut<'_>> {
        block_on(self.inner.copy_out(sql)).map(|inner| CopyOut { inner })
    }

    pub fn listen(&mut self, channel: &str) -> PgResult<()> {
        block_on(self.inner.listen(channel))
    }

    pub fn unlisten(&mut self, channel: &str) -> PgResult<()> {
        block_on(self.inner.unlisten(channel))
    }

    pub fn unlisten_all(&mut self) -> PgResult<()> {
        block_on(self.inner.unlisten_all())
    }

    pub fn notify(&mut self, channel: &str, payload: &str) -> PgResult<()> {
        block_on(self.inner.notify(channel, payload))
    }

    /// Block until a notification arrives.
    pub fn receive_notification(&mut self) -> PgResult<Notification> {
        block_on(self.inner.receive_notification())
    }

    pub fn try_receive_notification(&mut self) -> Option<Notification> {
        self.inner.try_receive_notification()
    }

    pub fn close(&mut self) -> PgResult<()> {
        block_on(self.inner.close())
    }

    pub fn validate(&mut self) -> bool {
        block_on(self.inner.validate())
    }

    pub fn is_reusable(&self) -> bool {
        self.inner.is_reusable()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn is_waiting(&self) -> bool {
        self.inner.is_waiting()
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.inner.transaction_status()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    pub fn config(&self) -> &PgConfig {
        self.inner.config()
    }

    pub fn backend_key(&self) -> Option<BackendKey> {
        self.inner.backend_key()
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.inner.parameter(name)
    }

    pub fn is_tls(&self) -> bool {
        self.inner.is_tls()
    }

    pub fn statement_cache(&self) -> &StatementCache {
        self.inner.statement_cache()
    }
}

/// Iterator over the output of `COPY ... TO STDOUT`.
///
/// Dropping it early reads and discards the rest so the connection stays
/// usable.
pub struct CopyOut<'a> {
    inner: copy::CopyOut<'a, BlockingStream>,
}

impl CopyOut<'_> {
    /// Rows copied, known once the iterator is exhausted.
    pub fn rows_affected(&self) -> Option<u64> {
        self.inner.rows_affected()
    }
}

impl Iterator for CopyOut<'_> {
    type Item = PgResult<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        block_on(self.inner.next_chunk()).transpose()
    }
}

impl Drop for CopyOut<'_> {
    fn drop(&mut self) {
        while !self.inner.is_done() {
            if block_on(self.inner.next_chunk()).is_err() {
                break;
            }
        }
    }
}
