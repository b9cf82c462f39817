//! PostgreSQL connection implementation.
//!
//! This module provides the protocol engine that handles:
//! - Startup and authentication
//! - Simple and extended query protocols, including pipelining
//! - Prepared statement management
//! - LISTEN/NOTIFY delivery
//!
//! The engine is written once against [`Transport`]; see
//! [`crate::blocking::PgConnection`] for the blocking facade.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::buffer::WriteBuffer;
use crate::config::PgConfig;
use crate::error::{DecodeError, PgError, PgResult, ServerError};
use crate::notification::{quote_identifier, quote_literal, Notification, NotificationQueue};
use crate::protocol::{
    BackendMessage, FieldDescription, Format, FrontendMessage, RawMessage, Target,
    TransactionStatus,
};
use crate::statement::{PreparedStatement, SharedColumns, StatementCache};
use crate::transport::{TokioStream, Transport};
use crate::types::{Decode, Oid, PgValue};

/// Bytes requested from the transport per read.
const READ_CHUNK: usize = 8192;

// ============================================================================
// Query Result
// ============================================================================

/// Result of one executed statement.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Column descriptions, shared with the prepared statement.
    pub columns: SharedColumns,
    pub rows: Vec<Vec<PgValue>>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
    /// Count parsed from the command tag, 0 when it carries none.
    pub rows_affected: u64,
}

impl QueryResult {
    fn new(columns: SharedColumns) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            command_tag: String::new(),
            rows_affected: 0,
        }
    }

    fn empty() -> Self {
        Self::new(Arc::new(Vec::new()))
    }

    fn complete(&mut self, tag: String) {
        self.rows_affected = parse_rows_affected(&tag);
        self.command_tag = tag;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Decode the value at (`row`, `column`) into `T`.
    pub fn get<T: Decode>(&self, row: usize, column: usize) -> PgResult<T> {
        let value = self
            .rows
            .get(row)
            .and_then(|r| r.get(column))
            .ok_or_else(|| {
                PgError::Usage(format!(
                    "no value at row {row}, column {column} ({} rows)",
                    self.rows.len()
                ))
            })?;

        T::decode(value).map_err(|reason| {
            let (oid, name) = self
                .columns
                .get(column)
                .map(|c| (c.type_oid, c.name.clone()))
                .unwrap_or((value.type_oid(), column.to_string()));
            PgError::Decode(DecodeError {
                oid,
                type_name: oid.name(),
                target: std::any::type_name::<T>(),
                column: name,
                reason,
            })
        })
    }

    /// Like [`get`](Self::get), addressing the column by name.
    pub fn get_by_name<T: Decode>(&self, row: usize, column: &str) -> PgResult<T> {
        let index = self
            .column_index(column)
            .ok_or_else(|| PgError::Usage(format!("no column named {column:?}")))?;
        self.get(row, index)
    }
}

/// Extract the row count from a command tag ("INSERT 0 5", "COPY 3", "BEGIN").
pub fn parse_rows_affected(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

// ============================================================================
// Pipelining
// ============================================================================

/// One statement of a [`PgConnection::pipeline`] batch.
#[derive(Debug, Clone, Copy)]
pub struct PipelineEntry<'a> {
    pub sql: &'a str,
    pub params: &'a [PgValue],
}

impl<'a> PipelineEntry<'a> {
    pub fn new(sql: &'a str, params: &'a [PgValue]) -> Self {
        Self { sql, params }
    }
}

/// Which statement an Execute refers to.
enum StatementRef {
    Known(Arc<PreparedStatement>),
    /// Index into the statements parsed by the current batch.
    New(usize),
}

/// A response group the server owes us, in submission order.
enum Expect {
    /// ParseComplete, ParameterDescription, RowDescription | NoData.
    Prepare(usize),
    /// BindComplete, DataRow*, CommandComplete | EmptyQueryResponse.
    Execute(StatementRef),
    /// ReadyForQuery.
    Sync,
}

// ============================================================================
// Connection
// ============================================================================

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Ready,
    Closed,
}

/// Process id and secret key identifying the backend, as needed by a
/// CancelRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

/// A PostgreSQL connection over transport `S`.
///
/// Not safe for concurrent use; every protocol operation takes `&mut self`.
/// Any fatal error (I/O, framing, protocol violation, FATAL server error)
/// marks the connection closed.
pub struct PgConnection<S: Transport = TokioStream> {
    id: Uuid,
    stream: S,
    config: PgConfig,
    statement_cache: StatementCache,
    notifications: NotificationQueue,
    transaction_status: TransactionStatus,
    state: ConnectionState,
    backend_key: Option<BackendKey>,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    write_buffer: WriteBuffer,
    read_buffer: BytesMut,
    /// Statements evicted from the cache, closed once the current cycle ends.
    pending_closes: Vec<String>,
    /// A request cycle is outstanding.
    waiting: bool,
}

impl<S: Transport> PgConnection<S> {
    /// Connect to a PostgreSQL server using a connection URL.
    pub async fn connect_url(url: &str) -> PgResult<Self> {
        Self::connect(PgConfig::from_url(url)?).await
    }

    /// Open the transport, authenticate and wait until the server is ready.
    pub async fn connect(config: PgConfig) -> PgResult<Self> {
        config.validate()?;
        let stream = S::connect(&config).await?;
        let mut conn = Self::new(stream, config);

        match conn.startup().await {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.state = ConnectionState::Closed;
                let _ = conn.stream.shutdown().await;
                Err(e)
            }
        }
    }

    fn new(stream: S, config: PgConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream,
            statement_cache: StatementCache::new(config.statement_cache_capacity),
            config,
            notifications: NotificationQueue::new(),
            transaction_status: TransactionStatus::Idle,
            state: ConnectionState::Connecting,
            backend_key: None,
            parameters: HashMap::new(),
            write_buffer: WriteBuffer::new(),
            read_buffer: BytesMut::with_capacity(READ_CHUNK * 4),
            pending_closes: Vec::new(),
            waiting: false,
        }
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self) -> PgResult<()> {
        self.state = ConnectionState::Authenticating;

        let mut params: Vec<(&str, &str)> = vec![
            ("user", self.config.user.as_str()),
            ("database", self.config.database.as_str()),
            ("client_encoding", "UTF8"),
        ];
        if let Some(name) = &self.config.application_name {
            params.push(("application_name", name.as_str()));
        }
        params.extend(
            self.config
                .options
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        FrontendMessage::Startup { params: &params }.encode(&mut self.write_buffer)?;
        self.flush().await.map_err(PgError::into_auth)?;

        let mut auth = Authenticator::new(&self.config.user, self.config.password.as_deref());
        while !auth.is_done() {
            let msg = self.read_message().await.map_err(PgError::into_auth)?;
            if let Some(response) = auth.step(msg)? {
                response
                    .as_message()
                    .encode(&mut self.write_buffer)
                    .map_err(PgError::into_auth)?;
                self.flush().await.map_err(PgError::into_auth)?;
            }
        }
        debug!(conn = %self.id, method = auth.method(), "authenticated");

        loop {
            let msg = self.read_message().await?;
            let Some(msg) = self.handle_async(msg) else {
                continue;
            };
            match msg {
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_key = Some(BackendKey {
                        process_id,
                        secret_key,
                    });
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    self.state = ConnectionState::Ready;
                    info!(
                        conn = %self.id,
                        address = %self.config.address(),
                        pid = ?self.backend_key.map(|k| k.process_id),
                        tls = self.stream.is_tls(),
                        "connection ready"
                    );
                    return Ok(());
                }
                BackendMessage::ErrorResponse(err) => {
                    return Err(PgError::CouldNotInitializeConnection {
                        message: err.to_string(),
                        source: Some(Box::new(PgError::Server(err))),
                    });
                }
                other => return Err(PgError::unexpected(other.tag(), "starting up")),
            }
        }
    }

    // ========================================================================
    // Simple query protocol
    // ========================================================================

    /// Execute one or more `;`-separated statements with the simple query
    /// protocol (text format).
    ///
    /// Returns one result per statement. If a statement fails, the server
    /// skips the rest and the error is returned.
    pub async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        let result = self.simple_query_inner(sql).await;
        self.check(result)
    }

    async fn simple_query_inner(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.ensure_ready()?;
        self.buffer(FrontendMessage::Query { query: sql })?;
        self.waiting = true;
        self.flush().await?;

        let mut results = Vec::new();
        let mut current = QueryResult::empty();
        let mut error: Option<PgError> = None;

        loop {
            match self.receive().await? {
                BackendMessage::RowDescription { fields } => {
                    current = QueryResult::new(Arc::new(fields));
                }
                BackendMessage::DataRow { values } => {
                    match decode_row(&values, &current.columns, Format::Text) {
                        Ok(row) => current.rows.push(row),
                        Err(e) => {
                            error.get_or_insert(e);
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => {
                    current.complete(tag);
                    results.push(std::mem::replace(&mut current, QueryResult::empty()));
                }
                BackendMessage::EmptyQueryResponse => results.push(QueryResult::empty()),
                BackendMessage::CopyInResponse { .. } => {
                    self.send(FrontendMessage::CopyFail {
                        message: "COPY FROM STDIN must be run with copy_in",
                    })
                    .await?;
                    error.get_or_insert(PgError::Usage(
                        "COPY FROM STDIN must be run with copy_in".to_string(),
                    ));
                }
                BackendMessage::CopyOutResponse { .. } => {
                    error.get_or_insert(PgError::Usage(
                        "COPY TO STDOUT must be run with copy_out".to_string(),
                    ));
                }
                BackendMessage::CopyData(_) | BackendMessage::CopyDone => {}
                BackendMessage::ErrorResponse(err) => {
                    error.get_or_insert(PgError::Server(err));
                }
                BackendMessage::ReadyForQuery { .. } => break,
                other => return Err(PgError::unexpected(other.tag(), "running a simple query")),
            }
        }

        self.end_cycle().await?;
        match error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    // ========================================================================
    // Extended query protocol
    // ========================================================================

    /// Execute a query with the extended protocol (binary format).
    ///
    /// The statement is prepared once and cached for later calls.
    pub async fn query(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let mut results = self
            .pipeline(&[PipelineEntry::new(sql, params)], true)
            .await?;
        results
            .pop()
            .ok_or_else(|| PgError::Protocol("query produced no result".to_string()))
    }

    /// Execute a previously prepared statement.
    pub async fn execute(
        &mut self,
        statement: &Arc<PreparedStatement>,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        let batch = [(
            PipelineEntry::new(&statement.query, params),
            Some(Arc::clone(statement)),
        )];
        let result = self.run_batch(&batch, true).await;
        let mut results = self.check(result)?;
        results
            .pop()
            .ok_or_else(|| PgError::Protocol("execute produced no result".to_string()))
    }

    /// Send every statement before reading any response.
    ///
    /// With `sync_all` one Sync follows the whole batch, so the statements
    /// share one implicit transaction and the first failure aborts the rest.
    /// Otherwise each statement gets its own Sync and fails independently.
    /// Results come back in submission order; the first error is returned
    /// once every response has been read.
    pub async fn pipeline(
        &mut self,
        entries: &[PipelineEntry<'_>],
        sync_all: bool,
    ) -> PgResult<Vec<QueryResult>> {
        let batch: Vec<_> = entries.iter().map(|e| (*e, None)).collect();
        let result = self.run_batch(&batch, sync_all).await;
        self.check(result)
    }

    /// Prepare `sql`, or return the cached statement for it.
    ///
    /// `param_types` may be shorter than the number of placeholders; the
    /// server infers the rest.
    pub async fn prepare(
        &mut self,
        sql: &str,
        param_types: &[Oid],
    ) -> PgResult<Arc<PreparedStatement>> {
        let result = self.prepare_inner(sql, param_types).await;
        self.check(result)
    }

    async fn prepare_inner(
        &mut self,
        sql: &str,
        param_types: &[Oid],
    ) -> PgResult<Arc<PreparedStatement>> {
        self.ensure_ready()?;
        if let Some(cached) = self.statement_cache.get(sql) {
            return Ok(cached);
        }

        let mut stmt = PreparedStatement::new(self.statement_cache.next_statement_id(), sql.to_string());
        stmt.set_param_types(param_types.to_vec());
        self.buffer(FrontendMessage::Parse {
            name: &stmt.name,
            query: sql,
            param_types,
        })?;
        self.buffer(FrontendMessage::Describe {
            target: Target::Statement,
            name: &stmt.name,
        })?;
        self.buffer(FrontendMessage::Sync)?;
        self.waiting = true;
        self.flush().await?;

        let outcome = self.read_prepare(&mut stmt).await?;
        self.read_ready().await?;
        if let Err(e) = outcome {
            self.end_cycle().await?;
            return Err(e);
        }

        let stmt = Arc::new(stmt);
        self.cache_statement(PreparedStatement::clone(&stmt));
        self.end_cycle().await?;
        Ok(stmt)
    }

    async fn run_batch(
        &mut self,
        batch: &[(PipelineEntry<'_>, Option<Arc<PreparedStatement>>)],
        sync_all: bool,
    ) -> PgResult<Vec<QueryResult>> {
        self.ensure_ready()?;

        let mut parsed: Vec<PreparedStatement> = Vec::new();
        let mut expectations = VecDeque::with_capacity(batch.len() * 2 + 1);
        if let Err(e) = self.encode_batch(batch, sync_all, &mut parsed, &mut expectations) {
            // Nothing of this batch has been sent yet
            self.write_buffer.clear();
            return Err(e);
        }

        self.waiting = true;
        self.flush().await?;

        let mut results = Vec::with_capacity(batch.len());
        let mut error: Option<PgError> = None;
        // After an error the server skips everything up to the next Sync
        let mut skipping = false;

        while let Some(expect) = expectations.pop_front() {
            match expect {
                Expect::Prepare(_) | Expect::Execute(_) if skipping => {}
                Expect::Prepare(index) => match self.read_prepare(&mut parsed[index]).await? {
                    Ok(()) => self.cache_statement(parsed[index].clone()),
                    Err(e) => {
                        error.get_or_insert(e);
                        skipping = true;
                    }
                },
                Expect::Execute(target) => {
                    let (query, columns) = match &target {
                        StatementRef::Known(stmt) => (stmt.query.clone(), Arc::clone(&stmt.columns)),
                        StatementRef::New(index) => (
                            parsed[*index].query.clone(),
                            Arc::clone(&parsed[*index].columns),
                        ),
                    };
                    match self.read_execute(columns).await? {
                        Ok(result) => {
                            self.statement_cache.mark_executed(&query, Utc::now());
                            results.push(result);
                        }
                        Err(e) => {
                            skipping = e.as_server_error().is_some();
                            error.get_or_insert(e);
                        }
                    }
                }
                Expect::Sync => {
                    self.read_ready().await?;
                    skipping = false;
                }
            }
        }

        self.end_cycle().await?;
        match error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Buffer Parse/Describe for unknown statements and Bind/Execute for
    /// every entry, recording the responses each one will produce.
    fn encode_batch<'b>(
        &mut self,
        batch: &'b [(PipelineEntry<'_>, Option<Arc<PreparedStatement>>)],
        sync_all: bool,
        parsed: &mut Vec<PreparedStatement>,
        expectations: &mut VecDeque<Expect>,
    ) -> PgResult<()> {
        let mut parsed_index: HashMap<&'b str, usize> = HashMap::new();

        for (entry, given) in batch {
            if let Some(stmt) = given {
                check_param_count(stmt, entry.params.len())?;
            }
            // A statement handed back by the caller may have been evicted
            // and closed on the server since it was prepared.
            let cached = self.statement_cache.get(entry.sql);
            let target = match cached {
                Some(stmt) => {
                    check_param_count(&stmt, entry.params.len())?;
                    StatementRef::Known(stmt)
                }
                None => match parsed_index.get(entry.sql) {
                    Some(&index) => StatementRef::New(index),
                    None => {
                        let mut stmt = PreparedStatement::new(
                            self.statement_cache.next_statement_id(),
                            entry.sql.to_string(),
                        );
                        stmt.set_param_types(match given {
                            Some(given) => given.param_types.clone(),
                            None => entry.params.iter().map(declared_type).collect(),
                        });
                        self.buffer(FrontendMessage::Parse {
                            name: &stmt.name,
                            query: entry.sql,
                            param_types: &stmt.param_types,
                        })?;
                        self.buffer(FrontendMessage::Describe {
                            target: Target::Statement,
                            name: &stmt.name,
                        })?;
                        let index = parsed.len();
                        parsed.push(stmt);
                        parsed_index.insert(entry.sql, index);
                        expectations.push_back(Expect::Prepare(index));
                        StatementRef::New(index)
                    }
                },
            };

            let (name, types) = match &target {
                StatementRef::Known(stmt) => (stmt.name.as_str(), stmt.param_types.as_slice()),
                StatementRef::New(index) => (
                    parsed[*index].name.as_str(),
                    parsed[*index].param_types.as_slice(),
                ),
            };
            let (formats, values) = bind_params(entry.params, types);
            self.buffer(FrontendMessage::Bind {
                portal: "",
                statement: name,
                param_formats: &formats,
                params: &values,
                result_formats: &[Format::Binary],
            })?;
            self.buffer(FrontendMessage::Execute {
                portal: "",
                max_rows: 0,
            })?;
            expectations.push_back(Expect::Execute(target));

            if !sync_all {
                self.buffer(FrontendMessage::Sync)?;
                expectations.push_back(Expect::Sync);
            }
        }
        if sync_all {
            self.buffer(FrontendMessage::Sync)?;
            expectations.push_back(Expect::Sync);
        }
        Ok(())
    }

    /// Read the responses to Parse + Describe(Statement).
    ///
    /// The outer result carries fatal errors, the inner one a server error
    /// after which the server skips to the next Sync.
    async fn read_prepare(&mut self, stmt: &mut PreparedStatement) -> PgResult<Result<(), PgError>> {
        match self.receive().await? {
            BackendMessage::ParseComplete => stmt.prepared = true,
            BackendMessage::ErrorResponse(err) => return Ok(Err(PgError::Server(err))),
            other => return Err(PgError::unexpected(other.tag(), "waiting for ParseComplete")),
        }
        match self.receive().await? {
            BackendMessage::ParameterDescription { type_oids } => stmt.set_param_types(type_oids),
            BackendMessage::ErrorResponse(err) => return Ok(Err(PgError::Server(err))),
            other => {
                return Err(PgError::unexpected(
                    other.tag(),
                    "waiting for ParameterDescription",
                ))
            }
        }
        match self.receive().await? {
            BackendMessage::RowDescription { fields } => stmt.set_columns(fields),
            BackendMessage::NoData => {}
            BackendMessage::ErrorResponse(err) => return Ok(Err(PgError::Server(err))),
            other => return Err(PgError::unexpected(other.tag(), "waiting for RowDescription")),
        }
        Ok(Ok(()))
    }

    /// Read the responses to Bind + Execute.
    async fn read_execute(&mut self, columns: SharedColumns) -> PgResult<Result<QueryResult, PgError>> {
        match self.receive().await? {
            BackendMessage::BindComplete => {}
            BackendMessage::ErrorResponse(err) => return Ok(Err(PgError::Server(err))),
            other => return Err(PgError::unexpected(other.tag(), "waiting for BindComplete")),
        }

        let mut result = QueryResult::new(columns);
        let mut decode_error = None;
        loop {
            match self.receive().await? {
                BackendMessage::DataRow { values } => {
                    match decode_row(&values, &result.columns, Format::Binary) {
                        Ok(row) => result.rows.push(row),
                        Err(e) => {
                            decode_error.get_or_insert(e);
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => {
                    result.complete(tag);
                    break;
                }
                BackendMessage::EmptyQueryResponse => break,
                BackendMessage::ErrorResponse(err) => return Ok(Err(PgError::Server(err))),
                BackendMessage::CopyOutResponse { .. } => {
                    // Drain the data; CommandComplete follows CopyDone
                    decode_error.get_or_insert(PgError::Usage(
                        "COPY TO STDOUT must be run with copy_out".to_string(),
                    ));
                }
                BackendMessage::CopyData(_) | BackendMessage::CopyDone => {}
                BackendMessage::CopyInResponse { .. } | BackendMessage::CopyBothResponse { .. } => {
                    // The queued Sync was swallowed by copy-in mode, so the
                    // cycle cannot be resynchronised.
                    self.state = ConnectionState::Closed;
                    return Err(PgError::Usage(
                        "COPY FROM STDIN in an extended query; use copy_in. Connection closed"
                            .to_string(),
                    ));
                }
                other => return Err(PgError::unexpected(other.tag(), "executing a statement")),
            }
        }

        Ok(match decode_error {
            Some(e) => Err(e),
            None => Ok(result),
        })
    }

    /// Add a freshly described statement to the cache, scheduling the
    /// eviction victim (if any) for closing.
    fn cache_statement(&mut self, stmt: PreparedStatement) {
        if let Some(evicted) = self.statement_cache.insert(stmt) {
            debug!(conn = %self.id, statement = %evicted.name, "evicting prepared statement");
            self.pending_closes.push(evicted.name.clone());
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Start a transaction block. The connection must be idle.
    pub async fn begin(&mut self) -> PgResult<()> {
        self.require_status("BEGIN", &[TransactionStatus::Idle])?;
        self.simple_query("BEGIN").await.map(drop)
    }

    /// Commit the current transaction. A failed transaction is rolled back.
    pub async fn commit(&mut self) -> PgResult<()> {
        self.require_status(
            "COMMIT",
            &[TransactionStatus::InTransaction, TransactionStatus::Failed],
        )?;
        self.simple_query("COMMIT").await.map(drop)
    }

    pub async fn rollback(&mut self) -> PgResult<()> {
        self.require_status(
            "ROLLBACK",
            &[TransactionStatus::InTransaction, TransactionStatus::Failed],
        )?;
        self.simple_query("ROLLBACK").await.map(drop)
    }

    fn require_status(
        &self,
        operation: &'static str,
        allowed: &[TransactionStatus],
    ) -> PgResult<()> {
        if allowed.contains(&self.transaction_status) {
            Ok(())
        } else {
            Err(PgError::UnexpectedTransactionState {
                operation,
                actual: self.transaction_status,
            })
        }
    }

    // ========================================================================
    // LISTEN / NOTIFY
    // ========================================================================

    pub async fn listen(&mut self, channel: &str) -> PgResult<()> {
        self.simple_query(&format!("LISTEN {}", quote_identifier(channel)))
            .await
            .map(drop)
    }

    pub async fn unlisten(&mut self, channel: &str) -> PgResult<()> {
        self.simple_query(&format!("UNLISTEN {}", quote_identifier(channel)))
            .await
            .map(drop)
    }

    pub async fn unlisten_all(&mut self) -> PgResult<()> {
        self.simple_query("UNLISTEN *").await.map(drop)
    }

    pub async fn notify(&mut self, channel: &str, payload: &str) -> PgResult<()> {
        self.simple_query(&format!(
            "NOTIFY {}, {}",
            quote_identifier(channel),
            quote_literal(payload)
        ))
        .await
        .map(drop)
    }

    /// Wait for the next notification.
    ///
    /// Cancel-safe: if the future is dropped, partially read data stays
    /// buffered and no notification is lost.
    pub async fn receive_notification(&mut self) -> PgResult<Notification> {
        let result = self.receive_notification_inner().await;
        self.check(result)
    }

    async fn receive_notification_inner(&mut self) -> PgResult<Notification> {
        if let Some(notification) = self.notifications.pop() {
            return Ok(notification);
        }
        self.ensure_ready()?;
        self.flush().await?;

        loop {
            let msg = self.read_message().await?;
            if let Some(msg) = self.handle_async(msg) {
                return Err(match msg {
                    BackendMessage::ErrorResponse(err) => PgError::Server(err),
                    other => PgError::unexpected(other.tag(), "waiting for a notification"),
                });
            }
            if let Some(notification) = self.notifications.pop() {
                return Ok(notification);
            }
        }
    }

    /// A notification that already arrived, without doing any I/O.
    pub fn try_receive_notification(&mut self) -> Option<Notification> {
        self.notifications.pop()
    }

    /// Notifications buffered but not yet received.
    pub fn pending_notifications(&self) -> usize {
        self.notifications.len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Send Terminate and shut the transport down. Calling it again is a no-op.
    pub async fn close(&mut self) -> PgResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closed;
        self.write_buffer.clear();
        debug!(conn = %self.id, "closing connection");

        FrontendMessage::Terminate.encode(&mut self.write_buffer)?;
        self.flush().await?;
        self.stream.shutdown().await
    }

    /// Make the connection reusable: roll back a dangling transaction, then
    /// check that it is open, idle and has no outstanding request.
    pub async fn validate(&mut self) -> bool {
        if !self.is_connected() || self.waiting {
            return false;
        }
        if self.transaction_status != TransactionStatus::Idle {
            debug!(conn = %self.id, status = ?self.transaction_status, "rolling back dangling transaction");
            if self.rollback().await.is_err() {
                return false;
            }
        }
        self.is_reusable()
    }

    /// Open, idle and not waiting, judged without any I/O.
    pub fn is_reusable(&self) -> bool {
        self.is_connected() && !self.waiting && self.transaction_status == TransactionStatus::Idle
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_status != TransactionStatus::Idle
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    pub fn backend_key(&self) -> Option<BackendKey> {
        self.backend_key
    }

    /// Get a server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn statement_cache(&self) -> &StatementCache {
        &self.statement_cache
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    pub(crate) fn ensure_ready(&self) -> PgResult<()> {
        if self.state != ConnectionState::Ready {
            return Err(PgError::ConnectionClosed);
        }
        if self.waiting {
            return Err(PgError::Usage(
                "a previous request on this connection was interrupted; close it".to_string(),
            ));
        }
        Ok(())
    }

    /// Mark the connection closed if `result` carries a fatal error.
    pub(crate) fn check<T>(&mut self, result: PgResult<T>) -> PgResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.state != ConnectionState::Closed {
                warn!(conn = %self.id, error = %e, "connection failed");
                self.state = ConnectionState::Closed;
            }
        }
        result
    }

    /// Encode a message into the write buffer. A message that fails to
    /// encode leaves nothing behind.
    #[inline]
    pub(crate) fn buffer(&mut self, msg: FrontendMessage<'_>) -> PgResult<()> {
        let mark = self.write_buffer.len();
        msg.encode(&mut self.write_buffer).inspect_err(|_| {
            self.write_buffer.truncate(mark);
        })
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.write_buffer.len()
    }

    /// Write out everything buffered.
    pub(crate) async fn flush(&mut self) -> PgResult<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        let data = self.write_buffer.split();
        self.stream.write_all(&data).await?;
        self.stream.flush().await
    }

    pub(crate) async fn send(&mut self, msg: FrontendMessage<'_>) -> PgResult<()> {
        self.buffer(msg)?;
        self.flush().await
    }

    pub(crate) fn set_waiting(&mut self, waiting: bool) {
        self.waiting = waiting;
    }

    /// Read one framed message.
    ///
    /// Partial frames stay in `read_buffer`, so dropping this future loses
    /// nothing.
    async fn read_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(raw) = RawMessage::parse(&mut self.read_buffer)? {
                return BackendMessage::decode(raw);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(PgError::ConnectionClosed);
            }
            self.read_buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Consume messages the server may send at any time.
    fn handle_async(&mut self, msg: BackendMessage) -> Option<BackendMessage> {
        match msg {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                debug!(conn = %self.id, %channel, "notification received");
                self.notifications.push(Notification {
                    process_id,
                    channel,
                    payload,
                });
                None
            }
            BackendMessage::NoticeResponse { fields } => {
                let notice = ServerError::new(fields);
                info!(conn = %self.id, severity = notice.severity(), code = notice.code(), "{}", notice.message());
                None
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
                None
            }
            other => Some(other),
        }
    }

    /// Receive the next message that belongs to the current request.
    ///
    /// Notifications, notices and parameter updates are absorbed here
    /// whatever the caller is doing. ReadyForQuery updates the transaction
    /// status. A FATAL or PANIC error is returned as `Err`.
    pub(crate) async fn receive(&mut self) -> PgResult<BackendMessage> {
        loop {
            let msg = self.read_message().await?;
            match self.handle_async(msg) {
                None => continue,
                Some(BackendMessage::ReadyForQuery { status }) => {
                    self.transaction_status = status;
                    return Ok(BackendMessage::ReadyForQuery { status });
                }
                Some(BackendMessage::ErrorResponse(err)) if err.is_fatal() => {
                    return Err(PgError::Server(err));
                }
                Some(msg) => return Ok(msg),
            }
        }
    }

    /// Skip to ReadyForQuery; only used where the server sends nothing else.
    async fn read_ready(&mut self) -> PgResult<()> {
        match self.receive().await? {
            BackendMessage::ReadyForQuery { .. } => Ok(()),
            other => Err(PgError::unexpected(other.tag(), "waiting for ReadyForQuery")),
        }
    }

    /// Drain until ReadyForQuery, ignoring whatever comes first.
    pub(crate) async fn drain_until_ready(&mut self) -> PgResult<()> {
        loop {
            if let BackendMessage::ReadyForQuery { .. } = self.receive().await? {
                return Ok(());
            }
        }
    }

    /// Finish a request cycle: close statements evicted during it.
    pub(crate) async fn end_cycle(&mut self) -> PgResult<()> {
        if !self.pending_closes.is_empty() {
            let names = std::mem::take(&mut self.pending_closes);
            for name in &names {
                self.buffer(FrontendMessage::Close {
                    target: Target::Statement,
                    name,
                })?;
            }
            self.buffer(FrontendMessage::Sync)?;
            self.flush().await?;

            loop {
                match self.receive().await? {
                    BackendMessage::CloseComplete => {}
                    BackendMessage::ErrorResponse(err) => {
                        warn!(conn = %self.id, error = %err, "closing evicted statements failed");
                    }
                    BackendMessage::ReadyForQuery { .. } => break,
                    other => return Err(PgError::unexpected(other.tag(), "closing statements")),
                }
            }
            debug!(conn = %self.id, count = names.len(), "closed evicted statements");
        }
        self.waiting = false;
        Ok(())
    }
}

impl<S: Transport> fmt::Debug for PgConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("id", &self.id)
            .field("address", &self.config.address())
            .field("state", &self.state)
            .field("transaction_status", &self.transaction_status)
            .field("waiting", &self.waiting)
            .field("cached_statements", &self.statement_cache.len())
            .finish()
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Parameter type declared in Parse for a value.
///
/// Text is left unspecified so the server infers the type from context,
/// and the value then travels in text format.
fn check_param_count(stmt: &PreparedStatement, given: usize) -> PgResult<()> {
    if stmt.param_types.len() != given {
        return Err(PgError::Usage(format!(
            "statement expects {} parameters, got {}",
            stmt.param_types.len(),
            given
        )));
    }
    Ok(())
}

fn declared_type(value: &PgValue) -> Oid {
    match value {
        PgValue::Text(_) => Oid::UNSPECIFIED,
        other => other.type_oid(),
    }
}

/// Encode parameters towards the statement's parameter types.
///
/// Values that convert losslessly are sent in binary. The rest go in text
/// format for the server to parse; raw values are sent as they are.
fn bind_params(params: &[PgValue], types: &[Oid]) -> (Vec<Format>, Vec<Option<Vec<u8>>>) {
    let mut formats = Vec::with_capacity(params.len());
    let mut values = Vec::with_capacity(params.len());

    for (i, value) in params.iter().enumerate() {
        if value.is_null() {
            formats.push(Format::Binary);
            values.push(None);
            continue;
        }

        let target = types.get(i).copied().unwrap_or(Oid::UNSPECIFIED);
        let binary = if target == Oid::UNSPECIFIED {
            None
        } else {
            value.coerce(target)
        };

        match (binary, value.encode_text()) {
            (Some(v), _) => {
                formats.push(Format::Binary);
                values.push(Some(v.encode_binary()));
            }
            (None, Some(text)) => {
                formats.push(Format::Text);
                values.push(Some(text.into_bytes()));
            }
            (None, None) => {
                formats.push(Format::Binary);
                values.push(Some(value.encode_binary()));
            }
        }
    }

    (formats, values)
}

/// Decode a DataRow using the column types.
fn decode_row(
    values: &[Option<Bytes>],
    columns: &[FieldDescription],
    format: Format,
) -> PgResult<Vec<PgValue>> {
    let mut row = Vec::with_capacity(values.len());

    for (i, value) in values.iter().enumerate() {
        let column = columns.get(i);
        let oid = column.map_or(Oid::TEXT, |c| c.type_oid);
        let decoded = match value {
            None => Ok(PgValue::Null),
            Some(data) => match format {
                Format::Binary => PgValue::decode_binary(oid, data),
                Format::Text => PgValue::decode_text(oid, data),
            },
        };
        row.push(decoded.map_err(|reason| {
            PgError::Decode(DecodeError {
                oid,
                type_name: oid.name(),
                target: "PgValue",
                column: column.map_or_else(|| i.to_string(), |c| c.name.clone()),
                reason,
            })
        })?);
    }

    Ok(row)
}
