//! PostgreSQL connection implementation.
//!
//! This module provides the main connection type that handles:
//! - Dialing (TCP/Unix, optional TLS) and the startup handshake
//! - Session parameters applied after startup
//! - The simple query protocol (`exec`, `query`, `ping`)
//! - Connection state tracking and bad-connection classification

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use super::auth::Authenticator;
use super::connector::Connector;
use super::error::{PgError, PgResult, ServerError};
use super::format::{format_query, quote_literal};
use super::framing::{self, until, Context, MessageReader, MessageWriter};
use super::protocol::*;
use super::rows::{RowDescription, Rows};
use super::stream;
use super::types::PgValue;

/// Row descriptions kept for reuse per connection.
const MAX_FREE_DESCRIPTIONS: usize = 4;

// ============================================================================
// Connection state
// ============================================================================

/// Where the connection stands in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Idle after ReadyForQuery.
    Ready,
    /// A result cursor was opened and not drained; the next operation drains
    /// it first.
    Streaming,
    /// An operation is in flight. Seen from the outside only when that
    /// operation's future was dropped midway, leaving the protocol state
    /// unknown.
    Busy,
    /// Unusable: closed, or failed with an error that poisons it.
    Broken,
}

/// Result of [`PgConnection::exec`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Taken from the last CommandComplete tag.
    pub rows_affected: u64,
}

/// What a simple query produced before the first row.
pub(crate) enum QueryStart {
    Rows(RowDescription, Option<PgError>),
    Done,
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
pub struct PgConnection {
    pub(super) reader: MessageReader,
    pub(super) writer: MessageWriter,
    connector: Connector,
    /// Backend process ID
    process_id: i32,
    /// Backend secret key (for cancellation)
    secret_key: i32,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    transaction_status: TransactionStatus,
    descriptions: Vec<RowDescription>,
    pub(super) state: ConnState,
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("addr", &self.connector.config().addr)
            .field("process_id", &self.process_id)
            .field("state", &self.state)
            .field("transaction_status", &self.transaction_status)
            .finish()
    }
}

impl PgConnection {
    /// Dial and authenticate, bounded by the dial timeout and `ctx`.
    pub(crate) async fn connect(connector: Connector, ctx: &Context) -> PgResult<Self> {
        let deadline = ctx.bound(connector.config().dial_timeout);
        let dial_ctx = match deadline {
            Some(d) => ctx.with_deadline(d),
            None => *ctx,
        };

        let result = until(deadline, Self::establish(connector.clone(), &dial_ctx)).await;
        if let Err(e) = &result {
            connector.stats().record_error();
            tracing::debug!(addr = %connector.config().addr, error = %e, "connect failed");
        }
        result
    }

    async fn establish(connector: Connector, ctx: &Context) -> PgResult<Self> {
        let socket = stream::open(connector.config()).await?;
        let (reader, writer) = framing::split(
            socket,
            connector.buffers().clone(),
            connector.config().read_timeout,
            connector.config().write_timeout,
        );

        let mut conn = Self {
            reader,
            writer,
            connector,
            process_id: 0,
            secret_key: 0,
            parameters: HashMap::new(),
            transaction_status: TransactionStatus::Idle,
            descriptions: Vec::new(),
            state: ConnState::Busy,
        };

        conn.startup(ctx).await?;
        conn.state = ConnState::Ready;
        conn.apply_session_params(ctx).await?;

        tracing::debug!(
            addr = %conn.connector.config().addr,
            pid = conn.process_id,
            "connected"
        );
        Ok(conn)
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self, ctx: &Context) -> PgResult<()> {
        let config = self.connector.config();

        let startup = StartupMessage {
            user: config.user.clone(),
            database: Some(config.database.clone()),
            options: config
                .application_name
                .as_ref()
                .map(|name| vec![("application_name".to_string(), name.clone())])
                .unwrap_or_default(),
        };
        self.writer.send(ctx, &startup).await?;

        Authenticator::new(&config.user, config.password.as_deref())
            .run(ctx, &mut self.reader, &mut self.writer)
            .await?;

        loop {
            let (tag, len) = self.reader.read_message_type(ctx).await?;
            match tag {
                BackendTag::ParameterStatus => self.read_parameter_status(ctx, len).await?,
                BackendTag::BackendKeyData => {
                    let body = self.reader.read_payload(ctx, len).await?;
                    (self.process_id, self.secret_key) = decode_backend_key_data(body)?;
                }
                BackendTag::NoticeResponse => self.reader.discard(ctx, len).await?,
                BackendTag::ErrorResponse => {
                    return Err(self.read_error(ctx, len).await?.into());
                }
                BackendTag::ReadyForQuery => return self.read_ready(ctx, len).await,
                other => return Err(unexpected(other, "startup")),
            }
        }
    }

    async fn apply_session_params(&mut self, ctx: &Context) -> PgResult<()> {
        let params = self.connector.config().session_params.clone();
        for (name, value) in params {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            {
                return Err(PgError::Config(format!("invalid session parameter name: {:?}", name)));
            }
            let stmt = format!("SET {} TO {}", name, quote_literal(&value));
            self.exec(ctx, &stmt).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Simple query protocol
    // ========================================================================

    /// Run `query` to completion and report the affected row count.
    ///
    /// The query may hold several statements; every result is consumed
    /// through ReadyForQuery and the first error is returned.
    pub async fn exec(&mut self, ctx: &Context, query: &str) -> PgResult<ExecResult> {
        let result = self.exec_inner(ctx, query).await;
        self.track(result)
    }

    /// [`exec`](Self::exec) with `$N` / `?` placeholders substituted from `args`.
    pub async fn exec_args(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[PgValue],
    ) -> PgResult<ExecResult> {
        let query = match format_query(query, args) {
            Ok(q) => q,
            Err(e) => return Err(self.fail(e)),
        };
        self.exec(ctx, &query).await
    }

    async fn exec_inner(&mut self, ctx: &Context, query: &str) -> PgResult<ExecResult> {
        self.begin_op(ctx).await?;
        self.connector.stats().record_query();
        self.writer.send(ctx, &QueryMessage { query }).await?;
        self.read_to_ready(ctx, None).await
    }

    /// Run `query` and return a cursor over the first result set's rows.
    ///
    /// Rows are decoded lazily. A query that produces no rows returns an
    /// already closed cursor.
    pub async fn query(&mut self, ctx: &Context, query: &str) -> PgResult<Rows<'_>> {
        match self.start_query(ctx, query).await {
            Ok(start) => Ok(Rows::new(self, *ctx, start)),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// [`query`](Self::query) with `$N` / `?` placeholders substituted from `args`.
    pub async fn query_args(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[PgValue],
    ) -> PgResult<Rows<'_>> {
        let query = match format_query(query, args) {
            Ok(q) => q,
            Err(e) => return Err(self.fail(e)),
        };
        self.query(ctx, &query).await
    }

    async fn start_query(&mut self, ctx: &Context, query: &str) -> PgResult<QueryStart> {
        self.begin_op(ctx).await?;
        self.connector.stats().record_query();
        self.writer.send(ctx, &QueryMessage { query }).await?;

        let mut first_err = None;
        loop {
            let (tag, len) = self.reader.read_message_type(ctx).await?;
            match tag {
                BackendTag::RowDescription => {
                    let body = self.reader.read_payload(ctx, len).await?;
                    let mut desc = self.take_description();
                    desc.parse(body)?;
                    self.state = ConnState::Streaming;
                    return Ok(QueryStart::Rows(desc, first_err));
                }
                BackendTag::ErrorResponse => {
                    let e = self.read_error(ctx, len).await?;
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    first_err.get_or_insert(PgError::Server(e));
                }
                BackendTag::EmptyQueryResponse => {
                    self.reader.discard(ctx, len).await?;
                    first_err.get_or_insert(PgError::EmptyQuery);
                }
                BackendTag::ReadyForQuery => {
                    self.read_ready(ctx, len).await?;
                    return match first_err {
                        Some(e) => Err(e),
                        None => Ok(QueryStart::Done),
                    };
                }
                BackendTag::ParameterStatus => self.read_parameter_status(ctx, len).await?,
                BackendTag::CommandComplete
                | BackendTag::NoticeResponse
                | BackendTag::NotificationResponse
                | BackendTag::BackendKeyData => self.reader.discard(ctx, len).await?,
                other => return Err(unexpected(other, "query")),
            }
        }
    }

    /// Check the connection with `SELECT 1`.
    pub async fn ping(&mut self, ctx: &Context) -> PgResult<()> {
        self.exec(ctx, "SELECT 1").await.map(|_| ())
    }

    /// Send Terminate and shut the socket down. Cleanup I/O is best-effort
    /// and calling this twice is harmless.
    pub async fn close(&mut self) -> PgResult<()> {
        if self.state == ConnState::Broken {
            return Ok(());
        }
        self.state = ConnState::Broken;

        let ctx = Context::background();
        let _ = self.writer.send(&ctx, &TerminateMessage).await;
        let _ = self.writer.shutdown().await;
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Whether the connection must be discarded.
    pub fn is_bad(&self) -> bool {
        matches!(self.state, ConnState::Busy | ConnState::Broken)
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Get backend process ID.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Backend secret key, kept for query cancellation.
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// Get a server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// Hand over the socket halves to a long-lived reader such as the
    /// listener. Only valid on an idle connection.
    pub(crate) fn into_split(self) -> PgResult<(MessageReader, MessageWriter)> {
        if self.state != ConnState::Ready {
            return Err(PgError::BadConnection);
        }
        Ok((self.reader, self.writer))
    }

    // ========================================================================
    // Crate helpers
    // ========================================================================

    /// Make the connection ready for a new operation and mark it busy.
    ///
    /// An undrained cursor is drained first. A connection left busy by a
    /// dropped future, or broken, is refused.
    pub(crate) async fn begin_op(&mut self, ctx: &Context) -> PgResult<()> {
        match self.state {
            ConnState::Ready => {}
            ConnState::Streaming => {
                self.state = ConnState::Busy;
                self.drain(ctx).await?;
            }
            ConnState::Busy | ConnState::Broken => return Err(PgError::BadConnection),
        }
        self.state = ConnState::Busy;
        Ok(())
    }

    /// Discard everything up to ReadyForQuery. Only a fatal error stops it.
    async fn drain(&mut self, ctx: &Context) -> PgResult<()> {
        loop {
            let (tag, len) = self.reader.read_message_type(ctx).await?;
            match tag {
                BackendTag::ReadyForQuery => return self.read_ready(ctx, len).await,
                BackendTag::ErrorResponse => {
                    let e = self.read_error(ctx, len).await?;
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                }
                _ => self.reader.discard(ctx, len).await?,
            }
        }
    }

    /// Read until ReadyForQuery, collecting the row count and the first error.
    pub(crate) async fn read_to_ready(
        &mut self,
        ctx: &Context,
        mut first_err: Option<PgError>,
    ) -> PgResult<ExecResult> {
        let mut rows_affected = 0;

        loop {
            let (tag, len) = self.reader.read_message_type(ctx).await?;
            match tag {
                BackendTag::ErrorResponse => {
                    let e = self.read_error(ctx, len).await?;
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    first_err.get_or_insert(PgError::Server(e));
                }
                BackendTag::CommandComplete => {
                    let body = self.reader.read_payload(ctx, len).await?;
                    rows_affected = parse_rows_affected(&decode_command_complete(body)?);
                }
                BackendTag::EmptyQueryResponse => {
                    self.reader.discard(ctx, len).await?;
                    first_err.get_or_insert(PgError::EmptyQuery);
                }
                BackendTag::ReadyForQuery => {
                    self.read_ready(ctx, len).await?;
                    break;
                }
                BackendTag::ParameterStatus => self.read_parameter_status(ctx, len).await?,
                BackendTag::CopyInResponse => {
                    // COPY FROM STDIN outside copy_from: refuse so the server
                    // does not wait for data forever.
                    self.reader.discard(ctx, len).await?;
                    let message = "COPY FROM STDIN requires copy_from";
                    self.writer.send(ctx, &CopyFailMessage { message }).await?;
                }
                BackendTag::RowDescription
                | BackendTag::DataRow
                | BackendTag::NoticeResponse
                | BackendTag::NotificationResponse
                | BackendTag::BackendKeyData
                | BackendTag::CopyOutResponse
                | BackendTag::CopyData
                | BackendTag::CopyDone => self.reader.discard(ctx, len).await?,
                BackendTag::Authentication => return Err(unexpected(tag, "query")),
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(ExecResult { rows_affected }),
        }
    }

    pub(crate) async fn read_error(&mut self, ctx: &Context, len: usize) -> PgResult<ServerError> {
        let body = self.reader.read_payload(ctx, len).await?;
        Ok(ServerError::new(decode_error_fields(body)?))
    }

    pub(crate) async fn read_ready(&mut self, ctx: &Context, len: usize) -> PgResult<()> {
        let body: Bytes = self.reader.read_payload(ctx, len).await?;
        self.transaction_status = body
            .first()
            .copied()
            .map(TransactionStatus::from)
            .unwrap_or(TransactionStatus::Idle);
        self.state = ConnState::Ready;
        Ok(())
    }

    pub(crate) async fn read_parameter_status(&mut self, ctx: &Context, len: usize) -> PgResult<()> {
        let body = self.reader.read_payload(ctx, len).await?;
        let (name, value) = decode_parameter_status(body)?;
        self.parameters.insert(name, value);
        Ok(())
    }

    /// Account for a failed operation; poisons the connection when the error
    /// says so.
    pub(crate) fn fail(&mut self, e: PgError) -> PgError {
        self.connector.stats().record_error();
        if e.is_bad_conn() {
            self.state = ConnState::Broken;
        }
        e
    }

    pub(crate) fn track<T>(&mut self, result: PgResult<T>) -> PgResult<T> {
        result.map_err(|e| self.fail(e))
    }

    pub(crate) fn take_description(&mut self) -> RowDescription {
        self.descriptions.pop().unwrap_or_default()
    }

    pub(crate) fn release_description(&mut self, desc: RowDescription) {
        if self.descriptions.len() < MAX_FREE_DESCRIPTIONS {
            self.descriptions.push(desc);
        }
    }
}

pub(crate) fn unexpected(tag: BackendTag, during: &str) -> PgError {
    PgError::Protocol(format!("unexpected message {:?} during {}", tag, during))
}
