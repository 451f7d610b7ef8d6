//! PostgreSQL connection implementation.
//!
//! This module provides the main connection type that handles:
//! - TCP connection establishment
//! - Startup and authentication
//! - Simple and extended query protocols
//! - Prepared statement management
//!
//! Every request goes through the same path: the request's messages are
//! buffered, a [`ResultCollector`] is installed as the pending request, and
//! backend messages are fed to it until ReadyForQuery. The blocking methods
//! here drive that path to completion; the polling methods in
//! `nonblocking.rs` drive it one step at a time.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelToken;
use crate::collector::{Request, ResultCollector};
use crate::config::Config;
use crate::error::{DbError, PgError, PgResult};
use crate::escape;
use crate::protocol::*;
use crate::result::{QueryResult, ResultStatus};
use crate::startup::{Handshake, Step};
use crate::statement::{PreparedStatement, StatementRegistry};
use crate::types::PgValue;

pub(crate) const READ_CHUNK: usize = 8192;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Connecting or authenticating
    Connecting,
    /// Ready for requests
    Ok,
    /// The connection failed or was closed
    Bad,
}

/// An asynchronous notification received after LISTEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Process id of the notifying backend
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Client, protocol and server versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub client: &'static str,
    pub protocol: u16,
    /// `server_version` as reported by the server
    pub server: Option<String>,
}

/// Progress of connection establishment.
pub(crate) enum Phase {
    /// TCP connect in flight (polling mode)
    Dialing(Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>),
    /// TCP connect finished while the caller was waiting for it
    Dialed(io::Result<TcpStream>),
    Handshaking(Handshake),
    Established,
    Failed,
}

/// A PostgreSQL connection.
pub struct Connection {
    config: Config,
    pub(crate) stream: Option<TcpStream>,
    pub(crate) phase: Phase,
    pub(crate) status: ConnectionStatus,
    /// Bytes received but not yet decoded
    pub(crate) read_buffer: BytesMut,
    /// Bytes encoded but not yet written
    pub(crate) write_buffer: BytesMut,
    statements: StatementRegistry,
    /// The outstanding request, if any
    pub(crate) pending: Option<ResultCollector>,
    transaction_status: TransactionStatus,
    /// Backend process ID and secret key (for cancellation)
    backend_key: Option<(i32, i32)>,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    notifications: VecDeque<Notification>,
    last_notice: Option<DbError>,
    last_error: Option<String>,
    tracing: bool,
    closed: bool,
}

impl Connection {
    pub(crate) fn with_phase(config: Config, phase: Phase) -> Self {
        Self {
            config,
            stream: None,
            phase,
            status: ConnectionStatus::Connecting,
            read_buffer: BytesMut::with_capacity(READ_CHUNK),
            write_buffer: BytesMut::new(),
            statements: StatementRegistry::new(),
            pending: None,
            transaction_status: TransactionStatus::Unknown,
            backend_key: None,
            parameters: HashMap::new(),
            notifications: VecDeque::new(),
            last_notice: None,
            last_error: None,
            tracing: false,
            closed: false,
        }
    }

    /// Connect and authenticate, waiting until the server is ready.
    ///
    /// Any failure (transport, authentication, server rejection) is reported
    /// as [`PgError::ConnectionError`] with the server's text preserved.
    pub async fn connect(config: Config) -> PgResult<Self> {
        let mut conn = Self::with_phase(config, Phase::Failed);
        match conn.establish().await {
            Ok(()) => Ok(conn),
            Err(e) => Err(conn.fail_connect(e)),
        }
    }

    /// Parse a connection string or URL and connect.
    pub async fn connect_str(conninfo: &str) -> PgResult<Self> {
        Self::connect(Config::parse(conninfo)?).await
    }

    async fn establish(&mut self) -> PgResult<()> {
        debug!("=> {}", self.addr());
        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        self.attach(stream)?;

        loop {
            self.flush_all().await?;
            let msg = self.receive_message().await?;
            if self.advance_handshake(msg)? {
                return Ok(());
            }
        }
    }

    /// Take ownership of a connected socket and queue the startup packet.
    pub(crate) fn attach(&mut self, stream: TcpStream) -> PgResult<()> {
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.write_buffer
            .extend_from_slice(&Handshake::startup_message(&self.config));
        self.phase = Phase::Handshaking(Handshake::new(&self.config));
        Ok(())
    }

    /// Feed one message to the handshake. Returns `true` once the server is
    /// ready for queries.
    pub(crate) fn advance_handshake(&mut self, msg: BackendMessage) -> PgResult<bool> {
        let Phase::Handshaking(ref mut handshake) = self.phase else {
            return Err(PgError::ProtocolError(
                "Startup message received outside the handshake".to_string(),
            ));
        };

        match handshake.handle(msg)? {
            Step::Send(bytes) => {
                self.write_buffer.extend_from_slice(&bytes);
                Ok(false)
            }
            Step::Wait => Ok(false),
            Step::Ready(status) => {
                self.backend_key = handshake.backend_key();
                self.transaction_status = status;
                self.phase = Phase::Established;
                self.status = ConnectionStatus::Ok;
                debug!(
                    "connected to {} (backend pid {:?}) [{}]",
                    self.parameters
                        .get("server_version")
                        .map_or("unknown version", String::as_str),
                    self.backend_pid(),
                    self.addr()
                );
                Ok(true)
            }
        }
    }

    /// Record a failed connection attempt and normalize the error.
    pub(crate) fn fail_connect(&mut self, e: PgError) -> PgError {
        let e = match e {
            PgError::ConnectionError(_) => e,
            other => PgError::ConnectionError(other.to_string()),
        };
        debug!("connection failed: {} [{}]", e, self.addr());
        self.stream = None;
        self.phase = Phase::Failed;
        self.status = ConnectionStatus::Bad;
        self.last_error = Some(e.to_string());
        e
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close the connection. Returns `false` if it was already closed.
    pub async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }

        self.closed = true;
        self.pending = None;
        self.status = ConnectionStatus::Bad;
        self.phase = Phase::Failed;

        if let Some(mut stream) = self.stream.take() {
            // Best effort: the socket is released either way
            let _ = stream.write_all(&TerminateMessage.encode()).await;
            let _ = stream.shutdown().await;
        }

        debug!("connection closed [{}]", self.addr());
        true
    }

    /// Reconnect with the same parameters.
    ///
    /// On success the old session is closed and replaced, including its
    /// prepared statements. On failure this connection is left untouched.
    pub async fn reset(&mut self) -> PgResult<()> {
        let mut fresh = Self::connect(self.config.clone()).await?;
        fresh.tracing = self.tracing;

        let mut old = std::mem::replace(self, fresh);
        old.close().await;

        debug!("connection reset [{}]", self.addr());
        Ok(())
    }

    /// Check that the server accepts connections with these parameters by
    /// opening and closing a separate connection.
    ///
    /// The returned future does not borrow this connection, so it can be
    /// spawned onto another task.
    pub fn ping(&self) -> impl Future<Output = bool> + Send + 'static {
        let config = self.config.clone();
        let addr = self.addr();
        async move {
            match Self::connect(config).await {
                Ok(mut other) => {
                    other.close().await;
                    true
                }
                Err(e) => {
                    debug!("ping failed: {} [{}]", e, addr);
                    false
                }
            }
        }
    }

    #[inline]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ========================================================================
    // Synchronous execution
    // ========================================================================

    /// Run one or more SQL statements with the simple query protocol.
    ///
    /// Returns the result of the last statement. A COPY statement returns
    /// its `CopyIn`/`CopyOut` result right away; the transfer then continues
    /// with the COPY methods and [`get_result`](Self::get_result).
    pub async fn query(&mut self, sql: &str) -> PgResult<QueryResult> {
        self.queue_query(sql)?;
        self.collect().await
    }

    /// Run a single statement with `$1..$n` parameters, sent as text.
    ///
    /// Uses the unnamed statement, replacing any unnamed prepared statement.
    pub async fn query_params(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.queue_query_params(sql, params)?;
        self.collect().await
    }

    /// Prepare a statement under `name` (empty for the unnamed statement).
    pub async fn prepare(&mut self, name: &str, sql: &str) -> PgResult<Arc<PreparedStatement>> {
        self.queue_prepare(name, sql)?;
        self.collect().await?;
        self.statements.lookup(name)
    }

    /// Execute a prepared statement.
    ///
    /// The name and parameter count are checked before anything is sent.
    pub async fn execute(&mut self, name: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.queue_execute(name, params)?;
        self.collect().await
    }

    /// Close a prepared statement on the server and forget it.
    pub async fn deallocate(&mut self, name: &str) -> PgResult<()> {
        self.queue_deallocate(name)?;
        self.collect().await?;
        Ok(())
    }

    /// The registered statement `name`.
    pub fn describe_prepared(&self, name: &str) -> PgResult<Arc<PreparedStatement>> {
        self.statements.lookup(name)
    }

    pub fn statements(&self) -> &StatementRegistry {
        &self.statements
    }

    /// Drain the pending request into one result.
    async fn collect(&mut self) -> PgResult<QueryResult> {
        let mut last = None;
        let mut error = None;

        loop {
            match self.get_result().await {
                Ok(Some(result)) => match result.status() {
                    ResultStatus::FatalError => {
                        if error.is_none() {
                            error = result.error().cloned();
                        }
                    }
                    ResultStatus::CopyIn | ResultStatus::CopyOut => return Ok(result),
                    _ => last = Some(result),
                },
                Ok(None) => break,
                // A server error explains a dropped connection better than the I/O error
                Err(e) => return Err(error.map_or(e, PgError::QueryError)),
            }
        }

        match error {
            Some(db) => Err(PgError::QueryError(db)),
            None => Ok(last.unwrap_or_else(|| QueryResult::new(ResultStatus::EmptyQuery))),
        }
    }

    /// Next result of the pending request, waiting for it if needed.
    ///
    /// Returns `None` once every result has been delivered; the connection
    /// is then idle again.
    pub async fn get_result(&mut self) -> PgResult<Option<QueryResult>> {
        loop {
            let Some(collector) = self.pending.as_mut() else {
                return Ok(None);
            };

            if let Some(result) = collector.pop_result() {
                return Ok(Some(result));
            }
            if collector.is_done() {
                self.pending = None;
                return Ok(None);
            }
            if let Some(state) = collector.copy_state() {
                // The COPY has to be finished before anything else arrives
                return Ok(Some(QueryResult::new(state.into())));
            }

            self.flush_all().await?;
            let msg = self.receive_message().await?;
            self.dispatch(msg)?;
        }
    }

    // ========================================================================
    // Request encoding
    // ========================================================================

    pub(crate) fn queue_query(&mut self, sql: &str) -> PgResult<()> {
        self.ensure_idle()?;
        debug!("{} [{}]", sql, self.addr());

        self.buffer_message(&QueryMessage {
            query: sql.to_string(),
        });
        self.start(Request::Query);
        Ok(())
    }

    pub(crate) fn queue_query_params(&mut self, sql: &str, params: &[PgValue]) -> PgResult<()> {
        self.ensure_idle()?;
        debug!("{} [{}]", sql, self.addr());

        self.statements.evict_unnamed();

        self.buffer_message(&ParseMessage {
            name: String::new(),
            query: sql.to_string(),
            // Untyped, so the server infers each type from context
            param_types: Vec::new(),
        });
        self.buffer_message(&BindMessage {
            portal: String::new(),
            statement: String::new(),
            params: params.iter().map(PgValue::to_text).collect(),
        });
        self.buffer_message(&DescribeMessage {
            kind: b'P',
            name: String::new(),
        });
        self.buffer_message(&ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        });
        self.buffer_message(&SyncMessage);

        self.start(Request::Execute {
            columns: Arc::new(Vec::new()),
        });
        Ok(())
    }

    pub(crate) fn queue_prepare(&mut self, name: &str, sql: &str) -> PgResult<()> {
        self.statements.check_available(name)?;
        self.ensure_idle()?;
        debug!("prepare \"{}\": {} [{}]", name, sql, self.addr());

        if name.is_empty() {
            // The server drops the old unnamed statement even if Parse fails
            self.statements.evict_unnamed();
        }

        self.buffer_message(&ParseMessage {
            name: name.to_string(),
            query: sql.to_string(),
            param_types: Vec::new(),
        });
        self.buffer_message(&DescribeMessage {
            kind: b'S',
            name: name.to_string(),
        });
        self.buffer_message(&SyncMessage);

        self.start(Request::Prepare {
            statement: PreparedStatement::new(name.to_string(), sql.to_string()),
        });
        Ok(())
    }

    pub(crate) fn queue_execute(&mut self, name: &str, params: &[PgValue]) -> PgResult<()> {
        let statement = self.statements.validate(name, params.len())?;
        self.ensure_idle()?;
        debug!("execute \"{}\" [{}]", name, self.addr());

        self.buffer_message(&BindMessage {
            portal: String::new(),
            statement: statement.name.clone(),
            params: params.iter().map(PgValue::to_text).collect(),
        });
        self.buffer_message(&ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        });
        self.buffer_message(&SyncMessage);

        self.start(Request::Execute {
            columns: Arc::clone(&statement.columns),
        });
        Ok(())
    }

    pub(crate) fn queue_deallocate(&mut self, name: &str) -> PgResult<()> {
        self.statements.lookup(name)?;
        self.ensure_idle()?;

        self.buffer_message(&CloseMessage {
            kind: b'S',
            name: name.to_string(),
        });
        self.buffer_message(&SyncMessage);

        self.start(Request::Deallocate {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Fail unless the connection can accept a new request.
    fn ensure_idle(&self) -> PgResult<()> {
        if self.stream.is_none() || self.status != ConnectionStatus::Ok {
            return Err(PgError::ConnectionClosed);
        }
        if self.pending.is_some() {
            return Err(PgError::BusyConnectionError);
        }
        Ok(())
    }

    fn start(&mut self, request: Request) {
        self.pending = Some(ResultCollector::new(request));
    }

    // ========================================================================
    // Session state
    // ========================================================================

    /// Transaction status as of the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        if self.status != ConnectionStatus::Ok {
            TransactionStatus::Unknown
        } else if self.pending.is_some() {
            TransactionStatus::Active
        } else {
            self.transaction_status
        }
    }

    /// Get backend process ID.
    pub fn backend_pid(&self) -> Option<i32> {
        self.backend_key.map(|(pid, _)| pid)
    }

    /// Get a server parameter reported with ParameterStatus.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn client_encoding(&self) -> Option<&str> {
        self.parameter_status("client_encoding")
    }

    pub async fn set_client_encoding(&mut self, encoding: &str) -> PgResult<()> {
        let sql = format!(
            "SET client_encoding TO {}",
            escape::escape_literal(encoding)
        );
        self.query(&sql).await?;
        Ok(())
    }

    pub fn version(&self) -> VersionInfo {
        VersionInfo {
            client: env!("CARGO_PKG_VERSION"),
            protocol: 3,
            server: self.parameter_status("server_version").map(str::to_string),
        }
    }

    /// Message of the most recent server or connection error.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The most recent NoticeResponse.
    pub fn last_notice(&self) -> Option<&DbError> {
        self.last_notice.as_ref()
    }

    /// Pop the oldest pending notification.
    pub fn notifies(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    /// Log every message sent and received at `trace` level.
    pub fn trace(&mut self) -> bool {
        self.tracing = true;
        true
    }

    pub fn untrace(&mut self) -> bool {
        self.tracing = false;
        true
    }

    /// A handle for cancelling this connection's running query from elsewhere.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.backend_key.map(|(process_id, secret_key)| {
            CancelToken::new(
                self.config.host.clone(),
                self.config.port,
                process_id,
                secret_key,
            )
        })
    }

    // ========================================================================
    // Escaping
    // ========================================================================

    pub fn escape_identifier(&self, ident: &str) -> String {
        escape::escape_identifier(ident)
    }

    pub fn escape_literal(&self, text: &str) -> String {
        escape::escape_literal(text)
    }

    /// Escape for use inside quotes, according to the server's
    /// `standard_conforming_strings`.
    pub fn escape_string(&self, text: &str) -> String {
        let standard = self.parameter_status("standard_conforming_strings") != Some("off");
        escape::escape_string(text, standard)
    }

    pub fn escape_bytea(&self, data: &[u8]) -> String {
        escape::escape_bytea(data)
    }

    pub fn unescape_bytea(&self, encoded: &str) -> PgResult<Vec<u8>> {
        escape::unescape_bytea(encoded)
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    pub(crate) fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Encode a frontend message into the write buffer.
    pub(crate) fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) {
        let encoded = msg.encode();
        if self.tracing {
            trace!(
                "'{}' ({} bytes) >>> [{}]",
                char::from(encoded[0]),
                encoded.len(),
                self.addr()
            );
        }
        self.write_buffer.extend_from_slice(&encoded);
    }

    /// Write the whole write buffer, waiting as needed.
    pub(crate) async fn flush_all(&mut self) -> PgResult<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }

        let stream = self.stream.as_mut().ok_or(PgError::ConnectionClosed)?;
        match stream.write_all(&self.write_buffer).await {
            Ok(()) => {
                self.write_buffer.clear();
                Ok(())
            }
            Err(e) => Err(self.broken(e)),
        }
    }

    /// Receive a backend message, waiting for more bytes as needed.
    pub(crate) async fn receive_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(msg) = self.take_message()? {
                return Ok(msg);
            }

            let stream = self.stream.as_mut().ok_or(PgError::ConnectionClosed)?;
            self.read_buffer.reserve(READ_CHUNK);
            match stream.read_buf(&mut self.read_buffer).await {
                Ok(0) => return Err(self.lost()),
                Ok(_) => {}
                Err(e) => return Err(self.broken(e)),
            }
        }
    }

    /// Decode the next complete message in the read buffer, if any.
    ///
    /// Notices, parameter changes and notifications can arrive at any time;
    /// they are absorbed here and never reach the request in progress.
    pub(crate) fn take_message(&mut self) -> PgResult<Option<BackendMessage>> {
        loop {
            let len = match BackendMessage::frame_len(&self.read_buffer) {
                Ok(Some(len)) if self.read_buffer.len() >= len => len,
                Ok(_) => return Ok(None),
                Err(e) => {
                    self.mark_bad();
                    return Err(e);
                }
            };

            let mut frame: Bytes = self.read_buffer.split_to(len).freeze();
            let msg = BackendMessage::decode(&mut frame)?;

            if self.tracing {
                trace!("{:?} <<< [{}]", msg, self.addr());
            }

            match msg {
                BackendMessage::NoticeResponse { fields } => {
                    let notice = DbError::from_fields(fields);
                    info!("{}: {} [{}]", notice.severity(), notice.message(), self.addr());
                    self.last_notice = Some(notice);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    debug!("{} = {} [{}]", name, value, self.addr());
                    self.parameters.insert(name, value);
                }
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    debug!("notification on \"{}\" [{}]", channel, self.addr());
                    self.notifications.push_back(Notification {
                        process_id,
                        channel,
                        payload,
                    });
                }
                other => return Ok(Some(other)),
            }
        }
    }

    /// Hand a message to the pending request.
    pub(crate) fn dispatch(&mut self, msg: BackendMessage) -> PgResult<()> {
        if let BackendMessage::ErrorResponse { ref fields } = msg {
            let err = DbError::from_fields(fields.clone());
            debug!("{} [{}]", err, self.addr());
            if matches!(err.severity(), "FATAL" | "PANIC") {
                // The server closes the session after sending this
                self.status = ConnectionStatus::Bad;
            }
            self.last_error = Some(err.to_string());
        }

        let Some(collector) = self.pending.as_mut() else {
            // Only errors arrive unprompted, e.g. on administrator shutdown
            warn!("unexpected message with no request pending: {:?} [{}]", msg, self.addr());
            return Ok(());
        };

        match collector.handle(msg) {
            Ok(Some(status)) => self.transaction_status = status,
            Ok(None) => {}
            Err(e) => {
                self.mark_bad();
                return Err(e);
            }
        }

        let prepared = collector.take_prepared();
        let deallocated = collector.take_deallocated();

        if let Some(statement) = prepared {
            debug!(
                "prepared \"{}\" with {} parameters [{}]",
                statement.name,
                statement.param_count(),
                self.addr()
            );
            self.statements.register(statement);
        }
        if let Some(name) = deallocated {
            self.statements.remove(&name);
        }

        Ok(())
    }

    /// The server went away.
    pub(crate) fn lost(&mut self) -> PgError {
        warn!("server closed the connection unexpectedly [{}]", self.addr());
        self.mark_bad();
        PgError::ConnectionClosed
    }

    /// The socket failed.
    pub(crate) fn broken(&mut self, e: io::Error) -> PgError {
        warn!("{} [{}]", e, self.addr());
        self.mark_bad();
        PgError::IoError(e)
    }

    fn mark_bad(&mut self) {
        self.status = ConnectionStatus::Bad;
        self.pending = None;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("status", &self.status)
            .field("backend_pid", &self.backend_pid())
            .field("busy", &self.pending.is_some())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if self.status == ConnectionStatus::Ok {
                // Best effort, never blocks
                let _ = stream.try_write(&TerminateMessage.encode());
            }
        }
    }
}
