//! Poll-driven connection establishment and query execution.
//!
//! Nothing here waits on the network. Each call does as much work as the
//! socket allows and reports what it needs next; the caller waits with
//! [`Connection::socket_ready`] (or its own event loop) between calls.
//!
//! ```no_run
//! # async fn run() -> pgsqli::PgResult<()> {
//! use pgsqli::{Config, Connection, PollingStatus};
//!
//! let mut conn = Connection::connect_start(Config::from_env()?);
//! loop {
//!     match conn.connect_poll() {
//!         PollingStatus::Ok => break,
//!         PollingStatus::Failed => return Err(pgsqli::PgError::ConnectionClosed),
//!         PollingStatus::Active => continue,
//!         status => conn.socket_ready(status).await?,
//!     }
//! }
//!
//! conn.send_query("SELECT 1")?;
//! while conn.is_busy() {
//!     conn.socket_ready(PollingStatus::Reading).await?;
//!     conn.consume_input()?;
//! }
//! while let Some(result) = conn.get_result().await? {
//!     println!("{}", result.command_tag());
//! }
//! # Ok(())
//! # }
//! ```

use std::io;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes};
use tokio::net::TcpStream;
use tracing::debug;

use crate::collector::CopyState;
use crate::config::Config;
use crate::connection::{Connection, Phase, READ_CHUNK};
use crate::error::{PgError, PgResult};
use crate::protocol::*;
use crate::types::PgValue;

/// Progress of [`Connection::connect_poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// The attempt failed; see [`Connection::last_error`]
    Failed,
    /// Wait until the socket is readable, then poll again
    Reading,
    /// Wait until the socket is writable, then poll again
    Writing,
    /// Ready for queries
    Ok,
    /// Progress was made; poll again right away
    Active,
}

/// Outcome of [`Connection::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Everything buffered has been written
    Flushed,
    /// The socket is full; wait until it is writable and flush again
    Pending,
}

impl Connection {
    /// Start connecting without waiting. Drive the attempt with
    /// [`connect_poll`](Self::connect_poll).
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect_start(config: Config) -> Self {
        let host = config.host.clone();
        let port = config.port;
        let dial = Box::pin(async move { TcpStream::connect((host.as_str(), port)).await });
        Self::with_phase(config, Phase::Dialing(dial))
    }

    /// Advance connection establishment as far as possible without blocking.
    pub fn connect_poll(&mut self) -> PollingStatus {
        match self.poll_connect() {
            Ok(status) => status,
            Err(e) => {
                self.fail_connect(e);
                PollingStatus::Failed
            }
        }
    }

    fn poll_connect(&mut self) -> PgResult<PollingStatus> {
        match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::Dialing(mut dial) => {
                let mut cx = Context::from_waker(Waker::noop());
                match dial.as_mut().poll(&mut cx) {
                    Poll::Ready(stream) => {
                        self.attach(stream?)?;
                        Ok(PollingStatus::Active)
                    }
                    Poll::Pending => {
                        self.phase = Phase::Dialing(dial);
                        Ok(PollingStatus::Writing)
                    }
                }
            }
            Phase::Dialed(stream) => {
                self.attach(stream?)?;
                self.poll_startup()
            }
            Phase::Handshaking(handshake) => {
                self.phase = Phase::Handshaking(handshake);
                self.poll_startup()
            }
            Phase::Established => {
                self.phase = Phase::Established;
                Ok(PollingStatus::Ok)
            }
            Phase::Failed => Ok(PollingStatus::Failed),
        }
    }

    fn poll_startup(&mut self) -> PgResult<PollingStatus> {
        loop {
            if self.flush()? == FlushStatus::Pending {
                return Ok(PollingStatus::Writing);
            }

            self.read_available()?;
            while let Some(msg) = self.take_message()? {
                if self.advance_handshake(msg)? {
                    return Ok(PollingStatus::Ok);
                }
                if !self.write_buffer.is_empty() {
                    break;
                }
            }

            if self.write_buffer.is_empty() {
                return Ok(PollingStatus::Reading);
            }
        }
    }

    /// Wait until the socket is ready for what `status` asks for.
    ///
    /// While the TCP connect is still in flight this waits for it to finish.
    pub async fn socket_ready(&mut self, status: PollingStatus) -> PgResult<()> {
        if let Phase::Dialing(ref mut dial) = self.phase {
            let stream = dial.await;
            self.phase = Phase::Dialed(stream);
            return Ok(());
        }

        let stream = self.stream.as_ref().ok_or(PgError::ConnectionClosed)?;
        match status {
            PollingStatus::Reading => stream.readable().await?,
            PollingStatus::Writing => stream.writable().await?,
            PollingStatus::Ok | PollingStatus::Active | PollingStatus::Failed => {}
        }
        Ok(())
    }

    // ========================================================================
    // Asynchronous execution
    // ========================================================================

    /// Send a simple query without waiting for the response.
    pub fn send_query(&mut self, sql: &str) -> PgResult<()> {
        self.queue_query(sql)?;
        self.flush()?;
        Ok(())
    }

    /// Send a parameterized query without waiting for the response.
    pub fn send_query_params(&mut self, sql: &str, params: &[PgValue]) -> PgResult<()> {
        self.queue_query_params(sql, params)?;
        self.flush()?;
        Ok(())
    }

    /// Send a prepare request. The statement is registered once its result
    /// has been received with [`get_result`](Self::get_result).
    pub fn send_prepare(&mut self, name: &str, sql: &str) -> PgResult<()> {
        self.queue_prepare(name, sql)?;
        self.flush()?;
        Ok(())
    }

    /// Send a prepared statement execution without waiting for the response.
    pub fn send_execute(&mut self, name: &str, params: &[PgValue]) -> PgResult<()> {
        self.queue_execute(name, params)?;
        self.flush()?;
        Ok(())
    }

    /// Write as much buffered output as the socket accepts.
    pub fn flush(&mut self) -> PgResult<FlushStatus> {
        while !self.write_buffer.is_empty() {
            let stream = self.stream.as_ref().ok_or(PgError::ConnectionClosed)?;
            match stream.try_write(&self.write_buffer) {
                Ok(0) => return Err(self.broken(io::ErrorKind::WriteZero.into())),
                Ok(n) => self.write_buffer.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Pending)
                }
                Err(e) => return Err(self.broken(e)),
            }
        }
        Ok(FlushStatus::Flushed)
    }

    /// Read whatever input is available and process it.
    pub fn consume_input(&mut self) -> PgResult<()> {
        self.read_available()?;
        while let Some(msg) = self.take_message()? {
            self.dispatch(msg)?;
        }
        Ok(())
    }

    /// Whether [`get_result`](Self::get_result) would have to wait for input.
    pub fn is_busy(&self) -> bool {
        match self.pending {
            Some(ref collector) => {
                !collector.has_result() && !collector.is_done() && collector.copy_state().is_none()
            }
            None => false,
        }
    }

    /// Read from the socket until it would block.
    pub(crate) fn read_available(&mut self) -> PgResult<usize> {
        let mut total = 0;
        loop {
            let stream = self.stream.as_ref().ok_or(PgError::ConnectionClosed)?;
            self.read_buffer.reserve(READ_CHUNK);
            match stream.try_read_buf(&mut self.read_buffer) {
                Ok(0) => {
                    // Messages that arrived before the close are still processed
                    if total == 0 && !self.has_complete_message() {
                        return Err(self.lost());
                    }
                    return Ok(total);
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) => return Err(self.broken(e)),
            }
        }
    }

    fn has_complete_message(&self) -> bool {
        matches!(
            BackendMessage::frame_len(&self.read_buffer),
            Ok(Some(len)) if self.read_buffer.len() >= len
        )
    }

    // ========================================================================
    // COPY
    // ========================================================================

    /// Send one chunk of COPY FROM STDIN data.
    pub async fn put_copy_data(&mut self, data: &[u8]) -> PgResult<()> {
        self.expect_copy(CopyState::In)?;
        self.buffer_message(&CopyDataMessage { data });
        self.flush_all().await
    }

    /// Finish COPY FROM STDIN. With `error`, the server aborts the COPY
    /// with that message instead; the failure is then reported by
    /// [`get_result`](Self::get_result).
    pub async fn put_copy_end(&mut self, error: Option<&str>) -> PgResult<()> {
        self.expect_copy(CopyState::In)?;

        match error {
            Some(message) => {
                debug!("aborting copy: {} [{}]", message, self.addr());
                self.buffer_message(&CopyFailMessage {
                    message: message.to_string(),
                });
            }
            None => self.buffer_message(&CopyDoneMessage),
        }

        // The simple query protocol needs no Sync after COPY
        if let Some(collector) = self.pending.as_mut() {
            collector.end_copy_in();
        }
        self.flush_all().await
    }

    /// Receive the next chunk of COPY TO STDOUT data, waiting for it if
    /// needed. Returns `None` when the transfer is complete; the command's
    /// result is then available from [`get_result`](Self::get_result).
    pub async fn get_copy_data(&mut self) -> PgResult<Option<Bytes>> {
        loop {
            let Some(collector) = self.pending.as_mut() else {
                return Ok(None);
            };

            if let Some(data) = collector.pop_copy_data() {
                return Ok(Some(data));
            }
            if collector.copy_state() != Some(CopyState::Out) {
                return Ok(None);
            }

            let msg = self.receive_message().await?;
            self.dispatch(msg)?;
        }
    }

    fn expect_copy(&self, state: CopyState) -> PgResult<()> {
        let active = self.pending.as_ref().and_then(|c| c.copy_state());
        if active != Some(state) {
            return Err(PgError::ProtocolError(format!(
                "No COPY {} in progress",
                match state {
                    CopyState::In => "FROM STDIN",
                    CopyState::Out => "TO STDOUT",
                }
            )));
        }
        Ok(())
    }
}
