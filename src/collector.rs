//! Response collection shared by the blocking and polling executors.
//!
//! A [`ResultCollector`] is created when a request is sent and is fed every
//! backend message belonging to that request, in order. It turns them into
//! [`QueryResult`]s that the connection hands out one by one, and it knows
//! when the request is complete (ReadyForQuery). It performs no I/O.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{DbError, PgError, PgResult};
use crate::protocol::{BackendMessage, TransactionStatus};
use crate::result::{QueryResult, ResultStatus};
use crate::statement::{PreparedStatement, SharedColumns};

/// What the outstanding request is.
#[derive(Debug)]
pub(crate) enum Request {
    /// Simple query protocol; may produce several results
    Query,
    /// Bind + Execute. Columns come from the prepared statement or from a
    /// portal Describe.
    Execute { columns: SharedColumns },
    /// Parse + Describe(Statement)
    Prepare { statement: PreparedStatement },
    /// Close(Statement)
    Deallocate { name: String },
}

/// Direction of an active COPY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyState {
    In,
    Out,
}

impl From<CopyState> for ResultStatus {
    fn from(state: CopyState) -> Self {
        match state {
            CopyState::In => ResultStatus::CopyIn,
            CopyState::Out => ResultStatus::CopyOut,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ResultCollector {
    request: Request,
    columns: SharedColumns,
    rows: Vec<Vec<Option<Bytes>>>,
    results: VecDeque<QueryResult>,
    copy: Option<CopyState>,
    copy_data: VecDeque<Bytes>,
    failed: bool,
    prepared: Option<PreparedStatement>,
    deallocated: Option<String>,
    done: bool,
}

impl ResultCollector {
    pub fn new(request: Request) -> Self {
        let columns = match request {
            Request::Execute { ref columns } => Arc::clone(columns),
            _ => Arc::new(Vec::new()),
        };
        Self {
            request,
            columns,
            rows: Vec::new(),
            results: VecDeque::new(),
            copy: None,
            copy_data: VecDeque::new(),
            failed: false,
            prepared: None,
            deallocated: None,
            done: false,
        }
    }

    /// Feed one backend message. Returns the transaction status once the
    /// request has completed.
    pub fn handle(&mut self, msg: BackendMessage) -> PgResult<Option<TransactionStatus>> {
        match msg {
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::NoData
            | BackendMessage::PortalSuspended => {}

            BackendMessage::CloseComplete => {
                if let Request::Deallocate { ref name } = self.request {
                    self.deallocated = Some(name.clone());
                }
            }

            BackendMessage::ParameterDescription { type_oids } => {
                if let Request::Prepare { ref mut statement } = self.request {
                    statement.set_param_types(type_oids);
                }
            }

            BackendMessage::RowDescription { fields } => {
                let columns = Arc::new(fields);
                if let Request::Prepare { ref mut statement } = self.request {
                    statement.set_columns(columns);
                } else {
                    self.columns = columns;
                    self.rows.clear();
                }
            }

            BackendMessage::DataRow { values } => {
                if values.len() != self.columns.len() {
                    return Err(PgError::ProtocolError(format!(
                        "DataRow has {} values, expected {}",
                        values.len(),
                        self.columns.len()
                    )));
                }
                self.rows.push(values);
            }

            BackendMessage::CommandComplete { tag } => {
                let rows = std::mem::take(&mut self.rows);
                let columns = match self.request {
                    // Each statement of a simple query describes its own rows
                    Request::Query => std::mem::replace(&mut self.columns, Arc::new(Vec::new())),
                    _ => Arc::clone(&self.columns),
                };
                self.copy = None;
                self.results
                    .push_back(QueryResult::completed(columns, rows, tag));
            }

            BackendMessage::EmptyQueryResponse => {
                self.results
                    .push_back(QueryResult::new(ResultStatus::EmptyQuery));
            }

            BackendMessage::ErrorResponse { fields } => {
                self.failed = true;
                self.copy = None;
                self.rows.clear();
                self.results
                    .push_back(QueryResult::failed(DbError::from_fields(fields)));
            }

            BackendMessage::CopyInResponse { .. } => {
                self.copy = Some(CopyState::In);
                self.results.push_back(QueryResult::new(ResultStatus::CopyIn));
            }

            BackendMessage::CopyOutResponse { .. } => {
                self.copy = Some(CopyState::Out);
                self.results
                    .push_back(QueryResult::new(ResultStatus::CopyOut));
            }

            // Only used by replication connections
            BackendMessage::CopyBothResponse { .. } => {
                self.results
                    .push_back(QueryResult::new(ResultStatus::BadResponse));
            }

            BackendMessage::CopyData { data } => {
                self.copy_data.push_back(data);
            }

            BackendMessage::CopyDone => {
                self.copy = None;
            }

            BackendMessage::ReadyForQuery { status } => {
                if !self.failed {
                    match self.request {
                        Request::Prepare { ref statement } => {
                            self.prepared = Some(statement.clone());
                            self.results
                                .push_back(QueryResult::new(ResultStatus::CommandOk));
                        }
                        Request::Deallocate { .. } => {
                            self.results
                                .push_back(QueryResult::new(ResultStatus::CommandOk));
                        }
                        _ => {}
                    }
                }
                self.copy = None;
                self.done = true;
                return Ok(Some(status));
            }

            other => {
                return Err(PgError::ProtocolError(format!(
                    "Unexpected message while collecting results: {:?}",
                    other
                )));
            }
        }

        Ok(None)
    }

    pub fn pop_result(&mut self) -> Option<QueryResult> {
        self.results.pop_front()
    }

    #[inline]
    pub fn has_result(&self) -> bool {
        !self.results.is_empty()
    }

    /// ReadyForQuery has arrived.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.done
    }

    #[inline]
    pub fn copy_state(&self) -> Option<CopyState> {
        self.copy
    }

    /// The client finished sending COPY data.
    pub fn end_copy_in(&mut self) {
        if self.copy == Some(CopyState::In) {
            self.copy = None;
        }
    }

    pub fn pop_copy_data(&mut self) -> Option<Bytes> {
        self.copy_data.pop_front()
    }

    /// Statement acknowledged by the server, to be registered.
    pub fn take_prepared(&mut self) -> Option<PreparedStatement> {
        self.prepared.take()
    }

    /// Statement closed on the server, to be unregistered.
    pub fn take_deallocated(&mut self) -> Option<String> {
        self.deallocated.take()
    }
}
