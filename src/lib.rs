//! PostgreSQL client driver speaking the v3 wire protocol.
//!
//! This crate provides a client that:
//! - Uses the text format for parameters and results
//! - Tracks named prepared statements per connection
//! - Runs requests either to completion or one poll at a time
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `startup`, `scram`: Startup and authentication handshake
//! - `connection`: Connection state machine and blocking execution
//! - `nonblocking`: Poll-driven connect, send and COPY
//! - `collector`: Response collection shared by both execution modes
//! - `statement`: Prepared statement registry
//! - `result`: Buffered query results
//! - `types`, `escape`: Values, type names and SQL escaping
//! - `dml`, `meta`: Statement builders and catalog helpers
//!
//! ```no_run
//! # async fn run() -> pgsqli::PgResult<()> {
//! use pgsqli::{Config, Connection, PgValue};
//!
//! let config = Config::parse("host=localhost dbname=shop user=alice password=secret")?;
//! let mut conn = Connection::connect(config).await?;
//!
//! conn.prepare("by_id", "SELECT name FROM items WHERE id = $1").await?;
//! let mut result = conn.execute("by_id", &[PgValue::from(1i32)]).await?;
//! while let Ok(row) = result.fetch_row(None) {
//!     println!("{:?}", row);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
mod collector;
pub mod config;
pub mod connection;
pub mod dml;
pub mod error;
pub mod escape;
pub mod meta;
pub mod nonblocking;
pub mod protocol;
pub mod result;
pub mod scram;
mod startup;
pub mod statement;
pub mod types;

#[cfg(test)]
mod mock;

// Public API re-exports for library consumers
pub use cancel::CancelToken;
pub use config::Config;
pub use connection::{Connection, ConnectionStatus, Notification, VersionInfo};
pub use dml::DmlQuery;
pub use error::{DbError, ErrorField, PgError, PgResult};
pub use meta::{ColumnMeta, ExtendedMeta, FieldTable};
pub use nonblocking::{FlushStatus, PollingStatus};
pub use protocol::{FieldDescription, TransactionStatus};
pub use result::{FieldRef, QueryResult, ResultStatus};
pub use statement::{PreparedStatement, StatementRegistry};
pub use types::{Oid, PgValue};
