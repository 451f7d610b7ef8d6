//! Out-of-band query cancellation.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::PgResult;
use crate::protocol::{CancelRequestMessage, FrontendMessage};

/// Everything needed to cancel a connection's running query from another
/// task, without touching the connection itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelToken {
    host: String,
    port: u16,
    process_id: i32,
    secret_key: i32,
}

impl CancelToken {
    pub(crate) fn new(host: String, port: u16, process_id: i32, secret_key: i32) -> Self {
        Self {
            host,
            port,
            process_id,
            secret_key,
        }
    }

    /// Backend process the cancellation is aimed at.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Request cancellation of whatever the backend is running.
    ///
    /// Success only means the request was delivered. If the query finished
    /// in the meantime nothing happens; otherwise it fails with SQLSTATE
    /// 57014 on its own connection.
    pub async fn cancel(&self) -> PgResult<()> {
        debug!(
            "cancelling backend {} [{}:{}]",
            self.process_id, self.host, self.port
        );

        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream
            .write_all(
                &CancelRequestMessage {
                    process_id: self.process_id,
                    secret_key: self.secret_key,
                }
                .encode(),
            )
            .await?;
        stream.flush().await?;

        // The server answers by closing the connection
        let mut buf = [0u8; 64];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }

        Ok(())
    }
}
