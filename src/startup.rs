//! Startup and authentication handshake.
//!
//! [`Handshake`] is driven by the connection with each backend message
//! received after the startup packet, and answers with the bytes to send
//! next. Both the blocking and the polling connect paths use it.

use bytes::BytesMut;
use tracing::debug;

use crate::config::Config;
use crate::error::{DbError, PgError, PgResult};
use crate::protocol::*;
use crate::scram::{ScramClient, SCRAM_SHA_256};

/// What the connection should do after feeding a message.
#[derive(Debug)]
pub(crate) enum Step {
    /// Write these bytes, then keep reading.
    Send(BytesMut),
    /// Keep reading.
    Wait,
    /// The server is ready for queries.
    Ready(TransactionStatus),
}

pub(crate) struct Handshake {
    user: String,
    password: Option<String>,
    scram: Option<ScramClient>,
    backend_key: Option<(i32, i32)>,
}

impl Handshake {
    pub fn new(config: &Config) -> Self {
        Self {
            user: config.user.clone(),
            password: config.password.clone(),
            scram: None,
            backend_key: None,
        }
    }

    /// The startup packet that opens the conversation.
    pub fn startup_message(config: &Config) -> BytesMut {
        StartupMessage {
            user: config.user.clone(),
            database: config.dbname.clone(),
            options: config.startup_options(),
        }
        .encode()
    }

    /// Process id and secret key, once BackendKeyData has arrived.
    pub fn backend_key(&self) -> Option<(i32, i32)> {
        self.backend_key
    }

    pub fn handle(&mut self, msg: BackendMessage) -> PgResult<Step> {
        match msg {
            BackendMessage::AuthenticationOk => {
                debug!("authenticated as \"{}\"", self.user);
                Ok(Step::Wait)
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let password = self.password()?.to_string();
                Ok(Step::Send(PasswordMessage { password }.encode()))
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                let hash = md5_password(&self.user, self.password()?, &salt);
                Ok(Step::Send(PasswordMessage { password: hash }.encode()))
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::ConnectionError(format!(
                        "Server requires unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }

                let scram = ScramClient::new(self.password()?);
                let msg = SaslInitialResponseMessage {
                    mechanism: SCRAM_SHA_256.to_string(),
                    data: scram.client_first_message(),
                };
                self.scram = Some(scram);
                Ok(Step::Send(msg.encode()))
            }
            BackendMessage::AuthenticationSASLContinue { data } => {
                let scram = self.scram_mut()?;
                let client_final = scram
                    .process_server_first(&data)
                    .map_err(|e| PgError::ConnectionError(e.to_string()))?;
                Ok(Step::Send(SaslResponseMessage { data: client_final }.encode()))
            }
            BackendMessage::AuthenticationSASLFinal { data } => {
                self.scram_mut()?
                    .verify_server_final(&data)
                    .map_err(|e| PgError::ConnectionError(e.to_string()))?;
                Ok(Step::Wait)
            }
            BackendMessage::AuthenticationUnsupported { code } => Err(PgError::ConnectionError(
                format!("Unsupported authentication method requested by server: {}", code),
            )),
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.backend_key = Some((process_id, secret_key));
                Ok(Step::Wait)
            }
            BackendMessage::ReadyForQuery { status } => Ok(Step::Ready(status)),
            BackendMessage::ErrorResponse { fields } => Err(PgError::ConnectionError(
                DbError::from_fields(fields).to_string(),
            )),
            other => Err(PgError::ProtocolError(format!(
                "Unexpected message during startup: {:?}",
                other
            ))),
        }
    }

    fn password(&self) -> PgResult<&str> {
        self.password.as_deref().ok_or_else(|| {
            PgError::ConnectionError(format!(
                "Password required for user \"{}\" but none supplied",
                self.user
            ))
        })
    }

    fn scram_mut(&mut self) -> PgResult<&mut ScramClient> {
        self.scram.as_mut().ok_or_else(|| {
            PgError::ProtocolError("SASL message before SASL authentication started".to_string())
        })
    }
}

/// Compute MD5 password hash: `"md5" + md5(md5(password + user) + salt)`.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    // Convert inner hash to hex string, then append salt bytes
    let inner_hex = format!("{:x}", inner_hash);
    let mut hasher_input = inner_hex.as_bytes().to_vec();
    hasher_input.extend_from_slice(salt);

    let outer_hash = md5::compute(&hasher_input);
    format!("md5{:x}", outer_hash)
}
