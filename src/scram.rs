//! SCRAM-SHA-256 authentication implementation.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL.
//! The server takes the user name from the startup packet, so the SCRAM
//! user name is sent empty.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// GS2 header without channel binding, base64 encoded (`n,,`).
const CHANNEL_BINDING: &str = "biws";

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    /// Password after SASLprep
    password: String,
    /// Client nonce
    client_nonce: String,
    /// Auth message for final verification
    auth_message: Option<String>,
    /// Salted password (cached for final step)
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        // Generate 18 bytes of random data, then base64 encode (24 chars)
        let mut rng = rand::thread_rng();
        let nonce_bytes: [u8; 18] = rng.gen();
        Self::with_nonce(password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(password: &str, client_nonce: String) -> Self {
        // Passwords that are not valid SASLprep input are used as raw bytes,
        // which is what the server does too.
        let password = stringprep::saslprep(password)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| password.to_string());

        Self {
            password,
            client_nonce,
            auth_message: None,
            salted_password: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.client_nonce)
    }

    /// Generate the initial client message (client-first-message).
    ///
    /// Format: `n,,n=,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Process the server's first message and generate the client's final message.
    ///
    /// Server message format: `r=<nonce>,s=<salt>,i=<iterations>`
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_str.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| ScramError::InvalidIterations)?,
                );
            } else if let Some(value) = part.strip_prefix("e=") {
                return Err(ScramError::ServerError(value.to_string()));
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;

        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }

        // The server nonce must extend ours
        if !combined_nonce.starts_with(&self.client_nonce)
            || combined_nonce.len() == self.client_nonce.len()
        {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c={},r={}", CHANNEL_BINDING, combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_str,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor_bytes(&client_key, &client_signature);

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        );
        Ok(client_final.into_bytes())
    }

    /// Verify the server's final message (server signature).
    ///
    /// Server message format: `v=<verifier>` or `e=<error>`
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        if let Some(err) = server_str.strip_prefix("e=") {
            return Err(ScramError::ServerError(err.to_string()));
        }

        let verifier_b64 = server_str
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or(ScramError::InvalidServerSignature)?;

        let server_signature = BASE64
            .decode(verifier_b64)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let salted_password = self.salted_password.ok_or(ScramError::InvalidState)?;
        let auth_message = self.auth_message.as_ref().ok_or(ScramError::InvalidState)?;

        let server_key = hmac_sha256(&salted_password, b"Server Key")?;
        let expected_signature = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if server_signature != expected_signature {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }

        Ok(())
    }
}

/// SCRAM authentication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Missing nonce in server message")]
    MissingNonce,
    #[error("Missing salt in server message")]
    MissingSalt,
    #[error("Missing iterations in server message")]
    MissingIterations,
    #[error("Server nonce verification failed")]
    NonceVerificationFailed,
    #[error("Invalid server signature")]
    InvalidServerSignature,
    #[error("Server signature verification failed")]
    ServerSignatureVerificationFailed,
    #[error("Server rejected authentication: {0}")]
    ServerError(String),
    #[error("Invalid SCRAM state")]
    InvalidState,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::InvalidState)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::InvalidState)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.iter().zip(b)) {
        *out = x ^ y;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Server side of the exchange, computed from the same primitives.
    fn server_signature(password: &str, salt: &[u8], iterations: u32, auth: &str) -> String {
        let salted = hi(password, salt, iterations).unwrap();
        let server_key = hmac_sha256(&salted, b"Server Key").unwrap();
        BASE64.encode(hmac_sha256(&server_key, auth.as_bytes()).unwrap())
    }

    #[test]
    fn test_scram_flow() {
        let mut client = ScramClient::new("pencil");

        let first = client.client_first_message();
        let first_str = String::from_utf8(first).unwrap();
        assert!(first_str.starts_with("n,,n=,r="));

        let client_nonce = &first_str["n,,n=,r=".len()..];
        let server_first = format!(
            "r={}SERVER_NONCE,s={},i=4096",
            client_nonce,
            BASE64.encode(b"salt1234salt1234")
        );

        let final_msg = client
            .process_server_first(server_first.as_bytes())
            .unwrap();
        let final_str = String::from_utf8(final_msg).unwrap();

        assert!(final_str.starts_with("c=biws,r="));
        assert!(final_str.contains(",p="));

        let without_proof = &final_str[..final_str.find(",p=").unwrap()];
        let auth = format!("n=,r={},{},{}", client_nonce, server_first, without_proof);
        let verifier = server_signature("pencil", b"salt1234salt1234", 4096, &auth);

        assert!(client
            .verify_server_final(format!("v={}", verifier).as_bytes())
            .is_ok());
        assert_eq!(
            client.verify_server_final(b"v=AAAA"),
            Err(ScramError::ServerSignatureVerificationFailed)
        );
    }

    /// RFC 7677 section 3 test vector, adapted to an empty user name.
    #[test]
    fn test_known_proof() {
        let mut client = ScramClient::with_nonce("pencil", "rOprNGfwEbeRWgbNEkqO".to_string());
        let server_first =
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

        let final_msg = client
            .process_server_first(server_first.as_bytes())
            .unwrap();
        let final_str = String::from_utf8(final_msg).unwrap();
        assert!(final_str
            .starts_with("c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p="));
    }

    #[test]
    fn test_server_first_rejections() {
        let mut client = ScramClient::with_nonce("pw", "abc".to_string());
        let salt = BASE64.encode(b"salt");

        assert_eq!(
            client.process_server_first(format!("r=xyz1,s={},i=4096", salt).as_bytes()),
            Err(ScramError::NonceVerificationFailed)
        );
        assert_eq!(
            client.process_server_first(format!("r=abc,s={},i=4096", salt).as_bytes()),
            Err(ScramError::NonceVerificationFailed)
        );
        assert_eq!(
            client.process_server_first(format!("r=abcd,s={},i=0", salt).as_bytes()),
            Err(ScramError::InvalidIterations)
        );
        assert_eq!(
            client.process_server_first(b"r=abcd,i=4096"),
            Err(ScramError::MissingSalt)
        );
        assert_eq!(
            client.process_server_first(b"e=other-error"),
            Err(ScramError::ServerError("other-error".to_string()))
        );
    }
}
