//! SCRAM-SHA-256 authentication implementation.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL.
//! The exchange is an explicit state machine:
//!
//! ```text
//! Initial --client_first--> ContinueSent --server_first--> FinalSent --server_final--> Validated
//! ```
//!
//! Calling a step out of order yields [`ScramError::InvalidState`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Progress of a SCRAM exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScramState {
    Initial,
    /// client-first-message sent, waiting for server-first-message.
    ContinueSent { client_first_bare: String },
    /// client-final-message sent, waiting for server-final-message.
    FinalSent { expected_server_signature: [u8; 32] },
    Validated,
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    state: ScramState,
}

impl ScramClient {
    /// Create a new SCRAM client with a random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes, base64 encoded (24 chars)
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    /// Create a client with a fixed nonce.
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            state: ScramState::Initial,
        }
    }

    /// Whether the server proved knowledge of the password.
    pub fn is_validated(&self) -> bool {
        self.state == ScramState::Validated
    }

    /// Generate the initial client message (client-first-message).
    ///
    /// Format: `n,,n=<username>,r=<client-nonce>`
    pub fn client_first_message(&mut self) -> Result<Vec<u8>, ScramError> {
        if self.state != ScramState::Initial {
            return Err(ScramError::InvalidState);
        }

        // GS2 header: n,, (no channel binding, no authzid)
        let bare = format!("n={},r={}", sasl_name(&self.username), self.client_nonce);
        let message = format!("n,,{}", bare).into_bytes();
        self.state = ScramState::ContinueSent {
            client_first_bare: bare,
        };
        Ok(message)
    }

    /// Process the server's first message and generate the client's final message.
    ///
    /// Server message format: `r=<nonce>,s=<salt>,i=<iterations>`
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let client_first_bare = match &self.state {
            ScramState::ContinueSent { client_first_bare } => client_first_bare.clone(),
            _ => return Err(ScramError::InvalidState),
        };

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
                return Err(ScramError::Server(value.to_string()));
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;
        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }

        // The server nonce must extend ours
        if combined_nonce.len() <= self.client_nonce.len()
            || !combined_nonce.starts_with(&self.client_nonce)
        {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            client_first_bare, server_str, client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor_bytes(&client_key, &client_signature);

        let server_key = hmac_sha256(&salted_password, b"Server Key")?;
        let expected_server_signature = hmac_sha256(&server_key, auth_message.as_bytes())?;

        self.state = ScramState::FinalSent {
            expected_server_signature,
        };

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
    pub fn verify_server_final(&mut self, server_msg: &[u8]) -> Result<(), ScramError> {
        let expected = match &self.state {
            ScramState::FinalSent {
                expected_server_signature,
            } => *expected_server_signature,
            _ => return Err(ScramError::InvalidState),
        };

        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        if let Some(err) = server_str.strip_prefix("e=") {
            return Err(ScramError::Server(err.to_string()));
        }

        let verifier_b64 = server_str
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or(ScramError::InvalidServerSignature)?;

        let server_signature = BASE64
            .decode(verifier_b64)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        if server_signature != expected {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }

        self.state = ScramState::Validated;
        Ok(())
    }
}

/// SCRAM authentication errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
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
    #[error("Server rejected SCRAM exchange: {0}")]
    Server(String),
    #[error("Invalid SCRAM state")]
    InvalidState,
    #[error("Key derivation failed")]
    KeyDerivation,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::KeyDerivation)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
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
    for (r, (x, y)) in result.iter_mut().zip(a.iter().zip(b.iter())) {
        *r = x ^ y;
    }
    result
}

/// Escape `=` and `,` in a saslname (RFC 5802 section 5.1).
fn sasl_name(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 section 3
    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn test_rfc7677_vector() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);

        let first = client.client_first_message().unwrap();
        assert_eq!(first, b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let fin = client.process_server_first(SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(fin).unwrap(), CLIENT_FINAL);

        assert!(!client.is_validated());
        client.verify_server_final(SERVER_FINAL.as_bytes()).unwrap();
        assert!(client.is_validated());
    }

    #[test]
    fn test_bad_server_signature() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);
        client.client_first_message().unwrap();
        client.process_server_first(SERVER_FIRST.as_bytes()).unwrap();

        let err = client
            .verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert_eq!(err, ScramError::ServerSignatureVerificationFailed);
        assert!(!client.is_validated());
    }

    #[test]
    fn test_out_of_order_steps() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);
        assert_eq!(
            client.process_server_first(SERVER_FIRST.as_bytes()),
            Err(ScramError::InvalidState)
        );
        assert_eq!(
            client.verify_server_final(SERVER_FINAL.as_bytes()),
            Err(ScramError::InvalidState)
        );

        client.client_first_message().unwrap();
        assert_eq!(client.client_first_message(), Err(ScramError::InvalidState));
    }

    #[test]
    fn test_foreign_nonce_rejected() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);
        client.client_first_message().unwrap();
        let err = client
            .process_server_first(b"r=somebodyelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert_eq!(err, ScramError::NonceVerificationFailed);
    }

    #[test]
    fn test_random_nonce_shape() {
        let mut client = ScramClient::new("user", "pencil");
        let first = String::from_utf8(client.client_first_message().unwrap()).unwrap();
        assert!(first.starts_with("n,,n=user,r="));
        assert_eq!(first.len(), "n,,n=user,r=".len() + 24);
    }

    #[test]
    fn test_sasl_name_escaping() {
        assert_eq!(sasl_name("a=b,c"), "a=3Db=2Cc");
    }
}
