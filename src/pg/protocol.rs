//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the subset of the PostgreSQL v3 protocol used by the
//! simple query, COPY and LISTEN/NOTIFY flows.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Magic code of the SSLRequest message.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// SASL mechanism supported by this driver.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// A message the client sends to the server.
///
/// `tag` is `None` for the untyped messages (startup, SSL request).
pub trait FrontendMessage {
    fn tag(&self) -> Option<u8>;

    /// Write the message payload (everything after the length word).
    fn encode_body(&self, buf: &mut BytesMut);
}

/// Frame a message into `buf`: optional tag, big-endian length including
/// itself, then the payload.
pub fn frame<M: FrontendMessage + ?Sized>(buf: &mut BytesMut, msg: &M) {
    if let Some(tag) = msg.tag() {
        buf.put_u8(tag);
    }
    let len_pos = buf.len();
    buf.put_i32(0);
    msg.encode_body(buf);
    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn tag(&self) -> Option<u8> {
        None
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32(PROTOCOL_VERSION);

        put_cstring(buf, "user");
        put_cstring(buf, &self.user);

        if let Some(ref db) = self.database {
            put_cstring(buf, "database");
            put_cstring(buf, db);
        }

        for (key, value) in &self.options {
            put_cstring(buf, key);
            put_cstring(buf, value);
        }

        // Terminator
        buf.put_u8(0);
    }
}

/// Request to upgrade the connection to TLS before startup.
#[derive(Debug, Clone, Copy)]
pub struct SslRequestMessage;

impl FrontendMessage for SslRequestMessage {
    fn tag(&self) -> Option<u8> {
        None
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn tag(&self) -> Option<u8> {
        Some(b'p')
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, &self.password);
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn tag(&self) -> Option<u8> {
        Some(b'Q')
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, self.query);
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn tag(&self) -> Option<u8> {
        Some(b'p')
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, &self.mechanism);
        buf.put_i32(self.data.len() as i32);
        buf.put_slice(&self.data);
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn tag(&self) -> Option<u8> {
        Some(b'p')
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }
}

/// CopyData message ('d') carrying one chunk of a COPY-IN stream.
#[derive(Debug, Clone, Copy)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn tag(&self) -> Option<u8> {
        Some(b'd')
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(self.data);
    }
}

/// CopyDone message ('c')
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn tag(&self) -> Option<u8> {
        Some(b'c')
    }

    fn encode_body(&self, _buf: &mut BytesMut) {}
}

/// CopyFail message ('f') - aborts a COPY-IN with an error message
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub message: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn tag(&self) -> Option<u8> {
        Some(b'f')
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, self.message);
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn tag(&self) -> Option<u8> {
        Some(b'X')
    }

    fn encode_body(&self, _buf: &mut BytesMut) {}
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Type byte of a backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTag {
    Authentication,
    BackendKeyData,
    ParameterStatus,
    ReadyForQuery,
    EmptyQueryResponse,
    RowDescription,
    DataRow,
    CommandComplete,
    ErrorResponse,
    NoticeResponse,
    NotificationResponse,
    CopyInResponse,
    CopyOutResponse,
    CopyData,
    CopyDone,
}

impl TryFrom<u8> for BackendTag {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        let tag = match b {
            b'R' => BackendTag::Authentication,
            b'K' => BackendTag::BackendKeyData,
            b'S' => BackendTag::ParameterStatus,
            b'Z' => BackendTag::ReadyForQuery,
            b'I' => BackendTag::EmptyQueryResponse,
            b'T' => BackendTag::RowDescription,
            b'D' => BackendTag::DataRow,
            b'C' => BackendTag::CommandComplete,
            b'E' => BackendTag::ErrorResponse,
            b'N' => BackendTag::NoticeResponse,
            b'A' => BackendTag::NotificationResponse,
            b'G' => BackendTag::CopyInResponse,
            b'H' => BackendTag::CopyOutResponse,
            b'd' => BackendTag::CopyData,
            b'c' => BackendTag::CopyDone,
            _ => {
                return Err(PgError::Protocol(format!(
                    "Unknown message type: {:?}",
                    b as char
                )))
            }
        };
        Ok(tag)
    }
}

impl BackendTag {
    pub fn as_byte(self) -> u8 {
        match self {
            BackendTag::Authentication => b'R',
            BackendTag::BackendKeyData => b'K',
            BackendTag::ParameterStatus => b'S',
            BackendTag::ReadyForQuery => b'Z',
            BackendTag::EmptyQueryResponse => b'I',
            BackendTag::RowDescription => b'T',
            BackendTag::DataRow => b'D',
            BackendTag::CommandComplete => b'C',
            BackendTag::ErrorResponse => b'E',
            BackendTag::NoticeResponse => b'N',
            BackendTag::NotificationResponse => b'A',
            BackendTag::CopyInResponse => b'G',
            BackendTag::CopyOutResponse => b'H',
            BackendTag::CopyData => b'd',
            BackendTag::CopyDone => b'c',
        }
    }
}

/// Body of an Authentication ('R') message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
}

impl AuthRequest {
    pub fn decode(mut body: Bytes) -> PgResult<Self> {
        let auth_type = get_i32(&mut body)?;

        match auth_type {
            0 => Ok(AuthRequest::Ok),
            3 => Ok(AuthRequest::CleartextPassword),
            5 => {
                ensure(&body, 4, "MD5 salt")?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(AuthRequest::Md5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(AuthRequest::Sasl { mechanisms })
            }
            11 => Ok(AuthRequest::SaslContinue { data: body }),
            12 => Ok(AuthRequest::SaslFinal { data: body }),
            _ => Err(PgError::Protocol(format!(
                "Unknown authentication request: {}",
                auth_type
            ))),
        }
    }
}

/// Decode a BackendKeyData ('K') body into `(process_id, secret_key)`.
pub fn decode_backend_key_data(mut body: Bytes) -> PgResult<(i32, i32)> {
    let process_id = get_i32(&mut body)?;
    let secret_key = get_i32(&mut body)?;
    Ok((process_id, secret_key))
}

/// Decode a ParameterStatus ('S') body into `(name, value)`.
pub fn decode_parameter_status(mut body: Bytes) -> PgResult<(String, String)> {
    let name = read_cstring(&mut body)?;
    let value = read_cstring(&mut body)?;
    Ok((name, value))
}

/// Decode a NotificationResponse ('A') body into `(process_id, channel, payload)`.
pub fn decode_notification(mut body: Bytes) -> PgResult<(i32, String, String)> {
    let process_id = get_i32(&mut body)?;
    let channel = read_cstring(&mut body)?;
    let payload = read_cstring(&mut body)?;
    Ok((process_id, channel, payload))
}

/// Decode a CommandComplete ('C') body into its tag.
pub fn decode_command_complete(mut body: Bytes) -> PgResult<String> {
    read_cstring(&mut body)
}

/// Decode ErrorResponse / NoticeResponse fields.
pub fn decode_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

/// Number of rows affected, taken from the numeral after the last space of a
/// command tag (`INSERT 0 5` -> 5, `UPDATE 3` -> 3, `CREATE TABLE` -> 0).
pub fn parse_rows_affected(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

// ============================================================================
// Helper Functions
// ============================================================================

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

pub(crate) fn ensure(buf: &Bytes, n: usize, what: &str) -> PgResult<()> {
    if buf.remaining() < n {
        return Err(PgError::Protocol(format!("Truncated {}", what)));
    }
    Ok(())
}

pub(crate) fn get_i16(buf: &mut Bytes) -> PgResult<i16> {
    ensure(buf, 2, "int16")?;
    Ok(buf.get_i16())
}

pub(crate) fn get_i32(buf: &mut Bytes) -> PgResult<i32> {
    ensure(buf, 4, "int32")?;
    Ok(buf.get_i32())
}

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
pub(crate) fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_message_is_untyped() {
        let msg = StartupMessage {
            user: "test".to_string(),
            database: Some("testdb".to_string()),
            options: vec![],
        };

        let mut buf = BytesMut::new();
        frame(&mut buf, &msg);

        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len());
        let version = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(*buf.last().unwrap(), 0);
    }

    #[test]
    fn test_query_message_length_excludes_tag() {
        let mut buf = BytesMut::new();
        frame(&mut buf, &QueryMessage { query: "SELECT 1" });

        assert_eq!(buf[0], b'Q');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len, 13);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn test_sasl_initial_response_layout() {
        let mut buf = BytesMut::new();
        frame(
            &mut buf,
            &SaslInitialResponseMessage {
                mechanism: SCRAM_SHA_256.to_string(),
                data: b"n,,n=u,r=abc".to_vec(),
            },
        );

        assert_eq!(buf[0], b'p');
        let body = &buf[5..];
        assert!(body.starts_with(b"SCRAM-SHA-256\0"));
        let data_len = i32::from_be_bytes(body[14..18].try_into().unwrap());
        assert_eq!(data_len, 12);
        assert_eq!(&body[18..], b"n,,n=u,r=abc");
    }

    #[test]
    fn test_copy_done_is_five_bytes() {
        let mut buf = BytesMut::new();
        frame(&mut buf, &CopyDoneMessage);
        assert_eq!(&buf[..], &[b'c', 0, 0, 0, 4]);
    }

    #[test]
    fn test_unknown_backend_tag() {
        assert!(matches!(
            BackendTag::try_from(b'1'),
            Err(PgError::Protocol(_))
        ));
        assert_eq!(BackendTag::try_from(b'A').unwrap(), BackendTag::NotificationResponse);
        assert_eq!(BackendTag::CopyData.as_byte(), b'd');
    }

    #[test]
    fn test_auth_request_decoding() {
        let body = Bytes::from_static(&[0, 0, 0, 5, 0x12, 0x34, 0x56, 0x78]);
        assert_eq!(
            AuthRequest::decode(body).unwrap(),
            AuthRequest::Md5Password {
                salt: [0x12, 0x34, 0x56, 0x78]
            }
        );

        let body = Bytes::from_static(b"\0\0\0\x0aSCRAM-SHA-256\0\0");
        assert_eq!(
            AuthRequest::decode(body).unwrap(),
            AuthRequest::Sasl {
                mechanisms: vec![SCRAM_SHA_256.to_string()]
            }
        );

        let body = Bytes::from_static(&[0, 0, 0, 7]);
        assert!(matches!(AuthRequest::decode(body), Err(PgError::Protocol(_))));
    }

    #[test]
    fn test_truncated_md5_request_is_protocol_error() {
        let body = Bytes::from_static(&[0, 0, 0, 5, 0x12]);
        assert!(matches!(AuthRequest::decode(body), Err(PgError::Protocol(_))));
    }

    #[test]
    fn test_error_fields() {
        let body = Bytes::from_static(b"SERROR\0C42P01\0Mrelation \"foo\" does not exist\0\0");
        let fields = decode_error_fields(body).unwrap();
        assert_eq!(fields.get(&b'C'), Some(&"42P01".to_string()));
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn test_notification_decoding() {
        let body = Bytes::from_static(b"\0\0\0\x2ajobs\0hello\0");
        let (pid, channel, payload) = decode_notification(body).unwrap();
        assert_eq!(pid, 42);
        assert_eq!(channel, "jobs");
        assert_eq!(payload, "hello");
    }

    #[test]
    fn test_parse_rows_affected() {
        assert_eq!(parse_rows_affected("INSERT 0 5"), 5);
        assert_eq!(parse_rows_affected("UPDATE 3"), 3);
        assert_eq!(parse_rows_affected("COPY 1000"), 1000);
        assert_eq!(parse_rows_affected("CREATE TABLE"), 0);
        assert_eq!(parse_rows_affected(""), 0);
    }

    #[test]
    fn test_missing_terminator() {
        let mut buf = Bytes::from_static(b"abc");
        assert!(read_cstring(&mut buf).is_err());
    }
}
