//! Startup authentication.
//!
//! ```text
//! AwaitingAuthRequest --cleartext/md5--> AwaitingFinalOk --Ok--> Ready
//! AwaitingAuthRequest --SASL--> Scram --Continue--> Scram --Final--> AwaitingFinalOk
//! AwaitingAuthRequest --Ok--> Ready
//! ```
//!
//! An ErrorResponse at any point ends the handshake with the server error.
//! Any request that does not fit the current state is a protocol error.

use bytes::Bytes;

use super::error::{PgError, PgResult, ServerError};
use super::framing::{Context, MessageReader, MessageWriter};
use super::protocol::{
    decode_error_fields, AuthRequest, BackendTag, PasswordMessage, SaslInitialResponseMessage,
    SaslResponseMessage, SCRAM_SHA_256,
};
use super::scram::ScramClient;

enum AuthState {
    AwaitingAuthRequest,
    Scram(ScramClient),
    AwaitingFinalOk,
    Ready,
}

impl AuthState {
    fn name(&self) -> &'static str {
        match self {
            AuthState::AwaitingAuthRequest => "awaiting auth request",
            AuthState::Scram(_) => "SCRAM exchange",
            AuthState::AwaitingFinalOk => "awaiting AuthenticationOk",
            AuthState::Ready => "ready",
        }
    }
}

/// Drives the authentication exchange on a freshly started connection.
pub(crate) struct Authenticator<'a> {
    user: &'a str,
    password: Option<&'a str>,
}

impl<'a> Authenticator<'a> {
    pub(crate) fn new(user: &'a str, password: Option<&'a str>) -> Self {
        Self { user, password }
    }

    /// Run until AuthenticationOk.
    pub(crate) async fn run(
        &self,
        ctx: &Context,
        reader: &mut MessageReader,
        writer: &mut MessageWriter,
    ) -> PgResult<()> {
        let mut state = AuthState::AwaitingAuthRequest;

        loop {
            let (tag, len) = reader.read_message_type(ctx).await?;
            match tag {
                BackendTag::Authentication => {
                    let body = reader.read_payload(ctx, len).await?;
                    state = self.step(ctx, writer, state, AuthRequest::decode(body)?).await?;
                    if let AuthState::Ready = state {
                        return Ok(());
                    }
                }
                BackendTag::ErrorResponse => {
                    let body = reader.read_payload(ctx, len).await?;
                    return Err(ServerError::new(decode_error_fields(body)?).into());
                }
                BackendTag::NoticeResponse => reader.discard(ctx, len).await?,
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected {:?} during authentication ({})",
                        other,
                        state.name()
                    )))
                }
            }
        }
    }

    async fn step(
        &self,
        ctx: &Context,
        writer: &mut MessageWriter,
        state: AuthState,
        request: AuthRequest,
    ) -> PgResult<AuthState> {
        match (state, request) {
            (AuthState::AwaitingAuthRequest | AuthState::AwaitingFinalOk, AuthRequest::Ok) => {
                Ok(AuthState::Ready)
            }

            (AuthState::AwaitingAuthRequest, AuthRequest::CleartextPassword) => {
                let password = self.password()?.to_string();
                writer.send(ctx, &PasswordMessage { password }).await?;
                Ok(AuthState::AwaitingFinalOk)
            }

            (AuthState::AwaitingAuthRequest, AuthRequest::Md5Password { salt }) => {
                let password = md5_password(self.user, self.password()?, &salt);
                writer.send(ctx, &PasswordMessage { password }).await?;
                Ok(AuthState::AwaitingFinalOk)
            }

            (AuthState::AwaitingAuthRequest, AuthRequest::Sasl { mechanisms }) => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::Auth(format!(
                        "Server requires unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }

                let mut scram = ScramClient::new(self.user, self.password()?);
                let data = scram.client_first_message().map_err(scram_error)?;
                writer
                    .send(
                        ctx,
                        &SaslInitialResponseMessage {
                            mechanism: SCRAM_SHA_256.to_string(),
                            data,
                        },
                    )
                    .await?;
                Ok(AuthState::Scram(scram))
            }

            (AuthState::Scram(mut scram), AuthRequest::SaslContinue { data }) => {
                let data = scram.process_server_first(&data).map_err(scram_error)?;
                writer.send(ctx, &SaslResponseMessage { data }).await?;
                Ok(AuthState::Scram(scram))
            }

            (AuthState::Scram(mut scram), AuthRequest::SaslFinal { data }) => {
                verify_final(&mut scram, data)?;
                Ok(AuthState::AwaitingFinalOk)
            }

            (state, request) => Err(PgError::Protocol(format!(
                "unexpected authentication request {:?} ({})",
                request,
                state.name()
            ))),
        }
    }

    fn password(&self) -> PgResult<&'a str> {
        self.password
            .ok_or_else(|| PgError::Auth("Password required".to_string()))
    }
}

fn verify_final(scram: &mut ScramClient, data: Bytes) -> PgResult<()> {
    scram.verify_server_final(&data).map_err(scram_error)?;
    if !scram.is_validated() {
        return Err(PgError::Auth("SCRAM exchange did not validate the server".to_string()));
    }
    Ok(())
}

fn scram_error(e: super::scram::ScramError) -> PgError {
    PgError::Auth(e.to_string())
}

/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer_input = format!("{:x}", inner).into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}
