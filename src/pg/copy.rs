//! COPY-IN and COPY-OUT over the simple query protocol.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::connection::{unexpected, ExecResult, PgConnection};
use super::error::{PgError, PgResult};
use super::framing::{Context, WRITE_BUFFER_SIZE};
use super::protocol::{
    decode_command_complete, parse_rows_affected, BackendTag, CopyDataMessage, CopyDoneMessage,
    CopyFailMessage, QueryMessage,
};

/// Room left in a write buffer after the CopyData header.
const COPY_CHUNK_SIZE: usize = WRITE_BUFFER_SIZE - 5;

/// How the server answered a COPY statement.
enum CopyStart {
    Started,
    Failed(PgError),
}

impl PgConnection {
    /// Run a `COPY ... FROM STDIN` statement, streaming `source` to the server.
    ///
    /// If reading `source` fails the COPY is aborted with CopyFail and the
    /// read error is returned as [`PgError::Copy`]; the connection stays
    /// usable.
    pub async fn copy_from<R>(&mut self, ctx: &Context, source: R, query: &str) -> PgResult<ExecResult>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.copy_from_inner(ctx, source, query).await;
        self.track(result)
    }

    async fn copy_from_inner<R>(&mut self, ctx: &Context, mut source: R, query: &str) -> PgResult<ExecResult>
    where
        R: AsyncRead + Unpin,
    {
        if let CopyStart::Failed(e) = self.start_copy(ctx, query, BackendTag::CopyInResponse).await? {
            return Err(e);
        }

        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        loop {
            let n = match source.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let message = e.to_string();
                    self.writer.send(ctx, &CopyFailMessage { message: &message }).await?;
                    // The server answers CopyFail with an error of its own.
                    return match self.read_to_ready(ctx, None).await {
                        Err(server) if server.is_bad_conn() => Err(server),
                        _ => Err(PgError::Copy(e)),
                    };
                }
            };
            self.writer.send(ctx, &CopyDataMessage { data: &chunk[..n] }).await?;
        }

        self.writer.send(ctx, &CopyDoneMessage).await?;
        self.read_to_ready(ctx, None).await
    }

    /// Run a `COPY ... TO STDOUT` statement, writing every row to `dest`.
    ///
    /// A failed write to `dest` does not stop the protocol: the rest of the
    /// data is read and dropped, then the write error is returned as
    /// [`PgError::Copy`].
    pub async fn copy_to<W>(&mut self, ctx: &Context, dest: W, query: &str) -> PgResult<ExecResult>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.copy_to_inner(ctx, dest, query).await;
        self.track(result)
    }

    async fn copy_to_inner<W>(&mut self, ctx: &Context, mut dest: W, query: &str) -> PgResult<ExecResult>
    where
        W: AsyncWrite + Unpin,
    {
        if let CopyStart::Failed(e) = self.start_copy(ctx, query, BackendTag::CopyOutResponse).await? {
            return Err(e);
        }

        let mut write_err = None;
        let mut server_err = None;
        let mut rows_affected = 0;

        loop {
            let (tag, len) = self.reader.read_message_type(ctx).await?;
            match tag {
                BackendTag::CopyData => {
                    let data = self.reader.read_payload(ctx, len).await?;
                    if write_err.is_none() {
                        if let Err(e) = dest.write_all(&data).await {
                            write_err = Some(e);
                        }
                    }
                }
                BackendTag::CommandComplete => {
                    let body = self.reader.read_payload(ctx, len).await?;
                    rows_affected = parse_rows_affected(&decode_command_complete(body)?);
                }
                BackendTag::ErrorResponse => {
                    let e = self.read_error(ctx, len).await?;
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    server_err.get_or_insert(PgError::Server(e));
                }
                BackendTag::ReadyForQuery => {
                    self.read_ready(ctx, len).await?;
                    break;
                }
                BackendTag::ParameterStatus => self.read_parameter_status(ctx, len).await?,
                BackendTag::CopyDone
                | BackendTag::NoticeResponse
                | BackendTag::NotificationResponse => self.reader.discard(ctx, len).await?,
                other => return Err(unexpected(other, "COPY TO")),
            }
        }

        if write_err.is_none() {
            if let Err(e) = dest.flush().await {
                write_err = Some(e);
            }
        }

        match (write_err, server_err) {
            (Some(e), _) => Err(PgError::Copy(e)),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(ExecResult { rows_affected }),
        }
    }

    /// Send the COPY statement and wait for the expected Copy*Response.
    ///
    /// A non-fatal error before that point is drained through ReadyForQuery
    /// and returned as [`CopyStart::Failed`].
    async fn start_copy(
        &mut self,
        ctx: &Context,
        query: &str,
        expected: BackendTag,
    ) -> PgResult<CopyStart> {
        self.begin_op(ctx).await?;
        self.connector().stats().record_query();
        self.writer.send(ctx, &QueryMessage { query }).await?;

        loop {
            let (tag, len) = self.reader.read_message_type(ctx).await?;
            match tag {
                t if t == expected => {
                    self.reader.discard(ctx, len).await?;
                    return Ok(CopyStart::Started);
                }
                BackendTag::ErrorResponse => {
                    let e = self.read_error(ctx, len).await?;
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    let err = match self.read_to_ready(ctx, Some(PgError::Server(e))).await {
                        Err(err) => err,
                        Ok(_) => unexpected(tag, "COPY start"),
                    };
                    return Ok(CopyStart::Failed(err));
                }
                BackendTag::ParameterStatus => self.read_parameter_status(ctx, len).await?,
                BackendTag::NoticeResponse | BackendTag::NotificationResponse => {
                    self.reader.discard(ctx, len).await?
                }
                other => return Err(unexpected(other, "COPY start")),
            }
        }
    }
}
