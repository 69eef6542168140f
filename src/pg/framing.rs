//! Message framing over a split socket.
//!
//! [`MessageReader`] reads the type byte and length of each backend message
//! and then either the payload or nothing (discard). [`MessageWriter`] frames
//! frontend messages into buffers checked out from a [`BufferPool`]. Every
//! socket operation is bounded by a deadline derived from the caller's
//! [`Context`] and the configured timeout.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::time::Instant;

use super::config::Timeout;
use super::error::{PgError, PgResult};
use super::protocol::{frame, BackendTag, FrontendMessage};
use super::stream::BoxSocket;

/// Size of pooled write buffers; also the COPY-IN chunk size.
pub const WRITE_BUFFER_SIZE: usize = 32 * 1024;
const READ_BUFFER_SIZE: usize = 32 * 1024;
const MAX_POOLED_BUFFERS: usize = 64;

// ============================================================================
// Context
// ============================================================================

/// Per-call deadline and timeout overrides.
///
/// The deadline belongs to the call, never to the connection: each socket
/// read or write is bounded by the earlier of the deadline and the
/// configured (or overridden) timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    deadline: Option<Instant>,
    read_timeout: Timeout,
    write_timeout: Timeout,
}

impl Context {
    /// No deadline, configured timeouts.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_read_timeout(mut self, timeout: Timeout) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Timeout) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Earlier of the deadline and `now + timeout`.
    pub(crate) fn bound(&self, timeout: Option<Duration>) -> Option<Instant> {
        let by_timeout = timeout.map(|t| Instant::now() + t);
        match (self.deadline, by_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Run `fut` until `deadline`, mapping expiry to [`PgError::Timeout`].
pub(crate) async fn until<T, F>(deadline: Option<Instant>, fut: F) -> PgResult<T>
where
    F: Future<Output = PgResult<T>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| PgError::Timeout)?,
        None => fut.await,
    }
}

// ============================================================================
// Buffer pool
// ============================================================================

/// Write buffers shared by the connections of one connector.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<BytesMut>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkout(&self) -> BytesMut {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(WRITE_BUFFER_SIZE))
    }

    /// Return a buffer. Oversized buffers are dropped so one large COPY
    /// chunk or query does not pin memory.
    pub fn checkin(&self, mut buf: BytesMut) {
        if buf.capacity() > 4 * WRITE_BUFFER_SIZE {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_BUFFERS {
            free.push(buf);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Read side of a connection.
pub struct MessageReader {
    reader: BufReader<ReadHalf<BoxSocket>>,
    /// Scratch space for fixed-size reads and small discards.
    scratch: [u8; 8],
    buf: BytesMut,
    read_timeout: Option<Duration>,
}

impl MessageReader {
    pub(crate) fn new(half: ReadHalf<BoxSocket>, read_timeout: Option<Duration>) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, half),
            scratch: [0u8; 8],
            buf: BytesMut::new(),
            read_timeout,
        }
    }

    fn deadline(&self, ctx: &Context) -> Option<Instant> {
        ctx.bound(ctx.read_timeout.resolve(self.read_timeout))
    }

    /// Read the next message's type byte and length word.
    ///
    /// Returns the tag and the payload length (the length word minus its own
    /// four bytes). The caller must consume exactly that many bytes.
    pub async fn read_message_type(&mut self, ctx: &Context) -> PgResult<(BackendTag, usize)> {
        let deadline = self.deadline(ctx);
        let reader = &mut self.reader;
        let scratch = &mut self.scratch;
        until(deadline, async {
            reader.read_exact(&mut scratch[..5]).await?;
            Ok(())
        })
        .await?;

        let tag = BackendTag::try_from(self.scratch[0])?;
        let len = i32::from_be_bytes([
            self.scratch[1],
            self.scratch[2],
            self.scratch[3],
            self.scratch[4],
        ]);
        if len < 4 {
            return Err(PgError::Protocol(format!(
                "invalid message length {} for {:?}",
                len, tag
            )));
        }
        Ok((tag, len as usize - 4))
    }

    /// Read exactly `n` payload bytes.
    pub async fn read_payload(&mut self, ctx: &Context, n: usize) -> PgResult<Bytes> {
        let deadline = self.deadline(ctx);
        self.buf.clear();
        self.buf.resize(n, 0);
        let reader = &mut self.reader;
        let buf = &mut self.buf;
        until(deadline, async {
            reader.read_exact(&mut buf[..]).await?;
            Ok(())
        })
        .await?;
        Ok(self.buf.split().freeze())
    }

    /// Read a full message.
    pub async fn read_message(&mut self, ctx: &Context) -> PgResult<(BackendTag, Bytes)> {
        let (tag, len) = self.read_message_type(ctx).await?;
        let body = self.read_payload(ctx, len).await?;
        Ok((tag, body))
    }

    /// Skip `n` bytes.
    pub async fn discard(&mut self, ctx: &Context, n: usize) -> PgResult<()> {
        if n == 0 {
            return Ok(());
        }
        let deadline = self.deadline(ctx);
        let reader = &mut self.reader;
        let scratch = &mut self.scratch;
        until(deadline, async {
            if n <= scratch.len() {
                reader.read_exact(&mut scratch[..n]).await?;
                return Ok(());
            }
            let copied = tokio::io::copy(&mut (&mut *reader).take(n as u64), &mut tokio::io::sink()).await?;
            if copied != n as u64 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            Ok(())
        })
        .await
    }

    /// Wait until at least one byte is buffered, without consuming it.
    ///
    /// Cancel-safe: dropping the future loses nothing.
    pub async fn wait_readable(&mut self) -> PgResult<()> {
        let available = self.reader.fill_buf().await?;
        if available.is_empty() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Write side of a connection.
pub struct MessageWriter {
    writer: WriteHalf<BoxSocket>,
    buffers: BufferPool,
    write_timeout: Option<Duration>,
}

impl MessageWriter {
    pub(crate) fn new(
        half: WriteHalf<BoxSocket>,
        buffers: BufferPool,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            writer: half,
            buffers,
            write_timeout,
        }
    }

    /// Frame and send one message, flushed.
    pub async fn send<M: FrontendMessage + ?Sized>(&mut self, ctx: &Context, msg: &M) -> PgResult<()> {
        let mut buf = self.buffers.checkout();
        frame(&mut buf, msg);
        let result = self.write_buf(ctx, &buf).await;
        self.buffers.checkin(buf);
        result
    }

    async fn write_buf(&mut self, ctx: &Context, buf: &[u8]) -> PgResult<()> {
        let deadline = ctx.bound(ctx.write_timeout.resolve(self.write_timeout));
        let writer = &mut self.writer;
        until(deadline, async {
            writer.write_all(buf).await?;
            writer.flush().await?;
            Ok(())
        })
        .await
    }

    pub(crate) fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub(crate) async fn shutdown(&mut self) -> PgResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Split a socket into framed halves.
pub(crate) fn split(
    socket: BoxSocket,
    buffers: BufferPool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
) -> (MessageReader, MessageWriter) {
    let (r, w) = tokio::io::split(socket);
    (
        MessageReader::new(r, read_timeout),
        MessageWriter::new(w, buffers, write_timeout),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::protocol::QueryMessage;
    use tokio::io::duplex;

    fn pair(read_timeout: Option<Duration>) -> (MessageReader, MessageWriter, tokio::io::DuplexStream) {
        let (client, server) = duplex(1 << 16);
        let (r, w) = split(Box::new(client), BufferPool::new(), read_timeout, None);
        (r, w, server)
    }

    #[tokio::test]
    async fn test_read_message_type_and_payload() {
        let (mut r, _w, mut server) = pair(None);
        server.write_all(b"C\0\0\0\x0dSELECT 1\0").await.unwrap();

        let ctx = Context::background();
        let (tag, len) = r.read_message_type(&ctx).await.unwrap();
        assert_eq!(tag, BackendTag::CommandComplete);
        assert_eq!(len, 9);
        let body = r.read_payload(&ctx, len).await.unwrap();
        assert_eq!(&body[..], b"SELECT 1\0");
    }

    #[tokio::test]
    async fn test_discard_small_and_large() {
        let (mut r, _w, mut server) = pair(None);
        let big = vec![7u8; 100_000];
        let mut data = Vec::new();
        data.extend_from_slice(&[1, 2, 3]);
        data.extend_from_slice(&big);
        data.extend_from_slice(b"Z\0\0\0\x05I");

        tokio::spawn(async move { server.write_all(&data).await.unwrap() });

        let ctx = Context::background();
        r.discard(&ctx, 3).await.unwrap();
        r.discard(&ctx, big.len()).await.unwrap();
        let (tag, len) = r.read_message_type(&ctx).await.unwrap();
        assert_eq!((tag, len), (BackendTag::ReadyForQuery, 1));
    }

    #[tokio::test]
    async fn test_short_length_is_protocol_error() {
        let (mut r, _w, mut server) = pair(None);
        server.write_all(b"Z\0\0\0\x02").await.unwrap();
        let err = r.read_message_type(&Context::background()).await.unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut r, _w, _server) = pair(Some(Duration::from_millis(20)));
        let err = r.read_message_type(&Context::background()).await.unwrap_err();
        assert!(err.is_timeout());

        let ctx = Context::background().with_read_timeout(Timeout::After(Duration::from_millis(5)));
        assert!(r.read_message_type(&ctx).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_context_deadline_wins() {
        let (mut r, _w, _server) = pair(Some(Duration::from_secs(60)));
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        assert!(r.read_message_type(&ctx).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_send_returns_buffer_to_pool() {
        let (_r, mut w, mut server) = pair(None);
        assert_eq!(w.buffers().idle(), 0);
        w.send(&Context::background(), &QueryMessage { query: "SELECT 1" })
            .await
            .unwrap();
        assert_eq!(w.buffers().idle(), 1);

        let mut got = [0u8; 14];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"Q\0\0\0\x0dSELECT 1\0");
    }

    #[test]
    fn test_bound_picks_earliest() {
        let ctx = Context::background();
        assert!(ctx.bound(None).is_none());

        let soon = Instant::now() + Duration::from_millis(5);
        let ctx = ctx.with_deadline(soon);
        assert_eq!(ctx.bound(Some(Duration::from_secs(60))), Some(soon));
        assert_eq!(ctx.bound(None), Some(soon));
    }
}
