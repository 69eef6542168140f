//! LISTEN/NOTIFY.
//!
//! A [`Listener`] keeps one dedicated connection in LISTEN mode. Its socket
//! halves sit in a [`ConnSlot`] behind separate locks so that `listen` can
//! write while a receive is parked on the read side. The slot is replaced as
//! a whole on reconnect; a slot id guards against discarding a connection that
//! was already replaced.
//!
//! [`Listener::channel`] starts two background tasks:
//!
//! - the receive loop forwards notifications to a bounded queue and drops
//!   them when it is full;
//! - the ping loop expects some traffic every interval. After one silent
//!   interval it sends a NOTIFY on an internal channel through a second
//!   connection; after two it reconnects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use super::connection::PgConnection;
use super::connector::Connector;
use super::error::{PgError, PgResult, ServerError};
use super::format::quote_ident;
use super::framing::{Context, MessageReader, MessageWriter};
use super::protocol::{
    decode_error_fields, decode_notification, BackendTag, QueryMessage, TerminateMessage,
};

/// Channel used by the ping loop. Notifications on it are never forwarded.
pub const PING_CHANNEL: &str = "pgdriver:ping";

const DEFAULT_CHANNEL_SIZE: usize = 1000;
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);
const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

// ============================================================================
// Notification
// ============================================================================

/// A NOTIFY delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

impl Notification {
    /// Deserialize the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> PgResult<T> {
        serde_json::from_str(&self.payload)
            .map_err(|e| PgError::Type(format!("notification payload is not valid JSON: {}", e)))
    }
}

/// Called with every notification dropped because the queue was full.
pub type OverflowHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// Options for [`Listener::channel`].
#[derive(Clone)]
pub struct ChannelOptions {
    /// Capacity of the notification queue.
    pub size: usize,
    /// How long the connection may stay silent before it is pinged.
    pub ping_interval: Duration,
    pub overflow_handler: Option<OverflowHandler>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHANNEL_SIZE,
            ping_interval: DEFAULT_PING_INTERVAL,
            overflow_handler: None,
        }
    }
}

impl ChannelOptions {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_overflow_handler(mut self, handler: OverflowHandler) -> Self {
        self.overflow_handler = Some(handler);
        self
    }
}

/// Receiving end of [`Listener::channel`]. Clones share one queue, so each
/// notification goes to exactly one consumer.
#[derive(Clone)]
pub struct NotificationChannel {
    rx: Arc<Mutex<mpsc::Receiver<Notification>>>,
}

impl NotificationChannel {
    /// Next notification in server order. `None` once the listener is closed
    /// and the queue is drained.
    pub async fn recv(&self) -> Option<Notification> {
        self.rx.lock().await.recv().await
    }

    /// Next notification if one is queued and no other consumer holds the
    /// queue.
    pub fn try_recv(&self) -> Option<Notification> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

// ============================================================================
// Listener
// ============================================================================

/// One dialed LISTEN connection.
struct ConnSlot {
    id: u64,
    reader: Mutex<MessageReader>,
    writer: Mutex<MessageWriter>,
    /// Cancelled when the slot is discarded; wakes a parked receive.
    cancel: CancellationToken,
}

struct ListenerInner {
    connector: Connector,
    current: Mutex<Option<Arc<ConnSlot>>>,
    channels: parking_lot::Mutex<Vec<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
    output: parking_lot::Mutex<Option<NotificationChannel>>,
}

/// Outcome of waiting on one slot.
enum Received {
    Notification(Notification),
    TimedOut,
    /// The slot was discarded while waiting.
    Cancelled,
}

/// A LISTEN/NOTIFY subscriber. Cheap to clone; clones share the connection.
///
/// `listen`, `unlisten` and `receive*` are meant for a single logical owner.
/// Once [`channel`](Self::channel) is started, read from the returned queue
/// instead of calling `receive`. Call [`close`](Self::close) to stop the
/// background tasks.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub fn new(connector: Connector) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                connector,
                current: Mutex::new(None),
                channels: parking_lot::Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                output: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Channels currently subscribed to, in subscription order.
    pub fn channels(&self) -> Vec<String> {
        self.inner.channels.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Subscribe to `channels`. Channels already subscribed are skipped.
    pub async fn listen(&self, ctx: &Context, channels: &[&str]) -> PgResult<()> {
        self.inner.listen(ctx, channels).await
    }

    /// Unsubscribe from `channels`.
    ///
    /// Only an existing connection is told; a connection dialed later never
    /// subscribes to them.
    pub async fn unlisten(&self, ctx: &Context, channels: &[&str]) -> PgResult<()> {
        self.inner.ensure_open()?;
        let removed: Vec<String> = {
            let mut tracked = self.inner.channels.lock();
            let removed = channels
                .iter()
                .filter(|c| tracked.iter().any(|t| t.as_str() == **c))
                .map(|c| c.to_string())
                .collect();
            tracked.retain(|t| !channels.contains(&t.as_str()));
            removed
        };
        if removed.is_empty() {
            return Ok(());
        }

        let slot = self.inner.current.lock().await.clone();
        match slot {
            Some(slot) => self.inner.send_commands(ctx, &slot, "UNLISTEN", &removed).await,
            None => Ok(()),
        }
    }

    /// Wait for the next notification.
    ///
    /// Expiry of the `ctx` deadline while no message is pending returns
    /// [`PgError::Timeout`] and keeps the connection.
    pub async fn receive(&self, ctx: &Context) -> PgResult<Notification> {
        match self.inner.receive(ctx, None).await? {
            Some(n) => Ok(n),
            None => Err(PgError::Timeout),
        }
    }

    /// Wait at most `timeout` for the next notification; `Ok(None)` if none
    /// arrived.
    pub async fn receive_timeout(
        &self,
        ctx: &Context,
        timeout: Duration,
    ) -> PgResult<Option<Notification>> {
        self.inner.receive(ctx, Some(timeout)).await
    }

    /// Start the background receive and ping loops and return the queue they
    /// feed. Later calls return the same queue and ignore `options`.
    pub async fn channel(&self, options: ChannelOptions) -> PgResult<NotificationChannel> {
        self.inner.ensure_open()?;
        if let Some(existing) = self.inner.output.lock().clone() {
            return Ok(existing);
        }

        self.inner
            .listen(&Context::background(), &[PING_CHANNEL])
            .await?;

        let (tx, rx) = mpsc::channel(options.size.max(1));
        let output = NotificationChannel {
            rx: Arc::new(Mutex::new(rx)),
        };
        {
            let mut slot = self.inner.output.lock();
            if let Some(existing) = slot.clone() {
                return Ok(existing);
            }
            *slot = Some(output.clone());
        }

        let (alive_tx, alive_rx) = mpsc::channel(1);
        tokio::spawn(receive_loop(
            self.inner.clone(),
            tx,
            alive_tx,
            options.overflow_handler.clone(),
        ));
        tokio::spawn(ping_loop(self.inner.clone(), alive_rx, options.ping_interval));

        Ok(output)
    }

    /// Close the connection and stop the background loops. Further calls
    /// return [`PgError::ListenerClosed`]; the queue ends once drained.
    pub async fn close(&self) -> PgResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        let slot = self.inner.current.lock().await.take();
        if let Some(slot) = slot {
            slot.cancel.cancel();
            let mut writer = slot.writer.lock().await;
            let ctx = Context::background().with_timeout(Duration::from_secs(1));
            let _ = writer.send(&ctx, &TerminateMessage).await;
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    /// Force the current connection to be replaced, re-subscribing to every
    /// tracked channel.
    pub async fn reconnect(&self, ctx: &Context) -> PgResult<()> {
        self.inner.ensure_open()?;
        if let Some(id) = self.inner.current_id().await {
            self.inner.discard(id).await;
        }
        self.inner.acquire(ctx).await.map(|_| ())
    }
}

impl ListenerInner {
    fn ensure_open(&self) -> PgResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PgError::ListenerClosed);
        }
        Ok(())
    }

    fn log(&self, level: Level, message: std::fmt::Arguments<'_>) {
        self.connector.logger().log(level, message);
    }

    async fn current_id(&self) -> Option<u64> {
        self.current.lock().await.as_ref().map(|s| s.id)
    }

    async fn listen(&self, ctx: &Context, channels: &[&str]) -> PgResult<()> {
        self.ensure_open()?;
        let added: Vec<String> = {
            let mut tracked = self.channels.lock();
            let mut added = Vec::new();
            for c in channels {
                if !tracked.iter().any(|t| t.as_str() == *c) {
                    tracked.push(c.to_string());
                    added.push(c.to_string());
                }
            }
            added
        };

        let (slot, fresh) = self.acquire(ctx).await?;
        // A fresh connection already subscribed to everything tracked.
        if fresh || added.is_empty() {
            return Ok(());
        }
        self.send_commands(ctx, &slot, "LISTEN", &added).await
    }

    /// Current slot, dialing and subscribing a new one if there is none.
    /// The flag is true when the slot was just created.
    async fn acquire(&self, ctx: &Context) -> PgResult<(Arc<ConnSlot>, bool)> {
        let mut current = self.current.lock().await;
        self.ensure_open()?;
        if let Some(slot) = current.as_ref() {
            return Ok((slot.clone(), false));
        }

        let mut conn = self.connector.connect(ctx).await?;
        if self.closed.load(Ordering::Acquire) {
            let _ = conn.close().await;
            return Err(PgError::ListenerClosed);
        }
        let channels = self.channels.lock().clone();
        if !channels.is_empty() {
            let stmt = commands("LISTEN", &channels);
            if let Err(e) = conn.exec(ctx, &stmt).await {
                let _ = conn.close().await;
                return Err(e);
            }
        }
        let (reader, writer) = conn.into_split()?;

        let slot = Arc::new(ConnSlot {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            cancel: CancellationToken::new(),
        });
        tracing::debug!(slot = slot.id, channels = channels.len(), "listener connected");
        *current = Some(slot.clone());
        Ok((slot, true))
    }

    /// Drop the slot `id` if it is still the current one.
    async fn discard(&self, id: u64) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|s| s.id == id) {
            if let Some(slot) = current.take() {
                slot.cancel.cancel();
                tracing::debug!(slot = id, "listener connection discarded");
            }
        }
    }

    /// Write `LISTEN`/`UNLISTEN` for `channels` as one query. The replies are
    /// consumed by the receive path.
    async fn send_commands(
        &self,
        ctx: &Context,
        slot: &ConnSlot,
        verb: &str,
        channels: &[String],
    ) -> PgResult<()> {
        let query = commands(verb, channels);
        let result = slot.writer.lock().await.send(ctx, &QueryMessage { query: &query }).await;
        if let Err(e) = &result {
            if e.is_bad_conn() {
                self.discard(slot.id).await;
            }
        }
        result
    }

    async fn receive(&self, ctx: &Context, timeout: Option<Duration>) -> PgResult<Option<Notification>> {
        let deadline = ctx.bound(timeout);
        loop {
            self.ensure_open()?;
            let (slot, _) = self.acquire(ctx).await?;
            match receive_on(&slot, ctx, deadline).await {
                Ok(Received::Notification(n)) => return Ok(Some(n)),
                Ok(Received::TimedOut) if timeout.is_some() => return Ok(None),
                Ok(Received::TimedOut) => return Err(PgError::Timeout),
                // Replaced or closed; the loop picks up the new state.
                Ok(Received::Cancelled) => continue,
                Err(e) => {
                    if e.is_bad_conn() {
                        self.discard(slot.id).await;
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Wait on `slot` until a notification, the deadline or cancellation.
async fn receive_on(slot: &ConnSlot, ctx: &Context, deadline: Option<Instant>) -> PgResult<Received> {
    let mut reader = tokio::select! {
        _ = slot.cancel.cancelled() => return Ok(Received::Cancelled),
        reader = slot.reader.lock() => reader,
    };

    loop {
        tokio::select! {
            biased;
            _ = slot.cancel.cancelled() => return Ok(Received::Cancelled),
            ready = reader.wait_readable() => ready?,
            _ = sleep_until(deadline) => return Ok(Received::TimedOut),
        }

        let (tag, len) = reader.read_message_type(ctx).await?;
        match tag {
            BackendTag::NotificationResponse => {
                let body = reader.read_payload(ctx, len).await?;
                let (_pid, channel, payload) = decode_notification(body)?;
                return Ok(Received::Notification(Notification { channel, payload }));
            }
            BackendTag::ErrorResponse => {
                let body = reader.read_payload(ctx, len).await?;
                return Err(ServerError::new(decode_error_fields(body)?).into());
            }
            BackendTag::CommandComplete
            | BackendTag::ReadyForQuery
            | BackendTag::NoticeResponse
            | BackendTag::ParameterStatus => reader.discard(ctx, len).await?,
            other => {
                return Err(PgError::Protocol(format!(
                    "unexpected message {:?} on listener connection",
                    other
                )))
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn commands(verb: &str, channels: &[String]) -> String {
    channels
        .iter()
        .map(|c| format!("{} {}", verb, quote_ident(c)))
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Background loops
// ============================================================================

async fn receive_loop(
    inner: Arc<ListenerInner>,
    tx: mpsc::Sender<Notification>,
    alive: mpsc::Sender<()>,
    overflow: Option<OverflowHandler>,
) {
    let ctx = Context::background();
    let mut consecutive_errors = 0u32;

    loop {
        match inner.receive(&ctx, None).await {
            Ok(Some(n)) => {
                consecutive_errors = 0;
                let _ = alive.try_send(());
                if n.channel == PING_CHANNEL {
                    continue;
                }
                match tx.try_send(n) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(n)) => {
                        inner.log(
                            Level::WARN,
                            format_args!("notification queue full, dropping notification on {:?}", n.channel),
                        );
                        if let Some(handler) = &overflow {
                            handler(n);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
            Ok(None) => {}
            Err(PgError::ListenerClosed) => return,
            Err(e) => {
                consecutive_errors += 1;
                inner.log(Level::WARN, format_args!("listener receive failed: {}", e));
                if consecutive_errors > 1 {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

async fn ping_loop(inner: Arc<ListenerInner>, mut alive: mpsc::Receiver<()>, interval: Duration) {
    // Slot that missed the last interval. `Some(None)` when no slot was
    // connected at the time.
    let mut suspect: Option<Option<u64>> = None;
    let mut ping_conn: Option<PgConnection> = None;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            signal = alive.recv() => match signal {
                Some(()) => {
                    suspect = None;
                    continue;
                }
                None => break,
            },
            _ = tokio::time::sleep(interval) => {}
        }

        match suspect.take() {
            None => {
                suspect = Some(inner.current_id().await);
                let ctx = Context::background().with_timeout(interval);
                if let Err(e) = send_ping(&inner, &mut ping_conn, &ctx).await {
                    inner.log(Level::WARN, format_args!("listener ping failed: {}", e));
                }
            }
            Some(id) => {
                inner.log(Level::INFO, format_args!("listener missed two pings, reconnecting"));
                // A slot that replaced the silent one since the ping is kept.
                if let Some(id) = id {
                    inner.discard(id).await;
                }
            }
        }
    }

    if let Some(mut conn) = ping_conn {
        let _ = conn.close().await;
    }
}

async fn send_ping(
    inner: &ListenerInner,
    ping_conn: &mut Option<PgConnection>,
    ctx: &Context,
) -> PgResult<()> {
    let mut conn = match ping_conn.take() {
        Some(conn) if !conn.is_bad() => conn,
        _ => inner.connector.connect(ctx).await?,
    };
    let stmt = format!("NOTIFY {}", quote_ident(PING_CHANNEL));
    let result = conn.exec(ctx, &stmt).await.map(|_| ());
    *ping_conn = Some(conn);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Event {
            id: i64,
            kind: String,
        }

        let n = Notification {
            channel: "events".to_string(),
            payload: r#"{"id": 7, "kind": "insert"}"#.to_string(),
        };
        assert_eq!(
            n.payload_json::<Event>().unwrap(),
            Event { id: 7, kind: "insert".to_string() }
        );

        let bad = Notification {
            channel: "events".to_string(),
            payload: "not json".to_string(),
        };
        assert!(matches!(bad.payload_json::<Event>(), Err(PgError::Type(_))));
    }

    #[test]
    fn test_notification_serde() {
        let n = Notification {
            channel: "c".to_string(),
            payload: "p".to_string(),
        };
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(json, r#"{"channel":"c","payload":"p"}"#);
        assert_eq!(serde_json::from_str::<Notification>(&json).unwrap(), n);
    }

    #[test]
    fn test_channel_options() {
        let opts = ChannelOptions::default();
        assert_eq!(opts.size, 1000);
        assert_eq!(opts.ping_interval, Duration::from_secs(5));
        assert!(opts.overflow_handler.is_none());
        assert_eq!(ChannelOptions::default().with_size(0).size, 1);
    }

    #[test]
    fn test_commands_quote_names() {
        let cmd = commands("LISTEN", &["a".to_string(), "we\"ird".to_string()]);
        assert_eq!(cmd, "LISTEN \"a\"; LISTEN \"we\"\"ird\"");
    }

    #[tokio::test]
    async fn test_closed_listener_refuses_calls() {
        let listener = Listener::new(Connector::new(Default::default()));
        listener.close().await.unwrap();
        assert!(listener.is_closed());

        let ctx = Context::background();
        assert!(matches!(
            listener.listen(&ctx, &["x"]).await,
            Err(PgError::ListenerClosed)
        ));
        assert!(matches!(
            listener.receive(&ctx).await,
            Err(PgError::ListenerClosed)
        ));
        assert!(matches!(
            listener.channel(ChannelOptions::default()).await,
            Err(PgError::ListenerClosed)
        ));
        // Idempotent.
        listener.close().await.unwrap();
    }
}
