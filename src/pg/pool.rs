//! PostgreSQL connection pool.
//!
//! A small pool over a [`Connector`]. Connections that report themselves bad
//! are dropped instead of returned, and the connector's session-reset hook
//! runs before an idle connection is handed out again.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::connection::{ExecResult, PgConnection};
use super::connector::Connector;
use super::error::{PgError, PgResult};
use super::framing::Context;
use super::types::PgValue;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PgPoolConfig {
    /// Connections dialed up front
    pub min_connections: u32,
    /// Maximum number of connections checked out at once
    pub max_connections: u32,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
        }
    }
}

impl PgPoolConfig {
    /// Set the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// Dereferences to [`PgConnection`]. When dropped, the connection goes back
/// to the pool unless it is bad.
pub struct PooledConnection {
    /// The actual connection (None once returned to the pool)
    conn: Option<PgConnection>,
    pool: Arc<PgPoolInner>,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Take the connection out of the pool for good. The slot it held is
    /// freed.
    pub fn detach(mut self) -> Option<PgConnection> {
        self.conn.take()
    }
}

impl Deref for PooledConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        // Only `detach` and `drop` empty the option, and both consume self.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_bad() {
                tracing::debug!(pid = conn.process_id(), "discarding bad pooled connection");
                return;
            }
            if !self.pool.closed.load(Ordering::Acquire) {
                self.pool.idle_connections.lock().push(conn);
            }
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct PgPoolInner {
    connector: Connector,
    config: PgPoolConfig,
    /// Idle connections waiting to be used
    idle_connections: Mutex<Vec<PgConnection>>,
    /// Semaphore to limit total connections
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PgPoolInner>,
}

impl PgPool {
    /// Create a pool and dial `min_connections` up front.
    pub async fn connect(connector: Connector, config: PgPoolConfig) -> PgResult<Self> {
        let inner = Arc::new(PgPoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections.max(1) as usize)),
            connector,
            config,
            idle_connections: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let pool = Self { inner };

        let ctx = Context::background();
        for _ in 0..pool.inner.config.min_connections {
            let conn = pool.inner.connector.connect(&ctx).await?;
            pool.inner.idle_connections.lock().push(conn);
        }

        Ok(pool)
    }

    /// Get a connection from the pool.
    ///
    /// Idle connections go through the session-reset hook first; one that
    /// fails it is dropped and a fresh connection is dialed instead.
    pub async fn acquire(&self, ctx: &Context) -> PgResult<PooledConnection> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PgError::BadConnection)?;

        let conn = loop {
            let idle = self.inner.idle_connections.lock().pop();
            let Some(mut conn) = idle else {
                break self.inner.connector.connect(ctx).await?;
            };
            if conn.is_bad() {
                continue;
            }
            match self.reset(&mut conn).await {
                Ok(()) => break conn,
                Err(e) => {
                    tracing::debug!(error = %e, "session reset failed, dropping connection");
                    let _ = conn.close().await;
                }
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    async fn reset(&self, conn: &mut PgConnection) -> PgResult<()> {
        if let Some(hook) = &self.inner.connector.config().reset_session {
            hook(conn).await?;
            if conn.is_bad() {
                return Err(PgError::BadConnection);
            }
        }
        Ok(())
    }

    /// Run a statement on a pooled connection.
    pub async fn exec(&self, ctx: &Context, query: &str, args: &[PgValue]) -> PgResult<ExecResult> {
        let mut conn = self.acquire(ctx).await?;
        conn.exec_args(ctx, query, args).await
    }

    /// Close the pool and every idle connection. Connections checked out at
    /// this point are dropped when released.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();
        let connections = std::mem::take(&mut *self.inner.idle_connections.lock());

        for mut conn in connections {
            let _ = conn.close().await;
        }
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle_connections.lock().len()
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PgPoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }
}
