//! Connection factory.
//!
//! A [`Connector`] owns the immutable [`Config`] plus the state shared by all
//! of its connections: query/error counters, the logger and the write buffer
//! pool. It is cheap to clone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::Level;

use super::config::Config;
use super::connection::PgConnection;
use super::error::PgResult;
use super::framing::{BufferPool, Context};

// ============================================================================
// Logger
// ============================================================================

/// Sink for the driver's own diagnostics (reconnects, dropped notifications,
/// receive errors).
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: fmt::Arguments<'_>);
}

/// Forwards to `tracing` under the `pgdriver` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        match level {
            Level::ERROR => tracing::error!(target: "pgdriver", "{}", message),
            Level::WARN => tracing::warn!(target: "pgdriver", "{}", message),
            Level::INFO => tracing::info!(target: "pgdriver", "{}", message),
            Level::DEBUG => tracing::debug!(target: "pgdriver", "{}", message),
            _ => tracing::trace!(target: "pgdriver", "{}", message),
        }
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Counters shared by every connection of one connector.
#[derive(Debug, Default)]
pub struct DriverStats {
    queries: AtomicU64,
    errors: AtomicU64,
}

impl DriverStats {
    /// Statements sent (simple queries and COPY).
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Operations that returned an error.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub(crate) fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Connector
// ============================================================================

struct ConnectorInner {
    config: Config,
    stats: DriverStats,
    logger: Arc<dyn Logger>,
    buffers: BufferPool,
}

/// Creates [`PgConnection`]s from one configuration.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl Connector {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                config,
                stats: DriverStats::default(),
                logger: Arc::new(TracingLogger),
                buffers: BufferPool::new(),
            }),
        }
    }

    /// Parse `dsn` on top of the environment defaults.
    pub fn from_dsn(dsn: &str) -> PgResult<Self> {
        Ok(Self::new(Config::from_dsn(dsn)?))
    }

    /// Replace the logger. Counters start from zero on the returned value.
    pub fn with_logger(self, logger: Arc<dyn Logger>) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                config: self.inner.config.clone(),
                stats: DriverStats::default(),
                logger,
                buffers: self.inner.buffers.clone(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn stats(&self) -> &DriverStats {
        &self.inner.stats
    }

    pub fn logger(&self) -> &dyn Logger {
        self.inner.logger.as_ref()
    }

    pub(crate) fn buffers(&self) -> &BufferPool {
        &self.inner.buffers
    }

    /// Dial, authenticate and apply session parameters.
    ///
    /// The whole sequence is bounded by the dial timeout and the context
    /// deadline.
    pub async fn connect(&self, ctx: &Context) -> PgResult<PgConnection> {
        PgConnection::connect(self.clone(), ctx).await
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("config", &self.inner.config)
            .field("stats", &self.inner.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<(Level, String)>>);

    impl Logger for Recording {
        fn log(&self, level: Level, message: fmt::Arguments<'_>) {
            self.0.lock().push((level, message.to_string()));
        }
    }

    #[test]
    fn test_from_dsn() {
        let c = Connector::from_dsn("postgres://u:p@db:6543/app?sslmode=disable").unwrap();
        assert_eq!(c.config().addr, "db:6543");
        assert_eq!(c.stats().queries(), 0);
        assert!(Connector::from_dsn("http://db").is_err());
    }

    #[test]
    fn test_with_logger() {
        let rec = Arc::new(Recording::default());
        let c = Connector::new(Config::default()).with_logger(rec.clone());
        c.logger().log(Level::WARN, format_args!("dropped {}", 3));
        assert_eq!(rec.0.lock().as_slice(), &[(Level::WARN, "dropped 3".to_string())]);
    }

    #[test]
    fn test_stats_shared_between_clones() {
        let c = Connector::new(Config::default());
        let other = c.clone();
        c.stats().record_query();
        other.stats().record_error();
        assert_eq!(other.stats().queries(), 1);
        assert_eq!(c.stats().errors(), 1);
    }

    #[test]
    fn test_tracing_logger_does_not_panic() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        TracingLogger.log(Level::INFO, format_args!("hello"));
        TracingLogger.log(Level::TRACE, format_args!("quiet"));
    }
}
