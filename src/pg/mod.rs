//! PostgreSQL wire protocol driver.
//!
//! This module implements the frontend side of protocol version 3 without a
//! native client library:
//! - Simple query protocol with lazily decoded text-format rows
//! - Cleartext, MD5 and SCRAM-SHA-256 authentication
//! - COPY FROM STDIN / COPY TO STDOUT
//! - LISTEN/NOTIFY with ping-based liveness and reconnect
//!
//! Architecture:
//! - `config`: DSN parsing, environment defaults and options
//! - `connector`: connection factory, shared stats and logger
//! - `stream` / `tls`: dialing and TLS negotiation
//! - `protocol`: low-level message encoding/decoding
//! - `framing`: message reader/writer with per-call deadlines
//! - `auth` / `scram`: authentication handshake
//! - `connection`: startup, query execution, state tracking
//! - `rows` / `types`: result cursor and per-OID decoding
//! - `copy`: COPY sub-protocol
//! - `listener`: LISTEN/NOTIFY
//! - `format`: client-side argument substitution
//! - `driver`: connection and cursor traits for callers above the driver
//! - `pool`: connection pool over a connector

pub mod auth;
pub mod config;
pub mod connection;
pub mod connector;
pub mod copy;
pub mod driver;
pub mod error;
pub mod format;
pub mod framing;
pub mod listener;
pub mod pool;
pub mod protocol;
pub mod rows;
pub mod scram;
pub mod stream;
pub mod tls;
pub mod types;


// Public API re-exports for library consumers
pub use config::{Config, Network, SslMode, Timeout};
pub use connection::{ConnState, ExecResult, PgConnection};
pub use connector::{Connector, DriverStats, Logger, TracingLogger};
pub use driver::{DriverConn, DriverRows};
pub use error::{PgError, PgResult, ServerError};
pub use framing::Context;
pub use listener::{ChannelOptions, Listener, Notification, NotificationChannel, OverflowHandler};
pub use pool::{PgPool, PgPoolConfig, PooledConnection};
pub use rows::{Row, RowDescription, Rows};
pub use stream::{BoxFuture, BoxSocket, DefaultDialer, Dialer, Socket};
pub use types::{Oid, PgValue};
