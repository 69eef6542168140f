//! Byte streams under a connection: TCP, Unix sockets, TLS, or whatever a
//! custom [`Dialer`] returns.

use std::future::Future;
use std::io;
use std::pin::Pin;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::config::{Config, Network, SslMode};
use super::error::{PgError, PgResult};
use super::protocol::{frame, SslRequestMessage};
use super::tls;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional byte stream a connection can run over.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Socket for T {}

pub type BoxSocket = Box<dyn Socket>;

/// Opens the raw transport to the server.
///
/// Installed with [`Config::with_dialer`] to route connections through a
/// proxy, a tunnel, or an in-memory stream in tests.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, network: Network, addr: &'a str) -> BoxFuture<'a, io::Result<BoxSocket>>;
}

/// Dials TCP or Unix sockets with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDialer;

impl Dialer for DefaultDialer {
    fn dial<'a>(&'a self, network: Network, addr: &'a str) -> BoxFuture<'a, io::Result<BoxSocket>> {
        Box::pin(async move {
            match network {
                Network::Tcp => {
                    let stream = TcpStream::connect(addr).await?;
                    stream.set_nodelay(true)?;
                    Ok(Box::new(stream) as BoxSocket)
                }
                #[cfg(unix)]
                Network::Unix => {
                    let stream = tokio::net::UnixStream::connect(addr).await?;
                    Ok(Box::new(stream) as BoxSocket)
                }
                #[cfg(not(unix))]
                Network::Unix => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not supported on this platform",
                )),
            }
        })
    }
}

/// Dial the server and negotiate TLS according to `config.ssl_mode`.
pub(crate) async fn open(config: &Config) -> PgResult<BoxSocket> {
    let socket = match &config.dialer {
        Some(dialer) => dialer.dial(config.network, &config.addr).await?,
        None => DefaultDialer.dial(config.network, &config.addr).await?,
    };

    if !config.ssl_mode.is_enabled() || config.network == Network::Unix {
        return Ok(socket);
    }
    negotiate_tls(socket, config).await
}

/// Send SSLRequest and upgrade the stream if the server agrees.
///
/// A refusal (`N`) is an error for `require` and stricter modes and falls
/// back to plaintext for `allow` / `prefer`.
async fn negotiate_tls(mut socket: BoxSocket, config: &Config) -> PgResult<BoxSocket> {
    let mut buf = BytesMut::with_capacity(8);
    frame(&mut buf, &SslRequestMessage);
    socket.write_all(&buf).await?;
    socket.flush().await?;

    match socket.read_u8().await? {
        b'S' => {
            let tls_config = tls::build_client_config(config)?;
            let server_name = tls::server_name(config.host())?;
            let stream = TlsConnector::from(tls_config)
                .connect(server_name, socket)
                .await
                .map_err(|e| PgError::Tls(format!("TLS handshake failed: {}", e)))?;
            tracing::debug!(addr = %config.addr, "TLS established");
            Ok(Box::new(stream))
        }
        b'N' if !config.ssl_mode.is_required() => {
            tracing::debug!(addr = %config.addr, "server refused TLS, continuing in plaintext");
            Ok(socket)
        }
        b'N' => Err(PgError::Tls("SSL is not enabled on the server".to_string())),
        b => Err(PgError::Protocol(format!(
            "unexpected SSLRequest response: {:?}",
            b as char
        ))),
    }
}
