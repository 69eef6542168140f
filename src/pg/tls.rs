//! rustls client configuration for each [`SslMode`].
//!
//! - `allow` / `prefer` / `require`: encrypt, accept any certificate
//! - `verify-ca`: the chain must end in a trusted root, host name unchecked
//! - `verify-full`: trusted chain and matching host name
//!
//! Trusted roots come from `sslrootcert` when set, otherwise from the
//! platform store. `sslcert` / `sslkey` enable client authentication.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{WantsClientCert, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, ConfigBuilder, DigitallySignedStruct, RootCertStore, SignatureScheme};

use super::config::{Config, SslMode};
use super::error::{PgError, PgResult};

fn tls_error(message: impl Into<String>) -> PgError {
    PgError::Tls(message.into())
}

pub(crate) fn server_name(host: &str) -> PgResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| tls_error(format!("Invalid server name '{}': {}", host, e)))
}

/// Build the client configuration for `config.ssl_mode`.
pub(crate) fn build_client_config(config: &Config) -> PgResult<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?;

    let builder = match config.ssl_mode {
        SslMode::Disable => {
            return Err(tls_error("TLS config requested with sslmode=disable"));
        }
        SslMode::Allow | SslMode::Prefer | SslMode::Require => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { provider })),
        SslMode::VerifyCa => {
            let roots = Arc::new(load_roots(config.ssl_root_cert.as_deref())?);
            let inner = WebPkiServerVerifier::builder_with_provider(roots.clone(), provider.clone())
                .build()
                .map_err(|e| tls_error(format!("Failed to build verifier: {}", e)))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(CaOnlyVerifier {
                    roots,
                    inner,
                    provider,
                }))
        }
        SslMode::VerifyFull => {
            builder.with_root_certificates(load_roots(config.ssl_root_cert.as_deref())?)
        }
    };

    with_client_auth(builder, config).map(Arc::new)
}

fn with_client_auth(
    builder: ConfigBuilder<ClientConfig, WantsClientCert>,
    config: &Config,
) -> PgResult<ClientConfig> {
    match (&config.ssl_cert, &config.ssl_key) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert)?;
            let key = load_key(key)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| tls_error(format!("Invalid client certificate: {}", e)))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(tls_error("sslcert and sslkey must be set together")),
    }
}

fn load_roots(path: Option<&Path>) -> PgResult<RootCertStore> {
    let mut roots = RootCertStore::empty();

    match path {
        Some(path) => {
            let (added, _) = roots.add_parsable_certificates(load_certs(path)?);
            if added == 0 {
                return Err(tls_error(format!(
                    "No usable certificates in {}",
                    path.display()
                )));
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            if !native.errors.is_empty() {
                tracing::debug!(errors = ?native.errors, "some platform certificates failed to load");
            }
            roots.add_parsable_certificates(native.certs);
        }
    }

    Ok(roots)
}

fn load_certs(path: &Path) -> PgResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| tls_error(format!("Failed to open {}: {}", path.display(), e)))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("Failed to parse {}: {}", path.display(), e)))
}

fn load_key(path: &Path) -> PgResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| tls_error(format!("Failed to open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_error(format!("Failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| tls_error(format!("No private key in {}", path.display())))
}

// ============================================================================
// Verifiers
// ============================================================================

/// Accepts any server certificate. Signatures are still checked so the
/// handshake itself stays sound.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Checks the chain against the trusted roots but not the host name.
#[derive(Debug)]
struct CaOnlyVerifier {
    roots: Arc<RootCertStore>,
    inner: Arc<WebPkiServerVerifier>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for CaOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disable_has_no_tls_config() {
        let config = Config::default().with_ssl_mode(SslMode::Disable);
        assert!(matches!(build_client_config(&config), Err(PgError::Tls(_))));
    }

    #[test]
    fn test_require_builds_without_roots() {
        let config = Config::default().with_ssl_mode(SslMode::Require);
        assert!(build_client_config(&config).is_ok());
    }

    #[test]
    fn test_missing_root_cert_file() {
        let config = Config::default()
            .with_ssl_mode(SslMode::VerifyFull)
            .with_ssl_root_cert("/nonexistent/root.pem");
        assert!(matches!(build_client_config(&config), Err(PgError::Tls(_))));
    }

    #[test]
    fn test_client_cert_needs_key() {
        let mut config = Config::default().with_ssl_mode(SslMode::Require);
        config.ssl_cert = Some("client.pem".into());
        assert!(matches!(build_client_config(&config), Err(PgError::Tls(_))));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("db.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
