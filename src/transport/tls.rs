//! rustls client configuration for the SSL modes.
//!
//! `Prefer` and `Require` encrypt without checking the server certificate
//! (unless `Require` is given a root certificate, which upgrades it to
//! `VerifyCa` as libpq does). `VerifyCa` checks the chain but not the host
//! name; `VerifyFull` checks both.

use std::io::Cursor;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use crate::config::{CertificateSource, PgConfig, SslMode};
use crate::error::{PgError, PgResult};

/// Build the client configuration for `config.ssl_mode`.
pub(crate) fn client_config(config: &PgConfig) -> PgResult<Arc<ClientConfig>> {
    let provider = Arc::new(ring::default_provider());

    let verifier: Arc<dyn ServerCertVerifier> = match (&config.ssl_mode, &config.ssl_root_cert) {
        (SslMode::VerifyFull, Some(root)) => webpki_verifier(root, &provider)?,
        (SslMode::VerifyCa | SslMode::Require, Some(root)) => Arc::new(IgnoreHostname {
            inner: webpki_verifier(root, &provider)?,
        }),
        (SslMode::VerifyCa | SslMode::VerifyFull, None) => {
            return Err(PgError::Config(format!(
                "sslmode {:?} needs a root certificate",
                config.ssl_mode
            )))
        }
        _ => Arc::new(NoVerification {
            provider: Arc::clone(&provider),
        }),
    };

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| PgError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let client_config = match (&config.ssl_client_cert, &config.ssl_client_key) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert)?;
            let key = load_key(key)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| PgError::Tls(format!("invalid client certificate: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(client_config))
}

/// The SNI / verification name for `host`.
pub(crate) fn server_name(host: &str) -> PgResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| PgError::Tls(format!("invalid server name {host:?}: {e}")))
}

fn webpki_verifier(
    root: &CertificateSource,
    provider: &Arc<CryptoProvider>,
) -> PgResult<Arc<WebPkiServerVerifier>> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(root)? {
        store
            .add(cert)
            .map_err(|e| PgError::Tls(format!("could not parse root certificate: {e}")))?;
    }
    debug!(roots = store.len(), "loaded TLS root certificates");

    WebPkiServerVerifier::builder_with_provider(Arc::new(store), Arc::clone(provider))
        .build()
        .map_err(|e| PgError::Tls(e.to_string()))
}

fn load_certs(source: &CertificateSource) -> PgResult<Vec<CertificateDer<'static>>> {
    let pem = source.load()?;
    let certs = rustls_pemfile::certs(&mut Cursor::new(&*pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PgError::Tls(format!("could not parse certificate: {e}")))?;
    if certs.is_empty() {
        return Err(PgError::Tls(format!("no certificate found in {source:?}")));
    }
    Ok(certs)
}

fn load_key(source: &CertificateSource) -> PgResult<PrivateKeyDer<'static>> {
    let pem = source.load()?;
    rustls_pemfile::private_key(&mut Cursor::new(&*pem))
        .map_err(|e| PgError::Tls(format!("could not parse private key: {e}")))?
        .ok_or_else(|| PgError::Tls(format!("no private key found in {source:?}")))
}

/// Accepts any certificate; the connection is encrypted but not authenticated.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
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
        verify_tls12_signature(
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
        verify_tls13_signature(
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

/// Full chain verification, except that a host name mismatch is accepted.
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(err)) if is_name_mismatch(&err) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
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

// Newer rustls releases report the mismatch with context attached
// (`NotValidForNameContext`), so match on the variant name.
fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(err, CertificateError::NotValidForName)
        || format!("{err:?}").starts_with("NotValidForName")
}
