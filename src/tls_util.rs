use std::sync::{Arc, OnceLock};

use tokio_rustls::{TlsAcceptor, TlsConnector};

// The provider is pinned explicitly: with reqwest in the dependency graph
// more than one rustls crypto backend can be compiled in, and the implicit
// process-default lookup refuses to guess.
fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    static INSTANCE: OnceLock<Arc<rustls::crypto::CryptoProvider>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .clone()
}

/// Client config for tunnel egress: TLS 1.3 only, WebPKI verification, and
/// a resumption cache sized to match the peer's session cache.
pub fn create_tunnel_client_config() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder_with_provider(get_crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("TLS 1.3 is supported by the provider")
        .with_root_certificates(get_root_cert_store())
        .with_no_client_auth();
    config.resumption = rustls::client::Resumption::in_memory_sessions(128);
    config
}

pub fn tunnel_connector() -> TlsConnector {
    static INSTANCE: OnceLock<TlsConnector> = OnceLock::new();
    INSTANCE
        .get_or_init(|| TlsConnector::from(Arc::new(create_tunnel_client_config())))
        .clone()
}

fn get_root_cert_store() -> rustls::RootCertStore {
    rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// Server config from the PEM files produced by the certificate
/// collaborator. http/1.1 stays in ALPN so probing browsers negotiate
/// cleanly and receive the decoy page.
pub async fn create_server_acceptor(
    cert_file: &str,
    key_file: &str,
) -> std::io::Result<TlsAcceptor> {
    let cert_pem = tokio::fs::read(cert_file).await.map_err(|e| {
        std::io::Error::new(e.kind(), format!("failed to read {}: {}", cert_file, e))
    })?;
    let key_pem = tokio::fs::read(key_file).await.map_err(|e| {
        std::io::Error::new(e.kind(), format!("failed to read {}: {}", key_file, e))
    })?;

    let certs = parse_certs(&cert_pem)?;
    if certs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("no certificates found in {}", cert_file),
        ));
    }
    let key = parse_key(&key_pem)?;

    let mut config = rustls::ServerConfig::builder_with_provider(get_crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| {
            std::io::Error::other(format!("no protocol versions available: {}", e))
        })?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad certificate or key: {}", e),
            )
        })?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn parse_certs(
    pem: &[u8],
) -> std::io::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    use rustls::pki_types::pem::PemObject;
    rustls::pki_types::CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to parse certificate pem: {:?}", e),
            )
        })
}

fn parse_key(pem: &[u8]) -> std::io::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    use rustls::pki_types::pem::PemObject;
    rustls::pki_types::PrivateKeyDer::from_pem_slice(pem).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("failed to parse private key pem: {:?}", e),
        )
    })
}
