use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::sync::{Arc, OnceLock};

#[derive(thiserror::Error, Debug)]
pub enum TlsErr {
    #[error("dns name")]
    Dns,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

static GLOBAL_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

pub fn default_config() -> Arc<ClientConfig> {
    GLOBAL_CONFIG
        .get_or_init(|| {
            // Install default crypto provider
            let _ = rustls::crypto::ring::default_provider().install_default();

            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            let cfg = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Arc::new(cfg)
        })
        .clone()
}

/// Client-side TLS session for `host`; the caller drives it over its own
/// non-blocking socket.
pub fn client_session(host: &str, config: Arc<ClientConfig>) -> Result<ClientConnection, TlsErr> {
    let dns = ServerName::try_from(host.to_owned()).map_err(|_| TlsErr::Dns)?;
    Ok(ClientConnection::new(config, dns)?)
}
