use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use lazy_static::lazy_static;
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::config::{ConfigError, DialerConfig};

lazy_static! {
    /// OS trust store, loaded on first use.
    static ref SYSTEM_ROOTS: Arc<RootCertStore> = Arc::new(load_native_roots());
}

fn load_native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let ders: Vec<Vec<u8>> = certs.into_iter().map(|cert| cert.0).collect();
            let (added, ignored) = roots.add_parsable_certificates(&ders);
            debug!(added, ignored, "loaded native root certificates");
        }
        Err(err) => warn!(error = %err, "cannot load native root certificates"),
    }
    roots
}

fn load_ca_bundle(path: &Path) -> Result<RootCertStore, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::CaBundle {
        path: path.to_path_buf(),
        source,
    })?;
    let ders = rustls_pemfile::certs(&mut BufReader::new(file)).map_err(|source| {
        ConfigError::CaBundle {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let mut roots = RootCertStore::empty();
    let (added, _) = roots.add_parsable_certificates(&ders);
    if added == 0 {
        return Err(ConfigError::EmptyCaBundle(path.to_path_buf()));
    }
    Ok(roots)
}

/// rustls client configurations for TLS-over-TCP and QUIC, sharing one
/// root store.
#[derive(Clone)]
pub struct TlsWrapper {
    tcp: Arc<ClientConfig>,
    quic: Arc<ClientConfig>,
}

impl TlsWrapper {
    /// Picks the roots in order: in-memory store, CA bundle, system store.
    pub fn from_config(config: &DialerConfig) -> Result<Self, ConfigError> {
        let roots = match (&config.root_store, &config.ca_bundle_path) {
            (Some(roots), _) => roots.as_ref().clone(),
            (None, Some(path)) => load_ca_bundle(path)?,
            (None, None) => SYSTEM_ROOTS.as_ref().clone(),
        };

        let tcp = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots.clone())
            .with_no_client_auth();

        let mut quic = ClientConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_root_certificates(roots)
            .with_no_client_auth();
        quic.alpn_protocols = config.quic_alpn.clone();

        Ok(Self {
            tcp: Arc::new(tcp),
            quic: Arc::new(quic),
        })
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.tcp.clone()
    }

    /// TLS 1.3 only, with the configured ALPN list.
    pub fn quic_client_config(&self) -> Arc<ClientConfig> {
        self.quic.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn in_memory_roots_win() {
        let config = DialerConfig::default().with_root_store(RootCertStore::empty());
        let wrapper = TlsWrapper::from_config(&config).unwrap();
        assert!(wrapper.client_config().alpn_protocols.is_empty());
        assert_eq!(wrapper.quic_client_config().alpn_protocols, vec![b"h3".to_vec()]);
    }

    #[test]
    fn missing_ca_bundle_is_a_config_error() {
        let config = DialerConfig {
            ca_bundle_path: Some("/nonexistent/ca.pem".into()),
            ..DialerConfig::default()
        };
        assert!(matches!(
            TlsWrapper::from_config(&config),
            Err(ConfigError::CaBundle { .. })
        ));
    }

    #[test]
    fn ca_bundle_without_certificates_is_rejected() {
        let path = std::env::temp_dir().join(format!("sni-probe-empty-{}.pem", std::process::id()));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "not a certificate").unwrap();
        let config = DialerConfig {
            ca_bundle_path: Some(path.clone()),
            ..DialerConfig::default()
        };
        let result = TlsWrapper::from_config(&config);
        let _ = std::fs::remove_file(&path);
        assert!(matches!(result, Err(ConfigError::EmptyCaBundle(_))));
    }
}
