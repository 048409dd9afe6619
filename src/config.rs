use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rustls::RootCertStore;
use serde::Deserialize;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUIC_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read CA bundle {path}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CA bundle {0} contains no usable certificate")]
    EmptyCaBundle(PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Command line of the `sni-probe` binary. Every option can also come from
/// its `SNI_PROBE_*` environment variable.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sni-probe",
    about = "Checks whether TLS handshakes are blocked based on SNI",
    version
)]
pub struct ProbeArgs {
    /// Domain or URL whose hostname is used as the SNI under test.
    #[arg(value_name = "INPUT")]
    pub input: String,

    /// Domain known to be reachable, used as the control SNI.
    #[arg(long, env = "SNI_PROBE_CONTROL_SNI", value_name = "DOMAIN")]
    pub control_sni: Option<String>,

    /// `host[:port]` of the TLS endpoint both handshakes connect to.
    #[arg(long, env = "SNI_PROBE_TEST_HELPER", value_name = "ADDR")]
    pub test_helper: Option<String>,

    /// PEM bundle replacing the system trust roots.
    #[arg(long, env = "SNI_PROBE_CA_BUNDLE", value_name = "FILE")]
    pub ca_bundle: Option<PathBuf>,

    #[arg(long, env = "SNI_PROBE_CONNECT_TIMEOUT_MS", value_name = "MS", value_parser = parse_millis)]
    pub connect_timeout: Option<Duration>,

    #[arg(long, env = "SNI_PROBE_TLS_TIMEOUT_MS", value_name = "MS", value_parser = parse_millis)]
    pub tls_timeout: Option<Duration>,

    #[arg(long, env = "SNI_PROBE_QUIC_TIMEOUT_MS", value_name = "MS", value_parser = parse_millis)]
    pub quic_timeout: Option<Duration>,

    /// Log at debug level.
    #[arg(short, long, env = "SNI_PROBE_VERBOSE")]
    pub verbose: bool,
}

impl ProbeArgs {
    /// Defaults overridden by whatever was given on the command line or in
    /// the environment.
    pub fn probe_config(&self) -> ProbeConfig {
        let mut config = ProbeConfig::default();
        if let Some(control_sni) = &self.control_sni {
            config.sni_blocking.control_sni = control_sni.clone();
        }
        if let Some(test_helper) = &self.test_helper {
            config.sni_blocking.test_helper_address = test_helper.clone();
        }
        config.dialer.ca_bundle_path = self
            .ca_bundle
            .clone()
            .filter(|path| !path.as_os_str().is_empty());
        if let Some(timeout) = self.connect_timeout {
            config.dialer.connect_timeout = timeout;
        }
        if let Some(timeout) = self.tls_timeout {
            config.dialer.tls_handshake_timeout = timeout;
        }
        if let Some(timeout) = self.quic_timeout {
            config.dialer.quic_handshake_timeout = timeout;
        }
        config
    }
}

/// Top-level probe configuration
#[derive(Debug, Clone, Default)]
pub struct ProbeConfig {
    pub dialer: DialerConfig,
    pub sni_blocking: SniBlockingConfig,
}

fn parse_millis(value: &str) -> Result<Duration, String> {
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(format!("{value:?} is not a positive number of milliseconds")),
    }
}

/// How the instrumented dialer stack connects and what it trusts
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub quic_handshake_timeout: Duration,
    /// PEM file replacing the system roots.
    pub ca_bundle_path: Option<PathBuf>,
    /// In-memory roots; take precedence over everything else.
    pub root_store: Option<Arc<RootCertStore>>,
    pub quic_alpn: Vec<Vec<u8>>,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            quic_handshake_timeout: DEFAULT_QUIC_HANDSHAKE_TIMEOUT,
            ca_bundle_path: None,
            root_store: None,
            quic_alpn: vec![b"h3".to_vec()],
        }
    }
}

impl DialerConfig {
    pub fn with_root_store(mut self, roots: RootCertStore) -> Self {
        self.root_store = Some(Arc::new(roots));
        self
    }
}

/// Options of the `sni_blocking` experiment
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SniBlockingConfig {
    /// Domain known to be reachable, used as the control SNI.
    #[serde(default)]
    pub control_sni: String,
    /// `host[:port]` of the TLS endpoint both probes connect to. Defaults to
    /// the control SNI.
    #[serde(default)]
    pub test_helper_address: String,
}

impl SniBlockingConfig {
    /// Test helper `host:port`, defaulting to the control SNI on port 443.
    pub fn effective_test_helper(&self) -> String {
        let address = if self.test_helper_address.is_empty() {
            self.control_sni.as_str()
        } else {
            self.test_helper_address.as_str()
        };
        if crate::netx::split_host_port(address).is_ok() {
            address.to_string()
        } else {
            crate::netx::join_host_port(address, 443)
        }
    }
}
