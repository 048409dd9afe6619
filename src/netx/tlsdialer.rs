use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustls::{ClientConfig, ServerName};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::dialer::Dialer;
use super::{split_host_port, NetConn};
use crate::context::ProbeContext;
use crate::errorx::{classify, BoxError, MeasurementError, Operation};
use crate::trace::{Event, Saver, TlsState};

pub type TlsConn = tokio_rustls::client::TlsStream<NetConn>;

#[async_trait]
pub trait TlsHandshaker: Send + Sync {
    async fn handshake(
        &self,
        ctx: &ProbeContext,
        conn: NetConn,
        server_name: &str,
    ) -> Result<TlsConn, BoxError>;
}

/// rustls client handshake bounded by a handshake timeout.
#[derive(Clone)]
pub struct SystemTlsHandshaker {
    config: Arc<ClientConfig>,
    timeout: Duration,
}

impl SystemTlsHandshaker {
    pub fn new(config: Arc<ClientConfig>, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

#[async_trait]
impl TlsHandshaker for SystemTlsHandshaker {
    async fn handshake(
        &self,
        ctx: &ProbeContext,
        conn: NetConn,
        server_name: &str,
    ) -> Result<TlsConn, BoxError> {
        let name = ServerName::try_from(server_name)?;
        let connector = TlsConnector::from(self.config.clone());
        ctx.with_timeout(self.timeout)
            .run(connector.connect(name, conn))
            .await
    }
}

/// Classifies handshake failures as `tls_handshake` errors.
#[derive(Clone)]
pub struct ErrorWrapperTlsHandshaker<H> {
    handshaker: H,
}

impl<H: TlsHandshaker> ErrorWrapperTlsHandshaker<H> {
    pub fn new(handshaker: H) -> Self {
        Self { handshaker }
    }
}

#[async_trait]
impl<H: TlsHandshaker> TlsHandshaker for ErrorWrapperTlsHandshaker<H> {
    async fn handshake(
        &self,
        ctx: &ProbeContext,
        conn: NetConn,
        server_name: &str,
    ) -> Result<TlsConn, BoxError> {
        self.handshaker
            .handshake(ctx, conn, server_name)
            .await
            .map_err(|err| {
                let err = MeasurementError::wrap(err, Operation::TlsHandshake)
                    .with_dial_id(ctx.dial_id());
                Box::new(err) as BoxError
            })
    }
}

/// Records one `tls_handshake` event per handshake, with the negotiated
/// parameters on success.
#[derive(Clone)]
pub struct SaverTlsHandshaker<H> {
    handshaker: H,
    saver: Saver,
}

impl<H: TlsHandshaker> SaverTlsHandshaker<H> {
    pub fn new(handshaker: H, saver: Saver) -> Self {
        Self { handshaker, saver }
    }
}

#[async_trait]
impl<H: TlsHandshaker> TlsHandshaker for SaverTlsHandshaker<H> {
    async fn handshake(
        &self,
        ctx: &ProbeContext,
        conn: NetConn,
        server_name: &str,
    ) -> Result<TlsConn, BoxError> {
        let started = Instant::now();
        let result = self.handshaker.handshake(ctx, conn, server_name).await;
        let mut event = Event::new(Operation::TlsHandshake, started);
        event.dial_id = ctx.dial_id();
        event.proto = Some("tcp");
        event.tls = Some(match &result {
            Ok(tls) => connection_state(server_name, tls.get_ref().1),
            Err(_) => TlsState {
                server_name: server_name.to_string(),
                ..TlsState::default()
            },
        });
        event.failure = result.as_ref().err().map(|err| classify(err.as_ref()));
        debug!(server_name, failure = ?event.failure, "tls_handshake");
        self.saver.write(event);
        result
    }
}

fn connection_state(server_name: &str, conn: &rustls::ClientConnection) -> TlsState {
    TlsState {
        server_name: server_name.to_string(),
        version: conn
            .protocol_version()
            .map(tls_version_string)
            .unwrap_or_default(),
        cipher_suite: conn
            .negotiated_cipher_suite()
            .map(|suite| cipher_suite_string(suite.suite()))
            .unwrap_or_default(),
        negotiated_protocol: conn
            .alpn_protocol()
            .map(|proto| String::from_utf8_lossy(proto).into_owned())
            .unwrap_or_default(),
        peer_certificates: conn
            .peer_certificates()
            .map(|certs| certs.iter().map(|cert| cert.0.clone()).collect())
            .unwrap_or_default(),
    }
}

pub(crate) fn tls_version_string(version: rustls::ProtocolVersion) -> String {
    match version {
        rustls::ProtocolVersion::TLSv1_0 => "TLSv1".to_string(),
        rustls::ProtocolVersion::TLSv1_1 => "TLSv1.1".to_string(),
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{other:?}"),
    }
}

/// IANA-style name. rustls prefixes the TLS 1.3 suites with `TLS13_`.
pub(crate) fn cipher_suite_string(suite: rustls::CipherSuite) -> String {
    let name = format!("{suite:?}");
    match name.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{rest}"),
        None => name,
    }
}

/// TCP dial followed by a TLS handshake.
#[derive(Clone)]
pub struct TlsDialer {
    dialer: Arc<dyn Dialer>,
    handshaker: Arc<dyn TlsHandshaker>,
}

impl TlsDialer {
    pub fn new(dialer: Arc<dyn Dialer>, handshaker: Arc<dyn TlsHandshaker>) -> Self {
        Self { dialer, handshaker }
    }

    /// Uses the host part of `address` as SNI when `server_name` is `None`.
    pub async fn dial_tls_context(
        &self,
        ctx: &ProbeContext,
        network: &str,
        address: &str,
        server_name: Option<&str>,
    ) -> Result<TlsConn, BoxError> {
        let server_name = match server_name {
            Some(name) => name,
            None => split_host_port(address)?.0,
        };
        let conn = self.dialer.dial_context(ctx, network, address).await?;
        self.handshaker.handshake(ctx, conn, server_name).await
    }
}
