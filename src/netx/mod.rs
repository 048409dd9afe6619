//! Instrumented network primitives.
//!
//! Each primitive (resolver, TCP dialer, TLS handshaker, QUIC dialer) is a
//! trait with a system implementation and two decorators: an error wrapper
//! that classifies failures and a saver that records one [`Event`] per call.
//! [`InstrumentedDialer`] composes them into the full stack.
//!
//! [`Event`]: crate::trace::Event

pub mod dialer;
pub mod quicdialer;
pub mod resolver;
pub mod tlsdialer;

use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{ConfigError, DialerConfig};
use crate::context::ProbeContext;
use crate::errorx::{BoxError, MeasurementError, Operation};
use crate::tls_wrapper::TlsWrapper;
use crate::trace::Saver;

use self::dialer::{DnsDialer, ErrorWrapperDialer, SaverConnDialer, SaverDialer, SystemDialer};
use self::quicdialer::{
    DnsQuicDialer, ErrorWrapperQuicDialer, QuicSession, SaverQuicDialer, SystemQuicDialer,
};
use self::resolver::{ErrorWrapperResolver, Resolver, SaverResolver, SystemResolver};
use self::tlsdialer::{
    ErrorWrapperTlsHandshaker, SaverTlsHandshaker, SystemTlsHandshaker, TlsConn, TlsDialer,
};

/// Byte stream returned by dialers.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

pub type NetConn = Box<dyn Conn>;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address {0}: missing port in address")]
    MissingPort(String),
    #[error("address {0}: invalid port")]
    InvalidPort(String),
    #[error("address {0}: too many colons in address")]
    TooManyColons(String),
    #[error("address {0}: missing ']' in address")]
    MissingBracket(String),
}

/// Splits `host:port` or `[ipv6]:port`. The returned host has no brackets.
pub fn split_host_port(address: &str) -> Result<(&str, u16), AddressError> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| AddressError::MissingBracket(address.to_string()))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| AddressError::MissingPort(address.to_string()))?;
        (host, port)
    } else {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(address.to_string()))?;
        if host.contains(':') {
            return Err(AddressError::TooManyColons(address.to_string()));
        }
        (host, port)
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(address.to_string()))?;
    Ok((host, port))
}

/// Inverse of [`split_host_port`]; brackets IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Resolves `hostname`, skipping DNS for IP literals.
pub(crate) async fn lookup_host(
    resolver: &dyn Resolver,
    ctx: &ProbeContext,
    hostname: &str,
) -> Result<Vec<IpAddr>, BoxError> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    resolver.lookup_host(ctx, hostname).await
}

/// Picks one error out of a per-address attempt list: the first classified
/// one in attempt order, else the first one.
pub(crate) fn reduce_errors(errors: Vec<BoxError>) -> BoxError {
    let known = errors.iter().position(|err| {
        err.downcast_ref::<MeasurementError>()
            .map_or(false, |wrapped| !wrapped.failure.is_unknown())
    });
    let index = known.unwrap_or(0);
    match errors.into_iter().nth(index) {
        Some(err) => err,
        None => "no addresses to dial".into(),
    }
}

/// Fully traced TCP, TLS and QUIC dialer writing to one [`Saver`].
///
/// Every error it returns is a [`MeasurementError`].
#[derive(Clone)]
pub struct InstrumentedDialer {
    tcp: Arc<dyn dialer::Dialer>,
    tls: TlsDialer,
    quic: Arc<dyn quicdialer::QuicDialer>,
    saver: Saver,
}

impl InstrumentedDialer {
    pub fn new(config: &DialerConfig, saver: Saver) -> Result<Self, ConfigError> {
        let tls_configs = TlsWrapper::from_config(config)?;

        let resolver: Arc<dyn Resolver> = Arc::new(SaverResolver::new(
            ErrorWrapperResolver::new(SystemResolver),
            saver.clone(),
        ));

        let tcp: Arc<dyn dialer::Dialer> = Arc::new(DnsDialer::new(
            resolver.clone(),
            SaverConnDialer::new(
                SaverDialer::new(
                    ErrorWrapperDialer::new(SystemDialer::new(config.connect_timeout)),
                    saver.clone(),
                ),
                saver.clone(),
            ),
        ));

        let tls = TlsDialer::new(
            tcp.clone(),
            Arc::new(SaverTlsHandshaker::new(
                ErrorWrapperTlsHandshaker::new(SystemTlsHandshaker::new(
                    tls_configs.client_config(),
                    config.tls_handshake_timeout,
                )),
                saver.clone(),
            )),
        );

        let quic: Arc<dyn quicdialer::QuicDialer> = Arc::new(DnsQuicDialer::new(
            resolver,
            SaverQuicDialer::new(
                ErrorWrapperQuicDialer::new(SystemQuicDialer::new(
                    tls_configs.quic_client_config(),
                    config.quic_handshake_timeout,
                    Some(saver.clone()),
                )),
                saver.clone(),
            ),
        ));

        Ok(Self {
            tcp,
            tls,
            quic,
            saver,
        })
    }

    pub fn saver(&self) -> &Saver {
        &self.saver
    }

    pub async fn dial_context(
        &self,
        ctx: &ProbeContext,
        network: &str,
        address: &str,
    ) -> Result<NetConn, MeasurementError> {
        self.tcp
            .dial_context(ctx, network, address)
            .await
            .map_err(|err| MeasurementError::wrap(err, Operation::TopLevel))
    }

    pub async fn dial(&self, network: &str, address: &str) -> Result<NetConn, MeasurementError> {
        self.dial_context(&ProbeContext::background(), network, address)
            .await
    }

    /// Connects to `address` and performs a TLS handshake using
    /// `server_name` as SNI.
    pub async fn dial_tls_context(
        &self,
        ctx: &ProbeContext,
        network: &str,
        address: &str,
        server_name: &str,
    ) -> Result<TlsConn, MeasurementError> {
        self.tls
            .dial_tls_context(ctx, network, address, Some(server_name))
            .await
            .map_err(|err| MeasurementError::wrap(err, Operation::TopLevel))
    }

    /// QUIC handshake against every address `address` resolves to, in order.
    pub async fn dial_quic_context(
        &self,
        ctx: &ProbeContext,
        address: &str,
        server_name: &str,
    ) -> Result<QuicSession, MeasurementError> {
        self.quic
            .dial_context(ctx, address, server_name)
            .await
            .map_err(|err| MeasurementError::wrap(err, Operation::TopLevel))
    }
}
