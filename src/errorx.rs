//! Failure taxonomy.
//!
//! Maps the errors produced by the networking, TLS and QUIC stacks onto the
//! closed set of failure strings shared by every probe implementation. The
//! strings and operation names are part of the measurement schema and must
//! not change.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::context::ContextError;

/// Type-erased error travelling through the dialer stack before it is
/// classified.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub const FAILURE_CONNECTION_REFUSED: &str = "connection_refused";
pub const FAILURE_CONNECTION_RESET: &str = "connection_reset";
pub const FAILURE_DNS_NXDOMAIN_ERROR: &str = "dns_nxdomain_error";
pub const FAILURE_EOF_ERROR: &str = "eof_error";
pub const FAILURE_GENERIC_TIMEOUT_ERROR: &str = "generic_timeout_error";
pub const FAILURE_INTERRUPTED: &str = "interrupted";
pub const FAILURE_SSL_INVALID_HOSTNAME: &str = "ssl_invalid_hostname";
pub const FAILURE_SSL_UNKNOWN_AUTHORITY: &str = "ssl_unknown_authority";
pub const FAILURE_SSL_INVALID_CERTIFICATE: &str = "ssl_invalid_certificate";
pub const FAILURE_UNKNOWN_PREFIX: &str = "unknown_failure";

/// Canonical failure identifier. Never a free-form error message, except for
/// the `unknown_failure: ...` bucket which carries the original text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Failure(Cow<'static, str>);

impl Failure {
    pub const CONNECTION_REFUSED: Failure = Failure(Cow::Borrowed(FAILURE_CONNECTION_REFUSED));
    pub const CONNECTION_RESET: Failure = Failure(Cow::Borrowed(FAILURE_CONNECTION_RESET));
    pub const DNS_NXDOMAIN_ERROR: Failure = Failure(Cow::Borrowed(FAILURE_DNS_NXDOMAIN_ERROR));
    pub const EOF_ERROR: Failure = Failure(Cow::Borrowed(FAILURE_EOF_ERROR));
    pub const GENERIC_TIMEOUT_ERROR: Failure =
        Failure(Cow::Borrowed(FAILURE_GENERIC_TIMEOUT_ERROR));
    pub const INTERRUPTED: Failure = Failure(Cow::Borrowed(FAILURE_INTERRUPTED));
    pub const SSL_INVALID_HOSTNAME: Failure = Failure(Cow::Borrowed(FAILURE_SSL_INVALID_HOSTNAME));
    pub const SSL_UNKNOWN_AUTHORITY: Failure =
        Failure(Cow::Borrowed(FAILURE_SSL_UNKNOWN_AUTHORITY));
    pub const SSL_INVALID_CERTIFICATE: Failure =
        Failure(Cow::Borrowed(FAILURE_SSL_INVALID_CERTIFICATE));

    /// Fallback bucket for errors the taxonomy does not recognize.
    pub fn unknown(message: impl fmt::Display) -> Self {
        Failure(Cow::Owned(format!("{FAILURE_UNKNOWN_PREFIX}: {message}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0.starts_with(FAILURE_UNKNOWN_PREFIX)
    }

    /// Lower is more specific. Used to pick one failure when several errors
    /// in a source chain are recognizable.
    fn priority(&self) -> u8 {
        match self.as_str() {
            FAILURE_INTERRUPTED => 0,
            FAILURE_DNS_NXDOMAIN_ERROR => 1,
            FAILURE_SSL_INVALID_HOSTNAME
            | FAILURE_SSL_UNKNOWN_AUTHORITY
            | FAILURE_SSL_INVALID_CERTIFICATE => 2,
            FAILURE_CONNECTION_REFUSED | FAILURE_CONNECTION_RESET => 3,
            FAILURE_EOF_ERROR => 4,
            FAILURE_GENERIC_TIMEOUT_ERROR => 5,
            _ => u8::MAX,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network step a failure or an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Resolve,
    Connect,
    TlsHandshake,
    QuicHandshake,
    Read,
    Write,
    HttpRoundTrip,
    TopLevel,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Resolve => "resolve",
            Operation::Connect => "connect",
            Operation::TlsHandshake => "tls_handshake",
            Operation::QuicHandshake => "quic_handshake",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::HttpRoundTrip => "http_round_trip",
            Operation::TopLevel => "top_level",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified error: what failed, where, and the raw cause.
#[derive(Debug, thiserror::Error)]
#[error("{failure}")]
pub struct MeasurementError {
    pub failure: Failure,
    pub operation: Operation,
    pub dial_id: Option<u64>,
    pub conn_id: Option<u64>,
    #[source]
    pub source: Option<BoxError>,
}

impl MeasurementError {
    pub fn new(failure: Failure, operation: Operation) -> Self {
        Self {
            failure,
            operation,
            dial_id: None,
            conn_id: None,
            source: None,
        }
    }

    /// Classifies `err` and tags it with `operation`. An error that is
    /// already a `MeasurementError` is returned unchanged so the innermost
    /// operation wins.
    pub fn wrap(err: BoxError, operation: Operation) -> Self {
        match err.downcast::<MeasurementError>() {
            Ok(wrapped) => *wrapped,
            Err(err) => Self {
                failure: classify(err.as_ref()),
                operation,
                dial_id: None,
                conn_id: None,
                source: Some(err),
            },
        }
    }

    pub fn with_dial_id(mut self, dial_id: Option<u64>) -> Self {
        if self.dial_id.is_none() {
            self.dial_id = dial_id;
        }
        self
    }

    pub fn with_conn_id(mut self, conn_id: Option<u64>) -> Self {
        if self.conn_id.is_none() {
            self.conn_id = conn_id;
        }
        self
    }
}

/// Maps any error to exactly one failure. Never panics.
pub fn classify(err: &(dyn StdError + 'static)) -> Failure {
    let mut best: Option<Failure> = None;
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(wrapped) = e.downcast_ref::<MeasurementError>() {
            return wrapped.failure.clone();
        }
        if let Some(candidate) = classify_by_type(e) {
            best = pick(best, candidate);
        }
        current = next_in_chain(e);
    }
    if let Some(failure) = best {
        return failure;
    }

    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(candidate) = classify_by_message(&e.to_string()) {
            best = pick(best, candidate);
        }
        current = next_in_chain(e);
    }
    best.unwrap_or_else(|| Failure::unknown(err))
}

/// `classify` lifted over an optional error: `None` means success.
pub fn classify_opt(err: Option<&(dyn StdError + 'static)>) -> Option<Failure> {
    err.map(classify)
}

fn pick(best: Option<Failure>, candidate: Failure) -> Option<Failure> {
    match best {
        Some(current) if current.priority() <= candidate.priority() => Some(current),
        _ => Some(candidate),
    }
}

// io::Error::source() skips the wrapped error itself, so look inside first.
fn next_in_chain<'a>(e: &'a (dyn StdError + 'static)) -> Option<&'a (dyn StdError + 'static)> {
    if let Some(io_err) = e.downcast_ref::<io::Error>() {
        if let Some(inner) = io_err.get_ref() {
            return Some(inner);
        }
    }
    e.source()
}

fn classify_by_type(e: &(dyn StdError + 'static)) -> Option<Failure> {
    if let Some(ctx_err) = e.downcast_ref::<ContextError>() {
        return Some(match ctx_err {
            ContextError::Canceled => Failure::INTERRUPTED,
            ContextError::DeadlineExceeded => Failure::GENERIC_TIMEOUT_ERROR,
        });
    }
    if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return Some(Failure::GENERIC_TIMEOUT_ERROR);
    }
    if let Some(tls_err) = e.downcast_ref::<rustls::Error>() {
        return classify_tls(tls_err);
    }
    if let Some(quic_err) = e.downcast_ref::<quinn::ConnectionError>() {
        return classify_quic(quic_err);
    }
    if let Some(io_err) = e.downcast_ref::<io::Error>() {
        return classify_io(io_err);
    }
    None
}

fn classify_tls(err: &rustls::Error) -> Option<Failure> {
    use rustls::CertificateError;
    match err {
        rustls::Error::InvalidCertificate(CertificateError::NotValidForName) => {
            Some(Failure::SSL_INVALID_HOSTNAME)
        }
        rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer) => {
            Some(Failure::SSL_UNKNOWN_AUTHORITY)
        }
        rustls::Error::InvalidCertificate(_) => Some(Failure::SSL_INVALID_CERTIFICATE),
        _ => None,
    }
}

fn classify_quic(err: &quinn::ConnectionError) -> Option<Failure> {
    match err {
        quinn::ConnectionError::TimedOut => Some(Failure::GENERIC_TIMEOUT_ERROR),
        quinn::ConnectionError::Reset => Some(Failure::CONNECTION_RESET),
        quinn::ConnectionError::ConnectionClosed(_) | quinn::ConnectionError::ApplicationClosed(_) => {
            Some(Failure::EOF_ERROR)
        }
        // Local TLS failures surface as transport errors whose reason is
        // the rustls message; the message pass handles them.
        _ => None,
    }
}

fn classify_io(err: &io::Error) -> Option<Failure> {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => return Some(Failure::CONNECTION_REFUSED),
        io::ErrorKind::ConnectionReset => return Some(Failure::CONNECTION_RESET),
        io::ErrorKind::UnexpectedEof => return Some(Failure::EOF_ERROR),
        io::ErrorKind::TimedOut => return Some(Failure::GENERIC_TIMEOUT_ERROR),
        _ => {}
    }
    match err.raw_os_error() {
        Some(os::ECONNREFUSED) => Some(Failure::CONNECTION_REFUSED),
        Some(os::ECONNRESET) => Some(Failure::CONNECTION_RESET),
        Some(os::ETIMEDOUT) => Some(Failure::GENERIC_TIMEOUT_ERROR),
        _ => None,
    }
}

fn classify_by_message(message: &str) -> Option<Failure> {
    let message = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| message.contains(needle));

    if has(&[
        "no such host",
        "name or service not known",
        "nodename nor servname provided",
        "no address associated with hostname",
        "name does not resolve",
        "nxdomain",
    ]) {
        return Some(Failure::DNS_NXDOMAIN_ERROR);
    }
    if has(&["notvalidforname", "certificate is not valid for"]) {
        return Some(Failure::SSL_INVALID_HOSTNAME);
    }
    if has(&["unknownissuer", "unknown authority"]) {
        return Some(Failure::SSL_UNKNOWN_AUTHORITY);
    }
    if has(&["invalid peer certificate", "bad certificate"]) {
        return Some(Failure::SSL_INVALID_CERTIFICATE);
    }
    if has(&["connection refused"]) {
        return Some(Failure::CONNECTION_REFUSED);
    }
    if has(&["connection reset"]) {
        return Some(Failure::CONNECTION_RESET);
    }
    if has(&["eof"]) {
        return Some(Failure::EOF_ERROR);
    }
    if has(&["timed out", "timeout"]) {
        return Some(Failure::GENERIC_TIMEOUT_ERROR);
    }
    None
}

/// OS error codes for platforms where `io::ErrorKind` does not already
/// normalize them.
#[cfg(target_os = "linux")]
mod os {
    pub const ECONNREFUSED: i32 = 111;
    pub const ECONNRESET: i32 = 104;
    pub const ETIMEDOUT: i32 = 110;
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod os {
    pub const ECONNREFUSED: i32 = 61;
    pub const ECONNRESET: i32 = 54;
    pub const ETIMEDOUT: i32 = 60;
}

#[cfg(windows)]
mod os {
    pub const ECONNREFUSED: i32 = 10061;
    pub const ECONNRESET: i32 = 10054;
    pub const ETIMEDOUT: i32 = 10060;
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    windows
)))]
mod os {
    pub const ECONNREFUSED: i32 = -1;
    pub const ECONNRESET: i32 = -2;
    pub const ETIMEDOUT: i32 = -3;
}
