//! `sni_blocking` experiment.
//!
//! Connects to a test helper twice, once with the SNI under test and once
//! with a control SNI, and compares the outcomes. The helper presents its own
//! certificate, so a foreign SNI should fail with a name mismatch; any other
//! target failure hints at SNI-based interference.

pub mod cache;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, Instrument};
use url::{Host, Url};

use self::cache::{CacheKey, SubresultCache};
use crate::archival::{self, DnsQueryEntry, NetworkEvent, TcpConnectEntry, TlsHandshake};
use crate::config::SniBlockingConfig;
use crate::context::ProbeContext;
use crate::errorx::{self, Failure, Operation};
use crate::model::{ExperimentMeasurer, Measurement};
use crate::netx::join_host_port;
use crate::session::{Callbacks, ExperimentSession};
use crate::trace::Saver;

pub const EXPERIMENT_NAME: &str = "sni_blocking";
pub const EXPERIMENT_VERSION: &str = "0.1.0";

/// Upper bound for a whole run, on top of the caller's deadline.
pub const MAX_RUNTIME: Duration = Duration::from_secs(10);

const MAX_JITTER_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("{0:?}: contains control or whitespace characters")]
    IllegalCharacters(String),
    #[error("{input:?}: {source}")]
    Parse {
        input: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{0:?}: missing host")]
    MissingHost(String),
    #[error("{0:?}: missing port")]
    MissingPort(String),
    #[error("{0:?}: not a plain host:port")]
    NotHostPort(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SniBlockingError {
    #[error("experiment requires a control SNI")]
    MissingControlSni,
    #[error("experiment requires an input")]
    MissingInput,
    #[error("invalid input: {0}")]
    InvalidInput(#[from] TargetError),
    #[error("cannot serialize test keys: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("output channel closed after {received} of {expected} subresults")]
    Incomplete { received: usize, expected: usize },
}

/// Verdict on a (target, control) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    #[serde(rename = "anomaly.test_helper_unreachable")]
    TestHelperUnreachable,
    #[serde(rename = "anomaly.timeout")]
    Timeout,
    #[serde(rename = "anomaly.unexpected_failure")]
    UnexpectedFailure,
    #[serde(rename = "interference.closed")]
    Closed,
    #[serde(rename = "interference.invalid_certificate")]
    InvalidCertificate,
    #[serde(rename = "interference.reset")]
    Reset,
    #[serde(rename = "interference.unknown_authority")]
    UnknownAuthority,
    #[serde(rename = "success.got_server_hello")]
    GotServerHello,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::TestHelperUnreachable => "anomaly.test_helper_unreachable",
            Classification::Timeout => "anomaly.timeout",
            Classification::UnexpectedFailure => "anomaly.unexpected_failure",
            Classification::Closed => "interference.closed",
            Classification::InvalidCertificate => "interference.invalid_certificate",
            Classification::Reset => "interference.reset",
            Classification::UnknownAuthority => "interference.unknown_authority",
            Classification::GotServerHello => "success.got_server_hello",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one probe, keyed by SNI and test helper address.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Subresult {
    pub agent: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub bootstrap_time: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_cache: Vec<String>,
    pub failed_operation: Option<Operation>,
    pub failure: Option<Failure>,
    pub network_events: Option<Vec<NetworkEvent>>,
    pub queries: Option<Vec<DnsQueryEntry>>,
    #[serde(rename = "socksproxy", skip_serializing_if = "String::is_empty")]
    pub socks_proxy: String,
    pub tcp_connect: Option<Vec<TcpConnectEntry>>,
    pub tls_handshakes: Option<Vec<TlsHandshake>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tunnel: String,
    #[serde(skip)]
    pub cached: bool,
    pub sni: String,
    pub th_address: String,
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

impl Subresult {
    /// Probe that never started because the context was already done.
    fn interrupted(sni: &str, th_address: &str) -> Self {
        Self {
            failed_operation: Some(Operation::TopLevel),
            failure: Some(Failure::INTERRUPTED),
            sni: sni.to_string(),
            th_address: th_address.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestKeys {
    pub control: Subresult,
    pub result: Classification,
    pub target: Subresult,
}

/// Maps the target and control failures to a verdict. Total.
pub fn classify(target: Option<&Failure>, control: Option<&Failure>) -> Classification {
    let Some(target) = target else {
        return Classification::GotServerHello;
    };
    match target.as_str() {
        errorx::FAILURE_CONNECTION_REFUSED | errorx::FAILURE_DNS_NXDOMAIN_ERROR => {
            Classification::TestHelperUnreachable
        }
        errorx::FAILURE_CONNECTION_RESET => Classification::Reset,
        errorx::FAILURE_EOF_ERROR => Classification::Closed,
        // Every SNI except the helper's own gets a name mismatch, so this
        // means the handshake went through.
        errorx::FAILURE_SSL_INVALID_HOSTNAME => Classification::GotServerHello,
        errorx::FAILURE_SSL_UNKNOWN_AUTHORITY => Classification::UnknownAuthority,
        errorx::FAILURE_SSL_INVALID_CERTIFICATE => Classification::InvalidCertificate,
        errorx::FAILURE_GENERIC_TIMEOUT_ERROR => match control.map(Failure::as_str) {
            Some(errorx::FAILURE_GENERIC_TIMEOUT_ERROR) => Classification::TestHelperUnreachable,
            _ => Classification::Timeout,
        },
        _ => Classification::UnexpectedFailure,
    }
}

fn reject_illegal_characters(input: &str) -> Result<(), TargetError> {
    if input.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(TargetError::IllegalCharacters(input.to_string()));
    }
    Ok(())
}

/// Hostname of `input` when it is an absolute URL, `input` itself when it
/// is a bare domain.
///
/// Anything that parses as a URL without a host is rejected. This covers
/// `host:port` pairs, which parse with the host as scheme.
pub fn maybe_url_to_sni(input: &str) -> Result<String, TargetError> {
    reject_illegal_characters(input)?;
    match Url::parse(input) {
        Ok(url) => match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => Ok(domain.to_string()),
            Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
            Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
            _ => Err(TargetError::MissingHost(input.to_string())),
        },
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(input.to_string()),
        Err(source) => Err(TargetError::Parse {
            input: input.to_string(),
            source,
        }),
    }
}

/// Validates a test helper `host:port` and normalizes it for dialing.
fn parse_target(th_address: &str) -> Result<String, TargetError> {
    reject_illegal_characters(th_address)?;
    let url = Url::parse(&format!("tlshandshake://{th_address}")).map_err(|source| {
        TargetError::Parse {
            input: th_address.to_string(),
            source,
        }
    })?;
    if !url.username().is_empty()
        || url.password().is_some()
        || !url.path().is_empty()
        || url.query().is_some()
        || url.fragment().is_some()
    {
        return Err(TargetError::NotHostPort(th_address.to_string()));
    }
    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        _ => return Err(TargetError::MissingHost(th_address.to_string())),
    };
    let port = url
        .port()
        .ok_or_else(|| TargetError::MissingPort(th_address.to_string()))?;
    Ok(join_host_port(&host, port))
}

fn non_empty<T>(list: Vec<T>) -> Option<Vec<T>> {
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

#[derive(Clone)]
pub struct Measurer {
    config: SniBlockingConfig,
    cache: Arc<SubresultCache>,
}

impl Measurer {
    pub fn new(config: SniBlockingConfig) -> Self {
        Self {
            config,
            cache: Arc::new(SubresultCache::new()),
        }
    }

    pub fn config(&self) -> &SniBlockingConfig {
        &self.config
    }

    /// One TLS handshake against `th_address` using `sni`. Never fails:
    /// every problem ends up in the returned subresult.
    pub async fn measure_one(
        &self,
        ctx: &ProbeContext,
        sess: &dyn ExperimentSession,
        beginning: Instant,
        sni: &str,
        th_address: &str,
    ) -> Subresult {
        if ctx.err().is_some() {
            return Subresult::interrupted(sni, th_address);
        }
        // Spread concurrent probes so they do not hit the helper at once.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = ctx.done() => return Subresult::interrupted(sni, th_address),
        }

        let mut smk = Subresult {
            agent: "redirect".to_string(),
            sni: sni.to_string(),
            th_address: th_address.to_string(),
            ..Subresult::default()
        };

        let address = match parse_target(th_address) {
            Ok(address) => address,
            Err(err) => {
                smk.failed_operation = Some(Operation::TopLevel);
                smk.failure = Some(Failure::unknown(format!("invalid target URL: {err}")));
                return smk;
            }
        };

        let saver = Saver::new();
        let dialer = match sess.new_dialer(saver.clone()) {
            Ok(dialer) => dialer,
            Err(err) => {
                smk.failed_operation = Some(Operation::TopLevel);
                smk.failure = Some(Failure::unknown(err));
                return smk;
            }
        };
        match dialer.dial_tls_context(ctx, "tcp", &address, sni).await {
            // Dropping the stream closes the connection.
            Ok(_conn) => {}
            Err(err) => {
                smk.failed_operation = Some(err.operation);
                smk.failure = Some(err.failure);
            }
        }

        let events = saver.drain();
        smk.queries = non_empty(archival::new_dns_queries_list(beginning, &events));
        smk.tcp_connect = non_empty(archival::new_tcp_connect_list(beginning, &events));
        smk.tls_handshakes = non_empty(archival::new_tls_handshakes_list(beginning, &events));
        smk.network_events = non_empty(archival::new_network_events_list(beginning, &events));
        smk
    }

    /// Like [`Measurer::measure_one`] but at most once per
    /// `(th_address, sni)`, publishing the result on `output`.
    pub async fn measure_one_with_cache(
        &self,
        ctx: &ProbeContext,
        output: &mpsc::Sender<Subresult>,
        sess: &dyn ExperimentSession,
        beginning: Instant,
        sni: &str,
        th_address: &str,
    ) {
        let smk = self
            .cache
            .get_or_measure(CacheKey::new(th_address, sni), || {
                self.measure_one(ctx, sess, beginning, sni, th_address)
            })
            .await;
        debug!(
            sni,
            failure = smk.failure.as_ref().map_or("success", Failure::as_str),
            cached = smk.cached,
            "sni_blocking"
        );
        if output.send(smk).await.is_err() {
            debug!(sni, "sni_blocking: nobody is collecting subresults");
        }
    }
}

/// Collects one subresult per input from `outputs` and classifies the pair.
///
/// # Panics
///
/// When a subresult carries an SNI that was not dispatched.
pub async fn process_all(
    outputs: &mut mpsc::Receiver<Subresult>,
    callbacks: &dyn Callbacks,
    inputs: &[String],
    target_sni: &str,
    control_sni: &str,
) -> Result<TestKeys, SniBlockingError> {
    let mut control: Option<Subresult> = None;
    let mut target: Option<Subresult> = None;
    for completed in 1..=inputs.len() {
        let smk = outputs.recv().await.ok_or(SniBlockingError::Incomplete {
            received: completed - 1,
            expected: inputs.len(),
        })?;
        let slot = if smk.sni == control_sni && control.is_none() {
            &mut control
        } else if smk.sni == target_sni && target.is_none() {
            &mut target
        } else {
            panic!("unexpected SNI in subresult: {:?}", smk.sni);
        };
        callbacks.on_progress(
            completed as f64 / inputs.len() as f64,
            &format!(
                "sni_blocking: {}: {} [cached: {}]",
                smk.sni,
                smk.failure.as_ref().map_or("success", Failure::as_str),
                smk.cached
            ),
        );
        *slot = Some(smk);
    }

    let control = control.unwrap_or_default();
    let target = target.unwrap_or_default();
    let result = classify(target.failure.as_ref(), control.failure.as_ref());
    info!(target_sni, control_sni, %result, "sni_blocking: done");
    Ok(TestKeys {
        control,
        result,
        target,
    })
}

#[async_trait]
impl ExperimentMeasurer for Measurer {
    type Error = SniBlockingError;

    fn experiment_name(&self) -> &'static str {
        EXPERIMENT_NAME
    }

    fn experiment_version(&self) -> &'static str {
        EXPERIMENT_VERSION
    }

    async fn run(
        &self,
        ctx: &ProbeContext,
        sess: Arc<dyn ExperimentSession>,
        measurement: &mut Measurement,
        callbacks: &dyn Callbacks,
    ) -> Result<(), SniBlockingError> {
        if self.config.control_sni.is_empty() {
            return Err(SniBlockingError::MissingControlSni);
        }
        if measurement.input.is_empty() {
            return Err(SniBlockingError::MissingInput);
        }
        let sni = maybe_url_to_sni(&measurement.input)?;
        let th_address = self.config.effective_test_helper();
        measurement.test_name = EXPERIMENT_NAME.to_string();
        measurement.test_version = EXPERIMENT_VERSION.to_string();
        measurement.software_name = sess.software_name().to_string();
        measurement.software_version = sess.software_version().to_string();

        let span = sess.span();
        let ctx = ctx.with_timeout(MAX_RUNTIME);
        let inputs = vec![sni.clone(), self.config.control_sni.clone()];
        let (tx, mut rx) = mpsc::channel(inputs.len());
        let mut workers = JoinSet::new();
        for input in &inputs {
            let measurer = self.clone();
            let ctx = ctx.clone();
            let sess = sess.clone();
            let tx = tx.clone();
            let input = input.clone();
            let th_address = th_address.clone();
            let beginning = measurement.started;
            workers.spawn(
                async move {
                    measurer
                        .measure_one_with_cache(&ctx, &tx, sess.as_ref(), beginning, &input, &th_address)
                        .await;
                }
                .instrument(span.clone()),
            );
        }
        drop(tx);

        let collected = process_all(&mut rx, callbacks, &inputs, &sni, &self.config.control_sni)
            .instrument(span)
            .await;
        // A panicking worker drops its sender, so surface the panic before
        // reporting the short channel.
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
            }
        }
        let test_keys = collected?;

        measurement.test_runtime = measurement.started.elapsed().as_secs_f64();
        measurement.test_keys = serde_json::to_value(&test_keys)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigError, DialerConfig};
    use crate::netx::InstrumentedDialer;
    use crate::session::MockableSession;
    use std::sync::Mutex;

    fn session() -> Arc<dyn ExperimentSession> {
        let config = DialerConfig::default().with_root_store(rustls::RootCertStore::empty());
        Arc::new(MockableSession::new("sni-probe", "0.1.0", config))
    }

    fn measurer(control_sni: &str) -> Measurer {
        Measurer::new(SniBlockingConfig {
            control_sni: control_sni.to_string(),
            test_helper_address: String::new(),
        })
    }

    #[derive(Default)]
    struct RecordingCallbacks(Mutex<Vec<(f64, String)>>);

    impl Callbacks for RecordingCallbacks {
        fn on_progress(&self, percentage: f64, message: &str) {
            self.0.lock().unwrap().push((percentage, message.to_string()));
        }
    }

    fn failure(value: &Failure) -> Option<&Failure> {
        Some(value)
    }

    #[test]
    fn experiment_identity() {
        let m = measurer("example.com");
        assert_eq!(m.experiment_name(), "sni_blocking");
        assert_eq!(m.experiment_version(), "0.1.0");
    }

    #[test]
    fn classification_table() {
        let other = Failure::unknown("antani");
        let cases = [
            (None, None, Classification::GotServerHello),
            (failure(&Failure::CONNECTION_REFUSED), None, Classification::TestHelperUnreachable),
            (failure(&Failure::DNS_NXDOMAIN_ERROR), None, Classification::TestHelperUnreachable),
            (failure(&Failure::CONNECTION_RESET), None, Classification::Reset),
            (failure(&Failure::EOF_ERROR), None, Classification::Closed),
            (failure(&Failure::SSL_INVALID_HOSTNAME), None, Classification::GotServerHello),
            (failure(&Failure::SSL_UNKNOWN_AUTHORITY), None, Classification::UnknownAuthority),
            (failure(&Failure::SSL_INVALID_CERTIFICATE), None, Classification::InvalidCertificate),
            (
                failure(&Failure::GENERIC_TIMEOUT_ERROR),
                failure(&Failure::GENERIC_TIMEOUT_ERROR),
                Classification::TestHelperUnreachable,
            ),
            (failure(&Failure::GENERIC_TIMEOUT_ERROR), None, Classification::Timeout),
            (failure(&other), None, Classification::UnexpectedFailure),
        ];
        for (target, control, expected) in cases {
            assert_eq!(classify(target, control), expected, "target {target:?} control {control:?}");
        }
    }

    #[test]
    fn control_failure_only_matters_for_timeouts() {
        assert_eq!(
            classify(failure(&Failure::CONNECTION_RESET), failure(&Failure::GENERIC_TIMEOUT_ERROR)),
            Classification::Reset
        );
        assert_eq!(
            classify(failure(&Failure::GENERIC_TIMEOUT_ERROR), failure(&Failure::CONNECTION_RESET)),
            Classification::Timeout
        );
        assert_eq!(
            classify(None, failure(&Failure::GENERIC_TIMEOUT_ERROR)),
            Classification::GotServerHello
        );
    }

    #[test]
    fn classification_strings() {
        assert_eq!(
            serde_json::to_string(&Classification::UnknownAuthority).unwrap(),
            "\"interference.unknown_authority\""
        );
        assert_eq!(Classification::TestHelperUnreachable.to_string(), "anomaly.test_helper_unreachable");
    }

    #[test]
    fn maybe_url_to_sni_cases() {
        assert!(maybe_url_to_sni("\t").is_err());
        assert_eq!(maybe_url_to_sni("kernel.org").unwrap(), "kernel.org");
        assert_eq!(maybe_url_to_sni("https://kernel.org/robots.txt").unwrap(), "kernel.org");
        assert_eq!(maybe_url_to_sni("https://[::1]:8443/").unwrap(), "::1");
    }

    #[test]
    fn host_port_and_hostless_urls_are_not_domains() {
        for input in ["example.com:443", "localhost:8080", "mailto:someone", "file:///etc/hosts"] {
            assert!(
                matches!(maybe_url_to_sni(input), Err(TargetError::MissingHost(_))),
                "{input}"
            );
        }
    }

    #[test]
    fn parse_target_cases() {
        assert_eq!(parse_target("example.com:443").unwrap(), "example.com:443");
        assert_eq!(parse_target("[::1]:853").unwrap(), "[::1]:853");
        assert!(matches!(parse_target("example.com:443\t\t\t"), Err(TargetError::IllegalCharacters(_))));
        assert!(matches!(parse_target("example.com"), Err(TargetError::MissingPort(_))));
        assert!(matches!(parse_target("example.com:443/path"), Err(TargetError::NotHostPort(_))));
        assert!(parse_target("example.com:99999").is_err());
    }

    #[tokio::test]
    async fn measure_one_with_cancelled_context() {
        let ctx = ProbeContext::background();
        ctx.cancel();
        let sess = session();
        let smk = measurer("example.com")
            .measure_one(&ctx, sess.as_ref(), Instant::now(), "kernel.org", "example.com:443")
            .await;
        assert_eq!(smk.agent, "");
        assert_eq!(smk.failed_operation, Some(Operation::TopLevel));
        assert_eq!(smk.failure, Some(Failure::INTERRUPTED));
        assert!(smk.network_events.is_none());
        assert!(smk.queries.is_none());
        assert!(smk.tcp_connect.is_none());
        assert!(smk.tls_handshakes.is_none());
        assert_eq!(smk.sni, "kernel.org");
        assert_eq!(smk.th_address, "example.com:443");
        assert!(!smk.cached);
    }

    #[tokio::test]
    async fn measure_one_with_invalid_target() {
        let sess = session();
        let smk = measurer("example.com")
            .measure_one(
                &ProbeContext::background(),
                sess.as_ref(),
                Instant::now(),
                "kernel.org",
                "example.com:443\t\t\t",
            )
            .await;
        assert_eq!(smk.agent, "redirect");
        assert_eq!(smk.failed_operation, Some(Operation::TopLevel));
        let failure = smk.failure.unwrap();
        assert!(failure.as_str().contains("invalid target URL"), "{failure}");
        assert_eq!(smk.sni, "kernel.org");
        assert_eq!(smk.th_address, "example.com:443\t\t\t");
        assert!(smk.network_events.is_none());
    }

    #[tokio::test]
    async fn measure_one_with_cache_publishes_every_request() {
        let ctx = ProbeContext::background();
        ctx.cancel();
        let sess = session();
        let m = measurer("example.com");
        let (tx, mut rx) = mpsc::channel(2);
        for _ in 0..2 {
            m.measure_one_with_cache(&ctx, &tx, sess.as_ref(), Instant::now(), "kernel.org", "example.com:443")
                .await;
        }
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.failure, second.failure);
    }

    #[tokio::test]
    async fn process_all_collects_and_reports_progress() {
        let (tx, mut rx) = mpsc::channel(2);
        tx.send(Subresult {
            sni: "example.com".into(),
            ..Subresult::default()
        })
        .await
        .unwrap();
        tx.send(Subresult {
            sni: "kernel.org".into(),
            failure: Some(Failure::CONNECTION_RESET),
            failed_operation: Some(Operation::TlsHandshake),
            ..Subresult::default()
        })
        .await
        .unwrap();
        let callbacks = RecordingCallbacks::default();
        let inputs = vec!["kernel.org".to_string(), "example.com".to_string()];
        let keys = process_all(&mut rx, &callbacks, &inputs, "kernel.org", "example.com")
            .await
            .unwrap();
        assert_eq!(keys.result, Classification::Reset);
        assert_eq!(keys.target.sni, "kernel.org");
        assert_eq!(keys.control.sni, "example.com");

        let progress = callbacks.0.lock().unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].0, 0.5);
        assert_eq!(progress[1].0, 1.0);
        assert_eq!(progress[1].1, "sni_blocking: kernel.org: connection_reset [cached: false]");
    }

    #[tokio::test]
    async fn process_all_with_same_target_and_control() {
        let (tx, mut rx) = mpsc::channel(2);
        for cached in [false, true] {
            tx.send(Subresult {
                sni: "example.com".into(),
                cached,
                ..Subresult::default()
            })
            .await
            .unwrap();
        }
        let inputs = vec!["example.com".to_string(), "example.com".to_string()];
        let keys = process_all(&mut rx, &RecordingCallbacks::default(), &inputs, "example.com", "example.com")
            .await
            .unwrap();
        assert_eq!(keys.result, Classification::GotServerHello);
        assert!(!keys.control.cached);
        assert!(keys.target.cached);
    }

    #[tokio::test]
    #[should_panic(expected = "unexpected SNI in subresult")]
    async fn process_all_panics_on_unexpected_sni() {
        let (tx, mut rx) = mpsc::channel(2);
        tx.send(Subresult {
            sni: "antani.io".into(),
            ..Subresult::default()
        })
        .await
        .unwrap();
        let inputs = vec!["kernel.org".to_string(), "example.com".to_string()];
        let _ = process_all(&mut rx, &RecordingCallbacks::default(), &inputs, "kernel.org", "example.com").await;
    }

    #[tokio::test]
    async fn process_all_reports_closed_channel() {
        let (tx, mut rx) = mpsc::channel::<Subresult>(2);
        drop(tx);
        let inputs = vec!["kernel.org".to_string(), "example.com".to_string()];
        let err = process_all(&mut rx, &RecordingCallbacks::default(), &inputs, "kernel.org", "example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, SniBlockingError::Incomplete { received: 0, expected: 2 }));
    }

    #[tokio::test]
    async fn run_requires_control_sni() {
        let mut measurement = Measurement::new("kernel.org");
        let err = measurer("")
            .run(&ProbeContext::background(), session(), &mut measurement, &RecordingCallbacks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SniBlockingError::MissingControlSni));
    }

    #[tokio::test]
    async fn run_requires_input() {
        let mut measurement = Measurement::new("");
        let err = measurer("example.com")
            .run(&ProbeContext::background(), session(), &mut measurement, &RecordingCallbacks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SniBlockingError::MissingInput));
    }

    #[tokio::test]
    async fn run_rejects_malformed_input() {
        let mut measurement = Measurement::new("\t");
        let err = measurer("example.com")
            .run(&ProbeContext::background(), session(), &mut measurement, &RecordingCallbacks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SniBlockingError::InvalidInput(_)));
    }

    #[tokio::test]
    #[should_panic(expected = "dialer factory exploded")]
    async fn worker_panic_is_propagated() {
        struct ExplodingSession(DialerConfig);

        impl ExperimentSession for ExplodingSession {
            fn software_name(&self) -> &str {
                "sni-probe"
            }

            fn software_version(&self) -> &str {
                "0.1.0"
            }

            fn dialer_config(&self) -> &DialerConfig {
                &self.0
            }

            fn new_dialer(&self, _saver: Saver) -> Result<InstrumentedDialer, ConfigError> {
                panic!("dialer factory exploded");
            }
        }

        let sess = Arc::new(ExplodingSession(DialerConfig::default()));
        let mut measurement = Measurement::new("kernel.org");
        let _ = measurer("example.com")
            .run(&ProbeContext::background(), sess, &mut measurement, &RecordingCallbacks::default())
            .await;
    }

    #[tokio::test]
    async fn run_rejects_host_port_input() {
        let mut measurement = Measurement::new("example.com:443");
        let callbacks = RecordingCallbacks::default();
        let err = measurer("example.com")
            .run(&ProbeContext::background(), session(), &mut measurement, &callbacks)
            .await
            .unwrap_err();
        assert!(matches!(err, SniBlockingError::InvalidInput(TargetError::MissingHost(_))));
        assert!(callbacks.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_with_cancelled_context() {
        let ctx = ProbeContext::background();
        ctx.cancel();
        let mut measurement = Measurement::new("kernel.org");
        let callbacks = RecordingCallbacks::default();
        measurer("example.com")
            .run(&ctx, session(), &mut measurement, &callbacks)
            .await
            .unwrap();
        assert_eq!(measurement.test_name, "sni_blocking");
        assert_eq!(measurement.test_keys["target"]["failure"], "interrupted");
        assert_eq!(measurement.test_keys["control"]["failure"], "interrupted");
        assert_eq!(measurement.test_keys["target"]["th_address"], "example.com:443");
        assert_eq!(measurement.test_keys["result"], "anomaly.unexpected_failure");
        assert_eq!(callbacks.0.lock().unwrap().len(), 2);
    }
}
