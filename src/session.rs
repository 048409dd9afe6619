use tracing::info;

use crate::config::{ConfigError, DialerConfig};
use crate::netx::InstrumentedDialer;
use crate::trace::Saver;

/// What an experiment needs from the surrounding probe: identity, a way to
/// build instrumented dialers, and a span to log under.
pub trait ExperimentSession: Send + Sync {
    fn software_name(&self) -> &str;

    fn software_version(&self) -> &str;

    fn user_agent(&self) -> String {
        format!("{}/{}", self.software_name(), self.software_version())
    }

    fn dialer_config(&self) -> &DialerConfig;

    /// Fresh dialer stack recording into `saver`.
    fn new_dialer(&self, saver: Saver) -> Result<InstrumentedDialer, ConfigError> {
        InstrumentedDialer::new(self.dialer_config(), saver)
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!("session", software = %self.user_agent())
    }
}

/// Session whose every field is set by the caller.
#[derive(Debug, Clone)]
pub struct MockableSession {
    pub software_name: String,
    pub software_version: String,
    pub dialer_config: DialerConfig,
}

impl MockableSession {
    pub fn new(
        software_name: impl Into<String>,
        software_version: impl Into<String>,
        dialer_config: DialerConfig,
    ) -> Self {
        Self {
            software_name: software_name.into(),
            software_version: software_version.into(),
            dialer_config,
        }
    }
}

impl ExperimentSession for MockableSession {
    fn software_name(&self) -> &str {
        &self.software_name
    }

    fn software_version(&self) -> &str {
        &self.software_version
    }

    fn dialer_config(&self) -> &DialerConfig {
        &self.dialer_config
    }
}

/// Progress reporting from a running experiment.
pub trait Callbacks: Send + Sync {
    fn on_progress(&self, percentage: f64, message: &str);
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrinterCallbacks;

impl Callbacks for PrinterCallbacks {
    fn on_progress(&self, percentage: f64, message: &str) {
        info!("[{:5.1}%] {}", percentage * 100.0, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_joins_name_and_version() {
        let sess = MockableSession::new("sni-probe", "0.1.0", DialerConfig::default());
        assert_eq!(sess.user_agent(), "sni-probe/0.1.0");
    }

    #[test]
    fn new_dialer_uses_the_session_config() {
        let config = DialerConfig::default().with_root_store(rustls::RootCertStore::empty());
        let sess = MockableSession::new("sni-probe", "0.1.0", config);
        let saver = Saver::new();
        let dialer = sess.new_dialer(saver).unwrap();
        assert!(dialer.saver().is_empty());
    }
}
