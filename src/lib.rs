//! Instrumented network probe for SNI-based censorship measurement.

pub mod archival;
pub mod config;
pub mod context;
pub mod errorx;
pub mod logging;
pub mod model;
pub mod netx;
pub mod session;
pub mod sniblocking;
pub mod tls_wrapper;
pub mod trace;

pub use config::{ConfigError, DialerConfig, ProbeArgs, ProbeConfig, SniBlockingConfig};
pub use context::{ContextError, ProbeContext};
pub use errorx::{Failure, MeasurementError, Operation};
pub use model::{ExperimentMeasurer, Measurement};
pub use netx::InstrumentedDialer;
pub use session::{Callbacks, ExperimentSession, MockableSession, PrinterCallbacks};
pub use trace::{Event, Saver};
