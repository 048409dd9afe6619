use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use crate::context::ProbeContext;
use crate::session::{Callbacks, ExperimentSession};

/// One measurement: the input, the experiment that produced it and its
/// experiment-specific test keys.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub input: String,
    pub test_name: String,
    pub test_version: String,
    pub software_name: String,
    pub software_version: String,
    pub test_runtime: f64,
    pub test_keys: serde_json::Value,
    /// Origin for the relative `t` of every archived event.
    #[serde(skip)]
    pub started: Instant,
}

impl Measurement {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            test_name: String::new(),
            test_version: String::new(),
            software_name: String::new(),
            software_version: String::new(),
            test_runtime: 0.0,
            test_keys: serde_json::Value::Null,
            started: Instant::now(),
        }
    }
}

/// An experiment run against one measurement.
#[async_trait]
pub trait ExperimentMeasurer: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn experiment_name(&self) -> &'static str;

    fn experiment_version(&self) -> &'static str;

    /// Fills `measurement.test_keys`. Network failures are data, not errors.
    async fn run(
        &self,
        ctx: &ProbeContext,
        sess: std::sync::Arc<dyn ExperimentSession>,
        measurement: &mut Measurement,
        callbacks: &dyn Callbacks,
    ) -> Result<(), Self::Error>;
}
