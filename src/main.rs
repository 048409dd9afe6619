use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use sni_probe::logging::{self, LogLevel};
use sni_probe::sniblocking::Measurer;
use sni_probe::{
    ExperimentMeasurer, ExperimentSession, Measurement, MockableSession, PrinterCallbacks,
    ProbeArgs, ProbeContext,
};
use tracing::warn;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = ProbeArgs::parse();
    logging::init(LogLevel::from_verbosity(args.verbose));
    let config = args.probe_config();

    let session: Arc<dyn ExperimentSession> = Arc::new(MockableSession::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.dialer.clone(),
    ));

    let ctx = ProbeContext::background();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing pending probes");
            interrupt.cancel();
        }
    });

    let measurer = Measurer::new(config.sni_blocking);
    let mut measurement = Measurement::new(args.input);
    measurer
        .run(&ctx, session, &mut measurement, &PrinterCallbacks)
        .await?;

    println!("{}", serde_json::to_string_pretty(&measurement)?);
    Ok(())
}
