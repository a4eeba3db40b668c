use anyhow::Context;
use ranking_forecast::{Experiment, RunConfig, RunOutcome};
use tracing::{debug, info, instrument};
use tracing_subscriber::EnvFilter;

#[instrument]
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RunConfig::from_args(std::env::args_os()).context("failed to resolve run configuration")?;
    debug!(?config, "Config loaded successfully");

    let mut experiment = Experiment::new(config)?;
    info!(output = %experiment.output_path().display(), "Starting experiment");

    match experiment.run().context("experiment failed")? {
        RunOutcome::Skipped => info!("Output already present, nothing to do"),
        RunOutcome::Completed(summary) => info!(
            repetitions = summary.repetitions,
            ic = summary.ic.mean,
            rank_ic = summary.rank_ic.mean,
            "Training complete"
        ),
    }
    Ok(())
}
