//! Plans an attribution evaluation run, drives its workers and persists the results.

pub mod configs;
pub mod error;
pub mod handler;
mod session;
pub mod spawner;

use comms::specs::TaskSpec;
use configs::{Adapter, Plan, RunConfig};
use handler::{MetricCollector, SampleSelector};
use log::info;
use worker::Registry;

pub use error::{OrchestratorError, Result};
pub use session::Orchestrator;
pub use spawner::{ProcessSpawner, Spawner, ThreadSpawner};

/// Runs an evaluation described by `config` and saves its results to `config.output`.
///
/// The config is validated before any worker is started. Select runs keep
/// the first correctly classified samples, every other task accumulates its
/// metric into a result set.
///
/// # Arguments
/// * `config` - The run configuration.
/// * `registry` - Resolves the model, dataset and method names.
/// * `spawner` - Starts one worker per device.
///
/// # Errors
/// Returns an `OrchestratorError` if the config is invalid, a worker fails
/// or the results cannot be saved.
pub async fn evaluate(config: RunConfig, registry: &Registry, spawner: &dyn Spawner) -> Result<()> {
    info!("adapting config");
    let Plan {
        specs,
        num_samples,
        layout,
        attrs,
    } = Adapter::new(registry).adapt(&config)?;

    info!(
        workers = specs.len(), samples = num_samples;
        "running {} into {}", config.task.name(), config.output.display()
    );

    let orchestrator = Orchestrator::new(
        specs,
        config.rendezvous(),
        config.connect_timeout(),
        registry,
        spawner,
    );

    match config.task {
        TaskSpec::SelectSamples { num_samples: quota } => {
            let mut selector = SampleSelector::new(quota, &config.output);
            orchestrator.run(&mut selector).await
        }
        _ => {
            let mut collector = MetricCollector::new(num_samples, layout, attrs, &config.output)?;
            orchestrator.run(&mut collector).await
        }
    }
}
