use comms::specs::WorkerSpec;
use log::debug;

use crate::{
    Result, Worker, WorkerErr,
    data::{ShardLoader, ShardSpec},
    registry::Registry,
    seeds::{Seeds, Stream},
    task::Task,
};

pub struct WorkerBuilder;

impl WorkerBuilder {
    /// Builds a `Worker` from a `WorkerSpec`.
    ///
    /// The model, dataset and methods are all constructed locally from the
    /// registry.
    ///
    /// # Arguments
    /// * `spec` - Specification received from the orchestrator.
    /// * `registry` - Where component names are resolved.
    ///
    /// # Returns
    /// A fully initialized `Worker` instance.
    pub fn build(spec: &WorkerSpec, registry: &Registry) -> Result<Worker> {
        let shard = ShardSpec::new(spec.rank, spec.world_size).ok_or_else(|| {
            WorkerErr::InvalidSpec(format!(
                "rank {} is out of range for a world of {}",
                spec.rank, spec.world_size
            ))
        })?;

        let seeds = Seeds::new(spec.seed.unwrap_or_else(rand::random), spec.rank);

        let dataset = registry.dataset(&spec.dataset)?;
        let loader = ShardLoader::new(dataset, shard, spec.batch_size);
        let model = registry.model(&spec.model, spec.device)?;

        let methods = spec
            .methods
            .iter()
            .enumerate()
            .map(|(i, (name, method))| {
                let method = registry.method(method, seeds.seed(Stream::Method, i))?;
                Ok((name.clone(), method))
            })
            .collect::<Result<Vec<_>>>()?;

        let task = Task::from_spec(&spec.task, &seeds)?;
        debug!(rank = spec.rank, device = spec.device, methods = methods.len(); "worker built");

        Ok(Worker::new(spec.rank, loader, model, methods, task))
    }
}
