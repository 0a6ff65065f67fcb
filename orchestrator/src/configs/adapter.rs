use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroUsize,
};

use comms::specs::{TaskSpec, WorkerSpec};
use evaluation::{ActivationFn, Schedule, metrics::SensitivityN};
use log::warn;
use results::Level;
use serde::Serialize;
use worker::{
    Registry, Seeds,
    task::{self, Task},
};

use super::RunConfig;
use crate::{OrchestratorError, Result};

/// A validated run: one spec per rank and the layout of its results.
#[derive(Debug, Clone)]
pub struct Plan {
    pub specs: Vec<WorkerSpec>,
    pub num_samples: usize,
    pub layout: Vec<(String, Vec<Level>)>,
    /// Run attributes persisted next to the results.
    pub attrs: BTreeMap<String, String>,
}

/// Validates run configs and turns them into worker specs.
pub struct Adapter<'a> {
    registry: &'a Registry,
}

fn invalid(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidConfig(msg.into())
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| invalid(e.to_string()))
}

impl<'a> Adapter<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Checks `config` and plans the run.
    ///
    /// Every component name is resolved against the registry here so an
    /// unknown name fails before any worker is spawned.
    pub fn adapt(&self, config: &RunConfig) -> Result<Plan> {
        let world_size = self.validate_devices(&config.devices)?;
        let batch_size = NonZeroUsize::new(config.batch_size)
            .ok_or_else(|| invalid("batch_size must be greater than 0"))?;

        self.validate_components(config)?;
        self.validate_task(&config.task, config.methods.is_empty())?;

        let dataset = self
            .registry
            .dataset(&config.dataset)
            .map_err(|e| invalid(e.to_string()))?;
        let num_samples = dataset.len();
        let sample_shape = dataset.sample_shape();
        if num_samples == 0 {
            return Err(invalid("the dataset is empty"));
        }

        if world_size.get() > num_samples {
            warn!("{world_size} workers for {num_samples} samples, some shards are empty");
        }

        let methods: Vec<String> = config.methods.keys().cloned().collect();
        let layout = task::layout(&config.task, &methods).map_err(|e| invalid(e.to_string()))?;

        let specs = config
            .devices
            .iter()
            .enumerate()
            .map(|(rank, &device)| WorkerSpec {
                rank,
                world_size,
                device,
                batch_size,
                model: config.model.clone(),
                dataset: config.dataset.clone(),
                methods: config.methods.clone(),
                task: config.task.clone(),
                seed: config.seed,
            })
            .collect();

        Ok(Plan {
            specs,
            num_samples,
            layout,
            attrs: self.attrs(config, world_size, &methods, sample_shape)?,
        })
    }

    fn validate_devices(&self, devices: &[usize]) -> Result<NonZeroUsize> {
        let world_size = NonZeroUsize::new(devices.len())
            .ok_or_else(|| invalid("at least one device is required"))?;

        let unique: BTreeSet<_> = devices.iter().collect();
        if unique.len() != devices.len() {
            return Err(invalid(format!(
                "every device must be owned by a single worker, got {devices:?}"
            )));
        }

        Ok(world_size)
    }

    fn validate_components(&self, config: &RunConfig) -> Result<()> {
        if !self.registry.has_model(&config.model.name) {
            return Err(invalid(format!("unknown model {:?}", config.model.name)));
        }

        if !self.registry.has_dataset(&config.dataset.name) {
            return Err(invalid(format!("unknown dataset {:?}", config.dataset.name)));
        }

        for (key, method) in &config.methods {
            if !self.registry.has_method(&method.name) {
                return Err(invalid(format!(
                    "method {key:?} uses the unknown attribution method {:?}",
                    method.name
                )));
            }

            if key == task::BASELINE_METHOD || key.is_empty() || key.contains('/') {
                return Err(invalid(format!("{key:?} can't be used as a method name")));
            }
        }

        Ok(())
    }

    fn validate_task(&self, spec: &TaskSpec, no_methods: bool) -> Result<()> {
        match spec {
            TaskSpec::SelectSamples { num_samples } => {
                if *num_samples == 0 {
                    return Err(invalid("num_samples must be greater than 0"));
                }
                return Ok(());
            }
            TaskSpec::Deletion { num_baseline_samples, .. }
            | TaskSpec::Insertion { num_baseline_samples, .. }
            | TaskSpec::Infidelity { num_baseline_samples, .. }
                if *num_baseline_samples == 0 =>
            {
                return Err(invalid(format!(
                    "{} needs at least one random baseline sample",
                    spec.name()
                )));
            }
            _ => {}
        }

        if no_methods {
            return Err(invalid(format!("{} needs at least one method", spec.name())));
        }

        // Builds the task once to validate schedules, maskers and patches.
        Task::from_spec(spec, &Seeds::new(0, 0)).map_err(|e| invalid(e.to_string()))?;
        Ok(())
    }

    fn attrs(
        &self,
        config: &RunConfig,
        world_size: NonZeroUsize,
        methods: &[String],
        sample_shape: [usize; 3],
    ) -> Result<BTreeMap<String, String>> {
        let mut attrs = BTreeMap::from([
            ("task".to_string(), config.task.name().to_string()),
            ("task_config".to_string(), to_json(&config.task)?),
            ("methods".to_string(), to_json(methods)?),
            ("world_size".to_string(), world_size.to_string()),
            ("batch_size".to_string(), config.batch_size.to_string()),
        ]);

        if let Some(seed) = config.seed {
            attrs.insert("seed".into(), seed.to_string());
        }

        if let TaskSpec::Deletion { mode, start, stop, num_steps, .. }
        | TaskSpec::Insertion { mode, start, stop, num_steps, .. } = &config.task
        {
            let schedule = Schedule::linspace(*start, *stop, *num_steps)
                .map_err(|e| invalid(e.to_string()))?;
            attrs.insert("mode".into(), to_json(mode)?.trim_matches('"').to_string());
            attrs.insert("schedule".into(), to_json(schedule.fractions())?);
        }

        if let TaskSpec::SensitivityN {
            min_subset_size,
            max_subset_size,
            num_steps,
            num_subsets,
            shared_subsets,
            maskers,
            ..
        } = &config.task
        {
            let metric = SensitivityN::new(
                *min_subset_size,
                *max_subset_size,
                *num_steps,
                *num_subsets,
                *shared_subsets,
                vec![ActivationFn::Linear],
            )
            .map_err(|e| invalid(e.to_string()))?;

            for (name, masker) in maskers {
                let units =
                    task::unit_count(masker, sample_shape).map_err(|e| invalid(e.to_string()))?;
                if let Some(units) = units {
                    let sizes = to_json(&metric.subset_sizes(units))?;
                    attrs.insert(format!("subset_sizes.{name}"), sizes);
                }
            }
        }

        Ok(attrs)
    }
}
