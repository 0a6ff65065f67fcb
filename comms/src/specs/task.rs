use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use super::MaskerSpec;

/// Order in which ranked units are removed or revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeSpec {
    Morf,
    Lerf,
}

/// Random perturbations used by infidelity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerturbationSpec {
    Gaussian { std: f32 },
    Square { size: usize },
}

fn default_baseline_samples() -> usize {
    1
}

/// The evaluation task a run performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    Deletion {
        mode: ModeSpec,
        start: f64,
        stop: f64,
        num_steps: usize,
        maskers: BTreeMap<String, MaskerSpec>,
        activation_fns: Vec<String>,
        #[serde(default = "default_baseline_samples")]
        num_baseline_samples: usize,
    },
    Insertion {
        mode: ModeSpec,
        start: f64,
        stop: f64,
        num_steps: usize,
        maskers: BTreeMap<String, MaskerSpec>,
        activation_fns: Vec<String>,
        #[serde(default = "default_baseline_samples")]
        num_baseline_samples: usize,
    },
    SensitivityN {
        min_subset_size: f64,
        max_subset_size: f64,
        num_steps: usize,
        num_subsets: usize,
        #[serde(default)]
        shared_subsets: bool,
        maskers: BTreeMap<String, MaskerSpec>,
        activation_fns: Vec<String>,
    },
    Infidelity {
        generators: BTreeMap<String, PerturbationSpec>,
        num_perturbations: usize,
        activation_fns: Vec<String>,
        #[serde(default = "default_baseline_samples")]
        num_baseline_samples: usize,
    },
    ImpactCoverage {
        patch_file: PathBuf,
        #[serde(default)]
        patch_row: usize,
        #[serde(default)]
        patch_col: usize,
    },
    DeletionUntilFlip {
        #[serde(default)]
        step_size: Option<usize>,
        #[serde(default)]
        num_steps: Option<usize>,
        maskers: BTreeMap<String, MaskerSpec>,
    },
    ImpactScore {
        num_steps: usize,
        #[serde(default)]
        strict: bool,
        #[serde(default)]
        tau: Option<f32>,
        maskers: BTreeMap<String, MaskerSpec>,
    },
    Irof {
        mode: ModeSpec,
        maskers: BTreeMap<String, MaskerSpec>,
        activation_fns: Vec<String>,
    },
    Iiof {
        mode: ModeSpec,
        maskers: BTreeMap<String, MaskerSpec>,
        activation_fns: Vec<String>,
    },
    MaxSensitivity {
        radii: Vec<f32>,
        num_perturbations: usize,
    },
    SelectSamples {
        num_samples: usize,
    },
}

impl TaskSpec {
    /// The name this task is stored under.
    pub fn name(&self) -> &'static str {
        match self {
            TaskSpec::Deletion { .. } => "deletion",
            TaskSpec::Insertion { .. } => "insertion",
            TaskSpec::SensitivityN { .. } => "sensitivity_n",
            TaskSpec::Infidelity { .. } => "infidelity",
            TaskSpec::ImpactCoverage { .. } => "impact_coverage",
            TaskSpec::DeletionUntilFlip { .. } => "deletion_until_flip",
            TaskSpec::ImpactScore { .. } => "impact_score",
            TaskSpec::Irof { .. } => "irof",
            TaskSpec::Iiof { .. } => "iiof",
            TaskSpec::MaxSensitivity { .. } => "max_sensitivity",
            TaskSpec::SelectSamples { .. } => "select_samples",
        }
    }
}
