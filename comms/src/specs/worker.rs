use std::{collections::BTreeMap, num::NonZeroUsize};

use serde::{Deserialize, Serialize};

use super::TaskSpec;

/// A named component resolved through the worker registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Everything a single worker needs to evaluate its shard.
///
/// This type is exchanged over the network right after the worker greets
/// the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub rank: usize,
    pub world_size: NonZeroUsize,
    pub device: usize,
    pub batch_size: NonZeroUsize,
    pub model: ComponentSpec,
    pub dataset: ComponentSpec,
    #[serde(default)]
    pub methods: BTreeMap<String, ComponentSpec>,
    pub task: TaskSpec,
    #[serde(default)]
    pub seed: Option<u64>,
}
