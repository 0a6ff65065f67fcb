use std::{collections::HashMap, fmt, sync::Arc};

use comms::specs::ComponentSpec;
use evaluation::{
    AttributionMethod, Dataset, Model,
    builtin::{InMemoryDataset, LinearClassifier, Occlusion, RandomAttribution},
};
use log::info;
use ndarray::{Array1, Array2};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{Result, WorkerErr};

pub type BoxedModel = Box<dyn Model + Send>;
pub type BoxedMethod = Box<dyn AttributionMethod + Send>;

type ModelCtor = Box<dyn Fn(&Value, usize) -> Result<BoxedModel> + Send + Sync>;
type DatasetCtor = Box<dyn Fn(&Value) -> Result<Arc<dyn Dataset>> + Send + Sync>;
type MethodCtor = Box<dyn Fn(&Value, u64) -> Result<BoxedMethod> + Send + Sync>;

/// Name to constructor tables for every pluggable component.
///
/// Every process builds its own components from the same registry, nothing
/// built here ever crosses a process boundary.
#[derive(Default)]
pub struct Registry {
    models: HashMap<String, ModelCtor>,
    datasets: HashMap<String, DatasetCtor>,
    methods: HashMap<String, MethodCtor>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut models: Vec<_> = self.models.keys().collect();
        let mut datasets: Vec<_> = self.datasets.keys().collect();
        let mut methods: Vec<_> = self.methods.keys().collect();
        models.sort();
        datasets.sort();
        methods.sort();

        f.debug_struct("Registry")
            .field("models", &models)
            .field("datasets", &datasets)
            .field("methods", &methods)
            .finish()
    }
}

/// Parses a component's free form parameters, a missing object counts as `{}`.
pub fn params<T: DeserializeOwned>(component: &str, value: &Value) -> Result<T> {
    let value = match value {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };

    serde_json::from_value(value).map_err(|source| WorkerErr::InvalidParams {
        component: component.to_string(),
        source,
    })
}

#[derive(Deserialize)]
struct LinearParams {
    input_shape: [usize; 3],
    num_classes: usize,
    /// Row major `[K, C * H * W]`.
    weights: Option<Vec<f32>>,
    bias: Option<Vec<f32>>,
    #[serde(default)]
    seed: u64,
}

#[derive(Deserialize)]
struct SyntheticParams {
    len: usize,
    shape: [usize; 3],
    num_classes: usize,
    #[serde(default)]
    seed: u64,
}

#[derive(Deserialize)]
struct InlineParams {
    shape: [usize; 3],
    samples: Vec<f32>,
    labels: Vec<usize>,
}

#[derive(Deserialize)]
struct RandomParams {
    #[serde(default)]
    per_channel: bool,
    seed: Option<u64>,
}

#[derive(Deserialize)]
struct OcclusionParams {
    #[serde(default = "default_window")]
    window: usize,
}

fn default_window() -> usize {
    1
}

fn linear(value: &Value, device: usize) -> Result<BoxedModel> {
    let p: LinearParams = params("linear", value)?;

    let model = match p.weights {
        Some(weights) => {
            let features = p.input_shape.iter().product::<usize>();
            let weights = Array2::from_shape_vec((p.num_classes, features), weights)
                .map_err(evaluation::EvalErr::from)?;
            let bias = p
                .bias
                .map(Array1::from)
                .unwrap_or_else(|| Array1::zeros(p.num_classes));
            LinearClassifier::new(p.input_shape, weights, bias)?
        }
        None => LinearClassifier::random(p.input_shape, p.num_classes, p.seed)?,
    };

    info!(device = device, classes = p.num_classes; "linear model bound to device");
    Ok(Box::new(model))
}

fn synthetic(value: &Value) -> Result<Arc<dyn Dataset>> {
    let p: SyntheticParams = params("synthetic", value)?;
    Ok(Arc::new(InMemoryDataset::synthetic(
        p.len,
        p.shape,
        p.num_classes,
        p.seed,
    )?))
}

fn inline(value: &Value) -> Result<Arc<dyn Dataset>> {
    let p: InlineParams = params("inline", value)?;
    Ok(Arc::new(InMemoryDataset::from_flat(p.shape, p.samples, p.labels)?))
}

fn random(value: &Value, seed: u64) -> Result<BoxedMethod> {
    let p: RandomParams = params("random", value)?;
    Ok(Box::new(RandomAttribution::new(
        p.seed.unwrap_or(seed),
        p.per_channel,
    )))
}

fn occlusion(value: &Value, _seed: u64) -> Result<BoxedMethod> {
    let p: OcclusionParams = params("occlusion", value)?;
    Ok(Box::new(Occlusion::new(p.window)?))
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built in components.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_model("linear", linear);
        registry.register_dataset("synthetic", synthetic);
        registry.register_dataset("inline", inline);
        registry.register_method("random", random);
        registry.register_method("occlusion", occlusion);
        registry
    }

    /// Registers a model constructor, receiving the parameters and the device.
    pub fn register_model<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&Value, usize) -> Result<BoxedModel> + Send + Sync + 'static,
    {
        self.models.insert(name.into(), Box::new(ctor));
    }

    pub fn register_dataset<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Dataset>> + Send + Sync + 'static,
    {
        self.datasets.insert(name.into(), Box::new(ctor));
    }

    /// Registers a method constructor, receiving the parameters and a seed.
    pub fn register_method<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&Value, u64) -> Result<BoxedMethod> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Box::new(ctor));
    }

    pub fn has_model(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        self.datasets.contains_key(name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Builds the model named by `spec` on `device`.
    pub fn model(&self, spec: &ComponentSpec, device: usize) -> Result<BoxedModel> {
        let ctor = self
            .models
            .get(&spec.name)
            .ok_or_else(|| unknown("model", &spec.name))?;
        ctor(&spec.params, device)
    }

    pub fn dataset(&self, spec: &ComponentSpec) -> Result<Arc<dyn Dataset>> {
        let ctor = self
            .datasets
            .get(&spec.name)
            .ok_or_else(|| unknown("dataset", &spec.name))?;
        ctor(&spec.params)
    }

    pub fn method(&self, spec: &ComponentSpec, seed: u64) -> Result<BoxedMethod> {
        let ctor = self
            .methods
            .get(&spec.name)
            .ok_or_else(|| unknown("attribution method", &spec.name))?;
        ctor(&spec.params, seed)
    }
}

fn unknown(kind: &'static str, name: &str) -> WorkerErr {
    WorkerErr::UnknownComponent {
        kind,
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;
    use serde_json::json;

    use super::*;

    #[test]
    fn builtin_components_resolve() {
        let registry = Registry::builtin();

        let dataset = registry
            .dataset(&ComponentSpec::new(
                "synthetic",
                json!({ "len": 6, "shape": [1, 2, 2], "num_classes": 3 }),
            ))
            .unwrap();
        assert_eq!(dataset.len(), 6);
        assert_eq!(dataset.sample_shape(), [1, 2, 2]);

        let model = registry
            .model(
                &ComponentSpec::new(
                    "linear",
                    json!({ "input_shape": [1, 2, 2], "num_classes": 3, "seed": 7 }),
                ),
                0,
            )
            .unwrap();
        assert_eq!(model.num_classes(), 3);

        let mut method = registry
            .method(&ComponentSpec::new("occlusion", Value::Null), 0)
            .unwrap();
        let x = Array4::<f32>::ones((2, 1, 2, 2));
        let attrs = method.attribute(model.as_ref(), x.view(), &[0, 1]).unwrap();
        assert_eq!(attrs.dim(), (2, 1, 2, 2));
    }

    #[test]
    fn explicit_linear_weights_are_used() {
        let registry = Registry::builtin();
        let model = registry
            .model(
                &ComponentSpec::new(
                    "linear",
                    json!({
                        "input_shape": [1, 1, 2],
                        "num_classes": 2,
                        "weights": [1.0, 0.0, 0.0, 1.0],
                        "bias": [0.5, 0.0],
                    }),
                ),
                1,
            )
            .unwrap();

        let x = Array4::from_shape_vec((1, 1, 1, 2), vec![2.0, 3.0]).unwrap();
        let logits = model.forward(x.view()).unwrap();
        assert_eq!(logits.row(0).to_vec(), vec![2.5, 3.0]);
    }

    #[test]
    fn unknown_names_fail() {
        let registry = Registry::builtin();
        let err = registry
            .method(&ComponentSpec::new("saliency", Value::Null), 0)
            .err()
            .unwrap();
        assert!(matches!(err, WorkerErr::UnknownComponent { kind: "attribution method", .. }));
        assert!(!registry.has_model("resnet"));
    }

    #[test]
    fn bad_params_are_reported() {
        let registry = Registry::builtin();
        let err = registry
            .dataset(&ComponentSpec::new("synthetic", json!({ "len": "many" })))
            .err()
            .unwrap();
        assert!(matches!(err, WorkerErr::InvalidParams { .. }));
    }
}
