//! Per batch execution of the configured evaluation task.

use std::{collections::BTreeMap, num::NonZeroUsize};

use comms::specs::{BaselineSpec, MaskerSpec, ModeSpec, PerturbationSpec, SegmenterSpec, TaskSpec};
use evaluation::{
    ActivationFn, EvalErr, Model, Schedule,
    builtin::RandomAttribution,
    masking::{Baseline, Granularity, Masker},
    metrics::{
        CurveKind, DeletionUntilFlip, ImpactScore, Infidelity, InsertionDeletion, Irof,
        MaxSensitivity, Mode, Patch, PerturbationGenerator, SensitivityN, apply_patches,
        coverage_iou, flipped, select_patch,
    },
    predictions,
    segmentation::{GridSegmenter, Segmenter},
};
use log::debug;
use ndarray::{Array, Array1, Array4, ArrayView4, Axis, Dimension, Ix3, RemoveAxis};
use rand::rngs::StdRng;
use results::{BatchResult, Level};

use crate::{
    Result, WorkerErr,
    data::Batch,
    registry::BoxedMethod,
    seeds::{Seeds, Stream},
};

/// Method key of the random attribution reference.
pub const BASELINE_METHOD: &str = "_BASELINE";

/// An attribution method together with the key its results are stored under.
pub type NamedMethod = (String, BoxedMethod);

/// The groups a task writes and the levels of each group.
pub fn layout(spec: &TaskSpec, methods: &[String]) -> Result<Vec<(String, Vec<Level>)>> {
    let with_baseline = |samples: usize| {
        let mut keys = methods.to_vec();
        if samples > 0 {
            keys.push(BASELINE_METHOD.to_string());
        }
        keys
    };

    let afn_keys = |names: &[String]| -> Result<Vec<&'static str>> {
        Ok(ActivationFn::parse_all(names)?
            .into_iter()
            .map(|afn| afn.name())
            .collect())
    };

    let group = |levels: Vec<Level>| vec![(spec.name().to_string(), levels)];

    Ok(match spec {
        TaskSpec::Deletion {
            maskers,
            activation_fns,
            num_baseline_samples,
            ..
        }
        | TaskSpec::Insertion {
            maskers,
            activation_fns,
            num_baseline_samples,
            ..
        } => group(vec![
            Level::new("method", with_baseline(*num_baseline_samples))?,
            Level::new("masker", maskers.keys().cloned())?,
            Level::new("activation_fn", afn_keys(activation_fns)?)?,
        ]),
        TaskSpec::SensitivityN {
            maskers,
            activation_fns,
            ..
        } => group(vec![
            Level::new("method", methods.iter().cloned())?,
            Level::new("masker", maskers.keys().cloned())?,
            Level::new("activation_fn", afn_keys(activation_fns)?)?,
        ]),
        TaskSpec::Infidelity {
            generators,
            activation_fns,
            num_baseline_samples,
            ..
        } => group(vec![
            Level::new("method", with_baseline(*num_baseline_samples))?,
            Level::new("perturbation_generator", generators.keys().cloned())?,
            Level::new("activation_fn", afn_keys(activation_fns)?)?,
        ]),
        TaskSpec::ImpactCoverage { .. } => vec![
            ("iou".to_string(), vec![Level::new("method", methods.iter().cloned())?]),
            ("flipped".to_string(), vec![Level::new("outcome", ["flipped"])?]),
        ],
        TaskSpec::DeletionUntilFlip { maskers, .. } | TaskSpec::ImpactScore { maskers, .. } => {
            group(vec![
                Level::new("method", methods.iter().cloned())?,
                Level::new("masker", maskers.keys().cloned())?,
            ])
        }
        TaskSpec::Irof {
            maskers,
            activation_fns,
            ..
        }
        | TaskSpec::Iiof {
            maskers,
            activation_fns,
            ..
        } => group(vec![
            Level::new("method", methods.iter().cloned())?,
            Level::new("masker", maskers.keys().cloned())?,
            Level::new("activation_fn", afn_keys(activation_fns)?)?,
        ]),
        TaskSpec::MaxSensitivity { .. } => {
            group(vec![Level::new("method", methods.iter().cloned())?])
        }
        TaskSpec::SelectSamples { .. } => Vec::new(),
    })
}

/// A named masker and the segmenter feeding it.
struct MaskerSlot {
    name: String,
    masker: Masker,
    segmenter: Option<GridSegmenter>,
}

impl MaskerSlot {
    fn new(name: &str, spec: &MaskerSpec, seed: u64) -> Result<Self> {
        let granularity: Granularity = spec.granularity.parse()?;

        let baseline = match spec.baseline {
            BaselineSpec::Constant { value } => Baseline::Constant(value),
            BaselineSpec::ChannelMean => Baseline::ChannelMean,
            BaselineSpec::Blur { radius } => Baseline::Blur { radius },
            BaselineSpec::Uniform { low, high } => Baseline::Uniform { low, high },
        };

        let segmenter = match (&spec.segmenter, granularity) {
            (Some(SegmenterSpec::Grid { rows, cols }), _) => Some(GridSegmenter::new(*rows, *cols)?),
            (None, Granularity::Segment) => {
                return Err(WorkerErr::InvalidSpec(format!(
                    "masker {name:?} masks segments but has no segmenter"
                )));
            }
            (None, _) => None,
        };

        Ok(Self {
            name: name.to_string(),
            masker: Masker::new(granularity, baseline).with_seed(seed),
            segmenter,
        })
    }

    fn bind(&mut self, samples: ArrayView4<f32>) -> Result<()> {
        let segments = self
            .segmenter
            .as_ref()
            .map(|segmenter| segmenter.segment(samples))
            .transpose()?;

        self.masker
            .set_batch(samples, segments.as_ref().map(|s| s.view()))?;
        Ok(())
    }

    /// The unit count subset and step sizes are derived from.
    ///
    /// It only depends on the sample shape whenever the granularity and the
    /// segmenter allow it, so every batch of a run gets the same sizes.
    fn units(&self) -> Result<usize> {
        let (_, c, h, w) = self.masker.samples()?.dim();
        match fixed_units(self.masker.granularity(), self.segmenter.as_ref(), [c, h, w]) {
            Some(units) => Ok(units),
            None => Ok(self.masker.min_units()?),
        }
    }
}

fn fixed_units(
    granularity: Granularity,
    segmenter: Option<&GridSegmenter>,
    [c, h, w]: [usize; 3],
) -> Option<usize> {
    match granularity {
        Granularity::Pixel => Some(h * w),
        Granularity::Channel => Some(c),
        Granularity::Segment => segmenter.and_then(|segmenter| segmenter.num_segments(h, w)),
    }
}

/// The unit count of every `[C, H, W]` sample under `spec`, when it does not
/// depend on the sample content.
pub fn unit_count(spec: &MaskerSpec, shape: [usize; 3]) -> Result<Option<usize>> {
    let slot = MaskerSlot::new("", spec, 0)?;
    Ok(fixed_units(slot.masker.granularity(), slot.segmenter.as_ref(), shape))
}

fn masker_slots(maskers: &BTreeMap<String, MaskerSpec>, seeds: &Seeds) -> Result<Vec<MaskerSlot>> {
    if maskers.is_empty() {
        return Err(WorkerErr::InvalidSpec("the task needs at least one masker".into()));
    }

    maskers
        .iter()
        .enumerate()
        .map(|(i, (name, spec))| MaskerSlot::new(name, spec, seeds.seed(Stream::Masker, i)))
        .collect()
}

fn mode(spec: ModeSpec) -> Mode {
    match spec {
        ModeSpec::Morf => Mode::Morf,
        ModeSpec::Lerf => Mode::Lerf,
    }
}

enum FlipStep {
    Size(NonZeroUsize),
    /// Derived from the unit count of the masker.
    Steps(usize),
}

enum TaskKind {
    Curve {
        metric: InsertionDeletion,
        maskers: Vec<MaskerSlot>,
        baseline_samples: usize,
    },
    SensitivityN {
        metric: SensitivityN,
        maskers: Vec<MaskerSlot>,
    },
    Infidelity {
        metric: Infidelity,
        generators: Vec<(String, PerturbationGenerator)>,
        baseline_samples: usize,
        rng: StdRng,
    },
    ImpactCoverage {
        patches: Vec<Patch>,
    },
    DeletionUntilFlip {
        step: FlipStep,
        maskers: Vec<MaskerSlot>,
    },
    ImpactScore {
        metric: ImpactScore,
        maskers: Vec<MaskerSlot>,
    },
    Irof {
        metric: Irof,
        maskers: Vec<MaskerSlot>,
    },
    MaxSensitivity {
        metric: MaxSensitivity,
        rng: StdRng,
    },
    SelectSamples,
}

/// The worker side state of a task: maskers, generators and random draws.
pub struct Task {
    name: &'static str,
    kind: TaskKind,
    reference: RandomAttribution,
}

impl Task {
    /// Builds the task described by `spec`.
    ///
    /// # Arguments
    /// * `spec` - The task specification.
    /// * `seeds` - Where every random draw made by the task is seeded from.
    pub fn from_spec(spec: &TaskSpec, seeds: &Seeds) -> Result<Self> {
        let kind = match spec {
            TaskSpec::Deletion {
                mode,
                start,
                stop,
                num_steps,
                maskers,
                activation_fns,
                num_baseline_samples,
            }
            | TaskSpec::Insertion {
                mode,
                start,
                stop,
                num_steps,
                maskers,
                activation_fns,
                num_baseline_samples,
            } => {
                let kind = match spec {
                    TaskSpec::Insertion { .. } => CurveKind::Insertion,
                    _ => CurveKind::Deletion,
                };
                TaskKind::Curve {
                    metric: InsertionDeletion::new(
                        kind,
                        self::mode(*mode),
                        Schedule::linspace(*start, *stop, *num_steps)?,
                        ActivationFn::parse_all(activation_fns)?,
                    )?,
                    maskers: masker_slots(maskers, seeds)?,
                    baseline_samples: *num_baseline_samples,
                }
            }
            TaskSpec::SensitivityN {
                min_subset_size,
                max_subset_size,
                num_steps,
                num_subsets,
                shared_subsets,
                maskers,
                activation_fns,
            } => TaskKind::SensitivityN {
                metric: SensitivityN::new(
                    *min_subset_size,
                    *max_subset_size,
                    *num_steps,
                    *num_subsets,
                    *shared_subsets,
                    ActivationFn::parse_all(activation_fns)?,
                )?,
                maskers: masker_slots(maskers, seeds)?,
            },
            TaskSpec::Infidelity {
                generators,
                num_perturbations,
                activation_fns,
                num_baseline_samples,
            } => {
                if generators.is_empty() {
                    return Err(WorkerErr::InvalidSpec(
                        "infidelity needs at least one perturbation generator".into(),
                    ));
                }

                let generators = generators
                    .iter()
                    .map(|(name, spec)| {
                        let generator = match *spec {
                            PerturbationSpec::Gaussian { std } => PerturbationGenerator::Gaussian { std },
                            PerturbationSpec::Square { size } => PerturbationGenerator::Square { size },
                        };
                        (name.clone(), generator)
                    })
                    .collect();

                TaskKind::Infidelity {
                    metric: Infidelity::new(
                        *num_perturbations,
                        ActivationFn::parse_all(activation_fns)?,
                    )?,
                    generators,
                    baseline_samples: *num_baseline_samples,
                    rng: seeds.rng(Stream::Perturbation, 0),
                }
            }
            TaskSpec::ImpactCoverage {
                patch_file,
                patch_row,
                patch_col,
            } => {
                let mut patches = Vec::new();
                for (name, values) in results::load_f32_tensors(patch_file)? {
                    let Some(target) = name
                        .strip_prefix("patch_")
                        .and_then(|target| target.parse::<usize>().ok())
                    else {
                        debug!("skipping tensor {name:?} of the patch file");
                        continue;
                    };

                    patches.push(Patch {
                        target,
                        values: values.into_dimensionality::<Ix3>().map_err(EvalErr::from)?,
                        row: *patch_row,
                        col: *patch_col,
                    });
                }

                if patches.is_empty() {
                    return Err(WorkerErr::InvalidSpec(format!(
                        "{} holds no patch_<target> tensors",
                        patch_file.display()
                    )));
                }

                patches.sort_by_key(|patch| patch.target);
                TaskKind::ImpactCoverage { patches }
            }
            TaskSpec::DeletionUntilFlip {
                step_size,
                num_steps,
                maskers,
            } => {
                let step = match (step_size, num_steps) {
                    (Some(_), Some(_)) => {
                        return Err(WorkerErr::InvalidSpec(
                            "deletion until flip takes either a step size or a step count".into(),
                        ));
                    }
                    (Some(size), None) => FlipStep::Size(NonZeroUsize::new(*size).ok_or_else(
                        || WorkerErr::InvalidSpec("the step size must be positive".into()),
                    )?),
                    (None, Some(steps)) => FlipStep::Steps(*steps),
                    (None, None) => FlipStep::Size(NonZeroUsize::MIN),
                };

                TaskKind::DeletionUntilFlip {
                    step,
                    maskers: masker_slots(maskers, seeds)?,
                }
            }
            TaskSpec::ImpactScore {
                num_steps,
                strict,
                tau,
                maskers,
            } => TaskKind::ImpactScore {
                metric: ImpactScore::new(*num_steps, *strict, *tau)?,
                maskers: masker_slots(maskers, seeds)?,
            },
            TaskSpec::Irof {
                mode,
                maskers,
                activation_fns,
            }
            | TaskSpec::Iiof {
                mode,
                maskers,
                activation_fns,
            } => {
                let kind = match spec {
                    TaskSpec::Iiof { .. } => CurveKind::Insertion,
                    _ => CurveKind::Deletion,
                };

                TaskKind::Irof {
                    metric: Irof::new(
                        kind,
                        self::mode(*mode),
                        ActivationFn::parse_all(activation_fns)?,
                    )?,
                    maskers: masker_slots(maskers, seeds)?,
                }
            }
            TaskSpec::MaxSensitivity {
                radii,
                num_perturbations,
            } => TaskKind::MaxSensitivity {
                metric: MaxSensitivity::new(radii.clone(), *num_perturbations)?,
                rng: seeds.rng(Stream::Perturbation, 0),
            },
            TaskSpec::SelectSamples { .. } => TaskKind::SelectSamples,
        };

        Ok(Self {
            name: spec.name(),
            kind,
            reference: RandomAttribution::new(seeds.seed(Stream::Reference, 0), true),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Evaluates one batch.
    ///
    /// # Returns
    /// The batch's results keyed by group. A selection batch keeps only the
    /// correctly classified samples and may come back without any.
    pub fn run_batch(
        &mut self,
        batch: &Batch,
        model: &dyn Model,
        methods: &mut [NamedMethod],
    ) -> Result<BatchResult> {
        let Self {
            name,
            kind,
            reference,
        } = self;
        let group = *name;

        let samples = batch.samples.view();
        let labels = batch.labels.as_slice();
        let mut result = BatchResult::new(batch.indices.clone());

        match kind {
            TaskKind::Curve {
                metric,
                maskers,
                baseline_samples,
            } => {
                let attrs = attribute_all(methods, model, samples, labels)?;

                for slot in maskers.iter_mut() {
                    slot.bind(samples)?;

                    for (method, attrs) in &attrs {
                        let scores = metric.run(samples, labels, model, attrs.view(), &slot.masker)?;
                        insert_scores(&mut result, &[group, method, &slot.name], scores)?;
                    }

                    let mut draws = BTreeMap::<ActivationFn, Vec<_>>::new();
                    for _ in 0..*baseline_samples {
                        let attrs = reference.draw(samples.dim());
                        for (afn, scores) in metric.run(samples, labels, model, attrs.view(), &slot.masker)? {
                            draws.entry(afn).or_default().push(scores);
                        }
                    }
                    insert_draws(&mut result, &[group, BASELINE_METHOD, &slot.name], draws)?;
                }
            }
            TaskKind::SensitivityN { metric, maskers } => {
                let attrs = attribute_all(methods, model, samples, labels)?;

                for slot in maskers.iter_mut() {
                    slot.bind(samples)?;
                    let total = slot.units()?;
                    let perturbations =
                        metric.perturb_with_total(samples, labels, model, &mut slot.masker, total)?;

                    for (method, attrs) in &attrs {
                        let scores = metric.score(&perturbations, &slot.masker, attrs.view())?;
                        insert_scores(&mut result, &[group, method, &slot.name], scores)?;
                    }
                }
            }
            TaskKind::Infidelity {
                metric,
                generators,
                baseline_samples,
                rng,
            } => {
                let attrs = attribute_all(methods, model, samples, labels)?;

                for (generator_name, generator) in generators.iter() {
                    let perturbations = metric.perturb(samples, labels, model, generator, rng)?;

                    for (method, attrs) in &attrs {
                        let scores = metric.score(&perturbations, attrs.view())?;
                        insert_scores(&mut result, &[group, method, generator_name], scores)?;
                    }

                    let mut draws = BTreeMap::<ActivationFn, Vec<_>>::new();
                    for _ in 0..*baseline_samples {
                        let attrs = reference.draw(samples.dim());
                        for (afn, scores) in metric.score(&perturbations, attrs.view())? {
                            draws.entry(afn).or_default().push(scores);
                        }
                    }
                    insert_draws(&mut result, &[group, BASELINE_METHOD, generator_name], draws)?;
                }
            }
            TaskKind::ImpactCoverage { patches } => {
                let selected = labels
                    .iter()
                    .zip(&batch.indices)
                    .map(|(&label, &index)| select_patch(patches, label, index))
                    .collect::<evaluation::Result<Vec<_>>>()?;

                let patched = apply_patches(samples, &selected)?;
                let flips = flipped(model, patched.view(), &selected)?;
                let targets: Vec<usize> = selected.iter().map(|patch| patch.target).collect();

                for (method, attrs) in attribute_all(methods, model, patched.view(), &targets)? {
                    let iou = coverage_iou(attrs.view(), &selected)?;
                    result.insert(&["iou", method.as_str()], iou.into_dyn())?;
                }

                debug!(flipped = flips.sum(); "patched batch evaluated");
                result.insert(&["flipped", "flipped"], flips.into_dyn())?;
            }
            TaskKind::DeletionUntilFlip { step, maskers } => {
                let attrs = attribute_all(methods, model, samples, labels)?;

                for slot in maskers.iter_mut() {
                    slot.bind(samples)?;
                    let metric = match *step {
                        FlipStep::Size(size) => DeletionUntilFlip::new(size),
                        FlipStep::Steps(steps) => DeletionUntilFlip::from_num_steps(steps, slot.units()?)?,
                    };

                    for (method, attrs) in &attrs {
                        let flips = metric.run(samples, model, attrs.view(), &slot.masker)?;
                        result.insert(&[group, method.as_str(), slot.name.as_str()], flips.into_dyn())?;
                    }
                }
            }
            TaskKind::ImpactScore { metric, maskers } => {
                let attrs = attribute_all(methods, model, samples, labels)?;

                for slot in maskers.iter_mut() {
                    slot.bind(samples)?;

                    for (method, attrs) in &attrs {
                        let flips = metric.run(samples, labels, model, attrs.view(), &slot.masker)?;
                        result.insert(&[group, method.as_str(), slot.name.as_str()], flips.into_dyn())?;
                    }
                }
            }
            TaskKind::Irof { metric, maskers } => {
                let attrs = attribute_all(methods, model, samples, labels)?;

                for slot in maskers.iter_mut() {
                    slot.bind(samples)?;

                    for (method, attrs) in &attrs {
                        let scores = metric.run(samples, labels, model, attrs.view(), &slot.masker)?;
                        insert_scores(&mut result, &[group, method, &slot.name], scores)?;
                    }
                }
            }
            TaskKind::MaxSensitivity { metric, rng } => {
                for (name, method) in methods.iter_mut() {
                    let attrs = method.attribute(model, samples, labels)?;
                    let sensitivity =
                        metric.run(samples, labels, model, &mut **method, attrs.view(), rng)?;
                    result.insert(&[group, name.as_str()], sensitivity.into_dyn())?;
                }
            }
            TaskKind::SelectSamples => return select_correct(batch, model),
        }

        Ok(result)
    }
}

fn attribute_all(
    methods: &mut [NamedMethod],
    model: &dyn Model,
    samples: ArrayView4<f32>,
    labels: &[usize],
) -> Result<Vec<(String, Array4<f32>)>> {
    methods
        .iter_mut()
        .map(|(name, method)| Ok((name.clone(), method.attribute(model, samples, labels)?)))
        .collect()
}

fn insert_scores<D: Dimension>(
    result: &mut BatchResult,
    prefix: &[&str],
    scores: BTreeMap<ActivationFn, Array<f32, D>>,
) -> Result<()> {
    for (afn, values) in scores {
        let mut path = prefix.to_vec();
        path.push(afn.name());
        result.insert(&path, values.into_dyn())?;
    }

    Ok(())
}

/// Stacks the reference draws on axis 1, one row per sample.
fn insert_draws<D: Dimension>(
    result: &mut BatchResult,
    prefix: &[&str],
    draws: BTreeMap<ActivationFn, Vec<Array<f32, D>>>,
) -> Result<()>
where
    D::Larger: RemoveAxis,
{
    for (afn, draws) in draws {
        let views: Vec<_> = draws.iter().map(|draw| draw.view()).collect();
        let stacked = ndarray::stack(Axis(1), &views).map_err(EvalErr::from)?;

        let mut path = prefix.to_vec();
        path.push(afn.name());
        result.insert(&path, stacked.into_dyn())?;
    }

    Ok(())
}

fn select_correct(batch: &Batch, model: &dyn Model) -> Result<BatchResult> {
    let logits = model.forward(batch.samples.view())?;
    if logits.nrows() != batch.labels.len() {
        return Err(WorkerErr::Eval(EvalErr::Shape {
            what: "model output",
            got: format!("{:?}", logits.dim()),
            expected: format!("({}, _)", batch.labels.len()),
        }));
    }

    let keep: Vec<usize> = predictions(logits.view())
        .into_iter()
        .zip(&batch.labels)
        .enumerate()
        .filter_map(|(i, (predicted, &label))| (predicted == label).then_some(i))
        .collect();

    let mut result = BatchResult::new(keep.iter().map(|&i| batch.indices[i]).collect());
    if !keep.is_empty() {
        let samples = batch.samples.select(Axis(0), &keep);
        let labels: Array1<f32> = keep.iter().map(|&i| batch.labels[i] as f32).collect();
        result.insert(&["selection", "samples"], samples.into_dyn())?;
        result.insert(&["selection", "labels"], labels.into_dyn())?;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use comms::specs::TaskSpec;
    use evaluation::builtin::{LinearClassifier, RandomAttribution};
    use ndarray::{Array2, array};
    use serde_json::json;

    use super::*;

    fn batch() -> Batch {
        let samples = Array4::from_shape_fn((3, 1, 2, 2), |(n, _, r, c)| (n * 4 + r * 2 + c) as f32);
        Batch {
            indices: vec![0, 3, 6],
            samples,
            labels: vec![0, 1, 0],
        }
    }

    fn model() -> LinearClassifier {
        LinearClassifier::random([1, 2, 2], 2, 3).unwrap()
    }

    fn methods() -> Vec<NamedMethod> {
        vec![("rand".to_string(), Box::new(RandomAttribution::new(1, false)) as BoxedMethod)]
    }

    fn task(value: serde_json::Value) -> TaskSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn deletion_writes_every_declared_leaf() {
        let spec = task(json!({
            "kind": "deletion",
            "mode": "morf",
            "start": 0.0,
            "stop": 1.0,
            "num_steps": 3,
            "maskers": { "px": { "granularity": "pixel" } },
            "activation_fns": ["linear", "softmax"],
            "num_baseline_samples": 2,
        }));

        let mut task = Task::from_spec(&spec, &Seeds::new(5, 0)).unwrap();
        let result = task.run_batch(&batch(), &model(), &mut methods()).unwrap();

        let levels = layout(&spec, &["rand".to_string()]).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].1[0].keys(), ["_BASELINE", "rand"]);

        let curve = result.results.get(&["deletion", "rand", "px", "linear"]).unwrap();
        let results::Node::Leaf(curve) = curve else { panic!("expected a leaf") };
        assert_eq!(curve.shape(), &[3, 3]);

        let reference = result
            .results
            .get(&["deletion", BASELINE_METHOD, "px", "softmax"])
            .unwrap();
        let results::Node::Leaf(reference) = reference else { panic!("expected a leaf") };
        assert_eq!(reference.shape(), &[3, 2, 3]);
    }

    #[test]
    fn infidelity_reference_is_stacked_per_sample() {
        let spec = task(json!({
            "kind": "infidelity",
            "generators": { "noise": { "gaussian": { "std": 0.1 } } },
            "num_perturbations": 4,
            "activation_fns": ["linear"],
            "num_baseline_samples": 3,
        }));

        let mut task = Task::from_spec(&spec, &Seeds::new(1, 0)).unwrap();
        let result = task.run_batch(&batch(), &model(), &mut methods()).unwrap();

        let Some(results::Node::Leaf(reference)) =
            result.results.get(&["infidelity", BASELINE_METHOD, "noise", "linear"])
        else {
            panic!("missing reference leaf");
        };
        assert_eq!(reference.shape(), &[3, 3]);
        assert!(reference.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn segment_masker_requires_a_segmenter() {
        let spec = task(json!({
            "kind": "deletion_until_flip",
            "maskers": { "seg": { "granularity": "segment" } },
        }));
        assert!(matches!(
            Task::from_spec(&spec, &Seeds::new(0, 0)),
            Err(WorkerErr::InvalidSpec(_))
        ));

        let spec = task(json!({
            "kind": "deletion_until_flip",
            "maskers": { "seg": { "granularity": "superpixel" } },
        }));
        assert!(matches!(
            Task::from_spec(&spec, &Seeds::new(0, 0)),
            Err(WorkerErr::Eval(EvalErr::Config(_)))
        ));
    }

    #[test]
    fn grid_segments_feed_deletion_until_flip() {
        let spec = task(json!({
            "kind": "deletion_until_flip",
            "maskers": {
                "grid": { "granularity": "segment", "segmenter": { "grid": { "rows": 2, "cols": 1 } } },
            },
        }));

        let mut task = Task::from_spec(&spec, &Seeds::new(0, 0)).unwrap();
        let result = task.run_batch(&batch(), &model(), &mut methods()).unwrap();

        let Some(results::Node::Leaf(flips)) =
            result.results.get(&["deletion_until_flip", "rand", "grid"])
        else {
            panic!("missing leaf");
        };
        assert_eq!(flips.shape(), &[3]);
        assert!(flips.iter().all(|&v| (1.0..=2.0).contains(&v)));
    }

    #[test]
    fn selection_keeps_correct_predictions_only() {
        // Class 0 scores the first pixel, class 1 the last one.
        let weights: Array2<f32> = array![[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]];
        let model = LinearClassifier::new([1, 2, 2], weights, Array1::zeros(2)).unwrap();

        let batch = Batch {
            indices: vec![2, 5],
            samples: Array4::from_shape_vec(
                (2, 1, 2, 2),
                vec![5.0, 0.0, 0.0, 1.0, 5.0, 0.0, 0.0, 1.0],
            )
            .unwrap(),
            labels: vec![0, 1],
        };

        let spec = task(json!({ "kind": "select_samples", "num_samples": 10 }));
        let mut task = Task::from_spec(&spec, &Seeds::new(0, 0)).unwrap();
        let result = task.run_batch(&batch, &model, &mut Vec::new()).unwrap();

        assert_eq!(result.indices, vec![2]);
        let Some(results::Node::Leaf(labels)) = result.results.get(&["selection", "labels"]) else {
            panic!("missing labels");
        };
        assert_eq!(labels.iter().copied().collect::<Vec<_>>(), vec![0.0]);
    }

    #[test]
    fn new_metrics_fill_their_layouts() {
        let maskers = json!({
            "px": { "granularity": "pixel" },
            "grid": { "granularity": "segment", "segmenter": { "grid": { "rows": 2, "cols": 2 } } },
        });
        let cases = [
            (
                json!({ "kind": "impact_score", "num_steps": 2, "strict": true, "maskers": maskers }),
                vec!["impact_score", "rand", "grid"],
                vec![3, 2],
            ),
            (
                json!({ "kind": "irof", "mode": "morf", "maskers": maskers, "activation_fns": ["softmax"] }),
                vec!["irof", "rand", "px", "softmax"],
                vec![3],
            ),
            (
                json!({ "kind": "iiof", "mode": "lerf", "maskers": maskers, "activation_fns": ["linear"] }),
                vec!["iiof", "rand", "grid", "linear"],
                vec![3],
            ),
            (
                json!({ "kind": "max_sensitivity", "radii": [0.1, 0.2, 0.3], "num_perturbations": 2 }),
                vec!["max_sensitivity", "rand"],
                vec![3, 3],
            ),
        ];

        for (value, path, shape) in cases {
            let spec = task(value);
            let levels = layout(&spec, &["rand".to_string()]).unwrap();
            assert_eq!(levels[0].0, spec.name());
            assert_eq!(levels[0].1.len(), path.len() - 1);

            let mut task = Task::from_spec(&spec, &Seeds::new(2, 0)).unwrap();
            let result = task.run_batch(&batch(), &model(), &mut methods()).unwrap();
            let Some(results::Node::Leaf(leaf)) = result.results.get(&path) else {
                panic!("missing leaf {path:?}");
            };
            assert_eq!(leaf.shape(), shape.as_slice());
        }
    }

    #[test]
    fn impact_score_needs_strict_mode_or_tau() {
        let spec = task(json!({
            "kind": "impact_score",
            "num_steps": 2,
            "maskers": { "px": { "granularity": "pixel" } },
        }));
        assert!(matches!(
            Task::from_spec(&spec, &Seeds::new(0, 0)),
            Err(WorkerErr::Eval(EvalErr::Config(_)))
        ));
    }

    #[test]
    fn unit_count_follows_the_sample_shape() {
        let grid = MaskerSpec {
            granularity: "segment".into(),
            baseline: BaselineSpec::default(),
            segmenter: Some(SegmenterSpec::Grid { rows: 2, cols: 1 }),
        };
        let mut slot = MaskerSlot::new("grid", &grid, 0).unwrap();
        slot.bind(batch().samples.view()).unwrap();
        assert_eq!(slot.units().unwrap(), 2);

        let channel = MaskerSpec {
            granularity: "channel".into(),
            ..grid
        };
        let mut slot = MaskerSlot::new("channel", &channel, 0).unwrap();
        slot.bind(batch().samples.view()).unwrap();
        assert_eq!(slot.units().unwrap(), 1);
    }

    #[test]
    fn impact_coverage_layout_has_two_groups() {
        let spec = task(json!({ "kind": "impact_coverage", "patch_file": "patches.safetensors" }));
        let groups = layout(&spec, &["a".to_string(), "b".to_string()]).unwrap();

        let names: Vec<&str> = groups.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["iou", "flipped"]);
        assert_eq!(groups[1].1[0].keys(), ["flipped"]);
    }
}
