//! What happens to the partial results streamed by the workers.

use std::{collections::BTreeMap, path::PathBuf};

use log::{info, warn};
use ndarray::{Array4, ArrayD, Ix4};
use results::{BatchResult, Level, Node, ResultErr, ResultSet, ResultTree, save_selection};

use crate::Result;

/// Whether the run should keep going after a result was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Enough results were collected, workers are asked to stop.
    Stop,
}

/// Consumes worker results on the orchestrator side.
pub trait ResultHandler: Send {
    /// Handles the results of one batch of worker `rank`.
    fn handle(&mut self, rank: usize, result: BatchResult) -> Result<Flow>;

    /// Called once every worker is done.
    fn finish(&mut self) -> Result<()>;
}

/// Accumulates metric results into a `ResultSet` and saves it at the end.
#[derive(Debug)]
pub struct MetricCollector {
    set: ResultSet,
    output: PathBuf,
}

impl MetricCollector {
    /// Creates a new `MetricCollector`.
    ///
    /// # Arguments
    /// * `num_samples` - The dataset length every group must cover.
    /// * `layout` - The groups and their levels.
    /// * `attrs` - Run attributes stored with the results.
    /// * `output` - Where the results are saved.
    pub fn new(
        num_samples: usize,
        layout: Vec<(String, Vec<Level>)>,
        attrs: BTreeMap<String, String>,
        output: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mut set = ResultSet::new(num_samples);
        for (key, value) in attrs {
            set.set_attr(key, value);
        }

        for (group, levels) in layout {
            set.insert_group(group, ResultTree::new(levels)?)?;
        }

        Ok(Self {
            set,
            output: output.into(),
        })
    }

    pub fn results(&self) -> &ResultSet {
        &self.set
    }
}

impl ResultHandler for MetricCollector {
    fn handle(&mut self, _rank: usize, result: BatchResult) -> Result<Flow> {
        let BatchResult { indices, results: payload } = result;
        let Node::Branch(groups) = payload else {
            return Err(ResultErr::Shape("a batch result must be keyed by group".into()).into());
        };

        for (group, payload) in &groups {
            let tree = self.set.group_mut(group).ok_or_else(|| ResultErr::UnknownKey {
                level: "group".into(),
                key: group.clone(),
            })?;
            tree.append(&indices, payload, &[])?;
        }

        Ok(Flow::Continue)
    }

    fn finish(&mut self) -> Result<()> {
        self.set.finalize()?;
        self.set.save(&self.output)?;
        info!("saved results of {} samples to {}", self.set.num_samples(), self.output.display());
        Ok(())
    }
}

/// Keeps the first `quota` correctly classified samples in arrival order.
#[derive(Debug)]
pub struct SampleSelector {
    quota: usize,
    output: PathBuf,
    sample_shape: Option<[usize; 3]>,
    values: Vec<f32>,
    labels: Vec<usize>,
    indices: Vec<usize>,
}

impl SampleSelector {
    pub fn new(quota: usize, output: impl Into<PathBuf>) -> Self {
        Self {
            quota,
            output: output.into(),
            sample_shape: None,
            values: Vec::new(),
            labels: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    fn leaf<'r>(results: &'r Node, name: &str) -> Result<&'r ArrayD<f32>> {
        match results.get(&["selection", name]) {
            Some(Node::Leaf(leaf)) => Ok(leaf),
            _ => Err(ResultErr::UnknownKey {
                level: "selection".into(),
                key: name.into(),
            }
            .into()),
        }
    }
}

impl ResultHandler for SampleSelector {
    fn handle(&mut self, rank: usize, result: BatchResult) -> Result<Flow> {
        let remaining = self.quota - self.indices.len();
        if remaining == 0 {
            return Ok(Flow::Stop);
        }

        let samples = Self::leaf(&result.results, "samples")?
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| ResultErr::Shape(e.to_string()))?;
        let labels: Vec<f32> = Self::leaf(&result.results, "labels")?.iter().copied().collect();

        let (n, c, h, w) = samples.dim();
        let shape = *self.sample_shape.get_or_insert([c, h, w]);
        if shape != [c, h, w] || labels.len() != n || result.indices.len() != n {
            return Err(ResultErr::Shape(format!(
                "selection of worker {rank} doesn't match the samples kept so far"
            ))
            .into());
        }

        let take = remaining.min(n);
        for i in 0..take {
            self.values.extend(samples.index_axis(ndarray::Axis(0), i).iter().copied());
            self.labels.push(labels[i] as usize);
            self.indices.push(result.indices[i]);
        }

        info!(rank = rank, kept = self.indices.len(), quota = self.quota; "selected samples");
        Ok(if self.indices.len() == self.quota {
            Flow::Stop
        } else {
            Flow::Continue
        })
    }

    fn finish(&mut self) -> Result<()> {
        if self.indices.len() < self.quota {
            warn!(
                "only {} correctly classified samples were found, {} were requested",
                self.indices.len(),
                self.quota
            );
        }

        let [c, h, w] = self.sample_shape.unwrap_or_default();
        let samples = Array4::from_shape_vec((self.indices.len(), c, h, w), self.values.clone())
            .map_err(|e| ResultErr::Shape(e.to_string()))?;

        save_selection(&self.output, samples.view(), &self.labels, &self.indices)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2};

    use super::*;

    fn selection(indices: Vec<usize>, labels: Vec<f32>) -> BatchResult {
        let n = indices.len();
        let mut result = BatchResult::new(indices.clone());
        let samples = Array4::from_shape_fn((n, 1, 1, 2), |(i, _, _, j)| (indices[i] * 10 + j) as f32);
        result.insert(&["selection", "samples"], samples.into_dyn()).unwrap();
        result
            .insert(&["selection", "labels"], Array1::from(labels).into_dyn())
            .unwrap();
        result
    }

    #[test]
    fn selector_stops_at_the_quota() {
        let dir = std::env::temp_dir().join(format!("attrbench-selector-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let output = dir.join("selection.safetensors");

        let mut selector = SampleSelector::new(3, &output);
        assert_eq!(selector.handle(0, selection(vec![4, 8], vec![1.0, 0.0])).unwrap(), Flow::Continue);
        assert_eq!(selector.handle(1, selection(vec![1, 5], vec![2.0, 2.0])).unwrap(), Flow::Stop);
        assert_eq!(selector.handle(0, selection(vec![12], vec![0.0])).unwrap(), Flow::Stop);

        assert_eq!(selector.indices(), [4, 8, 1]);
        assert_eq!(selector.labels(), [1, 0, 2]);

        selector.finish().unwrap();
        let tensors = results::load_f32_tensors(&output).unwrap();
        let (name, samples) = &tensors[0];
        assert_eq!(name, "samples");
        assert_eq!(samples.shape(), &[3, 1, 1, 2]);
        let samples = samples.view().into_dimensionality::<Ix4>().unwrap();
        assert_eq!(samples[[2, 0, 0, 1]], 11.0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn collector_rejects_unknown_groups() {
        let levels = vec![Level::new("method", ["a"]).unwrap()];
        let mut collector =
            MetricCollector::new(2, vec![("deletion".into(), levels)], BTreeMap::new(), "unused").unwrap();

        let mut result = BatchResult::new(vec![0, 1]);
        result
            .insert(&["insertion", "a"], Array2::<f32>::zeros((2, 3)).into_dyn())
            .unwrap();

        assert!(collector.handle(0, result).is_err());
    }

    #[test]
    fn collector_requires_full_coverage() {
        let levels = vec![Level::new("method", ["a"]).unwrap()];
        let mut collector =
            MetricCollector::new(4, vec![("deletion".into(), levels)], BTreeMap::new(), "unused").unwrap();

        let mut result = BatchResult::new(vec![3, 1]);
        result
            .insert(&["deletion", "a"], Array2::<f32>::ones((2, 3)).into_dyn())
            .unwrap();
        collector.handle(1, result).unwrap();

        let err = collector.finish().unwrap_err();
        assert!(matches!(err, crate::OrchestratorError::Results(ResultErr::Coverage(_))));
    }
}
