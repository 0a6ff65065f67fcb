//! Persisting result sets as safetensors files.
//!
//! Every leaf becomes one tensor named `group/key/.../key`. The header
//! metadata records the sample count, each group's level names and the run
//! attributes, so a file can be loaded back without outside knowledge.

use std::{borrow::Cow, collections::BTreeMap, collections::HashMap, fs, path::Path};

use log::info;
use ndarray::{ArrayD, ArrayView4, IxDyn};
use safetensors::{Dtype, SafeTensors, View};

use crate::{Level, Result, ResultErr, ResultTree};

const FORMAT: &str = "attrbench-results";
const FORMAT_KEY: &str = "format";
const NUM_SAMPLES_KEY: &str = "num_samples";
const LEVELS_PREFIX: &str = "levels.";
const ATTR_PREFIX: &str = "attr.";

/// Raw little endian tensor handed to safetensors.
struct Blob {
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl Blob {
    fn f32(shape: &[usize], values: impl Iterator<Item = f32>) -> Self {
        Self {
            dtype: Dtype::F32,
            shape: shape.to_vec(),
            bytes: values.flat_map(f32::to_le_bytes).collect(),
        }
    }

    fn i64(values: impl ExactSizeIterator<Item = i64>) -> Self {
        Self {
            dtype: Dtype::I64,
            shape: vec![values.len()],
            bytes: values.flat_map(i64::to_le_bytes).collect(),
        }
    }
}

impl View for &Blob {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ResultErr::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(path, bytes).map_err(|source| ResultErr::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| ResultErr::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn f32_values(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Every group of a run, the run attributes and the sample count they share.
#[derive(Debug, Clone)]
pub struct ResultSet {
    num_samples: usize,
    attrs: BTreeMap<String, String>,
    groups: BTreeMap<String, ResultTree>,
}

impl ResultSet {
    pub fn new(num_samples: usize) -> Self {
        Self {
            num_samples,
            attrs: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn attrs(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }

    /// Adds a group, its name must be a single path segment.
    pub fn insert_group(&mut self, name: impl Into<String>, tree: ResultTree) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(ResultErr::InvalidLayout(format!("invalid group name {name:?}")));
        }

        self.groups.insert(name, tree);
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&ResultTree> {
        self.groups.get(name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut ResultTree> {
        self.groups.get_mut(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &ResultTree)> {
        self.groups.iter().map(|(name, tree)| (name.as_str(), tree))
    }

    /// Finalizes every group over `[0, num_samples)`.
    pub fn finalize(&mut self) -> Result<()> {
        for tree in self.groups.values_mut() {
            tree.finalize(self.num_samples)?;
        }
        Ok(())
    }

    /// Serializes a finalized set.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut metadata = HashMap::from([
            (FORMAT_KEY.to_string(), FORMAT.to_string()),
            (NUM_SAMPLES_KEY.to_string(), self.num_samples.to_string()),
        ]);

        for (key, value) in &self.attrs {
            metadata.insert(format!("{ATTR_PREFIX}{key}"), value.clone());
        }

        let mut blobs = Vec::new();
        for (group, tree) in &self.groups {
            if tree.num_samples() != Some(self.num_samples) {
                return Err(ResultErr::Coverage(format!("group {group:?} is not finalized")));
            }

            let names: Vec<&str> = tree.levels().iter().map(Level::name).collect();
            let names = serde_json::to_string(&names)
                .map_err(|err| ResultErr::InvalidLayout(err.to_string()))?;
            metadata.insert(format!("{LEVELS_PREFIX}{group}"), names);

            for (path, values) in tree.leaves() {
                let name = format!("{group}/{}", path.join("/"));
                blobs.push((name, Blob::f32(values.shape(), values.iter().copied())));
            }
        }

        let views = blobs.iter().map(|(name, blob)| (name.as_str(), blob));
        Ok(safetensors::serialize(views, &Some(metadata))?)
    }

    /// Parses and validates a set written by `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header
            .metadata()
            .clone()
            .ok_or_else(|| ResultErr::InvalidResultFile("missing header metadata".into()))?;

        if metadata.get(FORMAT_KEY).map(String::as_str) != Some(FORMAT) {
            return Err(ResultErr::InvalidResultFile(format!(
                "the {FORMAT_KEY:?} entry is not {FORMAT:?}"
            )));
        }

        let num_samples: usize = metadata
            .get(NUM_SAMPLES_KEY)
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ResultErr::InvalidResultFile("missing sample count".into()))?;

        let tensors = SafeTensors::deserialize(bytes)?;
        let mut set = Self::new(num_samples);
        let mut claimed = 0;

        for (key, value) in &metadata {
            if let Some(attr) = key.strip_prefix(ATTR_PREFIX) {
                set.set_attr(attr, value.clone());
                continue;
            }

            let Some(group) = key.strip_prefix(LEVELS_PREFIX) else {
                continue;
            };

            let level_names: Vec<String> = serde_json::from_str(value).map_err(|err| {
                ResultErr::InvalidResultFile(format!("levels of group {group:?}: {err}"))
            })?;

            let leaves = group_leaves(&tensors, group, level_names.len(), num_samples)?;
            claimed += leaves.len();

            let mut keys = vec![Vec::new(); level_names.len()];
            for (path, _) in &leaves {
                for (depth, key) in path.iter().enumerate() {
                    keys[depth].push(key.clone());
                }
            }

            let levels = level_names
                .into_iter()
                .zip(keys)
                .map(|(name, keys)| Level::new(name, keys))
                .collect::<Result<Vec<_>>>()
                .map_err(|err| ResultErr::InvalidResultFile(err.to_string()))?;

            let expected: usize = levels.iter().map(|level| level.keys().len()).product();
            if expected != leaves.len() {
                return Err(ResultErr::InvalidResultFile(format!(
                    "group {group:?} has {} of its {expected} leaves",
                    leaves.len()
                )));
            }

            let tree = ResultTree::from_leaves(levels, leaves, num_samples)
                .map_err(|err| ResultErr::InvalidResultFile(err.to_string()))?;
            set.insert_group(group, tree)?;
        }

        if claimed != tensors.len() {
            return Err(ResultErr::InvalidResultFile(format!(
                "{} tensors belong to no group",
                tensors.len() - claimed
            )));
        }

        Ok(set)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_file(path, &self.to_bytes()?)?;
        info!("saved {} groups to {}", self.groups.len(), path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&read_file(path.as_ref())?)
    }
}

fn group_leaves(
    tensors: &SafeTensors<'_>,
    group: &str,
    depth: usize,
    num_samples: usize,
) -> Result<Vec<(Vec<String>, ArrayD<f32>)>> {
    let prefix = format!("{group}/");
    let mut leaves = Vec::new();

    for (name, view) in tensors.tensors() {
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };

        let path: Vec<String> = rest.split('/').map(str::to_string).collect();
        if path.len() != depth {
            return Err(ResultErr::InvalidResultFile(format!(
                "tensor {name:?} doesn't have {depth} keys below its group"
            )));
        }

        if view.dtype() != Dtype::F32 {
            return Err(ResultErr::InvalidResultFile(format!(
                "tensor {name:?} is {:?} instead of F32",
                view.dtype()
            )));
        }

        if view.shape().first() != Some(&num_samples) {
            return Err(ResultErr::InvalidResultFile(format!(
                "tensor {name:?} of shape {:?} doesn't have {num_samples} rows",
                view.shape()
            )));
        }

        let values = ArrayD::from_shape_vec(IxDyn(view.shape()), f32_values(view.data()))
            .map_err(|err| ResultErr::InvalidResultFile(err.to_string()))?;
        leaves.push((path, values));
    }

    Ok(leaves)
}

/// Writes the samples kept by a selection run.
///
/// # Arguments
/// * `path` - Destination file.
/// * `samples` - The `[N, C, H, W]` kept samples.
/// * `labels` - Their labels.
/// * `indices` - Their index in the source dataset.
pub fn save_selection(
    path: impl AsRef<Path>,
    samples: ArrayView4<f32>,
    labels: &[usize],
    indices: &[usize],
) -> Result<()> {
    let n = samples.dim().0;
    if labels.len() != n || indices.len() != n {
        return Err(ResultErr::Shape(format!(
            "{n} samples with {} labels and {} indices",
            labels.len(),
            indices.len()
        )));
    }

    let samples = Blob::f32(samples.shape(), samples.iter().copied());
    let labels = Blob::i64(labels.iter().map(|&l| l as i64));
    let indices = Blob::i64(indices.iter().map(|&i| i as i64));

    let metadata = HashMap::from([
        (FORMAT_KEY.to_string(), "attrbench-selection".to_string()),
        (NUM_SAMPLES_KEY.to_string(), n.to_string()),
    ]);
    let views = [("samples", &samples), ("labels", &labels), ("indices", &indices)];
    let bytes = safetensors::serialize(views, &Some(metadata))?;

    let path = path.as_ref();
    write_file(path, &bytes)?;
    info!("saved {n} selected samples to {}", path.display());
    Ok(())
}

/// Reads every `F32` tensor of a safetensors file, sorted by name.
pub fn load_f32_tensors(path: impl AsRef<Path>) -> Result<Vec<(String, ArrayD<f32>)>> {
    let bytes = read_file(path.as_ref())?;
    let tensors = SafeTensors::deserialize(&bytes)?;

    let mut out = tensors
        .tensors()
        .into_iter()
        .filter(|(_, view)| view.dtype() == Dtype::F32)
        .map(|(name, view)| {
            let values = ArrayD::from_shape_vec(IxDyn(view.shape()), f32_values(view.data()))
                .map_err(|err| ResultErr::InvalidResultFile(err.to_string()))?;
            Ok((name, values))
        })
        .collect::<Result<Vec<_>>>()?;

    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
