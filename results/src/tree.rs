use std::collections::BTreeMap;

use log::debug;
use ndarray::{ArrayD, ArrayViewD, Axis};

use crate::{Node, Result, ResultErr};

/// A named level of a result tree and the keys it branches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    name: String,
    keys: Vec<String>,
}

impl Level {
    /// Creates a new `Level`, keys are sorted and deduplicated.
    pub fn new<S: Into<String>>(name: impl Into<String>, keys: impl IntoIterator<Item = S>) -> Result<Self> {
        let name = name.into();
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();

        if name.is_empty() || name.contains('/') {
            return Err(ResultErr::InvalidLayout(format!("invalid level name {name:?}")));
        }

        if keys.is_empty() {
            return Err(ResultErr::InvalidLayout(format!("level {name:?} has no keys")));
        }

        if let Some(key) = keys.iter().find(|key| key.is_empty() || key.contains('/')) {
            return Err(ResultErr::InvalidLayout(format!(
                "invalid key {key:?} in level {name:?}"
            )));
        }

        Ok(Self { name, keys })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    fn check_key(&self, key: &str) -> Result<()> {
        match self.keys.binary_search_by(|k| k.as_str().cmp(key)) {
            Ok(_) => Ok(()),
            Err(_) => Err(ResultErr::UnknownKey {
                level: self.name.clone(),
                key: key.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Branch(BTreeMap<String, Slot>),
    Leaf(Option<LeafData>),
}

#[derive(Debug, Clone)]
struct LeafData {
    /// Global sample index of every row of `values`.
    indices: Vec<usize>,
    values: ArrayD<f32>,
}

impl Slot {
    fn build(levels: &[Level]) -> Self {
        match levels.split_first() {
            None => Slot::Leaf(None),
            Some((level, rest)) => Slot::Branch(
                level
                    .keys
                    .iter()
                    .map(|key| (key.clone(), Slot::build(rest)))
                    .collect(),
            ),
        }
    }
}

/// A fixed hierarchy of levels whose leaves accumulate per sample rows.
#[derive(Debug, Clone)]
pub struct ResultTree {
    levels: Vec<Level>,
    root: Slot,
    num_samples: Option<usize>,
}

impl ResultTree {
    /// Creates an empty tree with every leaf of the key product in place.
    pub fn new(levels: Vec<Level>) -> Result<Self> {
        if levels.is_empty() {
            return Err(ResultErr::InvalidLayout("a tree needs at least one level".into()));
        }

        for (i, level) in levels.iter().enumerate() {
            if levels[..i].iter().any(|other| other.name == level.name) {
                return Err(ResultErr::InvalidLayout(format!(
                    "level {:?} appears twice",
                    level.name
                )));
            }
        }

        let root = Slot::build(&levels);
        Ok(Self {
            levels,
            root,
            num_samples: None,
        })
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// The amount of rows of every leaf once the tree is finalized.
    pub fn num_samples(&self) -> Option<usize> {
        self.num_samples
    }

    /// Appends a batch of rows.
    ///
    /// # Arguments
    /// * `indices` - Global sample index of each row.
    /// * `payload` - Nested by the levels not fixed by `selectors`, in level order.
    /// * `selectors` - `(level, key)` pairs fixing those levels to a single key.
    pub fn append(&mut self, indices: &[usize], payload: &Node, selectors: &[(&str, &str)]) -> Result<()> {
        if let Some((level, _)) = selectors
            .iter()
            .find(|(level, _)| !self.levels.iter().any(|l| l.name == *level))
        {
            return Err(ResultErr::UnknownLevel(level.to_string()));
        }

        self.num_samples = None;
        append_into(&mut self.root, &self.levels, indices, payload, selectors)
    }

    /// Orders every leaf by global index and checks it holds each of
    /// `[0, num_samples)` exactly once.
    pub fn finalize(&mut self, num_samples: usize) -> Result<()> {
        finalize_slot(&mut self.root, &mut Vec::new(), num_samples)?;
        self.num_samples = Some(num_samples);
        Ok(())
    }

    /// The array stored under a full key path, in level order.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<ArrayViewD<'_, f32>> {
        let slot = path.iter().try_fold(&self.root, |slot, key| match slot {
            Slot::Branch(children) => children.get(key.as_ref()),
            Slot::Leaf(_) => None,
        })?;

        match slot {
            Slot::Leaf(Some(data)) => Some(data.values.view()),
            _ => None,
        }
    }

    /// Every filled leaf with its key path.
    pub fn leaves(&self) -> Vec<(Vec<String>, ArrayViewD<'_, f32>)> {
        let mut out = Vec::new();
        collect_leaves(&self.root, &mut Vec::new(), &mut out);
        out
    }

    /// Rebuilds a finalized tree from stored leaves.
    pub(crate) fn from_leaves(
        levels: Vec<Level>,
        leaves: Vec<(Vec<String>, ArrayD<f32>)>,
        num_samples: usize,
    ) -> Result<Self> {
        let mut tree = Self::new(levels)?;
        for (path, values) in leaves {
            if path.len() != tree.levels.len() {
                return Err(ResultErr::InvalidLayout(format!(
                    "path {path:?} doesn't have {} keys",
                    tree.levels.len()
                )));
            }

            let mut slot = &mut tree.root;
            for (key, level) in path.iter().zip(&tree.levels) {
                level.check_key(key)?;
                let Slot::Branch(children) = slot else {
                    return Err(ResultErr::InvalidLayout(format!("path {path:?} is too deep")));
                };
                slot = children
                    .get_mut(key)
                    .ok_or_else(|| ResultErr::InvalidLayout(format!("path {path:?} doesn't exist")))?;
            }

            let Slot::Leaf(data) = slot else {
                return Err(ResultErr::InvalidLayout(format!("path {path:?} ends at a branch")));
            };
            *data = Some(LeafData {
                indices: (0..num_samples).collect(),
                values,
            });
        }

        tree.finalize(num_samples)?;
        Ok(tree)
    }
}

fn append_into(
    slot: &mut Slot,
    levels: &[Level],
    indices: &[usize],
    payload: &Node,
    selectors: &[(&str, &str)],
) -> Result<()> {
    let Some((level, rest)) = levels.split_first() else {
        let (Slot::Leaf(data), Node::Leaf(values)) = (slot, payload) else {
            return Err(ResultErr::Shape("payload is nested deeper than the tree".into()));
        };
        return append_rows(data, indices, values);
    };

    let Slot::Branch(children) = slot else {
        return Err(ResultErr::InvalidLayout("tree slot doesn't match its levels".into()));
    };

    if let Some((_, key)) = selectors.iter().find(|(name, _)| *name == level.name) {
        level.check_key(key)?;
        let child = children
            .get_mut(*key)
            .ok_or_else(|| ResultErr::InvalidLayout(format!("missing child {key:?}")))?;
        return append_into(child, rest, indices, payload, selectors);
    }

    let Node::Branch(entries) = payload else {
        return Err(ResultErr::Shape(format!(
            "payload ends before level {:?}",
            level.name
        )));
    };

    for (key, sub) in entries {
        level.check_key(key)?;
        let child = children
            .get_mut(key)
            .ok_or_else(|| ResultErr::InvalidLayout(format!("missing child {key:?}")))?;
        append_into(child, rest, indices, sub, selectors)?;
    }

    Ok(())
}

fn append_rows(data: &mut Option<LeafData>, indices: &[usize], values: &ArrayD<f32>) -> Result<()> {
    let rows = values.shape().first().copied().unwrap_or(0);
    if values.ndim() == 0 || rows != indices.len() {
        return Err(ResultErr::Shape(format!(
            "{rows} rows appended for {} indices",
            indices.len()
        )));
    }

    match data {
        None => {
            *data = Some(LeafData {
                indices: indices.to_vec(),
                values: values.clone(),
            });
        }
        Some(existing) => {
            if existing.values.shape()[1..] != values.shape()[1..] {
                return Err(ResultErr::Shape(format!(
                    "appended rows of shape {:?} don't match stored rows of shape {:?}",
                    &values.shape()[1..],
                    &existing.values.shape()[1..]
                )));
            }

            existing.values = ndarray::concatenate(Axis(0), &[existing.values.view(), values.view()])
                .map_err(|err| ResultErr::Shape(err.to_string()))?;
            existing.indices.extend_from_slice(indices);
        }
    }

    Ok(())
}

fn finalize_slot(slot: &mut Slot, path: &mut Vec<String>, num_samples: usize) -> Result<()> {
    match slot {
        Slot::Branch(children) => {
            for (key, child) in children.iter_mut() {
                path.push(key.clone());
                finalize_slot(child, path, num_samples)?;
                path.pop();
            }
            Ok(())
        }
        Slot::Leaf(None) => Err(ResultErr::Coverage(format!("leaf {path:?} never received rows"))),
        Slot::Leaf(Some(data)) => {
            let mut order: Vec<usize> = (0..data.indices.len()).collect();
            order.sort_by_key(|&row| data.indices[row]);

            for (expected, &row) in order.iter().enumerate() {
                let index = data.indices[row];
                if index != expected {
                    let problem = if index < expected { "appears twice" } else { "is missing" };
                    let index = index.min(expected);
                    return Err(ResultErr::Coverage(format!(
                        "sample {index} {problem} in leaf {path:?}"
                    )));
                }
            }

            if order.len() != num_samples {
                return Err(ResultErr::Coverage(format!(
                    "leaf {path:?} holds {} of {num_samples} samples",
                    order.len()
                )));
            }

            data.values = data.values.select(Axis(0), &order);
            data.indices = (0..num_samples).collect();
            debug!("leaf {} finalized with {num_samples} rows", path.join("/"));
            Ok(())
        }
    }
}

fn collect_leaves<'a>(slot: &'a Slot, path: &mut Vec<String>, out: &mut Vec<(Vec<String>, ArrayViewD<'a, f32>)>) {
    match slot {
        Slot::Branch(children) => {
            for (key, child) in children {
                path.push(key.clone());
                collect_leaves(child, path, out);
                path.pop();
            }
        }
        Slot::Leaf(Some(data)) => out.push((path.clone(), data.values.view())),
        Slot::Leaf(None) => {}
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, ArrayD, IxDyn};

    use super::*;

    fn tree() -> ResultTree {
        ResultTree::new(vec![
            Level::new("method", ["m2", "m1"]).unwrap(),
            Level::new("activation_fn", ["linear"]).unwrap(),
        ])
        .unwrap()
    }

    fn rows(indices: &[usize], cols: usize) -> ArrayD<f32> {
        Array2::from_shape_fn((indices.len(), cols), |(i, j)| (indices[i] * 10 + j) as f32).into_dyn()
    }

    fn payload(indices: &[usize]) -> Node {
        let mut node = Node::branch();
        for method in ["m1", "m2"] {
            node.insert(&[method, "linear"], rows(indices, 2)).unwrap();
        }
        node
    }

    #[test]
    fn keys_are_sorted() {
        assert_eq!(tree().levels()[0].keys(), &["m1".to_string(), "m2".to_string()]);
    }

    #[test]
    fn out_of_order_batches_are_sorted_on_finalize() {
        let mut tree = tree();
        tree.append(&[2, 3], &payload(&[2, 3]), &[]).unwrap();
        tree.append(&[0, 1], &payload(&[0, 1]), &[]).unwrap();
        tree.finalize(4).unwrap();

        let leaf = tree.get(&["m1", "linear"]).unwrap();
        assert_eq!(leaf.shape(), &[4, 2]);
        assert_eq!(leaf[IxDyn(&[1, 1])], 11.0);
        assert_eq!(leaf[IxDyn(&[3, 0])], 30.0);
    }

    #[test]
    fn selectors_fix_a_level() {
        let mut tree = tree();
        let mut sub = Node::branch();
        sub.insert(&["linear"], rows(&[0, 1], 3)).unwrap();

        tree.append(&[0, 1], &sub, &[("method", "m2")]).unwrap();
        assert_eq!(tree.get(&["m2", "linear"]).unwrap().shape(), &[2, 3]);
        assert!(tree.get(&["m1", "linear"]).is_none());

        assert!(matches!(
            tree.append(&[0, 1], &sub, &[("method", "m3")]),
            Err(ResultErr::UnknownKey { .. })
        ));
        assert!(matches!(
            tree.append(&[0, 1], &sub, &[("masker", "x")]),
            Err(ResultErr::UnknownLevel(_))
        ));
    }

    #[test]
    fn gaps_and_overlaps_fail_to_finalize() {
        let mut gap = tree();
        gap.append(&[0, 2], &payload(&[0, 2]), &[]).unwrap();
        assert!(matches!(gap.finalize(3), Err(ResultErr::Coverage(_))));

        let mut overlap = tree();
        overlap.append(&[0, 1], &payload(&[0, 1]), &[]).unwrap();
        overlap.append(&[1, 2], &payload(&[1, 2]), &[]).unwrap();
        assert!(matches!(overlap.finalize(3), Err(ResultErr::Coverage(_))));
    }

    #[test]
    fn mismatched_trailing_shape_is_rejected() {
        let mut tree = tree();
        tree.append(&[0], &payload(&[0]), &[]).unwrap();

        let mut wide = Node::branch();
        wide.insert(&["m1", "linear"], rows(&[1], 5)).unwrap();
        assert!(matches!(tree.append(&[1], &wide, &[]), Err(ResultErr::Shape(_))));
    }

    #[test]
    fn payload_keys_must_exist() {
        let mut tree = tree();
        let mut bad = Node::branch();
        bad.insert(&["m9", "linear"], rows(&[0], 2)).unwrap();
        assert!(matches!(tree.append(&[0], &bad, &[]), Err(ResultErr::UnknownKey { .. })));
    }
}
