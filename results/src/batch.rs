use std::collections::BTreeMap;

use comms::msg::{LeafHeader, PartialHeader};
use ndarray::{ArrayD, IxDyn};

use crate::{Result, ResultErr};

/// A nested mapping from keys to arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Branch(BTreeMap<String, Node>),
    Leaf(ArrayD<f32>),
}

impl Node {
    pub fn branch() -> Self {
        Self::Branch(BTreeMap::new())
    }

    /// Places `leaf` under `path`, creating branches on the way.
    pub fn insert<S: AsRef<str>>(&mut self, path: &[S], leaf: ArrayD<f32>) -> Result<()> {
        let Some((last, parents)) = path.split_last() else {
            return Err(ResultErr::Shape("a leaf needs a non empty path".into()));
        };

        let mut node = self;
        for key in parents {
            let Node::Branch(children) = node else {
                return Err(ResultErr::Shape(format!("{:?} is below a leaf", key.as_ref())));
            };
            node = children
                .entry(key.as_ref().to_string())
                .or_insert_with(Node::branch);
        }

        let Node::Branch(children) = node else {
            return Err(ResultErr::Shape(format!("{:?} is below a leaf", last.as_ref())));
        };
        children.insert(last.as_ref().to_string(), Node::Leaf(leaf));
        Ok(())
    }

    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&Node> {
        path.iter().try_fold(self, |node, key| match node {
            Node::Branch(children) => children.get(key.as_ref()),
            Node::Leaf(_) => None,
        })
    }

    /// Every leaf with its path, in key order.
    pub fn leaves(&self) -> Vec<(Vec<String>, &ArrayD<f32>)> {
        let mut out = Vec::new();
        self.collect_leaves(&mut Vec::new(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, path: &mut Vec<String>, out: &mut Vec<(Vec<String>, &'a ArrayD<f32>)>) {
        match self {
            Node::Leaf(leaf) => out.push((path.clone(), leaf)),
            Node::Branch(children) => {
                for (key, child) in children {
                    path.push(key.clone());
                    child.collect_leaves(path, out);
                    path.pop();
                }
            }
        }
    }
}

/// The results of one batch: a row per entry of `indices` in every leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub indices: Vec<usize>,
    /// Keyed by group first, then by that group's levels.
    pub results: Node,
}

impl BatchResult {
    pub fn new(indices: Vec<usize>) -> Self {
        Self {
            indices,
            results: Node::branch(),
        }
    }

    /// Adds a leaf, checking it has one row per sample of the batch.
    pub fn insert<S: AsRef<str>>(&mut self, path: &[S], values: ArrayD<f32>) -> Result<()> {
        let rows = values.shape().first().copied().unwrap_or(0);
        if rows != self.indices.len() {
            return Err(ResultErr::Shape(format!(
                "leaf has {rows} rows for a batch of {} samples",
                self.indices.len()
            )));
        }

        self.results.insert(path, values)
    }

    /// Flattens the result into a wire header and its values.
    pub fn to_wire(&self, rank: usize) -> (PartialHeader, Vec<f32>) {
        let leaves = self.results.leaves();
        let mut values = Vec::with_capacity(leaves.iter().map(|(_, leaf)| leaf.len()).sum());

        let leaves = leaves
            .into_iter()
            .map(|(path, leaf)| {
                values.extend(leaf.iter().copied());
                LeafHeader {
                    path,
                    shape: leaf.shape().to_vec(),
                }
            })
            .collect();

        let header = PartialHeader {
            rank,
            indices: self.indices.clone(),
            leaves,
        };

        (header, values)
    }

    /// Rebuilds a result from a wire header and its values.
    pub fn from_wire(header: &PartialHeader, values: &[f32]) -> Result<Self> {
        let mut result = Self::new(header.indices.clone());
        let mut rest = values;

        for leaf in &header.leaves {
            if leaf.len() > rest.len() {
                return Err(ResultErr::Shape(format!(
                    "leaf {:?} needs {} values but only {} are left",
                    leaf.path,
                    leaf.len(),
                    rest.len()
                )));
            }

            let (taken, remaining) = rest.split_at(leaf.len());
            rest = remaining;

            let array = ArrayD::from_shape_vec(IxDyn(&leaf.shape), taken.to_vec())
                .map_err(|err| ResultErr::Shape(err.to_string()))?;
            result.insert(leaf.path.as_slice(), array)?;
        }

        if !rest.is_empty() {
            return Err(ResultErr::Shape(format!("{} trailing values", rest.len())));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2};

    use super::*;

    #[test]
    fn wire_conversion_keeps_paths_and_values() {
        let mut result = BatchResult::new(vec![4, 1]);
        result
            .insert(
                &["deletion", "m1", "constant", "linear"],
                Array2::from_shape_fn((2, 3), |(i, j)| (i * 3 + j) as f32).into_dyn(),
            )
            .unwrap();
        result
            .insert(&["deletion", "_BASELINE", "constant", "linear"], Array1::from(vec![7.0, 8.0]).into_dyn())
            .unwrap();

        let (header, values) = result.to_wire(2);
        assert_eq!(header.rank, 2);
        assert_eq!(header.leaves[0].path[1], "_BASELINE");
        assert_eq!(values.len(), 8);

        assert_eq!(BatchResult::from_wire(&header, &values).unwrap(), result);
        assert!(BatchResult::from_wire(&header, &values[1..]).is_err());
    }

    #[test]
    fn rows_must_match_the_batch() {
        let mut result = BatchResult::new(vec![0, 1, 2]);
        let err = result
            .insert(&["g", "leaf"], Array1::<f32>::zeros(2).into_dyn())
            .unwrap_err();
        assert!(matches!(err, ResultErr::Shape(_)));
    }
}
