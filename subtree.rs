/*!
This module grows one subtree over one row group, independently of every other dispatched subtree. Growth uses the same split search as the distributed levels, except that a group small enough to fit cheaply in one unit of work is handed to the single-node learner instead of being grown split by split.
*/

use crate::{
	single::SingleTree,
	storage::MatrixFile,
	train::{compute_split, leaf_info, FeatureSource, RowGroup},
	InnerNodeInfo, LeafInfo, NodeInfo,
};
use itertools::izip;
use ndarray::prelude::*;
use rand_xoshiro::Xoshiro256Plus;
use serde::{Deserialize, Serialize};

/// A subtree is stored as a `Vec` of `SubtreeNode`s. Each branch holds two indexes into the `Vec`, one for each of its children.
#[derive(Debug, Serialize, Deserialize)]
pub struct Subtree {
	pub nodes: Vec<SubtreeNode>,
}

/// A node holds exactly one of three contents: a binary split with two children, a leaf, or a whole single-node learner tree with its own realized class set.
#[derive(Debug, Serialize, Deserialize)]
pub enum SubtreeNode {
	Branch(SubtreeBranchNode),
	Leaf(LeafInfo),
	Single(SingleTree),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubtreeBranchNode {
	pub inner: InnerNodeInfo,
	/// This is the index in the subtree's node vector for this node's left child.
	pub left_child_index: usize,
	/// This is the index in the subtree's node vector for this node's right child.
	pub right_child_index: usize,
}

/// The read-only inputs shared by every subtree build dispatched from one fit.
pub struct GrowContext<'a> {
	pub samples: &'a MatrixFile,
	pub features: &'a FeatureSource<'a>,
	pub n_features: usize,
	pub n_classes: usize,
	pub max_features: usize,
	pub single_node_max: usize,
}

/// Grow one subtree over `group`, down to `depth_budget` more levels (`None` means unbounded). An empty group yields a degenerate zero-count leaf, not an error.
pub fn build_subtree(
	group: RowGroup,
	depth_budget: Option<usize>,
	context: &GrowContext,
	rng: &mut Xoshiro256Plus,
) -> Subtree {
	let placeholder = || {
		SubtreeNode::Leaf(LeafInfo {
			size: 0,
			frequencies: Vec::new(),
			mode: 0,
		})
	};
	let mut nodes = vec![placeholder()];
	let mut stack = vec![(0usize, group, 0usize)];
	while let Some((slot, group, depth)) = stack.pop() {
		let out_of_depth = depth_budget.map_or(false, |depth_budget| depth >= depth_budget);
		if out_of_depth || group.is_empty() || group.is_pure() {
			nodes[slot] = SubtreeNode::Leaf(leaf_info(&group.y, context.n_classes));
			continue;
		}
		if context.n_features * group.len() <= context.single_node_max {
			let (rows, weights, y) = deduplicate(&group);
			let x = gather_rows(context.samples, &rows);
			let single = SingleTree::fit(
				x.view(),
				&y,
				&weights,
				depth_budget.map(|depth_budget| depth_budget - depth),
				context.max_features,
				rng,
			);
			nodes[slot] = SubtreeNode::Single(single);
			continue;
		}
		let split = compute_split(
			group,
			context.features,
			context.n_features,
			context.n_classes,
			context.max_features,
			rng,
		);
		match split.info {
			NodeInfo::Inner(inner) => {
				let left_child_index = nodes.len();
				nodes.push(placeholder());
				let right_child_index = nodes.len();
				nodes.push(placeholder());
				nodes[slot] = SubtreeNode::Branch(SubtreeBranchNode {
					inner,
					left_child_index,
					right_child_index,
				});
				stack.push((right_child_index, split.right, depth + 1));
				stack.push((left_child_index, split.left, depth + 1));
			}
			NodeInfo::Leaf(leaf) => {
				nodes[slot] = SubtreeNode::Leaf(leaf);
			}
		}
	}
	Subtree { nodes }
}

/// Collapse a sorted row multiset into unique rows with integer weights. Duplicate rows come from bootstrap resampling and always carry the same label.
fn deduplicate(group: &RowGroup) -> (Vec<usize>, Vec<f32>, Vec<usize>) {
	let mut rows: Vec<usize> = Vec::new();
	let mut weights: Vec<f32> = Vec::new();
	let mut y: Vec<usize> = Vec::new();
	for (&row, &code) in group.rows.iter().zip(group.y.iter()) {
		if rows.last() == Some(&row) {
			*weights.last_mut().unwrap() += 1.0;
		} else {
			rows.push(row);
			weights.push(1.0);
			y.push(code);
		}
	}
	(rows, weights, y)
}

/// Fetch the feature vectors for a set of rows from the sample file.
fn gather_rows(samples: &MatrixFile, rows: &[usize]) -> Array2<f32> {
	let view = samples.view();
	let mut x = Array2::zeros((rows.len(), samples.ncols()));
	for (&row, mut out) in izip!(rows, x.genrows_mut()) {
		out.assign(&view.row(row));
	}
	x
}

impl Subtree {
	/// Predict the class code for one row by walking from the root to a terminal node.
	pub fn predict_row(&self, row: ArrayView1<f32>) -> usize {
		let mut node_index = 0;
		loop {
			match &self.nodes[node_index] {
				SubtreeNode::Branch(branch) => {
					node_index = if row[branch.inner.feature_index] <= branch.inner.threshold {
						branch.left_child_index
					} else {
						branch.right_child_index
					};
				}
				SubtreeNode::Leaf(leaf) => return leaf.mode,
				SubtreeNode::Single(single) => return single.predict_row(row),
			}
		}
	}

	/// Predict the per-class probabilities for one row. Single-node learner terminals scatter their probabilities into the full `n_classes`-wide vector, with zeros for classes absent from their subset.
	pub fn predict_proba_row(&self, row: ArrayView1<f32>, n_classes: usize) -> Vec<f32> {
		let mut node_index = 0;
		loop {
			match &self.nodes[node_index] {
				SubtreeNode::Branch(branch) => {
					node_index = if row[branch.inner.feature_index] <= branch.inner.threshold {
						branch.left_child_index
					} else {
						branch.right_child_index
					};
				}
				SubtreeNode::Leaf(leaf) => return leaf.probabilities(n_classes),
				SubtreeNode::Single(single) => return single.predict_proba_row(row, n_classes),
			}
		}
	}
}
