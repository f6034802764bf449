/*!
This crate implements a distributed decision tree classifier for random forests. The training set is stored in on-disk array files that may be too large for one machine's memory, so the top levels of the tree are grown as independent parallel split tasks over row-index subsets, and everything below a configured depth is dispatched as whole-subtree units of work. Prediction replays the path each dispatched subtree occupies and merges the per-subtree partial predictions back into one batch-ordered output.

For an end-to-end example, see `benchmarks/synthetic.rs`.
*/

#![allow(clippy::tabs_in_doc_comments)]

pub mod dataset;
pub mod error;
mod predict;
pub mod single;
pub mod split;
pub mod storage;
pub mod subtree;
pub mod train;

pub use dataset::{Partition, RfDataset};
pub use error::{FormatError, NotFittedError};
pub use single::SingleTree;
pub use subtree::{Subtree, SubtreeNode};
pub use train::DecisionTreeClassifier;

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

/// These are the options passed to `DecisionTreeClassifier::new`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOptions {
	/// The number of features to examine when looking for the best split. The search does not stop until at least one valid partition of the node's rows is found, even if that requires inspecting more than `max_features` features. If `None`, `ceil(sqrt(n_features))` is used.
	pub max_features: Option<usize>,
	/// The maximum depth of the tree. If `None`, nodes are expanded until all leaves are pure.
	pub max_depth: Option<usize>,
	/// The number of tree levels in which nodes are split as independent parallel tasks. Below this depth, whole subtrees are built as one unit of work each.
	pub distr_depth: usize,
	/// If true, the tree is fit on `n_samples` row indices drawn uniformly with replacement instead of on every row once.
	pub bootstrap: bool,
	/// A subtree whose `n_features * n_rows` product is at most this value is handed to the single-node learner instead of being grown split by split.
	pub single_node_max: usize,
	/// The seed for bootstrap and feature sampling. If `None`, a seed is drawn from entropy, so repeated fits on the same data may differ.
	pub seed: Option<u64>,
}

impl Default for TrainOptions {
	fn default() -> Self {
		Self {
			max_features: None,
			max_depth: None,
			distr_depth: 2,
			bootstrap: true,
			single_node_max: 100_000_000,
			seed: None,
		}
	}
}

/// The content produced for one distributed-phase node. Entries are stored in the node info table in the order their table slots were reserved, not the order the split tasks completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeInfo {
	Inner(InnerNodeInfo),
	Leaf(LeafInfo),
}

/// A binary threshold split. Rows whose value for `feature_index` is `<= threshold` are routed to the left child, all others to the right child. This convention is used identically during fitting and prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerNodeInfo {
	pub feature_index: usize,
	pub threshold: f32,
}

/// A terminal node. `frequencies` counts the label codes of the rows that reached this node and `mode` is the majority class, with ties resolved to the lowest class code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafInfo {
	pub size: usize,
	pub frequencies: Vec<usize>,
	pub mode: usize,
}

impl LeafInfo {
	/// The per-class probability vector for this leaf. An empty leaf yields all zeros.
	pub fn probabilities(&self, n_classes: usize) -> Vec<f32> {
		let mut probabilities = vec![0.0; n_classes];
		if self.size == 0 {
			return probabilities;
		}
		for (class, &frequency) in self.frequencies.iter().enumerate() {
			probabilities[class] = frequency.to_f32().unwrap() / self.size.to_f32().unwrap();
		}
		probabilities
	}
}

/// The distributed phase of the tree is stored as a `Vec` of `UpperNode`s. Each branch holds two indexes into that `Vec`, one for each of its children, and the position of its content in the node info table. Each frontier node holds the position of its subtree in the subtree list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UpperNode {
	Branch(UpperBranchNode),
	Frontier(FrontierNode),
}

/// A node in the distributed levels of the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpperBranchNode {
	/// This is the position of this node's content in the node info table.
	pub node_info_index: usize,
	/// This is the index in the upper node vector for this node's left child.
	pub left_child_index: usize,
	/// This is the index in the upper node vector for this node's right child.
	pub right_child_index: usize,
}

/// A node at the distributed depth limit whose rows were dispatched to the subtree builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierNode {
	/// This is the position of this node's subtree in the subtree list, which is also the integer value of its left/right path string.
	pub subtree_index: usize,
}
