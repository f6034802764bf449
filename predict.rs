/*!
This module implements prediction for a fitted tree. Each subtree dispatched during the distributed phase occupies one root-to-frontier path, identified by its index in the subtree list written in binary. Prediction replays each path against the node info table to find the batch rows that fall into each subtree, runs every subtree's local prediction in parallel, and scatters the partial results back into one output ordered like the input batch. The per-subtree row sets partition the batch exactly, so the scatter writes every row exactly once.
*/

use crate::{
	error::NotFittedError,
	train::{DecisionTreeClassifier, FittedTree},
	NodeInfo, UpperNode,
};
use itertools::izip;
use ndarray::prelude::*;
use rayon::prelude::*;

/// The left/right path of the subtree at `subtree_index`: the index written in binary, left-padded to `distr_depth` bits. `false` means left. The path is recomputed from the index, never stored.
fn subtree_path(subtree_index: usize, distr_depth: usize) -> Vec<bool> {
	(0..distr_depth)
		.rev()
		.map(|bit| (subtree_index >> bit) & 1 == 1)
		.collect()
}

/// Replay one path against the node info table, refining the set of batch rows that reach the subtree at the end of the path. Bit 0 keeps the rows with feature value `<= threshold`, bit 1 the rest, matching the routing used during fitting.
fn branch_rows(x: ArrayView2<f32>, fitted: &FittedTree, path: &[bool]) -> Vec<usize> {
	let mut rows: Vec<usize> = (0..x.nrows()).collect();
	let mut node_index = 0;
	for &go_right in path {
		let branch = match &fitted.upper[node_index] {
			UpperNode::Branch(branch) => branch,
			// Paths are exactly distr_depth bits and frontier nodes only occur at that depth.
			UpperNode::Frontier(_) => unreachable!(),
		};
		match &fitted.nodes_info[branch.node_info_index] {
			NodeInfo::Inner(inner) => {
				rows.retain(|&row| (x[[row, inner.feature_index]] <= inner.threshold) != go_right);
			}
			// A distributed-level node that exhausted its features routed its whole subset left.
			NodeInfo::Leaf(_) => {
				if go_right {
					rows.clear();
				}
			}
		}
		node_index = if go_right {
			branch.right_child_index
		} else {
			branch.left_child_index
		};
	}
	rows
}

impl DecisionTreeClassifier {
	/// Predict class codes for a batch. The values index the fitted dataset's `classes()`. The output is ordered identically to the input batch.
	pub fn predict(&self, x: ArrayView2<f32>) -> Result<Array1<usize>, NotFittedError> {
		let fitted = self.fitted()?;
		let branches: Vec<(Vec<usize>, Vec<usize>)> = (0..fitted.subtrees.len())
			.into_par_iter()
			.map(|subtree_index| {
				let path = subtree_path(subtree_index, fitted.distr_depth);
				let rows = branch_rows(x, fitted, &path);
				let subtree = &fitted.subtrees[subtree_index];
				let predictions = rows
					.iter()
					.map(|&row| subtree.predict_row(x.row(row)))
					.collect();
				(rows, predictions)
			})
			.collect();
		let mut merged = Array1::zeros(x.nrows());
		for (rows, predictions) in branches {
			for (row, prediction) in izip!(rows, predictions) {
				merged[row] = prediction;
			}
		}
		Ok(merged)
	}

	/// Predict class probabilities for a batch. The output has shape `(x.nrows(), n_classes)` with columns indexed by class code, and rows ordered identically to the input batch.
	pub fn predict_proba(&self, x: ArrayView2<f32>) -> Result<Array2<f32>, NotFittedError> {
		let fitted = self.fitted()?;
		let n_classes = fitted.n_classes;
		let branches: Vec<(Vec<usize>, Vec<Vec<f32>>)> = (0..fitted.subtrees.len())
			.into_par_iter()
			.map(|subtree_index| {
				let path = subtree_path(subtree_index, fitted.distr_depth);
				let rows = branch_rows(x, fitted, &path);
				let subtree = &fitted.subtrees[subtree_index];
				let predictions = rows
					.iter()
					.map(|&row| subtree.predict_proba_row(x.row(row), n_classes))
					.collect();
				(rows, predictions)
			})
			.collect();
		let mut merged = Array2::zeros((x.nrows(), n_classes));
		for (rows, predictions) in branches {
			for (row, probabilities) in izip!(rows, predictions) {
				for (slot, probability) in merged.row_mut(row).iter_mut().zip(probabilities) {
					*slot = probability;
				}
			}
		}
		Ok(merged)
	}
}
