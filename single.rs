/*!
This module implements the single-node tree learner used as the fast path for small subtrees. It fits a weighted binary classification tree over an in-memory feature matrix, bounded by the same `max_features` and depth constraints as the distributed search. The learner only realizes the classes present in its own subset, so its predictions carry a class set that may be smaller than the dataset's and must be scattered into the global class space when computing probabilities.
*/

use crate::split::best_split_point;
use ndarray::prelude::*;
use rand::seq::SliceRandom;
use rand_xoshiro::Xoshiro256Plus;
use serde::{Deserialize, Serialize};

/// A tree fit by the single-node learner. `classes` holds the global class codes realized in the training subset, in ascending order; leaf distributions are indexed by position in `classes`, not by global code.
#[derive(Debug, Serialize, Deserialize)]
pub struct SingleTree {
	pub nodes: Vec<SingleNode>,
	pub classes: Vec<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum SingleNode {
	Branch(SingleBranchNode),
	Leaf(SingleLeafNode),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SingleBranchNode {
	pub feature_index: usize,
	pub threshold: f32,
	pub left_child_index: usize,
	pub right_child_index: usize,
}

/// The weighted class distribution of a terminal node, over the tree's local class set.
#[derive(Debug, Serialize, Deserialize)]
pub struct SingleLeafNode {
	pub weights: Vec<f32>,
	pub mode: usize,
}

impl SingleTree {
	/// Fit a tree on `x` with row weights. `y` holds global class codes; `max_depth` of `None` grows until leaves are pure. The split search draws `max_features` features per attempt and keeps trying untried features until a valid partition is found or every feature is exhausted.
	pub fn fit(
		x: ArrayView2<f32>,
		y: &[usize],
		weights: &[f32],
		max_depth: Option<usize>,
		max_features: usize,
		rng: &mut Xoshiro256Plus,
	) -> Self {
		let mut classes: Vec<usize> = y.to_vec();
		classes.sort_unstable();
		classes.dedup();
		let y_local: Vec<usize> = y
			.iter()
			.map(|code| classes.binary_search(code).unwrap())
			.collect();
		let n_local_classes = classes.len();
		let n_features = x.ncols();
		let leaf = |rows: &[usize]| {
			let mut class_weights = vec![0.0f32; n_local_classes];
			for &row in rows {
				class_weights[y_local[row]] += weights[row];
			}
			let mut mode = 0;
			for (class, &weight) in class_weights.iter().enumerate() {
				if weight > class_weights[mode] {
					mode = class;
				}
			}
			SingleNode::Leaf(SingleLeafNode {
				weights: class_weights,
				mode,
			})
		};
		let mut nodes = vec![SingleNode::Leaf(SingleLeafNode {
			weights: Vec::new(),
			mode: 0,
		})];
		let mut stack: Vec<(usize, Vec<usize>, usize)> =
			vec![(0, (0..x.nrows()).collect(), 0)];
		while let Some((slot, rows, depth)) = stack.pop() {
			let pure = rows
				.windows(2)
				.all(|pair| y_local[pair[0]] == y_local[pair[1]]);
			let out_of_depth = max_depth.map_or(false, |max_depth| depth >= max_depth);
			if pure || out_of_depth {
				nodes[slot] = leaf(&rows);
				continue;
			}
			let mut untried: Vec<usize> = (0..n_features).collect();
			let split = loop {
				let drawn: Vec<usize> = untried
					.choose_multiple(rng, max_features.min(untried.len()))
					.copied()
					.collect();
				let best = drawn
					.iter()
					.filter_map(|&feature_index| {
						let mut points: Vec<(f32, usize, f32)> = rows
							.iter()
							.map(|&row| (x[[row, feature_index]], y_local[row], weights[row]))
							.collect();
						best_split_point(&mut points, n_local_classes)
							.map(|candidate| (feature_index, candidate))
					})
					.min_by(|a, b| a.1.score.partial_cmp(&b.1.score).unwrap());
				if let Some((feature_index, candidate)) = best {
					let (left, right): (Vec<usize>, Vec<usize>) = rows
						.iter()
						.copied()
						.partition(|&row| x[[row, feature_index]] <= candidate.threshold);
					if !left.is_empty() && !right.is_empty() {
						break Some((feature_index, candidate.threshold, left, right));
					}
				}
				untried.retain(|feature_index| !drawn.contains(feature_index));
				if untried.is_empty() {
					break None;
				}
			};
			match split {
				Some((feature_index, threshold, left, right)) => {
					let left_child_index = nodes.len();
					nodes.push(SingleNode::Leaf(SingleLeafNode {
						weights: Vec::new(),
						mode: 0,
					}));
					let right_child_index = nodes.len();
					nodes.push(SingleNode::Leaf(SingleLeafNode {
						weights: Vec::new(),
						mode: 0,
					}));
					nodes[slot] = SingleNode::Branch(SingleBranchNode {
						feature_index,
						threshold,
						left_child_index,
						right_child_index,
					});
					stack.push((right_child_index, right, depth + 1));
					stack.push((left_child_index, left, depth + 1));
				}
				None => {
					nodes[slot] = leaf(&rows);
				}
			}
		}
		Self { nodes, classes }
	}

	/// Walk to a terminal node for one row.
	fn terminal(&self, row: ArrayView1<f32>) -> &SingleLeafNode {
		let mut node_index = 0;
		loop {
			match &self.nodes[node_index] {
				SingleNode::Branch(branch) => {
					node_index = if row[branch.feature_index] <= branch.threshold {
						branch.left_child_index
					} else {
						branch.right_child_index
					};
				}
				SingleNode::Leaf(leaf) => return leaf,
			}
		}
	}

	/// Predict the global class code for one row.
	pub fn predict_row(&self, row: ArrayView1<f32>) -> usize {
		self.classes[self.terminal(row).mode]
	}

	/// Predict per-class probabilities for one row, scattered into the global `n_classes`-wide space. Classes absent from this tree's subset get zero probability.
	pub fn predict_proba_row(&self, row: ArrayView1<f32>, n_classes: usize) -> Vec<f32> {
		let leaf = self.terminal(row);
		let total: f32 = leaf.weights.iter().sum();
		let mut probabilities = vec![0.0; n_classes];
		if total == 0.0 {
			return probabilities;
		}
		for (&class, &weight) in self.classes.iter().zip(leaf.weights.iter()) {
			probabilities[class] = weight / total;
		}
		probabilities
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use ndarray::array;
	use rand::SeedableRng;

	#[test]
	fn test_fit_reproduces_separable_labels() {
		let x = array![[0.0f32], [1.0], [2.0], [3.0]];
		let y = [0, 0, 1, 1];
		let weights = [1.0f32; 4];
		let mut rng = Xoshiro256Plus::seed_from_u64(0);
		let tree = SingleTree::fit(x.view(), &y, &weights, None, 1, &mut rng);
		for (row, &code) in y.iter().enumerate() {
			assert_eq!(tree.predict_row(x.view().row(row)), code);
		}
	}

	#[test]
	fn test_classes_are_the_realized_subset_of_global_codes() {
		// Global codes 0 and 2 only; code 1 is absent from this subset.
		let x = array![[0.0f32], [1.0], [2.0], [3.0]];
		let y = [0, 0, 2, 2];
		let weights = [1.0f32; 4];
		let mut rng = Xoshiro256Plus::seed_from_u64(0);
		let tree = SingleTree::fit(x.view(), &y, &weights, None, 1, &mut rng);
		assert_eq!(tree.classes, [0, 2]);
		let probabilities = tree.predict_proba_row(x.view().row(3), 3);
		assert_eq!(probabilities, [0.0, 0.0, 1.0]);
	}

	#[test]
	fn test_depth_zero_predicts_the_weighted_majority() {
		let x = array![[0.0f32], [1.0], [2.0]];
		let y = [0, 1, 1];
		// The single row of class 0 outweighs the two rows of class 1.
		let weights = [5.0f32, 1.0, 1.0];
		let mut rng = Xoshiro256Plus::seed_from_u64(0);
		let tree = SingleTree::fit(x.view(), &y, &weights, Some(0), 1, &mut rng);
		assert_eq!(tree.nodes.len(), 1);
		assert_eq!(tree.predict_row(x.view().row(1)), 0);
	}

	#[test]
	fn test_probabilities_are_leaf_weight_fractions() {
		let x = array![[0.0f32], [0.0], [0.0]];
		let y = [0, 0, 1];
		let weights = [1.0f32, 1.0, 2.0];
		let mut rng = Xoshiro256Plus::seed_from_u64(0);
		// The constant feature leaves one root leaf holding all rows.
		let tree = SingleTree::fit(x.view(), &y, &weights, None, 1, &mut rng);
		let probabilities = tree.predict_proba_row(x.view().row(0), 2);
		assert_eq!(probabilities, [0.5, 0.5]);
	}
}
