/*!
This module implements the node splitter and the distributed tree builder. The top `distr_depth` levels of the tree are grown level by level, one independent split task per frontier node, and every frontier node at the distributed depth limit is dispatched to the subtree builder as one unit of work. Node content goes into a flat node info table whose slots are reserved before the split tasks run, so the table order never depends on task completion order.
*/

use crate::{
	dataset::RfDataset,
	error::{FormatError, NotFittedError},
	split::score_split,
	storage::MatrixFile,
	subtree::{build_subtree, GrowContext, Subtree},
	FrontierNode, InnerNodeInfo, LeafInfo, NodeInfo, TrainOptions, UpperBranchNode, UpperNode,
};
use ndarray::prelude::*;
use num_traits::ToPrimitive;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A row-index subset under consideration at one tree node, together with the label codes of those rows. Bootstrap subsets are multisets: the same row index can appear more than once. Rows are always in ascending order.
#[derive(Debug, Clone, Default)]
pub struct RowGroup {
	pub rows: Vec<usize>,
	pub y: Vec<usize>,
}

impl RowGroup {
	fn push(&mut self, row: usize, code: usize) {
		self.rows.push(row);
		self.y.push(code);
	}

	pub fn len(&self) -> usize {
		self.rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	/// True when every row in the group has the same label.
	pub fn is_pure(&self) -> bool {
		self.y.windows(2).all(|pair| pair[0] == pair[1])
	}
}

/// Where the split search reads feature columns from: the transposed feature file when the dataset has one, so each feature is one contiguous row scan, or column reads from the sample file otherwise.
pub enum FeatureSource<'a> {
	Transposed(&'a MatrixFile),
	Samples(&'a MatrixFile),
}

impl<'a> FeatureSource<'a> {
	/// The column of values for one feature, indexed by row. The returned view borrows the mapped file, not this `FeatureSource`.
	pub fn feature(&self, feature_index: usize) -> ArrayView1<'a, f32> {
		match self {
			FeatureSource::Transposed(matrix) => {
				matrix.view().index_axis_move(Axis(0), feature_index)
			}
			FeatureSource::Samples(matrix) => matrix.view().index_axis_move(Axis(1), feature_index),
		}
	}
}

/// The result of one split task: the node's content and the two child row groups. When the content is a leaf, the left group carries the entire surviving subset and the right group is empty.
#[derive(Debug)]
pub struct SplitOutput {
	pub info: NodeInfo,
	pub left: RowGroup,
	pub right: RowGroup,
}

/// Compute the frequency vector and majority class for a group's labels. Ties resolve to the lowest class code.
pub fn leaf_info(y: &[usize], n_classes: usize) -> LeafInfo {
	let mut frequencies = vec![0usize; n_classes];
	for &code in y {
		frequencies[code] += 1;
	}
	let mut mode = 0;
	for (class, &frequency) in frequencies.iter().enumerate() {
		if frequency > frequencies[mode] {
			mode = class;
		}
	}
	LeafInfo {
		size: y.len(),
		frequencies,
		mode,
	}
}

/// Select the rows to fit the tree on: every row once, or `n_samples` draws with replacement when bootstrapping. Bootstrap draws are sorted ascending and the label codes are re-derived for the resampled multiset.
pub fn sample_selection(
	n_samples: usize,
	y_codes: &[usize],
	bootstrap: bool,
	rng: &mut Xoshiro256Plus,
) -> RowGroup {
	if bootstrap {
		let mut rows: Vec<usize> = (0..n_samples).map(|_| rng.gen_range(0, n_samples)).collect();
		rows.sort_unstable();
		let y = rows.iter().map(|&row| y_codes[row]).collect();
		RowGroup { rows, y }
	} else {
		RowGroup {
			rows: (0..n_samples).collect(),
			y: y_codes.to_vec(),
		}
	}
}

/// Search for the best split of a row group, examining `max_features` randomly drawn untried features per attempt and retrying with the remaining features whenever the winning threshold fails to produce two non-empty sides. After all features have been tried the group becomes a leaf, so the search finishes in at most `n_features` rounds.
pub fn compute_split(
	group: RowGroup,
	features: &FeatureSource,
	n_features: usize,
	n_classes: usize,
	max_features: usize,
	rng: &mut Xoshiro256Plus,
) -> SplitOutput {
	let mut untried: Vec<usize> = (0..n_features).collect();
	loop {
		let drawn: Vec<usize> = untried
			.choose_multiple(rng, max_features.min(untried.len()))
			.copied()
			.collect();
		let best = drawn
			.iter()
			.filter_map(|&feature_index| {
				score_split(&group.rows, &group.y, features.feature(feature_index), n_classes)
					.map(|candidate| (feature_index, candidate))
			})
			.min_by(|a, b| a.1.score.partial_cmp(&b.1.score).unwrap());
		if let Some((feature_index, candidate)) = best {
			let feature = features.feature(feature_index);
			let mut left = RowGroup::default();
			let mut right = RowGroup::default();
			for (&row, &code) in group.rows.iter().zip(group.y.iter()) {
				if feature[row] <= candidate.threshold {
					left.push(row, code);
				} else {
					right.push(row, code);
				}
			}
			if !left.is_empty() && !right.is_empty() {
				return SplitOutput {
					info: NodeInfo::Inner(InnerNodeInfo {
						feature_index,
						threshold: candidate.threshold,
					}),
					left,
					right,
				};
			}
		}
		untried.retain(|feature_index| !drawn.contains(feature_index));
		if untried.is_empty() {
			let info = NodeInfo::Leaf(leaf_info(&group.y, n_classes));
			return SplitOutput {
				info,
				left: group,
				right: RowGroup::default(),
			};
		}
	}
}

const SEED_INCREMENT: u64 = 0x9E37_79B9_7F4A_7C15;
const SUBTREE_SEED_STREAM: u64 = 1 << 32;

/// The generator for one unit of work, derived from the base seed and the unit's reserved index so a seeded fit is deterministic no matter how the units are scheduled.
fn task_rng(base_seed: u64, task_index: u64) -> Xoshiro256Plus {
	Xoshiro256Plus::seed_from_u64(base_seed.wrapping_add(task_index.wrapping_mul(SEED_INCREMENT)))
}

/// Everything `fit` produces: the distributed-phase nodes, their content table, and the dispatched subtrees in path order.
#[derive(Debug, Serialize, Deserialize)]
pub struct FittedTree {
	pub upper: Vec<UpperNode>,
	pub nodes_info: Vec<NodeInfo>,
	pub subtrees: Vec<Subtree>,
	pub distr_depth: usize,
	pub n_classes: usize,
}

/// A distributed decision tree classifier.
#[derive(Debug, Serialize, Deserialize)]
pub struct DecisionTreeClassifier {
	pub options: TrainOptions,
	pub(crate) fitted: Option<FittedTree>,
}

struct LevelEntry {
	node_index: usize,
	group: RowGroup,
}

impl DecisionTreeClassifier {
	pub fn new(options: TrainOptions) -> Self {
		Self {
			options,
			fitted: None,
		}
	}

	/// The fitted tree, or `None` before `fit`.
	pub fn fitted(&self) -> Result<&FittedTree, NotFittedError> {
		self.fitted.as_ref().ok_or(NotFittedError)
	}

	/// Fit the tree on a dataset. The distributed levels run one split task per frontier node in parallel, then every frontier row group is dispatched to the subtree builder, also in parallel. All tasks read the sample and feature files through read-only maps and share no mutable state, and any task failure aborts the whole fit.
	pub fn fit(&mut self, dataset: &RfDataset) -> Result<(), FormatError> {
		let n_samples = dataset.n_samples()?;
		let n_features = dataset.n_features()?;
		let n_classes = dataset.n_classes()?;
		let y_codes = dataset.y_codes()?;
		let samples = MatrixFile::open(dataset.samples_path())?;
		if (samples.nrows(), samples.ncols()) != (n_samples, n_features) {
			return Err(FormatError::ShapeMismatch {
				expected: (n_samples, n_features),
				found: (samples.nrows(), samples.ncols()),
			});
		}
		dataset.validate_features_file()?;
		let features_file = dataset.features_path().map(MatrixFile::open).transpose()?;
		let features = match &features_file {
			Some(features_file) => FeatureSource::Transposed(features_file),
			None => FeatureSource::Samples(&samples),
		};
		let max_features = self
			.options
			.max_features
			.unwrap_or_else(|| n_features.to_f64().unwrap().sqrt().ceil().to_usize().unwrap())
			.max(1);
		let base_seed = self.options.seed.unwrap_or_else(rand::random);

		let root_group = sample_selection(
			n_samples,
			y_codes,
			self.options.bootstrap,
			&mut task_rng(base_seed, 0),
		);
		let mut upper = vec![UpperNode::Frontier(FrontierNode {
			subtree_index: usize::MAX,
		})];
		let mut nodes_info: Vec<Option<NodeInfo>> = Vec::new();
		let mut frontier = vec![LevelEntry {
			node_index: 0,
			group: root_group,
		}];

		// Grow the distributed levels. Table slots for this level are reserved up front, in frontier order, so each task's identity exists before any task runs.
		for _ in 0..self.options.distr_depth {
			let slot_base = nodes_info.len();
			nodes_info.resize_with(slot_base + frontier.len(), || None);
			let splits: Vec<(usize, SplitOutput)> = frontier
				.into_par_iter()
				.enumerate()
				.map(|(i, entry)| {
					let mut rng = task_rng(base_seed, 1 + (slot_base + i) as u64);
					let split = compute_split(
						entry.group,
						&features,
						n_features,
						n_classes,
						max_features,
						&mut rng,
					);
					(entry.node_index, split)
				})
				.collect();
			let mut next = Vec::with_capacity(2 * splits.len());
			for (i, (node_index, split)) in splits.into_iter().enumerate() {
				let node_info_index = slot_base + i;
				nodes_info[node_info_index] = Some(split.info);
				let left_child_index = upper.len();
				upper.push(UpperNode::Frontier(FrontierNode {
					subtree_index: usize::MAX,
				}));
				let right_child_index = upper.len();
				upper.push(UpperNode::Frontier(FrontierNode {
					subtree_index: usize::MAX,
				}));
				upper[node_index] = UpperNode::Branch(UpperBranchNode {
					node_info_index,
					left_child_index,
					right_child_index,
				});
				next.push(LevelEntry {
					node_index: left_child_index,
					group: split.left,
				});
				next.push(LevelEntry {
					node_index: right_child_index,
					group: split.right,
				});
			}
			frontier = next;
		}

		// Dispatch one subtree per frontier node. The subtree list is in frontier order, which makes each subtree's index the integer value of its left/right path.
		let depth_budget = self
			.options
			.max_depth
			.map(|max_depth| max_depth.saturating_sub(self.options.distr_depth));
		let context = GrowContext {
			samples: &samples,
			features: &features,
			n_features,
			n_classes,
			max_features,
			single_node_max: self.options.single_node_max,
		};
		let node_indices: Vec<usize> = frontier.iter().map(|entry| entry.node_index).collect();
		let subtrees: Vec<Subtree> = frontier
			.into_par_iter()
			.enumerate()
			.map(|(i, entry)| {
				let mut rng = task_rng(base_seed, SUBTREE_SEED_STREAM | i as u64);
				build_subtree(entry.group, depth_budget, &context, &mut rng)
			})
			.collect();
		for (subtree_index, node_index) in node_indices.into_iter().enumerate() {
			upper[node_index] = UpperNode::Frontier(FrontierNode { subtree_index });
		}

		let nodes_info: Vec<NodeInfo> = nodes_info.into_iter().map(|info| info.unwrap()).collect();
		self.fitted = Some(FittedTree {
			upper,
			nodes_info,
			subtrees,
			distr_depth: self.options.distr_depth,
			n_classes,
		});
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::storage;
	use ndarray::array;
	use std::path::Path;

	fn matrix_file(dir: &Path, name: &str, array: ArrayView2<f32>) -> MatrixFile {
		let path = dir.join(name);
		storage::allocate_matrix(&path, array.nrows(), array.ncols()).unwrap();
		storage::write_rows(&path, 0, array).unwrap();
		MatrixFile::open(&path).unwrap()
	}

	#[test]
	fn test_bootstrap_selection_draws_n_sorted_rows_with_repetition() {
		let y_codes = [0, 1, 0, 1, 0, 1, 0, 1];
		let mut rng = Xoshiro256Plus::seed_from_u64(7);
		let group = sample_selection(8, &y_codes, true, &mut rng);
		assert_eq!(group.rows.len(), 8);
		assert!(group.rows.windows(2).all(|pair| pair[0] <= pair[1]));
		assert!(group.rows.iter().all(|&row| row < 8));
		for (&row, &code) in group.rows.iter().zip(group.y.iter()) {
			assert_eq!(code, y_codes[row]);
		}
	}

	#[test]
	fn test_selection_without_bootstrap_is_the_identity() {
		let y_codes = [1, 0, 1];
		let mut rng = Xoshiro256Plus::seed_from_u64(7);
		let group = sample_selection(3, &y_codes, false, &mut rng);
		assert_eq!(group.rows, [0, 1, 2]);
		assert_eq!(group.y, y_codes);
	}

	#[test]
	fn test_split_partitions_the_group_into_two_non_empty_sides() {
		let dir = tempfile::tempdir().unwrap();
		let samples = matrix_file(
			dir.path(),
			"samples.npy",
			array![
				[0.0f32, 9.0],
				[1.0, 8.0],
				[2.0, 7.0],
				[3.0, 6.0],
				[4.0, 5.0],
				[5.0, 4.0]
			]
			.view(),
		);
		let features = FeatureSource::Samples(&samples);
		let group = RowGroup {
			rows: vec![0, 1, 2, 3, 4, 5],
			y: vec![0, 0, 0, 1, 1, 1],
		};
		let mut rng = Xoshiro256Plus::seed_from_u64(0);
		let split = compute_split(group, &features, 2, 2, 2, &mut rng);
		let inner = match split.info {
			NodeInfo::Inner(inner) => inner,
			info => panic!("expected an inner node, found {:?}", info),
		};
		assert_eq!(split.left.len() + split.right.len(), 6);
		assert!(!split.left.is_empty());
		assert!(!split.right.is_empty());
		let feature = FeatureSource::Samples(&samples).feature(inner.feature_index);
		assert!(split.left.rows.iter().all(|&row| feature[row] <= inner.threshold));
		assert!(split.right.rows.iter().all(|&row| feature[row] > inner.threshold));
	}

	#[test]
	fn test_split_retries_past_a_constant_feature() {
		let dir = tempfile::tempdir().unwrap();
		let samples = matrix_file(
			dir.path(),
			"samples.npy",
			array![[3.0f32, 0.0], [3.0, 1.0], [3.0, 2.0], [3.0, 3.0]].view(),
		);
		let features = FeatureSource::Samples(&samples);
		// With max_features = 1 the search may draw the constant feature first, but it must keep going until it finds the informative one.
		for seed in 0..8 {
			let group = RowGroup {
				rows: vec![0, 1, 2, 3],
				y: vec![0, 0, 1, 1],
			};
			let mut rng = Xoshiro256Plus::seed_from_u64(seed);
			let split = compute_split(group, &features, 2, 2, 1, &mut rng);
			match split.info {
				NodeInfo::Inner(inner) => assert_eq!(inner.feature_index, 1),
				info => panic!("expected an inner node, found {:?}", info),
			}
		}
	}

	#[test]
	fn test_exhausting_all_features_produces_a_leaf() {
		let dir = tempfile::tempdir().unwrap();
		let samples = matrix_file(
			dir.path(),
			"samples.npy",
			array![[3.0f32, 5.0], [3.0, 5.0], [3.0, 5.0], [3.0, 5.0]].view(),
		);
		let features = FeatureSource::Samples(&samples);
		let group = RowGroup {
			rows: vec![0, 1, 2, 3],
			y: vec![1, 1, 0, 0],
		};
		let mut rng = Xoshiro256Plus::seed_from_u64(0);
		let split = compute_split(group, &features, 2, 2, 2, &mut rng);
		let leaf = match split.info {
			NodeInfo::Leaf(leaf) => leaf,
			info => panic!("expected a leaf, found {:?}", info),
		};
		assert_eq!(leaf.size, 4);
		assert_eq!(leaf.frequencies, [2, 2]);
		// Tied frequencies resolve to the lowest class code.
		assert_eq!(leaf.mode, 0);
		// The whole subset survives on the left so prediction can replay this node.
		assert_eq!(split.left.rows, [0, 1, 2, 3]);
		assert!(split.right.is_empty());
	}

	#[test]
	fn test_leaf_info_majority_and_tie_break() {
		let leaf = leaf_info(&[2, 2, 1, 2, 0], 3);
		assert_eq!(leaf.frequencies, [1, 1, 3]);
		assert_eq!(leaf.mode, 2);
		let tied = leaf_info(&[1, 2, 2, 1], 3);
		assert_eq!(tied.mode, 1);
	}

	#[test]
	fn test_feature_views_borrow_the_file_not_the_source_wrapper() {
		let dir = tempfile::tempdir().unwrap();
		let samples = matrix_file(
			dir.path(),
			"samples.npy",
			array![[0.0f32, 1.0], [2.0, 3.0], [4.0, 5.0]].view(),
		);
		let feature = {
			let source = FeatureSource::Samples(&samples);
			source.feature(1)
		};
		assert_eq!(feature, array![1.0f32, 3.0, 5.0]);
	}

	#[test]
	fn test_transposed_and_sample_sources_read_the_same_feature() {
		let dir = tempfile::tempdir().unwrap();
		let samples = matrix_file(
			dir.path(),
			"samples.npy",
			array![[0.0f32, 1.0], [2.0, 3.0], [4.0, 5.0]].view(),
		);
		let transposed = matrix_file(
			dir.path(),
			"features.npy",
			array![[0.0f32, 2.0, 4.0], [1.0, 3.0, 5.0]].view(),
		);
		for feature_index in 0..2 {
			assert_eq!(
				FeatureSource::Samples(&samples).feature(feature_index),
				FeatureSource::Transposed(&transposed).feature(feature_index),
			);
		}
	}
}
