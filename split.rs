/*!
This module implements the split scorer: a pure function from one feature column and one row subset to the best impurity score and threshold for a binary split of that subset. Lower scores are better. The same scorer is shared by the distributed node splitter and the single-node learner, which weighs its deduplicated rows.
*/

use ndarray::prelude::*;

/// The score and threshold of the best split point found for one feature.
#[derive(Debug, Clone, Copy)]
pub struct SplitCandidate {
	/// The weighted gini impurity of the partition this threshold induces. Lower is better.
	pub score: f32,
	/// Rows with feature value `<= threshold` go left, all others go right.
	pub threshold: f32,
}

/// Score the binary split of a row subset by one feature column. Returns `None` when the subset has fewer than two distinct finite feature values, in which case no threshold can produce two non-empty sides.
pub fn score_split(
	rows: &[usize],
	y: &[usize],
	feature: ArrayView1<f32>,
	n_classes: usize,
) -> Option<SplitCandidate> {
	let mut points: Vec<(f32, usize, f32)> = rows
		.iter()
		.zip(y.iter())
		.map(|(&row, &class)| (feature[row], class, 1.0))
		.collect();
	best_split_point(&mut points, n_classes)
}

/// Find the threshold with the lowest weighted gini impurity over `(value, class, weight)` triples. Candidate thresholds are the midpoints between consecutive distinct values, so that `value <= threshold` reproduces the partition the score was computed for. Non-finite values cannot anchor a threshold and are dropped before scoring, so a malformed sample file yields a poor split or `None`, never a panic.
pub fn best_split_point(
	points: &mut Vec<(f32, usize, f32)>,
	n_classes: usize,
) -> Option<SplitCandidate> {
	points.retain(|point| point.0.is_finite());
	if points.len() < 2 {
		return None;
	}
	points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
	let total_weight: f32 = points.iter().map(|point| point.2).sum();
	let mut left_counts = vec![0.0f32; n_classes];
	let mut right_counts = vec![0.0f32; n_classes];
	for &(_, class, weight) in points.iter() {
		right_counts[class] += weight;
	}
	let mut left_weight = 0.0;
	let mut best: Option<SplitCandidate> = None;
	for i in 0..points.len() - 1 {
		let (value, class, weight) = points[i];
		left_counts[class] += weight;
		right_counts[class] -= weight;
		left_weight += weight;
		let next_value = points[i + 1].0;
		if next_value <= value {
			continue;
		}
		let right_weight = total_weight - left_weight;
		let score = (left_weight * gini(&left_counts, left_weight)
			+ right_weight * gini(&right_counts, right_weight))
			/ total_weight;
		let mut threshold = (value + next_value) / 2.0;
		// The midpoint of two adjacent floats can round up to the right-hand value, which would send that value left. Fall back to the left-hand value itself.
		if threshold >= next_value {
			threshold = value;
		}
		if best.map_or(true, |b| score < b.score) {
			best = Some(SplitCandidate { score, threshold });
		}
	}
	best
}

/// The gini impurity of a weighted class distribution.
fn gini(counts: &[f32], weight: f32) -> f32 {
	let sum_of_squares: f32 = counts
		.iter()
		.map(|count| {
			let p = count / weight;
			p * p
		})
		.sum();
	1.0 - sum_of_squares
}

#[cfg(test)]
mod test {
	use super::*;
	use ndarray::array;

	#[test]
	fn test_perfect_split_scores_zero() {
		let feature = array![0.0f32, 1.0, 2.0, 3.0];
		let rows = [0, 1, 2, 3];
		let y = [0, 0, 1, 1];
		let candidate = score_split(&rows, &y, feature.view(), 2).unwrap();
		assert_eq!(candidate.score, 0.0);
		assert_eq!(candidate.threshold, 1.5);
	}

	#[test]
	fn test_threshold_routes_the_training_rows_consistently() {
		let feature = array![5.0f32, 1.0, 4.0, 2.0];
		let rows = [0, 1, 2, 3];
		let y = [1, 0, 1, 0];
		let candidate = score_split(&rows, &y, feature.view(), 2).unwrap();
		let left: Vec<usize> = rows
			.iter()
			.copied()
			.filter(|&row| feature[row] <= candidate.threshold)
			.collect();
		assert_eq!(left, [1, 3]);
	}

	#[test]
	fn test_constant_feature_has_no_split() {
		let feature = array![2.0f32, 2.0, 2.0];
		assert!(score_split(&[0, 1, 2], &[0, 1, 0], feature.view(), 2).is_none());
	}

	#[test]
	fn test_non_finite_values_are_dropped_from_the_scan() {
		let feature = array![f32::NAN, 1.0, 2.0, f32::INFINITY];
		let rows = [0, 1, 2, 3];
		let y = [0, 0, 1, 1];
		let candidate = score_split(&rows, &y, feature.view(), 2).unwrap();
		assert_eq!(candidate.threshold, 1.5);
	}

	#[test]
	fn test_all_non_finite_feature_has_no_split() {
		let feature = array![f32::NAN, f32::NEG_INFINITY, f32::NAN];
		assert!(score_split(&[0, 1, 2], &[0, 1, 0], feature.view(), 2).is_none());
	}

	#[test]
	fn test_single_row_has_no_split() {
		let feature = array![1.0f32, 2.0];
		assert!(score_split(&[0], &[0], feature.view(), 2).is_none());
	}

	#[test]
	fn test_purer_partitions_score_lower() {
		let feature = array![0.0f32, 1.0, 2.0, 3.0];
		// One boundary separates the classes perfectly, the others do not.
		let rows = [0, 1, 2, 3];
		let pure = score_split(&rows, &[0, 0, 1, 1], feature.view(), 2).unwrap();
		let impure = score_split(&rows, &[0, 1, 0, 1], feature.view(), 2).unwrap();
		assert!(pure.score < impure.score);
	}

	#[test]
	fn test_weights_shift_the_best_threshold() {
		// Unweighted, the classes are balanced around 1.5. Upweighting the
		// last row makes boundaries that isolate it cheaper than ones that
		// mix it into a large impure side.
		let mut balanced = vec![(0.0f32, 0, 1.0f32), (1.0, 0, 1.0), (2.0, 1, 1.0), (3.0, 1, 1.0)];
		let mut skewed = vec![(0.0f32, 0, 1.0f32), (1.0, 1, 1.0), (2.0, 1, 1.0), (3.0, 0, 4.0)];
		let balanced = best_split_point(&mut balanced, 2).unwrap();
		let skewed = best_split_point(&mut skewed, 2).unwrap();
		assert_eq!(balanced.threshold, 1.5);
		assert_eq!(skewed.threshold, 2.5);
	}
}
