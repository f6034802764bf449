/*!
This module implements `RfDataset`, the dataset format consumed by `DecisionTreeClassifier::fit`. A dataset is one sample file, one label file, and optionally one transposed feature file, and it derives its shape and label encoding lazily from the files the first time they are needed.
*/

use crate::{error::FormatError, storage};
use ndarray::prelude::*;
use once_cell::sync::OnceCell;
use std::{
	fs::File,
	io::{BufRead, BufReader, BufWriter, Write},
	path::{Path, PathBuf},
};

/// One row partition of a larger dataset, used to assemble an `RfDataset` with `RfDataset::from_partitions`.
#[derive(Debug, Clone)]
pub struct Partition {
	pub samples: Array2<f32>,
	pub labels: Vec<String>,
}

/// The sorted unique label values of a dataset together with the row-aligned codes that index them. The two are always computed in the same pass so codes and categories stay consistent.
#[derive(Debug)]
struct LabelEncoding {
	codes: Vec<usize>,
	categories: Vec<String>,
}

/// The dataset format used by `DecisionTreeClassifier::fit`.
///
/// `samples_path` points at a 2-d row-major `f32` `.npy` file with one row per sample. `labels_path` points at a text file with one label token per row, in the same row order. `features_path` optionally points at the transpose of the sample array, stored c order, which lets the split search scan each feature sequentially.
#[derive(Debug)]
pub struct RfDataset {
	samples_path: PathBuf,
	labels_path: PathBuf,
	features_path: Option<PathBuf>,
	shape: OnceCell<(usize, usize)>,
	labels: OnceCell<LabelEncoding>,
}

impl RfDataset {
	pub fn new(samples_path: impl Into<PathBuf>, labels_path: impl Into<PathBuf>) -> Self {
		Self {
			samples_path: samples_path.into(),
			labels_path: labels_path.into(),
			features_path: None,
			shape: OnceCell::new(),
			labels: OnceCell::new(),
		}
	}

	/// Like `new`, but with a transposed feature file.
	pub fn with_features(
		samples_path: impl Into<PathBuf>,
		labels_path: impl Into<PathBuf>,
		features_path: impl Into<PathBuf>,
	) -> Self {
		Self {
			features_path: Some(features_path.into()),
			..Self::new(samples_path, labels_path)
		}
	}

	pub fn samples_path(&self) -> &Path {
		&self.samples_path
	}

	pub fn labels_path(&self) -> &Path {
		&self.labels_path
	}

	pub fn features_path(&self) -> Option<&Path> {
		self.features_path.as_deref()
	}

	/// Read the sample file header on first call and cache its shape.
	fn resolve_shape(&self) -> Result<(usize, usize), FormatError> {
		self.shape
			.get_or_try_init(|| {
				let header = storage::read_header(&self.samples_path)?;
				if header.shape.len() != 2 {
					return Err(FormatError::NotTwoDimensional(header.shape.len()));
				}
				Ok((header.shape[0], header.shape[1]))
			})
			.copied()
	}

	/// The number of samples, read from the sample file header if not already cached.
	pub fn n_samples(&self) -> Result<usize, FormatError> {
		Ok(self.resolve_shape()?.0)
	}

	/// The number of features, read from the sample file header if not already cached.
	pub fn n_features(&self) -> Result<usize, FormatError> {
		Ok(self.resolve_shape()?.1)
	}

	/// Read the label file on first call, computing the categories and codes together.
	fn resolve_labels(&self) -> Result<&LabelEncoding, FormatError> {
		self.labels.get_or_try_init(|| {
			let file = File::open(&self.labels_path)?;
			let mut raw = Vec::new();
			for line in BufReader::new(file).lines() {
				let line = line?;
				if !line.is_empty() {
					raw.push(line);
				}
			}
			let mut categories = raw.clone();
			categories.sort();
			categories.dedup();
			let codes = raw
				.iter()
				.map(|label| categories.binary_search(label).unwrap())
				.collect();
			Ok(LabelEncoding { codes, categories })
		})
	}

	/// The row-aligned label codes. Each value is the position of that row's label in `classes()`.
	pub fn y_codes(&self) -> Result<&[usize], FormatError> {
		Ok(&self.resolve_labels()?.codes)
	}

	/// The sorted unique label values.
	pub fn classes(&self) -> Result<&[String], FormatError> {
		Ok(&self.resolve_labels()?.categories)
	}

	pub fn n_classes(&self) -> Result<usize, FormatError> {
		Ok(self.resolve_labels()?.categories.len())
	}

	/// Validate the transposed feature file against the sample file: it must be 2-d, have shape exactly `(n_features, n_samples)`, and be stored c order so each feature can be scanned sequentially. A dataset without a feature file validates trivially.
	pub fn validate_features_file(&self) -> Result<(), FormatError> {
		let features_path = match &self.features_path {
			Some(features_path) => features_path,
			None => return Ok(()),
		};
		let header = storage::read_header(features_path)?;
		if header.shape.len() != 2 {
			return Err(FormatError::NotTwoDimensional(header.shape.len()));
		}
		let expected = (self.n_features()?, self.n_samples()?);
		let found = (header.shape[0], header.shape[1]);
		if found != expected {
			return Err(FormatError::ShapeMismatch { expected, found });
		}
		if header.fortran_order {
			return Err(FormatError::FortranOrder);
		}
		Ok(())
	}

	/// Assemble one `RfDataset` from an ordered sequence of row partitions: allocate one sample file with the combined extent, copy each partition's rows into its offset range, and append each partition's labels in partition order. The shape cache is pre-resolved from the partition extents. An empty partition sequence is `FormatError::NoPartitions`.
	pub fn from_partitions(
		partitions: &[Partition],
		samples_path: impl Into<PathBuf>,
		labels_path: impl Into<PathBuf>,
	) -> Result<Self, FormatError> {
		let samples_path = samples_path.into();
		let labels_path = labels_path.into();
		let n_features = match partitions.first() {
			Some(partition) => partition.samples.ncols(),
			None => return Err(FormatError::NoPartitions),
		};
		let mut n_samples = 0;
		for partition in partitions {
			assert_eq!(
				partition.samples.ncols(),
				n_features,
				"partitions with different numbers of features",
			);
			assert_eq!(
				partition.samples.nrows(),
				partition.labels.len(),
				"partition samples and labels must have the same number of rows",
			);
			n_samples += partition.samples.nrows();
		}
		storage::allocate_matrix(&samples_path, n_samples, n_features)?;
		let mut labels_file = BufWriter::new(File::create(&labels_path)?);
		let mut row_offset = 0;
		for partition in partitions {
			storage::write_rows(&samples_path, row_offset, partition.samples.view())?;
			row_offset += partition.samples.nrows();
			for label in &partition.labels {
				writeln!(labels_file, "{}", label)?;
			}
		}
		labels_file.flush()?;
		let dataset = Self::new(samples_path, labels_path);
		dataset.shape.set((n_samples, n_features)).unwrap();
		Ok(dataset)
	}
}
