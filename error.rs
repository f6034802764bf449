use thiserror::Error;

/// A malformed or unsupported storage header. These errors are raised eagerly when a header is read or validated, never deferred to the middle of a fit.
#[derive(Debug, Error)]
pub enum FormatError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("invalid npy header: {0}")]
	InvalidHeader(String),
	#[error("cannot read a 2d array, found {0} dimensions")]
	NotTwoDimensional(usize),
	#[error("unsupported dtype {0:?}, expected \"<f4\"")]
	UnsupportedDtype(String),
	#[error("fortran order is not supported, the array must be c order")]
	FortranOrder,
	#[error("cannot assemble a dataset from zero partitions")]
	NoPartitions,
	#[error("invalid dimensions, expected ({}, {}) but found ({}, {})", expected.0, expected.1, found.0, found.1)]
	ShapeMismatch {
		expected: (usize, usize),
		found: (usize, usize),
	},
}

/// Returned by `predict` and `predict_proba` when the tree has not been fitted.
#[derive(Debug, Error)]
#[error("this decision tree has not been fitted")]
pub struct NotFittedError;
