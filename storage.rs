/*!
This module reads and writes the `.npy` array files that back a dataset. Sample and feature files are 2-d little-endian `f32` arrays in c order. Readers only ever map the files read-only, so any number of split and subtree tasks can scan the same file concurrently.
*/

use crate::error::FormatError;
use memmap2::Mmap;
use ndarray::prelude::*;
use std::{
	fs::{File, OpenOptions},
	io::{Read, Seek, SeekFrom, Write},
	path::Path,
};

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// The fields of an `.npy` file header.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyHeader {
	pub shape: Vec<usize>,
	pub fortran_order: bool,
	pub descr: String,
}

/// Read the header of the `.npy` file at `path`.
pub fn read_header(path: &Path) -> Result<NpyHeader, FormatError> {
	let mut file = File::open(path)?;
	let (header, _) = read_header_from(&mut file)?;
	Ok(header)
}

/// Read the header from an open file, returning it along with the byte offset at which the array data begins.
fn read_header_from(file: &mut File) -> Result<(NpyHeader, usize), FormatError> {
	let mut magic = [0u8; 8];
	file.read_exact(&mut magic)
		.map_err(|_| FormatError::InvalidHeader("file too short for the magic string".to_owned()))?;
	if &magic[0..6] != NPY_MAGIC {
		return Err(FormatError::InvalidHeader(
			"missing the \\x93NUMPY magic string".to_owned(),
		));
	}
	let version = magic[6];
	let (header_len, prefix_len) = match version {
		1 => {
			let mut bytes = [0u8; 2];
			file.read_exact(&mut bytes)?;
			(u16::from_le_bytes(bytes) as usize, 10)
		}
		2 => {
			let mut bytes = [0u8; 4];
			file.read_exact(&mut bytes)?;
			(u32::from_le_bytes(bytes) as usize, 12)
		}
		_ => {
			return Err(FormatError::InvalidHeader(format!(
				"unsupported version {}.{}",
				magic[6], magic[7]
			)))
		}
	};
	let mut dict = vec![0u8; header_len];
	file.read_exact(&mut dict)?;
	let dict = std::str::from_utf8(&dict)
		.map_err(|_| FormatError::InvalidHeader("header is not valid utf-8".to_owned()))?;
	let header = parse_header_dict(dict)?;
	Ok((header, prefix_len + header_len))
}

/// Parse the python dictionary literal that makes up an `.npy` header, e.g. `{'descr': '<f4', 'fortran_order': False, 'shape': (150, 4), }`.
fn parse_header_dict(dict: &str) -> Result<NpyHeader, FormatError> {
	let descr = parse_str_entry(dict, "'descr'")?;
	let fortran_order = match parse_entry(dict, "'fortran_order'")? {
		value if value.starts_with("True") => true,
		value if value.starts_with("False") => false,
		value => {
			return Err(FormatError::InvalidHeader(format!(
				"invalid fortran_order value {:?}",
				value
			)))
		}
	};
	let shape_entry = parse_entry(dict, "'shape'")?;
	if !shape_entry.starts_with('(') {
		return Err(FormatError::InvalidHeader(
			"shape is not a tuple".to_owned(),
		));
	}
	let close = shape_entry
		.find(')')
		.ok_or_else(|| FormatError::InvalidHeader("unterminated shape tuple".to_owned()))?;
	let mut shape = Vec::new();
	for dim in shape_entry[1..close].split(',') {
		let dim = dim.trim();
		if dim.is_empty() {
			continue;
		}
		let dim = dim
			.parse::<usize>()
			.map_err(|_| FormatError::InvalidHeader(format!("invalid dimension {:?}", dim)))?;
		shape.push(dim);
	}
	Ok(NpyHeader {
		shape,
		fortran_order,
		descr,
	})
}

/// Return the text following `key:` in the header dictionary, trimmed of leading whitespace.
fn parse_entry<'a>(dict: &'a str, key: &str) -> Result<&'a str, FormatError> {
	let start = dict
		.find(key)
		.ok_or_else(|| FormatError::InvalidHeader(format!("missing key {}", key)))?;
	let rest = &dict[start + key.len()..];
	let rest = rest.trim_start();
	let rest = rest
		.strip_prefix(':')
		.ok_or_else(|| FormatError::InvalidHeader(format!("missing value for key {}", key)))?;
	Ok(rest.trim_start())
}

/// Parse a quoted string value, like the `'<f4'` in `'descr': '<f4'`.
fn parse_str_entry(dict: &str, key: &str) -> Result<String, FormatError> {
	let value = parse_entry(dict, key)?;
	let quote = value
		.chars()
		.next()
		.filter(|c| *c == '\'' || *c == '"')
		.ok_or_else(|| FormatError::InvalidHeader(format!("value for {} is not a string", key)))?;
	let rest = &value[1..];
	let end = rest
		.find(quote)
		.ok_or_else(|| FormatError::InvalidHeader(format!("unterminated string for {}", key)))?;
	Ok(rest[..end].to_owned())
}

/// A 2-d `f32` `.npy` file opened for reading through a memory map.
#[derive(Debug)]
pub struct MatrixFile {
	mmap: Mmap,
	nrows: usize,
	ncols: usize,
	data_offset: usize,
}

impl MatrixFile {
	/// Open and validate the file at `path`. The array must be 2-d, little-endian `f32`, and c order.
	pub fn open(path: &Path) -> Result<Self, FormatError> {
		let mut file = File::open(path)?;
		let (header, data_offset) = read_header_from(&mut file)?;
		if header.shape.len() != 2 {
			return Err(FormatError::NotTwoDimensional(header.shape.len()));
		}
		if header.descr != "<f4" {
			return Err(FormatError::UnsupportedDtype(header.descr));
		}
		if header.fortran_order {
			return Err(FormatError::FortranOrder);
		}
		let mmap = unsafe { Mmap::map(&file)? };
		let expected_len = data_offset + 4 * header.shape[0] * header.shape[1];
		if mmap.len() < expected_len {
			return Err(FormatError::InvalidHeader(format!(
				"file is {} bytes but the header implies {}",
				mmap.len(),
				expected_len
			)));
		}
		Ok(Self {
			mmap,
			nrows: header.shape[0],
			ncols: header.shape[1],
			data_offset,
		})
	}

	pub fn nrows(&self) -> usize {
		self.nrows
	}

	pub fn ncols(&self) -> usize {
		self.ncols
	}

	/// A view of the whole array. The `.npy` format aligns the data section, so the cast from bytes is always aligned.
	pub fn view(&self) -> ArrayView2<f32> {
		let bytes = &self.mmap[self.data_offset..self.data_offset + 4 * self.nrows * self.ncols];
		debug_assert_eq!(bytes.as_ptr().align_offset(std::mem::align_of::<f32>()), 0);
		let data =
			unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, self.nrows * self.ncols) };
		ArrayView2::from_shape((self.nrows, self.ncols), data).unwrap()
	}
}

/// Write the header for a 2-d c-order `f32` array and return the data offset. The header is padded so the data section starts at a multiple of 64 bytes.
fn write_header<W>(writer: &mut W, nrows: usize, ncols: usize) -> Result<usize, FormatError>
where
	W: Write,
{
	let mut dict = format!(
		"{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}), }}",
		nrows, ncols
	);
	let unpadded_len = NPY_MAGIC.len() + 4 + dict.len() + 1;
	let padding = (64 - unpadded_len % 64) % 64;
	for _ in 0..padding {
		dict.push(' ');
	}
	dict.push('\n');
	writer.write_all(NPY_MAGIC)?;
	writer.write_all(&[1u8, 0u8])?;
	writer.write_all(&(dict.len() as u16).to_le_bytes())?;
	writer.write_all(dict.as_bytes())?;
	Ok(NPY_MAGIC.len() + 4 + dict.len())
}

/// Create the file at `path` as a zeroed (nrows, ncols) `f32` array, to be filled in by `write_rows`.
pub fn allocate_matrix(path: &Path, nrows: usize, ncols: usize) -> Result<(), FormatError> {
	let mut file = File::create(path)?;
	let data_offset = write_header(&mut file, nrows, ncols)?;
	file.set_len((data_offset + 4 * nrows * ncols) as u64)?;
	Ok(())
}

/// Write `rows` into the previously allocated matrix file at `path`, starting at row `row_offset`.
pub fn write_rows(path: &Path, row_offset: usize, rows: ArrayView2<f32>) -> Result<(), FormatError> {
	let mut file = OpenOptions::new().read(true).write(true).open(path)?;
	let (header, data_offset) = read_header_from(&mut file)?;
	if header.shape.len() != 2 {
		return Err(FormatError::NotTwoDimensional(header.shape.len()));
	}
	if header.shape[1] != rows.ncols() || row_offset + rows.nrows() > header.shape[0] {
		return Err(FormatError::ShapeMismatch {
			expected: (header.shape[0], header.shape[1]),
			found: (row_offset + rows.nrows(), rows.ncols()),
		});
	}
	file.seek(SeekFrom::Start(
		(data_offset + 4 * row_offset * header.shape[1]) as u64,
	))?;
	let mut bytes = Vec::with_capacity(4 * rows.nrows() * rows.ncols());
	for row in rows.genrows() {
		for value in row {
			bytes.extend_from_slice(&value.to_le_bytes());
		}
	}
	file.write_all(&bytes)?;
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use ndarray::array;

	#[test]
	fn test_allocate_write_read_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("samples.npy");
		allocate_matrix(&path, 3, 2).unwrap();
		write_rows(&path, 0, array![[1.0f32, 2.0], [3.0, 4.0]].view()).unwrap();
		write_rows(&path, 2, array![[5.0f32, 6.0]].view()).unwrap();
		let matrix = MatrixFile::open(&path).unwrap();
		assert_eq!(matrix.nrows(), 3);
		assert_eq!(matrix.ncols(), 2);
		assert_eq!(matrix.view(), array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
	}

	#[test]
	fn test_header_is_readable_by_the_parser() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("samples.npy");
		allocate_matrix(&path, 7, 5).unwrap();
		let header = read_header(&path).unwrap();
		assert_eq!(header.shape, vec![7, 5]);
		assert_eq!(header.descr, "<f4");
		assert!(!header.fortran_order);
	}

	#[test]
	fn test_bad_magic_is_an_invalid_header() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("samples.npy");
		std::fs::write(&path, b"not an npy file").unwrap();
		match MatrixFile::open(&path) {
			Err(FormatError::InvalidHeader(_)) => {}
			result => panic!("expected an invalid header error, found {:?}", result),
		}
	}

	#[test]
	fn test_one_dimensional_array_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("labels.npy");
		let mut bytes = Vec::new();
		let dict = "{'descr': '<f4', 'fortran_order': False, 'shape': (4,), }          \n";
		bytes.extend_from_slice(NPY_MAGIC);
		bytes.extend_from_slice(&[1u8, 0u8]);
		bytes.extend_from_slice(&(dict.len() as u16).to_le_bytes());
		bytes.extend_from_slice(dict.as_bytes());
		bytes.extend_from_slice(&[0u8; 16]);
		std::fs::write(&path, &bytes).unwrap();
		match MatrixFile::open(&path) {
			Err(FormatError::NotTwoDimensional(1)) => {}
			result => panic!("expected a dimensionality error, found {:?}", result),
		}
	}

	#[test]
	fn test_fortran_order_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("features.npy");
		let mut bytes = Vec::new();
		let dict = "{'descr': '<f4', 'fortran_order': True, 'shape': (2, 2), }         \n";
		bytes.extend_from_slice(NPY_MAGIC);
		bytes.extend_from_slice(&[1u8, 0u8]);
		bytes.extend_from_slice(&(dict.len() as u16).to_le_bytes());
		bytes.extend_from_slice(dict.as_bytes());
		bytes.extend_from_slice(&[0u8; 16]);
		std::fs::write(&path, &bytes).unwrap();
		match MatrixFile::open(&path) {
			Err(FormatError::FortranOrder) => {}
			result => panic!("expected a fortran order error, found {:?}", result),
		}
	}
}
