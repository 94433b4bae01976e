//! Tabular catalogue data
//!
//! This module holds the in-memory representation of a catalogue file: a set
//! of equally long, typed columns whose cells can be scalars or small arrays.
//! Readers for FITS binary tables and ASCII tables live in the submodules.

use flate2::read::GzDecoder;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::{io_err, Result, SampleDbError};

pub mod ascii;
pub mod fits;

/// Element type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    UInt8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Str,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::UInt8 => "uint8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Str => "str",
        };
        f.write_str(name)
    }
}

/// Flat storage for the elements of a column
///
/// Array cells are stored contiguously in row-major order, so row `i` of a
/// column with cell size `n` occupies elements `i * n .. (i + 1) * n`.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Bool(Vec<bool>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Str(Vec<String>),
}

impl ColumnData {
    /// Element type of the stored values
    pub fn dtype(&self) -> DataType {
        match self {
            ColumnData::Bool(_) => DataType::Bool,
            ColumnData::UInt8(_) => DataType::UInt8,
            ColumnData::Int16(_) => DataType::Int16,
            ColumnData::Int32(_) => DataType::Int32,
            ColumnData::Int64(_) => DataType::Int64,
            ColumnData::Float32(_) => DataType::Float32,
            ColumnData::Float64(_) => DataType::Float64,
            ColumnData::Str(_) => DataType::Str,
        }
    }

    /// Total number of elements (not rows)
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::UInt8(v) => v.len(),
            ColumnData::Int16(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float32(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Str(v) => v.len(),
        }
    }

    /// Check if there are no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for NaN floating point elements
    pub fn is_nan(&self, element: usize) -> bool {
        match self {
            ColumnData::Float32(v) => v[element].is_nan(),
            ColumnData::Float64(v) => v[element].is_nan(),
            _ => false,
        }
    }

    /// Plain text rendering of one element
    pub fn element_to_string(&self, element: usize) -> String {
        match self {
            ColumnData::Bool(v) => v[element].to_string(),
            ColumnData::UInt8(v) => v[element].to_string(),
            ColumnData::Int16(v) => v[element].to_string(),
            ColumnData::Int32(v) => v[element].to_string(),
            ColumnData::Int64(v) => v[element].to_string(),
            ColumnData::Float32(v) => v[element].to_string(),
            ColumnData::Float64(v) => v[element].to_string(),
            ColumnData::Str(v) => v[element].clone(),
        }
    }
}

/// A named column of a table
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name as found in the file
    pub name: String,
    /// Element values
    pub data: ColumnData,
    /// Shape of a single cell; empty for scalar columns
    pub shape: Vec<usize>,
    /// Element-level null mask (`true` marks a null element)
    pub mask: Option<Vec<bool>>,
    /// Physical unit, if the file declares one
    pub unit: Option<String>,
}

impl Column {
    /// Create a scalar column
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
            shape: Vec::new(),
            mask: None,
            unit: None,
        }
    }

    /// Set the per-cell shape
    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = shape;
        self
    }

    /// Attach an element-level null mask
    pub fn with_mask(mut self, mask: Vec<bool>) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Attach a physical unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Element type of the column
    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    /// Number of cell dimensions (0 for scalars)
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements in a single cell
    pub fn cell_size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        match self.cell_size() {
            0 => 0,
            size => self.data.len() / size,
        }
    }

    /// Check if the column has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the element is masked or a floating point NaN
    pub fn is_null(&self, element: usize) -> bool {
        self.mask.as_ref().is_some_and(|mask| mask[element]) || self.data.is_nan(element)
    }

    /// Text value of a scalar cell, `None` when null or when the column is an array
    pub fn cell_text(&self, row: usize) -> Option<String> {
        if self.ndim() != 0 || row >= self.len() || self.is_null(row) {
            return None;
        }
        Some(self.data.element_to_string(row))
    }

    fn validate(&self) -> Result<()> {
        let size = self.cell_size();
        if size == 0 {
            return Err(SampleDbError::TableError(format!(
                "column {} has an empty cell shape {:?}",
                self.name, self.shape
            )));
        }
        if self.data.len() % size != 0 {
            return Err(SampleDbError::TableError(format!(
                "column {} holds {} elements, not a multiple of its cell size {}",
                self.name,
                self.data.len(),
                size
            )));
        }
        if let Some(mask) = &self.mask {
            if mask.len() != self.data.len() {
                return Err(SampleDbError::TableError(format!(
                    "column {} has a mask of length {} for {} elements",
                    self.name,
                    mask.len(),
                    self.data.len()
                )));
            }
        }
        Ok(())
    }
}

/// Supported catalogue file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// FITS binary table; `hdu` selects the extension (default: first BINTABLE)
    Fits { hdu: Option<usize> },
    /// `|` delimited fixed width ASCII table
    FixedWidth,
    /// Comma separated values with a header line
    Csv,
    /// Whitespace separated values with a header line
    Basic,
}

impl TableFormat {
    /// Guess the format of a file from its name and, for ASCII files, its first line
    pub fn guess<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let name = name.strip_suffix(".gz").unwrap_or(&name);

        if [".fits", ".fit", ".fts"].iter().any(|ext| name.ends_with(ext)) {
            return Ok(TableFormat::Fits { hdu: None });
        }
        if name.ends_with(".csv") {
            return Ok(TableFormat::Csv);
        }

        let reader = open_text(path)?;
        for line in reader.lines() {
            let line = line.map_err(|e| io_err(path, e))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || (trimmed.starts_with('#') && !trimmed.starts_with("#|")) {
                continue;
            }
            if trimmed.starts_with('|') {
                return Ok(TableFormat::FixedWidth);
            }
            return Ok(TableFormat::Basic);
        }

        Err(SampleDbError::TableError(format!(
            "cannot determine the format of {}: no data lines",
            path.display()
        )))
    }
}

/// A catalogue loaded in memory
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    /// Build a table, checking that the columns are consistent
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if columns.is_empty() {
            return Err(SampleDbError::TableError(
                "a table needs at least one column".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for column in &columns {
            column.validate()?;
            if !seen.insert(column.name.to_lowercase()) {
                return Err(SampleDbError::TableError(format!(
                    "duplicate column name {}",
                    column.name
                )));
            }
        }

        let nrows = columns[0].len();
        if let Some(bad) = columns.iter().find(|c| c.len() != nrows) {
            return Err(SampleDbError::TableError(format!(
                "column {} has {} rows, expected {}",
                bad.name,
                bad.len(),
                nrows
            )));
        }

        Ok(Self { columns })
    }

    /// Read a table from a file, guessing the format if none is given
    pub fn read<P: AsRef<Path>>(path: P, format: Option<TableFormat>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(io_err(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "file could not be found"),
            ));
        }

        let format = match format {
            Some(format) => format,
            None => TableFormat::guess(path)?,
        };
        log::debug!("Reading {} as {:?}", path.display(), format);

        match format {
            TableFormat::Fits { hdu } => fits::read_bintable(path, hdu),
            TableFormat::FixedWidth => ascii::read(path, ascii::Delimiter::Bar),
            TableFormat::Csv => ascii::read(path, ascii::Delimiter::Comma),
            TableFormat::Basic => ascii::read(path, ascii::Delimiter::Whitespace),
        }
    }

    /// All columns in file order
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column names in file order
    pub fn colnames(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Look up a column by name, ignoring case
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Number of columns
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.columns[0].len()
    }

    /// Check if the table has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Open a text file, transparently inflating `.gz` files
pub(crate) fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let is_gzipped = path.to_string_lossy().ends_with(".gz");
    Ok(if is_gzipped {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}
