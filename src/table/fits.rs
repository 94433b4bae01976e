//! FITS binary table reader
//!
//! Reads a `BINTABLE` extension from a FITS file into a [`Table`]. The file is
//! memory mapped when it is uncompressed; gzipped files are inflated into
//! memory first. FITS stores every number big-endian.

use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use flate2::read::GzDecoder;
use lazy_static::lazy_static;
use memmap2::{Mmap, MmapOptions};
use regex::Regex;

use super::{Column, ColumnData, Table};
use crate::{io_err, Result, SampleDbError};

/// Size of a FITS block (bytes)
pub const BLOCK_SIZE: usize = 2880;
/// Size of a header card (bytes)
pub const CARD_SIZE: usize = 80;

lazy_static! {
    static ref TFORM_PATTERN: Regex = Regex::new(r"^\s*(\d*)([A-Z])").unwrap();
    static ref TDIM_PATTERN: Regex = Regex::new(r"^\(\s*(\d+(?:\s*,\s*\d+)*)\s*\)$").unwrap();
}

/// Raw bytes of a FITS file, either mapped or inflated
enum FitsBytes {
    Mapped(Mmap),
    Inflated(Vec<u8>),
}

impl Deref for FitsBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FitsBytes::Mapped(map) => &map[..],
            FitsBytes::Inflated(buffer) => &buffer[..],
        }
    }
}

fn load_bytes(path: &Path) -> Result<FitsBytes> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;

    if path.to_string_lossy().ends_with(".gz") {
        let mut buffer = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut buffer)
            .map_err(|e| io_err(path, e))?;
        return Ok(FitsBytes::Inflated(buffer));
    }

    // Empty files cannot be mapped on every platform
    let len = file.metadata().map_err(|e| io_err(path, e))?.len();
    if len == 0 {
        return Err(SampleDbError::FitsError(format!(
            "{} is empty",
            path.display()
        )));
    }

    // The map is read-only; the file is not expected to change while a table is decoded
    let map = unsafe { MmapOptions::new().map(&file) }.map_err(|e| io_err(path, e))?;
    Ok(FitsBytes::Mapped(map))
}

/// Header of a single HDU
#[derive(Debug, Clone, Default)]
pub struct Header {
    cards: Vec<(String, String)>,
}

impl Header {
    /// Parse a header starting at the beginning of `bytes`.
    ///
    /// Returns the header and its length in bytes, padded to whole blocks.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut cards = Vec::new();
        let mut position = 0;

        loop {
            if position + CARD_SIZE > bytes.len() {
                return Err(SampleDbError::FitsError(
                    "header ended without an END card".to_string(),
                ));
            }
            let card = &bytes[position..position + CARD_SIZE];
            position += CARD_SIZE;

            let keyword = String::from_utf8_lossy(&card[..8]).trim_end().to_string();
            if keyword == "END" {
                break;
            }
            if keyword.is_empty() || &card[8..10] != b"= " {
                continue;
            }
            cards.push((keyword, String::from_utf8_lossy(&card[10..]).into_owned()));
        }

        let padded = position.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        Ok((Self { cards }, padded))
    }

    /// Raw value field of a keyword (including any comment)
    fn raw(&self, keyword: &str) -> Option<&str> {
        self.cards
            .iter()
            .find(|(k, _)| k == keyword)
            .map(|(_, v)| v.as_str())
    }

    /// String value of a keyword, with quotes and trailing blanks removed
    pub fn get_str(&self, keyword: &str) -> Option<String> {
        let raw = self.raw(keyword)?.trim_start();
        let body = raw.strip_prefix('\'')?;

        let mut value = String::new();
        let mut chars = body.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    value.push('\'');
                    chars.next();
                } else {
                    break;
                }
            } else {
                value.push(c);
            }
        }
        Some(value.trim_end().to_string())
    }

    /// Numeric or logical value of a keyword as text, without the comment
    fn get_value(&self, keyword: &str) -> Option<&str> {
        let raw = self.raw(keyword)?;
        Some(raw.split('/').next().unwrap_or("").trim())
    }

    /// Integer value of a keyword
    pub fn get_int(&self, keyword: &str) -> Result<Option<i64>> {
        match self.get_value(keyword) {
            None => Ok(None),
            Some(value) => value.parse::<i64>().map(Some).map_err(|_| {
                SampleDbError::FitsError(format!("{} is not an integer: {}", keyword, value))
            }),
        }
    }

    /// Floating point value of a keyword (FITS allows a `D` exponent)
    pub fn get_float(&self, keyword: &str) -> Result<Option<f64>> {
        match self.get_value(keyword) {
            None => Ok(None),
            Some(value) => value
                .replace(['D', 'd'], "E")
                .parse::<f64>()
                .map(Some)
                .map_err(|_| {
                    SampleDbError::FitsError(format!("{} is not a number: {}", keyword, value))
                }),
        }
    }

    /// Integer value of a mandatory keyword
    pub fn require_int(&self, keyword: &str) -> Result<i64> {
        self.get_int(keyword)?
            .ok_or_else(|| SampleDbError::FitsError(format!("missing keyword {}", keyword)))
    }

    /// Size of the data unit following this header, without padding
    pub fn data_size(&self) -> Result<usize> {
        let naxis = self.require_int("NAXIS")?;
        if naxis == 0 {
            return Ok(0);
        }
        let bitpix = self.require_int("BITPIX")?;
        let mut elements: usize = 1;
        for axis in 1..=naxis {
            let length = self.require_size(&format!("NAXIS{}", axis))?;
            elements = elements
                .checked_mul(length)
                .ok_or_else(|| too_large("data unit"))?;
        }
        let pcount = self.get_size("PCOUNT")?.unwrap_or(0);
        let gcount = self.get_size("GCOUNT")?.unwrap_or(1);
        let width = usize::try_from(bitpix.unsigned_abs() / 8)
            .map_err(|_| SampleDbError::FitsError(format!("invalid BITPIX {}", bitpix)))?;
        elements
            .checked_add(pcount)
            .and_then(|n| n.checked_mul(gcount))
            .and_then(|n| n.checked_mul(width))
            .ok_or_else(|| too_large("data unit"))
    }

    /// Non-negative integer value of a keyword
    fn get_size(&self, keyword: &str) -> Result<Option<usize>> {
        match self.get_int(keyword)? {
            None => Ok(None),
            Some(value) => usize::try_from(value).map(Some).map_err(|_| {
                SampleDbError::FitsError(format!("{} cannot be negative: {}", keyword, value))
            }),
        }
    }

    /// Non-negative integer value of a mandatory keyword
    pub fn require_size(&self, keyword: &str) -> Result<usize> {
        self.get_size(keyword)?
            .ok_or_else(|| SampleDbError::FitsError(format!("missing keyword {}", keyword)))
    }
}

fn too_large(what: &str) -> SampleDbError {
    SampleDbError::FitsError(format!("{} size overflows", what))
}

/// Binary table field type (the letter of a TFORM)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCode {
    Logical,
    Byte,
    Short,
    Int,
    Long,
    Char,
    Float,
    Double,
}

impl FieldCode {
    fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'L' => Some(FieldCode::Logical),
            'B' => Some(FieldCode::Byte),
            'I' => Some(FieldCode::Short),
            'J' => Some(FieldCode::Int),
            'K' => Some(FieldCode::Long),
            'A' => Some(FieldCode::Char),
            'E' => Some(FieldCode::Float),
            'D' => Some(FieldCode::Double),
            _ => None,
        }
    }

    /// Width of one element in bytes
    pub fn width(&self) -> usize {
        match self {
            FieldCode::Logical | FieldCode::Byte | FieldCode::Char => 1,
            FieldCode::Short => 2,
            FieldCode::Int | FieldCode::Float => 4,
            FieldCode::Long | FieldCode::Double => 8,
        }
    }
}

/// Parsed TFORM value: repeat count and field code
pub fn parse_tform(column: &str, tform: &str) -> Result<(usize, FieldCode)> {
    let captures = TFORM_PATTERN.captures(tform).ok_or_else(|| {
        SampleDbError::FitsError(format!("invalid TFORM {} for column {}", tform, column))
    })?;

    let repeat = match &captures[1] {
        "" => 1,
        digits => digits.parse::<usize>().map_err(|_| {
            SampleDbError::FitsError(format!("invalid repeat count in TFORM {}", tform))
        })?,
    };

    let letter = captures[2].chars().next().unwrap_or(' ');
    let code = FieldCode::from_letter(letter).ok_or_else(|| SampleDbError::UnsupportedColumn {
        column: column.to_string(),
        reason: format!("FITS field type {} is not supported", letter),
    })?;

    Ok((repeat, code))
}

/// Parsed TDIM value in FITS order (fastest varying axis first)
pub fn parse_tdim(tdim: &str) -> Result<Vec<usize>> {
    let captures = TDIM_PATTERN
        .captures(tdim.trim())
        .ok_or_else(|| SampleDbError::FitsError(format!("invalid TDIM {}", tdim)))?;

    captures[1]
        .split(',')
        .map(|axis| {
            axis.trim()
                .parse::<usize>()
                .map_err(|_| SampleDbError::FitsError(format!("invalid TDIM {}", tdim)))
        })
        .collect()
}

/// Layout of a single binary table field
#[derive(Debug, Clone)]
struct Field {
    name: String,
    code: FieldCode,
    repeat: usize,
    offset: usize,
    /// Cell shape in row-major order
    shape: Vec<usize>,
    /// Width of one string element (`A` fields only)
    string_width: usize,
    tnull: Option<i64>,
    tscal: f64,
    tzero: f64,
    unit: Option<String>,
}

impl Field {
    fn elements_per_row(&self) -> usize {
        match self.code {
            FieldCode::Char => self.repeat / self.string_width.max(1),
            _ => self.repeat,
        }
    }

    fn is_scaled(&self) -> bool {
        self.tscal != 1.0 || self.tzero != 0.0
    }
}

fn read_fields(header: &Header, row_bytes: usize) -> Result<Vec<Field>> {
    let tfields = header.require_int("TFIELDS")?;
    let mut fields = Vec::new();
    let mut offset: usize = 0;

    for n in 1..=tfields {
        let name = header
            .get_str(&format!("TTYPE{}", n))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("col{}", n));
        let tform = header
            .get_str(&format!("TFORM{}", n))
            .ok_or_else(|| SampleDbError::FitsError(format!("missing TFORM{}", n)))?;
        let (repeat, code) = parse_tform(&name, &tform)?;
        let field_offset = offset;
        offset = repeat
            .checked_mul(code.width())
            .and_then(|width| offset.checked_add(width))
            .ok_or_else(|| too_large(&format!("row of column {}", name)))?;

        if repeat == 0 {
            log::warn!("Skipping zero-width column {}", name);
            continue;
        }

        let dims = match header.get_str(&format!("TDIM{}", n)) {
            Some(tdim) => Some(parse_tdim(&tdim)?),
            None => None,
        };

        let (shape, string_width) = match (code, dims) {
            (FieldCode::Char, Some(dims)) => {
                let width = dims[0];
                let shape: Vec<usize> = dims[1..].iter().rev().copied().collect();
                (shape, width)
            }
            (FieldCode::Char, None) => (Vec::new(), repeat),
            (_, Some(dims)) => (dims.iter().rev().copied().collect(), 0),
            (_, None) if repeat == 1 => (Vec::new(), 0),
            (_, None) => (vec![repeat], 0),
        };

        let expected = shape
            .iter()
            .try_fold(string_width.max(1), |n, &axis| n.checked_mul(axis));
        if expected != Some(repeat) {
            return Err(SampleDbError::FitsError(format!(
                "TDIM{} of column {} does not match its repeat count {}",
                n, name, repeat
            )));
        }

        fields.push(Field {
            name,
            code,
            repeat,
            offset: field_offset,
            shape,
            string_width,
            tnull: header.get_int(&format!("TNULL{}", n))?,
            tscal: header.get_float(&format!("TSCAL{}", n))?.unwrap_or(1.0),
            tzero: header.get_float(&format!("TZERO{}", n))?.unwrap_or(0.0),
            unit: header
                .get_str(&format!("TUNIT{}", n))
                .filter(|unit| !unit.is_empty()),
        });
    }

    if offset != row_bytes {
        return Err(SampleDbError::FitsError(format!(
            "columns span {} bytes but NAXIS1 is {}",
            offset, row_bytes
        )));
    }

    Ok(fields)
}

fn decode_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}

fn decode_integers(field: &Field, rows: &[&[u8]]) -> Vec<i64> {
    let width = field.code.width();
    let mut values = Vec::with_capacity(rows.len() * field.repeat);
    for row in rows {
        let cell = &row[field.offset..field.offset + field.repeat * width];
        for raw in cell.chunks_exact(width) {
            values.push(match field.code {
                FieldCode::Byte => raw[0] as i64,
                FieldCode::Short => BigEndian::read_i16(raw) as i64,
                FieldCode::Int => BigEndian::read_i32(raw) as i64,
                _ => BigEndian::read_i64(raw),
            });
        }
    }
    values
}

fn decode_field(field: &Field, rows: &[&[u8]]) -> Result<Column> {
    let mut mask: Option<Vec<bool>> = None;

    let data = match field.code {
        FieldCode::Logical => {
            let mut values = Vec::with_capacity(rows.len() * field.repeat);
            let mut nulls = Vec::with_capacity(rows.len() * field.repeat);
            for row in rows {
                for &byte in &row[field.offset..field.offset + field.repeat] {
                    values.push(byte == b'T');
                    nulls.push(byte == 0);
                }
            }
            if nulls.iter().any(|&n| n) {
                mask = Some(nulls);
            }
            ColumnData::Bool(values)
        }
        FieldCode::Char => {
            let mut values = Vec::with_capacity(rows.len() * field.elements_per_row());
            for row in rows {
                let cell = &row[field.offset..field.offset + field.repeat];
                for element in cell.chunks_exact(field.string_width.max(1)) {
                    values.push(decode_string(element));
                }
            }
            ColumnData::Str(values)
        }
        FieldCode::Float | FieldCode::Double => {
            let width = field.code.width();
            let mut values = Vec::with_capacity(rows.len() * field.repeat);
            for row in rows {
                let cell = &row[field.offset..field.offset + field.repeat * width];
                for raw in cell.chunks_exact(width) {
                    values.push(match field.code {
                        FieldCode::Float => BigEndian::read_f32(raw) as f64,
                        _ => BigEndian::read_f64(raw),
                    });
                }
            }
            if field.is_scaled() {
                ColumnData::Float64(
                    values
                        .into_iter()
                        .map(|v| field.tzero + field.tscal * v)
                        .collect(),
                )
            } else if field.code == FieldCode::Float {
                ColumnData::Float32(values.into_iter().map(|v| v as f32).collect())
            } else {
                ColumnData::Float64(values)
            }
        }
        FieldCode::Byte | FieldCode::Short | FieldCode::Int | FieldCode::Long => {
            let raw = decode_integers(field, rows);
            if let Some(tnull) = field.tnull {
                let nulls: Vec<bool> = raw.iter().map(|&v| v == tnull).collect();
                if nulls.iter().any(|&n| n) {
                    mask = Some(nulls);
                }
            }
            integer_data(field, raw)?
        }
    };

    let mut column = Column::new(field.name.clone(), data).with_shape(field.shape.clone());
    column.mask = mask;
    column.unit = field.unit.clone();
    Ok(column)
}

/// Convert raw integers to the narrowest type that holds the physical values
fn integer_data(field: &Field, raw: Vec<i64>) -> Result<ColumnData> {
    let unsigned_offset = match field.code {
        FieldCode::Byte => -128.0,
        FieldCode::Short => 32768.0,
        FieldCode::Int => 2147483648.0,
        _ => 9223372036854775808.0,
    };

    if field.tscal == 1.0 && field.tzero == unsigned_offset {
        let offset = unsigned_offset as i64;
        return match field.code {
            FieldCode::Byte => Ok(ColumnData::Int16(
                raw.into_iter().map(|v| (v + offset) as i16).collect(),
            )),
            FieldCode::Short => Ok(ColumnData::Int32(
                raw.into_iter().map(|v| (v + offset) as i32).collect(),
            )),
            FieldCode::Int => Ok(ColumnData::Int64(
                raw.into_iter().map(|v| v + offset).collect(),
            )),
            _ => Err(SampleDbError::UnsupportedColumn {
                column: field.name.clone(),
                reason: "unsigned 64-bit integers do not fit a PostgreSQL column".to_string(),
            }),
        };
    }

    if field.is_scaled() {
        return Ok(ColumnData::Float64(
            raw.into_iter()
                .map(|v| field.tzero + field.tscal * v as f64)
                .collect(),
        ));
    }

    Ok(match field.code {
        FieldCode::Byte => ColumnData::UInt8(raw.into_iter().map(|v| v as u8).collect()),
        FieldCode::Short => ColumnData::Int16(raw.into_iter().map(|v| v as i16).collect()),
        FieldCode::Int => ColumnData::Int32(raw.into_iter().map(|v| v as i32).collect()),
        _ => ColumnData::Int64(raw),
    })
}

/// Decode a BINTABLE data unit described by `header`
pub fn parse_bintable(header: &Header, data: &[u8]) -> Result<Table> {
    let row_bytes = header.require_size("NAXIS1")?;
    let nrows = header.require_size("NAXIS2")?;
    let table_bytes = row_bytes
        .checked_mul(nrows)
        .ok_or_else(|| too_large("table"))?;

    if data.len() < table_bytes {
        return Err(SampleDbError::FitsError(format!(
            "truncated table: expected {} bytes of data, found {}",
            table_bytes,
            data.len()
        )));
    }

    let fields = read_fields(header, row_bytes)?;
    let rows: Vec<&[u8]> = if row_bytes == 0 {
        Vec::new()
    } else {
        data[..table_bytes].chunks_exact(row_bytes).collect()
    };

    let columns = fields
        .iter()
        .map(|field| decode_field(field, &rows))
        .collect::<Result<Vec<_>>>()?;

    Table::new(columns)
}

/// Find and decode a binary table in raw FITS bytes.
///
/// `hdu` selects the HDU by index (0 is the primary HDU); by default the first
/// `BINTABLE` extension is used.
pub fn parse_bytes(bytes: &[u8], hdu: Option<usize>) -> Result<Table> {
    let mut offset = 0;
    let mut index = 0;

    while offset < bytes.len() {
        let (header, header_len) = Header::parse(&bytes[offset..])?;
        let data_start = offset + header_len;
        let data_len = header.data_size()?;

        if index == 0 && header.raw("SIMPLE").is_none() {
            return Err(SampleDbError::FitsError(
                "primary header does not start with SIMPLE".to_string(),
            ));
        }

        let is_bintable = header.get_str("XTENSION").as_deref() == Some("BINTABLE");
        let wanted = match hdu {
            Some(n) => n == index,
            None => is_bintable,
        };

        if wanted {
            if !is_bintable {
                return Err(SampleDbError::FitsError(format!(
                    "HDU {} is not a binary table",
                    index
                )));
            }
            let end = data_start.saturating_add(data_len).min(bytes.len());
            let data = bytes.get(data_start..end).unwrap_or(&[]);
            log::debug!("Reading BINTABLE from HDU {}", index);
            return parse_bintable(&header, data);
        }

        offset = data_len
            .div_ceil(BLOCK_SIZE)
            .checked_mul(BLOCK_SIZE)
            .and_then(|padded| data_start.checked_add(padded))
            .ok_or_else(|| too_large("data unit"))?;
        index += 1;
    }

    Err(SampleDbError::FitsError(match hdu {
        Some(n) => format!("HDU {} not found", n),
        None => "no BINTABLE extension found".to_string(),
    }))
}

/// Read a binary table from a FITS file (optionally gzipped)
pub fn read_bintable(path: &Path, hdu: Option<usize>) -> Result<Table> {
    let bytes = load_bytes(path)?;
    parse_bytes(&bytes, hdu).map_err(|e| match e {
        SampleDbError::FitsError(msg) => {
            SampleDbError::FitsError(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}
