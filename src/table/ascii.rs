//! ASCII catalogue reader
//!
//! Reads delimited text tables with a header line. Column types are inferred
//! from the values: integers, then floats, then booleans, then strings.

use std::io::BufRead;
use std::path::Path;

use super::{open_text, Column, ColumnData, DataType, Table};
use crate::{io_err, Result, SampleDbError};

/// Field separator of an ASCII table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    /// `|` separated, astropy `fixed_width` style
    Bar,
    /// `,` separated
    Comma,
    /// Any run of whitespace
    Whitespace,
}

/// Values that mark a missing cell
const NULL_MARKERS: [&str; 2] = ["", "--"];

/// Read an ASCII table file (optionally gzipped)
pub fn read(path: &Path, delimiter: Delimiter) -> Result<Table> {
    let reader = open_text(path)?;
    parse(reader, delimiter).map_err(|e| match e {
        SampleDbError::IoError(source) => io_err(path, source),
        SampleDbError::TableError(msg) => {
            SampleDbError::TableError(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

/// Parse an ASCII table from any buffered reader
pub fn parse<R: BufRead>(reader: R, delimiter: Delimiter) -> Result<Table> {
    let mut header: Option<Vec<String>> = None;
    let mut cells: Vec<Vec<String>> = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line_number = index + 1;
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') || is_ruler(trimmed) {
            continue;
        }

        let fields = split_fields(trimmed, delimiter);

        match &header {
            None => {
                cells = vec![Vec::new(); fields.len()];
                header = Some(fields);
            }
            Some(names) => {
                if fields.len() != names.len() {
                    return Err(SampleDbError::TableError(format!(
                        "line {} has {} fields, expected {}",
                        line_number,
                        fields.len(),
                        names.len()
                    )));
                }
                for (column, value) in cells.iter_mut().zip(fields) {
                    column.push(value);
                }
            }
        }
    }

    let names = header
        .ok_or_else(|| SampleDbError::TableError("no header line found".to_string()))?;

    let columns = names
        .into_iter()
        .zip(cells)
        .map(|(name, values)| infer_column(name, values))
        .collect();

    Table::new(columns)
}

/// Lines such as `|-----|----|` or `=====` that only separate sections
fn is_ruler(line: &str) -> bool {
    let mut tokens = line
        .split(|c: char| c == '|' || c == '+' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .peekable();
    tokens.peek().is_some()
        && tokens.all(|t| t.len() >= 3 && t.chars().all(|c| c == '-' || c == '='))
}

fn split_fields(line: &str, delimiter: Delimiter) -> Vec<String> {
    match delimiter {
        Delimiter::Bar => {
            let inner = line.strip_prefix('|').unwrap_or(line);
            let inner = inner.strip_suffix('|').unwrap_or(inner);
            inner.split('|').map(|f| f.trim().to_string()).collect()
        }
        Delimiter::Comma => split_csv(line),
        Delimiter::Whitespace => line.split_whitespace().map(str::to_string).collect(),
    }
}

/// Split a CSV line; commas inside `"..."` are kept and `""` is a literal quote
fn split_csv(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;

    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if !quoted && field.trim().is_empty() => {
                field.clear();
                quoted = true;
                in_quotes = true;
            }
            ',' if !in_quotes => {
                fields.push(finish_field(field, quoted));
                field = String::new();
                quoted = false;
            }
            // Whitespace between a closing quote and the next comma
            c if quoted && !in_quotes && c.is_whitespace() => {}
            c => field.push(c),
        }
    }
    fields.push(finish_field(field, quoted));
    fields
}

fn finish_field(field: String, quoted: bool) -> String {
    if quoted {
        field
    } else {
        field.trim().to_string()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn infer_dtype(values: &[String], mask: &[bool]) -> DataType {
    let present: Vec<&str> = values
        .iter()
        .zip(mask)
        .filter(|(_, masked)| !**masked)
        .map(|(v, _)| v.as_str())
        .collect();

    if present.is_empty() {
        DataType::Str
    } else if present.iter().all(|v| v.parse::<i64>().is_ok()) {
        DataType::Int64
    } else if present.iter().all(|v| v.parse::<f64>().is_ok()) {
        DataType::Float64
    } else if present.iter().all(|v| parse_bool(v).is_some()) {
        DataType::Bool
    } else {
        DataType::Str
    }
}

fn infer_column(name: String, values: Vec<String>) -> Column {
    let mask: Vec<bool> = values
        .iter()
        .map(|v| NULL_MARKERS.contains(&v.as_str()))
        .collect();

    let data = match infer_dtype(&values, &mask) {
        DataType::Int64 => ColumnData::Int64(
            values
                .iter()
                .map(|v| v.parse::<i64>().unwrap_or_default())
                .collect(),
        ),
        DataType::Float64 => ColumnData::Float64(
            values
                .iter()
                .map(|v| v.parse::<f64>().unwrap_or(f64::NAN))
                .collect(),
        ),
        DataType::Bool => ColumnData::Bool(
            values
                .iter()
                .map(|v| parse_bool(v).unwrap_or(false))
                .collect(),
        ),
        _ => ColumnData::Str(
            values
                .into_iter()
                .zip(&mask)
                .map(|(v, &masked)| if masked { String::new() } else { v })
                .collect(),
        ),
    };

    let column = Column::new(name, data);
    if mask.iter().any(|&m| m) {
        column.with_mask(mask)
    } else {
        column
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    #[test]
    fn test_fixed_width() {
        let text = "\
| name   | manga        | imageName  |
|--------|--------------|------------|
| Ryuk   | Death Note   | ryuk.png   |
| Totoro | Totoro       | totoro.png |
";
        let table = parse(Cursor::new(text), Delimiter::Bar).unwrap();
        assert_eq!(table.colnames(), vec!["name", "manga", "imageName"]);
        assert_eq!(table.len(), 2);
        let manga = table.column("manga").unwrap();
        assert_eq!(manga.cell_text(0).as_deref(), Some("Death Note"));
    }

    #[test]
    fn test_basic_type_inference() {
        let text = "\
# MaNGA targets
mangaid      nsaid   z        primary
1-24099      1234    0.0249   True
1-38157      5678    nan      False
12-193481    9012    0.1      true
";
        let table = parse(Cursor::new(text), Delimiter::Whitespace).unwrap();
        assert_eq!(table.column("mangaid").unwrap().dtype(), DataType::Str);
        assert_eq!(table.column("nsaid").unwrap().dtype(), DataType::Int64);
        assert_eq!(table.column("z").unwrap().dtype(), DataType::Float64);
        assert_eq!(table.column("primary").unwrap().dtype(), DataType::Bool);

        if let ColumnData::Float64(z) = &table.column("z").unwrap().data {
            assert_relative_eq!(z[0], 0.0249);
            assert!(z[1].is_nan());
        } else {
            panic!("Expected float column");
        }
    }

    #[test]
    fn test_csv_with_missing_values() {
        let text = "mangaid,plateifu,mass\n\"1-1\",\"7443-12701\",10.5\n\"1-2\",,\n";
        let table = parse(Cursor::new(text), Delimiter::Comma).unwrap();

        let plateifu = table.column("plateifu").unwrap();
        assert_eq!(plateifu.dtype(), DataType::Str);
        assert_eq!(plateifu.cell_text(0).as_deref(), Some("7443-12701"));
        assert_eq!(plateifu.cell_text(1), None);

        let mass = table.column("mass").unwrap();
        assert_eq!(mass.dtype(), DataType::Float64);
        assert!(mass.is_null(1));
    }

    #[test]
    fn test_csv_quoted_commas_and_quotes() {
        let text = "mangaid,comment\n\"1-1\",\"Smith, J.\"\n1-2 , \"say \"\"hi\"\"\" \n";
        let table = parse(Cursor::new(text), Delimiter::Comma).unwrap();
        assert_eq!(table.len(), 2);

        let comment = table.column("comment").unwrap();
        assert_eq!(comment.cell_text(0).as_deref(), Some("Smith, J."));
        assert_eq!(comment.cell_text(1).as_deref(), Some("say \"hi\""));
        assert_eq!(
            table.column("mangaid").unwrap().cell_text(1).as_deref(),
            Some("1-2")
        );
    }

    #[test]
    fn test_integer_column_with_gap_stays_integer() {
        let text = "id val\n1 10\n2 --\n3 30\n";
        let table = parse(Cursor::new(text), Delimiter::Whitespace).unwrap();
        let val = table.column("val").unwrap();
        assert_eq!(val.dtype(), DataType::Int64);
        assert!(val.is_null(1));
        assert_eq!(val.cell_text(2).as_deref(), Some("30"));
    }

    #[test]
    fn test_all_missing_column_is_string() {
        let text = "a,b\n1,\n2,\n";
        let table = parse(Cursor::new(text), Delimiter::Comma).unwrap();
        let b = table.column("b").unwrap();
        assert_eq!(b.dtype(), DataType::Str);
        assert!(b.is_null(0) && b.is_null(1));
    }

    #[test]
    fn test_wrong_field_count() {
        let text = "a b\n1 2\n3\n";
        let result = parse(Cursor::new(text), Delimiter::Whitespace);
        match result {
            Err(SampleDbError::TableError(msg)) => assert!(msg.contains("line 3")),
            other => panic!("Expected TableError, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_input() {
        let result = parse(Cursor::new("# only comments\n\n"), Delimiter::Whitespace);
        assert!(matches!(result, Err(SampleDbError::TableError(_))));
    }
}
