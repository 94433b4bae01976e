//! PostgreSQL `COPY` text format
//!
//! Rows are sent to the database as tab separated lines. Nulls are written as
//! `\N`, arrays use the PostgreSQL array literal syntax, and backslashes, tabs
//! and line breaks inside a field are escaped.

use std::ops::Range;

use crate::table::{Column, ColumnData, Table};
use crate::{Result, SampleDbError};

/// Null marker of the text format
pub const NULL: &str = "\\N";

/// Escape a field for the text format
pub fn escape_field(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}

fn format_float(value: f64) -> String {
    if value == f64::INFINITY {
        "Infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        value.to_string()
    }
}

/// Text of a non-null element as PostgreSQL reads it
fn format_element(data: &ColumnData, element: usize) -> String {
    match data {
        ColumnData::Bool(v) => String::from(if v[element] { "t" } else { "f" }),
        ColumnData::Float32(v) if v[element].is_infinite() => format_float(v[element] as f64),
        ColumnData::Float64(v) => format_float(v[element]),
        other => other.element_to_string(element),
    }
}

fn write_array(column: &Column, start: usize, shape: &[usize], out: &mut String) {
    let stride: usize = shape[1..].iter().product();
    out.push('{');
    for i in 0..shape[0] {
        if i > 0 {
            out.push(',');
        }
        let element = start + i * stride;
        if shape.len() > 1 {
            write_array(column, element, &shape[1..], out);
        } else if column.is_null(element) {
            out.push_str("NULL");
        } else if let ColumnData::Str(values) = &column.data {
            out.push('"');
            out.push_str(&values[element].replace('\\', "\\\\").replace('"', "\\\""));
            out.push('"');
        } else {
            out.push_str(&format_element(&column.data, element));
        }
    }
    out.push('}');
}

/// Encode one cell of `column`, appending the escaped field to `out`
pub fn encode_cell(column: &Column, row: usize, out: &mut String) {
    if column.ndim() == 0 {
        if column.is_null(row) {
            out.push_str(NULL);
        } else {
            escape_field(&format_element(&column.data, row), out);
        }
        return;
    }

    let size = column.cell_size();
    let start = row * size;
    // An array of nothing but nulls is stored as a plain null
    if (start..start + size).all(|element| column.is_null(element)) {
        out.push_str(NULL);
        return;
    }

    let mut literal = String::new();
    write_array(column, start, &column.shape, &mut literal);
    escape_field(&literal, out);
}

/// Encode `rows` of `table`, each line starting with the `leading` constant fields
pub fn encode_rows(table: &Table, rows: Range<usize>, leading: &[String]) -> String {
    let mut out = String::new();
    for row in rows {
        let mut first = true;
        for value in leading {
            if !first {
                out.push('\t');
            }
            escape_field(value, &mut out);
            first = false;
        }
        for column in table.columns() {
            if !first {
                out.push('\t');
            }
            encode_cell(column, row, &mut out);
            first = false;
        }
        out.push('\n');
    }
    out
}

/// Encode rows given as already formatted values (`None` for null)
pub fn encode_values<'a, I>(rows: I) -> String
where
    I: IntoIterator<Item = &'a [Option<String>]>,
{
    let mut out = String::new();
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push('\t');
            }
            match value {
                Some(value) => escape_field(value, &mut out),
                None => out.push_str(NULL),
            }
        }
        out.push('\n');
    }
    out
}

fn unescape_field(field: &str) -> Result<String> {
    let mut value = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            value.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => value.push('\\'),
            Some('t') => value.push('\t'),
            Some('n') => value.push('\n'),
            Some('r') => value.push('\r'),
            Some('b') => value.push('\u{8}'),
            Some('f') => value.push('\u{c}'),
            Some('v') => value.push('\u{b}'),
            Some(other) => value.push(other),
            None => {
                return Err(SampleDbError::CopyFormat(format!(
                    "dangling backslash in field {:?}",
                    field
                )))
            }
        }
    }
    Ok(value)
}

/// Split one line of the text format into fields (`None` for null)
pub fn decode_line(line: &str) -> Result<Vec<Option<String>>> {
    line.split('\t')
        .map(|field| {
            if field == NULL {
                Ok(None)
            } else {
                unescape_field(field).map(Some)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_single(column: Column) -> Vec<String> {
        let table = Table::new(vec![column]).unwrap();
        encode_rows(&table, 0..table.len(), &[])
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_scalar_values() {
        let lines = encode_single(Column::new(
            "z",
            ColumnData::Float64(vec![0.5, f64::NAN, f64::INFINITY, f64::NEG_INFINITY]),
        ));
        assert_eq!(lines, vec!["0.5", "\\N", "Infinity", "-Infinity"]);

        let lines = encode_single(Column::new("flag", ColumnData::Bool(vec![true, false])));
        assert_eq!(lines, vec!["t", "f"]);

        let lines = encode_single(Column::new("f", ColumnData::Float32(vec![0.1])));
        assert_eq!(lines, vec!["0.1"]);
    }

    #[test]
    fn test_masked_integers() {
        let lines = encode_single(
            Column::new("nsaid", ColumnData::Int32(vec![7, -999])).with_mask(vec![false, true]),
        );
        assert_eq!(lines, vec!["7", "\\N"]);
    }

    #[test]
    fn test_string_escaping() {
        let lines = encode_single(Column::new(
            "comment",
            ColumnData::Str(vec!["tab\there".into(), "back\\slash".into()]),
        ));
        assert_eq!(lines, vec!["tab\\there", "back\\\\slash"]);
    }

    #[test]
    fn test_vector_cells() {
        let lines = encode_single(
            Column::new(
                "flux",
                ColumnData::Float32(vec![1.0, f32::NAN, 3.5, f32::NAN, f32::NAN, f32::NAN]),
            )
            .with_shape(vec![3]),
        );
        assert_eq!(lines, vec!["{1,NULL,3.5}", "\\N"]);
    }

    #[test]
    fn test_matrix_cells() {
        let lines = encode_single(
            Column::new("ivar", ColumnData::Int16(vec![1, 2, 3, 4, 5, 6])).with_shape(vec![2, 3]),
        );
        assert_eq!(lines, vec!["{{1,2,3},{4,5,6}}"]);
    }

    #[test]
    fn test_string_arrays_are_quoted() {
        let lines = encode_single(
            Column::new(
                "names",
                ColumnData::Str(vec!["a b".into(), "say \"hi\"".into()]),
            )
            .with_shape(vec![2]),
        );
        assert_eq!(lines, vec!["{\"a b\",\"say \\\\\"hi\\\\\"\"}"]);
    }

    #[test]
    fn test_leading_fields() {
        let table = Table::new(vec![
            Column::new("mangaid", ColumnData::Str(vec!["1-1".into(), "1-2".into()])),
            Column::new("z", ColumnData::Float64(vec![0.1, 0.2])),
        ])
        .unwrap();
        let payload = encode_rows(&table, 1..2, &["3".to_string()]);
        assert_eq!(payload, "3\t1-2\t0.2\n");
    }

    #[test]
    fn test_encode_values() {
        let rows = vec![
            vec![Some("1-1".to_string()), None],
            vec![Some("a\tb".to_string()), Some("2".to_string())],
        ];
        let payload = encode_values(rows.iter().map(Vec::as_slice));
        assert_eq!(payload, "1-1\t\\N\na\\tb\t2\n");
    }

    #[test]
    fn test_decode_line() {
        let fields = decode_line("1-2\t\\N\tback\\\\slash\ttab\\there").unwrap();
        assert_eq!(
            fields,
            vec![
                Some("1-2".to_string()),
                None,
                Some("back\\slash".to_string()),
                Some("tab\there".to_string()),
            ]
        );
        assert!(decode_line("broken\\").is_err());
    }
}
