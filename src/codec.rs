//! Array codec for learned-model payloads.
//!
//! Two encodings live here:
//!
//! - A binary form used for local persistence of training matrices and
//!   history vectors. The round-trip is bit-for-bit: every double is
//!   copied via its raw bit pattern and never reformatted.
//! - A text form used only when a replica forwards a staged mutation to
//!   the primary. Doubles are printed in scientific notation with nine
//!   significant digits, which is lossy and accepted as the cost of the
//!   replica path.
//!
//! Binary layout is little-endian: a vector is a `u32` element count
//! followed by the elements, a matrix is `u32` row and column counts
//! followed by row-major elements.

use crate::error::{KindlingError, Result};

/// Encode a vector of doubles into its stored binary form.
pub fn encode_vector(values: &[f64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + values.len() * 8);
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }
    buf
}

/// Decode a stored vector back into doubles.
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() < 4 {
        return Err(KindlingError::encoding("vector buffer shorter than header"));
    }
    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let payload = &bytes[4..];
    if payload.len() != count * 8 {
        return Err(KindlingError::encoding(format!(
            "vector payload is {} bytes, expected {} for {} elements",
            payload.len(),
            count * 8,
            count
        )));
    }
    let mut values = Vec::with_capacity(count);
    for chunk in payload.chunks_exact(8) {
        let mut bits = [0u8; 8];
        bits.copy_from_slice(chunk);
        values.push(f64::from_bits(u64::from_le_bytes(bits)));
    }
    Ok(values)
}

/// Encode a row-major matrix of doubles into its stored binary form.
///
/// All rows must have the same length; a ragged matrix is an encoding
/// error.
pub fn encode_matrix(rows: &[Vec<f64>]) -> Result<Vec<u8>> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, |r| r.len());
    for (i, row) in rows.iter().enumerate() {
        if row.len() != ncols {
            return Err(KindlingError::encoding(format!(
                "ragged matrix: row {} has {} columns, expected {}",
                i,
                row.len(),
                ncols
            )));
        }
    }

    let mut buf = Vec::with_capacity(8 + nrows * ncols * 8);
    buf.extend_from_slice(&(nrows as u32).to_le_bytes());
    buf.extend_from_slice(&(ncols as u32).to_le_bytes());
    for row in rows {
        for v in row {
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
    }
    Ok(buf)
}

/// Decode a stored matrix, also reporting the row and column counts found.
pub fn decode_matrix(bytes: &[u8]) -> Result<(Vec<Vec<f64>>, usize, usize)> {
    if bytes.len() < 8 {
        return Err(KindlingError::encoding("matrix buffer shorter than header"));
    }
    let nrows = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let ncols = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let payload = &bytes[8..];
    if payload.len() != nrows * ncols * 8 {
        return Err(KindlingError::encoding(format!(
            "matrix payload is {} bytes, expected {} for {}x{}",
            payload.len(),
            nrows * ncols * 8,
            nrows,
            ncols
        )));
    }

    let mut values = payload.chunks_exact(8).map(|chunk| {
        let mut bits = [0u8; 8];
        bits.copy_from_slice(chunk);
        f64::from_bits(u64::from_le_bytes(bits))
    });
    let mut rows = Vec::with_capacity(nrows);
    for _ in 0..nrows {
        rows.push(values.by_ref().take(ncols).collect());
    }
    Ok((rows, nrows, ncols))
}

// ---------------------------------------------------------------------------
// Text encoding for remote forwarding
// ---------------------------------------------------------------------------

/// A value of one field of a pending row, as staged by the foreground path.
///
/// This is the closed set of field types the queue tables use. The local
/// write path binds these to storage directly; the remote path encodes
/// them as text.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// Integer field (query hashes, column counts, execution counters).
    Int(i64),
    /// Boolean flag field.
    Bool(bool),
    /// Explicit null.
    Null,
    /// Opaque text (query text), copied verbatim.
    Text(String),
    /// 1-D array of doubles.
    Vector(Vec<f64>),
    /// 2-D row-major array of doubles.
    Matrix(Vec<Vec<f64>>),
}

impl WireValue {
    /// Convert into the value bound to local storage.
    ///
    /// Array fields go through the binary codec; everything else maps
    /// directly.
    pub fn to_storage(&self) -> Result<rusqlite::types::Value> {
        use rusqlite::types::Value;
        Ok(match self {
            WireValue::Int(v) => Value::Integer(*v),
            WireValue::Bool(v) => Value::Integer(i64::from(*v)),
            WireValue::Null => Value::Null,
            WireValue::Text(s) => Value::Text(s.clone()),
            WireValue::Vector(v) => Value::Blob(encode_vector(v)),
            WireValue::Matrix(rows) => Value::Blob(encode_matrix(rows)?),
        })
    }
}

/// Format one double for the wire: scientific notation, nine significant
/// digits.
fn format_double(v: f64) -> String {
    format!("{v:.8e}")
}

/// Write a 1-D array literal (`{v0, v1, …}`) into `out`.
fn push_vector_literal(out: &mut String, values: &[f64]) {
    out.push('{');
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&format_double(*v));
    }
    out.push('}');
}

/// Encode one field value as text for remote forwarding.
///
/// Integers print as decimal, booleans as `true`/`false`, null as the
/// literal `NULL`, arrays as brace literals with lossy doubles, text
/// verbatim. A ragged matrix is a fatal encoding error for this call; an
/// empty matrix encodes as `{}`.
pub fn encode_text(value: &WireValue) -> Result<String> {
    match value {
        WireValue::Int(v) => Ok(v.to_string()),
        WireValue::Bool(v) => Ok(if *v { "true" } else { "false" }.to_string()),
        WireValue::Null => Ok("NULL".to_string()),
        WireValue::Text(s) => Ok(s.clone()),
        WireValue::Vector(values) => {
            let mut out = String::new();
            push_vector_literal(&mut out, values);
            Ok(out)
        }
        WireValue::Matrix(rows) => {
            let ncols = rows.first().map_or(0, |r| r.len());
            if ncols == 0 {
                return Ok("{}".to_string());
            }
            for (i, row) in rows.iter().enumerate() {
                if row.len() != ncols {
                    return Err(KindlingError::encoding(format!(
                        "ragged matrix: row {} has {} columns, expected {}",
                        i,
                        row.len(),
                        ncols
                    )));
                }
            }
            let mut out = String::from("{");
            for (i, row) in rows.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                push_vector_literal(&mut out, row);
            }
            out.push('}');
            Ok(out)
        }
    }
}

// ---------------------------------------------------------------------------
// Text parsing on the primary side
// ---------------------------------------------------------------------------

/// Declared storage class of a queue-table column, as the forward listener
/// sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Integer column (also carries boolean flags as 0/1).
    Integer,
    /// Text column.
    Text,
    /// Blob column holding a codec-encoded array.
    Blob,
}

impl ColumnType {
    /// Map a declared SQL column type to its storage class.
    pub fn from_decl(decl: &str) -> Result<Self> {
        match decl.to_ascii_uppercase().as_str() {
            "INTEGER" => Ok(ColumnType::Integer),
            "TEXT" => Ok(ColumnType::Text),
            "BLOB" => Ok(ColumnType::Blob),
            other => Err(KindlingError::encoding(format!(
                "unsupported column type {other}"
            ))),
        }
    }
}

/// Parse one text-encoded parameter back into a storable value, guided by
/// the declared type of the destination column.
pub fn parse_text(text: &str, column_type: ColumnType) -> Result<rusqlite::types::Value> {
    use rusqlite::types::Value;

    if text == "NULL" {
        return Ok(Value::Null);
    }
    match column_type {
        ColumnType::Integer => match text {
            "true" => Ok(Value::Integer(1)),
            "false" => Ok(Value::Integer(0)),
            _ => text.parse::<i64>().map(Value::Integer).map_err(|_| {
                KindlingError::encoding(format!("invalid integer literal {text:?}"))
            }),
        },
        ColumnType::Text => Ok(Value::Text(text.to_string())),
        ColumnType::Blob => {
            let inner = text
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .ok_or_else(|| {
                    KindlingError::encoding(format!("invalid array literal {text:?}"))
                })?;
            let inner = inner.trim();
            if inner.starts_with('{') {
                let rows = parse_matrix_rows(inner)?;
                Ok(Value::Blob(encode_matrix(&rows)?))
            } else {
                // An empty literal has no dimensionality; treat it as an
                // empty vector.
                Ok(Value::Blob(encode_vector(&parse_doubles(inner)?)))
            }
        }
    }
}

/// Parse `{a, b}, {c, d}` (the inside of a 2-D literal) into rows.
fn parse_matrix_rows(inner: &str) -> Result<Vec<Vec<f64>>> {
    let mut rows = Vec::new();
    let mut rest = inner;
    loop {
        let start = rest
            .find('{')
            .ok_or_else(|| KindlingError::encoding("unterminated matrix literal"))?;
        let end = rest[start..]
            .find('}')
            .ok_or_else(|| KindlingError::encoding("unterminated matrix row"))?
            + start;
        rows.push(parse_doubles(&rest[start + 1..end])?);
        rest = rest[end + 1..].trim_start();
        if rest.is_empty() {
            return Ok(rows);
        }
        rest = rest
            .strip_prefix(',')
            .ok_or_else(|| KindlingError::encoding("malformed matrix literal"))?
            .trim_start();
    }
}

/// Parse a comma-separated list of doubles.
fn parse_doubles(inner: &str) -> Result<Vec<f64>> {
    let inner = inner.trim();
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| {
            part.trim().parse::<f64>().map_err(|_| {
                KindlingError::encoding(format!("invalid double literal {:?}", part.trim()))
            })
        })
        .collect()
}
