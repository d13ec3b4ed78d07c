//! `NPY_SEQ`: one `.npy` file per datum, `{root/resource_path}_{index}.npy`.

use std::path::{Path, PathBuf};

use serde_json::{Number, Value};

use super::{int_kwarg, Handler, HandlerError};

const SPEC: &str = "NPY_SEQ";
const MAGIC: &[u8] = b"\x93NUMPY";

/// Cap on arrays built for shapes whose element count is small or zero
const MAX_EMPTY_ARRAYS: usize = 1 << 16;

pub struct NumpySeqHandler {
    prefix: PathBuf,
}

impl NumpySeqHandler {
    pub fn new(prefix: PathBuf) -> Self {
        Self { prefix }
    }

    fn path_for(&self, datum_kwargs: &Value) -> Result<PathBuf, HandlerError> {
        let index = int_kwarg(datum_kwargs, SPEC, "index")?;
        let mut name = self.prefix.clone().into_os_string();
        name.push(format!("_{}.npy", index));
        Ok(PathBuf::from(name))
    }
}

impl Handler for NumpySeqHandler {
    fn file_list(&self, datum_kwargs: &[Value]) -> Result<Vec<PathBuf>, HandlerError> {
        datum_kwargs.iter().map(|kwargs| self.path_for(kwargs)).collect()
    }

    fn fill(&self, datum_kwargs: &Value) -> Result<Value, HandlerError> {
        read_npy(&self.path_for(datum_kwargs)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Bool,
    Int,
    Uint,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Dtype {
    kind: Kind,
    size: usize,
    big_endian: bool,
}

#[derive(Debug, PartialEq)]
struct Header {
    dtype: Dtype,
    fortran_order: bool,
    shape: Vec<usize>,
}

/// Read a `.npy` array (format 1.0 to 3.0) as nested JSON arrays.
///
/// Only C-ordered bool, integer and float arrays are supported.
pub fn read_npy(path: &Path) -> Result<Value, HandlerError> {
    let bytes = std::fs::read(path).map_err(|source| HandlerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode_npy(&bytes).map_err(|reason| HandlerError::Npy {
        path: path.to_path_buf(),
        reason,
    })
}

fn decode_npy(bytes: &[u8]) -> Result<Value, String> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err("missing NUMPY magic string".to_string());
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err("truncated header".to_string());
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        }
        v => return Err(format!("unsupported format version {}", v)),
    };
    let data_start = header_start + header_len;
    let header_bytes = bytes
        .get(header_start..data_start)
        .ok_or_else(|| "truncated header".to_string())?;
    let header_text = std::str::from_utf8(header_bytes).map_err(|e| e.to_string())?;
    let header = parse_header(header_text)?;

    if header.fortran_order {
        return Err("Fortran-ordered arrays are not supported".to_string());
    }

    let count = header
        .shape
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| "shape overflows".to_string())?;
    let data = &bytes[data_start..];
    let needed = count
        .checked_mul(header.dtype.size)
        .ok_or_else(|| "shape overflows".to_string())?;
    if data.len() < needed {
        return Err(format!("expected {} data bytes, found {}", needed, data.len()));
    }
    let limit = count.saturating_mul(header.shape.len()).max(MAX_EMPTY_ARRAYS);
    if nested_arrays(&header.shape).map_or(true, |arrays| arrays > limit) {
        return Err(format!("shape {:?} is too large for {} data bytes", header.shape, data.len()));
    }

    let values = data[..needed]
        .chunks_exact(header.dtype.size)
        .map(|chunk| decode_element(header.dtype, chunk))
        .collect::<Result<Vec<_>, _>>()?;

    if header.shape.is_empty() {
        return values
            .into_iter()
            .next()
            .ok_or_else(|| "scalar array has no data".to_string());
    }
    Ok(nest(&header.shape, &mut values.into_iter()))
}

/// Number of JSON arrays `nest` builds for `shape`, or None on overflow.
///
/// An axis of length zero makes the element count zero but still leaves
/// the outer axes to be materialized.
fn nested_arrays(shape: &[usize]) -> Option<usize> {
    let mut arrays = 0usize;
    let mut outer = 1usize;
    for &n in shape {
        arrays = arrays.checked_add(outer)?;
        outer = outer.checked_mul(n)?;
    }
    Some(arrays)
}

/// Build nested arrays of the given shape from a flat C-ordered sequence.
fn nest(shape: &[usize], values: &mut impl Iterator<Item = Value>) -> Value {
    match shape {
        [] => values.next().unwrap_or(Value::Null),
        [n, rest @ ..] => Value::Array((0..*n).map(|_| nest(rest, values)).collect()),
    }
}

fn decode_element(dtype: Dtype, chunk: &[u8]) -> Result<Value, String> {
    let mut buf = [0u8; 8];
    buf[..dtype.size].copy_from_slice(chunk);
    if dtype.big_endian {
        buf[..dtype.size].reverse();
    }

    let value = match (dtype.kind, dtype.size) {
        (Kind::Bool, 1) => Value::Bool(buf[0] != 0),
        (Kind::Uint, 1) => Value::from(buf[0]),
        (Kind::Uint, 2) => Value::from(u16::from_le_bytes([buf[0], buf[1]])),
        (Kind::Uint, 4) => Value::from(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
        (Kind::Uint, 8) => Value::from(u64::from_le_bytes(buf)),
        (Kind::Int, 1) => Value::from(buf[0] as i8),
        (Kind::Int, 2) => Value::from(i16::from_le_bytes([buf[0], buf[1]])),
        (Kind::Int, 4) => Value::from(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
        (Kind::Int, 8) => Value::from(i64::from_le_bytes(buf)),
        (Kind::Float, 4) => float(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64),
        (Kind::Float, 8) => float(f64::from_le_bytes(buf)),
        (kind, size) => return Err(format!("unsupported dtype {:?} of {} bytes", kind, size)),
    };
    Ok(value)
}

/// JSON has no NaN or infinity; those become null.
fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn parse_dtype(descr: &str) -> Result<Dtype, String> {
    let mut chars = descr.chars();
    let (big_endian, rest) = match chars.next() {
        Some('<') | Some('|') | Some('=') => (false, chars.as_str()),
        Some('>') => (true, chars.as_str()),
        _ => (false, descr),
    };
    let mut rest_chars = rest.chars();
    let kind = match rest_chars.next() {
        Some('b') | Some('?') => Kind::Bool,
        Some('i') => Kind::Int,
        Some('u') => Kind::Uint,
        Some('f') => Kind::Float,
        _ => return Err(format!("unsupported dtype {:?}", descr)),
    };
    let size = rest_chars
        .as_str()
        .parse::<usize>()
        .map_err(|_| format!("unsupported dtype {:?}", descr))?;
    if size == 0 || size > 8 {
        return Err(format!("unsupported dtype {:?}", descr));
    }
    Ok(Dtype {
        kind,
        size,
        big_endian,
    })
}

/// Parse the header dict, e.g.
/// `{'descr': '<f8', 'fortran_order': False, 'shape': (3, 4), }`.
fn parse_header(text: &str) -> Result<Header, String> {
    let descr = header_value(text, "descr")?;
    let descr = descr
        .trim()
        .trim_matches(|c: char| c == '\'' || c == '"');
    let dtype = parse_dtype(descr)?;

    let fortran_order = match header_value(text, "fortran_order")?.trim() {
        "True" => true,
        "False" => false,
        other => return Err(format!("invalid fortran_order {:?}", other)),
    };

    let shape_text = header_value(text, "shape")?;
    let shape = shape_text
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| format!("invalid shape {:?}", shape_text)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Header {
        dtype,
        fortran_order,
        shape,
    })
}

/// Raw text of the value for `key` in the header dict
fn header_value<'a>(text: &'a str, key: &str) -> Result<&'a str, String> {
    let quoted = format!("'{}':", key);
    let start = text
        .find(&quoted)
        .map(|i| i + quoted.len())
        .ok_or_else(|| format!("header has no {:?}", key))?;
    let rest = &text[start..];

    let end = if rest.trim_start().starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else {
        rest.find([',', '}'])
    };
    Ok(&rest[..end.unwrap_or(rest.len())])
}
