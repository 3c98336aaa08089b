//! Conversion of the unpickled index into raw register entries.
//!
//! The index is a Python dict written by `pickle.dumps`.  Depending on the
//! interpreter that built the archive, keys arrive as `bytes` (Python 2
//! `str`) or `str`, and values as lists of 2- or 3-tuples.  This module only
//! checks the shape; normalisation happens in the parent module.

use num_bigint::BigInt;
use serde_pickle::{DeOptions, HashableValue, Value};

use super::DecodeError;

/// A register key before it is coerced to a path string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawKey {
    Bytes(Vec<u8>),
    Text(String),
}

/// One segment as stored: `(offset, length)` or `(offset, length, prefix)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSegment {
    Pair(u64, u64),
    Triple(u64, u64, Vec<u8>),
}

pub type RawEntry = (RawKey, Vec<RawSegment>);

/// Unpickle `bytes` and check that it has the shape of a register.
pub fn parse_index(bytes: &[u8]) -> Result<Vec<RawEntry>, DecodeError> {
    let value = serde_pickle::value_from_slice(bytes, DeOptions::new())?;
    let map = match value {
        Value::Dict(map) => map,
        other => return Err(layout(format!("index root is {}, expected a dict", kind(&other)))),
    };
    map.into_iter()
        .map(|(key, segments)| Ok((raw_key(key)?, raw_segments(segments)?)))
        .collect()
}

fn raw_key(key: HashableValue) -> Result<RawKey, DecodeError> {
    match key {
        HashableValue::Bytes(b)  => Ok(RawKey::Bytes(b)),
        HashableValue::String(s) => Ok(RawKey::Text(s)),
        other => Err(layout(format!("index key {other:?} is not a path"))),
    }
}

fn raw_segments(value: Value) -> Result<Vec<RawSegment>, DecodeError> {
    match value {
        Value::List(items) | Value::Tuple(items) => items.into_iter().map(raw_segment).collect(),
        other => Err(layout(format!("entry value is {}, expected a list", kind(&other)))),
    }
}

fn raw_segment(value: Value) -> Result<RawSegment, DecodeError> {
    let fields = match value {
        Value::List(fields) | Value::Tuple(fields) => fields,
        other => return Err(layout(format!("segment is {}, expected a tuple", kind(&other)))),
    };
    match <[Value; 2]>::try_from(fields) {
        Ok([offset, length]) => Ok(RawSegment::Pair(int(&offset)?, int(&length)?)),
        Err(fields) => match <[Value; 3]>::try_from(fields) {
            Ok([offset, length, prefix]) => {
                Ok(RawSegment::Triple(int(&offset)?, int(&length)?, prefix_bytes(prefix)?))
            }
            Err(fields) => Err(layout(format!("segment has {} fields, expected 2 or 3", fields.len()))),
        },
    }
}

fn int(value: &Value) -> Result<u64, DecodeError> {
    match value {
        Value::I64(n) => u64::try_from(*n).map_err(|_| layout(format!("negative segment field {n}"))),
        Value::Int(big) => big_to_u64(big),
        other => Err(layout(format!("segment field is {}, expected an integer", kind(other)))),
    }
}

fn big_to_u64(big: &BigInt) -> Result<u64, DecodeError> {
    u64::try_from(big).map_err(|_| layout(format!("segment field {big} does not fit in 64 bits")))
}

/// Prefixes are raw bytes; text prefixes were written latin-1 encoded.
fn prefix_bytes(value: Value) -> Result<Vec<u8>, DecodeError> {
    match value {
        Value::Bytes(b) => Ok(b),
        Value::String(s) => Ok(s
            .chars()
            .map(u8::try_from)
            .collect::<Result<Vec<u8>, _>>()
            .unwrap_or_else(|_| s.into_bytes())),
        Value::None => Ok(Vec::new()),
        other => Err(layout(format!("segment prefix is {}, expected bytes", kind(&other)))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::None         => "None",
        Value::Bool(_)      => "a bool",
        Value::I64(_)       => "an int",
        Value::Int(_)       => "an int",
        Value::F64(_)       => "a float",
        Value::Bytes(_)     => "bytes",
        Value::String(_)    => "a str",
        Value::List(_)      => "a list",
        Value::Tuple(_)     => "a tuple",
        Value::Set(_)       => "a set",
        Value::FrozenSet(_) => "a frozenset",
        Value::Dict(_)      => "a dict",
        #[allow(unreachable_patterns)]
        _                   => "an unknown value",
    }
}

fn layout(msg: String) -> DecodeError {
    DecodeError::Layout(msg)
}
