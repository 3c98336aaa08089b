//! The archive register: every stored path and the byte ranges backing it.
//!
//! # Decoding
//! The register is a zlib-compressed pickle that runs from the resolved
//! offset to the end of the index file.  [`decode`] applies four steps in a
//! fixed order:
//!
//! 1. inflate and unpickle ([`pickle::parse_index`]),
//! 2. [`normalize`] every `(offset, length)` pair to a [`Segment`] with an
//!    empty prefix,
//! 3. [`unscramble`] offsets and lengths with the XOR key, if any,
//! 4. coerce keys to path strings and check the entry invariants.
//!
//! A register is only returned when all four succeed.

pub mod pickle;

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};

use flate2::read::ZlibDecoder;
use thiserror::Error;

pub use pickle::{RawEntry, RawKey, RawSegment};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("index is not a valid zlib stream: {0}")]
    Inflate(#[source] io::Error),
    #[error("index is not a valid pickle: {0}")]
    Pickle(#[from] serde_pickle::Error),
    #[error("unexpected index layout: {0}")]
    Layout(String),
    #[error("entry path is not valid UTF-8: {}", String::from_utf8_lossy(.0))]
    PathEncoding(Vec<u8>),
    #[error("entry {0:?} has no segments")]
    EmptyEntry(String),
    #[error("entry {path:?}: prefix of {prefix} bytes exceeds segment length {length}")]
    PrefixTooLong { path: String, prefix: usize, length: u64 },
    #[error("entry {0:?} occurs more than once")]
    DuplicatePath(String),
}

// ── Segment ─────────────────────────────────────────────────────────────────

/// One byte range of the data file plus the literal bytes that precede it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    pub offset: u64,
    /// Stored length; counts the prefix bytes for single-segment entries.
    pub length: u64,
    pub prefix: Vec<u8>,
}

impl Segment {
    pub fn new(offset: u64, length: u64, prefix: impl Into<Vec<u8>>) -> Self {
        Self { offset, length, prefix: prefix.into() }
    }
}

impl From<Segment> for RawSegment {
    fn from(s: Segment) -> Self {
        RawSegment::Triple(s.offset, s.length, s.prefix)
    }
}

/// Ordered segments of one stored file.  Never empty once decoded.
pub type RegisterEntry = Vec<Segment>;

// ── Register ────────────────────────────────────────────────────────────────

/// Path → segments, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Register {
    entries: BTreeMap<String, RegisterEntry>,
}

impl Register {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&[Segment]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Segment])> {
        self.entries.iter().map(|(p, s)| (p.as_str(), s.as_slice()))
    }

    /// Stored paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Coerce keys and check the entry invariants.
    pub fn from_entries<I>(entries: I) -> Result<Self, DecodeError>
    where
        I: IntoIterator<Item = (RawKey, RegisterEntry)>,
    {
        let mut out = BTreeMap::new();
        for (key, segments) in entries {
            let path = coerce_key(key)?;
            if segments.is_empty() {
                return Err(DecodeError::EmptyEntry(path));
            }
            if let Some(bad) = segments.iter().find(|s| s.prefix.len() as u64 > s.length) {
                return Err(DecodeError::PrefixTooLong {
                    prefix: bad.prefix.len(),
                    length: bad.length,
                    path,
                });
            }
            if out.contains_key(&path) {
                return Err(DecodeError::DuplicatePath(path));
            }
            out.insert(path, segments);
        }
        Ok(Self { entries: out })
    }
}

fn coerce_key(key: RawKey) -> Result<String, DecodeError> {
    match key {
        RawKey::Text(s)  => Ok(s),
        RawKey::Bytes(b) => String::from_utf8(b).map_err(|e| DecodeError::PathEncoding(e.into_bytes())),
    }
}

// ── Decoding steps ──────────────────────────────────────────────────────────

/// Rewrite every stored segment as a [`Segment`]; pairs get an empty prefix.
/// Segments that already carry a prefix pass through unchanged.
pub fn normalize(raw: Vec<RawSegment>) -> RegisterEntry {
    raw.into_iter()
        .map(|s| match s {
            RawSegment::Pair(offset, length)           => Segment::new(offset, length, Vec::new()),
            RawSegment::Triple(offset, length, prefix) => Segment::new(offset, length, prefix),
        })
        .collect()
}

/// XOR offsets and lengths with `key`.  Prefix bytes are left alone.
/// Applying the same key twice restores the input.
pub fn unscramble(segments: &mut [Segment], key: u64) {
    for s in segments {
        s.offset ^= key;
        s.length ^= key;
    }
}

/// Inflate and unpickle the register stored at `offset`, then normalise,
/// descramble with `key` and coerce its keys.
pub fn decode<R: Read + Seek>(reader: &mut R, offset: u64, key: Option<u64>) -> Result<Register, DecodeError> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut compressed = Vec::new();
    reader.read_to_end(&mut compressed)?;

    let mut raw = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut raw)
        .map_err(DecodeError::Inflate)?;

    decode_index(&raw, key)
}

/// [`decode`] for an already inflated pickle.
pub fn decode_index(pickled: &[u8], key: Option<u64>) -> Result<Register, DecodeError> {
    let entries = pickle::parse_index(pickled)?
        .into_iter()
        .map(|(path, raw)| {
            let mut segments = normalize(raw);
            if let Some(key) = key {
                unscramble(&mut segments, key);
            }
            (path, segments)
        });
    Register::from_entries(entries)
}
