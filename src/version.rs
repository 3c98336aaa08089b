//! Dialect detection from the first header line.
//!
//! Every catalog token found anywhere in the first line of a container is
//! collected, binary parts of the line included.  The verdict is strict: zero
//! matches is only acceptable for the legacy `.rpi` index, and more than one
//! match is a data error that is never resolved by picking a winner.
//!
//! The text sniff ([`sniff_header`]) only decides whether a magic-less line
//! looks like the zlib stream of a legacy index.

use thiserror::Error;

use crate::format::{
    matching_entries, FormatDescriptor, FormatId, HEADER_SNIFF_LENGTHS, INDEX_SUFFIX, RPA1,
    ZLIB_CMF, ZLIB_FLAGS,
};

/// Why a candidate is not a processable archive.  These are verdicts, not
/// failures: the depot is skipped and the run continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    #[error("no known archive magic found")]
    NoFormatDetected,
    #[error("header matches several dialects ({})", .tokens.join(", "))]
    AmbiguousFormat { tokens: Vec<&'static str> },
    #[error("dialect {0} is recognised but not supported")]
    UnsupportedFormat(FormatId),
}

/// Result of probing the leading header bytes as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderSniff<'a> {
    /// Leading bytes decoded as text.
    Text(&'a str),
    /// Undecodable text that starts like a zlib stream: the legacy
    /// magic-less index.
    Deflate,
    /// Neither text nor zlib.
    Opaque,
}

/// Decode the header as text: the whole line first, then each shorter
/// sniff length in turn.
pub fn sniff_header(header: &[u8]) -> HeaderSniff<'_> {
    let lengths = std::iter::once(header.len()).chain(HEADER_SNIFF_LENGTHS);
    for len in lengths {
        let head = &header[..len.min(header.len())];
        if let Ok(text) = std::str::from_utf8(head) {
            if text.as_bytes().first() == Some(&ZLIB_CMF) && looks_like_zlib(header) {
                return HeaderSniff::Deflate;
            }
            return HeaderSniff::Text(text);
        }
    }
    HeaderSniff::Opaque
}

fn looks_like_zlib(header: &[u8]) -> bool {
    matches!(header, [cmf, flg, ..] if *cmf == ZLIB_CMF && ZLIB_FLAGS.contains(flg))
}

fn is_index_suffix(suffix: &str) -> bool {
    suffix.eq_ignore_ascii_case(INDEX_SUFFIX)
}

/// Identify the dialect of a container from its first line and the
/// file's suffix (without the leading dot).
pub fn resolve(header: &[u8], suffix: &str) -> Result<FormatDescriptor, DetectionOutcome> {
    match sniff_header(header) {
        HeaderSniff::Text(_) => {}
        HeaderSniff::Deflate => {
            tracing::info!("header starts with a zlib stream, possible RPA-1.0 index");
            return if is_index_suffix(suffix) {
                Ok(RPA1)
            } else {
                Err(DetectionOutcome::NoFormatDetected)
            };
        }
        HeaderSniff::Opaque => {
            tracing::warn!("header is not readable as text; not an archive or very unusual");
        }
    }

    let matches = matching_entries(header);
    match matches.as_slice() {
        [] if is_index_suffix(suffix) => Ok(RPA1),
        []                            => Err(DetectionOutcome::NoFormatDetected),
        [only] if !only.descriptor.id.is_supported() => {
            Err(DetectionOutcome::UnsupportedFormat(only.descriptor.id))
        }
        [only] => Ok(only.descriptor),
        many => Err(DetectionOutcome::AmbiguousFormat {
            tokens: many.iter().map(|e| e.token).collect(),
        }),
    }
}
