//! Index offset and XOR key extraction from the header line.
//!
//! Numbers are stored as ASCII hex inside fixed windows of the header (see
//! [`CipherSpec`]).  Once the format was recognised, a window that does not
//! parse means the archive is corrupt, so every failure here is fatal for
//! the depot rather than a reason to skip it.

use thiserror::Error;

use crate::format::{ByteRange, CipherSpec, FormatDescriptor};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("{field} window {window} lies outside the {len}-byte header")]
    OutOfBounds { field: &'static str, window: ByteRange, len: usize },
    #[error("{field} window {window} is empty")]
    Empty { field: &'static str, window: ByteRange },
    #[error("{field} window {window} is not hexadecimal: {text:?}")]
    NotHex { field: &'static str, window: ByteRange, text: String },
}

/// Offset and key as they apply to the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCipher {
    /// The input format, or its reversed-key sibling after relabeling.
    pub format: FormatDescriptor,
    pub offset: u64,
    pub key:    Option<u64>,
}

/// Parse one header window as an unsigned hex number.
///
/// Surrounding ASCII whitespace (the space separators and the trailing
/// newline) is ignored.
pub fn parse_hex_window(header: &[u8], window: ByteRange, field: &'static str) -> Result<u64, CipherError> {
    let raw = window.slice(header).ok_or(CipherError::OutOfBounds {
        field,
        window,
        len: header.len(),
    })?;
    parse_hex(raw.trim_ascii(), window, field)
}

fn parse_hex(digits: &[u8], window: ByteRange, field: &'static str) -> Result<u64, CipherError> {
    if digits.is_empty() {
        return Err(CipherError::Empty { field, window });
    }
    let not_hex = || CipherError::NotHex {
        field,
        window,
        text: String::from_utf8_lossy(digits).into_owned(),
    };
    let text = std::str::from_utf8(digits).map_err(|_| not_hex())?;
    u64::from_str_radix(text, 16).map_err(|_| not_hex())
}

/// Resolve the register offset and XOR key for `format` from `header`.
pub fn resolve(format: FormatDescriptor, header: &[u8]) -> Result<ResolvedCipher, CipherError> {
    resolve_with(format, format.id.cipher(), header)
}

/// [`resolve`] against an explicit layout.
pub fn resolve_with(
    format: FormatDescriptor,
    layout: &CipherSpec,
    header: &[u8],
) -> Result<ResolvedCipher, CipherError> {
    let Some(offset_window) = layout.offset_window else {
        return Ok(ResolvedCipher { format, offset: 0, key: None });
    };
    let offset = parse_hex_window(header, offset_window, "offset")?;

    let Some(key_window) = layout.key_window else {
        return Ok(ResolvedCipher { format, offset, key: None });
    };
    let mut key = parse_hex_window(header, key_window, "key")?;
    let mut format = format;

    if let Some(rule) = layout.reversed_key {
        if key != rule.sentinel {
            // The window was validated by the forward parse above.
            let raw = key_window.slice(header).unwrap_or_default();
            let mut reversed = raw.trim_ascii().to_vec();
            reversed.reverse();
            let candidate = parse_hex(&reversed, key_window, "key")?;
            if candidate == rule.sentinel {
                tracing::debug!(from = %format.id, to = %rule.variant.id, "key window is byte-reversed");
                key = candidate;
                format = rule.variant;
            }
        }
    }

    if let Some(secondary) = layout.secondary_key {
        key ^= u64::from(secondary);
    }

    Ok(ResolvedCipher { format, offset, key: Some(key) })
}
