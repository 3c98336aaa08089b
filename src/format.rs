//! Dialect catalog: magic tokens, format identities and cipher layouts.
//!
//! # Identity rules
//! Every on-disk dialect is identified by a [`FormatId`].  Several magic
//! tokens may alias the same id (e.g. `RPA-3.1` and `RPA-4.0` share the
//! `rpa3` layout); the alias only changes how the archive is reported.
//!
//! Each `FormatId` maps to exactly one [`CipherSpec`] through an exhaustive
//! `match`, so a missing layout is a compile error rather than a lookup
//! failure at runtime.
//!
//! # Header windows
//! Offsets and keys live in the first line of the container as ASCII hex.
//! A [`ByteRange`] names the slice of that line holding one number.

use serde::Serialize;

// ── Header probing constants ────────────────────────────────────────────────

/// Suffix of the index-only member of the legacy paired dialect.
pub const INDEX_SUFFIX: &str = "rpi";
/// Suffix of the data member of the legacy paired dialect, and of most archives.
pub const DATA_SUFFIX:  &str = "rpa";
/// Suffixes accepted as archive candidates.
pub const ARCHIVE_SUFFIXES: [&str; 3] = ["rpa", "rpi", "rpc"];

/// Leading byte counts sniffed as text when the whole line is not text.
pub const HEADER_SNIFF_LENGTHS: [usize; 2] = [12, 1];

/// First byte of every zlib stream (CMF for DEFLATE with a 32 KiB window).
pub const ZLIB_CMF: u8 = 0x78;
/// FLG bytes zlib emits for the four compression levels.
pub const ZLIB_FLAGS: [u8; 4] = [0x01, 0x5E, 0x9C, 0xDA];

// ── FormatId ────────────────────────────────────────────────────────────────

/// Closed set of archive layouts this build knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatId {
    /// Magic-less legacy dialect; index in `.rpi`, data in `.rpa`.
    Rpa1,
    Rpa2,
    Rpa3,
    /// `rpa3` whose key window was written byte-reversed.
    Rpa3r,
    Rpa32,
    Alt1,
    Zix12a,
    Zix12b,
}

impl FormatId {
    /// Short identifier used in reports.  Never parsed back.
    pub fn name(self) -> &'static str {
        match self {
            FormatId::Rpa1   => "rpa1",
            FormatId::Rpa2   => "rpa2",
            FormatId::Rpa3   => "rpa3",
            FormatId::Rpa3r  => "rpa3r",
            FormatId::Rpa32  => "rpa32",
            FormatId::Alt1   => "alt1",
            FormatId::Zix12a => "zix12a",
            FormatId::Zix12b => "zix12b",
        }
    }

    /// Dialects that are recognised but whose index scheme was never
    /// reverse-engineered.
    pub fn is_supported(self) -> bool {
        !matches!(self, FormatId::Zix12a | FormatId::Zix12b)
    }

    /// The header layout for this dialect.
    pub fn cipher(self) -> &'static CipherSpec {
        match self {
            FormatId::Rpa1                     => &RPA1_CIPHER,
            FormatId::Rpa2                     => &RPA2_CIPHER,
            FormatId::Rpa3                     => &RPA3_CIPHER,
            FormatId::Rpa3r                    => &RPA3R_CIPHER,
            FormatId::Rpa32                    => &RPA32_CIPHER,
            FormatId::Alt1                     => &ALT1_CIPHER,
            FormatId::Zix12a | FormatId::Zix12b => &OPAQUE_CIPHER,
        }
    }
}

impl std::fmt::Display for FormatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── FormatDescriptor ────────────────────────────────────────────────────────

/// A concrete dialect as it is reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub id:          FormatId,
    /// Set for unofficial tokens that reuse an official layout.
    pub alias:       Option<&'static str>,
    pub description: &'static str,
}

impl FormatDescriptor {
    pub const fn new(id: FormatId, alias: Option<&'static str>, description: &'static str) -> Self {
        Self { id, alias, description }
    }

    pub fn is_official(&self) -> bool {
        self.alias.is_none()
    }
}

/// The magic-less legacy dialect.  Detected by suffix or zlib heuristic,
/// so it has no row in [`CATALOG`].
pub const RPA1: FormatDescriptor = FormatDescriptor::new(FormatId::Rpa1, None, "RPA-1.0");

/// Relabel target of the `rpa3` reversed-key rule.  No magic token.
pub const RPA3_REVERSED: FormatDescriptor =
    FormatDescriptor::new(FormatId::Rpa3r, None, "RPA-3.0 (reversed key)");

// ── Catalog ─────────────────────────────────────────────────────────────────

/// One row of the magic-token catalog.
#[derive(Debug, Clone, Copy)]
pub struct MagicEntry {
    /// Literal substring expected at the start of the header line.
    pub token:      &'static str,
    pub descriptor: FormatDescriptor,
}

const fn entry(token: &'static str, id: FormatId, alias: Option<&'static str>, description: &'static str) -> MagicEntry {
    MagicEntry { token, descriptor: FormatDescriptor::new(id, alias, description) }
}

/// Every magic token this build recognises.  The trailing spaces on the two
/// oldest tokens are part of the token.
pub static CATALOG: [MagicEntry; 9] = [
    entry("RPA-2.0 ", FormatId::Rpa2,   None,          "RPA-2.0"),
    entry("RPA-3.0 ", FormatId::Rpa3,   None,          "RPA-3.0"),
    entry("RPI-3.0",  FormatId::Rpa32,  Some("rpi3"),  "RPI-3.0"),
    entry("RPA-3.1",  FormatId::Rpa3,   Some("rpa31"), "RPA-3.1"),
    entry("RPA-3.2",  FormatId::Rpa32,  None,          "RPA-3.2"),
    entry("RPA-4.0",  FormatId::Rpa3,   Some("rpa4"),  "RPA-4.0"),
    entry("ALT-1.0",  FormatId::Alt1,   None,          "ALT-1.0"),
    entry("ZiX-12A",  FormatId::Zix12a, None,          "ZiX-12A"),
    entry("ZiX-12B",  FormatId::Zix12b, None,          "ZiX-12B"),
];

/// Every catalog row whose token occurs anywhere in `header`.  Tokens are
/// ASCII, so the search runs on raw bytes and sees past undecodable parts.
pub fn matching_entries(header: &[u8]) -> Vec<&'static MagicEntry> {
    CATALOG.iter().filter(|e| contains_token(header, e.token)).collect()
}

fn contains_token(haystack: &[u8], token: &str) -> bool {
    let needle = token.as_bytes();
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ── ByteRange ───────────────────────────────────────────────────────────────

/// Half-open window `[start, end)` over the header line.  `end == None`
/// runs to the end of the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: usize,
    pub end:   Option<usize>,
}

impl ByteRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end: Some(end) }
    }

    pub const fn open_ended(start: usize) -> Self {
        Self { start, end: None }
    }

    /// Slice `header`, or `None` if the window does not fit.
    pub fn slice<'a>(&self, header: &'a [u8]) -> Option<&'a [u8]> {
        let end = self.end.unwrap_or(header.len());
        if self.start > end || end > header.len() {
            return None;
        }
        Some(&header[self.start..end])
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}:{})", self.start, end),
            None      => write!(f, "[{}:)", self.start),
        }
    }
}

// ── CipherSpec ──────────────────────────────────────────────────────────────

/// Where the index offset and XOR key live in the header, and how the key
/// is post-processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    /// `None` means the index sits at offset 0 (legacy `.rpi`).
    pub offset_window: Option<ByteRange>,
    pub key_window:    Option<ByteRange>,
    /// XORed into the parsed key before use.
    pub secondary_key: Option<u32>,
    pub reversed_key:  Option<ReversedKey>,
}

/// Archives whose key does not match `sentinel` are re-read with the key
/// window reversed; a match relabels the archive as `variant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReversedKey {
    pub sentinel: u64,
    pub variant:  FormatDescriptor,
}

/// Default key written by the stock Ren'Py archiver.
pub const RPA3_KEY_SENTINEL: u64 = 0x4242_4242;

const STANDARD_OFFSET: ByteRange = ByteRange::new(8, 24);
const STANDARD_KEY:    ByteRange = ByteRange::new(25, 33);

pub const RPA1_CIPHER: CipherSpec = CipherSpec {
    offset_window: None,
    key_window:    None,
    secondary_key: None,
    reversed_key:  None,
};

pub const RPA2_CIPHER: CipherSpec = CipherSpec {
    offset_window: Some(ByteRange::open_ended(8)),
    key_window:    None,
    secondary_key: None,
    reversed_key:  None,
};

pub const RPA3_CIPHER: CipherSpec = CipherSpec {
    offset_window: Some(STANDARD_OFFSET),
    key_window:    Some(STANDARD_KEY),
    secondary_key: None,
    reversed_key:  Some(ReversedKey { sentinel: RPA3_KEY_SENTINEL, variant: RPA3_REVERSED }),
};

pub const RPA3R_CIPHER: CipherSpec = CipherSpec {
    offset_window: Some(STANDARD_OFFSET),
    key_window:    Some(STANDARD_KEY),
    secondary_key: None,
    reversed_key:  None,
};

pub const RPA32_CIPHER: CipherSpec = CipherSpec {
    offset_window: Some(STANDARD_OFFSET),
    key_window:    Some(ByteRange::new(27, 35)),
    secondary_key: None,
    reversed_key:  None,
};

pub const ALT1_CIPHER: CipherSpec = CipherSpec {
    offset_window: Some(ByteRange::new(17, 33)),
    key_window:    Some(ByteRange::new(8, 16)),
    secondary_key: Some(0xDABE_8DF0),
    reversed_key:  None,
};

/// Placeholder for unsupported dialects; never consulted.
pub const OPAQUE_CIPHER: CipherSpec = RPA1_CIPHER;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_token_is_unique() {
        for (i, a) in CATALOG.iter().enumerate() {
            for b in &CATALOG[i + 1..] {
                assert_ne!(a.token, b.token);
            }
        }
    }

    #[test]
    fn no_token_contains_another() {
        // A containment would make every header of the longer token ambiguous.
        for a in &CATALOG {
            for b in &CATALOG {
                if a.token != b.token {
                    assert!(!a.token.contains(b.token), "{} contains {}", a.token, b.token);
                }
            }
        }
    }

    #[test]
    fn aliases_share_layouts() {
        let rpa31 = CATALOG.iter().find(|e| e.token == "RPA-3.1").unwrap();
        assert_eq!(rpa31.descriptor.id, FormatId::Rpa3);
        assert_eq!(rpa31.descriptor.alias, Some("rpa31"));
        assert!(!rpa31.descriptor.is_official());
        assert_eq!(rpa31.descriptor.id.cipher(), &RPA3_CIPHER);
    }

    #[test]
    fn open_range_runs_to_end() {
        let header = b"RPA-2.0 0000ff\n";
        assert_eq!(ByteRange::open_ended(8).slice(header), Some(&b"0000ff\n"[..]));
        assert_eq!(ByteRange::new(8, 40).slice(header), None);
        assert_eq!(ByteRange::new(20, 40).slice(header), None);
    }

    #[test]
    fn unsupported_dialects_are_flagged() {
        assert!(!FormatId::Zix12a.is_supported());
        assert!(!FormatId::Zix12b.is_supported());
        assert!(FormatId::Alt1.is_supported());
    }
}
