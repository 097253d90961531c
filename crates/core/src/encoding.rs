//! External encodings understood by channels
//!
//! Decoding pulls bytes through a [`ByteSource`] so a character whose bytes
//! straddle two queued buffers decodes exactly as if it had arrived in one
//! piece. An incomplete prefix is reported as [`Decoded::Incomplete`] and is
//! left in place until more input arrives (or EOF forces a lenient decode).

use std::fmt;
use std::str::FromStr;

use crate::buffer::QueueCursor;
use crate::error::ChannelError;

/// Replacement for characters an encoding cannot represent on output
const SUBSTITUTE: u8 = b'?';

/// Anything that can be peeked byte-by-byte
pub trait ByteSource {
    fn peek(&self, ahead: usize) -> Option<u8>;
}

impl ByteSource for [u8] {
    fn peek(&self, ahead: usize) -> Option<u8> {
        self.get(ahead).copied()
    }
}

impl ByteSource for QueueCursor<'_> {
    fn peek(&self, ahead: usize) -> Option<u8> {
        QueueCursor::peek(self, ahead)
    }
}

/// Outcome of decoding one character
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// A character and the number of source bytes it used
    Char(char, usize),
    /// The available bytes are a valid prefix; more input is needed
    Incomplete,
    /// No bytes available
    Empty,
}

/// Supported external encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// No conversion: each byte is one character U+0000..U+00FF
    Binary,
    #[default]
    Utf8,
    Iso8859_1,
    Ascii,
    Utf16Le,
    Utf16Be,
}

impl Encoding {
    /// Every supported encoding, in listing order
    pub const ALL: [Encoding; 6] = [
        Encoding::Binary,
        Encoding::Utf8,
        Encoding::Iso8859_1,
        Encoding::Ascii,
        Encoding::Utf16Le,
        Encoding::Utf16Be,
    ];

    /// Look an encoding up by name; `""` and `"binary"` mean no encoding.
    pub fn by_name(name: &str) -> Option<Encoding> {
        let lower = name.trim().to_ascii_lowercase();
        let enc = match lower.as_str() {
            "" | "binary" | "identity" => Encoding::Binary,
            "utf-8" | "utf8" => Encoding::Utf8,
            "iso8859-1" | "iso-8859-1" | "latin1" | "latin-1" => Encoding::Iso8859_1,
            "ascii" | "us-ascii" => Encoding::Ascii,
            "utf-16le" | "utf16le" | "unicode" => Encoding::Utf16Le,
            "utf-16be" | "utf16be" => Encoding::Utf16Be,
            _ => return None,
        };
        Some(enc)
    }

    /// Look an encoding up by name, listing the supported ones on failure
    pub fn lookup(name: &str) -> Result<Encoding, ChannelError> {
        Encoding::by_name(name).ok_or_else(|| {
            let known: Vec<&str> = Encoding::ALL.iter().map(|e| e.name()).collect();
            ChannelError::UnknownEncoding {
                name: name.to_string(),
                known: known.join(", "),
            }
        })
    }

    /// Encoding used for freshly created channels
    pub fn system() -> Encoding {
        Encoding::Utf8
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Binary => "binary",
            Encoding::Utf8 => "utf-8",
            Encoding::Iso8859_1 => "iso8859-1",
            Encoding::Ascii => "ascii",
            Encoding::Utf16Le => "utf-16le",
            Encoding::Utf16Be => "utf-16be",
        }
    }

    pub fn is_binary(self) -> bool {
        self == Encoding::Binary
    }

    /// Worst-case bytes produced per character on output
    pub fn max_bytes_per_char(self) -> usize {
        match self {
            Encoding::Binary | Encoding::Iso8859_1 | Encoding::Ascii => 1,
            Encoding::Utf8 | Encoding::Utf16Le | Encoding::Utf16Be => 4,
        }
    }

    /// Decode one character from the front of `src`.
    ///
    /// With `at_eof` set, a dangling incomplete sequence is decoded leniently
    /// instead of asking for more input.
    pub fn decode<S: ByteSource + ?Sized>(self, src: &S, at_eof: bool) -> Decoded {
        let Some(lead) = src.peek(0) else {
            return Decoded::Empty;
        };
        match self {
            Encoding::Binary | Encoding::Iso8859_1 | Encoding::Ascii => {
                Decoded::Char(char::from(lead), 1)
            }
            Encoding::Utf8 => decode_utf8(src, lead, at_eof),
            Encoding::Utf16Le => decode_utf16(src, at_eof, u16::from_le_bytes),
            Encoding::Utf16Be => decode_utf16(src, at_eof, u16::from_be_bytes),
        }
    }

    /// Append the external form of `c` to `out`
    pub fn encode(self, c: char, out: &mut Vec<u8>) {
        match self {
            // Characters above U+00FF keep only their low byte.
            Encoding::Binary => out.push((u32::from(c) & 0xff) as u8),
            Encoding::Utf8 => {
                let mut tmp = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
            Encoding::Iso8859_1 => out.push(u8::try_from(u32::from(c)).unwrap_or(SUBSTITUTE)),
            Encoding::Ascii => {
                if c.is_ascii() {
                    out.push(c as u8);
                } else {
                    out.push(SUBSTITUTE);
                }
            }
            Encoding::Utf16Le => {
                let mut tmp = [0u16; 2];
                for unit in c.encode_utf16(&mut tmp) {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
            }
            Encoding::Utf16Be => {
                let mut tmp = [0u16; 2];
                for unit in c.encode_utf16(&mut tmp) {
                    out.extend_from_slice(&unit.to_be_bytes());
                }
            }
        }
    }

    /// Encode a whole string (convenience for tests and tools)
    pub fn encode_all(self, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() * self.max_bytes_per_char());
        for c in text.chars() {
            self.encode(c, &mut out);
        }
        out
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Encoding::lookup(s)
    }
}

fn decode_utf8<S: ByteSource + ?Sized>(src: &S, lead: u8, at_eof: bool) -> Decoded {
    let (needed, init) = match lead {
        0x00..=0x7f => return Decoded::Char(char::from(lead), 1),
        0xc2..=0xdf => (1, u32::from(lead & 0x1f)),
        0xe0..=0xef => (2, u32::from(lead & 0x0f)),
        0xf0..=0xf4 => (3, u32::from(lead & 0x07)),
        // Stray continuation or invalid lead byte: pass it through as-is.
        _ => return Decoded::Char(char::from(lead), 1),
    };

    let mut cp = init;
    for i in 1..=needed {
        match src.peek(i) {
            Some(b) if (0x80..=0xbf).contains(&b) => cp = (cp << 6) | u32::from(b & 0x3f),
            Some(_) => return Decoded::Char(char::from(lead), 1),
            None if at_eof => return Decoded::Char(char::from(lead), 1),
            None => return Decoded::Incomplete,
        }
    }

    let min = match needed {
        1 => 0x80,
        2 => 0x800,
        _ => 0x10000,
    };
    match char::from_u32(cp) {
        Some(c) if cp >= min => Decoded::Char(c, needed + 1),
        _ => Decoded::Char(char::from(lead), 1),
    }
}

fn decode_utf16<S: ByteSource + ?Sized>(
    src: &S,
    at_eof: bool,
    unit: fn([u8; 2]) -> u16,
) -> Decoded {
    let read_unit = |at: usize| -> Option<u16> {
        Some(unit([src.peek(at)?, src.peek(at + 1)?]))
    };

    let Some(first) = read_unit(0) else {
        return if at_eof {
            Decoded::Char(char::REPLACEMENT_CHARACTER, 1)
        } else {
            Decoded::Incomplete
        };
    };

    match first {
        0xd800..=0xdbff => match read_unit(2) {
            Some(second @ 0xdc00..=0xdfff) => {
                let cp = 0x10000 + ((u32::from(first) - 0xd800) << 10) + (u32::from(second) - 0xdc00);
                match char::from_u32(cp) {
                    Some(c) => Decoded::Char(c, 4),
                    None => Decoded::Char(char::REPLACEMENT_CHARACTER, 2),
                }
            }
            Some(_) => Decoded::Char(char::REPLACEMENT_CHARACTER, 2),
            None if at_eof => Decoded::Char(char::REPLACEMENT_CHARACTER, 2),
            None => Decoded::Incomplete,
        },
        0xdc00..=0xdfff => Decoded::Char(char::REPLACEMENT_CHARACTER, 2),
        _ => match char::from_u32(u32::from(first)) {
            Some(c) => Decoded::Char(c, 2),
            None => Decoded::Char(char::REPLACEMENT_CHARACTER, 2),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(enc: Encoding, bytes: &[u8]) -> String {
        let mut out = String::new();
        let mut rest = bytes;
        while let Decoded::Char(c, used) = enc.decode(rest, true) {
            out.push(c);
            rest = &rest[used..];
        }
        out
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(Encoding::by_name("binary"), Some(Encoding::Binary));
        assert_eq!(Encoding::by_name(""), Some(Encoding::Binary));
        assert_eq!(Encoding::by_name("UTF-8"), Some(Encoding::Utf8));
        assert_eq!(Encoding::by_name("latin1"), Some(Encoding::Iso8859_1));
        assert!(Encoding::by_name("klingon").is_none());
        let err = "klingon".parse::<Encoding>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown encoding \"klingon\": should be one of binary, utf-8, iso8859-1, ascii, utf-16le, utf-16be"
        );
    }

    #[test]
    fn test_utf8_incomplete_prefix() {
        let euro = "€".as_bytes();
        assert_eq!(Encoding::Utf8.decode(&euro[..2], false), Decoded::Incomplete);
        assert_eq!(Encoding::Utf8.decode(euro, false), Decoded::Char('€', 3));
    }

    #[test]
    fn test_utf8_lenient_at_eof() {
        let euro = "€".as_bytes();
        assert_eq!(
            Encoding::Utf8.decode(&euro[..2], true),
            Decoded::Char(char::from(euro[0]), 1)
        );
        assert_eq!(Encoding::Utf8.decode(&[0xff][..], false), Decoded::Char('\u{ff}', 1));
    }

    #[test]
    fn test_utf8_rejects_overlong() {
        assert_eq!(
            Encoding::Utf8.decode(&[0xe0, 0x80, 0x80][..], false),
            Decoded::Char('\u{e0}', 1)
        );
    }

    #[test]
    fn test_utf16_surrogate_pair() {
        let bytes = Encoding::Utf16Le.encode_all("𝄞");
        assert_eq!(bytes.len(), 4);
        assert_eq!(Encoding::Utf16Le.decode(&bytes[..3], false), Decoded::Incomplete);
        assert_eq!(Encoding::Utf16Le.decode(&bytes[..], false), Decoded::Char('𝄞', 4));
    }

    #[test]
    fn test_lossy_output_substitutes() {
        assert_eq!(Encoding::Ascii.encode_all("aé"), b"a?");
        assert_eq!(Encoding::Iso8859_1.encode_all("é€"), vec![0xe9, b'?']);
        assert_eq!(Encoding::Binary.encode_all("\u{141}"), vec![0x41]);
    }

    #[test]
    fn test_roundtrip_lossless_encodings() {
        let text = "héllo wörld ✓";
        for enc in [Encoding::Utf8, Encoding::Utf16Le, Encoding::Utf16Be] {
            assert_eq!(decode_all(enc, &enc.encode_all(text)), text, "{}", enc);
        }
    }
}
