//! End-of-line translation and the incremental input/output pipelines
//!
//! Input runs one character at a time over the raw input queue:
//! decode (encoding) -> in-band EOF check -> EOL normalization -> sink.
//! Nothing is consumed from the queue here; the caller receives the queue
//! position reached and commits (or rolls back) itself.
//!
//! Output translates a bounded chunk of application text into external bytes
//! in one go; the caller spreads the result over output buffers.

use std::fmt;
use std::str::FromStr;

use crate::buffer::{BufferQueue, QueueCursor, QueuePos};
use crate::encoding::{Decoded, Encoding};
use crate::error::ChannelError;

/// Source units translated per output chunk, independent of buffer size
pub const CONVERT_CHUNK: usize = 1024;

/// End-of-line convention for one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Translation {
    /// Input only: any of `\n`, `\r`, `\r\n` ends a line
    Auto,
    Lf,
    Cr,
    /// On input a `\r` is only released once the next character is known.
    /// A blocking read whose data ends in `\r` therefore waits for the
    /// transport; a non-blocking one returns what precedes it and keeps the
    /// `\r` queued.
    Crlf,
}

impl Translation {
    /// Native convention of the host platform
    pub fn platform() -> Translation {
        if cfg!(windows) {
            Translation::Crlf
        } else {
            Translation::Lf
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Translation::Auto => "auto",
            Translation::Lf => "lf",
            Translation::Cr => "cr",
            Translation::Crlf => "crlf",
        }
    }
}

impl fmt::Display for Translation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A translation value as written in configuration, before side effects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationMode {
    Auto,
    Binary,
    Lf,
    Cr,
    Crlf,
    Platform,
}

impl TranslationMode {
    /// Effective translation for the input side
    pub fn for_input(self) -> Translation {
        match self {
            TranslationMode::Auto => Translation::Auto,
            TranslationMode::Binary | TranslationMode::Lf => Translation::Lf,
            TranslationMode::Cr => Translation::Cr,
            TranslationMode::Crlf => Translation::Crlf,
            TranslationMode::Platform => Translation::platform(),
        }
    }

    /// Effective translation for the output side; `auto` writes the platform form
    pub fn for_output(self) -> Translation {
        match self {
            TranslationMode::Auto | TranslationMode::Platform => Translation::platform(),
            TranslationMode::Binary | TranslationMode::Lf => Translation::Lf,
            TranslationMode::Cr => Translation::Cr,
            TranslationMode::Crlf => Translation::Crlf,
        }
    }
}

impl FromStr for TranslationMode {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(TranslationMode::Auto),
            "binary" => Ok(TranslationMode::Binary),
            "lf" => Ok(TranslationMode::Lf),
            "cr" => Ok(TranslationMode::Cr),
            "crlf" => Ok(TranslationMode::Crlf),
            "platform" => Ok(TranslationMode::Platform),
            other => Err(ChannelError::bad_value(
                "translation",
                format!(
                    "bad value \"{}\": should be one of auto, binary, cr, crlf, lf, or platform",
                    other
                ),
            )),
        }
    }
}

/// Input-side state that survives between calls.
///
/// Cloned by line reads so a failed attempt can restore it exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputState {
    /// `auto` mode produced `\n` for a `\r` at the end of the available
    /// data; a `\n` arriving next belongs to the same line ending.
    pub saw_cr: bool,
}

/// Receiver of translated units
pub trait Sink {
    fn push(&mut self, c: char);
}

/// Collects decoded characters
impl Sink for String {
    fn push(&mut self, c: char) {
        String::push(self, c);
    }
}

/// Collects bytes (identity decoding only ever yields U+0000..U+00FF)
pub struct ByteSink<'a>(pub &'a mut Vec<u8>);

impl Sink for ByteSink<'_> {
    fn push(&mut self, c: char) {
        self.0.push((u32::from(c) & 0xff) as u8);
    }
}

/// Why an input pass stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Requested number of units produced
    Limit,
    /// A line ending was produced and the pass was line-oriented
    Eol,
    /// The configured in-band EOF character was reached (not consumed)
    EofChar,
    /// Queue exhausted, or its tail is an incomplete sequence / held `\r`
    NeedData,
}

/// Result of one input pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    pub stop: Stop,
    pub produced: usize,
    /// Queue position just past the last consumed byte
    pub pos: QueuePos,
}

/// Per-pass input configuration
#[derive(Debug, Clone, Copy)]
pub struct InputSettings {
    pub encoding: Encoding,
    pub translation: Translation,
    pub eof_char: Option<u8>,
}

/// Translate queued raw bytes starting at `start` into `sink`.
///
/// `at_eof` tells the pass the transport reported end of file, so incomplete
/// sequences and a trailing `\r` are resolved instead of waiting for more.
pub fn translate_input<S: Sink>(
    queue: &BufferQueue,
    start: QueuePos,
    state: &mut InputState,
    settings: InputSettings,
    at_eof: bool,
    limit: usize,
    stop_at_eol: bool,
    sink: &mut S,
) -> Pass {
    let enc = settings.encoding;
    let eof_char = settings.eof_char.map(char::from);
    let mut cursor = QueueCursor::new(queue, start);
    let mut produced = 0;

    let stop = loop {
        if produced >= limit {
            break Stop::Limit;
        }
        let mark = cursor.position();
        let (c, used) = match enc.decode(&cursor, at_eof) {
            Decoded::Char(c, used) => (c, used),
            Decoded::Incomplete | Decoded::Empty => break Stop::NeedData,
        };
        if Some(c) == eof_char {
            break Stop::EofChar;
        }
        cursor.advance(used);

        let emitted = match settings.translation {
            Translation::Lf => c,
            Translation::Cr => {
                if c == '\r' {
                    '\n'
                } else {
                    c
                }
            }
            Translation::Crlf => {
                if c != '\r' {
                    c
                } else {
                    match enc.decode(&cursor, at_eof) {
                        Decoded::Char('\n', used) => {
                            cursor.advance(used);
                            '\n'
                        }
                        Decoded::Char(_, _) => '\r',
                        Decoded::Empty if at_eof => '\r',
                        Decoded::Incomplete | Decoded::Empty => {
                            // Cannot tell yet whether this \r starts a \r\n.
                            cursor.set_position(mark);
                            break Stop::NeedData;
                        }
                    }
                }
            }
            Translation::Auto => {
                if state.saw_cr && c == '\n' {
                    state.saw_cr = false;
                    continue;
                }
                state.saw_cr = false;
                if c == '\r' {
                    match enc.decode(&cursor, at_eof) {
                        Decoded::Char('\n', used) => cursor.advance(used),
                        Decoded::Char(_, _) => {}
                        Decoded::Incomplete | Decoded::Empty => state.saw_cr = !at_eof,
                    }
                    '\n'
                } else {
                    c
                }
            }
        };

        sink.push(emitted);
        produced += 1;
        if stop_at_eol && emitted == '\n' {
            break Stop::Eol;
        }
    };

    Pass {
        stop,
        produced,
        pos: cursor.position(),
    }
}

/// Append the external form of one application line ending
fn push_eol(translation: Translation, out: &mut Vec<u8>, enc: Encoding) -> Result<(), ChannelError> {
    match translation {
        Translation::Lf => enc.encode('\n', out),
        Translation::Cr => enc.encode('\r', out),
        Translation::Crlf => {
            enc.encode('\r', out);
            enc.encode('\n', out);
        }
        Translation::Auto => {
            return Err(ChannelError::Invalid(
                "output translation cannot be auto".to_string(),
            ))
        }
    }
    Ok(())
}

/// Translate a chunk of text: EOL first, then encoding.
///
/// Returns whether the chunk contained a newline.
pub fn translate_output_chars(
    text: &str,
    encoding: Encoding,
    translation: Translation,
    out: &mut Vec<u8>,
) -> Result<bool, ChannelError> {
    let mut newline = false;
    for c in text.chars() {
        if c == '\n' {
            newline = true;
            push_eol(translation, out, encoding)?;
        } else {
            encoding.encode(c, out);
        }
    }
    Ok(newline)
}

/// Translate a chunk of bytes: EOL only, no encoding.
pub fn translate_output_bytes(
    bytes: &[u8],
    translation: Translation,
    out: &mut Vec<u8>,
) -> Result<bool, ChannelError> {
    let mut newline = false;
    for &b in bytes {
        if b == b'\n' {
            newline = true;
            push_eol(translation, out, Encoding::Binary)?;
        } else {
            out.push(b);
        }
    }
    Ok(newline)
}

/// Longest prefix of `text` of at most `max` bytes ending on a char boundary
pub fn chunk_str(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    if end == 0 {
        // A single character longer than `max`; take it whole.
        let first = text.chars().next().map(char::len_utf8).unwrap_or(0);
        return &text[..first];
    }
    &text[..end]
}
