//! Channel configuration
//!
//! [`ChannelConfig`] is the serde-facing form of the core channel options.
//! Every field is optional; [`crate::Channel::apply_config`] validates the
//! whole set before changing anything.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::encoding::Encoding;
use crate::error::{ChannelError, Result};
use crate::translation::TranslationMode;

/// When queued output is handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Buffering {
    /// Only when a buffer fills up or on flush
    Full,
    /// Additionally after every newline
    Line,
    /// After every write
    None,
}

impl Buffering {
    pub fn name(self) -> &'static str {
        match self {
            Buffering::Full => "full",
            Buffering::Line => "line",
            Buffering::None => "none",
        }
    }
}

impl fmt::Display for Buffering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Buffering {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Buffering::Full),
            "line" => Ok(Buffering::Line),
            "none" => Ok(Buffering::None),
            other => Err(ChannelError::bad_value(
                "buffering",
                format!("bad value \"{}\": must be one of full, line, or none", other),
            )),
        }
    }
}

/// Core channel options, all optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    pub blocking: Option<bool>,
    pub buffering: Option<Buffering>,
    /// Clamped to the supported buffer size range
    pub buffer_size: Option<usize>,
    /// Encoding name; `"binary"` disables encoding
    pub encoding: Option<String>,
    /// Zero to two entries (read, write), `{}` for none
    pub eof_char: Option<String>,
    /// One or two entries (read, write)
    pub translation: Option<String>,
}

impl ChannelConfig {
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = Some(blocking);
        self
    }

    pub fn with_buffering(mut self, buffering: Buffering) -> Self {
        self.buffering = Some(buffering);
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn with_encoding(mut self, name: impl Into<String>) -> Self {
        self.encoding = Some(name.into());
        self
    }

    pub fn with_eof_char(mut self, value: impl Into<String>) -> Self {
        self.eof_char = Some(value.into());
        self
    }

    pub fn with_translation(mut self, value: impl Into<String>) -> Self {
        self.translation = Some(value.into());
        self
    }

    /// Parse every present field, failing on the first bad one
    pub(crate) fn plan(&self) -> Result<ConfigPlan> {
        Ok(ConfigPlan {
            blocking: self.blocking,
            buffering: self.buffering,
            buffer_size: self.buffer_size,
            encoding: self.encoding.as_deref().map(parse_encoding).transpose()?,
            eof_chars: self.eof_char.as_deref().map(parse_eof_chars).transpose()?,
            translation: self.translation.as_deref().map(parse_translation).transpose()?,
        })
    }
}

/// A validated [`ChannelConfig`], ready to apply
#[derive(Debug, Clone, Default)]
pub(crate) struct ConfigPlan {
    pub(crate) blocking: Option<bool>,
    pub(crate) buffering: Option<Buffering>,
    pub(crate) buffer_size: Option<usize>,
    pub(crate) encoding: Option<Encoding>,
    pub(crate) eof_chars: Option<Vec<Option<u8>>>,
    pub(crate) translation: Option<Vec<TranslationMode>>,
}

/// Split an option list; `{}` stands for an empty element.
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(|w| if w == "{}" { String::new() } else { w.to_string() })
        .collect()
}

pub(crate) fn parse_bool(option: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ChannelError::bad_value(
            option,
            format!("expected boolean value but got \"{}\"", value),
        )),
    }
}

pub(crate) fn parse_encoding(name: &str) -> Result<Encoding> {
    Encoding::lookup(name)
}

/// Zero to two entries; each is empty or one ASCII character other than NUL.
pub(crate) fn parse_eof_chars(value: &str) -> Result<Vec<Option<u8>>> {
    let entries = split_list(value);
    if entries.len() > 2 {
        return Err(ChannelError::bad_value(
            "eofchar",
            "bad value: should be a list of zero, one, or two elements",
        ));
    }
    entries
        .iter()
        .map(|entry| match entry.as_bytes() {
            [] => Ok(None),
            [b] if *b != 0 && b.is_ascii() => Ok(Some(*b)),
            _ => Err(ChannelError::bad_value(
                "eofchar",
                format!("bad value \"{}\": must be a single ASCII character", entry),
            )),
        })
        .collect()
}

/// One entry for both directions or two for (read, write)
pub(crate) fn parse_translation(value: &str) -> Result<Vec<TranslationMode>> {
    let entries = split_list(value);
    if entries.is_empty() || entries.len() > 2 {
        return Err(ChannelError::bad_value(
            "translation",
            "bad value: should be a list of one or two elements",
        ));
    }
    entries.iter().map(|e| e.parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let cfg: ChannelConfig = serde_json::from_str(
            r#"{"buffering": "line", "encoding": "iso8859-1", "translation": "lf crlf"}"#,
        )
        .unwrap();
        assert_eq!(cfg.buffering, Some(Buffering::Line));
        assert_eq!(cfg.blocking, None);
        let plan = cfg.plan().unwrap();
        assert_eq!(plan.encoding, Some(Encoding::Iso8859_1));
        assert_eq!(
            plan.translation,
            Some(vec![TranslationMode::Lf, TranslationMode::Crlf])
        );
    }

    #[test]
    fn test_config_rejects_unknown_field() {
        let parsed: std::result::Result<ChannelConfig, _> =
            serde_json::from_str(r#"{"buffersize": 10}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_builder_helpers() {
        let cfg = ChannelConfig::default()
            .with_blocking(false)
            .with_buffer_size(64)
            .with_eof_char("@");
        assert_eq!(cfg.blocking, Some(false));
        assert_eq!(cfg.buffer_size, Some(64));
        assert_eq!(cfg.plan().unwrap().eof_chars, Some(vec![Some(b'@')]));
    }

    #[test]
    fn test_plan_reports_first_bad_field() {
        let cfg = ChannelConfig::default().with_encoding("klingon");
        assert!(matches!(cfg.plan(), Err(ChannelError::UnknownEncoding { .. })));
    }

    #[test]
    fn test_eof_char_lists() {
        assert_eq!(parse_eof_chars("").unwrap(), Vec::<Option<u8>>::new());
        assert_eq!(parse_eof_chars("{} x").unwrap(), vec![None, Some(b'x')]);
        assert!(parse_eof_chars("ab").is_err());
        assert!(parse_eof_chars("a b c").is_err());
        assert!(parse_eof_chars("é").is_err());
    }

    #[test]
    fn test_translation_lists() {
        assert_eq!(parse_translation("auto").unwrap(), vec![TranslationMode::Auto]);
        assert!(parse_translation("").is_err());
        assert!(parse_translation("lf lf lf").is_err());
        assert!(parse_translation("dos").is_err());
    }

    #[test]
    fn test_bool_values() {
        assert!(parse_bool("blocking", "yes").unwrap());
        assert!(!parse_bool("blocking", "0").unwrap());
        assert!(parse_bool("blocking", "maybe").is_err());
    }

    #[test]
    fn test_buffering_parse() {
        assert_eq!("none".parse::<Buffering>().unwrap(), Buffering::None);
        assert!("some".parse::<Buffering>().is_err());
    }
}
