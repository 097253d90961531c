//! Channel options: the core set, driver delegation and bulk configuration

use tracing::debug;

use super::{split_layer, split_top, Channel, ChannelState, StateFlags};
use super::{MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::config::{
    parse_bool, parse_encoding, parse_eof_chars, parse_translation, Buffering, ChannelConfig,
    ConfigPlan,
};
use crate::driver::Interest;
use crate::encoding::Encoding;
use crate::error::{ChannelError, Result};
use crate::notifier::WakerBase;
use crate::translation::{Translation, TranslationMode};

/// Options every channel understands, in listing order
pub const CORE_OPTIONS: [&str; 6] = [
    "blocking",
    "buffering",
    "buffersize",
    "encoding",
    "eofchar",
    "translation",
];

fn eof_entry(c: Option<u8>, in_list: bool) -> String {
    match c {
        Some(b) => char::from(b).to_string(),
        None if in_list => "{}".to_string(),
        None => String::new(),
    }
}

impl ChannelState {
    /// Switch every layer's transport between blocking and non-blocking
    pub(crate) fn set_blocking_layers(&mut self, base: &WakerBase, blocking: bool) -> Result<()> {
        for idx in (0..self.layers.len()).rev() {
            if let Some((layer, mut below)) = split_layer(&mut self.layers, idx, base) {
                layer
                    .driver
                    .set_blocking(&mut below, blocking)
                    .map_err(ChannelError::from_driver)?;
            }
        }
        if blocking {
            self.flags.remove(StateFlags::NONBLOCKING);
        } else {
            self.flags.insert(StateFlags::NONBLOCKING);
        }
        Ok(())
    }

    /// Change blocking mode; going blocking drains a pending background flush
    pub(crate) fn set_blocking_mode(&mut self, base: &WakerBase, blocking: bool) -> Result<()> {
        if blocking != self.flags.contains(StateFlags::NONBLOCKING) {
            return Ok(());
        }
        self.set_blocking_layers(base, blocking)?;
        if blocking && self.flags.contains(StateFlags::BG_FLUSH_SCHEDULED) {
            self.flags.remove(StateFlags::BG_FLUSH_SCHEDULED);
            self.flush_channel(base, false)?;
        }
        Ok(())
    }

    pub(crate) fn buffering(&self) -> Buffering {
        if self.flags.contains(StateFlags::UNBUFFERED) {
            Buffering::None
        } else if self.flags.contains(StateFlags::LINE_BUFFERED) {
            Buffering::Line
        } else {
            Buffering::Full
        }
    }

    pub(crate) fn set_buffering(&mut self, buffering: Buffering) {
        self.flags
            .remove(StateFlags::LINE_BUFFERED | StateFlags::UNBUFFERED);
        match buffering {
            Buffering::Full => {}
            Buffering::Line => self.flags.insert(StateFlags::LINE_BUFFERED),
            Buffering::None => self.flags.insert(StateFlags::UNBUFFERED),
        }
    }

    /// New size applies to buffers allocated from now on
    pub(crate) fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
        self.pool.clear();
    }

    /// Binary encoding also resets translation and EOF characters.
    pub(crate) fn set_encoding(&mut self, encoding: Encoding) {
        if encoding.is_binary() {
            self.in_translation = Translation::Lf;
            self.out_translation = Translation::Lf;
            self.in_eof_char = None;
            self.out_eof_char = None;
            self.input_state.saw_cr = false;
        }
        if encoding != self.encoding {
            self.encoding = encoding;
            self.flags.remove(StateFlags::NEED_MORE_DATA);
        }
    }

    /// Apply one entry to every open direction, or (read, write) pairs.
    pub(crate) fn apply_translation(&mut self, entries: &[TranslationMode]) {
        let mode = self.mode();
        let (read, write) = match entries {
            [one] => (Some(*one), Some(*one)),
            [r, w] => (Some(*r), Some(*w)),
            _ => (None, None),
        };
        let read = read.filter(|_| mode.contains(Interest::READABLE));
        let write = write.filter(|_| mode.contains(Interest::WRITABLE));

        let binary = [read, write]
            .iter()
            .any(|m| *m == Some(TranslationMode::Binary));
        if binary {
            self.encoding = Encoding::Binary;
            self.in_eof_char = None;
            self.out_eof_char = None;
        }
        if let Some(m) = read {
            let t = m.for_input();
            if t != self.in_translation {
                self.in_translation = t;
                self.input_state.saw_cr = false;
                self.flags.remove(StateFlags::NEED_MORE_DATA);
            }
        }
        if let Some(m) = write {
            self.out_translation = m.for_output();
        }
    }

    pub(crate) fn apply_eof_chars(&mut self, entries: &[Option<u8>]) {
        let mode = self.mode();
        let (read, write) = match entries {
            [] => (None, None),
            [one] => (*one, *one),
            [r, w, ..] => (*r, *w),
        };
        if mode.contains(Interest::READABLE) {
            self.in_eof_char = read;
        }
        if mode.contains(Interest::WRITABLE) {
            self.out_eof_char = write;
        }
    }

    fn translation_name(&self, t: Translation) -> &'static str {
        if t == Translation::Lf && self.encoding.is_binary() {
            "binary"
        } else {
            t.name()
        }
    }

    fn core_option(&self, name: &str) -> Option<String> {
        let mode = self.mode();
        let both = mode.contains(Interest::READABLE | Interest::WRITABLE);
        let value = match name {
            "blocking" => {
                if self.flags.contains(StateFlags::NONBLOCKING) {
                    "0".to_string()
                } else {
                    "1".to_string()
                }
            }
            "buffering" => self.buffering().name().to_string(),
            "buffersize" => self.buffer_size.to_string(),
            "encoding" => self.encoding.name().to_string(),
            "eofchar" => {
                if both {
                    format!(
                        "{} {}",
                        eof_entry(self.in_eof_char, true),
                        eof_entry(self.out_eof_char, true)
                    )
                } else if mode.contains(Interest::READABLE) {
                    eof_entry(self.in_eof_char, false)
                } else {
                    eof_entry(self.out_eof_char, false)
                }
            }
            "translation" => {
                let input = self.translation_name(self.in_translation);
                let output = self.translation_name(self.out_translation);
                if both {
                    format!("{} {}", input, output)
                } else if mode.contains(Interest::READABLE) {
                    input.to_string()
                } else {
                    output.to_string()
                }
            }
            _ => return None,
        };
        Some(value)
    }

    /// Returns false when `name` is not a core option
    fn set_core_option(&mut self, base: &WakerBase, name: &str, value: &str) -> Result<bool> {
        match name {
            "blocking" => {
                let blocking = parse_bool(name, value)?;
                self.set_blocking_mode(base, blocking)?;
            }
            "buffering" => self.set_buffering(value.parse()?),
            "buffersize" => {
                let size: i64 = value.trim().parse().map_err(|_| {
                    ChannelError::bad_value(name, format!("expected integer but got \"{}\"", value))
                })?;
                self.set_buffer_size(usize::try_from(size.max(0)).unwrap_or(MAX_BUFFER_SIZE));
            }
            "encoding" => self.set_encoding(parse_encoding(value)?),
            "eofchar" => {
                let entries = parse_eof_chars(value)?;
                self.apply_eof_chars(&entries);
            }
            "translation" => {
                let entries = parse_translation(value)?;
                self.apply_translation(&entries);
            }
            _ => return Ok(false),
        }
        debug!(channel = %self.name, option = name, value, "option set");
        Ok(true)
    }

    /// Unknown-option error listing the core names plus the top driver's
    fn unknown_option(&mut self, base: &WakerBase, name: &str) -> ChannelError {
        let driver_names: Vec<String> = match split_top(&mut self.layers, base) {
            Ok((top, mut below)) => top
                .driver
                .options(&mut below)
                .into_iter()
                .map(|(n, _)| n)
                .collect(),
            Err(_) => Vec::new(),
        };
        let mut known: Vec<&str> = CORE_OPTIONS.to_vec();
        known.extend(driver_names.iter().map(String::as_str));
        ChannelError::unknown_option(name, &known)
    }

    fn apply_plan(&mut self, base: &WakerBase, plan: &ConfigPlan) -> Result<()> {
        if let Some(size) = plan.buffer_size {
            self.set_buffer_size(size);
        }
        if let Some(b) = plan.buffering {
            self.set_buffering(b);
        }
        if let Some(enc) = plan.encoding {
            self.set_encoding(enc);
        }
        if let Some(entries) = &plan.translation {
            self.apply_translation(entries);
        }
        if let Some(entries) = &plan.eof_chars {
            self.apply_eof_chars(entries);
        }
        if let Some(blocking) = plan.blocking {
            self.set_blocking_mode(base, blocking)?;
        }
        Ok(())
    }
}

impl Channel {
    /// Read one option; unknown names are passed to the top driver
    pub fn get_option(&self, name: &str) -> Result<String> {
        self.cell.state.borrow_mut().check(None)?;
        let key = name.trim_start_matches('-');
        let base = self.cell.base();
        let mut guard = self.cell.state.borrow_mut();
        let st = &mut *guard;
        if let Some(value) = st.core_option(key) {
            return Ok(value);
        }
        let (top, mut below) = split_top(&mut st.layers, &base)?;
        match top.driver.get_option(&mut below, name) {
            Err(ChannelError::UnknownOption { .. }) => Err(st.unknown_option(&base, name)),
            other => other,
        }
    }

    /// Change one option; unknown names are passed to the top driver
    pub fn set_option(&self, name: &str, value: &str) -> Result<()> {
        self.guard(None)?;
        let key = name.trim_start_matches('-');
        let base = self.cell.base();
        let result = {
            let mut guard = self.cell.state.borrow_mut();
            let st = &mut *guard;
            match st.set_core_option(&base, key, value) {
                Ok(true) => Ok(()),
                Ok(false) => {
                    let (top, mut below) = split_top(&mut st.layers, &base)?;
                    match top.driver.set_option(&mut below, name, value) {
                        Err(ChannelError::UnknownOption { .. }) => Err(st.unknown_option(&base, name)),
                        other => other,
                    }
                }
                Err(err) => Err(err),
            }
        };
        self.cell.update_interest();
        result
    }

    /// Every option as (name, value): the core set first, then the driver's
    pub fn options(&self) -> Result<Vec<(String, String)>> {
        self.cell.state.borrow_mut().check(None)?;
        let base = self.cell.base();
        let mut guard = self.cell.state.borrow_mut();
        let st = &mut *guard;
        let mut all: Vec<(String, String)> = CORE_OPTIONS
            .iter()
            .filter_map(|n| st.core_option(n).map(|v| (n.to_string(), v)))
            .collect();
        if let Ok((top, mut below)) = split_top(&mut st.layers, &base) {
            all.extend(top.driver.options(&mut below));
        }
        Ok(all)
    }

    /// Apply a whole configuration; nothing changes if any field is invalid
    pub fn apply_config(&self, config: &ChannelConfig) -> Result<()> {
        self.guard(None)?;
        let plan = config.plan()?;
        let base = self.cell.base();
        let result = self.cell.state.borrow_mut().apply_plan(&base, &plan);
        self.cell.update_interest();
        result
    }

    pub fn encoding(&self) -> Encoding {
        self.cell.state.borrow().encoding
    }

    pub fn set_encoding(&self, encoding: Encoding) -> Result<()> {
        self.guard(None)?;
        self.cell.state.borrow_mut().set_encoding(encoding);
        Ok(())
    }

    /// Effective (input, output) end-of-line translation
    pub fn translation(&self) -> (Translation, Translation) {
        let st = self.cell.state.borrow();
        (st.in_translation, st.out_translation)
    }

    pub fn set_translation(&self, mode: TranslationMode) -> Result<()> {
        self.guard(None)?;
        self.cell.state.borrow_mut().apply_translation(&[mode]);
        Ok(())
    }

    pub fn buffering(&self) -> Buffering {
        self.cell.state.borrow().buffering()
    }

    pub fn set_buffering(&self, buffering: Buffering) -> Result<()> {
        self.guard(None)?;
        self.cell.state.borrow_mut().set_buffering(buffering);
        Ok(())
    }

    pub fn buffer_size(&self) -> usize {
        self.cell.state.borrow().buffer_size
    }

    pub fn is_blocking(&self) -> bool {
        !self
            .cell
            .state
            .borrow()
            .flags
            .contains(StateFlags::NONBLOCKING)
    }

    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        self.guard(None)?;
        let base = self.cell.base();
        let result = self.cell.state.borrow_mut().set_blocking_mode(&base, blocking);
        self.cell.update_interest();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::runtime::Runtime;

    fn rw_channel(rt: &Runtime) -> Channel {
        rt.create_channel(
            MemoryDriver::empty(),
            "mem0",
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    #[test]
    fn test_default_option_values() {
        let rt = Runtime::new();
        let ch = rw_channel(&rt);
        assert_eq!(ch.get_option("blocking").unwrap(), "1");
        assert_eq!(ch.get_option("-buffering").unwrap(), "full");
        assert_eq!(ch.get_option("buffersize").unwrap(), "4096");
        assert_eq!(ch.get_option("encoding").unwrap(), "utf-8");
        assert_eq!(ch.get_option("eofchar").unwrap(), "{} {}");
        assert_eq!(
            ch.get_option("translation").unwrap(),
            format!("auto {}", Translation::platform().name())
        );
    }

    #[test]
    fn test_buffersize_is_clamped() {
        let rt = Runtime::new();
        let ch = rw_channel(&rt);
        ch.set_option("buffersize", "1").unwrap();
        assert_eq!(ch.buffer_size(), MIN_BUFFER_SIZE);
        ch.set_option("-buffersize", "99999999").unwrap();
        assert_eq!(ch.buffer_size(), MAX_BUFFER_SIZE);
        assert!(matches!(
            ch.set_option("buffersize", "big"),
            Err(ChannelError::BadOptionValue { .. })
        ));
    }

    #[test]
    fn test_binary_encoding_resets_related_options() {
        let rt = Runtime::new();
        let ch = rw_channel(&rt);
        ch.set_option("eofchar", "x").unwrap();
        ch.set_option("translation", "crlf").unwrap();
        ch.set_option("encoding", "binary").unwrap();
        assert_eq!(ch.get_option("eofchar").unwrap(), "{} {}");
        assert_eq!(ch.get_option("translation").unwrap(), "binary binary");
        assert_eq!(ch.translation(), (Translation::Lf, Translation::Lf));
    }

    #[test]
    fn test_binary_translation_sets_encoding() {
        let rt = Runtime::new();
        let ch = rw_channel(&rt);
        ch.set_option("eofchar", "x y").unwrap();
        ch.set_option("translation", "binary").unwrap();
        assert_eq!(ch.encoding(), Encoding::Binary);
        assert_eq!(ch.get_option("eofchar").unwrap(), "{} {}");
    }

    #[test]
    fn test_translation_pair_and_single_direction() {
        let rt = Runtime::new();
        let ch = rw_channel(&rt);
        ch.set_option("translation", "cr crlf").unwrap();
        assert_eq!(ch.translation(), (Translation::Cr, Translation::Crlf));
        assert_eq!(ch.get_option("translation").unwrap(), "cr crlf");

        let ro = rt.create_channel(MemoryDriver::empty(), "mem1", Interest::READABLE);
        ro.set_option("translation", "lf crlf").unwrap();
        assert_eq!(ro.get_option("translation").unwrap(), "lf");
        ro.set_option("eofchar", "q").unwrap();
        assert_eq!(ro.get_option("eofchar").unwrap(), "q");
    }

    #[test]
    fn test_output_auto_means_platform() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::empty(), "mem0", Interest::WRITABLE);
        ch.set_option("translation", "auto").unwrap();
        assert_eq!(ch.translation().1, Translation::platform());
    }

    #[test]
    fn test_unknown_option_lists_core_and_driver_names() {
        let rt = Runtime::new();
        let ch = rw_channel(&rt);
        let err = ch.get_option("-colour").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("-blocking"), "{}", text);
        assert!(text.contains("-burst"), "{}", text);
        assert!(matches!(
            ch.set_option("colour", "red"),
            Err(ChannelError::UnknownOption { .. })
        ));
    }

    #[test]
    fn test_driver_option_delegated() {
        let rt = Runtime::new();
        let ch = rw_channel(&rt);
        ch.set_option("-burst", "3").unwrap();
        assert_eq!(ch.get_option("burst").unwrap(), "3");
        let all = ch.options().unwrap();
        assert_eq!(all.len(), CORE_OPTIONS.len() + 1);
        assert_eq!(all[0].0, "blocking");
        assert_eq!(all.last().unwrap(), &("burst".to_string(), "3".to_string()));
    }

    #[test]
    fn test_blocking_flag_reaches_driver() {
        let rt = Runtime::new();
        let drv = MemoryDriver::empty();
        let handle = drv.handle();
        let ch = rt.create_channel(drv, "mem0", Interest::READABLE);
        ch.set_option("blocking", "no").unwrap();
        assert!(!ch.is_blocking());
        assert!(handle.is_nonblocking());
        ch.set_blocking(true).unwrap();
        assert!(!handle.is_nonblocking());
    }

    #[test]
    fn test_apply_config_is_all_or_nothing() {
        let rt = Runtime::new();
        let ch = rw_channel(&rt);
        let bad = ChannelConfig::default()
            .with_buffering(Buffering::Line)
            .with_encoding("no-such-encoding");
        assert!(matches!(
            ch.apply_config(&bad),
            Err(ChannelError::UnknownEncoding { .. })
        ));
        assert_eq!(ch.buffering(), Buffering::Full);

        let good = ChannelConfig::default()
            .with_buffering(Buffering::None)
            .with_buffer_size(128)
            .with_encoding("ascii")
            .with_translation("lf");
        ch.apply_config(&good).unwrap();
        assert_eq!(ch.buffering(), Buffering::None);
        assert_eq!(ch.buffer_size(), 128);
        assert_eq!(ch.encoding(), Encoding::Ascii);
        assert_eq!(ch.translation(), (Translation::Lf, Translation::Lf));
    }

    #[test]
    fn test_bad_eofchar_rejected() {
        let rt = Runtime::new();
        let ch = rw_channel(&rt);
        assert!(ch.set_option("eofchar", "ab").is_err());
        assert_eq!(ch.get_option("eofchar").unwrap(), "{} {}");
    }
}
