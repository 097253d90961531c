//! Input side: fetching from the top layer, line and bulk reads, push-back

use tracing::trace;

use super::{split_top, Channel, ChannelState, StateFlags};
use crate::buffer::{BufferRole, ChannelBuffer, QueuePos};
use crate::driver::Direction;
use crate::encoding::Encoding;
use crate::error::{ChannelError, Result};
use crate::notifier::WakerBase;
use crate::translation::{translate_input, ByteSink, InputSettings, InputState, Sink, Stop};

/// Outcome of asking the top layer for more input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fetch {
    Data,
    Eof,
    Blocked,
}

impl ChannelState {
    /// Forget per-call input conditions; sticky EOF survives.
    pub(crate) fn reset_read_flags(&mut self) {
        if !self.flags.contains(StateFlags::STICKY_EOF) {
            self.flags.remove(StateFlags::EOF);
        }
        self.flags
            .remove(StateFlags::BLOCKED | StateFlags::NEED_MORE_DATA);
    }

    fn input_settings(&self, decode: bool) -> InputSettings {
        InputSettings {
            encoding: if decode {
                self.encoding
            } else {
                Encoding::Binary
            },
            translation: self.in_translation,
            eof_char: self.in_eof_char,
        }
    }

    /// Read one chunk from the top layer into the input queue.
    ///
    /// Returns the byte count; zero means end of file.
    pub(crate) fn get_input(&mut self, base: &WakerBase) -> Result<usize> {
        if self.flags.contains(StateFlags::STICKY_EOF) {
            self.flags.insert(StateFlags::EOF);
            return Ok(0);
        }
        let size = self.buffer_size;
        let mut fresh: Option<ChannelBuffer> = None;
        let buf = match self.in_queue.back_mut() {
            Some(tail) if !tail.is_full() => tail,
            _ => fresh.insert(self.pool.allocate(BufferRole::Input, size)),
        };
        let requested = buf.space();
        let (top, mut below) = split_top(&mut self.layers, base)?;
        let result = top.driver.input(&mut below, buf.spare_mut());

        match result {
            Ok(0) => {
                self.flags.insert(StateFlags::EOF);
                if let Some(buf) = fresh {
                    self.recycle(buf);
                }
                trace!(channel = %self.name, "eof from transport");
                Ok(0)
            }
            Ok(n) => {
                buf.commit(n);
                if n < requested && self.flags.contains(StateFlags::NONBLOCKING) {
                    // Asking again right away would most likely block.
                    self.flags.insert(StateFlags::BLOCKED);
                }
                if let Some(buf) = fresh {
                    self.in_queue.push_back(buf);
                }
                Ok(n)
            }
            Err(e) => {
                if let Some(buf) = fresh {
                    self.recycle(buf);
                }
                let err = ChannelError::from_driver(e);
                if err.is_would_block() {
                    self.flags.insert(StateFlags::BLOCKED);
                    trace!(channel = %self.name, "input would block");
                }
                Err(err)
            }
        }
    }

    /// Fetch more input unless the channel already knows it would wait.
    pub(crate) fn fetch_input(&mut self, base: &WakerBase) -> Result<Fetch> {
        if self.flags.contains(StateFlags::BLOCKED) {
            if self.flags.contains(StateFlags::NONBLOCKING) {
                return Ok(Fetch::Blocked);
            }
            self.flags.remove(StateFlags::BLOCKED);
        }
        match self.get_input(base) {
            Ok(0) => Ok(Fetch::Eof),
            Ok(_) => Ok(Fetch::Data),
            Err(e) if e.is_would_block() => Ok(Fetch::Blocked),
            Err(e) => Err(e),
        }
    }

    /// Consume input up to `pos` and adopt the translation state reached there.
    fn commit_input(&mut self, pos: QueuePos, state: InputState) -> usize {
        let consumed = self.in_queue.bytes_before(pos);
        let mut drained = Vec::new();
        self.in_queue.consume_to(pos, |buf| drained.push(buf));
        for buf in drained {
            self.recycle(buf);
        }
        self.input_state = state;
        consumed
    }

    /// Read one line without its terminator.
    ///
    /// `None` means no complete line: either end of file (see the EOF flag)
    /// or, on a non-blocking channel, not enough data yet. In the latter case
    /// nothing is consumed and the decoder state is untouched.
    pub(crate) fn gets(&mut self, base: &WakerBase) -> Result<Option<String>> {
        self.reset_read_flags();
        let settings = self.input_settings(true);
        let mut state = self.input_state;
        let mut pos = QueuePos::default();
        let mut line = String::new();

        loop {
            let at_eof = self.flags.contains(StateFlags::EOF);
            let pass = translate_input(
                &self.in_queue,
                pos,
                &mut state,
                settings,
                at_eof,
                usize::MAX,
                true,
                &mut line,
            );
            pos = pass.pos;
            match pass.stop {
                Stop::Eol => {
                    line.pop();
                    self.commit_input(pos, state);
                    return Ok(Some(line));
                }
                Stop::EofChar => {
                    self.flags.insert(StateFlags::EOF | StateFlags::STICKY_EOF);
                    self.commit_input(pos, state);
                    return Ok(non_empty(line));
                }
                Stop::Limit | Stop::NeedData => {
                    if at_eof {
                        self.commit_input(pos, state);
                        return Ok(non_empty(line));
                    }
                    match self.fetch_input(base)? {
                        Fetch::Data | Fetch::Eof => continue,
                        Fetch::Blocked => {
                            self.flags.insert(StateFlags::NEED_MORE_DATA);
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Translate up to `limit` units into `sink`, fetching as needed.
    ///
    /// Returns (units produced, source bytes consumed). Blocking channels
    /// keep going until the limit or end of file; non-blocking ones stop at
    /// the first would-block.
    fn read_units<S: Sink>(
        &mut self,
        base: &WakerBase,
        decode: bool,
        limit: Option<usize>,
        sink: &mut S,
    ) -> Result<(usize, usize)> {
        let settings = self.input_settings(decode);
        let mut produced = 0;
        let mut consumed = 0;

        loop {
            let remaining = match limit {
                Some(n) if produced >= n => break,
                Some(n) => n - produced,
                None => usize::MAX,
            };
            let at_eof = self.flags.contains(StateFlags::EOF);
            let mut state = self.input_state;
            let pass = translate_input(
                &self.in_queue,
                QueuePos::default(),
                &mut state,
                settings,
                at_eof,
                remaining,
                false,
                sink,
            );
            consumed += self.commit_input(pass.pos, state);
            produced += pass.produced;

            match pass.stop {
                Stop::Limit => break,
                Stop::EofChar => {
                    self.flags.insert(StateFlags::EOF | StateFlags::STICKY_EOF);
                    break;
                }
                Stop::Eol | Stop::NeedData => {
                    if at_eof {
                        break;
                    }
                    match self.fetch_input(base) {
                        Ok(Fetch::Data) | Ok(Fetch::Eof) => continue,
                        Ok(Fetch::Blocked) => {
                            if !self.in_queue.is_empty() {
                                self.flags.insert(StateFlags::NEED_MORE_DATA);
                            }
                            break;
                        }
                        Err(err) if produced == 0 => return Err(err),
                        Err(err) => {
                            // Hand back what was read; the error surfaces next call.
                            self.unreported_error.get_or_insert(err);
                            break;
                        }
                    }
                }
            }
        }
        Ok((produced, consumed))
    }

    pub(crate) fn read_bytes(&mut self, base: &WakerBase, limit: Option<usize>) -> Result<Vec<u8>> {
        self.reset_read_flags();
        let hint = limit.unwrap_or(self.buffer_size).min(self.buffer_size * 4);
        let mut out = Vec::with_capacity(hint);
        self.read_units(base, false, limit, &mut ByteSink(&mut out))?;
        Ok(out)
    }

    pub(crate) fn read_chars(&mut self, base: &WakerBase, limit: Option<usize>) -> Result<String> {
        self.reset_read_flags();
        let source = self.in_queue.bytes().max(self.buffer_size);
        let mut estimate = (source as f64 * self.expansion).ceil() as usize;
        if let Some(n) = limit {
            estimate = estimate.min(n.saturating_mul(4));
        }
        let mut out = String::with_capacity(estimate);
        let initial = out.capacity();
        let (_, consumed) = self.read_units(base, true, limit, &mut out)?;
        if consumed > 0 {
            let measured = out.len() as f64 / consumed as f64;
            self.expansion = if out.len() > initial {
                measured
            } else {
                (self.expansion + measured) / 2.0
            }
            .clamp(0.25, 4.0);
        }
        Ok(out)
    }

    /// Untranslated read: queued input first, then the top layer directly.
    pub(crate) fn read_raw(&mut self, base: &WakerBase, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.in_queue.is_empty() {
            let mut drained = Vec::new();
            let n = self.in_queue.take_into(buf, |b| drained.push(b));
            for b in drained {
                self.recycle(b);
            }
            return Ok(n);
        }
        let (top, mut below) = split_top(&mut self.layers, base)?;
        match top.driver.input(&mut below, buf) {
            Ok(0) => {
                self.flags.insert(StateFlags::EOF);
                Ok(0)
            }
            Ok(n) => {
                self.flags.remove(StateFlags::BLOCKED);
                Ok(n)
            }
            Err(e) => {
                let err = ChannelError::from_driver(e);
                if err.is_would_block() {
                    self.flags.insert(StateFlags::BLOCKED);
                }
                Err(err)
            }
        }
    }

    /// Push raw bytes back into the input queue.
    ///
    /// A no-op once the in-band EOF character has been seen.
    pub(crate) fn ungets(&mut self, bytes: &[u8], at_tail: bool) -> usize {
        if self.flags.contains(StateFlags::STICKY_EOF) {
            return 0;
        }
        self.flags
            .remove(StateFlags::BLOCKED | StateFlags::EOF | StateFlags::NEED_MORE_DATA);
        if bytes.is_empty() {
            return 0;
        }
        let buf = ChannelBuffer::from_slice(bytes);
        if at_tail {
            self.in_queue.push_back(buf);
        } else {
            self.in_queue.push_front(buf);
        }
        bytes.len()
    }
}

fn non_empty(line: String) -> Option<String> {
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

impl Channel {
    fn with_input<T>(&self, op: impl FnOnce(&mut ChannelState, &WakerBase) -> Result<T>) -> Result<T> {
        self.guard(Some(Direction::Read))?;
        let base = self.cell.base();
        let result = op(&mut self.cell.state.borrow_mut(), &base);
        self.cell.update_interest();
        result
    }

    /// Read one line, without its line ending.
    ///
    /// Returns `Ok(None)` at end of file, or on a non-blocking channel when
    /// no complete line is available yet (check [`Channel::is_eof`] and
    /// [`Channel::is_blocked`]). In the second case the channel is left
    /// exactly as it was.
    pub fn gets(&self) -> Result<Option<String>> {
        self.with_input(|st, base| st.gets(base))
    }

    /// Read up to `max` bytes with end-of-line translation but no decoding
    pub fn read(&self, max: usize) -> Result<Vec<u8>> {
        self.with_input(|st, base| st.read_bytes(base, Some(max)))
    }

    /// Read bytes until end of file (or until the channel would block)
    pub fn read_to_end(&self) -> Result<Vec<u8>> {
        self.with_input(|st, base| st.read_bytes(base, None))
    }

    /// Read up to `max` characters, decoded with the channel encoding
    pub fn read_chars(&self, max: usize) -> Result<String> {
        self.with_input(|st, base| st.read_chars(base, Some(max)))
    }

    pub fn read_chars_to_end(&self) -> Result<String> {
        self.with_input(|st, base| st.read_chars(base, None))
    }

    /// Read bytes bypassing translation; pushed-back input is served first
    pub fn read_raw(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_input(|st, base| st.read_raw(base, buf))
    }

    /// Return bytes to the input queue, at the head or after everything queued
    pub fn ungets(&self, bytes: &[u8], at_tail: bool) -> Result<usize> {
        self.with_input(|st, _| Ok(st.ungets(bytes, at_tail)))
    }

    pub(crate) fn read_for_copy(&self, max: usize, decode: bool) -> Result<CopyChunk> {
        self.cell.state.borrow_mut().check(Some(Direction::Read))?;
        let base = self.cell.base();
        let chunk = {
            let mut st = self.cell.state.borrow_mut();
            if decode {
                st.read_chars(&base, Some(max)).map(CopyChunk::Text)
            } else {
                st.read_bytes(&base, Some(max)).map(CopyChunk::Bytes)
            }
        };
        self.cell.update_interest();
        chunk
    }
}

/// One unit of transfer for the copy engine
pub(crate) enum CopyChunk {
    Bytes(Vec<u8>),
    Text(String),
}

impl CopyChunk {
    pub(crate) fn is_empty(&self) -> bool {
        match self {
            CopyChunk::Bytes(b) => b.is_empty(),
            CopyChunk::Text(t) => t.is_empty(),
        }
    }

    /// Size in the copy's units: bytes, or characters on the decoding path
    pub(crate) fn units(&self) -> usize {
        match self {
            CopyChunk::Bytes(b) => b.len(),
            CopyChunk::Text(t) => t.chars().count(),
        }
    }
}
