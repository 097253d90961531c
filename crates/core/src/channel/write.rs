//! Output side: translation into output buffers, queueing and flushing

use std::io;

use tracing::{debug, trace, warn};

use super::read::CopyChunk;
use super::{split_top, Channel, ChannelState, StateFlags};
use crate::buffer::{BufferRole, ChannelBuffer};
use crate::driver::Direction;
use crate::error::{ChannelError, Result};
use crate::notifier::WakerBase;
use crate::translation::{
    chunk_str, translate_output_bytes, translate_output_chars, CONVERT_CHUNK,
};

impl ChannelState {
    /// Move the partially filled output buffer onto the output queue
    pub(crate) fn queue_current(&mut self) {
        if let Some(buf) = self.cur_out.take() {
            if buf.is_empty() {
                self.recycle(buf);
            } else {
                self.out_queue.push_back(buf);
            }
        }
    }

    /// Spread translated bytes over output buffers.
    ///
    /// A buffer is queued when full, when line buffered and the chunk held a
    /// newline, or always when unbuffered. Bytes that do not fit carry over
    /// into the next buffer.
    fn emit(&mut self, mut bytes: &[u8], newline: bool) {
        while !bytes.is_empty() {
            let size = self.buffer_size;
            let pool = &mut self.pool;
            let cur = self
                .cur_out
                .get_or_insert_with(|| pool.allocate(BufferRole::Output, size));
            let taken = cur.append(bytes);
            bytes = &bytes[taken..];
            if cur.is_full() {
                self.queue_current();
            }
        }
        let flags = self.flags;
        if flags.contains(StateFlags::UNBUFFERED)
            || (newline && flags.contains(StateFlags::LINE_BUFFERED))
        {
            self.queue_current();
        }
    }

    /// Flush queued buffers unless a background flush already owns them
    fn flush_if_queued(&mut self, base: &WakerBase) -> Result<()> {
        if self.out_queue.is_empty() || self.flags.contains(StateFlags::BG_FLUSH_SCHEDULED) {
            return Ok(());
        }
        self.flush_channel(base, false)
    }

    pub(crate) fn write_bytes(&mut self, base: &WakerBase, bytes: &[u8]) -> Result<usize> {
        let translation = self.out_translation;
        let mut scratch = Vec::with_capacity(CONVERT_CHUNK * 2);
        for chunk in bytes.chunks(CONVERT_CHUNK) {
            scratch.clear();
            let newline = translate_output_bytes(chunk, translation, &mut scratch)?;
            self.emit(&scratch, newline);
        }
        self.flush_if_queued(base)?;
        Ok(bytes.len())
    }

    pub(crate) fn write_chars(&mut self, base: &WakerBase, text: &str) -> Result<usize> {
        let translation = self.out_translation;
        let encoding = self.encoding;
        let mut scratch = Vec::with_capacity(CONVERT_CHUNK * encoding.max_bytes_per_char() * 2);
        let mut rest = text;
        while !rest.is_empty() {
            let chunk = chunk_str(rest, CONVERT_CHUNK);
            rest = &rest[chunk.len()..];
            scratch.clear();
            let newline = translate_output_chars(chunk, encoding, translation, &mut scratch)?;
            self.emit(&scratch, newline);
        }
        self.flush_if_queued(base)?;
        Ok(text.len())
    }

    /// Hand queued output to the top layer.
    ///
    /// When the transport would block the remainder stays queued and a
    /// background flush is scheduled. Other errors drop the queued output;
    /// from the event loop (`from_async`) they are latched for the next
    /// synchronous call instead of being returned.
    pub(crate) fn flush_channel(&mut self, base: &WakerBase, from_async: bool) -> Result<()> {
        if !from_async && self.flags.contains(StateFlags::BG_FLUSH_SCHEDULED) {
            return Ok(());
        }
        let mut first_error: Option<ChannelError> = None;

        loop {
            let Some(front) = self.out_queue.front() else {
                break;
            };
            let (top, mut below) = split_top(&mut self.layers, base)?;
            let result = top.driver.output(&mut below, front.as_slice());

            match result {
                Ok(0) => {
                    first_error = Some(ChannelError::from_driver(io::Error::from(
                        io::ErrorKind::WriteZero,
                    )));
                }
                Ok(n) => {
                    let drained = match self.out_queue.front_mut() {
                        Some(front) => {
                            front.consume(n.min(front.len()));
                            front.is_empty()
                        }
                        None => false,
                    };
                    if drained {
                        if let Some(buf) = self.out_queue.pop_front() {
                            self.recycle(buf);
                        }
                    }
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = ChannelError::from_driver(e);
                    if err.is_would_block() {
                        if !self.flags.contains(StateFlags::BG_FLUSH_SCHEDULED) {
                            trace!(channel = %self.name, queued = self.out_queue.bytes(), "background flush scheduled");
                        }
                        self.flags.insert(StateFlags::BG_FLUSH_SCHEDULED);
                        break;
                    }
                    first_error = Some(err);
                }
            }

            // Unrecoverable: the queued output can never be delivered.
            let dropped: Vec<ChannelBuffer> = self.out_queue.drain().collect();
            for buf in dropped {
                self.recycle(buf);
            }
            break;
        }

        if self.out_queue.is_empty() {
            self.flags.remove(StateFlags::BG_FLUSH_SCHEDULED);
        }
        match first_error {
            None => Ok(()),
            Some(err) if from_async => {
                warn!(channel = %self.name, error = %err, "background flush failed");
                self.unreported_error.get_or_insert(err);
                Ok(())
            }
            Some(err) => {
                debug!(channel = %self.name, error = %err, "flush failed");
                Err(err)
            }
        }
    }

    /// Untranslated write straight to the top layer, after queued output
    pub(crate) fn write_raw(&mut self, base: &WakerBase, bytes: &[u8]) -> Result<usize> {
        self.queue_current();
        self.flush_channel(base, false)?;
        if !self.out_queue.is_empty() {
            return Err(ChannelError::WouldBlock);
        }
        let (top, mut below) = split_top(&mut self.layers, base)?;
        top.driver
            .output(&mut below, bytes)
            .map_err(ChannelError::from_driver)
    }
}

impl Channel {
    fn with_output<T>(&self, op: impl FnOnce(&mut ChannelState, &WakerBase) -> Result<T>) -> Result<T> {
        self.guard(Some(Direction::Write))?;
        let base = self.cell.base();
        let result = op(&mut self.cell.state.borrow_mut(), &base);
        self.cell.update_interest();
        result
    }

    /// Write bytes with end-of-line translation but no encoding.
    ///
    /// Returns the number of bytes accepted, which is always all of them:
    /// what the transport cannot take yet stays queued.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.with_output(|st, base| st.write_bytes(base, bytes))
    }

    /// Write text, translated and encoded with the channel's settings
    pub fn write_chars(&self, text: &str) -> Result<usize> {
        self.with_output(|st, base| st.write_chars(base, text))
    }

    pub fn write_raw(&self, bytes: &[u8]) -> Result<usize> {
        self.with_output(|st, base| st.write_raw(base, bytes))
    }

    /// Queue the partial output buffer and push everything to the transport.
    ///
    /// On a non-blocking channel output the transport refuses is left for
    /// the background flush.
    pub fn flush(&self) -> Result<()> {
        self.with_output(|st, base| {
            st.queue_current();
            st.flush_channel(base, false)
        })
    }

    pub(crate) fn write_for_copy(&self, chunk: &CopyChunk) -> Result<()> {
        self.cell.state.borrow_mut().check(Some(Direction::Write))?;
        let base = self.cell.base();
        let written = {
            let mut st = self.cell.state.borrow_mut();
            match chunk {
                CopyChunk::Bytes(b) => st.write_bytes(&base, b),
                CopyChunk::Text(t) => st.write_chars(&base, t),
            }
        };
        self.cell.update_interest();
        written.map(|_| ())
    }

    /// True while output waits for the transport in the background
    pub(crate) fn flush_pending(&self) -> bool {
        self.cell
            .state
            .borrow()
            .flags
            .contains(StateFlags::BG_FLUSH_SCHEDULED)
    }
}
