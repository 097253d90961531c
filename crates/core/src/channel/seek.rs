//! Seek and tell

use tracing::trace;

use super::{split_top, Channel, ChannelState, StateFlags};
use crate::driver::{seek_layer, SeekMode};
use crate::error::{ChannelError, Result};
use crate::notifier::WakerBase;
use crate::translation::InputState;

impl ChannelState {
    fn transport_position(&mut self, base: &WakerBase) -> Result<i64> {
        let (top, mut below) = split_top(&mut self.layers, base)?;
        seek_layer(top, &mut below, 0, SeekMode::Current)
    }

    pub(crate) fn seek(&mut self, base: &WakerBase, offset: i64, mode: SeekMode) -> Result<i64> {
        let in_buffered = self.input_buffered();
        if in_buffered > 0 && self.output_buffered() > 0 {
            return Err(ChannelError::Invalid(
                "input and output both buffered; position is undefined".to_string(),
            ));
        }
        // Check seekability before discarding anything so a non-seekable channel keeps its input.
        self.transport_position(base)?;

        let offset = match mode {
            SeekMode::Current => offset - in_buffered as i64,
            _ => offset,
        };
        self.discard_input();
        self.flags.remove(
            StateFlags::EOF
                | StateFlags::STICKY_EOF
                | StateFlags::BLOCKED
                | StateFlags::NEED_MORE_DATA,
        );
        self.input_state = InputState::default();

        let was_nonblocking = self.flags.contains(StateFlags::NONBLOCKING);
        if was_nonblocking {
            self.set_blocking_layers(base, true)?;
            self.flags.remove(StateFlags::BG_FLUSH_SCHEDULED);
        }
        self.queue_current();
        let result = self.flush_channel(base, false).and_then(|_| {
            let (top, mut below) = split_top(&mut self.layers, base)?;
            seek_layer(top, &mut below, offset, mode)
        });
        if was_nonblocking {
            self.set_blocking_layers(base, false)?;
        }
        if let Ok(pos) = result {
            trace!(channel = %self.name, pos, "seek");
        }
        result
    }

    /// Application-visible position: transport position corrected for queued data
    pub(crate) fn tell(&mut self, base: &WakerBase) -> Result<i64> {
        let in_buffered = self.input_buffered() as i64;
        let out_buffered = self.output_buffered() as i64;
        if in_buffered > 0 && out_buffered > 0 {
            return Err(ChannelError::Invalid(
                "input and output both buffered; position is undefined".to_string(),
            ));
        }
        let pos = self.transport_position(base)?;
        Ok(pos - in_buffered + out_buffered)
    }
}

impl Channel {
    /// Move the access position.
    ///
    /// Queued input is discarded, queued output flushed, and every EOF
    /// condition cleared, including the one latched by an EOF character.
    pub fn seek(&self, offset: i64, mode: SeekMode) -> Result<i64> {
        self.guard(None)?;
        let base = self.cell.base();
        let result = self.cell.state.borrow_mut().seek(&base, offset, mode);
        self.cell.update_interest();
        result
    }

    pub fn tell(&self) -> Result<i64> {
        self.guard(None)?;
        let base = self.cell.base();
        let pos = self.cell.state.borrow_mut().tell(&base)?;
        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use crate::driver::{pipe, DriverVersion, Interest, MemoryDriver, SeekMode};
    use crate::error::ChannelError;
    use crate::runtime::Runtime;

    fn rw() -> Interest {
        Interest::READABLE | Interest::WRITABLE
    }

    #[test]
    fn test_tell_accounts_for_queued_input() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::new(b"line1\nline2\n".to_vec()), "mem0", rw());
        assert_eq!(ch.gets().unwrap().as_deref(), Some("line1"));
        assert_eq!(ch.tell().unwrap(), 6);
        assert_eq!(ch.seek(0, SeekMode::Current).unwrap(), 6);
        assert_eq!(ch.input_buffered(), 0);
        assert_eq!(ch.gets().unwrap().as_deref(), Some("line2"));
    }

    #[test]
    fn test_tell_accounts_for_queued_output() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::empty(), "mem0", Interest::WRITABLE);
        ch.write(b"abc").unwrap();
        assert_eq!(ch.tell().unwrap(), 3);
        assert_eq!(ch.seek(1, SeekMode::Start).unwrap(), 1);
        ch.write(b"X").unwrap();
        ch.flush().unwrap();
        assert_eq!(ch.tell().unwrap(), 2);
    }

    #[test]
    fn test_seek_clears_eof() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::new(b"abc".to_vec()), "mem0", rw());
        assert_eq!(ch.read_to_end().unwrap(), b"abc");
        assert!(ch.is_eof());
        ch.seek(-2, SeekMode::End).unwrap();
        assert!(!ch.is_eof());
        assert_eq!(ch.read_to_end().unwrap(), b"bc");
    }

    #[test]
    fn test_pipe_not_seekable_keeps_input() {
        let rt = Runtime::new();
        let (a, b) = pipe(None);
        let rd = rt.create_channel(a, "r", Interest::READABLE);
        let wr = rt.create_channel(b, "w", Interest::WRITABLE);
        wr.write(b"x\ny\n").unwrap();
        wr.flush().unwrap();
        assert_eq!(rd.gets().unwrap().as_deref(), Some("x"));
        assert!(matches!(
            rd.seek(0, SeekMode::Start),
            Err(ChannelError::NotSeekable(_))
        ));
        assert_eq!(rd.gets().unwrap().as_deref(), Some("y"));
    }

    #[test]
    fn test_narrow_driver_overflow() {
        let rt = Runtime::new();
        let drv = MemoryDriver::new(b"abc".to_vec()).with_version(DriverVersion::V1);
        let ch = rt.create_channel(drv, "mem0", rw());
        assert!(matches!(
            ch.seek(i64::from(i32::MAX) + 10, SeekMode::Start),
            Err(ChannelError::Overflow(_))
        ));
        assert_eq!(ch.seek(1, SeekMode::Start).unwrap(), 1);
    }

    #[test]
    fn test_seek_restores_nonblocking() {
        let rt = Runtime::new();
        let drv = MemoryDriver::new(b"abc".to_vec());
        let handle = drv.handle();
        let ch = rt.create_channel(drv, "mem0", rw());
        ch.set_blocking(false).unwrap();
        ch.seek(1, SeekMode::Start).unwrap();
        assert!(!ch.is_blocking());
        assert!(handle.is_nonblocking());
    }
}
