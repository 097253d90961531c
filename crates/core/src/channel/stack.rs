//! Pushing and popping transformation layers

use tracing::debug;

use super::{split_top, Channel, ChannelState, StateFlags};
use crate::buffer::{BufferQueue, ChannelBuffer};
use crate::driver::{Below, ChannelDriver, Interest, Layer};
use crate::error::{ChannelError, Result};
use crate::notifier::WakerBase;
use crate::translation::InputState;

impl ChannelState {
    /// Flush before the stack changes shape; untransformed output must not
    /// slip through (or around) a layer.
    fn drain_output_for_restack(&mut self, base: &WakerBase) -> Result<()> {
        if !self.mode().contains(Interest::WRITABLE) {
            return Ok(());
        }
        self.queue_current();
        self.flush_channel(base, false)?;
        if self.output_buffered() > 0 {
            return Err(ChannelError::Invalid(format!(
                "could not flush channel \"{}\"",
                self.name
            )));
        }
        Ok(())
    }

    fn reset_input_conditions(&mut self) {
        self.input_state = InputState::default();
        self.flags.remove(
            StateFlags::EOF
                | StateFlags::STICKY_EOF
                | StateFlags::BLOCKED
                | StateFlags::NEED_MORE_DATA,
        );
    }
}

impl Channel {
    /// Push a transformation layer on top of the channel.
    ///
    /// `mask` limits the directions the new layer handles; it is narrowed to
    /// what the current top supports. Input already queued moves below the
    /// new layer so it is read through it.
    pub fn stack(&self, driver: impl ChannelDriver + 'static, mask: Interest) -> Result<()> {
        self.stack_boxed(Box::new(driver), mask)
    }

    pub fn stack_boxed(&self, driver: Box<dyn ChannelDriver>, mask: Interest) -> Result<()> {
        self.guard(None)?;
        let base = self.cell.base();
        {
            let mut guard = self.cell.state.borrow_mut();
            let st = &mut *guard;
            let mode = st.mode() & mask & (Interest::READABLE | Interest::WRITABLE);
            if mode.is_empty() {
                return Err(ChannelError::Invalid(format!(
                    "reading and writing both disallowed for channel \"{}\"",
                    st.name
                )));
            }
            st.drain_output_for_restack(&base)?;

            let mut queued = std::mem::replace(&mut st.in_queue, BufferQueue::new());
            if let Some(old_top) = st.layers.last_mut() {
                old_top.unread.append(&mut queued);
            }
            st.input_state = InputState::default();
            st.flags
                .remove(StateFlags::BLOCKED | StateFlags::NEED_MORE_DATA);

            let type_name = driver.type_name().to_string();
            st.layers.push(Layer::new(driver, mode));
            if st.flags.contains(StateFlags::NONBLOCKING) {
                let (top, mut below) = split_top(&mut st.layers, &base)?;
                top.driver
                    .set_blocking(&mut below, false)
                    .map_err(ChannelError::from_driver)?;
            }
            debug!(channel = %st.name, layer = %type_name, depth = st.layers.len(), "layer stacked");
        }
        self.cell.update_interest();
        Ok(())
    }

    /// Pop the top layer; on an unstacked channel this closes it.
    ///
    /// Output is flushed through the layer first. Input the layer already
    /// produced is dropped; bytes beneath it that it never consumed become
    /// the channel's input again.
    pub fn unstack(&self) -> Result<()> {
        self.guard(None)?;
        if self.stack_depth() <= 1 {
            return self.close();
        }
        let base = self.cell.base();
        let result = {
            let mut guard = self.cell.state.borrow_mut();
            let st = &mut *guard;
            st.drain_output_for_restack(&base)?;
            st.discard_input();

            let removed_depth = st.layers.len() - 1;
            let Some(mut removed) = st.layers.pop() else {
                return Err(ChannelError::Closed);
            };
            if let Some(lower) = st.layers.last_mut() {
                st.in_queue.append(&mut lower.unread);
            }
            st.reset_input_conditions();
            base.waker(removed_depth).clear_source();

            let mut below = Below::new(&mut st.layers, &base);
            let closed = removed.driver.close(&mut below);
            debug!(channel = %st.name, layer = %removed.driver.type_name(), "layer unstacked");
            closed.map_err(ChannelError::from_driver)
        };
        self.cell.update_interest();
        result
    }

    /// Remove the layer at `depth` (1 is the first layer above the
    /// transport) without touching the layers above it.
    ///
    /// Bytes the removed layer produced that nothing above has read yet,
    /// including its internal read-ahead, are handed to the layer above
    /// ahead of the untransformed data. No byte is delivered twice and none
    /// is lost.
    pub fn unstack_at(&self, depth: usize) -> Result<()> {
        self.guard(None)?;
        let len = self.stack_depth();
        if depth == 0 || depth >= len {
            return Err(ChannelError::Invalid(format!(
                "no removable layer at depth {} (stack depth {})",
                depth, len
            )));
        }
        if depth == len - 1 {
            return self.unstack();
        }
        let base = self.cell.base();
        let result = {
            let mut guard = self.cell.state.borrow_mut();
            let st = &mut *guard;
            st.drain_output_for_restack(&base)?;

            let mut removed = st.layers.remove(depth);
            let ahead = removed.driver.take_read_ahead();
            if !ahead.is_empty() {
                removed.unread.push_back(ChannelBuffer::from_slice(&ahead));
            }
            let lower = &mut st.layers[depth - 1];
            removed.unread.append(&mut lower.unread);
            lower.unread = std::mem::replace(&mut removed.unread, BufferQueue::new());
            base.waker(len - 1).clear_source();

            let mut below = Below::new(&mut st.layers[..depth], &base);
            let closed = removed.driver.close(&mut below);
            debug!(channel = %st.name, depth, layer = %removed.driver.type_name(), "layer removed");
            closed.map_err(ChannelError::from_driver)
        };
        self.cell.update_interest();
        result
    }

    /// Driver type names from the transport up
    pub fn layer_types(&self) -> Vec<String> {
        self.cell
            .state
            .borrow()
            .layers
            .iter()
            .map(|l| l.driver.type_name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::driver::{Interest, MemoryDriver, SeekMode};
    use crate::error::ChannelError;
    use crate::runtime::Runtime;
    use crate::transform::{Transform, TransformDriver, TransformResult, TransformVerb};

    /// Upper-cases what is read, lower-cases what is written
    struct Upper;

    impl Transform for Upper {
        fn invoke(&mut self, verb: TransformVerb, data: &[u8]) -> crate::Result<TransformResult> {
            Ok(match verb {
                TransformVerb::Read => TransformResult::Buffer(data.to_ascii_uppercase().into()),
                TransformVerb::Write => TransformResult::Downstream(data.to_ascii_lowercase().into()),
                _ => TransformResult::Discard,
            })
        }
    }

    fn upper() -> TransformDriver<Upper> {
        TransformDriver::new(Upper, Interest::READABLE | Interest::WRITABLE).unwrap()
    }

    fn rw() -> Interest {
        Interest::READABLE | Interest::WRITABLE
    }

    #[test]
    fn test_stack_and_unstack_layers() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::new(b"abc\ndef\n".to_vec()), "mem0", rw());
        ch.stack(upper(), rw()).unwrap();
        assert_eq!(ch.stack_depth(), 2);
        assert_eq!(ch.layer_types(), vec!["memory", "transform"]);
        assert_eq!(ch.type_name(), "transform");
        assert_eq!(ch.gets().unwrap().as_deref(), Some("ABC"));
        ch.unstack().unwrap();
        assert_eq!(ch.stack_depth(), 1);
        assert!(!ch.is_closed());
    }

    #[test]
    fn test_queued_input_is_read_through_new_layer() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::new(b"one\ntwo\n".to_vec()), "mem0", rw());
        assert_eq!(ch.gets().unwrap().as_deref(), Some("one"));
        assert!(ch.input_buffered() > 0);
        ch.stack(upper(), rw()).unwrap();
        assert_eq!(ch.input_buffered(), 0);
        assert_eq!(ch.gets().unwrap().as_deref(), Some("TWO"));
    }

    #[test]
    fn test_stacked_output_is_transformed() {
        let rt = Runtime::new();
        let drv = MemoryDriver::empty();
        let handle = drv.handle();
        let ch = rt.create_channel(drv, "mem0", rw());
        ch.write(b"Plain ").unwrap();
        ch.stack(upper(), rw()).unwrap();
        assert_eq!(handle.contents(), b"Plain ");
        ch.write(b"SHOUT").unwrap();
        ch.unstack().unwrap();
        assert_eq!(handle.contents(), b"Plain shout");
    }

    #[test]
    fn test_stack_mask_must_overlap_mode() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::empty(), "mem0", Interest::READABLE);
        assert!(matches!(
            ch.stack(upper(), Interest::WRITABLE),
            Err(ChannelError::Invalid(_))
        ));
        assert_eq!(ch.stack_depth(), 1);
    }

    #[test]
    fn test_unstack_single_layer_closes() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::empty(), "mem0", rw());
        ch.unstack().unwrap();
        assert!(ch.is_closed());
    }

    #[test]
    fn test_unstack_at_validates_depth() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::empty(), "mem0", rw());
        ch.stack(upper(), rw()).unwrap();
        assert!(ch.unstack_at(0).is_err());
        assert!(ch.unstack_at(2).is_err());
        ch.unstack_at(1).unwrap();
        assert_eq!(ch.stack_depth(), 1);
    }

    #[test]
    fn test_seek_through_layer() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::new(b"abc\n".to_vec()), "mem0", rw());
        ch.stack(upper(), rw()).unwrap();
        assert_eq!(ch.gets().unwrap().as_deref(), Some("ABC"));
        ch.seek(1, SeekMode::Start).unwrap();
        assert_eq!(ch.gets().unwrap().as_deref(), Some("BC"));
    }
}
