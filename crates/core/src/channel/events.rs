//! Channel handlers, interest computation and event delivery

use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

use super::{split_top, Channel, ChannelCell, StateFlags};
use crate::driver::{Direction, DriverVersion, Interest};
use crate::error::Result;

/// Identifies a registered channel handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub(crate) type HandlerFn = Rc<dyn Fn(&Channel, Interest)>;

pub(crate) struct Handler {
    pub(crate) id: HandlerId,
    pub(crate) mask: Interest,
    pub(crate) callback: HandlerFn,
}

fn slot(dir: Direction) -> usize {
    match dir {
        Direction::Read => 0,
        Direction::Write => 1,
    }
}

impl ChannelCell {
    /// Recompute the watch mask and hand it to the top layer.
    ///
    /// Input already queued in the channel never makes the transport
    /// signal again, so readable interest is served by a zero-delay timer
    /// instead.
    pub(crate) fn update_interest(self: &Rc<Self>) {
        let handler_mask = self
            .handlers
            .borrow()
            .iter()
            .fold(Interest::empty(), |m, h| m | h.mask);
        let base = self.base();
        let mut guard = self.state.borrow_mut();
        let st = &mut *guard;
        if st.is_dead() {
            return;
        }

        let mut mask = handler_mask;
        if st.flags.contains(StateFlags::BG_FLUSH_SCHEDULED) {
            mask |= Interest::WRITABLE;
        }
        if mask.contains(Interest::READABLE)
            && !st.flags.contains(StateFlags::NEED_MORE_DATA)
            && !st.in_queue.is_empty()
        {
            mask.remove(Interest::READABLE);
            if st.timer.is_none() {
                if let Some(n) = base.notifier() {
                    let weak = Rc::downgrade(self);
                    st.timer = Some(n.create_timer(Duration::ZERO, move || {
                        if let Some(cell) = weak.upgrade() {
                            cell.timer_fired();
                        }
                    }));
                }
            }
        }

        if let Ok((top, mut below)) = split_top(&mut st.layers, &base) {
            let waker = base.waker(below.depth());
            top.driver.watch(&mut below, mask, &waker);
        }
    }

    fn timer_fired(self: &Rc<Self>) {
        let ready = {
            let mut st = self.state.borrow_mut();
            st.timer = None;
            !st.is_dead()
                && !st.flags.contains(StateFlags::NEED_MORE_DATA)
                && !st.in_queue.is_empty()
        };
        let wants_read = self
            .handlers
            .borrow()
            .iter()
            .any(|h| h.mask.contains(Interest::READABLE));
        if ready && wants_read {
            trace!(channel = self.id, "synthetic readable event");
            let top = self.state.borrow().layers.len().saturating_sub(1);
            deliver(self, top, Interest::READABLE);
        } else {
            self.update_interest();
        }
    }
}

/// Deliver an event reported by layer `depth` to everything above it.
///
/// Layers above the origin see the mask first through their event hook and
/// may narrow or swallow it; whatever survives reaches the channel's own
/// handlers.
pub(crate) fn deliver(cell: &Rc<ChannelCell>, depth: usize, mut mask: Interest) {
    {
        let mut st = cell.state.borrow_mut();
        if st.is_dead() {
            return;
        }
        for layer in st.layers.iter_mut().skip(depth + 1) {
            if layer.driver.version() >= DriverVersion::V2 {
                mask = layer.driver.handler(mask);
            }
            if mask.is_empty() {
                return;
            }
        }
    }

    if mask.contains(Interest::WRITABLE)
        && cell
            .state
            .borrow()
            .flags
            .contains(StateFlags::BG_FLUSH_SCHEDULED)
    {
        let base = cell.base();
        let close_now = {
            let mut st = cell.state.borrow_mut();
            // Background flush errors are latched, never returned here.
            let _ = st.flush_channel(&base, true);
            st.close_ready()
        };
        mask.remove(Interest::WRITABLE);
        if close_now {
            let channel = Channel::from_cell(cell.clone());
            if let Err(err) = cell.finish_close() {
                channel.report_background_error(&err);
            }
            return;
        }
    }

    let matching: Vec<(HandlerId, Interest, HandlerFn)> = cell
        .handlers
        .borrow()
        .iter()
        .filter(|h| h.mask.intersects(mask))
        .map(|h| (h.id, h.mask, h.callback.clone()))
        .collect();
    let channel = Channel::from_cell(cell.clone());
    for (id, hmask, callback) in matching {
        if channel.is_closed() {
            break;
        }
        // An earlier handler may have removed this one.
        let live = cell.handlers.borrow().iter().any(|h| h.id == id);
        if live {
            callback(&channel, hmask & mask);
        }
    }

    if !channel.is_closed() {
        cell.update_interest();
    }
}

impl Channel {
    /// Call `callback` whenever the channel becomes ready for any of `mask`
    pub fn create_handler(
        &self,
        mask: Interest,
        callback: impl Fn(&Channel, Interest) + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.cell.next_handler.get());
        self.cell.next_handler.set(id.0 + 1);
        self.cell.handlers.borrow_mut().push(Handler {
            id,
            mask,
            callback: Rc::new(callback),
        });
        self.cell.update_interest();
        id
    }

    pub fn delete_handler(&self, id: HandlerId) -> bool {
        let removed = {
            let mut handlers = self.cell.handlers.borrow_mut();
            let before = handlers.len();
            handlers.retain(|h| h.id != id);
            handlers.len() != before
        };
        if removed {
            self.cell.update_interest();
        }
        removed
    }

    /// Current union of all handler masks
    pub fn interest(&self) -> Interest {
        self.cell
            .handlers
            .borrow()
            .iter()
            .fold(Interest::empty(), |m, h| m | h.mask)
    }

    /// Install the readable or writable event callback, replacing any
    /// previous one for that direction.
    ///
    /// A callback that returns an error is removed and the error goes to the
    /// runtime's background-error hook.
    pub fn set_event_callback(
        &self,
        dir: Direction,
        callback: impl Fn(&Channel) -> Result<()> + 'static,
    ) -> Result<()> {
        self.cell.state.borrow_mut().check(Some(dir))?;
        self.clear_event_callback(dir);
        let callback = Rc::new(callback);
        let id = self.create_handler(dir.interest(), move |channel, _mask| {
            if let Err(err) = callback(channel) {
                channel.clear_event_callback(dir);
                channel.report_background_error(&err);
            }
        });
        self.cell.event_callbacks.borrow_mut()[slot(dir)] = Some(id);
        Ok(())
    }

    pub fn clear_event_callback(&self, dir: Direction) -> bool {
        let id = self.cell.event_callbacks.borrow_mut()[slot(dir)].take();
        match id {
            Some(id) => self.delete_handler(id),
            None => false,
        }
    }

    pub fn has_event_callback(&self, dir: Direction) -> bool {
        self.cell.event_callbacks.borrow()[slot(dir)].is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    use super::*;
    use crate::driver::{pipe, MemoryDriver};
    use crate::error::ChannelError;
    use crate::runtime::Runtime;

    #[test]
    fn test_interest_is_union_of_handlers() {
        let rt = Runtime::new();
        let ch = rt.create_channel(
            MemoryDriver::empty(),
            "mem0",
            Interest::READABLE | Interest::WRITABLE,
        );
        let a = ch.create_handler(Interest::READABLE, |_, _| {});
        let b = ch.create_handler(Interest::WRITABLE, |_, _| {});
        assert_eq!(ch.interest(), Interest::READABLE | Interest::WRITABLE);
        assert!(ch.delete_handler(a));
        assert!(!ch.delete_handler(a));
        assert_eq!(ch.interest(), Interest::WRITABLE);
        ch.delete_handler(b);
        assert!(ch.interest().is_empty());
    }

    #[test]
    fn test_readable_handler_fires_from_pipe_source() {
        let rt = Runtime::new();
        let (reader, writer) = pipe(None);
        let rd = rt.create_channel(reader, "pipe-r", Interest::READABLE);
        let wr = rt.create_channel(writer, "pipe-w", Interest::WRITABLE);
        rd.set_option("blocking", "0").unwrap();

        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = lines.clone();
        rd.create_handler(Interest::READABLE, move |ch, _| {
            while let Ok(Some(line)) = ch.gets() {
                sink.borrow_mut().push(line);
            }
        });

        wr.write(b"one\ntwo\n").unwrap();
        wr.flush().unwrap();
        let done = lines.clone();
        rt.notifier()
            .run_until(move || done.borrow().len() == 2, Some(Duration::from_secs(2)));
        assert_eq!(*lines.borrow(), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_buffered_input_uses_timer() {
        let rt = Runtime::new();
        let ch = rt.create_channel(
            MemoryDriver::new(b"a\nb\n".to_vec()),
            "mem0",
            Interest::READABLE,
        );
        // Pull everything into the channel's queue.
        assert_eq!(ch.gets().unwrap().as_deref(), Some("a"));
        assert!(ch.input_buffered() > 0);

        let got = Rc::new(Cell::new(0));
        let g = got.clone();
        ch.create_handler(Interest::READABLE, move |ch, _| {
            if let Ok(Some(_)) = ch.gets() {
                g.set(g.get() + 1);
            }
        });
        assert_eq!(rt.notifier().pending_timers(), 1);
        rt.notifier().do_one_event(false);
        rt.notifier().do_one_event(false);
        assert_eq!(got.get(), 1);
    }

    #[test]
    fn test_failing_event_callback_is_removed_and_reported() {
        let rt = Runtime::new();
        let reported = Rc::new(RefCell::new(Vec::new()));
        let r = reported.clone();
        rt.set_background_error_handler(move |ch, err| {
            r.borrow_mut().push((ch.name(), err.to_string()));
        });
        let ch = rt.create_channel(MemoryDriver::new(b"x".to_vec()), "mem0", Interest::READABLE);
        ch.set_event_callback(Direction::Read, |_| Err(ChannelError::Invalid("boom".into())))
            .unwrap();
        assert!(ch.has_event_callback(Direction::Read));

        rt.notifier().run_pending();
        assert!(!ch.has_event_callback(Direction::Read));
        assert_eq!(reported.borrow().len(), 1);
        assert_eq!(reported.borrow()[0].0, "mem0");
    }

    #[test]
    fn test_event_callback_requires_mode() {
        let rt = Runtime::new();
        let ch = rt.create_channel(MemoryDriver::empty(), "mem0", Interest::READABLE);
        assert!(matches!(
            ch.set_event_callback(Direction::Write, |_| Ok(())),
            Err(ChannelError::NotWritable(_))
        ));
    }
}
