//! Channels
//!
//! A [`Channel`] is a cheap handle on one logical channel. All layers stacked
//! on it share a single [`ChannelState`]: queued input and output, encoding and
//! translation settings, the state flags and the registration count. Layer 0
//! is the transport; the last layer is where application I/O enters.
//!
//! User code (handlers, close callbacks, copy completion) never runs while
//! the state is borrowed.

mod events;
mod options;
mod read;
mod seek;
mod stack;
mod write;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::buffer::{BufferPool, BufferQueue, ChannelBuffer};
use crate::copy::{self, CopyState};
use crate::driver::{Below, ChannelDriver, Direction, Interest, Layer, RawHandle};
use crate::encoding::Encoding;
use crate::error::{ChannelError, Result};
use crate::notifier::{Notifier, TimerToken, WakerBase};
use crate::runtime::{self, RuntimeInner};
use crate::translation::{InputState, Translation};

pub use events::HandlerId;
pub use options::CORE_OPTIONS;
pub(crate) use read::CopyChunk;
pub(crate) use events::deliver;
pub(crate) use events::Handler;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const MIN_BUFFER_SIZE: usize = 10;
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// Per-channel state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct StateFlags: u32 {
        /// The transport reported end of file
        const EOF                = 1 << 0;
        /// EOF latched by the in-band EOF character; only a seek clears it
        const STICKY_EOF         = 1 << 1;
        /// The last input attempt came back short or would block
        const BLOCKED            = 1 << 2;
        const NONBLOCKING        = 1 << 3;
        const LINE_BUFFERED      = 1 << 4;
        const UNBUFFERED         = 1 << 5;
        /// Output is queued and waits for the transport to become writable
        const BG_FLUSH_SCHEDULED = 1 << 6;
        /// Queued input is an incomplete sequence; readiness alone will not help
        const NEED_MORE_DATA     = 1 << 7;
        /// Closed by the application, possibly still draining output
        const CLOSED             = 1 << 8;
        /// Layers closed and resources released
        const DEAD               = 1 << 9;
    }
}

/// Identifies a registered close callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCallbackId(u64);

type CloseCallback = Box<dyn FnOnce(&Channel)>;

/// State shared by every layer of one logical channel
pub(crate) struct ChannelState {
    pub(crate) name: String,
    pub(crate) layers: Vec<Layer>,
    /// Raw bytes produced by the top layer, not yet translated for a reader
    pub(crate) in_queue: BufferQueue,
    /// Output ready for the transport, strictly FIFO
    pub(crate) out_queue: BufferQueue,
    /// Partially filled output buffer
    pub(crate) cur_out: Option<ChannelBuffer>,
    pub(crate) pool: BufferPool,
    pub(crate) buffer_size: usize,
    pub(crate) encoding: Encoding,
    pub(crate) in_translation: Translation,
    pub(crate) out_translation: Translation,
    pub(crate) in_eof_char: Option<u8>,
    pub(crate) out_eof_char: Option<u8>,
    pub(crate) input_state: InputState,
    pub(crate) flags: StateFlags,
    /// Error from a background flush, raised by the next synchronous call
    pub(crate) unreported_error: Option<ChannelError>,
    pub(crate) ref_count: usize,
    pub(crate) timer: Option<TimerToken>,
    /// Decoded bytes per source byte seen by recent character reads
    pub(crate) expansion: f64,
}

impl ChannelState {
    fn new(name: &str, transport: Layer) -> Self {
        Self {
            name: name.to_string(),
            layers: vec![transport],
            in_queue: BufferQueue::new(),
            out_queue: BufferQueue::new(),
            cur_out: None,
            pool: BufferPool::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            encoding: Encoding::system(),
            in_translation: Translation::Auto,
            out_translation: Translation::platform(),
            in_eof_char: None,
            out_eof_char: None,
            input_state: InputState::default(),
            flags: StateFlags::empty(),
            unreported_error: None,
            ref_count: 0,
            timer: None,
            expansion: 1.0,
        }
    }

    /// Open mode of the channel (the top layer's mode)
    pub(crate) fn mode(&self) -> Interest {
        self.layers.last().map(|l| l.mode).unwrap_or_default()
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.flags.contains(StateFlags::DEAD)
    }

    pub(crate) fn input_buffered(&self) -> usize {
        self.in_queue.bytes()
    }

    pub(crate) fn output_buffered(&self) -> usize {
        self.out_queue.bytes() + self.cur_out.as_ref().map_or(0, ChannelBuffer::len)
    }

    /// Common entry check for synchronous operations
    pub(crate) fn check(&mut self, dir: Option<Direction>) -> Result<()> {
        if let Some(err) = self.unreported_error.take() {
            return Err(err);
        }
        if self.flags.contains(StateFlags::CLOSED) {
            return Err(ChannelError::Closed);
        }
        match dir {
            Some(Direction::Read) if !self.mode().contains(Interest::READABLE) => {
                Err(ChannelError::NotReadable(self.name.clone()))
            }
            Some(Direction::Write) if !self.mode().contains(Interest::WRITABLE) => {
                Err(ChannelError::NotWritable(self.name.clone()))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn recycle(&mut self, buf: ChannelBuffer) {
        let mode = self.mode();
        self.pool.recycle(
            buf,
            false,
            self.buffer_size,
            mode.contains(Interest::READABLE),
            mode.contains(Interest::WRITABLE),
        );
    }

    /// Drop every queued input byte
    pub(crate) fn discard_input(&mut self) {
        let drained: Vec<ChannelBuffer> = self.in_queue.drain().collect();
        for buf in drained {
            self.recycle(buf);
        }
    }

    /// A closed channel whose output has drained can be torn down
    pub(crate) fn close_ready(&self) -> bool {
        self.flags.contains(StateFlags::CLOSED)
            && !self.is_dead()
            && self.ref_count == 0
            && self.output_buffered() == 0
    }
}

/// Top layer plus a view of everything beneath it
pub(crate) fn split_top<'a>(
    layers: &'a mut [Layer],
    base: &'a WakerBase,
) -> Result<(&'a mut Layer, Below<'a>)> {
    match layers.split_last_mut() {
        Some((top, rest)) => Ok((top, Below::new(rest, base))),
        None => Err(ChannelError::Closed),
    }
}

/// Layer `idx` plus a view of the layers beneath it
pub(crate) fn split_layer<'a>(
    layers: &'a mut [Layer],
    idx: usize,
    base: &'a WakerBase,
) -> Option<(&'a mut Layer, Below<'a>)> {
    let (lower, upper) = layers.split_at_mut(idx);
    let layer = upper.first_mut()?;
    Some((layer, Below::new(lower, base)))
}

pub(crate) struct ChannelCell {
    pub(crate) id: u64,
    pub(crate) state: RefCell<ChannelState>,
    base: RefCell<WakerBase>,
    runtime: RefCell<Weak<RuntimeInner>>,
    pub(crate) handlers: RefCell<Vec<Handler>>,
    pub(crate) next_handler: Cell<u64>,
    /// Handler ids backing the readable / writable event callbacks
    pub(crate) event_callbacks: RefCell<[Option<HandlerId>; 2]>,
    close_callbacks: RefCell<Vec<(CloseCallbackId, CloseCallback)>>,
    next_close_callback: Cell<u64>,
    pub(crate) copy: RefCell<Option<Rc<RefCell<CopyState>>>>,
}

impl ChannelCell {
    pub(crate) fn create(
        runtime: &Rc<RuntimeInner>,
        notifier: &Notifier,
        driver: Box<dyn ChannelDriver>,
        name: &str,
        mode: Interest,
    ) -> Rc<Self> {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        Rc::new_cyclic(|weak| ChannelCell {
            id,
            state: RefCell::new(ChannelState::new(name, Layer::new(driver, mode))),
            base: RefCell::new(WakerBase::new(notifier.downgrade(), weak.clone(), id)),
            runtime: RefCell::new(Rc::downgrade(runtime)),
            handlers: RefCell::new(Vec::new()),
            next_handler: Cell::new(1),
            event_callbacks: RefCell::new([None, None]),
            close_callbacks: RefCell::new(Vec::new()),
            next_close_callback: Cell::new(1),
            copy: RefCell::new(None),
        })
    }

    pub(crate) fn base(&self) -> WakerBase {
        self.base.borrow().clone()
    }

    pub(crate) fn runtime(&self) -> Option<Rc<RuntimeInner>> {
        self.runtime.borrow().upgrade()
    }

    /// Re-home the channel onto another runtime's notifier
    pub(crate) fn rebind(self: &Rc<Self>, runtime: &Rc<RuntimeInner>, notifier: &Notifier) {
        if let Some(old) = self.base().notifier() {
            if let Some(token) = self.state.borrow_mut().timer.take() {
                old.delete_timer(token);
            }
            old.forget_channel(self.id);
        }
        *self.base.borrow_mut() = WakerBase::new(notifier.downgrade(), Rc::downgrade(self), self.id);
        *self.runtime.borrow_mut() = Rc::downgrade(runtime);
    }

    /// Close every layer top-down and release the channel's resources.
    ///
    /// Returns the first error reported on the way; the channel is dead
    /// afterwards either way.
    pub(crate) fn finish_close(self: &Rc<Self>) -> Result<()> {
        let base = self.base();
        let first_error = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            if st.is_dead() {
                return Ok(());
            }
            st.flags.insert(StateFlags::CLOSED | StateFlags::DEAD);
            let mut first: Option<ChannelError> = st.unreported_error.take();

            if let Some(c) = st.out_eof_char {
                if st.mode().contains(Interest::WRITABLE) {
                    if let Ok((top, mut below)) = split_top(&mut st.layers, &base) {
                        if let Err(e) = top.driver.output(&mut below, &[c]) {
                            first.get_or_insert(ChannelError::from_driver(e));
                        }
                    }
                }
            }

            for idx in (0..st.layers.len()).rev() {
                if let Some((layer, mut below)) = split_layer(&mut st.layers, idx, &base) {
                    if let Err(e) = layer.driver.close(&mut below) {
                        warn!(channel = %st.name, layer = idx, error = %e, "driver close failed");
                        first.get_or_insert(ChannelError::from_driver(e));
                    }
                }
            }

            st.layers.clear();
            st.in_queue = BufferQueue::new();
            st.out_queue = BufferQueue::new();
            st.cur_out = None;
            st.pool.clear();
            if let Some(token) = st.timer.take() {
                if let Some(n) = base.notifier() {
                    n.delete_timer(token);
                }
            }
            debug!(channel = %st.name, "channel closed");
            first
        };

        if let Some(n) = base.notifier() {
            n.forget_channel(self.id);
        }
        if let Some(rt) = self.runtime() {
            runtime::forget(&rt, self.id);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Handle on one logical channel
#[derive(Clone)]
pub struct Channel {
    pub(crate) cell: Rc<ChannelCell>,
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.cell.state.borrow();
        f.debug_struct("Channel")
            .field("id", &self.cell.id)
            .field("name", &st.name)
            .field("layers", &st.layers.len())
            .field("flags", &st.flags)
            .finish()
    }
}

impl Channel {
    pub(crate) fn from_cell(cell: Rc<ChannelCell>) -> Self {
        Self { cell }
    }

    /// Entry check for public operations: errors, mode, background copy
    pub(crate) fn guard(&self, dir: Option<Direction>) -> Result<()> {
        self.cell.state.borrow_mut().check(dir)?;
        if self.is_copying() {
            return Err(ChannelError::Busy);
        }
        Ok(())
    }

    /// Process-unique channel id
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    pub fn name(&self) -> String {
        self.cell.state.borrow().name.clone()
    }

    /// Driver type of the top layer
    pub fn type_name(&self) -> String {
        self.cell
            .state
            .borrow()
            .layers
            .last()
            .map(|l| l.driver.type_name().to_string())
            .unwrap_or_default()
    }

    pub fn mode(&self) -> Interest {
        self.cell.state.borrow().mode()
    }

    /// Number of layers, transport included
    pub fn stack_depth(&self) -> usize {
        self.cell.state.borrow().layers.len()
    }

    pub fn ref_count(&self) -> usize {
        self.cell.state.borrow().ref_count
    }

    pub fn is_registered(&self) -> bool {
        self.ref_count() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.cell.state.borrow().flags.contains(StateFlags::CLOSED)
    }

    pub fn is_eof(&self) -> bool {
        self.cell.state.borrow().flags.contains(StateFlags::EOF)
    }

    /// True when the last input attempt could not be satisfied without waiting
    pub fn is_blocked(&self) -> bool {
        self.cell.state.borrow().flags.contains(StateFlags::BLOCKED)
    }

    /// Raw input bytes queued in the channel
    pub fn input_buffered(&self) -> usize {
        self.cell.state.borrow().input_buffered()
    }

    /// Output bytes not yet accepted by the transport
    pub fn output_buffered(&self) -> usize {
        self.cell.state.borrow().output_buffered()
    }

    /// OS handle of the top layer for one direction, if it has one
    pub fn handle(&self, dir: Direction) -> Option<RawHandle> {
        let base = self.cell.base();
        let mut st = self.cell.state.borrow_mut();
        if !st.mode().contains(dir.interest()) {
            return None;
        }
        let (top, mut below) = split_top(&mut st.layers, &base).ok()?;
        top.driver.handle(&mut below, dir)
    }

    pub fn is_copying(&self) -> bool {
        self.cell.copy.borrow().is_some()
    }

    /// Register a callback run once when the channel is closed
    pub fn on_close(&self, callback: impl FnOnce(&Channel) + 'static) -> CloseCallbackId {
        let id = CloseCallbackId(self.cell.next_close_callback.get());
        self.cell.next_close_callback.set(id.0 + 1);
        self.cell
            .close_callbacks
            .borrow_mut()
            .push((id, Box::new(callback)));
        id
    }

    pub fn remove_close_callback(&self, id: CloseCallbackId) -> bool {
        let mut callbacks = self.cell.close_callbacks.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        callbacks.len() != before
    }

    pub(crate) fn retain_ref(&self) {
        self.cell.state.borrow_mut().ref_count += 1;
    }

    /// Drop one registration; the last one closes the channel
    pub(crate) fn release_ref(&self) -> Result<()> {
        let remaining = {
            let mut st = self.cell.state.borrow_mut();
            st.ref_count = st.ref_count.saturating_sub(1);
            if st.flags.contains(StateFlags::CLOSED) {
                return Ok(());
            }
            st.ref_count
        };
        if remaining == 0 {
            self.close()
        } else {
            Ok(())
        }
    }

    /// Close the channel.
    ///
    /// Queued output is flushed first. On a non-blocking channel whose
    /// transport cannot take everything yet, the channel is marked closed and
    /// torn down once the background flush drains.
    pub fn close(&self) -> Result<()> {
        {
            let st = self.cell.state.borrow();
            if st.flags.contains(StateFlags::CLOSED) {
                return Err(ChannelError::Closed);
            }
            if st.ref_count > 0 {
                return Err(ChannelError::Invalid(format!(
                    "channel \"{}\" is still registered",
                    st.name
                )));
            }
        }

        copy::abort(self);

        let callbacks = std::mem::take(&mut *self.cell.close_callbacks.borrow_mut());
        for (_, callback) in callbacks {
            callback(self);
        }
        if self.is_closed() {
            return Ok(());
        }

        self.cell.handlers.borrow_mut().clear();
        *self.cell.event_callbacks.borrow_mut() = [None, None];

        let base = self.cell.base();
        let flushed = {
            let mut st = self.cell.state.borrow_mut();
            if let Some(token) = st.timer.take() {
                if let Some(n) = base.notifier() {
                    n.delete_timer(token);
                }
            }
            st.flags.insert(StateFlags::CLOSED);
            st.queue_current();
            st.flush_channel(&base, false)
        };

        let ready = self.cell.state.borrow().close_ready();
        if ready {
            let closed = self.cell.finish_close();
            flushed.and(closed)
        } else {
            debug!(channel = %self.name(), "close deferred until output drains");
            self.cell.update_interest();
            flushed
        }
    }

    /// Close one direction of a channel whose transport supports it.
    ///
    /// Closing the last open direction closes the whole channel.
    pub fn close_direction(&self, dir: Direction) -> Result<()> {
        self.guard(None)?;
        let side = match dir {
            Direction::Read => "read",
            Direction::Write => "write",
        };
        let remaining = {
            let st = self.cell.state.borrow();
            let mode = st.mode();
            if !mode.contains(dir.interest()) {
                return Err(ChannelError::Invalid(format!(
                    "half-close of {}-side not possible, side not opened or already closed",
                    side
                )));
            }
            let supported = st
                .layers
                .last()
                .map_or(false, |l| l.driver.supports_half_close());
            if !supported {
                return Err(ChannelError::Invalid(format!(
                    "channel \"{}\" does not support half-close",
                    st.name
                )));
            }
            mode - dir.interest()
        };
        if remaining.is_empty() {
            return self.close();
        }

        let base = self.cell.base();
        let result = {
            let mut guard = self.cell.state.borrow_mut();
            let st = &mut *guard;
            match dir {
                Direction::Write => {
                    st.queue_current();
                    st.flush_channel(&base, false)?;
                }
                Direction::Read => {
                    st.discard_input();
                    st.flags.insert(StateFlags::EOF);
                }
            }
            let (top, mut below) = split_top(&mut st.layers, &base)?;
            let closed = top.driver.close_half(&mut below, dir);
            for layer in st.layers.iter_mut() {
                layer.mode.remove(dir.interest());
            }
            debug!(channel = %st.name, side, "half-closed");
            closed.map_err(ChannelError::from_driver)
        };

        if dir == Direction::Read {
            let readable: Vec<HandlerId> = self
                .cell
                .handlers
                .borrow()
                .iter()
                .filter(|h| h.mask == Interest::READABLE)
                .map(|h| h.id)
                .collect();
            for id in readable {
                self.delete_handler(id);
            }
        }
        self.cell.update_interest();
        result
    }

    /// Hand an asynchronous failure to the runtime's background-error hook
    pub(crate) fn report_background_error(&self, err: &ChannelError) {
        match self.cell.runtime() {
            Some(rt) => runtime::report_background_error(&rt, self, err),
            None => warn!(channel = %self.name(), error = %err, "background error"),
        }
    }
}
