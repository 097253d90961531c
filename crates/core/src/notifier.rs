//! Cooperative single-threaded event loop
//!
//! The notifier owns three kinds of work:
//! - queued channel events (a layer reported readiness),
//! - one-shot timers,
//! - level-triggered readiness sources registered by drivers, polled
//!   whenever nothing else is pending.
//!
//! Nothing here blocks except `do_one_event(true)` sleeping until the next
//! timer is due.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::channel::{self, ChannelCell};
use crate::driver::Interest;

/// Handle for a pending timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct TimerEntry {
    token: TimerToken,
    due: Instant,
    callback: Box<dyn FnOnce()>,
}

struct QueuedEvent {
    channel: Weak<ChannelCell>,
    depth: usize,
    mask: Interest,
}

#[derive(Clone)]
struct Source {
    channel: Weak<ChannelCell>,
    depth: usize,
    mask: Interest,
    readiness: Rc<dyn Fn() -> Interest>,
}

#[derive(Default)]
pub(crate) struct NotifierInner {
    events: RefCell<VecDeque<QueuedEvent>>,
    timers: RefCell<Vec<TimerEntry>>,
    sources: RefCell<HashMap<(u64, usize), Source>>,
    next_token: Cell<u64>,
}

/// Event loop shared by every channel of one runtime
#[derive(Clone, Default)]
pub struct Notifier {
    inner: Rc<NotifierInner>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn downgrade(&self) -> Weak<NotifierInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Rc<NotifierInner>) -> Self {
        Self { inner }
    }

    /// Run `callback` once, `delay` from now
    pub fn create_timer(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerToken {
        self.inner.create_timer(delay, Box::new(callback))
    }

    /// Cancel a pending timer; false if it already fired or never existed
    pub fn delete_timer(&self, token: TimerToken) -> bool {
        self.inner.delete_timer(token)
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    pub fn pending_events(&self) -> usize {
        self.inner.events.borrow().len()
    }

    /// Process at most one unit of work.
    ///
    /// Returns false when there was nothing to do (and, with `wait`, no timer
    /// to wait for).
    pub fn do_one_event(&self, wait: bool) -> bool {
        if self.deliver_one() {
            return true;
        }
        if self.fire_due_timer(Instant::now()) {
            return true;
        }
        if self.poll_sources() && self.deliver_one() {
            return true;
        }
        if wait {
            let next_due = self.inner.timers.borrow().iter().map(|t| t.due).min();
            if let Some(due) = next_due {
                let now = Instant::now();
                if due > now {
                    std::thread::sleep(due - now);
                }
                return self.fire_due_timer(Instant::now());
            }
        }
        false
    }

    /// Process events until `done` holds, nothing is left to do, or
    /// `timeout` elapses. Returns the final value of `done`.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        loop {
            if done() {
                return true;
            }
            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    return false;
                }
            }
            if !self.do_one_event(true) {
                return done();
            }
        }
    }

    /// Drain everything that is immediately runnable
    pub fn run_pending(&self) -> usize {
        let mut n = 0;
        while self.do_one_event(false) {
            n += 1;
        }
        n
    }

    pub(crate) fn forget_channel(&self, channel_id: u64) {
        self.inner.drop_channel(channel_id);
    }

    fn deliver_one(&self) -> bool {
        let event = self.inner.events.borrow_mut().pop_front();
        match event {
            Some(ev) => {
                if let Some(cell) = ev.channel.upgrade() {
                    channel::deliver(&cell, ev.depth, ev.mask);
                }
                true
            }
            None => false,
        }
    }

    fn fire_due_timer(&self, now: Instant) -> bool {
        let entry = {
            let mut timers = self.inner.timers.borrow_mut();
            let idx = timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.due <= now)
                .min_by_key(|(_, t)| (t.due, t.token.0))
                .map(|(i, _)| i);
            idx.map(|i| timers.remove(i))
        };
        match entry {
            Some(entry) => {
                (entry.callback)();
                true
            }
            None => false,
        }
    }

    // Level-triggered sources: queue an event for every ready one.
    fn poll_sources(&self) -> bool {
        let sources: Vec<Source> = self.inner.sources.borrow().values().cloned().collect();
        let mut queued = false;
        for src in sources {
            if src.channel.strong_count() == 0 {
                continue;
            }
            let ready = (src.readiness)() & src.mask;
            if !ready.is_empty() {
                self.inner.events.borrow_mut().push_back(QueuedEvent {
                    channel: src.channel.clone(),
                    depth: src.depth,
                    mask: ready,
                });
                queued = true;
            }
        }
        queued
    }
}

impl NotifierInner {
    fn create_timer(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerToken {
        let token = TimerToken(self.next_token.get());
        self.next_token.set(token.0 + 1);
        self.timers.borrow_mut().push(TimerEntry {
            token,
            due: Instant::now() + delay,
            callback,
        });
        token
    }

    fn delete_timer(&self, token: TimerToken) -> bool {
        let mut timers = self.timers.borrow_mut();
        let before = timers.len();
        timers.retain(|t| t.token != token);
        timers.len() != before
    }

    fn queue(&self, channel: Weak<ChannelCell>, depth: usize, mask: Interest) {
        self.events.borrow_mut().push_back(QueuedEvent {
            channel,
            depth,
            mask,
        });
    }

    fn drop_channel(&self, channel_id: u64) {
        self.sources
            .borrow_mut()
            .retain(|(id, _), _| *id != channel_id);
    }
}

/// Channel identity used to build per-layer wakers
#[derive(Clone)]
pub struct WakerBase {
    notifier: Weak<NotifierInner>,
    channel: Weak<ChannelCell>,
    channel_id: u64,
}

impl WakerBase {
    pub(crate) fn new(notifier: Weak<NotifierInner>, channel: Weak<ChannelCell>, channel_id: u64) -> Self {
        Self {
            notifier,
            channel,
            channel_id,
        }
    }

    /// Base attached to no notifier; wakers built from it do nothing
    pub fn detached() -> Self {
        Self {
            notifier: Weak::new(),
            channel: Weak::new(),
            channel_id: u64::MAX,
        }
    }

    pub(crate) fn notifier(&self) -> Option<Notifier> {
        self.notifier.upgrade().map(Notifier::from_inner)
    }

    pub fn waker(&self, depth: usize) -> ChannelWaker {
        ChannelWaker {
            base: self.clone(),
            depth,
        }
    }
}

/// Lets the driver of one layer report readiness to the event loop.
///
/// Events reported here travel up the stack starting at the layer above
/// `depth`.
#[derive(Clone)]
pub struct ChannelWaker {
    base: WakerBase,
    depth: usize,
}

impl ChannelWaker {
    /// Waker that goes nowhere
    pub fn detached() -> Self {
        WakerBase::detached().waker(0)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_attached(&self) -> bool {
        self.base.notifier.strong_count() > 0
    }

    /// Queue one readiness event
    pub fn notify(&self, mask: Interest) {
        if mask.is_empty() {
            return;
        }
        if let Some(n) = self.base.notifier.upgrade() {
            n.queue(self.base.channel.clone(), self.depth, mask);
        }
    }

    /// Register a level-triggered source, polled while the loop is idle
    pub fn set_source(&self, mask: Interest, readiness: impl Fn() -> Interest + 'static) {
        let Some(n) = self.base.notifier.upgrade() else {
            return;
        };
        let key = (self.base.channel_id, self.depth);
        if mask.is_empty() {
            n.sources.borrow_mut().remove(&key);
            return;
        }
        n.sources.borrow_mut().insert(
            key,
            Source {
                channel: self.base.channel.clone(),
                depth: self.depth,
                mask,
                readiness: Rc::new(readiness),
            },
        );
    }

    pub fn clear_source(&self) {
        if let Some(n) = self.base.notifier.upgrade() {
            n.sources
                .borrow_mut()
                .remove(&(self.base.channel_id, self.depth));
        }
    }

    /// Report `mask` after `delay`, unless cancelled first
    pub fn schedule(&self, delay: Duration, mask: Interest) -> Option<TimerToken> {
        let n = self.base.notifier.upgrade()?;
        let channel = self.base.channel.clone();
        let depth = self.depth;
        let weak_n = Rc::downgrade(&n);
        Some(n.create_timer(
            delay,
            Box::new(move || {
                if let Some(n) = weak_n.upgrade() {
                    n.queue(channel, depth, mask);
                }
            }),
        ))
    }

    pub fn cancel(&self, token: TimerToken) -> bool {
        match self.base.notifier.upgrade() {
            Some(n) => n.delete_timer(token),
            None => false,
        }
    }

    pub fn notifier(&self) -> Option<Notifier> {
        self.base.notifier.upgrade().map(Notifier::from_inner)
    }
}
