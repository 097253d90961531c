//! Execution contexts
//!
//! A [`Runtime`] owns one [`Notifier`] and the channels created through it.
//! Channels are bound to the runtime that created them; handing one to
//! another runtime is an explicit [`Runtime::move_channel`].

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::channel::{Channel, ChannelCell};
use crate::driver::{ChannelDriver, Interest};
use crate::error::{ChannelError, Result};
use crate::notifier::Notifier;

type ErrorHook = Rc<dyn Fn(&Channel, &ChannelError)>;

/// Standard channel slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    fn slot(self) -> usize {
        match self {
            StdStream::Stdin => 0,
            StdStream::Stdout => 1,
            StdStream::Stderr => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StdStream::Stdin => "stdin",
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        }
    }
}

pub(crate) struct RuntimeInner {
    notifier: Notifier,
    channels: RefCell<Vec<Rc<ChannelCell>>>,
    std_channels: RefCell<[Option<Channel>; 3]>,
    error_hook: RefCell<Option<ErrorHook>>,
}

/// Drop a closed channel from its runtime's list
pub(crate) fn forget(rt: &Rc<RuntimeInner>, channel_id: u64) {
    rt.channels.borrow_mut().retain(|c| c.id != channel_id);
}

/// Route an error nobody is synchronously waiting for
pub(crate) fn report_background_error(rt: &Rc<RuntimeInner>, channel: &Channel, err: &ChannelError) {
    let hook = rt.error_hook.borrow().clone();
    match hook {
        Some(hook) => hook(channel, err),
        None => warn!(channel = %channel.name(), error = %err, "background error"),
    }
}

/// One execution context: an event loop plus the channels it owns
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("channels", &self.inner.channels.borrow().len())
            .finish()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                notifier: Notifier::new(),
                channels: RefCell::new(Vec::new()),
                std_channels: RefCell::new([None, None, None]),
                error_hook: RefCell::new(None),
            }),
        }
    }

    pub fn notifier(&self) -> Notifier {
        self.inner.notifier.clone()
    }

    /// Open a channel on `driver` with the given name and mode
    pub fn create_channel(
        &self,
        driver: impl ChannelDriver + 'static,
        name: &str,
        mode: Interest,
    ) -> Channel {
        self.create_channel_boxed(Box::new(driver), name, mode)
    }

    pub fn create_channel_boxed(
        &self,
        driver: Box<dyn ChannelDriver>,
        name: &str,
        mode: Interest,
    ) -> Channel {
        let kind = driver.type_name().to_string();
        let cell = ChannelCell::create(&self.inner, &self.inner.notifier, driver, name, mode);
        self.inner.channels.borrow_mut().push(cell.clone());
        debug!(channel = name, driver = %kind, ?mode, "channel created");
        Channel::from_cell(cell)
    }

    /// Live channels owned by this runtime, oldest first
    pub fn channels(&self) -> Vec<Channel> {
        self.inner
            .channels
            .borrow()
            .iter()
            .map(|c| Channel::from_cell(c.clone()))
            .collect()
    }

    pub fn find_channel(&self, name: &str) -> Option<Channel> {
        self.channels().into_iter().find(|c| c.name() == name)
    }

    fn owns(&self, channel: &Channel) -> bool {
        channel
            .cell
            .runtime()
            .map_or(false, |rt| Rc::ptr_eq(&rt, &self.inner))
    }

    /// Fill a standard slot; the slot holds a registration on the channel.
    ///
    /// The channel previously in the slot loses that registration, which
    /// closes it if it was the last one.
    pub fn set_std_channel(&self, stream: StdStream, channel: Option<Channel>) -> Result<()> {
        if let Some(ch) = &channel {
            if ch.is_closed() {
                return Err(ChannelError::Closed);
            }
            ch.retain_ref();
        }
        let old = std::mem::replace(
            &mut self.inner.std_channels.borrow_mut()[stream.slot()],
            channel,
        );
        match old {
            Some(old) => old.release_ref(),
            None => Ok(()),
        }
    }

    pub fn std_channel(&self, stream: StdStream) -> Option<Channel> {
        self.inner.std_channels.borrow()[stream.slot()].clone()
    }

    /// Install the hook that receives errors from event-driven work
    /// (failing event callbacks, background flushes that end a deferred
    /// close). Without one, such errors are logged.
    pub fn set_background_error_handler(&self, hook: impl Fn(&Channel, &ChannelError) + 'static) {
        *self.inner.error_hook.borrow_mut() = Some(Rc::new(hook));
    }

    /// Hand `channel` over to the runtime `to`.
    ///
    /// The channel must belong to this runtime and be idle: not registered
    /// anywhere, not part of a background copy, no background flush pending.
    pub fn move_channel(&self, channel: &Channel, to: &Runtime) -> Result<()> {
        if channel.is_closed() {
            return Err(ChannelError::Closed);
        }
        if !self.owns(channel) {
            return Err(ChannelError::Invalid(format!(
                "channel \"{}\" is not owned by this runtime",
                channel.name()
            )));
        }
        if channel.is_registered() {
            return Err(ChannelError::Invalid(format!(
                "channel \"{}\" is still registered",
                channel.name()
            )));
        }
        if channel.is_copying() {
            return Err(ChannelError::Busy);
        }
        if channel.flush_pending() {
            return Err(ChannelError::Invalid(format!(
                "channel \"{}\" has a background flush pending",
                channel.name()
            )));
        }
        if Rc::ptr_eq(&self.inner, &to.inner) {
            return Ok(());
        }

        forget(&self.inner, channel.id());
        channel.cell.rebind(&to.inner, &to.inner.notifier);
        to.inner.channels.borrow_mut().push(channel.cell.clone());
        channel.cell.update_interest();
        debug!(channel = %channel.name(), "channel moved to another runtime");
        Ok(())
    }

    /// Close every channel this runtime owns.
    ///
    /// Standard slots are emptied first; every remaining channel is switched
    /// to blocking so its queued output is written, then closed regardless of
    /// registrations. Returns the first error met.
    pub fn finalize(&self) -> Result<()> {
        let mut first: Option<ChannelError> = None;
        for stream in [StdStream::Stdin, StdStream::Stdout, StdStream::Stderr] {
            if let Err(e) = self.set_std_channel(stream, None) {
                first.get_or_insert(e);
            }
        }

        for channel in self.channels() {
            if channel.is_closed() {
                continue;
            }
            channel.cell.state.borrow_mut().ref_count = 0;
            if !channel.is_copying() {
                if let Err(e) = channel.set_blocking(true) {
                    warn!(channel = %channel.name(), error = %e, "could not switch to blocking");
                }
            }
            if let Err(e) = channel.close() {
                warn!(channel = %channel.name(), error = %e, "close failed during finalize");
                first.get_or_insert(e);
            }
        }
        // Deferred closes that never drained.
        let leftover = std::mem::take(&mut *self.inner.channels.borrow_mut());
        for cell in leftover {
            if let Err(e) = cell.finish_close() {
                first.get_or_insert(e);
            }
        }
        debug!("runtime finalized");
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run one unit of event-loop work; see [`Notifier::do_one_event`]
    pub fn do_one_event(&self, wait: bool) -> bool {
        self.inner.notifier.do_one_event(wait)
    }

    pub fn run_until(&self, done: impl FnMut() -> bool, timeout: Option<std::time::Duration>) -> bool {
        self.inner.notifier.run_until(done, timeout)
    }
}
