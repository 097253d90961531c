//! Copying between channels
//!
//! [`Channel::copy_to`] moves data synchronously. [`Channel::copy_to_background`]
//! hands the transfer to the event loop: both channels go non-blocking, one
//! chunk moves per event, and a completion callback reports the total.
//!
//! While a background copy runs, both channels answer ordinary operations
//! with [`ChannelError::Busy`].

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::channel::{Channel, CopyChunk, HandlerId};
use crate::config::Buffering;
use crate::driver::{Direction, Interest};
use crate::error::{ChannelError, Result};

type CopyCallback = Box<dyn FnOnce(u64, Option<ChannelError>)>;

/// Bookkeeping for one background copy, shared by both channels
pub(crate) struct CopyState {
    src: Channel,
    dst: Channel,
    /// Units still to move; `None` copies until end of file
    remaining: Option<u64>,
    total: u64,
    /// Encodings differ: decode on the way in, encode on the way out
    chars: bool,
    chunk: usize,
    src_was_blocking: bool,
    dst_was_blocking: bool,
    dst_buffering: Buffering,
    callback: Option<CopyCallback>,
    read_handler: Option<HandlerId>,
    write_handler: Option<HandlerId>,
}

/// What the copy waits for next
enum Wait {
    Readable,
    Writable,
}

fn check_pair(src: &Channel, dst: &Channel) -> Result<()> {
    src.guard(Some(Direction::Read))?;
    dst.guard(Some(Direction::Write))?;
    Ok(())
}

fn wants_chars(src: &Channel, dst: &Channel) -> bool {
    src.encoding() != dst.encoding()
}

fn next_request(chunk: usize, remaining: Option<u64>) -> usize {
    match remaining {
        Some(left) => chunk.min(usize::try_from(left).unwrap_or(usize::MAX)),
        None => chunk,
    }
}

impl Channel {
    /// Copy up to `limit` units (bytes, or characters when the encodings
    /// differ) to `dst`, or everything up to end of file.
    ///
    /// Returns the number of units copied. The first read or write error is
    /// returned as is. On a non-blocking source the copy stops at the first
    /// read that finds nothing.
    pub fn copy_to(&self, dst: &Channel, limit: Option<u64>) -> Result<u64> {
        check_pair(self, dst)?;
        let chars = wants_chars(self, dst);
        let chunk = self.buffer_size();
        let mut remaining = limit;
        let mut total = 0u64;

        while remaining != Some(0) {
            let data = self.read_for_copy(next_request(chunk, remaining), chars)?;
            if data.is_empty() {
                break;
            }
            dst.write_for_copy(&data)?;
            let moved = data.units() as u64;
            total += moved;
            remaining = remaining.map(|left| left.saturating_sub(moved));
        }
        dst.flush()?;
        debug!(src = %self.name(), dst = %dst.name(), total, "copy finished");
        Ok(total)
    }

    /// Start a copy driven by the event loop.
    ///
    /// `callback` runs exactly once, from the event loop, with the number of
    /// units copied and the error that stopped the copy, if any. Blocking
    /// modes and the destination's buffering are restored before it runs.
    pub fn copy_to_background(
        &self,
        dst: &Channel,
        limit: Option<u64>,
        callback: impl FnOnce(u64, Option<ChannelError>) + 'static,
    ) -> Result<()> {
        check_pair(self, dst)?;
        let chars = wants_chars(self, dst);
        let src_was_blocking = self.is_blocking();
        let dst_was_blocking = dst.is_blocking();
        let dst_buffering = dst.buffering();

        force_mode(self, false, None)?;
        if let Err(err) = force_mode(dst, false, Some(Buffering::None)) {
            for (ch, blocking, buffering) in [
                (self, src_was_blocking, None),
                (dst, dst_was_blocking, Some(dst_buffering)),
            ] {
                if let Err(undo) = force_mode(ch, blocking, buffering) {
                    debug!(channel = %ch.name(), error = %undo, "could not restore mode");
                }
            }
            return Err(err);
        }

        let state = Rc::new(RefCell::new(CopyState {
            src: self.clone(),
            dst: dst.clone(),
            remaining: limit,
            total: 0,
            chars,
            chunk: self.buffer_size(),
            src_was_blocking,
            dst_was_blocking,
            dst_buffering,
            callback: Some(Box::new(callback)),
            read_handler: None,
            write_handler: None,
        }));
        *self.cell.copy.borrow_mut() = Some(state.clone());
        *dst.cell.copy.borrow_mut() = Some(state.clone());
        debug!(src = %self.name(), dst = %dst.name(), ?limit, chars, "background copy started");

        wait_for(&state, Wait::Readable);
        Ok(())
    }
}

/// Change blocking mode (and buffering) without going through the Busy check
fn force_mode(ch: &Channel, blocking: bool, buffering: Option<Buffering>) -> Result<()> {
    let base = ch.cell.base();
    let result = {
        let mut st = ch.cell.state.borrow_mut();
        if let Some(b) = buffering {
            st.set_buffering(b);
        }
        st.set_blocking_mode(&base, blocking)
    };
    ch.cell.update_interest();
    result
}

/// Arm the handler for the next step and disarm the other one
fn wait_for(state: &Rc<RefCell<CopyState>>, wait: Wait) {
    let (src, dst, stale) = {
        let mut cs = state.borrow_mut();
        let stale = match wait {
            Wait::Readable => cs.write_handler.take(),
            Wait::Writable => cs.read_handler.take(),
        };
        (cs.src.clone(), cs.dst.clone(), stale)
    };
    if let Some(id) = stale {
        match wait {
            Wait::Readable => dst.delete_handler(id),
            Wait::Writable => src.delete_handler(id),
        };
    }

    match wait {
        Wait::Readable => {
            if state.borrow().read_handler.is_some() {
                return;
            }
            let weak = Rc::downgrade(state);
            let id = src.create_handler(Interest::READABLE, move |_, _| {
                if let Some(state) = weak.upgrade() {
                    step(&state);
                }
            });
            state.borrow_mut().read_handler = Some(id);
        }
        Wait::Writable => {
            if state.borrow().write_handler.is_some() {
                return;
            }
            let weak = Rc::downgrade(state);
            let id = dst.create_handler(Interest::WRITABLE, move |_, _| {
                if let Some(state) = weak.upgrade() {
                    step(&state);
                }
            });
            state.borrow_mut().write_handler = Some(id);
        }
    }
}

/// Move one chunk
fn step(state: &Rc<RefCell<CopyState>>) {
    let (src, dst, request, chars) = {
        let cs = state.borrow();
        if cs.callback.is_none() {
            return;
        }
        if cs.remaining == Some(0) {
            drop(cs);
            return finish(state, None);
        }
        (
            cs.src.clone(),
            cs.dst.clone(),
            next_request(cs.chunk, cs.remaining),
            cs.chars,
        )
    };
    if dst.flush_pending() {
        wait_for(state, Wait::Writable);
        return;
    }

    let data: CopyChunk = match src.read_for_copy(request, chars) {
        Ok(data) => data,
        Err(err) => return finish(state, Some(err)),
    };
    if data.is_empty() {
        if src.is_eof() {
            finish(state, None);
        } else {
            trace!(src = %src.name(), "copy waiting for input");
            wait_for(state, Wait::Readable);
        }
        return;
    }
    if let Err(err) = dst.write_for_copy(&data) {
        return finish(state, Some(err));
    }

    let done = {
        let mut cs = state.borrow_mut();
        let moved = data.units() as u64;
        cs.total += moved;
        cs.remaining = cs.remaining.map(|left| left.saturating_sub(moved));
        cs.remaining == Some(0)
    };
    if done {
        finish(state, None);
    } else if dst.flush_pending() {
        trace!(dst = %dst.name(), "copy waiting for output");
        wait_for(state, Wait::Writable);
    } else {
        wait_for(state, Wait::Readable);
    }
}

/// Tear the copy down, restore both channels and run the callback
fn finish(state: &Rc<RefCell<CopyState>>, err: Option<ChannelError>) {
    let (src, dst, callback, handlers, total, restore) = {
        let mut cs = state.borrow_mut();
        let Some(callback) = cs.callback.take() else {
            return;
        };
        (
            cs.src.clone(),
            cs.dst.clone(),
            callback,
            (cs.read_handler.take(), cs.write_handler.take()),
            cs.total,
            (cs.src_was_blocking, cs.dst_was_blocking, cs.dst_buffering),
        )
    };
    if let Some(id) = handlers.0 {
        src.delete_handler(id);
    }
    if let Some(id) = handlers.1 {
        dst.delete_handler(id);
    }
    src.cell.copy.borrow_mut().take();
    dst.cell.copy.borrow_mut().take();

    let (src_blocking, dst_blocking, dst_buffering) = restore;
    let mut err = err;
    if !src.is_closed() {
        if let Err(e) = force_mode(&src, src_blocking, None) {
            err.get_or_insert(e);
        }
    }
    if !dst.is_closed() {
        if let Err(e) = force_mode(&dst, dst_blocking, Some(dst_buffering)) {
            err.get_or_insert(e);
        }
    }
    debug!(
        src = %src.name(),
        dst = %dst.name(),
        total,
        error = err.as_ref().map(|e| e.to_string()),
        "background copy finished"
    );
    callback(total, err);
}

/// End the background copy `ch` takes part in; its callback sees `Closed`
pub(crate) fn abort(ch: &Channel) {
    let state = ch.cell.copy.borrow().clone();
    if let Some(state) = state {
        finish(&state, Some(ChannelError::Closed));
    }
}
