//! Callback-driven transformation layer
//!
//! A [`TransformDriver`] is a stackable [`ChannelDriver`] whose behaviour is
//! supplied by a [`Transform`]: the driver calls it with a verb and a binary
//! payload, and the returned [`TransformResult`] says where the produced
//! bytes go.
//!
//! Read side: raw bytes pulled from the layer below are handed to the `Read`
//! verb; whatever the transform buffers is presented to the layer above.
//! Write side: bytes written by the layer above go to the `Write` verb and
//! are usually sent downstream.

use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::driver::{Below, ChannelDriver, Direction, Interest, RawHandle, SeekMode};
use crate::error::{would_block, ChannelError, Result};
use crate::notifier::{ChannelWaker, TimerToken};

/// How many times a `Loopback` result may feed the write verb again
const MAX_LOOPBACK_DEPTH: usize = 16;

/// Operation requested from a [`Transform`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformVerb {
    CreateRead,
    DeleteRead,
    /// End of input from below; last chance to emit buffered read data
    FlushRead,
    Read,
    CreateWrite,
    DeleteWrite,
    /// Flush requested (seek, close); emit pending write data
    FlushWrite,
    Write,
    /// Ask for a cap on the next raw read, answered with `MaxRead`
    QueryMaxRead,
    /// Read-side state is about to become stale (seek)
    ClearRead,
}

impl TransformVerb {
    pub fn name(self) -> &'static str {
        match self {
            TransformVerb::CreateRead => "create/read",
            TransformVerb::DeleteRead => "delete/read",
            TransformVerb::FlushRead => "flush/read",
            TransformVerb::Read => "read",
            TransformVerb::CreateWrite => "create/write",
            TransformVerb::DeleteWrite => "delete/write",
            TransformVerb::FlushWrite => "flush/write",
            TransformVerb::Write => "write",
            TransformVerb::QueryMaxRead => "query/maxRead",
            TransformVerb::ClearRead => "clear/read",
        }
    }
}

/// Where the bytes produced by one invocation go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformResult {
    /// Nothing to pass on
    Discard,
    /// Write to the layer below
    Downstream(Bytes),
    /// Write to this layer again, as if the layer above had written it
    Loopback(Bytes),
    /// Append to the read-ahead presented to the layer above
    Buffer(Bytes),
    /// Answer to `QueryMaxRead`; `None` lifts the cap
    MaxRead(Option<usize>),
}

/// The behaviour behind a [`TransformDriver`]
pub trait Transform {
    /// Handle one verb.
    ///
    /// # Arguments
    /// * `verb` - The operation requested
    /// * `payload` - Input bytes for `Read` and `Write`; empty otherwise
    ///
    /// # Returns
    /// * `TransformResult` - Where the produced bytes go; an error fails the
    ///   channel operation that triggered the call
    fn invoke(&mut self, verb: TransformVerb, payload: &[u8]) -> Result<TransformResult>;
}

impl<F> Transform for F
where
    F: FnMut(TransformVerb, &[u8]) -> Result<TransformResult>,
{
    fn invoke(&mut self, verb: TransformVerb, payload: &[u8]) -> Result<TransformResult> {
        self(verb, payload)
    }
}

/// Stackable layer delegating to a [`Transform`]
pub struct TransformDriver<T: Transform> {
    transform: T,
    mode: Interest,
    /// Read-ahead: transformed bytes not yet taken by the layer above
    result: BytesMut,
    read_is_flushed: bool,
    /// Transport error hit after part of a read was already served
    read_error: Option<io::Error>,
    /// Transformed output the layer below has not accepted yet
    pending_down: BytesMut,
    blocking: bool,
    waker: Option<ChannelWaker>,
    timer: Option<TimerToken>,
}

impl<T: Transform> TransformDriver<T> {
    /// Create the layer, running the create verbs for each direction in `mode`
    pub fn new(mut transform: T, mode: Interest) -> Result<Self> {
        if mode.contains(Interest::WRITABLE) {
            transform.invoke(TransformVerb::CreateWrite, &[])?;
        }
        if mode.contains(Interest::READABLE) {
            transform.invoke(TransformVerb::CreateRead, &[])?;
        }
        Ok(Self {
            transform,
            mode,
            result: BytesMut::new(),
            read_is_flushed: false,
            read_error: None,
            pending_down: BytesMut::new(),
            blocking: true,
            waker: None,
            timer: None,
        })
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Transformed bytes waiting for the layer above
    pub fn read_ahead(&self) -> usize {
        self.result.len()
    }

    fn invoke(&mut self, verb: TransformVerb, payload: &[u8]) -> io::Result<TransformResult> {
        trace!(verb = verb.name(), len = payload.len(), "transform invoked");
        self.transform
            .invoke(verb, payload)
            .map_err(ChannelError::into_io)
    }

    /// Route one result; `depth` bounds loopback recursion
    fn dispatch(
        &mut self,
        below: &mut Below<'_>,
        verb: TransformVerb,
        result: TransformResult,
        depth: usize,
    ) -> io::Result<()> {
        match result {
            TransformResult::Discard => Ok(()),
            TransformResult::Downstream(bytes) => {
                self.pending_down.extend_from_slice(&bytes);
                self.drain_pending(below)
            }
            TransformResult::Loopback(bytes) => {
                if depth >= MAX_LOOPBACK_DEPTH {
                    return Err(ChannelError::Transform(format!(
                        "{} result looped back more than {} times",
                        verb.name(),
                        MAX_LOOPBACK_DEPTH
                    ))
                    .into_io());
                }
                let again = self.invoke(TransformVerb::Write, &bytes)?;
                self.dispatch(below, TransformVerb::Write, again, depth + 1)
            }
            TransformResult::Buffer(bytes) => {
                self.result.extend_from_slice(&bytes);
                Ok(())
            }
            TransformResult::MaxRead(_) => Err(ChannelError::Transform(format!(
                "maxRead answer to {}",
                verb.name()
            ))
            .into_io()),
        }
    }

    fn run(&mut self, below: &mut Below<'_>, verb: TransformVerb, payload: &[u8]) -> io::Result<()> {
        let result = self.invoke(verb, payload)?;
        self.dispatch(below, verb, result, 0)
    }

    /// Push pending output down as far as the layer below accepts it
    fn drain_pending(&mut self, below: &mut Below<'_>) -> io::Result<()> {
        while !self.pending_down.is_empty() {
            match below.write_raw(&self.pending_down) {
                Ok(0) => break,
                Ok(n) => self.pending_down.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn max_read(&mut self) -> io::Result<Option<usize>> {
        match self.invoke(TransformVerb::QueryMaxRead, &[])? {
            TransformResult::MaxRead(limit) => Ok(limit),
            _ => Ok(None),
        }
    }

    fn cancel_timer(&mut self) {
        if let (Some(token), Some(waker)) = (self.timer.take(), self.waker.as_ref()) {
            waker.cancel(token);
        }
    }
}

impl<T: Transform> ChannelDriver for TransformDriver<T> {
    fn type_name(&self) -> &str {
        "transform"
    }

    fn input(&mut self, below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = self.read_error.take() {
            return Err(err);
        }
        let mut got = 0;
        loop {
            if !self.result.is_empty() {
                let n = self.result.len().min(buf.len() - got);
                buf[got..got + n].copy_from_slice(&self.result[..n]);
                self.result.advance(n);
                got += n;
            }
            if got == buf.len() || self.read_is_flushed {
                return Ok(got);
            }

            let mut want = buf.len() - got;
            if let Some(limit) = self.max_read()? {
                if limit == 0 {
                    return Ok(got);
                }
                want = want.min(limit);
            }
            let mut raw = vec![0u8; want];
            match below.read_raw(&mut raw) {
                Ok(0) => {
                    self.read_is_flushed = true;
                    self.run(below, TransformVerb::FlushRead, &[])?;
                }
                Ok(n) => self.run(below, TransformVerb::Read, &raw[..n])?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if got > 0 => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        self.read_error = Some(e);
                    }
                    return Ok(got);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn output(&mut self, below: &mut Below<'_>, buf: &[u8]) -> io::Result<usize> {
        self.drain_pending(below)?;
        if !self.pending_down.is_empty() {
            return Err(would_block());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.run(below, TransformVerb::Write, buf)?;
        Ok(buf.len())
    }

    fn close(&mut self, below: &mut Below<'_>) -> io::Result<()> {
        self.cancel_timer();
        let mut first: Option<io::Error> = None;
        if self.mode.contains(Interest::WRITABLE) {
            if let Err(e) = self
                .run(below, TransformVerb::FlushWrite, &[])
                .and_then(|_| self.drain_pending(below))
            {
                first.get_or_insert(e);
            }
            if let Err(e) = self.invoke(TransformVerb::DeleteWrite, &[]) {
                first.get_or_insert(e);
            }
        }
        if self.mode.contains(Interest::READABLE) {
            if !self.read_is_flushed {
                // Nobody is left to read what a final flush produces.
                if let Err(e) = self.invoke(TransformVerb::FlushRead, &[]) {
                    first.get_or_insert(e);
                }
            }
            if let Err(e) = self.invoke(TransformVerb::DeleteRead, &[]) {
                first.get_or_insert(e);
            }
        }
        self.result.clear();
        debug!(pending = self.pending_down.len(), "transform closed");
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn wide_seek(&mut self, below: &mut Below<'_>, offset: i64, mode: SeekMode) -> io::Result<i64> {
        if offset == 0 && mode == SeekMode::Current {
            return below.seek(0, SeekMode::Current);
        }
        if self.mode.contains(Interest::WRITABLE) {
            self.run(below, TransformVerb::FlushWrite, &[])?;
        }
        if self.mode.contains(Interest::READABLE) {
            self.invoke(TransformVerb::ClearRead, &[])?;
            self.result.clear();
            self.read_is_flushed = false;
            self.read_error = None;
        }
        below.seek(offset, mode)
    }

    fn set_blocking(&mut self, _below: &mut Below<'_>, blocking: bool) -> io::Result<()> {
        self.blocking = blocking;
        Ok(())
    }

    fn watch(&mut self, below: &mut Below<'_>, mask: Interest, waker: &ChannelWaker) {
        self.waker = Some(waker.clone());
        let mut down = mask;
        if !self.pending_down.is_empty() {
            down |= Interest::WRITABLE;
        }
        below.watch(down);
        self.cancel_timer();
        if mask.contains(Interest::READABLE) && !self.result.is_empty() {
            // Read-ahead exists that the transport will never signal.
            self.timer = waker.schedule(Duration::ZERO, Interest::READABLE);
        }
    }

    fn handle(&mut self, below: &mut Below<'_>, dir: Direction) -> Option<RawHandle> {
        below.handle(dir)
    }

    fn get_option(&mut self, below: &mut Below<'_>, name: &str) -> Result<String> {
        below.get_option(name)
    }

    fn set_option(&mut self, below: &mut Below<'_>, name: &str, value: &str) -> Result<()> {
        below.set_option(name, value)
    }

    fn options(&mut self, below: &mut Below<'_>) -> Vec<(String, String)> {
        below.options()
    }

    fn take_read_ahead(&mut self) -> Vec<u8> {
        self.result.split().to_vec()
    }

    fn handler(&mut self, mask: Interest) -> Interest {
        self.cancel_timer();
        mask
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::driver::{Layer, MemoryDriver};
    use crate::notifier::WakerBase;

    /// Doubles every byte read; writes pass through reversed per call
    struct Doubler {
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Transform for Doubler {
        fn invoke(&mut self, verb: TransformVerb, payload: &[u8]) -> Result<TransformResult> {
            self.log.borrow_mut().push(verb.name());
            Ok(match verb {
                TransformVerb::Read => {
                    let doubled: Vec<u8> = payload.iter().flat_map(|&b| [b, b]).collect();
                    TransformResult::Buffer(doubled.into())
                }
                TransformVerb::Write => {
                    let mut rev = payload.to_vec();
                    rev.reverse();
                    TransformResult::Downstream(rev.into())
                }
                _ => TransformResult::Discard,
            })
        }
    }

    fn doubler() -> (TransformDriver<Doubler>, Rc<RefCell<Vec<&'static str>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let drv = TransformDriver::new(Doubler { log: log.clone() }, Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        (drv, log)
    }

    fn transport(data: &[u8]) -> (Vec<Layer>, crate::driver::memory::MemoryHandle) {
        let mem = MemoryDriver::new(data.to_vec());
        let handle = mem.handle();
        (
            vec![Layer::new(Box::new(mem), Interest::READABLE | Interest::WRITABLE)],
            handle,
        )
    }

    #[test]
    fn test_create_verbs_run_on_construction() {
        let (_drv, log) = doubler();
        assert_eq!(*log.borrow(), vec!["create/write", "create/read"]);
    }

    #[test]
    fn test_input_doubles_and_flushes_at_eof() {
        let (mut drv, log) = doubler();
        let (mut layers, handle) = transport(b"abc");
        let base = WakerBase::detached();
        let mut below = Below::new(&mut layers, &base);
        let mut buf = [0u8; 4];
        assert_eq!(drv.input(&mut below, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"aabb");
        let mut rest = [0u8; 16];
        assert_eq!(drv.input(&mut below, &mut rest).unwrap(), 2);
        assert_eq!(&rest[..2], b"cc");
        assert_eq!(drv.input(&mut below, &mut rest).unwrap(), 0);
        assert_eq!(handle.position(), 3);
        assert!(log.borrow().contains(&"flush/read"));
    }

    #[test]
    fn test_max_read_caps_raw_reads() {
        let mut calls = 0;
        let transform = move |verb: TransformVerb, payload: &[u8]| -> Result<TransformResult> {
            Ok(match verb {
                TransformVerb::QueryMaxRead => TransformResult::MaxRead(Some(2)),
                TransformVerb::Read => {
                    calls += 1;
                    assert!(payload.len() <= 2, "call {} got {}", calls, payload.len());
                    TransformResult::Buffer(Bytes::copy_from_slice(payload))
                }
                _ => TransformResult::Discard,
            })
        };
        let mut drv = TransformDriver::new(transform, Interest::READABLE).unwrap();
        let (mut layers, handle) = transport(b"abcdefg");
        let base = WakerBase::detached();
        let mut below = Below::new(&mut layers, &base);
        let mut buf = [0u8; 5];
        assert_eq!(drv.input(&mut below, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"abcde");
        assert_eq!(handle.position(), 6);
        assert_eq!(drv.read_ahead(), 1);
    }

    #[test]
    fn test_output_goes_downstream() {
        let (mut drv, _log) = doubler();
        let (mut layers, handle) = transport(b"");
        let base = WakerBase::detached();
        let mut below = Below::new(&mut layers, &base);
        assert_eq!(drv.output(&mut below, b"abc").unwrap(), 3);
        assert_eq!(handle.contents(), b"cba");
    }

    #[test]
    fn test_loopback_feeds_write_again() {
        let transform = |verb: TransformVerb, payload: &[u8]| -> Result<TransformResult> {
            Ok(match (verb, payload) {
                (TransformVerb::Write, [b'!', rest @ ..]) => {
                    TransformResult::Loopback(Bytes::copy_from_slice(rest))
                }
                (TransformVerb::Write, p) => TransformResult::Downstream(Bytes::copy_from_slice(p)),
                _ => TransformResult::Discard,
            })
        };
        let mut drv = TransformDriver::new(transform, Interest::WRITABLE).unwrap();
        let (mut layers, handle) = transport(b"");
        let base = WakerBase::detached();
        let mut below = Below::new(&mut layers, &base);
        drv.output(&mut below, b"!!hi").unwrap();
        assert_eq!(handle.contents(), b"hi");

        let looping = "!".repeat(MAX_LOOPBACK_DEPTH + 2);
        let err = drv.output(&mut below, looping.as_bytes()).unwrap_err();
        assert!(matches!(
            ChannelError::from_driver(err),
            ChannelError::Transform(_)
        ));
    }

    #[test]
    fn test_transform_error_surfaces() {
        let transform = |verb: TransformVerb, _payload: &[u8]| -> Result<TransformResult> {
            match verb {
                TransformVerb::Read => Err(ChannelError::Transform("corrupt block".into())),
                _ => Ok(TransformResult::Discard),
            }
        };
        let mut drv = TransformDriver::new(transform, Interest::READABLE).unwrap();
        let (mut layers, _handle) = transport(b"xyz");
        let base = WakerBase::detached();
        let mut below = Below::new(&mut layers, &base);
        let mut buf = [0u8; 8];
        let err = drv.input(&mut below, &mut buf).unwrap_err();
        assert!(matches!(
            ChannelError::from_driver(err),
            ChannelError::Transform(msg) if msg == "corrupt block"
        ));
    }

    /// Serves its data two bytes at a time and fails once after the first pair
    struct Flaky {
        data: Vec<u8>,
        pos: usize,
        failed: bool,
    }

    impl ChannelDriver for Flaky {
        fn type_name(&self) -> &str {
            "flaky"
        }

        fn input(&mut self, _below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == 2 && !self.failed {
                self.failed = true;
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
            }
            let n = buf.len().min(2).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn output(&mut self, _below: &mut Below<'_>, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn close(&mut self, _below: &mut Below<'_>) -> io::Result<()> {
            Ok(())
        }

        fn watch(&mut self, _below: &mut Below<'_>, _mask: Interest, _waker: &ChannelWaker) {}
    }

    #[test]
    fn test_transport_error_after_partial_read_is_reported_next() {
        let (mut drv, _log) = doubler();
        let flaky = Flaky {
            data: b"abcd".to_vec(),
            pos: 0,
            failed: false,
        };
        let mut layers = vec![Layer::new(Box::new(flaky), Interest::READABLE)];
        let base = WakerBase::detached();
        let mut below = Below::new(&mut layers, &base);
        let mut buf = [0u8; 8];

        assert_eq!(drv.input(&mut below, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"aabb");
        let err = drv.input(&mut below, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(drv.input(&mut below, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ccdd");
        assert_eq!(drv.input(&mut below, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_would_block_after_partial_read_is_not_latched() {
        let (mut drv, _log) = doubler();
        let (a, b) = crate::driver::pipe(None);
        let mut layers = vec![Layer::new(Box::new(a), Interest::READABLE)];
        let mut writer = vec![Layer::new(Box::new(b), Interest::WRITABLE)];
        let base = WakerBase::detached();
        Below::new(&mut writer, &base).write_raw(b"xy").unwrap();

        let mut below = Below::new(&mut layers, &base);
        let mut buf = [0u8; 8];
        assert_eq!(drv.input(&mut below, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"xxyy");
        let err = drv.input(&mut below, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_take_read_ahead_empties_buffer() {
        let (mut drv, _log) = doubler();
        let (mut layers, _handle) = transport(b"abc");
        let base = WakerBase::detached();
        let mut below = Below::new(&mut layers, &base);
        let mut buf = [0u8; 2];
        drv.input(&mut below, &mut buf).unwrap();
        assert_eq!(&buf, b"aa");
        assert_eq!(drv.take_read_ahead(), b"bb");
        assert_eq!(drv.read_ahead(), 0);
    }

    #[test]
    fn test_seek_flushes_and_clears_read_side() {
        let (mut drv, log) = doubler();
        let (mut layers, handle) = transport(b"abcdef");
        let base = WakerBase::detached();
        let mut below = Below::new(&mut layers, &base);
        let mut buf = [0u8; 2];
        drv.input(&mut below, &mut buf).unwrap();
        assert!(drv.read_ahead() > 0);
        assert_eq!(drv.wide_seek(&mut below, 0, SeekMode::Current).unwrap(), 2);
        assert!(drv.read_ahead() > 0);

        assert_eq!(drv.wide_seek(&mut below, 1, SeekMode::Start).unwrap(), 1);
        assert_eq!(drv.read_ahead(), 0);
        assert_eq!(handle.position(), 1);
        let verbs = log.borrow();
        assert!(verbs.contains(&"flush/write"));
        assert!(verbs.contains(&"clear/read"));
    }

    #[test]
    fn test_close_runs_delete_verbs() {
        let (mut drv, log) = doubler();
        let (mut layers, _handle) = transport(b"");
        let base = WakerBase::detached();
        drv.close(&mut Below::new(&mut layers, &base)).unwrap();
        let verbs = log.borrow();
        let tail: Vec<&str> = verbs.iter().rev().take(4).rev().copied().collect();
        assert_eq!(tail, vec!["flush/write", "delete/write", "flush/read", "delete/read"]);
    }

    #[test]
    fn test_verb_names() {
        assert_eq!(TransformVerb::QueryMaxRead.name(), "query/maxRead");
        assert_eq!(TransformVerb::ClearRead.name(), "clear/read");
    }
}
