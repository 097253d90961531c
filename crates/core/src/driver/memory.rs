//! In-memory transports
//!
//! `MemoryDriver` behaves like a seekable file held in memory; its
//! [`MemoryHandle`] lets a test shape delivery (burst size, scripted
//! would-block, injected read and write errors) and inspect the bytes after the
//! channel has taken ownership of the driver.
//!
//! `pipe()` returns two connected, non-seekable ends with an optional
//! capacity, reporting readiness level-triggered through the notifier.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use bytes::{Buf, BytesMut};

use super::{Below, ChannelDriver, Direction, DriverVersion, Interest, RawHandle, SeekMode};
use crate::error::{would_block, ChannelError, Result};
use crate::notifier::ChannelWaker;

#[derive(Debug, Default)]
struct Store {
    data: Vec<u8>,
    pos: usize,
    read_burst: Option<usize>,
    write_burst: Option<usize>,
    block_reads: usize,
    block_writes: usize,
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
    input_calls: usize,
    output_calls: usize,
    nonblocking: bool,
    closed: bool,
    half_closed: Vec<Direction>,
}

/// Seekable in-memory transport
pub struct MemoryDriver {
    store: Rc<RefCell<Store>>,
    version: DriverVersion,
    half_close: bool,
}

/// Test-side view of a [`MemoryDriver`]
#[derive(Clone)]
pub struct MemoryHandle {
    store: Rc<RefCell<Store>>,
}

impl MemoryDriver {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            store: Rc::new(RefCell::new(Store {
                data: data.into(),
                ..Store::default()
            })),
            version: DriverVersion::V3,
            half_close: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Deliver at most `n` bytes per input call
    pub fn with_read_burst(self, n: usize) -> Self {
        self.store.borrow_mut().read_burst = Some(n.max(1));
        self
    }

    /// Accept at most `n` bytes per output call
    pub fn with_write_burst(self, n: usize) -> Self {
        self.store.borrow_mut().write_burst = Some(n.max(1));
        self
    }

    pub fn with_version(mut self, version: DriverVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_half_close(mut self) -> Self {
        self.half_close = true;
        self
    }

    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            store: self.store.clone(),
        }
    }
}

impl MemoryHandle {
    /// Everything currently stored
    pub fn contents(&self) -> Vec<u8> {
        self.store.borrow().data.clone()
    }

    /// Transport position (bytes delivered or written so far)
    pub fn position(&self) -> usize {
        self.store.borrow().pos
    }

    /// Append bytes past the current end (a file growing under a reader)
    pub fn extend(&self, bytes: &[u8]) {
        self.store.borrow_mut().data.extend_from_slice(bytes);
    }

    pub fn set_read_burst(&self, n: Option<usize>) {
        self.store.borrow_mut().read_burst = n.map(|n| n.max(1));
    }

    /// Make the next `n` input calls report would-block
    pub fn block_next_reads(&self, n: usize) {
        self.store.borrow_mut().block_reads = n;
    }

    /// Make the next `n` output calls report would-block
    pub fn block_next_writes(&self, n: usize) {
        self.store.borrow_mut().block_writes = n;
    }

    /// Fail every input call with `kind` (None clears)
    pub fn fail_reads(&self, kind: Option<io::ErrorKind>) {
        self.store.borrow_mut().read_error = kind;
    }

    /// Fail every output call with `kind` (None clears)
    pub fn fail_writes(&self, kind: Option<io::ErrorKind>) {
        self.store.borrow_mut().write_error = kind;
    }

    pub fn input_calls(&self) -> usize {
        self.store.borrow().input_calls
    }

    pub fn output_calls(&self) -> usize {
        self.store.borrow().output_calls
    }

    pub fn is_closed(&self) -> bool {
        self.store.borrow().closed
    }

    pub fn is_nonblocking(&self) -> bool {
        self.store.borrow().nonblocking
    }

    pub fn closed_directions(&self) -> Vec<Direction> {
        self.store.borrow().half_closed.clone()
    }
}

impl ChannelDriver for MemoryDriver {
    fn type_name(&self) -> &str {
        "memory"
    }

    fn version(&self) -> DriverVersion {
        self.version
    }

    fn input(&mut self, _below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.store.borrow_mut();
        st.input_calls += 1;
        if let Some(kind) = st.read_error {
            return Err(io::Error::new(kind, "injected read failure"));
        }
        if st.block_reads > 0 {
            st.block_reads -= 1;
            return Err(would_block());
        }
        let avail = st.data.len().saturating_sub(st.pos);
        let mut n = avail.min(buf.len());
        if let Some(burst) = st.read_burst {
            n = n.min(burst);
        }
        let start = st.pos;
        buf[..n].copy_from_slice(&st.data[start..start + n]);
        st.pos += n;
        Ok(n)
    }

    fn output(&mut self, _below: &mut Below<'_>, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.store.borrow_mut();
        st.output_calls += 1;
        if let Some(kind) = st.write_error {
            return Err(io::Error::new(kind, "injected write failure"));
        }
        if st.block_writes > 0 {
            st.block_writes -= 1;
            return Err(would_block());
        }
        let mut n = buf.len();
        if let Some(burst) = st.write_burst {
            n = n.min(burst);
        }
        let pos = st.pos;
        let end = pos + n;
        if st.data.len() < end {
            st.data.resize(end, 0);
        }
        st.data[pos..end].copy_from_slice(&buf[..n]);
        st.pos = end;
        Ok(n)
    }

    fn close(&mut self, _below: &mut Below<'_>) -> io::Result<()> {
        self.store.borrow_mut().closed = true;
        Ok(())
    }

    fn supports_half_close(&self) -> bool {
        self.half_close
    }

    fn close_half(&mut self, _below: &mut Below<'_>, dir: Direction) -> io::Result<()> {
        self.store.borrow_mut().half_closed.push(dir);
        Ok(())
    }

    fn seek(&mut self, below: &mut Below<'_>, offset: i32, mode: SeekMode) -> io::Result<i32> {
        let pos = self.wide_seek(below, i64::from(offset), mode)?;
        i32::try_from(pos).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "position overflow"))
    }

    fn wide_seek(&mut self, _below: &mut Below<'_>, offset: i64, mode: SeekMode) -> io::Result<i64> {
        let mut st = self.store.borrow_mut();
        let base = match mode {
            SeekMode::Start => 0,
            SeekMode::Current => st.pos as i64,
            SeekMode::End => st.data.len() as i64,
        };
        let target = base + offset;
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek position"));
        }
        st.pos = target as usize;
        Ok(target)
    }

    fn set_blocking(&mut self, _below: &mut Below<'_>, blocking: bool) -> io::Result<()> {
        self.store.borrow_mut().nonblocking = !blocking;
        Ok(())
    }

    fn watch(&mut self, _below: &mut Below<'_>, mask: Interest, waker: &ChannelWaker) {
        // Like a regular file: always ready for whatever is asked.
        waker.set_source(mask, || Interest::READABLE | Interest::WRITABLE);
    }

    fn handle(&mut self, _below: &mut Below<'_>, _dir: Direction) -> Option<RawHandle> {
        Some(Rc::as_ptr(&self.store) as usize as RawHandle)
    }

    fn get_option(&mut self, _below: &mut Below<'_>, name: &str) -> Result<String> {
        match name.trim_start_matches('-') {
            "burst" => Ok(self
                .store
                .borrow()
                .read_burst
                .map(|n| n.to_string())
                .unwrap_or_default()),
            _ => Err(ChannelError::unknown_option(name, &["burst"])),
        }
    }

    fn set_option(&mut self, _below: &mut Below<'_>, name: &str, value: &str) -> Result<()> {
        match name.trim_start_matches('-') {
            "burst" => {
                let burst = if value.is_empty() {
                    None
                } else {
                    Some(value.parse::<usize>().map_err(|_| {
                        ChannelError::bad_value("burst", format!("expected integer but got \"{}\"", value))
                    })?)
                };
                self.store.borrow_mut().read_burst = burst.map(|n| n.max(1));
                Ok(())
            }
            _ => Err(ChannelError::unknown_option(name, &["burst"])),
        }
    }

    fn options(&mut self, below: &mut Below<'_>) -> Vec<(String, String)> {
        let burst = self.get_option(below, "burst").unwrap_or_default();
        vec![("burst".to_string(), burst)]
    }
}

#[derive(Debug, Default)]
struct PipeBuf {
    data: BytesMut,
    capacity: Option<usize>,
    writer_closed: bool,
    reader_closed: bool,
}

impl PipeBuf {
    fn space(&self) -> usize {
        match self.capacity {
            Some(cap) => cap.saturating_sub(self.data.len()),
            None => usize::MAX,
        }
    }
}

/// One end of an in-memory pipe
pub struct PipeDriver {
    incoming: Rc<RefCell<PipeBuf>>,
    outgoing: Rc<RefCell<PipeBuf>>,
    read_burst: Option<usize>,
}

/// Two connected pipe ends; bytes written to one are read from the other.
///
/// `capacity` bounds the bytes in flight per direction; a full pipe makes
/// writes report would-block.
pub fn pipe(capacity: Option<usize>) -> (PipeDriver, PipeDriver) {
    let a_to_b = Rc::new(RefCell::new(PipeBuf {
        capacity,
        ..PipeBuf::default()
    }));
    let b_to_a = Rc::new(RefCell::new(PipeBuf {
        capacity,
        ..PipeBuf::default()
    }));
    (
        PipeDriver {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
            read_burst: None,
        },
        PipeDriver {
            incoming: a_to_b,
            outgoing: b_to_a,
            read_burst: None,
        },
    )
}

impl PipeDriver {
    pub fn with_read_burst(mut self, n: usize) -> Self {
        self.read_burst = Some(n.max(1));
        self
    }

    fn readiness(incoming: &RefCell<PipeBuf>, outgoing: &RefCell<PipeBuf>) -> Interest {
        let mut ready = Interest::empty();
        {
            let inc = incoming.borrow();
            if !inc.data.is_empty() || inc.writer_closed {
                ready |= Interest::READABLE;
            }
        }
        {
            let out = outgoing.borrow();
            if out.space() > 0 || out.reader_closed {
                ready |= Interest::WRITABLE;
            }
        }
        ready
    }
}

impl ChannelDriver for PipeDriver {
    fn type_name(&self) -> &str {
        "pipe"
    }

    fn input(&mut self, _below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize> {
        let mut inc = self.incoming.borrow_mut();
        if inc.data.is_empty() {
            if inc.writer_closed {
                return Ok(0);
            }
            return Err(would_block());
        }
        let mut n = inc.data.len().min(buf.len());
        if let Some(burst) = self.read_burst {
            n = n.min(burst);
        }
        buf[..n].copy_from_slice(&inc.data[..n]);
        inc.data.advance(n);
        Ok(n)
    }

    fn output(&mut self, _below: &mut Below<'_>, buf: &[u8]) -> io::Result<usize> {
        let mut out = self.outgoing.borrow_mut();
        if out.reader_closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader closed"));
        }
        let n = buf.len().min(out.space());
        if n == 0 && !buf.is_empty() {
            return Err(would_block());
        }
        out.data.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self, _below: &mut Below<'_>) -> io::Result<()> {
        self.outgoing.borrow_mut().writer_closed = true;
        self.incoming.borrow_mut().reader_closed = true;
        Ok(())
    }

    fn watch(&mut self, _below: &mut Below<'_>, mask: Interest, waker: &ChannelWaker) {
        let incoming = self.incoming.clone();
        let outgoing = self.outgoing.clone();
        waker.set_source(mask, move || PipeDriver::readiness(&incoming, &outgoing));
    }
}
