//! Channel driver abstraction
//!
//! A driver supplies the transport (or a transformation) for one layer of a
//! channel stack. The core never assumes a concrete transport: everything it
//! needs goes through [`ChannelDriver`]. Stacked drivers reach the layers
//! beneath them through [`Below`].

pub mod memory;

use std::io;

use bitflags::bitflags;

use crate::buffer::BufferQueue;
use crate::error::{ChannelError, Result};
use crate::notifier::{ChannelWaker, WakerBase};

pub use memory::{pipe, MemoryDriver, MemoryHandle, PipeDriver};

/// OS-level handle exposed by a transport (file descriptor, socket, ...)
pub type RawHandle = i64;

bitflags! {
    /// Readiness / interest mask, also used for a channel's open mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u8 {
        const READABLE  = 0b0001;
        const WRITABLE  = 0b0010;
        const EXCEPTION = 0b0100;
    }
}

/// One side of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

/// Origin for a seek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Start,
    Current,
    End,
}

/// Which optional driver operations are present.
///
/// - `V1`: input, output, narrow seek, close, options, watch, handle, blocking mode
/// - `V2`: adds the event hook ([`ChannelDriver::handler`])
/// - `V3`: adds 64-bit seeking ([`ChannelDriver::wide_seek`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DriverVersion {
    V1,
    V2,
    V3,
}

fn unsupported(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, what.to_string())
}

/// Capability set every transport or transformation layer implements.
///
/// Conventions: `input` returns `Ok(0)` at end of file and an error of kind
/// [`io::ErrorKind::WouldBlock`] when a non-blocking transport has nothing
/// to offer. Optional operations have defaults matching an absent entry.
pub trait ChannelDriver {
    /// Short type name ("memory", "file", "transform", ...)
    fn type_name(&self) -> &str;

    fn version(&self) -> DriverVersion {
        DriverVersion::V3
    }

    fn input(&mut self, below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize>;

    fn output(&mut self, below: &mut Below<'_>, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self, below: &mut Below<'_>) -> io::Result<()>;

    /// Close one direction only; only called when [`Self::supports_half_close`] is true
    fn close_half(&mut self, _below: &mut Below<'_>, _dir: Direction) -> io::Result<()> {
        Err(unsupported("half close"))
    }

    fn supports_half_close(&self) -> bool {
        false
    }

    /// 32-bit seek used by drivers older than `V3`
    fn seek(&mut self, _below: &mut Below<'_>, _offset: i32, _mode: SeekMode) -> io::Result<i32> {
        Err(unsupported("seek"))
    }

    /// 64-bit seek, used from `V3` on
    fn wide_seek(&mut self, _below: &mut Below<'_>, _offset: i64, _mode: SeekMode) -> io::Result<i64> {
        Err(unsupported("seek"))
    }

    fn set_blocking(&mut self, _below: &mut Below<'_>, _blocking: bool) -> io::Result<()> {
        Ok(())
    }

    /// Declare interest in readiness events; report them through `waker`
    fn watch(&mut self, below: &mut Below<'_>, mask: Interest, waker: &ChannelWaker);

    fn handle(&mut self, _below: &mut Below<'_>, _dir: Direction) -> Option<RawHandle> {
        None
    }

    fn get_option(&mut self, _below: &mut Below<'_>, name: &str) -> Result<String> {
        Err(ChannelError::unknown_option(name, &[]))
    }

    fn set_option(&mut self, _below: &mut Below<'_>, name: &str, _value: &str) -> Result<()> {
        Err(ChannelError::unknown_option(name, &[]))
    }

    /// Driver-specific options as (name, value) pairs
    fn options(&mut self, _below: &mut Below<'_>) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Transformed input held inside the driver that no reader has taken.
    ///
    /// Called when the layer is removed from the middle of a stack; the
    /// bytes are handed to the layer above.
    fn take_read_ahead(&mut self) -> Vec<u8> {
        Vec::new()
    }

    /// Event hook (`V2`+): sees events coming up from the layer below and
    /// returns the mask to pass on. An empty mask swallows the event.
    fn handler(&mut self, mask: Interest) -> Interest {
        mask
    }
}

/// One layer of a channel stack
pub(crate) struct Layer {
    pub(crate) driver: Box<dyn ChannelDriver>,
    pub(crate) mode: Interest,
    /// Bytes this layer produced that the layer above has not consumed
    pub(crate) unread: BufferQueue,
}

impl Layer {
    pub(crate) fn new(driver: Box<dyn ChannelDriver>, mode: Interest) -> Self {
        Self {
            driver,
            mode,
            unread: BufferQueue::new(),
        }
    }
}

/// Handle on the layers beneath the one being called
pub struct Below<'a> {
    pub(crate) layers: &'a mut [Layer],
    pub(crate) base: &'a WakerBase,
}

impl<'a> Below<'a> {
    pub(crate) fn new(layers: &'a mut [Layer], base: &'a WakerBase) -> Self {
        Self { layers, base }
    }

    /// Number of layers below; zero for the transport itself
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn split(&mut self) -> io::Result<(&mut Layer, Below<'_>)> {
        let base = self.base;
        match self.layers.split_last_mut() {
            Some((last, rest)) => Ok((last, Below { layers: rest, base })),
            None => Err(io::Error::new(io::ErrorKind::Unsupported, "no channel below")),
        }
    }

    /// Raw read from the layer below, serving its pushed-back bytes first
    pub fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (layer, mut below) = self.split()?;
        if !layer.unread.is_empty() {
            return Ok(layer.unread.take_into(buf, |_| {}));
        }
        layer.driver.input(&mut below, buf)
    }

    /// Raw write to the layer below
    pub fn write_raw(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (layer, mut below) = self.split()?;
        layer.driver.output(&mut below, buf)
    }

    /// Seek the layer below; a real move drops its pushed-back bytes
    pub fn seek(&mut self, offset: i64, mode: SeekMode) -> io::Result<i64> {
        let (layer, mut below) = self.split()?;
        if !(offset == 0 && mode == SeekMode::Current) {
            layer.unread = BufferQueue::new();
        }
        seek_layer(layer, &mut below, offset, mode).map_err(|e| match e {
            ChannelError::Io(io) => io,
            other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
        })
    }

    pub fn watch(&mut self, mask: Interest) {
        let depth = self.layers.len().saturating_sub(1);
        let waker = self.base.waker(depth);
        if let Ok((layer, mut below)) = self.split() {
            layer.driver.watch(&mut below, mask, &waker);
        }
    }

    pub fn handle(&mut self, dir: Direction) -> Option<RawHandle> {
        let (layer, mut below) = self.split().ok()?;
        layer.driver.handle(&mut below, dir)
    }

    pub fn get_option(&mut self, name: &str) -> Result<String> {
        let (layer, mut below) = self.split()?;
        layer.driver.get_option(&mut below, name)
    }

    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        let (layer, mut below) = self.split()?;
        layer.driver.set_option(&mut below, name, value)
    }

    pub fn options(&mut self) -> Vec<(String, String)> {
        match self.split() {
            Ok((layer, mut below)) => layer.driver.options(&mut below),
            Err(_) => Vec::new(),
        }
    }
}

/// Seek one layer, falling back to the 32-bit entry point for old drivers.
pub(crate) fn seek_layer(
    layer: &mut Layer,
    below: &mut Below<'_>,
    offset: i64,
    mode: SeekMode,
) -> Result<i64> {
    let result = if layer.driver.version() >= DriverVersion::V3 {
        layer.driver.wide_seek(below, offset, mode)
    } else {
        let narrow = i32::try_from(offset).map_err(|_| ChannelError::Overflow(offset))?;
        layer.driver.seek(below, narrow, mode).map(i64::from)
    };
    result.map_err(|e| {
        if e.kind() == io::ErrorKind::Unsupported {
            ChannelError::NotSeekable(layer.driver.type_name().to_string())
        } else {
            ChannelError::from_driver(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_mask_ops() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.contains(Interest::READABLE));
        assert!((both & Interest::EXCEPTION).is_empty());
        assert_eq!(Direction::Write.interest(), Interest::WRITABLE);
    }

    #[test]
    fn test_version_ordering() {
        assert!(DriverVersion::V1 < DriverVersion::V3);
        assert!(DriverVersion::V2 >= DriverVersion::V2);
    }

    #[test]
    fn test_narrow_seek_overflow() {
        let mut layer = Layer::new(
            Box::new(MemoryDriver::new(b"abc".to_vec()).with_version(DriverVersion::V1)),
            Interest::READABLE,
        );
        let base = WakerBase::detached();
        let mut below = Below::new(&mut [], &base);
        let err = seek_layer(&mut layer, &mut below, i64::from(i32::MAX) + 1, SeekMode::Start).unwrap_err();
        assert!(matches!(err, ChannelError::Overflow(_)));
        assert_eq!(seek_layer(&mut layer, &mut below, 2, SeekMode::Start).unwrap(), 2);
    }

    #[test]
    fn test_below_empty_reports_unsupported() {
        let base = WakerBase::detached();
        let mut below = Below::new(&mut [], &base);
        let mut buf = [0u8; 4];
        assert!(below.read_raw(&mut buf).is_err());
        assert!(below.is_empty());
    }
}
