//! Channel buffers, the per-channel spare pool and FIFO buffer queues
//!
//! A `ChannelBuffer` is a fixed-capacity byte array with two cursors:
//! `next_removed` (read side) and `next_added` (write side). Buffers move
//! between a channel's input queue, its output queue and a tiny spare pool so
//! steady small I/O does not allocate on every call.
//!
//! Invariant: `0 <= next_removed <= next_added <= capacity`.

use std::collections::VecDeque;

/// Fixed-capacity byte buffer with read/write cursors
#[derive(Debug)]
pub struct ChannelBuffer {
    data: Box<[u8]>,
    next_added: usize,
    next_removed: usize,
}

impl ChannelBuffer {
    /// Allocate a zeroed buffer able to hold `length` bytes
    pub fn with_capacity(length: usize) -> Self {
        Self {
            data: vec![0u8; length].into_boxed_slice(),
            next_added: 0,
            next_removed: 0,
        }
    }

    /// Buffer holding a copy of `bytes`, exactly full
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
            next_added: bytes.len(),
            next_removed: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes queued and not yet removed
    #[inline]
    pub fn len(&self) -> usize {
        self.next_added - self.next_removed
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.next_added == self.next_removed
    }

    /// Room left at the write end
    #[inline]
    pub fn space(&self) -> usize {
        self.data.len() - self.next_added
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.next_added == self.data.len()
    }

    #[inline]
    pub fn next_added(&self) -> usize {
        self.next_added
    }

    #[inline]
    pub fn next_removed(&self) -> usize {
        self.next_removed
    }

    /// Readable bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.next_removed..self.next_added]
    }

    /// Writable tail; commit with [`ChannelBuffer::commit`]
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.next_added..]
    }

    /// Mark `n` bytes of the spare tail as written
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.space());
        self.next_added = (self.next_added + n).min(self.data.len());
    }

    /// Append as much of `bytes` as fits, returning the count taken.
    ///
    /// Whatever does not fit is the caller's carry for the next buffer.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.space());
        self.data[self.next_added..self.next_added + n].copy_from_slice(&bytes[..n]);
        self.next_added += n;
        n
    }

    /// Drop `n` bytes from the read side
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.next_removed = (self.next_removed + n).min(self.next_added);
    }

    /// Copy readable bytes into `dst`, consuming them
    pub fn take_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        dst[..n].copy_from_slice(&self.data[self.next_removed..self.next_removed + n]);
        self.next_removed += n;
        n
    }

    #[inline]
    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        let idx = self.next_removed + offset;
        if idx < self.next_added {
            Some(self.data[idx])
        } else {
            None
        }
    }

    /// Rewind both cursors for reuse
    pub fn reset(&mut self) {
        self.next_added = 0;
        self.next_removed = 0;
    }
}

/// Which queue a pooled buffer is destined for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    Input,
    Output,
}

/// At most three spare buffers per channel: one for the input queue, one
/// extra input spare and one for the current output buffer.
#[derive(Debug, Default)]
pub struct BufferPool {
    spare_in: Option<ChannelBuffer>,
    save_in: Option<ChannelBuffer>,
    spare_out: Option<ChannelBuffer>,
    allocations: u64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a buffer of at least `size` bytes, reusing a spare when one fits.
    pub fn allocate(&mut self, role: BufferRole, size: usize) -> ChannelBuffer {
        let candidate = match role {
            BufferRole::Input => self.spare_in.take().or_else(|| self.save_in.take()),
            BufferRole::Output => self.spare_out.take(),
        };
        match candidate {
            Some(mut buf) if buf.capacity() >= size => {
                buf.reset();
                buf
            }
            _ => {
                self.allocations += 1;
                ChannelBuffer::with_capacity(size)
            }
        }
    }

    /// Return a drained buffer.
    ///
    /// Freed outright when `must_discard` is set or when it is smaller than
    /// the channel's configured size (the size may have grown since the
    /// buffer was allocated); kept otherwise as long as a slot for its
    /// direction is free.
    pub fn recycle(
        &mut self,
        mut buf: ChannelBuffer,
        must_discard: bool,
        size: usize,
        readable: bool,
        writable: bool,
    ) {
        if must_discard || buf.capacity() < size {
            return;
        }
        buf.reset();
        if readable {
            if self.spare_in.is_none() {
                self.spare_in = Some(buf);
                return;
            }
            if self.save_in.is_none() {
                self.save_in = Some(buf);
                return;
            }
        }
        if writable && self.spare_out.is_none() {
            self.spare_out = Some(buf);
        }
    }

    /// Drop every spare (buffer size change, channel teardown)
    pub fn clear(&mut self) {
        self.spare_in = None;
        self.save_in = None;
        self.spare_out = None;
    }

    pub fn spares(&self) -> usize {
        [&self.spare_in, &self.save_in, &self.spare_out]
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Number of fresh heap allocations made so far
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

/// Position inside a [`BufferQueue`]: buffer index plus offset into that
/// buffer's readable bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuePos {
    pub buf: usize,
    pub offset: usize,
}

/// Strict FIFO of buffers
#[derive(Debug, Default)]
pub struct BufferQueue {
    bufs: VecDeque<ChannelBuffer>,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, buf: ChannelBuffer) {
        self.bufs.push_back(buf);
    }

    pub fn push_front(&mut self, buf: ChannelBuffer) {
        self.bufs.push_front(buf);
    }

    pub fn pop_front(&mut self) -> Option<ChannelBuffer> {
        self.bufs.pop_front()
    }

    pub fn front(&self) -> Option<&ChannelBuffer> {
        self.bufs.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut ChannelBuffer> {
        self.bufs.front_mut()
    }

    pub fn back_mut(&mut self) -> Option<&mut ChannelBuffer> {
        self.bufs.back_mut()
    }

    pub fn get(&self, idx: usize) -> Option<&ChannelBuffer> {
        self.bufs.get(idx)
    }

    /// Number of buffers (not bytes)
    pub fn buffers(&self) -> usize {
        self.bufs.len()
    }

    /// Total readable bytes across the queue
    pub fn bytes(&self) -> usize {
        self.bufs.iter().map(ChannelBuffer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.iter().all(ChannelBuffer::is_empty)
    }

    /// Move every buffer of `other` to the back of this queue
    pub fn append(&mut self, other: &mut BufferQueue) {
        self.bufs.append(&mut other.bufs);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ChannelBuffer> + '_ {
        self.bufs.drain(..)
    }

    /// Copy out up to `dst.len()` bytes from the head, consuming them.
    ///
    /// Emptied buffers are handed to `on_drained` for recycling.
    pub fn take_into(
        &mut self,
        dst: &mut [u8],
        mut on_drained: impl FnMut(ChannelBuffer),
    ) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(front) = self.bufs.front_mut() else {
                break;
            };
            copied += front.take_into(&mut dst[copied..]);
            if front.is_empty() {
                if let Some(done) = self.bufs.pop_front() {
                    on_drained(done);
                }
            }
        }
        copied
    }

    /// Consume everything before `pos`, recycling buffers emptied on the way.
    pub fn consume_to(&mut self, pos: QueuePos, mut on_drained: impl FnMut(ChannelBuffer)) {
        for _ in 0..pos.buf {
            if let Some(done) = self.bufs.pop_front() {
                on_drained(done);
            }
        }
        if let Some(front) = self.bufs.front_mut() {
            front.consume(pos.offset.min(front.len()));
            if front.is_empty() {
                if let Some(done) = self.bufs.pop_front() {
                    on_drained(done);
                }
            }
        }
    }

    /// Readable bytes between the head and `pos`
    pub fn bytes_before(&self, pos: QueuePos) -> usize {
        self.bufs
            .iter()
            .take(pos.buf)
            .map(ChannelBuffer::len)
            .sum::<usize>()
            + pos.offset
    }

    /// Copy of every queued byte, head first (diagnostics and tests)
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes());
        for buf in &self.bufs {
            out.extend_from_slice(buf.as_slice());
        }
        out
    }
}

/// Cursor walking the readable bytes of a queue across buffer boundaries
/// without consuming anything.
pub struct QueueCursor<'a> {
    queue: &'a BufferQueue,
    pos: QueuePos,
}

impl<'a> QueueCursor<'a> {
    pub fn new(queue: &'a BufferQueue, pos: QueuePos) -> Self {
        let mut cursor = Self { queue, pos };
        cursor.normalize();
        cursor
    }

    pub fn position(&self) -> QueuePos {
        self.pos
    }

    pub fn set_position(&mut self, pos: QueuePos) {
        self.pos = pos;
        self.normalize();
    }

    /// Byte `ahead` positions past the cursor, if already queued
    pub fn peek(&self, ahead: usize) -> Option<u8> {
        let mut idx = self.pos.buf;
        let mut offset = self.pos.offset + ahead;
        loop {
            let buf = self.queue.get(idx)?;
            if offset < buf.len() {
                return buf.byte_at(offset);
            }
            offset -= buf.len();
            idx += 1;
        }
    }

    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(buf) = self.queue.get(self.pos.buf) else {
                return;
            };
            let left = buf.len() - self.pos.offset;
            if n < left {
                self.pos.offset += n;
                return;
            }
            n -= left;
            self.pos.buf += 1;
            self.pos.offset = 0;
        }
        self.normalize();
    }

    // Skip past exhausted buffers so positions compare consistently.
    fn normalize(&mut self) {
        while let Some(buf) = self.queue.get(self.pos.buf) {
            if self.pos.offset < buf.len() {
                break;
            }
            if self.queue.get(self.pos.buf + 1).is_none() {
                break;
            }
            self.pos.offset -= buf.len();
            self.pos.buf += 1;
        }
    }
}
