//! Outgoing write queue
//!
//! Encoded frames are queued here and handed to the transport one write at a
//! time. Small frames are corked into a shared buffer so a burst of control
//! frames or short messages leaves as a single write; large frames are queued
//! as-is without copying.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Frames at most this long are corked instead of queued separately
const CORK_FRAME_LIMIT: usize = 1024;

/// Ordered queue of encoded frames with a single write in flight
#[derive(Debug)]
pub struct SendQueue {
    /// Sealed chunks, oldest first
    chunks: VecDeque<Bytes>,
    /// Small frames newer than every sealed chunk
    cork: BytesMut,
    /// Cork buffer capacity
    cork_size: usize,
    /// Bytes in `chunks` and `cork`
    queued: usize,
    /// Length of the write handed to the transport
    in_flight: Option<usize>,
}

impl SendQueue {
    /// Create a queue with the given cork buffer size
    pub fn new(cork_size: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            cork: BytesMut::new(),
            cork_size,
            queued: 0,
            in_flight: None,
        }
    }

    /// Append one encoded frame
    pub fn push(&mut self, frame: Bytes) {
        let len = frame.len();
        if len == 0 {
            return;
        }
        self.queued += len;

        if len <= CORK_FRAME_LIMIT && self.cork.len() + len <= self.cork_size {
            self.cork.extend_from_slice(&frame);
            return;
        }

        self.seal();
        self.chunks.push_back(frame);
    }

    /// Move corked bytes behind the sealed chunks
    fn seal(&mut self) {
        if !self.cork.is_empty() {
            self.chunks.push_back(self.cork.split().freeze());
        }
    }

    /// Take the next write if none is in flight
    pub fn next_write(&mut self) -> Option<Bytes> {
        if self.in_flight.is_some() {
            return None;
        }
        self.seal();
        let chunk = self.chunks.pop_front()?;
        self.queued -= chunk.len();
        self.in_flight = Some(chunk.len());
        Some(chunk)
    }

    /// Mark the in-flight write as finished
    ///
    /// Returns the number of bytes it carried.
    pub fn complete(&mut self) -> usize {
        self.in_flight.take().unwrap_or(0)
    }

    /// True while a write is with the transport
    #[inline]
    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// True when nothing is queued or in flight
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queued == 0
    }

    /// Bytes queued plus bytes in flight
    #[inline]
    pub fn buffered_amount(&self) -> usize {
        self.queued + self.in_flight.unwrap_or(0)
    }

    /// Drop everything and release the buffers
    pub fn clear(&mut self) {
        self.chunks = VecDeque::new();
        self.cork = BytesMut::new();
        self.queued = 0;
        self.in_flight = None;
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new(crate::COALESCE_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_write_in_flight() {
        let mut q = SendQueue::new(16);
        q.push(Bytes::from_static(&[1; 2000]));
        q.push(Bytes::from_static(&[2; 3000]));
        assert_eq!(q.buffered_amount(), 5000);

        let first = q.next_write().unwrap();
        assert_eq!(first.len(), 2000);
        assert!(q.in_flight());
        assert!(q.next_write().is_none());
        assert_eq!(q.buffered_amount(), 5000);

        assert_eq!(q.complete(), 2000);
        assert_eq!(q.next_write().unwrap().len(), 3000);
        q.complete();
        assert!(q.is_idle());
        assert!(q.next_write().is_none());
    }

    #[test]
    fn test_small_frames_corked() {
        let mut q = SendQueue::new(64);
        q.push(Bytes::from_static(b"ab"));
        q.push(Bytes::from_static(b"cd"));
        q.push(Bytes::from_static(b"ef"));

        assert_eq!(&q.next_write().unwrap()[..], b"abcdef");
        q.complete();
        assert!(q.is_idle());
    }

    #[test]
    fn test_order_preserved_across_cork_and_chunks() {
        let mut q = SendQueue::new(4);
        q.push(Bytes::from_static(b"a"));
        q.push(Bytes::from_static(b"bcdef"));
        q.push(Bytes::from_static(b"g"));
        q.push(Bytes::from_static(b"h"));

        let mut out = Vec::new();
        while let Some(chunk) = q.next_write() {
            out.extend_from_slice(&chunk);
            q.complete();
        }
        assert_eq!(out, b"abcdefgh");
    }

    #[test]
    fn test_clear() {
        let mut q = SendQueue::default();
        q.push(Bytes::from_static(b"xyz"));
        q.next_write();
        q.push(Bytes::from_static(b"more"));
        q.clear();
        assert!(q.is_idle());
        assert_eq!(q.buffered_amount(), 0);
    }
}
