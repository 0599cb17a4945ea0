//! Fixed-capacity circular byte buffer
//!
//! One slot is always left unused, so that `head == tail` means empty and
//! `head + 1 == tail` (modulo capacity) means full. A buffer with `N` bytes of
//! storage therefore holds at most `N - 1` bytes.

use core::borrow::BorrowMut;

/// A single-producer, single-consumer byte ring
///
/// The producer only moves `head`, and the consumer only moves `tail`.
pub struct RingBuffer<S: BorrowMut<[u8]>> {
    store: S,
    head: usize,
    tail: usize,
}

impl<S: BorrowMut<[u8]>> RingBuffer<S> {
    /// Create an empty ring over `store`
    ///
    /// # Panics
    ///
    /// Panics if `store` is smaller than two bytes.
    pub fn new(store: S) -> Self {
        assert!(store.borrow().len() >= 2, "ring storage too small");
        RingBuffer {
            store,
            head: 0,
            tail: 0,
        }
    }

    /// Size of the backing storage
    pub fn capacity(&self) -> usize {
        self.store.borrow().len()
    }

    /// Number of bytes waiting to be read
    pub fn len(&self) -> usize {
        let capacity = self.capacity();
        (self.head + capacity - self.tail) % capacity
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        (self.head + 1) % self.capacity() == self.tail
    }

    /// Number of bytes that can be enqueued before the ring is full
    pub fn available_space(&self) -> usize {
        self.capacity() - self.len() - 1
    }

    /// Drop all contents
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Append as much of `data` as fits, returning the number of bytes accepted
    pub fn enqueue(&mut self, data: &[u8]) -> usize {
        self.enqueue_masked(data, 0xFF)
    }

    /// Like [`enqueue`](Self::enqueue), storing `byte & mask` for every byte
    pub fn enqueue_masked(&mut self, data: &[u8], mask: u8) -> usize {
        let count = data.len().min(self.available_space());
        let capacity = self.capacity();

        // at most two spans: head..end, then 0..
        let first = count.min(capacity - self.head);
        let (front, back) = data[..count].split_at(first);
        let store = self.store.borrow_mut();
        for (dst, src) in store[self.head..self.head + first].iter_mut().zip(front) {
            *dst = src & mask;
        }
        for (dst, src) in store[..back.len()].iter_mut().zip(back) {
            *dst = src & mask;
        }

        self.head = (self.head + count) % capacity;
        count
    }

    /// Move up to `out.len()` bytes out of the ring
    pub fn dequeue(&mut self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            let span = self.readable();
            if span.is_empty() {
                break;
            }
            let n = span.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&span[..n]);
            copied += n;
            self.consume(n);
        }
        copied
    }

    /// The contiguous run of unread bytes starting at `tail`
    ///
    /// This is shorter than [`len`](Self::len) when the unread data wraps
    /// around the end of the storage.
    pub fn readable(&self) -> &[u8] {
        let end = if self.head >= self.tail {
            self.head
        } else {
            self.capacity()
        };
        &self.store.borrow()[self.tail..end]
    }

    /// Release `count` bytes at the tail
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the number of unread bytes.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "consumed more than available");
        self.tail = (self.tail + count) % self.capacity();
    }
}
