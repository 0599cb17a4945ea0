//! Receive window over a circular DMA buffer
//!
//! The DMA engine owns the write position. It is sampled from the channel's
//! remaining-count register, and never stored here. Software only owns the
//! read position.

use core::ptr::NonNull;

pub struct RxWindow {
    ptr: NonNull<u8>,
    len: usize,
    tail: usize,
    /// Unread length at the previous sample
    last_len: usize,
}

impl RxWindow {
    pub fn new(buffer: &'static mut [u8]) -> Self {
        assert!(buffer.len() >= 2, "receive buffer too small");
        let len = buffer.len();
        // Safety: a slice pointer is never null
        let ptr = unsafe { NonNull::new_unchecked(buffer.as_mut_ptr()) };
        RxWindow {
            ptr,
            len,
            tail: 0,
            last_len: 0,
        }
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    /// DMA write position, given the channel's remaining count
    fn head(&self, remaining: usize) -> usize {
        (self.len - remaining.min(self.len)) % self.len
    }

    /// Unread bytes, given the channel's remaining count
    pub fn unread(&self, remaining: usize) -> usize {
        (self.head(remaining) + self.len - self.tail) % self.len
    }

    pub fn reset(&mut self) {
        self.tail = 0;
        self.last_len = 0;
    }

    /// Compare against the previous sample
    ///
    /// Returns `true` if the unread length shrank without a drain, meaning the
    /// DMA lapped the read position. In that case the read position jumps to
    /// the DMA position, discarding everything in between.
    pub fn check_overrun(&mut self, remaining: usize) -> bool {
        let unread = self.unread(remaining);
        if unread < self.last_len {
            self.tail = self.head(remaining);
            self.last_len = 0;
            true
        } else {
            self.last_len = unread;
            false
        }
    }

    /// Copy up to `out.len()` unread bytes, masking each with `mask`
    pub fn drain(&mut self, remaining: usize, out: &mut [u8], mask: u8) -> usize {
        let head = self.head(remaining);
        let mut copied = 0;
        while copied < out.len() && self.tail != head {
            let end = if head > self.tail { head } else { self.len };
            let n = (end - self.tail).min(out.len() - copied);
            for (offset, dst) in out[copied..copied + n].iter_mut().enumerate() {
                // Safety: tail + offset < len, and the DMA never writes the
                // unread span between tail and head.
                let byte = unsafe { self.ptr.as_ptr().add(self.tail + offset).read_volatile() };
                *dst = byte & mask;
            }
            copied += n;
            self.tail = (self.tail + n) % self.len;
        }
        self.last_len = self.unread(remaining);
        copied
    }
}
