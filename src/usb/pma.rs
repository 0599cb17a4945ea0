//! Packet memory allocation
//!
//! Packet memory is a dedicated RAM shared with the USB peripheral and
//! addressed by 16-bit offsets. The buffer descriptor table sits at the bottom.
//! Endpoint buffers are carved downward from the top.

/// Packet memory buffer allocator
pub struct Allocator {
    start: u16,
    end: u16,
    ptr: u16,
    mark: u16,
}

impl Allocator {
    /// Manage the packet memory between `start` and `end`
    pub const fn new(start: u16, end: u16) -> Self {
        Allocator {
            start,
            end,
            ptr: end,
            mark: end,
        }
    }

    /// Allocates a buffer of `size` bytes, returning its packet memory offset
    ///
    /// Sizes are rounded up to whole half-words.
    pub fn allocate(&mut self, size: u16) -> Option<u16> {
        let size = size.checked_add(size & 1)?;
        let new_ptr = self.ptr.checked_sub(size)?;
        if new_ptr < self.start {
            None
        } else {
            self.ptr = new_ptr;
            Some(new_ptr)
        }
    }

    /// Remember the current position for [`rewind`](Self::rewind)
    pub fn mark(&mut self) {
        self.mark = self.ptr;
    }

    /// Release everything allocated after the last [`mark`](Self::mark)
    pub fn rewind(&mut self) {
        self.ptr = self.mark;
    }

    /// Release everything
    pub fn reset(&mut self) {
        self.ptr = self.end;
        self.mark = self.end;
    }

    /// Bytes still available
    pub fn free(&self) -> u16 {
        self.ptr - self.start
    }
}

/// Receive buffer size, as encoded in a COUNT_RX field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxSize {
    /// BL_SIZE and NUM_BLOCK, already shifted into place
    pub count_bits: u16,
    /// Packet memory actually reserved
    pub effective: u16,
}

/// Encode a receive buffer size
///
/// Up to 62 bytes are counted in 2-byte blocks, and larger buffers in
/// 32-byte blocks.
pub fn rx_size(size: u16) -> RxSize {
    if size > 62 {
        let blocks = ((size - 1) >> 5) & 0x1F;
        RxSize {
            count_bits: (1 << 15) | (blocks << 10),
            effective: (blocks + 1) << 5,
        }
    } else {
        let blocks = (size + 1) >> 1;
        RxSize {
            count_bits: blocks << 10,
            effective: blocks << 1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{rx_size, Allocator, RxSize};

    #[test]
    fn allocate_entire_memory() {
        let mut alloc = Allocator::new(64, 96);
        assert_eq!(alloc.allocate(32), Some(64));
        assert_eq!(alloc.allocate(2), None);
        assert_eq!(alloc.free(), 0);
    }

    #[test]
    fn allocate_partial_buffers() {
        let mut alloc = Allocator::new(64, 512);
        assert_eq!(alloc.allocate(64), Some(448));
        assert_eq!(alloc.allocate(7), Some(440));
        assert_eq!(alloc.allocate(500), None);
        assert_eq!(alloc.free(), 440 - 64);
    }

    #[test]
    fn rewind_to_mark() {
        let mut alloc = Allocator::new(64, 512);
        alloc.allocate(64);
        alloc.allocate(64);
        alloc.mark();
        assert_eq!(alloc.allocate(16), Some(368));
        alloc.rewind();
        assert_eq!(alloc.allocate(16), Some(368));
        alloc.reset();
        assert_eq!(alloc.allocate(16), Some(496));
    }

    #[test]
    fn rx_sizes() {
        assert_eq!(
            rx_size(64),
            RxSize {
                count_bits: 0x8400,
                effective: 64
            }
        );
        assert_eq!(
            rx_size(16),
            RxSize {
                count_bits: 8 << 10,
                effective: 16
            }
        );
        assert_eq!(
            rx_size(9),
            RxSize {
                count_bits: 5 << 10,
                effective: 10
            }
        );
        assert_eq!(rx_size(100).effective, 128);
    }
}
