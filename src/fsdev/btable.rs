//! Buffer descriptor table and packet memory
//!
//! The buffer descriptor table (BTABLE) sits at the start of packet memory,
//! with one 8-byte [`BufferDescriptor`] per endpoint. Each descriptor has two
//! halves. A single-buffered endpoint uses the first half for IN, and the
//! second for OUT. A double-buffered direction uses both.
//!
//! Packet memory is accessed as 16-bit words, one word per two bytes of
//! offset.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::usb::Slot;
use crate::vcell::VCell;

#[repr(C)]
pub struct BufferDescriptor {
    pub ADDR_0: VCell<u16>,
    pub COUNT_0: VCell<u16>,
    pub ADDR_1: VCell<u16>,
    pub COUNT_1: VCell<u16>,
}

impl BufferDescriptor {
    /// The half of the descriptor that describes `slot`
    pub fn buffer(&self, slot: Slot) -> Buffer<'_> {
        match slot {
            Slot::Zero => Buffer {
                ADDR: &self.ADDR_0,
                COUNT: &self.COUNT_0,
            },
            Slot::One => Buffer {
                ADDR: &self.ADDR_1,
                COUNT: &self.COUNT_1,
            },
        }
    }
}

/// One half of a buffer descriptor
pub struct Buffer<'a> {
    pub ADDR: &'a VCell<u16>,
    pub COUNT: &'a VCell<u16>,
}

/// Byte count, and the receive buffer size for OUT buffers
pub mod COUNT {
    fields!(u16;
        BYTES: 0, 10;
        NUM_BLOCK: 10, 5;
        BL_SIZE: 15, 1;
    );
}

/// Packet memory, starting with the buffer descriptor table
pub struct PacketMemory {
    words: *mut u16,
}

impl PacketMemory {
    /// # Safety
    ///
    /// `words` must point to packet memory that is large enough for every
    /// offset the caller hands out, and that nothing else accesses.
    pub const unsafe fn new(words: *mut u16) -> Self {
        PacketMemory { words }
    }

    pub fn descriptor(&self, number: u8) -> &BufferDescriptor {
        // Safety: the table holds eight descriptors at offset 0.
        unsafe { &*self.words.cast::<BufferDescriptor>().add(number as usize) }
    }

    /// Copy `data` to byte offset `offset`
    pub fn write(&mut self, offset: u16, data: &[u8]) {
        let base = offset as usize / 2;
        for (index, pair) in data.chunks(2).enumerate() {
            let word = u16::from(pair[0]) | u16::from(pair.get(1).copied().unwrap_or(0)) << 8;
            // Safety: in bounds per the allocation that produced `offset`.
            unsafe { self.words.add(base + index).write_volatile(word) };
        }
    }

    /// Fill `buffer` from byte offset `offset`
    pub fn read(&self, offset: u16, buffer: &mut [u8]) {
        let base = offset as usize / 2;
        for (index, pair) in buffer.chunks_mut(2).enumerate() {
            // Safety: in bounds per the allocation that produced `offset`.
            let word = unsafe { self.words.add(base + index).read_volatile() };
            let bytes = word.to_le_bytes();
            pair.copy_from_slice(&bytes[..pair.len()]);
        }
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<BufferDescriptor>() == 8) as usize];
