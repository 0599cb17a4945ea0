//! Volatile cell for packet memory
//!
//! Buffer descriptors live in packet memory, which the USB peripheral reads
//! and writes behind the compiler's back. `VCell` gives them the same
//! `read` / `write` surface as a register, so the register macros work on
//! them.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        // Safety: the cell is only ever accessed with volatile operations
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        // Safety: as above
        unsafe { self.0.get().write_volatile(val) }
    }
}
