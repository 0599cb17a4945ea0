//! A USB CDC-ACM to UART bridge for STM32 full-speed USB devices
//!
//! `usb-serial-bridge` presents a UART to a USB host as a virtual COM port.
//! Data moves in both directions with hardware flow control, the host's line
//! coding programs the UART, and modem signal changes reach the host as
//! serial state notifications.
//!
//! The crate has three layers:
//!
//! - [`usb`] is a small USB device stack. It runs control transfers on
//!   endpoint 0, and packet transfers on the other endpoints, on top of any
//!   [`EndpointHardware`](usb::EndpointHardware).
//! - [`uart`] is a DMA-driven UART engine on top of any
//!   [`UartPeripheral`](uart::UartPeripheral).
//! - [`serial`] couples the two as a CDC-ACM function.
//!
//! [`Fsdev`] implements the endpoint hardware for the STM32 USB device
//! peripheral, and [`SerialBridge`] owns everything for use from interrupt
//! handlers. To interface the library, you must define a safe implementation
//! of [`Peripherals`], and of [`UartPeripheral`](uart::UartPeripheral).

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;
#[macro_use]
mod ral;

mod bus;
pub mod cdc;
mod fsdev;
pub mod line_coding;
pub mod ring;
pub mod serial;
pub mod uart;
pub mod usb;
mod vcell;

#[cfg(test)]
mod sim;

pub use bus::SerialBridge;
pub use fsdev::Fsdev;
pub use line_coding::{InvalidCoding, LineCoding, Parity, StopBits};
pub use serial::UsbSerial;

/// A type that owns the USB device peripheral
///
/// An implementation of `Peripherals` is expected to own
///
/// - the USB device registers
/// - the USB packet memory
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns both
/// regions. The pointers returned by the methods are assumed to be valid, and
/// will be cast to a register block and to packet memory. Packet memory must
/// be accessible as 16-bit words.
///
/// # Example
///
/// A safe implementation of `Peripherals` for an STM32G4, using the
/// peripheral's reset-value addresses.
///
/// ```
/// use usb_serial_bridge::Peripherals;
///
/// /// Taken once, at startup
/// struct Usb(());
///
/// unsafe impl Peripherals for Usb {
///     fn usb(&self) -> *const () {
///         0x4000_5C00 as *const ()
///     }
///     fn packet_memory(&self) -> *const () {
///         0x4000_6000 as *const ()
///     }
/// }
///
/// let usb = Usb(());
/// assert_eq!(usb.usb(), 0x4000_5C00 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB device registers
    fn usb(&self) -> *const ();
    /// Returns the address of the USB packet memory
    fn packet_memory(&self) -> *const ();
}
