//! Interrupt-safe bridge owner
//!
//! The USB interrupt, the UART DMA interrupt and the periodic poll all touch
//! the same device and bridge state. [`SerialBridge`] owns that state, and
//! runs every entry point inside a critical section. Share it through a
//! `static`, and call one entry point from each context.

use crate::serial::UsbSerial;
use crate::uart::UartPeripheral;
use crate::usb::{Descriptors, Device, EndpointHardware, TableFull};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};

struct Inner<H, P, D> {
    device: Device<H, UsbSerial<P>, D>,
    serial: UsbSerial<P>,
}

pub struct SerialBridge<H, P, D> {
    inner: Mutex<RefCell<Inner<H, P, D>>>,
}

impl<H, P, D> SerialBridge<H, P, D>
where
    H: EndpointHardware,
    P: UartPeripheral,
    D: Descriptors,
{
    /// Create a bridge from a device and the serial function it serves
    ///
    /// Registers the serial function's handlers with the device. Fails if
    /// the device's handler tables are already full.
    pub fn new(mut device: Device<H, UsbSerial<P>, D>, serial: UsbSerial<P>) -> Result<Self, TableFull> {
        UsbSerial::register(&mut device)?;
        Ok(SerialBridge {
            inner: Mutex::new(RefCell::new(Inner { device, serial })),
        })
    }

    /// Interrupt-safe, immutable access to the bridge
    fn with_inner<R>(&self, func: impl FnOnce(&Inner<H, P, D>) -> R) -> R {
        interrupt::free(|cs| {
            let inner = self.inner.borrow(cs);
            let inner = inner.borrow();
            func(&*inner)
        })
    }

    /// Interrupt-safe, mutable access to the bridge
    fn with_inner_mut<R>(&self, func: impl FnOnce(&mut Inner<H, P, D>) -> R) -> R {
        interrupt::free(|cs| {
            let inner = self.inner.borrow(cs);
            let mut inner = inner.borrow_mut();
            func(&mut *inner)
        })
    }

    /// Handle every pending USB event
    ///
    /// Call this from the USB interrupt handler.
    pub fn on_usb_interrupt(&self) {
        self.with_inner_mut(|inner| inner.device.poll(&mut inner.serial));
    }

    /// Call this from the UART transmit DMA interrupt handler
    pub fn on_uart_dma_interrupt(&self) {
        self.with_inner_mut(|inner| inner.serial.uart_mut().on_dma_interrupt());
    }

    /// Move data and state between the UART and the host
    ///
    /// Call this at least once a millisecond. `now` is a millisecond
    /// timestamp that may wrap.
    pub fn poll(&self, now: u32) {
        self.with_inner_mut(|inner| {
            let Inner { device, serial } = inner;
            serial.poll(device.engine_mut(), now);
        });
    }

    /// The host has configured the device and the serial port
    pub fn is_connected(&self) -> bool {
        self.with_inner(|inner| inner.serial.is_connected())
    }

    pub fn is_suspended(&self) -> bool {
        self.with_inner(|inner| inner.device.is_suspended())
    }

    /// Run `func` with mutable access to the device and the bridge
    pub fn with<R>(&self, func: impl FnOnce(&mut Device<H, UsbSerial<P>, D>, &mut UsbSerial<P>) -> R) -> R {
        self.with_inner_mut(|inner| func(&mut inner.device, &mut inner.serial))
    }
}
