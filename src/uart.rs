//! DMA-driven UART engine
//!
//! Transmit data is queued in a [`RingBuffer`] and sent in DMA chunks. Receive
//! data lands in a circular DMA buffer. Software follows it with a read
//! position and reports overruns when the DMA laps that position.
//!
//! # Signals
//!
//! All modem signals are active low on the wire. The API speaks in terms of
//! *asserted* signals. RTS is derived from the receive fill level and driven by
//! [`Uart::poll`]. CTS is expected to be handled by the peripheral's hardware
//! flow control.
//!
//! # Memory
//!
//! Both buffers are `&'static mut` because the DMA engine addresses them
//! directly.

mod baud;
mod dma;

pub use baud::{divisor, Divisor, Oversampling};

use crate::line_coding::{InvalidCoding, LineCoding, Parity, StopBits};
use crate::ring::RingBuffer;
use dma::RxWindow;

/// Smallest transmit DMA chunk, in bytes
const TX_CHUNK_MIN: usize = 8;
/// Largest transmit DMA chunk, in bytes
const TX_CHUNK_MAX: usize = 256;
/// Activity LED hold time, in milliseconds
const LED_TIMEOUT: u32 = 100;

/// Frame format programmed into the peripheral
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Frame {
    /// Word length, including the parity bit
    pub word_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

/// Digital outputs driven by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Output {
    Rts,
    Dtr,
    RxLed,
    TxLed,
}

/// Digital inputs sampled by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Input {
    Dsr,
    Dcd,
}

/// UART, DMA and GPIO access for the engine
///
/// The implementation assumes that clocks, pins and DMA request routing have
/// already been set up.
pub trait UartPeripheral {
    /// Kernel clock of the baud rate generator, in Hz
    fn clock_hz(&self) -> u32;
    /// Program the baud rate and framing
    fn configure(&mut self, divisor: Divisor, frame: Frame);
    /// Start the receive DMA channel in circular mode
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for writes of `len` bytes for as long as the
    /// channel runs.
    unsafe fn start_rx_dma(&mut self, buffer: *mut u8, len: usize);
    /// Remaining count of the receive DMA channel
    fn rx_dma_remaining(&self) -> usize;
    /// Start a one-shot transmit DMA transfer
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads of `len` bytes until the transfer
    /// completes.
    unsafe fn start_tx_dma(&mut self, data: *const u8, len: usize);
    /// Returns and clears the transmit transfer-complete flag
    fn take_tx_complete(&mut self) -> bool;
    /// Drive an output pin high (`true`) or low
    fn set_output(&mut self, output: Output, high: bool);
    /// Sample an input pin; `true` when high
    fn input(&self, input: Input) -> bool;
}

pub struct Uart<P> {
    peripheral: P,
    coding: LineCoding,
    tx: RingBuffer<&'static mut [u8]>,
    /// Length of the chunk owned by the transmit DMA
    tx_in_flight: usize,
    rx: RxWindow,
    rx_high_water: usize,
    overrun: bool,
    enabled: bool,
    dtr: bool,
    rts: bool,
    now: u32,
    rx_led_until: Option<u32>,
    tx_led_until: Option<u32>,
}

// Safety: the raw receive buffer pointer is backed by a `&'static mut` slice
// that is exclusively owned by the engine.
unsafe impl<P: Send> Send for Uart<P> {}

impl<P: UartPeripheral> Uart<P> {
    /// Create an engine with the default 9600 8N1 coding
    ///
    /// The peripheral is not touched until [`configure`](Self::configure) or
    /// [`enable`](Self::enable).
    ///
    /// # Panics
    ///
    /// Panics if either buffer is smaller than two bytes.
    pub fn new(peripheral: P, tx_buffer: &'static mut [u8], rx_buffer: &'static mut [u8]) -> Self {
        let coding = LineCoding::default();
        let rx = RxWindow::new(rx_buffer);
        let rx_high_water = high_water(rx.capacity(), coding.baud_rate);
        Uart {
            peripheral,
            coding,
            tx: RingBuffer::new(tx_buffer),
            tx_in_flight: 0,
            rx,
            rx_high_water,
            overrun: false,
            enabled: false,
            dtr: false,
            rts: false,
            now: 0,
            rx_led_until: None,
            tx_led_until: None,
        }
    }

    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    pub fn peripheral_mut(&mut self) -> &mut P {
        &mut self.peripheral
    }

    pub fn line_coding(&self) -> LineCoding {
        self.coding
    }

    /// Receive fill level at which RTS is released
    pub fn rx_high_water(&self) -> usize {
        self.rx_high_water
    }

    /// Validate and apply a new line coding
    ///
    /// On error, the previous coding stays in effect and the peripheral is
    /// not touched.
    pub fn configure(&mut self, coding: LineCoding) -> Result<(), InvalidCoding> {
        coding.validate()?;
        let divisor = divisor(self.peripheral.clock_hz(), coding.baud_rate);
        self.peripheral.configure(
            divisor,
            Frame {
                word_bits: coding.word_bits(),
                parity: coding.parity,
                stop_bits: coding.stop_bits,
            },
        );
        self.coding = coding;
        self.rx_high_water = high_water(self.rx.capacity(), coding.baud_rate);
        debug!("UART {} BRR={}", coding.baud_rate, divisor.brr);
        Ok(())
    }

    /// Reset both directions and start receiving
    pub fn enable(&mut self) {
        self.tx.clear();
        self.tx_in_flight = 0;
        self.rx.reset();
        self.overrun = false;
        // Safety: the receive buffer is 'static and owned by this engine.
        unsafe {
            self.peripheral
                .start_rx_dma(self.rx.as_mut_ptr(), self.rx.capacity())
        };
        self.enabled = true;
        self.dtr = false;
        self.rts = false;
        self.peripheral.set_output(Output::Dtr, true);
        self.peripheral.set_output(Output::Rts, true);
    }

    /// Queue data for transmission, returning the number of bytes accepted
    ///
    /// Data that does not fit is dropped.
    pub fn transmit(&mut self, data: &[u8]) -> usize {
        let accepted = self.tx.enqueue_masked(data, self.data_mask());
        if accepted < data.len() {
            warn!("UART TX dropped {} bytes", data.len() - accepted);
        }
        self.start_transmit();
        accepted
    }

    /// Free space in the transmit ring
    pub fn tx_data_avail(&self) -> usize {
        self.tx.available_space()
    }

    /// Transmit DMA completion
    ///
    /// Releases the chunk that was just sent and starts the next one.
    pub fn on_tx_complete(&mut self) {
        if self.tx_in_flight == 0 {
            return;
        }
        self.tx.consume(self.tx_in_flight);
        self.tx_in_flight = 0;
        self.start_transmit();
    }

    fn start_transmit(&mut self) {
        if !self.enabled || self.tx_in_flight != 0 {
            return;
        }
        let chunk = self.tx.readable();
        if chunk.is_empty() {
            return;
        }
        let len = chunk.len().min(self.tx_chunk_limit());
        self.tx_in_flight = len;
        // Safety: the chunk stays in the ring until `on_tx_complete` consumes it.
        unsafe { self.peripheral.start_tx_dma(chunk.as_ptr(), len) };
        self.tx_led_until = Some(self.now.wrapping_add(LED_TIMEOUT));
        self.peripheral.set_output(Output::TxLed, true);
        trace!("UART TX chunk {}", len);
    }

    /// Longest DMA chunk, about 5 ms of line time
    fn tx_chunk_limit(&self) -> usize {
        (self.coding.baud_rate / 2000).clamp(TX_CHUNK_MIN as u32, TX_CHUNK_MAX as u32) as usize
    }

    fn data_mask(&self) -> u8 {
        if self.coding.is_seven_bit() {
            0x7F
        } else {
            0xFF
        }
    }

    /// Number of received bytes waiting to be copied
    pub fn rx_data_len(&self) -> usize {
        self.rx.unread(self.peripheral.rx_dma_remaining())
    }

    /// Copy received data into `buf`, returning the number of bytes copied
    pub fn copy_rx_data(&mut self, buf: &mut [u8]) -> usize {
        let remaining = self.peripheral.rx_dma_remaining();
        self.check_overrun(remaining);
        let mask = self.data_mask();
        let copied = self.rx.drain(remaining, buf, mask);
        if copied > 0 {
            self.rx_led_until = Some(self.now.wrapping_add(LED_TIMEOUT));
            self.peripheral.set_output(Output::RxLed, true);
        }
        copied
    }

    fn check_overrun(&mut self, remaining: usize) {
        if self.rx.check_overrun(remaining) {
            warn!("UART RX overrun");
            self.overrun = true;
        }
    }

    /// Returns `true` once per overrun
    pub fn has_overrun_occurred(&mut self) -> bool {
        core::mem::replace(&mut self.overrun, false)
    }

    /// Transmit DMA interrupt
    pub fn on_dma_interrupt(&mut self) {
        if self.peripheral.take_tx_complete() {
            self.on_tx_complete();
        }
    }

    /// Housekeeping, called at a high rate
    ///
    /// `now` is a millisecond timestamp.
    pub fn poll(&mut self, now: u32) {
        self.now = now;
        self.on_dma_interrupt();
        if !self.enabled {
            return;
        }

        let remaining = self.peripheral.rx_dma_remaining();
        self.check_overrun(remaining);
        self.update_rts(self.rx.unread(remaining));

        if expired(&mut self.rx_led_until, now) {
            self.peripheral.set_output(Output::RxLed, false);
        }
        if expired(&mut self.tx_led_until, now) {
            self.peripheral.set_output(Output::TxLed, false);
        }
    }

    fn update_rts(&mut self, rx_len: usize) {
        let asserted = rx_len < self.rx_high_water;
        if asserted != self.rts {
            self.rts = asserted;
            self.peripheral.set_output(Output::Rts, !asserted);
        }
    }

    pub fn rts(&self) -> bool {
        self.rts
    }

    /// Assert (`true`) or release DTR
    pub fn set_dtr(&mut self, asserted: bool) {
        self.dtr = asserted;
        self.peripheral.set_output(Output::Dtr, !asserted);
    }

    pub fn dtr(&self) -> bool {
        self.dtr
    }

    /// Data set ready, as seen from the line
    pub fn dsr(&self) -> bool {
        !self.peripheral.input(Input::Dsr)
    }

    /// Data carrier detect, as seen from the line
    pub fn dcd(&self) -> bool {
        !self.peripheral.input(Input::Dcd)
    }
}

/// Leave about 5 ms worth of characters free above the mark
fn high_water(capacity: usize, baud_rate: u32) -> usize {
    capacity.saturating_sub((baud_rate / 2000) as usize)
}

/// Clears `deadline` and returns `true` once it has passed
fn expired(deadline: &mut Option<u32>, now: u32) -> bool {
    match *deadline {
        Some(at) if (at.wrapping_sub(now) as i32) <= 0 => {
            *deadline = None;
            true
        }
        _ => false,
    }
}
