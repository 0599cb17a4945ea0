//! STM32 full-speed USB device peripheral
//!
//! [`Fsdev`] implements [`EndpointHardware`] for the USB device peripheral
//! found on STM32 F0, L0, L4, G4 and similar parts. Packet memory must use
//! the 16-bit access scheme, with the buffer descriptor table at offset 0.
//!
//! # Endpoint registers
//!
//! Most EPnR bits can't be written directly. The `STAT_*` and `DTOG_*` bits
//! toggle when written with 1, and the `CTR_*` flags clear when written with
//! 0. Every write goes through the `epr_*` functions below, which compute the
//! value that changes only the intended bits.
//!
//! # Double buffering
//!
//! With `EP_KIND` set on a bulk endpoint, the data toggle of the unused
//! direction becomes the software buffer bit (`SW_BUF`). `DTOG_RX` is
//! `SW_BUF` for IN, and `DTOG_TX` is `SW_BUF` for OUT.

mod btable;
mod registers;

use crate::{
    ral,
    usb::{pma, EndpointHardware, Event, Slot, Stat},
};
use btable::PacketMemory;
use registers::{RegisterBlock, EPR, ISTR};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// Busy-wait after leaving power down, covering the transceiver startup time
const STARTUP_CYCLES: u32 = 1_000;

/// Bits that keep their value when written back
const EPR_KEEP: u32 = EPR::EA::mask | EPR::EP_TYPE::mask | EPR::EP_KIND::mask;
/// Bits that clear when written with 0
const EPR_CTR: u32 = EPR::CTR_RX::mask | EPR::CTR_TX::mask;

/// Write value that sets the toggle bits under `mask` to `desired`
///
/// All other toggle bits are written 0, and both CTR flags 1, so neither
/// change.
fn epr_toggle(epr: u32, mask: u32, desired: u32) -> u32 {
    (epr & EPR_KEEP) | EPR_CTR | ((epr ^ desired) & mask)
}

/// Write value that clears the CTR flags in `clear`
fn epr_clear_ctr(epr: u32, clear: u32) -> u32 {
    (epr & EPR_KEEP) | (EPR_CTR & !clear)
}

/// Write value for the endpoint number, type and kind
fn epr_configure(number: u8, kind: EndpointType, double_buffered: bool) -> u32 {
    use EPR::EP_TYPE::RW::*;
    let ep_type = match kind {
        EndpointType::Bulk => BULK,
        EndpointType::Control => CONTROL,
        EndpointType::Isochronous { .. } => ISO,
        EndpointType::Interrupt => INTERRUPT,
    };
    ((u32::from(number) << EPR::EA::offset) & EPR::EA::mask)
        | (ep_type << EPR::EP_TYPE::offset)
        | (u32::from(double_buffered) << EPR::EP_KIND::offset)
        | EPR_CTR
}

fn stat_bits(stat: Stat) -> u32 {
    use EPR::STAT_TX::RW::*;
    match stat {
        Stat::Disabled => DISABLED,
        Stat::Stall => STALL,
        Stat::Nak => NAK,
        Stat::Valid => VALID,
    }
}

fn stat_from_bits(bits: u32) -> Stat {
    use EPR::STAT_TX::RW::*;
    match bits & 0b11 {
        DISABLED => Stat::Disabled,
        STALL => Stat::Stall,
        NAK => Stat::Nak,
        _ => Stat::Valid,
    }
}

/// `(mask, offset)` of the STAT field of a direction
fn stat_field(direction: UsbDirection) -> (u32, u32) {
    match direction {
        UsbDirection::In => (EPR::STAT_TX::mask, EPR::STAT_TX::offset),
        UsbDirection::Out => (EPR::STAT_RX::mask, EPR::STAT_RX::offset),
    }
}

fn data_toggle(direction: UsbDirection) -> u32 {
    match direction {
        UsbDirection::In => EPR::DTOG_TX::mask,
        UsbDirection::Out => EPR::DTOG_RX::mask,
    }
}

fn software_buffer_bit(direction: UsbDirection) -> u32 {
    match direction {
        UsbDirection::In => EPR::DTOG_RX::mask,
        UsbDirection::Out => EPR::DTOG_TX::mask,
    }
}

/// The USB device peripheral
///
/// After you create an `Fsdev` with [`new()`](Fsdev::new), call
/// [`initialize()`](Fsdev::initialize) once, then [`attach()`](Fsdev::attach)
/// when the device is ready to enumerate.
pub struct Fsdev {
    usb: &'static RegisterBlock,
    pma: PacketMemory,
}

// Safety: `Fsdev` is created from a `Peripherals` implementation, which owns
// both memory regions.
unsafe impl Send for Fsdev {}

impl Fsdev {
    pub fn new<P: crate::Peripherals>(peripherals: P) -> Self {
        // Safety: the addresses are valid and exclusively ours, per the
        // `Peripherals` contract.
        unsafe {
            Fsdev {
                usb: &*(peripherals.usb() as *const RegisterBlock),
                pma: PacketMemory::new(peripherals.packet_memory() as *mut u16),
            }
        }
    }

    /// Power up and reset the peripheral, and enable its interrupts
    ///
    /// Assumes that the USB clock is running.
    pub fn initialize(&mut self) {
        ral::modify_reg!(registers, self.usb, CNTR, PDWN: 0);
        cortex_m::asm::delay(STARTUP_CYCLES);
        ral::write_reg!(registers, self.usb, CNTR, FRES: 1);
        ral::write_reg!(registers, self.usb, CNTR, 0);
        ral::write_reg!(registers, self.usb, ISTR, 0);
        ral::write_reg!(registers, self.usb, BTABLE, 0);
        ral::write_reg!(
            registers,
            self.usb,
            CNTR,
            CTRM: 1,
            RESETM: 1,
            SUSPM: 1,
            WKUPM: 1,
            ERRM: 1,
            PMAOVRM: 1
        );
        debug!("FSDEV initialized");
    }

    /// Connect the D+ pull-up, so the host sees the device
    pub fn attach(&mut self) {
        ral::modify_reg!(registers, self.usb, BCDR, DPPU: 1);
    }

    pub fn detach(&mut self) {
        ral::modify_reg!(registers, self.usb, BCDR, DPPU: 0);
    }

    /// Current frame number
    pub fn frame_number(&self) -> u16 {
        ral::read_reg!(registers, self.usb, FNR, FN) as u16
    }

    fn read_epr(&self, number: u8) -> u32 {
        let epr = self.usb.endpoint(number);
        ral::read_reg!(registers, &epr, EPR)
    }

    fn write_epr(&self, number: u8, value: u32) {
        let epr = self.usb.endpoint(number);
        ral::write_reg!(registers, &epr, EPR, value);
    }

    /// Clear interrupt flags; all others are written 1 and stay
    fn clear_istr(&self, flags: u32) {
        let value = !flags & 0xFFFF;
        ral::write_reg!(registers, self.usb, ISTR, value);
    }
}

impl EndpointHardware for Fsdev {
    fn poll(&mut self) -> Option<Event> {
        let istr = ral::read_reg!(registers, self.usb, ISTR);

        if istr & ISTR::RESET::mask != 0 {
            self.clear_istr(ISTR::RESET::mask);
            return Some(Event::Reset);
        }

        if istr & ISTR::CTR::mask != 0 {
            let number = ((istr & ISTR::EP_ID::mask) >> ISTR::EP_ID::offset) as u8;
            let epr = self.read_epr(number);
            if epr & EPR::CTR_RX::mask != 0 {
                self.write_epr(number, epr_clear_ctr(epr, EPR::CTR_RX::mask));
                if number == 0 && epr & EPR::SETUP::mask != 0 {
                    return Some(Event::Setup);
                }
                let address = EndpointAddress::from_parts(number as usize, UsbDirection::Out);
                return Some(Event::Out(address));
            }
            if epr & EPR::CTR_TX::mask != 0 {
                self.write_epr(number, epr_clear_ctr(epr, EPR::CTR_TX::mask));
                let address = EndpointAddress::from_parts(number as usize, UsbDirection::In);
                return Some(Event::In(address));
            }
        }

        if istr & ISTR::SUSP::mask != 0 {
            self.clear_istr(ISTR::SUSP::mask);
            ral::modify_reg!(registers, self.usb, CNTR, FSUSP: 1, LP_MODE: 1);
            return Some(Event::Suspend);
        }

        if istr & ISTR::WKUP::mask != 0 {
            self.clear_istr(ISTR::WKUP::mask);
            ral::modify_reg!(registers, self.usb, CNTR, FSUSP: 0, LP_MODE: 0);
            return Some(Event::Resume);
        }

        if istr & ISTR::SOF::mask != 0 {
            self.clear_istr(ISTR::SOF::mask);
            return Some(Event::Sof);
        }

        let errors = istr & (ISTR::ERR::mask | ISTR::PMAOVR::mask | ISTR::ESOF::mask);
        if errors != 0 {
            trace!("ISTR {=u32:x}", errors);
            self.clear_istr(errors);
        }
        None
    }

    fn set_address(&mut self, address: u8) {
        let address = u32::from(address);
        ral::write_reg!(registers, self.usb, DADDR, EF: 1, ADD: address);
    }

    fn configure(&mut self, number: u8, kind: EndpointType, double_buffered: bool) {
        self.write_epr(number, epr_configure(number, kind, double_buffered));
    }

    fn setup_buffer(&mut self, number: u8, slot: Slot, direction: UsbDirection, offset: u16, size: u16) {
        let buffer = self.pma.descriptor(number).buffer(slot);
        buffer.ADDR.write(offset);
        let count = match direction {
            UsbDirection::In => 0,
            UsbDirection::Out => pma::rx_size(size).count_bits,
        };
        ral::write_reg!(btable, &buffer, COUNT, count);
    }

    fn set_stat(&mut self, number: u8, direction: UsbDirection, stat: Stat) {
        let (mask, offset) = stat_field(direction);
        let epr = self.read_epr(number);
        self.write_epr(number, epr_toggle(epr, mask, stat_bits(stat) << offset));
    }

    fn stat(&self, number: u8, direction: UsbDirection) -> Stat {
        let (mask, offset) = stat_field(direction);
        stat_from_bits((self.read_epr(number) & mask) >> offset)
    }

    fn clear_data_toggle(&mut self, number: u8, direction: UsbDirection) {
        let epr = self.read_epr(number);
        self.write_epr(number, epr_toggle(epr, data_toggle(direction), 0));
    }

    fn set_software_buffer(&mut self, number: u8, direction: UsbDirection, set: bool) {
        let bit = software_buffer_bit(direction);
        let epr = self.read_epr(number);
        let desired = if set { bit } else { 0 };
        self.write_epr(number, epr_toggle(epr, bit, desired));
    }

    fn toggle_software_buffer(&mut self, number: u8, direction: UsbDirection) {
        let bit = software_buffer_bit(direction);
        let epr = self.read_epr(number);
        self.write_epr(number, epr_toggle(epr, bit, epr ^ bit));
    }

    fn software_buffer(&self, number: u8, direction: UsbDirection) -> Slot {
        if self.read_epr(number) & software_buffer_bit(direction) != 0 {
            Slot::One
        } else {
            Slot::Zero
        }
    }

    fn write_packet(&mut self, number: u8, slot: Slot, data: &[u8]) {
        let offset = self.pma.descriptor(number).buffer(slot).ADDR.read();
        self.pma.write(offset, data);
        let buffer = self.pma.descriptor(number).buffer(slot);
        let len = data.len() as u16;
        ral::write_reg!(btable, &buffer, COUNT, BYTES: len);
    }

    fn read_packet(&self, number: u8, slot: Slot, buffer: &mut [u8]) -> usize {
        let len = self.received_len(number, slot).min(buffer.len());
        let offset = self.pma.descriptor(number).buffer(slot).ADDR.read();
        self.pma.read(offset, &mut buffer[..len]);
        len
    }

    fn received_len(&self, number: u8, slot: Slot) -> usize {
        let buffer = self.pma.descriptor(number).buffer(slot);
        ral::read_reg!(btable, &buffer, COUNT, BYTES) as usize
    }
}

#[cfg(test)]
mod test {
    use super::{
        epr_clear_ctr, epr_configure, epr_toggle, software_buffer_bit, stat_bits,
        stat_from_bits, EPR,
    };
    use crate::usb::Stat;
    use usb_device::{endpoint::EndpointType, UsbDirection};

    const STAT_TX: u32 = EPR::STAT_TX::mask;
    const STAT_RX: u32 = EPR::STAT_RX::mask;

    /// What the peripheral does with a write
    fn apply(epr: u32, write: u32) -> u32 {
        let toggles = STAT_TX | STAT_RX | EPR::DTOG_RX::mask | EPR::DTOG_TX::mask;
        let ctr = EPR::CTR_RX::mask | EPR::CTR_TX::mask;
        let keep = EPR::EA::mask | EPR::EP_TYPE::mask | EPR::EP_KIND::mask;
        (write & keep) | ((epr ^ write) & toggles) | (epr & write & ctr) | (epr & EPR::SETUP::mask)
    }

    #[test]
    fn stat_write_touches_only_its_field() {
        // EP1 bulk, TX NAK, RX VALID, both CTR flags pending
        let epr = 0x1 | (2 << 4) | (3 << 12) | 0x8080;
        let write = epr_toggle(epr, STAT_TX, stat_bits(Stat::Valid) << 4);
        let after = apply(epr, write);
        assert_eq!(stat_from_bits(after >> 4), Stat::Valid);
        assert_eq!(stat_from_bits(after >> 12), Stat::Valid);
        assert_eq!(after & 0x8080, 0x8080);
        assert_eq!(after & 0xF, 1);
    }

    #[test]
    fn stat_write_from_any_state() {
        for from in [Stat::Disabled, Stat::Stall, Stat::Nak, Stat::Valid] {
            for to in [Stat::Disabled, Stat::Stall, Stat::Nak, Stat::Valid] {
                let epr = stat_bits(from) << 12;
                let after = apply(epr, epr_toggle(epr, STAT_RX, stat_bits(to) << 12));
                assert_eq!(stat_from_bits(after >> 12), to);
            }
        }
    }

    #[test]
    fn clear_one_ctr_flag() {
        let epr = 0x8080 | 0x0200 | 0x3;
        let after = apply(epr, epr_clear_ctr(epr, EPR::CTR_RX::mask));
        assert_eq!(after & 0x8080, 0x0080);
        assert_eq!(after & 0x0203, 0x0203);
    }

    #[test]
    fn setup_flag_survives_ctr_clear() {
        let epr = 0x8000 | 0x0800 | 0x0200;
        let after = apply(epr, epr_clear_ctr(epr, EPR::CTR_RX::mask));
        assert_eq!(after & 0x8800, 0x0800);
    }

    #[test]
    fn configure_leaves_toggles() {
        let epr = (3 << 12) | EPR::DTOG_RX::mask;
        let kind = EndpointType::Interrupt;
        let after = apply(epr, epr_configure(3, kind, false));
        assert_eq!(after & 0xF, 3);
        assert_eq!((after & EPR::EP_TYPE::mask) >> 9, 3);
        assert_eq!(after & (STAT_RX | EPR::DTOG_RX::mask), epr);

        let after = apply(0, epr_configure(2, EndpointType::Bulk, true));
        assert_eq!(after, 0x0102);
    }

    #[test]
    fn software_buffer_is_the_other_toggle() {
        let bit = software_buffer_bit(UsbDirection::In);
        assert_eq!(bit, EPR::DTOG_RX::mask);
        let epr = 0;
        let after = apply(epr, epr_toggle(epr, bit, epr ^ bit));
        assert_eq!(after, bit);
        let after = apply(after, epr_toggle(after, bit, after ^ bit));
        assert_eq!(after, 0);
    }
}
