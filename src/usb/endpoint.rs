//! Endpoint transfer engine
//!
//! The engine owns the per-endpoint transfer state and drives the peripheral
//! through [`EndpointHardware`]. Each endpoint direction is single- or
//! double-buffered.
//!
//! # Single buffering
//!
//! One packet memory slot per direction. An IN endpoint accepts one packet,
//! and then reports zero availability until the host collects it. An OUT
//! endpoint is re-armed with VALID after its completion handler returns,
//! unless it was paused.
//!
//! # Double buffering
//!
//! Bulk endpoints with a buffer larger than one packet get two slots.
//!
//! - IN: up to two packets may be outstanding. Software fills the slot it
//!   owns, then toggles ownership.
//! - OUT: the engine reads the slots alternately, and releases each slot back
//!   to the peripheral after the completion handler returns. While paused, the
//!   releases are counted instead of performed, and the peripheral NAKs once
//!   it runs out of slots. Unpausing replays the counted releases.
//!
//! # Deferred pause
//!
//! `pause` and `unpause` change the logical state immediately. The matching
//! register update happens immediately too, except when called from the
//! endpoint's own completion handler. There it is flagged, and flushed after
//! the handler returns.

use super::pma::{self, Allocator};
use super::Event;
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// Endpoint numbers supported by the peripheral
pub const MAX_ENDPOINTS: usize = 8;
/// Largest packet on a full-speed bulk endpoint
pub const MAX_PACKET_SIZE: u16 = 64;
/// Start of the allocatable packet memory, above the descriptor table
pub const PMA_START: u16 = MAX_ENDPOINTS as u16 * 8;

pub const EP0_OUT: u8 = 0x00;
pub const EP0_IN: u8 = 0x80;

/// Handshake status of one endpoint direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Stat {
    Disabled,
    Stall,
    Nak,
    Valid,
}

/// One of the two packet memory slots of an endpoint
///
/// A single-buffered endpoint transmits from `Zero` and receives into `One`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Slot {
    Zero,
    One,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::Zero => Slot::One,
            Slot::One => Slot::Zero,
        }
    }
}

/// Register-level access to the USB peripheral
///
/// Endpoints are identified by their number (0 to 7). `direction` selects
/// the half of the endpoint register that an operation affects.
pub trait EndpointHardware {
    /// Next pending event, if any
    fn poll(&mut self) -> Option<Event>;
    /// Program the device address, enabling the function
    fn set_address(&mut self, address: u8);
    /// Program the endpoint type, and its kind bit for double buffering
    fn configure(&mut self, number: u8, kind: EndpointType, double_buffered: bool);
    /// Point a buffer descriptor at `offset` in packet memory
    ///
    /// For OUT buffers, `size` is the already-rounded receive size.
    fn setup_buffer(&mut self, number: u8, slot: Slot, direction: UsbDirection, offset: u16, size: u16);
    fn set_stat(&mut self, number: u8, direction: UsbDirection, stat: Stat);
    fn stat(&self, number: u8, direction: UsbDirection) -> Stat;
    /// Reset the data toggle to DATA0
    fn clear_data_toggle(&mut self, number: u8, direction: UsbDirection);
    /// Set the software buffer bit of a double-buffered endpoint
    fn set_software_buffer(&mut self, number: u8, direction: UsbDirection, set: bool);
    /// Toggle the software buffer bit, handing one slot to the peripheral
    fn toggle_software_buffer(&mut self, number: u8, direction: UsbDirection);
    /// Slot selected by the software buffer bit
    fn software_buffer(&self, number: u8, direction: UsbDirection) -> Slot;
    /// Copy a packet into a slot and set its byte count
    fn write_packet(&mut self, number: u8, slot: Slot, data: &[u8]);
    /// Copy a received packet out of a slot
    fn read_packet(&self, number: u8, slot: Slot, buffer: &mut [u8]) -> usize;
    /// Byte count of the packet received into a slot
    fn received_len(&self, number: u8, slot: Slot) -> usize;
}

/// Called when an endpoint completes a packet
///
/// `len` is the received length for OUT endpoints, and zero for IN endpoints.
pub type EndpointCallback<H, C> = fn(&mut C, &mut EndpointEngine<H, C>, EndpointAddress, usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxState {
    Disabled,
    Single { pending: u8 },
    Double { pending: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RxState {
    Disabled,
    Single { paused: bool },
    Double { next: Slot, paused: bool },
}

struct Endpoint<H, C> {
    tx: TxState,
    rx: RxState,
    tx_max_packet: u16,
    rx_max_packet: u16,
    tx_callback: Option<EndpointCallback<H, C>>,
    rx_callback: Option<EndpointCallback<H, C>>,
    /// Slot releases withheld while paused
    outstanding_acks: u8,
    /// Pause state changed during this endpoint's completion
    sync_pending: bool,
}

impl<H, C> Endpoint<H, C> {
    const fn new() -> Self {
        Endpoint {
            tx: TxState::Disabled,
            rx: RxState::Disabled,
            tx_max_packet: 0,
            rx_max_packet: 0,
            tx_callback: None,
            rx_callback: None,
            outstanding_acks: 0,
            sync_pending: false,
        }
    }
}

/// Transfer state for all endpoints of the device
pub struct EndpointEngine<H, C> {
    hw: H,
    endpoints: [Endpoint<H, C>; MAX_ENDPOINTS],
    pma: Allocator,
    max_packet_size_0: u16,
    /// Endpoint whose completion handler is running
    active: Option<EndpointAddress>,
}

impl<H: EndpointHardware, C> EndpointEngine<H, C> {
    /// Create an engine for `pma_size` bytes of packet memory
    ///
    /// Endpoint 0 is set up on the first bus reset.
    pub fn new(hw: H, pma_size: u16, max_packet_size_0: u16) -> Self {
        EndpointEngine {
            hw,
            endpoints: core::array::from_fn(|_| Endpoint::new()),
            pma: Allocator::new(PMA_START, pma_size),
            max_packet_size_0,
            active: None,
        }
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn max_packet_size_0(&self) -> u16 {
        self.max_packet_size_0
    }

    /// Bus reset: forget all endpoints, set up endpoint 0 and clear the address
    pub fn reset(&mut self) {
        for ep in self.endpoints.iter_mut() {
            *ep = Endpoint::new();
        }
        self.active = None;
        self.pma.reset();
        let control = EndpointType::Control;
        if let Err(_error) = self
            .setup(EP0_OUT.into(), control, self.max_packet_size_0, None)
            .and_then(|_| self.setup(EP0_IN.into(), control, self.max_packet_size_0, None))
        {
            warn!("EP0 setup failed: {}", _error);
        }
        self.pma.mark();
        self.hw.set_address(0);
    }

    /// Disable endpoints 1 to 7 and release their packet memory
    pub fn reset_endpoints(&mut self) {
        for (number, ep) in self.endpoints.iter_mut().enumerate().skip(1) {
            self.hw.set_stat(number as u8, UsbDirection::In, Stat::Disabled);
            self.hw.set_stat(number as u8, UsbDirection::Out, Stat::Disabled);
            *ep = Endpoint::new();
        }
        self.pma.rewind();
    }

    pub fn set_address(&mut self, address: u8) {
        debug!("ADDRESS {}", address);
        self.hw.set_address(address);
    }

    /// Configure an endpoint direction
    ///
    /// A bulk endpoint whose `buffer_size` exceeds one packet is double-buffered
    /// with two one-packet slots. `callback` runs after each completed packet.
    pub fn setup(
        &mut self,
        address: EndpointAddress,
        kind: EndpointType,
        buffer_size: u16,
        callback: Option<EndpointCallback<H, C>>,
    ) -> Result<(), UsbError> {
        let number = address.index();
        if number >= MAX_ENDPOINTS {
            return Err(UsbError::InvalidEndpoint);
        }
        if matches!(kind, EndpointType::Isochronous { .. }) {
            return Err(UsbError::Unsupported);
        }
        let double = kind == EndpointType::Bulk && buffer_size > MAX_PACKET_SIZE;
        let packet = buffer_size.min(MAX_PACKET_SIZE);
        let n = number as u8;

        let direction = address.direction();
        // A double-buffered direction takes both buffer descriptors
        let ep = &self.endpoints[number];
        let (other_used, other_double) = match direction {
            UsbDirection::In => (ep.rx != RxState::Disabled, matches!(ep.rx, RxState::Double { .. })),
            UsbDirection::Out => (ep.tx != TxState::Disabled, matches!(ep.tx, TxState::Double { .. })),
        };
        if other_used && (double || other_double) {
            return Err(UsbError::InvalidEndpoint);
        }

        let size = match direction {
            UsbDirection::In => packet,
            UsbDirection::Out => pma::rx_size(packet).effective,
        };
        let slots = if double { 2 } else { 1 };
        if self.pma.free() < size * slots {
            return Err(UsbError::EndpointMemoryOverflow);
        }
        let first = self
            .pma
            .allocate(size)
            .ok_or(UsbError::EndpointMemoryOverflow)?;
        let second = if double { self.pma.allocate(size) } else { None };

        self.hw.configure(n, kind, double);
        let ep = &mut self.endpoints[number];
        match direction {
            UsbDirection::In => {
                self.hw.setup_buffer(n, Slot::Zero, direction, first, packet);
                self.hw.clear_data_toggle(n, direction);
                ep.tx_max_packet = packet;
                ep.tx_callback = callback;
                if let Some(second) = second {
                    self.hw.setup_buffer(n, Slot::One, direction, second, packet);
                    self.hw.set_software_buffer(n, direction, false);
                    ep.tx = TxState::Double { pending: 0 };
                    self.hw.set_stat(n, direction, Stat::Valid);
                } else {
                    ep.tx = TxState::Single { pending: 0 };
                    self.hw.set_stat(n, direction, Stat::Nak);
                }
            }
            UsbDirection::Out => {
                self.hw.setup_buffer(n, Slot::One, direction, first, size);
                self.hw.clear_data_toggle(n, direction);
                ep.rx_max_packet = packet;
                ep.rx_callback = callback;
                ep.outstanding_acks = 0;
                ep.sync_pending = false;
                if let Some(second) = second {
                    self.hw.setup_buffer(n, Slot::Zero, direction, second, size);
                    self.hw.set_software_buffer(n, direction, true);
                    ep.rx = RxState::Double {
                        next: Slot::Zero,
                        paused: false,
                    };
                } else {
                    ep.rx = RxState::Single { paused: false };
                }
                self.hw.set_stat(n, direction, Stat::Valid);
            }
        }
        debug!(
            "EP{} {} setup, {} bytes, double={}",
            n,
            address.is_in(),
            packet,
            double
        );
        Ok(())
    }

    /// Largest packet the endpoint direction handles
    pub fn max_packet_size(&self, address: EndpointAddress) -> usize {
        let Some(ep) = self.endpoints.get(address.index()) else {
            return 0;
        };
        match address.direction() {
            UsbDirection::In => ep.tx_max_packet as usize,
            UsbDirection::Out => ep.rx_max_packet as usize,
        }
    }

    /// Bytes that the next [`transmit_packet`](Self::transmit_packet) accepts
    pub fn write_avail(&self, address: EndpointAddress) -> usize {
        let Some(ep) = self.endpoints.get(address.index()) else {
            return 0;
        };
        match ep.tx {
            TxState::Single { pending: 0 } | TxState::Double { pending: 0 | 1 } => {
                ep.tx_max_packet as usize
            }
            _ => 0,
        }
    }

    /// Submit one packet on an IN endpoint
    ///
    /// Data beyond the packet size is not sent. Returns the number of bytes
    /// submitted, or `WouldBlock` if all of the endpoint's slots are busy.
    pub fn transmit_packet(
        &mut self,
        address: EndpointAddress,
        data: &[u8],
    ) -> Result<usize, UsbError> {
        let number = address.index();
        let ep = self
            .endpoints
            .get_mut(number)
            .ok_or(UsbError::InvalidEndpoint)?;
        let n = number as u8;
        let len = data.len().min(ep.tx_max_packet as usize);
        match ep.tx {
            TxState::Single { pending: 0 } => {
                self.hw.write_packet(n, Slot::Zero, &data[..len]);
                ep.tx = TxState::Single { pending: 1 };
                self.hw.set_stat(n, UsbDirection::In, Stat::Valid);
            }
            TxState::Double {
                pending: pending @ 0..=1,
            } => {
                let slot = self.hw.software_buffer(n, UsbDirection::In);
                self.hw.write_packet(n, slot, &data[..len]);
                ep.tx = TxState::Double {
                    pending: pending + 1,
                };
                self.hw.toggle_software_buffer(n, UsbDirection::In);
            }
            TxState::Disabled => return Err(UsbError::InvalidEndpoint),
            _ => return Err(UsbError::WouldBlock),
        }
        trace!("EP{} IN {} bytes", n, len);
        Ok(len)
    }

    /// Slot holding the packet the engine reads next
    fn rx_slot(&self, number: usize) -> Slot {
        match self.endpoints[number].rx {
            RxState::Double { next, .. } => next,
            _ => Slot::One,
        }
    }

    /// Copy the received packet
    ///
    /// Only valid from the endpoint's own completion handler. Anywhere else,
    /// nothing is copied.
    pub fn read_packet(&mut self, address: EndpointAddress, buffer: &mut [u8]) -> usize {
        if self.active != Some(address) || address.is_in() {
            return 0;
        }
        let number = address.index();
        let slot = self.rx_slot(number);
        self.hw.read_packet(number as u8, slot, buffer)
    }

    /// Make the host NAK an OUT endpoint
    pub fn pause(&mut self, address: EndpointAddress) {
        if address.is_in() {
            return;
        }
        let Some(ep) = self.endpoints.get_mut(address.index()) else {
            return;
        };
        match ep.rx {
            RxState::Single { paused: false } => ep.rx = RxState::Single { paused: true },
            RxState::Double {
                next,
                paused: false,
            } => {
                ep.rx = RxState::Double { next, paused: true };
            }
            _ => return,
        }
        trace!("EP{} paused", address.index());
        self.sync(address);
    }

    /// Undo [`pause`](Self::pause)
    pub fn unpause(&mut self, address: EndpointAddress) {
        if address.is_in() {
            return;
        }
        let Some(ep) = self.endpoints.get_mut(address.index()) else {
            return;
        };
        match ep.rx {
            RxState::Single { paused: true } => ep.rx = RxState::Single { paused: false },
            RxState::Double { next, paused: true } => {
                ep.rx = RxState::Double {
                    next,
                    paused: false,
                };
            }
            _ => return,
        }
        trace!("EP{} unpaused", address.index());
        self.sync(address);
    }

    pub fn is_paused(&self, address: EndpointAddress) -> bool {
        matches!(
            self.endpoints.get(address.index()).map(|ep| ep.rx),
            Some(RxState::Single { paused: true } | RxState::Double { paused: true, .. })
        )
    }

    fn sync(&mut self, address: EndpointAddress) {
        if self.active == Some(address) {
            self.endpoints[address.index()].sync_pending = true;
        } else {
            self.apply_pause(address.index());
        }
    }

    /// Bring the registers in line with the logical pause state
    fn apply_pause(&mut self, number: usize) {
        let n = number as u8;
        let ep = &mut self.endpoints[number];
        match ep.rx {
            RxState::Single { paused: true } => self.hw.set_stat(n, UsbDirection::Out, Stat::Nak),
            RxState::Single { paused: false } => {
                self.hw.set_stat(n, UsbDirection::Out, Stat::Valid)
            }
            RxState::Double { paused: false, .. } => {
                while ep.outstanding_acks > 0 {
                    self.hw.toggle_software_buffer(n, UsbDirection::Out);
                    ep.outstanding_acks -= 1;
                }
            }
            RxState::Double { paused: true, .. } | RxState::Disabled => {}
        }
    }

    /// Stall (`true`) or clear the stall of an endpoint
    ///
    /// Clearing a stall resets the data toggle. Endpoint 0 stalls in both
    /// directions.
    pub fn set_stalled(&mut self, address: EndpointAddress, stalled: bool) {
        let number = address.index();
        if number >= MAX_ENDPOINTS {
            return;
        }
        let n = number as u8;
        if number == 0 {
            let stat = if stalled { Stat::Stall } else { Stat::Nak };
            self.hw.set_stat(0, UsbDirection::In, stat);
            let stat = if stalled { Stat::Stall } else { Stat::Valid };
            self.hw.set_stat(0, UsbDirection::Out, stat);
            return;
        }

        let direction = address.direction();
        if !stalled {
            self.hw.clear_data_toggle(n, direction);
        }
        let ep = &mut self.endpoints[number];
        let stat = match (direction, stalled) {
            (_, true) => Stat::Stall,
            (UsbDirection::Out, false) => match ep.rx {
                RxState::Double { paused, .. } => {
                    // Both slots start over; a paused endpoint keeps one
                    // release back, so the peripheral NAKs
                    ep.rx = RxState::Double {
                        next: Slot::Zero,
                        paused,
                    };
                    ep.outstanding_acks = u8::from(paused);
                    ep.sync_pending = false;
                    self.hw.set_software_buffer(n, direction, !paused);
                    Stat::Valid
                }
                RxState::Single { paused: true } => Stat::Nak,
                RxState::Single { paused: false } => Stat::Valid,
                RxState::Disabled => Stat::Nak,
            },
            (UsbDirection::In, false) => match ep.tx {
                TxState::Double { .. } => {
                    ep.tx = TxState::Double { pending: 0 };
                    self.hw.set_software_buffer(n, direction, false);
                    Stat::Valid
                }
                TxState::Single { .. } => {
                    ep.tx = TxState::Single { pending: 0 };
                    Stat::Nak
                }
                TxState::Disabled => Stat::Nak,
            },
        };
        self.hw.set_stat(n, direction, stat);
    }

    /// The endpoint direction has been set up
    pub fn is_enabled(&self, address: EndpointAddress) -> bool {
        self.endpoints
            .get(address.index())
            .map_or(false, |ep| match address.direction() {
                UsbDirection::In => ep.tx != TxState::Disabled,
                UsbDirection::Out => ep.rx != RxState::Disabled,
            })
    }

    pub fn is_stalled(&self, address: EndpointAddress) -> bool {
        address.index() < MAX_ENDPOINTS
            && self.hw.stat(address.index() as u8, address.direction()) == Stat::Stall
    }

    /// A SETUP packet arrived on endpoint 0
    ///
    /// The peripheral NAKs both directions on SETUP, which drops any IN data
    /// still queued from an earlier transfer.
    pub(crate) fn begin_setup(&mut self) {
        if let TxState::Single { .. } = self.endpoints[0].tx {
            self.endpoints[0].tx = TxState::Single { pending: 0 };
        }
        self.active = Some(EP0_OUT.into());
    }

    /// Endpoint 0 is being serviced by the control pipe
    pub(crate) fn begin_control(&mut self) {
        self.active = Some(EP0_OUT.into());
    }

    /// Endpoint 0 service is done; re-arm reception
    pub(crate) fn end_control(&mut self) {
        self.active = None;
        self.release_rx(0);
    }

    /// Endpoint 0 IN packet was acknowledged
    pub(crate) fn complete_control_in(&mut self) {
        self.complete_tx(0);
    }

    fn complete_tx(&mut self, number: usize) {
        let ep = &mut self.endpoints[number];
        ep.tx = match ep.tx {
            TxState::Single { pending } => TxState::Single {
                pending: pending.saturating_sub(1),
            },
            TxState::Double { pending } => TxState::Double {
                pending: pending.saturating_sub(1),
            },
            TxState::Disabled => TxState::Disabled,
        };
    }

    /// Hand the slot that was just read back to the peripheral
    fn release_rx(&mut self, number: usize) {
        let n = number as u8;
        let ep = &mut self.endpoints[number];
        match ep.rx {
            // A stall holds until the host clears it, or the next SETUP
            RxState::Single { paused: false }
                if self.hw.stat(n, UsbDirection::Out) != Stat::Stall =>
            {
                self.hw.set_stat(n, UsbDirection::Out, Stat::Valid)
            }
            RxState::Single { .. } | RxState::Disabled => {}
            RxState::Double { next, paused } => {
                if paused {
                    ep.outstanding_acks += 1;
                } else {
                    self.hw.toggle_software_buffer(n, UsbDirection::Out);
                }
                ep.rx = RxState::Double {
                    next: next.other(),
                    paused,
                };
            }
        }
        if core::mem::replace(&mut ep.sync_pending, false) {
            self.apply_pause(number);
        }
    }

    /// An OUT packet arrived on a non-control endpoint
    pub(crate) fn on_out(&mut self, context: &mut C, address: EndpointAddress) {
        let number = address.index();
        if number == 0 || number >= MAX_ENDPOINTS {
            return;
        }
        let len = self.hw.received_len(number as u8, self.rx_slot(number));
        if let Some(callback) = self.endpoints[number].rx_callback {
            self.active = Some(address);
            callback(context, self, address, len);
            self.active = None;
        }
        self.release_rx(number);
    }

    /// An IN packet on a non-control endpoint was acknowledged
    pub(crate) fn on_in(&mut self, context: &mut C, address: EndpointAddress) {
        let number = address.index();
        if number == 0 || number >= MAX_ENDPOINTS {
            return;
        }
        self.complete_tx(number);
        if let Some(callback) = self.endpoints[number].tx_callback {
            self.active = Some(address);
            callback(context, self, address, 0);
            self.active = None;
        }
    }
}
