//! Simulated peripherals and a simulated host, for unit tests

use crate::uart::{Divisor, Frame, Input, Output, UartPeripheral};
use crate::usb::{Descriptors, Device, EndpointHardware, Event, SetupPacket, Slot, Stat};
use std::{boxed::Box, collections::VecDeque, vec, vec::Vec};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// A buffer with a static lifetime, for DMA
pub fn leak(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

/// A UART with a DMA engine, and a wire that records everything sent
pub struct SimUart {
    pub configured: Option<(Divisor, Frame)>,
    pub configure_count: usize,
    pub wire: Vec<u8>,
    /// Transmit transfers complete as soon as they start
    pub auto_complete: bool,
    pub dcd_level: bool,
    pub dsr_level: bool,
    outputs: [bool; 4],
    tx_complete: bool,
    rx_buffer: *mut u8,
    rx_len: usize,
    rx_pos: usize,
}

impl SimUart {
    pub fn new() -> Self {
        SimUart {
            configured: None,
            configure_count: 0,
            wire: Vec::new(),
            auto_complete: true,
            dcd_level: true,
            dsr_level: true,
            outputs: [false; 4],
            tx_complete: false,
            rx_buffer: core::ptr::null_mut(),
            rx_len: 0,
            rx_pos: 0,
        }
    }

    /// Bytes arriving on the wire, written by the receive DMA
    pub fn receive(&mut self, bytes: &[u8]) {
        assert!(self.rx_len > 0, "receive DMA not running");
        for byte in bytes {
            // Safety: the engine keeps the buffer alive while DMA runs
            unsafe { self.rx_buffer.add(self.rx_pos).write_volatile(*byte) };
            self.rx_pos = (self.rx_pos + 1) % self.rx_len;
        }
    }

    /// The transmit transfer in flight finishes
    pub fn complete_tx(&mut self) {
        self.tx_complete = true;
    }

    /// Level of an output pin
    pub fn output(&self, output: Output) -> bool {
        self.outputs[output as usize]
    }
}

impl UartPeripheral for SimUart {
    fn clock_hz(&self) -> u32 {
        48_000_000
    }
    fn configure(&mut self, divisor: Divisor, frame: Frame) {
        self.configured = Some((divisor, frame));
        self.configure_count += 1;
    }
    unsafe fn start_rx_dma(&mut self, buffer: *mut u8, len: usize) {
        self.rx_buffer = buffer;
        self.rx_len = len;
        self.rx_pos = 0;
    }
    fn rx_dma_remaining(&self) -> usize {
        self.rx_len - self.rx_pos
    }
    unsafe fn start_tx_dma(&mut self, data: *const u8, len: usize) {
        self.wire
            .extend_from_slice(core::slice::from_raw_parts(data, len));
        if self.auto_complete {
            self.tx_complete = true;
        }
    }
    fn take_tx_complete(&mut self) -> bool {
        core::mem::replace(&mut self.tx_complete, false)
    }
    fn set_output(&mut self, output: Output, high: bool) {
        self.outputs[output as usize] = high;
    }
    fn input(&self, input: Input) -> bool {
        match input {
            Input::Dcd => self.dcd_level,
            Input::Dsr => self.dsr_level,
        }
    }
}

const OUT: usize = 0;
const IN: usize = 1;

fn half(direction: UsbDirection) -> usize {
    match direction {
        UsbDirection::Out => OUT,
        UsbDirection::In => IN,
    }
}

fn slot_index(slot: Slot) -> usize {
    match slot {
        Slot::Zero => 0,
        Slot::One => 1,
    }
}

struct SimEndpoint {
    double: bool,
    stat: [Stat; 2],
    dtog: [bool; 2],
    sw_buf: [bool; 2],
    slots: [Vec<u8>; 2],
    /// Slots handed to the peripheral, double-buffered IN only
    tx_queue: VecDeque<Slot>,
}

impl SimEndpoint {
    fn new() -> Self {
        SimEndpoint {
            double: false,
            stat: [Stat::Disabled; 2],
            dtog: [false; 2],
            sw_buf: [false; 2],
            slots: [Vec::new(), Vec::new()],
            tx_queue: VecDeque::new(),
        }
    }
}

/// A full-speed device peripheral, driven by a simulated host
///
/// Single-buffered directions handshake with their STAT bits. Double-buffered
/// OUT follows the DTOG / SW_BUF rule of the hardware. Double-buffered IN
/// queues each slot that software hands over.
pub struct SimUsb {
    pub address: Option<u8>,
    endpoints: [SimEndpoint; 8],
    events: VecDeque<Event>,
}

impl SimUsb {
    pub fn new() -> Self {
        SimUsb {
            address: None,
            endpoints: core::array::from_fn(|_| SimEndpoint::new()),
            events: VecDeque::new(),
        }
    }

    /// Bus reset; the peripheral clears its endpoint registers
    pub fn host_reset(&mut self) {
        self.endpoints = core::array::from_fn(|_| SimEndpoint::new());
        self.address = None;
        self.events.push_back(Event::Reset);
    }

    /// A SETUP transaction on endpoint 0
    pub fn host_setup(&mut self, bytes: &[u8]) {
        let ep = &mut self.endpoints[0];
        ep.slots[1] = bytes.to_vec();
        ep.stat = [Stat::Nak; 2];
        self.events.push_back(Event::Setup);
    }

    /// An OUT transaction; `false` if the peripheral did not ACK
    pub fn host_out(&mut self, number: u8, data: &[u8]) -> bool {
        let ep = &mut self.endpoints[number as usize];
        if ep.stat[OUT] != Stat::Valid {
            return false;
        }
        if ep.double {
            if ep.dtog[OUT] == ep.sw_buf[OUT] {
                return false;
            }
            ep.slots[ep.dtog[OUT] as usize] = data.to_vec();
            ep.dtog[OUT] = !ep.dtog[OUT];
        } else {
            ep.slots[1] = data.to_vec();
            ep.stat[OUT] = Stat::Nak;
        }
        let address = EndpointAddress::from_parts(number as usize, UsbDirection::Out);
        self.events.push_back(Event::Out(address));
        true
    }

    /// An IN transaction; `None` if the peripheral did not send data
    pub fn host_in(&mut self, number: u8) -> Option<Vec<u8>> {
        let ep = &mut self.endpoints[number as usize];
        if ep.stat[IN] != Stat::Valid {
            return None;
        }
        let packet = if ep.double {
            let slot = ep.tx_queue.pop_front()?;
            ep.slots[slot_index(slot)].clone()
        } else {
            ep.stat[IN] = Stat::Nak;
            ep.slots[0].clone()
        };
        let address = EndpointAddress::from_parts(number as usize, UsbDirection::In);
        self.events.push_back(Event::In(address));
        Some(packet)
    }
}

impl EndpointHardware for SimUsb {
    fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }
    fn set_address(&mut self, address: u8) {
        self.address = Some(address);
    }
    fn configure(&mut self, number: u8, _: EndpointType, double_buffered: bool) {
        self.endpoints[number as usize].double = double_buffered;
    }
    fn setup_buffer(&mut self, _: u8, _: Slot, _: UsbDirection, _: u16, _: u16) {}
    fn set_stat(&mut self, number: u8, direction: UsbDirection, stat: Stat) {
        self.endpoints[number as usize].stat[half(direction)] = stat;
    }
    fn stat(&self, number: u8, direction: UsbDirection) -> Stat {
        self.endpoints[number as usize].stat[half(direction)]
    }
    fn clear_data_toggle(&mut self, number: u8, direction: UsbDirection) {
        self.endpoints[number as usize].dtog[half(direction)] = false;
    }
    fn set_software_buffer(&mut self, number: u8, direction: UsbDirection, set: bool) {
        let ep = &mut self.endpoints[number as usize];
        ep.sw_buf[half(direction)] = set;
        if direction == UsbDirection::In {
            ep.tx_queue.clear();
        }
    }
    fn toggle_software_buffer(&mut self, number: u8, direction: UsbDirection) {
        let ep = &mut self.endpoints[number as usize];
        let index = half(direction);
        if index == IN && ep.double {
            let slot = if ep.sw_buf[IN] { Slot::One } else { Slot::Zero };
            ep.tx_queue.push_back(slot);
        }
        ep.sw_buf[index] = !ep.sw_buf[index];
    }
    fn software_buffer(&self, number: u8, direction: UsbDirection) -> Slot {
        if self.endpoints[number as usize].sw_buf[half(direction)] {
            Slot::One
        } else {
            Slot::Zero
        }
    }
    fn write_packet(&mut self, number: u8, slot: Slot, data: &[u8]) {
        self.endpoints[number as usize].slots[slot_index(slot)] = data.to_vec();
    }
    fn read_packet(&self, number: u8, slot: Slot, buffer: &mut [u8]) -> usize {
        let packet = &self.endpoints[number as usize].slots[slot_index(slot)];
        let len = packet.len().min(buffer.len());
        buffer[..len].copy_from_slice(&packet[..len]);
        len
    }
    fn received_len(&self, number: u8, slot: Slot) -> usize {
        self.endpoints[number as usize].slots[slot_index(slot)].len()
    }
}

/// Run a control transfer with an IN data stage
///
/// Returns the data, or `None` if the device stalled.
pub fn control_in<C, D: Descriptors>(
    device: &mut Device<SimUsb, C, D>,
    context: &mut C,
    setup: SetupPacket,
) -> Option<Vec<u8>> {
    let max_packet_size = device.engine().max_packet_size_0() as usize;
    device.engine_mut().hardware_mut().host_setup(&setup.to_bytes());
    device.poll(context);

    let mut data = Vec::new();
    loop {
        let packet = device.engine_mut().hardware_mut().host_in(0)?;
        device.poll(context);
        let len = packet.len();
        data.extend_from_slice(&packet);
        if len < max_packet_size || data.len() >= setup.length as usize {
            break;
        }
    }

    if !device.engine_mut().hardware_mut().host_out(0, &[]) {
        return None;
    }
    device.poll(context);
    Some(data)
}

/// Run a control transfer with an optional OUT data stage
///
/// Returns `true` if the device completed the status stage.
pub fn control_out<C, D: Descriptors>(
    device: &mut Device<SimUsb, C, D>,
    context: &mut C,
    setup: SetupPacket,
    data: &[u8],
) -> bool {
    let max_packet_size = device.engine().max_packet_size_0() as usize;
    device.engine_mut().hardware_mut().host_setup(&setup.to_bytes());
    device.poll(context);

    for packet in data.chunks(max_packet_size) {
        if !device.engine_mut().hardware_mut().host_out(0, packet) {
            return false;
        }
        device.poll(context);
    }

    match device.engine_mut().hardware_mut().host_in(0) {
        Some(status) if status.is_empty() => {
            device.poll(context);
            true
        }
        _ => false,
    }
}

/// Descriptors of a CDC-ACM function
pub struct SimDescriptors;

impl SimDescriptors {
    pub const DEVICE: [u8; 18] = [
        18, 1, 0x00, 0x02, // USB 2.0
        0x02, 0x00, 0x00, 64, // CDC, EP0 packet size
        0x83, 0x04, 0x40, 0x57, // VID, PID
        0x00, 0x01, 1, 2, 3, 1,
    ];

    pub const CONFIGURATION: [u8; 67] = [
        9, 2, 67, 0, 2, 1, 0, 0x80, 50,
        // communication interface
        9, 4, 0, 0, 1, 0x02, 0x02, 0x01, 0,
        5, 0x24, 0x00, 0x10, 0x01, // header
        5, 0x24, 0x01, 0x00, 0x01, // call management
        4, 0x24, 0x02, 0x02, // ACM
        5, 0x24, 0x06, 0x00, 0x01, // union
        7, 5, 0x83, 0x03, 16, 0, 16,
        // data interface
        9, 4, 1, 0, 2, 0x0A, 0x00, 0x00, 0,
        7, 5, 0x01, 0x02, 64, 0, 0,
        7, 5, 0x82, 0x02, 64, 0, 0,
    ];
}

impl Descriptors for SimDescriptors {
    fn device(&self) -> &[u8] {
        &Self::DEVICE
    }
    fn configuration(&self, index: u8) -> Option<&[u8]> {
        (index == 0).then_some(&Self::CONFIGURATION as &[u8])
    }
    fn string(&self, index: u8) -> Option<&str> {
        match index {
            1 => Some("Open Hardware"),
            2 => Some("USB Serial"),
            3 => Some("0001"),
            _ => None,
        }
    }
}
