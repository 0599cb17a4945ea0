//! USB serial bridge
//!
//! [`UsbSerial`] couples a CDC-ACM function to the [`Uart`] engine. It's the
//! context that the [`Device`] hands to every handler.
//!
//! # Host to wire
//!
//! Each bulk OUT packet goes straight into the UART transmit ring. The OUT
//! endpoint is paused while less than two packets of space remain, so the
//! host retries instead of losing data.
//!
//! # Wire to host
//!
//! [`poll`](UsbSerial::poll) moves received data into bulk IN packets. Small
//! amounts are held back for a few milliseconds, so a slow trickle doesn't
//! turn into one packet per byte. A transfer that ends on a full packet is
//! terminated with a zero-length packet.

use crate::cdc::{self, SerialState, COMM_INTERFACE, NOTIFICATION_LEN};
use crate::line_coding::{InvalidCoding, LineCoding};
use crate::uart::{Uart, UartPeripheral};
use crate::usb::{
    request_type, Descriptors, Device, EndpointEngine, EndpointHardware, TableFull,
};
use usb_device::endpoint::{EndpointAddress, EndpointType};

/// Bulk OUT endpoint address of the data interface
pub const DATA_OUT: u8 = 0x01;
/// Bulk IN endpoint address of the data interface, double-buffered
pub const DATA_IN: u8 = 0x82;
/// Interrupt IN endpoint address of the communication interface
pub const COMM_IN: u8 = 0x83;

/// Bulk packet size
pub const PACKET_SIZE: usize = 64;
/// Buffer size of [`DATA_IN`]
pub const DATA_IN_BUFFER: u16 = 2 * PACKET_SIZE as u16;
/// Packet size of [`COMM_IN`]
pub const COMM_PACKET_SIZE: u16 = 16;

/// Longest time received data is held back, in milliseconds
pub const HOLDBACK_TIME: u32 = 3;
/// Amount of received data that is sent without holding back
pub const HOLDBACK_LEN: usize = 16;
/// Pause [`DATA_OUT`] below this much free transmit space
pub const TX_LOW_SPACE: usize = 2 * PACKET_SIZE;

pub struct UsbSerial<P> {
    uart: Uart<P>,
    connected: bool,
    /// The last IN packet was full
    needs_zlp: bool,
    /// [`DATA_OUT`] is paused
    tx_high_water: bool,
    /// Levels that the host last heard about
    last_serial_state: SerialState,
    /// Events not yet delivered to the host
    pending: SerialState,
    /// Time of the last IN packet
    tx_timestamp: u32,
    now: u32,
}

impl<P: UartPeripheral> UsbSerial<P> {
    pub fn new(uart: Uart<P>) -> Self {
        UsbSerial {
            uart,
            connected: false,
            needs_zlp: false,
            tx_high_water: false,
            last_serial_state: SerialState::empty(),
            pending: SerialState::empty(),
            tx_timestamp: 0,
            now: 0,
        }
    }

    /// Install the configuration handler and the CDC class request filter
    pub fn register<H: EndpointHardware, D: Descriptors>(
        device: &mut Device<H, Self, D>,
    ) -> Result<(), TableFull> {
        device.register_config_handler(Self::on_configured)?;
        device.register_request_filter(
            request_type::CLASS | request_type::INTERFACE,
            request_type::TYPE_MASK | request_type::RECIPIENT_MASK,
            cdc::class_request,
        )
    }

    pub fn uart(&self) -> &Uart<P> {
        &self.uart
    }

    pub fn uart_mut(&mut self) -> &mut Uart<P> {
        &mut self.uart
    }

    /// The host has selected a configuration
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Configuration changed; 0 means deconfigured or reset
    pub fn on_configured<H: EndpointHardware>(
        &mut self,
        engine: &mut EndpointEngine<H, Self>,
        configuration: u8,
    ) {
        if configuration == 0 {
            debug!("serial disconnected");
            self.connected = false;
            self.uart.set_dtr(false);
            return;
        }

        self.needs_zlp = false;
        self.tx_high_water = false;
        self.last_serial_state = SerialState::empty();
        self.pending = SerialState::empty();
        self.tx_timestamp = self.now.wrapping_sub(100);

        let setup = engine
            .setup(
                EndpointAddress::from(DATA_OUT),
                EndpointType::Bulk,
                PACKET_SIZE as u16,
                Some(Self::on_data_received),
            )
            .and_then(|_| {
                let data_in = EndpointAddress::from(DATA_IN);
                engine.setup(data_in, EndpointType::Bulk, DATA_IN_BUFFER, None)
            })
            .and_then(|_| {
                engine.setup(
                    EndpointAddress::from(COMM_IN),
                    EndpointType::Interrupt,
                    COMM_PACKET_SIZE,
                    Some(Self::on_notification_sent),
                )
            });
        if let Err(_error) = setup {
            warn!("serial endpoint setup failed: {}", _error);
            return;
        }

        self.uart.enable();
        self.uart.set_dtr(true);
        self.connected = true;
        debug!("serial connected");

        // Lets hosts that wait for a serial state open the port
        let state = self.serial_state();
        self.notify(engine, state);
    }

    /// A packet arrived on [`DATA_OUT`]
    fn on_data_received<H: EndpointHardware>(
        &mut self,
        engine: &mut EndpointEngine<H, Self>,
        address: EndpointAddress,
        _: usize,
    ) {
        let mut packet = [0; PACKET_SIZE];
        let len = engine.read_packet(address, &mut packet);
        if len == 0 {
            return;
        }
        self.uart.transmit(&packet[..len]);
        self.update_pause(engine);
    }

    /// The host collected a notification from [`COMM_IN`]
    fn on_notification_sent<H: EndpointHardware>(
        &mut self,
        engine: &mut EndpointEngine<H, Self>,
        _: EndpointAddress,
        _: usize,
    ) {
        let state = self.serial_state();
        if state != self.last_serial_state {
            self.notify(engine, state);
        }
    }

    /// Move data and state between the UART and the host
    ///
    /// `now` is a millisecond timestamp.
    pub fn poll<H: EndpointHardware>(&mut self, engine: &mut EndpointEngine<H, Self>, now: u32) {
        self.now = now;
        self.uart.poll(now);
        if !self.connected {
            return;
        }

        self.update_pause(engine);

        if self.uart.has_overrun_occurred() {
            self.on_interrupt_occurred(engine, SerialState::OVERRUN);
            return;
        }

        let state = self.serial_state();
        if state != self.last_serial_state {
            self.notify(engine, state);
        }

        self.send_rx_data(engine);
    }

    /// Fill the free slots of [`DATA_IN`]
    fn send_rx_data<H: EndpointHardware>(&mut self, engine: &mut EndpointEngine<H, Self>) {
        loop {
            let len = self.uart.rx_data_len();
            if !self.needs_zlp {
                if len == 0 {
                    return;
                }
                let deadline = self.tx_timestamp.wrapping_add(HOLDBACK_TIME);
                if len < HOLDBACK_LEN && !has_expired(deadline, self.now) {
                    return;
                }
            }

            let avail = engine.write_avail(EndpointAddress::from(DATA_IN)).min(PACKET_SIZE);
            if avail == 0 {
                return;
            }

            self.tx_timestamp = self.now;
            let mut packet = [0; PACKET_SIZE];
            let len = self.uart.copy_rx_data(&mut packet[..avail]);
            self.needs_zlp = len > 0 && len % PACKET_SIZE == 0;
            if engine.transmit_packet(EndpointAddress::from(DATA_IN), &packet[..len]).is_err() {
                return;
            }
        }
    }

    /// Pause or resume [`DATA_OUT`] as transmit space crosses the threshold
    fn update_pause<H: EndpointHardware>(&mut self, engine: &mut EndpointEngine<H, Self>) {
        let low = self.uart.tx_data_avail() < TX_LOW_SPACE;
        if low && !self.tx_high_water {
            self.tx_high_water = true;
            engine.pause(EndpointAddress::from(DATA_OUT));
        } else if !low && self.tx_high_water {
            self.tx_high_water = false;
            engine.unpause(EndpointAddress::from(DATA_OUT));
        }
    }

    /// Current levels, plus undelivered events
    pub fn serial_state(&self) -> SerialState {
        let mut state = self.pending;
        state.set(SerialState::DCD, self.uart.dcd());
        state.set(SerialState::DSR, self.uart.dsr());
        state
    }

    /// Record an event for the host, and try to deliver it
    pub fn on_interrupt_occurred<H: EndpointHardware>(
        &mut self,
        engine: &mut EndpointEngine<H, Self>,
        event: SerialState,
    ) {
        self.pending |= event;
        let state = self.serial_state();
        self.notify(engine, state);
    }

    /// Send a SERIAL_STATE notification
    ///
    /// If [`COMM_IN`] is busy, nothing is recorded, and the state is
    /// retried later.
    fn notify<H: EndpointHardware>(&mut self, engine: &mut EndpointEngine<H, Self>, state: SerialState) {
        let notification = cdc::serial_state_notification(COMM_INTERFACE, state);
        let comm_in = EndpointAddress::from(COMM_IN);
        if let Ok(NOTIFICATION_LEN) = engine.transmit_packet(comm_in, &notification) {
            trace!("SERIAL_STATE {=u16:x}", state.bits());
            self.last_serial_state = state & SerialState::LEVELS;
            self.pending = SerialState::empty();
        }
    }

    pub fn line_coding(&self) -> LineCoding {
        self.uart.line_coding()
    }

    /// Apply a new line coding, keeping the previous one on error
    pub fn set_line_coding(&mut self, coding: LineCoding) -> Result<(), InvalidCoding> {
        self.uart.configure(coding)
    }

    /// `SET_CONTROL_LINE_STATE`; bit 0 of `value` is DTR
    pub fn set_control_line_state(&mut self, value: u16) {
        self.uart.set_dtr(value & 1 != 0);
    }
}

/// `true` once `deadline` has passed, across timer wraparound
fn has_expired(deadline: u32, now: u32) -> bool {
    (deadline.wrapping_sub(now) as i32) <= 0
}

#[cfg(test)]
mod test {
    use super::{has_expired, UsbSerial};
    use crate::cdc::SerialState;
    use crate::line_coding::{LineCoding, Parity};
    use crate::sim::{self, control_in, control_out, SimDescriptors, SimUart, SimUsb};
    use crate::uart::{Output, Uart};
    use crate::usb::{Device, SetupPacket};
    use std::vec::Vec;

    type Bridge = (Device<SimUsb, UsbSerial<SimUart>, SimDescriptors>, UsbSerial<SimUart>);

    const DATA_OUT: u8 = 1;
    const DATA_IN: u8 = 2;
    const COMM_IN: u8 = 3;

    fn request(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
        SetupPacket {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// An enumerated and configured bridge at time 1000
    fn bridge(tx: usize, rx: usize) -> Bridge {
        let uart = Uart::new(SimUart::new(), sim::leak(tx), sim::leak(rx));
        let mut serial = UsbSerial::new(uart);
        let mut device = Device::new(SimUsb::new(), SimDescriptors, 512);
        UsbSerial::register(&mut device).unwrap();
        serial.poll(device.engine_mut(), 1000);

        device.engine_mut().hardware_mut().host_reset();
        device.poll(&mut serial);
        assert!(control_out(&mut device, &mut serial, request(0x00, 9, 1, 0, 0), &[]));
        assert!(serial.is_connected());
        (device, serial)
    }

    fn host_in(bridge: &mut Bridge, number: u8) -> Option<Vec<u8>> {
        let (device, serial) = bridge;
        let packet = device.engine_mut().hardware_mut().host_in(number);
        device.poll(serial);
        packet
    }

    fn host_out(bridge: &mut Bridge, data: &[u8]) -> bool {
        let (device, serial) = bridge;
        let accepted = device.engine_mut().hardware_mut().host_out(DATA_OUT, data);
        device.poll(serial);
        accepted
    }

    fn poll(bridge: &mut Bridge, now: u32) {
        let (device, serial) = bridge;
        serial.poll(device.engine_mut(), now);
    }

    fn set_line_coding(bridge: &mut Bridge, coding: &[u8]) -> bool {
        let (device, serial) = bridge;
        control_out(device, serial, request(0x21, 0x20, 0, 0, 7), coding)
    }

    #[test]
    fn holdback_deadline_wraps() {
        assert!(has_expired(5, 5));
        assert!(has_expired(u32::MAX - 1, 3));
        assert!(!has_expired(2, u32::MAX - 1));
    }

    #[test]
    fn configuration_starts_the_uart() {
        let mut bridge = bridge(256, 256);
        let uart = bridge.1.uart();
        assert!(uart.dtr());
        assert!(!uart.peripheral().output(Output::Dtr));
        // initial serial state, both inputs released
        assert_eq!(
            host_in(&mut bridge, COMM_IN),
            Some(std::vec![0xA1, 0x20, 0, 0, 0, 0, 2, 0, 0, 0])
        );
    }

    #[test]
    fn line_coding_then_data() {
        let mut bridge = bridge(256, 256);
        assert!(set_line_coding(&mut bridge, &[0x00, 0xC2, 0x01, 0x00, 0, 0, 8]));
        let coding = bridge.1.line_coding();
        assert_eq!(coding.baud_rate, 115_200);
        let (divisor, frame) = bridge.1.uart().peripheral().configured.unwrap();
        assert_eq!(divisor.brr, 417);
        assert_eq!(frame.word_bits, 8);

        let data: Vec<u8> = (0..64).collect();
        assert!(host_out(&mut bridge, &data));
        // one DMA chunk goes out at once, the rest on later polls
        for now in 1001..1010 {
            poll(&mut bridge, now);
        }
        assert_eq!(bridge.1.uart().peripheral().wire, data);
    }

    #[test]
    fn get_line_coding() {
        let mut bridge = bridge(256, 256);
        let (device, serial) = &mut bridge;
        let data = control_in(device, serial, request(0xA1, 0x21, 0, 0, 7)).unwrap();
        assert_eq!(data, LineCoding::default().to_bytes());
    }

    #[test]
    fn invalid_line_coding_stalls() {
        let mut bridge = bridge(256, 256);
        let before = bridge.1.line_coding();
        // mark parity
        assert!(!set_line_coding(&mut bridge, &[0x00, 0xC2, 0x01, 0x00, 0, 3, 8]));
        assert_eq!(bridge.1.line_coding(), before);
        // even parity needs 7 or 8 data bits
        assert!(!set_line_coding(&mut bridge, &[0x00, 0xC2, 0x01, 0x00, 0, 2, 6]));
        assert!(set_line_coding(&mut bridge, &[0x80, 0x25, 0, 0, 0, 2, 7]));
        assert_eq!(bridge.1.line_coding().parity, Parity::Even);
    }

    #[test]
    fn line_coding_for_other_interface_stalls() {
        let mut bridge = bridge(256, 256);
        let (device, serial) = &mut bridge;
        let setup = request(0x21, 0x20, 0, 1, 7);
        assert!(!control_out(device, serial, setup, &[0x00, 0xC2, 0x01, 0x00, 0, 0, 8]));
    }

    #[test]
    fn control_line_state() {
        let mut bridge = bridge(256, 256);
        let (device, serial) = &mut bridge;
        assert!(control_out(device, serial, request(0x21, 0x22, 0, 0, 0), &[]));
        assert!(!serial.uart().dtr());
        assert!(serial.uart().peripheral().output(Output::Dtr));
        assert!(control_out(device, serial, request(0x21, 0x22, 3, 0, 0), &[]));
        assert!(serial.uart().dtr());
    }

    #[test]
    fn out_endpoint_pauses_when_ring_fills() {
        let mut bridge = bridge(256, 256);
        bridge.1.uart_mut().peripheral_mut().auto_complete = false;

        // 255 free; the first chunk stays in the ring while in flight
        assert!(host_out(&mut bridge, &[1; 64]));
        assert!(host_out(&mut bridge, &[2; 64]));
        // 127 free: paused from within the completion
        assert!(!host_out(&mut bridge, &[3; 64]));
        poll(&mut bridge, 1001);
        assert!(!host_out(&mut bridge, &[3; 64]));

        // the first chunk completes, freeing 8 bytes at 9600 baud
        bridge.1.uart_mut().peripheral_mut().complete_tx();
        poll(&mut bridge, 1002);
        assert!(host_out(&mut bridge, &[3; 64]));
        // and the ring is short again
        assert!(!host_out(&mut bridge, &[4; 64]));
    }

    #[test]
    fn short_data_is_sent_after_idle() {
        let mut bridge = bridge(256, 256);
        bridge.1.uart_mut().peripheral_mut().receive(b"hello");
        poll(&mut bridge, 1001);
        assert_eq!(host_in(&mut bridge, DATA_IN), Some(b"hello".to_vec()));
    }

    #[test]
    fn trickle_is_coalesced() {
        let mut bridge = bridge(256, 256);
        bridge.1.uart_mut().peripheral_mut().receive(b"a");
        poll(&mut bridge, 1001);
        assert_eq!(host_in(&mut bridge, DATA_IN), Some(b"a".to_vec()));

        bridge.1.uart_mut().peripheral_mut().receive(b"b");
        poll(&mut bridge, 1002);
        bridge.1.uart_mut().peripheral_mut().receive(b"c");
        poll(&mut bridge, 1003);
        assert_eq!(host_in(&mut bridge, DATA_IN), None);
        poll(&mut bridge, 1004);
        assert_eq!(host_in(&mut bridge, DATA_IN), Some(b"bc".to_vec()));

        // enough data goes out without waiting
        bridge.1.uart_mut().peripheral_mut().receive(&[b'x'; 16]);
        poll(&mut bridge, 1004);
        assert_eq!(host_in(&mut bridge, DATA_IN), Some(std::vec![b'x'; 16]));
    }

    #[test]
    fn full_packet_is_terminated() {
        let mut bridge = bridge(256, 256);
        bridge.1.uart_mut().peripheral_mut().receive(&[7; 64]);
        poll(&mut bridge, 1001);
        assert_eq!(host_in(&mut bridge, DATA_IN), Some(std::vec![7; 64]));
        assert_eq!(host_in(&mut bridge, DATA_IN), Some(Vec::new()));
        assert_eq!(host_in(&mut bridge, DATA_IN), None);
    }

    #[test]
    fn both_slots_are_filled() {
        let mut bridge = bridge(256, 256);
        let data: Vec<u8> = (0..150).collect();
        bridge.1.uart_mut().peripheral_mut().receive(&data);
        poll(&mut bridge, 1001);
        assert_eq!(host_in(&mut bridge, DATA_IN), Some(data[..64].to_vec()));
        assert_eq!(host_in(&mut bridge, DATA_IN), Some(data[64..128].to_vec()));
        assert_eq!(host_in(&mut bridge, DATA_IN), None);
        poll(&mut bridge, 1002);
        assert_eq!(host_in(&mut bridge, DATA_IN), Some(data[128..].to_vec()));
    }

    #[test]
    fn overrun_is_notified() {
        let mut bridge = bridge(256, 256);
        assert!(host_in(&mut bridge, COMM_IN).is_some());

        bridge.1.uart_mut().peripheral_mut().receive(&[0; 200]);
        poll(&mut bridge, 1001);
        // 72 bytes wait for a free IN slot; lap them
        bridge.1.uart_mut().peripheral_mut().receive(&[0; 240]);
        poll(&mut bridge, 1002);
        assert_eq!(
            host_in(&mut bridge, COMM_IN),
            Some(std::vec![0xA1, 0x20, 0, 0, 0, 0, 2, 0, 0x40, 0])
        );
        // delivered once
        poll(&mut bridge, 1003);
        assert_eq!(host_in(&mut bridge, COMM_IN), None);
    }

    #[test]
    fn busy_notification_is_retried() {
        let mut bridge = bridge(256, 256);
        // the initial notification still occupies the endpoint
        bridge.1.uart_mut().peripheral_mut().dcd_level = false;
        poll(&mut bridge, 1001);
        assert_eq!(bridge.1.serial_state(), SerialState::DCD);

        assert_eq!(host_in(&mut bridge, COMM_IN).unwrap()[8], 0);
        // the completion sends the state that could not be sent
        assert_eq!(host_in(&mut bridge, COMM_IN).unwrap()[8], 1);
        poll(&mut bridge, 1002);
        assert_eq!(host_in(&mut bridge, COMM_IN), None);
    }

    #[test]
    fn reset_disconnects() {
        let mut bridge = bridge(256, 256);
        let (device, serial) = &mut bridge;
        device.engine_mut().hardware_mut().host_reset();
        device.poll(serial);
        assert!(!serial.is_connected());
        assert!(!serial.uart().dtr());

        serial.uart_mut().peripheral_mut().receive(b"lost");
        serial.poll(device.engine_mut(), 1001);
        assert_eq!(device.engine_mut().hardware_mut().host_in(DATA_IN), None);
    }
}
