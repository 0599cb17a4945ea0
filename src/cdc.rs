//! CDC-ACM (PSTN subclass) requests and notifications

use crate::line_coding::{LineCoding, LINE_CODING_LEN};
use crate::serial::UsbSerial;
use crate::uart::UartPeripheral;
use crate::usb::{DataStage, RequestResult, SetupPacket};

/// Communication class interface
pub const COMM_INTERFACE: u8 = 0;
/// Data class interface
pub const DATA_INTERFACE: u8 = 1;

pub const SET_LINE_CODING: u8 = 0x20;
pub const GET_LINE_CODING: u8 = 0x21;
pub const SET_CONTROL_LINE_STATE: u8 = 0x22;

/// SERIAL_STATE notification code
pub const SERIAL_STATE: u8 = 0x20;
/// Length of a SERIAL_STATE notification, including its 2-byte payload
pub const NOTIFICATION_LEN: usize = 10;

bitflags::bitflags! {
    /// UART state bitmap of a SERIAL_STATE notification
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SerialState: u16 {
        /// Carrier detect (DCD)
        const DCD = 1 << 0;
        /// Data set ready (DSR)
        const DSR = 1 << 1;
        const BREAK = 1 << 2;
        const RING = 1 << 3;
        const FRAMING = 1 << 4;
        const PARITY = 1 << 5;
        const OVERRUN = 1 << 6;
    }
}

impl SerialState {
    /// Bits that describe a level, not an event
    pub const LEVELS: SerialState = SerialState::DCD.union(SerialState::DSR);
}

/// Build a SERIAL_STATE notification for `interface`
pub fn serial_state_notification(interface: u8, state: SerialState) -> [u8; NOTIFICATION_LEN] {
    let [lo, hi] = state.bits().to_le_bytes();
    [0xA1, SERIAL_STATE, 0, 0, interface, 0, 2, 0, lo, hi]
}

/// Class requests addressed to the communication interface
///
/// Registered as a request filter for class requests to interfaces.
pub fn class_request<P: UartPeripheral>(
    serial: &mut UsbSerial<P>,
    setup: &SetupPacket,
    stage: &mut DataStage<'_, UsbSerial<P>>,
) -> RequestResult {
    match setup.request {
        SET_LINE_CODING => {
            if (setup.length as usize) < LINE_CODING_LEN || setup.index != COMM_INTERFACE as u16 {
                return RequestResult::NotSupported;
            }
            let Some(bytes) = stage
                .data()
                .get(..LINE_CODING_LEN)
                .and_then(|bytes| <&[u8; LINE_CODING_LEN]>::try_from(bytes).ok())
            else {
                return RequestResult::NotSupported;
            };
            match LineCoding::from_bytes(bytes).and_then(|coding| serial.set_line_coding(coding)) {
                Ok(()) => {
                    stage.on_complete(line_coding_applied);
                    RequestResult::Handled
                }
                Err(_error) => {
                    warn!("SET_LINE_CODING rejected: {}", _error);
                    RequestResult::NotSupported
                }
            }
        }
        GET_LINE_CODING => {
            if (setup.length as usize) < LINE_CODING_LEN || setup.index != COMM_INTERFACE as u16 {
                return RequestResult::NotSupported;
            }
            stage.respond(&serial.line_coding().to_bytes());
            RequestResult::Handled
        }
        SET_CONTROL_LINE_STATE => {
            serial.set_control_line_state(setup.value);
            RequestResult::Handled
        }
        _ => RequestResult::Next,
    }
}

fn line_coding_applied<P: UartPeripheral>(_serial: &mut UsbSerial<P>, _: &SetupPacket) {
    debug!("line coding {}", _serial.line_coding());
}

#[cfg(test)]
mod test {
    use super::{serial_state_notification, SerialState};

    #[test]
    fn notification_layout() {
        let state = SerialState::DCD | SerialState::OVERRUN;
        assert_eq!(
            serial_state_notification(0, state),
            [0xA1, 0x20, 0, 0, 0, 0, 2, 0, 0x41, 0]
        );
        assert_eq!(state & SerialState::LEVELS, SerialState::DCD);
    }
}
