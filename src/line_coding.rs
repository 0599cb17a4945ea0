//! Serial line coding, as carried by the CDC `SET_LINE_CODING` and
//! `GET_LINE_CODING` requests

/// Size of the line coding structure on the wire
pub const LINE_CODING_LEN: usize = 7;

/// Number of stop bits, in `bCharFormat` encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum StopBits {
    One = 0,
    OnePointFive = 1,
    Two = 2,
}

/// Parity, in `bParityType` encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

/// Why a line coding was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum InvalidCoding {
    /// Baud rate of zero.
    BaudRate,
    /// `bCharFormat` out of range.
    StopBits,
    /// `bParityType` out of range, or mark / space parity.
    Parity,
    /// Data bits not supported with the requested parity.
    DataBits,
}

/// Baud rate and character framing of the serial line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct LineCoding {
    pub baud_rate: u32,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub data_bits: u8,
}

impl Default for LineCoding {
    /// 9600 8N1
    fn default() -> Self {
        LineCoding {
            baud_rate: 9600,
            stop_bits: StopBits::One,
            parity: Parity::None,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    /// Decode the 7-byte wire structure
    ///
    /// Only the encoding is checked here. Use [`validate`](Self::validate) to check
    /// that the peripheral supports the combination.
    pub fn from_bytes(bytes: &[u8; LINE_CODING_LEN]) -> Result<Self, InvalidCoding> {
        let stop_bits = match bytes[4] {
            0 => StopBits::One,
            1 => StopBits::OnePointFive,
            2 => StopBits::Two,
            _ => return Err(InvalidCoding::StopBits),
        };
        let parity = match bytes[5] {
            0 => Parity::None,
            1 => Parity::Odd,
            2 => Parity::Even,
            3 => Parity::Mark,
            4 => Parity::Space,
            _ => return Err(InvalidCoding::Parity),
        };
        Ok(LineCoding {
            baud_rate: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            stop_bits,
            parity,
            data_bits: bytes[6],
        })
    }

    pub fn to_bytes(&self) -> [u8; LINE_CODING_LEN] {
        let rate = self.baud_rate.to_le_bytes();
        [
            rate[0],
            rate[1],
            rate[2],
            rate[3],
            self.stop_bits as u8,
            self.parity as u8,
            self.data_bits,
        ]
    }

    /// Check the combination against what the UART can frame
    ///
    /// Without parity, only 8 data bits are supported. With odd or even parity,
    /// 7 or 8 data bits are supported. Mark and space parity are not supported.
    pub fn validate(&self) -> Result<(), InvalidCoding> {
        if self.baud_rate == 0 {
            return Err(InvalidCoding::BaudRate);
        }
        match (self.parity, self.data_bits) {
            (Parity::Mark | Parity::Space, _) => Err(InvalidCoding::Parity),
            (Parity::None, 8) => Ok(()),
            (Parity::Odd | Parity::Even, 7 | 8) => Ok(()),
            _ => Err(InvalidCoding::DataBits),
        }
    }

    /// Frame length on the wire, parity bit included
    pub fn word_bits(&self) -> u8 {
        self.data_bits + u8::from(self.parity != Parity::None)
    }

    /// Characters only carry 7 significant bits
    pub fn is_seven_bit(&self) -> bool {
        self.data_bits == 7
    }
}
