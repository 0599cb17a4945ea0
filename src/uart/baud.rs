//! Baud rate generator divisor
//!
//! The USART divides its kernel clock by `USARTDIV`. With 16x oversampling
//! the BRR register holds `USARTDIV` directly. With 8x oversampling the lowest
//! nibble is shifted right by one. BRR must be at least 16 in both modes.

/// Smallest BRR value the peripheral accepts
const BRR_MIN: u32 = 16;
/// Largest BRR value the peripheral accepts
const BRR_MAX: u32 = 0xFFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Oversampling {
    By16,
    By8,
}

/// Value for the baud rate register, together with its oversampling mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Divisor {
    pub brr: u16,
    pub oversampling: Oversampling,
}

impl Divisor {
    /// The baud rate this divisor produces from `clock_hz`
    pub fn actual_baud(&self, clock_hz: u32) -> u32 {
        let brr = u32::from(self.brr);
        match self.oversampling {
            Oversampling::By16 => rounded_div(clock_hz, brr),
            Oversampling::By8 => {
                let usartdiv = (brr & 0xFFF0) | ((brr & 0x7) << 1);
                rounded_div(clock_hz.saturating_mul(2), usartdiv)
            }
        }
    }
}

fn rounded_div(num: u32, den: u32) -> u32 {
    ((u64::from(num) + u64::from(den) / 2) / u64::from(den)) as u32
}

/// Compute the divisor closest to `baud_rate`
///
/// Uses 16x oversampling when the divisor is fine enough, and falls back to 8x
/// oversampling for high baud rates. Results are clamped to the register range.
///
/// # Panics
///
/// Panics if `baud_rate` is zero.
pub fn divisor(clock_hz: u32, baud_rate: u32) -> Divisor {
    assert!(baud_rate != 0, "baud rate must not be zero");
    let div16 = rounded_div(clock_hz, baud_rate);
    if div16 >= BRR_MIN {
        return Divisor {
            brr: div16.min(BRR_MAX) as u16,
            oversampling: Oversampling::By16,
        };
    }

    let div8 = rounded_div(clock_hz.saturating_mul(2), baud_rate).clamp(BRR_MIN, BRR_MAX);
    Divisor {
        brr: ((div8 & 0xFFF0) | ((div8 & 0xF) >> 1)) as u16,
        oversampling: Oversampling::By8,
    }
}

#[cfg(test)]
mod test {
    use super::{divisor, Divisor, Oversampling};

    #[test]
    fn oversample_by_16() {
        let div = divisor(48_000_000, 115_200);
        assert_eq!(
            div,
            Divisor {
                brr: 417,
                oversampling: Oversampling::By16
            }
        );
        assert_eq!(div.actual_baud(48_000_000), 115_108);
    }

    #[test]
    fn oversample_by_8_when_coarse() {
        // 48 MHz / 4 Mbaud = 12, too small for 16x
        let div = divisor(48_000_000, 4_000_000);
        assert_eq!(div.oversampling, Oversampling::By8);
        // USARTDIV = 24 = 0x18 -> BRR = 0x10 | (0x8 >> 1)
        assert_eq!(div.brr, 0x14);
        assert_eq!(div.actual_baud(48_000_000), 4_000_000);
    }

    #[test]
    fn clamp_low_baud() {
        let div = divisor(48_000_000, 300);
        assert_eq!(div.brr, 0xFFFF);
        assert_eq!(div.oversampling, Oversampling::By16);
    }

    #[test]
    fn clamp_high_baud() {
        let div = divisor(48_000_000, 12_000_000);
        assert_eq!(div.oversampling, Oversampling::By8);
        assert_eq!(div.brr, 0x10);
    }
}
