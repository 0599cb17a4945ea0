//! FSDEV register block
//!
//! The module implements a RAL-compatible interface for the USB device
//! registers. The endpoint registers form an array, which the register macros
//! can't index; [`Epr`] names one of them.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::ral::RWRegister;

#[repr(C)]
pub struct RegisterBlock {
    pub EPR: [RWRegister<u32>; 8],
    _reserved: [u32; 8],
    pub CNTR: RWRegister<u32>,
    pub ISTR: RWRegister<u32>,
    pub FNR: RWRegister<u32>,
    pub DADDR: RWRegister<u32>,
    pub BTABLE: RWRegister<u32>,
    pub LPMCSR: RWRegister<u32>,
    pub BCDR: RWRegister<u32>,
}

/// One endpoint register
pub struct Epr<'a> {
    pub EPR: &'a RWRegister<u32>,
}

impl RegisterBlock {
    pub fn endpoint(&self, number: u8) -> Epr<'_> {
        Epr {
            EPR: &self.EPR[number as usize],
        }
    }
}

/// Endpoint register
///
/// `STAT_*` and `DTOG_*` toggle when written with 1. `CTR_*` clear when
/// written with 0.
pub mod EPR {
    fields!(u32;
        EA: 0, 4;
        STAT_TX: 4, 2, [DISABLED = 0, STALL = 1, NAK = 2, VALID = 3];
        DTOG_TX: 6, 1;
        CTR_TX: 7, 1;
        EP_KIND: 8, 1;
        EP_TYPE: 9, 2, [BULK = 0, CONTROL = 1, ISO = 2, INTERRUPT = 3];
        SETUP: 11, 1;
        STAT_RX: 12, 2, [DISABLED = 0, STALL = 1, NAK = 2, VALID = 3];
        DTOG_RX: 14, 1;
        CTR_RX: 15, 1;
    );
}

pub mod CNTR {
    fields!(u32;
        FRES: 0, 1;
        PDWN: 1, 1;
        LP_MODE: 2, 1;
        FSUSP: 3, 1;
        RESUME: 4, 1;
        ESOFM: 8, 1;
        SOFM: 9, 1;
        RESETM: 10, 1;
        SUSPM: 11, 1;
        WKUPM: 12, 1;
        ERRM: 13, 1;
        PMAOVRM: 14, 1;
        CTRM: 15, 1;
    );
}

/// Interrupt status
///
/// Flags clear when written with 0.
pub mod ISTR {
    fields!(u32;
        EP_ID: 0, 4;
        DIR: 4, 1;
        ESOF: 8, 1;
        SOF: 9, 1;
        RESET: 10, 1;
        SUSP: 11, 1;
        WKUP: 12, 1;
        ERR: 13, 1;
        PMAOVR: 14, 1;
        CTR: 15, 1;
    );
}

pub mod FNR {
    fields!(u32;
        FN: 0, 11;
    );
}

pub mod DADDR {
    fields!(u32;
        ADD: 0, 7;
        EF: 7, 1;
    );
}

pub mod BTABLE {
    fields!(u32;
        BTABLE: 3, 13;
    );
}

pub mod BCDR {
    fields!(u32;
        DPPU: 15, 1;
    );
}

const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x5C) as usize];

#[cfg(test)]
mod test {
    use super::{EPR, ISTR};

    #[test]
    fn endpoint_register_layout() {
        assert_eq!(EPR::STAT_TX::mask, 0x0030);
        assert_eq!(EPR::STAT_RX::mask, 0x3000);
        assert_eq!(EPR::EP_TYPE::mask, 0x0600);
        assert_eq!(EPR::CTR_RX::mask | EPR::CTR_TX::mask, 0x8080);
        assert_eq!(EPR::DTOG_RX::mask | EPR::DTOG_TX::mask, 0x4040);
    }

    #[test]
    fn interrupt_status_layout() {
        assert_eq!(ISTR::CTR::mask, 0x8000);
        assert_eq!(ISTR::RESET::mask, 0x0400);
        assert_eq!(ISTR::EP_ID::mask, 0x000F);
    }
}
