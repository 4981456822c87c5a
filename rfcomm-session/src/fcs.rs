//! Frame Check Sequence (FCS) calculation per GSM 07.10 Annex B

use rfcomm_core::{RfcommError, RfcommResult};

/// FCS calculation constants
const INITIAL_FCS: u8 = 0xFF;
const GOOD_FCS: u8 = 0xCF;
const KEY: u8 = 0xE0; // Bit-reversed x^8 + x^2 + x + 1

/// Precomputed FCS table
static FCS_TABLE: once_cell::sync::Lazy<[u8; 256]> = once_cell::sync::Lazy::new(|| {
    let mut table = [0u8; 256];
    for b in 0..=0xFFu8 {
        let mut v = b;
        for _ in 0..8 {
            if (v & 1) == 1 {
                v = (v >> 1) ^ KEY;
            } else {
                v >>= 1;
            }
        }
        table[b as usize] = v;
    }
    table
});

/// Frame Check Sequence calculator
///
/// The FCS covers the address, control, and length octets of SABM, DISC, UA,
/// and DM frames, but only the address and control octets of UIH frames. The
/// transmitted octet is the ones' complement of the rolling value; a receiver
/// that folds the received FCS into its own rolling value must land on
/// [`GOOD_FCS`].
pub struct FcsCalc {
    fcs_value: u8,
}

impl FcsCalc {
    /// Create a new FCS calculator
    pub fn new() -> Self {
        Self { fcs_value: INITIAL_FCS }
    }

    /// Reset the FCS value to initial state
    pub fn reset(&mut self) {
        self.fcs_value = INITIAL_FCS;
    }

    /// Update the FCS value with a single byte
    pub fn update(&mut self, data: u8) {
        self.fcs_value = FCS_TABLE[(self.fcs_value ^ data) as usize];
    }

    /// Update the FCS value with multiple bytes
    pub fn update_bytes(&mut self, data: &[u8]) {
        for &byte in data {
            self.update(byte);
        }
    }

    /// The octet to transmit for the bytes folded in so far
    pub fn fcs_value_byte(&self) -> u8 {
        0xFF - self.fcs_value
    }

    /// Validate after folding in the received FCS octet
    pub fn validate(&self) -> RfcommResult<()> {
        if self.fcs_value != GOOD_FCS {
            Err(RfcommError::FcsError(self.fcs_value))
        } else {
            Ok(())
        }
    }

    /// Get the current rolling FCS value
    pub fn value(&self) -> u8 {
        self.fcs_value
    }
}

impl Default for FcsCalc {
    fn default() -> Self {
        Self::new()
    }
}
