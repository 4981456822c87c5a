//! Remote Line Status (RLS) command, GSM 07.10 5.4.6.3.10
//!
//! Reports a line error (overrun, parity, framing) observed on a DLC.

use rfcomm_core::{Dlci, RfcommError, RfcommResult};

const REMOTE_LINE_STATUS_LENGTH: usize = 2;

/// The line error carried in an RLS exchange, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineError {
    Overrun,
    Parity,
    Framing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteLineStatusParams {
    pub dlci: Dlci,
    pub error: Option<LineError>,
}

impl RemoteLineStatusParams {
    pub fn decode(buf: &[u8]) -> RfcommResult<Self> {
        if buf.len() != REMOTE_LINE_STATUS_LENGTH {
            return Err(RfcommError::FrameInvalid(format!(
                "RLS payload must be 2 bytes, got {}",
                buf.len()
            )));
        }

        // Address octet: EA = 1, bit 1 always set, DLCI in bits 2..=7.
        let dlci = Dlci::try_from(buf[0] >> 2)?;

        // Status octet: L1 = 1 indicates an error, L2..=L4 select it.
        let status = buf[1];
        let error = if status & 0x01 == 1 {
            match (status >> 1) & 0x07 {
                0b001 => Some(LineError::Overrun),
                0b010 => Some(LineError::Parity),
                0b100 => Some(LineError::Framing),
                bits => {
                    return Err(RfcommError::FrameInvalid(format!(
                        "Unrecognized RLS error bits: 0b{:03b}",
                        bits
                    )))
                }
            }
        } else {
            None
        };

        Ok(Self { dlci, error })
    }

    pub fn encode(&self) -> [u8; REMOTE_LINE_STATUS_LENGTH] {
        let address = (u8::from(self.dlci) << 2) | 0x02 | 0x01;
        let status = match self.error {
            None => 0x00,
            Some(LineError::Overrun) => (0b001 << 1) | 0x01,
            Some(LineError::Parity) => (0b010 << 1) | 0x01,
            Some(LineError::Framing) => (0b100 << 1) | 0x01,
        };
        [address, status]
    }
}
