//! Non-Supported Command Response (NSC), GSM 07.10 5.4.6.3.8
//!
//! Sent in reply to a multiplexer command whose type is not implemented;
//! echoes the offending type octet so the sender can correlate it.

use rfcomm_core::{RfcommError, RfcommResult};

const NON_SUPPORTED_COMMAND_LENGTH: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonSupportedCommandParams {
    /// The full type octet of the command that was not understood, including
    /// its E/A and C/R bits.
    pub non_supported_command: u8,
}

impl NonSupportedCommandParams {
    pub fn decode(buf: &[u8]) -> RfcommResult<Self> {
        if buf.len() != NON_SUPPORTED_COMMAND_LENGTH {
            return Err(RfcommError::FrameInvalid(format!(
                "NSC payload must be 1 byte, got {}",
                buf.len()
            )));
        }
        Ok(Self { non_supported_command: buf[0] })
    }

    pub fn encode(&self) -> [u8; NON_SUPPORTED_COMMAND_LENGTH] {
        [self.non_supported_command]
    }
}
