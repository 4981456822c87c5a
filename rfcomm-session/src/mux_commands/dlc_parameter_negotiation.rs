//! DLC Parameter Negotiation (PN) command, GSM 07.10 5.4.6.3.1

use rfcomm_core::{Dlci, RfcommError, RfcommResult};

/// Length (in bytes) of a PN command payload.
const PARAMETER_NEGOTIATION_LENGTH: usize = 8;

/// Largest value representable in the 3-bit initial-credit field.
pub const MAX_INITIAL_CREDITS: u8 = 7;

/// The credit-based flow control handshake carried in octet 2 of a PN
/// exchange (RFCOMM 5.5.3). The request value appears only in commands, the
/// response value only in responses; `0x0` declines the mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditBasedFlowHandshake {
    Unsupported,
    SupportedRequest,
    SupportedResponse,
}

impl CreditBasedFlowHandshake {
    fn from_bits(bits: u8) -> RfcommResult<Self> {
        match bits {
            0x0 => Ok(CreditBasedFlowHandshake::Unsupported),
            0xF => Ok(CreditBasedFlowHandshake::SupportedRequest),
            0xE => Ok(CreditBasedFlowHandshake::SupportedResponse),
            b => Err(RfcommError::FrameInvalid(format!(
                "Unrecognized credit-based flow handshake: 0x{:X}",
                b
            ))),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            CreditBasedFlowHandshake::Unsupported => 0x0,
            CreditBasedFlowHandshake::SupportedRequest => 0xF,
            CreditBasedFlowHandshake::SupportedResponse => 0xE,
        }
    }
}

/// Parameters of a PN command or response.
///
/// The unused GSM fields (acknowledgement timer, maximum retransmissions)
/// must be zero in RFCOMM and are not represented.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterNegotiationParams {
    pub dlci: Dlci,
    pub credit_based_flow_handshake: CreditBasedFlowHandshake,
    /// Assigned priority, 0..=63. Informational in this implementation.
    pub priority: u8,
    pub maximum_frame_size: u16,
    /// Credits granted to the peer for this DLC, 0..=7.
    pub initial_credits: u8,
}

impl ParameterNegotiationParams {
    pub fn decode(buf: &[u8]) -> RfcommResult<Self> {
        if buf.len() != PARAMETER_NEGOTIATION_LENGTH {
            return Err(RfcommError::FrameInvalid(format!(
                "PN payload must be {} bytes, got {}",
                PARAMETER_NEGOTIATION_LENGTH,
                buf.len()
            )));
        }

        let dlci = Dlci::try_from(buf[0] & 0x3F)?;
        let handshake = CreditBasedFlowHandshake::from_bits(buf[1] >> 4)?;
        let priority = buf[2] & 0x3F;
        let maximum_frame_size = u16::from_le_bytes([buf[4], buf[5]]);
        let initial_credits = buf[7] & 0x07;

        Ok(Self {
            dlci,
            credit_based_flow_handshake: handshake,
            priority,
            maximum_frame_size,
            initial_credits,
        })
    }

    pub fn encode(&self) -> [u8; PARAMETER_NEGOTIATION_LENGTH] {
        let mfs = self.maximum_frame_size.to_le_bytes();
        [
            u8::from(self.dlci) & 0x3F,
            self.credit_based_flow_handshake.to_bits() << 4,
            self.priority & 0x3F,
            0, // Acknowledgement timer: zero in RFCOMM.
            mfs[0],
            mfs[1],
            0, // Maximum retransmissions: zero in RFCOMM.
            self.initial_credits & 0x07,
        ]
    }
}

/// Default DLC priority from the GSM 07.10 DLCI banding table.
pub fn default_priority(dlci: Dlci) -> u8 {
    match u8::from(dlci) {
        0..=7 => 7,
        8..=15 => 15,
        16..=23 => 23,
        24..=31 => 31,
        32..=39 => 39,
        40..=47 => 47,
        48..=55 => 55,
        _ => 61,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wrong_length() {
        assert!(ParameterNegotiationParams::decode(&[0; 7]).is_err());
        assert!(ParameterNegotiationParams::decode(&[0; 9]).is_err());
    }

    #[test]
    fn test_decode_known_bytes() {
        let buf = [
            0x0A,       // DLCI 10
            0xF0,       // Supported (request), frame type UIH
            0x0F,       // Priority 15
            0x00,       // Ack timer
            0x64, 0x00, // Max frame size 100
            0x00,       // Max retransmissions
            0x07,       // Initial credits 7
        ];
        let params = ParameterNegotiationParams::decode(&buf).unwrap();
        assert_eq!(u8::from(params.dlci), 10);
        assert_eq!(
            params.credit_based_flow_handshake,
            CreditBasedFlowHandshake::SupportedRequest
        );
        assert_eq!(params.priority, 15);
        assert_eq!(params.maximum_frame_size, 100);
        assert_eq!(params.initial_credits, 7);
        assert_eq!(params.encode(), buf);
    }

    #[test]
    fn test_decode_rejects_bad_handshake() {
        let mut buf = [0u8; 8];
        buf[0] = 0x02;
        buf[1] = 0x50; // 0x5 is not a defined handshake value.
        assert!(ParameterNegotiationParams::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_reserved_dlci() {
        let mut buf = [0u8; 8];
        buf[0] = 62;
        assert!(ParameterNegotiationParams::decode(&buf).is_err());
    }

    #[test]
    fn test_round_trip_large_frame_size() {
        let params = ParameterNegotiationParams {
            dlci: Dlci::try_from(61).unwrap(),
            credit_based_flow_handshake: CreditBasedFlowHandshake::SupportedResponse,
            priority: 61,
            maximum_frame_size: 0xFFFF,
            initial_credits: 3,
        };
        let decoded = ParameterNegotiationParams::decode(&params.encode()).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_default_priority_banding() {
        assert_eq!(default_priority(Dlci::MUX_CONTROL), 7);
        assert_eq!(default_priority(Dlci::try_from(2).unwrap()), 7);
        assert_eq!(default_priority(Dlci::try_from(8).unwrap()), 15);
        assert_eq!(default_priority(Dlci::try_from(23).unwrap()), 23);
        assert_eq!(default_priority(Dlci::try_from(40).unwrap()), 47);
        assert_eq!(default_priority(Dlci::try_from(61).unwrap()), 61);
    }
}
