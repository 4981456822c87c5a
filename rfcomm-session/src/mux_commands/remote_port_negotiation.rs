//! Remote Port Negotiation (RPN) command, GSM 07.10 5.4.6.3.9
//!
//! Negotiates the emulated serial port settings of a DLC. A one-octet
//! payload queries the current values; an eight-octet payload proposes them.

use rfcomm_core::{Dlci, RfcommError, RfcommResult};

const RPN_REQUEST_LENGTH: usize = 1;
const RPN_FULL_LENGTH: usize = 8;

/// The negotiable serial port values of an eight-octet RPN exchange.
///
/// Octet layouts follow GSM 07.10 Figure 13; the parameter mask marks which
/// fields the sender intends to change (command) or accepted (response).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortValues {
    pub baud_rate: u8,
    /// Packed data bits (B1-B2), stop bits (B3), parity (B4), parity type
    /// (B5-B6).
    pub data_format: u8,
    pub flow_control: u8,
    pub xon_character: u8,
    pub xoff_character: u8,
    pub parameter_mask: u16,
}

impl PortValues {
    /// 9600 baud, 8 data bits, 1 stop bit, no parity, no flow control,
    /// DC1/DC3 characters. The defaults of RFCOMM 5.5.1.
    pub fn default_values() -> Self {
        Self {
            baud_rate: 0x03,
            data_format: 0x03,
            flow_control: 0x00,
            xon_character: 0x11,
            xoff_character: 0x13,
            parameter_mask: 0x3F7F,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemotePortNegotiationParams {
    pub dlci: Dlci,
    /// `None` for the one-octet query form.
    pub port_values: Option<PortValues>,
}

impl RemotePortNegotiationParams {
    pub fn decode(buf: &[u8]) -> RfcommResult<Self> {
        if buf.len() != RPN_REQUEST_LENGTH && buf.len() != RPN_FULL_LENGTH {
            return Err(RfcommError::FrameInvalid(format!(
                "RPN payload must be 1 or 8 bytes, got {}",
                buf.len()
            )));
        }

        // Address octet: EA = 1, bit 1 always set, DLCI in bits 2..=7.
        let dlci = Dlci::try_from(buf[0] >> 2)?;

        let port_values = if buf.len() == RPN_FULL_LENGTH {
            Some(PortValues {
                baud_rate: buf[1],
                data_format: buf[2] & 0x3F,
                flow_control: buf[3] & 0x3F,
                xon_character: buf[4],
                xoff_character: buf[5],
                parameter_mask: u16::from_le_bytes([buf[6], buf[7]]),
            })
        } else {
            None
        };

        Ok(Self { dlci, port_values })
    }

    pub fn encode(&self) -> Vec<u8> {
        let address = (u8::from(self.dlci) << 2) | 0x02 | 0x01;
        match &self.port_values {
            None => vec![address],
            Some(values) => {
                let mask = values.parameter_mask.to_le_bytes();
                vec![
                    address,
                    values.baud_rate,
                    values.data_format & 0x3F,
                    values.flow_control & 0x3F,
                    values.xon_character,
                    values.xoff_character,
                    mask[0],
                    mask[1],
                ]
            }
        }
    }
}
