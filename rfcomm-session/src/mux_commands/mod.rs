//! Multiplexer control commands carried in UIH frames on DLCI 0
//!
//! Every command shares an envelope: a type octet
//! (`[EA=1][C/R][type(6 bits)]`), a length field using the same E/A
//! continuation scheme as frame lengths, and a type-specific payload.
//! See GSM 07.10 5.4.6.

mod dlc_parameter_negotiation;
mod modem_status;
mod non_supported;
mod remote_line_status;
mod remote_port_negotiation;
mod test_command;

pub use dlc_parameter_negotiation::{
    default_priority, CreditBasedFlowHandshake, ParameterNegotiationParams, MAX_INITIAL_CREDITS,
};
pub use modem_status::{ModemStatusParams, ModemStatusSignals};
pub use non_supported::NonSupportedCommandParams;
pub use remote_line_status::{LineError, RemoteLineStatusParams};
pub use remote_port_negotiation::{PortValues, RemotePortNegotiationParams};
pub use test_command::TestCommandParams;

use rfcomm_core::{CommandResponse, Dlci, RfcommError, RfcommResult};

/// The 6-bit multiplexer command type values from GSM 07.10 Table 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuxCommandType {
    DlcParameterNegotiation,
    TestCommand,
    FlowControlOn,
    FlowControlOff,
    ModemStatus,
    NonSupportedCommandResponse,
    RemotePortNegotiation,
    RemoteLineStatus,
}

impl MuxCommandType {
    /// Map the 6-bit type field to a command type.
    pub fn from_type_bits(bits: u8) -> Option<Self> {
        match bits {
            0b100000 => Some(MuxCommandType::DlcParameterNegotiation),
            0b001000 => Some(MuxCommandType::TestCommand),
            0b101000 => Some(MuxCommandType::FlowControlOn),
            0b011000 => Some(MuxCommandType::FlowControlOff),
            0b111000 => Some(MuxCommandType::ModemStatus),
            0b000100 => Some(MuxCommandType::NonSupportedCommandResponse),
            0b100100 => Some(MuxCommandType::RemotePortNegotiation),
            0b010100 => Some(MuxCommandType::RemoteLineStatus),
            _ => None,
        }
    }

    /// The 6-bit type field for this command type.
    pub fn to_type_bits(&self) -> u8 {
        match self {
            MuxCommandType::DlcParameterNegotiation => 0b100000,
            MuxCommandType::TestCommand => 0b001000,
            MuxCommandType::FlowControlOn => 0b101000,
            MuxCommandType::FlowControlOff => 0b011000,
            MuxCommandType::ModemStatus => 0b111000,
            MuxCommandType::NonSupportedCommandResponse => 0b000100,
            MuxCommandType::RemotePortNegotiation => 0b100100,
            MuxCommandType::RemoteLineStatus => 0b010100,
        }
    }
}

/// The type-specific payload of a multiplexer command.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxCommandParams {
    ParameterNegotiation(ParameterNegotiationParams),
    Test(TestCommandParams),
    FlowControlOn,
    FlowControlOff,
    ModemStatus(ModemStatusParams),
    NonSupported(NonSupportedCommandParams),
    RemotePortNegotiation(RemotePortNegotiationParams),
    RemoteLineStatus(RemoteLineStatusParams),
}

impl MuxCommandParams {
    pub fn command_type(&self) -> MuxCommandType {
        match self {
            MuxCommandParams::ParameterNegotiation(_) => MuxCommandType::DlcParameterNegotiation,
            MuxCommandParams::Test(_) => MuxCommandType::TestCommand,
            MuxCommandParams::FlowControlOn => MuxCommandType::FlowControlOn,
            MuxCommandParams::FlowControlOff => MuxCommandType::FlowControlOff,
            MuxCommandParams::ModemStatus(_) => MuxCommandType::ModemStatus,
            MuxCommandParams::NonSupported(_) => MuxCommandType::NonSupportedCommandResponse,
            MuxCommandParams::RemotePortNegotiation(_) => MuxCommandType::RemotePortNegotiation,
            MuxCommandParams::RemoteLineStatus(_) => MuxCommandType::RemoteLineStatus,
        }
    }

    /// The DLCI a command addresses, for commands that carry one. Used to key
    /// outstanding-command correlation, since GSM allows simultaneous
    /// commands of the same type addressing different DLCIs.
    pub fn dlci(&self) -> Option<Dlci> {
        match self {
            MuxCommandParams::ParameterNegotiation(p) => Some(p.dlci),
            MuxCommandParams::ModemStatus(p) => Some(p.dlci),
            MuxCommandParams::RemotePortNegotiation(p) => Some(p.dlci),
            MuxCommandParams::RemoteLineStatus(p) => Some(p.dlci),
            _ => None,
        }
    }

    fn decode(command_type: MuxCommandType, payload: &[u8]) -> RfcommResult<Self> {
        let params = match command_type {
            MuxCommandType::DlcParameterNegotiation => {
                MuxCommandParams::ParameterNegotiation(ParameterNegotiationParams::decode(payload)?)
            }
            MuxCommandType::TestCommand => {
                MuxCommandParams::Test(TestCommandParams::decode(payload)?)
            }
            MuxCommandType::FlowControlOn => {
                expect_empty(payload, "FCon")?;
                MuxCommandParams::FlowControlOn
            }
            MuxCommandType::FlowControlOff => {
                expect_empty(payload, "FCoff")?;
                MuxCommandParams::FlowControlOff
            }
            MuxCommandType::ModemStatus => {
                MuxCommandParams::ModemStatus(ModemStatusParams::decode(payload)?)
            }
            MuxCommandType::NonSupportedCommandResponse => {
                MuxCommandParams::NonSupported(NonSupportedCommandParams::decode(payload)?)
            }
            MuxCommandType::RemotePortNegotiation => MuxCommandParams::RemotePortNegotiation(
                RemotePortNegotiationParams::decode(payload)?,
            ),
            MuxCommandType::RemoteLineStatus => {
                MuxCommandParams::RemoteLineStatus(RemoteLineStatusParams::decode(payload)?)
            }
        };
        Ok(params)
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            MuxCommandParams::ParameterNegotiation(p) => p.encode().to_vec(),
            MuxCommandParams::Test(p) => p.encode(),
            MuxCommandParams::FlowControlOn | MuxCommandParams::FlowControlOff => Vec::new(),
            MuxCommandParams::ModemStatus(p) => p.encode(),
            MuxCommandParams::NonSupported(p) => p.encode().to_vec(),
            MuxCommandParams::RemotePortNegotiation(p) => p.encode(),
            MuxCommandParams::RemoteLineStatus(p) => p.encode().to_vec(),
        }
    }
}

fn expect_empty(payload: &[u8], name: &str) -> RfcommResult<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(RfcommError::FrameInvalid(format!(
            "{} command carries an unexpected {}-byte payload",
            name,
            payload.len()
        )))
    }
}

/// A decoded multiplexer command with its C/R classification.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxCommand {
    pub params: MuxCommandParams,
    pub command_response: CommandResponse,
}

impl MuxCommand {
    pub fn command_type(&self) -> MuxCommandType {
        self.params.command_type()
    }

    pub fn dlci(&self) -> Option<Dlci> {
        self.params.dlci()
    }

    /// Decode a command from a UIH/DLCI-0 information field.
    ///
    /// An unrecognized type octet surfaces as
    /// [`RfcommError::NotSupportedMuxCommand`] carrying the offending octet so
    /// the session can answer with an NSC response.
    pub fn decode(buf: &[u8]) -> RfcommResult<Self> {
        if buf.len() < 2 {
            return Err(RfcommError::FrameInvalid(format!(
                "Mux command too short: {} bytes",
                buf.len()
            )));
        }

        let type_octet = buf[0];
        if type_octet & 0x01 == 0 {
            return Err(RfcommError::FrameInvalid(
                "Multi-octet mux command types are not supported".to_string(),
            ));
        }
        let command_response = if (type_octet >> 1) & 0x01 == 1 {
            CommandResponse::Command
        } else {
            CommandResponse::Response
        };
        let command_type = MuxCommandType::from_type_bits(type_octet >> 2)
            .ok_or(RfcommError::NotSupportedMuxCommand(type_octet))?;

        // Length field, E/A terminated (1 or 2 octets).
        let (length, header_len) = if buf[1] & 0x01 == 1 {
            (usize::from(buf[1] >> 1), 2)
        } else {
            if buf.len() < 3 {
                return Err(RfcommError::FrameInvalid(
                    "Mux command truncated in two-octet length".to_string(),
                ));
            }
            if buf[2] & 0x01 != 1 {
                return Err(RfcommError::FrameInvalid(
                    "Mux command length extends past two octets".to_string(),
                ));
            }
            (usize::from(buf[1] >> 1) | (usize::from(buf[2] >> 1) << 7), 3)
        };

        if buf.len() != header_len + length {
            return Err(RfcommError::FrameInvalid(format!(
                "Mux command length mismatch: declared {}, available {}",
                length,
                buf.len() - header_len
            )));
        }

        let params = MuxCommandParams::decode(command_type, &buf[header_len..])?;
        Ok(MuxCommand { params, command_response })
    }

    /// Encode into a UIH/DLCI-0 information field.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.params.encode_payload();
        let cr_bit = match self.command_response {
            CommandResponse::Command => 1u8,
            CommandResponse::Response => 0u8,
        };
        let type_octet = (self.command_type().to_type_bits() << 2) | (cr_bit << 1) | 0x01;

        let mut buf = Vec::with_capacity(3 + payload.len());
        buf.push(type_octet);
        if payload.len() <= 0x7F {
            buf.push(((payload.len() as u8) << 1) | 0x01);
        } else {
            buf.push(((payload.len() & 0x7F) as u8) << 1);
            buf.push((((payload.len() >> 7) as u8) << 1) | 0x01);
        }
        buf.extend_from_slice(&payload);
        buf
    }
}
