//! RFCOMM frame structure and encoding/decoding per GSM 07.10 5.2
//!
//! A frame is: an address octet (`[EA=1][C/R][DLCI(6)]`), a control octet
//! (type bits plus the P/F bit), one or two length octets, an optional credit
//! octet (UIH under credit-based flow with P/F set), the information field,
//! and a trailing FCS octet.

use rfcomm_core::{CommandResponse, Dlci, RfcommError, RfcommResult, Role};

use crate::fcs::FcsCalc;
use crate::mux_commands::MuxCommand;

/// The P/F bit position within the control octet.
const PF_BIT: u8 = 0x10;

/// Minimum frame size: address + control + length + FCS.
const MIN_FRAME_LENGTH: usize = 4;

/// Largest information field length representable (15-bit length field).
pub const MAX_INFORMATION_LENGTH: usize = 0x7FFF;

/// RFCOMM frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    SetAsynchronousBalancedMode,
    Disconnect,
    UnnumberedAcknowledgement,
    DisconnectedMode,
    UnnumberedInfoHeaderCheck,
}

impl FrameType {
    /// Get frame type from control byte (the P/F bit is ignored)
    pub fn from_control_byte(control_byte: u8) -> RfcommResult<Self> {
        match control_byte & !PF_BIT {
            0x2F => Ok(FrameType::SetAsynchronousBalancedMode),
            0x43 => Ok(FrameType::Disconnect),
            0x63 => Ok(FrameType::UnnumberedAcknowledgement),
            0x0F => Ok(FrameType::DisconnectedMode),
            0xEF => Ok(FrameType::UnnumberedInfoHeaderCheck),
            other => Err(RfcommError::FrameInvalid(format!(
                "Control field unknown: 0x{:02X}",
                other
            ))),
        }
    }

    /// Get control byte value for this frame type
    pub fn to_control_byte(&self, poll_final: bool) -> u8 {
        let bits = match self {
            FrameType::SetAsynchronousBalancedMode => 0x2F,
            FrameType::Disconnect => 0x43,
            FrameType::UnnumberedAcknowledgement => 0x63,
            FrameType::DisconnectedMode => 0x0F,
            FrameType::UnnumberedInfoHeaderCheck => 0xEF,
        };
        if poll_final {
            bits | PF_BIT
        } else {
            bits
        }
    }

    /// Only the startup handshake frames may appear before the multiplexer
    /// has started, and only on the control channel.
    pub fn is_valid_before_mux_startup(&self) -> bool {
        matches!(
            self,
            FrameType::SetAsynchronousBalancedMode
                | FrameType::UnnumberedAcknowledgement
                | FrameType::DisconnectedMode
        )
    }

    fn is_uih(&self) -> bool {
        matches!(self, FrameType::UnnumberedInfoHeaderCheck)
    }
}

/// Classify a frame as Command or Response from the sender's role and the
/// C/R bit, per GSM 07.10 Table 1 with the pre-startup special case.
fn classify_command_response(
    sender_role: Role,
    frame_type: FrameType,
    cr_bit: bool,
) -> RfcommResult<CommandResponse> {
    if sender_role.is_multiplexer_started() {
        let res = match (frame_type, sender_role, cr_bit) {
            // UIH classification is fixed by the sender's role (GSM 5.4.3.1).
            (FrameType::UnnumberedInfoHeaderCheck, Role::Initiator, _) => CommandResponse::Command,
            (FrameType::UnnumberedInfoHeaderCheck, Role::Responder, _) => CommandResponse::Response,
            (_, Role::Initiator, true) | (_, Role::Responder, false) => CommandResponse::Command,
            _ => CommandResponse::Response,
        };
        return Ok(res);
    }

    // Before startup only the handshake frames exist, and the C/R bit is
    // read directly: SABM C/R = 1 is a command, UA/DM C/R = 1 a response.
    match (frame_type, cr_bit) {
        (FrameType::SetAsynchronousBalancedMode, true) => Ok(CommandResponse::Command),
        (FrameType::SetAsynchronousBalancedMode, false) => Ok(CommandResponse::Response),
        (FrameType::DisconnectedMode | FrameType::UnnumberedAcknowledgement, true) => {
            Ok(CommandResponse::Response)
        }
        (FrameType::DisconnectedMode | FrameType::UnnumberedAcknowledgement, false) => {
            Ok(CommandResponse::Command)
        }
        (frame_type, _) => Err(RfcommError::FrameInvalid(format!(
            "{:?} is not valid before multiplexer startup",
            frame_type
        ))),
    }
}

/// The information carried by a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameContent {
    /// SABM, DISC, UA, and DM carry no information field.
    None,
    /// UIH on a user DLCI: application data.
    UserData(Vec<u8>),
    /// UIH on the control channel: a multiplexer command.
    Mux(MuxCommand),
}

impl FrameContent {
    fn information_length(&self) -> usize {
        match self {
            FrameContent::None => 0,
            FrameContent::UserData(data) => data.len(),
            FrameContent::Mux(command) => command.encode().len(),
        }
    }
}

/// An RFCOMM frame.
///
/// `role` is the multiplexer role of the device that sent (or will send) the
/// frame; decoding a peer's frame therefore passes the opposite of the local
/// role. Frames are ephemeral value objects built for a single send or
/// produced by a single parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub role: Role,
    pub frame_type: FrameType,
    pub dlci: Dlci,
    pub poll_final: bool,
    pub command_response: CommandResponse,
    /// Credits granted to the recipient. Present iff credit-based flow is on,
    /// the frame is UIH, and P/F is set.
    pub credits: Option<u8>,
    pub content: FrameContent,
}

impl Frame {
    pub fn sabm(role: Role, dlci: Dlci) -> Self {
        Self {
            role,
            frame_type: FrameType::SetAsynchronousBalancedMode,
            dlci,
            poll_final: true,
            command_response: CommandResponse::Command,
            credits: None,
            content: FrameContent::None,
        }
    }

    pub fn disc(role: Role, dlci: Dlci) -> Self {
        Self {
            role,
            frame_type: FrameType::Disconnect,
            dlci,
            poll_final: true,
            command_response: CommandResponse::Command,
            credits: None,
            content: FrameContent::None,
        }
    }

    pub fn ua(role: Role, dlci: Dlci) -> Self {
        Self {
            role,
            frame_type: FrameType::UnnumberedAcknowledgement,
            dlci,
            poll_final: true,
            command_response: CommandResponse::Response,
            credits: None,
            content: FrameContent::None,
        }
    }

    pub fn dm(role: Role, dlci: Dlci) -> Self {
        Self {
            role,
            frame_type: FrameType::DisconnectedMode,
            dlci,
            poll_final: true,
            command_response: CommandResponse::Response,
            credits: None,
            content: FrameContent::None,
        }
    }

    /// A UIH frame carrying application data. The C/R classification of UIH
    /// is fixed by the sender's role.
    pub fn user_data(role: Role, dlci: Dlci, data: Vec<u8>) -> Self {
        let command_response = match role {
            Role::Responder => CommandResponse::Response,
            _ => CommandResponse::Command,
        };
        Self {
            role,
            frame_type: FrameType::UnnumberedInfoHeaderCheck,
            dlci,
            poll_final: false,
            command_response,
            credits: None,
            content: FrameContent::UserData(data),
        }
    }

    /// A UIH frame on the control channel carrying a multiplexer command.
    pub fn mux_command(role: Role, command: MuxCommand) -> Self {
        let command_response = match role {
            Role::Responder => CommandResponse::Response,
            _ => CommandResponse::Command,
        };
        Self {
            role,
            frame_type: FrameType::UnnumberedInfoHeaderCheck,
            dlci: Dlci::MUX_CONTROL,
            poll_final: false,
            command_response,
            credits: None,
            content: FrameContent::Mux(command),
        }
    }

    /// Attach a credit grant to a UIH frame. Zero credits clears both the
    /// credit octet and the P/F bit; a nonzero grant sets P/F.
    pub fn set_credits(&mut self, credits: u8) {
        if credits == 0 {
            self.credits = None;
            self.poll_final = false;
        } else {
            self.credits = Some(credits);
            self.poll_final = true;
        }
    }

    /// Length of the information field this frame would carry on the wire.
    pub fn information_length(&self) -> usize {
        self.content.information_length()
    }

    fn cr_bit(&self) -> bool {
        if !self.role.is_multiplexer_started() {
            // Pre-startup frames carry C/R = 1 in both directions.
            return true;
        }
        match self.frame_type {
            FrameType::UnnumberedInfoHeaderCheck => self.role == Role::Initiator,
            _ => matches!(
                (self.role, self.command_response),
                (Role::Initiator, CommandResponse::Command)
                    | (Role::Responder, CommandResponse::Response)
            ),
        }
    }

    /// Encode the frame for transmission.
    pub fn encode(&self, credit_based_flow: bool) -> RfcommResult<Vec<u8>> {
        let information = match &self.content {
            FrameContent::None => Vec::new(),
            FrameContent::UserData(data) => data.clone(),
            FrameContent::Mux(command) => command.encode(),
        };
        if information.len() > MAX_INFORMATION_LENGTH {
            return Err(RfcommError::FrameInvalid(format!(
                "Information field of {} bytes exceeds the 15-bit length field",
                information.len()
            )));
        }

        let has_credit_octet =
            credit_based_flow && self.frame_type.is_uih() && self.poll_final;
        if has_credit_octet && self.credits.is_none() {
            return Err(RfcommError::FrameInvalid(
                "UIH frame with P/F set under credit-based flow must carry credits".to_string(),
            ));
        }
        if self.credits.is_some() && !has_credit_octet {
            return Err(RfcommError::FrameInvalid(
                "Credit octet requires credit-based flow, UIH, and P/F set".to_string(),
            ));
        }

        let mut buf = Vec::with_capacity(MIN_FRAME_LENGTH + 2 + information.len());
        buf.push(0x01 | (u8::from(self.cr_bit()) << 1) | (u8::from(self.dlci) << 2));
        buf.push(self.frame_type.to_control_byte(self.poll_final));

        // Length field: one octet with EA = 1 up to 127, else two octets
        // (low 7 bits with EA = 0, then the high 8 bits).
        if information.len() <= 0x7F {
            buf.push(((information.len() as u8) << 1) | 0x01);
        } else {
            buf.push(((information.len() & 0x7F) as u8) << 1);
            buf.push((information.len() >> 7) as u8);
        }

        // The FCS covers address, control, and length octets, except for UIH
        // frames where it covers only address and control.
        let fcs_cover = if self.frame_type.is_uih() { 2 } else { buf.len() };
        let mut fcs = FcsCalc::new();
        fcs.update_bytes(&buf[..fcs_cover]);

        if let Some(credits) = self.credits {
            buf.push(credits);
        }
        buf.extend_from_slice(&information);
        buf.push(fcs.fcs_value_byte());
        Ok(buf)
    }

    /// Decode a frame received from the peer.
    ///
    /// `role` is the role of the *sender* of `buf` (the opposite of the local
    /// role once the multiplexer has started). Fails without panicking on any
    /// malformed input: short buffers, reserved DLCIs, bad FCS, frames that
    /// are not valid before startup.
    pub fn decode(credit_based_flow: bool, role: Role, buf: &[u8]) -> RfcommResult<Frame> {
        if buf.len() < MIN_FRAME_LENGTH {
            return Err(RfcommError::FrameInvalid(format!(
                "Frame too short: {} bytes",
                buf.len()
            )));
        }

        let address = buf[0];
        if address & 0x01 == 0 {
            return Err(RfcommError::FrameInvalid(
                "Address octet E/A bit must be set".to_string(),
            ));
        }
        let cr_bit = (address >> 1) & 0x01 == 0x01;
        let dlci = Dlci::try_from(address >> 2)?;

        let control = buf[1];
        let frame_type = FrameType::from_control_byte(control)?;
        let poll_final = control & PF_BIT != 0;

        if !role.is_multiplexer_started()
            && !(frame_type.is_valid_before_mux_startup() && dlci.is_mux_control())
        {
            return Err(RfcommError::FrameInvalid(format!(
                "{:?} on {} is not valid before multiplexer startup",
                frame_type, dlci
            )));
        }

        let command_response = classify_command_response(role, frame_type, cr_bit)?;

        let (length, header_len) = if buf[2] & 0x01 == 0x01 {
            (usize::from(buf[2] >> 1), 3)
        } else {
            if buf.len() < MIN_FRAME_LENGTH + 1 {
                return Err(RfcommError::FrameInvalid(
                    "Frame truncated in two-octet length field".to_string(),
                ));
            }
            (usize::from(buf[2] >> 1) | (usize::from(buf[3]) << 7), 4)
        };

        let has_credit_octet = credit_based_flow && frame_type.is_uih() && poll_final;
        let data_start = header_len + usize::from(has_credit_octet);
        if buf.len() < data_start + length + 1 {
            return Err(RfcommError::FrameInvalid(format!(
                "Frame of {} bytes too short for {}-byte information field",
                buf.len(),
                length
            )));
        }

        let credits = if has_credit_octet { Some(buf[header_len]) } else { None };
        let information = &buf[data_start..data_start + length];
        let received_fcs = buf[data_start + length];

        let fcs_cover = if frame_type.is_uih() { 2 } else { header_len };
        let mut fcs = FcsCalc::new();
        fcs.update_bytes(&buf[..fcs_cover]);
        fcs.update(received_fcs);
        fcs.validate()?;

        let content = if frame_type.is_uih() {
            if dlci.is_mux_control() {
                FrameContent::Mux(MuxCommand::decode(information)?)
            } else {
                FrameContent::UserData(information.to_vec())
            }
        } else {
            if length != 0 {
                return Err(RfcommError::FrameInvalid(format!(
                    "{:?} frame carries an unexpected {}-byte information field",
                    frame_type, length
                )));
            }
            FrameContent::None
        };

        Ok(Frame { role, frame_type, dlci, poll_final, command_response, credits, content })
    }
}
