//! Identifiers and session-wide state enums for RFCOMM

use std::fmt;

use crate::error::{RfcommError, RfcommResult};

/// The DLCI reserved for the multiplexer control channel.
pub const MUX_CONTROL_DLCI: u8 = 0;

/// Lowest valid user-channel DLCI. DLCI 1 is reserved by GSM 07.10.
pub const MIN_USER_DLCI: u8 = 2;

/// Highest valid user-channel DLCI.
pub const MAX_USER_DLCI: u8 = 61;

/// Data Link Connection Identifier, a 6-bit channel number within an RFCOMM
/// session.
///
/// `0` addresses the multiplexer control channel; `2..=61` address user
/// channels. DLCI 1 and 62..=63 are reserved and never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dlci(u8);

impl Dlci {
    /// The multiplexer control channel (DLCI 0).
    pub const MUX_CONTROL: Dlci = Dlci(MUX_CONTROL_DLCI);

    pub fn is_mux_control(&self) -> bool {
        self.0 == MUX_CONTROL_DLCI
    }

    pub fn is_user(&self) -> bool {
        (MIN_USER_DLCI..=MAX_USER_DLCI).contains(&self.0)
    }

    /// The direction bit of a user DLCI (bit 0): 1 iff the server side of
    /// the channel is the session initiator, per RFCOMM 5.4.
    pub fn initiator_bit(&self) -> bool {
        self.0 & 0x01 == 0x01
    }

    /// The Server Channel this user DLCI maps to, or an error for the control
    /// channel / reserved values.
    pub fn server_channel(&self) -> RfcommResult<ServerChannel> {
        if !self.is_user() {
            return Err(RfcommError::InvalidDlci(self.0));
        }
        ServerChannel::try_from(self.0 >> 1)
    }

    /// Checks that a user DLCI chosen by the remote peer is consistent with
    /// the local `role`.
    ///
    /// An inbound SABM targets a server on the local side, so its direction
    /// bit must be 1 iff the local side is the session initiator.
    pub fn is_valid_from_peer(&self, local_role: Role) -> bool {
        self.is_user() && self.initiator_bit() == (local_role == Role::Initiator)
    }
}

impl TryFrom<u8> for Dlci {
    type Error = RfcommError;

    fn try_from(value: u8) -> RfcommResult<Self> {
        if value == MUX_CONTROL_DLCI || (MIN_USER_DLCI..=MAX_USER_DLCI).contains(&value) {
            Ok(Dlci(value))
        } else {
            Err(RfcommError::InvalidDlci(value))
        }
    }
}

impl From<Dlci> for u8 {
    fn from(dlci: Dlci) -> u8 {
        dlci.0
    }
}

impl fmt::Display for Dlci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DLCI({})", self.0)
    }
}

/// Application-visible 5-bit RFCOMM channel identifier, `1..=30`.
///
/// Each Server Channel maps to a pair of DLCIs (one per session role);
/// `0` and `31` are reserved as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerChannel(u8);

impl ServerChannel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 30;

    /// Iterator over every valid Server Channel, in ascending order.
    pub fn all() -> impl Iterator<Item = ServerChannel> {
        (Self::MIN..=Self::MAX).map(ServerChannel)
    }

    /// The DLCI a session in `role` uses to open this Server Channel on the
    /// peer.
    ///
    /// `dlci = (server_channel << 1) | direction_bit` per RFCOMM 5.4, where
    /// the direction bit is 1 iff the server side is the session initiator.
    /// An outbound open targets a server on the peer, so an Initiator uses
    /// bit 0 and a Responder bit 1. Only a started multiplexer has a defined
    /// mapping.
    pub fn to_dlci(&self, role: Role) -> RfcommResult<Dlci> {
        let bit = match role {
            Role::Initiator => 0,
            Role::Responder => 1,
            _ => return Err(RfcommError::InvalidRole(role)),
        };
        Dlci::try_from((self.0 << 1) | bit)
    }
}

impl TryFrom<u8> for ServerChannel {
    type Error = RfcommError;

    fn try_from(value: u8) -> RfcommResult<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(ServerChannel(value))
        } else {
            Err(RfcommError::InvalidServerChannel(value))
        }
    }
}

impl From<ServerChannel> for u8 {
    fn from(sc: ServerChannel) -> u8 {
        sc.0
    }
}

impl fmt::Display for ServerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerChannel({})", self.0)
    }
}

/// Session-wide multiplexer role.
///
/// # State Transitions
/// ```text
/// Unassigned -> Negotiating (local side sends SABM on DLCI 0)
/// Unassigned -> Responder   (peer SABM on DLCI 0 answered with UA)
/// Negotiating -> Initiator  (UA received)
/// Negotiating -> Unassigned (DM received, or startup conflict)
/// ```
///
/// The role fixes the C/R bit encoding of every subsequent frame and which
/// half of the user DLCI space this side may open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unassigned,
    Negotiating,
    Initiator,
    Responder,
}

impl Role {
    /// True once the startup handshake has completed in either direction.
    pub fn is_multiplexer_started(&self) -> bool {
        matches!(self, Role::Initiator | Role::Responder)
    }

    /// The peer's role, defined only once the multiplexer has started.
    pub fn opposite(&self) -> Option<Role> {
        match self {
            Role::Initiator => Some(Role::Responder),
            Role::Responder => Some(Role::Initiator),
            _ => None,
        }
    }

    /// Validate a role transition.
    pub fn validate_transition(&self, new_role: Role) -> RfcommResult<()> {
        let valid = matches!(
            (*self, new_role),
            (Role::Unassigned, Role::Negotiating)
                | (Role::Unassigned, Role::Responder)
                | (Role::Negotiating, Role::Initiator)
                | (Role::Negotiating, Role::Unassigned)
        );
        if valid {
            Ok(())
        } else {
            Err(RfcommError::InvalidData(format!(
                "Invalid role transition: {:?} -> {:?}",
                self, new_role
            )))
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Unassigned
    }
}

/// The C/R classification shared by frames and multiplexer commands.
/// See RFCOMM 5.1.3 and 5.4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResponse {
    Command,
    Response,
}

/// Parameter negotiation progress, tracked session-wide for the initial
/// exchange and per-channel for later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterNegotiationState {
    NotNegotiated,
    Negotiating,
    Negotiated,
}

impl Default for ParameterNegotiationState {
    fn default() -> Self {
        ParameterNegotiationState::NotNegotiated
    }
}

/// Identifier of the underlying ACL connection a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u16);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionHandle({:#06x})", self.0)
    }
}
