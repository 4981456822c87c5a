use thiserror::Error;

use crate::types::{Dlci, Role};

/// Main error type for RFCOMM operations
#[derive(Error, Debug)]
pub enum RfcommError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Frame invalid: {0}")]
    FrameInvalid(String),

    #[error("FCS check failed: residue 0x{0:02X}")]
    FcsError(u8),

    #[error("DLCI {0} is invalid")]
    InvalidDlci(u8),

    #[error("Server channel {0} is invalid")]
    InvalidServerChannel(u8),

    #[error("Invalid role: {0:?}")]
    InvalidRole(Role),

    #[error("Multiplexer has already started")]
    MultiplexerAlreadyStarted,

    #[error("Multiplexer has not started")]
    MultiplexerNotStarted,

    #[error("DLCI {0} is already established")]
    ChannelAlreadyEstablished(Dlci),

    #[error("DLCI {0} is not established")]
    ChannelNotEstablished(Dlci),

    #[error("A command is already outstanding on DLCI {0}")]
    CommandAlreadyOutstanding(Dlci),

    #[error("Multiplexer command type 0x{0:02X} is not supported")]
    NotSupportedMuxCommand(u8),

    #[error("Parameter negotiation rejected: {0}")]
    NegotiationRejected(String),

    #[error("Timeout")]
    Timeout,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for RFCOMM operations
pub type RfcommResult<T> = Result<T, RfcommError>;
