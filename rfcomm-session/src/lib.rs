//! RFCOMM session layer
//!
//! This crate implements the RFCOMM multiplexer on top of a reliable,
//! ordered, message-based channel: the GSM 07.10 frame codec, the
//! multiplexer control commands, the per-DLC state, the session state
//! machine with credit-based flow control, and the thin channel manager
//! that routes connection handles to sessions.

pub mod channel;
pub mod fcs;
pub mod frame;
pub mod mux_commands;
pub mod server;
pub mod session;
pub mod statistics;

#[cfg(test)]
mod test_util;

pub use channel::UserChannel;
pub use fcs::FcsCalc;
pub use frame::{Frame, FrameContent, FrameType};
pub use mux_commands::{MuxCommand, MuxCommandParams, MuxCommandType};
pub use server::ChannelManager;
pub use session::{Session, SessionConfig, SessionHandle};
pub use statistics::SessionStatistics;
