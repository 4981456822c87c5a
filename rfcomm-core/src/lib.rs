//! Core types for the RFCOMM protocol engine
//!
//! This crate provides the identifiers, role state machine, and error type
//! shared by the transport and session layers.

pub mod error;
pub mod types;

pub use error::{RfcommError, RfcommResult};
pub use types::{
    CommandResponse, ConnectionHandle, Dlci, ParameterNegotiationState, Role, ServerChannel,
};
