//! Transport layer abstraction for the RFCOMM protocol engine
//!
//! RFCOMM runs on top of a reliable, ordered, message-based channel (an L2CAP
//! channel on real hardware). This crate defines that seam as a trait plus two
//! concrete carriers: an in-process pair for tests and loopback setups, and an
//! adapter that frames SDUs over any byte stream.

pub mod channel;
pub mod memory;
pub mod stream;

pub use channel::{L2capChannel, L2capConnector, SduReceiver};
pub use memory::MemoryChannel;
pub use stream::StreamChannel;
