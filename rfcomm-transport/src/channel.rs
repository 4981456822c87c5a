//! The underlying reliable channel trait consumed by an RFCOMM session

use async_trait::async_trait;
use bytes::Bytes;
use rfcomm_core::{ConnectionHandle, RfcommResult};
use tokio::sync::mpsc;

/// Inbound SDUs are push-based: the carrier delivers each received service
/// data unit on this queue, and closes it when the channel goes away.
pub type SduReceiver = mpsc::Receiver<Bytes>;

/// Outbound interface of a reliable, ordered, message-based channel.
///
/// A session owns exactly one `L2capChannel` for its lifetime. Sends are
/// whole-SDU: the carrier must deliver each `send` as one message, in order.
/// Closing is irreversible; `close` is safe to call more than once.
#[async_trait]
pub trait L2capChannel: Send {
    /// Send one SDU. The buffer must not exceed `max_tx_sdu_size`.
    async fn send(&mut self, sdu: &[u8]) -> RfcommResult<()>;

    /// Largest SDU the remote peer accepts.
    fn max_tx_sdu_size(&self) -> u16;

    /// Largest SDU the local side accepts.
    fn max_rx_sdu_size(&self) -> u16;

    /// Whether the channel has been closed, locally or by the peer.
    fn is_closed(&self) -> bool;

    /// Close the channel. Idempotent.
    async fn close(&mut self) -> RfcommResult<()>;
}

/// Opens an underlying channel for a connection handle on demand.
///
/// Injected into the channel manager so it can create a session for an
/// outbound `open_remote_channel` when none exists yet for that handle.
#[async_trait]
pub trait L2capConnector: Send {
    async fn connect(
        &mut self,
        handle: ConnectionHandle,
    ) -> RfcommResult<(Box<dyn L2capChannel>, SduReceiver)>;
}
