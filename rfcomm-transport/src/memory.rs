//! In-process channel pair backed by tokio mpsc queues
//!
//! Behaves like a pair of connected L2CAP channels: reliable, ordered, and
//! message-preserving. Used by the test suites and by loopback setups.

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use rfcomm_core::{RfcommError, RfcommResult};
use tokio::sync::mpsc;

use crate::channel::{L2capChannel, SduReceiver};

/// Queue depth of each direction of a memory pair.
const CHANNEL_CAPACITY: usize = 128;

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    tx: Option<mpsc::Sender<Bytes>>,
    tx_mtu: u16,
    rx_mtu: u16,
}

impl MemoryChannel {
    /// Create two connected ends with symmetric MTUs.
    ///
    /// Each end is returned with the receiver carrying SDUs sent by the
    /// opposite end.
    pub fn pair(mtu: u16) -> ((MemoryChannel, SduReceiver), (MemoryChannel, SduReceiver)) {
        Self::pair_with_mtus(mtu, mtu)
    }

    /// Create two connected ends; `a_to_b_mtu` bounds SDUs sent by the first
    /// end, `b_to_a_mtu` by the second.
    pub fn pair_with_mtus(
        a_to_b_mtu: u16,
        b_to_a_mtu: u16,
    ) -> ((MemoryChannel, SduReceiver), (MemoryChannel, SduReceiver)) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let a = MemoryChannel { tx: Some(a_tx), tx_mtu: a_to_b_mtu, rx_mtu: b_to_a_mtu };
        let b = MemoryChannel { tx: Some(b_tx), tx_mtu: b_to_a_mtu, rx_mtu: a_to_b_mtu };
        ((a, a_rx), (b, b_rx))
    }
}

#[async_trait]
impl L2capChannel for MemoryChannel {
    async fn send(&mut self, sdu: &[u8]) -> RfcommResult<()> {
        if sdu.len() > usize::from(self.tx_mtu) {
            return Err(RfcommError::InvalidData(format!(
                "SDU of {} bytes exceeds TX MTU {}",
                sdu.len(),
                self.tx_mtu
            )));
        }
        let tx = self.tx.as_ref().ok_or_else(|| {
            RfcommError::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "memory channel is closed",
            ))
        })?;
        tx.send(Bytes::copy_from_slice(sdu)).await.map_err(|_| {
            RfcommError::Connection(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer end of memory channel dropped",
            ))
        })
    }

    fn max_tx_sdu_size(&self) -> u16 {
        self.tx_mtu
    }

    fn max_rx_sdu_size(&self) -> u16 {
        self.rx_mtu
    }

    fn is_closed(&self) -> bool {
        match &self.tx {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }

    async fn close(&mut self) -> RfcommResult<()> {
        if self.tx.take().is_some() {
            debug!("memory channel closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let ((mut a, _a_rx), (_b, mut b_rx)) = MemoryChannel::pair(128);
        a.send(&[1, 2, 3]).await.unwrap();
        a.send(&[4]).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(b_rx.recv().await.unwrap().as_ref(), &[4]);
    }

    #[tokio::test]
    async fn test_send_respects_mtu() {
        let ((mut a, _a_rx), (_b, _b_rx)) = MemoryChannel::pair(4);
        assert!(a.send(&[0; 4]).await.is_ok());
        assert!(a.send(&[0; 5]).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_observable() {
        let ((mut a, _a_rx), (b, mut b_rx)) = MemoryChannel::pair(128);
        assert!(!a.is_closed());
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());
        // The peer's receive stream terminates.
        assert!(b_rx.recv().await.is_none());
        drop(b);
    }

    #[tokio::test]
    async fn test_peer_drop_fails_send() {
        let ((mut a, _a_rx), (b, b_rx)) = MemoryChannel::pair(128);
        drop(b);
        drop(b_rx);
        assert!(a.is_closed());
        assert!(a.send(&[0]).await.is_err());
    }
}
