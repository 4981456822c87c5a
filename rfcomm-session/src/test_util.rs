//! Shared helpers for session unit tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rfcomm_core::{RfcommError, RfcommResult, Role};
use rfcomm_transport::L2capChannel;

use crate::frame::Frame;

/// Shared record of every SDU a [`MockChannel`] has sent.
#[derive(Debug, Clone, Default)]
pub struct SentFrames(Arc<Mutex<Vec<Vec<u8>>>>);

impl SentFrames {
    fn push(&self, sdu: Vec<u8>) {
        self.0.lock().unwrap().push(sdu);
    }

    /// Drain and return everything recorded so far, oldest first.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Drain and decode everything recorded so far as frames sent by
    /// `sender_role`.
    pub fn decode(&self, credit_based_flow: bool, sender_role: Role) -> Vec<Frame> {
        self.take()
            .iter()
            .map(|sdu| {
                Frame::decode(credit_based_flow, sender_role, sdu).expect("recorded frame decodes")
            })
            .collect()
    }
}

/// An in-memory channel that records outbound SDUs for inspection.
pub struct MockChannel {
    sent: SentFrames,
    closed: Arc<AtomicBool>,
    mtu: u16,
}

impl MockChannel {
    pub fn new(mtu: u16) -> (Self, SentFrames, Arc<AtomicBool>) {
        let sent = SentFrames::default();
        let closed = Arc::new(AtomicBool::new(false));
        (Self { sent: sent.clone(), closed: closed.clone(), mtu }, sent, closed)
    }
}

#[async_trait]
impl L2capChannel for MockChannel {
    async fn send(&mut self, sdu: &[u8]) -> RfcommResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RfcommError::SessionClosed);
        }
        self.sent.push(sdu.to_vec());
        Ok(())
    }

    fn max_tx_sdu_size(&self) -> u16 {
        self.mtu
    }

    fn max_rx_sdu_size(&self) -> u16 {
        self.mtu
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> RfcommResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
