//! Per-DLC channel state and the user-facing channel handle
//!
//! [`Channel`] is the session's internal bookkeeping for one DLC: whether it
//! is established, its negotiated parameters, the credit balances of both
//! directions, and the data queued while credits are exhausted. The session
//! event loop owns every `Channel`; nothing here touches the wire.
//!
//! [`UserChannel`] is the handle returned to the application once a DLC is
//! open. It talks to the session purely through message passing, so it can be
//! moved to any task.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc;

use rfcomm_core::{
    Dlci, ParameterNegotiationState, RfcommError, RfcommResult, ServerChannel,
};

use crate::session::SessionEvent;

/// Credit level at which an empty replenishment frame is sent to the peer.
pub(crate) const LOW_CREDIT_WATER_MARK: usize = 10;

/// Credit level the peer is topped up to by every outgoing frame.
pub(crate) const HIGH_CREDIT_WATER_MARK: usize = 100;

/// Buffered SDUs between the session task and one user handle.
const USER_CHANNEL_CAPACITY: usize = 128;

/// Session-internal state for a single DLC.
#[derive(Debug)]
pub(crate) struct Channel {
    dlci: Dlci,
    established: bool,
    negotiation_state: ParameterNegotiationState,
    max_frame_size: u16,
    /// Credits this side may spend on frames with a nonzero payload.
    local_credits: usize,
    /// Credits the peer currently holds for sending to this side.
    remote_credits: usize,
    /// Outbound payloads waiting for credits, oldest first.
    wait_queue: VecDeque<Bytes>,
    /// Sender half of the user handle, once one is attached.
    user_tx: Option<mpsc::Sender<Bytes>>,
    /// Inbound payloads that arrived before a user handle attached.
    pending_inbound: VecDeque<Bytes>,
}

impl Channel {
    pub fn new(dlci: Dlci, max_frame_size: u16) -> Self {
        Self {
            dlci,
            established: false,
            negotiation_state: ParameterNegotiationState::default(),
            max_frame_size,
            local_credits: 0,
            remote_credits: 0,
            wait_queue: VecDeque::new(),
            user_tx: None,
            pending_inbound: VecDeque::new(),
        }
    }

    pub fn dlci(&self) -> Dlci {
        self.dlci
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn establish(&mut self) {
        self.established = true;
    }

    pub fn negotiation_state(&self) -> ParameterNegotiationState {
        self.negotiation_state
    }

    pub fn set_negotiation_state(&mut self, state: ParameterNegotiationState) {
        self.negotiation_state = state;
    }

    pub fn max_frame_size(&self) -> u16 {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: u16) {
        self.max_frame_size = max_frame_size;
    }

    /// Seed both credit balances from a completed parameter negotiation.
    pub fn set_initial_credits(&mut self, local: usize, remote: usize) {
        self.local_credits = local;
        self.remote_credits = remote;
    }

    pub fn local_credits(&self) -> usize {
        self.local_credits
    }

    pub fn remote_credits(&self) -> usize {
        self.remote_credits
    }

    /// Spend one local credit for a frame with a nonzero payload.
    pub fn spend_local_credit(&mut self) {
        debug_assert!(self.local_credits > 0);
        self.local_credits = self.local_credits.saturating_sub(1);
    }

    /// Bank credits granted by the peer.
    pub fn add_local_credits(&mut self, credits: usize) {
        self.local_credits += credits;
    }

    /// Account for one nonzero-payload frame received from the peer.
    pub fn remote_spent_credit(&mut self) {
        self.remote_credits = self.remote_credits.saturating_sub(1);
    }

    /// Account for credits granted to the peer in an outgoing frame.
    pub fn add_remote_credits(&mut self, credits: usize) {
        self.remote_credits += credits;
    }

    /// Credits to attach to the next outgoing frame on this DLC: enough to
    /// top the peer back up to the high water mark, capped at one octet.
    pub fn credits_to_replenish(&self) -> u8 {
        HIGH_CREDIT_WATER_MARK
            .saturating_sub(self.remote_credits)
            .min(usize::from(u8::MAX)) as u8
    }

    /// True once the peer's balance has drained enough that an empty
    /// replenishment frame should be sent even with no data pending.
    pub fn needs_replenishment(&self) -> bool {
        self.remote_credits <= LOW_CREDIT_WATER_MARK
    }

    pub fn queue_outbound(&mut self, data: Bytes) {
        self.wait_queue.push_back(data);
    }

    pub fn dequeue_outbound(&mut self) -> Option<Bytes> {
        self.wait_queue.pop_front()
    }

    pub fn has_queued_outbound(&self) -> bool {
        !self.wait_queue.is_empty()
    }

    /// Attach the session side of a user handle, flushing any data that
    /// arrived before the handle existed, in arrival order.
    pub fn attach_user(&mut self, user_tx: mpsc::Sender<Bytes>) {
        while let Some(data) = self.pending_inbound.pop_front() {
            // A freshly attached handle cannot have a full buffer.
            let _ = user_tx.try_send(data);
        }
        self.user_tx = Some(user_tx);
    }

    /// Hand an inbound payload to the user, or buffer it until a handle
    /// attaches. Returns false if the user handle is gone.
    pub fn deliver_inbound(&mut self, data: Bytes) -> bool {
        match &self.user_tx {
            Some(user_tx) => user_tx.try_send(data).is_ok(),
            None => {
                self.pending_inbound.push_back(data);
                true
            }
        }
    }

    /// Drop the user side; the handle's receive stream ends.
    pub fn detach_user(&mut self) {
        self.user_tx = None;
        self.pending_inbound.clear();
        self.wait_queue.clear();
    }
}

/// An open RFCOMM channel, as seen by the application.
///
/// Data written here is framed, credit-gated, and sent by the session task;
/// inbound payloads for this DLC arrive on [`UserChannel::receive`]. The
/// receive stream ends (`None`) when the channel or session closes.
#[derive(Debug)]
pub struct UserChannel {
    dlci: Dlci,
    server_channel: ServerChannel,
    max_frame_size: u16,
    rx: mpsc::Receiver<Bytes>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl UserChannel {
    /// Build a handle pair: the `UserChannel` for the application and the
    /// sender the session attaches to the [`Channel`].
    pub(crate) fn new(
        dlci: Dlci,
        server_channel: ServerChannel,
        max_frame_size: u16,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> (Self, mpsc::Sender<Bytes>) {
        let (user_tx, rx) = mpsc::channel(USER_CHANNEL_CAPACITY);
        let channel = Self { dlci, server_channel, max_frame_size, rx, event_tx };
        (channel, user_tx)
    }

    pub fn dlci(&self) -> Dlci {
        self.dlci
    }

    pub fn server_channel(&self) -> ServerChannel {
        self.server_channel
    }

    /// The largest payload a single [`UserChannel::send`] may carry.
    pub fn max_frame_size(&self) -> u16 {
        self.max_frame_size
    }

    /// Send a payload on this channel.
    ///
    /// The session queues the payload if the peer has granted no credits;
    /// queued data flushes in order as credits arrive.
    pub async fn send(&self, data: Bytes) -> RfcommResult<()> {
        if data.len() > usize::from(self.max_frame_size) {
            return Err(RfcommError::InvalidData(format!(
                "Payload of {} bytes exceeds the negotiated frame size {}",
                data.len(),
                self.max_frame_size
            )));
        }
        self.event_tx
            .send(SessionEvent::UserData { dlci: self.dlci, data })
            .await
            .map_err(|_| RfcommError::SessionClosed)
    }

    /// Receive the next inbound payload. Returns `None` once the channel or
    /// its session has closed.
    pub async fn receive(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Close this channel with a DISC exchange, leaving the session up.
    pub async fn close(self) -> RfcommResult<()> {
        self.event_tx
            .send(SessionEvent::CloseChannel { dlci: self.dlci })
            .await
            .map_err(|_| RfcommError::SessionClosed)
    }
}
