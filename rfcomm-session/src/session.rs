//! The RFCOMM session state machine
//!
//! A [`Session`] multiplexes every DLC of one underlying channel. All
//! protocol state lives inside the single task driving [`Session::run`]:
//! user handles, timers, and the channel manager communicate with it
//! exclusively through [`SessionEvent`] messages, so no lock guards any
//! protocol state and a handle dropping mid-operation is just a message that
//! stops arriving.
//!
//! # Lifecycle
//! ```text
//! startup:   SABM(DLCI 0) / UA        -> role fixed (Initiator/Responder)
//! negotiate: PN command / PN response -> frame size + credit flow agreed
//! open:      SABM(user DLCI) / UA     -> channel established, handle issued
//! data:      UIH frames, credit-gated
//! close:     DISC / UA per DLC, or session closedown
//! ```
//!
//! Every command that awaits a peer response is recorded with a generation
//! number; its timer posts an event carrying that generation, so a response
//! and a timeout can never both resolve the same exchange.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use rfcomm_core::{
    CommandResponse, Dlci, ParameterNegotiationState, RfcommError, RfcommResult, Role,
    ServerChannel,
};
use rfcomm_transport::{L2capChannel, SduReceiver};

use crate::channel::{Channel, UserChannel};
use crate::frame::{Frame, FrameContent, FrameType};
use crate::mux_commands::{
    default_priority, CreditBasedFlowHandshake, MuxCommand, MuxCommandParams, MuxCommandType,
    NonSupportedCommandParams, ParameterNegotiationParams, PortValues,
    RemotePortNegotiationParams, MAX_INITIAL_CREDITS,
};
use crate::statistics::SessionStatistics;

/// Response timeout for SABM and DISC on the control channel (GSM T1).
const MUX_RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// Response timeout for SABM on a user DLCI, long enough to cover a remote
/// user accepting the connection (RFCOMM T1').
const USER_DLC_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Response timeout for multiplexer commands (GSM T2).
const MUX_COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// Back-off before retrying startup after a simultaneous-SABM conflict.
const STARTUP_CONFLICT_DELAY: Duration = Duration::from_millis(20);

/// Worst-case framing octets around an information field: address, control,
/// two length octets, credit octet, FCS.
const FRAME_OVERHEAD: u16 = 6;

/// Maximum frame size proposed when the configuration does not lower it.
pub const DEFAULT_MAX_FRAME_SIZE: u16 = 672;

const EVENT_QUEUE_CAPACITY: usize = 128;
const INBOUND_CHANNEL_CAPACITY: usize = 16;

/// Session tuning parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on the negotiated maximum frame size. The effective value
    /// is further capped by the underlying channel's SDU size.
    pub max_frame_size: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_frame_size: DEFAULT_MAX_FRAME_SIZE }
    }
}

/// Key correlating an outstanding multiplexer command with its response:
/// the command type plus the DLCI it addresses, since commands of the same
/// type may be in flight for different DLCIs.
pub(crate) type OutstandingCommandKey = (MuxCommandType, Option<Dlci>);

/// Messages driving the session task.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A user handle wants `data` sent on `dlci`.
    UserData { dlci: Dlci, data: Bytes },
    /// A user handle wants its channel disconnected.
    CloseChannel { dlci: Dlci },
    /// Open a channel to a server on the peer, starting the multiplexer and
    /// running the initial negotiation first if needed.
    OpenRemoteChannel {
        server_channel: ServerChannel,
        reply: oneshot::Sender<RfcommResult<UserChannel>>,
    },
    /// A control frame sent on `dlci` got no response in time. Stale once the
    /// generation no longer matches.
    FrameTimeout { dlci: Dlci, generation: u64 },
    /// A multiplexer command got no response in time.
    MuxCommandTimeout { key: OutstandingCommandKey, generation: u64 },
    /// Retry multiplexer startup after a conflict back-off.
    StartupRetry,
    /// Close the whole session.
    Closedown,
}

/// What to do when the peer answers a control frame sent on some DLCI.
#[derive(Debug)]
enum FrameAction {
    /// SABM on DLCI 0: a UA fixes our role as Initiator.
    StartMultiplexer,
    /// SABM on a user DLCI: a UA establishes the channel and resolves the
    /// open request.
    OpenChannel { reply: oneshot::Sender<RfcommResult<UserChannel>> },
    /// DISC on a user DLCI: either answer tears the channel down.
    CloseChannel,
}

#[derive(Debug)]
struct OutstandingFrame {
    generation: u64,
    action: FrameAction,
}

#[derive(Debug)]
struct OutstandingMuxCommand {
    generation: u64,
}

/// Client-side handle to a running session.
pub struct SessionHandle {
    event_tx: mpsc::Sender<SessionEvent>,
    inbound_rx: mpsc::Receiver<UserChannel>,
    statistics: Arc<Mutex<SessionStatistics>>,
}

impl SessionHandle {
    /// Open a channel to `server_channel` on the peer. Starts the
    /// multiplexer and runs the initial parameter negotiation first when
    /// this is the session's first open.
    pub async fn open_remote_channel(
        &self,
        server_channel: ServerChannel,
    ) -> RfcommResult<UserChannel> {
        let (reply, response) = oneshot::channel();
        self.event_tx
            .send(SessionEvent::OpenRemoteChannel { server_channel, reply })
            .await
            .map_err(|_| RfcommError::SessionClosed)?;
        response.await.map_err(|_| RfcommError::SessionClosed)?
    }

    /// The next channel the peer opened towards a local server. Returns
    /// `None` once the session has closed.
    pub async fn accept_inbound_channel(&mut self) -> Option<UserChannel> {
        self.inbound_rx.recv().await
    }

    /// Request session closedown. Every open channel and pending operation
    /// resolves with [`RfcommError::SessionClosed`].
    pub async fn close(&self) -> RfcommResult<()> {
        self.event_tx
            .send(SessionEvent::Closedown)
            .await
            .map_err(|_| RfcommError::SessionClosed)
    }

    /// Whether the session task is still running.
    pub fn is_active(&self) -> bool {
        !self.event_tx.is_closed()
    }

    /// Snapshot of the session's statistics counters.
    pub fn statistics(&self) -> SessionStatistics {
        self.statistics.lock().expect("statistics mutex poisoned").clone()
    }
}

/// One RFCOMM session over one underlying channel.
pub struct Session {
    role: Role,
    /// Progress of the session-wide initial parameter negotiation.
    negotiation_state: ParameterNegotiationState,
    /// Whether credit-based flow control was agreed in the initial PN.
    credit_based_flow: bool,
    /// Aggregate FCon/FCoff state; only consulted when credit-based flow is
    /// off. True means the peer accepts frames.
    peer_flow_active: bool,
    max_frame_size: u16,
    l2cap: Box<dyn L2capChannel>,
    sdu_rx: SduReceiver,
    event_rx: mpsc::Receiver<SessionEvent>,
    event_tx: mpsc::Sender<SessionEvent>,
    channels: HashMap<Dlci, Channel>,
    outstanding_frames: HashMap<Dlci, OutstandingFrame>,
    outstanding_mux_commands: HashMap<OutstandingCommandKey, OutstandingMuxCommand>,
    /// Open requests parked until startup and the initial PN complete.
    pending_opens: Vec<(ServerChannel, oneshot::Sender<RfcommResult<UserChannel>>)>,
    inbound_tx: mpsc::Sender<UserChannel>,
    statistics: Arc<Mutex<SessionStatistics>>,
    /// Monotonic stamp distinguishing live exchanges from stale timeouts.
    generation: u64,
    closed: bool,
}

impl Session {
    /// Build a session over `l2cap`, returning the task-side state machine
    /// and the client-side handle. The caller spawns [`Session::run`].
    pub fn new(
        config: SessionConfig,
        l2cap: Box<dyn L2capChannel>,
        sdu_rx: SduReceiver,
    ) -> (Self, SessionHandle) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let statistics = Arc::new(Mutex::new(SessionStatistics::new()));

        let max_frame_size = config
            .max_frame_size
            .min(l2cap.max_tx_sdu_size().saturating_sub(FRAME_OVERHEAD));

        let session = Session {
            role: Role::default(),
            negotiation_state: ParameterNegotiationState::default(),
            credit_based_flow: false,
            peer_flow_active: true,
            max_frame_size,
            l2cap,
            sdu_rx,
            event_rx,
            event_tx: event_tx.clone(),
            channels: HashMap::new(),
            outstanding_frames: HashMap::new(),
            outstanding_mux_commands: HashMap::new(),
            pending_opens: Vec::new(),
            inbound_tx,
            statistics: statistics.clone(),
            generation: 0,
            closed: false,
        };
        let handle = SessionHandle { event_tx, inbound_rx, statistics };
        (session, handle)
    }

    /// Drive the session until it closes.
    ///
    /// Selects between inbound SDUs and session events. Either source ending
    /// (carrier gone, or every handle dropped) closes the session.
    pub async fn run(mut self) -> RfcommResult<()> {
        loop {
            let step = tokio::select! {
                maybe_sdu = self.sdu_rx.recv() => match maybe_sdu {
                    Some(sdu) => self.handle_sdu(&sdu).await,
                    None => {
                        debug!("Underlying channel closed, shutting session down");
                        self.closedown("carrier lost").await;
                        Ok(())
                    }
                },
                maybe_event = self.event_rx.recv() => match maybe_event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        self.closedown("all handles dropped").await;
                        Ok(())
                    }
                },
            };
            // A failed send means the carrier is unusable; tear down the
            // same way as any other closedown before surfacing the error.
            if let Err(error) = step {
                warn!("Session failed: {}", error);
                self.closedown("carrier error").await;
                return Err(error);
            }
            if self.closed {
                return Ok(());
            }
        }
    }

    fn stats(&self) -> MutexGuard<'_, SessionStatistics> {
        self.statistics.lock().expect("statistics mutex poisoned")
    }

    /// The role of the device on the other end of the wire, used to classify
    /// inbound frames. Before startup the pre-startup rules apply and any
    /// unstarted role value selects them.
    fn peer_role(&self) -> Role {
        self.role.opposite().unwrap_or(self.role)
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// The largest payload a user handle may submit on a DLC: the negotiated
    /// frame size, minus the octet reserved for credits when credit-based
    /// flow is on.
    fn user_payload_limit(&self, max_frame_size: u16) -> u16 {
        if self.credit_based_flow {
            max_frame_size.saturating_sub(1)
        } else {
            max_frame_size
        }
    }

    // -- Inbound dispatch ---------------------------------------------------

    pub(crate) async fn handle_sdu(&mut self, sdu: &[u8]) -> RfcommResult<()> {
        match Frame::decode(self.credit_based_flow, self.peer_role(), sdu) {
            Ok(frame) => {
                self.stats().increment_frames_received();
                self.handle_frame(frame).await
            }
            Err(RfcommError::NotSupportedMuxCommand(type_octet)) => {
                // The frame itself was sound; answer with NSC so the peer can
                // correlate the unsupported command.
                self.stats().increment_frames_received();
                warn!("Unsupported mux command type octet 0x{:02X}", type_octet);
                self.send_mux_response(MuxCommandParams::NonSupported(
                    NonSupportedCommandParams { non_supported_command: type_octet },
                ))
                .await
            }
            Err(error) => {
                let mut stats = self.stats();
                stats.increment_frames_rejected();
                if matches!(error, RfcommError::FcsError(_)) {
                    stats.increment_fcs_errors();
                }
                drop(stats);
                warn!("Dropping undecodable frame: {}", error);
                Ok(())
            }
        }
    }

    pub(crate) async fn handle_frame(&mut self, frame: Frame) -> RfcommResult<()> {
        match frame.frame_type {
            FrameType::SetAsynchronousBalancedMode => self.handle_sabm(frame.dlci).await,
            FrameType::UnnumberedAcknowledgement => self.handle_ua(frame.dlci).await,
            FrameType::DisconnectedMode => self.handle_dm(frame.dlci).await,
            FrameType::Disconnect => self.handle_disc(frame.dlci).await,
            FrameType::UnnumberedInfoHeaderCheck => match frame.content {
                FrameContent::Mux(command) => self.handle_mux_command(command).await,
                FrameContent::UserData(data) => {
                    self.handle_user_data_frame(frame.dlci, frame.credits, data).await
                }
                FrameContent::None => {
                    // A UIH with an empty information field and no credits
                    // carries nothing; decode never produces this, but user
                    // DLCI frames with empty payloads arrive as UserData.
                    Ok(())
                }
            },
        }
    }

    async fn handle_sabm(&mut self, dlci: Dlci) -> RfcommResult<()> {
        if dlci.is_mux_control() {
            return match self.role {
                Role::Unassigned => {
                    self.role.validate_transition(Role::Responder)?;
                    self.role = Role::Responder;
                    info!("Multiplexer started as responder");
                    self.send_frame(Frame::ua(self.role, Dlci::MUX_CONTROL)).await?;
                    // Opens parked behind a lost startup conflict proceed
                    // under the peer's multiplexer.
                    self.begin_initial_negotiation().await
                }
                Role::Negotiating => {
                    // Simultaneous startup: refuse the peer's attempt, back
                    // off, and retry our own.
                    debug!("Startup conflict, backing off");
                    self.outstanding_frames.remove(&Dlci::MUX_CONTROL);
                    self.role.validate_transition(Role::Unassigned)?;
                    self.role = Role::Unassigned;
                    self.send_frame(Frame::dm(self.role, Dlci::MUX_CONTROL)).await?;
                    let event_tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(STARTUP_CONFLICT_DELAY).await;
                        let _ = event_tx.send(SessionEvent::StartupRetry).await;
                    });
                    Ok(())
                }
                // A second startup attempt on a running multiplexer is
                // refused without touching session state.
                _ => self.send_frame(Frame::dm(self.role, Dlci::MUX_CONTROL)).await,
            };
        }

        // SABM on a user DLCI: the peer is opening a channel to a local
        // server. The direction bit must match our role.
        if !dlci.is_valid_from_peer(self.role) {
            warn!("Peer opened {} inconsistent with role {:?}", dlci, self.role);
            return self.send_frame(Frame::dm(self.role, dlci)).await;
        }
        if self.channels.get(&dlci).map_or(false, Channel::is_established) {
            // The peer has lost track of the DLC; refuse the open and
            // disconnect our side so both ends end up closed.
            warn!("Peer re-opened established {}", dlci);
            self.send_frame(Frame::dm(self.role, dlci)).await?;
            return self.handle_close_request(dlci).await;
        }

        // A peer may legally skip parameter negotiation; such a session
        // simply runs without credit-based flow.
        if self.negotiation_state == ParameterNegotiationState::NotNegotiated {
            self.negotiation_state = ParameterNegotiationState::Negotiated;
            self.credit_based_flow = false;
        }

        let max_frame_size = self.max_frame_size;
        let channel =
            self.channels.entry(dlci).or_insert_with(|| Channel::new(dlci, max_frame_size));
        channel.establish();
        let channel_mfs = channel.max_frame_size();

        let server_channel = dlci.server_channel()?;
        let payload_limit = self.user_payload_limit(channel_mfs);
        let (user_channel, user_tx) =
            UserChannel::new(dlci, server_channel, payload_limit, self.event_tx.clone());
        if let Some(channel) = self.channels.get_mut(&dlci) {
            channel.attach_user(user_tx);
        }
        info!("Peer established {} for {}", dlci, server_channel);
        self.send_frame(Frame::ua(self.role, dlci)).await?;

        if self.inbound_tx.try_send(user_channel).is_err() {
            warn!("No acceptor for inbound {}, channel data will buffer", dlci);
        }
        self.replenish_if_needed(dlci).await
    }

    async fn handle_ua(&mut self, dlci: Dlci) -> RfcommResult<()> {
        let Some(outstanding) = self.outstanding_frames.remove(&dlci) else {
            debug!("Ignoring unsolicited UA on {}", dlci);
            return Ok(());
        };
        match outstanding.action {
            FrameAction::StartMultiplexer => {
                self.role.validate_transition(Role::Initiator)?;
                self.role = Role::Initiator;
                info!("Multiplexer started as initiator");
                self.begin_initial_negotiation().await
            }
            FrameAction::OpenChannel { reply } => {
                let Some(channel) = self.channels.get_mut(&dlci) else {
                    let _ = reply.send(Err(RfcommError::ChannelNotEstablished(dlci)));
                    return Ok(());
                };
                channel.establish();
                let channel_mfs = channel.max_frame_size();
                let server_channel = dlci.server_channel()?;
                let payload_limit = self.user_payload_limit(channel_mfs);
                let (user_channel, user_tx) =
                    UserChannel::new(dlci, server_channel, payload_limit, self.event_tx.clone());
                if let Some(channel) = self.channels.get_mut(&dlci) {
                    channel.attach_user(user_tx);
                }
                info!("Established {} for {}", dlci, server_channel);
                let _ = reply.send(Ok(user_channel));
                self.replenish_if_needed(dlci).await
            }
            FrameAction::CloseChannel => {
                self.channels.remove(&dlci);
                info!("Disconnected {}", dlci);
                Ok(())
            }
        }
    }

    async fn handle_dm(&mut self, dlci: Dlci) -> RfcommResult<()> {
        let Some(outstanding) = self.outstanding_frames.remove(&dlci) else {
            debug!("Ignoring unsolicited DM on {}", dlci);
            return Ok(());
        };
        match outstanding.action {
            FrameAction::StartMultiplexer => {
                warn!("Peer refused multiplexer startup");
                self.role.validate_transition(Role::Unassigned)?;
                self.role = Role::Unassigned;
                for (_, reply) in self.pending_opens.drain(..) {
                    let _ = reply.send(Err(RfcommError::NegotiationRejected(
                        "Peer refused multiplexer startup".to_string(),
                    )));
                }
                Ok(())
            }
            FrameAction::OpenChannel { reply } => {
                self.channels.remove(&dlci);
                let _ = reply.send(Err(RfcommError::NegotiationRejected(format!(
                    "Peer refused to open {}",
                    dlci
                ))));
                Ok(())
            }
            FrameAction::CloseChannel => {
                // DM answers DISC when the peer no longer knows the DLC;
                // either way it is down.
                self.channels.remove(&dlci);
                Ok(())
            }
        }
    }

    async fn handle_disc(&mut self, dlci: Dlci) -> RfcommResult<()> {
        if dlci.is_mux_control() {
            info!("Peer closed the session");
            self.send_frame(Frame::ua(self.role, dlci)).await?;
            self.closedown("peer DISC on the control channel").await;
            return Ok(());
        }
        if self.channels.get(&dlci).map_or(false, Channel::is_established) {
            self.send_frame(Frame::ua(self.role, dlci)).await?;
            if let Some(mut channel) = self.channels.remove(&dlci) {
                channel.detach_user();
            }
            info!("Peer disconnected {}", dlci);
            Ok(())
        } else {
            self.send_frame(Frame::dm(self.role, dlci)).await
        }
    }

    // -- User data and credits ----------------------------------------------

    async fn handle_user_data_frame(
        &mut self,
        dlci: Dlci,
        credits: Option<u8>,
        data: Vec<u8>,
    ) -> RfcommResult<()> {
        let established = self.channels.get(&dlci).map_or(false, Channel::is_established);
        if !established {
            // Data for a DLC we never established.
            warn!("User data on unknown {}", dlci);
            return self.send_frame(Frame::dm(self.role, dlci)).await;
        }
        if !data.is_empty() {
            self.stats().add_bytes_received(data.len());
        }

        let credit_based_flow = self.credit_based_flow;
        if let Some(channel) = self.channels.get_mut(&dlci) {
            if let Some(credits) = credits {
                channel.add_local_credits(usize::from(credits));
            }
            if !data.is_empty() {
                if credit_based_flow {
                    channel.remote_spent_credit();
                }
                if !channel.deliver_inbound(Bytes::from(data)) {
                    debug!("User handle for {} is gone, dropping inbound data", dlci);
                }
            }
        }
        self.flush_wait_queue(dlci).await?;
        self.replenish_if_needed(dlci).await
    }

    async fn handle_user_data_event(&mut self, dlci: Dlci, data: Bytes) -> RfcommResult<()> {
        let Some(channel) = self.channels.get_mut(&dlci) else {
            debug!("Dropping user data for closed {}", dlci);
            return Ok(());
        };
        if !channel.is_established() {
            debug!("Dropping user data for unestablished {}", dlci);
            return Ok(());
        }

        let blocked = if self.credit_based_flow {
            !data.is_empty() && channel.local_credits() == 0
        } else {
            !self.peer_flow_active && !data.is_empty()
        };
        if blocked {
            channel.queue_outbound(data);
            self.stats().increment_frames_queued_on_credits();
            return Ok(());
        }
        self.send_user_data_frame(dlci, data).await
    }

    /// Frame and send one payload, spending a credit and topping the peer up
    /// towards the high water mark.
    async fn send_user_data_frame(&mut self, dlci: Dlci, data: Bytes) -> RfcommResult<()> {
        let role = self.role;
        let frame = {
            let channel = self
                .channels
                .get_mut(&dlci)
                .ok_or(RfcommError::ChannelNotEstablished(dlci))?;
            let mut frame = Frame::user_data(role, dlci, data.to_vec());
            if self.credit_based_flow {
                if !data.is_empty() {
                    channel.spend_local_credit();
                }
                let credits = channel.credits_to_replenish();
                frame.set_credits(credits);
                channel.add_remote_credits(usize::from(credits));
            }
            frame
        };
        self.stats().add_bytes_sent(data.len());
        self.send_frame(frame).await
    }

    /// Send queued payloads while the channel has credits to spend.
    async fn flush_wait_queue(&mut self, dlci: Dlci) -> RfcommResult<()> {
        loop {
            let Some(channel) = self.channels.get_mut(&dlci) else { return Ok(()) };
            let may_send = if self.credit_based_flow {
                channel.local_credits() > 0
            } else {
                self.peer_flow_active
            };
            if !may_send || !channel.has_queued_outbound() {
                return Ok(());
            }
            let data = channel.dequeue_outbound().expect("queue non-empty");
            self.send_user_data_frame(dlci, data).await?;
        }
    }

    /// Send an empty frame purely to grant credits, if the peer's balance
    /// has fallen to the low water mark.
    async fn replenish_if_needed(&mut self, dlci: Dlci) -> RfcommResult<()> {
        if !self.credit_based_flow {
            return Ok(());
        }
        let needs = self
            .channels
            .get(&dlci)
            .map_or(false, |c| c.is_established() && c.needs_replenishment());
        if needs {
            self.stats().increment_credit_replenishments_sent();
            self.send_user_data_frame(dlci, Bytes::new()).await?;
        }
        Ok(())
    }

    // -- Multiplexer commands -----------------------------------------------

    async fn handle_mux_command(&mut self, command: MuxCommand) -> RfcommResult<()> {
        self.stats().increment_mux_commands_received();
        match command.command_response {
            CommandResponse::Response => self.handle_mux_response(command).await,
            CommandResponse::Command => match command.params {
                MuxCommandParams::ParameterNegotiation(params) => {
                    self.handle_pn_command(params).await
                }
                MuxCommandParams::Test(params) => {
                    self.send_mux_response(MuxCommandParams::Test(params)).await
                }
                MuxCommandParams::FlowControlOn => {
                    self.peer_flow_active = true;
                    self.send_mux_response(MuxCommandParams::FlowControlOn).await?;
                    let dlcis: Vec<Dlci> = self.channels.keys().copied().collect();
                    for dlci in dlcis {
                        self.flush_wait_queue(dlci).await?;
                    }
                    Ok(())
                }
                MuxCommandParams::FlowControlOff => {
                    self.peer_flow_active = false;
                    self.send_mux_response(MuxCommandParams::FlowControlOff).await
                }
                MuxCommandParams::ModemStatus(params) => {
                    // Signals are acknowledged but not acted upon; actual
                    // flow control is credit-based.
                    self.send_mux_response(MuxCommandParams::ModemStatus(params)).await
                }
                MuxCommandParams::RemotePortNegotiation(params) => {
                    // Accept whatever the peer proposes; answer a query with
                    // the RFCOMM defaults.
                    let response = RemotePortNegotiationParams {
                        dlci: params.dlci,
                        port_values: Some(
                            params.port_values.unwrap_or_else(PortValues::default_values),
                        ),
                    };
                    self.send_mux_response(MuxCommandParams::RemotePortNegotiation(response))
                        .await
                }
                MuxCommandParams::RemoteLineStatus(params) => {
                    self.send_mux_response(MuxCommandParams::RemoteLineStatus(params)).await
                }
                MuxCommandParams::NonSupported(_) => {
                    warn!("Ignoring NSC sent as a command");
                    Ok(())
                }
            },
        }
    }

    async fn handle_mux_response(&mut self, command: MuxCommand) -> RfcommResult<()> {
        // NSC responses identify the failed command by type octet instead of
        // arriving under the command's own type.
        if let MuxCommandParams::NonSupported(params) = &command.params {
            return self.handle_nsc_response(params.non_supported_command).await;
        }

        let key = (command.command_type(), command.dlci());
        if self.outstanding_mux_commands.remove(&key).is_none() {
            debug!("Ignoring unsolicited {:?} response", command.command_type());
            return Ok(());
        }
        match command.params {
            MuxCommandParams::ParameterNegotiation(params) => {
                self.handle_pn_response(params).await
            }
            other => {
                debug!("Resolved {:?} response", other.command_type());
                Ok(())
            }
        }
    }

    async fn handle_nsc_response(&mut self, type_octet: u8) -> RfcommResult<()> {
        let Some(failed_type) = MuxCommandType::from_type_bits(type_octet >> 2) else {
            warn!("NSC names unknown type octet 0x{:02X}", type_octet);
            return Ok(());
        };
        let keys: Vec<OutstandingCommandKey> = self
            .outstanding_mux_commands
            .keys()
            .filter(|key| key.0 == failed_type)
            .copied()
            .collect();
        for key in keys {
            self.outstanding_mux_commands.remove(&key);
        }
        if failed_type == MuxCommandType::DlcParameterNegotiation {
            // The peer cannot negotiate parameters, so nothing queued behind
            // the initial negotiation can proceed.
            self.negotiation_state = ParameterNegotiationState::NotNegotiated;
            for (_, reply) in self.pending_opens.drain(..) {
                let _ = reply.send(Err(RfcommError::NotSupportedMuxCommand(type_octet)));
            }
        }
        Ok(())
    }

    async fn handle_pn_command(&mut self, params: ParameterNegotiationParams) -> RfcommResult<()> {
        let dlci = params.dlci;
        if !dlci.is_user() {
            warn!("PN command for non-user {}", dlci);
            return Ok(());
        }

        if self.channels.get(&dlci).map_or(false, Channel::is_established) {
            // Re-negotiation after establishment: reply with the parameters
            // already in force, changing nothing.
            let channel_mfs =
                self.channels.get(&dlci).map(Channel::max_frame_size).unwrap_or(self.max_frame_size);
            let response = ParameterNegotiationParams {
                dlci,
                credit_based_flow_handshake: CreditBasedFlowHandshake::Unsupported,
                priority: default_priority(dlci),
                maximum_frame_size: channel_mfs,
                initial_credits: 0,
            };
            return self
                .send_mux_response(MuxCommandParams::ParameterNegotiation(response))
                .await;
        }

        // Once the initial exchange has fixed the session frame size, later
        // negotiations must agree with it exactly.
        if self.negotiation_state == ParameterNegotiationState::Negotiated
            && params.maximum_frame_size != self.max_frame_size
        {
            warn!(
                "PN for {} proposes frame size {} against the fixed {}",
                dlci, params.maximum_frame_size, self.max_frame_size
            );
            return self.send_frame(Frame::dm(self.role, dlci)).await;
        }

        let supported =
            params.credit_based_flow_handshake == CreditBasedFlowHandshake::SupportedRequest;
        let max_frame_size = params.maximum_frame_size.min(self.max_frame_size);

        if self.negotiation_state != ParameterNegotiationState::Negotiated {
            // This is the session's initial negotiation; it fixes the
            // credit-flow mode and the session frame size.
            self.credit_based_flow = supported;
            self.negotiation_state = ParameterNegotiationState::Negotiated;
            self.max_frame_size = max_frame_size;
        }

        let granted = if supported { MAX_INITIAL_CREDITS } else { 0 };
        let channel =
            self.channels.entry(dlci).or_insert_with(|| Channel::new(dlci, max_frame_size));
        channel.set_max_frame_size(max_frame_size);
        channel.set_initial_credits(usize::from(params.initial_credits), usize::from(granted));
        channel.set_negotiation_state(ParameterNegotiationState::Negotiated);

        let response = ParameterNegotiationParams {
            dlci,
            credit_based_flow_handshake: if supported {
                CreditBasedFlowHandshake::SupportedResponse
            } else {
                CreditBasedFlowHandshake::Unsupported
            },
            priority: params.priority,
            maximum_frame_size: max_frame_size,
            initial_credits: granted,
        };
        self.send_mux_response(MuxCommandParams::ParameterNegotiation(response)).await
    }

    async fn handle_pn_response(&mut self, params: ParameterNegotiationParams) -> RfcommResult<()> {
        // A response may only keep or lower the proposed frame size.
        if params.maximum_frame_size > self.max_frame_size {
            warn!(
                "PN response raised the frame size to {} (proposed {}), rejecting",
                params.maximum_frame_size, self.max_frame_size
            );
            self.negotiation_state = ParameterNegotiationState::NotNegotiated;
            self.send_frame(Frame::dm(self.role, params.dlci)).await?;
            for (_, reply) in self.pending_opens.drain(..) {
                let _ = reply.send(Err(RfcommError::NegotiationRejected(format!(
                    "Peer raised the maximum frame size to {}",
                    params.maximum_frame_size
                ))));
            }
            return Ok(());
        }

        self.credit_based_flow =
            params.credit_based_flow_handshake == CreditBasedFlowHandshake::SupportedResponse;
        self.negotiation_state = ParameterNegotiationState::Negotiated;
        self.max_frame_size = params.maximum_frame_size.min(self.max_frame_size);
        info!(
            "Negotiated: frame size {}, credit-based flow {}",
            self.max_frame_size, self.credit_based_flow
        );

        let dlci = params.dlci;
        let granted = if self.credit_based_flow { MAX_INITIAL_CREDITS } else { 0 };
        let max_frame_size = self.max_frame_size;
        let channel =
            self.channels.entry(dlci).or_insert_with(|| Channel::new(dlci, max_frame_size));
        channel.set_max_frame_size(max_frame_size);
        channel.set_initial_credits(
            usize::from(params.initial_credits.min(MAX_INITIAL_CREDITS)),
            usize::from(granted),
        );
        channel.set_negotiation_state(ParameterNegotiationState::Negotiated);

        // Everything parked behind the initial negotiation may now open.
        let pending = std::mem::take(&mut self.pending_opens);
        for (server_channel, reply) in pending {
            self.open_user_channel(server_channel, reply).await?;
        }
        Ok(())
    }

    // -- Opening channels ---------------------------------------------------

    async fn handle_open_request(
        &mut self,
        server_channel: ServerChannel,
        reply: oneshot::Sender<RfcommResult<UserChannel>>,
    ) -> RfcommResult<()> {
        match self.role {
            Role::Unassigned => {
                self.pending_opens.push((server_channel, reply));
                self.start_multiplexer().await
            }
            Role::Negotiating => {
                // Startup already in flight; park behind it.
                self.pending_opens.push((server_channel, reply));
                Ok(())
            }
            _ => match self.negotiation_state {
                ParameterNegotiationState::NotNegotiated => {
                    self.pending_opens.push((server_channel, reply));
                    self.begin_initial_negotiation().await
                }
                ParameterNegotiationState::Negotiating => {
                    self.pending_opens.push((server_channel, reply));
                    Ok(())
                }
                ParameterNegotiationState::Negotiated => {
                    self.open_user_channel(server_channel, reply).await
                }
            },
        }
    }

    async fn start_multiplexer(&mut self) -> RfcommResult<()> {
        self.role.validate_transition(Role::Negotiating)?;
        self.role = Role::Negotiating;
        let generation = self.next_generation();
        self.outstanding_frames.insert(
            Dlci::MUX_CONTROL,
            OutstandingFrame { generation, action: FrameAction::StartMultiplexer },
        );
        self.arm_frame_timer(Dlci::MUX_CONTROL, generation, MUX_RESPONSE_TIMEOUT);
        self.send_frame(Frame::sabm(self.role, Dlci::MUX_CONTROL)).await
    }

    /// Send the session's one initial PN command, keyed to the DLCI of the
    /// first parked open. Further opens stay parked until it resolves.
    async fn begin_initial_negotiation(&mut self) -> RfcommResult<()> {
        if self.negotiation_state != ParameterNegotiationState::NotNegotiated {
            return Ok(());
        }
        let Some((server_channel, _)) = self.pending_opens.first() else {
            return Ok(());
        };
        let dlci = server_channel.to_dlci(self.role)?;
        self.negotiation_state = ParameterNegotiationState::Negotiating;

        let params = ParameterNegotiationParams {
            dlci,
            credit_based_flow_handshake: CreditBasedFlowHandshake::SupportedRequest,
            priority: default_priority(dlci),
            maximum_frame_size: self.max_frame_size,
            initial_credits: MAX_INITIAL_CREDITS,
        };
        self.send_mux_command(MuxCommandParams::ParameterNegotiation(params)).await
    }

    async fn open_user_channel(
        &mut self,
        server_channel: ServerChannel,
        reply: oneshot::Sender<RfcommResult<UserChannel>>,
    ) -> RfcommResult<()> {
        let dlci = match server_channel.to_dlci(self.role) {
            Ok(dlci) => dlci,
            Err(error) => {
                let _ = reply.send(Err(error));
                return Ok(());
            }
        };
        if self.channels.get(&dlci).map_or(false, Channel::is_established) {
            let _ = reply.send(Err(RfcommError::ChannelAlreadyEstablished(dlci)));
            return Ok(());
        }
        if self.outstanding_frames.contains_key(&dlci) {
            let _ = reply.send(Err(RfcommError::CommandAlreadyOutstanding(dlci)));
            return Ok(());
        }

        let max_frame_size = self.max_frame_size;
        self.channels.entry(dlci).or_insert_with(|| Channel::new(dlci, max_frame_size));

        let generation = self.next_generation();
        self.outstanding_frames
            .insert(dlci, OutstandingFrame { generation, action: FrameAction::OpenChannel { reply } });
        self.arm_frame_timer(dlci, generation, USER_DLC_RESPONSE_TIMEOUT);
        self.send_frame(Frame::sabm(self.role, dlci)).await
    }

    async fn handle_close_request(&mut self, dlci: Dlci) -> RfcommResult<()> {
        let Some(channel) = self.channels.get_mut(&dlci) else {
            return Ok(());
        };
        if !channel.is_established() {
            self.channels.remove(&dlci);
            return Ok(());
        }
        channel.detach_user();
        let generation = self.next_generation();
        self.outstanding_frames
            .insert(dlci, OutstandingFrame { generation, action: FrameAction::CloseChannel });
        self.arm_frame_timer(dlci, generation, MUX_RESPONSE_TIMEOUT);
        self.send_frame(Frame::disc(self.role, dlci)).await
    }

    // -- Events, timers, closedown ------------------------------------------

    pub(crate) async fn handle_event(&mut self, event: SessionEvent) -> RfcommResult<()> {
        match event {
            SessionEvent::UserData { dlci, data } => self.handle_user_data_event(dlci, data).await,
            SessionEvent::CloseChannel { dlci } => self.handle_close_request(dlci).await,
            SessionEvent::OpenRemoteChannel { server_channel, reply } => {
                self.handle_open_request(server_channel, reply).await
            }
            SessionEvent::FrameTimeout { dlci, generation } => {
                self.handle_frame_timeout(dlci, generation).await
            }
            SessionEvent::MuxCommandTimeout { key, generation } => {
                self.handle_mux_command_timeout(key, generation).await
            }
            SessionEvent::StartupRetry => {
                if self.role == Role::Unassigned && !self.pending_opens.is_empty() {
                    self.start_multiplexer().await
                } else {
                    Ok(())
                }
            }
            SessionEvent::Closedown => {
                if self.role.is_multiplexer_started() {
                    // Best-effort DISC; the peer may already be gone.
                    let _ = self.send_frame(Frame::disc(self.role, Dlci::MUX_CONTROL)).await;
                }
                self.closedown("local close requested").await;
                Ok(())
            }
        }
    }

    async fn handle_frame_timeout(&mut self, dlci: Dlci, generation: u64) -> RfcommResult<()> {
        let live = self
            .outstanding_frames
            .get(&dlci)
            .map_or(false, |outstanding| outstanding.generation == generation);
        if !live {
            // Already resolved by a response; the timer fired late.
            return Ok(());
        }
        let outstanding = self.outstanding_frames.remove(&dlci).expect("checked above");
        self.stats().increment_timeouts();
        warn!("Response timeout on {}, closing session", dlci);
        if let FrameAction::OpenChannel { reply } = outstanding.action {
            let _ = reply.send(Err(RfcommError::Timeout));
        }
        self.closedown("response timeout").await;
        Ok(())
    }

    async fn handle_mux_command_timeout(
        &mut self,
        key: OutstandingCommandKey,
        generation: u64,
    ) -> RfcommResult<()> {
        let live = self
            .outstanding_mux_commands
            .get(&key)
            .map_or(false, |outstanding| outstanding.generation == generation);
        if !live {
            return Ok(());
        }
        self.outstanding_mux_commands.remove(&key);
        self.stats().increment_timeouts();
        warn!("{:?} command timed out, closing session", key.0);
        self.closedown("multiplexer command timeout").await;
        Ok(())
    }

    fn arm_frame_timer(&self, dlci: Dlci, generation: u64, duration: Duration) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = event_tx.send(SessionEvent::FrameTimeout { dlci, generation }).await;
        });
    }

    fn arm_mux_command_timer(&self, key: OutstandingCommandKey, generation: u64) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(MUX_COMMAND_TIMEOUT).await;
            let _ = event_tx.send(SessionEvent::MuxCommandTimeout { key, generation }).await;
        });
    }

    /// Resolve everything still pending and close the carrier. All user
    /// channel streams end; all waiting opens fail with `SessionClosed`.
    async fn closedown(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("Session closedown: {}", reason);

        for (_, outstanding) in self.outstanding_frames.drain() {
            if let FrameAction::OpenChannel { reply } = outstanding.action {
                let _ = reply.send(Err(RfcommError::SessionClosed));
            }
        }
        self.outstanding_mux_commands.clear();
        for (_, reply) in self.pending_opens.drain(..) {
            let _ = reply.send(Err(RfcommError::SessionClosed));
        }
        for (_, mut channel) in self.channels.drain() {
            channel.detach_user();
        }
        if let Err(error) = self.l2cap.close().await {
            debug!("Error closing underlying channel: {}", error);
        }
    }

    // -- Sending ------------------------------------------------------------

    async fn send_frame(&mut self, frame: Frame) -> RfcommResult<()> {
        let encoded = frame.encode(self.credit_based_flow)?;
        self.l2cap.send(&encoded).await?;
        self.stats().increment_frames_sent();
        Ok(())
    }

    /// Send a multiplexer command and record it as outstanding with a T2
    /// timer. At most one command per (type, DLCI) may be in flight.
    async fn send_mux_command(&mut self, params: MuxCommandParams) -> RfcommResult<()> {
        let key = (params.command_type(), params.dlci());
        if self.outstanding_mux_commands.contains_key(&key) {
            return Err(RfcommError::CommandAlreadyOutstanding(
                key.1.unwrap_or(Dlci::MUX_CONTROL),
            ));
        }
        let generation = self.next_generation();
        self.outstanding_mux_commands.insert(key, OutstandingMuxCommand { generation });
        self.arm_mux_command_timer(key, generation);

        let command = MuxCommand { params, command_response: CommandResponse::Command };
        self.stats().increment_mux_commands_sent();
        self.send_frame(Frame::mux_command(self.role, command)).await
    }

    async fn send_mux_response(&mut self, params: MuxCommandParams) -> RfcommResult<()> {
        let command = MuxCommand { params, command_response: CommandResponse::Response };
        self.stats().increment_mux_commands_sent();
        self.send_frame(Frame::mux_command(self.role, command)).await
    }

    // -- Test accessors -----------------------------------------------------

    #[cfg(test)]
    pub(crate) fn role(&self) -> Role {
        self.role
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    #[cfg(test)]
    pub(crate) fn outstanding_frame_generation(&self, dlci: Dlci) -> Option<u64> {
        self.outstanding_frames.get(&dlci).map(|outstanding| outstanding.generation)
    }

    #[cfg(test)]
    pub(crate) fn channel_credits(&self, dlci: Dlci) -> Option<(usize, usize)> {
        self.channels.get(&dlci).map(|c| (c.local_credits(), c.remote_credits()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux_commands::TestCommandParams;
    use crate::test_util::{MockChannel, SentFrames};
    use std::sync::atomic::{AtomicBool, Ordering};

    const TEST_MTU: u16 = 672;

    fn new_session() -> (Session, SessionHandle, SentFrames, Arc<AtomicBool>) {
        let (mock, sent, l2cap_closed) = MockChannel::new(TEST_MTU);
        let (_sdu_tx, sdu_rx) = mpsc::channel(8);
        let (session, handle) = Session::new(SessionConfig::default(), Box::new(mock), sdu_rx);
        (session, handle, sent, l2cap_closed)
    }

    fn open_event(
        server_channel: u8,
    ) -> (SessionEvent, oneshot::Receiver<RfcommResult<UserChannel>>) {
        let (reply, response) = oneshot::channel();
        let server_channel = ServerChannel::try_from(server_channel).unwrap();
        (SessionEvent::OpenRemoteChannel { server_channel, reply }, response)
    }

    fn pn_response_frame(dlci: Dlci, max_frame_size: u16, initial_credits: u8) -> Frame {
        let params = ParameterNegotiationParams {
            dlci,
            credit_based_flow_handshake: CreditBasedFlowHandshake::SupportedResponse,
            priority: default_priority(dlci),
            maximum_frame_size: max_frame_size,
            initial_credits,
        };
        Frame::mux_command(
            Role::Responder,
            MuxCommand {
                params: MuxCommandParams::ParameterNegotiation(params),
                command_response: CommandResponse::Response,
            },
        )
    }

    fn data_frame(dlci: Dlci, payload: &[u8], credits: Option<u8>) -> Frame {
        let mut frame = Frame::user_data(Role::Responder, dlci, payload.to_vec());
        if let Some(credits) = credits {
            frame.set_credits(credits);
        }
        frame
    }

    /// Drive a session through startup, initial PN, and one user channel
    /// open for server channel 5 (DLCI 10 as initiator).
    async fn establish_first_channel(
        session: &mut Session,
        sent: &SentFrames,
    ) -> (Dlci, UserChannel) {
        let (event, response) = open_event(5);
        session.handle_event(event).await.unwrap();
        let frames = sent.decode(false, Role::Negotiating);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::SetAsynchronousBalancedMode);
        assert!(frames[0].dlci.is_mux_control());

        session.handle_frame(Frame::ua(Role::Unassigned, Dlci::MUX_CONTROL)).await.unwrap();
        assert_eq!(session.role(), Role::Initiator);

        // Exactly one PN command gates the open; no SABM yet.
        let frames = sent.decode(false, Role::Initiator);
        assert_eq!(frames.len(), 1);
        let dlci = match &frames[0].content {
            FrameContent::Mux(command) => {
                assert_eq!(command.command_type(), MuxCommandType::DlcParameterNegotiation);
                assert_eq!(command.command_response, CommandResponse::Command);
                command.dlci().unwrap()
            }
            other => panic!("expected PN command, got {:?}", other),
        };
        assert_eq!(u8::from(dlci), 10);

        session.handle_frame(pn_response_frame(dlci, 600, 7)).await.unwrap();
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::SetAsynchronousBalancedMode);
        assert_eq!(frames[0].dlci, dlci);

        session.handle_frame(Frame::ua(Role::Responder, dlci)).await.unwrap();
        let user_channel = response.await.unwrap().unwrap();
        assert_eq!(user_channel.dlci(), dlci);

        // Establishment tops the peer up to the high water mark.
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].credits, Some(93));
        assert_eq!(frames[0].information_length(), 0);
        assert_eq!(session.channel_credits(dlci), Some((7, 100)));

        (dlci, user_channel)
    }

    #[tokio::test]
    async fn test_startup_negotiation_and_open() {
        let (mut session, _handle, sent, _) = new_session();
        let (dlci, user_channel) = establish_first_channel(&mut session, &sent).await;
        assert!(!session.is_closed());
        assert_eq!(session.channel_credits(dlci), Some((7, 100)));
        // Negotiated 600, minus the credit octet.
        assert_eq!(user_channel.max_frame_size(), 599);
    }

    #[tokio::test]
    async fn test_initial_negotiation_gates_multiple_opens() {
        let (mut session, _handle, sent, _) = new_session();

        let (first, first_response) = open_event(5);
        let (second, second_response) = open_event(7);
        session.handle_event(first).await.unwrap();
        session.handle_event(second).await.unwrap();

        // One SABM on the control channel, not two.
        let frames = sent.decode(false, Role::Negotiating);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].dlci.is_mux_control());

        session.handle_frame(Frame::ua(Role::Unassigned, Dlci::MUX_CONTROL)).await.unwrap();

        // One PN command and no SABMs until it resolves.
        let frames = sent.decode(false, Role::Initiator);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0].content, FrameContent::Mux(_)));

        let dlci = ServerChannel::try_from(5).unwrap().to_dlci(Role::Initiator).unwrap();
        session.handle_frame(pn_response_frame(dlci, 600, 7)).await.unwrap();

        // Both parked opens proceed, each with its own SABM.
        let frames = sent.decode(true, Role::Initiator);
        let sabm_dlcis: Vec<u8> = frames
            .iter()
            .filter(|f| f.frame_type == FrameType::SetAsynchronousBalancedMode)
            .map(|f| u8::from(f.dlci))
            .collect();
        assert_eq!(sabm_dlcis, vec![10, 14]);

        session.handle_frame(Frame::ua(Role::Responder, dlci)).await.unwrap();
        let second_dlci = ServerChannel::try_from(7).unwrap().to_dlci(Role::Initiator).unwrap();
        session.handle_frame(Frame::ua(Role::Responder, second_dlci)).await.unwrap();
        assert!(first_response.await.unwrap().is_ok());
        assert!(second_response.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_at_most_one_open_per_dlci() {
        let (mut session, _handle, sent, _) = new_session();

        let (first, _first_response) = open_event(5);
        let (second, second_response) = open_event(5);
        session.handle_event(first).await.unwrap();
        session.handle_event(second).await.unwrap();
        session.handle_frame(Frame::ua(Role::Unassigned, Dlci::MUX_CONTROL)).await.unwrap();

        let dlci = ServerChannel::try_from(5).unwrap().to_dlci(Role::Initiator).unwrap();
        session.handle_frame(pn_response_frame(dlci, 600, 7)).await.unwrap();

        // The first open holds the DLCI; the second fails immediately.
        match second_response.await.unwrap() {
            Err(RfcommError::CommandAlreadyOutstanding(failed)) => assert_eq!(failed, dlci),
            other => panic!("expected CommandAlreadyOutstanding, got {:?}", other),
        }
        let frames = sent.decode(true, Role::Initiator);
        let sabm_count = frames
            .iter()
            .filter(|f| f.frame_type == FrameType::SetAsynchronousBalancedMode)
            .count();
        // Control channel plus exactly one user DLCI.
        assert_eq!(sabm_count, 2);
    }

    #[tokio::test]
    async fn test_stale_timeout_is_ignored() {
        let (mut session, _handle, sent, _) = new_session();
        let (dlci, _user_channel) = establish_first_channel(&mut session, &sent).await;

        // The open resolved; a late timer for its exchange must be a no-op.
        session
            .handle_event(SessionEvent::FrameTimeout { dlci, generation: 2 })
            .await
            .unwrap();
        session
            .handle_event(SessionEvent::FrameTimeout { dlci, generation: 999 })
            .await
            .unwrap();
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_open_timeout_closes_session() {
        let (mut session, _handle, sent, l2cap_closed) = new_session();

        let (event, response) = open_event(5);
        session.handle_event(event).await.unwrap();
        session.handle_frame(Frame::ua(Role::Unassigned, Dlci::MUX_CONTROL)).await.unwrap();
        let dlci = ServerChannel::try_from(5).unwrap().to_dlci(Role::Initiator).unwrap();
        session.handle_frame(pn_response_frame(dlci, 600, 7)).await.unwrap();
        sent.take();

        let generation = session.outstanding_frame_generation(dlci).unwrap();
        session
            .handle_event(SessionEvent::FrameTimeout { dlci, generation })
            .await
            .unwrap();

        assert!(matches!(response.await.unwrap(), Err(RfcommError::Timeout)));
        assert!(session.is_closed());
        assert!(l2cap_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_credit_gating_and_flush() {
        let (mut session, _handle, sent, _) = new_session();
        let (dlci, _user_channel) = establish_first_channel(&mut session, &sent).await;

        // 7 local credits: the 8th nonempty payload must queue.
        for i in 0u8..8 {
            session
                .handle_event(SessionEvent::UserData { dlci, data: Bytes::from(vec![i]) })
                .await
                .unwrap();
        }
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 7);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.content, FrameContent::UserData(vec![i as u8]));
        }
        assert_eq!(session.channel_credits(dlci).unwrap().0, 0);

        // A credit grant flushes the queue in order.
        session.handle_frame(data_frame(dlci, &[], Some(5))).await.unwrap();
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].content, FrameContent::UserData(vec![7]));
        assert_eq!(session.channel_credits(dlci).unwrap().0, 4);
    }

    #[tokio::test]
    async fn test_low_water_replenishment() {
        let (mut session, _handle, sent, _) = new_session();
        let (dlci, mut user_channel) = establish_first_channel(&mut session, &sent).await;

        // Drain the peer's balance from 100 towards the low water mark. The
        // inbound frames carry one payload byte each and no credit grant.
        for i in 0..89 {
            session.handle_frame(data_frame(dlci, &[0xAA], None)).await.unwrap();
            assert_eq!(sent.count(), 0, "unexpected send after frame {}", i);
        }
        // The 90th frame drops the balance to 10: an empty frame must
        // spontaneously grant credits back up to the high mark.
        session.handle_frame(data_frame(dlci, &[0xAA], None)).await.unwrap();
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].information_length(), 0);
        assert_eq!(frames[0].credits, Some(90));
        assert_eq!(session.channel_credits(dlci).unwrap().1, 100);

        // All 90 payloads reached the user in order.
        for _ in 0..90 {
            assert_eq!(user_channel.receive().await.unwrap(), Bytes::from_static(&[0xAA]));
        }
    }

    #[tokio::test]
    async fn test_startup_conflict_backs_off_and_retries() {
        let (mut session, _handle, sent, _) = new_session();

        let (event, _response) = open_event(5);
        session.handle_event(event).await.unwrap();
        assert_eq!(session.role(), Role::Negotiating);
        sent.take();

        // Peer's SABM crosses ours: refuse with DM and revert.
        session
            .handle_frame(Frame::sabm(Role::Unassigned, Dlci::MUX_CONTROL))
            .await
            .unwrap();
        let frames = sent.decode(false, Role::Unassigned);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::DisconnectedMode);
        assert_eq!(session.role(), Role::Unassigned);

        // After the back-off the startup attempt repeats.
        session.handle_event(SessionEvent::StartupRetry).await.unwrap();
        let frames = sent.decode(false, Role::Negotiating);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::SetAsynchronousBalancedMode);
        assert!(frames[0].dlci.is_mux_control());
        assert_eq!(session.role(), Role::Negotiating);
    }

    #[tokio::test]
    async fn test_lost_conflict_dispatches_pending_open_as_responder() {
        let (mut session, _handle, sent, _) = new_session();

        let (event, response) = open_event(5);
        session.handle_event(event).await.unwrap();
        sent.take();

        // Conflict: the peer's SABM crosses ours and we back off.
        session
            .handle_frame(Frame::sabm(Role::Unassigned, Dlci::MUX_CONTROL))
            .await
            .unwrap();
        assert_eq!(session.role(), Role::Unassigned);
        sent.take();

        // The peer retries first and wins startup; the parked open must
        // proceed under its multiplexer instead of waiting forever.
        session
            .handle_frame(Frame::sabm(Role::Unassigned, Dlci::MUX_CONTROL))
            .await
            .unwrap();
        assert_eq!(session.role(), Role::Responder);
        let frames = sent.decode(false, Role::Responder);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, FrameType::UnnumberedAcknowledgement);
        let dlci = match &frames[1].content {
            FrameContent::Mux(command) => {
                assert_eq!(command.command_type(), MuxCommandType::DlcParameterNegotiation);
                command.dlci().unwrap()
            }
            other => panic!("expected PN command, got {:?}", other),
        };
        assert_eq!(u8::from(dlci), 11);

        // Our own delayed retry is a no-op now.
        session.handle_event(SessionEvent::StartupRetry).await.unwrap();
        assert_eq!(sent.count(), 0);

        session.handle_frame(pn_response_frame(dlci, 600, 7)).await.unwrap();
        let frames = sent.decode(true, Role::Responder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::SetAsynchronousBalancedMode);
        assert_eq!(frames[0].dlci, dlci);

        session.handle_frame(Frame::ua(Role::Initiator, dlci)).await.unwrap();
        let user_channel = response.await.unwrap().unwrap();
        assert_eq!(user_channel.dlci(), dlci);
    }

    #[tokio::test]
    async fn test_pn_response_raising_frame_size_is_rejected() {
        let (mut session, _handle, sent, _) = new_session();

        let (event, response) = open_event(5);
        session.handle_event(event).await.unwrap();
        session.handle_frame(Frame::ua(Role::Unassigned, Dlci::MUX_CONTROL)).await.unwrap();
        sent.take();

        // The response claims a larger frame size than we proposed.
        let dlci = ServerChannel::try_from(5).unwrap().to_dlci(Role::Initiator).unwrap();
        session.handle_frame(pn_response_frame(dlci, 5000, 7)).await.unwrap();

        let frames = sent.decode(false, Role::Initiator);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::DisconnectedMode);
        assert_eq!(frames[0].dlci, dlci);
        assert!(matches!(
            response.await.unwrap(),
            Err(RfcommError::NegotiationRejected(_))
        ));
        // The session survives and may renegotiate later.
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_divergent_pn_after_negotiation_gets_dm() {
        let (mut session, _handle, sent, _) = new_session();
        let (_dlci, _user_channel) = establish_first_channel(&mut session, &sent).await;

        // The session frame size is fixed at 600; a later PN must match it.
        let new_dlci = Dlci::try_from(15).unwrap();
        let params = ParameterNegotiationParams {
            dlci: new_dlci,
            credit_based_flow_handshake: CreditBasedFlowHandshake::SupportedRequest,
            priority: default_priority(new_dlci),
            maximum_frame_size: 100,
            initial_credits: 7,
        };
        session
            .handle_frame(Frame::mux_command(
                Role::Responder,
                MuxCommand {
                    params: MuxCommandParams::ParameterNegotiation(params),
                    command_response: CommandResponse::Command,
                },
            ))
            .await
            .unwrap();
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::DisconnectedMode);
        assert_eq!(frames[0].dlci, new_dlci);

        // A proposal matching the fixed size is still answered.
        let params = ParameterNegotiationParams { maximum_frame_size: 600, ..params };
        session
            .handle_frame(Frame::mux_command(
                Role::Responder,
                MuxCommand {
                    params: MuxCommandParams::ParameterNegotiation(params),
                    command_response: CommandResponse::Command,
                },
            ))
            .await
            .unwrap();
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 1);
        match &frames[0].content {
            FrameContent::Mux(command) => {
                assert_eq!(command.command_type(), MuxCommandType::DlcParameterNegotiation);
                assert_eq!(command.command_response, CommandResponse::Response);
            }
            other => panic!("expected PN response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reopen_of_established_dlci_gets_dm_and_disc() {
        let (mut session, _handle, sent, _) = new_session();
        let (dlci, mut user_channel) = establish_first_channel(&mut session, &sent).await;

        session.handle_frame(Frame::sabm(Role::Responder, dlci)).await.unwrap();
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, FrameType::DisconnectedMode);
        assert_eq!(frames[1].frame_type, FrameType::Disconnect);
        assert_eq!(frames[1].dlci, dlci);
        // The DISC is correlated like a local close, and the user stream
        // ends.
        assert!(session.outstanding_frame_generation(dlci).is_some());
        assert!(user_channel.receive().await.is_none());

        session.handle_frame(Frame::ua(Role::Responder, dlci)).await.unwrap();
        assert!(session.outstanding_frame_generation(dlci).is_none());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_sabm_on_started_mux_is_refused() {
        let (mut session, _handle, sent, _) = new_session();
        let (_dlci, _user_channel) = establish_first_channel(&mut session, &sent).await;

        session
            .handle_frame(Frame::sabm(Role::Responder, Dlci::MUX_CONTROL))
            .await
            .unwrap();
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::DisconnectedMode);
        assert_eq!(session.role(), Role::Initiator);
    }

    #[tokio::test]
    async fn test_inbound_open_as_responder() {
        let (mut session, mut handle, sent, _) = new_session();

        // Peer starts the multiplexer.
        session
            .handle_frame(Frame::sabm(Role::Unassigned, Dlci::MUX_CONTROL))
            .await
            .unwrap();
        assert_eq!(session.role(), Role::Responder);
        let frames = sent.decode(false, Role::Responder);
        assert_eq!(frames[0].frame_type, FrameType::UnnumberedAcknowledgement);

        // Peer negotiates and opens DLCI 10: server channel 5 on the local
        // (responder) side, so the direction bit is 0.
        let dlci = Dlci::try_from(10).unwrap();
        let params = ParameterNegotiationParams {
            dlci,
            credit_based_flow_handshake: CreditBasedFlowHandshake::SupportedRequest,
            priority: default_priority(dlci),
            maximum_frame_size: 400,
            initial_credits: 7,
        };
        session
            .handle_frame(Frame::mux_command(
                Role::Initiator,
                MuxCommand {
                    params: MuxCommandParams::ParameterNegotiation(params),
                    command_response: CommandResponse::Command,
                },
            ))
            .await
            .unwrap();
        let frames = sent.decode(true, Role::Responder);
        assert_eq!(frames.len(), 1);
        match &frames[0].content {
            FrameContent::Mux(command) => {
                assert_eq!(command.command_response, CommandResponse::Response);
                match &command.params {
                    MuxCommandParams::ParameterNegotiation(response) => {
                        assert_eq!(
                            response.credit_based_flow_handshake,
                            CreditBasedFlowHandshake::SupportedResponse
                        );
                        assert_eq!(response.maximum_frame_size, 400);
                        assert_eq!(response.initial_credits, MAX_INITIAL_CREDITS);
                    }
                    other => panic!("expected PN response, got {:?}", other),
                }
            }
            other => panic!("expected mux response, got {:?}", other),
        }

        session.handle_frame(Frame::sabm(Role::Initiator, dlci)).await.unwrap();
        let frames = sent.decode(true, Role::Responder);
        assert_eq!(frames[0].frame_type, FrameType::UnnumberedAcknowledgement);

        let user_channel = handle.accept_inbound_channel().await.unwrap();
        assert_eq!(user_channel.dlci(), dlci);
        // One octet of the negotiated frame size is reserved for credits.
        assert_eq!(user_channel.max_frame_size(), 399);
    }

    #[tokio::test]
    async fn test_invalid_direction_bit_gets_dm() {
        let (mut session, _handle, sent, _) = new_session();
        session
            .handle_frame(Frame::sabm(Role::Unassigned, Dlci::MUX_CONTROL))
            .await
            .unwrap();
        sent.take();

        // As responder, inbound user DLCIs must carry direction bit 0.
        let wrong = Dlci::try_from(11).unwrap();
        session.handle_frame(Frame::sabm(Role::Initiator, wrong)).await.unwrap();
        let frames = sent.decode(false, Role::Responder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::DisconnectedMode);
        assert_eq!(frames[0].dlci, wrong);
    }

    #[tokio::test]
    async fn test_user_data_on_unknown_dlci_gets_dm() {
        let (mut session, _handle, sent, _) = new_session();
        let (_dlci, _user_channel) = establish_first_channel(&mut session, &sent).await;

        let stray = Dlci::try_from(20).unwrap();
        session.handle_frame(data_frame(stray, &[0x01], None)).await.unwrap();
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::DisconnectedMode);
        assert_eq!(frames[0].dlci, stray);
    }

    #[tokio::test]
    async fn test_test_command_is_echoed() {
        let (mut session, _handle, sent, _) = new_session();
        let (_dlci, _user_channel) = establish_first_channel(&mut session, &sent).await;

        let pattern = vec![0xDE, 0xAD];
        session
            .handle_frame(Frame::mux_command(
                Role::Responder,
                MuxCommand {
                    params: MuxCommandParams::Test(TestCommandParams {
                        test_data: pattern.clone(),
                    }),
                    command_response: CommandResponse::Command,
                },
            ))
            .await
            .unwrap();
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 1);
        match &frames[0].content {
            FrameContent::Mux(command) => {
                assert_eq!(command.command_response, CommandResponse::Response);
                assert_eq!(
                    command.params,
                    MuxCommandParams::Test(TestCommandParams { test_data: pattern })
                );
            }
            other => panic!("expected mux response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_disc_tears_channel_down() {
        let (mut session, _handle, sent, _) = new_session();
        let (dlci, mut user_channel) = establish_first_channel(&mut session, &sent).await;

        session.handle_frame(Frame::disc(Role::Responder, dlci)).await.unwrap();
        let frames = sent.decode(true, Role::Initiator);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::UnnumberedAcknowledgement);

        // The user's receive stream ends; the session stays up.
        assert!(user_channel.receive().await.is_none());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_closedown_resolves_pending_opens() {
        let (mut session, _handle, sent, l2cap_closed) = new_session();

        let (event, response) = open_event(5);
        session.handle_event(event).await.unwrap();
        sent.take();

        session.handle_event(SessionEvent::Closedown).await.unwrap();
        assert!(session.is_closed());
        assert!(l2cap_closed.load(Ordering::SeqCst));
        assert!(matches!(response.await.unwrap(), Err(RfcommError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_send_failure_tears_the_session_down() {
        let (mock, _sent, l2cap_closed) = MockChannel::new(TEST_MTU);
        let (_sdu_tx, sdu_rx) = mpsc::channel(8);
        let (session, handle) = Session::new(SessionConfig::default(), Box::new(mock), sdu_rx);

        // The carrier dies before the first send.
        l2cap_closed.store(true, Ordering::SeqCst);
        let task = tokio::spawn(session.run());

        // The failed startup SABM tears the session down uniformly; the
        // open resolves instead of hanging on a dropped reply.
        let result = handle
            .open_remote_channel(ServerChannel::try_from(5).unwrap())
            .await;
        assert!(matches!(result, Err(RfcommError::SessionClosed)));
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_bad_fcs_counted_and_dropped() {
        let (mut session, handle, sent, _) = new_session();
        let (_dlci, _user_channel) = establish_first_channel(&mut session, &sent).await;

        let mut sdu =
            Frame::user_data(Role::Responder, Dlci::try_from(10).unwrap(), vec![0x01])
                .encode(true)
                .unwrap();
        let last = sdu.len() - 1;
        sdu[last] ^= 0xFF;
        session.handle_sdu(&sdu).await.unwrap();

        assert_eq!(sent.count(), 0);
        let stats = handle.statistics();
        assert_eq!(stats.fcs_errors, 1);
        assert_eq!(stats.frames_rejected, 1);
        assert!(!session.is_closed());
    }
}
