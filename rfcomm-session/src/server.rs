//! Routing of connection handles to sessions
//!
//! The channel manager is a thin layer above [`Session`]: one session per
//! connection handle, created lazily for outbound opens and explicitly for
//! channels accepted from peers, plus the allocator for local server
//! channel numbers.

use std::collections::{HashMap, HashSet};

use log::info;

use rfcomm_core::{ConnectionHandle, RfcommError, RfcommResult, ServerChannel};
use rfcomm_transport::{L2capChannel, L2capConnector, SduReceiver};

use crate::channel::UserChannel;
use crate::session::{Session, SessionConfig, SessionHandle};

/// Owns every RFCOMM session and the local server channel space.
pub struct ChannelManager {
    connector: Box<dyn L2capConnector>,
    config: SessionConfig,
    sessions: HashMap<ConnectionHandle, SessionHandle>,
    allocated_server_channels: HashSet<ServerChannel>,
}

impl ChannelManager {
    pub fn new(connector: Box<dyn L2capConnector>, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            sessions: HashMap::new(),
            allocated_server_channels: HashSet::new(),
        }
    }

    /// Start a session over an underlying channel that already exists,
    /// typically one the peer opened towards us. Fails if a live session is
    /// already bound to `handle`.
    pub fn register_underlying_channel(
        &mut self,
        handle: ConnectionHandle,
        l2cap: Box<dyn L2capChannel>,
        sdu_rx: SduReceiver,
    ) -> RfcommResult<()> {
        if self.session_is_active(handle) {
            return Err(RfcommError::MultiplexerAlreadyStarted);
        }
        self.spawn_session(handle, l2cap, sdu_rx);
        Ok(())
    }

    /// Open a channel to `server_channel` on the peer at `handle`, creating
    /// the session (and its underlying channel) on demand.
    pub async fn open_remote_channel(
        &mut self,
        handle: ConnectionHandle,
        server_channel: ServerChannel,
    ) -> RfcommResult<UserChannel> {
        if !self.session_is_active(handle) {
            let (l2cap, sdu_rx) = self.connector.connect(handle).await?;
            self.spawn_session(handle, l2cap, sdu_rx);
        }
        let session = self.sessions.get(&handle).expect("session just ensured");
        session.open_remote_channel(server_channel).await
    }

    /// The next channel the peer at `handle` opened towards a local server.
    pub async fn accept_inbound_channel(
        &mut self,
        handle: ConnectionHandle,
    ) -> RfcommResult<UserChannel> {
        let session = self
            .sessions
            .get_mut(&handle)
            .ok_or(RfcommError::MultiplexerNotStarted)?;
        session.accept_inbound_channel().await.ok_or(RfcommError::SessionClosed)
    }

    /// Reserve the lowest free local server channel number, if any remain.
    pub fn allocate_local_server_channel(&mut self) -> Option<ServerChannel> {
        let server_channel =
            ServerChannel::all().find(|sc| !self.allocated_server_channels.contains(sc))?;
        self.allocated_server_channels.insert(server_channel);
        Some(server_channel)
    }

    /// Return a server channel number to the free pool.
    pub fn free_local_server_channel(&mut self, server_channel: ServerChannel) {
        self.allocated_server_channels.remove(&server_channel);
    }

    /// Whether a live session exists for `handle`.
    pub fn session_is_active(&self, handle: ConnectionHandle) -> bool {
        self.sessions.get(&handle).map_or(false, SessionHandle::is_active)
    }

    /// Close the session for `handle`, if one exists.
    pub async fn close_session(&mut self, handle: ConnectionHandle) -> RfcommResult<()> {
        match self.sessions.remove(&handle) {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    fn spawn_session(
        &mut self,
        handle: ConnectionHandle,
        l2cap: Box<dyn L2capChannel>,
        sdu_rx: SduReceiver,
    ) {
        info!("Starting session for {}", handle);
        let (session, session_handle) = Session::new(self.config.clone(), l2cap, sdu_rx);
        tokio::spawn(session.run());
        self.sessions.insert(handle, session_handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rfcomm_transport::MemoryChannel;

    struct MemoryConnector;

    #[async_trait]
    impl L2capConnector for MemoryConnector {
        async fn connect(
            &mut self,
            _handle: ConnectionHandle,
        ) -> RfcommResult<(Box<dyn L2capChannel>, SduReceiver)> {
            let ((local, local_rx), _remote) = MemoryChannel::pair(672);
            Ok((Box::new(local), local_rx))
        }
    }

    fn new_manager() -> ChannelManager {
        ChannelManager::new(Box::new(MemoryConnector), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let mut manager = new_manager();
        let handle = ConnectionHandle(0x0001);

        let ((channel, sdu_rx), _remote) = MemoryChannel::pair(672);
        manager
            .register_underlying_channel(handle, Box::new(channel), sdu_rx)
            .unwrap();
        assert!(manager.session_is_active(handle));

        let ((channel, sdu_rx), _remote) = MemoryChannel::pair(672);
        assert!(matches!(
            manager.register_underlying_channel(handle, Box::new(channel), sdu_rx),
            Err(RfcommError::MultiplexerAlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_registration_allowed_after_close() {
        let mut manager = new_manager();
        let handle = ConnectionHandle(0x0002);

        let ((channel, sdu_rx), _remote) = MemoryChannel::pair(672);
        manager
            .register_underlying_channel(handle, Box::new(channel), sdu_rx)
            .unwrap();
        manager.close_session(handle).await.unwrap();

        let ((channel, sdu_rx), _remote) = MemoryChannel::pair(672);
        assert!(manager
            .register_underlying_channel(handle, Box::new(channel), sdu_rx)
            .is_ok());
    }

    #[test]
    fn test_server_channel_allocation_first_fit() {
        let mut manager = new_manager();

        let first = manager.allocate_local_server_channel().unwrap();
        let second = manager.allocate_local_server_channel().unwrap();
        assert_eq!(u8::from(first), 1);
        assert_eq!(u8::from(second), 2);

        manager.free_local_server_channel(first);
        let reused = manager.allocate_local_server_channel().unwrap();
        assert_eq!(reused, first);
    }

    #[test]
    fn test_server_channel_space_exhaustion() {
        let mut manager = new_manager();
        for _ in 0..30 {
            assert!(manager.allocate_local_server_channel().is_some());
        }
        assert!(manager.allocate_local_server_channel().is_none());
    }

    #[tokio::test]
    async fn test_accept_without_session_fails() {
        let mut manager = new_manager();
        assert!(matches!(
            manager.accept_inbound_channel(ConnectionHandle(0x0009)).await,
            Err(RfcommError::MultiplexerNotStarted)
        ));
    }
}
