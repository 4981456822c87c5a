//! SDU framing over a byte stream
//!
//! Carries RFCOMM SDUs over any reliable byte stream (TCP, a pty, a duplex
//! pipe) by prefixing each SDU with a 2-byte big-endian length. This restores
//! the message boundaries an L2CAP channel provides natively.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use rfcomm_core::{RfcommError, RfcommResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;

use crate::channel::{L2capChannel, SduReceiver};

/// Queue depth of the inbound SDU queue.
const CHANNEL_CAPACITY: usize = 128;

/// An RFCOMM carrier over a byte stream, with 2-byte length-prefixed SDUs.
pub struct StreamChannel<S: AsyncRead + AsyncWrite + Send + 'static> {
    writer: Option<WriteHalf<S>>,
    mtu: u16,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> StreamChannel<S> {
    /// Wrap `stream`, spawning a reader task that delivers inbound SDUs on
    /// the returned receiver. The receiver closes when the stream ends or a
    /// framing error occurs.
    pub fn new(stream: S, mtu: u16) -> (Self, SduReceiver) {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(read_loop(reader, tx, mtu));
        (Self { writer: Some(writer), mtu }, rx)
    }
}

async fn read_loop<R: AsyncRead + Send + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<Bytes>,
    mtu: u16,
) {
    loop {
        let mut len_buf = [0u8; 2];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) => {
                debug!("stream channel reader finished: {}", e);
                return;
            }
        }
        let len = usize::from(u16::from_be_bytes(len_buf));
        if len > usize::from(mtu) {
            warn!("inbound SDU length {} exceeds RX MTU {}, closing", len, mtu);
            return;
        }
        let mut sdu = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut sdu).await {
            debug!("stream channel reader finished mid-SDU: {}", e);
            return;
        }
        if tx.send(Bytes::from(sdu)).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> L2capChannel for StreamChannel<S> {
    async fn send(&mut self, sdu: &[u8]) -> RfcommResult<()> {
        if sdu.len() > usize::from(self.mtu) {
            return Err(RfcommError::InvalidData(format!(
                "SDU of {} bytes exceeds TX MTU {}",
                sdu.len(),
                self.mtu
            )));
        }
        let writer = self.writer.as_mut().ok_or_else(|| {
            RfcommError::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "stream channel is closed",
            ))
        })?;
        let len = sdu.len() as u16;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(sdu).await?;
        writer.flush().await?;
        Ok(())
    }

    fn max_tx_sdu_size(&self) -> u16 {
        self.mtu
    }

    fn max_rx_sdu_size(&self) -> u16 {
        self.mtu
    }

    fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    async fn close(&mut self) -> RfcommResult<()> {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }
}
