//! Message transport.
//!
//! [`Transport::send`] delivers one frame and resolves once the receiver
//! acknowledged it. The receiving side hands each frame to a
//! [`FrameHandler`]; a successful return is what gets acknowledged, so
//! acknowledgement happens once the frame is deduplicated and persisted,
//! independent of how processing later turns out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::frame::{read_frame, write_frame, TransportMessage, WireFrame};
use crate::{ReceiveError, TransportError};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, address: &str, frame: WireFrame) -> Result<(), TransportError>;
}

#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Accept a frame. `Ok` acknowledges receipt to the sender.
    async fn on_frame(&self, frame: WireFrame) -> Result<(), ReceiveError>;
}

/// TCP transport: one connection per delivery attempt.
pub struct TcpTransport {
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, ack_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ack_timeout,
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, address: &str, frame: WireFrame) -> Result<(), TransportError> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Connect {
                address: address.to_string(),
                reason: "connect timeout".into(),
            })?
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let msg_id = frame.msg_id.clone();
        write_frame(&mut stream, &TransportMessage::Data(frame)).await?;

        let reply = tokio::time::timeout(self.ack_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| TransportError::AckTimeout(self.ack_timeout))??;
        match reply {
            Some(TransportMessage::Ack { msg_id: acked }) if acked == msg_id => Ok(()),
            Some(TransportMessage::Refused { reason, .. }) => Err(TransportError::Refused(reason)),
            Some(other) => Err(TransportError::Encoding(format!(
                "unexpected reply to {msg_id}: {other:?}"
            ))),
            None => Err(TransportError::Refused("connection closed before ack".into())),
        }
    }
}

/// Accept TCP connections and feed their frames to `handler` until shutdown.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn FrameHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!(addr = %local, "transport listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, handler).await {
                            debug!(%peer, error = %e, "inbound connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.recv() => {
                info!("transport listener stopped");
                return;
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn FrameHandler>,
) -> Result<(), TransportError> {
    while let Some(message) = read_frame(&mut stream).await? {
        let TransportMessage::Data(frame) = message else {
            warn!(%peer, "ignoring non-data frame from peer");
            continue;
        };
        let msg_id = frame.msg_id.clone();
        let reply = match handler.on_frame(frame).await {
            Ok(()) => TransportMessage::Ack { msg_id },
            Err(e) => TransportMessage::Refused {
                msg_id,
                reason: e.to_string(),
            },
        };
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}
