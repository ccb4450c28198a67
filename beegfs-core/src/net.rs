//! Request/response messaging over TCP
//!
//! Each message is one line of JSON. A connection carries any number of
//! request/response pairs in order. Byte layout is not part of any contract;
//! only the message tags are.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BeegfsError, Result};
use crate::msg::{MessageType, NetMessage};

/// Longest accepted line; resync file blocks are 1 MiB of data encoded as JSON
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Client side messaging settings
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Timeout for a full request/response exchange
    pub request_timeout: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Server side of the messaging layer
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Answer one request. Unsupported requests get a `NetMessage::Error`.
    async fn handle(&self, peer: SocketAddr, msg: NetMessage) -> NetMessage;
}

fn codec_error(err: LinesCodecError) -> BeegfsError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            BeegfsError::Communication("message exceeds maximum length".to_string())
        }
        LinesCodecError::Io(e) => e.into(),
    }
}

/// Send one request and wait for its response, validating the response tag
pub async fn request_response(
    addr: SocketAddr,
    msg: &NetMessage,
    expected: MessageType,
    config: &MessagingConfig,
) -> Result<NetMessage> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| BeegfsError::Timeout(config.connect_timeout.as_millis() as u64))??;

    let response = tokio::time::timeout(config.request_timeout, exchange(stream, addr, msg))
        .await
        .map_err(|_| BeegfsError::Timeout(config.request_timeout.as_millis() as u64))??;

    response.expect_type(expected)
}

async fn exchange(stream: TcpStream, addr: SocketAddr, msg: &NetMessage) -> Result<NetMessage> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let line = serde_json::to_string(msg)?;
    framed.send(line).await.map_err(codec_error)?;

    match framed.next().await {
        Some(Ok(line)) => Ok(serde_json::from_str::<NetMessage>(&line)?),
        Some(Err(e)) => Err(codec_error(e)),
        None => Err(BeegfsError::Communication(format!(
            "connection to {} closed before response",
            addr
        ))),
    }
}

/// Accept connections until `cancel` fires and answer their requests
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "Message server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(addr = %local, "Message server stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, peer, handler, cancel).await {
                                debug!(peer = %peer, error = %e, "Connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = framed.next() => match next {
                Some(line) => line.map_err(codec_error)?,
                None => return Ok(()),
            },
        };

        let response = match serde_json::from_str::<NetMessage>(&line) {
            Ok(request) => handler.handle(peer, request).await,
            Err(e) => NetMessage::Error {
                error: BeegfsError::Inval(format!("undecodable request: {}", e)),
            },
        };

        let out = serde_json::to_string(&response)?;
        framed.send(out).await.map_err(codec_error)?;
    }
}
