//! Request/reply transport boundary.
//!
//! The hub only needs two operations from a transport: receive the next
//! (envelope, image) pair and send the reply for it. Exchanges are strictly
//! one at a time: a new message is not received until the previous one has
//! been answered.
//!
//! Two implementations are provided:
//! - [`ChannelTransport`]: in-process, fed by [`NodeClient`] handles
//! - [`TcpTransport`]: TCP server with length-delimited frames. A request is
//!   two frames (envelope text, image bytes); the reply is one frame.

use crate::config::TransportConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Exchanges buffered between connection tasks and the hub.
const EXCHANGE_BUFFER: usize = 64;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport closed")]
    Closed,

    #[error("No request is waiting for a reply")]
    NoPendingRequest,

    #[error("Node went away before the reply was delivered")]
    PeerGone,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// One inbound message: envelope text plus image payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub envelope: String,
    pub image: Bytes,
}

/// The operations the hub needs from a request/reply channel.
#[async_trait]
pub trait Transport: Send {
    /// Wait for the next message. Must be cancel-safe: the hub wraps it in
    /// a patience timeout.
    async fn receive_next(&mut self) -> Result<InboundMessage, TransportError>;

    /// Reply to the most recently received message.
    async fn send_reply(&mut self, reply: Bytes) -> Result<(), TransportError>;
}

struct Exchange {
    message: InboundMessage,
    reply_tx: oneshot::Sender<Bytes>,
}

/// In-process transport fed by [`NodeClient`] handles.
pub struct ChannelTransport {
    rx: mpsc::Receiver<Exchange>,
    pending: Option<oneshot::Sender<Bytes>>,
}

/// Sending side of a [`ChannelTransport`].
#[derive(Clone)]
pub struct NodeClient {
    tx: mpsc::Sender<Exchange>,
}

/// Create a connected in-process transport and client.
pub fn channel(buffer: usize) -> (ChannelTransport, NodeClient) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        ChannelTransport { rx, pending: None },
        NodeClient { tx },
    )
}

impl NodeClient {
    /// Send one message and wait for the hub's reply.
    pub async fn request(
        &self,
        envelope: impl Into<String>,
        image: Bytes,
    ) -> Result<Bytes, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = Exchange {
            message: InboundMessage {
                envelope: envelope.into(),
                image,
            },
            reply_tx,
        };

        self.tx
            .send(exchange)
            .await
            .map_err(|_| TransportError::Closed)?;

        reply_rx.await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn receive_next(&mut self) -> Result<InboundMessage, TransportError> {
        if self.pending.take().is_some() {
            warn!("Previous request was never answered, dropping it");
        }

        match self.rx.recv().await {
            Some(exchange) => {
                self.pending = Some(exchange.reply_tx);
                Ok(exchange.message)
            }
            None => Err(TransportError::Closed),
        }
    }

    async fn send_reply(&mut self, reply: Bytes) -> Result<(), TransportError> {
        self.pending
            .take()
            .ok_or(TransportError::NoPendingRequest)?
            .send(reply)
            .map_err(|_| TransportError::PeerGone)
    }
}

/// TCP request/reply server accepting many nodes.
pub struct TcpTransport {
    inner: ChannelTransport,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind the listener and start accepting node connections.
    pub async fn bind(config: &TransportConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(&config.bind_address).await?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel(EXCHANGE_BUFFER);
        let accept_task = tokio::spawn(accept_loop(listener, tx, config.max_frame_bytes));

        info!(address = %local_addr, "Listening for nodes");

        Ok(Self {
            inner: ChannelTransport { rx, pending: None },
            local_addr,
            accept_task,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn receive_next(&mut self) -> Result<InboundMessage, TransportError> {
        self.inner.receive_next().await
    }

    async fn send_reply(&mut self, reply: Bytes) -> Result<(), TransportError> {
        self.inner.send_reply(reply).await
    }
}

fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Exchange>, max_frame_bytes: usize) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Node connected");
                tokio::spawn(serve_node(stream, peer, tx.clone(), max_frame_bytes));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_node(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Exchange>,
    max_frame_bytes: usize,
) {
    let mut framed = Framed::new(stream, frame_codec(max_frame_bytes));

    if let Err(e) = serve_exchanges(&mut framed, &tx).await {
        warn!(%peer, error = %e, "Node connection closed with error");
    }

    debug!(%peer, "Node disconnected");
}

async fn serve_exchanges(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    tx: &mpsc::Sender<Exchange>,
) -> Result<(), TransportError> {
    while let Some(envelope) = framed.next().await {
        let envelope = envelope?;
        let image = match framed.next().await {
            Some(frame) => frame?.freeze(),
            None => {
                return Err(TransportError::Protocol(
                    "connection closed between envelope and image".to_string(),
                ))
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = Exchange {
            message: InboundMessage {
                envelope: String::from_utf8_lossy(&envelope).into_owned(),
                image,
            },
            reply_tx,
        };

        tx.send(exchange).await.map_err(|_| TransportError::Closed)?;
        let reply = reply_rx.await.map_err(|_| TransportError::Closed)?;
        framed.send(reply).await?;
    }

    Ok(())
}

/// Node-side TCP client speaking the hub's framing.
pub struct TcpNodeClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl TcpNodeClient {
    /// Connect to a hub.
    pub async fn connect(addr: impl ToSocketAddrs, max_frame_bytes: usize) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, frame_codec(max_frame_bytes)),
        })
    }

    /// Send one (envelope, image) pair and wait for the reply.
    pub async fn request(&mut self, envelope: &str, image: Bytes) -> Result<Bytes, TransportError> {
        self.framed
            .send(Bytes::copy_from_slice(envelope.as_bytes()))
            .await?;
        self.framed.send(image).await?;

        match self.framed.next().await {
            Some(reply) => Ok(reply?.freeze()),
            None => Err(TransportError::Closed),
        }
    }
}
