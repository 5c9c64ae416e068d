//! Socket transport
//!
//! The shard runner never touches a websocket directly. A [`Connector`] opens a
//! connection and hands back a channel-backed [`Socket`]; pump tasks own the
//! actual stream. Tests plug in their own connector and drive the other end
//! through a [`SocketPeer`].

use crate::codec::WireMessage;
use crate::error::GatewayError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{debug, trace, warn};
use twilight_model::gateway::ShardId;

/// Upper bound on the websocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(WireMessage),
    /// The connection is gone. `code` is absent when the transport failed
    /// without a close frame.
    Closed { code: Option<u16>, reason: String },
}

/// Instruction for the writer side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Send(WireMessage),
    Close { code: u16, reason: String },
}

/// Shard-side end of an open connection.
#[derive(Debug)]
pub struct Socket {
    outbound: mpsc::UnboundedSender<SocketCommand>,
    inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Transport-side end of an open connection.
#[derive(Debug)]
pub struct SocketPeer {
    pub events: mpsc::UnboundedSender<SocketEvent>,
    pub commands: mpsc::UnboundedReceiver<SocketCommand>,
}

impl Socket {
    /// A connected pair of ends.
    pub fn pair() -> (Socket, SocketPeer) {
        let (outbound, commands) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        (Socket { outbound, inbound }, SocketPeer { events, commands })
    }

    /// Queue a message for the writer. Returns false once the writer is gone;
    /// the matching close event arrives through [`Socket::recv`].
    pub fn send(&self, message: WireMessage) -> bool {
        self.outbound.send(SocketCommand::Send(message)).is_ok()
    }

    /// Close with a code. The socket is unusable afterwards.
    pub fn close(self, code: u16, reason: &str) {
        let _ = self.outbound.send(SocketCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Next inbound event. A dropped transport reads as an abnormal close.
    pub async fn recv(&mut self) -> SocketEvent {
        self.inbound.recv().await.unwrap_or(SocketEvent::Closed {
            code: None,
            reason: "transport dropped".to_string(),
        })
    }
}

/// Opens gateway connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, shard: ShardId, url: &str) -> Result<Socket, GatewayError>;
}

/// Production connector over tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, shard: ShardId, url: &str) -> Result<Socket, GatewayError> {
        let shard_id = shard.number();
        let connect_error = |source: Box<dyn std::error::Error + Send + Sync>| GatewayError::Connect {
            shard_id,
            url: url.to_string(),
            source,
        };

        debug!(shard_id, url, "Opening gateway socket");
        let (stream, _response) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|elapsed| connect_error(Box::new(elapsed)))?
                .map_err(|e| connect_error(Box::new(e)))?;

        let (socket, peer) = Socket::pair();
        let SocketPeer { events, mut commands } = peer;
        let (mut sink, mut stream) = stream.split();

        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let result = match command {
                    SocketCommand::Send(WireMessage::Text(text)) => {
                        sink.send(Message::Text(text.into())).await
                    }
                    SocketCommand::Send(WireMessage::Binary(bytes)) => {
                        sink.send(Message::Binary(bytes.into())).await
                    }
                    SocketCommand::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: WsCloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!(shard_id, error = %e, "Socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            trace!(shard_id, "Socket writer stopped");
        });

        tokio::spawn(async move {
            let closed = loop {
                let event = match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        SocketEvent::Message(WireMessage::Text(text.as_str().to_owned()))
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        SocketEvent::Message(WireMessage::Binary(bytes.to_vec()))
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => SocketEvent::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.as_str().to_owned(),
                            },
                            None => SocketEvent::Closed {
                                code: None,
                                reason: "closed without frame".to_string(),
                            },
                        };
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        break SocketEvent::Closed {
                            code: None,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break SocketEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        };
                    }
                };
                if events.send(event).is_err() {
                    trace!(shard_id, "Socket reader detached");
                    return;
                }
            };
            let _ = events.send(closed);
        });

        Ok(socket)
    }
}
