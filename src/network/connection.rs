//! WebSocket transport: listener, dialer and per-connection pump tasks
//!
//! None of these tasks touch peer state. They only move frames between the
//! socket and the actor's internal channel.

use super::peer::{ConnId, Outbound};
use crate::error::ChainError;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

pub type WsStream = WebSocketStream<TcpStream>;

/// Events flowing from transport tasks into the actor.
pub enum Internal {
    Incoming {
        stream: TcpStream,
        address: SocketAddr,
    },
    Opened {
        stream: WsStream,
        address: SocketAddr,
        outbound: bool,
        reply: Option<oneshot::Sender<Result<(), ChainError>>>,
    },
    Frame {
        conn: ConnId,
        text: String,
    },
    Closed {
        conn: ConnId,
        reason: String,
    },
}

pub fn ws_config(max_frame_bytes: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_bytes);
    config.max_frame_size = Some(max_frame_bytes);
    config
}

pub async fn accept_loop(
    listener: TcpListener,
    internal: mpsc::UnboundedSender<Internal>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => {
                    if internal.send(Internal::Incoming { stream, address }).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(target: "p2p", "accept failed: {}", e),
            },
        }
    }
    debug!(target: "p2p", "listener stopped");
}

/// Completes the server side of the WebSocket upgrade.
pub async fn upgrade_inbound(
    stream: TcpStream,
    address: SocketAddr,
    config: WebSocketConfig,
    timeout: Duration,
    internal: mpsc::UnboundedSender<Internal>,
) {
    match tokio::time::timeout(
        timeout,
        tokio_tungstenite::accept_async_with_config(stream, Some(config)),
    )
    .await
    {
        Ok(Ok(stream)) => {
            let _ = internal.send(Internal::Opened {
                stream,
                address,
                outbound: false,
                reply: None,
            });
        }
        Ok(Err(e)) => debug!(target: "p2p", %address, "websocket upgrade failed: {}", e),
        Err(_) => debug!(target: "p2p", %address, "websocket upgrade timed out"),
    }
}

/// Dials `address` (`host:port` or `ws://host:port`) and reports the open
/// stream to the actor. Failures are answered on `reply` directly.
pub async fn dial(
    address: String,
    config: WebSocketConfig,
    timeout: Duration,
    internal: mpsc::UnboundedSender<Internal>,
    reply: oneshot::Sender<Result<(), ChainError>>,
) {
    let host = address
        .trim_start_matches("ws://")
        .trim_end_matches('/')
        .to_string();
    let url = format!("ws://{}", host);

    let attempt = async {
        let tcp = TcpStream::connect(&host).await?;
        let remote = tcp.peer_addr()?;
        let (stream, _) = tokio_tungstenite::client_async_with_config(url.as_str(), tcp, Some(config))
            .await
            .map_err(|e| ChainError::NetworkError(format!("websocket handshake with {} failed: {}", host, e)))?;
        Ok::<_, ChainError>((stream, remote))
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok((stream, remote))) => {
            let opened = Internal::Opened {
                stream,
                address: remote,
                outbound: true,
                reply: Some(reply),
            };
            if let Err(mpsc::error::SendError(Internal::Opened { reply: Some(reply), .. })) =
                internal.send(opened)
            {
                let _ = reply.send(Err(ChainError::NetworkError(
                    "network stopped".to_string(),
                )));
            }
        }
        Ok(Err(e)) => {
            let _ = reply.send(Err(e));
        }
        Err(_) => {
            let _ = reply.send(Err(ChainError::NetworkError(format!(
                "dial to {} timed out after {}ms",
                host,
                timeout.as_millis()
            ))));
        }
    }
}

/// Spawns the pump for an open connection and returns its outbox.
pub fn spawn_connection(
    conn: ConnId,
    stream: WsStream,
    internal: mpsc::UnboundedSender<Internal>,
) -> mpsc::UnboundedSender<Outbound> {
    let (outbox, mut queue) = mpsc::unbounded_channel::<Outbound>();

    tokio::spawn(async move {
        let (mut sink, mut source) = stream.split();
        let reason = loop {
            tokio::select! {
                outbound = queue.recv() => match outbound {
                    Some(Outbound::Frame(text)) => {
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            break format!("write failed: {}", e);
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.close().await;
                        break "closed locally".to_string();
                    }
                },
                inbound = source.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if internal.send(Internal::Frame { conn, text }).is_err() {
                            break "network stopped".to_string();
                        }
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        // binary frames are not part of the protocol; surfaced as malformed
                        let text = String::from_utf8(bytes).unwrap_or_default();
                        if internal.send(Internal::Frame { conn, text }).is_err() {
                            break "network stopped".to_string();
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break "closed by peer".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read failed: {}", e),
                },
            }
        };
        let _ = internal.send(Internal::Closed { conn, reason });
    });

    outbox
}
