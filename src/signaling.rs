// src/signaling.rs
//
// Client side of the broker channel.
//
// One background task owns the WebSocket.  It (re)connects with backoff,
// sends the configured `join` as the very first frame of every connection,
// forwards parsed broker messages as `SignalingEvent`s and writes whatever
// the supervisors queue.  Frames queued while the channel was down belong to
// a dead connection and are discarded on reconnect.
//
// ────────────────────────────────────────────────────────────────────────────

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::SignalingError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::supervisor::SignalSink;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Joined the broker.  `reconnect` is false only for the first connection.
    Connected { reconnect: bool },
    Message(ServerMessage),
    Disconnected,
    /// Reconnection budget exhausted; the task has stopped.
    GaveUp,
}

#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub url: String,
    /// Sent first on every connection.
    pub join: ClientMessage,
    pub backoff: Backoff,
    pub queue_capacity: usize,
}

// ─── Outbound side ──────────────────────────────────────────────────────────

/// Cloneable writer into the channel's outbound queue.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<ClientMessage>,
}

impl SignalSink for SignalingSender {
    fn send(&self, message: ClientMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(kind = message.kind(), "signaling queue full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                debug!(kind = message.kind(), "signaling channel stopped, message dropped");
            }
        }
    }
}

pub struct SignalingHandle {
    sender: SignalingSender,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), SignalingError>>>,
}

impl SignalingHandle {
    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    /// Close the channel and return how the connection task ended.
    pub async fn shutdown(mut self) -> Result<(), SignalingError> {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task.await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }
}

impl Drop for SignalingHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn the connection task.
pub fn connect(
    options: SignalingOptions,
) -> (SignalingHandle, mpsc::UnboundedReceiver<SignalingEvent>) {
    let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run(options, rx, events_tx, cancel.clone()));

    let handle = SignalingHandle {
        sender: SignalingSender { tx },
        cancel,
        task: Some(task),
    };
    (handle, events_rx)
}

// ─── Connection task ────────────────────────────────────────────────────────

enum SessionEnd {
    Lost,
    Stopped,
}

async fn run(
    options: SignalingOptions,
    mut outbound: mpsc::Receiver<ClientMessage>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    cancel: CancellationToken,
) -> Result<(), SignalingError> {
    let mut attempts: u32 = 0;
    let mut connected_once = false;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = tokio_tungstenite::connect_async(options.url.as_str()) => result,
        };

        match connected {
            Ok((ws, _response)) => {
                attempts = 0;
                info!(url = %options.url, reconnect = connected_once, "connected to broker");

                let mut stale = 0usize;
                while outbound.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!(stale, "discarded messages queued for the previous connection");
                }

                let end =
                    serve(ws, &options, &mut outbound, &events, &cancel, connected_once).await;
                connected_once = true;
                match end {
                    SessionEnd::Stopped => return Ok(()),
                    SessionEnd::Lost => {
                        let _ = events.send(SignalingEvent::Disconnected);
                    }
                }
            }
            Err(e) => {
                let err = SignalingError::Connect {
                    url: options.url.clone(),
                    reason: e.to_string(),
                };
                warn!("{err}");
            }
        }

        attempts += 1;
        if !options.backoff.should_retry(attempts) {
            warn!(attempts, "giving up on broker");
            let _ = events.send(SignalingEvent::GaveUp);
            return Err(SignalingError::Exhausted(attempts));
        }

        let delay = options.backoff.delay_for(attempts - 1);
        info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting to broker");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

type BrokerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(
    ws: BrokerStream,
    options: &SignalingOptions,
    outbound: &mut mpsc::Receiver<ClientMessage>,
    events: &mpsc::UnboundedSender<SignalingEvent>,
    cancel: &CancellationToken,
    reconnect: bool,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    let join = match serde_json::to_string(&options.join) {
        Ok(text) => text,
        Err(e) => {
            warn!("{}", SignalingError::Malformed(e));
            return SessionEnd::Stopped;
        }
    };
    if let Err(e) = write.send(Message::Text(join)).await {
        warn!("{}", SignalingError::ConnectionLost(e.to_string()));
        return SessionEnd::Lost;
    }
    let _ = events.send(SignalingEvent::Connected { reconnect });

    loop {
        // Queued frames are flushed before a requested stop.
        tokio::select! {
            biased;

            queued = outbound.recv() => {
                let Some(message) = queued else {
                    return SessionEnd::Stopped;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("{}", SignalingError::Malformed(e));
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("{}", SignalingError::ConnectionLost(e.to_string()));
                    return SessionEnd::Lost;
                }
            }

            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Stopped;
            }

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => {
                            let _ = events.send(SignalingEvent::Message(message));
                        }
                        Err(e) => warn!("{}", SignalingError::Malformed(e)),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("broker closed the connection");
                    return SessionEnd::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("{}", SignalingError::ConnectionLost(e.to_string()));
                    return SessionEnd::Lost;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn options(url: String, max_attempts: u32) -> SignalingOptions {
        SignalingOptions {
            url,
            join: ClientMessage::Join {
                group_key: "team1".into(),
                role: Role::Publisher,
                peer_id: Some("e1".into()),
            },
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
                multiplier: 2.0,
                jitter: false,
                max_attempts: Some(max_attempts),
            },
            queue_capacity: 8,
        }
    }

    async fn next_text(ws: &mut WebSocketStream<tokio::net::TcpStream>) -> String {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn rejoins_after_the_broker_drops_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let mut joins = Vec::new();

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            joins.push(next_text(&mut ws).await);
            let notice = ServerMessage::Disconnect {
                group_key: "team1".into(),
                peer_id: "e9".into(),
            };
            ws.send(Message::Text(serde_json::to_string(&notice).unwrap()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            joins.push(next_text(&mut ws).await);
            joins
        });

        let (handle, mut events) = connect(options(url, 5));

        assert_eq!(events.recv().await, Some(SignalingEvent::Connected { reconnect: false }));
        assert!(matches!(
            events.recv().await,
            Some(SignalingEvent::Message(ServerMessage::Disconnect { .. }))
        ));
        assert_eq!(events.recv().await, Some(SignalingEvent::Disconnected));
        assert_eq!(events.recv().await, Some(SignalingEvent::Connected { reconnect: true }));

        let joins = server.await.unwrap();
        assert_eq!(joins.len(), 2);
        for join in joins {
            let value: serde_json::Value = serde_json::from_str(&join).unwrap();
            assert_eq!(value["kind"], "join");
            assert_eq!(value["peerId"], "e1");
        }

        assert!(handle.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        drop(listener);

        let (handle, mut events) = connect(options(url, 2));
        assert_eq!(events.recv().await, Some(SignalingEvent::GaveUp));

        match handle.shutdown().await {
            Err(SignalingError::Exhausted(2)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sender_drops_when_queue_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = SignalingSender { tx };
        let leave = ClientMessage::Disconnect {
            group_key: "team1".into(),
            peer_id: "e1".into(),
        };

        sender.send(leave.clone());
        sender.send(leave.clone());

        assert_eq!(rx.recv().await, Some(leave));
        assert!(rx.try_recv().is_err());
    }
}
