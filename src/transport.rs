// src/transport.rs
//
// Seam between the lifecycle supervisor and the media stack.
//
// A `PeerTransport` is one peer connection attempt.  It reports link changes,
// locally gathered candidates and remote tracks through a
// `TransportEventSink`, tagged with the generation it was created under so
// the supervisor can ignore callbacks from transports it already tore down.
//
// ────────────────────────────────────────────────────────────────────────────

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{IceCandidate, SessionDescription};
use crate::supervisor::SupervisorEvent;

// ─── Link state ─────────────────────────────────────────────────────────────

/// Aggregate connectivity of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Link(LinkState),
    LocalCandidate(IceCandidate),
    RemoteTrack { kind: String },
}

// ─── Event sink ─────────────────────────────────────────────────────────────

/// Callback target handed to a transport at creation.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
}

impl TransportEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward an event.  Returns `false` once the supervisor is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SupervisorEvent::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

// ─── Traits ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Generate and apply a local offer.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a remote offer and return the local answer.
    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    async fn accept_answer(&self, answer: &SessionDescription) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Try to revive the existing session without a new description exchange.
    async fn reconnect_in_place(&self) -> Result<(), TransportError>;

    /// Release the connection and every local track it holds.
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        sink: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}

// ─── In-memory transport for tests ──────────────────────────────────────────
