// src/events.rs
//
// Session event bus for the client side.
//
// Each supervisor publishes its state changes, every remote track it receives
// and the moment its peer is released.  Presentation collaborators (and the
// tests) subscribe to one `EventBus` per client process.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::session::SessionState;

// ─── Event types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "session.state_changed")]
    StateChanged,
    #[serde(rename = "session.track_received")]
    TrackReceived,
    #[serde(rename = "session.released")]
    PeerReleased,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateChanged => "session.state_changed",
            Self::TrackReceived => "session.track_received",
            Self::PeerReleased => "session.released",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub from: SessionState,
    pub to: SessionState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPayload {
    pub kind: String, // "audio" | "video"
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasePayload {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    State(StatePayload),
    Track(TrackPayload),
    Release(ReleasePayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// ```json
/// {
///   "id":         "evt_a1b2c3d4",
///   "type":       "session.state_changed",
///   "created_at": "2025-06-15T14:22:33.123Z",
///   "peer_id":    "e1",
///   "data":       { "from": "negotiating", "to": "connected" }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    /// Remote peer the session belongs to.
    pub peer_id: String,
    pub data: EventPayload,
}

impl SessionEvent {
    pub fn state_changed(peer_id: &str, from: SessionState, to: SessionState) -> Self {
        Self::new(
            EventType::StateChanged,
            peer_id,
            EventPayload::State(StatePayload { from, to }),
        )
    }

    pub fn track_received(peer_id: &str, kind: &str) -> Self {
        Self::new(
            EventType::TrackReceived,
            peer_id,
            EventPayload::Track(TrackPayload { kind: kind.to_string() }),
        )
    }

    pub fn peer_released(peer_id: &str, reason: &str) -> Self {
        Self::new(
            EventType::PeerReleased,
            peer_id,
            EventPayload::Release(ReleasePayload { reason: reason.to_string() }),
        )
    }

    fn new(event_type: EventType, peer_id: &str, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            peer_id: peer_id.to_string(),
            data,
        }
    }

    /// Target state when this is a state change.
    pub fn new_state(&self) -> Option<SessionState> {
        match &self.data {
            EventPayload::State(p) => Some(p.to),
            _ => None,
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast fan-out for [`SessionEvent`].  Cheap to clone.
///
/// Subscribers that fall more than the capacity behind skip events
/// (`broadcast::RecvError::Lagged`).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Publish an event.  Returns the number of subscribers reached; zero
    /// subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) -> usize {
        debug!(event_type = %event.event_type, peer_id = %event.peer_id, "session event");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_envelope_json() {
        let evt =
            SessionEvent::state_changed("e1", SessionState::Negotiating, SessionState::Connected);
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value["type"], "session.state_changed");
        assert_eq!(value["peer_id"], "e1");
        assert_eq!(value["data"]["from"], "negotiating");
        assert_eq!(value["data"]["to"], "connected");
        assert!(evt.id.starts_with("evt_"));
        assert_eq!(evt.new_state(), Some(SessionState::Connected));
    }

    #[tokio::test]
    async fn bus_fanout() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.emit(SessionEvent::peer_released("e1", "disconnect")), 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.id, e2.id);
        assert_eq!(e1.event_type, EventType::PeerReleased);
        assert_eq!(e1.new_state(), None);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(SessionEvent::track_received("e2", "video")), 0);
    }
}
