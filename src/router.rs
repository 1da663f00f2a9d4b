// src/router.rs
//
// Signaling router: the only writer of the session registry.
//
// Every duplex channel gets a connection id and a bounded outbound queue on
// `connect()`.  Inbound frames are validated against registry membership and
// forwarded with a non-blocking enqueue.  Anything that fails validation or
// cannot be enqueued is dropped; senders rely on their own timeouts.
//
//   join           → registry only
//   offer          → group viewer              (sender must be publisher)
//   answer         → explicit target           (sender must be viewer)
//   ice-candidate  → explicit target, or the group viewer when a publisher
//                    leaves `target` out
//   disconnect     → group viewer              (sender must be publisher)
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ConnectionId, Role, ServerMessage};
use crate::registry::SessionRegistry;

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Outcome of a single delivery attempt.  Exposed for tests and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Validation failed or no recipient is registered.
    Unroutable,
    /// The recipient's queue is full or already closed.
    Saturated,
    /// Nothing to forward (join).
    Consumed,
}

pub struct SignalingRouter {
    registry: Arc<SessionRegistry>,
    outbound: Mutex<HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>,
    capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SignalingRouter {
    pub fn new(registry: Arc<SessionRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            outbound: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn outbound(&self) -> MutexGuard<'_, HashMap<ConnectionId, mpsc::Sender<ServerMessage>>> {
        self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Channel lifecycle ───────────────────────────────────────────────

    /// Accept a new duplex channel.  The receiver is the channel's outbound
    /// queue; whatever hosts the channel drains it onto the wire.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let connection_id = ConnectionId::generate();
        let (tx, rx) = mpsc::channel(self.capacity);
        self.outbound().insert(connection_id.clone(), tx);
        info!(connection_id = %connection_id, "signaling channel opened");
        (connection_id, rx)
    }

    /// Channel closed.  Clears every role the connection held and tells each
    /// affected group's viewer that the departing publisher is gone.
    pub fn disconnect(&self, connection_id: &ConnectionId) {
        self.outbound().remove(connection_id);
        let departures = self.registry.remove(connection_id);
        info!(
            connection_id = %connection_id,
            roles = departures.len(),
            "signaling channel closed"
        );

        for departure in departures {
            if departure.role != Role::Publisher {
                continue;
            }
            let Some(viewer) = departure.viewer else {
                continue;
            };
            let peer_id = departure
                .peer_id
                .unwrap_or_else(|| connection_id.to_string());
            if self.registry.has_publisher_peer(&departure.group_key, &peer_id) {
                // The peer already rejoined on another channel.
                debug!(
                    connection_id = %connection_id,
                    peer_id = %peer_id,
                    "stale channel closed, viewer not notified"
                );
                continue;
            }
            self.deliver(
                &viewer,
                ServerMessage::Disconnect {
                    group_key: departure.group_key,
                    peer_id,
                },
            );
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Validate and forward one inbound message.  Never blocks.
    pub fn handle(&self, sender: &ConnectionId, message: ClientMessage) -> Delivery {
        let kind = message.kind();
        match message {
            ClientMessage::Join { group_key, role, peer_id } => {
                info!(
                    connection_id = %sender,
                    group_key = %group_key,
                    role = %role,
                    peer_id = peer_id.as_deref().unwrap_or("-"),
                    "joined group"
                );
                self.registry.join(&group_key, role, sender, peer_id);
                Delivery::Consumed
            }

            ClientMessage::Offer { group_key, peer_id, payload } => {
                if !self.registry.is_member_as(&group_key, Role::Publisher, sender) {
                    return self.miss(
                        sender,
                        kind,
                        &group_key,
                        "sender is not a publisher of the group",
                    );
                }
                let Some(viewer) = self.registry.route_target_for(&group_key, Role::Viewer) else {
                    return self.miss(sender, kind, &group_key, "no viewer registered");
                };
                let peer_id = self.registry.peer_id_of(&group_key, sender).unwrap_or(peer_id);
                self.deliver(
                    &viewer,
                    ServerMessage::Offer {
                        group_key,
                        sender: sender.clone(),
                        peer_id,
                        payload,
                    },
                )
            }

            ClientMessage::Answer { group_key, target, payload } => {
                if !self.registry.is_member_as(&group_key, Role::Viewer, sender) {
                    return self.miss(sender, kind, &group_key, "sender is not the group viewer");
                }
                if !self.registry.is_member(&group_key, &target) {
                    return self.miss(sender, kind, &group_key, "target is not in the group");
                }
                let peer_id = self.registry.peer_id_of(&group_key, sender);
                self.deliver(
                    &target,
                    ServerMessage::Answer {
                        group_key,
                        sender: sender.clone(),
                        peer_id,
                        payload,
                    },
                )
            }

            ClientMessage::IceCandidate { group_key, target, peer_id, payload } => {
                if !self.registry.is_member(&group_key, sender) {
                    return self.miss(sender, kind, &group_key, "sender is not in the group");
                }
                let recipient = match target {
                    Some(target) if self.registry.is_member(&group_key, &target) => target,
                    Some(_) => {
                        return self.miss(sender, kind, &group_key, "target is not in the group");
                    }
                    None if self.registry.is_member_as(&group_key, Role::Publisher, sender) => {
                        match self.registry.route_target_for(&group_key, Role::Viewer) {
                            Some(viewer) => viewer,
                            None => {
                                return self.miss(sender, kind, &group_key, "no viewer registered")
                            }
                        }
                    }
                    None => return self.miss(sender, kind, &group_key, "no target"),
                };
                let peer_id = self.registry.peer_id_of(&group_key, sender).or(peer_id);
                self.deliver(
                    &recipient,
                    ServerMessage::IceCandidate {
                        group_key,
                        sender: sender.clone(),
                        peer_id,
                        payload,
                    },
                )
            }

            ClientMessage::Disconnect { group_key, peer_id } => {
                if !self.registry.is_member_as(&group_key, Role::Publisher, sender) {
                    return self.miss(
                        sender,
                        kind,
                        &group_key,
                        "sender is not a publisher of the group",
                    );
                }
                let Some(viewer) = self.registry.route_target_for(&group_key, Role::Viewer) else {
                    return self.miss(sender, kind, &group_key, "no viewer registered");
                };
                let peer_id = self.registry.peer_id_of(&group_key, sender).unwrap_or(peer_id);
                self.deliver(&viewer, ServerMessage::Disconnect { group_key, peer_id })
            }
        }
    }

    fn miss(&self, sender: &ConnectionId, kind: &str, group_key: &str, reason: &str) -> Delivery {
        debug!(
            connection_id = %sender,
            kind,
            group_key,
            reason,
            "message dropped"
        );
        self.dropped.fetch_add(1, Ordering::Relaxed);
        Delivery::Unroutable
    }

    // ── Outbound ────────────────────────────────────────────────────────

    fn deliver(&self, recipient: &ConnectionId, message: ServerMessage) -> Delivery {
        let tx = self.outbound().get(recipient).cloned();
        let Some(tx) = tx else {
            debug!(recipient = %recipient, kind = message.kind(), "recipient has no open channel");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Delivery::Unroutable;
        };

        match tx.try_send(message) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Delivery::Delivered
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    recipient = %recipient,
                    kind = message.kind(),
                    "outbound queue saturated, message dropped"
                );
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Saturated
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                debug!(recipient = %recipient, kind = message.kind(), "outbound queue closed");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Saturated
            }
        }
    }

    // ── Counters ────────────────────────────────────────────────────────

    pub fn connection_count(&self) -> usize {
        self.outbound().len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> SignalingRouter {
        SignalingRouter::new(Arc::new(SessionRegistry::new()), 8)
    }

    fn join(router: &SignalingRouter, conn: &ConnectionId, role: Role, peer_id: Option<&str>) {
        let outcome = router.handle(
            conn,
            ClientMessage::Join {
                group_key: "team1".into(),
                role,
                peer_id: peer_id.map(str::to_string),
            },
        );
        assert_eq!(outcome, Delivery::Consumed);
    }

    fn offer(peer_id: &str) -> ClientMessage {
        ClientMessage::Offer {
            group_key: "team1".into(),
            peer_id: peer_id.into(),
            payload: json!({ "type": "offer", "sdp": format!("offer-from-{peer_id}") }),
        }
    }

    #[test]
    fn team1_offers_reach_viewer_and_answers_reach_only_their_target() {
        let router = router();
        let (viewer, mut viewer_rx) = router.connect();
        let (e1, mut e1_rx) = router.connect();
        let (e2, mut e2_rx) = router.connect();

        join(&router, &viewer, Role::Viewer, Some("manager1"));
        join(&router, &e1, Role::Publisher, Some("e1"));
        join(&router, &e2, Role::Publisher, Some("e2"));

        assert_eq!(router.handle(&e1, offer("e1")), Delivery::Delivered);
        assert_eq!(router.handle(&e2, offer("e2")), Delivery::Delivered);

        let mut seen = Vec::new();
        for _ in 0..2 {
            match viewer_rx.try_recv().unwrap() {
                ServerMessage::Offer { sender, peer_id, .. } => seen.push((sender, peer_id)),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(seen, vec![(e1.clone(), "e1".to_string()), (e2.clone(), "e2".to_string())]);

        let answer = ClientMessage::Answer {
            group_key: "team1".into(),
            target: e2.clone(),
            payload: json!({ "type": "answer", "sdp": "for-e2" }),
        };
        assert_eq!(router.handle(&viewer, answer), Delivery::Delivered);

        match e2_rx.try_recv().unwrap() {
            ServerMessage::Answer { sender, payload, .. } => {
                assert_eq!(sender, viewer);
                assert_eq!(payload["sdp"], "for-e2");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(e1_rx.try_recv().is_err());
    }

    #[test]
    fn offer_without_viewer_is_dropped_without_touching_registry() {
        let router = router();
        let (e1, _rx) = router.connect();
        join(&router, &e1, Role::Publisher, Some("e1"));
        let before = router.registry().groups();

        assert_eq!(router.handle(&e1, offer("e1")), Delivery::Unroutable);
        assert_eq!(router.registry().groups(), before);
        assert_eq!(router.dropped(), 1);
    }

    #[test]
    fn second_viewer_receives_subsequent_offers() {
        let router = router();
        let (v1, mut v1_rx) = router.connect();
        let (v2, mut v2_rx) = router.connect();
        let (e1, _e1_rx) = router.connect();

        join(&router, &v1, Role::Viewer, None);
        join(&router, &v2, Role::Viewer, None);
        join(&router, &e1, Role::Publisher, Some("e1"));

        assert_eq!(router.handle(&e1, offer("e1")), Delivery::Delivered);
        assert!(v1_rx.try_recv().is_err());
        assert!(matches!(v2_rx.try_recv(), Ok(ServerMessage::Offer { .. })));
    }

    #[test]
    fn messages_for_another_group_are_dropped() {
        let router = router();
        let (viewer, mut viewer_rx) = router.connect();
        let (e1, _rx) = router.connect();
        join(&router, &viewer, Role::Viewer, None);
        join(&router, &e1, Role::Publisher, Some("e1"));

        let foreign = ClientMessage::Offer {
            group_key: "team2".into(),
            peer_id: "e1".into(),
            payload: json!({}),
        };
        assert_eq!(router.handle(&e1, foreign), Delivery::Unroutable);

        // A viewer cannot send offers, a publisher cannot send answers.
        assert_eq!(router.handle(&viewer, offer("v")), Delivery::Unroutable);
        let answer = ClientMessage::Answer {
            group_key: "team1".into(),
            target: viewer.clone(),
            payload: json!({}),
        };
        assert_eq!(router.handle(&e1, answer), Delivery::Unroutable);
        assert!(viewer_rx.try_recv().is_err());
    }

    #[test]
    fn candidates_route_by_target_or_default_to_viewer() {
        let router = router();
        let (viewer, mut viewer_rx) = router.connect();
        let (e1, mut e1_rx) = router.connect();
        let (stranger, _stranger_rx) = router.connect();
        join(&router, &viewer, Role::Viewer, None);
        join(&router, &e1, Role::Publisher, Some("e1"));

        let from_publisher = ClientMessage::IceCandidate {
            group_key: "team1".into(),
            target: None,
            peer_id: None,
            payload: json!({ "candidate": "c1" }),
        };
        assert_eq!(router.handle(&e1, from_publisher), Delivery::Delivered);
        match viewer_rx.try_recv().unwrap() {
            ServerMessage::IceCandidate { sender, peer_id, .. } => {
                assert_eq!(sender, e1);
                assert_eq!(peer_id.as_deref(), Some("e1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let from_viewer = ClientMessage::IceCandidate {
            group_key: "team1".into(),
            target: Some(e1.clone()),
            peer_id: None,
            payload: json!({ "candidate": "c2" }),
        };
        assert_eq!(router.handle(&viewer, from_viewer), Delivery::Delivered);
        assert!(matches!(e1_rx.try_recv(), Ok(ServerMessage::IceCandidate { .. })));

        // Targets outside the group are out of scope.
        let escape = ClientMessage::IceCandidate {
            group_key: "team1".into(),
            target: Some(stranger.clone()),
            peer_id: None,
            payload: json!({ "candidate": "c3" }),
        };
        assert_eq!(router.handle(&viewer, escape), Delivery::Unroutable);
    }

    #[test]
    fn publisher_disconnect_notifies_viewer_exactly_once() {
        let router = router();
        let (viewer, mut viewer_rx) = router.connect();
        let (e1, _rx) = router.connect();
        join(&router, &viewer, Role::Viewer, None);
        join(&router, &e1, Role::Publisher, Some("e1"));

        router.disconnect(&e1);
        router.disconnect(&e1);

        assert_eq!(
            viewer_rx.try_recv().unwrap(),
            ServerMessage::Disconnect {
                group_key: "team1".into(),
                peer_id: "e1".into(),
            }
        );
        assert!(viewer_rx.try_recv().is_err());
        assert_eq!(router.registry().group("team1").unwrap().publisher_count, 0);
    }

    #[test]
    fn viewer_disconnect_notifies_nobody() {
        let router = router();
        let (viewer, _viewer_rx) = router.connect();
        let (e1, mut e1_rx) = router.connect();
        join(&router, &viewer, Role::Viewer, None);
        join(&router, &e1, Role::Publisher, Some("e1"));

        router.disconnect(&viewer);
        assert!(e1_rx.try_recv().is_err());
        assert_eq!(router.registry().route_target_for("team1", Role::Viewer), None);
    }

    #[test]
    fn explicit_leave_is_forwarded_to_viewer() {
        let router = router();
        let (viewer, mut viewer_rx) = router.connect();
        let (e1, _rx) = router.connect();
        join(&router, &viewer, Role::Viewer, None);
        join(&router, &e1, Role::Publisher, Some("e1"));

        let leave = ClientMessage::Disconnect {
            group_key: "team1".into(),
            peer_id: "e1".into(),
        };
        assert_eq!(router.handle(&e1, leave), Delivery::Delivered);
        assert!(matches!(
            viewer_rx.try_recv(),
            Ok(ServerMessage::Disconnect { .. })
        ));
    }

    #[test]
    fn saturated_recipient_drops_without_blocking() {
        let router = SignalingRouter::new(Arc::new(SessionRegistry::new()), 1);
        let (viewer, mut viewer_rx) = router.connect();
        let (e1, _e1_rx) = router.connect();
        join(&router, &viewer, Role::Viewer, None);
        join(&router, &e1, Role::Publisher, Some("e1"));

        assert_eq!(router.handle(&e1, offer("e1")), Delivery::Delivered);
        assert_eq!(router.handle(&e1, offer("e1")), Delivery::Saturated);
        assert_eq!(router.delivered(), 1);
        assert_eq!(router.dropped(), 1);

        assert!(viewer_rx.try_recv().is_ok());
        assert!(viewer_rx.try_recv().is_err());
    }

    #[test]
    fn stale_channel_close_does_not_release_a_rejoined_publisher() {
        let router = router();
        let (viewer, mut viewer_rx) = router.connect();
        let (old, _old_rx) = router.connect();
        let (new, _new_rx) = router.connect();
        join(&router, &viewer, Role::Viewer, None);
        join(&router, &old, Role::Publisher, Some("e1"));
        join(&router, &new, Role::Publisher, Some("e1"));

        assert_eq!(router.handle(&new, offer("e1")), Delivery::Delivered);
        assert!(matches!(viewer_rx.try_recv(), Ok(ServerMessage::Offer { .. })));

        router.disconnect(&old);
        assert!(viewer_rx.try_recv().is_err());

        // The live channel still gets its notice when it goes away.
        router.disconnect(&new);
        assert_eq!(
            viewer_rx.try_recv().unwrap(),
            ServerMessage::Disconnect {
                group_key: "team1".into(),
                peer_id: "e1".into(),
            }
        );
    }

    #[test]
    fn forwarded_peer_ids_come_from_the_registry() {
        let router = router();
        let (viewer, mut viewer_rx) = router.connect();
        let (e1, _rx) = router.connect();
        join(&router, &viewer, Role::Viewer, None);
        join(&router, &e1, Role::Publisher, Some("e1"));

        assert_eq!(router.handle(&e1, offer("e2")), Delivery::Delivered);
        match viewer_rx.try_recv().unwrap() {
            ServerMessage::Offer { peer_id, .. } => assert_eq!(peer_id, "e1"),
            other => panic!("unexpected message: {other:?}"),
        }

        let leave = ClientMessage::Disconnect {
            group_key: "team1".into(),
            peer_id: "e2".into(),
        };
        assert_eq!(router.handle(&e1, leave), Delivery::Delivered);
        assert_eq!(
            viewer_rx.try_recv().unwrap(),
            ServerMessage::Disconnect {
                group_key: "team1".into(),
                peer_id: "e1".into(),
            }
        );
    }
}
