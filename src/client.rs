// src/client.rs
//
// Publisher and viewer clients.
//
// Both bind a signaling event stream to a `PeerSet`: one supervisor per
// remote peer id, never two.  The publisher has a single remote peer (the
// group's viewer); the viewer keeps one supervisor per publisher that has
// offered.  A periodic liveness sweep repairs sessions the supervisors could
// not repair themselves.
//
// ────────────────────────────────────────────────────────────────────────────

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::SessionEvent;
use crate::protocol::{ClientMessage, IceCandidate, ServerMessage, SessionDescription};
use crate::session::SessionState;
use crate::signaling::SignalingEvent;
use crate::supervisor::{
    self, SupervisorContext, SupervisorEvent, SupervisorHandle, SupervisorStatus,
};
use crate::transport::LinkState;

/// Peer id a publisher uses for its one remote: the group's viewer.
pub const VIEWER_PEER: &str = "viewer";

// ─── PeerSet ────────────────────────────────────────────────────────────────

/// Supervisors keyed by remote peer id.
#[derive(Default)]
pub struct PeerSet {
    peers: Mutex<HashMap<String, SupervisorHandle>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh supervisor for `peer_id`.  Any previous one is shut
    /// down (and its transport released) before `spawn` runs.
    pub async fn replace<F>(&self, peer_id: &str, spawn: F)
    where
        F: FnOnce() -> SupervisorHandle,
    {
        let mut peers = self.peers.lock().await;
        if let Some(previous) = peers.remove(peer_id) {
            debug!(peer_id, "replacing supervisor");
            previous.shutdown().await;
        }
        peers.insert(peer_id.to_string(), spawn());
    }

    /// Make sure a running supervisor exists.  Returns `true` if one was
    /// spawned.
    pub async fn ensure<F>(&self, peer_id: &str, spawn: F) -> bool
    where
        F: FnOnce() -> SupervisorHandle,
    {
        let mut peers = self.peers.lock().await;
        match peers.get(peer_id) {
            Some(handle) if !handle.is_finished() => false,
            _ => {
                if let Some(previous) = peers.remove(peer_id) {
                    previous.shutdown().await;
                }
                peers.insert(peer_id.to_string(), spawn());
                true
            }
        }
    }

    /// Deliver an event.  `false` if no supervisor exists for `peer_id`.
    pub async fn send(&self, peer_id: &str, event: SupervisorEvent) -> bool {
        match self.peers.lock().await.get(peer_id) {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    /// Stop and forget the supervisor for `peer_id`.
    pub async fn release(&self, peer_id: &str) -> bool {
        let removed = self.peers.lock().await.remove(peer_id);
        match removed {
            Some(handle) => {
                handle.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn status(&self, peer_id: &str) -> Option<(SupervisorStatus, bool)> {
        self.peers
            .lock()
            .await
            .get(peer_id)
            .map(|h| (h.status(), h.is_finished()))
    }

    pub async fn snapshot(&self) -> Vec<(String, SupervisorStatus)> {
        let peers = self.peers.lock().await;
        let mut out: Vec<_> = peers
            .iter()
            .map(|(id, h)| (id.clone(), h.status()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn clear(&self) {
        let drained: Vec<SupervisorHandle> =
            self.peers.lock().await.drain().map(|(_, h)| h).collect();
        for handle in drained {
            handle.shutdown().await;
        }
    }
}

// ─── Client driver ──────────────────────────────────────────────────────────

#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn on_signal(&self, event: SignalingEvent);
    async fn sweep(&self);
    async fn shutdown(&self);
}

/// Feed signaling events to `client` and run its liveness sweep every
/// `interval` until cancelled or the signaling stream ends.
pub async fn run_client(
    client: Arc<dyn PeerClient>,
    mut events: mpsc::UnboundedReceiver<SignalingEvent>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(SignalingEvent::GaveUp) => {
                    client.on_signal(SignalingEvent::GaveUp).await;
                    break;
                }
                Some(event) => client.on_signal(event).await,
                None => break,
            },
            _ = ticker.tick() => client.sweep().await,
        }
    }

    client.shutdown().await;
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    payload: serde_json::Value,
    kind: &str,
) -> Option<T> {
    match serde_json::from_value(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(kind, "unreadable payload: {e}");
            None
        }
    }
}

// ─── Publisher ──────────────────────────────────────────────────────────────

pub struct PublisherClient {
    ctx: SupervisorContext,
    peers: PeerSet,
    tracking: AtomicBool,
}

impl PublisherClient {
    pub fn new(ctx: SupervisorContext) -> Self {
        Self {
            ctx,
            peers: PeerSet::new(),
            tracking: AtomicBool::new(false),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Begin streaming to the group's viewer with a brand-new session.
    pub async fn start_tracking(&self) {
        self.tracking.store(true, Ordering::SeqCst);
        info!(
            group_key = %self.ctx.group_key,
            peer_id = %self.ctx.local_peer_id,
            "tracking started"
        );
        self.respawn().await;
    }

    /// Close the session and tell the viewer to release it.
    pub async fn stop_tracking(&self) {
        self.tracking.store(false, Ordering::SeqCst);
        self.peers.release(VIEWER_PEER).await;
        self.ctx.signal.send(ClientMessage::Disconnect {
            group_key: self.ctx.group_key.clone(),
            peer_id: self.ctx.local_peer_id.clone(),
        });
        info!(
            group_key = %self.ctx.group_key,
            peer_id = %self.ctx.local_peer_id,
            "tracking stopped"
        );
    }

    async fn respawn(&self) {
        let ctx = self.ctx.clone();
        self.peers
            .replace(VIEWER_PEER, move || supervisor::spawn(ctx, VIEWER_PEER))
            .await;
        self.peers.send(VIEWER_PEER, SupervisorEvent::Start).await;
    }
}

#[async_trait]
impl PeerClient for PublisherClient {
    async fn on_signal(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected { reconnect } => {
                // Whatever was in flight went to a dead channel.
                if self.is_tracking() {
                    info!(reconnect, "broker joined, renegotiating");
                    if !self.peers.send(VIEWER_PEER, SupervisorEvent::Restart).await {
                        self.respawn().await;
                    }
                }
            }
            SignalingEvent::Message(ServerMessage::Answer { payload, .. }) => {
                if let Some(description) = parse_payload::<SessionDescription>(payload, "answer") {
                    self.peers
                        .send(VIEWER_PEER, SupervisorEvent::RemoteAnswer { description })
                        .await;
                }
            }
            SignalingEvent::Message(ServerMessage::IceCandidate { payload, .. }) => {
                if let Some(candidate) = parse_payload::<IceCandidate>(payload, "ice-candidate") {
                    self.peers
                        .send(VIEWER_PEER, SupervisorEvent::RemoteCandidate(candidate))
                        .await;
                }
            }
            SignalingEvent::Message(other) => {
                debug!(kind = other.kind(), "publisher ignores message");
            }
            SignalingEvent::Disconnected => warn!("lost broker connection"),
            SignalingEvent::GaveUp => warn!("broker unreachable, signaling stopped"),
        }
    }

    async fn sweep(&self) {
        if !self.is_tracking() {
            return;
        }
        match self.peers.status(VIEWER_PEER).await {
            None => {
                info!("liveness: no session, starting one");
                self.respawn().await;
            }
            Some((status, finished)) if finished || status.state == SessionState::Closed => {
                info!("liveness: session closed, starting a new one");
                self.respawn().await;
            }
            Some((status, _)) if status.link == LinkState::Failed => {
                info!("liveness: transport failed, restarting");
                self.peers.send(VIEWER_PEER, SupervisorEvent::Restart).await;
            }
            Some(_) => {}
        }
    }

    async fn shutdown(&self) {
        self.tracking.store(false, Ordering::SeqCst);
        self.peers.clear().await;
    }
}

// ─── Viewer ─────────────────────────────────────────────────────────────────

pub struct ViewerClient {
    ctx: SupervisorContext,
    peers: PeerSet,
}

impl ViewerClient {
    pub fn new(ctx: SupervisorContext) -> Self {
        Self {
            ctx,
            peers: PeerSet::new(),
        }
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    async fn release(&self, peer_id: &str, reason: &str) {
        if self.peers.release(peer_id).await {
            info!(peer_id, reason, "peer released");
            self.ctx.events.emit(SessionEvent::peer_released(peer_id, reason));
        }
    }
}

#[async_trait]
impl PeerClient for ViewerClient {
    async fn on_signal(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected { reconnect } => {
                info!(reconnect, group_key = %self.ctx.group_key, "joined as viewer");
            }
            SignalingEvent::Message(ServerMessage::Offer { sender, peer_id, payload, .. }) => {
                let Some(description) = parse_payload::<SessionDescription>(payload, "offer") else {
                    return;
                };
                let ctx = self.ctx.clone();
                let remote = peer_id.clone();
                if self.peers.ensure(&peer_id, move || supervisor::spawn(ctx, &remote)).await {
                    info!(peer_id = %peer_id, "new publisher session");
                }
                self.peers
                    .send(&peer_id, SupervisorEvent::RemoteOffer { description, from: sender })
                    .await;
            }
            SignalingEvent::Message(ServerMessage::IceCandidate { peer_id, payload, .. }) => {
                let Some(peer_id) = peer_id else {
                    debug!("candidate without peer id dropped");
                    return;
                };
                let Some(candidate) = parse_payload::<IceCandidate>(payload, "ice-candidate") else {
                    return;
                };
                if !self.peers.send(&peer_id, SupervisorEvent::RemoteCandidate(candidate)).await {
                    debug!(peer_id = %peer_id, "candidate for unknown peer dropped");
                }
            }
            SignalingEvent::Message(ServerMessage::Disconnect { peer_id, .. }) => {
                self.release(&peer_id, "publisher disconnected").await;
            }
            SignalingEvent::Message(other) => {
                debug!(kind = other.kind(), "viewer ignores message");
            }
            SignalingEvent::Disconnected => warn!("lost broker connection"),
            SignalingEvent::GaveUp => warn!("broker unreachable, signaling stopped"),
        }
    }

    async fn sweep(&self) {
        let closed: Vec<String> = self
            .peers
            .snapshot()
            .await
            .into_iter()
            .filter(|(_, status)| status.state == SessionState::Closed)
            .map(|(peer_id, _)| peer_id)
            .collect();
        for peer_id in closed {
            self.release(&peer_id, "session closed").await;
        }
    }

    async fn shutdown(&self) {
        self.peers.clear().await;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::events::{EventBus, EventType};
    use crate::protocol::{ConnectionId, Role};
    use crate::supervisor::SupervisorConfig;
    use crate::transport::mock::{Call, MockFactory};
    use serde_json::json;

    fn context(
        role: Role,
        factory: &MockFactory,
    ) -> (SupervisorContext, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = SupervisorContext {
            role,
            group_key: "team1".into(),
            local_peer_id: if role == Role::Publisher { "e1".into() } else { "manager1".into() },
            config: SupervisorConfig {
                restart_backoff: Backoff { jitter: false, ..Backoff::default() },
                ..SupervisorConfig::default()
            },
            factory: Arc::new(factory.clone()),
            signal: Arc::new(tx),
            events: EventBus::new(),
        };
        (ctx, rx)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn offer_from(peer_id: &str, sender: &str, sdp: &str) -> SignalingEvent {
        SignalingEvent::Message(ServerMessage::Offer {
            group_key: "team1".into(),
            sender: ConnectionId::from(sender),
            peer_id: peer_id.into(),
            payload: json!({ "type": "offer", "sdp": sdp }),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_tracking_lifecycle() {
        let factory = MockFactory::new();
        let (ctx, mut outbox) = context(Role::Publisher, &factory);
        let client = PublisherClient::new(ctx);

        client.start_tracking().await;
        settle().await;
        assert!(matches!(drain(&mut outbox).as_slice(), [ClientMessage::Offer { .. }]));

        client
            .on_signal(SignalingEvent::Message(ServerMessage::Answer {
                group_key: "team1".into(),
                sender: ConnectionId::from("conn-viewer"),
                peer_id: None,
                payload: json!({ "type": "answer", "sdp": "v=0 answer" }),
            }))
            .await;
        settle().await;
        assert!(factory.latest().calls().contains(&Call::AcceptAnswer("v=0 answer".into())));

        client.stop_tracking().await;
        assert!(factory.latest().is_closed());
        assert_eq!(client.peers().len().await, 0);
        assert_eq!(
            drain(&mut outbox),
            vec![ClientMessage::Disconnect {
                group_key: "team1".into(),
                peer_id: "e1".into(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_renegotiates_after_broker_rejoin() {
        let factory = MockFactory::new();
        let (ctx, mut outbox) = context(Role::Publisher, &factory);
        let client = PublisherClient::new(ctx);

        client.start_tracking().await;
        settle().await;
        drain(&mut outbox);

        client.on_signal(SignalingEvent::Connected { reconnect: true }).await;
        settle().await;

        assert_eq!(factory.created(), 2);
        assert_eq!(drain(&mut outbox).len(), 1, "one fresh offer on the new channel");
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_tracking_closes_the_live_session_first() {
        let factory = MockFactory::new();
        let (ctx, mut outbox) = context(Role::Publisher, &factory);
        let client = PublisherClient::new(ctx);

        client.start_tracking().await;
        settle().await;
        factory.latest().set_link(LinkState::Connected);
        settle().await;
        drain(&mut outbox);

        client.start_tracking().await;
        settle().await;

        assert_eq!(factory.created(), 2);
        assert!(factory.nth(0).is_closed());
        assert!(!factory.nth(1).is_closed());
        assert_eq!(factory.open_at_create(), vec![0, 0], "sessions never overlap");
        assert_eq!(client.peers().len().await, 1);
        let (status, finished) = client.peers().status(VIEWER_PEER).await.unwrap();
        assert!(!finished);
        assert_eq!(status.state, SessionState::Negotiating);
        assert_eq!(drain(&mut outbox).len(), 1, "one offer from the new session");
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_sweep_restores_missing_session() {
        let factory = MockFactory::new();
        let (ctx, _outbox) = context(Role::Publisher, &factory);
        let client = PublisherClient::new(ctx);

        // Not tracking: nothing to repair.
        client.sweep().await;
        assert_eq!(factory.created(), 0);

        client.start_tracking().await;
        settle().await;
        client.peers().release(VIEWER_PEER).await;

        client.sweep().await;
        settle().await;
        assert_eq!(factory.created(), 2);
        let (status, finished) = client.peers().status(VIEWER_PEER).await.unwrap();
        assert!(!finished);
        assert_eq!(status.state, SessionState::Negotiating);
    }

    #[tokio::test(start_paused = true)]
    async fn viewer_keeps_one_session_per_publisher() {
        let factory = MockFactory::new();
        let (ctx, mut outbox) = context(Role::Viewer, &factory);
        let client = ViewerClient::new(ctx);

        client.on_signal(offer_from("e1", "conn-e1", "v=0 e1")).await;
        client.on_signal(offer_from("e2", "conn-e2", "v=0 e2")).await;
        settle().await;
        // A publisher restart replaces the session inside the same supervisor.
        client.on_signal(offer_from("e1", "conn-e1", "v=0 e1 again")).await;
        settle().await;

        let snapshot = client.peers().snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|(_, s)| s.state == SessionState::Negotiating));

        let targets: Vec<String> = drain(&mut outbox)
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Answer { target, .. } => Some(target.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec!["conn-e1", "conn-e2", "conn-e1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn viewer_releases_peer_on_disconnect_notice() {
        let factory = MockFactory::new();
        let (ctx, _outbox) = context(Role::Viewer, &factory);
        let mut events = ctx.events.subscribe();
        let client = ViewerClient::new(ctx);

        client.on_signal(offer_from("e1", "conn-e1", "v=0 e1")).await;
        settle().await;
        let transport = factory.latest();

        client
            .on_signal(SignalingEvent::Message(ServerMessage::Disconnect {
                group_key: "team1".into(),
                peer_id: "e1".into(),
            }))
            .await;

        assert!(transport.is_closed());
        assert_eq!(client.peers().len().await, 0);

        let mut released = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type == EventType::PeerReleased {
                assert_eq!(event.peer_id, "e1");
                released = true;
            }
        }
        assert!(released);

        // Late candidates for the released peer go nowhere.
        client
            .on_signal(SignalingEvent::Message(ServerMessage::IceCandidate {
                group_key: "team1".into(),
                sender: ConnectionId::from("conn-e1"),
                peer_id: Some("e1".into()),
                payload: json!({ "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host" }),
            }))
            .await;
        assert_eq!(client.peers().len().await, 0);
        assert_eq!(factory.created(), 1);
    }
}
