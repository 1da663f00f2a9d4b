// src/supervisor.rs
//
// Connection lifecycle supervisor: one actor task per remote peer.
//
//   Idle ──offer/accept──▶ Negotiating ──link up──▶ Connected
//                             ▲   │                    │ link interrupted
//                 full restart│   │ response timeout   ▼
//                             │   └──────────────▶ Degraded
//                             │                        │ reconnect in place
//                             └──── guard expired ── Recovering
//
// Every input (signaling, transport callbacks, timers) arrives as a
// `SupervisorEvent` on one queue, so the session is only ever touched by the
// actor.  Timers carry an epoch and a cancellation token; a timer that fires
// after its state was left no longer matches and is dropped.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::TransportError;
use crate::events::{EventBus, SessionEvent};
use crate::protocol::{ClientMessage, ConnectionId, IceCandidate, Role, SessionDescription};
use crate::session::{CandidateAction, NegotiationSession, SessionState};
use crate::transport::{
    LinkState, PeerTransport, TransportEvent, TransportEventSink, TransportFactory,
};

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long to wait for an answer, and then for the link to come up.
    pub response_timeout: Duration,
    /// How long an in-place reconnection may take before a full restart.
    pub recovery_guard: Duration,
    /// Spacing of consecutive restarts that never reached `Connected`.
    pub restart_backoff: Backoff,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            recovery_guard: Duration::from_secs(5),
            restart_backoff: Backoff::default(),
        }
    }
}

// ─── Outbound signaling ─────────────────────────────────────────────────────

/// Where the supervisor puts messages for the broker.
pub trait SignalSink: Send + Sync + 'static {
    fn send(&self, message: ClientMessage);
}

impl SignalSink for mpsc::UnboundedSender<ClientMessage> {
    fn send(&self, message: ClientMessage) {
        let _ = mpsc::UnboundedSender::send(self, message);
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Publisher: begin negotiating.  Viewers wait for an offer instead.
    Start,
    RemoteOffer {
        description: SessionDescription,
        from: ConnectionId,
    },
    RemoteAnswer {
        description: SessionDescription,
    },
    RemoteCandidate(IceCandidate),
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    ResponseTimeout { epoch: u64 },
    RecoveryGuard { epoch: u64 },
    RetryStart { epoch: u64 },
    /// Tear down and renegotiate right away (liveness sweep, broker rejoin).
    Restart,
}

/// Snapshot published on every state or link change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: SessionState,
    pub link: LinkState,
}

// ─── Spawning ───────────────────────────────────────────────────────────────

/// Everything a supervisor needs besides the remote peer id.  One per client.
#[derive(Clone)]
pub struct SupervisorContext {
    pub role: Role,
    pub group_key: String,
    /// Our own peer id, placed in outbound offers and candidates.
    pub local_peer_id: String,
    pub config: SupervisorConfig,
    pub factory: Arc<dyn TransportFactory>,
    pub signal: Arc<dyn SignalSink>,
    pub events: EventBus,
}

pub fn spawn(ctx: SupervisorContext, remote_peer_id: &str) -> SupervisorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SupervisorStatus {
        state: SessionState::Idle,
        link: LinkState::New,
    });
    let cancel = CancellationToken::new();

    let supervisor = Supervisor {
        session: NegotiationSession::new(remote_peer_id),
        tx: tx.clone(),
        status: status_tx,
        cancel: cancel.clone(),
        transport: None,
        generation: 0,
        link: LinkState::New,
        remote_connection: None,
        offer_resent: false,
        next_epoch: 0,
        response_timer: Timer::default(),
        recovery_timer: Timer::default(),
        retry_timer: Timer::default(),
        restart_attempts: 0,
        ctx,
    };
    let task = tokio::spawn(supervisor.run(rx));

    SupervisorHandle {
        peer_id: remote_peer_id.to_string(),
        tx,
        status: status_rx,
        cancel,
        task: Some(task),
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Owner's side of a running supervisor.  Dropping it stops the actor.
pub struct SupervisorHandle {
    peer_id: String,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
    status: watch::Receiver<SupervisorStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn send(&self, event: SupervisorEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the actor and wait until its transport is released.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─── Timers ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Timer {
    epoch: u64,
    token: Option<CancellationToken>,
}

impl Timer {
    fn arm(
        &mut self,
        epoch: u64,
        delay: Duration,
        parent: &CancellationToken,
        tx: &mpsc::UnboundedSender<SupervisorEvent>,
        fire: fn(u64) -> SupervisorEvent,
    ) {
        self.cancel();
        let token = parent.child_token();
        self.epoch = epoch;
        self.token = Some(token.clone());

        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(fire(epoch));
                }
            }
        });
    }

    fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    /// Consume a firing.  `false` for stale or cancelled timers.
    fn fired(&mut self, epoch: u64) -> bool {
        if self.token.is_some() && self.epoch == epoch {
            self.token = None;
            true
        } else {
            false
        }
    }
}

// ─── Actor ──────────────────────────────────────────────────────────────────

struct Supervisor {
    ctx: SupervisorContext,
    session: NegotiationSession,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
    status: watch::Sender<SupervisorStatus>,
    cancel: CancellationToken,

    transport: Option<Box<dyn PeerTransport>>,
    generation: u64,
    link: LinkState,
    /// Viewer only: connection id of the publisher that sent the offer.
    remote_connection: Option<ConnectionId>,
    offer_resent: bool,

    next_epoch: u64,
    response_timer: Timer,
    recovery_timer: Timer,
    retry_timer: Timer,
    restart_attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SupervisorEvent>) {
        info!(
            peer_id = %self.session.peer_id(),
            role = %self.ctx.role,
            group_key = %self.ctx.group_key,
            "supervisor started"
        );

        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        self.close().await;
    }

    async fn handle(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Start => self.on_start().await,
            SupervisorEvent::RemoteOffer { description, from } => {
                self.on_remote_offer(description, from).await
            }
            SupervisorEvent::RemoteAnswer { description } => {
                self.on_remote_answer(description).await
            }
            SupervisorEvent::RemoteCandidate(candidate) => {
                self.on_remote_candidate(candidate).await
            }
            SupervisorEvent::Transport { generation, event } => {
                if generation != self.generation || self.transport.is_none() {
                    debug!(
                        peer_id = %self.session.peer_id(),
                        generation,
                        "stale transport event ignored"
                    );
                    return;
                }
                self.on_transport_event(event).await
            }
            SupervisorEvent::ResponseTimeout { epoch } => {
                if self.response_timer.fired(epoch) {
                    self.on_response_timeout().await
                }
            }
            SupervisorEvent::RecoveryGuard { epoch } => {
                if self.recovery_timer.fired(epoch)
                    && self.session.state() == SessionState::Recovering
                {
                    self.full_restart("recovery guard expired").await
                }
            }
            SupervisorEvent::RetryStart { epoch } => {
                if self.retry_timer.fired(epoch) && self.session.state() == SessionState::Idle {
                    self.begin_negotiation().await
                }
            }
            SupervisorEvent::Restart => {
                self.restart_attempts = 0;
                self.full_restart("restart requested").await
            }
        }
    }

    // ── Signaling inputs ────────────────────────────────────────────────

    async fn on_start(&mut self) {
        if self.ctx.role == Role::Publisher && self.session.state() == SessionState::Idle {
            self.retry_timer.cancel();
            self.begin_negotiation().await;
        }
    }

    async fn on_remote_offer(&mut self, description: SessionDescription, from: ConnectionId) {
        if self.ctx.role != Role::Viewer {
            debug!(peer_id = %self.session.peer_id(), "publisher ignores remote offer");
            return;
        }

        let state = self.session.state();
        if state != SessionState::Idle && self.session.remote_description() == Some(&description) {
            // Same offer again: our answer was probably lost.
            self.remote_connection = Some(from);
            if let Some(answer) = self.session.local_description().cloned() {
                debug!(peer_id = %self.session.peer_id(), "duplicate offer, re-sending answer");
                self.send_answer(&answer);
            }
            return;
        }

        if state != SessionState::Idle {
            info!(
                peer_id = %self.session.peer_id(),
                state = %state,
                "new offer from restarted publisher"
            );
            self.teardown().await;
            self.reset_session();
        }

        self.remote_connection = Some(from);
        if let Err(e) = self.create_transport().await {
            warn!(peer_id = %self.session.peer_id(), "transport setup failed: {e}");
            return;
        }
        self.set_state(SessionState::Negotiating);

        let answer = match &self.transport {
            Some(t) => t.accept_offer(&description).await,
            None => Err(TransportError::Closed),
        };
        match answer {
            Ok(answer) => {
                let flushed = self.session.set_remote_description(description);
                self.session.set_local_description(answer.clone());
                self.send_answer(&answer);
                self.apply_candidates(flushed).await;
                self.arm_response_timer();
            }
            Err(e) => {
                warn!(peer_id = %self.session.peer_id(), "failed to accept offer: {e}");
                self.full_restart("offer rejected").await;
            }
        }
    }

    async fn on_remote_answer(&mut self, description: SessionDescription) {
        if self.ctx.role != Role::Publisher {
            return;
        }
        if self.session.state() != SessionState::Negotiating
            || self.session.has_remote_description()
        {
            debug!(
                peer_id = %self.session.peer_id(),
                state = %self.session.state(),
                "answer ignored"
            );
            return;
        }

        let result = match &self.transport {
            Some(t) => t.accept_answer(&description).await,
            None => Err(TransportError::Closed),
        };
        match result {
            Ok(()) => {
                info!(peer_id = %self.session.peer_id(), "answer applied");
                let flushed = self.session.set_remote_description(description);
                self.apply_candidates(flushed).await;
                // Keep a deadline on the link coming up.
                self.arm_response_timer();
            }
            Err(e) => {
                warn!(peer_id = %self.session.peer_id(), "failed to apply answer: {e}");
                self.full_restart("answer rejected").await;
            }
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.session.offer_candidate(candidate.clone()) {
            CandidateAction::Apply => self.apply_candidates(vec![candidate]).await,
            CandidateAction::Buffered => {
                debug!(
                    peer_id = %self.session.peer_id(),
                    "candidate buffered until remote description"
                )
            }
            CandidateAction::Duplicate => {}
        }
    }

    // ── Transport inputs ────────────────────────────────────────────────

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => self.send_candidate(candidate),
            TransportEvent::RemoteTrack { kind } => {
                info!(peer_id = %self.session.peer_id(), kind = %kind, "remote track received");
                self.ctx
                    .events
                    .emit(SessionEvent::track_received(self.session.peer_id(), &kind));
            }
            TransportEvent::Link(link) => self.on_link(link).await,
        }
    }

    async fn on_link(&mut self, link: LinkState) {
        self.link = link;
        self.publish_status();
        let state = self.session.state();
        debug!(peer_id = %self.session.peer_id(), link = %link, state = %state, "link state");

        match link {
            LinkState::Connected => {
                if matches!(
                    state,
                    SessionState::Negotiating | SessionState::Degraded | SessionState::Recovering
                ) {
                    self.response_timer.cancel();
                    self.recovery_timer.cancel();
                    self.retry_timer.cancel();
                    self.restart_attempts = 0;
                    self.offer_resent = false;
                    self.set_state(SessionState::Connected);
                }
            }
            LinkState::Disconnected => {
                if state == SessionState::Connected {
                    self.set_state(SessionState::Degraded);
                    self.begin_recovery().await;
                }
            }
            LinkState::Failed | LinkState::Closed => {
                if state.is_live() {
                    self.full_restart(if link == LinkState::Failed {
                        "link failed"
                    } else {
                        "link closed unexpectedly"
                    })
                    .await;
                }
            }
            LinkState::New | LinkState::Connecting => {}
        }
    }

    // ── Timers ──────────────────────────────────────────────────────────

    async fn on_response_timeout(&mut self) {
        if self.session.state() != SessionState::Negotiating {
            return;
        }

        let unanswered = !self.session.has_remote_description();
        if self.ctx.role == Role::Publisher && unanswered && !self.offer_resent {
            if let Some(offer) = self.session.local_description().cloned() {
                info!(peer_id = %self.session.peer_id(), "no answer yet, re-sending offer");
                self.offer_resent = true;
                self.send_offer(&offer);
                self.arm_response_timer();
                return;
            }
        }

        self.full_restart(if unanswered {
            "no answer"
        } else {
            "link did not come up"
        })
        .await;
    }

    fn arm_response_timer(&mut self) {
        let epoch = self.bump_epoch();
        self.response_timer.arm(
            epoch,
            self.ctx.config.response_timeout,
            &self.cancel,
            &self.tx,
            |epoch| SupervisorEvent::ResponseTimeout { epoch },
        );
    }

    // ── Negotiation steps ───────────────────────────────────────────────

    async fn begin_negotiation(&mut self) {
        if let Err(e) = self.create_transport().await {
            warn!(peer_id = %self.session.peer_id(), "transport setup failed: {e}");
            self.schedule_retry();
            return;
        }
        self.set_state(SessionState::Negotiating);
        self.offer_resent = false;

        let offer = match &self.transport {
            Some(t) => t.create_offer().await,
            None => Err(TransportError::Closed),
        };
        match offer {
            Ok(offer) => {
                self.session.set_local_description(offer.clone());
                self.send_offer(&offer);
                self.arm_response_timer();
            }
            Err(e) => {
                warn!(peer_id = %self.session.peer_id(), "failed to create offer: {e}");
                self.teardown().await;
                self.reset_session();
                self.schedule_retry();
            }
        }
    }

    async fn begin_recovery(&mut self) {
        self.set_state(SessionState::Recovering);
        let result = match &self.transport {
            Some(t) => t.reconnect_in_place().await,
            None => Err(TransportError::Closed),
        };
        if let Err(e) = result {
            warn!(peer_id = %self.session.peer_id(), "in-place reconnection failed: {e}");
            self.full_restart("in-place reconnection failed").await;
            return;
        }

        let epoch = self.bump_epoch();
        self.recovery_timer.arm(
            epoch,
            self.ctx.config.recovery_guard,
            &self.cancel,
            &self.tx,
            |epoch| SupervisorEvent::RecoveryGuard { epoch },
        );
    }

    /// Drop the transport and start over.  Publishers renegotiate (the first
    /// restart right away, later ones after backoff); viewers wait in `Idle`
    /// for the next offer.
    async fn full_restart(&mut self, reason: &str) {
        info!(
            peer_id = %self.session.peer_id(),
            state = %self.session.state(),
            attempt = self.restart_attempts + 1,
            "full restart: {reason}"
        );
        self.teardown().await;
        self.reset_session();

        if self.ctx.role == Role::Viewer {
            self.remote_connection = None;
            return;
        }

        if self.restart_attempts == 0 {
            self.restart_attempts = 1;
            self.begin_negotiation().await;
        } else {
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self
            .ctx
            .config
            .restart_backoff
            .delay_for(self.restart_attempts.saturating_sub(1));
        self.restart_attempts = self.restart_attempts.saturating_add(1);
        info!(
            peer_id = %self.session.peer_id(),
            delay_ms = delay.as_millis() as u64,
            "restart scheduled"
        );
        let epoch = self.bump_epoch();
        self.retry_timer.arm(
            epoch,
            delay,
            &self.cancel,
            &self.tx,
            |epoch| SupervisorEvent::RetryStart { epoch },
        );
    }

    async fn create_transport(&mut self) -> Result<(), TransportError> {
        self.teardown().await;
        self.generation += 1;
        let sink = TransportEventSink::new(self.generation, self.tx.clone());
        let transport = self.ctx.factory.create(self.session.peer_id(), sink).await?;
        self.transport = Some(transport);
        self.link = LinkState::New;
        self.publish_status();
        Ok(())
    }

    async fn teardown(&mut self) {
        self.response_timer.cancel();
        self.recovery_timer.cancel();
        self.retry_timer.cancel();
        if let Some(transport) = self.transport.take() {
            transport.close().await;
            // Anything the old transport still reports is now stale.
            self.generation += 1;
        }
    }

    fn reset_session(&mut self) {
        let from = self.session.state();
        match self.session.reset() {
            Ok(_) if from != SessionState::Idle => self.announce(from, SessionState::Idle),
            Ok(_) => {}
            Err(e) => warn!(peer_id = %self.session.peer_id(), "{e}"),
        }
    }

    async fn apply_candidates(&mut self, candidates: Vec<IceCandidate>) {
        let Some(transport) = &self.transport else {
            return;
        };
        for candidate in candidates {
            // Stale candidates from an earlier round are expected to fail.
            if let Err(e) = transport.add_candidate(&candidate).await {
                debug!(peer_id = %self.session.peer_id(), "candidate not applied: {e}");
            }
        }
    }

    async fn close(&mut self) {
        self.teardown().await;
        let from = self.session.close();
        if from != SessionState::Closed {
            self.announce(from, SessionState::Closed);
        }
        info!(peer_id = %self.session.peer_id(), "supervisor stopped");
    }

    // ── Outbound messages ───────────────────────────────────────────────

    fn send_offer(&self, offer: &SessionDescription) {
        let Ok(payload) = serde_json::to_value(offer) else {
            return;
        };
        self.ctx.signal.send(ClientMessage::Offer {
            group_key: self.ctx.group_key.clone(),
            peer_id: self.ctx.local_peer_id.clone(),
            payload,
        });
    }

    fn send_answer(&self, answer: &SessionDescription) {
        let (Some(target), Ok(payload)) =
            (self.remote_connection.clone(), serde_json::to_value(answer))
        else {
            return;
        };
        self.ctx.signal.send(ClientMessage::Answer {
            group_key: self.ctx.group_key.clone(),
            target,
            payload,
        });
    }

    fn send_candidate(&self, candidate: IceCandidate) {
        let target = match self.ctx.role {
            Role::Publisher => None,
            Role::Viewer => match &self.remote_connection {
                Some(target) => Some(target.clone()),
                None => return,
            },
        };
        let Ok(payload) = serde_json::to_value(&candidate) else {
            return;
        };
        self.ctx.signal.send(ClientMessage::IceCandidate {
            group_key: self.ctx.group_key.clone(),
            target,
            peer_id: Some(self.ctx.local_peer_id.clone()),
            payload,
        });
    }

    // ── State bookkeeping ───────────────────────────────────────────────

    fn set_state(&mut self, to: SessionState) {
        match self.session.transition(to) {
            Ok(from) if from != to => self.announce(from, to),
            Ok(_) => self.publish_status(),
            Err(e) => warn!(peer_id = %self.session.peer_id(), "{e}"),
        }
    }

    fn announce(&self, from: SessionState, to: SessionState) {
        info!(peer_id = %self.session.peer_id(), from = %from, to = %to, "session state changed");
        self.ctx
            .events
            .emit(SessionEvent::state_changed(self.session.peer_id(), from, to));
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status.send_replace(SupervisorStatus {
            state: self.session.state(),
            link: self.link,
        });
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
