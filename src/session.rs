use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::protocol::{IceCandidate, SessionDescription};

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Degraded,
    Recovering,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Recovering => "recovering",
            Self::Closed => "closed",
        }
    }

    /// Allowed edges of the lifecycle graph.  `Closed` is terminal.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Negotiating) => true,
            (Negotiating, Negotiating | Connected | Idle) => true,
            (Connected, Degraded | Negotiating | Idle) => true,
            (Degraded, Recovering | Connected | Idle) => true,
            (Recovering, Recovering | Connected | Negotiating | Idle) => true,
            _ => false,
        }
    }

    /// A session that holds (or is building) a transport.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Negotiating | Self::Connected | Self::Degraded | Self::Recovering
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

// ---------------------------------------------------------------------------
// NegotiationSession
// ---------------------------------------------------------------------------

/// What to do with an incoming remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateAction {
    /// Remote description is set; hand it to the transport now.
    Apply,
    /// Held until the remote description arrives.
    Buffered,
    /// Seen before; ignore.
    Duplicate,
}

/// Negotiation bookkeeping for one remote peer.
///
/// Owned by exactly one supervisor.  A full restart calls [`reset`] and reuses
/// the value; an explicit stop moves it to `Closed` for good.
///
/// [`reset`]: NegotiationSession::reset
#[derive(Debug)]
pub struct NegotiationSession {
    peer_id: String,
    state: SessionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    applied_candidates: HashSet<IceCandidate>,
}

impl NegotiationSession {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: SessionState::Idle,
            local_description: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            applied_candidates: HashSet::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        self.state = to;
        Ok(from)
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn set_local_description(&mut self, description: SessionDescription) {
        self.local_description = Some(description);
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    /// Record the remote description and release every buffered candidate.
    pub fn set_remote_description(&mut self, description: SessionDescription) -> Vec<IceCandidate> {
        self.remote_description = Some(description);
        let pending = std::mem::take(&mut self.pending_candidates);
        pending
            .into_iter()
            .filter(|c| self.applied_candidates.insert(c.clone()))
            .collect()
    }

    pub fn offer_candidate(&mut self, candidate: IceCandidate) -> CandidateAction {
        if self.applied_candidates.contains(&candidate)
            || self.pending_candidates.contains(&candidate)
        {
            return CandidateAction::Duplicate;
        }
        if self.remote_description.is_none() {
            self.pending_candidates.push(candidate);
            return CandidateAction::Buffered;
        }
        self.applied_candidates.insert(candidate);
        CandidateAction::Apply
    }

    pub fn pending_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Forget everything negotiated so far and go back to `Idle`.
    ///
    /// No-op once closed.
    pub fn reset(&mut self) -> Result<SessionState, InvalidTransition> {
        let from = self.state;
        if from != SessionState::Idle {
            self.transition(SessionState::Idle)?;
        }
        self.local_description = None;
        self.remote_description = None;
        self.pending_candidates.clear();
        self.applied_candidates.clear();
        Ok(from)
    }

    pub fn close(&mut self) -> SessionState {
        let from = self.state;
        self.state = SessionState::Closed;
        from
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
