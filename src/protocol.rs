// src/protocol.rs
//
// Wire envelope exchanged over every signaling channel.
//
// Every frame is a JSON object tagged by `kind`.  The broker only looks at
// the routing fields (`groupKey`, `target`, `peerId`); `payload` is opaque to
// it and carries a W3C-shaped session description or candidate.
//
// ────────────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Identities ─────────────────────────────────────────────────────────────

/// Broker-assigned token for one duplex channel.  Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role a connection registers under within a group.
///
/// `manager` / `employee` are accepted on the wire as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "manager")]
    Viewer,
    #[serde(alias = "employee")]
    Publisher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Publisher => "publisher",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Client → broker ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        group_key: String,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    Offer {
        group_key: String,
        peer_id: String,
        payload: serde_json::Value,
    },
    Answer {
        group_key: String,
        target: ConnectionId,
        payload: serde_json::Value,
    },
    IceCandidate {
        group_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        payload: serde_json::Value,
    },
    Disconnect {
        group_key: String,
        peer_id: String,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Disconnect { .. } => "disconnect",
        }
    }
}

// ─── Broker → client ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Offer {
        group_key: String,
        sender: ConnectionId,
        peer_id: String,
        payload: serde_json::Value,
    },
    Answer {
        group_key: String,
        sender: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        payload: serde_json::Value,
    },
    IceCandidate {
        group_key: String,
        sender: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        payload: serde_json::Value,
    },
    Disconnect {
        group_key: String,
        peer_id: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Disconnect { .. } => "disconnect",
        }
    }
}

// ─── Payload shapes (client side only) ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Matches the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// Matches the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

// ─── Tests ──────────────────────────────────────────────────────────────────
