//! Relay data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::webrtc::{IceCandidate, MediaHandle};

/// Maximum accepted stream id length
pub const MAX_STREAM_ID_LEN: usize = 128;

/// Session identifier (uuid v4, server-generated)
pub type SessionId = String;

/// Identifier of one logical broadcast
///
/// Caller-supplied ids are restricted to `[A-Za-z0-9._-]`, 1..=128 chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

impl StreamId {
    /// Validate and wrap a caller-supplied id
    pub fn parse(raw: &str) -> Result<Self, InvalidStreamId> {
        if raw.is_empty() || raw.len() > MAX_STREAM_ID_LEN {
            return Err(InvalidStreamId(raw.to_string()));
        }
        let valid = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(InvalidStreamId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Generate a fresh unique id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StreamId {
    type Error = InvalidStreamId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StreamId::parse(&value)
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

/// Rejected stream id
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid stream id {0:?}")]
pub struct InvalidStreamId(pub String);

/// Peer role within a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broadcaster,
    Consumer,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Broadcaster => Role::Consumer,
            Role::Consumer => Role::Broadcaster,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Broadcaster => write!(f, "broadcaster"),
            Role::Consumer => write!(f, "consumer"),
        }
    }
}

/// Lifecycle of a stream record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// A broadcaster negotiation has claimed the id but not published yet
    Pending,
    /// Published, consumers may attach
    Live,
    /// Broadcaster gone; kept as a tombstone until re-published or swept
    Ended,
}

/// Registry entry for one stream
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub stream_id: StreamId,
    /// Engine-level published media, set once Live
    pub media: Option<MediaHandle>,
    pub broadcaster_session_id: SessionId,
    pub state: StreamState,
    pub updated_at: DateTime<Utc>,
}

impl StreamRecord {
    pub fn is_live(&self) -> bool {
        self.state == StreamState::Live
    }
}

/// One buffered connectivity candidate
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub stream_id: StreamId,
    /// Role the candidate originated from
    pub role: Role,
    pub candidate: IceCandidate,
    /// Set when discovered by one of the relay's own engine sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_session: Option<SessionId>,
}

impl CandidateRecord {
    /// Candidate submitted by a remote client
    pub fn remote(stream_id: StreamId, role: Role, candidate: IceCandidate) -> Self {
        Self {
            stream_id,
            role,
            candidate,
            origin_session: None,
        }
    }

    /// Candidate discovered by a local engine session
    pub fn local(
        stream_id: StreamId,
        role: Role,
        candidate: IceCandidate,
        session_id: impl Into<SessionId>,
    ) -> Self {
        Self {
            stream_id,
            role,
            candidate,
            origin_session: Some(session_id.into()),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.origin_session.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_validation() {
        assert!(StreamId::parse("abc").is_ok());
        assert!(StreamId::parse("room_1.cam-2").is_ok());
        assert!(StreamId::parse("").is_err());
        assert!(StreamId::parse("has space").is_err());
        assert!(StreamId::parse("../etc").is_err());
        assert!(StreamId::parse(&"a".repeat(MAX_STREAM_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_generated_ids_are_unique_and_valid() {
        let a = StreamId::generate();
        let b = StreamId::generate();
        assert_ne!(a, b);
        assert!(StreamId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(Role::Broadcaster.opposite(), Role::Consumer);
        assert_eq!(serde_json::to_string(&Role::Consumer).unwrap(), "\"consumer\"");
        let role: Role = serde_json::from_str("\"broadcaster\"").unwrap();
        assert_eq!(role, Role::Broadcaster);
    }

    #[test]
    fn test_stream_id_deserialize_rejects_invalid() {
        let ok: Result<StreamId, _> = serde_json::from_str("\"abc\"");
        assert!(ok.is_ok());
        let bad: Result<StreamId, _> = serde_json::from_str("\"a b\"");
        assert!(bad.is_err());
    }
}
